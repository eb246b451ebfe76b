//! Runtime configuration: environment settings and the `orgs.yaml` registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tally_adapters::{ApiBackend, FixtureBackend, RemoteBackend};
use tally_core::OrgId;
use tally_storage::{HttpClientConfig, HttpFetcher, TokenBucketConfig};

pub const DEFAULT_MAX_RUNS_PER_PULL: usize = 100_000;

/// Lease TTLs per job tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTiers {
    /// An organization's contact pull and counter rebuild. Covers a first
    /// full sync of a large workspace.
    pub contact_pull: Duration,
    /// Bulk results ingestion for one poll.
    pub results: Duration,
    /// Jobs without an organization, such as counter squashing.
    pub global: Duration,
}

impl Default for LockTiers {
    fn default() -> Self {
        Self {
            contact_pull: Duration::from_secs(12 * 60 * 60),
            results: Duration::from_secs(2 * 60 * 60),
            global: Duration::from_secs(12 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub scheduler_enabled: bool,
    pub contacts_cron: String,
    pub results_cron: String,
    pub squash_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub web_port: u16,
    pub lock_tiers: LockTiers,
    pub max_runs_per_pull: usize,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            workspace_root: PathBuf::from("."),
            scheduler_enabled: false,
            contacts_cron: "*/30 * * * *".to_string(),
            results_cron: "*/15 * * * *".to_string(),
            squash_cron: "0 * * * *".to_string(),
            user_agent: concat!("tally/", env!("CARGO_PKG_VERSION")).to_string(),
            http_timeout_secs: 30,
            web_port: 8000,
            lock_tiers: LockTiers::default(),
            max_runs_per_pull: DEFAULT_MAX_RUNS_PER_PULL,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            workspace_root: std::env::var("TALLY_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            scheduler_enabled: env_flag("TALLY_SCHEDULER_ENABLED"),
            contacts_cron: std::env::var("TALLY_CONTACTS_CRON").unwrap_or(defaults.contacts_cron),
            results_cron: std::env::var("TALLY_RESULTS_CRON").unwrap_or(defaults.results_cron),
            squash_cron: std::env::var("TALLY_SQUASH_CRON").unwrap_or(defaults.squash_cron),
            user_agent: std::env::var("TALLY_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parsed("TALLY_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            web_port: env_parsed("TALLY_WEB_PORT", defaults.web_port),
            lock_tiers: defaults.lock_tiers,
            max_runs_per_pull: defaults.max_runs_per_pull,
        }
    }

    pub fn orgs_path(&self) -> PathBuf {
        self.workspace_root.join("orgs.yaml")
    }

    /// GeoJSON country boundaries used by global organizations.
    pub fn countries_path(&self) -> PathBuf {
        self.workspace_root.join("geojson/countries.json")
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: Some(TokenBucketConfig {
                capacity: 10,
                refill_every: Duration::from_millis(500),
            }),
            ..Default::default()
        }
    }
}

/// Contact-field labels an organization uses for reporter demographics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContactLabels {
    pub state: Option<String>,
    pub district: Option<String>,
    pub ward: Option<String>,
    pub gender: Option<String>,
    pub born: Option<String>,
    pub occupation: Option<String>,
    pub registration: Option<String>,
    pub female: Option<String>,
    pub male: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PollConfig {
    /// Remote flow id the poll's runs belong to.
    pub flow: String,
    /// Question ids to ingest; empty means every question.
    #[serde(default)]
    pub questions: Vec<String>,
}

impl PollConfig {
    pub fn tracks(&self, question: &str) -> bool {
        self.questions.is_empty() || self.questions.iter().any(|q| q == question)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Api {
        base_url: String,
        #[serde(default)]
        token: Option<String>,
        /// Environment variable holding the token; preferred over `token`.
        #[serde(default)]
        token_env: Option<String>,
    },
    Fixtures {
        dir: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrgConfig {
    pub id: OrgId,
    pub name: String,
    pub backend: BackendConfig,
    #[serde(default)]
    pub is_global: bool,
    #[serde(default)]
    pub reporter_group: String,
    #[serde(default)]
    pub labels: ContactLabels,
    #[serde(default)]
    pub polls: Vec<PollConfig>,
}

impl OrgConfig {
    /// Builds the remote backend; relative fixture dirs resolve against `root`.
    pub fn remote_backend(
        &self,
        http: &Arc<HttpFetcher>,
        root: &Path,
    ) -> Result<Arc<dyn RemoteBackend>> {
        match &self.backend {
            BackendConfig::Api {
                base_url,
                token,
                token_env,
            } => {
                let token = match token_env {
                    Some(var) => std::env::var(var)
                        .with_context(|| format!("reading API token from {var} for org {}", self.id))?,
                    None => match token {
                        Some(token) => token.clone(),
                        None => bail!("org {} has no API token configured", self.id),
                    },
                };
                Ok(Arc::new(ApiBackend::new(
                    Arc::clone(http),
                    self.id,
                    base_url.clone(),
                    token,
                )))
            }
            BackendConfig::Fixtures { dir } => {
                let dir = if dir.is_absolute() {
                    dir.clone()
                } else {
                    root.join(dir)
                };
                let backend = FixtureBackend::load(&dir)
                    .with_context(|| format!("loading fixtures for org {}", self.id))?;
                Ok(Arc::new(backend))
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrgRegistry {
    pub orgs: Vec<OrgConfig>,
}

impl OrgRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        let registry: OrgRegistry = serde_yaml::from_str(text).context("parsing org registry")?;
        let mut ids: Vec<OrgId> = registry.orgs.iter().map(|o| o.id).collect();
        ids.sort();
        if let Some(pair) = ids.windows(2).find(|pair| pair[0] == pair[1]) {
            bail!("org {} is listed twice", pair[0]);
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn get(&self, id: OrgId) -> Option<&OrgConfig> {
        self.orgs.iter().find(|o| o.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
orgs:
  - id: 1
    name: Rwanda
    backend:
      kind: api
      base_url: https://rapidpro.example
      token: abc
    reporter_group: U-Reporters
    labels:
      state: Province
      gender: Gender
      female: Female
      male: Male
    polls:
      - flow: F1
        questions: [Q1, Q2]
      - flow: F2
  - id: 2
    name: Global
    is_global: true
    backend:
      kind: fixtures
      dir: fixtures/global
"#;

    #[test]
    fn registry_parses_backends_labels_and_polls() {
        let registry = OrgRegistry::parse(REGISTRY).unwrap();
        assert_eq!(registry.orgs.len(), 2);
        let rwanda = registry.get(OrgId(1)).unwrap();
        assert_eq!(rwanda.labels.state.as_deref(), Some("Province"));
        assert_eq!(rwanda.labels.ward, None);
        assert!(rwanda.polls[0].tracks("Q2"));
        assert!(!rwanda.polls[0].tracks("Q3"));
        assert!(rwanda.polls[1].tracks("anything"));

        let global = registry.get(OrgId(2)).unwrap();
        assert!(global.is_global);
        assert_eq!(
            global.backend,
            BackendConfig::Fixtures {
                dir: PathBuf::from("fixtures/global")
            }
        );
    }

    #[test]
    fn duplicate_org_ids_are_rejected() {
        let text = r#"
orgs:
  - {id: 1, name: A, backend: {kind: fixtures, dir: a}}
  - {id: 1, name: B, backend: {kind: fixtures, dir: b}}
"#;
        assert!(OrgRegistry::parse(text).is_err());
    }

    #[test]
    fn lock_tiers_default_to_documented_ttls() {
        let tiers = LockTiers::default();
        assert_eq!(tiers.contact_pull, Duration::from_secs(43200));
        assert_eq!(tiers.results, Duration::from_secs(7200));
        assert_eq!(tiers.global, Duration::from_secs(43200));
    }

    #[test]
    fn api_backends_require_a_token() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let org = OrgConfig {
            id: OrgId(3),
            name: "No token".into(),
            backend: BackendConfig::Api {
                base_url: "https://rapidpro.example".into(),
                token: None,
                token_env: None,
            },
            is_global: false,
            reporter_group: String::new(),
            labels: ContactLabels::default(),
            polls: Vec::new(),
        };
        assert!(org.remote_backend(&http, Path::new(".")).is_err());
    }
}
