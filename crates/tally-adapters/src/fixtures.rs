//! Remote backend served from JSON fixture files or in-memory data.
//!
//! A fixture directory holds `fields.json`, `boundaries.json`,
//! `contacts.json`, `deleted_contacts.json` and `runs/<flow>.json`, each a
//! JSON array of remote records. Missing files are empty collections.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::de::DeserializeOwned;
use tally_core::remote::{RemoteBoundary, RemoteContact, RemoteField, RemoteRun};

use crate::{InjectedFailure, PageSource, RemoteBackend, RemoteFetchError, StaticPages, TimeWindow};

pub const DEFAULT_PAGE_SIZE: usize = 250;

#[derive(Debug, Clone, Default)]
pub struct FixtureData {
    pub fields: Vec<RemoteField>,
    pub boundaries: Vec<RemoteBoundary>,
    pub contacts: Vec<RemoteContact>,
    pub deleted_contacts: Vec<RemoteContact>,
    pub runs: BTreeMap<String, Vec<RemoteRun>>,
}

/// Which collection an injected failure applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Stream {
    Fields,
    Boundaries,
    ContactsChanged,
    ContactsDeleted,
    Runs(String),
}

#[derive(Debug, Clone, Default)]
pub struct FixtureBackend {
    data: FixtureData,
    page_size: usize,
    failures: HashMap<Stream, (usize, InjectedFailure)>,
}

impl FixtureBackend {
    pub fn from_data(data: FixtureData) -> Self {
        Self {
            data,
            page_size: DEFAULT_PAGE_SIZE,
            failures: HashMap::new(),
        }
    }

    /// Reads every collection from `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, RemoteFetchError> {
        let dir = dir.as_ref();
        let mut runs = BTreeMap::new();
        let runs_dir = dir.join("runs");
        if runs_dir.is_dir() {
            let entries = std::fs::read_dir(&runs_dir).map_err(|err| fixture_error(&runs_dir, err))?;
            for entry in entries {
                let path = entry.map_err(|err| fixture_error(&runs_dir, err))?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(flow) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                runs.insert(flow.to_string(), read_collection(&path)?);
            }
        }

        Ok(Self::from_data(FixtureData {
            fields: read_collection(&dir.join("fields.json"))?,
            boundaries: read_collection(&dir.join("boundaries.json"))?,
            contacts: read_collection(&dir.join("contacts.json"))?,
            deleted_contacts: read_collection(&dir.join("deleted_contacts.json"))?,
            runs,
        }))
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Makes page `page` of `stream` fail on every request.
    pub fn with_failure(mut self, stream: Stream, page: usize, failure: InjectedFailure) -> Self {
        self.failures.insert(stream, (page, failure));
        self
    }

    fn pages<T>(&self, stream: Stream, records: Vec<T>) -> Box<dyn PageSource<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut pages = StaticPages::chunked(records, self.page_size);
        if let Some((page, failure)) = self.failures.get(&stream) {
            pages = pages.fail_at(*page, *failure);
        }
        Box::new(pages)
    }
}

fn fixture_error(path: &Path, err: impl std::fmt::Display) -> RemoteFetchError {
    RemoteFetchError::Fixture {
        path: path.display().to_string(),
        detail: err.to_string(),
    }
}

fn read_collection<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, RemoteFetchError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path).map_err(|err| fixture_error(path, err))?;
    serde_json::from_str(&raw).map_err(|err| fixture_error(path, err))
}

fn contacts_in(contacts: &[RemoteContact], window: TimeWindow) -> Vec<RemoteContact> {
    contacts
        .iter()
        .filter(|c| c.modified_on.is_none_or(|at| window.contains(at)))
        .cloned()
        .collect()
}

impl RemoteBackend for FixtureBackend {
    fn fields(&self) -> Box<dyn PageSource<RemoteField>> {
        self.pages(Stream::Fields, self.data.fields.clone())
    }

    fn boundaries(&self) -> Box<dyn PageSource<RemoteBoundary>> {
        self.pages(Stream::Boundaries, self.data.boundaries.clone())
    }

    fn contacts_changed(&self, window: TimeWindow) -> Box<dyn PageSource<RemoteContact>> {
        self.pages(
            Stream::ContactsChanged,
            contacts_in(&self.data.contacts, window),
        )
    }

    fn contacts_deleted(&self, window: TimeWindow) -> Box<dyn PageSource<RemoteContact>> {
        self.pages(
            Stream::ContactsDeleted,
            contacts_in(&self.data.deleted_contacts, window),
        )
    }

    fn runs(&self, flow: &str, window: TimeWindow) -> Box<dyn PageSource<RemoteRun>> {
        let runs = self
            .data
            .runs
            .get(flow)
            .map(|runs| {
                runs.iter()
                    .filter(|run| window.contains(run.modified_on))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        self.pages(Stream::Runs(flow.to_string()), runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect_all;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    #[tokio::test]
    async fn loads_fixture_directory_and_filters_by_window() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("fields.json"),
            r#"[{"key":"state","label":"State","value_type":"state"}]"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("contacts.json"),
            r#"[
                {"uuid":"C1","modified_on":"2024-01-01T10:00:00Z"},
                {"uuid":"C2","modified_on":"2024-01-03T10:00:00Z"}
            ]"#,
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("runs")).unwrap();
        std::fs::write(
            dir.path().join("runs/F1.json"),
            r#"[{"id":1,"flow":{"uuid":"F1"},"contact":{"uuid":"C1"},
                 "modified_on":"2024-01-01T12:00:00Z"}]"#,
        )
        .unwrap();

        let backend = FixtureBackend::load(dir.path()).unwrap();
        assert_eq!(collect_all(backend.fields().as_ref()).await.unwrap().len(), 1);
        assert!(collect_all(backend.boundaries().as_ref())
            .await
            .unwrap()
            .is_empty());

        let window = TimeWindow {
            after: None,
            before: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        };
        let changed = collect_all(backend.contacts_changed(window).as_ref())
            .await
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].uuid, "C1");
        assert_eq!(
            collect_all(backend.runs("F1", window).as_ref())
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(collect_all(backend.runs("F2", window).as_ref())
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn malformed_fixture_names_the_file() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("boundaries.json"), "{not json").unwrap();
        let err = FixtureBackend::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("boundaries.json"));
    }

    #[tokio::test]
    async fn injected_failures_apply_to_one_stream() {
        let backend = FixtureBackend::from_data(FixtureData {
            fields: vec![RemoteField {
                key: "born".into(),
                label: "Born".into(),
                value_type: "numeric".into(),
            }],
            ..FixtureData::default()
        })
        .with_failure(Stream::Fields, 0, InjectedFailure::Unavailable);
        assert!(collect_all(backend.fields().as_ref()).await.is_err());
        assert!(collect_all(backend.boundaries().as_ref()).await.is_ok());
    }
}
