//! Client for the remote platform's paginated JSON API.
//!
//! Every listing endpoint answers `{"next": <url or null>, "results": [...]}`;
//! the `next` URL is used verbatim as the page cursor.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tally_core::remote::{RemoteBoundary, RemoteContact, RemoteField, RemoteRun};
use tally_core::OrgId;
use tally_storage::HttpFetcher;
use tracing::debug;
use uuid::Uuid;

use crate::{Page, PageSource, RemoteBackend, RemoteFetchError, TimeWindow};

#[derive(Debug, Deserialize)]
pub struct ApiPage<T> {
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
}

impl<T> From<ApiPage<T>> for Page<T> {
    fn from(page: ApiPage<T>) -> Self {
        Page {
            records: page.results,
            next: page.next.filter(|next| !next.is_empty()),
        }
    }
}

/// Remote backend talking to one organization's workspace over HTTP.
#[derive(Debug, Clone)]
pub struct ApiBackend {
    http: Arc<HttpFetcher>,
    org: OrgId,
    base_url: String,
    token: String,
    run_id: Uuid,
}

impl ApiBackend {
    pub fn new(
        http: Arc<HttpFetcher>,
        org: OrgId,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            org,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            run_id: Uuid::new_v4(),
        }
    }

    /// Absolute URL of `endpoint` with `params`, e.g. `contacts.json?after=..`.
    pub fn endpoint_url(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<String, RemoteFetchError> {
        let raw = format!("{}/api/v2/{endpoint}", self.base_url);
        Url::parse_with_params(&raw, params)
            .map(String::from)
            .map_err(|err| RemoteFetchError::Unavailable(format!("bad url {raw}: {err}")))
    }

    fn query<T>(&self, endpoint: &str, params: Vec<(&str, String)>) -> Box<dyn PageSource<T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        Box::new(ApiQuery::<T> {
            backend: self.clone(),
            first_url: self.endpoint_url(endpoint, &params),
            _records: PhantomData,
        })
    }
}

fn window_params(window: TimeWindow) -> Vec<(&'static str, String)> {
    let mut params = Vec::with_capacity(2);
    if let Some(after) = window.after {
        params.push(("after", after.to_rfc3339()));
    }
    params.push(("before", window.before.to_rfc3339()));
    params
}

impl RemoteBackend for ApiBackend {
    fn fields(&self) -> Box<dyn PageSource<RemoteField>> {
        self.query("fields.json", Vec::new())
    }

    fn boundaries(&self) -> Box<dyn PageSource<RemoteBoundary>> {
        self.query("boundaries.json", vec![("geometry", "true".to_string())])
    }

    fn contacts_changed(&self, window: TimeWindow) -> Box<dyn PageSource<RemoteContact>> {
        self.query("contacts.json", window_params(window))
    }

    fn contacts_deleted(&self, window: TimeWindow) -> Box<dyn PageSource<RemoteContact>> {
        let mut params = vec![("deleted", "true".to_string())];
        params.extend(window_params(window));
        self.query("contacts.json", params)
    }

    fn runs(&self, flow: &str, window: TimeWindow) -> Box<dyn PageSource<RemoteRun>> {
        let mut params = vec![("flow", flow.to_string())];
        params.extend(window_params(window));
        self.query("runs.json", params)
    }
}

struct ApiQuery<T> {
    backend: ApiBackend,
    first_url: Result<String, RemoteFetchError>,
    _records: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T> PageSource<T> for ApiQuery<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    async fn fetch_page(&self, cursor: Option<String>) -> Result<Page<T>, RemoteFetchError> {
        let url = match cursor {
            Some(next) => next,
            None => match &self.first_url {
                Ok(url) => url.clone(),
                Err(err) => return Err(RemoteFetchError::Unavailable(err.to_string())),
            },
        };
        let page: ApiPage<T> = self
            .backend
            .http
            .fetch_json(
                self.backend.run_id,
                self.backend.org,
                &url,
                Some(&self.backend.token),
            )
            .await?;
        debug!(org = %self.backend.org, url = %url, records = page.results.len(), "fetched page");
        Ok(page.into())
    }
}
