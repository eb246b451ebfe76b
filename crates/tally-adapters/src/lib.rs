//! Remote page sources: the platform API client, a fixture-directory backend
//! and static in-memory pages for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_core::remote::{RemoteBoundary, RemoteContact, RemoteField, RemoteRun};
use tally_storage::FetchError;
use thiserror::Error;

pub mod api;
pub mod fixtures;
pub mod geojson;

pub use api::{ApiBackend, ApiPage};
pub use fixtures::{FixtureBackend, FixtureData, Stream};
pub use geojson::{boundary_feature, load_country_boundaries, parse_country_boundaries};

/// One page of remote records. `next == None` means the stream is exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub next: Option<String>,
}

#[derive(Debug, Error)]
pub enum RemoteFetchError {
    #[error("remote platform is rate limiting requests")]
    RateLimited { retry_after: Option<Duration> },
    #[error(transparent)]
    Http(FetchError),
    #[error("invalid page cursor '{0}'")]
    InvalidCursor(String),
    #[error("fixture {path}: {detail}")]
    Fixture { path: String, detail: String },
    #[error("remote unavailable: {0}")]
    Unavailable(String),
}

impl RemoteFetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RemoteFetchError::RateLimited { .. })
    }
}

impl From<FetchError> for RemoteFetchError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::RateLimited { retry_after, .. } => {
                RemoteFetchError::RateLimited { retry_after }
            }
            other => RemoteFetchError::Http(other),
        }
    }
}

/// A lazily paginated remote collection.
#[async_trait]
pub trait PageSource<T>: Send + Sync {
    /// Fetches the page at `cursor`, or the first page when `cursor` is `None`.
    async fn fetch_page(&self, cursor: Option<String>) -> Result<Page<T>, RemoteFetchError>;
}

/// Modification-time window of an incremental pull: `after < t <= before`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub after: Option<DateTime<Utc>>,
    pub before: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.after.is_none_or(|after| at > after) && at <= self.before
    }
}

/// Every collection the sync jobs read from one organization's workspace.
pub trait RemoteBackend: Send + Sync {
    fn fields(&self) -> Box<dyn PageSource<RemoteField>>;

    fn boundaries(&self) -> Box<dyn PageSource<RemoteBoundary>>;

    fn contacts_changed(&self, window: TimeWindow) -> Box<dyn PageSource<RemoteContact>>;

    fn contacts_deleted(&self, window: TimeWindow) -> Box<dyn PageSource<RemoteContact>>;

    fn runs(&self, flow: &str, window: TimeWindow) -> Box<dyn PageSource<RemoteRun>>;
}

/// Failure raised by [`StaticPages`] when a given page is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    RateLimited,
    Unavailable,
}

impl InjectedFailure {
    fn to_error(self, page: usize) -> RemoteFetchError {
        match self {
            InjectedFailure::RateLimited => RemoteFetchError::RateLimited { retry_after: None },
            InjectedFailure::Unavailable => {
                RemoteFetchError::Unavailable(format!("injected failure at page {page}"))
            }
        }
    }
}

/// Pre-built pages served from memory; the cursor is the page index.
#[derive(Debug)]
pub struct StaticPages<T> {
    pages: Vec<Vec<T>>,
    failures: HashMap<usize, InjectedFailure>,
    fetched: Arc<AtomicUsize>,
}

impl<T: Clone + Send + Sync> StaticPages<T> {
    pub fn new(pages: Vec<Vec<T>>) -> Self {
        Self {
            pages,
            failures: HashMap::new(),
            fetched: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn single(records: Vec<T>) -> Self {
        Self::new(vec![records])
    }

    /// Splits `records` into pages of `page_size` (at least one page).
    pub fn chunked(records: Vec<T>, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        let mut pages: Vec<Vec<T>> = records
            .chunks(page_size)
            .map(<[T]>::to_vec)
            .collect();
        if pages.is_empty() {
            pages.push(Vec::new());
        }
        Self::new(pages)
    }

    /// Makes the request for page `page` (0-based) fail.
    pub fn fail_at(mut self, page: usize, failure: InjectedFailure) -> Self {
        self.failures.insert(page, failure);
        self
    }

    /// Shared counter of successfully served pages.
    pub fn fetch_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.fetched)
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> PageSource<T> for StaticPages<T> {
    async fn fetch_page(&self, cursor: Option<String>) -> Result<Page<T>, RemoteFetchError> {
        let index = match cursor {
            None => 0,
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| RemoteFetchError::InvalidCursor(cursor.clone()))?,
        };
        if let Some(failure) = self.failures.get(&index) {
            return Err(failure.to_error(index));
        }
        let records = match self.pages.get(index) {
            Some(records) => records.clone(),
            None if index == 0 => Vec::new(),
            None => return Err(RemoteFetchError::InvalidCursor(index.to_string())),
        };
        self.fetched.fetch_add(1, Ordering::SeqCst);
        let next = (index + 1 < self.pages.len()).then(|| (index + 1).to_string());
        Ok(Page { records, next })
    }
}

/// Drains every page of `source`.
pub async fn collect_all<T>(source: &dyn PageSource<T>) -> Result<Vec<T>, RemoteFetchError> {
    let mut out = Vec::new();
    let mut cursor = None;
    loop {
        let page = source.fetch_page(cursor).await?;
        out.extend(page.records);
        match page.next {
            Some(next) => cursor = Some(next),
            None => return Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_pages_follow_cursors_to_the_end() {
        let source = StaticPages::chunked(vec![1, 2, 3, 4, 5], 2);
        let counter = source.fetch_counter();
        let first = source.fetch_page(None).await.unwrap();
        assert_eq!(first.records, vec![1, 2]);
        assert_eq!(first.next.as_deref(), Some("1"));
        assert_eq!(collect_all(&source).await.unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn empty_collections_yield_one_empty_page() {
        let source: StaticPages<i32> = StaticPages::chunked(Vec::new(), 10);
        let page = source.fetch_page(None).await.unwrap();
        assert!(page.records.is_empty());
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn injected_failures_surface_on_their_page() {
        let source = StaticPages::chunked(vec![1, 2, 3], 1).fail_at(1, InjectedFailure::RateLimited);
        assert!(source.fetch_page(None).await.is_ok());
        let err = source.fetch_page(Some("1".into())).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert!(matches!(
            source.fetch_page(Some("x".into())).await,
            Err(RemoteFetchError::InvalidCursor(_))
        ));
    }

    #[test]
    fn windows_are_half_open() {
        let t0 = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let t1 = DateTime::parse_from_rfc3339("2024-01-02T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let window = TimeWindow {
            after: Some(t0),
            before: t1,
        };
        assert!(!window.contains(t0));
        assert!(window.contains(t1));
        let open = TimeWindow {
            after: None,
            before: t1,
        };
        assert!(open.contains(t0));
    }

    #[test]
    fn rate_limited_http_errors_are_recognised() {
        let err = RemoteFetchError::from(FetchError::RateLimited {
            url: "https://example.test".into(),
            retry_after: Some(Duration::from_secs(5)),
        });
        assert!(err.is_rate_limited());
        let err = RemoteFetchError::from(FetchError::HttpStatus {
            status: 500,
            url: "https://example.test".into(),
        });
        assert!(!err.is_rate_limited());
    }
}
