//! Crawl event ledger
//!
//! Append-only audit trail for one extraction run of one repository. The
//! overall health of a run is observed here, not through return values:
//! unit failures are swallowed at the fan-out level but always leave a
//! failure event behind.

use crate::error::Result;
use crate::models::CrawlEventDetail;
use crate::store::TenantStore;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

/// Handle for appending events to one crawl instance
#[derive(Clone)]
pub struct CrawlLedger {
    store: TenantStore,
    crawl_id: String,
}

impl CrawlLedger {
    /// Begin a new crawl instance with a fresh id
    pub fn begin(store: TenantStore) -> Self {
        Self {
            store,
            crawl_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn crawl_id(&self) -> &str {
        &self.crawl_id
    }

    pub async fn info(&self, namespace: &str, data: Option<serde_json::Value>) -> Result<()> {
        self.append(namespace, CrawlEventDetail::Info, data).await
    }

    pub async fn complete(&self, namespace: &str, data: Option<serde_json::Value>) -> Result<()> {
        self.append(namespace, CrawlEventDetail::Complete, data)
            .await
    }

    /// Record a unit failure with the error message and how far it got
    pub async fn failed(
        &self,
        namespace: &str,
        error: &crate::error::Error,
        page: Option<u32>,
    ) -> Result<()> {
        let data = json!({
            "error": error.to_string(),
            "page": page,
        });
        self.append(namespace, CrawlEventDetail::Failed, Some(data))
            .await
    }

    async fn append(
        &self,
        namespace: &str,
        detail: CrawlEventDetail,
        data: Option<serde_json::Value>,
    ) -> Result<()> {
        let payload = data.map(|d| d.to_string());
        let result = self
            .store
            .append_crawl_event(&self.crawl_id, namespace, detail, payload.as_deref())
            .await;
        // A broken audit trail should not take the crawl down with it.
        if let Err(e) = &result {
            warn!(crawl_id = %self.crawl_id, namespace, "Failed to append crawl event: {}", e);
        }
        result
    }
}
