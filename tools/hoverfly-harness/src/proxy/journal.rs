use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::proxy::admin::AdminClient;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub request: JournalRequest,
    pub response: JournalResponse,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JournalRequest {
    #[serde(default)]
    pub destination: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JournalResponse {
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One `GET /journal` response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JournalPage {
    #[serde(default)]
    pub journal: Vec<JournalEntry>,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: usize,
}

/// Every journal entry the proxy reported, in request order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrafficJournal {
    pub journal: Vec<JournalEntry>,
    pub total: usize,
}

/// Pages through the journal until `total` entries are held.
///
/// Stops early on an empty page or after `max_pages` requests so a proxy
/// that misreports `total` cannot stall teardown.
pub fn fetch_journal(
    client: &AdminClient<'_>,
    page_size: usize,
    max_pages: usize,
) -> Result<TrafficJournal, HarnessError> {
    let page_size = page_size.max(1);
    let mut assembled = TrafficJournal::default();
    let mut offset = 0;
    for _ in 0..max_pages.max(1) {
        let page = client.journal_page(page_size, offset)?;
        let received = page.journal.len();
        assembled.total = page.total;
        assembled.journal.extend(page.journal);
        offset += page_size;
        if received == 0 || assembled.journal.len() >= assembled.total {
            break;
        }
    }
    append_run_log(
        "debug",
        "journal.fetch.completed",
        json!({
            "admin_port": client.admin_port(),
            "entries": assembled.journal.len(),
            "total": assembled.total,
        }),
    );
    Ok(assembled)
}
