use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::proxy::journal::TrafficJournal;
use crate::runtime::FileSystem;
use crate::simulation::document::to_pretty_json;
use crate::simulation::sanitizer::PROVENANCE_HEADER;
use crate::types::TrafficMode;
use serde_json::json;
use std::path::{Path, PathBuf};

pub const NETWORK_LOG_FILE: &str = "network.json";
pub const JOURNAL_UNAVAILABLE_MSG: &str = "Hoverfly crashed while retrieving logs";
const TRUNCATION_SUFFIX: &str = "...<truncated>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkLogOutcome {
    Written(PathBuf),
    Unavailable(PathBuf),
}

pub struct NetworkLogWriter<'a> {
    pub fs: &'a dyn FileSystem,
    pub log_dir: &'a Path,
    pub mode: TrafficMode,
    pub sensitive_hosts: &'a [String],
    pub body_limit: usize,
}

impl NetworkLogWriter<'_> {
    /// Writes `network.json`, then enforces the sensitive-host rule for replayed tests.
    ///
    /// A journal that could not be fetched is replaced with a placeholder entry
    /// and does not fail the test.
    pub fn write(
        &self,
        journal: Result<TrafficJournal, HarnessError>,
    ) -> Result<NetworkLogOutcome, HarnessError> {
        self.fs.create_dir_all(self.log_dir)?;
        let path = self.log_dir.join(NETWORK_LOG_FILE);

        let mut journal = match journal {
            Ok(journal) => journal,
            Err(err) => {
                append_run_log(
                    "warn",
                    "journal.unavailable",
                    json!({"error": err.to_string()}),
                );
                self.fs.write_string(
                    &path,
                    &json!({"msg": JOURNAL_UNAVAILABLE_MSG}).to_string(),
                )?;
                return Ok(NetworkLogOutcome::Unavailable(path));
            }
        };

        let mut leak = None;
        for entry in &mut journal.journal {
            entry.response.body = truncate_body(&entry.response.body, self.body_limit);
            if leak.is_none()
                && self.mode == TrafficMode::Replay
                && self
                    .sensitive_hosts
                    .iter()
                    .any(|host| entry.request.destination.contains(host.as_str()))
                && !entry.response.headers.contains_key(PROVENANCE_HEADER)
            {
                leak = Some(
                    serde_json::to_string(&entry.request)
                        .unwrap_or_else(|_| entry.request.destination.clone()),
                );
            }
        }

        self.fs.write_string(&path, &to_pretty_json(&journal)?)?;
        if let Some(request) = leak {
            append_run_log(
                "error",
                "network_log.sensitive_host.leaked",
                json!({"request": request}),
            );
            return Err(HarnessError::SensitiveHostLeak(request));
        }
        Ok(NetworkLogOutcome::Written(path))
    }
}

pub fn truncate_body(body: &str, limit: usize) -> String {
    match body.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}{TRUNCATION_SUFFIX}", &body[..cut]),
        None => body.to_string(),
    }
}
