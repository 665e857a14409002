use crate::errors::HarnessError;
use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: 4096,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), HarnessError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| HarnessError::Io(e.to_string()))?;
        }
        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncated,
        })
        .map_err(|e| HarnessError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| HarnessError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| HarnessError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| HarnessError::Io(e.to_string()))?;
        Ok(())
    }
}

thread_local! {
    static RUN_LOGGER: RefCell<Option<JsonlLogger>> = const { RefCell::new(None) };
}

/// Restores the previously scoped run logger when dropped.
#[must_use = "the run logger is only routed while the scope is alive"]
pub struct RunLogScope {
    previous: Option<JsonlLogger>,
}

/// Routes `append_run_log` calls on this thread to `logger` until the
/// returned scope is dropped. Scopes nest.
pub fn scoped_run_logger(logger: JsonlLogger) -> RunLogScope {
    let previous = RUN_LOGGER.with(|slot| slot.replace(Some(logger)));
    RunLogScope { previous }
}

impl Drop for RunLogScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        RUN_LOGGER.with(|slot| {
            *slot.borrow_mut() = previous;
        });
    }
}

/// Append one structured event to the run log. No-op outside a `scoped_run_logger` scope.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let logger = RUN_LOGGER.with(|slot| slot.borrow().clone());
    if let Some(logger) = logger {
        let _ = logger.append(&LogEvent {
            level,
            event_type,
            payload,
        });
    }
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}

#[cfg(test)]
mod tests {
    use super::{append_run_log, scoped_run_logger, JsonlLogger, LogEvent};
    use serde_json::json;

    #[test]
    fn logger_truncates_large_payloads_and_writes_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.jsonl");
        let mut logger = JsonlLogger::new(&path);
        logger.max_payload_bytes = 20;

        logger
            .append(&LogEvent {
                level: "info",
                event_type: "proxy.start.attempt",
                payload: json!({"text": "abcdefghijklmnopqrstuvwxyz"}),
            })
            .expect("append");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"event_type\":\"proxy.start.attempt\""));
        assert!(text.contains("..."));
    }

    #[test]
    fn small_payloads_are_kept_verbatim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/run.jsonl");
        let logger = JsonlLogger::new(&path);
        logger
            .append(&LogEvent {
                level: "debug",
                event_type: "simulation.freshness",
                payload: json!({"decision": "replay"}),
            })
            .expect("append");
        let text = std::fs::read_to_string(&path).expect("read");
        let line: serde_json::Value = serde_json::from_str(text.trim()).expect("json");
        assert_eq!(line["payload"]["decision"], "replay");
    }

    #[test]
    fn scoped_loggers_nest_and_stay_on_their_thread() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outer_path = dir.path().join("outer.jsonl");
        let inner_path = dir.path().join("inner.jsonl");
        let thread_path = dir.path().join("thread.jsonl");

        append_run_log("info", "dropped.before.scope", json!({}));
        {
            let _outer = scoped_run_logger(JsonlLogger::new(&outer_path));
            append_run_log("info", "outer.first", json!({}));
            {
                let _inner = scoped_run_logger(JsonlLogger::new(&inner_path));
                let thread_logger = JsonlLogger::new(&thread_path);
                std::thread::spawn(move || {
                    let _scope = scoped_run_logger(thread_logger);
                    append_run_log("info", "other.thread", json!({}));
                })
                .join()
                .expect("join");
                append_run_log("info", "inner.only", json!({}));
            }
            append_run_log("info", "outer.second", json!({}));
        }
        append_run_log("info", "dropped.after.scope", json!({}));

        let outer = std::fs::read_to_string(&outer_path).expect("outer");
        assert_eq!(outer.lines().count(), 2);
        assert!(outer.contains("outer.first") && outer.contains("outer.second"));
        let inner = std::fs::read_to_string(&inner_path).expect("inner");
        assert_eq!(inner.lines().count(), 1);
        assert!(inner.contains("inner.only"));
        let thread = std::fs::read_to_string(&thread_path).expect("thread");
        assert_eq!(thread.lines().count(), 1);
        assert!(thread.contains("other.thread"));
    }
}
