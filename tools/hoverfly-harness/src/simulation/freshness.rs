use crate::logging::append_run_log;
use crate::runtime::{Clock, FileSystem};
use crate::simulation::document::SimulationDocument;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::path::Path;
use std::time::Duration;

pub const UP_TO_DATE_SKIP: &str = "Simulation up-to-date. No need to run test.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreshnessFlags {
    pub force_live: bool,
    pub refresh_expired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreshnessDecision {
    Record,
    Replay,
    SkipTest(String),
}

/// Picks record, replay or skip for the simulation at `path`.
///
/// Outside refresh runs an existing file is always replayed, whatever its age.
pub fn should_record(
    fs: &dyn FileSystem,
    clock: &dyn Clock,
    path: &Path,
    max_age: Option<Duration>,
    flags: FreshnessFlags,
) -> FreshnessDecision {
    if flags.force_live {
        log_decision(path, "record", "force_live");
        return FreshnessDecision::Record;
    }

    let Some(exported_at) = read_export_time(fs, path) else {
        log_decision(path, "record", "no usable simulation file");
        return FreshnessDecision::Record;
    };

    let now = DateTime::<Utc>::from(clock.now());
    let age = now.signed_duration_since(exported_at);
    if !flags.refresh_expired {
        log_decision(path, "replay", &format!("age {}s", age.num_seconds()));
        return FreshnessDecision::Replay;
    }

    if let Some(max_age) = max_age {
        let expired = age
            .to_std()
            .map(|age| age > max_age)
            .unwrap_or(false);
        if expired {
            log_decision(path, "record", "expired");
            return FreshnessDecision::Record;
        }
    }
    log_decision(path, "skip", "up to date");
    FreshnessDecision::SkipTest(UP_TO_DATE_SKIP.to_string())
}

fn read_export_time(fs: &dyn FileSystem, path: &Path) -> Option<DateTime<Utc>> {
    let text = fs.read_to_string(path).ok()?;
    let doc = SimulationDocument::parse(&text).ok()?;
    doc.exported_at().map(|stamp| stamp.with_timezone(&Utc))
}

fn log_decision(path: &Path, decision: &str, reason: &str) {
    append_run_log(
        "debug",
        "simulation.freshness.decided",
        json!({
            "path": path.display().to_string(),
            "decision": decision,
            "reason": reason,
        }),
    );
}
