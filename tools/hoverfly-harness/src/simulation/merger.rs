use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::runtime::{Clock, FileSystem};
use crate::simulation::document::{RequestResponsePair, SimulationDocument};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::path::{Path, PathBuf};

pub const SCRATCH_PREFIX: &str = "combined_temp";
pub const BLOCK_ALL_PATTERN: &str = "*";

const DOMAIN_PLACEHOLDER: &str = "<DOMAIN>";

const BLOCK_DOMAIN_TEMPLATE: &str = r#"{
    "data": {
        "pairs": [
            {
                "request": {
                    "destination": [
                        {
                            "matcher": "glob",
                            "value": "<DOMAIN>"
                        }
                    ]
                },
                "response": {
                    "status": 403,
                    "body": "Requests to <DOMAIN> are blocked in simulated tests",
                    "encodedBody": false,
                    "headers": {
                        "Content-Type": [
                            "text/plain"
                        ]
                    },
                    "templated": false
                }
            }
        ]
    },
    "meta": {
        "schemaVersion": "v5"
    }
}"#;

/// Renders the blocking template for one domain pattern.
pub fn block_domain_fragment(domain: &str) -> Result<SimulationDocument, HarnessError> {
    let escaped = serde_json::to_string(domain)
        .map_err(|e| HarnessError::SimulationFormat(e.to_string()))?;
    // strip the surrounding quotes, the template already supplies them
    let escaped = &escaped[1..escaped.len() - 1];
    SimulationDocument::parse(&BLOCK_DOMAIN_TEMPLATE.replace(DOMAIN_PLACEHOLDER, escaped))
}

pub fn scratch_file_name(worker_id: &str) -> String {
    format!("{SCRATCH_PREFIX}_{worker_id}.json")
}

pub struct SimulationMerger<'a> {
    fs: &'a dyn FileSystem,
    clock: &'a dyn Clock,
    scratch_dir: PathBuf,
}

impl<'a> SimulationMerger<'a> {
    pub fn new(fs: &'a dyn FileSystem, clock: &'a dyn Clock, scratch_dir: impl AsRef<Path>) -> Self {
        Self {
            fs,
            clock,
            scratch_dir: scratch_dir.as_ref().to_path_buf(),
        }
    }

    /// Combines `paths` in priority order, then appends one blocking pair per domain.
    ///
    /// The first document supplies `meta`; later documents contribute only
    /// their pairs. With no input paths an empty document stamped with the
    /// current time is used as the base.
    pub fn combine(
        &self,
        paths: &[PathBuf],
        domains_to_block: &[String],
    ) -> Result<SimulationDocument, HarnessError> {
        let mut combined = match paths.first() {
            Some(first) => self.load(first)?,
            None => SimulationDocument::empty(DateTime::<Utc>::from(self.clock.now())),
        };
        for path in paths.iter().skip(1) {
            let doc = self.load(path)?;
            combined.data.pairs.extend(doc.data.pairs);
        }
        for domain in domains_to_block {
            let fragment = block_domain_fragment(domain)?;
            combined.data.pairs.extend(fragment.data.pairs);
        }
        Ok(combined)
    }

    /// Writes the combined document to the worker's scratch file and returns its path.
    pub fn merge(
        &self,
        paths: &[PathBuf],
        domains_to_block: &[String],
        worker_id: &str,
    ) -> Result<PathBuf, HarnessError> {
        let combined = self.combine(paths, domains_to_block)?;
        self.fs.create_dir_all(&self.scratch_dir)?;
        let out = self.scratch_dir.join(scratch_file_name(worker_id));
        self.fs.write_string(&out, &combined.to_pretty_json()?)?;
        append_run_log(
            "info",
            "simulation.merge.completed",
            json!({
                "inputs": paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                "blocked_domains": domains_to_block,
                "pairs": combined.data.pairs.len(),
                "output": out.display().to_string(),
            }),
        );
        Ok(out)
    }

    fn load(&self, path: &Path) -> Result<SimulationDocument, HarnessError> {
        let text = self.fs.read_to_string(path)?;
        SimulationDocument::parse(&text).map_err(|e| match e {
            HarnessError::SimulationFormat(msg) => {
                HarnessError::SimulationFormat(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }
}

/// Removes every worker scratch file left in `scratch_dir`.
pub fn sweep_scratch_files(
    fs: &dyn FileSystem,
    scratch_dir: &Path,
) -> Result<Vec<PathBuf>, HarnessError> {
    let pattern = scratch_dir.join(format!("{SCRATCH_PREFIX}*.json"));
    let matches = fs.glob(&pattern.display().to_string())?;
    for path in &matches {
        fs.remove_file(path)?;
    }
    if !matches.is_empty() {
        append_run_log(
            "debug",
            "simulation.scratch.swept",
            json!({"removed": matches.len(), "dir": scratch_dir.display().to_string()}),
        );
    }
    Ok(matches)
}

pub fn pair_destinations(pairs: &[RequestResponsePair]) -> Vec<&str> {
    pairs
        .iter()
        .filter_map(|pair| pair.request.destination.first())
        .map(|matcher| matcher.value.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{block_domain_fragment, pair_destinations, sweep_scratch_files, SimulationMerger};
    use crate::errors::HarnessError;
    use crate::runtime::{FakeClock, FakeFileSystem, FileSystem};
    use serde_json::json;
    use std::path::{Path, PathBuf};

    fn doc(hosts: &[&str], exported: &str) -> String {
        let pairs = hosts
            .iter()
            .map(|host| {
                json!({
                    "request": {"destination": [{"matcher": "exact", "value": host}]},
                    "response": {"status": 200, "body": host, "headers": {}}
                })
            })
            .collect::<Vec<_>>();
        json!({"data": {"pairs": pairs}, "meta": {"timeExported": exported}}).to_string()
    }

    fn fs_with(files: &[(&str, String)]) -> FakeFileSystem {
        let fs = FakeFileSystem::default();
        for (path, text) in files {
            fs.write_string(Path::new(path), text).expect("seed");
        }
        fs
    }

    #[test]
    fn merge_concatenates_pairs_in_order_and_keeps_first_meta() {
        let fs = fs_with(&[
            ("/d/a.json", doc(&["a.com", "b.com"], "2024-01-01T00:00:00Z")),
            ("/d/b.json", doc(&["c.com", "a.com"], "2025-01-01T00:00:00Z")),
        ]);
        let clock = FakeClock::default();
        let merger = SimulationMerger::new(&fs, &clock, "/scratch");
        let out = merger
            .merge(
                &[PathBuf::from("/d/a.json"), PathBuf::from("/d/b.json")],
                &[],
                "8888",
            )
            .expect("merge");
        assert_eq!(out, PathBuf::from("/scratch/combined_temp_8888.json"));

        let merged = crate::simulation::document::SimulationDocument::parse(
            &fs.read_to_string(&out).expect("read"),
        )
        .expect("parse");
        assert_eq!(
            pair_destinations(&merged.data.pairs),
            vec!["a.com", "b.com", "c.com", "a.com"]
        );
        assert_eq!(
            merged.meta.time_exported.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn blocked_domains_append_after_real_pairs() {
        let fs = fs_with(&[("/d/a.json", doc(&["a.com"], "2024-01-01T00:00:00Z"))]);
        let clock = FakeClock::default();
        let merger = SimulationMerger::new(&fs, &clock, "/scratch");
        let merged = merger
            .combine(&[PathBuf::from("/d/a.json")], &["example.com".to_string()])
            .expect("combine");
        assert_eq!(merged.data.pairs.len(), 2);
        assert!(merged.data.pairs[1].destination_contains("example.com"));
        assert_eq!(merged.data.pairs[1].response.extra["status"], 403);
    }

    #[test]
    fn empty_input_list_yields_fresh_base() {
        let fs = FakeFileSystem::default();
        let clock = FakeClock::default();
        let merger = SimulationMerger::new(&fs, &clock, "/scratch");
        let merged = merger.combine(&[], &["*".to_string()]).expect("combine");
        assert_eq!(pair_destinations(&merged.data.pairs), vec!["*"]);
        assert_eq!(
            merged.meta.time_exported.as_deref(),
            Some("1970-01-01T00:00:00Z")
        );
    }

    #[test]
    fn missing_fragment_fails_the_merge() {
        let fs = fs_with(&[("/d/a.json", doc(&["a.com"], "2024-01-01T00:00:00Z"))]);
        let clock = FakeClock::default();
        let merger = SimulationMerger::new(&fs, &clock, "/scratch");
        let err = merger
            .merge(
                &[PathBuf::from("/d/a.json"), PathBuf::from("/d/gone.json")],
                &[],
                "w",
            )
            .expect_err("missing");
        assert!(matches!(err, HarnessError::MissingSimulationFile(p) if p.contains("gone.json")));
        assert!(!fs.exists(Path::new("/scratch/combined_temp_w.json")));
    }

    #[test]
    fn block_template_escapes_domain() {
        let fragment = block_domain_fragment("reddit.com").expect("template");
        assert_eq!(fragment.data.pairs[0].request.destination[0].value, "reddit.com");
        let odd = block_domain_fragment("we\"ird").expect("escaped");
        assert_eq!(odd.data.pairs[0].request.destination[0].value, "we\"ird");
    }

    #[test]
    fn sweep_removes_only_scratch_files() {
        let fs = fs_with(&[
            ("/s/combined_temp_8888.json", "{}".to_string()),
            ("/s/combined_temp_8889.json", "{}".to_string()),
            ("/s/static/keep.json", "{}".to_string()),
        ]);
        let removed = sweep_scratch_files(&fs, Path::new("/s")).expect("sweep");
        assert_eq!(removed.len(), 2);
        assert!(fs.exists(Path::new("/s/static/keep.json")));
    }
}
