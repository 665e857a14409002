//! What traffic fixture a test asks for, and where it lives on disk.

use crate::errors::HarnessError;
use crate::runtime::Clock;
use crate::simulation::merger::{scratch_file_name, SimulationMerger, BLOCK_ALL_PATTERN};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

pub const STATIC_DIR: &str = "static";
pub const GENERATED_DIR: &str = "generated";

/// Pre-recorded fixtures that are replayed indefinitely.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StaticSimulation {
    /// File names under `<data>/static`, highest match priority first.
    pub files: Vec<String>,
    /// Domain glob patterns answered with a synthetic blocking response.
    pub block_domains: Vec<String>,
    pub capture_overrides: Option<Value>,
}

/// Fixture recorded from a live run and reused until it expires.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSimulation {
    /// File name under `<data>/generated`.
    pub file: String,
    pub max_age: Option<Duration>,
    pub capture_overrides: Option<Value>,
    /// Static fallback fixtures, merged ahead of the recording so recorded matchers win.
    pub static_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SimulationDescriptor {
    Static(StaticSimulation),
    Generated(GeneratedSimulation),
}

impl Default for SimulationDescriptor {
    fn default() -> Self {
        Self::Static(StaticSimulation::default())
    }
}

impl StaticSimulation {
    pub fn new<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn block_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.block_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn capture_overrides(mut self, arguments: Value) -> Self {
        self.capture_overrides = Some(arguments);
        self
    }
}

impl GeneratedSimulation {
    pub fn named(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            max_age: None,
            capture_overrides: None,
            static_files: Vec::new(),
        }
    }

    /// A recording with a unique, time-seeded file name.
    pub fn unnamed(clock: &dyn Clock) -> Self {
        let stamp = clock
            .now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::named(format!(
            "temp_{}.{:06}.json",
            stamp.as_secs(),
            stamp.subsec_micros()
        ))
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn capture_overrides(mut self, arguments: Value) -> Self {
        self.capture_overrides = Some(arguments);
        self
    }

    pub fn static_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.static_files = files.into_iter().map(Into::into).collect();
        self
    }
}

/// Where the proxy's simulation bytes come from once a mode is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationSource {
    File(PathBuf),
    /// Merged on demand; inputs are read only when the merge runs.
    Merge {
        inputs: Vec<PathBuf>,
        block_domains: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSimulation {
    /// File checked for freshness and written by a recording.
    pub target: PathBuf,
    /// False for scratch combinations, which are never recorded into. A
    /// recordable static target is only written while it is absent.
    pub recordable: bool,
    pub source: SimulationSource,
}

impl ResolvedSimulation {
    /// Produces the single file to import into the proxy, merging if needed.
    pub fn materialize(
        &self,
        merger: &SimulationMerger<'_>,
        worker_id: &str,
    ) -> Result<PathBuf, HarnessError> {
        match &self.source {
            SimulationSource::File(path) => Ok(path.clone()),
            SimulationSource::Merge {
                inputs,
                block_domains,
            } => merger.merge(inputs, block_domains, worker_id),
        }
    }
}

impl SimulationDescriptor {
    pub fn max_age(&self) -> Option<Duration> {
        match self {
            Self::Static(_) => None,
            Self::Generated(generated) => generated.max_age,
        }
    }

    pub fn capture_overrides(&self) -> Option<&Value> {
        match self {
            Self::Static(s) => s.capture_overrides.as_ref(),
            Self::Generated(g) => g.capture_overrides.as_ref(),
        }
    }

    /// Static fixture paths relative to the data dir, for logging.
    pub fn static_fixtures(&self) -> Vec<String> {
        let files = match self {
            Self::Static(s) => &s.files,
            Self::Generated(g) => &g.static_files,
        };
        files
            .iter()
            .map(|f| format!("{STATIC_DIR}/{f}"))
            .collect()
    }

    pub fn resolve(&self, data_dir: &Path, scratch_dir: &Path, worker_id: &str) -> ResolvedSimulation {
        match self {
            Self::Static(s) => resolve_static(s, data_dir, scratch_dir, worker_id),
            Self::Generated(g) => resolve_generated(g, data_dir),
        }
    }

    /// Resolves and materializes in one step.
    pub fn resolve_path(
        &self,
        data_dir: &Path,
        merger: &SimulationMerger<'_>,
        scratch_dir: &Path,
        worker_id: &str,
    ) -> Result<PathBuf, HarnessError> {
        self.resolve(data_dir, scratch_dir, worker_id)
            .materialize(merger, worker_id)
    }
}

fn resolve_static(
    sim: &StaticSimulation,
    data_dir: &Path,
    scratch_dir: &Path,
    worker_id: &str,
) -> ResolvedSimulation {
    let static_dir = data_dir.join(STATIC_DIR);
    if let [single] = sim.files.as_slice() {
        // a lone named fixture can be recorded once, then replayed
        let target = static_dir.join(single);
        let source = if sim.block_domains.is_empty() {
            SimulationSource::File(target.clone())
        } else {
            SimulationSource::Merge {
                inputs: vec![target.clone()],
                block_domains: sim.block_domains.clone(),
            }
        };
        return ResolvedSimulation {
            target,
            recordable: true,
            source,
        };
    }

    let inputs = sim
        .files
        .iter()
        .map(|f| static_dir.join(f))
        .collect::<Vec<_>>();
    let mut block_domains = sim.block_domains.clone();
    if inputs.is_empty() {
        block_domains.push(BLOCK_ALL_PATTERN.to_string());
    }
    ResolvedSimulation {
        target: scratch_dir.join(scratch_file_name(worker_id)),
        recordable: false,
        source: SimulationSource::Merge {
            inputs,
            block_domains,
        },
    }
}

fn resolve_generated(sim: &GeneratedSimulation, data_dir: &Path) -> ResolvedSimulation {
    let target = data_dir.join(GENERATED_DIR).join(&sim.file);
    let source = if sim.static_files.is_empty() {
        SimulationSource::File(target.clone())
    } else {
        let mut inputs = sim
            .static_files
            .iter()
            .map(|f| data_dir.join(STATIC_DIR).join(f))
            .collect::<Vec<_>>();
        inputs.push(target.clone());
        SimulationSource::Merge {
            inputs,
            block_domains: Vec::new(),
        }
    };
    ResolvedSimulation {
        target,
        recordable: true,
        source,
    }
}
