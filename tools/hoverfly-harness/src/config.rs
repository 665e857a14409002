use crate::errors::HarnessError;
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

pub type EnvMap = BTreeMap<String, String>;

pub const ENV_FORCE_LIVE: &str = "HOVERFLY_FORCE_LIVE";
pub const ENV_REFRESH_EXPIRED: &str = "HOVERFLY_REFRESH_EXPIRED";
pub const ENV_PROXY_OPTS: &str = "HOVERFLY_OPTS";
pub const ENV_WORKER: &str = "HOVERFLY_WORKER";
pub const ENV_CONFIG: &str = "HOVERFLY_HARNESS_CONFIG";

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub force_live: bool,
    pub refresh_expired: bool,
    pub proxy_extra_args: Option<String>,
    pub worker_id: Option<String>,
    pub data_dir: Option<PathBuf>,
}

impl CliOverrides {
    /// Overrides for harness users that run under `cargo test`, where flags cannot be passed.
    pub fn from_env(env: &EnvMap) -> Self {
        Self {
            config_path: env.get(ENV_CONFIG).map(PathBuf::from),
            force_live: env.get(ENV_FORCE_LIVE).is_some_and(|v| is_truthy(v)),
            refresh_expired: env.get(ENV_REFRESH_EXPIRED).is_some_and(|v| is_truthy(v)),
            proxy_extra_args: env.get(ENV_PROXY_OPTS).cloned(),
            worker_id: env
                .get(ENV_WORKER)
                .filter(|v| !v.trim().is_empty())
                .cloned(),
            data_dir: None,
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessConfig {
    pub proxy: ProxyConfig,
    pub simulations: SimulationsConfig,
    pub journal: JournalConfig,
    pub logging: LoggingConfig,
    pub hosts: HostsConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyConfig {
    pub binary: String,
    pub proxy_port: u16,
    pub admin_port: u16,
    pub extra_args: String,
    pub startup_poll_interval_ms: u64,
    pub startup_timeout_ms: u64,
    pub start_attempts: u32,
    pub stop_stale_processes: bool,
    pub stop_command: String,
}

impl ProxyConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.startup_poll_interval_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn extra_args(&self) -> Vec<String> {
        self.extra_args
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationsConfig {
    pub data_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub capture_arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalConfig {
    pub page_size: usize,
    pub max_pages: usize,
    pub body_truncate_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub run_log_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostsConfig {
    pub ignore: Vec<String>,
    pub sensitive: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RunConfig {
    pub force_live: bool,
    pub refresh_expired: bool,
    pub worker_id: Option<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig {
                binary: "hoverfly".to_string(),
                proxy_port: 8500,
                admin_port: 8888,
                extra_args: String::new(),
                startup_poll_interval_ms: 200,
                startup_timeout_ms: 5_000,
                start_attempts: 3,
                stop_stale_processes: true,
                stop_command: "hoverctl".to_string(),
            },
            simulations: SimulationsConfig {
                data_dir: PathBuf::from("test_data"),
                scratch_dir: PathBuf::from("."),
                capture_arguments: json!({"headersWhitelist": ["Cookie"]}),
            },
            journal: JournalConfig {
                page_size: 10,
                max_pages: 10_000,
                body_truncate_limit: 1000,
            },
            logging: LoggingConfig {
                log_dir: PathBuf::from("hoverfly_logs"),
                run_log_file: "harness.jsonl".to_string(),
            },
            hosts: HostsConfig {
                ignore: vec!["localhost".to_string()],
                sensitive: Vec::new(),
            },
            run: RunConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialHarnessConfig {
    proxy: Option<PartialProxyConfig>,
    simulations: Option<PartialSimulationsConfig>,
    journal: Option<PartialJournalConfig>,
    logging: Option<PartialLoggingConfig>,
    hosts: Option<PartialHostsConfig>,
    run: Option<PartialRunConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialProxyConfig {
    binary: Option<String>,
    proxy_port: Option<u16>,
    admin_port: Option<u16>,
    extra_args: Option<String>,
    startup_poll_interval_ms: Option<u64>,
    startup_timeout_ms: Option<u64>,
    start_attempts: Option<u32>,
    stop_stale_processes: Option<bool>,
    stop_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSimulationsConfig {
    data_dir: Option<PathBuf>,
    scratch_dir: Option<PathBuf>,
    capture_arguments: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialJournalConfig {
    page_size: Option<usize>,
    max_pages: Option<usize>,
    body_truncate_limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    log_dir: Option<PathBuf>,
    run_log_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialHostsConfig {
    ignore: Option<Vec<String>>,
    sensitive: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRunConfig {
    force_live: Option<bool>,
    refresh_expired: Option<bool>,
    worker_id: Option<String>,
}

pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<HarnessConfig, HarnessError> {
    let mut cfg = HarnessConfig::default();

    if let Some(path) = &overrides.config_path {
        let path = absolutize_path(process_cwd, path);
        let file_contents = fs.read_to_string(&path).map_err(|e| match e {
            HarnessError::MissingSimulationFile(p) => {
                HarnessError::ConfigParse(format!("config file not found: {p}"))
            }
            other => other,
        })?;
        let partial: PartialHarnessConfig = toml::from_str(&file_contents)
            .map_err(|e| HarnessError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);

    cfg.simulations.data_dir = absolutize_path(process_cwd, &cfg.simulations.data_dir);
    cfg.simulations.scratch_dir = absolutize_path(process_cwd, &cfg.simulations.scratch_dir);
    cfg.logging.log_dir = absolutize_path(process_cwd, &cfg.logging.log_dir);

    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut HarnessConfig, partial: PartialHarnessConfig) {
    if let Some(proxy) = partial.proxy {
        if let Some(value) = proxy.binary {
            cfg.proxy.binary = value;
        }
        if let Some(value) = proxy.proxy_port {
            cfg.proxy.proxy_port = value;
        }
        if let Some(value) = proxy.admin_port {
            cfg.proxy.admin_port = value;
        }
        if let Some(value) = proxy.extra_args {
            cfg.proxy.extra_args = value;
        }
        if let Some(value) = proxy.startup_poll_interval_ms {
            cfg.proxy.startup_poll_interval_ms = value;
        }
        if let Some(value) = proxy.startup_timeout_ms {
            cfg.proxy.startup_timeout_ms = value;
        }
        if let Some(value) = proxy.start_attempts {
            cfg.proxy.start_attempts = value;
        }
        if let Some(value) = proxy.stop_stale_processes {
            cfg.proxy.stop_stale_processes = value;
        }
        if let Some(value) = proxy.stop_command {
            cfg.proxy.stop_command = value;
        }
    }

    if let Some(simulations) = partial.simulations {
        if let Some(value) = simulations.data_dir {
            cfg.simulations.data_dir = value;
        }
        if let Some(value) = simulations.scratch_dir {
            cfg.simulations.scratch_dir = value;
        }
        if let Some(value) = simulations.capture_arguments {
            cfg.simulations.capture_arguments = value;
        }
    }

    if let Some(journal) = partial.journal {
        if let Some(value) = journal.page_size {
            cfg.journal.page_size = value;
        }
        if let Some(value) = journal.max_pages {
            cfg.journal.max_pages = value;
        }
        if let Some(value) = journal.body_truncate_limit {
            cfg.journal.body_truncate_limit = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.log_dir {
            cfg.logging.log_dir = value;
        }
        if let Some(value) = logging.run_log_file {
            cfg.logging.run_log_file = value;
        }
    }

    if let Some(hosts) = partial.hosts {
        if let Some(value) = hosts.ignore {
            cfg.hosts.ignore = value;
        }
        if let Some(value) = hosts.sensitive {
            cfg.hosts.sensitive = value;
        }
    }

    if let Some(run) = partial.run {
        if let Some(value) = run.force_live {
            cfg.run.force_live = value;
        }
        if let Some(value) = run.refresh_expired {
            cfg.run.refresh_expired = value;
        }
        if let Some(value) = run.worker_id {
            cfg.run.worker_id = Some(value);
        }
    }
}

fn apply_cli_overrides(cfg: &mut HarnessConfig, overrides: &CliOverrides) {
    if overrides.force_live {
        cfg.run.force_live = true;
    }
    if overrides.refresh_expired {
        cfg.run.refresh_expired = true;
    }
    if let Some(extra) = &overrides.proxy_extra_args {
        cfg.proxy.extra_args = extra.clone();
    }
    if let Some(worker_id) = &overrides.worker_id {
        cfg.run.worker_id = Some(worker_id.clone());
    }
    if let Some(data_dir) = &overrides.data_dir {
        cfg.simulations.data_dir = data_dir.clone();
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        return value.to_path_buf();
    }
    let relative = value
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect::<PathBuf>();
    if relative.as_os_str().is_empty() {
        base.to_path_buf()
    } else {
        base.join(relative)
    }
}

fn validate_config(cfg: &HarnessConfig) -> Result<(), HarnessError> {
    if cfg.proxy.binary.trim().is_empty() {
        return Err(HarnessError::InvalidConfig(
            "proxy.binary must not be empty".to_string(),
        ));
    }
    if cfg.proxy.proxy_port == 0 || cfg.proxy.admin_port == 0 {
        return Err(HarnessError::InvalidConfig(
            "proxy ports must be greater than zero".to_string(),
        ));
    }
    if cfg.proxy.proxy_port == cfg.proxy.admin_port {
        return Err(HarnessError::InvalidConfig(
            "proxy.proxy_port and proxy.admin_port must differ".to_string(),
        ));
    }
    if cfg.proxy.start_attempts == 0 {
        return Err(HarnessError::InvalidConfig(
            "proxy.start_attempts must be at least 1".to_string(),
        ));
    }
    if cfg.proxy.startup_poll_interval_ms == 0
        || cfg.proxy.startup_poll_interval_ms >= cfg.proxy.startup_timeout_ms
    {
        return Err(HarnessError::InvalidConfig(
            "proxy.startup_poll_interval_ms must be non-zero and below startup_timeout_ms"
                .to_string(),
        ));
    }
    if cfg.journal.page_size == 0 || cfg.journal.max_pages == 0 {
        return Err(HarnessError::InvalidConfig(
            "journal.page_size and journal.max_pages must be greater than zero".to_string(),
        ));
    }
    if !cfg.simulations.capture_arguments.is_object() {
        return Err(HarnessError::InvalidConfig(
            "simulations.capture_arguments must be a table".to_string(),
        ));
    }
    Ok(())
}
