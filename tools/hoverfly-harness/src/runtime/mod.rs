use crate::config::{HarnessConfig, ProxyConfig};
use crate::errors::HarnessError;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    /// When set, stdout and stderr are appended to this file instead of captured.
    pub log_file: Option<PathBuf>,
}

impl ProcessRequest {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            log_file: None,
        }
    }

    pub fn logging_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep_until(&self, deadline: SystemTime) -> Result<(), HarnessError>;
}

pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, HarnessError>;
    fn wait(&self, handle: u64) -> Result<ProcessOutput, HarnessError>;
    fn kill(&self, handle: u64) -> Result<(), HarnessError>;

    fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, HarnessError> {
        let handle = self.spawn(request)?;
        self.wait(handle)
    }
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, HarnessError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), HarnessError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), HarnessError>;
    fn remove_file(&self, path: &Path) -> Result<(), HarnessError>;
    fn exists(&self, path: &Path) -> bool;
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, HarnessError>;
}

/// Blocking request/response access to the proxy admin API.
///
/// Implementations must report an unreachable endpoint as
/// [`HarnessError::Connection`]; non-2xx statuses are returned as responses.
pub trait HttpTransport: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HarnessError>;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), HarnessError> {
        let now = SystemTime::now();
        if let Ok(duration) = deadline.duration_since(now) {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, HarnessError> {
        std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HarnessError::MissingSimulationFile(path.display().to_string())
            } else {
                HarnessError::Io(e.to_string())
            }
        })
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), HarnessError> {
        std::fs::write(path, contents).map_err(|e| HarnessError::Io(e.to_string()))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), HarnessError> {
        std::fs::create_dir_all(path).map_err(|e| HarnessError::Io(e.to_string()))
    }

    fn remove_file(&self, path: &Path) -> Result<(), HarnessError> {
        std::fs::remove_file(path).map_err(|e| HarnessError::Io(e.to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, HarnessError> {
        let paths = glob::glob(pattern).map_err(|e| HarnessError::Io(e.to_string()))?;
        Ok(paths.filter_map(Result::ok).collect())
    }
}

#[derive(Default)]
struct ProcessState {
    next_handle: u64,
    children: HashMap<u64, std::process::Child>,
}

pub struct ProductionProcessRunner {
    state: Mutex<ProcessState>,
}

impl ProductionProcessRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::default()),
        }
    }
}

impl Default for ProductionProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner for ProductionProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, HarnessError> {
        let mut cmd = std::process::Command::new(&request.program);
        cmd.args(&request.args);
        if let Some(log_file) = &request.log_file {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)
                .map_err(|e| HarnessError::Io(e.to_string()))?;
            let stderr = file
                .try_clone()
                .map_err(|e| HarnessError::Io(e.to_string()))?;
            cmd.stdout(file).stderr(stderr);
        } else {
            cmd.stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped());
        }

        let child = cmd
            .spawn()
            .map_err(|e| HarnessError::Process(format!("{}: {e}", request.program)))?;
        let mut state = self.state.lock().expect("process lock poisoned");
        let handle = state.next_handle;
        state.next_handle += 1;
        state.children.insert(handle, child);
        Ok(handle)
    }

    fn wait(&self, handle: u64) -> Result<ProcessOutput, HarnessError> {
        let child = {
            let mut state = self.state.lock().expect("process lock poisoned");
            state.children.remove(&handle)
        };
        let child =
            child.ok_or_else(|| HarnessError::Process(format!("unknown handle {handle}")))?;
        let output = child
            .wait_with_output()
            .map_err(|e| HarnessError::Process(e.to_string()))?;
        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn kill(&self, handle: u64) -> Result<(), HarnessError> {
        let mut child = {
            let mut state = self.state.lock().expect("process lock poisoned");
            state.children.remove(&handle)
        }
        .ok_or_else(|| HarnessError::Process(format!("unknown handle {handle}")))?;

        child
            .kill()
            .map_err(|e| HarnessError::Process(e.to_string()))?;
        // reap so the killed proxy does not linger as a zombie
        let _ = child.wait();
        Ok(())
    }
}

pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    /// Admin calls share the proxy's startup timeout.
    pub fn for_proxy(config: &ProxyConfig) -> Self {
        Self::new(config.startup_timeout())
    }
}

impl HttpTransport for UreqTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HarnessError> {
        let req = self.agent.request(request.method.as_str(), &request.url);
        let result = match &request.body {
            Some(body) => req
                .set("Content-Type", "application/json")
                .send_string(body),
            None => req.call(),
        };
        let response = match result {
            Ok(resp) => resp,
            Err(ureq::Error::Status(_, resp)) => resp,
            Err(ureq::Error::Transport(err)) => {
                return Err(HarnessError::Connection(format!(
                    "{} {}: {err}",
                    request.method.as_str(),
                    request.url
                )));
            }
        };
        let status = response.status();
        let body = response
            .into_string()
            .map_err(|e| HarnessError::Http(format!("body read failed for {}: {e}", request.url)))?;
        Ok(HttpResponse { status, body })
    }
}

pub struct HarnessRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub transport: Arc<dyn HttpTransport>,
}

impl HarnessRuntime {
    pub fn new() -> Self {
        Self::for_proxy(&HarnessConfig::default().proxy)
    }

    pub fn for_proxy(config: &ProxyConfig) -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner::new()),
            transport: Arc::new(UreqTransport::for_proxy(config)),
        }
    }
}

impl Default for HarnessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<SystemTime>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sleeps(&self) -> Vec<SystemTime> {
        self.sleeps.lock().expect("sleep lock").clone()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), HarnessError> {
        self.sleeps.lock().expect("sleep lock").push(deadline);
        *self.now.lock().expect("clock lock") = deadline;
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    fail_next: Arc<Mutex<Option<HarnessError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }

    pub fn set_fail_next(&self, error: HarnessError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    fn maybe_fail(&self) -> Result<(), HarnessError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, HarnessError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| HarnessError::MissingSimulationFile(path.display().to_string()))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), HarnessError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn create_dir_all(&self, _path: &Path) -> Result<(), HarnessError> {
        self.maybe_fail()
    }

    fn remove_file(&self, path: &Path) -> Result<(), HarnessError> {
        self.maybe_fail()?;
        self.files.lock().expect("files lock").remove(path);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, HarnessError> {
        let pattern = glob::Pattern::new(pattern).map_err(|e| HarnessError::Io(e.to_string()))?;
        let mut matched = self
            .files
            .lock()
            .expect("files lock")
            .keys()
            .filter(|path| pattern.matches_path(path))
            .cloned()
            .collect::<Vec<_>>();
        matched.sort();
        Ok(matched)
    }
}

#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    kills: Arc<Mutex<Vec<u64>>>,
    next_handle: Arc<Mutex<u64>>,
}

impl FakeProcessRunner {
    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn kills(&self) -> Vec<u64> {
        self.kills.lock().expect("kills lock").clone()
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, HarnessError> {
        self.spawned.lock().expect("spawned lock").push(request);
        let mut next = self.next_handle.lock().expect("next lock");
        let handle = *next;
        *next += 1;
        Ok(handle)
    }

    fn wait(&self, _handle: u64) -> Result<ProcessOutput, HarnessError> {
        Ok(ProcessOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn kill(&self, handle: u64) -> Result<(), HarnessError> {
        self.kills.lock().expect("kills lock").push(handle);
        Ok(())
    }
}
