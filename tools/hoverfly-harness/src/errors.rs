use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("simulation format error: {0}")]
    SimulationFormat(String),
    #[error("simulation file not found: {0}")]
    MissingSimulationFile(String),
    #[error("hoverfly did not start: {0}")]
    StartupTimeout(String),
    #[error("Hoverfly crashed: {0}")]
    ProxyCrashed(String),
    #[error("Warning: sensitive URL is being hit in a simulated test: {0}")]
    SensitiveHostLeak(String),
    #[error("journal unavailable: {0}")]
    JournalUnavailable(String),
    #[error("illegal session transition: {0}")]
    IllegalTransition(String),
}

impl HarnessError {
    /// True when the admin port could not be reached at all.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::HarnessError;

    #[test]
    fn only_connection_errors_classify_as_connection() {
        assert!(HarnessError::Connection("refused".to_string()).is_connection());
        assert!(!HarnessError::Http("500".to_string()).is_connection());
        assert!(!HarnessError::ProxyCrashed("gone".to_string()).is_connection());
    }

    #[test]
    fn crash_error_message_is_distinct() {
        let text = HarnessError::ProxyCrashed("admin port 8888".to_string()).to_string();
        assert!(text.starts_with("Hoverfly crashed"));
    }
}
