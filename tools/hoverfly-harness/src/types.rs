use serde::{Deserialize, Serialize};

/// Live modes understood by the proxy's `/hoverfly/mode` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    Spy,
    Capture,
    Simulate,
}

impl ProxyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spy => "spy",
            Self::Capture => "capture",
            Self::Simulate => "simulate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "spy" => Some(Self::Spy),
            "capture" => Some(Self::Capture),
            "simulate" => Some(Self::Simulate),
            _ => None,
        }
    }
}

/// What a test does with traffic for its duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficMode {
    Record,
    Replay,
}

impl TrafficMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Replay => "replay",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Ready,
    Spying,
    Recording,
    Replaying,
    Stopped,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Spying => "spying",
            Self::Recording => "recording",
            Self::Replaying => "replaying",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPorts {
    pub proxy_port: u16,
    pub admin_port: u16,
    pub worker_label: String,
}

impl WorkerPorts {
    /// Offsets both base ports by the trailing digits of `worker_id` (`gw3` -> 3).
    pub fn for_worker(base_proxy: u16, base_admin: u16, worker_id: Option<&str>) -> Self {
        let increment = worker_id.map(worker_index).unwrap_or(0);
        Self {
            proxy_port: base_proxy.saturating_add(increment),
            admin_port: base_admin.saturating_add(increment),
            worker_label: worker_id.unwrap_or("main").to_string(),
        }
    }

    pub fn is_parallel_worker(&self) -> bool {
        self.worker_label != "main"
    }
}

fn worker_index(worker_id: &str) -> u16 {
    let digits = worker_id
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>();
    digits
        .into_iter()
        .rev()
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{ProxyMode, WorkerPorts};

    #[test]
    fn worker_ports_offset_by_trailing_index() {
        let main = WorkerPorts::for_worker(8500, 8888, None);
        assert_eq!((main.proxy_port, main.admin_port), (8500, 8888));
        assert!(!main.is_parallel_worker());

        let gw3 = WorkerPorts::for_worker(8500, 8888, Some("gw3"));
        assert_eq!((gw3.proxy_port, gw3.admin_port), (8503, 8891));
        assert_eq!(gw3.worker_label, "gw3");

        let gw12 = WorkerPorts::for_worker(8500, 8888, Some("gw12"));
        assert_eq!(gw12.admin_port, 8900);

        let named = WorkerPorts::for_worker(8500, 8888, Some("ci"));
        assert_eq!(named.admin_port, 8888);
        assert!(named.is_parallel_worker());
    }

    #[test]
    fn proxy_mode_round_trips_wire_names() {
        for mode in [ProxyMode::Spy, ProxyMode::Capture, ProxyMode::Simulate] {
            assert_eq!(ProxyMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(ProxyMode::parse("modify"), None);
    }
}
