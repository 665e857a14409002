//! In-memory stand-in for a running proxy: admin API plus a traffic path.

use crate::errors::HarnessError;
use crate::proxy::journal::{JournalEntry, JournalPage, JournalRequest, JournalResponse};
use crate::runtime::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};
use crate::simulation::document::{
    FieldMatcher, PairRequest, PairResponse, RequestResponsePair, SimulationDocument,
};
use crate::simulation::sanitizer::{PROVENANCE_HEADER, PROVENANCE_VALUE};
use crate::types::ProxyMode;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedResponse {
    pub status: u16,
    pub body: String,
    pub headers: BTreeMap<String, Vec<String>>,
}

struct ProxyState {
    down: bool,
    refuse_ready_probes: usize,
    refuse_pings: usize,
    mode: ProxyMode,
    capture_arguments: Option<Value>,
    imported: Vec<RequestResponsePair>,
    captured: Vec<RequestResponsePair>,
    journal: Vec<JournalEntry>,
    reported_total: Option<usize>,
    journal_requests: Vec<(usize, usize)>,
}

impl Default for ProxyState {
    fn default() -> Self {
        Self {
            down: false,
            refuse_ready_probes: 0,
            refuse_pings: 0,
            mode: ProxyMode::Simulate,
            capture_arguments: None,
            imported: Vec::new(),
            captured: Vec::new(),
            journal: Vec::new(),
            reported_total: None,
            journal_requests: Vec::new(),
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeProxy {
    state: Arc<Mutex<ProxyState>>,
}

impl FakeProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every admin call fails with a connection error while down.
    pub fn set_down(&self, down: bool) {
        self.lock().down = down;
    }

    pub fn refuse_ready_probes(&self, count: usize) {
        self.lock().refuse_ready_probes = count;
    }

    pub fn refuse_pings(&self, count: usize) {
        self.lock().refuse_pings = count;
    }

    pub fn set_reported_journal_total(&self, total: Option<usize>) {
        self.lock().reported_total = total;
    }

    pub fn mode(&self) -> ProxyMode {
        self.lock().mode
    }

    pub fn last_capture_arguments(&self) -> Option<Value> {
        self.lock().capture_arguments.clone()
    }

    pub fn imported_pairs(&self) -> Vec<RequestResponsePair> {
        self.lock().imported.clone()
    }

    pub fn journal_requests(&self) -> Vec<(usize, usize)> {
        self.lock().journal_requests.clone()
    }

    pub fn push_journal_entry(&self, destination: &str, body: &str, cached: bool) {
        let mut headers = BTreeMap::new();
        if cached {
            headers.insert(
                PROVENANCE_HEADER.to_string(),
                vec![PROVENANCE_VALUE.to_string()],
            );
        }
        self.lock().journal.push(journal_entry(destination, 200, body, headers));
    }

    /// Sends one request through the proxy.
    ///
    /// `live` is the upstream answer, used unless the proxy serves from its
    /// simulation. Capture mode records the live exchange.
    pub fn serve(&self, destination: &str, live: ServedResponse) -> ServedResponse {
        let mut state = self.lock();
        let simulated = state
            .imported
            .iter()
            .find(|pair| matches_destination(pair, destination))
            .map(|pair| ServedResponse {
                status: pair
                    .response
                    .extra
                    .get("status")
                    .and_then(Value::as_u64)
                    .and_then(|s| u16::try_from(s).ok())
                    .unwrap_or(200),
                body: pair.response.body.clone(),
                headers: pair.response.headers.clone(),
            });

        let served = match state.mode {
            ProxyMode::Simulate => simulated.unwrap_or_else(|| ServedResponse {
                status: 502,
                body: "Hoverfly Error! Could not find a match for request".to_string(),
                headers: BTreeMap::new(),
            }),
            ProxyMode::Spy => simulated.unwrap_or_else(|| live.clone()),
            ProxyMode::Capture => {
                let pair = RequestResponsePair {
                    request: PairRequest {
                        destination: vec![FieldMatcher {
                            value: destination.to_string(),
                            extra: json_map(json!({"matcher": "exact"})),
                        }],
                        extra: Map::new(),
                    },
                    response: PairResponse {
                        headers: live.headers.clone(),
                        body: live.body.clone(),
                        extra: json_map(json!({"status": live.status})),
                    },
                    extra: Map::new(),
                };
                state.captured.push(pair);
                live
            }
        };
        let entry = journal_entry(
            destination,
            served.status,
            &served.body,
            served.headers.clone(),
        );
        state.journal.push(entry);
        served
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProxyState> {
        self.state.lock().expect("fake proxy lock")
    }

    fn route(&self, request: &HttpRequest) -> Result<HttpResponse, HarnessError> {
        let mut state = self.lock();
        let path = strip_origin(&request.url);

        if state.down {
            return Err(HarnessError::Connection(format!("{} refused", request.url)));
        }

        match (request.method, path.split('?').next().unwrap_or_default()) {
            (HttpMethod::Get, "" | "/") => {
                if state.refuse_pings > 0 {
                    state.refuse_pings -= 1;
                    return Err(HarnessError::Connection(format!("{} refused", request.url)));
                }
                Ok(ok(json!({"status": "ok"})))
            }
            (HttpMethod::Get, "/api/v2/hoverfly/mode") => {
                if state.refuse_ready_probes > 0 {
                    state.refuse_ready_probes -= 1;
                    return Err(HarnessError::Connection(format!("{} refused", request.url)));
                }
                Ok(ok(json!({"mode": state.mode.as_str()})))
            }
            (HttpMethod::Put, "/api/v2/hoverfly/mode") => {
                let body: Value = parse_body(request)?;
                let Some(mode) = body["mode"].as_str().and_then(ProxyMode::parse) else {
                    return Ok(status(422, "unknown mode"));
                };
                state.mode = mode;
                if mode == ProxyMode::Capture {
                    state.capture_arguments = body.get("arguments").cloned();
                }
                Ok(ok(json!({"mode": mode.as_str()})))
            }
            (HttpMethod::Put, "/api/v2/simulation") => {
                let text = request.body.clone().unwrap_or_default();
                match SimulationDocument::parse(&text) {
                    Ok(doc) => {
                        state.imported = doc.data.pairs;
                        Ok(ok(json!({})))
                    }
                    Err(err) => Ok(status(400, &err.to_string())),
                }
            }
            (HttpMethod::Get, "/api/v2/simulation") => {
                let mut doc = SimulationDocument::empty(Utc::now());
                doc.data.pairs = state.imported.clone();
                doc.data.pairs.extend(state.captured.iter().cloned());
                Ok(HttpResponse {
                    status: 200,
                    body: doc.to_pretty_json()?,
                })
            }
            (HttpMethod::Get, "/api/v2/journal") => {
                let (limit, offset) = journal_query(path);
                state.journal_requests.push((limit, offset));
                let page = JournalPage {
                    journal: state
                        .journal
                        .iter()
                        .skip(offset)
                        .take(limit)
                        .cloned()
                        .collect(),
                    total: state.reported_total.unwrap_or(state.journal.len()),
                    offset,
                    limit,
                };
                let body = serde_json::to_string(&page)
                    .map_err(|e| HarnessError::Http(e.to_string()))?;
                Ok(HttpResponse { status: 200, body })
            }
            (HttpMethod::Delete, "/api/v2/journal") => {
                state.journal.clear();
                Ok(ok(json!({})))
            }
            _ => Ok(status(404, "not found")),
        }
    }
}

impl HttpTransport for FakeProxy {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HarnessError> {
        self.route(request)
    }
}

impl ServedResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
        self
    }
}

fn matches_destination(pair: &RequestResponsePair, destination: &str) -> bool {
    pair.request.destination.iter().any(|matcher| {
        let pattern = glob::Pattern::new(&matcher.value);
        matcher.value == destination || pattern.is_ok_and(|p| p.matches(destination))
    })
}

fn journal_entry(
    destination: &str,
    status: u16,
    body: &str,
    headers: BTreeMap<String, Vec<String>>,
) -> JournalEntry {
    JournalEntry {
        request: JournalRequest {
            destination: destination.to_string(),
            extra: json_map(json!({"method": "GET", "path": "/", "scheme": "http"})),
        },
        response: JournalResponse {
            body: body.to_string(),
            headers,
            extra: json_map(json!({"status": status})),
        },
        extra: Map::new(),
    }
}

fn json_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn strip_origin(url: &str) -> &str {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    rest.find('/').map(|idx| &rest[idx..]).unwrap_or("")
}

fn journal_query(path: &str) -> (usize, usize) {
    let mut limit = usize::MAX;
    let mut offset = 0;
    if let Some((_, query)) = path.split_once('?') {
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("limit", value)) => limit = value.parse().unwrap_or(limit),
                Some(("offset", value)) => offset = value.parse().unwrap_or(offset),
                _ => {}
            }
        }
    }
    (limit, offset)
}

fn parse_body(request: &HttpRequest) -> Result<Value, HarnessError> {
    serde_json::from_str(request.body.as_deref().unwrap_or("{}"))
        .map_err(|e| HarnessError::Http(e.to_string()))
}

fn ok(body: Value) -> HttpResponse {
    HttpResponse {
        status: 200,
        body: body.to_string(),
    }
}

fn status(code: u16, message: &str) -> HttpResponse {
    HttpResponse {
        status: code,
        body: json!({"error": message}).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{strip_origin, FakeProxy, ServedResponse};
    use crate::types::ProxyMode;

    #[test]
    fn origin_is_stripped_from_admin_urls() {
        assert_eq!(
            strip_origin("http://localhost:8888/api/v2/journal?limit=1"),
            "/api/v2/journal?limit=1"
        );
        assert_eq!(strip_origin("http://localhost:8888"), "");
    }

    #[test]
    fn simulate_mode_without_match_is_a_proxy_error() {
        let proxy = FakeProxy::new();
        assert_eq!(proxy.mode(), ProxyMode::Simulate);
        let served = proxy.serve("google.com", ServedResponse::ok("live"));
        assert_eq!(served.status, 502);
    }
}
