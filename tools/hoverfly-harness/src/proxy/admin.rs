use crate::errors::HarnessError;
use crate::proxy::journal::JournalPage;
use crate::runtime::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};
use crate::simulation::document::SimulationDocument;
use crate::types::ProxyMode;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
struct ModeView {
    mode: String,
}

/// Thin client for the proxy's `/api/v2` control surface.
pub struct AdminClient<'a> {
    transport: &'a dyn HttpTransport,
    admin_port: u16,
}

impl<'a> AdminClient<'a> {
    pub fn new(transport: &'a dyn HttpTransport, admin_port: u16) -> Self {
        Self {
            transport,
            admin_port,
        }
    }

    pub fn admin_port(&self) -> u16 {
        self.admin_port
    }

    pub fn root_url(&self) -> String {
        format!("http://localhost:{}", self.admin_port)
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}/api/v2{path}", self.root_url())
    }

    /// `Ok(false)` while the admin port refuses connections.
    pub fn is_ready(&self) -> Result<bool, HarnessError> {
        match self.send(HttpMethod::Get, self.api_url("/hoverfly/mode"), None) {
            Ok(response) => Ok(response.status == 200),
            Err(err) if err.is_connection() => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn mode(&self) -> Result<Option<ProxyMode>, HarnessError> {
        let response = self.expect_ok(HttpMethod::Get, "/hoverfly/mode", None)?;
        let view: ModeView = serde_json::from_str(&response.body)
            .map_err(|e| HarnessError::Http(format!("mode response: {e}")))?;
        Ok(ProxyMode::parse(&view.mode))
    }

    pub fn set_mode(&self, mode: ProxyMode, arguments: Option<&Value>) -> Result<(), HarnessError> {
        let mut body = json!({"mode": mode.as_str()});
        if let Some(arguments) = arguments {
            body["arguments"] = arguments.clone();
        }
        self.expect_ok(HttpMethod::Put, "/hoverfly/mode", Some(body.to_string()))?;
        Ok(())
    }

    pub fn import_simulation(&self, document: &str) -> Result<(), HarnessError> {
        self.expect_ok(HttpMethod::Put, "/simulation", Some(document.to_string()))?;
        Ok(())
    }

    pub fn export_simulation(&self) -> Result<SimulationDocument, HarnessError> {
        let response = self.expect_ok(HttpMethod::Get, "/simulation", None)?;
        SimulationDocument::parse(&response.body)
    }

    pub fn journal_page(&self, limit: usize, offset: usize) -> Result<JournalPage, HarnessError> {
        let path = format!("/journal?limit={limit}&offset={offset}");
        let response = self.expect_ok(HttpMethod::Get, &path, None)?;
        serde_json::from_str(&response.body)
            .map_err(|e| HarnessError::Http(format!("journal response: {e}")))
    }

    pub fn clear_journal(&self) -> Result<(), HarnessError> {
        self.expect_ok(HttpMethod::Delete, "/journal", None)?;
        Ok(())
    }

    /// Liveness probe against the admin root; any HTTP answer counts as alive.
    pub fn ping(&self) -> Result<(), HarnessError> {
        self.send(HttpMethod::Get, self.root_url(), None).map(|_| ())
    }

    fn expect_ok(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<String>,
    ) -> Result<HttpResponse, HarnessError> {
        let url = self.api_url(path);
        let response = self.send(method, url.clone(), body)?;
        if !(200..300).contains(&response.status) {
            return Err(HarnessError::Http(format!(
                "{} {url} returned {}: {}",
                method.as_str(),
                response.status,
                response.body
            )));
        }
        Ok(response)
    }

    fn send(
        &self,
        method: HttpMethod,
        url: String,
        body: Option<String>,
    ) -> Result<HttpResponse, HarnessError> {
        self.transport.send(&HttpRequest { method, url, body })
    }
}
