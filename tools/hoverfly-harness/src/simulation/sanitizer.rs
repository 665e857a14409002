use crate::simulation::document::SimulationDocument;
use regex::Regex;
use std::sync::OnceLock;

/// Marks responses that were served from a recording rather than live.
pub const PROVENANCE_HEADER: &str = "Hoverfly-Cache-Served";
pub const PROVENANCE_VALUE: &str = "True";

const SET_COOKIE: &str = "Set-Cookie";

#[allow(clippy::expect_used)] // literal pattern, checked by the sanitizer tests
fn expires_attribute() -> &'static Regex {
    static EXPIRES: OnceLock<Regex> = OnceLock::new();
    EXPIRES.get_or_init(|| Regex::new(r"(E|e)xpires=[^;]+;*").expect("static regex"))
}

/// Strips the `Expires` attribute so replayed cookies never lapse.
pub fn strip_cookie_expiry(value: &str) -> String {
    expires_attribute().replace_all(value, "").into_owned()
}

/// Prepares freshly captured traffic for persistence.
///
/// Retained pairs keep their capture order.
pub fn sanitize<S: AsRef<str>>(
    mut document: SimulationDocument,
    hosts_to_ignore: &[S],
) -> SimulationDocument {
    let pairs = std::mem::take(&mut document.data.pairs);
    document.data.pairs = pairs
        .into_iter()
        .filter(|pair| {
            !hosts_to_ignore
                .iter()
                .any(|host| pair.destination_contains(host.as_ref()))
        })
        .map(|mut pair| {
            if let Some(cookies) = pair.response.headers.get_mut(SET_COOKIE) {
                for cookie in cookies.iter_mut() {
                    *cookie = strip_cookie_expiry(cookie);
                }
            }
            pair.response
                .headers
                .insert(PROVENANCE_HEADER.to_string(), vec![PROVENANCE_VALUE.to_string()]);
            pair
        })
        .collect();
    document
}

#[cfg(test)]
mod tests {
    use super::{sanitize, strip_cookie_expiry, PROVENANCE_HEADER};
    use crate::simulation::document::SimulationDocument;
    use crate::simulation::merger::pair_destinations;
    use serde_json::json;

    fn captured() -> SimulationDocument {
        SimulationDocument::parse(
            &json!({
                "data": {"pairs": [
                    {
                        "request": {"destination": [{"matcher": "exact", "value": "api.example.com"}]},
                        "response": {"status": 200, "body": "{}", "headers": {
                            "Set-Cookie": [
                                "session=x; Expires=Wed, 01 Jan 2025 00:00:00 GMT; Path=/",
                                "theme=dark; expires=Thu, 02 Jan 2025 00:00:00 GMT;"
                            ]
                        }}
                    },
                    {
                        "request": {"destination": [{"matcher": "exact", "value": "localhost:5000"}]},
                        "response": {"status": 200, "body": "", "headers": {}}
                    },
                    {
                        "request": {"destination": [{"matcher": "exact", "value": "cdn.example.com"}]},
                        "response": {"status": 304, "body": "", "headers": {}}
                    }
                ]},
                "meta": {"timeExported": "2024-01-01T00:00:00Z"}
            })
            .to_string(),
        )
        .expect("parse")
    }

    #[test]
    fn expires_fragment_is_removed_and_value_kept() {
        assert_eq!(
            strip_cookie_expiry("session=x; Expires=Wed, 01 Jan 2025 00:00:00 GMT;"),
            "session=x; "
        );
        assert_eq!(strip_cookie_expiry("session=x"), "session=x");
    }

    #[test]
    fn sanitize_strips_expiry_marks_provenance_and_drops_ignored_hosts() {
        let clean = sanitize(captured(), &["localhost"]);
        assert_eq!(
            pair_destinations(&clean.data.pairs),
            vec!["api.example.com", "cdn.example.com"]
        );
        let cookies = &clean.data.pairs[0].response.headers["Set-Cookie"];
        assert_eq!(cookies[0], "session=x;  Path=/");
        assert_eq!(cookies[1], "theme=dark; ");
        for pair in &clean.data.pairs {
            assert_eq!(pair.response.headers[PROVENANCE_HEADER], vec!["True"]);
        }
        assert_eq!(clean.data.pairs[1].response.extra["status"], 304);
    }

    #[test]
    fn no_ignored_hosts_keeps_every_pair() {
        let clean = sanitize::<&str>(captured(), &[]);
        assert_eq!(clean.data.pairs.len(), 3);
    }
}
