//! Typed view of the proxy's simulation JSON.
//!
//! Only the fields the harness reads or rewrites are modelled; everything
//! else is carried through `extra` maps so an import/export cycle never drops
//! matcher or response details the proxy relies on.

use crate::errors::HarnessError;
use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationDocument {
    #[serde(default)]
    pub data: SimulationData,
    #[serde(default)]
    pub meta: SimulationMeta,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SimulationData {
    #[serde(default)]
    pub pairs: Vec<RequestResponsePair>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SimulationMeta {
    #[serde(
        rename = "timeExported",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub time_exported: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestResponsePair {
    pub request: PairRequest,
    pub response: PairResponse,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PairRequest {
    #[serde(default)]
    pub destination: Vec<FieldMatcher>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMatcher {
    pub value: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PairResponse {
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub body: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RequestResponsePair {
    /// True when any destination matcher value contains `host`.
    pub fn destination_contains(&self, host: &str) -> bool {
        self.request
            .destination
            .iter()
            .any(|matcher| matcher.value.contains(host))
    }
}

impl SimulationDocument {
    pub fn empty(exported_at: DateTime<Utc>) -> Self {
        Self {
            data: SimulationData::default(),
            meta: SimulationMeta {
                time_exported: Some(exported_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
                extra: Map::new(),
            },
            extra: Map::new(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, HarnessError> {
        serde_json::from_str(text).map_err(|e| HarnessError::SimulationFormat(e.to_string()))
    }

    /// Pretty JSON with four-space indentation, stable for version control diffs.
    pub fn to_pretty_json(&self) -> Result<String, HarnessError> {
        to_pretty_json(self)
    }

    pub fn exported_at(&self) -> Option<DateTime<FixedOffset>> {
        self.meta.time_exported.as_deref().and_then(parse_timestamp)
    }
}

pub fn to_pretty_json<T: Serialize>(value: &T) -> Result<String, HarnessError> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value
        .serialize(&mut serializer)
        .map_err(|e| HarnessError::SimulationFormat(e.to_string()))?;
    String::from_utf8(buf).map_err(|e| HarnessError::SimulationFormat(e.to_string()))
}

/// Accepts RFC 3339 stamps and the offset-less form some proxy builds emit (read as UTC).
pub fn parse_timestamp(value: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed);
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().fixed_offset())
}
