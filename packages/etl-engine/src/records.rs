//! Record types flowing between stages
//!
//! - `RecordInfo`: combined stream element tagged with its channel
//! - `ErrorRecord` / `Alert`: side-channel payloads
//! - `JoinElement`: one input's contribution to a joined row

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A pipeline record
pub type Record = serde_json::Value;

/// Element of a stage's combined output stream, tagged with its channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordInfo {
    Output {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<String>,
        record: Record,
    },
    Error(ErrorRecord),
    Alert(Alert),
}

impl RecordInfo {
    pub fn output(record: Record) -> Self {
        RecordInfo::Output { port: None, record }
    }

    pub fn port_output(port: impl Into<String>, record: Record) -> Self {
        RecordInfo::Output {
            port: Some(port.into()),
            record,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RecordInfo::Error(_))
    }

    pub fn is_alert(&self) -> bool {
        matches!(self, RecordInfo::Alert(_))
    }

    /// Output record passing the port filter.
    ///
    /// `None` accepts every output record; `Some(port)` only records emitted on that port.
    /// Errors and alerts never pass.
    pub fn output_on(&self, filter: Option<&str>) -> Option<&Record> {
        match self {
            RecordInfo::Output { port, record } => match filter {
                None => Some(record),
                Some(wanted) if port.as_deref() == Some(wanted) => Some(record),
                Some(_) => None,
            },
            RecordInfo::Error(_) | RecordInfo::Alert(_) => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorRecord> {
        match self {
            RecordInfo::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_alert(&self) -> Option<&Alert> {
        match self {
            RecordInfo::Alert(a) => Some(a),
            _ => None,
        }
    }
}

/// A record a stage rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub record: Record,
    pub code: i32,
    pub message: String,
    /// Stage that emitted the error
    pub stage: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub stage: String,
    pub payload: BTreeMap<String, String>,
}

/// Tagged join value. `record == None` marks an input with no match for the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JoinElement {
    pub stage: String,
    pub record: Option<JoinValue>,
}

/// A joined record, ordered and hashed by its canonical JSON text so row sets compare
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "Record", into = "Record")]
pub struct JoinValue {
    record: Record,
    canonical: String,
}

impl JoinValue {
    pub fn from_record(record: &Record) -> Self {
        Self::from(record.clone())
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn into_record(self) -> Record {
        self.record
    }
}

impl From<Record> for JoinValue {
    fn from(record: Record) -> Self {
        let canonical = record.to_string();
        Self { record, canonical }
    }
}

impl From<JoinValue> for Record {
    fn from(value: JoinValue) -> Self {
        value.record
    }
}

impl PartialEq for JoinValue {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for JoinValue {}

impl std::hash::Hash for JoinValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for JoinValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for JoinValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl JoinElement {
    pub fn present(stage: impl Into<String>, record: &Record) -> Self {
        Self {
            stage: stage.into(),
            record: Some(JoinValue::from_record(record)),
        }
    }

    pub fn absent(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            record: None,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.record.is_none()
    }
}

/// One joined row: one element per input joined so far
pub type JoinRow = Vec<JoinElement>;
