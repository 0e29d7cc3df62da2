//! Print commands and their acknowledgements

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::timestamp_now;

/// Print job id as assigned by the server (numeric or string)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrintId {
    Number(i64),
    Text(String),
}

impl fmt::Display for PrintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrintId::Number(n) => write!(f, "{}", n),
            PrintId::Text(s) => f.write_str(s),
        }
    }
}

/// Printer options passed through untouched
pub type PrintOptions = Map<String, Value>;

/// Inbound `print_html` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintCommand {
    pub print_id: PrintId,
    pub html: String,
    #[serde(default)]
    pub options: Option<PrintOptions>,
}

impl PrintCommand {
    /// Options, or an empty map when the server sent none
    pub fn options(&self) -> PrintOptions {
        self.options.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrintStatus {
    Success,
    Failed,
}

/// Outbound `print_completed` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintAck {
    pub print_id: PrintId,
    pub status: PrintStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

impl PrintAck {
    pub fn success(print_id: PrintId) -> Self {
        Self {
            print_id,
            status: PrintStatus::Success,
            error: None,
            timestamp: timestamp_now(),
        }
    }

    pub fn failed(print_id: PrintId, error: impl Into<String>) -> Self {
        Self {
            print_id,
            status: PrintStatus::Failed,
            error: Some(error.into()),
            timestamp: timestamp_now(),
        }
    }
}
