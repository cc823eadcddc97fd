//! JSON_CONTROL extension messages

use serde::{Deserialize, Serialize};

/// Messages carried by JSON_CONTROL frames, tagged by `action`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Connection kind announced by a software proxy: 0 direct, 1 relay, 2 local
    ConnType { value: u8 },

    /// Management engine state report
    MeiState {
        #[serde(default)]
        value: serde_json::Value,
    },

    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Parse a JSON_CONTROL document
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize for a JSON_CONTROL frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
