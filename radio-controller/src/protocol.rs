// Contrats MQTT entre le contrôleur et les nodes radio.
// Topics versionnés façon "{prefix}/nodes/{contrat}@v1", payloads JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opérations qu'un node sait exécuter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    GetParameters,
    SetParameters,
    ActivateRadioProgram,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::GetParameters => "get_parameters",
            Operation::SetParameters => "set_parameters",
            Operation::ActivateRadioProgram => "activate_radio_program",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topics dérivés d'un préfixe commun.
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn register(&self) -> String {
        format!("{}/nodes/register@v1", self.prefix)
    }

    pub fn exit(&self) -> String {
        format!("{}/nodes/exit@v1", self.prefix)
    }

    pub fn response(&self) -> String {
        format!("{}/nodes/response@v1", self.prefix)
    }

    pub fn command(&self, node_id: &str) -> String {
        format!("{}/nodes/command@v1/{}", self.prefix, node_id)
    }
}

// node → contrôleur
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    pub node_id: String,
    pub name: String,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExitNotice {
    pub node_id: String,
    pub name: String,
    #[serde(default)]
    pub reason: String,
}

// contrôleur → node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub request_id: String,
    pub node_id: String,
    pub operation: Operation,
    pub payload: Value,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub request_id: String,
    pub node_id: String,
    pub operation: Operation,
    pub status: ResponseStatus,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// Payload d'activation attendu par le runtime côté node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivationPayload {
    pub program_name: String,
    pub program_code: String,
    pub program_args: Vec<String>,
    pub program_type: String,
}
