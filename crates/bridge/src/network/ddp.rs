//! DDP message model
//!
//! Meteor's Distributed Data Protocol: JSON objects over a WebSocket, each
//! tagged by its `msg` field. Only the messages the bridge sends or acts on
//! are modelled; anything else fails to parse and is ignored by the client.

use protocol::Response;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// DDP version requested in the handshake
pub const DDP_VERSION: &str = "1";

/// Versions offered in the handshake, most preferred first
pub const SUPPORTED_VERSIONS: &[&str] = &["1", "pre2", "pre1"];

/// Publication and collection carrying the display text
pub const DISPLAY_COLLECTION: &str = "display";

/// Method receiving each clicker response
pub const VOTE_METHOD: &str = "iclicker-vote";

/// Messages sent by the bridge
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ClientMessage {
    Connect {
        version: String,
        support: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Sub {
        id: String,
        name: String,
        params: Vec<Value>,
    },
    Method {
        id: String,
        method: String,
        params: Vec<Value>,
    },
}

impl ClientMessage {
    pub fn connect(session: Option<String>) -> Self {
        ClientMessage::Connect {
            version: DDP_VERSION.to_string(),
            support: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            session,
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing these variants cannot fail: every field is a string or a JSON value
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Messages the bridge understands from the server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ServerMessage {
    Connected {
        session: String,
    },
    Failed {
        version: String,
    },
    Ping {
        #[serde(default)]
        id: Option<String>,
    },
    Pong {
        #[serde(default)]
        id: Option<String>,
    },
    Added {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Map<String, Value>,
    },
    Changed {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Map<String, Value>,
        #[serde(default)]
        cleared: Vec<String>,
    },
    Removed {
        collection: String,
        id: String,
    },
    Ready {
        subs: Vec<String>,
    },
    Nosub {
        id: String,
        #[serde(default)]
        error: Option<Value>,
    },
    Result {
        id: String,
        #[serde(default)]
        error: Option<Value>,
        #[serde(default)]
        result: Option<Value>,
    },
    Updated {
        #[serde(default)]
        methods: Vec<String>,
    },
    Error {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ServerMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Parameters of a password `login` call
///
/// The password never leaves the bridge in clear text, only its SHA-256.
pub fn password_login_params(username: &str, password: &str) -> Vec<Value> {
    let digest = hex::encode(Sha256::digest(password.as_bytes()));
    vec![json!({
        "user": { "username": username },
        "password": { "digest": digest, "algorithm": "sha-256" },
    })]
}

/// Parameters of a token `login` call
pub fn resume_login_params(token: &str) -> Vec<Value> {
    vec![json!({ "resume": token })]
}

/// Positional parameters of an `iclicker-vote` call
pub fn vote_params(response: &Response) -> Vec<Value> {
    vec![
        json!(response.clicker_id.as_str()),
        json!(response.response.to_string()),
        json!(response.click_timestamp()),
    ]
}

/// Resume token from a successful `login` result
pub fn login_token(result: &Value) -> Option<String> {
    result.get("token")?.as_str().map(str::to_string)
}

/// Render a DDP error object for logs
pub fn describe_error(error: &Value) -> String {
    let reason = error
        .get("reason")
        .or_else(|| error.get("message"))
        .and_then(Value::as_str);
    match (error.get("error"), reason) {
        (Some(code), Some(reason)) => format!("{} [{}]", reason, code),
        (None, Some(reason)) => reason.to_string(),
        _ => error.to_string(),
    }
}

/// Local copy of one collection, in the order documents were added
#[derive(Debug, Default)]
pub struct CollectionMirror {
    order: Vec<String>,
    docs: HashMap<String, Map<String, Value>>,
}

impl CollectionMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn added(&mut self, id: String, fields: Map<String, Value>) {
        if !self.docs.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.docs.insert(id, fields);
    }

    pub fn changed(&mut self, id: &str, fields: Map<String, Value>, cleared: &[String]) {
        let Some(doc) = self.docs.get_mut(id) else {
            return;
        };
        doc.extend(fields);
        for key in cleared {
            doc.remove(key);
        }
    }

    pub fn removed(&mut self, id: &str) {
        if self.docs.remove(id).is_some() {
            self.order.retain(|d| d != id);
        }
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.docs.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn first(&self) -> Option<&Map<String, Value>> {
        self.order.first().and_then(|id| self.docs.get(id))
    }

    /// The `line` field of the first document, empty when absent
    pub fn display_line(&self) -> String {
        self.first()
            .and_then(|doc| doc.get("line"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}
