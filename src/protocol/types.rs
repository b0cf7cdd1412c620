//! Wire Messages
//!
//! The storage node speaks three operations. Requests and responses
//! are JSON objects discriminated by a tag field, so the wire format
//! stays self-describing and debuggable with a packet dump.

use serde::{Deserialize, Serialize};

/// A request to a storage node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Request {
    Set { key: String, value: String },
    Get { key: String },
    Del { key: String },
}

impl Request {
    /// The key this request addresses. Every operation has one.
    pub fn key(&self) -> &str {
        match self {
            Request::Set { key, .. } | Request::Get { key } | Request::Del { key } => key,
        }
    }
}

/// A storage node's reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "lowercase")]
pub enum Response {
    Set { success: bool },
    Get { value: String, found: bool },
    Del { success: bool },
    /// Internal faults and rejected input come back typed, never as a
    /// dropped connection.
    Error { message: String },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }

    pub fn not_found() -> Self {
        Response::Get {
            value: String::new(),
            found: false,
        }
    }
}
