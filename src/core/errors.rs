use thiserror::Error;

use crate::{
    anki::classify::PeerErrorKind,
    core::http::TransportFailure,
};

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(Box<std::io::Error>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(
        "Anki is not reachable ('{action}' gave up after {attempts} attempt(s): {cause}). \
         Open Anki and check that the AnkiConnect add-on is installed."
    )]
    PeerUnreachable { action: String, attempts: u32, cause: String },

    #[error("Request '{action}' could not be sent: {failure}")]
    Transport { action: String, failure: TransportFailure },

    #[error("Anki rejected '{action}': {message}")]
    Protocol { action: String, kind: PeerErrorKind, message: String },

    #[error("Unexpected result for '{action}': {detail}")]
    UnexpectedResponse { action: String, detail: String },

    #[error("Note type '{0}' does not exist in Anki and cannot be created")]
    TemplateUnavailable(String),

    #[error("Invalid retry policy: {0}")]
    InvalidPolicy(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    pub fn unreachable(action: &str, attempts: u32, cause: impl Into<String>) -> Self {
        BridgeError::PeerUnreachable { action: action.to_string(), attempts, cause: cause.into() }
    }

    pub fn is_peer_unreachable(&self) -> bool {
        matches!(self, BridgeError::PeerUnreachable { .. })
    }

    /// Kind of a well-formed error response, if this is one.
    pub fn peer_error_kind(&self) -> Option<PeerErrorKind> {
        match self {
            BridgeError::Protocol { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(error: std::io::Error) -> Self {
        BridgeError::Io(Box::new(error))
    }
}
