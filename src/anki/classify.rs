//! Turns the ways AnkiConnect can fail into a closed set of classes.
//!
//! Transport failures never carry a response; peer errors are the `error`
//! string of a well-formed envelope. Both are reduced to [`ErrorClass`] so the
//! retry loop and the provisioner decide on a value instead of on substrings.

use std::sync::OnceLock;

use regex::Regex;

use crate::core::http::{
    FailureKind,
    TransportFailure,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth another attempt after a pause.
    Transient,
    /// The peer understood the request and refused it for a reason the caller can act on.
    Semantic(PeerErrorKind),
    /// Retrying cannot help.
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerErrorKind {
    Duplicate,
    EmptyNote,
    DeckNotFound,
    ModelNotFound,
    ModelExists,
    /// No profile open, or Anki is syncing.
    CollectionUnavailable,
    UnsupportedAction,
    Unauthorized,
    /// Network trouble relayed inside an error string.
    Interrupted,
    Other,
}

impl PeerErrorKind {
    pub fn class(self) -> ErrorClass {
        match self {
            PeerErrorKind::Interrupted => ErrorClass::Transient,
            PeerErrorKind::Unauthorized => ErrorClass::Fatal,
            kind => ErrorClass::Semantic(kind),
        }
    }
}

// Lower-case fragments of the messages AnkiConnect (and the proxies in front
// of it) are known to produce. First match wins.
const PEER_VOCABULARY: &[(&str, PeerErrorKind)] = &[
    ("it is a duplicate", PeerErrorKind::Duplicate),
    ("duplicate note", PeerErrorKind::Duplicate),
    ("it is empty", PeerErrorKind::EmptyNote),
    ("deck was not found", PeerErrorKind::DeckNotFound),
    ("model was not found", PeerErrorKind::ModelNotFound),
    ("model name already exists", PeerErrorKind::ModelExists),
    ("collection is not available", PeerErrorKind::CollectionUnavailable),
    ("unsupported action", PeerErrorKind::UnsupportedAction),
    ("valid api key must be provided", PeerErrorKind::Unauthorized),
    ("econnreset", PeerErrorKind::Interrupted),
    ("socket hang up", PeerErrorKind::Interrupted),
    ("timed out", PeerErrorKind::Interrupted),
    ("timeout", PeerErrorKind::Interrupted),
];

pub fn peer_error_kind(message: &str) -> PeerErrorKind {
    let message = message.to_lowercase();
    PEER_VOCABULARY
        .iter()
        .find(|(fragment, _)| message.contains(fragment))
        .map(|(_, kind)| *kind)
        .unwrap_or(PeerErrorKind::Other)
}

pub fn classify_peer_error(message: &str) -> ErrorClass {
    peer_error_kind(message).class()
}

pub fn classify_transport(failure: &TransportFailure) -> ErrorClass {
    match failure.kind {
        FailureKind::Refused
        | FailureKind::Reset
        | FailureKind::Timeout
        | FailureKind::Malformed
        | FailureKind::Other => ErrorClass::Transient,
        FailureKind::Status(code) if code >= 500 || code == 408 || code == 429 => {
            ErrorClass::Transient
        }
        FailureKind::Status(_) | FailureKind::Request => ErrorClass::Fatal,
    }
}

fn list_entry() -> &'static Regex {
    static ENTRY: OnceLock<Regex> = OnceLock::new();
    ENTRY.get_or_init(|| {
        Regex::new(r#"^\s*(?:None|'((?:[^'\\]|\\.)*)'|"((?:[^"\\]|\\.)*)")\s*(?:,|$)"#)
            .expect("list entry pattern is valid")
    })
}

/// Splits the error AnkiConnect returns when `addNotes` stored only part of a
/// batch: a printed list such as `['cannot create note because it is a
/// duplicate', None]`, one entry per note. `None` marks a stored note.
/// Returns `None` when `message` is not such a list.
pub fn per_note_errors(message: &str) -> Option<Vec<Option<String>>> {
    let mut rest = message.trim().strip_prefix('[')?.strip_suffix(']')?;
    let mut entries = Vec::new();

    while !rest.trim().is_empty() {
        let entry = list_entry().captures(rest)?;
        entries.push(entry.get(1).or_else(|| entry.get(2)).map(|text| unescape(text.as_str())));
        rest = &rest[entry.get(0)?.end()..];
    }

    Some(entries)
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out
}

/// Whether a peer error names one of `field_names`. AnkiConnect reports a
/// half-applied `createModel` this way, so a hit means "look again", not "failed".
pub fn mentions_any_field(message: &str, field_names: &[String]) -> bool {
    let message = message.to_lowercase();
    field_names
        .iter()
        .filter(|name| !name.trim().is_empty())
        .any(|name| message.contains(&name.to_lowercase()))
}
