pub mod anki;
pub mod core;
pub mod persistence;

pub use crate::anki::{
    AnkiClient,
    ContentRecord,
    ImportOutcome,
    ImportRequest,
};
pub use crate::core::{
    BridgeConfig,
    BridgeError,
};
