pub mod api;
pub mod classify;
pub mod import;
pub mod liveness;
pub mod mapping;
pub mod provision;
pub mod retry;
pub mod status;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use api::AnkiClient;
pub use import::{
    ImportOutcome,
    ImportRequest,
};
pub use retry::RetryPolicy;
pub use status::ConnectionStatus;
pub use types::{
    ContentRecord,
    NativeNote,
    NoteTemplate,
};
