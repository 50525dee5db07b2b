pub mod clock;
pub mod config;
pub mod errors;
pub mod http;

pub use config::BridgeConfig;
pub use errors::BridgeError;
