pub mod config;
pub mod error;
pub mod fingerprint;
pub mod logging;

pub use config::Config;
pub use error::{Result, TrawlError};
pub use fingerprint::{request_fingerprint, stable_hash};
pub use logging::init_logging;
