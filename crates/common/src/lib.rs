//! Configuration errors and API key redaction for the speech gateway workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
