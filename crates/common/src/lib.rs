//! Shared types for the reverse-search proxy workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
