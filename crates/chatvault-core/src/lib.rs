pub mod config;
pub mod error;
pub mod types;

pub use config::ChatvaultConfig;
pub use error::{ChatvaultError, Result};
