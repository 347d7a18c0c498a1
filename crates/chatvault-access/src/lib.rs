//! Visibility scope resolution and master-only account administration.

pub mod admin;
pub mod error;
pub mod resolver;
pub mod types;

pub use admin::AdminService;
pub use error::{AccessError, Result};
pub use resolver::ScopeResolver;
pub use types::{NewViewerAccount, ViewerAccountUpdate};
