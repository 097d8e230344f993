pub mod domain;
pub mod error;
pub mod tenant;

pub use domain::{DomainError, ErrorCode};
pub use error::{DbError, EngineError, Result};
pub use tenant::TenantId;
