//! Centralized error handling for the director
//!
//! # Error Categories
//!
//! - **Configuration Errors**: missing or dangling resources, invalid values
//! - **Catalog Errors**: connection and record failures of the catalog collaborator
//! - **Queue Errors**: shutdown and task spawning failures of the job queue
//! - **Handler Errors**: job type protocol and run script failures
//!
//! # Usage
//!
//! ```rust
//! use backup_director::errors::{DirectorError, DirectorResult};
//!
//! fn lookup(name: &str) -> DirectorResult<()> {
//!     Err(DirectorError::not_found("Job", name))
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using DirectorError
pub type DirectorResult<T> = Result<T, DirectorError>;

/// Convenience type alias for catalog Results
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Convenience type alias for configuration Results
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Convenience type alias for handler Results
pub type HandlerResult<T> = Result<T, HandlerError>;
