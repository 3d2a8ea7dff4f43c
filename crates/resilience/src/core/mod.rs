//! Core types shared by every pattern: errors, results, configuration and
//! the invocation model.

pub mod config;
pub mod error;
pub mod invocation;
pub mod result;

pub use config::{ConfigError, ConfigResult, ResilienceConfig};
pub use error::{BoxError, ErrorPredicate, PolicyKind, RejectReason, ResilienceError};
pub use invocation::{AttemptContext, Invocation, Outcome};
pub use result::{ContextError, ResilienceResult, ResultExt};
