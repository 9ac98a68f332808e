//! llmsession
//!
//! Managed sessions over an on-device LLM engine: load a model from a JSON
//! configuration, stream generated text to a callback, stop it from another
//! thread and free the engine exactly once.

pub mod config;
pub mod inference;
pub mod session;
pub mod system;

pub use config::{ConfigError, SessionConfig};
pub use session::{CompletionReason, Parameters, ProfileSnapshot, QueryCounters, Session, SessionError, SessionState};
pub use system::{prepend_library_path, LibraryLocator, LocatorError};
