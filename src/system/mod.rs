//! Process environment setup
//!
//! One-time preparation that has to happen before a session is built.

pub mod library_path;

pub use library_path::{prepend_entry, prepend_library_path, LibraryLocator, LocatorError, SEARCH_PATH_VAR};
