//! Streamscope - a scoped-cache lifecycle scheduler
//!
//! Streams move through nested process, run and luminosity block scopes.
//! Per-scope caches are created once, shared by every stream inside the
//! scope, optionally folded from per-stream summaries and released only
//! after the last stream has left. The built-in filters check the order and
//! number of every transition they see.

pub mod cache;
pub mod config;
pub mod counter;
pub mod error;
pub mod filters;
pub mod input_cache;
pub mod module;
pub mod process_block;
pub mod report;
pub mod scheduler;
pub mod scope;
pub mod source;
pub mod summary;
pub mod validator;

pub use error::{Result, SchedulerError};
