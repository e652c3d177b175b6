//! Kiln - run compiled-language scripts
//!
//! Resolves `//kiln_` directives into a compilation unit, caches compiled
//! artifacts by content fingerprint and serves builds from a warm server.

pub mod build;
pub mod cache;
pub mod cli;
pub mod compiler;
pub mod config;
pub mod diagnostic;
pub mod directive;
pub mod error;
pub mod events;
pub mod resolve;
pub mod server;
pub mod ui;

pub use error::{KilnError, KilnResult};
