//! CLI command implementations

pub mod build;
pub mod cache;
pub mod config;
pub mod inspect;
pub mod run;
pub mod server;

pub use build::execute as build;
pub use cache::execute as cache;
pub use config::execute as config;
pub use inspect::execute as inspect;
pub use run::execute as run;
pub use server::execute as server;
