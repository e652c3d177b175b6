//! Warm build server
//!
//! A long-lived process that keeps the cache manager and compiler settings
//! loaded and serves builds to `kiln run` over loopback TCP. Any number of
//! servers may run on different ports; each registers itself in the
//! registry so `kiln server list` and `kiln server kill` can find it.

pub mod client;
pub mod control;
pub mod daemon;
pub mod protocol;
pub mod registry;

pub use client::Client;
pub use control::{ServerControl, StartOutcome, StopOutcome};
pub use daemon::{BuildServer, ServerPhase};
pub use protocol::{Pong, Request, Response};
pub use registry::{Registry, ServerInstance};
