//! Content-addressed build cache
//!
//! Artifacts are keyed by a fingerprint of everything that went into the
//! build. Entries are immutable once committed; a changed input produces a
//! different fingerprint and therefore a different entry.
//!
//! # Lookup
//!
//! | Condition | Result |
//! |-----------|--------|
//! | No sidecar / fingerprint mismatch | miss |
//! | Artifact missing | miss, rebuilt |
//! | Any input modified after `compiled_at` | miss, rebuilt |
//! | Otherwise | hit |

pub mod fingerprint;
mod manager;
pub mod store;

pub use fingerprint::fingerprint;
pub use manager::{BuildJob, CacheManager};
pub use store::{format_bytes, CacheEntry, CacheInput, CacheStore, InputKind, StoredEntry};
