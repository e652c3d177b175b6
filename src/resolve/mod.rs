//! Resolution of a primary script into a compilation unit

pub mod package;
pub mod precompiler;
mod resolver;
pub mod unit;

pub use package::{PackageFetcher, PackageStore, RegistryFetcher};
pub use precompiler::{ExternalPrecompiler, Precompiler};
pub use resolver::Resolver;
pub use unit::{content_hash, CompilationUnit, Reference, ResolveOptions, SourceFile};
