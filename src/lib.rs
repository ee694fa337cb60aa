//! Opcache - an asynchronous image fetching cache.
//!
//! Images are looked up in a cost-bounded memory tier, then an expiring disk
//! tier, then fetched over the network. Concurrent requests for the same
//! image share a single fetch, and every request can be cancelled on its own.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Application layer containing use cases, DTOs and the shared cache.
pub mod application;
/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing adapters for external services.
pub mod infrastructure;

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "opcache";
