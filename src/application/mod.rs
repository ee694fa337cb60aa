//! Application layer with use cases, DTOs and the shared cache.

/// Data transfer objects.
pub mod dto;
/// Process-wide cache instance.
pub mod shared_cache;
/// Use case implementations.
pub mod use_cases;

pub use dto::{FetchReport, FetchRequest};
pub use shared_cache::{build_cache, init_shared_cache, shared_cache};
pub use use_cases::FetchImagesUseCase;
