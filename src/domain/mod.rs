//! Domain layer with cache entities, errors, and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{
    CacheKey, FetchResult, FetchedImage, ImageLoadedEvent, ImageSource, SubscriberId,
};
pub use errors::{CacheError, CacheResult, FetchError};
pub use ports::{ClockPort, ImageCodecPort, ImageFetcherPort, SystemClock};
