//! Domain entity definitions.

mod cache_key;
mod fetched_image;

pub use cache_key::{CacheKey, url_digest};
pub use fetched_image::{
    FetchResult, FetchedImage, ImageLoadedEvent, ImageSource, SubscriberId, decoded_cost,
};
