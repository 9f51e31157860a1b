pub mod cache;
pub mod proxy;
pub mod sniff;

pub use cache::{CacheStats, CachedImage, ImageCache, cache_key};
pub use proxy::{ImageError, ImageProxy, ImageResponse, ImageSettings, WarmReport};
pub use sniff::{ImageKind, sniff_image};
