mod clock_port;
mod image_codec_port;
mod image_fetcher_port;

pub use clock_port::{ClockPort, SystemClock};
pub use image_codec_port::ImageCodecPort;
pub use image_fetcher_port::ImageFetcherPort;

#[cfg(test)]
pub use clock_port::MockClockPort;
