mod cache;
mod codec;
mod error;
pub mod lttb;
mod point;

pub use cache::*;
pub use codec::*;
pub use error::*;
pub use lttb::downsample;
pub use point::*;
