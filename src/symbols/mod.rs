pub mod normalize;
pub mod registry;
pub mod segments;

pub use normalize::normalize;
pub use segments::{resolve_segments, Segment};
