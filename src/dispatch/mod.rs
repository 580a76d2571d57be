pub mod classify;
pub mod normalize;
pub mod segments;

pub use classify::{canonical_id, classify, ModalityTag};
pub use normalize::normalize;
pub use segments::{parse, ParsedInput, Segment};
