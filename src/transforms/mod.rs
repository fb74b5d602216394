//! Content rewrites applied to upstream fragments before they reach callers.

pub mod thinking;

pub use thinking::transform_thinking;
