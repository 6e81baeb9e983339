//! Client-side rate limiting.
//!
//! Independent token buckets per scope (login, general operations, and one
//! per market id), kept in a [`RateLimiterRegistry`] shared by every caller.

mod bucket;
mod registry;

pub use bucket::*;
pub use registry::*;
