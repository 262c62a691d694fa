//! Typed values and their supporting machinery.
//!
//! A [`Type`] is the canonical on-disk identity of a column (ordinal +
//! logical size); a [`Value`] is a payload conforming to a `Type`. The
//! [`codec`] module maps values to bytes (with per-type null sentinels),
//! [`distance`] provides the similarity kernels used by the vector indexes,
//! and [`statistics`] maintains per-column summaries.

pub mod codec;
pub mod distance;
pub mod statistics;
mod types;
mod value;

pub use distance::Distance;
pub use statistics::ValueStatistics;
pub use types::Type;
pub use value::Value;
