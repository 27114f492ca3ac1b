//! FxRelay Common Types
//!
//! Shared types used across FxRelay: the rate model, symbol normalization,
//! pipeline identifiers and time helpers.

pub mod error;
pub mod rate;
pub mod symbol;
pub mod time;

pub use error::*;
pub use rate::*;
pub use symbol::PipelineId;
pub use time::*;
