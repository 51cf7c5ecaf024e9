//! Data models for Rollwatch

mod alert;
mod gauge;
mod histogram;
mod series;

pub use alert::*;
pub use gauge::*;
pub use histogram::*;
pub use series::*;
