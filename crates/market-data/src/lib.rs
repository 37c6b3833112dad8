pub mod calendar;
pub mod client;
pub mod error;
pub mod indicators;
pub mod snapshot;

pub use calendar::*;
pub use client::*;
pub use error::*;
pub use snapshot::*;
