pub mod detect;
pub mod types;

pub use types::*;
