pub mod fees;
pub mod gate;
pub mod params;

pub use fees::*;
pub use gate::*;
pub use params::*;

#[cfg(test)]
mod tests;
