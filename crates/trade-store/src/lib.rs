mod audit;
mod params;
mod patterns;
mod sources;
mod store;
mod trades;

pub use store::TradeStore;
