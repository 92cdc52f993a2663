pub mod curve;
pub mod rate_feed;

pub use curve::BondingCurve;
pub use rate_feed::{CoinbaseRateFeed, RateCell, RateSource};
