pub mod bootstrap;
pub mod chain;
pub mod config;
pub mod detector;
pub mod error;
pub mod pricing;
pub mod reconciliation;
pub mod settlement;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;
