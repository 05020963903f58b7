pub mod engine;
pub mod handler;
pub mod ledger;
pub mod scorecard;
pub mod strategy;
pub mod sweep;

pub use sweep::run_sweep;
