pub mod optimizer;

pub use optimizer::{Sizing, StakeOptimizer};
