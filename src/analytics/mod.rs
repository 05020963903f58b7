pub mod gaussian;
pub mod skill;

pub use skill::{SkillModel, SkillParams};
