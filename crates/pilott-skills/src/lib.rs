//! Tool boundary for Pilott agents.
//!
//! A [`Skill`] is an external capability an agent may invoke during a plan
//! step. Skills are registered in a [`SkillRegistry`] shared by the pool.

pub mod registry;
pub mod skill;

pub use registry::SkillRegistry;
pub use skill::{Skill, SkillDescriptor};
