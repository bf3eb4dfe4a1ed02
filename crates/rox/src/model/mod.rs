pub mod context;
pub mod dynamic;
pub mod entities;

pub use context::Context;
pub use dynamic::DynamicValue;
pub use entities::{ExperimentModel, TargetGroupModel};
