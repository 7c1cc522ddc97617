pub mod htn;
pub mod tot;

pub use htn::{classify_goal, GoalClass, MethodRegistry};
pub use tot::{evaluate as evaluate_steps, materialize_branches, search, BeamConfig, Evaluation, Node};
