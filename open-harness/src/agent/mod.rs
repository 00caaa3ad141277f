//! The agent layer: executor loop, planner/critic/replanner, orchestrator.

mod orchestrator;
mod planner;
mod runner;

pub use orchestrator::{GoalOutcome, GoalStats, GoalStatus, Orchestrator};
pub use planner::{Complexity, CriticVerdict, Plan, Planner, Step, critique, estimate_complexity};
pub use runner::{LoopOutcome, RunStats, Runner};
