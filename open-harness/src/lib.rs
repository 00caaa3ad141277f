//! open-harness: a self-driving agent harness for weak local language
//! models.
//!
//! Local models are unreliable tool callers: they emit malformed JSON,
//! hallucinate tool names, lose track of context, and give up. This crate
//! is the execution engine that compensates — a planner/critic/executor
//! control loop, a repair-and-retry pipeline around every LM turn, a
//! layered context store with two-level compression, a checkpoint/rollback
//! transaction layer over the git workspace, a policy-guarded tool
//! executor, and a persistent background task queue.
//!
//! The typical entry point is [`Harness::init`], which wires the pieces for
//! one workspace:
//!
//! ```ignore
//! let config = HarnessConfig::discover(None)?;
//! let harness = Harness::init(config, std::env::current_dir()?)?;
//! let outcome = harness.run_goal("fix the failing tests", Default::default()).await;
//! println!("{}", outcome.summary);
//! ```

// Core data model
pub mod config;
pub mod error;
pub mod message;

// LM transport and turn repair
pub mod classify;
pub mod compensate;
pub mod llm;
pub mod parser;

// Execution
pub mod checkpoint;
pub mod context;
pub mod policy;
pub mod tools;

// Control
pub mod agent;
pub mod events;
pub mod tasks;

mod harness;

pub use agent::{GoalOutcome, GoalStats, GoalStatus, Orchestrator};
pub use classify::{Failure, FailureClass};
pub use config::{HarnessConfig, Tier};
pub use error::{HarnessError, Result};
pub use events::{Event, EventBus, EventStream};
pub use harness::Harness;
pub use llm::{ChatBackend, ChatRequest, LmClient, LmResponse};
pub use message::{Message, Role, ToolCall, ToolResult};
pub use tasks::{Task, TaskStatus};
