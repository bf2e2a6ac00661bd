//! Execution disciplines: Autonomous Pool (C5), Continuous Runner (C6), and
//! Collaborative Pool (C7). Each exposes an activation entry point the
//! Orchestrator's `activate` drives as its `activation_fn`.

mod autonomous;
mod collaborative;
mod continuous;

pub use autonomous::{AutonomousPool, AutonomousPoolConfig};
pub use collaborative::{aggregate_results, CollaborativePool, CollaborativePoolConfig, PlanRunState, PlanStep, StepStatus};
pub use continuous::{ContinuousAgentState, ContinuousRunner, ContinuousRunnerConfig};
