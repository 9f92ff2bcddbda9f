pub mod context;
pub mod notify;
pub mod orchestrator;
pub mod planner;
pub mod recovery;
pub mod run_log;
pub mod trigger;

pub use context::ExecutionContext;
pub use notify::{FileNotifier, LogNotifier};
pub use orchestrator::Orchestrator;
pub use planner::{ExecutionPlanner, Plan};
pub use recovery::RecoveryChain;
pub use run_log::RunLogger;
pub use trigger::{ManualTrigger, ScheduleTrigger, TriggerDispatcher};
