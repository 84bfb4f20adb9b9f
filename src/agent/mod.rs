pub mod context;
#[allow(clippy::module_inception)]
#[path = "loop.rs"]
pub mod loop_;
pub mod subagent;
pub mod turn_guard;

pub use context::ContextBuilder;
pub use loop_::AgentLoop;
pub use subagent::SubagentManager;
pub use turn_guard::TurnGuard;
