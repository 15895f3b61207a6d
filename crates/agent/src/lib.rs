//! The agent execution loop: tool-calling conversation turns with hooks,
//! compaction, and session persistence.

pub mod agent;
pub mod audit;
pub mod hooks;

pub use agent::{AgentExecutor, AgentExecutorConfig, DEFAULT_MAX_ITERATIONS, Task};
pub use audit::{AuditEvent, AuditSink, NdjsonAuditSink};
pub use hooks::{Hook, HookContext, HookPoint, HookRegistry};
