//! 核心编排层：任务、队列、调度、异步移交、输入面、关闭

pub mod error;
pub mod handoff;
pub mod orchestrator;
pub mod shutdown;
pub mod task;
pub mod task_queue;
pub mod task_scheduler;

pub use error::{ActionParseError, AgentError};
pub use handoff::{HandoffController, NestedContext, NestedExecutor, NestedRequest};
pub use orchestrator::{parse_input_line, spawn_input_loop, InputEvent, SyncSignal};
pub use shutdown::{ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use task::{FinishReason, Task, TaskId, TaskSnapshot, TaskStatus};
pub use task_queue::{DequeueReason, EnqueueOutcome, HookDecision, TaskQueue};
pub use task_scheduler::{LoopOutcome, TaskRunner, TaskScheduler};
