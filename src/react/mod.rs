//! 认知层：Action 协议、prompt、ReAct 主循环、工具调用子协议、蓝图

pub mod action;
pub mod blueprint;
pub mod context;
pub mod events;
pub mod loop_;
pub mod prompt;
pub mod tool_use;
pub mod verify;

pub use action::{Action, ActionKind, ActionSet, ActionType};
pub use blueprint::{Blueprint, BlueprintCatalog, StaticBlueprintCatalog};
pub use context::{ContextProvider, FocusMode};
pub use events::{EventEmitter, ReactEvent};
pub use loop_::{ReactLoop, ReactRuntime};
