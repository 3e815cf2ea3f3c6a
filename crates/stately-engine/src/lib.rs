//! State machine execution engine for Stately.
//!
//! This crate interprets Amazon States Language style workflow definitions:
//! it walks the state graph from a start state to a terminal state, threading
//! a JSON value through the `InputPath` → `Parameters` → work → `ResultPath`
//! → `OutputPath` pipeline of every state, and recovers from task failures
//! with `Retry` and `Catch` rules.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Executor                                               │
//! │  - Trampoline loop over ExecutionContext                │
//! │  - Path transforms (path.rs)                            │
//! │  - Retry / Catch recovery                               │
//! ├────────────────────────────┬────────────────────────────┤
//! │  TaskInvoker               │  ChoiceEvaluator           │
//! │  - ServiceRegistry         │  - RuleEvaluator           │
//! │  - HandlerRegistry         │                            │
//! └────────────────────────────┴────────────────────────────┘
//! ```

pub mod choice;
pub mod context;
pub mod definition;
pub mod error;
pub mod executor;
pub mod handler;
pub mod invoker;
pub mod path;
pub mod protocol;
pub mod service;

pub use choice::{ChoiceError, ChoiceEvaluator, RuleEvaluator};
pub use context::ExecutionContext;
pub use definition::{
    CatchRule, DefinitionFile, RetryRule, StateDefinition, StateMachine, StateMachineDefinition,
    StateType,
};
pub use error::{DefinitionError, ErrorCause, ErrorOutput, ExecutionError, Result};
pub use executor::{ExecutionResult, ExecutionStatus, Executor, StartedExecution};
pub use handler::{CommandHandler, FnHandler, HandlerRegistry, TaskHandler};
pub use invoker::{RegistryInvoker, TaskError, TaskInvoker};
pub use path::{PathError, PathSpec};
pub use protocol::{HandlerInput, HandlerOutput, InvocationContext};
pub use service::{
    HttpQueueTransport, InMemoryQueue, QueueTransport, SendMessageRequest, ServiceIntegration,
    ServiceRegistry, SqsSendMessage,
};
