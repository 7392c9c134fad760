//! Agent runtime: turns a chat message into a reply.
//!
//! The loop for one turn:
//! 1. **Admission** (`runtime`) - sliding-window rate limit per session and client
//! 2. **Classification** (`oracle`) - the reasoning oracle returns an intent and slots
//! 3. **Login** (`login`, `identity`) - drives the onboarding funnel until the
//!    visitor is authenticated or browsing as a guest
//! 4. **Guardrails** (`guardrails`) - role gate before any tool runs
//! 5. **Dispatch** (`dispatcher`, `tools`) - ordered tool calls, each traced
//! 6. **Reply** - the oracle phrases the tool results, falling back to
//!    deterministic summaries
//! 7. **Commit** - staged tool writes and the session draft are applied
//!    together, after the last await
//!
//! # Safety Principle
//!
//! The LLM only classifies and phrases. Prices, flash-sale transitions and
//! login decisions are made by deterministic code in `kcart-core`.

pub mod dispatcher;
pub mod guardrails;
pub mod identity;
pub mod llm;
pub mod login;
pub mod oracle;
pub mod runtime;
pub mod tools;

pub use dispatcher::{Dispatch, DispatchError, PlannedCall, ToolDispatcher};
pub use guardrails::{GuardrailDecision, GuardrailPolicy};
pub use identity::{HttpUserDirectory, InMemoryUserDirectory, LookupError, UserDirectory};
pub use llm::{HttpLlmClient, LlmClient, LlmError};
pub use login::{LoginDriver, LoginStep};
pub use oracle::{Classification, Intent, LlmOracle, OracleError, ReasoningOracle, ReplyDraft};
pub use runtime::{AgentRuntime, RuntimeComponents, TurnRequest, TurnResponse, TurnSettings};
pub use tools::{
    FlashSaleTool, RemoteTool, StagedChange, StagedChanges, Tool, ToolContext, ToolError,
    ToolRegistry,
};
