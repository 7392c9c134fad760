//! Tool contract shared by every capability adapter.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kcart_core::domain::session::{Role, SessionId};
use kcart_core::domain::tool::ToolName;
use kcart_core::domain::trace::ToolFailure;
use kcart_core::domain::user::UserRef;
use kcart_core::errors::ErrorCode;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod flash_sale;
pub mod remote;

pub use flash_sale::FlashSaleTool;
pub use remote::RemoteTool;

pub type ToolInput = Map<String, Value>;
pub type ToolOutput = Map<String, Value>;

/// Everything a tool may know about the caller.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub correlation_id: String,
    pub role: Role,
    pub identity: Option<UserRef>,
    pub now: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub staged: StagedChanges,
}

impl ToolContext {
    /// Account id of a signed-in supplier, if any.
    pub fn supplier_id(&self) -> Option<&str> {
        self.identity
            .as_ref()
            .filter(|user| user.role == Role::Supplier)
            .map(|user| user.account_id.as_str())
    }
}

/// A write a tool has validated but not applied. Tools that mutate shared
/// state stage their writes here; the runtime commits them after the reply is
/// composed, with no suspension point in between, so a turn cut off by its
/// deadline leaves shared state untouched.
pub trait StagedChange: Send + Sync {
    fn tool(&self) -> ToolName;

    fn commit(&self) -> Result<(), ToolError>;
}

/// Writes staged during one turn, committed in staging order.
#[derive(Clone, Default)]
pub struct StagedChanges {
    changes: Arc<Mutex<Vec<Box<dyn StagedChange>>>>,
}

impl StagedChanges {
    pub fn stage<C>(&self, change: C)
    where
        C: StagedChange + 'static,
    {
        self.lock().push(Box::new(change));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops everything staged so far.
    pub fn discard(&self) {
        self.lock().clear();
    }

    /// Applies every staged change and returns the ones that failed. A failed
    /// change does not stop the rest.
    pub fn commit_all(&self) -> Vec<(ToolName, ToolError)> {
        let changes = std::mem::take(&mut *self.lock());
        changes
            .into_iter()
            .filter_map(|change| change.commit().err().map(|error| (change.tool(), error)))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Box<dyn StagedChange>>> {
        match self.changes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for StagedChanges {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("StagedChanges").field("pending", &self.len()).finish()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{code:?}: {error}")]
pub struct ToolError {
    pub code: ErrorCode,
    pub error: String,
}

impl ToolError {
    pub fn new(code: ErrorCode, error: impl Into<String>) -> Self {
        Self { code, error: error.into() }
    }

    pub fn execution(error: impl Into<String>) -> Self {
        Self::new(ErrorCode::ToolExecutionError, error)
    }

    pub fn invalid_input(error: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, error)
    }

    pub fn timeout(tool: ToolName) -> Self {
        Self::new(ErrorCode::ToolTimeout, format!("{tool} did not answer in time"))
    }

    pub fn unavailable(tool: ToolName) -> Self {
        Self::execution(format!("{tool} is not available"))
    }
}

impl From<ToolError> for ToolFailure {
    fn from(value: ToolError) -> Self {
        Self { code: value.code.as_str().to_string(), error: value.error }
    }
}

/// A named capability. Implementations never panic on bad input; every
/// failure comes back as a `ToolError` so the turn can carry on.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> ToolName;

    async fn invoke(
        &self,
        input: &ToolInput,
        context: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<ToolName, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.name(), Arc::new(tool));
    }

    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: ToolName) -> Option<Arc<dyn Tool>> {
        self.tools.get(&name).cloned()
    }

    pub fn contains(&self, name: ToolName) -> bool {
        self.tools.contains_key(&name)
    }

    pub fn names(&self) -> Vec<ToolName> {
        self.tools.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

pub(crate) fn input_str<'a>(input: &'a ToolInput, key: &str) -> Option<&'a str> {
    input.get(key).and_then(Value::as_str).map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use kcart_core::domain::tool::ToolName;
    use kcart_core::domain::trace::ToolFailure;
    use kcart_core::errors::ErrorCode;
    use serde_json::json;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{
        StagedChange, StagedChanges, Tool, ToolContext, ToolError, ToolInput, ToolOutput,
        ToolRegistry,
    };

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> ToolName {
            ToolName::VectorSearch
        }

        async fn invoke(
            &self,
            input: &ToolInput,
            _context: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            Ok(input.clone())
        }
    }

    #[test]
    fn registry_is_keyed_by_tool_name() {
        let mut registry = ToolRegistry::default();
        assert!(registry.is_empty());
        registry.register(Echo);
        registry.register(Echo);

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(ToolName::VectorSearch));
        assert!(registry.get(ToolName::DataAccess).is_none());
        assert_eq!(registry.names(), vec![ToolName::VectorSearch]);
    }

    struct Counted {
        applied: Arc<AtomicUsize>,
        fail: bool,
    }

    impl StagedChange for Counted {
        fn tool(&self) -> ToolName {
            ToolName::FlashSaleManager
        }

        fn commit(&self) -> Result<(), ToolError> {
            if self.fail {
                return Err(ToolError::execution("write refused"));
            }
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn staged_changes_apply_only_on_commit() {
        let applied = Arc::new(AtomicUsize::new(0));
        let staged = StagedChanges::default();
        let shared = staged.clone();
        shared.stage(Counted { applied: Arc::clone(&applied), fail: false });
        shared.stage(Counted { applied: Arc::clone(&applied), fail: true });
        shared.stage(Counted { applied: Arc::clone(&applied), fail: false });

        assert_eq!(staged.len(), 3);
        assert_eq!(applied.load(Ordering::SeqCst), 0);

        let failures = staged.commit_all();
        assert_eq!(applied.load(Ordering::SeqCst), 2);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, ToolName::FlashSaleManager);
        assert!(staged.is_empty());
    }

    #[test]
    fn discarded_changes_never_apply() {
        let applied = Arc::new(AtomicUsize::new(0));
        let staged = StagedChanges::default();
        staged.stage(Counted { applied: Arc::clone(&applied), fail: false });
        staged.discard();

        assert!(staged.commit_all().is_empty());
        assert_eq!(applied.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tool_errors_become_trace_failures_with_stable_codes() {
        let failure = ToolFailure::from(ToolError::timeout(ToolName::AnalyticsData));
        assert_eq!(failure.code, "tool_timeout");
        assert!(failure.error.contains("analytics_data"));

        let invalid = ToolError::invalid_input("product_name is required");
        assert_eq!(invalid.code, ErrorCode::ValidationError);
        assert_eq!(json!(ToolFailure::from(invalid))["error"], "product_name is required");
    }
}
