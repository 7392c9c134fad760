use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kcart_agent::{
    AgentRuntime, Classification, GuardrailPolicy, InMemoryUserDirectory, Intent, LoginDriver,
    OracleError, ReasoningOracle, RuntimeComponents, ToolDispatcher, ToolRegistry, TurnSettings,
};
use kcart_core::audit::{AuditSink, InMemoryAuditSink};
use kcart_core::domain::session::Session;
use kcart_core::rate_limit::{RateLimitPolicy, SlidingWindowLimiter};
use kcart_core::sessions::SessionStore;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug)]
pub enum OracleMode {
    Scripted,
    Down,
    Hanging,
}

pub struct FakeOracle {
    mode: OracleMode,
}

#[async_trait]
impl ReasoningOracle for FakeOracle {
    async fn classify(
        &self,
        message: &str,
        _session: &Session,
        _cancel: &CancellationToken,
    ) -> Result<Classification, OracleError> {
        match self.mode {
            OracleMode::Down => Err(OracleError::Unavailable("connection refused".to_string())),
            OracleMode::Hanging => {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(Classification::new(Intent::Unknown))
            }
            OracleMode::Scripted if message.contains("supplier") => {
                Ok(Classification::new(Intent::IsSupplier))
            }
            OracleMode::Scripted => Ok(Classification::new(Intent::Unknown)),
        }
    }
}

pub fn runtime(mode: OracleMode, policy: RateLimitPolicy, deadline: Duration) -> Arc<AgentRuntime> {
    let audit: Arc<dyn AuditSink> = Arc::new(InMemoryAuditSink::default());
    Arc::new(AgentRuntime::new(
        RuntimeComponents {
            limiter: Arc::new(SlidingWindowLimiter::new(policy)),
            sessions: Arc::new(SessionStore::new(20)),
            oracle: Arc::new(FakeOracle { mode }),
            login: LoginDriver::new(
                Arc::new(InMemoryUserDirectory::default()),
                3,
                Arc::clone(&audit),
            ),
            guardrails: GuardrailPolicy::default(),
            dispatcher: ToolDispatcher::new(
                Arc::new(ToolRegistry::default()),
                Duration::from_secs(5),
                Arc::clone(&audit),
            ),
            audit,
        },
        TurnSettings { deadline, ..TurnSettings::default() },
    ))
}
