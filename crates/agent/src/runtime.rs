//! Per-turn orchestrator.
//!
//! A turn is admitted by the rate limiter, then runs under the session's
//! exclusive lock and an overall deadline. All session changes are made on a
//! draft copy, and tool writes to shared state are staged. Both are committed
//! together after the last suspension point, so a timed-out or failed turn
//! leaves the session and every flash sale proposal exactly as they were.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kcart_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use kcart_core::config::TurnConfig;
use kcart_core::domain::session::{AuthState, ContextEntry, Role, Session, SessionId};
use kcart_core::domain::tool::ToolName;
use kcart_core::domain::trace::TurnTrace;
use kcart_core::errors::{ApplicationError, ValidationError};
use kcart_core::rate_limit::SlidingWindowLimiter;
use kcart_core::sessions::SessionStore;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatcher::{describe_failure, ToolDispatcher};
use crate::guardrails::{GuardrailDecision, GuardrailPolicy};
use crate::login::LoginDriver;
use crate::oracle::{Classification, Intent, OracleError, ReasoningOracle, ReplyDraft};
use crate::tools::{StagedChanges, ToolContext};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnRequest {
    pub session_id: Option<String>,
    pub message: String,
    pub client_key: Option<String>,
    pub correlation_id: String,
}

impl TurnRequest {
    pub fn new(session_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            session_id,
            message: message.into(),
            client_key: None,
            correlation_id: format!("req-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn with_client_key(mut self, client_key: impl Into<String>) -> Self {
        self.client_key = Some(client_key.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResponse {
    pub session_id: String,
    pub reply: String,
    pub role: Role,
    pub auth_state: AuthState,
    pub trace: TurnTrace,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TurnSettings {
    pub deadline: Duration,
    pub max_message_chars: usize,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self { deadline: Duration::from_secs(30), max_message_chars: 4_000 }
    }
}

impl From<&TurnConfig> for TurnSettings {
    fn from(config: &TurnConfig) -> Self {
        Self {
            deadline: Duration::from_secs(config.deadline_secs),
            max_message_chars: config.max_message_chars,
        }
    }
}

/// Collaborators the runtime composes. Everything is shared so the server can
/// keep handles for health reporting and the sweeper.
pub struct RuntimeComponents {
    pub limiter: Arc<SlidingWindowLimiter>,
    pub sessions: Arc<SessionStore>,
    pub oracle: Arc<dyn ReasoningOracle>,
    pub login: LoginDriver,
    pub guardrails: GuardrailPolicy,
    pub dispatcher: ToolDispatcher,
    pub audit: Arc<dyn AuditSink>,
}

pub struct AgentRuntime {
    limiter: Arc<SlidingWindowLimiter>,
    sessions: Arc<SessionStore>,
    oracle: Arc<dyn ReasoningOracle>,
    login: LoginDriver,
    guardrails: GuardrailPolicy,
    dispatcher: ToolDispatcher,
    audit: Arc<dyn AuditSink>,
    settings: TurnSettings,
}

impl AgentRuntime {
    pub fn new(components: RuntimeComponents, settings: TurnSettings) -> Self {
        let RuntimeComponents { limiter, sessions, oracle, login, guardrails, dispatcher, audit } =
            components;
        Self { limiter, sessions, oracle, login, guardrails, dispatcher, audit, settings }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    pub fn tool_names(&self) -> Vec<ToolName> {
        self.dispatcher.registry().names()
    }

    pub fn settings(&self) -> TurnSettings {
        self.settings
    }

    /// Evicts idle sessions and forgets quiet rate-limit keys. Returns
    /// `(sessions_removed, limiter_keys_removed)`.
    pub fn sweep(&self, max_idle: chrono::Duration, now: DateTime<Utc>) -> (usize, usize) {
        (self.sessions.sweep_expired(max_idle, now), self.limiter.prune_idle(now))
    }

    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnResponse, ApplicationError> {
        self.handle_turn_at(request, Utc::now()).await
    }

    pub async fn handle_turn_at(
        &self,
        request: TurnRequest,
        now: DateTime<Utc>,
    ) -> Result<TurnResponse, ApplicationError> {
        let message = self.validate_message(&request.message)?;
        let session_id = match request.session_id.as_deref() {
            Some(raw) => SessionId::parse(raw)?,
            None => SessionId::generate(),
        };
        let correlation_id = request.correlation_id.as_str();

        let session_key = format!("session:{session_id}");
        let client_key = request.client_key.as_deref().map(|key| format!("client:{key}"));
        let mut keys = vec![session_key.as_str()];
        keys.extend(client_key.as_deref());

        let decision = self.limiter.admit_all(&keys, now);
        if !decision.allowed {
            warn!(
                event_name = "turn.rate_limited",
                correlation_id,
                session_id = %session_id,
                retry_after_ms = u64::try_from(decision.retry_after.as_millis()).unwrap_or(u64::MAX),
                "turn rejected by rate limiter"
            );
            self.audit.emit(
                AuditEvent::new(
                    Some(session_id.to_string()),
                    correlation_id,
                    "turn.rate_limited",
                    AuditCategory::Ingress,
                    request.client_key.as_deref().unwrap_or("unknown"),
                    AuditOutcome::Rejected,
                )
                .with_metadata("limit", decision.limit.to_string()),
            );
            return Err(ApplicationError::RateLimited { retry_after: decision.retry_after });
        }

        let cancel = CancellationToken::new();
        // dropping the turn future (client disconnect) also cancels
        let _cancel_on_drop = cancel.clone().drop_guard();
        let started = Instant::now();

        let outcome = tokio::time::timeout(
            self.settings.deadline,
            self.run_turn(&session_id, message, correlation_id, now, &cancel),
        )
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                warn!(
                    event_name = "turn.timeout",
                    correlation_id,
                    session_id = %session_id,
                    deadline_ms = u64::try_from(self.settings.deadline.as_millis()).unwrap_or(u64::MAX),
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "turn exceeded its deadline; session left unchanged"
                );
                self.audit.emit(AuditEvent::new(
                    Some(session_id.to_string()),
                    correlation_id,
                    "turn.timeout",
                    AuditCategory::Ingress,
                    "orchestrator",
                    AuditOutcome::Failed,
                ));
                Err(ApplicationError::DeadlineExceeded { deadline: self.settings.deadline })
            }
        }
    }

    fn validate_message<'a>(&self, raw: &'a str) -> Result<&'a str, ValidationError> {
        let message = raw.trim();
        if message.is_empty() {
            return Err(ValidationError::EmptyMessage);
        }
        if message.chars().count() > self.settings.max_message_chars {
            return Err(ValidationError::MessageTooLong { max: self.settings.max_message_chars });
        }
        Ok(message)
    }

    async fn run_turn(
        &self,
        session_id: &SessionId,
        message: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<TurnResponse, ApplicationError> {
        let mut guard = self.sessions.lock(session_id, now).await;
        let mut draft = (*guard).clone();
        draft.touch(now);
        let started = Instant::now();

        let classification =
            self.oracle.classify(message, &draft, cancel).await.map_err(|error| {
                self.oracle_failure(error, session_id, correlation_id)
            })?;

        if let Some(language) = classification.slot_str("language") {
            draft.preferred_language = Some(language);
        }

        let audit = AuditContext::new(Some(session_id.to_string()), correlation_id, "orchestrator");
        let staged = StagedChanges::default();
        let (mut reply, mut trace) = if draft.auth_state.is_terminal() {
            let context = ToolContext {
                session_id: draft.id.clone(),
                correlation_id: correlation_id.to_string(),
                role: draft.role,
                identity: draft.identity.clone(),
                now,
                cancel: cancel.clone(),
                staged: staged.clone(),
            };
            self.answer(&draft, &classification, message, &context).await?
        } else {
            let step = self.login.step(&mut draft, &classification, &audit, cancel).await;
            let mut trace = TurnTrace::default();
            if let Some(code) = step.code {
                trace.note("login", code.as_str(), Some(draft.auth_state.as_str().to_string()));
            }
            (step.reply, trace)
        };

        // no await from here on: staged writes and the session commit together
        for (tool, error) in staged.commit_all() {
            warn!(
                event_name = "turn.change_rejected",
                correlation_id,
                session_id = %session_id,
                tool = tool.as_str(),
                code = error.code.as_str(),
                error = %error.error,
                "staged change could not be applied"
            );
            trace.note("commit", error.code.as_str(), Some(error.error));
            reply.push(' ');
            reply.push_str(&describe_failure(tool, error.code.as_str()));
        }

        let limit = self.sessions.context_limit();
        draft.push_context(ContextEntry::user_message(message, now), limit);
        for call in &trace.tool_calls {
            let content = match (&call.output, &call.error) {
                (Some(output), _) => output.clone(),
                (None, Some(failure)) => json!({"error": failure.error, "code": failure.code}),
                (None, None) => json!(null),
            };
            draft.push_context(ContextEntry::tool_output(call.tool_name.as_str(), content, now), limit);
        }
        draft.push_context(ContextEntry::assistant_reply(reply.clone(), now), limit);

        let response = TurnResponse {
            session_id: session_id.to_string(),
            reply,
            role: draft.role,
            auth_state: draft.auth_state,
            trace,
        };
        *guard = draft;
        drop(guard);

        info!(
            event_name = "turn.completed",
            correlation_id,
            session_id = %session_id,
            intent = classification.intent.label(),
            role = response.role.as_str(),
            auth_state = response.auth_state.as_str(),
            tool_calls = response.trace.tool_calls.len(),
            tool_failures = response.trace.failures().count(),
            diagnostics = response.trace.diagnostics.len(),
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "turn completed"
        );
        Ok(response)
    }

    async fn answer(
        &self,
        session: &Session,
        classification: &Classification,
        message: &str,
        context: &ToolContext,
    ) -> Result<(String, TurnTrace), ApplicationError> {
        let correlation_id = context.correlation_id.as_str();
        match self.guardrails.evaluate(session.role, session.auth_state, classification) {
            GuardrailDecision::Allow => {}
            GuardrailDecision::Deny { reason_code, user_message, fallback_path }
            | GuardrailDecision::Degrade { reason_code, user_message, fallback_path } => {
                info!(
                    event_name = "guardrail.blocked",
                    correlation_id,
                    session_id = %session.id,
                    intent = classification.intent.label(),
                    reason_code,
                    fallback_path,
                    "intent answered without tools"
                );
                self.audit.emit(
                    AuditEvent::new(
                        Some(session.id.to_string()),
                        correlation_id,
                        "guardrail.blocked",
                        AuditCategory::Tool,
                        session.role.as_str(),
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("reason_code", reason_code)
                    .with_metadata("intent", classification.intent.label()),
                );
                let mut trace = TurnTrace::default();
                trace.note("guardrail", reason_code, Some(fallback_path.to_string()));
                return Ok((user_message, trace));
            }
        }

        let dispatch = self
            .dispatcher
            .dispatch(classification, message, session, context)
            .await
            .map_err(|_| ApplicationError::DeadlineExceeded { deadline: self.settings.deadline })?;

        if dispatch.trace.tool_calls.is_empty() {
            let reply = classification
                .reply
                .clone()
                .filter(|reply| !reply.trim().is_empty())
                .unwrap_or_else(|| direct_reply(classification.intent, session));
            return Ok((reply, dispatch.trace));
        }

        let draft = ReplyDraft {
            intent: classification.intent,
            message: message.to_string(),
            tool_calls: dispatch.trace.tool_calls.clone(),
            fallback: dispatch.fragments.join(" "),
            language: session.preferred_language.clone(),
        };
        let reply = match self.oracle.compose_reply(&draft, &context.cancel).await {
            Ok(reply) if !reply.trim().is_empty() => reply,
            Ok(_) => draft.fallback,
            Err(OracleError::Cancelled) => {
                return Err(ApplicationError::DeadlineExceeded { deadline: self.settings.deadline });
            }
            Err(OracleError::Unavailable(error)) => {
                warn!(
                    event_name = "oracle.compose_degraded",
                    correlation_id,
                    session_id = %session.id,
                    error = %error,
                    "reply composition failed; using tool summaries"
                );
                draft.fallback
            }
        };
        Ok((reply, dispatch.trace))
    }

    fn oracle_failure(
        &self,
        error: OracleError,
        session_id: &SessionId,
        correlation_id: &str,
    ) -> ApplicationError {
        match error {
            OracleError::Cancelled => {
                ApplicationError::DeadlineExceeded { deadline: self.settings.deadline }
            }
            OracleError::Unavailable(message) => {
                warn!(
                    event_name = "oracle.unavailable",
                    correlation_id,
                    session_id = %session_id,
                    error = %message,
                    "classification failed; aborting turn"
                );
                self.audit.emit(AuditEvent::new(
                    Some(session_id.to_string()),
                    correlation_id,
                    "turn.oracle_unavailable",
                    AuditCategory::Ingress,
                    "orchestrator",
                    AuditOutcome::Failed,
                ));
                ApplicationError::UpstreamUnavailable(message)
            }
        }
    }
}

/// Reply for intents that need no tool once the visitor is signed in or
/// browsing as a guest.
fn direct_reply(intent: Intent, session: &Session) -> String {
    let name = session.identity.as_ref().map(|user| user.name.as_str());
    match intent {
        Intent::IsCustomer | Intent::IsSupplier | Intent::HasAccount | Intent::VerifyAccount => {
            match (session.auth_state, name) {
                (AuthState::Authenticated, Some(name)) => {
                    format!("You're already signed in as {name}. What can I help you with?")
                }
                _ => "You're browsing as a guest. What can I help you with?".to_string(),
            }
        }
        Intent::NewUser | Intent::Register => "No problem, you can keep browsing as a guest. \
                                               Ask me about product availability or storage \
                                               tips."
            .to_string(),
        _ if session.role == Role::Supplier => "I'm not sure I understood. I can check your \
                                               stock, show expiring products and flash sales, \
                                               share pricing insights or summarise your sales."
            .to_string(),
        _ => "I'm not sure I understood. You can ask me about product availability, storage, \
              nutrition or what's in season."
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use kcart_core::domain::session::{AuthState, Role, Session, SessionId};
    use kcart_core::domain::user::UserRef;

    use super::{direct_reply, TurnRequest, TurnSettings};
    use crate::oracle::Intent;

    #[test]
    fn requests_get_a_fresh_correlation_id() {
        let first = TurnRequest::new(None, "hi");
        let second = TurnRequest::new(Some("s-1".to_string()), "hi").with_client_key("10.0.0.1");

        assert_ne!(first.correlation_id, second.correlation_id);
        assert!(first.correlation_id.starts_with("req-"));
        assert_eq!(second.client_key.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn default_settings_match_config_defaults() {
        let settings = TurnSettings::default();
        assert_eq!(settings.deadline.as_secs(), 30);
        assert_eq!(settings.max_message_chars, 4_000);
    }

    #[test]
    fn direct_replies_follow_the_session() {
        let mut session = Session::new(SessionId("s-1".to_string()), chrono::Utc::now());
        session.role = Role::Supplier;
        session.auth_state = AuthState::Authenticated;
        session.identity = Some(UserRef {
            account_id: "sup-17".to_string(),
            name: "Selam Agro".to_string(),
            phone: "+251911000111".to_string(),
            role: Role::Supplier,
        });

        assert!(direct_reply(Intent::IsSupplier, &session).contains("Selam Agro"));
        assert!(direct_reply(Intent::Unknown, &session).contains("flash sales"));

        session.role = Role::Guest;
        session.auth_state = AuthState::Guest;
        assert!(direct_reply(Intent::Unknown, &session).contains("in season"));
    }
}
