use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::user::UserRef;
use crate::errors::ValidationError;

const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Accepts externally supplied ids: 1..=128 chars of `[A-Za-z0-9._:-]`.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptySessionId);
        }
        if trimmed.len() > MAX_SESSION_ID_LEN {
            return Err(ValidationError::SessionIdTooLong { max: MAX_SESSION_ID_LEN });
        }
        if let Some(ch) =
            trimmed.chars().find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | ':' | '-')))
        {
            return Err(ValidationError::SessionIdCharacter(ch));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Anonymous,
    Customer,
    Supplier,
    Guest,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Customer => "customer",
            Self::Supplier => "supplier",
            Self::Guest => "guest",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Anonymous,
    RoleClaimed,
    AccountLookupPending,
    Authenticated,
    Guest,
}

impl AuthState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Authenticated | Self::Guest)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::RoleClaimed => "role_claimed",
            Self::AccountLookupPending => "account_lookup_pending",
            Self::Authenticated => "authenticated",
            Self::Guest => "guest",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    UserMessage,
    AssistantReply,
    ToolOutput,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub kind: ContextKind,
    pub label: String,
    pub content: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl ContextEntry {
    pub fn user_message(text: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind: ContextKind::UserMessage,
            label: "user".to_string(),
            content: serde_json::Value::String(text.into()),
            recorded_at: at,
        }
    }

    pub fn assistant_reply(text: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind: ContextKind::AssistantReply,
            label: "assistant".to_string(),
            content: serde_json::Value::String(text.into()),
            recorded_at: at,
        }
    }

    pub fn tool_output(
        tool_name: impl Into<String>,
        content: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Self {
        Self { kind: ContextKind::ToolOutput, label: tool_name.into(), content, recorded_at: at }
    }
}

/// Per-conversation state. Owned by the session store and only mutated while
/// the store's per-session lock is held.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub role: Role,
    pub auth_state: AuthState,
    pub identity: Option<UserRef>,
    /// Reply language the user asked for, kept across turns.
    #[serde(default)]
    pub preferred_language: Option<String>,
    pub context: VecDeque<ContextEntry>,
    pub failed_lookups: u32,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            role: Role::Anonymous,
            auth_state: AuthState::Anonymous,
            identity: None,
            preferred_language: None,
            context: VecDeque::new(),
            failed_lookups: 0,
            created_at: now,
            last_active_at: now,
        }
    }

    /// Appends to the rolling context, evicting the oldest entries past `limit`.
    pub fn push_context(&mut self, entry: ContextEntry, limit: usize) {
        self.context.push_back(entry);
        while self.context.len() > limit {
            self.context.pop_front();
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_active_at {
            self.last_active_at = now;
        }
    }

    pub fn is_idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_active_at < cutoff
    }

    pub fn account_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|user| user.account_id.as_str())
    }

    /// Most recent user messages and replies, oldest first.
    pub fn recent_transcript(&self, max_entries: usize) -> Vec<&ContextEntry> {
        let conversational = self
            .context
            .iter()
            .filter(|entry| entry.kind != ContextKind::ToolOutput)
            .collect::<Vec<_>>();
        let skip = conversational.len().saturating_sub(max_entries);
        conversational.into_iter().skip(skip).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{AuthState, ContextEntry, ContextKind, Role, Session, SessionId};
    use crate::errors::ValidationError;

    #[test]
    fn session_id_rejects_malformed_input() {
        assert_eq!(SessionId::parse("   "), Err(ValidationError::EmptySessionId));
        assert_eq!(SessionId::parse("abc def"), Err(ValidationError::SessionIdCharacter(' ')));
        assert!(matches!(
            SessionId::parse(&"x".repeat(200)),
            Err(ValidationError::SessionIdTooLong { .. })
        ));
        assert_eq!(SessionId::parse(" s1 ").map(|id| id.0), Ok("s1".to_string()));
    }

    #[test]
    fn new_session_starts_anonymous() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap_or_else(Utc::now);
        let session = Session::new(SessionId("s1".to_string()), now);

        assert_eq!(session.role, Role::Anonymous);
        assert_eq!(session.auth_state, AuthState::Anonymous);
        assert!(session.identity.is_none());
        assert_eq!(session.created_at, session.last_active_at);
    }

    #[test]
    fn context_is_bounded_and_keeps_newest() {
        let now = Utc::now();
        let mut session = Session::new(SessionId("s1".to_string()), now);
        for index in 0..5 {
            session.push_context(ContextEntry::user_message(format!("m{index}"), now), 3);
        }

        let texts = session
            .context
            .iter()
            .filter_map(|entry| entry.content.as_str().map(str::to_string))
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn transcript_skips_tool_outputs() {
        let now = Utc::now();
        let mut session = Session::new(SessionId("s1".to_string()), now);
        session.push_context(ContextEntry::user_message("hi", now), 10);
        session.push_context(
            ContextEntry::tool_output("data_access", serde_json::json!({"ok": true}), now),
            10,
        );
        session.push_context(ContextEntry::assistant_reply("hello", now), 10);

        let transcript = session.recent_transcript(10);
        assert_eq!(transcript.len(), 2);
        assert!(transcript.iter().all(|entry| entry.kind != ContextKind::ToolOutput));
    }

    #[test]
    fn touch_never_moves_backwards() {
        let now = Utc::now();
        let mut session = Session::new(SessionId("s1".to_string()), now);
        session.touch(now - Duration::minutes(5));
        assert_eq!(session.last_active_at, now);
        session.touch(now + Duration::minutes(5));
        assert!(!session.is_idle_since(now));
    }
}
