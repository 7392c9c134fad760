use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::session::{AuthState, Role};
use crate::domain::user::UserRef;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimedRole {
    Customer,
    Supplier,
}

impl From<ClaimedRole> for Role {
    fn from(value: ClaimedRole) -> Self {
        match value {
            ClaimedRole::Customer => Role::Customer,
            ClaimedRole::Supplier => Role::Supplier,
        }
    }
}

/// Transition labels, already derived from the oracle's classification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginEvent {
    RoleClaimed(ClaimedRole),
    HasAccount,
    NoAccount,
    CredentialsMatched(UserRef),
    CredentialsRejected,
    Unrecognized,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginAction {
    PromptForRole,
    PromptForAccountStatus,
    PromptForCredentials,
    RepromptCredentials { attempts_left: u32 },
    WelcomeAuthenticated,
    WelcomeGuest,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginContext {
    pub role: Role,
    pub failed_lookups: u32,
    pub max_lookup_attempts: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginTransition {
    pub from: AuthState,
    pub to: AuthState,
    pub event: LoginEvent,
    pub role: Role,
    pub identity: Option<UserRef>,
    pub failed_lookups: u32,
    pub actions: Vec<LoginAction>,
}

impl LoginTransition {
    pub fn is_noop(&self) -> bool {
        self.from == self.to && self.actions.is_empty()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LoginTransitionError {
    #[error("{role:?} cannot continue without an account from {state:?}")]
    UnsupportedRoleTransition { role: Role, state: AuthState },
    #[error("invalid login transition from {state:?} using event {event:?}")]
    InvalidTransition { state: AuthState, event: LoginEvent },
}

/// Deterministic login funnel. Identical (state, event, context) inputs always
/// produce identical outcomes; the identity lookup happens outside.
#[derive(Clone, Debug, Default)]
pub struct LoginFlow;

impl LoginFlow {
    pub fn initial_state(&self) -> AuthState {
        AuthState::Anonymous
    }

    pub fn apply(
        &self,
        current: AuthState,
        event: &LoginEvent,
        context: &LoginContext,
    ) -> Result<LoginTransition, LoginTransitionError> {
        transition(current, event, context)
    }

    pub fn apply_with_audit<S>(
        &self,
        current: AuthState,
        event: &LoginEvent,
        context: &LoginContext,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<LoginTransition, LoginTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, event, context);
        match &result {
            Ok(outcome) if outcome.from != outcome.to => sink.emit(
                AuditEvent::from_context(
                    audit,
                    "login.transition_applied",
                    AuditCategory::Login,
                    AuditOutcome::Success,
                )
                .with_metadata("from", outcome.from.as_str())
                .with_metadata("to", outcome.to.as_str())
                .with_metadata("role", outcome.role.as_str()),
            ),
            Ok(_) => {}
            Err(error) => sink.emit(
                AuditEvent::from_context(
                    audit,
                    "login.transition_rejected",
                    AuditCategory::Login,
                    AuditOutcome::Rejected,
                )
                .with_metadata("from", current.as_str())
                .with_metadata("error", error.to_string()),
            ),
        }
        result
    }
}

fn transition(
    current: AuthState,
    event: &LoginEvent,
    context: &LoginContext,
) -> Result<LoginTransition, LoginTransitionError> {
    use AuthState::{AccountLookupPending, Anonymous, Authenticated, Guest, RoleClaimed};
    use LoginAction::{
        PromptForAccountStatus, PromptForCredentials, PromptForRole, RepromptCredentials,
        WelcomeAuthenticated, WelcomeGuest,
    };

    let stay = |actions: Vec<LoginAction>| LoginTransition {
        from: current,
        to: current,
        event: event.clone(),
        role: context.role,
        identity: None,
        failed_lookups: context.failed_lookups,
        actions,
    };
    let guest = || LoginTransition {
        from: current,
        to: Guest,
        event: event.clone(),
        role: Role::Guest,
        identity: None,
        failed_lookups: context.failed_lookups,
        actions: vec![WelcomeGuest],
    };

    let outcome = match (current, event) {
        (Authenticated, _) | (Guest, _) => stay(Vec::new()),

        (Anonymous, LoginEvent::RoleClaimed(claimed))
        | (RoleClaimed, LoginEvent::RoleClaimed(claimed)) => LoginTransition {
            from: current,
            to: RoleClaimed,
            event: event.clone(),
            role: Role::from(*claimed),
            identity: None,
            failed_lookups: 0,
            actions: vec![PromptForAccountStatus],
        },
        (Anonymous, LoginEvent::NoAccount) => guest(),
        (Anonymous, LoginEvent::CredentialsMatched(_))
        | (RoleClaimed, LoginEvent::CredentialsMatched(_))
        | (Anonymous, LoginEvent::CredentialsRejected)
        | (RoleClaimed, LoginEvent::CredentialsRejected) => {
            return Err(LoginTransitionError::InvalidTransition {
                state: current,
                event: event.clone(),
            });
        }
        (Anonymous, _) => stay(vec![PromptForRole]),

        (RoleClaimed, LoginEvent::HasAccount) => LoginTransition {
            from: current,
            to: AccountLookupPending,
            event: event.clone(),
            role: context.role,
            identity: None,
            failed_lookups: 0,
            actions: vec![PromptForCredentials],
        },
        (RoleClaimed, LoginEvent::NoAccount) | (AccountLookupPending, LoginEvent::NoAccount) => {
            if context.role == Role::Supplier {
                return Err(LoginTransitionError::UnsupportedRoleTransition {
                    role: context.role,
                    state: current,
                });
            }
            guest()
        }
        (RoleClaimed, _) => stay(vec![PromptForAccountStatus]),

        (AccountLookupPending, LoginEvent::CredentialsMatched(user)) => LoginTransition {
            from: current,
            to: Authenticated,
            event: event.clone(),
            role: context.role,
            identity: Some(user.clone()),
            failed_lookups: 0,
            actions: vec![WelcomeAuthenticated],
        },
        (AccountLookupPending, LoginEvent::CredentialsRejected) => {
            let failed_lookups = context.failed_lookups.saturating_add(1);
            if failed_lookups >= context.max_lookup_attempts {
                LoginTransition { failed_lookups, ..guest() }
            } else {
                LoginTransition {
                    failed_lookups,
                    ..stay(vec![RepromptCredentials {
                        attempts_left: context.max_lookup_attempts - failed_lookups,
                    }])
                }
            }
        }
        (AccountLookupPending, _) => stay(vec![PromptForCredentials]),
    };

    Ok(outcome)
}
