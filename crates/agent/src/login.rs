use std::sync::Arc;

use kcart_core::audit::{AuditContext, AuditSink};
use kcart_core::domain::session::{AuthState, Role, Session};
use kcart_core::domain::user::Credentials;
use kcart_core::errors::ErrorCode;
use kcart_core::flows::{
    ClaimedRole, LoginAction, LoginContext, LoginEvent, LoginFlow, LoginTransitionError,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::identity::{LookupError, UserDirectory};
use crate::oracle::{Classification, Intent};

pub const LOOKUP_OUTAGE_REPLY: &str =
    "I couldn't verify your account right now. Please try again.";

const SUPPLIER_NEEDS_ACCOUNT_REPLY: &str = "Supplier features need a registered KCart supplier \
account. Please share the name and phone number you registered with, or contact our team to \
get onboarded.";

/// Result of one login turn. `reply` is always set; the session has already
/// been updated in place when `transitioned` is true. `code` is set when the
/// step was refused or could not run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginStep {
    pub reply: String,
    pub transitioned: bool,
    pub lookup_outage: bool,
    pub code: Option<ErrorCode>,
}

/// Async shell around the pure login flow: maps oracle output to login
/// events, runs the identity lookup and renders prompts.
pub struct LoginDriver {
    flow: LoginFlow,
    directory: Arc<dyn UserDirectory>,
    max_lookup_attempts: u32,
    audit: Arc<dyn AuditSink>,
}

impl LoginDriver {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        max_lookup_attempts: u32,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { flow: LoginFlow, directory, max_lookup_attempts: max_lookup_attempts.max(1), audit }
    }

    pub async fn step(
        &self,
        session: &mut Session,
        classification: &Classification,
        audit: &AuditContext,
        cancel: &CancellationToken,
    ) -> LoginStep {
        let event = match self.event_for(session, classification, cancel).await {
            Ok(event) => event,
            Err(error) => {
                warn!(
                    event_name = "login.lookup_unavailable",
                    correlation_id = %audit.correlation_id,
                    session_id = %session.id,
                    error = %error,
                    "identity lookup failed; keeping login state"
                );
                return LoginStep {
                    reply: LOOKUP_OUTAGE_REPLY.to_string(),
                    transitioned: false,
                    lookup_outage: true,
                    code: Some(ErrorCode::UpstreamUnavailable),
                };
            }
        };

        let context = LoginContext {
            role: session.role,
            failed_lookups: session.failed_lookups,
            max_lookup_attempts: self.max_lookup_attempts,
        };
        let outcome =
            self.flow.apply_with_audit(session.auth_state, &event, &context, self.audit.as_ref(), audit);

        match outcome {
            Ok(transition) => {
                let transitioned = transition.from != transition.to;
                let exhausted = transition.to == AuthState::Guest
                    && matches!(transition.event, LoginEvent::CredentialsRejected);

                session.auth_state = transition.to;
                session.role = transition.role;
                session.failed_lookups = transition.failed_lookups;
                if transition.identity.is_some() {
                    session.identity = transition.identity.clone();
                }
                if transitioned {
                    info!(
                        event_name = "login.transition",
                        correlation_id = %audit.correlation_id,
                        session_id = %session.id,
                        from = transition.from.as_str(),
                        to = transition.to.as_str(),
                        role = transition.role.as_str(),
                        "login state changed"
                    );
                }

                let reply = transition
                    .actions
                    .iter()
                    .map(|action| render_action(action, session, exhausted))
                    .collect::<Vec<_>>()
                    .join(" ");
                LoginStep { reply, transitioned, lookup_outage: false, code: None }
            }
            Err(LoginTransitionError::UnsupportedRoleTransition { .. }) => LoginStep {
                reply: SUPPLIER_NEEDS_ACCOUNT_REPLY.to_string(),
                transitioned: false,
                lookup_outage: false,
                code: Some(ErrorCode::UnsupportedRoleTransition),
            },
            Err(LoginTransitionError::InvalidTransition { state, .. }) => LoginStep {
                reply: prompt_for_state(state, session.role).to_string(),
                transitioned: false,
                lookup_outage: false,
                code: None,
            },
        }
    }

    async fn event_for(
        &self,
        session: &Session,
        classification: &Classification,
        cancel: &CancellationToken,
    ) -> Result<LoginEvent, LookupError> {
        let credentials = credentials_from(classification);
        let event = match (session.auth_state, classification.intent) {
            (AuthState::AccountLookupPending, _) => match credentials {
                Some(credentials) => {
                    return self.lookup(session.role, &credentials, cancel).await;
                }
                None if matches!(classification.intent, Intent::NewUser | Intent::Register) => {
                    LoginEvent::NoAccount
                }
                None => LoginEvent::Unrecognized,
            },
            (_, Intent::IsCustomer) => LoginEvent::RoleClaimed(ClaimedRole::Customer),
            (_, Intent::IsSupplier) => LoginEvent::RoleClaimed(ClaimedRole::Supplier),
            (_, Intent::HasAccount) => LoginEvent::HasAccount,
            (_, Intent::NewUser | Intent::Register) => LoginEvent::NoAccount,
            (_, _) => LoginEvent::Unrecognized,
        };
        Ok(event)
    }

    async fn lookup(
        &self,
        role: Role,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<LoginEvent, LookupError> {
        let found = self.directory.lookup_user(credentials, role, cancel).await?;
        Ok(match found {
            Some(user) => LoginEvent::CredentialsMatched(user),
            None => LoginEvent::CredentialsRejected,
        })
    }
}

fn credentials_from(classification: &Classification) -> Option<Credentials> {
    let name = classification.slot_str("user_name")?;
    let phone = classification.slot_str("phone_number")?;
    Credentials::new(&name, &phone)
}

fn render_action(action: &LoginAction, session: &Session, exhausted: bool) -> String {
    match action {
        LoginAction::PromptForRole => prompt_for_state(AuthState::Anonymous, session.role).to_string(),
        LoginAction::PromptForAccountStatus => {
            prompt_for_state(AuthState::RoleClaimed, session.role).to_string()
        }
        LoginAction::PromptForCredentials => {
            prompt_for_state(AuthState::AccountLookupPending, session.role).to_string()
        }
        LoginAction::RepromptCredentials { attempts_left } => format!(
            "I couldn't find an account with those details. Please check the name and phone \
             number and try again ({attempts_left} attempt{} left).",
            if *attempts_left == 1 { "" } else { "s" }
        ),
        LoginAction::WelcomeAuthenticated => {
            let name = session.identity.as_ref().map(|user| user.name.as_str()).unwrap_or("there");
            match session.role {
                Role::Supplier => format!(
                    "Welcome back, {name}! You can check stock, review expiring products, \
                     get pricing insights or manage flash sales."
                ),
                _ => format!("Welcome back, {name}! What can I help you find today?"),
            }
        }
        LoginAction::WelcomeGuest if exhausted => "I still couldn't find your account, so let's \
            continue as a guest. You can browse products and ask for storage, nutrition or \
            seasonal advice."
            .to_string(),
        LoginAction::WelcomeGuest => "No problem, you can continue as a guest. You can browse \
            products and ask for storage, nutrition or seasonal advice."
            .to_string(),
    }
}

fn prompt_for_state(state: AuthState, role: Role) -> &'static str {
    match (state, role) {
        (AuthState::Anonymous, _) => {
            "Welcome to KCart! Are you shopping as a customer, or are you a supplier?"
        }
        (AuthState::RoleClaimed, Role::Supplier) => {
            "Great, welcome supplier! Do you already have a KCart supplier account?"
        }
        (AuthState::RoleClaimed, _) => "Great! Do you already have a KCart account?",
        (AuthState::AccountLookupPending, _) => {
            "Please share the name and phone number registered with your account."
        }
        (AuthState::Authenticated, _) | (AuthState::Guest, _) => "How can I help you today?",
    }
}
