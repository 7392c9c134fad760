pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod rate_limit;
pub mod sessions;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
pub use domain::flash_sale::{FlashSaleProposal, NewProposal, ProposalId, ProposalStatus};
pub use domain::session::{AuthState, ContextEntry, ContextKind, Role, Session, SessionId};
pub use domain::tool::ToolName;
pub use domain::trace::{ToolCall, ToolFailure, ToolOutcome, TraceDiagnostic, TurnTrace};
pub use domain::user::{Credentials, UserRef};
pub use errors::{ApplicationError, DomainError, ErrorCode, InterfaceError, ValidationError};
pub use flows::{FlashSaleBook, FlashSaleError, LoginEvent, LoginFlow, LoginTransitionError};
pub use rate_limit::{RateDecision, RateLimitPolicy, SlidingWindowLimiter};
pub use sessions::{SessionGuard, SessionStore};
