use std::time::Duration;

use async_trait::async_trait;
use kcart_core::domain::session::Role;
use kcart_core::domain::user::{normalize_phone, Credentials, UserRef};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("identity lookup unavailable: {0}")]
    Unavailable(String),
    #[error("identity lookup was cancelled")]
    Cancelled,
}

/// External account directory. `Ok(None)` means the lookup ran and found no
/// matching account for the claimed role.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup_user(
        &self,
        credentials: &Credentials,
        role: Role,
        cancel: &CancellationToken,
    ) -> Result<Option<UserRef>, LookupError>;
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryUserDirectory {
    users: Vec<UserRef>,
}

impl InMemoryUserDirectory {
    pub fn new(users: Vec<UserRef>) -> Self {
        Self { users }
    }

    pub fn with_user(mut self, user: UserRef) -> Self {
        self.users.push(user);
        self
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn lookup_user(
        &self,
        credentials: &Credentials,
        role: Role,
        _cancel: &CancellationToken,
    ) -> Result<Option<UserRef>, LookupError> {
        Ok(self
            .users
            .iter()
            .find(|user| {
                user.role == role
                    && normalize_phone(&user.phone) == credentials.phone
                    && user.name.eq_ignore_ascii_case(&credentials.name)
            })
            .cloned())
    }
}

/// `GET {lookup_url}?name=..&phone=..&role=..`; 200 carries a `UserRef`,
/// 404 means no match.
#[derive(Clone, Debug)]
pub struct HttpUserDirectory {
    http: reqwest::Client,
    lookup_url: String,
}

impl HttpUserDirectory {
    pub fn new(lookup_url: impl Into<String>, timeout: Duration) -> Result<Self, LookupError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| LookupError::Unavailable(error.to_string()))?;
        Ok(Self { http, lookup_url: lookup_url.into() })
    }

    async fn fetch(&self, credentials: &Credentials, role: Role) -> Result<Option<UserRef>, LookupError> {
        let response = self
            .http
            .get(&self.lookup_url)
            .query(&[
                ("name", credentials.name.as_str()),
                ("phone", credentials.phone.as_str()),
                ("role", role.as_str()),
            ])
            .send()
            .await
            .map_err(|error| LookupError::Unavailable(error.to_string()))?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<UserRef>()
                .await
                .map(Some)
                .map_err(|error| LookupError::Unavailable(format!("malformed directory reply: {error}"))),
            status => Err(LookupError::Unavailable(format!("directory returned status {status}"))),
        }
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn lookup_user(
        &self,
        credentials: &Credentials,
        role: Role,
        cancel: &CancellationToken,
    ) -> Result<Option<UserRef>, LookupError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(LookupError::Cancelled),
            result = self.fetch(credentials, role) => result,
        }
    }
}
