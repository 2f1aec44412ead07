//! Traits describing the provider contract, the collaborator ports and the
//! shared error type.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use chrono::ParseError as ChronoParseError;
use reqwest::Error as ReqwestError;
use serde::{Deserialize, Serialize};

use crate::model::{
    AccountId, Additionals, Attendance, CanteenBalance, CanteenMenu, Capability, Chat,
    ChatMessage, Course, DateRange, Grade, Homework, News, Period, ProviderKind, ServiceLinkId,
};

#[derive(thiserror::Error, Debug)]
/// Errors that can occur while talking to provider backends.
pub enum PortError {
    /// Network layer failed.
    #[error("Network error: {0}")]
    Network(#[from] ReqwestError),
    /// Failed to parse a date from the provider response.
    #[error("Parse error: {0}")]
    Parse(#[from] ChronoParseError),
    /// Provider response did not have the expected shape.
    #[error("Decode error: {0}")]
    Decode(String),
    /// Provider rejected the session token.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    /// Provider rejected the stored credentials, or they are incomplete.
    #[error("Authentication failed: {0}")]
    Authentication(String),
    /// No session could be established; the user has to reconnect the service.
    #[error("Session invalid: {0}")]
    SessionInvalid(String),
    /// Still unauthorized after one refresh.
    #[error("Still unauthorized after refreshing the session")]
    PersistentUnauthorized,
    /// Provider does not implement the capability.
    #[error("Unsupported capability: {0}")]
    Unsupported(Capability),
    /// No factory registered for the provider kind.
    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(ProviderKind),
    /// The account has no such link.
    #[error("Unknown service link: {0}")]
    UnknownLink(ServiceLinkId),
    /// Provider did not answer in time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    /// The underlying call was aborted.
    #[error("Request cancelled")]
    Cancelled,
    /// Credential store failure.
    #[error("Credential store error: {0}")]
    Store(String),
    /// Internal provider error.
    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// How a failure should be presented to the user.
pub enum Severity {
    /// "Please reconnect this service."
    Reconnect,
    /// "Temporarily unavailable, retry."
    Unavailable,
}

impl PortError {
    /// User-facing class of the error.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            PortError::SessionInvalid(_)
            | PortError::PersistentUnauthorized
            | PortError::Authentication(_) => Severity::Reconnect,
            _ => Severity::Unavailable,
        }
    }
}

#[derive(Clone)]
/// Live authenticated handle returned by a provider login. Never persisted.
pub struct Session {
    /// Bearer or session token.
    pub access_token: String,
    /// Provider identifier of the student, when the provider needs it in URLs.
    pub user_id: Option<String>,
    /// Provider-specific values learned at login.
    pub extra: BTreeMap<String, String>,
    /// When the session was established.
    pub established_at: DateTime<Utc>,
    /// When the provider considers the token expired, if known.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Session established now with an unknown lifetime.
    #[must_use]
    pub fn new<S: Into<String>>(access_token: S) -> Self {
        Self {
            access_token: access_token.into(),
            user_id: None,
            extra: BTreeMap::new(),
            established_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Attach the student identifier.
    #[must_use]
    pub fn with_user<S: Into<String>>(mut self, user_id: S) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach a provider-specific value.
    #[must_use]
    pub fn with_extra<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Set the expiry from a lifetime in seconds reported by the provider.
    #[must_use]
    pub fn expiring_in(mut self, seconds: i64) -> Self {
        self.expires_at = TimeDelta::try_seconds(seconds).map(|lifetime| self.established_at + lifetime);
        self
    }

    /// Provider-specific value learned at login.
    #[must_use]
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }

    /// Student identifier learned at login.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::Internal`] when the login did not yield an identifier.
    pub fn require_user(&self) -> Result<&str, PortError> {
        self.user_id
            .as_deref()
            .ok_or_else(|| PortError::Internal("session carries no student id".to_owned()))
    }

    /// Whether the session is past its expiry, counting `skew` ahead.
    #[must_use]
    pub fn expires_within(&self, now: DateTime<Utc>, skew: TimeDelta) -> bool {
        self.expires_at
            .is_some_and(|expires_at| now + skew >= expires_at)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("extra", &self.extra)
            .field("established_at", &self.established_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone)]
/// Outcome of a successful login or token refresh.
pub struct Authenticated {
    /// The new live session.
    pub session: Session,
    /// Credentials to persist so a cold start can resume silently.
    pub additionals: Additionals,
    /// Capabilities disclosed by the handshake.
    pub capabilities: Vec<Capability>,
}

#[async_trait]
/// Contract every provider integration implements.
///
/// Fetch operations translate provider shapes into the shared domain model and
/// must be total: a value without a mapping degrades (for scores, to
/// [`crate::GradeScore::unknown`]) instead of failing. Operations a provider does
/// not support keep the default body, which reports [`PortError::Unsupported`].
///
/// A body-level "session expired" marker must be returned as
/// [`PortError::Unauthorized`] so the session wrapper can refresh.
pub trait ServicePlugin: Send + Sync {
    /// Provider this plugin talks to.
    fn kind(&self) -> ProviderKind;

    /// Declared token lifetime, used when the provider does not report an expiry.
    fn token_lifetime(&self) -> Option<TimeDelta> {
        None
    }

    /// Log in, or renew the session silently when the bag allows it.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::Authentication`] when the bag holds neither a renewal
    /// token nor a username and password, or when the provider rejects them.
    async fn refresh_account(&self, additionals: &Additionals) -> Result<Authenticated, PortError>;

    /// Lessons of one week.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the provider request fails.
    async fn weekly_timetable(
        &self,
        _session: &Session,
        _week: DateRange,
    ) -> Result<Vec<Course>, PortError> {
        Err(PortError::Unsupported(Capability::Timetable))
    }

    /// Grading periods.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the provider request fails.
    async fn grades_periods(&self, _session: &Session) -> Result<Vec<Period>, PortError> {
        Err(PortError::Unsupported(Capability::Grades))
    }

    /// Grades of one period.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the provider request fails.
    async fn grades_for_period(
        &self,
        _session: &Session,
        _period: &Period,
    ) -> Result<Vec<Grade>, PortError> {
        Err(PortError::Unsupported(Capability::Grades))
    }

    /// Attendance periods.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the provider request fails.
    async fn attendance_periods(&self, _session: &Session) -> Result<Vec<Period>, PortError> {
        Err(PortError::Unsupported(Capability::AttendancePeriods))
    }

    /// Attendance records of one period.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the provider request fails.
    async fn attendance_for_period(
        &self,
        _session: &Session,
        _period: &Period,
    ) -> Result<Attendance, PortError> {
        Err(PortError::Unsupported(Capability::Attendance))
    }

    /// Homework due within the range.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the provider request fails.
    async fn homework(
        &self,
        _session: &Session,
        _range: DateRange,
    ) -> Result<Vec<Homework>, PortError> {
        Err(PortError::Unsupported(Capability::Homework))
    }

    /// School announcements.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the provider request fails.
    async fn news(&self, _session: &Session) -> Result<Vec<News>, PortError> {
        Err(PortError::Unsupported(Capability::News))
    }

    /// Canteen menus of the week containing `date`.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the provider request fails.
    async fn weekly_canteen_menu(
        &self,
        _session: &Session,
        _date: NaiveDate,
    ) -> Result<Vec<CanteenMenu>, PortError> {
        Err(PortError::Unsupported(Capability::CanteenMenu))
    }

    /// Canteen card balances.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the provider request fails.
    async fn canteen_balances(&self, _session: &Session) -> Result<Vec<CanteenBalance>, PortError> {
        Err(PortError::Unsupported(Capability::CanteenBalance))
    }

    /// Discussion threads.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the provider request fails.
    async fn chats(&self, _session: &Session) -> Result<Vec<Chat>, PortError> {
        Err(PortError::Unsupported(Capability::ChatRead))
    }

    /// Messages of one thread.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the provider request fails.
    async fn chat_messages(
        &self,
        _session: &Session,
        _chat: &Chat,
    ) -> Result<Vec<ChatMessage>, PortError> {
        Err(PortError::Unsupported(Capability::ChatRead))
    }

    /// Reply in an existing thread.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the provider request fails.
    async fn send_message(
        &self,
        _session: &Session,
        _chat: &Chat,
        _body: &str,
    ) -> Result<(), PortError> {
        Err(PortError::Unsupported(Capability::ChatReply))
    }

    /// Start a new thread.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the provider request fails.
    async fn create_chat(
        &self,
        _session: &Session,
        _subject: &str,
        _body: &str,
        _recipients: &[String],
    ) -> Result<Chat, PortError> {
        Err(PortError::Unsupported(Capability::ChatCreate))
    }
}

#[async_trait]
/// Persistence for each link's credential bag. Opaque to the core.
pub trait CredentialStore: Send + Sync {
    /// Stored bag for a link, if any.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::Store`] when the backing store cannot be read.
    async fn load(
        &self,
        account: &AccountId,
        link: &ServiceLinkId,
    ) -> Result<Option<Additionals>, PortError>;

    /// Persist a link's bag, replacing the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::Store`] when the backing store cannot be written.
    async fn save(
        &self,
        account: &AccountId,
        link: &ServiceLinkId,
        additionals: &Additionals,
    ) -> Result<(), PortError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One provider failing while serving a federated request.
pub struct PartialFailure {
    /// Link that failed.
    pub link_id: ServiceLinkId,
    /// Provider behind the link.
    pub provider: ProviderKind,
    /// Capability being fetched.
    pub capability: Capability,
    /// How to present the failure.
    pub severity: Severity,
    /// Error description.
    pub message: String,
}

/// Receiver for non-fatal provider failures, e.g. to show a "degraded" banner.
pub trait NotificationSink: Send + Sync {
    /// Called once per failed provider call of a federated request.
    fn partial_failure(&self, failure: &PartialFailure);
}
