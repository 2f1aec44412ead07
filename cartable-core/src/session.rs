//! Session state machine wrapped around every provider call.
//!
//! ```text
//! NoSession -> Authenticating -> Ready -> (call) -> Ready
//!                                             \-> unauthorized -> Refreshing -> Ready | Failed
//! ```
//!
//! A call that comes back unauthorized triggers exactly one refresh and one
//! retry. Refreshes are single-flight per plugin: concurrent callers that hit
//! the same expired token wait for the refresh already in progress.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use reqwest::StatusCode;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::FederationConfig;
use crate::model::{
    Additionals, Attendance, CanteenBalance, CanteenMenu, Capability, Chat, ChatMessage, Course,
    DateRange, Grade, Homework, News, Period, ProviderKind, ServiceLinkId,
};
use crate::plugin::PluginContext;
use crate::ports::{Authenticated, CredentialStore, PortError, ServicePlugin, Session};

/// Boxed provider call handed to [`PluginHandle::request`].
pub type PortFuture<'f, T> = Pin<Box<dyn Future<Output = Result<T, PortError>> + Send + 'f>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where a plugin instance stands in the session lifecycle.
pub enum SessionState {
    /// Nothing established yet.
    NoSession,
    /// First login in progress.
    Authenticating,
    /// Session usable.
    Ready,
    /// Renewing after an unauthorized answer or an expiry.
    Refreshing,
    /// Last login or retry failed; the next call starts over.
    Failed,
}

/// Whether an error means the provider no longer accepts the session.
///
/// This is the single place the heuristic lives: an explicit
/// [`PortError::Unauthorized`], an HTTP 401 status on a transport error, or a
/// plain error message carrying a standalone `401` or the word `Unauthorized`.
/// Transport errors are judged by their status alone, since their message
/// embeds the request URL. Cancellations, timeouts and credential rejections
/// are never classified as unauthorized.
#[must_use]
pub fn is_unauthorized(error: &PortError) -> bool {
    match error {
        PortError::Unauthorized(_) | PortError::PersistentUnauthorized => true,
        PortError::Cancelled
        | PortError::Timeout(_)
        | PortError::SessionInvalid(_)
        | PortError::Authentication(_) => false,
        PortError::Network(source) => source.status() == Some(StatusCode::UNAUTHORIZED),
        other => mentions_unauthorized(&other.to_string()),
    }
}

fn mentions_unauthorized(message: &str) -> bool {
    message.contains("Unauthorized")
        || message
            .split(|symbol: char| !symbol.is_ascii_digit())
            .any(|token| token == "401")
}

struct SessionSlot {
    state: SessionState,
    session: Option<Arc<Session>>,
    generation: u64,
    additionals: Additionals,
    capabilities: Vec<Capability>,
    reconnect_reason: Option<String>,
}

/// One live plugin instance for one link, together with its session.
///
/// The account manager creates a new handle whenever the link's credentials
/// change, so a session never outlives the credentials it was built from.
pub struct PluginHandle {
    context: PluginContext,
    kind: ProviderKind,
    plugin: Arc<dyn ServicePlugin>,
    store: Arc<dyn CredentialStore>,
    config: FederationConfig,
    slot: RwLock<SessionSlot>,
    refresh_lock: Mutex<()>,
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("link_id", &self.context.link_id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl PluginHandle {
    /// Wrap a freshly created plugin.
    ///
    /// `capabilities` are the ones remembered on the link from an earlier login;
    /// they are replaced by whatever the next login discloses.
    #[must_use]
    pub fn new(
        context: PluginContext,
        plugin: Arc<dyn ServicePlugin>,
        additionals: Additionals,
        capabilities: Vec<Capability>,
        store: Arc<dyn CredentialStore>,
        config: FederationConfig,
    ) -> Self {
        Self {
            kind: plugin.kind(),
            context,
            plugin,
            store,
            config,
            slot: RwLock::new(SessionSlot {
                state: SessionState::NoSession,
                session: None,
                generation: 0,
                additionals,
                capabilities,
                reconnect_reason: None,
            }),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Link served by this handle.
    #[must_use]
    pub fn link_id(&self) -> &ServiceLinkId {
        &self.context.link_id
    }

    /// Provider behind the link.
    #[must_use]
    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> SessionState {
        self.slot.read().await.state
    }

    /// Capabilities known for the link.
    pub async fn capabilities(&self) -> Vec<Capability> {
        self.slot.read().await.capabilities.clone()
    }

    /// Whether the link is known to expose `capability`.
    pub async fn supports(&self, capability: Capability) -> bool {
        self.slot.read().await.capabilities.contains(&capability)
    }

    /// Credentials as last persisted.
    pub async fn additionals(&self) -> Additionals {
        self.slot.read().await.additionals.clone()
    }

    /// Make sure a session exists, logging in if needed.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::SessionInvalid`] when the login fails.
    pub async fn authenticate(&self) -> Result<(), PortError> {
        self.session().await.map(|_session| ())
    }

    async fn session(&self) -> Result<(Arc<Session>, u64), PortError> {
        {
            let slot = self.slot.read().await;
            if let Some(reason) = &slot.reconnect_reason {
                return Err(PortError::SessionInvalid(reason.clone()));
            }
            if let Some(session) = slot.session.as_ref().filter(|session| !self.expired(session)) {
                return Ok((Arc::clone(session), slot.generation));
            }
        }
        self.establish(None).await
    }

    fn expired(&self, session: &Session) -> bool {
        self.config.proactive_refresh
            && session.expires_within(Utc::now(), self.config.expiry_skew())
    }

    /// Log in or refresh. `rejected` is the generation of a session the provider
    /// just refused; if another caller already replaced it, that session is reused.
    async fn establish(&self, rejected: Option<u64>) -> Result<(Arc<Session>, u64), PortError> {
        let _flight = self.refresh_lock.lock().await;

        let additionals = {
            let mut slot = self.slot.write().await;
            if let Some(reason) = &slot.reconnect_reason {
                return Err(PortError::SessionInvalid(reason.clone()));
            }
            if let Some(session) = &slot.session {
                let usable = match rejected {
                    Some(generation) => slot.generation != generation,
                    None => !self.expired(session),
                };
                if usable {
                    debug!(link = %self.context.link_id, "reusing session from concurrent refresh");
                    return Ok((Arc::clone(session), slot.generation));
                }
            }
            slot.state = if rejected.is_some() || slot.session.is_some() {
                SessionState::Refreshing
            } else {
                SessionState::Authenticating
            };
            debug!(link = %self.context.link_id, state = ?slot.state, "establishing session");
            slot.additionals.clone()
        };

        match self.plugin.refresh_account(&additionals).await {
            Ok(authenticated) => Ok(self.install(authenticated).await),
            Err(error) => Err(self.fail_login(error).await),
        }
    }

    async fn install(&self, authenticated: Authenticated) -> (Arc<Session>, u64) {
        let Authenticated {
            mut session,
            additionals,
            capabilities,
        } = authenticated;
        if session.expires_at.is_none() {
            session.expires_at = self
                .plugin
                .token_lifetime()
                .map(|lifetime| session.established_at + lifetime);
        }

        if let Err(error) = self
            .store
            .save(&self.context.account_id, &self.context.link_id, &additionals)
            .await
        {
            warn!(link = %self.context.link_id, %error, "could not persist refreshed credentials");
        }

        let session = Arc::new(session);
        let mut slot = self.slot.write().await;
        slot.generation = slot.generation.wrapping_add(1);
        slot.session = Some(Arc::clone(&session));
        slot.state = SessionState::Ready;
        slot.additionals = additionals;
        slot.capabilities = capabilities;
        info!(
            link = %self.context.link_id,
            provider = %self.kind,
            capabilities = slot.capabilities.len(),
            "session established"
        );
        (session, slot.generation)
    }

    async fn fail_login(&self, error: PortError) -> PortError {
        let mut slot = self.slot.write().await;
        slot.session = None;
        if matches!(error, PortError::Cancelled) {
            slot.state = SessionState::NoSession;
            return error;
        }

        slot.state = SessionState::Failed;
        let rejected = matches!(error, PortError::Authentication(_)) || is_unauthorized(&error);
        warn!(link = %self.context.link_id, %error, rejected, "login failed");
        let reason = error.to_string();
        if rejected {
            slot.reconnect_reason = Some(reason.clone());
        }
        PortError::SessionInvalid(reason)
    }

    async fn mark_failed(&self) {
        let mut slot = self.slot.write().await;
        slot.session = None;
        slot.state = SessionState::Failed;
    }

    /// Run `op` with a live session, refreshing and retrying once on unauthorized.
    ///
    /// # Errors
    ///
    /// - [`PortError::SessionInvalid`] when no session can be established.
    /// - [`PortError::PersistentUnauthorized`] when the retried call is still unauthorized.
    /// - Any other error from `op`, unmodified and not retried.
    pub async fn request<'f, T, F>(&self, capability: Capability, op: F) -> Result<T, PortError>
    where
        F: Fn(Arc<dyn ServicePlugin>, Arc<Session>) -> PortFuture<'f, T> + Send + Sync,
        T: Send,
    {
        let (session, generation) = self.session().await?;
        let error = match op(Arc::clone(&self.plugin), session).await {
            Ok(value) => return Ok(value),
            Err(error) if is_unauthorized(&error) => error,
            Err(error) => return Err(error),
        };

        warn!(
            link = %self.context.link_id,
            %capability,
            %error,
            "provider refused the session, refreshing once"
        );
        let (session, _generation) = self.establish(Some(generation)).await?;
        match op(Arc::clone(&self.plugin), session).await {
            Ok(value) => Ok(value),
            Err(retry_error) if is_unauthorized(&retry_error) => {
                self.mark_failed().await;
                warn!(
                    link = %self.context.link_id,
                    %capability,
                    error = %retry_error,
                    "still unauthorized after refresh"
                );
                Err(PortError::PersistentUnauthorized)
            }
            Err(retry_error) => Err(retry_error),
        }
    }

    /// Lessons of one week.
    ///
    /// # Errors
    ///
    /// See [`PluginHandle::request`].
    pub async fn weekly_timetable(&self, week: DateRange) -> Result<Vec<Course>, PortError> {
        self.request(Capability::Timetable, move |plugin, session| {
            Box::pin(async move { plugin.weekly_timetable(&session, week).await })
        })
        .await
    }

    /// Grading periods.
    ///
    /// # Errors
    ///
    /// See [`PluginHandle::request`].
    pub async fn grades_periods(&self) -> Result<Vec<Period>, PortError> {
        self.request(Capability::Grades, |plugin, session| {
            Box::pin(async move { plugin.grades_periods(&session).await })
        })
        .await
    }

    /// Grades of one period.
    ///
    /// # Errors
    ///
    /// See [`PluginHandle::request`].
    pub async fn grades_for_period(&self, period: &Period) -> Result<Vec<Grade>, PortError> {
        self.request(Capability::Grades, move |plugin, session| {
            Box::pin(async move { plugin.grades_for_period(&session, period).await })
        })
        .await
    }

    /// Attendance periods.
    ///
    /// # Errors
    ///
    /// See [`PluginHandle::request`].
    pub async fn attendance_periods(&self) -> Result<Vec<Period>, PortError> {
        self.request(Capability::AttendancePeriods, |plugin, session| {
            Box::pin(async move { plugin.attendance_periods(&session).await })
        })
        .await
    }

    /// Attendance records of one period.
    ///
    /// # Errors
    ///
    /// See [`PluginHandle::request`].
    pub async fn attendance_for_period(&self, period: &Period) -> Result<Attendance, PortError> {
        self.request(Capability::Attendance, move |plugin, session| {
            Box::pin(async move { plugin.attendance_for_period(&session, period).await })
        })
        .await
    }

    /// Homework due within the range.
    ///
    /// # Errors
    ///
    /// See [`PluginHandle::request`].
    pub async fn homework(&self, range: DateRange) -> Result<Vec<Homework>, PortError> {
        self.request(Capability::Homework, move |plugin, session| {
            Box::pin(async move { plugin.homework(&session, range).await })
        })
        .await
    }

    /// School announcements.
    ///
    /// # Errors
    ///
    /// See [`PluginHandle::request`].
    pub async fn news(&self) -> Result<Vec<News>, PortError> {
        self.request(Capability::News, |plugin, session| {
            Box::pin(async move { plugin.news(&session).await })
        })
        .await
    }

    /// Canteen menus of the week containing `date`.
    ///
    /// # Errors
    ///
    /// See [`PluginHandle::request`].
    pub async fn weekly_canteen_menu(&self, date: NaiveDate) -> Result<Vec<CanteenMenu>, PortError> {
        self.request(Capability::CanteenMenu, move |plugin, session| {
            Box::pin(async move { plugin.weekly_canteen_menu(&session, date).await })
        })
        .await
    }

    /// Canteen card balances.
    ///
    /// # Errors
    ///
    /// See [`PluginHandle::request`].
    pub async fn canteen_balances(&self) -> Result<Vec<CanteenBalance>, PortError> {
        self.request(Capability::CanteenBalance, |plugin, session| {
            Box::pin(async move { plugin.canteen_balances(&session).await })
        })
        .await
    }

    /// Discussion threads.
    ///
    /// # Errors
    ///
    /// See [`PluginHandle::request`].
    pub async fn chats(&self) -> Result<Vec<Chat>, PortError> {
        self.request(Capability::ChatRead, |plugin, session| {
            Box::pin(async move { plugin.chats(&session).await })
        })
        .await
    }

    /// Messages of one thread.
    ///
    /// # Errors
    ///
    /// See [`PluginHandle::request`].
    pub async fn chat_messages(&self, chat: &Chat) -> Result<Vec<ChatMessage>, PortError> {
        self.request(Capability::ChatRead, move |plugin, session| {
            Box::pin(async move { plugin.chat_messages(&session, chat).await })
        })
        .await
    }

    /// Reply in an existing thread.
    ///
    /// # Errors
    ///
    /// See [`PluginHandle::request`].
    pub async fn send_message(&self, chat: &Chat, body: &str) -> Result<(), PortError> {
        self.request(Capability::ChatReply, move |plugin, session| {
            Box::pin(async move { plugin.send_message(&session, chat, body).await })
        })
        .await
    }

    /// Start a new thread.
    ///
    /// # Errors
    ///
    /// See [`PluginHandle::request`].
    pub async fn create_chat(
        &self,
        subject: &str,
        body: &str,
        recipients: &[String],
    ) -> Result<Chat, PortError> {
        self.request(Capability::ChatCreate, move |plugin, session| {
            Box::pin(async move { plugin.create_chat(&session, subject, body, recipients).await })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::TimeDelta;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::model::{AccountId, keys};
    use crate::store::MemoryCredentialStore;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Healthy,
        ServerError,
        FirstTokenRefused,
        AlwaysRefused,
        Garbled,
        Cancelled,
        RejectsLogin,
    }

    struct FakePlugin {
        behaviour: Behaviour,
        lifetime: Option<TimeDelta>,
        login_delay: Duration,
        endpoint: String,
        logins: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FakePlugin {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                lifetime: None,
                login_delay: Duration::ZERO,
                endpoint: String::new(),
                logins: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }

        fn logins(&self) -> usize {
            self.logins.load(Ordering::SeqCst)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ServicePlugin for FakePlugin {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Pronote
        }

        fn token_lifetime(&self) -> Option<TimeDelta> {
            self.lifetime
        }

        async fn refresh_account(
            &self,
            additionals: &Additionals,
        ) -> Result<Authenticated, PortError> {
            let login = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.login_delay).await;
            if matches!(self.behaviour, Behaviour::RejectsLogin) {
                return Err(PortError::Authentication("bad password".into()));
            }
            Ok(Authenticated {
                session: Session::new(format!("token-{login}")),
                additionals: additionals
                    .clone()
                    .with(keys::REFRESH_TOKEN, format!("renewal-{login}")),
                capabilities: vec![Capability::News, Capability::Refresh],
            })
        }

        async fn news(&self, session: &Session) -> Result<Vec<News>, PortError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Healthy | Behaviour::RejectsLogin => Ok(Vec::new()),
                Behaviour::FirstTokenRefused if session.access_token == "token-1" => {
                    Err(PortError::Unauthorized("HTTP 401".into()))
                }
                Behaviour::FirstTokenRefused => Ok(Vec::new()),
                Behaviour::AlwaysRefused => {
                    Err(PortError::Internal("upstream answered Unauthorized".into()))
                }
                Behaviour::Garbled => Err(PortError::Decode("unexpected end of input".into())),
                Behaviour::ServerError => {
                    crate::http::send(reqwest::Client::new().get(&self.endpoint)).await?;
                    Ok(Vec::new())
                }
                Behaviour::Cancelled => Err(PortError::Cancelled),
            }
        }
    }

    fn handle_with(
        plugin: Arc<FakePlugin>,
        store: Arc<MemoryCredentialStore>,
        config: FederationConfig,
    ) -> PluginHandle {
        PluginHandle::new(
            PluginContext {
                account_id: AccountId("acc".into()),
                link_id: ServiceLinkId("pronote".into()),
            },
            plugin,
            Additionals::new()
                .with(keys::USERNAME, "jeanne")
                .with(keys::PASSWORD, "secret"),
            Vec::new(),
            store,
            config,
        )
    }

    fn handle(plugin: &Arc<FakePlugin>) -> PluginHandle {
        handle_with(
            Arc::clone(plugin),
            Arc::new(MemoryCredentialStore::new()),
            FederationConfig::default(),
        )
    }

    #[test]
    fn classifier_recognizes_unauthorized_markers() {
        assert!(is_unauthorized(&PortError::Unauthorized("expired".into())));
        assert!(is_unauthorized(&PortError::Internal("status 401 returned".into())));
        assert!(is_unauthorized(&PortError::Decode("Unauthorized".into())));
        assert!(!is_unauthorized(&PortError::Decode("line 4012 column 3".into())));
        assert!(!is_unauthorized(&PortError::Cancelled));
        assert!(!is_unauthorized(&PortError::Timeout(Duration::from_secs(1))));
        assert!(!is_unauthorized(&PortError::SessionInvalid(
            "Unauthorized: HTTP 401".into()
        )));
    }

    #[test]
    fn debug_output_hides_credentials() {
        let plugin = Arc::new(FakePlugin::new(Behaviour::Healthy));
        let rendered = format!("{:?}", handle(&plugin));
        assert!(rendered.contains("pronote"));
        assert!(rendered.contains("Pronote"));
        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("jeanne"));
    }

    #[tokio::test]
    async fn first_call_logs_in_and_discovers_capabilities() {
        let plugin = Arc::new(FakePlugin::new(Behaviour::Healthy));
        let handle = handle(&plugin);
        assert_eq!(handle.state().await, SessionState::NoSession);
        assert!(!handle.supports(Capability::News).await);

        handle.news().await.expect("news");
        assert_eq!(plugin.logins(), 1);
        assert_eq!(handle.state().await, SessionState::Ready);
        assert!(handle.supports(Capability::News).await);

        handle.news().await.expect("news again");
        assert_eq!(plugin.logins(), 1);
    }

    #[tokio::test]
    async fn refreshes_once_and_retries_after_unauthorized() {
        let plugin = Arc::new(FakePlugin::new(Behaviour::FirstTokenRefused));
        let handle = handle(&plugin);
        handle.authenticate().await.expect("login");
        assert_eq!(plugin.logins(), 1);

        handle.news().await.expect("retried call succeeds");
        assert_eq!(plugin.logins(), 2, "exactly one refresh");
        assert_eq!(plugin.calls(), 2);
        assert_eq!(handle.state().await, SessionState::Ready);
    }

    #[tokio::test]
    async fn gives_up_after_one_refresh() {
        let plugin = Arc::new(FakePlugin::new(Behaviour::AlwaysRefused));
        let handle = handle(&plugin);
        handle.authenticate().await.expect("login");

        let err = handle.news().await.expect_err("still unauthorized");
        assert!(matches!(err, PortError::PersistentUnauthorized));
        assert_eq!(plugin.logins(), 2, "exactly one refresh");
        assert_eq!(plugin.calls(), 2);
        assert_eq!(handle.state().await, SessionState::Failed);

        // The next call starts over with a fresh login.
        let err = handle.news().await.expect_err("still unauthorized");
        assert!(matches!(err, PortError::PersistentUnauthorized));
        assert_eq!(plugin.logins(), 4);
    }

    #[tokio::test]
    async fn other_errors_propagate_without_refresh() {
        let plugin = Arc::new(FakePlugin::new(Behaviour::Garbled));
        let handle = handle(&plugin);

        let err = handle.news().await.expect_err("decode failure");
        assert!(matches!(err, PortError::Decode(_)));
        assert_eq!(plugin.logins(), 1);
        assert_eq!(plugin.calls(), 1);
    }

    #[tokio::test]
    async fn status_decides_for_transport_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/comptes/hotes/401/3"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/comptes/hotes/12/3"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = crate::http::send(client.get(format!("{}/v1/comptes/hotes/401/3", server.uri())))
            .await
            .expect_err("500 must fail");
        assert!(matches!(err, PortError::Network(_)));
        assert!(err.to_string().contains("401"));
        assert!(!is_unauthorized(&err));

        let err = client
            .get(format!("{}/v1/comptes/hotes/12/3", server.uri()))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .expect_err("401 must fail");
        assert!(is_unauthorized(&PortError::Network(err)));
    }

    #[tokio::test]
    async fn server_errors_on_401_paths_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/discussions/401/messages"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut fake = FakePlugin::new(Behaviour::ServerError);
        fake.endpoint = format!("{}/api/discussions/401/messages", server.uri());
        let plugin = Arc::new(fake);
        let handle = handle(&plugin);

        let err = handle.news().await.expect_err("server error");
        assert!(matches!(err, PortError::Network(_)));
        assert_eq!(plugin.logins(), 1, "no refresh");
        assert_eq!(plugin.calls(), 1, "no retry");
        assert_eq!(handle.state().await, SessionState::Ready);
    }

    #[tokio::test]
    async fn cancellation_never_triggers_a_refresh() {
        let plugin = Arc::new(FakePlugin::new(Behaviour::Cancelled));
        let handle = handle(&plugin);

        let err = handle.news().await.expect_err("cancelled");
        assert!(matches!(err, PortError::Cancelled));
        assert_eq!(plugin.logins(), 1);
    }

    #[tokio::test]
    async fn rejected_login_requires_reconnection() {
        let plugin = Arc::new(FakePlugin::new(Behaviour::RejectsLogin));
        let handle = handle(&plugin);

        let err = handle.news().await.expect_err("login refused");
        assert!(matches!(err, PortError::SessionInvalid(_)));
        assert_eq!(handle.state().await, SessionState::Failed);

        let err = handle.news().await.expect_err("still refused");
        assert!(matches!(err, PortError::SessionInvalid(_)));
        assert_eq!(plugin.logins(), 1, "no automatic retry of a refused login");
        assert_eq!(plugin.calls(), 0);
    }

    #[tokio::test]
    async fn refreshed_credentials_are_persisted() {
        let plugin = Arc::new(FakePlugin::new(Behaviour::Healthy));
        let store = Arc::new(MemoryCredentialStore::new());
        let handle = handle_with(
            Arc::clone(&plugin),
            Arc::clone(&store),
            FederationConfig::default(),
        );
        handle.authenticate().await.expect("login");

        let saved = store
            .load(&AccountId("acc".into()), &ServiceLinkId("pronote".into()))
            .await
            .expect("load")
            .expect("bag saved");
        assert_eq!(saved.get(keys::REFRESH_TOKEN), Some("renewal-1"));
        assert_eq!(saved.get(keys::USERNAME), Some("jeanne"));
        assert_eq!(handle.additionals().await, saved);
    }

    #[tokio::test]
    async fn expired_tokens_are_refreshed_before_the_call() {
        let mut fake = FakePlugin::new(Behaviour::Healthy);
        fake.lifetime = Some(TimeDelta::zero());
        let plugin = Arc::new(fake);
        let handle = handle(&plugin);

        handle.news().await.expect("first");
        handle.news().await.expect("second");
        assert_eq!(plugin.logins(), 2);
        assert_eq!(plugin.calls(), 2);
    }

    #[tokio::test]
    async fn proactive_refresh_can_be_disabled() {
        let mut fake = FakePlugin::new(Behaviour::Healthy);
        fake.lifetime = Some(TimeDelta::zero());
        let plugin = Arc::new(fake);
        let config = FederationConfig {
            proactive_refresh: false,
            ..FederationConfig::default()
        };
        let handle = handle_with(
            Arc::clone(&plugin),
            Arc::new(MemoryCredentialStore::new()),
            config,
        );

        handle.news().await.expect("first");
        handle.news().await.expect("second");
        assert_eq!(plugin.logins(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let mut fake = FakePlugin::new(Behaviour::FirstTokenRefused);
        fake.login_delay = Duration::from_millis(50);
        let plugin = Arc::new(fake);
        let handle = handle(&plugin);
        handle.authenticate().await.expect("login");

        let (first, second) = tokio::join!(handle.news(), handle.news());
        first.expect("first caller");
        second.expect("second caller");
        assert_eq!(plugin.logins(), 2, "one login plus one shared refresh");
        assert_eq!(plugin.calls(), 4);
    }
}
