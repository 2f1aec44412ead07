//! Account-level facade: one plugin instance per link, capability routing and
//! partial-failure merging.

use std::cmp::Reverse;
use std::future::Future;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::FederationConfig;
use crate::model::{
    Account, AccountId, Additionals, Attendance, CanteenBalance, CanteenMenu, Capability, Chat,
    ChatMessage, Course, DateRange, Grade, Homework, News, Period, ServiceLink, ServiceLinkId,
};
use crate::plugin::{PluginContext, ProviderRegistry};
use crate::ports::{CredentialStore, NotificationSink, PartialFailure, PortError};
use crate::session::{PluginHandle, PortFuture};

#[derive(Debug, Clone, PartialEq)]
/// Data merged from every provider that answered, plus the ones that did not.
pub struct Federated<T> {
    /// Merged results of the successful providers.
    pub data: T,
    /// Providers that failed; already reported to the notification sink.
    pub failures: Vec<PartialFailure>,
}

impl<T> Federated<T> {
    /// Whether at least one provider failed.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Public entry point for everything a linked provider can serve.
///
/// Constructed explicitly with its collaborators; holds one [`PluginHandle`]
/// per link of the account.
pub struct AccountManager {
    account_id: AccountId,
    account: RwLock<Account>,
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn CredentialStore>,
    sink: Arc<dyn NotificationSink>,
    config: FederationConfig,
    handles: RwLock<Vec<Arc<PluginHandle>>>,
}

impl AccountManager {
    /// Create a manager and instantiate a plugin for every link of `account`.
    ///
    /// Credentials in the store take precedence over the ones on the link.
    /// Links whose provider is not registered are skipped with a warning.
    pub async fn new(
        account: Account,
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn CredentialStore>,
        sink: Arc<dyn NotificationSink>,
        config: FederationConfig,
    ) -> Self {
        let manager = Self {
            account_id: account.id.clone(),
            account: RwLock::new(account.clone()),
            registry,
            store,
            sink,
            config,
            handles: RwLock::new(Vec::new()),
        };

        let mut handles = Vec::with_capacity(account.links.len());
        for mut link in account.links {
            match manager.store.load(&account.id, &link.id).await {
                Ok(Some(stored)) => link.additionals = stored,
                Ok(None) => {}
                Err(error) => {
                    warn!(link = %link.id, %error, "credential store unavailable, using link credentials");
                }
            }
            match manager.instantiate(&link) {
                Ok(handle) => handles.push(handle),
                Err(error) => warn!(link = %link.id, %error, "skipping link"),
            }
        }
        *manager.handles.write().await = handles;
        manager
    }

    fn instantiate(&self, link: &ServiceLink) -> Result<Arc<PluginHandle>, PortError> {
        let context = PluginContext {
            account_id: self.account_id.clone(),
            link_id: link.id.clone(),
        };
        let plugin = self.registry.instantiate(link.provider, context.clone())?;
        Ok(Arc::new(PluginHandle::new(
            context,
            plugin,
            link.additionals.clone(),
            link.capabilities.clone(),
            Arc::clone(&self.store),
            self.config.clone(),
        )))
    }

    /// Snapshot of the account, with capabilities learned since construction.
    pub async fn account(&self) -> Account {
        let mut account = self.account.read().await.clone();
        for handle in self.handles.read().await.iter() {
            if let Some(link) = account
                .links
                .iter_mut()
                .find(|link| &link.id == handle.link_id())
            {
                link.capabilities = handle.capabilities().await;
                link.additionals = handle.additionals().await;
            }
        }
        account
    }

    /// Handle serving a link.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::UnknownLink`] when the account has no such link.
    pub async fn handle(&self, link_id: &ServiceLinkId) -> Result<Arc<PluginHandle>, PortError> {
        self.handles
            .read()
            .await
            .iter()
            .find(|handle| handle.link_id() == link_id)
            .cloned()
            .ok_or_else(|| PortError::UnknownLink(link_id.clone()))
    }

    /// Every plugin known to expose `capability`. An empty result is not an error.
    ///
    /// Links that never logged in have no known capabilities yet; call
    /// [`AccountManager::discover`] first to include them.
    pub async fn resolve(&self, capability: Capability) -> Vec<Arc<PluginHandle>> {
        let handles = self.handles.read().await.clone();
        let mut matching = Vec::with_capacity(handles.len());
        for handle in handles {
            if handle.supports(capability).await {
                matching.push(handle);
            }
        }
        debug!(%capability, providers = matching.len(), "resolved capability");
        matching
    }

    /// Log into every link whose capabilities are still unknown, concurrently,
    /// so that [`AccountManager::resolve`] can see them.
    pub async fn discover(&self) -> Vec<PartialFailure> {
        let mut pending = Vec::new();
        for handle in self.handles.read().await.iter() {
            if handle.capabilities().await.is_empty() {
                pending.push(Arc::clone(handle));
            }
        }

        let outcomes = self
            .join_all(pending, |handle| {
                Box::pin(async move { handle.authenticate().await })
            })
            .await;

        let mut failures = Vec::new();
        for (handle, outcome) in outcomes {
            if let Err(error) = outcome {
                failures.push(self.report(&handle, Capability::Refresh, &error));
            }
        }
        failures
    }

    /// Attach a new link, replacing any link with the same identifier.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::UnsupportedProvider`] when the provider is not registered.
    pub async fn link(&self, link: ServiceLink) -> Result<(), PortError> {
        let handle = self.instantiate(&link)?;
        self.store
            .save(&self.account_id, &link.id, &link.additionals)
            .await?;
        self.replace_handle(handle).await;
        self.account.write().await.upsert_link(link);
        Ok(())
    }

    /// Detach a link and drop its plugin instance.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::UnknownLink`] when the account has no such link.
    pub async fn unlink(&self, link_id: &ServiceLinkId) -> Result<ServiceLink, PortError> {
        let removed = self
            .account
            .write()
            .await
            .remove_link(link_id)
            .ok_or_else(|| PortError::UnknownLink(link_id.clone()))?;
        self.handles
            .write()
            .await
            .retain(|handle| handle.link_id() != link_id);
        Ok(removed)
    }

    /// Store new credentials for a link and recreate its plugin instance, so the
    /// previous in-memory session is discarded.
    ///
    /// Capabilities learned by the previous instance carry over, so the link
    /// keeps serving fan-out calls until the next login refreshes them.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::UnknownLink`] for an unknown link, or a store error.
    pub async fn update_credentials(
        &self,
        link_id: &ServiceLinkId,
        additionals: Additionals,
    ) -> Result<(), PortError> {
        let mut link = self
            .account
            .read()
            .await
            .link(link_id)
            .cloned()
            .ok_or_else(|| PortError::UnknownLink(link_id.clone()))?;
        link.additionals = additionals;
        link.updated_at = Utc::now();
        if let Ok(previous) = self.handle(link_id).await {
            let learned = previous.capabilities().await;
            if !learned.is_empty() {
                link.capabilities = learned;
            }
        }

        let handle = self.instantiate(&link)?;
        self.store
            .save(&self.account_id, &link.id, &link.additionals)
            .await?;
        self.replace_handle(handle).await;
        self.account.write().await.upsert_link(link);
        debug!(link = %link_id, "plugin recreated after credential update");
        Ok(())
    }

    async fn replace_handle(&self, handle: Arc<PluginHandle>) {
        let mut handles = self.handles.write().await;
        match handles
            .iter_mut()
            .find(|existing| existing.link_id() == handle.link_id())
        {
            Some(existing) => *existing = handle,
            None => handles.push(handle),
        }
    }

    /// Lessons of one week from every timetable provider, by start time.
    pub async fn weekly_timetable(&self, week: DateRange) -> Federated<Vec<Course>> {
        let mut merged = self
            .fan_out(Capability::Timetable, move |handle| {
                Box::pin(async move { handle.weekly_timetable(week).await })
            })
            .await;
        merged.data.sort_by_key(|course| course.start);
        merged
    }

    /// Grading periods of every grades provider, by start date.
    pub async fn grades_periods(&self) -> Federated<Vec<Period>> {
        let mut merged = self
            .fan_out(Capability::Grades, |handle| {
                Box::pin(async move { handle.grades_periods().await })
            })
            .await;
        merged.data.sort_by_key(|period| period.start);
        merged
    }

    /// Attendance periods of every attendance provider, by start date.
    pub async fn attendance_periods(&self) -> Federated<Vec<Period>> {
        let mut merged = self
            .fan_out(Capability::AttendancePeriods, |handle| {
                Box::pin(async move { handle.attendance_periods().await })
            })
            .await;
        merged.data.sort_by_key(|period| period.start);
        merged
    }

    /// Homework due within the range, by due date.
    pub async fn homework(&self, range: DateRange) -> Federated<Vec<Homework>> {
        let mut merged = self
            .fan_out(Capability::Homework, move |handle| {
                Box::pin(async move { handle.homework(range).await })
            })
            .await;
        merged.data.sort_by_key(|homework| homework.due_at);
        merged
    }

    /// Announcements from every news provider, newest first.
    pub async fn news(&self) -> Federated<Vec<News>> {
        let mut merged = self
            .fan_out(Capability::News, |handle| {
                Box::pin(async move { handle.news().await })
            })
            .await;
        merged.data.sort_by_key(|news| Reverse(news.published_at));
        merged
    }

    /// Canteen menus of the week containing `date`, by day.
    pub async fn weekly_canteen_menu(&self, date: NaiveDate) -> Federated<Vec<CanteenMenu>> {
        let mut merged = self
            .fan_out(Capability::CanteenMenu, move |handle| {
                Box::pin(async move { handle.weekly_canteen_menu(date).await })
            })
            .await;
        merged.data.sort_by_key(|menu| menu.date);
        merged
    }

    /// Balances of every canteen card.
    pub async fn canteen_balances(&self) -> Federated<Vec<CanteenBalance>> {
        self.fan_out(Capability::CanteenBalance, |handle| {
            Box::pin(async move { handle.canteen_balances().await })
        })
        .await
    }

    /// Discussion threads, most recent first.
    pub async fn chats(&self) -> Federated<Vec<Chat>> {
        let mut merged = self
            .fan_out(Capability::ChatRead, |handle| {
                Box::pin(async move { handle.chats().await })
            })
            .await;
        merged.data.sort_by_key(|chat| Reverse(chat.last_message_at));
        merged
    }

    /// Grades of a period, from the link that reported the period.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::UnknownLink`], [`PortError::Timeout`] or the provider error.
    pub async fn grades_for_period(&self, period: &Period) -> Result<Vec<Grade>, PortError> {
        let handle = self.handle(&period.link_id).await?;
        self.with_timeout(handle.grades_for_period(period)).await
    }

    /// Attendance of a period, from the link that reported the period.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::UnknownLink`], [`PortError::Timeout`] or the provider error.
    pub async fn attendance_for_period(&self, period: &Period) -> Result<Attendance, PortError> {
        let handle = self.handle(&period.link_id).await?;
        self.with_timeout(handle.attendance_for_period(period)).await
    }

    /// Messages of a thread, from the link that reported it.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::UnknownLink`], [`PortError::Timeout`] or the provider error.
    pub async fn chat_messages(&self, chat: &Chat) -> Result<Vec<ChatMessage>, PortError> {
        let handle = self.handle(&chat.link_id).await?;
        self.with_timeout(handle.chat_messages(chat)).await
    }

    /// Reply in a thread through the link that reported it.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::UnknownLink`], [`PortError::Timeout`] or the provider error.
    pub async fn send_message(&self, chat: &Chat, body: &str) -> Result<(), PortError> {
        let handle = self.handle(&chat.link_id).await?;
        self.with_timeout(handle.send_message(chat, body)).await
    }

    /// Start a thread through a specific link.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::UnknownLink`], [`PortError::Timeout`] or the provider error.
    pub async fn create_chat(
        &self,
        link_id: &ServiceLinkId,
        subject: &str,
        body: &str,
        recipients: &[String],
    ) -> Result<Chat, PortError> {
        let handle = self.handle(link_id).await?;
        self.with_timeout(handle.create_chat(subject, body, recipients))
            .await
    }

    async fn with_timeout<T, F>(&self, call: F) -> Result<T, PortError>
    where
        F: Future<Output = Result<T, PortError>>,
    {
        let limit = self.config.call_timeout();
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(PortError::Timeout(limit)))
    }

    /// Run `op` on every plugin resolved for `capability`, concurrently, and merge
    /// the successful results. Failures are reported, never returned.
    async fn fan_out<T, F>(&self, capability: Capability, op: F) -> Federated<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(Arc<PluginHandle>) -> PortFuture<'static, Vec<T>>,
    {
        let handles = self.resolve(capability).await;
        let outcomes = self.join_all(handles, op).await;

        let mut merged = Federated {
            data: Vec::new(),
            failures: Vec::new(),
        };
        for (handle, outcome) in outcomes {
            match outcome {
                Ok(items) => merged.data.extend(items),
                Err(error) => merged
                    .failures
                    .push(self.report(&handle, capability, &error)),
            }
        }
        merged
    }

    /// Spawn one timed call per handle and wait for all of them. Outcomes come
    /// back in handle order. Dropping the future aborts the calls still running.
    async fn join_all<T, F>(
        &self,
        handles: Vec<Arc<PluginHandle>>,
        op: F,
    ) -> Vec<(Arc<PluginHandle>, Result<T, PortError>)>
    where
        T: Send + 'static,
        F: Fn(Arc<PluginHandle>) -> PortFuture<'static, T>,
    {
        let limit = self.config.call_timeout();
        let mut tasks = JoinSet::new();
        for (index, handle) in handles.iter().enumerate() {
            let call = op(Arc::clone(handle));
            tasks.spawn(async move {
                let outcome = tokio::time::timeout(limit, call)
                    .await
                    .unwrap_or(Err(PortError::Timeout(limit)));
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<Result<T, PortError>>> =
            handles.iter().map(|_handle| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    if let Some(slot) = outcomes.get_mut(index) {
                        *slot = Some(outcome);
                    }
                }
                Err(error) => warn!(%error, "provider task aborted"),
            }
        }

        handles
            .into_iter()
            .zip(outcomes)
            .map(|(handle, outcome)| {
                let outcome = outcome.unwrap_or_else(|| {
                    Err(PortError::Internal("provider task aborted".to_owned()))
                });
                (handle, outcome)
            })
            .collect()
    }

    fn report(
        &self,
        handle: &PluginHandle,
        capability: Capability,
        error: &PortError,
    ) -> PartialFailure {
        let failure = PartialFailure {
            link_id: handle.link_id().clone(),
            provider: handle.kind(),
            capability,
            severity: error.severity(),
            message: error.to_string(),
        };
        self.sink.partial_failure(&failure);
        failure
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::model::{Dish, DishCategory, GradeScore, ProviderKind, SubjectId, keys};
    use crate::plugin::{ProviderEntry, ProviderMeta};
    use crate::ports::{Authenticated, ServicePlugin, Session, Severity};
    use crate::session::SessionState;
    use crate::store::{MemoryCredentialStore, RecordingSink};

    enum Mode {
        Healthy,
        Broken,
        Hung,
    }

    struct CanteenPlugin {
        context: PluginContext,
        mode: Mode,
    }

    fn canteen_factory(context: PluginContext) -> Arc<dyn ServicePlugin> {
        let mode = if context.link_id.0.starts_with("broken") {
            Mode::Broken
        } else if context.link_id.0.starts_with("hung") {
            Mode::Hung
        } else {
            Mode::Healthy
        };
        Arc::new(CanteenPlugin { context, mode })
    }

    impl CanteenPlugin {
        async fn answer<T>(&self, value: T) -> Result<T, PortError> {
            match self.mode {
                Mode::Healthy => Ok(value),
                Mode::Broken => Err(PortError::Decode("menu page changed".into())),
                Mode::Hung => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(value)
                }
            }
        }
    }

    #[async_trait]
    impl ServicePlugin for CanteenPlugin {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Turboself
        }

        async fn refresh_account(
            &self,
            additionals: &Additionals,
        ) -> Result<Authenticated, PortError> {
            Ok(Authenticated {
                session: Session::new("token"),
                additionals: additionals.clone(),
                capabilities: vec![
                    Capability::CanteenMenu,
                    Capability::CanteenBalance,
                    Capability::Grades,
                ],
            })
        }

        async fn weekly_canteen_menu(
            &self,
            _session: &Session,
            date: NaiveDate,
        ) -> Result<Vec<CanteenMenu>, PortError> {
            self.answer(vec![CanteenMenu {
                date,
                lunch: vec![Dish {
                    name: format!("{} lunch", self.context.link_id),
                    category: DishCategory::Main,
                }],
                dinner: Vec::new(),
            }])
            .await
        }

        async fn canteen_balances(
            &self,
            _session: &Session,
        ) -> Result<Vec<CanteenBalance>, PortError> {
            self.answer(vec![CanteenBalance {
                link_id: self.context.link_id.clone(),
                label: "Self".into(),
                amount_cents: 1250,
                currency: "EUR".into(),
                remaining_meals: Some(3),
            }])
            .await
        }

        async fn grades_periods(&self, _session: &Session) -> Result<Vec<Period>, PortError> {
            self.answer(vec![Period {
                id: "T1".into(),
                name: "Trimestre 1".into(),
                start: date(2024, 9, 2),
                end: date(2024, 11, 30),
                account_id: self.context.account_id.clone(),
                link_id: self.context.link_id.clone(),
            }])
            .await
        }

        async fn grades_for_period(
            &self,
            _session: &Session,
            period: &Period,
        ) -> Result<Vec<Grade>, PortError> {
            self.answer(vec![Grade {
                id: format!("{}-{}", self.context.link_id, period.id),
                subject_id: SubjectId("maths".into()),
                subject_name: "Maths".into(),
                description: String::new(),
                given_at: period.start,
                student_score: GradeScore::value(14.0),
                average_score: GradeScore::value(12.0),
                min_score: GradeScore::value(3.0),
                max_score: GradeScore::value(19.0),
                out_of: GradeScore::value(20.0),
                coefficient: 1.0,
                bonus: false,
                optional: false,
                account_id: self.context.account_id.clone(),
            }])
            .await
        }
    }

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
    }

    fn registry() -> Arc<ProviderRegistry> {
        Arc::new(ProviderRegistry::new(vec![ProviderEntry {
            meta: ProviderMeta {
                kind: ProviderKind::Turboself,
                name: "Turboself".into(),
            },
            factory: Arc::new(canteen_factory),
        }]))
    }

    fn account(links: &[(&str, ProviderKind)]) -> Account {
        let mut account = Account::new(AccountId("acc".into()), "Jeanne");
        for (id, kind) in links {
            account.upsert_link(ServiceLink::new(
                ServiceLinkId((*id).to_owned()),
                *kind,
                Additionals::new()
                    .with(keys::USERNAME, "jeanne")
                    .with(keys::PASSWORD, "secret"),
            ));
        }
        account
    }

    async fn manager_with(
        links: &[(&str, ProviderKind)],
        sink: Arc<RecordingSink>,
        config: FederationConfig,
    ) -> AccountManager {
        AccountManager::new(
            account(links),
            registry(),
            Arc::new(MemoryCredentialStore::new()),
            sink,
            config,
        )
        .await
    }

    async fn manager(links: &[(&str, ProviderKind)], sink: Arc<RecordingSink>) -> AccountManager {
        manager_with(links, sink, FederationConfig::default()).await
    }

    #[tokio::test]
    async fn resolve_needs_discovered_capabilities() {
        let sink = Arc::new(RecordingSink::new());
        let manager = manager(&[("card", ProviderKind::Turboself)], sink).await;
        assert!(manager.resolve(Capability::CanteenMenu).await.is_empty());

        assert!(manager.discover().await.is_empty());
        assert_eq!(manager.resolve(Capability::CanteenMenu).await.len(), 1);
        assert!(manager.resolve(Capability::Timetable).await.is_empty());

        let snapshot = manager.account().await;
        let link = snapshot
            .link(&ServiceLinkId("card".into()))
            .expect("link kept");
        assert!(link.capabilities.contains(&Capability::CanteenBalance));
    }

    #[tokio::test]
    async fn no_provider_for_a_capability_is_an_empty_result() {
        let sink = Arc::new(RecordingSink::new());
        let manager = manager(&[("card", ProviderKind::Turboself)], Arc::clone(&sink)).await;
        manager.discover().await;

        let news = manager.news().await;
        assert!(news.data.is_empty());
        assert!(!news.is_partial());
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn one_broken_provider_does_not_blank_the_other() {
        let sink = Arc::new(RecordingSink::new());
        let manager = manager(
            &[
                ("card", ProviderKind::Turboself),
                ("broken-card", ProviderKind::Turboself),
            ],
            Arc::clone(&sink),
        )
        .await;
        manager.discover().await;

        let menus = manager.weekly_canteen_menu(date(2024, 10, 7)).await;
        assert_eq!(menus.data.len(), 1);
        let dish = menus
            .data
            .first()
            .and_then(|menu| menu.lunch.first())
            .expect("healthy menu");
        assert_eq!(dish.name, "card lunch");

        assert_eq!(menus.failures.len(), 1);
        let failure = menus.failures.first().expect("one failure");
        assert_eq!(failure.link_id, ServiceLinkId("broken-card".into()));
        assert_eq!(failure.capability, Capability::CanteenMenu);
        assert_eq!(failure.severity, Severity::Unavailable);
        assert_eq!(sink.take(), menus.failures);
    }

    #[tokio::test]
    async fn hung_provider_times_out_without_blocking_others() {
        let sink = Arc::new(RecordingSink::new());
        let config = FederationConfig {
            call_timeout_secs: 1,
            ..FederationConfig::default()
        };
        let manager = manager_with(
            &[
                ("card", ProviderKind::Turboself),
                ("hung-card", ProviderKind::Turboself),
            ],
            sink,
            config,
        )
        .await;
        manager.discover().await;

        let balances = manager.canteen_balances().await;
        assert_eq!(balances.data.len(), 1);
        let failure = balances.failures.first().expect("timeout reported");
        assert_eq!(failure.link_id, ServiceLinkId("hung-card".into()));
        assert!(failure.message.contains("Timed out"));
    }

    #[tokio::test]
    async fn period_calls_route_to_the_reporting_link() {
        let sink = Arc::new(RecordingSink::new());
        let manager = manager(
            &[
                ("first", ProviderKind::Turboself),
                ("second", ProviderKind::Turboself),
            ],
            sink,
        )
        .await;
        manager.discover().await;

        let periods = manager.grades_periods().await;
        assert_eq!(periods.data.len(), 2);
        let second = periods
            .data
            .iter()
            .find(|period| period.link_id == ServiceLinkId("second".into()))
            .expect("second link period");

        let grades = manager.grades_for_period(second).await.expect("grades");
        let grade = grades.first().expect("one grade");
        assert_eq!(grade.id, "second-T1");

        let mut orphan = second.clone();
        orphan.link_id = ServiceLinkId("gone".into());
        let err = manager
            .grades_for_period(&orphan)
            .await
            .expect_err("unknown link");
        assert!(matches!(err, PortError::UnknownLink(_)));
    }

    #[tokio::test]
    async fn credential_update_recreates_the_plugin() {
        let sink = Arc::new(RecordingSink::new());
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = AccountManager::new(
            account(&[("card", ProviderKind::Turboself)]),
            registry(),
            Arc::clone(&store) as Arc<dyn CredentialStore>,
            sink,
            FederationConfig::default(),
        )
        .await;
        let link_id = ServiceLinkId("card".into());
        manager.discover().await;
        let before = manager.handle(&link_id).await.expect("handle");
        assert_eq!(before.state().await, SessionState::Ready);

        let fresh = Additionals::new()
            .with(keys::USERNAME, "jeanne")
            .with(keys::PASSWORD, "new-secret");
        manager
            .update_credentials(&link_id, fresh.clone())
            .await
            .expect("update");

        let after = manager.handle(&link_id).await.expect("handle");
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.state().await, SessionState::NoSession);
        assert_eq!(
            store
                .load(&AccountId("acc".into()), &link_id)
                .await
                .expect("load"),
            Some(fresh)
        );
    }

    #[tokio::test]
    async fn credential_update_keeps_learned_capabilities() {
        let sink = Arc::new(RecordingSink::new());
        let manager = manager(&[("card", ProviderKind::Turboself)], Arc::clone(&sink)).await;
        let link_id = ServiceLinkId("card".into());
        assert!(manager.discover().await.is_empty());
        assert_eq!(manager.canteen_balances().await.data.len(), 1);

        manager
            .update_credentials(
                &link_id,
                Additionals::new()
                    .with(keys::USERNAME, "jeanne")
                    .with(keys::PASSWORD, "new-secret"),
            )
            .await
            .expect("update");

        let handle = manager.handle(&link_id).await.expect("handle");
        assert!(handle.supports(Capability::CanteenBalance).await);
        let balances = manager.canteen_balances().await;
        assert_eq!(balances.data.len(), 1);
        assert!(balances.failures.is_empty());
        assert!(sink.take().is_empty());
        assert_eq!(handle.state().await, SessionState::Ready);

        let snapshot = manager.account().await;
        let link = snapshot.link(&link_id).expect("link kept");
        assert!(link.capabilities.contains(&Capability::CanteenBalance));
        assert_eq!(link.additionals.get(keys::PASSWORD), Some("new-secret"));
    }

    #[tokio::test]
    async fn unsupported_providers_are_skipped() {
        let sink = Arc::new(RecordingSink::new());
        let manager = manager(
            &[
                ("card", ProviderKind::Turboself),
                ("feed", ProviderKind::Ical),
            ],
            sink,
        )
        .await;

        assert!(manager.handle(&ServiceLinkId("card".into())).await.is_ok());
        let err = manager
            .handle(&ServiceLinkId("feed".into()))
            .await
            .expect_err("no plugin for ical");
        assert!(matches!(err, PortError::UnknownLink(_)));

        let link = ServiceLink::new(
            ServiceLinkId("other-feed".into()),
            ProviderKind::Ical,
            Additionals::new(),
        );
        let err = manager.link(link).await.expect_err("unregistered provider");
        assert!(matches!(err, PortError::UnsupportedProvider(ProviderKind::Ical)));
    }

    #[tokio::test]
    async fn link_and_unlink_manage_plugins() {
        let sink = Arc::new(RecordingSink::new());
        let manager = manager(&[], sink).await;
        let link_id = ServiceLinkId("card".into());

        manager
            .link(ServiceLink::new(
                link_id.clone(),
                ProviderKind::Turboself,
                Additionals::new(),
            ))
            .await
            .expect("link");
        assert!(manager.handle(&link_id).await.is_ok());
        assert_eq!(manager.account().await.links.len(), 1);

        manager.unlink(&link_id).await.expect("unlink");
        assert!(manager.handle(&link_id).await.is_err());
        assert!(manager.account().await.links.is_empty());
        assert!(matches!(
            manager.unlink(&link_id).await,
            Err(PortError::UnknownLink(_))
        ));
    }
}
