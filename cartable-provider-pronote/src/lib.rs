//! Provider implementation for PRONOTE-like school management instances.
//!
//! Every instance lives under its own base URL (`instance_url` in the link's
//! credentials). A password login returns a session token plus a one-shot
//! renewal token; the renewal token is stored back on the link so the next
//! login can happen without the password prompt.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cartable_core::{
    grades::normalize_subject_key,
    http::{fetch_json, send},
    model::{
        Absence, Additionals, Attendance, CanteenMenu, Capability, Chat, ChatMessage, Course,
        CourseStatus, DateRange, Delay, Dish, DishCategory, Grade, GradeScore, Homework, News,
        Period, ProviderKind, Punishment, keys,
    },
    plugin::{PluginContext, ProviderEntry, ProviderMeta},
    ports::{Authenticated, PortError, ServicePlugin, Session},
    session::is_unauthorized,
};

const DATE_FORMAT: &str = "%Y-%m-%d";
const INSTANCE: &str = "instance";
const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
const BAD_CREDENTIALS: &str = "BAD_CREDENTIALS";

#[derive(Debug, Serialize)]
struct PasswordLogin<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct TokenLogin<'a> {
    username: &'a str,
    token: &'a str,
}

/// Every PRONOTE answer is wrapped in `{ "data": … }` or `{ "error": … }`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginData {
    session: String,
    next_token: String,
    student: Student,
    #[serde(default)]
    tabs: Vec<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Student {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct LessonEntry {
    id: String,
    subject: String,
    teacher: Option<String>,
    room: Option<String>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PeriodEntry {
    id: String,
    name: String,
    start: NaiveDate,
    end: NaiveDate,
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GradeEntry {
    id: String,
    subject: String,
    #[serde(default)]
    comment: String,
    date: NaiveDate,
    value: String,
    #[serde(default)]
    average: String,
    #[serde(default)]
    min: String,
    #[serde(default)]
    max: String,
    out_of: String,
    #[serde(default = "default_coefficient")]
    coefficient: f64,
    #[serde(default)]
    bonus: bool,
    #[serde(default)]
    optional: bool,
}

fn default_coefficient() -> f64 {
    1.0
}

#[derive(Debug, Default, Deserialize)]
struct AttendanceEntry {
    #[serde(default)]
    absences: Vec<AbsenceEntry>,
    #[serde(default)]
    delays: Vec<DelayEntry>,
    #[serde(default)]
    punishments: Vec<PunishmentEntry>,
}

#[derive(Debug, Deserialize)]
struct AbsenceEntry {
    id: String,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    #[serde(default)]
    justified: bool,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DelayEntry {
    id: String,
    date: DateTime<Utc>,
    minutes: u32,
    #[serde(default)]
    justified: bool,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PunishmentEntry {
    id: String,
    date: NaiveDate,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    nature: String,
}

#[derive(Debug, Deserialize)]
struct HomeworkEntry {
    id: String,
    subject: String,
    description: String,
    deadline: NaiveDate,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct NewsEntry {
    id: String,
    title: String,
    #[serde(default)]
    content: String,
    author: Option<String>,
    date: DateTime<Utc>,
    #[serde(default)]
    read: bool,
}

#[derive(Debug, Deserialize)]
struct DiscussionEntry {
    id: String,
    subject: String,
    creator: String,
    #[serde(default)]
    recipients: Vec<String>,
    date: DateTime<Utc>,
    #[serde(default)]
    unread: u32,
}

#[derive(Debug, Deserialize)]
struct MessageEntry {
    id: String,
    author: String,
    content: String,
    date: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct NewDiscussion<'a> {
    subject: &'a str,
    content: &'a str,
    recipients: &'a [String],
}

#[derive(Debug, Serialize)]
struct Reply<'a> {
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MenuEntry {
    date: NaiveDate,
    #[serde(default)]
    lunch: Vec<DishEntry>,
    #[serde(default)]
    dinner: Vec<DishEntry>,
}

#[derive(Debug, Deserialize)]
struct DishEntry {
    name: String,
    kind: String,
}

/// Plugin talking to one PRONOTE instance on behalf of one link.
pub struct PronotePlugin {
    client: Client,
    context: PluginContext,
}

impl PronotePlugin {
    /// Create a plugin bound to the given HTTP client and link.
    #[must_use]
    pub fn new(client: Client, context: PluginContext) -> Self {
        Self { client, context }
    }

    fn get(&self, session: &Session, path: &str) -> Result<RequestBuilder, PortError> {
        Ok(self
            .client
            .get(format!("{}{path}", instance(session)?))
            .bearer_auth(&session.access_token))
    }

    fn post(&self, session: &Session, path: &str) -> Result<RequestBuilder, PortError> {
        Ok(self
            .client
            .post(format!("{}{path}", instance(session)?))
            .bearer_auth(&session.access_token))
    }

    async fn password_login(
        &self,
        base: &str,
        username: &str,
        password: &str,
    ) -> Result<LoginData, PortError> {
        debug!(link = %self.context.link_id, "PRONOTE password login");
        let req = self
            .client
            .post(format!("{base}/api/session/login"))
            .json(&PasswordLogin { username, password });
        fetch(req).await.map_err(as_rejection)
    }

    async fn token_login(
        &self,
        base: &str,
        username: &str,
        token: &str,
    ) -> Result<LoginData, PortError> {
        debug!(link = %self.context.link_id, "PRONOTE token login");
        let req = self
            .client
            .post(format!("{base}/api/session/token"))
            .json(&TokenLogin { username, token });
        fetch(req).await.map_err(as_rejection)
    }

    fn periods_of_kind(&self, entries: Vec<PeriodEntry>, kind: &str) -> Vec<Period> {
        entries
            .into_iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| Period {
                id: entry.id,
                name: entry.name,
                start: entry.start,
                end: entry.end,
                account_id: self.context.account_id.clone(),
                link_id: self.context.link_id.clone(),
            })
            .collect()
    }

    fn chat(&self, entry: DiscussionEntry) -> Chat {
        Chat {
            id: entry.id,
            link_id: self.context.link_id.clone(),
            subject: entry.subject,
            creator: entry.creator,
            recipients: entry.recipients,
            last_message_at: entry.date,
            unread: entry.unread,
        }
    }
}

#[async_trait]
impl ServicePlugin for PronotePlugin {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Pronote
    }

    async fn refresh_account(&self, additionals: &Additionals) -> Result<Authenticated, PortError> {
        let base = additionals
            .get(keys::INSTANCE_URL)
            .ok_or_else(|| PortError::Authentication("missing PRONOTE instance URL".to_owned()))?
            .trim_end_matches('/')
            .to_owned();
        let username = additionals.get(keys::USERNAME).ok_or_else(|| {
            PortError::Authentication("neither a renewal token nor username and password".to_owned())
        })?;

        let login = match (additionals.get(keys::REFRESH_TOKEN), additionals.get(keys::PASSWORD)) {
            (Some(token), password) => match self.token_login(&base, username, token).await {
                Ok(login) => login,
                Err(error) => match password {
                    Some(password) if is_rejection(&error) => {
                        warn!(link = %self.context.link_id, %error, "renewal token refused, using password");
                        self.password_login(&base, username, password).await?
                    }
                    _ => return Err(error),
                },
            },
            (None, Some(password)) => self.password_login(&base, username, password).await?,
            (None, None) => {
                return Err(PortError::Authentication(
                    "neither a renewal token nor username and password".to_owned(),
                ));
            }
        };

        let mut session = Session::new(login.session)
            .with_user(login.student.id)
            .with_extra(INSTANCE, base)
            .with_extra("student_name", login.student.name);
        if let Some(seconds) = login.expires_in {
            session = session.expiring_in(seconds);
        }

        Ok(Authenticated {
            session,
            additionals: additionals
                .clone()
                .with(keys::REFRESH_TOKEN, login.next_token),
            capabilities: capabilities_from_tabs(&login.tabs),
        })
    }

    async fn weekly_timetable(
        &self,
        session: &Session,
        week: DateRange,
    ) -> Result<Vec<Course>, PortError> {
        let from = week.start.format(DATE_FORMAT).to_string();
        let to = week.end.format(DATE_FORMAT).to_string();
        let lessons: Vec<LessonEntry> =
            fetch(self.get(session, "/api/timetable")?.query(&[("from", from), ("to", to)])).await?;

        Ok(lessons
            .into_iter()
            .map(|lesson| Course {
                id: lesson.id,
                subject: lesson.subject,
                teacher: lesson.teacher,
                room: lesson.room,
                start: lesson.start,
                end: lesson.end,
                status: map_lesson_status(lesson.status.as_deref()),
            })
            .collect())
    }

    async fn grades_periods(&self, session: &Session) -> Result<Vec<Period>, PortError> {
        let entries: Vec<PeriodEntry> = fetch(self.get(session, "/api/periods")?).await?;
        Ok(self.periods_of_kind(entries, "grades"))
    }

    async fn grades_for_period(
        &self,
        session: &Session,
        period: &Period,
    ) -> Result<Vec<Grade>, PortError> {
        let entries: Vec<GradeEntry> = fetch(
            self.get(session, "/api/grades")?
                .query(&[("period", period.id.as_str())]),
        )
        .await?;

        Ok(entries
            .into_iter()
            .map(|entry| Grade {
                subject_id: normalize_subject_key(&entry.subject),
                subject_name: subject_label(&entry.subject),
                id: entry.id,
                description: entry.comment,
                given_at: entry.date,
                student_score: parse_score(&entry.value),
                average_score: parse_score(&entry.average),
                min_score: parse_score(&entry.min),
                max_score: parse_score(&entry.max),
                out_of: parse_score(&entry.out_of),
                coefficient: entry.coefficient,
                bonus: entry.bonus,
                optional: entry.optional,
                account_id: self.context.account_id.clone(),
            })
            .collect())
    }

    async fn attendance_periods(&self, session: &Session) -> Result<Vec<Period>, PortError> {
        let entries: Vec<PeriodEntry> = fetch(self.get(session, "/api/periods")?).await?;
        Ok(self.periods_of_kind(entries, "attendance"))
    }

    async fn attendance_for_period(
        &self,
        session: &Session,
        period: &Period,
    ) -> Result<Attendance, PortError> {
        let entry: AttendanceEntry = fetch(
            self.get(session, "/api/attendance")?
                .query(&[("period", period.id.as_str())]),
        )
        .await?;

        Ok(Attendance {
            absences: entry
                .absences
                .into_iter()
                .map(|absence| Absence {
                    id: absence.id,
                    from: absence.from,
                    to: absence.to,
                    justified: absence.justified,
                    reason: absence.reason,
                })
                .collect(),
            delays: entry
                .delays
                .into_iter()
                .map(|delay| Delay {
                    id: delay.id,
                    at: delay.date,
                    minutes: delay.minutes,
                    justified: delay.justified,
                    reason: delay.reason,
                })
                .collect(),
            punishments: entry
                .punishments
                .into_iter()
                .map(|punishment| Punishment {
                    id: punishment.id,
                    given_at: punishment.date,
                    reason: punishment.reason,
                    nature: punishment.nature,
                })
                .collect(),
        })
    }

    async fn homework(
        &self,
        session: &Session,
        range: DateRange,
    ) -> Result<Vec<Homework>, PortError> {
        let from = range.start.format(DATE_FORMAT).to_string();
        let to = range.end.format(DATE_FORMAT).to_string();
        let entries: Vec<HomeworkEntry> =
            fetch(self.get(session, "/api/homework")?.query(&[("from", from), ("to", to)])).await?;

        Ok(entries
            .into_iter()
            .map(|entry| Homework {
                id: entry.id,
                subject: entry.subject,
                content: entry.description,
                due_at: entry.deadline,
                done: entry.done,
            })
            .collect())
    }

    async fn news(&self, session: &Session) -> Result<Vec<News>, PortError> {
        let entries: Vec<NewsEntry> = fetch(self.get(session, "/api/news")?).await?;
        Ok(entries
            .into_iter()
            .map(|entry| News {
                id: entry.id,
                title: entry.title,
                content: entry.content,
                author: entry.author,
                published_at: entry.date,
                read: entry.read,
            })
            .collect())
    }

    async fn weekly_canteen_menu(
        &self,
        session: &Session,
        date: NaiveDate,
    ) -> Result<Vec<CanteenMenu>, PortError> {
        let day = date.format(DATE_FORMAT).to_string();
        let entries: Vec<MenuEntry> =
            fetch(self.get(session, "/api/menus")?.query(&[("date", day)])).await?;

        Ok(entries
            .into_iter()
            .map(|entry| CanteenMenu {
                date: entry.date,
                lunch: entry.lunch.into_iter().map(map_dish).collect(),
                dinner: entry.dinner.into_iter().map(map_dish).collect(),
            })
            .collect())
    }

    async fn chats(&self, session: &Session) -> Result<Vec<Chat>, PortError> {
        let entries: Vec<DiscussionEntry> = fetch(self.get(session, "/api/discussions")?).await?;
        Ok(entries.into_iter().map(|entry| self.chat(entry)).collect())
    }

    async fn chat_messages(
        &self,
        session: &Session,
        chat: &Chat,
    ) -> Result<Vec<ChatMessage>, PortError> {
        let path = format!("/api/discussions/{}/messages", chat.id);
        let entries: Vec<MessageEntry> = fetch(self.get(session, &path)?).await?;
        Ok(entries
            .into_iter()
            .map(|entry| ChatMessage {
                id: entry.id,
                author: entry.author,
                content: entry.content,
                sent_at: entry.date,
            })
            .collect())
    }

    async fn send_message(&self, session: &Session, chat: &Chat, body: &str) -> Result<(), PortError> {
        let path = format!("/api/discussions/{}/messages", chat.id);
        send(self.post(session, &path)?.json(&Reply { content: body })).await
    }

    async fn create_chat(
        &self,
        session: &Session,
        subject: &str,
        body: &str,
        recipients: &[String],
    ) -> Result<Chat, PortError> {
        let entry: DiscussionEntry = fetch(self.post(session, "/api/discussions")?.json(
            &NewDiscussion {
                subject,
                content: body,
                recipients,
            },
        ))
        .await?;
        Ok(self.chat(entry))
    }
}

/// Build the provider entry for PRONOTE.
#[must_use]
pub fn provider(client: Client) -> ProviderEntry {
    ProviderEntry {
        meta: ProviderMeta {
            kind: ProviderKind::Pronote,
            name: String::from("PRONOTE"),
        },
        factory: Arc::new(move |context: PluginContext| {
            Arc::new(PronotePlugin::new(client.clone(), context)) as Arc<dyn ServicePlugin>
        }),
    }
}

fn instance(session: &Session) -> Result<&str, PortError> {
    session
        .extra(INSTANCE)
        .ok_or_else(|| PortError::Internal("PRONOTE session without instance URL".to_owned()))
}

async fn fetch<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, PortError> {
    let envelope: Envelope<T> = fetch_json(req).await?;
    match (envelope.data, envelope.error) {
        (_, Some(error)) if error.code == SESSION_EXPIRED => Err(PortError::Unauthorized(error.message)),
        (_, Some(error)) if error.code == BAD_CREDENTIALS => {
            Err(PortError::Authentication(error.message))
        }
        (_, Some(error)) => Err(PortError::Internal(format!(
            "PRONOTE error {}: {}",
            error.code, error.message
        ))),
        (Some(data), None) => Ok(data),
        (None, None) => Err(PortError::Decode("empty PRONOTE envelope".to_owned())),
    }
}

fn is_rejection(error: &PortError) -> bool {
    matches!(error, PortError::Authentication(_))
}

// A 401 on a login endpoint means the credentials were refused.
fn as_rejection(error: PortError) -> PortError {
    if is_unauthorized(&error) {
        PortError::Authentication(error.to_string())
    } else {
        error
    }
}

fn capabilities_from_tabs(tabs: &[String]) -> Vec<Capability> {
    let mut capabilities = vec![Capability::Refresh];
    for tab in tabs {
        let granted: &[Capability] = match tab.as_str() {
            "timetable" => &[Capability::Timetable],
            "grades" => &[Capability::Grades],
            "homework" => &[Capability::Homework],
            "attendance" => &[Capability::Attendance, Capability::AttendancePeriods],
            "news" => &[Capability::News],
            "menus" => &[Capability::CanteenMenu],
            "discussions" => &[
                Capability::ChatRead,
                Capability::ChatReply,
                Capability::ChatCreate,
            ],
            other => {
                debug!(tab = other, "ignoring PRONOTE tab");
                &[]
            }
        };
        for capability in granted {
            if !capabilities.contains(capability) {
                capabilities.push(*capability);
            }
        }
    }
    capabilities
}

/// Map PRONOTE score strings ("15,5", "Abs", "Disp", …) to a [`GradeScore`].
fn parse_score(raw: &str) -> GradeScore {
    match raw.trim() {
        "Abs" => GradeScore::disabled("Abs."),
        "Disp" => GradeScore::disabled("Disp."),
        "NonNote" => GradeScore::disabled("N.Not."),
        "Inapte" => GradeScore::disabled("Inap."),
        "NonRendu" => GradeScore::disabled("N.Rdu."),
        "AbsZero" | "NonRenduZero" => GradeScore::value(0.0),
        other => other.replace(',', ".").parse::<f64>().map_or_else(
            |_err| {
                if !other.is_empty() {
                    warn!(value = other, "unmapped PRONOTE score");
                }
                GradeScore::unknown()
            },
            GradeScore::value,
        ),
    }
}

fn subject_label(raw: &str) -> String {
    raw.split('>').next().unwrap_or(raw).trim().to_owned()
}

fn map_lesson_status(raw: Option<&str>) -> CourseStatus {
    match raw.map(str::to_lowercase).as_deref() {
        None | Some("" | "normal") => CourseStatus::Normal,
        Some("cancelled" | "annulé" | "prof. absent") => CourseStatus::Cancelled,
        Some("edited" | "modifié" | "cours modifié") => CourseStatus::Edited,
        Some("online" | "distanciel") => CourseStatus::Online,
        Some(_) => CourseStatus::Other(raw.unwrap_or_default().to_owned()),
    }
}

fn map_dish(entry: DishEntry) -> Dish {
    let category = match entry.kind.to_lowercase().as_str() {
        "entree" | "entrée" => DishCategory::Starter,
        "plat" => DishCategory::Main,
        "accompagnement" => DishCategory::Side,
        "laitage" | "fromage" => DishCategory::Dairy,
        "dessert" => DishCategory::Dessert,
        _ => DishCategory::Other(entry.kind),
    };
    Dish {
        name: entry.name,
        category,
    }
}
