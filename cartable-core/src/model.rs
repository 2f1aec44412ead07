//! Domain data structures for accounts, provider links, grades and the
//! per-capability records every provider translates into.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Status label given to scores a provider reported with a value nobody maps.
pub const UNKNOWN_STATUS: &str = "Inconnu";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// Identifier of a local student account.
pub struct AccountId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// Identifier of a provider attachment on an account.
pub struct ServiceLinkId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// Canonical key grades are grouped by.
pub struct SubjectId(pub String);

impl fmt::Display for AccountId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl fmt::Display for ServiceLinkId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Third-party systems a link can point at.
pub enum ProviderKind {
    /// PRONOTE-like school management system.
    Pronote,
    /// Skolengo-like digital workspace.
    Skolengo,
    /// Turboself canteen payment system.
    Turboself,
    /// Alise canteen payment system.
    Alise,
    /// Appscho university portal.
    Appscho,
    /// Plain iCalendar feed.
    Ical,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slug = match self {
            ProviderKind::Pronote => "pronote",
            ProviderKind::Skolengo => "skolengo",
            ProviderKind::Turboself => "turboself",
            ProviderKind::Alise => "alise",
            ProviderKind::Appscho => "appscho",
            ProviderKind::Ical => "ical",
        };
        write!(formatter, "{slug}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// Functional areas a provider may expose for a given student.
pub enum Capability {
    /// Weekly lessons.
    Timetable,
    /// Grades and grading periods.
    Grades,
    /// Homework assignments.
    Homework,
    /// Absences, delays and punishments.
    Attendance,
    /// Periods attendance is reported for.
    AttendancePeriods,
    /// School announcements.
    News,
    /// Canteen weekly menu.
    CanteenMenu,
    /// Canteen card balance.
    CanteenBalance,
    /// Reading discussions.
    ChatRead,
    /// Replying to an existing discussion.
    ChatReply,
    /// Starting a new discussion.
    ChatCreate,
    /// Silent session renewal without user interaction.
    Refresh,
}

impl fmt::Display for Capability {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Timetable => "TIMETABLE",
            Capability::Grades => "GRADES",
            Capability::Homework => "HOMEWORK",
            Capability::Attendance => "ATTENDANCE",
            Capability::AttendancePeriods => "ATTENDANCE_PERIODS",
            Capability::News => "NEWS",
            Capability::CanteenMenu => "CANTEEN_MENU",
            Capability::CanteenBalance => "CANTEEN_BALANCE",
            Capability::ChatRead => "CHAT_READ",
            Capability::ChatReply => "CHAT_REPLY",
            Capability::ChatCreate => "CHAT_CREATE",
            Capability::Refresh => "REFRESH",
        };
        formatter.write_str(name)
    }
}

/// Well-known keys found in [`Additionals`] bags.
pub mod keys {
    /// Login name.
    pub const USERNAME: &str = "username";
    /// Login password.
    pub const PASSWORD: &str = "password";
    /// Long-lived token allowing a silent login.
    pub const REFRESH_TOKEN: &str = "refresh_token";
    /// Base URL of the provider instance serving the student.
    pub const INSTANCE_URL: &str = "instance_url";
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
/// Provider-specific credential bag persisted on a [`ServiceLink`].
///
/// The core never interprets it beyond presence checks; each provider decides
/// which keys it needs to rebuild a session.
pub struct Additionals(BTreeMap<String, String>);

impl Additionals {
    /// Create an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.set(key, value);
        self
    }

    /// Non-blank value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Insert or replace a value.
    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.into());
    }

    /// Remove a value, returning it.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Whether both a username and a password are present.
    #[must_use]
    pub fn has_password_login(&self) -> bool {
        self.get(keys::USERNAME).is_some() && self.get(keys::PASSWORD).is_some()
    }

    /// Whether the bag holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Additionals {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = formatter.debug_map();
        for (key, value) in &self.0 {
            if key.contains("password") || key.contains("token") || key.contains("secret") {
                map.entry(key, &"<redacted>");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One provider attachment owned by an [`Account`].
pub struct ServiceLink {
    /// Unique identifier.
    pub id: ServiceLinkId,
    /// Which provider this link talks to.
    pub provider: ProviderKind,
    /// Credentials needed to rebuild a session without user interaction.
    #[serde(default)]
    pub additionals: Additionals,
    /// Capabilities learned during the last successful login.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last credential or capability update.
    pub updated_at: DateTime<Utc>,
}

impl ServiceLink {
    /// Create a link with unknown capabilities.
    #[must_use]
    pub fn new(id: ServiceLinkId, provider: ProviderKind, additionals: Additionals) -> Self {
        let now = Utc::now();
        Self {
            id,
            provider,
            additionals,
            capabilities: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// A student identity holding any number of provider links.
pub struct Account {
    /// Unique identifier.
    pub id: AccountId,
    /// Name shown to the user.
    pub display_name: String,
    /// Attached providers.
    #[serde(default)]
    pub links: Vec<ServiceLink>,
}

impl Account {
    /// Create an account without links.
    #[must_use]
    pub fn new<S: Into<String>>(id: AccountId, display_name: S) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            links: Vec::new(),
        }
    }

    /// Look up a link by identifier.
    #[must_use]
    pub fn link(&self, id: &ServiceLinkId) -> Option<&ServiceLink> {
        self.links.iter().find(|link| &link.id == id)
    }

    /// Insert a link, replacing any existing link with the same identifier.
    pub fn upsert_link(&mut self, link: ServiceLink) {
        match self.links.iter_mut().find(|existing| existing.id == link.id) {
            Some(existing) => *existing = link,
            None => self.links.push(link),
        }
    }

    /// Detach a link.
    pub fn remove_link(&mut self, id: &ServiceLinkId) -> Option<ServiceLink> {
        let index = self.links.iter().position(|link| &link.id == id)?;
        Some(self.links.remove(index))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Inclusive start/end range for requested records.
pub struct DateRange {
    /// Start date (inclusive).
    pub start: NaiveDate,
    /// End date (inclusive).
    pub end: NaiveDate,
}

impl DateRange {
    /// Monday-to-Sunday week containing `date`.
    #[must_use]
    pub fn week_of(date: NaiveDate) -> Self {
        let offset = u64::from(date.weekday().num_days_from_monday());
        let start = date.checked_sub_days(Days::new(offset)).unwrap_or(date);
        let end = start.checked_add_days(Days::new(6)).unwrap_or(start);
        Self { start, end }
    }

    /// Whether `date` falls inside the range.
    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A grading or attendance period.
pub struct Period {
    /// Provider identifier of the period.
    pub id: String,
    /// Display name ("Trimestre 1").
    pub name: String,
    /// First day.
    pub start: NaiveDate,
    /// Last day.
    pub end: NaiveDate,
    /// Owning account.
    pub account_id: AccountId,
    /// Link that reported the period; period-scoped calls are routed back to it.
    pub link_id: ServiceLinkId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawGradeScore", into = "RawGradeScore")]
/// A score that is either numeric or a disabled placeholder ("Abs.", "Disp.").
///
/// Serialized as `{ "value": 15.5 }` or `{ "disabled": true, "status": "Abs." }`.
pub enum GradeScore {
    /// Numeric score, finite and non-negative when built through [`GradeScore::value`].
    Value(f64),
    /// Placeholder carrying the provider's status label.
    Disabled(String),
}

impl GradeScore {
    /// Numeric score; non-finite or negative input degrades to the unknown status.
    #[must_use]
    pub fn value(value: f64) -> Self {
        if value.is_finite() && value >= 0.0 {
            Self::Value(value)
        } else {
            Self::unknown()
        }
    }

    /// Disabled score with a status label.
    #[must_use]
    pub fn disabled<S: Into<String>>(status: S) -> Self {
        Self::Disabled(status.into())
    }

    /// Disabled score for a value no mapping exists for.
    #[must_use]
    pub fn unknown() -> Self {
        Self::Disabled(UNKNOWN_STATUS.to_owned())
    }

    /// Numeric value when the score can take part in arithmetic.
    #[must_use]
    pub fn as_value(&self) -> Option<f64> {
        match self {
            Self::Value(value) if value.is_finite() && *value >= 0.0 => Some(*value),
            Self::Value(_) | Self::Disabled(_) => None,
        }
    }

    /// Whether the score is a placeholder.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.as_value().is_none()
    }

    /// Status label of a disabled score.
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        match self {
            Self::Disabled(status) => Some(status),
            Self::Value(_) => None,
        }
    }
}

impl fmt::Display for GradeScore {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => write!(formatter, "{value:.2}"),
            Self::Disabled(status) => formatter.write_str(status),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawGradeScore {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<String>,
}

impl From<RawGradeScore> for GradeScore {
    fn from(raw: RawGradeScore) -> Self {
        match (raw.disabled, raw.value) {
            (false, Some(value)) => GradeScore::value(value),
            (_, _) => raw
                .status
                .map_or_else(GradeScore::unknown, GradeScore::Disabled),
        }
    }
}

impl From<GradeScore> for RawGradeScore {
    fn from(score: GradeScore) -> Self {
        match score {
            GradeScore::Value(value) => Self {
                value: Some(value),
                disabled: false,
                status: None,
            },
            GradeScore::Disabled(status) => Self {
                value: None,
                disabled: true,
                status: Some(status),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A single assessment result.
pub struct Grade {
    /// Provider identifier.
    pub id: String,
    /// Canonical subject key.
    pub subject_id: SubjectId,
    /// Subject label as reported by the provider.
    pub subject_name: String,
    /// Assessment description.
    pub description: String,
    /// Day the assessment was given.
    pub given_at: NaiveDate,
    /// The student's score.
    pub student_score: GradeScore,
    /// Class average.
    pub average_score: GradeScore,
    /// Lowest score in the class.
    pub min_score: GradeScore,
    /// Highest score in the class.
    pub max_score: GradeScore,
    /// Scale the scores are expressed on.
    pub out_of: GradeScore,
    /// Weight declared by the teacher.
    pub coefficient: f64,
    /// Only counts when it raises the average.
    pub bonus: bool,
    /// Optional assessment.
    pub optional: bool,
    /// Owning account.
    pub account_id: AccountId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A subject with its grades and derived averages.
pub struct Subject {
    /// Canonical subject key.
    pub id: SubjectId,
    /// Display name.
    pub name: String,
    /// Grades in this subject.
    pub grades: Vec<Grade>,
    /// Student average.
    pub student_average: GradeScore,
    /// Class average.
    pub class_average: GradeScore,
    /// Lowest average.
    pub minimum: GradeScore,
    /// Highest average.
    pub maximum: GradeScore,
    /// Scale the averages are expressed on.
    pub out_of: GradeScore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Whether a lesson takes place as planned.
pub enum CourseStatus {
    /// Planned lesson.
    Normal,
    /// Lesson cancelled.
    Cancelled,
    /// Room, teacher or time changed.
    Edited,
    /// Remote lesson.
    Online,
    /// Provider-specific status without a domain equivalent.
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Timetable entry.
pub struct Course {
    /// Provider identifier.
    pub id: String,
    /// Subject label.
    pub subject: String,
    /// Teacher name.
    pub teacher: Option<String>,
    /// Room label.
    pub room: Option<String>,
    /// Start instant.
    pub start: DateTime<Utc>,
    /// End instant.
    pub end: DateTime<Utc>,
    /// Lesson status.
    pub status: CourseStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Homework assignment.
pub struct Homework {
    /// Provider identifier.
    pub id: String,
    /// Subject label.
    pub subject: String,
    /// Assignment body.
    pub content: String,
    /// Due date.
    pub due_at: NaiveDate,
    /// Marked as done by the student.
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// School announcement.
pub struct News {
    /// Provider identifier.
    pub id: String,
    /// Headline.
    pub title: String,
    /// Body.
    pub content: String,
    /// Author name.
    pub author: Option<String>,
    /// Publication instant.
    pub published_at: DateTime<Utc>,
    /// Already read.
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Missed time span.
pub struct Absence {
    /// Provider identifier.
    pub id: String,
    /// Start instant.
    pub from: DateTime<Utc>,
    /// End instant.
    pub to: DateTime<Utc>,
    /// Excused by the school.
    pub justified: bool,
    /// Reason given.
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Late arrival.
pub struct Delay {
    /// Provider identifier.
    pub id: String,
    /// Arrival instant.
    pub at: DateTime<Utc>,
    /// Minutes late.
    pub minutes: u32,
    /// Excused by the school.
    pub justified: bool,
    /// Reason given.
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Disciplinary measure.
pub struct Punishment {
    /// Provider identifier.
    pub id: String,
    /// Day the punishment was given.
    pub given_at: NaiveDate,
    /// Reason given.
    pub reason: String,
    /// Kind of measure ("Retenue").
    pub nature: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Attendance records for one period.
pub struct Attendance {
    /// Absences.
    pub absences: Vec<Absence>,
    /// Delays.
    pub delays: Vec<Delay>,
    /// Punishments.
    pub punishments: Vec<Punishment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Discussion thread.
pub struct Chat {
    /// Provider identifier.
    pub id: String,
    /// Link that reported the chat; replies are routed back to it.
    pub link_id: ServiceLinkId,
    /// Thread subject.
    pub subject: String,
    /// Author of the first message.
    pub creator: String,
    /// Participants.
    pub recipients: Vec<String>,
    /// Instant of the latest message.
    pub last_message_at: DateTime<Utc>,
    /// Unread message count.
    pub unread: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Message inside a [`Chat`].
pub struct ChatMessage {
    /// Provider identifier.
    pub id: String,
    /// Author name.
    pub author: String,
    /// Body.
    pub content: String,
    /// Sending instant.
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Course of a canteen meal.
pub enum DishCategory {
    /// Starter.
    Starter,
    /// Main course.
    Main,
    /// Side dish.
    Side,
    /// Cheese or dairy.
    Dairy,
    /// Dessert.
    Dessert,
    /// Provider-specific category.
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A dish served at the canteen.
pub struct Dish {
    /// Dish name.
    pub name: String,
    /// Course it belongs to.
    pub category: DishCategory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Canteen menu for one day.
pub struct CanteenMenu {
    /// Day served.
    pub date: NaiveDate,
    /// Lunch dishes.
    pub lunch: Vec<Dish>,
    /// Dinner dishes.
    pub dinner: Vec<Dish>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Money left on a canteen card.
pub struct CanteenBalance {
    /// Link that reported the balance.
    pub link_id: ServiceLinkId,
    /// Account label ("Self", "Cafétéria").
    pub label: String,
    /// Amount in cents; negative when overdrawn.
    pub amount_cents: i64,
    /// ISO currency code.
    pub currency: String,
    /// Meals the balance still covers, when the provider computes it.
    pub remaining_meals: Option<u32>,
}
