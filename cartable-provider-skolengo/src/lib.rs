//! Provider implementation for Skolengo-like digital workspaces.
//!
//! Logins go through the school's OAuth token endpoint. A refresh token in the
//! link's credentials is preferred; the password grant is only used when no
//! refresh token is known. The granted features come from the permissions
//! returned by `users-info/current`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use cartable_core::{
    grades::normalize_subject_key,
    http::fetch_json,
    model::{
        Absence, Additionals, Attendance, Capability, Course, CourseStatus, DateRange, Delay,
        Grade, GradeScore, Homework, News, Period, ProviderKind, keys,
    },
    plugin::{PluginContext, ProviderEntry, ProviderMeta},
    ports::{Authenticated, PortError, ServicePlugin, Session},
    session::is_unauthorized,
};

/// Credential key holding the JSON:API base URL.
pub const API_URL: &str = "api_url";
/// Credential key holding the OAuth token endpoint.
pub const TOKEN_ENDPOINT: &str = "token_endpoint";
/// Credential key holding the OAuth client id.
pub const CLIENT_ID: &str = "client_id";

const API: &str = "api";
const SCHOOL: &str = "school";
const DATE_FORMAT: &str = "%Y-%m-%d";
const STUDENT_FILTER: &str = "filter[student.id]";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Document<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct Resource<A> {
    id: String,
    attributes: A,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserInfo {
    school_id: String,
    #[serde(default)]
    permissions: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LessonAttributes {
    subject: String,
    teacher: Option<String>,
    location: Option<String>,
    start_date_time: DateTime<Utc>,
    end_date_time: DateTime<Utc>,
    #[serde(default)]
    canceled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeriodAttributes {
    label: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluationAttributes {
    subject: String,
    #[serde(default)]
    title: String,
    date: NaiveDate,
    result: Option<f64>,
    non_evaluation_reason: Option<String>,
    average: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    scale: f64,
    #[serde(default = "default_coefficient")]
    coefficient: f64,
}

fn default_coefficient() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HomeworkAttributes {
    subject: String,
    title: String,
    #[serde(default)]
    html: String,
    due_date: NaiveDate,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewsAttributes {
    title: String,
    #[serde(default)]
    content: String,
    author: Option<String>,
    published_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum AbsenceKind {
    Absence,
    Lateness,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AbsenceFileAttributes {
    kind: AbsenceKind,
    start_date_time: DateTime<Utc>,
    end_date_time: DateTime<Utc>,
    #[serde(default)]
    justified: bool,
    reason: Option<String>,
    minutes: Option<u32>,
}

/// Plugin talking to one Skolengo workspace on behalf of one link.
pub struct SkolengoPlugin {
    client: Client,
    context: PluginContext,
}

impl SkolengoPlugin {
    /// Create a plugin bound to the given HTTP client and link.
    #[must_use]
    pub fn new(client: Client, context: PluginContext) -> Self {
        Self { client, context }
    }

    fn get(&self, session: &Session, path: &str) -> Result<RequestBuilder, PortError> {
        let base = session
            .extra(API)
            .ok_or_else(|| PortError::Internal("Skolengo session without API URL".to_owned()))?;
        Ok(self
            .client
            .get(format!("{base}{path}"))
            .bearer_auth(&session.access_token))
    }

    async fn grant(
        &self,
        endpoint: &str,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, PortError> {
        fetch_json(self.client.post(endpoint).form(form))
            .await
            .map_err(as_rejection)
    }

    async fn periods(&self, session: &Session) -> Result<Vec<Period>, PortError> {
        let user = session.require_user()?;
        let req = self
            .get(session, "/periods")?
            .query(&[(STUDENT_FILTER, user)]);
        let periods: Vec<Resource<PeriodAttributes>> = list(req).await?;

        Ok(periods
            .into_iter()
            .map(|period| Period {
                id: period.id,
                name: period.attributes.label,
                start: period.attributes.start_date,
                end: period.attributes.end_date,
                account_id: self.context.account_id.clone(),
                link_id: self.context.link_id.clone(),
            })
            .collect())
    }

    async fn absence_files(
        &self,
        session: &Session,
    ) -> Result<Vec<Resource<AbsenceFileAttributes>>, PortError> {
        let user = session.require_user()?;
        list(
            self.get(session, "/absence-files")?
                .query(&[(STUDENT_FILTER, user)]),
        )
        .await
    }
}

#[async_trait]
impl ServicePlugin for SkolengoPlugin {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Skolengo
    }

    async fn refresh_account(&self, additionals: &Additionals) -> Result<Authenticated, PortError> {
        let missing = |what: &str| PortError::Authentication(format!("missing Skolengo {what}"));
        let api = additionals
            .get(API_URL)
            .ok_or_else(|| missing("API URL"))?
            .trim_end_matches('/')
            .to_owned();
        let endpoint = additionals
            .get(TOKEN_ENDPOINT)
            .ok_or_else(|| missing("token endpoint"))?;
        let client_id = additionals.get(CLIENT_ID).ok_or_else(|| missing("client id"))?;

        let token = if let Some(refresh_token) = additionals.get(keys::REFRESH_TOKEN) {
            debug!(link = %self.context.link_id, "Skolengo refresh grant");
            self.grant(
                endpoint,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                    ("client_id", client_id),
                ],
            )
            .await?
        } else if let (Some(username), Some(password)) = (
            additionals.get(keys::USERNAME),
            additionals.get(keys::PASSWORD),
        ) {
            debug!(link = %self.context.link_id, "Skolengo password grant");
            self.grant(
                endpoint,
                &[
                    ("grant_type", "password"),
                    ("username", username),
                    ("password", password),
                    ("client_id", client_id),
                ],
            )
            .await?
        } else {
            return Err(PortError::Authentication(
                "neither a refresh token nor username and password".to_owned(),
            ));
        };

        let info: Document<Resource<UserInfo>> = fetch_json(
            self.client
                .get(format!("{api}/users-info/current"))
                .bearer_auth(&token.access_token),
        )
        .await?;

        let mut session = Session::new(token.access_token)
            .with_user(info.data.id)
            .with_extra(API, api)
            .with_extra(SCHOOL, info.data.attributes.school_id);
        if let Some(seconds) = token.expires_in {
            session = session.expiring_in(seconds);
        }

        let mut renewed = additionals.clone();
        if let Some(refresh_token) = token.refresh_token {
            renewed.set(keys::REFRESH_TOKEN, refresh_token);
        }

        Ok(Authenticated {
            session,
            additionals: renewed,
            capabilities: capabilities_from_permissions(&info.data.attributes.permissions),
        })
    }

    async fn weekly_timetable(
        &self,
        session: &Session,
        week: DateRange,
    ) -> Result<Vec<Course>, PortError> {
        let user = session.require_user()?;
        let req = self.get(session, "/lessons")?.query(&[
            (STUDENT_FILTER, user.to_owned()),
            ("filter[date][GE]", week.start.format(DATE_FORMAT).to_string()),
            ("filter[date][LE]", week.end.format(DATE_FORMAT).to_string()),
        ]);
        let lessons: Vec<Resource<LessonAttributes>> = list(req).await?;

        Ok(lessons
            .into_iter()
            .map(|lesson| Course {
                id: lesson.id,
                subject: lesson.attributes.subject,
                teacher: lesson.attributes.teacher,
                room: lesson.attributes.location,
                start: lesson.attributes.start_date_time,
                end: lesson.attributes.end_date_time,
                status: if lesson.attributes.canceled {
                    CourseStatus::Cancelled
                } else {
                    CourseStatus::Normal
                },
            })
            .collect())
    }

    async fn grades_periods(&self, session: &Session) -> Result<Vec<Period>, PortError> {
        self.periods(session).await
    }

    async fn grades_for_period(
        &self,
        session: &Session,
        period: &Period,
    ) -> Result<Vec<Grade>, PortError> {
        let user = session.require_user()?;
        let req = self.get(session, "/evaluations")?.query(&[
            (STUDENT_FILTER, user),
            ("filter[period.id]", period.id.as_str()),
        ]);
        let evaluations: Vec<Resource<EvaluationAttributes>> = list(req).await?;

        Ok(evaluations
            .into_iter()
            .map(|evaluation| {
                let attributes = evaluation.attributes;
                Grade {
                    id: evaluation.id,
                    subject_id: normalize_subject_key(&attributes.subject),
                    student_score: student_score(
                        attributes.result,
                        attributes.non_evaluation_reason.as_deref(),
                    ),
                    subject_name: attributes.subject,
                    description: attributes.title,
                    given_at: attributes.date,
                    average_score: optional_score(attributes.average),
                    min_score: optional_score(attributes.min),
                    max_score: optional_score(attributes.max),
                    out_of: GradeScore::value(attributes.scale),
                    coefficient: attributes.coefficient,
                    bonus: false,
                    optional: false,
                    account_id: self.context.account_id.clone(),
                }
            })
            .collect())
    }

    async fn attendance_periods(&self, session: &Session) -> Result<Vec<Period>, PortError> {
        // Absence files are filed against the same school periods as evaluations.
        self.periods(session).await
    }

    async fn attendance_for_period(
        &self,
        session: &Session,
        period: &Period,
    ) -> Result<Attendance, PortError> {
        let mut attendance = Attendance::default();
        for file in self.absence_files(session).await? {
            let attributes = file.attributes;
            if !(period.start..=period.end).contains(&attributes.start_date_time.date_naive()) {
                continue;
            }
            match attributes.kind {
                AbsenceKind::Absence => attendance.absences.push(Absence {
                    id: file.id,
                    from: attributes.start_date_time,
                    to: attributes.end_date_time,
                    justified: attributes.justified,
                    reason: attributes.reason,
                }),
                AbsenceKind::Lateness => attendance.delays.push(Delay {
                    id: file.id,
                    at: attributes.start_date_time,
                    minutes: attributes.minutes.unwrap_or_default(),
                    justified: attributes.justified,
                    reason: attributes.reason,
                }),
            }
        }
        Ok(attendance)
    }

    async fn homework(
        &self,
        session: &Session,
        range: DateRange,
    ) -> Result<Vec<Homework>, PortError> {
        let user = session.require_user()?;
        let req = self.get(session, "/homeworks")?.query(&[
            (STUDENT_FILTER, user.to_owned()),
            ("filter[dueDate][GE]", range.start.format(DATE_FORMAT).to_string()),
            ("filter[dueDate][LE]", range.end.format(DATE_FORMAT).to_string()),
        ]);
        let assignments: Vec<Resource<HomeworkAttributes>> = list(req).await?;

        Ok(assignments
            .into_iter()
            .map(|assignment| Homework {
                id: assignment.id,
                subject: assignment.attributes.subject,
                content: if assignment.attributes.html.is_empty() {
                    assignment.attributes.title
                } else {
                    assignment.attributes.html
                },
                due_at: assignment.attributes.due_date,
                done: assignment.attributes.done,
            })
            .collect())
    }

    async fn news(&self, session: &Session) -> Result<Vec<News>, PortError> {
        let school = session
            .extra(SCHOOL)
            .ok_or_else(|| PortError::Internal("Skolengo session without school".to_owned()))?;
        let path = format!("/schools/{school}/news");
        let items: Vec<Resource<NewsAttributes>> = list(self.get(session, &path)?).await?;

        Ok(items
            .into_iter()
            .map(|item| News {
                id: item.id,
                title: item.attributes.title,
                content: item.attributes.content,
                author: item.attributes.author,
                published_at: item.attributes.published_at,
                read: false,
            })
            .collect())
    }
}

/// Build the provider entry for Skolengo.
#[must_use]
pub fn provider(client: Client) -> ProviderEntry {
    ProviderEntry {
        meta: ProviderMeta {
            kind: ProviderKind::Skolengo,
            name: String::from("Skolengo"),
        },
        factory: Arc::new(move |context: PluginContext| {
            Arc::new(SkolengoPlugin::new(client.clone(), context)) as Arc<dyn ServicePlugin>
        }),
    }
}

async fn list<A: DeserializeOwned>(req: RequestBuilder) -> Result<Vec<Resource<A>>, PortError> {
    let document: Document<Vec<Resource<A>>> = fetch_json(req).await?;
    Ok(document.data)
}

// OAuth servers answer `invalid_grant` with 400 and bad client auth with 401.
fn as_rejection(error: PortError) -> PortError {
    let refused = is_unauthorized(&error)
        || matches!(&error, PortError::Network(inner) if inner.status() == Some(StatusCode::BAD_REQUEST));
    if refused {
        PortError::Authentication(error.to_string())
    } else {
        error
    }
}

fn capabilities_from_permissions(permissions: &[String]) -> Vec<Capability> {
    let mut capabilities = vec![Capability::Refresh];
    for permission in permissions {
        let granted: &[Capability] = match permission.as_str() {
            "READ_AGENDA" => &[Capability::Timetable],
            "READ_EVALUATIONS" => &[Capability::Grades],
            "READ_HOMEWORK_ASSIGNMENTS" => &[Capability::Homework],
            "READ_ABSENCE_FILES" => &[Capability::Attendance, Capability::AttendancePeriods],
            "READ_SCHOOL_INFO" => &[Capability::News],
            other => {
                debug!(permission = other, "ignoring Skolengo permission");
                continue;
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

fn student_score(result: Option<f64>, reason: Option<&str>) -> GradeScore {
    match (result, reason) {
        (Some(value), _) => GradeScore::value(value),
        (None, Some("ABSENT")) => GradeScore::disabled("Abs."),
        (None, Some("EXEMPTED")) => GradeScore::disabled("Disp."),
        (None, Some("NOT_TAKEN")) => GradeScore::disabled("N.Not."),
        (None, Some("NOT_RETURNED")) => GradeScore::disabled("N.Rdu."),
        (None, Some(other)) => {
            warn!(reason = other, "unmapped Skolengo non-evaluation reason");
            GradeScore::unknown()
        }
        (None, None) => GradeScore::unknown(),
    }
}

fn optional_score(value: Option<f64>) -> GradeScore {
    value.map_or_else(GradeScore::unknown, GradeScore::value)
}

#[cfg(test)]
mod tests {
    use cartable_core::model::{AccountId, ServiceLinkId, SubjectId};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn plugin() -> SkolengoPlugin {
        SkolengoPlugin::new(
            Client::new(),
            PluginContext {
                account_id: AccountId("acc".into()),
                link_id: ServiceLinkId("ent".into()),
            },
        )
    }

    fn credentials(server: &MockServer) -> Additionals {
        Additionals::new()
            .with(API_URL, format!("{}/api/v1/bff-sko-app", server.uri()))
            .with(TOKEN_ENDPOINT, format!("{}/oauth/token", server.uri()))
            .with(CLIENT_ID, "skoapp")
    }

    fn session(server: &MockServer) -> Session {
        Session::new("at-1")
            .with_user("U1")
            .with_extra(API, format!("{}/api/v1/bff-sko-app", server.uri()))
            .with_extra(SCHOOL, "SCH1")
    }

    async fn mount_user_info(server: &MockServer, token: &str) {
        Mock::given(method("GET"))
            .and(path("/api/v1/bff-sko-app/users-info/current"))
            .and(header("authorization", format!("Bearer {token}").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {
                "id": "U1",
                "attributes": {
                    "schoolId": "SCH1",
                    "permissions": ["READ_EVALUATIONS", "READ_SCHOOL_INFO", "WRITE_MESSAGES"]
                }
            }})))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn refresh_grant_rotates_the_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-old"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at-1", "refresh_token": "rt-new", "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_user_info(&server, "at-1").await;

        let bag = credentials(&server).with(keys::REFRESH_TOKEN, "rt-old");
        let authenticated = plugin().refresh_account(&bag).await.expect("login");

        assert_eq!(authenticated.session.user_id.as_deref(), Some("U1"));
        assert!(authenticated.session.expires_at.is_some());
        assert_eq!(
            authenticated.additionals.get(keys::REFRESH_TOKEN),
            Some("rt-new")
        );
        assert_eq!(
            authenticated.capabilities,
            vec![Capability::Refresh, Capability::Grades, Capability::News]
        );
    }

    #[tokio::test]
    async fn password_grant_keeps_bag_without_new_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=password"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"access_token": "at-1"})),
            )
            .mount(&server)
            .await;
        mount_user_info(&server, "at-1").await;

        let bag = credentials(&server)
            .with(keys::USERNAME, "jeanne")
            .with(keys::PASSWORD, "secret");
        let authenticated = plugin().refresh_account(&bag).await.expect("login");
        assert_eq!(authenticated.additionals, bag);
        assert!(authenticated.session.expires_at.is_none());
    }

    #[tokio::test]
    async fn invalid_grant_is_a_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;

        let bag = credentials(&server).with(keys::REFRESH_TOKEN, "revoked");
        let err = plugin().refresh_account(&bag).await.expect_err("refused");
        assert!(matches!(err, PortError::Authentication(_)));
    }

    #[tokio::test]
    async fn missing_oauth_settings_fail_early() {
        let bag = Additionals::new().with(keys::REFRESH_TOKEN, "rt");
        let err = plugin().refresh_account(&bag).await.expect_err("no api url");
        assert!(matches!(err, PortError::Authentication(_)));
    }

    #[tokio::test]
    async fn evaluations_map_non_evaluation_reasons() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/bff-sko-app/evaluations"))
            .and(query_param("filter[student.id]", "U1"))
            .and(query_param("filter[period.id]", "P2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [
                {"id": "e1", "attributes": {"subject": "Sciences Économiques", "title": "DS",
                  "date": "2024-11-04", "result": 13.0, "average": 10.5, "scale": 20.0,
                  "coefficient": 3.0}},
                {"id": "e2", "attributes": {"subject": "Histoire", "date": "2024-11-05",
                  "nonEvaluationReason": "EXEMPTED", "scale": 20.0}},
                {"id": "e3", "attributes": {"subject": "Histoire", "date": "2024-11-06",
                  "nonEvaluationReason": "LOST_IN_MAIL", "scale": 10.0}}
            ]})))
            .mount(&server)
            .await;

        let period = Period {
            id: "P2".into(),
            name: "Semestre 1".into(),
            start: NaiveDate::from_ymd_opt(2024, 9, 2).expect("valid date"),
            end: NaiveDate::from_ymd_opt(2025, 1, 31).expect("valid date"),
            account_id: AccountId("acc".into()),
            link_id: ServiceLinkId("ent".into()),
        };
        let grades = plugin()
            .grades_for_period(&session(&server), &period)
            .await
            .expect("grades");

        let first = grades.first().expect("e1");
        assert_eq!(first.subject_id, SubjectId("scienceseconomiques".into()));
        assert_eq!(first.student_score, GradeScore::value(13.0));
        assert_eq!(first.min_score, GradeScore::unknown());
        assert_eq!(first.coefficient, 3.0);

        assert_eq!(
            grades.get(1).map(|grade| grade.student_score.clone()),
            Some(GradeScore::disabled("Disp."))
        );
        assert_eq!(
            grades.get(2).map(|grade| grade.student_score.clone()),
            Some(GradeScore::unknown())
        );
    }

    #[tokio::test]
    async fn absence_files_are_split_and_filtered_by_period() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/bff-sko-app/absence-files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [
                {"id": "a1", "attributes": {"kind": "ABSENCE",
                  "startDateTime": "2024-10-01T08:00:00Z", "endDateTime": "2024-10-01T12:00:00Z",
                  "justified": true, "reason": "Maladie"}},
                {"id": "a2", "attributes": {"kind": "LATENESS",
                  "startDateTime": "2024-10-02T08:10:00Z", "endDateTime": "2024-10-02T08:10:00Z",
                  "minutes": 10}},
                {"id": "a3", "attributes": {"kind": "ABSENCE",
                  "startDateTime": "2025-03-01T08:00:00Z", "endDateTime": "2025-03-01T12:00:00Z"}}
            ]})))
            .mount(&server)
            .await;

        let period = Period {
            id: "T1".into(),
            name: "Trimestre 1".into(),
            start: NaiveDate::from_ymd_opt(2024, 9, 2).expect("valid date"),
            end: NaiveDate::from_ymd_opt(2024, 11, 30).expect("valid date"),
            account_id: AccountId("acc".into()),
            link_id: ServiceLinkId("ent".into()),
        };
        let attendance = plugin()
            .attendance_for_period(&session(&server), &period)
            .await
            .expect("attendance");

        assert_eq!(attendance.absences.len(), 1);
        assert_eq!(attendance.delays.len(), 1);
        assert_eq!(attendance.delays.first().map(|delay| delay.minutes), Some(10));
    }

    #[test]
    fn absence_permission_grants_attendance_periods() {
        let permissions = ["READ_ABSENCE_FILES", "READ_EVALUATIONS", "READ_ABSENCE_FILES"]
            .map(String::from);
        assert_eq!(
            capabilities_from_permissions(&permissions),
            vec![
                Capability::Refresh,
                Capability::Attendance,
                Capability::AttendancePeriods,
                Capability::Grades,
            ]
        );
    }

    #[tokio::test]
    async fn attendance_periods_reuse_the_school_periods() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/bff-sko-app/periods"))
            .and(query_param("filter[student.id]", "U1"))
            .and(header("authorization", "Bearer at-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [
                {"id": "P1", "attributes": {"label": "Trimestre 1",
                  "startDate": "2024-09-02", "endDate": "2024-11-30"}},
                {"id": "P2", "attributes": {"label": "Trimestre 2",
                  "startDate": "2024-12-01", "endDate": "2025-03-15"}}
            ]})))
            .expect(1)
            .mount(&server)
            .await;

        let periods = plugin()
            .attendance_periods(&session(&server))
            .await
            .expect("attendance periods");

        assert_eq!(periods.len(), 2);
        let first = periods.first().expect("first period");
        assert_eq!(first.id, "P1");
        assert_eq!(first.name, "Trimestre 1");
        assert_eq!(
            first.end,
            NaiveDate::from_ymd_opt(2024, 11, 30).expect("valid date")
        );
        assert_eq!(first.link_id, ServiceLinkId("ent".into()));
    }

    #[tokio::test]
    async fn news_come_from_the_school_feed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/bff-sko-app/schools/SCH1/news"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [
                {"id": "n1", "attributes": {"title": "Sortie au musée",
                  "publishedAt": "2024-10-10T07:00:00Z"}}
            ]})))
            .mount(&server)
            .await;

        let news = plugin().news(&session(&server)).await.expect("news");
        assert_eq!(news.first().map(|item| item.title.as_str()), Some("Sortie au musée"));
    }

    #[tokio::test]
    async fn expired_token_surfaces_as_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/bff-sko-app/periods"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = plugin()
            .grades_periods(&session(&server))
            .await
            .expect_err("expired");
        assert!(is_unauthorized(&err));
    }
}
