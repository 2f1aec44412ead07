//! One function per subcommand; each prints plain text to stdout.
#![expect(clippy::print_stdout, reason = "command output goes to the terminal")]

use anyhow::{Result, anyhow};
use cartable_core::{
    AccountManager, DateRange, Federated, Period,
    grades::{ScoreTarget, build_subjects, global_average, influence, is_defined, subject_averages},
};
use chrono::{Local, NaiveDate, TimeDelta};

/// Links with their session state and capabilities.
pub async fn links(manager: &AccountManager) -> Result<()> {
    let account = manager.account().await;
    println!("{} ({})", account.display_name, account.id);
    for link in &account.links {
        let state = match manager.handle(&link.id).await {
            Ok(handle) => format!("{:?}", handle.state().await),
            Err(_) => String::from("not loaded"),
        };
        let capabilities: Vec<String> = link
            .capabilities
            .iter()
            .map(ToString::to_string)
            .collect();
        println!(
            "  {:<12} {:<10} {:<14} {}",
            link.id,
            link.provider,
            state,
            capabilities.join(", ")
        );
    }
    Ok(())
}

/// Lessons of the week containing `date`.
pub async fn timetable(manager: &AccountManager, date: Option<NaiveDate>) -> Result<()> {
    let week = DateRange::week_of(date.unwrap_or_else(today));
    let lessons = manager.weekly_timetable(week).await;
    for lesson in &lessons.data {
        println!(
            "{}  {}-{}  {:<24} {:<16} {:?}",
            lesson.start.format("%a %d/%m"),
            lesson.start.format("%H:%M"),
            lesson.end.format("%H:%M"),
            lesson.subject,
            lesson.room.as_deref().unwrap_or("-"),
            lesson.status
        );
    }
    report_failures(&lessons);
    Ok(())
}

/// Grading and attendance periods.
pub async fn periods(manager: &AccountManager) -> Result<()> {
    let grading = manager.grades_periods().await;
    println!("Grades");
    for period in &grading.data {
        print_period(period);
    }
    report_failures(&grading);

    let attendance = manager.attendance_periods().await;
    println!("Attendance");
    for period in &attendance.data {
        print_period(period);
    }
    report_failures(&attendance);
    Ok(())
}

/// Grades of one period grouped by subject, with averages and per-grade influence.
pub async fn grades(manager: &AccountManager, period_id: Option<&str>) -> Result<()> {
    let periods = manager.grades_periods().await;
    report_failures(&periods);
    let period = pick_period(&periods.data, period_id, today())
        .ok_or_else(|| anyhow!("no grading period available"))?;
    println!("{} ({})", period.name, period.link_id);

    let grades = manager.grades_for_period(period).await?;
    let subjects = build_subjects(&grades);
    let averages = subject_averages(&subjects);
    let global = global_average(&subjects, ScoreTarget::Student);

    for subject in &subjects {
        println!(
            "{:<28} {:>6}  class {:>6}",
            subject.name, subject.student_average, subject.class_average
        );
        for grade in &subject.grades {
            println!(
                "    {}  {:>6}/{:<3} x{:<4} {:+.2}  {}",
                grade.given_at.format("%d/%m"),
                grade.student_score,
                grade.out_of,
                grade.coefficient,
                influence(grade, &subject.grades, &averages, global),
                grade.description
            );
        }
    }
    println!(
        "Global average {}  class {}",
        format_average(global),
        format_average(global_average(&subjects, ScoreTarget::Average))
    );
    Ok(())
}

/// Absences, delays and punishments of one attendance period.
pub async fn attendance(manager: &AccountManager, period_id: Option<&str>) -> Result<()> {
    let periods = manager.attendance_periods().await;
    report_failures(&periods);
    let period = pick_period(&periods.data, period_id, today())
        .ok_or_else(|| anyhow!("no attendance period available"))?;

    let attendance = manager.attendance_for_period(period).await?;
    println!("{} absences", attendance.absences.len());
    for absence in &attendance.absences {
        println!(
            "  {} -> {}  {}  {}",
            absence.from.format("%d/%m %H:%M"),
            absence.to.format("%d/%m %H:%M"),
            if absence.justified { "justified" } else { "unjustified" },
            absence.reason.as_deref().unwrap_or("")
        );
    }
    println!("{} delays", attendance.delays.len());
    for delay in &attendance.delays {
        println!("  {}  {} min", delay.at.format("%d/%m %H:%M"), delay.minutes);
    }
    println!("{} punishments", attendance.punishments.len());
    for punishment in &attendance.punishments {
        println!(
            "  {}  {}  {}",
            punishment.given_at, punishment.nature, punishment.reason
        );
    }
    Ok(())
}

/// Homework due in the next `days` days.
pub async fn homework(manager: &AccountManager, days: u16) -> Result<()> {
    let start = today();
    let range = DateRange {
        start,
        end: start + TimeDelta::days(i64::from(days)),
    };
    let homework = manager.homework(range).await;
    for item in &homework.data {
        println!(
            "{}  [{}] {:<20} {}",
            item.due_at.format("%a %d/%m"),
            if item.done { "x" } else { " " },
            item.subject,
            item.content
        );
    }
    report_failures(&homework);
    Ok(())
}

/// News, newest first.
pub async fn news(manager: &AccountManager) -> Result<()> {
    let news = manager.news().await;
    for item in &news.data {
        println!(
            "{}  {}{}",
            item.published_at.format("%d/%m/%Y"),
            if item.read { "" } else { "* " },
            item.title
        );
    }
    report_failures(&news);
    Ok(())
}

/// Canteen menus of the week containing `date`.
pub async fn canteen(manager: &AccountManager, date: Option<NaiveDate>) -> Result<()> {
    let menus = manager
        .weekly_canteen_menu(date.unwrap_or_else(today))
        .await;
    for menu in &menus.data {
        println!("{}", menu.date.format("%A %d/%m"));
        for dish in &menu.lunch {
            println!("  {:<10?} {}", dish.category, dish.name);
        }
        if !menu.dinner.is_empty() {
            println!("  dinner");
            for dish in &menu.dinner {
                println!("  {:<10?} {}", dish.category, dish.name);
            }
        }
    }
    report_failures(&menus);
    Ok(())
}

/// Canteen card balances.
pub async fn balance(manager: &AccountManager) -> Result<()> {
    let balances = manager.canteen_balances().await;
    for balance in &balances.data {
        let meals = balance
            .remaining_meals
            .map(|meals| format!("  (~{meals} meals)"))
            .unwrap_or_default();
        println!(
            "{:<12} {:<12} {} {}{meals}",
            balance.link_id,
            balance.label,
            format_cents(balance.amount_cents),
            balance.currency
        );
    }
    report_failures(&balances);
    Ok(())
}

/// Conversation threads, most recent first.
pub async fn chats(manager: &AccountManager) -> Result<()> {
    let chats = manager.chats().await;
    for chat in &chats.data {
        println!(
            "{}  {:<3} {:<32} {}",
            chat.last_message_at.format("%d/%m %H:%M"),
            chat.unread,
            chat.subject,
            chat.creator
        );
    }
    report_failures(&chats);
    Ok(())
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn print_period(period: &Period) {
    println!(
        "  {:<10} {:<20} {} -> {}  ({})",
        period.id, period.name, period.start, period.end, period.link_id
    );
}

fn report_failures<T>(result: &Federated<T>) {
    for failure in &result.failures {
        println!(
            "! {} ({}) unavailable: {}",
            failure.link_id, failure.provider, failure.message
        );
    }
}

/// The period named `id`, else the one containing `today`, else the latest.
fn pick_period<'p>(periods: &'p [Period], id: Option<&str>, today: NaiveDate) -> Option<&'p Period> {
    if let Some(id) = id {
        return periods.iter().find(|period| period.id == id);
    }
    periods
        .iter()
        .find(|period| (period.start..=period.end).contains(&today))
        .or_else(|| periods.iter().max_by_key(|period| period.start))
}

fn format_average(average: f64) -> String {
    if is_defined(average) {
        format!("{average:.2}")
    } else {
        String::from("-")
    }
}

fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}
