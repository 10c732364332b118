//! Subcommand handlers. Output goes to stdout; diagnostics go through tracing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use careminder_core::config::CareminderConfig;
use careminder_core::{Category, ReminderContent, ReminderId};
use careminder_scheduler::engine::NotifierEngine;
use careminder_scheduler::types::FiredNotification;
use careminder_scheduler::{
    format_relative, format_time, next_occurrence, Clock, NotifierHandle, RecurrenceSpec,
    ReminderDraft, ReminderRecord, ReminderScheduler, ScheduleOutcome, TimeOfDay, WeekdaySet,
};
use clap::Args;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// How often `run` rolls every reminder's trigger horizon forward.
const REFRESH_EVERY: Duration = Duration::from_secs(6 * 60 * 60);

pub struct App {
    pub scheduler: ReminderScheduler,
    pub notifier: Arc<NotifierHandle>,
    pub clock: Arc<dyn Clock>,
    pub db_path: String,
    pub config: CareminderConfig,
}

/// Notification text overrides.
#[derive(Args)]
pub struct ContentArgs {
    /// Notification title (default: the category's title)
    #[arg(long)]
    pub title: Option<String>,

    /// Notification body (default: "Time for <name>.")
    #[arg(long)]
    pub body: Option<String>,
}

impl ContentArgs {
    fn is_empty(&self) -> bool {
        self.title.is_none() && self.body.is_none()
    }

    /// Apply the overrides on top of `base`.
    fn apply(self, base: ReminderContent) -> ReminderContent {
        ReminderContent {
            title: self.title.unwrap_or(base.title),
            body: self.body.unwrap_or(base.body),
        }
    }
}

/// Fields changed by `edit`; `None` keeps the stored value.
pub struct Edit {
    pub name: Option<String>,
    pub category: Option<Category>,
    pub time: Option<TimeOfDay>,
    pub days: Option<WeekdaySet>,
    pub content: ContentArgs,
}

pub async fn add(
    app: &App,
    name: String,
    category: Category,
    time: TimeOfDay,
    days: Option<WeekdaySet>,
    content: ContentArgs,
) -> Result<()> {
    let weekdays = match days {
        Some(days) => days,
        None if category.defaults_to_daily() => WeekdaySet::every_day(),
        None => bail!("{category} reminders need --days (e.g. --days mon,wed,fri)"),
    };
    let recurrence = RecurrenceSpec::new(time, weekdays)?;

    let mut draft = ReminderDraft::new(name, category, recurrence);
    if !content.is_empty() {
        let base = category.default_content(draft.name.trim());
        draft = draft.with_content(content.apply(base));
    }

    let outcome = app.scheduler.create(draft).await?;
    print_outcome("Added", &outcome, app.clock.now());
    Ok(())
}

pub async fn edit(app: &App, id: &ReminderId, edit: Edit) -> Result<()> {
    let existing = app
        .scheduler
        .get(id)?
        .with_context(|| format!("no reminder with id {id}"))?;

    let mut draft = ReminderDraft::from_record(&existing);
    // Generated content follows a rename or category change; custom text stays.
    if existing.content == existing.category.default_content(&existing.name) {
        draft.content = None;
    }
    if let Some(name) = edit.name {
        draft.name = name;
    }
    if let Some(category) = edit.category {
        draft.category = category;
    }
    draft.recurrence = RecurrenceSpec::new(
        edit.time.unwrap_or(existing.recurrence.time()),
        edit.days.unwrap_or(existing.recurrence.weekdays()),
    )?;
    if !edit.content.is_empty() {
        let base = draft
            .content
            .clone()
            .unwrap_or_else(|| draft.category.default_content(draft.name.trim()));
        draft.content = Some(edit.content.apply(base));
    }

    let outcome = app.scheduler.update(id, draft).await?;
    print_outcome("Updated", &outcome, app.clock.now());
    Ok(())
}

pub async fn remove(app: &App, id: &ReminderId) -> Result<()> {
    let outcome = app.scheduler.delete(id).await?;
    println!(
        "Removed {} ({} trigger(s) cancelled)",
        outcome.id, outcome.cancelled
    );
    for failure in &outcome.cancellation_failures {
        println!("  could not cancel {}: {}", failure.handle, failure.error);
    }
    Ok(())
}

pub fn list(app: &App) -> Result<()> {
    let records = app.scheduler.list()?;
    if records.is_empty() {
        println!("No reminders yet. Create one with `careminder add`.");
        return Ok(());
    }
    let now = app.clock.now();
    for record in &records {
        print_record(record, now);
    }
    Ok(())
}

pub fn upcoming(app: &App, all: bool) -> Result<()> {
    let upcoming = if all {
        app.scheduler.list_upcoming()?
    } else {
        app.scheduler.upcoming()?
    };
    if upcoming.is_empty() {
        println!("Nothing scheduled.");
        return Ok(());
    }
    let now = app.clock.now();
    for entry in upcoming {
        println!(
            "{:<22} {:<24} {}",
            format_relative(entry.occurrence, now),
            entry.record.name,
            entry.record.category.to_string()
        );
    }
    Ok(())
}

pub async fn refresh(app: &App, id: Option<ReminderId>) -> Result<()> {
    let now = app.clock.now();
    match id {
        Some(id) => {
            let outcome = app.scheduler.refresh(&id).await?;
            print_outcome("Refreshed", &outcome, now);
        }
        None => {
            let results = app.scheduler.refresh_all().await?;
            let mut failed = 0;
            for (id, result) in results {
                match result {
                    Ok(outcome) => print_outcome("Refreshed", &outcome, now),
                    Err(e) => {
                        failed += 1;
                        println!("Failed to refresh {id}: {e}");
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} reminder(s) could not be refreshed");
            }
        }
    }
    Ok(())
}

/// Run the notifier engine in the foreground, printing each delivery.
pub async fn run(app: App) -> Result<()> {
    let (fired_tx, mut fired_rx) =
        mpsc::channel::<FiredNotification>(app.config.notifier.channel_capacity);
    let mut engine = NotifierEngine::new(
        rusqlite::Connection::open(&app.db_path)?,
        app.clock.clone(),
        Duration::from_millis(app.config.notifier.poll_interval_ms),
        Some(fired_tx),
    )?
    .with_retention(chrono::Duration::days(i64::from(
        app.config.notifier.retention_days,
    )));

    // Missed triggers must be marked before the refresh below cancels them.
    let missed = engine.mark_missed()?;
    if missed > 0 {
        println!("{missed} notification(s) were missed while careminder was not running");
    }
    refresh_quietly(&app.scheduler).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx));

    let mut refresh = tokio::time::interval(REFRESH_EVERY);
    refresh.tick().await;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let pending = app.notifier.list_pending()?.len();
    info!(pending, "careminder running; press Ctrl-C to stop");

    loop {
        tokio::select! {
            Some(fired) = fired_rx.recv() => {
                println!(
                    "[{}] {}: {}",
                    format_time(fired.fired_at.time()),
                    fired.content.title,
                    fired.content.body
                );
            }
            _ = refresh.tick() => refresh_quietly(&app.scheduler).await,
            res = &mut ctrl_c => {
                res?;
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = engine_task.await {
        warn!("notifier engine task failed: {e}");
    }
    Ok(())
}

async fn refresh_quietly(scheduler: &ReminderScheduler) {
    match scheduler.refresh_all().await {
        Ok(results) => {
            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
            info!(reminders = results.len(), failed, "trigger horizon refreshed");
        }
        Err(e) => warn!("horizon refresh failed: {e}"),
    }
}

fn print_outcome(verb: &str, outcome: &ScheduleOutcome, now: chrono::NaiveDateTime) {
    let record = &outcome.record;
    println!(
        "{verb} {} ({}): {} trigger(s) scheduled",
        record.name,
        record.id,
        record.notification_handles.len()
    );
    if let Some(next) = next_occurrence(&record.recurrence, now) {
        println!("  next: {}", format_relative(next, now));
    }
    for failure in &outcome.submission_failures {
        println!(
            "  not scheduled for {}: {}",
            failure.occurrence, failure.error
        );
    }
    for failure in &outcome.cancellation_failures {
        println!("  stale trigger {} dropped: {}", failure.handle, failure.error);
    }
}

fn print_record(record: &ReminderRecord, now: chrono::NaiveDateTime) {
    let next = next_occurrence(&record.recurrence, now)
        .map(|at| format_relative(at, now))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {:<24} {:<10} {} {:<16} {:>2} trigger(s)  next: {}",
        record.id,
        record.name,
        record.category.to_string(),
        format_time(record.recurrence.time().to_naive()),
        record.recurrence.weekdays().summary(),
        record.notification_handles.len(),
        next
    );
}
