use std::fmt;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeZone, Utc};

use crate::reconcile::{
    Classification, ExclusionReason, Plan, PlannedEntry, PriorState, ReconcileOptions, SkipReason,
    reconcile, records_from_history,
};
use crate::scrobble::{DispatchOutcome, FailureKind, ScrobbleSink, dispatch};
use crate::store::Database;
use crate::today;
use crate::window::ClassificationWindow;
use crate::ytmusic::{HistoryEntry, HistoryError, HistorySource};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub reconcile: ReconcileOptions,
    /// Plan only: nothing is sent and the store is left untouched.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Scrobbled,
    WouldScrobble,
    AlreadyKnown,
    Excluded(ExclusionReason),
    Skipped(SkipReason),
    Failed(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Scrobbled => write!(f, "scrobbled"),
            Outcome::WouldScrobble => write!(f, "would scrobble"),
            Outcome::AlreadyKnown => write!(f, "already scrobbled"),
            Outcome::Excluded(reason) => write!(f, "recorded only ({reason})"),
            Outcome::Skipped(reason) => write!(f, "skipped ({reason})"),
            Outcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportEntry {
    pub position: i64,
    pub description: String,
    pub timestamp: Option<i64>,
    /// When the earlier play of a replayed track was recorded.
    pub replay_of: Option<DateTime<Utc>>,
    pub outcome: Outcome,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub entries: Vec<ReportEntry>,
    pub history_entries: usize,
    pub today_entries: usize,
    pub pruned: usize,
    pub cold_start: bool,
    pub halted: Option<FailureKind>,
    pub dry_run: bool,
}

impl RunReport {
    fn count(&self, predicate: impl Fn(&Outcome) -> bool) -> usize {
        self.entries
            .iter()
            .filter(|entry| predicate(&entry.outcome))
            .count()
    }

    pub fn scrobbled(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::Scrobbled | Outcome::WouldScrobble))
    }

    pub fn already_known(&self) -> usize {
        self.count(|outcome| *outcome == Outcome::AlreadyKnown)
    }

    pub fn excluded(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::Excluded(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::Failed(_)))
    }

    /// Prints one line per entry followed by the totals.
    pub fn print<Tz: TimeZone>(&self, tz: &Tz)
    where
        Tz::Offset: fmt::Display,
    {
        println!(
            "Fetched {} history entries{}",
            self.history_entries,
            if self.cold_start { "; first run today" } else { "" }
        );
        for entry in &self.entries {
            let when = entry
                .timestamp
                .and_then(|stamp| tz.timestamp_opt(stamp, 0).single())
                .map(|at| format!(" @ {}", at.format("%H:%M:%S")))
                .unwrap_or_default();
            let replay = entry
                .replay_of
                .map(|at| format!(" (replay, first seen {})", at.with_timezone(tz).format("%H:%M")))
                .unwrap_or_default();
            println!(
                "  [{:>3}] {}{when}{replay}: {}",
                entry.position, entry.description, entry.outcome
            );
        }
        println!("{self}");
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.dry_run { "Would scrobble" } else { "Scrobbled" };
        write!(
            f,
            "{verb} {} of {} plays today ({} already known, {} recorded only, {} skipped, {} failed)",
            self.scrobbled(),
            self.today_entries,
            self.already_known(),
            self.excluded(),
            self.skipped(),
            self.failed()
        )?;
        if let Some(kind) = self.halted {
            write!(f, "; stopped after {kind} failures")?;
        }
        Ok(())
    }
}

/// Runs one fetch, reconcile and dispatch cycle against `db`.
pub fn run(
    source: &dyn HistorySource,
    sink: &dyn ScrobbleSink,
    db: &Database,
    window: ClassificationWindow,
    options: &RunOptions,
    now: DateTime<Utc>,
) -> Result<RunReport> {
    let history = source
        .fetch_history()
        .inspect_err(|err| {
            if let Some(HistoryError::Status { body, .. }) = err.downcast_ref::<HistoryError>() {
                log::debug!("History response body: {body}");
            }
        })
        .context("Failed fetching listening history")?;
    let today_entries = todays_entries(&history);
    log::info!(
        "{} of {} history entries are from today",
        today_entries.len(),
        history.len()
    );

    let (records, skipped) = records_from_history(&today_entries);
    let prior = PriorState {
        rows: db.rows_in_window(&window)?,
        last_run: db.last_scrobbled_at()?.filter(|at| window.contains(*at)),
        latest_played_at: db.latest_played_at()?,
        first_ever: db.count()? == 0,
    };
    let plan = reconcile(records, skipped, &prior, &options.reconcile, now);
    log::info!(
        "{} new, {} already known, {} recorded only ({:?} spread{})",
        plan.to_dispatch().count(),
        plan.repeats(),
        plan.excluded().count(),
        plan.strategy,
        if plan.cold_start { ", cold start" } else { "" }
    );

    let mut report = RunReport {
        history_entries: history.len(),
        today_entries: today_entries.len(),
        cold_start: plan.cold_start,
        dry_run: options.dry_run,
        ..RunReport::default()
    };
    let replay_of = replay_origins(&plan, &prior);

    if options.dry_run {
        report.entries = plan_entries(&plan, &replay_of, |_| Outcome::WouldScrobble);
        return Ok(report);
    }

    report.pruned = db.prune_older_than(&window)?;
    if report.pruned > 0 {
        log::info!("Pruned {} rows from before {}", report.pruned, window.start);
    }
    db.bump_max_positions(&plan.bumps)
        .context("Failed updating known positions")?;
    for entry in plan.excluded() {
        db.insert(&plan.row_for(entry, now))
            .context("Failed recording excluded play")?;
    }

    let to_dispatch: Vec<&PlannedEntry> = plan.to_dispatch().collect();
    let dispatched = dispatch(&to_dispatch, sink, |entry| {
        db.insert(&plan.row_for(entry, now))
            .context("Failed recording scrobble; it was sent but will be sent again next run")?;
        Ok(())
    })?;
    report.halted = dispatched.halted;
    log::info!(
        "Dispatch finished: {} sent, {} failed",
        dispatched.sent(),
        dispatched.failed()
    );

    report.entries = plan_entries(&plan, &replay_of, |entry| {
        let outcome = dispatched
            .outcomes
            .iter()
            .find(|(sent, _)| std::ptr::eq(*sent, entry))
            .map(|(_, outcome)| outcome);
        match outcome {
            Some(DispatchOutcome::Sent) => Outcome::Scrobbled,
            Some(DispatchOutcome::Failed { reason, .. }) => Outcome::Failed(reason.clone()),
            Some(DispatchOutcome::NotAttempted { after }) => {
                Outcome::Failed(format!("not attempted after {after} failure"))
            }
            None => Outcome::Failed("no timestamp assigned".to_string()),
        }
    });
    Ok(report)
}

fn todays_entries(history: &[HistoryEntry]) -> Vec<HistoryEntry> {
    let labels = || history.iter().filter_map(|entry| entry.date_label.as_deref());
    let unknown = today::unknown_labels(labels());
    if !unknown.is_empty() {
        log::warn!("Unrecognised date labels: {}", unknown.join(", "));
    }
    let languages = today::today_languages(labels());
    if !languages.is_empty() {
        log::debug!(
            "Today label languages: {}",
            languages.into_iter().collect::<Vec<_>>().join(", ")
        );
    }
    history
        .iter()
        .filter(|entry| entry.date_label.as_deref().is_some_and(today::is_today))
        .cloned()
        .collect()
}

/// When the stored play each replay was matched against was recorded.
fn replay_origins(plan: &Plan, prior: &PriorState) -> Vec<Option<DateTime<Utc>>> {
    plan.entries
        .iter()
        .map(|entry| {
            let replay = entry.replay_of?;
            prior
                .rows
                .iter()
                .find(|row| row.id == replay.row_id)
                .map(|row| row.scrobbled_at)
        })
        .collect()
}

fn plan_entries(
    plan: &Plan,
    replay_of: &[Option<DateTime<Utc>>],
    mut dispatched: impl FnMut(&PlannedEntry) -> Outcome,
) -> Vec<ReportEntry> {
    let mut entries: Vec<ReportEntry> = plan
        .entries
        .iter()
        .zip(replay_of)
        .map(|(entry, replay_of)| ReportEntry {
            position: entry.record.position,
            description: format!("{} - {}", entry.record.artist_name, entry.record.track_name),
            timestamp: entry.timestamp,
            replay_of: *replay_of,
            outcome: match entry.classification {
                Classification::New => dispatched(entry),
                Classification::Repeat { .. } => Outcome::AlreadyKnown,
                Classification::Excluded(reason) => Outcome::Excluded(reason),
            },
        })
        .collect();
    entries.extend(plan.skipped.iter().map(|skipped| ReportEntry {
        position: skipped.position,
        description: skipped.description.clone(),
        timestamp: None,
        replay_of: None,
        outcome: Outcome::Skipped(skipped.reason),
    }));
    entries.sort_by_key(|entry| entry.position);
    entries
}

/// Local-midnight window for the machine's time zone.
pub fn local_day_window(now: DateTime<Utc>) -> ClassificationWindow {
    ClassificationWindow::since_midnight(now, &Local)
}
