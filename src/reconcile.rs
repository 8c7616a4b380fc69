//! Decides which of today's plays are new and when they happened.
//!
//! The history page has no play identifiers and no per-play times, only an
//! ordering. A play is identified by its `(track, artist, album)` triple
//! and its freshness by position: plays drift toward the end of the list as
//! newer plays arrive, so a track found further toward the front than any
//! stored record of it has been played again.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};

use crate::store::{NewScrobbleRow, ScrobbleRow};
use crate::timestamp::{self, SpreadStrategy};
use crate::ytmusic::HistoryEntry;

const TOPIC_SUFFIX: &str = "- Topic";

pub const DEFAULT_FIRST_RUN_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlayKey {
    pub track_name: String,
    pub artist_name: String,
    pub album_name: String,
}

impl PlayKey {
    fn of_row(row: &ScrobbleRow) -> Self {
        Self {
            track_name: row.track_name.clone(),
            artist_name: row.artist_name.clone(),
            album_name: row.album_name.clone(),
        }
    }
}

/// One play observed on the history page. `position` 0 is the most recent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayRecord {
    pub track_name: String,
    pub artist_name: String,
    pub album_name: String,
    pub position: i64,
}

impl PlayRecord {
    pub fn new(track_name: &str, artist_name: &str, album_name: Option<&str>, position: i64) -> Self {
        let album_name = album_name
            .map(str::trim)
            .filter(|album| !album.is_empty())
            .unwrap_or(track_name);
        Self {
            track_name: track_name.to_string(),
            artist_name: artist_name.to_string(),
            album_name: album_name.to_string(),
            position,
        }
    }

    pub fn key(&self) -> PlayKey {
        PlayKey {
            track_name: self.track_name.clone(),
            artist_name: self.artist_name.clone(),
            album_name: self.album_name.clone(),
        }
    }

    /// Auto-generated channels whose uploads duplicate the real artist.
    pub fn is_topic_channel(&self) -> bool {
        self.artist_name.trim_end().ends_with(TOPIC_SUFFIX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingTrack,
    MissingArtist,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingTrack => write!(f, "missing track name"),
            SkipReason::MissingArtist => write!(f, "missing artist name"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub position: i64,
    pub description: String,
    pub reason: SkipReason,
}

/// Turns extracted entries into records, dropping the ones that cannot be scrobbled.
pub fn records_from_history(entries: &[HistoryEntry]) -> (Vec<PlayRecord>, Vec<Skipped>) {
    let mut records = Vec::new();
    let mut skipped = Vec::new();
    for entry in entries {
        let track = entry.track_name.as_deref().map(str::trim).unwrap_or_default();
        let artist = entry.artist_name.as_deref().map(str::trim).unwrap_or_default();
        let reason = if track.is_empty() {
            Some(SkipReason::MissingTrack)
        } else if artist.is_empty() {
            Some(SkipReason::MissingArtist)
        } else {
            None
        };
        if let Some(reason) = reason {
            let description = format!(
                "{} - {}",
                if artist.is_empty() { "?" } else { artist },
                if track.is_empty() { "?" } else { track }
            );
            log::info!("Skipping entry at position {}: {reason}", entry.position);
            skipped.push(Skipped {
                position: entry.position,
                description,
                reason,
            });
            continue;
        }
        records.push(PlayRecord::new(
            track,
            artist,
            entry.album_name.as_deref(),
            entry.position,
        ));
    }
    (records, skipped)
}

/// How a track found further toward the front than its stored record is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayRule {
    /// Any forward move is a fresh play.
    #[default]
    MovedForward,
    /// A forward move is a fresh play only if the track overtook an entry
    /// that was ahead of it on the previous run. Uniform shifts, such as an
    /// entry being removed from the page, are treated as reordering.
    Overtook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionReason {
    TopicChannel,
    BootstrapBacklog,
}

impl std::fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExclusionReason::TopicChannel => write!(f, "topic channel"),
            ExclusionReason::BootstrapBacklog => write!(f, "beyond first-run limit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Not yet scrobbled: dispatch, then record.
    New,
    /// Matches a stored row.
    Repeat { row_id: i64 },
    /// Record without dispatching.
    Excluded(ExclusionReason),
}

/// Stored row a fresh play of the same track was matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replay {
    pub row_id: i64,
    /// Its `max_array_position` before this run.
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEntry {
    pub record: PlayRecord,
    pub classification: Classification,
    /// Set for `New` entries only.
    pub timestamp: Option<i64>,
    pub replay_of: Option<Replay>,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub entries: Vec<PlannedEntry>,
    pub skipped: Vec<Skipped>,
    /// `(row id, position)` pairs raising `max_array_position`.
    pub bumps: Vec<(i64, i64)>,
    /// Nothing stored inside the window.
    pub cold_start: bool,
    /// Nothing stored at all.
    pub first_ever: bool,
    pub strategy: SpreadStrategy,
}

impl Plan {
    pub fn to_dispatch(&self) -> impl Iterator<Item = &PlannedEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.classification == Classification::New)
    }

    pub fn excluded(&self) -> impl Iterator<Item = &PlannedEntry> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.classification, Classification::Excluded(_)))
    }

    pub fn repeats(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.classification, Classification::Repeat { .. }))
            .count()
    }

    /// Row to persist for a `New` or `Excluded` entry.
    pub fn row_for(&self, entry: &PlannedEntry, now: DateTime<Utc>) -> NewScrobbleRow {
        NewScrobbleRow {
            track_name: entry.record.track_name.clone(),
            artist_name: entry.record.artist_name.clone(),
            album_name: entry.record.album_name.clone(),
            scrobbled_at: now,
            array_position: entry.record.position,
            is_first_time_scrobble: self.first_ever,
            played_at: entry.timestamp,
        }
    }
}

/// Heuristic for frequent runs catching many plays at once.
#[derive(Debug, Clone, Copy)]
pub struct FastCadence {
    pub min_new: usize,
    pub max_elapsed: Duration,
}

impl Default for FastCadence {
    fn default() -> Self {
        Self {
            min_new: 5,
            max_elapsed: Duration::minutes(15),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    pub replay_rule: ReplayRule,
    /// Cap on plays dispatched on the very first run; the rest are only recorded.
    pub first_run_limit: Option<usize>,
    pub fast_cadence: FastCadence,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            replay_rule: ReplayRule::default(),
            first_run_limit: Some(DEFAULT_FIRST_RUN_LIMIT),
            fast_cadence: FastCadence::default(),
        }
    }
}

/// What the store knew before this run.
#[derive(Debug, Clone)]
pub struct PriorState {
    /// Rows inside the classification window.
    pub rows: Vec<ScrobbleRow>,
    pub last_run: Option<DateTime<Utc>>,
    pub latest_played_at: Option<i64>,
    /// The store held no rows at all, inside or outside the window.
    pub first_ever: bool,
}

impl PriorState {
    /// New timestamps must come after everything already sent.
    fn timestamp_floor(&self) -> Option<i64> {
        self.latest_played_at.map(|latest| latest + 1)
    }
}

enum Match {
    None,
    Repeat { row_id: i64, previous_max: i64 },
    Forward { row_id: i64, previous_max: i64 },
}

impl Match {
    fn previous_max(&self) -> Option<i64> {
        match self {
            Match::None => None,
            Match::Repeat { previous_max, .. } | Match::Forward { previous_max, .. } => {
                Some(*previous_max)
            }
        }
    }
}

pub fn reconcile(
    mut records: Vec<PlayRecord>,
    skipped: Vec<Skipped>,
    prior: &PriorState,
    options: &ReconcileOptions,
    now: DateTime<Utc>,
) -> Plan {
    records.sort_by_key(|record| record.position);
    let cold_start = prior.rows.is_empty();

    let mut candidates: HashMap<PlayKey, Vec<&ScrobbleRow>> = HashMap::new();
    for row in &prior.rows {
        candidates.entry(PlayKey::of_row(row)).or_default().push(row);
    }
    log_duplicate_identities(&records);

    let mut matched: HashSet<i64> = HashSet::new();
    let mut bumps = Vec::new();
    let matches: Vec<Match> = records
        .iter()
        .map(|record| {
            let Some(rows) = candidates.get(&record.key()) else {
                return Match::None;
            };
            let unmatched = rows.iter().filter(|row| !matched.contains(&row.id));
            let behind = unmatched
                .clone()
                .filter(|row| row.max_array_position <= record.position)
                .max_by_key(|row| (row.max_array_position, row.id));
            if let Some(row) = behind {
                matched.insert(row.id);
                if record.position > row.max_array_position {
                    bumps.push((row.id, record.position));
                }
                return Match::Repeat {
                    row_id: row.id,
                    previous_max: row.max_array_position,
                };
            }
            match unmatched.min_by_key(|row| (row.max_array_position, std::cmp::Reverse(row.id))) {
                Some(row) => {
                    matched.insert(row.id);
                    Match::Forward {
                        row_id: row.id,
                        previous_max: row.max_array_position,
                    }
                }
                None => Match::None,
            }
        })
        .collect();

    let mut entries = Vec::with_capacity(records.len());
    let mut dispatch_count = 0usize;
    for (index, record) in records.iter().enumerate() {
        let replay_of = match &matches[index] {
            Match::None => None,
            Match::Repeat { row_id, .. } => {
                entries.push(PlannedEntry {
                    record: record.clone(),
                    classification: Classification::Repeat { row_id: *row_id },
                    timestamp: None,
                    replay_of: None,
                });
                continue;
            }
            Match::Forward {
                row_id,
                previous_max,
            } => {
                let fresh = match options.replay_rule {
                    ReplayRule::MovedForward => true,
                    ReplayRule::Overtook => {
                        overtook(record.position, *previous_max, &records, &matches)
                    }
                };
                if !fresh {
                    log::debug!(
                        "{} - {} moved from {previous_max} to {} without overtaking; treating as reorder",
                        record.artist_name,
                        record.track_name,
                        record.position
                    );
                    entries.push(PlannedEntry {
                        record: record.clone(),
                        classification: Classification::Repeat { row_id: *row_id },
                        timestamp: None,
                        replay_of: None,
                    });
                    continue;
                }
                Some(Replay {
                    row_id: *row_id,
                    position: *previous_max,
                })
            }
        };

        let classification = if record.is_topic_channel() {
            Classification::Excluded(ExclusionReason::TopicChannel)
        } else if prior.first_ever
            && options.first_run_limit.is_some_and(|limit| dispatch_count >= limit)
        {
            Classification::Excluded(ExclusionReason::BootstrapBacklog)
        } else {
            dispatch_count += 1;
            Classification::New
        };
        entries.push(PlannedEntry {
            record: record.clone(),
            classification,
            timestamp: None,
            replay_of,
        });
    }

    let strategy = select_strategy(cold_start, dispatch_count, prior.last_run, options, now);
    let stamps = timestamp::spread(
        dispatch_count,
        strategy,
        now.timestamp(),
        prior.timestamp_floor(),
    );
    let mut stamps = stamps.into_iter();
    for entry in &mut entries {
        if entry.classification == Classification::New {
            entry.timestamp = stamps.next();
        }
    }

    Plan {
        entries,
        skipped,
        bumps,
        cold_start,
        first_ever: prior.first_ever,
        strategy,
    }
}

/// Whether a record at `position` now precedes one that preceded it before.
fn overtook(position: i64, previous_max: i64, records: &[PlayRecord], matches: &[Match]) -> bool {
    records.iter().zip(matches).any(|(other, other_match)| {
        other.position > position
            && other_match
                .previous_max()
                .is_some_and(|other_max| other_max < previous_max)
    })
}

fn select_strategy(
    cold_start: bool,
    dispatch_count: usize,
    last_run: Option<DateTime<Utc>>,
    options: &ReconcileOptions,
    now: DateTime<Utc>,
) -> SpreadStrategy {
    if cold_start {
        return SpreadStrategy::ColdStart;
    }
    let recent_run = last_run.is_some_and(|last| now - last <= options.fast_cadence.max_elapsed);
    if recent_run && dispatch_count >= options.fast_cadence.min_new {
        return SpreadStrategy::FastCadence;
    }
    SpreadStrategy::Hourly
}

fn log_duplicate_identities(records: &[PlayRecord]) {
    let mut counts: HashMap<PlayKey, usize> = HashMap::new();
    for record in records {
        *counts.entry(record.key()).or_default() += 1;
    }
    for (key, count) in counts.into_iter().filter(|(_, count)| *count > 1) {
        log::warn!(
            "{} - {} appears {count} times in today's history; matching lowest positions first",
            key.artist_name,
            key.track_name
        );
    }
}
