use anyhow::Result;

use crate::reconcile::PlannedEntry;
use crate::service::ApiError;
use crate::ytmusic::HistoryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrobbleTrack {
    pub artist: String,
    pub title: String,
    pub album: Option<String>,
    pub timestamp: i64,
}

impl ScrobbleTrack {
    /// `None` for entries that have no timestamp, i.e. are not meant to be sent.
    pub fn from_planned(entry: &PlannedEntry) -> Option<Self> {
        let timestamp = entry.timestamp?;
        let record = &entry.record;
        Some(Self {
            artist: record.artist_name.clone(),
            title: record.track_name.clone(),
            album: Some(record.album_name.clone()).filter(|album| !album.is_empty()),
            timestamp,
        })
    }
}

pub trait ScrobbleSink {
    fn submit(&self, track: &ScrobbleTrack) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Auth,
    Network,
    Temporary,
    Service,
    Unknown,
}

impl FailureKind {
    /// Consecutive failures of this kind after which the batch is abandoned.
    fn halt_after(self) -> usize {
        match self {
            FailureKind::Auth => 1,
            FailureKind::Network => 8,
            FailureKind::Temporary => 15,
            FailureKind::Service => 5,
            FailureKind::Unknown => 7,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Auth => "auth",
            FailureKind::Network => "network",
            FailureKind::Temporary => "temporary",
            FailureKind::Service => "service",
            FailureKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

pub fn categorize(err: &anyhow::Error) -> FailureKind {
    for cause in err.chain() {
        if let Some(api) = cause.downcast_ref::<ApiError>() {
            return api.kind();
        }
        if let Some(history) = cause.downcast_ref::<HistoryError>() {
            return match history {
                HistoryError::IncompleteCookie | HistoryError::Unauthenticated => FailureKind::Auth,
                HistoryError::Status { status, .. } => status_kind(status.as_u16()),
                HistoryError::NoInitialData | HistoryError::NoResults => FailureKind::Unknown,
            };
        }
        if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
            if let Some(status) = http.status() {
                return status_kind(status.as_u16());
            }
            return FailureKind::Network;
        }
    }
    categorize_message(&format!("{err:#}"))
}

fn status_kind(status: u16) -> FailureKind {
    match status {
        401 | 403 => FailureKind::Auth,
        429 | 502 | 503 | 504 => FailureKind::Temporary,
        500..=599 => FailureKind::Service,
        _ => FailureKind::Unknown,
    }
}

fn categorize_message(message: &str) -> FailureKind {
    let lowered = message.to_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|needle| lowered.contains(needle));
    if contains_any(&["401", "unauthenticated", "authentication", "invalid session"]) {
        return FailureKind::Auth;
    }
    if contains_any(&[
        "503",
        "502",
        "429",
        "service unavailable",
        "bad gateway",
        "too many requests",
        "rate limit",
        "temporarily unavailable",
        "try again later",
    ]) {
        return FailureKind::Temporary;
    }
    if contains_any(&["timed out", "timeout", "connection", "network", "dns"]) {
        return FailureKind::Network;
    }
    if contains_any(&["audioscrobbler", "last.fm", "libre.fm", "scrobble"]) {
        return FailureKind::Service;
    }
    FailureKind::Unknown
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    Failed { kind: FailureKind, reason: String },
    /// Dispatch stopped before this entry was tried.
    NotAttempted { after: FailureKind },
}

#[derive(Debug, Default)]
pub struct DispatchReport<'a> {
    pub outcomes: Vec<(&'a PlannedEntry, DispatchOutcome)>,
    pub halted: Option<FailureKind>,
}

impl DispatchReport<'_> {
    pub fn sent(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == DispatchOutcome::Sent)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.sent()
    }
}

/// Submits `entries` oldest first, one at a time, calling `commit` right
/// after each accepted submission. A failed commit aborts dispatch since
/// the store can no longer vouch for what was sent.
pub fn dispatch<'a>(
    entries: &[&'a PlannedEntry],
    sink: &dyn ScrobbleSink,
    mut commit: impl FnMut(&PlannedEntry) -> Result<()>,
) -> Result<DispatchReport<'a>> {
    let mut report = DispatchReport::default();
    let mut ordered: Vec<&'a PlannedEntry> = entries.to_vec();
    ordered.sort_by_key(|entry| entry.timestamp);
    let mut streak: Option<(FailureKind, usize)> = None;

    for entry in ordered {
        if let Some(kind) = report.halted {
            report
                .outcomes
                .push((entry, DispatchOutcome::NotAttempted { after: kind }));
            continue;
        }
        let Some(track) = ScrobbleTrack::from_planned(entry) else {
            log::warn!(
                "No timestamp assigned to {} - {}; not dispatching",
                entry.record.artist_name,
                entry.record.track_name
            );
            continue;
        };
        match sink.submit(&track) {
            Ok(()) => {
                streak = None;
                commit(entry)?;
                log::info!("Scrobbled {} - {} at {}", track.artist, track.title, track.timestamp);
                report.outcomes.push((entry, DispatchOutcome::Sent));
            }
            Err(err) => {
                let kind = categorize(&err);
                let count = match streak {
                    Some((previous, count)) if previous == kind => count + 1,
                    _ => 1,
                };
                streak = Some((kind, count));
                log::warn!("Failed scrobbling {} - {} ({kind}): {err:#}", track.artist, track.title);
                report.outcomes.push((
                    entry,
                    DispatchOutcome::Failed {
                        kind,
                        reason: format!("{err:#}"),
                    },
                ));
                if count >= kind.halt_after() {
                    log::error!("Stopping dispatch after {count} consecutive {kind} failures");
                    report.halted = Some(kind);
                }
            }
        }
    }
    Ok(report)
}
