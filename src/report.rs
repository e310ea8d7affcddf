//! Per-tile outcomes of a run and the batch report built from them.
use crate::dem::DemTileRef;
use crate::error::{DemError, Result};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "kebab-case")]
pub enum FailureReason {
    TokenExpired,
    NotFound,
    Integrity(String),
    ExtractError(String),
    Network(String),
    ServiceUnavailable(String),
    AuthRejected(String),
    Io(String),
}

impl From<&DemError> for FailureReason {
    fn from(err: &DemError) -> Self {
        match err {
            DemError::NotFound(_) => FailureReason::NotFound,
            DemError::TokenBudgetExhausted { .. } | DemError::NotAuthenticated => {
                FailureReason::TokenExpired
            }
            DemError::Integrity(m) => FailureReason::Integrity(m.clone()),
            DemError::Extract(m) => FailureReason::ExtractError(m.clone()),
            DemError::Network(m) => FailureReason::Network(m.clone()),
            DemError::AuthRejected(m) => FailureReason::AuthRejected(m.clone()),
            DemError::Io(e) => FailureReason::Io(e.to_string()),
            other => FailureReason::ServiceUnavailable(other.to_string()),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::TokenExpired => write!(f, "token-expired"),
            FailureReason::NotFound => write!(f, "not-found"),
            FailureReason::Integrity(m) => write!(f, "integrity: {m}"),
            FailureReason::ExtractError(m) => write!(f, "extract-error: {m}"),
            FailureReason::Network(m) => write!(f, "network: {m}"),
            FailureReason::ServiceUnavailable(m) => write!(f, "service-unavailable: {m}"),
            FailureReason::AuthRejected(m) => write!(f, "auth-rejected: {m}"),
            FailureReason::Io(m) => write!(f, "io: {m}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum OutcomeStatus {
    Fetched,
    SkippedExists,
    Failed(FailureReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalOutcome {
    pub tile: DemTileRef,
    pub status: OutcomeStatus,
    pub output_path: Option<PathBuf>,
}

impl RetrievalOutcome {
    pub fn fetched(tile: DemTileRef, path: PathBuf) -> Self {
        Self {
            tile,
            status: OutcomeStatus::Fetched,
            output_path: Some(path),
        }
    }

    pub fn skipped(tile: DemTileRef, path: PathBuf) -> Self {
        Self {
            tile,
            status: OutcomeStatus::SkippedExists,
            output_path: Some(path),
        }
    }

    pub fn failed(tile: DemTileRef, reason: FailureReason) -> Self {
        Self {
            tile,
            status: OutcomeStatus::Failed(reason),
            output_path: None,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self.status, OutcomeStatus::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum Termination {
    Completed,
    Aborted { reason: String },
}

/// How the run went, as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    FullySucceeded,
    /// Every item failed because the catalog had nothing for it
    NothingFound,
    AllFailed,
    Partial,
    Aborted,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub fetched: usize,
    pub skipped: usize,
    pub not_found: usize,
    pub token_expired: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<RetrievalOutcome>,
    pub termination: Termination,
}

impl BatchReport {
    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for outcome in &self.outcomes {
            match &outcome.status {
                OutcomeStatus::Fetched => summary.fetched += 1,
                OutcomeStatus::SkippedExists => summary.skipped += 1,
                OutcomeStatus::Failed(FailureReason::NotFound) => summary.not_found += 1,
                OutcomeStatus::Failed(FailureReason::TokenExpired) => summary.token_expired += 1,
                OutcomeStatus::Failed(_) => summary.failed += 1,
            }
        }
        summary
    }

    pub fn verdict(&self) -> Verdict {
        if matches!(self.termination, Termination::Aborted { .. }) {
            return Verdict::Aborted;
        }
        let succeeded = self.outcomes.iter().filter(|o| o.is_success()).count();
        if succeeded == self.outcomes.len() {
            Verdict::FullySucceeded
        } else if succeeded > 0 {
            Verdict::Partial
        } else if self.summary().not_found == self.outcomes.len() {
            Verdict::NothingFound
        } else {
            Verdict::AllFailed
        }
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Collects one outcome per planned tile. Slots are indexed by plan
/// position so the report keeps the plan order whatever order the
/// downloads finish in.
#[derive(Debug)]
pub struct ReportBuilder {
    tiles: Vec<DemTileRef>,
    slots: Vec<Option<RetrievalOutcome>>,
    aborted: Option<String>,
}

impl ReportBuilder {
    pub fn new(tiles: Vec<DemTileRef>) -> Self {
        let slots = vec![None; tiles.len()];
        Self {
            tiles,
            slots,
            aborted: None,
        }
    }

    pub fn record(&mut self, index: usize, outcome: RetrievalOutcome) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(outcome);
        }
    }

    pub fn is_recorded(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(Option::is_some)
    }

    /// Marks every item without an outcome as failed because the session
    /// ran out. Items already recorded keep their outcome.
    pub fn abort(&mut self, err: &DemError) {
        for (slot, tile) in self.slots.iter_mut().zip(&self.tiles) {
            if slot.is_none() {
                *slot = Some(RetrievalOutcome::failed(
                    tile.clone(),
                    FailureReason::TokenExpired,
                ));
            }
        }
        self.aborted = Some(err.to_string());
    }

    pub fn finish(self) -> BatchReport {
        let outcomes = self
            .slots
            .into_iter()
            .zip(self.tiles)
            .map(|(slot, tile)| {
                slot.unwrap_or_else(|| {
                    RetrievalOutcome::failed(
                        tile,
                        FailureReason::Io("item was never processed".to_string()),
                    )
                })
            })
            .collect();
        let termination = match self.aborted {
            Some(reason) => Termination::Aborted { reason },
            None => Termination::Completed,
        };
        BatchReport {
            outcomes,
            termination,
        }
    }
}
