use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CompetitionError>;

/// Failure of a competition run as a whole.
///
/// Per-candidate failures that were captured by the driver never show up
/// here; they travel inside the driver's own result type. This error exists
/// for the uncaptured ones, and it never drops a failure: when several were
/// recorded they all ride along in [`AggregateFailure`].
#[derive(Error, Debug)]
pub enum CompetitionError {
    /// Exactly one failure was recorded; it propagates unchanged.
    #[error(transparent)]
    Failure(#[from] anyhow::Error),

    /// More than one failure was recorded. The first becomes the primary,
    /// the rest are attached in recording order.
    #[error("{0}")]
    Aggregate(AggregateFailure),

    /// A worker slot finished without a stored result even though no error
    /// was recorded for it. Indicates a bug in the pool, not in the driver.
    #[error("worker slot {index} finished without recording a result")]
    MissingSlotResult { index: usize },
}

impl CompetitionError {
    /// Collapses a list of recorded failures: empty lists produce no error,
    /// a single failure propagates as-is, several become an aggregate with
    /// the first as primary.
    pub fn from_failures(mut failures: Vec<anyhow::Error>) -> Option<Self> {
        match failures.len() {
            0 => None,
            1 => failures.pop().map(Self::Failure),
            _ => {
                let mut rest = failures.into_iter();
                let primary = rest.next()?;
                Some(Self::Aggregate(AggregateFailure {
                    primary,
                    additional: rest.collect(),
                }))
            }
        }
    }

    /// Flattens back into the underlying failure list, primary first.
    pub fn into_failures(self) -> Vec<anyhow::Error> {
        match self {
            Self::Failure(err) => vec![err],
            Self::Aggregate(agg) => agg.into_failures(),
            other @ Self::MissingSlotResult { .. } => vec![anyhow::Error::new(other)],
        }
    }
}

/// Several failures from one run, in the order they were recorded.
///
/// The pool and engine record execution, cleanup, and finalize failures into
/// one list; the first recorded failure is the primary and is what `source()`
/// exposes, so `?`-style chains still point at the original cause.
#[derive(Debug)]
pub struct AggregateFailure {
    primary: anyhow::Error,
    additional: Vec<anyhow::Error>,
}

impl AggregateFailure {
    pub fn primary(&self) -> &anyhow::Error {
        &self.primary
    }

    pub fn additional(&self) -> &[anyhow::Error] {
        &self.additional
    }

    pub fn failure_count(&self) -> usize {
        1 + self.additional.len()
    }

    fn into_failures(self) -> Vec<anyhow::Error> {
        let mut failures = vec![self.primary];
        failures.extend(self.additional);
        failures
    }
}

impl std::fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.primary)?;
        if !self.additional.is_empty() {
            let count = self.additional.len();
            let rest = self
                .additional
                .iter()
                .map(|err| err.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            write!(f, " (and {count} more: {rest})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.primary.as_ref())
    }
}

/// Errors from the supervised spawn layer.
#[derive(Error, Debug)]
pub enum SpawnError {
    /// The command could not be started at all.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// stdout/stderr were configured with `Stdio::piped()` but the pipe
    /// handle was not available after spawn.
    #[error("child {stream} pipe was unexpectedly not available")]
    MissingPipe { stream: &'static str },

    #[error(transparent)]
    Io(#[from] io::Error),
}
