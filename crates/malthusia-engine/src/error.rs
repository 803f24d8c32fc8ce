//! Simulation error types.

use thiserror::Error;

/// Faults of the simulation itself, as opposed to faults of a robot.
///
/// Robot failures never surface here: they kill the robot and the game
/// continues.
#[derive(Debug, Error)]
pub enum GameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A configuration, map or replay document failed to parse.
    #[error("invalid {what}: {source}")]
    Json {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// The map lists the same coordinates twice.
    #[error("map defines cell ({x}, {y}) more than once")]
    DuplicateCell { x: i64, y: i64 },

    /// World state disagrees with itself; the game cannot continue.
    #[error("world invariant violated: {0}")]
    Invariant(String),
}

impl GameError {
    pub(crate) fn json(what: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| Self::Json { what, source }
    }
}

/// Game result type alias.
pub type GameResult<T> = Result<T, GameError>;
