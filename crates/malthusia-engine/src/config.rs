//! Game configuration.

use std::path::Path;

use malthusia_codegen::InstrumentOptions;
use malthusia_sandbox::RuntimeConfig;
use serde::{Deserialize, Serialize};

use crate::error::{GameError, GameResult};

/// Seed used when none is given.
pub const DEFAULT_SEED: u64 = 1337;

/// Everything that shapes one game. Missing JSON fields take defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Drives spawn placement and every robot's `random` module.
    pub seed: u64,
    /// Budget and memory limits of every robot session.
    pub runtime: RuntimeConfig,
    /// Rewrites applied to submitted programs.
    pub instrument: InstrumentOptions,
    /// Euclidean radius a robot can inspect with `check_location`.
    pub vision_radius: i64,
    /// Largest elevation change a single move may climb or descend.
    pub max_elevation_step: i64,
    /// New robots are placed within this Chebyshev distance of the origin
    /// when a free cell is found there.
    pub spawn_radius: i64,
    /// Lines of log and error output kept per robot per turn.
    pub log_capacity: usize,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            runtime: RuntimeConfig::default(),
            instrument: InstrumentOptions::default(),
            vision_radius: 4,
            max_elevation_step: 2,
            spawn_radius: 10,
            log_capacity: 64,
        }
    }
}

impl GameConfig {
    pub fn from_json(text: &str) -> GameResult<Self> {
        serde_json::from_str(text).map_err(GameError::json("game config"))
    }

    pub fn from_file(path: impl AsRef<Path>) -> GameResult<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_the_default() {
        assert_eq!(GameConfig::from_json("{}").unwrap(), GameConfig::default());
    }

    #[test]
    fn nested_runtime_fields_merge_with_defaults() {
        let config = GameConfig::from_json(r#"{"seed": 7, "runtime": {"chess_clock": false}}"#).unwrap();
        assert_eq!(config.seed, 7);
        assert!(!config.runtime.chess_clock);
        assert_eq!(config.runtime.budget_per_turn, 20_000);
        assert_eq!(config.vision_radius, 4);
    }

    #[test]
    fn malformed_config_names_the_document() {
        let err = GameConfig::from_json("{seed").unwrap_err();
        assert!(err.to_string().starts_with("invalid game config"));
    }
}
