//! Malthusia engine: the persistent world robots live in.
//!
//! # Architecture
//!
//! ```text
//! ActionSource ──poll──▶ Game ──turn()──▶ Session (one per robot)
//!                         │                  │ game methods
//!                         ▼                  ▼
//!                    ReplaySink ◀──── World (map + robots)
//! ```
//!
//! [`Game`] owns the sessions and drives rounds. [`World`] is shared with
//! the game methods of every session, which is how `move` and friends
//! reach the map. Positions and cell occupancy only change through
//! `World`, one robot at a time.

pub mod actions;
pub mod config;
pub mod error;
pub mod game;
pub mod map;
pub mod methods;
pub mod replay;
pub mod robot;
pub mod world;

pub use actions::{Action, ActionSource, FileFeed, MemoryFeed, NewRobot, RobotTypeTag};
pub use config::{GameConfig, DEFAULT_SEED};
pub use error::{GameError, GameResult};
pub use game::{compile_program, Game};
pub use map::{Cell, CellRecord, Map};
pub use methods::{direction_module, DIRECTIONS};
pub use replay::{MemoryReplay, ReplayReader, ReplaySink, ReplayWriter, Snapshot, SENTINEL};
pub use robot::{Robot, RobotId, RobotState, RobotType};
pub use world::{MoveError, World};
