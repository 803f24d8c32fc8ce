//! Action feeds.
//!
//! Actions arrive as newline-delimited JSON records:
//!
//! ```text
//! {"type": "new_robot", "round": 1, "creator": "ada", "robot_type": "wanderer", "code": "...", "uid": "r-1"}
//! ```
//!
//! `robot_type` may also be given by index (`0` is the wanderer). `code` is
//! either a program bundle or the source of a lone `bot` module.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GameError, GameResult};
use crate::robot::RobotType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    NewRobot(NewRobot),
}

impl Action {
    /// Round in which the action takes effect.
    pub fn round(&self) -> u64 {
        match self {
            Self::NewRobot(spawn) => spawn.round,
        }
    }

    pub fn parse(line: &str) -> GameResult<Self> {
        serde_json::from_str(line).map_err(GameError::json("action"))
    }
}

/// Request to spawn a robot running `code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRobot {
    pub round: u64,
    pub creator: String,
    pub robot_type: RobotTypeTag,
    pub code: String,
    pub uid: String,
}

/// Robot type as written in a feed: by name or by index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RobotTypeTag {
    Index(u64),
    Name(String),
}

impl RobotTypeTag {
    pub fn resolve(&self) -> Option<RobotType> {
        match self {
            Self::Index(index) => RobotType::from_index(*index),
            Self::Name(name) => RobotType::from_name(name),
        }
    }
}

impl From<RobotType> for RobotTypeTag {
    fn from(ty: RobotType) -> Self {
        Self::Name(ty.name().to_string())
    }
}

/// Where the game reads new actions from. Polled once per round.
pub trait ActionSource {
    /// Actions that arrived since the last poll, in arrival order.
    fn poll(&mut self) -> GameResult<Vec<Action>>;
}

// ══════════════════════════════════════════════════════════════════════════════
// File Feed
// ══════════════════════════════════════════════════════════════════════════════

/// An append-only JSONL file, re-read from the last consumed byte.
///
/// Complete lines that fail to parse are logged and skipped. An
/// unterminated last line is consumed only once it parses, so a writer
/// caught mid-append is picked up on a later poll.
#[derive(Debug, Clone)]
pub struct FileFeed {
    path: PathBuf,
    offset: u64,
}

impl FileFeed {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            offset: 0,
        }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl ActionSource for FileFeed {
    fn poll(&mut self) -> GameResult<Vec<Action>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        file.seek(SeekFrom::Start(self.offset))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut actions = Vec::new();
        let mut consumed = 0;
        while consumed < bytes.len() {
            let rest = &bytes[consumed..];
            match rest.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    if let Some(action) = parse_record(&rest[..end], self.offset + consumed as u64) {
                        actions.push(action);
                    }
                    consumed += end + 1;
                }
                None => {
                    let text = std::str::from_utf8(rest).ok().map(str::trim);
                    match text.filter(|t| !t.is_empty()).map(Action::parse) {
                        Some(Ok(action)) => {
                            actions.push(action);
                            consumed = bytes.len();
                        }
                        _ => break,
                    }
                }
            }
        }
        self.offset += consumed as u64;
        debug!(path = %self.path.display(), offset = self.offset, new = actions.len(), "polled action feed");
        Ok(actions)
    }
}

fn parse_record(line: &[u8], offset: u64) -> Option<Action> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(err) => {
            warn!(offset, %err, "skipping action that is not UTF-8");
            return None;
        }
    };
    if text.is_empty() {
        return None;
    }
    match Action::parse(text) {
        Ok(action) => Some(action),
        Err(err) => {
            warn!(offset, %err, "skipping malformed action");
            None
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Memory Feed
// ══════════════════════════════════════════════════════════════════════════════

/// In-process feed. Clones share one queue, so a handle kept outside the
/// game can keep pushing actions.
#[derive(Debug, Clone, Default)]
pub struct MemoryFeed {
    queue: Rc<RefCell<VecDeque<Action>>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, action: Action) {
        self.queue.borrow_mut().push_back(action);
    }

    pub fn push_line(&self, line: &str) -> GameResult<()> {
        self.push(Action::parse(line)?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

impl ActionSource for MemoryFeed {
    fn poll(&mut self) -> GameResult<Vec<Action>> {
        Ok(self.queue.borrow_mut().drain(..).collect())
    }
}
