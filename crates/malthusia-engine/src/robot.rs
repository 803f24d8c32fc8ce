//! Robot records.
//!
//! A [`Robot`] is the game's view of one robot: position, lifecycle state
//! and the output of its most recent turn. The sandboxed program itself
//! lives in a separate session owned by the [`Game`](crate::Game).

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Spawn-order index of a robot within one game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RobotId(pub u32);

impl fmt::Display for RobotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotType {
    Wanderer,
}

impl RobotType {
    pub const ALL: [RobotType; 1] = [RobotType::Wanderer];

    pub fn name(self) -> &'static str {
        match self {
            Self::Wanderer => "wanderer",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.name() == name)
    }

    /// Numeric form used by older action feeds.
    pub fn from_index(index: u64) -> Option<Self> {
        Self::ALL.get(usize::try_from(index).ok()?).copied()
    }
}

impl fmt::Display for RobotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle: `Unanimated -> Alive -> Dead`. `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotState {
    Unanimated,
    Alive,
    Dead,
}

/// Bounded buffer of output lines; the oldest lines fall off first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputLines(VecDeque<String>);

impl OutputLines {
    pub(crate) fn push(&mut self, line: &str, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.0.len() >= capacity {
            self.0.pop_front();
        }
        self.0.push_back(line.to_string());
    }

    pub(crate) fn clear(&mut self) {
        self.0.clear();
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Robot {
    pub id: RobotId,
    /// Identifier chosen by the submitter; unique per game.
    pub uid: String,
    pub creator: String,
    pub robot_type: RobotType,
    pub x: i64,
    pub y: i64,
    pub state: RobotState,
    #[serde(skip)]
    pub has_moved: bool,
    /// `log(...)` output of the robot's latest turn.
    pub logs: OutputLines,
    /// Error reports of the robot's latest turn.
    pub errors: OutputLines,
    /// Why the robot died.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub death: Option<String>,
}

impl Robot {
    pub fn new(id: RobotId, uid: &str, creator: &str, robot_type: RobotType, x: i64, y: i64) -> Self {
        Self {
            id,
            uid: uid.to_string(),
            creator: creator.to_string(),
            robot_type,
            x,
            y,
            state: RobotState::Unanimated,
            has_moved: false,
            logs: OutputLines::default(),
            errors: OutputLines::default(),
            death: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state == RobotState::Alive
    }

    pub fn position(&self) -> (i64, i64) {
        (self.x, self.y)
    }
}
