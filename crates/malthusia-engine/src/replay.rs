//! Replay stream.
//!
//! Each round's [`Snapshot`] is JSON framed by [`SENTINEL`] on both sides.
//! Four consecutive quotes cannot occur inside well-formed JSON, so a
//! reader that joins mid-stream resynchronizes at the next sentinel.

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{GameError, GameResult};
use crate::robot::{Robot, RobotId};

/// Frame delimiter of the replay stream.
pub const SENTINEL: &str = "\"\"\"\"";

/// World state at the end of one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub round: u64,
    /// Living robots in turn order.
    pub robots: Vec<Robot>,
    /// Dead robots in order of death.
    pub dead: Vec<RobotId>,
}

impl Snapshot {
    pub fn to_json(&self) -> GameResult<String> {
        serde_json::to_string(self).map_err(GameError::json("snapshot"))
    }

    /// The snapshot wrapped in sentinels.
    pub fn to_frame(&self) -> GameResult<String> {
        Ok(format!("{SENTINEL}{}{SENTINEL}", self.to_json()?))
    }
}

/// Receiver of the per-round snapshots.
pub trait ReplaySink {
    fn record(&mut self, snapshot: &Snapshot) -> GameResult<()>;
}

// ══════════════════════════════════════════════════════════════════════════════
// Writers
// ══════════════════════════════════════════════════════════════════════════════

/// Appends framed snapshots to any writer, flushing after each round so
/// a tailing reader sees whole frames promptly.
#[derive(Debug)]
pub struct ReplayWriter<W: Write> {
    out: W,
}

impl<W: Write> ReplayWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl ReplayWriter<BufWriter<File>> {
    /// Create or truncate the replay file at `path`.
    pub fn create(path: impl AsRef<Path>) -> GameResult<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> ReplaySink for ReplayWriter<W> {
    fn record(&mut self, snapshot: &Snapshot) -> GameResult<()> {
        self.out.write_all(snapshot.to_frame()?.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }
}

/// Collects frames in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryReplay {
    frames: Rc<RefCell<Vec<String>>>,
}

impl MemoryReplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.borrow().is_empty()
    }

    /// The whole stream as it would have been written to a file.
    pub fn text(&self) -> String {
        self.frames.borrow().concat()
    }
}

impl ReplaySink for MemoryReplay {
    fn record(&mut self, snapshot: &Snapshot) -> GameResult<()> {
        let frame = snapshot.to_frame()?;
        self.frames.borrow_mut().push(frame);
        Ok(())
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Reader
// ══════════════════════════════════════════════════════════════════════════════

/// Incremental frame splitter for a tailed replay stream.
#[derive(Debug, Clone, Default)]
pub struct ReplayReader {
    buffer: String,
}

impl ReplayReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split a complete stream.
    pub fn read_all(text: &str) -> Vec<Snapshot> {
        Self::new().push(text)
    }

    /// Feed more bytes; returns every snapshot completed by them.
    ///
    /// Text before the first sentinel is discarded, and a candidate frame
    /// that does not parse is treated as the gap between two frames.
    pub fn push(&mut self, chunk: &str) -> Vec<Snapshot> {
        self.buffer.push_str(chunk);
        let mut snapshots = Vec::new();
        loop {
            let Some(start) = self.buffer.find(SENTINEL) else {
                self.keep_partial_sentinel();
                break;
            };
            let body_start = start + SENTINEL.len();
            let Some(len) = self.buffer[body_start..].find(SENTINEL) else {
                self.buffer.drain(..start);
                break;
            };
            let body_end = body_start + len;
            match serde_json::from_str::<Snapshot>(&self.buffer[body_start..body_end]) {
                Ok(snapshot) => {
                    snapshots.push(snapshot);
                    self.buffer.drain(..body_end + SENTINEL.len());
                }
                Err(_) => {
                    self.buffer.drain(..body_start);
                }
            }
        }
        snapshots
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// With no sentinel in sight only a trailing run of quotes can matter.
    fn keep_partial_sentinel(&mut self) {
        let mut cut = self.buffer.len().saturating_sub(SENTINEL.len() - 1);
        while !self.buffer.is_char_boundary(cut) {
            cut -= 1;
        }
        self.buffer.drain(..cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::robot::RobotType;

    fn snapshot(round: u64) -> Snapshot {
        let mut robot = Robot::new(RobotId(0), "r-0", "ada", RobotType::Wanderer, round as i64, -1);
        robot.logs.push("say \"hi\"", 4);
        Snapshot {
            round,
            robots: vec![robot],
            dead: Vec::new(),
        }
    }

    fn stream(rounds: u64) -> String {
        (1..=rounds).map(|r| snapshot(r).to_frame().unwrap()).collect()
    }

    #[test]
    fn frames_are_wrapped_in_sentinels() {
        let frame = snapshot(1).to_frame().unwrap();
        assert!(frame.starts_with(SENTINEL) && frame.ends_with(SENTINEL));
        assert_eq!(frame.matches(SENTINEL).count(), 2);
    }

    #[test]
    fn whole_stream_reads_back() {
        let snapshots = ReplayReader::read_all(&stream(3));
        assert_eq!(snapshots, vec![snapshot(1), snapshot(2), snapshot(3)]);
    }

    #[test]
    fn reader_resyncs_after_joining_mid_frame() {
        let text = stream(3);
        let first = snapshot(1).to_frame().unwrap();
        let snapshots = ReplayReader::read_all(&text[first.len() / 2..]);
        assert_eq!(snapshots, vec![snapshot(2), snapshot(3)]);
    }

    #[test]
    fn byte_by_byte_feeding_yields_each_frame_once() {
        let text = stream(4);
        let mut reader = ReplayReader::new();
        let mut rounds = Vec::new();
        for ch in text.chars() {
            rounds.extend(reader.push(&ch.to_string()).into_iter().map(|s| s.round));
        }
        assert_eq!(rounds, vec![1, 2, 3, 4]);
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn partial_trailing_frame_waits() {
        let text = stream(2);
        let cut = text.len() - 10;
        let mut reader = ReplayReader::new();
        assert_eq!(reader.push(&text[..cut]).len(), 1);
        assert_eq!(reader.push(&text[cut..]).len(), 1);
    }

    #[test]
    fn writer_and_memory_sink_agree() {
        let mut writer = ReplayWriter::new(Vec::new());
        let mut memory = MemoryReplay::new();
        for round in 1..=3 {
            writer.record(&snapshot(round)).unwrap();
            memory.record(&snapshot(round)).unwrap();
        }
        assert_eq!(String::from_utf8(writer.into_inner()).unwrap(), memory.text());
        assert_eq!(memory.len(), 3);
    }
}
