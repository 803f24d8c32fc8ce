//! The world map: an unbounded grid of cells.
//!
//! Only cells listed in the map file are stored. Every other coordinate
//! reads as open water at elevation 0. Occupancy is tracked on the cell
//! itself; [`World`](crate::world::World) keeps it in lockstep with each
//! robot's position.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GameError, GameResult};
use crate::robot::RobotId;

pub const DEFAULT_ELEVATION: i64 = 0;

/// One entry of a map file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRecord {
    pub x: i64,
    pub y: i64,
    pub elevation: i64,
    pub water: bool,
}

/// Terrain and occupancy of one coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub elevation: i64,
    pub water: bool,
    pub robot: Option<RobotId>,
    /// Robots that died here, oldest first.
    pub dead_robots: Vec<RobotId>,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            elevation: DEFAULT_ELEVATION,
            water: true,
            robot: None,
            dead_robots: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Map {
    cells: BTreeMap<(i64, i64), Cell>,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from terrain records; coordinates must be unique.
    pub fn from_records(records: impl IntoIterator<Item = CellRecord>) -> GameResult<Self> {
        let mut cells = BTreeMap::new();
        for record in records {
            let cell = Cell {
                elevation: record.elevation,
                water: record.water,
                ..Cell::default()
            };
            if cells.insert((record.x, record.y), cell).is_some() {
                return Err(GameError::DuplicateCell {
                    x: record.x,
                    y: record.y,
                });
            }
        }
        Ok(Self { cells })
    }

    /// Parse a JSON array of `{x, y, elevation, water}` records.
    pub fn from_json(text: &str) -> GameResult<Self> {
        let records: Vec<CellRecord> = serde_json::from_str(text).map_err(GameError::json("map"))?;
        Self::from_records(records)
    }

    pub fn from_file(path: impl AsRef<Path>) -> GameResult<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Terrain records of every stored cell, in coordinate order.
    pub fn records(&self) -> Vec<CellRecord> {
        self.cells
            .iter()
            .map(|(&(x, y), cell)| CellRecord {
                x,
                y,
                elevation: cell.elevation,
                water: cell.water,
            })
            .collect()
    }

    /// The cell at `(x, y)`, or the default cell if none is stored.
    pub fn cell(&self, x: i64, y: i64) -> Cell {
        self.cells.get(&(x, y)).cloned().unwrap_or_default()
    }

    pub fn occupant(&self, x: i64, y: i64) -> Option<RobotId> {
        self.cells.get(&(x, y)).and_then(|cell| cell.robot)
    }

    pub fn elevation(&self, x: i64, y: i64) -> i64 {
        self.cells.get(&(x, y)).map_or(DEFAULT_ELEVATION, |cell| cell.elevation)
    }

    /// A robot may be placed on any unoccupied cell.
    pub fn spawnable(&self, x: i64, y: i64) -> bool {
        self.occupant(x, y).is_none()
    }

    /// Every occupied coordinate with its robot.
    pub fn occupied(&self) -> impl Iterator<Item = ((i64, i64), RobotId)> + '_ {
        self.cells
            .iter()
            .filter_map(|(&pos, cell)| cell.robot.map(|id| (pos, id)))
    }

    pub(crate) fn set_occupant(&mut self, x: i64, y: i64, robot: Option<RobotId>) {
        self.cells.entry((x, y)).or_default().robot = robot;
    }

    pub(crate) fn bury(&mut self, x: i64, y: i64, robot: RobotId) {
        let cell = self.cells.entry((x, y)).or_default();
        cell.robot = None;
        cell.dead_robots.push(robot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_cells_are_water_at_sea_level() {
        let map = Map::from_json(r#"[{"x": 1, "y": 2, "elevation": 5, "water": false}]"#).unwrap();
        assert_eq!(map.elevation(1, 2), 5);
        assert!(!map.cell(1, 2).water);
        let far = map.cell(-40, 99);
        assert_eq!(far.elevation, DEFAULT_ELEVATION);
        assert!(far.water);
        assert!(far.robot.is_none());
    }

    #[test]
    fn duplicate_cells_are_rejected() {
        let err = Map::from_json(
            r#"[{"x": 0, "y": 0, "elevation": 1, "water": false},
                {"x": 0, "y": 0, "elevation": 2, "water": true}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, GameError::DuplicateCell { x: 0, y: 0 }));
    }

    #[test]
    fn records_survive_a_reload() {
        let text = r#"[{"x": 3, "y": -1, "elevation": 2, "water": false},
                       {"x": -2, "y": 4, "elevation": 0, "water": true}]"#;
        let map = Map::from_json(text).unwrap();
        let again = Map::from_records(map.records()).unwrap();
        assert_eq!(map, again);
    }

    #[test]
    fn burying_frees_the_cell() {
        let mut map = Map::new();
        map.set_occupant(0, 0, Some(RobotId(3)));
        assert!(!map.spawnable(0, 0));
        map.bury(0, 0, RobotId(3));
        assert!(map.spawnable(0, 0));
        assert_eq!(map.cell(0, 0).dead_robots, vec![RobotId(3)]);
    }
}
