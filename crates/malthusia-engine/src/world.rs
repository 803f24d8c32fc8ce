//! Mutable world state shared by the turn loop and the game methods.
//!
//! Position and occupancy change only through [`World`] methods, each of
//! which updates the robot record and the map inside one `&mut self` call.

use indexmap::IndexMap;
use thiserror::Error;

use crate::error::{GameError, GameResult};
use crate::map::Map;
use crate::robot::{Robot, RobotId, RobotState};

/// Why a move was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoveError {
    #[error("this unit has already moved this turn; robots can only move once per turn")]
    AlreadyMoved,

    #[error("({dx}, {dy}) is not a direction")]
    InvalidDirection { dx: i64, dy: i64 },

    #[error("you cannot move to a space that is already occupied")]
    Occupied,

    #[error("the elevation change from {from} to {to} is too steep")]
    TooSteep { from: i64, to: i64 },

    /// The robot is missing, dead, or not on its own cell.
    #[error("robot {0} is not on the board")]
    Desync(RobotId),
}

#[derive(Debug, Clone)]
pub struct World {
    map: Map,
    /// Every robot ever spawned, in spawn order.
    robots: IndexMap<RobotId, Robot>,
    dead: Vec<RobotId>,
    log_capacity: usize,
}

impl World {
    pub fn new(map: Map, log_capacity: usize) -> Self {
        Self {
            map,
            robots: IndexMap::new(),
            dead: Vec::new(),
            log_capacity,
        }
    }

    pub fn map(&self) -> &Map {
        &self.map
    }

    pub fn robot(&self, id: RobotId) -> Option<&Robot> {
        self.robots.get(&id)
    }

    pub fn robots(&self) -> impl Iterator<Item = &Robot> {
        self.robots.values()
    }

    pub fn alive(&self) -> impl Iterator<Item = &Robot> {
        self.robots.values().filter(|robot| robot.is_alive())
    }

    /// Dead robots in order of death.
    pub fn dead_robots(&self) -> &[RobotId] {
        &self.dead
    }

    pub fn uid_taken(&self, uid: &str) -> bool {
        self.robots.values().any(|robot| robot.uid == uid)
    }

    /// Place a new robot on its (free) cell and mark it alive.
    pub(crate) fn insert(&mut self, mut robot: Robot) -> GameResult<()> {
        let (x, y) = robot.position();
        if !self.map.spawnable(x, y) {
            return Err(GameError::Invariant(format!("spawn cell ({x}, {y}) is occupied")));
        }
        if self.robots.contains_key(&robot.id) {
            return Err(GameError::Invariant(format!("robot {} spawned twice", robot.id)));
        }
        robot.state = RobotState::Alive;
        self.map.set_occupant(x, y, Some(robot.id));
        self.robots.insert(robot.id, robot);
        Ok(())
    }

    /// Reset per-turn state before the robot runs.
    pub(crate) fn begin_turn(&mut self, id: RobotId) {
        if let Some(robot) = self.robots.get_mut(&id) {
            robot.has_moved = false;
            robot.logs.clear();
            robot.errors.clear();
        }
    }

    pub(crate) fn record_log(&mut self, id: RobotId, line: &str) {
        let capacity = self.log_capacity;
        if let Some(robot) = self.robots.get_mut(&id) {
            robot.logs.push(line, capacity);
        }
    }

    pub(crate) fn record_error(&mut self, id: RobotId, line: &str) {
        let capacity = self.log_capacity;
        if let Some(robot) = self.robots.get_mut(&id) {
            robot.errors.push(line, capacity);
        }
    }

    /// Move `id` one step by `(dx, dy)`.
    pub(crate) fn move_robot(&mut self, id: RobotId, dx: i64, dy: i64, max_step: i64) -> Result<(), MoveError> {
        if dx.abs() > 1 || dy.abs() > 1 || (dx == 0 && dy == 0) {
            return Err(MoveError::InvalidDirection { dx, dy });
        }
        let robot = self
            .robots
            .get(&id)
            .filter(|robot| robot.is_alive())
            .ok_or(MoveError::Desync(id))?;
        if robot.has_moved {
            return Err(MoveError::AlreadyMoved);
        }
        let (x, y) = robot.position();
        if self.map.occupant(x, y) != Some(id) {
            return Err(MoveError::Desync(id));
        }
        let (nx, ny) = (x + dx, y + dy);
        if self.map.occupant(nx, ny).is_some() {
            return Err(MoveError::Occupied);
        }
        let (from, to) = (self.map.elevation(x, y), self.map.elevation(nx, ny));
        if (to - from).abs() > max_step {
            return Err(MoveError::TooSteep { from, to });
        }

        self.map.set_occupant(x, y, None);
        self.map.set_occupant(nx, ny, Some(id));
        let robot = self.robots.get_mut(&id).ok_or(MoveError::Desync(id))?;
        robot.x = nx;
        robot.y = ny;
        robot.has_moved = true;
        Ok(())
    }

    /// Remove a robot from the board and append it to the dead list.
    pub(crate) fn kill(&mut self, id: RobotId, reason: &str) -> GameResult<()> {
        let robot = self
            .robots
            .get_mut(&id)
            .ok_or_else(|| GameError::Invariant(format!("unknown robot {id}")))?;
        if robot.state == RobotState::Dead {
            return Ok(());
        }
        let was_alive = robot.is_alive();
        robot.state = RobotState::Dead;
        robot.death = Some(reason.to_string());
        let (x, y) = robot.position();
        if was_alive {
            self.map.bury(x, y, id);
        }
        self.dead.push(id);
        Ok(())
    }

    /// Check that cell occupancy and robot positions agree everywhere.
    pub fn check_occupancy(&self) -> GameResult<()> {
        for robot in self.alive() {
            let (x, y) = robot.position();
            if self.map.occupant(x, y) != Some(robot.id) {
                return Err(GameError::Invariant(format!(
                    "robot {} claims ({x}, {y}) but the cell disagrees",
                    robot.id
                )));
            }
        }
        for ((x, y), id) in self.map.occupied() {
            match self.robots.get(&id) {
                Some(robot) if robot.is_alive() && robot.position() == (x, y) => {}
                _ => {
                    return Err(GameError::Invariant(format!(
                        "cell ({x}, {y}) holds robot {id} which is elsewhere"
                    )))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::CellRecord;
    use crate::robot::RobotType;

    fn world_with(records: Vec<CellRecord>) -> World {
        World::new(Map::from_records(records).unwrap(), 8)
    }

    fn spawn(world: &mut World, id: u32, x: i64, y: i64) -> RobotId {
        let id = RobotId(id);
        world
            .insert(Robot::new(id, &format!("u{}", id.0), "tester", RobotType::Wanderer, x, y))
            .unwrap();
        id
    }

    #[test]
    fn move_updates_robot_and_cells_together() {
        let mut world = world_with(Vec::new());
        let id = spawn(&mut world, 0, 0, 0);
        world.move_robot(id, 1, -1, 2).unwrap();
        assert_eq!(world.robot(id).unwrap().position(), (1, -1));
        assert_eq!(world.map().occupant(1, -1), Some(id));
        assert_eq!(world.map().occupant(0, 0), None);
        world.check_occupancy().unwrap();
    }

    #[test]
    fn second_move_in_a_turn_is_refused() {
        let mut world = world_with(Vec::new());
        let id = spawn(&mut world, 0, 0, 0);
        world.move_robot(id, 1, 0, 2).unwrap();
        assert_eq!(world.move_robot(id, 1, 0, 2), Err(MoveError::AlreadyMoved));
        world.begin_turn(id);
        world.move_robot(id, 1, 0, 2).unwrap();
        assert_eq!(world.robot(id).unwrap().position(), (2, 0));
    }

    #[test]
    fn occupied_and_steep_cells_are_refused() {
        let mut world = world_with(vec![CellRecord {
            x: 0,
            y: 1,
            elevation: 5,
            water: false,
        }]);
        let a = spawn(&mut world, 0, 0, 0);
        spawn(&mut world, 1, 1, 0);
        assert_eq!(world.move_robot(a, 1, 0, 2), Err(MoveError::Occupied));
        assert_eq!(world.move_robot(a, 0, 1, 2), Err(MoveError::TooSteep { from: 0, to: 5 }));
        assert_eq!(
            world.move_robot(a, 2, 0, 2),
            Err(MoveError::InvalidDirection { dx: 2, dy: 0 })
        );
        assert_eq!(world.robot(a).unwrap().position(), (0, 0));
        assert!(!world.robot(a).unwrap().has_moved);
    }

    #[test]
    fn killed_robots_leave_their_cell() {
        let mut world = world_with(Vec::new());
        let id = spawn(&mut world, 0, 4, 4);
        world.kill(id, "out of budget").unwrap();
        assert!(world.map().spawnable(4, 4));
        assert_eq!(world.dead_robots(), &[id]);
        assert_eq!(world.move_robot(id, 1, 0, 2), Err(MoveError::Desync(id)));
        world.kill(id, "again").unwrap();
        assert_eq!(world.dead_robots().len(), 1);
        world.check_occupancy().unwrap();
    }

    #[test]
    fn spawning_on_an_occupied_cell_is_an_invariant_error() {
        let mut world = world_with(Vec::new());
        spawn(&mut world, 0, 0, 0);
        let err = world
            .insert(Robot::new(RobotId(1), "other", "tester", RobotType::Wanderer, 0, 0))
            .unwrap_err();
        assert!(matches!(err, GameError::Invariant(_)));
    }
}
