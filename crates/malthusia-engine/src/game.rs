//! The turn loop.
//!
//! One [`Game::turn`] call plays one round:
//!
//! 1. poll the action feed and spawn the robots scheduled for this round,
//! 2. run every robot that was alive when the round began, in spawn order,
//!    burying each one that dies before the next one runs,
//! 3. hand the resulting [`Snapshot`] to the replay sink.
//!
//! Robots spawned during step 1 take their first turn in the next round.

use std::cell::{Ref, RefCell};
use std::path::Path;
use std::rc::Rc;

use indexmap::IndexMap;
use malthusia_codegen::InstrumentOptions;
use malthusia_compiler::{compile_bundle, Bundle, CompilerResult, ProgramContainer};
use malthusia_sandbox::{InterruptHandle, RngStream, Session};
use tracing::{debug, info, warn};

use crate::actions::{Action, ActionSource, FileFeed, NewRobot};
use crate::config::GameConfig;
use crate::error::GameResult;
use crate::map::Map;
use crate::methods::install;
use crate::replay::{ReplaySink, ReplayWriter, Snapshot};
use crate::robot::{Robot, RobotId};
use crate::world::World;

/// Random placements tried before falling back to the ring search.
pub const SPAWN_ATTEMPTS: usize = 32;

pub struct Game {
    config: GameConfig,
    world: Rc<RefCell<World>>,
    /// Sessions of living robots, in spawn order.
    sessions: IndexMap<RobotId, Session>,
    actions: Box<dyn ActionSource>,
    replay: Box<dyn ReplaySink>,
    /// Spawn requests scheduled for a later round.
    pending: Vec<NewRobot>,
    /// Root of the per-robot `random` seeds; never advanced.
    seeds: RngStream,
    placement: RngStream,
    round: u64,
    next_id: u32,
}

impl Game {
    pub fn new(
        config: GameConfig,
        map: Map,
        actions: impl ActionSource + 'static,
        replay: impl ReplaySink + 'static,
    ) -> Self {
        let seeds = RngStream::new(config.seed);
        info!(seed = config.seed, "new game");
        Self {
            world: Rc::new(RefCell::new(World::new(map, config.log_capacity))),
            sessions: IndexMap::new(),
            actions: Box::new(actions),
            replay: Box::new(replay),
            pending: Vec::new(),
            seeds,
            placement: seeds.for_entity(u64::MAX),
            round: 0,
            next_id: 0,
            config,
        }
    }

    /// A game fed by a JSONL action file that streams its replay to a
    /// (truncated) file.
    pub fn with_files(
        config: GameConfig,
        map: Map,
        action_file: impl AsRef<Path>,
        replay_file: impl AsRef<Path>,
    ) -> GameResult<Self> {
        let replay = ReplayWriter::create(replay_file)?;
        Ok(Self::new(config, map, FileFeed::new(action_file), replay))
    }

    /// Rounds played so far.
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    /// Play one round.
    ///
    /// Robot failures kill the robot and never fail the round; an `Err`
    /// here is an I/O or world-invariant fault.
    pub fn turn(&mut self) -> GameResult<()> {
        self.round += 1;
        let round = self.round;
        let order: Vec<RobotId> = self.sessions.keys().copied().collect();
        info!(round, robots = order.len(), "starting round");

        self.ingest()?;

        for id in order {
            let Some(session) = self.sessions.get_mut(&id) else {
                continue;
            };
            self.world.borrow_mut().begin_turn(id);
            match session.run() {
                Ok(()) => {}
                Err(err) if err.is_recoverable() => debug!(robot = %id, %err, "robot skipped its turn"),
                Err(err) => self.bury(id, &err.to_string())?,
            }
        }

        self.world.borrow().check_occupancy()?;
        let snapshot = self.snapshot();
        self.replay.record(&snapshot)?;
        Ok(())
    }

    /// Play rounds until `round` rounds have been played.
    pub fn run_until(&mut self, round: u64) -> GameResult<()> {
        while self.round < round {
            self.turn()?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        let world = self.world.borrow();
        Snapshot {
            round: self.round,
            robots: world.alive().cloned().collect(),
            dead: world.dead_robots().to_vec(),
        }
    }

    pub fn robot(&self, id: RobotId) -> Option<Robot> {
        self.world.borrow().robot(id).cloned()
    }

    pub fn robot_by_uid(&self, uid: &str) -> Option<Robot> {
        self.world.borrow().robots().find(|robot| robot.uid == uid).cloned()
    }

    /// Dead robots in order of death.
    pub fn dead_robots(&self) -> Vec<RobotId> {
        self.world.borrow().dead_robots().to_vec()
    }

    pub fn alive_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn world(&self) -> Ref<'_, World> {
        self.world.borrow()
    }

    /// Budget left to a living robot.
    pub fn budget(&self, id: RobotId) -> Option<i64> {
        self.sessions.get(&id).map(Session::budget)
    }

    /// Handle that aborts `id`'s running turn from another thread.
    pub fn interrupt_handle(&self, id: RobotId) -> Option<InterruptHandle> {
        self.sessions.get(&id).and_then(Session::interrupt_handle)
    }

    // ── Spawning ────────────────────────────────────────────────────────────

    fn ingest(&mut self) -> GameResult<()> {
        let round = self.round;
        for action in self.actions.poll()? {
            match action {
                Action::NewRobot(spawn) => self.pending.push(spawn),
            }
        }
        for spawn in std::mem::take(&mut self.pending) {
            if spawn.round < round {
                warn!(uid = %spawn.uid, scheduled = spawn.round, round, "rejecting action scheduled in the past");
            } else if spawn.round == round {
                self.spawn(spawn)?;
            } else {
                self.pending.push(spawn);
            }
        }
        Ok(())
    }

    fn spawn(&mut self, spawn: NewRobot) -> GameResult<()> {
        if self.world.borrow().uid_taken(&spawn.uid) {
            warn!(uid = %spawn.uid, "rejecting robot with a duplicate uid");
            return Ok(());
        }
        let Some(robot_type) = spawn.robot_type.resolve() else {
            warn!(uid = %spawn.uid, robot_type = ?spawn.robot_type, "rejecting robot of unknown type");
            return Ok(());
        };
        let program = match compile_program(&spawn.code, &self.config.instrument) {
            Ok(program) => program,
            Err(err) => {
                warn!(uid = %spawn.uid, %err, "rejecting robot whose program does not compile");
                return Ok(());
            }
        };

        let id = RobotId(self.next_id);
        let seed = self.seeds.for_entity(u64::from(id.0)).next_u64();
        let builder = Session::builder(&program)
            .config(self.config.runtime.clone())
            .seed(seed);
        let session = match install(builder, &self.world, id, robot_type, &self.config).build() {
            Ok(session) => session,
            Err(err) => {
                warn!(uid = %spawn.uid, %err, "rejecting robot whose session cannot start");
                return Ok(());
            }
        };

        self.next_id += 1;
        let (x, y) = self.place();
        self.world
            .borrow_mut()
            .insert(Robot::new(id, &spawn.uid, &spawn.creator, robot_type, x, y))?;
        self.sessions.insert(id, session);
        info!(robot = %id, uid = %spawn.uid, creator = %spawn.creator, x, y, "spawned robot");
        Ok(())
    }

    /// A free cell near the origin: random within `spawn_radius` first,
    /// then the nearest free cell by ring search.
    fn place(&mut self) -> (i64, i64) {
        let world = self.world.borrow();
        let map = world.map();
        let r = self.config.spawn_radius.max(0);
        for _ in 0..SPAWN_ATTEMPTS {
            let x = self.placement.int_range(-r, r);
            let y = self.placement.int_range(-r, r);
            if map.spawnable(x, y) {
                return (x, y);
            }
        }
        let mut d = 0;
        loop {
            if let Some(pos) = ring(d).into_iter().find(|&(x, y)| map.spawnable(x, y)) {
                return pos;
            }
            d += 1;
        }
    }

    fn bury(&mut self, id: RobotId, reason: &str) -> GameResult<()> {
        if let Some(mut session) = self.sessions.shift_remove(&id) {
            session.kill();
        }
        self.world.borrow_mut().kill(id, reason)?;
        warn!(robot = %id, round = self.round, reason, "robot died");
        Ok(())
    }
}

/// Compile a submission: a bundle, or the source of a lone `bot` module.
pub fn compile_program(code: &str, options: &InstrumentOptions) -> CompilerResult<ProgramContainer> {
    let bundle = match Bundle::parse(code) {
        Ok(bundle) if !bundle.files.is_empty() => bundle,
        _ => Bundle::single(code),
    };
    compile_bundle(&bundle, options)
}

/// Cells at Chebyshev distance `d` from the origin, in a fixed order.
fn ring(d: i64) -> Vec<(i64, i64)> {
    if d == 0 {
        return vec![(0, 0)];
    }
    let mut cells = Vec::with_capacity(8 * d as usize);
    for x in -d..=d {
        cells.push((x, d));
        cells.push((x, -d));
    }
    for y in -d + 1..d {
        cells.push((-d, y));
        cells.push((d, y));
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rings_cover_exactly_their_perimeter() {
        assert_eq!(ring(0), vec![(0, 0)]);
        for d in 1..6 {
            let cells = ring(d);
            assert_eq!(cells.len(), 8 * d as usize);
            assert!(cells.iter().all(|&(x, y)| x.abs().max(y.abs()) == d));
            let mut sorted = cells.clone();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), cells.len());
        }
    }

    #[test]
    fn plain_source_compiles_as_the_bot_module() {
        let program = compile_program("x = 1\n", &InstrumentOptions::default()).unwrap();
        assert!(program.entry().is_some());
    }

    #[test]
    fn bundles_compile_every_module() {
        let bundle = Bundle::from_files([("bot.py", "import helper\n"), ("helper.py", "y = 2\n")]);
        let program = compile_program(&bundle.to_text(), &InstrumentOptions::default()).unwrap();
        assert!(program.contains("helper"));
    }
}
