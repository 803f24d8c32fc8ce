//! Game methods exposed to robot programs.
//!
//! Every robot sees the same surface: `move`, `get_location`,
//! `check_location`, `get_bytecode`, `get_last_memory_usage`, `get_type`
//! and `log`, plus the `Direction` module. Illegal requests raise
//! `RobotError` or `GameError` inside the program, where they can be
//! caught like any other exception.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use malthusia_sandbox::value::Key;
use malthusia_sandbox::{ExcKind, FatalKind, Module, RaiseError, SessionBuilder, Sink, Value, VmResult};
use tracing::debug;

use crate::config::GameConfig;
use crate::robot::{RobotId, RobotType};
use crate::world::{MoveError, World};

/// The eight compass directions as `(dx, dy)`, north being `+y`.
pub const DIRECTIONS: [(&str, i64, i64); 8] = [
    ("NORTH", 0, 1),
    ("NORTHEAST", 1, 1),
    ("EAST", 1, 0),
    ("SOUTHEAST", 1, -1),
    ("SOUTH", 0, -1),
    ("SOUTHWEST", -1, -1),
    ("WEST", -1, 0),
    ("NORTHWEST", -1, 1),
];

pub fn direction_module() -> Value {
    Module::from_entries(
        "Direction",
        DIRECTIONS
            .iter()
            .map(|&(name, dx, dy)| (name.to_string(), Value::tuple(vec![Value::Int(dx), Value::Int(dy)]))),
    )
}

/// Wire robot `id`'s game methods and output sinks into `builder`.
pub(crate) fn install<'a>(
    builder: SessionBuilder<'a>,
    world: &Rc<RefCell<World>>,
    id: RobotId,
    robot_type: RobotType,
    config: &GameConfig,
) -> SessionBuilder<'a> {
    let max_step = config.max_elevation_step;
    let vision = config.vision_radius;

    let mover = Rc::clone(world);
    let locator = Rc::clone(world);
    let viewer = Rc::clone(world);
    let logs = Rc::clone(world);
    let errors = Rc::clone(world);

    let log_sink: Sink = Rc::new(move |line: &str| {
        debug!(target: "malthusia::robot", robot = %id, "{line}");
        logs.borrow_mut().record_log(id, line);
    });
    let error_sink: Sink = Rc::new(move |line: &str| {
        debug!(target: "malthusia::robot", robot = %id, error = true, "{line}");
        errors.borrow_mut().record_error(id, line);
    });

    builder
        .log_sink(log_sink)
        .error_sink(error_sink)
        .game_method("move", move |_, args| {
            expect_args("move", &args, 1)?;
            let (dx, dy) = direction_arg(&args[0])?;
            mover
                .borrow_mut()
                .move_robot(id, dx, dy, max_step)
                .map_err(move_error)?;
            Ok(Value::None)
        })
        .game_method("get_location", move |_, args| {
            expect_args("get_location", &args, 0)?;
            let world = locator.borrow();
            let robot = world
                .robot(id)
                .filter(|robot| world.map().occupant(robot.x, robot.y) == Some(id))
                .ok_or_else(|| move_error(MoveError::Desync(id)))?;
            Ok(Value::tuple(vec![Value::Int(robot.x), Value::Int(robot.y)]))
        })
        .game_method("check_location", move |_, args| {
            expect_args("check_location", &args, 2)?;
            let x = int_arg("check_location", &args[0])?;
            let y = int_arg("check_location", &args[1])?;
            let world = viewer.borrow();
            let (rx, ry) = world
                .robot(id)
                .map(|robot| robot.position())
                .ok_or_else(|| move_error(MoveError::Desync(id)))?;
            let (dx, dy) = (x.saturating_sub(rx), y.saturating_sub(ry));
            if dx.saturating_mul(dx).saturating_add(dy.saturating_mul(dy)) > vision.saturating_mul(vision) {
                return Err(RaiseError::new(
                    ExcKind::GameError,
                    format!("location ({x}, {y}) is outside the vision radius of {vision}"),
                ));
            }
            location_value(&world, x, y)
        })
        .game_method("get_bytecode", |vm, args| {
            expect_args("get_bytecode", &args, 0)?;
            Ok(Value::Int(vm.budget()))
        })
        .game_method("get_last_memory_usage", |vm, args| {
            expect_args("get_last_memory_usage", &args, 0)?;
            Ok(Value::Int(i64::try_from(vm.last_memory_usage()).unwrap_or(i64::MAX)))
        })
        .game_method("get_type", move |_, args| {
            expect_args("get_type", &args, 0)?;
            Ok(Value::str(robot_type.name()))
        })
        .game_value("Direction", direction_module())
        .host_module("Direction", direction_module())
}

/// `{x, y, elevation, water, robot, dead_robots}`, robots given by uid.
fn location_value(world: &World, x: i64, y: i64) -> VmResult<Value> {
    let cell = world.map().cell(x, y);
    let uid = |id: RobotId| world.robot(id).map_or(Value::None, |robot| Value::str(&robot.uid));
    let dead = cell.dead_robots.iter().map(|&id| uid(id)).collect();

    let mut entries = IndexMap::new();
    for (name, value) in [
        ("x", Value::Int(x)),
        ("y", Value::Int(y)),
        ("elevation", Value::Int(cell.elevation)),
        ("water", Value::Bool(cell.water)),
        ("robot", cell.robot.map_or(Value::None, uid)),
        ("dead_robots", Value::list(dead)),
    ] {
        entries.insert(Key::new(Value::str(name))?, value);
    }
    Ok(Value::dict(entries))
}

fn move_error(err: MoveError) -> RaiseError {
    match err {
        MoveError::Desync(_) => RaiseError::fatal(FatalKind::SystemError, err.to_string()),
        _ => RaiseError::new(ExcKind::RobotError, err.to_string()),
    }
}

fn expect_args(name: &str, args: &[Value], expected: usize) -> VmResult<()> {
    if args.len() == expected {
        return Ok(());
    }
    let noun = if expected == 1 { "argument" } else { "arguments" };
    Err(RaiseError::type_error(format!(
        "{name}() takes {expected} positional {noun} but {} were given",
        args.len()
    )))
}

fn int_arg(name: &str, value: &Value) -> VmResult<i64> {
    match value {
        Value::Int(n) => Ok(*n),
        other => Err(RaiseError::type_error(format!(
            "{name}() expects integers, not '{}'",
            other.type_name()
        ))),
    }
}

fn direction_arg(value: &Value) -> VmResult<(i64, i64)> {
    match value {
        Value::Tuple(items) if items.len() == 2 => Ok((int_arg("move", &items[0])?, int_arg("move", &items[1])?)),
        other => Err(RaiseError::new(
            ExcKind::RobotError,
            format!("move() expects a Direction, not '{}'", other.type_name()),
        )),
    }
}
