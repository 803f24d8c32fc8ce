//! One robot's sandboxed execution context.
//!
//! A [`Session`] owns the VM, the program's persistent bindings and the
//! two per-robot output sinks. The simulation calls [`Session::run`] once
//! per turn; the first call executes the `bot` module, every later call
//! invokes its `turn` function.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use malthusia_codegen::CodeUnit;
use malthusia_compiler::{ProgramContainer, ENTRY_MODULE};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::builtins::capability_namespace;
use crate::error::{RaiseError, SessionError, SessionResult, VmResult};
use crate::hostmods::{math_module, random_module};
use crate::memory::bytes_usage;
use crate::methods::join_str;
use crate::value::{Builtin, Namespace, Value};
use crate::vm::{InterruptHandle, Vm};

/// Name of the function invoked every turn after initialization.
pub const TURN_FUNCTION: &str = "turn";

/// Frames kept when a traceback is reported to the error sink.
pub const TRACEBACK_LIMIT: usize = 5;

/// Receiver of one line of robot output.
pub type Sink = Rc<dyn Fn(&str)>;

/// Budget and resource limits of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Budget available before the first refill.
    pub starting_budget: i64,
    pub budget_per_turn: i64,
    /// Ceiling the refill never exceeds.
    pub max_budget: i64,
    /// Carry unused budget into the next turn instead of resetting it.
    pub chess_clock: bool,
    /// Limit on the measured size of the persistent bindings.
    pub memory_limit_bytes: usize,
    pub max_call_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            starting_budget: 0,
            budget_per_turn: 20_000,
            max_budget: 50_000,
            chess_clock: true,
            memory_limit_bytes: 10 * 1024,
            max_call_depth: 50,
        }
    }
}

impl RuntimeConfig {
    /// Budget after refilling from `remaining`.
    pub fn refill(&self, remaining: i64) -> i64 {
        let next = if self.chess_clock {
            remaining.max(0).saturating_add(self.budget_per_turn)
        } else {
            self.budget_per_turn
        };
        next.min(self.max_budget)
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Builder
// ══════════════════════════════════════════════════════════════════════════════

/// Assembles a [`Session`] from a compiled program.
pub struct SessionBuilder<'a> {
    program: &'a ProgramContainer,
    config: RuntimeConfig,
    globals: Vec<(String, Value)>,
    host_modules: IndexMap<String, Value>,
    log_sink: Option<Sink>,
    error_sink: Option<Sink>,
    seed: u64,
}

impl<'a> SessionBuilder<'a> {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Expose a game-provided callable. Calls are not metered and their
    /// arguments are validated.
    pub fn game_method(
        mut self,
        name: &str,
        func: impl Fn(&mut Vm, Vec<Value>) -> VmResult<Value> + 'static,
    ) -> Self {
        self.globals.push((name.to_string(), Builtin::game(name, func)));
        self
    }

    /// Expose a game-provided read-only value, such as a constants module.
    pub fn game_value(mut self, name: &str, value: Value) -> Self {
        self.globals.push((name.to_string(), value));
        self
    }

    /// Make an extra read-only module importable.
    pub fn host_module(mut self, name: &str, module: Value) -> Self {
        self.host_modules.insert(name.to_string(), module);
        self
    }

    pub fn log_sink(mut self, sink: Sink) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn error_sink(mut self, sink: Sink) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Seed of the `random` module.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self) -> SessionResult<Session> {
        let entry = self
            .program
            .entry()
            .map(|unit| Rc::new(unit.clone()))
            .ok_or_else(|| SessionError::InitFailed(format!("program has no `{ENTRY_MODULE}` module")))?;
        let units: IndexMap<String, Rc<CodeUnit>> = self
            .program
            .names()
            .filter_map(|name| {
                self.program
                    .get(name)
                    .map(|unit| (name.to_string(), Rc::new(unit.clone())))
            })
            .collect();

        let log_sink = self.log_sink.unwrap_or_else(|| {
            Rc::new(|line: &str| debug!(target: "malthusia::robot", "{line}"))
        });
        let error_sink = self.error_sink.unwrap_or_else(|| {
            Rc::new(|line: &str| debug!(target: "malthusia::robot", error = true, "{line}"))
        });

        let mut capabilities = capability_namespace();
        let log = Rc::clone(&log_sink);
        capabilities.insert(
            "log".to_string(),
            Builtin::game("log", move |_, args| {
                log(&join_str(&args, " "));
                Ok(Value::None)
            }),
        );
        for (name, value) in self.globals {
            capabilities.insert(name, value);
        }

        let mut host_modules = IndexMap::new();
        host_modules.insert("math".to_string(), math_module());
        host_modules.insert("random".to_string(), random_module(self.seed));
        host_modules.extend(self.host_modules);

        let mut vm = Vm::new(capabilities, units, host_modules, self.config.max_call_depth);
        vm.set_budget(self.config.starting_budget);
        info!(modules = self.program.len(), "built session");

        Ok(Session {
            vm: Some(vm),
            entry,
            globals: Namespace::default(),
            config: self.config,
            initialized: false,
            error_sink,
        })
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Session
// ══════════════════════════════════════════════════════════════════════════════

pub struct Session {
    /// `None` once killed.
    vm: Option<Vm>,
    entry: Rc<CodeUnit>,
    /// Top-level bindings of the `bot` module, kept across turns.
    globals: Namespace,
    config: RuntimeConfig,
    initialized: bool,
    error_sink: Sink,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("alive", &self.vm.is_some())
            .field("initialized", &self.initialized)
            .field("budget", &self.budget())
            .finish()
    }
}

impl Session {
    pub fn builder(program: &ProgramContainer) -> SessionBuilder<'_> {
        SessionBuilder {
            program,
            config: RuntimeConfig::default(),
            globals: Vec::new(),
            host_modules: IndexMap::new(),
            log_sink: None,
            error_sink: None,
            seed: 0,
        }
    }

    /// Run one turn.
    ///
    /// A user error inside `turn` is reported to the error sink and the
    /// turn ends normally. Every `Err` except
    /// [`SessionError::MissingTurnFunction`] means the session must be
    /// torn down.
    pub fn run(&mut self) -> SessionResult<()> {
        let Some(vm) = self.vm.as_mut() else {
            return Err(SessionError::Killed);
        };
        let budget = self.config.refill(vm.budget());
        debug!(budget, "refilled budget");
        vm.set_budget(budget);
        vm.clear_fatal();

        if self.initialized {
            let turn = self.globals.borrow().get(TURN_FUNCTION).cloned();
            let Some(turn) = turn.filter(Value::is_callable) else {
                (self.error_sink)("Couldn't find turn function.");
                return Err(SessionError::MissingTurnFunction);
            };
            if let Err(err) = vm.call(&turn, Vec::new()) {
                report(&self.error_sink, &err)?;
            }
        } else {
            let result = vm.execute_module(ENTRY_MODULE, Rc::clone(&self.entry), Rc::clone(&self.globals));
            if let Err(err) = result {
                report(&self.error_sink, &err)?;
                return Err(SessionError::InitFailed(err.to_string()));
            }
            self.initialized = true;
        }

        if let Some(fatal) = vm.take_fatal() {
            return Err(SessionError::from_fatal(&fatal));
        }

        let used = bytes_usage(&self.globals.borrow());
        let limit = self.config.memory_limit_bytes;
        debug!(used, limit, "measured persistent memory");
        vm.set_last_memory_usage(used);
        if used > limit {
            return Err(SessionError::MemoryLimit { used, limit });
        }
        Ok(())
    }

    /// Release the VM and every binding. Later runs fail with
    /// [`SessionError::Killed`].
    pub fn kill(&mut self) {
        self.vm = None;
        self.globals.borrow_mut().clear();
    }

    pub fn is_killed(&self) -> bool {
        self.vm.is_none()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Handle that aborts the running turn from another thread.
    pub fn interrupt_handle(&self) -> Option<InterruptHandle> {
        self.vm.as_ref().map(Vm::interrupt_handle)
    }

    /// Budget left, or 0 once killed.
    pub fn budget(&self) -> i64 {
        self.vm.as_ref().map_or(0, Vm::budget)
    }

    /// Units charged over the session's lifetime.
    pub fn spent(&self) -> u64 {
        self.vm.as_ref().map_or(0, Vm::spent)
    }

    pub fn last_memory_usage(&self) -> usize {
        self.vm.as_ref().map_or(0, Vm::last_memory_usage)
    }

    /// A persistent top-level binding.
    pub fn binding(&self, name: &str) -> Option<Value> {
        self.globals.borrow().get(name).cloned()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

/// Send a user error to the sink; fatal conditions become the session error.
fn report(sink: &Sink, err: &RaiseError) -> SessionResult<()> {
    if err.fatal_kind().is_some() {
        return Err(SessionError::from_fatal(err));
    }
    sink(&err.exception().render_traceback(TRACEBACK_LIMIT));
    Ok(())
}
