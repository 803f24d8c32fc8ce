//! Session-level tests: metering, guards, policy, imports and the turn
//! lifecycle, run on programs compiled through the full pipeline.

use std::cell::RefCell;
use std::rc::Rc;

use malthusia_codegen::{InstrumentOptions, Opcode};
use malthusia_compiler::{compile_bundle, compile_source, Bundle, CompilerError, ProgramContainer};
use malthusia_sandbox::cost::{builtin_cost, method_cost, multiply_cost};
use malthusia_sandbox::{FatalKind, RuntimeConfig, Session, SessionError, Sink, Value};

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

struct Harness {
    session: Session,
    logs: Rc<RefCell<Vec<String>>>,
    errors: Rc<RefCell<Vec<String>>>,
}

fn sink(into: &Rc<RefCell<Vec<String>>>) -> Sink {
    let into = Rc::clone(into);
    Rc::new(move |line: &str| into.borrow_mut().push(line.to_string()))
}

fn program(files: &[(&str, &str)], options: InstrumentOptions) -> ProgramContainer {
    let bundle = Bundle::from_files(files.iter().copied());
    compile_bundle(&bundle, &options).unwrap()
}

fn harness_with(files: &[(&str, &str)], options: InstrumentOptions, config: RuntimeConfig) -> Harness {
    let program = program(files, options);
    let logs = Rc::new(RefCell::new(Vec::new()));
    let errors = Rc::new(RefCell::new(Vec::new()));
    let session = Session::builder(&program)
        .config(config)
        .log_sink(sink(&logs))
        .error_sink(sink(&errors))
        .seed(1337)
        .build()
        .unwrap();
    Harness {
        session,
        logs,
        errors,
    }
}

fn harness(source: &str) -> Harness {
    harness_with(&[("bot.py", source)], InstrumentOptions::full(), RuntimeConfig::default())
}

impl Harness {
    fn logs(&self) -> Vec<String> {
        self.logs.borrow().clone()
    }

    fn errors(&self) -> String {
        self.errors.borrow().join("\n")
    }
}

/// Original instructions in a linear module body.
fn instruction_count(source: &str) -> u64 {
    let unit = compile_source("bot", source).unwrap();
    unit.code
        .chunks(2)
        .filter(|word| Opcode::from_u8(word[0]) != Some(Opcode::ExtendedArg))
        .count() as u64
}

fn int_list(items: &[i64]) -> Value {
    Value::list(items.iter().copied().map(Value::Int).collect())
}

/// Default limits with room for large module-level bindings.
fn roomy() -> RuntimeConfig {
    RuntimeConfig {
        memory_limit_bytes: 1 << 24,
        ..RuntimeConfig::default()
    }
}

/// Units charged by running a module body once.
fn init_cost(source: &str) -> u64 {
    let mut h = harness_with(&[("bot.py", source)], InstrumentOptions::full(), roomy());
    h.session.run().unwrap();
    h.session.spent()
}

// ══════════════════════════════════════════════════════════════════════════════
// 1. Metering
// ══════════════════════════════════════════════════════════════════════════════

const LINEAR: &str = "xs = [5, 3, 1, 4]\nxs.sort()\nn = len(xs)\ny = n * 2\n";

fn linear_expected_cost() -> u64 {
    let sort = method_cost("list", "sort").before(Some(&int_list(&[5, 3, 1, 4])), None);
    let len = builtin_cost("len").unwrap().after(&Value::Int(4));
    let mul = multiply_cost(&Value::Int(4), &Value::Int(2));
    instruction_count(LINEAR) + sort + len + mul
}

#[test]
fn linear_program_charges_instructions_plus_primitive_costs() {
    let expected = linear_expected_cost();
    let variants = [
        InstrumentOptions::default(),
        InstrumentOptions::full(),
        InstrumentOptions {
            guard_fatal_handlers: false,
            ..InstrumentOptions::full()
        },
    ];
    for options in variants {
        let mut h = harness_with(&[("bot.py", LINEAR)], options, RuntimeConfig::default());
        h.session.run().unwrap();
        assert_eq!(h.session.spent(), expected, "options {options:?}");
    }
}

#[test]
fn redirect_does_not_change_method_charges() {
    let source = "words = 'a b c d'.split()\ntext = ','.join(words)\nwords.reverse()\ns = {1, 2}\nt = s.union({3})\n";
    let spent = |options: InstrumentOptions| {
        let mut h = harness_with(&[("bot.py", source)], options, RuntimeConfig::default());
        h.session.run().unwrap();
        h.session.spent()
    };
    for _ in 0..100 {
        assert_eq!(spent(InstrumentOptions::default()), spent(InstrumentOptions::full()));
    }
}

#[test]
fn infinite_loop_runs_out_of_budget() {
    let mut h = harness("def turn():\n    while True:\n        pass\n");
    h.session.run().unwrap();
    let err = h.session.run().unwrap_err();
    assert!(matches!(err, SessionError::OutOfBudget(_)), "{err:?}");
    assert!(!err.is_recoverable());
    assert!(h.session.budget() <= 0);
}

#[test]
fn loop_cost_scales_with_iterations() {
    let spent = |n: usize| {
        let source = format!("total = 0\nfor i in range({n}):\n    total += i\n");
        let mut h = harness(&source);
        h.session.run().unwrap();
        h.session.spent()
    };
    let (ten, twenty) = (spent(10), spent(20));
    let per_iteration = (twenty - ten) / 10;
    assert!(per_iteration >= 4);
    assert_eq!(twenty - ten, 10 * per_iteration);
}

#[test]
fn chess_clock_carries_unused_budget() {
    let mut h = harness("def turn():\n    x = 1\n");
    h.session.run().unwrap();
    h.session.run().unwrap();
    assert_eq!(h.session.budget(), 40_000 - h.session.spent() as i64);

    let config = RuntimeConfig {
        chess_clock: false,
        ..RuntimeConfig::default()
    };
    let mut h = harness_with(&[("bot.py", "def turn():\n    x = 1\n")], InstrumentOptions::full(), config);
    h.session.run().unwrap();
    let first = h.session.spent();
    h.session.run().unwrap();
    let second = h.session.spent() - first;
    assert_eq!(h.session.budget(), 20_000 - second as i64);
}

// ══════════════════════════════════════════════════════════════════════════════
// 2. Instrumented and plain execution agree
// ══════════════════════════════════════════════════════════════════════════════

const CONTROL_FLOW: &[&str] = &[
    r#"
def classify(n):
    if n < 0:
        return "neg"
    elif n == 0:
        return "zero"
    else:
        return "pos"
for v in [-2, 0, 3]:
    log(classify(v))
"#,
    r#"
total = 0
for i in range(5):
    for j in range(5):
        if j > i:
            break
        if (i + j) % 2 == 1:
            continue
        total += i * j
log(total)
"#,
    r#"
def find(xs, target):
    i = 0
    while i < len(xs):
        if xs[i] == target:
            return i
        i += 1
    return -1
log(find([4, 8, 15, 16], 15), find([1], 2))
"#,
    r#"
def safe_div(a, b):
    try:
        r = a // b
    except ZeroDivisionError:
        return "div0"
    else:
        return r
log(safe_div(7, 2), safe_div(1, 0))
"#,
    r#"
counts = {}
for w in "a b a c b a".split():
    counts[w] = counts.get(w, 0) + 1
log(sorted(counts.items()))
sq = lambda x: x * x
log(f"{sq(7)} {1 < 2 < 3}", "ab" * 2)
"#,
];

#[test]
fn instrumented_output_matches_plain_execution() {
    for source in CONTROL_FLOW {
        let plain = {
            let mut h = harness_with(&[("bot.py", source)], InstrumentOptions::none(), RuntimeConfig::default());
            h.session.run().unwrap();
            h.logs()
        };
        for options in [InstrumentOptions::default(), InstrumentOptions::full()] {
            let mut h = harness_with(&[("bot.py", source)], options, RuntimeConfig::default());
            h.session.run().unwrap();
            assert_eq!(h.logs(), plain, "source:\n{source}");
            assert!(h.errors().is_empty(), "{}", h.errors());
        }
    }
}

#[test]
fn control_flow_corpus_expected_output() {
    let expected = [
        vec!["neg", "zero", "pos"],
        vec!["41"],
        vec!["2 -1"],
        vec!["3 div0"],
        vec!["[('a', 3), ('b', 2), ('c', 1)]", "49 True abab"],
    ];
    for (source, want) in CONTROL_FLOW.iter().zip(expected) {
        let mut h = harness(source);
        h.session.run().unwrap();
        assert_eq!(h.logs(), want);
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// 3. Fatal conditions cannot be caught
// ══════════════════════════════════════════════════════════════════════════════

const SWALLOW: &str = r#"
def turn():
    try:
        while True:
            pass
    except:
        log("caught")
"#;

#[test]
fn bare_except_never_observes_budget_exhaustion() {
    for guard in [true, false] {
        let options = InstrumentOptions {
            guard_fatal_handlers: guard,
            ..InstrumentOptions::full()
        };
        let mut h = harness_with(&[("bot.py", SWALLOW)], options, RuntimeConfig::default());
        h.session.run().unwrap();
        let err = h.session.run().unwrap_err();
        assert!(matches!(err, SessionError::OutOfBudget(_)), "guard={guard}: {err:?}");
        assert!(h.logs().is_empty(), "guard={guard}");
    }
}

#[test]
fn except_exception_does_not_catch_recursion_limit() {
    let source = r#"
def f(n):
    return f(n + 1)
def turn():
    try:
        f(0)
    except Exception:
        log("caught")
"#;
    let mut h = harness(source);
    h.session.run().unwrap();
    let err = h.session.run().unwrap_err();
    assert!(
        matches!(err, SessionError::Fatal { kind: FatalKind::RecursionError, .. }),
        "{err:?}"
    );
    assert!(h.logs().is_empty());
}

#[test]
fn interrupt_aborts_the_turn() {
    let mut h = harness("def turn():\n    while True:\n        pass\n");
    h.session.run().unwrap();
    h.session.interrupt_handle().unwrap().interrupt();
    let err = h.session.run().unwrap_err();
    assert!(matches!(err, SessionError::Fatal { kind: FatalKind::Interrupt, .. }), "{err:?}");
}

#[test]
fn oversized_repetition_is_charged_before_it_runs() {
    let mut h = harness("xs = [0] * 2000000\n");
    let err = h.session.run().unwrap_err();
    assert!(matches!(err, SessionError::OutOfBudget(_)), "{err:?}");
}

#[test]
fn oversized_materialization_is_fatal_without_multiply_metering() {
    let options = InstrumentOptions {
        meter_multiply: false,
        ..InstrumentOptions::full()
    };
    let source = "try:\n    xs = [0] * 2000000\nexcept:\n    log('caught')\n";
    let mut h = harness_with(&[("bot.py", source)], options, RuntimeConfig::default());
    let err = h.session.run().unwrap_err();
    assert!(
        matches!(err, SessionError::Fatal { kind: FatalKind::MemoryError, .. }),
        "{err:?}"
    );
    assert!(h.logs().is_empty());
}

#[test]
fn sequence_operators_are_charged_by_size() {
    let setup = "xs = [0] * 1000\ns = 'a' * 1000\n";
    let base = init_cost(setup);
    let extra = |line: &str| init_cost(&format!("{setup}{line}\n")) - base;
    assert!(extra("y = xs + xs") >= 2000);
    assert!(extra("xs += xs") >= 1000);
    assert!(extra("t = s + s") >= 2000);
    assert!(extra("hit = -1 in xs") >= 1000);
    assert!(extra("hit = 'b' in s") >= 1000);
    assert!(extra("y = xs[100:600]") >= 500);
    assert!(extra("y = xs[::2]") >= 500);
    assert!(extra("hit = 1 in {1, 2}") < 20);
}

#[test]
fn repeated_concatenation_runs_out_of_budget() {
    let source = "big = [0] * 10000\nfor _ in range(10):\n    y = big + big\n    hit = -1 in big\n";
    let mut h = harness_with(&[("bot.py", source)], InstrumentOptions::full(), roomy());
    let err = h.session.run().unwrap_err();
    assert!(matches!(err, SessionError::OutOfBudget(_)), "{err:?}");
}

#[test]
fn formatted_text_is_charged_by_length() {
    let base = init_cost("y = 1\ns = f'{y}'\n");
    assert!(init_cost("y = 1\ns = f'{y:>5000}'\n") - base >= 5000);
    assert!(init_cost("y = 'a' * 3000\ns = f'{y}{y}'\n") >= 3000 + 6000);
}

#[test]
fn oversized_format_width_is_fatal() {
    let source = "try:\n    s = f'{1:>999999999}'\nexcept:\n    log('caught')\n";
    let mut h = harness(source);
    let err = h.session.run().unwrap_err();
    assert!(
        matches!(err, SessionError::Fatal { kind: FatalKind::MemoryError, .. }),
        "{err:?}"
    );
    assert!(h.logs().is_empty());
}

#[test]
fn oversized_format_precision_is_a_value_error() {
    let source = "y = 1.5\ntry:\n    s = f'{y:.99999999999f}'\nexcept ValueError:\n    log('refused')\n";
    let mut h = harness(source);
    h.session.run().unwrap();
    assert_eq!(h.logs(), vec!["refused"]);
}

// ══════════════════════════════════════════════════════════════════════════════
// 4. Policy
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn private_names_are_rejected_at_compile_time() {
    for i in 0..100 {
        let source = format!("x = [].__attr{i}\n");
        let bundle = Bundle::single(&source);
        let err = compile_bundle(&bundle, &InstrumentOptions::full()).unwrap_err();
        assert!(matches!(err, CompilerError::Syntax { .. }), "attempt {i}: {err:?}");
    }
}

#[test]
fn private_item_keys_are_rejected_at_run_time() {
    for i in 0..100 {
        let source = format!("d = {{}}\nkey = '_' + 'k{i}'\ntry:\n    d[key] = 1\nexcept RuntimeError as e:\n    log(str(e))\n");
        let mut h = harness(&source);
        h.session.run().unwrap();
        assert_eq!(h.logs(), vec!["Cannot access attributes that begin with \"_\"."]);
    }
}

#[test]
fn modules_and_functions_are_read_only() {
    let cases = [
        ("import math\nmath.pi = 3\n", "Can't write to modules."),
        ("def f():\n    pass\nf.x = 1\n", "Can't write to functions."),
        ("log.level = 1\n", "Can't write to log"),
        ("len[0] = 1\n", "Can't write to functions."),
    ];
    for (source, message) in cases {
        let mut h = harness(source);
        let err = h.session.run().unwrap_err();
        assert!(matches!(err, SessionError::InitFailed(_)));
        assert!(h.errors().contains(message), "{source}: {}", h.errors());
    }
}

#[test]
fn imports_outside_the_allowlist_fail() {
    for name in ["os", "sys", "subprocess", "builtins"] {
        let source = format!("try:\n    import {name}\nexcept ImportError as e:\n    log(str(e))\n");
        let mut h = harness(&source);
        h.session.run().unwrap();
        assert_eq!(h.logs(), vec![format!("module '{name}' does not exist")]);
    }
}

#[test]
fn print_points_at_log() {
    let mut h = harness("print('hi')\n");
    assert!(h.session.run().is_err());
    assert!(h.errors().contains("Please use log() instead."));
}

#[test]
fn game_methods_reject_callables_as_arguments() {
    let program = program(
        &[("bot.py", "def f():\n    pass\ntry:\n    ping(f)\nexcept TypeError as e:\n    log(str(e))\nping(1)\n")],
        InstrumentOptions::full(),
    );
    let logs = Rc::new(RefCell::new(Vec::new()));
    let calls = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&calls);
    let mut session = Session::builder(&program)
        .log_sink(sink(&logs))
        .game_method("ping", move |_, _| {
            *counter.borrow_mut() += 1;
            Ok(Value::None)
        })
        .build()
        .unwrap();
    session.run().unwrap();
    assert_eq!(*calls.borrow(), 1);
    assert!(logs.borrow()[0].contains("user-defined and possibly dangerous"));
}

#[test]
fn game_methods_see_the_live_budget() {
    let program = program(
        &[("bot.py", "def turn():\n    log(budget())\n")],
        InstrumentOptions::full(),
    );
    let logs = Rc::new(RefCell::new(Vec::new()));
    let mut session = Session::builder(&program)
        .log_sink(sink(&logs))
        .game_method("budget", |vm, _| Ok(Value::Int(vm.budget())))
        .build()
        .unwrap();
    session.run().unwrap();
    session.run().unwrap();
    let reported: i64 = logs.borrow()[0].parse().unwrap();
    assert!(reported > 20_000 && reported < 40_000);
}

// ══════════════════════════════════════════════════════════════════════════════
// 5. Imports
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn import_cycle_names_both_modules() {
    let files = [
        ("bot.py", "import a\n"),
        ("a.py", "import b\n"),
        ("b.py", "import a\n"),
    ];
    for _ in 0..100 {
        let mut h = harness_with(&files, InstrumentOptions::full(), RuntimeConfig::default());
        let err = h.session.run().unwrap_err();
        assert!(matches!(err, SessionError::InitFailed(_)));
        assert!(h.errors().contains("infinite loop in imports: a -> b -> a"), "{}", h.errors());
    }
}

#[test]
fn acyclic_import_chain_succeeds() {
    let mut sources: Vec<(String, String)> = (0..20)
        .map(|i| (format!("m{i}.py"), format!("import m{}\nvalue = m{}.value + 1\n", i + 1, i + 1)))
        .collect();
    sources.push(("m20.py".into(), "value = 0\n".into()));
    sources.push(("bot.py".into(), "import m0\nlog(m0.value)\n".into()));
    let files: Vec<(&str, &str)> = sources.iter().map(|(n, s)| (n.as_str(), s.as_str())).collect();
    let mut h = harness_with(&files, InstrumentOptions::full(), RuntimeConfig::default());
    h.session.run().unwrap();
    assert_eq!(h.logs(), vec!["20"]);
}

#[test]
fn imported_module_bindings_are_isolated() {
    let files = [
        ("bot.py", "import helper\nfrom helper import items\nitems.append(1)\nlog(helper.count(), len(items))\n"),
        ("helper.py", "items = []\ndef count():\n    return len(items)\n"),
    ];
    let mut h = harness_with(&files, InstrumentOptions::full(), RuntimeConfig::default());
    h.session.run().unwrap();
    assert_eq!(h.logs(), vec!["0 1"]);
}

#[test]
fn random_is_seeded_and_requires_explicit_reseed() {
    let source = "import random\nlog(random.randint(1, 1000), random.randint(1, 1000))\ntry:\n    random.seed()\nexcept ValueError:\n    log('refused')\n";
    let first = {
        let mut h = harness(source);
        h.session.run().unwrap();
        h.logs()
    };
    for _ in 0..100 {
        let mut h = harness(source);
        h.session.run().unwrap();
        assert_eq!(h.logs(), first);
    }
    assert_eq!(first[1], "refused");
}

// ══════════════════════════════════════════════════════════════════════════════
// 6. Lifecycle
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn init_runs_once_then_turn_every_run() {
    let mut h = harness("count = 0\nlog('init')\ndef turn():\n    global count\n    count += 1\n    log(count)\n");
    for _ in 0..4 {
        h.session.run().unwrap();
    }
    assert!(h.session.is_initialized());
    assert_eq!(h.logs(), vec!["init", "1", "2", "3"]);
}

#[test]
fn user_errors_in_turn_are_reported_not_fatal() {
    let mut h = harness("def helper():\n    return 1 // 0\n\ndef turn():\n    helper()\n");
    h.session.run().unwrap();
    h.session.run().unwrap();
    h.session.run().unwrap();
    let errors = h.errors();
    assert!(errors.contains("ZeroDivisionError: integer division or modulo by zero"));
    assert!(errors.contains("in helper"));
    assert!(errors.contains("Traceback (most recent call last):"));
}

#[test]
fn init_errors_fail_the_session() {
    let mut h = harness("x = undefined_name\n");
    let err = h.session.run().unwrap_err();
    assert!(matches!(err, SessionError::InitFailed(ref m) if m.contains("NameError")));
    assert!(h.errors().contains("name 'undefined_name' is not defined"));
}

#[test]
fn missing_turn_function_is_recoverable() {
    let mut h = harness("x = 1\n");
    h.session.run().unwrap();
    let err = h.session.run().unwrap_err();
    assert!(matches!(err, SessionError::MissingTurnFunction));
    assert!(err.is_recoverable());
    assert!(h.errors().contains("Couldn't find turn function."));
}

#[test]
fn memory_limit_is_checked_after_each_run() {
    let mut h = harness("big = list(range(5000))\n");
    match h.session.run().unwrap_err() {
        SessionError::MemoryLimit { used, limit } => {
            assert_eq!(limit, 10_240);
            assert!(used > limit);
        }
        other => panic!("expected memory limit, got {other:?}"),
    }
}

#[test]
fn data_kept_alive_indirectly_counts_toward_memory() {
    for holder in [
        "keep = big.count",
        "keep = enumerate(big)",
        "keep = ValueError(big)",
        "def keep(x=big):\n    pass",
    ] {
        let source = format!("big = [0] * 3000\n{holder}\ndel big\n");
        let mut h = harness(&source);
        match h.session.run().unwrap_err() {
            SessionError::MemoryLimit { used, limit } => assert!(used > limit, "{holder}"),
            other => panic!("expected memory limit for {holder:?}, got {other:?}"),
        }
    }
}

#[test]
fn last_memory_usage_tracks_bindings() {
    let mut h = harness("xs = []\ndef turn():\n    xs.append(1)\n");
    h.session.run().unwrap();
    let before = h.session.last_memory_usage();
    h.session.run().unwrap();
    assert_eq!(h.session.last_memory_usage(), before + 5);
}

#[test]
fn killed_session_cannot_run() {
    let mut h = harness("def turn():\n    pass\n");
    h.session.run().unwrap();
    h.session.kill();
    assert!(h.session.is_killed());
    assert!(matches!(h.session.run(), Err(SessionError::Killed)));
    assert_eq!(h.session.budget(), 0);
    assert!(h.session.binding("turn").is_none());
}
