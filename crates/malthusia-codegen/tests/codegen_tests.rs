//! Integration tests for the Malthusia code generator.
//!
//! Tests validate:
//! - Source programs compile to well-formed units (decodable, sane stack depth)
//! - Control-flow lowering (if/else, loops, break/continue, try/except)
//! - Instrumentation: one checkpoint per original instruction
//! - Jump targets after instrumentation land on the original target's group
//! - Operand widening when offsets or indices exceed one byte
//! - Guard, redirect and multiply rewrites
//! - Literal size ceiling
//! - Persisted unit codec
//! - Deterministic output

use std::collections::HashMap;

use malthusia_codegen::{
    compile_module, decode_unit, disassemble, encode_unit, instrument, CodeUnit, Constant,
    InstrList, InstrumentError, InstrumentOptions, Opcode, CHECKPOINT_NAME, GUARDED_EXCEPTIONS,
    MULTIPLY_NAME, REDIRECT_NAME,
};
use malthusia_parser::parse_source;
use malthusia_types::SourceFile;

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

/// Compile source to a module unit (panics on error).
fn compile(source: &str) -> CodeUnit {
    let sf = SourceFile::new("bot.py", source);
    let module = parse_source(&sf).unwrap_or_else(|e| {
        panic!(
            "parse errors:\n{}",
            e.errors
                .iter()
                .map(|e| format!("  [{}] {}", e.code, e.message))
                .collect::<Vec<_>>()
                .join("\n")
        )
    });
    compile_module(&module, "bot.py").unwrap_or_else(|e| panic!("codegen failed: {e}"))
}

fn decode(unit: &CodeUnit) -> InstrList {
    InstrList::decode(&unit.name, &unit.code, unit.first_line, &unit.lnotab)
        .unwrap_or_else(|e| panic!("decode failed: {e}"))
}

fn ops(unit: &CodeUnit) -> Vec<Opcode> {
    decode(unit).instrs.iter().map(|i| i.op).collect()
}

fn metering_only() -> InstrumentOptions {
    InstrumentOptions {
        inject_metering: true,
        ..InstrumentOptions::none()
    }
}

fn is_checkpoint(unit: &CodeUnit, list: &InstrList, pos: usize) -> bool {
    let instrs = &list.instrs;
    pos + 2 < instrs.len()
        && instrs[pos].op == Opcode::LoadGlobal
        && unit.names[instrs[pos].arg as usize] == CHECKPOINT_NAME
        && instrs[pos + 1].op == Opcode::CallFunction
        && instrs[pos + 1].arg == 0
        && instrs[pos + 2].op == Opcode::PopTop
}

/// Original instruction positions in a metering-only instrumented list,
/// keyed by the position of their checkpoint.
fn groups(unit: &CodeUnit, list: &InstrList) -> (Vec<usize>, HashMap<usize, usize>) {
    let mut originals = Vec::new();
    let mut head_to_original = HashMap::new();
    let mut pos = 0;
    while pos < list.instrs.len() {
        assert!(
            is_checkpoint(unit, list, pos),
            "missing checkpoint at position {pos} in\n{}",
            disassemble(unit)
        );
        head_to_original.insert(pos, originals.len());
        originals.push(pos + 3);
        pos += 4;
    }
    (originals, head_to_original)
}

/// Every jump in the instrumented unit lands on the checkpoint of the
/// instruction its original counterpart targeted.
fn assert_jumps_preserved(before: &CodeUnit, after: &CodeUnit) {
    let old = decode(before);
    let new = decode(after);
    let old_pos = old.positions();
    let new_pos = new.positions();
    let (originals, head_to_original) = groups(after, &new);
    assert_eq!(originals.len(), old.len());

    for (k, &pos) in originals.iter().enumerate() {
        let old_instr = &old.instrs[k];
        let new_instr = &new.instrs[pos];
        assert_eq!(old_instr.op, new_instr.op, "instruction {k} changed");
        if !old_instr.op.is_jump() {
            assert_eq!(old_instr.arg, new_instr.arg, "operand of {k} changed");
            continue;
        }
        let old_target = old_pos[&old_instr.jump.unwrap()];
        let new_target = new_pos[&new_instr.jump.unwrap()];
        assert_eq!(
            head_to_original.get(&new_target),
            Some(&old_target),
            "jump {k} ({}) retargeted wrongly",
            old_instr.op
        );
    }
}

const CONTROL_FLOW: &str = r#"
def classify(n):
    if n < 0:
        return "neg"
    elif n == 0:
        return "zero"
    else:
        return "pos"

total = 0
for i in range(10):
    if i % 2 == 0:
        continue
    j = 0
    while j < i:
        j += 1
        if j > 5:
            break
    else:
        total += 100
    total += j
try:
    x = 1 // 0
except ZeroDivisionError as e:
    x = 0
except (TypeError, ValueError):
    x = 1
else:
    x = 2
ok = 1 < total < 1000 and not (total is None)
label = classify(total) if ok else "?"
"#;

// ══════════════════════════════════════════════════════════════════════════════
// Compilation
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn empty_module_returns_none() {
    let unit = compile("pass\n");
    assert_eq!(ops(&unit), vec![Opcode::LoadConst, Opcode::ReturnValue]);
    assert_eq!(unit.consts, vec![Constant::None]);
    assert_eq!(unit.max_stack, 1);
}

#[test]
fn module_assignment_uses_store_name() {
    let unit = compile("x = 1\ny = x\n");
    assert_eq!(
        ops(&unit),
        vec![
            Opcode::LoadConst,
            Opcode::StoreName,
            Opcode::LoadName,
            Opcode::StoreName,
            Opcode::LoadConst,
            Opcode::ReturnValue,
        ]
    );
    assert_eq!(unit.names, vec!["x", "y"]);
}

#[test]
fn constants_are_deduplicated() {
    let unit = compile("a = 5\nb = 5\nc = 'hi'\nd = 'hi'\n");
    assert_eq!(
        unit.consts,
        vec![Constant::Int(5), Constant::Str("hi".into()), Constant::None]
    );
}

#[test]
fn function_locals_and_globals() {
    let unit = compile(
        "counter = 0\ndef bump(step):\n    global counter\n    tmp = step * 2\n    counter = counter + tmp\n    return len(str(tmp))\n",
    );
    let child = unit.children().next().expect("function unit");
    assert_eq!(child.name, "bump");
    assert_eq!(child.argcount, 1);
    assert_eq!(child.varnames, vec!["step", "tmp"]);
    let child_ops = ops(child);
    assert!(child_ops.contains(&Opcode::StoreFast));
    assert!(child_ops.contains(&Opcode::StoreGlobal));
    assert!(child_ops.contains(&Opcode::LoadGlobal));
    assert!(!child_ops.contains(&Opcode::LoadName));
    assert!(ops(&unit).contains(&Opcode::MakeFunction));
}

#[test]
fn defaults_are_built_as_tuple() {
    let unit = compile("def f(a, b=2, c=3):\n    return a\n");
    let list = decode(&unit);
    let make = list
        .instrs
        .iter()
        .position(|i| i.op == Opcode::MakeFunction)
        .unwrap();
    assert_eq!(list.instrs[make].arg, 1);
    assert_eq!(list.instrs[make - 2].op, Opcode::BuildTuple);
    assert_eq!(list.instrs[make - 2].arg, 2);
}

#[test]
fn method_calls_use_load_method() {
    let unit = compile("xs = []\nxs.append(1)\n");
    let o = ops(&unit);
    assert!(o.contains(&Opcode::LoadMethod));
    assert!(o.contains(&Opcode::CallMethod));
    assert!(!o.contains(&Opcode::LoadAttr));
}

#[test]
fn try_without_bare_handler_reraises() {
    let unit = compile("try:\n    pass\nexcept ValueError:\n    pass\n");
    let o = ops(&unit);
    assert_eq!(o[0], Opcode::SetupExcept);
    assert!(o.contains(&Opcode::PopBlock));
    assert!(o.contains(&Opcode::PopExcept));
    assert!(o.contains(&Opcode::Reraise));

    let bare = compile("try:\n    pass\nexcept:\n    pass\n");
    assert!(!ops(&bare).contains(&Opcode::Reraise));
}

#[test]
fn break_inside_try_pops_block() {
    let unit = compile("for i in [1]:\n    try:\n        break\n    except:\n        pass\n");
    let o = ops(&unit);
    let brk = o
        .windows(3)
        .position(|w| w == [Opcode::PopBlock, Opcode::PopTop, Opcode::JumpAbsolute]);
    assert!(brk.is_some(), "expected POP_BLOCK; POP_TOP; JUMP_ABSOLUTE in {o:?}");
}

#[test]
fn control_flow_corpus_compiles() {
    let unit = compile(CONTROL_FLOW);
    let list = decode(&unit);
    assert!(list.instrs.iter().any(|i| i.op == Opcode::ForIter));
    assert!(list.instrs.iter().any(|i| i.op == Opcode::JumpIfFalseOrPop));
    assert!(unit.max_stack >= 3);
    for instr in &list.instrs {
        if instr.op.is_jump() {
            assert!(instr.jump.is_some(), "unresolved jump {}", instr.op);
        }
    }
}

#[test]
fn line_table_tracks_statements() {
    let unit = compile("a = 1\n\nb = 2\n");
    let list = decode(&unit);
    let lines: Vec<u32> = list.instrs.iter().map(|i| i.line).collect();
    assert_eq!(lines[0], 1);
    assert_eq!(lines[2], 3);
}

#[test]
fn disassembly_mentions_nested_units() {
    let unit = compile("def f():\n    return 1\n");
    let text = disassemble(&unit);
    assert!(text.contains("Disassembly of <module>"));
    assert!(text.contains("Disassembly of f"));
    assert!(text.contains("MAKE_FUNCTION"));
}

// ══════════════════════════════════════════════════════════════════════════════
// Instrumentation
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn one_checkpoint_per_original_instruction() {
    let unit = compile("a = 1\nb = a + 2\n");
    let out = instrument(&unit, &metering_only()).unwrap();
    let list = decode(&out);
    let (originals, _) = groups(&out, &list);
    assert_eq!(originals.len(), decode(&unit).len());
    assert_eq!(out.names.last().map(String::as_str), Some(CHECKPOINT_NAME));
}

#[test]
fn jumps_land_on_original_targets() {
    let unit = compile(CONTROL_FLOW);
    let out = instrument(&unit, &metering_only()).unwrap();
    assert_jumps_preserved(&unit, &out);
    for (before, after) in unit.children().zip(out.children()) {
        assert_jumps_preserved(before, after);
    }
}

#[test]
fn nested_units_are_instrumented() {
    let unit = compile("def f(x):\n    def g():\n        return 1\n    return g\n");
    let out = instrument(&unit, &metering_only()).unwrap();
    let f = out.children().next().unwrap();
    let g = f.children().next().unwrap();
    for u in [&out, &**f, &**g] {
        assert!(u.names.iter().any(|n| n == CHECKPOINT_NAME), "{} not instrumented", u.name);
        groups(u, &decode(u));
    }
}

#[test]
fn widening_reaches_fixpoint() {
    // 300 distinct constants push LOAD_CONST past one byte, and the loop
    // body pushes the backward jump past 255 once checkpoints are added.
    let mut src = String::from("i = 0\nwhile i < 3:\n");
    for k in 0..300 {
        src.push_str(&format!("    v = {k}\n"));
    }
    src.push_str("    i += 1\n");
    let unit = compile(&src);
    assert!(unit.code.contains(&(Opcode::ExtendedArg as u8)));
    let out = instrument(&unit, &metering_only()).unwrap();
    assert!(out.code.len() > 4 * unit.code.len() / 2);
    assert_jumps_preserved(&unit, &out);
}

#[test]
fn guard_prologue_precedes_handlers() {
    let unit = compile("try:\n    x = 1\nexcept ValueError:\n    x = 2\n");
    let options = InstrumentOptions {
        guard_fatal_handlers: true,
        ..InstrumentOptions::none()
    };
    let out = instrument(&unit, &options).unwrap();
    let list = decode(&out);
    let positions = list.positions();
    let setup = &list.instrs[0];
    assert_eq!(setup.op, Opcode::SetupExcept);
    let head = positions[&setup.jump.unwrap()];

    let prologue = &list.instrs[head..];
    assert_eq!(prologue[0].op, Opcode::DupTop);
    for (k, name) in GUARDED_EXCEPTIONS.iter().enumerate() {
        assert_eq!(prologue[1 + k].op, Opcode::LoadGlobal);
        assert_eq!(out.names[prologue[1 + k].arg as usize], *name);
    }
    let n = GUARDED_EXCEPTIONS.len();
    assert_eq!(prologue[1 + n].op, Opcode::BuildTuple);
    assert_eq!(prologue[1 + n].arg as usize, n);
    assert_eq!(prologue[2 + n].op, Opcode::CompareOp);
    assert_eq!(prologue[3 + n].op, Opcode::PopJumpIfFalse);
    assert_eq!(prologue[4 + n].op, Opcode::Reraise);
    // The false branch resumes at the original handler entry.
    assert_eq!(positions[&prologue[3 + n].jump.unwrap()], head + 5 + n);
    assert_eq!(prologue[5 + n].op, Opcode::DupTop);
}

#[test]
fn guard_and_metering_share_one_head() {
    let unit = compile("try:\n    x = 1\nexcept:\n    x = 2\n");
    let out = instrument(&unit, &InstrumentOptions::default()).unwrap();
    let list = decode(&out);
    let positions = list.positions();
    let setup = list
        .instrs
        .iter()
        .find(|i| i.op == Opcode::SetupExcept)
        .unwrap();
    let head = positions[&setup.jump.unwrap()];
    assert!(is_checkpoint(&out, &list, head));
    assert_eq!(list.instrs[head + 3].op, Opcode::DupTop);
}

#[test]
fn redirect_wraps_load_method() {
    let unit = compile("xs = []\nxs.append(1)\n");
    let options = InstrumentOptions {
        redirect_method_lookups: true,
        ..InstrumentOptions::none()
    };
    let out = instrument(&unit, &options).unwrap();
    let list = decode(&out);
    let positions = list.positions();
    let lm = list
        .instrs
        .iter()
        .position(|i| i.op == Opcode::LoadMethod)
        .unwrap();
    let expected = [
        Opcode::DupTop,
        Opcode::LoadGlobal,
        Opcode::RotTwo,
        Opcode::LoadConst,
        Opcode::CallFunction,
        Opcode::RotTwo,
        Opcode::JumpAbsolute,
    ];
    let injected: Vec<Opcode> = list.instrs[lm - 7..lm].iter().map(|i| i.op).collect();
    assert_eq!(injected, expected);
    assert_eq!(out.names[list.instrs[lm - 6].arg as usize], REDIRECT_NAME);
    assert_eq!(
        out.consts[list.instrs[lm - 4].arg as usize],
        Constant::Str("append".into())
    );
    // The jump skips the raw lookup.
    assert_eq!(positions[&list.instrs[lm - 1].jump.unwrap()], lm + 1);
}

#[test]
fn multiply_is_metered() {
    let unit = compile("a = [0] * 10\nb = 3\nb *= 4\n");
    let options = InstrumentOptions {
        meter_multiply: true,
        ..InstrumentOptions::none()
    };
    let out = instrument(&unit, &options).unwrap();
    let list = decode(&out);
    let mut seen = 0;
    for (pos, instr) in list.instrs.iter().enumerate() {
        if matches!(instr.op, Opcode::BinaryMultiply | Opcode::InplaceMultiply) {
            let before: Vec<Opcode> = list.instrs[pos - 5..pos].iter().map(|i| i.op).collect();
            assert_eq!(
                before,
                vec![
                    Opcode::DupTopTwo,
                    Opcode::LoadGlobal,
                    Opcode::RotThree,
                    Opcode::CallFunction,
                    Opcode::PopTop
                ]
            );
            assert_eq!(out.names[list.instrs[pos - 4].arg as usize], MULTIPLY_NAME);
            seen += 1;
        }
    }
    assert_eq!(seen, 2);
}

#[test]
fn disabled_options_reencode_identically() {
    let unit = compile(CONTROL_FLOW);
    let out = instrument(&unit, &InstrumentOptions::none()).unwrap();
    assert_eq!(out.code, unit.code);
    assert_eq!(out.lnotab, unit.lnotab);
}

#[test]
fn stack_depth_grows_with_injection() {
    let unit = compile("a = [1] * 2\n");
    let out = instrument(&unit, &InstrumentOptions::full()).unwrap();
    assert!(out.max_stack > unit.max_stack);
}

#[test]
fn oversized_constant_rejected() {
    let unit = compile(&format!("s = '{}'\n", "a".repeat(1001)));
    let err = instrument(&unit, &InstrumentOptions::default()).unwrap_err();
    assert!(matches!(err, InstrumentError::ConstantTooLarge { size: 1001, .. }));

    let ok = compile(&format!("s = '{}'\n", "a".repeat(1000)));
    assert!(instrument(&ok, &InstrumentOptions::default()).is_ok());
}

#[test]
fn oversized_name_rejected() {
    let unit = compile(&format!("{} = 1\n", "n".repeat(1001)));
    let err = instrument(&unit, &InstrumentOptions::default()).unwrap_err();
    assert!(matches!(err, InstrumentError::NameTooLarge { .. }));
}

#[test]
fn malformed_code_rejected() {
    let mut unit = compile("x = 1\n");
    unit.code.push(100);
    let err = instrument(&unit, &InstrumentOptions::default()).unwrap_err();
    assert!(matches!(err, InstrumentError::MalformedUnit { .. }));
}

#[test]
fn options_deserialize_with_defaults() {
    let options: InstrumentOptions =
        serde_json::from_str(r#"{"redirect_method_lookups": true}"#).unwrap();
    assert_eq!(options, InstrumentOptions::full());
}

// ══════════════════════════════════════════════════════════════════════════════
// Persistence & Determinism
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn persisted_units_are_byte_exact() {
    let unit = instrument(&compile(CONTROL_FLOW), &InstrumentOptions::full()).unwrap();
    let bytes = encode_unit(&unit);
    let decoded = decode_unit(&bytes).unwrap();
    assert_eq!(decoded, unit);
    assert_eq!(encode_unit(&decoded), bytes);
}

#[test]
fn compilation_is_deterministic() {
    let first = encode_unit(&instrument(&compile(CONTROL_FLOW), &InstrumentOptions::full()).unwrap());
    for i in 0..100 {
        let again =
            encode_unit(&instrument(&compile(CONTROL_FLOW), &InstrumentOptions::full()).unwrap());
        assert_eq!(first, again, "iteration {i} differs");
    }
}
