//! AST → compiled program unit.
//!
//! Each module body and each `def`/`lambda` becomes one [`CodeUnit`];
//! function bodies are stored as `Constant::Code` in the enclosing unit's
//! constant pool. Instructions are collected in an [`InstrList`] with
//! symbolic labels, then assembled in one go.
//!
//! Name resolution:
//! - module level: `LOAD_NAME`/`STORE_NAME` against the module namespace;
//! - functions: parameters and assigned names are fast locals, anything
//!   else (or anything declared `global`) goes through `LOAD_GLOBAL`,
//!   which falls back from module globals to the capability namespace.

use std::collections::HashSet;
use std::rc::Rc;

use malthusia_types::ast::*;

use crate::editor::{InstrList, Origin};
use crate::error::{CodegenError, CodegenResult};
use crate::opcode::{Comparison, Opcode, FORMAT_VALUE_HAS_SPEC, MAKE_FUNCTION_DEFAULTS};
use crate::unit::{intern_const, intern_name, CodeUnit, Constant, UnitKind};

/// Name given to module-level units.
pub const MODULE_UNIT_NAME: &str = "<module>";

/// Name given to lambda units.
pub const LAMBDA_UNIT_NAME: &str = "<lambda>";

// ══════════════════════════════════════════════════════════════════════════════
// Public API
// ══════════════════════════════════════════════════════════════════════════════

/// Compile a parsed module into its top-level unit.
pub fn compile_module(module: &Module, filename: &str) -> CodegenResult<CodeUnit> {
    let first_line = module.body.first().map(|s| s.span.line()).unwrap_or(1);
    let mut builder = UnitBuilder::new(MODULE_UNIT_NAME, filename, Scope::Module, first_line);
    builder.compile_body(&module.body)?;
    builder.emit_return_none();
    builder.finish()
}

// ══════════════════════════════════════════════════════════════════════════════
// Unit Builder
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Label(usize);

enum Scope {
    Module,
    Function {
        locals: HashSet<String>,
        globals: HashSet<String>,
    },
}

/// Enclosing constructs that `break`/`continue` must unwind.
#[derive(Debug, Clone, Copy)]
enum FBlock {
    Loop {
        is_for: bool,
        continue_to: Label,
        break_to: Label,
    },
    /// Inside a `try` body: a `SETUP_EXCEPT` block is active.
    Try,
    /// Inside an `except` body: a handler block is active.
    Handler,
}

enum NameOp {
    Load,
    Store,
    Delete,
}

struct UnitBuilder {
    name: String,
    filename: String,
    scope: Scope,
    argcount: u32,
    varnames: Vec<String>,
    names: Vec<String>,
    consts: Vec<Constant>,
    list: InstrList,
    labels: Vec<Option<crate::editor::InstrId>>,
    pending: Vec<Label>,
    fixups: Vec<(usize, Label)>,
    fblocks: Vec<FBlock>,
    first_line: u32,
    line: u32,
}

impl UnitBuilder {
    fn new(name: &str, filename: &str, scope: Scope, first_line: u32) -> Self {
        Self {
            name: name.to_string(),
            filename: filename.to_string(),
            scope,
            argcount: 0,
            varnames: Vec::new(),
            names: Vec::new(),
            consts: Vec::new(),
            list: InstrList::new(),
            labels: Vec::new(),
            pending: Vec::new(),
            fixups: Vec::new(),
            fblocks: Vec::new(),
            first_line,
            line: first_line,
        }
    }

    fn kind(&self) -> UnitKind {
        match self.scope {
            Scope::Module => UnitKind::Module,
            Scope::Function { .. } => UnitKind::Function,
        }
    }

    // ── Emission ──────────────────────────────────────────────────────────────

    fn emit(&mut self, op: Opcode, arg: u32) {
        let id = self.list.push(op, arg, self.line, Origin::Original);
        for label in self.pending.drain(..) {
            self.labels[label.0] = Some(id);
        }
    }

    fn emit_jump(&mut self, op: Opcode, label: Label) {
        self.fixups.push((self.list.len(), label));
        self.emit(op, 0);
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Attach `label` to the next emitted instruction.
    fn bind(&mut self, label: Label) {
        self.pending.push(label);
    }

    fn emit_const(&mut self, value: Constant) {
        let idx = intern_const(&mut self.consts, value);
        self.emit(Opcode::LoadConst, idx);
    }

    fn name_index(&mut self, name: &str) -> u32 {
        intern_name(&mut self.names, name)
    }

    fn varname_index(&mut self, name: &str) -> u32 {
        intern_name(&mut self.varnames, name)
    }

    fn emit_return_none(&mut self) {
        self.emit_const(Constant::None);
        self.emit(Opcode::ReturnValue, 0);
    }

    fn emit_name(&mut self, name: &str, op: NameOp) {
        let fast = match &self.scope {
            Scope::Module => None,
            Scope::Function { locals, globals } => {
                Some(locals.contains(name) && !globals.contains(name))
            }
        };
        let (opcode, arg) = match (fast, op) {
            (None, NameOp::Load) => (Opcode::LoadName, self.name_index(name)),
            (None, NameOp::Store) => (Opcode::StoreName, self.name_index(name)),
            (None, NameOp::Delete) => (Opcode::DeleteName, self.name_index(name)),
            (Some(true), NameOp::Load) => (Opcode::LoadFast, self.varname_index(name)),
            (Some(true), NameOp::Store) => (Opcode::StoreFast, self.varname_index(name)),
            (Some(true), NameOp::Delete) => (Opcode::DeleteFast, self.varname_index(name)),
            (Some(false), NameOp::Load) => (Opcode::LoadGlobal, self.name_index(name)),
            (Some(false), NameOp::Store) => (Opcode::StoreGlobal, self.name_index(name)),
            (Some(false), NameOp::Delete) => (Opcode::DeleteGlobal, self.name_index(name)),
        };
        self.emit(opcode, arg);
    }

    fn finish(mut self) -> CodegenResult<CodeUnit> {
        if !self.pending.is_empty() {
            return Err(CodegenError::Unsupported(format!(
                "label bound past the end of '{}'",
                self.name
            )));
        }
        for (pos, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0].ok_or_else(|| {
                CodegenError::Unsupported(format!("unbound jump label in '{}'", self.name))
            })?;
            self.list.instrs[pos].jump = Some(target);
        }
        let assembled = self.list.assemble(&self.name, self.first_line)?;
        let max_stack = self.list.max_stack_depth();
        Ok(CodeUnit {
            kind: self.kind(),
            name: self.name,
            filename: self.filename,
            argcount: self.argcount,
            varnames: self.varnames,
            names: self.names,
            consts: self.consts,
            code: assembled.code,
            first_line: self.first_line,
            lnotab: assembled.lnotab,
            max_stack,
        })
    }

    // ══════════════════════════════════════════════════════════════════════════
    // Statements
    // ══════════════════════════════════════════════════════════════════════════

    fn compile_body(&mut self, body: &[Stmt]) -> CodegenResult<()> {
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> CodegenResult<()> {
        self.line = stmt.span.line();
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(Opcode::PopTop, 0);
            }
            StmtKind::Assign { targets, value } => {
                self.compile_expr(value)?;
                for (i, target) in targets.iter().enumerate() {
                    if i + 1 < targets.len() {
                        self.emit(Opcode::DupTop, 0);
                    }
                    self.compile_store(target)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.compile_aug_assign(target, *op, value)?,
            StmtKind::If { test, body, orelse } => {
                let orelse_label = self.new_label();
                self.compile_expr(test)?;
                self.emit_jump(Opcode::PopJumpIfFalse, orelse_label);
                self.compile_body(body)?;
                if orelse.is_empty() {
                    self.bind(orelse_label);
                } else {
                    let end = self.new_label();
                    self.emit_jump(Opcode::JumpForward, end);
                    self.bind(orelse_label);
                    self.compile_body(orelse)?;
                    self.bind(end);
                }
            }
            StmtKind::While { test, body, orelse } => {
                let start = self.new_label();
                let orelse_label = self.new_label();
                let end = self.new_label();
                self.bind(start);
                self.compile_expr(test)?;
                self.emit_jump(Opcode::PopJumpIfFalse, orelse_label);
                self.fblocks.push(FBlock::Loop {
                    is_for: false,
                    continue_to: start,
                    break_to: end,
                });
                self.compile_body(body)?;
                self.fblocks.pop();
                self.emit_jump(Opcode::JumpAbsolute, start);
                self.bind(orelse_label);
                self.compile_body(orelse)?;
                self.bind(end);
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let start = self.new_label();
                let cleanup = self.new_label();
                let end = self.new_label();
                self.compile_expr(iter)?;
                self.emit(Opcode::GetIter, 0);
                self.bind(start);
                self.emit_jump(Opcode::ForIter, cleanup);
                self.compile_store(target)?;
                self.fblocks.push(FBlock::Loop {
                    is_for: true,
                    continue_to: start,
                    break_to: end,
                });
                self.compile_body(body)?;
                self.fblocks.pop();
                self.emit_jump(Opcode::JumpAbsolute, start);
                self.bind(cleanup);
                self.compile_body(orelse)?;
                self.bind(end);
            }
            StmtKind::Break => self.compile_loop_exit(true)?,
            StmtKind::Continue => self.compile_loop_exit(false)?,
            StmtKind::Pass | StmtKind::Global(_) => {}
            StmtKind::FunctionDef(def) => {
                self.compile_function(&def.name.name, &def.params, FunctionBody::Block(&def.body), def.span.line())?;
                self.emit_name(&def.name.name, NameOp::Store);
            }
            StmtKind::Return(value) => {
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => self.emit_const(Constant::None),
                }
                self.emit(Opcode::ReturnValue, 0);
            }
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    let idx = self.name_index(&alias.name.name);
                    self.emit(Opcode::ImportName, idx);
                    self.emit_name(&alias.bound_name().name, NameOp::Store);
                }
            }
            StmtKind::ImportFrom { module, names } => {
                let idx = self.name_index(&module.name);
                self.emit(Opcode::ImportName, idx);
                for alias in names {
                    let idx = self.name_index(&alias.name.name);
                    self.emit(Opcode::ImportFrom, idx);
                    self.emit_name(&alias.bound_name().name, NameOp::Store);
                }
                self.emit(Opcode::PopTop, 0);
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
            } => self.compile_try(body, handlers, orelse)?,
            StmtKind::Raise(exc) => match exc {
                Some(exc) => {
                    self.compile_expr(exc)?;
                    self.emit(Opcode::RaiseVarargs, 1);
                }
                None => self.emit(Opcode::RaiseVarargs, 0),
            },
            StmtKind::Assert { test, msg } => {
                let end = self.new_label();
                self.compile_expr(test)?;
                self.emit_jump(Opcode::PopJumpIfTrue, end);
                self.emit(Opcode::LoadAssertionError, 0);
                if let Some(msg) = msg {
                    self.compile_expr(msg)?;
                    self.emit(Opcode::CallFunction, 1);
                }
                self.emit(Opcode::RaiseVarargs, 1);
                self.bind(end);
            }
            StmtKind::Del(targets) => {
                for target in targets {
                    self.compile_delete(target)?;
                }
            }
        }
        Ok(())
    }

    fn compile_store(&mut self, target: &Expr) -> CodegenResult<()> {
        match &target.kind {
            ExprKind::Name(name) => self.emit_name(name, NameOp::Store),
            ExprKind::Attribute { value, attr } => {
                self.compile_expr(value)?;
                let idx = self.name_index(&attr.name);
                self.emit(Opcode::StoreAttr, idx);
            }
            ExprKind::Subscript { value, index } => {
                self.compile_expr(value)?;
                self.compile_index(index)?;
                self.emit(Opcode::StoreSubscr, 0);
            }
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                self.emit(Opcode::UnpackSequence, items.len() as u32);
                for item in items {
                    self.compile_store(item)?;
                }
            }
            _ => {
                return Err(CodegenError::Unsupported(
                    "assignment to this expression".into(),
                ))
            }
        }
        Ok(())
    }

    fn compile_delete(&mut self, target: &Expr) -> CodegenResult<()> {
        match &target.kind {
            ExprKind::Name(name) => self.emit_name(name, NameOp::Delete),
            ExprKind::Attribute { value, attr } => {
                self.compile_expr(value)?;
                let idx = self.name_index(&attr.name);
                self.emit(Opcode::DeleteAttr, idx);
            }
            ExprKind::Subscript { value, index } => {
                self.compile_expr(value)?;
                self.compile_index(index)?;
                self.emit(Opcode::DeleteSubscr, 0);
            }
            _ => return Err(CodegenError::Unsupported("deleting this expression".into())),
        }
        Ok(())
    }

    fn compile_aug_assign(&mut self, target: &Expr, op: BinOp, value: &Expr) -> CodegenResult<()> {
        let opcode = inplace_opcode(op);
        match &target.kind {
            ExprKind::Name(name) => {
                self.emit_name(name, NameOp::Load);
                self.compile_expr(value)?;
                self.emit(opcode, 0);
                self.emit_name(name, NameOp::Store);
            }
            ExprKind::Attribute { value: obj, attr } => {
                let idx = self.name_index(&attr.name);
                self.compile_expr(obj)?;
                self.emit(Opcode::DupTop, 0);
                self.emit(Opcode::LoadAttr, idx);
                self.compile_expr(value)?;
                self.emit(opcode, 0);
                self.emit(Opcode::RotTwo, 0);
                self.emit(Opcode::StoreAttr, idx);
            }
            ExprKind::Subscript { value: obj, index } => {
                self.compile_expr(obj)?;
                self.compile_index(index)?;
                self.emit(Opcode::DupTopTwo, 0);
                self.emit(Opcode::BinarySubscr, 0);
                self.compile_expr(value)?;
                self.emit(opcode, 0);
                self.emit(Opcode::RotThree, 0);
                self.emit(Opcode::StoreSubscr, 0);
            }
            _ => {
                return Err(CodegenError::Unsupported(
                    "augmented assignment to this expression".into(),
                ))
            }
        }
        Ok(())
    }

    /// `break` / `continue`: pop every block between here and the loop.
    fn compile_loop_exit(&mut self, is_break: bool) -> CodegenResult<()> {
        let mut target = None;
        for block in self.fblocks.clone().into_iter().rev() {
            match block {
                FBlock::Try => self.emit(Opcode::PopBlock, 0),
                FBlock::Handler => self.emit(Opcode::PopExcept, 0),
                FBlock::Loop {
                    is_for,
                    continue_to,
                    break_to,
                } => {
                    target = Some((is_for, continue_to, break_to));
                    break;
                }
            }
        }
        let (is_for, continue_to, break_to) = target.ok_or_else(|| {
            CodegenError::Unsupported(if is_break {
                "'break' outside loop".into()
            } else {
                "'continue' outside loop".into()
            })
        })?;
        if is_break {
            if is_for {
                self.emit(Opcode::PopTop, 0);
            }
            self.emit_jump(Opcode::JumpAbsolute, break_to);
        } else {
            self.emit_jump(Opcode::JumpAbsolute, continue_to);
        }
        Ok(())
    }

    /// Layout:
    ///
    /// ```text
    ///     SETUP_EXCEPT handler
    ///     <body>
    ///     POP_BLOCK
    ///     <else>
    ///     JUMP_FORWARD end
    /// handler:                      ; stack: [exc]
    ///     DUP_TOP; <type>; COMPARE_OP exception-match; POP_JUMP_IF_FALSE next
    ///     STORE <name> | POP_TOP
    ///     <handler body>
    ///     POP_EXCEPT
    ///     JUMP_FORWARD end
    /// next:
    ///     ...
    ///     RERAISE                   ; no handler matched
    /// end:
    /// ```
    fn compile_try(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: &[Stmt],
    ) -> CodegenResult<()> {
        let handler_label = self.new_label();
        let end = self.new_label();

        self.emit_jump(Opcode::SetupExcept, handler_label);
        self.fblocks.push(FBlock::Try);
        self.compile_body(body)?;
        self.fblocks.pop();
        self.emit(Opcode::PopBlock, 0);
        self.compile_body(orelse)?;
        self.emit_jump(Opcode::JumpForward, end);

        self.bind(handler_label);
        self.fblocks.push(FBlock::Handler);
        let mut has_bare = false;
        for handler in handlers {
            self.line = handler.span.line();
            let next = self.new_label();
            match &handler.kind {
                Some(kind) => {
                    self.emit(Opcode::DupTop, 0);
                    self.compile_expr(kind)?;
                    self.emit(Opcode::CompareOp, Comparison::ExceptionMatch as u32);
                    self.emit_jump(Opcode::PopJumpIfFalse, next);
                }
                None => has_bare = true,
            }
            match &handler.name {
                Some(name) => self.emit_name(&name.name, NameOp::Store),
                None => self.emit(Opcode::PopTop, 0),
            }
            self.compile_body(&handler.body)?;
            self.emit(Opcode::PopExcept, 0);
            self.emit_jump(Opcode::JumpForward, end);
            if handler.kind.is_some() {
                self.bind(next);
            }
        }
        if !has_bare {
            self.emit(Opcode::Reraise, 0);
        }
        self.fblocks.pop();
        self.bind(end);
        Ok(())
    }

    // ══════════════════════════════════════════════════════════════════════════
    // Functions
    // ══════════════════════════════════════════════════════════════════════════

    /// Emit `MAKE_FUNCTION` for a nested unit, leaving the function on the stack.
    fn compile_function(
        &mut self,
        name: &str,
        params: &[Param],
        body: FunctionBody<'_>,
        line: u32,
    ) -> CodegenResult<()> {
        let defaults: Vec<&Expr> = params.iter().filter_map(|p| p.default.as_ref()).collect();
        for default in &defaults {
            self.compile_expr(default)?;
        }
        let mut flags = 0;
        if !defaults.is_empty() {
            self.emit(Opcode::BuildTuple, defaults.len() as u32);
            flags |= MAKE_FUNCTION_DEFAULTS;
        }

        let mut locals: HashSet<String> = params.iter().map(|p| p.name.name.clone()).collect();
        let mut globals = HashSet::new();
        if let FunctionBody::Block(stmts) = body {
            collect_locals(stmts, &mut locals, &mut globals);
        }
        let mut child = UnitBuilder::new(
            name,
            &self.filename,
            Scope::Function { locals, globals },
            line,
        );
        child.argcount = params.len() as u32;
        for param in params {
            child.varname_index(&param.name.name);
        }
        match body {
            FunctionBody::Block(stmts) => {
                child.compile_body(stmts)?;
                child.emit_return_none();
            }
            FunctionBody::Expr(expr) => {
                child.compile_expr(expr)?;
                child.emit(Opcode::ReturnValue, 0);
            }
        }
        let unit = child.finish()?;

        self.emit_const(Constant::Code(Rc::new(unit)));
        self.emit(Opcode::MakeFunction, flags);
        Ok(())
    }

    // ══════════════════════════════════════════════════════════════════════════
    // Expressions
    // ══════════════════════════════════════════════════════════════════════════

    fn compile_expr(&mut self, expr: &Expr) -> CodegenResult<()> {
        match &expr.kind {
            ExprKind::Int(v) => self.emit_const(Constant::Int(*v)),
            ExprKind::Float(v) => self.emit_const(Constant::Float(*v)),
            ExprKind::Str(s) => self.emit_const(Constant::Str(s.clone())),
            ExprKind::Bool(b) => self.emit_const(Constant::Bool(*b)),
            ExprKind::None => self.emit_const(Constant::None),
            ExprKind::FString(parts) => {
                for part in parts {
                    match part {
                        FStringPart::Text(text) => self.emit_const(Constant::Str(text.clone())),
                        FStringPart::Field { value, spec } => {
                            self.compile_expr(value)?;
                            let mut flags = 0;
                            if let Some(spec) = spec {
                                self.emit_const(Constant::Str(spec.clone()));
                                flags |= FORMAT_VALUE_HAS_SPEC;
                            }
                            self.emit(Opcode::FormatValue, flags);
                        }
                    }
                }
                self.emit(Opcode::BuildString, parts.len() as u32);
            }
            ExprKind::List(items) => self.compile_sequence(items, Opcode::BuildList)?,
            ExprKind::Tuple(items) => self.compile_sequence(items, Opcode::BuildTuple)?,
            ExprKind::Set(items) => self.compile_sequence(items, Opcode::BuildSet)?,
            ExprKind::Dict(pairs) => {
                for (key, value) in pairs {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                }
                self.emit(Opcode::BuildMap, pairs.len() as u32);
            }
            ExprKind::Name(name) => self.emit_name(name, NameOp::Load),
            ExprKind::Attribute { value, attr } => {
                self.compile_expr(value)?;
                let idx = self.name_index(&attr.name);
                self.emit(Opcode::LoadAttr, idx);
            }
            ExprKind::Subscript { value, index } => {
                self.compile_expr(value)?;
                self.compile_index(index)?;
                self.emit(Opcode::BinarySubscr, 0);
            }
            ExprKind::Slice { .. } => {
                return Err(CodegenError::Unsupported("slice outside a subscript".into()))
            }
            ExprKind::Call { func, args } => {
                if let ExprKind::Attribute { value, attr } = &func.kind {
                    self.compile_expr(value)?;
                    let idx = self.name_index(&attr.name);
                    self.emit(Opcode::LoadMethod, idx);
                    for arg in args {
                        self.compile_expr(arg)?;
                    }
                    self.emit(Opcode::CallMethod, args.len() as u32);
                } else {
                    self.compile_expr(func)?;
                    for arg in args {
                        self.compile_expr(arg)?;
                    }
                    self.emit(Opcode::CallFunction, args.len() as u32);
                }
            }
            ExprKind::Binary { left, op, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(binary_opcode(*op), 0);
            }
            ExprKind::Unary { op, operand } => {
                self.compile_expr(operand)?;
                let opcode = match op {
                    UnaryOp::Neg => Opcode::UnaryNegative,
                    UnaryOp::Pos => Opcode::UnaryPositive,
                    UnaryOp::Not => Opcode::UnaryNot,
                };
                self.emit(opcode, 0);
            }
            ExprKind::Compare { left, ops } => self.compile_compare(left, ops)?,
            ExprKind::BoolOp { op, values } => {
                let end = self.new_label();
                let jump = match op {
                    BoolOp::And => Opcode::JumpIfFalseOrPop,
                    BoolOp::Or => Opcode::JumpIfTrueOrPop,
                };
                for (i, value) in values.iter().enumerate() {
                    self.compile_expr(value)?;
                    if i + 1 < values.len() {
                        self.emit_jump(jump, end);
                    }
                }
                self.bind(end);
            }
            ExprKind::IfExp { test, body, orelse } => {
                let orelse_label = self.new_label();
                let end = self.new_label();
                self.compile_expr(test)?;
                self.emit_jump(Opcode::PopJumpIfFalse, orelse_label);
                self.compile_expr(body)?;
                self.emit_jump(Opcode::JumpForward, end);
                self.bind(orelse_label);
                self.compile_expr(orelse)?;
                self.bind(end);
            }
            ExprKind::Lambda { params, body } => {
                self.compile_function(LAMBDA_UNIT_NAME, params, FunctionBody::Expr(body), expr.span.line())?;
            }
        }
        Ok(())
    }

    fn compile_sequence(&mut self, items: &[Expr], build: Opcode) -> CodegenResult<()> {
        for item in items {
            self.compile_expr(item)?;
        }
        self.emit(build, items.len() as u32);
        Ok(())
    }

    /// The index of a subscript, building a slice object for `a:b:c`.
    fn compile_index(&mut self, index: &Expr) -> CodegenResult<()> {
        let ExprKind::Slice { lower, upper, step } = &index.kind else {
            return self.compile_expr(index);
        };
        for part in [lower, upper] {
            match part {
                Some(e) => self.compile_expr(e)?,
                None => self.emit_const(Constant::None),
            }
        }
        match step {
            Some(step) => {
                self.compile_expr(step)?;
                self.emit(Opcode::BuildSlice, 3);
            }
            None => self.emit(Opcode::BuildSlice, 2),
        }
        Ok(())
    }

    /// `a < b < c` evaluates `b` once and short-circuits:
    ///
    /// ```text
    ///     a; b; DUP_TOP; ROT_THREE; COMPARE_OP <; JUMP_IF_FALSE_OR_POP cleanup
    ///     c; COMPARE_OP <; JUMP_FORWARD end
    /// cleanup:
    ///     ROT_TWO; POP_TOP
    /// end:
    /// ```
    fn compile_compare(&mut self, left: &Expr, ops: &[(CmpOp, Expr)]) -> CodegenResult<()> {
        self.compile_expr(left)?;
        let Some(((last_op, last), init)) = ops.split_last() else {
            return Ok(());
        };
        if init.is_empty() {
            self.compile_expr(last)?;
            self.emit(Opcode::CompareOp, comparison(*last_op) as u32);
            return Ok(());
        }
        let cleanup = self.new_label();
        let end = self.new_label();
        for (op, right) in init {
            self.compile_expr(right)?;
            self.emit(Opcode::DupTop, 0);
            self.emit(Opcode::RotThree, 0);
            self.emit(Opcode::CompareOp, comparison(*op) as u32);
            self.emit_jump(Opcode::JumpIfFalseOrPop, cleanup);
        }
        self.compile_expr(last)?;
        self.emit(Opcode::CompareOp, comparison(*last_op) as u32);
        self.emit_jump(Opcode::JumpForward, end);
        self.bind(cleanup);
        self.emit(Opcode::RotTwo, 0);
        self.emit(Opcode::PopTop, 0);
        self.bind(end);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum FunctionBody<'a> {
    Block(&'a [Stmt]),
    Expr(&'a Expr),
}

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

/// Names bound anywhere in a function body, excluding nested function bodies.
fn collect_locals(body: &[Stmt], locals: &mut HashSet<String>, globals: &mut HashSet<String>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Assign { targets, .. } => {
                for target in targets {
                    collect_target(target, locals);
                }
            }
            StmtKind::AugAssign { target, .. } => collect_target(target, locals),
            StmtKind::For {
                target,
                body,
                orelse,
                ..
            } => {
                collect_target(target, locals);
                collect_locals(body, locals, globals);
                collect_locals(orelse, locals, globals);
            }
            StmtKind::If { body, orelse, .. } | StmtKind::While { body, orelse, .. } => {
                collect_locals(body, locals, globals);
                collect_locals(orelse, locals, globals);
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
            } => {
                collect_locals(body, locals, globals);
                for handler in handlers {
                    if let Some(name) = &handler.name {
                        locals.insert(name.name.clone());
                    }
                    collect_locals(&handler.body, locals, globals);
                }
                collect_locals(orelse, locals, globals);
            }
            StmtKind::FunctionDef(def) => {
                locals.insert(def.name.name.clone());
            }
            StmtKind::Import(aliases) | StmtKind::ImportFrom { names: aliases, .. } => {
                for alias in aliases {
                    locals.insert(alias.bound_name().name.clone());
                }
            }
            StmtKind::Global(names) => {
                for name in names {
                    globals.insert(name.name.clone());
                }
            }
            StmtKind::Del(targets) => {
                for target in targets {
                    collect_target(target, locals);
                }
            }
            _ => {}
        }
    }
}

fn collect_target(target: &Expr, locals: &mut HashSet<String>) {
    match &target.kind {
        ExprKind::Name(name) => {
            locals.insert(name.clone());
        }
        ExprKind::Tuple(items) | ExprKind::List(items) => {
            for item in items {
                collect_target(item, locals);
            }
        }
        _ => {}
    }
}

fn binary_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::BinaryAdd,
        BinOp::Sub => Opcode::BinarySubtract,
        BinOp::Mul => Opcode::BinaryMultiply,
        BinOp::Div => Opcode::BinaryTrueDivide,
        BinOp::FloorDiv => Opcode::BinaryFloorDivide,
        BinOp::Mod => Opcode::BinaryModulo,
        BinOp::Pow => Opcode::BinaryPower,
    }
}

fn inplace_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::InplaceAdd,
        BinOp::Sub => Opcode::InplaceSubtract,
        BinOp::Mul => Opcode::InplaceMultiply,
        BinOp::Div => Opcode::InplaceTrueDivide,
        BinOp::FloorDiv => Opcode::InplaceFloorDivide,
        BinOp::Mod => Opcode::InplaceModulo,
        BinOp::Pow => Opcode::BinaryPower,
    }
}

fn comparison(op: CmpOp) -> Comparison {
    match op {
        CmpOp::Lt => Comparison::Lt,
        CmpOp::LtE => Comparison::LtE,
        CmpOp::Eq => Comparison::Eq,
        CmpOp::NotEq => Comparison::NotEq,
        CmpOp::Gt => Comparison::Gt,
        CmpOp::GtE => Comparison::GtE,
        CmpOp::In => Comparison::In,
        CmpOp::NotIn => Comparison::NotIn,
        CmpOp::Is => Comparison::Is,
        CmpOp::IsNot => Comparison::IsNot,
    }
}
