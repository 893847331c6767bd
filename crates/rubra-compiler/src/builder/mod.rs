//! Scope-by-scope lowering driver.
//!
//! One [`Builder`] produces the instruction list for exactly one lexical
//! scope. Nested scopes are built to completion by child builders while
//! the parent build is suspended on the stack; the child keeps a
//! reference to its parent so `super` without arguments can replay the
//! parent chain's argument receives.
//!
//! Line numbers are not emitted eagerly. Statement and call boundaries
//! deposit a pending token which the next emitted instruction flushes,
//! so consecutive markers for the same line coalesce and trailing
//! markers with no successor instruction vanish.

use std::cell::Cell;
use std::time::Instant;

use rubra_ir::{
    CoverageMode, Instr, InterpreterContext, IrManager, Label, LocalVar, Operand, RubyEvent,
    RuntimeHelper, ScopeFlags, ScopeId, ScopeKind, Sym, TempKind, TempVar, Variable,
};

use crate::ast::{Node, ParseResult, TreeDialect};
use crate::{BuildError, BuildMetrics, BuildOptions, BuildOutput};

mod calls;
mod control;
mod expr;
mod protect;
mod scopes;

#[cfg(test)]
mod builder_tests;
#[cfg(test)]
mod property_tests;

/// Result of lowering one node: either an operand holding the node's
/// value, or a marker that control cannot fall through (the node ended
/// in a return or jump).
#[derive(Clone, Debug, PartialEq)]
pub enum Lowered {
    Value(Operand),
    Terminated,
}

impl Lowered {
    /// The value, or nil where control cannot reach anyway.
    pub fn operand(self) -> Operand {
        match self {
            Lowered::Value(v) => v,
            Lowered::Terminated => Operand::Nil,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Lowered::Terminated)
    }
}

/// Flavour of eval driving visibility and jump legality decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvalType {
    Plain,
    Instance,
    Module,
    Binding,
}

/// Pending line marker. Coverage tokens come from statement boundaries
/// and carry instrumentation; backtrace tokens come from call sites.
#[derive(Clone, Copy, Debug)]
enum LineToken {
    Coverage(u32),
    Backtrace(u32),
}

/// Labels and result slot of one lexical loop.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LoopInfo {
    pub loop_start: Label,
    pub iter_start: Label,
    pub iter_end: Label,
    pub loop_end: Label,
    pub result: Variable,
}

/// Book-keeping for one active rescue: where `retry` re-enters and the
/// `$!` value to restore when it does.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RescueBlockInfo {
    pub entry_label: Label,
    pub saved_exception: Variable,
}

/// Book-keeping for one protected region. The ensure body is built once
/// into `instrs` and replayed: cloned (with fresh labels) ahead of every
/// jump that leaves the region, and emitted verbatim on the exceptional
/// path.
#[derive(Clone, Debug)]
pub(crate) struct EnsureBlockInfo {
    pub region_start: Label,
    pub end: Label,
    pub dummy_rescue: Label,
    pub instrs: Vec<Instr>,
    /// Index into the loop stack at creation; jumps targeting an outer
    /// loop stop replaying ensures once they pass this region.
    pub innermost_loop: Option<usize>,
    pub rescuer_at_definition: Label,
    pub needs_backtrace: bool,
    pub saved_global_exception: Option<Variable>,
}

impl EnsureBlockInfo {
    fn new(
        region_start: Label,
        end: Label,
        dummy_rescue: Label,
        innermost_loop: Option<usize>,
        rescuer_at_definition: Label,
    ) -> EnsureBlockInfo {
        EnsureBlockInfo {
            region_start,
            end,
            dummy_rescue,
            instrs: Vec::new(),
            innermost_loop,
            rescuer_at_definition,
            needs_backtrace: true,
            saved_global_exception: None,
        }
    }
}

pub struct Builder<'a> {
    pub(crate) manager: &'a IrManager,
    pub(crate) options: &'a BuildOptions,
    pub(crate) scope: ScopeId,
    pub(crate) file: String,
    pub(crate) dialect: TreeDialect,
    pub(crate) coverage_mode: CoverageMode,
    pub(crate) parent: Option<&'a Builder<'a>>,
    /// When set, temporaries allocate from this builder's pool instead of
    /// our own; used for BEGIN bodies spliced into their host scope.
    pub(crate) variable_builder: Option<&'a Builder<'a>>,
    pub(crate) executes_once: bool,
    pub(crate) eval_type: Option<EvalType>,
    /// Name of the method a block is being passed to, handed from the
    /// call site into the block's builder.
    pub(crate) method_name: Option<Sym>,
    pub(crate) in_end_block: bool,

    pub(crate) instructions: Vec<Instr>,
    pub(crate) after_prologue_index: usize,
    pending_line: Option<LineToken>,
    last_processed_line: Option<u32>,

    temp_index: Cell<i32>,
    current_module_var: Cell<Option<TempVar>>,
    pub(crate) needs_yield_block: Cell<bool>,
    yield_closure_var: Cell<Option<TempVar>>,
    underscore_seen: Cell<bool>,

    pub(crate) loop_stack: Vec<LoopInfo>,
    pub(crate) rescue_stack: Vec<RescueBlockInfo>,
    pub(crate) ensure_stack: Vec<EnsureBlockInfo>,
    pub(crate) ensure_build_stack: Vec<EnsureBlockInfo>,
    /// Rescuer for code emitted right now; bottom element is the
    /// unrescued-region sentinel.
    pub(crate) active_rescuers: Vec<Label>,
}

impl<'a> Builder<'a> {
    pub(crate) fn new(
        manager: &'a IrManager,
        options: &'a BuildOptions,
        scope: ScopeId,
        dialect: TreeDialect,
        coverage_mode: CoverageMode,
        parent: Option<&'a Builder<'a>>,
        variable_builder: Option<&'a Builder<'a>>,
    ) -> Builder<'a> {
        Builder {
            manager,
            options,
            scope,
            file: manager.scope_file(scope),
            dialect,
            coverage_mode,
            parent,
            variable_builder,
            executes_once: parent.map_or(true, |p| p.executes_once),
            eval_type: parent.and_then(|p| p.eval_type),
            method_name: None,
            in_end_block: parent.map_or(false, |p| p.in_end_block),
            instructions: Vec::new(),
            after_prologue_index: 0,
            pending_line: None,
            last_processed_line: None,
            temp_index: Cell::new(-1),
            current_module_var: Cell::new(None),
            needs_yield_block: Cell::new(false),
            yield_closure_var: Cell::new(None),
            underscore_seen: Cell::new(false),
            loop_stack: Vec::new(),
            rescue_stack: Vec::new(),
            ensure_stack: Vec::new(),
            ensure_build_stack: Vec::new(),
            active_rescuers: vec![Label::UNRESCUED_REGION],
        }
    }

    // ---- entry points -------------------------------------------------

    pub fn build_root(
        manager: &'a IrManager,
        options: &'a BuildOptions,
        parse: &ParseResult,
    ) -> Result<BuildOutput, BuildError> {
        let start = Instant::now();
        let name = manager.intern("<main>");
        let scope = manager.new_scope(ScopeKind::Script, name, &parse.file, parse.line, None);
        let mut builder = Builder::new(
            manager,
            options,
            scope,
            parse.dialect,
            parse.coverage_mode,
            None,
            None,
        );
        let context = builder.build_root_inner(parse)?;
        manager.set_context(scope, context.clone());
        Ok(BuildOutput {
            scope,
            context,
            metrics: BuildMetrics { lower_time: start.elapsed() },
        })
    }

    fn build_root_inner(&mut self, parse: &ParseResult) -> Result<InterpreterContext, BuildError> {
        self.prepare_implicit_state();
        self.add_current_module();
        self.after_prologue_index = self.instructions.len();

        let rv = match &parse.body {
            Some(body) => self.build(body)?.operand(),
            None => Operand::Nil,
        };
        self.emit(Instr::Return { value: rv });

        self.compute_flags();
        Ok(self.finish(1))
    }

    pub fn build_eval_root(
        manager: &'a IrManager,
        options: &'a BuildOptions,
        parse: &ParseResult,
        eval_type: EvalType,
        containing_scope: ScopeId,
    ) -> Result<BuildOutput, BuildError> {
        let start = Instant::now();
        let name = manager.intern("EVAL_");
        let scope = manager.new_scope(
            ScopeKind::Eval,
            name,
            &parse.file,
            parse.line,
            Some(containing_scope),
        );
        let mut builder = Builder::new(manager, options, scope, parse.dialect, CoverageMode::None, None, None);
        builder.executes_once = false;
        builder.eval_type = Some(eval_type);
        let context = builder.build_eval_root_inner(parse)?;
        manager.set_context(scope, context.clone());
        Ok(BuildOutput {
            scope,
            context,
            metrics: BuildMetrics { lower_time: start.elapsed() },
        })
    }

    fn build_eval_root_inner(
        &mut self,
        parse: &ParseResult,
    ) -> Result<InterpreterContext, BuildError> {
        self.emit(Instr::LineNumber { line: parse.line, coverage: CoverageMode::None });
        self.prepare_implicit_state();
        self.add_current_module();
        self.after_prologue_index = self.instructions.len();

        let rv = match &parse.body {
            Some(body) => self.build(body)?.operand(),
            None => Operand::Nil,
        };
        self.emit(Instr::Return { value: rv });

        self.compute_flags();
        // One extra slot reserved beyond the script convention; eval
        // frames materialize the current module lazily at depth 0.
        Ok(self.finish(2))
    }

    /// Package the finished instruction list. `reserve` is the number of
    /// temporary slots exported beyond the highest index handed out.
    pub(crate) fn finish(&mut self, reserve: u32) -> InterpreterContext {
        InterpreterContext {
            instructions: std::mem::take(&mut self.instructions),
            temp_count: (self.temp_index.get() + reserve as i32).max(0) as u32,
            flags: self.manager.flags(self.scope),
        }
    }

    // ---- instruction stream -------------------------------------------

    /// Append an instruction, flushing any pending line marker first.
    pub(crate) fn emit(&mut self, instr: Instr) {
        if let Some(token) = self.pending_line.take() {
            match token {
                LineToken::Coverage(line) => {
                    self.add_instr(Instr::LineNumber { line, coverage: self.coverage_mode });
                    if self.options.full_trace {
                        self.add_instr(self.line_trace(line));
                    }
                }
                LineToken::Backtrace(line) => {
                    self.add_instr(Instr::LineNumber { line, coverage: CoverageMode::None });
                    if self.options.full_trace {
                        self.add_instr(self.line_trace(line));
                    }
                }
            }
        }
        self.add_instr(instr);
    }

    fn line_trace(&self, line: u32) -> Instr {
        let name = self
            .manager
            .nearest_method(self.scope)
            .map(|m| self.manager.scope_name(m));
        Instr::Trace { event: RubyEvent::Line, name, file: self.file.clone(), line }
    }

    /// Raw append that routes into an ensure-body buffer while one is
    /// being built.
    pub(crate) fn add_instr(&mut self, instr: Instr) {
        if let Some(ebi) = self.ensure_build_stack.last_mut() {
            ebi.instrs.push(instr);
        } else {
            let index = self.instructions.len();
            self.manager.notify_instr_added(self.scope, &instr, index);
            self.instructions.push(instr);
        }
    }

    pub(crate) fn add_instr_at_beginning(&mut self, instr: Instr) {
        if let Some(ebi) = self.ensure_build_stack.last_mut() {
            ebi.instrs.insert(0, instr);
        } else {
            self.manager.notify_instr_added(self.scope, &instr, 0);
            self.instructions.insert(0, instr);
        }
    }

    /// Record that the next emitted instruction needs a line marker.
    pub(crate) fn needs_line_number(&mut self, line: u32, newline: bool) {
        if self.last_processed_line != Some(line) {
            self.pending_line = Some(if newline {
                LineToken::Coverage(line)
            } else {
                LineToken::Backtrace(line)
            });
            self.last_processed_line = Some(line);
        }
    }

    // ---- variables and labels -----------------------------------------

    pub(crate) fn temp(&self) -> TempVar {
        if let Some(vb) = self.variable_builder {
            return vb.temp();
        }
        let index = self.temp_index.get() + 1;
        self.temp_index.set(index);
        let kind = if self.manager.kind(self.scope).is_closure_like() {
            TempKind::Closure(self.scope)
        } else {
            TempKind::Local
        };
        TempVar { index: index as u32, kind }
    }

    pub(crate) fn temp_var(&self) -> Variable {
        Variable::Temp(self.temp())
    }

    pub(crate) fn current_module_variable(&self) -> TempVar {
        if let Some(v) = self.current_module_var.get() {
            return v;
        }
        let v = self.create_current_module_variable();
        self.current_module_var.set(Some(v));
        v
    }

    fn create_current_module_variable(&self) -> TempVar {
        if let Some(vb) = self.variable_builder {
            return vb.create_current_module_variable();
        }
        let index = self.temp_index.get() + 1;
        self.temp_index.set(index);
        TempVar { index: index as u32, kind: TempKind::CurrentModule }
    }

    /// The implicit-block slot; marks the scope as needing its block
    /// loaded, which closures satisfy with a preload at entry.
    pub(crate) fn yield_closure_variable(&self) -> TempVar {
        self.needs_yield_block.set(true);
        if let Some(v) = self.yield_closure_var.get() {
            return v;
        }
        let v = self.temp();
        self.yield_closure_var.set(Some(v));
        v
    }

    pub(crate) fn local(&self, name: &str, depth: u32) -> Variable {
        Variable::Local(LocalVar { name: self.manager.intern(name), depth })
    }

    /// Parameter destination. Every `_` after the first gets a throwaway
    /// temporary so duplicate underscore parameters do not collide.
    pub(crate) fn argument_result(&self, name: &str) -> Variable {
        if name == "_" {
            if self.underscore_seen.get() {
                return self.temp_var();
            }
            self.underscore_seen.set(true);
        }
        self.local(name, 0)
    }

    pub(crate) fn new_label(&self) -> Label {
        self.manager.new_label(self.scope)
    }

    pub(crate) fn copy(&mut self, dst: Option<Variable>, src: Operand) -> Variable {
        let dst = dst.unwrap_or_else(|| self.temp_var());
        self.emit(Instr::Copy { dst, src });
        dst
    }

    /// Funnel a value into a temporary unless it already is one.
    pub(crate) fn value_in_temp(&mut self, value: Operand) -> Variable {
        match value {
            Operand::Var(Variable::Temp(t)) => Variable::Temp(t),
            other => self.copy(None, other),
        }
    }

    /// Branch taken when `value` matches `test`. Folds to a jump or a nop
    /// when both sides are known at build time. Only boolean, nil, and
    /// undefined tests exist; anything else is a bug in the caller.
    pub(crate) fn branch_instr(value: &Operand, test: &Operand, target: Label) -> Instr {
        match test {
            Operand::True => {
                if value.is_truthy_literal() {
                    Instr::Jump { target }
                } else if value.is_falsey_literal() {
                    Instr::Nop
                } else {
                    Instr::BTrue { target, value: value.clone() }
                }
            }
            Operand::False => {
                if value.is_falsey_literal() {
                    Instr::Jump { target }
                } else if value.is_truthy_literal() {
                    Instr::Nop
                } else {
                    Instr::BFalse { target, value: value.clone() }
                }
            }
            Operand::Nil => {
                if matches!(value, Operand::Nil) {
                    Instr::Jump { target }
                } else if value.is_immutable_literal() {
                    Instr::Nop
                } else {
                    Instr::BNil { target, value: value.clone() }
                }
            }
            Operand::Undefined => {
                if matches!(value, Operand::Undefined) {
                    Instr::Jump { target }
                } else if value.is_immutable_literal() {
                    Instr::Nop
                } else {
                    Instr::BUndef { target, value: value.clone() }
                }
            }
            _ => unreachable!("branch test must be true/false/nil/undefined"),
        }
    }

    pub(crate) fn create_branch(&mut self, value: &Operand, test: &Operand, target: Label) {
        let instr = Self::branch_instr(value, test, target);
        self.emit(instr);
    }

    /// Two-armed conditional on `value != test`, yielding a result.
    pub(crate) fn if_else(
        &mut self,
        value: &Operand,
        test: &Operand,
        then_body: impl FnOnce(&mut Self) -> Result<Operand, BuildError>,
        else_body: impl FnOnce(&mut Self) -> Result<Operand, BuildError>,
    ) -> Result<Variable, BuildError> {
        let result = self.temp_var();
        let else_label = self.new_label();
        let end_label = self.new_label();
        self.emit(Instr::BNE { target: else_label, value: value.clone(), test: test.clone() });
        let v = then_body(self)?;
        self.emit(Instr::Copy { dst: result, src: v });
        self.emit(Instr::Jump { target: end_label });
        self.emit(Instr::Label { label: else_label });
        let v = else_body(self)?;
        self.emit(Instr::Copy { dst: result, src: v });
        self.emit(Instr::Label { label: end_label });
        Ok(result)
    }

    pub(crate) fn syntax_error<T>(&self, line: u32, message: impl Into<String>) -> Result<T, BuildError> {
        Err(BuildError::syntax(&self.file, line, message))
    }

    // ---- flag inference -----------------------------------------------

    pub(crate) fn compute_flags(&mut self) {
        let wk = self.manager.well_known();
        let mut flags = self.manager.flags(self.scope);
        for instr in &self.instructions {
            instr.compute_scope_flags(&mut flags, &wk);
        }
        for closure in self.manager.closures(self.scope) {
            let cf = self.manager.flags(closure);
            if cf.contains(ScopeFlags::USES_EVAL) {
                // Eval can hide jumps and zsuper we cannot see statically.
                flags.set(ScopeFlags::CAN_RECEIVE_BREAKS);
                flags.set(ScopeFlags::CAN_RECEIVE_NONLOCAL_RETURNS);
                flags.set(ScopeFlags::USES_ZSUPER);
            } else {
                if cf.contains(ScopeFlags::HAS_BREAK_INSTRS)
                    || cf.contains(ScopeFlags::CAN_RECEIVE_BREAKS)
                {
                    flags.set(ScopeFlags::CAN_RECEIVE_BREAKS);
                }
                if cf.contains(ScopeFlags::HAS_NONLOCAL_RETURNS)
                    || cf.contains(ScopeFlags::CAN_RECEIVE_NONLOCAL_RETURNS)
                {
                    flags.set(ScopeFlags::CAN_RECEIVE_NONLOCAL_RETURNS);
                }
                if cf.contains(ScopeFlags::USES_ZSUPER) {
                    flags.set(ScopeFlags::USES_ZSUPER);
                }
            }
        }
        if flags.contains(ScopeFlags::HAS_NONLOCAL_RETURNS)
            || flags.contains(ScopeFlags::CAN_RECEIVE_NONLOCAL_RETURNS)
            || flags.contains(ScopeFlags::CAN_CAPTURE_CALLERS_BINDING)
            || flags.contains(ScopeFlags::BINDING_HAS_ESCAPED)
        {
            flags.set(ScopeFlags::REQUIRES_DYNSCOPE);
        }
        flags.set(ScopeFlags::FLAGS_COMPUTED);
        self.manager.set_flags(self.scope, flags);
    }

    // ---- whole-scope unwind handlers ----------------------------------

    /// Wrap a lambda or block body so break/return unwinds reaching this
    /// frame are translated instead of propagating raw.
    pub(crate) fn handle_breaks_and_returns_in_lambda(&mut self) {
        let r_end = self.new_label();
        let rescue_label = Label::GLOBAL_ENSURE;
        self.add_instr_at_beginning(Instr::ExceptionRegionStart { rescuer: rescue_label });
        self.emit(Instr::ExceptionRegionEnd);
        self.emit(Instr::Label { label: rescue_label });
        let exc = self.temp_var();
        self.emit(Instr::ReceiveUnwindException { dst: exc });
        let ret = self.temp_var();
        self.emit(Instr::RuntimeHelperCall {
            dst: ret,
            helper: RuntimeHelper::HandleBreakAndReturnsInLambda,
            args: vec![exc.into()],
        });
        self.emit(Instr::ReturnOrRethrowSavedExc { value: ret.into() });
        self.emit(Instr::Label { label: r_end });
    }

    /// Wrap a method body that lexically contains blocks with `return`:
    /// their unwinds are fielded here and turned into this frame's return.
    pub(crate) fn handle_nonlocal_return_in_method(&mut self) {
        let r_begin = self.new_label();
        let r_end = self.new_label();
        let geb_label = self.new_label();
        self.add_instr_at_beginning(Instr::ExceptionRegionStart { rescuer: geb_label });
        self.add_instr_at_beginning(Instr::Label { label: r_begin });
        self.emit(Instr::ExceptionRegionEnd);
        self.emit(Instr::Label { label: geb_label });
        let exc = self.temp_var();
        let ret = self.temp_var();
        self.emit(Instr::ReceiveUnwindException { dst: exc });
        self.emit(Instr::RuntimeHelperCall {
            dst: ret,
            helper: RuntimeHelper::HandleNonlocalReturn,
            args: vec![exc.into()],
        });
        self.emit(Instr::Return { value: ret.into() });
        self.emit(Instr::Label { label: r_end });
    }

    // ---- dispatch -----------------------------------------------------

    pub(crate) fn build(&mut self, node: &Node) -> Result<Lowered, BuildError> {
        match node {
            Node::AtLine { line, newline, body } => {
                self.needs_line_number(*line, *newline);
                self.build(body)
            }
            Node::Statements(nodes) => self.build_sequence(nodes),

            Node::Nil => Ok(Lowered::Value(Operand::Nil)),
            Node::True => Ok(Lowered::Value(Operand::True)),
            Node::False => Ok(Lowered::Value(Operand::False)),
            Node::SelfNode => Ok(Lowered::Value(Operand::SelfObj)),
            Node::Fixnum(n) => Ok(Lowered::Value(Operand::Fixnum(*n))),
            Node::Float(f) => Ok(Lowered::Value(Operand::Float(*f))),
            Node::Str { value, frozen } => Ok(Lowered::Value(if *frozen {
                Operand::FrozenString(value.clone())
            } else {
                Operand::MutableString(value.clone())
            })),
            Node::SymLit(name) => Ok(Lowered::Value(Operand::Symbol(self.manager.intern(name)))),
            Node::EncodingRef(encoding) => {
                let dst = self.temp_var();
                self.emit(Instr::GetEncoding { dst, encoding: *encoding });
                Ok(Lowered::Value(dst.into()))
            }
            Node::NthRef(n) => {
                let dst = self.copy(None, Operand::NthRef(*n));
                Ok(Lowered::Value(dst.into()))
            }
            Node::Splat(inner) => {
                let v = self.build(inner)?.operand();
                Ok(Lowered::Value(Operand::Splat(Box::new(v))))
            }

            Node::DStr { pieces, encoding, frozen, line } => {
                self.build_dstr(None, pieces, *encoding, *frozen, *line)
            }
            Node::DSym { pieces, encoding, line } => self.build_dsym(pieces, *encoding, *line),
            Node::DRegexp { pieces, options, line } => self.build_dregexp(pieces, *options, *line),
            Node::DXStr { pieces, encoding, line } => self.build_dxstr(pieces, *encoding, *line),
            Node::RangeLit { begin, end, exclusive } => self.build_range(begin, end, *exclusive),
            Node::RationalLit { numerator, denominator } => {
                self.build_rational(numerator, denominator)
            }
            Node::HashLit { pairs, .. } => self.build_hash(pairs),

            Node::LocalVar { name, depth } => {
                Ok(Lowered::Value(self.local(name, *depth).into()))
            }
            Node::LocalAsgn { name, depth, value } => self.build_local_asgn(name, *depth, value),
            Node::InstVar { name } => self.build_inst_var(name),
            Node::InstAsgn { name, value } => self.build_inst_asgn(name, value),
            Node::GlobalVar { name } => self.build_global_var(name),
            Node::GlobalAsgn { name, value } => self.build_global_asgn(name, value),
            Node::ClassVar { name } => self.build_class_var(name),
            Node::ClassVarAsgn { name, value } => self.build_class_var_asgn(name, value, false),
            Node::ClassVarDecl { name, value } => self.build_class_var_asgn(name, value, true),
            Node::ConstRef { name } => self.build_const_ref(name),
            Node::ConstAsgn { name, value } => self.build_const_asgn(name, value),

            Node::And { left, right } => self.build_and(left, right),
            Node::Or { left, right } => self.build_or(left, right),
            Node::Not { value } => self.build_not(value),
            Node::OpAsgnOr { first, second } => self.build_op_asgn_or(first, second),
            Node::OpAsgnAnd { first, second } => self.build_op_asgn_and(first, second),
            Node::Defined { expr } => self.build_defined(expr),

            Node::If { predicate, then_body, else_body } => {
                self.build_conditional(None, predicate, then_body.as_deref(), else_body.as_deref())
            }
            Node::Case { predicate, arms, else_body, line } => {
                self.build_case(predicate.as_deref(), arms, else_body.as_deref(), *line)
            }
            Node::ConditionalLoop { condition, body, is_while, eval_condition_first } => self
                .build_conditional_loop(condition, body.as_deref(), *is_while, *eval_condition_first),
            Node::BreakNode { value, line } => self.build_break(value.as_deref(), *line),
            Node::NextNode { value, line } => self.build_next(value.as_deref(), *line),
            Node::RedoNode { line } => self.build_redo(*line),
            Node::RetryNode { line } => self.build_retry(*line),
            Node::ReturnNode { value, line } => self.build_return(value.as_deref(), *line),
            Node::Begin { body, rescue, else_body, ensure, is_modifier } => self.build_begin(
                body.as_deref(),
                rescue.as_deref(),
                else_body.as_deref(),
                ensure.as_deref(),
                *is_modifier,
            ),

            Node::Call { receiver, name, args, iter, line, newline } => {
                self.build_call(None, receiver, name, args, iter.as_deref(), *line, *newline)
            }
            Node::FCall { name, args, iter, line, newline } => {
                self.build_fcall(None, name, args, iter.as_deref(), *line, *newline)
            }
            Node::AttrAsgn { receiver, name, args, line } => {
                self.build_attr_asgn(receiver, name, args, *line)
            }
            Node::YieldNode { args } => self.build_yield(args),
            Node::SuperNode { args, iter, line, newline } => {
                self.build_super(args, iter.as_deref(), *line, *newline)
            }
            Node::ZSuperNode { iter, line } => self.build_zsuper(iter.as_deref(), *line),
            Node::BlockPass { value } => self.build(value),

            Node::Iter { line, .. } => {
                self.syntax_error(*line, "block given without a call to receive it")
            }
            Node::LambdaNode { args, body, line, end_line } => {
                self.build_lambda(args, body.as_deref(), *line, *end_line)
            }
            Node::ForNode { iterable, variable, body, line, end_line } => {
                self.build_for(iterable, variable, body.as_deref(), *line, *end_line)
            }
            Node::Def { name, receiver, args, body, line, end_line } => {
                self.build_def(name, receiver.as_deref(), args, body.as_deref(), *line, *end_line)
            }
            Node::ClassNode { name, container, superclass, body, line, end_line } => self
                .build_class(
                    name,
                    container.as_deref(),
                    superclass.as_deref(),
                    body.as_deref(),
                    *line,
                    *end_line,
                ),
            Node::ModuleNode { name, container, body, line, end_line } => {
                self.build_module(name, container.as_deref(), body.as_deref(), *line, *end_line)
            }
            Node::SClass { receiver, body, line, end_line } => {
                self.build_sclass(receiver, body.as_deref(), *line, *end_line)
            }
            Node::PreExe { body } => self.build_pre_exe(body.as_deref()),
            Node::PostExe { body, line } => self.build_post_exe(body.as_deref(), *line),

            Node::AliasNode { new_name, old_name } => self.build_alias(new_name, old_name),
            Node::VAlias { new_name, old_name } => self.build_valias(new_name, old_name),
            Node::Undef { name } => self.build_undef(name),
            Node::FlipFlop { line } => self.build_flip(*line),
        }
    }

    fn build_sequence(&mut self, nodes: &[Node]) -> Result<Lowered, BuildError> {
        let mut result = Lowered::Value(Operand::Nil);
        for node in nodes {
            result = self.build(node)?;
            if result.is_terminated() {
                return Ok(Lowered::Terminated);
            }
        }
        Ok(result)
    }

    /// Build an expression whose value must reflect evaluation order
    /// relative to its siblings. Mutable values get pinned to a
    /// temporary; frozen literals are safe to use in place.
    pub(crate) fn build_with_order(
        &mut self,
        node: &Node,
        preserve_order: bool,
    ) -> Result<Operand, BuildError> {
        let value = self.build(node)?.operand();
        if preserve_order && !value.is_immutable_literal() {
            Ok(Operand::Var(self.value_in_temp(value)))
        } else {
            Ok(value)
        }
    }
}
