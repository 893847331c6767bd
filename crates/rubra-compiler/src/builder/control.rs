//! Conditionals, case dispatch, loops, and the jump keywords.
//!
//! break/next/redo/retry/return legality depends on scope flavour, and
//! any of them leaving a protected region must replay the pending ensure
//! bodies before transferring control.

use std::collections::HashSet;

use rubra_ir::{Instr, IrException, Label, Operand, RubyEvent, ScopeFlags, ScopeKind, Variable};

use crate::ast::{Node, WhenArm, WhenLiteral};
use crate::builder::{Builder, LoopInfo, Lowered};
use crate::BuildError;

impl<'a> Builder<'a> {
    pub(crate) fn build_conditional(
        &mut self,
        result: Option<Variable>,
        predicate: &Node,
        then_body: Option<&Node>,
        else_body: Option<&Node>,
    ) -> Result<Lowered, BuildError> {
        if predicate.always_true() {
            return match then_body {
                Some(body) => self.build(body),
                None => Ok(Lowered::Value(Operand::Nil)),
            };
        }
        if predicate.always_false() {
            return match else_body {
                Some(body) => self.build(body),
                None => Ok(Lowered::Value(Operand::Nil)),
            };
        }

        let false_label = self.new_label();
        let done_label = self.new_label();
        let result = result.unwrap_or_else(|| self.temp_var());

        let condition = self.build(predicate)?.operand();
        self.create_branch(&condition, &Operand::False, false_label);

        let then_result = match then_body {
            Some(body) => self.build(body)?,
            None => Lowered::Value(Operand::Nil),
        };
        let then_terminated = then_result.is_terminated();
        if !then_terminated {
            let v = then_result.operand();
            self.emit(Instr::Copy { dst: result, src: v });
            self.emit(Instr::Jump { target: done_label });
        }

        self.emit(Instr::Label { label: false_label });
        let else_result = match else_body {
            Some(body) => self.build(body)?,
            None => Lowered::Value(Operand::Nil),
        };
        let else_terminated = else_result.is_terminated();
        if !else_terminated {
            let v = else_result.operand();
            self.emit(Instr::Copy { dst: result, src: v });
        }

        self.emit(Instr::Label { label: done_label });
        if then_terminated && else_terminated {
            Ok(Lowered::Terminated)
        } else {
            Ok(Lowered::Value(result.into()))
        }
    }

    pub(crate) fn build_case(
        &mut self,
        predicate: Option<&Node>,
        arms: &[WhenArm],
        else_body: Option<&Node>,
        _line: u32,
    ) -> Result<Lowered, BuildError> {
        // A case with no subject dispatches on arm truthiness; the
        // undefined sentinel tells eqq to test the expression alone.
        let test = match predicate {
            None => Operand::Undefined,
            Some(p) => match p.unwrap_lines() {
                Node::Str { value, .. } => Operand::FrozenString(value.clone()),
                _ => self.build_with_order(p, true)?,
            },
        };

        let else_label = self.new_label();
        let end_label = self.new_label();
        let result = self.temp_var();
        let mut seen_literals: HashSet<WhenLiteral> = HashSet::new();
        let mut bodies: Vec<(Label, Option<&Node>)> = Vec::with_capacity(arms.len() + 1);

        for arm in arms {
            let body_label = self.new_label();
            for value in &arm.values {
                if let Some(literal) = value.when_literal() {
                    if !seen_literals.insert(literal) {
                        self.manager
                            .warn(&self.file, arm.line, "duplicated when clause is ignored");
                        // Only the first occurrence gets a match test; the
                        // arm body stays reachable through its other values.
                        continue;
                    }
                }
                let (expression, needs_splat) = match value.unwrap_lines() {
                    Node::Splat(inner) => (self.build_with_order(inner, true)?, true),
                    _ => (self.build_with_order(value, true)?, false),
                };
                let eqq = self.temp_var();
                self.emit(Instr::Eqq {
                    dst: eqq,
                    expression,
                    test: test.clone(),
                    needs_splat,
                });
                self.create_branch(&eqq.into(), &Operand::True, body_label);
            }
            bodies.push((body_label, arm.body.as_ref()));
        }
        self.emit(Instr::Jump { target: else_label });
        bodies.push((else_label, else_body));

        let last = bodies.len() - 1;
        for (i, (label, body)) in bodies.into_iter().enumerate() {
            self.emit(Instr::Label { label });
            let value = match body {
                Some(body) => self.build(body)?,
                None => Lowered::Value(Operand::Nil),
            };
            if !value.is_terminated() {
                let v = value.operand();
                self.emit(Instr::Copy { dst: result, src: v });
                if i != last {
                    self.emit(Instr::Jump { target: end_label });
                }
            }
        }
        self.emit(Instr::Label { label: end_label });
        Ok(Lowered::Value(result.into()))
    }

    pub(crate) fn build_conditional_loop(
        &mut self,
        condition: &Node,
        body: Option<&Node>,
        is_while: bool,
        eval_condition_first: bool,
    ) -> Result<Lowered, BuildError> {
        self.manager.set_flag(self.scope, ScopeFlags::HAS_LOOPS);

        // A head-tested loop whose condition statically excludes the body
        // reduces to evaluating the condition.
        if eval_condition_first
            && ((is_while && condition.always_false()) || (!is_while && condition.always_true()))
        {
            self.build(condition)?;
            return Ok(Lowered::Value(Operand::Nil));
        }

        let loop_start = self.new_label();
        let loop_end = self.new_label();
        let iter_start = self.new_label();
        let iter_end = self.new_label();
        let setup_result = self.new_label();
        let result = self.temp_var();
        let info = LoopInfo { loop_start, iter_start, iter_end, loop_end, result };
        self.loop_stack.push(info);
        let built =
            self.build_loop_inner(condition, body, is_while, eval_condition_first, info, setup_result);
        self.loop_stack.pop();
        built?;
        Ok(Lowered::Value(result.into()))
    }

    fn build_loop_inner(
        &mut self,
        condition: &Node,
        body: Option<&Node>,
        is_while: bool,
        eval_condition_first: bool,
        info: LoopInfo,
        setup_result: Label,
    ) -> Result<(), BuildError> {
        self.emit(Instr::Label { label: info.loop_start });
        if eval_condition_first {
            let cv = self.build(condition)?.operand();
            let exit_test = if is_while { Operand::False } else { Operand::True };
            self.create_branch(&cv, &exit_test, setup_result);
        }

        // redo re-enters here
        self.emit(Instr::Label { label: info.iter_start });
        self.emit(Instr::ThreadPoll { on_back_edge: true });
        if let Some(body) = body {
            self.build(body)?;
        }

        // next lands here
        self.emit(Instr::Label { label: info.iter_end });
        if eval_condition_first {
            self.emit(Instr::Jump { target: info.loop_start });
        } else {
            let cv = self.build(condition)?.operand();
            let repeat_test = if is_while { Operand::True } else { Operand::False };
            self.create_branch(&cv, &repeat_test, info.loop_start);
        }

        self.emit(Instr::Label { label: setup_result });
        self.emit(Instr::Copy { dst: info.result, src: Operand::Nil });
        // breaks land here, skipping the nil setup above
        self.emit(Instr::Label { label: info.loop_end });
        Ok(())
    }

    pub(crate) fn build_break(
        &mut self,
        value: Option<&Node>,
        line: u32,
    ) -> Result<Lowered, BuildError> {
        if let Some(current_loop) = self.loop_stack.last().copied() {
            let target = self.loop_stack.len() - 1;
            self.emit_ensure_blocks(Some(target));
            let v = match value {
                Some(node) => self.build(node)?.operand(),
                None => Operand::Nil,
            };
            self.emit(Instr::Copy { dst: current_loop.result, src: v });
            self.emit(Instr::Jump { target: current_loop.loop_end });
        } else if self.manager.kind(self.scope).is_closure_like() {
            if self.manager.kind(self.scope) == ScopeKind::Eval {
                return self.syntax_error(line, "Can't escape from eval with break");
            }
            let return_scope = match self.manager.lexical_parent(self.scope) {
                Some(parent) => parent,
                None => return self.syntax_error(line, "Invalid break"),
            };
            let v = match value {
                Some(node) => self.build(node)?.operand(),
                None => Operand::Nil,
            };
            self.emit(Instr::Break { value: v, scope: return_scope });
        } else {
            return self.syntax_error(line, "Invalid break");
        }
        Ok(Lowered::Terminated)
    }

    pub(crate) fn build_next(
        &mut self,
        value: Option<&Node>,
        line: u32,
    ) -> Result<Lowered, BuildError> {
        let v = match value {
            Some(node) => self.build(node)?.operand(),
            None => Operand::Nil,
        };
        let current_loop = self.loop_stack.last().copied();
        if !self.ensure_stack.is_empty() {
            self.emit_ensure_blocks(current_loop.map(|_| self.loop_stack.len() - 1));
        }
        if let Some(current_loop) = current_loop {
            self.emit(Instr::Jump { target: current_loop.iter_end });
        } else {
            self.emit(Instr::ThreadPoll { on_back_edge: true });
            let kind = self.manager.kind(self.scope);
            if kind.is_closure_like() {
                if kind == ScopeKind::Eval {
                    return self.syntax_error(line, "Can't escape from eval with next");
                }
                self.emit(Instr::Return { value: v });
            } else {
                return self.syntax_error(line, "Invalid next");
            }
        }
        Ok(Lowered::Terminated)
    }

    pub(crate) fn build_redo(&mut self, line: u32) -> Result<Lowered, BuildError> {
        if !self.ensure_stack.is_empty() {
            let target = if self.loop_stack.is_empty() {
                None
            } else {
                Some(self.loop_stack.len() - 1)
            };
            self.emit_ensure_blocks(target);
        }
        if let Some(current_loop) = self.loop_stack.last().copied() {
            self.emit(Instr::Jump { target: current_loop.iter_start });
        } else {
            let kind = self.manager.kind(self.scope);
            if kind.is_closure_like() {
                if kind == ScopeKind::Eval {
                    return self.syntax_error(line, "Can't escape from eval with redo");
                }
                self.emit(Instr::ThreadPoll { on_back_edge: true });
                let start_label = self.new_label();
                // Spliced directly: the re-entry point must sit between
                // the prologue and the first body instruction.
                self.instructions
                    .insert(self.after_prologue_index, Instr::Label { label: start_label });
                self.emit(Instr::Jump { target: start_label });
            } else {
                return self.syntax_error(line, "Invalid redo");
            }
        }
        Ok(Lowered::Value(Operand::Nil))
    }

    pub(crate) fn build_retry(&mut self, line: u32) -> Result<Lowered, BuildError> {
        let rescue = match self.rescue_stack.last().copied() {
            Some(rescue) => rescue,
            None => return self.syntax_error(line, "Invalid retry"),
        };
        self.emit(Instr::ThreadPoll { on_back_edge: true });
        // Restore $! to the value it had when the rescue was entered,
        // then loop back to re-run the protected body.
        self.emit(Instr::PutGlobalVariable {
            name: self.manager.intern("$!"),
            value: rescue.saved_exception.into(),
        });
        self.emit(Instr::Jump { target: rescue.entry_label });
        self.manager.set_flag(self.scope, ScopeFlags::HAS_LOOPS);
        Ok(Lowered::Value(Operand::Nil))
    }

    pub(crate) fn build_return(
        &mut self,
        value: Option<&Node>,
        line: u32,
    ) -> Result<Lowered, BuildError> {
        let mut ret_val = match value {
            Some(node) => self.build(node)?.operand(),
            None => Operand::Nil,
        };

        let kind = self.manager.kind(self.scope);
        if kind.is_method() || kind == ScopeKind::Script {
            ret_val = self.process_ensure_rescue_blocks(ret_val);
            if self.options.full_trace && kind.is_method() {
                self.emit(Instr::Trace {
                    event: RubyEvent::Return,
                    name: Some(self.manager.scope_name(self.scope)),
                    file: self.file.clone(),
                    line,
                });
            }
            self.emit(Instr::Return { value: ret_val });
        } else if kind.is_closure_like() {
            if self.in_end_block {
                // No frame to return to once the program body is done.
                self.emit(Instr::ThrowException {
                    exception: Operand::IrException(IrException::ReturnLocalJumpError),
                });
            } else {
                if kind == ScopeKind::Closure {
                    let defined_within_method = self.manager.nearest_method(self.scope).is_some();
                    self.emit(Instr::CheckForLJE { defined_within_method });
                }
                if let Some(rescue) = self.rescue_stack.last().copied() {
                    self.emit(Instr::PutGlobalVariable {
                        name: self.manager.intern("$!"),
                        value: rescue.saved_exception.into(),
                    });
                }
                let method_name = self
                    .manager
                    .nearest_method(self.scope)
                    .map(|m| self.manager.scope_name(m));
                self.emit(Instr::NonlocalReturn { value: ret_val, method_name });
            }
        } else {
            // Module/class body: returns unwind to the defining method,
            // or fail at runtime when there is none.
            match self.manager.nearest_method(self.scope) {
                Some(method) => {
                    let method_name = Some(self.manager.scope_name(method));
                    self.emit(Instr::NonlocalReturn { value: ret_val, method_name });
                }
                None => self.emit(Instr::ThrowException {
                    exception: Operand::IrException(IrException::ReturnLocalJumpError),
                }),
            }
        }
        Ok(Lowered::Terminated)
    }

    /// Pin the return value and replay every active ensure body before a
    /// plain return leaves the scope.
    pub(crate) fn process_ensure_rescue_blocks(&mut self, ret_val: Operand) -> Operand {
        if self.ensure_stack.is_empty() {
            return ret_val;
        }
        let pinned = self.copy(None, ret_val);
        self.emit_ensure_blocks(None);
        pinned.into()
    }
}
