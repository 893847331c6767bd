//! Protected regions: begin/rescue/ensure, the ensure replay machinery,
//! and the internal catch-all wrapper used by `defined?`.
//!
//! An ensure body is built exactly once, into a side buffer, before the
//! code it protects. Every jump that leaves the region replays a clone
//! of that buffer with fresh labels; the exceptional path emits the
//! buffered instructions verbatim under a dummy rescuer that rethrows.

use std::collections::HashMap;

use rubra_ir::{BuiltinClass, Instr, Label, Operand, Variable};

use crate::ast::{Node, RescueClause};
use crate::BuildError;

use super::{Builder, EnsureBlockInfo, Lowered, RescueBlockInfo};

impl<'a> Builder<'a> {
    pub(crate) fn build_begin(
        &mut self,
        body: Option<&Node>,
        rescue: Option<&RescueClause>,
        else_body: Option<&Node>,
        ensure: Option<&Node>,
        is_modifier: bool,
    ) -> Result<Lowered, BuildError> {
        if rescue.is_none() && ensure.is_none() {
            // else without rescue is valid syntax; its body runs after the
            // main body and supplies the value.
            let mut rv = match body {
                Some(body) => self.build(body)?,
                None => Lowered::Value(Operand::Nil),
            };
            if let Some(else_body) = else_body {
                if !rv.is_terminated() {
                    rv = self.build(else_body)?;
                }
            }
            return Ok(rv);
        }
        self.build_ensure_internal(body, rescue, else_body, ensure, is_modifier)
    }

    fn build_ensure_internal(
        &mut self,
        body: Option<&Node>,
        rescue: Option<&RescueClause>,
        else_body: Option<&Node>,
        ensure_node: Option<&Node>,
        is_modifier: bool,
    ) -> Result<Lowered, BuildError> {
        let is_rescue = rescue.is_some();

        let saved = self.temp_var();
        self.emit(Instr::GetGlobalVariable { dst: saved, name: self.manager.intern("$!") });

        let region_start = self.new_label();
        let end_label = self.new_label();
        let dummy_rescue = self.new_label();
        let rescuer = self.active_rescuers.last().copied().unwrap_or(Label::UNRESCUED_REGION);
        let mut ebi = EnsureBlockInfo::new(
            region_start,
            end_label,
            dummy_rescue,
            self.loop_stack.len().checked_sub(1),
            rescuer,
        );
        if ensure_node.is_some() {
            ebi.saved_global_exception = Some(saved);
        }

        // The ensure body is built first, into a buffer, so break/next/
        // return sites inside the protected body can replay it.
        self.ensure_build_stack.push(ebi);
        let ensure_ret = match ensure_node {
            Some(node) => self.build(node),
            None => Ok(Lowered::Value(Operand::Nil)),
        };
        let ebi = match self.ensure_build_stack.pop() {
            Some(ebi) => ebi,
            None => unreachable!("ensure build stack underflow"),
        };
        let ensure_ret = ensure_ret?;

        self.ensure_stack.push(ebi);
        let ebi_index = self.ensure_stack.len() - 1;

        self.emit(Instr::Label { label: region_start });
        self.emit(Instr::ExceptionRegionStart { rescuer: dummy_rescue });
        self.active_rescuers.push(dummy_rescue);

        let ensure_expr_value = self.temp_var();
        let protected = if let Some(clause) = rescue {
            self.build_rescue_internal(body, else_body, clause, is_modifier, ebi_index, saved)
        } else {
            match body {
                Some(body) => self.build(body),
                None => Ok(Lowered::Value(Operand::Nil)),
            }
        };
        let rv = match protected {
            Ok(rv) => rv,
            Err(err) => {
                self.active_rescuers.pop();
                self.ensure_stack.pop();
                return Err(err);
            }
        };

        self.emit(Instr::ExceptionRegionEnd);
        self.active_rescuers.pop();

        // begin..ensure..end used as an expression: pin the body value,
        // run a clone of the ensure code, and skip the rethrow path. The
        // rescue variant already did this per exit.
        let is_ensure_expr = ensure_node.is_some() && !rv.is_terminated() && !is_rescue;
        if is_ensure_expr {
            let value = rv.clone().operand();
            self.emit(Instr::Copy { dst: ensure_expr_value, src: value });
            self.clone_ensure_into_host(ebi_index);
            self.emit(Instr::Jump { target: end_label });
        }

        let ebi = match self.ensure_stack.pop() {
            Some(ebi) => ebi,
            None => unreachable!("ensure stack underflow"),
        };

        // Exceptional path: run the buffered ensure body under its own
        // labels, then rethrow whatever unwound us here.
        let exc = self.temp_var();
        self.emit(Instr::Label { label: dummy_rescue });
        self.emit(Instr::ReceiveUnwindException { dst: exc });
        if ensure_node.is_some() {
            for instr in ebi.instrs {
                self.emit(instr);
            }
        }
        self.emit(Instr::ThrowException { exception: exc.into() });
        self.emit(Instr::Label { label: end_label });

        // An explicit return inside the ensure body supersedes the
        // protected body's value.
        let rv = if ensure_ret.is_terminated() { Lowered::Terminated } else { rv };
        Ok(if is_ensure_expr { Lowered::Value(ensure_expr_value.into()) } else { rv })
    }

    fn build_rescue_internal(
        &mut self,
        body: Option<&Node>,
        else_body: Option<&Node>,
        clause: &RescueClause,
        is_modifier: bool,
        ebi_index: usize,
        saved_exception: Variable,
    ) -> Result<Lowered, BuildError> {
        let needs_backtrace = !self.can_backtrace_be_removed(clause, else_body, is_modifier);
        self.ensure_stack[ebi_index].needs_backtrace = needs_backtrace;
        let end_label = self.ensure_stack[ebi_index].end;
        let body_start = self.new_label();
        let rescue_label = self.new_label();

        // retry re-enters at body_start, re-opening the region.
        self.emit(Instr::Label { label: body_start });
        self.emit(Instr::ExceptionRegionStart { rescuer: rescue_label });
        self.active_rescuers.push(rescue_label);
        if !needs_backtrace {
            self.emit(Instr::ToggleBacktrace { required: false });
        }

        let rv = self.temp_var();
        let body_value = match body {
            Some(body) => self.build(body),
            None => Ok(Lowered::Value(Operand::Nil)),
        };
        let tmp = match body_value {
            Ok(value) => value,
            Err(err) => {
                self.active_rescuers.pop();
                return Err(err);
            }
        };

        // Pushed only after the body is built: a retry inside a nested
        // rescue has to re-enter that nested rescue, not this one.
        self.rescue_stack
            .push(RescueBlockInfo { entry_label: body_start, saved_exception });

        self.emit(Instr::ExceptionRegionEnd);
        self.active_rescuers.pop();

        let handler = self.build_rescue_handler(
            clause,
            else_body,
            tmp,
            rv,
            ebi_index,
            end_label,
            rescue_label,
            needs_backtrace,
        );
        self.rescue_stack.pop();
        handler?;
        Ok(Lowered::Value(rv.into()))
    }

    fn build_rescue_handler(
        &mut self,
        clause: &RescueClause,
        else_body: Option<&Node>,
        mut tmp: Lowered,
        rv: Variable,
        ebi_index: usize,
        end_label: Label,
        rescue_label: Label,
        needs_backtrace: bool,
    ) -> Result<(), BuildError> {
        if let Some(else_body) = else_body {
            tmp = self.build(else_body)?;
        }

        if !tmp.is_terminated() {
            let value = tmp.operand();
            self.emit(Instr::Copy { dst: rv, src: value });
            self.clone_ensure_into_host(ebi_index);
            self.emit(Instr::Jump { target: end_label });
        }
        // A terminated body already replayed its ensures on the way out,
        // and rv is only read on paths that assign it.

        self.emit(Instr::Label { label: rescue_label });
        if !needs_backtrace {
            self.emit(Instr::ToggleBacktrace { required: true });
        }
        let exc = self.temp_var();
        self.emit(Instr::ReceiveRubyException { dst: exc });
        self.build_rescue_body(clause, rv, exc, end_label)
    }

    fn build_rescue_body(
        &mut self,
        clause: &RescueClause,
        rv: Variable,
        exc: Variable,
        end_label: Label,
    ) -> Result<(), BuildError> {
        let caught = self.new_label();

        if clause.exceptions.is_empty() {
            self.output_exception_check(
                Operand::BuiltinClass(BuiltinClass::StandardError),
                exc.into(),
                caught,
            );
        } else {
            for exception in &clause.exceptions {
                let exc_type = self.build(exception)?.operand();
                self.output_exception_check(exc_type, exc.into(), caught);
            }
        }

        // Nothing matched here: try the next clause, or rethrow.
        match &clause.next_clause {
            Some(next) => self.build_rescue_body(next, rv, exc, end_label)?,
            None => self.emit(Instr::ThrowException { exception: exc.into() }),
        }

        self.emit(Instr::Label { label: caught });
        if let Some(reference) = &clause.reference {
            self.build_assignment(reference, exc, clause.line)?;
        }
        let body = match &clause.body {
            Some(body) => self.build(body)?,
            None => Lowered::Value(Operand::Nil),
        };
        if !body.is_terminated() {
            let value = body.operand();
            self.emit(Instr::Copy { dst: rv, src: value });
            let top = self.ensure_stack.len() - 1;
            self.clone_ensure_into_host(top);
            self.emit(Instr::Jump { target: end_label });
        }
        Ok(())
    }

    /// Backtrace capture can be skipped for `x rescue y` shapes whose
    /// handler neither raises nor looks at `$!`.
    fn can_backtrace_be_removed(
        &self,
        clause: &RescueClause,
        else_body: Option<&Node>,
        is_modifier: bool,
    ) -> bool {
        if self.options.full_trace
            || (!is_modifier && else_body.is_some())
            || clause.next_clause.is_some()
            || !clause.exceptions.is_empty()
        {
            return false;
        }
        match &clause.body {
            Some(body) => body.is_side_effect_free() && !body.refers_to_error_info(),
            None => true,
        }
    }

    /// Assign an exception reference or iteration variable target.
    pub(crate) fn build_assignment(
        &mut self,
        target: &Node,
        value: Variable,
        line: u32,
    ) -> Result<(), BuildError> {
        match target.unwrap_lines() {
            Node::LocalVar { name, depth } => {
                let dst = self.local(name, *depth);
                self.emit(Instr::Copy { dst, src: value.into() });
            }
            Node::InstVar { name } => {
                self.emit(Instr::PutField {
                    receiver: Operand::SelfObj,
                    name: self.manager.intern(name),
                    value: value.into(),
                });
            }
            Node::GlobalVar { name } => {
                self.emit(Instr::PutGlobalVariable {
                    name: self.manager.intern(name),
                    value: value.into(),
                });
            }
            Node::ClassVar { name } => {
                let container = self.class_var_container(false);
                self.emit(Instr::PutClassVariable {
                    container,
                    name: self.manager.intern(name),
                    value: value.into(),
                });
            }
            Node::ConstRef { name } => {
                let module = self.find_container_module();
                self.emit(Instr::PutConst {
                    module,
                    name: self.manager.intern(name),
                    value: value.into(),
                });
            }
            _ => return self.syntax_error(line, "unsupported assignment target"),
        }
        Ok(())
    }

    // ---- ensure replay ------------------------------------------------

    /// Replay ensure bodies for a jump leaving their regions, innermost
    /// first. A loop target stops the walk at the first region created
    /// outside that loop; `None` replays everything (method return).
    pub(crate) fn emit_ensure_blocks(&mut self, target_loop: Option<usize>) {
        for index in (0..self.ensure_stack.len()).rev() {
            if target_loop.is_some() && self.ensure_stack[index].innermost_loop != target_loop {
                break;
            }
            self.clone_ensure_into_host(index);
        }
    }

    /// Emit one replay of an ensure body at the current point: restore
    /// `$!`, then the buffered instructions with fresh labels, wrapped in
    /// a region under whatever rescuer is active here.
    pub(crate) fn clone_ensure_into_host(&mut self, index: usize) {
        let (template, saved) = {
            let ebi = &self.ensure_stack[index];
            (ebi.instrs.clone(), ebi.saved_global_exception)
        };
        if let Some(saved) = saved {
            self.emit(Instr::PutGlobalVariable {
                name: self.manager.intern("$!"),
                value: saved.into(),
            });
        }
        if template.is_empty() {
            return;
        }

        let mut renames: HashMap<Label, Label> = HashMap::new();
        for instr in &template {
            if let Instr::Label { label } = instr {
                renames.insert(*label, self.new_label());
            }
        }
        let rescuer = self.active_rescuers.last().copied().unwrap_or(Label::UNRESCUED_REGION);
        self.emit(Instr::ExceptionRegionStart { rescuer });
        let rename = |label: Label| renames.get(&label).copied().unwrap_or(label);
        for instr in &template {
            let cloned = instr.with_renamed_labels(&rename);
            self.emit(cloned);
        }
        self.emit(Instr::ExceptionRegionEnd);
    }

    // ---- internal catch-all -------------------------------------------

    /// Run `protected` under a rescuer that catches any Ruby `Exception`
    /// and runs `rescue_body` instead; non-Exception unwinds rethrow.
    /// A `Some` result from the rescue body replaces the region's value.
    pub(crate) fn protect_code_with_rescue(
        &mut self,
        protected: impl FnOnce(&mut Self) -> Result<Operand, BuildError>,
        rescue_body: impl FnOnce(&mut Self) -> Result<Option<Operand>, BuildError>,
    ) -> Result<Operand, BuildError> {
        let rv = self.temp_var();
        let r_begin = self.new_label();
        let r_end = self.new_label();
        let rescue_label = self.new_label();

        self.emit(Instr::Label { label: r_begin });
        self.emit(Instr::ExceptionRegionStart { rescuer: rescue_label });
        let value = protected(self)?;
        self.emit(Instr::Copy { dst: rv, src: value });
        self.emit(Instr::Jump { target: r_end });
        self.emit(Instr::ExceptionRegionEnd);

        let caught = self.new_label();
        self.emit(Instr::Label { label: rescue_label });
        let exc = self.temp_var();
        self.emit(Instr::ReceiveRubyException { dst: exc });
        let exc_type = self.temp_var();
        self.emit(Instr::InheritanceSearchConst {
            dst: exc_type,
            module: Operand::BuiltinClass(BuiltinClass::Object),
            name: self.manager.intern("Exception"),
        });
        self.output_exception_check(exc_type.into(), exc.into(), caught);
        self.emit(Instr::ThrowException { exception: exc.into() });

        self.emit(Instr::Label { label: caught });
        if let Some(value) = rescue_body(self)? {
            self.emit(Instr::Copy { dst: rv, src: value });
        }
        self.emit(Instr::Label { label: r_end });
        Ok(rv.into())
    }

    pub(crate) fn output_exception_check(
        &mut self,
        exc_type: Operand,
        exc_obj: Operand,
        caught: Label,
    ) {
        let dst = self.temp_var();
        self.emit(Instr::RescueEqq { dst, exc_type, exc_obj });
        let value: Operand = dst.into();
        self.create_branch(&value, &Operand::True, caught);
    }
}
