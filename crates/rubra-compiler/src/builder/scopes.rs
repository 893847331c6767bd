//! Nested-scope construction: methods, class and module bodies, blocks,
//! lambdas, for-bodies, and BEGIN/END blocks.
//!
//! Each nested scope is built to completion by a child builder before
//! the parent emits the instruction that references it, so closure flags
//! are always final when the referencing call is lowered.

use rubra_ir::{
    ArgumentDescriptor, ArgumentKind, CallType, CoverageMode, Instr, InterpreterContext, Operand,
    RubyEvent, ScopeFlags, ScopeKind, Variable,
};

use crate::ast::{MethodArgs, Node};
use crate::BuildError;

use super::{Builder, Lowered};

impl<'a> Builder<'a> {
    // ---- prologues ----------------------------------------------------

    /// Frame setup for scopes that receive their own frame: self, and the
    /// implicit closure. Methods and metaclass bodies take the closure
    /// passed to the call; script, module, and eval bodies read it off
    /// the frame.
    pub(crate) fn prepare_implicit_state(&mut self) {
        self.emit(Instr::ReceiveSelf);
        let kind = self.manager.kind(self.scope);
        let dst = Variable::Temp(self.yield_closure_variable());
        if kind.is_method() || kind == ScopeKind::MetaClassBody {
            self.emit(Instr::LoadImplicitClosure { dst });
        } else {
            self.emit(Instr::LoadFrameClosure { dst });
        }
    }

    /// Closures only receive self up front; their implicit closure is
    /// preloaded at the end of the build, and only if something used it.
    pub(crate) fn prepare_closure_implicit_state(&mut self) {
        self.emit(Instr::ReceiveSelf);
    }

    pub(crate) fn add_current_module(&mut self) {
        let dst = Variable::Temp(self.current_module_variable());
        self.emit(Instr::Copy { dst, src: Operand::ScopeModule(0) });
    }

    fn preload_block_implicit_closure(&mut self) {
        if self.needs_yield_block.get() {
            let dst = Variable::Temp(self.yield_closure_variable());
            self.add_instr_at_beginning(Instr::LoadBlockImplicitClosure { dst });
        }
    }

    /// Where a constant assignment or class-variable walk lands: the
    /// nearest lexical module body by static depth, or the live current
    /// module when no module body encloses us.
    pub(crate) fn find_container_module(&mut self) -> Operand {
        match self.manager.nearest_module_referencing_depth(self.scope) {
            Some(depth) => Operand::ScopeModule(depth),
            None => Variable::Temp(self.current_module_variable()).into(),
        }
    }

    // ---- method definitions -------------------------------------------

    pub(crate) fn build_def(
        &mut self,
        name: &str,
        receiver: Option<&Node>,
        args: &MethodArgs,
        body: Option<&Node>,
        line: u32,
        end_line: u32,
    ) -> Result<Lowered, BuildError> {
        let name_sym = self.manager.intern(name);
        let instance_method = receiver.is_none();
        let method = self.manager.new_scope(
            ScopeKind::Method { instance_method },
            name_sym,
            &self.file,
            line,
            Some(self.scope),
        );
        let context = {
            let mut child = Builder::new(
                self.manager,
                self.options,
                method,
                self.dialect,
                self.coverage_mode,
                Some(&*self),
                None,
            );
            // Method bodies run arbitrarily often.
            child.executes_once = false;
            child.define_method_inner(args, body, line, end_line)?
        };
        self.manager.set_context(method, context);
        match receiver {
            None => self.emit(Instr::DefineInstanceMethod { method }),
            Some(node) => {
                let receiver = self.build(node)?.operand();
                self.emit(Instr::DefineClassMethod { receiver, method });
            }
        }
        Ok(Lowered::Value(Operand::Symbol(name_sym)))
    }

    pub(crate) fn define_method_inner(
        &mut self,
        args: &MethodArgs,
        body: Option<&Node>,
        line: u32,
        end_line: u32,
    ) -> Result<InterpreterContext, BuildError> {
        if self.options.full_trace {
            self.emit(Instr::LineNumber { line, coverage: CoverageMode::None });
            self.emit(Instr::Trace {
                event: RubyEvent::Call,
                name: Some(self.manager.scope_name(self.scope)),
                file: self.file.clone(),
                line,
            });
        }
        self.prepare_implicit_state();
        // The module reference is resolved against the defining scope,
        // one hop out from the method's own frame.
        let depth = self
            .manager
            .lexical_parent(self.scope)
            .and_then(|parent| self.manager.nearest_module_referencing_depth(parent))
            .unwrap_or(1);
        let dst = Variable::Temp(self.current_module_variable());
        self.emit(Instr::Copy { dst, src: Operand::ScopeModule(depth) });
        self.receive_method_args(args)?;
        self.after_prologue_index = self.instructions.len();

        let rv = match body {
            Some(body) => self.build(body)?,
            None => Lowered::Value(Operand::Nil),
        };
        if self.options.full_trace {
            self.emit(Instr::LineNumber { line: end_line, coverage: CoverageMode::None });
            self.emit(Instr::Trace {
                event: RubyEvent::Return,
                name: Some(self.manager.scope_name(self.scope)),
                file: self.file.clone(),
                line: end_line,
            });
        }
        if let Lowered::Value(value) = rv {
            self.emit(Instr::Return { value });
        }

        self.compute_flags();
        if self
            .manager
            .flags(self.scope)
            .contains(ScopeFlags::CAN_RECEIVE_NONLOCAL_RETURNS)
        {
            self.handle_nonlocal_return_in_method();
        }
        Ok(self.finish(1))
    }

    fn receive_method_args(&mut self, args: &MethodArgs) -> Result<(), BuildError> {
        let mut descriptors = Vec::new();
        let mut index = 0u32;

        for name in &args.pre {
            let dst = self.argument_result(name);
            self.emit(Instr::ReceiveArg { dst, index });
            index += 1;
            descriptors.push(ArgumentDescriptor {
                kind: ArgumentKind::Required,
                name: Some(self.manager.intern(name)),
            });
        }

        for (name, default) in &args.opt {
            let dst = self.argument_result(name);
            self.emit(Instr::ReceiveOptArg { dst, index });
            index += 1;
            let done = self.new_label();
            self.emit(Instr::BNE { target: done, value: dst.into(), test: Operand::Undefined });
            let value = self.build(default)?.operand();
            self.emit(Instr::Copy { dst, src: value });
            self.emit(Instr::Label { label: done });
            descriptors.push(ArgumentDescriptor {
                kind: ArgumentKind::Optional,
                name: Some(self.manager.intern(name)),
            });
        }

        if let Some(rest) = &args.rest {
            let dst = match rest {
                Some(name) => self.argument_result(name),
                None => self.temp_var(),
            };
            self.emit(Instr::ReceiveRestArg { dst, index });
            index += 1;
            descriptors.push(ArgumentDescriptor {
                kind: ArgumentKind::Rest,
                name: rest.as_deref().map(|name| self.manager.intern(name)),
            });
        }

        for (name, default) in &args.kwargs {
            let dst = self.argument_result(name);
            let key = self.manager.intern(name);
            self.emit(Instr::ReceiveKeywordArg { dst, key });
            let done = self.new_label();
            self.emit(Instr::BNE { target: done, value: dst.into(), test: Operand::Undefined });
            match default {
                Some(default) => {
                    let value = self.build(default)?.operand();
                    self.emit(Instr::Copy { dst, src: value });
                }
                None => {
                    self.add_raise_error("ArgumentError", &format!("missing keyword: :{name}"));
                }
            }
            self.emit(Instr::Label { label: done });
            descriptors.push(ArgumentDescriptor {
                kind: if default.is_some() {
                    ArgumentKind::Keyword
                } else {
                    ArgumentKind::KeywordRequired
                },
                name: Some(key),
            });
        }

        if let Some(kwrest) = &args.kwrest {
            let dst = match kwrest {
                Some(name) => self.argument_result(name),
                None => self.temp_var(),
            };
            self.emit(Instr::ReceiveKeywordRestArg { dst });
            descriptors.push(ArgumentDescriptor {
                kind: ArgumentKind::KeywordRest,
                name: kwrest.as_deref().map(|name| self.manager.intern(name)),
            });
        }

        if let Some(name) = &args.block {
            let dst = self.argument_result(name);
            let source = Variable::Temp(self.yield_closure_variable());
            self.emit(Instr::ReifyClosure { dst, source });
            descriptors.push(ArgumentDescriptor {
                kind: ArgumentKind::Block,
                name: Some(self.manager.intern(name)),
            });
        }

        self.manager.set_argument_descriptors(self.scope, descriptors);
        Ok(())
    }

    // ---- class, module, metaclass bodies ------------------------------

    pub(crate) fn build_class(
        &mut self,
        name: &str,
        container: Option<&Node>,
        superclass: Option<&Node>,
        body: Option<&Node>,
        line: u32,
        end_line: u32,
    ) -> Result<Lowered, BuildError> {
        let superclass = match superclass {
            Some(node) => self.build(node)?.operand(),
            None => Operand::Nil,
        };
        let container = match container {
            Some(node) => self.build(node)?.operand(),
            None => self.find_container_module(),
        };
        let name_sym = self.manager.intern(name);
        let body_scope = self.manager.new_scope(
            ScopeKind::ClassBody,
            name_sym,
            &self.file,
            line,
            Some(self.scope),
        );
        let dst = self.temp_var();
        self.emit(Instr::DefineClass { dst, body: body_scope, container, superclass });
        let context = {
            let mut child = Builder::new(
                self.manager,
                self.options,
                body_scope,
                self.dialect,
                self.coverage_mode,
                Some(&*self),
                None,
            );
            child.build_module_or_class_body(body, line, end_line)?
        };
        self.manager.set_context(body_scope, context);
        let result = self.temp_var();
        self.emit(Instr::ProcessModuleBody {
            dst: result,
            body: dst.into(),
            block: Operand::NullBlock,
        });
        Ok(Lowered::Value(result.into()))
    }

    pub(crate) fn build_module(
        &mut self,
        name: &str,
        container: Option<&Node>,
        body: Option<&Node>,
        line: u32,
        end_line: u32,
    ) -> Result<Lowered, BuildError> {
        let container = match container {
            Some(node) => self.build(node)?.operand(),
            None => self.find_container_module(),
        };
        let name_sym = self.manager.intern(name);
        let body_scope = self.manager.new_scope(
            ScopeKind::ModuleBody,
            name_sym,
            &self.file,
            line,
            Some(self.scope),
        );
        let dst = self.temp_var();
        self.emit(Instr::DefineModule { dst, body: body_scope, container });
        let context = {
            let mut child = Builder::new(
                self.manager,
                self.options,
                body_scope,
                self.dialect,
                self.coverage_mode,
                Some(&*self),
                None,
            );
            child.build_module_or_class_body(body, line, end_line)?
        };
        self.manager.set_context(body_scope, context);
        let result = self.temp_var();
        self.emit(Instr::ProcessModuleBody {
            dst: result,
            body: dst.into(),
            block: Operand::NullBlock,
        });
        Ok(Lowered::Value(result.into()))
    }

    pub(crate) fn build_sclass(
        &mut self,
        receiver: &Node,
        body: Option<&Node>,
        line: u32,
        end_line: u32,
    ) -> Result<Lowered, BuildError> {
        let object = self.build(receiver)?.operand();
        let name_sym = self.manager.intern("<<");
        let body_scope = self.manager.new_scope(
            ScopeKind::MetaClassBody,
            name_sym,
            &self.file,
            line,
            Some(self.scope),
        );
        let dst = self.temp_var();
        self.emit(Instr::DefineMetaClass { dst, object, body: body_scope });
        let context = {
            let mut child = Builder::new(
                self.manager,
                self.options,
                body_scope,
                self.dialect,
                self.coverage_mode,
                Some(&*self),
                None,
            );
            child.build_module_or_class_body(body, line, end_line)?
        };
        self.manager.set_context(body_scope, context);
        let result = self.temp_var();
        // Metaclass bodies see the block passed to the defining frame.
        let block: Operand = Variable::Temp(self.yield_closure_variable()).into();
        self.emit(Instr::ProcessModuleBody { dst: result, body: dst.into(), block });
        Ok(Lowered::Value(result.into()))
    }

    fn build_module_or_class_body(
        &mut self,
        body: Option<&Node>,
        line: u32,
        end_line: u32,
    ) -> Result<InterpreterContext, BuildError> {
        if self.options.full_trace {
            self.emit(Instr::Trace {
                event: RubyEvent::Class,
                name: None,
                file: self.file.clone(),
                line,
            });
        }
        self.prepare_implicit_state();
        self.add_current_module();
        self.after_prologue_index = self.instructions.len();

        let rv = match body {
            Some(body) => self.build(body)?.operand(),
            None => Operand::Nil,
        };
        if self.options.full_trace {
            self.emit(Instr::LineNumber { line: end_line, coverage: CoverageMode::None });
            self.emit(Instr::Trace {
                event: RubyEvent::End,
                name: None,
                file: self.file.clone(),
                line: end_line,
            });
        }
        self.emit(Instr::Return { value: rv });
        self.compute_flags();
        Ok(self.finish(1))
    }

    // ---- blocks, lambdas, for-bodies ----------------------------------

    pub(crate) fn build_iter(
        &mut self,
        args: &[String],
        body: Option<&Node>,
        line: u32,
        end_line: u32,
    ) -> Result<Operand, BuildError> {
        let handoff = self.method_name.take();
        let name = match handoff {
            Some(method) => {
                let method = self.manager.sym_name(method);
                self.manager.intern(&format!("block in {method}"))
            }
            None => self.manager.intern("block"),
        };
        let closure = self.manager.new_scope(
            ScopeKind::Closure,
            name,
            &self.file,
            line,
            Some(self.scope),
        );
        let context = {
            let mut child = Builder::new(
                self.manager,
                self.options,
                closure,
                self.dialect,
                self.coverage_mode,
                Some(&*self),
                None,
            );
            child.method_name = handoff;
            child.build_iter_inner(args, None, body, line, end_line, false)?
        };
        self.manager.set_context(closure, context);
        self.manager.add_closure(self.scope, closure);
        Ok(Operand::Closure(closure))
    }

    fn build_iter_inner(
        &mut self,
        args: &[String],
        for_variable: Option<&Node>,
        body: Option<&Node>,
        line: u32,
        end_line: u32,
        is_for: bool,
    ) -> Result<InterpreterContext, BuildError> {
        self.prepare_closure_implicit_state();
        if self.options.full_trace {
            self.emit(Instr::Trace {
                event: RubyEvent::BCall,
                name: self.method_name,
                file: self.file.clone(),
                line,
            });
        }
        // For-bodies assign their iteration variable before the current
        // module is materialized; blocks do it the other way around.
        if !is_for {
            self.add_current_module();
        }
        if let Some(variable) = for_variable {
            let received = self.temp_var();
            self.emit(Instr::ReceiveArg { dst: received, index: 0 });
            self.build_assignment(variable, received, line)?;
        } else {
            self.receive_block_args(args);
        }
        if is_for {
            self.add_current_module();
        }
        self.after_prologue_index = self.instructions.len();

        let rv = match body {
            Some(body) => self.build(body)?,
            None => Lowered::Value(Operand::Nil),
        };
        if self.options.full_trace {
            self.emit(Instr::LineNumber { line: end_line, coverage: CoverageMode::None });
            self.emit(Instr::Trace {
                event: RubyEvent::BReturn,
                name: self.method_name,
                file: self.file.clone(),
                line: end_line,
            });
        }
        if let Lowered::Value(value) = rv {
            self.emit(Instr::Return { value });
        }

        self.preload_block_implicit_closure();
        if !is_for {
            self.handle_breaks_and_returns_in_lambda();
        }
        self.compute_flags();
        Ok(self.finish(1))
    }

    fn receive_block_args(&mut self, args: &[String]) {
        for (index, name) in args.iter().enumerate() {
            let dst = self.argument_result(name);
            self.emit(Instr::ReceiveArg { dst, index: index as u32 });
        }
    }

    pub(crate) fn build_lambda(
        &mut self,
        args: &[String],
        body: Option<&Node>,
        line: u32,
        end_line: u32,
    ) -> Result<Lowered, BuildError> {
        let name = self.manager.intern("lambda");
        let closure = self.manager.new_scope(
            ScopeKind::Closure,
            name,
            &self.file,
            line,
            Some(self.scope),
        );
        let context = {
            let mut child = Builder::new(
                self.manager,
                self.options,
                closure,
                self.dialect,
                self.coverage_mode,
                Some(&*self),
                None,
            );
            child.build_iter_inner(args, None, body, line, end_line, false)?
        };
        self.manager.set_context(closure, context);
        self.manager.add_closure(self.scope, closure);
        let dst = self.temp_var();
        self.emit(Instr::BuildLambda { dst, closure: Operand::Closure(closure) });
        Ok(Lowered::Value(dst.into()))
    }

    /// `for` keeps its host's variable scope; the body becomes a special
    /// closure passed to `each` on the iterable.
    pub(crate) fn build_for(
        &mut self,
        iterable: &Node,
        variable: &Node,
        body: Option<&Node>,
        line: u32,
        end_line: u32,
    ) -> Result<Lowered, BuildError> {
        let result = self.temp_var();
        let receiver = self.build(iterable)?.operand();
        let name = self.manager.intern("for body");
        let body_scope = self.manager.new_scope(
            ScopeKind::For,
            name,
            &self.file,
            line,
            Some(self.scope),
        );
        let context = {
            let mut child = Builder::new(
                self.manager,
                self.options,
                body_scope,
                self.dialect,
                self.coverage_mode,
                Some(&*self),
                None,
            );
            child.build_iter_inner(&[], Some(variable), body, line, end_line, true)?
        };
        self.manager.set_context(body_scope, context);
        self.manager.add_closure(self.scope, body_scope);

        let block = Operand::Closure(body_scope);
        let call = Instr::Call {
            dst: result,
            call_type: CallType::Normal,
            name: self.manager.intern("each"),
            receiver,
            args: vec![],
            block: block.clone(),
            flags: 0,
        };
        self.receive_break_exception(&block, result, |b| b.emit(call));
        Ok(Lowered::Value(result.into()))
    }

    // ---- BEGIN and END ------------------------------------------------

    /// BEGIN bodies run first: built by a child builder that shares this
    /// scope and its temporary pool, then spliced in right after the
    /// prologue.
    pub(crate) fn build_pre_exe(&mut self, body: Option<&Node>) -> Result<Lowered, BuildError> {
        let instrs = {
            let mut child = Builder::new(
                self.manager,
                self.options,
                self.scope,
                self.dialect,
                self.coverage_mode,
                Some(&*self),
                Some(&*self),
            );
            if let Some(body) = body {
                child.build(body)?;
            }
            child.instructions
        };
        let at = self.after_prologue_index;
        self.after_prologue_index += instrs.len();
        self.instructions.splice(at..at, instrs);
        Ok(Lowered::Value(Operand::Nil))
    }

    /// END bodies become a closure recorded for execution at shutdown.
    /// Return inside one raises rather than unwinding, which the jump
    /// lowering handles off the `in_end_block` bit.
    pub(crate) fn build_post_exe(
        &mut self,
        body: Option<&Node>,
        line: u32,
    ) -> Result<Lowered, BuildError> {
        if !self.executes_once {
            self.manager.warn(&self.file, line, "END in method; use at_exit");
        }
        let name = self.manager.intern("_END_");
        let closure = self.manager.new_scope(
            ScopeKind::Closure,
            name,
            &self.file,
            line,
            Some(self.scope),
        );
        self.manager.mark_end_block(closure);
        let context = {
            let mut child = Builder::new(
                self.manager,
                self.options,
                closure,
                self.dialect,
                self.coverage_mode,
                Some(&*self),
                None,
            );
            child.in_end_block = true;
            child.build_pre_post_exe_inner(body)?
        };
        self.manager.set_context(closure, context);
        self.manager.add_closure(self.scope, closure);
        self.emit(Instr::RecordEndBlock { closure: Operand::Closure(closure) });
        Ok(Lowered::Value(Operand::Nil))
    }

    fn build_pre_post_exe_inner(
        &mut self,
        body: Option<&Node>,
    ) -> Result<InterpreterContext, BuildError> {
        self.add_current_module();
        if let Some(body) = body {
            self.build(body)?;
        }
        self.emit(Instr::Return { value: Operand::Nil });
        self.compute_flags();
        Ok(self.finish(1))
    }
}
