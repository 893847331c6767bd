//! Call-site lowering: method calls, attribute assignment, yield, and
//! the super family.
//!
//! Calls carrying a `**rest` keyword splat are lowered as two call
//! shapes branched on hash emptiness, so an empty rest hash never turns
//! a no-keyword call into a keyword call at runtime. Calls whose block
//! contains `break` are wrapped in a rescuer that translates the break
//! unwind arriving back at this frame.

use rubra_ir::{
    CallType, Instr, Operand, RuntimeHelper, ScopeFlags, Sym, Variable, CALL_KEYWORD,
    CALL_KEYWORD_REST,
};

use crate::ast::Node;
use crate::BuildError;

use super::{Builder, Lowered};

impl<'a> Builder<'a> {
    pub(crate) fn build_call(
        &mut self,
        result: Option<Variable>,
        receiver: &Node,
        name: &str,
        args: &[Node],
        iter: Option<&Node>,
        line: u32,
        newline: bool,
    ) -> Result<Lowered, BuildError> {
        let name = self.manager.intern(name);
        let preserve_order = receiver.contains_variable_assignment()
            || args.iter().any(Node::contains_variable_assignment);
        let receiver = self.build_with_order(receiver, preserve_order)?;
        self.create_call(result, receiver, CallType::Normal, name, args, iter, line, newline)
    }

    pub(crate) fn build_fcall(
        &mut self,
        result: Option<Variable>,
        name: &str,
        args: &[Node],
        iter: Option<&Node>,
        line: u32,
        newline: bool,
    ) -> Result<Lowered, BuildError> {
        let name = self.manager.intern(name);
        self.create_call(result, Operand::SelfObj, CallType::Functional, name, args, iter, line, newline)
    }

    fn create_call(
        &mut self,
        result: Option<Variable>,
        receiver: Operand,
        call_type: CallType,
        name: Sym,
        args_node: &[Node],
        iter: Option<&Node>,
        line: u32,
        newline: bool,
    ) -> Result<Lowered, BuildError> {
        let result = result.unwrap_or_else(|| self.temp_var());
        if call_type == CallType::Functional {
            self.check_refinement_call(name);
        }
        let mut flags = 0u32;
        let args = self.setup_call_args(args_node, &mut flags)?;
        self.needs_line_number(line, newline);
        let block = self.setup_call_closure(iter, Some(name))?;

        let block_slot = block.clone();
        self.emit_call_shapes(&block, result, flags, args, |args| Instr::Call {
            dst: result,
            call_type,
            name,
            receiver: receiver.clone(),
            args,
            block: block_slot.clone(),
            flags,
        });
        Ok(Lowered::Value(result.into()))
    }

    /// Emit the instruction `make` produces for an argument vector, inside
    /// one break wrapper. A call carrying a `**rest` splat is emitted as
    /// two shapes branched on hash emptiness instead, so an empty rest
    /// hash never turns a no-keyword call into a keyword call at runtime.
    fn emit_call_shapes(
        &mut self,
        block: &Operand,
        result: Variable,
        flags: u32,
        args: Vec<Operand>,
        make: impl Fn(Vec<Operand>) -> Instr,
    ) {
        if flags & CALL_KEYWORD_REST == 0 {
            let call = make(args);
            self.receive_break_exception(block, result, |b| b.emit(call));
            return;
        }
        // args is non-empty here; the rest hash is its last element.
        let kwrest = match args.last() {
            Some(op) => op.clone(),
            None => unreachable!("keyword-rest call with no arguments"),
        };
        let test = self.temp_var();
        self.emit(Instr::RuntimeHelperCall {
            dst: test,
            helper: RuntimeHelper::IsHashEmpty,
            args: vec![kwrest],
        });
        let mut trimmed = args.clone();
        trimmed.pop();
        self.receive_break_exception(block, result, |b| {
            let else_label = b.new_label();
            let end_label = b.new_label();
            b.emit(Instr::BNE { target: else_label, value: test.into(), test: Operand::True });
            b.emit(make(trimmed));
            b.emit(Instr::Jump { target: end_label });
            b.emit(Instr::Label { label: else_label });
            b.emit(make(args));
            b.emit(Instr::Label { label: end_label });
        });
    }

    /// `obj.attr = v` and friends; the expression value is the assigned
    /// value, not the call result.
    pub(crate) fn build_attr_asgn(
        &mut self,
        receiver: &Node,
        name: &str,
        args: &[Node],
        line: u32,
    ) -> Result<Lowered, BuildError> {
        let preserve_order = receiver.contains_variable_assignment()
            || args.iter().any(Node::contains_variable_assignment);
        let obj = self.build_with_order(receiver, preserve_order)?;
        let mut flags = 0u32;
        let args = self.setup_call_args(args, &mut flags)?;
        let value = match args.last() {
            Some(op) => op.clone(),
            None => Operand::Nil,
        };
        self.needs_line_number(line, false);
        let dst = self.temp_var();
        self.emit(Instr::Call {
            dst,
            call_type: CallType::Normal,
            name: self.manager.intern(name),
            receiver: obj,
            args,
            block: Operand::NullBlock,
            flags,
        });
        Ok(Lowered::Value(value))
    }

    pub(crate) fn build_yield(&mut self, args: &[Node]) -> Result<Lowered, BuildError> {
        let block = Variable::Temp(self.yield_closure_variable());
        let mut flags = 0u32;
        let args = self.setup_call_args(args, &mut flags)?;
        let dst = self.temp_var();
        self.emit(Instr::Yield { dst, block, args });
        Ok(Lowered::Value(dst.into()))
    }

    // ---- super --------------------------------------------------------

    pub(crate) fn build_super(
        &mut self,
        args: &[Node],
        iter: Option<&Node>,
        line: u32,
        newline: bool,
    ) -> Result<Lowered, BuildError> {
        let result = self.temp_var();
        let mut flags = 0u32;
        let args = self.setup_call_args(args, &mut flags)?;
        self.needs_line_number(line, newline);
        let block = self.setup_call_closure(iter, None)?;
        // super with no explicit block forwards the frame's implicit one.
        let block = if block == Operand::NullBlock {
            Variable::Temp(self.yield_closure_variable()).into()
        } else {
            block
        };

        let name = self.manager.scope_name(self.scope);
        let in_class_body = match self.manager.lexical_parent(self.scope) {
            Some(parent) => self.manager.kind(parent).is_module_body(),
            None => false,
        };
        let resolved = match self.manager.kind(self.scope) {
            rubra_ir::ScopeKind::Method { instance_method } if in_class_body => {
                let module: Operand = Variable::Temp(self.current_module_variable()).into();
                Some((module, instance_method))
            }
            // Inside closures the frame's method is only known at run
            // time; scripts and detached methods resolve there too.
            _ => None,
        };
        let block_slot = block.clone();
        self.emit_call_shapes(&block, result, flags, args, |args| match &resolved {
            Some((defining_module, true)) => Instr::InstanceSuper {
                dst: result,
                name,
                defining_module: defining_module.clone(),
                args,
                block: block_slot.clone(),
                flags,
            },
            Some((defining_module, false)) => Instr::ClassSuper {
                dst: result,
                name,
                defining_module: defining_module.clone(),
                args,
                block: block_slot.clone(),
                flags,
            },
            None => Instr::UnresolvedSuper {
                dst: result,
                receiver: Operand::SelfObj,
                args,
                block: block_slot.clone(),
                flags,
            },
        });
        Ok(Lowered::Value(result.into()))
    }

    /// `super` with no argument list: replay the receives of the method
    /// whose frame will be reused, restamping variable depths for the
    /// closure nesting between here and there.
    pub(crate) fn build_zsuper(
        &mut self,
        iter: Option<&Node>,
        line: u32,
    ) -> Result<Lowered, BuildError> {
        self.needs_line_number(line, false);
        let block = self.setup_call_closure(iter, None)?;
        let block = if block == Operand::NullBlock {
            Variable::Temp(self.yield_closure_variable()).into()
        } else {
            block
        };

        let (depth, super_scope, define_method, receives) = {
            let mut depth = 0u32;
            let mut scope = self.scope;
            let mut builder: Option<&Builder> = Some(self);
            let mut define_method = false;
            while self.manager.kind(scope).is_closure_like() {
                if builder.map_or(false, Builder::is_define_method_builder) {
                    define_method = true;
                }
                match self.manager.lexical_parent(scope) {
                    Some(parent) => scope = parent,
                    None => break,
                }
                builder = builder.and_then(|b| b.parent);
                depth += 1;
            }
            // A live parent build has its receives in progress; a scope
            // built earlier exposes them through its finished context.
            let receives: Vec<Instr> = match builder {
                Some(b) => b.instructions.iter().filter(|i| i.is_arg_receive()).cloned().collect(),
                None => self
                    .manager
                    .context_instructions(scope)
                    .unwrap_or_default()
                    .into_iter()
                    .filter(Instr::is_arg_receive)
                    .collect(),
            };
            (depth, scope, define_method, receives)
        };

        if self.manager.kind(super_scope).is_method() && !define_method {
            let result = self.temp_var();
            let mut flags = 0u32;
            let mut args = self.zsuper_args(&receives, &mut flags);
            if depth > 0 {
                args = args.iter().map(|a| a.clone_for_depth(depth)).collect();
            }
            let block_slot = block.clone();
            self.emit_call_shapes(&block, result, flags, args, |args| Instr::ZSuper {
                dst: result,
                receiver: Operand::SelfObj,
                args,
                block: block_slot.clone(),
                flags,
            });
            Ok(Lowered::Value(result.into()))
        } else {
            // No method frame to replay, or the frame belongs to
            // define_method, whose signature is invisible here.
            self.manager.set_flag(self.scope, ScopeFlags::USES_ZSUPER);
            let value = self.add_raise_error(
                "RuntimeError",
                "implicit argument passing of super from method defined by define_method() is not supported. Specify all arguments explicitly.",
            );
            Ok(Lowered::Value(value))
        }
    }

    fn zsuper_args(&self, receives: &[Instr], flags: &mut u32) -> Vec<Operand> {
        let wk = self.manager.well_known();
        let mut args = Vec::new();
        let mut kwargs: Vec<(Operand, Operand)> = Vec::new();
        let mut has_kwrest = false;
        for instr in receives {
            match instr {
                Instr::ReceiveArg { dst, .. } | Instr::ReceiveOptArg { dst, .. } => {
                    args.push((*dst).into())
                }
                Instr::ReceiveRestArg { dst, .. } => {
                    args.push(Operand::Splat(Box::new((*dst).into())))
                }
                Instr::ReceiveKeywordArg { dst, key } => {
                    kwargs.push((Operand::Symbol(*key), (*dst).into()))
                }
                Instr::ReceiveKeywordRestArg { dst } => {
                    has_kwrest = true;
                    kwargs.insert(0, (Operand::Symbol(wk.kw_rest_dummy), (*dst).into()));
                }
                _ => {}
            }
        }
        if !kwargs.is_empty() {
            *flags |= CALL_KEYWORD;
            if has_kwrest {
                *flags |= CALL_KEYWORD_REST;
            }
            args.push(Operand::Hash(kwargs));
        }
        args
    }

    fn is_define_method_builder(&self) -> bool {
        let wk = self.manager.well_known();
        self.method_name == Some(wk.define_method)
            || self.method_name == Some(wk.define_singleton_method)
    }

    // ---- shared call plumbing -----------------------------------------

    /// Lower an argument list. A trailing braceless hash becomes the
    /// keyword hash; keyword flags accumulate into `flags`.
    pub(crate) fn setup_call_args(
        &mut self,
        args: &[Node],
        flags: &mut u32,
    ) -> Result<Vec<Operand>, BuildError> {
        let preserve_order = args.iter().any(Node::contains_variable_assignment);
        let mut out = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let last = i + 1 == args.len();
            match arg.unwrap_lines() {
                Node::HashLit { pairs, brace } if last && !*brace => {
                    *flags |= CALL_KEYWORD;
                    if !pairs.is_empty() && pairs.iter().all(|(key, _)| key.is_none()) {
                        *flags |= CALL_KEYWORD_REST;
                    }
                    let pairs = self.build_hash_pairs(pairs)?;
                    out.push(Operand::Hash(pairs));
                }
                Node::Splat(inner) => {
                    let value = self.build_with_order(inner, preserve_order)?;
                    out.push(Operand::Splat(Box::new(value)));
                }
                _ => out.push(self.build_with_order(arg, preserve_order)?),
            }
        }
        Ok(out)
    }

    /// Lower the block slot of a call: a literal block builds a nested
    /// closure scope (taking the call name with it), `&value` and other
    /// expressions evaluate to a block value in a temporary.
    pub(crate) fn setup_call_closure(
        &mut self,
        iter: Option<&Node>,
        name: Option<Sym>,
    ) -> Result<Operand, BuildError> {
        let node = match iter {
            Some(node) => node,
            None => return Ok(Operand::NullBlock),
        };
        match node.unwrap_lines() {
            Node::Iter { args, body, line, end_line } => {
                self.method_name = name;
                self.build_iter(args, body.as_deref(), *line, *end_line)
            }
            Node::BlockPass { value } => {
                let value = self.build(value)?.operand();
                Ok(Operand::Var(self.value_in_temp(value)))
            }
            _ => {
                let value = self.build(node)?.operand();
                Ok(Operand::Var(self.value_in_temp(value)))
            }
        }
    }

    /// Wrap a call whose literal block contains `break`: the break unwind
    /// propagating back to this frame becomes the call's result.
    pub(crate) fn receive_break_exception(
        &mut self,
        block: &Operand,
        result: Variable,
        emit_call: impl FnOnce(&mut Self),
    ) {
        let has_break = match block {
            Operand::Closure(id) => {
                self.manager.flags(*id).contains(ScopeFlags::HAS_BREAK_INSTRS)
            }
            _ => false,
        };
        if !has_break {
            emit_call(self);
            return;
        }
        let r_begin = self.new_label();
        let r_end = self.new_label();
        let rescue_label = self.new_label();
        self.emit(Instr::Label { label: r_begin });
        self.emit(Instr::ExceptionRegionStart { rescuer: rescue_label });
        emit_call(self);
        self.emit(Instr::Jump { target: r_end });
        self.emit(Instr::ExceptionRegionEnd);
        self.emit(Instr::Label { label: rescue_label });
        let exc = self.temp_var();
        self.emit(Instr::ReceiveUnwindException { dst: exc });
        self.emit(Instr::RuntimeHelperCall {
            dst: result,
            helper: RuntimeHelper::HandlePropagatedBreak,
            args: vec![exc.into()],
        });
        self.emit(Instr::Label { label: r_end });
    }

    fn check_refinement_call(&mut self, name: Sym) {
        let wk = self.manager.well_known();
        if name == wk.using || name == wk.refine {
            self.manager.set_flag(self.scope, ScopeFlags::MAYBE_USING_REFINEMENTS);
        }
    }
}
