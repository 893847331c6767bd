//! Expression lowering: compound literals, variable access, boolean
//! structure, `||=`/`&&=`, and `defined?`.

use rubra_ir::{
    BuiltinClass, CallType, Encoding, Instr, Operand, RegexpOptions, RuntimeHelper, ScopeKind,
    Variable,
};

use crate::ast::{BinaryTruth, Node};
use crate::builder::{Builder, Lowered};
use crate::BuildError;

impl<'a> Builder<'a> {
    // ---- compound literals --------------------------------------------

    /// One piece of an interpolated literal, with the size it is known to
    /// contribute to the final string.
    fn dynamic_piece(&mut self, piece: &Node) -> Result<(Operand, usize), BuildError> {
        match piece.unwrap_lines() {
            Node::Str { value, .. } => Ok((Operand::FrozenString(value.clone()), value.len())),
            _ => Ok((self.build(piece)?.operand(), 0)),
        }
    }

    pub(crate) fn build_dstr(
        &mut self,
        result: Option<Variable>,
        pieces: &[Node],
        encoding: Encoding,
        frozen: bool,
        line: u32,
    ) -> Result<Lowered, BuildError> {
        let mut operands = Vec::with_capacity(pieces.len());
        let mut estimated_size = 0;
        for piece in pieces {
            let (op, size) = self.dynamic_piece(piece)?;
            estimated_size += size;
            operands.push(op);
        }
        let dst = result.unwrap_or_else(|| self.temp_var());
        self.emit(Instr::BuildCompoundString {
            dst,
            pieces: operands,
            encoding,
            frozen,
            estimated_size,
            file: self.file.clone(),
            line,
        });
        Ok(Lowered::Value(dst.into()))
    }

    pub(crate) fn build_dsym(
        &mut self,
        pieces: &[Node],
        encoding: Encoding,
        line: u32,
    ) -> Result<Lowered, BuildError> {
        let string = self.build_dstr(None, pieces, encoding, false, line)?.operand();
        let tmp = self.value_in_temp(string);
        match tmp {
            Variable::Temp(t) => Ok(Lowered::Value(Operand::DynamicSymbol(t))),
            Variable::Local(_) => unreachable!("compound string always lands in a temporary"),
        }
    }

    pub(crate) fn build_dregexp(
        &mut self,
        pieces: &[Node],
        options: RegexpOptions,
        _line: u32,
    ) -> Result<Lowered, BuildError> {
        let mut operands = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let (op, _) = self.dynamic_piece(piece)?;
            operands.push(op);
        }
        let dst = self.temp_var();
        self.emit(Instr::BuildDynRegexp { dst, pieces: operands, options });
        Ok(Lowered::Value(dst.into()))
    }

    /// Backquote string: build the interpolation, then send it to `` ` ``.
    pub(crate) fn build_dxstr(
        &mut self,
        pieces: &[Node],
        encoding: Encoding,
        line: u32,
    ) -> Result<Lowered, BuildError> {
        let string = self.build_dstr(None, pieces, encoding, false, line)?.operand();
        let dst = self.temp_var();
        self.emit(Instr::Call {
            dst,
            call_type: CallType::Functional,
            name: self.manager.intern("`"),
            receiver: Operand::SelfObj,
            args: vec![string],
            block: Operand::NullBlock,
            flags: 0,
        });
        Ok(Lowered::Value(dst.into()))
    }

    pub(crate) fn build_range(
        &mut self,
        begin: &Node,
        end: &Node,
        exclusive: bool,
    ) -> Result<Lowered, BuildError> {
        let begin = self.build(begin)?.operand();
        let end = self.build(end)?.operand();
        if begin.is_immutable_literal() && end.is_immutable_literal() {
            return Ok(Lowered::Value(Operand::Range {
                begin: Box::new(begin),
                end: Box::new(end),
                exclusive,
            }));
        }
        let dst = self.temp_var();
        self.emit(Instr::BuildRange { dst, begin, end, exclusive });
        Ok(Lowered::Value(dst.into()))
    }

    pub(crate) fn build_rational(
        &mut self,
        numerator: &Node,
        denominator: &Node,
    ) -> Result<Lowered, BuildError> {
        let numerator = self.build(numerator)?.operand();
        let denominator = self.build(denominator)?.operand();
        Ok(Lowered::Value(Operand::Rational {
            numerator: Box::new(numerator),
            denominator: Box::new(denominator),
        }))
    }

    /// Lower hash pairs to operands. A `None` key is a `**value` splat and
    /// is marked with the reserved rest key.
    pub(crate) fn build_hash_pairs(
        &mut self,
        pairs: &[(Option<Node>, Node)],
    ) -> Result<Vec<(Operand, Operand)>, BuildError> {
        let kw_rest = self.manager.well_known().kw_rest_dummy;
        let mut operands = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            match key {
                Some(key) => {
                    let k = self.build_with_order(key, true)?;
                    let v = self.build_with_order(value, true)?;
                    operands.push((k, v));
                }
                None => {
                    let v = self.build(value)?.operand();
                    operands.push((Operand::Symbol(kw_rest), v));
                }
            }
        }
        Ok(operands)
    }

    pub(crate) fn build_hash(
        &mut self,
        pairs: &[(Option<Node>, Node)],
    ) -> Result<Lowered, BuildError> {
        let operands = self.build_hash_pairs(pairs)?;
        let dst = self.copy(None, Operand::Hash(operands));
        Ok(Lowered::Value(dst.into()))
    }

    // ---- variable access ----------------------------------------------

    pub(crate) fn build_local_asgn(
        &mut self,
        name: &str,
        depth: u32,
        value: &Node,
    ) -> Result<Lowered, BuildError> {
        let variable = self.local(name, depth);
        let lowered = self.build(value)?;
        if lowered.is_terminated() {
            return Ok(Lowered::Terminated);
        }
        let value = lowered.operand();
        if value != Operand::Var(variable) {
            self.emit(Instr::Copy { dst: variable, src: value.clone() });
        }
        // The expression value of an assignment is the assigned value,
        // not the variable, so later reads cannot observe a rebind.
        Ok(Lowered::Value(value))
    }

    pub(crate) fn build_inst_var(&mut self, name: &str) -> Result<Lowered, BuildError> {
        let dst = self.temp_var();
        self.emit(Instr::GetField {
            dst,
            receiver: Operand::SelfObj,
            name: self.manager.intern(name),
            raw_value: false,
        });
        Ok(Lowered::Value(dst.into()))
    }

    pub(crate) fn build_inst_asgn(&mut self, name: &str, value: &Node) -> Result<Lowered, BuildError> {
        let lowered = self.build(value)?;
        if lowered.is_terminated() {
            return Ok(Lowered::Terminated);
        }
        let value = lowered.operand();
        self.emit(Instr::PutField {
            receiver: Operand::SelfObj,
            name: self.manager.intern(name),
            value: value.clone(),
        });
        Ok(Lowered::Value(value))
    }

    pub(crate) fn build_global_var(&mut self, name: &str) -> Result<Lowered, BuildError> {
        let dst = self.temp_var();
        self.emit(Instr::GetGlobalVariable { dst, name: self.manager.intern(name) });
        Ok(Lowered::Value(dst.into()))
    }

    pub(crate) fn build_global_asgn(&mut self, name: &str, value: &Node) -> Result<Lowered, BuildError> {
        let lowered = self.build(value)?;
        if lowered.is_terminated() {
            return Ok(Lowered::Terminated);
        }
        let value = lowered.operand();
        self.emit(Instr::PutGlobalVariable {
            name: self.manager.intern(name),
            value: value.clone(),
        });
        Ok(Lowered::Value(value))
    }

    pub(crate) fn build_class_var(&mut self, name: &str) -> Result<Lowered, BuildError> {
        if self.at_top_level() {
            return Ok(Lowered::Value(
                self.add_raise_error("RuntimeError", "class variable access from toplevel"),
            ));
        }
        let container = self.class_var_container(false);
        let dst = self.temp_var();
        self.emit(Instr::GetClassVariable { dst, container, name: self.manager.intern(name) });
        Ok(Lowered::Value(dst.into()))
    }

    pub(crate) fn build_class_var_asgn(
        &mut self,
        name: &str,
        value: &Node,
        declaration: bool,
    ) -> Result<Lowered, BuildError> {
        if self.at_top_level() {
            return Ok(Lowered::Value(
                self.add_raise_error("RuntimeError", "class variable access from toplevel"),
            ));
        }
        let lowered = self.build(value)?;
        if lowered.is_terminated() {
            return Ok(Lowered::Terminated);
        }
        let value = lowered.operand();
        let container = self.class_var_container(declaration);
        self.emit(Instr::PutClassVariable {
            container,
            name: self.manager.intern(name),
            value: value.clone(),
        });
        Ok(Lowered::Value(value))
    }

    fn at_top_level(&self) -> bool {
        self.manager.kind(self.manager.nearest_non_closure_like(self.scope)) == ScopeKind::Script
            && self.eval_type.is_none()
    }

    /// Module that owns a class variable mentioned here. A surrounding
    /// non-singleton class body resolves statically to a scope-module
    /// hop count; otherwise resolution is deferred to runtime.
    pub(crate) fn class_var_container(&mut self, declaration: bool) -> Operand {
        let mut hops = 0;
        let mut cursor = Some(self.scope);
        while let Some(s) = cursor {
            let kind = self.manager.kind(s);
            if kind.is_non_singleton_class_body() {
                return Operand::ScopeModule(hops);
            }
            if kind == ScopeKind::Eval {
                break;
            }
            if kind != ScopeKind::For {
                hops += 1;
            }
            cursor = self.manager.lexical_parent(s);
        }
        let dst = self.temp_var();
        self.emit(Instr::GetClassVarContainerModule {
            dst,
            start_scope: Operand::CurrentScope,
            object: if declaration { None } else { Some(Operand::SelfObj) },
        });
        dst.into()
    }

    pub(crate) fn build_const_ref(&mut self, name: &str) -> Result<Lowered, BuildError> {
        let dst = self.temp_var();
        self.emit(Instr::SearchConst { dst, name: self.manager.intern(name) });
        Ok(Lowered::Value(dst.into()))
    }

    pub(crate) fn build_const_asgn(&mut self, name: &str, value: &Node) -> Result<Lowered, BuildError> {
        let lowered = self.build(value)?;
        if lowered.is_terminated() {
            return Ok(Lowered::Terminated);
        }
        let value = lowered.operand();
        let module = self.find_container_module();
        self.emit(Instr::PutConst {
            module,
            name: self.manager.intern(name),
            value: value.clone(),
        });
        Ok(Lowered::Value(value))
    }

    // ---- boolean structure --------------------------------------------

    pub(crate) fn build_and(&mut self, left: &Node, right: &Node) -> Result<Lowered, BuildError> {
        let truth = left.binary_truth();
        let lowered = self.build(left)?;
        if lowered.is_terminated() {
            return Ok(Lowered::Terminated);
        }
        let left = lowered.operand();
        match truth {
            BinaryTruth::LeftTrue => self.build(right),
            BinaryTruth::LeftFalse => Ok(Lowered::Value(left)),
            BinaryTruth::Unknown => {
                let result = self.value_in_temp(left.clone());
                let end = self.new_label();
                self.create_branch(&left, &Operand::False, end);
                let right = self.build(right)?.operand();
                self.emit(Instr::Copy { dst: result, src: right });
                self.emit(Instr::Label { label: end });
                Ok(Lowered::Value(result.into()))
            }
        }
    }

    pub(crate) fn build_or(&mut self, left: &Node, right: &Node) -> Result<Lowered, BuildError> {
        let truth = left.binary_truth();
        let lowered = self.build(left)?;
        if lowered.is_terminated() {
            return Ok(Lowered::Terminated);
        }
        let left = lowered.operand();
        match truth {
            BinaryTruth::LeftTrue => Ok(Lowered::Value(left)),
            BinaryTruth::LeftFalse => self.build(right),
            BinaryTruth::Unknown => {
                let result = self.value_in_temp(left.clone());
                let end = self.new_label();
                self.create_branch(&left, &Operand::True, end);
                let right = self.build(right)?.operand();
                self.emit(Instr::Copy { dst: result, src: right });
                self.emit(Instr::Label { label: end });
                Ok(Lowered::Value(result.into()))
            }
        }
    }

    pub(crate) fn build_not(&mut self, value: &Node) -> Result<Lowered, BuildError> {
        let receiver = self.build(value)?.operand();
        let dst = self.temp_var();
        self.emit(Instr::Call {
            dst,
            call_type: CallType::Normal,
            name: self.manager.intern("!"),
            receiver,
            args: vec![],
            block: Operand::NullBlock,
            flags: 0,
        });
        Ok(Lowered::Value(dst.into()))
    }

    pub(crate) fn build_op_asgn_or(
        &mut self,
        first: &Node,
        second: &Node,
    ) -> Result<Lowered, BuildError> {
        if first.needs_definition_check() {
            return self.build_op_asgn_or_with_defined(first, second);
        }
        let done = self.new_label();
        let result = self.temp_var();
        let v1 = self.build(first)?.operand();
        self.emit(Instr::Copy { dst: result, src: v1.clone() });
        self.create_branch(&v1, &Operand::True, done);
        let v2 = self.build(second)?.operand();
        self.emit(Instr::Copy { dst: result, src: v2 });
        self.emit(Instr::Label { label: done });
        Ok(Lowered::Value(result.into()))
    }

    /// `x ||= y` where reading an unset `x` would raise or warn: test
    /// definedness first, then truthiness, and only then assign.
    fn build_op_asgn_or_with_defined(
        &mut self,
        first: &Node,
        second: &Node,
    ) -> Result<Lowered, BuildError> {
        let done = self.new_label();
        let assign = self.new_label();
        let flag = self.temp_var();
        let result = self.temp_var();
        let defined = self.build_get_definition(first)?;
        self.emit(Instr::Copy { dst: flag, src: defined });
        self.create_branch(&flag.into(), &Operand::Nil, assign);
        let v1 = self.build(first)?.operand();
        self.emit(Instr::Copy { dst: result, src: v1.clone() });
        self.create_branch(&v1, &Operand::True, done);
        self.emit(Instr::Label { label: assign });
        let v2 = self.build(second)?.operand();
        self.emit(Instr::Copy { dst: result, src: v2 });
        self.emit(Instr::Label { label: done });
        Ok(Lowered::Value(result.into()))
    }

    pub(crate) fn build_op_asgn_and(
        &mut self,
        first: &Node,
        second: &Node,
    ) -> Result<Lowered, BuildError> {
        let done = self.new_label();
        let result = self.temp_var();
        let v1 = self.build(first)?.operand();
        self.emit(Instr::Copy { dst: result, src: v1.clone() });
        self.create_branch(&v1, &Operand::False, done);
        let v2 = self.build(second)?.operand();
        self.emit(Instr::Copy { dst: result, src: v2 });
        self.emit(Instr::Label { label: done });
        Ok(Lowered::Value(result.into()))
    }

    // ---- defined? -----------------------------------------------------

    pub(crate) fn build_defined(&mut self, expr: &Node) -> Result<Lowered, BuildError> {
        let value = self.build_get_definition(expr)?;
        Ok(Lowered::Value(value))
    }

    /// Lower to an operand holding the definition description string, or
    /// nil when the expression is not defined.
    pub(crate) fn build_get_definition(&mut self, node: &Node) -> Result<Operand, BuildError> {
        match node.unwrap_lines() {
            Node::SelfNode => Ok(Operand::FrozenString("self".into())),
            Node::LocalVar { .. } | Node::LocalAsgn { .. } => {
                Ok(Operand::FrozenString("local-variable".into()))
            }
            Node::InstVar { name } => {
                let undefined = self.new_label();
                let done = self.new_label();
                let result = self.temp_var();
                let raw = self.temp_var();
                self.emit(Instr::GetField {
                    dst: raw,
                    receiver: Operand::SelfObj,
                    name: self.manager.intern(name),
                    raw_value: true,
                });
                self.create_branch(&raw.into(), &Operand::Undefined, undefined);
                self.emit(Instr::Copy {
                    dst: result,
                    src: Operand::FrozenString("instance-variable".into()),
                });
                self.emit(Instr::Jump { target: done });
                self.emit(Instr::Label { label: undefined });
                self.emit(Instr::Copy { dst: result, src: Operand::Nil });
                self.emit(Instr::Label { label: done });
                Ok(result.into())
            }
            Node::GlobalVar { name } => {
                let dst = self.temp_var();
                self.emit(Instr::RuntimeHelperCall {
                    dst,
                    helper: RuntimeHelper::IsDefinedGlobal,
                    args: vec![
                        Operand::FrozenString(name.clone()),
                        Operand::FrozenString("global-variable".into()),
                    ],
                });
                Ok(dst.into())
            }
            Node::ClassVar { name } => {
                let container = self.class_var_container(true);
                let dst = self.temp_var();
                self.emit(Instr::RuntimeHelperCall {
                    dst,
                    helper: RuntimeHelper::IsDefinedClassVar,
                    args: vec![
                        container,
                        Operand::FrozenString(name.clone()),
                        Operand::FrozenString("class variable".into()),
                    ],
                });
                Ok(dst.into())
            }
            Node::ConstRef { name } => {
                let dst = self.temp_var();
                self.emit(Instr::RuntimeHelperCall {
                    dst,
                    helper: RuntimeHelper::IsDefinedConstant,
                    args: vec![
                        Operand::CurrentScope,
                        Operand::FrozenString(name.clone()),
                        Operand::FrozenString("constant".into()),
                    ],
                });
                Ok(dst.into())
            }
            Node::Call { receiver, name, .. } => {
                let receiver = receiver.as_ref().clone();
                let name = self.manager.intern(name);
                let value = self.protect_code_with_rescue(
                    |b| {
                        let recv = b.build(&receiver)?.operand();
                        let dst = b.temp_var();
                        b.emit(Instr::RuntimeHelperCall {
                            dst,
                            helper: RuntimeHelper::IsDefinedCall,
                            args: vec![
                                recv,
                                Operand::Symbol(name),
                                Operand::FrozenString("method".into()),
                            ],
                        });
                        Ok(dst.into())
                    },
                    |_| Ok(Some(Operand::Nil)),
                )?;
                Ok(value)
            }
            Node::FCall { name, .. } => {
                let name = self.manager.intern(name);
                let value = self.protect_code_with_rescue(
                    |b| {
                        let dst = b.temp_var();
                        b.emit(Instr::RuntimeHelperCall {
                            dst,
                            helper: RuntimeHelper::IsDefinedCall,
                            args: vec![
                                Operand::SelfObj,
                                Operand::Symbol(name),
                                Operand::FrozenString("method".into()),
                            ],
                        });
                        Ok(dst.into())
                    },
                    |_| Ok(Some(Operand::Nil)),
                )?;
                Ok(value)
            }
            _ => Ok(Operand::FrozenString("expression".into())),
        }
    }

    // ---- aliases, undef, flip -----------------------------------------

    pub(crate) fn build_alias(
        &mut self,
        new_name: &Node,
        old_name: &Node,
    ) -> Result<Lowered, BuildError> {
        let new_name = self.build(new_name)?.operand();
        let old_name = self.build(old_name)?.operand();
        self.emit(Instr::Alias { new_name, old_name });
        Ok(Lowered::Value(Operand::Nil))
    }

    pub(crate) fn build_valias(
        &mut self,
        new_name: &str,
        old_name: &str,
    ) -> Result<Lowered, BuildError> {
        self.emit(Instr::GVarAlias {
            new_name: Operand::MutableString(new_name.into()),
            old_name: Operand::MutableString(old_name.into()),
        });
        Ok(Lowered::Value(Operand::Nil))
    }

    pub(crate) fn build_undef(&mut self, name: &Node) -> Result<Lowered, BuildError> {
        let name = self.build(name)?.operand();
        let dst = self.temp_var();
        self.emit(Instr::UndefMethod { dst, name });
        Ok(Lowered::Value(dst.into()))
    }

    pub(crate) fn build_flip(&mut self, _line: u32) -> Result<Lowered, BuildError> {
        self.add_raise_error("NotImplementedError", "flip-flop is no longer supported");
        Ok(Lowered::Value(Operand::Nil))
    }

    /// Emit `Kernel.raise(<class>, <message>)` against a builtin error
    /// class, yielding the (unreachable) call result.
    pub(crate) fn add_raise_error(&mut self, id: &str, message: &str) -> Operand {
        let exc_class = self.search_module_for_const(Operand::BuiltinClass(BuiltinClass::Object), id);
        let kernel =
            self.search_module_for_const(Operand::BuiltinClass(BuiltinClass::Object), "Kernel");
        let dst = self.temp_var();
        self.emit(Instr::Call {
            dst,
            call_type: CallType::Normal,
            name: self.manager.intern("raise"),
            receiver: kernel,
            args: vec![exc_class, Operand::FrozenString(message.into())],
            block: Operand::NullBlock,
            flags: 0,
        });
        dst.into()
    }

    pub(crate) fn search_module_for_const(&mut self, module: Operand, name: &str) -> Operand {
        let dst = self.temp_var();
        self.emit(Instr::SearchModuleForConst { dst, module, name: self.manager.intern(name) });
        dst.into()
    }
}
