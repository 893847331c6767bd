//! The instruction set.
//!
//! Instructions are plain data; side tables (labels, temporaries, locals)
//! live on the owning scope. Result-producing instructions name their
//! destination [`Variable`] first.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::scope::WellKnownSyms;
use crate::{
    CallType, CoverageMode, Encoding, Label, Operand, RegexpOptions, RubyEvent, ScopeFlags,
    ScopeId, Sym, Variable,
};

/// Runtime helper routines invoked through a single instruction instead of
/// a method dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RuntimeHelper {
    HandleBreakAndReturnsInLambda,
    HandleNonlocalReturn,
    HandlePropagatedBreak,
    IsHashEmpty,
    IsDefinedCall,
    IsDefinedGlobal,
    IsDefinedClassVar,
    IsDefinedConstant,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Instr {
    // Scope prologue and frame state.
    ReceiveSelf,
    LoadImplicitClosure { dst: Variable },
    LoadFrameClosure { dst: Variable },
    LoadBlockImplicitClosure { dst: Variable },
    /// Reify the implicit block into a Proc for a named `&block` parameter.
    ReifyClosure { dst: Variable, source: Variable },

    Copy { dst: Variable, src: Operand },
    LineNumber { line: u32, coverage: CoverageMode },
    Trace { event: RubyEvent, name: Option<Sym>, file: String, line: u32 },

    // Control flow.
    Label { label: Label },
    Jump { target: Label },
    BTrue { target: Label, value: Operand },
    BFalse { target: Label, value: Operand },
    BNil { target: Label, value: Operand },
    BUndef { target: Label, value: Operand },
    BNE { target: Label, value: Operand, test: Operand },
    Nop,
    ThreadPoll { on_back_edge: bool },

    // Exception regions.
    ExceptionRegionStart { rescuer: Label },
    ExceptionRegionEnd,
    ReceiveRubyException { dst: Variable },
    ReceiveUnwindException { dst: Variable },
    ThrowException { exception: Operand },
    /// Exception-aware `===`: never swallows the raise when `exc_type` is
    /// not a class/module.
    RescueEqq { dst: Variable, exc_type: Operand, exc_obj: Operand },
    /// Plain `===` for case/when dispatch. With `needs_splat` the test
    /// value expands array elements; an `Undefined` test value degrades to
    /// a truthiness check of the expression.
    Eqq { dst: Variable, expression: Operand, test: Operand, needs_splat: bool },
    /// Suppress or restore backtrace capture for cheap rescue bodies.
    ToggleBacktrace { required: bool },

    // Calls.
    Call {
        dst: Variable,
        call_type: CallType,
        name: Sym,
        receiver: Operand,
        args: Vec<Operand>,
        block: Operand,
        flags: u32,
    },
    InstanceSuper {
        dst: Variable,
        name: Sym,
        defining_module: Operand,
        args: Vec<Operand>,
        block: Operand,
        flags: u32,
    },
    ClassSuper {
        dst: Variable,
        name: Sym,
        defining_module: Operand,
        args: Vec<Operand>,
        block: Operand,
        flags: u32,
    },
    UnresolvedSuper { dst: Variable, receiver: Operand, args: Vec<Operand>, block: Operand, flags: u32 },
    ZSuper { dst: Variable, receiver: Operand, args: Vec<Operand>, block: Operand, flags: u32 },
    Yield { dst: Variable, block: Variable, args: Vec<Operand> },
    RuntimeHelperCall { dst: Variable, helper: RuntimeHelper, args: Vec<Operand> },

    // Returns and non-local jumps.
    Return { value: Operand },
    /// Return that unwinds out of a block to the frame of the method named
    /// here; `method_name` is absent when lowered inside a module body.
    NonlocalReturn { value: Operand, method_name: Option<Sym> },
    /// Runtime guard raising LocalJumpError when a lambda-return target
    /// frame is gone.
    CheckForLJE { defined_within_method: bool },
    /// Value returned by an unwind handler, or the saved exception
    /// rethrown when the unwind was not ours.
    ReturnOrRethrowSavedExc { value: Operand },
    Break { value: Operand, scope: ScopeId },

    // Variable access beyond locals.
    GetGlobalVariable { dst: Variable, name: Sym },
    PutGlobalVariable { name: Sym, value: Operand },
    /// `raw_value` fetches the slot without nil-defaulting, exposing the
    /// distinguished undefined value for defined? checks.
    GetField { dst: Variable, receiver: Operand, name: Sym, raw_value: bool },
    PutField { receiver: Operand, name: Sym, value: Operand },
    GetClassVariable { dst: Variable, container: Operand, name: Sym },
    PutClassVariable { container: Operand, name: Sym, value: Operand },
    /// Resolve the module that holds a class variable when no lexical
    /// class body is in scope; `object` supplies `self` for the
    /// non-declaration context.
    GetClassVarContainerModule { dst: Variable, start_scope: Operand, object: Option<Operand> },

    // Constants.
    SearchConst { dst: Variable, name: Sym },
    LexicalSearchConst { dst: Variable, name: Sym },
    InheritanceSearchConst { dst: Variable, module: Operand, name: Sym },
    SearchModuleForConst { dst: Variable, module: Operand, name: Sym },
    PutConst { module: Operand, name: Sym, value: Operand },

    // Definitions.
    DefineClass { dst: Variable, body: ScopeId, container: Operand, superclass: Operand },
    DefineModule { dst: Variable, body: ScopeId, container: Operand },
    DefineMetaClass { dst: Variable, object: Operand, body: ScopeId },
    DefineInstanceMethod { method: ScopeId },
    DefineClassMethod { receiver: Operand, method: ScopeId },
    ProcessModuleBody { dst: Variable, body: Operand, block: Operand },
    RecordEndBlock { closure: Operand },

    // Compound value construction.
    BuildCompoundString {
        dst: Variable,
        pieces: Vec<Operand>,
        encoding: Encoding,
        frozen: bool,
        estimated_size: usize,
        file: String,
        line: u32,
    },
    BuildDynRegexp { dst: Variable, pieces: Vec<Operand>, options: RegexpOptions },
    BuildRange { dst: Variable, begin: Operand, end: Operand, exclusive: bool },
    BuildLambda { dst: Variable, closure: Operand },
    GetEncoding { dst: Variable, encoding: Encoding },

    // Argument receives.
    ReceiveArg { dst: Variable, index: u32 },
    ReceiveOptArg { dst: Variable, index: u32 },
    ReceiveRestArg { dst: Variable, index: u32 },
    ReceiveKeywordArg { dst: Variable, key: Sym },
    ReceiveKeywordRestArg { dst: Variable },

    // Method-table mutation.
    Alias { new_name: Operand, old_name: Operand },
    GVarAlias { new_name: Operand, old_name: Operand },
    UndefMethod { dst: Variable, name: Operand },
}

impl Instr {
    /// Fold this instruction's contribution into the scope's flag set.
    ///
    /// Called once per instruction after a scope's list is final. Flags
    /// derived from nested closures are merged separately by the builder.
    pub fn compute_scope_flags(&self, flags: &mut ScopeFlags, wk: &WellKnownSyms) {
        match self {
            Instr::Break { .. } => flags.set(ScopeFlags::HAS_BREAK_INSTRS),
            Instr::NonlocalReturn { .. } => flags.set(ScopeFlags::HAS_NONLOCAL_RETURNS),
            Instr::ZSuper { .. } => flags.set(ScopeFlags::USES_ZSUPER),
            Instr::ReceiveKeywordArg { .. } | Instr::ReceiveKeywordRestArg { .. } => {
                flags.set(ScopeFlags::RECEIVES_KEYWORD_ARGS)
            }
            Instr::Call { name, .. } => {
                if wk.is_eval_name(*name) {
                    flags.set(ScopeFlags::USES_EVAL);
                } else if *name == wk.binding {
                    flags.set(ScopeFlags::BINDING_HAS_ESCAPED);
                    flags.set(ScopeFlags::CAN_CAPTURE_CALLERS_BINDING);
                }
            }
            _ => {}
        }
    }

    /// True for the argument-receiving instructions whose results are
    /// replayed when `super` is written without an argument list.
    pub fn is_arg_receive(&self) -> bool {
        matches!(
            self,
            Instr::ReceiveArg { .. }
                | Instr::ReceiveOptArg { .. }
                | Instr::ReceiveRestArg { .. }
                | Instr::ReceiveKeywordArg { .. }
                | Instr::ReceiveKeywordRestArg { .. }
        )
    }

    /// Rewrite every label this instruction mentions through `map`.
    /// Used when an ensure-body template is cloned into a host scope.
    pub fn with_renamed_labels(&self, map: &dyn Fn(Label) -> Label) -> Instr {
        match self {
            Instr::Label { label } => Instr::Label { label: map(*label) },
            Instr::Jump { target } => Instr::Jump { target: map(*target) },
            Instr::BTrue { target, value } => {
                Instr::BTrue { target: map(*target), value: value.clone() }
            }
            Instr::BFalse { target, value } => {
                Instr::BFalse { target: map(*target), value: value.clone() }
            }
            Instr::BNil { target, value } => {
                Instr::BNil { target: map(*target), value: value.clone() }
            }
            Instr::BUndef { target, value } => {
                Instr::BUndef { target: map(*target), value: value.clone() }
            }
            Instr::BNE { target, value, test } => Instr::BNE {
                target: map(*target),
                value: value.clone(),
                test: test.clone(),
            },
            Instr::ExceptionRegionStart { rescuer } => {
                Instr::ExceptionRegionStart { rescuer: map(*rescuer) }
            }
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IrManager, TempVar};

    fn dst() -> Variable {
        Variable::Temp(TempVar::local(0))
    }

    #[test]
    fn break_and_return_instrs_mark_flags() {
        let manager = IrManager::new();
        let wk = manager.well_known();
        let mut flags = ScopeFlags::default();
        Instr::Break { value: Operand::Nil, scope: ScopeId(0) }.compute_scope_flags(&mut flags, &wk);
        Instr::NonlocalReturn { value: Operand::Nil, method_name: None }
            .compute_scope_flags(&mut flags, &wk);
        assert!(flags.contains(ScopeFlags::HAS_BREAK_INSTRS));
        assert!(flags.contains(ScopeFlags::HAS_NONLOCAL_RETURNS));
    }

    #[test]
    fn eval_calls_mark_uses_eval() {
        let manager = IrManager::new();
        let wk = manager.well_known();
        let mut flags = ScopeFlags::default();
        let call = Instr::Call {
            dst: dst(),
            call_type: CallType::Functional,
            name: manager.intern("instance_eval"),
            receiver: Operand::SelfObj,
            args: vec![],
            block: Operand::NullBlock,
            flags: 0,
        };
        call.compute_scope_flags(&mut flags, &wk);
        assert!(flags.contains(ScopeFlags::USES_EVAL));
        assert!(!flags.contains(ScopeFlags::BINDING_HAS_ESCAPED));
    }

    #[test]
    fn binding_calls_mark_escape() {
        let manager = IrManager::new();
        let wk = manager.well_known();
        let mut flags = ScopeFlags::default();
        let call = Instr::Call {
            dst: dst(),
            call_type: CallType::Functional,
            name: manager.intern("binding"),
            receiver: Operand::SelfObj,
            args: vec![],
            block: Operand::NullBlock,
            flags: 0,
        };
        call.compute_scope_flags(&mut flags, &wk);
        assert!(flags.contains(ScopeFlags::BINDING_HAS_ESCAPED));
        assert!(flags.contains(ScopeFlags::CAN_CAPTURE_CALLERS_BINDING));
    }

    #[test]
    fn label_renaming_touches_every_branch_shape() {
        let bump = |l: Label| Label(l.0 + 100);
        let jump = Instr::Jump { target: Label(1) }.with_renamed_labels(&bump);
        assert_eq!(jump, Instr::Jump { target: Label(101) });
        let region = Instr::ExceptionRegionStart { rescuer: Label(2) }.with_renamed_labels(&bump);
        assert_eq!(region, Instr::ExceptionRegionStart { rescuer: Label(102) });
        let copy = Instr::Copy { dst: dst(), src: Operand::Nil }.with_renamed_labels(&bump);
        assert_eq!(copy, Instr::Copy { dst: dst(), src: Operand::Nil });
    }
}
