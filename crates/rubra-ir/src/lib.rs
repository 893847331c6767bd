//! Linear three-address IR for Ruby lexical scopes.
//!
//! Every lexical scope of a Ruby program (script body, method, block,
//! module/class body, eval) lowers to a flat instruction list plus a
//! temporary-variable count and a set of inferred scope flags. The
//! [`IrManager`] owns the scope table; internal control flow is expressed
//! with numbered [`Label`]s that branch instructions reference by value.

#![forbid(unsafe_code)]

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

mod instr;
mod scope;

pub use instr::{Instr, RuntimeHelper};
pub use scope::{IrManager, Scope, ScopeKind, WellKnownSyms};

/// Interned identifier for a name (method names, variable names, symbols).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sym(pub u32);

/// Handle for a scope registered with an [`IrManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ScopeId(pub u32);

/// A jump target local to one scope's instruction list.
///
/// Labels are allocated from a per-scope counter. Two reserved values sit
/// outside the allocatable range: [`Label::UNRESCUED_REGION`] marks code
/// with no active rescuer, and [`Label::GLOBAL_ENSURE`] names the
/// whole-scope region wrapped around lambdas and methods that must
/// intercept unwinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Label(pub u32);

impl Label {
    pub const UNRESCUED_REGION: Label = Label(u32::MAX);
    pub const GLOBAL_ENSURE: Label = Label(u32::MAX - 1);
}

/// Call-site flag: the trailing argument is a keyword hash.
pub const CALL_KEYWORD: u32 = 1 << 0;
/// Call-site flag: the keyword hash is built purely from `**` splats and
/// must be dropped at runtime when it turns out empty.
pub const CALL_KEYWORD_REST: u32 = 1 << 1;

/// How a call resolves its receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CallType {
    /// Explicit receiver, public lookup.
    Normal,
    /// Implicit `self` receiver, private methods visible.
    Functional,
}

/// Coverage instrumentation level attached to line-number instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CoverageMode {
    None,
    Line,
    Branch,
}

/// Runtime event reported by trace instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RubyEvent {
    Call,
    Return,
    Line,
    Class,
    End,
    BCall,
    BReturn,
}

/// Source encoding of a string literal or compound string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Encoding {
    #[default]
    Utf8,
    UsAscii,
    Ascii8Bit,
}

/// Regexp literal option bits (`i`, `x`, `m`, ...), kept opaque here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegexpOptions(pub u16);

/// Well-known classes the builder references without a constant search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BuiltinClass {
    Object,
    StandardError,
}

/// Storage class of a temporary variable.
///
/// Plain temporaries number the bulk of the pool. The current-module
/// temporary is a distinguished slot holding the lexically innermost
/// module; closure temporaries carry the id of the closure scope whose
/// pool they belong to so host scopes can splice ensure bodies built for
/// a nested scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TempKind {
    Local,
    CurrentModule,
    Closure(ScopeId),
}

/// A temporary variable slot inside one scope's pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TempVar {
    pub index: u32,
    pub kind: TempKind,
}

impl TempVar {
    pub fn local(index: u32) -> TempVar {
        TempVar { index, kind: TempKind::Local }
    }
}

/// A named local variable with the lexical depth (number of enclosing
/// scopes to hop) at which it lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LocalVar {
    pub name: Sym,
    pub depth: u32,
}

/// An assignable variable: either a temporary or a named local.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Variable {
    Temp(TempVar),
    Local(LocalVar),
}

impl From<TempVar> for Variable {
    fn from(t: TempVar) -> Variable {
        Variable::Temp(t)
    }
}

impl From<LocalVar> for Variable {
    fn from(l: LocalVar) -> Variable {
        Variable::Local(l)
    }
}

/// Exceptions the IR can throw without a runtime constant lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IrException {
    /// `LocalJumpError` raised for a `return` that cannot unwind anywhere.
    ReturnLocalJumpError,
}

/// A value an instruction reads: a variable or a literal shape known at
/// build time.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Operand {
    Var(Variable),
    Nil,
    True,
    False,
    Fixnum(i64),
    Float(f64),
    Symbol(Sym),
    FrozenString(String),
    MutableString(String),
    /// The receiver of the current scope.
    SelfObj,
    /// The module body found `depth` lexical scopes out.
    ScopeModule(u32),
    /// The static scope of the instruction's own scope.
    CurrentScope,
    /// A fully built nested closure scope.
    Closure(ScopeId),
    /// Compile-time range of two immutable literals.
    Range {
        begin: Box<Operand>,
        end: Box<Operand>,
        exclusive: bool,
    },
    /// Compile-time rational of two immutable literals.
    Rational {
        numerator: Box<Operand>,
        denominator: Box<Operand>,
    },
    /// Key/value pairs of a hash literal or keyword-argument hash.
    Hash(Vec<(Operand, Operand)>),
    Splat(Box<Operand>),
    /// Interpolated symbol whose string lives in a temporary.
    DynamicSymbol(TempVar),
    /// Regexp match reference (`$1`, `$2`, ...).
    NthRef(u32),
    /// Sentinel distinct from every Ruby value; used for optional-argument
    /// defaults and receiver-less case dispatch.
    Undefined,
    /// Absent block at a call site.
    NullBlock,
    BuiltinClass(BuiltinClass),
    IrException(IrException),
}

impl Operand {
    /// Frozen literals whose identity never changes across evaluation.
    /// These may be folded into compound operands at build time.
    pub fn is_immutable_literal(&self) -> bool {
        match self {
            Operand::Nil
            | Operand::True
            | Operand::False
            | Operand::Fixnum(_)
            | Operand::Float(_)
            | Operand::Symbol(_)
            | Operand::FrozenString(_) => true,
            Operand::Rational { .. } => true,
            _ => false,
        }
    }

    /// True when this operand is statically known to test true.
    pub fn is_truthy_literal(&self) -> bool {
        match self {
            Operand::True
            | Operand::Fixnum(_)
            | Operand::Float(_)
            | Operand::Symbol(_)
            | Operand::FrozenString(_)
            | Operand::MutableString(_)
            | Operand::Rational { .. }
            | Operand::Range { .. }
            | Operand::Hash(_) => true,
            _ => false,
        }
    }

    /// True when this operand is statically known to test false.
    pub fn is_falsey_literal(&self) -> bool {
        matches!(self, Operand::Nil | Operand::False)
    }

    /// Re-stamp lexical depths when an operand crosses `extra` scope
    /// boundaries, as happens when argument lists are replayed for
    /// `super` without parentheses inside nested blocks.
    pub fn clone_for_depth(&self, extra: u32) -> Operand {
        match self {
            Operand::Var(Variable::Local(l)) => Operand::Var(Variable::Local(LocalVar {
                name: l.name,
                depth: l.depth + extra,
            })),
            Operand::Splat(inner) => Operand::Splat(Box::new(inner.clone_for_depth(extra))),
            Operand::Hash(pairs) => Operand::Hash(
                pairs
                    .iter()
                    .map(|(k, v)| (k.clone_for_depth(extra), v.clone_for_depth(extra)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl From<Variable> for Operand {
    fn from(v: Variable) -> Operand {
        Operand::Var(v)
    }
}

impl From<TempVar> for Operand {
    fn from(t: TempVar) -> Operand {
        Operand::Var(Variable::Temp(t))
    }
}

/// Properties of a scope inferred from its finished instruction list,
/// kept as a bitset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ScopeFlags(pub u32);

impl ScopeFlags {
    pub const HAS_LOOPS: ScopeFlags = ScopeFlags(1 << 0);
    pub const HAS_BREAK_INSTRS: ScopeFlags = ScopeFlags(1 << 1);
    pub const HAS_NONLOCAL_RETURNS: ScopeFlags = ScopeFlags(1 << 2);
    pub const USES_ZSUPER: ScopeFlags = ScopeFlags(1 << 3);
    pub const USES_EVAL: ScopeFlags = ScopeFlags(1 << 4);
    pub const RECEIVES_KEYWORD_ARGS: ScopeFlags = ScopeFlags(1 << 5);
    pub const BINDING_HAS_ESCAPED: ScopeFlags = ScopeFlags(1 << 6);
    pub const CAN_CAPTURE_CALLERS_BINDING: ScopeFlags = ScopeFlags(1 << 7);
    pub const CAN_RECEIVE_BREAKS: ScopeFlags = ScopeFlags(1 << 8);
    pub const CAN_RECEIVE_NONLOCAL_RETURNS: ScopeFlags = ScopeFlags(1 << 9);
    pub const REQUIRES_DYNSCOPE: ScopeFlags = ScopeFlags(1 << 10);
    pub const FLAGS_COMPUTED: ScopeFlags = ScopeFlags(1 << 11);
    pub const MAYBE_USING_REFINEMENTS: ScopeFlags = ScopeFlags(1 << 12);

    pub fn set(&mut self, flag: ScopeFlags) {
        self.0 |= flag.0;
    }

    pub fn contains(self, flag: ScopeFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn merge(&mut self, other: ScopeFlags) {
        self.0 |= other.0;
    }
}

/// Role an argument plays in a method signature, recorded for
/// introspection (`Method#parameters`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ArgumentKind {
    Required,
    Optional,
    Rest,
    Keyword,
    KeywordRequired,
    KeywordRest,
    Block,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ArgumentDescriptor {
    pub kind: ArgumentKind,
    /// Absent for anonymous rest (`*`) and anonymous keyword rest (`**`).
    pub name: Option<Sym>,
}

/// The finished lowering of one scope: its instruction list, the size of
/// its temporary pool, and the flags inferred from the instructions.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InterpreterContext {
    pub instructions: Vec<Instr>,
    pub temp_count: u32,
    pub flags: ScopeFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_flags_set_and_query() {
        let mut flags = ScopeFlags::default();
        assert!(!flags.contains(ScopeFlags::HAS_LOOPS));
        flags.set(ScopeFlags::HAS_LOOPS);
        flags.set(ScopeFlags::USES_ZSUPER);
        assert!(flags.contains(ScopeFlags::HAS_LOOPS));
        assert!(flags.contains(ScopeFlags::USES_ZSUPER));
        assert!(!flags.contains(ScopeFlags::USES_EVAL));
    }

    #[test]
    fn clone_for_depth_restamps_locals_inside_compounds() {
        let arg = Operand::Splat(Box::new(Operand::Var(Variable::Local(LocalVar {
            name: Sym(3),
            depth: 0,
        }))));
        let cloned = arg.clone_for_depth(2);
        match cloned {
            Operand::Splat(inner) => match *inner {
                Operand::Var(Variable::Local(l)) => assert_eq!(l.depth, 2),
                other => panic!("unexpected operand {other:?}"),
            },
            other => panic!("unexpected operand {other:?}"),
        }
    }

    #[test]
    fn clone_for_depth_leaves_literals_alone() {
        assert_eq!(Operand::Fixnum(7).clone_for_depth(3), Operand::Fixnum(7));
        let temp = Operand::from(TempVar::local(0));
        assert_eq!(temp.clone_for_depth(3), temp);
    }

    #[test]
    fn literal_truthiness() {
        assert!(Operand::Fixnum(0).is_truthy_literal());
        assert!(Operand::Nil.is_falsey_literal());
        assert!(!Operand::Var(Variable::Temp(TempVar::local(1))).is_truthy_literal());
        assert!(!Operand::Var(Variable::Temp(TempVar::local(1))).is_falsey_literal());
    }

    #[test]
    fn reserved_labels_do_not_collide() {
        assert_ne!(Label::UNRESCUED_REGION, Label::GLOBAL_ENSURE);
    }
}
