//! Syntax tree consumed by the builder.
//!
//! Two parser front ends feed this shape. They differ only in how a
//! rescue clause binds its exception reference: the legacy parser
//! desugars `rescue => e` into an assignment at the head of the rescue
//! body, while the prism parser keeps the reference node and leaves the
//! assignment to the builder. [`TreeDialect`] records which convention a
//! tree follows.

use rubra_ir::{CoverageMode, Encoding, RegexpOptions};

/// Which front end produced this tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeDialect {
    Legacy,
    Prism,
}

/// Root of one parsed compilation unit.
#[derive(Clone, Debug)]
pub struct ParseResult {
    pub file: String,
    /// First line of the unit, zero-based like every line in the tree.
    pub line: u32,
    pub coverage_mode: CoverageMode,
    pub dialect: TreeDialect,
    pub body: Option<Node>,
}

/// Truthiness of a condition operand as far as the parser can tell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryTruth {
    LeftTrue,
    LeftFalse,
    Unknown,
}

/// Method signature. Optional and keyword defaults are arbitrary
/// expressions evaluated inside the method body.
#[derive(Clone, Debug, Default)]
pub struct MethodArgs {
    pub pre: Vec<String>,
    pub opt: Vec<(String, Node)>,
    /// `Some(None)` is an anonymous `*`.
    pub rest: Option<Option<String>>,
    /// A keyword with no default is required.
    pub kwargs: Vec<(String, Option<Node>)>,
    /// `Some(None)` is an anonymous `**`.
    pub kwrest: Option<Option<String>>,
    pub block: Option<String>,
}

impl MethodArgs {
    pub fn required(names: &[&str]) -> MethodArgs {
        MethodArgs {
            pre: names.iter().map(|n| (*n).to_owned()).collect(),
            ..Default::default()
        }
    }
}

/// One `rescue` clause; chained clauses hang off `next_clause`.
#[derive(Clone, Debug)]
pub struct RescueClause {
    pub exceptions: Vec<Node>,
    /// `rescue => e` reference; present only in prism-dialect trees.
    pub reference: Option<Node>,
    pub body: Option<Node>,
    pub next_clause: Option<Box<RescueClause>>,
    pub line: u32,
}

/// One `when` arm of a case expression.
#[derive(Clone, Debug)]
pub struct WhenArm {
    pub values: Vec<Node>,
    pub body: Option<Node>,
    pub line: u32,
}

/// Literals a `when` value can contribute to duplicate detection.
/// Floats are deliberately absent.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum WhenLiteral {
    Nil,
    True,
    False,
    Fixnum(i64),
    Sym(String),
    Str(String),
}

#[derive(Clone, Debug)]
pub enum Node {
    // Statement boundary recorded by the parser. `newline` statements get
    // coverage-eligible line markers; other positions only feed backtraces.
    AtLine { line: u32, newline: bool, body: Box<Node> },
    Statements(Vec<Node>),

    // Literals.
    Nil,
    True,
    False,
    SelfNode,
    Fixnum(i64),
    Float(f64),
    Str { value: String, frozen: bool },
    SymLit(String),
    DStr { pieces: Vec<Node>, encoding: Encoding, frozen: bool, line: u32 },
    DSym { pieces: Vec<Node>, encoding: Encoding, line: u32 },
    DRegexp { pieces: Vec<Node>, options: RegexpOptions, line: u32 },
    DXStr { pieces: Vec<Node>, encoding: Encoding, line: u32 },
    RangeLit { begin: Box<Node>, end: Box<Node>, exclusive: bool },
    RationalLit { numerator: Box<Node>, denominator: Box<Node> },
    EncodingRef(Encoding),
    /// `brace` distinguishes a literal `{..}` hash from a bare keyword
    /// tail in an argument list.
    HashLit { pairs: Vec<(Option<Node>, Node)>, brace: bool },
    Splat(Box<Node>),
    NthRef(u32),

    // Variables.
    LocalVar { name: String, depth: u32 },
    LocalAsgn { name: String, depth: u32, value: Box<Node> },
    InstVar { name: String },
    InstAsgn { name: String, value: Box<Node> },
    GlobalVar { name: String },
    GlobalAsgn { name: String, value: Box<Node> },
    ClassVar { name: String },
    ClassVarAsgn { name: String, value: Box<Node> },
    ClassVarDecl { name: String, value: Box<Node> },
    ConstRef { name: String },
    ConstAsgn { name: String, value: Box<Node> },

    // Boolean structure.
    And { left: Box<Node>, right: Box<Node> },
    Or { left: Box<Node>, right: Box<Node> },
    Not { value: Box<Node> },
    OpAsgnOr { first: Box<Node>, second: Box<Node> },
    OpAsgnAnd { first: Box<Node>, second: Box<Node> },
    Defined { expr: Box<Node> },

    // Control flow.
    If { predicate: Box<Node>, then_body: Option<Box<Node>>, else_body: Option<Box<Node>> },
    Case { predicate: Option<Box<Node>>, arms: Vec<WhenArm>, else_body: Option<Box<Node>>, line: u32 },
    ConditionalLoop {
        condition: Box<Node>,
        body: Option<Box<Node>>,
        /// `while` when true, `until` when false.
        is_while: bool,
        /// False for `begin ... end while` modifiers, which run the body
        /// before the first test.
        eval_condition_first: bool,
    },
    BreakNode { value: Option<Box<Node>>, line: u32 },
    NextNode { value: Option<Box<Node>>, line: u32 },
    RedoNode { line: u32 },
    RetryNode { line: u32 },
    ReturnNode { value: Option<Box<Node>>, line: u32 },
    Begin {
        body: Option<Box<Node>>,
        rescue: Option<Box<RescueClause>>,
        else_body: Option<Box<Node>>,
        ensure: Option<Box<Node>>,
        is_modifier: bool,
    },

    // Calls.
    Call {
        receiver: Box<Node>,
        name: String,
        args: Vec<Node>,
        iter: Option<Box<Node>>,
        line: u32,
        newline: bool,
    },
    FCall { name: String, args: Vec<Node>, iter: Option<Box<Node>>, line: u32, newline: bool },
    AttrAsgn { receiver: Box<Node>, name: String, args: Vec<Node>, line: u32 },
    YieldNode { args: Vec<Node> },
    SuperNode { args: Vec<Node>, iter: Option<Box<Node>>, line: u32, newline: bool },
    ZSuperNode { iter: Option<Box<Node>>, line: u32 },
    BlockPass { value: Box<Node> },

    // Closures and definitions.
    Iter { args: Vec<String>, body: Option<Box<Node>>, line: u32, end_line: u32 },
    LambdaNode { args: Vec<String>, body: Option<Box<Node>>, line: u32, end_line: u32 },
    ForNode {
        iterable: Box<Node>,
        variable: Box<Node>,
        body: Option<Box<Node>>,
        line: u32,
        end_line: u32,
    },
    Def {
        name: String,
        /// Singleton receiver for `def obj.name`.
        receiver: Option<Box<Node>>,
        args: MethodArgs,
        body: Option<Box<Node>>,
        line: u32,
        end_line: u32,
    },
    ClassNode {
        name: String,
        container: Option<Box<Node>>,
        superclass: Option<Box<Node>>,
        body: Option<Box<Node>>,
        line: u32,
        end_line: u32,
    },
    ModuleNode {
        name: String,
        container: Option<Box<Node>>,
        body: Option<Box<Node>>,
        line: u32,
        end_line: u32,
    },
    SClass { receiver: Box<Node>, body: Option<Box<Node>>, line: u32, end_line: u32 },
    PreExe { body: Option<Box<Node>> },
    PostExe { body: Option<Box<Node>>, line: u32 },

    // Method-table mutation and oddities.
    AliasNode { new_name: Box<Node>, old_name: Box<Node> },
    VAlias { new_name: String, old_name: String },
    Undef { name: Box<Node> },
    FlipFlop { line: u32 },
}

impl Node {
    pub fn at(line: u32, body: Node) -> Node {
        Node::AtLine { line, newline: true, body: Box::new(body) }
    }

    /// Unwrap line markers to reach the semantic node.
    pub fn unwrap_lines(&self) -> &Node {
        let mut node = self;
        while let Node::AtLine { body, .. } = node {
            node = body;
        }
        node
    }

    /// Statically known to test true as a condition.
    pub fn always_true(&self) -> bool {
        match self.unwrap_lines() {
            Node::True
            | Node::Fixnum(_)
            | Node::Float(_)
            | Node::Str { .. }
            | Node::SymLit(_)
            | Node::DStr { .. }
            | Node::RangeLit { .. }
            | Node::LambdaNode { .. } => true,
            _ => false,
        }
    }

    /// Statically known to test false as a condition.
    pub fn always_false(&self) -> bool {
        matches!(self.unwrap_lines(), Node::Nil | Node::False)
    }

    pub fn binary_truth(&self) -> BinaryTruth {
        if self.always_true() {
            BinaryTruth::LeftTrue
        } else if self.always_false() {
            BinaryTruth::LeftFalse
        } else {
            BinaryTruth::Unknown
        }
    }

    /// Assignment targets whose `||=` form must test definedness rather
    /// than plain truthiness: reading them when undefined would raise or
    /// warn.
    pub fn needs_definition_check(&self) -> bool {
        match self.unwrap_lines() {
            Node::InstVar { .. }
            | Node::GlobalVar { .. }
            | Node::ClassVar { .. }
            | Node::ConstRef { .. } => true,
            _ => false,
        }
    }

    /// A method definition can defer its body build unless the body
    /// contains jumps that must be validated eagerly for syntax errors.
    pub fn can_be_lazy_method(&self) -> bool {
        !self.contains_jump()
    }

    fn contains_jump(&self) -> bool {
        match self {
            Node::BreakNode { .. } | Node::NextNode { .. } | Node::RedoNode { .. } | Node::RetryNode { .. } => {
                true
            }
            Node::AtLine { body, .. } => body.contains_jump(),
            Node::Statements(nodes) => nodes.iter().any(Node::contains_jump),
            // Jumps nested under other structure get their own validation
            // when that structure is built.
            _ => false,
        }
    }

    /// Literal identity used to warn about duplicated `when` clauses.
    pub fn when_literal(&self) -> Option<WhenLiteral> {
        match self.unwrap_lines() {
            Node::Nil => Some(WhenLiteral::Nil),
            Node::True => Some(WhenLiteral::True),
            Node::False => Some(WhenLiteral::False),
            Node::Fixnum(n) => Some(WhenLiteral::Fixnum(*n)),
            Node::SymLit(s) => Some(WhenLiteral::Sym(s.clone())),
            Node::Str { value, .. } => Some(WhenLiteral::Str(value.clone())),
            _ => None,
        }
    }

    /// Evaluating this node can neither raise nor write anywhere.
    /// Decides whether a rescue body needs backtrace capture.
    pub fn is_side_effect_free(&self) -> bool {
        match self.unwrap_lines() {
            Node::Nil
            | Node::True
            | Node::False
            | Node::SelfNode
            | Node::Fixnum(_)
            | Node::Float(_)
            | Node::Str { .. }
            | Node::SymLit(_)
            | Node::LocalVar { .. }
            | Node::InstVar { .. } => true,
            _ => false,
        }
    }

    /// Contains an assignment anywhere, meaning earlier sibling values in
    /// an argument list must be pinned to temporaries to keep evaluation
    /// order observable.
    pub fn contains_variable_assignment(&self) -> bool {
        match self {
            Node::LocalAsgn { .. }
            | Node::InstAsgn { .. }
            | Node::GlobalAsgn { .. }
            | Node::ClassVarAsgn { .. }
            | Node::ClassVarDecl { .. }
            | Node::ConstAsgn { .. }
            | Node::OpAsgnOr { .. }
            | Node::OpAsgnAnd { .. }
            | Node::AttrAsgn { .. } => true,
            Node::AtLine { body, .. } => body.contains_variable_assignment(),
            Node::Statements(nodes) => nodes.iter().any(Node::contains_variable_assignment),
            Node::Splat(inner) | Node::BlockPass { value: inner } => {
                inner.contains_variable_assignment()
            }
            Node::And { left, right } | Node::Or { left, right } => {
                left.contains_variable_assignment() || right.contains_variable_assignment()
            }
            Node::Call { receiver, args, .. } => {
                receiver.contains_variable_assignment()
                    || args.iter().any(Node::contains_variable_assignment)
            }
            Node::FCall { args, .. } => args.iter().any(Node::contains_variable_assignment),
            Node::HashLit { pairs, .. } => pairs.iter().any(|(k, v)| {
                k.as_ref().map_or(false, Node::contains_variable_assignment)
                    || v.contains_variable_assignment()
            }),
            _ => false,
        }
    }

    /// Mentions `$!` or `$@`, whose values exist only when a backtrace
    /// was captured.
    pub fn refers_to_error_info(&self) -> bool {
        match self {
            Node::GlobalVar { name } | Node::GlobalAsgn { name, .. } => {
                name == "$!" || name == "$@"
            }
            Node::AtLine { body, .. } => body.refers_to_error_info(),
            Node::Statements(nodes) => nodes.iter().any(Node::refers_to_error_info),
            Node::LocalAsgn { value, .. } | Node::InstAsgn { value, .. } => {
                value.refers_to_error_info()
            }
            Node::Call { receiver, args, .. } => {
                receiver.refers_to_error_info() || args.iter().any(Node::refers_to_error_info)
            }
            Node::FCall { args, .. } => args.iter().any(Node::refers_to_error_info),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_fold_as_conditions() {
        assert!(Node::Fixnum(0).always_true());
        assert!(Node::Str { value: "x".into(), frozen: true }.always_true());
        assert!(Node::Nil.always_false());
        assert!(!Node::LocalVar { name: "a".into(), depth: 0 }.always_true());
        assert_eq!(Node::False.binary_truth(), BinaryTruth::LeftFalse);
    }

    #[test]
    fn line_markers_are_transparent_to_predicates() {
        let wrapped = Node::at(4, Node::True);
        assert!(wrapped.always_true());
        assert_eq!(wrapped.when_literal(), Some(WhenLiteral::True));
    }

    #[test]
    fn definition_check_targets() {
        assert!(Node::InstVar { name: "@a".into() }.needs_definition_check());
        assert!(Node::GlobalVar { name: "$a".into() }.needs_definition_check());
        assert!(!Node::LocalVar { name: "a".into(), depth: 0 }.needs_definition_check());
    }

    #[test]
    fn top_level_jumps_force_eager_method_builds() {
        let body = Node::Statements(vec![Node::at(1, Node::BreakNode { value: None, line: 1 })]);
        assert!(!body.can_be_lazy_method());
        assert!(Node::Fixnum(1).can_be_lazy_method());
    }

    #[test]
    fn error_info_global_detection() {
        let body = Node::Statements(vec![Node::at(
            2,
            Node::LocalAsgn {
                name: "e".into(),
                depth: 0,
                value: Box::new(Node::GlobalVar { name: "$!".into() }),
            },
        )]);
        assert!(body.refers_to_error_info());
        assert!(!Node::Nil.refers_to_error_info());
    }
}
