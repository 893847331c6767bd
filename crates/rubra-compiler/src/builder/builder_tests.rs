//! End-to-end lowering tests: build small trees and assert on the
//! instruction shapes and scope flags that come out.

use rubra_ir::{
    ArgumentKind, BuiltinClass, CoverageMode, Instr, IrManager, Label, LocalVar, Operand,
    RuntimeHelper, ScopeFlags, ScopeId, ScopeKind, Variable, CALL_KEYWORD, CALL_KEYWORD_REST,
};

use crate::ast::{MethodArgs, Node, ParseResult, RescueClause, TreeDialect, WhenArm};
use crate::{build_eval, build_script, BuildError, BuildOptions, BuildOutput};

use super::EvalType;

fn parse(body: Option<Node>) -> ParseResult {
    ParseResult {
        file: "t.rb".to_owned(),
        line: 0,
        coverage_mode: CoverageMode::Line,
        dialect: TreeDialect::Prism,
        body,
    }
}

fn lower(body: Node) -> (IrManager, BuildOutput) {
    let manager = IrManager::new();
    let out = build_script(&manager, &BuildOptions::default(), &parse(Some(body)))
        .expect("build should succeed");
    (manager, out)
}

fn lower_err(body: Node) -> BuildError {
    let manager = IrManager::new();
    build_script(&manager, &BuildOptions::default(), &parse(Some(body)))
        .expect_err("build should fail")
}

fn fcall(name: &str, args: Vec<Node>) -> Node {
    Node::FCall { name: name.to_owned(), args, iter: None, line: 0, newline: false }
}

fn fcall_iter(name: &str, iter: Node) -> Node {
    Node::FCall {
        name: name.to_owned(),
        args: vec![],
        iter: Some(Box::new(iter)),
        line: 0,
        newline: false,
    }
}

fn lvar(name: &str) -> Node {
    Node::LocalVar { name: name.to_owned(), depth: 0 }
}

fn asgn(name: &str, value: Node) -> Node {
    Node::LocalAsgn { name: name.to_owned(), depth: 0, value: Box::new(value) }
}

fn def_m(args: MethodArgs, body: Node) -> Node {
    Node::Def {
        name: "m".to_owned(),
        receiver: None,
        args,
        body: Some(Box::new(body)),
        line: 0,
        end_line: 2,
    }
}

fn calls_named(manager: &IrManager, instrs: &[Instr], name: &str) -> usize {
    let sym = manager.intern(name);
    instrs
        .iter()
        .filter(|i| matches!(i, Instr::Call { name: n, .. } if *n == sym))
        .count()
}

fn position(instrs: &[Instr], pred: impl Fn(&Instr) -> bool) -> usize {
    instrs.iter().position(pred).expect("instruction not found")
}

fn defined_method(instrs: &[Instr]) -> ScopeId {
    instrs
        .iter()
        .find_map(|i| match i {
            Instr::DefineInstanceMethod { method } => Some(*method),
            _ => None,
        })
        .expect("no method definition in stream")
}

#[test]
fn empty_script_prologue_and_temp_count() {
    let manager = IrManager::new();
    let out = build_script(&manager, &BuildOptions::default(), &parse(None))
        .expect("build should succeed");
    let instrs = &out.context.instructions;
    assert_eq!(instrs.len(), 4);
    assert!(matches!(instrs[0], Instr::ReceiveSelf));
    assert!(matches!(instrs[1], Instr::LoadFrameClosure { .. }));
    assert!(matches!(instrs[2], Instr::Copy { src: Operand::ScopeModule(0), .. }));
    assert!(matches!(instrs[3], Instr::Return { value: Operand::Nil }));
    assert_eq!(out.context.temp_count, 2);
    assert!(out.context.flags.contains(ScopeFlags::FLAGS_COMPUTED));
    assert_eq!(manager.kind(out.scope), ScopeKind::Script);
}

#[test]
fn eval_root_marks_line_and_reserves_extra_temp() {
    let manager = IrManager::new();
    let host = build_script(&manager, &BuildOptions::default(), &parse(None))
        .expect("script should build");
    let eval_parse = ParseResult {
        file: "(eval)".to_owned(),
        line: 9,
        coverage_mode: CoverageMode::None,
        dialect: TreeDialect::Prism,
        body: None,
    };
    let out = build_eval(
        &manager,
        &BuildOptions::default(),
        &eval_parse,
        EvalType::Plain,
        host.scope,
    )
    .expect("eval should build");
    assert!(matches!(
        out.context.instructions[0],
        Instr::LineNumber { line: 9, coverage: CoverageMode::None }
    ));
    assert_eq!(out.context.temp_count, 3);
    assert_eq!(manager.kind(out.scope), ScopeKind::Eval);
}

#[test]
fn statement_line_markers_coalesce_per_line() {
    let (_, out) = lower(Node::Statements(vec![
        Node::at(0, asgn("a", Node::Fixnum(1))),
        Node::at(0, asgn("b", Node::Fixnum(2))),
        Node::at(1, asgn("c", Node::Fixnum(3))),
    ]));
    let markers: Vec<&Instr> = out
        .context
        .instructions
        .iter()
        .filter(|i| matches!(i, Instr::LineNumber { .. }))
        .collect();
    assert_eq!(markers.len(), 2);
    assert!(matches!(markers[0], Instr::LineNumber { line: 0, coverage: CoverageMode::Line }));
    assert!(matches!(markers[1], Instr::LineNumber { line: 1, coverage: CoverageMode::Line }));
}

#[test]
fn call_site_marker_skips_coverage() {
    let (_, out) = lower(Node::FCall {
        name: "work".to_owned(),
        args: vec![],
        iter: None,
        line: 4,
        newline: false,
    });
    assert!(out
        .context
        .instructions
        .iter()
        .any(|i| matches!(i, Instr::LineNumber { line: 4, coverage: CoverageMode::None })));
}

#[test]
fn while_loop_polls_on_back_edge() {
    let (manager, out) = lower(Node::ConditionalLoop {
        condition: Box::new(lvar("x")),
        body: Some(Box::new(fcall("work", vec![]))),
        is_while: true,
        eval_condition_first: true,
    });
    assert!(out.context.flags.contains(ScopeFlags::HAS_LOOPS));
    let polls: Vec<&Instr> = out
        .context
        .instructions
        .iter()
        .filter(|i| matches!(i, Instr::ThreadPoll { .. }))
        .collect();
    assert_eq!(polls.len(), 1);
    assert!(matches!(polls[0], Instr::ThreadPoll { on_back_edge: true }));
    assert_eq!(calls_named(&manager, &out.context.instructions, "work"), 1);
}

#[test]
fn break_out_of_ensure_replays_cleanup() {
    // while x; begin; break; ensure; cleanup; end; end
    let (manager, out) = lower(Node::ConditionalLoop {
        condition: Box::new(lvar("x")),
        body: Some(Box::new(Node::Begin {
            body: Some(Box::new(Node::BreakNode { value: None, line: 1 })),
            rescue: None,
            else_body: None,
            ensure: Some(Box::new(fcall("cleanup", vec![]))),
            is_modifier: false,
        })),
        is_while: true,
        eval_condition_first: true,
    });
    // Once cloned at the break, once on the exceptional path.
    assert_eq!(calls_named(&manager, &out.context.instructions, "cleanup"), 2);
    assert!(out
        .context
        .instructions
        .iter()
        .any(|i| matches!(i, Instr::ThrowException { .. })));
}

#[test]
fn ensure_expression_yields_body_value() {
    let (manager, out) = lower(Node::Begin {
        body: Some(Box::new(Node::Fixnum(1))),
        rescue: None,
        else_body: None,
        ensure: Some(Box::new(fcall("track", vec![]))),
        is_modifier: false,
    });
    assert_eq!(calls_named(&manager, &out.context.instructions, "track"), 2);
    assert!(out
        .context
        .instructions
        .iter()
        .any(|i| matches!(i, Instr::Return { value: Operand::Var(_) })));
}

#[test]
fn retry_restores_error_info_and_loops() {
    let (_, out) = lower(Node::Begin {
        body: Some(Box::new(fcall("work", vec![]))),
        rescue: Some(Box::new(RescueClause {
            exceptions: vec![],
            reference: None,
            body: Some(Node::RetryNode { line: 2 }),
            next_clause: None,
            line: 1,
        })),
        else_body: None,
        ensure: None,
        is_modifier: false,
    });
    let instrs = &out.context.instructions;
    assert!(instrs.iter().any(|i| matches!(
        i,
        Instr::RescueEqq { exc_type: Operand::BuiltinClass(BuiltinClass::StandardError), .. }
    )));
    assert!(instrs.iter().any(|i| matches!(i, Instr::ThreadPoll { on_back_edge: true })));
    assert!(instrs.iter().any(|i| matches!(i, Instr::GetGlobalVariable { .. })));
    assert!(instrs.iter().any(|i| matches!(i, Instr::PutGlobalVariable { .. })));
    assert!(out.context.flags.contains(ScopeFlags::HAS_LOOPS));
}

#[test]
fn retry_reenters_protected_body() {
    let (manager, out) = lower(Node::Begin {
        body: Some(Box::new(fcall("work", vec![]))),
        rescue: Some(Box::new(RescueClause {
            exceptions: vec![],
            reference: None,
            body: Some(Node::RetryNode { line: 2 }),
            next_clause: None,
            line: 1,
        })),
        else_body: None,
        ensure: None,
        is_modifier: false,
    });
    let instrs = &out.context.instructions;
    let work = manager.intern("work");
    let body_at = position(instrs, |i| matches!(i, Instr::Call { name, .. } if *name == work));
    let handler_at = position(instrs, |i| matches!(i, Instr::ReceiveRubyException { .. }));
    // The first jump after the poll is the retry itself.
    let poll_at = position(instrs, |i| matches!(i, Instr::ThreadPoll { .. }));
    let target = instrs[poll_at..]
        .iter()
        .find_map(|i| match i {
            Instr::Jump { target } => Some(*target),
            _ => None,
        })
        .expect("no retry jump");
    let reentry_at = position(instrs, |i| matches!(i, Instr::Label { label } if *label == target));
    // Re-entry lands ahead of the protected body, not in the handler.
    assert!(reentry_at < body_at);
    assert!(reentry_at < handler_at);
}

#[test]
fn cheap_modifier_rescue_elides_backtrace() {
    let (_, out) = lower(Node::Begin {
        body: Some(Box::new(fcall("work", vec![]))),
        rescue: Some(Box::new(RescueClause {
            exceptions: vec![],
            reference: None,
            body: Some(Node::Nil),
            next_clause: None,
            line: 0,
        })),
        else_body: None,
        ensure: None,
        is_modifier: true,
    });
    let instrs = &out.context.instructions;
    assert!(instrs.iter().any(|i| matches!(i, Instr::ToggleBacktrace { required: false })));
    assert!(instrs.iter().any(|i| matches!(i, Instr::ToggleBacktrace { required: true })));
}

#[test]
fn typed_rescue_keeps_backtrace() {
    let (_, out) = lower(Node::Begin {
        body: Some(Box::new(fcall("work", vec![]))),
        rescue: Some(Box::new(RescueClause {
            exceptions: vec![Node::ConstRef { name: "ArgumentError".to_owned() }],
            reference: None,
            body: Some(Node::Nil),
            next_clause: None,
            line: 1,
        })),
        else_body: None,
        ensure: None,
        is_modifier: false,
    });
    let instrs = &out.context.instructions;
    assert!(!instrs.iter().any(|i| matches!(i, Instr::ToggleBacktrace { .. })));
    assert_eq!(instrs.iter().filter(|i| matches!(i, Instr::RescueEqq { .. })).count(), 1);
}

#[test]
fn ivar_or_assign_goes_through_definedness() {
    // @a ||= 1
    let (_, out) = lower(Node::OpAsgnOr {
        first: Box::new(Node::InstVar { name: "@a".to_owned() }),
        second: Box::new(Node::InstAsgn {
            name: "@a".to_owned(),
            value: Box::new(Node::Fixnum(1)),
        }),
    });
    let instrs = &out.context.instructions;
    assert!(instrs.iter().any(|i| matches!(i, Instr::GetField { raw_value: true, .. })));
    assert!(instrs.iter().any(|i| matches!(i, Instr::PutField { .. })));
    assert!(instrs.iter().any(|i| matches!(i, Instr::BNil { .. })));
}

#[test]
fn defined_call_is_rescue_protected() {
    let (_, out) = lower(Node::Defined { expr: Box::new(fcall("foo", vec![])) });
    let instrs = &out.context.instructions;
    assert!(instrs.iter().any(|i| matches!(
        i,
        Instr::RuntimeHelperCall { helper: RuntimeHelper::IsDefinedCall, .. }
    )));
    assert!(instrs.iter().any(|i| matches!(i, Instr::ReceiveRubyException { .. })));
    assert!(instrs.iter().any(|i| matches!(i, Instr::InheritanceSearchConst { .. })));
}

#[test]
fn duplicated_when_literal_warns_and_is_skipped() {
    // case x when 1, 2 then a when 1 then b end
    let (manager, out) = lower(Node::Case {
        predicate: Some(Box::new(lvar("x"))),
        arms: vec![
            WhenArm {
                values: vec![Node::Fixnum(1), Node::Fixnum(2)],
                body: Some(fcall("a", vec![])),
                line: 1,
            },
            WhenArm { values: vec![Node::Fixnum(1)], body: Some(fcall("b", vec![])), line: 2 },
        ],
        else_body: None,
        line: 0,
    });
    let warnings = manager.take_warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].message.contains("duplicated when clause"));
    assert_eq!(warnings[0].line, 2);
    // The repeated literal gets no second match test, but the arm body
    // is still lowered.
    let instrs = &out.context.instructions;
    assert_eq!(instrs.iter().filter(|i| matches!(i, Instr::Eqq { .. })).count(), 2);
    assert_eq!(calls_named(&manager, instrs, "b"), 1);
}

#[test]
fn method_receives_every_parameter_kind() {
    let args = MethodArgs {
        pre: vec!["a".to_owned()],
        opt: vec![("b".to_owned(), Node::Fixnum(1))],
        rest: Some(Some("r".to_owned())),
        kwargs: vec![("k".to_owned(), None)],
        kwrest: Some(Some("kw".to_owned())),
        block: Some("blk".to_owned()),
    };
    let (manager, out) = lower(def_m(args, Node::Nil));
    let method = defined_method(&out.context.instructions);
    let body = manager.context_instructions(method).expect("method context");
    assert!(body.iter().any(|i| matches!(i, Instr::ReceiveArg { index: 0, .. })));
    assert!(body.iter().any(|i| matches!(i, Instr::ReceiveOptArg { index: 1, .. })));
    assert!(body.iter().any(|i| matches!(i, Instr::ReceiveRestArg { index: 2, .. })));
    assert!(body.iter().any(|i| matches!(i, Instr::ReceiveKeywordArg { .. })));
    assert!(body.iter().any(|i| matches!(i, Instr::ReceiveKeywordRestArg { .. })));
    assert!(body.iter().any(|i| matches!(i, Instr::ReifyClosure { .. })));
    // Required keyword with no default raises when absent.
    assert_eq!(calls_named(&manager, &body, "raise"), 1);
    assert!(manager.flags(method).contains(ScopeFlags::RECEIVES_KEYWORD_ARGS));

    let kinds: Vec<ArgumentKind> = manager
        .with_scope(method, |s| s.argument_descriptors.clone())
        .into_iter()
        .map(|d| d.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            ArgumentKind::Required,
            ArgumentKind::Optional,
            ArgumentKind::Rest,
            ArgumentKind::KeywordRequired,
            ArgumentKind::KeywordRest,
            ArgumentKind::Block,
        ]
    );
}

#[test]
fn method_prologue_resolves_defining_module() {
    let (manager, out) = lower(def_m(MethodArgs::required(&["a"]), Node::at(1, lvar("a"))));
    let method = defined_method(&out.context.instructions);
    let body = manager.context_instructions(method).expect("method context");
    assert!(matches!(body[0], Instr::ReceiveSelf));
    assert!(matches!(body[1], Instr::LoadImplicitClosure { .. }));
    assert!(matches!(body[2], Instr::Copy { src: Operand::ScopeModule(1), .. }));
    // The definition expression itself evaluates to the method name.
    let m = manager.intern("m");
    assert!(out
        .context
        .instructions
        .iter()
        .any(|i| matches!(i, Instr::Return { value: Operand::Symbol(s) } if *s == m)));
}

#[test]
fn return_in_block_unwinds_to_method() {
    let body = fcall_iter(
        "each",
        Node::Iter {
            args: vec![],
            body: Some(Box::new(Node::ReturnNode {
                value: Some(Box::new(Node::Fixnum(1))),
                line: 1,
            })),
            line: 0,
            end_line: 2,
        },
    );
    let (manager, out) = lower(def_m(MethodArgs::default(), body));
    let method = defined_method(&out.context.instructions);
    let closure = manager.closures(method)[0];
    let closure_body = manager.context_instructions(closure).expect("closure context");

    assert!(closure_body
        .iter()
        .any(|i| matches!(i, Instr::CheckForLJE { defined_within_method: true })));
    let m = manager.intern("m");
    assert!(closure_body.iter().any(|i| matches!(
        i,
        Instr::NonlocalReturn { value: Operand::Fixnum(1), method_name: Some(s) } if *s == m
    )));
    assert!(manager.flags(closure).contains(ScopeFlags::HAS_NONLOCAL_RETURNS));

    let method_body = manager.context_instructions(method).expect("method context");
    assert!(method_body.iter().any(|i| matches!(
        i,
        Instr::RuntimeHelperCall { helper: RuntimeHelper::HandleNonlocalReturn, .. }
    )));
    assert!(manager.flags(method).contains(ScopeFlags::CAN_RECEIVE_NONLOCAL_RETURNS));
}

#[test]
fn break_in_block_wraps_call_site() {
    let (manager, out) = lower(Node::Call {
        receiver: Box::new(lvar("xs")),
        name: "each".to_owned(),
        args: vec![],
        iter: Some(Box::new(Node::Iter {
            args: vec![],
            body: Some(Box::new(Node::BreakNode { value: None, line: 1 })),
            line: 0,
            end_line: 2,
        })),
        line: 0,
        newline: true,
    });
    let closure = manager.closures(out.scope)[0];
    assert!(manager.flags(closure).contains(ScopeFlags::HAS_BREAK_INSTRS));
    let closure_body = manager.context_instructions(closure).expect("closure context");
    assert!(closure_body
        .iter()
        .any(|i| matches!(i, Instr::Break { scope, .. } if *scope == out.scope)));

    assert!(out.context.instructions.iter().any(|i| matches!(
        i,
        Instr::RuntimeHelperCall { helper: RuntimeHelper::HandlePropagatedBreak, .. }
    )));
    assert!(out.context.flags.contains(ScopeFlags::CAN_RECEIVE_BREAKS));
}

#[test]
fn lambda_installs_unwind_handler() {
    let (manager, out) = lower(Node::LambdaNode {
        args: vec![],
        body: Some(Box::new(fcall("x", vec![]))),
        line: 0,
        end_line: 1,
    });
    assert!(out
        .context
        .instructions
        .iter()
        .any(|i| matches!(i, Instr::BuildLambda { .. })));
    let closure = manager.closures(out.scope)[0];
    let body = manager.context_instructions(closure).expect("lambda context");
    assert!(matches!(
        body[0],
        Instr::ExceptionRegionStart { rescuer: Label::GLOBAL_ENSURE }
    ));
    assert!(body.iter().any(|i| matches!(
        i,
        Instr::RuntimeHelperCall { helper: RuntimeHelper::HandleBreakAndReturnsInLambda, .. }
    )));
    assert!(body.iter().any(|i| matches!(i, Instr::ReturnOrRethrowSavedExc { .. })));
}

#[test]
fn zsuper_replays_method_receives() {
    let args = MethodArgs {
        pre: vec!["a".to_owned()],
        rest: Some(Some("r".to_owned())),
        ..Default::default()
    };
    let (manager, out) = lower(def_m(args, Node::ZSuperNode { iter: None, line: 1 }));
    let method = defined_method(&out.context.instructions);
    let body = manager.context_instructions(method).expect("method context");
    let a = manager.intern("a");
    let r = manager.intern("r");
    let zsuper_args = body
        .iter()
        .find_map(|i| match i {
            Instr::ZSuper { args, .. } => Some(args.clone()),
            _ => None,
        })
        .expect("no zsuper emitted");
    assert_eq!(
        zsuper_args,
        vec![
            Operand::Var(Variable::Local(LocalVar { name: a, depth: 0 })),
            Operand::Splat(Box::new(Operand::Var(Variable::Local(LocalVar {
                name: r,
                depth: 0
            })))),
        ]
    );
}

#[test]
fn zsuper_in_block_restamps_depth() {
    let body = fcall_iter(
        "each",
        Node::Iter {
            args: vec![],
            body: Some(Box::new(Node::ZSuperNode { iter: None, line: 1 })),
            line: 0,
            end_line: 2,
        },
    );
    let (manager, out) = lower(def_m(MethodArgs::required(&["a"]), body));
    let method = defined_method(&out.context.instructions);
    let closure = manager.closures(method)[0];
    let closure_body = manager.context_instructions(closure).expect("closure context");
    let a = manager.intern("a");
    let zsuper_args = closure_body
        .iter()
        .find_map(|i| match i {
            Instr::ZSuper { args, .. } => Some(args.clone()),
            _ => None,
        })
        .expect("no zsuper emitted");
    assert_eq!(
        zsuper_args,
        vec![Operand::Var(Variable::Local(LocalVar { name: a, depth: 1 }))]
    );
}

#[test]
fn zsuper_without_method_frame_raises() {
    let (manager, out) = lower(Node::ZSuperNode { iter: None, line: 0 });
    assert!(out.context.flags.contains(ScopeFlags::USES_ZSUPER));
    assert_eq!(calls_named(&manager, &out.context.instructions, "raise"), 1);
    assert!(!out
        .context
        .instructions
        .iter()
        .any(|i| matches!(i, Instr::ZSuper { .. })));
}

#[test]
fn super_in_class_method_resolves_statically() {
    let (manager, out) = lower(Node::ClassNode {
        name: "C".to_owned(),
        container: None,
        superclass: None,
        body: Some(Box::new(def_m(
            MethodArgs::default(),
            Node::SuperNode { args: vec![], iter: None, line: 1, newline: false },
        ))),
        line: 0,
        end_line: 3,
    });
    let class_body = out
        .context
        .instructions
        .iter()
        .find_map(|i| match i {
            Instr::DefineClass { body, .. } => Some(*body),
            _ => None,
        })
        .expect("no class definition");
    assert_eq!(manager.kind(class_body), ScopeKind::ClassBody);
    let class_instrs = manager.context_instructions(class_body).expect("class context");
    let method = defined_method(&class_instrs);
    let m = manager.intern("m");
    let method_body = manager.context_instructions(method).expect("method context");
    assert!(method_body
        .iter()
        .any(|i| matches!(i, Instr::InstanceSuper { name, .. } if *name == m)));
}

#[test]
fn script_super_stays_unresolved() {
    let (_, out) = lower(Node::SuperNode { args: vec![], iter: None, line: 0, newline: false });
    assert!(out
        .context
        .instructions
        .iter()
        .any(|i| matches!(i, Instr::UnresolvedSuper { receiver: Operand::SelfObj, .. })));
}

#[test]
fn super_without_block_forwards_frame_closure() {
    let (manager, out) = lower(def_m(
        MethodArgs::default(),
        Node::SuperNode { args: vec![], iter: None, line: 1, newline: false },
    ));
    let method = defined_method(&out.context.instructions);
    let body = manager.context_instructions(method).expect("method context");
    let loaded = body
        .iter()
        .find_map(|i| match i {
            Instr::LoadImplicitClosure { dst } => Some(*dst),
            _ => None,
        })
        .expect("no implicit closure load");
    // The block slot is the same variable the prologue loaded into.
    assert!(body.iter().any(
        |i| matches!(i, Instr::UnresolvedSuper { block: Operand::Var(b), .. } if *b == loaded)
    ));
}

#[test]
fn keyword_rest_super_branches_on_empty_hash() {
    // def m(**h); super(**h); end
    let args = MethodArgs { kwrest: Some(Some("h".to_owned())), ..Default::default() };
    let body = Node::SuperNode {
        args: vec![Node::HashLit { pairs: vec![(None, lvar("h"))], brace: false }],
        iter: None,
        line: 1,
        newline: false,
    };
    let (manager, out) = lower(def_m(args, body));
    let method = defined_method(&out.context.instructions);
    let instrs = manager.context_instructions(method).expect("method context");
    assert!(instrs.iter().any(|i| matches!(
        i,
        Instr::RuntimeHelperCall { helper: RuntimeHelper::IsHashEmpty, .. }
    )));
    let supers: Vec<&Instr> = instrs
        .iter()
        .filter(|i| matches!(i, Instr::UnresolvedSuper { .. }))
        .collect();
    assert_eq!(supers.len(), 2);
    match (supers[0], supers[1]) {
        (
            Instr::UnresolvedSuper { args: trimmed, flags: f0, .. },
            Instr::UnresolvedSuper { args: full, flags: f1, .. },
        ) => {
            assert!(trimmed.is_empty());
            assert_eq!(full.len(), 1);
            assert!(f0 & CALL_KEYWORD_REST != 0);
            assert!(f1 & CALL_KEYWORD_REST != 0);
        }
        _ => unreachable!(),
    }
}

#[test]
fn keyword_rest_call_branches_on_empty_hash() {
    // f(**h)
    let (manager, out) = lower(fcall(
        "f",
        vec![Node::HashLit { pairs: vec![(None, lvar("h"))], brace: false }],
    ));
    let instrs = &out.context.instructions;
    assert!(instrs.iter().any(|i| matches!(
        i,
        Instr::RuntimeHelperCall { helper: RuntimeHelper::IsHashEmpty, .. }
    )));
    assert!(instrs
        .iter()
        .any(|i| matches!(i, Instr::BNE { test: Operand::True, .. })));

    let f = manager.intern("f");
    let f_calls: Vec<&Instr> = instrs
        .iter()
        .filter(|i| matches!(i, Instr::Call { name, .. } if *name == f))
        .collect();
    assert_eq!(f_calls.len(), 2);
    match (f_calls[0], f_calls[1]) {
        (
            Instr::Call { args: trimmed, flags: f0, .. },
            Instr::Call { args: full, flags: f1, .. },
        ) => {
            assert!(trimmed.is_empty());
            assert_eq!(full.len(), 1);
            assert!(f0 & CALL_KEYWORD_REST != 0);
            assert!(f1 & CALL_KEYWORD_REST != 0);
        }
        _ => unreachable!(),
    }
}

#[test]
fn trailing_braceless_hash_is_keyword_call() {
    // f(k: 2)
    let (manager, out) = lower(fcall(
        "f",
        vec![Node::HashLit {
            pairs: vec![(Some(Node::SymLit("k".to_owned())), Node::Fixnum(2))],
            brace: false,
        }],
    ));
    let f = manager.intern("f");
    let k = manager.intern("k");
    let call = out
        .context
        .instructions
        .iter()
        .find(|i| matches!(i, Instr::Call { name, .. } if *name == f))
        .expect("no call emitted");
    match call {
        Instr::Call { args, flags, .. } => {
            assert!(flags & CALL_KEYWORD != 0);
            assert!(flags & CALL_KEYWORD_REST == 0);
            assert_eq!(
                args.last(),
                Some(&Operand::Hash(vec![(Operand::Symbol(k), Operand::Fixnum(2))]))
            );
        }
        _ => unreachable!(),
    }
}

#[test]
fn for_body_shares_host_variables() {
    let (manager, out) = lower(Node::ForNode {
        iterable: Box::new(lvar("xs")),
        variable: Box::new(lvar("i")),
        body: Some(Box::new(fcall("work", vec![]))),
        line: 0,
        end_line: 2,
    });
    let each = manager.intern("each");
    let block = out
        .context
        .instructions
        .iter()
        .find_map(|i| match i {
            Instr::Call { name, block, .. } if *name == each => Some(block.clone()),
            _ => None,
        })
        .expect("no each call");
    let body_scope = match block {
        Operand::Closure(id) => id,
        other => panic!("for body should be a closure, got {other:?}"),
    };
    assert_eq!(manager.kind(body_scope), ScopeKind::For);
    let body = manager.context_instructions(body_scope).expect("for-body context");
    // The iteration variable arrives before the current module is set up.
    let receive = position(&body, |i| matches!(i, Instr::ReceiveArg { index: 0, .. }));
    let module = position(&body, |i| {
        matches!(i, Instr::Copy { src: Operand::ScopeModule(0), .. })
    });
    assert!(receive < module);
    assert!(!body.iter().any(|i| matches!(i, Instr::ExceptionRegionStart { .. })));
}

#[test]
fn begin_block_runs_before_main_body() {
    let (manager, out) = lower(Node::Statements(vec![
        Node::at(0, fcall("main", vec![])),
        Node::PreExe { body: Some(Box::new(Node::at(1, fcall("early", vec![])))) },
    ]));
    let early = manager.intern("early");
    let main = manager.intern("main");
    let instrs = &out.context.instructions;
    let early_at = position(instrs, |i| matches!(i, Instr::Call { name, .. } if *name == early));
    let main_at = position(instrs, |i| matches!(i, Instr::Call { name, .. } if *name == main));
    assert!(early_at < main_at);
}

#[test]
fn end_block_is_recorded_for_shutdown() {
    let (manager, out) = lower(Node::PostExe {
        body: Some(Box::new(fcall("shutdown", vec![]))),
        line: 0,
    });
    let closure = out
        .context
        .instructions
        .iter()
        .find_map(|i| match i {
            Instr::RecordEndBlock { closure: Operand::Closure(id) } => Some(*id),
            _ => None,
        })
        .expect("no end block recorded");
    assert!(manager.with_scope(closure, |s| s.is_end_block));
    let body = manager.context_instructions(closure).expect("end-block context");
    assert_eq!(calls_named(&manager, &body, "shutdown"), 1);
    assert!(matches!(body.last(), Some(Instr::Return { value: Operand::Nil })));
}

#[test]
fn end_block_in_method_warns() {
    let (manager, _) = lower(def_m(
        MethodArgs::default(),
        Node::PostExe { body: None, line: 1 },
    ));
    let warnings = manager.take_warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].message.contains("at_exit"));
}

#[test]
fn return_inside_end_block_raises() {
    let (manager, out) = lower(Node::PostExe {
        body: Some(Box::new(Node::ReturnNode { value: None, line: 1 })),
        line: 0,
    });
    let closure = manager.closures(out.scope)[0];
    let body = manager.context_instructions(closure).expect("end-block context");
    assert!(body.iter().any(|i| matches!(i, Instr::ThrowException { .. })));
    assert!(!body.iter().any(|i| matches!(i, Instr::NonlocalReturn { .. })));
}

#[test]
fn misplaced_jumps_are_syntax_errors() {
    match lower_err(Node::BreakNode { value: None, line: 5 }) {
        BuildError::Syntax { file, line, message } => {
            assert_eq!(file, "t.rb");
            assert_eq!(line, 5);
            assert_eq!(message, "Invalid break");
        }
    }
    match lower_err(Node::RetryNode { line: 0 }) {
        BuildError::Syntax { message, .. } => assert_eq!(message, "Invalid retry"),
    }

    let manager = IrManager::new();
    let host = build_script(&manager, &BuildOptions::default(), &parse(None))
        .expect("script should build");
    let eval_parse = ParseResult {
        file: "(eval)".to_owned(),
        line: 0,
        coverage_mode: CoverageMode::None,
        dialect: TreeDialect::Prism,
        body: Some(Node::RedoNode { line: 3 }),
    };
    let err = build_eval(
        &manager,
        &BuildOptions::default(),
        &eval_parse,
        EvalType::Plain,
        host.scope,
    )
    .expect_err("redo in eval should fail");
    match err {
        BuildError::Syntax { message, .. } => {
            assert_eq!(message, "Can't escape from eval with redo");
        }
    }
}

#[test]
fn orphan_block_is_a_syntax_error() {
    let err = lower_err(Node::Iter { args: vec![], body: None, line: 2, end_line: 3 });
    match err {
        BuildError::Syntax { message, .. } => {
            assert_eq!(message, "block given without a call to receive it");
        }
    }
}

#[test]
fn metaclass_body_forwards_frame_block() {
    let (_, out) = lower(Node::SClass {
        receiver: Box::new(Node::SelfNode),
        body: Some(Box::new(fcall("x", vec![]))),
        line: 0,
        end_line: 2,
    });
    let instrs = &out.context.instructions;
    assert!(instrs.iter().any(|i| matches!(i, Instr::DefineMetaClass { .. })));
    let loaded = instrs
        .iter()
        .find_map(|i| match i {
            Instr::LoadFrameClosure { dst } => Some(*dst),
            _ => None,
        })
        .expect("no frame closure load");
    assert!(instrs.iter().any(
        |i| matches!(i, Instr::ProcessModuleBody { block: Operand::Var(b), .. } if *b == loaded)
    ));
}

#[test]
fn errors_inside_guarded_regions_propagate() {
    // retry is only legal inside a rescue handler; here it sits in the
    // protected body and in a loop body.
    let err = lower_err(Node::Begin {
        body: Some(Box::new(Node::RetryNode { line: 3 })),
        rescue: None,
        else_body: None,
        ensure: Some(Box::new(fcall("cleanup", vec![]))),
        is_modifier: false,
    });
    match err {
        BuildError::Syntax { line, message, .. } => {
            assert_eq!(line, 3);
            assert_eq!(message, "Invalid retry");
        }
    }
    let err = lower_err(Node::Begin {
        body: Some(Box::new(Node::RetryNode { line: 4 })),
        rescue: Some(Box::new(RescueClause {
            exceptions: vec![],
            reference: None,
            body: Some(Node::Nil),
            next_clause: None,
            line: 1,
        })),
        else_body: None,
        ensure: None,
        is_modifier: false,
    });
    match err {
        BuildError::Syntax { message, .. } => assert_eq!(message, "Invalid retry"),
    }
    let err = lower_err(Node::ConditionalLoop {
        condition: Box::new(lvar("x")),
        body: Some(Box::new(Node::RetryNode { line: 5 })),
        is_while: true,
        eval_condition_first: true,
    });
    match err {
        BuildError::Syntax { message, .. } => assert_eq!(message, "Invalid retry"),
    }
}

#[test]
fn class_body_builds_like_a_frame() {
    let (manager, out) = lower(Node::ClassNode {
        name: "C".to_owned(),
        container: None,
        superclass: None,
        body: Some(Box::new(fcall("body_work", vec![]))),
        line: 0,
        end_line: 2,
    });
    let instrs = &out.context.instructions;
    let body_scope = instrs
        .iter()
        .find_map(|i| match i {
            Instr::DefineClass { body, superclass, .. } => {
                assert_eq!(*superclass, Operand::Nil);
                Some(*body)
            }
            _ => None,
        })
        .expect("no class definition");
    assert!(instrs.iter().any(|i| matches!(i, Instr::ProcessModuleBody { .. })));
    let body = manager.context_instructions(body_scope).expect("class context");
    assert!(matches!(body[0], Instr::ReceiveSelf));
    assert_eq!(calls_named(&manager, &body, "body_work"), 1);
    assert!(matches!(body.last(), Some(Instr::Return { .. })));
}
