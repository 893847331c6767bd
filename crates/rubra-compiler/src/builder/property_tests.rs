//! Property-based tests over generated jump-free trees.
//!
//! Checks structural invariants every lowered scope must satisfy: label
//! hygiene, balanced exception regions, and computed flags.

use proptest::prelude::*;

use rubra_ir::{CoverageMode, Instr, IrManager, Label, ScopeFlags, ScopeId};

use crate::ast::{Node, ParseResult, RescueClause, TreeDialect};
use crate::{build_script, BuildOptions};

fn arb_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,2}"
}

fn arb_node() -> impl Strategy<Value = Node> {
    let leaf = prop_oneof![
        Just(Node::Nil),
        Just(Node::True),
        Just(Node::False),
        Just(Node::SelfNode),
        (-1000i64..1000).prop_map(Node::Fixnum),
        arb_name().prop_map(|name| Node::LocalVar { name, depth: 0 }),
        arb_name().prop_map(|name| Node::SymLit(name)),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone())
                .prop_map(|(a, b)| Node::Statements(vec![a, b])),
            (arb_name(), inner.clone()).prop_map(|(name, value)| Node::LocalAsgn {
                name,
                depth: 0,
                value: Box::new(value),
            }),
            (inner.clone(), inner.clone(), inner.clone()).prop_map(|(p, t, e)| Node::If {
                predicate: Box::new(p),
                then_body: Some(Box::new(t)),
                else_body: Some(Box::new(e)),
            }),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Node::And {
                left: Box::new(a),
                right: Box::new(b),
            }),
            (inner.clone(), inner.clone()).prop_map(|(c, b)| Node::ConditionalLoop {
                condition: Box::new(c),
                body: Some(Box::new(b)),
                is_while: true,
                eval_condition_first: true,
            }),
            (inner.clone(), inner.clone()).prop_map(|(body, ensure)| Node::Begin {
                body: Some(Box::new(body)),
                rescue: None,
                else_body: None,
                ensure: Some(Box::new(ensure)),
                is_modifier: false,
            }),
            (inner.clone(), inner.clone()).prop_map(|(body, handler)| Node::Begin {
                body: Some(Box::new(body)),
                rescue: Some(Box::new(RescueClause {
                    exceptions: vec![],
                    reference: None,
                    body: Some(handler),
                    next_clause: None,
                    line: 0,
                })),
                else_body: None,
                ensure: None,
                is_modifier: false,
            }),
            (arb_name(), prop::collection::vec(inner.clone(), 0..3)).prop_map(
                |(name, args)| Node::FCall { name, args, iter: None, line: 0, newline: true }
            ),
            inner.clone().prop_map(|body| Node::Def {
                name: "m".to_owned(),
                receiver: None,
                args: Default::default(),
                body: Some(Box::new(body)),
                line: 0,
                end_line: 1,
            }),
            inner.prop_map(|body| Node::FCall {
                name: "each".to_owned(),
                args: vec![],
                iter: Some(Box::new(Node::Iter {
                    args: vec![],
                    body: Some(Box::new(body)),
                    line: 0,
                    end_line: 1,
                })),
                line: 0,
                newline: false,
            }),
        ]
    })
}

fn lower(body: Node) -> IrManager {
    let manager = IrManager::new();
    let parse = ParseResult {
        file: "p.rb".to_owned(),
        line: 0,
        coverage_mode: CoverageMode::Line,
        dialect: TreeDialect::Prism,
        body: Some(body),
    };
    build_script(&manager, &BuildOptions::default(), &parse)
        .expect("jump-free trees always lower");
    manager
}

fn referenced_labels(instr: &Instr) -> Option<Label> {
    match instr {
        Instr::Jump { target }
        | Instr::BTrue { target, .. }
        | Instr::BFalse { target, .. }
        | Instr::BNil { target, .. }
        | Instr::BUndef { target, .. }
        | Instr::BNE { target, .. } => Some(*target),
        Instr::ExceptionRegionStart { rescuer } => Some(*rescuer),
        _ => None,
    }
}

fn all_contexts(manager: &IrManager) -> Vec<(ScopeId, Vec<Instr>)> {
    (0..manager.scope_count())
        .map(|i| {
            let id = ScopeId(i as u32);
            let instrs = manager.context_instructions(id).expect("every scope is finished");
            (id, instrs)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn labels_are_defined_once_and_targets_resolve(body in arb_node()) {
        let manager = lower(body);
        for (id, instrs) in all_contexts(&manager) {
            let mut defined = std::collections::HashSet::new();
            for instr in &instrs {
                if let Instr::Label { label } = instr {
                    prop_assert!(
                        defined.insert(*label),
                        "label {label:?} defined twice in scope {id:?}"
                    );
                }
            }
            for instr in &instrs {
                if let Some(label) = referenced_labels(instr) {
                    if label == Label::UNRESCUED_REGION || label == Label::GLOBAL_ENSURE {
                        continue;
                    }
                    prop_assert!(
                        defined.contains(&label),
                        "label {label:?} referenced but never defined in scope {id:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn exception_regions_balance(body in arb_node()) {
        let manager = lower(body);
        for (id, instrs) in all_contexts(&manager) {
            let mut depth: i64 = 0;
            for instr in &instrs {
                match instr {
                    Instr::ExceptionRegionStart { .. } => depth += 1,
                    Instr::ExceptionRegionEnd => {
                        depth -= 1;
                        prop_assert!(depth >= 0, "region end without start in scope {id:?}");
                    }
                    _ => {}
                }
            }
            prop_assert_eq!(depth, 0, "unclosed exception region in scope {:?}", id);
        }
    }

    #[test]
    fn every_scope_gets_computed_flags(body in arb_node()) {
        let manager = lower(body);
        for i in 0..manager.scope_count() {
            let id = ScopeId(i as u32);
            prop_assert!(
                manager.flags(id).contains(ScopeFlags::FLAGS_COMPUTED),
                "scope {id:?} finished without flag inference"
            );
        }
    }

    #[test]
    fn lowering_is_deterministic(body in arb_node()) {
        let first = lower(body.clone());
        let second = lower(body);
        prop_assert_eq!(first.scope_count(), second.scope_count());
        for i in 0..first.scope_count() {
            let id = ScopeId(i as u32);
            prop_assert_eq!(
                first.context_instructions(id),
                second.context_instructions(id),
                "scope {:?} lowered differently across runs",
                id
            );
        }
    }
}
