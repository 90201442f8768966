//! Scenario tests: build small typed programs, lower them, and check both
//! the shape of the block graph and the observable behavior under the
//! reference evaluator.

use pretty_assertions::assert_eq;

use quill_core::ast::{
    AstModule, BinaryOp, ContractKind, Expr, ExprKind, FunctionDef, Param, ReduceKind, Stmt,
    StmtKind, Ty as AstTy, UnaryOp,
};
use quill_core::error::Error;
use quill_core::ir::{
    CastKind, DebugLoc, Function, InstKind, Module, ModuleDebugInfo, Signature, Terminator, Ty,
    UnOp, Value,
};
use quill_core::span::Span;

use crate::eval::{EvalValue, Evaluator, Outcome};

use super::*;

fn expr(kind: ExprKind, ty: AstTy) -> Expr {
    Expr {
        kind,
        ty,
        span: Span::default(),
    }
}

fn int_lit(value: i64) -> Expr {
    expr(ExprKind::IntLit(value), AstTy::I64)
}

fn int32_lit(value: i64) -> Expr {
    expr(ExprKind::IntLit(value), AstTy::I32)
}

fn float_lit(value: f64) -> Expr {
    expr(ExprKind::FloatLit(value), AstTy::F64)
}

fn bool_lit(value: bool) -> Expr {
    expr(ExprKind::BoolLit(value), AstTy::I1)
}

fn var(name: &str, ty: AstTy) -> Expr {
    expr(ExprKind::Var(name.to_string()), ty)
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr, ty: AstTy) -> Expr {
    expr(
        ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        ty,
    )
}

fn unary(op: UnaryOp, operand: Expr, ty: AstTy) -> Expr {
    expr(
        ExprKind::Unary {
            op,
            operand: Box::new(operand),
        },
        ty,
    )
}

fn ternary(cond: Expr, then_val: Expr, else_val: Expr, ty: AstTy) -> Expr {
    expr(
        ExprKind::Ternary {
            cond: Box::new(cond),
            then_val: Box::new(then_val),
            else_val: Box::new(else_val),
        },
        ty,
    )
}

fn call(callee: &str, args: Vec<Expr>, ty: AstTy) -> Expr {
    expr(
        ExprKind::Call {
            callee: callee.to_string(),
            type_args: Vec::new(),
            args,
        },
        ty,
    )
}

fn generic_call(callee: &str, type_args: Vec<AstTy>, args: Vec<Expr>, ty: AstTy) -> Expr {
    expr(
        ExprKind::Call {
            callee: callee.to_string(),
            type_args,
            args,
        },
        ty,
    )
}

fn cast(value: Expr, ty: AstTy) -> Expr {
    expr(
        ExprKind::Cast {
            value: Box::new(value),
        },
        ty,
    )
}

fn vector_i64(values: &[i64]) -> Expr {
    let lanes = values.len() as u32;
    expr(
        ExprKind::VectorLit(values.iter().copied().map(int_lit).collect()),
        AstTy::vector(AstTy::I64, lanes),
    )
}

fn reduce_add(vector: Expr) -> Expr {
    expr(
        ExprKind::Reduce {
            kind: ReduceKind::Add,
            vector: Box::new(vector),
            seed: None,
        },
        AstTy::I64,
    )
}

fn stmt(kind: StmtKind) -> Stmt {
    Stmt {
        kind,
        span: Span::default(),
    }
}

fn ret(value: Expr) -> Stmt {
    stmt(StmtKind::Return(Some(value)))
}

fn let_stmt(name: &str, ty: AstTy, init: Expr) -> Stmt {
    stmt(StmtKind::Let {
        name: name.to_string(),
        ty,
        init,
    })
}

fn assign(name: &str, value: Expr) -> Stmt {
    stmt(StmtKind::Assign {
        name: name.to_string(),
        value,
    })
}

fn expr_stmt(value: Expr) -> Stmt {
    stmt(StmtKind::Expr(value))
}

fn if_stmt(cond: Expr, then_body: Vec<Stmt>, else_body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::If {
        cond,
        then_body,
        else_body,
    })
}

fn while_stmt(cond: Expr, body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::While { cond, body })
}

fn break_stmt() -> Stmt {
    stmt(StmtKind::Break)
}

fn continue_stmt() -> Stmt {
    stmt(StmtKind::Continue)
}

fn panic_stmt(message: &str) -> Stmt {
    stmt(StmtKind::Panic {
        message: message.to_string(),
    })
}

fn require_stmt(cond: Expr, message: &str) -> Stmt {
    stmt(StmtKind::Contract {
        kind: ContractKind::Requires,
        cond,
        message: message.to_string(),
    })
}

fn param(name: &str, ty: AstTy) -> Param {
    Param {
        name: name.to_string(),
        ty,
        mutated: false,
    }
}

fn mutated_param(name: &str, ty: AstTy) -> Param {
    Param {
        name: name.to_string(),
        ty,
        mutated: true,
    }
}

fn function(name: &str, params: Vec<Param>, ret: AstTy, body: Vec<Stmt>) -> FunctionDef {
    FunctionDef {
        name: name.to_string(),
        generics: Vec::new(),
        params,
        ret,
        body,
        span: Span::default(),
    }
}

fn generic_function(
    name: &str,
    generics: &[&str],
    params: Vec<Param>,
    ret: AstTy,
    body: Vec<Stmt>,
) -> FunctionDef {
    FunctionDef {
        name: name.to_string(),
        generics: generics.iter().map(|g| g.to_string()).collect(),
        params,
        ret,
        body,
        span: Span::default(),
    }
}

fn tparam(name: &str) -> AstTy {
    AstTy::Param(name.to_string())
}

fn identity_template() -> FunctionDef {
    generic_function(
        "identity",
        &["T"],
        vec![param("x", tparam("T"))],
        tparam("T"),
        vec![ret(var("x", tparam("T")))],
    )
}

fn ast_module(functions: Vec<FunctionDef>) -> AstModule {
    let mut module = AstModule::new("test");
    module.functions = functions;
    module
}

fn lower(functions: Vec<FunctionDef>) -> Module {
    lower_module(&ast_module(functions), LowerOptions::default())
        .expect("lowering should succeed")
}

fn lower_err(functions: Vec<FunctionDef>) -> Error {
    match lower_module(&ast_module(functions), LowerOptions::default()) {
        Ok(_) => panic!("lowering should have failed"),
        Err(err) => err,
    }
}

fn labels(function: &Function) -> Vec<&str> {
    function.blocks.iter().map(|b| b.label.as_str()).collect()
}

fn called(function: &Function) -> Vec<String> {
    function
        .blocks
        .iter()
        .flat_map(|b| &b.instructions)
        .filter_map(|inst| match &inst.kind {
            InstKind::Call { callee, .. } => Some(callee.clone()),
            _ => None,
        })
        .collect()
}

fn eval_int(module: &Module, name: &str, args: &[i64]) -> i64 {
    let args: Vec<EvalValue> = args.iter().copied().map(EvalValue::Int).collect();
    let mut evaluator = Evaluator::new(module);
    match evaluator
        .call(name, &args)
        .expect("evaluation should succeed")
    {
        Outcome::Return(value) => value.as_int().expect("integer result"),
        Outcome::Exit(code) => panic!("unexpected exit with code {}", code),
    }
}

#[test]
fn ternary_merges_through_a_phi() {
    let module = lower(vec![function(
        "max",
        vec![param("a", AstTy::I64), param("b", AstTy::I64)],
        AstTy::I64,
        vec![ret(ternary(
            binary(
                BinaryOp::Gt,
                var("a", AstTy::I64),
                var("b", AstTy::I64),
                AstTy::I1,
            ),
            var("a", AstTy::I64),
            var("b", AstTy::I64),
            AstTy::I64,
        ))],
    )]);
    let max = module.function("max").unwrap();
    assert_eq!(labels(max), vec!["entry", "then", "else", "merge"]);
    let merge = max.block_by_label("merge").unwrap();
    assert_eq!(merge.phi_count(), 1);
    match &merge.instructions[0].kind {
        InstKind::Phi { incoming } => {
            assert_eq!(
                incoming,
                &vec![
                    (Value::Temp { id: 0, ty: Ty::I64 }, 1),
                    (Value::Temp { id: 1, ty: Ty::I64 }, 2),
                ]
            );
        }
        other => panic!("expected a phi, got {:?}", other),
    }
    assert_eq!(eval_int(&module, "max", &[7, 3]), 7);
    assert_eq!(eval_int(&module, "max", &[2, 9]), 9);
}

#[test]
fn ternary_arms_must_agree_on_type() {
    let err = lower_err(vec![function(
        "broken",
        vec![],
        AstTy::I64,
        vec![ret(ternary(
            bool_lit(true),
            int_lit(1),
            float_lit(2.0),
            AstTy::I64,
        ))],
    )]);
    assert!(matches!(err.root(), Error::TypeMismatch { .. }));
}

#[test]
fn void_ternary_keeps_the_join_block() {
    let module = lower(vec![
        function("tick", vec![], AstTy::Void, vec![]),
        function("tock", vec![], AstTy::Void, vec![]),
        function(
            "choose",
            vec![param("flag", AstTy::I1)],
            AstTy::Void,
            vec![expr_stmt(ternary(
                var("flag", AstTy::I1),
                call("tick", vec![], AstTy::Void),
                call("tock", vec![], AstTy::Void),
                AstTy::Void,
            ))],
        ),
    ]);
    let choose = module.function("choose").unwrap();
    let merge = choose.block_by_label("merge").unwrap();
    assert_eq!(merge.phi_count(), 1);
    assert_eq!(merge.instructions[0].ty, Ty::I64);
    match &merge.instructions[0].kind {
        InstKind::Phi { incoming } => {
            for (value, _) in incoming {
                assert_eq!(*value, Value::i64(0));
            }
        }
        other => panic!("expected a phi, got {:?}", other),
    }
    let mut evaluator = Evaluator::new(&module);
    let outcome = evaluator
        .call("choose", &[EvalValue::Int(1)])
        .expect("evaluation should succeed");
    assert_eq!(outcome, Outcome::Return(EvalValue::Unit));
}

#[test]
fn statement_if_reloads_locals_instead_of_phis() {
    let module = lower(vec![function(
        "pick",
        vec![param("flag", AstTy::I1)],
        AstTy::I64,
        vec![
            let_stmt("r", AstTy::I64, int_lit(0)),
            if_stmt(
                var("flag", AstTy::I1),
                vec![assign("r", int_lit(1))],
                vec![assign("r", int_lit(2))],
            ),
            ret(var("r", AstTy::I64)),
        ],
    )]);
    let pick = module.function("pick").unwrap();
    let merge = pick.block_by_label("merge").unwrap();
    assert_eq!(merge.phi_count(), 0);
    assert!(matches!(merge.instructions[0].kind, InstKind::Load { .. }));
    assert_eq!(eval_int(&module, "pick", &[1]), 1);
    assert_eq!(eval_int(&module, "pick", &[0]), 2);
}

#[test]
fn if_arms_that_both_return_skip_the_merge() {
    let module = lower(vec![function(
        "pick",
        vec![param("flag", AstTy::I1)],
        AstTy::I64,
        vec![if_stmt(
            var("flag", AstTy::I1),
            vec![ret(int_lit(1))],
            vec![ret(int_lit(2))],
        )],
    )]);
    let pick = module.function("pick").unwrap();
    assert_eq!(labels(pick), vec!["entry", "then", "else"]);
    assert_eq!(eval_int(&module, "pick", &[1]), 1);
    assert_eq!(eval_int(&module, "pick", &[0]), 2);
}

#[test]
fn while_loops_use_start_body_end_blocks() {
    let module = lower(vec![function(
        "count",
        vec![],
        AstTy::I64,
        vec![
            let_stmt("i", AstTy::I64, int_lit(0)),
            while_stmt(
                bool_lit(true),
                vec![
                    if_stmt(
                        binary(
                            BinaryOp::Ge,
                            var("i", AstTy::I64),
                            int_lit(5),
                            AstTy::I1,
                        ),
                        vec![break_stmt()],
                        vec![],
                    ),
                    assign(
                        "i",
                        binary(
                            BinaryOp::Add,
                            var("i", AstTy::I64),
                            int_lit(1),
                            AstTy::I64,
                        ),
                    ),
                ],
            ),
            ret(var("i", AstTy::I64)),
        ],
    )]);
    let count = module.function("count").unwrap();
    let start = count.block_by_label("loop.start").unwrap();
    let body = count.block_by_label("loop.body").unwrap();
    let end = count.block_by_label("loop.end").unwrap();
    assert_eq!(
        start.terminator,
        Some(Terminator::Branch {
            cond: Value::bool(true),
            then_to: body.id,
            else_to: end.id,
        })
    );
    assert_eq!(eval_int(&module, "count", &[]), 5);
}

#[test]
fn break_targets_the_nearest_loop_end() {
    let module = lower(vec![function(
        "nested",
        vec![],
        AstTy::I64,
        vec![
            let_stmt("total", AstTy::I64, int_lit(0)),
            let_stmt("i", AstTy::I64, int_lit(0)),
            while_stmt(
                binary(
                    BinaryOp::Lt,
                    var("i", AstTy::I64),
                    int_lit(3),
                    AstTy::I1,
                ),
                vec![
                    while_stmt(bool_lit(true), vec![break_stmt()]),
                    assign(
                        "total",
                        binary(
                            BinaryOp::Add,
                            var("total", AstTy::I64),
                            int_lit(1),
                            AstTy::I64,
                        ),
                    ),
                    assign(
                        "i",
                        binary(
                            BinaryOp::Add,
                            var("i", AstTy::I64),
                            int_lit(1),
                            AstTy::I64,
                        ),
                    ),
                ],
            ),
            ret(var("total", AstTy::I64)),
        ],
    )]);
    let nested = module.function("nested").unwrap();
    let inner_body = nested.block_by_label("loop.body.1").unwrap();
    let inner_end = nested.block_by_label("loop.end.1").unwrap();
    assert_eq!(inner_body.terminator, Some(Terminator::Jump(inner_end.id)));
    assert_eq!(eval_int(&module, "nested", &[]), 3);
}

#[test]
fn continue_reenters_the_condition_block() {
    let module = lower(vec![function(
        "evens",
        vec![],
        AstTy::I64,
        vec![
            let_stmt("total", AstTy::I64, int_lit(0)),
            let_stmt("i", AstTy::I64, int_lit(0)),
            while_stmt(
                binary(
                    BinaryOp::Lt,
                    var("i", AstTy::I64),
                    int_lit(6),
                    AstTy::I1,
                ),
                vec![
                    assign(
                        "i",
                        binary(
                            BinaryOp::Add,
                            var("i", AstTy::I64),
                            int_lit(1),
                            AstTy::I64,
                        ),
                    ),
                    if_stmt(
                        binary(
                            BinaryOp::Eq,
                            binary(
                                BinaryOp::Rem,
                                var("i", AstTy::I64),
                                int_lit(2),
                                AstTy::I64,
                            ),
                            int_lit(1),
                            AstTy::I1,
                        ),
                        vec![continue_stmt()],
                        vec![],
                    ),
                    assign(
                        "total",
                        binary(
                            BinaryOp::Add,
                            var("total", AstTy::I64),
                            var("i", AstTy::I64),
                            AstTy::I64,
                        ),
                    ),
                ],
            ),
            ret(var("total", AstTy::I64)),
        ],
    )]);
    let evens = module.function("evens").unwrap();
    let start = evens.block_by_label("loop.start").unwrap();
    let then = evens.block_by_label("then").unwrap();
    assert_eq!(then.terminator, Some(Terminator::Jump(start.id)));
    assert_eq!(eval_int(&module, "evens", &[]), 12);
}

#[test]
fn short_circuit_and_skips_the_rhs() {
    let module = lower(vec![function(
        "safe_div",
        vec![param("a", AstTy::I64), param("b", AstTy::I64)],
        AstTy::I1,
        vec![ret(binary(
            BinaryOp::And,
            binary(
                BinaryOp::Ne,
                var("b", AstTy::I64),
                int_lit(0),
                AstTy::I1,
            ),
            binary(
                BinaryOp::Gt,
                binary(
                    BinaryOp::Div,
                    var("a", AstTy::I64),
                    var("b", AstTy::I64),
                    AstTy::I64,
                ),
                int_lit(1),
                AstTy::I1,
            ),
            AstTy::I1,
        ))],
    )]);
    let safe_div = module.function("safe_div").unwrap();
    assert_eq!(labels(safe_div), vec!["entry", "and.rhs", "and.merge"]);
    // b == 0 must never reach the division
    assert_eq!(eval_int(&module, "safe_div", &[10, 0]), 0);
    assert_eq!(eval_int(&module, "safe_div", &[10, 4]), 1);
    assert_eq!(eval_int(&module, "safe_div", &[10, 100]), 0);
}

#[test]
fn short_circuit_or_takes_the_skip_edge() {
    let module = lower(vec![function(
        "either",
        vec![param("a", AstTy::I1), param("b", AstTy::I1)],
        AstTy::I1,
        vec![ret(binary(
            BinaryOp::Or,
            var("a", AstTy::I1),
            var("b", AstTy::I1),
            AstTy::I1,
        ))],
    )]);
    let either = module.function("either").unwrap();
    assert_eq!(labels(either), vec!["entry", "or.rhs", "or.merge"]);
    let merge = either.block_by_label("or.merge").unwrap();
    match &merge.instructions[0].kind {
        InstKind::Phi { incoming } => {
            assert_eq!(incoming[0], (Value::bool(true), 0));
        }
        other => panic!("expected a phi, got {:?}", other),
    }
    assert_eq!(eval_int(&module, "either", &[1, 0]), 1);
    assert_eq!(eval_int(&module, "either", &[0, 1]), 1);
    assert_eq!(eval_int(&module, "either", &[0, 0]), 0);
}

#[test]
fn recursion_sees_its_own_signature() {
    let module = lower(vec![function(
        "countdown",
        vec![param("n", AstTy::I64)],
        AstTy::I64,
        vec![
            if_stmt(
                binary(
                    BinaryOp::Le,
                    var("n", AstTy::I64),
                    int_lit(0),
                    AstTy::I1,
                ),
                vec![ret(var("n", AstTy::I64))],
                vec![],
            ),
            ret(call(
                "countdown",
                vec![binary(
                    BinaryOp::Sub,
                    var("n", AstTy::I64),
                    int_lit(1),
                    AstTy::I64,
                )],
                AstTy::I64,
            )),
        ],
    )]);
    assert_eq!(eval_int(&module, "countdown", &[5]), 0);
}

#[test]
fn lowering_is_deterministic() {
    let build = || {
        ast_module(vec![
            identity_template(),
            function(
                "main",
                vec![],
                AstTy::I64,
                vec![
                    let_stmt(
                        "a",
                        AstTy::I64,
                        generic_call("identity", vec![AstTy::I64], vec![int_lit(1)], AstTy::I64),
                    ),
                    let_stmt(
                        "b",
                        AstTy::F64,
                        generic_call(
                            "identity",
                            vec![AstTy::F64],
                            vec![float_lit(2.0)],
                            AstTy::F64,
                        ),
                    ),
                    ret(var("a", AstTy::I64)),
                ],
            ),
        ])
    };
    let first = lower_module(&build(), LowerOptions::default()).expect("lowering should succeed");
    let second = lower_module(&build(), LowerOptions::default()).expect("lowering should succeed");
    assert_eq!(first, second);
}

#[test]
fn generic_instances_are_memoized() {
    let module = lower(vec![
        identity_template(),
        function(
            "main",
            vec![],
            AstTy::I64,
            vec![
                let_stmt(
                    "a",
                    AstTy::I64,
                    generic_call("identity", vec![AstTy::I64], vec![int_lit(1)], AstTy::I64),
                ),
                let_stmt(
                    "b",
                    AstTy::I64,
                    generic_call("identity", vec![AstTy::I64], vec![int_lit(2)], AstTy::I64),
                ),
                let_stmt(
                    "c",
                    AstTy::I64,
                    generic_call("identity", vec![AstTy::I64], vec![int_lit(3)], AstTy::I64),
                ),
                let_stmt(
                    "f",
                    AstTy::F64,
                    generic_call(
                        "identity",
                        vec![AstTy::F64],
                        vec![float_lit(1.5)],
                        AstTy::F64,
                    ),
                ),
                ret(binary(
                    BinaryOp::Add,
                    binary(
                        BinaryOp::Add,
                        var("a", AstTy::I64),
                        var("b", AstTy::I64),
                        AstTy::I64,
                    ),
                    var("c", AstTy::I64),
                    AstTy::I64,
                )),
            ],
        ),
    ]);
    assert!(module.function("identity$i64").is_some());
    assert!(module.function("identity$f64").is_some());
    assert!(module.function("identity").is_none());
    assert_eq!(module.instantiations.len(), 2);
    assert_eq!(module.instantiations[0].mangled, "identity$i64");
    assert_eq!(module.instantiations[1].mangled, "identity$f64");
    let main = module.function("main").unwrap();
    assert_eq!(
        called(main),
        vec![
            "identity$i64",
            "identity$i64",
            "identity$i64",
            "identity$f64"
        ]
    );
    assert_eq!(eval_int(&module, "main", &[]), 6);
}

#[test]
fn generic_calls_need_type_arguments() {
    let err = lower_err(vec![
        identity_template(),
        function(
            "main",
            vec![],
            AstTy::I64,
            vec![ret(call("identity", vec![int_lit(1)], AstTy::I64))],
        ),
    ]);
    assert!(matches!(err.root(), Error::GenericResolution(_)));
}

#[test]
fn wrong_type_argument_count_is_rejected() {
    let err = lower_err(vec![
        identity_template(),
        function(
            "main",
            vec![],
            AstTy::I64,
            vec![ret(generic_call(
                "identity",
                vec![AstTy::I64, AstTy::F64],
                vec![int_lit(1)],
                AstTy::I64,
            ))],
        ),
    ]);
    assert!(matches!(err.root(), Error::GenericResolution(_)));
}

#[test]
fn vector_literals_build_lane_by_lane() {
    let vec_ty = AstTy::vector(AstTy::I64, 4);
    let module = lower(vec![function(
        "dots",
        vec![],
        AstTy::I64,
        vec![
            let_stmt("v", vec_ty.clone(), vector_i64(&[1, 2, 3, 4])),
            let_stmt("w", vec_ty.clone(), vector_i64(&[5, 6, 7, 8])),
            ret(reduce_add(binary(
                BinaryOp::Add,
                var("v", vec_ty.clone()),
                var("w", vec_ty.clone()),
                vec_ty,
            ))),
        ],
    )]);
    let dots = module.function("dots").unwrap();
    let entry = dots.entry();
    match &entry.instructions[0].kind {
        InstKind::InsertElement {
            vector: Value::Undef(ty),
            lane: 0,
            ..
        } => assert_eq!(*ty, Ty::vector(Ty::I64, 4)),
        other => panic!("expected the first lane insert, got {:?}", other),
    }
    let inserts = entry
        .instructions
        .iter()
        .filter(|inst| matches!(inst.kind, InstKind::InsertElement { .. }))
        .count();
    assert_eq!(inserts, 8);
    assert!(entry
        .instructions
        .iter()
        .any(|inst| matches!(inst.kind, InstKind::Reduce { seed: None, .. })));
    assert_eq!(eval_int(&module, "dots", &[]), 36);
}

#[test]
fn mismatched_vector_shapes_are_rejected() {
    let vec_ty = AstTy::vector(AstTy::I64, 4);
    let err = lower_err(vec![function(
        "broken",
        vec![],
        vec_ty.clone(),
        vec![ret(binary(
            BinaryOp::Add,
            vector_i64(&[1, 2, 3, 4]),
            vector_i64(&[1, 2]),
            vec_ty,
        ))],
    )]);
    assert!(matches!(err.root(), Error::VectorShapeMismatch { .. }));
}

#[test]
fn runtime_externs_are_declared_once() {
    let module = lower(vec![function(
        "beep",
        vec![],
        AstTy::I32,
        vec![
            expr_stmt(call("putchar", vec![int32_lit(65)], AstTy::I32)),
            ret(call("putchar", vec![int32_lit(66)], AstTy::I32)),
        ],
    )]);
    let count = module
        .declarations
        .iter()
        .filter(|d| d.name == "putchar")
        .count();
    assert_eq!(count, 1);
    assert_eq!(
        module.declaration("putchar").unwrap().signature,
        Signature::new(vec![Ty::I32], Ty::I32)
    );
}

#[test]
fn memory_accessors_are_callable_by_alias() {
    let module = lower(vec![function(
        "poke",
        vec![],
        AstTy::I64,
        vec![
            expr_stmt(call(
                "store_byte",
                vec![int_lit(4096), int_lit(65)],
                AstTy::Void,
            )),
            ret(call("load_byte", vec![int_lit(4096)], AstTy::I64)),
        ],
    )]);
    let poke = module.function("poke").unwrap();
    assert_eq!(called(poke), vec!["__store_byte", "__load_byte"]);
    for name in ["__load_byte", "__store_byte", "__load_word", "__store_word"] {
        assert!(module.function(name).is_some(), "missing {}", name);
    }
    assert_eq!(eval_int(&module, "poke", &[]), 65);
}

#[test]
fn panic_reports_and_exits() {
    let module = lower(vec![function(
        "boom",
        vec![],
        AstTy::I64,
        vec![panic_stmt("boom")],
    )]);
    let boom = module.function("boom").unwrap();
    assert_eq!(boom.entry().terminator, Some(Terminator::Unreachable));
    assert!(module.function("__panic").is_some());
    let mut evaluator = Evaluator::new(&module);
    let outcome = evaluator
        .call("boom", &[])
        .expect("evaluation should succeed");
    assert_eq!(outcome, Outcome::Exit(1));
    assert_eq!(evaluator.stderr(), b"boom\n");
}

#[test]
fn contract_failure_reports_the_condition() {
    let module = lower(vec![function(
        "checked",
        vec![param("n", AstTy::I64)],
        AstTy::I64,
        vec![
            require_stmt(
                binary(
                    BinaryOp::Gt,
                    var("n", AstTy::I64),
                    int_lit(0),
                    AstTy::I1,
                ),
                "n must be positive",
            ),
            ret(var("n", AstTy::I64)),
        ],
    )]);
    let checked = module.function("checked").unwrap();
    assert!(checked.block_by_label("contract.ok").is_some());
    let fail = checked.block_by_label("contract.fail").unwrap();
    match &fail.instructions[0].kind {
        InstKind::Call { callee, args } => {
            assert_eq!(callee, "__contract_fail");
            assert_eq!(args[0], Value::i64(0));
        }
        other => panic!("expected the failure call, got {:?}", other),
    }
    assert_eq!(fail.terminator, Some(Terminator::Unreachable));
    assert_eq!(eval_int(&module, "checked", &[5]), 5);
    let mut evaluator = Evaluator::new(&module);
    let outcome = evaluator
        .call("checked", &[EvalValue::Int(-1)])
        .expect("evaluation should succeed");
    assert_eq!(outcome, Outcome::Exit(1));
    assert_eq!(evaluator.stderr(), b"n must be positive\n");
}

#[test]
fn mutated_params_get_a_stack_slot() {
    let module = lower(vec![function(
        "bump",
        vec![mutated_param("n", AstTy::I64)],
        AstTy::I64,
        vec![
            assign(
                "n",
                binary(
                    BinaryOp::Add,
                    var("n", AstTy::I64),
                    int_lit(1),
                    AstTy::I64,
                ),
            ),
            ret(var("n", AstTy::I64)),
        ],
    )]);
    let bump = module.function("bump").unwrap();
    let entry = bump.entry();
    assert!(matches!(entry.instructions[0].kind, InstKind::Alloca { slot: 0 }));
    match &entry.instructions[1].kind {
        InstKind::Store {
            value: Value::Temp { id: 0, .. },
            ..
        } => {}
        other => panic!("expected the parameter spill, got {:?}", other),
    }
    assert_eq!(eval_int(&module, "bump", &[41]), 42);
}

#[test]
fn casts_pick_the_right_instruction() {
    let module = lower(vec![
        function(
            "widen",
            vec![param("x", AstTy::I32)],
            AstTy::I64,
            vec![ret(cast(var("x", AstTy::I32), AstTy::I64))],
        ),
        function(
            "to_float",
            vec![param("x", AstTy::I64)],
            AstTy::F64,
            vec![ret(cast(var("x", AstTy::I64), AstTy::F64))],
        ),
    ]);
    let widen = module.function("widen").unwrap();
    assert!(widen.entry().instructions.iter().any(|inst| matches!(
        inst.kind,
        InstKind::Cast {
            kind: CastKind::Sext,
            ..
        }
    )));
    let to_float = module.function("to_float").unwrap();
    assert!(to_float.entry().instructions.iter().any(|inst| matches!(
        inst.kind,
        InstKind::Cast {
            kind: CastKind::SiToFp,
            ..
        }
    )));
    assert_eq!(eval_int(&module, "widen", &[-5]), -5);
    let mut evaluator = Evaluator::new(&module);
    let outcome = evaluator
        .call("to_float", &[EvalValue::Int(3)])
        .expect("evaluation should succeed");
    assert_eq!(outcome, Outcome::Return(EvalValue::Float(3.0)));
}

#[test]
fn unary_ops_get_their_own_instruction() {
    let module = lower(vec![
        function(
            "negate",
            vec![param("n", AstTy::I64)],
            AstTy::I64,
            vec![ret(unary(UnaryOp::Neg, var("n", AstTy::I64), AstTy::I64))],
        ),
        function(
            "non_positive",
            vec![param("n", AstTy::I64)],
            AstTy::I1,
            vec![ret(unary(
                UnaryOp::Not,
                binary(BinaryOp::Lt, int_lit(0), var("n", AstTy::I64), AstTy::I1),
                AstTy::I1,
            ))],
        ),
    ]);
    let negate = module.function("negate").unwrap();
    assert!(negate
        .entry()
        .instructions
        .iter()
        .any(|inst| matches!(inst.kind, InstKind::Unary { op: UnOp::Neg, .. })));
    let non_positive = module.function("non_positive").unwrap();
    assert!(non_positive
        .entry()
        .instructions
        .iter()
        .any(|inst| matches!(inst.kind, InstKind::Unary { op: UnOp::Not, .. })));
    assert_eq!(eval_int(&module, "negate", &[41]), -41);
    assert_eq!(eval_int(&module, "non_positive", &[5]), 0);
    assert_eq!(eval_int(&module, "non_positive", &[-3]), 1);
}

#[test]
fn duplicate_function_names_are_rejected() {
    let err = lower_err(vec![
        function("dup", vec![], AstTy::Void, vec![]),
        function("dup", vec![], AstTy::Void, vec![]),
    ]);
    assert!(matches!(err.root(), Error::SignatureConflict { .. }));
}

#[test]
fn missing_return_on_value_function_is_rejected() {
    let err = lower_err(vec![function("nope", vec![], AstTy::I64, vec![])]);
    assert!(matches!(err.root(), Error::InvalidBlockState(_)));
}

#[test]
fn void_functions_return_implicitly() {
    let module = lower(vec![function("quiet", vec![], AstTy::Void, vec![])]);
    let quiet = module.function("quiet").unwrap();
    assert_eq!(quiet.entry().terminator, Some(Terminator::Return(None)));
}

#[test]
fn break_outside_a_loop_is_rejected() {
    let err = lower_err(vec![function(
        "stray",
        vec![],
        AstTy::Void,
        vec![break_stmt()],
    )]);
    assert!(matches!(err.root(), Error::InvalidBlockState(_)));
}

#[test]
fn unknown_callee_is_rejected() {
    let err = lower_err(vec![function(
        "main",
        vec![],
        AstTy::I64,
        vec![ret(call("missing", vec![], AstTy::I64))],
    )]);
    assert!(matches!(err.root(), Error::UnknownSymbol(_)));
}

#[test]
fn failures_land_on_the_diagnostic_manager() {
    let _ = lower_err(vec![function(
        "main",
        vec![],
        AstTy::I64,
        vec![ret(call("missing", vec![], AstTy::I64))],
    )]);
    assert!(quill_core::diagnostics::diagnostic_manager().has_errors());
}

#[test]
fn assigning_an_immutable_parameter_is_rejected() {
    let err = lower_err(vec![function(
        "frozen",
        vec![param("n", AstTy::I64)],
        AstTy::I64,
        vec![assign("n", int_lit(1)), ret(var("n", AstTy::I64))],
    )]);
    assert!(matches!(err.root(), Error::Generic(_)));
}

#[test]
fn repeated_hints_get_numbered_labels() {
    let module = lower(vec![function(
        "twice",
        vec![param("flag", AstTy::I1)],
        AstTy::I64,
        vec![
            if_stmt(var("flag", AstTy::I1), vec![], vec![]),
            if_stmt(var("flag", AstTy::I1), vec![], vec![]),
            ret(int_lit(0)),
        ],
    )]);
    let twice = module.function("twice").unwrap();
    assert_eq!(
        labels(twice),
        vec!["entry", "then", "merge", "then.1", "merge.1"]
    );
}

#[test]
fn debug_info_records_line_numbers() {
    let mut init = let_stmt("x", AstTy::I64, int_lit(41));
    init.span = Span::new(0, 9, 17);
    let mut ast = ast_module(vec![function(
        "main",
        vec![],
        AstTy::I64,
        vec![init, ret(var("x", AstTy::I64))],
    )]);
    ast.source = Some("line one\nline two\n".to_string());
    let module =
        lower_module(&ast, LowerOptions { debug_info: true }).expect("lowering should succeed");
    assert_eq!(
        module.debug,
        Some(ModuleDebugInfo {
            file: "test.ql".to_string(),
            producer: "quill".to_string(),
        })
    );
    let main = module.function("main").unwrap();
    let subprogram = main.debug.as_ref().unwrap();
    assert_eq!(subprogram.file, "test.ql");
    assert_eq!(subprogram.line, 1);
    let store = &main.entry().instructions[1];
    assert!(matches!(store.kind, InstKind::Store { .. }));
    assert_eq!(store.loc, Some(DebugLoc { line: 2, column: 1 }));
}

#[test]
fn lowered_modules_survive_a_json_snapshot() {
    let module = lower(vec![function(
        "max",
        vec![param("a", AstTy::I64), param("b", AstTy::I64)],
        AstTy::I64,
        vec![ret(ternary(
            binary(
                BinaryOp::Gt,
                var("a", AstTy::I64),
                var("b", AstTy::I64),
                AstTy::I1,
            ),
            var("a", AstTy::I64),
            var("b", AstTy::I64),
            AstTy::I64,
        ))],
    )]);
    let json = serde_json::to_string(&module).expect("module should serialize");
    let back: Module = serde_json::from_str(&json).expect("module should deserialize");
    assert_eq!(module, back);
}

#[test]
fn debug_info_is_off_by_default() {
    let module = lower(vec![function(
        "main",
        vec![],
        AstTy::I64,
        vec![
            let_stmt("x", AstTy::I64, int_lit(1)),
            ret(var("x", AstTy::I64)),
        ],
    )]);
    assert!(module.debug.is_none());
    let main = module.function("main").unwrap();
    assert!(main.debug.is_none());
    assert!(main
        .entry()
        .instructions
        .iter()
        .all(|inst| inst.loc.is_none()));
}
