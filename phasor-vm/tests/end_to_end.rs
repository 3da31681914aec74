//! End-to-end scenarios driving AST through codegen, the codecs, and the
//! interpreter together, mirroring a front end that lexes and parses real
//! source text into the trees built here by hand.

use std::rc::Rc;

use phasor_vm::ast::{BinaryOp, Expr, FieldDecl, Param, Program, Stmt, TypeNode};
use phasor_vm::codec::{binary, text};
use phasor_vm::codegen::Generator;
use phasor_vm::prelude::*;

/// Turns on instruction-level dispatch tracing for the scenarios below —
/// run with `RUST_LOG=trace` to watch a scenario's opcodes fire. Guarded so
/// the handful of tests in this file sharing one process don't each try to
/// install their own global subscriber.
fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

fn num(s: &str) -> Expr {
    Expr::Number(s.to_owned())
}

fn ident(name: &str) -> Expr {
    Expr::Ident(name.to_owned())
}

fn var(name: &str, init: Expr) -> Stmt {
    Stmt::VarDecl(name.to_owned(), Some(init))
}

/// Runs `program`'s `main` function (declared with no parameters) and
/// returns whatever it returns. `main` stands in for the scenario's
/// `print` statement so the result can be asserted on directly instead of
/// scraping stdout, which the interpreter writes straight to the process.
fn run_main(program: Program) -> Value {
    init_tracing();
    let bytecode = Generator::new().generate(&program).expect("codegen succeeds");
    let mut vm = Vm::new();
    let handle = vm.load(Rc::new(bytecode));
    vm.execute(handle).expect("top-level script halts cleanly");
    vm.call_function(handle, "main", Vec::new()).expect("main returns")
}

fn wrap_in_main(body: Vec<Stmt>) -> Program {
    Program {
        statements: vec![Stmt::FunctionDecl { name: "main".into(), params: Vec::new(), ret: None, body }],
    }
}

/// S1 — arithmetic with operator precedence: `1 + 2 * 3` is `7`.
#[test]
fn scenario_arithmetic_precedence() {
    let program = wrap_in_main(vec![Stmt::Return(Some(Expr::Binary(
        BinaryOp::Add,
        Box::new(num("1")),
        Box::new(Expr::Binary(BinaryOp::Mul, Box::new(num("2")), Box::new(num("3")))),
    )))]);
    assert_eq!(run_main(program), Value::Int(7));
}

/// S2 — a conditional picks its `then` branch when the condition holds.
#[test]
fn scenario_conditional_branch() {
    let program = wrap_in_main(vec![
        var("x", num("0")),
        Stmt::If {
            cond: Expr::Binary(BinaryOp::Eq, Box::new(ident("x")), Box::new(num("0"))),
            then: vec![Stmt::Return(Some(Expr::Str("a".into())))],
            else_: Some(vec![Stmt::Return(Some(Expr::Str("b".into())))]),
        },
    ]);
    assert_eq!(run_main(program), Value::String("a".into()));
}

/// S3 — a `for` loop that accumulates until `break`, landing on `3`.
#[test]
fn scenario_loop_with_break() {
    let program = wrap_in_main(vec![
        var("i", num("0")),
        var("s", num("0")),
        Stmt::For {
            init: None,
            cond: None,
            incr: None,
            body: vec![
                Stmt::If {
                    cond: Expr::Binary(BinaryOp::Eq, Box::new(ident("i")), Box::new(num("3"))),
                    then: vec![Stmt::Break],
                    else_: None,
                },
                Stmt::ExprStmt(Expr::Assign(
                    Box::new(ident("s")),
                    Box::new(Expr::Binary(BinaryOp::Add, Box::new(ident("s")), Box::new(num("1")))),
                )),
                Stmt::ExprStmt(Expr::Postfix(Box::new(ident("i")), phasor_vm::ast::PostfixOp::Inc)),
            ],
        },
        Stmt::Return(Some(ident("s"))),
    ]);
    assert_eq!(run_main(program), Value::Int(3));
}

/// S4 — recursive function: `fact(5)` is `120`.
#[test]
fn scenario_recursive_function() {
    let fact = Stmt::FunctionDecl {
        name: "fact".into(),
        params: vec![Param { name: "n".into(), ty: TypeNode::Int }],
        ret: Some(TypeNode::Int),
        body: vec![
            Stmt::If {
                cond: Expr::Binary(BinaryOp::Le, Box::new(ident("n")), Box::new(num("1"))),
                then: vec![Stmt::Return(Some(num("1")))],
                else_: None,
            },
            Stmt::Return(Some(Expr::Binary(
                BinaryOp::Mul,
                Box::new(ident("n")),
                Box::new(Expr::Call("fact".into(), vec![Expr::Binary(BinaryOp::Sub, Box::new(ident("n")), Box::new(num("1")))])),
            ))),
        ],
    };
    let main = Stmt::FunctionDecl {
        name: "main".into(),
        params: Vec::new(),
        ret: None,
        body: vec![Stmt::Return(Some(Expr::Call("fact".into(), vec![num("5")])))],
    };
    let program = Program { statements: vec![fact, main] };
    assert_eq!(run_main(program), Value::Int(120));
}

/// S5 — a struct literal's fields read back through field access: `p.x +
/// p.y` is `7` for `P { x: 3, y: 4 }`.
#[test]
fn scenario_struct_field_access() {
    let decl = Stmt::StructDecl {
        name: "P".into(),
        fields: vec![
            FieldDecl { name: "x".into(), ty: TypeNode::Int },
            FieldDecl { name: "y".into(), ty: TypeNode::Int },
        ],
    };
    let main = Stmt::FunctionDecl {
        name: "main".into(),
        params: Vec::new(),
        ret: None,
        body: vec![
            var("p", Expr::StructInstance("P".into(), vec![("x".into(), num("3")), ("y".into(), num("4"))])),
            Stmt::Return(Some(Expr::Binary(
                BinaryOp::Add,
                Box::new(Expr::FieldAccess(Box::new(ident("p")), "x".into())),
                Box::new(Expr::FieldAccess(Box::new(ident("p")), "y".into())),
            ))),
        ],
    };
    let program = Program { statements: vec![decl, main] };
    assert_eq!(run_main(program), Value::Int(7));
}

/// S6 — S1's bytecode survives an encode/decode round trip through the
/// binary container and still evaluates to the same result.
#[test]
fn scenario_binary_round_trip_preserves_behavior() {
    init_tracing();
    let program = wrap_in_main(vec![Stmt::Return(Some(Expr::Binary(
        BinaryOp::Add,
        Box::new(num("1")),
        Box::new(Expr::Binary(BinaryOp::Mul, Box::new(num("2")), Box::new(num("3")))),
    )))]);
    let bytecode = Generator::new().generate(&program).expect("codegen succeeds");

    let encoded = binary::encode(&bytecode).expect("encodes");
    let decoded = binary::decode(&encoded).expect("decodes");

    let mut vm = Vm::new();
    let handle = vm.load(Rc::new(decoded));
    vm.execute(handle).expect("halts cleanly");
    let result = vm.call_function(handle, "main", Vec::new()).expect("main returns");
    assert_eq!(result, Value::Int(7));
}

/// The textual IR round-trips the same bytecode and the decoded copy still
/// runs to the same result — the diff-friendly form is behavior-preserving,
/// not just visually stable.
#[test]
fn text_round_trip_preserves_behavior() {
    init_tracing();
    let program = wrap_in_main(vec![Stmt::Return(Some(num("42")))]);
    let bytecode = Generator::new().generate(&program).expect("codegen succeeds");

    let rendered = text::encode(&bytecode, true);
    let decoded = text::decode(&rendered).expect("decodes");

    let mut vm = Vm::new();
    let handle = vm.load(Rc::new(decoded));
    vm.execute(handle).expect("halts cleanly");
    let result = vm.call_function(handle, "main", Vec::new()).expect("main returns");
    assert_eq!(result, Value::Int(42));
}

/// Two separate instances of the same bytecode keep independent variable
/// and call-stack state — running one to completion cannot be observed
/// from the other.
#[test]
fn instances_are_isolated_from_each_other() {
    init_tracing();
    let program = Program {
        statements: vec![
            var("counter", num("0")),
            Stmt::FunctionDecl {
                name: "bump".into(),
                params: Vec::new(),
                ret: None,
                body: vec![
                    Stmt::ExprStmt(Expr::Assign(
                        Box::new(ident("counter")),
                        Box::new(Expr::Binary(BinaryOp::Add, Box::new(ident("counter")), Box::new(num("1")))),
                    )),
                    Stmt::Return(Some(ident("counter"))),
                ],
            },
        ],
    };
    let bytecode = Rc::new(Generator::new().generate(&program).expect("codegen succeeds"));

    let mut vm = Vm::new();
    let a = vm.load(bytecode.clone());
    let b = vm.load(bytecode);
    vm.execute(a).unwrap();
    vm.execute(b).unwrap();

    assert_eq!(vm.call_function(a, "bump", Vec::new()).unwrap(), Value::Int(1));
    assert_eq!(vm.call_function(a, "bump", Vec::new()).unwrap(), Value::Int(2));
    // `b` never observes `a`'s mutations of `counter`.
    assert_eq!(vm.call_function(b, "bump", Vec::new()).unwrap(), Value::Int(1));
}

/// A fault in one instance (calling an unregistered native) does not
/// corrupt or halt a sibling instance sharing the same `Vm`.
#[test]
fn a_fault_in_one_instance_does_not_affect_another() {
    init_tracing();
    let faulting = wrap_in_main(vec![Stmt::Return(Some(Expr::Call("no_such_native".into(), vec![num("1")])))]);
    let healthy = wrap_in_main(vec![Stmt::Return(Some(num("9")))]);

    let mut vm = Vm::new();
    let a = vm.load(Rc::new(Generator::new().generate(&faulting).unwrap()));
    let b = vm.load(Rc::new(Generator::new().generate(&healthy).unwrap()));
    vm.execute(a).unwrap();
    vm.execute(b).unwrap();

    let err = vm.call_function(a, "main", Vec::new()).unwrap_err();
    assert_eq!(err.reason(), phasor_vm::PanicReason::NativeFunctionNotFound);
    assert_eq!(vm.call_function(b, "main", Vec::new()).unwrap(), Value::Int(9));
}
