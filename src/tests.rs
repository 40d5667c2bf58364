use crate::diagnostics::{BufferedReport, DiagnosticKind, Report};
use crate::interpreter::Interpreter;
use crate::ir::passes::PassManager;
use crate::language::irgen;
use crate::language::parser::{Feature, Parser};
use crate::language::types::LiteralType;
use std::cell::RefCell;
use std::io::Write as _;
use std::rc::Rc;

fn interpreter_with_print() -> (Interpreter, Rc<RefCell<Vec<String>>>) {
    let mut interpreter = Interpreter::new();
    let output = Rc::new(RefCell::new(Vec::new()));
    let sink = output.clone();
    interpreter
        .register_function("print", LiteralType::Void)
        .param::<String>("text")
        .bind(move |params| {
            sink.borrow_mut().push(params.get_string(1).to_string());
        });
    (interpreter, output)
}

fn compile(interpreter: &mut Interpreter, source: &str, optimize: i32) -> BufferedReport {
    let mut report = BufferedReport::new();
    let ok = interpreter.compile_string(source, &mut report, optimize);
    assert!(ok, "compilation failed:\n{}", report);
    report
}

fn compile_err(interpreter: &mut Interpreter, source: &str) -> BufferedReport {
    let mut report = BufferedReport::new();
    let ok = interpreter.compile_string(source, &mut report, 1);
    assert!(!ok, "compilation unexpectedly succeeded");
    report
}

#[test]
fn arithmetic_compiles_to_single_add_and_mul() {
    let (mut interpreter, _) = interpreter_with_print();
    compile(&mut interpreter, "handler main { var i = 1 + 2 * 3; }", 0);

    let program = interpreter.program().unwrap();
    let disassembly = program.find_handler("main").unwrap().disassemble(program.constants());
    assert_eq!(disassembly.matches("NADD").count(), 1, "{}", disassembly);
    assert_eq!(disassembly.matches("NMUL").count(), 1, "{}", disassembly);

    assert_eq!(interpreter.run("main"), Ok(false));
}

#[test]
fn if_then_else_takes_the_true_branch() {
    let (mut interpreter, output) = interpreter_with_print();
    compile(
        &mut interpreter,
        r#"handler main { if 1 == 1 then print "yes"; else print "no"; }"#,
        1,
    );
    assert_eq!(interpreter.run("main"), Ok(false));
    assert_eq!(*output.borrow(), vec!["yes"]);
}

#[test]
fn match_same_selects_the_exact_label() {
    let (mut interpreter, output) = interpreter_with_print();
    compile(
        &mut interpreter,
        r#"handler main {
             match "abc" {
               on "a" print "1";
               on "abc" print "2";
               else print "3";
             }
           }"#,
        1,
    );
    assert_eq!(interpreter.run("main"), Ok(false));
    assert_eq!(*output.borrow(), vec!["2"]);
}

#[test]
fn match_head_and_multiple_labels() {
    let (mut interpreter, output) = interpreter_with_print();
    compile(
        &mut interpreter,
        r#"handler main {
             match "abcdef" =^ {
               on "xyz", on "abc" print "head";
               else print "none";
             }
           }"#,
        1,
    );
    assert_eq!(interpreter.run("main"), Ok(false));
    assert_eq!(*output.borrow(), vec!["head"]);
}

#[test]
fn recursive_handler_call_is_a_type_error() {
    let (mut interpreter, _) = interpreter_with_print();
    let report = compile_err(&mut interpreter, "handler x { x; }");
    assert!(
        report
            .iter()
            .any(|m| m.kind == DiagnosticKind::TypeError && m.text.contains("recursively")),
        "{}",
        report
    );
    assert!(report.iter().any(|m| m.text.contains('x')));
}

#[test]
fn global_initializer_runs_exactly_once() {
    let (mut interpreter, output) = interpreter_with_print();
    let seeds = Rc::new(RefCell::new(0i64));
    let counter = seeds.clone();
    interpreter
        .register_function("seed", LiteralType::Number)
        .bind(move |params| {
            *counter.borrow_mut() += 1;
            params.set_result(1i64);
        });

    compile(
        &mut interpreter,
        r#"var g = seed();
           handler main { print string(g); }"#,
        1,
    );

    for _ in 0..3 {
        assert_eq!(interpreter.run("main"), Ok(false));
    }
    assert_eq!(*seeds.borrow(), 1);
    assert_eq!(*output.borrow(), vec!["1", "1", "1"]);
}

#[test]
fn quota_exhaustion_returns_false() {
    let (mut interpreter, _) = interpreter_with_print();
    compile(&mut interpreter, "handler main { while true { } }", 1);
    let decision = interpreter.run_with("main", None, Some(100), None);
    assert_eq!(decision, Ok(false));
}

#[test]
fn quota_large_enough_lets_the_run_finish() {
    let (mut interpreter, output) = interpreter_with_print();
    compile(&mut interpreter, r#"handler main { print "done"; }"#, 1);
    assert_eq!(interpreter.run_with("main", None, Some(10_000), None), Ok(false));
    assert_eq!(*output.borrow(), vec!["done"]);
}

#[test]
fn while_loop_counts_down() {
    let (mut interpreter, output) = interpreter_with_print();
    compile(
        &mut interpreter,
        r#"handler main {
             var i = 3;
             while i > 0 {
               print string(i);
               i = i - 1;
             }
           }"#,
        1,
    );
    assert_eq!(interpreter.run("main"), Ok(false));
    assert_eq!(*output.borrow(), vec!["3", "2", "1"]);
}

#[test]
fn cidr_membership_uses_the_prefix_mask() {
    let (mut interpreter, output) = interpreter_with_print();
    compile(
        &mut interpreter,
        r#"handler main {
             if 10.1.2.3 in 10.0.0.0/12 then print "in"; else print "out";
             if 10.16.0.1 in 10.0.0.0/12 then print "in"; else print "out";
           }"#,
        1,
    );
    assert_eq!(interpreter.run("main"), Ok(false));
    assert_eq!(*output.borrow(), vec!["in", "out"]);
}

#[test]
fn string_interpolation_casts_fragments() {
    let (mut interpreter, output) = interpreter_with_print();
    compile(
        &mut interpreter,
        r#"handler main { print "sum: #{1 + 2}!"; }"#,
        1,
    );
    assert_eq!(interpreter.run("main"), Ok(false));
    assert_eq!(*output.borrow(), vec!["sum: 3!"]);
}

#[test]
fn postscript_if_and_unless() {
    let (mut interpreter, output) = interpreter_with_print();
    compile(
        &mut interpreter,
        r#"handler main {
             print "a" if 1 == 2;
             print "b" unless 1 == 2;
             print "c" unless yes;
           }"#,
        1,
    );
    assert_eq!(interpreter.run("main"), Ok(false));
    assert_eq!(*output.borrow(), vec!["b"]);
}

#[test]
fn regex_match_fills_capture_groups() {
    let (mut interpreter, output) = interpreter_with_print();
    compile(
        &mut interpreter,
        r#"handler main {
             if "user@example" =~ /(\w+)@(\w+)/ then print $1;
           }"#,
        1,
    );
    assert_eq!(interpreter.run("main"), Ok(false));
    assert_eq!(*output.borrow(), vec!["user"]);
}

#[test]
fn number_literals_scale_with_unit_suffixes() {
    let (mut interpreter, output) = interpreter_with_print();
    compile(
        &mut interpreter,
        r#"handler main {
             print string(4 kbyte);
             print string(2 mins);
           }"#,
        1,
    );
    assert_eq!(interpreter.run("main"), Ok(false));
    assert_eq!(*output.borrow(), vec!["4096", "120"]);
}

#[test]
fn named_arguments_reorder_and_fill_defaults() {
    let mut interpreter = Interpreter::new();
    let output = Rc::new(RefCell::new(Vec::new()));
    let sink = output.clone();
    interpreter
        .register_function("greet", LiteralType::Void)
        .param::<String>("name")
        .param_with_default::<&str>("greeting", "Hello")
        .bind(move |params| {
            let line = format!("{} {}", params.get_string(2), params.get_string(1));
            sink.borrow_mut().push(line);
        });

    let mut report = BufferedReport::new();
    let ok = interpreter.compile_string(
        r#"handler main { greet name: "World"; }"#,
        &mut report,
        1,
    );
    assert!(ok, "{}", report);
    assert_eq!(interpreter.run("main"), Ok(false));
    assert_eq!(*output.borrow(), vec!["Hello World"]);
}

#[test]
fn unmatched_call_signature_is_reported() {
    let (mut interpreter, _) = interpreter_with_print();
    let report = compile_err(&mut interpreter, "handler main { print 42; }");
    assert!(
        report.iter().any(|m| m.text.contains("No matching signature")),
        "{}",
        report
    );
}

#[test]
fn ambiguous_call_is_reported() {
    let mut interpreter = Interpreter::new();
    interpreter
        .register_function("log", LiteralType::Void)
        .param_with_default::<&str>("text", "x")
        .bind(|_| {});
    interpreter
        .register_function("log", LiteralType::Void)
        .param_with_default::<i64>("level", 1)
        .bind(|_| {});

    let mut report = BufferedReport::new();
    let ok = interpreter.compile_string("handler main { log; }", &mut report, 1);
    assert!(!ok);
    assert!(report.iter().any(|m| m.text.contains("ambiguous")), "{}", report);
}

#[test]
fn experimental_builtin_use_warns() {
    let (mut interpreter, _) = interpreter_with_print();
    interpreter
        .register_function("shiny", LiteralType::Void)
        .experimental()
        .bind(|_| {});
    let report = compile(&mut interpreter, "handler main { shiny; }", 1);
    assert!(
        report
            .iter()
            .any(|m| m.kind == DiagnosticKind::Warning && m.text.contains("experimental")),
        "{}",
        report
    );
}

#[test]
fn source_handler_calls_are_inlined() {
    let (mut interpreter, output) = interpreter_with_print();
    compile(
        &mut interpreter,
        r#"handler greetings { print "a"; }
           handler main { greetings; print "m"; }"#,
        1,
    );
    assert_eq!(interpreter.run("main"), Ok(false));
    assert_eq!(*output.borrow(), vec!["a", "m"]);
}

#[test]
fn forward_declared_handler_gets_implemented_later() {
    let (mut interpreter, output) = interpreter_with_print();
    compile(
        &mut interpreter,
        r#"handler main { helper; }
           handler helper { print "later"; }"#,
        1,
    );
    assert_eq!(interpreter.run("main"), Ok(false));
    assert_eq!(*output.borrow(), vec!["later"]);
}

#[test]
fn redeclaring_a_handler_body_is_a_type_error() {
    let (mut interpreter, _) = interpreter_with_print();
    let report = compile_err(
        &mut interpreter,
        r#"handler twice { print "1"; }
           handler twice { print "2"; }"#,
    );
    assert!(report.iter().any(|m| m.text.contains("Redeclaring")), "{}", report);
}

#[test]
fn native_handler_returning_true_decides_the_run() {
    let (mut interpreter, output) = interpreter_with_print();
    interpreter
        .register_handler("deny")
        .bind(|params| params.set_result(true));
    interpreter
        .register_handler("pass")
        .bind(|params| params.set_result(false));

    compile(
        &mut interpreter,
        r#"handler main { pass; print "kept"; deny; print "skipped"; }"#,
        1,
    );
    assert_eq!(interpreter.run("main"), Ok(true));
    assert_eq!(*output.borrow(), vec!["kept"]);
}

#[test]
fn running_an_unknown_handler_returns_false() {
    let (mut interpreter, _) = interpreter_with_print();
    compile(&mut interpreter, "handler main { }", 1);
    assert_eq!(interpreter.run("no_such_handler"), Ok(false));
}

#[test]
fn empty_and_mixed_arrays_are_type_errors() {
    let mut interpreter = Interpreter::new();
    interpreter
        .register_function("allow", LiteralType::Void)
        .param::<Vec<i64>>("values")
        .bind(|_| {});

    let report = compile_err(&mut interpreter, "handler main { allow []; }");
    assert!(report.iter().any(|m| m.text.contains("Empty arrays")), "{}", report);

    let mut interpreter = Interpreter::new();
    interpreter
        .register_function("allow", LiteralType::Void)
        .param::<Vec<i64>>("values")
        .bind(|_| {});
    let report = compile_err(&mut interpreter, r#"handler main { allow [1, "x"]; }"#);
    assert!(
        report.iter().any(|m| m.text.contains("Mixed element types")),
        "{}",
        report
    );
}

#[test]
fn int_array_arguments_reach_the_native() {
    let mut interpreter = Interpreter::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    interpreter
        .register_function("allow", LiteralType::Void)
        .param::<Vec<i64>>("values")
        .bind(move |params| {
            sink.borrow_mut().extend(params.get_int_array(1).iter().copied());
        });

    let mut report = BufferedReport::new();
    let ok = interpreter.compile_string("handler main { allow [1, 2, 3]; }", &mut report, 1);
    assert!(ok, "{}", report);
    assert_eq!(interpreter.run("main"), Ok(false));
    assert_eq!(*seen.borrow(), vec![1, 2, 3]);
}

#[test]
fn cidr_prefix_out_of_range_fails_compilation() {
    let (mut interpreter, _) = interpreter_with_print();
    let report = compile_err(
        &mut interpreter,
        "handler main { if 10.0.0.1 in 10.0.0.0/33 then print \"?\"; }",
    );
    assert!(
        report
            .iter()
            .any(|m| m.kind == DiagnosticKind::TokenError && m.text.contains("CIDR")),
        "{}",
        report
    );
}

#[test]
fn userdata_is_visible_to_natives() {
    struct RequestState {
        path: String,
    }

    let mut interpreter = Interpreter::new();
    interpreter
        .register_function("req_path", LiteralType::String)
        .bind(|params| {
            let path = params
                .userdata::<RequestState>()
                .map(|state| state.path.clone())
                .unwrap_or_default();
            params.set_result(path);
        });
    interpreter
        .register_handler("accept_api")
        .bind(|params| {
            let is_api = params
                .userdata::<RequestState>()
                .map(|state| state.path.starts_with("/api/"))
                .unwrap_or(false);
            params.set_result(is_api);
        });

    let mut report = BufferedReport::new();
    let ok = interpreter.compile_string(
        r#"handler main { accept_api; }"#,
        &mut report,
        1,
    );
    assert!(ok, "{}", report);

    let mut state = RequestState {
        path: "/api/users".to_string(),
    };
    let decision = interpreter.run_with("main", Some(&mut state), None, None);
    assert_eq!(decision, Ok(true));

    let mut state = RequestState {
        path: "/static/logo.png".to_string(),
    };
    let decision = interpreter.run_with("main", Some(&mut state), None, None);
    assert_eq!(decision, Ok(false));
}

#[test]
fn trace_callback_sees_every_instruction() {
    let (mut interpreter, _) = interpreter_with_print();
    compile(&mut interpreter, r#"handler main { print "x"; }"#, 1);

    let mut ips = Vec::new();
    let mut trace = |_instr: u64, ip: usize, _sp: usize| ips.push(ip);
    let decision = interpreter.run_with("main", None, None, Some(&mut trace));
    assert_eq!(decision, Ok(false));
    assert!(!ips.is_empty());
    assert_eq!(ips[0], 0);
}

#[test]
fn constants_are_interned_per_program() {
    let (mut interpreter, _) = interpreter_with_print();
    interpreter.set_retain_ir(true);
    compile(
        &mut interpreter,
        r#"handler main { var a = 1 + 1; print "x"; print "x"; }"#,
        0,
    );

    let constants = interpreter.ir_program().unwrap().constants();
    for i in 0..constants.len() {
        for j in (i + 1)..constants.len() {
            assert_ne!(
                constants[i].kind, constants[j].kind,
                "duplicate constant at {} and {}",
                i, j
            );
        }
    }
}

#[test]
fn optimization_reaches_a_fixed_point() {
    let mut report = BufferedReport::new();
    let mut parser = Parser::new(
        &[Feature::GlobalScope, Feature::WhileLoop],
        &mut report,
        None,
    );
    parser.open_string(
        r#"handler main {
             var i = 1;
             if i == 1 then i = 2; else i = 3;
           }"#,
    );
    let parsed = parser.parse().unwrap();
    assert!(!report.contains_failures(), "{}", report);

    let mut ir = irgen::generate(&parsed.unit, &parsed.symbols, &mut report).unwrap();
    let passes = PassManager::with_optimization_level(1);
    passes.run(&mut ir);
    assert!(!passes.run(&mut ir), "second sweep must report no changes");
}

#[test]
fn compile_file_follows_include_directives() {
    let dir = tempfile::tempdir().unwrap();
    for (name, content) in [
        ("inc_1.flow", "handler one { print \"1\"; }\n"),
        ("inc_2.flow", "handler two { print \"2\"; }\n"),
    ] {
        let mut file = std::fs::File::create(dir.path().join(name)).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }
    let main_path = dir.path().join("main.flow");
    let mut main_file = std::fs::File::create(&main_path).unwrap();
    write!(
        main_file,
        "#include \"{}\"\nhandler main {{ one; two; }}\n",
        dir.path().join("inc_*.flow").display()
    )
    .unwrap();
    drop(main_file);

    let (mut interpreter, output) = interpreter_with_print();
    let mut report = BufferedReport::new();
    let ok = interpreter.compile_file(&main_path, &mut report, 1);
    assert!(ok, "{}", report);
    assert_eq!(interpreter.run("main"), Ok(false));
    assert_eq!(*output.borrow(), vec!["1", "2"]);
}

#[test]
fn global_scope_feature_gate_rejects_unit_variables() {
    let mut report = BufferedReport::new();
    let mut parser = Parser::new(&[Feature::WhileLoop], &mut report, None);
    parser.open_string("var x = 1; handler main { }");
    let _ = parser.parse();
    assert!(
        report
            .iter()
            .any(|m| m.kind == DiagnosticKind::SyntaxError
                && m.text.contains("Global-scope feature not enabled")),
        "{}",
        report
    );
}

#[test]
fn boolean_short_circuit_or_evaluates_lazily() {
    let mut interpreter = Interpreter::new();
    let calls = Rc::new(RefCell::new(0));
    let counter = calls.clone();
    interpreter
        .register_function("expensive", LiteralType::Boolean)
        .bind(move |params| {
            *counter.borrow_mut() += 1;
            params.set_result(true);
        });
    let output = Rc::new(RefCell::new(Vec::new()));
    let sink = output.clone();
    interpreter
        .register_function("print", LiteralType::Void)
        .param::<String>("text")
        .bind(move |params| {
            sink.borrow_mut().push(params.get_string(1).to_string());
        });

    let mut report = BufferedReport::new();
    let ok = interpreter.compile_string(
        r#"handler main { if yes or expensive() then print "t"; }"#,
        &mut report,
        0,
    );
    assert!(ok, "{}", report);
    assert_eq!(interpreter.run("main"), Ok(false));
    assert_eq!(*output.borrow(), vec!["t"]);
    assert_eq!(*calls.borrow(), 0, "rhs of `or` must not run");
}
