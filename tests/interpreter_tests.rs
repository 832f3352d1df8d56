// Integration tests for the Ruff interpreter.
//
// Two layers, mirroring the two ways the crate is actually driven:
// - in-process, via `ruff::vm::Vm::interpret`, for tests that only care
//   about the returned `InterpretResult` (compile vs. runtime errors);
// - out-of-process, via the `ruff` binary (`run <file>`), for tests that
//   need to observe `print` output or the process exit code, since `print`
//   writes straight to stdout rather than through an injectable sink.

use std::io::Write;
use std::process::Output;

use ruff::vm::{InterpretResult, Vm};

fn interpret(source: &str) -> InterpretResult {
    Vm::new().interpret(source)
}

/// Runs `source` through the `ruff` binary's `run` subcommand and returns
/// its captured output.
fn run_cli(source: &str) -> Output {
    let mut file = tempfile::Builder::new().suffix(".ruff").tempfile().expect("create temp script");
    file.write_all(source.as_bytes()).expect("write temp script");

    assert_cmd::Command::cargo_bin("ruff")
        .expect("find ruff binary")
        .arg("run")
        .arg(file.path())
        .output()
        .expect("run ruff binary")
}

fn stdout_of(source: &str) -> String {
    let output = run_cli(source);
    assert!(output.status.success(), "expected success, got {:?}\nstderr: {}", output.status, String::from_utf8_lossy(&output.stderr));
    String::from_utf8(output.stdout).expect("utf8 stdout")
}

fn lines_of(source: &str) -> Vec<String> {
    stdout_of(source).lines().map(|s| s.to_string()).collect()
}

// ---- §8 end-to-end scenarios ------------------------------------------

#[test]
fn arithmetic_addition() {
    assert_eq!(lines_of("print 1 + 2;"), vec!["3"]);
}

#[test]
fn string_concatenation_interns_equal_to_a_literal() {
    assert_eq!(
        lines_of(r#"var a = "hi"; var b = "h" + "i"; print a == b;"#),
        vec!["true"]
    );
}

#[test]
fn closure_over_outer_local_survives_scope_exit() {
    let src = r#"
        fun f() {
            var x = 0;
            fun g() { x = x + 1; return x; }
            return g;
        }
        var c = f();
        print c();
        print c();
    "#;
    assert_eq!(lines_of(src), vec!["1", "2"]);
}

#[test]
fn subclass_inherits_superclass_methods() {
    let src = r#"
        class A { greet() { print "hi"; } }
        class B < A {}
        B().greet();
    "#;
    assert_eq!(lines_of(src), vec!["hi"]);
}

#[test]
fn initializer_sets_instance_field() {
    let src = r#"class A { init(x){ this.x = x; } } print A(7).x;"#;
    assert_eq!(lines_of(src), vec!["7"]);
}

#[test]
fn for_loop_counts_up() {
    let src = "for (var i = 0; i < 3; i = i + 1) print i;";
    assert_eq!(lines_of(src), vec!["0", "1", "2"]);
}

// ---- §8 testable properties --------------------------------------------

#[test]
fn string_interning_holds_across_literal_and_concat_construction() {
    let src = r#"
        var a = "foo" + "bar";
        var b = "foobar";
        var c = "foo" + "b" + "a" + "r";
        print a == b;
        print b == c;
        print a == c;
    "#;
    assert_eq!(lines_of(src), vec!["true", "true", "true"]);
}

#[test]
fn closure_capture_observes_mutation_after_scope_closes() {
    let src = r#"
        fun counter() {
            var n = 0;
            fun inc() { n = n + 1; return n; }
            return inc;
        }
        var a = counter();
        var b = counter();
        print a();
        print a();
        print b();
    "#;
    // `a` and `b` capture independent upvalues: b's count does not see a's.
    assert_eq!(lines_of(src), vec!["1", "2", "1"]);
}

#[test]
fn deterministic_output_is_a_pure_function_of_source() {
    let src = r#"
        fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }
        print fib(10);
    "#;
    assert_eq!(stdout_of(src), stdout_of(src));
}

#[test]
fn falsiness_law_matches_nil_or_false() {
    let src = r#"
        print !nil;
        print !false;
        print !true;
        print !0;
        print !"";
        print !(0/0);
    "#;
    assert_eq!(lines_of(src), vec!["true", "true", "false", "false", "false", "false"]);
}

#[test]
fn equality_reflexivity_holds_except_for_nan() {
    let src = r#"
        print 1 == 1;
        print "x" == "x";
        print nil == nil;
        print (0/0) == (0/0);
    "#;
    assert_eq!(lines_of(src), vec!["true", "true", "true", "false"]);
}

#[test]
fn stress_gc_produces_identical_output_to_normal_gc() {
    let src = r#"
        class Node { init(v) { this.v = v; this.next = nil; } }
        fun build(n) {
            var head = nil;
            for (var i = 0; i < n; i = i + 1) {
                var node = Node(i);
                node.next = head;
                head = node;
            }
            return head;
        }
        fun sum(list) {
            var total = 0;
            while (list != nil) {
                total = total + list.v;
                list = list.next;
            }
            return total;
        }
        var s = "part" + "one" + "part" + "two";
        print sum(build(50));
        print s;
    "#;

    let mut normal = tempfile::Builder::new().suffix(".ruff").tempfile().unwrap();
    normal.write_all(src.as_bytes()).unwrap();
    let normal_out = assert_cmd::Command::cargo_bin("ruff")
        .unwrap()
        .arg("run")
        .arg(normal.path())
        .output()
        .unwrap();

    let mut stressed = tempfile::Builder::new().suffix(".ruff").tempfile().unwrap();
    stressed.write_all(src.as_bytes()).unwrap();
    let stressed_out = assert_cmd::Command::cargo_bin("ruff")
        .unwrap()
        .arg("--stress-gc")
        .arg("run")
        .arg(stressed.path())
        .output()
        .unwrap();

    assert!(normal_out.status.success());
    assert!(stressed_out.status.success());
    assert_eq!(normal_out.stdout, stressed_out.stdout);
}

#[test]
fn arity_mismatch_reports_expected_and_actual_counts() {
    let output = run_cli("fun f(a, b) { return a + b; } f(1);");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Expected 2 arguments but got 1."),
        "stderr was: {stderr}"
    );
}

#[test]
fn upvalue_dedup_shares_one_cell_across_two_references() {
    // `g` and `h` both close over the same local `x` in one function; each
    // reference must resolve to the same upvalue cell, so an assignment
    // made through `g` is visible through `h`.
    let src = r#"
        fun f() {
            var x = "a";
            fun g() { x = "b"; }
            fun h() { return x; }
            g();
            return h();
        }
        print f();
    "#;
    assert_eq!(lines_of(src), vec!["b"]);
}

// ---- number formatting (§6 print format) --------------------------------

#[test]
fn integers_print_without_a_decimal_point() {
    assert_eq!(lines_of("print 4 / 2;"), vec!["2"]);
}

#[test]
fn fractional_numbers_print_with_a_decimal_point() {
    assert_eq!(lines_of("print 1 / 4;"), vec!["0.25"]);
}

#[test]
fn nil_true_false_print_as_those_literals() {
    assert_eq!(lines_of("print nil; print true; print false;"), vec!["nil", "true", "false"]);
}

// ---- object printing -----------------------------------------------------

#[test]
fn functions_classes_and_instances_print_their_conventional_forms() {
    let src = r#"
        fun greet() {}
        class Dog {}
        print greet;
        print Dog;
        print Dog();
    "#;
    assert_eq!(lines_of(src), vec!["<fn greet>", "Dog", "Dog instance"]);
}

// ---- compile-time errors (§7) --------------------------------------------

#[test]
fn compile_error_prevents_any_execution() {
    assert_eq!(interpret("print 1 +;"), InterpretResult::CompileError);
}

#[test]
fn duplicate_local_in_same_scope_is_a_compile_error() {
    assert_eq!(interpret("{ var a = 1; var a = 2; }"), InterpretResult::CompileError);
}

#[test]
fn reading_local_in_its_own_initializer_is_a_compile_error() {
    assert_eq!(interpret("{ var a = a; }"), InterpretResult::CompileError);
}

#[test]
fn returning_from_top_level_is_a_compile_error() {
    assert_eq!(interpret("return 1;"), InterpretResult::CompileError);
}

#[test]
fn returning_a_value_from_an_initializer_is_a_compile_error() {
    let src = "class A { init() { return 1; } }";
    assert_eq!(interpret(src), InterpretResult::CompileError);
}

#[test]
fn this_outside_a_class_is_a_compile_error() {
    assert_eq!(interpret("print this;"), InterpretResult::CompileError);
}

#[test]
fn super_without_a_superclass_is_a_compile_error() {
    let src = "class A { m() { super.m(); } }";
    assert_eq!(interpret(src), InterpretResult::CompileError);
}

#[test]
fn class_inheriting_from_itself_is_a_compile_error() {
    assert_eq!(interpret("class A < A {}"), InterpretResult::CompileError);
}

#[test]
fn assignment_to_non_lvalue_is_a_compile_error() {
    assert_eq!(interpret("1 + 2 = 3;"), InterpretResult::CompileError);
}

#[test]
fn invalid_character_is_a_compile_error() {
    assert_eq!(interpret("var x = 1; print x @ 2;"), InterpretResult::CompileError);
}

#[test]
fn unterminated_string_is_a_compile_error() {
    assert_eq!(interpret("print \"no end;"), InterpretResult::CompileError);
}

// ---- runtime errors (§7) --------------------------------------------------

#[test]
fn adding_a_number_and_a_string_is_a_runtime_error() {
    assert_eq!(interpret(r#"print 1 + "a";"#), InterpretResult::RuntimeError);
}

#[test]
fn comparing_non_numbers_is_a_runtime_error() {
    assert_eq!(interpret(r#"print "a" < "b";"#), InterpretResult::RuntimeError);
}

#[test]
fn calling_a_non_callable_is_a_runtime_error() {
    assert_eq!(interpret("var a = 1; a();"), InterpretResult::RuntimeError);
}

#[test]
fn property_access_on_a_non_instance_is_a_runtime_error() {
    assert_eq!(interpret("var a = 1; print a.x;"), InterpretResult::RuntimeError);
}

#[test]
fn reading_an_undefined_global_is_a_runtime_error() {
    assert_eq!(interpret("print undefined_name;"), InterpretResult::RuntimeError);
}

#[test]
fn assigning_an_undefined_global_is_a_runtime_error_and_does_not_define_it() {
    let src = r#"
        fun check() { undefined_name = 1; }
        check();
    "#;
    assert_eq!(interpret(src), InterpretResult::RuntimeError);
}

#[test]
fn calling_a_class_with_an_init_arity_mismatch_is_a_runtime_error() {
    let src = "class A { init(x) { this.x = x; } } A();";
    assert_eq!(interpret(src), InterpretResult::RuntimeError);
}

#[test]
fn deep_recursion_overflows_the_frame_stack_as_a_runtime_error() {
    let src = "fun recurse() { return 1 + recurse(); } recurse();";
    assert_eq!(interpret(src), InterpretResult::RuntimeError);
}

// ---- exit codes (§6) -------------------------------------------------------

#[test]
fn successful_run_exits_zero() {
    assert!(run_cli("print 1;").status.success());
}

#[test]
fn compile_error_exits_65() {
    let output = run_cli("var =;");
    assert_eq!(output.status.code(), Some(65));
}

#[test]
fn runtime_error_exits_70() {
    let output = run_cli("1 + nil;");
    assert_eq!(output.status.code(), Some(70));
}

#[test]
fn missing_script_file_exits_74() {
    let output = assert_cmd::Command::cargo_bin("ruff")
        .unwrap()
        .arg("run")
        .arg("/nonexistent/path/to/a/script.ruff")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(74));
}

// ---- native extension library (§B) ----------------------------------------

#[test]
fn clock_native_returns_a_nonnegative_number() {
    assert_eq!(lines_of("print clock() >= 0;"), vec!["true"]);
}

#[test]
fn string_helper_natives_round_trip_a_character() {
    assert_eq!(lines_of(r#"print __strof(__chrat("hi", 1));"#), vec!["i"]);
}
