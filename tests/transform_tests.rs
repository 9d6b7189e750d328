use script_meter::{parse, transform, TransformError};

/// Sum of all `incr` arguments appearing in an instrumented output.
fn total_weight(out: &str) -> u64 {
    const NEEDLE: &str = "_instruction_counter.incr(";
    let mut sum = 0;
    let mut rest = out;
    while let Some(i) = rest.find(NEEDLE) {
        rest = &rest[i + NEEDLE.len()..];
        let end = rest.find(')').expect("unclosed incr call");
        sum += rest[..end].parse::<u64>().expect("non-numeric incr arg");
        rest = &rest[end..];
    }
    sum
}

/// Splicing only inserts: every byte of the input must reappear in order.
fn is_subsequence(needle: &str, hay: &str) -> bool {
    let mut hay_iter = hay.bytes();
    needle
        .bytes()
        .all(|b| hay_iter.by_ref().any(|h| h == b))
}

// ---------------------------------------------------------------------------
// Reference scenarios
// ---------------------------------------------------------------------------

#[test]
fn empty_program_is_untouched() {
    assert_eq!(transform("").unwrap(), "");
}

#[test]
fn single_assignment_counts_at_declaration_start() {
    assert_eq!(
        transform("var a = 1 + 2;").unwrap(),
        "_instruction_counter.incr(1);var a = 1 + 2;"
    );
}

#[test]
fn if_with_bare_consequent_is_wrapped_and_counted() {
    assert_eq!(
        transform("if (a > 0) a++;").unwrap(),
        "if (_instruction_counter.incr(1) && a > 0) {_instruction_counter.incr(1);a++;}"
    );
}

#[test]
fn for_loop_header_and_body_count_separately() {
    let out = transform("for (var i = 0; i < 10; i++) { sum += i; }").unwrap();
    assert_eq!(
        out,
        "for (var i = 0; _instruction_counter.incr(1) && i < 10; \
         _instruction_counter.incr(1) && i++) { _instruction_counter.incr(1);sum += i; }"
    );
}

#[test]
fn rebinding_the_counter_is_rejected() {
    let err = transform("var _instruction_counter = {};").unwrap_err();
    assert!(matches!(err, TransformError::ReservedIdentifier { .. }));
}

#[test]
fn invalid_source_is_a_parse_error() {
    let err = transform("function (").unwrap_err();
    assert!(matches!(err, TransformError::Parse { line: 1, .. }));
    assert!(err.to_string().contains("line 1"));
}

// ---------------------------------------------------------------------------
// Counting rules
// ---------------------------------------------------------------------------

#[test]
fn weights_coalesce_at_a_shared_statement() {
    assert_eq!(
        transform("a = b + c;").unwrap(),
        "_instruction_counter.incr(2);a = b + c;"
    );
}

#[test]
fn member_call_counts_both_nodes() {
    assert_eq!(
        transform("foo.bar();").unwrap(),
        "_instruction_counter.incr(2);foo.bar();"
    );
}

#[test]
fn throw_argument_coalesces_into_the_throw() {
    assert_eq!(
        transform("throw new Error(msg);").unwrap(),
        "_instruction_counter.incr(2);throw new Error(msg);"
    );
}

#[test]
fn conditional_initializer_counts_at_declaration() {
    assert_eq!(
        transform("var r = p ? q() : 0;").unwrap(),
        "_instruction_counter.incr(2);var r = p ? q() : 0;"
    );
}

#[test]
fn yield_counts_inside_generator_body() {
    assert_eq!(
        transform("function* gen() { yield a + 1; }").unwrap(),
        "function* gen() { _instruction_counter.incr(2);yield a + 1; }"
    );
}

#[test]
fn linear_path_weight_is_conserved() {
    let out = transform("var a = 1 + 2; b = a * 3; c(); d.e;").unwrap();
    assert_eq!(total_weight(&out), 5);
}

// ---------------------------------------------------------------------------
// Control-flow headers
// ---------------------------------------------------------------------------

#[test]
fn for_in_right_hoists_before_the_statement() {
    assert_eq!(
        transform("for (var k in make()) { use(k); }").unwrap(),
        "_instruction_counter.incr(1);for (var k in make()) { _instruction_counter.incr(1);use(k); }"
    );
}

#[test]
fn for_of_bare_body_wraps_and_counts() {
    assert_eq!(
        transform("for (var v of list) total += v;").unwrap(),
        "for (var v of list) {_instruction_counter.incr(1);total += v;}"
    );
}

#[test]
fn do_while_test_gets_the_expression_prefix() {
    assert_eq!(
        transform("do s(); while (k < n);").unwrap(),
        "do {_instruction_counter.incr(1);s();} while (_instruction_counter.incr(1) && k < n);"
    );
}

#[test]
fn with_object_hoists_before_the_statement() {
    assert_eq!(
        transform("with (o.p) { q(); }").unwrap(),
        "_instruction_counter.incr(1);with (o.p) { _instruction_counter.incr(1);q(); }"
    );
}

#[test]
fn switch_discriminant_hoists_before_the_statement() {
    assert_eq!(
        transform("switch (f(x)) { case 1: g(); break; }").unwrap(),
        "_instruction_counter.incr(1);switch (f(x)) { case 1: _instruction_counter.incr(1);g(); break; }"
    );
}

// ---------------------------------------------------------------------------
// Block wrapping
// ---------------------------------------------------------------------------

#[test]
fn tracked_free_bare_body_still_gets_braces() {
    assert_eq!(transform("while (run) step;").unwrap(), "while (run) {step;}");
}

#[test]
fn nested_bare_bodies_close_every_block() {
    let out = transform("if (a) if (b) c();").unwrap();
    assert_eq!(out, "if (a) {if (b) {_instruction_counter.incr(1);c();}}");
    assert!(parse(&out).is_ok());
}

#[test]
fn else_if_chain_stays_balanced() {
    let out = transform("if (a) b(); else if (c) d();").unwrap();
    assert_eq!(
        out,
        "if (a) {_instruction_counter.incr(1);b();} else \
         {if (c) {_instruction_counter.incr(1);d();}}"
    );
    assert!(parse(&out).is_ok());
}

// ---------------------------------------------------------------------------
// No-op and fallback behavior
// ---------------------------------------------------------------------------

#[test]
fn tracked_free_input_round_trips() {
    for src in ["var a = 1;", "function f() {}", ";", "\"use strict\";"] {
        assert_eq!(transform(src).unwrap(), src, "input: {src}");
    }
}

#[test]
fn top_level_default_parameter_stays_unmetered() {
    // There is no injectable statement to anchor on; injecting inside the
    // parameter list would not parse.
    let src = "function f(a = b + c) {}";
    assert_eq!(transform(src).unwrap(), src);
}

#[test]
fn anchored_default_parameter_counts_at_the_declaration() {
    assert_eq!(
        transform("var f = function (a = b + c) {};").unwrap(),
        "_instruction_counter.incr(1);var f = function (a = b + c) {};"
    );
}

// ---------------------------------------------------------------------------
// Reserved identifier guardrail
// ---------------------------------------------------------------------------

#[test]
fn all_binding_forms_are_rejected() {
    for src in [
        "var _instruction_counter = {};",
        "var a = 1, _instruction_counter = 2;",
        "function _instruction_counter() {}",
        "var f = function _instruction_counter() {};",
        "function f(_instruction_counter) {}",
        "var g = function (_instruction_counter) {};",
        "function outer() { var _instruction_counter = 1; }",
    ] {
        let err = transform(src).unwrap_err();
        assert!(
            matches!(err, TransformError::ReservedIdentifier { .. }),
            "input: {src}"
        );
    }
}

#[test]
fn reads_and_calls_through_the_counter_are_allowed() {
    assert_eq!(
        transform("_instruction_counter.incr(5);").unwrap(),
        "_instruction_counter.incr(2);_instruction_counter.incr(5);"
    );
    assert!(transform("var x = _instruction_counter;").is_ok());
}

// ---------------------------------------------------------------------------
// Universal properties over a representative corpus
// ---------------------------------------------------------------------------

const CORPUS: &[&str] = &[
    "var a = 1 + 2;",
    "a = b + c;",
    "foo.bar(baz);",
    "if (a > 0) a++;",
    "if (a) b(); else if (c) d(); else e();",
    "for (var i = 0; i < 10; i++) { sum += i; }",
    "for (var k in o) { touch(k); }",
    "for (var v of list) total += v;",
    "while (more()) consume();",
    "do s(); while (k < n);",
    "with (scope) { read(); }",
    "switch (f(x)) { case 1: g(); break; default: h(); }",
    "throw new Error(msg);",
    "function f(x) { return x * 2; }",
    "var f = function (x) { return x - 1; };",
    "function* gen() { yield a + 1; }",
    "class Point { constructor(x) { this.x = x; } norm() { return this.x * this.x; } }",
    "var r = p ? q() : 0;",
    "var s = \"日本\" + suffix;",
    "obj[key] = !flag;",
];

#[test]
fn instrumented_output_reparses() {
    for src in CORPUS {
        let out = transform(src).unwrap();
        assert!(parse(&out).is_ok(), "output does not parse: {out}");
    }
}

#[test]
fn source_is_a_subsequence_of_the_output() {
    for src in CORPUS {
        let out = transform(src).unwrap();
        assert!(is_subsequence(src, &out), "bytes lost for input: {src}");
    }
}

#[test]
fn parse_exposes_the_ast_without_instrumenting() {
    let script = parse("var a; f();").unwrap();
    assert_eq!(script.body.len(), 2);
}
