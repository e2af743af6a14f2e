use super::helpers::*;
use charon_compiler::diag::ErrorKind;

#[test]
fn test_vararg_outside_vararg_function() {
    let e = compile_str_err("local function f() return ... end");
    assert!(matches!(e.kind, ErrorKind::VarargOutsideVarargFunc));
}

#[test]
fn test_vararg_function_accepts_dots() {
    compile_str("local function f(...) return ... end");
}

#[test]
fn test_assign_to_const() {
    let e = compile_str_err("local c <const> = 1 c = 2");
    assert!(matches!(e.kind, ErrorKind::AssignToConst(ref n) if n == "c"));
}

#[test]
fn test_assign_to_const_upvalue() {
    let e = compile_str_err(
        "local f local c <const> = f local g = function() c = nil end",
    );
    assert!(matches!(e.kind, ErrorKind::AssignToConst(_)));
}

#[test]
fn test_compound_assign_to_const() {
    let e = compile_str_err("local c <const> = 1 c += 1");
    assert!(matches!(e.kind, ErrorKind::AssignToConst(_)));
}

#[test]
fn test_unknown_attribute() {
    let e = compile_str_err("local x <constant> = 1");
    assert!(matches!(e.kind, ErrorKind::UnknownAttribute(ref a) if a == "constant"));
}

#[test]
fn test_unknown_type_hint() {
    let e = compile_str_err("local x: vector = 1");
    assert!(matches!(e.kind, ErrorKind::UnknownTypeHint(ref t) if t == "vector"));
}

#[test]
fn test_multiple_to_be_closed() {
    let e = compile_str_err("local f local a <close>, b <close> = f(), f()");
    assert!(matches!(e.kind, ErrorKind::MultipleToBeClosed));
}

#[test]
fn test_unsupported_tuple_compound_assignment() {
    let e = compile_str_err("local a, b a, b += 1");
    assert!(matches!(e.kind, ErrorKind::UnsupportedTupleAssignment));
}

#[test]
fn test_non_constant_case() {
    let e = compile_str_err("local v, w switch v do case w: end");
    assert!(matches!(e.kind, ErrorKind::NonConstantCase));
}

#[test]
fn test_case_outside_switch() {
    let e = compile_str_err("case 1:");
    assert!(matches!(e.kind, ErrorKind::UnexpectedToken(_)));
}

#[test]
fn test_continue_outside_loop() {
    let e = compile_str_err("continue");
    assert!(matches!(e.kind, ErrorKind::ContinueOutsideLoop));
}

#[test]
fn test_continue_directly_in_case() {
    let e = compile_str_err("local v switch v do case 1: continue end");
    assert!(matches!(e.kind, ErrorKind::ContinueOutsideLoop));
}

#[test]
fn test_continue_in_loop_inside_case_is_fine() {
    compile_str("local v switch v do case 1: for i = 1, 2 do continue end end");
}

#[test]
fn test_continue_in_switch_targets_enclosing_loop() {
    compile_str("for i = 1, 3 do local v switch v do case 1: if v then continue end end end");
}

#[test]
fn test_continue_depth_exceeds_loops() {
    let e = compile_str_err("for i = 1, 3 do continue 2 end");
    assert!(matches!(e.kind, ErrorKind::ContinueOutsideLoop));
}

#[test]
fn test_break_outside_loop() {
    let e = compile_str_err("break");
    assert!(matches!(e.kind, ErrorKind::BreakOutsideLoop(1)));
}

#[test]
fn test_undefined_label() {
    let e = compile_str_err("goto nowhere");
    assert!(matches!(
        e.kind,
        ErrorKind::UndefinedLabel { ref name, .. } if name == "nowhere"
    ));
}

#[test]
fn test_goto_into_local_scope() {
    // The label is not the last statement, so 'v' is still live there.
    let e = compile_str_err("do goto fwd local v = 1 ::fwd:: v = 2 end");
    assert!(matches!(e.kind, ErrorKind::JumpIntoScope(ref n) if n == "v"));
}

#[test]
fn test_goto_past_scope_end_is_fine() {
    // The label is the last non-op statement: locals are already dead.
    compile_str("do goto fwd local v = 1 ::fwd:: end");
}

#[test]
fn test_duplicate_label() {
    let e = compile_str_err("::x:: ::x::");
    assert!(matches!(
        e.kind,
        ErrorKind::DuplicateLabel { ref name, prior_line: 1 } if name == "x"
    ));
}

#[test]
fn test_safe_nav_negated_non_numeral() {
    let e = compile_str_err("local t return t?[-\"s\"]");
    assert!(matches!(e.kind, ErrorKind::SafeNavOnNonNumeric));
}

#[test]
fn test_too_many_locals() {
    let mut src = String::new();
    for i in 0..250 {
        src.push_str(&format!("local v{i}\n"));
    }
    let e = compile_str_err(&src);
    assert!(matches!(
        e.kind,
        ErrorKind::TooMany {
            what: "local variables",
            ..
        }
    ));
}

#[test]
fn test_deep_nesting_overflows() {
    let mut src = String::from("return ");
    src.push_str(&"(".repeat(300));
    src.push('1');
    src.push_str(&")".repeat(300));
    let e = compile_str_err(&src);
    assert!(matches!(e.kind, ErrorKind::StackOverflow));
}

#[test]
fn test_missing_end_anchors_to_last_statement() {
    let e = compile_str_err("if g then\nlocal y = 1\n");
    assert!(matches!(e.kind, ErrorKind::UnterminatedBlock { .. }));
    // Anchored near the last statement, not the dangling EOF line.
    assert_eq!(e.line, 2);
}

#[test]
fn test_missing_end_same_line_is_plain_expected() {
    let e = compile_str_err("if g then local y = 1");
    assert!(matches!(e.kind, ErrorKind::ExpectedToken { .. }));
}

#[test]
fn test_function_arguments_expected() {
    let e = compile_str_err("local t t:m 1");
    assert!(matches!(e.kind, ErrorKind::FunctionArgumentsExpected));
}

#[test]
fn test_unfinished_table_constructor() {
    let e = compile_str_err("local t = {");
    assert!(matches!(e.kind, ErrorKind::UnexpectedToken(_)));
}

#[test]
fn test_return_must_be_last() {
    let e = compile_str_err("return 1 local x = 2");
    assert!(matches!(e.kind, ErrorKind::ExpectedToken { .. }));
}

#[test]
fn test_stray_expression_statement() {
    let e = compile_str_err("local a a + 1");
    assert!(matches!(e.kind, ErrorKind::Syntax(_)));
}

#[test]
fn test_lambda_without_arrow() {
    let e = compile_str_err("local f = |x| x + 1");
    assert!(matches!(e.kind, ErrorKind::ExpectedToken { .. }));
}

#[test]
fn test_error_payload_contains_source_context() {
    let e = compile_str_err("local c <const> = 1 c = 2");
    let text = e.to_string();
    assert!(text.starts_with("test:1: semantic error:"));
    assert!(text.contains("here:"));
}

#[test]
fn test_diagnostic_caret_line_text() {
    let e = compile_str_err("local x <constant> = 1");
    assert_eq!(e.line_text.as_deref(), Some("local x <constant> = 1"));
}
