use super::helpers::*;
use charon_compiler::diag::WarningKind;
use charon_compiler::opcode::OpCode;

#[test]
fn test_hint_mismatch_warns() {
    let c = compile_str("local x: number = \"s\"");
    assert_eq!(c.warnings.len(), 1);
    assert!(matches!(
        c.warnings[0].kind,
        WarningKind::TypeMismatch { ref name, .. } if name == "x"
    ));
}

#[test]
fn test_hint_match_is_silent() {
    let c = compile_str("local s: string = \"a\"\nlocal n: number = 1\nlocal b: bool = true");
    assert!(c.warnings.is_empty());
}

#[test]
fn test_float_matches_number_hint() {
    // Floats and integers share the "number" tag.
    let c = compile_str("local x: number = 1.5");
    assert!(c.warnings.is_empty());
}

#[test]
fn test_userdata_and_function_hints_disable_checks() {
    let c = compile_str("local u: userdata = 5\nlocal f: function = \"s\"");
    assert!(c.warnings.is_empty());
}

#[test]
fn test_hints_never_change_codegen() {
    let hinted = compile_str("local x: number = \"s\" return x");
    let plain = compile_str("local x = \"s\" return x");
    assert_eq!(hinted.proto.code.len(), plain.proto.code.len());
    for (a, b) in hinted.proto.code.iter().zip(&plain.proto.code) {
        assert_eq!(a.0, b.0);
    }
}

#[test]
fn test_reassignment_propagates_type() {
    let c = compile_str("local x: string = \"a\"\nx = 5");
    assert_eq!(c.warnings.len(), 1);
    assert!(matches!(
        c.warnings[0].kind,
        WarningKind::TypeMismatch { .. }
    ));
}

#[test]
fn test_return_hint_mismatch_warns() {
    let c = compile_str("local function f(): number return \"s\" end");
    assert_eq!(c.warnings.len(), 1);
    assert!(matches!(
        c.warnings[0].kind,
        WarningKind::ReturnTypeMismatch { .. }
    ));
}

#[test]
fn test_return_hint_match_is_silent() {
    let c = compile_str("local function f(): string return \"s\" end");
    assert!(c.warnings.is_empty());
}

#[test]
fn test_return_hint_unknown_value_is_silent() {
    let c = compile_str("local g local function f(): number return g end");
    assert!(c.warnings.is_empty());
}

#[test]
fn test_duplicate_local_warns_with_prior_line() {
    let c = compile_str("local a = 1\nlocal a = 2");
    assert_eq!(c.warnings.len(), 1);
    assert!(matches!(
        c.warnings[0].kind,
        WarningKind::DuplicateLocalDeclaration { ref name, prior_line: 1 } if name == "a"
    ));
    assert_eq!(c.warnings[0].line, 2);
}

#[test]
fn test_synthetic_loop_state_does_not_warn() {
    // The internal "(for state)" triples never trip the shadowing check.
    let c = compile_str("for i = 1, 2 do end for j = 1, 2 do end");
    assert!(c.warnings.is_empty());
}

#[test]
fn test_switch_control_slot_does_not_warn() {
    let c = compile_str("local v switch v do case 1: end switch v do case 2: end");
    assert!(c.warnings.is_empty());
}

#[test]
fn test_warnings_do_not_abort_parse() {
    let c = compile_str("local x: number = \"s\"\nlocal y = 2\nreturn y");
    assert!(!c.warnings.is_empty());
    assert!(has_opcode(&c.proto, OpCode::Return1));
}
