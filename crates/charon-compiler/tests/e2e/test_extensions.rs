use super::helpers::*;
use charon_compiler::opcode::OpCode;

// ---- Lambdas ----

#[test]
fn test_lambda_basic() {
    let c = compile_str("local f = |x| -> x + 1");
    assert!(has_opcode(&c.proto, OpCode::Closure));
    let inner = &c.proto.protos[0];
    assert_eq!(inner.num_params, 1);
    assert!(has_opcode(inner, OpCode::Return1));
}

#[test]
fn test_lambda_no_params() {
    let c = compile_str("local f = || -> 42");
    assert_eq!(c.proto.protos[0].num_params, 0);
}

#[test]
fn test_lambda_multiple_params_and_capture() {
    let c = compile_str("local base = 10 local f = |a, b| -> a + b + base");
    let inner = &c.proto.protos[0];
    assert_eq!(inner.num_params, 2);
    assert_eq!(inner.upvalues.len(), 1);
}

#[test]
fn test_lambda_as_call_argument() {
    let c = compile_str("local map map({}, |x| -> x * 2)");
    assert!(has_opcode(&c.proto, OpCode::Closure));
    assert!(has_opcode(&c.proto, OpCode::Call));
}

// ---- Safe navigation ----

#[test]
fn test_safe_nav_field() {
    let c = compile_str("local t return t?.x");
    assert!(has_opcode(&c.proto, OpCode::Test));
    assert!(has_opcode(&c.proto, OpCode::GetField));
    assert!(has_opcode(&c.proto, OpCode::Jmp));
}

#[test]
fn test_safe_nav_index() {
    let c = compile_str("local t return t?[1]");
    assert!(has_opcode(&c.proto, OpCode::Test));
    assert!(has_opcode(&c.proto, OpCode::GetI));
}

#[test]
fn test_safe_nav_negative_index() {
    let c = compile_str("local t return t?[-1]");
    assert!(has_opcode(&c.proto, OpCode::Test));
    assert!(has_opcode(&c.proto, OpCode::GetTable));
}

#[test]
fn test_safe_nav_chain() {
    let c = compile_str("local t return t?.a?.b");
    assert_eq!(count_opcode(&c.proto, OpCode::Test), 2);
    assert_eq!(count_opcode(&c.proto, OpCode::GetField), 2);
}

#[test]
fn test_safe_nav_result_register_is_stable() {
    // The whole chain collapses into the receiver's register.
    let c = compile_str("local t local r = t?.x");
    assert!(c.proto.max_stack <= 4);
}

// ---- Null coalescing ----

#[test]
fn test_coalesce_tests_against_nil() {
    let c = compile_str("local a, b return a ?? b");
    assert!(has_opcode(&c.proto, OpCode::EqK));
    assert!(has_opcode(&c.proto, OpCode::Jmp));
    let idx = find_opcode(&c.proto, OpCode::EqK).unwrap();
    assert!(matches!(
        c.proto.constants[c.proto.code[idx].b() as usize],
        charon_compiler::proto::Constant::Nil
    ));
}

#[test]
fn test_coalesce_chain() {
    let c = compile_str("local a, b, cc return a ?? b ?? cc");
    assert_eq!(count_opcode(&c.proto, OpCode::EqK), 2);
}

#[test]
fn test_coalesce_with_call_fallback() {
    let c = compile_str("local a, f return a ?? f()");
    assert!(has_opcode(&c.proto, OpCode::EqK));
    assert!(has_opcode(&c.proto, OpCode::Call));
}

// ---- Compound assignment ----

#[test]
fn test_compound_add() {
    let c = compile_str("local a a += 1");
    assert!(has_opcode(&c.proto, OpCode::AddI));
}

#[test]
fn test_compound_arith_family() {
    let c = compile_str("local a a -= 1 a *= 2 a /= 2 a //= 2 a %= 2 a ^= 2");
    assert!(has_opcode(&c.proto, OpCode::SubK));
    assert!(has_opcode(&c.proto, OpCode::MulK));
    assert!(has_opcode(&c.proto, OpCode::DivK));
    assert!(has_opcode(&c.proto, OpCode::IDivK));
    assert!(has_opcode(&c.proto, OpCode::ModK));
    assert!(has_opcode(&c.proto, OpCode::PowK));
}

#[test]
fn test_compound_bitwise_and_shifts() {
    let c = compile_str("local a a &= 1 a |= 2 a <<= 1 a >>= 1");
    assert!(has_opcode(&c.proto, OpCode::BAndK));
    assert!(has_opcode(&c.proto, OpCode::BOrK));
    assert!(has_opcode(&c.proto, OpCode::ShlI));
    assert!(has_opcode(&c.proto, OpCode::ShrI));
}

#[test]
fn test_compound_concat() {
    let c = compile_str("local a a ..= \"x\"");
    assert!(has_opcode(&c.proto, OpCode::Concat));
}

#[test]
fn test_compound_coalesce() {
    let c = compile_str("local a a ??= 5");
    assert!(has_opcode(&c.proto, OpCode::EqK));
}

#[test]
fn test_compound_on_table_field() {
    let c = compile_str("local t t.n += 1");
    assert!(has_opcode(&c.proto, OpCode::GetField));
    assert!(has_opcode(&c.proto, OpCode::AddI));
    assert!(has_opcode(&c.proto, OpCode::SetField));
}

#[test]
fn test_compound_on_global() {
    let c = compile_str("count += 1");
    assert!(has_opcode(&c.proto, OpCode::GetTabUp));
    assert!(has_opcode(&c.proto, OpCode::SetTabUp));
}

// ---- in operator ----

#[test]
fn test_in_expression() {
    let c = compile_str("local x, t return x in t");
    assert!(has_opcode(&c.proto, OpCode::In));
}

#[test]
fn test_in_expression_in_condition() {
    let c = compile_str("local x, t if x in t then end");
    assert!(has_opcode(&c.proto, OpCode::In));
    assert!(has_opcode(&c.proto, OpCode::Test));
}

// ---- Pseudo-unary plus, '**' ----

#[test]
fn test_pseudo_unary_plus() {
    let c = compile_str("local a return +a");
    assert!(has_opcode(&c.proto, OpCode::AddI));
}

#[test]
fn test_pseudo_unary_plus_on_constant_folds() {
    let c = compile_str("return +5");
    assert!(!has_opcode(&c.proto, OpCode::Add));
    assert!(!has_opcode(&c.proto, OpCode::AddI));
}

#[test]
fn test_star_star_power() {
    let c = compile_str("local a return a ** 2");
    assert!(has_opcode(&c.proto, OpCode::PowK));
}

// ---- Method call on literals ----

#[test]
fn test_method_call_on_string_literal() {
    let c = compile_str("local s = \"ab\":rep(2)");
    assert!(has_opcode(&c.proto, OpCode::Self_));
    assert!(has_opcode(&c.proto, OpCode::Call));
}

// ---- Reserved words as keys ----

#[test]
fn test_reserved_word_record_keys() {
    let c = compile_str("local t = { default = 1, case = 2, end = 3 }");
    assert_eq!(count_opcode(&c.proto, OpCode::SetField), 3);
    assert!(has_string_constant(&c.proto, &c.strings, "default"));
    assert!(has_string_constant(&c.proto, &c.strings, "case"));
}

#[test]
fn test_reserved_word_field_selection() {
    let c = compile_str("local t return t.case");
    assert!(has_opcode(&c.proto, OpCode::GetField));
}

// ---- Compatibility keyword spellings ----

#[test]
fn test_prefixed_keyword_spellings() {
    let c = compile_str("local v charon_switch v do case 1: end");
    assert!(has_opcode(&c.proto, OpCode::EqI));
    let c = compile_str("for i = 1, 2 do charon_continue end");
    assert!(has_opcode(&c.proto, OpCode::ForLoop));
}

// ---- Constructor function fields ----

#[test]
fn test_constructor_function_field() {
    let c = compile_str("local t = { function area() return 0 end }");
    assert!(has_opcode(&c.proto, OpCode::SetField));
    assert_eq!(c.proto.protos.len(), 1);
    // funcfield methods take an implicit self.
    assert_eq!(c.proto.protos[0].num_params, 1);
}
