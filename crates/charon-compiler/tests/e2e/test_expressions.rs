use super::helpers::*;
use charon_compiler::opcode::OpCode;

#[test]
fn test_constant_folding_add() {
    // 1 + 2 folds at parse time: no arithmetic op in the output.
    let c = compile_str("local x = 1 + 2");
    assert!(!has_opcode(&c.proto, OpCode::Add));
    assert!(!has_opcode(&c.proto, OpCode::AddK));
    assert!(!has_opcode(&c.proto, OpCode::AddI));
    assert!(has_opcode(&c.proto, OpCode::LoadI));
}

#[test]
fn test_constant_folding_nested() {
    let c = compile_str("local x = (2 * 3 + 1) // 2");
    assert!(!has_opcode(&c.proto, OpCode::Mul));
    assert!(!has_opcode(&c.proto, OpCode::IDiv));
}

#[test]
fn test_constant_folding_pow_gives_float() {
    let c = compile_str("return 2 ^ 10");
    assert!(!has_opcode(&c.proto, OpCode::Pow));
}

#[test]
fn test_unary_folds() {
    let c = compile_str("return -5");
    assert!(!has_opcode(&c.proto, OpCode::Unm));
    let c = compile_str("return not true");
    assert!(has_opcode(&c.proto, OpCode::LoadFalse));
    let c = compile_str("return ~0");
    assert!(!has_opcode(&c.proto, OpCode::BNot));
}

#[test]
fn test_div_by_zero_not_folded() {
    // Integer division by zero is a runtime error, not a fold.
    let c = compile_str("local a = 1 // 0");
    assert!(has_opcode(&c.proto, OpCode::IDivK) || has_opcode(&c.proto, OpCode::IDiv));
}

#[test]
fn test_register_arith() {
    let c = compile_str("local a, b return a + b");
    assert!(has_opcode(&c.proto, OpCode::Add));
    assert!(has_opcode(&c.proto, OpCode::MmBin));
}

#[test]
fn test_immediate_and_constant_operands() {
    let c = compile_str("local a return a + 1");
    assert!(has_opcode(&c.proto, OpCode::AddI));
    let c = compile_str("local a return a + 1000");
    assert!(has_opcode(&c.proto, OpCode::AddK));
    let c = compile_str("local a return a - 1");
    assert!(has_opcode(&c.proto, OpCode::SubK));
}

#[test]
fn test_unary_ops_on_locals() {
    let c = compile_str("local a return -a, #a, ~a");
    assert!(has_opcode(&c.proto, OpCode::Unm));
    assert!(has_opcode(&c.proto, OpCode::Len));
    assert!(has_opcode(&c.proto, OpCode::BNot));
}

#[test]
fn test_comparisons() {
    let c = compile_str("local a, b if a < b then end");
    assert!(has_opcode(&c.proto, OpCode::Lt));
    let c = compile_str("local a if a < 1 then end");
    assert!(has_opcode(&c.proto, OpCode::LtI));
    let c = compile_str("local a if 1 < a then end");
    assert!(has_opcode(&c.proto, OpCode::GtI));
    let c = compile_str("local a if a == 1 then end");
    assert!(has_opcode(&c.proto, OpCode::EqI));
    let c = compile_str("local a if a == \"s\" then end");
    assert!(has_opcode(&c.proto, OpCode::EqK));
    let c = compile_str("local a, b if a ~= b then end");
    assert!(has_opcode(&c.proto, OpCode::Eq));
}

#[test]
fn test_comparison_materialized_as_value() {
    // Storing a comparison emits the boolean materialization pair.
    let c = compile_str("local a, b local r = a < b");
    assert!(has_opcode(&c.proto, OpCode::LFalseSkip));
    assert!(has_opcode(&c.proto, OpCode::LoadTrue));
}

#[test]
fn test_short_circuit_and_or() {
    let c = compile_str("local a, b local r = a and b");
    assert!(has_opcode(&c.proto, OpCode::TestSet));
    let c = compile_str("local a, b local r = a or b");
    assert!(has_opcode(&c.proto, OpCode::TestSet));
}

#[test]
fn test_condition_drops_testset_value() {
    // In a plain condition, the value is unused: TEST, not TESTSET.
    let c = compile_str("local a, b if a and b then end");
    assert!(has_opcode(&c.proto, OpCode::Test));
    assert!(!has_opcode(&c.proto, OpCode::TestSet));
}

#[test]
fn test_not_in_condition_folds_into_test() {
    let c = compile_str("local a if not a then end");
    assert!(has_opcode(&c.proto, OpCode::Test));
    assert!(!has_opcode(&c.proto, OpCode::Not));
}

#[test]
fn test_concat_chain_is_single_instruction() {
    let c = compile_str("local a, b, c return a .. b .. c");
    assert_eq!(count_opcode(&c.proto, OpCode::Concat), 1);
    let idx = find_opcode(&c.proto, OpCode::Concat).unwrap();
    assert_eq!(c.proto.code[idx].b(), 3);
}

#[test]
fn test_indexing_forms() {
    let c = compile_str("local t return t.x");
    assert!(has_opcode(&c.proto, OpCode::GetField));
    let c = compile_str("local t return t[1]");
    assert!(has_opcode(&c.proto, OpCode::GetI));
    let c = compile_str("local t, k return t[k]");
    assert!(has_opcode(&c.proto, OpCode::GetTable));
    let c = compile_str("return g");
    assert!(has_opcode(&c.proto, OpCode::GetTabUp));
}

#[test]
fn test_global_read_goes_through_env() {
    let c = compile_str("return g");
    assert!(has_string_constant(&c.proto, &c.strings, "g"));
    assert_eq!(c.proto.upvalues.len(), 1);
    assert_eq!(c.strings.get_bytes(c.proto.upvalues[0].name), b"_ENV");
}

#[test]
fn test_call_statement_drops_results() {
    let c = compile_str("print(1)");
    let idx = find_opcode(&c.proto, OpCode::Call).unwrap();
    assert_eq!(c.proto.code[idx].c(), 1);
}

#[test]
fn test_call_expression_keeps_one_result() {
    let c = compile_str("local x = print(1)");
    let idx = find_opcode(&c.proto, OpCode::Call).unwrap();
    assert_eq!(c.proto.code[idx].c(), 2);
}

#[test]
fn test_method_call() {
    let c = compile_str("local t t:m(1)");
    assert!(has_opcode(&c.proto, OpCode::Self_));
    assert!(has_opcode(&c.proto, OpCode::Call));
}

#[test]
fn test_call_with_string_and_table_args() {
    let c = compile_str("local f f \"lit\"");
    assert!(has_opcode(&c.proto, OpCode::Call));
    let c = compile_str("local f f { 1 }");
    assert!(has_opcode(&c.proto, OpCode::NewTable));
    assert!(has_opcode(&c.proto, OpCode::Call));
}

#[test]
fn test_vararg_in_main() {
    let c = compile_str("return ...");
    assert!(has_opcode(&c.proto, OpCode::Vararg));
}

#[test]
fn test_table_constructor_mixed() {
    // { 1, 2, [5]=3, name="n" }: two array items flushed by one SETLIST,
    // plus one SETI and one SETFIELD record store.
    let c = compile_str("local t = { 1, 2, [5] = 3, name = \"n\" }");
    assert!(has_opcode(&c.proto, OpCode::NewTable));
    assert_eq!(count_opcode(&c.proto, OpCode::SetList), 1);
    assert!(has_opcode(&c.proto, OpCode::SetI));
    assert!(has_opcode(&c.proto, OpCode::SetField));
    let idx = find_opcode(&c.proto, OpCode::SetList).unwrap();
    assert_eq!(c.proto.code[idx].b(), 2); // two pending array items
    assert_eq!(c.proto.code[idx].c(), 0); // starting at the front
}

#[test]
fn test_table_constructor_multret_tail() {
    let c = compile_str("local f local t = { f() }");
    let idx = find_opcode(&c.proto, OpCode::SetList).unwrap();
    assert_eq!(c.proto.code[idx].b(), 0); // open count
}

#[test]
fn test_table_constructor_large_array_flushes() {
    let items = (0..120).map(|i| i.to_string()).collect::<Vec<_>>().join(", ");
    let c = compile_str(&format!("local t = {{ {items} }}"));
    // 120 items: two full flushes of 50 plus the tail.
    assert_eq!(count_opcode(&c.proto, OpCode::SetList), 3);
}

#[test]
fn test_if_expression() {
    let c = compile_str("local a local x = if a then 1 else 2");
    assert!(has_opcode(&c.proto, OpCode::Test));
    assert!(has_opcode(&c.proto, OpCode::Jmp));
}

#[test]
fn test_if_expression_in_call() {
    let c = compile_str("local a print(if a then \"y\" else \"n\")");
    assert!(has_opcode(&c.proto, OpCode::Call));
}

#[test]
fn test_parenthesized_multret_truncates() {
    let c = compile_str("local f return (f())");
    let idx = find_opcode(&c.proto, OpCode::Call).unwrap();
    assert_eq!(c.proto.code[idx].c(), 2); // exactly one result
}

#[test]
fn test_nested_calls() {
    let c = compile_str("local f, g return f(g(1), 2)");
    assert_eq!(count_opcode(&c.proto, OpCode::Call), 2);
}
