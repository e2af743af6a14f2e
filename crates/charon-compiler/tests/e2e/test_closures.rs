use super::helpers::*;
use charon_compiler::opcode::OpCode;

#[test]
fn test_main_has_env_upvalue() {
    let c = compile_str("x = 1");
    assert_eq!(c.proto.upvalues.len(), 1);
    assert_eq!(c.strings.get_bytes(c.proto.upvalues[0].name), b"_ENV");
    assert!(c.proto.upvalues[0].in_stack);
    assert_eq!(c.proto.upvalues[0].index, 0);
}

#[test]
fn test_simple_capture() {
    let c = compile_str("local x = 1 local f = function() return x end");
    let inner = &c.proto.protos[0];
    assert_eq!(inner.upvalues.len(), 1);
    assert_eq!(c.strings.get_bytes(inner.upvalues[0].name), b"x");
    assert!(inner.upvalues[0].in_stack);
    assert_eq!(inner.upvalues[0].index, 0);
}

#[test]
fn test_capture_is_deduplicated() {
    // Two uses of the same variable share one upvalue entry.
    let c = compile_str("local x = 1 local f = function() return x + x end");
    assert_eq!(c.proto.protos[0].upvalues.len(), 1);
}

#[test]
fn test_chain_capture_through_middle_function() {
    // The middle function gains an upvalue solely to pass x inward.
    let c = compile_str(
        "local x = 1\nlocal f = function() return function() return x end end",
    );
    let middle = &c.proto.protos[0];
    let inner = &middle.protos[0];
    assert_eq!(middle.upvalues.len(), 1);
    assert!(middle.upvalues[0].in_stack);
    assert_eq!(inner.upvalues.len(), 1);
    assert!(!inner.upvalues[0].in_stack); // re-captured from an upvalue
    assert_eq!(inner.upvalues[0].index, 0);
}

#[test]
fn test_global_through_env_in_nested_function() {
    let c = compile_str("local f = function() return g end");
    let inner = &c.proto.protos[0];
    assert!(inner
        .upvalues
        .iter()
        .any(|u| c.strings.get_bytes(u.name) == b"_ENV"));
    assert!(has_opcode(inner, OpCode::GetTabUp));
}

#[test]
fn test_block_exit_closes_captured_local() {
    let c = compile_str(
        "local function f()\n  do local x = 1 local g = function() return x end end\nend",
    );
    assert!(has_opcode(&c.proto.protos[0], OpCode::Close));
}

#[test]
fn test_function_scope_close_via_return_flag() {
    // When the captured local's block is the function's outermost, the
    // close is folded into the return instead of a CLOSE instruction.
    let c = compile_str(
        "local function f() local x = 1 return function() return x end end",
    );
    let f = &c.proto.protos[0];
    assert!(!has_opcode(f, OpCode::Close));
    let ret = f
        .code
        .iter()
        .find(|i| i.opcode() == OpCode::Return || i.opcode() == OpCode::Return0)
        .expect("return present");
    assert!(ret.k());
    let inner = &f.protos[0];
    assert_eq!(inner.upvalues.len(), 1);
    assert!(inner.upvalues[0].in_stack);
    assert_eq!(inner.upvalues[0].index, 0);
}

#[test]
fn test_loop_iteration_closes_captured_local() {
    let c = compile_str(
        "local fns = {} for i = 1, 3 do local x = i fns[i] = function() return x end end",
    );
    assert!(has_opcode(&c.proto, OpCode::Close));
}

#[test]
fn test_break_out_of_capturing_block_closes() {
    let c = compile_str(
        "while true do local x = 1 local g = function() return x end break end",
    );
    assert!(has_opcode(&c.proto, OpCode::Close));
}

#[test]
fn test_upvalue_names_unique_per_proto() {
    let c = compile_str(
        "local a, b = 1, 2 local f = function() return a + b + a end",
    );
    let inner = &c.proto.protos[0];
    let mut names: Vec<_> = inner
        .upvalues
        .iter()
        .map(|u| c.strings.get_bytes(u.name).to_vec())
        .collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), inner.upvalues.len());
}

#[test]
fn test_param_capture() {
    let c = compile_str("local function f(x) return function() return x end end");
    let inner = &c.proto.protos[0].protos[0];
    assert_eq!(inner.upvalues.len(), 1);
    assert!(inner.upvalues[0].in_stack);
    assert_eq!(inner.upvalues[0].index, 0); // parameter register
}
