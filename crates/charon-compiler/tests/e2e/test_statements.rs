use super::helpers::*;
use charon_compiler::opcode::OpCode;
use charon_compiler::proto::VarKind;

#[test]
fn test_empty_chunk_shape() {
    let c = compile_str("");
    assert_eq!(c.proto.code[0].opcode(), OpCode::VarargPrep);
    assert!(c.proto.code[1].opcode().is_return());
    assert!(c.proto.is_vararg);
}

#[test]
fn test_local_declarations() {
    let c = compile_str("local a");
    assert!(has_opcode(&c.proto, OpCode::LoadNil));
    let c = compile_str("local a, b = 1");
    // Missing values are padded with nil.
    assert!(has_opcode(&c.proto, OpCode::LoadNil));
    let c = compile_str("local a = 1, 2");
    // Surplus values are dropped.
    assert!(has_opcode(&c.proto, OpCode::LoadI));
}

#[test]
fn test_local_debug_info() {
    let c = compile_str("do local alpha = 1 end local beta = 2");
    let names: Vec<_> = c
        .proto
        .local_vars
        .iter()
        .map(|lv| c.strings.get_str(lv.name).into_owned())
        .collect();
    assert!(names.contains(&"alpha".to_string()));
    assert!(names.contains(&"beta".to_string()));
    // alpha's scope closed at the 'do' block end.
    let alpha = &c.proto.local_vars[0];
    assert!(alpha.end_pc > alpha.start_pc || alpha.end_pc > 0);
}

#[test]
fn test_if_elseif_else() {
    let c = compile_str(
        "local a, r if a == 1 then r = 1 elseif a == 2 then r = 2 else r = 3 end",
    );
    assert!(count_opcode(&c.proto, OpCode::EqI) == 2);
    assert!(has_opcode(&c.proto, OpCode::Jmp));
}

#[test]
fn test_while_loop_shape() {
    let c = compile_str("local n while n do n = nil end");
    assert!(has_opcode(&c.proto, OpCode::Test));
    // One back jump plus the exit jump.
    assert!(count_opcode(&c.proto, OpCode::Jmp) >= 2);
}

#[test]
fn test_repeat_until() {
    let c = compile_str("local n repeat n = 1 until n");
    assert!(has_opcode(&c.proto, OpCode::Test));
}

#[test]
fn test_repeat_when() {
    // 'when' inverts the terminator: repeat while the condition holds.
    let c = compile_str("local n repeat n = 1 when n");
    assert!(has_opcode(&c.proto, OpCode::Test));
}

#[test]
fn test_numeric_for() {
    let c = compile_str("for i = 1, 10 do end");
    assert!(has_opcode(&c.proto, OpCode::ForPrep));
    assert!(has_opcode(&c.proto, OpCode::ForLoop));
}

#[test]
fn test_numeric_for_default_step_is_int_one() {
    let c = compile_str("for i = 1, 10 do end");
    // init, limit, and the synthesized step.
    assert_eq!(count_opcode(&c.proto, OpCode::LoadI), 3);
}

#[test]
fn test_numeric_for_break_patches_past_loop() {
    let c = compile_str("for i = 1, 10 do if i == 5 then break end end");
    assert!(has_opcode(&c.proto, OpCode::ForPrep));
    assert!(has_opcode(&c.proto, OpCode::EqI));
    assert!(!has_opcode(&c.proto, OpCode::Close));
}

#[test]
fn test_generic_for() {
    let c = compile_str("local t for k, v in t do end");
    assert!(has_opcode(&c.proto, OpCode::TForPrep));
    assert!(has_opcode(&c.proto, OpCode::TForCall));
    assert!(has_opcode(&c.proto, OpCode::TForLoop));
    let idx = find_opcode(&c.proto, OpCode::TForCall).unwrap();
    assert_eq!(c.proto.code[idx].c(), 2); // two declared variables
}

#[test]
fn test_goto_forward_and_backward() {
    let c = compile_str("goto done ::done::");
    assert!(has_opcode(&c.proto, OpCode::Jmp));
    let c = compile_str("::top:: goto top");
    assert!(has_opcode(&c.proto, OpCode::Jmp));
}

#[test]
fn test_goto_backward_closes_locals() {
    // Jumping back out of the scope of a captured local emits CLOSE.
    let c = compile_str(
        "::top:: local x = 1 local f = function() return x end goto top",
    );
    assert!(has_opcode(&c.proto, OpCode::Close));
}

#[test]
fn test_break_skips_later_declaration() {
    let c = compile_str("while true do if g then break end local y = 1 end");
    assert!(has_opcode(&c.proto, OpCode::Jmp));
}

#[test]
fn test_local_close_attribute() {
    let c = compile_str("local f local r <close> = f()");
    assert!(has_opcode(&c.proto, OpCode::Tbc));
}

#[test]
fn test_compile_time_constant_emits_nothing() {
    let c = compile_str("local k <const> = 5");
    // A folded constant occupies no register and emits no load.
    assert!(!has_opcode(&c.proto, OpCode::LoadI));
    assert!(c.proto.local_vars.is_empty());
}

#[test]
fn test_compile_time_constant_folds_into_uses() {
    let c = compile_str("local k <const> = 5 return k + 1");
    assert!(!has_opcode(&c.proto, OpCode::Add));
    assert!(!has_opcode(&c.proto, OpCode::AddI));
}

#[test]
fn test_const_chain_folds() {
    let c = compile_str("local a <const> = 1 local b <const> = a return b");
    assert!(!has_opcode(&c.proto, OpCode::Move));
}

#[test]
fn test_const_without_constant_value_keeps_register() {
    let c = compile_str("local f local a <const> = f() return a");
    assert!(has_opcode(&c.proto, OpCode::Call));
    assert_eq!(c.proto.local_vars.len(), 2);
}

#[test]
fn test_multiple_assignment_swap() {
    let c = compile_str("local a, b = 1, 2 a, b = b, a");
    assert!(has_opcode(&c.proto, OpCode::Move));
}

#[test]
fn test_assignment_conflict_uses_safe_copy() {
    // a[1], a = 1, 2: the indexed store must read the original table.
    let c = compile_str("local a = {} a[1], a = 1, 2");
    assert!(has_opcode(&c.proto, OpCode::Move));
    assert!(has_opcode(&c.proto, OpCode::SetI));
}

#[test]
fn test_multi_assignment_with_multret() {
    let c = compile_str("local f local a, b, cc = f()");
    let idx = find_opcode(&c.proto, OpCode::Call).unwrap();
    assert_eq!(c.proto.code[idx].c(), 4); // three results
}

#[test]
fn test_function_statement_stores_global() {
    let c = compile_str("function f() end");
    assert!(has_opcode(&c.proto, OpCode::Closure));
    assert!(has_opcode(&c.proto, OpCode::SetTabUp));
}

#[test]
fn test_function_chain_and_method_definition() {
    let c = compile_str("local t = {} function t.a.b() end");
    assert!(has_opcode(&c.proto, OpCode::SetField));
    let c = compile_str("local t = {} function t:m() end");
    assert_eq!(c.proto.protos[0].num_params, 1); // implicit self
}

#[test]
fn test_local_function_recursion_visible() {
    // The name is active inside its own body: no global lookup.
    let c = compile_str("local function f() return f() end");
    assert!(c.proto.protos[0].upvalues.iter().any(|u| {
        c.strings.get_bytes(u.name) == b"f"
    }));
}

#[test]
fn test_return_forms() {
    let c = compile_str("return");
    assert!(has_opcode(&c.proto, OpCode::Return0) || has_opcode(&c.proto, OpCode::Return));
    let c = compile_str("local a return a");
    assert!(has_opcode(&c.proto, OpCode::Return1) || has_opcode(&c.proto, OpCode::Return));
    let c = compile_str("local a, b return a, b");
    assert!(has_opcode(&c.proto, OpCode::Return));
}

#[test]
fn test_return_tail_call() {
    let c = compile_str("local function f() return f() end");
    assert!(has_opcode(&c.proto.protos[0], OpCode::TailCall));
}

#[test]
fn test_no_tail_call_inside_tbc_scope() {
    let c = compile_str(
        "local function f(x) local r <close> = x return f(x) end",
    );
    assert!(!has_opcode(&c.proto.protos[0], OpCode::TailCall));
}

#[test]
fn test_continue_in_while() {
    let c = compile_str("local n while n do continue end");
    assert!(count_opcode(&c.proto, OpCode::Jmp) >= 3);
}

#[test]
fn test_continue_in_numeric_for() {
    let c = compile_str("for i = 1, 10 do continue end");
    assert!(has_opcode(&c.proto, OpCode::ForLoop));
}

#[test]
fn test_continue_with_depth() {
    let c = compile_str("for i = 1, 3 do for j = 1, 3 do continue 2 end end");
    assert_eq!(count_opcode(&c.proto, OpCode::ForLoop), 2);
}

#[test]
fn test_switch_basic_shape() {
    let c = compile_str(
        "local v switch v do case 1: print(\"a\") case 2: print(\"b\") default: print(\"c\") end",
    );
    // Each case tests the saved control value.
    assert_eq!(count_opcode(&c.proto, OpCode::EqI), 2);
    assert_eq!(count_opcode(&c.proto, OpCode::Call), 3);
}

#[test]
fn test_switch_without_default_same_case_code() {
    // Removing 'default' must not change the code for reached cases.
    let with = compile_str("local v switch v do case 1: v = 2 default: v = 3 end");
    let without = compile_str("local v switch v do case 1: v = 2 end");
    let eq_with = find_opcode(&with.proto, OpCode::EqI).unwrap();
    let eq_without = find_opcode(&without.proto, OpCode::EqI).unwrap();
    assert_eq!(eq_with, eq_without);
    for off in 0..3 {
        assert_eq!(
            with.proto.code[eq_with + off].0,
            without.proto.code[eq_without + off].0
        );
    }
}

#[test]
fn test_switch_string_and_negative_cases() {
    let c = compile_str(
        "local v switch v do case \"x\": v = 1 case -2: v = 2 case +3: v = 3 end",
    );
    assert!(has_opcode(&c.proto, OpCode::EqK));
    assert!(has_opcode(&c.proto, OpCode::EqI));
}

#[test]
fn test_switch_parenthesized_control() {
    let c = compile_str("local v switch (v) do case 1: end");
    assert!(has_opcode(&c.proto, OpCode::EqI));
}

#[test]
fn test_switch_break_leaves_switch() {
    let c = compile_str("local v switch v do case 1: break case 2: v = 3 end");
    assert!(has_opcode(&c.proto, OpCode::Jmp));
}

#[test]
fn test_switch_default_trailing_break() {
    let c = compile_str("local v switch v do case 1: v = 2 default: break end");
    assert!(has_opcode(&c.proto, OpCode::EqI));
}

#[test]
fn test_switch_case_constant_from_const_local() {
    let c = compile_str("local k <const> = 7 local v switch v do case k: v = 1 end");
    assert!(has_opcode(&c.proto, OpCode::EqI));
}

#[test]
fn test_upvalue_kind_propagates_to_capture() {
    let c = compile_str("local k <close> = nil local f = function() return k end");
    assert_eq!(c.proto.protos[0].upvalues[0].kind, VarKind::ToBeClosed);
}

#[test]
fn test_semicolons_are_empty_statements() {
    let c = compile_str(";;; local a = 1 ;;;");
    assert!(has_opcode(&c.proto, OpCode::LoadI));
}
