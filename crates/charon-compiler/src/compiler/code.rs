/// Code-generation primitives: instruction emission, jump-list threading,
/// expression discharge, constant folding, and operator codegen.
///
/// Jump lists are threaded through the sJ field of the pending `Jmp`
/// instructions themselves; `NO_JUMP` terminates a list. Patching walks the
/// chain and rewrites each offset once the target pc is known.
use super::Parser;
use crate::compiler::exp::{BinOpr, ExpDesc, ExpKind, UnOpr, NO_JUMP};
use crate::diag::{CompileError, ErrorKind};
use crate::opcode::{Instruction, OpCode, MAX_B, MAX_BX, MAX_C, MAX_REGS, MAX_SBX, MIN_SBX};
use crate::proto::Constant;

/// Register sentinel for "no value needed" in test instructions.
pub const NO_REG: u8 = crate::opcode::MAX_A as u8;

/// Array fields flushed per `SetList`.
pub const FIELDS_PER_FLUSH: u32 = 50;

/// Metamethod events for the MMBIN fallback instructions.
fn binop_event(op: BinOpr) -> u8 {
    match op {
        BinOpr::Add => 6,
        BinOpr::Sub => 7,
        BinOpr::Mul => 8,
        BinOpr::Mod => 9,
        BinOpr::Pow => 10,
        BinOpr::Div => 11,
        BinOpr::IDiv => 12,
        BinOpr::BAnd => 13,
        BinOpr::BOr => 14,
        BinOpr::BXor => 15,
        BinOpr::Shl => 16,
        BinOpr::Shr => 17,
        _ => 0,
    }
}

fn arith_opcodes(op: BinOpr) -> (OpCode, OpCode) {
    match op {
        BinOpr::Add => (OpCode::Add, OpCode::AddK),
        BinOpr::Sub => (OpCode::Sub, OpCode::SubK),
        BinOpr::Mul => (OpCode::Mul, OpCode::MulK),
        BinOpr::Div => (OpCode::Div, OpCode::DivK),
        BinOpr::IDiv => (OpCode::IDiv, OpCode::IDivK),
        BinOpr::Mod => (OpCode::Mod, OpCode::ModK),
        BinOpr::Pow => (OpCode::Pow, OpCode::PowK),
        BinOpr::BAnd => (OpCode::BAnd, OpCode::BAndK),
        BinOpr::BOr => (OpCode::BOr, OpCode::BOrK),
        BinOpr::BXor => (OpCode::BXor, OpCode::BXorK),
        BinOpr::Shl => (OpCode::Shl, OpCode::Shl),
        BinOpr::Shr => (OpCode::Shr, OpCode::Shr),
        _ => unreachable!("not an arithmetic operator"),
    }
}

impl<'a> Parser<'a> {
    // ---- Raw emission ----

    /// Emit an instruction at the line of the last consumed token.
    pub(super) fn code(&mut self, inst: Instruction) -> i32 {
        let line = self.lx.lastline;
        self.fs_mut().proto.emit(inst, line) as i32
    }

    pub(super) fn code_abc(&mut self, op: OpCode, a: u8, b: u8, c: u8) -> i32 {
        self.code(Instruction::abc(op, a, b, c, false))
    }

    pub(super) fn code_abck(&mut self, op: OpCode, a: u8, b: u8, c: u8, k: bool) -> i32 {
        self.code(Instruction::abc(op, a, b, c, k))
    }

    pub(super) fn code_abx(&mut self, op: OpCode, a: u8, bx: u32) -> i32 {
        self.code(Instruction::abx(op, a, bx))
    }

    pub(super) fn code_asbx(&mut self, op: OpCode, a: u8, sbx: i32) -> i32 {
        self.code(Instruction::asbx(op, a, sbx))
    }

    pub(super) fn code_sj(&mut self, op: OpCode, sj: i32) -> i32 {
        self.code(Instruction::sj(op, sj))
    }

    pub(super) fn code_extra_arg(&mut self, ax: u32) -> i32 {
        self.code(Instruction::ax(OpCode::ExtraArg, ax))
    }

    /// Load constant `k` into `reg`, spilling to LOADKX for large pools.
    fn code_load_k(&mut self, reg: u8, k: u32) {
        if k <= MAX_BX {
            self.code_abx(OpCode::LoadK, reg, k);
        } else {
            self.code_abx(OpCode::LoadKx, reg, 0);
            self.code_extra_arg(k);
        }
    }

    /// Re-attribute the last emitted instruction to `line`.
    pub(super) fn fix_line(&mut self, line: u32) {
        self.fs_mut().proto.fix_line(line);
    }

    // ---- Constant pool ----

    pub(super) fn add_k(&mut self, c: Constant) -> Result<u32, CompileError> {
        let idx = self.fs_mut().proto.add_constant(c);
        if idx > crate::opcode::MAX_AX as usize {
            return Err(self.error_limit("constants", crate::opcode::MAX_AX));
        }
        Ok(idx as u32)
    }

    pub(super) fn string_k(&mut self, s: charon_core::string::StringId) -> Result<u32, CompileError> {
        self.add_k(Constant::String(s))
    }

    pub(super) fn int_k(&mut self, i: i64) -> Result<u32, CompileError> {
        self.add_k(Constant::Integer(i))
    }

    fn float_k(&mut self, f: f64) -> Result<u32, CompileError> {
        self.add_k(Constant::Float(f))
    }

    fn nil_k(&mut self) -> Result<u32, CompileError> {
        self.add_k(Constant::Nil)
    }

    fn bool_k(&mut self, b: bool) -> Result<u32, CompileError> {
        self.add_k(Constant::Boolean(b))
    }

    // ---- Register management ----

    pub(super) fn check_stack(&mut self, n: u8) -> Result<(), CompileError> {
        let needed = self.fs().free_reg as u32 + n as u32;
        if needed > self.fs().proto.max_stack as u32 {
            if needed >= MAX_REGS {
                return Err(self.error_limit("registers", MAX_REGS));
            }
            self.fs_mut().proto.max_stack = needed as u8;
        }
        Ok(())
    }

    pub(super) fn reserve_regs(&mut self, n: u8) -> Result<(), CompileError> {
        self.check_stack(n)?;
        self.fs_mut().free_reg += n;
        Ok(())
    }

    /// Free register `r` if it holds a temporary (not a declared local).
    fn free_one_reg(&mut self, r: u8) {
        if r >= self.nvarstack() {
            self.fs_mut().free_reg -= 1;
            debug_assert_eq!(r, self.fs().free_reg, "register free out of order");
        }
    }

    pub(super) fn free_exp(&mut self, e: &ExpDesc) {
        if let ExpKind::NonReloc(r) = e.kind {
            self.free_one_reg(r);
        }
    }

    /// Free both expressions' registers, higher one first.
    fn free_exps(&mut self, e1: &ExpDesc, e2: &ExpDesc) {
        let r1 = match e1.kind {
            ExpKind::NonReloc(r) => Some(r),
            _ => None,
        };
        let r2 = match e2.kind {
            ExpKind::NonReloc(r) => Some(r),
            _ => None,
        };
        match (r1, r2) {
            (Some(a), Some(b)) if a > b => {
                self.free_one_reg(a);
                self.free_one_reg(b);
            }
            (Some(a), Some(b)) => {
                self.free_one_reg(b);
                self.free_one_reg(a);
            }
            (Some(a), None) => self.free_one_reg(a),
            (None, Some(b)) => self.free_one_reg(b),
            (None, None) => {}
        }
    }

    // ---- Jump lists ----

    /// Emit an unconditional jump with an unresolved target.
    pub(super) fn jump(&mut self) -> i32 {
        self.code_sj(OpCode::Jmp, NO_JUMP)
    }

    /// Emit a jump straight to a known target.
    pub(super) fn jump_to(&mut self, target: i32) -> Result<(), CompileError> {
        let j = self.jump();
        self.patch_list(j, target)
    }

    /// Mark the current pc as a jump target, preventing instruction merges
    /// across it.
    pub(super) fn get_label(&mut self) -> i32 {
        let pc = self.fs().pc();
        self.fs_mut().last_target = pc;
        pc
    }

    /// Destination of the jump at `pc`, or `NO_JUMP` at list end.
    fn get_jump(&self, pc: i32) -> i32 {
        let offset = self.fs().proto.code[pc as usize].get_sj();
        if offset == NO_JUMP {
            NO_JUMP
        } else {
            pc + 1 + offset
        }
    }

    fn fix_jump(&mut self, pc: i32, dest: i32) -> Result<(), CompileError> {
        debug_assert_ne!(dest, NO_JUMP);
        let offset = dest - (pc + 1);
        if !(crate::opcode::MIN_SJ..=crate::opcode::MAX_SJ).contains(&offset) {
            return Err(self.error(ErrorKind::ControlStructureTooLong));
        }
        self.fs_mut().proto.get_mut(pc as usize).set_sj(offset);
        Ok(())
    }

    /// Splice list `l2` onto the end of `*l1`.
    pub(super) fn concat_jump(&mut self, l1: &mut i32, l2: i32) -> Result<(), CompileError> {
        if l2 == NO_JUMP {
            return Ok(());
        }
        if *l1 == NO_JUMP {
            *l1 = l2;
            return Ok(());
        }
        let mut list = *l1;
        loop {
            let next = self.get_jump(list);
            if next == NO_JUMP {
                break;
            }
            list = next;
        }
        self.fix_jump(list, l2)
    }

    /// Patch every jump in `list` to a known target earlier than the
    /// current pc.
    pub(super) fn patch_list(&mut self, list: i32, target: i32) -> Result<(), CompileError> {
        if target == self.fs().pc() {
            return self.patch_to_here(list);
        }
        debug_assert!(target < self.fs().pc());
        self.patch_list_aux(list, target, NO_REG, target)
    }

    /// Patch every jump in `list` to the current position.
    pub(super) fn patch_to_here(&mut self, list: i32) -> Result<(), CompileError> {
        let here = self.get_label();
        self.patch_list_aux(list, here, NO_REG, here)
    }

    /// Core patcher: jumps producing a value go to `vtarget` (patching their
    /// TESTSET register to `reg`), the rest to `dtarget`.
    fn patch_list_aux(
        &mut self,
        mut list: i32,
        vtarget: i32,
        reg: u8,
        dtarget: i32,
    ) -> Result<(), CompileError> {
        while list != NO_JUMP {
            let next = self.get_jump(list);
            if self.patch_test_reg(list, reg) {
                self.fix_jump(list, vtarget)?;
            } else {
                self.fix_jump(list, dtarget)?;
            }
            list = next;
        }
        Ok(())
    }

    /// Position of the instruction controlling the jump at `pc`.
    fn get_control(&self, pc: i32) -> i32 {
        if pc >= 1
            && self.fs().proto.code[(pc - 1) as usize]
                .opcode()
                .is_test()
        {
            pc - 1
        } else {
            pc
        }
    }

    /// Patch the TESTSET controlling the jump at `node` to produce its value
    /// in `reg`, or demote it to TEST when no value is wanted. Returns false
    /// if the jump is not controlled by a TESTSET.
    fn patch_test_reg(&mut self, node: i32, reg: u8) -> bool {
        let ctrl = self.get_control(node);
        let i = self.fs().proto.code[ctrl as usize];
        if i.opcode() != OpCode::TestSet {
            return false;
        }
        if reg != NO_REG && reg != i.b() {
            self.fs_mut().proto.get_mut(ctrl as usize).set_a(reg);
        } else {
            // Value is unused or already in place.
            *self.fs_mut().proto.get_mut(ctrl as usize) =
                Instruction::abc(OpCode::Test, i.b(), 0, 0, i.k());
        }
        true
    }

    /// Does any jump in `list` need a materialized boolean?
    fn need_value(&self, mut list: i32) -> bool {
        while list != NO_JUMP {
            let ctrl = self.get_control(list);
            if self.fs().proto.code[ctrl as usize].opcode() != OpCode::TestSet {
                return true;
            }
            list = self.get_jump(list);
        }
        false
    }

    /// Drop the values produced along a patch list (for `not`).
    fn remove_values(&mut self, mut list: i32) {
        while list != NO_JUMP {
            self.patch_test_reg(list, NO_REG);
            list = self.get_jump(list);
        }
    }

    // ---- Expression discharge ----

    /// Collapse variable references into a form ready for computation:
    /// `NonReloc` or `Reloc`.
    pub(super) fn discharge_vars(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        match e.kind {
            ExpKind::Const(abs_idx) => {
                // Compile-time constant: replace with its folded value.
                let k = self.dyd.actvar[abs_idx as usize]
                    .k
                    .clone()
                    .expect("CTC variable without value");
                e.kind = match k {
                    Constant::Nil => ExpKind::Nil,
                    Constant::Boolean(true) => ExpKind::True,
                    Constant::Boolean(false) => ExpKind::False,
                    Constant::Integer(i) => ExpKind::KInt(i),
                    Constant::Float(f) => ExpKind::KFlt(f),
                    Constant::String(s) => ExpKind::KStr(s),
                };
            }
            ExpKind::Local { ridx, .. } => {
                e.kind = ExpKind::NonReloc(ridx);
            }
            ExpKind::Upval(idx) => {
                let pc = self.code_abc(OpCode::GetUpval, 0, idx, 0);
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::IndexUp { t, key } => {
                let pc = self.code_abc(OpCode::GetTabUp, 0, t, key as u8);
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::IndexI { t, key } => {
                self.free_one_reg(t);
                let pc = self.code_abc(OpCode::GetI, 0, t, key);
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::IndexStr { t, key } => {
                self.free_one_reg(t);
                let pc = self.code_abc(OpCode::GetField, 0, t, key as u8);
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::Indexed { t, key } => {
                if key > t {
                    self.free_one_reg(key);
                    self.free_one_reg(t);
                } else {
                    self.free_one_reg(t);
                    self.free_one_reg(key);
                }
                let pc = self.code_abc(OpCode::GetTable, 0, t, key);
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::Call(_) | ExpKind::Vararg(_) => self.set_one_ret(e),
            _ => {}
        }
        Ok(())
    }

    /// Emit a LOADNIL for `n` consecutive registers, merging with a
    /// directly preceding LOADNIL when no jump targets intervene.
    pub(super) fn code_nil(&mut self, from: u8, n: u8) {
        let pc = self.fs().pc();
        if pc > self.fs().last_target && pc > 0 {
            let prev = self.fs().proto.code[(pc - 1) as usize];
            if prev.opcode() == OpCode::LoadNil {
                let pfrom = prev.a();
                let pto = pfrom + prev.b(); // last register of previous range
                let to = from + n - 1;
                if pfrom <= from && from <= pto + 1 {
                    let new_from = pfrom.min(from);
                    let new_to = pto.max(to);
                    let inst = self.fs_mut().proto.get_mut((pc - 1) as usize);
                    inst.set_a(new_from);
                    inst.set_b(new_to - new_from);
                    return;
                }
            }
        }
        self.code_abc(OpCode::LoadNil, from, n - 1, 0);
    }

    fn code_int_load(&mut self, reg: u8, i: i64) -> Result<(), CompileError> {
        if (MIN_SBX as i64..=MAX_SBX as i64).contains(&i) {
            self.code_asbx(OpCode::LoadI, reg, i as i32);
        } else {
            let k = self.int_k(i)?;
            self.code_load_k(reg, k);
        }
        Ok(())
    }

    fn code_float_load(&mut self, reg: u8, f: f64) -> Result<(), CompileError> {
        let as_int = f as i32;
        if as_int as f64 == f && (MIN_SBX..=MAX_SBX).contains(&as_int) {
            self.code_asbx(OpCode::LoadF, reg, as_int);
        } else {
            let k = self.float_k(f)?;
            self.code_load_k(reg, k);
        }
        Ok(())
    }

    /// Put the (jump-free part of the) expression's value into `reg`.
    fn discharge_to_reg(&mut self, e: &mut ExpDesc, reg: u8) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        match e.kind {
            ExpKind::Nil => self.code_nil(reg, 1),
            ExpKind::False => {
                self.code_abc(OpCode::LoadFalse, reg, 0, 0);
            }
            ExpKind::True => {
                self.code_abc(OpCode::LoadTrue, reg, 0, 0);
            }
            ExpKind::KStr(s) => {
                let k = self.string_k(s)?;
                self.code_load_k(reg, k);
            }
            ExpKind::K(k) => self.code_load_k(reg, k),
            ExpKind::KInt(i) => self.code_int_load(reg, i)?,
            ExpKind::KFlt(f) => self.code_float_load(reg, f)?,
            ExpKind::Reloc(pc) => {
                self.fs_mut().proto.get_mut(pc as usize).set_a(reg);
            }
            ExpKind::NonReloc(r) => {
                if r != reg {
                    self.code_abc(OpCode::Move, reg, r, 0);
                }
            }
            ExpKind::Jump(_) => return Ok(()), // handled by exp_to_reg
            ExpKind::Void => {
                debug_assert!(false, "cannot discharge a void expression");
                return Ok(());
            }
            _ => unreachable!("variable kinds removed by discharge_vars"),
        }
        e.kind = ExpKind::NonReloc(reg);
        Ok(())
    }

    fn discharge_to_any_reg(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        if !matches!(e.kind, ExpKind::NonReloc(_)) {
            self.reserve_regs(1)?;
            let reg = self.fs().free_reg - 1;
            self.discharge_to_reg(e, reg)?;
        }
        Ok(())
    }

    /// Materialize the expression, including its pending true/false lists,
    /// into `reg`.
    pub(super) fn exp_to_reg(&mut self, e: &mut ExpDesc, reg: u8) -> Result<(), CompileError> {
        self.discharge_to_reg(e, reg)?;
        if let ExpKind::Jump(pc) = e.kind {
            self.concat_jump(&mut e.t, pc)?;
        }
        if e.has_jumps() {
            let mut p_f = NO_JUMP;
            let mut p_t = NO_JUMP;
            if self.need_value(e.t) || self.need_value(e.f) {
                let fj = if matches!(e.kind, ExpKind::Jump(_)) {
                    NO_JUMP
                } else {
                    self.jump()
                };
                self.get_label();
                p_f = self.code_abc(OpCode::LFalseSkip, reg, 0, 0);
                self.get_label();
                p_t = self.code_abc(OpCode::LoadTrue, reg, 0, 0);
                self.patch_to_here(fj)?;
            }
            let final_target = self.get_label();
            self.patch_list_aux(e.f, final_target, reg, p_f)?;
            self.patch_list_aux(e.t, final_target, reg, p_t)?;
        }
        e.t = NO_JUMP;
        e.f = NO_JUMP;
        e.kind = ExpKind::NonReloc(reg);
        Ok(())
    }

    /// Materialize at the next free register, advancing the watermark.
    pub(super) fn exp_to_next_reg(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        self.free_exp(e);
        self.reserve_regs(1)?;
        let reg = self.fs().free_reg - 1;
        self.exp_to_reg(e, reg)
    }

    /// Materialize into some register, reusing the current one when safe.
    pub(super) fn exp_to_any_reg(&mut self, e: &mut ExpDesc) -> Result<u8, CompileError> {
        self.discharge_vars(e)?;
        if let ExpKind::NonReloc(r) = e.kind {
            if !e.has_jumps() {
                return Ok(r);
            }
            if r >= self.nvarstack() {
                // Temporary register: may hold the merged result.
                self.exp_to_reg(e, r)?;
                return Ok(r);
            }
        }
        self.exp_to_next_reg(e)?;
        match e.kind {
            ExpKind::NonReloc(r) => Ok(r),
            _ => unreachable!(),
        }
    }

    /// Like `exp_to_any_reg`, but leaves plain upvalues in place.
    pub(super) fn exp_to_any_reg_up(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        if !matches!(e.kind, ExpKind::Upval(_)) || e.has_jumps() {
            self.exp_to_any_reg(e)?;
        }
        Ok(())
    }

    /// Ensure the expression has a definite value, materializing pending
    /// conditionals as booleans.
    pub(super) fn exp_to_val(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        if e.has_jumps() {
            self.exp_to_any_reg(e)?;
        } else {
            self.discharge_vars(e)?;
        }
        Ok(())
    }

    /// Try to turn the expression into a constant-pool reference usable as a
    /// K operand. Fails for non-constants and for pool indexes too large for
    /// an 8-bit operand.
    fn exp_to_k(&mut self, e: &mut ExpDesc) -> Result<bool, CompileError> {
        if e.has_jumps() {
            return Ok(false);
        }
        let idx = match e.kind {
            ExpKind::True => self.bool_k(true)?,
            ExpKind::False => self.bool_k(false)?,
            ExpKind::Nil => self.nil_k()?,
            ExpKind::KInt(i) => self.int_k(i)?,
            ExpKind::KFlt(f) => self.float_k(f)?,
            ExpKind::KStr(s) => self.string_k(s)?,
            ExpKind::K(k) => k,
            _ => return Ok(false),
        };
        if idx <= MAX_C {
            e.kind = ExpKind::K(idx);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Constant-or-register operand: returns true (with `K`) when the value
    /// went to the pool, false (with `NonReloc`) otherwise.
    fn exp_to_rk(&mut self, e: &mut ExpDesc) -> Result<bool, CompileError> {
        if self.exp_to_k(e)? {
            Ok(true)
        } else {
            self.exp_to_any_reg(e)?;
            Ok(false)
        }
    }

    fn code_abrk(
        &mut self,
        op: OpCode,
        a: u8,
        b: u8,
        ec: &mut ExpDesc,
    ) -> Result<i32, CompileError> {
        let k = self.exp_to_rk(ec)?;
        let c = match ec.kind {
            ExpKind::K(idx) => idx as u8,
            ExpKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        Ok(self.code_abck(op, a, b, c, k))
    }

    /// Store the value of `ex` into the variable described by `var`.
    pub(super) fn store_var(
        &mut self,
        var: &ExpDesc,
        ex: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        match var.kind {
            ExpKind::Local { ridx, .. } => {
                self.free_exp(ex);
                return self.exp_to_reg(ex, ridx);
            }
            ExpKind::Upval(idx) => {
                let r = self.exp_to_any_reg(ex)?;
                self.code_abc(OpCode::SetUpval, r, idx, 0);
            }
            ExpKind::IndexUp { t, key } => {
                self.code_abrk(OpCode::SetTabUp, t, key as u8, ex)?;
            }
            ExpKind::IndexI { t, key } => {
                self.code_abrk(OpCode::SetI, t, key, ex)?;
            }
            ExpKind::IndexStr { t, key } => {
                self.code_abrk(OpCode::SetField, t, key as u8, ex)?;
            }
            ExpKind::Indexed { t, key } => {
                self.code_abrk(OpCode::SetTable, t, key, ex)?;
            }
            _ => unreachable!("store target checked by caller"),
        }
        self.free_exp(ex);
        Ok(())
    }

    /// Emit SELF: method lookup plus receiver copy for `e:key(...)`.
    pub(super) fn self_op(
        &mut self,
        e: &mut ExpDesc,
        key: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        let ereg = self.exp_to_any_reg(e)?;
        self.free_exp(e);
        let base = self.fs().free_reg;
        e.kind = ExpKind::NonReloc(base);
        e.t = NO_JUMP;
        e.f = NO_JUMP;
        self.reserve_regs(2)?; // function and 'self' slots
        self.code_abrk(OpCode::Self_, base, ereg, key)?;
        self.free_exp(key);
        Ok(())
    }

    // ---- Indexing ----

    /// Fold `key` into `t`, producing one of the indexed variants.
    /// `t` must already be discharged to a register or upvalue.
    pub(super) fn indexed(
        &mut self,
        t: &mut ExpDesc,
        key: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        if let ExpKind::KStr(s) = key.kind {
            key.kind = ExpKind::K(self.string_k(s)?);
        }
        let key_is_str_k = matches!(
            (key.kind, key.has_jumps()),
            (ExpKind::K(idx), false) if idx <= MAX_B
                && matches!(self.fs().proto.constants[idx as usize], Constant::String(_))
        );
        debug_assert!(!t.has_jumps());
        if matches!(t.kind, ExpKind::Upval(_)) && !key_is_str_k {
            // Upvalue indexed by a non-constant key: table goes to a register.
            self.exp_to_any_reg(t)?;
        }
        match t.kind {
            ExpKind::Upval(u) => {
                let ExpKind::K(idx) = key.kind else { unreachable!() };
                t.kind = ExpKind::IndexUp { t: u, key: idx };
            }
            ExpKind::Local { ridx, .. } | ExpKind::NonReloc(ridx) => {
                if key_is_str_k {
                    let ExpKind::K(idx) = key.kind else { unreachable!() };
                    t.kind = ExpKind::IndexStr { t: ridx, key: idx };
                } else if let ExpKind::KInt(i) = key.kind {
                    if (0..=MAX_C as i64).contains(&i) {
                        t.kind = ExpKind::IndexI {
                            t: ridx,
                            key: i as u8,
                        };
                        return Ok(());
                    }
                    let kreg = self.exp_to_any_reg(key)?;
                    t.kind = ExpKind::Indexed { t: ridx, key: kreg };
                } else {
                    let kreg = self.exp_to_any_reg(key)?;
                    t.kind = ExpKind::Indexed { t: ridx, key: kreg };
                }
            }
            _ => unreachable!("table not discharged before indexing"),
        }
        Ok(())
    }

    // ---- Conditions ----

    /// Invert the comparison controlling the jump at `pc`.
    fn negate_condition(&mut self, pc: i32) {
        let ctrl = self.get_control(pc);
        let i = self.fs().proto.code[ctrl as usize];
        debug_assert!(i.opcode().is_test());
        let flipped = !i.k();
        self.fs_mut().proto.get_mut(ctrl as usize).set_k(flipped);
    }

    fn cond_jump(&mut self, op: OpCode, a: u8, b: u8, c: u8, k: bool) -> i32 {
        self.code_abck(op, a, b, c, k);
        self.jump()
    }

    /// Emit a truthiness test on the expression; the following jump is taken
    /// when the value's truth equals `cond`.
    fn jump_on_cond(&mut self, e: &mut ExpDesc, cond: bool) -> Result<i32, CompileError> {
        if let ExpKind::Reloc(pc) = e.kind {
            let i = self.fs().proto.code[pc as usize];
            if i.opcode() == OpCode::Not && pc == self.fs().pc() - 1 {
                // Test the operand of a trailing NOT directly, inverted.
                self.fs_mut().proto.pop_last();
                return Ok(self.cond_jump(OpCode::Test, i.b(), 0, 0, !cond));
            }
        }
        self.discharge_to_any_reg(e)?;
        self.free_exp(e);
        let r = match e.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        Ok(self.cond_jump(OpCode::TestSet, NO_REG, r, 0, cond))
    }

    /// Prepare the expression to be used as a condition that continues when
    /// true: pending false jumps accumulate in `e.f`.
    pub(super) fn goif_true(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        let pc = match e.kind {
            ExpKind::Jump(j) => {
                self.negate_condition(j);
                j
            }
            ExpKind::K(_)
            | ExpKind::KInt(_)
            | ExpKind::KFlt(_)
            | ExpKind::KStr(_)
            | ExpKind::True => NO_JUMP, // always true: no jump
            _ => self.jump_on_cond(e, false)?,
        };
        self.concat_jump(&mut e.f, pc)?;
        self.patch_to_here(e.t)?;
        e.t = NO_JUMP;
        Ok(())
    }

    /// Dual of `goif_true`: pending true jumps accumulate in `e.t`.
    pub(super) fn goif_false(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        let pc = match e.kind {
            ExpKind::Jump(j) => j,
            ExpKind::Nil | ExpKind::False => NO_JUMP, // always false: no jump
            _ => self.jump_on_cond(e, true)?,
        };
        self.concat_jump(&mut e.t, pc)?;
        self.patch_to_here(e.f)?;
        e.f = NO_JUMP;
        Ok(())
    }

    fn code_not(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        match e.kind {
            ExpKind::Nil | ExpKind::False => e.kind = ExpKind::True,
            ExpKind::K(_)
            | ExpKind::KInt(_)
            | ExpKind::KFlt(_)
            | ExpKind::KStr(_)
            | ExpKind::True => e.kind = ExpKind::False,
            ExpKind::Jump(j) => self.negate_condition(j),
            ExpKind::Reloc(_) | ExpKind::NonReloc(_) => {
                self.discharge_to_any_reg(e)?;
                self.free_exp(e);
                let r = match e.kind {
                    ExpKind::NonReloc(r) => r,
                    _ => unreachable!(),
                };
                e.kind = ExpKind::Reloc(self.code_abc(OpCode::Not, 0, r, 0));
            }
            _ => unreachable!("discharged before 'not'"),
        }
        std::mem::swap(&mut e.t, &mut e.f);
        self.remove_values(e.f);
        self.remove_values(e.t);
        Ok(())
    }

    // ---- Constant folding ----

    fn fold_unop(&mut self, op: UnOpr, e: &mut ExpDesc) -> bool {
        match (op, e.kind) {
            (UnOpr::Minus, ExpKind::KInt(i)) => {
                e.kind = ExpKind::KInt(i.wrapping_neg());
                true
            }
            (UnOpr::Minus, ExpKind::KFlt(f)) => {
                e.kind = ExpKind::KFlt(-f);
                true
            }
            (UnOpr::BNot, ExpKind::KInt(i)) => {
                e.kind = ExpKind::KInt(!i);
                true
            }
            _ => false,
        }
    }

    /// Fold a binary operation over two literal operands, when well-defined.
    fn fold_binop(&mut self, op: BinOpr, e1: &mut ExpDesc, e2: &ExpDesc) -> bool {
        if !e1.is_numeral() || !e2.is_numeral() {
            return false;
        }
        if op.is_bitwise() {
            // Bitwise operators require integral operands.
            let (ExpKind::KInt(a), ExpKind::KInt(b)) = (e1.kind, e2.kind) else {
                return false;
            };
            let r = match op {
                BinOpr::BAnd => a & b,
                BinOpr::BOr => a | b,
                BinOpr::BXor => a ^ b,
                BinOpr::Shl => shift_left(a, b),
                BinOpr::Shr => shift_left(a, b.wrapping_neg()),
                _ => unreachable!(),
            };
            e1.kind = ExpKind::KInt(r);
            return true;
        }
        match (e1.kind, e2.kind) {
            (ExpKind::KInt(a), ExpKind::KInt(b))
                if !matches!(op, BinOpr::Div | BinOpr::Pow) =>
            {
                let r = match op {
                    BinOpr::Add => a.wrapping_add(b),
                    BinOpr::Sub => a.wrapping_sub(b),
                    BinOpr::Mul => a.wrapping_mul(b),
                    BinOpr::IDiv => {
                        if b == 0 {
                            return false; // error at runtime, not fold time
                        }
                        lua_idiv(a, b)
                    }
                    BinOpr::Mod => {
                        if b == 0 {
                            return false;
                        }
                        lua_imod(a, b)
                    }
                    _ => unreachable!(),
                };
                e1.kind = ExpKind::KInt(r);
                true
            }
            _ => {
                let a = match e1.kind {
                    ExpKind::KInt(i) => i as f64,
                    ExpKind::KFlt(f) => f,
                    _ => return false,
                };
                let b = match e2.kind {
                    ExpKind::KInt(i) => i as f64,
                    ExpKind::KFlt(f) => f,
                    _ => return false,
                };
                let r = match op {
                    BinOpr::Add => a + b,
                    BinOpr::Sub => a - b,
                    BinOpr::Mul => a * b,
                    BinOpr::Div => a / b,
                    BinOpr::IDiv => (a / b).floor(),
                    BinOpr::Mod => lua_fmod(a, b),
                    BinOpr::Pow => a.powf(b),
                    _ => return false,
                };
                e1.kind = ExpKind::KFlt(r);
                true
            }
        }
    }

    // ---- Arithmetic codegen ----

    /// Emit the main operation (relocatable) followed by its metamethod
    /// fallback.
    #[allow(clippy::too_many_arguments)]
    fn finish_binexp(
        &mut self,
        e1: &mut ExpDesc,
        e2: &ExpDesc,
        op: OpCode,
        v2: u8,
        flip: bool,
        line: u32,
        mm_op: OpCode,
        event: u8,
    ) -> Result<(), CompileError> {
        let v1 = self.exp_to_any_reg(e1)?;
        let pc = self.code_abc(op, 0, v1, v2);
        self.free_exps(e1, e2);
        e1.kind = ExpKind::Reloc(pc);
        e1.t = NO_JUMP;
        e1.f = NO_JUMP;
        self.fix_line(line);
        self.code_abck(mm_op, v1, v2, event, flip);
        self.fix_line(line);
        Ok(())
    }

    /// Arithmetic or bitwise operation; `flip` records that commutative
    /// operands were swapped (for the metamethod call).
    fn code_arith(
        &mut self,
        op: BinOpr,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        flip: bool,
        line: u32,
    ) -> Result<(), CompileError> {
        let (op_rr, op_rk) = arith_opcodes(op);
        let event = binop_event(op);

        // Small-integer immediate forms.
        if matches!(op, BinOpr::Add | BinOpr::Shl | BinOpr::Shr) {
            if let Some(imm) = Self::int_immediate(e2) {
                let imm_op = match op {
                    BinOpr::Add => OpCode::AddI,
                    BinOpr::Shl => OpCode::ShlI,
                    BinOpr::Shr => OpCode::ShrI,
                    _ => unreachable!(),
                };
                let e2c = *e2;
                return self
                    .finish_binexp(e1, &e2c, imm_op, imm, flip, line, OpCode::MmBinI, event);
            }
        }

        // Constant-pool second operand, for the K variants.
        let k_eligible = if op.is_bitwise() {
            matches!(e2.kind, ExpKind::KInt(_)) && !e2.has_jumps()
        } else {
            e2.is_numeral()
        };
        if op_rk != op_rr && k_eligible && self.exp_to_k(e2)? {
            let ExpKind::K(kidx) = e2.kind else { unreachable!() };
            let e2c = *e2;
            return self.finish_binexp(
                e1,
                &e2c,
                op_rk,
                kidx as u8,
                flip,
                line,
                OpCode::MmBinK,
                event,
            );
        }

        // General register-register form.
        let v2 = self.exp_to_any_reg(e2)?;
        let e2c = *e2;
        self.finish_binexp(e1, &e2c, op_rr, v2, flip, line, OpCode::MmBin, event)
    }

    fn code_commutative(
        &mut self,
        op: BinOpr,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        let mut flip = false;
        if e1.is_numeral() {
            std::mem::swap(e1, e2);
            flip = true;
        }
        if self.fold_binop(op, e1, e2) {
            return Ok(());
        }
        self.code_arith(op, e1, e2, flip, line)
    }

    /// `e1 .. e2`, growing a previous CONCAT when the operands are adjacent.
    fn code_concat(
        &mut self,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        self.exp_to_next_reg(e2)?;
        let ExpKind::NonReloc(r1) = e1.kind else {
            unreachable!("left concat operand not materialized");
        };
        let pc = self.fs().pc();
        if pc > 0 {
            let prev = self.fs().proto.code[(pc - 1) as usize];
            if prev.opcode() == OpCode::Concat && r1 + 1 == prev.a() {
                // Fold into the pending concatenation.
                let n = prev.b();
                self.free_exp(e2);
                let inst = self.fs_mut().proto.get_mut((pc - 1) as usize);
                inst.set_a(r1);
                inst.set_b(n + 1);
                return Ok(());
            }
        }
        self.code_abc(OpCode::Concat, r1, 2, 0);
        self.free_exp(e2);
        self.fix_line(line);
        Ok(())
    }

    // ---- Comparisons ----

    /// Immediate operand for EQI/LTI..., biased by the sC offset.
    fn int_immediate(e: &ExpDesc) -> Option<u8> {
        const OFFSET_SC: i64 = (MAX_C >> 1) as i64;
        match e.kind {
            ExpKind::KInt(i) if !e.has_jumps() && (-OFFSET_SC..=OFFSET_SC + 1).contains(&i) => {
                Some((i + OFFSET_SC) as u8)
            }
            _ => None,
        }
    }

    fn code_eq(
        &mut self,
        op: BinOpr,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        let k = op == BinOpr::Eq; // jump when (equality == k)
        if !matches!(e1.kind, ExpKind::NonReloc(_)) {
            // Constant must be the second operand.
            debug_assert!(matches!(
                e1.kind,
                ExpKind::K(_) | ExpKind::KInt(_) | ExpKind::KFlt(_) | ExpKind::KStr(_)
                    | ExpKind::Nil | ExpKind::True | ExpKind::False
            ));
            std::mem::swap(e1, e2);
        }
        let r1 = self.exp_to_any_reg(e1)?;
        let jump = if let Some(imm) = Self::int_immediate(e2) {
            self.free_exps(e1, e2);
            self.cond_jump(OpCode::EqI, r1, imm, 0, k)
        } else if self.exp_to_k(e2)? {
            let ExpKind::K(kidx) = e2.kind else { unreachable!() };
            self.free_exp(e1);
            self.cond_jump(OpCode::EqK, r1, kidx as u8, 0, k)
        } else {
            let r2 = self.exp_to_any_reg(e2)?;
            self.free_exps(e1, e2);
            self.cond_jump(OpCode::Eq, r1, r2, 0, k)
        };
        e1.kind = ExpKind::Jump(jump);
        Ok(())
    }

    fn code_order(
        &mut self,
        op: BinOpr,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        // a > b  <=>  b < a,  a >= b  <=>  b <= a
        let le = matches!(op, BinOpr::Le | BinOpr::Ge);
        if matches!(op, BinOpr::Gt | BinOpr::Ge) {
            std::mem::swap(e1, e2);
        }
        let jump = if let Some(imm) = Self::int_immediate(e2) {
            let r1 = self.exp_to_any_reg(e1)?;
            self.free_exps(e1, e2);
            let opcode = if le { OpCode::LeI } else { OpCode::LtI };
            self.cond_jump(opcode, r1, imm, 0, true)
        } else if let Some(imm) = Self::int_immediate(e1) {
            // Constant on the left: use the reversed immediate forms.
            let r1 = self.exp_to_any_reg(e2)?;
            self.free_exps(e1, e2);
            let opcode = if le { OpCode::GeI } else { OpCode::GtI };
            self.cond_jump(opcode, r1, imm, 0, true)
        } else {
            let r1 = self.exp_to_any_reg(e1)?;
            let r2 = self.exp_to_any_reg(e2)?;
            self.free_exps(e1, e2);
            let opcode = if le { OpCode::Le } else { OpCode::Lt };
            self.cond_jump(opcode, r1, r2, 0, true)
        };
        e1.kind = ExpKind::Jump(jump);
        Ok(())
    }

    // ---- Operator entry points ----

    /// Apply a unary operator.
    pub(super) fn prefix(
        &mut self,
        op: UnOpr,
        e: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        match op {
            UnOpr::Minus | UnOpr::BNot => {
                if self.fold_unop(op, e) {
                    return Ok(());
                }
                self.code_unexp(op, e, line)
            }
            UnOpr::Len => self.code_unexp(op, e, line),
            UnOpr::Not => self.code_not(e),
        }
    }

    fn code_unexp(
        &mut self,
        op: UnOpr,
        e: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        let r = self.exp_to_any_reg(e)?;
        self.free_exp(e);
        let opcode = match op {
            UnOpr::Minus => OpCode::Unm,
            UnOpr::BNot => OpCode::BNot,
            UnOpr::Len => OpCode::Len,
            UnOpr::Not => unreachable!(),
        };
        e.kind = ExpKind::Reloc(self.code_abc(opcode, 0, r, 0));
        e.t = NO_JUMP;
        e.f = NO_JUMP;
        self.fix_line(line);
        Ok(())
    }

    /// Prepare the left operand before the right side is parsed.
    pub(super) fn infix(&mut self, op: BinOpr, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        match op {
            BinOpr::And => self.goif_true(e),
            BinOpr::Or => self.goif_false(e),
            BinOpr::Coalesce => {
                // Materialize the left operand, then test it against nil.
                // The forward jump (taken when not nil) is stashed on the
                // true list and resolved in posfix.
                self.exp_to_next_reg(e)?;
                let ExpKind::NonReloc(reg) = e.kind else {
                    unreachable!()
                };
                let nilk = self.nil_k()?;
                let j = if nilk <= MAX_B {
                    self.cond_jump(OpCode::EqK, reg, nilk as u8, 0, false)
                } else {
                    // Pool overflow: fall back to a register-held nil.
                    self.reserve_regs(1)?;
                    let tmp = self.fs().free_reg - 1;
                    self.code_nil(tmp, 1);
                    let j = self.cond_jump(OpCode::Eq, reg, tmp, 0, false);
                    self.fs_mut().free_reg -= 1;
                    j
                };
                self.concat_jump(&mut e.t, j)
            }
            BinOpr::Concat => self.exp_to_next_reg(e),
            BinOpr::Eq | BinOpr::Ne => {
                if !e.is_numeral() {
                    self.exp_to_rk(e)?;
                }
                Ok(())
            }
            _ => {
                if !e.is_numeral() {
                    self.exp_to_any_reg(e)?;
                }
                Ok(())
            }
        }
    }

    /// Combine both operands once the right side has been parsed.
    pub(super) fn posfix(
        &mut self,
        op: BinOpr,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        match op {
            BinOpr::And => {
                debug_assert_eq!(e1.t, NO_JUMP, "closed by infix");
                self.discharge_vars(e2)?;
                self.concat_jump(&mut e2.f, e1.f)?;
                *e1 = *e2;
                Ok(())
            }
            BinOpr::Or => {
                debug_assert_eq!(e1.f, NO_JUMP, "closed by infix");
                self.discharge_vars(e2)?;
                self.concat_jump(&mut e2.t, e1.t)?;
                *e1 = *e2;
                Ok(())
            }
            BinOpr::Coalesce => {
                let ExpKind::NonReloc(reg) = e1.kind else {
                    unreachable!("left operand materialized by infix");
                };
                let skip = e1.t;
                e1.t = NO_JUMP;
                // Right operand converges into the same register.
                self.exp_to_reg(e2, reg)?;
                self.fs_mut().free_reg = reg + 1;
                self.patch_to_here(skip)?;
                e1.kind = ExpKind::NonReloc(reg);
                Ok(())
            }
            BinOpr::Concat => self.code_concat(e1, e2, line),
            BinOpr::Add | BinOpr::Mul => {
                if self.fold_binop(op, e1, e2) {
                    return Ok(());
                }
                self.code_commutative(op, e1, e2, line)
            }
            BinOpr::Sub
            | BinOpr::Div
            | BinOpr::IDiv
            | BinOpr::Mod
            | BinOpr::Pow
            | BinOpr::BAnd
            | BinOpr::BOr
            | BinOpr::BXor
            | BinOpr::Shl
            | BinOpr::Shr => {
                if self.fold_binop(op, e1, e2) {
                    return Ok(());
                }
                self.code_arith(op, e1, e2, false, line)
            }
            BinOpr::Eq | BinOpr::Ne => self.code_eq(op, e1, e2),
            BinOpr::Lt | BinOpr::Le | BinOpr::Gt | BinOpr::Ge => self.code_order(op, e1, e2),
        }
    }

    /// Emit the membership test `e1 in e2`; the result lands in `e1`'s
    /// register.
    pub(super) fn code_in(
        &mut self,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        self.exp_to_next_reg(e1)?;
        self.exp_to_next_reg(e2)?;
        let ExpKind::NonReloc(r1) = e1.kind else { unreachable!() };
        let ExpKind::NonReloc(r2) = e2.kind else { unreachable!() };
        self.code_abc(OpCode::In, r1, r1, r2);
        self.free_exp(e2);
        e1.kind = ExpKind::NonReloc(r1);
        Ok(())
    }

    // ---- Calls, returns, varargs ----

    /// Fix an open call or vararg to produce exactly one value.
    pub(super) fn set_one_ret(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::Call(pc) => {
                let a = self.fs().proto.code[pc as usize].a();
                e.kind = ExpKind::NonReloc(a);
            }
            ExpKind::Vararg(pc) => {
                self.fs_mut().proto.get_mut(pc as usize).set_c(2);
                e.kind = ExpKind::Reloc(pc);
            }
            _ => {}
        }
    }

    /// Fix the result count of an open call or vararg; -1 means "all".
    pub(super) fn set_returns(
        &mut self,
        e: &ExpDesc,
        nresults: i32,
    ) -> Result<(), CompileError> {
        let c = (nresults + 1) as u8;
        match e.kind {
            ExpKind::Call(pc) => {
                self.fs_mut().proto.get_mut(pc as usize).set_c(c);
            }
            ExpKind::Vararg(pc) => {
                let free = self.fs().free_reg;
                let inst = self.fs_mut().proto.get_mut(pc as usize);
                inst.set_c(c);
                inst.set_a(free);
                self.reserve_regs(1)?;
            }
            _ => unreachable!("expression has fixed results"),
        }
        Ok(())
    }

    pub(super) fn set_multret(&mut self, e: &ExpDesc) -> Result<(), CompileError> {
        self.set_returns(e, -1)
    }

    /// Emit a return of `nret` values starting at `first`; -1 means "to the
    /// top of the stack".
    pub(super) fn code_ret(&mut self, first: u8, nret: i32) {
        match nret {
            0 => self.code_abc(OpCode::Return0, first, 1, 0),
            1 => self.code_abc(OpCode::Return1, first, 2, 0),
            _ => self.code_abc(OpCode::Return, first, (nret + 1) as u8, 0),
        };
    }

    // ---- Tables ----

    /// Flush `tostore` pending array fields (-1 when the last one is an
    /// open call or vararg).
    pub(super) fn code_setlist(
        &mut self,
        base: u8,
        nelems: u32,
        tostore: i32,
    ) -> Result<(), CompileError> {
        let b = if tostore == -1 { 0 } else { tostore as u8 };
        if nelems <= MAX_C {
            self.code_abck(OpCode::SetList, base, b, nelems as u8, false);
        } else {
            let extra = nelems / (MAX_C + 1);
            let c = nelems % (MAX_C + 1);
            self.code_abck(OpCode::SetList, base, b, c as u8, true);
            self.code_extra_arg(extra);
        }
        self.fs_mut().free_reg = base + 1;
        Ok(())
    }

    /// Patch a NEWTABLE (and its extra-arg slot) with final size hints.
    pub(super) fn settable_size(&mut self, pc: i32, ra: u8, asize: u32, hsize: u32) {
        let rb = if hsize != 0 { ceil_log2(hsize) + 1 } else { 0 };
        let extra = asize / (MAX_C + 1);
        let rc = asize % (MAX_C + 1);
        let k = extra > 0;
        let code = &mut self.fs_mut().proto.code;
        code[pc as usize] = Instruction::abc(OpCode::NewTable, ra, rb as u8, rc as u8, k);
        code[pc as usize + 1] = Instruction::ax(OpCode::ExtraArg, extra);
    }

    // ---- Finalization ----

    /// Final pass over the function's code: returns get their close/vararg
    /// flags now that both are known.
    pub(super) fn finish_code(&mut self) {
        let needs_close = self.fs().needs_close;
        let is_vararg = self.fs().proto.is_vararg;
        let num_params = self.fs().proto.num_params;
        for inst in &mut self.fs_mut().proto.code {
            match inst.opcode() {
                OpCode::Return0 | OpCode::Return1 => {
                    if needs_close || is_vararg {
                        inst.set_opcode(OpCode::Return);
                        if needs_close {
                            inst.set_k(true);
                        }
                        if is_vararg {
                            inst.set_c(num_params + 1);
                        }
                    }
                }
                OpCode::Return | OpCode::TailCall => {
                    if needs_close {
                        inst.set_k(true);
                    }
                    if is_vararg {
                        inst.set_c(num_params + 1);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Lua shift semantics: shifts beyond the integer width produce zero,
/// negative counts shift the other way.
fn shift_left(a: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n >= 0 {
        ((a as u64) << n) as i64
    } else {
        ((a as u64) >> (-n)) as i64
    }
}

/// Floored integer division.
fn lua_idiv(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    if a.wrapping_rem(b) != 0 && (a ^ b) < 0 {
        q - 1
    } else {
        q
    }
}

/// Floored integer modulo.
fn lua_imod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 {
        r + b
    } else {
        r
    }
}

/// Floored float modulo.
fn lua_fmod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r * b < 0.0 {
        r + b
    } else {
        r
    }
}

fn ceil_log2(mut x: u32) -> u32 {
    debug_assert!(x > 0);
    x -= 1;
    let mut l = 0;
    while x >= 1 {
        x >>= 1;
        l += 1;
    }
    l
}
