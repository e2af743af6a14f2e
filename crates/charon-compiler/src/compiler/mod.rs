/// Single-pass Charon compiler: source → Proto bytecode.
///
/// The parser is a recursive-descent grammar walker that emits code as it
/// goes; there is no AST. Expressions travel as `ExpDesc` values whose
/// materialization is deferred until a register is actually needed, and
/// control flow is stitched together with jump-patch lists.
pub mod code;
pub mod exp;
pub mod scope;

use crate::diag::{CompileError, ErrorKind, Warning, WarningKind};
use crate::lexer::{LexError, Lexer};
use crate::opcode::{Instruction, OpCode, MAX_BX};
use crate::proto::{Constant, LocalVar, Proto, UpvalDesc, VarKind};
use crate::token::{CompoundOp, Token};
use crate::typehint::ValueKind;
use charon_core::string::{StringId, StringInterner};
use exp::{BinOpr, ExpDesc, ExpKind, UnOpr, NO_JUMP, UNARY_PRIORITY};
use scope::{BlockCnt, BlockKind, Dyndata, FuncState, LabelDesc, VarDesc, MAX_VARS};

/// Hard bound on grammar recursion depth.
const MAX_LEVELS: u32 = 200;

/// Limit on pending labels and gotos.
const MAX_LABELS: usize = i16::MAX as usize;

/// Return-kind propagation through statement lists: `NotSeen` until some
/// `return` with values executes on a path.
#[derive(Clone, Copy, Debug, PartialEq)]
enum RetProp {
    NotSeen,
    Known(ValueKind),
}

/// Result of a successful compilation.
pub struct Chunk {
    pub proto: Proto,
    pub strings: StringInterner,
    pub warnings: Vec<Warning>,
}

/// The parser: lexer, shared dynamic state, and the function-state stack.
pub struct Parser<'a> {
    lx: Lexer<'a>,
    dyd: Dyndata,
    funcs: Vec<FuncState>,
    source_name: String,
    env_name: StringId,
    break_name: StringId,
    c_calls: u32,
    warnings: Vec<Warning>,
}

impl<'a> Parser<'a> {
    fn new(source: &'a [u8], name: &str) -> Self {
        let mut lx = Lexer::new(source);
        let env_name = lx.strings.intern(b"_ENV");
        let break_name = lx.strings.intern(b"break");
        Parser {
            lx,
            dyd: Dyndata::default(),
            funcs: Vec::new(),
            source_name: name.to_string(),
            env_name,
            break_name,
            c_calls: 0,
            warnings: Vec::new(),
        }
    }

    pub(crate) fn fs(&self) -> &FuncState {
        self.funcs.last().expect("no active function")
    }

    pub(crate) fn fs_mut(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("no active function")
    }

    // ---- Errors and warnings ----

    fn err_at(&self, kind: ErrorKind, line: u32) -> CompileError {
        let mut e = CompileError::new(kind, line, self.source_name.clone());
        if let Some(text) = self.lx.line_text(line) {
            e.line_text = Some(text);
        }
        e
    }

    pub(crate) fn error(&self, kind: ErrorKind) -> CompileError {
        self.err_at(kind, self.lx.line())
    }

    fn error_hint(&self, kind: ErrorKind, hint: &str) -> CompileError {
        let mut e = self.error(kind);
        e.hint = Some(hint.to_string());
        e
    }

    pub(crate) fn error_limit(&self, what: &'static str, limit: u32) -> CompileError {
        self.error(ErrorKind::TooMany { what, limit })
    }

    fn lex_error(&self, e: LexError) -> CompileError {
        self.err_at(e.kind.clone(), e.line)
    }

    fn warn(&mut self, kind: WarningKind, line: u32) {
        let w = Warning { kind, line };
        tracing::warn!(target: "charon::compiler", "{}:{}: {w}", self.source_name, line);
        self.warnings.push(w);
    }

    fn enter_level(&mut self) -> Result<(), CompileError> {
        self.c_calls += 1;
        if self.c_calls > MAX_LEVELS {
            return Err(self.error(ErrorKind::StackOverflow));
        }
        Ok(())
    }

    fn leave_level(&mut self) {
        self.c_calls -= 1;
    }

    // ---- Token helpers ----

    fn current(&self) -> Result<&Token, CompileError> {
        self.lx
            .current()
            .map(|st| &st.token)
            .map_err(|e| self.lex_error(e))
    }

    fn check(&self, expected: &Token) -> bool {
        self.current().map(|t| t == expected).unwrap_or(false)
    }

    fn advance(&mut self) -> Result<Token, CompileError> {
        self.lx
            .advance()
            .map(|st| st.token)
            .map_err(|e| self.lex_error(e))
    }

    fn peek_next(&mut self) -> Result<Token, CompileError> {
        match self.lx.peek_next() {
            Ok(t) => Ok(t.clone()),
            Err(e) => Err(self.lex_error(e)),
        }
    }

    fn test_next(&mut self, expected: &Token) -> Result<bool, CompileError> {
        if self.check(expected) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Hint attached to "expected token" diagnostics for tokens with a
    /// dedicated message in the grammar.
    fn expected_hint(expected: &Token) -> &'static str {
        match expected {
            Token::Pipe => "expected '|' to begin and terminate the lambda's parameter list.",
            Token::Arrow => "expected '->' arrow syntax for lambda expression.",
            Token::In => "expected 'in' symbol.",
            Token::Do => "you need to append this with the 'do' symbol.",
            Token::End => "expected 'end' symbol after or on this line.",
            Token::Then => "expected 'then' symbol.",
            Token::Case => "expected 'case' to open a switch arm.",
            _ => "this is invalid syntax.",
        }
    }

    fn error_expected(&self, expected: &Token) -> CompileError {
        let found = self
            .current()
            .map(|t| t.to_string())
            .unwrap_or_else(|_| "error".into());
        self.error_hint(
            ErrorKind::ExpectedToken {
                expected: format!("'{expected}'"),
                found: format!("'{found}'"),
            },
            Self::expected_hint(expected),
        )
    }

    fn expect(&mut self, expected: &Token) -> Result<(), CompileError> {
        if self.test_next(expected)? {
            Ok(())
        } else {
            Err(self.error_expected(expected))
        }
    }

    /// `check_match`: expect the closing token of a construct opened at
    /// `where_line`, anchoring the diagnostic near the last statement when
    /// the opener is on an earlier line.
    fn check_match(
        &mut self,
        what: &Token,
        who: &Token,
        where_line: u32,
    ) -> Result<(), CompileError> {
        if self.test_next(what)? {
            return Ok(());
        }
        if where_line == self.lx.line() {
            return Err(self.error_expected(what));
        }
        let kind = ErrorKind::UnterminatedBlock {
            terminator: what.to_string(),
            opener: who.to_string(),
            opener_line: where_line,
        };
        if *what == Token::End {
            let line = self.lx.lastline;
            let mut e = self.err_at(kind, line);
            e.hint = Some("this was the last statement.".to_string());
            Err(e)
        } else {
            Err(self.error(kind))
        }
    }

    /// Read a name. Unless `strict`, reserved words that cannot begin a
    /// value are accepted as names (for field-like positions).
    fn str_checkname(&mut self, strict: bool) -> Result<StringId, CompileError> {
        let tok = self.current()?.clone();
        match tok {
            Token::Name(id) => {
                self.advance()?;
                Ok(id)
            }
            t if !strict && t.is_reserved_nonvalue() => {
                let s = t.reserved_str().unwrap();
                let id = self.lx.strings.intern(s.as_bytes());
                self.advance()?;
                Ok(id)
            }
            _ => Err(self.error_hint(
                ErrorKind::ExpectedToken {
                    expected: "<name>".into(),
                    found: format!(
                        "'{}'",
                        self.current().map(|t| t.to_string()).unwrap_or_default()
                    ),
                },
                "this needs a name.",
            )),
        }
    }

    fn codename(&mut self) -> Result<ExpDesc, CompileError> {
        let id = self.str_checkname(false)?;
        Ok(ExpDesc::str(id))
    }

    fn name_str(&self, id: StringId) -> String {
        self.lx.strings.get_str(id).into_owned()
    }

    // ---- Active-variable table ----

    fn var(&self, fsi: usize, vidx: u16) -> &VarDesc {
        &self.dyd.actvar[self.funcs[fsi].first_local + vidx as usize]
    }

    fn var_mut(&mut self, vidx: u16) -> &mut VarDesc {
        let abs = self.fs().first_local + vidx as usize;
        &mut self.dyd.actvar[abs]
    }

    /// Register level corresponding to compiler index `nvar` in the current
    /// function: compile-time constants occupy no register.
    pub(crate) fn reg_level(&self, nvar: u16) -> u8 {
        self.reg_level_at(self.funcs.len() - 1, nvar)
    }

    fn reg_level_at(&self, fsi: usize, nvar: u16) -> u8 {
        let mut n = nvar;
        while n > 0 {
            n -= 1;
            let vd = self.var(fsi, n);
            if vd.kind != VarKind::CompileTimeConst {
                return vd.ridx + 1;
            }
        }
        0
    }

    /// Number of variables currently in registers for the active function.
    pub(crate) fn nvarstack(&self) -> u8 {
        self.reg_level(self.fs().nactvar)
    }

    /// Declare a new local. Returns its compiler index; the variable is not
    /// visible until `adjust_locals` activates it.
    fn new_localvar(&mut self, name: StringId) -> Result<u16, CompileError> {
        let line = self.lx.line();
        // Shadowing check, skipping internal synthetic names.
        if !self.lx.strings.get_bytes(name).starts_with(b"(") {
            let fsi = self.funcs.len() - 1;
            for i in 0..self.fs().nactvar {
                let vd = self.var(fsi, i);
                if vd.kind != VarKind::CompileTimeConst && vd.name == name {
                    let prior_line = vd.line;
                    let n = self.name_str(name);
                    self.warn(
                        WarningKind::DuplicateLocalDeclaration {
                            name: n,
                            prior_line,
                        },
                        line,
                    );
                    break;
                }
            }
        }
        let declared = self.dyd.actvar.len() + 1 - self.fs().first_local;
        if declared > MAX_VARS {
            return Err(self.error_limit("local variables", MAX_VARS as u32));
        }
        self.dyd.actvar.push(VarDesc {
            name,
            kind: VarKind::Regular,
            type_hint: ValueKind::Unknown,
            type_prop: ValueKind::Unknown,
            ridx: 0,
            pidx: 0,
            line,
            k: None,
        });
        Ok((self.dyd.actvar.len() - 1 - self.fs().first_local) as u16)
    }

    fn new_localvar_literal(&mut self, name: &str) -> Result<u16, CompileError> {
        let id = self.lx.strings.intern(name.as_bytes());
        self.new_localvar(id)
    }

    /// Create the debug entry for a variable entering scope.
    fn register_local_debug(&mut self, name: StringId) -> u16 {
        let pc = self.fs().pc() as u32;
        let fs = self.fs_mut();
        fs.proto.local_vars.push(LocalVar {
            name,
            start_pc: pc,
            end_pc: 0,
        });
        (fs.proto.local_vars.len() - 1) as u16
    }

    /// Activate the last `n` declared variables: assign registers and debug
    /// slots. This is the moment a declaration becomes visible.
    fn adjust_locals(&mut self, n: u16) {
        let mut reg = self.nvarstack();
        for _ in 0..n {
            let vidx = self.fs().nactvar;
            self.fs_mut().nactvar += 1;
            let name = self.var_mut(vidx).name;
            let pidx = self.register_local_debug(name);
            let var = self.var_mut(vidx);
            var.ridx = reg;
            var.pidx = pidx;
            reg += 1;
        }
    }

    /// Close the scope of all variables down to compiler level `to_level`.
    fn remove_vars(&mut self, to_level: u16) {
        let pc = self.fs().pc() as u32;
        while self.fs().nactvar > to_level {
            let vidx = self.fs().nactvar - 1;
            self.fs_mut().nactvar = vidx;
            let var = self.var_mut(vidx);
            if var.kind != VarKind::CompileTimeConst {
                let pidx = var.pidx as usize;
                self.fs_mut().proto.local_vars[pidx].end_pc = pc;
            }
            self.dyd.actvar.pop();
        }
    }

    /// Look up `name` among the active locals of function `fsi`.
    fn search_var(&self, fsi: usize, name: StringId) -> Option<ExpDesc> {
        let fs = &self.funcs[fsi];
        for i in (0..fs.nactvar).rev() {
            let vd = self.var(fsi, i);
            if vd.name == name {
                return Some(if vd.kind == VarKind::CompileTimeConst {
                    ExpDesc::new(ExpKind::Const((fs.first_local + i as usize) as u32))
                } else {
                    ExpDesc::new(ExpKind::Local {
                        vidx: i,
                        ridx: vd.ridx,
                    })
                });
            }
        }
        None
    }

    fn search_upvalue(&self, fsi: usize, name: StringId) -> Option<u8> {
        self.funcs[fsi]
            .proto
            .upvalues
            .iter()
            .position(|u| u.name == name)
            .map(|i| i as u8)
    }

    fn new_upvalue(
        &mut self,
        fsi: usize,
        name: StringId,
        v: &ExpDesc,
    ) -> Result<u8, CompileError> {
        if self.funcs[fsi].proto.upvalues.len() >= 255 {
            return Err(self.error_limit("upvalues", 255));
        }
        let parent = self.funcs[fsi].prev.expect("upvalue capture without parent");
        let (in_stack, index, kind) = match v.kind {
            ExpKind::Local { vidx, ridx } => (true, ridx, self.var(parent, vidx).kind),
            ExpKind::Upval(i) => (
                false,
                i,
                self.funcs[parent].proto.upvalues[i as usize].kind,
            ),
            _ => unreachable!("only locals and upvalues are captured"),
        };
        let ups = &mut self.funcs[fsi].proto.upvalues;
        ups.push(UpvalDesc {
            name,
            in_stack,
            index,
            kind,
        });
        Ok((ups.len() - 1) as u8)
    }

    /// Recursive name resolver: local → existing upvalue → enclosing
    /// function (inserting chain-capture upvalues on the way back down).
    /// `Void` means global.
    fn single_var_aux(
        &mut self,
        fsi: usize,
        name: StringId,
        base: bool,
    ) -> Result<ExpDesc, CompileError> {
        if let Some(v) = self.search_var(fsi, name) {
            if let ExpKind::Local { vidx, .. } = v.kind {
                if !base {
                    // Local of an enclosing function used as an upvalue.
                    self.funcs[fsi].mark_upval(vidx);
                }
            }
            return Ok(v);
        }
        if let Some(idx) = self.search_upvalue(fsi, name) {
            return Ok(ExpDesc::new(ExpKind::Upval(idx)));
        }
        let Some(parent) = self.funcs[fsi].prev else {
            return Ok(ExpDesc::void()); // global
        };
        let v = self.single_var_aux(parent, name, false)?;
        match v.kind {
            ExpKind::Local { .. } | ExpKind::Upval(_) => {
                let idx = self.new_upvalue(fsi, name, &v)?;
                Ok(ExpDesc::new(ExpKind::Upval(idx)))
            }
            // Globals and compile-time constants pass through unchanged.
            _ => Ok(v),
        }
    }

    /// Resolve a name, treating unknown ones as `_ENV[name]`.
    fn single_var(&mut self, name: StringId) -> Result<ExpDesc, CompileError> {
        let top = self.funcs.len() - 1;
        let mut var = self.single_var_aux(top, name, true)?;
        if matches!(var.kind, ExpKind::Void) {
            var = self.single_var_aux(top, self.env_name, true)?;
            debug_assert!(!matches!(var.kind, ExpKind::Void), "_ENV must exist");
            let mut key = ExpDesc::str(name);
            self.exp_to_any_reg_up(&mut var)?;
            self.indexed(&mut var, &mut key)?;
        }
        Ok(var)
    }

    /// Reject assignment to const locals, const upvalues, and compile-time
    /// constants.
    fn check_readonly(&self, e: &ExpDesc) -> Result<(), CompileError> {
        let fsi = self.funcs.len() - 1;
        let name = match e.kind {
            ExpKind::Const(abs) => Some(self.dyd.actvar[abs as usize].name),
            ExpKind::Local { vidx, .. } => {
                let vd = self.var(fsi, vidx);
                (vd.kind != VarKind::Regular).then_some(vd.name)
            }
            ExpKind::Upval(idx) => {
                let up = &self.fs().proto.upvalues[idx as usize];
                (up.kind != VarKind::Regular).then_some(up.name)
            }
            _ => None,
        };
        match name {
            Some(n) => Err(self.error_hint(
                ErrorKind::AssignToConst(self.name_str(n)),
                "this variable is constant, and cannot be reassigned.",
            )),
            None => Ok(()),
        }
    }

    /// Fold a constant expression for a `<const>` initializer, if possible.
    fn exp_to_const(&self, e: &ExpDesc) -> Option<Constant> {
        if e.has_jumps() {
            return None;
        }
        match e.kind {
            ExpKind::Nil => Some(Constant::Nil),
            ExpKind::True => Some(Constant::Boolean(true)),
            ExpKind::False => Some(Constant::Boolean(false)),
            ExpKind::KInt(i) => Some(Constant::Integer(i)),
            ExpKind::KFlt(f) => Some(Constant::Float(f)),
            ExpKind::KStr(s) => Some(Constant::String(s)),
            ExpKind::Const(abs) => self.dyd.actvar[abs as usize].k.clone(),
            _ => None,
        }
    }

    /// Balance an assignment: `nvars` targets against `nexps` values.
    fn adjust_assign(
        &mut self,
        nvars: usize,
        nexps: usize,
        e: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        let needed = nvars as i32 - nexps as i32;
        if e.is_multret() {
            let extra = (needed + 1).max(0);
            self.set_returns(e, extra)?;
        } else {
            if !matches!(e.kind, ExpKind::Void) {
                self.exp_to_next_reg(e)?;
            }
            if needed > 0 {
                let from = self.fs().free_reg;
                self.code_nil(from, needed as u8);
            }
        }
        if needed > 0 {
            self.reserve_regs(needed as u8)?;
        } else {
            // Surplus values are dropped.
            let fr = self.fs().free_reg as i32 + needed;
            self.fs_mut().free_reg = fr as u8;
        }
        Ok(())
    }

    // ---- Type hints ----

    /// Optional `':' name` hint after a declaration or parameter list.
    fn get_type_hint(&mut self) -> Result<ValueKind, CompileError> {
        if !self.test_next(&Token::Colon)? {
            return Ok(ValueKind::Unknown);
        }
        let name = self.str_checkname(false)?;
        let s = self.name_str(name);
        ValueKind::from_hint_name(&s).ok_or_else(|| self.error(ErrorKind::UnknownTypeHint(s)))
    }

    /// Optional `'<' name '>'` attribute in a local declaration.
    fn get_local_attribute(&mut self) -> Result<VarKind, CompileError> {
        if !self.test_next(&Token::Less)? {
            return Ok(VarKind::Regular);
        }
        let name = self.str_checkname(false)?;
        self.expect(&Token::Greater)?;
        match self.lx.strings.get_bytes(name) {
            b"const" => Ok(VarKind::Const),
            b"close" => Ok(VarKind::ToBeClosed),
            _ => Err(self.error(ErrorKind::UnknownAttribute(self.name_str(name)))),
        }
    }

    /// Warn when a hinted variable is assigned a conflicting kind, then
    /// propagate the observed kind.
    fn process_assign(&mut self, vidx: u16, observed: ValueKind, line: u32) {
        let var = self.var(self.funcs.len() - 1, vidx);
        if var.type_hint.conflicts_with(observed) {
            let kind = WarningKind::TypeMismatch {
                name: self.name_str(var.name),
                hinted: var.type_hint,
                actual: observed,
            };
            self.warn(kind, line);
        }
        self.var_mut(vidx).type_prop = observed;
    }

    // ---- Blocks, labels, gotos ----

    fn enter_block(&mut self, kind: BlockKind) {
        debug_assert_eq!(self.fs().free_reg, self.nvarstack());
        let fs = self.fs();
        let bl = BlockCnt {
            kind,
            scope_end: NO_JUMP,
            first_label: self.dyd.labels.len(),
            first_goto: self.dyd.gotos.len(),
            nactvar: fs.nactvar,
            upval: false,
            inside_tbc: fs.blocks.last().is_some_and(|b| b.inside_tbc),
        };
        self.fs_mut().blocks.push(bl);
    }

    fn new_label_entry(
        &mut self,
        name: StringId,
        line: u32,
        pc: i32,
    ) -> Result<usize, CompileError> {
        if self.dyd.labels.len() >= MAX_LABELS {
            return Err(self.error_limit("labels", MAX_LABELS as u32));
        }
        let nactvar = self.fs().nactvar;
        self.dyd.labels.push(LabelDesc {
            name,
            line,
            pc,
            nactvar,
            close: false,
        });
        Ok(self.dyd.labels.len() - 1)
    }

    fn new_goto_entry(
        &mut self,
        name: StringId,
        line: u32,
        pc: i32,
    ) -> Result<usize, CompileError> {
        if self.dyd.gotos.len() >= MAX_LABELS {
            return Err(self.error_limit("gotos", MAX_LABELS as u32));
        }
        let nactvar = self.fs().nactvar;
        self.dyd.gotos.push(LabelDesc {
            name,
            line,
            pc,
            nactvar,
            close: false,
        });
        Ok(self.dyd.gotos.len() - 1)
    }

    /// Find an active label of the current function by name.
    fn find_label(&self, name: StringId) -> Option<usize> {
        (self.fs().first_label..self.dyd.labels.len())
            .find(|&i| self.dyd.labels[i].name == name)
    }

    /// Resolve the pending goto at index `g` against `label`, removing it.
    fn solve_goto(&mut self, g: usize, label_idx: usize) -> Result<(), CompileError> {
        let gt = self.dyd.gotos[g].clone();
        let label = self.dyd.labels[label_idx].clone();
        debug_assert_eq!(gt.name, label.name);
        if gt.nactvar < label.nactvar {
            // Jump would enter the scope of a local declared in between.
            let first_local = self.fs().first_local;
            let var_name = self.dyd.actvar[first_local + gt.nactvar as usize].name;
            return Err(self.err_at(
                ErrorKind::JumpIntoScope(self.name_str(var_name)),
                gt.line,
            ));
        }
        self.patch_list(gt.pc, label.pc)?;
        self.dyd.gotos.remove(g);
        Ok(())
    }

    /// Resolve every pending goto of the current block matching the new
    /// label. Returns true if any resolved goto needs an upvalue close.
    fn solve_gotos(&mut self, label_idx: usize) -> Result<bool, CompileError> {
        let mut needs_close = false;
        let mut i = self.fs().block().first_goto;
        while i < self.dyd.gotos.len() {
            if self.dyd.gotos[i].name == self.dyd.labels[label_idx].name {
                needs_close |= self.dyd.gotos[i].close;
                self.solve_goto(i, label_idx)?;
            } else {
                i += 1;
            }
        }
        Ok(needs_close)
    }

    /// Define a label at the current position and resolve matching gotos.
    /// `last` marks a label that is the final non-op statement of its block,
    /// whose locals are already dead. Returns true if a close was emitted.
    fn create_label(
        &mut self,
        name: StringId,
        line: u32,
        last: bool,
    ) -> Result<bool, CompileError> {
        let pc = self.get_label();
        let idx = self.new_label_entry(name, line, pc)?;
        if last {
            self.dyd.labels[idx].nactvar = self.fs().block().nactvar;
        }
        if self.solve_gotos(idx)? {
            let level = self.nvarstack();
            self.code_abc(OpCode::Close, level, 0, 0);
            return Ok(true);
        }
        Ok(false)
    }

    /// Adjust pending gotos when their block goes away: jumps leaving the
    /// scope of captured locals must close upvalues.
    fn move_gotos_out(&mut self, bl: &BlockCnt) -> Result<(), CompileError> {
        let bl_level = self.reg_level(bl.nactvar);
        for i in bl.first_goto..self.dyd.gotos.len() {
            let g_level = self.reg_level(self.dyd.gotos[i].nactvar);
            if g_level > bl_level {
                self.dyd.gotos[i].close |= bl.upval;
            }
            self.dyd.gotos[i].nactvar = bl.nactvar;
        }
        Ok(())
    }

    fn undef_goto(&self, gt: &LabelDesc) -> CompileError {
        if gt.name == self.break_name {
            self.err_at(ErrorKind::BreakOutsideLoop(gt.line), gt.line)
        } else {
            self.err_at(
                ErrorKind::UndefinedLabel {
                    name: self.name_str(gt.name),
                    line: gt.line,
                },
                gt.line,
            )
        }
    }

    /// Leave the current block: drop its locals, resolve breaks, close
    /// upvalues, and hand leftover gotos to the enclosing block.
    fn leave_block(&mut self) -> Result<BlockCnt, CompileError> {
        let bl = self.fs().block().clone();
        let stk_level = self.reg_level(bl.nactvar);
        let is_outermost = self.fs().blocks.len() == 1;
        // Locals leave scope before the break label, so breaks that skipped
        // a later declaration resolve cleanly.
        self.remove_vars(bl.nactvar);
        debug_assert_eq!(self.fs().nactvar, bl.nactvar);
        let mut has_close = false;
        if bl.kind.takes_break() {
            // Pending breaks resolve to this point.
            has_close = self.create_label(self.break_name, 0, false)?;
        }
        if !has_close && !is_outermost && bl.upval {
            self.code_abc(OpCode::Close, stk_level, 0, 0);
        }
        self.fs_mut().free_reg = stk_level;
        self.dyd.labels.truncate(bl.first_label);
        let bl = self.fs_mut().blocks.pop().expect("block underflow");
        if !is_outermost {
            self.move_gotos_out(&bl)?;
        } else if bl.first_goto < self.dyd.gotos.len() {
            return Err(self.undef_goto(&self.dyd.gotos[bl.first_goto]));
        }
        Ok(bl)
    }

    // ---- Function management ----

    /// Open a new function nested in the current one.
    fn open_func(&mut self, line_defined: u32) {
        let parent = if self.funcs.is_empty() {
            None
        } else {
            Some(self.funcs.len() - 1)
        };
        let mut fs = FuncState::new(parent);
        fs.first_local = self.dyd.actvar.len();
        fs.first_label = self.dyd.labels.len();
        fs.proto.line_defined = line_defined;
        fs.proto.source = Some(self.lx.strings.intern(self.source_name.as_bytes()));
        self.funcs.push(fs);
        self.enter_block(BlockKind::Plain);
    }

    /// Close the current function: final return, outer-block resolution,
    /// and the finishing pass. The caller pops the `FuncState`.
    fn close_func(&mut self) -> Result<(), CompileError> {
        let first = self.nvarstack();
        self.code_ret(first, 0);
        self.leave_block()?;
        debug_assert!(self.fs().blocks.is_empty());
        self.finish_code();
        Ok(())
    }

    fn set_vararg(&mut self, nparams: u8) {
        self.fs_mut().proto.is_vararg = true;
        self.code_abc(OpCode::VarargPrep, nparams, 0, 0);
    }

    /// Pop the finished function, attach its prototype to the parent, and
    /// produce the closure expression.
    fn code_closure(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        let child = self.funcs.pop().expect("no function to close");
        let fs = self.fs_mut();
        fs.proto.protos.push(child.proto);
        let idx = fs.proto.protos.len() - 1;
        if idx > MAX_BX as usize {
            return Err(self.error_limit("functions", MAX_BX));
        }
        *e = ExpDesc::new(ExpKind::Reloc(self.code_abx(
            OpCode::Closure,
            0,
            idx as u32,
        )));
        self.exp_to_next_reg(e)
    }

    // ---- Expressions ----

    fn unop_from_token(t: &Token) -> Option<UnOpr> {
        match t {
            Token::Minus => Some(UnOpr::Minus),
            Token::Tilde => Some(UnOpr::BNot),
            Token::Not => Some(UnOpr::Not),
            Token::Hash => Some(UnOpr::Len),
            _ => None,
        }
    }

    fn binop_from_token(t: &Token) -> Option<BinOpr> {
        match t {
            Token::Plus => Some(BinOpr::Add),
            Token::Minus => Some(BinOpr::Sub),
            Token::Star => Some(BinOpr::Mul),
            Token::Slash => Some(BinOpr::Div),
            Token::FloorDiv => Some(BinOpr::IDiv),
            Token::Percent => Some(BinOpr::Mod),
            Token::Caret => Some(BinOpr::Pow),
            Token::DotDot => Some(BinOpr::Concat),
            Token::ShiftLeft => Some(BinOpr::Shl),
            Token::ShiftRight => Some(BinOpr::Shr),
            Token::Ampersand => Some(BinOpr::BAnd),
            Token::Pipe => Some(BinOpr::BOr),
            Token::Tilde => Some(BinOpr::BXor),
            Token::Equal => Some(BinOpr::Eq),
            Token::NotEqual => Some(BinOpr::Ne),
            Token::Less => Some(BinOpr::Lt),
            Token::LessEq => Some(BinOpr::Le),
            Token::Greater => Some(BinOpr::Gt),
            Token::GreaterEq => Some(BinOpr::Ge),
            Token::And => Some(BinOpr::And),
            Token::Or => Some(BinOpr::Or),
            Token::DoubleQuestion => Some(BinOpr::Coalesce),
            _ => None,
        }
    }

    fn compound_to_binop(op: CompoundOp) -> BinOpr {
        match op {
            CompoundOp::Add => BinOpr::Add,
            CompoundOp::Sub => BinOpr::Sub,
            CompoundOp::Mul => BinOpr::Mul,
            CompoundOp::Div => BinOpr::Div,
            CompoundOp::IDiv => BinOpr::IDiv,
            CompoundOp::Mod => BinOpr::Mod,
            CompoundOp::Pow => BinOpr::Pow,
            CompoundOp::Concat => BinOpr::Concat,
            CompoundOp::BAnd => BinOpr::BAnd,
            CompoundOp::BOr => BinOpr::BOr,
            CompoundOp::BXor => BinOpr::BXor,
            CompoundOp::Shl => BinOpr::Shl,
            CompoundOp::Shr => BinOpr::Shr,
            CompoundOp::Coalesce => BinOpr::Coalesce,
        }
    }

    fn expr_full(
        &mut self,
        v: &mut ExpDesc,
        prop: Option<&mut ValueKind>,
    ) -> Result<(), CompileError> {
        self.subexpr(v, 0, prop)?;
        Ok(())
    }

    fn expr(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        self.expr_full(v, None)
    }

    /// Precedence climber. Returns the first operator whose binding did not
    /// exceed `limit`.
    fn subexpr(
        &mut self,
        v: &mut ExpDesc,
        limit: u8,
        mut prop: Option<&mut ValueKind>,
    ) -> Result<Option<BinOpr>, CompileError> {
        self.enter_level()?;
        let tok = self.current()?.clone();
        if let Some(uop) = Self::unop_from_token(&tok) {
            let line = self.lx.line();
            self.advance()?;
            self.subexpr(v, UNARY_PRIORITY, None)?;
            self.prefix(uop, v, line)?;
        } else if tok == Token::If {
            self.if_expr(v)?;
        } else if tok == Token::Plus {
            // Pseudo-unary '+', synthesized as `0 + expr`.
            let line = self.lx.line();
            *v = ExpDesc::int(0);
            self.infix(BinOpr::Add, v)?;
            self.advance()?;
            let mut v2 = ExpDesc::void();
            self.subexpr(&mut v2, BinOpr::Add.priority().1, prop.as_deref_mut())?;
            self.posfix(BinOpr::Add, v, &mut v2, line)?;
        } else {
            self.simple_exp(v, false, prop.as_deref_mut())?;
            if self.check(&Token::In) {
                self.in_expr(v)?;
                if let Some(p) = prop.as_deref_mut() {
                    *p = ValueKind::Bool;
                }
            }
        }
        let mut op = self.current().ok().and_then(Self::binop_from_token);
        while let Some(cur) = op {
            if cur.priority().0 <= limit {
                break;
            }
            let line = self.lx.line();
            self.advance()?;
            self.infix(cur, v)?;
            let mut v2 = ExpDesc::void();
            let next = self.subexpr(&mut v2, cur.priority().1, None)?;
            self.posfix(cur, v, &mut v2, line)?;
            op = next;
        }
        self.leave_level();
        Ok(op)
    }

    /// `x in t`: membership test.
    fn in_expr(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        self.expect(&Token::In)?;
        let mut t = ExpDesc::void();
        self.expr(&mut t)?;
        self.code_in(v, &mut t)
    }

    /// `if cond then e1 else e2` as an expression: both arms converge on
    /// one fresh register.
    fn if_expr(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        self.advance()?; // skip 'if'
        let cond_exit = self.cond()?;
        self.expect(&Token::Then)?;
        self.expr(v)?;
        // A fresh register: the arms may not clobber a live local.
        self.exp_to_next_reg(v)?;
        let ExpKind::NonReloc(reg) = v.kind else {
            unreachable!()
        };
        let mut escape = NO_JUMP;
        let j = self.jump();
        self.concat_jump(&mut escape, j)?;
        self.patch_to_here(cond_exit)?;
        self.expect(&Token::Else)?;
        let mut v2 = ExpDesc::void();
        self.expr(&mut v2)?;
        self.exp_to_reg(&mut v2, reg)?;
        self.fs_mut().free_reg = reg + 1;
        self.patch_to_here(escape)?;
        *v = ExpDesc::new(ExpKind::NonReloc(reg));
        Ok(())
    }

    /// Safe navigation `e?.name` / `e?[k]`: if the receiver is falsy, the
    /// chain is skipped and the receiver's register is the result.
    fn safe_navigation(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        self.advance()?; // skip '?'
        self.exp_to_next_reg(v)?;
        let ExpKind::NonReloc(vreg) = v.kind else {
            unreachable!()
        };
        self.code_abck(OpCode::Test, vreg, 0, 0, false);
        let old_free = self.fs().free_reg;
        let j = self.jump();
        let mut key;
        match self.current()?.clone() {
            Token::LBracket => {
                self.advance()?;
                let negated = self.check(&Token::Minus);
                key = ExpDesc::void();
                self.expr(&mut key)?;
                if negated && !key.is_numeral() {
                    return Err(self.error_hint(
                        ErrorKind::SafeNavOnNonNumeric,
                        "unexpected symbol during navigation.",
                    ));
                }
                self.exp_to_val(&mut key)?;
                self.expect(&Token::RBracket)?;
            }
            Token::Dot => {
                self.advance()?;
                key = self.codename()?;
            }
            _ => {
                return Err(self.error(ErrorKind::UnexpectedToken(
                    self.current()?.to_string(),
                )))
            }
        }
        self.indexed(v, &mut key)?;
        self.exp_to_next_reg(v)?;
        let ExpKind::NonReloc(r) = v.kind else {
            unreachable!()
        };
        self.fs_mut().free_reg = old_free;
        if r != vreg {
            self.code_abc(OpCode::Move, vreg, r, 0);
        }
        *v = ExpDesc::new(ExpKind::NonReloc(vreg));
        self.patch_to_here(j)?;
        Ok(())
    }

    /// `primaryexp -> NAME | '(' expr ')'`
    fn primary_exp(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        match self.current()?.clone() {
            Token::LParen => {
                let line = self.lx.line();
                self.advance()?;
                self.expr(v)?;
                self.check_match(&Token::RParen, &Token::LParen, line)?;
                self.discharge_vars(v)?;
                Ok(())
            }
            Token::Name(name) => {
                self.advance()?;
                *v = self.single_var(name)?;
                Ok(())
            }
            Token::LBrace => Err(self.error_hint(
                ErrorKind::UnexpectedToken("'{'".into()),
                "did you mean to close with '}'?",
            )),
            Token::RBrace => Err(self.error_hint(
                ErrorKind::UnexpectedToken("'}'".into()),
                "did you mean to enter with '{'?",
            )),
            Token::Pipe => {
                // A stranded lambda, most likely with a mistyped arrow.
                while self.test_next(&Token::Pipe)?
                    || matches!(self.current()?, Token::Name(_)) && self.advance().is_ok()
                    || self.test_next(&Token::Comma)?
                {}
                Err(self.error_hint(
                    ErrorKind::UnexpectedToken("'|'".into()),
                    "improper or stranded lambda expression.",
                ))
            }
            other => Err(self.error_hint(
                ErrorKind::UnexpectedToken(format!("'{other}'")),
                "unexpected symbol.",
            )),
        }
    }

    fn fieldsel(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        self.exp_to_any_reg_up(v)?;
        self.advance()?; // skip '.' or ':'
        let mut key = self.codename()?;
        self.indexed(v, &mut key)
    }

    /// `'[' expr ']'` index.
    fn yindex(&mut self) -> Result<ExpDesc, CompileError> {
        self.advance()?; // skip '['
        let mut v = ExpDesc::void();
        self.expr(&mut v)?;
        self.exp_to_val(&mut v)?;
        self.expect(&Token::RBracket)?;
        Ok(v)
    }

    /// `suffixedexp -> primaryexp { '.' NAME | '[' exp ']' | ':' NAME args
    ///                             | args | '?' suffix }`
    fn suffixed_exp(
        &mut self,
        v: &mut ExpDesc,
        mut prop: Option<&mut ValueKind>,
    ) -> Result<(), CompileError> {
        let line = self.lx.line();
        self.primary_exp(v)?;
        loop {
            match self.current()?.clone() {
                Token::Question => self.safe_navigation(v)?,
                Token::Dot => self.fieldsel(v)?,
                Token::LBracket => {
                    self.exp_to_any_reg_up(v)?;
                    let mut key = self.yindex()?;
                    self.indexed(v, &mut key)?;
                }
                Token::Colon => {
                    self.advance()?;
                    let mut key = self.codename()?;
                    self.self_op(v, &mut key)?;
                    self.funcargs(v, line)?;
                }
                Token::LParen | Token::String(_) | Token::LBrace => {
                    if let (Some(p), ExpKind::Local { vidx, .. }) =
                        (prop.as_deref_mut(), v.kind)
                    {
                        // Calling a local whose return kind we have seen.
                        *p = self.var(self.funcs.len() - 1, vidx).type_prop;
                    }
                    self.exp_to_next_reg(v)?;
                    self.funcargs(v, line)?;
                }
                _ => return Ok(()),
            }
        }
    }

    /// `simpleexp -> literal | '...' | constructor | FUNCTION body |
    ///               lambda | suffixedexp`
    fn simple_exp(
        &mut self,
        v: &mut ExpDesc,
        case_expr: bool,
        mut prop: Option<&mut ValueKind>,
    ) -> Result<(), CompileError> {
        let tok = self.current()?.clone();
        match tok {
            Token::Integer(i) => {
                if let Some(p) = prop.as_deref_mut() {
                    *p = ValueKind::Int;
                }
                *v = ExpDesc::int(i);
            }
            Token::Float(f) => {
                // Floats share the "number" tag with integers.
                if let Some(p) = prop.as_deref_mut() {
                    *p = ValueKind::Int;
                }
                *v = ExpDesc::new(ExpKind::KFlt(f));
            }
            Token::String(s) => {
                if let Some(p) = prop.as_deref_mut() {
                    *p = ValueKind::Str;
                }
                *v = ExpDesc::str(s);
            }
            Token::Nil => {
                if let Some(p) = prop.as_deref_mut() {
                    *p = ValueKind::Nil;
                }
                *v = ExpDesc::new(ExpKind::Nil);
            }
            Token::True => {
                if let Some(p) = prop.as_deref_mut() {
                    *p = ValueKind::Bool;
                }
                *v = ExpDesc::new(ExpKind::True);
            }
            Token::False => {
                if let Some(p) = prop.as_deref_mut() {
                    *p = ValueKind::Bool;
                }
                *v = ExpDesc::new(ExpKind::False);
            }
            Token::DotDotDot => {
                if !self.fs().proto.is_vararg {
                    return Err(self.error(ErrorKind::VarargOutsideVarargFunc));
                }
                let pc = self.code_abck(OpCode::Vararg, 0, 0, 1, false);
                *v = ExpDesc::new(ExpKind::Vararg(pc));
            }
            Token::LBrace => {
                if let Some(p) = prop.as_deref_mut() {
                    *p = ValueKind::Table;
                }
                return self.constructor(v);
            }
            Token::Function => {
                self.advance()?;
                let line = self.lx.line();
                return self.body(v, false, line, None);
            }
            Token::Pipe => {
                let line = self.lx.line();
                return self.lambda_body(v, line);
            }
            _ => return self.suffixed_exp(v, prop),
        }
        self.advance()?;
        if !case_expr && self.check(&Token::Colon) {
            // Method call on a literal receiver.
            self.advance()?;
            let mut key = self.codename()?;
            self.self_op(v, &mut key)?;
            let line = self.lx.line();
            self.funcargs(v, line)?;
        }
        Ok(())
    }

    /// `explist -> expr { ',' expr }`; all but the last land on the stack.
    fn explist(
        &mut self,
        v: &mut ExpDesc,
        prop: Option<&mut ValueKind>,
    ) -> Result<usize, CompileError> {
        let mut n = 1;
        self.expr_full(v, prop)?;
        while self.test_next(&Token::Comma)? {
            self.exp_to_next_reg(v)?;
            self.expr(v)?;
            n += 1;
        }
        Ok(n)
    }

    /// Call arguments: parenthesized list, a constructor, or a string.
    fn funcargs(&mut self, f: &mut ExpDesc, line: u32) -> Result<(), CompileError> {
        let mut args = ExpDesc::void();
        match self.current()?.clone() {
            Token::LParen => {
                self.advance()?;
                if self.check(&Token::RParen) {
                    args.kind = ExpKind::Void;
                } else {
                    self.explist(&mut args, None)?;
                    if args.is_multret() {
                        self.set_multret(&args)?;
                    }
                }
                self.check_match(&Token::RParen, &Token::LParen, line)?;
            }
            Token::LBrace => {
                self.constructor(&mut args)?;
            }
            Token::String(s) => {
                args = ExpDesc::str(s);
                self.advance()?;
            }
            _ => return Err(self.error(ErrorKind::FunctionArgumentsExpected)),
        }
        let ExpKind::NonReloc(base) = f.kind else {
            unreachable!("callee must be materialized")
        };
        let nparams = if args.is_multret() {
            -1 // open call
        } else {
            if !matches!(args.kind, ExpKind::Void) {
                self.exp_to_next_reg(&mut args)?;
            }
            (self.fs().free_reg - (base + 1)) as i32
        };
        let pc = self.code_abc(OpCode::Call, base, (nparams + 1) as u8, 2);
        *f = ExpDesc::new(ExpKind::Call(pc));
        self.fix_line(line);
        // The call removes function and arguments, leaving one result.
        self.fs_mut().free_reg = base + 1;
        Ok(())
    }

    // ---- Constructors ----

    fn constructor(&mut self, t: &mut ExpDesc) -> Result<(), CompileError> {
        let line = self.lx.line();
        let pc = self.code_abc(OpCode::NewTable, 0, 0, 0);
        self.code_extra_arg(0); // reserved for the size extra-arg
        let treg = self.fs().free_reg;
        *t = ExpDesc::new(ExpKind::NonReloc(treg));
        self.reserve_regs(1)?;
        let mut cc = ConsControl {
            v: ExpDesc::void(),
            na: 0,
            nh: 0,
            tostore: 0,
        };
        self.expect(&Token::LBrace)?;
        loop {
            debug_assert!(matches!(cc.v.kind, ExpKind::Void) || cc.tostore > 0);
            if self.check(&Token::RBrace) {
                break;
            }
            self.close_listfield(&mut cc, treg)?;
            self.field(&mut cc, t)?;
            if !self.test_next(&Token::Comma)? && !self.test_next(&Token::Semi)? {
                break;
            }
        }
        self.check_match(&Token::RBrace, &Token::LBrace, line)?;
        self.last_listfield(&mut cc, treg)?;
        self.settable_size(pc, treg, cc.na, cc.nh);
        Ok(())
    }

    fn field(&mut self, cc: &mut ConsControl, t: &ExpDesc) -> Result<(), CompileError> {
        match self.current()?.clone() {
            Token::Name(_) => {
                if self.peek_next()? != Token::Assign {
                    self.listfield(cc)?;
                } else {
                    self.recfield(cc, t)?;
                }
            }
            Token::LBracket => self.recfield(cc, t)?,
            Token::Function => {
                if self.peek_next()? == Token::LParen {
                    self.listfield(cc)?;
                } else {
                    self.funcfield(cc, t)?;
                }
            }
            tok if tok.is_reserved_nonvalue() => self.prenamed_field(cc, t, &tok)?,
            _ => self.listfield(cc)?,
        }
        Ok(())
    }

    /// `(NAME | '[' exp ']') '=' exp`
    fn recfield(&mut self, cc: &mut ConsControl, t: &ExpDesc) -> Result<(), CompileError> {
        let reg = self.fs().free_reg;
        let mut key = if matches!(self.current()?, Token::Name(_)) {
            self.codename()?
        } else {
            self.yindex()?
        };
        cc.nh += 1;
        self.expect(&Token::Assign)?;
        let mut tab = *t;
        self.indexed(&mut tab, &mut key)?;
        let mut val = ExpDesc::void();
        self.expr(&mut val)?;
        self.store_var(&tab, &mut val)?;
        self.fs_mut().free_reg = reg;
        Ok(())
    }

    /// Reserved word used as a record key, e.g. `{ default = 1 }`.
    fn prenamed_field(
        &mut self,
        cc: &mut ConsControl,
        t: &ExpDesc,
        tok: &Token,
    ) -> Result<(), CompileError> {
        let name = tok.reserved_str().expect("reserved token");
        let id = self.lx.strings.intern(name.as_bytes());
        let mut key = ExpDesc::str(id);
        cc.nh += 1;
        self.advance()?; // skip the reserved word
        self.expect(&Token::Assign)?;
        let reg = self.fs().free_reg;
        let mut tab = *t;
        self.indexed(&mut tab, &mut key)?;
        let mut val = ExpDesc::void();
        self.expr(&mut val)?;
        self.store_var(&tab, &mut val)?;
        self.fs_mut().free_reg = reg;
        Ok(())
    }

    /// `function NAME body` inside a constructor.
    fn funcfield(&mut self, cc: &mut ConsControl, t: &ExpDesc) -> Result<(), CompileError> {
        let reg = self.fs().free_reg;
        cc.nh += 1;
        self.advance()?; // skip 'function'
        let mut key = self.codename()?;
        let mut tab = *t;
        self.indexed(&mut tab, &mut key)?;
        let line = self.lx.line();
        let mut val = ExpDesc::void();
        self.body(&mut val, true, line, None)?;
        self.store_var(&tab, &mut val)?;
        self.fs_mut().free_reg = reg;
        Ok(())
    }

    fn listfield(&mut self, cc: &mut ConsControl) -> Result<(), CompileError> {
        let mut v = ExpDesc::void();
        self.expr(&mut v)?;
        cc.v = v;
        cc.tostore += 1;
        Ok(())
    }

    fn close_listfield(&mut self, cc: &mut ConsControl, treg: u8) -> Result<(), CompileError> {
        if matches!(cc.v.kind, ExpKind::Void) {
            return Ok(());
        }
        let mut v = cc.v;
        self.exp_to_next_reg(&mut v)?;
        cc.v = ExpDesc::void();
        if cc.tostore == code::FIELDS_PER_FLUSH as i32 {
            self.code_setlist(treg, cc.na, cc.tostore)?; // flush
            cc.na += cc.tostore as u32;
            cc.tostore = 0;
        }
        Ok(())
    }

    fn last_listfield(&mut self, cc: &mut ConsControl, treg: u8) -> Result<(), CompileError> {
        if cc.tostore == 0 {
            return Ok(());
        }
        if cc.v.is_multret() {
            let v = cc.v;
            self.set_multret(&v)?;
            self.code_setlist(treg, cc.na, -1)?;
            // The last expression provides an unknown number of elements.
            cc.na -= 1;
        } else {
            if !matches!(cc.v.kind, ExpKind::Void) {
                let mut v = cc.v;
                self.exp_to_next_reg(&mut v)?;
            }
            self.code_setlist(treg, cc.na, cc.tostore)?;
        }
        cc.na += cc.tostore as u32;
        Ok(())
    }

    // ---- Function bodies ----

    /// `parlist -> [ {NAME ','} (NAME | '...') ]`, terminated by `)` or `|`.
    fn parlist(&mut self) -> Result<(), CompileError> {
        let mut nparams: u16 = 0;
        let mut is_vararg = false;
        if !self.check(&Token::RParen) && !self.check(&Token::Pipe) {
            loop {
                match self.current()?.clone() {
                    Token::Name(_) => {
                        let name = self.str_checkname(true)?;
                        self.new_localvar(name)?;
                        nparams += 1;
                    }
                    Token::DotDotDot => {
                        self.advance()?;
                        is_vararg = true;
                    }
                    _ => {
                        return Err(self.error_hint(
                            ErrorKind::Syntax("<name> or '...' expected".into()),
                            "malformed parameter list.",
                        ))
                    }
                }
                if is_vararg || !self.test_next(&Token::Comma)? {
                    break;
                }
            }
        }
        self.adjust_locals(nparams);
        let nactive = self.fs().nactvar;
        self.fs_mut().proto.num_params = nactive as u8;
        if is_vararg {
            self.set_vararg(nactive as u8);
        }
        self.reserve_regs(nactive as u8)?;
        Ok(())
    }

    /// `body -> '(' parlist ')' [':' hint] block END`
    fn body(
        &mut self,
        e: &mut ExpDesc,
        is_method: bool,
        line: u32,
        prop: Option<&mut RetProp>,
    ) -> Result<(), CompileError> {
        self.open_func(line);
        self.expect(&Token::LParen)?;
        if is_method {
            self.new_localvar_literal("self")?;
            self.adjust_locals(1);
        }
        self.parlist()?;
        self.expect(&Token::RParen)?;
        let ret_hint = self.get_type_hint()?;
        let mut p = RetProp::NotSeen;
        self.statlist(Some(&mut p))?;
        if let RetProp::Known(actual) = p {
            if ret_hint.conflicts_with(actual) {
                self.warn(
                    WarningKind::ReturnTypeMismatch {
                        hinted: ret_hint,
                        actual,
                    },
                    line,
                );
            }
        }
        if let Some(out) = prop {
            *out = p;
        }
        self.fs_mut().proto.last_line_defined = self.lx.line();
        self.check_match(&Token::End, &Token::Function, line)?;
        self.close_func()?;
        self.code_closure(e)
    }

    /// `'|' parlist '|' '->' expr`: a function with a single implicit
    /// return.
    fn lambda_body(&mut self, e: &mut ExpDesc, line: u32) -> Result<(), CompileError> {
        self.open_func(line);
        self.expect(&Token::Pipe)?;
        self.parlist()?;
        self.expect(&Token::Pipe)?;
        self.expect(&Token::Arrow)?;
        let mut v = ExpDesc::void();
        self.expr(&mut v)?;
        let reg = self.exp_to_any_reg(&mut v)?;
        self.code_ret(reg, 1);
        self.fs_mut().proto.last_line_defined = self.lx.line();
        self.close_func()?;
        self.code_closure(e)
    }

    // ---- Statements ----

    fn block_follow(&self, with_until: bool) -> bool {
        match self.current() {
            Ok(Token::Else) | Ok(Token::ElseIf) | Ok(Token::End) | Ok(Token::Eof) => true,
            Ok(Token::Until) | Ok(Token::When) => with_until,
            _ => false,
        }
    }

    fn statlist(&mut self, mut prop: Option<&mut RetProp>) -> Result<(), CompileError> {
        while !self.block_follow(true) {
            if self.check(&Token::Return) {
                // 'return' must be the last statement of a block.
                self.statement(prop.take())?;
                return Ok(());
            }
            let mut p = RetProp::NotSeen;
            self.statement(Some(&mut p))?;
            if p != RetProp::NotSeen {
                // Multiple return paths: give up on propagation.
                prop = None;
            }
        }
        Ok(())
    }

    fn block(&mut self) -> Result<(), CompileError> {
        self.enter_block(BlockKind::Plain);
        self.statlist(None)?;
        self.leave_block()?;
        Ok(())
    }

    fn statement(&mut self, prop: Option<&mut RetProp>) -> Result<(), CompileError> {
        let line = self.lx.line();
        self.enter_level()?;
        match self.current()?.clone() {
            Token::Semi => {
                self.advance()?;
            }
            Token::If => self.if_stat(line, prop)?,
            Token::While => self.while_stat(line)?,
            Token::Do => {
                self.advance()?;
                self.block()?;
                self.check_match(&Token::End, &Token::Do, line)?;
            }
            Token::For => self.for_stat(line)?,
            Token::Repeat => self.repeat_stat()?,
            Token::Function => self.func_stat(line)?,
            Token::Local => {
                self.advance()?;
                if self.test_next(&Token::Function)? {
                    self.local_func()?;
                } else {
                    self.local_stat()?;
                }
            }
            Token::DoubleColon => {
                self.advance()?;
                let name = self.str_checkname(false)?;
                self.label_stat(name, line)?;
            }
            Token::Return => {
                self.advance()?;
                self.ret_stat(prop)?;
            }
            Token::Break => self.break_stat()?,
            Token::Continue => self.continue_stat()?,
            Token::Goto => {
                self.advance()?;
                self.goto_stat()?;
            }
            Token::Switch => self.switch_stat(line)?,
            Token::Case => {
                return Err(self.error_hint(
                    ErrorKind::UnexpectedToken("'case'".into()),
                    "outside of 'switch' block.",
                ))
            }
            Token::Default => {
                return Err(self.error_hint(
                    ErrorKind::UnexpectedToken("'default'".into()),
                    "outside of 'switch' block.",
                ))
            }
            _ => self.expr_stat()?,
        }
        debug_assert!(self.fs().proto.max_stack >= self.fs().free_reg);
        debug_assert!(self.fs().free_reg >= self.nvarstack());
        let level = self.nvarstack();
        self.fs_mut().free_reg = level;
        self.leave_level();
        Ok(())
    }

    /// `cond -> expr`, leaving the false list as the exit.
    fn cond(&mut self) -> Result<i32, CompileError> {
        let mut v = ExpDesc::void();
        self.expr(&mut v)?;
        if matches!(v.kind, ExpKind::Nil) {
            v.kind = ExpKind::False; // all falsy values are equal here
        }
        self.goif_true(&mut v)?;
        Ok(v.f)
    }

    /// `[IF | ELSEIF] cond THEN block`, including the `if x then break`
    /// short form.
    fn test_then_block(
        &mut self,
        escape_list: &mut i32,
        prop: Option<&mut RetProp>,
    ) -> Result<(), CompileError> {
        self.advance()?; // skip IF or ELSEIF
        let mut v = ExpDesc::void();
        self.expr(&mut v)?;
        self.expect(&Token::Then)?;
        let jf;
        if self.check(&Token::Break) {
            let line = self.lx.line();
            self.goif_false(&mut v)?; // jump taken when the condition holds
            self.advance()?; // skip 'break'
            self.enter_block(BlockKind::Plain); // must enter before the goto
            self.new_goto_entry(self.break_name, line, v.t)?;
            while self.test_next(&Token::Semi)? {}
            if self.block_follow(false) {
                self.leave_block()?;
                return Ok(());
            }
            jf = self.jump();
        } else {
            self.goif_true(&mut v)?;
            self.enter_block(BlockKind::Plain);
            jf = v.f;
        }
        self.statlist(prop)?;
        self.leave_block()?;
        if self.check(&Token::Else) || self.check(&Token::ElseIf) {
            let j = self.jump();
            self.concat_jump(escape_list, j)?;
        }
        self.patch_to_here(jf)?;
        Ok(())
    }

    fn if_stat(
        &mut self,
        line: u32,
        mut prop: Option<&mut RetProp>,
    ) -> Result<(), CompileError> {
        let mut escape_list = NO_JUMP;
        self.test_then_block(&mut escape_list, prop.as_deref_mut())?;
        while self.check(&Token::ElseIf) {
            self.test_then_block(&mut escape_list, prop.as_deref_mut())?;
        }
        if self.test_next(&Token::Else)? {
            self.block()?;
        }
        self.check_match(&Token::End, &Token::If, line)?;
        self.patch_to_here(escape_list)?;
        Ok(())
    }

    fn while_stat(&mut self, line: u32) -> Result<(), CompileError> {
        self.advance()?; // skip WHILE
        let while_init = self.get_label();
        let cond_exit = self.cond()?;
        self.enter_block(BlockKind::Loop);
        self.expect(&Token::Do)?;
        self.block()?;
        self.jump_to(while_init)?;
        let scope_end = self.fs().block().scope_end;
        self.patch_list(scope_end, while_init)?;
        self.fs_mut().block_mut().scope_end = NO_JUMP;
        self.check_match(&Token::End, &Token::While, line)?;
        self.leave_block()?;
        self.patch_to_here(cond_exit)?; // false conditions finish the loop
        Ok(())
    }

    fn repeat_stat(&mut self) -> Result<(), CompileError> {
        let repeat_init = self.get_label();
        self.enter_block(BlockKind::Loop); // loop block
        self.enter_block(BlockKind::Plain); // scope block
        self.advance()?; // skip REPEAT
        self.statlist(None)?;
        // 'continue' targets the condition check.
        let outer_idx = self.fs().blocks.len() - 2;
        let scope_end = self.fs().blocks[outer_idx].scope_end;
        self.patch_to_here(scope_end)?;
        self.fs_mut().blocks[outer_idx].scope_end = NO_JUMP;
        let mut cond_exit;
        if self.test_next(&Token::Until)? {
            cond_exit = self.cond()?; // loop back while false
        } else if self.test_next(&Token::When)? {
            // Inverted terminator: loop back while true.
            let mut v = ExpDesc::void();
            self.expr(&mut v)?;
            if matches!(v.kind, ExpKind::Nil) {
                v.kind = ExpKind::False;
            }
            self.goif_false(&mut v)?;
            cond_exit = v.t;
        } else {
            return Err(self.error_expected(&Token::Until));
        }
        let bl2 = self.leave_block()?; // finish scope
        if bl2.upval {
            // The repeat path must close upvalues before looping.
            let exit = self.jump();
            self.patch_to_here(cond_exit)?;
            let level = self.reg_level(bl2.nactvar);
            self.code_abc(OpCode::Close, level, 0, 0);
            cond_exit = self.jump();
            self.patch_to_here(exit)?;
        }
        self.patch_list(cond_exit, repeat_init)?;
        self.leave_block()?; // finish loop
        Ok(())
    }

    /// Read one expression and leave it on the stack.
    fn exp1(&mut self) -> Result<(), CompileError> {
        let mut e = ExpDesc::void();
        self.expr(&mut e)?;
        self.exp_to_next_reg(&mut e)?;
        debug_assert!(matches!(e.kind, ExpKind::NonReloc(_)));
        Ok(())
    }

    /// Patch a FORPREP/FORLOOP-family instruction at `pc` to reach `dest`.
    fn fix_for_jump(&mut self, pc: i32, dest: i32, back: bool) -> Result<(), CompileError> {
        let mut offset = dest - (pc + 1);
        if back {
            offset = -offset;
        }
        if offset < 0 || offset > MAX_BX as i32 {
            return Err(self.error(ErrorKind::ControlStructureTooLong));
        }
        self.fs_mut()
            .proto
            .get_mut(pc as usize)
            .set_bx(offset as u32);
        Ok(())
    }

    /// Shared tail of both `for` forms: prep jump, scoped body, loop-back.
    fn for_body(
        &mut self,
        base: u8,
        line: u32,
        nvars: u16,
        is_gen: bool,
    ) -> Result<(), CompileError> {
        self.expect(&Token::Do)?;
        let prep = if is_gen {
            self.code_abx(OpCode::TForPrep, base, 0)
        } else {
            self.code_abx(OpCode::ForPrep, base, 0)
        };
        self.enter_block(BlockKind::Plain); // scope for declared variables
        self.adjust_locals(nvars);
        self.reserve_regs(nvars as u8)?;
        self.block()?;
        self.leave_block()?;
        let here = self.get_label();
        self.fix_for_jump(prep, here, false)?;
        // 'continue' lands just before the loop-closing instruction.
        let scope_end = self.fs().block().scope_end;
        self.patch_to_here(scope_end)?;
        self.fs_mut().block_mut().scope_end = NO_JUMP;
        if is_gen {
            self.code_abc(OpCode::TForCall, base, 0, nvars as u8);
            self.fix_line(line);
        }
        let end_for = if is_gen {
            self.code_abx(OpCode::TForLoop, base + 2, 0)
        } else {
            self.code_abx(OpCode::ForLoop, base, 0)
        };
        self.fix_for_jump(end_for, prep + 1, true)?;
        self.fix_line(line);
        Ok(())
    }

    /// `fornum -> NAME '=' exp ',' exp [',' exp] forbody`
    fn for_num(&mut self, varname: StringId, line: u32) -> Result<(), CompileError> {
        let base = self.fs().free_reg;
        self.new_localvar_literal("(for state)")?;
        self.new_localvar_literal("(for state)")?;
        self.new_localvar_literal("(for state)")?;
        self.new_localvar(varname)?;
        self.expect(&Token::Assign)?;
        self.exp1()?; // initial value
        self.expect(&Token::Comma)?;
        self.exp1()?; // limit
        if self.test_next(&Token::Comma)? {
            self.exp1()?; // optional step
        } else {
            // Default step is integer 1.
            let reg = self.fs().free_reg;
            let mut step = ExpDesc::int(1);
            self.exp_to_reg(&mut step, reg)?;
            self.reserve_regs(1)?;
        }
        self.adjust_locals(3); // control variables
        self.for_body(base, line, 1, false)
    }

    /// `forlist -> NAME {',' NAME} IN explist forbody`
    fn for_list(&mut self, index_name: StringId) -> Result<(), CompileError> {
        let base = self.fs().free_reg;
        // Control slots: iterator, state, control, to-be-closed.
        self.new_localvar_literal("(for state)")?;
        self.new_localvar_literal("(for state)")?;
        self.new_localvar_literal("(for state)")?;
        self.new_localvar_literal("(for state)")?;
        self.new_localvar(index_name)?;
        let mut nvars: u16 = 5;
        while self.test_next(&Token::Comma)? {
            let name = self.str_checkname(true)?;
            self.new_localvar(name)?;
            nvars += 1;
        }
        self.expect(&Token::In)?;
        let line = self.lx.line();
        let mut e = ExpDesc::void();
        let nexps = self.explist(&mut e, None)?;
        self.adjust_assign(4, nexps, &mut e)?;
        self.adjust_locals(4);
        self.fs_mut().mark_to_be_closed(); // the loop state is closed on exit
        self.check_stack(3)?; // room for the iterator call
        self.for_body(base, line, nvars - 4, true)
    }

    fn for_stat(&mut self, line: u32) -> Result<(), CompileError> {
        self.enter_block(BlockKind::Loop); // scope for control variables
        self.advance()?; // skip 'for'
        let varname = self.str_checkname(true)?;
        match self.current()?.clone() {
            Token::Assign => self.for_num(varname, line)?,
            Token::Comma | Token::In => self.for_list(varname)?,
            _ => {
                return Err(self.error_hint(
                    ErrorKind::Syntax("'=' or 'in' expected".into()),
                    "malformed 'for' header.",
                ))
            }
        }
        self.check_match(&Token::End, &Token::For, line)?;
        self.leave_block()?; // 'break' jumps to this point
        Ok(())
    }

    // ---- goto / label / break / continue ----

    fn goto_stat(&mut self) -> Result<(), CompileError> {
        let line = self.lx.line();
        let name = self.str_checkname(false)?;
        if let Some(lb_idx) = self.find_label(name) {
            // Backward jump: close any locals left behind on the way.
            let lb = self.dyd.labels[lb_idx].clone();
            let lb_level = self.reg_level(lb.nactvar);
            if self.nvarstack() > lb_level {
                self.code_abc(OpCode::Close, lb_level, 0, 0);
            }
            let j = self.jump();
            self.patch_list(j, lb.pc)?;
        } else {
            // Forward goto: resolved when the label appears.
            let j = self.jump();
            self.new_goto_entry(name, line, j)?;
        }
        Ok(())
    }

    fn label_stat(&mut self, name: StringId, line: u32) -> Result<(), CompileError> {
        self.expect(&Token::DoubleColon)?;
        // Skip other no-op statements so the block-follow check below sees
        // the real successor.
        loop {
            if self.check(&Token::Semi) {
                self.advance()?;
            } else if self.check(&Token::DoubleColon) {
                self.statement(None)?;
            } else {
                break;
            }
        }
        if let Some(prior) = self.find_label(name) {
            let prior_line = self.dyd.labels[prior].line;
            return Err(self.error(ErrorKind::DuplicateLabel {
                name: self.name_str(name),
                prior_line,
            }));
        }
        let last = self.block_follow(false);
        self.create_label(name, line, last)?;
        Ok(())
    }

    /// `break` is a goto to the synthetic "break" label of the nearest
    /// loop or switch block.
    fn break_stat(&mut self) -> Result<(), CompileError> {
        let line = self.lx.line();
        self.advance()?; // skip 'break'
        let j = self.jump();
        self.new_goto_entry(self.break_name, line, j)?;
        Ok(())
    }

    /// `continue [N]`: jump to the continuation point of the Nth enclosing
    /// loop. Switch blocks are skipped.
    fn continue_stat(&mut self) -> Result<(), CompileError> {
        self.advance()?; // skip 'continue'
        let mut backwards: i64 = 1;
        if let Token::Integer(i) = self.current()?.clone() {
            backwards = i;
            self.advance()?;
        }
        let mut upval = false;
        let mut target: Option<usize> = None;
        for idx in (0..self.fs().blocks.len()).rev() {
            let bl = &self.fs().blocks[idx];
            if bl.kind != BlockKind::Loop {
                upval |= bl.upval;
                continue;
            }
            backwards -= 1;
            if backwards == 0 {
                target = Some(idx);
                break;
            }
            upval |= bl.upval;
        }
        let Some(idx) = target else {
            return Err(self.error_hint(
                ErrorKind::ContinueOutsideLoop,
                "this is not within a loop.",
            ));
        };
        if upval {
            let level = self.reg_level(self.fs().blocks[idx].nactvar);
            self.code_abc(OpCode::Close, level, 0, 0);
        }
        let j = self.jump();
        let mut list = self.fs().blocks[idx].scope_end;
        self.concat_jump(&mut list, j)?;
        self.fs_mut().blocks[idx].scope_end = list;
        Ok(())
    }

    // ---- switch ----

    /// Statements of one switch arm. Direct `continue` is rejected; a
    /// trailing `break` in the default arm is a no-op.
    fn caselist(&mut self, is_default: bool) -> Result<(), CompileError> {
        loop {
            match self.current()?.clone() {
                Token::Case | Token::Default | Token::End => return Ok(()),
                Token::Break if is_default => {
                    if self.peek_next()? == Token::End {
                        self.advance()?;
                        continue;
                    }
                    self.statement(None)?;
                }
                Token::Continue => {
                    return Err(self.error_hint(
                        ErrorKind::ContinueOutsideLoop,
                        "'case' statements are not loops.",
                    ));
                }
                _ => self.statement(None)?,
            }
        }
    }

    /// Parse a compile-time-constant case expression, with optional unary
    /// sign.
    fn case_expr(&mut self) -> Result<ExpDesc, CompileError> {
        let mut lcase = ExpDesc::void();
        if self.test_next(&Token::Minus)? {
            self.simple_exp(&mut lcase, true, None)?;
            self.discharge_vars(&mut lcase)?; // collapse compile-time constants
            match lcase.kind {
                ExpKind::KInt(i) => lcase.kind = ExpKind::KInt(-i),
                ExpKind::KFlt(f) => lcase.kind = ExpKind::KFlt(-f),
                _ => {
                    return Err(self.error_hint(
                        ErrorKind::NonConstantCase,
                        "unary '-' on non-numeral type.",
                    ))
                }
            }
        } else {
            self.test_next(&Token::Plus)?; // pseudo-unary '+'
            self.simple_exp(&mut lcase, true, None)?;
            self.discharge_vars(&mut lcase)?; // collapse compile-time constants
            if !lcase.is_kconst() {
                return Err(self.error_hint(
                    ErrorKind::NonConstantCase,
                    "expression must be compile-time constant.",
                ));
            }
        }
        Ok(lcase)
    }

    fn switch_stat(&mut self, line: u32) -> Result<(), CompileError> {
        self.advance()?; // skip 'switch'
        self.test_next(&Token::LParen)?; // parentheses are optional
        let mut crtl = ExpDesc::void();
        self.expr(&mut crtl)?;
        self.exp_to_next_reg(&mut crtl)?;
        self.test_next(&Token::RParen)?;
        self.expect(&Token::Do)?;
        // The control value becomes a synthetic local.
        self.new_localvar_literal("(switch)")?;
        self.adjust_locals(1);
        let save_vidx = self.fs().nactvar - 1;
        let save_ridx = self.var(self.funcs.len() - 1, save_vidx).ridx;
        self.enter_block(BlockKind::Switch);
        loop {
            if !self.test_next(&Token::Case)? {
                return Err(self.error_expected(&Token::Case));
            }
            let mut lcase = self.case_expr()?;
            self.expect(&Token::Colon)?;
            self.enter_block(BlockKind::Plain);
            let mut test = ExpDesc::new(ExpKind::Local {
                vidx: save_vidx,
                ridx: save_ridx,
            });
            self.infix(BinOpr::Ne, &mut test)?;
            self.posfix(BinOpr::Ne, &mut test, &mut lcase, line)?;
            self.caselist(false)?;
            self.leave_block()?;
            if self.check(&Token::Case) {
                // Fall through, skipping the next arm's test pair.
                self.code(Instruction::sj(OpCode::Jmp, 2));
            }
            let ExpKind::Jump(j) = test.kind else {
                unreachable!("'~=' yields a test jump")
            };
            self.patch_to_here(j)?;
            if self.check(&Token::End) || self.check(&Token::Default) {
                break;
            }
        }
        if self.test_next(&Token::Default)? {
            self.expect(&Token::Colon)?;
            self.enter_block(BlockKind::Plain);
            self.caselist(true)?;
            self.leave_block()?;
        }
        self.check_match(&Token::End, &Token::Switch, line)?;
        self.leave_block()?; // resolves pending breaks
        Ok(())
    }

    // ---- Assignment ----

    /// Alias check for multi-assignment: when a target local/upvalue is
    /// also used as a table or key in an earlier indexed target, the
    /// earlier access must read from a saved copy.
    fn check_conflict(
        &mut self,
        lhs: &mut [ExpDesc],
        v: &ExpDesc,
    ) -> Result<(), CompileError> {
        let extra = self.fs().free_reg; // slot for the safe copy
        let mut conflict = false;
        for lh in lhs.iter_mut() {
            match (&mut lh.kind, v.kind) {
                (ExpKind::IndexUp { t, key }, ExpKind::Upval(u)) if *t == u => {
                    conflict = true;
                    let key = *key;
                    lh.kind = ExpKind::IndexStr { t: extra, key };
                }
                (ExpKind::IndexStr { t, .. }, ExpKind::Local { ridx, .. }) if *t == ridx => {
                    conflict = true;
                    *t = extra;
                }
                (ExpKind::IndexI { t, .. }, ExpKind::Local { ridx, .. }) if *t == ridx => {
                    conflict = true;
                    *t = extra;
                }
                (ExpKind::Indexed { t, key }, ExpKind::Local { ridx, .. }) => {
                    if *t == ridx {
                        conflict = true;
                        *t = extra;
                    }
                    if *key == ridx {
                        conflict = true;
                        *key = extra;
                    }
                }
                _ => {}
            }
        }
        if conflict {
            // Save the original value in the safe slot.
            match v.kind {
                ExpKind::Local { ridx, .. } => {
                    self.code_abc(OpCode::Move, extra, ridx, 0);
                }
                ExpKind::Upval(u) => {
                    self.code_abc(OpCode::GetUpval, extra, u, 0);
                }
                _ => unreachable!(),
            }
            self.reserve_regs(1)?;
        }
        Ok(())
    }

    /// Compound assignment `lhs <op>= expr`.
    fn compound_assign(
        &mut self,
        v: &ExpDesc,
        op: BinOpr,
    ) -> Result<(), CompileError> {
        self.advance()?; // skip the folded '='
        let line = self.lx.line();
        let mut e = *v; // lvalue re-read as the left operand
        if !matches!(v.kind, ExpKind::Local { .. }) {
            // Shield the registers holding the lvalue's table and key.
            let guard = self.fs().free_reg - self.nvarstack();
            self.reserve_regs(guard)?;
            self.enter_level()?;
            self.infix(op, &mut e)?;
            let mut v2 = ExpDesc::void();
            self.expr(&mut v2)?;
            self.posfix(op, &mut e, &mut v2, line)?;
            self.leave_level();
            self.exp_to_next_reg(&mut e)?;
            self.set_one_ret(&mut e);
            self.store_var(v, &mut e)
        } else {
            self.enter_level()?;
            self.infix(op, &mut e)?;
            let mut v2 = ExpDesc::void();
            self.expr(&mut v2)?;
            self.posfix(op, &mut e, &mut v2, line)?;
            self.leave_level();
            self.set_one_ret(&mut e);
            self.store_var(v, &mut e)
        }
    }

    /// The tail of an assignment once the first target is parsed. `lhs`
    /// holds every target seen so far; stores unwind right to left.
    fn rest_assign(
        &mut self,
        lhs: &mut Vec<ExpDesc>,
        idx: usize,
    ) -> Result<(), CompileError> {
        if !lhs[idx].is_var() {
            return Err(self.error_hint(
                ErrorKind::Syntax("syntax error near '='".into()),
                "this cannot be assigned to.",
            ));
        }
        self.check_readonly(&lhs[idx])?;
        if self.test_next(&Token::Comma)? {
            let mut nv = ExpDesc::void();
            self.suffixed_exp(&mut nv, None)?;
            if !nv.is_indexed() {
                self.check_conflict(&mut lhs[..=idx], &nv)?;
            }
            lhs.push(nv);
            self.enter_level()?;
            self.rest_assign(lhs, idx + 1)?;
            self.leave_level();
        } else {
            // '=' (or a compound operator folded into it).
            if self.check(&Token::Assign) && self.lx.has_compound() {
                let cop = self.lx.take_compound().expect("compound flag set");
                if idx != 0 {
                    return Err(self.error(ErrorKind::UnsupportedTupleAssignment));
                }
                let v = lhs[idx];
                return self.compound_assign(&v, Self::compound_to_binop(cop));
            }
            self.expect(&Token::Assign)?;
            let mut e = ExpDesc::void();
            let mut prop = ValueKind::Unknown;
            let nexps = self.explist(&mut e, Some(&mut prop))?;
            if nexps != idx + 1 {
                self.adjust_assign(idx + 1, nexps, &mut e)?;
            } else {
                self.set_one_ret(&mut e);
                let v = lhs[idx];
                if let ExpKind::Local { vidx, .. } = v.kind {
                    self.process_assign(vidx, prop, self.lx.lastline);
                }
                self.store_var(&v, &mut e)?;
                return Ok(());
            }
        }
        // Default store: take the value sitting below the watermark.
        let v = lhs[idx];
        let mut e = ExpDesc::new(ExpKind::NonReloc(self.fs().free_reg - 1));
        self.store_var(&v, &mut e)
    }

    /// Expression statement: a call, or the head of an assignment.
    fn expr_stat(&mut self) -> Result<(), CompileError> {
        let mut v = ExpDesc::void();
        self.suffixed_exp(&mut v, None)?;
        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            let mut lhs = vec![v];
            self.rest_assign(&mut lhs, 0)?;
        } else {
            let ExpKind::Call(pc) = v.kind else {
                return Err(self.error_hint(
                    ErrorKind::Syntax("syntax error".into()),
                    "this expression cannot stand alone as a statement.",
                ));
            };
            // A call statement discards its results.
            self.fs_mut().proto.get_mut(pc as usize).set_c(1);
        }
        Ok(())
    }

    // ---- Declarations ----

    fn local_func(&mut self) -> Result<(), CompileError> {
        let line = self.lx.line();
        let fvar = self.fs().nactvar; // function's own variable index
        let name = self.str_checkname(true)?;
        self.new_localvar(name)?;
        self.adjust_locals(1);
        let mut b = ExpDesc::void();
        let mut p = RetProp::NotSeen;
        self.body(&mut b, false, line, Some(&mut p))?;
        if let RetProp::Known(k) = p {
            self.var_mut(fvar).type_prop = k;
        }
        // The variable only exists for debug purposes after the closure.
        let pc = self.fs().pc() as u32;
        let pidx = self.var(self.funcs.len() - 1, fvar).pidx as usize;
        self.fs_mut().proto.local_vars[pidx].start_pc = pc;
        Ok(())
    }

    /// `local NAME [':' hint] [attrib] {',' ...} ['=' explist]`
    fn local_stat(&mut self) -> Result<(), CompileError> {
        let mut to_close: Option<u16> = None;
        let mut nvars: u16 = 0;
        let mut last_vidx;
        loop {
            let name = self.str_checkname(true)?;
            let vidx = self.new_localvar(name)?;
            let hint = self.get_type_hint()?;
            let kind = self.get_local_attribute()?;
            {
                let var = self.var_mut(vidx);
                var.type_hint = hint;
                var.kind = kind;
            }
            if kind == VarKind::ToBeClosed {
                if to_close.is_some() {
                    return Err(self.error(ErrorKind::MultipleToBeClosed));
                }
                to_close = Some(self.fs().nactvar + nvars);
            }
            last_vidx = vidx;
            nvars += 1;
            if !self.test_next(&Token::Comma)? {
                break;
            }
        }
        let mut e = ExpDesc::void();
        let mut prop = ValueKind::Unknown;
        let nexps = if self.test_next(&Token::Assign)? {
            self.explist(&mut e, Some(&mut prop))?
        } else {
            0
        };
        let last_is_const = self.var(self.funcs.len() - 1, last_vidx).kind == VarKind::Const;
        if nvars as usize == nexps && last_is_const {
            if let Some(k) = self.exp_to_const(&e) {
                // The last variable folds into a compile-time constant:
                // it occupies a compiler slot but no register.
                {
                    let var = self.var_mut(last_vidx);
                    var.kind = VarKind::CompileTimeConst;
                    var.k = Some(k);
                }
                self.adjust_locals(nvars - 1);
                self.fs_mut().nactvar += 1;
                self.check_to_close(to_close)?;
                return Ok(());
            }
        }
        if nexps == 1 {
            self.process_assign(last_vidx, prop, self.lx.lastline);
        }
        self.adjust_assign(nvars as usize, nexps, &mut e)?;
        self.adjust_locals(nvars);
        self.check_to_close(to_close)?;
        Ok(())
    }

    fn check_to_close(&mut self, level: Option<u16>) -> Result<(), CompileError> {
        if let Some(level) = level {
            self.fs_mut().mark_to_be_closed();
            let reg = self.reg_level(level);
            self.code_abc(OpCode::Tbc, reg, 0, 0);
        }
        Ok(())
    }

    /// `funcname -> NAME {'.' NAME} [':' NAME]`
    fn func_name(&mut self) -> Result<(ExpDesc, bool), CompileError> {
        let name = self.str_checkname(true)?;
        let mut v = self.single_var(name)?;
        while self.check(&Token::Dot) {
            self.fieldsel(&mut v)?;
        }
        let mut is_method = false;
        if self.check(&Token::Colon) {
            is_method = true;
            self.fieldsel(&mut v)?;
        }
        Ok((v, is_method))
    }

    fn func_stat(&mut self, line: u32) -> Result<(), CompileError> {
        self.advance()?; // skip FUNCTION
        let (v, is_method) = self.func_name()?;
        let mut b = ExpDesc::void();
        self.body(&mut b, is_method, line, None)?;
        self.check_readonly(&v)?;
        self.store_var(&v, &mut b)?;
        // The definition "happens" on its first line.
        self.fix_line(line);
        Ok(())
    }

    /// `return [explist] [';']`
    fn ret_stat(&mut self, prop: Option<&mut RetProp>) -> Result<(), CompileError> {
        let mut first = self.nvarstack();
        let nret;
        if self.block_follow(true) || self.check(&Token::Semi) {
            nret = 0;
        } else {
            let mut e = ExpDesc::void();
            let mut kind = ValueKind::Unknown;
            let n = self.explist(&mut e, Some(&mut kind))?;
            if let Some(p) = prop {
                *p = RetProp::Known(kind);
            }
            if e.is_multret() {
                self.set_multret(&e)?;
                if let ExpKind::Call(pc) = e.kind {
                    if n == 1 && !self.fs().block().inside_tbc {
                        // Sole call as the return value: make it a tail call.
                        let inst = self.fs_mut().proto.get_mut(pc as usize);
                        inst.set_opcode(OpCode::TailCall);
                    }
                }
                nret = -1;
            } else if n == 1 {
                first = self.exp_to_any_reg(&mut e)?;
                nret = 1;
            } else {
                self.exp_to_next_reg(&mut e)?;
                nret = n as i32;
                debug_assert_eq!(nret, (self.fs().free_reg - first) as i32);
            }
        }
        self.code_ret(first, nret);
        self.test_next(&Token::Semi)?;
        Ok(())
    }

    // ---- Driver ----

    /// The main chunk: an implicit vararg function closing over `_ENV`.
    fn main_func(&mut self) -> Result<(), CompileError> {
        self.open_func(0);
        self.set_vararg(0);
        let env_name = self.env_name;
        self.fs_mut().proto.upvalues.push(UpvalDesc {
            name: env_name,
            in_stack: true,
            index: 0,
            kind: VarKind::Regular,
        });
        self.statlist(None)?;
        if !self.check(&Token::Eof) {
            return Err(self.error_expected(&Token::Eof));
        }
        self.close_func()?;
        Ok(())
    }
}

/// Pending state while building a table constructor.
struct ConsControl {
    /// Last array item read, not yet on the stack.
    v: ExpDesc,
    /// Array items already flushed.
    na: u32,
    /// Record entries written.
    nh: u32,
    /// Array items pending flush.
    tostore: i32,
}

/// Compile Charon source into a prototype tree.
pub fn compile(source: &[u8], name: &str) -> Result<Chunk, CompileError> {
    let mut parser = Parser::new(source, name);
    parser.main_func()?;
    let fs = parser.funcs.pop().expect("main function missing");
    debug_assert!(parser.funcs.is_empty());
    debug_assert!(parser.dyd.actvar.is_empty());
    debug_assert!(parser.dyd.gotos.is_empty());
    debug_assert!(parser.dyd.labels.is_empty());
    Ok(Chunk {
        proto: fs.proto,
        strings: parser.lx.strings,
        warnings: parser.warnings,
    })
}
