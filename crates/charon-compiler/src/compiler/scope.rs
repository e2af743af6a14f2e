/// Scope bookkeeping: the active-variable table shared across nested
/// functions, per-function state, block records, and the label/goto lists.
use crate::compiler::exp::NO_JUMP;
use crate::proto::{Constant, Proto, VarKind};
use crate::typehint::ValueKind;
use charon_core::string::StringId;

/// Maximum locals per function; compiler indices must fit the bytecode's
/// register operands with headroom for test instructions.
pub const MAX_VARS: usize = 249;

/// A declared variable. Lives in the shared active-variable array; a
/// variable becomes visible (and gets a register plus a debug slot) only
/// when `adjust_locals` activates it.
#[derive(Clone, Debug)]
pub struct VarDesc {
    pub name: StringId,
    pub kind: VarKind,
    pub type_hint: ValueKind,
    /// Last observed assigned kind, for hint checking.
    pub type_prop: ValueKind,
    /// Register index; unset until activation, meaningless for
    /// compile-time constants.
    pub ridx: u8,
    /// Index of the debug entry in the prototype's local-var table.
    pub pidx: u16,
    /// Declaration line, reported by shadowing warnings.
    pub line: u32,
    /// Folded value when `kind` is `CompileTimeConst`.
    pub k: Option<Constant>,
}

/// A label definition or a pending goto. Both lists share this layout; for
/// a goto, `pc` is the jump to patch, for a label it is the target.
#[derive(Clone, Debug)]
pub struct LabelDesc {
    pub name: StringId,
    pub line: u32,
    pub pc: i32,
    /// Active variables at the site.
    pub nactvar: u16,
    /// Set when the jump must close upvalues on the way out.
    pub close: bool,
}

/// Dynamic state shared by all nested functions of one parse: behaves as a
/// set of stacks windowed by each function's `first_*` indices.
#[derive(Default)]
pub struct Dyndata {
    pub actvar: Vec<VarDesc>,
    pub gotos: Vec<LabelDesc>,
    pub labels: Vec<LabelDesc>,
}

/// How a block participates in `break`/`continue` resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Plain,
    /// `break` and `continue` both target this block.
    Loop,
    /// `break` targets this block, but `continue` skips over it to the
    /// enclosing loop.
    Switch,
}

impl BlockKind {
    pub fn takes_break(self) -> bool {
        matches!(self, BlockKind::Loop | BlockKind::Switch)
    }
}

/// One entry of the block nesting chain.
#[derive(Clone, Debug)]
pub struct BlockCnt {
    pub kind: BlockKind,
    /// Jump list for `continue`, patched at the loop's continuation point.
    pub scope_end: i32,
    /// Window starts into the shared label/goto lists.
    pub first_label: usize,
    pub first_goto: usize,
    /// Active variables outside this block.
    pub nactvar: u16,
    /// True if some local of this block is captured as an upvalue.
    pub upval: bool,
    /// True while inside the scope of a to-be-closed variable.
    pub inside_tbc: bool,
}

/// Per-function compilation state. These form a stack; only the innermost
/// is mutated.
pub struct FuncState {
    pub proto: Proto,
    /// Index of the enclosing function in the parser's stack.
    pub prev: Option<usize>,
    /// Highest pc that is a jump target; guards instruction merging.
    pub last_target: i32,
    pub free_reg: u8,
    /// Number of active compiler indices in this function.
    pub nactvar: u16,
    /// Window starts into the shared dynamic arrays.
    pub first_local: usize,
    pub first_label: usize,
    pub blocks: Vec<BlockCnt>,
    /// Set once any block of this function captures an upvalue.
    pub needs_close: bool,
}

impl FuncState {
    pub fn new(prev: Option<usize>) -> Self {
        FuncState {
            proto: Proto::new(),
            prev,
            last_target: NO_JUMP,
            free_reg: 0,
            nactvar: 0,
            first_local: 0,
            first_label: 0,
            blocks: Vec::new(),
            needs_close: false,
        }
    }

    pub fn pc(&self) -> i32 {
        self.proto.code_len() as i32
    }

    pub fn block(&self) -> &BlockCnt {
        self.blocks.last().expect("no active block")
    }

    pub fn block_mut(&mut self) -> &mut BlockCnt {
        self.blocks.last_mut().expect("no active block")
    }

    /// Mark the innermost block containing the variable at compiler level
    /// `level` as having an upvalue capture.
    pub fn mark_upval(&mut self, level: u16) {
        let bl = self
            .blocks
            .iter_mut()
            .rev()
            .find(|bl| bl.nactvar <= level)
            .expect("variable outside any block");
        bl.upval = true;
        self.needs_close = true;
    }

    /// Mark the current block as holding a to-be-closed variable.
    pub fn mark_to_be_closed(&mut self) {
        let bl = self.block_mut();
        bl.upval = true;
        bl.inside_tbc = true;
        self.needs_close = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_kind_break_targets() {
        assert!(BlockKind::Loop.takes_break());
        assert!(BlockKind::Switch.takes_break());
        assert!(!BlockKind::Plain.takes_break());
    }

    #[test]
    fn test_mark_upval_sets_enclosing_block() {
        let mut fs = FuncState::new(None);
        fs.blocks.push(BlockCnt {
            kind: BlockKind::Plain,
            scope_end: NO_JUMP,
            first_label: 0,
            first_goto: 0,
            nactvar: 0,
            upval: false,
            inside_tbc: false,
        });
        fs.blocks.push(BlockCnt {
            kind: BlockKind::Loop,
            scope_end: NO_JUMP,
            first_label: 0,
            first_goto: 0,
            nactvar: 2,
            upval: false,
            inside_tbc: false,
        });
        fs.nactvar = 3;
        // Level 1 lives outside the inner block (which starts at 2).
        fs.mark_upval(1);
        assert!(fs.blocks[0].upval);
        assert!(!fs.blocks[1].upval);
        assert!(fs.needs_close);
        // Level 2 is inside the inner block.
        fs.mark_upval(2);
        assert!(fs.blocks[1].upval);
    }
}
