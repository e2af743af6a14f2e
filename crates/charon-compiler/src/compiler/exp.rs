/// Expression descriptors and operator tables.
use charon_core::string::StringId;

/// Sentinel for an empty jump-patch list.
pub const NO_JUMP: i32 = -1;

/// Where an expression's value currently lives. Register allocation is
/// deferred: most variants describe a value that has not been materialized
/// yet, and the emitter collapses them on demand.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExpKind {
    /// No value yet.
    Void,
    Nil,
    True,
    False,
    /// Integer literal, not yet in the constant pool.
    KInt(i64),
    /// Float literal, not yet in the constant pool.
    KFlt(f64),
    /// String literal, not yet in the constant pool.
    KStr(StringId),
    /// Materialized constant-pool entry.
    K(u32),
    /// Compile-time constant local; payload is the absolute index into the
    /// active-variable array.
    Const(u32),
    /// Active local: compiler index and register index.
    Local { vidx: u16, ridx: u8 },
    /// Upvalue at the given index.
    Upval(u8),
    /// Indexed upvalue: `t` is an upvalue index, `key` a string constant.
    IndexUp { t: u8, key: u32 },
    /// Indexed register with a string-constant key.
    IndexStr { t: u8, key: u32 },
    /// Indexed register with a small integer key.
    IndexI { t: u8, key: u8 },
    /// Indexed register with a register key.
    Indexed { t: u8, key: u8 },
    /// Result of a test: pc of the emitted jump.
    Jump(i32),
    /// Instruction whose destination register is not yet set.
    Reloc(i32),
    /// Value fixed in a register.
    NonReloc(u8),
    /// Call instruction; yields one result unless adjusted.
    Call(i32),
    /// Vararg instruction; yields one result unless adjusted.
    Vararg(i32),
}

/// A partially materialized expression plus its pending control-flow
/// patches: `t` collects jumps taken when the expression is true, `f` when
/// it is false. Copied by value, never aliased.
#[derive(Clone, Copy, Debug)]
pub struct ExpDesc {
    pub kind: ExpKind,
    pub t: i32,
    pub f: i32,
}

impl ExpDesc {
    pub fn new(kind: ExpKind) -> Self {
        ExpDesc {
            kind,
            t: NO_JUMP,
            f: NO_JUMP,
        }
    }

    pub fn void() -> Self {
        Self::new(ExpKind::Void)
    }

    pub fn str(id: StringId) -> Self {
        Self::new(ExpKind::KStr(id))
    }

    pub fn int(i: i64) -> Self {
        Self::new(ExpKind::KInt(i))
    }

    /// Pending true/false patches make an expression conditional.
    pub fn has_jumps(&self) -> bool {
        self.t != self.f
    }

    /// True for literal variants that fold without touching a register.
    pub fn is_kconst(&self) -> bool {
        matches!(
            self.kind,
            ExpKind::Nil
                | ExpKind::True
                | ExpKind::False
                | ExpKind::KInt(_)
                | ExpKind::KFlt(_)
                | ExpKind::KStr(_)
        ) && !self.has_jumps()
    }

    pub fn is_numeral(&self) -> bool {
        matches!(self.kind, ExpKind::KInt(_) | ExpKind::KFlt(_)) && !self.has_jumps()
    }

    /// Call or vararg: may produce any number of results.
    pub fn is_multret(&self) -> bool {
        matches!(self.kind, ExpKind::Call(_) | ExpKind::Vararg(_))
    }

    /// True for variants that can be the target of an assignment.
    pub fn is_var(&self) -> bool {
        matches!(
            self.kind,
            ExpKind::Local { .. }
                | ExpKind::Upval(_)
                | ExpKind::Const(_)
                | ExpKind::IndexUp { .. }
                | ExpKind::IndexStr { .. }
                | ExpKind::IndexI { .. }
                | ExpKind::Indexed { .. }
        )
    }

    pub fn is_indexed(&self) -> bool {
        matches!(
            self.kind,
            ExpKind::IndexUp { .. }
                | ExpKind::IndexStr { .. }
                | ExpKind::IndexI { .. }
                | ExpKind::Indexed { .. }
        )
    }
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOpr {
    Minus,
    BNot,
    Not,
    Len,
}

/// Minimum subexpression priority to the right of a unary operator.
pub const UNARY_PRIORITY: u8 = 12;

/// Binary operators, including the short-circuit family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOpr {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Concat,
    Shl,
    Shr,
    BAnd,
    BOr,
    BXor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    /// `??`: evaluates the right operand only when the left is nil.
    Coalesce,
}

impl BinOpr {
    /// (left, right) binding priorities. A right priority lower than the
    /// left one makes the operator right-associative.
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinOpr::Or | BinOpr::Coalesce => (1, 1),
            BinOpr::And => (2, 2),
            BinOpr::Eq | BinOpr::Ne | BinOpr::Lt | BinOpr::Le | BinOpr::Gt | BinOpr::Ge => (3, 3),
            BinOpr::BOr => (4, 4),
            BinOpr::BXor => (5, 5),
            BinOpr::BAnd => (6, 6),
            BinOpr::Shl | BinOpr::Shr => (7, 7),
            BinOpr::Concat => (9, 8),
            BinOpr::Add | BinOpr::Sub => (10, 10),
            BinOpr::Mul | BinOpr::Div | BinOpr::IDiv | BinOpr::Mod => (11, 11),
            BinOpr::Pow => (14, 13),
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOpr::Eq | BinOpr::Ne | BinOpr::Lt | BinOpr::Le | BinOpr::Gt | BinOpr::Ge
        )
    }

    pub fn is_foldable_arith(self) -> bool {
        matches!(
            self,
            BinOpr::Add
                | BinOpr::Sub
                | BinOpr::Mul
                | BinOpr::Div
                | BinOpr::IDiv
                | BinOpr::Mod
                | BinOpr::Pow
                | BinOpr::Shl
                | BinOpr::Shr
                | BinOpr::BAnd
                | BinOpr::BOr
                | BinOpr::BXor
        )
    }

    /// Operators whose operands must be integers.
    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinOpr::Shl | BinOpr::Shr | BinOpr::BAnd | BinOpr::BOr | BinOpr::BXor
        )
    }
}
