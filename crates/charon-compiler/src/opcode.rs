/// Charon bytecode instructions and their encoding.
///
/// Instruction format (32 bits):
/// - Bits 0-6: OpCode (7 bits)
/// - Bit 7: k flag
/// - Bits 8-15: A
/// - For iABC: bits 16-23 = B, bits 24-31 = C
/// - For iABx: Bx = bits 16-31 (unsigned)
/// - For iAsBx: sBx = Bx - OFFSET_SBX (signed interpretation of Bx)
/// - For iAx: Ax = bits 8-31 (unsigned)
/// - For isJ: sJ = bits 8-31 minus OFFSET_SJ (signed jump offset)
use std::fmt;

const SIZE_OP: u32 = 7;
const SIZE_K: u32 = 1;
const SIZE_A: u32 = 8;
const SIZE_B: u32 = 8;
const SIZE_C: u32 = 8;
const SIZE_BX: u32 = SIZE_B + SIZE_C;
const SIZE_AX: u32 = SIZE_A + SIZE_B + SIZE_C;
const SIZE_SJ: u32 = SIZE_A + SIZE_B + SIZE_C;

const POS_OP: u32 = 0;
const POS_K: u32 = POS_OP + SIZE_OP;
const POS_A: u32 = POS_K + SIZE_K;
const POS_B: u32 = POS_A + SIZE_A;
const POS_C: u32 = POS_B + SIZE_B;

const fn mask(n: u32) -> u32 {
    (1 << n) - 1
}

pub const MAX_A: u32 = mask(SIZE_A);
pub const MAX_B: u32 = mask(SIZE_B);
pub const MAX_C: u32 = mask(SIZE_C);
pub const MAX_BX: u32 = mask(SIZE_BX);
pub const MAX_SBX: i32 = (MAX_BX >> 1) as i32;
pub const MIN_SBX: i32 = -MAX_SBX;
pub const MAX_AX: u32 = mask(SIZE_AX);
pub const MAX_SJ: i32 = (mask(SIZE_SJ) >> 1) as i32;
pub const MIN_SJ: i32 = -MAX_SJ;

pub const OFFSET_SBX: i32 = MAX_SBX;
pub const OFFSET_SJ: i32 = MAX_SJ;

/// Register-count ceiling per function. The A/B/C operands are 8 bits, and
/// the top value is reserved as `NO_REG` in test instructions.
pub const MAX_REGS: u32 = 254;

/// All Charon opcodes. The set follows the Lua 5.4 instruction set, plus
/// `In` for the membership operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,
    LoadI,
    LoadF,
    LoadK,
    LoadKx,
    LoadFalse,
    LFalseSkip,
    LoadTrue,
    LoadNil,
    GetUpval,
    SetUpval,
    GetTabUp,
    GetTable,
    GetI,
    GetField,
    SetTabUp,
    SetTable,
    SetI,
    SetField,
    NewTable,
    Self_,
    AddI,
    AddK,
    SubK,
    MulK,
    ModK,
    PowK,
    DivK,
    IDivK,
    BAndK,
    BOrK,
    BXorK,
    ShrI,
    ShlI,
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    MmBin,
    MmBinI,
    MmBinK,
    Unm,
    BNot,
    Not,
    Len,
    Concat,
    Close,
    Tbc,
    Jmp,
    Eq,
    Lt,
    Le,
    EqK,
    EqI,
    LtI,
    LeI,
    GtI,
    GeI,
    Test,
    TestSet,
    In,
    Call,
    TailCall,
    Return,
    Return0,
    Return1,
    ForLoop,
    ForPrep,
    TForPrep,
    TForCall,
    TForLoop,
    SetList,
    Closure,
    Vararg,
    VarargPrep,
    ExtraArg,
}

static NAMES: [&str; OpCode::COUNT] = [
    "MOVE",
    "LOADI",
    "LOADF",
    "LOADK",
    "LOADKX",
    "LOADFALSE",
    "LFALSESKIP",
    "LOADTRUE",
    "LOADNIL",
    "GETUPVAL",
    "SETUPVAL",
    "GETTABUP",
    "GETTABLE",
    "GETI",
    "GETFIELD",
    "SETTABUP",
    "SETTABLE",
    "SETI",
    "SETFIELD",
    "NEWTABLE",
    "SELF",
    "ADDI",
    "ADDK",
    "SUBK",
    "MULK",
    "MODK",
    "POWK",
    "DIVK",
    "IDIVK",
    "BANDK",
    "BORK",
    "BXORK",
    "SHRI",
    "SHLI",
    "ADD",
    "SUB",
    "MUL",
    "MOD",
    "POW",
    "DIV",
    "IDIV",
    "BAND",
    "BOR",
    "BXOR",
    "SHL",
    "SHR",
    "MMBIN",
    "MMBINI",
    "MMBINK",
    "UNM",
    "BNOT",
    "NOT",
    "LEN",
    "CONCAT",
    "CLOSE",
    "TBC",
    "JMP",
    "EQ",
    "LT",
    "LE",
    "EQK",
    "EQI",
    "LTI",
    "LEI",
    "GTI",
    "GEI",
    "TEST",
    "TESTSET",
    "IN",
    "CALL",
    "TAILCALL",
    "RETURN",
    "RETURN0",
    "RETURN1",
    "FORLOOP",
    "FORPREP",
    "TFORPREP",
    "TFORCALL",
    "TFORLOOP",
    "SETLIST",
    "CLOSURE",
    "VARARG",
    "VARARGPREP",
    "EXTRAARG",
];

impl OpCode {
    pub const COUNT: usize = OpCode::ExtraArg as usize + 1;

    pub fn from_u8(val: u8) -> Option<OpCode> {
        if (val as usize) < Self::COUNT {
            // Safety: repr(u8) with verified range.
            Some(unsafe { std::mem::transmute::<u8, OpCode>(val) })
        } else {
            None
        }
    }

    /// Instruction format for this opcode.
    pub fn format(&self) -> InstructionFormat {
        use InstructionFormat::*;
        use OpCode::*;
        match self {
            ExtraArg => IAx,
            Jmp => IsJ,
            LoadI | LoadF => IAsBx,
            LoadK | LoadKx | Closure | ForLoop | ForPrep | TForPrep | TForLoop => IABx,
            _ => IABC,
        }
    }

    pub fn name(&self) -> &'static str {
        NAMES[*self as usize]
    }

    /// True if this opcode is a test that conditionally skips the following
    /// jump.
    pub fn is_test(&self) -> bool {
        use OpCode::*;
        matches!(
            self,
            Eq | Lt | Le | EqK | EqI | LtI | LeI | GtI | GeI | Test | TestSet
        )
    }

    /// True for the return family of opcodes.
    pub fn is_return(&self) -> bool {
        matches!(self, OpCode::Return | OpCode::Return0 | OpCode::Return1)
    }
}

/// Instruction format classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstructionFormat {
    IABC,
    IABx,
    IAsBx,
    IAx,
    IsJ,
}

/// A 32-bit Charon bytecode instruction.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    // ---- Constructors ----

    pub fn abc(op: OpCode, a: u8, b: u8, c: u8, k: bool) -> Self {
        let mut i = (op as u32) << POS_OP;
        i |= (k as u32) << POS_K;
        i |= (a as u32) << POS_A;
        i |= (b as u32) << POS_B;
        i |= (c as u32) << POS_C;
        Instruction(i)
    }

    pub fn abx(op: OpCode, a: u8, bx: u32) -> Self {
        debug_assert!(bx <= MAX_BX, "Bx out of range: {bx}");
        let mut i = (op as u32) << POS_OP;
        i |= (a as u32) << POS_A;
        i |= bx << POS_B;
        Instruction(i)
    }

    pub fn asbx(op: OpCode, a: u8, sbx: i32) -> Self {
        debug_assert!((MIN_SBX..=MAX_SBX).contains(&sbx), "sBx out of range: {sbx}");
        Self::abx(op, a, (sbx + OFFSET_SBX) as u32)
    }

    pub fn ax(op: OpCode, ax: u32) -> Self {
        debug_assert!(ax <= MAX_AX, "Ax out of range: {ax}");
        let mut i = (op as u32) << POS_OP;
        i |= ax << POS_A;
        Instruction(i)
    }

    pub fn sj(op: OpCode, sj: i32) -> Self {
        debug_assert!((MIN_SJ..=MAX_SJ).contains(&sj), "sJ out of range: {sj}");
        let val = (sj + OFFSET_SJ) as u32;
        let mut i = (op as u32) << POS_OP;
        i |= val << POS_A;
        Instruction(i)
    }

    // ---- Decoders ----

    pub fn opcode(&self) -> OpCode {
        let val = (self.0 >> POS_OP) & mask(SIZE_OP);
        OpCode::from_u8(val as u8).unwrap_or(OpCode::Move)
    }

    pub fn k(&self) -> bool {
        ((self.0 >> POS_K) & 1) != 0
    }

    pub fn a(&self) -> u8 {
        ((self.0 >> POS_A) & mask(SIZE_A)) as u8
    }

    pub fn b(&self) -> u8 {
        ((self.0 >> POS_B) & mask(SIZE_B)) as u8
    }

    pub fn c(&self) -> u8 {
        ((self.0 >> POS_C) & mask(SIZE_C)) as u8
    }

    pub fn bx(&self) -> u32 {
        (self.0 >> POS_B) & mask(SIZE_BX)
    }

    pub fn sbx(&self) -> i32 {
        self.bx() as i32 - OFFSET_SBX
    }

    pub fn ax_field(&self) -> u32 {
        (self.0 >> POS_A) & mask(SIZE_AX)
    }

    pub fn get_sj(&self) -> i32 {
        let val = (self.0 >> POS_A) & mask(SIZE_SJ);
        val as i32 - OFFSET_SJ
    }

    // ---- Mutators (backpatching) ----

    pub fn set_opcode(&mut self, op: OpCode) {
        self.0 = (self.0 & !(mask(SIZE_OP) << POS_OP)) | ((op as u32) << POS_OP);
    }

    pub fn set_a(&mut self, a: u8) {
        self.0 = (self.0 & !(mask(SIZE_A) << POS_A)) | ((a as u32) << POS_A);
    }

    pub fn set_b(&mut self, b: u8) {
        self.0 = (self.0 & !(mask(SIZE_B) << POS_B)) | ((b as u32) << POS_B);
    }

    pub fn set_c(&mut self, c: u8) {
        self.0 = (self.0 & !(mask(SIZE_C) << POS_C)) | ((c as u32) << POS_C);
    }

    pub fn set_bx(&mut self, bx: u32) {
        debug_assert!(bx <= MAX_BX);
        self.0 = (self.0 & !(mask(SIZE_BX) << POS_B)) | (bx << POS_B);
    }

    pub fn set_sj(&mut self, sj: i32) {
        debug_assert!((MIN_SJ..=MAX_SJ).contains(&sj));
        let val = (sj + OFFSET_SJ) as u32;
        self.0 = (self.0 & !(mask(SIZE_SJ) << POS_A)) | (val << POS_A);
    }

    pub fn set_k(&mut self, k: bool) {
        self.0 = (self.0 & !(1 << POS_K)) | ((k as u32) << POS_K);
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.opcode();
        write!(f, "{}", op.name())?;
        match op.format() {
            InstructionFormat::IABC => {
                write!(f, " A={} B={} C={}", self.a(), self.b(), self.c())?;
                if self.k() {
                    write!(f, " k")?;
                }
            }
            InstructionFormat::IABx => write!(f, " A={} Bx={}", self.a(), self.bx())?,
            InstructionFormat::IAsBx => write!(f, " A={} sBx={}", self.a(), self.sbx())?,
            InstructionFormat::IAx => write!(f, " Ax={}", self.ax_field())?,
            InstructionFormat::IsJ => write!(f, " sJ={}", self.get_sj())?,
        }
        Ok(())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
