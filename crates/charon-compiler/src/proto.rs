/// Function prototype: the compiled artifact of one function.
use crate::opcode::Instruction;
use charon_core::string::StringId;

/// A constant in the constant pool.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(StringId),
}

/// Declaration kind of a variable, carried into upvalue descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarKind {
    /// Ordinary assignable variable.
    Regular,
    /// `<const>` attribute: read-only after initialization.
    Const,
    /// `<close>` attribute: closed on scope exit.
    ToBeClosed,
    /// `<const>` whose initializer folded at parse time; occupies a compiler
    /// slot but no register.
    CompileTimeConst,
}

/// Description of an upvalue.
#[derive(Clone, Debug)]
pub struct UpvalDesc {
    pub name: StringId,
    /// True if captured from the enclosing function's stack, false if
    /// re-captured from the enclosing function's own upvalues.
    pub in_stack: bool,
    /// Register index when `in_stack`, upvalue index otherwise.
    pub index: u8,
    pub kind: VarKind,
}

/// Debug entry for a local variable's register lifetime.
#[derive(Clone, Debug)]
pub struct LocalVar {
    pub name: StringId,
    /// First PC where the variable is active.
    pub start_pc: u32,
    /// First PC where the variable is dead.
    pub end_pc: u32,
}

/// Absolute line marker, used when a line delta does not fit in the
/// per-instruction relative info.
#[derive(Clone, Debug)]
pub struct AbsLineInfo {
    pub pc: u32,
    pub line: u32,
}

/// A compiled function prototype.
#[derive(Clone, Debug, Default)]
pub struct Proto {
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub protos: Vec<Proto>,
    pub upvalues: Vec<UpvalDesc>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack: u8,
    pub source: Option<StringId>,
    /// Line of the `function` keyword (0 for the main chunk).
    pub line_defined: u32,
    pub last_line_defined: u32,

    // --- Debug info ---
    /// Per-instruction line delta from the previous instruction.
    pub line_info: Vec<i8>,
    /// Absolute markers for deltas outside the i8 range.
    pub abs_line_info: Vec<AbsLineInfo>,
    pub local_vars: Vec<LocalVar>,

    /// Line of the most recently emitted instruction.
    current_line: u32,
}

impl Proto {
    pub fn new() -> Self {
        Proto {
            max_stack: 2, // registers 0/1 are always valid
            ..Default::default()
        }
    }

    /// Append an instruction, recording its source line. Returns its pc.
    pub fn emit(&mut self, inst: Instruction, line: u32) -> usize {
        let pc = self.code.len();
        self.code.push(inst);
        self.save_line_info(pc, line);
        pc
    }

    fn save_line_info(&mut self, pc: usize, line: u32) {
        let delta = line as i64 - self.current_line as i64;
        if (-128..=127).contains(&delta) {
            self.line_info.push(delta as i8);
        } else {
            self.line_info.push(0);
            self.abs_line_info.push(AbsLineInfo {
                pc: pc as u32,
                line,
            });
        }
        self.current_line = line;
    }

    /// Re-attribute the last emitted instruction to `line`.
    pub fn fix_line(&mut self, line: u32) {
        let pc = self.code.len() - 1;
        let old = self.line_info.pop().expect("no line info to fix");
        if old == 0 {
            if let Some(last) = self.abs_line_info.last() {
                if last.pc as usize == pc {
                    self.abs_line_info.pop();
                }
            }
        }
        // current_line must revert to the line before the popped entry.
        self.current_line = self.line_for_pc(pc.wrapping_sub(1));
        self.save_line_info(pc, line);
    }

    fn line_for_pc(&self, pc: usize) -> u32 {
        if pc >= self.line_info.len() {
            return 0;
        }
        self.get_line(pc)
    }

    /// Remove the last emitted instruction (used when re-encoding a load).
    pub fn pop_last(&mut self) {
        let pc = self.code.len() - 1;
        self.code.pop();
        let old = self.line_info.pop();
        if old == Some(0) {
            if let Some(last) = self.abs_line_info.last() {
                if last.pc as usize == pc {
                    self.abs_line_info.pop();
                }
            }
        }
        self.current_line = self.line_for_pc(pc.wrapping_sub(1));
    }

    /// Add a constant to the pool, deduplicating. Returns its index.
    pub fn add_constant(&mut self, k: Constant) -> usize {
        for (i, existing) in self.constants.iter().enumerate() {
            if constants_equal(existing, &k) {
                return i;
            }
        }
        let idx = self.constants.len();
        self.constants.push(k);
        idx
    }

    /// Line number for the instruction at `pc`.
    pub fn get_line(&self, pc: usize) -> u32 {
        if pc >= self.line_info.len() {
            return 0;
        }
        // Start from the closest absolute marker at or before pc.
        let (mut line, start) = match self
            .abs_line_info
            .iter()
            .rev()
            .find(|a| a.pc as usize <= pc)
        {
            Some(abs) => (abs.line as i64, abs.pc as usize + 1),
            None => (0, 0),
        };
        for i in start..=pc {
            line += self.line_info[i] as i64;
        }
        line as u32
    }

    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// Mutable access to an instruction for backpatching.
    pub fn get_mut(&mut self, pc: usize) -> &mut Instruction {
        &mut self.code[pc]
    }
}

/// Constant-pool equality. Floats compare by bit pattern so that 0.0 and
/// -0.0 get distinct slots and NaN deduplicates against itself.
fn constants_equal(a: &Constant, b: &Constant) -> bool {
    match (a, b) {
        (Constant::Nil, Constant::Nil) => true,
        (Constant::Boolean(a), Constant::Boolean(b)) => a == b,
        (Constant::Integer(a), Constant::Integer(b)) => a == b,
        (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
        (Constant::String(a), Constant::String(b)) => a == b,
        _ => false,
    }
}
