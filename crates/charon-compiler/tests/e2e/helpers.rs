use charon_compiler::compiler::{compile, Chunk};
use charon_compiler::diag::CompileError;
use charon_compiler::opcode::OpCode;
use charon_compiler::proto::{Constant, Proto};
use charon_core::string::StringInterner;

/// Compile a source string, panicking on error.
pub fn compile_str(source: &str) -> Chunk {
    compile(source.as_bytes(), "test").unwrap_or_else(|e| {
        panic!("compile failed: {e}\nsource:\n{source}");
    })
}

/// Compile a source string and expect an error.
pub fn compile_str_err(source: &str) -> CompileError {
    match compile(source.as_bytes(), "test") {
        Err(e) => e,
        Ok(_) => panic!("expected compile error, got success\nsource:\n{source}"),
    }
}

pub fn has_opcode(proto: &Proto, op: OpCode) -> bool {
    proto.code.iter().any(|i| i.opcode() == op)
}

pub fn count_opcode(proto: &Proto, op: OpCode) -> usize {
    proto.code.iter().filter(|i| i.opcode() == op).count()
}

#[allow(dead_code)]
pub fn find_opcode(proto: &Proto, op: OpCode) -> Option<usize> {
    proto.code.iter().position(|i| i.opcode() == op)
}

/// True if the constant pool holds the given integer.
#[allow(dead_code)]
pub fn has_int_constant(proto: &Proto, value: i64) -> bool {
    proto
        .constants
        .iter()
        .any(|k| matches!(k, Constant::Integer(i) if *i == value))
}

/// True if the constant pool holds the given string.
#[allow(dead_code)]
pub fn has_string_constant(proto: &Proto, strings: &StringInterner, value: &str) -> bool {
    proto
        .constants
        .iter()
        .any(|k| matches!(k, Constant::String(id) if strings.get_bytes(*id) == value.as_bytes()))
}
