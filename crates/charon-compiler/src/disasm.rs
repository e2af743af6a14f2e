/// Bytecode disassembler, list-style output.
use crate::opcode::{Instruction, InstructionFormat, OpCode};
use crate::proto::{Constant, Proto};
use charon_core::string::StringInterner;
use std::fmt::Write;

/// Disassemble a prototype tree into a human-readable listing.
pub fn disassemble(proto: &Proto, strings: &StringInterner) -> String {
    let mut out = String::new();
    disassemble_proto(&mut out, proto, strings, 0);
    out
}

fn disassemble_proto(out: &mut String, proto: &Proto, strings: &StringInterner, level: usize) {
    let indent = "  ".repeat(level);
    let vararg = if proto.is_vararg { "+" } else { "" };
    let where_ = if proto.line_defined == 0 {
        "main chunk".to_string()
    } else {
        format!("function at line {}", proto.line_defined)
    };
    writeln!(
        out,
        "{indent}{where_} ({}{vararg} params, {} slots, {} upvalues, {} constants, {} functions)",
        proto.num_params,
        proto.max_stack,
        proto.upvalues.len(),
        proto.constants.len(),
        proto.protos.len(),
    )
    .unwrap();

    for (pc, inst) in proto.code.iter().enumerate() {
        let line = proto.get_line(pc);
        let line_str = if line > 0 {
            format!("[{line}]")
        } else {
            "[-]".to_string()
        };
        write!(out, "{indent}\t{}\t{:>5}\t", pc + 1, line_str).unwrap();
        disasm_instruction(out, inst, pc, proto, strings);
        writeln!(out).unwrap();
    }

    if !proto.constants.is_empty() {
        writeln!(out, "{indent}constants ({}):", proto.constants.len()).unwrap();
        for (i, k) in proto.constants.iter().enumerate() {
            write!(out, "{indent}\t{i}\t").unwrap();
            format_constant(out, k, strings);
            writeln!(out).unwrap();
        }
    }

    if !proto.upvalues.is_empty() {
        writeln!(out, "{indent}upvalues ({}):", proto.upvalues.len()).unwrap();
        for (i, up) in proto.upvalues.iter().enumerate() {
            writeln!(
                out,
                "{indent}\t{}\t{}\t{}\t{}",
                i,
                strings.get_str(up.name),
                u8::from(up.in_stack),
                up.index
            )
            .unwrap();
        }
    }

    if !proto.local_vars.is_empty() {
        writeln!(out, "{indent}locals ({}):", proto.local_vars.len()).unwrap();
        for (i, lv) in proto.local_vars.iter().enumerate() {
            writeln!(
                out,
                "{indent}\t{}\t{}\t{}\t{}",
                i,
                strings.get_str(lv.name),
                lv.start_pc + 1,
                lv.end_pc + 1
            )
            .unwrap();
        }
    }

    for p in &proto.protos {
        disassemble_proto(out, p, strings, level + 1);
    }
}

/// Disassemble one instruction, annotating constants and jump targets.
pub fn disasm_instruction(
    out: &mut String,
    inst: &Instruction,
    pc: usize,
    proto: &Proto,
    strings: &StringInterner,
) {
    let op = inst.opcode();
    write!(out, "{:<12}", op.name()).unwrap();

    match op.format() {
        InstructionFormat::IABC => {
            write!(out, "{} {} {}", inst.a(), inst.b(), inst.c()).unwrap();
            if inst.k() {
                write!(out, "k").unwrap();
            }
            let kidx = match op {
                OpCode::GetTabUp | OpCode::GetField | OpCode::SetField | OpCode::Self_ => {
                    Some(inst.c() as usize)
                }
                OpCode::SetTabUp => Some(inst.b() as usize),
                OpCode::EqK => Some(inst.b() as usize),
                _ => None,
            };
            if let Some(idx) = kidx {
                if idx < proto.constants.len() {
                    write!(out, "\t; ").unwrap();
                    format_constant(out, &proto.constants[idx], strings);
                }
            }
        }
        InstructionFormat::IABx => {
            write!(out, "{} {}", inst.a(), inst.bx()).unwrap();
            match op {
                OpCode::LoadK => {
                    let idx = inst.bx() as usize;
                    if idx < proto.constants.len() {
                        write!(out, "\t; ").unwrap();
                        format_constant(out, &proto.constants[idx], strings);
                    }
                }
                OpCode::Closure => {
                    write!(out, "\t; function [{}]", inst.bx()).unwrap();
                }
                OpCode::ForPrep | OpCode::TForPrep => {
                    write!(out, "\t; to {}", pc + 2 + inst.bx() as usize).unwrap();
                }
                OpCode::ForLoop | OpCode::TForLoop => {
                    write!(out, "\t; back to {}", pc + 2 - inst.bx() as usize).unwrap();
                }
                _ => {}
            }
        }
        InstructionFormat::IAsBx => {
            write!(out, "{} {}", inst.a(), inst.sbx()).unwrap();
        }
        InstructionFormat::IAx => {
            write!(out, "{}", inst.ax_field()).unwrap();
        }
        InstructionFormat::IsJ => {
            let sj = inst.get_sj();
            // pc is 0-based here; the listing is 1-based.
            write!(out, "{sj}\t; to {}", pc as i64 + 2 + sj as i64).unwrap();
        }
    }
}

fn format_constant(out: &mut String, k: &Constant, strings: &StringInterner) {
    match k {
        Constant::Nil => write!(out, "nil").unwrap(),
        Constant::Boolean(b) => write!(out, "{b}").unwrap(),
        Constant::Integer(i) => write!(out, "{i}").unwrap(),
        Constant::Float(f) => write!(out, "{f}").unwrap(),
        Constant::String(id) => {
            let bytes = strings.get_bytes(*id);
            if let Ok(s) = std::str::from_utf8(bytes) {
                write!(out, "\"{s}\"").unwrap();
            } else {
                write!(out, "<binary>").unwrap();
            }
        }
    }
}
