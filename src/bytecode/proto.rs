use super::opcode;
use crate::value::Value;
use std::rc::Rc;

/// `is_vararg` flag: the function receives a legacy `arg` table.
pub const VARARG_HAS_ARG: u8 = 1;
/// `is_vararg` flag: the function accepts `...`.
pub const VARARG_IS_VARARG: u8 = 2;
/// `is_vararg` flag: `arg` must actually be materialized (cleared when
/// the body mentions `...`).
pub const VARARG_NEEDS_ARG: u8 = 4;

/// Live range of a named local, for debug introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbgLocal {
    pub name: String,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// Callee name recorded at a CALL site, keyed by pc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbgCall {
    pub name: String,
    pub pc: u32,
}

/// The immutable result of compiling one function body.
#[derive(Debug, Default)]
pub struct FunctionProto {
    pub source_name: String,
    pub line_defined: u32,
    pub last_line_defined: u32,
    pub num_upvalues: u8,
    pub num_parameters: u8,
    pub is_vararg: u8,
    pub num_used_registers: u8,

    pub code: Vec<u32>,
    /// Literal pool; only Nil/Bool/Number/String ever appear here.
    pub constants: Vec<Value>,
    pub protos: Vec<Rc<FunctionProto>>,

    /// Source line per pc.
    pub dbg_source_positions: Vec<u32>,
    pub dbg_locals: Vec<DbgLocal>,
    pub dbg_upvalues: Vec<String>,
    pub dbg_calls: Vec<DbgCall>,
}

impl FunctionProto {
    pub fn new(source_name: impl Into<String>) -> FunctionProto {
        FunctionProto {
            source_name: source_name.into(),
            ..Default::default()
        }
    }

    pub fn is_vararg_function(&self) -> bool {
        self.is_vararg & VARARG_IS_VARARG != 0
    }

    /// Name of local number `n` (1-based) live at `pc`, if any.
    pub fn local_name(&self, n: usize, pc: u32) -> Option<&str> {
        let mut remaining = n;
        for local in &self.dbg_locals {
            if local.start_pc <= pc && pc <= local.end_pc {
                remaining -= 1;
                if remaining == 0 {
                    return Some(&local.name);
                }
            }
        }
        None
    }

    pub fn source_line(&self, pc: usize) -> u32 {
        self.dbg_source_positions.get(pc).copied().unwrap_or(0)
    }

    /// Code listing of this prototype and its children.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        self.disassemble_into(&mut out, 0);
        out
    }

    fn disassemble_into(&self, out: &mut String, depth: usize) {
        use std::fmt::Write;

        let indent = "  ".repeat(depth);
        let _ = writeln!(
            out,
            "{indent}function <{}:{}> ({} instructions, {} registers, {} upvalues)",
            self.source_name,
            self.line_defined,
            self.code.len(),
            self.num_used_registers,
            self.num_upvalues,
        );
        for (pc, inst) in self.code.iter().enumerate() {
            let _ = writeln!(
                out,
                "{indent}  [{:3}] {} (line {})",
                pc,
                opcode::to_string(*inst),
                self.source_line(pc),
            );
        }
        for proto in &self.protos {
            proto.disassemble_into(out, depth + 1);
        }
    }
}
