pub mod ast;
mod codegen;
mod lexer;
mod lua_lexer;
mod parser;
mod token;

pub use codegen::compile;
pub use lexer::{LexError, Lexer};
pub use lua_lexer::{LuaLexer, TokenLabel};
pub use parser::{parse, Parser};
pub use token::{line_and_col, Token};

use crate::bytecode::FunctionProto;
use crate::errors::CompileError;
use std::rc::Rc;

/// Parses and compiles `source` in one step.
pub fn compile_source(source: &str, name: &str) -> Result<Rc<FunctionProto>, CompileError> {
    let chunk = parse(source, name)?;
    let proto = compile(&chunk, name)?;
    tracing::debug!(
        chunk = name,
        instructions = proto.code.len(),
        constants = proto.constants.len(),
        "compiled chunk"
    );
    Ok(proto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{self as bc, OpCode};
    use crate::value::Value;

    fn opcodes(proto: &FunctionProto) -> Vec<OpCode> {
        proto
            .code
            .iter()
            .map(|inst| OpCode::from_u32(bc::get_opcode(*inst)).unwrap())
            .collect()
    }

    #[test]
    fn folds_constant_arithmetic() {
        let proto = compile_source("return 2+3*4", "fold").unwrap();
        // one load of the folded 14, one return
        assert_eq!(opcodes(&proto), vec![OpCode::LoadK, OpCode::Return, OpCode::Return]);
        let k = bc::get_arg_bx(proto.code[0]) as usize;
        assert_eq!(proto.constants[k], Value::Number(14.0));
    }

    #[test]
    fn folds_lua_modulo() {
        let proto = compile_source("return -1 % 3", "fold").unwrap();
        let k = bc::get_arg_bx(proto.code[0]) as usize;
        assert_eq!(proto.constants[k], Value::Number(2.0));
    }

    #[test]
    fn rewrites_returned_call_to_tailcall() {
        let proto = compile_source("local function f() end return f()", "tail").unwrap();
        assert!(opcodes(&proto).contains(&OpCode::TailCall));
    }

    #[test]
    fn collapses_move_runs() {
        let proto = compile_source(
            "local a, b, c = 1, 2, 3\nlocal x, y, z = a, b, c\nreturn x",
            "moven",
        )
        .unwrap();
        assert!(opcodes(&proto).contains(&OpCode::MoveN));
    }

    #[test]
    fn emits_closure_capture_pseudo_instructions() {
        let proto = compile_source(
            "local i = 0\nreturn function() i = i + 1 return i end",
            "capture",
        )
        .unwrap();
        let ops = opcodes(&proto);
        let closure_at = ops.iter().position(|op| *op == OpCode::Closure).unwrap();
        // the capture of local `i` follows as a MOVE pseudo-instruction
        assert_eq!(ops[closure_at + 1], OpCode::Move);
        assert_eq!(proto.protos.len(), 1);
        assert_eq!(proto.protos[0].num_upvalues, 1);
        assert_eq!(proto.protos[0].dbg_upvalues, vec!["i".to_string()]);
    }

    #[test]
    fn numeric_for_shape() {
        let proto = compile_source("local s = 0 for i = 1, 10 do s = s + i end return s", "for")
            .unwrap();
        let ops = opcodes(&proto);
        assert!(ops.contains(&OpCode::ForPrep));
        assert!(ops.contains(&OpCode::ForLoop));
    }

    #[test]
    fn rejects_break_outside_loop() {
        let err = compile_source("break", "bad").unwrap_err();
        assert!(err.message.contains("no loop to break"));
    }

    #[test]
    fn rejects_vararg_outside_vararg_function() {
        let err = compile_source("local f = function() return ... end", "bad").unwrap_err();
        assert!(err.message.contains("outside a vararg function"));
    }

    #[test]
    fn method_definitions_add_self() {
        let proto = compile_source("local t = {} function t:m(x) return self, x end", "method")
            .unwrap();
        assert_eq!(proto.protos[0].num_parameters, 2);
    }

    #[test]
    fn line_numbers_cover_every_instruction() {
        let proto = compile_source("local a = 1\nlocal b = 2\nreturn a + b", "lines").unwrap();
        assert_eq!(proto.code.len(), proto.dbg_source_positions.len());
        assert!(proto.dbg_source_positions.iter().all(|l| *l <= 3));
    }
}
