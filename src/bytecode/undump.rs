//! Binary precompiled-chunk reader, the inverse of [super::dump].

use super::dump::{header, CHUNK_SIGNATURE};
use super::proto::{DbgCall, DbgLocal, FunctionProto};
use crate::value::{TypeName, Value};
use std::io::{self, Read};
use std::rc::Rc;

struct UndumpState<'a, R: Read> {
    input: &'a mut R,
}

impl<R: Read> UndumpState<'_, R> {
    fn read_byte(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.input.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_bool(&mut self) -> io::Result<bool> {
        Ok(self.read_byte()? != 0)
    }

    fn read_int(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.input.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_number(&mut self) -> io::Result<f64> {
        let mut buf = [0u8; 8];
        self.input.read_exact(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }

    fn read_string(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = [0u8; 8];
        self.input.read_exact(&mut buf)?;
        let size = u64::from_le_bytes(buf);
        if size == 0 {
            return Ok(Vec::new());
        }
        let mut bytes = vec![0u8; size as usize];
        self.input.read_exact(&mut bytes)?;
        bytes.pop(); // trailing NUL
        Ok(bytes)
    }

    fn read_code(&mut self) -> io::Result<Vec<u32>> {
        let n = self.read_int()?;
        let mut code = Vec::with_capacity(n as usize);
        for _ in 0..n {
            code.push(self.read_int()?);
        }
        Ok(code)
    }

    fn read_constants(&mut self) -> io::Result<Vec<Value>> {
        let n = self.read_int()?;
        let mut constants = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let tag = self.read_byte()?;
            let value = if tag == TypeName::Nil.tag() {
                Value::Nil
            } else if tag == TypeName::Bool.tag() {
                Value::Bool(self.read_bool()?)
            } else if tag == TypeName::Number.tag() {
                Value::Number(self.read_number()?)
            } else if tag == TypeName::String.tag() {
                Value::string(self.read_string()?)
            } else {
                return Err(invalid(format!("bad constant tag {tag}")));
            };
            constants.push(value);
        }
        Ok(constants)
    }

    fn read_header(&mut self) -> io::Result<()> {
        let mut got = [0u8; 12];
        self.input.read_exact(&mut got)?;
        let expected = header();
        if got == expected {
            return Ok(());
        }
        if &got[..4] != CHUNK_SIGNATURE {
            return Err(invalid("input is not a precompiled chunk"));
        }
        if got[4] != expected[4] || got[5] != expected[5] {
            return Err(invalid("version mismatch"));
        }
        Err(invalid("incompatible precompiled chunk"))
    }

    fn read_function(&mut self) -> io::Result<FunctionProto> {
        let mut proto = FunctionProto::new(String::from_utf8_lossy(&self.read_string()?));
        proto.line_defined = self.read_int()?;
        proto.last_line_defined = self.read_int()?;
        proto.num_upvalues = self.read_byte()?;
        proto.num_parameters = self.read_byte()?;
        proto.is_vararg = self.read_byte()?;
        proto.num_used_registers = self.read_byte()?;
        proto.code = self.read_code()?;
        proto.constants = self.read_constants()?;

        let num_protos = self.read_int()?;
        proto.protos.reserve(num_protos as usize);
        for _ in 0..num_protos {
            proto.protos.push(Rc::new(self.read_function()?));
        }

        let num_lines = self.read_int()?;
        proto.dbg_source_positions.reserve(num_lines as usize);
        for _ in 0..num_lines {
            proto.dbg_source_positions.push(self.read_int()?);
        }

        let num_locals = self.read_int()?;
        proto.dbg_locals.reserve(num_locals as usize);
        for _ in 0..num_locals {
            let name = String::from_utf8_lossy(&self.read_string()?).into_owned();
            let start_pc = self.read_int()?;
            let end_pc = self.read_int()?;
            proto.dbg_locals.push(DbgLocal {
                name,
                start_pc,
                end_pc,
            });
        }

        let num_upvalues = self.read_int()?;
        proto.dbg_upvalues.reserve(num_upvalues as usize);
        for _ in 0..num_upvalues {
            proto
                .dbg_upvalues
                .push(String::from_utf8_lossy(&self.read_string()?).into_owned());
        }

        let num_calls = self.read_int()?;
        proto.dbg_calls.reserve(num_calls as usize);
        for _ in 0..num_calls {
            let name = String::from_utf8_lossy(&self.read_string()?).into_owned();
            let pc = self.read_int()?;
            proto.dbg_calls.push(DbgCall { name, pc });
        }

        Ok(proto)
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Deserializes a precompiled chunk produced by [super::dump].
pub fn undump<R: Read>(input: &mut R) -> io::Result<Rc<FunctionProto>> {
    let mut state = UndumpState { input };
    state.read_header()?;
    Ok(Rc::new(state.read_function()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{create_abc, create_abx, OpCode};

    fn sample_proto() -> FunctionProto {
        let mut proto = FunctionProto::new("sample");
        proto.num_used_registers = 2;
        proto.code = vec![
            create_abx(OpCode::LoadK, 0, 0),
            create_abc(OpCode::Return, 0, 2, 0),
        ];
        proto.constants = vec![
            Value::Number(14.0),
            Value::string("hello"),
            Value::Bool(true),
            Value::Nil,
        ];
        proto.dbg_source_positions = vec![1, 1];
        proto.dbg_upvalues = vec!["x".to_string()];
        proto
    }

    #[test]
    fn round_trips() {
        let mut outer = sample_proto();
        outer.protos.push(Rc::new(sample_proto()));

        let mut buf = Vec::new();
        super::super::dump(&outer, &mut buf, false).unwrap();
        let read = undump(&mut buf.as_slice()).unwrap();

        assert_eq!(read.code, outer.code);
        assert_eq!(read.constants, outer.constants);
        assert_eq!(read.protos.len(), 1);
        assert_eq!(read.protos[0].code, outer.code);
        assert_eq!(read.dbg_upvalues, outer.dbg_upvalues);
        assert_eq!(read.source_name, "sample");
    }

    #[test]
    fn rejects_source_text() {
        let mut input: &[u8] = b"return 1\n and more padding";
        let err = undump(&mut input).unwrap_err();
        assert!(err.to_string().contains("not a precompiled chunk"));
    }
}
