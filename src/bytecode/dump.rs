//! Binary precompiled-chunk writer.
//!
//! Layout: a 12-byte header (signature, version, format, endianness and
//! the sizes of int / pointer / instruction / number, plus an
//! integral-number flag), then the main function dumped recursively.

use super::proto::FunctionProto;
use crate::value::Value;
use std::io::{self, Write};

/// First bytes of every precompiled chunk; the leading escape byte
/// cannot begin valid source text.
pub const CHUNK_SIGNATURE: &[u8; 4] = b"\x1bMoL";

pub(crate) const VERSION: u8 = 5 << 4 | 1;
pub(crate) const FORMAT: u8 = 0;

pub(crate) fn header() -> [u8; 12] {
    let mut h = [0u8; 12];
    h[..4].copy_from_slice(CHUNK_SIGNATURE);
    h[4] = VERSION;
    h[5] = FORMAT;
    h[6] = 1; // little endian
    h[7] = 4; // int size
    h[8] = std::mem::size_of::<usize>() as u8;
    h[9] = 4; // instruction size
    h[10] = 8; // number size
    h[11] = 0; // numbers are floating point
    h
}

struct DumpState<'a, W: Write> {
    out: &'a mut W,
    strip: bool,
}

impl<W: Write> DumpState<'_, W> {
    fn write_byte(&mut self, b: u8) -> io::Result<()> {
        self.out.write_all(&[b])
    }

    fn write_int(&mut self, i: u32) -> io::Result<()> {
        self.out.write_all(&i.to_le_bytes())
    }

    fn write_number(&mut self, n: f64) -> io::Result<()> {
        self.out.write_all(&n.to_le_bytes())
    }

    fn write_string(&mut self, s: &[u8]) -> io::Result<()> {
        if s.is_empty() {
            return self.out.write_all(&0u64.to_le_bytes());
        }
        self.out.write_all(&(s.len() as u64 + 1).to_le_bytes())?;
        self.out.write_all(s)?;
        self.write_byte(0)
    }

    fn write_code(&mut self, proto: &FunctionProto) -> io::Result<()> {
        self.write_int(proto.code.len() as u32)?;
        for inst in &proto.code {
            self.write_int(*inst)?;
        }
        Ok(())
    }

    fn write_constants(&mut self, proto: &FunctionProto) -> io::Result<()> {
        self.write_int(proto.constants.len() as u32)?;
        for constant in &proto.constants {
            self.write_byte(constant.type_name().tag())?;
            match constant {
                Value::Nil => {}
                Value::Bool(b) => self.write_byte(*b as u8)?,
                Value::Number(n) => self.write_number(*n)?,
                Value::String(s) => self.write_string(s.as_bytes())?,
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{} constant in prototype", other.type_name()),
                    ))
                }
            }
        }
        Ok(())
    }

    fn write_function(&mut self, proto: &FunctionProto) -> io::Result<()> {
        self.write_string(proto.source_name.as_bytes())?;
        self.write_int(proto.line_defined)?;
        self.write_int(proto.last_line_defined)?;
        self.write_byte(proto.num_upvalues)?;
        self.write_byte(proto.num_parameters)?;
        self.write_byte(proto.is_vararg)?;
        self.write_byte(proto.num_used_registers)?;
        self.write_code(proto)?;
        self.write_constants(proto)?;

        self.write_int(proto.protos.len() as u32)?;
        for sub in &proto.protos {
            self.write_function(sub)?;
        }

        if self.strip {
            for _ in 0..4 {
                self.write_int(0)?;
            }
            return Ok(());
        }

        self.write_int(proto.dbg_source_positions.len() as u32)?;
        for line in &proto.dbg_source_positions {
            self.write_int(*line)?;
        }

        self.write_int(proto.dbg_locals.len() as u32)?;
        for local in &proto.dbg_locals {
            self.write_string(local.name.as_bytes())?;
            self.write_int(local.start_pc)?;
            self.write_int(local.end_pc)?;
        }

        self.write_int(proto.dbg_upvalues.len() as u32)?;
        for name in &proto.dbg_upvalues {
            self.write_string(name.as_bytes())?;
        }

        self.write_int(proto.dbg_calls.len() as u32)?;
        for call in &proto.dbg_calls {
            self.write_string(call.name.as_bytes())?;
            self.write_int(call.pc)?;
        }

        Ok(())
    }
}

/// Serializes a prototype into the binary chunk format; `strip` omits
/// the debug tables.
pub fn dump<W: Write>(proto: &FunctionProto, out: &mut W, strip: bool) -> io::Result<()> {
    out.write_all(&header())?;
    DumpState { out, strip }.write_function(proto)
}
