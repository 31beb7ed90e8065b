//! 32-bit instruction words.
//!
//! ```text
//!         +---------------------------------------------+
//!         |31-26(6bit)|25-18(8bit)|17-9(9bit)|8-0(9bit) |
//!         |===========+===========+==========+==========|
//!         |  opcode   |     A     |    C     |    B     |
//!         |-----------+-----------+----------+----------|
//!         |  opcode   |     A     |     Bx(unsigned)    |
//!         |-----------+-----------+----------+----------|
//!         |  opcode   |     A     |     sBx(signed)     |
//!         +---------------------------------------------+
//! ```
//!
//! A 9-bit B or C operand with its high bit set addresses the constant
//! pool instead of a register (an RK operand).

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const SIZE_A: u32 = 8;
pub const SIZE_B: u32 = 9;
pub const SIZE_C: u32 = 9;
pub const SIZE_BX: u32 = 18;

pub const MAX_ARG_A: i32 = (1 << SIZE_A) - 1;
pub const MAX_ARG_B: i32 = (1 << SIZE_B) - 1;
pub const MAX_ARG_C: i32 = (1 << SIZE_C) - 1;
pub const MAX_ARG_BX: i32 = (1 << SIZE_BX) - 1;
pub const MAX_ARG_SBX: i32 = MAX_ARG_BX >> 1;

pub const INVALID_INSTRUCTION: u32 = !0u32;

/// High bit of a 9-bit operand: selects constant-pool addressing.
pub const BIT_RK: i32 = 1 << (SIZE_B - 1);
/// Largest constant index an RK operand can carry directly.
pub const MAX_INDEX_RK: i32 = BIT_RK - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum OpCode {
    Move = 0,
    /// MOVE whose C operand counts how many further MOVEs were merged
    /// into one dispatch.
    MoveN,
    LoadK,
    LoadBool,
    LoadNil,
    GetUpval,
    GetGlobal,
    GetTable,
    /// GETTABLE specialized to a constant string key.
    GetTableKs,
    SetGlobal,
    SetUpval,
    SetTable,
    SetTableKs,
    NewTable,
    SelfOp,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Not,
    Len,
    Concat,
    Jmp,
    Eq,
    Lt,
    Le,
    Test,
    TestSet,
    Call,
    TailCall,
    Return,
    ForLoop,
    ForPrep,
    TForLoop,
    SetList,
    Close,
    Closure,
    VarArg,
    Nop,
}

pub const OPCODE_MAX: u8 = OpCode::Nop as u8;

impl OpCode {
    pub fn from_u32(op: u32) -> Option<OpCode> {
        if op > OPCODE_MAX as u32 {
            return None;
        }
        // discriminants are dense from 0
        Some(unsafe { std::mem::transmute::<u8, OpCode>(op as u8) })
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Move => "MOVE",
            OpCode::MoveN => "MOVEN",
            OpCode::LoadK => "LOADK",
            OpCode::LoadBool => "LOADBOOL",
            OpCode::LoadNil => "LOADNIL",
            OpCode::GetUpval => "GETUPVAL",
            OpCode::GetGlobal => "GETGLOBAL",
            OpCode::GetTable => "GETTABLE",
            OpCode::GetTableKs => "GETTABLEKS",
            OpCode::SetGlobal => "SETGLOBAL",
            OpCode::SetUpval => "SETUPVAL",
            OpCode::SetTable => "SETTABLE",
            OpCode::SetTableKs => "SETTABLEKS",
            OpCode::NewTable => "NEWTABLE",
            OpCode::SelfOp => "SELF",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Mod => "MOD",
            OpCode::Pow => "POW",
            OpCode::Unm => "UNM",
            OpCode::Not => "NOT",
            OpCode::Len => "LEN",
            OpCode::Concat => "CONCAT",
            OpCode::Jmp => "JMP",
            OpCode::Eq => "EQ",
            OpCode::Lt => "LT",
            OpCode::Le => "LE",
            OpCode::Test => "TEST",
            OpCode::TestSet => "TESTSET",
            OpCode::Call => "CALL",
            OpCode::TailCall => "TAILCALL",
            OpCode::Return => "RETURN",
            OpCode::ForLoop => "FORLOOP",
            OpCode::ForPrep => "FORPREP",
            OpCode::TForLoop => "TFORLOOP",
            OpCode::SetList => "SETLIST",
            OpCode::Close => "CLOSE",
            OpCode::Closure => "CLOSURE",
            OpCode::VarArg => "VARARG",
            OpCode::Nop => "NOP",
        }
    }
}

#[inline]
pub fn get_opcode(inst: u32) -> u32 {
    inst >> 26
}

#[inline]
pub fn set_opcode(inst: &mut u32, op: OpCode) {
    *inst = (*inst & 0x3ffffff) | ((op as u32) << 26);
}

#[inline]
pub fn get_arg_a(inst: u32) -> i32 {
    ((inst >> 18) & 0xff) as i32
}

#[inline]
pub fn set_arg_a(inst: &mut u32, arg: i32) {
    *inst = (*inst & 0xfc03ffff) | (((arg & 0xff) as u32) << 18);
}

#[inline]
pub fn get_arg_b(inst: u32) -> i32 {
    (inst & 0x1ff) as i32
}

#[inline]
pub fn set_arg_b(inst: &mut u32, arg: i32) {
    *inst = (*inst & 0xfffffe00) | (arg & 0x1ff) as u32;
}

#[inline]
pub fn get_arg_c(inst: u32) -> i32 {
    ((inst >> 9) & 0x1ff) as i32
}

#[inline]
pub fn set_arg_c(inst: &mut u32, arg: i32) {
    *inst = (*inst & 0xfffc01ff) | (((arg & 0x1ff) as u32) << 9);
}

#[inline]
pub fn get_arg_bx(inst: u32) -> i32 {
    (inst & 0x3ffff) as i32
}

#[inline]
pub fn set_arg_bx(inst: &mut u32, arg: i32) {
    *inst = (*inst & 0xfffc0000) | (arg & 0x3ffff) as u32;
}

#[inline]
pub fn get_arg_sbx(inst: u32) -> i32 {
    get_arg_bx(inst) - MAX_ARG_SBX
}

#[inline]
pub fn set_arg_sbx(inst: &mut u32, arg: i32) {
    set_arg_bx(inst, arg + MAX_ARG_SBX);
}

pub fn create_abc(op: OpCode, a: i32, b: i32, c: i32) -> u32 {
    let mut inst = 0u32;
    set_opcode(&mut inst, op);
    set_arg_a(&mut inst, a);
    set_arg_b(&mut inst, b);
    set_arg_c(&mut inst, c);
    inst
}

pub fn create_abx(op: OpCode, a: i32, bx: i32) -> u32 {
    let mut inst = 0u32;
    set_opcode(&mut inst, op);
    set_arg_a(&mut inst, a);
    set_arg_bx(&mut inst, bx);
    inst
}

pub fn create_asbx(op: OpCode, a: i32, sbx: i32) -> u32 {
    let mut inst = 0u32;
    set_opcode(&mut inst, op);
    set_arg_a(&mut inst, a);
    set_arg_sbx(&mut inst, sbx);
    inst
}

#[inline]
pub fn is_k(value: i32) -> bool {
    value & BIT_RK != 0
}

#[inline]
pub fn index_k(value: i32) -> i32 {
    value & !BIT_RK
}

#[inline]
pub fn rk_ask(value: i32) -> i32 {
    value | BIT_RK
}

/// Human-readable rendering of one instruction word.
pub fn to_string(inst: u32) -> String {
    let Some(op) = OpCode::from_u32(get_opcode(inst)) else {
        return String::new();
    };
    let a = get_arg_a(inst);
    let b = get_arg_b(inst);
    let c = get_arg_c(inst);
    let bx = get_arg_bx(inst);
    let sbx = get_arg_sbx(inst);

    let head = match op {
        OpCode::LoadK | OpCode::GetGlobal | OpCode::SetGlobal | OpCode::Closure => {
            format!("{:<10}|  {}, {}", op.name(), a, bx)
        }
        OpCode::Jmp | OpCode::ForLoop | OpCode::ForPrep | OpCode::Nop => {
            format!("{:<10}|  {}, {}", op.name(), a, sbx)
        }
        _ => format!("{:<10}|  {}, {}, {}", op.name(), a, b, c),
    };

    let effect = match op {
        OpCode::Move => format!("R({a}) := R({b})"),
        OpCode::MoveN => format!("R({a}) := R({b}); followed by {c} MOVE ops"),
        OpCode::LoadK => format!("R({a}) := Kst({bx})"),
        OpCode::LoadBool => format!("R({a}) := (Bool){b}; if ({c}) pc++"),
        OpCode::LoadNil => format!("R({a}) := ... := R({b}) := nil"),
        OpCode::GetUpval => format!("R({a}) := UpValue[{b}]"),
        OpCode::GetGlobal => format!("R({a}) := Gbl[Kst({bx})]"),
        OpCode::GetTable => format!("R({a}) := R({b})[RK({c})]"),
        OpCode::GetTableKs => format!("R({a}) := R({b})[RK({c})] ; RK({c}) is constant string"),
        OpCode::SetGlobal => format!("Gbl[Kst({bx})] := R({a})"),
        OpCode::SetUpval => format!("UpValue[{b}] := R({a})"),
        OpCode::SetTable => format!("R({a})[RK({b})] := RK({c})"),
        OpCode::SetTableKs => format!("R({a})[RK({b})] := RK({c}) ; RK({b}) is constant string"),
        OpCode::NewTable => format!("R({a}) := {{}} (size = {b},{c})"),
        OpCode::SelfOp => format!("R({}) := R({b}); R({a}) := R({b})[RK({c})]", a + 1),
        OpCode::Add => format!("R({a}) := RK({b}) + RK({c})"),
        OpCode::Sub => format!("R({a}) := RK({b}) - RK({c})"),
        OpCode::Mul => format!("R({a}) := RK({b}) * RK({c})"),
        OpCode::Div => format!("R({a}) := RK({b}) / RK({c})"),
        OpCode::Mod => format!("R({a}) := RK({b}) % RK({c})"),
        OpCode::Pow => format!("R({a}) := RK({b}) ^ RK({c})"),
        OpCode::Unm => format!("R({a}) := -R({b})"),
        OpCode::Not => format!("R({a}) := not R({b})"),
        OpCode::Len => format!("R({a}) := length of R({b})"),
        OpCode::Concat => format!("R({a}) := R({b}).. ... ..R({c})"),
        OpCode::Jmp => format!("pc+={sbx}"),
        OpCode::Eq => format!("if ((RK({b}) == RK({c})) ~= {a}) then pc++"),
        OpCode::Lt => format!("if ((RK({b}) <  RK({c})) ~= {a}) then pc++"),
        OpCode::Le => format!("if ((RK({b}) <= RK({c})) ~= {a}) then pc++"),
        OpCode::Test => format!("if not (R({a}) <=> {c}) then pc++"),
        OpCode::TestSet => format!("if (R({b}) <=> {c}) then R({a}) := R({b}) else pc++"),
        OpCode::Call => format!("R({a}) ... R({a}+{c}-2) := R({a})(R({a}+1) ... R({a}+{b}-1))"),
        OpCode::TailCall => format!("return R({a})(R({a}+1) ... R({a}+{b}-1))"),
        OpCode::Return => format!("return R({a}) ... R({a}+{b}-2)"),
        OpCode::ForLoop => {
            format!("R({a})+=R({a}+2); if R({a}) <?= R({a}+1) then {{ pc+={sbx}; R({a}+3)=R({a}) }}")
        }
        OpCode::ForPrep => format!("R({a})-=R({a}+2); pc+={sbx}"),
        OpCode::TForLoop => format!(
            "R({a}+3) ... R({a}+3+{c}) := R({a})(R({a}+1) R({a}+2)); if R({a}+3) ~= nil then R({a}+2)=R({a}+3) else pc++"
        ),
        OpCode::SetList => format!("R({a})[({c}-1)*FPF+i] := R({a}+i), 1 <= i <= {b}"),
        OpCode::Close => format!("close all upvalues >= R({a})"),
        OpCode::Closure => format!("R({a}) := closure(KPROTO[{bx}])"),
        OpCode::VarArg => format!("R({a}) ... R({a}+{b}-2) = vararg"),
        OpCode::Nop => String::new(),
    };

    if effect.is_empty() {
        head
    } else {
        format!("{head}; {effect}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_abc_fields() {
        let inst = create_abc(OpCode::SetTable, 3, rk_ask(7), 42);
        assert_eq!(get_opcode(inst), OpCode::SetTable as u32);
        assert_eq!(get_arg_a(inst), 3);
        assert!(is_k(get_arg_b(inst)));
        assert_eq!(index_k(get_arg_b(inst)), 7);
        assert_eq!(get_arg_c(inst), 42);
    }

    #[test]
    fn round_trips_signed_offsets() {
        let mut inst = create_asbx(OpCode::Jmp, 0, -5);
        assert_eq!(get_arg_sbx(inst), -5);
        set_arg_sbx(&mut inst, MAX_ARG_SBX);
        assert_eq!(get_arg_sbx(inst), MAX_ARG_SBX);
        set_arg_sbx(&mut inst, -MAX_ARG_SBX);
        assert_eq!(get_arg_sbx(inst), -MAX_ARG_SBX);
    }

    #[test]
    fn field_mutation_preserves_neighbors() {
        let mut inst = create_abc(OpCode::Call, 1, 2, 3);
        set_arg_b(&mut inst, 200);
        assert_eq!(get_arg_a(inst), 1);
        assert_eq!(get_arg_b(inst), 200);
        assert_eq!(get_arg_c(inst), 3);
        set_opcode(&mut inst, OpCode::TailCall);
        assert_eq!(get_arg_b(inst), 200);
        assert_eq!(get_opcode(inst), OpCode::TailCall as u32);
    }
}
