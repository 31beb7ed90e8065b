//! Single-pass code generator: one traversal of the syntax tree emits
//! register-allocated bytecode per function, with constant folding, a
//! trailing-instruction rewind that turns LOADK/MOVE results into RK
//! operands, label-based jump resolution and a small peephole pass.

use super::ast::*;
use crate::bytecode::{
    self as bc, DbgCall, DbgLocal, FunctionProto, OpCode, VARARG_HAS_ARG, VARARG_IS_VARARG,
    VARARG_NEEDS_ARG,
};
use crate::errors::CompileError;
use crate::value::{parse_number, Value};
use crate::{FastHashMap, COMPAT_VARARG, FIELDS_PER_FLUSH};
use std::rc::Rc;

const MAX_REGISTERS: i32 = 200;
const REG_NOT_DEFINED: i32 = bc::MAX_ARG_A + 1;
const LABEL_NO_JUMP: usize = 0;

type Result<T> = std::result::Result<T, CompileError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EcType {
    Global,
    Upvalue,
    Local,
    Table,
    Vararg,
    Method,
    None,
}

/// Destination context threaded through expression compilation.
/// `varargopt` ≥ 0 requests that many extra results, −1 discards all
/// results and −2 keeps every result.
#[derive(Debug, Clone, Copy)]
struct ExprContext {
    typ: EcType,
    reg: i32,
    varargopt: i32,
}

fn ec_none(varargopt: i32) -> ExprContext {
    ExprContext {
        typ: EcType::None,
        reg: REG_NOT_DEFINED,
        varargopt,
    }
}

fn ec(typ: EcType, reg: i32, varargopt: i32) -> ExprContext {
    ExprContext {
        typ,
        reg,
        varargopt,
    }
}

fn save_reg(ec: &ExprContext, reg: i32) -> i32 {
    if ec.typ != EcType::Local || ec.reg == REG_NOT_DEFINED {
        reg
    } else {
        ec.reg
    }
}

struct AssignContext {
    ec: ExprContext,
    keyrk: i32,
    valuerk: i32,
    keyks: bool,
    needmove: bool,
}

/// Labels for lowering logical expressions to at most two LOADBOOLs:
/// true target, false target, end, and whether a materialization is
/// needed at all.
struct LbLabels {
    t: usize,
    f: usize,
    e: usize,
    b: bool,
}

fn is_vararg_return_expr(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::FuncCall(call) => !call.adjust_ret,
        ExprKind::Vararg => true,
        _ => false,
    }
}

fn lua_modulo(lhs: f64, rhs: f64) -> f64 {
    let v = lhs % rhs;
    if (lhs < 0.0 || rhs < 0.0) && !(lhs < 0.0 && rhs < 0.0) {
        v + rhs
    } else {
        v
    }
}

/// Evaluates a numeric-literal subtree, or bails out at the first
/// non-constant node.
fn const_fold(expr: &Expr) -> Option<f64> {
    match &expr.kind {
        ExprKind::Number(text) => Some(parse_number(text).unwrap_or(f64::NAN)),
        ExprKind::Unary {
            op: UnaryOp::Minus,
            expr,
        } => const_fold(expr).map(|v| -v),
        ExprKind::Arith { op, lhs, rhs } => {
            let l = const_fold(lhs)?;
            let r = const_fold(rhs)?;
            Some(match op {
                ArithOp::Add => l + r,
                ArithOp::Sub => l - r,
                ArithOp::Mul => l * r,
                ArithOp::Div => l / r,
                ArithOp::Mod => lua_modulo(l, r),
                ArithOp::Pow => l.powf(r),
            })
        }
        _ => None,
    }
}

// "floating point byte" encoding used for table size hints
fn int_to_fb(val: i32) -> i32 {
    let mut e = 0;
    let mut x = val;
    while x >= 16 {
        x = (x + 1) >> 1;
        e += 1;
    }
    if x < 8 {
        x
    } else {
        ((e + 1) << 3) | (x - 8)
    }
}

struct CodeStore {
    codes: Vec<u32>,
    lines: Vec<u32>,
    pc: usize,
}

impl CodeStore {
    fn new() -> CodeStore {
        CodeStore {
            codes: Vec::with_capacity(128),
            lines: Vec::with_capacity(128),
            pc: 0,
        }
    }

    fn add(&mut self, inst: u32, line: u32) {
        if self.pc == self.codes.len() {
            self.codes.push(inst);
            self.lines.push(line);
        } else {
            self.codes[self.pc] = inst;
            self.lines[self.pc] = line;
        }
        self.pc += 1;
    }

    fn add_abc(&mut self, op: OpCode, a: i32, b: i32, c: i32, line: u32) {
        self.add(bc::create_abc(op, a, b, c), line);
    }

    fn add_abx(&mut self, op: OpCode, a: i32, bx: i32, line: u32) {
        self.add(bc::create_abx(op, a, bx), line);
    }

    fn add_asbx(&mut self, op: OpCode, a: i32, sbx: i32, line: u32) {
        self.add(bc::create_asbx(op, a, sbx), line);
    }

    /// Rewinds a trailing LOADK into an RK operand or a trailing MOVE
    /// into its source register; otherwise claims a fresh register.
    fn propagate_kmv(&mut self, top: i32, save: &mut i32, reg: &mut i32, inc: i32) {
        let last = self.last();
        if bc::get_arg_a(last) >= top {
            match OpCode::from_u32(bc::get_opcode(last)) {
                Some(OpCode::LoadK) => {
                    let cindex = bc::get_arg_bx(last);
                    if cindex <= bc::MAX_INDEX_RK {
                        self.pop();
                        *save = bc::rk_ask(cindex);
                        return;
                    }
                }
                Some(OpCode::Move) => {
                    self.pop();
                    *save = bc::get_arg_b(last);
                    return;
                }
                _ => {}
            }
        }
        *save = *reg;
        *reg += inc;
    }

    fn propagate_mv(&mut self, top: i32, save: &mut i32, reg: &mut i32, inc: i32) {
        let last = self.last();
        if bc::get_arg_a(last) >= top {
            if let Some(OpCode::Move) = OpCode::from_u32(bc::get_opcode(last)) {
                self.pop();
                *save = bc::get_arg_b(last);
                return;
            }
        }
        *save = *reg;
        *reg += inc;
    }

    fn set_opcode(&mut self, pc: usize, op: OpCode) {
        bc::set_opcode(&mut self.codes[pc], op);
    }

    fn set_b(&mut self, pc: usize, v: i32) {
        bc::set_arg_b(&mut self.codes[pc], v);
    }

    fn set_c(&mut self, pc: usize, v: i32) {
        bc::set_arg_c(&mut self.codes[pc], v);
    }

    fn set_sbx(&mut self, pc: usize, v: i32) {
        bc::set_arg_sbx(&mut self.codes[pc], v);
    }

    fn at(&self, pc: usize) -> u32 {
        self.codes[pc]
    }

    fn last_pc(&self) -> i32 {
        self.pc as i32 - 1
    }

    fn last(&self) -> u32 {
        if self.pc == 0 {
            bc::INVALID_INSTRUCTION
        } else {
            self.codes[self.pc - 1]
        }
    }

    fn pop(&mut self) {
        self.pc -= 1;
    }

    fn into_lists(mut self) -> (Vec<u32>, Vec<u32>) {
        self.codes.truncate(self.pc);
        self.lines.truncate(self.pc);
        (self.codes, self.lines)
    }
}

struct VarNamePool {
    names: Vec<String>,
    offset: i32,
}

impl VarNamePool {
    fn new(offset: i32) -> VarNamePool {
        VarNamePool {
            names: Vec::new(),
            offset,
        }
    }

    fn last_index(&self) -> i32 {
        self.offset + self.names.len() as i32
    }

    fn find(&self, name: &str) -> i32 {
        for (i, n) in self.names.iter().enumerate().rev() {
            if n == name {
                return i as i32 + self.offset;
            }
        }
        -1
    }

    fn register(&mut self, name: &str) -> i32 {
        self.names.push(name.to_string());
        self.names.len() as i32 - 1 + self.offset
    }

    fn register_unique(&mut self, name: &str) -> i32 {
        let index = self.find(name);
        if index < 0 {
            self.register(name)
        } else {
            index
        }
    }
}

struct CodeBlock {
    local_vars: VarNamePool,
    /// Indices into `proto.dbg_locals` for this block's registrations.
    dbg_indices: Vec<usize>,
    break_label: usize,
    ref_upvalue: bool,
    line_start: u32,
    last_line: u32,
}

impl CodeBlock {
    fn new(local_vars: VarNamePool, break_label: usize, line_start: u32, last_line: u32) -> CodeBlock {
        CodeBlock {
            local_vars,
            dbg_indices: Vec::new(),
            break_label,
            ref_upvalue: false,
            line_start,
            last_line,
        }
    }
}

/// Per-function compilation state.
struct FuncContext {
    proto: FunctionProto,
    code: CodeStore,
    upvalues: VarNamePool,
    blocks: Vec<CodeBlock>,
    reg_top: i32,
    label_id: usize,
    label_pc: FastHashMap<usize, i32>,
}

impl FuncContext {
    fn new(source_name: &str) -> FuncContext {
        FuncContext {
            proto: FunctionProto::new(source_name),
            code: CodeStore::new(),
            upvalues: VarNamePool::new(0),
            blocks: vec![CodeBlock::new(VarNamePool::new(0), LABEL_NO_JUMP, 0, 0)],
            reg_top: 0,
            label_id: 1,
            label_pc: FastHashMap::default(),
        }
    }

    fn error(&self, line: u32, message: impl Into<String>) -> CompileError {
        CompileError::new(self.proto.source_name.clone(), line, message)
    }

    fn new_label(&mut self) -> usize {
        let id = self.label_id;
        self.label_id += 1;
        id
    }

    fn set_label_pc(&mut self, label: usize, pc: i32) {
        self.label_pc.insert(label, pc);
    }

    fn get_label_pc(&self, label: usize) -> i32 {
        self.label_pc.get(&label).copied().unwrap_or(0)
    }

    fn const_index(&mut self, value: &Value) -> Result<i32> {
        let typ = value.type_name();
        for (i, constant) in self.proto.constants.iter().enumerate() {
            if constant.type_name() == typ && constant.raw_equals(value) {
                return Ok(i as i32);
            }
        }
        self.proto.constants.push(value.clone());
        let index = self.proto.constants.len() as i32 - 1;
        if index > bc::MAX_ARG_BX {
            return Err(self.error(self.proto.line_defined, "too many constants"));
        }
        Ok(index)
    }

    fn register_local_var(&mut self, name: &str) -> Result<i32> {
        let start_pc = (self.code.last_pc() + 1) as u32;
        let block = self.blocks.last_mut().unwrap();
        let index = block.local_vars.register(name);
        block.dbg_indices.push(self.proto.dbg_locals.len());
        self.proto.dbg_locals.push(DbgLocal {
            name: name.to_string(),
            start_pc,
            end_pc: 0,
        });
        self.set_reg_top(self.reg_top + 1)?;
        Ok(index)
    }

    /// Register index and block position of a named local, innermost
    /// block first.
    fn find_local_var_and_block(&self, name: &str) -> Option<(i32, usize)> {
        for (i, block) in self.blocks.iter().enumerate().rev() {
            let index = block.local_vars.find(name);
            if index > -1 {
                return Some((index, i));
            }
        }
        None
    }

    fn find_local_var(&self, name: &str) -> i32 {
        self.find_local_var_and_block(name)
            .map(|(index, _)| index)
            .unwrap_or(-1)
    }

    fn enter_block(&mut self, break_label: usize, line_start: u32, last_line: u32) {
        let pool = VarNamePool::new(self.reg_top);
        self.blocks
            .push(CodeBlock::new(pool, break_label, line_start, last_line));
    }

    /// Emits a CLOSE for the current block when any of its locals was
    /// captured; returns the closed base register or −1.
    fn close_upvalues(&mut self) -> i32 {
        let block = self.blocks.last().unwrap();
        if block.ref_upvalue {
            let n = self.blocks[self.blocks.len() - 2].local_vars.last_index();
            let last_line = block.last_line;
            self.code.add_abc(OpCode::Close, n, 0, 0, last_line);
            n
        } else {
            -1
        }
    }

    fn leave_block(&mut self) -> Result<i32> {
        let closed = self.close_upvalues();
        self.end_scope();
        self.blocks.pop();
        self.set_reg_top(self.blocks.last().unwrap().local_vars.last_index())?;
        Ok(closed)
    }

    fn end_scope(&mut self) {
        let end_pc = self.code.last_pc().max(0) as u32;
        let block = self.blocks.last().unwrap();
        for &idx in &block.dbg_indices {
            self.proto.dbg_locals[idx].end_pc = end_pc;
        }
    }

    fn set_reg_top(&mut self, top: i32) -> Result<()> {
        if top > MAX_REGISTERS {
            return Err(self.error(self.proto.line_defined, "too many local variables"));
        }
        self.reg_top = top;
        Ok(())
    }
}

pub struct Compiler {
    contexts: Vec<FuncContext>,
    source_name: String,
}

impl Compiler {
    #[inline]
    fn fc(&mut self) -> &mut FuncContext {
        self.contexts.last_mut().unwrap()
    }

    #[inline]
    fn fcr(&self) -> &FuncContext {
        self.contexts.last().unwrap()
    }

    fn err(&self, line: u32, message: impl Into<String>) -> CompileError {
        CompileError::new(self.source_name.clone(), line, message)
    }

    fn ident_ref_type(&self, name: &str) -> EcType {
        for (i, fc) in self.contexts.iter().enumerate().rev() {
            if fc.find_local_var(name) > -1 {
                if i == self.contexts.len() - 1 {
                    return EcType::Local;
                }
                return EcType::Upvalue;
            }
        }
        EcType::Global
    }

    fn compile_chunk(&mut self, chunk: &[Stmt]) -> Result<()> {
        for stmt in chunk {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_block(&mut self, chunk: &[Stmt]) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let line_start = chunk[0].line;
        let last_line = chunk[chunk.len() - 1].last_line;
        self.fc().enter_block(LABEL_NO_JUMP, line_start, last_line);
        for stmt in chunk {
            self.compile_stmt(stmt)?;
        }
        self.fc().leave_block()?;
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match &stmt.kind {
            StmtKind::Assign { .. } => self.compile_assign_stmt(stmt),
            StmtKind::LocalAssign { .. } => self.compile_local_assign_stmt(stmt),
            StmtKind::FuncCall(expr) => {
                let reg = self.fcr().reg_top;
                let ExprKind::FuncCall(call) = &expr.kind else {
                    unreachable!()
                };
                self.compile_func_call_expr(reg, expr, call, &ec_none(-1))?;
                Ok(())
            }
            StmtKind::DoBlock(body) => {
                self.fc()
                    .enter_block(LABEL_NO_JUMP, stmt.line, stmt.last_line);
                self.compile_chunk(body)?;
                self.fc().leave_block()?;
                Ok(())
            }
            StmtKind::While { .. } => self.compile_while_stmt(stmt),
            StmtKind::Repeat { .. } => self.compile_repeat_stmt(stmt),
            StmtKind::FuncDef { .. } => self.compile_func_def_stmt(stmt),
            StmtKind::Return(_) => self.compile_return_stmt(stmt),
            StmtKind::If { .. } => self.compile_if_stmt(stmt),
            StmtKind::Break => self.compile_break_stmt(stmt),
            StmtKind::NumberFor { .. } => self.compile_number_for_stmt(stmt),
            StmtKind::GenericFor { .. } => self.compile_generic_for_stmt(stmt),
        }
    }

    fn compile_assign_stmt_left(
        &mut self,
        lhs: &[Expr],
    ) -> Result<(i32, Vec<AssignContext>)> {
        let mut reg = self.fcr().reg_top;
        let mut acs = Vec::with_capacity(lhs.len());
        for (i, target) in lhs.iter().enumerate() {
            let is_last = i == lhs.len() - 1;
            match &target.kind {
                ExprKind::Ident(name) => {
                    let ident_type = self.ident_ref_type(name);
                    let mut ec = ec(ident_type, REG_NOT_DEFINED, 0);
                    match ident_type {
                        EcType::Global => {
                            self.fc().const_index(&Value::string(name.as_str()))?;
                        }
                        EcType::Upvalue => {
                            self.fc().upvalues.register_unique(name);
                        }
                        EcType::Local => {
                            if is_last {
                                ec.reg = self.fcr().find_local_var(name);
                            }
                        }
                        _ => unreachable!(),
                    }
                    acs.push(AssignContext {
                        ec,
                        keyrk: 0,
                        valuerk: 0,
                        keyks: false,
                        needmove: false,
                    });
                }
                ExprKind::AttrGet { object, key } => {
                    let mut ac = AssignContext {
                        ec: ec(EcType::Table, REG_NOT_DEFINED, 0),
                        keyrk: 0,
                        valuerk: 0,
                        keyks: matches!(key.kind, ExprKind::String(_)),
                        needmove: false,
                    };
                    let mut obj_reg = 0;
                    self.compile_expr_with_kmv_propagation(object, &mut reg, &mut obj_reg)?;
                    ac.ec.reg = obj_reg;
                    let mut keyrk = 0;
                    self.compile_expr_with_kmv_propagation(key, &mut reg, &mut keyrk)?;
                    ac.keyrk = keyrk;
                    acs.push(ac);
                }
                _ => return Err(self.err(target.line, "invalid left expression in assignment")),
            }
        }
        Ok((reg, acs))
    }

    fn compile_assign_stmt_right(
        &mut self,
        lhs: &[Expr],
        rhs: &[Expr],
        mut reg: i32,
        acs: &mut [AssignContext],
    ) -> Result<i32> {
        let lennames = lhs.len();
        let lenexprs = rhs.len();
        let mut namesassigned = 0usize;

        while namesassigned < lennames {
            if namesassigned < lenexprs
                && is_vararg_return_expr(&rhs[namesassigned])
                && lenexprs - namesassigned - 1 == 0
            {
                // a trailing multi-value producer fills every remaining
                // target
                let varargopt = lennames as i32 - namesassigned as i32 - 1;
                let regstart = reg;
                let reginc =
                    self.compile_expr(reg, &rhs[namesassigned], &ec_none(varargopt))?;
                reg += reginc;
                for i in namesassigned..namesassigned + reginc as usize {
                    if i >= acs.len() {
                        break;
                    }
                    acs[i].needmove = true;
                    if acs[i].ec.typ == EcType::Table {
                        acs[i].valuerk = regstart + (i - namesassigned) as i32;
                    }
                }
                namesassigned = lennames;
                continue;
            }

            let nil_expr;
            let expr = if namesassigned >= lenexprs {
                nil_expr = Expr {
                    kind: ExprKind::Nil,
                    line: lhs[namesassigned].line,
                    last_line: lhs[namesassigned].last_line,
                };
                &nil_expr
            } else {
                &rhs[namesassigned]
            };

            let idx = reg;
            let ac_ec = acs[namesassigned].ec;
            let reginc = self.compile_expr(reg, expr, &ac_ec)?;
            if ac_ec.typ == EcType::Table {
                if !matches!(expr.kind, ExprKind::Logical { .. }) {
                    let top = self.fcr().reg_top;
                    let mut save = 0;
                    self.fc().code.propagate_kmv(top, &mut save, &mut reg, reginc);
                    acs[namesassigned].valuerk = save;
                } else {
                    acs[namesassigned].valuerk = idx;
                    reg += reginc;
                }
            } else {
                acs[namesassigned].needmove = reginc != 0;
                reg += reginc;
            }
            namesassigned += 1;
        }

        let rightreg = reg - 1;

        // extra right-hand expressions are evaluated for effect only
        for (i, expr) in rhs.iter().enumerate().skip(namesassigned) {
            let varargopt = if i != lenexprs - 1 { 0 } else { -1 };
            reg += self.compile_expr(reg, expr, &ec_none(varargopt))?;
        }
        Ok(rightreg)
    }

    fn compile_assign_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        let StmtKind::Assign { lhs, rhs } = &stmt.kind else {
            unreachable!()
        };
        let (reg, mut acs) = self.compile_assign_stmt_left(lhs)?;
        let mut reg = self.compile_assign_stmt_right(lhs, rhs, reg, &mut acs)?;

        for (i, target) in lhs.iter().enumerate().rev() {
            match acs[i].ec.typ {
                EcType::Local => {
                    if acs[i].needmove {
                        let ExprKind::Ident(name) = &target.kind else {
                            unreachable!()
                        };
                        let a = self.fcr().find_local_var(name);
                        self.fc().code.add_abc(OpCode::Move, a, reg, 0, target.line);
                        reg -= 1;
                    }
                }
                EcType::Global => {
                    let ExprKind::Ident(name) = &target.kind else {
                        unreachable!()
                    };
                    let cindex = self.fc().const_index(&Value::string(name.as_str()))?;
                    self.fc()
                        .code
                        .add_abx(OpCode::SetGlobal, reg, cindex, target.line);
                    reg -= 1;
                }
                EcType::Upvalue => {
                    let ExprKind::Ident(name) = &target.kind else {
                        unreachable!()
                    };
                    let upvalue_idx = self.fc().upvalues.register_unique(name);
                    self.fc()
                        .code
                        .add_abc(OpCode::SetUpval, reg, upvalue_idx, 0, target.line);
                    reg -= 1;
                }
                EcType::Table => {
                    let opcode = if acs[i].keyks {
                        OpCode::SetTableKs
                    } else {
                        OpCode::SetTable
                    };
                    let (a, b, c) = (acs[i].ec.reg, acs[i].keyrk, acs[i].valuerk);
                    self.fc().code.add_abc(opcode, a, b, c, target.line);
                    if !bc::is_k(acs[i].valuerk) {
                        reg -= 1;
                    }
                }
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    /// Assigns `exprs` into consecutive registers starting at `reg`,
    /// padding missing values with nil, as local declarations and for
    /// headers do.
    fn compile_reg_assignment(
        &mut self,
        names: &[String],
        exprs: &[Expr],
        mut reg: i32,
        nvars: i32,
        line: u32,
    ) -> Result<()> {
        let lennames = names.len();
        let lenexprs = exprs.len();
        let mut namesassigned = 0usize;

        while namesassigned < lennames && namesassigned < lenexprs {
            if is_vararg_return_expr(&exprs[namesassigned])
                && lenexprs - namesassigned - 1 == 0
            {
                let varargopt = nvars - namesassigned as i32;
                let context = ec(EcType::Vararg, reg, varargopt - 1);
                self.compile_expr(reg, &exprs[namesassigned], &context)?;
                reg += varargopt;
                namesassigned = lennames;
            } else {
                let context = ec(EcType::Local, reg, 0);
                self.compile_expr(reg, &exprs[namesassigned], &context)?;
                reg += 1;
                namesassigned += 1;
            }
        }

        // extra left names become nil
        if lennames > namesassigned {
            let restleft = lennames as i32 - namesassigned as i32 - 1;
            self.fc()
                .code
                .add_abc(OpCode::LoadNil, reg, reg + restleft, 0, line);
            reg += restleft;
        }

        // extra right expressions are evaluated for effect only
        for (i, expr) in exprs.iter().enumerate().skip(namesassigned) {
            let varargopt = if i != lenexprs - 1 { 0 } else { -1 };
            let context = ec(EcType::None, reg, varargopt);
            reg += self.compile_expr(reg, expr, &context)?;
        }
        Ok(())
    }

    fn compile_local_assign_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        let StmtKind::LocalAssign { names, exprs } = &stmt.kind else {
            unreachable!()
        };
        let reg = self.fcr().reg_top;
        if names.len() == 1 && exprs.len() == 1 {
            if let ExprKind::Function(_) = exprs[0].kind {
                // the local is in scope inside its own body, so the
                // function can recurse through it
                self.fc().register_local_var(&names[0])?;
                return self.compile_reg_assignment(names, exprs, reg, names.len() as i32, stmt.line);
            }
        }

        self.compile_reg_assignment(names, exprs, reg, names.len() as i32, stmt.line)?;
        for name in names {
            self.fc().register_local_var(name)?;
        }
        Ok(())
    }

    fn compile_return_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        let StmtKind::Return(exprs) = &stmt.kind else {
            unreachable!()
        };
        let lenexprs = exprs.len();
        let mut reg = self.fcr().reg_top;
        let a = reg;
        let mut lastisvararg = false;

        if lenexprs == 1 {
            match &exprs[0].kind {
                ExprKind::Ident(name) => {
                    let idx = self.fcr().find_local_var(name);
                    if idx > -1 {
                        self.fc().code.add_abc(OpCode::Return, idx, 2, 0, stmt.line);
                        return Ok(());
                    }
                }
                ExprKind::FuncCall(call) if !call.adjust_ret => {
                    reg += self.compile_expr(reg, &exprs[0], &ec_none(-2))?;
                    let last_pc = self.fcr().code.last_pc() as usize;
                    self.fc().code.set_opcode(last_pc, OpCode::TailCall);
                    self.fc().code.add_abc(OpCode::Return, a, 0, 0, stmt.line);
                    return Ok(());
                }
                _ => {}
            }
        }

        for (i, expr) in exprs.iter().enumerate() {
            if i == lenexprs - 1 && is_vararg_return_expr(expr) {
                self.compile_expr(reg, expr, &ec_none(-2))?;
                lastisvararg = true;
            } else {
                reg += self.compile_expr(reg, expr, &ec_none(0))?;
            }
        }
        let count = if lastisvararg { 0 } else { reg - a + 1 };
        self.fc().code.add_abc(OpCode::Return, a, count, 0, stmt.line);
        Ok(())
    }

    fn compile_if_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        let StmtKind::If {
            condition,
            then,
            els,
        } = &stmt.kind
        else {
            unreachable!()
        };
        let thenlabel = self.fc().new_label();
        let elselabel = self.fc().new_label();
        let endlabel = self.fc().new_label();

        let reg = self.fcr().reg_top;
        self.compile_branch_condition(reg, condition, thenlabel, elselabel, false)?;
        let pc = self.fcr().code.last_pc();
        self.fc().set_label_pc(thenlabel, pc);
        self.compile_block(then)?;
        if !els.is_empty() {
            self.fc()
                .code
                .add_asbx(OpCode::Jmp, 0, endlabel as i32, stmt.line);
        }
        let pc = self.fcr().code.last_pc();
        self.fc().set_label_pc(elselabel, pc);
        if !els.is_empty() {
            self.compile_block(els)?;
            let pc = self.fcr().code.last_pc();
            self.fc().set_label_pc(endlabel, pc);
        }
        Ok(())
    }

    /// Emits the test+jump skeleton of a condition; `thenlabel` is
    /// reached on true, `elselabel` on false.
    fn compile_branch_condition(
        &mut self,
        mut reg: i32,
        expr: &Expr,
        thenlabel: usize,
        elselabel: usize,
        hasnextcond: bool,
    ) -> Result<()> {
        let flip = if hasnextcond { 1 } else { 0 };
        let jumplabel = if hasnextcond { thenlabel } else { elselabel };

        match &expr.kind {
            ExprKind::False | ExprKind::Nil => {
                if !hasnextcond {
                    self.fc()
                        .code
                        .add_asbx(OpCode::Jmp, 0, elselabel as i32, expr.line);
                    return Ok(());
                }
            }
            ExprKind::True | ExprKind::Number(_) | ExprKind::String(_) => {
                if !hasnextcond {
                    return Ok(());
                }
            }
            ExprKind::Unary {
                op: UnaryOp::Not,
                expr: operand,
            } => {
                return self.compile_branch_condition(
                    reg,
                    operand,
                    elselabel,
                    thenlabel,
                    !hasnextcond,
                );
            }
            ExprKind::Logical { op, lhs, rhs } => {
                match op {
                    LogicalOp::And => {
                        let nextcondlabel = self.fc().new_label();
                        self.compile_branch_condition(reg, lhs, nextcondlabel, elselabel, false)?;
                        let pc = self.fcr().code.last_pc();
                        self.fc().set_label_pc(nextcondlabel, pc);
                        self.compile_branch_condition(reg, rhs, thenlabel, elselabel, hasnextcond)?;
                    }
                    LogicalOp::Or => {
                        let nextcondlabel = self.fc().new_label();
                        self.compile_branch_condition(reg, lhs, thenlabel, nextcondlabel, true)?;
                        let pc = self.fcr().code.last_pc();
                        self.fc().set_label_pc(nextcondlabel, pc);
                        self.compile_branch_condition(reg, rhs, thenlabel, elselabel, hasnextcond)?;
                    }
                }
                return Ok(());
            }
            ExprKind::Relational { op, lhs, rhs } => {
                return self.compile_relational_op_aux(reg, *op, lhs, rhs, expr.line, flip, jumplabel);
            }
            _ => {}
        }

        let mut a = reg;
        self.compile_expr_with_mv_propagation(expr, &mut reg, &mut a)?;
        self.fc().code.add_abc(OpCode::Test, a, 0, flip, expr.line);
        self.fc()
            .code
            .add_asbx(OpCode::Jmp, 0, jumplabel as i32, expr.line);
        Ok(())
    }

    fn compile_while_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        let StmtKind::While { condition, body } = &stmt.kind else {
            unreachable!()
        };
        let thenlabel = self.fc().new_label();
        let elselabel = self.fc().new_label();
        let condlabel = self.fc().new_label();

        let pc = self.fcr().code.last_pc();
        self.fc().set_label_pc(condlabel, pc);
        let reg = self.fcr().reg_top;
        self.compile_branch_condition(reg, condition, thenlabel, elselabel, false)?;
        let pc = self.fcr().code.last_pc();
        self.fc().set_label_pc(thenlabel, pc);
        self.fc().enter_block(elselabel, stmt.line, stmt.last_line);
        self.compile_chunk(body)?;
        self.fc().close_upvalues();
        self.fc()
            .code
            .add_asbx(OpCode::Jmp, 0, condlabel as i32, stmt.last_line);
        self.fc().leave_block()?;
        let pc = self.fcr().code.last_pc();
        self.fc().set_label_pc(elselabel, pc);
        Ok(())
    }

    fn compile_repeat_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        let StmtKind::Repeat { condition, body } = &stmt.kind else {
            unreachable!()
        };
        let initlabel = self.fc().new_label();
        let thenlabel = self.fc().new_label();
        let elselabel = self.fc().new_label();

        let pc = self.fcr().code.last_pc();
        self.fc().set_label_pc(initlabel, pc);
        self.fc().set_label_pc(elselabel, pc);
        self.fc().enter_block(thenlabel, stmt.line, stmt.last_line);
        self.compile_chunk(body)?;
        let reg = self.fcr().reg_top;
        self.compile_branch_condition(reg, condition, thenlabel, elselabel, false)?;

        let pc = self.fcr().code.last_pc();
        self.fc().set_label_pc(thenlabel, pc);
        let closed = self.fc().leave_block()?;

        if closed > -1 {
            // the loop-again path must close captured locals before the
            // back edge
            let label = self.fc().new_label();
            self.fc()
                .code
                .add_asbx(OpCode::Jmp, 0, label as i32, stmt.last_line);
            let pc = self.fcr().code.last_pc();
            self.fc().set_label_pc(elselabel, pc);
            self.fc()
                .code
                .add_abc(OpCode::Close, closed, 0, 0, stmt.last_line);
            self.fc()
                .code
                .add_asbx(OpCode::Jmp, 0, initlabel as i32, stmt.last_line);
            let pc = self.fcr().code.last_pc();
            self.fc().set_label_pc(label, pc);
        }
        Ok(())
    }

    fn compile_break_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        let fc = self.fc();
        for i in (0..fc.blocks.len()).rev() {
            let label = fc.blocks[i].break_label;
            if label != LABEL_NO_JUMP {
                if fc.blocks[i].ref_upvalue {
                    let n = fc.blocks[i - 1].local_vars.last_index();
                    fc.code.add_abc(OpCode::Close, n, 0, 0, stmt.line);
                }
                fc.code.add_asbx(OpCode::Jmp, 0, label as i32, stmt.line);
                return Ok(());
            }
        }
        Err(self.err(stmt.line, "no loop to break"))
    }

    fn compile_func_def_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        let StmtKind::FuncDef { name, func } = &stmt.kind else {
            unreachable!()
        };
        match &name.func {
            None => {
                // method definition: receiver[method] = function with
                // an implicit self
                let receiver = name.receiver.as_ref().unwrap();
                let mut reg = self.fcr().reg_top;
                let mut treg = 0;
                self.compile_expr_with_kmv_propagation(receiver, &mut reg, &mut treg)?;
                let kreg = self.load_rk(&mut reg, func, &Value::string(name.method.as_str()))?;
                self.compile_expr(reg, func, &ec(EcType::Method, REG_NOT_DEFINED, 0))?;
                self.fc()
                    .code
                    .add_abc(OpCode::SetTable, treg, kreg, reg, receiver.line);
                Ok(())
            }
            Some(target) => {
                let assign = Stmt {
                    kind: StmtKind::Assign {
                        lhs: vec![target.clone()],
                        rhs: vec![func.clone()],
                    },
                    line: func.line,
                    last_line: func.last_line,
                };
                self.compile_assign_stmt(&assign)
            }
        }
    }

    fn compile_number_for_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        let StmtKind::NumberFor {
            name,
            init,
            limit,
            step,
            body,
        } = &stmt.kind
        else {
            unreachable!()
        };
        let endlabel = self.fc().new_label();

        self.fc().enter_block(endlabel, stmt.line, stmt.last_line);
        let reg = self.fcr().reg_top;
        let rindex = self.fc().register_local_var("(for index)")?;
        self.compile_expr(reg, init, &ec(EcType::Local, rindex, 0))?;

        let reg = self.fcr().reg_top;
        let rlimit = self.fc().register_local_var("(for limit)")?;
        self.compile_expr(reg, limit, &ec(EcType::Local, rlimit, 0))?;

        let reg = self.fcr().reg_top;
        let rstep = self.fc().register_local_var("(for step)")?;
        let default_step = Expr::new(ExprKind::Number("1".to_string()), init.line);
        let step_expr = step.as_ref().unwrap_or(&default_step);
        self.compile_expr(reg, step_expr, &ec(EcType::Local, rstep, 0))?;

        self.fc()
            .code
            .add_asbx(OpCode::ForPrep, rindex, 0, stmt.line);

        self.fc().register_local_var(name)?;

        let bodypc = self.fcr().code.last_pc();
        self.compile_chunk(body)?;

        self.fc().leave_block()?;

        let flpc = self.fcr().code.last_pc();
        self.fc()
            .code
            .add_asbx(OpCode::ForLoop, rindex, bodypc - (flpc + 1), stmt.line);

        let pc = self.fcr().code.last_pc();
        self.fc().set_label_pc(endlabel, pc);
        self.fc().code.set_sbx(bodypc as usize, flpc - bodypc);
        Ok(())
    }

    fn compile_generic_for_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        let StmtKind::GenericFor { names, exprs, body } = &stmt.kind else {
            unreachable!()
        };
        let endlabel = self.fc().new_label();
        let bodylabel = self.fc().new_label();
        let fllabel = self.fc().new_label();
        let nnames = names.len() as i32;

        self.fc().enter_block(endlabel, stmt.line, stmt.last_line);
        let rgen = self.fc().register_local_var("(for generator)")?;
        self.fc().register_local_var("(for state)")?;
        self.fc().register_local_var("(for control)")?;

        let reg = self.fcr().reg_top - 3;
        self.compile_reg_assignment(names, exprs, reg, 3, stmt.line)?;

        self.fc()
            .code
            .add_asbx(OpCode::Jmp, 0, fllabel as i32, stmt.line);

        for name in names {
            self.fc().register_local_var(name)?;
        }

        let pc = self.fcr().code.last_pc();
        self.fc().set_label_pc(bodylabel, pc);
        self.compile_chunk(body)?;

        self.fc().leave_block()?;

        let pc = self.fcr().code.last_pc();
        self.fc().set_label_pc(fllabel, pc);
        self.fc()
            .code
            .add_abc(OpCode::TForLoop, rgen, 0, nnames, stmt.line);
        self.fc()
            .code
            .add_asbx(OpCode::Jmp, 0, bodylabel as i32, stmt.line);

        let pc = self.fcr().code.last_pc();
        self.fc().set_label_pc(endlabel, pc);
        Ok(())
    }

    /// Compiles one expression toward `ec`; returns how many registers
    /// above `reg` now hold its results.
    fn compile_expr(&mut self, reg: i32, expr: &Expr, ec_: &ExprContext) -> Result<i32> {
        let sreg = save_reg(ec_, reg);
        let sused = if sreg < reg { 0 } else { 1 };

        match &expr.kind {
            ExprKind::String(bytes) => {
                let cindex = self.fc().const_index(&Value::string(bytes.clone()))?;
                self.fc().code.add_abx(OpCode::LoadK, sreg, cindex, expr.line);
                Ok(sused)
            }
            ExprKind::Number(text) => {
                let num = parse_number(text).unwrap_or(f64::NAN);
                let cindex = self.fc().const_index(&Value::Number(num))?;
                self.fc().code.add_abx(OpCode::LoadK, sreg, cindex, expr.line);
                Ok(sused)
            }
            ExprKind::Nil => {
                self.fc()
                    .code
                    .add_abc(OpCode::LoadNil, sreg, sreg, 0, expr.line);
                Ok(sused)
            }
            ExprKind::False => {
                self.fc()
                    .code
                    .add_abc(OpCode::LoadBool, sreg, 0, 0, expr.line);
                Ok(sused)
            }
            ExprKind::True => {
                self.fc()
                    .code
                    .add_abc(OpCode::LoadBool, sreg, 1, 0, expr.line);
                Ok(sused)
            }
            ExprKind::Ident(name) => {
                match self.ident_ref_type(name) {
                    EcType::Global => {
                        let cindex = self.fc().const_index(&Value::string(name.as_str()))?;
                        self.fc()
                            .code
                            .add_abx(OpCode::GetGlobal, sreg, cindex, expr.line);
                    }
                    EcType::Upvalue => {
                        let index = self.fc().upvalues.register_unique(name);
                        self.fc()
                            .code
                            .add_abc(OpCode::GetUpval, sreg, index, 0, expr.line);
                    }
                    EcType::Local => {
                        let b = self.fcr().find_local_var(name);
                        self.fc().code.add_abc(OpCode::Move, sreg, b, 0, expr.line);
                    }
                    _ => unreachable!(),
                }
                Ok(sused)
            }
            ExprKind::Vararg => {
                if self.fcr().proto.is_vararg == 0 {
                    return Err(self.err(expr.line, "cannot use '...' outside a vararg function"));
                }
                self.fc().proto.is_vararg &= !VARARG_NEEDS_ARG;
                self.fc()
                    .code
                    .add_abc(OpCode::VarArg, sreg, 2 + ec_.varargopt, 0, expr.line);
                if self.fcr().reg_top > sreg + 2 + ec_.varargopt || ec_.varargopt < -1 {
                    return Ok(0);
                }
                Ok(sreg + 1 + ec_.varargopt - reg)
            }
            ExprKind::AttrGet { object, key } => {
                let a = sreg;
                let mut reg = reg;
                let mut b = reg;
                self.compile_expr_with_mv_propagation(object, &mut reg, &mut b)?;
                let mut c = reg;
                self.compile_expr_with_kmv_propagation(key, &mut reg, &mut c)?;
                let opcode = if matches!(key.kind, ExprKind::String(_)) {
                    OpCode::GetTableKs
                } else {
                    OpCode::GetTable
                };
                self.fc().code.add_abc(opcode, a, b, c, expr.line);
                Ok(sused)
            }
            ExprKind::Table(_) => {
                self.compile_table_expr(reg, expr, ec_)?;
                Ok(1)
            }
            ExprKind::Arith { .. } => {
                if let Some(folded) = const_fold(expr) {
                    let cindex = self.fc().const_index(&Value::Number(folded))?;
                    self.fc().code.add_abx(OpCode::LoadK, sreg, cindex, expr.line);
                    return Ok(sused);
                }
                self.compile_arith_op_expr(reg, expr, ec_)?;
                Ok(sused)
            }
            ExprKind::Concat { .. } => {
                self.compile_concat_op_expr(reg, expr, ec_)?;
                Ok(sused)
            }
            ExprKind::Unary { .. } => {
                self.compile_unary_op_expr(reg, expr, ec_)?;
                Ok(sused)
            }
            ExprKind::Relational { op, lhs, rhs } => {
                self.compile_relational_op_expr(reg, *op, lhs, rhs, expr.line, ec_)?;
                Ok(sused)
            }
            ExprKind::Logical { .. } => {
                self.compile_logical_op_expr(reg, expr, ec_)?;
                Ok(sused)
            }
            ExprKind::FuncCall(call) => self.compile_func_call_expr(reg, expr, call, ec_),
            ExprKind::Function(body) => {
                let source_name = self.source_name.clone();
                self.contexts.push(FuncContext::new(&source_name));
                self.compile_function_body(body, expr.line, expr.last_line, ec_)?;
                let child = self.contexts.pop().unwrap();
                let child_upvalues = child.upvalues.names;

                let fc = self.fc();
                let protono = fc.proto.protos.len() as i32;
                fc.proto.protos.push(Rc::new(child.proto));
                fc.code.add_abx(OpCode::Closure, sreg, protono, expr.line);

                for name in &child_upvalues {
                    // pseudo-instruction per upvalue: MOVE captures a
                    // local of this function, GETUPVAL re-shares one of
                    // its own upvalues
                    match self.fcr().find_local_var_and_block(name) {
                        Some((localidx, blockidx)) => {
                            let fc = self.fc();
                            fc.code.add_abc(OpCode::Move, 0, localidx, 0, expr.line);
                            fc.blocks[blockidx].ref_upvalue = true;
                        }
                        None => {
                            let fc = self.fc();
                            let upvalueidx = fc.upvalues.register_unique(name);
                            fc.code.add_abc(OpCode::GetUpval, 0, upvalueidx, 0, expr.line);
                        }
                    }
                }
                Ok(sused)
            }
        }
    }

    fn compile_expr_with_propagation(
        &mut self,
        expr: &Expr,
        reg: &mut i32,
        save: &mut i32,
        kmv: bool,
    ) -> Result<()> {
        let reginc = self.compile_expr(*reg, expr, &ec_none(0))?;
        if matches!(expr.kind, ExprKind::Logical { .. }) {
            *save = *reg;
            *reg += reginc;
        } else {
            let top = self.fcr().reg_top;
            if kmv {
                self.fc().code.propagate_kmv(top, save, reg, reginc);
            } else {
                self.fc().code.propagate_mv(top, save, reg, reginc);
            }
        }
        Ok(())
    }

    fn compile_expr_with_kmv_propagation(
        &mut self,
        expr: &Expr,
        reg: &mut i32,
        save: &mut i32,
    ) -> Result<()> {
        self.compile_expr_with_propagation(expr, reg, save, true)
    }

    fn compile_expr_with_mv_propagation(
        &mut self,
        expr: &Expr,
        reg: &mut i32,
        save: &mut i32,
    ) -> Result<()> {
        self.compile_expr_with_propagation(expr, reg, save, false)
    }

    fn compile_function_body(
        &mut self,
        body: &FunctionBody,
        line: u32,
        last_line: u32,
        ec_: &ExprContext,
    ) -> Result<()> {
        let has_parent = self.contexts.len() > 1;
        {
            let fc = self.fc();
            fc.proto.line_defined = line;
            fc.proto.last_line_defined = last_line;
            if body.params.names.len() > MAX_REGISTERS as usize {
                return Err(self.err(line, "register overflow"));
            }
        }
        self.fc().proto.num_parameters = body.params.names.len() as u8;
        if ec_.typ == EcType::Method {
            self.fc().proto.num_parameters += 1;
            self.fc().register_local_var("self")?;
        }
        for name in &body.params.names {
            self.fc().register_local_var(name)?;
        }
        if body.params.has_vararg {
            if COMPAT_VARARG {
                self.fc().proto.is_vararg = VARARG_HAS_ARG | VARARG_NEEDS_ARG;
                if has_parent {
                    self.fc().register_local_var("arg")?;
                }
            }
            self.fc().proto.is_vararg |= VARARG_IS_VARARG;
        }

        self.compile_chunk(&body.body)?;

        self.fc().code.add_abc(OpCode::Return, 0, 1, 0, last_line);
        self.fc().end_scope();

        let fc = self.fc();
        let code = std::mem::replace(&mut fc.code, CodeStore::new());
        let (codes, lines) = code.into_lists();
        fc.proto.code = codes;
        fc.proto.dbg_source_positions = lines;
        fc.proto.dbg_upvalues = fc.upvalues.names.clone();
        fc.proto.num_upvalues = fc.upvalues.names.len() as u8;

        self.patch_code()
    }

    fn compile_table_expr(&mut self, mut reg: i32, expr: &Expr, ec_: &ExprContext) -> Result<()> {
        let ExprKind::Table(fields) = &expr.kind else {
            unreachable!()
        };
        let tablereg = reg;
        reg += 1;
        self.fc()
            .code
            .add_abc(OpCode::NewTable, tablereg, 0, 0, expr.line);
        let tablepc = self.fcr().code.last_pc() as usize;
        let regbase = reg;

        let mut arraycount = 0i32;
        let mut lastvararg = false;
        for (i, field) in fields.iter().enumerate() {
            let islast = i == fields.len() - 1;
            match &field.key {
                None => {
                    if islast && is_vararg_return_expr(&field.value) {
                        reg += self.compile_expr(reg, &field.value, &ec_none(-2))?;
                        lastvararg = true;
                    } else {
                        reg += self.compile_expr(reg, &field.value, &ec_none(0))?;
                        arraycount += 1;
                    }
                }
                Some(key) => {
                    let regorg = reg;
                    let mut b = reg;
                    self.compile_expr_with_kmv_propagation(key, &mut reg, &mut b)?;
                    let mut c = reg;
                    self.compile_expr_with_kmv_propagation(&field.value, &mut reg, &mut c)?;
                    let opcode = if matches!(key.kind, ExprKind::String(_)) {
                        OpCode::SetTableKs
                    } else {
                        OpCode::SetTable
                    };
                    self.fc().code.add_abc(opcode, tablereg, b, c, expr.line);
                    reg = regorg;
                }
            }
            let flush = arraycount % FIELDS_PER_FLUSH;
            if (arraycount != 0 && (flush == 0 || islast)) || lastvararg {
                reg = regbase;
                let num = if flush == 0 { FIELDS_PER_FLUSH } else { flush };
                let mut c = (arraycount - 1) / FIELDS_PER_FLUSH + 1;
                let b = if islast && is_vararg_return_expr(&field.value) {
                    0
                } else {
                    num
                };
                let line = field.key.as_ref().unwrap_or(&field.value).line;
                if c > 511 {
                    c = 0;
                }
                self.fc()
                    .code
                    .add_abc(OpCode::SetList, tablereg, b, c, line);
                if c == 0 {
                    // raw count word follows the instruction
                    let real_c = (arraycount - 1) / FIELDS_PER_FLUSH + 1;
                    self.fc().code.add(real_c as u32, line);
                }
            }
        }
        self.fc().code.set_b(tablepc, int_to_fb(arraycount));
        self.fc()
            .code
            .set_c(tablepc, int_to_fb(fields.len() as i32 - arraycount));
        if ec_.typ == EcType::Local && ec_.reg != tablereg {
            self.fc()
                .code
                .add_abc(OpCode::Move, ec_.reg, tablereg, 0, expr.line);
        }
        Ok(())
    }

    fn compile_arith_op_expr(&mut self, mut reg: i32, expr: &Expr, ec_: &ExprContext) -> Result<()> {
        let ExprKind::Arith { op, lhs, rhs } = &expr.kind else {
            unreachable!()
        };
        let a = save_reg(ec_, reg);
        let mut b = reg;
        self.compile_expr_with_kmv_propagation(lhs, &mut reg, &mut b)?;
        let mut c = reg;
        self.compile_expr_with_kmv_propagation(rhs, &mut reg, &mut c)?;

        let opcode = match op {
            ArithOp::Add => OpCode::Add,
            ArithOp::Sub => OpCode::Sub,
            ArithOp::Mul => OpCode::Mul,
            ArithOp::Div => OpCode::Div,
            ArithOp::Mod => OpCode::Mod,
            ArithOp::Pow => OpCode::Pow,
        };
        self.fc().code.add_abc(opcode, a, b, c, expr.line);
        Ok(())
    }

    fn compile_concat_op_expr(&mut self, mut reg: i32, expr: &Expr, ec_: &ExprContext) -> Result<()> {
        let ExprKind::Concat { lhs, rhs } = &expr.kind else {
            unreachable!()
        };
        // count the chain length so one CONCAT covers `a .. b .. c`
        let mut crange = 1;
        let mut current = rhs.as_ref();
        loop {
            match &current.kind {
                ExprKind::Concat { rhs, .. } => {
                    crange += 1;
                    current = rhs;
                }
                _ => break,
            }
        }
        let a = save_reg(ec_, reg);
        let basereg = reg;
        reg += self.compile_expr(reg, lhs, &ec_none(0))?;
        reg += self.compile_expr(reg, rhs, &ec_none(0))?;
        let _ = reg;
        loop {
            let pc = self.fcr().code.last_pc();
            if pc <= 0 || bc::get_opcode(self.fcr().code.at(pc as usize)) != OpCode::Concat as u32
            {
                break;
            }
            self.fc().code.pop();
        }
        self.fc()
            .code
            .add_abc(OpCode::Concat, a, basereg, basereg + crange, expr.line);
        Ok(())
    }

    fn compile_unary_op_expr(&mut self, mut reg: i32, expr: &Expr, ec_: &ExprContext) -> Result<()> {
        let ExprKind::Unary { op, expr: operand } = &expr.kind else {
            unreachable!()
        };
        let opcode = match op {
            UnaryOp::Minus => {
                if let Some(folded) = const_fold(expr) {
                    let sreg = save_reg(ec_, reg);
                    let cindex = self.fc().const_index(&Value::Number(folded))?;
                    self.fc().code.add_abx(OpCode::LoadK, sreg, cindex, expr.line);
                    return Ok(());
                }
                OpCode::Unm
            }
            UnaryOp::Not => match operand.kind {
                ExprKind::True => {
                    let sreg = save_reg(ec_, reg);
                    self.fc()
                        .code
                        .add_abc(OpCode::LoadBool, sreg, 0, 0, expr.line);
                    return Ok(());
                }
                ExprKind::False | ExprKind::Nil => {
                    let sreg = save_reg(ec_, reg);
                    self.fc()
                        .code
                        .add_abc(OpCode::LoadBool, sreg, 1, 0, expr.line);
                    return Ok(());
                }
                _ => OpCode::Not,
            },
            UnaryOp::Len => OpCode::Len,
        };

        let a = save_reg(ec_, reg);
        let mut b = reg;
        self.compile_expr_with_mv_propagation(operand, &mut reg, &mut b)?;
        self.fc().code.add_abc(opcode, a, b, 0, expr.line);
        Ok(())
    }

    fn compile_relational_op_aux(
        &mut self,
        mut reg: i32,
        op: RelOp,
        lhs: &Expr,
        rhs: &Expr,
        line: u32,
        flip: i32,
        label: usize,
    ) -> Result<()> {
        let mut b = reg;
        self.compile_expr_with_kmv_propagation(lhs, &mut reg, &mut b)?;
        let mut c = reg;
        self.compile_expr_with_kmv_propagation(rhs, &mut reg, &mut c)?;
        match op {
            RelOp::Lt => self.fc().code.add_abc(OpCode::Lt, flip, b, c, line),
            RelOp::Gt => self.fc().code.add_abc(OpCode::Lt, flip, c, b, line),
            RelOp::Le => self.fc().code.add_abc(OpCode::Le, flip, b, c, line),
            RelOp::Ge => self.fc().code.add_abc(OpCode::Le, flip, c, b, line),
            RelOp::Eq => self.fc().code.add_abc(OpCode::Eq, flip, b, c, line),
            RelOp::Ne => self.fc().code.add_abc(OpCode::Eq, 1 ^ flip, b, c, line),
        }
        self.fc().code.add_asbx(OpCode::Jmp, 0, label as i32, line);
        Ok(())
    }

    fn compile_relational_op_expr(
        &mut self,
        reg: i32,
        op: RelOp,
        lhs: &Expr,
        rhs: &Expr,
        line: u32,
        ec_: &ExprContext,
    ) -> Result<()> {
        let a = save_reg(ec_, reg);
        let jumplabel = self.fc().new_label();
        self.compile_relational_op_aux(reg, op, lhs, rhs, line, 1, jumplabel)?;
        self.fc().code.add_abc(OpCode::LoadBool, a, 0, 1, line);
        let pc = self.fcr().code.last_pc();
        self.fc().set_label_pc(jumplabel, pc);
        self.fc().code.add_abc(OpCode::LoadBool, a, 1, 0, line);
        Ok(())
    }

    fn compile_logical_op_expr(&mut self, reg: i32, expr: &Expr, ec_: &ExprContext) -> Result<()> {
        let ExprKind::Logical { op, lhs, rhs } = &expr.kind else {
            unreachable!()
        };
        let a = save_reg(ec_, reg);
        let endlabel = self.fc().new_label();
        let mut lb = LbLabels {
            t: self.fc().new_label(),
            f: self.fc().new_label(),
            e: endlabel,
            b: false,
        };
        let nextcondlabel = self.fc().new_label();
        if *op == LogicalOp::And {
            self.compile_logical_op_expr_aux(reg, lhs, ec_, nextcondlabel, endlabel, false, &mut lb)?;
            let pc = self.fcr().code.last_pc();
            self.fc().set_label_pc(nextcondlabel, pc);
            self.compile_logical_op_expr_aux(reg, rhs, ec_, endlabel, endlabel, false, &mut lb)?;
        } else {
            self.compile_logical_op_expr_aux(reg, lhs, ec_, endlabel, nextcondlabel, true, &mut lb)?;
            let pc = self.fcr().code.last_pc();
            self.fc().set_label_pc(nextcondlabel, pc);
            self.compile_logical_op_expr_aux(reg, rhs, ec_, endlabel, endlabel, false, &mut lb)?;
        }

        if lb.b {
            let pc = self.fcr().code.last_pc();
            self.fc().set_label_pc(lb.f, pc);
            self.fc().code.add_abc(OpCode::LoadBool, a, 0, 1, expr.line);
            let pc = self.fcr().code.last_pc();
            self.fc().set_label_pc(lb.t, pc);
            self.fc().code.add_abc(OpCode::LoadBool, a, 1, 0, expr.line);
        }

        let lastinst = self.fcr().code.last();
        if bc::get_opcode(lastinst) == OpCode::Jmp as u32
            && bc::get_arg_sbx(lastinst) == endlabel as i32
        {
            self.fc().code.pop();
        }

        let pc = self.fcr().code.last_pc();
        self.fc().set_label_pc(endlabel, pc);
        Ok(())
    }

    fn compile_logical_op_expr_aux(
        &mut self,
        mut reg: i32,
        expr: &Expr,
        ec_: &ExprContext,
        thenlabel: usize,
        elselabel: usize,
        hasnextcond: bool,
        lb: &mut LbLabels,
    ) -> Result<()> {
        let mut flip = 0;
        let mut jumplabel = if hasnextcond { thenlabel } else { elselabel };
        if hasnextcond {
            flip = 1;
        }

        match &expr.kind {
            ExprKind::False => {
                if elselabel == lb.e {
                    self.fc().code.add_asbx(OpCode::Jmp, 0, lb.f as i32, expr.line);
                    lb.b = true;
                } else {
                    self.fc()
                        .code
                        .add_asbx(OpCode::Jmp, 0, elselabel as i32, expr.line);
                }
                return Ok(());
            }
            ExprKind::Nil => {
                if elselabel == lb.e {
                    self.compile_expr(reg, expr, ec_)?;
                    self.fc().code.add_asbx(OpCode::Jmp, 0, lb.e as i32, expr.line);
                } else {
                    self.fc()
                        .code
                        .add_asbx(OpCode::Jmp, 0, elselabel as i32, expr.line);
                }
                return Ok(());
            }
            ExprKind::True => {
                if thenlabel == lb.e {
                    self.fc().code.add_asbx(OpCode::Jmp, 0, lb.t as i32, expr.line);
                    lb.b = true;
                } else {
                    self.fc()
                        .code
                        .add_asbx(OpCode::Jmp, 0, thenlabel as i32, expr.line);
                }
                return Ok(());
            }
            ExprKind::Number(_) | ExprKind::String(_) => {
                if thenlabel == lb.e {
                    self.compile_expr(reg, expr, ec_)?;
                    self.fc().code.add_asbx(OpCode::Jmp, 0, lb.e as i32, expr.line);
                } else {
                    self.fc()
                        .code
                        .add_asbx(OpCode::Jmp, 0, thenlabel as i32, expr.line);
                }
                return Ok(());
            }
            ExprKind::Logical { op, lhs, rhs } => {
                match op {
                    LogicalOp::And => {
                        let nextcondlabel = self.fc().new_label();
                        self.compile_logical_op_expr_aux(
                            reg,
                            lhs,
                            ec_,
                            nextcondlabel,
                            elselabel,
                            false,
                            lb,
                        )?;
                        let pc = self.fcr().code.last_pc();
                        self.fc().set_label_pc(nextcondlabel, pc);
                        self.compile_logical_op_expr_aux(
                            reg,
                            rhs,
                            ec_,
                            thenlabel,
                            elselabel,
                            hasnextcond,
                            lb,
                        )?;
                    }
                    LogicalOp::Or => {
                        let nextcondlabel = self.fc().new_label();
                        self.compile_logical_op_expr_aux(
                            reg,
                            lhs,
                            ec_,
                            thenlabel,
                            nextcondlabel,
                            true,
                            lb,
                        )?;
                        let pc = self.fcr().code.last_pc();
                        self.fc().set_label_pc(nextcondlabel, pc);
                        self.compile_logical_op_expr_aux(
                            reg,
                            rhs,
                            ec_,
                            thenlabel,
                            elselabel,
                            hasnextcond,
                            lb,
                        )?;
                    }
                }
                return Ok(());
            }
            ExprKind::Relational { op, lhs, rhs } => {
                if thenlabel == elselabel {
                    flip ^= 1;
                    jumplabel = lb.t;
                    lb.b = true;
                } else if thenlabel == lb.e {
                    jumplabel = lb.t;
                    lb.b = true;
                } else if elselabel == lb.e {
                    jumplabel = lb.f;
                    lb.b = true;
                }
                return self.compile_relational_op_aux(
                    reg, *op, lhs, rhs, expr.line, flip, jumplabel,
                );
            }
            _ => {}
        }

        if !hasnextcond && thenlabel == elselabel {
            reg += self.compile_expr(reg, expr, ec_)?;
            let _ = reg;
        } else {
            let a = reg;
            let sreg = save_reg(ec_, a);
            reg += self.compile_expr(reg, expr, &ec_none(0))?;
            let _ = reg;
            if sreg == a {
                self.fc().code.add_abc(OpCode::Test, a, 0, flip, expr.line);
            } else {
                self.fc()
                    .code
                    .add_abc(OpCode::TestSet, sreg, a, flip, expr.line);
            }
        }
        self.fc()
            .code
            .add_asbx(OpCode::Jmp, 0, jumplabel as i32, expr.line);
        Ok(())
    }

    fn compile_func_call_expr(
        &mut self,
        mut reg: i32,
        expr: &Expr,
        call: &FuncCall,
        ec_: &ExprContext,
    ) -> Result<i32> {
        let mut funcreg = reg;
        if ec_.typ == EcType::Local && ec_.reg == self.fcr().proto.num_parameters as i32 - 1 {
            funcreg = ec_.reg;
            reg = ec_.reg;
        }
        let mut argc = call.args.len() as i32;
        let mut islastvararg = false;
        let name;

        if let Some(func) = &call.func {
            reg += self.compile_expr(reg, func, &ec_none(0))?;
            name = get_expr_name(func);
        } else {
            let receiver = call.receiver.as_ref().unwrap();
            let mut b = reg;
            self.compile_expr_with_mv_propagation(receiver, &mut reg, &mut b)?;
            let c = self.load_rk(&mut reg, expr, &Value::string(call.method.as_str()))?;
            self.fc()
                .code
                .add_abc(OpCode::SelfOp, funcreg, b, c, expr.line);
            // one extra register for the implicit self
            reg = b + 1;
            let reg2 = funcreg + 2;
            if reg2 > reg {
                reg = reg2;
            }
            argc += 1;
            name = call.method.clone();
        }

        for (i, arg) in call.args.iter().enumerate() {
            islastvararg = i == call.args.len() - 1 && is_vararg_return_expr(arg);
            if islastvararg {
                self.compile_expr(reg, arg, &ec_none(-2))?;
            } else {
                reg += self.compile_expr(reg, arg, &ec_none(0))?;
            }
        }
        let b = if islastvararg { 0 } else { argc + 1 };
        self.fc()
            .code
            .add_abc(OpCode::Call, funcreg, b, ec_.varargopt + 2, expr.line);
        let pc = self.fcr().code.last_pc() as u32;
        self.fc().proto.dbg_calls.push(DbgCall { name, pc });

        if ec_.varargopt == 0 && ec_.typ == EcType::Local && funcreg != ec_.reg {
            self.fc()
                .code
                .add_abc(OpCode::Move, ec_.reg, funcreg, 0, expr.line);
            return Ok(1);
        }
        if self.fcr().reg_top > funcreg + 2 + ec_.varargopt || ec_.varargopt < -1 {
            return Ok(0);
        }
        Ok(ec_.varargopt + 1)
    }

    /// Constant as an RK operand when it fits, else materialized with
    /// LOADK.
    fn load_rk(&mut self, reg: &mut i32, expr: &Expr, constant: &Value) -> Result<i32> {
        let cindex = self.fc().const_index(constant)?;
        if cindex <= bc::MAX_INDEX_RK {
            Ok(bc::rk_ask(cindex))
        } else {
            let ret = *reg;
            *reg += 1;
            self.fc().code.add_abx(OpCode::LoadK, ret, cindex, expr.line);
            Ok(ret)
        }
    }

    /// Final pass: resolves jump labels to offsets (collapsing chains,
    /// degenerating empty jumps to NOP), merges MOVE runs into MOVEN
    /// and computes the register budget.
    fn patch_code(&mut self) -> Result<()> {
        let fc = self.fc();
        let mut maxreg = if fc.proto.num_parameters > 1 {
            fc.proto.num_parameters as i32
        } else {
            1
        };
        let mut moven = 0usize;
        let length = fc.proto.code.len();
        let mut pc = 0usize;
        while pc < length {
            let inst = fc.proto.code[pc];
            let curop = OpCode::from_u32(bc::get_opcode(inst));
            match curop {
                Some(OpCode::Closure) => {
                    let nupvalues =
                        fc.proto.protos[bc::get_arg_bx(inst) as usize].num_upvalues as usize;
                    pc += nupvalues + 1;
                    moven = 0;
                    continue;
                }
                Some(
                    OpCode::SetGlobal
                    | OpCode::SetUpval
                    | OpCode::Eq
                    | OpCode::Lt
                    | OpCode::Le
                    | OpCode::Test
                    | OpCode::TailCall
                    | OpCode::Return
                    | OpCode::ForPrep
                    | OpCode::ForLoop
                    | OpCode::TForLoop
                    | OpCode::SetList
                    | OpCode::Close,
                ) => {}
                Some(OpCode::Call) => {
                    let reg = bc::get_arg_a(inst) + bc::get_arg_c(inst) - 2;
                    if reg > maxreg {
                        maxreg = reg;
                    }
                }
                Some(OpCode::VarArg) => {
                    let reg = bc::get_arg_a(inst) + bc::get_arg_b(inst) - 1;
                    if reg > maxreg {
                        maxreg = reg;
                    }
                }
                Some(OpCode::SelfOp) => {
                    let reg = bc::get_arg_a(inst) + 1;
                    if reg > maxreg {
                        maxreg = reg;
                    }
                }
                Some(OpCode::LoadNil) => {
                    let reg = bc::get_arg_b(inst);
                    if reg > maxreg {
                        maxreg = reg;
                    }
                }
                Some(OpCode::Jmp) => {
                    // collapse jump-to-jump chains, bounded to avoid
                    // cycling
                    let mut distance = 0i32;
                    let mut count = 0;
                    let mut jmp = inst;
                    while bc::get_opcode(jmp) == OpCode::Jmp as u32 && count < 5 {
                        let label = bc::get_arg_sbx(jmp) as usize;
                        let d = fc.get_label_pc(label) - pc as i32;
                        if d > bc::MAX_ARG_SBX {
                            if distance == 0 {
                                return Err(CompileError::new(
                                    fc.proto.source_name.clone(),
                                    fc.proto.line_defined,
                                    "too long to jump",
                                ));
                            }
                            break;
                        }
                        distance = d;
                        count += 1;
                        let next = pc as i32 + distance + 1;
                        if next < 0 || next as usize >= length {
                            break;
                        }
                        jmp = fc.proto.code[next as usize];
                    }
                    if distance == 0 {
                        bc::set_opcode(&mut fc.proto.code[pc], OpCode::Nop);
                    } else {
                        bc::set_arg_sbx(&mut fc.proto.code[pc], distance);
                    }
                }
                _ => {
                    let reg = bc::get_arg_a(inst);
                    if reg > maxreg {
                        maxreg = reg;
                    }
                }
            }

            // merge MOVE runs into a single MOVEN head for dispatch
            // reduction
            if curop == Some(OpCode::Move) {
                moven += 1;
            } else {
                if moven > 1 {
                    let head = pc - moven;
                    bc::set_opcode(&mut fc.proto.code[head], OpCode::MoveN);
                    bc::set_arg_c(
                        &mut fc.proto.code[head],
                        ((moven - 1) as i32).min(bc::MAX_ARG_C),
                    );
                }
                moven = 0;
            }
            pc += 1;
        }
        maxreg += 1;
        if maxreg > MAX_REGISTERS {
            return Err(CompileError::new(
                fc.proto.source_name.clone(),
                fc.proto.line_defined,
                "register overflow(too many local variables)",
            ));
        }
        fc.proto.num_used_registers = maxreg as u8;
        Ok(())
    }
}

fn get_expr_name(expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::Ident(name) => name.clone(),
        ExprKind::AttrGet { key, .. } => match &key.kind {
            ExprKind::String(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            _ => "?".to_string(),
        },
        _ => "?".to_string(),
    }
}

/// Compiles a parsed chunk into the prototype of its implicit vararg
/// main function.
pub fn compile(chunk: &[Stmt], name: &str) -> std::result::Result<Rc<FunctionProto>, CompileError> {
    let body = FunctionBody {
        params: ParList {
            names: Vec::new(),
            has_vararg: true,
        },
        body: chunk.to_vec(),
    };
    let mut compiler = Compiler {
        contexts: vec![FuncContext::new(name)],
        source_name: name.to_string(),
    };
    compiler.compile_function_body(&body, 0, 0, &ec_none(0))?;
    let fc = compiler.contexts.pop().unwrap();
    Ok(Rc::new(fc.proto))
}
