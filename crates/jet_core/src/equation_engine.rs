use crate::error::{Error, Result};
use crate::expression::solve_kepler;
use crate::traits::{FpPolicy, Scalar};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Elementary one-argument operations of the IR. Everything but `Neg` is a
/// call to an external math routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryFn {
    Neg,
    Sqrt,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
}

impl UnaryFn {
    pub fn name(self) -> &'static str {
        match self {
            UnaryFn::Neg => "neg",
            UnaryFn::Sqrt => "sqrt",
            UnaryFn::Exp => "exp",
            UnaryFn::Log => "log",
            UnaryFn::Sin => "sin",
            UnaryFn::Cos => "cos",
            UnaryFn::Tan => "tan",
            UnaryFn::Asin => "asin",
            UnaryFn::Acos => "acos",
            UnaryFn::Atan => "atan",
            UnaryFn::Sinh => "sinh",
            UnaryFn::Cosh => "cosh",
            UnaryFn::Tanh => "tanh",
        }
    }

    pub fn is_call(self) -> bool {
        self != UnaryFn::Neg
    }

    pub fn eval<T: Scalar>(self, a: T) -> T {
        match self {
            UnaryFn::Neg => -a,
            UnaryFn::Sqrt => a.sqrt(),
            UnaryFn::Exp => a.exp(),
            UnaryFn::Log => a.ln(),
            UnaryFn::Sin => a.sin(),
            UnaryFn::Cos => a.cos(),
            UnaryFn::Tan => a.tan(),
            UnaryFn::Asin => a.asin(),
            UnaryFn::Acos => a.acos(),
            UnaryFn::Atan => a.atan(),
            UnaryFn::Sinh => a.sinh(),
            UnaryFn::Cosh => a.cosh(),
            UnaryFn::Tanh => a.tanh(),
        }
    }
}

/// Elementary two-argument operations of the IR. `Pow`, `Atan2` and
/// `Kepler` (eccentric anomaly from `(e, M)`) are external calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryFn {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Atan2,
    Kepler,
}

impl BinaryFn {
    pub fn name(self) -> &'static str {
        match self {
            BinaryFn::Add => "fadd",
            BinaryFn::Sub => "fsub",
            BinaryFn::Mul => "fmul",
            BinaryFn::Div => "fdiv",
            BinaryFn::Pow => "pow",
            BinaryFn::Atan2 => "atan2",
            BinaryFn::Kepler => "kepE",
        }
    }

    pub fn is_call(self) -> bool {
        matches!(self, BinaryFn::Pow | BinaryFn::Atan2 | BinaryFn::Kepler)
    }

    pub fn eval<T: Scalar>(self, a: T, b: T) -> T {
        match self {
            BinaryFn::Add => a + b,
            BinaryFn::Sub => a - b,
            BinaryFn::Mul => a * b,
            BinaryFn::Div => a / b,
            BinaryFn::Pow => a.powf(b),
            BinaryFn::Atan2 => a.atan2(b),
            BinaryFn::Kepler => solve_kepler(a, b),
        }
    }
}

/// Index of the instruction defining a value, within its bytecode.
pub type ValueId = u32;

/// Tape entry addressed by an instruction: a fixed DC index, or the `k`-th
/// slot of the row a loop body is currently processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    Fixed(u32),
    Row(u8),
}

/// Instructions of the coefficient IR.
///
/// The IR is in SSA form: every instruction except `StoreCoeff` defines one
/// value, named by its position. Operands only refer to earlier values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OpCode {
    /// A literal.
    LoadConst(f64),
    /// Reads the order-`order` coefficient of a tape entry.
    LoadCoeff { slot: Slot, order: u32 },
    /// Reads the `k`-th literal of the current loop row.
    LoadRowLiteral(u8),
    /// Reads `pars[i]`.
    LoadParam(u32),
    /// Reads the current time.
    LoadTime,
    Unary(UnaryFn, ValueId),
    Binary(BinaryFn, ValueId, ValueId),
    /// Writes a value into the tape.
    StoreCoeff {
        slot: Slot,
        order: u32,
        value: ValueId,
    },
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn push(&mut self, op: OpCode) -> ValueId {
        self.ops.push(op);
        (self.ops.len() - 1) as ValueId
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The entries one loop iteration works on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelRow {
    pub slots: Vec<u32>,
    pub literals: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Block {
    /// Executed once.
    Straight(Bytecode),
    /// Executed once per row, in row order.
    Loop { body: Bytecode, rows: Vec<KernelRow> },
}

/// The IR description handed to a [`JitBackend`].
///
/// The described function has the signature `(tape, pars, time)`: it reads
/// the parameters and the time, reads the order-0 state coefficients from
/// the tape and writes every other coefficient of orders `0..=order`. The
/// tape is laid out by order: the coefficient `(entry, n)` lives at
/// `n * n_entries + entry`. The function is pure apart from the tape writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrModule {
    pub order: u32,
    pub n_entries: u32,
    pub n_params: u32,
    pub compact: bool,
    pub blocks: Vec<Block>,
}

impl IrModule {
    pub fn tape_len(&self) -> usize {
        self.n_entries as usize * (self.order as usize + 1)
    }

    pub fn n_instructions(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| match b {
                Block::Straight(code) => code.len(),
                Block::Loop { body, .. } => body.len(),
            })
            .sum()
    }

    /// Structural checks: SSA operands, slot ranges, orders and row shapes.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::InvalidInput(format!("malformed IR: {msg}")));
        for (b, block) in self.blocks.iter().enumerate() {
            let (code, rows): (&Bytecode, &[KernelRow]) = match block {
                Block::Straight(code) => (code, &[][..]),
                Block::Loop { body, rows } => (body, rows.as_slice()),
            };
            let in_loop = matches!(block, Block::Loop { .. });
            let check_slot = |slot: &Slot| -> bool {
                match slot {
                    Slot::Fixed(i) => *i < self.n_entries,
                    Slot::Row(k) => {
                        in_loop && rows.iter().all(|r| {
                            r.slots.get(*k as usize).is_some_and(|i| *i < self.n_entries)
                        })
                    }
                }
            };
            for (i, op) in code.ops.iter().enumerate() {
                let defined = |v: &ValueId| {
                    (*v as usize) < i && !matches!(code.ops[*v as usize], OpCode::StoreCoeff { .. })
                };
                let ok = match op {
                    OpCode::LoadConst(_) | OpCode::LoadTime => true,
                    OpCode::LoadParam(p) => *p < self.n_params,
                    OpCode::LoadRowLiteral(k) => {
                        in_loop && rows.iter().all(|r| (*k as usize) < r.literals.len())
                    }
                    OpCode::LoadCoeff { slot, order } => *order <= self.order && check_slot(slot),
                    OpCode::Unary(_, a) => defined(a),
                    OpCode::Binary(_, a, c) => defined(a) && defined(c),
                    OpCode::StoreCoeff { slot, order, value } => {
                        *order <= self.order && check_slot(slot) && defined(value)
                    }
                };
                if !ok {
                    return bad(format!("instruction {i} of block {b}: {op:?}"));
                }
            }
        }
        Ok(())
    }

    /// Textual listing for the fp policy `T`.
    pub fn dump<T: FpPolicy>(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "; taylor function: fp {}, width {}, order {}, {} entries, {} mode",
            T::name(),
            T::vector_width(),
            self.order,
            self.n_entries,
            if self.compact { "compact" } else { "scalar" }
        );
        let slot = |s: &Slot| match s {
            Slot::Fixed(i) => format!("tape[{i}]"),
            Slot::Row(k) => format!("tape[row.{k}]"),
        };
        for (b, block) in self.blocks.iter().enumerate() {
            let code = match block {
                Block::Straight(code) => {
                    let _ = writeln!(out, "block{b}:");
                    code
                }
                Block::Loop { body, rows } => {
                    let _ = writeln!(out, "block{b}: loop over {} rows", rows.len());
                    body
                }
            };
            for (i, op) in code.ops.iter().enumerate() {
                let _ = match op {
                    OpCode::LoadConst(c) => writeln!(out, "  %{i} = {}", T::literal(*c)),
                    OpCode::LoadCoeff { slot: s, order } => {
                        writeln!(out, "  %{i} = load {}[{order}]", slot(s))
                    }
                    OpCode::LoadRowLiteral(k) => writeln!(out, "  %{i} = row.lit{k}"),
                    OpCode::LoadParam(p) => writeln!(out, "  %{i} = load pars[{p}]"),
                    OpCode::LoadTime => writeln!(out, "  %{i} = load time"),
                    OpCode::Unary(f, a) if f.is_call() => {
                        writeln!(out, "  %{i} = call {}(%{a})", T::intrinsic(f.name()))
                    }
                    OpCode::Unary(f, a) => writeln!(out, "  %{i} = {} %{a}", f.name()),
                    OpCode::Binary(f, a, c) if f.is_call() => {
                        writeln!(out, "  %{i} = call {}(%{a}, %{c})", T::intrinsic(f.name()))
                    }
                    OpCode::Binary(f, a, c) => writeln!(out, "  %{i} = {} %{a}, %{c}", f.name()),
                    OpCode::StoreCoeff {
                        slot: s,
                        order,
                        value,
                    } => writeln!(out, "  store %{value} -> {}[{order}]", slot(s)),
                };
            }
        }
        out
    }
}

/// A compiled Taylor function.
pub trait TaylorFn<T: Scalar>: Send + Sync {
    fn call(&self, tape: &mut [T], pars: &[T], time: T);
}

/// A code generator turning an [`IrModule`] into a callable.
pub trait JitBackend<T: Scalar>: Send + Sync {
    fn name(&self) -> &'static str;

    fn build_function(&self, module: &IrModule) -> Result<Box<dyn TaylorFn<T>>>;
}

/// Backend interpreting the IR on a register machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmBackend;

impl<T: Scalar> JitBackend<T> for VmBackend {
    fn name(&self) -> &'static str {
        "vm"
    }

    fn build_function(&self, module: &IrModule) -> Result<Box<dyn TaylorFn<T>>> {
        module.validate()?;
        let n = module.n_entries as usize;
        let literal = |v: f64| {
            T::from_f64(v).ok_or_else(|| {
                Error::UnsupportedOperation(format!("the literal {v} is not representable"))
            })
        };
        let mut blocks = Vec::with_capacity(module.blocks.len());
        let mut max_len = 0;
        for block in &module.blocks {
            let (code, rows) = match block {
                Block::Straight(code) => (code, Vec::new()),
                Block::Loop { body, rows } => {
                    let rows = rows
                        .iter()
                        .map(|r| {
                            Ok(VmRow {
                                slots: r.slots.iter().map(|s| *s as usize).collect(),
                                literals: r
                                    .literals
                                    .iter()
                                    .map(|v| literal(*v))
                                    .collect::<Result<Vec<_>>>()?,
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    (body, rows)
                }
            };
            let mut instrs = Vec::with_capacity(code.len());
            for op in &code.ops {
                instrs.push(match *op {
                    OpCode::LoadConst(c) => Instr::Const(literal(c)?),
                    OpCode::LoadCoeff { slot, order } => Instr::Coeff {
                        slot,
                        offset: order as usize * n,
                    },
                    OpCode::LoadRowLiteral(k) => Instr::RowLiteral(k as usize),
                    OpCode::LoadParam(p) => Instr::Param(p as usize),
                    OpCode::LoadTime => Instr::Time,
                    OpCode::Unary(f, a) => Instr::Unary(f, a as usize),
                    OpCode::Binary(f, a, b) => Instr::Binary(f, a as usize, b as usize),
                    OpCode::StoreCoeff { slot, order, value } => Instr::Store {
                        slot,
                        offset: order as usize * n,
                        value: value as usize,
                    },
                });
            }
            max_len = max_len.max(instrs.len());
            blocks.push(VmBlock {
                looped: matches!(block, Block::Loop { .. }),
                code: instrs,
                rows,
            });
        }
        debug!(
            "vm backend: built function with {} blocks, {} instructions",
            blocks.len(),
            module.n_instructions()
        );
        Ok(Box::new(VmFunction {
            blocks,
            registers: Mutex::new(vec![T::zero(); max_len]),
            max_len,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
enum Instr<T> {
    Const(T),
    Coeff { slot: Slot, offset: usize },
    RowLiteral(usize),
    Param(usize),
    Time,
    Unary(UnaryFn, usize),
    Binary(BinaryFn, usize, usize),
    Store { slot: Slot, offset: usize, value: usize },
}

struct VmRow<T> {
    slots: Vec<usize>,
    literals: Vec<T>,
}

struct VmBlock<T> {
    looped: bool,
    code: Vec<Instr<T>>,
    rows: Vec<VmRow<T>>,
}

struct VmFunction<T> {
    blocks: Vec<VmBlock<T>>,
    // Scratch registers. Concurrent callers that find them busy use a
    // temporary buffer.
    registers: Mutex<Vec<T>>,
    max_len: usize,
}

impl<T: Scalar> VmFunction<T> {
    fn run(
        code: &[Instr<T>],
        row: Option<&VmRow<T>>,
        regs: &mut [T],
        tape: &mut [T],
        pars: &[T],
        time: T,
    ) {
        let resolve = |slot: Slot| match (slot, row) {
            (Slot::Fixed(i), _) => i as usize,
            (Slot::Row(k), Some(r)) => r.slots[k as usize],
            // rejected by validation
            (Slot::Row(_), None) => usize::MAX,
        };
        for (i, instr) in code.iter().enumerate() {
            regs[i] = match *instr {
                Instr::Const(c) => c,
                Instr::Coeff { slot, offset } => tape
                    .get(offset.wrapping_add(resolve(slot)))
                    .copied()
                    .unwrap_or_else(T::nan),
                Instr::RowLiteral(k) => row.map_or_else(T::nan, |r| r.literals[k]),
                Instr::Param(p) => pars.get(p).copied().unwrap_or_else(T::nan),
                Instr::Time => time,
                Instr::Unary(f, a) => f.eval(regs[a]),
                Instr::Binary(f, a, b) => f.eval(regs[a], regs[b]),
                Instr::Store {
                    slot,
                    offset,
                    value,
                } => {
                    if let Some(dst) = tape.get_mut(offset.wrapping_add(resolve(slot))) {
                        *dst = regs[value];
                    }
                    continue;
                }
            };
        }
    }

    fn execute(&self, regs: &mut [T], tape: &mut [T], pars: &[T], time: T) {
        for block in &self.blocks {
            if block.looped {
                for row in &block.rows {
                    Self::run(&block.code, Some(row), regs, tape, pars, time);
                }
            } else {
                Self::run(&block.code, None, regs, tape, pars, time);
            }
        }
    }
}

impl<T: Scalar> TaylorFn<T> for VmFunction<T> {
    fn call(&self, tape: &mut [T], pars: &[T], time: T) {
        match self.registers.try_lock() {
            Some(mut regs) => self.execute(&mut regs, tape, pars, time),
            None => {
                let mut regs = vec![T::zero(); self.max_len];
                self.execute(&mut regs, tape, pars, time);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected an error");
        assert!(
            format!("{err}").contains(needle),
            "error '{err}' does not contain '{needle}'"
        );
    }

    /// tape[1][n] = sin(tape[0][n]) * pars[0] + time, for orders 0 and 1.
    fn straight_module() -> IrModule {
        let mut blocks = Vec::new();
        for order in 0..=1 {
            let mut code = Bytecode::new();
            let x = code.push(OpCode::LoadCoeff {
                slot: Slot::Fixed(0),
                order,
            });
            let s = code.push(OpCode::Unary(UnaryFn::Sin, x));
            let p = code.push(OpCode::LoadParam(0));
            let m = code.push(OpCode::Binary(BinaryFn::Mul, s, p));
            let t = code.push(OpCode::LoadTime);
            let r = code.push(OpCode::Binary(BinaryFn::Add, m, t));
            code.push(OpCode::StoreCoeff {
                slot: Slot::Fixed(1),
                order,
                value: r,
            });
            blocks.push(Block::Straight(code));
        }
        IrModule {
            order: 1,
            n_entries: 2,
            n_params: 1,
            compact: false,
            blocks,
        }
    }

    #[test]
    fn vm_executes_straight_blocks() {
        let module = straight_module();
        let f = <VmBackend as JitBackend<f64>>::build_function(&VmBackend, &module).unwrap();
        let mut tape = vec![0.5, 0.0, 0.25, 0.0];
        f.call(&mut tape, &[2.0], 1.0);
        assert_eq!(tape[1], 0.5_f64.sin() * 2.0 + 1.0);
        assert_eq!(tape[3], 0.25_f64.sin() * 2.0 + 1.0);
    }

    #[test]
    fn vm_executes_loops_per_row() {
        let mut body = Bytecode::new();
        let a = body.push(OpCode::LoadCoeff {
            slot: Slot::Row(1),
            order: 0,
        });
        let k = body.push(OpCode::LoadRowLiteral(0));
        let r = body.push(OpCode::Binary(BinaryFn::Mul, a, k));
        body.push(OpCode::StoreCoeff {
            slot: Slot::Row(0),
            order: 0,
            value: r,
        });
        let module = IrModule {
            order: 0,
            n_entries: 4,
            n_params: 0,
            compact: true,
            blocks: vec![Block::Loop {
                body,
                rows: vec![
                    KernelRow {
                        slots: vec![2, 0],
                        literals: vec![3.0],
                    },
                    KernelRow {
                        slots: vec![3, 2],
                        literals: vec![-1.0],
                    },
                ],
            }],
        };
        let f = <VmBackend as JitBackend<f64>>::build_function(&VmBackend, &module).unwrap();
        let mut tape = vec![2.0, 0.0, 0.0, 0.0];
        f.call(&mut tape, &[], 0.0);
        assert_eq!(tape, vec![2.0, 0.0, 6.0, -6.0]);
    }

    #[test]
    fn malformed_modules_are_rejected() {
        let mut module = straight_module();
        if let Block::Straight(code) = &mut module.blocks[0] {
            code.ops[1] = OpCode::Unary(UnaryFn::Sin, 5);
        }
        assert_err_contains(
            <VmBackend as JitBackend<f64>>::build_function(&VmBackend, &module).map(|_| ()),
            "malformed IR",
        );

        let mut module = straight_module();
        module.n_params = 0;
        assert!(module.validate().is_err());

        let mut module = straight_module();
        if let Block::Straight(code) = &mut module.blocks[0] {
            code.ops[0] = OpCode::LoadCoeff {
                slot: Slot::Row(0),
                order: 0,
            };
        }
        assert!(module.validate().is_err());
    }

    #[test]
    fn dump_uses_policy_spelling() {
        let module = straight_module();
        let text64 = module.dump::<f64>();
        assert!(text64.contains("%1 = call sin(%0)"));
        assert!(text64.contains("binary64"));
        let text32 = module.dump::<f32>();
        assert!(text32.contains("%1 = call sinf(%0)"));
    }
}
