//! Lowering of an ODE decomposition into coefficient IR.
//!
//! The decomposition must come from [`decompose_ode`](crate::decomposition::decompose_ode):
//! the first `n_vars` outputs are the right-hand sides of the state
//! variables, so `x_k^[n] = f_k^[n-1] / n`. Output entries are not stored on
//! the tape; [`output_refs`] tells where to read them.
//!
//! Scalar mode unrolls every entry at every order. Compact mode groups the
//! entries of a level by operator shape and emits one kernel per group,
//! looped over the rows of the group.

use crate::decomposition::{u_index, TaylorDc};
use crate::equation_engine::{BinaryFn, Block, Bytecode, IrModule, KernelRow, OpCode, Slot, UnaryFn, ValueId};
use crate::error::{Error, Result};
use crate::expression::{Expression, Op};
use crate::recurrence::{coefficient, CoeffBuilder};
use crate::traits::{op_supported, FpPolicy};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Where the value of an output lives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OutputRef {
    Entry(usize),
    Number(f64),
}

pub fn output_refs(dc: &TaylorDc) -> Vec<OutputRef> {
    dc.outputs()
        .iter()
        .map(|o| match (u_index(&o.rhs), o.rhs.as_number()) {
            (Some(j), _) => OutputRef::Entry(j),
            (None, Some(v)) => OutputRef::Number(v),
            (None, None) => OutputRef::Number(f64::NAN),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Operand {
    Coeff(Slot),
    Literal(f64),
    RowLiteral(u8),
}

struct IrBuilder<'a> {
    code: &'a mut Bytecode,
    consts: HashMap<u64, ValueId>,
}

impl<'a> IrBuilder<'a> {
    fn new(code: &'a mut Bytecode) -> Self {
        Self {
            code,
            consts: HashMap::new(),
        }
    }

    fn store(&mut self, slot: Slot, order: u32, value: ValueId) {
        self.code.push(OpCode::StoreCoeff { slot, order, value });
    }
}

impl CoeffBuilder for IrBuilder<'_> {
    type Val = ValueId;
    type Ref = Operand;

    fn load(&mut self, r: Operand, order: u32) -> ValueId {
        match r {
            Operand::Coeff(slot) => self.code.push(OpCode::LoadCoeff { slot, order }),
            Operand::Literal(v) => self.constant(v),
            Operand::RowLiteral(k) => self.code.push(OpCode::LoadRowLiteral(k)),
        }
    }

    fn is_constant(&self, r: Operand) -> bool {
        !matches!(r, Operand::Coeff(_))
    }

    fn constant(&mut self, value: f64) -> ValueId {
        if let Some(&v) = self.consts.get(&value.to_bits()) {
            return v;
        }
        let v = self.code.push(OpCode::LoadConst(value));
        self.consts.insert(value.to_bits(), v);
        v
    }

    fn unary(&mut self, f: UnaryFn, a: ValueId) -> ValueId {
        self.code.push(OpCode::Unary(f, a))
    }

    fn binary(&mut self, f: BinaryFn, a: ValueId, b: ValueId) -> ValueId {
        self.code.push(OpCode::Binary(f, a, b))
    }
}

fn fixed(i: usize) -> Slot {
    Slot::Fixed(i as u32)
}

fn operand(arg: &Expression) -> Operand {
    match u_index(arg) {
        Some(j) => Operand::Coeff(fixed(j)),
        None => Operand::Literal(arg.as_number().unwrap_or(f64::NAN)),
    }
}

/// Lowers `dc` into IR computing orders `0..=order`.
pub fn emit<T: FpPolicy>(dc: &TaylorDc, order: u32, compact: bool) -> Result<IrModule> {
    let n_state = dc.n_vars();
    if dc.n_outputs() < n_state {
        return Err(Error::InvalidInput(format!(
            "a decomposition with {} variables needs at least as many outputs, got {}",
            n_state,
            dc.n_outputs()
        )));
    }
    for i in dc.functions() {
        if let Some(op) = dc.entries()[i].op() {
            if !op_supported(T::KIND, op) {
                return Err(Error::UnsupportedOperation(format!(
                    "the operator '{}' is not available for {} scalars",
                    op.name(),
                    T::name()
                )));
            }
        }
    }

    let outputs = output_refs(dc);
    let levels = dc.levels();
    let mut blocks = Vec::new();
    for n in 0..=order {
        let mut code = Bytecode::new();
        {
            let mut b = IrBuilder::new(&mut code);
            emit_prefix(&mut b, dc, &outputs, n);
            if !compact {
                for i in dc.functions() {
                    emit_entry(&mut b, dc, i, n)?;
                }
            } else if let Some(t) = dc.functions().find(|&i| dc.entries()[i].rhs == Expression::Time) {
                emit_entry(&mut b, dc, t, n)?;
            }
        }
        blocks.push(Block::Straight(code));
        if compact {
            blocks.extend(emit_kernels(dc, &levels, n)?);
        }
    }

    let module = IrModule {
        order,
        n_entries: dc.functions().end as u32,
        n_params: dc.params().iter().map(|p| p.index() + 1).max().unwrap_or(0),
        compact,
        blocks,
    };
    debug!(
        "emitted {} IR: order {}, {} blocks, {} instructions",
        if compact { "compact" } else { "scalar" },
        order,
        module.blocks.len(),
        module.n_instructions()
    );
    Ok(module)
}

/// State coefficients from the outputs of the previous order, parameters.
fn emit_prefix(b: &mut IrBuilder<'_>, dc: &TaylorDc, outputs: &[OutputRef], n: u32) {
    if n > 0 {
        for (k, out) in outputs.iter().take(dc.n_vars()).enumerate() {
            let v = match *out {
                OutputRef::Entry(j) => {
                    let prev = b.load(Operand::Coeff(fixed(j)), n - 1);
                    let inv = b.constant(1.0 / n as f64);
                    b.binary(BinaryFn::Mul, inv, prev)
                }
                OutputRef::Number(c) if n == 1 => b.constant(c),
                OutputRef::Number(_) => b.constant(0.0),
            };
            b.store(fixed(k), n, v);
        }
    }
    for (k, p) in dc.params().iter().enumerate() {
        let v = if n == 0 {
            b.code.push(OpCode::LoadParam(p.index()))
        } else {
            b.constant(0.0)
        };
        b.store(fixed(dc.n_vars() + k), n, v);
    }
}

fn emit_entry(b: &mut IrBuilder<'_>, dc: &TaylorDc, i: usize, n: u32) -> Result<()> {
    let entry = &dc.entries()[i];
    let v = match &entry.rhs {
        Expression::Time => match n {
            0 => b.code.push(OpCode::LoadTime),
            1 => b.constant(1.0),
            _ => b.constant(0.0),
        },
        Expression::Func(f) => {
            let args: Vec<Operand> = f.args().iter().map(operand).collect();
            let hidden: Vec<Operand> = entry.hidden.iter().map(|&h| Operand::Coeff(fixed(h))).collect();
            coefficient(b, f.op(), Operand::Coeff(fixed(i)), &args, &hidden, n)?
        }
        other => {
            return Err(Error::InvalidInput(format!(
                "entry {i} ('{other}') cannot be lowered"
            )))
        }
    };
    b.store(fixed(i), n, v);
    Ok(())
}

/// Shape shared by the rows of one kernel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct KernelClass {
    op: Op,
    /// `true` for literal arguments.
    literal_args: Vec<bool>,
    n_hidden: usize,
}

fn emit_kernels(dc: &TaylorDc, levels: &[usize], n: u32) -> Result<Vec<Block>> {
    let mut groups: BTreeMap<(usize, KernelClass), Vec<usize>> = BTreeMap::new();
    for i in dc.functions() {
        let entry = &dc.entries()[i];
        let Expression::Func(f) = &entry.rhs else { continue };
        let class = KernelClass {
            op: f.op(),
            literal_args: f.args().iter().map(|a| u_index(a).is_none()).collect(),
            n_hidden: entry.hidden.len(),
        };
        groups.entry((levels[i], class)).or_default().push(i);
    }

    let mut blocks = Vec::with_capacity(groups.len());
    for ((_, class), members) in groups {
        let n_slots = 1 + class.literal_args.iter().filter(|l| !**l).count() + class.n_hidden;
        if n_slots > u8::MAX as usize || class.literal_args.len() > u8::MAX as usize {
            return Err(Error::InvalidInput(format!(
                "operator '{}' with {} arguments exceeds the compact kernel width",
                class.op.name(),
                class.literal_args.len()
            )));
        }

        let mut args = Vec::with_capacity(class.literal_args.len());
        let (mut next_slot, mut next_lit) = (1u8, 0u8);
        for &literal in &class.literal_args {
            if literal {
                args.push(Operand::RowLiteral(next_lit));
                next_lit += 1;
            } else {
                args.push(Operand::Coeff(Slot::Row(next_slot)));
                next_slot += 1;
            }
        }
        let hidden: Vec<Operand> = (0..class.n_hidden)
            .map(|k| Operand::Coeff(Slot::Row(next_slot + k as u8)))
            .collect();

        let mut body = Bytecode::new();
        {
            let mut b = IrBuilder::new(&mut body);
            let this = Operand::Coeff(Slot::Row(0));
            let v = coefficient(&mut b, class.op, this, &args, &hidden, n)?;
            b.store(Slot::Row(0), n, v);
        }

        let rows = members
            .iter()
            .map(|&i| {
                let entry = &dc.entries()[i];
                let mut slots = vec![i as u32];
                let mut literals = Vec::new();
                if let Expression::Func(f) = &entry.rhs {
                    for a in f.args() {
                        match u_index(a) {
                            Some(j) => slots.push(j as u32),
                            None => literals.push(a.as_number().unwrap_or(f64::NAN)),
                        }
                    }
                }
                slots.extend(entry.hidden.iter().map(|&h| h as u32));
                KernelRow { slots, literals }
            })
            .collect();
        blocks.push(Block::Loop { body, rows });
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposition::{decompose_ode, DecomposeOptions};
    use crate::equation_engine::{JitBackend, VmBackend};
    use crate::expression::{cos, exp, kep_e, make_vars, par, sin, square, time};
    use crate::ode::OdeSys;
    use crate::traits::DynamicalSystem;
    use approx::assert_relative_eq;

    fn run(dc: &TaylorDc, order: u32, compact: bool, x0: &[f64], pars: &[f64], t: f64) -> Vec<f64> {
        let module = emit::<f64>(dc, order, compact).unwrap();
        let f = <VmBackend as JitBackend<f64>>::build_function(&VmBackend, &module).unwrap();
        let mut tape = vec![0.0; module.tape_len()];
        tape[..x0.len()].copy_from_slice(x0);
        f.call(&mut tape, pars, t);
        tape
    }

    fn mixed_system() -> OdeSys {
        let [x, y, z] = make_vars(["x", "y", "z"]).unwrap();
        OdeSys::new(vec![
            (x.clone(), y.clone() * z.clone() + sin(x.clone()) * par(0)),
            (y.clone(), -x.clone() * z.clone() + cos(y.clone()) + time()),
            (z.clone(), exp(-square(z.clone())) - sin(y.clone()) * cos(x.clone()) + 2.0),
        ])
        .unwrap()
    }

    #[test]
    fn first_order_coefficients_match_the_vector_field() {
        let sys = mixed_system();
        let dc = decompose_ode(&sys, &[], &DecomposeOptions::default()).unwrap();
        let x0 = [0.3, -0.2, 0.9];
        let pars = [1.7];
        let tape = run(&dc, 4, false, &x0, &pars, 0.25);
        let n = dc.functions().end;

        let mut f = [0.0; 3];
        sys.evaluator(&pars).apply(0.25, &x0, &mut f);
        for k in 0..3 {
            assert_relative_eq!(tape[n + k], f[k], max_relative = 1e-14);
        }
    }

    #[test]
    fn compact_and_scalar_modes_agree() {
        let sys = mixed_system();
        let dc = decompose_ode(&sys, &[], &DecomposeOptions::default()).unwrap();
        let x0 = [0.3, -0.2, 0.9];
        let scalar = run(&dc, 12, false, &x0, &[1.7], 0.5);
        let compact = run(&dc, 12, true, &x0, &[1.7], 0.5);
        assert_eq!(scalar.len(), compact.len());
        for (a, b) in scalar.iter().zip(&compact) {
            assert_relative_eq!(*a, *b, max_relative = 1e-13, epsilon = 1e-300);
        }
    }

    #[test]
    fn harmonic_oscillator_coefficients() {
        let [x, v] = make_vars(["x", "v"]).unwrap();
        let sys = OdeSys::new(vec![(x.clone(), v.clone()), (v, -x)]).unwrap();
        let dc = decompose_ode(&sys, &[], &DecomposeOptions::default()).unwrap();
        let tape = run(&dc, 8, false, &[1.0, 0.0], &[], 0.0);
        let n = dc.functions().end;
        // x(t) = cos t
        let expected = [1.0, 0.0, -0.5, 0.0, 1.0 / 24.0, 0.0, -1.0 / 720.0, 0.0, 1.0 / 40320.0];
        for (k, e) in expected.iter().enumerate() {
            assert_relative_eq!(tape[k * n], *e, epsilon = 1e-15);
        }
    }

    #[test]
    fn constant_right_hand_sides_are_supported() {
        let [x, y] = make_vars(["x", "y"]).unwrap();
        let sys = OdeSys::new(vec![(x.clone(), 2.0.into()), (y, x)]).unwrap();
        let dc = decompose_ode(&sys, &[], &DecomposeOptions::default()).unwrap();
        let tape = run(&dc, 3, false, &[1.0, 0.0], &[], 0.0);
        let n = dc.functions().end;
        assert_eq!(tape[n], 2.0);
        assert_eq!(tape[2 * n], 0.0);
        assert_eq!(tape[2 * n + 1], 1.0);
    }

    #[test]
    fn unsupported_operators_are_reported_per_policy() {
        let [x] = make_vars(["x"]).unwrap();
        let sys = OdeSys::new(vec![(x.clone(), kep_e(0.1.into(), x))]).unwrap();
        let dc = decompose_ode(&sys, &[], &DecomposeOptions::default()).unwrap();
        assert!(emit::<f64>(&dc, 5, false).is_ok());
        let err = emit::<f32>(&dc, 5, false).unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(_)));
        assert!(format!("{err}").contains("binary32"));
    }
}
