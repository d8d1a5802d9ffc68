use super::{u_index, TaylorDc};
use crate::error::{Error, Result};
use crate::expression::{Expression, Func};

fn broken(message: String) -> Error {
    Error::InvalidInput(format!("inconsistent decomposition: {message}"))
}

pub(super) fn reconstruct(dc: &TaylorDc) -> Vec<Expression> {
    let n = dc.entries.len();
    let mut built: Vec<Expression> = Vec::with_capacity(n);
    for entry in &dc.entries {
        let e = match &entry.rhs {
            Expression::Func(f) => Expression::Func(Func::new_unchecked(
                f.op(),
                f.args()
                    .iter()
                    .map(|a| match u_index(a) {
                        Some(j) => built[j].clone(),
                        None => a.clone(),
                    })
                    .collect(),
            )),
            other => match u_index(other) {
                Some(j) => built[j].clone(),
                None => other.clone(),
            },
        };
        built.push(e);
    }
    built.split_off(n - dc.n_outputs)
}

pub(super) fn verify(dc: &TaylorDc, originals: &[Expression]) -> Result<()> {
    let n = dc.entries.len();
    let n_prefix = dc.n_prefix();
    if n < n_prefix + dc.n_outputs {
        return Err(broken(format!("{n} entries cannot hold the prefix and outputs")));
    }
    let functions = dc.functions();

    for (i, entry) in dc.entries[..n_prefix].iter().enumerate() {
        let expected = if i < dc.variables.len() {
            Expression::Variable(dc.variables[i].clone())
        } else {
            Expression::Param(dc.params[i - dc.variables.len()])
        };
        if entry.rhs != expected {
            return Err(broken(format!("prefix entry {i} is '{}'", entry.rhs)));
        }
    }

    for i in functions.clone() {
        let entry = &dc.entries[i];
        match &entry.rhs {
            Expression::Time => {}
            Expression::Func(f) => {
                for a in f.args() {
                    match u_index(a) {
                        Some(j) if j < i => {}
                        Some(j) => {
                            return Err(broken(format!("entry {i} refers forward to u_{j}")))
                        }
                        None if a.is_number() => {}
                        None => return Err(broken(format!("entry {i} has the argument '{a}'"))),
                    }
                }
            }
            other => return Err(broken(format!("entry {i} is '{other}'"))),
        }
        if let Some(h) = entry.hidden.iter().find(|h| !functions.contains(*h) || **h == i) {
            return Err(broken(format!("entry {i} has the hidden dependency {h}")));
        }
    }

    for (k, entry) in dc.outputs().iter().enumerate() {
        match u_index(&entry.rhs) {
            Some(j) if j < functions.end => {}
            None if entry.rhs.is_number() => {}
            _ => return Err(broken(format!("output {k} is '{}'", entry.rhs))),
        }
    }

    let rebuilt = reconstruct(dc);
    if rebuilt.len() != originals.len() {
        return Err(broken(format!(
            "{} outputs for {} expressions",
            rebuilt.len(),
            originals.len()
        )));
    }
    for (k, (r, o)) in rebuilt.iter().zip(originals).enumerate() {
        if r.structural_hash() != o.structural_hash() {
            return Err(broken(format!("output {k} expands to '{r}' instead of '{o}'")));
        }
    }
    Ok(())
}
