//! Runtime size thresholds.
//!
//! Kernel versions are chosen at run time by comparing the amount of
//! available parallelism against tunable sizes. Every size gets a unique name
//! within the program so an autotuner can set it independently.

use indexmap::IndexMap;

use crate::error::Result;
use crate::ir::{Body, Exp, ExtType, Op, Pat, SizeClass, SizeOp, Stm, SubExp};

use super::ExtractCtx;

/// Bind the run-time value of a fresh size of class `class`.
pub fn get_size(ctx: &mut ExtractCtx, desc: &str, class: SizeClass, out: &mut Vec<Stm>) -> Result<SubExp> {
    let name = ctx.size_name(desc);
    ctx.b.bind_se(out, desc, Exp::Op(Op::Size(SizeOp::GetSize { name, class })))
}

/// `threshold <= what` for a fresh threshold: true when `what` is enough
/// parallelism to saturate the device.
pub fn sufficient_parallelism(ctx: &mut ExtractCtx, desc: &str, what: SubExp, out: &mut Vec<Stm>) -> Result<SubExp> {
    let name = ctx.size_name(desc);
    ctx.log(format!("size {name} guards {desc}"));
    ctx.b.bind_se(
        out,
        desc,
        Exp::Op(Op::Size(SizeOp::CmpSizeLe {
            name,
            class: SizeClass::Threshold,
            x: what,
        })),
    )
}

/// One guarded version of a computation.
#[derive(Debug)]
pub struct Alternative {
    /// Statements computing `cond`.
    pub cond_stms: Vec<Stm>,
    pub cond: SubExp,
    pub body: Body,
}

/// Bind `pat` to the first alternative whose condition holds, or to
/// `default` when none does. Conditions are evaluated in order and lazily.
pub fn kernel_alternatives(
    ctx: &mut ExtractCtx,
    pat: Pat,
    default: Body,
    alts: Vec<Alternative>,
) -> Vec<Stm> {
    let ret: Vec<ExtType> = pat.vals.iter().map(|pe| ExtType::from(pe.ty.clone())).collect();
    let mut else_body = default;
    let mut alts = alts;
    while let Some(alt) = alts.pop() {
        let is_first = alts.is_empty();
        let vals = if is_first {
            pat.vals.clone()
        } else {
            pat.vals.iter().map(|pe| ctx.b.fresh_like(pe)).collect()
        };
        let mut stms = alt.cond_stms;
        stms.push(Stm::new(
            Pat::new(vals.clone()),
            Exp::If {
                cond: alt.cond,
                then_body: alt.body,
                else_body,
                ret: ret.clone(),
            },
        ));
        if is_first {
            return stms;
        }
        else_body = Body::new(stms, vals.iter().map(|pe| SubExp::Var(pe.var)).collect());
    }
    // No alternatives: bind the default body's results directly.
    let mut stms = else_body.stms;
    for (pe, se) in pat.vals.into_iter().zip(else_body.result) {
        stms.push(Stm::new(Pat::new(vec![pe]), Exp::SubExp(se)));
    }
    stms
}

/// Every tunable size mentioned in the program, in program order.
pub fn collect_sizes(program: &crate::ir::Program) -> IndexMap<String, SizeClass> {
    let mut sizes = IndexMap::new();
    for fun in &program.funs {
        sizes_in_stms(&fun.body.stms, &mut sizes);
    }
    sizes
}

fn sizes_in_body(body: &Body, sizes: &mut IndexMap<String, SizeClass>) {
    sizes_in_stms(&body.stms, sizes);
}

fn sizes_in_stms(stms: &[Stm], sizes: &mut IndexMap<String, SizeClass>) {
    for stm in stms {
        match &stm.exp {
            Exp::Op(Op::Size(SizeOp::GetSize { name, class } | SizeOp::CmpSizeLe { name, class, .. })) => {
                sizes.entry(name.clone()).or_insert(*class);
            }
            Exp::If {
                then_body,
                else_body,
                ..
            } => {
                sizes_in_body(then_body, sizes);
                sizes_in_body(else_body, sizes);
            }
            Exp::Loop { body, .. } => sizes_in_body(body, sizes),
            Exp::Op(Op::Kernel(k)) => sizes_in_stms(&k.body.stms, sizes),
            _ => {}
        }
    }
}
