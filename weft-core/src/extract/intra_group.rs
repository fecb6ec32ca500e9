//! Intra-group versions of a map.
//!
//! Every iteration of the map becomes one workgroup, and the SOACs at the top
//! of the map body become group-collective operations executed by the
//! threads of that group. This only makes sense when the inner parallelism
//! has the same size in every iteration.

use std::collections::HashSet;

use crate::error::Result;
use crate::first_order::{first_order_lambda, first_order_stms};
use crate::ir::free::bound_in_lambda;
use crate::ir::{
    BinOp, Body, Exp, GroupOp, Kernel, KernelBody, KernelInput, KernelResult, KernelSpace, Map, Op, Pat, PatElem, Reduce,
    Scan, SegLevel, Soac, Stm, StreamForm, SubExp, Type, VarId, body_has_soacs,
};

use super::ExtractCtx;

/// The largest inner width of the map body, if every inner width is
/// invariant to the map. Loops in the body are looked through.
fn intra_parallelism(
    ctx: &mut ExtractCtx,
    map: &Map,
    out: &mut Vec<Stm>,
) -> Result<Option<SubExp>> {
    let bound = bound_in_lambda(&map.lam);
    let mut widths = vec![];
    if !collect_widths(&map.lam.body.stms, &bound, &mut widths) {
        return Ok(None);
    }
    let Some((first, rest)) = widths.split_first() else {
        return Ok(None);
    };
    let mut max = first.clone();
    for w in rest {
        max = ctx.b.binop(out, "intra_par", BinOp::Max, max, w.clone())?;
    }
    Ok(Some(max))
}

/// False when some width is bound inside the map body.
fn collect_widths(stms: &[Stm], bound: &HashSet<VarId>, widths: &mut Vec<SubExp>) -> bool {
    for stm in stms {
        match &stm.exp {
            Exp::Op(Op::Soac(soac)) => {
                let w = soac.width();
                if w.var().is_some_and(|v| bound.contains(&v)) {
                    return false;
                }
                if !widths.contains(w) {
                    widths.push(w.clone());
                }
            }
            Exp::Loop { body, .. } => {
                if !collect_widths(&body.stms, bound, widths) {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

/// Turn the SOACs at the top of a group body, or in loops there, into group
/// operations.
fn group_stm(ctx: &mut ExtractCtx, stm: Stm, out: &mut Vec<Stm>) -> Result<()> {
    let Stm { pat, certs, exp } = stm;
    let soac = match exp {
        Exp::Op(Op::Soac(soac)) => soac,
        Exp::Loop { merge, form, body } if body_has_soacs(&body) => {
            let mut loop_stms = vec![];
            for stm in body.stms {
                group_stm(ctx, stm, &mut loop_stms)?;
            }
            let exp = Exp::Loop {
                merge,
                form,
                body: Body::new(loop_stms, body.result),
            };
            out.push(Stm { pat, certs, exp });
            return Ok(());
        }
        exp => {
            out.extend(first_order_stms(&mut ctx.b, vec![Stm { pat, certs, exp }])?);
            return Ok(());
        }
    };
    let b = &mut ctx.b;
    match soac {
        Soac::Map(m) => {
            let lam = first_order_lambda(b, m.lam)?;
            out.push(Stm::new(pat, Exp::Op(Op::Group(GroupOp::Map(Map { lam, ..m })))));
        }
        Soac::Reduce(r) => {
            let lam = first_order_lambda(b, r.lam)?;
            out.push(Stm::new(pat, Exp::Op(Op::Group(GroupOp::Reduce(Reduce { lam, ..r })))));
        }
        Soac::Scan(s) => {
            let lam = first_order_lambda(b, s.lam)?;
            out.push(Stm::new(pat, Exp::Op(Op::Group(GroupOp::Scan(Scan { lam, ..s })))));
        }
        Soac::Redomap(r) => {
            let n = r.nes.len();
            let map_lam = first_order_lambda(b, r.map_lam)?;
            let to_reduce: Vec<PatElem> = map_lam.ret[..n]
                .iter()
                .map(|t| b.pat_elem("to_reduce", t.array_of(r.w.clone())))
                .collect();
            let mut map_vals = to_reduce.clone();
            map_vals.extend(pat.vals[n..].iter().cloned());
            out.push(Stm::new(
                Pat::new(map_vals),
                Exp::Op(Op::Group(GroupOp::Map(Map {
                    w: r.w.clone(),
                    lam: map_lam,
                    arrs: r.arrs,
                }))),
            ));
            let red_lam = first_order_lambda(b, r.red_lam)?;
            out.push(Stm::new(
                Pat::new(pat.vals[..n].to_vec()),
                Exp::Op(Op::Group(GroupOp::Reduce(Reduce {
                    w: r.w,
                    comm: r.comm,
                    lam: red_lam,
                    nes: r.nes,
                    arrs: to_reduce.iter().map(|pe| pe.var).collect(),
                }))),
            ));
        }
        Soac::Scanomap(s) => {
            let n = s.nes.len();
            let map_lam = first_order_lambda(b, s.map_lam)?;
            let to_scan: Vec<PatElem> = map_lam.ret[..n]
                .iter()
                .map(|t| b.pat_elem("to_scan", t.array_of(s.w.clone())))
                .collect();
            let mut map_vals = to_scan.clone();
            map_vals.extend(pat.vals[n..].iter().cloned());
            out.push(Stm::new(
                Pat::new(map_vals),
                Exp::Op(Op::Group(GroupOp::Map(Map {
                    w: s.w.clone(),
                    lam: map_lam,
                    arrs: s.arrs,
                }))),
            ));
            let scan_lam = first_order_lambda(b, s.scan_lam)?;
            out.push(Stm::new(
                Pat::new(pat.vals[..n].to_vec()),
                Exp::Op(Op::Group(GroupOp::Scan(Scan {
                    w: s.w,
                    lam: scan_lam,
                    nes: s.nes,
                    arrs: to_scan.iter().map(|pe| pe.var).collect(),
                }))),
            ));
        }
        Soac::Stream(s) if matches!(s.form, StreamForm::Parallel { .. }) => {
            let lam = first_order_lambda(b, s.lam.clone())?;
            out.push(Stm::new(
                pat,
                Exp::Op(Op::Group(GroupOp::Stream(crate::ir::Stream { lam, ..s }))),
            ));
        }
        soac => {
            let stm = Stm {
                pat,
                certs,
                exp: Exp::Op(Op::Soac(soac)),
            };
            out.extend(first_order_stms(b, vec![stm])?);
        }
    }
    Ok(())
}

/// A group-level kernel computing `map` with one workgroup per iteration.
/// Returns the kernel statements and the group size it needs, or `None`
/// when the inner parallelism varies between iterations.
pub fn intra_group_version(ctx: &mut ExtractCtx, pat: Pat, map: Map) -> Result<Option<(Vec<Stm>, SubExp)>> {
    let mut out = vec![];
    let Some(intra_par) = intra_parallelism(ctx, &map, &mut out)? else {
        return Ok(None);
    };
    let Map { w, lam, arrs } = map;
    let gid = ctx.b.param("gid", Type::i64()).var;
    let inputs = lam
        .params
        .into_iter()
        .zip(arrs)
        .map(|(param, arr)| KernelInput {
            param,
            arr,
            indices: vec![SubExp::Var(gid)],
        })
        .collect();
    let mut stms = vec![];
    for stm in lam.body.stms {
        group_stm(ctx, stm, &mut stms)?;
    }
    let kernel = Kernel {
        desc: "intra_group".to_string(),
        space: KernelSpace {
            level: SegLevel::Group,
            global_tid: gid,
            group_size: intra_par.clone(),
            num_groups: w.clone(),
            dims: vec![(gid, w)],
        },
        inputs,
        body: KernelBody {
            stms,
            results: lam.body.result.into_iter().map(KernelResult::Threads).collect(),
        },
        ret: lam.ret,
    };
    out.push(Stm::new(pat, Exp::Op(Op::Kernel(Box::new(kernel)))));
    ctx.log("built intra-group version".to_string());
    Ok(Some((out, intra_par)))
}
