//! Segmented operations.
//!
//! A SOAC nested inside a kernel nest runs once per point of the nest, each
//! time over one segment of the flattened input. These builders express such
//! a nest as a single regular operation over all segments at once: the
//! inputs are reshaped to `[nesting_size * w]`, a flag marks the first
//! element of each segment, and the results are reshaped back.
//!
//! All builders return `None` when the operation cannot be flattened, which
//! is the case when its operator or width depends on the nest, or when an
//! input does not vary along every level of the nest.

use std::collections::HashSet;

use crate::error::Result;
use crate::ir::free::free_in_lambda;
use crate::ir::{
    BinOp, Body, CmpOp, DimIndex, Exp, ExtType, Lambda, Pat, PatElem, PrimType, Redomap, Scanomap, Scatter,
    Shape, Stm, SubExp, Type, VarId,
};

use super::ExtractCtx;
use super::blocked::{blocked_scan, scatter_kernel};
use super::distribution::{KernelNest, thread_kernel};

fn invariant(se: &SubExp, bound: &HashSet<VarId>) -> bool {
    se.var().is_none_or(|v| !bound.contains(&v))
}

fn invariant_lambda(lam: &Lambda, bound: &HashSet<VarId>) -> bool {
    free_in_lambda(lam).is_disjoint(bound)
}

/// The top-level arrays holding every segment of `arrs`.
fn segment_sources(nest: &KernelNest, arrs: &[VarId]) -> Option<Vec<VarId>> {
    arrs.iter().map(|arr| nest.full_input(*arr)).collect()
}

/// Reshape a `[w_0]..[w_d][n]t` array into `[total]t`.
fn flatten_segments(
    ctx: &mut ExtractCtx,
    nest: &KernelNest,
    arr: VarId,
    total: &SubExp,
    out: &mut Vec<Stm>,
) -> Result<VarId> {
    let ty = ctx.b.type_of(arr)?;
    let mut dims = vec![total.clone()];
    dims.extend(ty.dims().iter().skip(nest.depth() + 1).cloned());
    ctx.b.bind(
        out,
        "flat",
        Exp::Reshape {
            shape: Shape(dims),
            arr,
        },
    )
}

/// Bind `pe` to `flat` reshaped to the type of `pe`.
fn unflatten_into(pe: PatElem, flat: VarId, out: &mut Vec<Stm>) {
    let shape = Shape(pe.ty.dims().to_vec());
    out.push(Stm::new(Pat::new(vec![pe]), Exp::Reshape { shape, arr: flat }));
}

/// `\idx xs.. -> (idx % w == 0, map_lam xs..)`.
fn flagging_lambda(ctx: &mut ExtractCtx, map_lam: Lambda, w: &SubExp) -> Result<Lambda> {
    let idx = ctx.b.param("idx", Type::i64());
    let mut stms = vec![];
    let in_segment = ctx
        .b
        .bind_se(&mut stms, "in_segment", Exp::BinOp(BinOp::Mod, SubExp::Var(idx.var), w.clone()))?;
    let flag = ctx
        .b
        .bind_se(&mut stms, "segment_start", Exp::CmpOp(CmpOp::Eq, in_segment, SubExp::i64(0)))?;
    stms.extend(map_lam.body.stms);
    let mut result = vec![flag];
    result.extend(map_lam.body.result);
    let mut params = vec![idx];
    params.extend(map_lam.params);
    let mut ret = vec![Type::bool()];
    ret.extend(map_lam.ret);
    Ok(Lambda {
        params,
        body: Body::new(stms, result),
        ret,
    })
}

/// Lift `op` to flagged values: `(f1, a) (f2, b) -> (f1 || f2, if f2 then b
/// else op a b)`. The result restarts at every set flag.
fn segmented_operator(ctx: &mut ExtractCtx, op: Lambda) -> Result<Lambda> {
    let n = op.ret.len();
    let f1 = ctx.b.param("flag_x", Type::bool());
    let f2 = ctx.b.param("flag_y", Type::bool());
    let ys: Vec<SubExp> = op.params[n..].iter().map(|p| SubExp::Var(p.var)).collect();
    let mut stms = vec![];
    let flag = ctx.b.bind_se(
        &mut stms,
        "flag",
        Exp::BinOp(BinOp::Or, SubExp::Var(f1.var), SubExp::Var(f2.var)),
    )?;
    let vals = ctx.b.bind_multi(
        &mut stms,
        "seg_res",
        Exp::If {
            cond: SubExp::Var(f2.var),
            then_body: Body::new(vec![], ys),
            else_body: op.body,
            ret: op.ret.iter().cloned().map(ExtType::from).collect(),
        },
    )?;
    let mut params = vec![f1];
    params.extend(op.params[..n].iter().cloned());
    params.push(f2);
    params.extend(op.params[n..].iter().cloned());
    let mut result = vec![flag];
    result.extend(vals.into_iter().map(SubExp::Var));
    let mut ret = vec![Type::bool()];
    ret.extend(op.ret);
    Ok(Lambda {
        params,
        body: Body::new(stms, result),
        ret,
    })
}

/// Flattened scan over all segments. Returns the `[total]` scanned and
/// mapped arrays together with the number of segments.
#[allow(clippy::too_many_arguments)]
fn flat_segmented_scan(
    ctx: &mut ExtractCtx,
    nest: &KernelNest,
    sources: Vec<VarId>,
    w: &SubExp,
    op: Lambda,
    map_lam: Lambda,
    nes: Vec<SubExp>,
    out: &mut Vec<Stm>,
) -> Result<(SubExp, Vec<PatElem>)> {
    let nesting_size = ctx.b.product(out, "nesting_size", &nest.widths())?;
    let total = ctx.b.binop(out, "flat_size", BinOp::Mul, nesting_size.clone(), w.clone())?;
    let iota = ctx.b.bind(out, "flat_idx", Exp::Iota { n: total.clone() })?;
    let mut arrs = vec![iota];
    for src in sources {
        arrs.push(flatten_segments(ctx, nest, src, &total, out)?);
    }

    let map_lam = flagging_lambda(ctx, map_lam, w)?;
    let scan_lam = segmented_operator(ctx, op)?;
    let vals: Vec<PatElem> = map_lam
        .ret
        .iter()
        .map(|t| ctx.b.pat_elem("seg_flat", t.array_of(total.clone())))
        .collect();
    let mut flagged_nes = vec![SubExp::bool(false)];
    flagged_nes.extend(nes);
    let scanomap = Scanomap {
        w: total,
        scan_lam,
        map_lam,
        nes: flagged_nes,
        arrs,
    };
    out.extend(blocked_scan(ctx, Pat::new(vals.clone()), scanomap)?);
    // Drop the flags.
    Ok((nesting_size, vals[1..].to_vec()))
}

/// A scan (fused with a map) once per point of `nest`.
pub fn segmented_scanomap(
    ctx: &mut ExtractCtx,
    nest: &KernelNest,
    bound: &HashSet<VarId>,
    declared: Vec<PatElem>,
    scanomap: Scanomap,
) -> Result<Option<Vec<Stm>>> {
    let Scanomap {
        w,
        scan_lam,
        map_lam,
        nes,
        arrs,
    } = scanomap;
    if !invariant(&w, bound)
        || !invariant_lambda(&scan_lam, bound)
        || !invariant_lambda(&map_lam, bound)
        || !nes.iter().all(|ne| invariant(ne, bound))
    {
        return Ok(None);
    }
    let Some(sources) = segment_sources(nest, &arrs) else {
        return Ok(None);
    };
    let mut out = vec![];
    let (_, flat) = flat_segmented_scan(ctx, nest, sources, &w, scan_lam, map_lam, nes, &mut out)?;
    for (pe, flat) in declared.into_iter().zip(flat) {
        unflatten_into(pe, flat.var, &mut out);
    }
    ctx.log(format!("segmented scan over {} levels", nest.depth()));
    Ok(Some(out))
}

/// A reduction (fused with a map) once per point of `nest`: a segmented scan
/// followed by reading the last element of every segment.
pub fn segmented_redomap(
    ctx: &mut ExtractCtx,
    nest: &KernelNest,
    bound: &HashSet<VarId>,
    declared: Vec<PatElem>,
    redomap: Redomap,
) -> Result<Option<Vec<Stm>>> {
    let Redomap {
        w,
        red_lam,
        map_lam,
        nes,
        arrs,
        ..
    } = redomap;
    if !invariant(&w, bound)
        || !invariant_lambda(&red_lam, bound)
        || !invariant_lambda(&map_lam, bound)
        || !nes.iter().all(|ne| invariant(ne, bound))
    {
        return Ok(None);
    }
    let Some(sources) = segment_sources(nest, &arrs) else {
        return Ok(None);
    };
    let n = nes.len();
    let red_tys = red_lam.ret.clone();
    let mut out = vec![];
    let (nesting_size, flat) =
        flat_segmented_scan(ctx, nest, sources, &w, red_lam, map_lam, nes.clone(), &mut out)?;
    let (scanned, mapped) = flat.split_at(n);

    // Last element of every segment, or the neutral element of an empty one.
    let seg = ctx.b.param("gtid", Type::i64()).var;
    let mut body = vec![];
    let empty = ctx.b.bind_se(&mut body, "empty", Exp::CmpOp(CmpOp::Eq, w.clone(), SubExp::i64(0)))?;
    let mut last_stms = vec![];
    let start = ctx.b.binop(&mut last_stms, "seg_start", BinOp::Mul, SubExp::Var(seg), w.clone())?;
    let end = ctx.b.binop(&mut last_stms, "seg_end", BinOp::Add, start, w.clone())?;
    let last = ctx.b.binop(&mut last_stms, "seg_last", BinOp::Sub, end, SubExp::i64(1))?;
    let mut lasts = vec![];
    for pe in scanned {
        lasts.push(ctx.b.bind_se(
            &mut last_stms,
            "seg_red",
            Exp::Index {
                arr: pe.var,
                slice: vec![DimIndex::Fix(last.clone())],
            },
        )?);
    }
    let reds = ctx.b.bind_multi(
        &mut body,
        "seg_red",
        Exp::If {
            cond: empty,
            then_body: Body::new(vec![], nes),
            else_body: Body::new(last_stms, lasts),
            ret: red_tys.iter().cloned().map(ExtType::from).collect(),
        },
    )?;
    let kernel = thread_kernel(
        ctx,
        &mut out,
        "segred_gather",
        nesting_size.clone(),
        vec![(seg, nesting_size)],
        vec![],
        body,
        reds.into_iter().map(SubExp::Var).collect(),
        red_tys,
    )?;
    let gathered = ctx.b.bind_multi(&mut out, "seg_red", kernel)?;

    let flat_results = gathered.into_iter().chain(mapped.iter().map(|pe| pe.var));
    for (pe, flat) in declared.into_iter().zip(flat_results) {
        unflatten_into(pe, flat, &mut out);
    }
    ctx.log(format!("segmented reduction over {} levels", nest.depth()));
    Ok(Some(out))
}

/// A scatter once per point of `nest`, writing into one row of each
/// destination per point.
pub fn segmented_scatter(
    ctx: &mut ExtractCtx,
    nest: &KernelNest,
    bound: &HashSet<VarId>,
    declared: Vec<PatElem>,
    scatter: Scatter,
) -> Result<Option<Vec<Stm>>> {
    let Scatter { w, lam, arrs, dests } = scatter;
    if !invariant(&w, bound)
        || !invariant_lambda(&lam, bound)
        || !dests.iter().all(|(dw, _)| invariant(dw, bound))
    {
        return Ok(None);
    }
    let Some(sources) = segment_sources(nest, &arrs) else {
        return Ok(None);
    };
    let dest_arrs: Vec<VarId> = dests.iter().map(|(_, d)| *d).collect();
    let Some(dest_sources) = segment_sources(nest, &dest_arrs) else {
        return Ok(None);
    };
    let k = dests.len();
    let mut out = vec![];
    let nesting_size = ctx.b.product(&mut out, "nesting_size", &nest.widths())?;
    let total = ctx.b.binop(&mut out, "flat_size", BinOp::Mul, nesting_size.clone(), w.clone())?;
    let iota = ctx.b.bind(&mut out, "flat_idx", Exp::Iota { n: total.clone() })?;
    let mut flat_arrs = vec![iota];
    for src in sources {
        flat_arrs.push(flatten_segments(ctx, nest, src, &total, &mut out)?);
    }
    let mut flat_dests = vec![];
    for ((dw, _), src) in dests.iter().zip(dest_sources) {
        let dest_total = ctx.b.binop(&mut out, "flat_dest_size", BinOp::Mul, nesting_size.clone(), dw.clone())?;
        let flat = flatten_segments(ctx, nest, src, &dest_total, &mut out)?;
        flat_dests.push((dest_total, flat));
    }

    // Translate each segment-local index into the flattened destination.
    let idx = ctx.b.param("idx", Type::i64());
    let mut stms = vec![];
    let seg = ctx.b.binop(&mut stms, "segment", BinOp::Div, SubExp::Var(idx.var), w.clone())?;
    stms.extend(lam.body.stms);
    let res = lam.body.result;
    let mut result = vec![];
    for (j, (dw, _)) in dests.iter().enumerate() {
        let i = res[j].clone();
        let lower = ctx.b.bind_se(&mut stms, "lower_ok", Exp::CmpOp(CmpOp::Le, SubExp::i64(0), i.clone()))?;
        let upper = ctx.b.bind_se(&mut stms, "upper_ok", Exp::CmpOp(CmpOp::Lt, i.clone(), dw.clone()))?;
        let ok = ctx.b.bind_se(&mut stms, "in_bounds", Exp::BinOp(BinOp::And, lower, upper))?;
        let mut offset_stms = vec![];
        let base = ctx.b.binop(&mut offset_stms, "seg_offset", BinOp::Mul, seg.clone(), dw.clone())?;
        let flat_i = ctx.b.binop(&mut offset_stms, "flat_index", BinOp::Add, base, i)?;
        result.push(ctx.b.bind_se(
            &mut stms,
            "flat_index",
            Exp::If {
                cond: ok,
                then_body: Body::new(offset_stms, vec![flat_i]),
                else_body: Body::new(vec![], vec![SubExp::i64(-1)]),
                ret: vec![ExtType::Prim(PrimType::I64)],
            },
        )?);
    }
    result.extend(res[k..].iter().cloned());
    let mut params = vec![idx];
    params.extend(lam.params);
    let mut ret = vec![Type::i64(); k];
    ret.extend(lam.ret[k..].iter().cloned());
    let flat_lam = Lambda {
        params,
        body: Body::new(stms, result),
        ret,
    };

    let mut vals = vec![];
    for (_, flat) in &flat_dests {
        let ty = ctx.b.type_of(*flat)?;
        vals.push(ctx.b.pat_elem("seg_scatter", ty));
    }
    let flat_scatter = Scatter {
        w: total,
        lam: flat_lam,
        arrs: flat_arrs,
        dests: flat_dests,
    };
    out.extend(scatter_kernel(ctx, Pat::new(vals.clone()), flat_scatter)?);
    for (pe, flat) in declared.into_iter().zip(vals) {
        unflatten_into(pe, flat.var, &mut out);
    }
    ctx.log(format!("segmented scatter over {} levels", nest.depth()));
    Ok(Some(out))
}

/// Array operations applied once per point of `nest` become one operation
/// on the outer arrays, shifted past the nest dimensions.
pub fn segmented_array_op(
    nest: &KernelNest,
    bound: &HashSet<VarId>,
    declared: Vec<PatElem>,
    exp: &Exp,
) -> Option<Vec<Stm>> {
    let depth = nest.depth();
    let lifted = match exp {
        Exp::Rearrange { perm, arr } => {
            let mut outer: Vec<usize> = (0..depth).collect();
            outer.extend(perm.iter().map(|p| p + depth));
            Exp::Rearrange {
                perm: outer,
                arr: nest.full_input(*arr)?,
            }
        }
        Exp::Reshape { shape, arr } => {
            if !shape.dims().iter().all(|d| invariant(d, bound)) {
                return None;
            }
            let mut dims = nest.widths();
            dims.extend(shape.dims().iter().cloned());
            Exp::Reshape {
                shape: Shape(dims),
                arr: nest.full_input(*arr)?,
            }
        }
        Exp::Copy(arr) => Exp::Copy(nest.full_input(*arr)?),
        Exp::Concat { dim, arrs, w } => {
            if !invariant(w, bound) {
                return None;
            }
            Exp::Concat {
                dim: dim + depth,
                arrs: segment_sources(nest, arrs)?,
                w: w.clone(),
            }
        }
        _ => return None,
    };
    Some(vec![Stm::new(Pat::new(declared), lifted)])
}
