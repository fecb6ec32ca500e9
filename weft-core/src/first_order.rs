//! First-order transform.
//!
//! Turns every SOAC into an equivalent sequential `Loop`. This is the
//! fallback of kernel extraction: kernel bodies, and any statement that
//! cannot be distributed, end up here. Results of maps and scans are built
//! by writing rows into `Scratch` arrays with `Update`.

use crate::error::Result;
use crate::ir::builder::IrBuilder;
use crate::ir::{
    BinOp, Body, CmpOp, DimIndex, Exp, ExtType, GroupOp, Lambda, LoopForm, Map, Op, Param, Pat, PatElem,
    Reduce, Redomap, Scan, Scanomap, Scatter, Shape, Soac, Stm, Stream, SubExp, Type, VarId, WithLoop,
};
use crate::bail_internal;

pub fn first_order_body(b: &mut IrBuilder, body: Body) -> Result<Body> {
    Ok(Body {
        stms: first_order_stms(b, body.stms)?,
        result: body.result,
    })
}

pub fn first_order_stms(b: &mut IrBuilder, stms: Vec<Stm>) -> Result<Vec<Stm>> {
    let mut out = Vec::with_capacity(stms.len());
    for stm in stms {
        first_order_stm(b, stm, &mut out)?;
    }
    Ok(out)
}

pub fn first_order_lambda(b: &mut IrBuilder, lam: Lambda) -> Result<Lambda> {
    Ok(Lambda {
        body: first_order_body(b, lam.body)?,
        ..lam
    })
}

fn first_order_stm(b: &mut IrBuilder, stm: Stm, out: &mut Vec<Stm>) -> Result<()> {
    let Stm { pat, certs, exp } = stm;
    let exp = match exp {
        Exp::Op(Op::Soac(soac)) => return sequential_soac(b, pat, soac, out),
        Exp::If {
            cond,
            then_body,
            else_body,
            ret,
        } => Exp::If {
            cond,
            then_body: first_order_body(b, then_body)?,
            else_body: first_order_body(b, else_body)?,
            ret,
        },
        Exp::Loop { merge, form, body } => Exp::Loop {
            merge,
            form,
            body: first_order_body(b, body)?,
        },
        Exp::Op(Op::Group(op)) => Exp::Op(Op::Group(match op {
            GroupOp::Map(m) => GroupOp::Map(Map {
                lam: first_order_lambda(b, m.lam)?,
                ..m
            }),
            GroupOp::Reduce(r) => GroupOp::Reduce(Reduce {
                lam: first_order_lambda(b, r.lam)?,
                ..r
            }),
            GroupOp::Scan(s) => GroupOp::Scan(Scan {
                lam: first_order_lambda(b, s.lam)?,
                ..s
            }),
            GroupOp::Stream(s) => GroupOp::Stream(Stream {
                lam: first_order_lambda(b, s.lam)?,
                ..s
            }),
        })),
        exp => exp,
    };
    out.push(Stm { pat, certs, exp });
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

/// Bind each parameter to its argument.
pub(crate) fn bind_params(params: &[Param], args: Vec<SubExp>, out: &mut Vec<Stm>) -> Result<()> {
    if params.len() != args.len() {
        bail_internal!("lambda takes {} arguments, given {}", params.len(), args.len());
    }
    for (p, arg) in params.iter().zip(args) {
        out.push(Stm::new(Pat::new(vec![PatElem::from(p)]), Exp::SubExp(arg)));
    }
    Ok(())
}

/// Inline a lambda applied to `args`, returning its results.
pub(crate) fn inline_lambda(
    b: &mut IrBuilder,
    lam: Lambda,
    args: Vec<SubExp>,
    out: &mut Vec<Stm>,
) -> Result<Vec<SubExp>> {
    bind_params(&lam.params, args, out)?;
    out.extend(first_order_stms(b, lam.body.stms)?);
    Ok(lam.body.result)
}

fn index_rows(b: &mut IrBuilder, arrs: &[VarId], i: VarId, out: &mut Vec<Stm>) -> Result<Vec<SubExp>> {
    arrs.iter()
        .map(|arr| {
            b.bind_se(
                out,
                "elem",
                Exp::Index {
                    arr: *arr,
                    slice: vec![DimIndex::Fix(SubExp::Var(i))],
                },
            )
        })
        .collect()
}

fn scratch(b: &mut IrBuilder, ty: &Type, out: &mut Vec<Stm>) -> Result<SubExp> {
    b.bind_se(
        out,
        "scratch",
        Exp::Scratch {
            elem: ty.elem_type(),
            shape: Shape(ty.dims().to_vec()),
        },
    )
}

fn update_rows(
    b: &mut IrBuilder,
    outs: &[Param],
    i: VarId,
    vals: Vec<SubExp>,
    stms: &mut Vec<Stm>,
) -> Result<Vec<SubExp>> {
    outs.iter()
        .zip(vals)
        .map(|(acc, v)| {
            b.bind_se(
                stms,
                "upd",
                Exp::Update {
                    arr: acc.var,
                    slice: vec![DimIndex::Fix(SubExp::Var(i))],
                    value: v,
                },
            )
        })
        .collect()
}

/// A `for i < w` loop statement.
fn for_loop(pat: Pat, merge: Vec<(Param, SubExp)>, i: VarId, w: SubExp, body: Body) -> Stm {
    Stm::new(
        pat,
        Exp::Loop {
            merge,
            form: LoopForm::For { i, bound: w },
            body,
        },
    )
}

fn loop_index(b: &mut IrBuilder) -> VarId {
    b.param("i", Type::i64()).var
}

// =============================================================================
// SOACs
// =============================================================================

fn sequential_soac(b: &mut IrBuilder, pat: Pat, soac: Soac, out: &mut Vec<Stm>) -> Result<()> {
    match soac {
        Soac::Map(m) => sequential_map(b, pat, m, out),
        Soac::Reduce(r) => {
            let Reduce {
                w, lam, nes, arrs, ..
            } = r;
            let i = loop_index(b);
            let accs: Vec<Param> = lam.ret.iter().map(|t| b.param("acc", t.clone())).collect();
            let mut body = vec![];
            let mut args: Vec<SubExp> = accs.iter().map(|p| SubExp::Var(p.var)).collect();
            args.extend(index_rows(b, &arrs, i, &mut body)?);
            let res = inline_lambda(b, lam, args, &mut body)?;
            out.push(for_loop(
                pat,
                accs.into_iter().zip(nes).collect(),
                i,
                w,
                Body::new(body, res),
            ));
            Ok(())
        }
        Soac::Scan(s) => {
            let Scan { w, lam, nes, arrs } = s;
            let row_tys = arrs
                .iter()
                .map(|a| b.type_of(*a).map(|t| t.row_type()))
                .collect::<Result<Vec<_>>>()?;
            let map_lam = b.identity_lambda(&row_tys);
            sequential_scanomap(
                b,
                pat,
                Scanomap {
                    w,
                    scan_lam: lam,
                    map_lam,
                    nes,
                    arrs,
                },
                out,
            )
        }
        Soac::Redomap(r) => sequential_redomap(b, pat, r, out),
        Soac::Scanomap(s) => sequential_scanomap(b, pat, s, out),
        Soac::Stream(s) => sequential_stream(b, pat, s, out),
        Soac::Scatter(s) => sequential_scatter(b, pat, s, out),
        Soac::WithLoop(wl) => {
            let s = with_loop_as_scatter(b, wl, out)?;
            sequential_scatter(b, pat, s, out)
        }
    }
}

fn sequential_map(b: &mut IrBuilder, pat: Pat, m: Map, out: &mut Vec<Stm>) -> Result<()> {
    let Map { w, lam, arrs } = m;
    let i = loop_index(b);
    let mut merge = vec![];
    for pe in &pat.vals {
        let init = scratch(b, &pe.ty, out)?;
        merge.push((b.param("map_acc", pe.ty.clone()), init));
    }
    let accs: Vec<Param> = merge.iter().map(|(p, _)| p.clone()).collect();
    let mut body = vec![];
    let args = index_rows(b, &arrs, i, &mut body)?;
    let res = inline_lambda(b, lam, args, &mut body)?;
    let res = update_rows(b, &accs, i, res, &mut body)?;
    out.push(for_loop(pat, merge, i, w, Body::new(body, res)));
    Ok(())
}

fn sequential_redomap(b: &mut IrBuilder, pat: Pat, r: Redomap, out: &mut Vec<Stm>) -> Result<()> {
    let Redomap {
        w,
        red_lam,
        map_lam,
        nes,
        arrs,
        ..
    } = r;
    let n = nes.len();
    let i = loop_index(b);
    let mut merge = vec![];
    for (t, ne) in red_lam.ret.iter().zip(&nes) {
        merge.push((b.param("red_acc", t.clone()), ne.clone()));
    }
    for pe in pat.vals.iter().skip(n) {
        let init = scratch(b, &pe.ty, out)?;
        merge.push((b.param("map_acc", pe.ty.clone()), init));
    }
    let params: Vec<Param> = merge.iter().map(|(p, _)| p.clone()).collect();
    let (red_accs, map_accs) = params.split_at(n);

    let mut body = vec![];
    let elems = index_rows(b, &arrs, i, &mut body)?;
    let mapped = inline_lambda(b, map_lam, elems, &mut body)?;
    if mapped.len() < n {
        bail_internal!("redomap map lambda returns fewer values than there are accumulators");
    }
    let mut red_args: Vec<SubExp> = red_accs.iter().map(|p| SubExp::Var(p.var)).collect();
    red_args.extend(mapped[..n].iter().cloned());
    let mut res = inline_lambda(b, red_lam, red_args, &mut body)?;
    res.extend(update_rows(b, map_accs, i, mapped[n..].to_vec(), &mut body)?);
    out.push(for_loop(pat, merge, i, w, Body::new(body, res)));
    Ok(())
}

fn sequential_scanomap(b: &mut IrBuilder, pat: Pat, s: Scanomap, out: &mut Vec<Stm>) -> Result<()> {
    let Scanomap {
        w,
        scan_lam,
        map_lam,
        nes,
        arrs,
    } = s;
    let n = nes.len();
    let i = loop_index(b);
    let mut merge = vec![];
    for (t, ne) in scan_lam.ret.iter().zip(&nes) {
        merge.push((b.param("scan_acc", t.clone()), ne.clone()));
    }
    for pe in &pat.vals {
        let init = scratch(b, &pe.ty, out)?;
        merge.push((b.param("scan_out", pe.ty.clone()), init));
    }
    let params: Vec<Param> = merge.iter().map(|(p, _)| p.clone()).collect();
    let (accs, outs) = params.split_at(n);

    let mut body = vec![];
    let elems = index_rows(b, &arrs, i, &mut body)?;
    let mapped = inline_lambda(b, map_lam, elems, &mut body)?;
    if mapped.len() < n {
        bail_internal!("scanomap map lambda returns fewer values than there are accumulators");
    }
    let mut scan_args: Vec<SubExp> = accs.iter().map(|p| SubExp::Var(p.var)).collect();
    scan_args.extend(mapped[..n].iter().cloned());
    let scanned = inline_lambda(b, scan_lam, scan_args, &mut body)?;
    let mut row_vals = scanned.clone();
    row_vals.extend(mapped[n..].iter().cloned());
    let mut res = scanned;
    res.extend(update_rows(b, outs, i, row_vals, &mut body)?);

    // The loop also returns the final accumulators, which nothing uses.
    let acc_elems: Vec<PatElem> = accs.iter().map(|p| b.pat_elem("scan_total", p.ty.clone())).collect();
    let mut vals = acc_elems;
    vals.extend(pat.vals);
    out.push(for_loop(
        Pat { ctx: pat.ctx, vals },
        merge,
        i,
        w,
        Body::new(body, res),
    ));
    Ok(())
}

/// A stream processed as one chunk covering the whole input.
fn sequential_stream(b: &mut IrBuilder, pat: Pat, s: Stream, out: &mut Vec<Stm>) -> Result<()> {
    let Stream {
        w, lam, accs, arrs, ..
    } = s;
    let mut args = vec![w];
    args.extend(accs);
    args.extend(arrs.into_iter().map(SubExp::Var));
    let res = inline_lambda(b, lam, args, out)?;
    if res.len() != pat.vals.len() {
        bail_internal!("stream lambda returns {} values for {} outputs", res.len(), pat.vals.len());
    }
    for (pe, r) in pat.vals.into_iter().zip(res) {
        out.push(Stm::new(Pat::new(vec![pe]), Exp::SubExp(r)));
    }
    Ok(())
}

fn sequential_scatter(b: &mut IrBuilder, pat: Pat, s: Scatter, out: &mut Vec<Stm>) -> Result<()> {
    let Scatter { w, lam, arrs, dests } = s;
    let k = dests.len();
    let i = loop_index(b);
    let mut merge = vec![];
    for (pe, (_, dest)) in pat.vals.iter().zip(&dests) {
        merge.push((b.param("dest_acc", pe.ty.clone()), SubExp::Var(*dest)));
    }
    let params: Vec<Param> = merge.iter().map(|(p, _)| p.clone()).collect();

    let mut body = vec![];
    let elems = index_rows(b, &arrs, i, &mut body)?;
    let res = inline_lambda(b, lam, elems, &mut body)?;
    if res.len() != 2 * k {
        bail_internal!("scatter lambda returns {} values for {k} destinations", res.len());
    }
    let mut new_dests = vec![];
    for (j, (acc, (dest_w, _))) in params.iter().zip(&dests).enumerate() {
        let idx = res[j].clone();
        let val = res[k + j].clone();
        let written = write_if_in_bounds(b, acc, dest_w.clone(), idx, val, &mut body)?;
        new_dests.push(written);
    }
    out.push(for_loop(pat, merge, i, w, Body::new(body, new_dests)));
    Ok(())
}

/// A with-loop is a scatter over `iota w` writing row `j + offset` of
/// every destination. Binds the iota into `out`.
pub(crate) fn with_loop_as_scatter(b: &mut IrBuilder, wl: WithLoop, out: &mut Vec<Stm>) -> Result<Scatter> {
    let WithLoop { w, offset, lam, dests } = wl;
    let [idx_param] = lam.params.as_slice() else {
        bail_internal!("with-loop lambda takes {} parameters", lam.params.len());
    };
    let iota = b.bind(out, "gen", Exp::Iota { n: w.clone() })?;
    let j = b.param("j", Type::i64());
    let idx = SubExp::Var(idx_param.var);
    let mut stms = vec![Stm::new(
        Pat::new(vec![PatElem::from(idx_param)]),
        Exp::BinOp(BinOp::Add, SubExp::Var(j.var), offset),
    )];
    stms.extend(lam.body.stms);
    let mut result = vec![idx; dests.len()];
    result.extend(lam.body.result);
    let mut ret = vec![Type::i64(); dests.len()];
    ret.extend(lam.ret);
    Ok(Scatter {
        w,
        lam: Lambda {
            params: vec![j],
            body: Body::new(stms, result),
            ret,
        },
        arrs: vec![iota],
        dests,
    })
}

/// `if 0 <= idx < w then acc with [idx] = val else acc`.
pub(crate) fn write_if_in_bounds(
    b: &mut IrBuilder,
    acc: &Param,
    w: SubExp,
    idx: SubExp,
    val: SubExp,
    out: &mut Vec<Stm>,
) -> Result<SubExp> {
    let lower = b.bind_se(out, "lower_ok", Exp::CmpOp(CmpOp::Le, SubExp::i64(0), idx.clone()))?;
    let upper = b.bind_se(out, "upper_ok", Exp::CmpOp(CmpOp::Lt, idx.clone(), w))?;
    let in_bounds = b.bind_se(out, "in_bounds", Exp::BinOp(BinOp::And, lower, upper))?;
    let mut then_stms = vec![];
    let written = b.bind_se(
        &mut then_stms,
        "written",
        Exp::Update {
            arr: acc.var,
            slice: vec![DimIndex::Fix(idx)],
            value: val,
        },
    )?;
    b.bind_se(
        out,
        "dest",
        Exp::If {
            cond: in_bounds,
            then_body: Body::new(then_stms, vec![written]),
            else_body: Body::new(vec![], vec![SubExp::Var(acc.var)]),
            ret: vec![ExtType::from(acc.ty.clone())],
        },
    )
}
