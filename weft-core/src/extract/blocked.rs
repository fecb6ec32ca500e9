//! Kernels for SOACs at the top level of a function.
//!
//! Reductions and scans use a fixed number of threads, each folding one
//! contiguous chunk of the input sequentially; a single workgroup then
//! combines the per-thread partial results.

use crate::error::Result;
use crate::first_order::{first_order_lambda, first_order_stms, inline_lambda};
use crate::ir::{
    BinOp, Body, CmpOp, Commutativity, DimIndex, Exp, ExtType, GroupOp, Kernel, KernelBody, KernelInput,
    KernelResult, KernelSpace, Lambda, LoopForm, Map, Op, Param, Pat, Reduce, Redomap, Scan, Scanomap, Scatter,
    SegLevel, Shape, SizeClass, Stm, Stream, SubExp, Type, VarId,
};
use crate::bail_internal;

use super::ExtractCtx;
use super::distribution::thread_kernel;
use super::threshold::get_size;

/// A flat kernel running the map lambda once per element.
pub fn map_kernel(ctx: &mut ExtractCtx, pat: Pat, map: Map) -> Result<Vec<Stm>> {
    let Map { w, lam, arrs } = map;
    let mut out = vec![];
    let gtid = ctx.b.param("gtid", Type::i64()).var;
    let inputs = lam
        .params
        .into_iter()
        .zip(arrs)
        .map(|(param, arr)| KernelInput {
            param,
            arr,
            indices: vec![SubExp::Var(gtid)],
        })
        .collect();
    let stms = first_order_stms(&mut ctx.b, lam.body.stms)?;
    let kernel = thread_kernel(
        ctx,
        &mut out,
        "map",
        w.clone(),
        vec![(gtid, w)],
        inputs,
        stms,
        lam.body.result,
        lam.ret,
    )?;
    out.push(Stm::new(pat, kernel));
    Ok(out)
}

/// A flat kernel performing the writes of a scatter.
pub fn scatter_kernel(ctx: &mut ExtractCtx, pat: Pat, scatter: Scatter) -> Result<Vec<Stm>> {
    let Scatter { w, lam, arrs, dests } = scatter;
    let k = dests.len();
    if lam.body.result.len() != 2 * k {
        bail_internal!("scatter lambda returns {} values for {k} destinations", lam.body.result.len());
    }
    let mut out = vec![];
    let gtid = ctx.b.param("gtid", Type::i64()).var;
    let inputs = lam
        .params
        .into_iter()
        .zip(arrs)
        .map(|(param, arr)| KernelInput {
            param,
            arr,
            indices: vec![SubExp::Var(gtid)],
        })
        .collect();
    let stms = first_order_stms(&mut ctx.b, lam.body.stms)?;
    let res = lam.body.result;
    let results = dests
        .into_iter()
        .enumerate()
        .map(|(j, (dest_w, dest))| KernelResult::Write {
            dest_w,
            dest,
            index: res[j].clone(),
            value: res[k + j].clone(),
        })
        .collect();
    let group_size = get_size(ctx, "group_size", SizeClass::GroupSize, &mut out)?;
    let num_groups = ctx.b.div_up(&mut out, "num_groups", w.clone(), group_size.clone())?;
    let kernel = Kernel {
        desc: "scatter".to_string(),
        space: KernelSpace {
            level: SegLevel::Thread,
            global_tid: gtid,
            group_size,
            num_groups,
            dims: vec![(gtid, w)],
        },
        inputs,
        body: KernelBody { stms, results },
        ret: lam.ret[k..].to_vec(),
    };
    out.push(Stm::new(pat, Exp::Op(Op::Kernel(Box::new(kernel)))));
    Ok(out)
}

// =============================================================================
// Chunking
// =============================================================================

struct Chunking {
    group_size: SubExp,
    /// Number of threads.
    threads: SubExp,
    /// Elements per thread.
    per_thread: SubExp,
}

fn chunking(ctx: &mut ExtractCtx, w: &SubExp, out: &mut Vec<Stm>) -> Result<Chunking> {
    let group_size = get_size(ctx, "group_size", SizeClass::GroupSize, out)?;
    let max_groups = get_size(ctx, "num_groups", SizeClass::NumGroups, out)?;
    let wanted = ctx.b.div_up(out, "wanted_groups", w.clone(), group_size.clone())?;
    let num_groups = ctx.b.binop(out, "num_groups", BinOp::Min, max_groups, wanted)?;
    let threads = ctx.b.binop(out, "num_threads", BinOp::Mul, num_groups, group_size.clone())?;
    let some_threads = ctx.b.binop(out, "num_threads", BinOp::Max, threads.clone(), SubExp::i64(1))?;
    let per_thread = ctx.b.div_up(out, "per_thread", w.clone(), some_threads)?;
    Ok(Chunking {
        group_size,
        threads,
        per_thread,
    })
}

/// Slices of `arrs` owned by thread `gtid`, with their common length.
fn thread_chunk(
    ctx: &mut ExtractCtx,
    gtid: VarId,
    w: &SubExp,
    per_thread: &SubExp,
    arrs: &[VarId],
    out: &mut Vec<Stm>,
) -> Result<(SubExp, Vec<SubExp>)> {
    let b = &mut ctx.b;
    let start = b.binop(out, "chunk_start", BinOp::Mul, SubExp::Var(gtid), per_thread.clone())?;
    let rest = b.binop(out, "chunk_rest", BinOp::Sub, w.clone(), start.clone())?;
    let len = b.binop(out, "chunk_len", BinOp::Min, per_thread.clone(), rest)?;
    let len = b.binop(out, "chunk_len", BinOp::Max, len, SubExp::i64(0))?;
    let mut chunks = vec![];
    for arr in arrs {
        chunks.push(b.bind_se(
            out,
            "chunk",
            Exp::Index {
                arr: *arr,
                slice: vec![DimIndex::Slice {
                    start: start.clone(),
                    len: len.clone(),
                    stride: SubExp::i64(1),
                }],
            },
        )?);
    }
    Ok((len, chunks))
}

/// A merge parameter for `rows` per-thread outputs of type `ty`, with its
/// uninitialised initial value.
fn scratch_rows(ctx: &mut ExtractCtx, rows: &SubExp, ty: &Type, out: &mut Vec<Stm>) -> Result<(Param, SubExp)> {
    let arr_ty = ty.array_of(rows.clone());
    let init = ctx.b.bind_se(
        out,
        "scratch",
        Exp::Scratch {
            elem: arr_ty.elem_type(),
            shape: Shape(arr_ty.dims().to_vec()),
        },
    )?;
    Ok((ctx.b.param("chunk_out", arr_ty), init))
}

/// The outcome of folding one chunk sequentially.
struct Folded {
    accs: Vec<SubExp>,
    scanned: Vec<SubExp>,
    mapped: Vec<SubExp>,
}

/// Fold a chunk of `len` elements with `op` after applying `map_lam`,
/// keeping every intermediate accumulator when `keep_scan` is set.
#[allow(clippy::too_many_arguments)]
fn fold_chunk(
    ctx: &mut ExtractCtx,
    chunks: &[SubExp],
    len: SubExp,
    per_thread: &SubExp,
    nes: &[SubExp],
    op: &Lambda,
    map_lam: &Lambda,
    keep_scan: bool,
    out: &mut Vec<Stm>,
) -> Result<Folded> {
    let n = nes.len();
    let red_tys = op.ret.clone();
    let map_tys = map_lam.ret[n..].to_vec();

    let mut merge = vec![];
    let acc_params: Vec<Param> = red_tys.iter().map(|t| ctx.b.param("acc", t.clone())).collect();
    for (p, ne) in acc_params.iter().zip(nes) {
        merge.push((p.clone(), ne.clone()));
    }
    let mut scan_params = vec![];
    if keep_scan {
        for t in &red_tys {
            let (p, init) = scratch_rows(ctx, per_thread, t, out)?;
            scan_params.push(p.clone());
            merge.push((p, init));
        }
    }
    let mut map_params = vec![];
    for t in &map_tys {
        let (p, init) = scratch_rows(ctx, per_thread, t, out)?;
        map_params.push(p.clone());
        merge.push((p, init));
    }

    let j = ctx.b.param("j", Type::i64()).var;
    let mut body = vec![];
    let mut elems = vec![];
    for chunk in chunks {
        let Some(arr) = chunk.var() else {
            bail_internal!("chunk is not an array");
        };
        elems.push(ctx.b.bind_se(
            &mut body,
            "elem",
            Exp::Index {
                arr,
                slice: vec![DimIndex::Fix(SubExp::Var(j))],
            },
        )?);
    }
    let mapped = inline_lambda(&mut ctx.b, map_lam.clone(), elems, &mut body)?;
    let mut args: Vec<SubExp> = acc_params.iter().map(|p| SubExp::Var(p.var)).collect();
    args.extend(mapped[..n].iter().cloned());
    let new_accs = inline_lambda(&mut ctx.b, op.clone(), args, &mut body)?;
    let mut result = new_accs.clone();
    for (p, acc) in scan_params.iter().zip(&new_accs) {
        result.push(update_row(ctx, p, j, acc.clone(), &mut body)?);
    }
    for (p, v) in map_params.iter().zip(&mapped[n..]) {
        result.push(update_row(ctx, p, j, v.clone(), &mut body)?);
    }

    let vals: Vec<_> = merge.iter().map(|(p, _)| ctx.b.pat_elem(p.name_hint.clone(), p.ty.clone())).collect();
    let names: Vec<SubExp> = vals.iter().map(|pe| SubExp::Var(pe.var)).collect();
    out.push(Stm::new(
        Pat::new(vals),
        Exp::Loop {
            merge,
            form: LoopForm::For {
                i: j,
                bound: len,
            },
            body: Body::new(body, result),
        },
    ));
    let (accs, rest) = names.split_at(n);
    let (scanned, mapped) = rest.split_at(scan_params.len());
    Ok(Folded {
        accs: accs.to_vec(),
        scanned: scanned.to_vec(),
        mapped: mapped.to_vec(),
    })
}

fn update_row(ctx: &mut ExtractCtx, acc: &Param, j: VarId, value: SubExp, out: &mut Vec<Stm>) -> Result<SubExp> {
    ctx.b.bind_se(
        out,
        "chunk_out",
        Exp::Update {
            arr: acc.var,
            slice: vec![DimIndex::Fix(SubExp::Var(j))],
            value,
        },
    )
}

/// A kernel of one workgroup computing `op`, returning `[1]t` arrays.
fn single_group(
    ctx: &mut ExtractCtx,
    desc: &str,
    group_size: SubExp,
    op: GroupOp,
    tys: Vec<Type>,
    out: &mut Vec<Stm>,
) -> Result<Vec<VarId>> {
    let gid = ctx.b.param("gid", Type::i64()).var;
    let mut body = vec![];
    let vals = ctx.b.bind_multi(&mut body, desc, Exp::Op(Op::Group(op)))?;
    let kernel = Kernel {
        desc: desc.to_string(),
        space: KernelSpace {
            level: SegLevel::Group,
            global_tid: gid,
            group_size,
            num_groups: SubExp::i64(1),
            dims: vec![(gid, SubExp::i64(1))],
        },
        inputs: vec![],
        body: KernelBody {
            stms: body,
            results: vals.into_iter().map(|v| KernelResult::Threads(SubExp::Var(v))).collect(),
        },
        ret: tys,
    };
    ctx.b.bind_multi(out, desc, Exp::Op(Op::Kernel(Box::new(kernel))))
}

fn first_row(ctx: &mut ExtractCtx, arr: VarId, out: &mut Vec<Stm>) -> Result<SubExp> {
    ctx.b.bind_se(
        out,
        "first",
        Exp::Index {
            arr,
            slice: vec![DimIndex::Fix(SubExp::i64(0))],
        },
    )
}

/// Concatenate per-thread output chunks and cut them to `w` elements.
fn unchunk(
    ctx: &mut ExtractCtx,
    chunking: &Chunking,
    w: &SubExp,
    chunked: VarId,
    out: &mut Vec<Stm>,
) -> Result<SubExp> {
    let ty = ctx.b.type_of(chunked)?;
    let total = ctx
        .b
        .binop(out, "chunked_size", BinOp::Mul, chunking.threads.clone(), chunking.per_thread.clone())?;
    let mut dims = vec![total];
    dims.extend(ty.dims().iter().skip(2).cloned());
    let flat = ctx.b.bind(
        out,
        "flat",
        Exp::Reshape {
            shape: Shape(dims),
            arr: chunked,
        },
    )?;
    ctx.b.bind_se(
        out,
        "unchunked",
        Exp::Index {
            arr: flat,
            slice: vec![DimIndex::Slice {
                start: SubExp::i64(0),
                len: w.clone(),
                stride: SubExp::i64(1),
            }],
        },
    )
}

fn bind_results(pat: Pat, values: Vec<SubExp>, out: &mut Vec<Stm>) {
    for (pe, v) in pat.vals.into_iter().zip(values) {
        out.push(Stm::new(Pat::new(vec![pe]), Exp::SubExp(v)));
    }
}

// =============================================================================
// Reductions and scans
// =============================================================================

/// Per-thread chunked folding, then one workgroup reducing the partial
/// results.
pub fn blocked_reduction(ctx: &mut ExtractCtx, pat: Pat, redomap: Redomap) -> Result<Vec<Stm>> {
    let Redomap {
        w,
        comm,
        red_lam,
        map_lam,
        nes,
        arrs,
    } = redomap;
    let mut out = vec![];
    let chunking = chunking(ctx, &w, &mut out)?;
    let n = nes.len();

    let gtid = ctx.b.param("gtid", Type::i64()).var;
    let mut body = vec![];
    let (len, chunks) = thread_chunk(ctx, gtid, &w, &chunking.per_thread, &arrs, &mut body)?;
    let folded = fold_chunk(ctx, &chunks, len, &chunking.per_thread, &nes, &red_lam, &map_lam, false, &mut body)?;
    let mut ret = red_lam.ret.clone();
    ret.extend(map_lam.ret[n..].iter().map(|t| t.array_of(chunking.per_thread.clone())));
    let results: Vec<SubExp> = folded.accs.into_iter().chain(folded.mapped).collect();
    let kernel = thread_kernel(
        ctx,
        &mut out,
        "chunked_red",
        chunking.threads.clone(),
        vec![(gtid, chunking.threads.clone())],
        vec![],
        body,
        results,
        ret,
    )?;
    let partials = ctx.b.bind_multi(&mut out, "chunked_red", kernel)?;

    let red_lam = first_order_lambda(&mut ctx.b, red_lam)?;
    let op = GroupOp::Reduce(Reduce {
        w: chunking.threads.clone(),
        comm,
        lam: red_lam.clone(),
        nes,
        arrs: partials[..n].to_vec(),
    });
    let finals = single_group(ctx, "final_red", chunking.group_size.clone(), op, red_lam.ret.clone(), &mut out)?;

    let mut values = vec![];
    for arr in finals {
        values.push(first_row(ctx, arr, &mut out)?);
    }
    for chunked in &partials[n..] {
        values.push(unchunk(ctx, &chunking, &w, *chunked, &mut out)?);
    }
    bind_results(pat, values, &mut out);
    ctx.log(format!("blocked reduction of width {w}"));
    Ok(out)
}

/// Scan each thread's chunk, scan the chunk totals in one workgroup, then
/// combine every element with the total of the chunks before it.
pub fn blocked_scan(ctx: &mut ExtractCtx, pat: Pat, scanomap: Scanomap) -> Result<Vec<Stm>> {
    let Scanomap {
        w,
        scan_lam,
        map_lam,
        nes,
        arrs,
    } = scanomap;
    let mut out = vec![];
    let chunking = chunking(ctx, &w, &mut out)?;
    let n = nes.len();
    let scan_tys = scan_lam.ret.clone();
    let map_tys = map_lam.ret[n..].to_vec();

    // Scan of every chunk.
    let gtid = ctx.b.param("gtid", Type::i64()).var;
    let mut body = vec![];
    let (len, chunks) = thread_chunk(ctx, gtid, &w, &chunking.per_thread, &arrs, &mut body)?;
    let folded = fold_chunk(ctx, &chunks, len, &chunking.per_thread, &nes, &scan_lam, &map_lam, true, &mut body)?;
    let mut ret = scan_tys.clone();
    ret.extend(scan_tys.iter().map(|t| t.array_of(chunking.per_thread.clone())));
    ret.extend(map_tys.iter().map(|t| t.array_of(chunking.per_thread.clone())));
    let results: Vec<SubExp> = folded
        .accs
        .into_iter()
        .chain(folded.scanned)
        .chain(folded.mapped)
        .collect();
    let kernel = thread_kernel(
        ctx,
        &mut out,
        "scan_chunks",
        chunking.threads.clone(),
        vec![(gtid, chunking.threads.clone())],
        vec![],
        body,
        results,
        ret,
    )?;
    let chunked = ctx.b.bind_multi(&mut out, "scan_chunks", kernel)?;
    let (totals, rest) = chunked.split_at(n);
    let (chunk_scans, chunk_maps) = rest.split_at(n);

    // Inclusive scan of the chunk totals.
    let carry_lam = first_order_lambda(&mut ctx.b, scan_lam.clone())?;
    let op = GroupOp::Scan(Scan {
        w: chunking.threads.clone(),
        lam: carry_lam,
        nes: nes.clone(),
        arrs: totals.to_vec(),
    });
    let carry_tys = scan_tys.iter().map(|t| t.array_of(chunking.threads.clone())).collect();
    let carries_1 = single_group(ctx, "scan_carries", chunking.group_size.clone(), op, carry_tys, &mut out)?;
    let mut carries = vec![];
    for arr in carries_1 {
        match first_row(ctx, arr, &mut out)? {
            SubExp::Var(v) => carries.push(v),
            SubExp::Const(_) => bail_internal!("carry array bound to a constant"),
        }
    }

    // Apply the carries.
    let i = ctx.b.param("gtid", Type::i64()).var;
    let mut body = vec![];
    let b = &mut ctx.b;
    let t = b.binop(&mut body, "chunk", BinOp::Div, SubExp::Var(i), chunking.per_thread.clone())?;
    let j = b.bind_se(&mut body, "in_chunk", Exp::BinOp(BinOp::Mod, SubExp::Var(i), chunking.per_thread.clone()))?;
    let at = |arr: &VarId| Exp::Index {
        arr: *arr,
        slice: vec![DimIndex::Fix(t.clone()), DimIndex::Fix(j.clone())],
    };
    let mut values = vec![];
    for arr in chunk_scans {
        values.push(b.bind_se(&mut body, "scanned", at(arr))?);
    }
    let is_first = b.bind_se(&mut body, "first_chunk", Exp::CmpOp(CmpOp::Eq, t.clone(), SubExp::i64(0)))?;
    let mut prev_stms = vec![];
    let prev = b.binop(&mut prev_stms, "prev_chunk", BinOp::Sub, t.clone(), SubExp::i64(1))?;
    let mut prev_carries = vec![];
    for arr in &carries {
        prev_carries.push(b.bind_se(
            &mut prev_stms,
            "carry",
            Exp::Index {
                arr: *arr,
                slice: vec![DimIndex::Fix(prev.clone())],
            },
        )?);
    }
    let carry = b.bind_multi(
        &mut body,
        "carry",
        Exp::If {
            cond: is_first,
            then_body: Body::new(vec![], nes.clone()),
            else_body: Body::new(prev_stms, prev_carries),
            ret: scan_tys.iter().cloned().map(ExtType::from).collect(),
        },
    )?;
    let mut args: Vec<SubExp> = carry.into_iter().map(SubExp::Var).collect();
    args.extend(values);
    let mut results = inline_lambda(b, scan_lam, args, &mut body)?;
    for arr in chunk_maps {
        results.push(b.bind_se(&mut body, "mapped", at(arr))?);
    }
    let mut ret = scan_tys;
    ret.extend(map_tys);
    let kernel = thread_kernel(ctx, &mut out, "scan_apply", w.clone(), vec![(i, w.clone())], vec![], body, results, ret)?;
    out.push(Stm::new(pat, kernel));
    ctx.log(format!("blocked scan of width {w}"));
    Ok(out)
}

/// A parallel stream whose chunk results are only accumulators: every
/// thread streams over its own chunk, then one workgroup combines the
/// accumulators with the stream's reduction operator.
pub fn stream_reduction(
    ctx: &mut ExtractCtx,
    pat: Pat,
    stream: Stream,
    comm: Commutativity,
    red_lam: Lambda,
) -> Result<Vec<Stm>> {
    let Stream { w, lam, accs, arrs, .. } = stream;
    let mut out = vec![];
    let chunking = chunking(ctx, &w, &mut out)?;
    let acc_tys = lam.ret[..accs.len()].to_vec();

    let gtid = ctx.b.param("gtid", Type::i64()).var;
    let mut body = vec![];
    let (len, chunks) = thread_chunk(ctx, gtid, &w, &chunking.per_thread, &arrs, &mut body)?;
    let mut args = vec![len];
    args.extend(accs.iter().cloned());
    args.extend(chunks);
    let results = inline_lambda(&mut ctx.b, lam, args, &mut body)?;
    let kernel = thread_kernel(
        ctx,
        &mut out,
        "stream_red",
        chunking.threads.clone(),
        vec![(gtid, chunking.threads.clone())],
        vec![],
        body,
        results,
        acc_tys.clone(),
    )?;
    let partials = ctx.b.bind_multi(&mut out, "stream_red", kernel)?;

    let red_lam = first_order_lambda(&mut ctx.b, red_lam)?;
    let op = GroupOp::Reduce(Reduce {
        w: chunking.threads.clone(),
        comm,
        lam: red_lam,
        nes: accs,
        arrs: partials,
    });
    let finals = single_group(ctx, "final_red", chunking.group_size.clone(), op, acc_tys, &mut out)?;
    let mut values = vec![];
    for arr in finals {
        values.push(first_row(ctx, arr, &mut out)?);
    }
    bind_results(pat, values, &mut out);
    ctx.log(format!("chunked stream reduction of width {w}"));
    Ok(out)
}
