//! Moving loops and branches out of a kernel nest.
//!
//! A sequential loop with parallel code inside, sitting in a map nest, can
//! be turned inside out: the loop moves to the top and carries the whole
//! nest's worth of merge values, and its body becomes the map nest around
//! the original loop body. Branches are handled the same way when every
//! thread takes the same branch, i.e. when the condition does not depend on
//! the nest.

use std::collections::HashSet;

use crate::error::Result;
use crate::ir::builder::ext_to_type;
use crate::ir::{Body, Exp, ExtType, Lambda, LoopForm, Map, Op, Param, Pat, PatElem, Shape, Soac, Stm, SubExp, Type, VarId};

use super::ExtractCtx;
use super::distribution::KernelNest;

/// Rebuild the maps of `nest` around `body`. `extra[k]` are additional
/// parameters of level `k` with the arrays they are drawn from. Returns the
/// top-level statements and the names bound to the outermost map.
pub fn wrap_in_nest(
    ctx: &mut ExtractCtx,
    nest: &KernelNest,
    extra: Vec<Vec<(Param, VarId)>>,
    body: Body,
    ret: Vec<Type>,
) -> Result<(Vec<Stm>, Vec<VarId>)> {
    let mut body = body;
    let mut ret = ret;
    let mut extra = extra;
    extra.resize(nest.depth(), vec![]);
    for (level, extra) in nest.levels.iter().zip(extra).rev() {
        let (mut params, mut arrs): (Vec<Param>, Vec<VarId>) = level.params_and_arrs.iter().cloned().unzip();
        for (p, arr) in extra {
            params.push(p);
            arrs.push(arr);
        }
        let lam = Lambda { params, body, ret };
        let map = Map {
            w: level.w.clone(),
            lam,
            arrs,
        };
        let mut stms = vec![];
        let names = ctx.b.bind_multi(&mut stms, "nest", Exp::Op(Op::Soac(Soac::Map(map))))?;
        if let Some(last) = stms.last_mut() {
            last.certs = level.certs.clone();
        }
        ret = names.iter().map(|v| ctx.b.type_of(*v)).collect::<Result<_>>()?;
        body = Body::new(stms, names.into_iter().map(SubExp::Var).collect());
    }
    let names = body.result.iter().filter_map(|se| se.var()).collect();
    Ok((body.stms, names))
}

/// `loop (xs = inits) for i < n do map_nest(body)` in place of the nest
/// `map_nest(loop (x = init) for i < n do body)`.
///
/// Fails for while-loops, for loops whose trip count depends on the nest,
/// and for initial values that cannot be expanded to the whole nest.
pub fn interchange_loop(
    ctx: &mut ExtractCtx,
    nest: &KernelNest,
    bound: &HashSet<VarId>,
    declared: Vec<PatElem>,
    merge: Vec<(Param, SubExp)>,
    form: LoopForm,
    body: Body,
) -> Result<Option<Vec<Stm>>> {
    let LoopForm::For { bound: n, .. } = &form else {
        return Ok(None);
    };
    if n.var().is_some_and(|v| bound.contains(&v)) {
        return Ok(None);
    }
    let widths = nest.widths();
    let depth = nest.depth();
    let mut out = vec![];
    let mut outer_merge = vec![];
    let mut views: Vec<Vec<(Param, VarId)>> = vec![vec![]; depth];
    for (p, init) in &merge {
        if p.ty.free_vars().any(|v| bound.contains(&v)) {
            return Ok(None);
        }
        let expanded_init = match init {
            SubExp::Var(v) if bound.contains(v) => match nest.full_input(*v) {
                Some(arr) => SubExp::Var(arr),
                None => return Ok(None),
            },
            _ => ctx.b.bind_se(
                &mut out,
                "expanded_init",
                Exp::Replicate {
                    shape: Shape(widths.clone()),
                    value: init.clone(),
                },
            )?,
        };
        let outer = ctx.b.param(p.name_hint.clone(), p.ty.array_of_dims(&widths));
        let mut arr = outer.var;
        for level in 0..depth {
            let param = if level + 1 == depth {
                p.clone()
            } else {
                ctx.b.param(p.name_hint.clone(), p.ty.array_of_dims(&widths[level + 1..]))
            };
            let next = param.var;
            views[level].push((param, arr));
            arr = next;
        }
        outer_merge.push((outer, expanded_init));
    }

    let ret = merge.iter().map(|(p, _)| p.ty.clone()).collect();
    let (stms, names) = wrap_in_nest(ctx, nest, views, body, ret)?;
    out.push(Stm::new(
        Pat::new(declared),
        Exp::Loop {
            merge: outer_merge,
            form,
            body: Body::new(stms, names.into_iter().map(SubExp::Var).collect()),
        },
    ));
    ctx.log(format!("interchanged loop with a {depth}-level map nest"));
    Ok(Some(out))
}

/// `if c then map_nest(a) else map_nest(b)` in place of
/// `map_nest(if c then a else b)`, for conditions invariant to the nest.
#[allow(clippy::too_many_arguments)]
pub fn interchange_branch(
    ctx: &mut ExtractCtx,
    nest: &KernelNest,
    bound: &HashSet<VarId>,
    declared: Vec<PatElem>,
    cond: SubExp,
    then_body: Body,
    else_body: Body,
    ret: &[ExtType],
) -> Result<Option<Vec<Stm>>> {
    if cond.var().is_some_and(|v| bound.contains(&v)) {
        return Ok(None);
    }
    let Some(tys) = ret.iter().map(ext_to_type).collect::<Option<Vec<Type>>>() else {
        return Ok(None);
    };
    let (then_stms, then_res) = wrap_in_nest(ctx, nest, vec![], then_body, tys.clone())?;
    let (else_stms, else_res) = wrap_in_nest(ctx, nest, vec![], else_body, tys)?;
    let outer_ret = declared.iter().map(|pe| ExtType::from(pe.ty.clone())).collect();
    let stm = Stm::new(
        Pat::new(declared),
        Exp::If {
            cond,
            then_body: Body::new(then_stms, then_res.into_iter().map(SubExp::Var).collect()),
            else_body: Body::new(else_stms, else_res.into_iter().map(SubExp::Var).collect()),
            ret: outer_ret,
        },
    );
    ctx.log(format!("interchanged branch with a {}-level map nest", nest.depth()));
    Ok(Some(vec![stm]))
}
