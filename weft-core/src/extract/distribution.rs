//! Distribution nest tracking.
//!
//! While a map nest is being distributed, the `Distributor` keeps one
//! `Nesting` per enclosing map (outermost first). Statements of the innermost
//! map body are either accumulated in a `KernelAcc` or pulled out into kernels
//! of their own. Pulling a statement out requires every name it uses that is
//! bound inside the nest to be reachable through per-level kernel inputs:
//!
//! - a parameter of an enclosing map, which is indexed by that level's thread
//!   id, or
//! - a name that an earlier kernel already produced for every thread
//!   ("expanded" into a top-level array).
//!
//! Anything else (a name bound by a statement that is still pending, a width
//! or shape that varies per thread) makes the attempt fail with `None`, and
//! the caller falls back to adding the statement to the pending kernel.

use std::collections::{HashMap, HashSet};

use log::trace;

use crate::error::Result;
use crate::first_order::first_order_stms;
use crate::ir::free::{bound_by_stms, free_in_stm, free_in_stms};
use crate::ir::{
    Certs, Exp, Kernel, KernelBody, KernelInput, KernelResult, KernelSpace, Op, Param, Pat, PatElem,
    SegLevel, SizeClass, Stm, SubExp, Type, VarId,
};

use super::ExtractCtx;
use super::threshold::get_size;

// =============================================================================
// Nests
// =============================================================================

/// One level of an originally sequential map around the statement being
/// distributed.
#[derive(Debug, Clone)]
pub struct LoopNesting {
    pub pat: Vec<PatElem>,
    pub certs: Certs,
    pub w: SubExp,
    pub params_and_arrs: Vec<(Param, VarId)>,
}

/// A non-empty stack of loop nestings, outermost first.
#[derive(Debug, Clone)]
pub struct KernelNest {
    pub levels: Vec<LoopNesting>,
}

impl KernelNest {
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn widths(&self) -> Vec<SubExp> {
        self.levels.iter().map(|l| l.w.clone()).collect()
    }

    /// The outermost pattern, bound at the top level.
    pub fn outer_pat(&self) -> &[PatElem] {
        &self.levels[0].pat
    }

    /// Follow `v` through the parameter chain of the nest. Returns the array
    /// the chain starts from, the outermost level of the chain and the level
    /// at which `v` itself is a parameter.
    pub fn input_chain(&self, v: VarId) -> Option<(VarId, usize, usize)> {
        let last = self
            .levels
            .iter()
            .rposition(|l| l.params_and_arrs.iter().any(|(p, _)| p.var == v))?;
        let mut cur = v;
        let mut first = last;
        for level in (0..=last).rev() {
            match self.levels[level].params_and_arrs.iter().find(|(p, _)| p.var == cur) {
                Some((_, arr)) => {
                    cur = *arr;
                    first = level;
                }
                None => break,
            }
        }
        Some((cur, first, last))
    }

    /// The top-level array that holds `v` for every thread of the nest, if
    /// `v` varies along every level.
    pub fn full_input(&self, v: VarId) -> Option<VarId> {
        match self.input_chain(v)? {
            (base, 0, last) if last + 1 == self.depth() => Some(base),
            _ => None,
        }
    }
}

/// The result of flattening a kernel nest into one index space.
#[derive(Debug)]
pub struct FlatKernel {
    /// Statements computing the total thread count.
    pub pre: Vec<Stm>,
    pub total: SubExp,
    pub space: Vec<(VarId, SubExp)>,
    pub inputs: Vec<KernelInput>,
}

/// Compute per-level thread ids, the total thread count and the kernel
/// inputs of every parameter in the nest. An input's index list is the chain
/// of thread ids from the level where its source array lives.
pub fn flat_kernel(ctx: &mut ExtractCtx, nest: &KernelNest) -> Result<FlatKernel> {
    let mut pre = vec![];
    let total = ctx.b.product(&mut pre, "nesting_size", &nest.widths())?;
    let mut space = vec![];
    let mut inputs: Vec<KernelInput> = vec![];
    let mut prev: HashMap<VarId, usize> = HashMap::new();
    for level in &nest.levels {
        let gtid = ctx.b.param("gtid", Type::i64()).var;
        space.push((gtid, level.w.clone()));
        let mut here = HashMap::new();
        for (p, arr) in &level.params_and_arrs {
            let inp = match prev.get(arr) {
                Some(&i) => {
                    let mut indices = inputs[i].indices.clone();
                    indices.push(SubExp::Var(gtid));
                    KernelInput {
                        param: p.clone(),
                        arr: inputs[i].arr,
                        indices,
                    }
                }
                None => KernelInput {
                    param: p.clone(),
                    arr: *arr,
                    indices: vec![SubExp::Var(gtid)],
                },
            };
            here.insert(p.var, inputs.len());
            inputs.push(inp);
        }
        prev = here;
    }
    Ok(FlatKernel {
        pre,
        total,
        space,
        inputs,
    })
}

/// Find where each declared pattern element sits in `res ++ unused`.
///
/// `res` lists the pattern names that are needed downstream, in the order the
/// kernel will produce them. Returns `perm` with `perm[i]` the position of
/// `pat[i]` in `res ++ unused`, together with the unused elements. Fails if
/// `res` names something the pattern does not bind, or names it twice.
pub fn permutation_and_missing(pat: &[PatElem], res: &[SubExp]) -> Option<(Vec<usize>, Vec<PatElem>)> {
    let mut res_vars = Vec::with_capacity(res.len());
    for se in res {
        let v = se.var()?;
        if res_vars.contains(&v) || !pat.iter().any(|pe| pe.var == v) {
            return None;
        }
        res_vars.push(v);
    }
    let unused: Vec<PatElem> = pat.iter().filter(|pe| !res_vars.contains(&pe.var)).cloned().collect();
    let order: Vec<VarId> = res_vars.iter().copied().chain(unused.iter().map(|pe| pe.var)).collect();
    let perm = pat
        .iter()
        .map(|pe| order.iter().position(|v| *v == pe.var))
        .collect::<Option<Vec<usize>>>()?;
    Some((perm, unused))
}

/// Widen every level of `nest` with placeholders for the unused outputs, so
/// each level still produces a well-typed value for every pattern element.
pub fn expand_kernel_nest(ctx: &mut ExtractCtx, unused: &[PatElem], nest: &mut KernelNest) {
    let widths = nest.widths();
    for (depth, level) in nest.levels.iter_mut().enumerate() {
        for pe in unused {
            let ty = pe.ty.array_of_dims(&widths[depth..]);
            level.pat.push(ctx.b.pat_elem(format!("{}_unused", pe.name_hint), ty));
        }
    }
}

// =============================================================================
// Accumulation
// =============================================================================

/// What a map level must produce on the way back up.
#[derive(Debug, Clone)]
pub struct Target {
    pub pat: Pat,
    pub res: Vec<SubExp>,
}

/// Targets of the enclosing map levels and the statements of the innermost
/// level not yet distributed.
#[derive(Debug, Clone, Default)]
pub struct KernelAcc {
    pub targets: Vec<Target>,
    pub stms: Vec<Stm>,
}

impl KernelAcc {
    pub fn add_stm_to_kernel(&mut self, stm: Stm) {
        self.stms.push(stm);
    }
}

/// Kernel statement groups committed so far, in execution order.
#[derive(Debug, Default)]
pub struct PostKernels(Vec<Vec<Stm>>);

impl PostKernels {
    pub fn push(&mut self, stms: Vec<Stm>) {
        if !stms.is_empty() {
            self.0.push(stms);
        }
    }

    pub fn into_stms(self) -> Vec<Stm> {
        self.0.into_iter().flatten().collect()
    }
}

/// Distribution state of one enclosing map.
#[derive(Debug)]
pub struct Nesting {
    pub loop_nesting: LoopNesting,
    /// Everything bound at this level: the map's parameters and the
    /// patterns of the body statements seen so far.
    pub bound: HashSet<VarId>,
    /// Names bound at this level that a kernel has produced for every
    /// thread, with the top-level array holding them.
    pub expanded: HashMap<VarId, VarId>,
}

/// A successful flush of the pending statements.
#[derive(Debug, Default)]
pub struct Flushed {
    pub stms: Vec<Stm>,
    pub expanded: Vec<(VarId, VarId)>,
}

/// A statement that can be lifted out of the nest.
#[derive(Debug)]
pub struct StmNest {
    pub flushed: Flushed,
    /// Live results of the statement, in the order of the nest's outer
    /// pattern.
    pub res: Vec<VarId>,
    pub nest: KernelNest,
    pub perm: Vec<usize>,
    /// The outer pattern of the nest rearranged into the statement's
    /// declared order.
    pub declared: Vec<PatElem>,
}

pub struct Distributor<'a> {
    pub(super) ctx: &'a mut ExtractCtx,
    pub(super) nest: Vec<Nesting>,
    pub(super) post: PostKernels,
}

impl<'a> Distributor<'a> {
    pub fn new(ctx: &'a mut ExtractCtx) -> Self {
        Distributor {
            ctx,
            nest: vec![],
            post: PostKernels::default(),
        }
    }

    /// Every name bound anywhere in the current nest.
    pub(super) fn nest_bound(&self) -> HashSet<VarId> {
        self.nest.iter().flat_map(|n| n.bound.iter().copied()).collect()
    }

    pub(super) fn is_regular(&self, ty: &Type, bound: &HashSet<VarId>) -> bool {
        ty.free_vars().all(|v| !bound.contains(&v))
    }

    fn widths(&self) -> Vec<SubExp> {
        self.nest.iter().map(|n| n.loop_nesting.w.clone()).collect()
    }

    /// Resolve `needed` against the nest, producing the parameters each
    /// level must receive. `pending` are expansions of the innermost level
    /// that a flush is about to commit.
    pub(super) fn build_nest(
        &mut self,
        needed: &HashSet<VarId>,
        pending: &[(VarId, VarId)],
    ) -> Result<Option<KernelNest>> {
        let bound = self.nest_bound();
        let depth = self.nest.len();
        let widths = self.widths();
        for w in &widths {
            if w.var().is_some_and(|v| bound.contains(&v)) {
                return Ok(None);
            }
        }

        let mut need: Vec<VarId> = needed.iter().copied().filter(|v| bound.contains(v)).collect();
        need.sort();
        let mut virtuals: HashMap<VarId, VarId> = HashMap::new();
        let mut params: Vec<Vec<(Param, VarId)>> = vec![vec![]; depth];

        for level in (0..depth).rev() {
            let mut next: Vec<VarId> = vec![];
            for x in need {
                let nesting = &self.nest[level];
                let expanded = nesting.expanded.get(&x).copied().or_else(|| {
                    if level + 1 == depth {
                        pending.iter().find(|(v, _)| *v == x).map(|(_, t)| *t)
                    } else {
                        None
                    }
                });
                if let Some((p, arr)) = nesting.loop_nesting.params_and_arrs.iter().find(|(p, _)| p.var == x) {
                    if !self.is_regular(&p.ty, &bound) {
                        return Ok(None);
                    }
                    if !params[level].iter().any(|(q, _)| q.var == p.var) {
                        params[level].push((p.clone(), *arr));
                    }
                    if !next.contains(arr) {
                        next.push(*arr);
                    }
                } else if let Some(top) = expanded.or_else(|| virtuals.get(&x).copied()) {
                    let ty = self.ctx.b.type_of(x)?;
                    if !self.is_regular(&ty, &bound) {
                        return Ok(None);
                    }
                    let p = Param {
                        var: x,
                        name_hint: "expanded".to_string(),
                        ty: ty.clone(),
                    };
                    if level == 0 {
                        params[0].push((p, top));
                    } else {
                        let view = self.ctx.b.param("expanded_row", ty.array_of(widths[level].clone()));
                        virtuals.insert(view.var, top);
                        params[level].push((p, view.var));
                        next.push(view.var);
                    }
                } else if nesting.bound.contains(&x) {
                    trace!("{x} is bound by an undistributed statement at level {level}");
                    return Ok(None);
                } else if !next.contains(&x) {
                    next.push(x);
                }
            }
            need = next;
        }

        let levels = self
            .nest
            .iter()
            .zip(params)
            .map(|(n, params_and_arrs)| LoopNesting {
                pat: vec![],
                certs: n.loop_nesting.certs.clone(),
                w: n.loop_nesting.w.clone(),
                params_and_arrs,
            })
            .collect();
        Ok(Some(KernelNest { levels }))
    }

    /// Give every level of `nest` a pattern for `outputs` (per-thread types
    /// at the innermost level). The outermost level uses `outer` when given,
    /// fresh names otherwise.
    pub(super) fn set_nest_outputs(
        &mut self,
        nest: &mut KernelNest,
        outputs: &[(String, Type)],
        outer: Option<Vec<PatElem>>,
    ) {
        let widths = nest.widths();
        for (depth, level) in nest.levels.iter_mut().enumerate() {
            level.pat = outputs
                .iter()
                .map(|(hint, t)| self.ctx.b.pat_elem(hint.clone(), t.array_of_dims(&widths[depth..])))
                .collect();
        }
        if let Some(outer) = outer {
            nest.levels[0].pat = outer;
        }
    }

    /// Flush the pending statements of the innermost level into one kernel.
    /// `live` are the names needed after them.
    pub(super) fn try_distribute(&mut self, acc: &KernelAcc, live: &HashSet<VarId>) -> Result<Option<Flushed>> {
        if acc.stms.is_empty() {
            return Ok(Some(Flushed::default()));
        }
        let bound = bound_by_stms(&acc.stms);
        let outputs: Vec<PatElem> = acc
            .stms
            .iter()
            .flat_map(|stm| stm.pat.elems().cloned().collect::<Vec<_>>())
            .filter(|pe| live.contains(&pe.var) && bound.contains(&pe.var))
            .collect();
        let nest_bound = self.nest_bound();
        if !outputs.iter().all(|pe| self.is_regular(&pe.ty, &nest_bound)) {
            return Ok(None);
        }
        let results: Vec<SubExp> = outputs.iter().map(|pe| SubExp::Var(pe.var)).collect();
        let needed = free_in_stms(&acc.stms, &results);
        let Some(mut nest) = self.build_nest(&needed, &[])? else {
            return Ok(None);
        };
        let outs: Vec<(String, Type)> = outputs.iter().map(|pe| (pe.name_hint.clone(), pe.ty.clone())).collect();
        self.set_nest_outputs(&mut nest, &outs, None);
        let ret = outputs.iter().map(|pe| pe.ty.clone()).collect();
        let stms = self.kernel_from_nest(&nest, acc.stms.clone(), results, ret, "segmap")?;
        let expanded = outputs
            .iter()
            .zip(nest.outer_pat())
            .map(|(pe, top)| (pe.var, top.var))
            .collect();
        trace!("flushed {} statements at depth {}", acc.stms.len(), self.nest.len());
        Ok(Some(Flushed { stms, expanded }))
    }

    /// Prepare lifting `stm` out of the nest: flush what is pending, then
    /// compute the statement's live results and the kernel nest it needs.
    pub(super) fn try_distribute_stm(
        &mut self,
        acc: &KernelAcc,
        stm: &Stm,
        live: &HashSet<VarId>,
    ) -> Result<Option<StmNest>> {
        if !stm.pat.ctx.is_empty() {
            return Ok(None);
        }
        let mut live_before = free_in_stm(stm);
        live_before.extend(live.iter().copied());
        let Some(flushed) = self.try_distribute(acc, &live_before)? else {
            return Ok(None);
        };

        // Names feeding the level's results come first, in result order.
        let mut res: Vec<VarId> = vec![];
        if let Some(target) = acc.targets.last() {
            for se in &target.res {
                if let Some(v) = se.var()
                    && stm.pat.vals.iter().any(|pe| pe.var == v)
                    && !res.contains(&v)
                {
                    res.push(v);
                }
            }
        }
        for pe in &stm.pat.vals {
            if live.contains(&pe.var) && !res.contains(&pe.var) {
                res.push(pe.var);
            }
        }
        let res_se: Vec<SubExp> = res.iter().map(|v| SubExp::Var(*v)).collect();
        let Some((perm, unused)) = permutation_and_missing(&stm.pat.vals, &res_se) else {
            return Ok(None);
        };

        let nest_bound = self.nest_bound();
        if !stm.pat.vals.iter().all(|pe| self.is_regular(&pe.ty, &nest_bound)) {
            return Ok(None);
        }
        let Some(mut nest) = self.build_nest(&free_in_stm(stm), &flushed.expanded)? else {
            return Ok(None);
        };
        let outs: Vec<(String, Type)> = res
            .iter()
            .filter_map(|v| stm.pat.vals.iter().find(|pe| pe.var == *v))
            .map(|pe| (pe.name_hint.clone(), pe.ty.clone()))
            .collect();
        self.set_nest_outputs(&mut nest, &outs, None);
        expand_kernel_nest(self.ctx, &unused, &mut nest);
        let declared = perm.iter().map(|&k| nest.outer_pat()[k].clone()).collect();
        Ok(Some(StmNest {
            flushed,
            res,
            nest,
            perm,
            declared,
        }))
    }

    /// Commit a flush: its kernels run now and its outputs become expanded
    /// names of the innermost level.
    pub(super) fn commit_flush(&mut self, acc: &mut KernelAcc, flushed: Flushed) {
        acc.stms.clear();
        self.post.push(flushed.stms);
        if let Some(level) = self.nest.last_mut() {
            level.expanded.extend(flushed.expanded);
        }
    }

    /// Commit a lifted statement whose kernels compute `stms`.
    pub(super) fn commit_stm(&mut self, acc: &mut KernelAcc, lifted: StmNest, stms: Vec<Stm>) {
        let StmNest { flushed, res, nest, .. } = lifted;
        self.commit_flush(acc, flushed);
        self.post.push(stms);
        if let Some(level) = self.nest.last_mut() {
            for (v, top) in res.iter().zip(nest.outer_pat()) {
                level.expanded.insert(*v, top.var);
            }
        }
    }

    /// A thread-level kernel running `stms` once per point of `nest`, bound
    /// to the nest's outer pattern.
    pub(super) fn kernel_from_nest(
        &mut self,
        nest: &KernelNest,
        stms: Vec<Stm>,
        results: Vec<SubExp>,
        ret: Vec<Type>,
        desc: &str,
    ) -> Result<Vec<Stm>> {
        let FlatKernel {
            mut pre,
            total,
            space,
            mut inputs,
        } = flat_kernel(self.ctx, nest)?;
        let body_stms = first_order_stms(&mut self.ctx.b, stms)?;
        let used = free_in_stms(&body_stms, &results);
        inputs.retain(|inp| used.contains(&inp.param.var));
        let kernel = thread_kernel(self.ctx, &mut pre, desc, total, space, inputs, body_stms, results, ret)?;
        pre.push(Stm::new(Pat::new(nest.outer_pat().to_vec()), kernel));
        Ok(pre)
    }
}

/// A thread-level kernel over `space` with one group per `group_size`
/// threads.
#[allow(clippy::too_many_arguments)]
pub(super) fn thread_kernel(
    ctx: &mut ExtractCtx,
    pre: &mut Vec<Stm>,
    desc: &str,
    total: SubExp,
    space: Vec<(VarId, SubExp)>,
    inputs: Vec<KernelInput>,
    stms: Vec<Stm>,
    results: Vec<SubExp>,
    ret: Vec<Type>,
) -> Result<Exp> {
    let group_size = get_size(ctx, "group_size", SizeClass::GroupSize, pre)?;
    let num_groups = ctx.b.div_up(pre, "num_groups", total, group_size.clone())?;
    let global_tid = match space.as_slice() {
        [(gtid, _)] => *gtid,
        _ => ctx.b.param("global_tid", Type::i64()).var,
    };
    Ok(Exp::Op(Op::Kernel(Box::new(Kernel {
        desc: desc.to_string(),
        space: KernelSpace {
            level: SegLevel::Thread,
            global_tid,
            group_size,
            num_groups,
            dims: space,
        },
        inputs,
        body: KernelBody {
            stms,
            results: results.into_iter().map(KernelResult::Threads).collect(),
        },
        ret,
    }))))
}
