//! The distribution walk.
//!
//! Entering a map pushes a nesting and walks its body statement by
//! statement. Each statement is either pulled out of the nest (a nested map
//! opens a new level, other parallel statements become segmented operations
//! or are interchanged outwards) or added to the pending kernel of the
//! innermost level. Leaving a level turns whatever is still pending into a
//! kernel over the whole nest.

use std::collections::HashSet;

use log::trace;

use crate::bail_internal;
use crate::error::Result;
use crate::ir::free::free_in_stm;
use crate::ir::{Certs, Exp, Lambda, Map, Op, Param, Pat, Soac, Stm, SubExp, Type, VarId, lambda_has_soacs};

use super::balance::unbalanced_lambda;
use super::distribution::{Distributor, Flushed, KernelAcc, LoopNesting, Nesting, StmNest, Target};
use super::interchange::{interchange_branch, interchange_loop};
use super::iswim::{irwim, iswim};
use super::segmented::{segmented_array_op, segmented_redomap, segmented_scanomap, segmented_scatter};
use super::{inline_stream, reduce_as_redomap, scan_as_scanomap, transform_stms, with_loop_stms};

impl Distributor<'_> {
    /// Distribute `map`, bound to `pat`, one level deeper than the current
    /// nest.
    pub(super) fn enter_map(&mut self, mut acc: KernelAcc, pat: Pat, certs: Certs, map: Map) -> Result<KernelAcc> {
        let Map { w, lam, arrs } = map;
        let Lambda { params, body, .. } = lam;
        let bound: HashSet<VarId> = params.iter().map(|p| p.var).collect();
        self.nest.push(Nesting {
            loop_nesting: LoopNesting {
                pat: pat.vals.clone(),
                certs,
                w,
                params_and_arrs: params.into_iter().zip(arrs).collect(),
            },
            bound,
            expanded: Default::default(),
        });
        trace!("entering map at depth {}", self.nest.len());
        let live: HashSet<VarId> = body.result.iter().filter_map(SubExp::var).collect();
        acc.targets.push(Target {
            pat,
            res: body.result,
        });
        let acc = self.distribute_stms(acc, body.stms, &live)?;
        self.leave_level(acc)
    }

    /// Walk `stms` of the innermost level. `live_out` are the names needed
    /// after the last of them.
    fn distribute_stms(&mut self, mut acc: KernelAcc, stms: Vec<Stm>, live_out: &HashSet<VarId>) -> Result<KernelAcc> {
        let mut lives = vec![HashSet::new(); stms.len()];
        let mut live = live_out.clone();
        for (k, stm) in stms.iter().enumerate().rev() {
            lives[k] = live.clone();
            live.extend(free_in_stm(stm));
        }
        for (stm, live) in stms.into_iter().zip(lives) {
            if let Some(level) = self.nest.last_mut() {
                level.bound.extend(stm.pat.names());
            }
            acc = self.distribute_stm(acc, stm, &live)?;
        }
        Ok(acc)
    }

    fn distribute_stm(&mut self, mut acc: KernelAcc, stm: Stm, live: &HashSet<VarId>) -> Result<KernelAcc> {
        match &stm.exp {
            Exp::Op(Op::Soac(Soac::Map(map))) => {
                if !stm.pat.ctx.is_empty() || (unbalanced_lambda(&map.lam) && lambda_has_soacs(&map.lam)) {
                    acc.add_stm_to_kernel(stm);
                    return Ok(acc);
                }
                let mut live_before = free_in_stm(&stm);
                live_before.extend(live.iter().copied());
                match self.try_distribute(&acc, &live_before)? {
                    Some(flushed) if self.map_resolvable(&stm, map, &flushed) => {
                        self.commit_flush(&mut acc, flushed);
                        let Stm {
                            pat,
                            certs,
                            exp: Exp::Op(Op::Soac(Soac::Map(map))),
                        } = stm
                        else {
                            bail_internal!("expected a map");
                        };
                        self.enter_map(acc, pat, certs, map)
                    }
                    _ => {
                        acc.add_stm_to_kernel(stm);
                        Ok(acc)
                    }
                }
            }
            Exp::Op(Op::Soac(Soac::Reduce(red))) => {
                if let Some(stms) = irwim(self.ctx, &stm.pat, red)? {
                    return self.distribute_stms(acc, stms, live);
                }
                self.lift_stm(acc, stm, live)
            }
            Exp::Op(Op::Soac(Soac::Scan(scan))) => {
                if let Some(stms) = iswim(self.ctx, &stm.pat, scan)? {
                    return self.distribute_stms(acc, stms, live);
                }
                self.lift_stm(acc, stm, live)
            }
            Exp::Op(Op::Soac(Soac::Stream(_))) => {
                let Stm {
                    pat,
                    exp: Exp::Op(Op::Soac(Soac::Stream(stream))),
                    ..
                } = stm
                else {
                    bail_internal!("expected a stream");
                };
                let stms = inline_stream(self.ctx, pat, stream)?;
                self.distribute_stms(acc, stms, live)
            }
            Exp::Op(Op::Soac(Soac::WithLoop(_))) => {
                let Stm {
                    pat,
                    certs,
                    exp: Exp::Op(Op::Soac(Soac::WithLoop(wl))),
                } = stm
                else {
                    bail_internal!("expected a with-loop");
                };
                let stms = with_loop_stms(self.ctx, pat, certs, wl)?;
                self.distribute_stms(acc, stms, live)
            }
            Exp::Op(Op::Soac(Soac::Redomap(_) | Soac::Scanomap(_) | Soac::Scatter(_)))
            | Exp::Rearrange { .. }
            | Exp::Reshape { .. }
            | Exp::Copy(_)
            | Exp::Concat { .. } => self.lift_stm(acc, stm, live),
            Exp::Loop { .. } | Exp::If { .. } if crate::ir::stm_has_soacs(&stm) => self.lift_stm(acc, stm, live),
            _ => {
                acc.add_stm_to_kernel(stm);
                Ok(acc)
            }
        }
    }

    /// Whether a nested map can open a new level after `flushed` commits.
    fn map_resolvable(&self, stm: &Stm, map: &Map, flushed: &Flushed) -> bool {
        let bound = self.nest_bound();
        if map.w.var().is_some_and(|v| bound.contains(&v)) {
            return false;
        }
        free_in_stm(stm).iter().filter(|v| bound.contains(*v)).all(|v| {
            flushed.expanded.iter().any(|(x, _)| x == v)
                || self.nest.iter().any(|n| {
                    n.expanded.contains_key(v) || n.loop_nesting.params_and_arrs.iter().any(|(p, _)| p.var == *v)
                })
        })
    }

    /// Pull `stm` out of the nest as an operation over the whole nest, or
    /// add it to the pending kernel when that is not possible.
    fn lift_stm(&mut self, mut acc: KernelAcc, stm: Stm, live: &HashSet<VarId>) -> Result<KernelAcc> {
        let Some(lifted) = self.try_distribute_stm(&acc, &stm, live)? else {
            acc.add_stm_to_kernel(stm);
            return Ok(acc);
        };
        match self.build_lifted(&lifted, stm.clone())? {
            Some(stms) => {
                self.commit_stm(&mut acc, lifted, stms);
                Ok(acc)
            }
            None => {
                trace!("could not lift {}; sequentialising it", stm_kind(&stm));
                acc.add_stm_to_kernel(stm);
                Ok(acc)
            }
        }
    }

    fn build_lifted(&mut self, lifted: &StmNest, stm: Stm) -> Result<Option<Vec<Stm>>> {
        let bound = self.nest_bound();
        let nest = &lifted.nest;
        let declared = lifted.declared.clone();
        let ctx = &mut *self.ctx;
        let built = match stm.exp {
            Exp::Loop { merge, form, body } => {
                match interchange_loop(ctx, nest, &bound, declared, merge, form, body)? {
                    Some(stms) => Some(transform_stms(ctx, stms)?),
                    None => None,
                }
            }
            Exp::If {
                cond,
                then_body,
                else_body,
                ret,
            } => match interchange_branch(ctx, nest, &bound, declared, cond, then_body, else_body, &ret)? {
                Some(stms) => Some(transform_stms(ctx, stms)?),
                None => None,
            },
            Exp::Op(Op::Soac(Soac::Reduce(red))) => {
                let redomap = reduce_as_redomap(ctx, red)?;
                segmented_redomap(ctx, nest, &bound, declared, redomap)?
            }
            Exp::Op(Op::Soac(Soac::Scan(scan))) => {
                let scanomap = scan_as_scanomap(ctx, scan)?;
                segmented_scanomap(ctx, nest, &bound, declared, scanomap)?
            }
            Exp::Op(Op::Soac(Soac::Redomap(redomap))) => segmented_redomap(ctx, nest, &bound, declared, redomap)?,
            Exp::Op(Op::Soac(Soac::Scanomap(scanomap))) => segmented_scanomap(ctx, nest, &bound, declared, scanomap)?,
            Exp::Op(Op::Soac(Soac::Scatter(scatter))) => segmented_scatter(ctx, nest, &bound, declared, scatter)?,
            exp => segmented_array_op(nest, &bound, declared, &exp),
        };
        Ok(built)
    }

    /// Close the innermost level. Pending statements and results not
    /// already expanded become one kernel over the nest.
    fn leave_level(&mut self, mut acc: KernelAcc) -> Result<KernelAcc> {
        let Some(target) = acc.targets.last().cloned() else {
            bail_internal!("leaving a map level without a target");
        };
        let Some(level) = self.nest.len().checked_sub(1) else {
            bail_internal!("leaving a map level outside any nest");
        };
        let mut direct: Vec<(usize, VarId)> = vec![];
        let mut computed: Vec<usize> = vec![];
        for (j, se) in target.res.iter().enumerate() {
            match se.var().and_then(|v| self.nest[level].expanded.get(&v)) {
                Some(top) => direct.push((j, *top)),
                None => computed.push(j),
            }
        }
        let pat_vals = target.pat.vals.clone();

        if !computed.is_empty() || !acc.stms.is_empty() {
            let results: Vec<SubExp> = computed.iter().map(|&j| target.res[j].clone()).collect();
            let outs: Vec<(String, Type)> = computed
                .iter()
                .map(|&j| (pat_vals[j].name_hint.clone(), pat_vals[j].ty.row_type()))
                .collect();
            let nest_bound = self.nest_bound();
            let nest = if outs.iter().all(|(_, t)| self.is_regular(t, &nest_bound)) {
                let needed = crate::ir::free::free_in_stms(&acc.stms, &results);
                self.build_nest(&needed, &[])?
            } else {
                None
            };
            let Some(mut nest) = nest else {
                if level == 0 {
                    bail_internal!("the outermost map level could not be turned into a kernel");
                }
                return self.reform_level(acc);
            };
            let outer = (level == 0).then(|| computed.iter().map(|&j| pat_vals[j].clone()).collect());
            self.set_nest_outputs(&mut nest, &outs, outer);
            let ret = outs.into_iter().map(|(_, t)| t).collect();
            let stms = std::mem::take(&mut acc.stms);
            let kernel = self.kernel_from_nest(&nest, stms, results, ret, "segmap")?;
            self.post.push(kernel);
            for (&j, top) in computed.iter().zip(nest.outer_pat()) {
                direct.push((j, top.var));
            }
        }

        acc.targets.pop();
        self.nest.pop();
        trace!("left map level {level}");
        match self.nest.last_mut() {
            Some(parent) => {
                for (j, top) in direct {
                    parent.expanded.insert(pat_vals[j].var, top);
                }
            }
            None => {
                // Results computed by a kernel at the outermost level are
                // already bound to the map's own pattern.
                let aliases = direct
                    .into_iter()
                    .filter(|(j, top)| pat_vals[*j].var != *top)
                    .map(|(j, top)| Stm::new(Pat::new(vec![pat_vals[j].clone()]), Exp::SubExp(SubExp::Var(top))))
                    .collect();
                self.post.push(aliases);
            }
        }
        Ok(acc)
    }

    /// Give up on distributing the innermost level: rebuild its map from the
    /// pending statements and add it to the pending statements of the
    /// parent. Names already expanded at this level are passed in as extra
    /// parameters drawn from their top-level arrays.
    fn reform_level(&mut self, mut acc: KernelAcc) -> Result<KernelAcc> {
        let (Some(target), Some(nesting)) = (acc.targets.pop(), self.nest.pop()) else {
            bail_internal!("reforming a map level outside any nest");
        };
        let Some(parent) = self.nest.last_mut() else {
            bail_internal!("reforming the outermost map level");
        };
        let LoopNesting {
            certs,
            w,
            params_and_arrs,
            ..
        } = nesting.loop_nesting;
        let (mut params, mut arrs): (Vec<Param>, Vec<VarId>) = params_and_arrs.into_iter().unzip();

        let used = crate::ir::free::free_in_stms(&acc.stms, &target.res);
        let mut expanded: Vec<(VarId, VarId)> = nesting.expanded.into_iter().filter(|(x, _)| used.contains(x)).collect();
        expanded.sort();
        for (x, top) in expanded {
            let ty = self.ctx.b.type_of(x)?;
            let view = self.ctx.b.param("expanded_row", ty.array_of(w.clone()));
            params.push(Param {
                var: x,
                name_hint: "expanded".to_string(),
                ty,
            });
            arrs.push(view.var);
            parent.expanded.insert(view.var, top);
            parent.bound.insert(view.var);
        }

        let ret = target.pat.vals.iter().map(|pe| pe.ty.row_type()).collect();
        let lam = Lambda {
            params,
            body: crate::ir::Body::new(std::mem::take(&mut acc.stms), target.res),
            ret,
        };
        acc.add_stm_to_kernel(Stm {
            pat: target.pat,
            certs,
            exp: Exp::Op(Op::Soac(Soac::Map(Map { w, lam, arrs }))),
        });
        self.ctx.log(format!("map level {} left undistributed", self.nest.len()));
        Ok(acc)
    }
}

fn stm_kind(stm: &Stm) -> &'static str {
    match &stm.exp {
        Exp::Op(Op::Soac(soac)) => soac.name(),
        Exp::Loop { .. } => "loop",
        Exp::If { .. } => "branch",
        _ => "array operation",
    }
}
