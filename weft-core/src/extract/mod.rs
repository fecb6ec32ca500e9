//! Kernel extraction.
//!
//! Rewrites the SOACs of every function into kernels. Maps are distributed:
//! the statements of a map body are split into groups that become separate
//! kernels over the whole map nest, so nested parallelism ends up as flat
//! parallelism over the product of the nest widths. Nested reductions and
//! scans become segmented operations, loops and branches are interchanged
//! outwards, and whatever cannot be distributed is sequentialised inside the
//! surrounding kernel.
//!
//! With incremental flattening enabled, a map with inner parallelism is
//! compiled into several versions selected at run time by threshold
//! comparisons (see `threshold`).

pub mod balance;
mod blocked;
pub mod distribution;
mod engine;
mod interchange;
mod intra_group;
mod iswim;
mod segmented;
pub mod threshold;

use log::debug;

use crate::error::Result;
use crate::ir::builder::IrBuilder;
use crate::ir::rename::rename_fun;
use crate::ir::{
    Body, Certs, Exp, FunDef, Lambda, Map, Op, Pat, Program, Reduce, Redomap, Scan, Scanomap, Soac, Stm, Stream,
    StreamForm, WithLoop, lambda_has_soacs,
};
use crate::bail_internal;
use crate::first_order::{bind_params, with_loop_as_scatter};

use balance::{worth_intra_group, worth_sequentialising};
use blocked::{blocked_reduction, blocked_scan, map_kernel, scatter_kernel, stream_reduction};
use distribution::{Distributor, KernelAcc};
use intra_group::intra_group_version;
use iswim::{irwim, iswim};
use threshold::{Alternative, kernel_alternatives, sufficient_parallelism};

pub use threshold::collect_sizes;

// =============================================================================
// Configuration and context
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct ExtractConfig {
    /// Build several versions of maps with inner parallelism and pick one at
    /// run time.
    pub incremental_flattening: bool,
}

impl ExtractConfig {
    pub const INCREMENTAL_FLATTENING_VAR: &'static str = "WEFT_INCREMENTAL_FLATTENING";

    /// Read the configuration from the environment. Incremental flattening
    /// is on when `WEFT_INCREMENTAL_FLATTENING` is `1`, `true` or `yes`.
    pub fn from_env() -> Self {
        let incremental_flattening = std::env::var(Self::INCREMENTAL_FLATTENING_VAR)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        ExtractConfig {
            incremental_flattening,
        }
    }
}

/// Per-function state of extraction.
pub struct ExtractCtx {
    pub b: IrBuilder,
    pub config: ExtractConfig,
    fun_name: String,
    next_size: usize,
    log: Vec<String>,
}

impl ExtractCtx {
    pub fn new(fun: &FunDef, config: &ExtractConfig) -> Self {
        ExtractCtx {
            b: IrBuilder::for_fun(fun),
            config: config.clone(),
            fun_name: fun.name.clone(),
            next_size: 0,
            log: vec![],
        }
    }

    /// A program-unique name for a tunable size.
    pub fn size_name(&mut self, desc: &str) -> String {
        let name = format!("{}.{}_{}", self.fun_name, desc, self.next_size);
        self.next_size += 1;
        name
    }

    pub fn log(&mut self, msg: String) {
        debug!("{}: {msg}", self.fun_name);
        self.log.push(format!("{}: {msg}", self.fun_name));
    }
}

// =============================================================================
// Entry points
// =============================================================================

/// Extract kernels from every function of `program`. Returns the new
/// program together with a log of the decisions taken.
pub fn extract_kernels(program: Program, config: &ExtractConfig) -> Result<(Program, Vec<String>)> {
    let mut funs = Vec::with_capacity(program.funs.len());
    let mut log = vec![];
    for fun in program.funs {
        let (fun, fun_log) = extract_fun(fun, config)?;
        funs.push(fun);
        log.extend(fun_log);
    }
    Ok((Program { funs }, log))
}

fn extract_fun(fun: FunDef, config: &ExtractConfig) -> Result<(FunDef, Vec<String>)> {
    let mut ctx = ExtractCtx::new(&fun, config);
    let FunDef {
        name,
        params,
        ret,
        body,
    } = fun;
    let body = transform_body(&mut ctx, body)?;
    let fun = rename_fun(
        FunDef {
            name,
            params,
            ret,
            body,
        },
        &mut ctx.b,
    );
    Ok((fun, ctx.log))
}

pub(crate) fn transform_body(ctx: &mut ExtractCtx, body: Body) -> Result<Body> {
    Ok(Body {
        stms: transform_stms(ctx, body.stms)?,
        result: body.result,
    })
}

pub(crate) fn transform_stms(ctx: &mut ExtractCtx, stms: Vec<Stm>) -> Result<Vec<Stm>> {
    let mut out = Vec::with_capacity(stms.len());
    for stm in stms {
        out.extend(transform_stm(ctx, stm)?);
    }
    Ok(out)
}

/// Transform one statement at the top level of a function (outside any
/// kernel).
fn transform_stm(ctx: &mut ExtractCtx, stm: Stm) -> Result<Vec<Stm>> {
    let Stm { pat, certs, exp } = stm;
    let exp = match exp {
        Exp::Op(Op::Soac(soac)) => return transform_soac(ctx, pat, certs, soac),
        Exp::If {
            cond,
            then_body,
            else_body,
            ret,
        } => Exp::If {
            cond,
            then_body: transform_body(ctx, then_body)?,
            else_body: transform_body(ctx, else_body)?,
            ret,
        },
        Exp::Loop { merge, form, body } => Exp::Loop {
            merge,
            form,
            body: transform_body(ctx, body)?,
        },
        exp => exp,
    };
    Ok(vec![Stm { pat, certs, exp }])
}

fn transform_soac(ctx: &mut ExtractCtx, pat: Pat, certs: Certs, soac: Soac) -> Result<Vec<Stm>> {
    match soac {
        Soac::Map(map) => distribute_top_map(ctx, pat, certs, map),
        Soac::Reduce(red) => {
            if let Some(stms) = irwim(ctx, &pat, &red)? {
                return transform_stms(ctx, stms);
            }
            let redomap = reduce_as_redomap(ctx, red)?;
            blocked_reduction(ctx, pat, redomap)
        }
        Soac::Scan(scan) => {
            if let Some(stms) = iswim(ctx, &pat, &scan)? {
                return transform_stms(ctx, stms);
            }
            let scanomap = scan_as_scanomap(ctx, scan)?;
            blocked_scan(ctx, pat, scanomap)
        }
        Soac::Redomap(redomap) => blocked_reduction(ctx, pat, redomap),
        Soac::Scanomap(scanomap) => blocked_scan(ctx, pat, scanomap),
        Soac::Stream(stream) => match stream.form.clone() {
            StreamForm::Parallel { comm, red_lam, .. } if stream.lam.ret.len() == stream.accs.len() => {
                stream_reduction(ctx, pat, stream, comm, red_lam)
            }
            _ => {
                let stms = inline_stream(ctx, pat, stream)?;
                transform_stms(ctx, stms)
            }
        },
        Soac::Scatter(scatter) => scatter_kernel(ctx, pat, scatter),
        Soac::WithLoop(wl) => {
            let stms = with_loop_stms(ctx, pat, certs, wl)?;
            transform_stms(ctx, stms)
        }
    }
}

// =============================================================================
// Maps
// =============================================================================

/// Distribute a map at the top level, building run-time selected versions
/// when incremental flattening is enabled.
fn distribute_top_map(ctx: &mut ExtractCtx, pat: Pat, certs: Certs, map: Map) -> Result<Vec<Stm>> {
    if !ctx.config.incremental_flattening || !lambda_has_soacs(&map.lam) {
        return distribute_map_nest(ctx, pat, certs, map);
    }
    let fresh = |ctx: &mut ExtractCtx| Pat::new(pat.vals.iter().map(|pe| ctx.b.fresh_like(pe)).collect());

    let par_pat = fresh(ctx);
    let par_stms = distribute_map_nest(ctx, par_pat.clone(), certs, map.clone())?;
    let default = Body::new(par_stms, par_pat.results());

    let mut alts = vec![];
    if worth_sequentialising(&map.lam) {
        let mut cond_stms = vec![];
        let cond = sufficient_parallelism(ctx, "suff_outer_par", map.w.clone(), &mut cond_stms)?;
        let seq_pat = fresh(ctx);
        let seq_stms = map_kernel(ctx, seq_pat.clone(), map.clone())?;
        alts.push(Alternative {
            cond_stms,
            cond,
            body: Body::new(seq_stms, seq_pat.results()),
        });
    }
    if worth_intra_group(&map.lam) {
        let intra_pat = fresh(ctx);
        if let Some((mut stms, intra_par)) = intra_group_version(ctx, intra_pat.clone(), map.clone())? {
            // Everything but the kernel computes the group size.
            let kernel = stms.pop();
            let mut cond_stms = stms;
            let cond = sufficient_parallelism(ctx, "suff_intra_par", intra_par, &mut cond_stms)?;
            alts.push(Alternative {
                cond_stms,
                cond,
                body: Body::new(kernel.into_iter().collect(), intra_pat.results()),
            });
        }
    }
    ctx.log(format!("map with inner parallelism compiled to {} versions", alts.len() + 1));
    Ok(kernel_alternatives(ctx, pat, default, alts))
}

/// Distribute a map nest as far as possible.
pub(crate) fn distribute_map_nest(ctx: &mut ExtractCtx, pat: Pat, certs: Certs, map: Map) -> Result<Vec<Stm>> {
    let mut d = Distributor::new(ctx);
    let acc = d.enter_map(KernelAcc::default(), pat, certs, map)?;
    if !acc.stms.is_empty() || !acc.targets.is_empty() {
        bail_internal!("distribution left {} statements undistributed", acc.stms.len());
    }
    Ok(d.post.into_stms())
}

// =============================================================================
// Rewrites shared with the distributor
// =============================================================================

/// A reduction is a redomap whose map is the identity.
pub(crate) fn reduce_as_redomap(ctx: &mut ExtractCtx, red: Reduce) -> Result<Redomap> {
    let Reduce {
        w,
        comm,
        lam,
        nes,
        arrs,
    } = red;
    let map_lam = identity_over_rows(ctx, &arrs)?;
    Ok(Redomap {
        w,
        comm,
        red_lam: lam,
        map_lam,
        nes,
        arrs,
    })
}

pub(crate) fn scan_as_scanomap(ctx: &mut ExtractCtx, scan: Scan) -> Result<Scanomap> {
    let Scan { w, lam, nes, arrs } = scan;
    let map_lam = identity_over_rows(ctx, &arrs)?;
    Ok(Scanomap {
        w,
        scan_lam: lam,
        map_lam,
        nes,
        arrs,
    })
}

fn identity_over_rows(ctx: &mut ExtractCtx, arrs: &[crate::ir::VarId]) -> Result<Lambda> {
    let rows = arrs
        .iter()
        .map(|arr| Ok(ctx.b.type_of(*arr)?.row_type()))
        .collect::<Result<Vec<_>>>()?;
    Ok(ctx.b.identity_lambda(&rows))
}

/// A with-loop as the scatter over its generator.
pub(crate) fn with_loop_stms(ctx: &mut ExtractCtx, pat: Pat, certs: Certs, wl: WithLoop) -> Result<Vec<Stm>> {
    let mut out = vec![];
    let scatter = with_loop_as_scatter(&mut ctx.b, wl, &mut out)?;
    out.push(Stm {
        pat,
        certs,
        exp: Exp::Op(Op::Soac(Soac::Scatter(scatter))),
    });
    ctx.log("with-loop rewritten as scatter".to_string());
    Ok(out)
}

/// Run a stream as a single chunk covering the whole input. The lambda body
/// is spliced in unchanged so its parallelism can still be extracted.
pub(crate) fn inline_stream(ctx: &mut ExtractCtx, pat: Pat, stream: Stream) -> Result<Vec<Stm>> {
    let Stream { w, lam, accs, arrs, .. } = stream;
    let mut out = vec![];
    let mut args = vec![w];
    args.extend(accs);
    args.extend(arrs.into_iter().map(crate::ir::SubExp::Var));
    bind_params(&lam.params, args, &mut out)?;
    out.extend(lam.body.stms);
    for (pe, se) in pat.vals.into_iter().zip(lam.body.result) {
        out.push(Stm::new(Pat::new(vec![pe]), Exp::SubExp(se)));
    }
    ctx.log("inlined stream as one chunk".to_string());
    Ok(out)
}
