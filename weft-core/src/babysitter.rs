//! Kernel babysitting.
//!
//! Rewrites the arrays read by thread-level kernels so that neighbouring
//! threads touch neighbouring memory. Every access of an array from outside
//! the kernel (kernel inputs and `Index` statements in the body) is
//! classified with a variance table recording which thread ids each name
//! depends on:
//!
//! 1. indexed exactly by thread ids: the array is manifested with its
//!    dimensions in thread order, innermost thread id fastest;
//! 2. indexed by thread-variant values with a sequentially traversed
//!    remainder: the thread-indexed dimensions are moved innermost, unless
//!    the remainder is tiny;
//! 3. a unit-stride slice of `per` elements starting at `t * per`: the array
//!    is padded, split into chunks and stored chunk-transposed;
//! 4. anything else: left alone, unless the array is known to be stored in
//!    a non row-major order, in which case it is manifested row-major.
//!
//! All rewrites use `Manifest`, which is logically the identity, so values
//! never change. Replacements are shared by all accesses with the same
//! array and slice within one kernel, and arrays whose layout already fits
//! are left alone, which makes the pass idempotent.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::error::Result;
use crate::ir::builder::IrBuilder;
use crate::ir::free::{binders_in_stm, free_in_stm};
use crate::ir::{
    BinOp, Body, DimIndex, Exp, FunDef, Kernel, KernelResult, Op, Program, SegLevel, Shape, Stm, SubExp, VarId,
};

/// What is known about how an array is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Layout {
    RowMajor,
    /// Physical dimension order, outermost first.
    Permuted(Vec<usize>),
    /// Padded and stored chunk by chunk.
    Chunked,
}

impl Layout {
    fn permuted(perm: Vec<usize>) -> Layout {
        if is_identity(&perm) {
            Layout::RowMajor
        } else {
            Layout::Permuted(perm)
        }
    }

    fn fits(&self, want: &[usize]) -> bool {
        match self {
            Layout::RowMajor => is_identity(want),
            Layout::Permuted(perm) => perm == want,
            Layout::Chunked => false,
        }
    }
}

fn is_identity(perm: &[usize]) -> bool {
    perm.iter().enumerate().all(|(i, p)| i == *p)
}

fn inverse(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0; perm.len()];
    for (k, &p) in perm.iter().enumerate() {
        inv[p] = k;
    }
    inv
}

/// Rows with fewer than four elements in total are not worth transposing.
/// Unknown or overflowing row sizes count as large.
pub(crate) fn tiny_rows(dims: &[SubExp]) -> bool {
    dims.iter()
        .try_fold(1i64, |acc, d| d.const_i64().and_then(|n| acc.checked_mul(n)))
        .is_some_and(|n| n < 4)
}

enum Access {
    ThreadPermutation(Vec<usize>),
    ThreadRows(usize),
    Chunked(SubExp),
    Other,
}

/// Per-kernel state.
struct KernelSite {
    gtids: Vec<VarId>,
    bound: HashSet<VarId>,
    variance: HashMap<VarId, HashSet<VarId>>,
    defs: HashMap<VarId, Exp>,
    replacements: HashMap<(VarId, Vec<DimIndex>), VarId>,
}

impl KernelSite {
    fn variant(&self, se: &SubExp) -> bool {
        se.var()
            .is_some_and(|v| self.variance.get(&v).is_some_and(|deps| !deps.is_empty()))
    }

    fn invariant(&self, se: &SubExp) -> bool {
        se.var().is_none_or(|v| !self.bound.contains(&v))
    }
}

pub struct Babysitter {
    b: IrBuilder,
    layouts: HashMap<VarId, Layout>,
}

impl Babysitter {
    pub fn new(fun: &FunDef) -> Self {
        Babysitter {
            b: IrBuilder::for_fun(fun),
            layouts: HashMap::new(),
        }
    }

    fn layout(&self, v: VarId) -> Layout {
        self.layouts.get(&v).cloned().unwrap_or(Layout::RowMajor)
    }

    pub fn babysit_body(&mut self, body: Body) -> Result<Body> {
        Ok(Body {
            stms: self.babysit_stms(body.stms)?,
            result: body.result,
        })
    }

    fn babysit_stms(&mut self, stms: Vec<Stm>) -> Result<Vec<Stm>> {
        let mut out = vec![];
        for stm in stms {
            let Stm { pat, certs, exp } = stm;
            let exp = match exp {
                Exp::Op(Op::Kernel(kernel)) if kernel.space.level == SegLevel::Thread => {
                    Exp::Op(Op::Kernel(Box::new(self.babysit_kernel(*kernel, &mut out)?)))
                }
                Exp::If {
                    cond,
                    then_body,
                    else_body,
                    ret,
                } => Exp::If {
                    cond,
                    then_body: self.babysit_body(then_body)?,
                    else_body: self.babysit_body(else_body)?,
                    ret,
                },
                Exp::Loop { merge, form, body } => Exp::Loop {
                    merge,
                    form,
                    body: self.babysit_body(body)?,
                },
                exp => exp,
            };
            let stm = Stm { pat, certs, exp };
            self.record_layout(&stm);
            out.push(stm);
        }
        Ok(out)
    }

    /// Learn the layout of the names bound by `stm` from its expression.
    fn record_layout(&mut self, stm: &Stm) {
        if let Exp::Op(Op::Kernel(kernel)) = &stm.exp {
            if kernel.space.level != SegLevel::Thread {
                return;
            }
            // Per-thread arrays are stored with the thread dimensions
            // innermost.
            let depth = kernel.space.dims.len();
            for ((pe, res), ty) in stm.pat.vals.iter().zip(&kernel.body.results).zip(&kernel.ret) {
                if matches!(res, KernelResult::Threads(_)) && ty.rank() > 0 {
                    let mut perm: Vec<usize> = (depth..depth + ty.rank()).collect();
                    perm.extend(0..depth);
                    self.layouts.insert(pe.var, Layout::permuted(perm));
                }
            }
            return;
        }
        let [pe] = stm.pat.vals.as_slice() else {
            return;
        };
        let layout = match &stm.exp {
            Exp::Manifest { perm, .. } => Layout::permuted(perm.clone()),
            Exp::Rearrange { perm, arr } => {
                let inv = inverse(perm);
                match self.layout(*arr) {
                    Layout::RowMajor => Layout::permuted(inv),
                    Layout::Permuted(phys) => Layout::permuted(phys.iter().map(|d| inv[*d]).collect()),
                    Layout::Chunked => Layout::Chunked,
                }
            }
            Exp::Reshape { arr, .. } => match self.layout(*arr) {
                Layout::RowMajor => return,
                _ => Layout::Chunked,
            },
            Exp::Index { arr, slice } if slice.iter().all(|d| d.fixed().is_none()) => match self.layout(*arr) {
                Layout::Chunked => Layout::Chunked,
                _ => return,
            },
            _ => return,
        };
        self.layouts.insert(pe.var, layout);
    }

    fn babysit_kernel(&mut self, mut kernel: Kernel, out: &mut Vec<Stm>) -> Result<Kernel> {
        let mut site = self.kernel_site(&kernel);
        let mut inputs = std::mem::take(&mut kernel.inputs);
        for inp in &mut inputs {
            let slice: Vec<DimIndex> = inp.indices.iter().cloned().map(DimIndex::Fix).collect();
            if let Some(r) = self.access(&mut site, inp.arr, &slice, out)? {
                inp.arr = r;
            }
        }
        kernel.inputs = inputs;
        kernel.body.stms = self.kernel_stms(&mut site, std::mem::take(&mut kernel.body.stms), out)?;
        Ok(kernel)
    }

    /// Thread ids, names bound inside the kernel and the variance table.
    fn kernel_site(&self, kernel: &Kernel) -> KernelSite {
        let gtids = kernel.space.gtids();
        let mut bound: HashSet<VarId> = gtids.iter().copied().collect();
        bound.insert(kernel.space.global_tid);
        let mut variance: HashMap<VarId, HashSet<VarId>> = HashMap::new();
        for g in &gtids {
            variance.insert(*g, HashSet::from([*g]));
        }
        variance.insert(kernel.space.global_tid, gtids.iter().copied().collect());
        for inp in &kernel.inputs {
            bound.insert(inp.param.var);
            let deps = inp
                .indices
                .iter()
                .filter_map(SubExp::var)
                .flat_map(|v| variance.get(&v).cloned().unwrap_or_default())
                .collect();
            variance.insert(inp.param.var, deps);
        }
        let mut defs = HashMap::new();
        variance_stms(&kernel.body.stms, &mut variance, &mut bound, &mut defs);
        KernelSite {
            gtids,
            bound,
            variance,
            defs,
            replacements: HashMap::new(),
        }
    }

    fn kernel_stms(&mut self, site: &mut KernelSite, stms: Vec<Stm>, out: &mut Vec<Stm>) -> Result<Vec<Stm>> {
        let mut res = Vec::with_capacity(stms.len());
        for stm in stms {
            let Stm { pat, certs, exp } = stm;
            let exp = match exp {
                Exp::Index { arr, slice } => {
                    let arr = self.access(site, arr, &slice, out)?.unwrap_or(arr);
                    Exp::Index { arr, slice }
                }
                Exp::If {
                    cond,
                    then_body,
                    else_body,
                    ret,
                } => Exp::If {
                    cond,
                    then_body: Body::new(self.kernel_stms(site, then_body.stms, out)?, then_body.result),
                    else_body: Body::new(self.kernel_stms(site, else_body.stms, out)?, else_body.result),
                    ret,
                },
                Exp::Loop { merge, form, body } => Exp::Loop {
                    merge,
                    form,
                    body: Body::new(self.kernel_stms(site, body.stms, out)?, body.result),
                },
                exp => exp,
            };
            res.push(Stm { pat, certs, exp });
        }
        Ok(res)
    }

    fn classify(&self, site: &KernelSite, rank: usize, dims: &[SubExp], slice: &[DimIndex]) -> Access {
        let fixed: Option<Vec<&SubExp>> = slice.iter().map(DimIndex::fixed).collect();
        if let Some(fixed) = fixed {
            let positions: Option<Vec<usize>> = fixed
                .iter()
                .map(|se| se.var().and_then(|v| site.gtids.iter().position(|g| *g == v)))
                .collect();
            if let Some(positions) = positions
                && fixed.len() == rank
                && positions.iter().collect::<HashSet<_>>().len() == positions.len()
            {
                let mut want: Vec<usize> = (0..rank).collect();
                want.sort_by_key(|&d| positions[d]);
                return Access::ThreadPermutation(want);
            }
            if !fixed.is_empty() && fixed.len() < rank && fixed.iter().all(|se| site.variant(se)) {
                let rest = &dims[fixed.len()..];
                if !tiny_rows(rest) {
                    return Access::ThreadRows(fixed.len());
                }
            }
            return Access::Other;
        }
        if let Some(DimIndex::Slice { start, stride, .. }) = slice.first()
            && stride.const_i64() == Some(1)
            && site.variant(start)
            && let Some(per) = self.chunk_size(site, start)
        {
            return Access::Chunked(per);
        }
        Access::Other
    }

    /// The per-thread element count of a slice starting at `t * per`.
    fn chunk_size(&self, site: &KernelSite, start: &SubExp) -> Option<SubExp> {
        let Exp::BinOp(BinOp::Mul, x, y) = site.defs.get(&start.var()?)? else {
            return None;
        };
        if site.variant(x) && site.invariant(y) && !site.variant(y) {
            Some(y.clone())
        } else if site.variant(y) && site.invariant(x) && !site.variant(x) {
            Some(x.clone())
        } else {
            None
        }
    }

    /// Rewrite one access of `arr`, returning the array to read instead.
    fn access(
        &mut self,
        site: &mut KernelSite,
        arr: VarId,
        slice: &[DimIndex],
        out: &mut Vec<Stm>,
    ) -> Result<Option<VarId>> {
        if site.bound.contains(&arr) {
            return Ok(None);
        }
        let key = (arr, slice.to_vec());
        if let Some(r) = site.replacements.get(&key) {
            return Ok(Some(*r));
        }
        let ty = self.b.type_of(arr)?;
        let rank = ty.rank();
        if rank == 0 {
            return Ok(None);
        }
        let layout = self.layout(arr);
        let replacement = match self.classify(site, rank, ty.dims(), slice) {
            Access::ThreadPermutation(want) if !layout.fits(&want) => {
                debug!("manifesting {arr} in thread order {want:?}");
                Some(self.manifest(arr, want, out)?)
            }
            Access::ThreadRows(k) => {
                let mut want: Vec<usize> = (k..rank).collect();
                want.extend(0..k);
                if layout.fits(&want) {
                    None
                } else {
                    debug!("moving the {k} thread-indexed dimensions of {arr} innermost");
                    Some(self.manifest(arr, want, out)?)
                }
            }
            Access::Chunked(per) if layout != Layout::Chunked => {
                debug!("storing {arr} chunk-transposed in chunks of {per}");
                Some(self.chunked(arr, &per, out)?)
            }
            Access::Other if layout != Layout::RowMajor => {
                debug!("manifesting {arr} row-major");
                Some(self.manifest(arr, (0..rank).collect(), out)?)
            }
            _ => None,
        };
        if let Some(r) = replacement {
            site.replacements.insert(key, r);
        }
        Ok(replacement)
    }

    fn manifest(&mut self, arr: VarId, perm: Vec<usize>, out: &mut Vec<Stm>) -> Result<VarId> {
        let layout = Layout::permuted(perm.clone());
        let r = self.b.bind(out, "coalesced", Exp::Manifest { perm, arr })?;
        self.layouts.insert(r, layout);
        Ok(r)
    }

    /// Pad `arr` to a whole number of chunks of `per` rows, store it chunk
    /// by chunk and slice the padding off again.
    fn chunked(&mut self, arr: VarId, per: &SubExp, out: &mut Vec<Stm>) -> Result<VarId> {
        let ty = self.b.type_of(arr)?;
        let Some((w, rest)) = ty.dims().split_first() else {
            return Ok(arr);
        };
        let rest = rest.to_vec();
        let b = &mut self.b;
        let per_nonzero = b.binop(out, "per_chunk", BinOp::Max, per.clone(), SubExp::i64(1))?;
        let num_chunks = b.div_up(out, "num_chunks", w.clone(), per_nonzero.clone())?;
        let padded_w = b.binop(out, "padded_w", BinOp::Mul, num_chunks.clone(), per_nonzero.clone())?;
        let padding = b.binop(out, "padding", BinOp::Sub, padded_w.clone(), w.clone())?;
        let mut pad_dims = vec![padding];
        pad_dims.extend(rest.iter().cloned());
        let pad = b.bind(
            out,
            "pad",
            Exp::Scratch {
                elem: ty.elem_type(),
                shape: Shape(pad_dims),
            },
        )?;
        let padded = b.bind(
            out,
            "padded",
            Exp::Concat {
                dim: 0,
                arrs: vec![arr, pad],
                w: padded_w.clone(),
            },
        )?;
        let mut chunk_dims = vec![num_chunks, per_nonzero];
        chunk_dims.extend(rest.iter().cloned());
        let extradim = b.bind(
            out,
            "chunks",
            Exp::Reshape {
                shape: Shape(chunk_dims),
                arr: padded,
            },
        )?;
        let mut perm = vec![1, 0];
        perm.extend(2..rest.len() + 2);
        let transposed = b.bind(out, "chunks_tr", Exp::Manifest { perm, arr: extradim })?;
        let mut flat_dims = vec![padded_w];
        flat_dims.extend(rest.iter().cloned());
        let flat = b.bind(
            out,
            "chunked",
            Exp::Reshape {
                shape: Shape(flat_dims),
                arr: transposed,
            },
        )?;
        let mut slice = vec![DimIndex::full(w.clone())];
        slice.extend(rest.iter().cloned().map(DimIndex::full));
        let r = b.bind(out, "unpadded", Exp::Index { arr: flat, slice })?;
        self.layouts.insert(r, Layout::Chunked);
        Ok(r)
    }
}

/// Fill the variance table for `stms`, together with the names they bind
/// and the defining expressions of single-name statements.
fn variance_stms(
    stms: &[Stm],
    variance: &mut HashMap<VarId, HashSet<VarId>>,
    bound: &mut HashSet<VarId>,
    defs: &mut HashMap<VarId, Exp>,
) {
    for stm in stms {
        let deps: HashSet<VarId> = free_in_stm(stm)
            .iter()
            .flat_map(|v| variance.get(v).cloned().unwrap_or_default())
            .collect();
        binders_in_stm(stm, &mut |v, _| {
            variance.insert(v, deps.clone());
            bound.insert(v);
        });
        if let [pe] = stm.pat.vals.as_slice() {
            defs.insert(pe.var, stm.exp.clone());
        }
        match &stm.exp {
            Exp::If {
                then_body,
                else_body,
                ..
            } => {
                collect_defs(&then_body.stms, defs);
                collect_defs(&else_body.stms, defs);
            }
            Exp::Loop { body, .. } => collect_defs(&body.stms, defs),
            _ => {}
        }
    }
}

fn collect_defs(stms: &[Stm], defs: &mut HashMap<VarId, Exp>) {
    for stm in stms {
        if let [pe] = stm.pat.vals.as_slice() {
            defs.insert(pe.var, stm.exp.clone());
        }
    }
}

/// Babysit every thread-level kernel of `program`.
pub fn babysit_program(program: Program) -> Result<Program> {
    let mut funs = Vec::with_capacity(program.funs.len());
    for fun in program.funs {
        let mut sitter = Babysitter::new(&fun);
        let FunDef {
            name,
            params,
            ret,
            body,
        } = fun;
        let body = sitter.babysit_body(body)?;
        funs.push(FunDef {
            name,
            params,
            ret,
            body,
        });
    }
    Ok(Program { funs })
}
