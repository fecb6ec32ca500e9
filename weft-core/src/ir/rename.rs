//! Scoped renaming.
//!
//! Gives every binder inside a construct a fresh name and rewrites uses to
//! the nearest enclosing binder. Extraction copies lambda bodies into several
//! kernels and code versions; renaming the whole function afterwards restores
//! the one-binding-per-name property.

use std::collections::HashMap;

use super::builder::IrBuilder;
use super::{
    Body, Certs, DimIndex, Exp, ExtSize, ExtType, FunDef, GroupOp, Kernel, KernelBody, KernelInput, KernelResult, KernelSpace,
    Lambda, LoopForm, Map, Op, Param, Pat, PatElem, Reduce, Redomap, Scan, Scanomap, Scatter, Shape,
    SizeOp, Soac, Stm, Stream, StreamForm, SubExp, Type, VarId, WithLoop,
};

/// Rename every binder of `fun` except its parameters.
pub fn rename_fun(fun: FunDef, b: &mut IrBuilder) -> FunDef {
    let mut r = Renamer::new(b);
    let body = r.body(fun.body);
    FunDef { body, ..fun }
}

/// A copy of `lam` with fresh parameter and body names.
pub fn rename_lambda(lam: Lambda, b: &mut IrBuilder) -> Lambda {
    Renamer::new(b).lambda(lam)
}

/// A copy of a body with fresh names for everything it binds.
pub fn rename_body(body: Body, b: &mut IrBuilder) -> Body {
    Renamer::new(b).body(body)
}

/// Replace uses of names according to `subst`. Binders are left alone.
pub fn substitute_body(body: Body, subst: &HashMap<VarId, VarId>, b: &mut IrBuilder) -> Body {
    let mut r = Renamer::new(b);
    r.subst = subst.clone();
    r.fresh_binders = false;
    r.body(body)
}

struct Renamer<'a> {
    b: &'a mut IrBuilder,
    subst: HashMap<VarId, VarId>,
    fresh_binders: bool,
}

impl<'a> Renamer<'a> {
    fn new(b: &'a mut IrBuilder) -> Self {
        Renamer {
            b,
            subst: HashMap::new(),
            fresh_binders: true,
        }
    }

    fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let saved = self.subst.clone();
        let out = f(self);
        self.subst = saved;
        out
    }

    // =========================================================================
    // Uses
    // =========================================================================

    fn var(&self, v: VarId) -> VarId {
        self.subst.get(&v).copied().unwrap_or(v)
    }

    fn se(&self, se: SubExp) -> SubExp {
        match se {
            SubExp::Var(v) => SubExp::Var(self.var(v)),
            c => c,
        }
    }

    fn ses(&self, ses: Vec<SubExp>) -> Vec<SubExp> {
        ses.into_iter().map(|se| self.se(se)).collect()
    }

    fn vars(&self, vs: Vec<VarId>) -> Vec<VarId> {
        vs.into_iter().map(|v| self.var(v)).collect()
    }

    fn ty(&self, t: Type) -> Type {
        match t {
            Type::Prim(_) => t,
            Type::Array { elem, shape } => Type::Array {
                elem,
                shape: Shape(self.ses(shape.0)),
            },
        }
    }

    fn ext_ty(&self, t: ExtType) -> ExtType {
        match t {
            ExtType::Prim(_) => t,
            ExtType::Array { elem, shape } => ExtType::Array {
                elem,
                shape: shape
                    .into_iter()
                    .map(|d| match d {
                        ExtSize::Free(se) => ExtSize::Free(self.se(se)),
                        ext => ext,
                    })
                    .collect(),
            },
        }
    }

    fn slice(&self, slice: Vec<DimIndex>) -> Vec<DimIndex> {
        slice
            .into_iter()
            .map(|d| match d {
                DimIndex::Fix(i) => DimIndex::Fix(self.se(i)),
                DimIndex::Slice { start, len, stride } => DimIndex::Slice {
                    start: self.se(start),
                    len: self.se(len),
                    stride: self.se(stride),
                },
            })
            .collect()
    }

    // =========================================================================
    // Binders
    // =========================================================================

    fn bind(&mut self, v: VarId, ty: &Type) -> VarId {
        if !self.fresh_binders {
            return v;
        }
        let fresh = self.b.fresh_var();
        self.b.declare(fresh, ty.clone());
        self.subst.insert(v, fresh);
        fresh
    }

    fn param(&mut self, p: Param) -> Param {
        let ty = self.ty(p.ty);
        let var = self.bind(p.var, &ty);
        Param {
            var,
            name_hint: p.name_hint,
            ty,
        }
    }

    fn pat_elem(&mut self, pe: PatElem) -> PatElem {
        let ty = self.ty(pe.ty);
        let var = self.bind(pe.var, &ty);
        PatElem {
            var,
            name_hint: pe.name_hint,
            ty,
        }
    }

    fn pat(&mut self, pat: Pat) -> Pat {
        let ctx = pat.ctx.into_iter().map(|pe| self.pat_elem(pe)).collect();
        let vals = pat.vals.into_iter().map(|pe| self.pat_elem(pe)).collect();
        Pat { ctx, vals }
    }

    fn index_var(&mut self, v: VarId) -> VarId {
        self.bind(v, &Type::i64())
    }

    // =========================================================================
    // Constructs
    // =========================================================================

    fn body(&mut self, body: Body) -> Body {
        self.scoped(|r| {
            let stms = body.stms.into_iter().map(|s| r.stm(s)).collect();
            let result = r.ses(body.result);
            Body { stms, result }
        })
    }

    fn stm(&mut self, stm: Stm) -> Stm {
        // The expression is renamed before the pattern comes into scope.
        let exp = self.exp(stm.exp);
        let certs = Certs(self.vars(stm.certs.0));
        let pat = self.pat(stm.pat);
        Stm { pat, certs, exp }
    }

    fn lambda(&mut self, lam: Lambda) -> Lambda {
        self.scoped(|r| {
            let params = lam.params.into_iter().map(|p| r.param(p)).collect();
            let body = r.body(lam.body);
            let ret = lam.ret.into_iter().map(|t| r.ty(t)).collect();
            Lambda { params, body, ret }
        })
    }

    fn exp(&mut self, exp: Exp) -> Exp {
        match exp {
            Exp::SubExp(se) => Exp::SubExp(self.se(se)),
            Exp::BinOp(op, x, y) => Exp::BinOp(op, self.se(x), self.se(y)),
            Exp::CmpOp(op, x, y) => Exp::CmpOp(op, self.se(x), self.se(y)),
            Exp::UnOp(op, x) => Exp::UnOp(op, self.se(x)),
            Exp::Convert(t, x) => Exp::Convert(t, self.se(x)),
            Exp::Index { arr, slice } => Exp::Index {
                arr: self.var(arr),
                slice: self.slice(slice),
            },
            Exp::Update { arr, slice, value } => Exp::Update {
                arr: self.var(arr),
                slice: self.slice(slice),
                value: self.se(value),
            },
            Exp::Iota { n } => Exp::Iota { n: self.se(n) },
            Exp::Replicate { shape, value } => Exp::Replicate {
                shape: Shape(self.ses(shape.0)),
                value: self.se(value),
            },
            Exp::Scratch { elem, shape } => Exp::Scratch {
                elem,
                shape: Shape(self.ses(shape.0)),
            },
            Exp::Rearrange { perm, arr } => Exp::Rearrange {
                perm,
                arr: self.var(arr),
            },
            Exp::Reshape { shape, arr } => Exp::Reshape {
                shape: Shape(self.ses(shape.0)),
                arr: self.var(arr),
            },
            Exp::Manifest { perm, arr } => Exp::Manifest {
                perm,
                arr: self.var(arr),
            },
            Exp::Copy(arr) => Exp::Copy(self.var(arr)),
            Exp::Concat { dim, arrs, w } => Exp::Concat {
                dim,
                arrs: self.vars(arrs),
                w: self.se(w),
            },
            Exp::If {
                cond,
                then_body,
                else_body,
                ret,
            } => Exp::If {
                cond: self.se(cond),
                then_body: self.body(then_body),
                else_body: self.body(else_body),
                ret: ret.into_iter().map(|t| self.ext_ty(t)).collect(),
            },
            Exp::Loop { merge, form, body } => {
                let inits: Vec<SubExp> = merge.iter().map(|(_, init)| self.se(init.clone())).collect();
                self.scoped(|r| {
                    let params: Vec<Param> = merge.into_iter().map(|(p, _)| r.param(p)).collect();
                    let form = match form {
                        LoopForm::For { i, bound } => {
                            let bound = r.se(bound);
                            LoopForm::For {
                                i: r.index_var(i),
                                bound,
                            }
                        }
                        LoopForm::While { cond } => LoopForm::While { cond: r.var(cond) },
                    };
                    let body = r.body(body);
                    Exp::Loop {
                        merge: params.into_iter().zip(inits).collect(),
                        form,
                        body,
                    }
                })
            }
            Exp::Apply { fun, args, ret } => Exp::Apply {
                fun,
                args: self.ses(args),
                ret: ret.into_iter().map(|t| self.ext_ty(t)).collect(),
            },
            Exp::Op(Op::Soac(soac)) => Exp::Op(Op::Soac(self.soac(soac))),
            Exp::Op(Op::Group(op)) => Exp::Op(Op::Group(match op {
                GroupOp::Map(m) => GroupOp::Map(self.map(m)),
                GroupOp::Reduce(red) => GroupOp::Reduce(self.reduce(red)),
                GroupOp::Scan(s) => GroupOp::Scan(self.scan(s)),
                GroupOp::Stream(s) => GroupOp::Stream(self.stream(s)),
            })),
            Exp::Op(Op::Kernel(k)) => Exp::Op(Op::Kernel(Box::new(self.kernel(*k)))),
            Exp::Op(Op::Size(SizeOp::CmpSizeLe { name, class, x })) => {
                Exp::Op(Op::Size(SizeOp::CmpSizeLe {
                    name,
                    class,
                    x: self.se(x),
                }))
            }
            e @ Exp::Op(Op::Size(SizeOp::GetSize { .. })) => e,
        }
    }

    fn map(&mut self, m: Map) -> Map {
        Map {
            w: self.se(m.w),
            arrs: self.vars(m.arrs),
            lam: self.lambda(m.lam),
        }
    }

    fn reduce(&mut self, r: Reduce) -> Reduce {
        Reduce {
            w: self.se(r.w),
            comm: r.comm,
            nes: self.ses(r.nes),
            arrs: self.vars(r.arrs),
            lam: self.lambda(r.lam),
        }
    }

    fn scan(&mut self, s: Scan) -> Scan {
        Scan {
            w: self.se(s.w),
            nes: self.ses(s.nes),
            arrs: self.vars(s.arrs),
            lam: self.lambda(s.lam),
        }
    }

    fn stream(&mut self, s: Stream) -> Stream {
        let form = match s.form {
            StreamForm::Sequential => StreamForm::Sequential,
            StreamForm::Parallel { order, comm, red_lam } => StreamForm::Parallel {
                order,
                comm,
                red_lam: self.lambda(red_lam),
            },
        };
        Stream {
            w: self.se(s.w),
            form,
            accs: self.ses(s.accs),
            arrs: self.vars(s.arrs),
            lam: self.lambda(s.lam),
        }
    }

    fn soac(&mut self, soac: Soac) -> Soac {
        match soac {
            Soac::Map(m) => Soac::Map(self.map(m)),
            Soac::Reduce(r) => Soac::Reduce(self.reduce(r)),
            Soac::Scan(s) => Soac::Scan(self.scan(s)),
            Soac::Redomap(r) => Soac::Redomap(Redomap {
                w: self.se(r.w),
                comm: r.comm,
                nes: self.ses(r.nes),
                arrs: self.vars(r.arrs),
                red_lam: self.lambda(r.red_lam),
                map_lam: self.lambda(r.map_lam),
            }),
            Soac::Scanomap(s) => Soac::Scanomap(Scanomap {
                w: self.se(s.w),
                nes: self.ses(s.nes),
                arrs: self.vars(s.arrs),
                scan_lam: self.lambda(s.scan_lam),
                map_lam: self.lambda(s.map_lam),
            }),
            Soac::Stream(s) => Soac::Stream(self.stream(s)),
            Soac::Scatter(s) => Soac::Scatter(Scatter {
                w: self.se(s.w),
                arrs: self.vars(s.arrs),
                dests: s.dests.into_iter().map(|(w, d)| (self.se(w), self.var(d))).collect(),
                lam: self.lambda(s.lam),
            }),
            Soac::WithLoop(wl) => Soac::WithLoop(WithLoop {
                w: self.se(wl.w),
                offset: self.se(wl.offset),
                dests: wl.dests.into_iter().map(|(w, d)| (self.se(w), self.var(d))).collect(),
                lam: self.lambda(wl.lam),
            }),
        }
    }

    fn kernel(&mut self, k: Kernel) -> Kernel {
        self.scoped(|r| {
            let group_size = r.se(k.space.group_size);
            let num_groups = r.se(k.space.num_groups);
            let widths: Vec<(VarId, SubExp)> =
                k.space.dims.into_iter().map(|(v, w)| (v, r.se(w))).collect();
            let inputs_outer: Vec<(Param, VarId, Vec<SubExp>)> = k
                .inputs
                .into_iter()
                .map(|inp| (inp.param, r.var(inp.arr), inp.indices))
                .collect();
            let flat_is_dim = widths.iter().any(|(v, _)| *v == k.space.global_tid);
            let global_tid = r.index_var(k.space.global_tid);
            let dims = widths
                .into_iter()
                .map(|(v, w)| {
                    if flat_is_dim && v == k.space.global_tid {
                        (global_tid, w)
                    } else {
                        (r.index_var(v), w)
                    }
                })
                .collect();
            let inputs = inputs_outer
                .into_iter()
                .map(|(param, arr, indices)| {
                    let indices = r.ses(indices);
                    KernelInput {
                        param: r.param(param),
                        arr,
                        indices,
                    }
                })
                .collect();
            let stms = k.body.stms.into_iter().map(|s| r.stm(s)).collect();
            let results = k
                .body
                .results
                .into_iter()
                .map(|res| match res {
                    KernelResult::Threads(se) => KernelResult::Threads(r.se(se)),
                    KernelResult::Write {
                        dest_w,
                        dest,
                        index,
                        value,
                    } => KernelResult::Write {
                        dest_w: r.se(dest_w),
                        dest: r.var(dest),
                        index: r.se(index),
                        value: r.se(value),
                    },
                })
                .collect();
            let ret = k.ret.into_iter().map(|t| r.ty(t)).collect();
            Kernel {
                desc: k.desc,
                space: KernelSpace {
                    level: k.space.level,
                    global_tid,
                    group_size,
                    num_groups,
                    dims,
                },
                inputs,
                body: KernelBody { stms, results },
                ret,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::free::{bound_in_lambda, free_in_lambda};
    use crate::ir::{BinOp, PrimType};

    #[test]
    fn test_rename_lambda_freshens_every_binder() {
        let mut b = IrBuilder::new();
        let lam = b.binop_lambda(BinOp::Add, PrimType::I64);
        let renamed = rename_lambda(lam.clone(), &mut b);
        let old = bound_in_lambda(&lam);
        let new = bound_in_lambda(&renamed);
        assert_eq!(old.len(), new.len());
        assert!(old.is_disjoint(&new));
        assert!(free_in_lambda(&renamed).is_empty());
    }
}
