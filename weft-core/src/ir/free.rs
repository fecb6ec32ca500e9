//! Free-variable and binder analysis.
//!
//! Free names are computed as "used minus bound" over a construct. Shapes in
//! types count as uses, so a name that only appears as an array size is
//! still free.

use std::collections::HashSet;

use super::{
    Body, DimIndex, Exp, FunDef, GroupOp, Kernel, KernelResult, Lambda, LoopForm, Op, Pat, SizeOp, Soac,
    Stm, StreamForm, SubExp, Type, VarId,
};

#[derive(Debug, Default)]
struct Names {
    used: HashSet<VarId>,
    bound: HashSet<VarId>,
}

impl Names {
    fn free(self) -> HashSet<VarId> {
        let Names { used, bound } = self;
        used.into_iter().filter(|v| !bound.contains(v)).collect()
    }

    fn use_se(&mut self, se: &SubExp) {
        if let SubExp::Var(v) = se {
            self.used.insert(*v);
        }
    }

    fn use_ty(&mut self, ty: &Type) {
        self.used.extend(ty.free_vars());
    }

    fn bind(&mut self, v: VarId, ty: &Type) {
        self.bound.insert(v);
        self.use_ty(ty);
    }

    fn pat(&mut self, pat: &Pat) {
        for pe in pat.elems() {
            self.bind(pe.var, &pe.ty);
        }
    }

    fn body(&mut self, body: &Body) {
        for stm in &body.stms {
            self.stm(stm);
        }
        for se in &body.result {
            self.use_se(se);
        }
    }

    fn stm(&mut self, stm: &Stm) {
        self.pat(&stm.pat);
        self.used.extend(stm.certs.0.iter().copied());
        self.exp(&stm.exp);
    }

    fn lambda(&mut self, lam: &Lambda) {
        for p in &lam.params {
            self.bind(p.var, &p.ty);
        }
        self.body(&lam.body);
        for t in &lam.ret {
            self.use_ty(t);
        }
    }

    fn slice(&mut self, slice: &[DimIndex]) {
        for d in slice {
            match d {
                DimIndex::Fix(i) => self.use_se(i),
                DimIndex::Slice { start, len, stride } => {
                    self.use_se(start);
                    self.use_se(len);
                    self.use_se(stride);
                }
            }
        }
    }

    fn arrs(&mut self, arrs: &[VarId]) {
        self.used.extend(arrs.iter().copied());
    }

    fn soac(&mut self, soac: &Soac) {
        self.use_se(soac.width());
        for lam in soac.lambdas() {
            self.lambda(lam);
        }
        match soac {
            Soac::Map(m) => self.arrs(&m.arrs),
            Soac::Reduce(r) => {
                r.nes.iter().for_each(|se| self.use_se(se));
                self.arrs(&r.arrs);
            }
            Soac::Scan(s) => {
                s.nes.iter().for_each(|se| self.use_se(se));
                self.arrs(&s.arrs);
            }
            Soac::Redomap(r) => {
                r.nes.iter().for_each(|se| self.use_se(se));
                self.arrs(&r.arrs);
            }
            Soac::Scanomap(s) => {
                s.nes.iter().for_each(|se| self.use_se(se));
                self.arrs(&s.arrs);
            }
            Soac::Stream(s) => {
                s.accs.iter().for_each(|se| self.use_se(se));
                self.arrs(&s.arrs);
            }
            Soac::Scatter(s) => {
                self.arrs(&s.arrs);
                for (w, d) in &s.dests {
                    self.use_se(w);
                    self.used.insert(*d);
                }
            }
            Soac::WithLoop(wl) => {
                self.use_se(&wl.offset);
                for (w, d) in &wl.dests {
                    self.use_se(w);
                    self.used.insert(*d);
                }
            }
        }
    }

    fn kernel(&mut self, k: &Kernel) {
        let space = &k.space;
        self.bound.insert(space.global_tid);
        self.use_se(&space.group_size);
        self.use_se(&space.num_groups);
        for (v, w) in &space.dims {
            self.bound.insert(*v);
            self.use_se(w);
        }
        for inp in &k.inputs {
            self.bind(inp.param.var, &inp.param.ty);
            self.used.insert(inp.arr);
            inp.indices.iter().for_each(|se| self.use_se(se));
        }
        for stm in &k.body.stms {
            self.stm(stm);
        }
        for r in &k.body.results {
            match r {
                KernelResult::Threads(se) => self.use_se(se),
                KernelResult::Write {
                    dest_w,
                    dest,
                    index,
                    value,
                } => {
                    self.use_se(dest_w);
                    self.used.insert(*dest);
                    self.use_se(index);
                    self.use_se(value);
                }
            }
        }
        for t in &k.ret {
            self.use_ty(t);
        }
    }

    fn exp(&mut self, exp: &Exp) {
        match exp {
            Exp::SubExp(se) | Exp::UnOp(_, se) | Exp::Convert(_, se) => self.use_se(se),
            Exp::BinOp(_, x, y) | Exp::CmpOp(_, x, y) => {
                self.use_se(x);
                self.use_se(y);
            }
            Exp::Index { arr, slice } => {
                self.used.insert(*arr);
                self.slice(slice);
            }
            Exp::Update { arr, slice, value } => {
                self.used.insert(*arr);
                self.slice(slice);
                self.use_se(value);
            }
            Exp::Iota { n } => self.use_se(n),
            Exp::Replicate { shape, value } => {
                shape.dims().iter().for_each(|se| self.use_se(se));
                self.use_se(value);
            }
            Exp::Scratch { shape, .. } => shape.dims().iter().for_each(|se| self.use_se(se)),
            Exp::Rearrange { arr, .. } | Exp::Manifest { arr, .. } | Exp::Copy(arr) => {
                self.used.insert(*arr);
            }
            Exp::Reshape { shape, arr } => {
                shape.dims().iter().for_each(|se| self.use_se(se));
                self.used.insert(*arr);
            }
            Exp::Concat { arrs, w, .. } => {
                self.arrs(arrs);
                self.use_se(w);
            }
            Exp::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                self.use_se(cond);
                self.body(then_body);
                self.body(else_body);
            }
            Exp::Loop { merge, form, body } => {
                for (p, init) in merge {
                    self.bind(p.var, &p.ty);
                    self.use_se(init);
                }
                match form {
                    LoopForm::For { i, bound } => {
                        self.bound.insert(*i);
                        self.use_se(bound);
                    }
                    LoopForm::While { cond } => {
                        self.used.insert(*cond);
                    }
                }
                self.body(body);
            }
            Exp::Apply { args, .. } => args.iter().for_each(|se| self.use_se(se)),
            Exp::Op(Op::Soac(soac)) => self.soac(soac),
            Exp::Op(Op::Kernel(k)) => self.kernel(k),
            Exp::Op(Op::Group(op)) => match op {
                GroupOp::Map(m) => self.soac(&Soac::Map(m.clone())),
                GroupOp::Reduce(r) => self.soac(&Soac::Reduce(r.clone())),
                GroupOp::Scan(s) => self.soac(&Soac::Scan(s.clone())),
                GroupOp::Stream(s) => self.soac(&Soac::Stream(s.clone())),
            },
            Exp::Op(Op::Size(SizeOp::CmpSizeLe { x, .. })) => self.use_se(x),
            Exp::Op(Op::Size(SizeOp::GetSize { .. })) => {}
        }
    }
}

pub fn free_in_body(body: &Body) -> HashSet<VarId> {
    let mut names = Names::default();
    names.body(body);
    names.free()
}

pub fn free_in_stm(stm: &Stm) -> HashSet<VarId> {
    let mut names = Names::default();
    names.exp(&stm.exp);
    names.used.extend(stm.certs.0.iter().copied());
    for pe in stm.pat.elems() {
        names.use_ty(&pe.ty);
    }
    // Context names of the pattern may appear in its own value types.
    for pe in stm.pat.elems() {
        names.bound.insert(pe.var);
    }
    names.free()
}

pub fn free_in_exp(exp: &Exp) -> HashSet<VarId> {
    let mut names = Names::default();
    names.exp(exp);
    names.free()
}

pub fn free_in_lambda(lam: &Lambda) -> HashSet<VarId> {
    let mut names = Names::default();
    names.lambda(lam);
    names.free()
}

/// Free names of a statement sequence followed by a result.
pub fn free_in_stms(stms: &[Stm], result: &[SubExp]) -> HashSet<VarId> {
    let mut names = Names::default();
    for stm in stms {
        names.stm(stm);
    }
    result.iter().for_each(|se| names.use_se(se));
    names.free()
}

/// Names bound at the top level of a statement sequence.
pub fn bound_by_stms(stms: &[Stm]) -> HashSet<VarId> {
    stms.iter().flat_map(|stm| stm.pat.names()).collect()
}

/// Every name bound anywhere inside `body`, at any depth.
pub fn bound_in_body(body: &Body) -> HashSet<VarId> {
    let mut names = Names::default();
    names.body(body);
    names.bound
}

/// Every name bound anywhere inside `lam`, including its parameters.
pub fn bound_in_lambda(lam: &Lambda) -> HashSet<VarId> {
    let mut names = Names::default();
    names.lambda(lam);
    names.bound
}

// =============================================================================
// Binders with types
// =============================================================================

/// Call `f` on every binder of a function with its type. Thread indices and
/// loop counters are `i64`.
pub fn for_each_binder(fun: &FunDef, f: &mut impl FnMut(VarId, &Type)) {
    for p in &fun.params {
        f(p.var, &p.ty);
    }
    binders_in_body(&fun.body, f);
}

fn binders_in_body(body: &Body, f: &mut impl FnMut(VarId, &Type)) {
    for stm in &body.stms {
        binders_in_stm(stm, f);
    }
}

pub fn binders_in_stm(stm: &Stm, f: &mut impl FnMut(VarId, &Type)) {
    for pe in stm.pat.elems() {
        f(pe.var, &pe.ty);
    }
    binders_in_exp(&stm.exp, f);
}

fn binders_in_lambda(lam: &Lambda, f: &mut impl FnMut(VarId, &Type)) {
    for p in &lam.params {
        f(p.var, &p.ty);
    }
    binders_in_body(&lam.body, f);
}

fn binders_in_soac(soac: &Soac, f: &mut impl FnMut(VarId, &Type)) {
    for lam in soac.lambdas() {
        binders_in_lambda(lam, f);
    }
}

fn binders_in_exp(exp: &Exp, f: &mut impl FnMut(VarId, &Type)) {
    let index = Type::i64();
    match exp {
        Exp::If {
            then_body,
            else_body,
            ..
        } => {
            binders_in_body(then_body, f);
            binders_in_body(else_body, f);
        }
        Exp::Loop { merge, form, body } => {
            for (p, _) in merge {
                f(p.var, &p.ty);
            }
            if let LoopForm::For { i, .. } = form {
                f(*i, &index);
            }
            binders_in_body(body, f);
        }
        Exp::Op(Op::Soac(soac)) => binders_in_soac(soac, f),
        Exp::Op(Op::Group(op)) => match op {
            GroupOp::Map(m) => binders_in_lambda(&m.lam, f),
            GroupOp::Reduce(r) => binders_in_lambda(&r.lam, f),
            GroupOp::Scan(s) => binders_in_lambda(&s.lam, f),
            GroupOp::Stream(s) => {
                binders_in_lambda(&s.lam, f);
                if let StreamForm::Parallel { red_lam, .. } = &s.form {
                    binders_in_lambda(red_lam, f);
                }
            }
        },
        Exp::Op(Op::Kernel(k)) => {
            if !k.space.is_flat() {
                f(k.space.global_tid, &index);
            }
            for (v, _) in &k.space.dims {
                f(*v, &index);
            }
            for inp in &k.inputs {
                f(inp.param.var, &inp.param.ty);
            }
            for stm in &k.body.stms {
                binders_in_stm(stm, f);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::{BinOp, Map, PrimType};

    #[test]
    fn test_map_free_vars_include_arrays_and_sizes() {
        let mut b = IrBuilder::new();
        let n = b.param("n", Type::i64());
        let xs = b.param("xs", Type::array(PrimType::I64, vec![SubExp::Var(n.var)]));
        let y = b.param("y", Type::i64());
        let x = b.param("x", Type::i64());
        let mut stms = vec![];
        let r = b
            .binop(&mut stms, "r", BinOp::Add, SubExp::Var(x.var), SubExp::Var(y.var))
            .unwrap();
        let lam = Lambda {
            params: vec![x.clone()],
            body: Body::new(stms, vec![r]),
            ret: vec![Type::i64()],
        };
        let exp = Exp::Op(Op::Soac(Soac::Map(Map {
            w: SubExp::Var(n.var),
            lam,
            arrs: vec![xs.var],
        })));
        let free = free_in_exp(&exp);
        assert!(free.contains(&n.var));
        assert!(free.contains(&xs.var));
        assert!(free.contains(&y.var));
        assert!(!free.contains(&x.var));
    }
}
