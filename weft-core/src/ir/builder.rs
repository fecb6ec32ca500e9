//! Builder for ergonomic IR construction.
//!
//! `IrBuilder` owns the fresh-name supply of one function together with the
//! types of every name it has seen, so passes can bind new statements without
//! spelling out result types.

use std::collections::HashMap;

use crate::error::Result;
use crate::{IdSource, bail_internal, err_internal};

use super::free::for_each_binder;
use super::{
    BinOp, Body, DimIndex, Exp, FunDef, GroupOp, KernelResult, Lambda, Op, Param, Pat, PatElem, PrimType,
    SizeOp, Soac, Stm, SubExp, Type, VarId,
};

/// Types of the names visible to a pass.
pub type TypeEnv = HashMap<VarId, Type>;

#[derive(Debug, Default)]
pub struct IrBuilder {
    names: IdSource<VarId>,
    types: TypeEnv,
}

impl IrBuilder {
    pub fn new() -> Self {
        IrBuilder::default()
    }

    /// A builder whose fresh names do not clash with anything bound in `fun`,
    /// and which knows the type of every name bound in it.
    pub fn for_fun(fun: &FunDef) -> Self {
        let mut types = TypeEnv::new();
        let mut max = 0;
        for_each_binder(fun, &mut |v, ty| {
            max = max.max(v.0 + 1);
            types.insert(v, ty.clone());
        });
        let mut names = IdSource::new();
        names.skip_to(max);
        IrBuilder { names, types }
    }

    // =========================================================================
    // Names and types
    // =========================================================================

    pub fn fresh_var(&mut self) -> VarId {
        self.names.next()
    }

    pub fn param(&mut self, hint: impl Into<String>, ty: Type) -> Param {
        let var = self.fresh_var();
        self.types.insert(var, ty.clone());
        Param {
            var,
            name_hint: hint.into(),
            ty,
        }
    }

    pub fn pat_elem(&mut self, hint: impl Into<String>, ty: Type) -> PatElem {
        PatElem::from(&self.param(hint, ty))
    }

    /// A fresh copy of a pattern element, same hint and type.
    pub fn fresh_like(&mut self, pe: &PatElem) -> PatElem {
        self.pat_elem(pe.name_hint.clone(), pe.ty.clone())
    }

    pub fn fresh_param_like(&mut self, p: &Param) -> Param {
        self.param(p.name_hint.clone(), p.ty.clone())
    }

    pub fn declare(&mut self, var: VarId, ty: Type) {
        self.types.insert(var, ty);
    }

    pub fn types(&self) -> &TypeEnv {
        &self.types
    }

    pub fn type_of(&self, v: VarId) -> Result<Type> {
        self.types
            .get(&v)
            .cloned()
            .ok_or_else(|| err_internal!("no type known for {v}"))
    }

    pub fn type_of_se(&self, se: &SubExp) -> Result<Type> {
        match se {
            SubExp::Const(c) => Ok(Type::Prim(c.prim_type())),
            SubExp::Var(v) => self.type_of(*v),
        }
    }

    // =========================================================================
    // Binding
    // =========================================================================

    /// Bind `exp` to fresh names, appending the statement to `stms`.
    pub fn bind_multi(&mut self, stms: &mut Vec<Stm>, hint: &str, exp: Exp) -> Result<Vec<VarId>> {
        let tys = self.exp_types(&exp)?;
        let vals: Vec<PatElem> = tys.into_iter().map(|t| self.pat_elem(hint, t)).collect();
        let names = vals.iter().map(|pe| pe.var).collect();
        stms.push(Stm::new(Pat::new(vals), exp));
        Ok(names)
    }

    /// Bind a single-result expression.
    pub fn bind(&mut self, stms: &mut Vec<Stm>, hint: &str, exp: Exp) -> Result<VarId> {
        let names = self.bind_multi(stms, hint, exp)?;
        match names.as_slice() {
            [v] => Ok(*v),
            _ => bail_internal!("expected one result when binding {hint}, got {}", names.len()),
        }
    }

    pub fn bind_se(&mut self, stms: &mut Vec<Stm>, hint: &str, exp: Exp) -> Result<SubExp> {
        Ok(SubExp::Var(self.bind(stms, hint, exp)?))
    }

    /// Integer arithmetic on `i64` operands, folding constants and units.
    pub fn binop(
        &mut self,
        stms: &mut Vec<Stm>,
        hint: &str,
        op: BinOp,
        x: SubExp,
        y: SubExp,
    ) -> Result<SubExp> {
        if let (Some(a), Some(b)) = (x.const_i64(), y.const_i64()) {
            let folded = match op {
                BinOp::Add => Some(a + b),
                BinOp::Sub => Some(a - b),
                BinOp::Mul => Some(a * b),
                BinOp::Div if b != 0 => Some(a.div_euclid(b)),
                BinOp::Min => Some(a.min(b)),
                BinOp::Max => Some(a.max(b)),
                _ => None,
            };
            if let Some(n) = folded {
                return Ok(SubExp::i64(n));
            }
        }
        match (op, x.const_i64(), y.const_i64()) {
            (BinOp::Mul, Some(1), _) => return Ok(y),
            (BinOp::Mul | BinOp::Div, _, Some(1)) => return Ok(x),
            (BinOp::Add, Some(0), _) => return Ok(y),
            (BinOp::Add | BinOp::Sub, _, Some(0)) => return Ok(x),
            _ => {}
        }
        self.bind_se(stms, hint, Exp::BinOp(op, x, y))
    }

    /// The product of `dims`, emitting one multiplication per factor.
    pub fn product(&mut self, stms: &mut Vec<Stm>, hint: &str, dims: &[SubExp]) -> Result<SubExp> {
        let mut acc = SubExp::i64(1);
        for d in dims {
            acc = self.binop(stms, hint, BinOp::Mul, acc, d.clone())?;
        }
        Ok(acc)
    }

    /// `ceil(x / y)` for non-negative `x` and positive `y`.
    pub fn div_up(&mut self, stms: &mut Vec<Stm>, hint: &str, x: SubExp, y: SubExp) -> Result<SubExp> {
        let y_minus_1 = self.binop(stms, hint, BinOp::Sub, y.clone(), SubExp::i64(1))?;
        let sum = self.binop(stms, hint, BinOp::Add, x, y_minus_1)?;
        self.binop(stms, hint, BinOp::Div, sum, y)
    }

    // =========================================================================
    // Lambdas
    // =========================================================================

    /// `\x y -> x op y` over scalars of type `t`.
    pub fn binop_lambda(&mut self, op: BinOp, t: PrimType) -> Lambda {
        let x = self.param("x", Type::Prim(t));
        let y = self.param("y", Type::Prim(t));
        let res = self.pat_elem("res", Type::Prim(t));
        let body = Body::new(
            vec![Stm::new(
                Pat::new(vec![res.clone()]),
                Exp::BinOp(op, SubExp::Var(x.var), SubExp::Var(y.var)),
            )],
            vec![SubExp::Var(res.var)],
        );
        Lambda {
            params: vec![x, y],
            body,
            ret: vec![Type::Prim(t)],
        }
    }

    /// A lambda returning its parameters unchanged.
    pub fn identity_lambda(&mut self, tys: &[Type]) -> Lambda {
        let params: Vec<Param> = tys.iter().map(|t| self.param("x", t.clone())).collect();
        let result = params.iter().map(|p| SubExp::Var(p.var)).collect();
        Lambda {
            params,
            body: Body::new(vec![], result),
            ret: tys.to_vec(),
        }
    }

    // =========================================================================
    // Types of expressions
    // =========================================================================

    /// Result types of an expression. Branches and calls with existential
    /// return types cannot be typed this way.
    pub fn exp_types(&self, exp: &Exp) -> Result<Vec<Type>> {
        fn one(t: Type) -> Result<Vec<Type>> {
            Ok(vec![t])
        }
        match exp {
            Exp::SubExp(se) => one(self.type_of_se(se)?),
            Exp::BinOp(_, x, _) => one(self.type_of_se(x)?),
            Exp::CmpOp(..) => one(Type::bool()),
            Exp::UnOp(_, x) => one(self.type_of_se(x)?),
            Exp::Convert(t, _) => one(Type::Prim(*t)),
            Exp::Index { arr, slice } => one(index_type(&self.type_of(*arr)?, slice)),
            Exp::Update { arr, .. } => one(self.type_of(*arr)?),
            Exp::Iota { n } => one(Type::array(PrimType::I64, vec![n.clone()])),
            Exp::Replicate { shape, value } => one(self.type_of_se(value)?.array_of_dims(shape.dims())),
            Exp::Scratch { elem, shape } => one(Type::array(*elem, shape.0.clone())),
            Exp::Rearrange { perm, arr } => {
                let t = self.type_of(*arr)?;
                let dims = t.dims();
                if perm.len() != dims.len() || perm.iter().any(|&p| p >= dims.len()) {
                    bail_internal!("permutation {perm:?} does not fit {arr}");
                }
                one(t.with_dims(perm.iter().map(|&p| dims[p].clone()).collect()))
            }
            Exp::Reshape { shape, arr } => one(self.type_of(*arr)?.with_dims(shape.0.clone())),
            Exp::Manifest { arr, .. } | Exp::Copy(arr) => one(self.type_of(*arr)?),
            Exp::Concat { dim, arrs, w } => {
                let first = arrs
                    .first()
                    .ok_or_else(|| err_internal!("concatenation of no arrays"))?;
                let t = self.type_of(*first)?;
                let mut dims = t.dims().to_vec();
                if *dim >= dims.len() {
                    bail_internal!("concatenation dimension {dim} out of range");
                }
                dims[*dim] = w.clone();
                one(t.with_dims(dims))
            }
            Exp::If { ret, .. } | Exp::Apply { ret, .. } => ret
                .iter()
                .map(|t| ext_to_type(t).ok_or_else(|| err_internal!("existential type in binding")))
                .collect(),
            Exp::Loop { merge, .. } => Ok(merge.iter().map(|(p, _)| p.ty.clone()).collect()),
            Exp::Op(Op::Soac(soac)) => self.soac_types(soac),
            Exp::Op(Op::Group(op)) => self.soac_types(&group_as_soac(op)),
            Exp::Op(Op::Kernel(k)) => k
                .body
                .results
                .iter()
                .zip(&k.ret)
                .map(|(r, t)| match r {
                    KernelResult::Threads(_) => Ok(t.array_of_dims(&k.space.widths())),
                    KernelResult::Write { dest, .. } => self.type_of(*dest),
                })
                .collect(),
            Exp::Op(Op::Size(SizeOp::GetSize { .. })) => one(Type::i64()),
            Exp::Op(Op::Size(SizeOp::CmpSizeLe { .. })) => one(Type::bool()),
        }
    }

    fn soac_types(&self, soac: &Soac) -> Result<Vec<Type>> {
        let w = soac.width().clone();
        Ok(match soac {
            Soac::Map(m) => m.lam.ret.iter().map(|t| t.array_of(w.clone())).collect(),
            Soac::Reduce(r) => r.lam.ret.clone(),
            Soac::Scan(s) => s.lam.ret.iter().map(|t| t.array_of(w.clone())).collect(),
            Soac::Redomap(r) => {
                let n = r.nes.len();
                let mut tys = r.red_lam.ret.clone();
                tys.extend(r.map_lam.ret.iter().skip(n).map(|t| t.array_of(w.clone())));
                tys
            }
            Soac::Scanomap(s) => s.map_lam.ret.iter().map(|t| t.array_of(w.clone())).collect(),
            Soac::Stream(s) => {
                let n = s.accs.len();
                let mut tys = s.lam.ret[..n.min(s.lam.ret.len())].to_vec();
                tys.extend(s.lam.ret.iter().skip(n).map(|t| t.row_type().array_of(w.clone())));
                tys
            }
            Soac::Scatter(s) => s
                .dests
                .iter()
                .map(|(_, d)| self.type_of(*d))
                .collect::<Result<_>>()?,
            Soac::WithLoop(wl) => wl
                .dests
                .iter()
                .map(|(_, d)| self.type_of(*d))
                .collect::<Result<_>>()?,
        })
    }
}

/// The type of `arr[slice]`.
pub fn index_type(arr_ty: &Type, slice: &[DimIndex]) -> Type {
    let mut dims = Vec::new();
    for d in slice {
        if let DimIndex::Slice { len, .. } = d {
            dims.push(len.clone());
        }
    }
    dims.extend(arr_ty.dims().iter().skip(slice.len()).cloned());
    arr_ty.with_dims(dims)
}

pub fn ext_to_type(t: &super::ExtType) -> Option<Type> {
    match t {
        super::ExtType::Prim(p) => Some(Type::Prim(*p)),
        super::ExtType::Array { elem, shape } => {
            let dims = shape
                .iter()
                .map(|d| match d {
                    super::ExtSize::Free(se) => Some(se.clone()),
                    super::ExtSize::Ext(_) => None,
                })
                .collect::<Option<Vec<_>>>()?;
            Some(Type::array(*elem, dims))
        }
    }
}

/// View a group operation as the SOAC it computes.
pub fn group_as_soac(op: &GroupOp) -> Soac {
    match op {
        GroupOp::Map(m) => Soac::Map(m.clone()),
        GroupOp::Reduce(r) => Soac::Reduce(r.clone()),
        GroupOp::Scan(s) => Soac::Scan(s.clone()),
        GroupOp::Stream(s) => Soac::Stream(s.clone()),
    }
}
