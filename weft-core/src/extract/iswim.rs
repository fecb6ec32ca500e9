//! Interchanging a scan or reduction with the map inside its operator.
//!
//! `scan (\xs ys -> map op xs ys) nes xss` scans whole rows; it computes the
//! same as transposing `xss`, scanning every column independently and
//! transposing back. The column scans form a map with a scan inside, which
//! distribution turns into a segmented scan. Reductions work the same way
//! without the final transposition.

use crate::error::Result;
use crate::ir::{Body, Commutativity, Exp, Lambda, Map, Op, Pat, Reduce, Scan, Soac, Stm, SubExp, Type, VarId};

use super::ExtractCtx;

/// The row operator of `lam` when its body is exactly
/// `map op accs elems` returning the map's results.
fn row_operator(lam: &Lambda, n: usize) -> Option<&Lambda> {
    let [stm] = lam.body.stms.as_slice() else {
        return None;
    };
    let Exp::Op(Op::Soac(Soac::Map(map))) = &stm.exp else {
        return None;
    };
    let params: Vec<VarId> = lam.params.iter().map(|p| p.var).collect();
    let result: Vec<SubExp> = stm.pat.vals.iter().map(|pe| SubExp::Var(pe.var)).collect();
    let ok = stm.pat.ctx.is_empty()
        && lam.params.len() == 2 * n
        && map.arrs == params
        && lam.body.result == result
        && map.lam.params.iter().all(|p| matches!(p.ty, Type::Prim(_)));
    ok.then_some(&map.lam)
}

/// Transpose the two outermost dimensions of every array.
fn transpose_all(ctx: &mut ExtractCtx, arrs: &[VarId], out: &mut Vec<Stm>) -> Result<Vec<VarId>> {
    let mut transposed = vec![];
    for arr in arrs {
        let rank = ctx.b.type_of(*arr)?.rank();
        let mut perm = vec![1, 0];
        perm.extend(2..rank);
        transposed.push(ctx.b.bind(out, "transposed", Exp::Rearrange { perm, arr: *arr })?);
    }
    Ok(transposed)
}

/// A map over columns: `map (\ne col -> soac ne col) nes transposed`.
fn column_map(
    ctx: &mut ExtractCtx,
    m: &SubExp,
    w: &SubExp,
    op: &Lambda,
    nes: &[VarId],
    cols: Vec<VarId>,
    build: impl FnOnce(Vec<SubExp>, Vec<VarId>, Lambda) -> Soac,
) -> Result<(Map, Vec<Type>)> {
    let elem_tys = op.ret.clone();
    let ne_params: Vec<_> = elem_tys.iter().map(|t| ctx.b.param("ne", t.clone())).collect();
    let col_params: Vec<_> = elem_tys
        .iter()
        .map(|t| ctx.b.param("column", t.array_of(w.clone())))
        .collect();
    let inner = build(
        ne_params.iter().map(|p| SubExp::Var(p.var)).collect(),
        col_params.iter().map(|p| p.var).collect(),
        op.clone(),
    );
    let mut stms = vec![];
    let res = ctx.b.bind_multi(&mut stms, "column", Exp::Op(Op::Soac(inner)))?;
    let ret: Vec<Type> = res.iter().map(|v| ctx.b.type_of(*v)).collect::<Result<_>>()?;
    let mut params = ne_params;
    params.extend(col_params);
    let mut arrs = nes.to_vec();
    arrs.extend(cols);
    let lam = Lambda {
        params,
        body: Body::new(stms, res.into_iter().map(SubExp::Var).collect()),
        ret: ret.clone(),
    };
    Ok((
        Map {
            w: m.clone(),
            lam,
            arrs,
        },
        ret,
    ))
}

fn array_nes(nes: &[SubExp]) -> Option<Vec<VarId>> {
    nes.iter().map(|ne| ne.var()).collect()
}

/// Rewrite a row-wise scan into a map of column scans.
pub fn iswim(ctx: &mut ExtractCtx, pat: &Pat, scan: &Scan) -> Result<Option<Vec<Stm>>> {
    let Some(op) = row_operator(&scan.lam, scan.nes.len()) else {
        return Ok(None);
    };
    let Some(nes) = array_nes(&scan.nes) else {
        return Ok(None);
    };
    let Some(first) = scan.arrs.first() else {
        return Ok(None);
    };
    let Some(m) = ctx.b.type_of(*first)?.dims().get(1).cloned() else {
        return Ok(None);
    };
    if !pat.ctx.is_empty() {
        return Ok(None);
    }
    let w = scan.w.clone();
    let mut out = vec![];
    let cols = transpose_all(ctx, &scan.arrs, &mut out)?;
    let (map, _) = column_map(ctx, &m, &w, op, &nes, cols, |nes, arrs, lam| {
        Soac::Scan(Scan {
            w: w.clone(),
            lam,
            nes,
            arrs,
        })
    })?;
    let scanned = ctx.b.bind_multi(&mut out, "scanned_columns", Exp::Op(Op::Soac(Soac::Map(map))))?;
    for (pe, arr) in pat.vals.iter().zip(scanned) {
        let rank = pe.ty.rank();
        let mut perm = vec![1, 0];
        perm.extend(2..rank);
        out.push(Stm::new(Pat::new(vec![pe.clone()]), Exp::Rearrange { perm, arr }));
    }
    ctx.log("interchanged scan with inner map".to_string());
    Ok(Some(out))
}

/// Rewrite a row-wise reduction into a map of column reductions.
pub fn irwim(ctx: &mut ExtractCtx, pat: &Pat, red: &Reduce) -> Result<Option<Vec<Stm>>> {
    let Some(op) = row_operator(&red.lam, red.nes.len()) else {
        return Ok(None);
    };
    let Some(nes) = array_nes(&red.nes) else {
        return Ok(None);
    };
    let Some(first) = red.arrs.first() else {
        return Ok(None);
    };
    let Some(m) = ctx.b.type_of(*first)?.dims().get(1).cloned() else {
        return Ok(None);
    };
    if !pat.ctx.is_empty() {
        return Ok(None);
    }
    let w = red.w.clone();
    let comm: Commutativity = red.comm;
    let mut out = vec![];
    let cols = transpose_all(ctx, &red.arrs, &mut out)?;
    let (map, _) = column_map(ctx, &m, &w, op, &nes, cols, |nes, arrs, lam| {
        Soac::Reduce(Reduce {
            w: w.clone(),
            comm,
            lam,
            nes,
            arrs,
        })
    })?;
    out.push(Stm::new(pat.clone(), Exp::Op(Op::Soac(Soac::Map(map)))));
    ctx.log("interchanged reduction with inner map".to_string());
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{ExtractConfig, ExtractCtx};
    use crate::ir::{BinOp, FunDef, PrimType};

    #[test]
    fn test_irwim_reduces_columns() {
        let fun = FunDef {
            name: "main".to_string(),
            params: vec![],
            ret: vec![],
            body: Body::new(vec![], vec![]),
        };
        let mut ctx = ExtractCtx::new(&fun, &ExtractConfig::default());
        let n = SubExp::i64(3);
        let m = SubExp::i64(4);
        let row_ty = Type::array(PrimType::I64, vec![m.clone()]);
        let xss = ctx.b.param("xss", row_ty.array_of(n.clone()));
        let ne = ctx.b.param("ne", row_ty.clone());
        let add = ctx.b.binop_lambda(BinOp::Add, PrimType::I64);
        let acc = ctx.b.param("acc", row_ty.clone());
        let row = ctx.b.param("row", row_ty.clone());
        let sum = ctx.b.pat_elem("sum", row_ty.clone());
        let lam = Lambda {
            params: vec![acc.clone(), row.clone()],
            body: Body::new(
                vec![Stm::new(
                    Pat::new(vec![sum.clone()]),
                    Exp::Op(Op::Soac(Soac::Map(Map {
                        w: m.clone(),
                        lam: add,
                        arrs: vec![acc.var, row.var],
                    }))),
                )],
                vec![SubExp::Var(sum.var)],
            ),
            ret: vec![row_ty.clone()],
        };
        let red = Reduce {
            w: n,
            comm: Commutativity::Commutative,
            lam,
            nes: vec![SubExp::Var(ne.var)],
            arrs: vec![xss.var],
        };
        let res = ctx.b.pat_elem("res", row_ty);
        let stms = irwim(&mut ctx, &Pat::new(vec![res.clone()]), &red).unwrap().unwrap();
        assert!(matches!(stms[0].exp, Exp::Rearrange { ref perm, .. } if perm == &vec![1, 0]));
        let last = stms.last().unwrap();
        assert_eq!(last.pat.vals[0].var, res.var);
        let Exp::Op(Op::Soac(Soac::Map(map))) = &last.exp else {
            panic!("expected a map over columns");
        };
        assert_eq!(map.w, SubExp::i64(4));
        assert!(matches!(
            map.lam.body.stms[0].exp,
            Exp::Op(Op::Soac(Soac::Reduce(_)))
        ));
    }
}
