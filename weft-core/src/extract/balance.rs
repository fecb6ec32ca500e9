//! Heuristics deciding how a map nest is parallelised.

use std::collections::HashSet;

use crate::ir::free::bound_by_stms;
use crate::ir::{Body, Exp, Lambda, Op, Soac, SubExp, VarId, body_has_soacs};

/// A lambda is unbalanced when some SOAC in its body has a width computed
/// inside the lambda, so different threads would run differently sized
/// inner loops. Loops, scatters and with-loops count as balanced.
pub fn unbalanced_lambda(lam: &Lambda) -> bool {
    let bound: HashSet<VarId> = lam.params.iter().map(|p| p.var).collect();
    unbalanced_body(&bound, &lam.body)
}

fn unbalanced_body(bound: &HashSet<VarId>, body: &Body) -> bool {
    let mut bound = bound.clone();
    bound.extend(bound_by_stms(&body.stms));
    body.stms.iter().any(|stm| unbalanced_exp(&bound, &stm.exp))
}

fn unbalanced_exp(bound: &HashSet<VarId>, exp: &Exp) -> bool {
    let is_bound = |w: &SubExp| w.var().is_some_and(|v| bound.contains(&v));
    match exp {
        Exp::Op(Op::Soac(Soac::Scatter(_) | Soac::WithLoop(_))) => false,
        Exp::Op(Op::Soac(soac)) => is_bound(soac.width()),
        Exp::If {
            then_body,
            else_body,
            ..
        } => unbalanced_body(bound, then_body) || unbalanced_body(bound, else_body),
        _ => false,
    }
}

/// Whether running the lambda sequentially per thread still leaves
/// interesting work: some SOAC other than a map or scatter, possibly nested
/// in maps or loops.
pub fn worth_sequentialising(lam: &Lambda) -> bool {
    body_worth_sequentialising(&lam.body)
}

fn body_worth_sequentialising(body: &Body) -> bool {
    body.stms.iter().any(|stm| match &stm.exp {
        Exp::Op(Op::Soac(Soac::Map(m))) => worth_sequentialising(&m.lam),
        Exp::Op(Op::Soac(Soac::Scatter(_) | Soac::WithLoop(_))) => false,
        Exp::Op(Op::Soac(_)) => true,
        Exp::Loop { body, .. } => body_worth_sequentialising(body),
        _ => false,
    })
}

/// Whether mapping the lambda onto workgroups pays off: the body has inner
/// parallelism and is not built only from maps, scatters and loops without
/// inner parallelism.
pub fn worth_intra_group(lam: &Lambda) -> bool {
    let body = &lam.body;
    let has_width = body.stms.iter().any(|stm| match &stm.exp {
        Exp::Op(Op::Soac(_)) => true,
        Exp::Loop { body, .. } => body_has_soacs(body),
        _ => false,
    });
    let only_simple = body.stms.iter().all(|stm| match &stm.exp {
        Exp::Op(Op::Soac(Soac::Map(_) | Soac::Scatter(_) | Soac::WithLoop(_))) => true,
        Exp::Op(Op::Soac(_)) => false,
        Exp::Loop { body, .. } => !body_has_soacs(body),
        _ => true,
    });
    has_width && !only_simple
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::rename::rename_lambda;
    use crate::ir::{BinOp, Commutativity, LoopForm, Map, Pat, PrimType, Reduce, Stm, Type};

    /// `\n -> reduce (+) 0 (iota n)`, optionally with a
    /// constant width instead.
    fn reduce_lambda(b: &mut IrBuilder, inner_bound: bool) -> Lambda {
        let n = b.param("n", Type::i64());
        let mut stms = vec![];
        let w = if inner_bound {
            SubExp::Var(n.var)
        } else {
            SubExp::i64(10)
        };
        let iota = b.bind(&mut stms, "iota", Exp::Iota { n: w.clone() }).unwrap();
        let lam = b.binop_lambda(BinOp::Add, PrimType::I64);
        let sum = b.pat_elem("sum", Type::i64());
        stms.push(Stm::new(
            Pat::new(vec![sum.clone()]),
            Exp::Op(Op::Soac(Soac::Reduce(Reduce {
                w,
                comm: Commutativity::Commutative,
                lam,
                nes: vec![SubExp::i64(0)],
                arrs: vec![iota],
            }))),
        ));
        Lambda {
            params: vec![n],
            body: Body::new(stms, vec![SubExp::Var(sum.var)]),
            ret: vec![Type::i64()],
        }
    }

    #[test]
    fn test_unbalanced_when_width_is_param() {
        let mut b = IrBuilder::new();
        assert!(unbalanced_lambda(&reduce_lambda(&mut b, true)));
        assert!(!unbalanced_lambda(&reduce_lambda(&mut b, false)));
    }

    #[test]
    fn test_unbalanced_invariant_under_renaming() {
        let mut b = IrBuilder::new();
        for inner_bound in [true, false] {
            let lam = reduce_lambda(&mut b, inner_bound);
            let before = unbalanced_lambda(&lam);
            let renamed = rename_lambda(lam.clone(), &mut b);
            assert_ne!(renamed.params[0].var, lam.params[0].var);
            assert_eq!(unbalanced_lambda(&renamed), before);
        }
    }

    #[test]
    fn test_worth_sequentialising_needs_non_map_soac() {
        let mut b = IrBuilder::new();
        let red = reduce_lambda(&mut b, false);
        assert!(worth_sequentialising(&red));
        assert!(worth_intra_group(&red));

        // A map around a plain arithmetic lambda is not interesting.
        let xs = b.param("xs", Type::array(PrimType::I64, vec![SubExp::i64(4)]));
        let inc = b.binop_lambda(BinOp::Add, PrimType::I64);
        let row = b.pat_elem("row", xs.ty.clone());
        let map_only = Lambda {
            params: vec![xs.clone()],
            body: Body::new(
                vec![Stm::new(
                    Pat::new(vec![row.clone()]),
                    Exp::Op(Op::Soac(Soac::Map(Map {
                        w: SubExp::i64(4),
                        lam: inc,
                        arrs: vec![xs.var, xs.var],
                    }))),
                )],
                vec![SubExp::Var(row.var)],
            ),
            ret: vec![xs.ty.clone()],
        };
        assert!(!worth_sequentialising(&map_only));
        assert!(!worth_intra_group(&map_only));
    }

    #[test]
    fn test_loop_wrapped_reduction_is_worth_intra_group() {
        // \xs -> loop acc = 0 for i < 3 do reduce (+) 0 xs
        let mut b = IrBuilder::new();
        let xs = b.param("xs", Type::array(PrimType::I64, vec![SubExp::i64(8)]));
        let acc = b.param("acc", Type::i64());
        let i = b.param("i", Type::i64()).var;
        let add = b.binop_lambda(BinOp::Add, PrimType::I64);
        let sum = b.pat_elem("sum", Type::i64());
        let loop_body = Body::new(
            vec![Stm::new(
                Pat::new(vec![sum.clone()]),
                Exp::Op(Op::Soac(Soac::Reduce(Reduce {
                    w: SubExp::i64(8),
                    comm: Commutativity::Commutative,
                    lam: add,
                    nes: vec![SubExp::i64(0)],
                    arrs: vec![xs.var],
                }))),
            )],
            vec![SubExp::Var(sum.var)],
        );
        let res = b.pat_elem("res", Type::i64());
        let lam = Lambda {
            params: vec![xs],
            body: Body::new(
                vec![Stm::new(
                    Pat::new(vec![res.clone()]),
                    Exp::Loop {
                        merge: vec![(acc, SubExp::i64(0))],
                        form: LoopForm::For {
                            i,
                            bound: SubExp::i64(3),
                        },
                        body: loop_body,
                    },
                )],
                vec![SubExp::Var(res.var)],
            ),
            ret: vec![Type::i64()],
        };
        assert!(worth_intra_group(&lam));
        assert!(worth_sequentialising(&lam));
    }
}
