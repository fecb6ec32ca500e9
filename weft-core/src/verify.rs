//! Structural checks on the IR.
//!
//! Run after every pass in tests and at the end of the pipeline. Collects
//! every violation instead of stopping at the first one.

use std::collections::{HashMap, HashSet};

use crate::error::{CompilerError, Result};
use crate::ir::builder::group_as_soac;
use crate::ir::free::{for_each_binder, free_in_stm};
use crate::ir::{Body, Exp, FunDef, GroupOp, Kernel, Lambda, LoopForm, Op, Program, SegLevel, StreamForm, VarId};

/// Which level of the IR a program is expected to be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// SOACs anywhere, no kernels required.
    Soacs,
    /// No SOACs left; parallelism only as kernels.
    Kernels,
}

struct Verifier<'a> {
    stage: Stage,
    fun: &'a str,
    errors: Vec<String>,
}

impl Verifier<'_> {
    fn error(&mut self, msg: String) {
        self.errors.push(format!("{}: {msg}", self.fun));
    }

    fn fun(&mut self, fun: &FunDef) {
        let mut seen: HashMap<VarId, usize> = HashMap::new();
        for_each_binder(fun, &mut |v, _| *seen.entry(v).or_default() += 1);
        let mut dups: Vec<VarId> = seen.into_iter().filter(|(_, n)| *n > 1).map(|(v, _)| v).collect();
        dups.sort();
        for v in dups {
            self.error(format!("{v} is bound more than once"));
        }
        let scope: HashSet<VarId> = fun.params.iter().map(|p| p.var).collect();
        self.body(&fun.body, scope, false);
    }

    /// Check `body` with `scope` visible. `group_top` is set for the body of
    /// a group-level kernel and the loops directly in it, where group
    /// operations may appear.
    fn body(&mut self, body: &Body, mut scope: HashSet<VarId>, group_top: bool) {
        for stm in &body.stms {
            let mut unbound: Vec<VarId> = free_in_stm(stm).into_iter().filter(|v| !scope.contains(v)).collect();
            unbound.sort();
            for v in unbound {
                self.error(format!("{v} is used before it is bound"));
            }
            self.exp(&stm.exp, &scope, group_top);
            scope.extend(stm.pat.names());
        }
        for se in &body.result {
            if let Some(v) = se.var()
                && !scope.contains(&v)
            {
                self.error(format!("result {v} is not bound"));
            }
        }
    }

    fn lambda(&mut self, lam: &Lambda, scope: &HashSet<VarId>) {
        let mut inner = scope.clone();
        inner.extend(lam.params.iter().map(|p| p.var));
        if lam.body.result.len() != lam.ret.len() {
            self.error(format!(
                "lambda returns {} values but declares {} types",
                lam.body.result.len(),
                lam.ret.len()
            ));
        }
        self.body(&lam.body, inner, false);
    }

    fn exp(&mut self, exp: &Exp, scope: &HashSet<VarId>, group_top: bool) {
        match exp {
            Exp::If {
                then_body,
                else_body,
                ..
            } => {
                self.body(then_body, scope.clone(), false);
                self.body(else_body, scope.clone(), false);
            }
            Exp::Loop { merge, form, body } => {
                let mut inner = scope.clone();
                inner.extend(merge.iter().map(|(p, _)| p.var));
                if let LoopForm::For { i, .. } = form {
                    inner.insert(*i);
                }
                // The whole group runs a loop at the top of its body.
                self.body(body, inner, group_top);
            }
            Exp::Op(Op::Soac(soac)) => {
                if self.stage == Stage::Kernels {
                    self.error(format!("{} left after kernel extraction", soac.name()));
                }
                for lam in soac.lambdas() {
                    self.lambda(lam, scope);
                }
            }
            Exp::Op(Op::Group(op)) => {
                if !group_top {
                    self.error(format!("{} outside the body of a group-level kernel", op.name()));
                }
                let soac = group_as_soac(op);
                for lam in soac.lambdas() {
                    self.lambda(lam, scope);
                }
                if let GroupOp::Stream(s) = op
                    && let StreamForm::Parallel { red_lam, .. } = &s.form
                    && red_lam.params.len() != 2 * s.accs.len()
                {
                    self.error("group stream reduction does not combine two accumulators".to_string());
                }
            }
            Exp::Op(Op::Kernel(k)) => self.kernel(k, scope),
            _ => {}
        }
    }

    fn kernel(&mut self, k: &Kernel, scope: &HashSet<VarId>) {
        if k.space.dims.is_empty() {
            self.error(format!("kernel {} has an empty index space", k.desc));
        }
        if k.body.results.len() != k.ret.len() {
            self.error(format!(
                "kernel {} has {} results but {} result types",
                k.desc,
                k.body.results.len(),
                k.ret.len()
            ));
        }
        let mut inner = scope.clone();
        inner.insert(k.space.global_tid);
        inner.extend(k.space.gtids());
        inner.extend(k.inputs.iter().map(|inp| inp.param.var));
        let body = Body::new(k.body.stms.clone(), vec![]);
        self.body(&body, inner, k.space.level == SegLevel::Group);
    }
}

/// Verify every function of `program`, returning all violations at once.
pub fn verify_program(program: &Program, stage: Stage) -> Result<()> {
    let mut errors = vec![];
    let mut names = HashSet::new();
    for fun in &program.funs {
        if !names.insert(fun.name.as_str()) {
            errors.push(format!("function {} is defined more than once", fun.name));
        }
        let mut v = Verifier {
            stage,
            fun: &fun.name,
            errors: vec![],
        };
        v.fun(fun);
        errors.extend(v.errors);
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(CompilerError::VerifyError(errors))
    }
}

/// Whether any SOAC remains in `program`, inside kernels included.
pub fn has_soacs(program: &Program) -> bool {
    program.funs.iter().any(|f| any_soacs(&f.body))
}

fn any_soacs(body: &Body) -> bool {
    body.stms.iter().any(|stm| match &stm.exp {
        Exp::Op(Op::Soac(_)) => true,
        Exp::If {
            then_body,
            else_body,
            ..
        } => any_soacs(then_body) || any_soacs(else_body),
        Exp::Loop { body, .. } => any_soacs(body),
        Exp::Op(Op::Kernel(k)) => any_soacs(&Body::new(k.body.stms.clone(), vec![])),
        Exp::Op(Op::Group(op)) => group_as_soac(op)
            .lambdas()
            .into_iter()
            .any(|l| any_soacs(&l.body)),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::{BinOp, Map, Param, Pat, PrimType, Soac, Stm, SubExp, Type};

    fn fun_with(params: Vec<Param>, stms: Vec<Stm>, result: Vec<SubExp>) -> Program {
        Program {
            funs: vec![FunDef {
                name: "main".to_string(),
                params,
                ret: vec![],
                body: Body::new(stms, result),
            }],
        }
    }

    #[test]
    fn test_use_before_def_is_reported() {
        let mut b = IrBuilder::new();
        let x = b.param("x", Type::i64());
        let y = b.pat_elem("y", Type::i64());
        let z = b.pat_elem("z", Type::i64());
        let stms = vec![
            Stm::new(
                Pat::new(vec![z.clone()]),
                Exp::BinOp(BinOp::Add, SubExp::Var(x.var), SubExp::Var(y.var)),
            ),
            Stm::new(Pat::new(vec![y]), Exp::SubExp(SubExp::Var(x.var))),
        ];
        let prog = fun_with(vec![x], stms, vec![SubExp::Var(z.var)]);
        let Err(CompilerError::VerifyError(errors)) = verify_program(&prog, Stage::Soacs) else {
            panic!("expected a verification error");
        };
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("used before it is bound"));
    }

    #[test]
    fn test_soac_rejected_after_extraction() {
        let mut b = IrBuilder::new();
        let n = b.param("n", Type::i64());
        let xs = b.param("xs", Type::array(PrimType::I64, vec![SubExp::Var(n.var)]));
        let lam = b.identity_lambda(&[Type::i64()]);
        let ys = b.pat_elem("ys", Type::array(PrimType::I64, vec![SubExp::Var(n.var)]));
        let stms = vec![Stm::new(
            Pat::new(vec![ys.clone()]),
            Exp::Op(Op::Soac(Soac::Map(Map {
                w: SubExp::Var(n.var),
                lam,
                arrs: vec![xs.var],
            }))),
        )];
        let prog = fun_with(vec![n, xs], stms, vec![SubExp::Var(ys.var)]);
        assert!(verify_program(&prog, Stage::Soacs).is_ok());
        assert!(has_soacs(&prog));
        let err = verify_program(&prog, Stage::Kernels).unwrap_err();
        assert!(err.to_string().contains("map left after kernel extraction"));
    }

    #[test]
    fn test_duplicate_binder_is_reported() {
        let mut b = IrBuilder::new();
        let x = b.param("x", Type::i64());
        let y = b.pat_elem("y", Type::i64());
        let stms = vec![
            Stm::new(Pat::new(vec![y.clone()]), Exp::SubExp(SubExp::Var(x.var))),
            Stm::new(Pat::new(vec![y.clone()]), Exp::SubExp(SubExp::i64(1))),
        ];
        let prog = fun_with(vec![x], stms, vec![SubExp::Var(y.var)]);
        let err = verify_program(&prog, Stage::Soacs).unwrap_err();
        assert!(err.to_string().contains("bound more than once"));
    }
}
