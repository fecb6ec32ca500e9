#![cfg(test)]
//! Small SOAC-level programs shared by the pass tests, with inputs.

use std::rc::Rc;

use crate::interp::{ArrayValue, SizeTable, Value, run_program};
use crate::ir::builder::IrBuilder;
use crate::ir::{
    BinOp, Body, Commutativity, Exp, ExtType, FunDef, Kernel, Lambda, LoopForm, Map, Op, Param, PrimType,
    PrimValue, Program, Redomap, Reduce, Scan, Scatter, Soac, Stm, Stream, StreamForm, StreamOrd, SubExp, Type,
    VarId, WithLoop,
};

pub fn soac(s: Soac) -> Exp {
    Exp::Op(Op::Soac(s))
}

/// Wrap a body into a program with a single function `main`.
pub fn main_program(b: &IrBuilder, params: Vec<Param>, stms: Vec<Stm>, result: Vec<VarId>) -> Program {
    let ret = result
        .iter()
        .map(|v| ExtType::from(b.type_of(*v).unwrap()))
        .collect();
    Program {
        funs: vec![FunDef {
            name: "main".to_string(),
            params,
            ret,
            body: Body::new(stms, result.into_iter().map(SubExp::Var).collect()),
        }],
    }
}

pub fn i64_matrix(rows: usize, cols: usize, f: impl Fn(usize, usize) -> i64) -> Value {
    let data = (0..rows)
        .flat_map(|i| (0..cols).map(move |j| (i, j)))
        .map(|(i, j)| PrimValue::I64(f(i, j)))
        .collect();
    Value::Array(ArrayValue {
        elem: PrimType::I64,
        shape: vec![rows, cols],
        data: Rc::new(data),
    })
}

/// The default input matrix: three rows of five, with negative entries.
pub fn sample_matrix() -> Value {
    i64_matrix(3, 5, |i, j| (i as i64) * 10 + (j as i64) - 7)
}

pub fn matrix_args() -> Vec<Value> {
    vec![Value::i64(3), Value::i64(5), sample_matrix()]
}

/// Run `main` with the default sizes.
pub fn run_main(program: &Program, args: &[Value]) -> Vec<Value> {
    run_program(program, "main", args.to_vec(), &SizeTable::new()).unwrap()
}

/// The `n`, `m` and `xss: [n][m]i64` parameters shared by the matrix
/// programs.
struct MatrixParams {
    n: Param,
    m: Param,
    xss: Param,
    row_ty: Type,
}

impl MatrixParams {
    fn new(b: &mut IrBuilder) -> Self {
        let n = b.param("n", Type::i64());
        let m = b.param("m", Type::i64());
        let row_ty = Type::array(PrimType::I64, vec![SubExp::Var(m.var)]);
        let xss = b.param("xss", row_ty.array_of(SubExp::Var(n.var)));
        MatrixParams { n, m, xss, row_ty }
    }

    fn n(&self) -> SubExp {
        SubExp::Var(self.n.var)
    }

    fn m(&self) -> SubExp {
        SubExp::Var(self.m.var)
    }

    fn into_params(self) -> Vec<Param> {
        vec![self.n, self.m, self.xss]
    }
}

/// `\x -> x op c`.
fn scalar_lambda(b: &mut IrBuilder, op: BinOp, c: SubExp) -> Lambda {
    let x = b.param("x", Type::i64());
    let mut stms = vec![];
    let r = b.bind_se(&mut stms, "r", Exp::BinOp(op, SubExp::Var(x.var), c)).unwrap();
    Lambda {
        params: vec![x],
        body: Body::new(stms, vec![r]),
        ret: vec![Type::i64()],
    }
}

/// `map (\xs -> scan (+) 0 xs) xss`
pub fn map_of_scan() -> Program {
    let mut b = IrBuilder::new();
    let mp = MatrixParams::new(&mut b);
    let xs = b.param("xs", mp.row_ty.clone());
    let add = b.binop_lambda(BinOp::Add, PrimType::I64);
    let mut inner = vec![];
    let scanned = b
        .bind(
            &mut inner,
            "scanned",
            soac(Soac::Scan(Scan {
                w: mp.m(),
                lam: add,
                nes: vec![SubExp::i64(0)],
                arrs: vec![xs.var],
            })),
        )
        .unwrap();
    let lam = Lambda {
        params: vec![xs],
        body: Body::new(inner, vec![SubExp::Var(scanned)]),
        ret: vec![mp.row_ty.clone()],
    };
    let mut stms = vec![];
    let res = b
        .bind(
            &mut stms,
            "res",
            soac(Soac::Map(Map {
                w: mp.n(),
                lam,
                arrs: vec![mp.xss.var],
            })),
        )
        .unwrap();
    main_program(&b, mp.into_params(), stms, vec![res])
}

/// `map (\xs -> let ys = map (*2) xs in (ys, reduce (+) 0 ys)) xss`
pub fn map_of_map_and_reduce() -> Program {
    let mut b = IrBuilder::new();
    let mp = MatrixParams::new(&mut b);
    let xs = b.param("xs", mp.row_ty.clone());
    let double = scalar_lambda(&mut b, BinOp::Mul, SubExp::i64(2));
    let add = b.binop_lambda(BinOp::Add, PrimType::I64);
    let mut inner = vec![];
    let ys = b
        .bind(
            &mut inner,
            "ys",
            soac(Soac::Map(Map {
                w: mp.m(),
                lam: double,
                arrs: vec![xs.var],
            })),
        )
        .unwrap();
    let sum = b
        .bind(
            &mut inner,
            "sum",
            soac(Soac::Reduce(Reduce {
                w: mp.m(),
                comm: Commutativity::Commutative,
                lam: add,
                nes: vec![SubExp::i64(0)],
                arrs: vec![ys],
            })),
        )
        .unwrap();
    let lam = Lambda {
        params: vec![xs],
        body: Body::new(inner, vec![SubExp::Var(ys), SubExp::Var(sum)]),
        ret: vec![mp.row_ty.clone(), Type::i64()],
    };
    let mut stms = vec![];
    let res = b
        .bind_multi(
            &mut stms,
            "res",
            soac(Soac::Map(Map {
                w: mp.n(),
                lam,
                arrs: vec![mp.xss.var],
            })),
        )
        .unwrap();
    main_program(&b, mp.into_params(), stms, res)
}

/// `map (\xs -> let (s, sqs) = redomap (+) (\x -> (x, x*x)) 0 xs
///              in (s, scan (+) 0 sqs)) xss`
pub fn map_of_redomap_and_scan() -> Program {
    let mut b = IrBuilder::new();
    let mp = MatrixParams::new(&mut b);
    let xs = b.param("xs", mp.row_ty.clone());
    let x = b.param("x", Type::i64());
    let mut sq_stms = vec![];
    let sq = b
        .bind_se(&mut sq_stms, "sq", Exp::BinOp(BinOp::Mul, SubExp::Var(x.var), SubExp::Var(x.var)))
        .unwrap();
    let x_se = SubExp::Var(x.var);
    let map_lam = Lambda {
        params: vec![x],
        body: Body::new(sq_stms, vec![x_se, sq]),
        ret: vec![Type::i64(), Type::i64()],
    };
    let red_lam = b.binop_lambda(BinOp::Add, PrimType::I64);
    let scan_lam = b.binop_lambda(BinOp::Add, PrimType::I64);
    let mut inner = vec![];
    let red = b
        .bind_multi(
            &mut inner,
            "red",
            soac(Soac::Redomap(Redomap {
                w: mp.m(),
                comm: Commutativity::Commutative,
                red_lam,
                map_lam,
                nes: vec![SubExp::i64(0)],
                arrs: vec![xs.var],
            })),
        )
        .unwrap();
    let scanned = b
        .bind(
            &mut inner,
            "scanned",
            soac(Soac::Scan(Scan {
                w: mp.m(),
                lam: scan_lam,
                nes: vec![SubExp::i64(0)],
                arrs: vec![red[1]],
            })),
        )
        .unwrap();
    let lam = Lambda {
        params: vec![xs],
        body: Body::new(inner, vec![SubExp::Var(red[0]), SubExp::Var(scanned)]),
        ret: vec![Type::i64(), mp.row_ty.clone()],
    };
    let mut stms = vec![];
    let res = b
        .bind_multi(
            &mut stms,
            "res",
            soac(Soac::Map(Map {
                w: mp.n(),
                lam,
                arrs: vec![mp.xss.var],
            })),
        )
        .unwrap();
    main_program(&b, mp.into_params(), stms, res)
}

/// `map (\xs -> loop ys = xs for i < k do map (+i) ys) xss`
pub fn map_of_loop() -> Program {
    let mut b = IrBuilder::new();
    let mp = MatrixParams::new(&mut b);
    let k = b.param("k", Type::i64());
    let xs = b.param("xs", mp.row_ty.clone());
    let ys = b.param("ys", mp.row_ty.clone());
    let i = b.param("i", Type::i64()).var;
    let add_i = scalar_lambda(&mut b, BinOp::Add, SubExp::Var(i));
    let mut loop_stms = vec![];
    let zs = b
        .bind(
            &mut loop_stms,
            "zs",
            soac(Soac::Map(Map {
                w: mp.m(),
                lam: add_i,
                arrs: vec![ys.var],
            })),
        )
        .unwrap();
    let mut inner = vec![];
    let looped = b
        .bind(
            &mut inner,
            "looped",
            Exp::Loop {
                merge: vec![(ys, SubExp::Var(xs.var))],
                form: LoopForm::For {
                    i,
                    bound: SubExp::Var(k.var),
                },
                body: Body::new(loop_stms, vec![SubExp::Var(zs)]),
            },
        )
        .unwrap();
    let lam = Lambda {
        params: vec![xs],
        body: Body::new(inner, vec![SubExp::Var(looped)]),
        ret: vec![mp.row_ty.clone()],
    };
    let mut stms = vec![];
    let res = b
        .bind(
            &mut stms,
            "res",
            soac(Soac::Map(Map {
                w: mp.n(),
                lam,
                arrs: vec![mp.xss.var],
            })),
        )
        .unwrap();
    let mut params = mp.into_params();
    params.push(k);
    main_program(&b, params, stms, vec![res])
}

/// `map (\xs -> if c then map (+1) xs else xs) xss`
pub fn map_of_branch() -> Program {
    let mut b = IrBuilder::new();
    let mp = MatrixParams::new(&mut b);
    let c = b.param("c", Type::bool());
    let xs = b.param("xs", mp.row_ty.clone());
    let inc = scalar_lambda(&mut b, BinOp::Add, SubExp::i64(1));
    let mut then_stms = vec![];
    let incremented = b
        .bind(
            &mut then_stms,
            "incremented",
            soac(Soac::Map(Map {
                w: mp.m(),
                lam: inc,
                arrs: vec![xs.var],
            })),
        )
        .unwrap();
    let mut inner = vec![];
    let branched = b
        .bind(
            &mut inner,
            "branched",
            Exp::If {
                cond: SubExp::Var(c.var),
                then_body: Body::new(then_stms, vec![SubExp::Var(incremented)]),
                else_body: Body::new(vec![], vec![SubExp::Var(xs.var)]),
                ret: vec![ExtType::from(mp.row_ty.clone())],
            },
        )
        .unwrap();
    let lam = Lambda {
        params: vec![xs],
        body: Body::new(inner, vec![SubExp::Var(branched)]),
        ret: vec![mp.row_ty.clone()],
    };
    let mut stms = vec![];
    let res = b
        .bind(
            &mut stms,
            "res",
            soac(Soac::Map(Map {
                w: mp.n(),
                lam,
                arrs: vec![mp.xss.var],
            })),
        )
        .unwrap();
    let mut params = mp.into_params();
    params.push(c);
    main_program(&b, params, stms, vec![res])
}

/// The sum of squares of `xs: [n]i64`, as a redomap.
pub fn sum_of_squares() -> Program {
    let mut b = IrBuilder::new();
    let n = b.param("n", Type::i64());
    let xs = b.param("xs", Type::array(PrimType::I64, vec![SubExp::Var(n.var)]));
    let x = b.param("x", Type::i64());
    let mut sq_stms = vec![];
    let sq = b
        .bind_se(&mut sq_stms, "sq", Exp::BinOp(BinOp::Mul, SubExp::Var(x.var), SubExp::Var(x.var)))
        .unwrap();
    let map_lam = Lambda {
        params: vec![x],
        body: Body::new(sq_stms, vec![sq]),
        ret: vec![Type::i64()],
    };
    let red_lam = b.binop_lambda(BinOp::Add, PrimType::I64);
    let mut stms = vec![];
    let res = b
        .bind(
            &mut stms,
            "res",
            soac(Soac::Redomap(Redomap {
                w: SubExp::Var(n.var),
                comm: Commutativity::Commutative,
                red_lam,
                map_lam,
                nes: vec![SubExp::i64(0)],
                arrs: vec![xs.var],
            })),
        )
        .unwrap();
    main_program(&b, vec![n, xs], stms, vec![res])
}

/// Inclusive prefix sums of `xs: [n]i64`.
pub fn prefix_sums() -> Program {
    let mut b = IrBuilder::new();
    let n = b.param("n", Type::i64());
    let xs = b.param("xs", Type::array(PrimType::I64, vec![SubExp::Var(n.var)]));
    let add = b.binop_lambda(BinOp::Add, PrimType::I64);
    let mut stms = vec![];
    let res = b
        .bind(
            &mut stms,
            "res",
            soac(Soac::Scan(Scan {
                w: SubExp::Var(n.var),
                lam: add,
                nes: vec![SubExp::i64(0)],
                arrs: vec![xs.var],
            })),
        )
        .unwrap();
    main_program(&b, vec![n, xs], stms, vec![res])
}

/// `scatter dest is vs` with `dest: [k]i64` and `is, vs: [n]i64`.
pub fn scatter_into() -> Program {
    let mut b = IrBuilder::new();
    let n = b.param("n", Type::i64());
    let k = b.param("k", Type::i64());
    let dest = b.param("dest", Type::array(PrimType::I64, vec![SubExp::Var(k.var)]));
    let is = b.param("is", Type::array(PrimType::I64, vec![SubExp::Var(n.var)]));
    let vs = b.param("vs", Type::array(PrimType::I64, vec![SubExp::Var(n.var)]));
    let lam = b.identity_lambda(&[Type::i64(), Type::i64()]);
    let mut stms = vec![];
    let res = b
        .bind(
            &mut stms,
            "res",
            soac(Soac::Scatter(Scatter {
                w: SubExp::Var(n.var),
                lam,
                arrs: vec![is.var, vs.var],
                dests: vec![(SubExp::Var(k.var), dest.var)],
            })),
        )
        .unwrap();
    main_program(&b, vec![n, k, dest, is, vs], stms, vec![res])
}

/// Row `i` of `dest: [k]i64` becomes `i * 10` for `1 <= i < n + 1`.
pub fn with_loop_into() -> Program {
    let mut b = IrBuilder::new();
    let n = b.param("n", Type::i64());
    let k = b.param("k", Type::i64());
    let dest = b.param("dest", Type::array(PrimType::I64, vec![SubExp::Var(k.var)]));
    let lam = scalar_lambda(&mut b, BinOp::Mul, SubExp::i64(10));
    let mut stms = vec![];
    let res = b
        .bind(
            &mut stms,
            "res",
            soac(Soac::WithLoop(WithLoop {
                w: SubExp::Var(n.var),
                offset: SubExp::i64(1),
                lam,
                dests: vec![(SubExp::Var(k.var), dest.var)],
            })),
        )
        .unwrap();
    main_program(&b, vec![n, k, dest], stms, vec![res])
}

/// `map (\xs -> xs with [i] = i * i for 1 <= i < 3) xss`
pub fn map_of_with_loop() -> Program {
    let mut b = IrBuilder::new();
    let mp = MatrixParams::new(&mut b);
    let xs = b.param("xs", mp.row_ty.clone());
    let i = b.param("i", Type::i64());
    let square = scalar_lambda_over(&mut b, i, BinOp::Mul);
    let mut inner = vec![];
    let updated = b
        .bind(
            &mut inner,
            "updated",
            soac(Soac::WithLoop(WithLoop {
                w: SubExp::i64(2),
                offset: SubExp::i64(1),
                lam: square,
                dests: vec![(mp.m(), xs.var)],
            })),
        )
        .unwrap();
    let lam = Lambda {
        params: vec![xs],
        body: Body::new(inner, vec![SubExp::Var(updated)]),
        ret: vec![mp.row_ty.clone()],
    };
    let mut stms = vec![];
    let res = b
        .bind(
            &mut stms,
            "res",
            soac(Soac::Map(Map {
                w: mp.n(),
                lam,
                arrs: vec![mp.xss.var],
            })),
        )
        .unwrap();
    main_program(&b, mp.into_params(), stms, vec![res])
}

/// `\x -> x op x`.
fn scalar_lambda_over(b: &mut IrBuilder, x: Param, op: BinOp) -> Lambda {
    let mut stms = vec![];
    let r = b.bind_se(&mut stms, "r", Exp::BinOp(op, SubExp::Var(x.var), SubExp::Var(x.var))).unwrap();
    Lambda {
        params: vec![x],
        body: Body::new(stms, vec![r]),
        ret: vec![Type::i64()],
    }
}

/// The sum of `xs: [n]i64` as a parallel stream summing each chunk.
pub fn stream_sum() -> Program {
    let mut b = IrBuilder::new();
    let n = b.param("n", Type::i64());
    let xs = b.param("xs", Type::array(PrimType::I64, vec![SubExp::Var(n.var)]));
    let chunk = b.param("chunk", Type::i64());
    let acc = b.param("acc", Type::i64());
    let chunk_xs = b.param("chunk_xs", Type::array(PrimType::I64, vec![SubExp::Var(chunk.var)]));
    let add = b.binop_lambda(BinOp::Add, PrimType::I64);
    let mut body = vec![];
    let part = b
        .bind_se(
            &mut body,
            "part",
            soac(Soac::Reduce(Reduce {
                w: SubExp::Var(chunk.var),
                comm: Commutativity::Commutative,
                lam: add,
                nes: vec![SubExp::i64(0)],
                arrs: vec![chunk_xs.var],
            })),
        )
        .unwrap();
    let new_acc = b
        .bind_se(&mut body, "new_acc", Exp::BinOp(BinOp::Add, SubExp::Var(acc.var), part))
        .unwrap();
    let lam = Lambda {
        params: vec![chunk, acc, chunk_xs],
        body: Body::new(body, vec![new_acc]),
        ret: vec![Type::i64()],
    };
    let red_lam = b.binop_lambda(BinOp::Add, PrimType::I64);
    let mut stms = vec![];
    let res = b
        .bind(
            &mut stms,
            "res",
            soac(Soac::Stream(Stream {
                w: SubExp::Var(n.var),
                form: StreamForm::Parallel {
                    order: StreamOrd::Disorder,
                    comm: Commutativity::Commutative,
                    red_lam,
                },
                lam,
                accs: vec![SubExp::i64(0)],
                arrs: vec![xs.var],
            })),
        )
        .unwrap();
    main_program(&b, vec![n, xs], stms, vec![res])
}

/// Every kernel of `stms`, at any depth outside kernel bodies.
pub fn kernels(stms: &[Stm]) -> Vec<&Kernel> {
    let mut out = vec![];
    for stm in stms {
        match &stm.exp {
            Exp::Op(Op::Kernel(k)) => out.push(k.as_ref()),
            Exp::If {
                then_body,
                else_body,
                ..
            } => {
                out.extend(kernels(&then_body.stms));
                out.extend(kernels(&else_body.stms));
            }
            Exp::Loop { body, .. } => out.extend(kernels(&body.stms)),
            _ => {}
        }
    }
    out
}
