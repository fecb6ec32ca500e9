#![cfg(test)]

use crate::babysitter::{babysit_program, tiny_rows};
use crate::extract::{ExtractConfig, extract_kernels};
use crate::first_order::first_order_stms;
use crate::interp::Value;
use crate::ir::builder::IrBuilder;
use crate::ir::{
    BinOp, Commutativity, Exp, Kernel, KernelBody, KernelInput, KernelResult, KernelSpace, Op, Param, PrimType,
    Program, Reduce, SegLevel, Soac, Stm, SubExp, Type, VarId,
};
use crate::test_programs::*;
use crate::verify::{Stage, verify_program};

fn manifests(program: &Program) -> Vec<(Vec<usize>, VarId)> {
    program.funs[0]
        .body
        .stms
        .iter()
        .filter_map(|stm| match &stm.exp {
            Exp::Manifest { perm, arr } => Some((perm.clone(), *arr)),
            _ => None,
        })
        .collect()
}

fn thread_kernel_over(
    b: &mut IrBuilder,
    dims: Vec<(VarId, SubExp)>,
    inputs: Vec<KernelInput>,
    stms: Vec<Stm>,
    result: SubExp,
) -> Exp {
    let global_tid = match dims.as_slice() {
        [(gtid, _)] => *gtid,
        _ => b.param("global_tid", Type::i64()).var,
    };
    Exp::Op(Op::Kernel(Box::new(Kernel {
        desc: "segmap".to_string(),
        space: KernelSpace {
            level: SegLevel::Thread,
            global_tid,
            group_size: SubExp::i64(4),
            num_groups: SubExp::i64(4),
            dims,
        },
        inputs,
        body: KernelBody {
            stms,
            results: vec![KernelResult::Threads(result)],
        },
        ret: vec![Type::i64()],
    })))
}

/// A kernel summing every row of `xss: [n][m]i64`, one thread per row.
fn row_sums(m: SubExp) -> (Program, Vec<Param>) {
    let mut b = IrBuilder::new();
    let n = b.param("n", Type::i64());
    let row_ty = Type::array(PrimType::I64, vec![m.clone()]);
    let xss = b.param("xss", row_ty.array_of(SubExp::Var(n.var)));
    let gtid = b.param("gtid", Type::i64()).var;
    let row = b.param("row", row_ty);
    let add = b.binop_lambda(BinOp::Add, PrimType::I64);
    let mut body = vec![];
    let sum = b
        .bind_se(
            &mut body,
            "sum",
            soac(Soac::Reduce(Reduce {
                w: m,
                comm: Commutativity::Commutative,
                lam: add,
                nes: vec![SubExp::i64(0)],
                arrs: vec![row.var],
            })),
        )
        .unwrap();
    let body = first_order_stms(&mut b, body).unwrap();
    let kernel = thread_kernel_over(
        &mut b,
        vec![(gtid, SubExp::Var(n.var))],
        vec![KernelInput {
            param: row,
            arr: xss.var,
            indices: vec![SubExp::Var(gtid)],
        }],
        body,
        sum,
    );
    let mut stms = vec![];
    let sums = b.bind(&mut stms, "sums", kernel).unwrap();
    let params = vec![n, xss];
    (main_program(&b, params.clone(), stms, vec![sums]), params)
}

#[test]
fn test_rows_read_sequentially_are_transposed() {
    let (program, params) = row_sums(SubExp::i64(6));
    let babysat = babysit_program(program.clone()).unwrap();
    verify_program(&babysat, Stage::Kernels).unwrap();

    let xss = params[1].var;
    assert_eq!(manifests(&babysat), vec![(vec![1, 0], xss)]);
    let k = kernels(&babysat.funs[0].body.stms)[0];
    assert_ne!(k.inputs[0].arr, xss);

    let args = vec![Value::i64(3), i64_matrix(3, 6, |i, j| (i * 6 + j) as i64)];
    assert_eq!(run_main(&babysat, &args), run_main(&program, &args));
    assert_eq!(run_main(&babysat, &args)[0], Value::i64_array(&[15, 51, 87]));
}

#[test]
fn test_tiny_rows_are_left_alone() {
    let (program, _) = row_sums(SubExp::i64(2));
    let babysat = babysit_program(program.clone()).unwrap();
    assert_eq!(babysat, program);
}

#[test]
fn test_row_size_overflow_counts_as_large() {
    assert!(tiny_rows(&[SubExp::i64(1), SubExp::i64(3)]));
    assert!(!tiny_rows(&[SubExp::i64(2), SubExp::i64(2)]));
    assert!(!tiny_rows(&[SubExp::i64(1 << 40), SubExp::i64(1 << 40)]));
    assert!(!tiny_rows(&[SubExp::i64(i64::MAX), SubExp::i64(2), SubExp::i64(0)]));
}

#[test]
fn test_thread_indexed_reads_follow_thread_order() {
    // out[i][j] = xss[j][i]
    let mut b = IrBuilder::new();
    let n = b.param("n", Type::i64());
    let m = b.param("m", Type::i64());
    let xss = b.param(
        "xss",
        Type::array(PrimType::I64, vec![SubExp::Var(n.var), SubExp::Var(m.var)]),
    );
    let i = b.param("i", Type::i64()).var;
    let j = b.param("j", Type::i64()).var;
    let x = b.param("x", Type::i64());
    let kernel = thread_kernel_over(
        &mut b,
        vec![(i, SubExp::Var(m.var)), (j, SubExp::Var(n.var))],
        vec![KernelInput {
            param: x.clone(),
            arr: xss.var,
            indices: vec![SubExp::Var(j), SubExp::Var(i)],
        }],
        vec![],
        SubExp::Var(x.var),
    );
    let mut stms = vec![];
    let out = b.bind(&mut stms, "out", kernel).unwrap();
    let program = main_program(&b, vec![n, m, xss.clone()], stms, vec![out]);

    let babysat = babysit_program(program.clone()).unwrap();
    assert_eq!(manifests(&babysat), vec![(vec![1, 0], xss.var)]);
    let args = vec![Value::i64(2), Value::i64(3), i64_matrix(2, 3, |i, j| (i * 3 + j) as i64)];
    let res = run_main(&babysat, &args);
    assert_eq!(res, run_main(&program, &args));
    assert_eq!(res[0].to_string(), "[[0, 3], [1, 4], [2, 5]]");
}

#[test]
fn test_chunked_reads_are_stored_chunk_transposed() {
    let config = ExtractConfig::default();
    let (program, _) = extract_kernels(sum_of_squares(), &config).unwrap();
    let babysat = babysit_program(program.clone()).unwrap();
    verify_program(&babysat, Stage::Kernels).unwrap();
    assert!(manifests(&babysat).iter().any(|(perm, _)| perm == &vec![1, 0]));

    for n in [0, 1, 7, 100] {
        let xs: Vec<i64> = (0..n).map(|x| x - 3).collect();
        let args = vec![Value::i64(n), Value::i64_array(&xs)];
        let expected: i64 = xs.iter().map(|x| x * x).sum();
        assert_eq!(run_main(&babysat, &args), vec![Value::i64(expected)]);
    }
}

#[test]
fn test_babysitting_is_idempotent() {
    let config = ExtractConfig::default();
    let programs = vec![
        sum_of_squares(),
        prefix_sums(),
        map_of_scan(),
        map_of_map_and_reduce(),
        map_of_loop(),
        stream_sum(),
    ];
    for program in programs {
        let (extracted, _) = extract_kernels(program, &config).unwrap();
        let once = babysit_program(extracted).unwrap();
        let twice = babysit_program(once.clone()).unwrap();
        assert_eq!(once, twice);
    }
    let (rows, _) = row_sums(SubExp::i64(6));
    let once = babysit_program(rows).unwrap();
    assert_eq!(babysit_program(once.clone()).unwrap(), once);
}
