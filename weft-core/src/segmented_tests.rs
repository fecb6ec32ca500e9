#![cfg(test)]
//! Nested SOACs and array operations flattened into segmented form.

use std::rc::Rc;

use crate::extract::{ExtractConfig, extract_kernels};
use crate::interp::{ArrayValue, Value};
use crate::ir::builder::IrBuilder;
use crate::ir::{
    BinOp, Body, Commutativity, Exp, Lambda, Map, PrimType, PrimValue, Program, Reduce, Scatter, Soac, SubExp,
    Type,
};
use crate::test_programs::*;
use crate::verify::{Stage, has_soacs, verify_program};

fn extract_checked(program: &Program) -> (Program, Vec<String>) {
    let (extracted, log) = extract_kernels(program.clone(), &ExtractConfig::default()).unwrap();
    verify_program(&extracted, Stage::Kernels).unwrap();
    assert!(!has_soacs(&extracted));
    (extracted, log)
}

/// `map (\xs -> reduce (+) 0 xs) xss`
fn row_sums() -> Program {
    let mut b = IrBuilder::new();
    let n = b.param("n", Type::i64());
    let m = b.param("m", Type::i64());
    let row_ty = Type::array(PrimType::I64, vec![SubExp::Var(m.var)]);
    let xss = b.param("xss", row_ty.array_of(SubExp::Var(n.var)));
    let xs = b.param("xs", row_ty);
    let add = b.binop_lambda(BinOp::Add, PrimType::I64);
    let mut inner = vec![];
    let sum = b
        .bind_se(
            &mut inner,
            "sum",
            soac(Soac::Reduce(Reduce {
                w: SubExp::Var(m.var),
                comm: Commutativity::Commutative,
                lam: add,
                nes: vec![SubExp::i64(0)],
                arrs: vec![xs.var],
            })),
        )
        .unwrap();
    let lam = Lambda {
        params: vec![xs],
        body: Body::new(inner, vec![sum]),
        ret: vec![Type::i64()],
    };
    let mut stms = vec![];
    let res = b
        .bind(
            &mut stms,
            "res",
            soac(Soac::Map(Map {
                w: SubExp::Var(n.var),
                lam,
                arrs: vec![xss.var],
            })),
        )
        .unwrap();
    main_program(&b, vec![n, m, xss], stms, vec![res])
}

#[test]
fn test_nested_reduction_becomes_segmented() {
    let program = row_sums();
    let (extracted, log) = extract_checked(&program);
    assert!(log.iter().any(|l| l.contains("segmented reduction over 1 levels")));
    let args = matrix_args();
    assert_eq!(run_main(&extracted, &args), vec![Value::i64_array(&[-25, 25, 75])]);
    assert_eq!(run_main(&extracted, &args), run_main(&program, &args));
}

#[test]
fn test_nested_reduction_handles_empty_segments() {
    let (extracted, _) = extract_checked(&row_sums());
    let args = vec![Value::i64(4), Value::i64(0), i64_matrix(4, 0, |_, _| 0)];
    assert_eq!(run_main(&extracted, &args), vec![Value::i64_array(&[0, 0, 0, 0])]);
}

/// `map (\d is vs -> scatter d is vs) ds iss vss`
fn row_scatters() -> Program {
    let mut b = IrBuilder::new();
    let n = b.param("n", Type::i64());
    let k = b.param("k", Type::i64());
    let p = b.param("p", Type::i64());
    let dest_ty = Type::array(PrimType::I64, vec![SubExp::Var(k.var)]);
    let src_ty = Type::array(PrimType::I64, vec![SubExp::Var(p.var)]);
    let ds = b.param("ds", dest_ty.array_of(SubExp::Var(n.var)));
    let iss = b.param("iss", src_ty.array_of(SubExp::Var(n.var)));
    let vss = b.param("vss", src_ty.array_of(SubExp::Var(n.var)));
    let d = b.param("d", dest_ty.clone());
    let is = b.param("is", src_ty.clone());
    let vs = b.param("vs", src_ty);
    let write = b.identity_lambda(&[Type::i64(), Type::i64()]);
    let mut inner = vec![];
    let written = b
        .bind(
            &mut inner,
            "written",
            soac(Soac::Scatter(Scatter {
                w: SubExp::Var(p.var),
                lam: write,
                arrs: vec![is.var, vs.var],
                dests: vec![(SubExp::Var(k.var), d.var)],
            })),
        )
        .unwrap();
    let lam = Lambda {
        params: vec![d, is, vs],
        body: Body::new(inner, vec![SubExp::Var(written)]),
        ret: vec![dest_ty],
    };
    let mut stms = vec![];
    let res = b
        .bind(
            &mut stms,
            "res",
            soac(Soac::Map(Map {
                w: SubExp::Var(n.var),
                lam,
                arrs: vec![ds.var, iss.var, vss.var],
            })),
        )
        .unwrap();
    main_program(&b, vec![n, k, p, ds, iss, vss], stms, vec![res])
}

#[test]
fn test_nested_scatter_writes_only_its_own_row() {
    let program = row_scatters();
    let (extracted, log) = extract_checked(&program);
    assert!(log.iter().any(|l| l.contains("segmented scatter")));

    // Index 4 is out of bounds for rows of 4 and must not spill into the
    // next row; -1 is ignored as well.
    let is = [[0, 4, 2], [3, -1, 1]];
    let args = vec![
        Value::i64(2),
        Value::i64(4),
        Value::i64(3),
        i64_matrix(2, 4, |_, _| 0),
        i64_matrix(2, 3, |i, j| is[i][j]),
        i64_matrix(2, 3, |i, j| (10 * (i + 1) + j) as i64),
    ];
    let res = run_main(&extracted, &args);
    assert_eq!(res[0].to_string(), "[[10, 0, 12, 0], [0, 22, 0, 20]]");
    assert_eq!(res, run_main(&program, &args));
}

/// `map (\xs -> rearrange [1, 0] xs) xsss` over `[n][2][3]`.
fn row_transposes() -> Program {
    let mut b = IrBuilder::new();
    let n = b.param("n", Type::i64());
    let inner_ty = Type::array(PrimType::I64, vec![SubExp::i64(2), SubExp::i64(3)]);
    let xsss = b.param("xsss", inner_ty.array_of(SubExp::Var(n.var)));
    let xs = b.param("xs", inner_ty);
    let mut inner = vec![];
    let tr = b
        .bind(&mut inner, "tr", Exp::Rearrange { perm: vec![1, 0], arr: xs.var })
        .unwrap();
    let lam = Lambda {
        params: vec![xs],
        body: Body::new(inner, vec![SubExp::Var(tr)]),
        ret: vec![Type::array(PrimType::I64, vec![SubExp::i64(3), SubExp::i64(2)])],
    };
    let mut stms = vec![];
    let res = b
        .bind(
            &mut stms,
            "res",
            soac(Soac::Map(Map {
                w: SubExp::Var(n.var),
                lam,
                arrs: vec![xsss.var],
            })),
        )
        .unwrap();
    main_program(&b, vec![n, xsss], stms, vec![res])
}

#[test]
fn test_nested_rearrange_is_lifted_past_the_nest() {
    let program = row_transposes();
    let (extracted, _) = extract_checked(&program);
    let lifted = extracted.funs[0]
        .body
        .stms
        .iter()
        .find_map(|stm| match &stm.exp {
            Exp::Rearrange { perm, .. } => Some(perm.clone()),
            _ => None,
        });
    assert_eq!(lifted, Some(vec![0, 2, 1]));

    let data = (0..12).map(PrimValue::I64).collect();
    let xsss = Value::Array(ArrayValue {
        elem: PrimType::I64,
        shape: vec![2, 2, 3],
        data: Rc::new(data),
    });
    let args = vec![Value::i64(2), xsss];
    let res = run_main(&extracted, &args);
    assert_eq!(
        res[0].to_string(),
        "[[[0, 3], [1, 4], [2, 5]], [[6, 9], [7, 10], [8, 11]]]"
    );
    assert_eq!(res, run_main(&program, &args));
}

#[test]
fn test_flattened_segments_reshape_back_for_small_sizes() {
    let program = map_of_scan();
    let (extracted, _) = extract_checked(&program);
    for nesting_size in 0..4 {
        for segment_size in 1..5 {
            let args = vec![
                Value::i64(nesting_size as i64),
                Value::i64(segment_size as i64),
                i64_matrix(nesting_size, segment_size, |i, j| (i * 7 + j) as i64 % 5 - 2),
            ];
            let res = run_main(&extracted, &args);
            assert_eq!(res[0].shape(), &[nesting_size, segment_size]);
            assert_eq!(res, run_main(&program, &args), "{nesting_size} segments of {segment_size}");
        }
    }
}
