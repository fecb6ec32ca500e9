#![cfg(test)]

use crate::extract::distribution::permutation_and_missing;
use crate::extract::{ExtractConfig, collect_sizes, extract_kernels};
use crate::ir::builder::IrBuilder;
use crate::ir::{BinOp, Exp, Op, Program, SizeClass, SubExp, Type};
use crate::test_programs::*;
use crate::verify::{Stage, has_soacs, verify_program};

fn extract(program: Program, incremental_flattening: bool) -> (Program, Vec<String>) {
    let config = ExtractConfig {
        incremental_flattening,
    };
    let (program, log) = extract_kernels(program, &config).unwrap();
    verify_program(&program, Stage::Kernels).unwrap();
    (program, log)
}

fn assert_no_nested_kernels(program: &Program) {
    for fun in &program.funs {
        for k in kernels(&fun.body.stms) {
            assert!(
                kernels(&k.body.stms).is_empty(),
                "kernel {} contains another kernel",
                k.desc
            );
        }
    }
}

#[test]
fn test_map_of_scan_becomes_one_flat_scan() {
    let (program, log) = extract(map_of_scan(), false);
    assert!(!has_soacs(&program));
    assert_no_nested_kernels(&program);

    let fun = &program.funs[0];
    let n = SubExp::Var(fun.params[0].var);
    let m = SubExp::Var(fun.params[1].var);
    let all = kernels(&fun.body.stms);
    let applies: Vec<_> = all.iter().filter(|k| k.desc == "scan_apply").collect();
    assert_eq!(applies.len(), 1);

    // The scan runs over all n * m elements at once.
    let width = applies[0].space.widths()[0].var().expect("flat width is a name");
    let def = fun
        .body
        .stms
        .iter()
        .find(|stm| stm.pat.vals.iter().any(|pe| pe.var == width))
        .expect("flat width is bound at the top level");
    assert_eq!(def.exp, Exp::BinOp(BinOp::Mul, n, m));
    assert!(log.iter().any(|l| l.contains("segmented scan")));
}

#[test]
fn test_map_of_scan_keeps_values() {
    let program = map_of_scan();
    let expected = run_main(&program, &matrix_args());
    let (extracted, _) = extract(program, false);
    assert_eq!(run_main(&extracted, &matrix_args()), expected);
    assert_eq!(
        expected[0].to_string(),
        "[[-7, -13, -18, -22, -25], [3, 7, 12, 18, 25], [13, 27, 42, 58, 75]]"
    );
}

#[test]
fn test_distribution_splits_map_and_reduce() {
    let program = map_of_map_and_reduce();
    let args = matrix_args();
    let expected = run_main(&program, &args);
    let (extracted, _) = extract(program, false);
    assert!(!has_soacs(&extracted));
    assert_no_nested_kernels(&extracted);
    assert_eq!(run_main(&extracted, &args), expected);
}

#[test]
fn test_loop_is_interchanged_outwards() {
    let program = map_of_loop();
    let mut args = matrix_args();
    args.push(crate::interp::Value::i64(4));
    let expected = run_main(&program, &args);
    let (extracted, _) = extract(program, false);
    assert_no_nested_kernels(&extracted);
    // The loop now sits outside the kernels.
    let fun = &extracted.funs[0];
    assert!(
        fun.body
            .stms
            .iter()
            .any(|stm| matches!(stm.exp, Exp::Loop { .. }))
    );
    assert_eq!(run_main(&extracted, &args), expected);
}

#[test]
fn test_branch_is_interchanged_outwards() {
    let program = map_of_branch();
    for c in [true, false] {
        let mut args = matrix_args();
        args.push(crate::interp::Value::bool(c));
        let expected = run_main(&program, &args);
        let (extracted, _) = extract(program.clone(), false);
        assert_no_nested_kernels(&extracted);
        assert_eq!(run_main(&extracted, &args), expected);
    }
}

#[test]
fn test_with_loop_is_extracted_as_scatter() {
    let (program, log) = extract(with_loop_into(), false);
    assert!(!has_soacs(&program));
    assert!(log.iter().any(|l| l.contains("with-loop rewritten as scatter")));
    let descs: Vec<&str> = kernels(&program.funs[0].body.stms)
        .iter()
        .map(|k| k.desc.as_str())
        .collect();
    assert_eq!(descs, vec!["scatter"]);
}

#[test]
fn test_top_level_reduction_is_blocked() {
    let (program, log) = extract(sum_of_squares(), false);
    let descs: Vec<&str> = kernels(&program.funs[0].body.stms)
        .iter()
        .map(|k| k.desc.as_str())
        .collect();
    assert_eq!(descs, vec!["chunked_red", "final_red"]);
    assert!(log.iter().any(|l| l.contains("blocked reduction")));
    let sizes = collect_sizes(&program);
    assert!(sizes.values().any(|c| *c == SizeClass::GroupSize));
    assert!(sizes.values().any(|c| *c == SizeClass::NumGroups));
}

#[test]
fn test_incremental_flattening_guards_versions_with_thresholds() {
    let (program, log) = extract(map_of_map_and_reduce(), true);
    let sizes = collect_sizes(&program);
    let thresholds: Vec<&String> = sizes
        .iter()
        .filter(|(_, c)| **c == SizeClass::Threshold)
        .map(|(name, _)| name)
        .collect();
    assert!(thresholds.iter().any(|name| name.contains("suff_outer_par")));
    assert!(thresholds.iter().all(|name| name.starts_with("main.")));
    assert!(log.iter().any(|l| l.contains("versions")));

    let (plain, _) = extract(map_of_map_and_reduce(), false);
    assert!(
        collect_sizes(&plain)
            .values()
            .all(|c| *c != SizeClass::Threshold)
    );
}

#[test]
fn test_maps_without_worthwhile_versions_get_no_thresholds() {
    // Only a map inside a branch: neither sequentialising nor an
    // intra-group version pays off.
    let (program, log) = extract(map_of_branch(), true);
    assert!(
        collect_sizes(&program)
            .values()
            .all(|c| *c != SizeClass::Threshold)
    );
    assert!(log.iter().any(|l| l.contains("compiled to 1 versions")));
}

#[test]
fn test_permutation_and_missing_reorders_results() {
    let mut b = IrBuilder::new();
    let a = b.pat_elem("a", Type::i64());
    let c = b.pat_elem("c", Type::i64());
    let d = b.pat_elem("d", Type::i64());
    let pat = vec![a.clone(), c.clone(), d.clone()];
    let res = vec![SubExp::Var(d.var), SubExp::Var(a.var)];
    let (perm, missing) = permutation_and_missing(&pat, &res).unwrap();
    assert_eq!(perm, vec![1, 2, 0]);
    assert_eq!(missing, vec![c]);
}

#[test]
fn test_permutation_and_missing_rejects_foreign_names() {
    let mut b = IrBuilder::new();
    let a = b.pat_elem("a", Type::i64());
    let other = b.pat_elem("other", Type::i64());
    assert!(permutation_and_missing(std::slice::from_ref(&a), &[SubExp::Var(other.var)]).is_none());
    assert!(permutation_and_missing(std::slice::from_ref(&a), &[SubExp::i64(0)]).is_none());
    assert!(
        permutation_and_missing(std::slice::from_ref(&a), &[SubExp::Var(a.var), SubExp::Var(a.var)]).is_none()
    );
}

#[test]
fn test_extraction_without_soacs_is_identity_on_values() {
    let mut b = IrBuilder::new();
    let x = b.param("x", Type::i64());
    let mut stms = vec![];
    let y = b
        .bind(&mut stms, "y", Exp::BinOp(BinOp::Mul, SubExp::Var(x.var), SubExp::i64(3)))
        .unwrap();
    let program = main_program(&b, vec![x], stms, vec![y]);
    let (extracted, log) = extract(program.clone(), true);
    assert!(log.is_empty());
    assert_eq!(extracted.funs[0].body.stms.len(), 1);
    assert!(!matches!(extracted.funs[0].body.stms[0].exp, Exp::Op(Op::Kernel(_))));
}
