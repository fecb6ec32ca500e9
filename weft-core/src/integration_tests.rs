#![cfg(test)]
//! End-to-end tests of the compilation pipeline.
//!
//! Every program is interpreted before compilation and again after it under
//! a range of configurations and size settings. Whatever version the
//! thresholds select, the values must not change.

use crate::extract::ExtractConfig;
use crate::interp::{SizeTable, Value, run_program};
use crate::ir::{Program, SegLevel, SizeClass};
use crate::test_programs::*;
use crate::{Compiled, Compiler, compile};

fn configs() -> Vec<ExtractConfig> {
    vec![
        ExtractConfig {
            incremental_flattening: false,
        },
        ExtractConfig {
            incremental_flattening: true,
        },
    ]
}

/// Size settings covering every version and uneven chunking.
fn size_tables(compiled: &Compiled) -> Vec<SizeTable> {
    let mut tables = vec![SizeTable::new()];
    for threshold in [0, 1 << 40] {
        let mut t = SizeTable::new();
        t.set_class(&compiled.sizes, SizeClass::Threshold, threshold);
        tables.push(t);
    }
    let mut small = SizeTable::new();
    small.set_class(&compiled.sizes, SizeClass::GroupSize, 3);
    small.set_class(&compiled.sizes, SizeClass::NumGroups, 2);
    small.set_class(&compiled.sizes, SizeClass::Threshold, 0);
    tables.push(small);
    let mut one = SizeTable::new();
    one.set_class(&compiled.sizes, SizeClass::GroupSize, 1);
    one.set_class(&compiled.sizes, SizeClass::NumGroups, 1);
    tables.push(one);
    tables.push(intra_group_sizes(compiled));
    tables
}

/// Sizes rejecting every outer version and accepting every intra-group one.
fn intra_group_sizes(compiled: &Compiled) -> SizeTable {
    let mut t = SizeTable::new();
    for (name, class) in &compiled.sizes {
        if *class == SizeClass::Threshold {
            t.set(name.clone(), if name.contains("suff_intra_par") { 0 } else { 1 << 40 });
        }
    }
    t
}

fn check_program(program: Program, args: Vec<Value>) {
    let expected = run_main(&program, &args);
    for config in configs() {
        let compiled = compile(program.clone(), &config).unwrap();
        for sizes in size_tables(&compiled) {
            let got = run_program(&compiled.program, "main", args.clone(), &sizes).unwrap();
            assert_eq!(
                got, expected,
                "incremental flattening {}, sizes {sizes:?}",
                config.incremental_flattening
            );
        }
    }
}

#[test]
fn test_map_of_scan_end_to_end() {
    check_program(map_of_scan(), matrix_args());
}

#[test]
fn test_map_of_map_and_reduce_end_to_end() {
    check_program(map_of_map_and_reduce(), matrix_args());
}

#[test]
fn test_map_of_redomap_and_scan_end_to_end() {
    check_program(map_of_redomap_and_scan(), matrix_args());
}

#[test]
fn test_intra_group_version_keeps_values() {
    let program = map_of_redomap_and_scan();
    let args = matrix_args();
    let expected = run_main(&program, &args);
    assert_eq!(expected[0], Value::i64_array(&[-25, 25, 75]));
    assert_eq!(
        expected[1].to_string(),
        "[[49, 85, 110, 126, 135], [9, 25, 50, 86, 135], [169, 365, 590, 846, 1135]]"
    );

    let compiled = compile(
        program,
        &ExtractConfig {
            incremental_flattening: true,
        },
    )
    .unwrap();
    let intra: Vec<_> = kernels(&compiled.program.funs[0].body.stms)
        .into_iter()
        .filter(|k| k.space.level == SegLevel::Group)
        .collect();
    assert_eq!(intra.len(), 1);
    assert_eq!(intra[0].desc, "intra_group");
    assert!(compiled.sizes.keys().any(|name| name.contains("suff_intra_par")));

    let got = run_program(&compiled.program, "main", args, &intra_group_sizes(&compiled)).unwrap();
    assert_eq!(got, expected);
}

#[test]
fn test_map_of_loop_end_to_end() {
    let mut args = matrix_args();
    args.push(Value::i64(3));
    check_program(map_of_loop(), args);
}

#[test]
fn test_map_of_branch_end_to_end() {
    for c in [true, false] {
        let mut args = matrix_args();
        args.push(Value::bool(c));
        check_program(map_of_branch(), args);
    }
}

#[test]
fn test_top_level_soacs_end_to_end() {
    let xs: Vec<i64> = (0..23).map(|x| (x * 7) % 11 - 5).collect();
    let args = vec![Value::i64(23), Value::i64_array(&xs)];
    check_program(sum_of_squares(), args.clone());
    check_program(prefix_sums(), args.clone());
    check_program(stream_sum(), args);
}

#[test]
fn test_scatter_end_to_end() {
    let args = vec![
        Value::i64(4),
        Value::i64(5),
        Value::i64_array(&[0, 0, 0, 0, 0]),
        Value::i64_array(&[4, 7, 0, -2]),
        Value::i64_array(&[1, 2, 3, 4]),
    ];
    check_program(scatter_into(), args.clone());
    let compiled = compile(scatter_into(), &ExtractConfig::default()).unwrap();
    let res = run_main(&compiled.program, &args);
    assert_eq!(res, vec![Value::i64_array(&[3, 0, 0, 0, 1])]);
}

#[test]
fn test_with_loop_end_to_end() {
    let args = vec![Value::i64(3), Value::i64(5), Value::i64_array(&[1, 1, 1, 1, 1])];
    check_program(with_loop_into(), args.clone());
    let compiled = compile(with_loop_into(), &ExtractConfig::default()).unwrap();
    assert_eq!(run_main(&compiled.program, &args), vec![Value::i64_array(&[1, 10, 20, 30, 1])]);

    // The generator runs past the end of the destination.
    let args = vec![Value::i64(6), Value::i64(5), Value::i64_array(&[1, 1, 1, 1, 1])];
    check_program(with_loop_into(), args.clone());
    assert_eq!(run_main(&compiled.program, &args), vec![Value::i64_array(&[1, 10, 20, 30, 40])]);
}

#[test]
fn test_map_of_with_loop_end_to_end() {
    let program = map_of_with_loop();
    assert_eq!(
        run_main(&program, &matrix_args())[0].to_string(),
        "[[-7, 1, 4, -4, -3], [3, 1, 4, 6, 7], [13, 1, 4, 16, 17]]"
    );
    check_program(program, matrix_args());
}

#[test]
fn test_pipeline_stages_report_sizes_in_order() {
    let loaded = Compiler::load(map_of_map_and_reduce()).unwrap();
    let extracted = loaded
        .extract_kernels(&ExtractConfig {
            incremental_flattening: true,
        })
        .unwrap();
    assert!(!extracted.log.is_empty());
    let compiled = extracted.babysit().unwrap().verify().unwrap();
    let names: Vec<&String> = compiled.sizes.keys().collect();
    assert!(!names.is_empty());
    // Size names carry a program-wide counter as their suffix.
    let counters: Vec<usize> = names
        .iter()
        .map(|name| name.rsplit('_').next().unwrap().parse().unwrap())
        .collect();
    let mut sorted = counters.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), counters.len());
}

#[test]
fn test_unbabysat_program_gives_same_values() {
    let program = map_of_map_and_reduce();
    let args = matrix_args();
    let expected = run_main(&program, &args);
    let compiled = Compiler::load(program)
        .unwrap()
        .extract_kernels(&ExtractConfig::default())
        .unwrap()
        .skip_babysitting()
        .verify()
        .unwrap();
    assert_eq!(run_main(&compiled.program, &args), expected);
}

#[test]
fn test_load_rejects_malformed_programs() {
    let mut program = map_of_scan();
    // Drop the statement binding the result.
    program.funs[0].body.stms.clear();
    assert!(Compiler::load(program).is_err());
}
