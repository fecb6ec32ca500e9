mod values;

use clap::{Parser, Subcommand};
use log::info;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use weft_core::extract::ExtractConfig;
use weft_core::interp::{Interpreter, SizeTable};
use weft_core::ir::Program;
use weft_core::ir::pretty::pretty_program;
use weft_core::{Compiled, Compiler};

/// Times the execution of a closure and prints the elapsed time if verbose.
fn time<T, F: FnOnce() -> T>(name: &str, verbose: bool, f: F) -> T {
    let start = Instant::now();
    let result = f();
    if verbose {
        let elapsed = start.elapsed().as_millis();
        eprintln!("{}: {}ms", name, elapsed);
    }
    result
}

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Kernel extraction for data-parallel array programs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that compiles a program.
#[derive(clap::Args, Clone, Default)]
struct CompileOpts {
    /// Build several versions of maps with inner parallelism, selected at
    /// run time by threshold sizes (also enabled by WEFT_INCREMENTAL_FLATTENING)
    #[arg(long)]
    incremental_flattening: bool,

    /// Do not rewrite kernel inputs for coalesced access
    #[arg(long)]
    no_babysit: bool,

    /// Print verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract kernels from a SOAC-level program
    Extract {
        /// Input program (JSON)
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Output file (defaults to input name with .kernels.json extension)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Also write the extracted program in readable form
        #[arg(long, value_name = "FILE")]
        output_pretty: Option<PathBuf>,

        /// Print the decisions taken by extraction
        #[arg(long)]
        log: bool,

        #[command(flatten)]
        opts: CompileOpts,
    },

    /// List the tunable sizes of a program
    Sizes {
        /// Input program (JSON)
        #[arg(value_name = "FILE")]
        input: PathBuf,

        #[command(flatten)]
        opts: CompileOpts,
    },

    /// Compile a program and run it with the reference interpreter
    Run {
        /// Input program (JSON)
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Function to run
        #[arg(short, long, default_value = "main")]
        entry: String,

        /// Arguments as a JSON array (read from stdin if absent)
        #[arg(short, long, value_name = "FILE")]
        input_data: Option<PathBuf>,

        /// Set a tunable size
        #[arg(long = "size", value_name = "NAME=VALUE", value_parser = parse_size)]
        sizes: Vec<(String, i64)>,

        /// Print the tunable sizes as `name (class)` and exit
        #[arg(long)]
        print_sizes: bool,

        /// Write the runtime of every run in microseconds to this file
        #[arg(short = 't', long, value_name = "FILE")]
        timing: Option<PathBuf>,

        /// Number of runs
        #[arg(short, long, default_value_t = 1)]
        runs: usize,

        /// The program is already kernel-level; run it as is
        #[arg(long)]
        no_extract: bool,

        #[command(flatten)]
        opts: CompileOpts,
    },
}

fn parse_size(s: &str) -> Result<(String, i64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {s:?}"))?;
    let value = value
        .trim()
        .parse()
        .map_err(|e| format!("bad value for size {name}: {e}"))?;
    Ok((name.trim().to_string(), value))
}

#[derive(Debug, Error)]
enum DriverError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Compilation error: {0}")]
    CompilationError(#[from] weft_core::error::CompilerError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InputError(String),
}

fn main() -> Result<(), DriverError> {
    env_logger::init();
    let cli = Cli::parse();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Commands::Extract {
            input,
            output,
            output_pretty,
            log,
            opts,
        } => {
            extract_file(&input, output, output_pretty, log, &opts, &mut out)?;
        }
        Commands::Sizes { input, opts } => {
            let compiled = compile_file(&input, &opts)?;
            print_sizes(&compiled, &mut out)?;
        }
        Commands::Run {
            input,
            entry,
            input_data,
            sizes,
            print_sizes: only_sizes,
            timing,
            runs,
            no_extract,
            opts,
        } => {
            let compiled = if no_extract {
                Compiler::load_kernels(read_program(&input)?)?
            } else {
                compile_file(&input, &opts)?
            };
            if only_sizes {
                print_sizes(&compiled, &mut out)?;
                return Ok(());
            }
            let data = match input_data {
                Some(path) => fs::read_to_string(path)?,
                None => {
                    let mut s = String::new();
                    io::stdin().read_to_string(&mut s)?;
                    s
                }
            };
            let run = RunOpts {
                entry,
                sizes,
                timing,
                runs,
                verbose: opts.verbose,
            };
            run_compiled(&compiled, &data, &run, &mut out)?;
        }
    }

    Ok(())
}

fn read_program(input: &Path) -> Result<Program, DriverError> {
    let source = fs::read_to_string(input)?;
    Ok(serde_json::from_str(&source)?)
}

fn compile_file(input: &Path, opts: &CompileOpts) -> Result<Compiled, DriverError> {
    if opts.verbose {
        info!("Compiling {}...", input.display());
    }
    let program = time("read", opts.verbose, || read_program(input))?;
    compile_program(program, opts)
}

fn compile_program(program: Program, opts: &CompileOpts) -> Result<Compiled, DriverError> {
    let mut config = ExtractConfig::from_env();
    config.incremental_flattening |= opts.incremental_flattening;

    let verbose = opts.verbose;
    let loaded = time("load", verbose, || Compiler::load(program))?;
    let extracted = time("extract_kernels", verbose, || loaded.extract_kernels(&config))?;
    let babysat = if opts.no_babysit {
        extracted.skip_babysitting()
    } else {
        time("babysit", verbose, || extracted.babysit())?
    };
    let compiled = time("verify", verbose, || babysat.verify())?;
    Ok(compiled)
}

fn extract_file(
    input: &Path,
    output: Option<PathBuf>,
    output_pretty: Option<PathBuf>,
    log: bool,
    opts: &CompileOpts,
    out: &mut impl Write,
) -> Result<(), DriverError> {
    let program = read_program(input)?;
    let mut config = ExtractConfig::from_env();
    config.incremental_flattening |= opts.incremental_flattening;

    let extracted = Compiler::load(program)?.extract_kernels(&config)?;
    if log {
        for line in &extracted.log {
            writeln!(out, "{line}")?;
        }
    }
    let babysat = if opts.no_babysit {
        extracted.skip_babysitting()
    } else {
        extracted.babysit()?
    };
    let compiled = babysat.verify()?;

    let output_path = output.unwrap_or_else(|| input.with_extension("kernels.json"));
    fs::write(&output_path, serde_json::to_string_pretty(&compiled.program)?)?;
    if let Some(ref pretty_path) = output_pretty {
        fs::write(pretty_path, pretty_program(&compiled.program))?;
    }
    if opts.verbose {
        info!("Wrote {} to {}", input.display(), output_path.display());
        info!("Declared {} tunable sizes", compiled.sizes.len());
    }
    Ok(())
}

fn print_sizes(compiled: &Compiled, out: &mut impl Write) -> Result<(), DriverError> {
    for (name, class) in &compiled.sizes {
        writeln!(out, "{name} ({class})")?;
    }
    Ok(())
}

struct RunOpts {
    entry: String,
    sizes: Vec<(String, i64)>,
    timing: Option<PathBuf>,
    runs: usize,
    verbose: bool,
}

/// Run the entry point `opts.runs` times and print the results of the last
/// run, one JSON value per line.
fn run_compiled(compiled: &Compiled, data: &str, opts: &RunOpts, out: &mut impl Write) -> Result<(), DriverError> {
    let mut table = SizeTable::new();
    for (name, value) in &opts.sizes {
        if !compiled.sizes.contains_key(name) {
            return Err(DriverError::InputError(format!("unknown size {name}")));
        }
        table.set(name.clone(), *value);
    }

    let fun = compiled
        .program
        .fun(&opts.entry)
        .ok_or_else(|| DriverError::InputError(format!("no function named {}", opts.entry)))?;
    let tys: Vec<_> = fun.params.iter().map(|p| p.ty.clone()).collect();
    let args = values::args_from_json(&tys, &serde_json::from_str(data)?)?;

    let interp = Interpreter::new(&compiled.program, &table);
    let mut runtimes = vec![];
    let mut results = vec![];
    for _ in 0..opts.runs.max(1) {
        let start = Instant::now();
        results = interp.run(&opts.entry, args.clone())?;
        runtimes.push(start.elapsed().as_micros());
    }
    if opts.verbose {
        info!("{} runs, fastest {}us", runtimes.len(), runtimes.iter().min().copied().unwrap_or(0));
    }
    if let Some(ref path) = opts.timing {
        let lines: Vec<String> = runtimes.iter().map(|t| t.to_string()).collect();
        fs::write(path, lines.join("\n") + "\n")?;
    }
    for v in &results {
        writeln!(out, "{}", values::value_to_json(v))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::ir::builder::IrBuilder;
    use weft_core::ir::{BinOp, Body, Exp, ExtType, FunDef, Lambda, Map, Op, PrimType, Soac, SubExp, Type};

    /// `main n xs = map (\x -> x * 3) xs`
    fn triple_program() -> Program {
        let mut b = IrBuilder::new();
        let n = b.param("n", Type::i64());
        let xs_ty = Type::array(PrimType::I64, vec![SubExp::Var(n.var)]);
        let xs = b.param("xs", xs_ty.clone());
        let x = b.param("x", Type::i64());
        let mut inner = vec![];
        let y = b
            .bind_se(&mut inner, "y", Exp::BinOp(BinOp::Mul, SubExp::Var(x.var), SubExp::i64(3)))
            .unwrap();
        let lam = Lambda {
            params: vec![x],
            body: Body::new(inner, vec![y]),
            ret: vec![Type::i64()],
        };
        let mut stms = vec![];
        let ys = b
            .bind(
                &mut stms,
                "ys",
                Exp::Op(Op::Soac(Soac::Map(Map {
                    w: SubExp::Var(n.var),
                    lam,
                    arrs: vec![xs.var],
                }))),
            )
            .unwrap();
        Program {
            funs: vec![FunDef {
                name: "main".to_string(),
                params: vec![n, xs],
                ret: vec![ExtType::from(xs_ty)],
                body: Body::new(stms, vec![SubExp::Var(ys)]),
            }],
        }
    }

    fn write_program(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("triple.json");
        fs::write(&path, serde_json::to_string(&triple_program()).unwrap()).unwrap();
        path
    }

    fn run_opts(runs: usize, timing: Option<PathBuf>) -> RunOpts {
        RunOpts {
            entry: "main".to_string(),
            sizes: vec![],
            timing,
            runs,
            verbose: false,
        }
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("main.segmap_group_size_0=64"), Ok(("main.segmap_group_size_0".to_string(), 64)));
        assert!(parse_size("main.segmap_group_size_0").is_err());
        assert!(parse_size("x=big").is_err());
    }

    #[test]
    fn test_run_prints_results_and_timings() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_program(&dir);
        let compiled = compile_file(&input, &CompileOpts::default()).unwrap();

        let timing = dir.path().join("runtimes");
        let mut out = vec![];
        run_compiled(&compiled, "[4, [1, 2, 3, -4]]", &run_opts(3, Some(timing.clone())), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "[3,6,9,-12]\n");

        let runtimes = fs::read_to_string(timing).unwrap();
        assert_eq!(runtimes.lines().count(), 3);
        assert!(runtimes.lines().all(|l| l.parse::<u128>().is_ok()));
    }

    #[test]
    fn test_sizes_are_printed_with_their_class() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_program(&dir);
        let compiled = compile_file(&input, &CompileOpts::default()).unwrap();
        let mut out = vec![];
        print_sizes(&compiled, &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(!out.is_empty());
        assert!(out.lines().all(|l| l.starts_with("main.") && l.ends_with(')')));
        assert!(out.lines().any(|l| l.ends_with("(group_size)")));
    }

    #[test]
    fn test_unknown_sizes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_program(&dir);
        let compiled = compile_file(&input, &CompileOpts::default()).unwrap();
        let mut opts = run_opts(1, None);
        opts.sizes.push(("no_such_size".to_string(), 1));
        let err = run_compiled(&compiled, "[0, []]", &opts, &mut Vec::<u8>::new()).unwrap_err();
        assert!(matches!(err, DriverError::InputError(_)));
    }

    #[test]
    fn test_extract_writes_kernel_program() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_program(&dir);
        let output = dir.path().join("out.json");
        let pretty = dir.path().join("out.txt");
        let mut log = Vec::<u8>::new();
        extract_file(
            &input,
            Some(output.clone()),
            Some(pretty.clone()),
            true,
            &CompileOpts::default(),
            &mut log,
        )
        .unwrap();

        let program: Program = serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
        let kernel_level = Compiler::load_kernels(program).unwrap();
        assert!(!kernel_level.sizes.is_empty());
        assert!(!fs::read_to_string(pretty).unwrap().is_empty());
    }
}
