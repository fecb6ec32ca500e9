//! Benchmark manifests and timed runs of `weft run`.
//!
//! A manifest names the program to tune and the datasets to run it on:
//!
//! ```json
//! {
//!   "program": "sum.json",
//!   "entry": "main",
//!   "datasets": [
//!     { "name": "small", "input": "small.json" },
//!     { "name": "huge", "input": "huge.json", "tags": ["notune"] }
//!   ]
//! }
//! ```

use anyhow::{Context, Result, bail};
use log::{debug, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Datasets carrying this tag are not part of the objective.
pub const EXCLUDE_TAG: &str = "notune";

#[derive(Debug, Deserialize)]
pub struct Manifest {
    /// SOAC-level program (JSON) to compile and run.
    pub program: PathBuf,
    /// Entry point name (defaults to "main").
    #[serde(default = "default_entry")]
    pub entry: String,
    pub datasets: Vec<Dataset>,
    /// Extra flags passed to every `weft run`, e.g. `--incremental-flattening`.
    #[serde(default)]
    pub compiler_flags: Vec<String>,
}

fn default_entry() -> String {
    "main".to_string()
}

#[derive(Debug, Deserialize)]
pub struct Dataset {
    pub name: String,
    /// Arguments as a JSON array.
    pub input: PathBuf,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Dataset {
    pub fn excluded(&self) -> bool {
        self.tags.iter().any(|t| t == EXCLUDE_TAG)
    }
}

impl Manifest {
    /// Load a manifest from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read manifest: {:?}", path))?;
        let mut manifest: Self =
            serde_json::from_str(&content).with_context(|| format!("Failed to parse manifest: {:?}", path))?;
        if let Some(parent) = path.parent() {
            manifest.resolve_paths(parent);
        }
        if manifest.datasets.iter().all(Dataset::excluded) {
            bail!("manifest {:?} has no dataset to tune on", path);
        }
        Ok(manifest)
    }

    /// Resolve relative paths in the manifest relative to its directory.
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        if self.program.is_relative() {
            self.program = base_dir.join(&self.program);
        }
        for ds in &mut self.datasets {
            if ds.input.is_relative() {
                ds.input = base_dir.join(&ds.input);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Ok,
    Error,
}

/// Outcome of benchmarking one configuration.
#[derive(Debug, Clone)]
pub struct BenchResult {
    pub state: RunState,
    /// Summed mean runtime in microseconds, infinite on failure.
    pub cost: f64,
}

impl BenchResult {
    fn failed() -> Self {
        BenchResult {
            state: RunState::Error,
            cost: f64::INFINITY,
        }
    }
}

/// Runs the compiled program through the `weft` driver.
pub struct Bench<'a> {
    pub weft: PathBuf,
    pub manifest: &'a Manifest,
    /// Runs per dataset.
    pub runs: usize,
}

impl Bench<'_> {
    fn weft_run(&self) -> Command {
        let mut cmd = Command::new(&self.weft);
        cmd.arg("run")
            .arg(&self.manifest.program)
            .arg("--entry")
            .arg(&self.manifest.entry)
            .args(&self.manifest.compiler_flags);
        cmd
    }

    /// The output of `weft run --print-sizes`.
    pub fn print_sizes(&self) -> Result<String> {
        let output = self
            .weft_run()
            .arg("--print-sizes")
            .output()
            .with_context(|| format!("Failed to run {:?}", self.weft))?;
        if !output.status.success() {
            bail!(
                "{:?} --print-sizes failed: {}",
                self.weft,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        String::from_utf8(output.stdout).context("size list is not UTF-8")
    }

    /// Benchmark every dataset not tagged `notune` with the given sizes and
    /// sum the mean runtimes.
    pub fn run(&self, sizes: &[(String, i64)]) -> Result<BenchResult> {
        let timing_dir = tempfile::tempdir().context("Failed to create timing directory")?;
        let mut total = 0.0;
        for ds in self.manifest.datasets.iter().filter(|ds| !ds.excluded()) {
            let timing = timing_dir.path().join(format!("{}.runtimes", ds.name));
            let mut cmd = self.weft_run();
            cmd.arg("--input-data")
                .arg(&ds.input)
                .arg("-t")
                .arg(&timing)
                .arg("-r")
                .arg(self.runs.to_string());
            for (name, value) in sizes {
                cmd.arg(format!("--size={name}={value}"));
            }
            let output = cmd
                .output()
                .with_context(|| format!("Failed to run {:?}", self.weft))?;
            if !output.status.success() {
                warn!(
                    "dataset {} failed with {}: {}",
                    ds.name,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                return Ok(BenchResult::failed());
            }
            let runtimes = match read_runtimes(&timing) {
                Ok(runtimes) => runtimes,
                Err(e) => {
                    warn!("dataset {}: {e:#}", ds.name);
                    return Ok(BenchResult::failed());
                }
            };
            let mean = runtimes.iter().sum::<f64>() / runtimes.len() as f64;
            debug!("dataset {}: {mean:.0}us", ds.name);
            total += mean;
        }
        Ok(BenchResult {
            state: RunState::Ok,
            cost: total,
        })
    }
}

/// Runtimes in microseconds, one per line.
pub fn read_runtimes(path: &Path) -> Result<Vec<f64>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read runtimes: {:?}", path))?;
    let runtimes = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Malformed runtimes in {:?}", path))?;
    if runtimes.is_empty() {
        bail!("no runtimes in {:?}", path);
    }
    Ok(runtimes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_manifest(dir: &Path, json: &str) -> PathBuf {
        let path = dir.join("bench.json");
        fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn test_manifest_paths_are_relative_to_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"{"program": "p.json", "datasets": [{"name": "a", "input": "a.json"}]}"#,
        );
        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.entry, "main");
        assert_eq!(manifest.program, dir.path().join("p.json"));
        assert_eq!(manifest.datasets[0].input, dir.path().join("a.json"));
    }

    #[test]
    fn test_manifest_needs_a_tunable_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"{"program": "p.json", "datasets": [{"name": "a", "input": "a.json", "tags": ["notune"]}]}"#,
        );
        assert!(Manifest::load(&path).is_err());
    }

    #[test]
    fn test_read_runtimes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t");
        fs::write(&path, "10\n20\n\n").unwrap();
        assert_eq!(read_runtimes(&path).unwrap(), vec![10.0, 20.0]);
        fs::write(&path, "").unwrap();
        assert!(read_runtimes(&path).is_err());
    }

    fn one_dataset_manifest() -> Manifest {
        Manifest {
            program: PathBuf::from("p.json"),
            entry: "main".to_string(),
            datasets: vec![Dataset {
                name: "a".to_string(),
                input: PathBuf::from("a.json"),
                tags: vec![],
            }],
            compiler_flags: vec![],
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_run_costs_infinity() {
        let manifest = one_dataset_manifest();
        let bench = Bench {
            weft: PathBuf::from("false"),
            manifest: &manifest,
            runs: 1,
        };
        let res = bench.run(&[("main.threshold_0".to_string(), 5)]).unwrap();
        assert_eq!(res.state, RunState::Error);
        assert!(res.cost.is_infinite());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_without_timing_file_costs_infinity() {
        // `true` exits successfully but never writes the timing file.
        let manifest = one_dataset_manifest();
        let bench = Bench {
            weft: PathBuf::from("true"),
            manifest: &manifest,
            runs: 1,
        };
        let res = bench.run(&[]).unwrap();
        assert_eq!(res.state, RunState::Error);
        assert!(res.cost.is_infinite());
    }
}
