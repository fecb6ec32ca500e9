//! Tunable parameters and random search over them.

use anyhow::{Context, Result, bail};
use log::{info, warn};
use rand::Rng;
use rand::rngs::SmallRng;
use std::fmt::Write as _;
use std::path::Path;

use crate::bench::{Bench, BenchResult, RunState};

/// Range of values tried for one size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    /// Powers of two in `[lo, hi]`.
    PowerOfTwo { lo: i64, hi: i64 },
    /// Every integer in `[lo, hi]`.
    Int { lo: i64, hi: i64 },
    /// Integers in `[lo, hi]`, sampled uniformly on a logarithmic scale.
    LogInt { lo: i64, hi: i64 },
}

impl Space {
    /// The range used for a size class as printed by `weft run --print-sizes`.
    pub fn for_class(class: &str) -> Option<Space> {
        match class {
            "group_size" | "num_groups" => Some(Space::PowerOfTwo { lo: 8, hi: 1024 }),
            "tile_size" => Some(Space::Int { lo: 1, hi: 32 }),
            "threshold" => Some(Space::LogInt { lo: 0, hi: 1_000_000 }),
            _ => None,
        }
    }

    pub fn sample(&self, rng: &mut impl Rng) -> i64 {
        match *self {
            Space::PowerOfTwo { lo, hi } => {
                let lo = 63 - lo.max(1).leading_zeros() as i64;
                let hi = 63 - hi.max(1).leading_zeros() as i64;
                1 << rng.gen_range(lo..=hi)
            }
            Space::Int { lo, hi } => rng.gen_range(lo..=hi),
            Space::LogInt { lo, hi } => {
                // Shift by one so that zero is reachable.
                let x = rng.gen_range(((lo + 1) as f64).ln()..=((hi + 1) as f64).ln());
                (x.exp().round() as i64 - 1).clamp(lo, hi)
            }
        }
    }

    pub fn contains(&self, v: i64) -> bool {
        match *self {
            Space::PowerOfTwo { lo, hi } => (lo..=hi).contains(&v) && v.count_ones() == 1,
            Space::Int { lo, hi } | Space::LogInt { lo, hi } => (lo..=hi).contains(&v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub class: String,
    pub space: Space,
}

/// Parse `name (class)` lines. Sizes of unknown classes are skipped with a
/// warning; other malformed lines are an error.
pub fn parse_sizes(output: &str) -> Result<Vec<Param>> {
    let mut params = vec![];
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((name, rest)) = line.split_once(" (") else {
            bail!("malformed size line: {line:?}");
        };
        let Some(class) = rest.strip_suffix(')') else {
            bail!("malformed size line: {line:?}");
        };
        match Space::for_class(class) {
            Some(space) => params.push(Param {
                name: name.to_string(),
                class: class.to_string(),
                space,
            }),
            None => warn!("ignoring size {name} of unknown class {class}"),
        }
    }
    Ok(params)
}

pub type Config = Vec<(String, i64)>;

pub struct Trial {
    pub config: Config,
    pub result: BenchResult,
}

/// Random search. The first trial uses the compiled-in defaults, so the best
/// configuration is never worse than not tuning at all.
pub struct Tuner<'a> {
    pub params: Vec<Param>,
    pub bench: Bench<'a>,
    pub rng: SmallRng,
}

impl Tuner<'_> {
    pub fn sample(&mut self) -> Config {
        let rng = &mut self.rng;
        self.params
            .iter()
            .map(|p| (p.name.clone(), p.space.sample(&mut *rng)))
            .collect()
    }

    /// Run `trials` configurations and return the best successful one.
    pub fn tune(&mut self, trials: usize) -> Result<Option<Trial>> {
        let mut best: Option<Trial> = None;
        for i in 0..trials {
            let config = if i == 0 { vec![] } else { self.sample() };
            let result = self.bench.run(&config)?;
            match result.state {
                RunState::Ok => info!("trial {i}: {:.0}us", result.cost),
                RunState::Error => info!("trial {i}: ERROR"),
            }
            if result.state == RunState::Ok && best.as_ref().is_none_or(|b| result.cost < b.result.cost) {
                best = Some(Trial { config, result });
            }
        }
        Ok(best)
    }
}

/// Write a configuration as `name=value` lines.
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    let mut content = String::new();
    for (name, value) in config {
        writeln!(content, "{name}={value}")?;
    }
    std::fs::write(path, content).with_context(|| format!("Failed to write configuration: {:?}", path))
}

/// The `weft run` command line reproducing a configuration.
pub fn reproduction_command(weft: &Path, program: &Path, config: &Config) -> String {
    let mut cmd = format!("{} run {}", weft.display(), program.display());
    for (name, value) in config {
        write!(cmd, " --size={name}={value}").ok();
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_sizes_register_with_their_ranges() {
        let params = parse_sizes("some_threshold (threshold)\nblock_x (group_size)\n").unwrap();
        assert_eq!(
            params,
            vec![
                Param {
                    name: "some_threshold".to_string(),
                    class: "threshold".to_string(),
                    space: Space::LogInt { lo: 0, hi: 1_000_000 },
                },
                Param {
                    name: "block_x".to_string(),
                    class: "group_size".to_string(),
                    space: Space::PowerOfTwo { lo: 8, hi: 1024 },
                },
            ]
        );
    }

    #[test]
    fn test_unknown_classes_are_skipped() {
        let params = parse_sizes("a (tile_size)\nb (bogus)\n").unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].space, Space::Int { lo: 1, hi: 32 });
        assert!(parse_sizes("no class here").is_err());
    }

    #[test]
    fn test_samples_stay_in_range() {
        let mut rng = SmallRng::seed_from_u64(7);
        for class in ["group_size", "num_groups", "tile_size", "threshold"] {
            let space = Space::for_class(class).unwrap();
            for _ in 0..1000 {
                let v = space.sample(&mut rng);
                assert!(space.contains(v), "{v} out of range for {class}");
            }
        }
    }

    #[test]
    fn test_saved_config_is_name_value_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best");
        let config = vec![("main.segmap_group_size_0".to_string(), 64), ("main.suff_outer_par_1".to_string(), 0)];
        save_config(&path, &config).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "main.segmap_group_size_0=64\nmain.suff_outer_par_1=0\n"
        );
        assert_eq!(
            reproduction_command(Path::new("weft"), Path::new("p.json"), &config),
            "weft run p.json --size=main.segmap_group_size_0=64 --size=main.suff_outer_par_1=0"
        );
    }
}
