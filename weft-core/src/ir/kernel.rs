//! Kernel-level operations.
//!
//! A kernel is the only parallel primitive after extraction. It runs its body
//! once per point of a (possibly multi-dimensional) index space, either one
//! thread per point (`SegLevel::Thread`) or one workgroup per point
//! (`SegLevel::Group`). Group-level kernel bodies may use group-collective
//! operations (`GroupOp`) at their top level; everything else inside a kernel
//! is sequential code.

use serde::{Deserialize, Serialize};

use super::{Map, Param, Reduce, Scan, Stm, Stream, SubExp, Type, VarId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegLevel {
    Thread,
    Group,
}

/// The index space of a kernel.
///
/// `dims` are the logical indices, outermost first; a flat kernel has a single
/// dimension indexed by `global_tid`. For thread-level kernels `global_tid`
/// is the row-major flattening of `dims`; for group-level kernels it is the
/// flattened group index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpace {
    pub level: SegLevel,
    pub global_tid: VarId,
    pub group_size: SubExp,
    pub num_groups: SubExp,
    pub dims: Vec<(VarId, SubExp)>,
}

impl KernelSpace {
    pub fn is_flat(&self) -> bool {
        self.dims.len() == 1 && self.dims[0].0 == self.global_tid
    }

    pub fn gtids(&self) -> Vec<VarId> {
        self.dims.iter().map(|(v, _)| *v).collect()
    }

    pub fn widths(&self) -> Vec<SubExp> {
        self.dims.iter().map(|(_, w)| w.clone()).collect()
    }
}

/// An array read bound before the body runs: `param = arr[indices]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelInput {
    pub param: Param,
    pub arr: VarId,
    pub indices: Vec<SubExp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelResult {
    /// One value per point of the space; the kernel returns an array of
    /// shape `dims ++ shape(value)`.
    Threads(SubExp),
    /// Every point writes `value` at `index` of (a copy of) `dest`; writes
    /// outside `[0, dest_w)` are ignored. The kernel returns the updated
    /// destination.
    Write {
        dest_w: SubExp,
        dest: VarId,
        index: SubExp,
        value: SubExp,
    },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KernelBody {
    pub stms: Vec<Stm>,
    pub results: Vec<KernelResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    /// Human-readable purpose, e.g. `segmap`, `chunked_red`.
    pub desc: String,
    pub space: KernelSpace,
    pub inputs: Vec<KernelInput>,
    pub body: KernelBody,
    /// Per-point result types, one per `KernelResult`.
    pub ret: Vec<Type>,
}

/// A group-collective operation with the same value as the corresponding
/// SOAC. Only valid at the top level of a group-level kernel body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupOp {
    Map(Map),
    Reduce(Reduce),
    Scan(Scan),
    Stream(Stream),
}

impl GroupOp {
    pub fn name(&self) -> &'static str {
        match self {
            GroupOp::Map(_) => "group_map",
            GroupOp::Reduce(_) => "group_reduce",
            GroupOp::Scan(_) => "group_scan",
            GroupOp::Stream(_) => "group_stream",
        }
    }
}

/// The class of a tunable runtime size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    GroupSize,
    NumGroups,
    TileSize,
    Threshold,
}

impl SizeClass {
    /// Value used when the size is not configured at run time.
    pub fn default_value(self) -> i64 {
        match self {
            SizeClass::GroupSize => 256,
            SizeClass::NumGroups => 128,
            SizeClass::TileSize => 16,
            SizeClass::Threshold => 32768,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SizeClass::GroupSize => "group_size",
            SizeClass::NumGroups => "num_groups",
            SizeClass::TileSize => "tile_size",
            SizeClass::Threshold => "threshold",
        }
    }
}

impl std::fmt::Display for SizeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SizeClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "group_size" => Ok(SizeClass::GroupSize),
            "num_groups" => Ok(SizeClass::NumGroups),
            "tile_size" => Ok(SizeClass::TileSize),
            "threshold" => Ok(SizeClass::Threshold),
            other => Err(format!("unknown size class '{other}'")),
        }
    }
}

/// Runtime size queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeOp {
    /// The configured value of a named size, as `i64`.
    GetSize { name: String, class: SizeClass },
    /// Whether the configured value of a named size is at most `x`.
    CmpSizeLe {
        name: String,
        class: SizeClass,
        x: SubExp,
    },
}
