//! The weft IR.
//!
//! A typed, A-normal-form IR shared by both levels of the middle-end. A
//! function body is an ordered list of let-statements followed by a result.
//! Parallelism lives in a closed `Op` type:
//!
//! - before kernel extraction, operations are SOACs (`Op::Soac`): map,
//!   reduce, scan, redomap, scanomap, stream and scatter, each carrying
//!   lambdas whose bodies may again contain SOACs;
//! - after kernel extraction, the only parallel primitive is `Op::Kernel`,
//!   with group-collective operations (`Op::Group`) allowed directly in the
//!   body of group-level kernels, plus the runtime size queries `Op::Size`
//!   used for multi-versioning.
//!
//! Key properties:
//! - VarIds are unique within a function (SSA-like)
//! - Patterns put context elements (existential sizes) before value elements
//! - Every array type has an explicit shape

pub mod builder;
pub mod free;
pub mod kernel;
pub mod pretty;
pub mod rename;
pub mod types;

use serde::{Deserialize, Serialize};

pub use kernel::{
    GroupOp, Kernel, KernelBody, KernelInput, KernelResult, KernelSpace, SegLevel, SizeClass, SizeOp,
};
pub use types::{Commutativity, ExtSize, ExtType, PrimType, PrimValue, Shape, SubExp, Type};

// =============================================================================
// Names
// =============================================================================

/// Unique identifier for a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VarId(pub u32);

impl From<u32> for VarId {
    fn from(id: u32) -> Self {
        VarId(id)
    }
}

impl std::fmt::Display for VarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// =============================================================================
// Program Structure
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub funs: Vec<FunDef>,
}

impl Program {
    pub fn fun(&self, name: &str) -> Option<&FunDef> {
        self.funs.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunDef {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Vec<ExtType>,
    pub body: Body,
}

/// A bound name of a function, lambda, loop or kernel input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub var: VarId,
    pub name_hint: String,
    pub ty: Type,
}

/// One bound name of a statement's pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatElem {
    pub var: VarId,
    pub name_hint: String,
    pub ty: Type,
}

impl From<&PatElem> for Param {
    fn from(pe: &PatElem) -> Self {
        Param {
            var: pe.var,
            name_hint: pe.name_hint.clone(),
            ty: pe.ty.clone(),
        }
    }
}

impl From<&Param> for PatElem {
    fn from(p: &Param) -> Self {
        PatElem {
            var: p.var,
            name_hint: p.name_hint.clone(),
            ty: p.ty.clone(),
        }
    }
}

/// A binding pattern.
///
/// `ctx` binds the existential sizes of the value types, in the order of
/// their `ExtSize::Ext` indices. Expressions that yield a context (branches,
/// calls) produce context values first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Pat {
    pub ctx: Vec<PatElem>,
    pub vals: Vec<PatElem>,
}

impl Pat {
    pub fn new(vals: Vec<PatElem>) -> Self {
        Pat { ctx: vec![], vals }
    }

    /// All bound names, context first.
    pub fn names(&self) -> impl Iterator<Item = VarId> + '_ {
        self.ctx.iter().chain(self.vals.iter()).map(|pe| pe.var)
    }

    pub fn elems(&self) -> impl Iterator<Item = &PatElem> + '_ {
        self.ctx.iter().chain(self.vals.iter())
    }

    pub fn val_names(&self) -> Vec<VarId> {
        self.vals.iter().map(|pe| pe.var).collect()
    }

    pub fn val_types(&self) -> Vec<Type> {
        self.vals.iter().map(|pe| pe.ty.clone()).collect()
    }

    pub fn results(&self) -> Vec<SubExp> {
        self.vals.iter().map(|pe| SubExp::Var(pe.var)).collect()
    }
}

/// Certificates: names witnessing that bounds checks of the statement hold.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Certs(pub Vec<VarId>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stm {
    pub pat: Pat,
    #[serde(default)]
    pub certs: Certs,
    pub exp: Exp,
}

impl Stm {
    pub fn new(pat: Pat, exp: Exp) -> Self {
        Stm {
            pat,
            certs: Certs::default(),
            exp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Body {
    pub stms: Vec<Stm>,
    pub result: Vec<SubExp>,
}

impl Body {
    pub fn new(stms: Vec<Stm>, result: Vec<SubExp>) -> Self {
        Body { stms, result }
    }
}

/// An anonymous function argument of a SOAC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lambda {
    pub params: Vec<Param>,
    pub body: Body,
    pub ret: Vec<Type>,
}

// =============================================================================
// Expressions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    /// Integer division rounds towards negative infinity.
    Div,
    Mod,
    Min,
    Max,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnOp {
    Not,
    Neg,
    Abs,
}

/// One dimension of an index expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimIndex {
    Fix(SubExp),
    Slice { start: SubExp, len: SubExp, stride: SubExp },
}

impl DimIndex {
    /// The slice covering a whole dimension of size `n`.
    pub fn full(n: SubExp) -> Self {
        DimIndex::Slice {
            start: SubExp::i64(0),
            len: n,
            stride: SubExp::i64(1),
        }
    }

    pub fn fixed(&self) -> Option<&SubExp> {
        match self {
            DimIndex::Fix(i) => Some(i),
            DimIndex::Slice { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopForm {
    /// `for i < bound`.
    For { i: VarId, bound: SubExp },
    /// Iterate while the named boolean merge parameter is true.
    While { cond: VarId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exp {
    SubExp(SubExp),
    BinOp(BinOp, SubExp, SubExp),
    CmpOp(CmpOp, SubExp, SubExp),
    UnOp(UnOp, SubExp),
    Convert(PrimType, SubExp),

    /// Index or slice an array. Dimensions beyond the slice are kept whole.
    Index { arr: VarId, slice: Vec<DimIndex> },
    /// A copy of `arr` with the sliced region replaced by `value`.
    Update {
        arr: VarId,
        slice: Vec<DimIndex>,
        value: SubExp,
    },
    /// `[0, 1, .., n-1]` of type `[n]i64`.
    Iota { n: SubExp },
    Replicate { shape: Shape, value: SubExp },
    /// An array with unspecified contents.
    Scratch { elem: PrimType, shape: Shape },
    Rearrange { perm: Vec<usize>, arr: VarId },
    Reshape { shape: Shape, arr: VarId },
    /// Logically the identity. Asks for `arr` to be stored in memory with
    /// dimension order `perm`.
    Manifest { perm: Vec<usize>, arr: VarId },
    Copy(VarId),
    /// Concatenation along `dim`; `w` is the size of that dimension in the
    /// result.
    Concat { dim: usize, arrs: Vec<VarId>, w: SubExp },

    If {
        cond: SubExp,
        then_body: Body,
        else_body: Body,
        ret: Vec<ExtType>,
    },
    Loop {
        merge: Vec<(Param, SubExp)>,
        form: LoopForm,
        body: Body,
    },
    Apply {
        fun: String,
        args: Vec<SubExp>,
        ret: Vec<ExtType>,
    },
    Op(Op),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Soac(Soac),
    Kernel(Box<Kernel>),
    Group(GroupOp),
    Size(SizeOp),
}

// =============================================================================
// SOACs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Map {
    pub w: SubExp,
    pub lam: Lambda,
    pub arrs: Vec<VarId>,
}

/// `lam` takes accumulators then elements, and returns accumulators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reduce {
    pub w: SubExp,
    pub comm: Commutativity,
    pub lam: Lambda,
    pub nes: Vec<SubExp>,
    pub arrs: Vec<VarId>,
}

/// Inclusive scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    pub w: SubExp,
    pub lam: Lambda,
    pub nes: Vec<SubExp>,
    pub arrs: Vec<VarId>,
}

/// A map fused with a reduction. `map_lam` turns one element of each input
/// into `nes.len()` values to reduce followed by any number of per-element
/// outputs. Results are the reductions followed by the map outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redomap {
    pub w: SubExp,
    pub comm: Commutativity,
    pub red_lam: Lambda,
    pub map_lam: Lambda,
    pub nes: Vec<SubExp>,
    pub arrs: Vec<VarId>,
}

/// A map fused with an inclusive scan; results are the scanned arrays
/// followed by the map outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scanomap {
    pub w: SubExp,
    pub scan_lam: Lambda,
    pub map_lam: Lambda,
    pub nes: Vec<SubExp>,
    pub arrs: Vec<VarId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamOrd {
    InOrder,
    Disorder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamForm {
    Sequential,
    /// Chunks may be processed in parallel; per-chunk accumulators are
    /// combined with `red_lam`, for which the initial accumulators must be
    /// neutral.
    Parallel {
        order: StreamOrd,
        comm: Commutativity,
        red_lam: Lambda,
    },
}

/// `lam` takes the chunk size, the accumulators and one chunk of every
/// input array, and returns the new accumulators followed by per-chunk
/// outputs (arrays of chunk size). Results are the final accumulators
/// followed by the concatenated outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub w: SubExp,
    pub form: StreamForm,
    pub lam: Lambda,
    pub accs: Vec<SubExp>,
    pub arrs: Vec<VarId>,
}

/// `lam` returns one index per destination followed by one value per
/// destination. Out-of-bounds writes are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scatter {
    pub w: SubExp,
    pub lam: Lambda,
    pub arrs: Vec<VarId>,
    /// Destination arrays with their outer size.
    pub dests: Vec<(SubExp, VarId)>,
}

/// Generator-driven update: `lam` takes an index `i` in
/// `[offset, offset + w)` and returns one row per destination. Results are
/// the destinations with row `i` replaced; rows outside the generator keep
/// their values and out-of-bounds indices are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithLoop {
    pub w: SubExp,
    pub offset: SubExp,
    pub lam: Lambda,
    /// Destination arrays with their outer size.
    pub dests: Vec<(SubExp, VarId)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Soac {
    Map(Map),
    Reduce(Reduce),
    Scan(Scan),
    Redomap(Redomap),
    Scanomap(Scanomap),
    Stream(Stream),
    Scatter(Scatter),
    WithLoop(WithLoop),
}

impl Soac {
    pub fn width(&self) -> &SubExp {
        match self {
            Soac::Map(m) => &m.w,
            Soac::Reduce(r) => &r.w,
            Soac::Scan(s) => &s.w,
            Soac::Redomap(r) => &r.w,
            Soac::Scanomap(s) => &s.w,
            Soac::Stream(s) => &s.w,
            Soac::Scatter(s) => &s.w,
            Soac::WithLoop(wl) => &wl.w,
        }
    }

    pub fn lambdas(&self) -> Vec<&Lambda> {
        match self {
            Soac::Map(m) => vec![&m.lam],
            Soac::Reduce(r) => vec![&r.lam],
            Soac::Scan(s) => vec![&s.lam],
            Soac::Redomap(r) => vec![&r.red_lam, &r.map_lam],
            Soac::Scanomap(s) => vec![&s.scan_lam, &s.map_lam],
            Soac::Stream(s) => match &s.form {
                StreamForm::Sequential => vec![&s.lam],
                StreamForm::Parallel { red_lam, .. } => vec![&s.lam, red_lam],
            },
            Soac::Scatter(s) => vec![&s.lam],
            Soac::WithLoop(wl) => vec![&wl.lam],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Soac::Map(_) => "map",
            Soac::Reduce(_) => "reduce",
            Soac::Scan(_) => "scan",
            Soac::Redomap(_) => "redomap",
            Soac::Scanomap(_) => "scanomap",
            Soac::Stream(_) => "stream",
            Soac::Scatter(_) => "scatter",
            Soac::WithLoop(_) => "with_loop",
        }
    }
}

// =============================================================================
// Queries
// =============================================================================

/// Whether a body contains any SOAC, at any depth.
pub fn body_has_soacs(body: &Body) -> bool {
    body.stms.iter().any(stm_has_soacs)
}

pub fn stm_has_soacs(stm: &Stm) -> bool {
    match &stm.exp {
        Exp::Op(Op::Soac(_)) => true,
        Exp::If {
            then_body,
            else_body,
            ..
        } => body_has_soacs(then_body) || body_has_soacs(else_body),
        Exp::Loop { body, .. } => body_has_soacs(body),
        _ => false,
    }
}

/// Whether a lambda contains parallelism worth distributing.
pub fn lambda_has_soacs(lam: &Lambda) -> bool {
    body_has_soacs(&lam.body)
}
