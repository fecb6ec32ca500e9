//! Reference interpreter for both IR levels.
//!
//! SOACs are evaluated sequentially, kernels point by point in row-major
//! order of their index space, and group operations with the semantics of
//! the SOAC they stand for. Tunable sizes are read from a `SizeTable`,
//! falling back to the defaults of their class. The interpreter exists to
//! check that transformations preserve values; it makes no attempt at speed.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use log::trace;

use crate::error::Result;
use crate::ir::builder::group_as_soac;
use crate::ir::{
    BinOp, Body, CmpOp, DimIndex, Exp, FunDef, Kernel, KernelResult, Lambda, LoopForm, Op, PrimType, PrimValue,
    Program, SizeClass, SizeOp, Soac, Stm, SubExp, Type, UnOp, VarId,
};
use crate::{bail_eval, err_eval};

// =============================================================================
// Values
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    pub elem: PrimType,
    pub shape: Vec<usize>,
    pub data: Rc<Vec<PrimValue>>,
}

impl ArrayValue {
    pub fn new(elem: PrimType, shape: Vec<usize>, data: Vec<PrimValue>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if shape.is_empty() || expected != data.len() {
            bail_eval!("array of shape {:?} cannot hold {} elements", shape, data.len());
        }
        Ok(ArrayValue {
            elem,
            shape,
            data: Rc::new(data),
        })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn row_size(&self) -> usize {
        self.shape[1..].iter().product()
    }

    pub fn row(&self, i: usize) -> Result<Value> {
        if i >= self.len() {
            bail_eval!("row {i} out of bounds for array of {} rows", self.len());
        }
        if self.shape.len() == 1 {
            return Ok(Value::Prim(self.data[i]));
        }
        let n = self.row_size();
        Ok(Value::Array(ArrayValue {
            elem: self.elem,
            shape: self.shape[1..].to_vec(),
            data: Rc::new(self.data[i * n..(i + 1) * n].to_vec()),
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Prim(PrimValue),
    Array(ArrayValue),
}

impl Value {
    pub fn i64(n: i64) -> Self {
        Value::Prim(PrimValue::I64(n))
    }

    pub fn bool(b: bool) -> Self {
        Value::Prim(PrimValue::Bool(b))
    }

    /// A one-dimensional `i64` array.
    pub fn i64_array(xs: &[i64]) -> Self {
        Value::Array(ArrayValue {
            elem: PrimType::I64,
            shape: vec![xs.len()],
            data: Rc::new(xs.iter().map(|x| PrimValue::I64(*x)).collect()),
        })
    }

    pub fn as_prim(&self) -> Result<PrimValue> {
        match self {
            Value::Prim(p) => Ok(*p),
            Value::Array(_) => Err(err_eval!("expected a scalar, got an array")),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        self.as_prim()?
            .as_i64()
            .ok_or_else(|| err_eval!("expected an integer"))
    }

    pub fn as_bool(&self) -> Result<bool> {
        self.as_prim()?.as_bool().ok_or_else(|| err_eval!("expected a boolean"))
    }

    pub fn as_array(&self) -> Result<&ArrayValue> {
        match self {
            Value::Array(a) => Ok(a),
            Value::Prim(_) => Err(err_eval!("expected an array, got a scalar")),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Value::Prim(_) => &[],
            Value::Array(a) => &a.shape,
        }
    }

    fn push_flat(&self, out: &mut Vec<PrimValue>) {
        match self {
            Value::Prim(p) => out.push(*p),
            Value::Array(a) => out.extend(a.data.iter().copied()),
        }
    }

    /// Row-major elements.
    pub fn flat(&self) -> Vec<PrimValue> {
        let mut out = vec![];
        self.push_flat(&mut out);
        out
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn go(f: &mut fmt::Formatter<'_>, shape: &[usize], data: &[PrimValue]) -> fmt::Result {
            let Some((&n, rest)) = shape.split_first() else {
                return write!(f, "{}", data[0]);
            };
            let size: usize = rest.iter().product();
            write!(f, "[")?;
            for i in 0..n {
                if i > 0 {
                    write!(f, ", ")?;
                }
                go(f, rest, &data[i * size..(i + 1) * size])?;
            }
            write!(f, "]")
        }
        match self {
            Value::Prim(p) => write!(f, "{p}"),
            Value::Array(a) => go(f, &a.shape, &a.data),
        }
    }
}

// =============================================================================
// Sizes
// =============================================================================

/// Configured values of tunable sizes.
#[derive(Debug, Clone, Default)]
pub struct SizeTable {
    values: HashMap<String, i64>,
}

impl SizeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: i64) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str, class: SizeClass) -> i64 {
        self.values.get(name).copied().unwrap_or_else(|| class.default_value())
    }

    /// Set every size of `class` to `value`.
    pub fn set_class<'a>(&mut self, sizes: impl IntoIterator<Item = (&'a String, &'a SizeClass)>, class: SizeClass, value: i64) {
        for (name, c) in sizes {
            if *c == class {
                self.set(name.clone(), value);
            }
        }
    }
}

// =============================================================================
// Array primitives
// =============================================================================

enum Sel {
    Fix(i64),
    Range { start: i64, len: usize, stride: i64 },
}

fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for k in (0..shape.len().saturating_sub(1)).rev() {
        strides[k] = strides[k + 1] * shape[k + 1];
    }
    strides
}

/// Call `f` with every index of `shape` in row-major order.
fn for_each_index(shape: &[usize], mut f: impl FnMut(&[usize]) -> Result<()>) -> Result<()> {
    if shape.contains(&0) {
        return Ok(());
    }
    let mut idx = vec![0; shape.len()];
    loop {
        f(&idx)?;
        let mut k = shape.len();
        loop {
            if k == 0 {
                return Ok(());
            }
            k -= 1;
            idx[k] += 1;
            if idx[k] < shape[k] {
                break;
            }
            idx[k] = 0;
        }
    }
}

/// The source offset of every element selected by `sels`, in row-major
/// order of the result, together with the result shape.
fn selection(arr: &ArrayValue, sels: &[Sel]) -> Result<(Vec<usize>, Vec<usize>)> {
    let rank = arr.shape.len();
    if sels.len() > rank {
        bail_eval!("{} indices into an array of rank {rank}", sels.len());
    }
    let mut out_shape = vec![];
    for sel in sels {
        if let Sel::Range { len, .. } = sel {
            out_shape.push(*len);
        }
    }
    out_shape.extend(&arr.shape[sels.len()..]);
    let src_strides = strides(&arr.shape);
    let mut offsets = vec![];
    for_each_index(&out_shape, |oi| {
        let mut off = 0;
        let mut o = 0;
        for k in 0..rank {
            let i = match sels.get(k) {
                Some(Sel::Fix(i)) => *i,
                Some(Sel::Range { start, stride, .. }) => {
                    o += 1;
                    start + stride * oi[o - 1] as i64
                }
                None => {
                    o += 1;
                    oi[o - 1] as i64
                }
            };
            if i < 0 || i as usize >= arr.shape[k] {
                bail_eval!("index {i} out of bounds for dimension {k} of size {}", arr.shape[k]);
            }
            off += i as usize * src_strides[k];
        }
        offsets.push(off);
        Ok(())
    })?;
    Ok((offsets, out_shape))
}

fn index_array(arr: &ArrayValue, sels: &[Sel]) -> Result<Value> {
    let (offsets, shape) = selection(arr, sels)?;
    let data: Vec<PrimValue> = offsets.iter().map(|&o| arr.data[o]).collect();
    if shape.is_empty() {
        return Ok(Value::Prim(data[0]));
    }
    Ok(Value::Array(ArrayValue {
        elem: arr.elem,
        shape,
        data: Rc::new(data),
    }))
}

fn update_array(arr: &ArrayValue, sels: &[Sel], value: &Value) -> Result<ArrayValue> {
    let (offsets, shape) = selection(arr, sels)?;
    if shape != value.shape() {
        bail_eval!("update of a {:?} region with a value of shape {:?}", shape, value.shape());
    }
    let mut out = arr.clone();
    let data = Rc::make_mut(&mut out.data);
    for (o, v) in offsets.into_iter().zip(value.flat()) {
        data[o] = v;
    }
    Ok(out)
}

fn write_row(arr: &mut ArrayValue, i: usize, value: &Value) -> Result<()> {
    let n = arr.row_size();
    let flat = value.flat();
    if flat.len() != n {
        bail_eval!("writing a row of {} elements into rows of {n}", flat.len());
    }
    let data = Rc::make_mut(&mut arr.data);
    data[i * n..(i + 1) * n].copy_from_slice(&flat);
    Ok(())
}

fn rearrange(arr: &ArrayValue, perm: &[usize]) -> Result<ArrayValue> {
    if perm.len() != arr.shape.len() {
        bail_eval!("permutation {:?} of an array of rank {}", perm, arr.shape.len());
    }
    let shape: Vec<usize> = perm.iter().map(|&p| arr.shape[p]).collect();
    let src_strides = strides(&arr.shape);
    let mut data = Vec::with_capacity(arr.data.len());
    for_each_index(&shape, |oi| {
        let off: usize = oi.iter().zip(perm).map(|(i, &p)| i * src_strides[p]).sum();
        data.push(arr.data[off]);
        Ok(())
    })?;
    ArrayValue::new(arr.elem, shape, data)
}

fn concat(arrs: &[&ArrayValue], dim: usize) -> Result<ArrayValue> {
    let Some(first) = arrs.first() else {
        bail_eval!("concatenation of no arrays");
    };
    let mut shape = first.shape.clone();
    if dim >= shape.len() {
        bail_eval!("concatenation along dimension {dim} of rank {} arrays", shape.len());
    }
    shape[dim] = arrs.iter().map(|a| a.shape[dim]).sum();
    let mut data = Vec::with_capacity(shape.iter().product());
    for_each_index(&shape, |oi| {
        let mut i = oi[dim];
        for a in arrs {
            if i < a.shape[dim] {
                let mut src = oi.to_vec();
                src[dim] = i;
                let off: usize = src.iter().zip(strides(&a.shape)).map(|(i, s)| i * s).sum();
                data.push(a.data[off]);
                return Ok(());
            }
            i -= a.shape[dim];
        }
        Err(err_eval!("concatenation index out of bounds"))
    })?;
    ArrayValue::new(first.elem, shape, data)
}

// =============================================================================
// Scalar operations
// =============================================================================

fn int_binop(op: BinOp, a: i64, b: i64) -> Result<i64> {
    Ok(match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div | BinOp::Mod if b == 0 => bail_eval!("division by zero"),
        BinOp::Div => a.div_euclid(b) - if b < 0 && a.rem_euclid(b) != 0 { 1 } else { 0 },
        BinOp::Mod => a - b * int_binop(BinOp::Div, a, b)?,
        BinOp::Min => a.min(b),
        BinOp::Max => a.max(b),
        BinOp::And => a & b,
        BinOp::Or => a | b,
    })
}

fn float_binop(op: BinOp, a: f64, b: f64) -> Result<f64> {
    Ok(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Mod => a - b * (a / b).floor(),
        BinOp::Min => a.min(b),
        BinOp::Max => a.max(b),
        BinOp::And | BinOp::Or => bail_eval!("logical operator on floats"),
    })
}

fn binop(op: BinOp, x: PrimValue, y: PrimValue) -> Result<PrimValue> {
    use PrimValue::*;
    Ok(match (x, y) {
        (I64(a), I64(b)) => I64(int_binop(op, a, b)?),
        (I32(a), I32(b)) => I32(int_binop(op, a as i64, b as i64)? as i32),
        (F32(a), F32(b)) => F32(float_binop(op, a as f64, b as f64)? as f32),
        (F64(a), F64(b)) => F64(float_binop(op, a, b)?),
        (Bool(a), Bool(b)) => Bool(match op {
            BinOp::And | BinOp::Min => a && b,
            BinOp::Or | BinOp::Max => a || b,
            _ => bail_eval!("arithmetic on booleans"),
        }),
        (x, y) => bail_eval!("operands of different types: {x} and {y}"),
    })
}

fn as_f64(v: PrimValue) -> f64 {
    match v {
        PrimValue::Bool(b) => b as i64 as f64,
        PrimValue::I32(x) => x as f64,
        PrimValue::I64(x) => x as f64,
        PrimValue::F32(x) => x as f64,
        PrimValue::F64(x) => x,
    }
}

fn cmpop(op: CmpOp, x: PrimValue, y: PrimValue) -> Result<bool> {
    if x.prim_type() != y.prim_type() {
        bail_eval!("comparison of {x} and {y}");
    }
    let ord = match (x.as_i64(), y.as_i64()) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ if x.prim_type().is_float() => as_f64(x).partial_cmp(&as_f64(y)),
        _ => x.as_bool().zip(y.as_bool()).map(|(a, b)| a.cmp(&b)),
    };
    Ok(match (op, ord) {
        (CmpOp::Eq, o) => o == Some(std::cmp::Ordering::Equal),
        (CmpOp::Ne, o) => o != Some(std::cmp::Ordering::Equal),
        (CmpOp::Lt, o) => o == Some(std::cmp::Ordering::Less),
        (CmpOp::Le, o) => matches!(o, Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)),
    })
}

fn unop(op: UnOp, x: PrimValue) -> Result<PrimValue> {
    use PrimValue::*;
    Ok(match (op, x) {
        (UnOp::Not, Bool(b)) => Bool(!b),
        (UnOp::Not, I32(a)) => I32(!a),
        (UnOp::Not, I64(a)) => I64(!a),
        (UnOp::Neg, I32(a)) => I32(a.wrapping_neg()),
        (UnOp::Neg, I64(a)) => I64(a.wrapping_neg()),
        (UnOp::Neg, F32(a)) => F32(-a),
        (UnOp::Neg, F64(a)) => F64(-a),
        (UnOp::Abs, I32(a)) => I32(a.wrapping_abs()),
        (UnOp::Abs, I64(a)) => I64(a.wrapping_abs()),
        (UnOp::Abs, F32(a)) => F32(a.abs()),
        (UnOp::Abs, F64(a)) => F64(a.abs()),
        (op, x) => bail_eval!("cannot apply {op:?} to {x}"),
    })
}

fn convert(t: PrimType, x: PrimValue) -> PrimValue {
    let int = || match x {
        PrimValue::Bool(b) => b as i64,
        PrimValue::I32(a) => a as i64,
        PrimValue::I64(a) => a,
        PrimValue::F32(a) => a as i64,
        PrimValue::F64(a) => a as i64,
    };
    match t {
        PrimType::Bool => PrimValue::Bool(as_f64(x) != 0.0),
        PrimType::I32 => PrimValue::I32(int() as i32),
        PrimType::I64 => PrimValue::I64(int()),
        PrimType::F32 => PrimValue::F32(as_f64(x) as f32),
        PrimType::F64 => PrimValue::F64(as_f64(x)),
    }
}

// =============================================================================
// Interpreter
// =============================================================================

type Env = HashMap<VarId, Value>;

pub struct Interpreter<'a> {
    program: &'a Program,
    sizes: &'a SizeTable,
}

impl<'a> Interpreter<'a> {
    pub fn new(program: &'a Program, sizes: &'a SizeTable) -> Self {
        Interpreter { program, sizes }
    }

    /// Call `entry` with `args`.
    pub fn run(&self, entry: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        self.call(entry, args)
    }

    fn call(&self, name: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        let fun: &FunDef = self
            .program
            .fun(name)
            .ok_or_else(|| err_eval!("unknown function '{name}'"))?;
        if fun.params.len() != args.len() {
            bail_eval!("'{name}' takes {} arguments, got {}", fun.params.len(), args.len());
        }
        trace!("calling {name}");
        let mut env = Env::new();
        for (p, arg) in fun.params.iter().zip(args) {
            env.insert(p.var, arg);
        }
        self.eval_body(&mut env, &fun.body)
    }

    fn lookup(&self, env: &Env, v: VarId) -> Result<Value> {
        env.get(&v).cloned().ok_or_else(|| err_eval!("unbound variable {v}"))
    }

    fn array(&self, env: &Env, v: VarId) -> Result<ArrayValue> {
        match self.lookup(env, v)? {
            Value::Array(a) => Ok(a),
            Value::Prim(_) => Err(err_eval!("{v} is not an array")),
        }
    }

    fn se(&self, env: &Env, se: &SubExp) -> Result<Value> {
        match se {
            SubExp::Const(c) => Ok(Value::Prim(*c)),
            SubExp::Var(v) => self.lookup(env, *v),
        }
    }

    fn size(&self, env: &Env, se: &SubExp) -> Result<usize> {
        let n = self.se(env, se)?.as_i64()?;
        usize::try_from(n).map_err(|_| err_eval!("negative size {n}"))
    }

    fn shape(&self, env: &Env, dims: &[SubExp]) -> Result<Vec<usize>> {
        dims.iter().map(|d| self.size(env, d)).collect()
    }

    /// The shape of a value of type `ty`, for building empty arrays. Sizes
    /// that cannot be evaluated count as zero.
    fn shape_of_type(&self, env: &Env, ty: &Type) -> Vec<usize> {
        ty.dims().iter().map(|d| self.size(env, d).unwrap_or(0)).collect()
    }

    fn eval_body(&self, env: &mut Env, body: &Body) -> Result<Vec<Value>> {
        for stm in &body.stms {
            self.eval_stm(env, stm)?;
        }
        body.result.iter().map(|se| self.se(env, se)).collect()
    }

    fn eval_stm(&self, env: &mut Env, stm: &Stm) -> Result<()> {
        let values = self.eval_exp(env, &stm.exp)?;
        let names: Vec<VarId> = stm.pat.names().collect();
        if names.len() != values.len() {
            bail_eval!("pattern of {} names bound to {} values", names.len(), values.len());
        }
        for (v, value) in names.into_iter().zip(values) {
            env.insert(v, value);
        }
        Ok(())
    }

    fn apply(&self, env: &mut Env, lam: &Lambda, args: Vec<Value>) -> Result<Vec<Value>> {
        if lam.params.len() != args.len() {
            bail_eval!("lambda of {} parameters applied to {} arguments", lam.params.len(), args.len());
        }
        for (p, arg) in lam.params.iter().zip(args) {
            env.insert(p.var, arg);
        }
        self.eval_body(env, &lam.body)
    }

    fn selectors(&self, env: &Env, slice: &[DimIndex]) -> Result<Vec<Sel>> {
        slice
            .iter()
            .map(|d| match d {
                DimIndex::Fix(i) => Ok(Sel::Fix(self.se(env, i)?.as_i64()?)),
                DimIndex::Slice { start, len, stride } => Ok(Sel::Range {
                    start: self.se(env, start)?.as_i64()?,
                    len: self.size(env, len)?,
                    stride: self.se(env, stride)?.as_i64()?,
                }),
            })
            .collect()
    }

    fn eval_exp(&self, env: &mut Env, exp: &Exp) -> Result<Vec<Value>> {
        let one = |v: Value| Ok(vec![v]);
        match exp {
            Exp::SubExp(se) => one(self.se(env, se)?),
            Exp::BinOp(op, x, y) => one(Value::Prim(binop(
                *op,
                self.se(env, x)?.as_prim()?,
                self.se(env, y)?.as_prim()?,
            )?)),
            Exp::CmpOp(op, x, y) => one(Value::bool(cmpop(
                *op,
                self.se(env, x)?.as_prim()?,
                self.se(env, y)?.as_prim()?,
            )?)),
            Exp::UnOp(op, x) => one(Value::Prim(unop(*op, self.se(env, x)?.as_prim()?)?)),
            Exp::Convert(t, x) => one(Value::Prim(convert(*t, self.se(env, x)?.as_prim()?))),
            Exp::Index { arr, slice } => {
                let sels = self.selectors(env, slice)?;
                one(index_array(&self.array(env, *arr)?, &sels)?)
            }
            Exp::Update { arr, slice, value } => {
                let sels = self.selectors(env, slice)?;
                let value = self.se(env, value)?;
                one(Value::Array(update_array(&self.array(env, *arr)?, &sels, &value)?))
            }
            Exp::Iota { n } => {
                let n = self.size(env, n)?;
                let data = (0..n as i64).map(PrimValue::I64).collect();
                one(Value::Array(ArrayValue::new(PrimType::I64, vec![n], data)?))
            }
            Exp::Replicate { shape, value } => {
                let value = self.se(env, value)?;
                let mut dims = self.shape(env, shape.dims())?;
                let count: usize = dims.iter().product();
                let row = value.flat();
                let elem = row.first().map(|p| p.prim_type());
                dims.extend(value.shape());
                let data: Vec<PrimValue> = std::iter::repeat_n(row, count).flatten().collect();
                let elem = match (&value, elem) {
                    (Value::Array(a), _) => a.elem,
                    (_, Some(t)) => t,
                    (_, None) => PrimType::I64,
                };
                one(Value::Array(ArrayValue::new(elem, dims, data)?))
            }
            Exp::Scratch { elem, shape } => {
                let dims = self.shape(env, shape.dims())?;
                let count = dims.iter().product();
                one(Value::Array(ArrayValue::new(*elem, dims, vec![elem.zero(); count])?))
            }
            Exp::Rearrange { perm, arr } => one(Value::Array(rearrange(&self.array(env, *arr)?, perm)?)),
            Exp::Reshape { shape, arr } => {
                let arr = self.array(env, *arr)?;
                let dims = self.shape(env, shape.dims())?;
                if dims.iter().product::<usize>() != arr.data.len() {
                    bail_eval!("cannot reshape {:?} into {:?}", arr.shape, dims);
                }
                one(Value::Array(ArrayValue {
                    elem: arr.elem,
                    shape: dims,
                    data: arr.data,
                }))
            }
            Exp::Manifest { arr, .. } | Exp::Copy(arr) => one(self.lookup(env, *arr)?),
            Exp::Concat { dim, arrs, .. } => {
                let arrs = arrs.iter().map(|a| self.array(env, *a)).collect::<Result<Vec<_>>>()?;
                let refs: Vec<&ArrayValue> = arrs.iter().collect();
                one(Value::Array(concat(&refs, *dim)?))
            }
            Exp::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                if self.se(env, cond)?.as_bool()? {
                    self.eval_body(env, then_body)
                } else {
                    self.eval_body(env, else_body)
                }
            }
            Exp::Loop { merge, form, body } => {
                let mut vals = merge
                    .iter()
                    .map(|(_, init)| self.se(env, init))
                    .collect::<Result<Vec<_>>>()?;
                let bind = |env: &mut Env, vals: Vec<Value>| {
                    for ((p, _), v) in merge.iter().zip(vals) {
                        env.insert(p.var, v);
                    }
                };
                match form {
                    LoopForm::For { i, bound } => {
                        let n = self.se(env, bound)?.as_i64()?;
                        for k in 0..n {
                            bind(env, vals);
                            env.insert(*i, Value::i64(k));
                            vals = self.eval_body(env, body)?;
                        }
                    }
                    LoopForm::While { cond } => loop {
                        bind(env, vals.clone());
                        if !self.lookup(env, *cond)?.as_bool()? {
                            break;
                        }
                        vals = self.eval_body(env, body)?;
                    },
                }
                Ok(vals)
            }
            Exp::Apply { fun, args, .. } => {
                let args = args.iter().map(|a| self.se(env, a)).collect::<Result<Vec<_>>>()?;
                self.call(fun, args)
            }
            Exp::Op(Op::Soac(soac)) => self.eval_soac(env, soac),
            Exp::Op(Op::Group(op)) => self.eval_soac(env, &group_as_soac(op)),
            Exp::Op(Op::Kernel(kernel)) => self.eval_kernel(env, kernel),
            Exp::Op(Op::Size(SizeOp::GetSize { name, class })) => one(Value::i64(self.sizes.get(name, *class))),
            Exp::Op(Op::Size(SizeOp::CmpSizeLe { name, class, x })) => {
                let x = self.se(env, x)?.as_i64()?;
                one(Value::bool(self.sizes.get(name, *class) <= x))
            }
        }
    }

    // =========================================================================
    // SOACs
    // =========================================================================

    fn rows(&self, env: &Env, arrs: &[VarId], i: usize) -> Result<Vec<Value>> {
        arrs.iter().map(|a| self.array(env, *a)?.row(i)).collect()
    }

    /// Stack per-iteration values of row type `ty` into an array.
    fn stack(&self, env: &Env, ty: &Type, rows: Vec<Value>) -> Result<Value> {
        let row_shape = match rows.first() {
            Some(r) => r.shape().to_vec(),
            None => self.shape_of_type(env, ty),
        };
        let mut data = vec![];
        let n = rows.len();
        for r in rows {
            if r.shape() != row_shape.as_slice() {
                bail_eval!("irregular array: row of shape {:?} among rows of {:?}", r.shape(), row_shape);
            }
            r.push_flat(&mut data);
        }
        let mut shape = vec![n];
        shape.extend(row_shape);
        Ok(Value::Array(ArrayValue::new(ty.elem_type(), shape, data)?))
    }

    fn stack_columns(&self, env: &Env, tys: &[Type], columns: Vec<Vec<Value>>) -> Result<Vec<Value>> {
        tys.iter().zip(columns).map(|(t, col)| self.stack(env, t, col)).collect()
    }

    fn eval_soac(&self, env: &mut Env, soac: &Soac) -> Result<Vec<Value>> {
        let w = self.size(env, soac.width())?;
        match soac {
            Soac::Map(map) => {
                let mut cols = vec![vec![]; map.lam.ret.len()];
                for i in 0..w {
                    let args = self.rows(env, &map.arrs, i)?;
                    for (col, v) in cols.iter_mut().zip(self.apply(env, &map.lam, args)?) {
                        col.push(v);
                    }
                }
                self.stack_columns(env, &map.lam.ret, cols)
            }
            Soac::Reduce(red) => {
                let mut acc = red.nes.iter().map(|ne| self.se(env, ne)).collect::<Result<Vec<_>>>()?;
                for i in 0..w {
                    let mut args = acc;
                    args.extend(self.rows(env, &red.arrs, i)?);
                    acc = self.apply(env, &red.lam, args)?;
                }
                Ok(acc)
            }
            Soac::Scan(scan) => {
                let mut acc = scan.nes.iter().map(|ne| self.se(env, ne)).collect::<Result<Vec<_>>>()?;
                let mut cols = vec![vec![]; acc.len()];
                for i in 0..w {
                    let mut args = acc;
                    args.extend(self.rows(env, &scan.arrs, i)?);
                    acc = self.apply(env, &scan.lam, args)?;
                    for (col, v) in cols.iter_mut().zip(&acc) {
                        col.push(v.clone());
                    }
                }
                self.stack_columns(env, &scan.lam.ret, cols)
            }
            Soac::Redomap(redomap) => {
                let n = redomap.nes.len();
                let mut acc = redomap.nes.iter().map(|ne| self.se(env, ne)).collect::<Result<Vec<_>>>()?;
                let mut cols = vec![vec![]; redomap.map_lam.ret.len().saturating_sub(n)];
                for i in 0..w {
                    let args = self.rows(env, &redomap.arrs, i)?;
                    let mut mapped = self.apply(env, &redomap.map_lam, args)?;
                    let extra = mapped.split_off(n.min(mapped.len()));
                    let mut args = acc;
                    args.extend(mapped);
                    acc = self.apply(env, &redomap.red_lam, args)?;
                    for (col, v) in cols.iter_mut().zip(extra) {
                        col.push(v);
                    }
                }
                acc.extend(self.stack_columns(env, &redomap.map_lam.ret[n..], cols)?);
                Ok(acc)
            }
            Soac::Scanomap(scanomap) => {
                let n = scanomap.nes.len();
                let mut acc = scanomap.nes.iter().map(|ne| self.se(env, ne)).collect::<Result<Vec<_>>>()?;
                let mut scanned = vec![vec![]; n];
                let mut cols = vec![vec![]; scanomap.map_lam.ret.len().saturating_sub(n)];
                for i in 0..w {
                    let args = self.rows(env, &scanomap.arrs, i)?;
                    let mut mapped = self.apply(env, &scanomap.map_lam, args)?;
                    let extra = mapped.split_off(n.min(mapped.len()));
                    let mut args = acc;
                    args.extend(mapped);
                    acc = self.apply(env, &scanomap.scan_lam, args)?;
                    for (col, v) in scanned.iter_mut().zip(&acc) {
                        col.push(v.clone());
                    }
                    for (col, v) in cols.iter_mut().zip(extra) {
                        col.push(v);
                    }
                }
                let mut out = self.stack_columns(env, &scanomap.map_lam.ret[..n], scanned)?;
                out.extend(self.stack_columns(env, &scanomap.map_lam.ret[n..], cols)?);
                Ok(out)
            }
            Soac::Stream(stream) => {
                // One chunk covering everything; the accumulators of a
                // parallel stream are neutral, so no combining is needed.
                let mut args = vec![Value::i64(w as i64)];
                for acc in &stream.accs {
                    args.push(self.se(env, acc)?);
                }
                for arr in &stream.arrs {
                    args.push(self.lookup(env, *arr)?);
                }
                self.apply(env, &stream.lam, args)
            }
            Soac::Scatter(scatter) => {
                let k = scatter.dests.len();
                let mut dests = vec![];
                for (dw, dest) in &scatter.dests {
                    dests.push((self.se(env, dw)?.as_i64()?, self.array(env, *dest)?));
                }
                for i in 0..w {
                    let args = self.rows(env, &scatter.arrs, i)?;
                    let res = self.apply(env, &scatter.lam, args)?;
                    if res.len() != 2 * k {
                        bail_eval!("scatter lambda returned {} values for {k} destinations", res.len());
                    }
                    for (d, (dest_w, dest)) in dests.iter_mut().enumerate() {
                        let idx = res[d].as_i64()?;
                        if idx >= 0 && idx < *dest_w {
                            write_row(dest, idx as usize, &res[k + d])?;
                        }
                    }
                }
                Ok(dests.into_iter().map(|(_, d)| Value::Array(d)).collect())
            }
            Soac::WithLoop(wl) => {
                let offset = self.se(env, &wl.offset)?.as_i64()?;
                let mut dests = vec![];
                for (dw, dest) in &wl.dests {
                    dests.push((self.se(env, dw)?.as_i64()?, self.array(env, *dest)?));
                }
                for i in 0..w as i64 {
                    let idx = offset + i;
                    let res = self.apply(env, &wl.lam, vec![Value::i64(idx)])?;
                    if res.len() != dests.len() {
                        bail_eval!("with-loop lambda returned {} values for {} destinations", res.len(), dests.len());
                    }
                    for ((dest_w, dest), v) in dests.iter_mut().zip(&res) {
                        if idx >= 0 && idx < *dest_w {
                            write_row(dest, idx as usize, v)?;
                        }
                    }
                }
                Ok(dests.into_iter().map(|(_, d)| Value::Array(d)).collect())
            }
        }
    }

    // =========================================================================
    // Kernels
    // =========================================================================

    fn eval_kernel(&self, env: &mut Env, kernel: &Kernel) -> Result<Vec<Value>> {
        let space = &kernel.space;
        let widths = self.shape(env, &space.widths())?;
        trace!("kernel {} over {:?}", kernel.desc, widths);
        let mut rows: Vec<Vec<Value>> = vec![vec![]; kernel.body.results.len()];
        let mut dests: Vec<Option<(i64, ArrayValue)>> = vec![];
        for res in &kernel.body.results {
            dests.push(match res {
                KernelResult::Threads(_) => None,
                KernelResult::Write { dest_w, dest, .. } => {
                    Some((self.se(env, dest_w)?.as_i64()?, self.array(env, *dest)?))
                }
            });
        }

        let mut flat = 0i64;
        for_each_index(&widths, |idx| {
            for ((gtid, _), i) in space.dims.iter().zip(idx) {
                env.insert(*gtid, Value::i64(*i as i64));
            }
            env.insert(space.global_tid, Value::i64(flat));
            flat += 1;
            for inp in &kernel.inputs {
                let sels = inp
                    .indices
                    .iter()
                    .map(|i| Ok(Sel::Fix(self.se(env, i)?.as_i64()?)))
                    .collect::<Result<Vec<_>>>()?;
                let value = index_array(&self.array(env, inp.arr)?, &sels)?;
                env.insert(inp.param.var, value);
            }
            for stm in &kernel.body.stms {
                self.eval_stm(env, stm)?;
            }
            for (j, res) in kernel.body.results.iter().enumerate() {
                match (res, &mut dests[j]) {
                    (KernelResult::Threads(se), _) => rows[j].push(self.se(env, se)?),
                    (KernelResult::Write { index, value, .. }, Some((dest_w, dest))) => {
                        let idx = self.se(env, index)?.as_i64()?;
                        if idx >= 0 && idx < *dest_w {
                            write_row(dest, idx as usize, &self.se(env, value)?)?;
                        }
                    }
                    (KernelResult::Write { .. }, None) => bail_eval!("write result without destination"),
                }
            }
            Ok(())
        })?;

        let mut out = vec![];
        for ((res, rows), (dest, ty)) in kernel
            .body
            .results
            .iter()
            .zip(rows)
            .zip(dests.into_iter().zip(&kernel.ret))
        {
            match (res, dest) {
                (KernelResult::Threads(_), _) => {
                    let Value::Array(stacked) = self.stack(env, ty, rows)? else {
                        bail_eval!("kernel results did not stack into an array");
                    };
                    let mut shape = widths.clone();
                    shape.extend(&stacked.shape[1..]);
                    out.push(Value::Array(ArrayValue {
                        elem: stacked.elem,
                        shape,
                        data: stacked.data,
                    }));
                }
                (KernelResult::Write { .. }, Some((_, dest))) => out.push(Value::Array(dest)),
                (KernelResult::Write { .. }, None) => bail_eval!("write result without destination"),
            }
        }
        Ok(out)
    }
}

/// Run `entry` of `program` with `args` under `sizes`.
pub fn run_program(program: &Program, entry: &str, args: Vec<Value>, sizes: &SizeTable) -> Result<Vec<Value>> {
    Interpreter::new(program, sizes).run(entry, args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_division() {
        assert_eq!(int_binop(BinOp::Div, 7, 2).unwrap(), 3);
        assert_eq!(int_binop(BinOp::Div, -7, 2).unwrap(), -4);
        assert_eq!(int_binop(BinOp::Div, 7, -2).unwrap(), -4);
        assert_eq!(int_binop(BinOp::Mod, -7, 2).unwrap(), 1);
        assert!(int_binop(BinOp::Div, 1, 0).is_err());
    }

    #[test]
    fn test_rearrange_transposes() {
        let data = (0..6).map(PrimValue::I64).collect();
        let arr = ArrayValue::new(PrimType::I64, vec![2, 3], data).unwrap();
        let tr = rearrange(&arr, &[1, 0]).unwrap();
        assert_eq!(tr.shape, vec![3, 2]);
        assert_eq!(Value::Array(tr).to_string(), "[[0, 3], [1, 4], [2, 5]]");
    }

    #[test]
    fn test_strided_slice() {
        let arr = ArrayValue::new(PrimType::I64, vec![6], (0..6).map(PrimValue::I64).collect()).unwrap();
        let v = index_array(
            &arr,
            &[Sel::Range {
                start: 1,
                len: 3,
                stride: 2,
            }],
        )
        .unwrap();
        assert_eq!(v, Value::i64_array(&[1, 3, 5]));
    }

    #[test]
    fn test_concat_inner_dimension() {
        let a = ArrayValue::new(PrimType::I64, vec![2, 1], vec![PrimValue::I64(1), PrimValue::I64(2)]).unwrap();
        let b = ArrayValue::new(PrimType::I64, vec![2, 1], vec![PrimValue::I64(3), PrimValue::I64(4)]).unwrap();
        let c = concat(&[&a, &b], 1).unwrap();
        assert_eq!(Value::Array(c).to_string(), "[[1, 3], [2, 4]]");
    }
}
