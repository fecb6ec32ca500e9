//! Primitive values, sub-expressions and array types.
//!
//! Every array type carries its full shape as a list of sub-expressions, so a
//! dimension is either a constant or a name bound somewhere in scope. Return
//! types of branches and calls may additionally use existential dimensions
//! (`ExtSize::Ext`) that are bound by the context part of the pattern.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::VarId;

// =============================================================================
// Scalars
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimType {
    Bool,
    I32,
    I64,
    F32,
    F64,
}

impl PrimType {
    pub fn is_float(self) -> bool {
        matches!(self, PrimType::F32 | PrimType::F64)
    }

    /// The all-zeroes value of this type; what `Scratch` arrays hold.
    pub fn zero(self) -> PrimValue {
        match self {
            PrimType::Bool => PrimValue::Bool(false),
            PrimType::I32 => PrimValue::I32(0),
            PrimType::I64 => PrimValue::I64(0),
            PrimType::F32 => PrimValue::F32(0.0),
            PrimType::F64 => PrimValue::F64(0.0),
        }
    }
}

/// A primitive constant.
///
/// Equality and hashing go through the bit pattern of floats so that
/// constants can be used as map keys (slices are keyed in the babysitter).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl PrimValue {
    pub fn prim_type(self) -> PrimType {
        match self {
            PrimValue::Bool(_) => PrimType::Bool,
            PrimValue::I32(_) => PrimType::I32,
            PrimValue::I64(_) => PrimType::I64,
            PrimValue::F32(_) => PrimType::F32,
            PrimValue::F64(_) => PrimType::F64,
        }
    }

    pub fn as_i64(self) -> Option<i64> {
        match self {
            PrimValue::I32(x) => Some(x as i64),
            PrimValue::I64(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            PrimValue::Bool(b) => Some(b),
            _ => None,
        }
    }

    fn bits(self) -> (u8, u64) {
        match self {
            PrimValue::Bool(b) => (0, b as u64),
            PrimValue::I32(x) => (1, x as u32 as u64),
            PrimValue::I64(x) => (2, x as u64),
            PrimValue::F32(x) => (3, x.to_bits() as u64),
            PrimValue::F64(x) => (4, x.to_bits()),
        }
    }
}

impl PartialEq for PrimValue {
    fn eq(&self, other: &Self) -> bool {
        self.bits() == other.bits()
    }
}

impl Eq for PrimValue {}

impl Hash for PrimValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits().hash(state);
    }
}

/// An operand: a constant or a variable. Only variables and constants appear
/// as arguments of expressions (the IR is in A-normal form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubExp {
    Const(PrimValue),
    Var(VarId),
}

impl SubExp {
    pub fn i64(n: i64) -> Self {
        SubExp::Const(PrimValue::I64(n))
    }

    pub fn bool(b: bool) -> Self {
        SubExp::Const(PrimValue::Bool(b))
    }

    pub fn var(&self) -> Option<VarId> {
        match self {
            SubExp::Var(v) => Some(*v),
            SubExp::Const(_) => None,
        }
    }

    pub fn const_i64(&self) -> Option<i64> {
        match self {
            SubExp::Const(c) => c.as_i64(),
            SubExp::Var(_) => None,
        }
    }
}

impl fmt::Display for PrimValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimValue::Bool(b) => write!(f, "{b}"),
            PrimValue::I32(x) => write!(f, "{x}i32"),
            PrimValue::I64(x) => write!(f, "{x}"),
            PrimValue::F32(x) => write!(f, "{x}f32"),
            PrimValue::F64(x) => write!(f, "{x}f64"),
        }
    }
}

impl fmt::Display for SubExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubExp::Const(c) => write!(f, "{c}"),
            SubExp::Var(v) => write!(f, "{v}"),
        }
    }
}

impl From<VarId> for SubExp {
    fn from(v: VarId) -> Self {
        SubExp::Var(v)
    }
}

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape(pub Vec<SubExp>);

impl Shape {
    pub fn new(dims: Vec<SubExp>) -> Self {
        Shape(dims)
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[SubExp] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Type {
    Prim(PrimType),
    Array { elem: PrimType, shape: Shape },
}

impl Type {
    pub fn i64() -> Self {
        Type::Prim(PrimType::I64)
    }

    pub fn bool() -> Self {
        Type::Prim(PrimType::Bool)
    }

    /// An array of `elem` with the given dimensions; a scalar when `dims` is
    /// empty.
    pub fn array(elem: PrimType, dims: Vec<SubExp>) -> Self {
        if dims.is_empty() {
            Type::Prim(elem)
        } else {
            Type::Array {
                elem,
                shape: Shape(dims),
            }
        }
    }

    pub fn elem_type(&self) -> PrimType {
        match self {
            Type::Prim(p) => *p,
            Type::Array { elem, .. } => *elem,
        }
    }

    pub fn rank(&self) -> usize {
        match self {
            Type::Prim(_) => 0,
            Type::Array { shape, .. } => shape.rank(),
        }
    }

    pub fn dims(&self) -> &[SubExp] {
        match self {
            Type::Prim(_) => &[],
            Type::Array { shape, .. } => shape.dims(),
        }
    }

    pub fn outer_dim(&self) -> Option<&SubExp> {
        self.dims().first()
    }

    /// The type of one row, i.e. with the outermost dimension removed.
    pub fn row_type(&self) -> Type {
        Type::array(self.elem_type(), self.dims().iter().skip(1).cloned().collect())
    }

    /// Prepend `w` as a new outermost dimension.
    pub fn array_of(&self, w: SubExp) -> Type {
        self.array_of_dims(&[w])
    }

    /// Prepend several outer dimensions.
    pub fn array_of_dims(&self, outer: &[SubExp]) -> Type {
        let mut dims = outer.to_vec();
        dims.extend(self.dims().iter().cloned());
        Type::array(self.elem_type(), dims)
    }

    /// Drop the `n` outermost dimensions.
    pub fn strip_dims(&self, n: usize) -> Type {
        Type::array(self.elem_type(), self.dims().iter().skip(n).cloned().collect())
    }

    pub fn with_dims(&self, dims: Vec<SubExp>) -> Type {
        Type::array(self.elem_type(), dims)
    }

    /// Names mentioned in the shape.
    pub fn free_vars(&self) -> impl Iterator<Item = VarId> + '_ {
        self.dims().iter().filter_map(SubExp::var)
    }
}

/// A dimension in a return type: either a known size or the index of a
/// context value in the binding pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtSize {
    Free(SubExp),
    Ext(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtType {
    Prim(PrimType),
    Array { elem: PrimType, shape: Vec<ExtSize> },
}

impl ExtType {
    pub fn has_existential(&self) -> bool {
        match self {
            ExtType::Prim(_) => false,
            ExtType::Array { shape, .. } => shape.iter().any(|d| matches!(d, ExtSize::Ext(_))),
        }
    }

    /// Prepend known outer dimensions.
    pub fn array_of_dims(&self, outer: &[SubExp]) -> ExtType {
        let (elem, inner) = match self {
            ExtType::Prim(p) => (*p, vec![]),
            ExtType::Array { elem, shape } => (*elem, shape.clone()),
        };
        let mut shape: Vec<ExtSize> = outer.iter().cloned().map(ExtSize::Free).collect();
        shape.extend(inner);
        if shape.is_empty() {
            ExtType::Prim(elem)
        } else {
            ExtType::Array { elem, shape }
        }
    }
}

impl From<Type> for ExtType {
    fn from(t: Type) -> Self {
        match t {
            Type::Prim(p) => ExtType::Prim(p),
            Type::Array { elem, shape } => ExtType::Array {
                elem,
                shape: shape.0.into_iter().map(ExtSize::Free).collect(),
            },
        }
    }
}

/// Commutativity of a reduction operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commutativity {
    Commutative,
    Noncommutative,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_and_array_of_are_inverse() {
        let n = SubExp::Var(VarId(3));
        let t = Type::array(PrimType::F32, vec![n.clone(), SubExp::i64(4)]);
        assert_eq!(t.row_type().array_of(n), t);
        assert_eq!(t.row_type(), Type::array(PrimType::F32, vec![SubExp::i64(4)]));
        assert_eq!(t.strip_dims(2), Type::Prim(PrimType::F32));
    }

    #[test]
    fn test_float_constants_are_hashable_keys() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(SubExp::Const(PrimValue::F32(1.5)));
        assert!(set.contains(&SubExp::Const(PrimValue::F32(1.5))));
        assert!(!set.contains(&SubExp::Const(PrimValue::F64(1.5))));
    }
}
