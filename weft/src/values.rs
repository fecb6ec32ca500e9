//! Conversion between JSON documents and interpreter values.
//!
//! Arguments are given as a JSON array with one element per parameter of the
//! entry point. Scalars are JSON numbers or booleans and arrays are nested
//! JSON arrays, which must be regular.

use serde_json::{Number, Value as Json};
use weft_core::interp::{ArrayValue, Value};
use weft_core::ir::{PrimType, PrimValue, Type};

use crate::DriverError;

fn bad_input(msg: impl Into<String>) -> DriverError {
    DriverError::InputError(msg.into())
}

fn prim_from_json(t: PrimType, json: &Json) -> Result<PrimValue, DriverError> {
    let v = match (t, json) {
        (PrimType::Bool, Json::Bool(b)) => PrimValue::Bool(*b),
        (PrimType::I32, Json::Number(n)) => {
            let x = n.as_i64().ok_or_else(|| bad_input(format!("{n} is not an integer")))?;
            PrimValue::I32(i32::try_from(x).map_err(|_| bad_input(format!("{x} does not fit in i32")))?)
        }
        (PrimType::I64, Json::Number(n)) => {
            PrimValue::I64(n.as_i64().ok_or_else(|| bad_input(format!("{n} is not an integer")))?)
        }
        (PrimType::F32, Json::Number(n)) => {
            PrimValue::F32(n.as_f64().ok_or_else(|| bad_input(format!("{n} is not a number")))? as f32)
        }
        (PrimType::F64, Json::Number(n)) => {
            PrimValue::F64(n.as_f64().ok_or_else(|| bad_input(format!("{n} is not a number")))?)
        }
        (t, json) => return Err(bad_input(format!("expected a {t:?} value, got {json}"))),
    };
    Ok(v)
}

/// Walk a nested JSON array of the given rank, recording its shape and
/// pushing its elements in row-major order.
fn collect_array(
    elem: PrimType,
    json: &Json,
    depth: usize,
    rank: usize,
    shape: &mut Vec<usize>,
    data: &mut Vec<PrimValue>,
) -> Result<(), DriverError> {
    if depth == rank {
        data.push(prim_from_json(elem, json)?);
        return Ok(());
    }
    let Json::Array(rows) = json else {
        return Err(bad_input(format!("expected an array of rank {}, got {json}", rank - depth)));
    };
    match shape.get(depth) {
        Some(&n) if n != rows.len() => {
            return Err(bad_input(format!(
                "irregular array: dimension {depth} has both {n} and {} elements",
                rows.len()
            )));
        }
        Some(_) => {}
        None => shape.push(rows.len()),
    }
    for row in rows {
        collect_array(elem, row, depth + 1, rank, shape, data)?;
    }
    Ok(())
}

pub fn value_from_json(ty: &Type, json: &Json) -> Result<Value, DriverError> {
    match ty {
        Type::Prim(t) => Ok(Value::Prim(prim_from_json(*t, json)?)),
        Type::Array { elem, shape: dims } => {
            let rank = dims.rank();
            let mut shape = vec![];
            let mut data = vec![];
            collect_array(*elem, json, 0, rank, &mut shape, &mut data)?;
            // An empty outer dimension hides the inner ones; take them from
            // the type where they are constants.
            while shape.len() < rank {
                let d = dims.dims()[shape.len()].const_i64().unwrap_or(0);
                shape.push(usize::try_from(d).unwrap_or(0));
            }
            Ok(Value::Array(ArrayValue::new(*elem, shape, data)?))
        }
    }
}

/// Decode the arguments of a function with parameters of types `tys`.
pub fn args_from_json(tys: &[Type], json: &Json) -> Result<Vec<Value>, DriverError> {
    let Json::Array(args) = json else {
        return Err(bad_input("arguments must be a JSON array"));
    };
    if args.len() != tys.len() {
        return Err(bad_input(format!("expected {} arguments, got {}", tys.len(), args.len())));
    }
    tys.iter().zip(args).map(|(t, a)| value_from_json(t, a)).collect()
}

fn prim_to_json(p: PrimValue) -> Json {
    match p {
        PrimValue::Bool(b) => Json::Bool(b),
        PrimValue::I32(x) => Json::from(x),
        PrimValue::I64(x) => Json::from(x),
        PrimValue::F32(x) => Number::from_f64(x as f64).map_or(Json::Null, Json::Number),
        PrimValue::F64(x) => Number::from_f64(x).map_or(Json::Null, Json::Number),
    }
}

pub fn value_to_json(v: &Value) -> Json {
    fn go(shape: &[usize], data: &[PrimValue]) -> Json {
        let Some((&n, rest)) = shape.split_first() else {
            return prim_to_json(data[0]);
        };
        let size: usize = rest.iter().product();
        Json::Array((0..n).map(|i| go(rest, &data[i * size..(i + 1) * size])).collect())
    }
    match v {
        Value::Prim(p) => prim_to_json(*p),
        Value::Array(a) => go(&a.shape, &a.data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::ir::SubExp;

    fn matrix_type(rows: SubExp, cols: SubExp) -> Type {
        Type::array(PrimType::I64, vec![rows, cols])
    }

    #[test]
    fn test_matrix_from_json() {
        let ty = matrix_type(SubExp::i64(2), SubExp::i64(3));
        let v = value_from_json(&ty, &json!([[1, 2, 3], [4, 5, 6]])).unwrap();
        assert_eq!(v.shape(), &[2, 3]);
        assert_eq!(v.to_string(), "[[1, 2, 3], [4, 5, 6]]");
        assert_eq!(value_to_json(&v), json!([[1, 2, 3], [4, 5, 6]]));
    }

    #[test]
    fn test_irregular_arrays_are_rejected() {
        let ty = matrix_type(SubExp::i64(2), SubExp::i64(3));
        assert!(value_from_json(&ty, &json!([[1, 2, 3], [4, 5]])).is_err());
        assert!(value_from_json(&ty, &json!([1, 2])).is_err());
    }

    #[test]
    fn test_empty_array_takes_inner_dims_from_type() {
        let ty = matrix_type(SubExp::i64(0), SubExp::i64(4));
        let v = value_from_json(&ty, &json!([])).unwrap();
        assert_eq!(v.shape(), &[0, 4]);
    }

    #[test]
    fn test_argument_count_is_checked() {
        let tys = vec![Type::i64(), Type::bool()];
        let args = args_from_json(&tys, &json!([3, true])).unwrap();
        assert_eq!(args, vec![Value::i64(3), Value::bool(true)]);
        assert!(args_from_json(&tys, &json!([3])).is_err());
        assert!(args_from_json(&tys, &json!([true, 3])).is_err());
    }
}
