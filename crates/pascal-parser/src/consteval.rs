//! Constant-expression folding.
//!
//! The parser evaluates constant expressions inline (const sections,
//! subrange bounds, case labels, array dimensions) to a `ConstValue`.
//! The operator subset is deliberately small: binary `+ - *`, unary
//! `+ - not`, literals, and identifiers that resolve to constants or
//! enum values.

use pascal_types::{TypeArena, TypeId};

/// A folded constant.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Real(f64),
    Char(u8),
    Bool(bool),
    Str(String),
    Enum { value: i64, ty: TypeId },
}

impl ConstValue {
    /// The ordinal of an integral constant, or None for real/string.
    pub fn ordinal(&self) -> Option<i64> {
        match self {
            ConstValue::Int(v) => Some(*v),
            ConstValue::Char(c) => Some(*c as i64),
            ConstValue::Bool(b) => Some(*b as i64),
            ConstValue::Enum { value, .. } => Some(*value),
            ConstValue::Real(_) | ConstValue::Str(_) => None,
        }
    }

    /// The type of the constant.
    pub fn type_of(&self, arena: &TypeArena) -> TypeId {
        match self {
            ConstValue::Int(_) => arena.integer,
            ConstValue::Real(_) => arena.real,
            ConstValue::Char(_) => arena.char,
            ConstValue::Bool(_) => arena.boolean,
            // String constants fall back to the default capacity; the
            // caller interns a sized type when it needs one.
            ConstValue::Str(_) => arena.string_default,
            ConstValue::Enum { ty, .. } => *ty,
        }
    }
}

/// Fold a binary operation over two constants. The `op` strings are
/// the lexer's printed operator forms.
pub fn apply_binary(op: &str, lhs: &ConstValue, rhs: &ConstValue) -> Result<ConstValue, String> {
    use ConstValue::*;
    match (lhs, rhs) {
        (Int(a), Int(b)) => {
            let v = match op {
                "+" => a.checked_add(*b),
                "-" => a.checked_sub(*b),
                "*" => a.checked_mul(*b),
                _ => return Err(format!("operator {} not allowed in constant", op)),
            };
            v.map(Int)
                .ok_or_else(|| "constant expression overflows".to_string())
        }
        (Real(a), Real(b)) => match op {
            "+" => Ok(Real(a + b)),
            "-" => Ok(Real(a - b)),
            "*" => Ok(Real(a * b)),
            _ => Err(format!("operator {} not allowed in constant", op)),
        },
        (Int(a), Real(b)) => apply_binary(op, &Real(*a as f64), &Real(*b)),
        (Real(a), Int(b)) => apply_binary(op, &Real(*a), &Real(*b as f64)),
        _ => Err(format!(
            "operator {} not applicable to these constants",
            op
        )),
    }
}

/// Fold a unary operation.
pub fn apply_unary(op: &str, v: &ConstValue) -> Result<ConstValue, String> {
    use ConstValue::*;
    match (op, v) {
        ("+", Int(a)) => Ok(Int(*a)),
        ("+", Real(a)) => Ok(Real(*a)),
        ("-", Int(a)) => a
            .checked_neg()
            .map(Int)
            .ok_or_else(|| "constant expression overflows".to_string()),
        ("-", Real(a)) => Ok(Real(-*a)),
        ("not", Bool(b)) => Ok(Bool(!*b)),
        ("not", Int(a)) => Ok(Int(!*a)),
        _ => Err(format!("operator {} not applicable to this constant", op)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_arithmetic() {
        let a = ConstValue::Int(6);
        let b = ConstValue::Int(7);
        assert_eq!(apply_binary("*", &a, &b).unwrap(), ConstValue::Int(42));
        assert_eq!(apply_binary("-", &a, &b).unwrap(), ConstValue::Int(-1));
    }

    #[test]
    fn test_mixed_widens_to_real() {
        let a = ConstValue::Int(1);
        let b = ConstValue::Real(0.5);
        assert_eq!(apply_binary("+", &a, &b).unwrap(), ConstValue::Real(1.5));
    }

    #[test]
    fn test_unary() {
        assert_eq!(
            apply_unary("-", &ConstValue::Int(3)).unwrap(),
            ConstValue::Int(-3)
        );
        assert_eq!(
            apply_unary("not", &ConstValue::Bool(true)).unwrap(),
            ConstValue::Bool(false)
        );
    }

    #[test]
    fn test_rejected_operator() {
        assert!(apply_binary("/", &ConstValue::Int(1), &ConstValue::Int(2)).is_err());
    }

    #[test]
    fn test_ordinals() {
        assert_eq!(ConstValue::Char(b'a').ordinal(), Some(97));
        assert_eq!(ConstValue::Bool(true).ordinal(), Some(1));
        assert_eq!(ConstValue::Real(1.0).ordinal(), None);
    }

    #[test]
    fn test_overflow_reported() {
        assert!(apply_binary("+", &ConstValue::Int(i64::MAX), &ConstValue::Int(1)).is_err());
    }
}
