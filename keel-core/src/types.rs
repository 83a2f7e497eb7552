//! Type descriptors, conversion and compatibility rules
//!
//! Types are pure data: the VM consults them for assignability, numeric
//! promotion and explicit conversion, but they carry no behavior of their
//! own. Integer conversions are judged by the full range reachable from the
//! source width and signedness, never by the runtime value, so `i64 -> i32`
//! is rejected even when the value would fit.

use crate::value::{UnionState, Value, ValueError, ValueResult};
use std::cmp::Ordering;

/// Type tags for every runtime shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Nil,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    String,
    List,
    Dict,
    Tuple,
    Range,
    Enum,
    Record,
    Union,
    ErrorUnion,
    Error,
    Function,
    Closure,
    Iterator,
    Channel,
    Task,
    Atomic,
    Class,
    Object,
    Module,
    Any,
}

/// A type descriptor: tag plus tag-specific payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Primitive(TypeTag),
    List(Box<Type>),
    Dict(Box<Type>, Box<Type>),
    Tuple(Vec<Type>),
    /// Flattened, de-duplicated variant list
    Union(Vec<Type>),
    ErrorUnion {
        success: Box<Type>,
        /// Allowed error names; empty plus `generic` means any error
        errors: Vec<String>,
        generic: bool,
    },
    /// User-defined record shape
    Record {
        name: String,
        fields: Vec<(String, Type)>,
    },
    /// Enum or other nominal type referenced by name
    Named(String),
}

impl Type {
    pub fn tag(&self) -> TypeTag {
        match self {
            Type::Primitive(tag) => *tag,
            Type::List(_) => TypeTag::List,
            Type::Dict(_, _) => TypeTag::Dict,
            Type::Tuple(_) => TypeTag::Tuple,
            Type::Union(_) => TypeTag::Union,
            Type::ErrorUnion { .. } => TypeTag::ErrorUnion,
            Type::Record { .. } => TypeTag::Record,
            Type::Named(_) => TypeTag::Enum,
        }
    }

    pub fn any() -> Type {
        Type::Primitive(TypeTag::Any)
    }

    /// Build a union, flattening nested unions and dropping duplicates.
    pub fn union_of(members: Vec<Type>) -> Type {
        let mut flat: Vec<Type> = Vec::new();
        let mut queue = members;
        while let Some(member) = queue.pop() {
            match member {
                Type::Union(inner) => queue.extend(inner),
                other => {
                    if !flat.contains(&other) {
                        flat.push(other);
                    }
                }
            }
        }
        flat.reverse();
        if flat.len() == 1 {
            flat.pop().unwrap()
        } else {
            Type::Union(flat)
        }
    }

    pub fn is_numeric(&self) -> bool {
        numeric_rank(self.tag()).is_some()
    }
}

/// Promotion rank along the fixed widening order.
pub fn numeric_rank(tag: TypeTag) -> Option<u8> {
    use TypeTag::*;
    Some(match tag {
        I8 => 0,
        U8 => 1,
        I16 => 2,
        U16 => 3,
        I32 => 4,
        U32 => 5,
        I64 => 6,
        U64 => 7,
        F32 => 8,
        F64 => 9,
        _ => return None,
    })
}

fn is_integer_tag(tag: TypeTag) -> bool {
    integer_range(tag).is_some()
}

fn is_float_tag(tag: TypeTag) -> bool {
    matches!(tag, TypeTag::F32 | TypeTag::F64)
}

/// Inclusive value range reachable from an integer tag.
fn integer_range(tag: TypeTag) -> Option<(i128, i128)> {
    use TypeTag::*;
    Some(match tag {
        I8 => (i8::MIN as i128, i8::MAX as i128),
        I16 => (i16::MIN as i128, i16::MAX as i128),
        I32 => (i32::MIN as i128, i32::MAX as i128),
        I64 => (i64::MIN as i128, i64::MAX as i128),
        U8 => (0, u8::MAX as i128),
        U16 => (0, u16::MAX as i128),
        U32 => (0, u32::MAX as i128),
        U64 => (0, u64::MAX as i128),
        _ => return None,
    })
}

/// Whether every value of `source` is representable in `target`.
fn integer_widening_safe(source: TypeTag, target: TypeTag) -> bool {
    match (integer_range(source), integer_range(target)) {
        (Some((smin, smax)), Some((tmin, tmax))) => tmin <= smin && tmax >= smax,
        _ => false,
    }
}

/// Assignability from `source` to `target`.
pub fn is_compatible(source: &Type, target: &Type) -> bool {
    if source == target || target.tag() == TypeTag::Any {
        return true;
    }

    // A union source is compatible when any of its members is
    if let Type::Union(members) = source {
        return members.iter().any(|m| is_compatible(m, target));
    }
    // A union target is compatible when any member accepts the source
    if let Type::Union(members) = target {
        return members.iter().any(|m| is_compatible(source, m));
    }

    match (source, target) {
        (Type::Primitive(s), Type::Primitive(t)) => {
            if is_integer_tag(*s) && is_integer_tag(*t) {
                integer_widening_safe(*s, *t)
            } else if is_integer_tag(*s) && is_float_tag(*t) {
                true
            } else if *s == TypeTag::F32 && *t == TypeTag::F64 {
                true
            } else {
                false
            }
        }
        (Type::List(s), Type::List(t)) => is_compatible(s, t),
        (Type::Dict(sk, sv), Type::Dict(tk, tv)) => is_compatible(sk, tk) && is_compatible(sv, tv),
        (Type::Tuple(s), Type::Tuple(t)) => {
            s.len() == t.len() && s.iter().zip(t.iter()).all(|(a, b)| is_compatible(a, b))
        }
        (
            Type::ErrorUnion {
                success: s_ok,
                errors: s_errs,
                generic: s_gen,
            },
            Type::ErrorUnion {
                success: t_ok,
                errors: t_errs,
                generic: t_gen,
            },
        ) => {
            if !is_compatible(s_ok, t_ok) {
                return false;
            }
            if *t_gen {
                return true;
            }
            if *s_gen {
                return false;
            }
            s_errs.iter().all(|e| t_errs.contains(e))
        }
        (Type::Named(a), Type::Named(b)) => a == b,
        (Type::Record { name: a, .. }, Type::Record { name: b, .. }) => a == b,
        _ => false,
    }
}

/// Narrowest common supertype for binary-operator operand unification.
pub fn common_type(a: &Type, b: &Type) -> Type {
    if a == b {
        return a.clone();
    }
    if let (Some(ra), Some(rb)) = (numeric_rank(a.tag()), numeric_rank(b.tag())) {
        return if ra >= rb { a.clone() } else { b.clone() };
    }
    if is_compatible(a, b) {
        return b.clone();
    }
    if is_compatible(b, a) {
        return a.clone();
    }
    Type::union_of(vec![a.clone(), b.clone()])
}

fn make_integer(tag: TypeTag, n: i128) -> ValueResult<Value> {
    let (min, max) = integer_range(tag).ok_or(ValueError::InvalidOperation(
        "not an integer type".to_string(),
    ))?;
    if n < min || n > max {
        return Err(ValueError::ConversionError {
            from: "integer",
            to: tag_name(tag),
            reason: format!("{} is outside the representable range", n),
        });
    }
    Ok(match tag {
        TypeTag::I8 => Value::I8(n as i8),
        TypeTag::I16 => Value::I16(n as i16),
        TypeTag::I32 => Value::I32(n as i32),
        TypeTag::I64 => Value::I64(n as i64),
        TypeTag::U8 => Value::U8(n as u8),
        TypeTag::U16 => Value::U16(n as u16),
        TypeTag::U32 => Value::U32(n as u32),
        TypeTag::U64 => Value::U64(n as u64),
        _ => unreachable!(),
    })
}

fn tag_name(tag: TypeTag) -> &'static str {
    match tag {
        TypeTag::Nil => "nil",
        TypeTag::Bool => "bool",
        TypeTag::I8 => "i8",
        TypeTag::I16 => "i16",
        TypeTag::I32 => "i32",
        TypeTag::I64 => "i64",
        TypeTag::U8 => "u8",
        TypeTag::U16 => "u16",
        TypeTag::U32 => "u32",
        TypeTag::U64 => "u64",
        TypeTag::F32 => "f32",
        TypeTag::F64 => "f64",
        TypeTag::String => "string",
        _ => "value",
    }
}

fn value_integer(value: &Value) -> Option<i128> {
    match value {
        Value::I8(n) => Some(*n as i128),
        Value::I16(n) => Some(*n as i128),
        Value::I32(n) => Some(*n as i128),
        Value::I64(n) => Some(*n as i128),
        Value::U8(n) => Some(*n as i128),
        Value::U16(n) => Some(*n as i128),
        Value::U32(n) => Some(*n as i128),
        Value::U64(n) => Some(*n as i128),
        _ => None,
    }
}

/// Explicit conversion of a value to a target type.
///
/// Integer-to-integer succeeds only when the target's range covers the
/// source width's full range. Integer-to-float follows IEEE-754 widening.
/// String parsing is locale-independent. Conversion is idempotent: a value
/// already of the target width converts to itself bit-for-bit.
pub fn convert(value: &Value, target: &Type) -> ValueResult<Value> {
    let target_tag = target.tag();
    if target_tag == TypeTag::Any || value.type_of() == *target {
        return Ok(value.clone());
    }

    match target {
        Type::Primitive(tag) => convert_primitive(value, *tag),
        Type::ErrorUnion {
            errors: t_errs,
            generic: t_gen,
            ..
        } => match value {
            Value::Union(state) => match &**state {
                UnionState::Ok(_) => Ok(value.clone()),
                UnionState::Err(e) => {
                    if *t_gen || t_errs.contains(&e.error_type) {
                        Ok(value.clone())
                    } else {
                        Err(ValueError::ConversionError {
                            from: "error-union",
                            to: "error-union",
                            reason: format!("error '{}' is not in the target allow-list", e.error_type),
                        })
                    }
                }
            },
            other => Ok(Value::union_ok(other.clone())),
        },
        Type::Union(members) => {
            // First member that accepts the value wins
            for member in members {
                if let Ok(converted) = convert(value, member) {
                    return Ok(converted);
                }
            }
            Err(ValueError::ConversionError {
                from: value.type_name(),
                to: "union",
                reason: "no union member accepts the value".to_string(),
            })
        }
        _ => Err(ValueError::ConversionError {
            from: value.type_name(),
            to: tag_name(target_tag),
            reason: "unsupported conversion".to_string(),
        }),
    }
}

fn convert_primitive(value: &Value, target: TypeTag) -> ValueResult<Value> {
    let source = value.type_of().tag();
    if source == target {
        return Ok(value.clone());
    }

    // integer -> integer: range-reachability matrix, never value truncation
    if is_integer_tag(source) && is_integer_tag(target) {
        if !integer_widening_safe(source, target) {
            return Err(ValueError::ConversionError {
                from: tag_name(source),
                to: tag_name(target),
                reason: "narrowing conversion must be rejected at type-check time".to_string(),
            });
        }
        let n = value_integer(value).expect("integer tag implies integer value");
        return make_integer(target, n);
    }

    // integer -> float: IEEE-754 widening
    if is_integer_tag(source) && is_float_tag(target) {
        let n = value_integer(value).expect("integer tag implies integer value");
        return Ok(match target {
            TypeTag::F32 => Value::F32(n as f32),
            _ => Value::F64(n as f64),
        });
    }

    // float widening only
    if source == TypeTag::F32 && target == TypeTag::F64 {
        if let Value::F32(x) = value {
            return Ok(Value::F64(*x as f64));
        }
    }

    // string <-> numeric, locale-independent
    if source == TypeTag::String {
        let s = value.as_str()?.trim();
        return match target {
            TypeTag::F32 => s.parse::<f32>().map(Value::F32).map_err(|e| parse_err(target, e)),
            TypeTag::F64 => s.parse::<f64>().map(Value::F64).map_err(|e| parse_err(target, e)),
            TypeTag::I8 => s.parse::<i8>().map(Value::I8).map_err(|e| parse_err(target, e)),
            TypeTag::I16 => s.parse::<i16>().map(Value::I16).map_err(|e| parse_err(target, e)),
            TypeTag::I32 => s.parse::<i32>().map(Value::I32).map_err(|e| parse_err(target, e)),
            TypeTag::I64 => s.parse::<i64>().map(Value::I64).map_err(|e| parse_err(target, e)),
            TypeTag::U8 => s.parse::<u8>().map(Value::U8).map_err(|e| parse_err(target, e)),
            TypeTag::U16 => s.parse::<u16>().map(Value::U16).map_err(|e| parse_err(target, e)),
            TypeTag::U32 => s.parse::<u32>().map(Value::U32).map_err(|e| parse_err(target, e)),
            TypeTag::U64 => s.parse::<u64>().map(Value::U64).map_err(|e| parse_err(target, e)),
            TypeTag::Bool => match s {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(ValueError::ConversionError {
                    from: "string",
                    to: "bool",
                    reason: format!("malformed input: {:?}", s),
                }),
            },
            _ => Err(ValueError::ConversionError {
                from: "string",
                to: tag_name(target),
                reason: "unsupported conversion".to_string(),
            }),
        };
    }
    if target == TypeTag::String && (value.is_number() || value.is_bool()) {
        return Ok(Value::String(value.to_display_string()));
    }

    Err(ValueError::ConversionError {
        from: tag_name(source),
        to: tag_name(target),
        reason: "unsupported conversion".to_string(),
    })
}

fn parse_err<E: std::fmt::Display>(target: TypeTag, err: E) -> ValueError {
    ValueError::ConversionError {
        from: "string",
        to: tag_name(target),
        reason: err.to_string(),
    }
}

/// Arithmetic operations with promotion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

impl ArithOp {
    fn name(&self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "subtract",
            ArithOp::Mul => "multiply",
            ArithOp::Div => "divide",
            ArithOp::Rem => "modulo",
            ArithOp::Pow => "power",
        }
    }
}

/// Apply a binary arithmetic operation with common-type promotion.
///
/// Integer math runs in 128-bit and narrows to the promoted width, so mixed
/// signedness cannot wrap silently; a result outside the promoted range is an
/// overflow error.
pub fn arithmetic(op: ArithOp, a: &Value, b: &Value) -> ValueResult<Value> {
    let ta = a.type_of();
    let tb = b.type_of();
    if !ta.is_numeric() || !tb.is_numeric() {
        return Err(ValueError::InvalidOperation(format!(
            "cannot {} {} and {}",
            op.name(),
            a.type_name(),
            b.type_name()
        )));
    }
    let common = common_type(&ta, &tb);
    let tag = common.tag();

    if is_float_tag(tag) {
        let x = a.as_f64()?;
        let y = b.as_f64()?;
        let result = match op {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
            ArithOp::Div => x / y,
            ArithOp::Rem => x % y,
            ArithOp::Pow => x.powf(y),
        };
        return Ok(match tag {
            TypeTag::F32 => Value::F32(result as f32),
            _ => Value::F64(result),
        });
    }

    let x = value_integer(a).expect("numeric non-float is integer");
    let y = value_integer(b).expect("numeric non-float is integer");
    let result = match op {
        ArithOp::Add => x.checked_add(y),
        ArithOp::Sub => x.checked_sub(y),
        ArithOp::Mul => x.checked_mul(y),
        ArithOp::Div => {
            if y == 0 {
                return Err(ValueError::DivisionByZero);
            }
            x.checked_div(y)
        }
        ArithOp::Rem => {
            if y == 0 {
                return Err(ValueError::DivisionByZero);
            }
            x.checked_rem(y)
        }
        ArithOp::Pow => {
            if y < 0 {
                return Err(ValueError::InvalidOperation(
                    "negative integer exponent".to_string(),
                ));
            }
            let exp = u32::try_from(y).map_err(|_| {
                ValueError::InvalidOperation("exponent too large".to_string())
            })?;
            x.checked_pow(exp)
        }
    }
    .ok_or_else(|| {
        ValueError::InvalidOperation(format!("integer overflow in {}", op.name()))
    })?;

    make_integer(tag, result)
}

/// Numeric or string ordering with promotion.
pub fn compare(a: &Value, b: &Value) -> ValueResult<Ordering> {
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Ok(x.cmp(y));
    }
    match (value_integer(a), value_integer(b)) {
        (Some(x), Some(y)) => Ok(x.cmp(&y)),
        _ => {
            let x = a.as_f64().map_err(|_| ValueError::InvalidOperation(format!(
                "cannot compare {} and {}",
                a.type_name(),
                b.type_name()
            )))?;
            let y = b.as_f64().map_err(|_| ValueError::InvalidOperation(format!(
                "cannot compare {} and {}",
                a.type_name(),
                b.type_name()
            )))?;
            x.partial_cmp(&y).ok_or_else(|| {
                ValueError::InvalidOperation("comparison with NaN".to_string())
            })
        }
    }
}

/// Arithmetic negation; unsigned operands are rejected.
pub fn negate(value: &Value) -> ValueResult<Value> {
    match value {
        Value::I8(n) => n.checked_neg().map(Value::I8),
        Value::I16(n) => n.checked_neg().map(Value::I16),
        Value::I32(n) => n.checked_neg().map(Value::I32),
        Value::I64(n) => n.checked_neg().map(Value::I64),
        Value::F32(x) => Some(Value::F32(-x)),
        Value::F64(x) => Some(Value::F64(-x)),
        Value::U8(_) | Value::U16(_) | Value::U32(_) | Value::U64(_) => {
            return Err(ValueError::InvalidOperation(
                "cannot negate an unsigned integer".to_string(),
            ))
        }
        other => {
            return Err(ValueError::TypeError {
                expected: "number",
                actual: other.type_name(),
            })
        }
    }
    .ok_or_else(|| ValueError::InvalidOperation("integer overflow in negate".to_string()))
}

#[cfg(test)]
#[path = "types_tests.rs"]
mod tests;
