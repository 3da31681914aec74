//! Runtime value representation shared by the code generator, the codecs and
//! the interpreter.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::PanicReason;

/// Shared, mutable handle used by the `Struct` and `Array` variants.
///
/// Phasor values with reference semantics are never deep-copied on
/// assignment; cloning a [`Value::Struct`] or [`Value::Array`] clones the
/// handle, not the data. There is no cycle collector — a struct that stores
/// itself (directly or transitively) leaks for the lifetime of the instance.
pub type Shared<T> = Rc<RefCell<T>>;

/// A struct instance: a type name plus an ordered, mutable field map.
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    /// Name the struct was declared or instantiated under.
    pub name: String,
    /// Field values keyed by name. A `BTreeMap` keeps iteration (and
    /// therefore `Display`) order deterministic for tests.
    pub fields: BTreeMap<String, Value>,
}

impl StructValue {
    /// Creates an empty struct instance with the given type name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), fields: BTreeMap::new() }
    }
}

/// The tag identifying a [`Value`]'s variant, independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ValueKind {
    /// [`Value::Null`]
    Null,
    /// [`Value::Bool`]
    Bool,
    /// [`Value::Int`]
    Int,
    /// [`Value::Float`]
    Float,
    /// [`Value::String`]
    String,
    /// [`Value::Struct`]
    Struct,
    /// [`Value::Array`]
    Array,
}

/// A tagged union over every value the Phasor runtime can hold.
///
/// `Struct` and `Array` carry a [`Shared`] handle: copying the `Value`
/// aliases the same underlying storage rather than duplicating it.
#[derive(Debug, Clone)]
pub enum Value {
    /// The absence of a value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A 64-bit signed integer.
    Int(i64),
    /// An IEEE-754 double.
    Float(f64),
    /// An owned, UTF-8 string.
    String(String),
    /// A shared, mutable struct instance.
    Struct(Shared<StructValue>),
    /// A shared, mutable, ordered sequence of values.
    Array(Shared<Vec<Value>>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    /// Creates an empty struct instance named `name`.
    pub fn new_struct(name: impl Into<String>) -> Self {
        Value::Struct(Rc::new(RefCell::new(StructValue::new(name))))
    }

    /// Creates an array from the given elements.
    pub fn new_array(elements: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(elements)))
    }

    /// The variant tag of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::Struct(_) => ValueKind::Struct,
            Value::Array(_) => ValueKind::Array,
        }
    }

    /// True for [`Value::Int`].
    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    /// True for [`Value::Float`].
    pub fn is_float(&self) -> bool {
        matches!(self, Value::Float(_))
    }

    /// True for [`Value::String`].
    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    /// Truthiness used by conditional jumps and logical operators.
    ///
    /// `Null` and `Bool(false)` are false; numeric zero is false; the empty
    /// string is false; every other value (including empty structs and
    /// arrays) is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Struct(_) | Value::Array(_) => true,
        }
    }

    /// Coerces to `i64`, widening numeric-looking values the way the
    /// interpreter's integer-specialised opcodes require.
    pub fn as_int(&self) -> i64 {
        match self {
            Value::Int(i) => *i,
            Value::Float(f) => *f as i64,
            Value::Bool(b) => *b as i64,
            Value::String(s) => s.parse().unwrap_or(0),
            Value::Null | Value::Struct(_) | Value::Array(_) => 0,
        }
    }

    /// Coerces to `f64`.
    pub fn as_float(&self) -> f64 {
        match self {
            Value::Float(f) => *f,
            Value::Int(i) => *i as f64,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::String(s) => s.parse().unwrap_or(0.0),
            Value::Null | Value::Struct(_) | Value::Array(_) => 0.0,
        }
    }

    /// Renders the value the way `PRINT` and string coercion do: no quotes
    /// around strings, `null`/`true`/`false` spelled out in lowercase.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Coerces to an owned `String` for use as a field name, function name or
    /// struct name — the VM convention for treating non-string constants as
    /// their text form rather than faulting.
    pub fn as_string(&self) -> String {
        self.to_display_string()
    }

    /// Integer addition/subtraction/etc. applied with promotion: both
    /// operands integer keeps the result an `Int`; any `Float` promotes the
    /// whole expression to `Float`; a `+` with either operand a `String`
    /// concatenates instead.
    pub fn add(&self, other: &Value) -> Result<Value, PanicReason> {
        if self.is_string() || other.is_string() {
            return Ok(Value::String(format!(
                "{}{}",
                self.to_display_string(),
                other.to_display_string()
            )));
        }
        numeric_binop(self, other, i64::checked_add, |a, b| a + b)
    }

    /// See [`Value::add`]; no string special-case for the remaining
    /// arithmetic operators.
    pub fn sub(&self, other: &Value) -> Result<Value, PanicReason> {
        numeric_binop(self, other, i64::checked_sub, |a, b| a - b)
    }

    /// Multiplication with Int/Float promotion.
    pub fn mul(&self, other: &Value) -> Result<Value, PanicReason> {
        numeric_binop(self, other, i64::checked_mul, |a, b| a * b)
    }

    /// Division. Integer division by zero is a runtime fault; float division
    /// follows IEEE-754 (producing `inf`/`nan` rather than faulting).
    pub fn div(&self, other: &Value) -> Result<Value, PanicReason> {
        if self.is_int() && other.is_int() {
            let b = other.as_int();
            if b == 0 {
                return Err(PanicReason::DivisionByZero);
            }
            return Ok(Value::Int(self.as_int().wrapping_div(b)));
        }
        Ok(Value::Float(self.as_float() / other.as_float()))
    }

    /// Modulo, with the same by-zero behaviour as [`Value::div`].
    pub fn rem(&self, other: &Value) -> Result<Value, PanicReason> {
        if self.is_int() && other.is_int() {
            let b = other.as_int();
            if b == 0 {
                return Err(PanicReason::DivisionByZero);
            }
            return Ok(Value::Int(self.as_int().wrapping_rem(b)));
        }
        Ok(Value::Float(self.as_float() % other.as_float()))
    }

    /// Numeric negation; operates in `Float` and narrows back to `Int` when
    /// the operand was an `Int` to avoid surprising `1 -> -1.0` results.
    pub fn neg(&self) -> Value {
        match self {
            Value::Int(i) => Value::Int(-i),
            _ => Value::Float(-self.as_float()),
        }
    }

    /// Structural equality. Struct and array comparisons are by shared
    /// identity followed by deep comparison of contents, matching `==` on a
    /// reference type in most host languages.
    pub fn values_equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (Value::Array(a), Value::Array(b)) => {
                Rc::ptr_eq(a, b) || a.borrow().len() == b.borrow().len() && {
                    let (a, b) = (a.borrow(), b.borrow());
                    a.iter().zip(b.iter()).all(|(x, y)| x.values_equal(y))
                }
            }
            _ => false,
        }
    }

    /// Ordering for `< > <= >=`. Numeric pairs compare numerically; strings
    /// compare lexicographically; any other pairing is never ordered.
    pub fn partial_compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => a.partial_cmp(b),
            (a, b) if (a.is_int() || a.is_float()) && (b.is_int() || b.is_float()) => {
                a.as_float().partial_cmp(&b.as_float())
            }
            _ => None,
        }
    }
}

fn numeric_binop(
    a: &Value,
    b: &Value,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, PanicReason> {
    if a.is_int() && b.is_int() {
        let result = int_op(a.as_int(), b.as_int()).ok_or(PanicReason::ArithmeticOverflow)?;
        Ok(Value::Int(result))
    } else {
        Ok(Value::Float(float_op(a.as_float(), b.as_float())))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.values_equal(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Struct(s) => {
                let s = s.borrow();
                write!(f, "{} {{ ", s.name)?;
                for (name, value) in &s.fields {
                    write!(f, "{name}: {value}, ")?;
                }
                write!(f, "}}")
            }
            Value::Array(a) => {
                write!(f, "[")?;
                let a = a.borrow();
                for (i, value) in a.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{value}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(!Value::String(String::new()).is_truthy());
        assert!(Value::Int(1).is_truthy());
        assert!(Value::String("x".into()).is_truthy());
    }

    #[test]
    fn mixed_arithmetic_promotes_to_float() {
        let result = Value::Int(1).add(&Value::Float(2.5)).unwrap();
        assert_eq!(result, Value::Float(3.5));
    }

    #[test]
    fn string_concatenation_via_plus() {
        let result = Value::String("a".into()).add(&Value::Int(1)).unwrap();
        assert_eq!(result, Value::String("a1".into()));
    }

    #[test]
    fn integer_division_by_zero_faults() {
        assert_eq!(Value::Int(1).div(&Value::Int(0)), Err(PanicReason::DivisionByZero));
    }

    #[test]
    fn float_division_by_zero_is_infinite() {
        let result = Value::Float(1.0).div(&Value::Float(0.0)).unwrap();
        assert_eq!(result, Value::Float(f64::INFINITY));
    }

    #[test]
    fn struct_sharing_is_by_reference() {
        let a = Value::new_struct("Point");
        let b = a.clone();
        if let Value::Struct(cell) = &a {
            cell.borrow_mut().fields.insert("x".into(), Value::Int(1));
        }
        if let Value::Struct(cell) = &b {
            assert_eq!(cell.borrow().fields.get("x"), Some(&Value::Int(1)));
        } else {
            panic!("expected struct");
        }
    }
}
