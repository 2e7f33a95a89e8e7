//! Tagged values passed between generated code and the runtime

use super::intern::Symbol;
use crate::gc::ObjectId;

/// Smallest integer representable without boxing
pub const SMI_MIN: i64 = -(1 << 61);
/// Largest integer representable without boxing
pub const SMI_MAX: i64 = (1 << 61) - 1;

/// A tagged value. Heap values are held by handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    /// Small integer
    Smi(i64),
    /// Interned string
    Str(Symbol),
    Object(ObjectId),
}

impl Value {
    /// Whether `value` fits in a small integer
    pub fn is_smi_value(value: i64) -> bool {
        (SMI_MIN..=SMI_MAX).contains(&value)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_smi(&self) -> Option<i64> {
        match self {
            Value::Smi(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::Object(id)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
