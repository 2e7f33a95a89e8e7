//! Field guard runtime entry
//!
//! Optimized code may specialize loads and stores on the classes observed in
//! a field. Stores that widen the guard invalidate that code.

use super::{ClassId, FieldGuard, Isolate, Value};
use crate::deopt;
use crate::diagnostics::targets;
use crate::error::{messages, Error, Result};

/// Declaring class of field `slot` of instances of `class`, and the index of
/// the field among that class's own fields
fn declaring_class(isolate: &Isolate, class: ClassId, slot: usize) -> Result<(ClassId, usize)> {
    isolate
        .classes
        .superclass_chain(class)
        .find(|c| c.field_offset <= slot && slot < c.num_fields())
        .map(|c| (c.id, slot - c.field_offset))
        .ok_or_else(|| {
            Error::internal(format!(
                "'{}' has no field slot {}",
                isolate.class_name(class),
                slot
            ))
        })
}

/// Current guard of field `slot` of instances of `class`
pub fn field_guard(isolate: &Isolate, class: ClassId, slot: usize) -> Result<FieldGuard> {
    let (owner, index) = declaring_class(isolate, class, slot)?;
    isolate
        .class(owner)?
        .field_guards
        .get(index)
        .copied()
        .ok_or_else(|| Error::internal(messages::dangling(messages::NO_SUCH_CLASS, owner)))
}

/// Record that `value` was stored into field `slot` of an instance of
/// `class`. When the guard widens, code compiled against it is invalidated.
/// Returns whether the guard changed.
pub fn update_field_cid(isolate: &mut Isolate, class: ClassId, slot: usize, value: Value) -> Result<bool> {
    let cid = isolate.class_id_of(value)?;
    let (owner, index) = declaring_class(isolate, class, slot)?;
    let changed = isolate
        .classes
        .get_mut(owner)
        .and_then(|c| c.field_guards.get_mut(index))
        .map(|guard| guard.update(cid))
        .ok_or_else(|| Error::internal(messages::dangling(messages::NO_SUCH_CLASS, owner)))?;
    if !changed {
        return Ok(false);
    }

    if isolate.flags().trace.runtime_calls {
        tracing::trace!(
            target: targets::RUNTIME_CALLS,
            class = isolate.class_name(owner),
            slot,
            cid = cid.0,
            "field guard updated"
        );
    }
    deopt::deoptimize_field_dependents(isolate, owner, slot)?;
    Ok(true)
}
