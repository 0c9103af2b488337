//! Values passed to and returned from invocations.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Object Reference
// =============================================================================

/// Opaque reference to a managed object.
///
/// Equality is identity: two references are equal only when they point at
/// the same allocation.
#[derive(Clone)]
pub struct ObjectRef(Arc<dyn Any + Send + Sync>);

impl ObjectRef {
    /// Wrap a value as a managed object.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        ObjectRef(Arc::new(value))
    }

    /// Wrap an already shared value without copying it.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        ObjectRef(value)
    }

    /// Borrow the payload as `T`, if it has that type.
    #[inline]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Recover a shared handle to the payload as `T`.
    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).downcast::<T>().ok()
    }

    /// Address of the referenced object.
    #[inline]
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Check if two references denote the same object.
    #[inline]
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        self.addr() == other.addr()
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ObjectRef {}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

// =============================================================================
// Value
// =============================================================================

/// A single argument or result slot.
///
/// Wide primitives occupy one slot here; register-pair accounting for
/// `J`/`D` only matters when sizing frames from a shorty.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// The null reference.
    #[default]
    Null,
    /// Boolean primitive.
    Bool(bool),
    /// Integral primitive (byte, char, short, int, long).
    Int(i64),
    /// Floating-point primitive (float, double).
    Double(f64),
    /// Reference to a managed object.
    Object(ObjectRef),
}

impl Value {
    /// The zeroed result slot.
    #[inline]
    pub const fn zero() -> Self {
        Value::Int(0)
    }

    /// Integral payload, if any.
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean payload, if any.
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Object payload, if any.
    #[inline]
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Check for the null reference.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if every bit of the slot is zero.
    pub fn is_zero(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(v) => !*v,
            Value::Int(v) => *v == 0,
            Value::Double(v) => v.to_bits() == 0,
            Value::Object(_) => false,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Value::Object(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ref_identity() {
        let a = ObjectRef::new(String::from("receiver"));
        let b = a.clone();
        let c = ObjectRef::new(String::from("receiver"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.downcast_ref::<String>().map(String::as_str), Some("receiver"));
        assert!(a.downcast_ref::<u32>().is_none());
    }

    #[test]
    fn test_downcast_arc_preserves_identity() {
        let shared = Arc::new(7u32);
        let obj = ObjectRef::from_arc(Arc::clone(&shared));
        let back = obj.downcast_arc::<u32>().unwrap();
        assert!(Arc::ptr_eq(&shared, &back));
    }

    #[test]
    fn test_zero_value() {
        assert!(Value::zero().is_zero());
        assert!(Value::Null.is_zero());
        assert!(!Value::Int(3).is_zero());
        assert!(!Value::Double(-0.0).is_zero());
        assert!(!Value::Object(ObjectRef::new(1u8)).is_zero());
    }
}
