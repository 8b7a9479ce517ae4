use std::{any::Any, fmt, sync::Arc};

/// A kind-specific payload carried through the IR without the IR knowing its
/// type. Only the plugin that registered a kind downcasts its payloads.
pub trait Opaque: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn dyn_eq(&self, other: &dyn Opaque) -> bool;
}

impl<T> Opaque for T
where
    T: Any + fmt::Debug + PartialEq + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn Opaque) -> bool {
        other.as_any().downcast_ref::<T>() == Some(self)
    }
}

/// A shared opaque payload that compares by value.
#[derive(Clone)]
pub struct OpaqueIr(Arc<dyn Opaque>);

impl OpaqueIr {
    pub fn new<T: Opaque>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.as_any().is::<T>()
    }
}

impl PartialEq for OpaqueIr {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.dyn_eq(other.0.as_ref())
    }
}

impl fmt::Debug for OpaqueIr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}
