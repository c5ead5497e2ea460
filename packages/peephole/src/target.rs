use std::fmt;
use std::ptr;
use std::sync::Arc;

/// Identifies a method of an owner, for example `Order#save`.
///
/// The owner is the name of a [`MethodTable`](crate::MethodTable), which plays the role of a class
/// whose methods can be replaced at runtime.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Target {
    owner: Arc<str>,
    method: Arc<str>,
}

impl Target {
    /// Creates a target from an owner name and a method name.
    #[must_use]
    pub fn new(owner: impl Into<Arc<str>>, method: impl Into<Arc<str>>) -> Self {
        Self {
            owner: owner.into(),
            method: method.into(),
        }
    }

    /// The name of the owner that defines the method.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The name of the method.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn owner_arc(&self) -> &Arc<str> {
        &self.owner
    }

    pub(crate) fn method_arc(&self) -> &Arc<str> {
        &self.method
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.owner, self.method)
    }
}

/// Identity of the receiver (`self`) of a method call.
///
/// Two receivers compare equal when they live at the same address. Zero-sized receivers
/// may therefore share an identity.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ReceiverId(usize);

impl ReceiverId {
    /// Returns the identity of the given receiver.
    #[must_use]
    pub fn of<T: ?Sized>(receiver: &T) -> Self {
        Self(ptr::from_ref(receiver).addr())
    }
}

impl fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(Target: Send, Sync);
    static_assertions::assert_impl_all!(ReceiverId: Send, Sync, Copy);

    #[test]
    fn display_joins_owner_and_method() {
        let target = Target::new("Invoice", "total");
        assert_eq!(target.to_string(), "Invoice#total");
        assert_eq!(target.owner(), "Invoice");
        assert_eq!(target.method(), "total");
    }

    #[test]
    fn receiver_identity_follows_address() {
        let first = 1_u64;
        let second = 1_u64;

        assert_eq!(ReceiverId::of(&first), ReceiverId::of(&first));
        assert_ne!(ReceiverId::of(&first), ReceiverId::of(&second));
    }
}
