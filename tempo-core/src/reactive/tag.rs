//! Tag identities and the polymorphic tag interface.
//!
//! A tag is anything an opcode can be bound to: a [`Cell`](super::Cell) or a
//! [`Formula`](super::Formula). Tags are addressed by [`TagId`] everywhere in
//! the graph; handles only carry the id plus their value storage.

use std::fmt;

use super::Runtime;

/// Unique identifier for a tag.
///
/// Ids are assigned from a per-runtime counter in creation order, so
/// comparing two ids tells which tag was created first. The scheduler relies
/// on this to order derived tags deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagId(u64);

impl TagId {
    /// Get the raw id value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TagId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A value source that opcodes can be registered against.
pub trait Tag {
    /// The type produced by [`read`](Tag::read).
    type Value;

    /// Handle returned by [`downgrade`](Tag::downgrade).
    type Weak: WeakTag<Strong = Self>;

    /// The tag's identity.
    fn id(&self) -> TagId;

    /// The runtime that owns this tag.
    fn runtime(&self) -> &Runtime;

    /// Read the current value, recording a dependency if tracking is active.
    fn read(&self) -> Self::Value;

    /// A handle that does not keep the runtime alive.
    ///
    /// The graph stores these, so a runtime whose handles are all dropped is
    /// freed even while opcodes are registered.
    fn downgrade(&self) -> Self::Weak;

    /// Tear down the tag once nothing observes it any more.
    ///
    /// Called when the last opcode registered against the tag is removed.
    /// Tags without teardown keep the default no-op.
    fn destroy(&self) {}
}

/// A tag handle that does not own its runtime.
pub trait WeakTag {
    type Strong;

    /// The strong handle, or `None` once the runtime is gone.
    fn upgrade(&self) -> Option<Self::Strong>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_order_by_creation() {
        let first = TagId::from(3);
        let second = TagId::from(10);
        assert!(first < second);
        assert_eq!(second.raw(), 10);
    }

    #[test]
    fn display_is_prefixed() {
        assert_eq!(TagId::from(42).to_string(), "#42");
    }
}
