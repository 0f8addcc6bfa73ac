//! Correlation of long-running interactions with their completions.
//!
//! A component that hands work to the embedder (a modal, a save) registers
//! the operation here and sends the returned [`OpToken`] with the request.
//! The completion event carries the token back; `take` resolves it exactly
//! once. A completion for an unknown or already-resolved token is a logged
//! no-op, which is what makes cancelled or superseded interactions safe.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Correlation token for one in-flight operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpToken(Uuid);

impl OpToken {
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for OpToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of tokens. Production uses random UUIDs; tests swap in a
/// deterministic allocator.
pub trait TokenAllocator {
    fn allocate(&mut self) -> OpToken;
}

/// Random v4 tokens.
#[derive(Debug, Default)]
pub struct UuidAllocator;

impl TokenAllocator for UuidAllocator {
    fn allocate(&mut self) -> OpToken {
        OpToken(Uuid::new_v4())
    }
}

/// Sequential tokens for deterministic tests.
#[derive(Debug, Default)]
pub struct CountingAllocator {
    next: u128,
}

impl TokenAllocator for CountingAllocator {
    fn allocate(&mut self) -> OpToken {
        self.next += 1;
        OpToken(Uuid::from_u128(self.next))
    }
}

/// Pending operations of one kind, keyed by token.
pub struct PendingOps<T> {
    ops: HashMap<OpToken, T>,
    allocator: Box<dyn TokenAllocator>,
}

impl<T> PendingOps<T> {
    pub fn new() -> Self {
        Self::with_allocator(Box::new(UuidAllocator))
    }

    pub fn with_allocator(allocator: Box<dyn TokenAllocator>) -> Self {
        Self {
            ops: HashMap::new(),
            allocator,
        }
    }

    /// Store an operation and return the token to correlate its completion.
    pub fn register(&mut self, op: T) -> OpToken {
        let token = self.allocator.allocate();
        self.ops.insert(token, op);
        token
    }

    /// Resolve a token, removing the operation before handing it back.
    /// Unknown tokens resolve to `None`.
    pub fn take(&mut self, token: OpToken) -> Option<T> {
        let op = self.ops.remove(&token);
        if op.is_none() {
            debug!(%token, "completion for unknown or stale token ignored");
        }
        op
    }

    /// The operations still waiting for a completion.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.ops.values()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl<T> Default for PendingOps<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_take_resolves_once() {
        let mut pending: PendingOps<&str> = PendingOps::new();
        let token = pending.register("sign field 3");

        assert_eq!(pending.take(token), Some("sign field 3"));
        // Second resolution of the same token is a no-op.
        assert_eq!(pending.take(token), None);
    }

    #[test]
    fn unknown_token_is_a_no_op() {
        let mut pending: PendingOps<u32> = PendingOps::new();
        let mut other = UuidAllocator;
        assert_eq!(pending.take(other.allocate()), None);
    }

    #[test]
    fn tokens_are_distinct_across_registrations() {
        let mut pending: PendingOps<u32> = PendingOps::new();
        let first = pending.register(1);
        let second = pending.register(2);
        assert_ne!(first, second);

        assert_eq!(pending.take(second), Some(2));
        assert_eq!(pending.take(first), Some(1));
        assert!(pending.is_empty());
    }

    #[test]
    fn counting_allocator_is_deterministic() {
        let mut a = CountingAllocator::default();
        let mut b = CountingAllocator::default();
        assert_eq!(a.allocate(), b.allocate());
        assert_eq!(a.allocate(), b.allocate());
    }
}
