//! Locally tracked assignments
//!
//! A [`LocalAssignment`] pairs an assignment with a local epoch that is bumped
//! every time the broker sends a different target. Two assignments are equal
//! only when both the epoch and the content match, so re-receiving the same
//! target never restarts reconciliation while a changed target always does.

/// Epoch of an assignment that was never received
pub const NONE_EPOCH: i64 = -1;

/// Immutable assignment snapshot, replaced wholesale
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAssignment<A> {
    local_epoch: i64,
    assignment: A,
}

impl<A: Default> LocalAssignment<A> {
    pub fn none() -> Self {
        Self {
            local_epoch: NONE_EPOCH,
            assignment: A::default(),
        }
    }
}

impl<A: Default> Default for LocalAssignment<A> {
    fn default() -> Self {
        Self::none()
    }
}

impl<A> LocalAssignment<A> {
    pub fn new(local_epoch: i64, assignment: A) -> Self {
        Self {
            local_epoch,
            assignment,
        }
    }

    pub fn local_epoch(&self) -> i64 {
        self.local_epoch
    }

    pub fn assignment(&self) -> &A {
        &self.assignment
    }

    pub fn is_none(&self) -> bool {
        self.local_epoch == NONE_EPOCH
    }
}

impl<A: Clone + PartialEq> LocalAssignment<A> {
    /// New snapshot with a bumped epoch, or `None` when `assignment` is unchanged
    pub fn update_with(&self, assignment: &A) -> Option<Self> {
        if self.assignment == *assignment {
            return None;
        }
        Some(Self {
            local_epoch: self.local_epoch + 1,
            assignment: assignment.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_update_bumps_epoch_only_on_change() {
        let none: LocalAssignment<BTreeSet<i32>> = LocalAssignment::none();
        assert!(none.is_none());
        assert!(none.update_with(&BTreeSet::new()).is_none());

        let first = none.update_with(&BTreeSet::from([0, 1])).unwrap();
        assert_eq!(first.local_epoch(), 0);
        assert!(!first.is_none());
        assert!(first.update_with(&BTreeSet::from([0, 1])).is_none());

        let second = first.update_with(&BTreeSet::from([1])).unwrap();
        assert_eq!(second.local_epoch(), 1);
        assert_eq!(second.assignment(), &BTreeSet::from([1]));
    }

    #[test]
    fn test_equality_includes_epoch() {
        let a = LocalAssignment::new(1, vec![0]);
        let b = LocalAssignment::new(2, vec![0]);
        assert_ne!(a, b);
        assert_eq!(a, LocalAssignment::new(1, vec![0]));
    }
}
