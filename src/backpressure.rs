use std::collections::VecDeque;

use iocmd_bdev::Tag;

/// Units whose submission was refused with `NOMEM`, waiting for the device to free resources.
///
/// At most one io-wait registration is armed at a time. When it fires, deferred units are
/// resubmitted in FIFO order until the device is busy again.
#[derive(Debug, Default)]
pub(crate) struct Backpressure {
    deferred: VecDeque<u64>,
    armed: Option<Tag>,
}

impl Backpressure {
    pub fn is_empty(&self) -> bool {
        self.deferred.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deferred.len()
    }

    pub fn defer(&mut self, unit: u64) {
        self.deferred.push_back(unit);
    }

    /// Put back a unit popped for resubmission which was refused again. It keeps its position.
    pub fn requeue(&mut self, unit: u64) {
        self.deferred.push_front(unit);
    }

    pub fn pop(&mut self) -> Option<u64> {
        self.deferred.pop_front()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn arm(&mut self, tag: Tag) {
        assert!(self.armed.is_none(), "io-wait is already armed");
        self.armed = Some(tag);
    }

    /// Consume the registration matching `tag`. Returns `false` for an unknown or stale tag.
    pub fn fire(&mut self, tag: Tag) -> bool {
        if self.armed == Some(tag) {
            self.armed = None;
            true
        } else {
            false
        }
    }

    /// Forget all deferred units and the registration. Returns the number of dropped units.
    pub fn clear(&mut self) -> usize {
        self.armed = None;
        let n = self.deferred.len();
        self.deferred.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_with_requeue() {
        let mut bp = Backpressure::default();
        assert!(bp.is_empty());
        for unit in [3, 1, 2] {
            bp.defer(unit);
        }
        assert_eq!(bp.pop(), Some(3));
        bp.requeue(3);
        assert_eq!(bp.len(), 3);
        assert_eq!(
            std::iter::from_fn(|| bp.pop()).collect::<Vec<_>>(),
            [3, 1, 2],
        );
    }

    #[test]
    fn single_registration() {
        let mut bp = Backpressure::default();
        bp.arm(Tag(7));
        assert!(bp.is_armed());
        assert!(!bp.fire(Tag(8)));
        assert!(bp.fire(Tag(7)));
        assert!(!bp.fire(Tag(7)));
        assert!(!bp.is_armed());
    }

    #[test]
    fn clear() {
        let mut bp = Backpressure::default();
        bp.defer(0);
        bp.defer(1);
        bp.arm(Tag(1));
        assert_eq!(bp.clear(), 2);
        assert!(bp.is_empty() && !bp.is_armed());
    }

    #[test]
    #[should_panic(expected = "already armed")]
    fn double_arm() {
        let mut bp = Backpressure::default();
        bp.arm(Tag(0));
        bp.arm(Tag(0));
    }
}
