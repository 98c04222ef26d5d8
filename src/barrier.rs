use std::ops::Range;

/// Counts successful unit completions of one stage invocation.
///
/// Each unit may complete at most once. The counter reaches its target exactly once, on the
/// completion of the last outstanding unit.
#[derive(Debug)]
pub(crate) struct CompletionCounter {
    units: Range<u64>,
    done: Vec<bool>,
    completed: u32,
}

impl CompletionCounter {
    pub fn new(units: Range<u64>) -> Self {
        let len = units.end.saturating_sub(units.start) as usize;
        Self {
            units,
            done: vec![false; len],
            completed: 0,
        }
    }

    pub fn expected(&self) -> u32 {
        self.done.len() as u32
    }

    pub fn completed(&self) -> u32 {
        self.completed
    }

    pub fn is_reached(&self) -> bool {
        self.completed == self.expected()
    }

    /// Record a successful completion of `unit`. Returns `true` if this completion reached the
    /// target.
    pub fn complete(&mut self, unit: u64) -> bool {
        assert!(
            self.units.contains(&unit),
            "unit {unit} is outside {:?}",
            self.units,
        );
        let done = &mut self.done[(unit - self.units.start) as usize];
        assert!(!*done, "unit {unit} completed twice");
        *done = true;
        self.completed += 1;
        self.is_reached()
    }
}
