//! Latest-wins command ring between the Planner and the Executor.

/// Fixed-capacity circular buffer whose reader only ever wants the newest
/// entry. One slot stays empty to tell "full" from "empty", so at most
/// `N - 1` entries are pending.
pub struct PlanRing<T: Copy, const N: usize> {
    items: [Option<T>; N],
    head: usize,
    tail: usize,
    overruns: u32,
}

/// Bookkeeping returned by [`PlanRing::push`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PushOutcome {
    /// The oldest unread entry was overwritten.
    pub overrun: bool,
    /// Unread entries after the push.
    pub depth: usize,
}

impl<T: Copy, const N: usize> PlanRing<T, N> {
    pub const fn new() -> Self {
        Self {
            items: [None; N],
            head: 0,
            tail: 0,
            overruns: 0,
        }
    }

    /// Appends `item`, dropping the oldest unread entry when full.
    pub fn push(&mut self, item: T) -> PushOutcome {
        if N == 0 {
            return PushOutcome::default();
        }
        let next = (self.head + 1) % N;
        let overrun = next == self.tail;
        if overrun {
            self.tail = (self.tail + 1) % N;
            self.overruns = self.overruns.wrapping_add(1);
        }
        self.items[self.head] = Some(item);
        self.head = next;
        PushOutcome {
            overrun,
            depth: self.depth(),
        }
    }

    /// Returns the newest entry and discards everything older.
    pub fn pop_latest(&mut self) -> Option<T> {
        if self.tail == self.head {
            return None;
        }
        let latest = if self.head == 0 { N - 1 } else { self.head - 1 };
        self.tail = self.head;
        self.items[latest]
    }

    pub fn depth(&self) -> usize {
        if self.head >= self.tail {
            self.head - self.tail
        } else {
            N - self.tail + self.head
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn overruns(&self) -> u32 {
        self.overruns
    }
}

impl<T: Copy, const N: usize> Default for PlanRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
