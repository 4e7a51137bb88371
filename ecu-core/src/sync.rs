//! Cross-context sharing primitives.
//!
//! [`Shared`] guards state touched by the interrupt path with a short
//! critical section. [`SeqLock`] publishes `Copy` snapshots from a single
//! writer to any number of readers without ever blocking the writer.

use core::cell::{RefCell, UnsafeCell};
use core::hint::spin_loop;
use core::ptr;

use critical_section::Mutex;
use portable_atomic::{AtomicU32, Ordering, fence};

/// Maximum attempts a reader makes before giving up on a snapshot.
pub const SEQLOCK_READ_RETRIES: usize = 8;

/// Value protected by a disable-interrupt critical section.
pub struct Shared<T> {
    inner: Mutex<RefCell<T>>,
}

impl<T> Shared<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(value)),
        }
    }

    /// Runs `f` with exclusive access. Keep the closure short: interrupts are
    /// masked for its whole duration.
    pub fn lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section::with(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }
}

/// Sequence-counter guarded publication slot.
///
/// Odd counter values mean a write is in progress. Only one context may call
/// [`SeqLock::publish`] for a given instance.
pub struct SeqLock<T: Copy> {
    sequence: AtomicU32,
    value: UnsafeCell<T>,
}

// Readers only ever copy the payload out and discard torn copies.
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
    pub const fn new(initial: T) -> Self {
        Self {
            sequence: AtomicU32::new(0),
            value: UnsafeCell::new(initial),
        }
    }

    /// Publishes a new snapshot. Single writer only.
    pub fn publish(&self, value: T) {
        let start = self.sequence.load(Ordering::Relaxed);
        self.sequence.store(start.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        // SAFETY: single writer; readers detect the overlap through the counter.
        unsafe { ptr::write_volatile(self.value.get(), value) };
        self.sequence.store(start.wrapping_add(2), Ordering::Release);
    }

    /// Copies the latest stable snapshot, or `None` if every retry raced a
    /// writer.
    pub fn read(&self) -> Option<T> {
        for _ in 0..SEQLOCK_READ_RETRIES {
            let before = self.sequence.load(Ordering::Acquire);
            if before & 1 != 0 {
                spin_loop();
                continue;
            }
            // SAFETY: a torn copy is discarded below when the counter moved.
            let value = unsafe { ptr::read_volatile(self.value.get()) };
            fence(Ordering::Acquire);
            let after = self.sequence.load(Ordering::Relaxed);
            if before == after {
                return Some(value);
            }
            spin_loop();
        }
        None
    }

    /// Number of completed publications.
    pub fn generation(&self) -> u32 {
        self.sequence.load(Ordering::Acquire) / 2
    }

    /// Returns `true` once at least one snapshot has been published.
    pub fn has_published(&self) -> bool {
        self.generation() != 0
    }
}
