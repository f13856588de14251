//! A cell type providing atomic load/store via a critical_section Mutex.
//!
//! Crossbeam's `AtomicCell` falls back to locks on targets without CAS
//! (e.g. thumbv6m), so a critical-section based cell is used instead. The
//! receive path of the stack runs in interrupt context on bare-metal
//! targets, and every value it shares with the polling context goes through
//! one of these.

use core::{cell::Cell, ops::Add};
use critical_section::Mutex;

/// A container allowing atomic access to the contained value
#[derive(Debug)]
pub struct AtomicCell<T: Copy> {
    inner: Mutex<Cell<T>>,
}

impl<T: Send + Copy> AtomicCell<T> {
    /// Create a new AtomicCell holding `value`
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Cell::new(value)),
        }
    }

    /// Read the contained value
    pub fn load(&self) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).get())
    }

    /// Replace the contained value
    pub fn store(&self, value: T) {
        critical_section::with(|cs| self.inner.borrow(cs).set(value));
    }
}

impl<T: Send + Copy + Default> AtomicCell<T> {
    /// Return the contained value, leaving the default in its place
    pub fn take(&self) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).take())
    }
}

impl<T: Copy + Add<Output = T>> AtomicCell<T> {
    /// Atomically add `value` to the contained value, returning the previous one
    pub fn fetch_add(&self, value: T) -> T {
        critical_section::with(|cs| {
            let old_value = self.inner.borrow(cs).get();
            self.inner.borrow(cs).set(old_value + value);
            old_value
        })
    }
}

impl<T: Default + Copy + Send> Default for AtomicCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
