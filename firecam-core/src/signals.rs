//! Per-activity 32-bit notification bitsets.
//!
//! A set bit is a promise from some producer to some consumer (`spec.md`
//! §3 "Signal bitsets"). `set` is idempotent; `wait_any`/`take` read the
//! whole word and clear it atomically, so a consumer never observes a bit
//! twice and a producer never has to know whether its bit is still pending.

use parking_lot::{Condvar, Mutex};
use std::marker::PhantomData;
use std::time::{Duration, Instant};

/// Implemented by the small per-activity enum of event kinds. Each variant
/// must map to a distinct bit position in 0..32 — derive via
/// [`signal_event`], which assigns positions in declaration order.
pub trait SignalEvent: Copy + 'static {
    fn bit_index(self) -> u32;
}

/// A snapshot of the bits observed by one `wait_any`/`take` call.
#[derive(Debug, Clone, Copy)]
pub struct SignalSet<E> {
    bits: u32,
    _marker: PhantomData<E>,
}

impl<E: SignalEvent> SignalSet<E> {
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn contains(&self, event: E) -> bool {
        self.bits & (1 << event.bit_index()) != 0
    }
}

/// Declares an event enum and implements [`SignalEvent`] for it, assigning
/// bit positions 0, 1, 2, ... in declaration order.
#[macro_export]
macro_rules! signal_event {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name { $($variant),+ }

        impl $crate::signals::SignalEvent for $name {
            fn bit_index(self) -> u32 {
                // Declaration order gives each variant its default
                // discriminant, which doubles as its bit position.
                self as u32
            }
        }
    };
}

pub struct Signals<E> {
    bits: Mutex<u32>,
    condvar: Condvar,
    _marker: PhantomData<E>,
}

impl<E: SignalEvent> Default for Signals<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: SignalEvent> Signals<E> {
    pub fn new() -> Self {
        Self {
            bits: Mutex::new(0),
            condvar: Condvar::new(),
            _marker: PhantomData,
        }
    }

    /// Set `event`'s bit. Idempotent: setting an already-set bit changes
    /// nothing. Always wakes waiters so a fresh bit is seen promptly.
    pub fn set(&self, event: E) {
        let mut bits = self.bits.lock();
        *bits |= 1 << event.bit_index();
        self.condvar.notify_all();
    }

    /// Read and clear the whole bitset without blocking.
    pub fn take(&self) -> SignalSet<E> {
        let mut bits = self.bits.lock();
        let observed = *bits;
        *bits = 0;
        SignalSet {
            bits: observed,
            _marker: PhantomData,
        }
    }

    /// Block until at least one bit is set, or `timeout` elapses, then
    /// read-and-clear. A `None` timeout waits indefinitely.
    pub fn wait_any(&self, timeout: Option<Duration>) -> SignalSet<E> {
        let mut bits = self.bits.lock();
        let deadline = timeout.map(|d| Instant::now() + d);
        while *bits == 0 {
            match deadline {
                None => self.condvar.wait(&mut bits),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let timed_out = self
                        .condvar
                        .wait_for(&mut bits, deadline - now)
                        .timed_out();
                    if timed_out {
                        break;
                    }
                }
            }
        }
        let observed = *bits;
        *bits = 0;
        SignalSet {
            bits: observed,
            _marker: PhantomData,
        }
    }
}
