//! Cooperative thread interruption.
//!
//! Every thread carries an interrupt flag. Another thread holding an
//! [`InterruptHandle`] can raise it, which also unparks the target so a
//! caller blocked in a limiter stops waiting straight away. Blocking
//! limiter calls that observe the flag give up and leave it set, so the
//! caller can see why the call failed.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::Thread;

thread_local! {
    static INTERRUPTED: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
}

/// A handle used to interrupt a specific thread.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    thread: Thread,
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    /// Handle for the calling thread.
    pub fn current() -> Self {
        INTERRUPTED.with(|flag| Self {
            thread: thread::current(),
            flag: Arc::clone(flag),
        })
    }

    /// Raise the interrupt flag and wake the thread if it is parked.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.thread.unpark();
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn thread(&self) -> &Thread {
        &self.thread
    }
}

/// Is the calling thread's interrupt flag set?
pub fn is_interrupted() -> bool {
    INTERRUPTED.with(|flag| flag.load(Ordering::SeqCst))
}

/// Read and clear the calling thread's interrupt flag.
pub fn interrupted() -> bool {
    INTERRUPTED.with(|flag| flag.swap(false, Ordering::SeqCst))
}

/// Set the calling thread's interrupt flag.
pub fn interrupt_current() {
    INTERRUPTED.with(|flag| flag.store(true, Ordering::SeqCst));
}
