use std::sync::{Condvar, Mutex};

/// An auto-reset gate: the Rust analogue of a Win32 auto-reset event.
///
/// `signal` wakes exactly one waiter and leaves the gate closed again;
/// `wait` blocks until signaled, then closes the gate itself. Used to
/// serialize window remaps in [`super::paged::PagedRing`] against
/// whichever single reader or writer thread is using that window.
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut open = self.open.lock().unwrap();
        *open = true;
        self.cv.notify_one();
    }

    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
        *open = false;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// The four gates guarding the two sliding windows: each window has an
/// independent readable-for-remap and writable-for-remap gate so the
/// writer (which prefers window A) and the reader (which prefers
/// window B') never block on each other's window.
pub struct WindowGates {
    pub a_readable: Gate,
    pub a_writable: Gate,
    pub b_readable: Gate,
    pub b_writable: Gate,
}

impl WindowGates {
    pub fn new() -> Self {
        Self {
            a_readable: Gate::new(),
            a_writable: Gate::new(),
            b_readable: Gate::new(),
            b_writable: Gate::new(),
        }
    }
}

impl Default for WindowGates {
    fn default() -> Self {
        Self::new()
    }
}
