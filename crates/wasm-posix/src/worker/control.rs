//! The shared control word and data buffer a worker blocks on.
//!
//! At most one blocking operation is outstanding per worker. The worker
//! arms the word (PENDING), tells the owner what it needs and waits; the
//! owner fills the buffer, stores the result length into the word with
//! Release ordering and wakes it. The worker's Acquire load of a non-pending
//! value therefore sees the buffer contents. There is no timeout.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, PoisonError};

/// Sentinel: the owner has not answered yet.
pub const PENDING: i32 = -1;

/// A single-slot wait/notify word.
#[derive(Debug)]
pub struct ControlWord {
    word: AtomicI32,
    #[cfg(not(target_os = "linux"))]
    lock: Mutex<()>,
    #[cfg(not(target_os = "linux"))]
    cond: std::sync::Condvar,
}

impl Default for ControlWord {
    fn default() -> Self {
        Self {
            word: AtomicI32::new(0),
            #[cfg(not(target_os = "linux"))]
            lock: Mutex::new(()),
            #[cfg(not(target_os = "linux"))]
            cond: std::sync::Condvar::new(),
        }
    }
}

impl ControlWord {
    /// New, not pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an operation outstanding. Must precede the request to the owner.
    pub fn arm(&self) {
        self.word.store(PENDING, Ordering::Release);
    }

    /// Whether an operation is outstanding.
    pub fn is_pending(&self) -> bool {
        self.word.load(Ordering::Acquire) == PENDING
    }

    /// Block until [`complete`](Self::complete) and return its value.
    pub fn wait(&self) -> i32 {
        loop {
            let value = self.word.load(Ordering::Acquire);
            if value != PENDING {
                return value;
            }
            self.park();
        }
    }

    /// Publish `value` (not `PENDING`) and wake the waiter.
    pub fn complete(&self, value: i32) {
        debug_assert_ne!(value, PENDING);
        #[cfg(not(target_os = "linux"))]
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.word.store(value, Ordering::Release);
        self.unpark();
    }

    #[cfg(target_os = "linux")]
    fn park(&self) {
        // Returns immediately if the word already changed (EAGAIN) and may
        // wake spuriously; the caller's loop re-checks either way.
        // SAFETY: the address is that of `self.word`, a live AtomicI32 owned
        // by `self` for the whole call, and the null timeout means no timespec
        // is read.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.word.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                PENDING,
                std::ptr::null::<libc::timespec>(),
            );
        }
    }

    #[cfg(target_os = "linux")]
    fn unpark(&self) {
        // SAFETY: FUTEX_WAKE only uses the address of `self.word`, a live
        // AtomicI32 owned by `self`, as a key; no memory is written.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.word.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                i32::MAX,
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn park(&self) {
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.word.load(Ordering::Acquire) == PENDING {
            drop(self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner));
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn unpark(&self) {
        self.cond.notify_all();
    }
}

/// The control word plus the data buffer it guards.
#[derive(Debug)]
pub struct SharedBlock {
    control: ControlWord,
    data: Mutex<Vec<u8>>,
}

impl SharedBlock {
    /// A block whose buffer holds `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            control: ControlWord::new(),
            data: Mutex::new(vec![0; capacity]),
        }
    }

    /// The control word.
    pub fn control(&self) -> &ControlWord {
        &self.control
    }

    /// Buffer capacity.
    pub fn capacity(&self) -> usize {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Change the buffer capacity. Only while nothing is pending.
    pub fn resize(&self, capacity: usize) {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(capacity, 0);
    }

    /// Owner side: copy `bytes` in (up to capacity), publish the length and
    /// wake the worker. Returns how many bytes were taken.
    pub fn publish(&self, bytes: &[u8]) -> usize {
        let n = {
            let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
            let n = bytes.len().min(data.len()).min(i32::MAX as usize);
            data[..n].copy_from_slice(&bytes[..n]);
            n
        };
        self.control.complete(n as i32);
        n
    }

    /// Worker side: the first `len` bytes of the buffer.
    pub fn take(&self, len: usize) -> Vec<u8> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data[..len.min(data.len())].to_vec()
    }
}
