//! Thin wrappers over pthread mutexes and condition variables.
//!
//! The pthread objects are boxed so their address stays fixed after
//! `pthread_*_init`, whatever happens to the owning struct.

use std::cell::UnsafeCell;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexKind {
    /// Relocking or unlocking from the wrong thread fails instead of
    /// deadlocking.
    ErrorCheck,
    Recursive,
}

impl MutexKind {
    fn as_raw(self) -> libc::c_int {
        match self {
            MutexKind::ErrorCheck => libc::PTHREAD_MUTEX_ERRORCHECK,
            MutexKind::Recursive => libc::PTHREAD_MUTEX_RECURSIVE,
        }
    }
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

pub struct NativeMutex {
    inner: Box<UnsafeCell<libc::pthread_mutex_t>>,
    kind: MutexKind,
}

// SAFETY: pthread mutexes are designed to be shared between threads; the
// box keeps the address stable.
unsafe impl Send for NativeMutex {}
unsafe impl Sync for NativeMutex {}

impl NativeMutex {
    pub fn new(kind: MutexKind) -> Self {
        let inner = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            libc::pthread_mutexattr_init(&mut attr);
            libc::pthread_mutexattr_settype(&mut attr, kind.as_raw());
            libc::pthread_mutex_init(inner.get(), &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
        }
        Self { inner, kind }
    }

    pub fn kind(&self) -> MutexKind {
        self.kind
    }

    pub fn lock(&self) -> io::Result<()> {
        check(unsafe { libc::pthread_mutex_lock(self.inner.get()) })
    }

    pub fn try_lock(&self) -> bool {
        unsafe { libc::pthread_mutex_trylock(self.inner.get()) == 0 }
    }

    /// Fails with `EPERM` when the calling thread does not hold the mutex.
    pub fn unlock(&self) -> io::Result<()> {
        check(unsafe { libc::pthread_mutex_unlock(self.inner.get()) })
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.inner.get()
    }
}

impl Drop for NativeMutex {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_destroy(self.inner.get());
        }
    }
}

impl std::fmt::Debug for NativeMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeMutex").field("kind", &self.kind).finish()
    }
}

pub struct NativeCondvar {
    inner: Box<UnsafeCell<libc::pthread_cond_t>>,
}

// SAFETY: see NativeMutex.
unsafe impl Send for NativeCondvar {}
unsafe impl Sync for NativeCondvar {}

impl NativeCondvar {
    pub fn new() -> Self {
        let inner = Box::new(UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER));
        unsafe {
            libc::pthread_cond_init(inner.get(), std::ptr::null());
        }
        Self { inner }
    }

    /// Block until signalled. Spurious wakeups are possible.
    ///
    /// # Safety
    ///
    /// The calling thread must hold `mutex` exactly once.
    pub unsafe fn wait(&self, mutex: &NativeMutex) -> io::Result<()> {
        check(libc::pthread_cond_wait(self.inner.get(), mutex.raw()))
    }

    /// Block until signalled or `timeout` elapses. Returns `false` on timeout.
    ///
    /// # Safety
    ///
    /// The calling thread must hold `mutex` exactly once.
    pub unsafe fn wait_timeout(&self, mutex: &NativeMutex, timeout: Duration) -> io::Result<bool> {
        let deadline = SystemTime::now()
            .checked_add(timeout)
            .unwrap_or_else(SystemTime::now)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let ts = libc::timespec {
            tv_sec: deadline.as_secs() as libc::time_t,
            tv_nsec: deadline.subsec_nanos() as _,
        };
        match libc::pthread_cond_timedwait(self.inner.get(), mutex.raw(), &ts) {
            0 => Ok(true),
            libc::ETIMEDOUT => Ok(false),
            rc => Err(io::Error::from_raw_os_error(rc)),
        }
    }

    pub fn signal(&self) {
        unsafe {
            libc::pthread_cond_signal(self.inner.get());
        }
    }

    pub fn broadcast(&self) {
        unsafe {
            libc::pthread_cond_broadcast(self.inner.get());
        }
    }
}

impl Default for NativeCondvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NativeCondvar {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_cond_destroy(self.inner.get());
        }
    }
}
