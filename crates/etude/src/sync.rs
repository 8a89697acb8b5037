// src/sync.rs
//! Thin RAII wrappers over POSIX semaphores, mutexes and condition variables.
//!
//! Each primitive lives in its own heap allocation so it never moves after
//! `*_init` has run. Constructors report initialisation failure instead of
//! leaving a half-built object behind.

use crate::error::{SyncError, SyncResult};
use std::cell::UnsafeCell;
use std::io;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr;

/// Counting semaphore used to wake pool workers.
pub struct Flag {
    raw: Box<UnsafeCell<libc::sem_t>>,
}

unsafe impl Send for Flag {}
unsafe impl Sync for Flag {}

impl Flag {
    pub fn new() -> SyncResult<Self> {
        Self::with_count(0)
    }

    pub fn with_count(initial: u32) -> SyncResult<Self> {
        let raw = Box::new(UnsafeCell::new(unsafe { mem::zeroed::<libc::sem_t>() }));
        if unsafe { libc::sem_init(raw.get(), 0, initial) } != 0 {
            return Err(SyncError::Init {
                primitive: "semaphore",
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self { raw })
    }

    /// Block until the count is positive, then decrement it.
    pub fn wait(&self) -> SyncResult<()> {
        loop {
            if unsafe { libc::sem_wait(self.raw.get()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(SyncError::Signal { source: err });
            }
        }
    }

    /// Decrement without blocking. Returns `false` when the count was zero.
    pub fn try_wait(&self) -> bool {
        unsafe { libc::sem_trywait(self.raw.get()) == 0 }
    }

    pub fn post(&self) -> SyncResult<()> {
        if unsafe { libc::sem_post(self.raw.get()) } != 0 {
            return Err(SyncError::Signal {
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl Drop for Flag {
    fn drop(&mut self) {
        unsafe {
            libc::sem_destroy(self.raw.get());
        }
    }
}

/// Non-reentrant mutex guarding a value.
///
/// Backed by an error-checking pthread mutex: locking it twice from the same
/// thread returns `EDEADLK` instead of hanging.
pub struct Lock<T> {
    raw: Box<UnsafeCell<libc::pthread_mutex_t>>,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Lock<T> {}
unsafe impl<T: Send> Sync for Lock<T> {}

impl<T> Lock<T> {
    pub fn new(value: T) -> SyncResult<Self> {
        let raw = Box::new(UnsafeCell::new(unsafe {
            mem::zeroed::<libc::pthread_mutex_t>()
        }));

        unsafe {
            let mut attr = mem::zeroed::<libc::pthread_mutexattr_t>();
            let rc = libc::pthread_mutexattr_init(&mut attr);
            if rc != 0 {
                return Err(init_error("mutex attributes", rc));
            }
            let rc = libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_ERRORCHECK);
            if rc != 0 {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(init_error("mutex attributes", rc));
            }
            let rc = libc::pthread_mutex_init(raw.get(), &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if rc != 0 {
                return Err(init_error("mutex", rc));
            }
        }

        Ok(Self {
            raw,
            value: UnsafeCell::new(value),
        })
    }

    pub fn lock(&self) -> SyncResult<LockGuard<'_, T>> {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        if rc != 0 {
            return Err(SyncError::Lock {
                source: io::Error::from_raw_os_error(rc),
            });
        }
        Ok(LockGuard::new(self))
    }

    /// Returns `Ok(None)` when another thread holds the lock.
    pub fn try_lock(&self) -> SyncResult<Option<LockGuard<'_, T>>> {
        match unsafe { libc::pthread_mutex_trylock(self.raw.get()) } {
            0 => Ok(Some(LockGuard::new(self))),
            libc::EBUSY => Ok(None),
            rc => Err(SyncError::Lock {
                source: io::Error::from_raw_os_error(rc),
            }),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T> Drop for Lock<T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_destroy(self.raw.get());
        }
    }
}

/// Unlocks on drop. Not `Send`: a pthread mutex must be released by its owner.
pub struct LockGuard<'a, T> {
    lock: &'a Lock<T>,
    _owner: PhantomData<*const ()>,
}

impl<'a, T> LockGuard<'a, T> {
    fn new(lock: &'a Lock<T>) -> Self {
        Self {
            lock,
            _owner: PhantomData,
        }
    }
}

impl<T> Deref for LockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for LockGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.lock.raw.get());
        }
    }
}

/// Condition variable bundled with the lock it waits on.
pub struct Cond<T> {
    lock: Lock<T>,
    raw: Box<UnsafeCell<libc::pthread_cond_t>>,
}

unsafe impl<T: Send> Send for Cond<T> {}
unsafe impl<T: Send> Sync for Cond<T> {}

impl<T> Cond<T> {
    pub fn new(value: T) -> SyncResult<Self> {
        let lock = Lock::new(value)?;
        let raw = Box::new(UnsafeCell::new(unsafe {
            mem::zeroed::<libc::pthread_cond_t>()
        }));
        let rc = unsafe { libc::pthread_cond_init(raw.get(), ptr::null()) };
        if rc != 0 {
            return Err(init_error("condition variable", rc));
        }
        Ok(Self { lock, raw })
    }

    pub fn lock(&self) -> SyncResult<LockGuard<'_, T>> {
        self.lock.lock()
    }

    /// Atomically release `guard` and sleep until signalled, then re-acquire.
    ///
    /// Spurious wakeups are possible; callers re-check their predicate.
    pub fn wait<'a>(&'a self, guard: LockGuard<'a, T>) -> SyncResult<LockGuard<'a, T>> {
        if !ptr::eq(guard.lock, &self.lock) {
            return Err(SyncError::Lock {
                source: io::Error::from_raw_os_error(libc::EINVAL),
            });
        }
        let rc = unsafe { libc::pthread_cond_wait(self.raw.get(), self.lock.raw.get()) };
        if rc != 0 {
            return Err(SyncError::Signal {
                source: io::Error::from_raw_os_error(rc),
            });
        }
        Ok(guard)
    }

    pub fn signal(&self) -> SyncResult<()> {
        check_signal(unsafe { libc::pthread_cond_signal(self.raw.get()) })
    }

    pub fn broadcast(&self) -> SyncResult<()> {
        check_signal(unsafe { libc::pthread_cond_broadcast(self.raw.get()) })
    }
}

impl<T> Drop for Cond<T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_cond_destroy(self.raw.get());
        }
    }
}

fn init_error(primitive: &'static str, rc: libc::c_int) -> SyncError {
    SyncError::Init {
        primitive,
        source: io::Error::from_raw_os_error(rc),
    }
}

fn check_signal(rc: libc::c_int) -> SyncResult<()> {
    if rc != 0 {
        return Err(SyncError::Signal {
            source: io::Error::from_raw_os_error(rc),
        });
    }
    Ok(())
}
