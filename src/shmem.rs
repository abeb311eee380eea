//! Shared termination region: lifecycle flags visible across `fork`.
//!
//! The region is an anonymous shared mapping created before any fork so
//! every descendant observes the same cells. Structure is fixed after
//! initialisation; only the cell values change.

use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use nix::unistd::{self, Pid};

/// Bump allocator over an anonymous shared mapping.
///
/// The mapping is intentionally never unmapped: forked workers keep using it
/// for the whole process lifetime.
pub struct SharedMemory {
    base: *mut u8,
    size: usize,
    offset: usize,
}

// Raw pointers into a shared mapping; access discipline is atomics plus the
// terminator's interprocess mutex.
unsafe impl Send for SharedMemory {}

impl SharedMemory {
    /// Maps an anonymous shared region of at least `size` bytes (rounded up
    /// to the page size).
    pub fn new(size: usize) -> io::Result<Self> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page = if page > 0 { page as usize } else { 4096 };
        let size = size.div_ceil(page) * page;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            base: base.cast(),
            size,
            offset: 0,
        })
    }

    /// Reserves space for `count` values of `T`, aligning the cursor to
    /// `align_of::<T>()` first. Panics when the region is exhausted; the
    /// region is sized at construction for everything that lives in it.
    pub fn alloc<T>(&mut self, count: usize) -> *mut T {
        let align = mem::align_of::<T>();
        let misalign = self.offset % align;
        if misalign != 0 {
            self.offset += align - misalign;
        }

        let bytes = mem::size_of::<T>() * count;
        assert!(
            self.offset + bytes <= self.size,
            "shared memory region exhausted ({} + {} > {})",
            self.offset,
            bytes,
            self.size
        );

        let data = unsafe { self.base.add(self.offset) };
        self.offset += bytes;
        data.cast()
    }
}

/// The three cross-process event cells.
pub struct SharedFlags {
    terminated: &'static AtomicBool,
    log_rotate_event: &'static AtomicU64,
    stat_event: &'static AtomicU64,
}

impl SharedFlags {
    /// Constructs the cells in place inside `mem`.
    pub(crate) fn create(mem: &mut SharedMemory) -> Self {
        unsafe {
            let terminated = mem.alloc::<AtomicBool>(1);
            terminated.write(AtomicBool::new(false));
            let log_rotate_event = mem.alloc::<AtomicU64>(1);
            log_rotate_event.write(AtomicU64::new(0));
            let stat_event = mem.alloc::<AtomicU64>(1);
            stat_event.write(AtomicU64::new(0));

            Self {
                terminated: &*terminated,
                log_rotate_event: &*log_rotate_event,
                stat_event: &*stat_event,
            }
        }
    }

    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn set_terminated(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    /// Current log-rotate counter; monotonically increasing.
    pub fn log_rotate_event(&self) -> u64 {
        self.log_rotate_event.load(Ordering::SeqCst)
    }

    pub fn bump_log_rotate(&self) {
        self.log_rotate_event.fetch_add(1, Ordering::SeqCst);
    }

    /// Current statistics counter; monotonically increasing.
    pub fn stat_event(&self) -> u64 {
        self.stat_event.load(Ordering::SeqCst)
    }

    pub fn bump_stat(&self) {
        self.stat_event.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fixed-size set of pids that participate in *global* termination,
/// protected by a process-shared pthread mutex living in the same mapping.
pub struct Terminator {
    lock: *mut libc::pthread_mutex_t,
    pids: *mut libc::pid_t,
    len: usize,
}

unsafe impl Send for Terminator {}

impl Terminator {
    /// Reserves and initialises the mutex and `slots` pid cells.
    pub(crate) fn create(mem: &mut SharedMemory, slots: usize) -> io::Result<Self> {
        let lock = mem.alloc::<libc::pthread_mutex_t>(1);
        let pids = mem.alloc::<libc::pid_t>(slots);

        unsafe {
            let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
            if libc::pthread_mutexattr_init(&mut attr) != 0 {
                return Err(io::Error::last_os_error());
            }
            libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            let rc = libc::pthread_mutex_init(lock, &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }

            for slot in 0..slots {
                pids.add(slot).write(0);
            }
        }

        Ok(Self {
            lock,
            pids,
            len: slots,
        })
    }

    /// Inserts `pid` (self when `None`) into the first empty slot.
    /// Idempotent when already present; returns false when the set is full.
    pub fn add(&self, pid: Option<Pid>) -> bool {
        let pid = pid.unwrap_or_else(unistd::getpid).as_raw();
        self.locked(|slots| {
            if slots.iter().any(|p| *p == pid) {
                return true;
            }
            for slot in slots.iter_mut() {
                if *slot == 0 {
                    *slot = pid;
                    return true;
                }
            }
            false
        })
    }

    /// Clears the slot holding `pid` (self when `None`).
    pub fn remove(&self, pid: Option<Pid>) {
        let pid = pid.unwrap_or_else(unistd::getpid).as_raw();
        self.locked(|slots| {
            for slot in slots.iter_mut() {
                if *slot == pid {
                    *slot = 0;
                }
            }
        });
    }

    /// True iff the current pid is in the set.
    pub fn find_self(&self) -> bool {
        let pid = unistd::getpid().as_raw();
        self.locked(|slots| slots.iter().any(|p| *p == pid))
    }

    fn locked<R>(&self, body: impl FnOnce(&mut [libc::pid_t]) -> R) -> R {
        unsafe {
            libc::pthread_mutex_lock(self.lock);
            let slots = std::slice::from_raw_parts_mut(self.pids, self.len);
            let result = body(slots);
            libc::pthread_mutex_unlock(self.lock);
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_respects_alignment() {
        let mut mem = SharedMemory::new(256).expect("map region");
        let byte = mem.alloc::<u8>(1);
        unsafe { byte.write(7) };
        let word = mem.alloc::<u64>(1);
        assert_eq!(word as usize % mem::align_of::<u64>(), 0);
        unsafe { word.write(42) };
        assert_eq!(unsafe { byte.read() }, 7);
        assert_eq!(unsafe { word.read() }, 42);
    }

    #[test]
    fn flags_are_monotonic() {
        let mut mem = SharedMemory::new(4096).expect("map region");
        let flags = SharedFlags::create(&mut mem);

        assert!(!flags.terminated());
        assert_eq!(flags.log_rotate_event(), 0);

        flags.bump_log_rotate();
        flags.bump_log_rotate();
        flags.bump_stat();
        assert_eq!(flags.log_rotate_event(), 2);
        assert_eq!(flags.stat_event(), 1);

        flags.set_terminated();
        assert!(flags.terminated());
    }

    #[test]
    fn terminator_add_remove_find() {
        let mut mem = SharedMemory::new(4096).expect("map region");
        let terminator = Terminator::create(&mut mem, 4).expect("init terminator");

        assert!(!terminator.find_self());
        assert!(terminator.add(None));
        assert!(terminator.add(None), "add is idempotent");
        assert!(terminator.find_self());

        terminator.remove(None);
        assert!(!terminator.find_self());
    }

    #[test]
    fn terminator_full_set_rejects() {
        let mut mem = SharedMemory::new(4096).expect("map region");
        let terminator = Terminator::create(&mut mem, 2).expect("init terminator");

        assert!(terminator.add(Some(Pid::from_raw(11))));
        assert!(terminator.add(Some(Pid::from_raw(12))));
        assert!(!terminator.add(Some(Pid::from_raw(13))));

        terminator.remove(Some(Pid::from_raw(11)));
        assert!(terminator.add(Some(Pid::from_raw(13))));
    }
}
