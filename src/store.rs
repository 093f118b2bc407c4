//! Control-file store: mapping, locking, validation, and self-healing.
//!
//! One store instance per handle. The store owns the lock-file and
//! control-file descriptors and the shared mapping. All shared-state
//! access goes through [`StoreGuard`], which pairs a process-local mutex
//! (flock does not exclude threads sharing a process) with an exclusive
//! advisory `flock` on the lock file.
//!
//! Every acquisition revalidates the region (magic, version, length, CRC;
//! any mismatch silently resets the whole region to the configured
//! defaults) and then sweeps for dead owners: slots and pending entries
//! belonging to processes that no longer exist are reclaimed on the spot.
//! Dropping the guard recomputes the table CRC and releases the flock.

use crate::caps::ResClass;
use crate::config::{self, ArbConfig};
use crate::error::{Error, Result};
use crate::layout::{ControlRegion, MAX_PENDING, MAX_SLOTS, REGION_SIZE};
use crate::pool;
use rustix::fd::OwnedFd;
use rustix::fs::{FlockOperation, Mode, OFlags};
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};

/// Probe whether a process exists without signaling it.
///
/// `EPERM` counts as alive: the process exists but belongs to another
/// user.
pub(crate) fn process_alive(pid: u32) -> bool {
    let Some(pid) = rustix::process::Pid::from_raw(pid as i32) else {
        return false;
    };
    match rustix::process::test_kill_process(pid) {
        Ok(()) => true,
        Err(Errno::SRCH) => false,
        Err(_) => true,
    }
}

/// The mapped control file plus its lock file.
pub(crate) struct Store {
    lock_fd: OwnedFd,
    // Held so the backing file stays referenced for the mapping lifetime.
    _ctrl_fd: OwnedFd,
    ptr: NonNull<ControlRegion>,
    local: Mutex<()>,
    config: ArbConfig,
    runtime_dir: PathBuf,
}

// SAFETY: Store is Send + Sync because every field of the mapped region is
// an atomic word, mutation is serialized by the guard (local mutex +
// flock), and the futex words are safe to touch from any thread.
unsafe impl Send for Store {}
unsafe impl Sync for Store {}

impl Store {
    /// Open (creating if necessary) the lock and control files in
    /// `runtime_dir`, map the region, and run the first validation pass.
    ///
    /// The capability tables in `config` seed the region on first creation
    /// and on every corruption reset.
    pub(crate) fn open(runtime_dir: &Path, config: ArbConfig) -> Result<Self> {
        let lock_path = runtime_dir.join(config::LOCK_FILE_NAME);
        let lock_fd = rustix::fs::open(
            &lock_path,
            OFlags::RDWR | OFlags::CREATE,
            Mode::from_raw_mode(0o644),
        )
        .map_err(|e| {
            Error::StoreUnavailable(format!("lock file {}: {e}", lock_path.display()))
        })?;

        let ctrl_path = runtime_dir.join(config::CONTROL_FILE_NAME);
        let ctrl_fd = rustix::fs::open(
            &ctrl_path,
            OFlags::RDWR | OFlags::CREATE,
            Mode::from_raw_mode(0o644),
        )
        .map_err(|e| {
            Error::StoreUnavailable(format!("control file {}: {e}", ctrl_path.display()))
        })?;

        // Idempotent for peers already mapping the same region; a stale
        // file of another size gets resized and fails validation below.
        rustix::fs::ftruncate(&ctrl_fd, REGION_SIZE as u64)
            .map_err(|e| Error::StoreUnavailable(format!("sizing control file: {e}")))?;

        // SAFETY: mapping a fresh shared region of REGION_SIZE bytes from
        // a file we just sized; the fd stays open for the store lifetime.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                REGION_SIZE,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &ctrl_fd,
                0,
            )
        }
        .map_err(|e| Error::StoreUnavailable(format!("mapping control file: {e}")))?;

        let ptr = NonNull::new(ptr.cast::<ControlRegion>())
            .ok_or_else(|| Error::StoreUnavailable("mmap returned null".into()))?;

        let store = Self {
            lock_fd,
            _ctrl_fd: ctrl_fd,
            ptr,
            local: Mutex::new(()),
            config,
            runtime_dir: runtime_dir.to_path_buf(),
        };

        // First acquisition initializes or heals the region; whichever
        // process wins the creation race writes the defaults.
        tracing::debug!(dir = %store.runtime_dir.display(), "opening control store");
        drop(store.lock()?);
        Ok(store)
    }

    /// Acquire the cross-process lock, validate, and sweep dead owners.
    pub(crate) fn lock(&self) -> Result<StoreGuard<'_>> {
        let local = self.local.lock().unwrap();
        rustix::fs::flock(&self.lock_fd, FlockOperation::LockExclusive)
            .map_err(|e| Error::StoreUnavailable(format!("acquiring file lock: {e}")))?;
        let guard = StoreGuard { store: self, _local: local };
        guard.validate_and_sweep();
        Ok(guard)
    }

    /// The shared region without the lock.
    ///
    /// Only the semaphore words inside notify cells may be touched through
    /// this reference; everything else requires a [`StoreGuard`].
    pub(crate) fn region_unlocked(&self) -> &ControlRegion {
        // SAFETY: the mapping is valid for the store lifetime and every
        // field is an atomic word.
        unsafe { self.ptr.as_ref() }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // SAFETY: ptr/REGION_SIZE describe the mapping created in open();
        // nothing dereferences it after this point.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), REGION_SIZE);
        }
        // fds close when the OwnedFds drop
    }
}

/// Exclusive access to the shared region.
///
/// Dropping the guard recomputes the CRC (the last action before the
/// flock is released, so peers always observe a committed region).
pub(crate) struct StoreGuard<'a> {
    store: &'a Store,
    _local: MutexGuard<'a, ()>,
}

impl StoreGuard<'_> {
    pub(crate) fn region(&self) -> &ControlRegion {
        self.store.region_unlocked()
    }

    /// Validate-or-reset, then reclaim everything owned by dead processes.
    fn validate_and_sweep(&self) {
        let region = self.region();
        if let Err(fault) = region.check() {
            tracing::warn!(?fault, "control file failed validation, resetting to defaults");
            region.init(&self.store.config);
        }

        let mut swept = false;
        for class in ResClass::ALL {
            let section = region.class(class);
            for (idx, slot) in section.live_slots() {
                if let Some(owner) = slot.owner() {
                    if !process_alive(owner.pid) {
                        tracing::warn!(
                            %class,
                            slot = idx,
                            pid = owner.pid,
                            request = owner.request_id,
                            "reclaiming slot from dead owner"
                        );
                        slot.clear_owner();
                        swept = true;
                    }
                }
            }
            for idx in 0..MAX_PENDING {
                let entry = section.entry(idx);
                if entry.in_use() && !process_alive(entry.pid()) {
                    tracing::warn!(
                        %class,
                        entry = idx,
                        pid = entry.pid(),
                        request = entry.request_id(),
                        "dropping pending request from dead process"
                    );
                    // the target word is shared-writable outside the CRC
                    // and the entry may be mid-transfer (popped, not yet
                    // freed); unlink only what is actually chained
                    let target = entry.target_slot();
                    if (0..MAX_SLOTS as i32).contains(&target)
                        && pool::waiters(section, target as usize).any(|w| w == idx)
                    {
                        pool::unlink(section, target as usize, idx);
                    }
                    pool::release(section, idx);
                    swept = true;
                }
            }
        }
        if swept {
            region.commit();
        }
    }
}

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        self.region().commit();
        let _ = rustix::fs::flock(&self.store.lock_fd, FlockOperation::Unlock);
    }
}
