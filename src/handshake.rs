//! The three-semaphore handshake: revoke, transfer, and the per-event
//! notify workers.
//!
//! Every slot and every pending entry embeds a notify cell (notify /
//! confirm / complete semaphore plus event words). The coordinating
//! process posts *notify* with an event code set under the store lock;
//! the owning process's worker wakes, re-acquires the lock, reads the
//! event, and posts *confirm* back. A releasing or cancelling owner arms
//! the *complete* flag instead, which tells its own worker to post
//! *complete* and exit, so `release()` can join the worker through a
//! local one-shot channel without ever blocking on a thread handle.
//!
//! Confirmation waits are bounded: 10 ms non-blocking polls for up to
//! 3 s, always with the store lock dropped. A timeout is logged and the
//! operation proceeds; preemption here is cooperative, not guaranteed.

use crate::caps::{GrantEvent, ResClass};
use crate::error::Result;
use crate::layout::{ControlRegion, NotifyCell, NotifyEvent, Owner, MAX_SLOTS};
use crate::manager::Inner;
use crate::pool;
use crate::sem::ShmSem;
use crate::store::{Store, StoreGuard};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Interval between confirm polls.
pub(crate) const CONFIRM_POLL: Duration = Duration::from_millis(10);

/// Total bounded wait for a confirm (and for worker joins).
pub(crate) const CONFIRM_TIMEOUT: Duration = Duration::from_secs(3);

/// Consume any stale tokens left on a semaphore.
pub(crate) fn drain(sem: &ShmSem) {
    while sem.try_wait() {}
}

/// Poll a confirm semaphore until posted or the window closes.
fn poll_confirm(sem: &ShmSem, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if sem.try_wait() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(CONFIRM_POLL);
    }
}

/// Write a slot's owner block and clear any leftover event words so the
/// new owner's worker starts from a clean cell. Semaphore counts are left
/// alone; a stale token just cycles the worker once.
pub(crate) fn assign_slot(region: &ControlRegion, class: ResClass, slot: usize, owner: Owner) {
    let rec = region.class(class).slot(slot);
    let cell = rec.notify();
    cell.set_event(NotifyEvent::None);
    cell.set_need_confirm(false);
    rec.set_owner(owner);
}

/// Revoke the current owner of `slot`: notify it, drop the lock, wait for
/// its acknowledgement, re-acquire.
///
/// The owner block is cleared here, before the notify; the victim's
/// worker only runs the callback and confirms. Returns with the lock held
/// again whether or not the victim confirmed.
pub(crate) fn revoke<'a>(
    store: &'a Store,
    guard: StoreGuard<'a>,
    class: ResClass,
    slot: usize,
) -> Result<StoreGuard<'a>> {
    let victim = match guard.region().class(class).slot(slot).owner() {
        Some(owner) => owner,
        None => return Ok(guard),
    };
    {
        let rec = guard.region().class(class).slot(slot);
        let cell = rec.notify();
        drain(cell.confirm_sem());
        cell.set_event(NotifyEvent::Revoked);
        cell.set_need_confirm(true);
        rec.clear_owner();
        guard.region().commit();
        cell.notify_sem().post();
    }
    tracing::info!(
        %class,
        slot,
        pid = victim.pid,
        request = victim.request_id,
        priority = victim.priority,
        "revoking slot owner"
    );
    drop(guard);

    let confirmed = poll_confirm(
        store
            .region_unlocked()
            .class(class)
            .slot(slot)
            .notify()
            .confirm_sem(),
        CONFIRM_TIMEOUT,
    );
    if !confirmed {
        tracing::warn!(%class, slot, pid = victim.pid, "revocation not confirmed within the window");
    }
    store.lock()
}

/// Hand `slot` to the already-unlinked pending entry `entry`: write the
/// owner block for the transferee, notify its worker, wait for the
/// acknowledgement with the lock dropped, then return the entry to the
/// free pool whether or not the transferee confirmed. An entry the
/// re-lock sweep already reclaimed is left alone.
pub(crate) fn grant_entry<'a>(
    store: &'a Store,
    guard: StoreGuard<'a>,
    class: ResClass,
    slot: usize,
    entry: usize,
) -> Result<StoreGuard<'a>> {
    let request_id = {
        let section = guard.region().class(class);
        let req = section.entry(entry).load_request();
        assign_slot(
            guard.region(),
            class,
            slot,
            Owner {
                request_id: req.request_id,
                pid: req.pid,
                priority: req.priority,
                usage: req.usage,
            },
        );
        let cell = section.entry(entry).notify();
        drain(cell.confirm_sem());
        cell.set_event(NotifyEvent::Granted);
        cell.set_need_confirm(true);
        guard.region().commit();
        cell.notify_sem().post();
        tracing::debug!(%class, slot, request = req.request_id, pid = req.pid, "transferring slot");
        req.request_id
    };
    drop(guard);

    let confirmed = poll_confirm(
        store
            .region_unlocked()
            .class(class)
            .entry(entry)
            .notify()
            .confirm_sem(),
        CONFIRM_TIMEOUT,
    );
    let guard = store.lock()?;
    if !confirmed {
        tracing::warn!(%class, slot, entry, "transfer not confirmed within the window");
    }
    // the re-lock sweep frees the entry itself when the transferee died
    // during the window, and a peer may have recycled it since; it is
    // only ours to release while it still carries this request
    let section = guard.region().class(class);
    if section.entry(entry).in_use() && section.entry(entry).request_id() == request_id {
        pool::release(section, entry);
    }
    Ok(guard)
}

/// Pop the wait-list head of `slot` (if any) and run the grant handshake
/// for it.
pub(crate) fn transfer<'a>(
    store: &'a Store,
    guard: StoreGuard<'a>,
    class: ResClass,
    slot: usize,
) -> Result<StoreGuard<'a>> {
    match pool::pop_head(guard.region().class(class), slot) {
        Some(entry) => grant_entry(store, guard, class, slot, entry),
        None => Ok(guard),
    }
}

// ============================================================================
// Notify workers
// ============================================================================

/// What a worker listens on.
#[derive(Debug, Clone, Copy)]
pub(crate) enum WorkerTarget {
    /// A slot's cell, watched by its current owner for revocation.
    Slot { class: ResClass, slot: usize },
    /// A pending entry's cell, watched by the requester while queued.
    Entry { class: ResClass, entry: usize },
}

impl WorkerTarget {
    fn cell<'a>(&self, region: &'a ControlRegion) -> &'a NotifyCell {
        match *self {
            WorkerTarget::Slot { class, slot } => region.class(class).slot(slot).notify(),
            WorkerTarget::Entry { class, entry } => region.class(class).entry(entry).notify(),
        }
    }
}

/// Spawn the detached notify worker for one assignment or queued entry.
///
/// The returned receiver fires exactly once, when the worker exits; the
/// local grant table keeps it so `release()`/`cancel()` can join without
/// a thread handle.
pub(crate) fn spawn_worker(
    inner: Arc<Inner>,
    target: WorkerTarget,
    request_id: i32,
    token: Option<u64>,
) -> mpsc::Receiver<()> {
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        run_worker(&inner, target, request_id, token);
        let _ = done_tx.send(());
    });
    done_rx
}

fn run_worker(inner: &Arc<Inner>, target: WorkerTarget, request_id: i32, token: Option<u64>) {
    loop {
        target.cell(inner.store().region_unlocked()).notify_sem().wait();

        let guard = match inner.store().lock() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(request = request_id, error = %e, "notify worker lost the store");
                return;
            }
        };
        let cell = target.cell(guard.region());
        let event = cell.event();
        let armed = cell.complete_armed();

        match event {
            NotifyEvent::Revoked => {
                cell.set_event(NotifyEvent::None);
                let need = cell.need_confirm();
                cell.set_need_confirm(false);
                if armed {
                    cell.set_complete_armed(false);
                }
                drop(guard);
                tracing::debug!(request = request_id, "delivering revocation");
                inner.on_revoked(request_id, token);
                let cell = target.cell(inner.store().region_unlocked());
                if need {
                    cell.confirm_sem().post();
                }
                if armed {
                    cell.complete_sem().post();
                }
                return;
            }
            NotifyEvent::Granted => {
                let WorkerTarget::Entry { class, entry } = target else {
                    // grant codes belong to entry cells; ignore leftovers
                    drop(guard);
                    continue;
                };
                if guard.region().class(class).entry(entry).request_id() != request_id {
                    // the entry was recycled while this worker slept; put
                    // the token back for its rightful listener
                    drop(guard);
                    target.cell(inner.store().region_unlocked()).notify_sem().post();
                    return;
                }
                cell.set_event(NotifyEvent::None);
                let need = cell.need_confirm();
                cell.set_need_confirm(false);
                if armed {
                    cell.set_complete_armed(false);
                }
                let stored_slot = guard.region().class(class).entry(entry).target_slot();
                if !(0..MAX_SLOTS as i32).contains(&stored_slot) {
                    tracing::warn!(request = request_id, stored_slot, "granted entry names no valid slot");
                    if need {
                        cell.confirm_sem().post();
                    }
                    drop(guard);
                    if armed {
                        target.cell(inner.store().region_unlocked()).complete_sem().post();
                    }
                    return;
                }
                let slot = stored_slot as usize;
                // the granting process wrote the owner block already; all
                // that remains is local bookkeeping and the fresh slot
                // worker for future revocation
                let done = spawn_worker(
                    inner.clone(),
                    WorkerTarget::Slot { class, slot },
                    request_id,
                    token,
                );
                inner.on_granted(request_id, token, class, slot, done);
                if need {
                    cell.confirm_sem().post();
                }
                drop(guard);
                tracing::debug!(request = request_id, %class, slot, "delivering grant");
                inner.fire(request_id, token, GrantEvent::Granted);
                if armed {
                    target.cell(inner.store().region_unlocked()).complete_sem().post();
                }
                return;
            }
            NotifyEvent::None if armed => {
                // a releasing or cancelling owner is joining this worker
                cell.set_complete_armed(false);
                drop(guard);
                target.cell(inner.store().region_unlocked()).complete_sem().post();
                return;
            }
            NotifyEvent::None => {
                // stale token from an earlier occupant of this cell
                drop(guard);
            }
        }
    }
}
