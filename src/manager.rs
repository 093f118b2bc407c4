//! The arbiter handle and the public request API.
//!
//! A [`ResMgr`] is an explicit, cloneable handle; every cooperating
//! process opens its own against the same runtime directory. All
//! cross-process state lives in the mapped control file; the handle adds
//! the process-local side: the callback registry (tokens are only ever
//! resolved by the process that issued them), the table of live grants,
//! and the queued requests awaiting a transfer.
//!
//! Request lifecycle: `request()` runs the admission engine under the
//! store lock and either assigns a slot immediately, queues a pool entry
//! (asynchronous callers only), or denies. Preemption notifies the
//! current owner through the slot handshake; the preempting requester
//! queues first so the freed slot reaches it through the ordinary
//! transfer path, after the victim's revoked callback has run.

use crate::admission::{self, AdmissionRequest, Placement};
use crate::caps::{EventFn, GrantEvent, RequestId, RequestSpec, ResClass, SizeLimit, SlotCaps, UsageFlags};
use crate::config::{self, ArbConfig};
use crate::dump;
use crate::error::{Error, Result};
use crate::handshake::{self, WorkerTarget, CONFIRM_TIMEOUT};
use crate::layout::{Owner, QueuedRequest, MAX_PENDING, MAX_SLOTS, NONE_INDEX};
use crate::pool;
use crate::store::{Store, StoreGuard};
use crate::table::{self, StateSnapshot};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

/// Retries when a revoked slot is re-owned before we can take it.
const PREEMPT_ATTEMPTS: usize = 3;

/// Outcome of [`ResMgr::request`].
#[derive(Debug)]
pub enum RequestOutcome {
    /// A slot was assigned on the spot.
    Granted {
        /// Id under which the grant is tracked.
        id: RequestId,
        /// Capabilities of the backing slot.
        caps: SlotCaps,
    },
    /// The request is queued; the grant arrives through the callback.
    Queued {
        /// Id under which the queued request is tracked.
        id: RequestId,
    },
    /// No eligible slot and no way to wait for one.
    Denied,
}

/// A live grant, tracked only in the owning process.
struct Grant {
    class: ResClass,
    slot: usize,
    token: Option<u64>,
    done: mpsc::Receiver<()>,
}

/// A queued request, tracked only in the originating process.
struct PendingLocal {
    class: ResClass,
    token: u64,
    done: mpsc::Receiver<()>,
}

/// Shared core behind a handle; notify workers hold an `Arc` to it, which
/// also keeps the mapping alive for as long as any worker runs.
pub(crate) struct Inner {
    store: Store,
    callbacks: Mutex<HashMap<u64, Arc<Mutex<EventFn>>>>,
    grants: Mutex<HashMap<i32, Grant>>,
    pending: Mutex<HashMap<i32, PendingLocal>>,
    next_token: AtomicU64,
}

impl Inner {
    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    fn register_callback(&self, callback: EventFn) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .unwrap()
            .insert(token, Arc::new(Mutex::new(callback)));
        token
    }

    fn remove_callback(&self, token: u64) {
        self.callbacks.lock().unwrap().remove(&token);
    }

    /// Invoke a registered callback. Runs on a worker thread with no
    /// store lock held; the callback may re-enter the public API.
    pub(crate) fn fire(&self, request_id: i32, token: Option<u64>, event: GrantEvent) {
        let Some(token) = token else { return };
        let callback = self.callbacks.lock().unwrap().get(&token).cloned();
        if let Some(callback) = callback {
            let mut callback = callback.lock().unwrap();
            (*callback)(RequestId(request_id), event);
        }
    }

    /// Worker-side revocation bookkeeping: forget the grant, deliver the
    /// event, retire the token.
    pub(crate) fn on_revoked(&self, request_id: i32, token: Option<u64>) {
        if self.grants.lock().unwrap().remove(&request_id).is_some() {
            tracing::info!(request = request_id, "slot revoked by a competing request");
        }
        self.fire(request_id, token, GrantEvent::Revoked);
        if let Some(token) = token {
            self.remove_callback(token);
        }
    }

    /// Worker-side grant bookkeeping: the queued request became an owner.
    /// Called with the store lock held.
    pub(crate) fn on_granted(
        &self,
        request_id: i32,
        token: Option<u64>,
        class: ResClass,
        slot: usize,
        done: mpsc::Receiver<()>,
    ) {
        self.pending.lock().unwrap().remove(&request_id);
        self.grants
            .lock()
            .unwrap()
            .insert(request_id, Grant { class, slot, token, done });
    }
}

/// Field updated by `set_priority`/`set_usage`.
enum Update {
    Priority(u32),
    Usage(UsageFlags),
}

/// Handle to the cross-process resource arbiter.
///
/// Cloning shares the underlying store and registries. Dropping the last
/// handle abandons any still-held grants until the process exits, at
/// which point peers reclaim them through the dead-owner sweep.
#[derive(Clone)]
pub struct ResMgr {
    inner: Arc<Inner>,
}

impl ResMgr {
    /// Open against the environment-configured runtime directory, with
    /// capability tables from the declaration file (or built-in
    /// defaults).
    pub fn open() -> Result<Self> {
        let dir = config::runtime_dir()?;
        Self::open_with(&dir, ArbConfig::load())
    }

    /// Open against an explicit runtime directory and configuration.
    pub fn open_with(runtime_dir: &Path, config: ArbConfig) -> Result<Self> {
        let store = Store::open(runtime_dir, config)?;
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                callbacks: Mutex::new(HashMap::new()),
                grants: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
            }),
        })
    }

    // ------------------------------------------------------------------
    // Request entry points
    // ------------------------------------------------------------------

    /// Ask for a slot of `spec.class`.
    ///
    /// A callback makes the request asynchronous: it may be queued, and
    /// it will be notified of a later revocation. Without one the request
    /// either succeeds immediately (revoking a lower-priority owner if
    /// necessary) or is denied.
    pub fn request(&self, spec: RequestSpec, callback: Option<EventFn>) -> Result<RequestOutcome> {
        if spec.priority == 0 {
            return Err(Error::BadArgument("priority must be nonzero".into()));
        }
        if spec.usage.bits() & !spec.class.valid_usage().bits() != 0 {
            return Err(Error::BadArgument(format!(
                "usage {:#x} not valid for {}",
                spec.usage.bits(),
                spec.class
            )));
        }
        if let Some(size) = spec.max_size {
            if spec.class != ResClass::Video {
                return Err(Error::BadArgument(
                    "size limits only apply to video requests".into(),
                ));
            }
            // the queued copy is stored in i32 words; anything wider would
            // read back as unconstrained
            if size.width > i32::MAX as u32 || size.height > i32::MAX as u32 {
                return Err(Error::BadArgument(format!(
                    "size limit {}x{} out of range",
                    size.width, size.height
                )));
            }
        }

        let token = callback.map(|cb| self.inner.register_callback(cb));
        let outcome = self.request_inner(&spec, token);
        if let (Some(token), Ok(RequestOutcome::Denied) | Err(_)) = (token, &outcome) {
            self.inner.remove_callback(token);
        }
        outcome
    }

    fn request_inner(&self, spec: &RequestSpec, token: Option<u64>) -> Result<RequestOutcome> {
        let inner = &self.inner;
        let class = spec.class;
        let mut guard = inner.store.lock()?;
        let id = guard.region().header().alloc_request_id();
        let tie = guard.region().header().requester_wins_tie();
        let areq = AdmissionRequest {
            priority: spec.priority,
            usage: spec.usage.bits(),
            max_size: spec.max_size,
        };

        for attempt in 0..PREEMPT_ATTEMPTS {
            let placement = admission::find_suitable(guard.region().class(class), &areq, tie);
            match placement {
                Placement::Assign { slot } => {
                    return Ok(self.grant_local(guard, class, slot, id, spec, token));
                }
                Placement::Preempt { slot, victim } => {
                    if let Some(token) = token {
                        // queue first: the freed slot flows to the head
                        // waiter through the transfer handshake
                        if self.enqueue_pending(&guard, class, slot, id, spec, token).is_none() {
                            tracing::debug!(%class, request = id, "pending pool exhausted");
                            return Ok(RequestOutcome::Denied);
                        }
                        guard = handshake::revoke(&inner.store, guard, class, slot)?;
                        if guard.region().class(class).slot(slot).owner().is_none() {
                            guard = handshake::transfer(&inner.store, guard, class, slot)?;
                        }
                        drop(guard);
                        return Ok(RequestOutcome::Queued { id: RequestId(id) });
                    }
                    // synchronous caller: take the slot directly
                    tracing::debug!(%class, slot, victim = victim.request_id, "preempting synchronously");
                    guard = handshake::revoke(&inner.store, guard, class, slot)?;
                    if guard.region().class(class).slot(slot).owner().is_none() {
                        return Ok(self.grant_local(guard, class, slot, id, spec, token));
                    }
                    tracing::debug!(attempt, slot, "slot re-owned during revocation, retrying");
                }
                Placement::Queue { slot } => {
                    let Some(token) = token else {
                        return Ok(RequestOutcome::Denied);
                    };
                    if self.enqueue_pending(&guard, class, slot, id, spec, token).is_none() {
                        tracing::debug!(%class, request = id, "pending pool exhausted");
                        return Ok(RequestOutcome::Denied);
                    }
                    drop(guard);
                    return Ok(RequestOutcome::Queued { id: RequestId(id) });
                }
                Placement::Deny => return Ok(RequestOutcome::Denied),
            }
        }
        Ok(RequestOutcome::Denied)
    }

    /// Write the owner block for this process and register the grant.
    fn grant_local(
        &self,
        guard: StoreGuard<'_>,
        class: ResClass,
        slot: usize,
        id: i32,
        spec: &RequestSpec,
        token: Option<u64>,
    ) -> RequestOutcome {
        handshake::assign_slot(
            guard.region(),
            class,
            slot,
            Owner {
                request_id: id,
                pid: std::process::id(),
                priority: spec.priority,
                usage: spec.usage.bits(),
            },
        );
        let caps = guard.region().class(class).slot(slot).caps();
        let done = handshake::spawn_worker(
            self.inner.clone(),
            WorkerTarget::Slot { class, slot },
            id,
            token,
        );
        self.inner
            .grants
            .lock()
            .unwrap()
            .insert(id, Grant { class, slot, token, done });
        drop(guard);
        tracing::info!(%class, slot, request = id, priority = spec.priority, "assigned slot");
        RequestOutcome::Granted { id: RequestId(id), caps }
    }

    /// Allocate, fill, and link a pool entry; spawn its worker.
    /// `None` means the pool is exhausted.
    fn enqueue_pending(
        &self,
        guard: &StoreGuard<'_>,
        class: ResClass,
        slot: usize,
        id: i32,
        spec: &RequestSpec,
        token: u64,
    ) -> Option<usize> {
        let section = guard.region().class(class);
        let entry = pool::acquire(section)?;
        let (max_width, max_height) = spec
            .max_size
            .map_or((NONE_INDEX, NONE_INDEX), |s| (s.width as i32, s.height as i32));
        section.entry(entry).store_request(&QueuedRequest {
            request_id: id,
            class_code: class.index() as u32,
            usage: spec.usage.bits(),
            priority: spec.priority,
            max_width,
            max_height,
            pid: std::process::id(),
            target_slot: slot as i32,
            token,
        });
        pool::insert_by_priority(section, slot, entry);
        let done = handshake::spawn_worker(
            self.inner.clone(),
            WorkerTarget::Entry { class, entry },
            id,
            Some(token),
        );
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(id, PendingLocal { class, token, done });
        tracing::debug!(%class, slot, entry, request = id, priority = spec.priority, "queued request");
        Some(entry)
    }

    /// Give a granted slot back.
    ///
    /// Only the recorded owner is affected: a stale or foreign id is a
    /// silent no-op. A queued-but-ungranted id is cancelled instead. The
    /// worker join runs before the slot frees, so no peer can be assigned
    /// the slot while its previous worker still listens on its cell.
    pub fn release(&self, class: ResClass, id: RequestId) -> Result<()> {
        if let Some(pending_class) = self.pending_class_of(id) {
            if pending_class != class {
                return Err(type_mismatch(class, pending_class, id));
            }
            return self.cancel(class, id);
        }
        match self.grant_class_of(id) {
            None => {
                tracing::debug!(request = id.raw(), "release of unknown id ignored");
                return Ok(());
            }
            Some(granted) if granted != class => {
                return Err(type_mismatch(class, granted, id));
            }
            Some(_) => {}
        }

        let inner = &self.inner;
        let guard = inner.store.lock()?;
        let Some(grant) = inner.grants.lock().unwrap().remove(&id.raw()) else {
            // revoked between the check above and taking the lock
            return Ok(());
        };
        let me = std::process::id();
        let owned = {
            let rec = guard.region().class(class).slot(grant.slot);
            rec.owner().map_or(false, |o| o.request_id == id.raw() && o.pid == me)
        };
        if !owned {
            drop(guard);
            if let Some(token) = grant.token {
                inner.remove_callback(token);
            }
            return Ok(());
        }

        // join the slot worker
        {
            let cell = guard.region().class(class).slot(grant.slot).notify();
            cell.set_complete_armed(true);
            cell.notify_sem().post();
        }
        drop(guard);
        if grant.done.recv_timeout(CONFIRM_TIMEOUT).is_err() {
            tracing::warn!(request = id.raw(), "notify worker did not exit within the join window");
        }

        let mut guard = inner.store.lock()?;
        let still_mine = {
            let rec = guard.region().class(class).slot(grant.slot);
            let cell = rec.notify();
            cell.set_complete_armed(false);
            handshake::drain(cell.complete_sem());
            let mine = rec.owner().map_or(false, |o| o.request_id == id.raw() && o.pid == me);
            if mine {
                rec.clear_owner();
            }
            mine
        };
        if still_mine {
            tracing::info!(%class, slot = grant.slot, request = id.raw(), "released slot");
            guard = handshake::transfer(&inner.store, guard, class, grant.slot)?;
        }
        drop(guard);
        if let Some(token) = grant.token {
            inner.remove_callback(token);
        }
        Ok(())
    }

    /// Withdraw a queued request; for a granted id this is `release`.
    pub fn cancel(&self, class: ResClass, id: RequestId) -> Result<()> {
        if let Some(granted) = self.grant_class_of(id) {
            if granted != class {
                return Err(type_mismatch(class, granted, id));
            }
            return self.release(class, id);
        }

        let inner = &self.inner;
        let guard = inner.store.lock()?;
        match self.pending_class_of(id) {
            None => {
                tracing::debug!(request = id.raw(), "cancel of unknown id ignored");
                return Ok(());
            }
            Some(pending_class) if pending_class != class => {
                return Err(type_mismatch(class, pending_class, id));
            }
            Some(_) => {}
        }
        let section = guard.region().class(class);
        let Some(entry) = pool::find_queued(section, id.raw()) else {
            // a corruption reset discarded the pool; forget it locally
            tracing::warn!(request = id.raw(), "queued entry vanished from the pool");
            let local = inner.pending.lock().unwrap().remove(&id.raw());
            drop(guard);
            if let Some(local) = local {
                inner.remove_callback(local.token);
            }
            return Ok(());
        };
        let target = section.entry(entry).target_slot();
        let linked = (0..MAX_SLOTS as i32).contains(&target)
            && pool::waiters(section, target as usize).any(|idx| idx == entry);
        if !linked {
            // mid-transfer: the grant callback is about to fire and the
            // caller can release normally afterwards
            tracing::debug!(request = id.raw(), "cancel raced a transfer, letting the grant land");
            return Ok(());
        }

        pool::unlink(section, target as usize, entry);
        let local = inner.pending.lock().unwrap().remove(&id.raw());
        {
            let cell = section.entry(entry).notify();
            cell.set_complete_armed(true);
            cell.notify_sem().post();
        }
        drop(guard);
        if let Some(local) = &local {
            if local.done.recv_timeout(CONFIRM_TIMEOUT).is_err() {
                tracing::warn!(request = id.raw(), "entry worker did not exit within the join window");
            }
        }

        let guard = inner.store.lock()?;
        {
            let section = guard.region().class(class);
            let cell = section.entry(entry).notify();
            cell.set_complete_armed(false);
            handshake::drain(cell.complete_sem());
            pool::release(section, entry);
        }
        drop(guard);
        if let Some(local) = local {
            inner.remove_callback(local.token);
        }
        tracing::info!(%class, request = id.raw(), "cancelled pending request");
        Ok(())
    }

    /// Raise or lower a request's priority; may reorder its queue
    /// position, grant it, or cost the caller its own slot.
    pub fn set_priority(&self, class: ResClass, id: RequestId, priority: u32) -> Result<()> {
        if priority == 0 {
            return Err(Error::BadArgument("priority must be nonzero".into()));
        }
        self.update_request(class, id, Update::Priority(priority))
    }

    /// Change a request's declared usage; same consequences as
    /// [`ResMgr::set_priority`].
    pub fn set_usage(&self, class: ResClass, id: RequestId, usage: UsageFlags) -> Result<()> {
        if usage.bits() & !class.valid_usage().bits() != 0 {
            return Err(Error::BadArgument(format!(
                "usage {:#x} not valid for {}",
                usage.bits(),
                class
            )));
        }
        self.update_request(class, id, Update::Usage(usage))
    }

    fn update_request(&self, class: ResClass, id: RequestId, update: Update) -> Result<()> {
        let inner = &self.inner;

        // owned slot: rewrite the owner block, then check whether the
        // head waiter now outranks us
        if let Some((granted, slot)) = self.grant_slot_of(id) {
            if granted != class {
                return Err(type_mismatch(class, granted, id));
            }
            let mut guard = inner.store.lock()?;
            let me = std::process::id();
            let Some(owner) = guard.region().class(class).slot(slot).owner() else {
                return Ok(());
            };
            if owner.request_id != id.raw() || owner.pid != me {
                return Ok(());
            }
            let updated = match update {
                Update::Priority(priority) => Owner { priority, ..owner },
                Update::Usage(usage) => Owner { usage: usage.bits(), ..owner },
            };
            guard.region().class(class).slot(slot).set_owner(updated);
            tracing::info!(%class, slot, request = id.raw(), priority = updated.priority,
                usage = updated.usage, "updated owner terms");

            let tie = guard.region().header().requester_wins_tie();
            let head_wins = {
                let rec = guard.region().class(class).slot(slot);
                match usize::try_from(rec.pending_head()).ok().filter(|&h| h < MAX_PENDING) {
                    Some(head) => {
                        let waiter = guard.region().class(class).entry(head).load_request();
                        waiter.priority > updated.priority
                            || (waiter.priority == updated.priority
                                && tie
                                && waiter.usage == updated.usage)
                    }
                    None => false,
                }
            };
            if head_wins {
                tracing::info!(%class, slot, request = id.raw(), "waiter outranks updated owner, revoking");
                guard = handshake::revoke(&inner.store, guard, class, slot)?;
                if guard.region().class(class).slot(slot).owner().is_none() {
                    guard = handshake::transfer(&inner.store, guard, class, slot)?;
                }
            }
            drop(guard);
            return Ok(());
        }

        // queued entry: update the stored copy and re-place it
        let Some(pending_class) = self.pending_class_of(id) else {
            return Err(Error::BadArgument(format!("unknown request id {}", id.raw())));
        };
        if pending_class != class {
            return Err(type_mismatch(class, pending_class, id));
        }
        let mut guard = inner.store.lock()?;
        let (entry, old_target, linked) = {
            let section = guard.region().class(class);
            let Some(entry) = pool::find_queued(section, id.raw()) else {
                tracing::warn!(request = id.raw(), "queued entry vanished from the pool");
                return Ok(());
            };
            match update {
                Update::Priority(priority) => section.entry(entry).set_priority(priority),
                Update::Usage(usage) => section.entry(entry).set_usage(usage.bits()),
            }
            let target = section.entry(entry).target_slot();
            let linked = (0..MAX_SLOTS as i32).contains(&target)
                && pool::waiters(section, target as usize).any(|idx| idx == entry);
            (entry, target, linked)
        };
        if !linked {
            // mid-transfer; the grant lands under the old terms
            drop(guard);
            return Ok(());
        }

        let placement = {
            let section = guard.region().class(class);
            pool::unlink(section, old_target as usize, entry);
            let req = section.entry(entry).load_request();
            let areq = AdmissionRequest {
                priority: req.priority,
                usage: req.usage,
                max_size: (req.max_width >= 0 && req.max_height >= 0)
                    .then(|| SizeLimit::new(req.max_width as u32, req.max_height as u32)),
            };
            let tie = guard.region().header().requester_wins_tie();
            admission::find_suitable(section, &areq, tie)
        };
        match placement {
            Placement::Assign { slot } => {
                tracing::debug!(%class, slot, request = id.raw(), "updated request is now assignable");
                guard = handshake::grant_entry(&inner.store, guard, class, slot, entry)?;
            }
            Placement::Preempt { slot, .. } => {
                pool::insert_by_priority(guard.region().class(class), slot, entry);
                guard = handshake::revoke(&inner.store, guard, class, slot)?;
                if guard.region().class(class).slot(slot).owner().is_none() {
                    guard = handshake::transfer(&inner.store, guard, class, slot)?;
                }
            }
            Placement::Queue { slot } => {
                pool::insert_by_priority(guard.region().class(class), slot, entry);
            }
            Placement::Deny => {
                // nothing better; keep waiting where it was
                pool::insert_by_priority(guard.region().class(class), old_target as usize, entry);
            }
        }
        drop(guard);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Number of live slots in a class.
    pub fn slot_count(&self, class: ResClass) -> Result<usize> {
        let guard = self.inner.store.lock()?;
        Ok(guard.region().class(class).slot_count())
    }

    /// Capabilities of one slot.
    pub fn slot_caps(&self, class: ResClass, slot: usize) -> Result<SlotCaps> {
        let guard = self.inner.store.lock()?;
        let section = guard.region().class(class);
        if slot >= section.slot_count() {
            return Err(Error::BadArgument(format!("{class} has no slot {slot}")));
        }
        Ok(section.slot(slot).caps())
    }

    /// Owner of one slot, if any.
    pub fn owner_of(&self, class: ResClass, slot: usize) -> Result<Option<table::OwnerInfo>> {
        let guard = self.inner.store.lock()?;
        let section = guard.region().class(class);
        if slot >= section.slot_count() {
            return Err(Error::BadArgument(format!("{class} has no slot {slot}")));
        }
        Ok(section.slot(slot).owner().map(table::OwnerInfo::from))
    }

    /// The global tie-break policy.
    pub fn requester_wins_priority_tie(&self) -> Result<bool> {
        let guard = self.inner.store.lock()?;
        Ok(guard.region().header().requester_wins_tie())
    }

    /// Consistent copy of the whole shared state.
    pub fn snapshot(&self) -> Result<StateSnapshot> {
        let guard = self.inner.store.lock()?;
        Ok(table::snapshot(guard.region()))
    }

    /// Print the shared state in a stable line-oriented form.
    pub fn dump<W: io::Write>(&self, out: &mut W) -> Result<()> {
        let guard = self.inner.store.lock()?;
        dump::write_state(guard.region(), out)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local lookups
    // ------------------------------------------------------------------

    fn grant_class_of(&self, id: RequestId) -> Option<ResClass> {
        self.inner.grants.lock().unwrap().get(&id.raw()).map(|g| g.class)
    }

    fn grant_slot_of(&self, id: RequestId) -> Option<(ResClass, usize)> {
        self.inner
            .grants
            .lock()
            .unwrap()
            .get(&id.raw())
            .map(|g| (g.class, g.slot))
    }

    fn pending_class_of(&self, id: RequestId) -> Option<ResClass> {
        self.inner.pending.lock().unwrap().get(&id.raw()).map(|p| p.class)
    }
}

fn type_mismatch(asked: ResClass, actual: ResClass, id: RequestId) -> Error {
    Error::TypeMismatch(format!(
        "request {} belongs to {actual}, not {asked}",
        id.raw()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn open(dir: &TempDir) -> ResMgr {
        ResMgr::open_with(dir.path(), ArbConfig::builtin_defaults()).unwrap()
    }

    fn event_channel() -> (EventFn, mpsc::Receiver<(RequestId, GrantEvent)>) {
        let (tx, rx) = mpsc::channel();
        let callback: EventFn = Box::new(move |id, event| {
            let _ = tx.send((id, event));
        });
        (callback, rx)
    }

    #[test]
    fn test_request_and_release_roundtrip() {
        let dir = tempdir().unwrap();
        let mgr = open(&dir);
        let spec = RequestSpec::new(ResClass::Audio, 3);
        let RequestOutcome::Granted { id, caps } = mgr.request(spec, None).unwrap() else {
            panic!("expected a grant");
        };
        assert!(caps.flags.contains(crate::caps::CapFlags::HARDWARE));
        let owner = mgr.owner_of(ResClass::Audio, 0).unwrap().unwrap();
        assert_eq!(owner.request_id, id);
        assert_eq!(owner.pid, std::process::id());
        mgr.release(ResClass::Audio, id).unwrap();
        assert!(mgr.owner_of(ResClass::Audio, 0).unwrap().is_none());
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempdir().unwrap();
        let mgr = open(&dir);
        let RequestOutcome::Granted { id, .. } = mgr
            .request(RequestSpec::new(ResClass::FrontEnd, 2), None)
            .unwrap()
        else {
            panic!("expected a grant");
        };
        mgr.release(ResClass::FrontEnd, id).unwrap();
        mgr.release(ResClass::FrontEnd, id).unwrap();
        assert_eq!(mgr.slot_count(ResClass::FrontEnd).unwrap(), 1);
    }

    #[test]
    fn test_bad_arguments_are_rejected() {
        let dir = tempdir().unwrap();
        let mgr = open(&dir);
        let zero = RequestSpec::new(ResClass::Audio, 0);
        assert!(matches!(mgr.request(zero, None), Err(Error::BadArgument(_))));
        let video_usage = RequestSpec::new(ResClass::Audio, 1).with_usage(UsageFlags::FULL_RESOLUTION);
        assert!(matches!(mgr.request(video_usage, None), Err(Error::BadArgument(_))));
        let sized_audio = RequestSpec {
            class: ResClass::Audio,
            usage: UsageFlags::empty(),
            priority: 1,
            max_size: Some(SizeLimit::new(640, 480)),
        };
        assert!(matches!(mgr.request(sized_audio, None), Err(Error::BadArgument(_))));
        // wider than the stored i32 words
        let oversized = RequestSpec::new(ResClass::Video, 1).with_max_size(u32::MAX, 1080);
        assert!(matches!(mgr.request(oversized, None), Err(Error::BadArgument(_))));
    }

    #[test]
    fn test_class_mismatch_is_reported() {
        let dir = tempdir().unwrap();
        let mgr = open(&dir);
        let RequestOutcome::Granted { id, .. } = mgr
            .request(RequestSpec::new(ResClass::Video, 2), None)
            .unwrap()
        else {
            panic!("expected a grant");
        };
        assert!(matches!(
            mgr.release(ResClass::Audio, id),
            Err(Error::TypeMismatch(_))
        ));
        mgr.release(ResClass::Video, id).unwrap();
    }

    #[test]
    fn test_sync_caller_without_rank_is_denied() {
        let dir = tempdir().unwrap();
        let mgr = open(&dir);
        let a = mgr.request(RequestSpec::new(ResClass::Audio, 5), None).unwrap();
        let b = mgr.request(RequestSpec::new(ResClass::Audio, 5), None).unwrap();
        assert!(matches!(a, RequestOutcome::Granted { .. }));
        assert!(matches!(b, RequestOutcome::Granted { .. }));
        // both slots owned at 5; a synchronous request at 3 has no move
        let denied = mgr.request(RequestSpec::new(ResClass::Audio, 3), None).unwrap();
        assert!(matches!(denied, RequestOutcome::Denied));
    }

    #[test]
    fn test_sync_preemption_revokes_and_reassigns() {
        let dir = tempdir().unwrap();
        let mgr = open(&dir);
        let (callback, events) = event_channel();
        let RequestOutcome::Granted { id: low, .. } = mgr
            .request(RequestSpec::new(ResClass::FrontEnd, 1), Some(callback))
            .unwrap()
        else {
            panic!("expected a grant");
        };

        let RequestOutcome::Granted { id: high, .. } = mgr
            .request(RequestSpec::new(ResClass::FrontEnd, 7), None)
            .unwrap()
        else {
            panic!("expected preemption to grant");
        };

        let (revoked_id, event) = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(revoked_id, low);
        assert_eq!(event, GrantEvent::Revoked);
        let owner = mgr.owner_of(ResClass::FrontEnd, 0).unwrap().unwrap();
        assert_eq!(owner.request_id, high);
        // the victim's release is now a no-op
        mgr.release(ResClass::FrontEnd, low).unwrap();
        assert!(mgr.owner_of(ResClass::FrontEnd, 0).unwrap().is_some());
        mgr.release(ResClass::FrontEnd, high).unwrap();
    }

    #[test]
    fn test_queued_request_granted_after_release() {
        let dir = tempdir().unwrap();
        let mgr = open(&dir);
        let RequestOutcome::Granted { id: a, .. } = mgr
            .request(RequestSpec::new(ResClass::FrontEnd, 5), None)
            .unwrap()
        else {
            panic!("expected a grant");
        };
        let (callback, events) = event_channel();
        let RequestOutcome::Queued { id: b } = mgr
            .request(RequestSpec::new(ResClass::FrontEnd, 2), Some(callback))
            .unwrap()
        else {
            panic!("expected to queue behind a higher-priority owner");
        };

        mgr.release(ResClass::FrontEnd, a).unwrap();
        let (granted_id, event) = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(granted_id, b);
        assert_eq!(event, GrantEvent::Granted);
        let owner = mgr.owner_of(ResClass::FrontEnd, 0).unwrap().unwrap();
        assert_eq!(owner.request_id, b);
        mgr.release(ResClass::FrontEnd, b).unwrap();
    }

    #[test]
    fn test_cancel_unlinks_and_frees_the_entry() {
        let dir = tempdir().unwrap();
        let mgr = open(&dir);
        let RequestOutcome::Granted { id: a, .. } = mgr
            .request(RequestSpec::new(ResClass::FrontEnd, 9), None)
            .unwrap()
        else {
            panic!("expected a grant");
        };
        let (callback, events) = event_channel();
        let RequestOutcome::Queued { id: b } = mgr
            .request(RequestSpec::new(ResClass::FrontEnd, 1), Some(callback))
            .unwrap()
        else {
            panic!("expected to queue");
        };
        mgr.cancel(ResClass::FrontEnd, b).unwrap();
        // releasing the owner must not grant the cancelled request
        mgr.release(ResClass::FrontEnd, a).unwrap();
        assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
        assert!(mgr.owner_of(ResClass::FrontEnd, 0).unwrap().is_none());
    }

    #[test]
    fn test_async_preemption_runs_revoke_then_transfer() {
        let dir = tempdir().unwrap();
        let mgr = open(&dir);
        let (cb_a, events_a) = event_channel();
        let RequestOutcome::Granted { id: a, .. } = mgr
            .request(RequestSpec::new(ResClass::FrontEnd, 2), Some(cb_a))
            .unwrap()
        else {
            panic!("expected a grant");
        };
        let (cb_b, events_b) = event_channel();
        let RequestOutcome::Queued { id: b } = mgr
            .request(RequestSpec::new(ResClass::FrontEnd, 5), Some(cb_b))
            .unwrap()
        else {
            panic!("expected the preempting request to queue");
        };

        let (revoked_id, revoked_event) = events_a.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((revoked_id, revoked_event), (a, GrantEvent::Revoked));
        let (granted_id, granted_event) = events_b.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((granted_id, granted_event), (b, GrantEvent::Granted));
        let owner = mgr.owner_of(ResClass::FrontEnd, 0).unwrap().unwrap();
        assert_eq!(owner.request_id, b);
        assert_eq!(owner.priority, 5);
        mgr.release(ResClass::FrontEnd, b).unwrap();
    }

    #[test]
    fn test_set_priority_promotes_queued_request() {
        let dir = tempdir().unwrap();
        let mgr = open(&dir);
        let RequestOutcome::Granted { id: a, .. } = mgr
            .request(RequestSpec::new(ResClass::FrontEnd, 5), None)
            .unwrap()
        else {
            panic!("expected a grant");
        };
        let (callback, events) = event_channel();
        let RequestOutcome::Queued { id: b } = mgr
            .request(RequestSpec::new(ResClass::FrontEnd, 2), Some(callback))
            .unwrap()
        else {
            panic!("expected to queue");
        };
        // raising b above the owner triggers revoke + transfer
        mgr.set_priority(ResClass::FrontEnd, b, 9).unwrap();
        let (granted_id, event) = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((granted_id, event), (b, GrantEvent::Granted));
        let owner = mgr.owner_of(ResClass::FrontEnd, 0).unwrap().unwrap();
        assert_eq!(owner.request_id, b);
        assert_eq!(owner.priority, 9);
        mgr.release(ResClass::FrontEnd, a).unwrap();
        mgr.release(ResClass::FrontEnd, b).unwrap();
    }

    #[test]
    fn test_set_priority_can_cost_the_owner_its_slot() {
        let dir = tempdir().unwrap();
        let mgr = open(&dir);
        let (cb_a, events_a) = event_channel();
        let RequestOutcome::Granted { id: a, .. } = mgr
            .request(RequestSpec::new(ResClass::FrontEnd, 8), Some(cb_a))
            .unwrap()
        else {
            panic!("expected a grant");
        };
        let (cb_b, events_b) = event_channel();
        let RequestOutcome::Queued { id: b } = mgr
            .request(RequestSpec::new(ResClass::FrontEnd, 4), Some(cb_b))
            .unwrap()
        else {
            panic!("expected to queue");
        };
        // dropping the owner below the waiter hands the slot over
        mgr.set_priority(ResClass::FrontEnd, a, 1).unwrap();
        let (revoked_id, revoked_event) = events_a.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((revoked_id, revoked_event), (a, GrantEvent::Revoked));
        let (granted_id, granted_event) = events_b.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((granted_id, granted_event), (b, GrantEvent::Granted));
        mgr.release(ResClass::FrontEnd, b).unwrap();
    }

    #[test]
    fn test_unknown_id_updates_are_bad_arguments() {
        let dir = tempdir().unwrap();
        let mgr = open(&dir);
        let err = mgr.set_priority(ResClass::Video, RequestId(424242), 3);
        assert!(matches!(err, Err(Error::BadArgument(_))));
    }
}
