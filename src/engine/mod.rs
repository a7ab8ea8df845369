mod admin;
mod cascade;
mod conflict;
mod error;
mod ledger;
mod queries;
mod status;
mod store;

pub use cascade::{BookingRequest, CancelOutcome, MaintenanceOutcome, Reschedule};
pub use error::{ConflictReason, EngineError, EntityKind};
pub use ledger::retention_cutoff;
pub use status::StatusTrigger;
pub use store::{FacilityState, UserState};

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notification, NotifyDispatcher};
use crate::wal::Wal;

use store::{apply_to_facility, apply_to_user};

pub type SharedFacilityState = Arc<RwLock<FacilityState>>;
pub type SharedUserState = Arc<RwLock<UserState>>;

/// Write guards for every user touched by one unit of work, in id order.
pub(crate) type UserGuards = BTreeMap<Ulid, OwnedRwLockWriteGuard<UserState>>;

// ── Group-commit journal channel ─────────────────────────

pub(crate) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        frames: Vec<Vec<Event>>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingFrame = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the journal and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

pub(crate) fn spawn_wal_writer(wal: Wal) -> mpsc::Sender<WalCommand> {
    let (wal_tx, wal_rx) = mpsc::channel(4096);
    tokio::spawn(wal_writer_loop(wal, wal_rx));
    wal_tx
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingFrame>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("journal flush failed for {} frame(s): {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingFrame]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(events, _)| wal.append_buffered(events))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        // Every caller in the batch is told it failed, so none of its bytes
        // may survive to be made durable by a later sync.
        if let Err(e) = wal.discard_pending() {
            tracing::error!("journal rollback failed, refusing appends until compaction: {e}");
        }
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { frames, response } => {
            let result = Wal::write_compact_file(wal.path(), &frames).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The booking engine: the journal-backed store plus every operation that
/// mutates it.
///
/// Lock order is compaction gate, then one facility, then users in id order.
pub struct Engine {
    pub(crate) facilities: DashMap<Ulid, SharedFacilityState>,
    pub(crate) users: DashMap<Ulid, SharedUserState>,
    pub(crate) wal_tx: mpsc::Sender<WalCommand>,
    pub(crate) notifier: NotifyDispatcher,
    /// Reverse lookup: reservation / maintenance request id → facility id
    pub(crate) entity_to_facility: DashMap<Ulid, Ulid>,
    /// Held shared by map-level inserts/removals and exclusively by compaction,
    /// so a snapshot never misses an entity that was journaled before it.
    pub(crate) compaction_gate: RwLock<()>,
}

impl Engine {
    /// Replay the journal at `wal_path` and start its group-commit writer.
    pub fn open(wal_path: PathBuf, notifier: NotifyDispatcher) -> io::Result<Self> {
        let frames = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let engine = Self::from_parts(spawn_wal_writer(wal), notifier);
        let count = frames.len();
        for event in frames.iter().flatten() {
            engine.replay_event(event);
        }
        info!(
            frames = count,
            facilities = engine.facilities.len(),
            users = engine.users.len(),
            "journal replayed from {}",
            wal_path.display()
        );
        Ok(engine)
    }

    pub(crate) fn from_parts(wal_tx: mpsc::Sender<WalCommand>, notifier: NotifyDispatcher) -> Self {
        Self {
            facilities: DashMap::new(),
            users: DashMap::new(),
            wal_tx,
            notifier,
            entity_to_facility: DashMap::new(),
            compaction_gate: RwLock::new(()),
        }
    }

    // Replay runs before the engine is shared, so try_write always succeeds.
    // Never use blocking_write here: this may run inside an async context.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::UserRegistered { id, name, email } => {
                let user = User { id: *id, name: name.clone(), email: email.clone() };
                self.users.insert(*id, Arc::new(RwLock::new(UserState::new(user))));
            }
            Event::FacilityCreated { id, name, kind, status } => {
                let facility = Facility { id: *id, name: name.clone(), kind: kind.clone(), status: *status };
                self.facilities.insert(*id, Arc::new(RwLock::new(FacilityState::new(facility))));
            }
            Event::FacilityDeleted { id } => {
                self.facilities.remove(id);
                self.entity_to_facility.retain(|_, fid| fid != id);
            }
            other => {
                if let Some(fid) = other.facility_id()
                    && let Some(fs) = self.get_facility(&fid)
                    && let Ok(mut guard) = fs.try_write()
                {
                    apply_to_facility(&mut guard, other, &self.entity_to_facility);
                }
                if let Some(uid) = other.user_id()
                    && let Some(us) = self.get_user(&uid)
                    && let Ok(mut guard) = us.try_write()
                {
                    apply_to_user(&mut guard, other);
                }
            }
        }
    }

    /// Write one unit of work to the journal via the group-commit writer.
    async fn wal_append(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Unavailable("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    /// Journal a unit of work, then apply it to the locked records.
    ///
    /// Nothing is applied unless the journal write succeeded, so a failed
    /// commit leaves every record exactly as the caller found it.
    pub(crate) async fn persist_and_apply(
        &self,
        events: &[Event],
        facility: Option<&mut FacilityState>,
        users: &mut UserGuards,
    ) -> Result<(), EngineError> {
        let mut facilities: Vec<&mut FacilityState> = facility.into_iter().collect();
        self.persist_and_apply_across(events, &mut facilities, users).await
    }

    /// [`Self::persist_and_apply`] for a unit of work spanning several
    /// facilities. Each event goes to the facility it names.
    pub(crate) async fn persist_and_apply_across(
        &self,
        events: &[Event],
        facilities: &mut [&mut FacilityState],
        users: &mut UserGuards,
    ) -> Result<(), EngineError> {
        if events.is_empty() {
            return Ok(());
        }
        self.wal_append(events).await?;
        for event in events {
            if let Some(fid) = event.facility_id()
                && let Some(fs) = facilities.iter_mut().find(|fs| fs.facility.id == fid)
            {
                apply_to_facility(fs, event, &self.entity_to_facility);
            }
            if let Some(uid) = event.user_id()
                && let Some(us) = users.get_mut(&uid)
            {
                apply_to_user(us, event);
            }
        }
        Ok(())
    }

    pub(crate) fn notify(&self, message: Notification) {
        self.notifier.dispatch(message);
    }

    pub fn get_facility(&self, id: &Ulid) -> Option<SharedFacilityState> {
        self.facilities.get(id).map(|e| e.value().clone())
    }

    pub fn get_user(&self, id: &Ulid) -> Option<SharedUserState> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn get_facility_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_facility.get(entity_id).map(|e| *e.value())
    }

    /// Acquire a facility's write lock. Fails if the facility is gone,
    /// including when it was deleted while we waited.
    pub(crate) async fn lock_facility(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<FacilityState>, EngineError> {
        let fs = self
            .get_facility(&id)
            .ok_or(EngineError::not_found(EntityKind::Facility, id))?;
        let guard = fs.write_owned().await;
        if !self.facilities.contains_key(&id) {
            return Err(EngineError::not_found(EntityKind::Facility, id));
        }
        Ok(guard)
    }

    pub(crate) async fn read_facility(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<FacilityState>, EngineError> {
        let fs = self
            .get_facility(&id)
            .ok_or(EngineError::not_found(EntityKind::Facility, id))?;
        Ok(fs.read_owned().await)
    }

    pub(crate) async fn read_user(&self, id: Ulid) -> Result<OwnedRwLockReadGuard<UserState>, EngineError> {
        let us = self
            .get_user(&id)
            .ok_or(EngineError::not_found(EntityKind::User, id))?;
        Ok(us.read_owned().await)
    }

    /// Acquire write locks for a set of users in ascending id order.
    pub(crate) async fn lock_users(
        &self,
        ids: impl IntoIterator<Item = Ulid>,
    ) -> Result<UserGuards, EngineError> {
        let ids: BTreeSet<Ulid> = ids.into_iter().collect();
        let mut guards = BTreeMap::new();
        for id in ids {
            let us = self
                .get_user(&id)
                .ok_or(EngineError::not_found(EntityKind::User, id))?;
            guards.insert(id, us.write_owned().await);
        }
        Ok(guards)
    }

    /// Lookup entity → facility, then acquire that facility's write lock.
    /// Retries when the entity moved to another facility while we waited.
    /// The entity itself may have vanished by the time the lock is held;
    /// callers re-check under the lock.
    pub(crate) async fn resolve_entity_write(
        &self,
        entity_id: Ulid,
        kind: EntityKind,
    ) -> Result<OwnedRwLockWriteGuard<FacilityState>, EngineError> {
        loop {
            let facility_id = self
                .get_facility_for_entity(&entity_id)
                .ok_or(EngineError::not_found(kind, entity_id))?;
            let guard = self.lock_facility(facility_id).await?;
            match self.get_facility_for_entity(&entity_id) {
                Some(now_at) if now_at != facility_id => continue,
                _ => return Ok(guard),
            }
        }
    }

    /// Rewrite the journal as the minimal set of frames that recreates the
    /// current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;

        let mut facility_ids: Vec<Ulid> = self.facilities.iter().map(|e| *e.key()).collect();
        facility_ids.sort();
        let mut user_ids: Vec<Ulid> = self.users.iter().map(|e| *e.key()).collect();
        user_ids.sort();

        let mut facility_guards = Vec::with_capacity(facility_ids.len());
        for id in &facility_ids {
            if let Some(fs) = self.get_facility(id) {
                facility_guards.push(fs.read_owned().await);
            }
        }
        let mut user_guards = Vec::with_capacity(user_ids.len());
        for id in &user_ids {
            if let Some(us) = self.get_user(id) {
                user_guards.push(us.read_owned().await);
            }
        }

        // Users first: facility frames carry reservations that reference them.
        let mut frames = Vec::with_capacity(user_guards.len() + facility_guards.len());
        for us in &user_guards {
            let mut frame = Vec::new();
            store::snapshot_user(us, &mut frame);
            frames.push(frame);
        }
        for fs in &facility_guards {
            let mut frame = Vec::new();
            store::snapshot_facility(fs, &mut frame);
            frames.push(frame);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { frames, response: tx })
            .await
            .map_err(|_| EngineError::Unavailable("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
