pub mod authz;
mod conflict;
mod error;
mod fields;
mod locks;
mod mutations;
mod queries;
mod store;

pub use authz::{authorize, Access, Actor, Operation, Record};
pub use conflict::{validate_reservation, validate_room_assignment};
pub use error::{ConflictReason, EngineError, ErrorKind, FieldErrors, GENERAL_FIELD};
pub use fields::{CourseFields, ReservationFields, RoomFields, UpdateMode, UserFields};
pub use queries::ReservationFilter;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use locks::{timed, KeyedLocks};
use store::{rooms_touched_by, RoomGuards};

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One fsync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(ref e) = result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, &mut vec![(event, response)]);
        }
    }
}

/// One tenant's records plus the locks that keep concurrent writes consistent.
///
/// Lock order, always: `catalog` → id claim → professor lock → room locks by
/// ascending id. Id claims and professor locks are separate maps, so a key
/// that is both a professor and a new record id never waits on itself.
/// User, course and room creation, cascading deletes and compaction take
/// `catalog` exclusively; other room and reservation writes take it shared.
pub struct Engine {
    users: DashMap<Ulid, User>,
    courses: DashMap<Ulid, Course>,
    rooms: DashMap<Ulid, SharedRoomState>,
    /// Reverse lookup: reservation id → room id.
    reservation_to_room: DashMap<Ulid, Ulid>,
    catalog: RwLock<()>,
    /// Per-professor locks for room assignment.
    professor_locks: KeyedLocks,
    /// Claims on caller-chosen reservation ids.
    id_claims: KeyedLocks,
    wal_tx: mpsc::Sender<WalCommand>,
    lock_timeout: Duration,
}

impl Engine {
    pub fn new(wal_path: PathBuf, lock_timeout: Duration) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            users: DashMap::new(),
            courses: DashMap::new(),
            rooms: DashMap::new(),
            reservation_to_room: DashMap::new(),
            catalog: RwLock::new(()),
            professor_locks: KeyedLocks::default(),
            id_claims: KeyedLocks::default(),
            wal_tx,
            lock_timeout,
        };

        // Sole owner of every Arc here, so try_write never contends. Never use
        // blocking_write: this may run inside an async context (lazy tenant creation).
        for event in &events {
            let mut guards = RoomGuards::new();
            for (id, rs) in engine.room_arcs(rooms_touched_by(event)) {
                let guard = rs.try_write_owned().map_err(|_| {
                    io::Error::other(format!("replay: room {id} unexpectedly locked"))
                })?;
                guards.insert(id, guard);
            }
            engine.apply(event, &mut guards);
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events from {}: {} users, {} courses, {} rooms",
                events.len(),
                wal_path.display(),
                engine.users.len(),
                engine.courses.len(),
                engine.rooms.len()
            );
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply. The event becomes visible only once durable.
    async fn commit(&self, event: Event, guards: &mut RoomGuards) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.apply(&event, guards);
        Ok(())
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn room_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_room.get(reservation_id).map(|e| *e.value())
    }

    /// Clones the Arcs out so no map shard stays locked while we await.
    /// `None` selects every room, sorted by id.
    fn room_arcs(&self, ids: Option<Vec<Ulid>>) -> Vec<(Ulid, SharedRoomState)> {
        let mut arcs: Vec<(Ulid, SharedRoomState)> = match ids {
            Some(ids) => ids
                .into_iter()
                .filter_map(|id| self.get_room(&id).map(|rs| (id, rs)))
                .collect(),
            None => self
                .rooms
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
        };
        arcs.sort_by_key(|(id, _)| *id);
        arcs.dedup_by_key(|(id, _)| *id);
        arcs
    }

    // ── Timed lock acquisition ───────────────────────────────

    async fn catalog_shared(&self) -> Result<RwLockReadGuard<'_, ()>, EngineError> {
        timed(self.lock_timeout, "catalog", self.catalog.read()).await
    }

    async fn catalog_exclusive(&self) -> Result<RwLockWriteGuard<'_, ()>, EngineError> {
        timed(self.lock_timeout, "catalog", self.catalog.write()).await
    }

    async fn lock_professor(&self, id: Ulid) -> Result<OwnedMutexGuard<()>, EngineError> {
        timed(self.lock_timeout, "professor", self.professor_locks.lock(id)).await
    }

    async fn claim_id(&self, id: Ulid) -> Result<OwnedMutexGuard<()>, EngineError> {
        timed(self.lock_timeout, "id claim", self.id_claims.lock(id)).await
    }

    /// Write-lock the given rooms in ascending id order. Rooms that no longer
    /// exist are left out; callers check for the ones they need.
    async fn lock_rooms(&self, ids: Option<Vec<Ulid>>) -> Result<RoomGuards, EngineError> {
        let mut guards = RoomGuards::new();
        for (id, rs) in self.room_arcs(ids) {
            let guard = timed(self.lock_timeout, "room", rs.write_owned()).await?;
            if !guard.removed {
                guards.insert(id, guard);
            }
        }
        Ok(guards)
    }

    /// Current record of one live room.
    async fn room_record(&self, id: Ulid) -> Result<Room, EngineError> {
        let rs = self
            .get_room(&id)
            .ok_or(EngineError::NotFound(EntityKind::Room, id))?;
        let guard = timed(self.lock_timeout, "room", rs.read()).await?;
        if guard.removed {
            return Err(EngineError::NotFound(EntityKind::Room, id));
        }
        Ok(guard.room.clone())
    }

    /// Every live room record, each read under its own lock.
    async fn room_records(&self) -> Result<Vec<Room>, EngineError> {
        let mut rooms = Vec::new();
        for (_, rs) in self.room_arcs(None) {
            let guard = timed(self.lock_timeout, "room", rs.read()).await?;
            if !guard.removed {
                rooms.push(guard.room.clone());
            }
        }
        Ok(rooms)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to rebuild the current state.
    /// Holds the catalog exclusively, so no append can land between the
    /// snapshot and the file swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_exclusive().await?;

        let mut events: Vec<Event> = self
            .users
            .iter()
            .map(|u| Event::UserCreated { user: u.clone() })
            .collect();
        events.extend(self.courses.iter().map(|c| Event::CourseCreated { course: c.clone() }));
        let mut reservations = Vec::new();
        for (_, rs) in self.room_arcs(None) {
            let guard = timed(self.lock_timeout, "room", rs.read()).await?;
            if guard.removed {
                continue;
            }
            events.push(Event::RoomCreated {
                room: guard.room.clone(),
            });
            reservations.extend(guard.reservations.iter().cloned());
        }
        events.extend(
            reservations
                .into_iter()
                .map(|reservation| Event::ReservationCreated { reservation }),
        );
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        self.professor_locks.prune();
        self.id_claims.prune();
        tracing::info!("WAL compacted to {count} events");
        Ok(())
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
