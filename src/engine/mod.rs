mod conflict;
mod error;
mod mutations;
mod queries;
mod schedule;

pub use conflict::{find_conflict, has_conflict};
pub use error::EngineError;
pub use schedule::{BookingSchedule, ScheduleIndex};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

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
/// Blocks for the first append, drains whatever else is already queued,
/// then does one fsync for the whole batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Non-appends run after the batch they interrupted is durable.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    tracing::debug!("WAL writer stopped: {}", wal.path().display());
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    if result.is_ok() {
        result = wal.flush_sync();
    }
    // Nothing in a failed batch is acknowledged, so none of it may stay on
    // disk ahead of the next batch.
    if result.is_err() {
        if let Err(e) = wal.discard_unsynced() {
            tracing::error!("WAL rollback failed for {}: {e}", wal.path().display());
        }
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Booking rows plus the schedule index built from them. Always mutated
/// together, under the engine's booking lock.
#[derive(Debug, Default)]
pub struct BookingBook {
    pub(super) rows: HashMap<Ulid, Booking>,
    pub(super) schedule: ScheduleIndex,
}

impl BookingBook {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::BookingCreated(b) | Event::BookingUpdated(b) => self.upsert(b),
            Event::BookingsCreated(batch) => batch.iter().for_each(|b| self.upsert(b)),
            Event::BookingDeleted { id } => {
                self.schedule.remove(*id);
                self.rows.remove(id);
            }
            _ => {}
        }
    }

    fn upsert(&mut self, b: &Booking) {
        self.schedule
            .replace(b.id, b.status.occupies().then(|| b.interval()));
        self.rows.insert(b.id, b.clone());
    }

    pub fn schedule(&self) -> &ScheduleIndex {
        &self.schedule
    }
}

/// One tenant's tables. Users, services and staff are plain maps; bookings
/// sit behind an `RwLock` so that check-then-write is atomic.
pub struct Engine {
    pub(super) users: DashMap<Ulid, User>,
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) staff: DashMap<Ulid, StaffMember>,
    pub(super) bookings: RwLock<BookingBook>,
    /// Serializes user/service/staff writes. Lock order: `bookings` before `catalog`.
    pub(super) catalog: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut engine = Self {
            users: DashMap::new(),
            services: DashMap::new(),
            staff: DashMap::new(),
            bookings: RwLock::new(BookingBook::default()),
            catalog: Mutex::new(()),
            wal_tx,
        };

        let mut book = BookingBook::default();
        for event in &events {
            engine.apply_catalog(event);
            book.apply(event);
        }
        tracing::debug!(
            "replayed {} events from {}: {} bookings",
            events.len(),
            wal_path.display(),
            book.rows.len()
        );
        engine.bookings = RwLock::new(book);

        Ok(engine)
    }

    fn apply_catalog(&self, event: &Event) {
        match event {
            Event::UserCreated(u) | Event::UserUpdated(u) => {
                self.users.insert(u.id, u.clone());
            }
            Event::UserDeleted { id } => {
                self.users.remove(id);
            }
            Event::ServiceCreated(s) | Event::ServiceUpdated(s) => {
                self.services.insert(s.id, s.clone());
            }
            Event::ServiceDeleted { id } => {
                self.services.remove(id);
            }
            Event::StaffCreated(s) | Event::StaffUpdated(s) => {
                self.staff.insert(s.id, s.clone());
            }
            Event::StaffDeleted { id } => {
                self.staff.remove(id);
            }
            Event::BookingCreated(_)
            | Event::BookingsCreated(_)
            | Event::BookingUpdated(_)
            | Event::BookingDeleted { .. } => {}
        }
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

    /// WAL-append then apply a user/service/staff event. Caller holds `catalog`.
    pub(super) async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_catalog(event);
        Ok(())
    }

    /// WAL-append then apply a booking event. Caller holds the booking write lock.
    pub(super) async fn persist_booking(
        &self,
        book: &mut BookingBook,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        book.apply(event);
        Ok(())
    }
}
