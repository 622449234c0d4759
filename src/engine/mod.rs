mod accounts;
mod catalog;
mod error;
mod orders;
mod queries;
mod reviews;
mod store;

pub use error::EngineError;
pub use store::{normalize_email, Store};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::images::ImageStore;
use crate::limits::*;
use crate::mailer::{Mail, Mailer};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

/// The UTC calendar day containing `ms`.
pub fn day_of(ms: Ms) -> Day {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

/// Per-site tunables.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// How long a Pending order waits for a payment proof.
    pub payment_window_ms: Ms,
    pub bcrypt_cost: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            payment_window_ms: DEFAULT_PAYMENT_WINDOW_MS,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

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

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first Append, drain whatever else is already queued, fsync
/// once, then answer every sender. A non-append command ends the batch early.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
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
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
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
    // Flush even after a failed append so stale bytes never join the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
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
        WalCommand::Append { .. } => {}
    }
}

/// One site's booking engine.
///
/// Lock order: `catalog_lock` first, then at most one room lock (compaction
/// takes every room lock in id order). Account, catalog, image and review
/// writes run under `catalog_lock`; calendar and order writes run under the
/// room's write lock.
pub struct Engine {
    pub(super) store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) mailer: Arc<dyn Mailer>,
    pub(super) images: ImageStore,
    pub(super) config: EngineConfig,
    pub(super) catalog_lock: Mutex<()>,
    /// Login sessions by token. Not persisted.
    pub(super) sessions: DashMap<Ulid, Session>,
    /// Order ids claimed by a placement whose WAL append has not landed yet.
    pub(super) placing: DashMap<Ulid, ()>,
    /// Wrong OTP guesses per user since the last issue. Not persisted.
    pub(super) otp_misses: DashMap<Ulid, u32>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        images: ImageStore,
        notify: Arc<NotifyHub>,
        mailer: Arc<dyn Mailer>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: Store::new(),
            wal_tx,
            notify,
            mailer,
            images,
            config,
            catalog_lock: Mutex::new(()),
            sessions: DashMap::new(),
            placing: DashMap::new(),
            otp_misses: DashMap::new(),
        };

        // We own every room Arc during replay, so try_write never fails. Never
        // block here: this may run inside the runtime (lazy site creation).
        for event in &events {
            match event.room_id() {
                Some(room_id) => match engine.store.get_room(&room_id) {
                    Some(rs) => {
                        if let Ok(mut guard) = rs.try_write() {
                            engine.store.apply_to_room(&mut guard, event);
                        }
                    }
                    None => {
                        // Order history outlives a deleted room.
                        let mut scratch =
                            RoomState::new(room_id, Ulid::nil(), String::new(), 0, String::new());
                        engine.store.apply_to_room(&mut scratch, event);
                    }
                },
                None => engine.store.apply(event),
            }
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

    /// WAL-append then apply, for events outside any room.
    pub(super) async fn persist(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply(event);
        Ok(())
    }

    /// WAL-append then apply under the room's write lock.
    pub(super) async fn persist_to_room(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_to_room(rs, event);
        Ok(())
    }

    /// Write-lock a room. The map is checked again after locking: a room
    /// deleted while we waited must not take new writes.
    pub(super) async fn room_write(
        &self,
        room_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let rs = self
            .store
            .get_room(&room_id)
            .ok_or(EngineError::NotFound("room", room_id))?;
        let guard = rs.write_owned().await;
        if !self.store.rooms.contains_key(&room_id) {
            return Err(EngineError::NotFound("room", room_id));
        }
        Ok(guard)
    }

    pub(super) async fn room_read(
        &self,
        room_id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<RoomState>, EngineError> {
        let rs = self
            .store
            .get_room(&room_id)
            .ok_or(EngineError::NotFound("room", room_id))?;
        Ok(rs.read_owned().await)
    }

    /// Lock an order's room and return a fresh copy of the order.
    pub(super) async fn order_write(
        &self,
        order_id: Ulid,
    ) -> Result<(Order, OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .store
            .orders
            .get(&order_id)
            .map(|o| o.room_id)
            .ok_or(EngineError::NotFound("order", order_id))?;
        let guard = self.room_write(room_id).await?;
        let order = self
            .store
            .orders
            .get(&order_id)
            .map(|o| o.clone())
            .ok_or(EngineError::NotFound("order", order_id))?;
        Ok((order, guard))
    }

    pub(super) fn notify_order(&self, order: &Order, event: &str) {
        let payload = serde_json::json!({
            "event": event,
            "order_id": order.id.to_string(),
            "invoice_id": order.invoice_id,
            "room_id": order.room_id.to_string(),
            "property_id": order.property_id.to_string(),
            "status": order.status.as_str(),
        })
        .to_string();
        self.notify.send(&format!("order_{}", order.id), &payload);
        self.notify.send(&format!("property_{}", order.property_id), &payload);
    }

    /// Send mail after the state change is durable. Failures are logged only.
    pub(super) async fn deliver(&self, mail: Mail) {
        if let Err(e) = self.mailer.send(&mail).await {
            warn!(to = %mail.to, subject = %mail.subject, "mail delivery failed: {e}");
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// Holds the catalog lock and every room's read lock until the writer has
    /// swapped files, so no write can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let mut room_ids: Vec<Ulid> = self.store.rooms.iter().map(|e| *e.key()).collect();
        room_ids.sort();
        let mut rooms = Vec::with_capacity(room_ids.len());
        for id in room_ids {
            if let Some(rs) = self.store.get_room(&id) {
                rooms.push(rs.read_owned().await);
            }
        }

        let events = self.snapshot_events(&rooms);

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    fn snapshot_events(&self, rooms: &[OwnedRwLockReadGuard<RoomState>]) -> Vec<Event> {
        let store = &self.store;
        let mut events = Vec::new();

        for image in store.images.iter() {
            events.push(Event::ImageStored {
                id: image.id,
                content_type: image.content_type.clone(),
                file_name: image.file_name.clone(),
                size: image.size,
            });
        }
        for t in store.tenants.iter() {
            events.push(Event::TenantRegistered {
                id: t.id,
                name: t.name.clone(),
                email: t.email.clone(),
                password_hash: t.password_hash.clone(),
                phone_number: t.phone_number.clone(),
                ktp_card: t.ktp_card,
                at: t.created_at,
            });
        }
        for u in store.users.iter() {
            events.push(Event::UserRegistered {
                id: u.id,
                name: u.name.clone(),
                email: u.email.clone(),
                password_hash: u.password_hash.clone(),
                phone_number: u.phone_number.clone(),
                at: u.created_at,
            });
            if u.gender.is_some() || u.birth_date.is_some() || u.profile_picture.is_some() {
                events.push(Event::ProfileUpdated {
                    user_id: u.id,
                    name: u.name.clone(),
                    phone_number: u.phone_number.clone(),
                    gender: u.gender.clone(),
                    birth_date: u.birth_date,
                    profile_picture: u.profile_picture,
                });
            }
            if u.verified {
                events.push(Event::UserVerified { user_id: u.id });
            }
        }
        for v in store.verifications.iter() {
            events.push(Event::OtpIssued {
                user_id: v.user_id,
                otp: v.otp.clone(),
                attempts_left: v.attempts_left,
                at: v.issued_at,
            });
        }
        for r in store.resets.iter() {
            events.push(Event::ResetIssued {
                user_id: r.user_id,
                token: r.token.clone(),
                at: r.issued_at,
            });
        }
        for c in store.categories.iter() {
            events.push(Event::CategoryCreated {
                id: c.id,
                location: c.location.clone(),
            });
        }
        for p in store.properties.iter() {
            events.push(Event::PropertyCreated {
                id: p.id,
                tenant_id: p.tenant_id,
                category_id: p.category_id,
                name: p.name.clone(),
                description: p.description.clone(),
                picture: p.picture,
                at: p.created_at,
            });
        }
        for rs in rooms {
            events.push(Event::RoomCreated {
                id: rs.id,
                property_id: rs.property_id,
                room_type: rs.room_type.clone(),
                price: rs.price,
                description: rs.description.clone(),
            });
            if !rs.calendar.is_empty() {
                events.push(Event::DatesOpened {
                    room_id: rs.id,
                    dates: rs.calendar.iter().map(|(d, s)| (*d, s.markup_bp)).collect(),
                });
            }
        }

        // Creation order, so a night freed by a cancellation is re-locked by
        // the later order that took it.
        let mut orders: Vec<Order> = store.orders.iter().map(|o| o.clone()).collect();
        orders.sort_by_key(|o| (o.created_at, o.id));
        for o in orders {
            events.extend(order_history(&o));
        }

        for r in store.reviews.iter() {
            events.push(Event::ReviewOpened {
                id: r.id,
                property_id: r.property_id,
                user_id: r.user_id,
                at: r.created_at,
            });
            if r.done {
                events.push(Event::ReviewSubmitted {
                    id: r.id,
                    rating: r.rating,
                    comment: r.comment.clone(),
                    at: r.updated_at,
                });
            }
        }

        events
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

/// The shortest event sequence that leaves an order in its current state.
fn order_history(o: &Order) -> Vec<Event> {
    let mut events = vec![Event::OrderPlaced {
        id: o.id,
        invoice_id: o.invoice_id.clone(),
        user_id: o.user_id,
        room_id: o.room_id,
        property_id: o.property_id,
        start_date: o.start_date,
        end_date: o.end_date,
        total_price: o.total_price,
        at: o.created_at,
        expires_at: o.expires_at.unwrap_or(o.created_at),
    }];
    if let Some(image_id) = o.payment_proof {
        events.push(Event::PaymentProofUploaded {
            id: o.id,
            room_id: o.room_id,
            image_id,
            at: o.updated_at,
        });
    }
    match o.status {
        OrderStatus::Pending => {
            if o.updated_at != o.created_at {
                events.push(Event::OrderRejected {
                    id: o.id,
                    room_id: o.room_id,
                    expires_at: o.expires_at.unwrap_or(o.updated_at),
                    at: o.updated_at,
                });
            }
        }
        OrderStatus::Waiting => {}
        OrderStatus::Complete => events.push(Event::OrderConfirmed {
            id: o.id,
            room_id: o.room_id,
            review_id: None,
            at: o.updated_at,
        }),
        OrderStatus::Cancelled => events.push(Event::OrderCancelled {
            id: o.id,
            room_id: o.room_id,
            reason: o.cancel_reason.unwrap_or(CancelReason::Expired),
            at: o.updated_at,
        }),
    }
    events
}

// ── Session checks ───────────────────────────────────────

pub(super) fn require_tenant(session: &Session) -> Result<Ulid, EngineError> {
    match session.role {
        Role::Tenant => Ok(session.account_id),
        Role::User => Err(EngineError::Forbidden("tenant account required")),
    }
}

pub(super) fn require_user(session: &Session) -> Result<Ulid, EngineError> {
    match session.role {
        Role::User => Ok(session.account_id),
        Role::Tenant => Err(EngineError::Forbidden("user account required")),
    }
}

pub(super) fn invalid(e: String) -> EngineError {
    EngineError::Invalid(e)
}

/// 1-based page of `PAGE_SIZE` items. Page 0 reads as page 1.
pub(super) fn paginate<T>(items: Vec<T>, page: usize) -> Page<T> {
    let total = items.len();
    let page = page.clamp(1, MAX_PAGE);
    let items = items
        .into_iter()
        .skip((page - 1) * PAGE_SIZE)
        .take(PAGE_SIZE)
        .collect();
    Page { total, items }
}
