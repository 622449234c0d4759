use std::collections::HashMap;

use dashmap::mapref::entry::Entry;
use rand::Rng;
use tracing::{debug, info};
use ulid::Ulid;

use crate::mailer::{self, CompletedStay};
use crate::model::*;
use crate::observability;
use crate::pricing;

use super::{day_of, now_ms, paginate, require_tenant, require_user, Engine, EngineError};

const INVOICE_ATTEMPTS: usize = 16;

fn random_invoice() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "INV-{:05}-{:05}",
        rng.gen_range(0..100_000),
        rng.gen_range(0..100_000)
    )
}

fn transition(order: &Order, action: &'static str) -> EngineError {
    EngineError::InvalidTransition {
        order: order.id,
        from: order.status,
        action,
    }
}

impl Engine {
    /// Claim an unused invoice number for `order_id`.
    fn reserve_invoice(&self, order_id: Ulid) -> Result<String, EngineError> {
        for _ in 0..INVOICE_ATTEMPTS {
            let invoice = random_invoice();
            if let Entry::Vacant(slot) = self.store.invoices.entry(invoice.clone()) {
                slot.insert(order_id);
                return Ok(invoice);
            }
        }
        Err(EngineError::LimitExceeded("no free invoice number"))
    }

    /// Claim an order id across the whole site; room locks alone do not
    /// cover placements on two rooms. A placement applies its order before
    /// releasing the slot, so `orders` is checked after claiming.
    fn reserve_order_id(&self, id: Ulid) -> Result<(), EngineError> {
        match self.placing.entry(id) {
            Entry::Vacant(slot) => {
                slot.insert(());
            }
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists("order", id)),
        }
        if self.store.orders.contains_key(&id) {
            self.placing.remove(&id);
            return Err(EngineError::AlreadyExists("order", id));
        }
        Ok(())
    }

    fn fresh_order(&self, id: Ulid) -> Result<Order, EngineError> {
        self.store
            .orders
            .get(&id)
            .map(|o| o.clone())
            .ok_or(EngineError::NotFound("order", id))
    }

    fn check_order_tenant(&self, session: &Session, order: &Order) -> Result<Ulid, EngineError> {
        let tenant_id = require_tenant(session)?;
        if self.store.property_owner(&order.property_id) != Some(tenant_id) {
            return Err(EngineError::Forbidden("order is on another tenant's property"));
        }
        Ok(tenant_id)
    }

    fn check_order_user(&self, session: &Session, order: &Order) -> Result<Ulid, EngineError> {
        let user_id = require_user(session)?;
        if order.user_id != user_id {
            return Err(EngineError::Forbidden("order belongs to another user"));
        }
        Ok(user_id)
    }

    /// Cancel under the room's write lock and release the order's nights.
    async fn cancel_locked(
        &self,
        rs: &mut RoomState,
        order: &Order,
        reason: CancelReason,
        now: Ms,
    ) -> Result<Order, EngineError> {
        let event = Event::OrderCancelled {
            id: order.id,
            room_id: order.room_id,
            reason,
            at: now,
        };
        self.persist_to_room(rs, &event).await?;
        metrics::counter!(observability::ORDERS_CANCELLED_TOTAL, "reason" => reason.as_str())
            .increment(1);
        self.fresh_order(order.id)
    }

    // ── Booking ──────────────────────────────────────────────

    /// Book `[start, end)` on a room. The availability check, the WAL append
    /// and the night locks all happen under the room's write lock, so two
    /// overlapping bookings can never both succeed.
    pub async fn place_order(
        &self,
        session: &Session,
        id: Ulid,
        room_id: Ulid,
        start: Day,
        end: Day,
    ) -> Result<Order, EngineError> {
        let user_id = require_user(session)?;
        let verified = self
            .store
            .users
            .get(&user_id)
            .map(|u| u.verified)
            .ok_or(EngineError::Unauthenticated)?;
        if !verified {
            return Err(EngineError::NotVerified);
        }
        let nights = pricing::nights(start, end).map_err(|e| EngineError::Invalid(e.to_string()))?;
        let now = now_ms();
        if start < day_of(now) {
            return Err(EngineError::Invalid(format!("start date {start} is in the past")));
        }

        let mut guard = self.room_write(room_id).await?;
        self.reserve_order_id(id)?;
        let result = self.place_locked(&mut guard, id, user_id, room_id, start, end, &nights, now).await;
        self.placing.remove(&id);
        drop(guard);
        let order = result?;

        metrics::counter!(observability::ORDERS_PLACED_TOTAL).increment(1);
        info!(
            "order {} placed on room {room_id}: {} nights, total {}",
            order.invoice_id,
            nights.len(),
            order.total_price
        );
        self.notify_order(&order, "placed");
        Ok(order)
    }

    #[allow(clippy::too_many_arguments)]
    async fn place_locked(
        &self,
        guard: &mut RoomState,
        id: Ulid,
        user_id: Ulid,
        room_id: Ulid,
        start: Day,
        end: Day,
        nights: &[Day],
        now: Ms,
    ) -> Result<Order, EngineError> {
        let markups = guard
            .stay_markups(nights)
            .map_err(EngineError::DateUnavailable)?;
        let quote = pricing::quote(guard.price, &markups);
        let invoice_id = self.reserve_invoice(id)?;

        let event = Event::OrderPlaced {
            id,
            invoice_id: invoice_id.clone(),
            user_id,
            room_id,
            property_id: guard.property_id,
            start_date: start,
            end_date: end,
            total_price: quote.total,
            at: now,
            expires_at: now + self.config.payment_window_ms,
        };
        if let Err(e) = self.persist_to_room(guard, &event).await {
            self.store.invoices.remove(&invoice_id);
            return Err(e);
        }
        self.fresh_order(id)
    }

    /// `Pending → Waiting`. A proof arriving after the deadline cancels the
    /// order instead.
    pub async fn upload_payment_proof(
        &self,
        session: &Session,
        order_id: Ulid,
        image_id: Ulid,
    ) -> Result<Order, EngineError> {
        require_user(session)?;
        if !self.store.images.contains_key(&image_id) {
            return Err(EngineError::NotFound("image", image_id));
        }

        let (order, mut guard) = self.order_write(order_id).await?;
        self.check_order_user(session, &order)?;
        if order.status != OrderStatus::Pending {
            return Err(transition(&order, "upload a payment proof for"));
        }
        let now = now_ms();
        if order.expires_at.is_some_and(|deadline| deadline <= now) {
            let cancelled = self
                .cancel_locked(&mut guard, &order, CancelReason::Expired, now)
                .await?;
            drop(guard);
            info!("order {} expired at proof upload", cancelled.invoice_id);
            self.notify_order(&cancelled, "expired");
            return Err(transition(&cancelled, "upload a payment proof for"));
        }

        let event = Event::PaymentProofUploaded {
            id: order_id,
            room_id: order.room_id,
            image_id,
            at: now,
        };
        self.persist_to_room(&mut guard, &event).await?;
        drop(guard);

        let order = self.fresh_order(order_id)?;
        self.notify_order(&order, "payment_uploaded");
        Ok(order)
    }

    /// `Waiting → Complete`. Opens the user's review slot for the property
    /// and mails the confirmation.
    pub async fn confirm_order(&self, session: &Session, order_id: Ulid) -> Result<Order, EngineError> {
        let (order, mut guard) = self.order_write(order_id).await?;
        self.check_order_tenant(session, &order)?;
        if order.status != OrderStatus::Waiting {
            return Err(transition(&order, "confirm"));
        }

        let review_key = (order.user_id, order.property_id);
        let review_id = match self.store.review_index.entry(review_key) {
            Entry::Vacant(slot) => {
                let id = Ulid::new();
                slot.insert(id);
                Some(id)
            }
            Entry::Occupied(_) => None,
        };
        let event = Event::OrderConfirmed {
            id: order_id,
            room_id: order.room_id,
            review_id,
            at: now_ms(),
        };
        if let Err(e) = self.persist_to_room(&mut guard, &event).await {
            if review_id.is_some() {
                self.store.review_index.remove(&review_key);
            }
            return Err(e);
        }
        let room_type = guard.room_type.clone();
        drop(guard);

        let order = self.fresh_order(order_id)?;
        metrics::counter!(observability::ORDERS_COMPLETED_TOTAL).increment(1);
        info!("order {} complete", order.invoice_id);
        self.notify_order(&order, "confirmed");

        let user = self.store.users.get(&order.user_id).map(|u| (u.email.clone(), u.name.clone()));
        let property_name = self
            .store
            .properties
            .get(&order.property_id)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        if let Some((email, user_name)) = user {
            let stay = CompletedStay {
                user_name: &user_name,
                property_name: &property_name,
                room_type: &room_type,
            };
            self.deliver(mailer::order_complete_mail(&email, &order, &stay))
                .await;
        }
        Ok(order)
    }

    /// `Waiting → Pending`: the proof is discarded and a new payment window opens.
    pub async fn reject_order(&self, session: &Session, order_id: Ulid) -> Result<Order, EngineError> {
        let (order, mut guard) = self.order_write(order_id).await?;
        self.check_order_tenant(session, &order)?;
        if order.status != OrderStatus::Waiting {
            return Err(transition(&order, "reject"));
        }
        let now = now_ms();
        let event = Event::OrderRejected {
            id: order_id,
            room_id: order.room_id,
            expires_at: now + self.config.payment_window_ms,
            at: now,
        };
        self.persist_to_room(&mut guard, &event).await?;
        drop(guard);

        let order = self.fresh_order(order_id)?;
        info!("order {} rejected, back to Pending", order.invoice_id);
        self.notify_order(&order, "rejected");
        Ok(order)
    }

    /// The user cancels a Pending order; the tenant cancels Pending or Waiting.
    pub async fn cancel_order(&self, session: &Session, order_id: Ulid) -> Result<Order, EngineError> {
        let (order, mut guard) = self.order_write(order_id).await?;
        let reason = match session.role {
            Role::User => {
                self.check_order_user(session, &order)?;
                if order.status != OrderStatus::Pending {
                    return Err(transition(&order, "cancel"));
                }
                CancelReason::User
            }
            Role::Tenant => {
                self.check_order_tenant(session, &order)?;
                if !order.status.is_active() {
                    return Err(transition(&order, "cancel"));
                }
                CancelReason::Tenant
            }
        };
        let cancelled = self.cancel_locked(&mut guard, &order, reason, now_ms()).await?;
        drop(guard);

        info!("order {} cancelled by {}", cancelled.invoice_id, reason.as_str());
        self.notify_order(&cancelled, "cancelled");
        Ok(cancelled)
    }

    // ── Expiry ───────────────────────────────────────────────

    /// Pending orders whose payment deadline is at or before `now`.
    pub fn collect_expired_orders(&self, now: Ms) -> Vec<Ulid> {
        self.store
            .orders
            .iter()
            .filter(|o| {
                o.status == OrderStatus::Pending && o.expires_at.is_some_and(|deadline| deadline <= now)
            })
            .map(|o| o.id)
            .collect()
    }

    /// Cancel one overdue order. Returns false when it was paid, cancelled
    /// or rejected again in the meantime.
    pub async fn expire_order(&self, order_id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let (order, mut guard) = self.order_write(order_id).await?;
        let overdue = order.status == OrderStatus::Pending
            && order.expires_at.is_some_and(|deadline| deadline <= now);
        if !overdue {
            debug!("order {order_id} no longer overdue");
            return Ok(false);
        }
        let cancelled = self
            .cancel_locked(&mut guard, &order, CancelReason::Expired, now)
            .await?;
        drop(guard);

        info!("order {} expired, nights released", cancelled.invoice_id);
        self.notify_order(&cancelled, "expired");
        Ok(true)
    }

    // ── Queries ──────────────────────────────────────────────

    async fn order_infos(&self, orders: Vec<Order>) -> Vec<OrderInfo> {
        let mut room_types: HashMap<Ulid, String> = HashMap::new();
        let mut out = Vec::with_capacity(orders.len());
        for order in orders {
            let room_type = match room_types.get(&order.room_id) {
                Some(t) => t.clone(),
                None => {
                    let t = match self.store.get_room(&order.room_id) {
                        Some(rs) => rs.read().await.room_type.clone(),
                        None => String::new(),
                    };
                    room_types.insert(order.room_id, t.clone());
                    t
                }
            };
            let property_name = self
                .store
                .properties
                .get(&order.property_id)
                .map(|p| p.name.clone())
                .unwrap_or_default();
            let user_name = self
                .store
                .users
                .get(&order.user_id)
                .map(|u| u.name.clone())
                .unwrap_or_default();
            out.push(OrderInfo {
                order,
                room_type,
                property_name,
                user_name,
            });
        }
        out
    }

    /// One order, visible to the user who placed it and the property's tenant.
    pub async fn order(&self, session: &Session, order_id: Ulid) -> Result<OrderInfo, EngineError> {
        let order = self.fresh_order(order_id)?;
        match session.role {
            Role::User => self.check_order_user(session, &order)?,
            Role::Tenant => self.check_order_tenant(session, &order)?,
        };
        let mut infos = self.order_infos(vec![order]).await;
        infos.pop().ok_or(EngineError::NotFound("order", order_id))
    }

    /// The session user's orders, newest first by the chosen sort key.
    pub async fn user_orders(&self, session: &Session, query: &OrderQuery) -> Result<Page<OrderInfo>, EngineError> {
        let user_id = require_user(session)?;
        let invoice = query.invoice.as_ref().map(|s| s.to_ascii_uppercase());
        let mut orders: Vec<Order> = self
            .store
            .orders
            .iter()
            .filter(|o| o.user_id == user_id)
            .filter(|o| query.status.is_none_or(|s| o.status == s))
            .filter(|o| {
                invoice
                    .as_ref()
                    .is_none_or(|needle| o.invoice_id.contains(needle.as_str()))
            })
            .filter(|o| query.date.is_none_or(|d| o.start_date <= d && d <= o.end_date))
            .map(|o| o.clone())
            .collect();
        match query.sort {
            OrderSort::CreatedAt => orders.sort_by_key(|o| std::cmp::Reverse((o.created_at, o.id))),
            OrderSort::StartDate => orders.sort_by_key(|o| std::cmp::Reverse((o.start_date, o.id))),
            OrderSort::TotalPrice => orders.sort_by_key(|o| std::cmp::Reverse((o.total_price, o.id))),
        }

        let page = paginate(orders, query.page);
        Ok(Page {
            total: page.total,
            items: self.order_infos(page.items).await,
        })
    }

    /// Orders on the session tenant's properties, least recently updated first.
    pub async fn tenant_orders(
        &self,
        session: &Session,
        status: Option<OrderStatus>,
        page: usize,
    ) -> Result<Page<OrderInfo>, EngineError> {
        let tenant_id = require_tenant(session)?;
        let mut orders: Vec<Order> = self
            .store
            .orders
            .iter()
            .filter(|o| self.store.property_owner(&o.property_id) == Some(tenant_id))
            .filter(|o| status.is_none_or(|s| o.status == s))
            .map(|o| o.clone())
            .collect();
        orders.sort_by_key(|o| (o.updated_at, o.id));

        let page = paginate(orders, page);
        Ok(Page {
            total: page.total,
            items: self.order_infos(page.items).await,
        })
    }

    pub fn order_report(&self, session: &Session) -> Result<OrderReport, EngineError> {
        let tenant_id = require_tenant(session)?;
        let mut report = OrderReport { waiting: 0, complete: 0 };
        for o in self.store.orders.iter() {
            if self.store.property_owner(&o.property_id) != Some(tenant_id) {
                continue;
            }
            match o.status {
                OrderStatus::Pending | OrderStatus::Waiting => report.waiting += 1,
                OrderStatus::Complete => report.complete += 1,
                OrderStatus::Cancelled => {}
            }
        }
        Ok(report)
    }

    /// Whether a session may follow a notification channel: `order_<id>` for
    /// anyone who can see the order, `property_<id>` for the owning tenant.
    pub async fn authorize_channel(&self, session: &Session, channel: &str) -> Result<(), EngineError> {
        let parse = |id: &str| {
            Ulid::from_string(id).map_err(|e| EngineError::Invalid(format!("bad id in channel {channel}: {e}")))
        };
        if let Some(id) = channel.strip_prefix("order_") {
            self.order(session, parse(id)?).await.map(|_| ())
        } else if let Some(id) = channel.strip_prefix("property_") {
            self.check_owner(session, parse(id)?).map(|_| ())
        } else {
            Err(EngineError::Invalid(format!(
                "unknown channel {channel} (expected order_<id> or property_<id>)"
            )))
        }
    }
}
