use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;
use crate::pricing;

use super::SharedRoomState;

/// In-memory state of one site, rebuilt from the WAL on startup.
///
/// Everything except room calendars lives in flat maps. Calendars sit behind
/// a per-room `RwLock` so bookings on different rooms never contend.
pub struct Store {
    pub(super) tenants: DashMap<Ulid, Tenant>,
    pub(super) users: DashMap<Ulid, User>,
    tenant_emails: DashMap<String, Ulid>,
    user_emails: DashMap<String, Ulid>,
    pub(super) verifications: DashMap<Ulid, Verification>,
    /// Reset token → pending reset. At most one per user.
    pub(super) resets: DashMap<String, PasswordReset>,
    pub(super) categories: DashMap<Ulid, Category>,
    pub(super) properties: DashMap<Ulid, Property>,
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    /// Property → rooms index.
    pub(super) property_rooms: DashMap<Ulid, Vec<Ulid>>,
    pub(super) images: DashMap<Ulid, Image>,
    pub(super) orders: DashMap<Ulid, Order>,
    pub(super) invoices: DashMap<String, Ulid>,
    pub(super) reviews: DashMap<Ulid, Review>,
    /// (user, property) → review. One review per pair.
    pub(super) review_index: DashMap<(Ulid, Ulid), Ulid>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

impl Store {
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
            users: DashMap::new(),
            tenant_emails: DashMap::new(),
            user_emails: DashMap::new(),
            verifications: DashMap::new(),
            resets: DashMap::new(),
            categories: DashMap::new(),
            properties: DashMap::new(),
            rooms: DashMap::new(),
            property_rooms: DashMap::new(),
            images: DashMap::new(),
            orders: DashMap::new(),
            invoices: DashMap::new(),
            reviews: DashMap::new(),
            review_index: DashMap::new(),
        }
    }

    // ── Lookups ──────────────────────────────────────────────

    pub fn account_by_email(&self, role: Role, email: &str) -> Option<Ulid> {
        let index = match role {
            Role::Tenant => &self.tenant_emails,
            Role::User => &self.user_emails,
        };
        index.get(&normalize_email(email)).map(|e| *e.value())
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn rooms_of(&self, property_id: &Ulid) -> Vec<Ulid> {
        self.property_rooms
            .get(property_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn has_rooms(&self, property_id: &Ulid) -> bool {
        self.property_rooms
            .get(property_id)
            .is_some_and(|rooms| !rooms.is_empty())
    }

    pub fn property_owner(&self, property_id: &Ulid) -> Option<Ulid> {
        self.properties.get(property_id).map(|p| p.tenant_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event that does not touch a room calendar.
    pub fn apply(&self, event: &Event) {
        match event {
            Event::TenantRegistered {
                id,
                name,
                email,
                password_hash,
                phone_number,
                ktp_card,
                at,
            } => {
                self.tenant_emails.insert(normalize_email(email), *id);
                self.tenants.insert(
                    *id,
                    Tenant {
                        id: *id,
                        name: name.clone(),
                        email: email.clone(),
                        password_hash: password_hash.clone(),
                        phone_number: phone_number.clone(),
                        ktp_card: *ktp_card,
                        created_at: *at,
                    },
                );
            }
            Event::UserRegistered {
                id,
                name,
                email,
                password_hash,
                phone_number,
                at,
            } => {
                self.user_emails.insert(normalize_email(email), *id);
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        name: name.clone(),
                        email: email.clone(),
                        password_hash: password_hash.clone(),
                        phone_number: phone_number.clone(),
                        profile_picture: None,
                        gender: None,
                        birth_date: None,
                        verified: false,
                        created_at: *at,
                    },
                );
            }
            Event::OtpIssued {
                user_id,
                otp,
                attempts_left,
                at,
            } => {
                self.verifications.insert(
                    *user_id,
                    Verification {
                        user_id: *user_id,
                        otp: otp.clone(),
                        attempts_left: *attempts_left,
                        issued_at: *at,
                    },
                );
            }
            Event::UserVerified { user_id } => {
                if let Some(mut user) = self.users.get_mut(user_id) {
                    user.verified = true;
                }
                self.verifications.remove(user_id);
            }
            Event::ProfileUpdated {
                user_id,
                name,
                phone_number,
                gender,
                birth_date,
                profile_picture,
            } => {
                if let Some(mut user) = self.users.get_mut(user_id) {
                    user.name = name.clone();
                    user.phone_number = phone_number.clone();
                    user.gender = gender.clone();
                    user.birth_date = *birth_date;
                    user.profile_picture = *profile_picture;
                }
            }
            Event::PasswordChanged {
                role,
                account_id,
                password_hash,
            } => match role {
                Role::Tenant => {
                    if let Some(mut t) = self.tenants.get_mut(account_id) {
                        t.password_hash = password_hash.clone();
                    }
                }
                Role::User => {
                    if let Some(mut u) = self.users.get_mut(account_id) {
                        u.password_hash = password_hash.clone();
                    }
                }
            },
            Event::ResetIssued { user_id, token, at } => {
                self.resets.retain(|_, r| r.user_id != *user_id);
                self.resets.insert(
                    token.clone(),
                    PasswordReset {
                        token: token.clone(),
                        user_id: *user_id,
                        issued_at: *at,
                    },
                );
            }
            Event::ResetCompleted {
                token,
                user_id,
                password_hash,
            } => {
                self.resets.remove(token);
                if let Some(mut u) = self.users.get_mut(user_id) {
                    u.password_hash = password_hash.clone();
                }
            }
            Event::CategoryCreated { id, location } | Event::CategoryUpdated { id, location } => {
                self.categories.insert(
                    *id,
                    Category {
                        id: *id,
                        location: location.clone(),
                    },
                );
            }
            Event::CategoryDeleted { id } => {
                self.categories.remove(id);
            }
            Event::PropertyCreated {
                id,
                tenant_id,
                category_id,
                name,
                description,
                picture,
                at,
            } => {
                self.properties.insert(
                    *id,
                    Property {
                        id: *id,
                        tenant_id: *tenant_id,
                        category_id: *category_id,
                        name: name.clone(),
                        description: description.clone(),
                        picture: *picture,
                        created_at: *at,
                    },
                );
            }
            Event::PropertyUpdated {
                id,
                category_id,
                name,
                description,
                picture,
            } => {
                if let Some(mut p) = self.properties.get_mut(id) {
                    p.category_id = *category_id;
                    p.name = name.clone();
                    p.description = description.clone();
                    p.picture = *picture;
                }
            }
            Event::PropertyDeleted { id } => {
                self.properties.remove(id);
                self.property_rooms.remove(id);
            }
            Event::RoomCreated {
                id,
                property_id,
                room_type,
                price,
                description,
            } => {
                let rs = RoomState::new(*id, *property_id, room_type.clone(), *price, description.clone());
                self.rooms.insert(*id, Arc::new(RwLock::new(rs)));
                self.property_rooms.entry(*property_id).or_default().push(*id);
            }
            Event::RoomDeleted { id } => {
                if let Some((_, rs)) = self.rooms.remove(id) {
                    // Deletion holds the room's write lock, replay owns it outright.
                    let property_id = rs.try_read().map(|g| g.property_id).ok();
                    match property_id {
                        Some(pid) => {
                            if let Some(mut rooms) = self.property_rooms.get_mut(&pid) {
                                rooms.retain(|r| r != id);
                            }
                        }
                        None => {
                            for mut rooms in self.property_rooms.iter_mut() {
                                rooms.retain(|r| r != id);
                            }
                        }
                    }
                }
            }
            Event::ImageStored {
                id,
                content_type,
                file_name,
                size,
            } => {
                self.images.insert(
                    *id,
                    Image {
                        id: *id,
                        content_type: content_type.clone(),
                        file_name: file_name.clone(),
                        size: *size,
                    },
                );
            }
            Event::ReviewOpened {
                id,
                property_id,
                user_id,
                at,
            } => self.open_review(*id, *property_id, *user_id, *at),
            Event::ReviewSubmitted {
                id,
                rating,
                comment,
                at,
            } => {
                if let Some(mut r) = self.reviews.get_mut(id) {
                    r.rating = *rating;
                    r.comment = comment.clone();
                    r.done = true;
                    r.updated_at = *at;
                }
            }
            // Room-scoped events go through apply_to_room.
            Event::RoomUpdated { .. }
            | Event::DatesOpened { .. }
            | Event::DateClosed { .. }
            | Event::OrderPlaced { .. }
            | Event::PaymentProofUploaded { .. }
            | Event::OrderConfirmed { .. }
            | Event::OrderRejected { .. }
            | Event::OrderCancelled { .. } => {}
        }
    }

    /// Apply a room-scoped event. The caller holds the room's write lock, which
    /// also guards every order on that room.
    pub fn apply_to_room(&self, rs: &mut RoomState, event: &Event) {
        match event {
            Event::RoomUpdated {
                room_type,
                price,
                description,
                ..
            } => {
                rs.room_type = room_type.clone();
                rs.price = *price;
                rs.description = description.clone();
            }
            Event::DatesOpened { dates, .. } => {
                for (date, markup_bp) in dates {
                    rs.calendar.entry(*date).or_insert(DayState {
                        markup_bp: *markup_bp,
                        booked_by: None,
                    });
                }
            }
            Event::DateClosed { date, .. } => {
                rs.calendar.remove(date);
            }
            Event::OrderPlaced {
                id,
                invoice_id,
                user_id,
                room_id,
                property_id,
                start_date,
                end_date,
                total_price,
                at,
                expires_at,
            } => {
                let nights = pricing::nights(*start_date, *end_date).unwrap_or_default();
                rs.lock_nights(&nights, *id);
                self.invoices.insert(invoice_id.clone(), *id);
                self.orders.insert(
                    *id,
                    Order {
                        id: *id,
                        invoice_id: invoice_id.clone(),
                        user_id: *user_id,
                        room_id: *room_id,
                        property_id: *property_id,
                        start_date: *start_date,
                        end_date: *end_date,
                        total_price: *total_price,
                        payment_proof: None,
                        status: OrderStatus::Pending,
                        created_at: *at,
                        updated_at: *at,
                        expires_at: Some(*expires_at),
                        cancel_reason: None,
                    },
                );
            }
            Event::PaymentProofUploaded { id, image_id, at, .. } => {
                if let Some(mut o) = self.orders.get_mut(id) {
                    o.status = OrderStatus::Waiting;
                    o.payment_proof = Some(*image_id);
                    o.expires_at = None;
                    o.updated_at = *at;
                }
            }
            Event::OrderConfirmed { id, review_id, at, .. } => {
                let opened = self.orders.get_mut(id).map(|mut o| {
                    o.status = OrderStatus::Complete;
                    o.expires_at = None;
                    o.updated_at = *at;
                    (o.property_id, o.user_id)
                });
                if let (Some(review_id), Some((property_id, user_id))) = (review_id, opened) {
                    self.open_review(*review_id, property_id, user_id, *at);
                }
            }
            Event::OrderRejected { id, expires_at, at, .. } => {
                if let Some(mut o) = self.orders.get_mut(id) {
                    o.status = OrderStatus::Pending;
                    o.payment_proof = None;
                    o.expires_at = Some(*expires_at);
                    o.updated_at = *at;
                }
            }
            Event::OrderCancelled { id, reason, at, .. } => {
                if let Some(mut o) = self.orders.get_mut(id) {
                    o.status = OrderStatus::Cancelled;
                    o.cancel_reason = Some(*reason);
                    o.expires_at = None;
                    o.updated_at = *at;
                }
                rs.release_nights(*id);
            }
            _ => {}
        }
    }

    fn open_review(&self, id: Ulid, property_id: Ulid, user_id: Ulid, at: Ms) {
        self.review_index.insert((user_id, property_id), id);
        self.reviews.insert(
            id,
            Review {
                id,
                property_id,
                user_id,
                rating: 0,
                comment: String::new(),
                done: false,
                created_at: at,
                updated_at: at,
            },
        );
    }
}
