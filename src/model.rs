use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds: the timestamp type for everything that is not a calendar day.
pub type Ms = i64;

/// A calendar day. A booked night is identified by the day it starts on.
pub type Day = NaiveDate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Landlord: owns properties, rooms and calendars, fulfills orders.
    Tenant,
    /// Renter: books rooms, pays, reviews.
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Tenant => "tenant",
            Role::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s.to_ascii_lowercase().as_str() {
            "tenant" => Some(Role::Tenant),
            "user" => Some(Role::User),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Nights are locked, waiting for a payment proof until `expires_at`.
    Pending,
    /// Payment proof uploaded, waiting for the tenant.
    Waiting,
    Complete,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "Pending",
            OrderStatus::Waiting => "Waiting",
            OrderStatus::Complete => "Complete",
            OrderStatus::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(OrderStatus::Pending),
            "waiting" => Some(OrderStatus::Waiting),
            "complete" => Some(OrderStatus::Complete),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// Active orders hold nights on their room.
    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Waiting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    User,
    Tenant,
    /// Payment deadline passed while Pending.
    Expired,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::User => "user",
            CancelReason::Tenant => "tenant",
            CancelReason::Expired => "expired",
        }
    }
}

// ── Accounts ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub phone_number: String,
    pub ktp_card: Option<Ulid>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub phone_number: String,
    pub profile_picture: Option<Ulid>,
    pub gender: Option<String>,
    pub birth_date: Option<Day>,
    pub verified: bool,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub user_id: Ulid,
    pub otp: String,
    pub attempts_left: u8,
    pub issued_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordReset {
    pub token: String,
    pub user_id: Ulid,
    pub issued_at: Ms,
}

/// A logged-in account. Kept in memory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub token: Ulid,
    pub role: Role,
    pub account_id: Ulid,
    pub expires_at: Ms,
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub id: Ulid,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub category_id: Ulid,
    pub name: String,
    pub description: String,
    pub picture: Option<Ulid>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: Ulid,
    pub content_type: String,
    pub file_name: String,
    pub size: usize,
}

/// One opened date on a room's calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayState {
    /// Price markup in basis points (500 = +5%).
    pub markup_bp: i32,
    /// The order holding this night, if any.
    pub booked_by: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomState {
    pub id: Ulid,
    pub property_id: Ulid,
    pub room_type: String,
    /// Base price per night in the smallest currency unit.
    pub price: u64,
    pub description: String,
    /// Opened dates. A day missing from the map cannot be booked.
    pub calendar: BTreeMap<Day, DayState>,
}

impl RoomState {
    pub fn new(id: Ulid, property_id: Ulid, room_type: String, price: u64, description: String) -> Self {
        Self {
            id,
            property_id,
            room_type,
            price,
            description,
            calendar: BTreeMap::new(),
        }
    }

    /// Markups for every night of a stay, or the first night that is not
    /// opened or already held by an order.
    pub fn stay_markups(&self, nights: &[Day]) -> Result<Vec<(Day, i32)>, Day> {
        let mut out = Vec::with_capacity(nights.len());
        for night in nights {
            match self.calendar.get(night) {
                Some(day) if day.booked_by.is_none() => out.push((*night, day.markup_bp)),
                _ => return Err(*night),
            }
        }
        Ok(out)
    }

    /// Mark free nights as held by `order_id`. A night held by another order keeps its holder.
    pub fn lock_nights(&mut self, nights: &[Day], order_id: Ulid) {
        for night in nights {
            if let Some(day) = self.calendar.get_mut(night)
                && day.booked_by.is_none()
            {
                day.booked_by = Some(order_id);
            }
        }
    }

    /// Free every night held by `order_id`. Nights held by other orders are untouched.
    pub fn release_nights(&mut self, order_id: Ulid) -> usize {
        let mut released = 0;
        for day in self.calendar.values_mut() {
            if day.booked_by == Some(order_id) {
                day.booked_by = None;
                released += 1;
            }
        }
        released
    }

    pub fn has_open_dates(&self) -> bool {
        self.calendar.values().any(|d| d.booked_by.is_none())
    }
}

// ── Orders & reviews ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub id: Ulid,
    pub invoice_id: String,
    pub user_id: Ulid,
    pub room_id: Ulid,
    pub property_id: Ulid,
    /// First night.
    pub start_date: Day,
    /// Checkout day; not a booked night.
    pub end_date: Day,
    pub total_price: u64,
    pub payment_proof: Option<Ulid>,
    pub status: OrderStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Payment deadline while Pending.
    pub expires_at: Option<Ms>,
    pub cancel_reason: Option<CancelReason>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub id: Ulid,
    pub property_id: Ulid,
    pub user_id: Ulid,
    pub rating: u8,
    pub comment: String,
    pub done: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TenantRegistered {
        id: Ulid,
        name: String,
        email: String,
        password_hash: String,
        phone_number: String,
        ktp_card: Option<Ulid>,
        at: Ms,
    },
    UserRegistered {
        id: Ulid,
        name: String,
        email: String,
        password_hash: String,
        phone_number: String,
        at: Ms,
    },
    OtpIssued {
        user_id: Ulid,
        otp: String,
        attempts_left: u8,
        at: Ms,
    },
    UserVerified {
        user_id: Ulid,
    },
    ProfileUpdated {
        user_id: Ulid,
        name: String,
        phone_number: String,
        gender: Option<String>,
        birth_date: Option<Day>,
        profile_picture: Option<Ulid>,
    },
    PasswordChanged {
        role: Role,
        account_id: Ulid,
        password_hash: String,
    },
    ResetIssued {
        user_id: Ulid,
        token: String,
        at: Ms,
    },
    ResetCompleted {
        token: String,
        user_id: Ulid,
        password_hash: String,
    },
    CategoryCreated {
        id: Ulid,
        location: String,
    },
    CategoryUpdated {
        id: Ulid,
        location: String,
    },
    CategoryDeleted {
        id: Ulid,
    },
    PropertyCreated {
        id: Ulid,
        tenant_id: Ulid,
        category_id: Ulid,
        name: String,
        description: String,
        picture: Option<Ulid>,
        at: Ms,
    },
    PropertyUpdated {
        id: Ulid,
        category_id: Ulid,
        name: String,
        description: String,
        picture: Option<Ulid>,
    },
    PropertyDeleted {
        id: Ulid,
    },
    RoomCreated {
        id: Ulid,
        property_id: Ulid,
        room_type: String,
        price: u64,
        description: String,
    },
    RoomUpdated {
        id: Ulid,
        room_type: String,
        price: u64,
        description: String,
    },
    RoomDeleted {
        id: Ulid,
    },
    DatesOpened {
        room_id: Ulid,
        dates: Vec<(Day, i32)>,
    },
    DateClosed {
        room_id: Ulid,
        date: Day,
    },
    ImageStored {
        id: Ulid,
        content_type: String,
        file_name: String,
        size: usize,
    },
    OrderPlaced {
        id: Ulid,
        invoice_id: String,
        user_id: Ulid,
        room_id: Ulid,
        property_id: Ulid,
        start_date: Day,
        end_date: Day,
        total_price: u64,
        at: Ms,
        expires_at: Ms,
    },
    PaymentProofUploaded {
        id: Ulid,
        room_id: Ulid,
        image_id: Ulid,
        at: Ms,
    },
    OrderConfirmed {
        id: Ulid,
        room_id: Ulid,
        /// Review opened by this confirmation, if the user had none for the property.
        review_id: Option<Ulid>,
        at: Ms,
    },
    OrderRejected {
        id: Ulid,
        room_id: Ulid,
        expires_at: Ms,
        at: Ms,
    },
    OrderCancelled {
        id: Ulid,
        room_id: Ulid,
        reason: CancelReason,
        at: Ms,
    },
    /// An empty review slot. Written by compaction; live confirmations carry
    /// the review id on `OrderConfirmed` instead.
    ReviewOpened {
        id: Ulid,
        property_id: Ulid,
        user_id: Ulid,
        at: Ms,
    },
    ReviewSubmitted {
        id: Ulid,
        rating: u8,
        comment: String,
        at: Ms,
    },
}

impl Event {
    /// The room whose calendar or orders this event touches. Room-scoped events
    /// are applied under that room's write lock.
    pub fn room_id(&self) -> Option<Ulid> {
        match self {
            Event::RoomUpdated { id, .. } => Some(*id),
            Event::DatesOpened { room_id, .. }
            | Event::DateClosed { room_id, .. }
            | Event::OrderPlaced { room_id, .. }
            | Event::PaymentProofUploaded { room_id, .. }
            | Event::OrderConfirmed { room_id, .. }
            | Event::OrderRejected { room_id, .. }
            | Event::OrderCancelled { room_id, .. } => Some(*room_id),
            _ => None,
        }
    }

    /// The order an event belongs to, for notification fan-out.
    pub fn order_id(&self) -> Option<Ulid> {
        match self {
            Event::OrderPlaced { id, .. }
            | Event::PaymentProofUploaded { id, .. }
            | Event::OrderConfirmed { id, .. }
            | Event::OrderRejected { id, .. }
            | Event::OrderCancelled { id, .. } => Some(*id),
            _ => None,
        }
    }
}

// ── Listing filters ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyQuery {
    pub tenant_id: Option<Ulid>,
    pub category_id: Option<Ulid>,
    /// Case-insensitive substring of the property name.
    pub search: Option<String>,
    pub descending: bool,
    /// 1-based.
    pub page: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomQuery {
    pub property_id: Option<Ulid>,
    /// Case-insensitive substring of the room type.
    pub search: Option<String>,
    pub descending: bool,
    pub page: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderSort {
    #[default]
    CreatedAt,
    StartDate,
    TotalPrice,
}

impl OrderSort {
    pub fn parse(s: &str) -> Option<OrderSort> {
        match s.to_ascii_lowercase().as_str() {
            "created_at" => Some(OrderSort::CreatedAt),
            "start_date" => Some(OrderSort::StartDate),
            "total_price" => Some(OrderSort::TotalPrice),
            _ => None,
        }
    }
}

/// A renter's own orders. Results are newest first by the sort key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderQuery {
    pub status: Option<OrderStatus>,
    /// Substring of the invoice id.
    pub invoice: Option<String>,
    /// Only stays covering this day (`start_date <= day <= end_date`).
    pub date: Option<Day>,
    pub sort: OrderSort,
    pub page: usize,
}

/// Partial profile edit; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub phone_number: Option<String>,
    pub gender: Option<String>,
    pub birth_date: Option<Day>,
    pub profile_picture: Option<Ulid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyUpdate {
    pub category_id: Option<Ulid>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub picture: Option<Ulid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomUpdate {
    pub room_type: Option<String>,
    pub price: Option<u64>,
    pub description: Option<String>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// Matching rows before pagination.
    pub total: usize,
    pub items: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginInfo {
    pub token: Ulid,
    pub role: Role,
    pub account_id: Ulid,
    pub email: String,
    pub expires_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileInfo {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub phone_number: String,
    pub gender: Option<String>,
    pub birth_date: Option<Day>,
    pub profile_picture: Option<Ulid>,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    pub picture: Option<Ulid>,
    pub category_id: Ulid,
    pub location: String,
    pub tenant_id: Ulid,
    pub tenant_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyPrice {
    pub property: PropertyInfo,
    /// Cheapest base room price; `None` for a property without rooms.
    pub lowest_price: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: Ulid,
    pub property_id: Ulid,
    pub property_name: String,
    pub room_type: String,
    pub price: u64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateInfo {
    pub room_id: Ulid,
    pub date: Day,
    pub markup_bp: i32,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderInfo {
    pub order: Order,
    pub room_type: String,
    pub property_name: String,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderReport {
    /// Orders still in progress (Pending or Waiting).
    pub waiting: usize,
    pub complete: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewInfo {
    pub review: Review,
    pub property_name: String,
    pub location: String,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub room: RoomInfo,
    pub location: String,
    pub total_price: u64,
}
