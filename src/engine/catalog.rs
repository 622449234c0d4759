use std::collections::BTreeSet;

use tracing::{info, warn};
use ulid::Ulid;

use crate::images;
use crate::limits::*;
use crate::model::*;
use crate::validate;

use super::{day_of, invalid, now_ms, require_tenant, Engine, EngineError};

fn same_location(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

impl Engine {
    /// Fails unless the session's tenant owns the property.
    pub(super) fn check_owner(&self, session: &Session, property_id: Ulid) -> Result<Ulid, EngineError> {
        let tenant_id = require_tenant(session)?;
        match self.store.property_owner(&property_id) {
            None => Err(EngineError::NotFound("property", property_id)),
            Some(owner) if owner != tenant_id => {
                Err(EngineError::Forbidden("property belongs to another tenant"))
            }
            Some(_) => Ok(tenant_id),
        }
    }

    fn location_taken(&self, location: &str, except: Option<Ulid>) -> Option<Ulid> {
        self.store
            .categories
            .iter()
            .find(|c| Some(c.id) != except && same_location(&c.location, location))
            .map(|c| c.id)
    }

    // ── Categories ───────────────────────────────────────────

    pub async fn create_category(&self, session: &Session, id: Ulid, location: &str) -> Result<(), EngineError> {
        require_tenant(session)?;
        validate::non_empty("location", location, MAX_NAME_LEN).map_err(invalid)?;

        let _catalog = self.catalog_lock.lock().await;
        if self.store.categories.contains_key(&id) {
            return Err(EngineError::AlreadyExists("category", id));
        }
        if let Some(existing) = self.location_taken(location, None) {
            return Err(EngineError::AlreadyExists("category", existing));
        }
        self.persist(&Event::CategoryCreated {
            id,
            location: location.trim().to_string(),
        })
        .await
    }

    pub async fn update_category(&self, session: &Session, id: Ulid, location: &str) -> Result<(), EngineError> {
        require_tenant(session)?;
        validate::non_empty("location", location, MAX_NAME_LEN).map_err(invalid)?;

        let _catalog = self.catalog_lock.lock().await;
        if !self.store.categories.contains_key(&id) {
            return Err(EngineError::NotFound("category", id));
        }
        if let Some(existing) = self.location_taken(location, Some(id)) {
            return Err(EngineError::AlreadyExists("category", existing));
        }
        self.persist(&Event::CategoryUpdated {
            id,
            location: location.trim().to_string(),
        })
        .await
    }

    pub async fn delete_category(&self, session: &Session, id: Ulid) -> Result<(), EngineError> {
        require_tenant(session)?;
        let _catalog = self.catalog_lock.lock().await;
        if !self.store.categories.contains_key(&id) {
            return Err(EngineError::NotFound("category", id));
        }
        if self.store.properties.iter().any(|p| p.category_id == id) {
            return Err(EngineError::HasDependents("category", id));
        }
        self.persist(&Event::CategoryDeleted { id }).await
    }

    /// All categories by location.
    pub fn categories(&self) -> Vec<Category> {
        let mut out: Vec<Category> = self.store.categories.iter().map(|c| c.clone()).collect();
        out.sort_by(|a, b| a.location.to_lowercase().cmp(&b.location.to_lowercase()));
        out
    }

    pub fn category(&self, id: Ulid) -> Result<Category, EngineError> {
        self.store
            .categories
            .get(&id)
            .map(|c| c.clone())
            .ok_or(EngineError::NotFound("category", id))
    }

    // ── Properties ───────────────────────────────────────────

    pub async fn create_property(
        &self,
        session: &Session,
        id: Ulid,
        category_id: Ulid,
        name: &str,
        description: &str,
        picture: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let tenant_id = require_tenant(session)?;
        validate::non_empty("name", name, MAX_NAME_LEN).map_err(invalid)?;
        validate::non_empty("description", description, MAX_DESCRIPTION_LEN).map_err(invalid)?;

        let _catalog = self.catalog_lock.lock().await;
        if self.store.properties.contains_key(&id) {
            return Err(EngineError::AlreadyExists("property", id));
        }
        if !self.store.categories.contains_key(&category_id) {
            return Err(EngineError::NotFound("category", category_id));
        }
        self.check_image(picture)?;

        self.persist(&Event::PropertyCreated {
            id,
            tenant_id,
            category_id,
            name: name.trim().to_string(),
            description: description.trim().to_string(),
            picture,
            at: now_ms(),
        })
        .await?;
        info!("property created: {id} by tenant {tenant_id}");
        Ok(())
    }

    pub async fn update_property(
        &self,
        session: &Session,
        id: Ulid,
        update: PropertyUpdate,
    ) -> Result<(), EngineError> {
        require_tenant(session)?;
        if let Some(name) = &update.name {
            validate::non_empty("name", name, MAX_NAME_LEN).map_err(invalid)?;
        }
        if let Some(description) = &update.description {
            validate::non_empty("description", description, MAX_DESCRIPTION_LEN).map_err(invalid)?;
        }

        let _catalog = self.catalog_lock.lock().await;
        self.check_owner(session, id)?;
        if let Some(category_id) = update.category_id
            && !self.store.categories.contains_key(&category_id)
        {
            return Err(EngineError::NotFound("category", category_id));
        }
        self.check_image(update.picture)?;

        let current = self
            .store
            .properties
            .get(&id)
            .map(|p| p.clone())
            .ok_or(EngineError::NotFound("property", id))?;
        self.persist(&Event::PropertyUpdated {
            id,
            category_id: update.category_id.unwrap_or(current.category_id),
            name: update.name.map(|n| n.trim().to_string()).unwrap_or(current.name),
            description: update
                .description
                .map(|d| d.trim().to_string())
                .unwrap_or(current.description),
            picture: update.picture.or(current.picture),
        })
        .await
    }

    pub async fn delete_property(&self, session: &Session, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        self.check_owner(session, id)?;
        if self.store.has_rooms(&id) {
            return Err(EngineError::HasDependents("property", id));
        }
        self.persist(&Event::PropertyDeleted { id }).await?;
        info!("property deleted: {id}");
        Ok(())
    }

    // ── Rooms ────────────────────────────────────────────────

    pub async fn create_room(
        &self,
        session: &Session,
        id: Ulid,
        property_id: Ulid,
        room_type: &str,
        price: u64,
        description: &str,
    ) -> Result<(), EngineError> {
        validate::non_empty("room_type", room_type, MAX_NAME_LEN).map_err(invalid)?;
        validate::non_empty("description", description, MAX_DESCRIPTION_LEN).map_err(invalid)?;
        if price == 0 || price > MAX_ROOM_PRICE {
            return Err(EngineError::Invalid(format!(
                "price must be between 1 and {MAX_ROOM_PRICE}"
            )));
        }

        let _catalog = self.catalog_lock.lock().await;
        self.check_owner(session, property_id)?;
        if self.store.rooms.contains_key(&id) {
            return Err(EngineError::AlreadyExists("room", id));
        }
        self.persist(&Event::RoomCreated {
            id,
            property_id,
            room_type: room_type.trim().to_string(),
            price,
            description: description.trim().to_string(),
        })
        .await
    }

    pub async fn update_room(&self, session: &Session, id: Ulid, update: RoomUpdate) -> Result<(), EngineError> {
        require_tenant(session)?;
        if let Some(room_type) = &update.room_type {
            validate::non_empty("room_type", room_type, MAX_NAME_LEN).map_err(invalid)?;
        }
        if let Some(description) = &update.description {
            validate::non_empty("description", description, MAX_DESCRIPTION_LEN).map_err(invalid)?;
        }
        if let Some(price) = update.price
            && (price == 0 || price > MAX_ROOM_PRICE)
        {
            return Err(EngineError::Invalid(format!(
                "price must be between 1 and {MAX_ROOM_PRICE}"
            )));
        }

        let mut guard = self.room_write(id).await?;
        self.check_owner(session, guard.property_id)?;
        let event = Event::RoomUpdated {
            id,
            room_type: update
                .room_type
                .map(|t| t.trim().to_string())
                .unwrap_or_else(|| guard.room_type.clone()),
            price: update.price.unwrap_or(guard.price),
            description: update
                .description
                .map(|d| d.trim().to_string())
                .unwrap_or_else(|| guard.description.clone()),
        };
        self.persist_to_room(&mut guard, &event).await
    }

    /// Delete a room with no Pending or Waiting orders. Finished orders keep
    /// their history.
    pub async fn delete_room(&self, session: &Session, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let guard = self.room_write(id).await?;
        self.check_owner(session, guard.property_id)?;
        let busy = self
            .store
            .orders
            .iter()
            .any(|o| o.room_id == id && o.status.is_active());
        if busy {
            return Err(EngineError::HasDependents("room", id));
        }
        self.persist(&Event::RoomDeleted { id }).await?;
        drop(guard);
        info!("room deleted: {id}");
        Ok(())
    }

    // ── Available dates ──────────────────────────────────────

    /// Open dates on a room's calendar, each with a markup in basis points.
    pub async fn open_dates(
        &self,
        session: &Session,
        room_id: Ulid,
        dates: Vec<(Day, i32)>,
    ) -> Result<(), EngineError> {
        require_tenant(session)?;
        if dates.is_empty() {
            return Err(EngineError::Invalid("no dates given".into()));
        }
        if dates.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("too many dates in one statement"));
        }
        let today = day_of(now_ms());
        let mut seen = BTreeSet::new();
        for &(date, markup_bp) in &dates {
            if !(MIN_MARKUP_BP..=MAX_MARKUP_BP).contains(&markup_bp) {
                return Err(EngineError::Invalid(format!(
                    "price percentage for {date} out of range"
                )));
            }
            if date < today {
                return Err(EngineError::Invalid(format!("{date} is in the past")));
            }
            if !seen.insert(date) {
                return Err(EngineError::DateAlreadyOpen(date));
            }
        }

        let mut guard = self.room_write(room_id).await?;
        self.check_owner(session, guard.property_id)?;
        if let Some(&(date, _)) = dates.iter().find(|(d, _)| guard.calendar.contains_key(d)) {
            return Err(EngineError::DateAlreadyOpen(date));
        }
        if guard.calendar.len() + dates.len() > MAX_DATES_PER_ROOM {
            return Err(EngineError::LimitExceeded("room calendar is full"));
        }
        self.persist_to_room(&mut guard, &Event::DatesOpened { room_id, dates })
            .await
    }

    pub async fn close_date(&self, session: &Session, room_id: Ulid, date: Day) -> Result<(), EngineError> {
        require_tenant(session)?;
        let mut guard = self.room_write(room_id).await?;
        self.check_owner(session, guard.property_id)?;
        match guard.calendar.get(&date) {
            None => return Err(EngineError::DateNotOpen(date)),
            Some(day) if day.booked_by.is_some() => return Err(EngineError::DateUnavailable(date)),
            Some(_) => {}
        }
        self.persist_to_room(&mut guard, &Event::DateClosed { room_id, date })
            .await
    }

    /// Open, unbooked dates of a room.
    pub async fn available_dates(&self, room_id: Ulid) -> Result<Vec<DateInfo>, EngineError> {
        let guard = self.room_read(room_id).await?;
        Ok(guard
            .calendar
            .iter()
            .filter(|(_, s)| s.booked_by.is_none())
            .map(|(date, s)| DateInfo {
                room_id,
                date: *date,
                markup_bp: s.markup_bp,
                available: true,
            })
            .collect())
    }

    /// The whole calendar, booked dates included. Owner only.
    pub async fn room_calendar(&self, session: &Session, room_id: Ulid) -> Result<Vec<DateInfo>, EngineError> {
        let guard = self.room_read(room_id).await?;
        self.check_owner(session, guard.property_id)?;
        Ok(guard
            .calendar
            .iter()
            .map(|(date, s)| DateInfo {
                room_id,
                date: *date,
                markup_bp: s.markup_bp,
                available: s.booked_by.is_none(),
            })
            .collect())
    }

    // ── Images ───────────────────────────────────────────────

    /// Store an uploaded picture. Needs no session: a tenant uploads the KTP
    /// card before the account exists.
    pub async fn store_image(&self, id: Ulid, content_type: &str, data: &[u8]) -> Result<Image, EngineError> {
        let ext = images::validate(content_type, data).map_err(|e| EngineError::Invalid(e.to_string()))?;
        let file_name = images::file_name(id, ext);

        let _catalog = self.catalog_lock.lock().await;
        if self.store.images.contains_key(&id) {
            return Err(EngineError::AlreadyExists("image", id));
        }
        if self.store.images.len() >= MAX_IMAGES {
            return Err(EngineError::LimitExceeded("too many images"));
        }
        self.images
            .write(&file_name, data)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        let event = Event::ImageStored {
            id,
            content_type: content_type.to_ascii_lowercase(),
            file_name: file_name.clone(),
            size: data.len(),
        };
        if let Err(e) = self.persist(&event).await {
            if let Err(rm) = self.images.remove(&file_name).await {
                warn!("cannot remove orphaned image {file_name}: {rm}");
            }
            return Err(e);
        }
        self.store
            .images
            .get(&id)
            .map(|i| i.clone())
            .ok_or(EngineError::NotFound("image", id))
    }

    pub async fn image(&self, id: Ulid) -> Result<(Image, Vec<u8>), EngineError> {
        let image = self
            .store
            .images
            .get(&id)
            .map(|i| i.clone())
            .ok_or(EngineError::NotFound("image", id))?;
        let data = self
            .images
            .read(&image.file_name)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok((image, data))
    }
}
