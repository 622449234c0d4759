use ulid::Ulid;

use crate::model::*;
use crate::pricing::{self, Quote};

use super::{paginate, Engine, EngineError};

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.trim().to_lowercase())
}

impl Engine {
    fn property_info(&self, p: &Property) -> PropertyInfo {
        let location = self
            .store
            .categories
            .get(&p.category_id)
            .map(|c| c.location.clone())
            .unwrap_or_default();
        let tenant_name = self
            .store
            .tenants
            .get(&p.tenant_id)
            .map(|t| t.name.clone())
            .unwrap_or_default();
        PropertyInfo {
            id: p.id,
            name: p.name.clone(),
            description: p.description.clone(),
            picture: p.picture,
            category_id: p.category_id,
            location,
            tenant_id: p.tenant_id,
            tenant_name,
        }
    }

    fn room_info(&self, rs: &RoomState) -> RoomInfo {
        RoomInfo {
            id: rs.id,
            property_id: rs.property_id,
            property_name: self
                .store
                .properties
                .get(&rs.property_id)
                .map(|p| p.name.clone())
                .unwrap_or_default(),
            room_type: rs.room_type.clone(),
            price: rs.price,
            description: rs.description.clone(),
        }
    }

    // ── Properties ───────────────────────────────────────────

    pub fn property(&self, id: Ulid) -> Result<PropertyInfo, EngineError> {
        let p = self
            .store
            .properties
            .get(&id)
            .map(|p| p.clone())
            .ok_or(EngineError::NotFound("property", id))?;
        Ok(self.property_info(&p))
    }

    /// Properties sorted by name, filtered and paged.
    pub fn list_properties(&self, query: &PropertyQuery) -> Page<PropertyInfo> {
        let mut props: Vec<Property> = self
            .store
            .properties
            .iter()
            .filter(|p| query.tenant_id.is_none_or(|t| p.tenant_id == t))
            .filter(|p| query.category_id.is_none_or(|c| p.category_id == c))
            .filter(|p| query.search.as_ref().is_none_or(|s| contains_ci(&p.name, s)))
            .map(|p| p.clone())
            .collect();
        props.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then(a.id.cmp(&b.id))
        });
        if query.descending {
            props.reverse();
        }
        let page = paginate(props, query.page);
        Page {
            total: page.total,
            items: page.items.iter().map(|p| self.property_info(p)).collect(),
        }
    }

    /// Every property with its cheapest room price, cheapest first. Properties
    /// without rooms come last.
    pub async fn properties_by_lowest_price(&self) -> Vec<PropertyPrice> {
        let props: Vec<Property> = self.store.properties.iter().map(|p| p.clone()).collect();
        let mut out = Vec::with_capacity(props.len());
        for p in props {
            let mut lowest: Option<u64> = None;
            for room_id in self.store.rooms_of(&p.id) {
                if let Some(rs) = self.store.get_room(&room_id) {
                    let price = rs.read().await.price;
                    lowest = Some(lowest.map_or(price, |l| l.min(price)));
                }
            }
            out.push(PropertyPrice {
                property: self.property_info(&p),
                lowest_price: lowest,
            });
        }
        out.sort_by(|a, b| {
            let key = |pp: &PropertyPrice| (pp.lowest_price.is_none(), pp.lowest_price, pp.property.id);
            key(a).cmp(&key(b))
        });
        out
    }

    // ── Rooms ────────────────────────────────────────────────

    pub async fn room(&self, id: Ulid) -> Result<RoomInfo, EngineError> {
        let guard = self.room_read(id).await?;
        Ok(self.room_info(&guard))
    }

    /// Rooms sorted by room type, filtered and paged.
    pub async fn list_rooms(&self, query: &RoomQuery) -> Page<RoomInfo> {
        let ids: Vec<Ulid> = match query.property_id {
            Some(pid) => self.store.rooms_of(&pid),
            None => self.store.rooms.iter().map(|e| *e.key()).collect(),
        };
        let mut rooms = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(rs) = self.store.get_room(&id) else {
                continue;
            };
            let guard = rs.read().await;
            if query.search.as_ref().is_none_or(|s| contains_ci(&guard.room_type, s)) {
                rooms.push(self.room_info(&guard));
            }
        }
        rooms.sort_by(|a, b| {
            a.room_type
                .to_lowercase()
                .cmp(&b.room_type.to_lowercase())
                .then(a.id.cmp(&b.id))
        });
        if query.descending {
            rooms.reverse();
        }
        paginate(rooms, query.page)
    }

    // ── Quotes & search ──────────────────────────────────────

    /// Price a stay without booking it.
    pub async fn quote(&self, room_id: Ulid, start: Day, end: Day) -> Result<Quote, EngineError> {
        let nights = pricing::nights(start, end).map_err(|e| EngineError::Invalid(e.to_string()))?;
        let guard = self.room_read(room_id).await?;
        let markups = guard
            .stay_markups(&nights)
            .map_err(EngineError::DateUnavailable)?;
        Ok(pricing::quote(guard.price, &markups))
    }

    /// Rooms free for the whole stay, cheapest total first.
    pub async fn search_availability(
        &self,
        start: Day,
        end: Day,
        category_id: Option<Ulid>,
    ) -> Result<Vec<SearchHit>, EngineError> {
        let nights = pricing::nights(start, end).map_err(|e| EngineError::Invalid(e.to_string()))?;
        let rooms: Vec<_> = self.store.rooms.iter().map(|e| e.value().clone()).collect();

        let mut hits = Vec::new();
        for rs in rooms {
            let guard = rs.read().await;
            let Some(property) = self.store.properties.get(&guard.property_id).map(|p| p.clone()) else {
                continue;
            };
            if category_id.is_some_and(|c| property.category_id != c) {
                continue;
            }
            let Ok(markups) = guard.stay_markups(&nights) else {
                continue;
            };
            let quote = pricing::quote(guard.price, &markups);
            let location = self
                .store
                .categories
                .get(&property.category_id)
                .map(|c| c.location.clone())
                .unwrap_or_default();
            hits.push(SearchHit {
                room: self.room_info(&guard),
                location,
                total_price: quote.total,
            });
        }
        hits.sort_by_key(|h| (h.total_price, h.room.id));
        Ok(hits)
    }
}
