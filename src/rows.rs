//! Result-set layouts and row encoding for every SELECT-able table.

use std::sync::Arc;

use futures::stream;
use pgwire::api::Type;
use pgwire::api::portal::Format;
use pgwire::api::results::{DataRowEncoder, FieldInfo, QueryResponse, Response};
use pgwire::error::PgWireResult;
use ulid::Ulid;

use crate::model::*;
use crate::pricing::{self, Quote};

fn text(name: &'static str) -> (&'static str, Type) {
    (name, Type::VARCHAR)
}

fn int(name: &'static str) -> (&'static str, Type) {
    (name, Type::INT8)
}

fn float(name: &'static str) -> (&'static str, Type) {
    (name, Type::FLOAT8)
}

fn flag(name: &'static str) -> (&'static str, Type) {
    (name, Type::BOOL)
}

fn columns(table: &str) -> Vec<(&'static str, Type)> {
    match table {
        "login" => vec![
            text("token"),
            text("role"),
            text("account_id"),
            text("email"),
            int("expires_at"),
        ],
        "users" => vec![
            text("id"),
            text("name"),
            text("email"),
            text("phone_number"),
            text("gender"),
            text("birth_date"),
            text("profile_picture"),
            flag("verified"),
        ],
        "categories" => vec![text("id"), text("location")],
        "properties" => vec![
            text("id"),
            text("name"),
            text("description"),
            text("picture"),
            text("category_id"),
            text("location"),
            text("tenant_id"),
            text("tenant_name"),
            int("total_count"),
        ],
        "property_prices" => vec![
            text("id"),
            text("name"),
            text("location"),
            text("tenant_name"),
            text("picture"),
            int("lowest_price"),
        ],
        "rooms" => vec![
            text("id"),
            text("property_id"),
            text("property_name"),
            text("room_type"),
            int("price"),
            text("description"),
            int("total_count"),
        ],
        "available_dates" => vec![
            text("room_id"),
            text("date"),
            float("price_percentage"),
            flag("available"),
        ],
        "images" => vec![text("id"), text("content_type"), text("data")],
        "orders" => vec![
            text("id"),
            text("invoice_id"),
            text("user_id"),
            text("user_name"),
            text("room_id"),
            text("room_type"),
            text("property_id"),
            text("property_name"),
            text("start_date"),
            text("end_date"),
            int("total_price"),
            text("payment_proof"),
            text("status"),
            int("created_at"),
            int("updated_at"),
            int("expires_at"),
            text("cancel_reason"),
            int("total_count"),
        ],
        "order_reports" => vec![int("waiting"), int("complete")],
        "reviews" => vec![
            text("id"),
            text("property_id"),
            text("property_name"),
            text("location"),
            text("user_id"),
            text("user_name"),
            int("rating"),
            text("comment"),
            flag("done"),
            int("created_at"),
            int("updated_at"),
        ],
        "quotes" => vec![
            text("date"),
            float("price_percentage"),
            int("price"),
            int("total_price"),
        ],
        "availability" => vec![
            text("room_id"),
            text("room_type"),
            text("property_id"),
            text("property_name"),
            text("location"),
            int("price"),
            int("total_price"),
        ],
        _ => vec![],
    }
}

/// Columns of a table in the requested result format, empty for tables that
/// are not readable.
pub fn schema(table: &str, format: &Format) -> Vec<FieldInfo> {
    columns(table)
        .into_iter()
        .enumerate()
        .map(|(idx, (name, ty))| FieldInfo::new(name.into(), None, None, ty, format.format_for(idx)))
        .collect()
}

fn opt_id(id: Option<Ulid>) -> Option<String> {
    id.map(|id| id.to_string())
}

fn response<T>(
    table: &str,
    format: &Format,
    items: impl IntoIterator<Item = T>,
    mut encode: impl FnMut(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema(table, format));
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

pub fn login(info: LoginInfo, format: &Format) -> Response {
    response("login", format, [info], |e, info| {
        e.encode_field(&info.token.to_string())?;
        e.encode_field(&info.role.as_str().to_string())?;
        e.encode_field(&info.account_id.to_string())?;
        e.encode_field(&info.email)?;
        e.encode_field(&info.expires_at)?;
        Ok(())
    })
}

pub fn profile(p: ProfileInfo, format: &Format) -> Response {
    response("users", format, [p], |e, p| {
        e.encode_field(&p.id.to_string())?;
        e.encode_field(&p.name)?;
        e.encode_field(&p.email)?;
        e.encode_field(&p.phone_number)?;
        e.encode_field(&p.gender)?;
        e.encode_field(&p.birth_date.map(|d| d.to_string()))?;
        e.encode_field(&opt_id(p.profile_picture))?;
        e.encode_field(&p.verified)?;
        Ok(())
    })
}

pub fn categories(items: Vec<Category>, format: &Format) -> Response {
    response("categories", format, items, |e, c| {
        e.encode_field(&c.id.to_string())?;
        e.encode_field(&c.location)?;
        Ok(())
    })
}

pub fn properties(page: Page<PropertyInfo>, format: &Format) -> Response {
    let total = page.total as i64;
    response("properties", format, page.items, |e, p| {
        e.encode_field(&p.id.to_string())?;
        e.encode_field(&p.name)?;
        e.encode_field(&p.description)?;
        e.encode_field(&opt_id(p.picture))?;
        e.encode_field(&p.category_id.to_string())?;
        e.encode_field(&p.location)?;
        e.encode_field(&p.tenant_id.to_string())?;
        e.encode_field(&p.tenant_name)?;
        e.encode_field(&total)?;
        Ok(())
    })
}

pub fn property_prices(items: Vec<PropertyPrice>, format: &Format) -> Response {
    response("property_prices", format, items, |e, pp| {
        e.encode_field(&pp.property.id.to_string())?;
        e.encode_field(&pp.property.name)?;
        e.encode_field(&pp.property.location)?;
        e.encode_field(&pp.property.tenant_name)?;
        e.encode_field(&opt_id(pp.property.picture))?;
        e.encode_field(&pp.lowest_price.map(|p| p as i64))?;
        Ok(())
    })
}

pub fn rooms(page: Page<RoomInfo>, format: &Format) -> Response {
    let total = page.total as i64;
    response("rooms", format, page.items, |e, r| {
        e.encode_field(&r.id.to_string())?;
        e.encode_field(&r.property_id.to_string())?;
        e.encode_field(&r.property_name)?;
        e.encode_field(&r.room_type)?;
        e.encode_field(&(r.price as i64))?;
        e.encode_field(&r.description)?;
        e.encode_field(&total)?;
        Ok(())
    })
}

pub fn dates(items: Vec<DateInfo>, format: &Format) -> Response {
    response("available_dates", format, items, |e, d| {
        e.encode_field(&d.room_id.to_string())?;
        e.encode_field(&d.date.to_string())?;
        e.encode_field(&pricing::markup_to_fraction(d.markup_bp))?;
        e.encode_field(&d.available)?;
        Ok(())
    })
}

pub fn image(image: Image, data_base64: String, format: &Format) -> Response {
    response("images", format, [(image, data_base64)], |e, (image, data)| {
        e.encode_field(&image.id.to_string())?;
        e.encode_field(&image.content_type)?;
        e.encode_field(&data)?;
        Ok(())
    })
}

pub fn orders(page: Page<OrderInfo>, format: &Format) -> Response {
    let total = page.total as i64;
    response("orders", format, page.items, |e, info| {
        let o = &info.order;
        e.encode_field(&o.id.to_string())?;
        e.encode_field(&o.invoice_id)?;
        e.encode_field(&o.user_id.to_string())?;
        e.encode_field(&info.user_name)?;
        e.encode_field(&o.room_id.to_string())?;
        e.encode_field(&info.room_type)?;
        e.encode_field(&o.property_id.to_string())?;
        e.encode_field(&info.property_name)?;
        e.encode_field(&o.start_date.to_string())?;
        e.encode_field(&o.end_date.to_string())?;
        e.encode_field(&(o.total_price as i64))?;
        e.encode_field(&opt_id(o.payment_proof))?;
        e.encode_field(&o.status.as_str().to_string())?;
        e.encode_field(&o.created_at)?;
        e.encode_field(&o.updated_at)?;
        e.encode_field(&o.expires_at)?;
        e.encode_field(&o.cancel_reason.map(|r| r.as_str().to_string()))?;
        e.encode_field(&total)?;
        Ok(())
    })
}

pub fn order_report(report: OrderReport, format: &Format) -> Response {
    response("order_reports", format, [report], |e, r| {
        e.encode_field(&(r.waiting as i64))?;
        e.encode_field(&(r.complete as i64))?;
        Ok(())
    })
}

pub fn reviews(items: Vec<ReviewInfo>, format: &Format) -> Response {
    response("reviews", format, items, |e, info| {
        let r = &info.review;
        e.encode_field(&r.id.to_string())?;
        e.encode_field(&r.property_id.to_string())?;
        e.encode_field(&info.property_name)?;
        e.encode_field(&info.location)?;
        e.encode_field(&r.user_id.to_string())?;
        e.encode_field(&info.user_name)?;
        // An open slot has no rating yet.
        e.encode_field(&r.done.then_some(r.rating as i64))?;
        e.encode_field(&r.done.then(|| r.comment.clone()))?;
        e.encode_field(&r.done)?;
        e.encode_field(&r.created_at)?;
        e.encode_field(&r.updated_at)?;
        Ok(())
    })
}

/// One row per night; `total_price` repeats the stay total on each row.
pub fn quote(quote: Quote, format: &Format) -> Response {
    let total = quote.total as i64;
    response("quotes", format, quote.nights, |e, n| {
        e.encode_field(&n.date.to_string())?;
        e.encode_field(&pricing::markup_to_fraction(n.markup_bp))?;
        e.encode_field(&(n.price as i64))?;
        e.encode_field(&total)?;
        Ok(())
    })
}

pub fn search_hits(hits: Vec<SearchHit>, format: &Format) -> Response {
    response("availability", format, hits, |e, h| {
        e.encode_field(&h.room.id.to_string())?;
        e.encode_field(&h.room.room_type)?;
        e.encode_field(&h.room.property_id.to_string())?;
        e.encode_field(&h.room.property_name)?;
        e.encode_field(&h.location)?;
        e.encode_field(&(h.room.price as i64))?;
        e.encode_field(&(h.total_price as i64))?;
        Ok(())
    })
}
