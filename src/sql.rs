use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::Token;
use ulid::Ulid;

use crate::model::*;
use crate::pricing;

/// What a client wants an order to become.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderAction {
    Confirm,
    Reject,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewFilter {
    Property(Ulid),
    User(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterTenant {
        id: Ulid,
        name: String,
        email: String,
        password: String,
        phone_number: String,
        ktp_card: Option<Ulid>,
    },
    RegisterUser {
        id: Ulid,
        name: String,
        email: String,
        password: String,
        phone_number: String,
    },
    Login {
        role: Role,
        email: String,
        password: String,
    },
    Logout,
    SetSession {
        token: Ulid,
    },
    ResetSession,
    VerifyUser {
        user_id: Ulid,
        otp: String,
    },
    ResendOtp {
        user_id: Ulid,
    },
    RequestPasswordReset {
        email: String,
    },
    ResetPassword {
        token: String,
        password: String,
    },
    ChangePassword {
        old_password: String,
        new_password: String,
    },
    UpdateProfile {
        user_id: Ulid,
        update: ProfileUpdate,
    },
    SelectProfile {
        user_id: Ulid,
    },
    InsertCategory {
        id: Ulid,
        location: String,
    },
    UpdateCategory {
        id: Ulid,
        location: String,
    },
    DeleteCategory {
        id: Ulid,
    },
    SelectCategories {
        id: Option<Ulid>,
    },
    InsertProperty {
        id: Ulid,
        category_id: Ulid,
        name: String,
        description: String,
        picture: Option<Ulid>,
    },
    UpdateProperty {
        id: Ulid,
        update: PropertyUpdate,
    },
    DeleteProperty {
        id: Ulid,
    },
    SelectProperties {
        id: Option<Ulid>,
        query: PropertyQuery,
    },
    SelectPropertyPrices,
    InsertRoom {
        id: Ulid,
        property_id: Ulid,
        room_type: String,
        price: u64,
        description: String,
    },
    UpdateRoom {
        id: Ulid,
        update: RoomUpdate,
    },
    DeleteRoom {
        id: Ulid,
    },
    SelectRooms {
        id: Option<Ulid>,
        query: RoomQuery,
    },
    OpenDates {
        room_id: Ulid,
        dates: Vec<(Day, i32)>, // (date, markup in basis points)
    },
    CloseDate {
        room_id: Ulid,
        date: Day,
    },
    SelectDates {
        room_id: Ulid,
        /// Include booked dates; owner only.
        all: bool,
    },
    InsertImage {
        id: Ulid,
        content_type: String,
        data: String,
    },
    SelectImage {
        id: Ulid,
    },
    PlaceOrder {
        id: Ulid,
        room_id: Ulid,
        start_date: Day,
        end_date: Day,
    },
    UploadPaymentProof {
        id: Ulid,
        image_id: Ulid,
    },
    SetOrderStatus {
        id: Ulid,
        action: OrderAction,
    },
    SelectOrders {
        id: Option<Ulid>,
        query: OrderQuery,
    },
    SelectOrderReport,
    SubmitReview {
        id: Ulid,
        rating: i64,
        comment: String,
    },
    SelectReviews {
        filter: ReviewFilter,
    },
    SelectQuote {
        room_id: Ulid,
        start_date: Day,
        end_date: Day,
    },
    SearchAvailability {
        start_date: Day,
        end_date: Day,
        category_id: Option<Ulid>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = unquote(&trimmed[7..]);
        return Ok(Command::Listen { channel });
    }
    if upper == "UNLISTEN *" {
        return Ok(Command::UnlistenAll);
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = unquote(&trimmed[9..]);
        return Ok(Command::Unlisten { channel });
    }
    if upper == "RESET SESSION AUTHORIZATION" || upper == "SET SESSION AUTHORIZATION DEFAULT" {
        return Ok(Command::ResetSession);
    }
    if upper.starts_with("SET SESSION AUTHORIZATION ") {
        let token = unquote(&trimmed["SET SESSION AUTHORIZATION ".len()..]);
        let token = Ulid::from_string(&token).map_err(|e| SqlError::Value(format!("bad session token: {e}")))?;
        return Ok(Command::SetSession { token });
    }
    if upper.starts_with("UPDATE ") {
        return parse_update(trimmed);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(parse_err)?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements in one query".into()));
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// The table a SELECT reads from, without interpreting its filters. Used to
/// describe result columns of prepared statements whose values are still
/// placeholders.
pub fn select_table(sql: &str) -> Option<String> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

fn unquote(s: &str) -> String {
    s.trim()
        .trim_matches(|c| c == '\'' || c == '"')
        .to_string()
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let mut rows = insert_rows(&table, insert)?;

    if table == "available_dates" {
        return parse_open_dates(rows);
    }
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let Some(mut f) = rows.pop() else {
        return Err(SqlError::Parse("empty VALUES".into()));
    };

    let cmd = match table.as_str() {
        "tenants" => Command::RegisterTenant {
            id: f.ulid("id")?,
            name: f.text("name")?,
            email: f.text("email")?,
            password: f.text("password")?,
            phone_number: f.text("phone_number")?,
            ktp_card: f.opt_ulid("ktp_card")?,
        },
        "users" => Command::RegisterUser {
            id: f.ulid("id")?,
            name: f.text("name")?,
            email: f.text("email")?,
            password: f.text("password")?,
            phone_number: f.text("phone_number")?,
        },
        "verifications" => Command::VerifyUser {
            user_id: f.ulid("user_id")?,
            otp: f.text("otp")?,
        },
        "otp_requests" => Command::ResendOtp {
            user_id: f.ulid("user_id")?,
        },
        "password_resets" => Command::RequestPasswordReset {
            email: f.text("email")?,
        },
        "categories" => Command::InsertCategory {
            id: f.ulid("id")?,
            location: f.text("location")?,
        },
        "properties" => Command::InsertProperty {
            id: f.ulid("id")?,
            category_id: f.ulid("category_id")?,
            name: f.text("name")?,
            description: f.opt_text("description")?.unwrap_or_default(),
            picture: f.opt_ulid("picture")?,
        },
        "rooms" => Command::InsertRoom {
            id: f.ulid("id")?,
            property_id: f.ulid("property_id")?,
            room_type: f.text("room_type")?,
            price: f.price("price")?,
            description: f.opt_text("description")?.unwrap_or_default(),
        },
        "images" => Command::InsertImage {
            id: f.ulid("id")?,
            content_type: f.text("content_type")?,
            data: f.text("data")?,
        },
        "orders" => Command::PlaceOrder {
            id: f.ulid("id")?,
            room_id: f.ulid("room_id")?,
            start_date: f.day("start_date")?,
            end_date: f.day("end_date")?,
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    f.finish()?;
    Ok(cmd)
}

fn parse_open_dates(rows: Vec<Fields>) -> Result<Command, SqlError> {
    let mut room_id = None;
    let mut dates = Vec::with_capacity(rows.len());
    for (i, mut f) in rows.into_iter().enumerate() {
        let row_room = f.ulid("room_id")?;
        if room_id.is_some_and(|r| r != row_room) {
            return Err(SqlError::Unsupported(format!(
                "row {i}: all available_dates rows must share one room_id"
            )));
        }
        room_id = Some(row_room);
        let date = f.day("date")?;
        let markup_bp = match f.opt_number("price_percentage")? {
            None => 0,
            Some(fraction) => pricing::markup_from_fraction(fraction).ok_or_else(|| {
                SqlError::Value(format!("row {i}: price_percentage {fraction} is out of range"))
            })?,
        };
        f.finish()?;
        dates.push((date, markup_bp));
    }
    let room_id = room_id.ok_or(SqlError::Parse("empty VALUES".into()))?;
    Ok(Command::OpenDates { room_id, dates })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(sql).map_err(parse_err)?;
    parser.expect_keyword(Keyword::UPDATE).map_err(parse_err)?;
    let name = parser.parse_object_name(false).map_err(parse_err)?;
    let table = object_name_last(&name).ok_or_else(|| SqlError::Parse("empty table name".into()))?;
    parser.expect_keyword(Keyword::SET).map_err(parse_err)?;
    let assignments = parser
        .parse_comma_separated(|p| p.parse_assignment())
        .map_err(parse_err)?;
    let selection = if parser.parse_keyword(Keyword::WHERE) {
        Some(parser.parse_expr().map_err(parse_err)?)
    } else {
        None
    };
    while parser.consume_token(&Token::SemiColon) {}
    let next = parser.peek_token().token;
    if next != Token::EOF {
        return Err(SqlError::Parse(format!("unexpected {next} after UPDATE")));
    }

    let mut set = Fields::new(&table);
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push(column, assignment.value);
    }
    let mut filter = where_fields(&table, selection.as_ref())?;

    let cmd = match table.as_str() {
        "password_resets" => Command::ResetPassword {
            token: filter.text("token")?,
            password: set.text("password")?,
        },
        "accounts" => Command::ChangePassword {
            old_password: filter.text("password")?,
            new_password: set.text("password")?,
        },
        "users" => Command::UpdateProfile {
            user_id: filter.ulid("id")?,
            update: ProfileUpdate {
                name: set.opt_text("name")?,
                phone_number: set.opt_text("phone_number")?,
                gender: set.opt_text("gender")?,
                birth_date: set.opt_day("birth_date")?,
                profile_picture: set.opt_ulid("profile_picture")?,
            },
        },
        "categories" => Command::UpdateCategory {
            id: filter.ulid("id")?,
            location: set.text("location")?,
        },
        "properties" => Command::UpdateProperty {
            id: filter.ulid("id")?,
            update: PropertyUpdate {
                category_id: set.opt_ulid("category_id")?,
                name: set.opt_text("name")?,
                description: set.opt_text("description")?,
                picture: set.opt_ulid("picture")?,
            },
        },
        "rooms" => Command::UpdateRoom {
            id: filter.ulid("id")?,
            update: RoomUpdate {
                room_type: set.opt_text("room_type")?,
                price: set.opt_price("price")?,
                description: set.opt_text("description")?,
            },
        },
        "orders" => {
            let id = filter.ulid("id")?;
            match (set.opt_ulid("payment_proof")?, set.opt_text("status")?) {
                (Some(image_id), None) => Command::UploadPaymentProof { id, image_id },
                (None, Some(status)) => Command::SetOrderStatus {
                    id,
                    action: parse_order_action(&status)?,
                },
                _ => {
                    return Err(SqlError::Unsupported(
                        "orders: set either payment_proof or status".into(),
                    ));
                }
            }
        }
        "reviews" => Command::SubmitReview {
            id: filter.ulid("id")?,
            rating: set.int("rating")?,
            comment: set.text("comment")?,
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    set.finish()?;
    filter.finish()?;
    Ok(cmd)
}

fn parse_order_action(status: &str) -> Result<OrderAction, SqlError> {
    match status.to_ascii_lowercase().as_str() {
        "complete" | "confirmed" => Ok(OrderAction::Confirm),
        "rejected" => Ok(OrderAction::Reject),
        "cancelled" | "canceled" => Ok(OrderAction::Cancel),
        _ => Err(SqlError::Value(format!(
            "unknown order status {status} (complete, rejected or cancelled)"
        ))),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let mut f = where_fields(&table, delete.selection.as_ref())?;

    let cmd = match table.as_str() {
        "categories" => Command::DeleteCategory { id: f.ulid("id")? },
        "properties" => Command::DeleteProperty { id: f.ulid("id")? },
        "rooms" => Command::DeleteRoom { id: f.ulid("id")? },
        "available_dates" => Command::CloseDate {
            room_id: f.ulid("room_id")?,
            date: f.day("date")?,
        },
        "sessions" => Command::Logout,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    f.finish()?;
    Ok(cmd)
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let mut f = where_fields(&table, select.selection.as_ref())?;

    let cmd = match table.as_str() {
        "login" => {
            let role = f.text("role")?;
            Command::Login {
                role: Role::parse(&role).ok_or_else(|| SqlError::Value(format!("unknown role {role}")))?,
                email: f.text("email")?,
                password: f.text("password")?,
            }
        }
        "users" => Command::SelectProfile { user_id: f.ulid("id")? },
        "categories" => Command::SelectCategories { id: f.opt_ulid("id")? },
        "properties" => Command::SelectProperties {
            id: f.opt_ulid("id")?,
            query: PropertyQuery {
                tenant_id: f.opt_ulid("tenant_id")?,
                category_id: f.opt_ulid("category_id")?,
                search: f.opt_text("search")?,
                descending: f.descending()?,
                page: f.page()?,
            },
        },
        "property_prices" => Command::SelectPropertyPrices,
        "rooms" => Command::SelectRooms {
            id: f.opt_ulid("id")?,
            query: RoomQuery {
                property_id: f.opt_ulid("property_id")?,
                search: f.opt_text("search")?,
                descending: f.descending()?,
                page: f.page()?,
            },
        },
        "available_dates" => Command::SelectDates {
            room_id: f.ulid("room_id")?,
            all: f.opt_bool("all")?.unwrap_or(false),
        },
        "images" => Command::SelectImage { id: f.ulid("id")? },
        "orders" => {
            let id = f.opt_ulid("id")?;
            let status = match f.opt_text("status")? {
                None => None,
                Some(s) => Some(
                    OrderStatus::parse(&s).ok_or_else(|| SqlError::Value(format!("unknown order status {s}")))?,
                ),
            };
            let sort = match f.opt_text("sort")? {
                None => OrderSort::default(),
                Some(s) => OrderSort::parse(&s).ok_or_else(|| {
                    SqlError::Value(format!("unknown sort {s} (created_at, start_date or total_price)"))
                })?,
            };
            Command::SelectOrders {
                id,
                query: OrderQuery {
                    status,
                    invoice: f.opt_text("invoice")?,
                    date: f.opt_day("date")?,
                    sort,
                    page: f.page()?,
                },
            }
        }
        "order_reports" => Command::SelectOrderReport,
        "reviews" => match (f.opt_ulid("property_id")?, f.opt_ulid("user_id")?) {
            (Some(pid), None) => Command::SelectReviews {
                filter: ReviewFilter::Property(pid),
            },
            (None, Some(uid)) => Command::SelectReviews {
                filter: ReviewFilter::User(uid),
            },
            _ => return Err(SqlError::MissingFilter("property_id or user_id")),
        },
        "quotes" => Command::SelectQuote {
            room_id: f.ulid("room_id")?,
            start_date: f.day("start_date")?,
            end_date: f.day("end_date")?,
        },
        "availability" => Command::SearchAvailability {
            start_date: f.day("start_date")?,
            end_date: f.day("end_date")?,
            category_id: f.opt_ulid("category_id")?,
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    f.finish()?;
    Ok(cmd)
}

// ── Column values ─────────────────────────────────────────────

/// Named values of one INSERT row, one SET list or one WHERE conjunction.
/// Every value must be consumed; leftovers are unknown columns.
#[derive(Debug)]
struct Fields {
    table: String,
    values: Vec<(String, Expr)>,
}

impl Fields {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            values: Vec::new(),
        }
    }

    fn push(&mut self, column: String, value: Expr) {
        self.values.push((column, value));
    }

    fn take(&mut self, column: &'static str) -> Option<Expr> {
        let pos = self.values.iter().position(|(c, _)| c == column)?;
        Some(self.values.remove(pos).1)
    }

    /// A value that is present and not NULL.
    fn take_present(&mut self, column: &'static str) -> Option<Expr> {
        self.take(column)
            .filter(|e| !matches!(extract_value(e), Some(Value::Null)))
    }

    fn require(&mut self, column: &'static str) -> Result<Expr, SqlError> {
        self.take_present(column).ok_or_else(|| SqlError::MissingColumn {
            table: self.table.clone(),
            column,
        })
    }

    fn ulid(&mut self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(&self.require(column)?)
    }

    fn opt_ulid(&mut self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.take_present(column).map(|e| parse_ulid_expr(&e)).transpose()
    }

    fn text(&mut self, column: &'static str) -> Result<String, SqlError> {
        parse_text_expr(&self.require(column)?)
    }

    fn opt_text(&mut self, column: &'static str) -> Result<Option<String>, SqlError> {
        self.take_present(column).map(|e| parse_text_expr(&e)).transpose()
    }

    fn int(&mut self, column: &'static str) -> Result<i64, SqlError> {
        parse_i64_expr(&self.require(column)?)
    }

    fn price(&mut self, column: &'static str) -> Result<u64, SqlError> {
        let v = self.int(column)?;
        u64::try_from(v).map_err(|_| SqlError::Value(format!("{column} must not be negative")))
    }

    fn opt_price(&mut self, column: &'static str) -> Result<Option<u64>, SqlError> {
        match self.take_present(column) {
            None => Ok(None),
            Some(e) => {
                let v = parse_i64_expr(&e)?;
                u64::try_from(v)
                    .map(Some)
                    .map_err(|_| SqlError::Value(format!("{column} must not be negative")))
            }
        }
    }

    fn opt_number(&mut self, column: &'static str) -> Result<Option<f64>, SqlError> {
        self.take_present(column).map(|e| parse_f64_expr(&e)).transpose()
    }

    fn day(&mut self, column: &'static str) -> Result<Day, SqlError> {
        parse_day_expr(&self.require(column)?)
    }

    fn opt_day(&mut self, column: &'static str) -> Result<Option<Day>, SqlError> {
        self.take_present(column).map(|e| parse_day_expr(&e)).transpose()
    }

    fn opt_bool(&mut self, column: &'static str) -> Result<Option<bool>, SqlError> {
        self.take_present(column).map(|e| parse_bool(&e)).transpose()
    }

    /// `sort = 'asc' | 'desc'`, ascending when absent.
    fn descending(&mut self) -> Result<bool, SqlError> {
        match self.opt_text("sort")? {
            None => Ok(false),
            Some(s) => match s.to_ascii_lowercase().as_str() {
                "asc" => Ok(false),
                "desc" => Ok(true),
                _ => Err(SqlError::Value(format!("sort must be asc or desc, got {s}"))),
            },
        }
    }

    /// 1-based page number, 1 when absent.
    fn page(&mut self) -> Result<usize, SqlError> {
        match self.take_present("page") {
            None => Ok(1),
            Some(e) => {
                let v = parse_i64_expr(&e)?;
                usize::try_from(v)
                    .ok()
                    .filter(|p| *p >= 1)
                    .ok_or_else(|| SqlError::Value(format!("page must be 1 or more, got {v}")))
            }
        }
    }

    fn finish(self) -> Result<(), SqlError> {
        match self.values.into_iter().next() {
            None => Ok(()),
            Some((column, _)) => Err(SqlError::UnknownColumn {
                table: self.table,
                column,
            }),
        }
    }
}

fn insert_rows(table: &str, insert: &ast::Insert) -> Result<Vec<Fields>, SqlError> {
    if insert.columns.is_empty() {
        return Err(SqlError::Parse(format!("INSERT INTO {table} needs a column list")));
    }
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let mut out = Vec::new();
    for (i, row) in extract_all_insert_rows(insert)?.into_iter().enumerate() {
        if row.len() != columns.len() {
            return Err(SqlError::WrongArity(format!("{table} row {i}"), columns.len(), row.len()));
        }
        let mut fields = Fields::new(table);
        for (column, value) in columns.iter().zip(row) {
            fields.push(column.clone(), value);
        }
        out.push(fields);
    }
    Ok(out)
}

/// Flatten `a = 1 AND b = 2` into named values.
fn where_fields(table: &str, selection: Option<&Expr>) -> Result<Fields, SqlError> {
    let mut fields = Fields::new(table);
    if let Some(expr) = selection {
        collect_filters(expr, &mut fields)?;
    }
    Ok(fields)
}

fn collect_filters(expr: &Expr, fields: &mut Fields) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, fields),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, fields)?;
                collect_filters(right, fields)
            }
            ast::BinaryOperator::Eq => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                fields.push(column, right.as_ref().clone());
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn parse_err(e: ParserError) -> SqlError {
    SqlError::Parse(e.to_string())
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_text_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Value(format!("expected string, got {value}"))),
        None => Err(SqlError::Value(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Value(format!("bad ULID {s}: {e}")))
}

fn parse_day_expr(expr: &Expr) -> Result<Day, SqlError> {
    let s = parse_text_expr(expr)?;
    s.parse::<Day>()
        .map_err(|e| SqlError::Value(format!("bad date {s} (expected YYYY-MM-DD): {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Value(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Value(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Value(format!("expected value, got {expr}")))
    }
}

fn parse_f64_expr(expr: &Expr) -> Result<f64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Value(format!("bad number {s}: {e}"))),
            _ => Err(SqlError::Value(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_f64_expr(expr)?)
    } else {
        Err(SqlError::Value(format!("expected value, got {expr}")))
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Value(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Value(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Value(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn { table: String, column: String },
    MissingColumn { table: String, column: &'static str },
    WrongArity(String, usize, usize),
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value of the wrong shape.
    Value(String),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::Value(_) => "22023",
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn { .. } => "42703",
            _ => "42601",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn { table, column } => write!(f, "{table}: unknown column {column}"),
            SqlError::MissingColumn { table, column } => write!(f, "{table}: missing {column}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::Value(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    fn day(s: &str) -> Day {
        s.parse().unwrap()
    }

    #[test]
    fn parse_register_tenant() {
        let sql = format!(
            "INSERT INTO tenants (id, name, email, password, phone_number) VALUES ('{ID}', 'Sari', 'sari@example.com', 'Secr3t!pass', '081234567890')"
        );
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(
            cmd,
            Command::RegisterTenant {
                id: id(),
                name: "Sari".into(),
                email: "sari@example.com".into(),
                password: "Secr3t!pass".into(),
                phone_number: "081234567890".into(),
                ktp_card: None,
            }
        );
    }

    #[test]
    fn parse_register_tenant_with_null_card() {
        let sql = format!(
            "INSERT INTO tenants (id, name, email, password, phone_number, ktp_card) VALUES ('{ID}', 'Sari', 's@x.io', 'p', '0812', NULL)"
        );
        match parse_sql(&sql).unwrap() {
            Command::RegisterTenant { ktp_card, .. } => assert_eq!(ktp_card, None),
            cmd => panic!("expected RegisterTenant, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_columns_may_come_in_any_order() {
        let sql = format!("INSERT INTO categories (location, id) VALUES ('Bali', '{ID}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertCategory {
                id: id(),
                location: "Bali".into()
            }
        );
    }

    #[test]
    fn insert_rejects_unknown_and_missing_columns() {
        let sql = format!("INSERT INTO categories (id, location, color) VALUES ('{ID}', 'Bali', 'red')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn { .. })));

        let sql = format!("INSERT INTO categories (id) VALUES ('{ID}')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn { column: "location", .. })
        ));

        let sql = "INSERT INTO categories VALUES ('x', 'y')";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_login_and_session_binding() {
        let sql = "SELECT * FROM login WHERE role = 'user' AND email = 'budi@example.com' AND password = 'pw'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::Login {
                role: Role::User,
                email: "budi@example.com".into(),
                password: "pw".into(),
            }
        );

        let cmd = parse_sql(&format!("SET SESSION AUTHORIZATION '{ID}'")).unwrap();
        assert_eq!(cmd, Command::SetSession { token: id() });
        assert_eq!(parse_sql("RESET SESSION AUTHORIZATION;").unwrap(), Command::ResetSession);
        assert_eq!(parse_sql("DELETE FROM sessions").unwrap(), Command::Logout);
        assert!(matches!(
            parse_sql("SET SESSION AUTHORIZATION 'nope'"),
            Err(SqlError::Value(_))
        ));
    }

    #[test]
    fn parse_account_updates() {
        let sql = "UPDATE password_resets SET password = 'N3w!passw0rd' WHERE token = 'abc'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::ResetPassword {
                token: "abc".into(),
                password: "N3w!passw0rd".into(),
            }
        );

        let sql = "UPDATE accounts SET password = 'new' WHERE password = 'old'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::ChangePassword {
                old_password: "old".into(),
                new_password: "new".into(),
            }
        );

        let sql = format!("UPDATE users SET name = 'Budi S', birth_date = '1990-05-01' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateProfile {
                user_id: id(),
                update: ProfileUpdate {
                    name: Some("Budi S".into()),
                    birth_date: Some(day("1990-05-01")),
                    ..ProfileUpdate::default()
                },
            }
        );
    }

    #[test]
    fn parse_open_dates_batch() {
        let sql = format!(
            "INSERT INTO available_dates (room_id, date, price_percentage) VALUES ('{ID}', '2031-01-01', 0.05), ('{ID}', '2031-01-02', -0.1)"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::OpenDates {
                room_id: id(),
                dates: vec![(day("2031-01-01"), 500), (day("2031-01-02"), -1_000)],
            }
        );
    }

    #[test]
    fn open_dates_defaults_markup_and_checks_range() {
        let sql = format!("INSERT INTO available_dates (room_id, date) VALUES ('{ID}', '2031-01-01')");
        match parse_sql(&sql).unwrap() {
            Command::OpenDates { dates, .. } => assert_eq!(dates, vec![(day("2031-01-01"), 0)]),
            cmd => panic!("expected OpenDates, got {cmd:?}"),
        }

        let sql = format!("INSERT INTO available_dates (room_id, date, price_percentage) VALUES ('{ID}', '2031-01-01', 9)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Value(_))));
    }

    #[test]
    fn open_dates_rows_must_share_room() {
        let other = Ulid::new();
        let sql = format!(
            "INSERT INTO available_dates (room_id, date) VALUES ('{ID}', '2031-01-01'), ('{other}', '2031-01-02')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn multi_row_insert_only_for_dates() {
        let sql = format!("INSERT INTO categories (id, location) VALUES ('{ID}', 'Bali'), ('{ID}', 'Lombok')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_close_date() {
        let sql = format!("DELETE FROM available_dates WHERE room_id = '{ID}' AND date = '2031-01-01'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::CloseDate {
                room_id: id(),
                date: day("2031-01-01"),
            }
        );
    }

    #[test]
    fn parse_room_insert_and_update() {
        let sql = format!(
            "INSERT INTO rooms (id, property_id, room_type, price, description) VALUES ('{ID}', '{ID}', 'Deluxe', 500000, 'King bed')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertRoom { price, room_type, .. } => {
                assert_eq!(price, 500_000);
                assert_eq!(room_type, "Deluxe");
            }
            cmd => panic!("expected InsertRoom, got {cmd:?}"),
        }

        let sql = format!("UPDATE rooms SET price = '650000' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateRoom {
                id: id(),
                update: RoomUpdate {
                    price: Some(650_000),
                    ..RoomUpdate::default()
                },
            }
        );

        let sql = format!("UPDATE rooms SET price = -5 WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Value(_))));
    }

    #[test]
    fn parse_property_listing_filters() {
        let sql = "SELECT * FROM properties WHERE search = 'villa' AND sort = 'desc' AND page = 2";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectProperties {
                id: None,
                query: PropertyQuery {
                    search: Some("villa".into()),
                    descending: true,
                    page: 2,
                    ..PropertyQuery::default()
                },
            }
        );

        let plain = parse_sql("SELECT * FROM properties").unwrap();
        match plain {
            Command::SelectProperties { query, .. } => assert_eq!(query.page, 1),
            cmd => panic!("expected SelectProperties, got {cmd:?}"),
        }

        assert!(matches!(
            parse_sql("SELECT * FROM properties WHERE page = 0"),
            Err(SqlError::Value(_))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM properties WHERE sort = 'sideways'"),
            Err(SqlError::Value(_))
        ));
    }

    #[test]
    fn parse_order_statements() {
        let sql = format!(
            "INSERT INTO orders (id, room_id, start_date, end_date) VALUES ('{ID}', '{ID}', '2031-01-01', '2031-01-03')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::PlaceOrder {
                id: id(),
                room_id: id(),
                start_date: day("2031-01-01"),
                end_date: day("2031-01-03"),
            }
        );

        let sql = format!("UPDATE orders SET payment_proof = '{ID}' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UploadPaymentProof { id: id(), image_id: id() }
        );

        for (status, action) in [
            ("complete", OrderAction::Confirm),
            ("rejected", OrderAction::Reject),
            ("cancelled", OrderAction::Cancel),
        ] {
            let sql = format!("UPDATE orders SET status = '{status}' WHERE id = '{ID}'");
            assert_eq!(parse_sql(&sql).unwrap(), Command::SetOrderStatus { id: id(), action });
        }

        let sql = format!("UPDATE orders SET status = 'paid' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Value(_))));
        let sql = format!("UPDATE orders SET status = 'complete', payment_proof = '{ID}' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_order_listing() {
        let sql = "SELECT * FROM orders WHERE status = 'pending' AND invoice = 'INV-0' AND date = '2031-01-02' AND sort = 'total_price' AND page = 3";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectOrders {
                id: None,
                query: OrderQuery {
                    status: Some(OrderStatus::Pending),
                    invoice: Some("INV-0".into()),
                    date: Some(day("2031-01-02")),
                    sort: OrderSort::TotalPrice,
                    page: 3,
                },
            }
        );
        assert_eq!(parse_sql("SELECT * FROM order_reports").unwrap(), Command::SelectOrderReport);
    }

    #[test]
    fn parse_reviews() {
        let sql = format!("UPDATE reviews SET rating = 5, comment = 'Lovely stay' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SubmitReview {
                id: id(),
                rating: 5,
                comment: "Lovely stay".into(),
            }
        );

        let sql = format!("SELECT * FROM reviews WHERE property_id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectReviews {
                filter: ReviewFilter::Property(id())
            }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM reviews"),
            Err(SqlError::MissingFilter(_))
        ));
    }

    #[test]
    fn parse_quote_and_search() {
        let sql = format!("SELECT * FROM quotes WHERE room_id = '{ID}' AND start_date = '2031-01-01' AND end_date = '2031-01-04'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SelectQuote { .. }));

        let sql = format!(
            "SELECT * FROM availability WHERE start_date = '2031-01-01' AND end_date = '2031-01-04' AND category_id = '{ID}'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SearchAvailability {
                start_date: day("2031-01-01"),
                end_date: day("2031-01-04"),
                category_id: Some(id()),
            }
        );
    }

    #[test]
    fn parse_listen_unlisten() {
        let cmd = parse_sql(&format!("LISTEN order_{ID}")).unwrap();
        assert_eq!(cmd, Command::Listen { channel: format!("order_{ID}") });
        let cmd = parse_sql(&format!("UNLISTEN \"property_{ID}\";")).unwrap();
        assert_eq!(cmd, Command::Unlisten { channel: format!("property_{ID}") });
        assert_eq!(parse_sql("UNLISTEN *").unwrap(), Command::UnlistenAll);
    }

    #[test]
    fn where_supports_only_equality_conjunctions() {
        let sql = format!("SELECT * FROM rooms WHERE id = '{ID}' OR id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
        let sql = "SELECT * FROM rooms WHERE price >= 10";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn bad_values_are_value_errors() {
        let sql = "SELECT * FROM images WHERE id = 'not-a-ulid'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Value(_))));
        let sql = format!("SELECT * FROM quotes WHERE room_id = '{ID}' AND start_date = '01/02/2031' AND end_date = '2031-01-04'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Value(_))));
    }

    #[test]
    fn select_table_ignores_placeholders() {
        assert_eq!(
            select_table("SELECT * FROM orders WHERE id = $1").as_deref(),
            Some("orders")
        );
        assert_eq!(select_table("INSERT INTO orders (id) VALUES ($1)"), None);
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
