use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo as StartupLogin, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{DescribePortalResponse, DescribeStatementResponse, FieldInfo, Response, Tag};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::images;
use crate::model::*;
use crate::observability;
use crate::rows;
use crate::site::SiteManager;
use crate::sql::{self, Command, OrderAction, ReviewFilter};

/// State of one client connection.
#[derive(Default)]
struct Connection {
    /// Session token bound by login or `SET SESSION AUTHORIZATION`.
    session: Option<Ulid>,
    listeners: HashMap<String, broadcast::Receiver<String>>,
}

/// Query handler for a single connection. Every connection gets its own,
/// holding its bound session and LISTEN subscriptions.
pub struct StaybookHandler {
    sites: Arc<SiteManager>,
    query_parser: Arc<StaybookQueryParser>,
    conn: Mutex<Connection>,
}

impl StaybookHandler {
    pub fn new(sites: Arc<SiteManager>) -> Self {
        Self {
            sites,
            query_parser: Arc::new(StaybookQueryParser),
            conn: Mutex::new(Connection::default()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.sites.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("site error: {e}"),
            )))
        })
    }

    async fn session(&self, engine: &Engine) -> Result<Session, EngineError> {
        let token = self.conn.lock().await.session.ok_or(EngineError::Unauthenticated)?;
        engine.session(token)
    }

    /// Parse, execute and time one statement, then hand over any pending
    /// notifications ahead of its result.
    async fn run<C>(&self, client: &mut C, query: &str, format: &Format) -> PgWireResult<Response>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let result = match sql::parse_sql(query) {
            Ok(cmd) => {
                let label = observability::command_label(&cmd);
                let started = Instant::now();
                let result = self.execute_command(&engine, cmd, format).await;
                metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
                    .record(started.elapsed().as_secs_f64());
                let status = if result.is_ok() { "ok" } else { "error" };
                metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
                    .increment(1);
                result.map_err(|e| {
                    debug!(command = label, "{e}");
                    engine_err(e)
                })
            }
            Err(e) => Err(sql_err(e)),
        };
        self.flush_notifications(client).await?;
        result
    }

    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let pending = {
            let mut conn = self.conn.lock().await;
            let mut pending = Vec::new();
            for (channel, rx) in conn.listeners.iter_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(payload) => pending.push((channel.clone(), payload)),
                        Err(TryRecvError::Lagged(missed)) => {
                            warn!("listener on {channel} missed {missed} notifications");
                        }
                        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                    }
                }
            }
            pending
        };
        for (channel, payload) in pending {
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    0, channel, payload,
                )))
                .await?;
        }
        Ok(())
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command, format: &Format) -> Result<Response, EngineError> {
        match cmd {
            // ── Accounts ─────────────────────────────────────
            Command::RegisterTenant {
                id,
                name,
                email,
                password,
                phone_number,
                ktp_card,
            } => {
                engine
                    .register_tenant(id, &name, &email, &password, &phone_number, ktp_card)
                    .await?;
                Ok(inserted(1))
            }
            Command::RegisterUser {
                id,
                name,
                email,
                password,
                phone_number,
            } => {
                engine
                    .register_user(id, &name, &email, &password, &phone_number)
                    .await?;
                Ok(inserted(1))
            }
            Command::Login { role, email, password } => {
                let info = engine
                    .login(role, &email, &password)
                    .await
                    .inspect_err(|e| {
                        if matches!(e, EngineError::InvalidCredentials) {
                            metrics::counter!(observability::LOGIN_FAILURES_TOTAL, "role" => role.as_str())
                                .increment(1);
                        }
                    })?;
                self.conn.lock().await.session = Some(info.token);
                Ok(rows::login(info, format))
            }
            Command::Logout => {
                let token = self.conn.lock().await.session.take();
                if let Some(token) = token {
                    engine.logout(token);
                }
                Ok(Response::Execution(Tag::new("DELETE").with_rows(token.map_or(0, |_| 1))))
            }
            Command::SetSession { token } => {
                engine.session(token)?;
                self.conn.lock().await.session = Some(token);
                Ok(Response::Execution(Tag::new("SET")))
            }
            Command::ResetSession => {
                self.conn.lock().await.session = None;
                Ok(Response::Execution(Tag::new("RESET")))
            }
            Command::VerifyUser { user_id, otp } => {
                engine.verify_user(user_id, &otp).await?;
                Ok(inserted(1))
            }
            Command::ResendOtp { user_id } => {
                engine.resend_otp(user_id).await?;
                Ok(inserted(1))
            }
            Command::RequestPasswordReset { email } => {
                engine.request_password_reset(&email).await?;
                Ok(inserted(1))
            }
            Command::ResetPassword { token, password } => {
                engine.reset_password(&token, &password).await?;
                Ok(updated(1))
            }
            Command::ChangePassword {
                old_password,
                new_password,
            } => {
                let session = self.session(engine).await?;
                engine
                    .change_password(&session, &old_password, &new_password)
                    .await?;
                Ok(updated(1))
            }
            Command::UpdateProfile { user_id, update } => {
                let session = self.session(engine).await?;
                engine.update_profile(&session, user_id, update).await?;
                Ok(updated(1))
            }
            Command::SelectProfile { user_id } => Ok(rows::profile(engine.profile(user_id)?, format)),

            // ── Catalog ──────────────────────────────────────
            Command::InsertCategory { id, location } => {
                let session = self.session(engine).await?;
                engine.create_category(&session, id, &location).await?;
                Ok(inserted(1))
            }
            Command::UpdateCategory { id, location } => {
                let session = self.session(engine).await?;
                engine.update_category(&session, id, &location).await?;
                Ok(updated(1))
            }
            Command::DeleteCategory { id } => {
                let session = self.session(engine).await?;
                engine.delete_category(&session, id).await?;
                Ok(deleted(1))
            }
            Command::SelectCategories { id } => {
                let items = match id {
                    Some(id) => vec![engine.category(id)?],
                    None => engine.categories(),
                };
                Ok(rows::categories(items, format))
            }
            Command::InsertProperty {
                id,
                category_id,
                name,
                description,
                picture,
            } => {
                let session = self.session(engine).await?;
                engine
                    .create_property(&session, id, category_id, &name, &description, picture)
                    .await?;
                Ok(inserted(1))
            }
            Command::UpdateProperty { id, update } => {
                let session = self.session(engine).await?;
                engine.update_property(&session, id, update).await?;
                Ok(updated(1))
            }
            Command::DeleteProperty { id } => {
                let session = self.session(engine).await?;
                engine.delete_property(&session, id).await?;
                Ok(deleted(1))
            }
            Command::SelectProperties { id, query } => {
                let page = match id {
                    Some(id) => single(engine.property(id)?),
                    None => engine.list_properties(&query),
                };
                Ok(rows::properties(page, format))
            }
            Command::SelectPropertyPrices => Ok(rows::property_prices(
                engine.properties_by_lowest_price().await,
                format,
            )),
            Command::InsertRoom {
                id,
                property_id,
                room_type,
                price,
                description,
            } => {
                let session = self.session(engine).await?;
                engine
                    .create_room(&session, id, property_id, &room_type, price, &description)
                    .await?;
                Ok(inserted(1))
            }
            Command::UpdateRoom { id, update } => {
                let session = self.session(engine).await?;
                engine.update_room(&session, id, update).await?;
                Ok(updated(1))
            }
            Command::DeleteRoom { id } => {
                let session = self.session(engine).await?;
                engine.delete_room(&session, id).await?;
                Ok(deleted(1))
            }
            Command::SelectRooms { id, query } => {
                let page = match id {
                    Some(id) => single(engine.room(id).await?),
                    None => engine.list_rooms(&query).await,
                };
                Ok(rows::rooms(page, format))
            }
            Command::OpenDates { room_id, dates } => {
                let session = self.session(engine).await?;
                let count = dates.len();
                engine.open_dates(&session, room_id, dates).await?;
                Ok(inserted(count))
            }
            Command::CloseDate { room_id, date } => {
                let session = self.session(engine).await?;
                engine.close_date(&session, room_id, date).await?;
                Ok(deleted(1))
            }
            Command::SelectDates { room_id, all } => {
                let dates = if all {
                    let session = self.session(engine).await?;
                    engine.room_calendar(&session, room_id).await?
                } else {
                    engine.available_dates(room_id).await?
                };
                Ok(rows::dates(dates, format))
            }
            Command::InsertImage { id, content_type, data } => {
                let bytes = images::decode_base64(&data).map_err(|e| EngineError::Invalid(e.to_string()))?;
                engine.store_image(id, &content_type, &bytes).await?;
                Ok(inserted(1))
            }
            Command::SelectImage { id } => {
                let (image, bytes) = engine.image(id).await?;
                Ok(rows::image(image, images::encode_base64(&bytes), format))
            }

            // ── Orders ───────────────────────────────────────
            Command::PlaceOrder {
                id,
                room_id,
                start_date,
                end_date,
            } => {
                let session = self.session(engine).await?;
                engine
                    .place_order(&session, id, room_id, start_date, end_date)
                    .await?;
                Ok(inserted(1))
            }
            Command::UploadPaymentProof { id, image_id } => {
                let session = self.session(engine).await?;
                engine.upload_payment_proof(&session, id, image_id).await?;
                Ok(updated(1))
            }
            Command::SetOrderStatus { id, action } => {
                let session = self.session(engine).await?;
                match action {
                    OrderAction::Confirm => engine.confirm_order(&session, id).await?,
                    OrderAction::Reject => engine.reject_order(&session, id).await?,
                    OrderAction::Cancel => engine.cancel_order(&session, id).await?,
                };
                Ok(updated(1))
            }
            Command::SelectOrders { id, query } => {
                let session = self.session(engine).await?;
                let page = match (id, session.role) {
                    (Some(id), _) => single(engine.order(&session, id).await?),
                    (None, Role::User) => engine.user_orders(&session, &query).await?,
                    (None, Role::Tenant) => {
                        engine
                            .tenant_orders(&session, query.status, query.page)
                            .await?
                    }
                };
                Ok(rows::orders(page, format))
            }
            Command::SelectOrderReport => {
                let session = self.session(engine).await?;
                Ok(rows::order_report(engine.order_report(&session)?, format))
            }

            // ── Reviews, quotes & search ─────────────────────
            Command::SubmitReview { id, rating, comment } => {
                let session = self.session(engine).await?;
                engine.submit_review(&session, id, rating, &comment).await?;
                Ok(updated(1))
            }
            Command::SelectReviews { filter } => {
                let reviews = match filter {
                    ReviewFilter::Property(pid) => engine.property_reviews(pid)?,
                    ReviewFilter::User(uid) => engine.user_reviews(uid),
                };
                Ok(rows::reviews(reviews, format))
            }
            Command::SelectQuote {
                room_id,
                start_date,
                end_date,
            } => Ok(rows::quote(
                engine.quote(room_id, start_date, end_date).await?,
                format,
            )),
            Command::SearchAvailability {
                start_date,
                end_date,
                category_id,
            } => Ok(rows::search_hits(
                engine
                    .search_availability(start_date, end_date, category_id)
                    .await?,
                format,
            )),

            // ── Notifications ────────────────────────────────
            Command::Listen { channel } => {
                let session = self.session(engine).await?;
                engine.authorize_channel(&session, &channel).await?;
                let mut conn = self.conn.lock().await;
                if !conn.listeners.contains_key(&channel) {
                    let rx = engine.notify.subscribe(&channel);
                    conn.listeners.insert(channel, rx);
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                self.conn.lock().await.listeners.remove(&channel);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.conn.lock().await.listeners.clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn updated(rows: usize) -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(rows))
}

fn deleted(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

/// A lookup by id, shaped like a one-row listing.
fn single<T>(item: T) -> Page<T> {
    Page {
        total: 1,
        items: vec![item],
    }
}

#[async_trait]
impl SimpleQueryHandler for StaybookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let response = self.run(client, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StaybookQueryParser;

/// Result columns of a statement that may still hold `$n` placeholders.
fn describe(stmt: &str, format: &Format) -> Vec<FieldInfo> {
    sql::select_table(stmt)
        .map(|table| rows::schema(&table, format))
        .unwrap_or_default()
}

#[async_trait]
impl QueryParser for StaybookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for StaybookHandler {
    type Statement = String;
    type QueryParser = StaybookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(client, &sql, &portal.result_column_format).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            describe(&target.statement, &Format::UnifiedText),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(describe(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();

    // Highest index first so `$1` does not clobber the prefix of `$10`.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

/// Startup password shared by every client. Account identity comes later,
/// from a login session bound to the connection.
#[derive(Debug)]
pub struct StaybookAuthSource {
    password: String,
}

#[async_trait]
impl AuthSource for StaybookAuthSource {
    async fn get_password(&self, _login: &StartupLogin) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

pub struct StaybookFactory {
    handler: Arc<StaybookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<StaybookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl StaybookFactory {
    pub fn new(sites: Arc<SiteManager>, password: String) -> Self {
        let auth_source = StaybookAuthSource { password };
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(StaybookHandler::new(sites)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StaybookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    sites: Arc<SiteManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(StaybookFactory::new(sites, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}
