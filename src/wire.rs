use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::BoardLedgerAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, EntityFilter};
use crate::tenant::TenantManager;

pub struct BoardLedgerHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<BoardLedgerQueryParser>,
}

impl BoardLedgerHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(BoardLedgerQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, engine: &Engine, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

async fn execute_command(engine: &Engine, cmd: Command) -> PgWireResult<Response> {
    match cmd {
        Command::InsertBillboard { id, owner_id, is_digital, policy } => {
            engine
                .create_billboard(id, owner_id, is_digital, policy)
                .await
                .map_err(engine_err)?;
            Ok(inserted(1))
        }
        Command::UpdatePolicy { billboard_id, actor_id, policy } => {
            engine
                .update_billboard(billboard_id, actor_id, policy)
                .await
                .map_err(engine_err)?;
            Ok(inserted(1))
        }
        Command::SubmitBooking { id, billboard_id, requester_id, range, note, attachments } => {
            engine
                .submit_booking(id, billboard_id, requester_id, range, note, attachments)
                .await
                .map_err(engine_err)?;
            Ok(inserted(1))
        }
        Command::ApproveBooking { booking_id, actor_id } => {
            match engine.approve_booking(booking_id, actor_id).await.map_err(engine_err)? {
                ApproveOutcome::Approved { .. } => Ok(inserted(1)),
                ApproveOutcome::Conflict(c) => Err(user_error(
                    "23P01",
                    format!(
                        "booking {booking_id} overlaps {} {} {}; it stays pending",
                        c.kind.as_str(),
                        c.id,
                        c.range
                    ),
                )),
            }
        }
        Command::RejectBooking { booking_id, actor_id, reason } => {
            engine
                .reject_booking(booking_id, actor_id, reason)
                .await
                .map_err(engine_err)?;
            Ok(inserted(1))
        }
        Command::CancelBooking { booking_id, actor_id } => {
            engine.cancel_booking(booking_id, actor_id).await.map_err(engine_err)?;
            Ok(inserted(1))
        }
        Command::ReleaseBlocks { booking_id, actor_id } => {
            let released = engine
                .release_booking_blocks(booking_id, actor_id)
                .await
                .map_err(engine_err)?;
            Ok(inserted(released.len()))
        }
        Command::InsertBlock { id, billboard_id, actor_id, range, reason } => {
            engine
                .add_block(id, billboard_id, actor_id, range, reason)
                .await
                .map_err(engine_err)?;
            Ok(inserted(1))
        }
        Command::DeleteBlock { id, actor_id } => {
            engine.remove_block(id, actor_id).await.map_err(engine_err)?;
            Ok(deleted())
        }
        Command::InsertOverride { id, billboard_id, actor_id, range, price_monthly, note } => {
            engine
                .add_pricing_override(id, billboard_id, actor_id, range, price_monthly, note)
                .await
                .map_err(engine_err)?;
            Ok(inserted(1))
        }
        Command::DeleteOverride { id, actor_id } => {
            engine.remove_pricing_override(id, actor_id).await.map_err(engine_err)?;
            Ok(deleted())
        }
        Command::SelectBillboards { id } => {
            let billboards = match id {
                Some(id) => vec![engine.get_billboard(id).await.map_err(engine_err)?],
                None => engine.list_billboards().await,
            };
            query_response(billboard_schema(), billboards, |enc, b| {
                enc.encode_field(&b.id.to_string())?;
                enc.encode_field(&b.owner_id.to_string())?;
                enc.encode_field(&b.is_digital)?;
                enc.encode_field(&b.policy.base_price_monthly.to_string())?;
                enc.encode_field(&(b.policy.min_campaign_days as i64))?;
                enc.encode_field(&(b.policy.min_advance_booking_days as i64))?;
                enc.encode_field(&b.policy.is_available)?;
                enc.encode_field(&b.policy.pause_reason)
            })
        }
        Command::SelectBookings { filter } => {
            let bookings = match filter {
                EntityFilter::Id(id) => vec![engine.get_booking(id).await.map_err(engine_err)?],
                EntityFilter::Billboard(id) => engine.get_bookings(id).await.map_err(engine_err)?,
                EntityFilter::Booking(_) => return Err(sql_err(sql::SqlError::MissingFilter("billboard_id"))),
            };
            let today = engine.today();
            query_response(booking_schema(), bookings, |enc, b| {
                enc.encode_field(&b.id.to_string())?;
                enc.encode_field(&b.billboard_id.to_string())?;
                enc.encode_field(&b.requester_id.to_string())?;
                enc.encode_field(&b.range.start.to_string())?;
                enc.encode_field(&b.range.end.to_string())?;
                enc.encode_field(&b.status.as_str())?;
                enc.encode_field(&phase_label(b.phase(today)))?;
                enc.encode_field(&b.total_price.to_string())?;
                enc.encode_field(&b.note)?;
                enc.encode_field(&format!("{{{}}}", b.attachments.join(",")))?;
                enc.encode_field(&b.rejection_reason)?;
                enc.encode_field(&b.created_at.to_rfc3339())
            })
        }
        Command::SelectBlocks { filter } => {
            let blocks = match filter {
                EntityFilter::Billboard(id) => engine.get_blocks(id).await.map_err(engine_err)?,
                EntityFilter::Booking(id) => engine.blocks_for_booking(id).await.map_err(engine_err)?,
                EntityFilter::Id(id) => {
                    let billboard_id = engine
                        .get_billboard_for_entity(&id)
                        .ok_or_else(|| engine_err(EngineError::NotFound(id)))?;
                    let mut blocks = engine.get_blocks(billboard_id).await.map_err(engine_err)?;
                    blocks.retain(|b| b.id == id);
                    blocks
                }
            };
            query_response(block_schema(), blocks, |enc, b| {
                enc.encode_field(&b.id.to_string())?;
                enc.encode_field(&b.billboard_id.to_string())?;
                enc.encode_field(&b.range.start.to_string())?;
                enc.encode_field(&b.range.end.to_string())?;
                enc.encode_field(&b.reason())?;
                enc.encode_field(&b.booking_id().map(|id| id.to_string()))
            })
        }
        Command::SelectOverrides { billboard_id } => {
            let overrides = engine.get_overrides(billboard_id).await.map_err(engine_err)?;
            query_response(override_schema(), overrides, |enc, o| {
                enc.encode_field(&o.id.to_string())?;
                enc.encode_field(&o.billboard_id.to_string())?;
                enc.encode_field(&o.range.start.to_string())?;
                enc.encode_field(&o.range.end.to_string())?;
                enc.encode_field(&o.price_monthly.to_string())?;
                enc.encode_field(&o.note)?;
                enc.encode_field(&o.created_at.to_rfc3339())
            })
        }
        Command::SelectDayStatus { billboard_id, range } => {
            let days = engine.calendar(billboard_id, range).await.map_err(engine_err)?;
            let bid = billboard_id.to_string();
            query_response(day_status_schema(), days, |enc, (day, status)| {
                let (price, entry, booking_status) = match status {
                    DayStatus::Blocked { block_id } => (None, Some(block_id.to_string()), None),
                    DayStatus::Booked { booking_id, status } => {
                        (None, Some(booking_id.to_string()), Some(status.as_str()))
                    }
                    DayStatus::Priced(p) | DayStatus::Default(p) => (Some(p.to_string()), None, None),
                };
                enc.encode_field(&bid)?;
                enc.encode_field(&day.to_string())?;
                enc.encode_field(&status.label())?;
                enc.encode_field(&price)?;
                enc.encode_field(&entry)?;
                enc.encode_field(&booking_status)
            })
        }
        Command::SelectConflicts { billboard_id, range } => {
            let conflicts = engine.list_conflicts(billboard_id, range).await.map_err(engine_err)?;
            query_response(conflict_schema(), conflicts, |enc, c| {
                enc.encode_field(&c.id.to_string())?;
                enc.encode_field(&c.kind.as_str())?;
                enc.encode_field(&c.range.start.to_string())?;
                enc.encode_field(&c.range.end.to_string())?;
                enc.encode_field(&c.kind.is_blocking())
            })
        }
        Command::SelectQuote { billboard_id, range } => {
            let (rate, total) = engine.quote_with_rate(billboard_id, range).await.map_err(engine_err)?;
            query_response(quote_schema(), [(range, rate, total)], |enc, (range, rate, total)| {
                enc.encode_field(&billboard_id.to_string())?;
                enc.encode_field(&range.start.to_string())?;
                enc.encode_field(&range.end.to_string())?;
                enc.encode_field(&range.days())?;
                enc.encode_field(&rate.to_string())?;
                enc.encode_field(&total.to_string())
            })
        }
    }
}

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn phase_label(phase: BookingPhase) -> &'static str {
    match phase {
        BookingPhase::Pending => "pending",
        BookingPhase::Upcoming => "upcoming",
        BookingPhase::Active => "active",
        BookingPhase::Completed => "completed",
        BookingPhase::Rejected => "rejected",
        BookingPhase::Cancelled => "cancelled",
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn text(name: &str) -> FieldInfo {
    field(name, Type::VARCHAR)
}

fn billboard_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("owner_id"),
        field("is_digital", Type::BOOL),
        text("base_price_monthly"),
        field("min_campaign_days", Type::INT8),
        field("min_advance_booking_days", Type::INT8),
        field("is_available", Type::BOOL),
        text("pause_reason"),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("billboard_id"),
        text("requester_id"),
        text("start"),
        text("end"),
        text("status"),
        text("phase"),
        text("total_price"),
        text("note"),
        text("attachments"),
        text("rejection_reason"),
        text("created_at"),
    ]
}

fn block_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("billboard_id"),
        text("start"),
        text("end"),
        text("reason"),
        text("booking_id"),
    ]
}

fn override_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("billboard_id"),
        text("start"),
        text("end"),
        text("price_monthly"),
        text("note"),
        text("created_at"),
    ]
}

fn day_status_schema() -> Vec<FieldInfo> {
    vec![
        text("billboard_id"),
        text("day"),
        text("status"),
        text("price_monthly"),
        text("entry_id"),
        text("booking_status"),
    ]
}

fn conflict_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("kind"),
        text("start"),
        text("end"),
        field("blocking", Type::BOOL),
    ]
}

fn quote_schema() -> Vec<FieldInfo> {
    vec![
        text("billboard_id"),
        text("start"),
        text("end"),
        field("days", Type::INT8),
        text("price_monthly"),
        text("total_price"),
    ]
}

/// Result columns for a statement, known before any parameter is bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("billboards") => billboard_schema(),
        Some("bookings") => booking_schema(),
        Some("blocked_dates") => block_schema(),
        Some("pricing_overrides") => override_schema(),
        Some("day_status") => day_status_schema(),
        Some("conflicts") => conflict_schema(),
        Some("quotes") => quote_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for BoardLedgerHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        debug!("simple query: {query}");
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BoardLedgerQueryParser;

#[async_trait]
impl QueryParser for BoardLedgerQueryParser {
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

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BoardLedgerHandler {
    type Statement = String;
    type QueryParser = BoardLedgerQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text-format parameters as quoted literals. Highest index
/// first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BoardLedgerFactory {
    handler: Arc<BoardLedgerHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<BoardLedgerAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BoardLedgerFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(BoardLedgerHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                BoardLedgerAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BoardLedgerFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(BoardLedgerFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Invalid(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::Permission { .. } => "42501",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
