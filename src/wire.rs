use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared password for every login.
#[derive(Debug)]
pub struct CourtsideAuthSource {
    password: String,
}

impl CourtsideAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for CourtsideAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Handler ──────────────────────────────────────────────────────

pub struct CourtsideHandler {
    engine: Arc<Engine>,
    query_parser: Arc<CourtsideQueryParser>,
}

impl CourtsideHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(CourtsideQueryParser),
        }
    }

    /// Parse, execute and record query metrics.
    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::debug!(command = label, "query failed: {e}");
        }
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertGroup { group } => {
                engine.create_group(group).await.map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::InsertCourt { court } => {
                engine.create_court(court).await.map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::InsertSlot { slot } => {
                engine.define_slot(slot).await.map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::InsertPrice { row } => {
                engine.set_price(row).await.map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::DeletePrice { id } => {
                engine.remove_price(id).await.map_err(engine_err)?;
                Ok(vec![delete_tag(1)])
            }
            Command::InsertBookings { request } => {
                let rows = engine.place_reservation(request).await.map_err(engine_err)?;
                Ok(vec![insert_tag(rows.len())])
            }
            Command::InsertRecurring { id, user_id, request } => {
                let outcome = engine
                    .create_recurring(id, user_id, request)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(outcome.created)])
            }
            Command::InsertPayment { booking_id, proof_ref } => {
                engine
                    .confirm_payment(booking_id, proof_ref)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::InsertCompletion { booking_id } => {
                engine.complete_booking(booking_id).await.map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(vec![delete_tag(1)])
            }
            Command::DeleteRecurring { id } => {
                engine.cancel_rule(id).await.map_err(engine_err)?;
                Ok(vec![delete_tag(1)])
            }
            Command::SelectAvailability { group_id, date } => {
                let courts = engine.availability(group_id, date).await.map_err(engine_err)?;
                Ok(vec![availability_response(courts)])
            }
            Command::SelectConflicts { request } => {
                let conflicts = engine.check_conflicts(&request).await.map_err(engine_err)?;
                Ok(vec![conflicts_response(conflicts)])
            }
            Command::SelectPricePreview { request } => {
                let preview = engine.price_preview(&request).await.map_err(engine_err)?;
                Ok(vec![price_preview_response(preview)])
            }
            Command::SelectBookingPreview {
                group_id,
                court_id,
                date,
                ranges,
            } => {
                let preview = engine
                    .booking_preview(group_id, court_id, date, &ranges)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![booking_preview_response(preview)])
            }
            Command::SelectBookings { court_id, date } => {
                let bookings = engine.list_bookings(court_id, date).await.map_err(engine_err)?;
                Ok(vec![bookings_response(bookings)])
            }
            Command::SelectRecurring { id } => {
                let rules = engine.list_rules(id).map_err(engine_err)?;
                Ok(vec![rules_response(rules)])
            }
            Command::SelectRevenue {
                group_id,
                start_date,
                end_date,
            } => {
                let summary = engine
                    .revenue(group_id, start_date, end_date)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![revenue_response(summary)])
            }
        }
    }
}

fn insert_tag(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn delete_tag(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

fn hm(t: chrono::NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

fn joined<T: ToString>(items: &[T]) -> String {
    items.iter().map(T::to_string).collect::<Vec<_>>().join(",")
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn float8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::FLOAT8, FieldFormat::Text)
}

/// One row per booked block and one per priced slot, told apart by `kind`.
fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text("court_id"),
        text("court_name"),
        text("kind"),
        text("slot_ids"),
        text("start_time"),
        text("end_time"),
        text("reservation_id"),
        int8("price"),
    ]
}

fn conflicts_schema() -> Vec<FieldInfo> {
    vec![
        text("booking_id"),
        text("court_name"),
        text("date"),
        text("start_time"),
        text("end_time"),
    ]
}

/// Per-date rows, each carrying the request totals.
fn price_preview_schema() -> Vec<FieldInfo> {
    vec![
        text("date"),
        text("day_type"),
        int8("price"),
        int8("total_count"),
        int8("weekday_count"),
        int8("weekend_count"),
        int8("weekday_unit_price"),
        int8("weekend_unit_price"),
        int8("total_price"),
    ]
}

fn booking_preview_schema() -> Vec<FieldInfo> {
    vec![text("start_time"), text("end_time"), int8("total_price")]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("reservation_id"),
        text("rule_id"),
        text("user_id"),
        text("court_id"),
        int8("slot_id"),
        text("date"),
        text("start_time"),
        text("end_time"),
        text("status"),
        int8("price"),
        text("address"),
        text("payment_ref"),
        int8("created_at"),
    ]
}

fn rules_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("user_id"),
        text("court_id"),
        text("start_date"),
        text("end_date"),
        text("weekdays"),
        text("start_time"),
        text("end_time"),
        text("status"),
        int8("created_at"),
        int8("updated_at"),
    ]
}

fn revenue_schema() -> Vec<FieldInfo> {
    vec![
        text("group_id"),
        int8("revenue"),
        int8("previous_revenue"),
        int8("bookings"),
        float8("growth_percent"),
    ]
}

/// Schema for a SELECT by the virtual table it reads, without binding params.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    match select_table(sql).as_deref() {
        Some("availability") => availability_schema(),
        Some("conflicts") => conflicts_schema(),
        Some("price_preview") => price_preview_schema(),
        Some("booking_preview") => booking_preview_schema(),
        Some("bookings") => bookings_schema(),
        Some("recurring_bookings") => rules_schema(),
        Some("revenue") => revenue_schema(),
        _ => vec![],
    }
}

/// Table name following `FROM` in a SELECT, lowercased.
fn select_table(sql: &str) -> Option<String> {
    let lower = sql.to_lowercase();
    let mut words = lower.split_whitespace();
    if words.next()? != "select" {
        return None;
    }
    words.find(|w| *w == "from")?;
    let table = words.next()?;
    let table = table.trim_end_matches(';');
    Some(table.rsplit('.').next().unwrap_or(table).trim_matches('"').to_string())
}

// ── Result rows ──────────────────────────────────────────────────

fn query_response(schema: Vec<FieldInfo>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(Arc::new(schema), stream::iter(rows)))
}

fn availability_response(courts: Vec<CourtAvailability>) -> Response {
    let schema = Arc::new(availability_schema());
    let mut rows = Vec::new();
    for court in courts {
        let court_id = court.court_id.to_string();
        for block in &court.booked {
            rows.push((|| -> PgWireResult<DataRow> {
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&court_id)?;
                encoder.encode_field(&court.court_name)?;
                encoder.encode_field(&"booked")?;
                encoder.encode_field(&joined(&block.slot_ids))?;
                encoder.encode_field(&hm(block.range.start))?;
                encoder.encode_field(&hm(block.range.end))?;
                encoder.encode_field(&Some(block.reservation_id.to_string()))?;
                encoder.encode_field(&block.price)?;
                Ok(encoder.take_row())
            })());
        }
        for slot in &court.priced_slots {
            rows.push((|| -> PgWireResult<DataRow> {
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&court_id)?;
                encoder.encode_field(&court.court_name)?;
                encoder.encode_field(&"priced")?;
                encoder.encode_field(&slot.slot_id.to_string())?;
                encoder.encode_field(&hm(slot.range.start))?;
                encoder.encode_field(&hm(slot.range.end))?;
                encoder.encode_field(&None::<String>)?;
                encoder.encode_field(&slot.unit_price)?;
                Ok(encoder.take_row())
            })());
        }
    }
    query_response(availability_schema(), rows)
}

fn conflicts_response(conflicts: Vec<Conflict>) -> Response {
    let schema = Arc::new(conflicts_schema());
    let rows = conflicts
        .into_iter()
        .map(|c| -> PgWireResult<DataRow> {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&c.booking_id.to_string())?;
            encoder.encode_field(&c.court_name)?;
            encoder.encode_field(&c.date.to_string())?;
            encoder.encode_field(&hm(c.start))?;
            encoder.encode_field(&hm(c.end))?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(conflicts_schema(), rows)
}

fn price_preview_response(preview: PricePreview) -> Response {
    let schema = Arc::new(price_preview_schema());
    let rows = preview
        .dates
        .iter()
        .map(|d| -> PgWireResult<DataRow> {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&d.date.to_string())?;
            encoder.encode_field(&d.day_type.as_str())?;
            encoder.encode_field(&d.price)?;
            encoder.encode_field(&(preview.total_count as i64))?;
            encoder.encode_field(&(preview.weekday_count as i64))?;
            encoder.encode_field(&(preview.weekend_count as i64))?;
            encoder.encode_field(&preview.weekday_unit_price)?;
            encoder.encode_field(&preview.weekend_unit_price)?;
            encoder.encode_field(&preview.total_price)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(price_preview_schema(), rows)
}

fn booking_preview_response(preview: BookingPreview) -> Response {
    let schema = Arc::new(booking_preview_schema());
    let rows = preview
        .ranges
        .iter()
        .map(|range| -> PgWireResult<DataRow> {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&hm(range.start))?;
            encoder.encode_field(&hm(range.end))?;
            encoder.encode_field(&preview.total_price)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(booking_preview_schema(), rows)
}

fn bookings_response(bookings: Vec<Booking>) -> Response {
    let schema = Arc::new(bookings_schema());
    let rows = bookings
        .into_iter()
        .map(|b| -> PgWireResult<DataRow> {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.reservation_id.to_string())?;
            encoder.encode_field(&b.rule_id.map(|id| id.to_string()))?;
            encoder.encode_field(&b.user_id)?;
            encoder.encode_field(&b.court_id.to_string())?;
            encoder.encode_field(&i64::from(b.slot_id))?;
            encoder.encode_field(&b.date.to_string())?;
            encoder.encode_field(&hm(b.range.start))?;
            encoder.encode_field(&hm(b.range.end))?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.price)?;
            encoder.encode_field(&b.address)?;
            encoder.encode_field(&b.payment_ref)?;
            encoder.encode_field(&b.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(bookings_schema(), rows)
}

fn rules_response(rules: Vec<RecurringRule>) -> Response {
    let schema = Arc::new(rules_schema());
    let rows = rules
        .into_iter()
        .map(|r| -> PgWireResult<DataRow> {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.user_id)?;
            encoder.encode_field(&r.court_id.to_string())?;
            encoder.encode_field(&r.start_date.to_string())?;
            encoder.encode_field(&r.end_date.to_string())?;
            encoder.encode_field(&r.weekdays.to_string())?;
            encoder.encode_field(&hm(r.range.start))?;
            encoder.encode_field(&hm(r.range.end))?;
            encoder.encode_field(&r.status.as_str())?;
            encoder.encode_field(&r.created_at)?;
            encoder.encode_field(&r.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(rules_schema(), rows)
}

fn revenue_response(summary: RevenueSummary) -> Response {
    let schema = Arc::new(revenue_schema());
    let row = (|| -> PgWireResult<DataRow> {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&summary.group_id.to_string())?;
        encoder.encode_field(&summary.revenue)?;
        encoder.encode_field(&summary.previous_revenue)?;
        encoder.encode_field(&(summary.bookings as i64))?;
        encoder.encode_field(&summary.growth_percent)?;
        Ok(encoder.take_row())
    })();
    query_response(revenue_schema(), vec![row])
}

#[async_trait]
impl SimpleQueryHandler for CourtsideHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CourtsideQueryParser;

#[async_trait]
impl QueryParser for CourtsideQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CourtsideHandler {
    type Statement = String;
    type QueryParser = CourtsideQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
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
        let mut responses = self.run(&sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
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
            schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for(
            &target.statement.statement,
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
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
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

pub struct CourtsideFactory {
    handler: Arc<CourtsideHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<CourtsideAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl CourtsideFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = CourtsideAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CourtsideHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CourtsideFactory {
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
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = CourtsideFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE and message for an engine error. Conflicts carry the JSON
/// conflict list.
fn engine_error_parts(e: &EngineError) -> (&'static str, String) {
    match e {
        EngineError::Validation(_) | EngineError::LimitExceeded(_) => ("22023", e.to_string()),
        EngineError::Conflict(list) => {
            let message = match serde_json::to_string(list) {
                Ok(json) => format!("{e}: {json}"),
                Err(_) => e.to_string(),
            };
            ("23P01", message)
        }
        EngineError::NotFound(_) | EngineError::UnknownSlot(_) => ("02000", e.to_string()),
        EngineError::InvalidTransition { .. } => ("55000", e.to_string()),
        EngineError::AlreadyExists(_) | EngineError::WalError(_) => ("P0001", e.to_string()),
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let (code, message) = engine_error_parts(&e);
    user_error(code, message)
}

fn sql_error_code(e: &SqlError) -> &'static str {
    match e {
        SqlError::Invalid(_) => "22023",
        _ => "42601",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_error_code(&e), e.to_string())
}
