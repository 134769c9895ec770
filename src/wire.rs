use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::CitystageAuthSource;
use crate::engine::{validate_booking_date, BookingOutcome, Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, BookingFilter, Command};

pub struct CitystageHandler {
    engine: Arc<Engine>,
    query_parser: Arc<CitystageQueryParser>,
}

impl CitystageHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(CitystageQueryParser),
        }
    }

    /// Parse, execute and record one statement.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertLocation { id, address, img } => {
                engine.create_location(id, address, img).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateLocation { id, address } => {
                engine
                    .update_location_address(id, address)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectLocations { id } => {
                let locations = match id {
                    Some(id) => engine.get_location(&id).into_iter().collect(),
                    None => engine.list_locations(),
                };
                let schema = Arc::new(locations_schema());
                let rows: Vec<PgWireResult<_>> = locations
                    .into_iter()
                    .map(|l| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&l.id.to_string())?;
                        encoder.encode_field(&l.address)?;
                        encoder.encode_field(&l.img)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertUser { id, name, verified } => {
                engine.register_user(id, name, verified).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateUser { id, verified } => {
                engine.set_user_verified(id, verified).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectUsers { id } => {
                let users = match id {
                    Some(id) => engine.get_user(&id).into_iter().collect(),
                    None => engine.list_users(),
                };
                let schema = Arc::new(users_schema());
                let rows: Vec<PgWireResult<_>> = users
                    .into_iter()
                    .map(|u| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&u.id.to_string())?;
                        encoder.encode_field(&u.name)?;
                        encoder.encode_field(&u.verified)?;
                        encoder.encode_field(&u.cooldown_until)?;
                        encoder.encode_field(&u.in_cooldown)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertBooking {
                user_id,
                location_id,
                date,
                time,
                duration_hours,
            } => {
                let today = chrono::Utc::now().date_naive();
                validate_booking_date(date, today, engine.config.booking_horizon_days)
                    .map_err(|e| engine_err(e.into()))?;
                let outcome = engine
                    .create_booking(user_id, location_id, date, &time, duration_hours)
                    .await
                    .map_err(engine_err)?;
                booking_outcome_response(&outcome)
            }
            Command::UpdateBooking {
                id,
                date,
                time,
                duration_hours,
            } => {
                let edit = BookingEdit {
                    date,
                    time,
                    duration_hours,
                };
                engine.edit_booking(id, &edit).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::CancelBooking { id, user_id } => {
                engine.cancel_booking(id, user_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::DeleteUser { id } => {
                engine.delete_user(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { filter } => {
                let bookings: Vec<BookingInfo> = match filter {
                    BookingFilter::All => engine.list_all_bookings().await,
                    BookingFilter::User(user_id) => engine.get_user_bookings(&user_id).await,
                    BookingFilter::Id(id) => engine
                        .get_booking(&id)
                        .await
                        .into_iter()
                        .map(|b| with_address(engine, b))
                        .collect(),
                    BookingFilter::Day { location_id, date } => engine
                        .list_bookings(location_id, date)
                        .await
                        .into_iter()
                        .map(|b| with_address(engine, b))
                        .collect(),
                };
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|info| {
                        let b = &info.booking;
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.user_id.to_string())?;
                        encoder.encode_field(&b.location_id.to_string())?;
                        encoder.encode_field(&info.location_address)?;
                        encoder.encode_field(&b.date.to_string())?;
                        encoder.encode_field(&b.time)?;
                        encoder.encode_field(&i32::from(b.duration_hours))?;
                        encoder.encode_field(&b.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectSchedule { location_id, date } => {
                let slots = engine
                    .get_location_schedule(location_id, date)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(schedule_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&(slot.hour as i32))?;
                        encoder.encode_field(&slot.time)?;
                        encoder.encode_field(&slot.occupied)?;
                        encoder.encode_field(&slot.booking.map(|b| b.id.to_string()))?;
                        encoder.encode_field(&slot.can_book_1h)?;
                        encoder.encode_field(&slot.can_book_2h)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectSuggestions {
                location_id,
                date,
                time,
                duration_hours,
            } => {
                let suggestions = engine
                    .get_available_time_suggestions(location_id, date, &time, duration_hours)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(suggestions_schema());
                let rows: Vec<PgWireResult<_>> = suggestions
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.start_time)?;
                        encoder.encode_field(&i32::from(s.duration))?;
                        encoder.encode_field(&s.end_time)?;
                        encoder.encode_field(&s.description)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectSettings => {
                let schema = Arc::new(settings_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .settings_snapshot()
                    .into_iter()
                    .map(|(key, value)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&key)?;
                        encoder.encode_field(&value)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::UpdateSetting { key, value } => {
                engine.set_setting(&key, &value).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
        }
    }
}

fn with_address(engine: &Engine, booking: Booking) -> BookingInfo {
    BookingInfo {
        location_address: engine.get_location(&booking.location_id).map(|l| l.address),
        booking,
    }
}

/// One row `(id, accepted, message)`; `id` is NULL for a rejection.
fn booking_outcome_response(outcome: &BookingOutcome) -> PgWireResult<Response> {
    let schema = Arc::new(booking_outcome_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&outcome.booking_id().map(|id| id.to_string()))?;
    encoder.encode_field(&outcome.is_accepted())?;
    encoder.encode_field(&outcome.message().to_string())?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn locations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("address", Type::VARCHAR),
        text_field("img", Type::VARCHAR),
    ]
}

fn users_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("verified", Type::BOOL),
        text_field("cooldown_until", Type::INT8),
        text_field("in_cooldown", Type::BOOL),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("location_id", Type::VARCHAR),
        text_field("location_address", Type::VARCHAR),
        text_field("date", Type::VARCHAR),
        text_field("time", Type::VARCHAR),
        text_field("duration_hours", Type::INT4),
        text_field("created_at", Type::INT8),
    ]
}

fn booking_outcome_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("accepted", Type::BOOL),
        text_field("message", Type::VARCHAR),
    ]
}

fn schedule_schema() -> Vec<FieldInfo> {
    vec![
        text_field("hour", Type::INT4),
        text_field("time", Type::VARCHAR),
        text_field("occupied", Type::BOOL),
        text_field("booking_id", Type::VARCHAR),
        text_field("can_book_1h", Type::BOOL),
        text_field("can_book_2h", Type::BOOL),
    ]
}

fn suggestions_schema() -> Vec<FieldInfo> {
    vec![
        text_field("start_time", Type::VARCHAR),
        text_field("duration", Type::INT4),
        text_field("end_time", Type::VARCHAR),
        text_field("description", Type::VARCHAR),
    ]
}

fn settings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("key", Type::VARCHAR),
        text_field("value", Type::VARCHAR),
    ]
}

/// Row shape of a statement, decided from its leading keyword and target
/// table. Used to describe prepared statements before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let table_after = |keyword: &str| {
        words
            .windows(2)
            .find(|pair| pair[0] == keyword)
            .map(|pair| pair[1].rsplit('.').next().unwrap_or(pair[1]).trim_matches('"'))
    };
    match words.first().copied() {
        Some("SELECT") => match table_after("FROM") {
            Some("LOCATIONS") => locations_schema(),
            Some("USERS") => users_schema(),
            Some("BOOKINGS") => bookings_schema(),
            Some("SCHEDULE") => schedule_schema(),
            Some("SUGGESTIONS") => suggestions_schema(),
            Some("SETTINGS") => settings_schema(),
            _ => vec![],
        },
        Some("INSERT") if table_after("INTO") == Some("BOOKINGS") => booking_outcome_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for CitystageHandler {
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
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CitystageQueryParser;

#[async_trait]
impl QueryParser for CitystageQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CitystageHandler {
    type Statement = String;
    type QueryParser = CitystageQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text
/// format). Highest index first so `$1` never eats the prefix of `$10`.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CitystageFactory {
    handler: Arc<CitystageHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<CitystageAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl CitystageFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = CitystageAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CitystageHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CitystageFactory {
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
    let factory = Arc::new(CitystageFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine error.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict(_) => "23P01",
        EngineError::NotOwner(_) => "42501",
        EngineError::Invalid(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::WalError(_) = e {
        tracing::error!("{e}");
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
