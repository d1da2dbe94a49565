use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveTime, TimeDelta, Utc};
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
use tracing::{debug, warn};

use crate::auth::SharedPasswordAuthSource;
use crate::engine::{ConstraintViolation, Engine, EngineError, SchedulingConflict};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::session::{Session, SessionStore};
use crate::sql::{self, Command, ProviderFilter, ResultShape};

/// Required slot length, enforced before a slot reaches the engine.
/// `minutes == 0` accepts any length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPolicy {
    pub minutes: u32,
}

impl Default for SlotPolicy {
    fn default() -> Self {
        Self { minutes: 60 }
    }
}

impl SlotPolicy {
    /// Inverted or empty ranges pass through so the engine can report them
    /// as invalid intervals.
    pub fn check(&self, start: NaiveTime, end: NaiveTime) -> Result<(), String> {
        let Some(span) = Span::new(start, end) else {
            return Ok(());
        };
        let want = TimeDelta::minutes(i64::from(self.minutes));
        if self.minutes != 0 && span.duration() != want {
            return Err(format!(
                "slot {span} must last exactly {} minutes, got {}s",
                self.minutes,
                span.duration().num_seconds()
            ));
        }
        Ok(())
    }
}

/// Everything a connection needs: the engine, the session store and the
/// request-layer policies.
pub struct Services {
    pub engine: Arc<Engine>,
    pub sessions: Arc<dyn SessionStore>,
    pub slot_policy: SlotPolicy,
    pub session_ttl: TimeDelta,
}

pub struct SlotbookHandler {
    services: Arc<Services>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, sql_text: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        debug!(command = label, ?cmd, "executing");

        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.services.engine;
        match cmd {
            Command::InsertProvider { name, surname, returning } => {
                let id = engine.create_provider(&name, &surname).await.map_err(engine_err)?;
                Ok(vec![inserted_id(id, returning)?])
            }
            Command::InsertConsumer {
                username,
                name,
                surname,
                date_of_birth,
                password,
            } => {
                engine
                    .create_consumer(NewConsumer {
                        username,
                        name,
                        surname,
                        date_of_birth,
                        secret: password.0,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertSlot {
                provider_id,
                day,
                start,
                end,
                returning,
            } => {
                self.services
                    .slot_policy
                    .check(start, end)
                    .map_err(|msg| user_error("22023", msg))?;
                let id = engine
                    .publish_slot(provider_id, day, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted_id(id, returning)?])
            }
            Command::InsertReservation {
                consumer_username,
                provider_id,
                slot_id,
                subject,
                returning,
            } => {
                let id = engine
                    .reserve(&consumer_username, provider_id, slot_id, &subject)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted_id(id, returning)?])
            }
            Command::DeleteReservation { id, returning } => {
                let username = engine.cancel(id).await.map_err(engine_err)?;
                if returning {
                    let schema = Arc::new(shape_schema(ResultShape::ReturningUsername));
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&username)?;
                    let rows = vec![Ok(encoder.take_row())];
                    Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
                } else {
                    Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
                }
            }
            Command::SelectProviders { filter } => {
                let providers = match filter {
                    ProviderFilter::All => engine.list_providers(),
                    ProviderFilter::Id(id) => vec![engine.get_provider(id).map_err(engine_err)?],
                    ProviderFilter::Name { name, surname } => {
                        vec![engine.find_provider_by_name(&name, &surname).map_err(engine_err)?]
                    }
                };
                Ok(vec![provider_rows(providers)?])
            }
            Command::SelectConsumers { username } => {
                let profiles = match username {
                    None => engine.list_consumers(),
                    Some(u) => vec![engine.find_consumer_by_username(&u).map_err(engine_err)?],
                };
                Ok(vec![consumer_rows(profiles)?])
            }
            Command::SelectSlots { provider_id, booked } => {
                let slots = match booked {
                    None => engine.list_slots(provider_id),
                    Some(false) => engine.list_open_slots(provider_id),
                    Some(true) => engine.list_booked_slots(provider_id),
                }
                .map_err(engine_err)?;
                Ok(vec![slot_rows(slots)?])
            }
            Command::SelectHistory { consumer_username } => {
                let views = engine.history(&consumer_username).await.map_err(engine_err)?;
                Ok(vec![history_rows(views)?])
            }
            Command::Login { username, password } => {
                let profile = engine
                    .verify_credentials(&username, &password.0)
                    .await
                    .map_err(engine_err)?;
                let session = Session::issue(profile.username, self.services.session_ttl, Utc::now());
                self.services.sessions.set(session.clone());
                debug!(username = %session.username, "session issued");
                Ok(vec![session_rows(vec![session])?])
            }
            Command::SelectSession { token } => {
                let found = self.services.sessions.get(&token, Utc::now());
                Ok(vec![session_rows(found.into_iter().collect())?])
            }
            Command::DeleteSession { token } => {
                let removed = self.services.sessions.expire(&token);
                Ok(vec![Response::Execution(
                    Tag::new("DELETE").with_rows(usize::from(removed)),
                )])
            }
        }
    }
}

// ── Result encoding ──────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn shape_schema(shape: ResultShape) -> Vec<FieldInfo> {
    match shape {
        ResultShape::None => vec![],
        ResultShape::Providers => vec![
            text_field("id", Type::INT8),
            text_field("name", Type::VARCHAR),
            text_field("surname", Type::VARCHAR),
        ],
        ResultShape::Consumers => vec![
            text_field("username", Type::VARCHAR),
            text_field("name", Type::VARCHAR),
            text_field("surname", Type::VARCHAR),
            text_field("date_of_birth", Type::VARCHAR),
        ],
        ResultShape::Slots => vec![
            text_field("id", Type::INT8),
            text_field("provider_id", Type::INT8),
            text_field("day", Type::VARCHAR),
            text_field("start_time", Type::VARCHAR),
            text_field("end_time", Type::VARCHAR),
            text_field("booked", Type::BOOL),
        ],
        ResultShape::History => vec![
            text_field("reservation_id", Type::INT8),
            text_field("slot_id", Type::INT8),
            text_field("provider_id", Type::INT8),
            text_field("day", Type::VARCHAR),
            text_field("start_time", Type::VARCHAR),
            text_field("end_time", Type::VARCHAR),
            text_field("provider_name", Type::VARCHAR),
            text_field("provider_surname", Type::VARCHAR),
            text_field("subject", Type::VARCHAR),
        ],
        ResultShape::Session => vec![
            text_field("token", Type::VARCHAR),
            text_field("username", Type::VARCHAR),
            text_field("expires_at", Type::VARCHAR),
        ],
        ResultShape::ReturningId => vec![text_field("id", Type::INT8)],
        ResultShape::ReturningUsername => vec![text_field("consumer_username", Type::VARCHAR)],
    }
}

fn date_text(day: chrono::NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// Full `HH:MM:SS`, so a time parsed with seconds reads back unchanged.
fn time_text(t: NaiveTime) -> String {
    t.format("%H:%M:%S").to_string()
}

fn inserted_id(id: i64, returning: bool) -> PgWireResult<Response> {
    if !returning {
        return Ok(Response::Execution(Tag::new("INSERT").with_rows(1)));
    }
    let schema = Arc::new(shape_schema(ResultShape::ReturningId));
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&id)?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn provider_rows(providers: Vec<Provider>) -> PgWireResult<Response> {
    let schema = Arc::new(shape_schema(ResultShape::Providers));
    let rows: Vec<PgWireResult<_>> = providers
        .into_iter()
        .map(|p| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&p.id)?;
            encoder.encode_field(&p.name)?;
            encoder.encode_field(&p.surname)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn consumer_rows(profiles: Vec<ConsumerProfile>) -> PgWireResult<Response> {
    let schema = Arc::new(shape_schema(ResultShape::Consumers));
    let rows: Vec<PgWireResult<_>> = profiles
        .into_iter()
        .map(|c| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&c.username)?;
            encoder.encode_field(&c.name)?;
            encoder.encode_field(&c.surname)?;
            encoder.encode_field(&date_text(c.date_of_birth))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn slot_rows(slots: Vec<Slot>) -> PgWireResult<Response> {
    let schema = Arc::new(shape_schema(ResultShape::Slots));
    let rows: Vec<PgWireResult<_>> = slots
        .into_iter()
        .map(|s| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&s.id)?;
            encoder.encode_field(&s.provider_id)?;
            encoder.encode_field(&date_text(s.day))?;
            encoder.encode_field(&time_text(s.span.start))?;
            encoder.encode_field(&time_text(s.span.end))?;
            encoder.encode_field(&s.booked)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn history_rows(views: Vec<ReservationView>) -> PgWireResult<Response> {
    let schema = Arc::new(shape_schema(ResultShape::History));
    let rows: Vec<PgWireResult<_>> = views
        .into_iter()
        .map(|v| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&v.reservation_id)?;
            encoder.encode_field(&v.slot_id)?;
            encoder.encode_field(&v.provider_id)?;
            encoder.encode_field(&date_text(v.day))?;
            encoder.encode_field(&time_text(v.span.start))?;
            encoder.encode_field(&time_text(v.span.end))?;
            encoder.encode_field(&v.provider_name)?;
            encoder.encode_field(&v.provider_surname)?;
            encoder.encode_field(&v.subject)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn session_rows(sessions: Vec<Session>) -> PgWireResult<Response> {
    let schema = Arc::new(shape_schema(ResultShape::Session));
    let rows: Vec<PgWireResult<_>> = sessions
        .into_iter()
        .map(|s| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&s.token.to_string())?;
            encoder.encode_field(&s.username)?;
            encoder.encode_field(&s.expires_at.to_rfc3339())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
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
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
        Ok(shape_schema(sql::result_shape(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        let schema = shape_schema(sql::result_shape(&target.statement));
        Ok(DescribeStatementResponse::new(param_types, schema))
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
        let schema = shape_schema(sql::result_shape(&target.statement.statement));
        Ok(DescribePortalResponse::new(schema))
    }
}

/// Byte ranges and 1-based indexes of the `$N` placeholders in `sql`.
/// Text inside single-quoted literals is skipped.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // A doubled '' inside a literal toggles twice and stays inside
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i;
                i += 1;
                let digits = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n @ 1..) = sql[digits..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Highest placeholder index in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Splice bound values (text format) into the statement in one pass over
/// the original text, so a value is never rescanned for placeholders.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        out.push_str(&sql[copied..range.start]);
        match params.get(n - 1) {
            Some(Some(value)) => {
                let text = String::from_utf8_lossy(value.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            // Unbound: left as is for the parser to reject
            None => out.push_str(&sql[range.clone()]),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SharedPasswordAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(services: Arc<Services>, password: String) -> Self {
        let auth_source = SharedPasswordAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(services)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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
    services: Arc<Services>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SlotbookFactory::new(services, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine error kind.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::Constraint(ConstraintViolation::DuplicateUsername(_)) => "23505",
        EngineError::Conflict(SchedulingConflict::SlotNotOwnedByProvider { .. }) => "23503",
        EngineError::Conflict(_) => "23P01",
        EngineError::InvalidInterval { .. } | EngineError::InvalidInput(_) => "22023",
        EngineError::InvalidCredentials => "28P01",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::StorageFailure(_) => "58030",
        EngineError::Contention => "40001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if matches!(e, EngineError::StorageFailure(_)) {
        warn!(error = %e, "storage failure");
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NotFound;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn slot_policy_exact_length() {
        let hour = SlotPolicy::default();
        assert!(hour.check(t(9, 0), t(10, 0)).is_ok());
        assert!(hour.check(t(9, 0), t(9, 30)).is_err());
        assert!(hour.check(t(9, 0), t(11, 0)).is_err());
        let off_by_seconds = NaiveTime::from_hms_opt(10, 0, 30).unwrap();
        assert!(hour.check(t(9, 0), off_by_seconds).is_err());
        // Left for the engine to reject as an invalid interval
        assert!(hour.check(t(10, 0), t(9, 0)).is_ok());

        let any = SlotPolicy { minutes: 0 };
        assert!(any.check(t(9, 0), t(9, 5)).is_ok());
    }

    #[test]
    fn times_keep_their_seconds() {
        let thirty_past = NaiveTime::from_hms_opt(9, 0, 30).unwrap();
        assert_eq!(time_text(thirty_past), "09:00:30");
        assert_eq!(time_text(NaiveTime::from_hms_opt(10, 0, 0).unwrap()), "10:00:00");
    }

    #[test]
    fn sqlstates_by_kind() {
        assert_eq!(sqlstate(&NotFound::Slot(1).into()), "P0002");
        assert_eq!(
            sqlstate(&ConstraintViolation::DuplicateUsername("grace".into()).into()),
            "23505"
        );
        assert_eq!(
            sqlstate(&SchedulingConflict::SlotNotOwnedByProvider { slot_id: 1, provider_id: 2 }.into()),
            "23503"
        );
        assert_eq!(sqlstate(&SchedulingConflict::SlotAlreadyBooked(1).into()), "23P01");
        assert_eq!(sqlstate(&SchedulingConflict::ScheduleConflict { existing: 1 }.into()), "23P01");
        assert_eq!(sqlstate(&SchedulingConflict::OverlapConflict { existing: 1 }.into()), "23P01");
        assert_eq!(sqlstate(&EngineError::InvalidInterval { start: t(10, 0), end: t(9, 0) }), "22023");
        assert_eq!(sqlstate(&EngineError::InvalidCredentials), "28P01");
        assert_eq!(sqlstate(&EngineError::LimitExceeded("x")), "54000");
        assert_eq!(sqlstate(&EngineError::StorageFailure("x".into())), "58030");
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM slots"), 0);
        assert_eq!(count_params("INSERT INTO reservations VALUES ($1, $2, $3, $4)"), 4);
        assert_eq!(count_params("SELECT * FROM slots WHERE provider_id = $2 AND booked = $1"), 2);
        assert_eq!(count_params("SELECT * FROM history WHERE consumer_username = '$3'"), 0);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let sql = "INSERT INTO reservations VALUES ($1, $2, $3, $4)";
        let bound = bind_params(sql, &[Some("grace"), Some("1"), Some("$2"), Some("costs $1 only")]);
        assert_eq!(
            bound,
            "INSERT INTO reservations VALUES ('grace', '1', '$2', 'costs $1 only')"
        );
    }

    #[test]
    fn bind_quotes_and_handles_nulls() {
        let bound = bind_params("SELECT * FROM login WHERE username = $1 AND password = $2", &[
            Some("o'brien"),
            None,
        ]);
        assert_eq!(
            bound,
            "SELECT * FROM login WHERE username = 'o''brien' AND password = NULL"
        );
        // $10 is one placeholder, not $1 followed by 0
        let params: Vec<Option<String>> = (1..=10).map(|i| Some(format!("v{i}"))).collect();
        assert_eq!(bind_params("$10 $1", &params), "'v10' 'v1'");
    }
}
