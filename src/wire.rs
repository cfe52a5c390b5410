use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
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
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::AdminCredentials;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError, Table};
use crate::tenant::TenantManager;

pub struct BookdeskHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<BookdeskQueryParser>,
}

impl BookdeskHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(BookdeskQueryParser),
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
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertUser(new) => {
                engine.create_user(new).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateUser { id, patch } => {
                engine.update_user(id, patch).await.map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::DeleteUser { id } => {
                engine.delete_user(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertService(new) => {
                engine.create_service(new).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateService { id, patch } => {
                engine.update_service(id, patch).await.map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::DeleteService { id } => {
                engine.delete_service(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertStaff(new) => {
                engine.create_staff(new).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateStaff { id, patch } => {
                engine.update_staff(id, patch).await.map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::DeleteStaff { id } => {
                engine.delete_staff(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertBooking(draft) => {
                engine.create_booking(draft).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::BatchInsertBookings(drafts) => {
                let created = engine
                    .batch_create_bookings(drafts)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(created.len()))
            }
            Command::UpdateBooking { id, patch } => {
                engine.update_booking(id, patch).await.map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectUsers { id } => rows(Table::Users, engine.list_users(id), encode_user),
            Command::SelectServices { id } => {
                rows(Table::Services, engine.list_services(id), encode_service)
            }
            Command::SelectStaff { id } => rows(Table::Staff, engine.list_staff(id), encode_staff),
            Command::SelectBookings(filter) => {
                let bookings = engine.list_bookings(&filter).await.map_err(engine_err)?;
                rows(Table::Bookings, bookings, encode_booking)
            }
            Command::SelectConflict {
                start,
                end,
                exclude_id,
            } => {
                let hit = engine
                    .check_conflict(start, end, exclude_id)
                    .await
                    .map_err(engine_err)?;
                rows(Table::Conflicts, vec![hit], encode_conflict)
            }
        }
    }
}

fn inserted(n: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(n))
}

fn updated(n: usize) -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(n))
}

fn deleted(n: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(n))
}

// ── Result sets ──────────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

/// Column layout of `SELECT *` for each table.
fn table_schema(table: Table) -> Vec<FieldInfo> {
    match table {
        Table::Users => vec![
            text("id"),
            text("email"),
            text("name"),
            text("role"),
            int8("created_at"),
        ],
        Table::Services => vec![
            text("id"),
            text("name"),
            text("description"),
            int8("duration_ms"),
            int8("price_cents"),
            int8("created_at"),
        ],
        Table::Staff => vec![
            text("id"),
            text("name"),
            text("email"),
            text("phone"),
            int8("created_at"),
        ],
        Table::Bookings => vec![
            text("id"),
            text("service_id"),
            text("staff_id"),
            text("customer_name"),
            text("customer_email"),
            int8("start"),
            int8("end"),
            text("status"),
            text("notes"),
            int8("created_at"),
        ],
        Table::Conflicts => vec![
            FieldInfo::new("conflict".into(), None, None, Type::BOOL, FieldFormat::Text),
            text("booking_id"),
        ],
    }
}

fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    sql::select_table(sql).map(table_schema).unwrap_or_default()
}

fn rows<T>(
    table: Table,
    items: Vec<T>,
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(table_schema(table));
    let rows: Vec<PgWireResult<DataRow>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn encode_user(e: &mut DataRowEncoder, u: &User) -> PgWireResult<()> {
    e.encode_field(&u.id.to_string())?;
    e.encode_field(&u.email)?;
    e.encode_field(&u.name)?;
    e.encode_field(&u.role.as_str())?;
    e.encode_field(&u.created_at)
}

fn encode_service(e: &mut DataRowEncoder, s: &Service) -> PgWireResult<()> {
    e.encode_field(&s.id.to_string())?;
    e.encode_field(&s.name)?;
    e.encode_field(&s.description)?;
    e.encode_field(&s.duration_ms)?;
    e.encode_field(&s.price_cents)?;
    e.encode_field(&s.created_at)
}

fn encode_staff(e: &mut DataRowEncoder, s: &StaffMember) -> PgWireResult<()> {
    e.encode_field(&s.id.to_string())?;
    e.encode_field(&s.name)?;
    e.encode_field(&s.email)?;
    e.encode_field(&s.phone)?;
    e.encode_field(&s.created_at)
}

fn encode_booking(e: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    e.encode_field(&b.id.to_string())?;
    e.encode_field(&b.service_id.to_string())?;
    e.encode_field(&b.staff_id.map(|s| s.to_string()))?;
    e.encode_field(&b.customer_name)?;
    e.encode_field(&b.customer_email)?;
    e.encode_field(&b.span.start)?;
    e.encode_field(&b.span.end)?;
    e.encode_field(&b.status.as_str())?;
    e.encode_field(&b.notes)?;
    e.encode_field(&b.created_at)
}

fn encode_conflict(e: &mut DataRowEncoder, hit: &Option<ulid::Ulid>) -> PgWireResult<()> {
    e.encode_field(&hit.is_some())?;
    e.encode_field(&hit.map(|id| id.to_string()))
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for BookdeskHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BookdeskQueryParser;

#[async_trait]
impl QueryParser for BookdeskQueryParser {
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
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BookdeskHandler {
    type Statement = String;
    type QueryParser = BookdeskQueryParser;

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
        Ok(DescribeStatementResponse::new(
            param_types,
            statement_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
    }
}

/// A statement split around its `$N` placeholders.
enum Piece<'a> {
    Text(&'a str),
    Param(usize),
}

/// Split `sql` at every `$N` that sits outside single-quoted literals and
/// double-quoted identifiers.
fn split_placeholders(sql: &str) -> Vec<Piece<'_>> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut quote: Option<u8> = None;
    let mut text_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves the state right.
            Some(q) => {
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                if let Ok(n @ 1..) = sql[i + 1..j].parse::<usize>() {
                    pieces.push(Piece::Text(&sql[text_start..i]));
                    pieces.push(Piece::Param(n));
                    text_start = j;
                }
                i = j.max(i + 1);
            }
            None => i += 1,
        }
    }
    pieces.push(Piece::Text(&sql[text_start..]));
    pieces
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    split_placeholders(sql)
        .into_iter()
        .filter_map(|p| match p {
            Piece::Param(n) => Some(n),
            Piece::Text(_) => None,
        })
        .max()
        .unwrap_or(0)
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Replace `$1, $2, ...` with the bound text-format values, quoted as SQL
/// string literals. One left-to-right pass: bound values are never scanned
/// again. A placeholder with no bound value is left as is.
fn bind_params(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut result = String::with_capacity(sql.len());
    for piece in split_placeholders(sql) {
        match piece {
            Piece::Text(text) => result.push_str(text),
            Piece::Param(n) => match params.get(n - 1) {
                Some(Some(bytes)) => {
                    let text = String::from_utf8_lossy(bytes);
                    result.push('\'');
                    result.push_str(&text.replace('\'', "''"));
                    result.push('\'');
                }
                Some(None) => result.push_str("NULL"),
                None => {
                    result.push('$');
                    result.push_str(&n.to_string());
                }
            },
        }
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BookdeskFactory {
    handler: Arc<BookdeskHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<AdminCredentials, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl BookdeskFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, credentials: AdminCredentials) -> Self {
        Self {
            handler: Arc::new(BookdeskHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                credentials,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BookdeskFactory {
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
    credentials: AdminCredentials,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = BookdeskFactory::new(tenant_manager, credentials);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine error.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) => "23P01",
        EngineError::AlreadyExists(_) | EngineError::DuplicateEmail(_) => "23505",
        EngineError::InUse { .. } => "23503",
        EngineError::NotFound(_) => "P0002",
        EngineError::InvalidSpan { .. } | EngineError::Invalid(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(..) => "42703",
        _ => "42601",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}
