use std::fmt::Debug;
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

use crate::auth::RosterAuthSource;
use crate::engine::Engine;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct RosterHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<RosterQueryParser>,
}

impl RosterHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(RosterQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.dispatch_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(
            observability::QUERIES_TOTAL,
            "command" => label,
            "status" => status,
        )
        .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn dispatch_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertResource { id, name, kind } => {
                engine
                    .create_resource(id, name, kind)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateResource { id, name, kind } => {
                engine
                    .update_resource(id, name, kind)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertEvent {
                id,
                title,
                start,
                end,
                description,
                resource_ids,
            } => {
                engine
                    .schedule_event(id, title, start, end, description, resource_ids)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateEvent {
                id,
                title,
                window,
                description,
            } => {
                engine
                    .update_event(id, title, window, description)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteEvent { id } => {
                engine.delete_event(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertAllocations {
                event_id,
                resource_ids,
            } => {
                let report = engine
                    .add_allocations(event_id, resource_ids)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![allocation_outcome_response(report)])
            }
            Command::DeleteAllocation { id } => {
                engine.remove_allocation(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectResources => {
                let resources = engine.list_resources().await;
                let schema = Arc::new(resources_schema());
                let rows: Vec<PgWireResult<_>> = resources
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&r.kind)?;
                        encoder.encode_field(&(r.allocations as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectEvents => {
                let events = engine.list_events().await;
                let schema = Arc::new(events_schema());
                let rows: Vec<PgWireResult<_>> = events
                    .into_iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.id.to_string())?;
                        encoder.encode_field(&e.title)?;
                        encoder.encode_field(&e.start)?;
                        encoder.encode_field(&e.end)?;
                        encoder.encode_field(&e.description)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAllocations { resource_id } => {
                let allocations = engine.list_allocations(resource_id).await;
                let schema = Arc::new(allocations_schema());
                let rows: Vec<PgWireResult<_>> = allocations
                    .into_iter()
                    .map(|a| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.id.to_string())?;
                        encoder.encode_field(&a.event_id.to_string())?;
                        encoder.encode_field(&a.resource_id.to_string())?;
                        encoder.encode_field(&a.start)?;
                        encoder.encode_field(&a.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectUsage { start, end } => {
                let rows_data = engine
                    .compute_usage(start, end, crate::engine::now_ms())
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(usage_schema());
                let rows: Vec<PgWireResult<_>> = rows_data
                    .into_iter()
                    .map(|u| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&u.resource_id.to_string())?;
                        encoder.encode_field(&u.name)?;
                        encoder.encode_field(&u.kind)?;
                        encoder.encode_field(&u.booked_hours)?;
                        encoder.encode_field(&(u.upcoming as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectConflicts {
                resource_id,
                start,
                end,
                exclude_event,
            } => {
                let entries = engine
                    .find_conflicts(resource_id, start, end, exclude_event)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(conflicts_schema());
                let rows: Vec<PgWireResult<_>> = entries
                    .into_iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.resource_id.to_string())?;
                        encoder.encode_field(&c.resource_name)?;
                        encoder.encode_field(&c.event_id.to_string())?;
                        encoder.encode_field(&c.event_title)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

/// One row per requested resource: the status tells the client whether that
/// resource was allocated, skipped as a duplicate, or blocked by a conflict.
fn allocation_outcome_response(report: AllocationReport) -> Response {
    let schema = Arc::new(allocation_outcome_schema());
    let mut rows: Vec<PgWireResult<_>> = Vec::new();
    for (alloc_id, resource_id) in report.added {
        let mut encoder = DataRowEncoder::new(schema.clone());
        let result = encoder
            .encode_field(&resource_id.to_string())
            .and_then(|_| encoder.encode_field(&"added"))
            .and_then(|_| encoder.encode_field(&alloc_id.to_string()))
            .map(|_| encoder.take_row());
        rows.push(result);
    }
    for entry in report.conflicts {
        let mut encoder = DataRowEncoder::new(schema.clone());
        let detail = format!("busy with '{}' ({})", entry.event_title, entry.event_id);
        let result = encoder
            .encode_field(&entry.resource_id.to_string())
            .and_then(|_| encoder.encode_field(&"conflict"))
            .and_then(|_| encoder.encode_field(&detail))
            .map(|_| encoder.take_row());
        rows.push(result);
    }
    for resource_id in report.duplicates {
        let mut encoder = DataRowEncoder::new(schema.clone());
        let result = encoder
            .encode_field(&resource_id.to_string())
            .and_then(|_| encoder.encode_field(&"duplicate"))
            .and_then(|_| encoder.encode_field(&"already allocated"))
            .map(|_| encoder.take_row());
        rows.push(result);
    }
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("kind", Type::VARCHAR),
        text_field("allocations", Type::INT8),
    ]
}

fn events_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("title", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("description", Type::VARCHAR),
    ]
}

fn allocations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("event_id", Type::VARCHAR),
        text_field("resource_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
    ]
}

fn usage_schema() -> Vec<FieldInfo> {
    vec![
        text_field("resource_id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("kind", Type::VARCHAR),
        text_field("booked_hours", Type::FLOAT8),
        text_field("upcoming", Type::INT8),
    ]
}

fn conflicts_schema() -> Vec<FieldInfo> {
    vec![
        text_field("resource_id", Type::VARCHAR),
        text_field("resource_name", Type::VARCHAR),
        text_field("event_id", Type::VARCHAR),
        text_field("event_title", Type::VARCHAR),
    ]
}

fn allocation_outcome_schema() -> Vec<FieldInfo> {
    vec![
        text_field("resource_id", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("detail", Type::VARCHAR),
    ]
}

/// Result schema for a SQL string, used by describe and the extended protocol.
/// INSERT INTO allocations returns outcome rows, so it has a schema too.
fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("SELECT") {
        if upper.contains("USAGE") {
            return usage_schema();
        }
        if upper.contains("CONFLICTS") {
            return conflicts_schema();
        }
        if upper.contains("ALLOCATIONS") {
            return allocations_schema();
        }
        if upper.contains("EVENTS") {
            return events_schema();
        }
        if upper.contains("RESOURCES") {
            return resources_schema();
        }
    }
    if upper.contains("INSERT") && upper.contains("ALLOCATIONS") {
        return allocation_outcome_schema();
    }
    vec![]
}

#[async_trait]
impl SimpleQueryHandler for RosterHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RosterQueryParser;

#[async_trait]
impl QueryParser for RosterQueryParser {
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
impl ExtendedQueryHandler for RosterHandler {
    type Statement = String;
    type QueryParser = RosterQueryParser;

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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&engine, cmd).await?;
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
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
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

pub struct RosterFactory {
    handler: Arc<RosterHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RosterAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RosterFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = RosterAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RosterHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RosterFactory {
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

/// Drive one client connection through the wire protocol until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls_acceptor: Option<TlsAcceptor>,
) -> Result<(), std::io::Error> {
    let factory = RosterFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls_acceptor, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
