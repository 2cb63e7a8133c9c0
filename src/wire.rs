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

use crate::auth::SlotdAuthSource;
use crate::engine::Engine;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;
use crate::timeutil;

pub struct SlotdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotdQueryParser>,
}

impl SlotdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotdQueryParser),
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
        let result = self.dispatch(engine, cmd).await;
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn dispatch(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertExpert {
                id,
                name,
                domain,
                hourly_rate,
                day_start,
                day_end,
                workdays,
                base_rating,
            } => {
                let day_start = timeutil::to_minutes(&day_start).map_err(engine_err)?;
                let day_end = timeutil::to_minutes(&day_end).map_err(engine_err)?;
                engine
                    .create_expert(
                        id,
                        name,
                        domain,
                        hourly_rate,
                        day_start,
                        day_end,
                        workdays,
                        base_rating,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertOverride {
                id,
                expert_id,
                date,
                workday,
                day_start,
                day_end,
            } => {
                let day_start = day_start
                    .as_deref()
                    .map(timeutil::to_minutes)
                    .transpose()
                    .map_err(engine_err)?;
                let day_end = day_end
                    .as_deref()
                    .map(timeutil::to_minutes)
                    .transpose()
                    .map_err(engine_err)?;
                engine
                    .set_override(id, expert_id, date, workday, day_start, day_end)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteOverride { id } => {
                engine.remove_override(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertWindow {
                id,
                expert_id,
                date,
                start_min,
                end_min,
            } => {
                engine
                    .add_window(id, expert_id, date, start_min, end_min)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteWindow { id } => {
                engine.remove_window(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertPurchase {
                id,
                user_id,
                expert_id,
                package_hours,
            } => {
                engine
                    .create_purchase(id, user_id, expert_id, package_hours)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertSessions {
                purchase_id,
                user_id,
                date,
                slots,
            } => {
                let receipt = engine
                    .book_sessions(purchase_id, user_id, date, &slots)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("INSERT").with_rows(receipt.session_ids.len()),
                )])
            }
            Command::CancelSession {
                id,
                by_user,
                reason,
            } => {
                engine
                    .cancel_session(id, by_user, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertFeedback {
                id,
                purchase_id,
                user_id,
                rating,
                text,
            } => {
                engine
                    .submit_feedback(id, purchase_id, user_id, rating, text)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertPayout {
                id,
                expert_id,
                amount,
                note,
            } => {
                engine
                    .record_payout(id, expert_id, amount, note)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertClientPayment {
                id,
                user_id,
                amount,
                note,
            } => {
                engine
                    .record_client_payment(id, user_id, amount, note)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectSlots { expert_id, date } => {
                let slots = engine
                    .slots_for_date(expert_id, date)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(slots_schema());
                let eid_str = expert_id.to_string();
                let date_str = date.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&eid_str)?;
                        encoder.encode_field(&date_str)?;
                        encoder.encode_field(&slot.start_min)?;
                        encoder.encode_field(&slot.end_min)?;
                        encoder.encode_field(&timeutil::to_hhmm(slot.start_min))?;
                        encoder.encode_field(&timeutil::to_hhmm(slot.end_min))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectExperts => {
                let experts = engine.list_experts().await;
                let schema = Arc::new(experts_schema());
                let rows: Vec<PgWireResult<_>> = experts
                    .into_iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.id.to_string())?;
                        encoder.encode_field(&e.name)?;
                        encoder.encode_field(&e.domain.as_str())?;
                        encoder.encode_field(&e.hourly_rate)?;
                        encoder.encode_field(&e.day_start)?;
                        encoder.encode_field(&e.day_end)?;
                        encoder.encode_field(&e.rating)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSessions {
                purchase_id,
                user_id,
            } => {
                let sessions = if let Some(pid) = purchase_id {
                    engine
                        .get_sessions_by_purchase(pid)
                        .await
                        .map_err(engine_err)?
                } else if let Some(uid) = user_id {
                    engine.get_sessions_by_user(uid).await
                } else {
                    vec![]
                };
                let schema = Arc::new(sessions_schema());
                let rows: Vec<PgWireResult<_>> = sessions
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.expert_id.to_string())?;
                        encoder.encode_field(&s.purchase_id.to_string())?;
                        encoder.encode_field(&s.user_id.to_string())?;
                        encoder.encode_field(&s.date.to_string())?;
                        encoder.encode_field(&s.start_min)?;
                        encoder.encode_field(&s.end_min)?;
                        encoder.encode_field(&s.status.as_str())?;
                        encoder.encode_field(&s.link)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectPurchases { user_id } => {
                let purchases = engine.get_purchases_by_user(user_id).await;
                let schema = Arc::new(purchases_schema());
                let rows: Vec<PgWireResult<_>> = purchases
                    .into_iter()
                    .map(|p| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&p.id.to_string())?;
                        encoder.encode_field(&p.user_id.to_string())?;
                        encoder.encode_field(&p.expert_id.to_string())?;
                        encoder.encode_field(&p.package_minutes)?;
                        encoder.encode_field(&p.minutes_remaining)?;
                        encoder.encode_field(&p.amount)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectEarnings => {
                let earnings = engine.earnings().await;
                let schema = Arc::new(earnings_schema());
                let rows: Vec<PgWireResult<_>> = earnings
                    .into_iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.expert_id.to_string())?;
                        encoder.encode_field(&e.earned)?;
                        encoder.encode_field(&e.paid)?;
                        encoder.encode_field(&e.due)?;
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

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int4(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT4, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        varchar("expert_id"),
        varchar("date"),
        int4("start_min"),
        int4("end_min"),
        varchar("start"),
        varchar("end"),
    ]
}

fn experts_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("name"),
        varchar("domain"),
        int8("hourly_rate"),
        int4("day_start"),
        int4("day_end"),
        FieldInfo::new("rating".into(), None, None, Type::FLOAT8, FieldFormat::Text),
    ]
}

fn sessions_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("expert_id"),
        varchar("purchase_id"),
        varchar("user_id"),
        varchar("date"),
        int4("start_min"),
        int4("end_min"),
        varchar("status"),
        varchar("link"),
    ]
}

fn purchases_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("user_id"),
        varchar("expert_id"),
        int8("package_minutes"),
        int8("minutes_remaining"),
        int8("amount"),
    ]
}

fn earnings_schema() -> Vec<FieldInfo> {
    vec![
        varchar("expert_id"),
        int8("earned"),
        int8("paid"),
        int8("due"),
    ]
}

/// Result schema for SELECTs, guessed from the statement text. Needed for
/// Describe before the query runs.
fn select_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("SLOTS") {
        slots_schema()
    } else if upper.contains("EXPERTS") {
        experts_schema()
    } else if upper.contains("SESSIONS") {
        sessions_schema()
    } else if upper.contains("PURCHASES") {
        purchases_schema()
    } else if upper.contains("EARNINGS") {
        earnings_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
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
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
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
        Ok(select_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

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
            select_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(select_schema(
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

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
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

/// Serve one client socket to completion.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), std::io::Error> {
    let factory = SlotdFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
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
