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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
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

use crate::auth::SharedPasswordAuthSource;
use crate::engine::{Actor, ConflictReason, Engine, EngineError, UpdateMode};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, ResultShape, SqlError, Table};
use crate::tenant::TenantManager;

pub struct ReservadHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<ReservadQueryParser>,
}

impl ReservadHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(ReservadQueryParser),
        }
    }

    /// Tenant from the `database` startup parameter, acting user from `user`.
    async fn resolve_session<C: ClientInfo + Sync>(&self, client: &C) -> PgWireResult<(Arc<Engine>, Actor)> {
        let metadata = client.metadata();
        let db = metadata
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let login = metadata.get("user").cloned().unwrap_or_default();
        let engine = self.tenant_manager.get_or_create(&db).await.map_err(|e| {
            user_error("08006", format!("tenant error: {e}"))
        })?;
        let actor = engine.resolve_actor(&login).map_err(engine_err)?;
        Ok((engine, actor))
    }

    async fn run<C: ClientInfo + Sync>(
        &self,
        client: &C,
        query: &str,
        format: &Format,
    ) -> PgWireResult<Response> {
        let (engine, actor) = self.resolve_session(client).await?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        debug!("{label} as {} ({})", actor.id, actor.role.code());

        let start = Instant::now();
        let result = execute_command(&engine, &actor, cmd, format).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result.map_err(engine_err)
    }
}

async fn execute_command(
    engine: &Engine,
    actor: &Actor,
    cmd: Command,
    format: &Format,
) -> Result<Response, EngineError> {
    let users = |rows: Vec<User>| table_response(Table::Users, format, rows, encode_user);
    let courses = |rows: Vec<Course>| table_response(Table::Courses, format, rows, encode_course);
    let rooms = |rows: Vec<Room>| table_response(Table::Rooms, format, rows, encode_room);
    let reservations =
        |rows: Vec<Reservation>| table_response(Table::Reservations, format, rows, encode_reservation);
    let deleted = || Response::Execution(Tag::new("DELETE").with_rows(1));

    Ok(match cmd {
        Command::InsertUser(fields) => users(vec![engine.create_user(actor, fields).await?]),
        Command::UpdateUser { id, fields } => {
            users(vec![engine.update_user(actor, id, fields, UpdateMode::Partial).await?])
        }
        Command::DeleteUser { id } => {
            engine.delete_user(actor, id).await?;
            deleted()
        }
        Command::InsertCourse(fields) => courses(vec![engine.create_course(actor, fields).await?]),
        Command::UpdateCourse { id, fields } => {
            courses(vec![engine.update_course(actor, id, fields, UpdateMode::Partial).await?])
        }
        Command::DeleteCourse { id } => {
            engine.delete_course(actor, id).await?;
            deleted()
        }
        Command::InsertRoom(fields) => rooms(vec![engine.create_room(actor, fields).await?]),
        Command::UpdateRoom { id, fields } => {
            rooms(vec![engine.update_room(actor, id, fields, UpdateMode::Partial).await?])
        }
        Command::DeleteRoom { id } => {
            engine.delete_room(actor, id).await?;
            deleted()
        }
        Command::InsertReservation(fields) => {
            reservations(vec![engine.create_reservation(actor, fields).await?])
        }
        Command::UpdateReservation { id, fields } => reservations(vec![
            engine
                .update_reservation(actor, id, fields, UpdateMode::Partial)
                .await?,
        ]),
        Command::DeleteReservation { id } => {
            engine.delete_reservation(actor, id).await?;
            deleted()
        }
        Command::SelectUsers { id: Some(id) } => users(vec![engine.get_user(actor, id)?]),
        Command::SelectUsers { id: None } => users(engine.list_users(actor)?),
        Command::SelectCourses { id: Some(id), .. } => courses(vec![engine.get_course(actor, id)?]),
        Command::SelectCourses { ni: Some(ni), .. } => {
            courses(engine.courses_by_professor_ni(actor, ni)?)
        }
        Command::SelectCourses { professor, .. } => courses(engine.list_courses(actor, professor)?),
        Command::SelectRooms { id: Some(id), .. } => {
            rooms(vec![engine.get_room_record(actor, id).await?])
        }
        Command::SelectRooms { professor, .. } => rooms(engine.list_rooms(actor, professor).await?),
        Command::SelectReservations { id: Some(id), .. } => {
            reservations(vec![engine.get_reservation(actor, id).await?])
        }
        Command::SelectReservations { filter, .. } => {
            reservations(engine.list_reservations(actor, filter).await?)
        }
        Command::SelectOwnRooms => rooms(engine.own_rooms(actor).await?),
        Command::SelectOwnCourses => courses(engine.own_courses(actor)?),
        Command::SelectOwnReservations => reservations(engine.own_reservations(actor).await?),
        Command::SelectPeriods => {
            let schema = Arc::new(periods_schema(format));
            let rows: Vec<_> = engine
                .periods()
                .iter()
                .map(|p| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&p.code())?;
                    encoder.encode_field(&p.label())?;
                    Ok::<_, PgWireError>(encoder.take_row())
                })
                .collect();
            Response::Query(QueryResponse::new(schema, stream::iter(rows)))
        }
    })
}

// ── Row encoding ─────────────────────────────────────────────────

fn table_response<T>(
    table: Table,
    format: &Format,
    records: Vec<T>,
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(table_schema(table, format));
    let rows: Vec<_> = records
        .iter()
        .map(|record| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, record)?;
            Ok::<_, PgWireError>(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_user(enc: &mut DataRowEncoder, u: &User) -> PgWireResult<()> {
    enc.encode_field(&u.id.to_string())?;
    enc.encode_field(&u.username)?;
    enc.encode_field(&u.email)?;
    enc.encode_field(&u.role.code())?;
    enc.encode_field(&i64::from(u.ni))?;
    enc.encode_field(&u.first_name)?;
    enc.encode_field(&u.last_name)?;
    enc.encode_field(&u.phone)?;
    enc.encode_field(&u.birth_date)?;
    enc.encode_field(&u.hire_date)
}

fn encode_course(enc: &mut DataRowEncoder, c: &Course) -> PgWireResult<()> {
    enc.encode_field(&c.id.to_string())?;
    enc.encode_field(&c.name)?;
    enc.encode_field(&c.program)?;
    enc.encode_field(&c.description)?;
    enc.encode_field(&i64::from(c.workload_hours))?;
    enc.encode_field(&c.professor.map(|p| p.to_string()))
}

fn encode_room(enc: &mut DataRowEncoder, r: &Room) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.name)?;
    enc.encode_field(&i64::from(r.capacity))?;
    enc.encode_field(&r.professor.to_string())?;
    enc.encode_field(&r.period.map(|p| p.code()))
}

fn encode_reservation(enc: &mut DataRowEncoder, r: &Reservation) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.start)?;
    enc.encode_field(&r.end)?;
    enc.encode_field(&r.period.code())?;
    enc.encode_field(&r.room.to_string())?;
    enc.encode_field(&r.professor.to_string())?;
    enc.encode_field(&r.course.to_string())
}

fn columns(format: &Format, cols: &[(&str, Type)]) -> Vec<FieldInfo> {
    cols.iter()
        .enumerate()
        .map(|(idx, (name, ty))| {
            FieldInfo::new(name.to_string(), None, None, ty.clone(), format.format_for(idx))
        })
        .collect()
}

fn table_schema(table: Table, format: &Format) -> Vec<FieldInfo> {
    let text = Type::VARCHAR;
    let int = Type::INT8;
    match table {
        Table::Users => columns(
            format,
            &[
                ("id", text.clone()),
                ("username", text.clone()),
                ("email", text.clone()),
                ("tipo", text.clone()),
                ("ni", int),
                ("first_name", text.clone()),
                ("last_name", text.clone()),
                ("telefone", text.clone()),
                ("data_nascimento", text.clone()),
                ("data_contratacao", text),
            ],
        ),
        Table::Courses => columns(
            format,
            &[
                ("id", text.clone()),
                ("nome", text.clone()),
                ("curso", text.clone()),
                ("descricao", text.clone()),
                ("carga_horaria", int),
                ("professor", text),
            ],
        ),
        Table::Rooms => columns(
            format,
            &[
                ("id", text.clone()),
                ("nome", text.clone()),
                ("capacidade", int),
                ("professor", text.clone()),
                ("periodo", text),
            ],
        ),
        Table::Reservations => columns(
            format,
            &[
                ("id", text.clone()),
                ("data_inicio", int.clone()),
                ("data_termino", int),
                ("periodo", text.clone()),
                ("sala", text.clone()),
                ("professor", text.clone()),
                ("disciplina", text),
            ],
        ),
    }
}

fn periods_schema(format: &Format) -> Vec<FieldInfo> {
    columns(format, &[("codigo", Type::VARCHAR), ("nome", Type::VARCHAR)])
}

fn shape_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    match sql::result_shape(sql) {
        Some(ResultShape::Table(table)) => table_schema(table, format),
        Some(ResultShape::Periods) => periods_schema(format),
        None => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ReservadHandler {
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
pub struct ReservadQueryParser;

#[async_trait]
impl QueryParser for ReservadQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(shape_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ReservadHandler {
    type Statement = String;
    type QueryParser = ReservadQueryParser;

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
            shape_schema(&target.statement, &Format::UnifiedText),
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
        Ok(DescribePortalResponse::new(shape_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Byte ranges and indexes of `$N` placeholders outside quoted literals.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Replace each placeholder with its bound value (text format) in one pass
/// over the statement, so bound text is never scanned again.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ReservadFactory {
    handler: Arc<ReservadHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SharedPasswordAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ReservadFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SharedPasswordAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ReservadHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ReservadFactory {
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
    let factory = Arc::new(ReservadFactory::new(tenant_manager, password));
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

/// SQLSTATE for an engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(..) => "P0002",
        EngineError::AlreadyExists(..) => "23505",
        EngineError::Invalid(_) | EngineError::InvalidInterval => "22023",
        EngineError::Conflict(ConflictReason::RoomReserved { .. }) => "23P01",
        EngineError::Conflict(ConflictReason::ProfessorOwnsRoom { .. }) => "23505",
        EngineError::Forbidden(_) => "42501",
        EngineError::UnknownLogin(_) => "28000",
        EngineError::Unavailable(_) => "55P03",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

/// The message is the JSON field-error body so clients can show each
/// message next to its field.
fn engine_err(e: EngineError) -> PgWireError {
    let message = serde_json::to_string(&e.body()).unwrap_or_else(|_| e.to_string());
    user_error(sqlstate(&e), message)
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(..) => "42703",
        SqlError::NullValue(_) => "23502",
        SqlError::BadValue(..) => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CourseFields;
    use ulid::Ulid;

    #[test]
    fn count_params_takes_highest_index() {
        assert_eq!(count_params("SELECT * FROM salas"), 0);
        assert_eq!(count_params("UPDATE salas SET nome = $2 WHERE id = $1"), 2);
        assert_eq!(count_params("INSERT INTO t (a) VALUES ($10)"), 10);
        assert_eq!(count_params("SELECT '$'"), 0);
        assert_eq!(count_params("SELECT * FROM salas WHERE nome = '$3' AND id = $1"), 1);
    }

    #[test]
    fn bound_values_are_never_rescanned() {
        let sql = "INSERT INTO disciplinas (nome, curso, carga_horaria) VALUES ($1, $2, '60')";
        let bound = bind_params(sql, &[Some("Redes"), Some("Turma $1 d'Avila")]);
        assert_eq!(
            bound,
            "INSERT INTO disciplinas (nome, curso, carga_horaria) VALUES ('Redes', 'Turma $1 d''Avila', '60')"
        );
        assert!(matches!(
            sql::parse_sql(&bound),
            Ok(Command::InsertCourse(CourseFields { program: Some(ref p), .. })) if p == "Turma $1 d'Avila"
        ));
    }

    #[test]
    fn placeholders_bind_by_index() {
        let sql = "UPDATE salas SET nome = $10 WHERE id = $1";
        let mut params: Vec<Option<&str>> = vec![Some("x"); 10];
        params[9] = Some("Lab $2");
        params[0] = None;
        assert_eq!(bind_params(sql, &params), "UPDATE salas SET nome = 'Lab $2' WHERE id = NULL");
        assert_eq!(bind_params("SELECT '$1'", &[Some("x")]), "SELECT '$1'");
    }

    #[test]
    fn conflicts_map_to_distinct_states() {
        let overlap = EngineError::Conflict(ConflictReason::RoomReserved {
            room: Ulid::new(),
            reservation: Ulid::new(),
        });
        let owner = EngineError::Conflict(ConflictReason::ProfessorOwnsRoom {
            professor: Ulid::new(),
            room: Ulid::new(),
        });
        assert_eq!(sqlstate(&overlap), "23P01");
        assert_eq!(sqlstate(&owner), "23505");
        assert_eq!(sqlstate(&EngineError::Unavailable("room")), "55P03");
        assert_eq!(sqlstate(&EngineError::UnknownLogin("x".into())), "28000");
    }

    #[test]
    fn engine_error_body_is_field_json() {
        let e = EngineError::invalid("data_termino", "must be after data_inicio");
        assert_eq!(sqlstate(&e), "22023");
        let body: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&e.body()).unwrap()).unwrap();
        assert_eq!(body["data_termino"][0], "must be after data_inicio");
        assert!(matches!(engine_err(e), PgWireError::UserError(_)));
    }

    #[test]
    fn schemas_follow_table_columns() {
        let schema = table_schema(Table::Reservations, &Format::UnifiedText);
        let names: Vec<&str> = schema.iter().map(|f| f.name()).collect();
        assert_eq!(
            names,
            ["id", "data_inicio", "data_termino", "periodo", "sala", "professor", "disciplina"]
        );
        assert!(shape_schema("DELETE FROM salas WHERE id = $1", &Format::UnifiedText).is_empty());
        assert_eq!(shape_schema("SELECT * FROM periodos", &Format::UnifiedText).len(), 2);
    }
}
