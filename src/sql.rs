use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{CourseFields, ReservationFilter, ReservationFields, RoomFields, UserFields};
use crate::model::*;

/// The four tables clients can write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Users,
    Courses,
    Rooms,
    Reservations,
}

impl Table {
    fn from_name(name: &str) -> Option<Table> {
        match name {
            "usuarios" => Some(Table::Users),
            "disciplinas" => Some(Table::Courses),
            "salas" => Some(Table::Rooms),
            "reservas" => Some(Table::Reservations),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Table::Users => "usuarios",
            Table::Courses => "disciplinas",
            Table::Rooms => "salas",
            Table::Reservations => "reservas",
        }
    }
}

/// Parsed command from SQL input. Every `UPDATE` is a partial update.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser(UserFields),
    UpdateUser { id: Ulid, fields: UserFields },
    DeleteUser { id: Ulid },
    InsertCourse(CourseFields),
    UpdateCourse { id: Ulid, fields: CourseFields },
    DeleteCourse { id: Ulid },
    InsertRoom(RoomFields),
    UpdateRoom { id: Ulid, fields: RoomFields },
    DeleteRoom { id: Ulid },
    InsertReservation(ReservationFields),
    UpdateReservation { id: Ulid, fields: ReservationFields },
    DeleteReservation { id: Ulid },
    SelectUsers { id: Option<Ulid> },
    SelectCourses {
        id: Option<Ulid>,
        professor: Option<Ulid>,
        /// Institutional id of the responsible professor.
        ni: Option<u32>,
    },
    SelectRooms { id: Option<Ulid>, professor: Option<Ulid> },
    SelectReservations { id: Option<Ulid>, filter: ReservationFilter },
    SelectOwnRooms,
    SelectOwnCourses,
    SelectOwnReservations,
    SelectPeriods,
}

impl Command {
    /// The table a command reads or writes, for views the table it is a view of.
    pub fn table(&self) -> Option<Table> {
        match self {
            Command::InsertUser(_)
            | Command::UpdateUser { .. }
            | Command::DeleteUser { .. }
            | Command::SelectUsers { .. } => Some(Table::Users),
            Command::InsertCourse(_)
            | Command::UpdateCourse { .. }
            | Command::DeleteCourse { .. }
            | Command::SelectCourses { .. }
            | Command::SelectOwnCourses => Some(Table::Courses),
            Command::InsertRoom(_)
            | Command::UpdateRoom { .. }
            | Command::DeleteRoom { .. }
            | Command::SelectRooms { .. }
            | Command::SelectOwnRooms => Some(Table::Rooms),
            Command::InsertReservation(_)
            | Command::UpdateReservation { .. }
            | Command::DeleteReservation { .. }
            | Command::SelectReservations { .. }
            | Command::SelectOwnReservations => Some(Table::Reservations),
            Command::SelectPeriods => None,
        }
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// What a statement's result rows look like, decided from the relation it
/// names alone. Used to describe prepared statements before parameters are
/// bound. `None` for statements that return no rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Table(Table),
    Periods,
}

pub fn result_shape(sql: &str) -> Option<ResultShape> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let name = match stmts.first()? {
        Statement::Insert(insert) => insert_table_name(insert).ok()?,
        Statement::Update { table, .. } => table_factor_name(&table.relation).ok()?,
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(s) => table_factor_name(&s.from.first()?.relation).ok()?,
            _ => return None,
        },
        _ => return None,
    };
    match name.as_str() {
        "minhas_salas" => Some(ResultShape::Table(Table::Rooms)),
        "minhas_disciplinas" => Some(ResultShape::Table(Table::Courses)),
        "minhas_reservas" => Some(ResultShape::Table(Table::Reservations)),
        "periodos" => Some(ResultShape::Periods),
        other => Table::from_name(other).map(ResultShape::Table),
    }
}

fn known_table(name: String) -> Result<Table, SqlError> {
    Table::from_name(&name).ok_or(SqlError::UnknownTable(name))
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = known_table(insert_table_name(insert)?)?;
    if insert.columns.is_empty() {
        return Err(SqlError::Parse("INSERT needs an explicit column list".into()));
    }
    let values = extract_insert_row(insert)?;
    if values.len() != insert.columns.len() {
        return Err(SqlError::WrongArity(table.name(), insert.columns.len(), values.len()));
    }
    let pairs = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .zip(values.iter());

    Ok(match table {
        Table::Users => {
            let mut fields = UserFields::default();
            for (column, value) in pairs {
                assign_user(&mut fields, &column, value)?;
            }
            Command::InsertUser(fields)
        }
        Table::Courses => {
            let mut fields = CourseFields::default();
            for (column, value) in pairs {
                assign_course(&mut fields, &column, value)?;
            }
            Command::InsertCourse(fields)
        }
        Table::Rooms => {
            let mut fields = RoomFields::default();
            for (column, value) in pairs {
                assign_room(&mut fields, &column, value)?;
            }
            Command::InsertRoom(fields)
        }
        Table::Reservations => {
            let mut fields = ReservationFields::default();
            for (column, value) in pairs {
                assign_reservation(&mut fields, &column, value)?;
            }
            Command::InsertReservation(fields)
        }
    })
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = known_table(table_factor_name(&table.relation)?)?;
    let id = extract_where_id(selection)?;
    let mut pairs = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        pairs.push((column, &a.value));
    }

    Ok(match table {
        Table::Users => {
            let mut fields = UserFields::default();
            for (column, value) in pairs {
                assign_user(&mut fields, &column, value)?;
            }
            Command::UpdateUser { id, fields }
        }
        Table::Courses => {
            let mut fields = CourseFields::default();
            for (column, value) in pairs {
                assign_course(&mut fields, &column, value)?;
            }
            Command::UpdateCourse { id, fields }
        }
        Table::Rooms => {
            let mut fields = RoomFields::default();
            for (column, value) in pairs {
                assign_room(&mut fields, &column, value)?;
            }
            Command::UpdateRoom { id, fields }
        }
        Table::Reservations => {
            let mut fields = ReservationFields::default();
            for (column, value) in pairs {
                assign_reservation(&mut fields, &column, value)?;
            }
            Command::UpdateReservation { id, fields }
        }
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = known_table(delete_table_name(delete)?)?;
    let id = extract_where_id(&delete.selection)?;
    Ok(match table {
        Table::Users => Command::DeleteUser { id },
        Table::Courses => Command::DeleteCourse { id },
        Table::Rooms => Command::DeleteRoom { id },
        Table::Reservations => Command::DeleteReservation { id },
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let name = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_equalities(selection, &mut filters)?;
    }
    let mut id = None;

    match name.as_str() {
        "minhas_salas" => return no_filters(Command::SelectOwnRooms, &filters),
        "minhas_disciplinas" => return no_filters(Command::SelectOwnCourses, &filters),
        "minhas_reservas" => return no_filters(Command::SelectOwnReservations, &filters),
        "periodos" => return no_filters(Command::SelectPeriods, &filters),
        _ => {}
    }

    match known_table(name)? {
        Table::Users => {
            for (column, value) in filters {
                match column.as_str() {
                    "id" => id = Some(parse_ulid(value)?),
                    _ => return Err(SqlError::UnsupportedFilter(column)),
                }
            }
            Ok(Command::SelectUsers { id })
        }
        Table::Courses => {
            let (mut professor, mut ni) = (None, None);
            for (column, value) in filters {
                match column.as_str() {
                    "id" => id = Some(parse_ulid(value)?),
                    "professor" => professor = Some(parse_ulid(value)?),
                    "ni" => ni = Some(parse_u32(value)?),
                    _ => return Err(SqlError::UnsupportedFilter(column)),
                }
            }
            Ok(Command::SelectCourses { id, professor, ni })
        }
        Table::Rooms => {
            let mut professor = None;
            for (column, value) in filters {
                match column.as_str() {
                    "id" => id = Some(parse_ulid(value)?),
                    "professor" => professor = Some(parse_ulid(value)?),
                    _ => return Err(SqlError::UnsupportedFilter(column)),
                }
            }
            Ok(Command::SelectRooms { id, professor })
        }
        Table::Reservations => {
            let mut filter = ReservationFilter::default();
            for (column, value) in filters {
                match column.as_str() {
                    "id" => id = Some(parse_ulid(value)?),
                    "sala" => filter.room = Some(parse_ulid(value)?),
                    "professor" => filter.professor = Some(parse_ulid(value)?),
                    "disciplina" => filter.course = Some(parse_ulid(value)?),
                    "periodo" => {
                        let raw = parse_text(value)?;
                        filter.period =
                            Some(Period::parse(&raw).ok_or(SqlError::BadValue("periodo", raw))?);
                    }
                    _ => return Err(SqlError::UnsupportedFilter(column)),
                }
            }
            Ok(Command::SelectReservations { id, filter })
        }
    }
}

fn no_filters(cmd: Command, filters: &[(String, &Expr)]) -> Result<Command, SqlError> {
    match filters.first() {
        Some((column, _)) => Err(SqlError::UnsupportedFilter(column.clone())),
        None => Ok(cmd),
    }
}

/// Flatten `a = x AND b = y AND ...` into column/value pairs.
fn collect_equalities<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, right));
            Ok(())
        }
        Expr::Nested(inner) => collect_equalities(inner, out),
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

// ── Column mapping ────────────────────────────────────────────

fn assign_user(f: &mut UserFields, column: &str, value: &Expr) -> Result<(), SqlError> {
    match column {
        "id" => f.id = Some(parse_ulid(value)?),
        "username" => f.username = Some(required_text("username", value)?),
        "email" => f.email = Some(optional_text(value)?),
        "tipo" => f.role = Some(required_text("tipo", value)?),
        "ni" => f.ni = Some(required_i64("ni", value)?),
        "first_name" => f.first_name = Some(optional_text(value)?),
        "last_name" => f.last_name = Some(optional_text(value)?),
        "telefone" => f.phone = Some(optional_text(value)?),
        "data_nascimento" => f.birth_date = Some(optional_text(value)?),
        "data_contratacao" => f.hire_date = Some(optional_text(value)?),
        other => return Err(SqlError::UnknownColumn("usuarios", other.to_string())),
    }
    Ok(())
}

fn assign_course(f: &mut CourseFields, column: &str, value: &Expr) -> Result<(), SqlError> {
    match column {
        "id" => f.id = Some(parse_ulid(value)?),
        "nome" => f.name = Some(required_text("nome", value)?),
        "curso" => f.program = Some(required_text("curso", value)?),
        "descricao" => f.description = Some(optional_text(value)?),
        "carga_horaria" => f.workload_hours = Some(required_i64("carga_horaria", value)?),
        "professor" => f.professor = Some(parse_ulid_or_null(value)?),
        other => return Err(SqlError::UnknownColumn("disciplinas", other.to_string())),
    }
    Ok(())
}

fn assign_room(f: &mut RoomFields, column: &str, value: &Expr) -> Result<(), SqlError> {
    match column {
        "id" => f.id = Some(parse_ulid(value)?),
        "nome" => f.name = Some(required_text("nome", value)?),
        "capacidade" => f.capacity = Some(required_i64("capacidade", value)?),
        "professor" => f.professor = Some(required_ulid("professor", value)?),
        "periodo" => f.period = Some(optional_text(value)?),
        other => return Err(SqlError::UnknownColumn("salas", other.to_string())),
    }
    Ok(())
}

fn assign_reservation(f: &mut ReservationFields, column: &str, value: &Expr) -> Result<(), SqlError> {
    match column {
        "id" => f.id = Some(parse_ulid(value)?),
        "data_inicio" => f.start = Some(required_i64("data_inicio", value)?),
        "data_termino" => f.end = Some(required_i64("data_termino", value)?),
        "periodo" => f.period = Some(required_text("periodo", value)?),
        "sala" => f.room = Some(required_ulid("sala", value)?),
        "professor" => f.professor = Some(required_ulid("professor", value)?),
        "disciplina" => f.course = Some(required_ulid("disciplina", value)?),
        other => return Err(SqlError::UnknownColumn("reservas", other.to_string())),
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

/// Single-row `VALUES` only; each statement writes one record.
fn extract_insert_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID '{s}': {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_ulid(expr).map(Some)
    }
}

fn required_ulid(column: &'static str, expr: &Expr) -> Result<Ulid, SqlError> {
    if is_null(expr) {
        return Err(SqlError::NullValue(column));
    }
    parse_ulid(expr)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer '{s}': {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected integer, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn required_i64(column: &'static str, expr: &Expr) -> Result<i64, SqlError> {
    if is_null(expr) {
        return Err(SqlError::NullValue(column));
    }
    parse_i64(expr)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn optional_text(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_text(expr).map(Some)
    }
}

fn required_text(column: &'static str, expr: &Expr) -> Result<String, SqlError> {
    if is_null(expr) {
        return Err(SqlError::NullValue(column));
    }
    parse_text(expr)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    UnsupportedFilter(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    NullValue(&'static str),
    BadValue(&'static str, String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "unknown column {c} in {t}"),
            SqlError::UnsupportedFilter(c) => write!(f, "cannot filter on {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::NullValue(col) => write!(f, "{col} may not be null"),
            SqlError::BadValue(col, v) => write!(f, "invalid value for {col}: {v}"),
        }
    }
}

impl std::error::Error for SqlError {}
