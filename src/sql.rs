use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Users,
    Services,
    Staff,
    Bookings,
    /// Virtual table answering "would this range conflict?".
    Conflicts,
}

impl Table {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "users" => Some(Table::Users),
            "services" => Some(Table::Services),
            "staff" => Some(Table::Staff),
            "bookings" => Some(Table::Bookings),
            "conflicts" => Some(Table::Conflicts),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Services => "services",
            Table::Staff => "staff",
            Table::Bookings => "bookings",
            Table::Conflicts => "conflicts",
        }
    }

    /// Column order for INSERT without a column list.
    fn insert_columns(&self) -> &'static [&'static str] {
        match self {
            Table::Users => &["id", "email", "name", "role"],
            Table::Services => &["id", "name", "duration_ms", "price_cents", "description"],
            Table::Staff => &["id", "name", "email", "phone"],
            Table::Bookings => &[
                "id",
                "service_id",
                "staff_id",
                "customer_name",
                "customer_email",
                "start",
                "end",
                "status",
                "notes",
            ],
            Table::Conflicts => &[],
        }
    }
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser(NewUser),
    UpdateUser { id: Ulid, patch: UserPatch },
    DeleteUser { id: Ulid },
    InsertService(NewService),
    UpdateService { id: Ulid, patch: ServicePatch },
    DeleteService { id: Ulid },
    InsertStaff(NewStaff),
    UpdateStaff { id: Ulid, patch: StaffPatch },
    DeleteStaff { id: Ulid },
    InsertBooking(BookingDraft),
    BatchInsertBookings(Vec<BookingDraft>),
    UpdateBooking { id: Ulid, patch: BookingPatch },
    DeleteBooking { id: Ulid },
    SelectUsers { id: Option<Ulid> },
    SelectServices { id: Option<Ulid> },
    SelectStaff { id: Option<Ulid> },
    SelectBookings(BookingFilter),
    SelectConflict {
        start: Ms,
        end: Ms,
        exclude_id: Option<Ulid>,
    },
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

/// The table a SELECT reads from, without binding any values. Used to
/// describe result columns of prepared statements that still hold `$n`
/// placeholders.
pub fn select_table(sql: &str) -> Option<Table> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor(&select.from.first()?.relation).ok()
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name.
struct Row<'a> {
    table: Table,
    values: HashMap<&'a str, &'a Expr>,
}

impl<'a> Row<'a> {
    fn bind(table: Table, columns: &'a [String], values: &'a [Expr]) -> Result<Self, SqlError> {
        let defaults = table.insert_columns();
        let names: Vec<&'a str> = if columns.is_empty() {
            if values.len() > defaults.len() {
                return Err(SqlError::WrongArity(table.name(), defaults.len(), values.len()));
            }
            defaults[..values.len()].to_vec()
        } else {
            if columns.len() != values.len() {
                return Err(SqlError::WrongArity(table.name(), columns.len(), values.len()));
            }
            for c in columns {
                if !defaults.contains(&c.as_str()) {
                    return Err(SqlError::UnknownColumn(table.name(), c.clone()));
                }
            }
            columns.iter().map(String::as_str).collect()
        };
        Ok(Self {
            table,
            values: names.into_iter().zip(values.iter()).collect(),
        })
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.values
            .get(column)
            .copied()
            .ok_or(SqlError::MissingValue(self.table.name(), column))
    }

    fn optional(&self, column: &str) -> Option<&'a Expr> {
        self.values.get(column).copied()
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table(insert)?;
    if table == Table::Conflicts {
        return Err(SqlError::Unsupported("INSERT into conflicts".into()));
    }
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();
    let rows = extract_insert_rows(insert)?;

    if table == Table::Bookings {
        let mut drafts = Vec::with_capacity(rows.len());
        for values in rows {
            drafts.push(booking_draft(&Row::bind(table, &columns, values)?)?);
        }
        return Ok(if drafts.len() == 1 {
            Command::InsertBooking(drafts.remove(0))
        } else {
            Command::BatchInsertBookings(drafts)
        });
    }

    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!(
            "multi-row INSERT into {}",
            table.name()
        )));
    }
    let row = Row::bind(table, &columns, &rows[0])?;
    match table {
        Table::Users => Ok(Command::InsertUser(NewUser {
            id: parse_ulid(row.required("id")?)?,
            email: parse_string(row.required("email")?)?,
            name: parse_string(row.required("name")?)?,
            role: match row.optional("role") {
                Some(e) => parse_role(e)?,
                None => Role::Staff,
            },
        })),
        Table::Services => Ok(Command::InsertService(NewService {
            id: parse_ulid(row.required("id")?)?,
            name: parse_string(row.required("name")?)?,
            duration_ms: parse_i64(row.required("duration_ms")?)?,
            price_cents: match row.optional("price_cents") {
                Some(e) => parse_i64(e)?,
                None => 0,
            },
            description: optional_string(row.optional("description"))?,
        })),
        Table::Staff => Ok(Command::InsertStaff(NewStaff {
            id: parse_ulid(row.required("id")?)?,
            name: parse_string(row.required("name")?)?,
            email: optional_string(row.optional("email"))?,
            phone: optional_string(row.optional("phone"))?,
        })),
        Table::Bookings | Table::Conflicts => unreachable!("handled above"),
    }
}

fn booking_draft(row: &Row<'_>) -> Result<BookingDraft, SqlError> {
    Ok(BookingDraft {
        id: parse_ulid(row.required("id")?)?,
        service_id: parse_ulid(row.required("service_id")?)?,
        staff_id: match row.optional("staff_id") {
            Some(e) => parse_ulid_or_null(e)?,
            None => None,
        },
        customer_name: parse_string(row.required("customer_name")?)?,
        customer_email: optional_string(row.optional("customer_email"))?,
        start: parse_timestamp(row.required("start")?)?,
        end: parse_timestamp(row.required("end")?)?,
        status: match row.optional("status") {
            Some(e) => parse_status(e)?,
            None => BookingStatus::default(),
        },
        notes: optional_string(row.optional("notes"))?,
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor(&table.relation)?;
    if assignments.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }
    let id = extract_where_id(selection)?;

    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        if column == "id" {
            return Err(SqlError::Unsupported("changing id".into()));
        }
        set.push((column, &a.value));
    }

    let unknown = |c: &str| SqlError::UnknownColumn(table.name(), c.to_string());
    match table {
        Table::Users => {
            let mut patch = UserPatch::default();
            for (column, value) in set {
                match column.as_str() {
                    "email" => patch.email = Some(parse_string(value)?),
                    "name" => patch.name = Some(parse_string(value)?),
                    "role" => patch.role = Some(parse_role(value)?),
                    other => return Err(unknown(other)),
                }
            }
            Ok(Command::UpdateUser { id, patch })
        }
        Table::Services => {
            let mut patch = ServicePatch::default();
            for (column, value) in set {
                match column.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "description" => patch.description = Some(parse_string_or_null(value)?),
                    "duration_ms" => patch.duration_ms = Some(parse_i64(value)?),
                    "price_cents" => patch.price_cents = Some(parse_i64(value)?),
                    other => return Err(unknown(other)),
                }
            }
            Ok(Command::UpdateService { id, patch })
        }
        Table::Staff => {
            let mut patch = StaffPatch::default();
            for (column, value) in set {
                match column.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "email" => patch.email = Some(parse_string_or_null(value)?),
                    "phone" => patch.phone = Some(parse_string_or_null(value)?),
                    other => return Err(unknown(other)),
                }
            }
            Ok(Command::UpdateStaff { id, patch })
        }
        Table::Bookings => {
            let mut patch = BookingPatch::default();
            for (column, value) in set {
                match column.as_str() {
                    "service_id" => patch.service_id = Some(parse_ulid(value)?),
                    "staff_id" => patch.staff_id = Some(parse_ulid_or_null(value)?),
                    "customer_name" => patch.customer_name = Some(parse_string(value)?),
                    "customer_email" => patch.customer_email = Some(parse_string_or_null(value)?),
                    "start" => patch.start = Some(parse_timestamp(value)?),
                    "end" => patch.end = Some(parse_timestamp(value)?),
                    "status" => patch.status = Some(parse_status(value)?),
                    "notes" => patch.notes = Some(parse_string_or_null(value)?),
                    other => return Err(unknown(other)),
                }
            }
            Ok(Command::UpdateBooking { id, patch })
        }
        Table::Conflicts => Err(SqlError::Unsupported("UPDATE conflicts".into())),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let first = tables
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    let table = table_factor(&first.relation)?;
    let id = extract_where_id(&delete.selection)?;

    match table {
        Table::Users => Ok(Command::DeleteUser { id }),
        Table::Services => Ok(Command::DeleteService { id }),
        Table::Staff => Ok(Command::DeleteStaff { id }),
        Table::Bookings => Ok(Command::DeleteBooking { id }),
        Table::Conflicts => Err(SqlError::Unsupported("DELETE FROM conflicts".into())),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// A comparison pulled out of a WHERE clause: `column op value`.
struct Predicate<'a> {
    column: String,
    op: &'a ast::BinaryOperator,
    value: &'a Expr,
}

/// Flatten an AND-tree of `column op value` comparisons.
fn collect_predicates<'a>(expr: &'a Expr, out: &mut Vec<Predicate<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            out.push(Predicate {
                column,
                op,
                value: right,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("predicate {other}"))),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor(&from.relation)?;

    let mut predicates = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut predicates)?;
    }

    use ast::BinaryOperator as Op;
    let unsupported = |p: &Predicate<'_>| {
        SqlError::Unsupported(format!("filter {} {} on {}", p.column, p.op, table.name()))
    };

    match table {
        Table::Users | Table::Services | Table::Staff => {
            let mut id = None;
            for p in &predicates {
                match (p.column.as_str(), p.op) {
                    ("id", Op::Eq) => id = Some(parse_ulid(p.value)?),
                    _ => return Err(unsupported(p)),
                }
            }
            Ok(match table {
                Table::Users => Command::SelectUsers { id },
                Table::Services => Command::SelectServices { id },
                _ => Command::SelectStaff { id },
            })
        }
        Table::Bookings => {
            let mut filter = BookingFilter::default();
            for p in &predicates {
                match (p.column.as_str(), p.op) {
                    ("id", Op::Eq) => filter.id = Some(parse_ulid(p.value)?),
                    ("staff_id", Op::Eq) => filter.staff_id = Some(parse_ulid(p.value)?),
                    ("service_id", Op::Eq) => filter.service_id = Some(parse_ulid(p.value)?),
                    ("status", Op::Eq) => filter.status = Some(parse_status(p.value)?),
                    // `"end" > a AND start < b` is the overlap test against [a, b).
                    ("end", Op::Gt) => filter.from = Some(parse_timestamp(p.value)?),
                    ("start", Op::Lt) => filter.to = Some(parse_timestamp(p.value)?),
                    _ => return Err(unsupported(p)),
                }
            }
            Ok(Command::SelectBookings(filter))
        }
        Table::Conflicts => {
            let (mut start, mut end, mut exclude_id) = (None, None, None);
            for p in &predicates {
                match (p.column.as_str(), p.op) {
                    ("start", Op::Eq) => start = Some(parse_timestamp(p.value)?),
                    ("end", Op::Eq) => end = Some(parse_timestamp(p.value)?),
                    ("exclude_id", Op::Eq) => exclude_id = parse_ulid_or_null(p.value)?,
                    _ => return Err(unsupported(p)),
                }
            }
            Ok(Command::SelectConflict {
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
                exclude_id,
            })
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn lookup_table(name: Option<String>) -> Result<Table, SqlError> {
    let name = name.ok_or_else(|| SqlError::Parse("empty table name".into()))?;
    Table::parse(&name).ok_or(SqlError::UnknownTable(name))
}

fn insert_table(insert: &ast::Insert) -> Result<Table, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => lookup_table(object_name_last(name)),
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor(tf: &TableFactor) -> Result<Table, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => lookup_table(object_name_last(name)),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => {
            Err(SqlError::Parse("empty VALUES".into()))
        }
        SetExpr::Values(values) => Ok(&values.rows),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let sel = match sel {
        Expr::Nested(inner) => inner.as_ref(),
        other => other,
    };
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
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_string(expr).map(Some)
    }
}

fn optional_string(expr: Option<&Expr>) -> Result<Option<String>, SqlError> {
    expr.map(parse_string_or_null).transpose().map(Option::flatten)
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
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Unix milliseconds, an RFC 3339 string, or a naive ISO date-time taken as UTC.
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    let Some(Value::SingleQuotedString(s)) = extract_value(expr) else {
        return parse_i64(expr);
    };
    parse_timestamp_str(s)
}

pub(crate) fn parse_timestamp_str(s: &str) -> Result<Ms, SqlError> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    NAIVE_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .map(|dt| dt.and_utc().timestamp_millis())
        .ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s:?}")))
}

fn parse_role(expr: &Expr) -> Result<Role, SqlError> {
    let s = parse_string(expr)?;
    Role::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad role: {s:?}")))
}

fn parse_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    let s = parse_string(expr)?;
    BookingStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad status: {s:?}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingValue(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingValue(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";
    /// 2024-01-01T09:00:00Z
    const NINE: Ms = 1_704_099_600_000;
    const H: Ms = 3_600_000;

    #[test]
    fn insert_user_positional() {
        let sql = format!("INSERT INTO users VALUES ('{ID}', 'ada@example.com', 'Ada', 'admin')");
        match parse_sql(&sql).unwrap() {
            Command::InsertUser(u) => {
                assert_eq!(u.id.to_string(), ID);
                assert_eq!(u.email, "ada@example.com");
                assert_eq!(u.name, "Ada");
                assert_eq!(u.role, Role::Admin);
            }
            cmd => panic!("expected InsertUser, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_user_role_defaults_to_staff() {
        let sql = format!("INSERT INTO users (name, id, email) VALUES ('Bo', '{ID}', 'bo@example.com')");
        match parse_sql(&sql).unwrap() {
            Command::InsertUser(u) => {
                assert_eq!(u.name, "Bo");
                assert_eq!(u.role, Role::Staff);
            }
            cmd => panic!("expected InsertUser, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_service_with_columns() {
        let sql = format!(
            "INSERT INTO services (id, name, duration_ms, price_cents) VALUES ('{ID}', 'Massage', 3600000, 8000)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertService(s) => {
                assert_eq!(s.name, "Massage");
                assert_eq!(s.duration_ms, 3_600_000);
                assert_eq!(s.price_cents, 8000);
                assert_eq!(s.description, None);
            }
            cmd => panic!("expected InsertService, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_staff_with_null_email() {
        let sql = format!("INSERT INTO staff (id, name, email, phone) VALUES ('{ID}', 'Kim', NULL, '555-0100')");
        match parse_sql(&sql).unwrap() {
            Command::InsertStaff(s) => {
                assert_eq!(s.email, None);
                assert_eq!(s.phone.as_deref(), Some("555-0100"));
            }
            cmd => panic!("expected InsertStaff, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_booking_with_iso_timestamps() {
        let sql = format!(
            r#"INSERT INTO bookings (id, service_id, customer_name, start, "end") VALUES ('{ID}', '{OTHER}', 'Ada', '2024-01-01T09:00', '2024-01-01T10:00:00Z')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking(d) => {
                assert_eq!(d.service_id.to_string(), OTHER);
                assert_eq!(d.staff_id, None);
                assert_eq!(d.start, NINE);
                assert_eq!(d.end, NINE + H);
                assert_eq!(d.status, BookingStatus::Pending);
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_booking_positional_ms() {
        let sql = format!(
            "INSERT INTO bookings VALUES ('{ID}', '{OTHER}', '{OTHER}', 'Ada', 'ada@example.com', 1000, 2000, 'confirmed', 'window seat')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking(d) => {
                assert_eq!(d.staff_id.map(|s| s.to_string()).as_deref(), Some(OTHER));
                assert_eq!((d.start, d.end), (1000, 2000));
                assert_eq!(d.status, BookingStatus::Confirmed);
                assert_eq!(d.notes.as_deref(), Some("window seat"));
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn multi_row_booking_insert_is_a_batch() {
        let sql = format!(
            r#"INSERT INTO bookings (id, service_id, customer_name, start, "end") VALUES ('{ID}', '{OTHER}', 'A', 1000, 2000), ('{OTHER}', '{OTHER}', 'B', 3000, 4000)"#
        );
        match parse_sql(&sql).unwrap() {
            Command::BatchInsertBookings(drafts) => {
                assert_eq!(drafts.len(), 2);
                assert_eq!((drafts[1].start, drafts[1].end), (3000, 4000));
            }
            cmd => panic!("expected BatchInsertBookings, got {cmd:?}"),
        }
    }

    #[test]
    fn multi_row_insert_into_users_rejected() {
        let sql = format!(
            "INSERT INTO users VALUES ('{ID}', 'a@x.io', 'A', 'staff'), ('{OTHER}', 'b@x.io', 'B', 'staff')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn insert_missing_required_column() {
        let sql = format!("INSERT INTO services (id, name) VALUES ('{ID}', 'Nails')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingValue("services", "duration_ms"))
        ));
    }

    #[test]
    fn insert_unknown_column() {
        let sql = format!("INSERT INTO staff (id, name, avatar) VALUES ('{ID}', 'Kim', 'x.png')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("staff", _))));
    }

    #[test]
    fn insert_arity_mismatch() {
        let sql = format!("INSERT INTO staff (id, name) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("staff", 2, 1))));
    }

    #[test]
    fn update_booking_times_and_status() {
        let sql = format!(
            r#"UPDATE bookings SET start = '2024-01-01T09:15', "end" = '2024-01-01T10:15', status = 'confirmed' WHERE id = '{ID}'"#
        );
        match parse_sql(&sql).unwrap() {
            Command::UpdateBooking { id, patch } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(patch.start, Some(NINE + 15 * 60_000));
                assert_eq!(patch.end, Some(NINE + H + 15 * 60_000));
                assert_eq!(patch.status, Some(BookingStatus::Confirmed));
                assert_eq!(patch.notes, None);
            }
            cmd => panic!("expected UpdateBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn update_sets_null() {
        let sql = format!("UPDATE bookings SET staff_id = NULL, notes = NULL WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateBooking { patch, .. } => {
                assert_eq!(patch.staff_id, Some(None));
                assert_eq!(patch.notes, Some(None));
            }
            cmd => panic!("expected UpdateBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn update_service_price() {
        let sql = format!("UPDATE services SET price_cents = 1500 WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateService { patch, .. } => assert_eq!(patch.price_cents, Some(1500)),
            cmd => panic!("expected UpdateService, got {cmd:?}"),
        }
    }

    #[test]
    fn update_requires_where_id() {
        assert!(matches!(
            parse_sql("UPDATE users SET name = 'x'"),
            Err(SqlError::MissingFilter("id"))
        ));
        let sql = format!("UPDATE users SET id = '{OTHER}' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn delete_each_table() {
        let delete = |table: &str| parse_sql(&format!("DELETE FROM {table} WHERE id = '{ID}'")).unwrap();
        assert!(matches!(delete("users"), Command::DeleteUser { .. }));
        assert!(matches!(delete("services"), Command::DeleteService { .. }));
        assert!(matches!(delete("staff"), Command::DeleteStaff { .. }));
        assert!(matches!(delete("bookings"), Command::DeleteBooking { .. }));
        assert!(matches!(
            parse_sql(&format!("DELETE FROM conflicts WHERE id = '{ID}'")),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn select_catalog_tables() {
        assert_eq!(parse_sql("SELECT * FROM users").unwrap(), Command::SelectUsers { id: None });
        let sql = format!("SELECT * FROM staff WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::SelectStaff { id } => assert_eq!(id.map(|i| i.to_string()).as_deref(), Some(ID)),
            cmd => panic!("expected SelectStaff, got {cmd:?}"),
        }
        assert!(matches!(
            parse_sql("SELECT * FROM services WHERE name = 'x'"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn select_bookings_calendar_window() {
        let sql = format!(
            r#"SELECT * FROM bookings WHERE staff_id = '{ID}' AND "end" > '2024-01-01T09:00' AND start < '2024-01-01T10:00' AND status = 'pending'"#
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectBookings(f) => {
                assert_eq!(f.staff_id.map(|i| i.to_string()).as_deref(), Some(ID));
                assert_eq!(f.from, Some(NINE));
                assert_eq!(f.to, Some(NINE + H));
                assert_eq!(f.status, Some(BookingStatus::Pending));
                assert_eq!(f.service_id, None);
            }
            cmd => panic!("expected SelectBookings, got {cmd:?}"),
        }
    }

    #[test]
    fn select_conflict() {
        let sql = format!(
            r#"SELECT * FROM conflicts WHERE start = 1000 AND "end" = 2000 AND exclude_id = '{ID}'"#
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectConflict { start, end, exclude_id } => {
                assert_eq!((start, end), (1000, 2000));
                assert_eq!(exclude_id.map(|i| i.to_string()).as_deref(), Some(ID));
            }
            cmd => panic!("expected SelectConflict, got {cmd:?}"),
        }
        assert!(matches!(
            parse_sql("SELECT * FROM conflicts WHERE start = 1000"),
            Err(SqlError::MissingFilter("end"))
        ));
    }

    #[test]
    fn timestamp_forms() {
        assert_eq!(parse_timestamp_str("1704099600000").unwrap(), NINE);
        assert_eq!(parse_timestamp_str("2024-01-01T09:00:00Z").unwrap(), NINE);
        assert_eq!(parse_timestamp_str("2024-01-01T10:00:00+01:00").unwrap(), NINE);
        assert_eq!(parse_timestamp_str("2024-01-01 09:00").unwrap(), NINE);
        assert_eq!(parse_timestamp_str("2024-01-01T09:00:00.000").unwrap(), NINE);
        assert!(parse_timestamp_str("tomorrow").is_err());
    }

    #[test]
    fn negative_integer() {
        let sql = format!("UPDATE services SET price_cents = -5 WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateService { patch, .. } => assert_eq!(patch.price_cents, Some(-5)),
            cmd => panic!("expected UpdateService, got {cmd:?}"),
        }
    }

    #[test]
    fn unknown_table_errors() {
        let sql = format!("INSERT INTO rooms (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn bad_values_error() {
        assert!(parse_sql("DELETE FROM users WHERE id = 'not-a-ulid'").is_err());
        let sql = format!("UPDATE bookings SET status = 'maybe' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn select_table_ignores_placeholders() {
        assert_eq!(
            select_table("SELECT * FROM bookings WHERE staff_id = $1"),
            Some(Table::Bookings)
        );
        assert_eq!(
            select_table(r#"SELECT * FROM conflicts WHERE start = $1 AND "end" = $2"#),
            Some(Table::Conflicts)
        );
        assert_eq!(select_table("DELETE FROM users WHERE id = $1"), None);
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
