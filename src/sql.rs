use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;
use ulid::Ulid;

/// Which bookings a `SELECT ... FROM bookings` asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum BookingFilter {
    All,
    Id(Ulid),
    Day { location_id: Ulid, date: NaiveDate },
    User(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertLocation {
        id: Ulid,
        address: String,
        img: String,
    },
    UpdateLocation {
        id: Ulid,
        address: String,
    },
    SelectLocations {
        id: Option<Ulid>,
    },
    InsertUser {
        id: Ulid,
        name: String,
        verified: bool,
    },
    UpdateUser {
        id: Ulid,
        verified: bool,
    },
    /// One user by id, or every user when no filter is given.
    SelectUsers {
        id: Option<Ulid>,
    },
    /// Removes the user and every booking they hold.
    DeleteUser {
        id: Ulid,
    },
    InsertBooking {
        user_id: Ulid,
        location_id: Ulid,
        date: NaiveDate,
        time: String,
        duration_hours: u8,
    },
    /// Administrative edit; unset columns keep their current value.
    UpdateBooking {
        id: Ulid,
        date: Option<NaiveDate>,
        time: Option<String>,
        duration_hours: Option<u8>,
    },
    /// Owner cancellation (`WHERE id = .. AND user_id = ..`).
    CancelBooking {
        id: Ulid,
        user_id: Ulid,
    },
    /// Administrative removal (`WHERE id = ..` only).
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectSchedule {
        location_id: Ulid,
        date: NaiveDate,
    },
    SelectSuggestions {
        location_id: Ulid,
        date: NaiveDate,
        time: String,
        duration_hours: u8,
    },
    SelectSettings,
    UpdateSetting {
        key: String,
        value: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == ';' || c.is_whitespace()) {
        return Err(SqlError::Empty);
    }
    if trimmed
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("update"))
    {
        return parse_update(trimmed);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    match stmts.first() {
        None => Err(SqlError::Empty),
        Some(Statement::Insert(insert)) => parse_insert(insert),
        Some(Statement::Delete(delete)) => parse_delete(delete),
        Some(Statement::Query(query)) => parse_select(query),
        Some(other) => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = insert_row(insert, &table)?;

    match table.as_str() {
        "locations" => Ok(Command::InsertLocation {
            id: parse_ulid(row.required("id")?)?,
            address: parse_string(row.required("address")?)?,
            img: row.optional("img").map(parse_string).transpose()?.unwrap_or_default(),
        }),
        "users" => Ok(Command::InsertUser {
            id: parse_ulid(row.required("id")?)?,
            name: parse_string(row.required("name")?)?,
            verified: row.optional("verified").map(parse_bool).transpose()?.unwrap_or(false),
        }),
        "bookings" => Ok(Command::InsertBooking {
            user_id: parse_ulid(row.required("user_id")?)?,
            location_id: parse_ulid(row.required("location_id")?)?,
            date: parse_date(row.required("date")?)?,
            time: parse_string(row.required("time")?)?,
            duration_hours: parse_u8(row.required("duration_hours")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Column order used when an INSERT names no columns.
fn default_columns(table: &str) -> &'static [&'static str] {
    match table {
        "locations" => &["id", "address", "img"],
        "users" => &["id", "name", "verified"],
        "bookings" => &["user_id", "location_id", "date", "time", "duration_hours"],
        _ => &[],
    }
}

/// Column → value pairs of a statement, by lowercase column name.
struct Row(Vec<(String, Expr)>);

impl Row {
    fn optional(&self, col: &str) -> Option<&Expr> {
        self.0.iter().find(|(name, _)| name == col).map(|(_, e)| e)
    }

    fn required(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.optional(col).ok_or(SqlError::MissingColumn(col))
    }
}

fn insert_row(insert: &ast::Insert, table: &str) -> Result<Row, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match values.rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns(table).iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if row.len() > columns.len() || (!insert.columns.is_empty() && row.len() != columns.len()) {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }
    Ok(Row(columns.into_iter().zip(row.iter().cloned()).collect()))
}

// ── UPDATE ────────────────────────────────────────────────────

/// `UPDATE <table> SET col = val[, ...] WHERE col = val [AND ...]`.
fn parse_update(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect)
        .try_with_sql(sql)
        .map_err(|e| SqlError::Parse(e.to_string()))?;
    if !parser.parse_keyword(Keyword::UPDATE) {
        return Err(SqlError::Parse("expected UPDATE".into()));
    }
    let name = parser
        .parse_object_name(false)
        .map_err(|e| SqlError::Parse(e.to_string()))?;
    let table = object_name_last(&name).ok_or_else(|| SqlError::Parse("empty table name".into()))?;
    if !parser.parse_keyword(Keyword::SET) {
        return Err(SqlError::Parse("expected SET".into()));
    }
    let assignments = parser
        .parse_comma_separated(Parser::parse_assignment)
        .map_err(|e| SqlError::Parse(e.to_string()))?;
    let selection = if parser.parse_keyword(Keyword::WHERE) {
        Some(parser.parse_expr().map_err(|e| SqlError::Parse(e.to_string()))?)
    } else {
        None
    };
    while parser.consume_token(&Token::SemiColon) {}
    if parser.peek_token().token != Token::EOF {
        return Err(SqlError::Parse(format!("unexpected {}", parser.peek_token().token)));
    }

    let mut set = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((col, assignment.value));
    }
    let set = Row(set);
    let filters = where_filters(selection.as_ref())?;

    match table.as_str() {
        "locations" => Ok(Command::UpdateLocation {
            id: parse_ulid(filters.required("id")?)?,
            address: parse_string(set.required("address")?)?,
        }),
        "users" => Ok(Command::UpdateUser {
            id: parse_ulid(filters.required("id")?)?,
            verified: parse_bool(set.required("verified")?)?,
        }),
        "bookings" => {
            let cmd = Command::UpdateBooking {
                id: parse_ulid(filters.required("id")?)?,
                date: set.optional("date").map(parse_date).transpose()?,
                time: set.optional("time").map(parse_string).transpose()?,
                duration_hours: set.optional("duration_hours").map(parse_u8).transpose()?,
            };
            if let Command::UpdateBooking {
                date: None,
                time: None,
                duration_hours: None,
                ..
            } = cmd
            {
                return Err(SqlError::MissingColumn("date, time or duration_hours"));
            }
            Ok(cmd)
        }
        "settings" => Ok(Command::UpdateSetting {
            key: parse_string(filters.required("key")?)?,
            value: parse_text(set.required("value")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "bookings" && table != "users" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = where_filters(delete.selection.as_ref())?;
    let id = parse_ulid(filters.required("id")?)?;
    if table == "users" {
        return Ok(Command::DeleteUser { id });
    }
    match filters.optional("user_id") {
        Some(user_id) => Ok(Command::CancelBooking {
            id,
            user_id: parse_ulid(user_id)?,
        }),
        None => Ok(Command::DeleteBooking { id }),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = where_filters(select.selection.as_ref())?;

    match table.as_str() {
        "locations" => Ok(Command::SelectLocations {
            id: filters.optional("id").map(parse_ulid).transpose()?,
        }),
        "users" => Ok(Command::SelectUsers {
            id: filters.optional("id").map(parse_ulid).transpose()?,
        }),
        "bookings" => {
            let filter = if let Some(id) = filters.optional("id") {
                BookingFilter::Id(parse_ulid(id)?)
            } else if let Some(user_id) = filters.optional("user_id") {
                BookingFilter::User(parse_ulid(user_id)?)
            } else if let Some(location_id) = filters.optional("location_id") {
                BookingFilter::Day {
                    location_id: parse_ulid(location_id)?,
                    date: parse_date(filters.required("date")?)?,
                }
            } else {
                BookingFilter::All
            };
            Ok(Command::SelectBookings { filter })
        }
        "schedule" => Ok(Command::SelectSchedule {
            location_id: parse_ulid(filters.required("location_id")?)?,
            date: parse_date(filters.required("date")?)?,
        }),
        "suggestions" => Ok(Command::SelectSuggestions {
            location_id: parse_ulid(filters.required("location_id")?)?,
            date: parse_date(filters.required("date")?)?,
            time: parse_string(filters.required("time")?)?,
            duration_hours: parse_u8(filters.required("duration_hours")?)?,
        }),
        "settings" => Ok(Command::SelectSettings),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y AND ...` into column → value pairs. Other
/// operators are rejected rather than silently ignored.
fn where_filters(selection: Option<&Expr>) -> Result<Row, SqlError> {
    fn walk(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => walk(inner, out),
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                walk(left, out)?;
                walk(right, out)
            }
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref().clone()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    let mut out = Vec::new();
    if let Some(expr) = selection {
        walk(expr, &mut out)?;
    }
    Ok(Row(out))
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// A string or a bare number, as text (setting values).
fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string or number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => match expr {
            Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr,
            } => Ok(-parse_i64(expr)?),
            _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column or filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
