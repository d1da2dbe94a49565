use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Plain-text secret carried from a statement to the engine. Kept out of
/// `Debug` output so commands can be logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(pub String);

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderFilter {
    All,
    Id(ProviderId),
    Name { name: String, surname: String },
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProvider {
        name: String,
        surname: String,
        returning: bool,
    },
    InsertConsumer {
        username: String,
        name: String,
        surname: String,
        date_of_birth: NaiveDate,
        password: Secret,
    },
    InsertSlot {
        provider_id: ProviderId,
        day: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        returning: bool,
    },
    InsertReservation {
        consumer_username: String,
        provider_id: ProviderId,
        slot_id: SlotId,
        subject: String,
        returning: bool,
    },
    DeleteReservation {
        id: ReservationId,
        returning: bool,
    },
    SelectProviders {
        filter: ProviderFilter,
    },
    SelectConsumers {
        username: Option<String>,
    },
    SelectSlots {
        provider_id: ProviderId,
        booked: Option<bool>,
    },
    SelectHistory {
        consumer_username: String,
    },
    Login {
        username: String,
        password: Secret,
    },
    SelectSession {
        token: Ulid,
    },
    DeleteSession {
        token: Ulid,
    },
}

const PROVIDER_COLUMNS: &[&str] = &["name", "surname"];
const CONSUMER_COLUMNS: &[&str] = &["username", "name", "surname", "date_of_birth", "password"];
const SLOT_COLUMNS: &[&str] = &["provider_id", "day", "start_time", "end_time"];
const RESERVATION_COLUMNS: &[&str] = &["consumer_username", "provider_id", "slot_id", "subject"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > crate::limits::MAX_SQL_LEN {
        return Err(SqlError::TooLong);
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [one] => one,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// What kind of rows a statement produces, decided without binding
/// parameters. Used to describe prepared statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    None,
    Providers,
    Consumers,
    Slots,
    History,
    Session,
    /// `RETURNING id`
    ReturningId,
    /// `RETURNING consumer_username`
    ReturningUsername,
}

pub fn result_shape(sql: &str) -> ResultShape {
    let dialect = PostgreSqlDialect {};
    let Ok(stmts) = Parser::parse_sql(&dialect, sql) else {
        return ResultShape::None;
    };
    let Some(stmt) = stmts.first() else {
        return ResultShape::None;
    };
    match stmt {
        Statement::Insert(insert) => match (insert_table_name(insert).as_deref(), &insert.returning) {
            (Ok("providers" | "slots" | "reservations"), Some(_)) => ResultShape::ReturningId,
            _ => ResultShape::None,
        },
        Statement::Delete(delete) => match (delete_table_name(delete).as_deref(), &delete.returning) {
            (Ok("reservations"), Some(_)) => ResultShape::ReturningUsername,
            _ => ResultShape::None,
        },
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return ResultShape::None;
            };
            let Some(from) = select.from.first() else {
                return ResultShape::None;
            };
            match table_factor_name(&from.relation).as_deref() {
                Ok("providers") => ResultShape::Providers,
                Ok("consumers") => ResultShape::Consumers,
                Ok("slots") => ResultShape::Slots,
                Ok("history") => ResultShape::History,
                Ok("login" | "sessions") => ResultShape::Session,
                _ => ResultShape::None,
            }
        }
        _ => ResultShape::None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let returning = insert.returning.is_some();

    match table.as_str() {
        "providers" => {
            let v = insert_row(insert, "providers", PROVIDER_COLUMNS)?;
            Ok(Command::InsertProvider {
                name: parse_string(&v[0])?,
                surname: parse_string(&v[1])?,
                returning,
            })
        }
        "consumers" => {
            let v = insert_row(insert, "consumers", CONSUMER_COLUMNS)?;
            Ok(Command::InsertConsumer {
                username: parse_string(&v[0])?,
                name: parse_string(&v[1])?,
                surname: parse_string(&v[2])?,
                date_of_birth: parse_date(&v[3])?,
                password: Secret(parse_string(&v[4])?),
            })
        }
        "slots" => {
            let v = insert_row(insert, "slots", SLOT_COLUMNS)?;
            Ok(Command::InsertSlot {
                provider_id: parse_i64_expr(&v[0])?,
                day: parse_date(&v[1])?,
                start: parse_time(&v[2])?,
                end: parse_time(&v[3])?,
                returning,
            })
        }
        "reservations" => {
            let v = insert_row(insert, "reservations", RESERVATION_COLUMNS)?;
            Ok(Command::InsertReservation {
                consumer_username: parse_string(&v[0])?,
                provider_id: parse_i64_expr(&v[1])?,
                slot_id: parse_i64_expr(&v[2])?,
                subject: parse_string(&v[3])?,
                returning,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_equalities(delete.selection.as_ref())?;

    match table.as_str() {
        "reservations" => {
            only_columns(&filters, &["id"])?;
            Ok(Command::DeleteReservation {
                id: parse_i64_expr(required(&filters, "id")?)?,
                returning: delete.returning.is_some(),
            })
        }
        "sessions" => {
            only_columns(&filters, &["token"])?;
            Ok(Command::DeleteSession {
                token: parse_ulid_expr(required(&filters, "token")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = where_equalities(select.selection.as_ref())?;

    match table.as_str() {
        "providers" => {
            only_columns(&filters, &["id", "name", "surname"])?;
            let filter = match (
                optional(&filters, "id"),
                optional(&filters, "name"),
                optional(&filters, "surname"),
            ) {
                (None, None, None) => ProviderFilter::All,
                (Some(id), None, None) => ProviderFilter::Id(parse_i64_expr(id)?),
                (None, Some(name), Some(surname)) => ProviderFilter::Name {
                    name: parse_string(name)?,
                    surname: parse_string(surname)?,
                },
                _ => {
                    return Err(SqlError::Unsupported(
                        "providers: filter by id, or by name and surname together".into(),
                    ));
                }
            };
            Ok(Command::SelectProviders { filter })
        }
        "consumers" => {
            only_columns(&filters, &["username"])?;
            let username = optional(&filters, "username").map(parse_string).transpose()?;
            Ok(Command::SelectConsumers { username })
        }
        "slots" => {
            only_columns(&filters, &["provider_id", "booked"])?;
            Ok(Command::SelectSlots {
                provider_id: parse_i64_expr(required(&filters, "provider_id")?)?,
                booked: optional(&filters, "booked").map(parse_bool).transpose()?,
            })
        }
        "history" => {
            only_columns(&filters, &["consumer_username"])?;
            Ok(Command::SelectHistory {
                consumer_username: parse_string(required(&filters, "consumer_username")?)?,
            })
        }
        "login" => {
            only_columns(&filters, &["username", "password"])?;
            Ok(Command::Login {
                username: parse_string(required(&filters, "username")?)?,
                password: Secret(parse_string(required(&filters, "password")?)?),
            })
        }
        "sessions" => {
            only_columns(&filters, &["token"])?;
            Ok(Command::SelectSession {
                token: parse_ulid_expr(required(&filters, "token")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

/// The single VALUES row of an INSERT, reordered to `expected`. With an
/// explicit column list columns may come in any order; without one the
/// values are taken positionally.
fn insert_row(insert: &ast::Insert, table: &'static str, expected: &[&'static str]) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let row = match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            [row] => row,
            _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };

    if insert.columns.is_empty() {
        if row.len() != expected.len() {
            return Err(SqlError::WrongArity(table, expected.len(), row.len()));
        }
        return Ok(row.clone());
    }

    if insert.columns.len() != row.len() {
        return Err(SqlError::WrongArity(table, insert.columns.len(), row.len()));
    }
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    if let Some(unknown) = columns.iter().find(|c| !expected.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(table, unknown.clone()));
    }
    expected
        .iter()
        .map(|want| {
            columns
                .iter()
                .position(|c| c == want)
                .map(|i| row[i].clone())
                .ok_or(SqlError::MissingColumn(table, want))
        })
        .collect()
}

/// Flatten `a = 1 AND b = 'x'` into `[("a", 1), ("b", 'x')]`.
fn where_equalities(selection: Option<&Expr>) -> Result<Vec<(String, Expr)>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_equalities(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_equalities(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, out),
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
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!(
            "WHERE {other}: only column = value joined by AND"
        ))),
    }
}

fn only_columns(filters: &[(String, Expr)], allowed: &[&str]) -> Result<(), SqlError> {
    match filters.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
        Some((col, _)) => Err(SqlError::UnknownFilter(col.clone())),
        None => Ok(()),
    }
}

fn optional<'a>(filters: &'a [(String, Expr)], col: &str) -> Option<&'a Expr> {
    filters.iter().find(|(c, _)| c == col).map(|(_, e)| e)
}

fn required<'a>(filters: &'a [(String, Expr)], col: &'static str) -> Result<&'a Expr, SqlError> {
    optional(filters, col).ok_or(SqlError::MissingFilter(col))
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

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad token: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?} (want YYYY-MM-DD): {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?} (want HH:MM[:SS]): {e}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("query too long")]
    TooLong,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("unknown filter column: {0}")]
    UnknownFilter(String),
}
