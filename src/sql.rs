use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
///
/// State transitions are INSERTs into pseudo-tables (`booking_approvals`,
/// `booking_cancellations`, ...), each naming the acting user in `actor_id`.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBillboard {
        id: Ulid,
        owner_id: Ulid,
        is_digital: bool,
        policy: BillboardPolicy,
    },
    UpdatePolicy {
        billboard_id: Ulid,
        actor_id: Ulid,
        policy: BillboardPolicy,
    },
    SubmitBooking {
        id: Ulid,
        billboard_id: Ulid,
        requester_id: Ulid,
        range: DateRange,
        note: String,
        attachments: Vec<String>,
    },
    ApproveBooking {
        booking_id: Ulid,
        actor_id: Ulid,
    },
    RejectBooking {
        booking_id: Ulid,
        actor_id: Ulid,
        reason: Option<String>,
    },
    CancelBooking {
        booking_id: Ulid,
        actor_id: Ulid,
    },
    ReleaseBlocks {
        booking_id: Ulid,
        actor_id: Ulid,
    },
    InsertBlock {
        id: Ulid,
        billboard_id: Ulid,
        actor_id: Ulid,
        range: DateRange,
        reason: String,
    },
    DeleteBlock {
        id: Ulid,
        actor_id: Ulid,
    },
    InsertOverride {
        id: Ulid,
        billboard_id: Ulid,
        actor_id: Ulid,
        range: DateRange,
        price_monthly: Decimal,
        note: Option<String>,
    },
    DeleteOverride {
        id: Ulid,
        actor_id: Ulid,
    },
    SelectBillboards {
        id: Option<Ulid>,
    },
    SelectBookings {
        filter: EntityFilter,
    },
    SelectBlocks {
        filter: EntityFilter,
    },
    SelectOverrides {
        billboard_id: Ulid,
    },
    SelectDayStatus {
        billboard_id: Ulid,
        range: DateRange,
    },
    SelectConflicts {
        billboard_id: Ulid,
        range: DateRange,
    },
    SelectQuote {
        billboard_id: Ulid,
        range: DateRange,
    },
}

/// Row selector for per-billboard tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityFilter {
    Id(Ulid),
    Billboard(Ulid),
    /// Blocks written by approving this booking.
    Booking(Ulid),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a SELECT reads from, without interpreting its filters. Lets the
/// extended protocol describe a statement before parameters are bound.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

// ── INSERT ────────────────────────────────────────────────────

/// Positional values of a single-row INSERT, with optional trailing columns.
struct Row<'a> {
    table: &'static str,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(table: &'static str, values: &'a [Expr], required: usize) -> Result<Self, SqlError> {
        if values.len() < required {
            return Err(SqlError::WrongArity(table, required, values.len()));
        }
        Ok(Self { table, values })
    }

    fn at(&self, i: usize) -> &'a Expr {
        &self.values[i]
    }

    fn opt(&self, i: usize) -> Option<&'a Expr> {
        self.values.get(i).filter(|e| !is_null(e))
    }

    fn range(&self, start: usize) -> Result<DateRange, SqlError> {
        Ok(DateRange::new(parse_date(self.at(start))?, parse_date(self.at(start + 1))?))
    }

    /// Policy columns starting at `i`: price, then optional min days, advance days,
    /// availability and pause reason.
    fn policy(&self, i: usize) -> Result<BillboardPolicy, SqlError> {
        let mut policy = BillboardPolicy::new(parse_decimal(self.at(i))?);
        if let Some(e) = self.opt(i + 1) {
            policy.min_campaign_days = parse_u32(e)?;
        }
        if let Some(e) = self.opt(i + 2) {
            policy.min_advance_booking_days = parse_u32(e)?;
        }
        if let Some(e) = self.opt(i + 3) {
            policy.is_available = parse_bool(e)?;
        }
        policy.pause_reason = self.opt(i + 4).map(parse_text).transpose()?;
        Ok(policy)
    }

    fn too_many(&self, max: usize) -> Result<(), SqlError> {
        if self.values.len() > max {
            return Err(SqlError::WrongArity(self.table, max, self.values.len()));
        }
        Ok(())
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = single_row(insert)?;

    match table.as_str() {
        "billboards" => {
            let row = Row::new("billboards", values, 4)?;
            row.too_many(8)?;
            Ok(Command::InsertBillboard {
                id: parse_ulid(row.at(0))?,
                owner_id: parse_ulid(row.at(1))?,
                is_digital: parse_bool(row.at(2))?,
                policy: row.policy(3)?,
            })
        }
        "billboard_policies" => {
            let row = Row::new("billboard_policies", values, 3)?;
            row.too_many(7)?;
            Ok(Command::UpdatePolicy {
                billboard_id: parse_ulid(row.at(0))?,
                actor_id: parse_ulid(row.at(1))?,
                policy: row.policy(2)?,
            })
        }
        "bookings" => {
            let row = Row::new("bookings", values, 5)?;
            row.too_many(7)?;
            Ok(Command::SubmitBooking {
                id: parse_ulid(row.at(0))?,
                billboard_id: parse_ulid(row.at(1))?,
                requester_id: parse_ulid(row.at(2))?,
                range: row.range(3)?,
                note: row.opt(5).map(parse_text).transpose()?.unwrap_or_default(),
                attachments: row.opt(6).map(parse_text_list).transpose()?.unwrap_or_default(),
            })
        }
        "booking_approvals" => {
            let row = Row::new("booking_approvals", values, 2)?;
            row.too_many(2)?;
            Ok(Command::ApproveBooking {
                booking_id: parse_ulid(row.at(0))?,
                actor_id: parse_ulid(row.at(1))?,
            })
        }
        "booking_rejections" => {
            let row = Row::new("booking_rejections", values, 2)?;
            row.too_many(3)?;
            Ok(Command::RejectBooking {
                booking_id: parse_ulid(row.at(0))?,
                actor_id: parse_ulid(row.at(1))?,
                reason: row.opt(2).map(parse_text).transpose()?,
            })
        }
        "booking_cancellations" => {
            let row = Row::new("booking_cancellations", values, 2)?;
            row.too_many(2)?;
            Ok(Command::CancelBooking {
                booking_id: parse_ulid(row.at(0))?,
                actor_id: parse_ulid(row.at(1))?,
            })
        }
        "block_releases" => {
            let row = Row::new("block_releases", values, 2)?;
            row.too_many(2)?;
            Ok(Command::ReleaseBlocks {
                booking_id: parse_ulid(row.at(0))?,
                actor_id: parse_ulid(row.at(1))?,
            })
        }
        "blocked_dates" => {
            let row = Row::new("blocked_dates", values, 5)?;
            row.too_many(6)?;
            Ok(Command::InsertBlock {
                id: parse_ulid(row.at(0))?,
                billboard_id: parse_ulid(row.at(1))?,
                actor_id: parse_ulid(row.at(2))?,
                range: row.range(3)?,
                reason: row.opt(5).map(parse_text).transpose()?.unwrap_or_default(),
            })
        }
        "pricing_overrides" => {
            let row = Row::new("pricing_overrides", values, 6)?;
            row.too_many(7)?;
            Ok(Command::InsertOverride {
                id: parse_ulid(row.at(0))?,
                billboard_id: parse_ulid(row.at(1))?,
                actor_id: parse_ulid(row.at(2))?,
                range: row.range(3)?,
                price_monthly: parse_decimal(row.at(5))?,
                note: row.opt(6).map(parse_text).transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;
    let id = filters.ulid("id")?;
    let actor_id = filters.ulid("actor_id")?;

    match table.as_str() {
        "blocked_dates" => Ok(Command::DeleteBlock { id, actor_id }),
        "pricing_overrides" => Ok(Command::DeleteOverride { id, actor_id }),
        _ => Err(SqlError::UnknownTable(table)),
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
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "billboards" => Ok(Command::SelectBillboards {
            id: filters.opt_ulid("id")?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            filter: filters.entity(&["id", "billboard_id"])?,
        }),
        "blocked_dates" => Ok(Command::SelectBlocks {
            filter: filters.entity(&["id", "billboard_id", "booking_id"])?,
        }),
        "pricing_overrides" => Ok(Command::SelectOverrides {
            billboard_id: filters.ulid("billboard_id")?,
        }),
        "day_status" => {
            let billboard_id = filters.ulid("billboard_id")?;
            let single = filters
                .find("day", &[BinaryOperator::Eq])
                .or_else(|| filters.find("date", &[BinaryOperator::Eq]));
            let range = match single {
                Some(e) => {
                    let day = parse_date(e)?;
                    DateRange::new(day, day)
                }
                None => filters.window()?,
            };
            Ok(Command::SelectDayStatus { billboard_id, range })
        }
        "conflicts" => Ok(Command::SelectConflicts {
            billboard_id: filters.ulid("billboard_id")?,
            range: filters.window()?,
        }),
        "quotes" => Ok(Command::SelectQuote {
            billboard_id: filters.ulid("billboard_id")?,
            range: filters.window()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column op value` conjuncts of a WHERE clause. Only AND is supported.
struct Filters<'a>(Vec<(String, &'a BinaryOperator, &'a Expr)>);

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut out = Vec::new();
        if let Some(expr) = selection {
            collect_conjuncts(expr, &mut out)?;
        }
        Ok(Self(out))
    }

    fn find(&self, column: &str, ops: &[BinaryOperator]) -> Option<&'a Expr> {
        self.0
            .iter()
            .find(|(c, op, _)| c == column && ops.contains(op))
            .map(|(_, _, e)| *e)
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        self.opt_ulid(column)?.ok_or(SqlError::MissingFilter(column))
    }

    fn opt_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.find(column, &[BinaryOperator::Eq]).map(parse_ulid).transpose()
    }

    /// The first of `columns` present decides the filter.
    fn entity(&self, columns: &[&'static str]) -> Result<EntityFilter, SqlError> {
        for column in columns {
            if let Some(id) = self.opt_ulid(column)? {
                return Ok(match *column {
                    "id" => EntityFilter::Id(id),
                    "booking_id" => EntityFilter::Booking(id),
                    _ => EntityFilter::Billboard(id),
                });
            }
        }
        Err(SqlError::MissingFilter(columns.last().copied().unwrap_or("id")))
    }

    /// `start >= a AND "end" <= b` (or `=`), both inclusive.
    fn window(&self) -> Result<DateRange, SqlError> {
        let start = self
            .find("start", &[BinaryOperator::GtEq, BinaryOperator::Eq])
            .ok_or(SqlError::MissingFilter("start"))?;
        let end = self
            .find("end", &[BinaryOperator::LtEq, BinaryOperator::Eq])
            .ok_or(SqlError::MissingFilter("end"))?;
        Ok(DateRange::new(parse_date(start)?, parse_date(end)?))
    }
}

fn collect_conjuncts<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, &'a BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_conjuncts(inner, out),
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            collect_conjuncts(left, out)?;
            collect_conjuncts(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, op, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables.first() {
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

fn single_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let source = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match source.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

/// String or bare-number literal as text.
fn literal_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.as_str()),
        Some(other) => Err(SqlError::Parse(format!("expected literal, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

/// ISO `yyyy-MM-dd`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_decimal(expr)?);
    }
    let s = literal_text(expr)?;
    Decimal::from_str(s).map_err(|e| SqlError::Parse(format!("bad amount {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let s = literal_text(expr)?;
    s.parse().map_err(|e| SqlError::Parse(format!("bad count {s:?}: {e}")))
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
        _ => Err(SqlError::Parse(format!("expected bool, got {expr}"))),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

/// `ARRAY['a', 'b']`, or the text form `'{a,b}'` that bound parameters arrive as.
fn parse_text_list(expr: &Expr) -> Result<Vec<String>, SqlError> {
    if let Expr::Array(array) = expr {
        return array.elem.iter().map(parse_text).collect();
    }
    let s = parse_text(expr)?;
    match s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
        Some("") => Ok(Vec::new()),
        Some(inner) => Ok(inner
            .split(',')
            .map(|item| item.trim().trim_matches('"').to_string())
            .collect()),
        None => Ok(vec![s]),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
