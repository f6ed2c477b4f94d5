use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{iso_to_canonical, ReservationRequest};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertGroup {
        group: CourtGroup,
    },
    InsertCourt {
        court: Court,
    },
    InsertSlot {
        slot: TimeSlot,
    },
    InsertPrice {
        row: PriceRow,
    },
    DeletePrice {
        id: Ulid,
    },
    /// One row is a single booking, several rows one reservation.
    InsertBookings {
        request: ReservationRequest,
    },
    InsertRecurring {
        id: Ulid,
        user_id: String,
        request: RecurringRequest,
    },
    InsertPayment {
        booking_id: Ulid,
        proof_ref: String,
    },
    InsertCompletion {
        booking_id: Ulid,
    },
    DeleteBooking {
        id: Ulid,
    },
    DeleteRecurring {
        id: Ulid,
    },
    SelectAvailability {
        group_id: Ulid,
        date: NaiveDate,
    },
    SelectConflicts {
        request: RecurringRequest,
    },
    SelectPricePreview {
        request: RecurringRequest,
    },
    SelectBookingPreview {
        group_id: Ulid,
        court_id: Ulid,
        date: NaiveDate,
        ranges: Vec<TimeRange>,
    },
    SelectBookings {
        court_id: Ulid,
        date: NaiveDate,
    },
    SelectRecurring {
        id: Option<Ulid>,
    },
    SelectRevenue {
        group_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
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
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

const GROUP_COLUMNS: &[&str] = &["id", "name", "street", "district", "province"];
const COURT_COLUMNS: &[&str] = &["id", "group_id", "name"];
const SLOT_COLUMNS: &[&str] = &["id", "start_time", "end_time"];
const PRICE_COLUMNS: &[&str] = &[
    "id",
    "group_id",
    "court_id",
    "slot_id",
    "day_type",
    "unit_price",
    "effective_from",
];
const BOOKING_COLUMNS: &[&str] = &["id", "user_id", "court_id", "date", "start_time", "end_time"];
const RECURRING_COLUMNS: &[&str] = &[
    "id",
    "user_id",
    "court_id",
    "start_date",
    "end_date",
    "weekdays",
    "start_time",
    "end_time",
];
const PAYMENT_COLUMNS: &[&str] = &["booking_id", "proof_ref"];
const COMPLETION_COLUMNS: &[&str] = &["booking_id"];

/// One VALUES row addressed by column name.
struct Row<'a> {
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.values
            .get(column)
            .copied()
            .ok_or(SqlError::MissingColumn(column))
    }

    fn opt(&self, column: &str) -> Option<&'a Expr> {
        self.values.get(column).copied()
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.get(column)?)
    }

    fn text(&self, column: &'static str) -> Result<String, SqlError> {
        parse_string(self.get(column)?)
    }

    fn opt_text(&self, column: &str) -> Result<String, SqlError> {
        match self.opt(column) {
            Some(e) => Ok(parse_string_or_null(e)?.unwrap_or_default()),
            None => Ok(String::new()),
        }
    }

    fn date(&self, column: &'static str) -> Result<NaiveDate, SqlError> {
        parse_date(self.get(column)?)
    }

    fn time(&self, column: &'static str) -> Result<NaiveTime, SqlError> {
        parse_time(self.get(column)?)
    }
}

/// Every VALUES row keyed by column. Without a column list, values are
/// taken positionally in the table's declared order.
fn insert_rows<'a>(insert: &'a ast::Insert, declared: &[&str]) -> Result<Vec<Row<'a>>, SqlError> {
    let names: Vec<String> = if insert.columns.is_empty() {
        declared.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    let source = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let SetExpr::Values(values) = source.body.as_ref() else {
        return Err(SqlError::Parse("expected VALUES".into()));
    };
    if values.rows.is_empty() {
        return Err(SqlError::Parse("empty VALUES".into()));
    }
    values
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            if row.len() != names.len() {
                return Err(SqlError::Parse(format!(
                    "row {i}: expected {} values, got {}",
                    names.len(),
                    row.len()
                )));
            }
            Ok(Row {
                values: names.iter().cloned().zip(row.iter()).collect(),
            })
        })
        .collect()
}

fn single_row<'a>(insert: &'a ast::Insert, declared: &[&str]) -> Result<Row<'a>, SqlError> {
    let mut rows = insert_rows(insert, declared)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT for this table".into()));
    }
    rows.pop().ok_or(SqlError::Parse("empty VALUES".into()))
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "court_groups" => {
            let row = single_row(insert, GROUP_COLUMNS)?;
            Ok(Command::InsertGroup {
                group: CourtGroup {
                    id: row.ulid("id")?,
                    name: row.text("name")?,
                    address: Address {
                        street: row.opt_text("street")?,
                        district: row.opt_text("district")?,
                        province: row.opt_text("province")?,
                    },
                },
            })
        }
        "courts" => {
            let row = single_row(insert, COURT_COLUMNS)?;
            Ok(Command::InsertCourt {
                court: Court {
                    id: row.ulid("id")?,
                    group_id: row.ulid("group_id")?,
                    name: row.text("name")?,
                },
            })
        }
        "time_slots" => {
            let row = single_row(insert, SLOT_COLUMNS)?;
            Ok(Command::InsertSlot {
                slot: TimeSlot {
                    id: parse_u32(row.get("id")?)?,
                    range: checked_range(row.time("start_time")?, row.time("end_time")?)?,
                },
            })
        }
        "prices" => {
            let row = single_row(insert, PRICE_COLUMNS)?;
            let day_type = row.text("day_type")?;
            Ok(Command::InsertPrice {
                row: PriceRow {
                    id: row.ulid("id")?,
                    group_id: row.ulid("group_id")?,
                    court_id: match row.opt("court_id") {
                        Some(e) => parse_ulid_or_null(e)?,
                        None => None,
                    },
                    slot_id: parse_u32(row.get("slot_id")?)?,
                    day_type: DayType::parse(&day_type)
                        .ok_or_else(|| SqlError::Invalid(format!("unknown day_type: {day_type}")))?,
                    unit_price: parse_i64(row.get("unit_price")?)?,
                    effective_from: row.date("effective_from")?,
                    seq: 0,
                },
            })
        }
        "bookings" => {
            let rows = insert_rows(insert, BOOKING_COLUMNS)?;
            let first = &rows[0];
            let (user_id, court_id, date) = (first.text("user_id")?, first.ulid("court_id")?, first.date("date")?);
            let mut items = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let at = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
                if row.text("user_id").map_err(at)? != user_id
                    || row.ulid("court_id").map_err(at)? != court_id
                    || row.date("date").map_err(at)? != date
                {
                    return Err(SqlError::Invalid(format!(
                        "row {i}: a reservation covers one user, court and date"
                    )));
                }
                items.push((
                    row.ulid("id").map_err(at)?,
                    row.time("start_time").map_err(at)?,
                    row.time("end_time").map_err(at)?,
                ));
            }
            Ok(Command::InsertBookings {
                request: ReservationRequest {
                    user_id,
                    court_id,
                    date,
                    items,
                },
            })
        }
        "recurring_bookings" => {
            let row = single_row(insert, RECURRING_COLUMNS)?;
            Ok(Command::InsertRecurring {
                id: row.ulid("id")?,
                user_id: row.text("user_id")?,
                request: RecurringRequest {
                    court_id: row.ulid("court_id")?,
                    start_date: row.date("start_date")?,
                    end_date: row.date("end_date")?,
                    weekdays: weekday_column(row.opt("weekdays"), row.opt("iso_weekdays"))?
                        .ok_or(SqlError::MissingColumn("weekdays"))?,
                    start_time: row.time("start_time")?,
                    end_time: row.time("end_time")?,
                },
            })
        }
        "payments" => {
            let row = single_row(insert, PAYMENT_COLUMNS)?;
            Ok(Command::InsertPayment {
                booking_id: row.ulid("booking_id")?,
                proof_ref: row.text("proof_ref")?,
            })
        }
        "completions" => {
            let row = single_row(insert, COMPLETION_COLUMNS)?;
            Ok(Command::InsertCompletion {
                booking_id: row.ulid("booking_id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(delete.selection.as_ref())?;
    let id = parse_ulid(filter(&filters, "id")?)?;

    match table.as_str() {
        "prices" => Ok(Command::DeletePrice { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        "recurring_bookings" => Ok(Command::DeleteRecurring { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(SqlError::Unsupported("non-SELECT query".into()));
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = where_filters(select.selection.as_ref())?;
    let ulid = |col: &'static str| parse_ulid(filter(&filters, col)?);
    let date = |col: &'static str| parse_date(filter(&filters, col)?);

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            group_id: ulid("group_id")?,
            date: date("date")?,
        }),
        "conflicts" => Ok(Command::SelectConflicts {
            request: recurring_filters(&filters)?,
        }),
        "price_preview" => Ok(Command::SelectPricePreview {
            request: recurring_filters(&filters)?,
        }),
        "booking_preview" => Ok(Command::SelectBookingPreview {
            group_id: ulid("group_id")?,
            court_id: ulid("court_id")?,
            date: date("date")?,
            ranges: parse_ranges(&parse_string(filter(&filters, "ranges")?)?)?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            court_id: ulid("court_id")?,
            date: date("date")?,
        }),
        "recurring_bookings" => Ok(Command::SelectRecurring {
            id: filters.get("id").map(|e| parse_ulid(e)).transpose()?,
        }),
        "revenue" => Ok(Command::SelectRevenue {
            group_id: ulid("group_id")?,
            start_date: date("start_date")?,
            end_date: date("end_date")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn recurring_filters(filters: &HashMap<String, &Expr>) -> Result<RecurringRequest, SqlError> {
    Ok(RecurringRequest {
        court_id: parse_ulid(filter(filters, "court_id")?)?,
        start_date: parse_date(filter(filters, "start_date")?)?,
        end_date: parse_date(filter(filters, "end_date")?)?,
        weekdays: weekday_column(
            filters.get("weekdays").copied(),
            filters.get("iso_weekdays").copied(),
        )?
        .ok_or(SqlError::MissingFilter("weekdays"))?,
        start_time: parse_time(filter(filters, "start_time")?)?,
        end_time: parse_time(filter(filters, "end_time")?)?,
    })
}

/// Collect `column = value` pairs joined by AND.
fn where_filters(selection: Option<&Expr>) -> Result<HashMap<String, &Expr>, SqlError> {
    fn walk<'a>(expr: &'a Expr, out: &mut HashMap<String, &'a Expr>) -> Result<(), SqlError> {
        match expr {
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
                out.insert(col, right.as_ref());
                Ok(())
            }
            Expr::Nested(inner) => walk(inner, out),
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    let mut out = HashMap::new();
    if let Some(expr) = selection {
        walk(expr, &mut out)?;
    }
    Ok(out)
}

fn filter<'a>(filters: &HashMap<String, &'a Expr>, column: &'static str) -> Result<&'a Expr, SqlError> {
    filters
        .get(column)
        .copied()
        .ok_or(SqlError::MissingFilter(column))
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

/// Literal text of a string or number value; `None` for NULL.
fn literal(expr: &Expr) -> Result<Option<&str>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.as_str())),
        Some(other) => Err(SqlError::Parse(format!("unexpected literal {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    Ok(literal(expr)?.map(str::to_string))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match literal(expr)? {
        None => Ok(None),
        Some(s) => Ulid::from_string(s)
            .map(Some)
            .map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    let s = parse_string(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn time_of(s: &str) -> Result<NaiveTime, SqlError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| SqlError::Parse(format!("bad time {s}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    time_of(&parse_string(expr)?)
}

fn checked_range(start: NaiveTime, end: NaiveTime) -> Result<TimeRange, SqlError> {
    TimeRange::checked(start, end)
        .ok_or_else(|| SqlError::Invalid(format!("end time {end} must be after start time {start}")))
}

/// `'1,3,5'` or a bare number. Range checking is left to the engine.
fn parse_weekdays(expr: &Expr) -> Result<Vec<u8>, SqlError> {
    let s = parse_string(expr)?;
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<u8>()
                .map_err(|e| SqlError::Parse(format!("bad weekday {p}: {e}")))
        })
        .collect()
}

/// `weekdays` is canonical (0 = Sunday). `iso_weekdays` (1 = Monday .. 7 = Sunday)
/// is converted here; `weekdays` wins when both are given.
fn weekday_column(canonical: Option<&Expr>, iso: Option<&Expr>) -> Result<Option<Vec<u8>>, SqlError> {
    match (canonical, iso) {
        (Some(expr), _) => parse_weekdays(expr).map(Some),
        (None, Some(expr)) => parse_weekdays(expr)?
            .into_iter()
            .map(|day| {
                iso_to_canonical(day).ok_or_else(|| {
                    SqlError::Invalid(format!("ISO weekday {day} out of range (1 = Monday .. 7 = Sunday)"))
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        (None, None) => Ok(None),
    }
}

/// `'18:00-18:30,18:30-19:00'`.
fn parse_ranges(s: &str) -> Result<Vec<TimeRange>, SqlError> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|part| {
            let (start, end) = part
                .split_once('-')
                .ok_or_else(|| SqlError::Parse(format!("bad range {part}, expected HH:MM-HH:MM")))?;
            checked_range(time_of(start)?, time_of(end)?)
        })
        .collect()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value the scheduler rejects.
    #[error("{0}")]
    Invalid(String),
}
