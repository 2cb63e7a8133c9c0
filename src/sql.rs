use chrono::NaiveDate;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::{Domain, Minute};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertExpert {
        id: Ulid,
        name: String,
        domain: Domain,
        hourly_rate: i64,
        /// "HH:MM" — converted (and validated) at execution time.
        day_start: String,
        day_end: String,
        workdays: Vec<u8>,
        base_rating: f64,
    },
    InsertOverride {
        id: Ulid,
        expert_id: Ulid,
        date: NaiveDate,
        workday: bool,
        day_start: Option<String>,
        day_end: Option<String>,
    },
    DeleteOverride {
        id: Ulid,
    },
    InsertWindow {
        id: Ulid,
        expert_id: Ulid,
        date: NaiveDate,
        start_min: Minute,
        end_min: Minute,
    },
    DeleteWindow {
        id: Ulid,
    },
    InsertPurchase {
        id: Ulid,
        user_id: Ulid,
        expert_id: Ulid,
        package_hours: i64,
    },
    /// One booking request; a multi-row INSERT is one atomic batch.
    InsertSessions {
        purchase_id: Ulid,
        user_id: Ulid,
        date: NaiveDate,
        slots: Vec<(Minute, Minute)>,
    },
    CancelSession {
        id: Ulid,
        by_user: Ulid,
        reason: String,
    },
    InsertFeedback {
        id: Ulid,
        purchase_id: Ulid,
        user_id: Ulid,
        rating: u8,
        text: String,
    },
    InsertPayout {
        id: Ulid,
        expert_id: Ulid,
        amount: i64,
        note: String,
    },
    InsertClientPayment {
        id: Ulid,
        user_id: Ulid,
        amount: i64,
        note: String,
    },
    SelectSlots {
        expert_id: Ulid,
        date: NaiveDate,
    },
    SelectExperts,
    SelectSessions {
        purchase_id: Option<Ulid>,
        user_id: Option<Ulid>,
    },
    SelectPurchases {
        user_id: Ulid,
    },
    SelectEarnings,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "experts" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("experts", 4, values.len()));
            }
            Ok(Command::InsertExpert {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                domain: parse_domain(&values[2])?,
                hourly_rate: parse_i64(&values[3])?,
                day_start: if values.len() >= 5 {
                    parse_string(&values[4])?
                } else {
                    "09:00".into()
                },
                day_end: if values.len() >= 6 {
                    parse_string(&values[5])?
                } else {
                    "17:00".into()
                },
                workdays: if values.len() >= 7 {
                    parse_workdays(&values[6])?
                } else {
                    vec![1, 2, 3, 4, 5]
                },
                base_rating: if values.len() >= 8 {
                    parse_f64(&values[7])?
                } else {
                    0.0
                },
            })
        }
        "overrides" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("overrides", 4, values.len()));
            }
            Ok(Command::InsertOverride {
                id: parse_ulid(&values[0])?,
                expert_id: parse_ulid(&values[1])?,
                date: parse_date(&values[2])?,
                workday: parse_bool(&values[3])?,
                day_start: if values.len() >= 5 {
                    parse_string_or_null(&values[4])?
                } else {
                    None
                },
                day_end: if values.len() >= 6 {
                    parse_string_or_null(&values[5])?
                } else {
                    None
                },
            })
        }
        "windows" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("windows", 5, values.len()));
            }
            Ok(Command::InsertWindow {
                id: parse_ulid(&values[0])?,
                expert_id: parse_ulid(&values[1])?,
                date: parse_date(&values[2])?,
                start_min: parse_minute(&values[3])?,
                end_min: parse_minute(&values[4])?,
            })
        }
        "purchases" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("purchases", 4, values.len()));
            }
            Ok(Command::InsertPurchase {
                id: parse_ulid(&values[0])?,
                user_id: parse_ulid(&values[1])?,
                expert_id: parse_ulid(&values[2])?,
                package_hours: parse_i64(&values[3])?,
            })
        }
        "sessions" => {
            // (purchase_id, user_id, date, start_min, end_min) per row;
            // session ids are generated by the engine.
            let rows = extract_all_insert_rows(insert)?;
            let mut slots = Vec::with_capacity(rows.len());
            let mut header: Option<(Ulid, Ulid, NaiveDate)> = None;
            for (i, row) in rows.iter().enumerate() {
                if row.len() < 5 {
                    return Err(SqlError::WrongArity("sessions row", 5, row.len()));
                }
                let key = (
                    parse_ulid(&row[0]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
                    parse_ulid(&row[1]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
                    parse_date(&row[2]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
                );
                match header {
                    None => header = Some(key),
                    Some(h) if h != key => {
                        return Err(SqlError::Unsupported(
                            "session rows must share purchase, user and date".into(),
                        ));
                    }
                    Some(_) => {}
                }
                slots.push((parse_minute(&row[3])?, parse_minute(&row[4])?));
            }
            let (purchase_id, user_id, date) =
                header.ok_or(SqlError::Parse("empty VALUES".into()))?;
            Ok(Command::InsertSessions {
                purchase_id,
                user_id,
                date,
                slots,
            })
        }
        "feedback" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("feedback", 5, values.len()));
            }
            let rating = parse_i64(&values[3])?;
            Ok(Command::InsertFeedback {
                id: parse_ulid(&values[0])?,
                purchase_id: parse_ulid(&values[1])?,
                user_id: parse_ulid(&values[2])?,
                rating: u8::try_from(rating)
                    .map_err(|_| SqlError::Parse(format!("{rating} out of rating range")))?,
                text: parse_string(&values[4])?,
            })
        }
        "payouts" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("payouts", 4, values.len()));
            }
            Ok(Command::InsertPayout {
                id: parse_ulid(&values[0])?,
                expert_id: parse_ulid(&values[1])?,
                amount: parse_i64(&values[2])?,
                note: parse_string(&values[3])?,
            })
        }
        "client_payments" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("client_payments", 4, values.len()));
            }
            Ok(Command::InsertClientPayment {
                id: parse_ulid(&values[0])?,
                user_id: parse_ulid(&values[1])?,
                amount: parse_i64(&values[2])?,
                note: parse_string(&values[3])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "overrides" => Ok(Command::DeleteOverride { id }),
        "windows" => Ok(Command::DeleteWindow { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `UPDATE sessions SET cancelled_by = '<user>', cancel_reason = '<text>'
/// WHERE id = '<ulid>'` is the cancellation request.
fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    if table != "sessions" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut by_user = None;
    let mut reason = String::new();
    for assignment in assignments {
        let col = assignment_column(&assignment.target)
            .ok_or_else(|| SqlError::Parse("bad assignment target".into()))?;
        match col.as_str() {
            "cancelled_by" => by_user = Some(parse_ulid(&assignment.value)?),
            "cancel_reason" => reason = parse_string(&assignment.value)?,
            other => {
                return Err(SqlError::Unsupported(format!(
                    "cannot update column {other}"
                )));
            }
        }
    }

    Ok(Command::CancelSession {
        id: extract_where_id(selection)?,
        by_user: by_user.ok_or(SqlError::MissingFilter("cancelled_by"))?,
        reason,
    })
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

    match table.as_str() {
        "slots" => {
            let (mut expert_id, mut date) = (None, None);
            if let Some(selection) = &select.selection {
                extract_slot_filters(selection, &mut expert_id, &mut date)?;
            }
            Ok(Command::SelectSlots {
                expert_id: expert_id.ok_or(SqlError::MissingFilter("expert_id"))?,
                date: date.ok_or(SqlError::MissingFilter("date"))?,
            })
        }
        "experts" => Ok(Command::SelectExperts),
        "sessions" => {
            let (mut purchase_id, mut user_id) = (None, None);
            if let Some(selection) = &select.selection {
                extract_session_filters(selection, &mut purchase_id, &mut user_id)?;
            }
            if purchase_id.is_none() && user_id.is_none() {
                return Err(SqlError::MissingFilter("purchase_id or user_id"));
            }
            Ok(Command::SelectSessions {
                purchase_id,
                user_id,
            })
        }
        "purchases" => {
            let (mut user_id, mut unused) = (None, None);
            if let Some(selection) = &select.selection {
                extract_session_filters(selection, &mut unused, &mut user_id)?;
            }
            Ok(Command::SelectPurchases {
                user_id: user_id.ok_or(SqlError::MissingFilter("user_id"))?,
            })
        }
        "earnings" => Ok(Command::SelectEarnings),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_slot_filters(
    expr: &Expr,
    expert_id: &mut Option<Ulid>,
    date: &mut Option<NaiveDate>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_slot_filters(left, expert_id, date)?;
                extract_slot_filters(right, expert_id, date)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("expert_id") => *expert_id = Some(parse_ulid(right)?),
                Some("date") => *date = Some(parse_date(right)?),
                _ => {}
            },
            _ => {}
        }
    }
    Ok(())
}

fn extract_session_filters(
    expr: &Expr,
    purchase_id: &mut Option<Ulid>,
    user_id: &mut Option<Ulid>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_session_filters(left, purchase_id, user_id)?;
                extract_session_filters(right, purchase_id, user_id)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("purchase_id") => *purchase_id = Some(parse_ulid(right)?),
                Some("user_id") => *user_id = Some(parse_ulid(right)?),
                _ => {}
            },
            _ => {}
        }
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

fn assignment_column(target: &ast::AssignmentTarget) -> Option<String> {
    match target {
        ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
        _ => None,
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
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
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    s.parse()
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_domain(expr: &Expr) -> Result<Domain, SqlError> {
    let s = parse_string(expr)?;
    Domain::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad domain: {s}")))
}

fn parse_workdays(expr: &Expr) -> Result<Vec<u8>, SqlError> {
    let s = parse_string(expr)?;
    s.split(',')
        .map(|p| {
            p.trim()
                .parse()
                .map_err(|_| SqlError::Parse(format!("bad workdays: {s}")))
        })
        .collect()
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad f64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_minute(expr: &Expr) -> Result<Minute, SqlError> {
    let v = parse_i64(expr)?;
    Minute::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of minute range")))
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
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
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
