use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        name: String,
        kind: String,
    },
    UpdateResource {
        id: Ulid,
        name: String,
        kind: String,
    },
    DeleteResource {
        id: Ulid,
    },
    InsertEvent {
        id: Ulid,
        title: String,
        start: Ms,
        end: Ms,
        description: Option<String>,
        resource_ids: Vec<Ulid>,
    },
    UpdateEvent {
        id: Ulid,
        title: Option<String>,
        window: Option<(Ms, Ms)>,
        description: Option<Option<String>>,
    },
    DeleteEvent {
        id: Ulid,
    },
    InsertAllocations {
        event_id: Ulid,
        resource_ids: Vec<Ulid>,
    },
    DeleteAllocation {
        id: Ulid,
    },
    SelectResources,
    SelectEvents,
    SelectAllocations {
        resource_id: Option<Ulid>,
    },
    SelectUsage {
        start: Ms,
        end: Ms,
    },
    SelectConflicts {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_event: Option<Ulid>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "resources" => {
            let values = extract_insert_values(insert)?;
            if values.len() < 3 {
                return Err(SqlError::WrongArity("resources", 3, values.len()));
            }
            Ok(Command::InsertResource {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                kind: parse_string(&values[2])?,
            })
        }
        "events" => {
            let values = extract_insert_values(insert)?;
            if values.len() < 4 {
                return Err(SqlError::WrongArity("events", 4, values.len()));
            }
            let description = if values.len() >= 5 {
                parse_string_or_null(&values[4])?
            } else {
                None
            };
            let resource_ids = if values.len() >= 6 {
                parse_ulid_list(&values[5])?
            } else {
                Vec::new()
            };
            Ok(Command::InsertEvent {
                id: parse_ulid(&values[0])?,
                title: parse_string(&values[1])?,
                start: parse_i64(&values[2])?,
                end: parse_i64(&values[3])?,
                description,
                resource_ids,
            })
        }
        "allocations" => {
            // Multi-row form: one row per resource, all for the same event.
            let rows = extract_all_insert_rows(insert)?;
            let mut event_id = None;
            let mut resource_ids = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                if row.len() < 2 {
                    return Err(SqlError::WrongArity("allocations row", 2, row.len()));
                }
                let eid = parse_ulid(&row[0])
                    .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                match event_id {
                    None => event_id = Some(eid),
                    Some(prev) if prev != eid => {
                        return Err(SqlError::Parse(
                            "all allocation rows must target the same event".into(),
                        ));
                    }
                    Some(_) => {}
                }
                resource_ids.push(
                    parse_ulid(&row[1]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
                );
            }
            Ok(Command::InsertAllocations {
                event_id: event_id.ok_or(SqlError::Empty)?,
                resource_ids,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "resources" => {
            let mut name = None;
            let mut kind = None;
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "name" => name = Some(parse_string(&a.value)?),
                    "kind" => kind = Some(parse_string(&a.value)?),
                    col => return Err(SqlError::Parse(format!("unknown column: {col}"))),
                }
            }
            Ok(Command::UpdateResource {
                id,
                name: name.ok_or(SqlError::MissingFilter("name"))?,
                kind: kind.ok_or(SqlError::MissingFilter("kind"))?,
            })
        }
        "events" => {
            let mut title = None;
            let mut start = None;
            let mut end = None;
            let mut description = None;
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "title" => title = Some(parse_string(&a.value)?),
                    "start" => start = Some(parse_i64(&a.value)?),
                    "end" => end = Some(parse_i64(&a.value)?),
                    "description" => description = Some(parse_string_or_null(&a.value)?),
                    col => return Err(SqlError::Parse(format!("unknown column: {col}"))),
                }
            }
            let window = match (start, end) {
                (Some(s), Some(e)) => Some((s, e)),
                (None, None) => None,
                _ => {
                    return Err(SqlError::Parse(
                        "start and end must be updated together".into(),
                    ));
                }
            };
            Ok(Command::UpdateEvent {
                id,
                title,
                window,
                description,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        "events" => Ok(Command::DeleteEvent { id }),
        "allocations" => Ok(Command::DeleteAllocation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Optional filters collected from a WHERE clause.
#[derive(Default)]
struct Filters {
    resource_id: Option<Ulid>,
    exclude_event: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "resources" => Ok(Command::SelectResources),
        "events" => Ok(Command::SelectEvents),
        "allocations" => Ok(Command::SelectAllocations {
            resource_id: filters.resource_id,
        }),
        "usage" => Ok(Command::SelectUsage {
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        "conflicts" => Ok(Command::SelectConflicts {
            resource_id: filters
                .resource_id
                .ok_or(SqlError::MissingFilter("resource_id"))?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
            exclude_event: filters.exclude_event,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left);
                if col.as_deref() == Some("resource_id") {
                    filters.resource_id = Some(parse_ulid_expr(right)?);
                } else if col.as_deref() == Some("exclude_event") {
                    filters.exclude_event = Some(parse_ulid_expr(right)?);
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    filters.start = Some(parse_i64_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    filters.end = Some(parse_i64_expr(right)?);
                }
            }
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

fn assignment_column(a: &ast::Assignment) -> Result<String, SqlError> {
    match &a.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
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
                parse_ulid_expr(right)
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
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

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
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
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
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
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) => Ok(Some(s.clone())),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Comma-separated ULID list packed into one string value. NULL or the empty
/// string means no resources.
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    match parse_string_or_null(expr)? {
        None => Ok(Vec::new()),
        Some(s) if s.trim().is_empty() => Ok(Vec::new()),
        Some(s) => s
            .split(',')
            .map(|part| {
                Ulid::from_string(part.trim())
                    .map_err(|e| SqlError::Parse(format!("bad ULID in list: {e}")))
            })
            .collect(),
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
