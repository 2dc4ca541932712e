//! Rendering of predicates and query intents as SQL

use ps_core::predicate::{Aggregate, OrderBy, SortDirection};
use ps_core::{Predicate, QueryIntent, SelectIntent, Value};

/// Quote an identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Every table column an intent refers to
pub fn intent_columns(intent: &QueryIntent) -> Vec<&str> {
    let mut columns = intent.predicate().columns();
    match intent {
        QueryIntent::Select(select) => {
            columns.extend(select.projection.iter().map(String::as_str));
            columns.extend(select.order_by.iter().map(|o| o.column.as_str()));
        }
        QueryIntent::Distinct { column, .. } => columns.push(column),
        QueryIntent::Aggregate {
            aggregates,
            group_by,
            ..
        } => {
            columns.extend(aggregates.iter().filter_map(|a| a.column.as_deref()));
            columns.extend(group_by.iter().map(String::as_str));
        }
    }
    columns.sort_unstable();
    columns.dedup();
    columns
}

/// Render a literal. Non-finite floats become NULL.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => float_literal(*f),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

fn float_literal(f: f64) -> String {
    if f.is_finite() {
        // keep a decimal point so SQLite treats it as REAL
        format!("{:?}", f)
    } else {
        "NULL".to_string()
    }
}

/// Render a predicate as a boolean SQL expression
pub fn render_predicate(predicate: &Predicate) -> String {
    match predicate {
        Predicate::True => "1".to_string(),
        Predicate::Eq { column, value } => {
            if value.is_null() {
                format!("{} IS NULL", quote_ident(column))
            } else {
                format!("{} = {}", quote_ident(column), literal(value))
            }
        }
        Predicate::In { column, values } => {
            if values.is_empty() {
                return "0".to_string();
            }
            let list: Vec<String> = values.iter().map(literal).collect();
            format!("{} IN ({})", quote_ident(column), list.join(", "))
        }
        Predicate::Between { column, low, high } => format!(
            "{} BETWEEN {} AND {}",
            quote_ident(column),
            float_literal(*low),
            float_literal(*high)
        ),
        Predicate::Gte { column, value } => {
            format!("{} >= {}", quote_ident(column), float_literal(*value))
        }
        Predicate::Lte { column, value } => {
            format!("{} <= {}", quote_ident(column), float_literal(*value))
        }
        Predicate::NotNull { column } => format!("{} IS NOT NULL", quote_ident(column)),
        Predicate::And { predicates } => join(predicates, " AND ", "1"),
        Predicate::Or { predicates } => join(predicates, " OR ", "0"),
        Predicate::Not { predicate } => format!("NOT ({})", render_predicate(predicate)),
    }
}

fn join(predicates: &[Predicate], sep: &str, empty: &str) -> String {
    if predicates.is_empty() {
        return empty.to_string();
    }
    let parts: Vec<String> = predicates
        .iter()
        .map(|p| format!("({})", render_predicate(p)))
        .collect();
    parts.join(sep)
}

fn where_clause(predicate: &Predicate) -> String {
    if predicate.is_true() {
        String::new()
    } else {
        format!(" WHERE {}", render_predicate(predicate))
    }
}

/// Position column added while sampling
const SAMPLE_POSITION: &str = "\"sample_position\"";

/// Keep every n-th row to stay at or below the requested percentage
fn sample_step(percent: f64) -> Option<u64> {
    if !percent.is_finite() || percent <= 0.0 || percent >= 100.0 {
        return None;
    }
    Some((100.0 / percent - 1e-9).ceil().max(1.0) as u64)
}

fn projection_list(columns: &[String]) -> String {
    if columns.is_empty() {
        "*".to_string()
    } else {
        columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn order_clause(order_by: &[OrderBy]) -> String {
    if order_by.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = order_by
        .iter()
        .map(|o| {
            let dir = match o.direction {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            format!("{} {}", quote_ident(&o.column), dir)
        })
        .collect();
    format!(" ORDER BY {}", parts.join(", "))
}

/// Render a select over one or more tables. Several tables are combined
/// with `UNION ALL`, so their projected columns must line up.
///
/// A sample keeps every n-th row of the filtered result, counted by
/// position, so it never depends on where the matching rows sit in the
/// tables. Sampled selects need an explicit projection; with `*` the
/// position column is returned too.
pub fn render_select(tables: &[String], select: &SelectIntent) -> String {
    let projection = projection_list(&select.projection);
    let filter = where_clause(&select.predicate);
    let parts: Vec<String> = tables
        .iter()
        .map(|t| format!("SELECT {} FROM {}{}", projection, quote_ident(t), filter))
        .collect();

    let mut sql = parts.join(" UNION ALL ");
    if let Some(step) = select.sample_percent.and_then(sample_step) {
        sql = format!(
            "SELECT {projection} FROM (SELECT *, ROW_NUMBER() OVER () AS {pos} FROM ({sql})) WHERE ({pos} - 1) % {step} = 0",
            projection = projection,
            pos = SAMPLE_POSITION,
            sql = sql,
            step = step
        );
    }
    sql.push_str(&order_clause(&select.order_by));
    if let Some(limit) = select.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    sql
}

/// Distinct non-null values of one column across the tables, ascending
pub fn render_distinct(tables: &[String], column: &str, predicate: &Predicate) -> String {
    let col = quote_ident(column);
    let filter = where_clause(&Predicate::and([predicate.clone(), Predicate::not_null(column)]));
    let parts: Vec<String> = tables
        .iter()
        .map(|t| format!("SELECT DISTINCT {} FROM {}{}", col, quote_ident(t), filter))
        .collect();
    format!("{} ORDER BY 1", parts.join(" UNION "))
}

fn aggregate_expr(aggregate: &Aggregate) -> String {
    let arg = aggregate
        .column
        .as_deref()
        .map(quote_ident)
        .unwrap_or_else(|| "*".to_string());
    format!(
        "{}({}) AS {}",
        aggregate.func.sql_name(),
        arg,
        quote_ident(&aggregate.alias)
    )
}

/// Grouped aggregation over the union of the tables
pub fn render_aggregate(
    tables: &[String],
    aggregates: &[Aggregate],
    group_by: &[String],
    predicate: &Predicate,
) -> String {
    let mut needed: Vec<String> = group_by.to_vec();
    for a in aggregates {
        if let Some(c) = &a.column {
            if !needed.contains(c) {
                needed.push(c.clone());
            }
        }
    }
    // COUNT(*) alone still needs one column to select from each table
    let inner_projection = if needed.is_empty() {
        "1 AS \"_one\"".to_string()
    } else {
        projection_list(&needed)
    };
    let filter = where_clause(predicate);
    let source: Vec<String> = tables
        .iter()
        .map(|t| format!("SELECT {} FROM {}{}", inner_projection, quote_ident(t), filter))
        .collect();

    let mut select_list: Vec<String> = group_by.iter().map(|g| quote_ident(g)).collect();
    select_list.extend(aggregates.iter().map(aggregate_expr));

    let mut sql = format!(
        "SELECT {} FROM ({})",
        select_list.join(", "),
        source.join(" UNION ALL ")
    );
    if !group_by.is_empty() {
        let groups = projection_list(group_by);
        sql.push_str(&format!(" GROUP BY {} ORDER BY {}", groups, groups));
    }
    sql
}

/// Render any intent against the given tables
pub fn render_intent(tables: &[String], intent: &QueryIntent) -> String {
    match intent {
        QueryIntent::Select(select) => render_select(tables, select),
        QueryIntent::Distinct { column, predicate } => render_distinct(tables, column, predicate),
        QueryIntent::Aggregate {
            aggregates,
            group_by,
            predicate,
        } => render_aggregate(tables, aggregates, group_by, predicate),
    }
}
