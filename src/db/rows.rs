//! Row materialization and parameter conversion.
//!
//! Query results leave the storage core as JSON objects keyed by column name so
//! they can be cached once and decoded into any `serde` type by the caller.
//! Parameters travel as owned [`rusqlite::types::Value`]s so they can cross
//! into blocking tasks.

use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection};

/// One result row: column name → JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Run a query and materialize every row.
///
/// Uses the connection's prepared-statement cache, so repeated query shapes
/// on the same connection skip re-preparation.
pub fn query_rows(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (idx, name) in columns.iter().enumerate() {
            record.insert(name.clone(), value_ref_to_json(row.get_ref(idx)?));
        }
        out.push(record);
    }
    Ok(out)
}

/// Convert a borrowed SQLite value to JSON. Blobs become arrays of bytes.
pub fn value_ref_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::Value::Array(
            bytes.iter().map(|b| serde_json::Value::from(*b)).collect(),
        ),
    }
}

/// Convert an owned SQLite value to JSON.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    value_ref_to_json(ValueRef::from(value))
}

/// Convert a JSON parameter to a SQLite value.
///
/// Booleans bind as 0/1; arrays and objects bind as their JSON text.
pub fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Real(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_keyed_by_column_name() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER, name TEXT, score REAL, data BLOB);
             INSERT INTO t VALUES (1, 'alpha', 0.5, x'0102');
             INSERT INTO t VALUES (2, NULL, NULL, NULL);",
        )
        .unwrap();

        let rows = query_rows(&conn, "SELECT * FROM t ORDER BY id", &[]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], 1);
        assert_eq!(rows[0]["name"], "alpha");
        assert_eq!(rows[0]["score"], 0.5);
        assert_eq!(rows[0]["data"], serde_json::json!([1, 2]));
        assert!(rows[1]["name"].is_null());
    }

    #[test]
    fn params_bind_positionally() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER, name TEXT); INSERT INTO t VALUES (7, 'x');")
            .unwrap();

        let rows = query_rows(
            &conn,
            "SELECT name FROM t WHERE id = ?1",
            &[Value::Integer(7)],
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "x");
    }

    #[test]
    fn json_params_convert() {
        assert_eq!(json_to_value(&serde_json::json!(true)), Value::Integer(1));
        assert_eq!(json_to_value(&serde_json::json!(3)), Value::Integer(3));
        assert_eq!(json_to_value(&serde_json::json!(1.5)), Value::Real(1.5));
        assert_eq!(json_to_value(&serde_json::json!("s")), Value::Text("s".into()));
        assert_eq!(
            json_to_value(&serde_json::json!(["a"])),
            Value::Text("[\"a\"]".into())
        );
    }
}
