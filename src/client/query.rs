//! The query (SQL++) service client (spec §4.A "http" "query" specialization, §4.E): request
//! shaping, row streaming at `/results/^`, and the shared prepared-statement cache.
//!
//! Grounded in `original_source/core/impl/query.cxx`'s adhoc/prepared split: a non-adhoc
//! statement is prepared once (`PREPARE <statement>`), the server-assigned plan name is cached,
//! and every later execution submits `{"prepared": name}` instead of the raw statement text.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{query_error_kind, Error, Result};
use crate::runtime::stream::StreamOptions;
use crate::wire::http::HttpMethod;

use super::http;

const QUERY_PATH: &str = "/query/service";

/// Per-call query configuration (spec §6 query-specific inputs).
#[derive(Clone, Debug)]
pub struct QueryOptions {
    /// Positional arguments substituted for `$1`, `$2`, ... (sent as the `args` array).
    pub positional_args: Vec<Value>,
    /// Named arguments substituted for `$name`.
    pub named_args: HashMap<String, Value>,
    /// Run the statement directly (`true`, the default) instead of through the
    /// prepare-then-cache path (`false`).
    pub adhoc: bool,
    /// Opaque id echoed back by the server, for correlating concurrent requests.
    pub client_context_id: Option<String>,
    /// Scope/collection query context, in `bucket`.`scope` form.
    pub query_context: Option<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            positional_args: Vec::new(),
            named_args: HashMap::new(),
            adhoc: true,
            client_context_id: None,
            query_context: None,
        }
    }
}

/// The result of a query (spec Non-goals: shaping rows into typed values stays the caller's
/// job; this crate hands back the raw JSON values streamed from `/results/^`).
#[derive(Clone, Debug)]
pub struct QueryResult {
    /// Rows decoded from the response body.
    pub rows: Vec<Value>,
    /// The `client_context_id` the caller supplied, echoed back for correlation.
    pub client_context_id: Option<String>,
}

/// The shared `statement_text → prepared_name` cache (spec §4.E: "a brief write on cache miss,
/// reads dominate"). A `tokio::sync::Mutex` rather than a `std` one since population awaits an
/// HTTP round trip while held.
#[derive(Default)]
pub(crate) struct PreparedStatementCache {
    entries: Mutex<HashMap<String, String>>,
}

impl PreparedStatementCache {
    async fn get(&self, statement: &str) -> Option<String> {
        self.entries.lock().await.get(statement).cloned()
    }

    async fn insert(&self, statement: String, prepared_name: String) {
        self.entries.lock().await.insert(statement, prepared_name);
    }
}

fn body_for(field: &str, value: Value, options: &QueryOptions) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(field.to_string(), value);
    if !options.positional_args.is_empty() {
        map.insert("args".into(), Value::Array(options.positional_args.clone()));
    }
    for (name, value) in &options.named_args {
        map.insert(format!("${name}"), value.clone());
    }
    if let Some(id) = &options.client_context_id {
        map.insert("client_context_id".into(), Value::String(id.clone()));
    }
    if let Some(ctx) = &options.query_context {
        map.insert("query_context".into(), Value::String(ctx.clone()));
    }
    Value::Object(map)
}

fn encode_body(value: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::internal(format!("failed to encode query request body: {e}")))
}

fn extract_prepared_name(body: &[u8]) -> Result<String> {
    let parsed: Value = serde_json::from_slice(body)
        .map_err(|e| Error::parsing_failure(format!("malformed PREPARE response: {e}")))?;
    parsed
        .get("results")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|row| row.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::parsing_failure("PREPARE response carried no plan name"))
}

/// Builds an error from the query service's own error envelope (`{"errors": [{"code", "msg"}]}`)
/// rather than synthesizing one from the bare HTTP status, per the documented error-code table.
fn error_from_body(body: &[u8]) -> Error {
    let Ok(parsed) = serde_json::from_slice::<Value>(body) else {
        return Error::parsing_failure("query service returned a non-JSON error body");
    };
    let first = parsed.get("errors").and_then(Value::as_array).and_then(|e| e.first());
    let code = first.and_then(|e| e.get("code")).and_then(Value::as_i64).unwrap_or(0);
    let message = first
        .and_then(|e| e.get("msg"))
        .and_then(Value::as_str)
        .unwrap_or("query service reported an error")
        .to_string();
    Error::new(query_error_kind(code, message))
}

/// Runs one query end to end, including the prepare-and-cache round trip on a non-adhoc cache
/// miss (spec scenario S5).
pub(crate) async fn execute(
    cache: &PreparedStatementCache,
    stream_options: StreamOptions,
    host_header: &str,
    statement: &str,
    options: &QueryOptions,
    deadline: Instant,
) -> Result<QueryResult> {
    let body = if options.adhoc {
        body_for("statement", Value::String(statement.to_string()), options)
    } else if let Some(name) = cache.get(statement).await {
        body_for("prepared", Value::String(name), options)
    } else {
        let prepare_body = body_for("statement", Value::String(format!("PREPARE {statement}")), options);
        let response = http::execute(
            stream_options.clone(),
            HttpMethod::Post,
            QUERY_PATH,
            host_header,
            &[],
            &encode_body(&prepare_body)?,
            None,
            deadline,
        )
        .await?;
        if response.status >= 400 {
            return Err(error_from_body(&response.body));
        }
        let name = extract_prepared_name(&response.body)?;
        cache.insert(statement.to_string(), name.clone()).await;
        body_for("prepared", Value::String(name), options)
    };

    let response = http::execute(
        stream_options,
        HttpMethod::Post,
        QUERY_PATH,
        host_header,
        &[],
        &encode_body(&body)?,
        Some("/results/^"),
        deadline,
    )
    .await?;

    if response.status >= 400 {
        return Err(error_from_body(&response.body));
    }

    Ok(QueryResult {
        rows: response.rows,
        client_context_id: options.client_context_id.clone(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn body_for_statement_omits_prepared_and_vice_versa() {
        let options = QueryOptions::default();
        let statement_body = body_for("statement", Value::String("SELECT 1".into()), &options);
        assert!(statement_body.get("statement").is_some());
        assert!(statement_body.get("prepared").is_none());

        let prepared_body = body_for("prepared", Value::String("plan-1".into()), &options);
        assert!(prepared_body.get("prepared").is_some());
        assert!(prepared_body.get("statement").is_none());
    }

    #[test]
    fn extract_prepared_name_reads_the_first_result_row() {
        let body = br#"{"results":[{"name":"plan-42"}]}"#;
        assert_eq!(extract_prepared_name(body).unwrap(), "plan-42");
    }

    #[test]
    fn extract_prepared_name_rejects_a_body_without_one() {
        let body = br#"{"results":[]}"#;
        assert!(extract_prepared_name(body).is_err());
    }

    #[tokio::test]
    async fn cache_miss_then_hit_round_trips_through_insert() {
        let cache = PreparedStatementCache::default();
        assert!(cache.get("SELECT 1 AS x").await.is_none());
        cache.insert("SELECT 1 AS x".to_string(), "plan-1".to_string()).await;
        assert_eq!(cache.get("SELECT 1 AS x").await.as_deref(), Some("plan-1"));
    }
}
