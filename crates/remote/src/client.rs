//! REST client for a PostgREST-style backend.
//!
//! Collections map to `{base_url}/{collection}`. Filters travel in the query
//! string as `field=op.value`, ordering as `order=field.asc,field.desc`, and
//! writes ask for the affected rows back with `Prefer: return=representation`.

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;

use ledgerly_core::entities::{Entity, Payload, ID_FIELD};
use ledgerly_core::sync::{Filter, FilterOp, Query, RemoteStore, Target};

use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};

const MAX_LOG_BODY_CHARS: usize = 512;
const PREFER_REPRESENTATION: &str = "return=representation";

fn is_reserved(text: &str) -> bool {
    text.contains([',', '(', ')', '"', ':']) || text.trim() != text
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Element of an `in.(...)` list; quoted when it would break the list syntax.
fn list_item(value: &Value) -> String {
    match value {
        Value::String(s) if is_reserved(s) => {
            format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
        }
        other => scalar(other),
    }
}

fn filter_value(filter: &Filter) -> String {
    match (filter.op, &filter.value) {
        (FilterOp::Eq, Value::Null) => "is.null".to_string(),
        (FilterOp::Neq, Value::Null) => "not.is.null".to_string(),
        (FilterOp::In, Value::Array(items)) => {
            let items: Vec<String> = items.iter().map(list_item).collect();
            format!("in.({})", items.join(","))
        }
        (FilterOp::In, other) => format!("in.({})", list_item(other)),
        (FilterOp::Ilike, value) => format!("ilike.{}", scalar(value).replace('%', "*")),
        (op, value) => format!("{}.{}", op.keyword(), scalar(value)),
    }
}

fn encode_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn filter_pairs(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|f| (f.field.clone(), filter_value(f)))
        .collect()
}

/// Query string for a select: columns, filters, ordering and limit.
fn select_query(query: &Query) -> String {
    let mut pairs = vec![("select".to_string(), "*".to_string())];
    pairs.extend(filter_pairs(&query.filters));
    if !query.order.is_empty() {
        let order = query
            .order
            .iter()
            .map(|o| {
                let direction = if o.ascending { "asc" } else { "desc" };
                format!("{}.{}", o.field, direction)
            })
            .collect::<Vec<_>>()
            .join(",");
        pairs.push(("order".to_string(), order));
    }
    if let Some(limit) = query.limit {
        pairs.push(("limit".to_string(), limit.to_string()));
    }
    encode_pairs(&pairs)
}

fn rows_from_body(body: Value) -> Result<Vec<Entity>> {
    let rows = match body {
        Value::Array(rows) => rows,
        row @ Value::Object(_) => vec![row],
        Value::Null => Vec::new(),
        other => {
            return Err(RemoteError::api(
                200,
                format!("Unexpected response shape: {}", other),
            ))
        }
    };
    rows.into_iter()
        .map(|row| {
            Entity::from_value(row).map_err(|e| RemoteError::api(200, e.to_string()))
        })
        .collect()
}

/// [`RemoteStore`] over HTTP.
#[derive(Debug, Clone)]
pub struct RestStoreClient {
    client: reqwest::Client,
    config: RemoteConfig,
}

impl RestStoreClient {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url,
            urlencoding::encode(collection)
        )
    }

    fn headers(&self, prefer_representation: bool) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let api_key = HeaderValue::from_str(&self.config.api_key)
            .map_err(|_| RemoteError::auth("Invalid api key format"))?;
        headers.insert("apikey", api_key);
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.config.bearer()))
            .map_err(|_| RemoteError::auth("Invalid access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        if prefer_representation {
            headers.insert("Prefer", HeaderValue::from_static(PREFER_REPRESENTATION));
        }
        Ok(headers)
    }

    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("[RemoteStore] Response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("[RemoteStore] Response error ({}): {}", status, preview);
    }

    /// Read the body, turning non-success statuses into [`RemoteError::Api`].
    async fn parse_response(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| format!("Request failed: {}", body));
            return Err(RemoteError::api(status.as_u16(), message));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// GET /{collection}?select=*&...
    pub async fn select_rows(&self, collection: &str, query: &Query) -> Result<Vec<Entity>> {
        let url = format!("{}?{}", self.collection_url(collection), select_query(query));
        debug!("[RemoteStore] select URL: {}", url);

        let response = self
            .client
            .get(&url)
            .headers(self.headers(false)?)
            .send()
            .await?;

        rows_from_body(Self::parse_response(response).await?)
    }

    /// POST /{collection}
    pub async fn insert_row(&self, collection: &str, mut row: Payload) -> Result<Entity> {
        row.remove(ID_FIELD);
        let url = self.collection_url(collection);

        let response = self
            .client
            .post(&url)
            .headers(self.headers(true)?)
            .json(&row)
            .send()
            .await?;

        rows_from_body(Self::parse_response(response).await?)?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::api(200, "Insert returned no row"))
    }

    /// PATCH /{collection}?{target}
    pub async fn update_rows(
        &self,
        collection: &str,
        target: &Target,
        mut patch: Payload,
    ) -> Result<Vec<Entity>> {
        patch.remove(ID_FIELD);
        let filters = target.to_filters();
        if filters.is_empty() {
            return Err(RemoteError::invalid_request("Refusing an unfiltered update"));
        }
        let url = format!(
            "{}?{}",
            self.collection_url(collection),
            encode_pairs(&filter_pairs(&filters))
        );

        let response = self
            .client
            .patch(&url)
            .headers(self.headers(true)?)
            .json(&patch)
            .send()
            .await?;

        rows_from_body(Self::parse_response(response).await?)
    }

    /// DELETE /{collection}?{target}
    pub async fn delete_rows(&self, collection: &str, target: &Target) -> Result<()> {
        let filters = target.to_filters();
        if filters.is_empty() {
            return Err(RemoteError::invalid_request("Refusing an unfiltered delete"));
        }
        let url = format!(
            "{}?{}",
            self.collection_url(collection),
            encode_pairs(&filter_pairs(&filters))
        );

        let response = self
            .client
            .delete(&url)
            .headers(self.headers(false)?)
            .send()
            .await?;

        Self::parse_response(response).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for RestStoreClient {
    async fn select(&self, collection: &str, query: &Query) -> ledgerly_core::Result<Vec<Entity>> {
        Ok(self.select_rows(collection, query).await?)
    }

    async fn insert(&self, collection: &str, row: Payload) -> ledgerly_core::Result<Entity> {
        Ok(self.insert_row(collection, row).await?)
    }

    async fn update(
        &self,
        collection: &str,
        target: &Target,
        patch: Payload,
    ) -> ledgerly_core::Result<Vec<Entity>> {
        Ok(self.update_rows(collection, target, patch).await?)
    }

    async fn delete(&self, collection: &str, target: &Target) -> ledgerly_core::Result<()> {
        Ok(self.delete_rows(collection, target).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerly_core::entities::EntityId;
    use ledgerly_core::sync::Order;
    use ledgerly_core::Error;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Debug, Clone)]
    struct CapturedRequest {
        method: String,
        target: String,
        headers: HashMap<String, String>,
        body: String,
    }

    #[derive(Debug, Clone)]
    enum MockOutcome {
        DropConnection,
        Respond { status: u16, body: String },
    }

    fn header_end_offset(buffer: &[u8]) -> Option<usize> {
        buffer.windows(4).position(|window| window == b"\r\n\r\n")
    }

    async fn read_http_request(stream: &mut tokio::net::TcpStream) -> Option<CapturedRequest> {
        let mut buffer = Vec::new();
        loop {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                return None;
            }
            buffer.extend_from_slice(&chunk[..read]);
            if header_end_offset(&buffer).is_some() {
                break;
            }
        }

        let header_end = header_end_offset(&buffer)?;
        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let mut lines = head.lines();
        let mut request_line = lines.next()?.split_whitespace();
        let method = request_line.next()?.to_string();
        let target = request_line.next()?.to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let content_length = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = buffer[header_end + 4..].to_vec();
        while body.len() < content_length {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }

        Some(CapturedRequest {
            method,
            target,
            headers,
            body: String::from_utf8_lossy(&body).to_string(),
        })
    }

    fn status_text(status: u16) -> &'static str {
        match status {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            409 => "Conflict",
            503 => "Service Unavailable",
            _ => "Error",
        }
    }

    async fn write_http_response(
        stream: &mut tokio::net::TcpStream,
        status: u16,
        body: &str,
    ) -> std::io::Result<()> {
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            status_text(status),
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await
    }

    async fn start_mock_server(
        outcomes: Vec<MockOutcome>,
    ) -> (
        String,
        Arc<TokioMutex<Vec<CapturedRequest>>>,
        tokio::task::JoinHandle<()>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        let captured = Arc::new(TokioMutex::new(Vec::<CapturedRequest>::new()));
        let scripted = Arc::new(TokioMutex::new(VecDeque::from(outcomes)));
        let captured_clone = Arc::clone(&captured);
        let scripted_clone = Arc::clone(&scripted);

        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(value) => value,
                    Err(_) => break,
                };
                let captured_inner = Arc::clone(&captured_clone);
                let scripted_inner = Arc::clone(&scripted_clone);
                tokio::spawn(async move {
                    let Some(request) = read_http_request(&mut stream).await else {
                        return;
                    };
                    captured_inner.lock().await.push(request);

                    let outcome = scripted_inner.lock().await.pop_front().unwrap_or(
                        MockOutcome::Respond {
                            status: 500,
                            body: r#"{"message":"unexpected request"}"#.to_string(),
                        },
                    );
                    match outcome {
                        MockOutcome::DropConnection => {}
                        MockOutcome::Respond { status, body } => {
                            let _ = write_http_response(&mut stream, status, &body).await;
                        }
                    }
                });
            }
        });

        (format!("http://{}/rest/v1", addr), captured, handle)
    }

    fn client(base_url: &str) -> RestStoreClient {
        let config = RemoteConfig::new(base_url, "anon-key")
            .with_access_token("user-jwt")
            .with_timeout(Duration::from_secs(5));
        RestStoreClient::new(config).expect("client")
    }

    fn row(value: Value) -> Payload {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn select_query_encodes_filters_order_and_limit() {
        let query = Query::new()
            .filter(Filter::new("date", FilterOp::Gte, "2024-01-01"))
            .filter(Filter::eq("category", "Food & Drink"))
            .filter(Filter::eq("payment_method", Value::Null))
            .order_by(Order::desc("date"))
            .order_by(Order::asc("amount"))
            .limit(50);

        assert_eq!(
            select_query(&query),
            "select=%2A&date=gte.2024-01-01&category=eq.Food%20%26%20Drink\
             &payment_method=is.null&order=date.desc%2Camount.asc&limit=50"
        );
    }

    #[test]
    fn list_and_pattern_filters_use_postgrest_syntax() {
        let within = Filter::new("category", FilterOp::In, json!(["Food", "Rent, flat", 3]));
        assert_eq!(filter_value(&within), r#"in.(Food,"Rent, flat",3)"#);

        let like = Filter::new("description", FilterOp::Ilike, "%coffee%");
        assert_eq!(filter_value(&like), "ilike.*coffee*");

        let not_null = Filter::new("description", FilterOp::Neq, Value::Null);
        assert_eq!(filter_value(&not_null), "not.is.null");
    }

    #[tokio::test]
    async fn insert_strips_id_and_returns_the_stored_row() {
        let (base_url, captured, server) = start_mock_server(vec![MockOutcome::Respond {
            status: 201,
            body: r#"[{"id":17,"date":"2024-01-05","amount":42.5,"category":"Food"}]"#.to_string(),
        }])
        .await;

        let entity = client(&base_url)
            .insert(
                "transactions",
                row(json!({"id": "tmp_1", "date": "2024-01-05", "amount": 42.5, "category": "Food"})),
            )
            .await
            .expect("insert");

        assert_eq!(entity.id, EntityId::new("17"));
        assert_eq!(entity.get("category"), Some(&json!("Food")));

        let requests = captured.lock().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].target, "/rest/v1/transactions");
        assert_eq!(
            requests[0].headers.get("prefer").map(String::as_str),
            Some("return=representation")
        );
        assert_eq!(
            requests[0].headers.get("authorization").map(String::as_str),
            Some("Bearer user-jwt")
        );
        assert_eq!(
            requests[0].headers.get("apikey").map(String::as_str),
            Some("anon-key")
        );
        let sent: Value = serde_json::from_str(&requests[0].body).expect("json body");
        assert!(sent.get("id").is_none());
        server.abort();
    }

    #[tokio::test]
    async fn bulk_update_targets_rows_by_predicate() {
        let (base_url, captured, server) = start_mock_server(vec![MockOutcome::Respond {
            status: 200,
            body: r#"[{"id":"t1","category":"Dining"},{"id":"t3","category":"Dining"}]"#
                .to_string(),
        }])
        .await;

        let rows = client(&base_url)
            .update(
                "transactions",
                &Target::Filter(vec![Filter::eq("category", "Food")]),
                row(json!({"category": "Dining"})),
            )
            .await
            .expect("update");

        assert_eq!(rows.len(), 2);
        let requests = captured.lock().await;
        assert_eq!(requests[0].method, "PATCH");
        assert_eq!(requests[0].target, "/rest/v1/transactions?category=eq.Food");
        server.abort();
    }

    #[tokio::test]
    async fn delete_by_id_sends_an_id_filter() {
        let (base_url, captured, server) = start_mock_server(vec![MockOutcome::Respond {
            status: 204,
            body: String::new(),
        }])
        .await;

        client(&base_url)
            .delete("categories", &Target::Id(EntityId::new("c1")))
            .await
            .expect("delete");

        let requests = captured.lock().await;
        assert_eq!(requests[0].method, "DELETE");
        assert_eq!(requests[0].target, "/rest/v1/categories?id=eq.c1");
        server.abort();
    }

    #[tokio::test]
    async fn unfiltered_delete_is_refused_locally() {
        let client = client("http://127.0.0.1:9/rest/v1");
        let err = client
            .delete_rows("transactions", &Target::Filter(Vec::new()))
            .await
            .expect_err("refused");
        assert!(matches!(err, RemoteError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn constraint_violation_is_a_rejection() {
        let (base_url, _captured, server) = start_mock_server(vec![MockOutcome::Respond {
            status: 409,
            body: r#"{"code":"23505","message":"duplicate key value violates unique constraint"}"#
                .to_string(),
        }])
        .await;

        let err = client(&base_url)
            .insert("categories", row(json!({"name": "Food"})))
            .await
            .expect_err("conflict");

        match err {
            Error::RemoteRejected { status, message } => {
                assert_eq!(status, 409);
                assert!(message.contains("unique constraint"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        server.abort();
    }

    #[tokio::test]
    async fn unavailable_backend_is_a_connectivity_error() {
        let (base_url, _captured, server) = start_mock_server(vec![
            MockOutcome::Respond {
                status: 503,
                body: r#"{"message":"upstream down"}"#.to_string(),
            },
            MockOutcome::DropConnection,
        ])
        .await;
        let client = client(&base_url);

        let err = client
            .select("transactions", &Query::new())
            .await
            .expect_err("503");
        assert!(err.is_connectivity());

        let err = client
            .select("transactions", &Query::new())
            .await
            .expect_err("dropped connection");
        assert!(err.is_connectivity());
        server.abort();
    }
}
