// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Batched tRPC transport
//!
//! The backend accepts several named procedure calls in one HTTP request. Calls are
//! joined by comma in the URL path and their inputs are sent as a JSON object keyed
//! by position (`{"0": {"json": ...}, "1": ...}`). The response is an array whose
//! n-th element answers the n-th call; entries may fail individually.

use crate::errors::{ProteusError, ProteusResult, TransportError};
use crate::session::SessionManager;
use reqwest::{Response, StatusCode};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Read query, input travels in the query string
    Get,
    /// Mutation, input travels in the JSON body
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    pub endpoint: String,
    pub params: Value,
}

/// Ordered procedure calls; the position of a call is its batch index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchRequest {
    calls: Vec<RpcCall>,
}

impl BatchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(endpoint: impl Into<String>, params: Value) -> Self {
        Self::new().with_call(endpoint, params)
    }

    pub fn with_call(mut self, endpoint: impl Into<String>, params: Value) -> Self {
        self.calls.push(RpcCall {
            endpoint: endpoint.into(),
            params,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn calls(&self) -> &[RpcCall] {
        &self.calls
    }

    /// URL path segment naming every procedure, in index order
    pub fn path(&self) -> String {
        self.calls
            .iter()
            .map(|call| call.endpoint.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Positional input object `{"0": {"json": params}, ...}`
    pub fn encode_input(&self) -> Value {
        let input: Map<String, Value> = self
            .calls
            .iter()
            .enumerate()
            .map(|(index, call)| {
                let mut wrapped = Map::new();
                wrapped.insert("json".to_owned(), call.params.clone());
                (index.to_string(), Value::Object(wrapped))
            })
            .collect();
        Value::Object(input)
    }
}

/// Outcome of one batch index
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEntry {
    /// Content of the entry's `result` member
    Success(Value),
    /// Content of the entry's `error` member
    Error(Value),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResponse {
    entries: Vec<BatchEntry>,
}

impl BatchResponse {
    pub fn from_entries(entries: Vec<BatchEntry>) -> Self {
        Self { entries }
    }

    /// Decode the response body. Accepts the array form the backend sends and an
    /// object keyed by contiguous indices.
    pub fn decode(body: Value) -> Result<Self, TransportError> {
        let items = match body {
            Value::Array(items) => items,
            Value::Object(map) => {
                let mut indexed = map
                    .into_iter()
                    .map(|(key, value)| {
                        key.parse::<usize>()
                            .map(|index| (index, value))
                            .map_err(|_| TransportError::Decode(format!("non-index key '{key}'")))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                indexed.sort_by_key(|(index, _)| *index);
                if indexed.iter().enumerate().any(|(pos, (index, _))| pos != *index) {
                    return Err(TransportError::Decode(
                        "batch indices are not contiguous from 0".to_owned(),
                    ));
                }
                indexed.into_iter().map(|(_, value)| value).collect()
            }
            other => {
                return Err(TransportError::Decode(format!(
                    "expected array or object, got {other}"
                )));
            }
        };

        let entries = items
            .into_iter()
            .enumerate()
            .map(|(index, mut item)| {
                if let Some(result) = item.get_mut("result") {
                    Ok(BatchEntry::Success(result.take()))
                } else if let Some(error) = item.get_mut("error") {
                    Ok(BatchEntry::Error(error.take()))
                } else {
                    Err(TransportError::Decode(format!(
                        "entry {index} has neither result nor error"
                    )))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&BatchEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }
}

/// Exponential backoff for connection-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

pub(crate) enum AttemptError {
    /// Stop immediately with this error
    Abort(ProteusError),
    /// Sending failed, retried if it was a connection failure
    Send(reqwest::Error),
}

impl From<ProteusError> for AttemptError {
    fn from(e: ProteusError) -> Self {
        Self::Abort(e)
    }
}

fn is_connection_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request()
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): base * 2^(attempt-1), capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub(crate) async fn run<T, F, Fut>(&self, url: &str, mut attempt_fn: F) -> ProteusResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Abort(e)) => return Err(e),
                Err(AttemptError::Send(e)) if !is_connection_error(&e) => {
                    return Err(TransportError::Request {
                        url: url.to_owned(),
                        source: e,
                    }
                    .into());
                }
                Err(AttemptError::Send(e)) if attempt >= self.max_attempts => {
                    error!("Request to {} failed after {} attempts: {}", url, attempt, e);
                    return Err(TransportError::Connection {
                        url: url.to_owned(),
                        attempts: attempt,
                        source: e,
                    }
                    .into());
                }
                Err(AttemptError::Send(e)) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "Request failed (attempt {}/{}): {}. Retrying in {:?}",
                        attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Log a non-200 response and return its body if it is JSON
pub(crate) async fn log_failed_response(
    method: &str,
    url: &str,
    response: Response,
) -> Option<Value> {
    let status = response.status();
    let body = response
        .text()
        .await
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok());

    match &body {
        Some(data) => error!(
            "❌ [PROTEUS RPC] {} {} failed with status {} ({})",
            method, url, status, data
        ),
        None => error!(
            "❌ [PROTEUS RPC] {} {} failed with status {}",
            method, url, status
        ),
    }
    body
}

/// Sends batches over the inverter's session
#[derive(Debug)]
pub struct BatchTransport {
    session: Arc<SessionManager>,
    retry: RetryPolicy,
}

impl BatchTransport {
    pub fn new(session: Arc<SessionManager>, retry: RetryPolicy) -> Self {
        Self { session, retry }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub async fn call(&self, batch: &BatchRequest, method: Method) -> ProteusResult<BatchResponse> {
        match self.send(batch, method).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if e.is_auth_failure() {
                    self.session.invalidate().await;
                }
                Err(rejected_as_auth(e))
            }
        }
    }

    async fn send(&self, batch: &BatchRequest, method: Method) -> ProteusResult<BatchResponse> {
        let url = self
            .session
            .base_url()
            .join(&batch.path())
            .map_err(|e| ProteusError::Config(format!("invalid endpoint URL: {e}")))?;
        let input = batch.encode_input();
        let input_query = input.to_string();

        let session = self.session.ensure_session().await?;

        debug!("📡 [PROTEUS RPC] {} {} ({} calls)", method.as_str(), url, batch.len());

        let response = self
            .retry
            .run(url.as_str(), || async {
                let headers = self.session.headers().await?;
                let request = match method {
                    Method::Get => session
                        .client()
                        .get(url.clone())
                        .query(&[("batch", "1"), ("input", input_query.as_str())]),
                    Method::Post => session
                        .client()
                        .post(url.clone())
                        .query(&[("batch", "1")])
                        .json(&input),
                };
                request
                    .headers(headers)
                    .send()
                    .await
                    .map_err(AttemptError::Send)
            })
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = log_failed_response(method.as_str(), url.as_str(), response).await;
            return Err(TransportError::HttpStatus {
                method: method.as_str().to_owned(),
                url: url.to_string(),
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(BatchResponse::decode(body)?)
    }
}

/// A 401/403 means the backend no longer accepts the session
fn rejected_as_auth(error: ProteusError) -> ProteusError {
    match error {
        ProteusError::Transport(TransportError::HttpStatus {
            method,
            url,
            status: status @ (401 | 403),
            ..
        }) => ProteusError::Auth(format!("{method} {url} rejected with status {status}")),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProteusConfig;
    use crate::session::CSRF_HEADER;
    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    const INVERTER_ID: &str = "abcdefghijklmnopqrstu1234";

    async fn mock_login(server: &mut ServerGuard, expected: usize) -> mockito::Mock {
        server
            .mock("POST", "/api/trpc/users.loginWithEmailAndPassword")
            .with_status(200)
            .with_header("set-cookie", "proteus_csrf=csrf-abc; Path=/")
            .expect(expected)
            .create_async()
            .await
    }

    fn transport(server_url: &str) -> BatchTransport {
        let config = ProteusConfig::new(INVERTER_ID, "user@example.com", "secret")
            .with_base_url(format!("{server_url}/api/trpc/"));
        let session = Arc::new(SessionManager::new(&config).unwrap());
        BatchTransport::new(
            session,
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
            },
        )
    }

    #[test]
    fn test_encode_batch() {
        let batch = BatchRequest::new()
            .with_call("inverters.detail", json!({"inverterId": "x"}))
            .with_call("commands.current", json!({"inverterId": "x"}));

        assert_eq!(batch.path(), "inverters.detail,commands.current");
        assert_eq!(
            batch.encode_input(),
            json!({
                "0": {"json": {"inverterId": "x"}},
                "1": {"json": {"inverterId": "x"}}
            })
        );
    }

    #[test]
    fn test_decode_partial_failure() {
        let body = json!([
            {"result": {"data": {"json": {"a": 1}}}},
            {"error": {"json": {"message": "boom"}}}
        ]);
        let response = BatchResponse::decode(body).unwrap();
        assert_eq!(response.len(), 2);
        assert!(matches!(response.get(0), Some(BatchEntry::Success(_))));
        assert!(matches!(response.get(1), Some(BatchEntry::Error(_))));
    }

    #[test]
    fn test_decode_indexed_object() {
        let body = json!({
            "1": {"result": {"data": {"json": 2}}},
            "0": {"result": {"data": {"json": 1}}}
        });
        let response = BatchResponse::decode(body).unwrap();
        assert_eq!(
            response.get(0),
            Some(&BatchEntry::Success(json!({"data": {"json": 1}})))
        );

        let gap = json!({"0": {"result": {}}, "2": {"result": {}}});
        assert!(matches!(
            BatchResponse::decode(gap),
            Err(TransportError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_shapes() {
        assert!(BatchResponse::decode(json!("nope")).is_err());
        assert!(BatchResponse::decode(json!([{"data": 1}])).is_err());
    }

    #[test]
    fn test_retry_delays_double_and_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<Duration> = (1..=10).map(|attempt| policy.delay_for(attempt)).collect();

        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        for pair in delays.windows(2) {
            assert!(pair[1] > pair[0] || pair[1] == policy.max_delay);
            assert!(pair[1] <= pair[0] * 2);
        }
        for window in delays.windows(2).take(8) {
            assert_eq!(window[1], window[0] * 2);
        }
        assert_eq!(delays[9], Duration::from_secs(30));
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_connection_errors_are_retried() {
        // Bind and release a port so nothing listens on it.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{port}/");
        let client = reqwest::Client::new();
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };

        let result: ProteusResult<Response> = policy
            .run(&url, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                client.get(&url).send().await.map_err(AttemptError::Send)
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(matches!(
            result,
            Err(ProteusError::Transport(TransportError::Connection { attempts: 4, .. }))
        ));
    }

    #[tokio::test]
    async fn test_abort_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: ProteusResult<()> = RetryPolicy::default()
            .run("http://example.invalid/", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(AttemptError::Abort(ProteusError::MissingCsrf))
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ProteusError::MissingCsrf)));
    }

    #[tokio::test]
    async fn test_get_batch_sends_query_and_csrf() {
        let mut server = Server::new_async().await;
        let login = mock_login(&mut server, 1).await;
        let read = server
            .mock("GET", "/api/trpc/inverters.detail,commands.current")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("batch".into(), "1".into()),
                Matcher::UrlEncoded(
                    "input".into(),
                    json!({
                        "0": {"json": {"inverterId": INVERTER_ID}},
                        "1": {"json": {"inverterId": INVERTER_ID}}
                    })
                    .to_string(),
                ),
            ]))
            .match_header(CSRF_HEADER, "csrf-abc")
            .match_header("origin", "https://proteus.deltagreen.cz")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!([
                    {"result": {"data": {"json": {"ok": true}}}},
                    {"result": {"data": {"json": null}}}
                ])
                .to_string(),
            )
            .create_async()
            .await;

        let transport = transport(&server.url());
        let batch = BatchRequest::new()
            .with_call("inverters.detail", json!({"inverterId": INVERTER_ID}))
            .with_call("commands.current", json!({"inverterId": INVERTER_ID}));
        let response = transport.call(&batch, Method::Get).await.unwrap();

        assert_eq!(response.len(), 2);
        login.assert_async().await;
        read.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_batch_sends_json_body() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server, 1).await;
        let write = server
            .mock("POST", "/api/trpc/inverters.controls.updateControlMode")
            .match_query(Matcher::UrlEncoded("batch".into(), "1".into()))
            .match_body(Matcher::Json(json!({
                "0": {"json": {"inverterId": INVERTER_ID, "controlMode": "MANUAL"}}
            })))
            .with_status(200)
            .with_body(json!([{"result": {"data": {"json": null}}}]).to_string())
            .create_async()
            .await;

        let transport = transport(&server.url());
        let batch = BatchRequest::single(
            "inverters.controls.updateControlMode",
            json!({"inverterId": INVERTER_ID, "controlMode": "MANUAL"}),
        );
        transport.call(&batch, Method::Post).await.unwrap();
        write.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_403_is_not_retried_and_invalidates_session() {
        let mut server = Server::new_async().await;
        let login = mock_login(&mut server, 2).await;
        let forbidden = server
            .mock("GET", "/api/trpc/inverters.detail")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_header("content-type", "application/json")
            .with_body(json!([{"error": {"json": {"message": "FORBIDDEN"}}}]).to_string())
            .expect(2)
            .create_async()
            .await;

        let transport = transport(&server.url());
        let batch = BatchRequest::single("inverters.detail", json!({"inverterId": INVERTER_ID}));

        let result = transport.call(&batch, Method::Get).await;
        match result {
            Err(ProteusError::Auth(message)) => assert!(message.contains("403")),
            other => panic!("expected Auth error, got {other:?}"),
        }

        // Second call logs in again because the first one invalidated the session.
        assert!(transport.call(&batch, Method::Get).await.is_err());
        login.assert_async().await;
        forbidden.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server, 1).await;
        let failing = server
            .mock("GET", "/api/trpc/inverters.detail")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body("internal error")
            .expect(1)
            .create_async()
            .await;

        let transport = transport(&server.url());
        let batch = BatchRequest::single("inverters.detail", json!({"inverterId": INVERTER_ID}));
        let result = transport.call(&batch, Method::Get).await;

        assert!(matches!(
            result,
            Err(ProteusError::Transport(TransportError::HttpStatus {
                status: 500,
                body: None,
                ..
            }))
        ));
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_csrf_token_follows_rotated_cookie() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server, 1).await;
        let first = server
            .mock("GET", "/api/trpc/inverters.detail")
            .match_query(Matcher::Any)
            .match_header(CSRF_HEADER, "csrf-abc")
            .with_status(200)
            .with_header("set-cookie", "proteus_csrf=rotated; Path=/")
            .with_body(json!([{"result": {"data": {"json": {}}}}]).to_string())
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/api/trpc/inverters.detail")
            .match_query(Matcher::Any)
            .match_header(CSRF_HEADER, "rotated")
            .with_status(200)
            .with_body(json!([{"result": {"data": {"json": {}}}}]).to_string())
            .expect(1)
            .create_async()
            .await;

        let transport = transport(&server.url());
        let batch = BatchRequest::single("inverters.detail", json!({"inverterId": INVERTER_ID}));
        transport.call(&batch, Method::Get).await.unwrap();
        transport.call(&batch, Method::Get).await.unwrap();

        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_csrf_forces_new_login() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", "/api/trpc/users.loginWithEmailAndPassword")
            .with_status(200)
            .expect(2)
            .create_async()
            .await;
        let read = server
            .mock("GET", "/api/trpc/inverters.detail")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let transport = transport(&server.url());
        let batch = BatchRequest::single("inverters.detail", json!({"inverterId": INVERTER_ID}));

        let first = transport.call(&batch, Method::Get).await;
        assert!(matches!(first, Err(ProteusError::MissingCsrf)));
        let second = transport.call(&batch, Method::Get).await;
        assert!(matches!(second, Err(ProteusError::MissingCsrf)));

        login.assert_async().await;
        read.assert_async().await;
    }
}
