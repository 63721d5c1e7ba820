//! HTTP surface of the count service.
//!
//! `GET /neo/count?dates=...` sums the catalog counts of the requested dates,
//! `POST /neo/count` upserts a batch of per-date counts. Any other method on
//! that path is rejected with 405, any other path with 404.

use crate::aggregator::Aggregator;
use crate::errors::NeoCountError;
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS_INFLIGHT};
use crate::model::{ErrorBody, NeoCountPayload, TotalCount};
use crate::store::{CountStore, upsert_all};
use http::header::{ALLOW, CONTENT_TYPE, HeaderValue};
use http::{Method, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use serde::Serialize;
use shared::{gauge, histogram};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const COUNT_PATH: &str = "/neo/count";

pub type HandlerBody = BoxBody<Bytes, NeoCountError>;

#[derive(Clone)]
pub struct NeoCountService {
    aggregator: Aggregator,
    store: Arc<dyn CountStore>,
    /// Process-wide scope; every read runs under a child of it
    shutdown: CancellationToken,
    lookup_deadline: Option<Duration>,
}

impl NeoCountService {
    pub fn new(
        aggregator: Aggregator,
        store: Arc<dyn CountStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            aggregator,
            store,
            shutdown,
            lookup_deadline: None,
        }
    }

    /// Cancels the lookups of a read still outstanding after `deadline`.
    pub fn with_lookup_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.lookup_deadline = deadline;
        self
    }

    /// Handles one request. Errors are rendered as JSON responses, so this
    /// never fails.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<HandlerBody>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let started = Instant::now();
        let method = req.method().clone();
        gauge!(REQUESTS_INFLIGHT).increment(1.0);

        let response = match self.route(req).await {
            Ok(response) => response,
            Err(e) => error_response(e),
        };

        gauge!(REQUESTS_INFLIGHT).decrement(1.0);
        histogram!(
            REQUEST_DURATION,
            "method" => method.to_string(),
            "status" => response.status().as_str().to_owned()
        )
        .record(started.elapsed().as_secs_f64());

        response
    }

    async fn route<B>(&self, req: Request<B>) -> Result<Response<HandlerBody>, NeoCountError>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        if req.uri().path() != COUNT_PATH {
            tracing::debug!(path = %req.uri().path(), "No route matched");
            return Err(NeoCountError::NoRouteMatched);
        }

        match *req.method() {
            Method::GET => self.read(req.uri()).await,
            Method::POST => self.write(req.into_body()).await,
            _ => Err(NeoCountError::MethodNotAllowed(req.method().clone())),
        }
    }

    async fn read(&self, uri: &Uri) -> Result<Response<HandlerBody>, NeoCountError> {
        let dates = requested_dates(uri);
        if dates.is_empty() {
            return Err(NeoCountError::BadRequest("Missing dates parameter".into()));
        }

        let scope = self.shutdown.child_token();
        let watchdog = self.lookup_deadline.map(|deadline| {
            let scope = scope.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                tracing::debug!(?deadline, "Lookup deadline reached, cancelling");
                scope.cancel();
            })
        });

        let total_count = self.aggregator.aggregate(&dates, &scope).await;

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        json_response(StatusCode::OK, &TotalCount { total_count })
    }

    async fn write<B>(&self, body: B) -> Result<Response<HandlerBody>, NeoCountError>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let bytes = body
            .collect()
            .await
            .map_err(|e| NeoCountError::RequestBodyError(e.to_string()))?
            .to_bytes();

        let payload: NeoCountPayload = serde_json::from_slice(&bytes)
            .map_err(|e| NeoCountError::BadRequest(e.to_string()))?;

        let written = upsert_all(self.store.as_ref(), &payload.neo_count).await?;
        tracing::info!(rows = written, "Stored neo counts");

        Ok(empty_response(StatusCode::CREATED))
    }
}

impl Service<Request<Incoming>> for NeoCountService {
    type Response = Response<HandlerBody>;
    type Error = NeoCountError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(req).await) })
    }
}

/// Every `dates` query value, in order, duplicates kept. A value may also
/// hold a comma-separated list; empty items are dropped.
fn requested_dates(uri: &Uri) -> Vec<String> {
    let Some(query) = uri.query() else {
        return Vec::new();
    };

    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key == "dates")
        .flat_map(|(_, value)| {
            value
                .split(',')
                .map(str::trim)
                .filter(|date| !date.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn json_response<T: Serialize>(
    status: StatusCode,
    value: &T,
) -> Result<Response<HandlerBody>, NeoCountError> {
    let bytes = serde_json::to_vec(value).map(Bytes::from)?;
    let mut response = Response::new(Full::new(bytes).map_err(|e| match e {}).boxed());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

fn empty_response(status: StatusCode) -> Response<HandlerBody> {
    let mut response = Response::new(Empty::new().map_err(|e| match e {}).boxed());
    *response.status_mut() = status;
    response
}

fn error_response(error: NeoCountError) -> Response<HandlerBody> {
    let status = error.status();
    if status.is_server_error() {
        tracing::error!(error = %error, "Request failed");
    } else {
        tracing::debug!(error = %error, status = %status, "Request rejected");
    }

    let body = ErrorBody {
        error_message: error.to_string(),
    };
    let mut response = json_response(status, &body).unwrap_or_else(|_| empty_response(status));

    if matches!(error, NeoCountError::MethodNotAllowed(_)) {
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET, POST"));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{CountSource, LookupError};
    use crate::model::DateCount;
    use crate::store::{MemoryCountStore, StoreError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Known dates answer immediately, unknown dates never answer.
    struct StubSource {
        counts: HashMap<&'static str, u64>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CountSource for StubSource {
        async fn element_count(&self, date: &str) -> Result<u64, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.counts.get(date) {
                Some(count) => Ok(*count),
                None => std::future::pending().await,
            }
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl CountStore for BrokenStore {
        async fn upsert(&self, _row: &DateCount) -> Result<(), StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }
    }

    struct Fixture {
        service: NeoCountService,
        source: Arc<StubSource>,
        store: Arc<MemoryCountStore>,
    }

    fn fixture(counts: &[(&'static str, u64)]) -> Fixture {
        let source = Arc::new(StubSource {
            counts: counts.iter().copied().collect(),
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(MemoryCountStore::new());
        let service = NeoCountService::new(
            Aggregator::new(source.clone()),
            store.clone(),
            CancellationToken::new(),
        )
        .with_lookup_deadline(Some(Duration::from_millis(200)));

        Fixture {
            service,
            source,
            store,
        }
    }

    fn request(method: Method, uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_json(response: Response<HandlerBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_read_sums_counts() {
        let f = fixture(&[("2024-01-01", 3), ("2024-01-02", 4)]);

        let response = f
            .service
            .handle(request(
                Method::GET,
                "/neo/count?dates=2024-01-01&dates=2024-01-02",
                "",
            ))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(body_json(response).await, serde_json::json!({"total_count": 7}));
    }

    #[tokio::test]
    async fn test_read_with_timed_out_date() {
        // 2024-01-02 never answers; the lookup deadline cancels it
        let f = fixture(&[("2024-01-01", 3)]);

        let response = f
            .service
            .handle(request(Method::GET, "/neo/count?dates=2024-01-01,2024-01-02", ""))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({"total_count": 3}));
        assert_eq!(f.source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_read_duplicate_dates() {
        let f = fixture(&[("2021-01-01", 5)]);

        let response = f
            .service
            .handle(request(
                Method::GET,
                "/neo/count?dates=2021-01-01&dates=2021-01-01",
                "",
            ))
            .await;

        assert_eq!(body_json(response).await, serde_json::json!({"total_count": 10}));
    }

    #[tokio::test]
    async fn test_read_without_dates_is_rejected() {
        let f = fixture(&[("2024-01-01", 3)]);

        for uri in ["/neo/count", "/neo/count?dates=", "/neo/count?date=2024-01-01"] {
            let response = f.service.handle(request(Method::GET, uri, "")).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            let body = body_json(response).await;
            assert!(
                body["error_message"]
                    .as_str()
                    .unwrap()
                    .contains("Missing dates parameter")
            );
        }

        // Nothing was dispatched
        assert_eq!(f.source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_reads() {
        let f = fixture(&[("2024-01-01", 3)]);
        let shutdown = CancellationToken::new();
        let service = NeoCountService::new(
            Aggregator::new(f.source.clone()),
            f.store.clone(),
            shutdown.clone(),
        );
        shutdown.cancel();

        let response = tokio::time::timeout(
            Duration::from_secs(5),
            service.handle(request(Method::GET, "/neo/count?dates=2024-01-09", "")),
        )
        .await
        .expect("read hung after shutdown");

        assert_eq!(body_json(response).await, serde_json::json!({"total_count": 0}));
    }

    #[tokio::test]
    async fn test_write_then_stored() {
        let f = fixture(&[]);

        let response = f
            .service
            .handle(request(
                Method::POST,
                "/neo/count",
                r#"{"neo_count": [{"date": "2024-02-01", "count": 4}]}"#,
            ))
            .await;

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            f.store.rows().await,
            vec![DateCount {
                date: "2024-02-01".parse().unwrap(),
                count: 4,
            }]
        );
    }

    #[tokio::test]
    async fn test_write_overwrites_existing_date() {
        let f = fixture(&[]);

        for count in [3, 7] {
            let body = format!(r#"{{"neo_count": [{{"date": "2024-02-01", "count": {count}}}]}}"#);
            let response = f
                .service
                .handle(request(Method::POST, "/neo/count", &body))
                .await;
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let rows = f.store.rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 7);
    }

    #[tokio::test]
    async fn test_write_malformed_body() {
        let f = fixture(&[]);

        for body in [
            "not json",
            r#"{"neo_count": [{"date": "yesterday", "count": 4}]}"#,
            r#"{"neo_count": [{"date": "2024-02-01", "count": -4}]}"#,
        ] {
            let response = f
                .service
                .handle(request(Method::POST, "/neo/count", body))
                .await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        }

        assert!(f.store.rows().await.is_empty());
    }

    #[tokio::test]
    async fn test_write_store_failure() {
        let service = NeoCountService::new(
            Aggregator::new(Arc::new(StubSource {
                counts: HashMap::new(),
                calls: AtomicUsize::new(0),
            })),
            Arc::new(BrokenStore),
            CancellationToken::new(),
        );

        let response = service
            .handle(request(
                Method::POST,
                "/neo/count",
                r#"{"neo_count": [{"date": "2024-02-01", "count": 4}]}"#,
            ))
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert!(
            body["error_message"]
                .as_str()
                .unwrap()
                .contains("row 0 (2024-02-01)")
        );
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let f = fixture(&[]);

        let response = f
            .service
            .handle(request(Method::PUT, "/neo/count", ""))
            .await;

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(ALLOW).unwrap(), "GET, POST");
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let f = fixture(&[]);

        let response = f
            .service
            .handle(request(Method::GET, "/neo/counts?dates=2024-01-01", ""))
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_requested_dates() {
        let uri: Uri = "/neo/count?dates=2024-01-01&foo=bar&dates=2024-01-02,,2024-01-03&dates=2024-01-01"
            .parse()
            .unwrap();
        assert_eq!(
            requested_dates(&uri),
            vec!["2024-01-01", "2024-01-02", "2024-01-03", "2024-01-01"]
        );

        let uri: Uri = "/neo/count?dates=2024-01-01%2C2024-01-02".parse().unwrap();
        assert_eq!(requested_dates(&uri), vec!["2024-01-01", "2024-01-02"]);

        let uri: Uri = "/neo/count".parse().unwrap();
        assert!(requested_dates(&uri).is_empty());
    }
}
