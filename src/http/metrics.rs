//! Request metrics and their scrape endpoint.

use std::convert::Infallible;
use std::future::{ready, Ready};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::Full;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::warn;

/// Counter, histogram and gauge describing handled requests.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    handled: IntCounter,
    duration: Histogram,
    inflight: IntGauge,
}

impl RequestMetrics {
    /// Create the metrics and register them into `registry`.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let handled = IntCounter::new(
            "requests_handled_total",
            "Requests answered, refused or abandoned",
        )?;
        let duration = Histogram::with_opts(HistogramOpts::new(
            "request_duration_seconds",
            "Time from arrival to response, admission waits included",
        ))?;
        let inflight = IntGauge::new("requests_inflight", "Requests currently being handled")?;

        registry.register(Box::new(handled.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(inflight.clone()))?;

        Ok(Self {
            handled,
            duration,
            inflight,
        })
    }

    pub fn handled(&self) -> u64 {
        self.handled.get()
    }

    pub fn inflight(&self) -> i64 {
        self.inflight.get()
    }

    /// Number of durations observed.
    pub fn observations(&self) -> u64 {
        self.duration.get_sample_count()
    }

    /// Sum of observed durations in seconds.
    pub fn observed_seconds(&self) -> f64 {
        self.duration.get_sample_sum()
    }
}

/// Records one request; finishing happens on drop so abandoned requests count.
struct InFlight {
    metrics: RequestMetrics,
    start: Instant,
}

impl InFlight {
    fn begin(metrics: RequestMetrics) -> Self {
        metrics.inflight.inc();
        Self {
            metrics,
            start: Instant::now(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.metrics.duration.observe(self.start.elapsed().as_secs_f64());
        self.metrics.handled.inc();
        self.metrics.inflight.dec();
    }
}

/// Measures every request passing through the wrapped service.
#[derive(Debug, Clone)]
pub struct Metrics<S> {
    inner: S,
    metrics: RequestMetrics,
}

impl<S> Metrics<S> {
    pub fn new(inner: S, metrics: RequestMetrics) -> Self {
        Self { inner, metrics }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S, ReqBody> Service<Request<ReqBody>> for Metrics<S>
where
    S: Service<Request<ReqBody>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let guard = InFlight::begin(self.metrics.clone());
        let future = self.inner.call(req);

        Box::pin(async move {
            let _guard = guard;
            future.await
        })
    }
}

/// Applies [`Metrics`] to a service.
#[derive(Debug, Clone)]
pub struct MetricsLayer {
    metrics: RequestMetrics,
}

impl MetricsLayer {
    pub fn new(metrics: RequestMetrics) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = Metrics<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Metrics::new(inner, self.metrics.clone())
    }
}

/// Serves a registry in the Prometheus text format.
#[derive(Clone)]
pub struct MetricsEndpoint {
    registry: Registry,
}

impl MetricsEndpoint {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    fn render(&self) -> Response<Full<Bytes>> {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
            let mut response = Response::new(Full::default());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            return response;
        }

        let mut response = Response::new(Full::new(Bytes::from(buffer)));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
        response
    }
}

impl<B> Service<Request<B>> for MetricsEndpoint {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<B>) -> Self::Future {
        ready(Ok(self.render()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    fn gated(
        gate: Arc<Notify>,
    ) -> impl Service<Request<()>, Response = Response<()>, Error = Infallible, Future = impl Send>
    {
        tower::service_fn(move |_req: Request<()>| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok::<_, Infallible>(Response::new(()))
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_moves_counter_gauge_and_histogram() {
        let registry = Registry::new();
        let metrics = RequestMetrics::register(&registry).unwrap();
        let gate = Arc::new(Notify::new());
        let mut service = MetricsLayer::new(metrics.clone()).layer(gated(gate.clone()));

        let pending = service.ready().await.unwrap().call(Request::new(()));
        assert_eq!(metrics.inflight(), 1);
        assert_eq!(metrics.handled(), 0);
        assert_eq!(metrics.observations(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        gate.notify_one();
        pending.await.unwrap();

        assert_eq!(metrics.inflight(), 0);
        assert_eq!(metrics.handled(), 1);
        assert_eq!(metrics.observations(), 1);
        assert!(metrics.observed_seconds() >= 2.0);
        assert!(metrics.observed_seconds() < 2.1);
    }

    #[tokio::test]
    async fn test_abandoned_request_is_still_counted() {
        let registry = Registry::new();
        let metrics = RequestMetrics::register(&registry).unwrap();
        let mut service = MetricsLayer::new(metrics.clone()).layer(gated(Arc::new(Notify::new())));

        let pending = service.ready().await.unwrap().call(Request::new(()));
        assert_eq!(metrics.inflight(), 1);
        drop(pending);

        assert_eq!(metrics.inflight(), 0);
        assert_eq!(metrics.handled(), 1);
        assert_eq!(metrics.observations(), 1);
    }

    #[tokio::test]
    async fn test_endpoint_renders_text_format() {
        let registry = Registry::new();
        let metrics = RequestMetrics::register(&registry).unwrap();
        let gate = Arc::new(Notify::new());
        gate.notify_one();
        MetricsLayer::new(metrics)
            .layer(gated(gate))
            .oneshot(Request::new(()))
            .await
            .unwrap();

        let response = MetricsEndpoint::new(registry)
            .oneshot(Request::new(()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            prometheus::TEXT_FORMAT
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("requests_handled_total 1"));
        assert!(text.contains("requests_inflight 0"));
        assert!(text.contains("request_duration_seconds_count 1"));
    }

    #[test]
    fn test_register_twice_conflicts() {
        let registry = Registry::new();
        RequestMetrics::register(&registry).unwrap();
        assert!(RequestMetrics::register(&registry).is_err());
    }
}
