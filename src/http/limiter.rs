//! Admission-controlled request handling.
//!
//! Every request is keyed by its URL path. A denied request is parked until
//! the next interval and then asks again, for as long as it takes or until
//! the request is cancelled. A request is only refused outright when the
//! acquirer cannot make a decision.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use http::{Request, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};
use tracing::{debug, trace, warn};

use crate::error::AcquireError;
use crate::ratelimit::{Acquirer, NextIntervalWaiter, Waiter};

/// Interval used by the default waiter.
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(60);

/// Non-standard status for a request whose client went away.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// How an admission attempt ended.
#[derive(Debug)]
pub enum Admission {
    /// The request may proceed.
    Admitted,
    /// No decision could be made.
    Unavailable(AcquireError),
    /// The caller went away first.
    Cancelled,
}

/// Ask `acquirer` until `key` is admitted, pacing denials with `waiter`.
pub async fn admit<A, W>(
    acquirer: &A,
    waiter: &W,
    cancel: &CancellationToken,
    key: &str,
) -> Admission
where
    A: Acquirer + ?Sized,
    W: Waiter + ?Sized,
{
    loop {
        match acquirer.acquire(cancel, key).await {
            Ok(true) => return Admission::Admitted,
            Ok(false) => trace!(key = %key, "Denied, waiting for next interval"),
            Err(e) if e.is_cancelled() => return Admission::Cancelled,
            Err(e) => return Admission::Unavailable(e),
        }

        if cancel.is_cancelled() {
            return Admission::Cancelled;
        }
        waiter.wait(cancel).await;
        if cancel.is_cancelled() {
            return Admission::Cancelled;
        }
    }
}

/// Cancellation for one request, tied to any token the request carries.
fn request_token<B>(req: &Request<B>) -> CancellationToken {
    req.extensions()
        .get::<CancellationToken>()
        .map(CancellationToken::child_token)
        .unwrap_or_default()
}

fn status_response<B: Default>(status: StatusCode) -> Response<B> {
    let mut response = Response::new(B::default());
    *response.status_mut() = status;
    response
}

/// Middleware that holds each request until its path is admitted.
#[derive(Clone)]
pub struct Limiter<S> {
    inner: S,
    acquirer: Arc<dyn Acquirer>,
    waiter: Arc<dyn Waiter>,
}

impl<S> Limiter<S> {
    /// Wrap `inner`, waiting in one-minute intervals between attempts.
    pub fn new(inner: S, acquirer: Arc<dyn Acquirer>) -> Self {
        Self {
            inner,
            acquirer,
            waiter: Arc::new(NextIntervalWaiter::new(DEFAULT_WAIT_INTERVAL)),
        }
    }

    pub fn with_waiter(mut self, waiter: Arc<dyn Waiter>) -> Self {
        self.waiter = waiter;
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for Limiter<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Keep the service that was driven to readiness for this request.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let acquirer = self.acquirer.clone();
        let waiter = self.waiter.clone();

        Box::pin(async move {
            let cancel = request_token(&req);
            // Dropping this future (client disconnect) cancels the token.
            let _guard = cancel.clone().drop_guard();
            let key = req.uri().path().to_string();

            match admit(&*acquirer, &*waiter, &cancel, &key).await {
                Admission::Admitted => inner.call(req).await,
                Admission::Unavailable(e) => {
                    warn!(key = %key, error = %e, "Admission unavailable");
                    Ok(status_response(StatusCode::SERVICE_UNAVAILABLE))
                }
                Admission::Cancelled => {
                    debug!(key = %key, "Request cancelled before admission");
                    let status = StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                        .unwrap_or(StatusCode::REQUEST_TIMEOUT);
                    Ok(status_response(status))
                }
            }
        })
    }
}

/// Applies [`Limiter`] to a service.
#[derive(Clone)]
pub struct LimiterLayer {
    acquirer: Arc<dyn Acquirer>,
    waiter: Arc<dyn Waiter>,
}

impl LimiterLayer {
    pub fn new(acquirer: Arc<dyn Acquirer>) -> Self {
        Self {
            acquirer,
            waiter: Arc::new(NextIntervalWaiter::new(DEFAULT_WAIT_INTERVAL)),
        }
    }

    pub fn with_waiter(mut self, waiter: Arc<dyn Waiter>) -> Self {
        self.waiter = waiter;
        self
    }
}

impl<S> Layer<S> for LimiterLayer {
    type Service = Limiter<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Limiter {
            inner,
            acquirer: self.acquirer.clone(),
            waiter: self.waiter.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::KeyedLocalAdmitter;
    use crate::store::StoreError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;
    use tower::ServiceExt;

    /// Grants `limit` acquisitions per key until cleared.
    struct CountingAcquirer {
        limit: usize,
        counts: Mutex<HashMap<String, usize>>,
        calls: AtomicUsize,
    }

    impl CountingAcquirer {
        fn new(limit: usize) -> Arc<Self> {
            Arc::new(Self {
                limit,
                counts: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn clear(&self) {
            self.counts.lock().clear();
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Acquirer for CountingAcquirer {
        async fn acquire(
            &self,
            _cancel: &CancellationToken,
            key: &str,
        ) -> Result<bool, AcquireError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut counts = self.counts.lock();
            let count = counts.entry(key.to_string()).or_default();
            if *count >= self.limit {
                return Ok(false);
            }
            *count += 1;
            Ok(true)
        }
    }

    struct UnreachableStore;

    #[async_trait]
    impl Acquirer for UnreachableStore {
        async fn acquire(
            &self,
            _cancel: &CancellationToken,
            _key: &str,
        ) -> Result<bool, AcquireError> {
            Err(StoreError::Transport("connection refused".to_string()).into())
        }
    }

    /// Releases exactly as many waiters as it is told to.
    struct GateWaiter {
        permits: Semaphore,
        waiting: AtomicUsize,
    }

    impl GateWaiter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                permits: Semaphore::new(0),
                waiting: AtomicUsize::new(0),
            })
        }

        fn wake(&self, count: usize) {
            self.permits.add_permits(count);
        }

        fn waiting(&self) -> usize {
            self.waiting.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Waiter for GateWaiter {
        async fn wait(&self, cancel: &CancellationToken) {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                permit = self.permits.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
                _ = cancel.cancelled() => {}
            }
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Counts forwarded requests per path.
    #[derive(Clone, Default)]
    struct RecordingProxy {
        hits: Arc<Mutex<HashMap<String, usize>>>,
    }

    impl RecordingProxy {
        fn hits(&self, path: &str) -> usize {
            self.hits.lock().get(path).copied().unwrap_or(0)
        }

        fn total(&self) -> usize {
            self.hits.lock().values().sum()
        }
    }

    impl Service<Request<String>> for RecordingProxy {
        type Response = Response<String>;
        type Error = Infallible;
        type Future = std::future::Ready<Result<Response<String>, Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<String>) -> Self::Future {
            *self.hits.lock().entry(req.uri().path().to_string()).or_default() += 1;
            std::future::ready(Ok(Response::new("proxied".to_string())))
        }
    }

    fn request(uri: &str) -> Request<String> {
        Request::builder().uri(uri).body(String::new()).unwrap()
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_admitted_requests_are_forwarded() {
        let proxy = RecordingProxy::default();
        let acquirer = CountingAcquirer::new(3);
        let waiter = GateWaiter::new();
        let limiter = Limiter::new(proxy.clone(), acquirer.clone()).with_waiter(waiter.clone());

        for i in 0..3 {
            let response = limiter.clone().oneshot(request("/foo/bar")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(proxy.hits("/foo/bar"), i + 1);
        }

        // The fourth request is held until the next interval
        let pending = tokio::spawn(limiter.clone().oneshot(request("/foo/bar")));
        eventually(|| waiter.waiting() == 1).await;
        assert!(!pending.is_finished());
        assert_eq!(proxy.hits("/foo/bar"), 3);

        acquirer.clear();
        waiter.wake(1);

        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(proxy.hits("/foo/bar"), 4);
    }

    #[tokio::test]
    async fn test_key_is_request_path() {
        let proxy = RecordingProxy::default();
        let acquirer = CountingAcquirer::new(1);
        let limiter = Limiter::new(proxy.clone(), acquirer.clone());

        limiter.clone().oneshot(request("/foo?page=1")).await.unwrap();

        assert_eq!(acquirer.counts.lock().get("/foo"), Some(&1));
        assert_eq!(proxy.hits("/foo"), 1);
    }

    #[tokio::test]
    async fn test_acquire_error_is_service_unavailable() {
        let proxy = RecordingProxy::default();
        let limiter = Limiter::new(proxy.clone(), Arc::new(UnreachableStore));

        let response = limiter.oneshot(request("/foo")).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(proxy.total(), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let proxy = RecordingProxy::default();
        let acquirer = CountingAcquirer::new(0);
        let waiter = GateWaiter::new();
        let limiter = Limiter::new(proxy.clone(), acquirer.clone()).with_waiter(waiter.clone());

        let cancel = CancellationToken::new();
        let mut req = request("/foo");
        req.extensions_mut().insert(cancel.clone());
        let pending = tokio::spawn(limiter.oneshot(req));

        eventually(|| waiter.waiting() == 1).await;
        cancel.cancel();

        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.status().as_u16(), CLIENT_CLOSED_REQUEST);
        assert_eq!(proxy.total(), 0);
        assert_eq!(acquirer.calls(), 1);
    }

    /// Denies everything and keeps the tokens it was handed.
    #[derive(Default)]
    struct TokenRecorder {
        tokens: Mutex<Vec<CancellationToken>>,
    }

    #[async_trait]
    impl Acquirer for TokenRecorder {
        async fn acquire(
            &self,
            cancel: &CancellationToken,
            _key: &str,
        ) -> Result<bool, AcquireError> {
            self.tokens.lock().push(cancel.clone());
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_dropped_request_cancels_its_token() {
        let acquirer = Arc::new(TokenRecorder::default());
        let waiter = GateWaiter::new();
        let limiter =
            Limiter::new(RecordingProxy::default(), acquirer.clone()).with_waiter(waiter.clone());

        let parent = CancellationToken::new();
        let mut req = request("/foo");
        req.extensions_mut().insert(parent.clone());
        let pending = tokio::spawn(limiter.oneshot(req));

        eventually(|| waiter.waiting() == 1).await;
        pending.abort();
        eventually(|| acquirer.tokens.lock().iter().all(|t| t.is_cancelled())).await;

        // Only the request's own child token was cancelled
        assert!(!parent.is_cancelled());
        assert_eq!(acquirer.tokens.lock().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_independent_keys() {
        const LIMIT: usize = 10;
        const PER_PATH: usize = 30;
        let paths = ["/foo", "/bar", "/foo/bar"];

        let proxy = RecordingProxy::default();
        let acquirer = CountingAcquirer::new(LIMIT);
        let waiter = GateWaiter::new();
        let limiter = Limiter::new(proxy.clone(), acquirer.clone()).with_waiter(waiter.clone());

        let mut tasks = Vec::new();
        for path in paths {
            for _ in 0..PER_PATH {
                tasks.push(tokio::spawn(limiter.clone().oneshot(request(path))));
            }
        }

        let total = PER_PATH * paths.len();
        for round in 1..=PER_PATH / LIMIT {
            let admitted = round * LIMIT * paths.len();
            eventually(|| proxy.total() == admitted).await;
            eventually(|| waiter.waiting() == total - admitted).await;
            for path in paths {
                // each round every path sees exactly its own limit
                assert_eq!(proxy.hits(path), round * LIMIT);
            }

            acquirer.clear();
            waiter.wake(total - admitted);
        }

        for task in tasks {
            let response = task.await.unwrap().unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_local_admitter_behind_limiter() {
        let proxy = RecordingProxy::default();
        let admitter = Arc::new(KeyedLocalAdmitter::new(1, Duration::from_secs(3600)).unwrap());
        let waiter = GateWaiter::new();
        let layer = LimiterLayer::new(admitter.clone()).with_waiter(waiter.clone());
        let limiter = layer.layer(proxy.clone());

        limiter.clone().oneshot(request("/foo")).await.unwrap();
        let pending = tokio::spawn(limiter.clone().oneshot(request("/foo")));
        eventually(|| waiter.waiting() == 1).await;

        admitter.refill_all();
        waiter.wake(1);

        pending.await.unwrap().unwrap();
        assert_eq!(proxy.hits("/foo"), 2);
    }
}
