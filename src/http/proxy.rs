//! Forwarding of admitted requests to the upstream.

use std::convert::Infallible;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::HOST;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tower::Service;
use tracing::warn;

use crate::error::{RategateError, Result};

/// Response body produced by the proxy.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Forwards requests to a single upstream, keeping path and query.
#[derive(Clone)]
pub struct ReverseProxy {
    upstream: Uri,
    client: Client<HttpConnector, Incoming>,
}

impl std::fmt::Debug for ReverseProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseProxy")
            .field("upstream", &self.upstream)
            .finish()
    }
}

impl ReverseProxy {
    /// Create a proxy for an `http://host[:port][/base]` upstream.
    pub fn new(upstream: Uri) -> Result<Self> {
        if upstream.scheme_str() != Some("http") || upstream.authority().is_none() {
            return Err(RategateError::Config(format!(
                "upstream must be an absolute http:// URL, got {upstream}"
            )));
        }

        let client = Client::builder(TokioExecutor::new()).build_http();
        Ok(Self { upstream, client })
    }

    pub fn upstream(&self) -> &Uri {
        &self.upstream
    }

    /// Join the upstream base path with the request's path and query.
    fn target(&self, uri: &Uri) -> std::result::Result<Uri, http::Error> {
        let base = self.upstream.path().trim_end_matches('/');
        let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
        let authority = self.upstream.authority().map_or("", |a| a.as_str());

        Uri::builder()
            .scheme("http")
            .authority(authority)
            .path_and_query(format!("{base}{path_and_query}"))
            .build()
    }
}

fn bad_gateway() -> Response<ProxyBody> {
    let mut response = Response::new(ProxyBody::default());
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}

impl Service<Request<Incoming>> for ReverseProxy {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Incoming>) -> Self::Future {
        let client = self.client.clone();
        let target = self.target(req.uri());

        Box::pin(async move {
            let target = match target {
                Ok(target) => target,
                Err(e) => {
                    warn!(error = %e, "Could not build upstream URI");
                    return Ok(bad_gateway());
                }
            };

            *req.uri_mut() = target;
            // Let the client derive Host from the upstream authority.
            req.headers_mut().remove(HOST);

            match client.request(req).await {
                Ok(response) => Ok(response.map(|body| body.boxed_unsync())),
                Err(e) => {
                    warn!(error = %e, "Upstream request failed");
                    Ok(bad_gateway())
                }
            }
        })
    }
}
