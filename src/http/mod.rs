//! HTTP surface: admission middleware, request metrics, upstream proxy and
//! the server loop.

mod limiter;
mod metrics;
mod proxy;
mod server;

pub use limiter::{admit, Admission, Limiter, LimiterLayer, DEFAULT_WAIT_INTERVAL};
pub use metrics::{Metrics, MetricsEndpoint, MetricsLayer, RequestMetrics};
pub use proxy::{ProxyBody, ReverseProxy};
pub use server::ProxyServer;
