use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::http::{Request, Response, StatusCode};
use metrics::{counter, histogram};
use tower::{Layer, Service};

/// Request count, error count, and latency via the `metrics` facade.
#[derive(Clone)]
pub struct HttpMetricsLayer {
    prefix: &'static str,
}

impl HttpMetricsLayer {
    pub fn new(prefix: &'static str) -> Self {
        Self { prefix }
    }
}

impl<S> Layer<S> for HttpMetricsLayer {
    type Service = HttpMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpMetricsService {
            inner,
            prefix: self.prefix,
        }
    }
}

#[derive(Clone)]
pub struct HttpMetricsService<S> {
    inner: S,
    prefix: &'static str,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for HttpMetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let start = Instant::now();
        let prefix = self.prefix;
        let fut = self.inner.call(request);

        Box::pin(async move {
            let result = fut.await;
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            counter!(format!("{prefix}_http_requests_total")).increment(1);
            histogram!(format!("{prefix}_http_latency_ms")).record(elapsed_ms);

            match result {
                Ok(response) => {
                    if response.status() >= StatusCode::INTERNAL_SERVER_ERROR {
                        counter!(format!("{prefix}_http_errors_total")).increment(1);
                    }
                    Ok(response)
                }
                Err(err) => {
                    counter!(format!("{prefix}_http_errors_total")).increment(1);
                    Err(err)
                }
            }
        })
    }
}
