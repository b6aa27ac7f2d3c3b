//! Per-request tracing.

use std::time::Instant;

use tracing::{Level, info, span, warn};

use crate::error::BoxError;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

/// Opens an `INFO` span per request and logs status and latency when the
/// rest of the chain returns.
///
/// Map it at `/*` to cover every request.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestTrace;

impl Middleware for RequestTrace {
    fn intercept(&self, req: &mut Request, res: &mut Response, next: Next<'_>) -> Result<(), BoxError> {
        let span = span!(
            Level::INFO,
            "request",
            id = req.id(),
            method = %req.method(),
            path = %req.path(),
        );
        let _entered = span.enter();
        let started = Instant::now();

        let outcome = next.run(req, res);

        let latency_us = started.elapsed().as_micros() as u64;
        match &outcome {
            Ok(()) => info!(status = res.status().as_u16(), latency_us, "request completed"),
            Err(e) => warn!(status = res.status().as_u16(), latency_us, error = %e, "request failed"),
        }
        outcome
    }
}
