//! Built-in handlers.
//!
//! | Handler | Typical mapping | Response |
//! |---|---|---|
//! | [`NotFound`] | `/` | `404` with a plain-text body |
//! | [`Liveness`] | `/healthz` | `200 ok` |
//!
//! The context itself answers unmatched paths with the same 404 as
//! [`NotFound`]; mapping it at `/` only matters when a middleware should see
//! those requests too.
//!
//! ```rust,no_run
//! use hearth::{ContainerConfig, Context, builtin};
//!
//! let mut ctx = Context::new(ContainerConfig::default())?;
//! ctx.add_handler("liveness", builtin::Liveness)?.add_mapping(["/healthz"])?;
//! # Ok::<(), hearth::Error>(())
//! ```

use http::StatusCode;

use crate::error::{BoxError, Result};
use crate::handler::Handler;
use crate::request::Request;
use crate::response::{ContentType, Response};

/// Body of the default 404.
pub const NOT_FOUND_BODY: &str = "404 NOT FOUND!";

/// Sends the default 404.
pub fn not_found(res: &mut Response) -> Result<()> {
    res.send_error(StatusCode::NOT_FOUND, NOT_FOUND_BODY)
}

/// Sent while the context is not initialized or already shut down.
pub(crate) fn unavailable(res: &mut Response) -> Result<()> {
    res.send_error(StatusCode::SERVICE_UNAVAILABLE, "503 SERVICE UNAVAILABLE!")
}

/// Answers every request with the default 404.
#[derive(Clone, Copy, Debug, Default)]
pub struct NotFound;

impl Handler for NotFound {
    fn handle(&self, _req: &mut Request, res: &mut Response) -> std::result::Result<(), BoxError> {
        Ok(not_found(res)?)
    }
}

/// Liveness probe.
///
/// Always returns `200 OK` with body `"ok"`. If the container can answer at
/// all, it is alive; this handler intentionally has no dependencies.
#[derive(Clone, Copy, Debug, Default)]
pub struct Liveness;

impl Handler for Liveness {
    fn handle(&self, _req: &mut Request, res: &mut Response) -> std::result::Result<(), BoxError> {
        res.set_content_type(ContentType::Text);
        res.writer()?.print("ok")?;
        Ok(())
    }
}
