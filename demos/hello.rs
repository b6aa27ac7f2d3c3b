//! Minimal hearth example: a greeting, a session counter, an auth gate and a
//! liveness probe, wired from code plus a TOML manifest.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example hello
//!
//! Try:
//!   curl 'http://localhost:3000/app/hello?name=Ann'
//!   curl -c jar -b jar http://localhost:3000/app/visits
//!   curl http://localhost:3000/app/admin/panel
//!   curl -H 'authorization: Basic YWRtaW46YWRtaW4=' http://localhost:3000/app/admin/panel
//!   curl http://localhost:3000/app/healthz

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hearth::{
    AuthScheme, BoxError, Components, ContainerConfig, ContentType, Context, Manifest, Request, Response, Server,
    handler_fn, middleware_fn,
};
use http::StatusCode;
use tracing_subscriber::EnvFilter;

const MANIFEST: &str = r#"
[context_params]
greeting = "Hello"

[[handler]]
name = "liveness"
kind = "liveness"
mappings = ["/healthz"]

[[middleware]]
name = "trace"
kind = "request_trace"
url_patterns = ["/*"]
"#;

#[tokio::main]
async fn main() -> hearth::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ContainerConfig::from_toml_str("context_path = \"/app\"\nsession_timeout_secs = 1800\n")?;
    let mut ctx = Context::new(config)?;

    Manifest::from_toml_str(MANIFEST)?.apply(&mut ctx, &Components::with_builtins())?;

    ctx.add_handler("hello", handler_fn(hello))?
        .add_mapping(["/hello"])?
        .set_load_priority(0)?;
    ctx.add_handler("visits", handler_fn(visits))?.add_mapping(["/visits"])?;
    ctx.add_handler("admin", handler_fn(admin))?.add_mapping(["/admin/*"])?;

    // Only requests routed to `admin` pass through the gate.
    ctx.add_middleware(
        "basic-auth",
        middleware_fn(|req, res, next| {
            if req.auth_scheme() == Some(AuthScheme::Basic) {
                return next.run(req, res);
            }
            res.set_header("www-authenticate", "Basic realm=\"hearth\"");
            res.send_error(StatusCode::UNAUTHORIZED, "401 UNAUTHORIZED")?;
            Ok(())
        }),
    )?
    .add_mapping_for_handler_names(["admin"])?;

    ctx.init()?;
    Server::bind("0.0.0.0:3000")?.serve(Arc::new(ctx)).await
}

// GET /app/hello?name=Ann → "Hello,Ann!"
fn hello(req: &mut Request, res: &mut Response) -> Result<(), BoxError> {
    let name = req.parameter("name").unwrap_or("world").to_owned();
    res.set_content_type(ContentType::Text);
    write!(res.writer()?, "Hello,{name}!")?;
    Ok(())
}

// GET /app/visits: per-session counter; the first response sets the cookie.
fn visits(req: &mut Request, res: &mut Response) -> Result<(), BoxError> {
    let Some(session) = req.session(true) else {
        return Err("session unavailable".into());
    };
    let count = match session.attribute_as::<AtomicU64>("visits")? {
        Some(counter) => counter.fetch_add(1, Ordering::Relaxed) + 1,
        None => {
            session.set_attribute("visits", Arc::new(AtomicU64::new(1)))?;
            1
        }
    };
    res.set_content_type(ContentType::Text);
    write!(res.writer()?, "visit #{count} (session {})", session.id())?;
    Ok(())
}

// GET /app/admin/*
fn admin(req: &mut Request, res: &mut Response) -> Result<(), BoxError> {
    res.set_content_type(ContentType::Html);
    write!(res.writer()?, "<h1>admin</h1><p>{}</p>", req.path())?;
    Ok(())
}
