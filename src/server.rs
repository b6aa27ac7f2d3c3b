//! HTTP transport and graceful shutdown.
//!
//! hyper does the socket and protocol work; each request is handed to
//! [`Context::handle`] on a blocking worker thread, with an [`Exchange`] whose
//! head travels back over a oneshot channel and whose body is streamed to
//! hyper through a bounded mpsc channel:
//!
//! ```text
//! hyper conn task ──collect body──▶ spawn_blocking(ctx.handle) ──send_head──▶ oneshot ──▶ http::Response
//!                                                           └──write_body──▶ mpsc ──▶ ExchangeBody (polled by hyper)
//! ```
//!
//! # Graceful shutdown
//!
//! On SIGTERM or Ctrl-C the server:
//! 1. Stops `listener.accept()`; no new connections are made.
//! 2. Asks every open connection to finish its in-flight request and close.
//! 3. Waits for every connection task, then shuts the [`Context`] down
//!    (session sweep stopped, sessions invalidated, components destroyed).

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{HeaderMap, StatusCode};
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::error::Result;
use crate::exchange::{Exchange, Framing};

/// Body chunks buffered between the worker thread and hyper.
const BODY_CHANNEL_DEPTH: usize = 16;

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called. Fails with [`Error::Addr`](crate::Error::Addr) if `addr` is
    /// not a valid `host:port` string.
    ///
    /// ```rust
    /// use hearth::Server;
    /// let server = Server::bind("0.0.0.0:3000")?;
    /// # Ok::<(), hearth::Error>(())
    /// ```
    pub fn bind(addr: &str) -> Result<Self> {
        Ok(Self { addr: addr.parse()? })
    }

    /// Serves `ctx` until SIGTERM or Ctrl-C, then shuts down gracefully.
    pub async fn serve(self, ctx: Arc<Context>) -> Result<()> {
        self.serve_with_shutdown(ctx, shutdown_signal()).await
    }

    /// Like [`serve`](Server::serve) but stops when `signal` resolves.
    pub async fn serve_with_shutdown(self, ctx: Arc<Context>, signal: impl Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        run(listener, ctx, signal).await
    }
}

/// Serves `ctx` on an already bound listener until `signal` resolves.
pub async fn run(listener: TcpListener, ctx: Arc<Context>, signal: impl Future<Output = ()>) -> Result<()> {
    let local = listener.local_addr()?;
    info!(addr = %local, context_path = %ctx.context_path(), "hearth listening");

    let mut tasks = tokio::task::JoinSet::new();
    let (stop_tx, stop_rx) = watch::channel(false);

    tokio::pin!(signal);

    loop {
        tokio::select! {
            // Checked first so a shutdown request stops accepting immediately,
            // even if more connections are queued.
            biased;

            () = &mut signal => {
                info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                break;
            }

            res = listener.accept() => {
                let (stream, remote_addr) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };
                tasks.spawn(serve_connection(
                    TokioIo::new(stream),
                    remote_addr,
                    Arc::clone(&ctx),
                    stop_rx.clone(),
                ));
            }

            // Reap finished connection tasks so the JoinSet does not grow
            // without bound on long-running servers.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    let _ = stop_tx.send(true);
    while tasks.join_next().await.is_some() {}

    ctx.shutdown().await;
    info!("hearth stopped");
    Ok(())
}

async fn serve_connection(
    io: TokioIo<tokio::net::TcpStream>,
    remote_addr: SocketAddr,
    ctx: Arc<Context>,
    mut stop: watch::Receiver<bool>,
) {
    // Called once per request on the connection, not once per connection.
    let svc = service_fn(move |req| dispatch(Arc::clone(&ctx), req, remote_addr));

    // `auto::Builder` handles both HTTP/1.1 and HTTP/2, whatever the client
    // negotiates.
    let builder = ConnBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, svc);
    tokio::pin!(conn);

    let mut stopping = false;
    loop {
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    debug!(peer = %remote_addr, "connection error: {e}");
                }
                break;
            }
            _ = stop.changed(), if !stopping => {
                stopping = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Runs one request through the context.
///
/// The error type is [`Infallible`]: every failure becomes a response, so
/// hyper never sees an error.
async fn dispatch(
    ctx: Arc<Context>,
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
) -> std::result::Result<http::Response<ExchangeBody>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(peer = %remote_addr, "failed to read request body: {e}");
            return Ok(bare(StatusCode::BAD_REQUEST));
        }
    };
    let raw = http::Request::from_parts(parts, body);

    let (exchange, head, body) = ChannelExchange::new();
    let worker = tokio::task::spawn_blocking(move || ctx.handle(raw, Some(remote_addr), exchange));

    match head.await {
        Ok(head) => Ok(head.into_response(body)),
        Err(_) => {
            // The exchange was dropped without a head: the worker died.
            if let Err(e) = worker.await {
                error!(peer = %remote_addr, "request worker failed: {e}");
            }
            Ok(bare(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

fn bare(status: StatusCode) -> http::Response<ExchangeBody> {
    let mut res = http::Response::new(ExchangeBody::empty());
    *res.status_mut() = status;
    res.headers_mut().insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    res
}

// ── Channel exchange ─────────────────────────────────────────────────────────

struct Head {
    status: StatusCode,
    headers: HeaderMap,
    framing: Framing,
}

impl Head {
    fn into_response(self, mut body: ExchangeBody) -> http::Response<ExchangeBody> {
        let mut headers = self.headers;
        match self.framing {
            Framing::Empty => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0u64));
                body.exact = Some(0);
            }
            Framing::Fixed(n) => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(n));
                body.exact = Some(n);
            }
            Framing::Chunked => {
                headers.remove(header::CONTENT_LENGTH);
            }
        }
        let mut res = http::Response::new(body);
        *res.status_mut() = self.status;
        *res.headers_mut() = headers;
        res
    }
}

/// [`Exchange`] used on worker threads. Blocks when hyper falls behind.
///
/// Must not be driven from inside an async task: `write_body` uses a
/// blocking send.
struct ChannelExchange {
    head: Option<oneshot::Sender<Head>>,
    body: Option<mpsc::Sender<Bytes>>,
}

impl ChannelExchange {
    fn new() -> (Self, oneshot::Receiver<Head>, ExchangeBody) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
        let exchange = Self { head: Some(head_tx), body: Some(body_tx) };
        (exchange, head_rx, ExchangeBody { rx: body_rx, exact: None })
    }
}

fn disconnected() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client connection closed")
}

impl Exchange for ChannelExchange {
    fn send_head(&mut self, status: StatusCode, headers: &HeaderMap, framing: Framing) -> io::Result<()> {
        let tx = self
            .head
            .take()
            .ok_or_else(|| io::Error::other("response head already sent"))?;
        tx.send(Head { status, headers: headers.clone(), framing })
            .map_err(|_| disconnected())
    }

    fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        let tx = self.body.as_ref().ok_or_else(disconnected)?;
        tx.blocking_send(Bytes::copy_from_slice(chunk))
            .map_err(|_| disconnected())
    }

    fn close(&mut self) -> io::Result<()> {
        self.body = None;
        self.head = None;
        Ok(())
    }
}

/// Response body fed by a [`ChannelExchange`].
struct ExchangeBody {
    rx: mpsc::Receiver<Bytes>,
    exact: Option<u64>,
}

impl ExchangeBody {
    fn empty() -> Self {
        let (_, rx) = mpsc::channel(1);
        Self { rx, exact: Some(0) }
    }
}

impl Body for ExchangeBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, Infallible>>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(|data| Ok(Frame::data(data))))
    }

    fn is_end_stream(&self) -> bool {
        self.exact == Some(0)
    }

    fn size_hint(&self) -> SizeHint {
        match self.exact {
            Some(n) => SizeHint::with_exact(n),
            None => SizeHint::default(),
        }
    }
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** (sent by `kubectl` and the
/// Kubernetes control plane) and **SIGINT** (Ctrl-C, for local dev).
/// On Windows only Ctrl-C is available. A handler that cannot be installed
/// is logged and never fires.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    // `pending()` is a future that never resolves; on non-Unix platforms
    // the SIGTERM arm is effectively disabled.
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
