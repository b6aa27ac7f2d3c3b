//! Tests for the hyper transport over a real TCP socket.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use hearth::{ContainerConfig, Context, handler_fn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Running {
    addr: SocketAddr,
    ctx: Arc<Context>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<hearth::Result<()>>,
}

async fn start(config: ContainerConfig) -> Running {
    let mut ctx = Context::new(config).unwrap();
    ctx.add_handler(
        "hello",
        handler_fn(|req, res| {
            let name = req.parameter("name").unwrap_or("world").to_owned();
            res.set_content_type("text/plain");
            write!(res.writer()?, "Hello,{name}!")?;
            Ok(())
        }),
    )
    .unwrap()
    .add_mapping(["/hello"])
    .unwrap();
    ctx.add_handler(
        "echo",
        handler_fn(|req, res| {
            let body = req.body().clone();
            let mut out = res.output_stream()?;
            std::io::Write::write_all(&mut out, &body)?;
            Ok(())
        }),
    )
    .unwrap()
    .add_mapping(["/echo"])
    .unwrap();
    ctx.init().unwrap();
    let ctx = Arc::new(ctx);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(hearth::server::run(listener, Arc::clone(&ctx), async {
        let _ = stopped.await;
    }));
    Running { addr, ctx, stop, task }
}

async fn exchange(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    String::from_utf8(raw).unwrap()
}

#[tokio::test]
async fn test_fixed_length_response() {
    let server = start(ContainerConfig::default()).await;

    let reply = exchange(
        server.addr,
        "GET /hello?name=Ann HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    let lower = reply.to_ascii_lowercase();
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
    assert!(lower.contains("content-length: 10\r\n"), "{reply}");
    assert!(lower.contains("server: hearth/"), "{reply}");
    assert!(reply.ends_with("\r\n\r\nHello,Ann!"), "{reply}");

    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_large_body_is_chunked_on_the_wire() {
    let config = ContainerConfig { buffer_size: 8, ..ContainerConfig::default() };
    let server = start(config).await;

    let payload = "x".repeat(100);
    let request = format!(
        "POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 100\r\nConnection: close\r\n\r\n{payload}"
    );
    let reply = exchange(server.addr, &request).await;
    let lower = reply.to_ascii_lowercase();
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
    assert!(lower.contains("transfer-encoding: chunked\r\n"), "{reply}");
    assert!(!lower.contains("content-length"), "{reply}");
    assert!(reply.ends_with("0\r\n\r\n"), "{reply}");
    assert_eq!(reply.matches('x').count(), 100);

    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unmapped_path_is_404_on_the_wire() {
    let server = start(ContainerConfig::default()).await;

    let reply = exchange(server.addr, "GET /nope HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;
    assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"), "{reply}");
    assert!(reply.ends_with(hearth::builtin::NOT_FOUND_BODY), "{reply}");

    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_keep_alive_serves_several_requests() {
    let server = start(ContainerConfig::default()).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /hello?name=A HTTP/1.1\r\nHost: localhost\r\n\r\nGET /hello?name=B HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let reply = String::from_utf8(raw).unwrap();

    assert_eq!(reply.matches("HTTP/1.1 200 OK").count(), 2, "{reply}");
    assert!(reply.contains("Hello,A!"));
    assert!(reply.ends_with("Hello,B!"));

    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_the_context() {
    let server = start(ContainerConfig::default()).await;
    let session = server.ctx.sessions().create_session();
    exchange(server.addr, "GET /hello HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;

    server.stop.send(()).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), server.task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();

    assert!(!session.is_valid());
    assert!(server.ctx.sessions().is_empty());
}
