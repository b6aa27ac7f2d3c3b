//! Tests for building a context from a TOML manifest.

use std::fmt::Write as _;
use std::sync::Arc;

use bytes::Bytes;
use hearth::{
    BoxError, ComponentConfig, Components, ContainerConfig, Context, Error, Handler, Manifest, Recorded,
    RecordingExchange, Request, Response,
};
use http::StatusCode;
use parking_lot::Mutex;

const MANIFEST: &str = r#"
[context_params]
site = "demo"

[[handler]]
name = "liveness"
kind = "liveness"
mappings = ["/healthz"]

[[handler]]
name = "greeter"
kind = "greeter"
mappings = ["/greet", "*.hi"]
load_priority = 1

[handler.init_params]
punctuation = "?"

[[middleware]]
name = "trace"
kind = "request_trace"
url_patterns = ["/*"]
"#;

#[derive(Default)]
struct Greeter {
    punctuation: Mutex<String>,
}

impl Handler for Greeter {
    fn init(&self, config: &ComponentConfig) -> Result<(), BoxError> {
        *self.punctuation.lock() = config.init_parameter("punctuation").unwrap_or("!").to_owned();
        Ok(())
    }

    fn handle(&self, req: &mut Request, res: &mut Response) -> Result<(), BoxError> {
        let punctuation = self.punctuation.lock().clone();
        write!(res.writer()?, "{} from {}{punctuation}", req.path(), req.context_path())?;
        Ok(())
    }
}

fn components() -> Components {
    Components::with_builtins().handler("greeter", Greeter::default)
}

fn call(ctx: &Context, uri: &str) -> Recorded {
    let exchange = RecordingExchange::new();
    let req = http::Request::builder().uri(uri).body(Bytes::new()).unwrap();
    ctx.handle(req, None, exchange.clone());
    exchange.snapshot()
}

fn context() -> Context {
    let mut ctx = Context::new(ContainerConfig::default()).unwrap();
    Manifest::from_toml_str(MANIFEST).unwrap().apply(&mut ctx, &components()).unwrap();
    ctx.init().unwrap();
    ctx
}

#[test]
fn test_builtin_liveness_from_manifest() {
    let ctx = context();
    let rec = call(&ctx, "/healthz");
    assert_eq!(rec.status, Some(StatusCode::OK));
    assert_eq!(rec.body_text(), "ok");
}

#[test]
fn test_custom_kind_receives_init_params() {
    let ctx = context();
    assert_eq!(call(&ctx, "/greet").body_text(), "/greet from ?");
    assert_eq!(call(&ctx, "/x/y.hi").body_text(), "/x/y.hi from ?");
}

#[test]
fn test_registrations_are_introspectable() {
    let mut ctx = Context::new(ContainerConfig::default()).unwrap();
    Manifest::from_toml_str(MANIFEST).unwrap().apply(&mut ctx, &components()).unwrap();

    assert_eq!(ctx.init_parameter("site"), Some("demo"));
    assert_eq!(ctx.handler_names().collect::<Vec<_>>(), ["greeter", "liveness"]);
    assert_eq!(ctx.middleware_names().collect::<Vec<_>>(), ["trace"]);

    let greeter = ctx.handler_registration("greeter").unwrap();
    assert_eq!(greeter.load_priority(), 1);
    assert_eq!(greeter.init_parameter("punctuation"), Some("?"));
    let mappings: Vec<String> = greeter.mappings().map(str::to_owned).collect();
    assert_eq!(mappings, ["/greet", "*.hi"]);

    let trace = ctx.middleware_registration("trace").unwrap();
    let patterns: Vec<String> = trace.url_pattern_mappings().map(str::to_owned).collect();
    assert_eq!(patterns, ["/*"]);
    assert_eq!(trace.handler_name_mappings().count(), 0);
}

#[test]
fn test_unmapped_path_still_404s_through_middleware() {
    let ctx = context();
    let rec = call(&ctx, "/nowhere");
    assert_eq!(rec.status, Some(StatusCode::NOT_FOUND));
    assert_eq!(rec.body_text(), hearth::builtin::NOT_FOUND_BODY);
}

#[test]
fn test_invalid_pattern_in_manifest_fails_apply() {
    let manifest = Manifest::from_toml_str("[[handler]]\nname = \"h\"\nkind = \"liveness\"\nmappings = [\"/a/*/b\"]\n").unwrap();
    let mut ctx = Context::new(ContainerConfig::default()).unwrap();
    let err = manifest.apply(&mut ctx, &components()).unwrap_err();
    assert!(matches!(err, Error::InvalidPattern { .. }));
}

#[test]
fn test_load_from_file() {
    let path = std::env::temp_dir().join(format!("hearth-manifest-{}.toml", std::process::id()));
    std::fs::write(&path, MANIFEST).unwrap();
    let manifest = Manifest::load(&path);
    std::fs::remove_file(&path).unwrap();

    let manifest = manifest.unwrap();
    assert_eq!(manifest.handlers.len(), 2);
    assert_eq!(manifest.middleware[0].kind, "request_trace");
    assert!(matches!(Manifest::load(&path), Err(Error::Io(_))));
}

#[test]
fn test_shared_component_instance() {
    let greeter = Arc::new(Greeter::default());
    let mut ctx = Context::new(ContainerConfig::default()).unwrap();
    ctx.add_handler("direct", Arc::clone(&greeter)).unwrap().add_mapping(["/direct"]).unwrap();
    ctx.init().unwrap();

    assert_eq!(call(&ctx, "/direct").body_text(), "/direct from !");
    assert_eq!(*greeter.punctuation.lock(), "!");
}
