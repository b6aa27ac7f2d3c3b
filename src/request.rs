//! The request as seen by handlers and middleware.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri, Version, header};
use parking_lot::Mutex;
use tracing::warn;

use crate::cookie::Cookie;
use crate::error::{Error, Result};
use crate::observer::{AttributeEvent, AttributeScope, AttributeValue, Observers};
use crate::session::{Session, SessionManager};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// How the request reached its handler. Only direct dispatch exists.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchKind {
    Direct,
}

/// Authentication scheme announced in the `Authorization` header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthScheme {
    Basic,
    Digest,
}

/// Session affinity for one exchange, shared by its request and response.
///
/// The request resolves or creates the session; the response reads this
/// link at commit time to decide whether to advertise the id in a cookie.
pub(crate) struct SessionLink {
    manager: Arc<SessionManager>,
    state: Mutex<LinkState>,
}

#[derive(Default)]
struct LinkState {
    /// Id sent by the client, whether or not it still exists.
    requested: Option<String>,
    /// Id of the session bound to this exchange.
    current: Option<String>,
    /// The bound id still has to be sent to the client.
    needs_cookie: bool,
    /// The response head is out; a new id could no longer reach the client.
    committed: bool,
}

impl SessionLink {
    pub(crate) fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager, state: Mutex::new(LinkState::default()) }
    }

    fn resolve(&self, requested: &str) {
        let mut state = self.state.lock();
        state.requested = Some(requested.to_owned());
        if self.manager.touch(requested).is_some() {
            state.current = Some(requested.to_owned());
        }
    }

    pub(crate) fn session(&self, create: bool) -> Option<Arc<Session>> {
        let mut state = self.state.lock();
        if let Some(session) = state.current.as_deref().and_then(|id| self.manager.get(id)) {
            return Some(session);
        }
        if !create {
            return None;
        }
        if state.committed {
            warn!("response already committed; not creating a session the client would never see");
            return None;
        }
        let session = self.manager.create_session();
        state.current = Some(session.id());
        state.needs_cookie = true;
        Some(session)
    }

    fn change_id(&self) -> Result<String> {
        let mut state = self.state.lock();
        let session = state
            .current
            .as_deref()
            .and_then(|id| self.manager.get(id))
            .ok_or(Error::IllegalState("no session is associated with the request"))?;
        if state.committed {
            return Err(Error::IllegalState("cannot change the session id after the response has been committed"));
        }
        let id = self.manager.change_session_id(&session)?;
        state.current = Some(id.clone());
        state.needs_cookie = true;
        Ok(id)
    }

    fn requested(&self) -> Option<String> {
        self.state.lock().requested.clone()
    }

    /// Called once at commit: the id to advertise, if any. From here on no
    /// new session is handed out for this exchange.
    pub(crate) fn claim_cookie(&self) -> Option<String> {
        let mut state = self.state.lock();
        state.committed = true;
        if !state.needs_cookie {
            return None;
        }
        let id = state.current.clone()?;
        self.manager.get(&id)?;
        state.needs_cookie = false;
        Some(id)
    }
}

/// An incoming HTTP request, after the transport has parsed it.
pub struct Request {
    id: u64,
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
    context_path: String,
    params: Vec<(String, String)>,
    cookies: Vec<Cookie>,
    attributes: HashMap<String, AttributeValue>,
    character_encoding: Option<String>,
    session: Arc<SessionLink>,
    observers: Arc<Observers>,
}

impl Request {
    pub(crate) fn new(
        raw: http::Request<Bytes>,
        remote_addr: Option<SocketAddr>,
        context_path: &str,
        cookie_name: &str,
        session: Arc<SessionLink>,
        observers: Arc<Observers>,
    ) -> Self {
        let (parts, body) = raw.into_parts();

        let mut params = parse_query(parts.uri.query());
        let is_form = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        if is_form {
            params.extend(
                url::form_urlencoded::parse(&body).map(|(k, v)| (k.into_owned(), v.into_owned())),
            );
        }

        let cookies: Vec<Cookie> = parts
            .headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(Cookie::parse_header)
            .collect();
        if let Some(c) = cookies.iter().find(|c| c.name() == cookie_name) {
            session.resolve(c.value());
        }

        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
            remote_addr,
            context_path: context_path.to_owned(),
            params,
            cookies,
            attributes: HashMap::new(),
            character_encoding: None,
            session,
            observers,
        }
    }

    /// Process-unique request number, handy for log correlation.
    pub fn id(&self) -> u64 { self.id }
    pub fn method(&self) -> &Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn version(&self) -> Version { self.version }
    /// Full request path, mount path included.
    pub fn path(&self) -> &str { self.uri.path() }
    pub fn query_string(&self) -> Option<&str> { self.uri.query() }
    /// The mount path; empty when mounted at `/`.
    pub fn context_path(&self) -> &str { &self.context_path }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &Bytes { &self.body }
    pub fn cookies(&self) -> &[Cookie] { &self.cookies }
    pub fn dispatch_kind(&self) -> DispatchKind { DispatchKind::Direct }

    /// The body as a byte reader.
    pub fn body_reader(&self) -> impl std::io::Read + '_ {
        self.body.as_ref()
    }

    /// First value of a header. Names are case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Every value of a header, in arrival order.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    pub fn header_names(&self) -> impl Iterator<Item = &str> {
        self.headers.keys().map(|k| k.as_str())
    }

    /// A header parsed as an integer; `None` when absent or not a number.
    pub fn int_header(&self, name: &str) -> Option<i64> {
        self.header(name)?.trim().parse().ok()
    }

    /// A header parsed as an HTTP date.
    pub fn date_header(&self, name: &str) -> Option<SystemTime> {
        let parsed = chrono::DateTime::parse_from_rfc2822(self.header(name)?.trim()).ok()?;
        Some(parsed.with_timezone(&chrono::Utc).into())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE.as_str())
    }

    /// Length of the body as received.
    pub fn content_length(&self) -> usize {
        self.body.len()
    }

    /// Host name from the `Host` header, without the port.
    pub fn server_name(&self) -> Option<&str> {
        let host = self.header(header::HOST.as_str())?;
        let name = match host.strip_prefix('[') {
            // [v6]:port
            Some(rest) => rest.split(']').next().unwrap_or(rest),
            None => host.split(':').next().unwrap_or(host),
        };
        (!name.is_empty()).then_some(name)
    }

    pub fn auth_scheme(&self) -> Option<AuthScheme> {
        let auth = self.header(header::AUTHORIZATION.as_str())?;
        if auth.starts_with("Basic ") {
            Some(AuthScheme::Basic)
        } else if auth.starts_with("Digest ") {
            Some(AuthScheme::Digest)
        } else {
            None
        }
    }

    pub fn character_encoding(&self) -> Option<&str> {
        self.character_encoding.as_deref()
    }

    pub fn set_character_encoding(&mut self, encoding: impl Into<String>) {
        self.character_encoding = Some(encoding.into());
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name() == name)
    }

    // ── Parameters ───────────────────────────────────────────────────────────

    /// First value of a query (or urlencoded form) parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values of a parameter, in the order they appeared.
    pub fn parameter_values(&self, name: &str) -> Vec<&str> {
        self.params
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Distinct parameter names in first-seen order.
    pub fn parameter_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for (k, _) in &self.params {
            if !names.contains(&k.as_str()) {
                names.push(k);
            }
        }
        names
    }

    // ── Attributes ───────────────────────────────────────────────────────────

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn attribute_as<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.attributes.get(name).cloned()?.downcast::<T>().ok()
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: AttributeValue) {
        let name = name.into();
        match self.attributes.insert(name.clone(), Arc::clone(&value)) {
            Some(old) => self.observers.attribute_replaced(&request_event(&name, &old)),
            None => self.observers.attribute_added(&request_event(&name, &value)),
        }
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<AttributeValue> {
        let removed = self.attributes.remove(name)?;
        self.observers.attribute_removed(&request_event(name, &removed));
        Some(removed)
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    /// The session bound to this request.
    ///
    /// With `create == false` returns `None` when the client sent no valid
    /// session id. With `create == true` a new session is created instead,
    /// and its id is advertised when the response commits. Once the response
    /// has committed no session is created and this returns `None`.
    pub fn session(&self, create: bool) -> Option<Arc<Session>> {
        self.session.session(create)
    }

    /// Gives the current session a fresh id, keeping its attributes.
    ///
    /// Fails with [`Error::IllegalState`] when no session is bound or the
    /// response has already committed.
    pub fn change_session_id(&self) -> Result<String> {
        self.session.change_id()
    }

    /// The session id the client sent, valid or not.
    pub fn requested_session_id(&self) -> Option<String> {
        self.session.requested()
    }

    /// Whether the id the client sent names a live session.
    pub fn is_requested_session_id_valid(&self) -> bool {
        self.requested_session_id()
            .and_then(|id| self.session.manager.get(&id))
            .is_some()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

fn request_event<'a>(name: &'a str, value: &'a AttributeValue) -> AttributeEvent<'a> {
    AttributeEvent { scope: AttributeScope::Request, name, value, session_id: None }
}

fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(raw: http::Request<Bytes>) -> (Request, Arc<SessionManager>) {
        let observers = Arc::new(Observers::default());
        let manager = Arc::new(SessionManager::new(60, Duration::from_secs(1), Arc::clone(&observers)));
        let link = Arc::new(SessionLink::new(Arc::clone(&manager)));
        (Request::new(raw, None, "/", "jsessionid", link, observers), manager)
    }

    fn get(uri: &str) -> http::Request<Bytes> {
        http::Request::builder().uri(uri).body(Bytes::new()).unwrap()
    }

    #[test]
    fn parameters_keep_order_and_decode() {
        let (req, _) = request(get("/p?b=2&a=1&b=3&name=J%C3%BCrgen+X&flag"));
        assert_eq!(req.parameter("b"), Some("2"));
        assert_eq!(req.parameter_values("b"), ["2", "3"]);
        assert_eq!(req.parameter("name"), Some("Jürgen X"));
        assert_eq!(req.parameter("flag"), Some(""));
        assert_eq!(req.parameter_names(), ["b", "a", "name", "flag"]);
        assert_eq!(req.parameter("missing"), None);
    }

    #[test]
    fn form_body_parameters_follow_query() {
        let raw = http::Request::builder()
            .method(Method::POST)
            .uri("/f?a=q")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Bytes::from_static(b"a=form&b=2"))
            .unwrap();
        let (req, _) = request(raw);
        assert_eq!(req.parameter_values("a"), ["q", "form"]);
        assert_eq!(req.parameter("b"), Some("2"));
    }

    #[test]
    fn server_name_strips_port() {
        let raw = http::Request::builder().uri("/").header("host", "example.com:8080").body(Bytes::new()).unwrap();
        assert_eq!(request(raw).0.server_name(), Some("example.com"));
        let raw = http::Request::builder().uri("/").header("host", "[::1]:80").body(Bytes::new()).unwrap();
        assert_eq!(request(raw).0.server_name(), Some("::1"));
    }

    #[test]
    fn detects_auth_scheme() {
        let raw = http::Request::builder().uri("/").header("authorization", "Basic Zm9vOmJhcg==").body(Bytes::new()).unwrap();
        assert_eq!(request(raw).0.auth_scheme(), Some(AuthScheme::Basic));
        assert_eq!(request(get("/")).0.auth_scheme(), None);
    }

    #[test]
    fn date_and_int_headers() {
        let raw = http::Request::builder()
            .uri("/")
            .header("if-modified-since", "Thu, 01 Jan 1970 00:00:10 GMT")
            .header("x-count", "42")
            .header("x-bad", "forty")
            .body(Bytes::new())
            .unwrap();
        let (req, _) = request(raw);
        assert_eq!(
            req.date_header("if-modified-since"),
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(10))
        );
        assert_eq!(req.int_header("x-count"), Some(42));
        assert_eq!(req.int_header("x-bad"), None);
    }

    #[test]
    fn session_cookie_round_trip_touches_session() {
        let observers = Arc::new(Observers::default());
        let manager = Arc::new(SessionManager::new(60, Duration::from_secs(1), Arc::clone(&observers)));
        let existing = manager.create_session();

        let raw = http::Request::builder()
            .uri("/")
            .header("cookie", format!("theme=dark; jsessionid={}", existing.id()))
            .body(Bytes::new())
            .unwrap();
        let link = Arc::new(SessionLink::new(Arc::clone(&manager)));
        let req = Request::new(raw, None, "/", "jsessionid", Arc::clone(&link), observers);

        let session = req.session(false).unwrap();
        assert_eq!(session.id(), existing.id());
        assert!(!session.is_new().unwrap());
        assert!(req.is_requested_session_id_valid());
        assert_eq!(link.claim_cookie(), None);
    }

    #[test]
    fn unknown_session_cookie_is_not_revived() {
        let raw = http::Request::builder().uri("/").header("cookie", "jsessionid=stale").body(Bytes::new()).unwrap();
        let (req, manager) = request(raw);
        assert!(req.session(false).is_none());
        assert_eq!(req.requested_session_id().as_deref(), Some("stale"));
        assert!(!req.is_requested_session_id_valid());
        assert!(manager.is_empty());
    }

    #[test]
    fn change_session_id_requires_a_session() {
        let (req, _) = request(get("/"));
        assert!(matches!(req.change_session_id(), Err(Error::IllegalState(_))));
        let session = req.session(true).unwrap();
        let old = session.id();
        let new = req.change_session_id().unwrap();
        assert_ne!(old, new);
        assert_eq!(req.session(false).unwrap().id(), new);
    }
}
