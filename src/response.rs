//! The response commit state machine.
//!
//! A [`Response`] starts *open*: status, headers and content type may change
//! freely and body bytes collect in a buffer. The first time bytes leave that
//! buffer (overflow, [`flush_buffer`](Response::flush_buffer), an error or
//! redirect, or the end of the request) the response *commits*: the head is
//! sent to the [`Exchange`] and every header API turns into a silent no-op.
//!
//! ```text
//! open ──commit──▶ committed ──close──▶ closed
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use tracing::{trace, warn};

use crate::cookie::{Cookie, http_date};
use crate::error::{Error, Result};
use crate::exchange::{Exchange, Framing};
use crate::request::SessionLink;

// ── ContentType ───────────────────────────────────────────────────────────────

/// Common content-type values for [`Response::set_content_type`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentType {
    Csv,          // text/csv
    EventStream,  // text/event-stream  (SSE)
    FormData,     // application/x-www-form-urlencoded
    Html,         // text/html; charset=utf-8
    Json,         // application/json
    OctetStream,  // application/octet-stream  (binary / file download)
    Text,         // text/plain; charset=utf-8
    Xml,          // application/xml
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv         => "text/csv",
            Self::EventStream => "text/event-stream",
            Self::FormData    => "application/x-www-form-urlencoded",
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Xml         => "application/xml",
        }
    }
}

impl AsRef<str> for ContentType {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

// ── Charset ──────────────────────────────────────────────────────────────────

/// Character encodings the body writer can produce.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Charset {
    Utf8,
    Latin1,
    Ascii,
}

impl Charset {
    fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Self::Utf8),
            "iso-8859-1" | "iso8859-1" | "latin1" | "latin-1" => Some(Self::Latin1),
            "us-ascii" | "ascii" => Some(Self::Ascii),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Utf8 => "UTF-8",
            Self::Latin1 => "ISO-8859-1",
            Self::Ascii => "US-ASCII",
        }
    }

    /// Unmappable characters become `?`.
    fn encode(self, s: &str, out: &mut Vec<u8>) {
        let limit = match self {
            Self::Utf8 => return out.extend_from_slice(s.as_bytes()),
            Self::Latin1 => 0xFF,
            Self::Ascii => 0x7F,
        };
        out.extend(s.chars().map(|c| if (c as u32) <= limit { c as u8 } else { b'?' }));
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Output {
    Writer,
    Stream,
}

/// Values the context fixes for every response it creates.
pub(crate) struct ResponseSettings {
    pub buffer_size: usize,
    pub server_info: Arc<str>,
    pub encoding: Arc<str>,
    pub cookie_name: Arc<str>,
    pub cookie_path: Arc<str>,
}

/// An outgoing HTTP response.
///
/// ```rust,ignore
/// res.set_content_type(ContentType::Text);
/// write!(res.writer()?, "Hello,{name}!")?;
/// ```
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    content_type: Option<String>,
    /// `-1` while undetermined.
    content_length: i64,
    charset: Charset,
    encoding_locked: bool,
    locale: Option<String>,
    buffer: Vec<u8>,
    buffer_size: usize,
    output: Option<Output>,
    committed: bool,
    closed: bool,
    exchange: Box<dyn Exchange>,
    session: Arc<SessionLink>,
    settings: Arc<ResponseSettings>,
    cookie_domain: Option<String>,
}

impl Response {
    pub(crate) fn new(
        exchange: Box<dyn Exchange>,
        session: Arc<SessionLink>,
        settings: Arc<ResponseSettings>,
        cookie_domain: Option<String>,
    ) -> Self {
        let charset = Charset::from_label(&settings.encoding).unwrap_or(Charset::Utf8);
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            content_type: None,
            content_length: -1,
            charset,
            encoding_locked: false,
            locale: None,
            buffer: Vec::with_capacity(settings.buffer_size),
            buffer_size: settings.buffer_size,
            output: None,
            committed: false,
            closed: false,
            exchange,
            session,
            settings,
            cookie_domain,
        }
    }

    pub fn status(&self) -> StatusCode { self.status }
    pub fn is_committed(&self) -> bool { self.committed }
    pub fn buffer_size(&self) -> usize { self.buffer_size }
    pub fn content_type(&self) -> Option<&str> { self.content_type.as_deref() }
    pub fn locale(&self) -> Option<&str> { self.locale.as_deref() }
    pub fn character_encoding(&self) -> &'static str { self.charset.label() }

    pub fn set_status(&mut self, status: StatusCode) {
        if self.frozen("set_status") {
            return;
        }
        self.status = status;
    }

    // ── Headers ──────────────────────────────────────────────────────────────

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

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

    pub fn contains_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    /// Replaces every value of `name`.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if self.frozen("set_header") {
            return;
        }
        if let Some((name, value)) = header_pair(name, value) {
            self.headers.insert(name, value);
        }
    }

    /// Appends a value, keeping existing ones.
    pub fn add_header(&mut self, name: &str, value: &str) {
        if self.frozen("add_header") {
            return;
        }
        if let Some((name, value)) = header_pair(name, value) {
            self.headers.append(name, value);
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        if self.frozen("remove_header") {
            return;
        }
        self.headers.remove(name);
    }

    pub fn set_int_header(&mut self, name: &str, value: i64) {
        self.set_header(name, &value.to_string());
    }

    pub fn add_int_header(&mut self, name: &str, value: i64) {
        self.add_header(name, &value.to_string());
    }

    /// Dates chrono cannot represent are ignored with a warning.
    pub fn set_date_header(&mut self, name: &str, at: SystemTime) {
        match http_date(at) {
            Some(date) => self.set_header(name, &date),
            None => warn!(name, "unrepresentable date header ignored"),
        }
    }

    pub fn add_date_header(&mut self, name: &str, at: SystemTime) {
        match http_date(at) {
            Some(date) => self.add_header(name, &date),
            None => warn!(name, "unrepresentable date header ignored"),
        }
    }

    pub fn add_cookie(&mut self, cookie: &Cookie) {
        self.add_header(header::SET_COOKIE.as_str(), &cookie.encode());
    }

    pub fn set_content_type(&mut self, content_type: impl AsRef<str>) {
        if self.frozen("set_content_type") {
            return;
        }
        self.content_type = Some(content_type.as_ref().to_owned());
    }

    /// Declares the body length. Negative values mean "unknown".
    pub fn set_content_length(&mut self, length: i64) {
        if self.frozen("set_content_length") {
            return;
        }
        self.content_length = length.max(-1);
    }

    /// Ignored once committed or once the writer has been obtained, and for
    /// encodings the writer cannot produce.
    pub fn set_character_encoding(&mut self, label: &str) {
        if self.frozen("set_character_encoding") || self.encoding_locked {
            return;
        }
        match Charset::from_label(label) {
            Some(charset) => self.charset = charset,
            None => warn!(encoding = label, "unsupported response encoding ignored"),
        }
    }

    /// Sets the `Content-Language` sent at commit, e.g. `en-US`.
    pub fn set_locale(&mut self, locale: &str) {
        if self.frozen("set_locale") {
            return;
        }
        self.locale = Some(locale.to_owned());
    }

    // ── Buffer ───────────────────────────────────────────────────────────────

    /// Changes the buffer capacity. Only legal before any body byte.
    pub fn set_buffer_size(&mut self, size: usize) -> Result<()> {
        if self.committed || !self.buffer.is_empty() {
            return Err(Error::IllegalState("buffer size cannot change after content has been written"));
        }
        self.buffer_size = size.max(1);
        self.buffer.reserve(self.buffer_size);
        Ok(())
    }

    /// Discards buffered body bytes, keeping status and headers.
    pub fn reset_buffer(&mut self) -> Result<()> {
        if self.committed {
            return Err(Error::IllegalState("cannot reset the buffer of a committed response"));
        }
        self.buffer.clear();
        Ok(())
    }

    /// Discards buffered bytes, status, headers and content type.
    pub fn reset(&mut self) -> Result<()> {
        if self.committed {
            return Err(Error::IllegalState("cannot reset a committed response"));
        }
        self.buffer.clear();
        self.status = StatusCode::OK;
        self.headers.clear();
        self.content_type = None;
        self.content_length = -1;
        self.locale = None;
        Ok(())
    }

    /// Commits if needed and pushes buffered bytes to the transport.
    pub fn flush_buffer(&mut self) -> Result<()> {
        self.commit()?;
        if !self.buffer.is_empty() {
            self.exchange.write_body(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    // ── Body ─────────────────────────────────────────────────────────────────

    /// Character output, encoded with the response's character encoding.
    ///
    /// Fails if [`output_stream`](Response::output_stream) was used first.
    pub fn writer(&mut self) -> Result<BodyWriter<'_>> {
        self.claim(Output::Writer)?;
        self.encoding_locked = true;
        Ok(BodyWriter { res: self })
    }

    /// Raw byte output. Fails if [`writer`](Response::writer) was used first.
    pub fn output_stream(&mut self) -> Result<BodyStream<'_>> {
        self.claim(Output::Stream)?;
        Ok(BodyStream { res: self })
    }

    fn claim(&mut self, kind: Output) -> Result<()> {
        match self.output {
            Some(current) if current != kind => Err(Error::IllegalState(match kind {
                Output::Writer => "output_stream() has already been called for this response",
                Output::Stream => "writer() has already been called for this response",
            })),
            _ => {
                self.output = Some(kind);
                Ok(())
            }
        }
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::IllegalState("response has been closed"));
        }
        self.buffer.extend_from_slice(data);
        if self.buffer.len() > self.buffer_size {
            self.flush_buffer()?;
        }
        Ok(())
    }

    // ── Terminal operations ──────────────────────────────────────────────────

    /// Sends `status` with `message` as a plain-text body and closes the
    /// exchange. Nothing written before is sent.
    pub fn send_error(&mut self, status: StatusCode, message: &str) -> Result<()> {
        if self.committed {
            return Err(Error::IllegalState("cannot send an error on a committed response"));
        }
        self.buffer.clear();
        self.status = status;
        self.content_type = Some(ContentType::Text.as_str().to_owned());
        self.headers.remove(header::CONTENT_LENGTH);
        self.content_length = message.len() as i64;
        self.commit()?;
        if !message.is_empty() {
            self.exchange.write_body(message.as_bytes())?;
        }
        self.close()
    }

    /// `302 Found` pointing at `location`, with an empty body.
    pub fn send_redirect(&mut self, location: &str) -> Result<()> {
        if self.committed {
            return Err(Error::IllegalState("cannot redirect a committed response"));
        }
        self.buffer.clear();
        self.status = StatusCode::FOUND;
        self.set_header(header::LOCATION.as_str(), location);
        self.headers.remove(header::CONTENT_LENGTH);
        self.content_length = 0;
        self.commit()?;
        self.close()
    }

    /// Ends the exchange: an uncommitted response with no declared length
    /// gets the buffered size as its `Content-Length`.
    pub(crate) fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if !self.committed && self.content_length < 0 && !self.headers.contains_key(header::CONTENT_LENGTH) {
            self.content_length = self.buffer.len() as i64;
        }
        let flushed = self.flush_buffer();
        let closed = self.close();
        flushed.and(closed)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.exchange.close()?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        self.committed = true;

        if let Ok(value) = HeaderValue::from_str(&self.settings.server_info) {
            self.headers.insert(header::SERVER, value);
        }

        let mut declared = self.content_length;
        if let Some(value) = self.headers.remove(header::CONTENT_LENGTH) {
            match value.to_str().ok().and_then(|v| v.trim().parse::<i64>().ok()) {
                Some(n) if n >= 0 => declared = n,
                _ => warn!(?value, "invalid Content-Length header dropped"),
            }
        }

        if let Some(ct) = self.content_type.as_deref().and_then(|ct| HeaderValue::from_str(ct).ok()) {
            self.headers.insert(header::CONTENT_TYPE, ct);
        }
        if let Some(lang) = self.locale.as_deref().and_then(|l| HeaderValue::from_str(l).ok()) {
            self.headers.insert(header::CONTENT_LANGUAGE, lang);
        }
        if let Some(id) = self.session.claim_cookie() {
            let mut cookie = Cookie::new(&*self.settings.cookie_name, id)
                .with_path(&*self.settings.cookie_path)
                .http_only(true);
            if let Some(domain) = &self.cookie_domain {
                cookie = cookie.with_domain(domain);
            }
            if let Ok(value) = HeaderValue::from_str(&cookie.encode()) {
                self.headers.append(header::SET_COOKIE, value);
            }
        }

        let buffered = self.buffer.len() as i64;
        if declared >= 0 && buffered > declared {
            warn!(declared, buffered, "body exceeds declared Content-Length; sending chunked");
            declared = -1;
        }

        // Undeclared length at commit means more body may follow.
        let framing = match declared {
            0 => Framing::Empty,
            n if n > 0 => Framing::Fixed(n as u64),
            _ => Framing::Chunked,
        };
        trace!(status = %self.status, ?framing, "committing response");
        self.exchange.send_head(self.status, &self.headers, framing)?;
        Ok(())
    }

    fn frozen(&self, op: &'static str) -> bool {
        if self.committed {
            trace!(op, "response committed; mutation ignored");
        }
        self.committed
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("committed", &self.committed)
            .field("closed", &self.closed)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

fn header_pair(name: &str, value: &str) -> Option<(HeaderName, HeaderValue)> {
    match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
        (Ok(name), Ok(value)) => Some((name, value)),
        _ => {
            warn!(name, "invalid header ignored");
            None
        }
    }
}

// ── Writers ──────────────────────────────────────────────────────────────────

/// Character sink returned by [`Response::writer`]. Use with `write!`.
pub struct BodyWriter<'a> {
    res: &'a mut Response,
}

impl BodyWriter<'_> {
    /// Like [`fmt::Write::write_str`] but keeps the underlying error.
    pub fn print(&mut self, s: &str) -> Result<()> {
        let mut encoded = Vec::with_capacity(s.len());
        self.res.charset.encode(s, &mut encoded);
        self.res.write_bytes(&encoded)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.res.flush_buffer()
    }
}

impl fmt::Write for BodyWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.print(s).map_err(|_| fmt::Error)
    }
}

/// Byte sink returned by [`Response::output_stream`].
pub struct BodyStream<'a> {
    res: &'a mut Response,
}

impl io::Write for BodyStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.res.write_bytes(buf).map_err(into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.res.flush_buffer().map_err(into_io)
    }
}

fn into_io(err: Error) -> io::Error {
    match err {
        Error::Io(err) => err,
        other => io::Error::other(other),
    }
}
