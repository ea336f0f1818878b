//! Blocking HTTP transport used by the web-based adapters.
//!
//! Adapters talk to an `HttpTransport` instead of `reqwest` directly so that
//! status handling and parsing can be exercised against scripted responses.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::ProviderError;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// URL-encoded form body (POST only).
    pub form: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            form: Vec::new(),
        }
    }

    pub fn post_form(url: impl Into<String>, form: Vec<(String, String)>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            form,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lower-cased.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// `Retry-After` in seconds, if present and numeric.
    pub fn retry_after(&self) -> Option<u64> {
        self.header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
    }
}

/// Failure below the HTTP layer (no status code was received).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    Connect(String),
    Timeout(String),
    Other(String),
}

impl From<TransportFailure> for ProviderError {
    fn from(f: TransportFailure) -> Self {
        match f {
            TransportFailure::Connect(msg) | TransportFailure::Other(msg) => {
                ProviderError::Transport(msg)
            }
            TransportFailure::Timeout(msg) => ProviderError::Timeout(msg),
        }
    }
}

pub trait HttpTransport: Send {
    fn send(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportFailure>;
}

/// `reqwest` blocking client with a cookie store (session cookies survive between calls).
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .build()
            .map_err(|e| ProviderError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportFailure> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url).form(&request.form),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder.send().map_err(classify)?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = resp.bytes().map_err(classify)?.to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(e: reqwest::Error) -> TransportFailure {
    if e.is_timeout() {
        TransportFailure::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportFailure::Connect(e.to_string())
    } else {
        TransportFailure::Other(e.to_string())
    }
}

/// Offline transport that replays canned responses.
///
/// Responses are queued per URL fragment; the last response of a queue
/// repeats forever. Clones share the script, so a handle kept by the caller
/// can inspect the request log after the transport is boxed into an adapter.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<Script>>,
}

#[derive(Debug, Default)]
struct Script {
    routes: Vec<(String, VecDeque<Result<HttpResponse, TransportFailure>>)>,
    log: Vec<HttpRequest>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for requests whose URL contains `fragment`.
    pub fn on(&self, fragment: &str, response: Result<HttpResponse, TransportFailure>) -> &Self {
        let mut script = self.lock();
        match script.routes.iter().position(|(f, _)| f == fragment) {
            Some(i) => script.routes[i].1.push_back(response),
            None => script
                .routes
                .push((fragment.to_string(), VecDeque::from([response]))),
        }
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.lock().log.clone()
    }

    /// Requests sent so far whose URL contains `fragment`.
    pub fn count(&self, fragment: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|r| r.url.contains(fragment))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HttpTransport for ScriptedTransport {
    fn send(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportFailure> {
        let mut script = self.lock();
        script.log.push(request.clone());
        let queue = script
            .routes
            .iter_mut()
            .find(|(fragment, _)| request.url.contains(fragment.as_str()))
            .map(|(_, queue)| queue);
        match queue {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| Err(TransportFailure::Other("empty script".into()))),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Err(TransportFailure::Other("empty script".into()))),
            None => Err(TransportFailure::Connect(format!(
                "no scripted response for {}",
                request.url
            ))),
        }
    }
}

/// Percent-encode a query parameter value.
pub(crate) fn encode_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
