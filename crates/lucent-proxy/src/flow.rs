use std::fmt;
use std::sync::Arc;

use http::Uri;
use lucent_http::{Headers, RequestHead};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::AsyncRead;
use tokio::sync::watch;
use uuid::Uuid;

use crate::connection::ConnContext;

/// The request half of a flow: method, absolute URL, protocol string, and
/// the ordered header multimap. The body is present once buffered.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub url: Uri,
    pub proto: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub(crate) fn new(method: String, url: Uri, proto: String, headers: Headers) -> Self {
        Self {
            method,
            url,
            proto,
            headers,
            body: None,
        }
    }

    pub(crate) fn from_head(head: &RequestHead, url: Uri) -> Self {
        Self::new(
            head.method.clone(),
            url,
            head.version.as_str().to_string(),
            head.headers.clone(),
        )
    }
}

#[derive(Serialize, Deserialize)]
struct RequestWire {
    method: String,
    url: String,
    proto: String,
    header: Vec<(String, String)>,
}

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = RequestWire {
            method: self.method.clone(),
            url: self.url.to_string(),
            proto: self.proto.clone(),
            header: self
                .headers
                .iter()
                .map(|header| (header.name.clone(), header.value.clone()))
                .collect(),
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Request {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = RequestWire::deserialize(deserializer)?;
        let url = wire
            .url
            .parse::<Uri>()
            .map_err(|error| D::Error::custom(format!("url parse error: {error}")))?;
        Ok(Request {
            method: wire.method,
            url,
            proto: wire.proto,
            headers: wire.header.into_iter().collect(),
            body: None,
        })
    }
}

/// Reader type addons hand back from the stream-modifier hooks.
pub type BodyStream<'a> = Box<dyn AsyncRead + Send + Unpin + 'a>;

/// The response half of a flow. In the reply phase at most one source is
/// usually populated; when several are, they are written in a fixed order:
/// the pipeline's streaming reader, then `body_reader`, then `body`.
#[derive(Default, Serialize)]
pub struct Response {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(serialize_with = "serialize_headers", rename = "header")]
    pub headers: Headers,
    #[serde(skip)]
    pub body: Option<Vec<u8>>,
    #[serde(skip)]
    pub body_reader: Option<Box<dyn AsyncRead + Send + Unpin + 'static>>,
    #[serde(skip)]
    pub(crate) close: bool,
}

fn serialize_headers<S: Serializer>(headers: &Headers, serializer: S) -> Result<S::Ok, S::Error> {
    headers
        .iter()
        .map(|header| (header.name.clone(), header.value.clone()))
        .collect::<Vec<_>>()
        .serialize(serializer)
}

impl Response {
    pub fn new(status_code: u16, headers: Headers, body: Option<Vec<u8>>) -> Self {
        Self {
            status_code,
            headers,
            body,
            body_reader: None,
            close: false,
        }
    }

    pub fn with_text(status_code: u16, body: &str) -> Self {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/plain; charset=utf-8");
        Self::new(status_code, headers, Some(body.as_bytes().to_vec()))
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status_code", &self.status_code)
            .field("headers", &self.headers)
            .field("body_len", &self.body.as_ref().map(Vec::len))
            .field("has_body_reader", &self.body_reader.is_some())
            .field("close", &self.close)
            .finish()
    }
}

/// What the completion signal reports once a flow finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowOutcome {
    pub status_code: Option<u16>,
    pub body_len: usize,
}

/// Await side of a flow's completion signal; fires exactly once.
#[derive(Clone)]
pub struct FlowCompletion {
    receiver: watch::Receiver<Option<FlowOutcome>>,
}

impl FlowCompletion {
    pub async fn wait(mut self) -> FlowOutcome {
        loop {
            if let Some(outcome) = *self.receiver.borrow() {
                return outcome;
            }
            if self.receiver.changed().await.is_err() {
                return FlowOutcome::default();
            }
        }
    }
}

/// A single request/response pair moving through the pipeline.
pub struct Flow {
    pub id: Uuid,
    pub request: Request,
    pub response: Option<Response>,
    /// Body exceeded the buffering threshold; the pipeline relays it without
    /// invoking the buffered-body hooks.
    pub stream: bool,
    /// Force the request onto the separate main client.
    pub use_separate_client: bool,
    conn: Arc<ConnContext>,
    done_tx: watch::Sender<Option<FlowOutcome>>,
    finished: bool,
}

impl Flow {
    pub(crate) fn new(conn: Arc<ConnContext>, request: Request) -> Self {
        let (done_tx, _) = watch::channel(None);
        Self {
            id: Uuid::new_v4(),
            request,
            response: None,
            stream: false,
            use_separate_client: false,
            conn,
            done_tx,
            finished: false,
        }
    }

    pub fn conn_context(&self) -> &Arc<ConnContext> {
        &self.conn
    }

    pub fn completion(&self) -> FlowCompletion {
        FlowCompletion {
            receiver: self.done_tx.subscribe(),
        }
    }

    /// Fires the completion signal; only the first call has an effect.
    pub(crate) fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let outcome = FlowOutcome {
            status_code: self.response.as_ref().map(|response| response.status_code),
            body_len: self
                .response
                .as_ref()
                .and_then(|response| response.body.as_ref().map(Vec::len))
                .unwrap_or(0),
        };
        let _ = self.done_tx.send(Some(outcome));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointAction {
    Request,
    Response,
    Both,
}

/// Pause rule for external UIs: method (empty matches any), URL substring,
/// and which side of the exchange it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointRule {
    pub method: String,
    pub url_substring: String,
    pub action: BreakpointAction,
}

impl BreakpointRule {
    pub fn matches_request(&self, request: &Request) -> bool {
        matches!(
            self.action,
            BreakpointAction::Request | BreakpointAction::Both
        ) && self.matches(request)
    }

    pub fn matches_response(&self, request: &Request) -> bool {
        matches!(
            self.action,
            BreakpointAction::Response | BreakpointAction::Both
        ) && self.matches(request)
    }

    fn matches(&self, request: &Request) -> bool {
        if !self.method.is_empty() && !self.method.eq_ignore_ascii_case(&request.method) {
            return false;
        }
        request.url.to_string().contains(&self.url_substring)
    }
}
