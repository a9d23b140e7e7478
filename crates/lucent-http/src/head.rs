use std::io;

use http::Uri;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Ordered, case-preserving header multimap. Lookups are case-insensitive;
/// iteration and encoding keep insertion order and the original casing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<Header>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replaces every value under `name` with a single entry, keeping the
    /// position of the first occurrence. Appends when the name is absent.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let Some(first) = self
            .entries
            .iter()
            .position(|header| header.name.eq_ignore_ascii_case(&name))
        else {
            self.entries.push(Header { name, value });
            return;
        };
        self.entries[first].value = value;
        self.remove_duplicates_after(first, &name);
    }

    fn remove_duplicates_after(&mut self, first: usize, name: &str) {
        let mut position = first + 1;
        while position < self.entries.len() {
            if self.entries[position].name.eq_ignore_ascii_case(name) {
                self.entries.remove(position);
            } else {
                position += 1;
            }
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries
            .retain(|header| !header.name.eq_ignore_ascii_case(name));
    }

    /// True when any comma-separated token under `name` equals `token`.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|value| value.trim().eq_ignore_ascii_case(token))
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(pairs: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            headers.append(name, value);
        }
        headers
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Headers,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Host of the request: the Host header when present, otherwise the
    /// authority of the target (absolute-form and CONNECT requests).
    pub fn host(&self) -> Option<String> {
        if let Some(host) = self.headers.get("Host") {
            return Some(host.to_string());
        }
        if self.is_connect() {
            return Some(self.target.clone());
        }
        self.absolute_uri()
            .and_then(|uri| uri.authority().map(|authority| authority.to_string()))
    }

    /// The target parsed as an absolute URI, when it is one.
    pub fn absolute_uri(&self) -> Option<Uri> {
        let uri = self.target.parse::<Uri>().ok()?;
        if uri.scheme().is_some() && uri.authority().is_some() {
            Some(uri)
        } else {
            None
        }
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers.contains_token("Connection", "Upgrade")
            && self.headers.contains_token("Upgrade", "websocket")
    }

    pub fn body_mode(&self) -> io::Result<BodyMode> {
        if self.headers.contains_token("Transfer-Encoding", "chunked") {
            return Ok(BodyMode::Chunked);
        }
        if let Some(length) = parse_content_length(&self.headers)? {
            return Ok(if length == 0 {
                BodyMode::None
            } else {
                BodyMode::ContentLength(length)
            });
        }
        Ok(BodyMode::None)
    }

    pub fn connection_close(&self) -> bool {
        is_connection_close(self.version, &self.headers)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");
        encode_headers(&self.headers, &mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: HttpVersion,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn body_mode(&self, request_method: &str) -> io::Result<BodyMode> {
        if request_method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return Ok(BodyMode::None);
        }

        if self.headers.contains_token("Transfer-Encoding", "chunked") {
            return Ok(BodyMode::Chunked);
        }
        if let Some(length) = parse_content_length(&self.headers)? {
            return Ok(if length == 0 {
                BodyMode::None
            } else {
                BodyMode::ContentLength(length)
            });
        }

        Ok(BodyMode::CloseDelimited)
    }

    pub fn connection_close(&self, request_method: &str) -> io::Result<bool> {
        if is_connection_close(self.version, &self.headers) {
            return Ok(true);
        }
        Ok(self.body_mode(request_method)? == BodyMode::CloseDelimited)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.to_string().as_bytes());
        if !self.reason.is_empty() {
            out.push(b' ');
            out.extend_from_slice(self.reason.as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        encode_headers(&self.headers, &mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}

fn encode_headers(headers: &Headers, out: &mut Vec<u8>) {
    for header in headers.iter() {
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

pub fn parse_request_head(raw: &[u8]) -> io::Result<RequestHead> {
    let text = std::str::from_utf8(raw).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "request headers were not valid UTF-8",
        )
    })?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request line is missing"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request method is missing"))?;
    let target = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request target is missing"))?;
    let version_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "HTTP version is missing"))?;
    if parts.next().is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "request line had too many fields",
        ));
    }
    let version = parse_http_version(version_text)?;
    let headers = parse_headers(lines)?;

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
    })
}

pub fn parse_response_head(raw: &[u8]) -> io::Result<ResponseHead> {
    let text = std::str::from_utf8(raw).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "response headers were not valid UTF-8",
        )
    })?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "response status line is missing",
        )
    })?;
    let mut parts = status_line.split_whitespace();
    let version_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "response version is missing"))?;
    let status_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "response status is missing"))?;
    let reason = parts.collect::<Vec<_>>().join(" ");
    let version = parse_http_version(version_text)?;
    let status = status_text
        .parse::<u16>()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid response status code"))?;
    let headers = parse_headers(lines)?;

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
    })
}

fn parse_http_version(text: &str) -> io::Result<HttpVersion> {
    match text {
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "only HTTP/1.0 and HTTP/1.1 are supported here",
        )),
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> io::Result<Headers> {
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed header line"))?;
        headers.append(name.trim(), value.trim());
    }
    Ok(headers)
}

fn parse_content_length(headers: &Headers) -> io::Result<Option<u64>> {
    let mut value = None;
    for text in headers.get_all("Content-Length") {
        let parsed = text.parse::<u64>().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "invalid Content-Length value")
        })?;
        value = Some(parsed);
    }
    Ok(value)
}

fn is_connection_close(version: HttpVersion, headers: &Headers) -> bool {
    if headers.contains_token("Connection", "close") {
        return true;
    }
    if version == HttpVersion::Http10 && !headers.contains_token("Connection", "keep-alive") {
        return true;
    }
    false
}
