//! HTTP/1.x request-line and header parsing off a buffered byte stream.

use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};
use tracing::debug;

/// Longest request line accepted, terminator included.
pub const MAX_REQUEST_LINE: usize = 16 * 1024;
/// Upper bound on the size of a header block.
pub const MAX_HEADER_BLOCK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid request line: {0:?}")]
    RequestLine(String),
    #[error("invalid method: {0:?}")]
    Method(String),
    #[error("invalid request target {target:?}: {source}")]
    Target {
        target: String,
        #[source]
        source: http::uri::InvalidUri,
    },
    #[error("CONNECT target {0:?} has no host")]
    ConnectTarget(String),
    #[error("request line is not valid UTF-8")]
    NotUtf8,
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("stream ended after {got} of {expected} body bytes")]
    TruncatedBody { expected: u64, got: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The first line of a request: `METHOD TARGET VERSION`.
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: Method,
    /// Target as a URI. CONNECT authorities are promoted to `https://host:port`.
    pub target: Uri,
    /// Protocol version token exactly as sent, e.g. `HTTP/1.1`.
    pub version: String,
}

impl RequestLine {
    /// Parses a request line. Trailing CR/LF and surrounding whitespace are
    /// ignored.
    ///
    /// The method runs up to the first space and the version starts after the
    /// last one; the target in between must be a single non-empty token.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        let invalid = || ParseError::RequestLine(line.to_string());

        let (method, rest) = line.split_once(' ').ok_or_else(invalid)?;
        let (target, version) = rest.rsplit_once(' ').ok_or_else(invalid)?;
        if method.is_empty() || target.is_empty() || version.is_empty() || target.contains(' ') {
            return Err(invalid());
        }

        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ParseError::Method(method.to_string()))?;

        let target = if is_connect(&method) {
            let uri: Uri = format!("https://{target}")
                .parse()
                .map_err(|source| ParseError::Target {
                    target: target.to_string(),
                    source,
                })?;
            if uri.host().is_none_or(str::is_empty) {
                return Err(ParseError::ConnectTarget(target.to_string()));
            }
            uri
        } else {
            target.parse().map_err(|source| ParseError::Target {
                target: target.to_string(),
                source,
            })?
        };

        Ok(Self {
            method,
            target,
            version: version.to_string(),
        })
    }

    /// Whether this is a CONNECT request (case-insensitive).
    pub fn is_connect(&self) -> bool {
        is_connect(&self.method)
    }

    /// Path and query of the target, defaulting to `/`.
    pub fn path_and_query(&self) -> &str {
        self.target
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/")
    }
}

fn is_connect(method: &Method) -> bool {
    method.as_str().eq_ignore_ascii_case("CONNECT")
}

/// Headers following a request line.
#[derive(Debug, Default)]
pub struct HeaderBlock {
    /// Parsed headers, case-insensitive names with every value kept in order.
    pub headers: HeaderMap,
    /// The retained header lines as received, without line terminators.
    lines: Vec<Vec<u8>>,
}

impl HeaderBlock {
    /// Header lines to forward upstream, in arrival order.
    pub fn lines(&self) -> impl Iterator<Item = &[u8]> {
        self.lines.iter().map(Vec::as_slice)
    }

    /// Body length to read for `method`, if any.
    ///
    /// Only POST and PUT with a numeric, positive Content-Length carry a body.
    /// Chunked transfer-encoding is not decoded.
    pub fn body_len(&self, method: &Method) -> Option<u64> {
        let method = method.as_str();
        if !(method.eq_ignore_ascii_case("POST") || method.eq_ignore_ascii_case("PUT")) {
            return None;
        }
        self.headers
            .get(CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|len| *len > 0)
    }
}

/// Reads one `\n`-terminated line of at most `limit` bytes.
///
/// Returns `None` when the stream ends before a complete line.
pub async fn read_line<R>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(limit as u64)
        .read_until(b'\n', &mut line)
        .await?;

    if line.ends_with(b"\n") {
        Ok(Some(line))
    } else if read >= limit {
        Err(ParseError::LineTooLong(limit))
    } else {
        Ok(None)
    }
}

/// Reads header lines until a blank line or end of stream.
///
/// `Proxy-Connection` is dropped. Every other line is kept for forwarding;
/// lines that are not valid `name: value` pairs are left out of `headers`.
pub async fn read_headers<R>(reader: &mut R) -> Result<HeaderBlock, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut block = HeaderBlock::default();
    let mut remaining = MAX_HEADER_BLOCK;

    loop {
        let Some(raw) = read_line(reader, remaining).await? else {
            break;
        };
        remaining -= raw.len();

        let line = trim_line_end(&raw);
        if line.is_empty() {
            break;
        }

        let Some(colon) = line.iter().position(|b| *b == b':') else {
            debug!("forwarding header line without colon unparsed");
            block.lines.push(line.to_vec());
            continue;
        };
        let name = line[..colon].trim_ascii();
        let value = line[colon + 1..].trim_ascii();

        if name.eq_ignore_ascii_case(b"proxy-connection") {
            continue;
        }
        block.lines.push(line.to_vec());

        match (HeaderName::from_bytes(name), HeaderValue::from_bytes(value)) {
            (Ok(name), Ok(value)) => {
                block.headers.append(name, value);
            }
            _ => debug!(
                "forwarding malformed header {:?} unparsed",
                String::from_utf8_lossy(line)
            ),
        }
    }

    Ok(block)
}

/// Reads exactly `len` body bytes. Bytes past `len` are left in the reader.
pub async fn read_body<R>(reader: &mut R, len: u64) -> Result<Bytes, ParseError>
where
    R: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let got = (&mut *reader).take(len).read_to_end(&mut body).await? as u64;
    if got < len {
        return Err(ParseError::TruncatedBody { expected: len, got });
    }
    Ok(Bytes::from(body))
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
