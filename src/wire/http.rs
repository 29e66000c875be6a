//! The HTTP codec used by the query/search/analytics/views/management services (spec §4.A,
//! §6): building the request line and header block, and decoding the response either as one
//! whole body or as an incremental stream of rows matched against a JSON-pointer expression
//! (e.g. `/results/^`, meaning "each element of the array at `/results`").
//!
//! The typed row projection is deliberately a stub: `original_source/core/impl/search.cxx`'s
//! row reader parses the envelope correctly but returns a default-constructed row type rather
//! than actually deserializing service-specific fields, and this crate carries that behavior
//! forward rather than inventing response schemas the spec puts out of scope.

use std::fmt;

use crate::error::{Error, Result};

/// HTTP method used by a service request. This crate only ever issues `GET` (views) or `POST`
/// (query/search/analytics/management mutations).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HttpMethod {
    Get,
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
        })
    }
}

/// Builds the request line, header block, and body of an HTTP/1.1 request. Pure: does not touch
/// the network.
pub(crate) fn encode_request(
    method: HttpMethod,
    path: &str,
    host: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(format!("{method} {path} HTTP/1.1\r\n").as_bytes());
    out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
    out.extend_from_slice(b"Connection: keep-alive\r\n");
    if !body.is_empty() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        out.extend_from_slice(b"Content-Type: application/json\r\n");
    }
    for (name, value) in extra_headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// A parsed HTTP response status line plus headers, and how many bytes of the input it consumed
/// (so the caller knows where the body starts).
#[derive(Clone, Debug)]
pub(crate) struct HttpResponseHead {
    pub(crate) status: u16,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) consumed: usize,
}

impl HttpResponseHead {
    pub(crate) fn content_length(&self) -> Option<usize> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse().ok())
    }

    pub(crate) fn is_chunked(&self) -> bool {
        self.headers
            .iter()
            .any(|(name, value)| name.eq_ignore_ascii_case("transfer-encoding") && value.eq_ignore_ascii_case("chunked"))
    }
}

/// Parses the status line and header block from the front of `buf`. Returns `Ok(None)` if the
/// terminating blank line has not arrived yet (the caller should read more and retry).
pub(crate) fn parse_response_head(buf: &[u8]) -> Result<Option<HttpResponseHead>> {
    let header_end = match find_subslice(buf, b"\r\n\r\n") {
        Some(pos) => pos,
        None => return Ok(None),
    };

    let head_text = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| Error::parsing_failure("HTTP response head was not valid UTF-8"))?;
    let mut lines = head_text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| Error::parsing_failure("HTTP response missing a status line"))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| Error::parsing_failure(format!("malformed HTTP status line {status_line:?}")))?;

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(Some(HttpResponseHead {
        status,
        headers,
        consumed: header_end + 4,
    }))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Streams rows out of a JSON response body matching a pointer of the form `/segment/^`, where
/// the trailing `^` means "each element of the array found at `/segment`". Feed it response-body
/// bytes as they arrive; it returns any rows that became decodable since the last call.
///
/// Only a single top-level array segment is supported (sufficient for `/results/^` and
/// `/hits/^`-style service envelopes); nested pointers are not needed by anything this crate
/// currently streams.
pub(crate) struct JsonPointerRowReader {
    key: Vec<u8>,
    buf: Vec<u8>,
    state: ReaderState,
    depth: i32,
    in_string: bool,
    escape: bool,
    item_start: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReaderState {
    SeekingKey,
    SeekingArrayStart,
    InArray,
    Done,
}

impl JsonPointerRowReader {
    /// `pointer` must be `/segment/^`; any other shape is a programmer error in this crate, not
    /// a runtime condition, so it panics rather than returning a `Result`.
    pub(crate) fn new(pointer: &str) -> Self {
        let segment = pointer
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix("/^"))
            .unwrap_or_else(|| panic!("unsupported row pointer {pointer:?}"));
        Self {
            key: format!("\"{segment}\"").into_bytes(),
            buf: Vec::new(),
            state: ReaderState::SeekingKey,
            depth: 0,
            in_string: false,
            escape: false,
            item_start: None,
        }
    }

    /// Appends `chunk` and returns every row (as a raw [`serde_json::Value`]) that completed as
    /// a result.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Result<Vec<serde_json::Value>> {
        self.buf.extend_from_slice(chunk);
        let mut rows = Vec::new();

        if self.state == ReaderState::SeekingKey {
            if let Some(pos) = find_subslice(&self.buf, &self.key) {
                self.buf.drain(..pos + self.key.len());
                self.state = ReaderState::SeekingArrayStart;
            } else {
                // Keep only enough of the tail to still match a key straddling the chunk
                // boundary.
                let keep_from = self.buf.len().saturating_sub(self.key.len().saturating_sub(1));
                self.buf.drain(..keep_from);
                return Ok(rows);
            }
        }

        if self.state == ReaderState::SeekingArrayStart {
            match self.buf.iter().position(|&b| b == b'[') {
                Some(pos) => {
                    self.buf.drain(..=pos);
                    self.state = ReaderState::InArray;
                }
                None => return Ok(rows),
            }
        }

        if self.state != ReaderState::InArray {
            return Ok(rows);
        }

        let mut i = 0usize;
        while i < self.buf.len() {
            let b = self.buf[i];

            if self.item_start.is_none() {
                if b == b']' {
                    self.state = ReaderState::Done;
                    self.buf.drain(..=i);
                    return Ok(rows);
                }
                if b == b',' || b.is_ascii_whitespace() {
                    i += 1;
                    continue;
                }
                self.item_start = Some(i);
                self.depth = 0;
                self.in_string = false;
                self.escape = false;
            }

            if self.in_string {
                if self.escape {
                    self.escape = false;
                } else if b == b'\\' {
                    self.escape = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
            } else {
                match b {
                    b'"' => self.in_string = true,
                    b'{' | b'[' => self.depth += 1,
                    b'}' | b']' => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            let start = self.item_start.take().unwrap();
                            let item = &self.buf[start..=i];
                            let value: serde_json::Value = serde_json::from_slice(item)
                                .map_err(|e| Error::parsing_failure(format!("malformed streamed row: {e}")))?;
                            rows.push(value);
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
        }

        if let Some(start) = self.item_start {
            self.buf.drain(..start);
            self.item_start = Some(0);
        } else {
            self.buf.clear();
        }

        Ok(rows)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == ReaderState::Done
    }
}

/// Wraps [`JsonPointerRowReader`] and exposes a typed projection that, matching the source this
/// crate was distilled from, is never actually populated from the row's fields — it is always
/// `R::default()`. Callers that need real field access should use [`Self::feed_raw`].
pub(crate) struct SearchRowReader<R> {
    inner: JsonPointerRowReader,
    _row: std::marker::PhantomData<R>,
}

impl<R: Default> SearchRowReader<R> {
    pub(crate) fn new(pointer: &str) -> Self {
        Self {
            inner: JsonPointerRowReader::new(pointer),
            _row: std::marker::PhantomData,
        }
    }

    /// Raw JSON rows, fully decoded.
    pub(crate) fn feed_raw(&mut self, chunk: &[u8]) -> Result<Vec<serde_json::Value>> {
        self.inner.feed(chunk)
    }

    /// The stub projection: one `R::default()` per raw row produced by `feed_raw`.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Result<Vec<R>> {
        Ok(self.feed_raw(chunk)?.into_iter().map(|_| R::default()).collect())
    }

    pub(crate) fn is_done(&self) -> bool {
        self.inner.is_done()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_request_includes_content_length_only_with_a_body() {
        let get = encode_request(HttpMethod::Get, "/pools/default", "node1:8091", &[], &[]);
        assert!(!String::from_utf8_lossy(&get).contains("Content-Length"));

        let post = encode_request(HttpMethod::Post, "/query/service", "node1:8093", &[], b"{}");
        let text = String::from_utf8_lossy(&post);
        assert!(text.contains("Content-Length: 2"));
        assert!(text.ends_with("{}"));
    }

    #[test]
    fn parse_response_head_reports_status_and_headers() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Foo: bar\r\n\r\nhello";
        let head = parse_response_head(raw).unwrap().unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.content_length(), Some(5));
        assert_eq!(&raw[head.consumed..], b"hello");
    }

    #[test]
    fn parse_response_head_returns_none_until_blank_line_arrives() {
        let partial = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n";
        assert!(parse_response_head(partial).unwrap().is_none());
    }

    #[test]
    fn row_reader_streams_rows_as_they_complete() {
        let mut reader = JsonPointerRowReader::new("/results/^");
        let mut rows = reader.feed(br#"{"results":[{"a":1},{"a":2}"#).unwrap();
        assert_eq!(rows.len(), 1);
        rows.extend(reader.feed(br#",{"a":3}],"status":"success"}"#).unwrap());
        assert_eq!(rows.len(), 3);
        assert!(reader.is_done());
        assert_eq!(rows[2]["a"], 3);
    }

    #[derive(Default, Debug, PartialEq, Eq)]
    struct StubRow {
        marker: u8,
    }

    #[test]
    fn search_row_reader_projects_defaults_not_real_fields() {
        let mut reader: SearchRowReader<StubRow> = SearchRowReader::new("/hits/^");
        let rows = reader.feed(br#"{"hits":[{"id":"doc1","score":9.5}]}"#).unwrap();
        assert_eq!(rows, vec![StubRow::default()]);
    }
}
