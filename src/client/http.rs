//! One-shot HTTP request/response driver atop the pure [`crate::wire::http`] codec (spec §4.A),
//! used by the query/search/analytics/views/management service clients. One socket per request:
//! these services see nowhere near KV's request rate, so a connection pool buys nothing here.

use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::runtime::{self, stream::{AsyncStream, StreamOptions}};
use crate::wire::http::{encode_request, parse_response_head, HttpMethod, JsonPointerRowReader};

const READ_CHUNK: usize = 8 * 1024;

/// A completed HTTP exchange: the whole decoded body, plus any rows matched against
/// `row_pointer` if one was supplied to [`execute`].
pub(crate) struct HttpResponse {
    pub(crate) status: u16,
    pub(crate) body: Vec<u8>,
    pub(crate) rows: Vec<serde_json::Value>,
}

/// Issues one request and reads the response to completion, optionally streaming rows out of
/// `row_pointer` (e.g. `/results/^`) as chunks arrive rather than waiting for the whole body.
/// The whole body is still buffered (for error-body inspection on non-2xx responses), but rows
/// are extracted incrementally, matching how the teacher's streaming reader is meant to be fed.
pub(crate) async fn execute(
    stream_options: StreamOptions,
    method: HttpMethod,
    path: &str,
    host_header: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
    row_pointer: Option<&str>,
    deadline: Instant,
) -> Result<HttpResponse> {
    let mut stream = connect(stream_options, deadline).await?;

    let request = encode_request(method, path, host_header, extra_headers, body);
    let remaining = deadline.saturating_duration_since(Instant::now());
    runtime::timeout(remaining, stream.write_all(&request)).await??;

    let mut buf = Vec::new();
    let head = loop {
        let n = read_some(&mut stream, &mut buf, deadline).await?;
        if n == 0 {
            return Err(Error::parsing_failure("connection closed before HTTP headers completed"));
        }
        if let Some(head) = parse_response_head(&buf)? {
            break head;
        }
    };

    let mut reader = row_pointer.map(JsonPointerRowReader::new);
    let mut rows = Vec::new();
    let mut out_body = Vec::new();
    let leftover = buf[head.consumed..].to_vec();

    if head.is_chunked() {
        let mut dechunker = Dechunker::default();
        record(&dechunker.push(&leftover)?, &mut reader, &mut rows, &mut out_body)?;
        while !dechunker.done {
            let mut chunk = [0u8; READ_CHUNK];
            let n = read_into(&mut stream, &mut chunk, deadline).await?;
            if n == 0 {
                break;
            }
            record(&dechunker.push(&chunk[..n])?, &mut reader, &mut rows, &mut out_body)?;
        }
    } else if let Some(len) = head.content_length() {
        record(&leftover, &mut reader, &mut rows, &mut out_body)?;
        while out_body.len() < len {
            let mut chunk = [0u8; READ_CHUNK];
            let n = read_into(&mut stream, &mut chunk, deadline).await?;
            if n == 0 {
                break;
            }
            record(&chunk[..n], &mut reader, &mut rows, &mut out_body)?;
        }
        out_body.truncate(len);
    } else {
        record(&leftover, &mut reader, &mut rows, &mut out_body)?;
        loop {
            let mut chunk = [0u8; READ_CHUNK];
            let n = read_into(&mut stream, &mut chunk, deadline).await?;
            if n == 0 {
                break;
            }
            record(&chunk[..n], &mut reader, &mut rows, &mut out_body)?;
        }
    }

    Ok(HttpResponse {
        status: head.status,
        body: out_body,
        rows,
    })
}

async fn connect(stream_options: StreamOptions, deadline: Instant) -> Result<AsyncStream> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    runtime::timeout(remaining, AsyncStream::connect(stream_options)).await?
}

async fn read_into(stream: &mut AsyncStream, chunk: &mut [u8], deadline: Instant) -> Result<usize> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    runtime::timeout(remaining, stream.read(chunk)).await?
}

async fn read_some(stream: &mut AsyncStream, buf: &mut Vec<u8>, deadline: Instant) -> Result<usize> {
    let mut chunk = [0u8; READ_CHUNK];
    let n = read_into(stream, &mut chunk, deadline).await?;
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

fn record(
    piece: &[u8],
    reader: &mut Option<JsonPointerRowReader>,
    rows: &mut Vec<serde_json::Value>,
    out_body: &mut Vec<u8>,
) -> Result<()> {
    out_body.extend_from_slice(piece);
    if let Some(reader) = reader {
        rows.extend(reader.feed(piece)?);
    }
    Ok(())
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Strips `Transfer-Encoding: chunked` framing incrementally, as chunks of the raw stream
/// arrive, handing back only the decoded payload bytes seen so far.
#[derive(Default)]
struct Dechunker {
    buf: Vec<u8>,
    remaining_in_chunk: usize,
    done: bool,
}

impl Dechunker {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            if self.done {
                return Ok(out);
            }
            if self.remaining_in_chunk > 0 {
                let take = self.remaining_in_chunk.min(self.buf.len());
                out.extend_from_slice(&self.buf[..take]);
                self.buf.drain(..take);
                self.remaining_in_chunk -= take;
                if self.remaining_in_chunk > 0 {
                    return Ok(out);
                }
                if self.buf.len() < 2 {
                    return Ok(out);
                }
                self.buf.drain(..2); // trailing CRLF after the chunk payload
                continue;
            }

            let Some(pos) = find_crlf(&self.buf) else {
                return Ok(out);
            };
            let size_line = std::str::from_utf8(&self.buf[..pos])
                .map_err(|_| Error::parsing_failure("chunk size line was not valid UTF-8"))?;
            let size = usize::from_str_radix(size_line.trim(), 16)
                .map_err(|_| Error::parsing_failure(format!("malformed chunk size {size_line:?}")))?;
            self.buf.drain(..pos + 2);
            if size == 0 {
                self.done = true;
                return Ok(out);
            }
            self.remaining_in_chunk = size;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dechunker_reassembles_a_body_split_across_pushes() {
        let mut d = Dechunker::default();
        let mut out = Vec::new();
        out.extend(d.push(b"5\r\nhel").unwrap());
        out.extend(d.push(b"lo\r\n0\r\n\r\n").unwrap());
        assert_eq!(out, b"hello");
        assert!(d.done);
    }

    #[test]
    fn dechunker_handles_multiple_chunks() {
        let mut d = Dechunker::default();
        let out = d.push(b"3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n").unwrap();
        assert_eq!(out, b"foobar");
    }
}
