use std::io::Read;
use std::sync::Arc;

use flate2::read::{GzDecoder, ZlibDecoder};

use super::HttpProxyTree;
use crate::error::BridgeError;

/// Total decoded size admitted out of chunked framing.
const MAX_CHUNKED_TOTAL: usize = 2 * 1024 * 1024;
/// Ceiling for any decoded rewrite body, compressed or not.
const MAX_DECODED_BODY: usize = 16 * 1024 * 1024;
/// Longest admissible chunk-size line.
const MAX_CHUNK_SIZE_LINE: usize = 128;
/// How far back an URL match looks for an enclosing `<form`/`<meta` tag.
const CONTEXT_LOOKBACK: usize = 512;

/// Decode chunked transfer framing: `size-hex[;ext] CRLF data CRLF`
/// repeated, terminated by a zero-size chunk. Trailers are ignored. Bounded
/// by [`MAX_CHUNKED_TOTAL`]; framing violations abort the request.
pub fn decode_chunked(data: &[u8]) -> Result<Vec<u8>, BridgeError> {
    let mut out = Vec::new();
    let mut pos = 0;

    loop {
        if pos >= data.len() {
            // Stream ended without a terminal chunk; keep what decoded.
            break;
        }

        let line_end = find_crlf(data, pos, MAX_CHUNK_SIZE_LINE)
            .ok_or_else(|| BridgeError::Rewrite("chunk size line unterminated".into()))?;

        let mut line = &data[pos..line_end];
        if let Some(semi) = line.iter().position(|&b| b == b';') {
            line = &line[..semi];
        }

        let size_str = std::str::from_utf8(line)
            .map_err(|_| BridgeError::Rewrite("chunk size not ascii".into()))?
            .trim();

        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| BridgeError::Rewrite(format!("bad chunk size {:?}", size_str)))?;

        pos = line_end + 2;

        if size == 0 {
            break;
        }

        if out.len() + size > MAX_CHUNKED_TOTAL {
            return Err(BridgeError::Rewrite(format!(
                "chunked body exceeds {} bytes",
                MAX_CHUNKED_TOTAL
            )));
        }

        if pos + size > data.len() {
            return Err(BridgeError::Rewrite("truncated chunk".into()));
        }

        out.extend_from_slice(&data[pos..pos + size]);
        pos += size;

        if data.len() >= pos + 2 {
            if &data[pos..pos + 2] != b"\r\n" {
                return Err(BridgeError::Rewrite("chunk data not CRLF-terminated".into()));
            }
            pos += 2;
        } else {
            break;
        }
    }

    Ok(out)
}

fn find_crlf(data: &[u8], from: usize, window: usize) -> Option<usize> {
    let end = data.len().min(from + window);
    (from..end.saturating_sub(1)).find(|&i| data[i] == b'\r' && data[i + 1] == b'\n')
}

/// Undo `gzip` or `deflate` content encoding, size-capped.
pub fn decompress(encoding: &str, data: &[u8]) -> Result<Vec<u8>, BridgeError> {
    let mut out = Vec::new();

    let read = if encoding.eq_ignore_ascii_case("gzip") {
        GzDecoder::new(data)
            .take(MAX_DECODED_BODY as u64 + 1)
            .read_to_end(&mut out)
    } else if encoding.eq_ignore_ascii_case("deflate") {
        ZlibDecoder::new(data)
            .take(MAX_DECODED_BODY as u64 + 1)
            .read_to_end(&mut out)
    } else {
        return Err(BridgeError::Rewrite(format!(
            "unknown content encoding {:?}",
            encoding
        )));
    };

    read.map_err(|e| BridgeError::Rewrite(format!("{} decode: {}", encoding, e)))?;

    if out.len() > MAX_DECODED_BODY {
        return Err(BridgeError::Rewrite("decoded body too large".into()));
    }

    Ok(out)
}

/// Scan decoded text for absolute `http://`/`https://` URLs and point them
/// at local proxy nodes. Origins are created on the fly only for form
/// actions and meta-refresh targets (or root-related domains); everything
/// else rewrites only when a node already exists.
pub fn rewrite_urls(tree: &Arc<HttpProxyTree>, body: &[u8]) -> Result<Vec<u8>, BridgeError> {
    let mut out: Option<Vec<u8>> = None;
    let mut emitted = 0;
    let mut i = 0;

    while i + 10 <= body.len() {
        if !body[i..i + 4].eq_ignore_ascii_case(b"http") {
            i += 1;
            continue;
        }

        let mut m = i + 4;
        if m < body.len() && (body[m] | 0x20) == b's' {
            m += 1;
        }

        if m + 3 > body.len() || &body[m..m + 3] != b"://" {
            i = m;
            continue;
        }

        let url_end = scan_url_end(body, m + 3);
        if url_end <= m + 3 {
            i = url_end.max(i + 1);
            continue;
        }

        let url_bytes = &body[i..url_end];

        let Ok(url_str) = std::str::from_utf8(url_bytes) else {
            i = url_end;
            continue;
        };

        let existing_only = !in_form_or_meta_context(body, i);

        if let Some(port) = tree.get_child(url_str, existing_only)? {
            let out_vec = out.get_or_insert_with(|| Vec::with_capacity(body.len()));
            out_vec.extend_from_slice(&body[emitted..i]);
            out_vec.extend_from_slice(format!("http://127.0.0.1:{}", port).as_bytes());
            if url_bytes.ends_with(b"/") {
                out_vec.push(b'/');
            }
            emitted = url_end;
        }

        i = url_end;
    }

    match out {
        Some(mut rewritten) => {
            rewritten.extend_from_slice(&body[emitted..]);
            Ok(rewritten)
        }
        None => Ok(body.to_vec()),
    }
}

/// End of the origin part: host characters up to and including a `/`, or up
/// to the first character that cannot belong to a host.
fn scan_url_end(body: &[u8], host_start: usize) -> usize {
    let mut j = host_start;

    while j < body.len() {
        let c = body[j].to_ascii_lowercase();

        if c == b'/' {
            return j + 1;
        }
        if c == b'.' || c == b'-' || c == b':' || c.is_ascii_digit() || c.is_ascii_lowercase() {
            j += 1;
            continue;
        }
        return j;
    }

    j
}

/// Look back for the enclosing tag start; a `<form` or `<meta ... http-equiv`
/// opener makes this a navigation target worth a new origin node.
fn in_form_or_meta_context(body: &[u8], url_start: usize) -> bool {
    let floor = url_start.saturating_sub(CONTEXT_LOOKBACK);

    for k in (floor..url_start).rev() {
        if body[k] == b'<' {
            let window = body[k..url_start].to_ascii_lowercase();

            if contains(&window, b"form") {
                return true;
            }
            return contains(&window, b"meta") && contains(&window, b"http-equiv");
        }
    }

    false
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}
