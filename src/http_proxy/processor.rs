use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use tracing::debug;

use super::body::{decode_chunked, decompress, rewrite_urls};
use super::{HttpProxyTree, NodeId, NodeInfo};
use crate::config::{DIAL_TIMEOUT, READ_TIMEOUT};
use crate::error::BridgeError;
use crate::observability;
use crate::socks_client::connect_via_socks;
use crate::tls::DelegateStream;

const CRLF: &str = "\r\n";
const MAX_HEADER_BLOCK: usize = 64 * 1024;
const MAX_REWRITE_BODY: usize = 16 * 1024 * 1024;

/// Expired-cookie replies sent for request cookies the origin never set.
const COOKIE_EXPIRY: &str = "expires=Sun, 01 Jan 2000 01:00:00 GMT";

pub(crate) fn process(tree: Arc<HttpProxyTree>, node: NodeId, client: TcpStream) {
    observability::record_http_request();

    let info = tree.node_info(node);
    info.request_count.fetch_add(1, Ordering::SeqCst);

    if let Err(e) = run(&tree, &info, &client) {
        debug!(error = %e, category = e.category(), "request processing aborted");
    }

    let _ = client.shutdown(Shutdown::Both);
}

fn run(tree: &Arc<HttpProxyTree>, node: &NodeInfo, client: &TcpStream) -> Result<(), BridgeError> {
    let mut client_read = client.try_clone()?;
    let mut client_write = client.try_clone()?;

    let request_header = read_header_block(&mut client_read)?;
    let request_header = String::from_utf8_lossy(&request_header).into_owned();

    let mut delegate = dial_delegate(tree, node)?;

    let request = rewrite_request_header(tree, node, &request_header);

    delegate.write_all(request.header.as_bytes())?;
    delegate.flush()?;

    pump_request_body(&request, client_read, &mut delegate)?;

    let reply_header = read_header_block(&mut delegate)?;
    let reply_header = String::from_utf8_lossy(&reply_header).into_owned();

    let reply = rewrite_response_header(tree, node, &request.target_url, &reply_header)?;

    client_write.write_all(reply.header.as_bytes())?;

    // Cookies filtered from the request and still unknown get expired so the
    // browser stops replaying them at this proxy.
    for name in &request.removed_cookies {
        if !tree.has_set_cookie_name(name) {
            client_write
                .write_all(format!("Set-Cookie: {}=X; {}{}", name, COOKIE_EXPIRY, CRLF).as_bytes())?;
            client_write.write_all(
                format!("Set-Cookie2: {}=X; Max-Age=0; Version=1{}", name, CRLF).as_bytes(),
            )?;
        }
    }

    if reply.rewrite {
        let raw = read_body_to_end(tree, &mut delegate)?;

        let raw = if reply.chunked { decode_chunked(&raw)? } else { raw };

        let raw = match &reply.content_encoding {
            Some(encoding) => decompress(encoding, &raw)?,
            None => raw,
        };

        let rewritten = rewrite_urls(tree, &raw)?;

        client_write
            .write_all(format!("Content-Length: {}{}{}", rewritten.len(), CRLF, CRLF).as_bytes())?;
        client_write.write_all(&rewritten)?;
        client_write.flush()?;
    } else {
        client_write.write_all(CRLF.as_bytes())?;

        let mut buffer = [0u8; 32 * 1024];
        while !tree.is_destroyed() {
            match delegate.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    client_write.write_all(&buffer[..n])?;
                }
            }
        }
        client_write.flush()?;
    }

    Ok(())
}

fn dial_delegate(tree: &Arc<HttpProxyTree>, node: &NodeInfo) -> Result<DelegateStream, BridgeError> {
    let upstream = tree.upstream();
    let host = node.host.clone();
    let port = node.port;

    let dial_tcp = move || -> Result<TcpStream, BridgeError> {
        let stream = match &upstream {
            Some((socks_host, socks_port)) => connect_via_socks(
                socks_host,
                *socks_port,
                &host,
                port,
                None,
                DIAL_TIMEOUT,
            )?,
            None => {
                let addr = (host.as_str(), port)
                    .to_socket_addrs()
                    .map_err(|e| BridgeError::UpstreamDial(format!("resolve {}: {}", host, e)))?
                    .next()
                    .ok_or_else(|| {
                        BridgeError::UpstreamDial(format!("{} resolves to nothing", host))
                    })?;
                TcpStream::connect_timeout(&addr, DIAL_TIMEOUT)
                    .map_err(|e| BridgeError::UpstreamDial(format!("connect {}: {}", host, e)))?
            }
        };

        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_write_timeout(Some(READ_TIMEOUT))?;
        Ok(stream)
    };

    if node.https {
        let stream = tree
            .dialer()
            .handshake_with_fallback(&node.host, dial_tcp)?;
        Ok(DelegateStream::Tls(Box::new(stream)))
    } else {
        Ok(DelegateStream::Plain(dial_tcp()?))
    }
}

struct RewrittenRequest {
    header: String,
    target_url: String,
    removed_cookies: Vec<String>,
    content_length: Option<usize>,
    chunked: bool,
}

/// Header-block rewrite for the outbound request: origin-form request line,
/// delegate Host, Connection: close, Referer pinned to the delegate and the
/// Cookie header filtered to names this tree has seen set.
fn rewrite_request_header(
    tree: &Arc<HttpProxyTree>,
    node: &NodeInfo,
    header: &str,
) -> RewrittenRequest {
    let mut lines = header.split(CRLF);

    let request_line = lines.next().unwrap_or_default();
    let (request_line, target_url) = rewrite_request_line(request_line);

    let mut out = String::with_capacity(header.len());
    out.push_str(&request_line);
    out.push_str(CRLF);

    let mut removed_cookies = Vec::new();
    let mut content_length = None;
    let mut chunked = false;

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let lower = line.trim().to_ascii_lowercase();
        let name = lower.split(':').next().unwrap_or_default().trim().to_string();

        let replacement: Option<String> = match name.as_str() {
            "host" => Some(format!("Host: {}{}", node.host, port_suffix(node.port))),
            "connection" => Some("Connection: close".to_string()),
            "referer" => Some(rewrite_referer(node, line)),
            "cookie" => {
                let value = header_value(line);
                let mut kept = Vec::new();

                for cookie in value.split(';') {
                    let cookie = cookie.trim();
                    let name = cookie.split('=').next().unwrap_or_default().trim();

                    if tree.has_set_cookie_name(name) {
                        kept.push(cookie.to_string());
                    } else if !name.is_empty() {
                        removed_cookies.push(name.to_string());
                    }
                }

                if kept.is_empty() {
                    None
                } else {
                    Some(format!("Cookie: {}", kept.join("; ")))
                }
            }
            "content-length" => {
                content_length = header_value(line).trim().parse::<usize>().ok();
                Some(line.to_string())
            }
            "transfer-encoding" => {
                if lower.contains("chunked") {
                    chunked = true;
                }
                Some(line.to_string())
            }
            _ => Some(line.to_string()),
        };

        if let Some(line_out) = replacement {
            out.push_str(&line_out);
            out.push_str(CRLF);
        }
    }

    out.push_str(CRLF);

    RewrittenRequest {
        header: out,
        target_url,
        removed_cookies,
        content_length,
        chunked,
    }
}

/// Proxy clients send absolute-form request targets; the delegate gets the
/// origin-form equivalent. Returns the rewritten line and the raw target.
fn rewrite_request_line(line: &str) -> (String, String) {
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or("GET");
    let target = parts.next().unwrap_or("/");
    let version = parts.next().unwrap_or("HTTP/1.1");

    let origin_form = if let Some(scheme_end) = target.find("://") {
        let after = &target[scheme_end + 3..];
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => "/",
        }
    } else {
        target
    };

    (
        format!("{} {} {}", method, origin_form, version),
        target.to_string(),
    )
}

fn rewrite_referer(node: &NodeInfo, line: &str) -> String {
    let value = header_value(line);

    let path = match value.find("://") {
        Some(pos) => {
            let after = &value[pos + 3..];
            match after.find('/') {
                Some(slash) => &after[slash..],
                None => "/",
            }
        }
        None => "/",
    };

    format!(
        "Referer: http{}://{}{}{}",
        if node.https { "s" } else { "" },
        node.host,
        port_suffix(node.port),
        path
    )
}

struct RewrittenResponse {
    header: String,
    rewrite: bool,
    chunked: bool,
    content_encoding: Option<String>,
}

/// Response-header rewrite: cookies re-scoped to the local proxy, Location
/// mapped onto a child node, framing headers suppressed when the body will
/// be rewritten.
fn rewrite_response_header(
    tree: &Arc<HttpProxyTree>,
    node: &NodeInfo,
    target_url: &str,
    header: &str,
) -> Result<RewrittenResponse, BridgeError> {
    let lines: Vec<&str> = header.split(CRLF).collect();

    let content_type = lines
        .iter()
        .filter_map(|line| {
            let lower = line.trim().to_ascii_lowercase();
            lower
                .strip_prefix("content-type:")
                .map(|value| value.trim().split(';').next().unwrap_or_default().to_string())
        })
        .next();

    // Textual content gets its body decoded and rewritten; so does anything
    // that failed to declare a type.
    let rewrite = match &content_type {
        None => true,
        Some(content_type) => content_type.contains("text/"),
    };

    let mut out = String::with_capacity(header.len());
    let mut chunked = false;
    let mut content_encoding = None;

    for line in &lines {
        if line.is_empty() {
            continue;
        }

        let lower = line.trim().to_ascii_lowercase();
        let name = lower.split(':').next().unwrap_or_default().trim().to_string();

        let replacement: Option<String> = match name.as_str() {
            "set-cookie" => Some(format!(
                "Set-Cookie: {}",
                rewrite_set_cookie(tree, header_value(line))
            )),
            "set-cookie2" => Some(format!(
                "Set-Cookie2: {}",
                rewrite_set_cookie2(tree, header_value(line))
            )),
            "connection" => Some("Connection: close".to_string()),
            "location" => Some(rewrite_location(tree, node, target_url, header_value(line))?),
            "content-encoding" => {
                let encoding = header_value(line).trim().to_string();
                if rewrite
                    && (encoding.eq_ignore_ascii_case("gzip")
                        || encoding.eq_ignore_ascii_case("deflate"))
                {
                    content_encoding = Some(encoding);
                    None
                } else {
                    Some(line.to_string())
                }
            }
            "content-length" => {
                if rewrite {
                    None
                } else {
                    Some(line.to_string())
                }
            }
            "transfer-encoding" => {
                if lower.contains("chunked") {
                    chunked = true;
                    if rewrite {
                        None
                    } else {
                        Some(line.to_string())
                    }
                } else {
                    Some(line.to_string())
                }
            }
            _ => Some(line.to_string()),
        };

        if let Some(line_out) = replacement {
            out.push_str(&line_out);
            out.push_str(CRLF);
        }
    }

    Ok(RewrittenResponse {
        header: out,
        rewrite,
        chunked,
        content_encoding,
    })
}

/// Strip `Domain` (cookie must come back to localhost), `Expires` (session
/// scope only, cookies from many sites share this host) and `Secure`;
/// record the cookie name as accepted and note HttpOnly usage.
fn rewrite_set_cookie(tree: &Arc<HttpProxyTree>, value: &str) -> String {
    // Multiple cookies arrive comma-separated unless an Expires date (which
    // itself contains a comma) is present.
    let cookies: Vec<&str> = if value.to_ascii_lowercase().contains("expires") {
        vec![value]
    } else {
        value.split(',').collect()
    };

    let mut out = Vec::new();

    for cookie in cookies {
        let mut kept = Vec::new();

        for (index, attr) in cookie.split(';').enumerate() {
            let attr = attr.trim();
            let lower = attr.to_ascii_lowercase();

            if lower == "httponly" {
                tree.mark_http_only_seen();
            } else if lower == "secure" || lower.starts_with("domain") || lower.starts_with("expires")
            {
                // dropped
            } else {
                if index == 0 {
                    if let Some((name, value)) = attr.split_once('=') {
                        tree.add_set_cookie_name(name.trim(), value.trim());
                    }
                }
                kept.push(attr.to_string());
            }
        }

        out.push(kept.join("; "));
    }

    out.join(", ")
}

fn rewrite_set_cookie2(tree: &Arc<HttpProxyTree>, value: &str) -> String {
    let mut out = Vec::new();

    for cookie in value.split(',') {
        let mut kept = Vec::new();

        for (index, attr) in cookie.split(';').enumerate() {
            let attr = attr.trim();
            let lower = attr.to_ascii_lowercase();

            if lower == "secure"
                || lower == "discard"
                || lower.starts_with("domain")
                || lower.starts_with("port")
            {
                // dropped
            } else {
                if index == 0 {
                    if let Some((name, value)) = attr.split_once('=') {
                        tree.add_set_cookie_name(name.trim(), value.trim());
                    }
                }
                kept.push(attr.to_string());
            }
        }

        out.push(format!("{}; Discard", kept.join("; ")));
    }

    out.join(", ")
}

/// Resolve the Location target to an absolute URL, map it onto a child node
/// and point the client at that node's local port.
fn rewrite_location(
    tree: &Arc<HttpProxyTree>,
    node: &NodeInfo,
    target_url: &str,
    value: &str,
) -> Result<String, BridgeError> {
    let value = value.trim();

    let base = format!(
        "http{}://{}{}{}",
        if node.https { "s" } else { "" },
        node.host,
        port_suffix(node.port),
        origin_form_path(target_url)
    );

    let absolute = url::Url::parse(&base)
        .and_then(|base| base.join(value))
        .map_err(|e| BridgeError::Rewrite(format!("unresolvable Location {:?}: {}", value, e)))?;

    let port = tree.get_child(absolute.as_str(), false)?;

    match port {
        Some(port) => {
            let mut path = absolute.path().to_string();
            if let Some(query) = absolute.query() {
                path.push('?');
                path.push_str(query);
            }
            Ok(format!("Location: http://127.0.0.1:{}{}", port, path))
        }
        None => Ok(format!("Location: {}", value)),
    }
}

fn origin_form_path(target: &str) -> &str {
    if let Some(scheme_end) = target.find("://") {
        let after = &target[scheme_end + 3..];
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => "/",
        }
    } else if target.starts_with('/') {
        target
    } else {
        "/"
    }
}

fn header_value(line: &str) -> &str {
    match line.find(':') {
        Some(pos) => line[pos + 1..].trim(),
        None => "",
    }
}

fn port_suffix(port: u16) -> String {
    if port == 80 || port == 443 {
        String::new()
    } else {
        format!(":{}", port)
    }
}

/// Forward the request body. Plain delegates get a detached pump running
/// until the client closes; TLS delegates cannot be split across threads,
/// so the body is forwarded bounded by its declared framing before the
/// response is read.
fn pump_request_body(
    request: &RewrittenRequest,
    client_read: TcpStream,
    delegate: &mut DelegateStream,
) -> Result<(), BridgeError> {
    match delegate {
        DelegateStream::Plain(tcp) => {
            let mut delegate_write = tcp.try_clone()?;
            let mut client_read = client_read;

            thread::Builder::new()
                .name("http-proxy-body".into())
                .spawn(move || {
                    let mut buffer = [0u8; 32 * 1024];
                    loop {
                        match client_read.read(&mut buffer) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if delegate_write.write_all(&buffer[..n]).is_err() {
                                    break;
                                }
                                let _ = delegate_write.flush();
                            }
                        }
                    }
                })
                .map_err(BridgeError::Io)?;

            Ok(())
        }
        DelegateStream::Tls(_) => {
            let mut client_read = client_read;

            if request.chunked {
                copy_chunked_stream(&mut client_read, &mut *delegate)?;
            } else if let Some(length) = request.content_length {
                copy_exact(&mut client_read, &mut *delegate, length)?;
            }

            delegate.flush()?;
            Ok(())
        }
    }
}

fn copy_exact(
    src: &mut impl Read,
    dst: &mut impl Write,
    mut remaining: usize,
) -> Result<(), BridgeError> {
    let mut buffer = [0u8; 32 * 1024];

    while remaining > 0 {
        let want = remaining.min(buffer.len());
        let n = src.read(&mut buffer[..want])?;
        if n == 0 {
            return Err(BridgeError::Rewrite("request body truncated".into()));
        }
        dst.write_all(&buffer[..n])?;
        remaining -= n;
    }

    Ok(())
}

/// Pass chunked request framing through verbatim until the terminal chunk.
fn copy_chunked_stream(src: &mut impl Read, dst: &mut impl Write) -> Result<(), BridgeError> {
    loop {
        let line = read_line_raw(src)?;
        dst.write_all(&line)?;

        let size_text = String::from_utf8_lossy(&line);
        let size_text = size_text.trim_end();
        let size_text = size_text.split(';').next().unwrap_or_default().trim();

        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| BridgeError::Rewrite(format!("bad request chunk size {:?}", size_text)))?;

        if size == 0 {
            // Trailer section: copy lines through the final empty one.
            loop {
                let trailer = read_line_raw(src)?;
                dst.write_all(&trailer)?;
                if trailer == b"\r\n" {
                    return Ok(());
                }
            }
        }

        copy_exact(src, dst, size + 2)?;
    }
}

fn read_line_raw(src: &mut impl Read) -> Result<Vec<u8>, BridgeError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        if src.read(&mut byte)? == 0 {
            return Err(BridgeError::Rewrite("unexpected end of chunked body".into()));
        }
        line.push(byte[0]);

        if line.ends_with(b"\r\n") {
            return Ok(line);
        }
        if line.len() > 8 * 1024 {
            return Err(BridgeError::Rewrite("chunk line too long".into()));
        }
    }
}

/// Byte-wise header read up to the blank line, capped.
fn read_header_block(src: &mut impl Read) -> Result<Vec<u8>, BridgeError> {
    let mut header = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        if src.read(&mut byte)? == 0 {
            return Err(BridgeError::Rewrite(
                "end of stream while reading header".into(),
            ));
        }

        header.push(byte[0]);

        if header.ends_with(b"\r\n\r\n") {
            return Ok(header);
        }

        if header.len() > MAX_HEADER_BLOCK {
            return Err(BridgeError::Rewrite("header block too large".into()));
        }
    }
}

fn read_body_to_end(
    tree: &Arc<HttpProxyTree>,
    src: &mut impl Read,
) -> Result<Vec<u8>, BridgeError> {
    let mut out = Vec::new();
    let mut buffer = [0u8; 32 * 1024];

    while !tree.is_destroyed() {
        match src.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if out.len() + n > MAX_REWRITE_BODY {
                    return Err(BridgeError::Rewrite("response body too large".into()));
                }
                out.extend_from_slice(&buffer[..n]);
            }
            Err(e) => {
                // A timeout with data in hand ends the read; the delegate
                // was asked to close and some servers just stall instead.
                if out.is_empty() {
                    return Err(BridgeError::Io(e));
                }
                break;
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Arc<HttpProxyTree> {
        HttpProxyTree::start(&url::Url::parse("https://site.example.com/").unwrap(), None).unwrap()
    }

    fn node(tree: &Arc<HttpProxyTree>) -> NodeInfo {
        tree.node_info(0)
    }

    #[test]
    fn request_line_becomes_origin_form() {
        let (line, target) = rewrite_request_line("GET http://127.0.0.1:4000/a/b?q=1 HTTP/1.1");
        assert_eq!(line, "GET /a/b?q=1 HTTP/1.1");
        assert_eq!(target, "http://127.0.0.1:4000/a/b?q=1");

        let (line, _) = rewrite_request_line("POST /direct HTTP/1.1");
        assert_eq!(line, "POST /direct HTTP/1.1");
    }

    #[test]
    fn host_connection_and_referer_are_rewritten() {
        let tree = tree();
        let node = node(&tree);

        let header = concat!(
            "GET http://127.0.0.1:4000/page HTTP/1.1\r\n",
            "Host: 127.0.0.1:4000\r\n",
            "Connection: keep-alive\r\n",
            "Referer: http://127.0.0.1:4000/from/here\r\n",
            "Accept: text/html\r\n",
            "\r\n"
        );

        let request = rewrite_request_header(&tree, &node, header);

        assert!(request.header.contains("Host: site.example.com\r\n"));
        assert!(request.header.contains("Connection: close\r\n"));
        assert!(request
            .header
            .contains("Referer: https://site.example.com/from/here\r\n"));
        assert!(request.header.contains("Accept: text/html\r\n"));

        tree.dec_ref();
    }

    #[test]
    fn unknown_cookies_are_filtered_and_remembered() {
        let tree = tree();
        let node = node(&tree);
        tree.add_set_cookie_name("session", "abc");

        let header = concat!(
            "GET / HTTP/1.1\r\n",
            "Cookie: session=abc; tracker=evil; other=1\r\n",
            "\r\n"
        );

        let request = rewrite_request_header(&tree, &node, header);

        assert!(request.header.contains("Cookie: session=abc\r\n"));
        assert!(!request.header.contains("tracker"));
        assert_eq!(request.removed_cookies, vec!["tracker", "other"]);

        tree.dec_ref();
    }

    #[test]
    fn fully_unknown_cookie_header_is_dropped() {
        let tree = tree();
        let node = node(&tree);

        let header = "GET / HTTP/1.1\r\nCookie: a=1\r\n\r\n";
        let request = rewrite_request_header(&tree, &node, header);

        assert!(!request.header.to_ascii_lowercase().contains("cookie:"));

        tree.dec_ref();
    }

    #[test]
    fn set_cookie_attributes_are_rescoped() {
        let tree = tree();

        let rewritten = rewrite_set_cookie(
            &tree,
            "session=abc; Domain=.example.com; Expires=Wed, 21 Oct 2026 07:28:00 GMT; Secure; Path=/",
        );

        assert_eq!(rewritten, "session=abc; Path=/");
        assert!(tree.has_set_cookie_name("session"));
        assert!(!tree.http_only_cookie_seen());

        tree.dec_ref();
    }

    #[test]
    fn http_only_usage_is_observed() {
        let tree = tree();

        let rewritten = rewrite_set_cookie(&tree, "id=1; HttpOnly; Path=/");
        assert_eq!(rewritten, "id=1; Path=/");
        assert!(tree.http_only_cookie_seen());

        tree.dec_ref();
    }

    #[test]
    fn comma_separated_cookies_without_expires_split() {
        let tree = tree();

        let rewritten = rewrite_set_cookie(&tree, "a=1; Secure, b=2; Domain=x.com");
        assert_eq!(rewritten, "a=1, b=2");
        assert!(tree.has_set_cookie_name("a"));
        assert!(tree.has_set_cookie_name("b"));

        tree.dec_ref();
    }

    #[test]
    fn set_cookie2_gains_discard() {
        let tree = tree();

        let rewritten = rewrite_set_cookie2(&tree, "token=z; Port=80; Version=1");
        assert_eq!(rewritten, "token=z; Version=1; Discard");

        tree.dec_ref();
    }

    #[test]
    fn location_maps_to_a_child_node() {
        let tree = tree();
        let node = node(&tree);

        let line = rewrite_location(
            &tree,
            &node,
            "http://127.0.0.1:4000/page",
            "https://next.example.com/landing?x=1",
        )
        .unwrap();

        let port = tree
            .get_child("https://next.example.com/", true)
            .unwrap()
            .expect("location must have created the child");

        assert_eq!(
            line,
            format!("Location: http://127.0.0.1:{}/landing?x=1", port)
        );

        tree.dec_ref();
    }

    #[test]
    fn relative_location_resolves_against_the_request() {
        let tree = tree();
        let node = node(&tree);

        let line =
            rewrite_location(&tree, &node, "http://127.0.0.1:4000/dir/page", "../other").unwrap();

        // Same origin, so it resolves to the root node's port.
        assert_eq!(
            line,
            format!("Location: http://127.0.0.1:{}/other", tree.root_port())
        );

        tree.dec_ref();
    }

    #[test]
    fn textual_responses_get_framing_suppressed() {
        let tree = tree();
        let node = node(&tree);

        let header = concat!(
            "HTTP/1.1 200 OK\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "Content-Length: 1234\r\n",
            "Content-Encoding: gzip\r\n",
            "Transfer-Encoding: chunked\r\n",
            "Connection: keep-alive\r\n",
            "\r\n"
        );

        let reply = rewrite_response_header(&tree, &node, "/", header).unwrap();

        assert!(reply.rewrite);
        assert!(reply.chunked);
        assert_eq!(reply.content_encoding.as_deref(), Some("gzip"));
        assert!(!reply.header.contains("Content-Length"));
        assert!(!reply.header.contains("Content-Encoding"));
        assert!(!reply.header.contains("Transfer-Encoding"));
        assert!(reply.header.contains("Connection: close\r\n"));
        assert!(reply.header.contains("HTTP/1.1 200 OK\r\n"));

        tree.dec_ref();
    }

    #[test]
    fn binary_responses_pass_framing_through() {
        let tree = tree();
        let node = node(&tree);

        let header = concat!(
            "HTTP/1.1 200 OK\r\n",
            "Content-Type: image/png\r\n",
            "Content-Length: 10\r\n",
            "\r\n"
        );

        let reply = rewrite_response_header(&tree, &node, "/", header).unwrap();

        assert!(!reply.rewrite);
        assert!(reply.header.contains("Content-Length: 10\r\n"));

        tree.dec_ref();
    }

    #[test]
    fn header_block_reader_stops_at_blank_line() {
        let mut input: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nBODYBYTES";
        let header = read_header_block(&mut input).unwrap();
        assert_eq!(header, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(input, b"BODYBYTES");
    }

    #[test]
    fn header_block_reader_rejects_unterminated_input() {
        let mut input: &[u8] = b"GET / HTTP/1.1\r\nHost:";
        assert!(read_header_block(&mut input).is_err());
    }
}
