//! Synthetic Responses
//!
//! Bodies served in place of a blocked request, and the header rewrite
//! that stops a page from running scripts.

use hyper::StatusCode;
use hyper::header::{CONTENT_SECURITY_POLICY, HeaderMap, HeaderName, HeaderValue};

/// Policy that forbids every script, inline ones included
pub const SCRIPT_BLOCKING_CSP: &str = "script-src 'none'";

/// WebKit's prefixed alias of Content-Security-Policy
pub const X_WEBKIT_CSP: HeaderName = HeaderName::from_static("x-webkit-csp");

/// 1x1 transparent GIF
pub const TRANSPARENT_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// A response produced without touching the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticResponse {
    pub status: StatusCode,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Empty body; the resource simply has no content
pub fn empty_response() -> SyntheticResponse {
    SyntheticResponse {
        status: StatusCode::OK,
        mime_type: "text/html".to_string(),
        data: Vec::new(),
    }
}

/// Loads "successfully" so onload handlers waiting on it still fire
pub fn transparent_pixel() -> SyntheticResponse {
    SyntheticResponse {
        status: StatusCode::OK,
        mime_type: "image/gif".to_string(),
        data: TRANSPARENT_GIF.to_vec(),
    }
}

/// Explanation page for a site on the safe-browsing list
pub fn blocked_page_html(url: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Dangerous site blocked</title></head>
<body style="font-family: system-ui; padding: 40px; background: #1a1a2e; color: #eee;">
    <h1>This site has been blocked</h1>
    <p><code>{}</code> is known for phishing or malware.</p>
    <p>Shields stopped the page from loading to protect you.</p>
</body>
</html>"#,
        escape_html(url)
    )
}

pub fn blocked_page(html: &str) -> SyntheticResponse {
    SyntheticResponse {
        status: StatusCode::OK,
        mime_type: "text/html".to_string(),
        data: html.as_bytes().to_vec(),
    }
}

/// Override the page's CSP so no script runs, inline or external
pub fn apply_script_csp(headers: &mut HeaderMap) {
    let value = HeaderValue::from_static(SCRIPT_BLOCKING_CSP);
    headers.insert(CONTENT_SECURITY_POLICY, value.clone());
    headers.insert(X_WEBKIT_CSP, value);
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_is_gif() {
        let pixel = transparent_pixel();
        assert_eq!(pixel.mime_type, "image/gif");
        assert_eq!(&pixel.data[..6], b"GIF89a");
        assert_eq!(pixel.data.last(), Some(&0x3b));
    }

    #[test]
    fn test_blocked_page_escapes_url() {
        let html = blocked_page_html("http://evil.com/<script>");
        assert!(html.contains("http://evil.com/&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn test_apply_script_csp_overrides() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("default-src *"),
        );
        apply_script_csp(&mut headers);

        assert_eq!(headers.get_all(CONTENT_SECURITY_POLICY).iter().count(), 1);
        assert_eq!(headers[CONTENT_SECURITY_POLICY], SCRIPT_BLOCKING_CSP);
        assert_eq!(headers["x-webkit-csp"], SCRIPT_BLOCKING_CSP);
    }
}
