//! Detects "please open this URL" requests in PTY output.
//!
//! Assistant CLIs print login and preview links they would normally hand to
//! a local browser. Each match produces a `url_open` side message for the
//! client; the chunk itself is still forwarded. Scanning is per chunk: a URL
//! split across two reads is not detected.

use regex::Regex;
use termrelay_core::{RelayError, RelayResult};

/// (pattern, rewrite matched text). Capture group 1 is the URL.
const PATTERNS: &[(&str, bool)] = &[
    (r"(?:xdg-open|open|start)\s+(https?://[^\s\x1b\x07]+)", false),
    (r"OPEN_URL:\s*(https?://[^\s\x1b\x07]+)", true),
    (r"(?i)Opening\s+(https?://[^\s\x1b\x07]+)", false),
    (r"(?i)Visit:\s*(https?://[^\s\x1b\x07]+)", false),
    (r"(?i)View at:\s*(https?://[^\s\x1b\x07]+)", false),
    (r"(?i)Browse to:\s*(https?://[^\s\x1b\x07]+)", false),
];

struct UrlPattern {
    regex: Regex,
    rewrite: bool,
}

/// Result of scanning one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intercepted {
    /// Text to forward (rewritten for explicit markers).
    pub text: String,
    /// URLs to open, in pattern order then match order.
    pub urls: Vec<String>,
}

/// Output scanner for URL-open requests.
pub struct UrlInterceptor {
    patterns: Vec<UrlPattern>,
}

impl UrlInterceptor {
    pub fn new() -> RelayResult<Self> {
        let patterns = PATTERNS
            .iter()
            .map(|(src, rewrite)| {
                Regex::new(src)
                    .map(|regex| UrlPattern {
                        regex,
                        rewrite: *rewrite,
                    })
                    .map_err(|e| RelayError::Other(format!("bad URL pattern {src}: {e}")))
            })
            .collect::<RelayResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Scan a chunk of output.
    pub fn scan(&self, chunk: &str) -> Intercepted {
        let mut text = chunk.to_string();
        let mut urls = Vec::new();
        for pattern in &self.patterns {
            for caps in pattern.regex.captures_iter(chunk) {
                let (Some(whole), Some(url)) = (caps.get(0), caps.get(1)) else {
                    continue;
                };
                urls.push(url.as_str().to_string());
                if pattern.rewrite {
                    text = text.replacen(
                        whole.as_str(),
                        &format!("Opening in browser: {}", url.as_str()),
                        1,
                    );
                }
            }
        }
        Intercepted { text, urls }
    }
}
