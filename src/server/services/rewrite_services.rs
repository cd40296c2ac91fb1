//! URL rewriting for proxied HTML documents.
//!
//! Five passes over the raw markup, in a fixed order, each a pure
//! `(text, origin) -> Option<rewritten>` substitution. This is deliberately
//! text matching and not a DOM parse - embed pages are full of templated
//! half-markup that no parser round-trips cleanly.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::warn;

// path prefixes that belong to the upstream app and have to keep routing
// through /worker-proxy once the document is served from our origin
const ASSET_PATH_PATTERN: &str = r#"(/(?:_next|static|assets|media|fonts|api)\b[^\s"'<>]*)"#;

static ROOT_RELATIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(["'=]\s*)(/(?:_next|static|assets|media|fonts|api)\b[^\s"'<>]*)"#)
        .expect("static pattern should compile")
});

static ROOT_FILES_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(["'=]\s*)(/(?:favicon\.ico|manifest\.json|robots\.txt|sitemap\.xml)\b[^\s"'<>]*)"#)
        .expect("static pattern should compile")
});

static BASE_HREF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<base\s+href=['"]([^'"]+)['"]"#).expect("static pattern should compile")
});

/// origin ("scheme://host[:port]") of a target URL, None if it won't parse
pub fn origin_of(target_url: &str) -> Option<String> {
    let parsed = url::Url::parse(target_url).ok()?;
    Some(parsed.origin().ascii_serialization())
}

fn replace_tracked<F>(re: &Regex, text: &str, replacement: F) -> Option<String>
where
    F: Fn(&Captures) -> String,
{
    match re.replace_all(text, |caps: &Captures| replacement(caps)) {
        Cow::Borrowed(_) => None,
        Cow::Owned(rewritten) => Some(rewritten),
    }
}

/// pass 1: root-relative asset/API paths in a quoted or `=`-attribute context
pub fn rewrite_root_relative(text: &str, origin: &str) -> Option<String> {
    replace_tracked(&ROOT_RELATIVE_RE, text, |caps| {
        format!("{}/worker-proxy{}?origin={}", &caps[1], &caps[2], origin)
    })
}

/// pass 2: well-known root files (favicon, manifest, robots, sitemap)
pub fn rewrite_root_files(text: &str, origin: &str) -> Option<String> {
    replace_tracked(&ROOT_FILES_RE, text, |caps| {
        format!("{}/worker-proxy{}?origin={}", &caps[1], &caps[2], origin)
    })
}

/// pass 3: absolute URLs on the upstream origin itself
pub fn rewrite_absolute(text: &str, origin: &str) -> Option<String> {
    let pattern = format!("{}{}", regex::escape(origin), ASSET_PATH_PATTERN);
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(e) => {
            // skip the pass rather than fail the document
            warn!("absolute-url pattern failed to build for {}: {}", origin, e);
            return None;
        }
    };

    replace_tracked(&re, text, |caps| {
        format!("/worker-proxy{}?origin={}", &caps[1], origin)
    })
}

/// pass 4: protocol-relative URLs (`//host/...`) on the upstream host
pub fn rewrite_protocol_relative(text: &str, origin: &str) -> Option<String> {
    let host = origin
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let pattern = format!("//{}{}", regex::escape(host), ASSET_PATH_PATTERN);
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(e) => {
            warn!("protocol-relative pattern failed to build for {}: {}", origin, e);
            return None;
        }
    };

    replace_tracked(&re, text, |caps| {
        format!("/worker-proxy{}?origin={}", &caps[1], origin)
    })
}

/// pass 5: `<base href>` tags are pointed back through the document proxy so
/// relative URL resolution inside the page stays on our origin
pub fn rewrite_base_href(text: &str, _origin: &str) -> Option<String> {
    replace_tracked(&BASE_HREF_RE, text, |caps| {
        format!("<base href=\"/worker-proxy?url={}\">", &caps[1])
    })
}

/// all five passes in documented order. The bool reports whether anything
/// matched at all - a fully unmatched document usually means the upstream
/// changed shape, which is worth a warning but not an error.
pub fn rewrite_html(text: &str, origin: &str) -> (String, bool) {
    let passes: [fn(&str, &str) -> Option<String>; 5] = [
        rewrite_root_relative,
        rewrite_root_files,
        rewrite_absolute,
        rewrite_protocol_relative,
        rewrite_base_href,
    ];

    let mut current = text.to_string();
    let mut rewritten = false;

    for pass in passes {
        if let Some(next) = pass(&current, origin) {
            current = next;
            rewritten = true;
        }
    }

    if !rewritten {
        warn!("no asset URLs were rewritten in HTML response");
    }

    (current, rewritten)
}
