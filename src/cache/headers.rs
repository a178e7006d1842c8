//! Response header helpers: HTTP dates, security headers and the
//! Content-Security-Policy builder.

use std::fmt::Write as _;

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use super::config::CspMode;
use super::policy::AssetTag;

/// RFC 1123 date as used by `Last-Modified` and `If-Modified-Since`.
const HTTP_DATE: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

pub const X_CONTENT_INTEGRITY: &str = "x-content-integrity";

pub fn http_date(at: OffsetDateTime) -> String {
    at.to_offset(UtcOffset::UTC)
        .format(HTTP_DATE)
        .unwrap_or_default()
}

pub fn parse_http_date(raw: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(raw.trim(), HTTP_DATE)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

/// Security headers stamped on every decorated response of `tag`.
pub fn security_headers(tag: AssetTag) -> Vec<(&'static str, &'static str)> {
    let mut headers = vec![
        ("x-content-type-options", "nosniff"),
        ("referrer-policy", "strict-origin-when-cross-origin"),
    ];
    match tag {
        AssetTag::Html => headers.push(("x-frame-options", "SAMEORIGIN")),
        AssetTag::Font => headers.extend([
            ("access-control-allow-origin", "*"),
            ("access-control-allow-methods", "GET, HEAD, OPTIONS"),
            ("access-control-allow-headers", "Origin, Accept, Content-Type"),
        ]),
        _ => {}
    }
    headers
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    DefaultSrc,
    ScriptSrc,
    StyleSrc,
    FontSrc,
    ImgSrc,
    ConnectSrc,
    WorkerSrc,
    ManifestSrc,
    MediaSrc,
}

impl Directive {
    pub const ALL: [Directive; 9] = [
        Directive::DefaultSrc,
        Directive::ScriptSrc,
        Directive::StyleSrc,
        Directive::FontSrc,
        Directive::ImgSrc,
        Directive::ConnectSrc,
        Directive::WorkerSrc,
        Directive::ManifestSrc,
        Directive::MediaSrc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DefaultSrc => "default-src",
            Self::ScriptSrc => "script-src",
            Self::StyleSrc => "style-src",
            Self::FontSrc => "font-src",
            Self::ImgSrc => "img-src",
            Self::ConnectSrc => "connect-src",
            Self::WorkerSrc => "worker-src",
            Self::ManifestSrc => "manifest-src",
            Self::MediaSrc => "media-src",
        }
    }
}

/// Content-Security-Policy with directives kept in a fixed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSecurityPolicy {
    directives: Vec<(Directive, Vec<String>)>,
}

impl ContentSecurityPolicy {
    pub fn standard() -> Self {
        let sources = |directive: Directive| -> &'static [&'static str] {
            match directive {
                Directive::StyleSrc => &["'self'", "'unsafe-inline'"],
                Directive::FontSrc => &["'self'", "data:"],
                Directive::ImgSrc => &["'self'", "data:", "blob:"],
                Directive::MediaSrc => &["'self'", "blob:"],
                _ => &["'self'"],
            }
        };
        Self {
            directives: Directive::ALL
                .into_iter()
                .map(|directive| {
                    (
                        directive,
                        sources(directive).iter().map(|s| s.to_string()).collect(),
                    )
                })
                .collect(),
        }
    }

    /// Allow one more source for `directive`. Duplicates are ignored.
    pub fn with_source(mut self, directive: Directive, source: impl Into<String>) -> Self {
        let source = source.into();
        if let Some((_, sources)) = self.directives.iter_mut().find(|(d, _)| *d == directive)
            && !sources.contains(&source)
        {
            sources.push(source);
        }
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (index, (directive, sources)) in self.directives.iter().enumerate() {
            if index > 0 {
                out.push_str("; ");
            }
            let _ = write!(out, "{} {}", directive.as_str(), sources.join(" "));
        }
        out
    }

    /// Header name and value for header delivery modes.
    pub fn header(&self, mode: CspMode) -> Option<(&'static str, String)> {
        match mode {
            CspMode::Header => Some(("content-security-policy", self.render())),
            CspMode::ReportOnly => Some(("content-security-policy-report-only", self.render())),
            CspMode::Meta | CspMode::Disabled => None,
        }
    }

    pub fn meta_tag(&self) -> String {
        format!(
            r#"<meta http-equiv="Content-Security-Policy" content="{}">"#,
            self.render().replace('"', "&quot;")
        )
    }

    /// Insert the meta tag right after the opening `<head>` element.
    /// Returns `None` when the document has no head.
    pub fn inject_meta(&self, html: &str) -> Option<String> {
        let lower = html.to_ascii_lowercase();
        let start = lower.find("<head")?;
        let close = start + lower[start..].find('>')? + 1;
        let mut out = String::with_capacity(html.len() + 256);
        out.push_str(&html[..close]);
        out.push_str(&self.meta_tag());
        out.push_str(&html[close..]);
        Some(out)
    }
}

impl Default for ContentSecurityPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn http_dates_roundtrip() {
        let at = datetime!(1994-11-06 08:49:37 UTC);
        let rendered = http_date(at);
        assert_eq!(rendered, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_http_date(&rendered), Some(at));
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn html_gets_frame_options_and_fonts_get_cors() {
        let html = security_headers(AssetTag::Html);
        assert!(html.contains(&("x-frame-options", "SAMEORIGIN")));
        assert!(html.contains(&("x-content-type-options", "nosniff")));

        let font = security_headers(AssetTag::Font);
        assert!(font.contains(&("access-control-allow-origin", "*")));
        assert!(!font.iter().any(|(name, _)| *name == "x-frame-options"));
    }

    #[test]
    fn csp_renders_all_directives_in_order() {
        let csp = ContentSecurityPolicy::standard()
            .with_source(Directive::ConnectSrc, "https://api.example")
            .with_source(Directive::ConnectSrc, "https://api.example");
        insta::assert_snapshot!(csp.render(), @"default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; font-src 'self' data:; img-src 'self' data: blob:; connect-src 'self' https://api.example; worker-src 'self'; manifest-src 'self'; media-src 'self' blob:");
    }

    #[test]
    fn csp_delivery_modes() {
        let csp = ContentSecurityPolicy::standard();
        assert_eq!(csp.header(CspMode::Header).map(|h| h.0), Some("content-security-policy"));
        assert_eq!(
            csp.header(CspMode::ReportOnly).map(|h| h.0),
            Some("content-security-policy-report-only")
        );
        assert!(csp.header(CspMode::Meta).is_none());

        let page = csp
            .inject_meta("<html><HEAD lang=\"en\"><title>x</title></HEAD></html>")
            .expect("has head");
        assert!(page.starts_with("<html><HEAD lang=\"en\"><meta http-equiv=\"Content-Security-Policy\""));
        assert!(csp.inject_meta("<p>fragment</p>").is_none());
    }
}
