//! Link harvesting and article extraction.
//!
//! Candidate URLs come from anchor tags plus a raw-text sweep, are kept
//! only when on a configured vendor domain, and are deduplicated in first-
//! seen order so classification order stays reproducible. Each page is
//! rendered through the browser pool and reduced to {title, text,
//! platform} by structural selectors with a text-node fallback.

use futures::future::join_all;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::warn;
use url::Url;

use medsignal_common::{Article, RawMail};

use crate::fetch::PageFetcher;

/// Byte cap applied to extracted article bodies.
pub const ARTICLE_BYTE_CAP: usize = 20_000;

pub struct Extractor {
    vendor_domains: Vec<String>,
    href_pattern: Regex,
    raw_url_pattern: Regex,
}

impl Extractor {
    pub fn new(vendor_domains: Vec<String>) -> Self {
        Self {
            vendor_domains,
            href_pattern: Regex::new(r#"href\s*=\s*["']([^"']+)["']"#).expect("valid regex"),
            raw_url_pattern: Regex::new(r#"https?://[^\s"'<>）)】\]]+"#).expect("valid regex"),
        }
    }

    /// Scrape every vendor link in the mail into an Article. Pages are
    /// fetched concurrently (the pool bounds real parallelism) but the
    /// returned order matches link order in the mail body.
    pub async fn extract(&self, mail: &RawMail, fetcher: &dyn PageFetcher) -> Vec<Article> {
        let urls = self.collect_urls(&mail.body);
        if urls.is_empty() {
            warn!(token = %mail.token, "Mail contained no vendor links");
            return Vec::new();
        }

        let fetches = urls.iter().map(|url| fetcher.fetch(url));
        let pages = join_all(fetches).await;

        urls.into_iter()
            .zip(pages)
            .map(|(url, page)| match page {
                Ok(html) if !html.trim().is_empty() => {
                    let mut article = parse_article(&html, &url, &mail.hospital);
                    article.body = truncate_with_ellipsis(&article.body, ARTICLE_BYTE_CAP);
                    article
                }
                Ok(_) | Err(_) => Article {
                    hospital: mail.hospital.clone(),
                    source: "未知".to_string(),
                    title: String::new(),
                    url,
                    body: String::new(),
                    fetch_failed: true,
                },
            })
            .collect()
    }

    /// Candidate URLs from anchors and raw text, vendor-filtered and
    /// deduplicated in first-seen order.
    pub fn collect_urls(&self, body: &str) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut urls = Vec::new();

        let candidates = self
            .href_pattern
            .captures_iter(body)
            .map(|c| c[1].to_string())
            .chain(
                self.raw_url_pattern
                    .find_iter(body)
                    .map(|m| m.as_str().to_string()),
            );

        for raw in candidates {
            let trimmed = raw.trim_end_matches(['.', ',', '；', '。']).to_string();
            if !self.is_vendor_url(&trimmed) {
                continue;
            }
            if seen.insert(trimmed.clone()) {
                urls.push(trimmed);
            }
        }

        urls
    }

    fn is_vendor_url(&self, raw: &str) -> bool {
        let Ok(parsed) = Url::parse(raw) else {
            return false;
        };
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return false;
        }
        let Some(host) = parsed.host_str() else {
            return false;
        };
        self.vendor_domains
            .iter()
            .any(|d| host == d || host.ends_with(&format!(".{d}")))
    }
}

/// Reduce a rendered report page to an Article using structural selectors,
/// falling back to whole-document text nodes.
pub fn parse_article(html: &str, url: &str, hospital: &str) -> Article {
    let document = Html::parse_document(html);

    let title = select_first_text(
        &document,
        &[".article-title", ".report-title", "h1", "title"],
    )
    .unwrap_or_default();

    let source = select_first_text(&document, &[".web-name", ".source", ".platform"])
        .unwrap_or_else(|| "未知".to_string());

    let body = select_first_text(&document, &[".article-content", ".report-content", "article"])
        .unwrap_or_else(|| {
            // Text-node fallback: everything under <body>, scripts excluded
            // by scraper's text iterator operating on element text only.
            let body_selector = Selector::parse("body").expect("valid selector");
            document
                .select(&body_selector)
                .next()
                .map(|el| collapse_whitespace(&el.text().collect::<Vec<_>>().join(" ")))
                .unwrap_or_default()
        });

    Article {
        hospital: hospital.to_string(),
        source,
        title,
        url: url.to_string(),
        body,
        fetch_failed: false,
    }
}

fn select_first_text(document: &Html, selectors: &[&str]) -> Option<String> {
    for raw in selectors {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        if let Some(element) = document.select(&selector).next() {
            let text = collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "));
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate to at most `cap` bytes at a char boundary, appending an
/// ellipsis when anything was cut.
pub fn truncate_with_ellipsis(s: &str, cap: usize) -> String {
    if s.len() <= cap {
        return s.to_string();
    }
    let mut end = cap;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> Extractor {
        Extractor::new(vec!["vendor.example".to_string()])
    }

    #[test]
    fn collects_anchor_and_raw_urls() {
        let body = r#"
            <a href="https://vendor.example/r?id=1">report one</a>
            详情见 https://vendor.example/r?id=2 请查收。
            <a href="https://other.example/x">elsewhere</a>
        "#;
        let urls = extractor().collect_urls(body);
        assert_eq!(
            urls,
            vec![
                "https://vendor.example/r?id=1".to_string(),
                "https://vendor.example/r?id=2".to_string(),
            ]
        );
    }

    #[test]
    fn deduplicates_preserving_order() {
        let body = r#"
            <a href="https://vendor.example/r?id=2">two</a>
            <a href="https://vendor.example/r?id=1">one</a>
            https://vendor.example/r?id=2
        "#;
        let urls = extractor().collect_urls(body);
        assert_eq!(urls.len(), 2);
        assert!(urls[0].ends_with("id=2"));
        assert!(urls[1].ends_with("id=1"));
    }

    #[test]
    fn subdomains_count_as_vendor() {
        let body = r#"<a href="https://lt.vendor.example/h5List?token=abc">x</a>"#;
        assert_eq!(extractor().collect_urls(body).len(), 1);
    }

    #[test]
    fn non_http_schemes_rejected() {
        let body = r#"<a href="javascript:void(0)">x</a> <a href="mailto:a@vendor.example">y</a>"#;
        assert!(extractor().collect_urls(body).is_empty());
    }

    #[test]
    fn parse_article_uses_structural_selectors() {
        let html = r#"
            <html><head><title>page shell</title></head><body>
              <h1 class="article-title">病历外泄</h1>
              <span class="web-name">抖音</span>
              <div class="article-content">医院病历在网络流传，引发关注。</div>
            </body></html>
        "#;
        let article = parse_article(html, "https://vendor.example/r?id=1", "市一医院");
        assert_eq!(article.title, "病历外泄");
        assert_eq!(article.source, "抖音");
        assert!(article.body.contains("网络流传"));
        assert!(!article.fetch_failed);
    }

    #[test]
    fn parse_article_falls_back_to_body_text() {
        let html = "<html><body><p>散落的 文本 内容</p></body></html>";
        let article = parse_article(html, "https://vendor.example/r?id=1", "市一医院");
        assert_eq!(article.body, "散落的 文本 内容");
        assert_eq!(article.source, "未知");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "病历外泄".repeat(3000);
        let truncated = truncate_with_ellipsis(&text, ARTICLE_BYTE_CAP);
        assert!(truncated.len() <= ARTICLE_BYTE_CAP + '…'.len_utf8());
        assert!(truncated.ends_with('…'));
        // no cut in the middle of a code point
        assert!(truncated.chars().all(|c| c == '病' || c == '历' || c == '外' || c == '泄' || c == '…'));
    }

    #[test]
    fn short_text_not_truncated() {
        assert_eq!(truncate_with_ellipsis("short", ARTICLE_BYTE_CAP), "short");
    }
}
