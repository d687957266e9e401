//! Document query capability over a fetched HTML body
//!
//! This module handles parsing HTML content to extract:
//! - The page title
//! - Text and attributes selected by CSS selectors
//! - Links to follow (from <a> tags and canonical links)

use crate::HarvestError;
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// A parsed HTML document bound to the URL it was fetched from
///
/// `scraper::Html` is not `Send`: build a `Document`, query it, and drop it
/// before the next `.await`.
pub struct Document {
    html: Html,
    base_url: Option<Url>,
}

impl Document {
    /// Parses `body`; relative links resolve against `base_url`
    pub fn parse(body: &str, base_url: &str) -> Self {
        Self {
            html: Html::parse_document(body),
            base_url: Url::parse(base_url).ok(),
        }
    }

    /// The page title (from the <title> tag)
    pub fn title(&self) -> Option<String> {
        let title_selector = Selector::parse("title").ok()?;

        self.html
            .select(&title_selector)
            .next()
            .map(|element| element.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Trimmed text of every element matching `selector`
    pub fn select_text(&self, selector: &str) -> Result<Vec<String>, HarvestError> {
        let selector = parse_selector(selector)?;
        Ok(self
            .html
            .select(&selector)
            .map(|element| element.text().collect::<String>().trim().to_string())
            .collect())
    }

    /// Value of `attr` on every element matching `selector` that carries it
    pub fn select_attr(&self, selector: &str, attr: &str) -> Result<Vec<String>, HarvestError> {
        let selector = parse_selector(selector)?;
        Ok(self
            .html
            .select(&selector)
            .filter_map(|element| element.value().attr(attr))
            .map(str::to_string)
            .collect())
    }

    /// Resolves `href` against the document URL
    ///
    /// Returns None for non-navigational or non-HTTP(S) references.
    pub fn resolve(&self, href: &str) -> Option<String> {
        resolve_link(href, self.base_url.as_ref()?)
    }

    /// All absolute links found on the page
    ///
    /// # Link Extraction Rules
    ///
    /// **Include:**
    /// - `<a href="...">` tags
    /// - `<link rel="canonical" href="...">`
    ///
    /// **Exclude:**
    /// - `<a href="..." download>`
    /// - `javascript:`, `mailto:`, `tel:` links
    /// - Data URIs and fragment-only links
    pub fn links(&self) -> Vec<String> {
        let Some(base_url) = &self.base_url else {
            return Vec::new();
        };

        let mut links = Vec::new();

        if let Ok(a_selector) = Selector::parse("a[href]") {
            for element in self.html.select(&a_selector) {
                if element.value().attr("download").is_some() {
                    continue;
                }
                if let Some(url) = href_of(&element).and_then(|href| resolve_link(href, base_url)) {
                    links.push(url);
                }
            }
        }

        if let Ok(canonical_selector) = Selector::parse("link[rel='canonical'][href]") {
            for element in self.html.select(&canonical_selector) {
                if let Some(url) = href_of(&element).and_then(|href| resolve_link(href, base_url)) {
                    links.push(url);
                }
            }
        }

        links
    }
}

fn href_of<'a>(element: &ElementRef<'a>) -> Option<&'a str> {
    element.value().attr("href")
}

fn parse_selector(selector: &str) -> Result<Selector, HarvestError> {
    Selector::parse(selector).map_err(|e| HarvestError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// Resolves a link href to an absolute URL and validates it
fn resolve_link(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    if href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
    {
        return None;
    }

    match base_url.join(href) {
        Ok(absolute_url) if matches!(absolute_url.scheme(), "http" | "https") => {
            Some(absolute_url.to_string())
        }
        _ => None,
    }
}
