//! Page inspection capability consumed by the classifier.
//!
//! The engine never drives a browser itself. The orchestrator hands it
//! something that can report the current page: a live browser tab
//! (`ChromiumPageInspector`, behind the `browser` feature) or a saved
//! document (`StaticPage`).

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};

/// Read-only view of the page a request landed on.
#[async_trait]
pub trait PageInspector: Send + Sync {
    /// Raw HTML of the page.
    async fn content(&self) -> Result<String>;

    /// Rendered, human-visible text.
    async fn visible_text(&self) -> Result<String>;

    /// Whether any of the CSS selectors matches an element.
    async fn has_any_of(&self, selectors: &[&str]) -> Result<bool>;
}

/// Elements whose text is never rendered.
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

/// Page held in memory, parsed on demand.
#[derive(Debug, Clone)]
pub struct StaticPage {
    html: String,
    text: Option<String>,
}

impl StaticPage {
    pub fn new(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            text: None,
        }
    }

    /// Page with explicit visible text instead of text extracted from the HTML.
    pub fn with_text(html: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            text: Some(text.into()),
        }
    }

    /// Load a saved HTML document.
    pub fn from_file(path: &Path) -> Result<Self> {
        let html = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Self::new(html))
    }

    /// Text content of the document, skipping script and style bodies.
    pub fn extract_text(html: &str) -> String {
        let document = Html::parse_document(html);
        let mut words: Vec<&str> = Vec::new();

        for node in document.root_element().descendants() {
            let Some(text) = node.value().as_text() else {
                continue;
            };
            let hidden = node
                .parent()
                .and_then(|p| p.value().as_element().map(|e| e.name()))
                .is_some_and(|name| HIDDEN_ELEMENTS.contains(&name));
            if !hidden {
                words.extend(text.split_whitespace());
            }
        }

        words.join(" ")
    }
}

#[async_trait]
impl PageInspector for StaticPage {
    async fn content(&self) -> Result<String> {
        Ok(self.html.clone())
    }

    async fn visible_text(&self) -> Result<String> {
        Ok(match &self.text {
            Some(text) => text.clone(),
            None => Self::extract_text(&self.html),
        })
    }

    async fn has_any_of(&self, selectors: &[&str]) -> Result<bool> {
        let document = Html::parse_document(&self.html);
        for raw in selectors {
            let selector = Selector::parse(raw)
                .map_err(|e| anyhow::anyhow!("Invalid selector {}: {:?}", raw, e))?;
            if document.select(&selector).next().is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(feature = "browser")]
pub use chromium::ChromiumPageInspector;

#[cfg(feature = "browser")]
mod chromium {
    use anyhow::Result;
    use async_trait::async_trait;
    use chromiumoxide::Page;
    use tracing::debug;

    use super::PageInspector;

    const VISIBLE_TEXT_SCRIPT: &str = "document.body ? document.body.innerText : ''";

    /// Inspector over a live chromiumoxide tab.
    #[derive(Debug, Clone)]
    pub struct ChromiumPageInspector {
        page: Page,
    }

    impl ChromiumPageInspector {
        pub fn new(page: Page) -> Self {
            Self { page }
        }
    }

    #[async_trait]
    impl PageInspector for ChromiumPageInspector {
        async fn content(&self) -> Result<String> {
            Ok(self.page.content().await?)
        }

        async fn visible_text(&self) -> Result<String> {
            let result = self.page.evaluate(VISIBLE_TEXT_SCRIPT).await?;
            Ok(result.into_value::<String>().unwrap_or_default())
        }

        async fn has_any_of(&self, selectors: &[&str]) -> Result<bool> {
            for selector in selectors {
                if self.page.find_element(*selector).await.is_ok() {
                    debug!("Found element matching {}", selector);
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_skips_scripts() {
        let html = r#"<html><head><style>body { color: red }</style></head>
            <body><h1>Troppe   richieste</h1><script>var captcha = 1;</script>
            <p>Riprova più tardi</p></body></html>"#;
        assert_eq!(
            StaticPage::extract_text(html),
            "Troppe richieste Riprova più tardi"
        );
    }

    #[tokio::test]
    async fn test_static_page_has_any_of() {
        let page = StaticPage::new(
            r#"<html><body><iframe src="https://www.google.com/recaptcha/api2/anchor"></iframe></body></html>"#,
        );
        assert!(page
            .has_any_of(&[r#"iframe[src*="hcaptcha"]"#, r#"iframe[src*="recaptcha"]"#])
            .await
            .unwrap());
        assert!(!page.has_any_of(&[".g-recaptcha"]).await.unwrap());
    }

    #[tokio::test]
    async fn test_static_page_invalid_selector() {
        let page = StaticPage::new("<html></html>");
        assert!(page.has_any_of(&["[[["]).await.is_err());
    }

    #[tokio::test]
    async fn test_explicit_text_wins() {
        let page = StaticPage::with_text("<p>ignored</p>", "visible");
        assert_eq!(page.visible_text().await.unwrap(), "visible");
    }
}
