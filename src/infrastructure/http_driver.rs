//! HTTP page driver for form-based lookup pages
//!
//! Each execution context owns its own `reqwest::Client` with a private cookie
//! store, so recreating a context starts a clean session. All contexts share a
//! single rate limiter to keep the aggregate request rate polite.

#![allow(clippy::uninlined_format_args)]

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info};
use url::Url;

use super::config::SiteConfig;
use super::page_driver::{DriverError, DriverFactory, MarkerSample, PageDriver};

/// Where and how the lookup form submits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormTarget {
    pub action: Url,
    pub post: bool,
    pub field_name: String,
    pub hidden: Vec<(String, String)>,
}

/// Factory producing one [`HttpPageDriver`] per execution context
pub struct HttpDriverFactory {
    site: Arc<SiteConfig>,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
}

impl HttpDriverFactory {
    pub fn new(site: SiteConfig) -> Result<Self, DriverError> {
        let quota = Quota::per_second(
            NonZeroU32::new(site.max_requests_per_second)
                .ok_or_else(|| DriverError::Initialization("Rate limit must be greater than 0".into()))?,
        );
        Ok(Self {
            site: Arc::new(site),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }
}

#[async_trait]
impl DriverFactory for HttpDriverFactory {
    async fn create(&self, worker_id: usize) -> Result<Box<dyn PageDriver>, DriverError> {
        let driver = HttpPageDriver::new(worker_id, Arc::clone(&self.site), Arc::clone(&self.rate_limiter))?;
        info!("🌐 Created HTTP session for worker {}", worker_id);
        Ok(Box::new(driver))
    }
}

/// Plain-HTTP implementation of [`PageDriver`]
pub struct HttpPageDriver {
    worker_id: usize,
    client: Client,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    site: Arc<SiteConfig>,
    current_url: Option<Url>,
    current_html: String,
    form: Option<FormTarget>,
}

impl HttpPageDriver {
    pub fn new(
        worker_id: usize,
        site: Arc<SiteConfig>,
        rate_limiter: Arc<DefaultDirectRateLimiter>,
    ) -> Result<Self, DriverError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&site.user_agent)
                .map_err(|e| DriverError::Initialization(format!("Invalid user agent: {}", e)))?,
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(site.request_timeout_secs))
            .default_headers(headers)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| DriverError::Initialization(e.to_string()))?;

        Ok(Self {
            worker_id,
            client,
            rate_limiter,
            site,
            current_url: None,
            current_html: String::new(),
            form: None,
        })
    }

    /// Rate-limited request; non-success statuses become driver errors
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, DriverError> {
        self.rate_limiter.until_ready().await;

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();

        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(DriverError::Blocked(format!("HTTP {} from {}", status.as_u16(), response.url())));
        }
        if !status.is_success() {
            return Err(DriverError::Http(status.as_u16(), response.url().to_string()));
        }
        Ok(response)
    }

    async fn send(&mut self, request: reqwest::RequestBuilder) -> Result<(), DriverError> {
        let response = self.execute(request).await?;
        let final_url = response.url().clone();

        let body = response
            .text()
            .await
            .map_err(|e| DriverError::Network(format!("Failed to read response body: {}", e)))?;

        debug!("worker {} fetched {} ({} bytes)", self.worker_id, final_url, body.len());
        self.current_url = Some(final_url);
        self.current_html = body;
        Ok(())
    }
}

#[async_trait]
impl PageDriver for HttpPageDriver {
    async fn open(&mut self, target_url: &str) -> Result<(), DriverError> {
        self.form = None;
        let request = self.client.get(target_url);
        self.send(request).await
    }

    async fn locate_input_field(&mut self) -> Result<bool, DriverError> {
        if self.site.query_template.is_some() {
            return Ok(true);
        }
        let Some(base) = self.current_url.clone() else {
            return Ok(false);
        };
        self.form = find_form(&self.current_html, &base, &self.site.input_selector)?;
        Ok(self.form.is_some())
    }

    async fn fill_and_submit(&mut self, value: &str) -> Result<(), DriverError> {
        if let Some(template) = &self.site.query_template {
            let url = template.replace("{key}", value);
            let request = self.client.get(url);
            return self.send(request).await;
        }

        let form = self
            .form
            .clone()
            .ok_or_else(|| DriverError::Structure("Input field was not located before submit".into()))?;

        let mut pairs = form.hidden.clone();
        pairs.retain(|(name, _)| name != &form.field_name);
        pairs.push((form.field_name.clone(), value.to_string()));

        let request = if form.post {
            self.client.post(form.action.clone()).form(&pairs)
        } else {
            self.client.get(form.action.clone()).query(&pairs)
        };
        self.send(request).await
    }

    async fn sample_markers(&mut self) -> Result<MarkerSample, DriverError> {
        let base = self.current_url.clone();
        extract_markers(&self.current_html, base.as_ref(), &self.site)
    }

    async fn fetch_artifact(&mut self, reference: &str) -> Result<Vec<u8>, DriverError> {
        let url = resolve_reference(self.current_url.as_ref(), reference)?;
        let request = self.client.get(url.clone());
        let bytes = self
            .execute(request)
            .await?
            .bytes()
            .await
            .map_err(|e| DriverError::Network(format!("Failed to read artifact body: {}", e)))?;
        debug!("worker {} downloaded {} ({} bytes)", self.worker_id, url, bytes.len());
        Ok(bytes.to_vec())
    }

    fn page_source(&self) -> Option<String> {
        (!self.current_html.is_empty()).then(|| self.current_html.clone())
    }

    async fn close(&mut self) {
        debug!("worker {} closing HTTP session", self.worker_id);
        self.current_html.clear();
        self.current_url = None;
        self.form = None;
    }
}

fn map_reqwest_error(error: reqwest::Error) -> DriverError {
    if error.is_connect() || error.is_timeout() || error.is_request() {
        DriverError::Network(error.to_string())
    } else {
        DriverError::Unexpected(error.to_string())
    }
}

/// Absolute URL for an artifact reference found on the page at `base`
pub fn resolve_reference(base: Option<&Url>, reference: &str) -> Result<Url, DriverError> {
    let reference = reference.trim();
    let resolved = match base {
        Some(base) => base.join(reference),
        None => Url::parse(reference),
    };
    resolved.map_err(|e| DriverError::Structure(format!("Bad artifact reference '{}': {}", reference, e)))
}

fn parse_selector(raw: &str) -> Result<Selector, DriverError> {
    Selector::parse(raw).map_err(|e| DriverError::Structure(format!("Invalid selector '{}': {}", raw, e)))
}

/// Collapse runs of whitespace into single spaces
#[must_use]
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(element: &ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "))
}

/// Locate the key input and the form it belongs to
pub fn find_form(html: &str, base: &Url, input_selector: &str) -> Result<Option<FormTarget>, DriverError> {
    let document = Html::parse_document(html);
    let input_selector = parse_selector(input_selector)?;
    let hidden_selector = parse_selector("input[type='hidden']")?;

    let Some(input) = document.select(&input_selector).next() else {
        return Ok(None);
    };

    let field_name = input
        .value()
        .attr("name")
        .or_else(|| input.value().attr("id"))
        .unwrap_or("zip")
        .to_string();

    let form = input
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "form");

    let Some(form) = form else {
        return Ok(Some(FormTarget {
            action: base.clone(),
            post: false,
            field_name,
            hidden: Vec::new(),
        }));
    };

    let action = match form.value().attr("action").map(str::trim) {
        Some(action) if !action.is_empty() => base
            .join(action)
            .map_err(|e| DriverError::Structure(format!("Bad form action '{}': {}", action, e)))?,
        _ => base.clone(),
    };
    let post = form
        .value()
        .attr("method")
        .is_some_and(|m| m.eq_ignore_ascii_case("post"));
    let hidden = form
        .select(&hidden_selector)
        .filter_map(|el| {
            let name = el.value().attr("name")?;
            Some((name.to_string(), el.value().attr("value").unwrap_or_default().to_string()))
        })
        .collect();

    Ok(Some(FormTarget {
        action,
        post,
        field_name,
        hidden,
    }))
}

/// Sample success/failure markers and the primary text from a page
pub fn extract_markers(html: &str, base: Option<&Url>, site: &SiteConfig) -> Result<MarkerSample, DriverError> {
    if html.is_empty() {
        return Ok(MarkerSample::default());
    }
    let document = Html::parse_document(html);
    let success_selector = parse_selector(&site.success_selector)?;
    let failure_selector = parse_selector(&site.failure_selector)?;
    let content_selector = parse_selector(&site.content_selector)?;

    let success_marker = document.select(&success_selector).find_map(|el| {
        let attr_value = site
            .success_attributes
            .iter()
            .filter_map(|attr| el.value().attr(attr))
            .map(str::trim)
            .find(|v| !v.is_empty());
        let raw = attr_value.map_or_else(|| element_text(&el), ToString::to_string);
        if raw.is_empty() {
            return None;
        }
        Some(match base.and_then(|b| b.join(&raw).ok()) {
            Some(resolved) if attr_value.is_some() => resolved.to_string(),
            _ => raw,
        })
    });

    let failure_marker = document
        .select(&failure_selector)
        .map(|el| element_text(&el))
        .find(|text| !text.is_empty());

    let primary_text = document
        .select(&content_selector)
        .next()
        .map_or_else(|| element_text(&document.root_element()), |el| element_text(&el));

    Ok(MarkerSample {
        success_marker,
        failure_marker,
        primary_text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORM_PAGE: &str = r#"
        <html><body>
          <h1>Service maps</h1>
          <form action="/servicemaps/lookup" method="POST">
            <input type="hidden" name="token" value="abc123">
            <input type="text" id="shipperZipCode" name="shipperZip">
            <button type="submit">View map</button>
          </form>
        </body></html>"#;

    fn site() -> SiteConfig {
        SiteConfig {
            success_selector: "a[href$='.pdf'], #mapURLHidden".into(),
            failure_selector: ".errortext".into(),
            ..SiteConfig::default()
        }
    }

    #[test]
    fn finds_form_with_hidden_fields() {
        let base = Url::parse("https://freight.example/servicemaps.jsp").unwrap();
        let form = find_form(FORM_PAGE, &base, "#shipperZipCode").unwrap().unwrap();
        assert_eq!(form.action.as_str(), "https://freight.example/servicemaps/lookup");
        assert!(form.post);
        assert_eq!(form.field_name, "shipperZip");
        assert_eq!(form.hidden, vec![("token".to_string(), "abc123".to_string())]);
    }

    #[test]
    fn missing_input_yields_none() {
        let base = Url::parse("https://freight.example/").unwrap();
        assert!(find_form("<html><body>maintenance</body></html>", &base, "#shipperZipCode")
            .unwrap()
            .is_none());
    }

    #[test]
    fn success_marker_is_resolved_against_page_url() {
        let html = r#"<html><body><div id="result">
            <a href="/maps/90210.pdf">Download map</a></div></body></html>"#;
        let base = Url::parse("https://freight.example/servicemaps.jsp").unwrap();
        let sample = extract_markers(html, Some(&base), &site()).unwrap();
        assert_eq!(sample.success_marker.as_deref(), Some("https://freight.example/maps/90210.pdf"));
        assert!(sample.failure_marker.is_none());
        assert_eq!(sample.primary_text, "Download map");
    }

    #[test]
    fn failure_panel_and_hidden_value() {
        let html = r#"<html><body>
            <span class="errortext">  Sorry,   no results found. </span>
            <input type="hidden" id="mapURLHidden" value="">
          </body></html>"#;
        let sample = extract_markers(html, None, &site()).unwrap();
        assert!(sample.success_marker.is_none());
        assert_eq!(sample.failure_marker.as_deref(), Some("Sorry, no results found."));
    }

    #[test]
    fn artifact_references_resolve_against_the_page() {
        let base = Url::parse("https://freight.example/servicemaps/lookup").unwrap();
        assert_eq!(
            resolve_reference(Some(&base), " /maps/90210.png ").unwrap().as_str(),
            "https://freight.example/maps/90210.png"
        );
        assert_eq!(
            resolve_reference(None, "https://cdn.example/a.pdf").unwrap().as_str(),
            "https://cdn.example/a.pdf"
        );
        assert!(matches!(resolve_reference(None, "maps/1.png"), Err(DriverError::Structure(_))));
    }

    #[test]
    fn invalid_selector_is_a_structure_error() {
        let bad = SiteConfig {
            success_selector: "a[".into(),
            ..site()
        };
        let err = extract_markers("<p>x</p>", None, &bad).unwrap_err();
        assert!(matches!(err, DriverError::Structure(_)));
    }
}
