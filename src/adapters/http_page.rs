//! HTTP page driver
//!
//! A lightweight `PageDriver` on top of `reqwest` and `scraper`. Every store gets
//! one client and one cookie jar, so all pages of a store share session cookies
//! (and therefore the challenge claim marker) the way tabs of a browser do.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, Method};
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::page::{Browser, Capture, PageDriver};
use crate::domain::StoreId;
use crate::error::PageError;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Clone)]
struct StoreContext {
    client: Client,
    jar: Arc<Jar>,
}

/// Browser made of one cookie context per store
pub struct HttpBrowser {
    contexts: DashMap<StoreId, StoreContext>,
    user_agent: String,
    timeout: Duration,
}

impl HttpBrowser {
    pub fn new(user_agent: Option<String>, timeout: Duration) -> Self {
        Self {
            contexts: DashMap::new(),
            user_agent: user_agent.unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout,
        }
    }

    fn context(&self, store: &StoreId) -> Result<StoreContext, PageError> {
        let entry = self
            .contexts
            .entry(store.clone())
            .or_try_insert_with(|| {
                let jar = Arc::new(Jar::default());
                let client = Client::builder()
                    .cookie_provider(jar.clone())
                    .user_agent(self.user_agent.clone())
                    .timeout(self.timeout)
                    .build()
                    .map_err(|e| PageError::Driver(e.to_string()))?;
                info!("Opened browsing context for store {}", store);
                Ok::<_, PageError>(StoreContext { client, jar })
            })?;
        Ok(entry.value().clone())
    }
}

#[async_trait]
impl Browser for HttpBrowser {
    async fn new_page(
        &self,
        store: &StoreId,
        base_url: &str,
    ) -> Result<Arc<dyn PageDriver>, PageError> {
        let context = self.context(store)?;
        let cookie_url = Url::parse(base_url).map_err(|e| PageError::Navigation {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Arc::new(HttpPage {
            client: context.client,
            jar: context.jar,
            cookie_url,
            document: Mutex::new(None),
            typed: Mutex::new(HashMap::new()),
        }))
    }
}

#[derive(Clone)]
struct LoadedDocument {
    url: Url,
    html: String,
}

enum ClickAction {
    Follow(Url),
    Submit {
        method: Method,
        action: Url,
        fields: Vec<(String, String)>,
    },
}

/// A single page backed by plain HTTP requests
pub struct HttpPage {
    client: Client,
    jar: Arc<Jar>,
    cookie_url: Url,
    document: Mutex<Option<LoadedDocument>>,
    /// Values typed into named form fields since the last load
    typed: Mutex<HashMap<String, String>>,
}

impl HttpPage {
    fn snapshot(&self) -> Result<LoadedDocument, PageError> {
        self.document.lock().clone().ok_or(PageError::NoDocument)
    }

    fn resolve(&self, raw: &str) -> Result<Url, PageError> {
        let base = self
            .document
            .lock()
            .as_ref()
            .map(|d| d.url.clone())
            .unwrap_or_else(|| self.cookie_url.clone());
        base.join(raw).map_err(|e| PageError::Navigation {
            url: raw.to_string(),
            reason: e.to_string(),
        })
    }

    async fn load(
        &self,
        method: Method,
        url: Url,
        form: Option<Vec<(String, String)>>,
    ) -> Result<(), PageError> {
        let target = url.to_string();
        let mut request = self.client.request(method, url);
        if let Some(fields) = form {
            request = request.form(&fields);
        }

        let response = request.send().await.map_err(|e| request_error(&target, e))?;
        let status = response.status();
        let final_url = response.url().clone();
        let html = response.text().await.map_err(|e| request_error(&target, e))?;

        debug!("Loaded {} ({}, {} bytes)", final_url, status, html.len());

        *self.document.lock() = Some(LoadedDocument {
            url: final_url,
            html,
        });
        self.typed.lock().clear();
        Ok(())
    }

    fn plan_click(&self, selector: &str) -> Result<ClickAction, PageError> {
        let doc = self.snapshot()?;
        let typed = self.typed.lock().clone();
        let html = Html::parse_document(&doc.html);
        let sel = parse_selector(selector)?;
        let element = html
            .select(&sel)
            .next()
            .ok_or_else(|| PageError::ElementNotFound(selector.to_string()))?;

        if element.value().name() == "a" {
            if let Some(href) = element.value().attr("href") {
                let target = doc.url.join(href).map_err(|e| PageError::Navigation {
                    url: href.to_string(),
                    reason: e.to_string(),
                })?;
                return Ok(ClickAction::Follow(target));
            }
        }

        let form = if element.value().name() == "form" {
            Some(element)
        } else {
            element
                .ancestors()
                .filter_map(ElementRef::wrap)
                .find(|e| e.value().name() == "form")
        };

        let form = form.ok_or_else(|| {
            PageError::Driver(format!(
                "'{}' is neither a link nor part of a form",
                selector
            ))
        })?;

        let mut fields = collect_form_fields(&form, &typed);
        if let Some(name) = element.value().attr("name") {
            let value = element.value().attr("value").unwrap_or_default();
            fields.push((name.to_string(), value.to_string()));
        }

        let method = match form.value().attr("method") {
            Some(m) if m.eq_ignore_ascii_case("post") => Method::POST,
            _ => Method::GET,
        };
        let action = match form.value().attr("action") {
            Some(a) if !a.trim().is_empty() => {
                doc.url.join(a).map_err(|e| PageError::Navigation {
                    url: a.to_string(),
                    reason: e.to_string(),
                })?
            }
            _ => doc.url.clone(),
        };

        Ok(ClickAction::Submit {
            method,
            action,
            fields,
        })
    }
}

#[async_trait]
impl PageDriver for HttpPage {
    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        let target = self.resolve(url)?;
        self.load(Method::GET, target, None).await
    }

    fn current_url(&self) -> Option<String> {
        self.document.lock().as_ref().map(|d| d.url.to_string())
    }

    async fn query_selector_text(&self, selector: &str) -> Result<Option<String>, PageError> {
        let doc = self.snapshot()?;
        let html = Html::parse_document(&doc.html);
        let sel = parse_selector(selector)?;
        Ok(html.select(&sel).next().map(|element| {
            let text: Vec<&str> = element.text().map(str::trim).filter(|t| !t.is_empty()).collect();
            text.join(" ")
        }))
    }

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, PageError> {
        let doc = self.snapshot()?;
        let html = Html::parse_document(&doc.html);
        let sel = parse_selector(selector)?;
        Ok(html
            .select(&sel)
            .next()
            .and_then(|element| element.value().attr(name).map(str::to_string)))
    }

    async fn click(&self, selector: &str) -> Result<(), PageError> {
        match self.plan_click(selector)? {
            ClickAction::Follow(url) => self.load(Method::GET, url, None).await,
            ClickAction::Submit {
                method,
                mut action,
                fields,
            } => {
                if method == Method::GET {
                    action.query_pairs_mut().clear().extend_pairs(fields.iter());
                    self.load(Method::GET, action, None).await
                } else {
                    self.load(Method::POST, action, Some(fields)).await
                }
            }
        }
    }

    async fn wait_for_navigation(&self) -> Result<(), PageError> {
        // Requests complete before click/navigate return.
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), PageError> {
        let name = {
            let doc = self.snapshot()?;
            let html = Html::parse_document(&doc.html);
            let sel = parse_selector(selector)?;
            let element = html
                .select(&sel)
                .next()
                .ok_or_else(|| PageError::ElementNotFound(selector.to_string()))?;
            element
                .value()
                .attr("name")
                .map(str::to_string)
                .ok_or_else(|| PageError::Driver(format!("'{}' has no name attribute", selector)))?
        };
        self.typed.lock().insert(name, text.to_string());
        Ok(())
    }

    async fn capture(&self) -> Result<Capture, PageError> {
        Ok(Capture::html(self.snapshot()?.html))
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, PageError> {
        let target = self.resolve(url)?;
        let label = target.to_string();
        let response = self
            .client
            .get(target)
            .send()
            .await
            .map_err(|e| request_error(&label, e))?;
        let bytes = response.bytes().await.map_err(|e| request_error(&label, e))?;
        Ok(bytes.to_vec())
    }

    async fn get_cookie(&self, name: &str) -> Result<Option<String>, PageError> {
        let header = match self.jar.cookies(&self.cookie_url) {
            Some(h) => h,
            None => return Ok(None),
        };
        let raw = header
            .to_str()
            .map_err(|e| PageError::Driver(e.to_string()))?;
        Ok(cookie_value(raw, name))
    }

    async fn set_cookie(&self, name: &str, value: &str) -> Result<(), PageError> {
        self.jar
            .add_cookie_str(&format!("{}={}; Path=/", name, value), &self.cookie_url);
        Ok(())
    }

    async fn delete_cookie(&self, name: &str) -> Result<(), PageError> {
        // Blank first: an expired cookie alone may be rejected rather than replace the old one.
        self.jar
            .add_cookie_str(&format!("{}=; Path=/", name), &self.cookie_url);
        self.jar
            .add_cookie_str(&format!("{}=; Path=/; Max-Age=0", name), &self.cookie_url);
        Ok(())
    }
}

fn parse_selector(selector: &str) -> Result<Selector, PageError> {
    Selector::parse(selector).map_err(|_| PageError::Selector(selector.to_string()))
}

fn request_error(url: &str, err: reqwest::Error) -> PageError {
    if err.is_timeout() {
        PageError::Timeout {
            operation: format!("request to {}", url),
            elapsed_ms: 0,
        }
    } else {
        PageError::Navigation {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Extract one cookie from a `Cookie:` header value
fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.to_string())
    })
}

fn collect_form_fields(form: &ElementRef<'_>, typed: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    let Ok(inputs) = Selector::parse("input[name], textarea[name], select[name]") else {
        return fields;
    };

    for element in form.select(&inputs) {
        let node = element.value();
        let Some(name) = node.attr("name") else { continue };
        let value = match node.name() {
            "input" => {
                let kind = node.attr("type").unwrap_or("text").to_ascii_lowercase();
                match kind.as_str() {
                    "submit" | "button" | "image" | "reset" | "file" => continue,
                    "checkbox" | "radio" if node.attr("checked").is_none() => continue,
                    _ => node.attr("value").unwrap_or_default().to_string(),
                }
            }
            "textarea" => element.text().collect::<String>(),
            _ => selected_option(&element),
        };
        let value = typed.get(name).cloned().unwrap_or(value);
        fields.push((name.to_string(), value));
    }

    fields
}

fn selected_option(select: &ElementRef<'_>) -> String {
    let Ok(options) = Selector::parse("option") else {
        return String::new();
    };
    let mut first = None;
    for option in select.select(&options) {
        let value = option
            .value()
            .attr("value")
            .map(str::to_string)
            .unwrap_or_else(|| option.text().collect::<String>());
        if option.value().attr("selected").is_some() {
            return value;
        }
        first.get_or_insert(value);
    }
    first.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECKOUT_FORM: &str = r#"
        <html><body>
          <form action="/checkout/place" method="post">
            <input type="hidden" name="token" value="abc">
            <input type="checkbox" name="gift" value="1">
            <input type="checkbox" name="terms" value="yes" checked>
            <select name="ship"><option value="std">Standard</option><option value="fast" selected>Fast</option></select>
            <input type="text" name="note" value="">
            <input id="place" type="submit" name="placeOrder" value="Place order">
          </form>
          <a id="cart" href="/cart">Cart</a>
        </body></html>"#;

    fn page_with(html: &str) -> HttpPage {
        HttpPage {
            client: Client::new(),
            jar: Arc::new(Jar::default()),
            cookie_url: Url::parse("https://shop.example").unwrap(),
            document: Mutex::new(Some(LoadedDocument {
                url: Url::parse("https://shop.example/checkout").unwrap(),
                html: html.to_string(),
            })),
            typed: Mutex::new(HashMap::new()),
        }
    }

    #[test]
    fn cookie_value_finds_named_cookie() {
        assert_eq!(cookie_value("a=1; marker=s1:10", "marker"), Some("s1:10".into()));
        assert_eq!(cookie_value("a=1", "marker"), None);
        assert_eq!(cookie_value("marker=", "marker"), None);
    }

    #[test]
    fn click_on_submit_posts_enclosing_form() {
        let page = page_with(CHECKOUT_FORM);
        page.typed.lock().insert("note".into(), "leave at door".into());

        match page.plan_click("#place").unwrap() {
            ClickAction::Submit {
                method,
                action,
                fields,
            } => {
                assert_eq!(method, Method::POST);
                assert_eq!(action.as_str(), "https://shop.example/checkout/place");
                assert!(fields.contains(&("token".into(), "abc".into())));
                assert!(fields.contains(&("terms".into(), "yes".into())));
                assert!(fields.contains(&("ship".into(), "fast".into())));
                assert!(fields.contains(&("note".into(), "leave at door".into())));
                assert!(fields.contains(&("placeOrder".into(), "Place order".into())));
                assert!(!fields.iter().any(|(k, _)| k == "gift"));
            }
            ClickAction::Follow(_) => panic!("expected a form submission"),
        }
    }

    #[test]
    fn click_on_link_follows_href() {
        let page = page_with(CHECKOUT_FORM);
        match page.plan_click("#cart").unwrap() {
            ClickAction::Follow(url) => assert_eq!(url.as_str(), "https://shop.example/cart"),
            ClickAction::Submit { .. } => panic!("expected link navigation"),
        }
    }

    #[test]
    fn click_on_missing_element_is_an_error() {
        let page = page_with(CHECKOUT_FORM);
        assert!(matches!(
            page.plan_click("#nope"),
            Err(PageError::ElementNotFound(_))
        ));
    }

    #[tokio::test]
    async fn selector_queries_report_absence_as_none() {
        let page = page_with("<div id='price'> $45.00 </div>");
        assert_eq!(
            page.query_selector_text("#price").await.unwrap(),
            Some("$45.00".to_string())
        );
        assert_eq!(page.query_selector_text("#missing").await.unwrap(), None);
        assert!(matches!(
            page.query_selector_text("##bad").await,
            Err(PageError::Selector(_))
        ));
    }

    #[tokio::test]
    async fn cookies_round_trip_through_store_jar() {
        let page = page_with("<p></p>");
        page.set_cookie("cw_claim", "s1:100").await.unwrap();
        assert_eq!(page.get_cookie("cw_claim").await.unwrap(), Some("s1:100".into()));
        page.delete_cookie("cw_claim").await.unwrap();
        assert_eq!(page.get_cookie("cw_claim").await.unwrap(), None);
    }
}
