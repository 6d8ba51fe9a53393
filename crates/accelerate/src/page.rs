//! Facts about the page the client is running in.

use crate::session::Visibility;
use std::collections::BTreeMap;
use url::Url;

/// Document loading state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadyState {
    Loading,
    Interactive,
    #[default]
    Complete,
}

/// Static page information supplied by the host when the client is built.
#[derive(Debug, Clone)]
pub struct PageContext {
    pub(crate) url: String,
    pub(crate) referrer: Option<String>,
    pub(crate) title: String,
    pub(crate) user_agent: String,
    pub(crate) locale: Option<String>,
    pub(crate) timezone: Option<String>,
    pub(crate) cookies: String,
    pub(crate) visibility: Visibility,
    pub(crate) ready_state: ReadyState,
}

impl Default for PageContext {
    fn default() -> Self {
        Self::new("about:blank")
    }
}

impl PageContext {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            referrer: None,
            title: String::new(),
            user_agent: String::new(),
            locale: None,
            timezone: None,
            cookies: String::new(),
            visibility: Visibility::Visible,
            ready_state: ReadyState::Complete,
        }
    }

    pub fn referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    /// Raw `document.cookie` string.
    pub fn cookies(mut self, cookies: impl Into<String>) -> Self {
        self.cookies = cookies.into();
        self
    }

    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn ready_state(mut self, ready_state: ReadyState) -> Self {
        self.ready_state = ready_state;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn user_agent_str(&self) -> &str {
        &self.user_agent
    }

    pub fn locale_str(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    pub fn timezone_str(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    pub fn cookie_str(&self) -> &str {
        &self.cookies
    }

    /// Non-empty referrer, if any.
    pub fn referrer_str(&self) -> Option<&str> {
        self.referrer.as_deref().filter(|r| !r.is_empty())
    }

    fn parsed(&self) -> Option<Url> {
        Url::parse(&self.url).ok()
    }

    pub fn host(&self) -> Option<String> {
        self.parsed()?.host_str().map(String::from)
    }

    /// Whether the referrer points at a different host than the page.
    pub fn has_external_referrer(&self) -> bool {
        let Some(referrer) = self.referrer_str() else {
            return false;
        };
        let referrer_host = Url::parse(referrer)
            .ok()
            .and_then(|u| u.host_str().map(String::from));
        match referrer_host {
            Some(host) => Some(host) != self.host(),
            None => false,
        }
    }

    /// Decoded query parameters in document order.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.parsed()
            .map(|u| {
                u.query_pairs()
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Location attributes recorded on every event.
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let mut attributes = BTreeMap::new();
        attributes.insert("url".to_string(), self.url.clone());
        if let Some(url) = self.parsed() {
            attributes.insert("host".into(), url.host_str().unwrap_or_default().into());
            attributes.insert("path".into(), url.path().into());
            attributes.insert(
                "search".into(),
                url.query().map(|q| format!("?{}", q)).unwrap_or_default(),
            );
            attributes.insert(
                "hash".into(),
                url.fragment().map(|f| format!("#{}", f)).unwrap_or_default(),
            );
        }
        attributes.insert(
            "referer".into(),
            self.referrer_str().unwrap_or_default().into(),
        );
        attributes.insert("title".into(), self.title.clone());
        attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributes() {
        let page = PageContext::new("https://example.com/blog/post?utm_source=news#top")
            .referrer("https://google.com/")
            .title("Post");

        let attributes = page.attributes();
        assert_eq!(attributes["host"], "example.com");
        assert_eq!(attributes["path"], "/blog/post");
        assert_eq!(attributes["search"], "?utm_source=news");
        assert_eq!(attributes["hash"], "#top");
        assert_eq!(attributes["referer"], "https://google.com/");
        assert_eq!(attributes["title"], "Post");
    }

    #[test]
    fn test_external_referrer() {
        let external = PageContext::new("https://example.com/").referrer("https://google.com/");
        let internal = PageContext::new("https://example.com/a").referrer("https://example.com/b");
        let none = PageContext::new("https://example.com/");

        assert!(external.has_external_referrer());
        assert!(!internal.has_external_referrer());
        assert!(!none.has_external_referrer());
    }

    #[test]
    fn test_query_pairs_are_decoded() {
        let page = PageContext::new("https://example.com/?utm_campaign=spring%20sale&x=1");
        assert_eq!(
            page.query_pairs(),
            vec![
                ("utm_campaign".to_string(), "spring sale".to_string()),
                ("x".to_string(), "1".to_string()),
            ]
        );
    }
}
