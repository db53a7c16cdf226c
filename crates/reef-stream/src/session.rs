use std::collections::BTreeMap;

/// Session identity carried on every outbound request: the document's
/// cookie jar and user agent.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub cookie: String,
    pub user_agent: String,
}

impl Session {
    pub fn new(cookie: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            cookie: cookie.into(),
            user_agent: user_agent.into(),
        }
    }

    /// Value of the `csrftoken` cookie pair, if present.
    pub fn csrf_token(&self) -> Option<String> {
        self.cookie
            .split(';')
            .map(str::trim)
            .find_map(|pair| pair.strip_prefix("csrftoken="))
            .map(str::to_string)
    }

    /// Headers merged into outbound request options. Backend auth is
    /// cookie-based, so the whole jar travels along with the CSRF token
    /// pulled out for the header the API checks.
    pub fn auth_headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        if !self.cookie.is_empty() {
            headers.insert("Cookie".to_string(), self.cookie.clone());
        }
        if !self.user_agent.is_empty() {
            headers.insert("User-Agent".to_string(), self.user_agent.clone());
        }
        if let Some(token) = self.csrf_token() {
            headers.insert("X-CSRFToken".to_string(), token);
        }
        headers
    }
}
