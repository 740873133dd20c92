use crate::url::Url;

/// Header that AJAX requests carry.
pub const AJAX_HEADER: &str = "X-Trellis-Ajax";

/// Header that overrides the page id encoded in the URL. Set by AJAX history navigation.
pub const PAGE_ID_HEADER: &str = "X-Page-Id";

/// Query parameter that overrides the page id encoded in the URL, when [`PAGE_ID_HEADER`] is
/// absent.
pub const PAGE_ID_PARAMETER: &str = "page-id";

/// An incoming request: its URL relative to the application root, and its headers.
#[derive(Clone, Debug, Default)]
pub struct Request {
    url: Url,
    headers: Vec<(String, String)>,
}

impl Request {
    /// Creates a request without headers.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
        }
    }

    /// Parses `url` and creates a request without headers.
    pub fn get(url: &str) -> Self {
        Self::new(Url::parse(url))
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Marks this request as an AJAX request.
    pub fn ajax(self) -> Self {
        self.with_header(AJAX_HEADER, "true")
    }

    /// The request URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The value of the first header named `name`. Header names are case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Indicates whether this is an AJAX request.
    pub fn is_ajax(&self) -> bool {
        self.header(AJAX_HEADER)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// The page id that replaces the one encoded in the URL, if any.
    ///
    /// The header takes precedence over the query parameter. A value that is not a page id is
    /// ignored.
    pub fn page_id_override(&self) -> Option<u32> {
        let value = match self.header(PAGE_ID_HEADER) {
            Some(v) if !v.is_empty() => v,
            _ => self.url.query_parameter_value(PAGE_ID_PARAMETER)?,
        };
        value.trim().parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ajax_detection() {
        assert!(!Request::get("/").is_ajax());
        assert!(Request::get("/").ajax().is_ajax());
        assert!(Request::get("/")
            .with_header("x-trellis-ajax", "TRUE")
            .is_ajax());
    }

    #[test]
    fn page_id_override() {
        assert_eq!(Request::get("/a?1").page_id_override(), None);
        assert_eq!(Request::get("/a?1&page-id=7").page_id_override(), Some(7));
        assert_eq!(
            Request::get("/a?1&page-id=7")
                .with_header(PAGE_ID_HEADER, "9")
                .page_id_override(),
            Some(9)
        );
        assert_eq!(
            Request::get("/a?1&page-id=7")
                .with_header(PAGE_ID_HEADER, "")
                .page_id_override(),
            Some(7)
        );
        assert_eq!(Request::get("/a?page-id=x").page_id_override(), None);
    }
}
