//! Page parameters and their encoding in URLs.

use crate::url::Url;

/// A named page parameter. A name may occur more than once.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct NamedParameter {
    /// Parameter name.
    pub name: String,
    /// Parameter value.
    pub value: String,
}

/// The parameters of a bookmarkable page: indexed parameters (usually encoded as path segments)
/// and named parameters (usually encoded in the query string).
///
/// Two parameter sets are equal when their indexed parameters are equal, in order, and their named
/// parameters are equal as a multiset. The order of named parameters is kept, but does not matter.
///
/// A named parameter with an empty value whose name reads as a page component info (such as `5`)
/// is never encoded as the first query parameter, unless all named parameters are of that kind.
#[derive(Clone, Debug, Default)]
pub struct PageParameters {
    indexed: Vec<String>,
    named: Vec<NamedParameter>,
}

impl PageParameters {
    /// Creates an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named parameter, keeping any existing values of the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.named.push(NamedParameter {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Sets a named parameter, replacing all existing values of the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        self.named.retain(|p| p.name != name);
        self.named.push(NamedParameter {
            name,
            value: value.into(),
        });
        self
    }

    /// The first value of a named parameter.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.named
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// All values of a named parameter, in the order they were added.
    pub fn get_values(&self, name: &str) -> Vec<&str> {
        self.named
            .iter()
            .filter(|p| p.name == name)
            .map(|p| p.value.as_str())
            .collect()
    }

    /// Removes all values of a named parameter.
    pub fn remove(&mut self, name: &str) -> &mut Self {
        self.named.retain(|p| p.name != name);
        self
    }

    /// The named parameters, in the order they were added.
    pub fn named(&self) -> &[NamedParameter] {
        &self.named
    }

    /// The indexed parameters.
    pub fn indexed(&self) -> &[String] {
        &self.indexed
    }

    /// Sets the indexed parameter at `index`, filling any gap with empty strings.
    pub fn set_indexed(&mut self, index: usize, value: impl Into<String>) -> &mut Self {
        if self.indexed.len() <= index {
            self.indexed.resize(index + 1, String::new());
        }
        self.indexed[index] = value.into();
        self
    }

    /// Indicates whether there are no parameters at all.
    pub fn is_empty(&self) -> bool {
        self.indexed.is_empty() && self.named.is_empty()
    }
}

impl PartialEq for PageParameters {
    fn eq(&self, other: &Self) -> bool {
        if self.indexed != other.indexed || self.named.len() != other.named.len() {
            return false;
        }
        let mut a: Vec<&NamedParameter> = self.named.iter().collect();
        let mut b: Vec<&NamedParameter> = other.named.iter().collect();
        a.sort();
        b.sort();
        a == b
    }
}

impl Eq for PageParameters {}

/// Converts between [`PageParameters`] and the part of a URL that follows a mapper's own segments.
pub trait PageParametersEncoder: Send + Sync {
    /// Decodes parameters from the remaining segments and query parameters of a URL. The URL does
    /// not contain the segments or query parameters that the mapper itself uses.
    fn decode_page_parameters(&self, url: &Url) -> PageParameters;

    /// Encodes parameters as segments and query parameters, to be appended to a mapper's own URL.
    fn encode_page_parameters(&self, parameters: &PageParameters) -> Url;
}

/// Encodes indexed parameters as path segments and named parameters as query parameters.
///
/// `/page/a/b?x=1&y=2` has indexed parameters `[a, b]` and named parameters `x=1, y=2`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultPageParametersEncoder;

impl PageParametersEncoder for DefaultPageParametersEncoder {
    fn decode_page_parameters(&self, url: &Url) -> PageParameters {
        let mut parameters = PageParameters::new();
        for (i, segment) in url.segments().iter().enumerate() {
            parameters.set_indexed(i, segment.as_str());
        }
        for p in url.query_parameters() {
            parameters.add(p.name.as_str(), p.value.as_str());
        }
        parameters
    }

    fn encode_page_parameters(&self, parameters: &PageParameters) -> Url {
        let mut url = Url::new();
        for segment in parameters.indexed() {
            url.push_segment(segment.as_str());
        }
        for p in parameters.named() {
            url.push_query_parameter(p.name.as_str(), p.value.as_str());
        }
        url
    }
}

/// Encodes named parameters as alternating name and value path segments, and ignores indexed
/// parameters.
///
/// `/page/x/1/y/2` has named parameters `x=1, y=2`. A trailing name without a value is dropped.
#[derive(Clone, Copy, Debug, Default)]
pub struct PathPageParametersEncoder;

impl PageParametersEncoder for PathPageParametersEncoder {
    fn decode_page_parameters(&self, url: &Url) -> PageParameters {
        let mut parameters = PageParameters::new();
        for pair in url.segments().chunks_exact(2) {
            if !pair[0].is_empty() {
                parameters.add(pair[0].as_str(), pair[1].as_str());
            }
        }
        for p in url.query_parameters() {
            parameters.add(p.name.as_str(), p.value.as_str());
        }
        parameters
    }

    fn encode_page_parameters(&self, parameters: &PageParameters) -> Url {
        let mut url = Url::new();
        for p in parameters.named() {
            url.push_segment(p.name.as_str());
            url.push_segment(p.value.as_str());
        }
        url
    }
}
