//! Request URLs, relative to the application root.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Characters that are escaped within a path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Characters that are escaped within a query parameter name or value.
const QUERY: &AsciiSet = &SEGMENT.add(b'&').add(b'=').add(b'+');

/// A name/value pair in the query string of a [`Url`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct QueryParameter {
    /// Decoded name.
    pub name: String,
    /// Decoded value. A parameter that has no `=` has an empty value.
    pub value: String,
}

impl QueryParameter {
    /// Creates a query parameter.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A URL path and query string, relative to the application root.
///
/// Segments and query parameters are stored decoded. The first query parameter has a special
/// role: when its value is empty, its name may carry a [`crate::PageComponentInfo`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Url {
    segments: Vec<String>,
    query_parameters: Vec<QueryParameter>,
}

impl Url {
    /// Creates an empty URL (the application root).
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a URL from decoded segments and query parameters.
    pub fn from_parts(segments: Vec<String>, query_parameters: Vec<QueryParameter>) -> Self {
        Self {
            segments,
            query_parameters,
        }
    }

    /// Parses a URL path and query string. A leading `/` is optional.
    pub fn parse(s: &str) -> Self {
        let s = s.strip_prefix('/').unwrap_or(s);
        let (path, query) = match s.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (s, None),
        };

        let segments = if path.is_empty() {
            Vec::new()
        } else {
            path.split('/').map(decode).collect()
        };

        let query_parameters = query
            .into_iter()
            .flat_map(|q| q.split('&'))
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((name, value)) => QueryParameter::new(decode(name), decode(value)),
                None => QueryParameter::new(decode(p), ""),
            })
            .collect();

        Self {
            segments,
            query_parameters,
        }
    }

    /// The decoded path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The decoded query parameters, in order.
    pub fn query_parameters(&self) -> &[QueryParameter] {
        &self.query_parameters
    }

    /// Appends a path segment.
    pub fn push_segment(&mut self, segment: impl Into<String>) {
        self.segments.push(segment.into());
    }

    /// Replaces the path segment at `index`. Does nothing if there is no such segment.
    pub fn set_segment(&mut self, index: usize, segment: impl Into<String>) {
        if let Some(s) = self.segments.get_mut(index) {
            *s = segment.into();
        }
    }

    /// Appends a query parameter.
    pub fn push_query_parameter(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.query_parameters.push(QueryParameter::new(name, value));
    }

    /// Adds the segments and query parameters of `other` after those of `self`.
    pub fn append(&mut self, other: Url) {
        self.segments.extend(other.segments);
        self.query_parameters.extend(other.query_parameters);
    }

    /// Moves the query parameter at `index` in front of all others. The others keep their order.
    pub fn move_query_parameter_to_front(&mut self, index: usize) {
        if index < self.query_parameters.len() {
            self.query_parameters[..=index].rotate_right(1);
        }
    }

    /// The value of the first query parameter named `name`.
    pub fn query_parameter_value(&self, name: &str) -> Option<&str> {
        self.query_parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// Indicates whether this URL has neither segments nor query parameters.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty() && self.query_parameters.is_empty()
    }

    /// Indicates whether the path of this URL starts with `prefix`.
    pub fn starts_with<S: AsRef<str>>(&self, prefix: &[S]) -> bool {
        self.segments.len() >= prefix.len()
            && self
                .segments
                .iter()
                .zip(prefix)
                .all(|(s, p)| s == p.as_ref())
    }

    /// Returns a copy of this URL without its first `n` segments, and without its first query
    /// parameter if `skip_first_query_parameter` is true.
    pub fn remainder(&self, n: usize, skip_first_query_parameter: bool) -> Url {
        let skip_query = usize::from(skip_first_query_parameter && !self.query_parameters.is_empty());
        Url {
            segments: self.segments.iter().skip(n).cloned().collect(),
            query_parameters: self.query_parameters[skip_query..].to_vec(),
        }
    }
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("/")?;
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", utf8_percent_encode(segment, SEGMENT))?;
        }

        for (i, p) in self.query_parameters.iter().enumerate() {
            f.write_str(if i == 0 { "?" } else { "&" })?;
            write!(f, "{}", utf8_percent_encode(&p.name, QUERY))?;
            if !p.value.is_empty() {
                write!(f, "={}", utf8_percent_encode(&p.value, QUERY))?;
            }
        }

        Ok(())
    }
}

impl FromStr for Url {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}
