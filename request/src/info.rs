//! The page and component information that page-instance and listener URLs carry.
//!
//! The information is encoded as the name of the first query parameter, with an empty value:
//!
//! ```text
//! /trellis/page?5                          page 5
//! /users/42?5-2.ILinkListener-form-save    page 5, render count 2, listener on form:save
//! /users/42?-IBehaviorListener.1-panel     stateless page, behavior 1 of panel
//! ```
//!
//! Component paths use `:` between component ids. In the URL, ids are separated by `-`. Within an
//! id, `~` escapes the next character, so `-` is written `~-` and `~` is written `~~`.

use crate::request::Request;
use std::fmt;

/// Identifies a listener on a component of a page.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ComponentInfo {
    /// The render count of the page when the URL was rendered.
    pub render_count: Option<u32>,
    /// The name of the listener interface.
    pub listener_interface: String,
    /// The component path, relative to the page, with `:` between ids.
    pub component_path: String,
    /// The index of the behavior of the component that receives the call, if any.
    pub behavior_index: Option<usize>,
}

/// The page id and listener target encoded in a URL.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PageComponentInfo {
    /// The page id. Absent for stateless pages.
    pub page_id: Option<u32>,
    /// The listener target, if the URL invokes a listener.
    pub component_info: Option<ComponentInfo>,
}

impl PageComponentInfo {
    /// Describes a page without a listener target.
    pub fn page(page_id: u32) -> Self {
        Self {
            page_id: Some(page_id),
            component_info: None,
        }
    }

    /// Parses the text form. Returns `None` if `s` is not a valid page component info, which means
    /// that the query parameter is an ordinary parameter.
    pub fn parse(s: &str) -> Option<Self> {
        let (page, component) = match s.split_once('-') {
            Some((page, component)) => (page, Some(component)),
            None => (s, None),
        };

        let page_id = if page.is_empty() {
            None
        } else {
            Some(parse_number(page)?)
        };

        let component_info = match component {
            Some(c) => Some(ComponentInfo::parse(c)?),
            None => None,
        };

        if page_id.is_none() && component_info.is_none() {
            return None;
        }

        Some(Self {
            page_id,
            component_info,
        })
    }

    /// Finds the page component info of a request.
    ///
    /// The info is the name of the first query parameter, when that parameter has an empty value
    /// and its name parses. A page id override carried by the request replaces the decoded page
    /// id.
    pub fn from_request(request: &Request) -> Option<Self> {
        let mut info = Self::from_first_query_parameter(request.url())?;
        if let Some(page_id) = request.page_id_override() {
            info.page_id = Some(page_id);
        }
        Some(info)
    }

    /// Parses the name of the first query parameter of `url`, if its value is empty.
    pub fn from_first_query_parameter(url: &crate::Url) -> Option<Self> {
        let first = url.query_parameters().first()?;
        if !first.value.is_empty() {
            return None;
        }
        Self::parse(&first.name)
    }
}

impl ComponentInfo {
    fn parse(s: &str) -> Option<Self> {
        let (head, path) = s.split_once('-')?;
        if path.is_empty() {
            return None;
        }

        let parts: Vec<&str> = head.split('.').collect();
        let (render_count, listener_interface, behavior_index) = match parts.as_slice() {
            [iface] => (None, *iface, None),
            [a, b] if is_number(a) => (Some(parse_number(a)?), *b, None),
            [iface, b] => (None, *iface, Some(parse_number(b)? as usize)),
            [rc, iface, b] => (
                Some(parse_number(rc)?),
                *iface,
                Some(parse_number(b)? as usize),
            ),
            _ => return None,
        };

        if !is_interface_name(listener_interface) {
            return None;
        }

        Some(Self {
            render_count,
            listener_interface: listener_interface.to_string(),
            component_path: decode_component_path(path)?,
            behavior_index,
        })
    }
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_number(s: &str) -> Option<u32> {
    if is_number(s) {
        s.parse().ok()
    } else {
        None
    }
}

fn is_interface_name(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Converts a `:`-separated component path to its URL form.
pub fn encode_component_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            ':' => out.push('-'),
            '-' => out.push_str("~-"),
            '~' => out.push_str("~~"),
            c => out.push(c),
        }
    }
    out
}

/// Converts the URL form of a component path back to its `:`-separated form. Returns `None` for a
/// dangling escape character.
pub fn decode_component_path(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '~' => out.push(chars.next()?),
            '-' => out.push(':'),
            c => out.push(c),
        }
    }
    Some(out)
}

impl fmt::Display for ComponentInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(rc) = self.render_count {
            write!(f, "{rc}.")?;
        }
        f.write_str(&self.listener_interface)?;
        if let Some(bi) = self.behavior_index {
            write!(f, ".{bi}")?;
        }
        write!(f, "-{}", encode_component_path(&self.component_path))
    }
}

impl fmt::Display for PageComponentInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(page_id) = self.page_id {
            write!(f, "{page_id}")?;
        }
        if let Some(c) = &self.component_info {
            write!(f, "-{c}")?;
        }
        Ok(())
    }
}
