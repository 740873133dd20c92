//! Request mappers translate between URLs and [`RequestHandler`]s.
//!
//! Several mappers usually compete for a URL. Each mapper rates how well it matches a request with
//! a _compatibility score_ that only looks at the URL's structure. [`CompoundRequestMapper`] asks
//! the mappers in order of decreasing score, and the first mapper that decodes the request wins.
//! Mappers with equal scores are asked in order of precedence: the mapper added last comes first.
//!
//! Encoding goes the other way. A handler is encoded by the first mapper, in order of precedence,
//! that produces a URL for it.

use crate::handler::{RedirectPolicy, RequestHandler};
use crate::info::{ComponentInfo, PageComponentInfo};
use crate::listener::{ListenerInterface, ListenerInterfaceRequestHandler};
use crate::page::{PageClass, PageProvider};
use crate::parameters::{PageParameters, PageParametersEncoder};
use crate::request::Request;
use crate::url::{QueryParameter, Url};
use std::collections::HashSet;
use tracing::trace;

mod bookmarkable;
mod buffered;
mod compound;
mod home;
mod mounted;
mod page_instance;
mod resource;
mod system;

pub use bookmarkable::BookmarkableMapper;
pub use buffered::BufferedResponseMapper;
pub use compound::CompoundRequestMapper;
pub use home::HomePageMapper;
pub use mounted::MountedMapper;
pub use page_instance::PageInstanceMapper;
pub use resource::ResourceReferenceMapper;
pub use system::SystemMapper;

/// Translates between URLs and request handlers.
pub trait RequestMapper: Send + Sync {
    /// Decodes a request. Returns `None` if this mapper does not recognize the request.
    fn map_request(&self, request: &Request) -> Option<RequestHandler>;

    /// Rates how well this mapper matches the request. Higher is better. Only the structure of the
    /// URL is considered; scoring has no side effects.
    fn compatibility_score(&self, request: &Request) -> i32;

    /// Encodes a handler. Returns `None` if this mapper cannot encode the handler.
    fn map_handler(&self, handler: &RequestHandler) -> Option<Url>;
}

/// Configuration shared by the mappers of an application.
#[derive(Clone, Debug)]
pub struct MapperContext {
    namespace: String,
    page_identifier: String,
    bookmarkable_identifier: String,
    resource_identifier: String,
    parent_folder_placeholder: String,
    home_page_class: PageClass,
    page_classes: HashSet<PageClass>,
    listener_interfaces: Vec<ListenerInterface>,
}

impl MapperContext {
    /// Creates a context with the default identifiers. The home page class is registered, and so
    /// are the built-in listener interfaces.
    pub fn new(home_page_class: PageClass) -> Self {
        let mut page_classes = HashSet::new();
        page_classes.insert(home_page_class.clone());
        Self {
            namespace: "trellis".to_string(),
            page_identifier: "page".to_string(),
            bookmarkable_identifier: "bookmarkable".to_string(),
            resource_identifier: "resource".to_string(),
            parent_folder_placeholder: "$up$".to_string(),
            home_page_class,
            page_classes,
            listener_interfaces: ListenerInterface::BUILTIN.to_vec(),
        }
    }

    /// Sets the first segment of the URLs that the framework itself generates.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Sets the segment that identifies page instance URLs.
    pub fn with_page_identifier(mut self, identifier: &str) -> Self {
        self.page_identifier = identifier.to_string();
        self
    }

    /// Sets the segment that identifies bookmarkable page URLs.
    pub fn with_bookmarkable_identifier(mut self, identifier: &str) -> Self {
        self.bookmarkable_identifier = identifier.to_string();
        self
    }

    /// Sets the segment that identifies resource URLs.
    pub fn with_resource_identifier(mut self, identifier: &str) -> Self {
        self.resource_identifier = identifier.to_string();
        self
    }

    /// Sets the segment that stands for `..` in resource names.
    pub fn with_parent_folder_placeholder(mut self, placeholder: &str) -> Self {
        self.parent_folder_placeholder = placeholder.to_string();
        self
    }

    /// Allows a page class to be created from bookmarkable URLs.
    pub fn register_page_class(mut self, page_class: PageClass) -> Self {
        self.page_classes.insert(page_class);
        self
    }

    /// Makes a listener interface available to listener URLs. Replaces any interface that has the
    /// same name.
    pub fn register_listener_interface(mut self, listener_interface: ListenerInterface) -> Self {
        self.listener_interfaces
            .retain(|li| li.name() != listener_interface.name());
        self.listener_interfaces.push(listener_interface);
        self
    }

    /// The first segment of framework URLs.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The segment that identifies page instance URLs.
    pub fn page_identifier(&self) -> &str {
        &self.page_identifier
    }

    /// The segment that identifies bookmarkable page URLs.
    pub fn bookmarkable_identifier(&self) -> &str {
        &self.bookmarkable_identifier
    }

    /// The segment that identifies resource URLs.
    pub fn resource_identifier(&self) -> &str {
        &self.resource_identifier
    }

    /// The segment that stands for `..` in resource names.
    pub fn parent_folder_placeholder(&self) -> &str {
        &self.parent_folder_placeholder
    }

    /// The class of the home page.
    pub fn home_page_class(&self) -> &PageClass {
        &self.home_page_class
    }

    /// Indicates whether a page class may be created from bookmarkable URLs.
    pub fn is_page_class_registered(&self, page_class: &PageClass) -> bool {
        self.page_classes.contains(page_class)
    }

    /// Finds a page class by name.
    pub fn page_class(&self, name: &str) -> Option<&PageClass> {
        self.page_classes.iter().find(|c| c.name() == name)
    }

    /// Finds a listener interface by the name used in URLs.
    pub fn listener_interface(&self, name: &str) -> Option<&ListenerInterface> {
        self.listener_interfaces.iter().find(|li| li.name() == name)
    }
}

/// A URL that has been decoded into a page class, page parameters and, optionally, page and
/// component information. Mappers of bookmarkable pages differ only in how they produce and
/// consume this.
#[derive(Clone, Debug)]
struct UrlInfo {
    info: Option<PageComponentInfo>,
    page_class: PageClass,
    parameters: PageParameters,
}

/// Decodes the parameters that follow a mapper's first `num_segments` segments. The first query
/// parameter is skipped when it carries a [`PageComponentInfo`].
fn extract_page_parameters(
    url: &Url,
    num_segments: usize,
    encoder: &dyn PageParametersEncoder,
) -> PageParameters {
    let has_info = PageComponentInfo::from_first_query_parameter(url).is_some();
    encoder.decode_page_parameters(&url.remainder(num_segments, has_info))
}

/// Appends the page component info (as the first query parameter) and the encoded parameters to
/// a mapper's own segments.
///
/// Without an info, the first query parameter must not read back as one. A named parameter that
/// would is moved behind the first parameter that would not. If every named parameter looks like
/// an info, the URL decodes as a page instance URL.
fn encode_url_info_parameters(
    mut url: Url,
    info: Option<&PageComponentInfo>,
    parameters: &PageParameters,
    encoder: &dyn PageParametersEncoder,
) -> Url {
    let mut has_info = false;
    if let Some(info) = info {
        let s = info.to_string();
        if !s.is_empty() {
            url.push_query_parameter(s, "");
            has_info = true;
        }
    }

    let mut encoded = encoder.encode_page_parameters(parameters);
    if !has_info && url.query_parameters().is_empty() {
        let looks_like_info = |p: &QueryParameter| {
            p.value.is_empty() && PageComponentInfo::parse(&p.name).is_some()
        };
        let query = encoded.query_parameters();
        if query.first().is_some_and(looks_like_info) {
            match query.iter().position(|p| !looks_like_info(p)) {
                Some(i) => encoded.move_query_parameter_to_front(i),
                None => trace!(
                    url = %encoded,
                    "every named parameter reads as a page component info"
                ),
            }
        }
    }

    url.append(encoded);
    url
}

/// Converts decoded URL information to a handler.
///
/// * no page info: a new bookmarkable page
/// * a page id without a component: the existing page, or a new one if it has expired
/// * a component: a listener invocation
fn handler_for_url_info(context: &MapperContext, url_info: UrlInfo) -> Option<RequestHandler> {
    let UrlInfo {
        info,
        page_class,
        parameters,
    } = url_info;

    let Some(info) = info else {
        return Some(RequestHandler::BookmarkablePage {
            page_class,
            parameters,
        });
    };

    match info.component_info {
        None => Some(RequestHandler::RenderPage {
            page: PageProvider::new(info.page_id, Some(page_class), parameters, None),
            redirect_policy: RedirectPolicy::AutoRedirect,
        }),

        Some(c) => {
            let Some(listener_interface) = context.listener_interface(&c.listener_interface) else {
                trace!(name = %c.listener_interface, "unknown listener interface");
                return None;
            };
            let page = PageProvider::new(info.page_id, Some(page_class), parameters, c.render_count);
            Some(RequestHandler::ListenerInterface(
                ListenerInterfaceRequestHandler::new(
                    page,
                    c.component_path,
                    listener_interface.clone(),
                    c.behavior_index,
                ),
            ))
        }
    }
}

/// Converts a handler to URL information, if its page class is accepted.
///
/// When `must_have_been_created_bookmarkable` is set, pages that application code created are not
/// encoded; their URLs cannot re-create them.
fn url_info_for_handler(
    handler: &RequestHandler,
    accepts: impl Fn(&PageClass) -> bool,
    must_have_been_created_bookmarkable: bool,
) -> Option<UrlInfo> {
    let accepts_page = |page: &PageProvider| -> Option<PageClass> {
        let page_class = page.page_class()?;
        if !accepts(page_class) {
            return None;
        }
        if must_have_been_created_bookmarkable && !page.was_created_bookmarkable() {
            return None;
        }
        Some(page_class.clone())
    };

    match handler {
        RequestHandler::BookmarkablePage {
            page_class,
            parameters,
        } if accepts(page_class) => Some(UrlInfo {
            info: None,
            page_class: page_class.clone(),
            parameters: parameters.clone(),
        }),

        RequestHandler::RenderPage { page, .. } => {
            let page_class = accepts_page(page)?;
            let info = if page.is_stateless() {
                None
            } else {
                page.page_id().map(PageComponentInfo::page)
            };
            Some(UrlInfo {
                info,
                page_class,
                parameters: page.page_parameters().clone(),
            })
        }

        RequestHandler::ListenerInterface(handler) => {
            let page = handler.page();
            let page_class = accepts_page(page)?;
            let page_id = if page.is_stateless() {
                None
            } else {
                page.page_id()
            };
            Some(UrlInfo {
                info: Some(PageComponentInfo {
                    page_id,
                    component_info: Some(component_info_for(handler)),
                }),
                page_class,
                parameters: page.page_parameters().clone(),
            })
        }

        _ => None,
    }
}

fn component_info_for(handler: &ListenerInterfaceRequestHandler) -> ComponentInfo {
    ComponentInfo {
        render_count: handler.page().render_count(),
        listener_interface: handler.listener_interface().name().to_string(),
        component_path: handler.component_path().to_string(),
        behavior_index: handler.behavior_index(),
    }
}
