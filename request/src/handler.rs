use crate::cycle::{RequestCycle, ResponseOutcome};
use crate::listener::ListenerInterfaceRequestHandler;
use crate::page::{PageClass, PageProvider, RequestablePage};
use crate::parameters::PageParameters;
use crate::url::Url;
use std::sync::Arc;
use tracing::debug;

/// Whether rendering a page redirects the browser to the page's own URL first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RedirectPolicy {
    /// Always redirect, even if the current URL is already the page's URL.
    AlwaysRedirect,
    /// Redirect when the current URL is not the page's URL.
    AutoRedirect,
    /// Render directly to the current response.
    NeverRedirect,
}

/// Identifies a static resource: a scope (usually the name of the component or package that owns
/// the resource) and a `/`-separated name within the scope.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ResourceReference {
    /// The scope that owns the resource.
    pub scope: String,
    /// The name of the resource within its scope. May contain `/` and `..` segments.
    pub name: String,
}

impl ResourceReference {
    /// Creates a resource reference.
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

/// A response that was rendered before a redirect, and is sent when the browser follows the
/// redirect.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BufferedResponse {
    /// The content type of the response.
    pub content_type: String,
    /// The response body.
    pub body: Vec<u8>,
}

/// The decoded intent of a request.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestHandler {
    /// Renders an existing or described page.
    RenderPage {
        /// The page to render.
        page: PageProvider,
        /// Whether to redirect to the page's URL before rendering.
        redirect_policy: RedirectPolicy,
    },

    /// Creates and renders a new page from a bookmarkable URL.
    BookmarkablePage {
        /// The class of the page.
        page_class: PageClass,
        /// The parameters of the new page.
        parameters: PageParameters,
    },

    /// Invokes a listener on a component.
    ListenerInterface(ListenerInterfaceRequestHandler),

    /// Serves a static resource.
    ResourceReference {
        /// The resource.
        reference: ResourceReference,
        /// Parameters for the resource.
        parameters: PageParameters,
    },

    /// Replays a buffered response.
    BufferedResponse {
        /// The URL the response was buffered for.
        url: Url,
        /// The response.
        response: BufferedResponse,
    },

    /// Redirects the browser.
    Redirect(Url),
}

impl RequestHandler {
    /// Renders a live page.
    pub fn render_page(
        page: Arc<dyn RequestablePage>,
        redirect_policy: RedirectPolicy,
    ) -> Self {
        Self::RenderPage {
            page: PageProvider::of_page(page),
            redirect_policy,
        }
    }

    /// Handles the request.
    pub fn respond(&self, cycle: &RequestCycle<'_>) -> anyhow::Result<ResponseOutcome> {
        match self {
            Self::RenderPage {
                page,
                redirect_policy,
            } => {
                let resolved = page.resolve(cycle.page_manager(), cycle.page_factory())?;
                let page = resolved.page;
                cycle.page_manager().touch_page(&page);
                debug!(page_id = page.page_id(), class = %page.page_class(), "rendering page");
                Ok(ResponseOutcome::RenderedPage {
                    page_id: page.page_id(),
                    page_class: page.page_class(),
                    redirect_policy: *redirect_policy,
                })
            }

            Self::BookmarkablePage {
                page_class,
                parameters,
            } => {
                let page = cycle.page_factory().new_page(page_class, parameters)?;
                cycle.page_manager().touch_page(&page);
                debug!(page_id = page.page_id(), class = %page_class, "rendering new bookmarkable page");
                Ok(ResponseOutcome::RenderedPage {
                    page_id: page.page_id(),
                    page_class: page.page_class(),
                    redirect_policy: RedirectPolicy::AutoRedirect,
                })
            }

            Self::ListenerInterface(handler) => handler.respond(cycle),

            Self::ResourceReference {
                reference,
                parameters,
            } => Ok(ResponseOutcome::Resource {
                reference: reference.clone(),
                parameters: parameters.clone(),
            }),

            Self::BufferedResponse { response, .. } => {
                Ok(ResponseOutcome::Buffered(response.clone()))
            }

            Self::Redirect(url) => Ok(ResponseOutcome::Redirect(url.clone())),
        }
    }
}
