//! Processing of one request, from URL to response outcome.

use crate::handler::{BufferedResponse, RedirectPolicy, RequestHandler, ResourceReference};
use crate::mapper::RequestMapper;
use crate::page::{PageClass, PageFactory, PageManager, PageResolutionError};
use crate::parameters::PageParameters;
use crate::request::Request;
use crate::url::Url;
use std::cell::RefCell;
use std::collections::VecDeque;
use tracing::{debug, debug_span, warn};

/// What the response to a request consists of. Producing the actual bytes (markup, resources) is
/// up to the caller.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseOutcome {
    /// A page was rendered.
    RenderedPage {
        /// The id of the page.
        page_id: u32,
        /// The class of the page.
        page_class: PageClass,
        /// Whether the browser is redirected to the page's URL first.
        redirect_policy: RedirectPolicy,
    },

    /// A listener was invoked, and produced the response itself.
    ListenerInvoked {
        /// The id of the page that contains the component.
        page_id: u32,
        /// The path of the component.
        component_path: String,
    },

    /// The browser is redirected.
    Redirect(Url),

    /// A static resource is served.
    Resource {
        /// The resource.
        reference: ResourceReference,
        /// Parameters for the resource.
        parameters: PageParameters,
    },

    /// A buffered response is replayed.
    Buffered(BufferedResponse),

    /// The page that the request refers to no longer exists.
    PageExpired {
        /// The id of the missing page.
        page_id: u32,
    },

    /// No mapper recognized the URL.
    NotFound,
}

/// Processes one request.
///
/// Handlers may schedule further handlers to run after the current one. The page manager is
/// committed when processing ends, whether or not it succeeded.
pub struct RequestCycle<'a> {
    request: Request,
    mapper: &'a dyn RequestMapper,
    page_manager: &'a dyn PageManager,
    page_factory: &'a dyn PageFactory,
    scheduled: RefCell<VecDeque<RequestHandler>>,
}

impl<'a> RequestCycle<'a> {
    /// Creates a request cycle.
    pub fn new(
        request: Request,
        mapper: &'a dyn RequestMapper,
        page_manager: &'a dyn PageManager,
        page_factory: &'a dyn PageFactory,
    ) -> Self {
        Self {
            request,
            mapper,
            page_manager,
            page_factory,
            scheduled: RefCell::new(VecDeque::new()),
        }
    }

    /// The request being processed.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The page manager of the session.
    pub fn page_manager(&self) -> &dyn PageManager {
        self.page_manager
    }

    /// Creates new pages.
    pub fn page_factory(&self) -> &dyn PageFactory {
        self.page_factory
    }

    /// Runs `handler` after the current handler has finished.
    pub fn schedule_request_handler_after_current(&self, handler: RequestHandler) {
        self.scheduled.borrow_mut().push_back(handler);
    }

    /// Encodes a handler as a URL, using the root mapper.
    pub fn url_for(&self, handler: &RequestHandler) -> Option<Url> {
        self.mapper.map_handler(handler)
    }

    /// Maps the request to a handler, runs it and any handlers it schedules, and commits the page
    /// manager.
    ///
    /// Expired pages produce [`ResponseOutcome::PageExpired`]. A listener URL with a stale render
    /// count renders the current version of the page instead of invoking the listener. Other
    /// errors, including [`crate::ListenerInvocationError`], abort the request.
    pub fn process(&self) -> anyhow::Result<ResponseOutcome> {
        let _span = debug_span!("process", url = %self.request.url()).entered();
        let result = self.process_handlers();
        self.page_manager.commit();
        result
    }

    fn process_handlers(&self) -> anyhow::Result<ResponseOutcome> {
        let Some(handler) = self.mapper.map_request(&self.request) else {
            debug!("no mapper matched the request");
            return Ok(ResponseOutcome::NotFound);
        };

        let mut outcome = self.respond(&handler)?;

        loop {
            let next = self.scheduled.borrow_mut().pop_front();
            let Some(next) = next else {
                break;
            };
            outcome = self.respond(&next)?;
        }

        Ok(outcome)
    }

    fn respond(&self, handler: &RequestHandler) -> anyhow::Result<ResponseOutcome> {
        let e = match handler.respond(self) {
            Ok(outcome) => return Ok(outcome),
            Err(e) => e,
        };

        match e.downcast_ref::<PageResolutionError>() {
            Some(&PageResolutionError::Expired { page_id }) => {
                debug!(page_id, "page expired");
                self.scheduled.borrow_mut().clear();
                Ok(ResponseOutcome::PageExpired { page_id })
            }

            Some(&PageResolutionError::Stale { page_id, .. }) => {
                warn!(page_id, "{e}");
                self.scheduled.borrow_mut().clear();
                match self.page_manager.get_page(page_id) {
                    Some(page) => {
                        RequestHandler::render_page(page, RedirectPolicy::AutoRedirect)
                            .respond(self)
                    }
                    None => Ok(ResponseOutcome::PageExpired { page_id }),
                }
            }

            None => Err(e),
        }
    }
}
