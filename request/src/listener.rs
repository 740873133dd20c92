//! Invocation of listeners on components and behaviors of stateful pages.

use crate::cycle::{RequestCycle, ResponseOutcome};
use crate::handler::{RedirectPolicy, RequestHandler};
use crate::page::{PageProvider, RequestableComponent, RequestablePage};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, debug_span};

/// Describes a kind of listener that a URL can invoke on a component.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ListenerInterface {
    name: Cow<'static, str>,
    render_page_after_invocation: bool,
}

impl ListenerInterface {
    /// Links. The page is rendered after the link is followed.
    pub const LINK: Self = Self::builtin("ILinkListener", true);

    /// Form submission. The page is rendered after the form is submitted.
    pub const FORM_SUBMIT: Self = Self::builtin("IFormSubmitListener", true);

    /// Calls to behaviors, typically from AJAX requests. The behavior produces the response.
    pub const BEHAVIOR: Self = Self::builtin("IBehaviorListener", false);

    /// Resources produced by a component. The component produces the response.
    pub const RESOURCE: Self = Self::builtin("IResourceListener", false);

    /// The listener interfaces that every mapper context knows.
    pub const BUILTIN: [Self; 4] = [Self::LINK, Self::FORM_SUBMIT, Self::BEHAVIOR, Self::RESOURCE];

    const fn builtin(name: &'static str, render_page_after_invocation: bool) -> Self {
        Self {
            name: Cow::Borrowed(name),
            render_page_after_invocation,
        }
    }

    /// Describes a listener interface. The name appears in URLs; it must start with an ASCII
    /// letter and contain only ASCII letters, digits and `_`.
    pub fn new(name: impl Into<String>, render_page_after_invocation: bool) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            render_page_after_invocation,
        }
    }

    /// The name of this interface, as it appears in URLs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Indicates whether the page is rendered after the listener has been invoked, for requests
    /// that are not AJAX requests.
    pub fn render_page_after_invocation(&self) -> bool {
        self.render_page_after_invocation
    }
}

/// A listener request that cannot be carried out because the page no longer matches the URL.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ListenerInvocationError {
    /// The page has no component at the path.
    ComponentNotFound {
        /// The page that was searched.
        page_id: u32,
        /// The component path.
        component_path: String,
    },

    /// The component at the path no longer belongs to the page.
    ComponentRemoved {
        /// The page that was searched.
        page_id: u32,
        /// The component path.
        component_path: String,
    },

    /// The component has no behavior at the index.
    BehaviorNotFound {
        /// The component path.
        component_path: String,
        /// The behavior index from the URL.
        behavior_index: usize,
        /// The number of behaviors the component has.
        num_behaviors: usize,
    },
}

impl fmt::Display for ListenerInvocationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ComponentNotFound {
                page_id,
                component_path,
            } => write!(
                f,
                "Component '{component_path}' was not found on page {page_id}."
            ),
            Self::ComponentRemoved {
                page_id,
                component_path,
            } => write!(
                f,
                "Component '{component_path}' has been removed from page {page_id}."
            ),
            Self::BehaviorNotFound {
                component_path,
                behavior_index,
                num_behaviors,
            } => write!(
                f,
                "Couldn't find component behavior. Component '{component_path}' has \
                 {num_behaviors} behaviors; the request named behavior {behavior_index}."
            ),
        }
    }
}

impl std::error::Error for ListenerInvocationError {}

/// Disables page id changes while it is alive, and restores the previous setting when it is
/// dropped, including during unwinding.
struct FreezePageId<'a> {
    page: &'a dyn RequestablePage,
    previous: bool,
}

impl<'a> FreezePageId<'a> {
    fn new(page: &'a dyn RequestablePage) -> Self {
        let previous = page.set_freeze_page_id(true);
        Self { page, previous }
    }
}

impl<'a> Drop for FreezePageId<'a> {
    fn drop(&mut self) {
        self.page.set_freeze_page_id(self.previous);
    }
}

/// Invokes a listener on a component, or on one of the component's behaviors.
#[derive(Clone, Debug, PartialEq)]
pub struct ListenerInterfaceRequestHandler {
    page: PageProvider,
    component_path: String,
    listener_interface: ListenerInterface,
    behavior_index: Option<usize>,
}

impl ListenerInterfaceRequestHandler {
    /// Creates a handler. `component_path` is `:`-separated and relative to the page.
    pub fn new(
        page: PageProvider,
        component_path: impl Into<String>,
        listener_interface: ListenerInterface,
        behavior_index: Option<usize>,
    ) -> Self {
        Self {
            page,
            component_path: component_path.into(),
            listener_interface,
            behavior_index,
        }
    }

    /// The page that contains the component.
    pub fn page(&self) -> &PageProvider {
        &self.page
    }

    /// The path of the component.
    pub fn component_path(&self) -> &str {
        &self.component_path
    }

    /// The listener interface to invoke.
    pub fn listener_interface(&self) -> &ListenerInterface {
        &self.listener_interface
    }

    /// The index of the behavior to invoke, if the listener is invoked on a behavior.
    pub fn behavior_index(&self) -> Option<usize> {
        self.behavior_index
    }

    /// Invokes the listener.
    pub fn respond(&self, cycle: &RequestCycle<'_>) -> anyhow::Result<ResponseOutcome> {
        let _span = debug_span!(
            "listener",
            path = %self.component_path,
            interface = %self.listener_interface.name()
        )
        .entered();

        let resolved = self.page.resolve(cycle.page_manager(), cycle.page_factory())?;
        let page = resolved.page;
        let page_id = page.page_id();

        if resolved.created && self.page.page_id().is_some() {
            // The page expired and was re-created from its class. Listeners never run on a
            // re-created page.
            debug!(page_id, "page was re-created; rendering it instead of invoking the listener");
            let render = RequestHandler::RenderPage {
                page: PageProvider::of_page(page),
                redirect_policy: RedirectPolicy::AutoRedirect,
            };
            return render.respond(cycle);
        }

        let Some(component) = page.get_component(&self.component_path) else {
            return Err(ListenerInvocationError::ComponentNotFound {
                page_id,
                component_path: self.component_path.clone(),
            }
            .into());
        };

        if component.page_id() != Some(page_id) {
            return Err(ListenerInvocationError::ComponentRemoved {
                page_id,
                component_path: self.component_path.clone(),
            }
            .into());
        }

        let is_ajax = cycle.request().is_ajax();

        if !is_ajax && self.listener_interface.render_page_after_invocation() {
            let redirect_policy = if page.is_stateless() {
                RedirectPolicy::NeverRedirect
            } else {
                RedirectPolicy::AutoRedirect
            };
            cycle.schedule_request_handler_after_current(RequestHandler::RenderPage {
                page: PageProvider::of_page(page.clone()),
                redirect_policy,
            });
        }

        {
            let _freeze = if is_ajax {
                Some(FreezePageId::new(&*page))
            } else {
                None
            };
            self.invoke(&page, &*component, cycle)?;
        }

        cycle.page_manager().touch_page(&page);

        Ok(ResponseOutcome::ListenerInvoked {
            page_id: page.page_id(),
            component_path: self.component_path.clone(),
        })
    }

    fn invoke(
        &self,
        page: &Arc<dyn RequestablePage>,
        component: &dyn RequestableComponent,
        cycle: &RequestCycle<'_>,
    ) -> anyhow::Result<()> {
        let Some(index) = self.behavior_index else {
            debug!(page_id = page.page_id(), "invoking component listener");
            return component.invoke_listener(&self.listener_interface, cycle);
        };

        let behaviors = component.behaviors();
        let Some(behavior) = behaviors.get(index) else {
            return Err(ListenerInvocationError::BehaviorNotFound {
                component_path: self.component_path.clone(),
                behavior_index: index,
                num_behaviors: behaviors.len(),
            }
            .into());
        };

        debug!(page_id = page.page_id(), index, "invoking behavior listener");
        behavior.invoke_listener(component, &self.listener_interface, cycle)
    }
}
