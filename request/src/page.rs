//! The narrow view of pages and components that request handling needs, and the resolution of
//! page references to page instances.
//!
//! Component trees, markup and rendering live outside this crate. They are reached only through
//! [`RequestablePage`], [`RequestableComponent`], [`Behavior`], [`PageFactory`] and
//! [`PageSerializer`].

use crate::cycle::RequestCycle;
use crate::listener::ListenerInterface;
use crate::parameters::PageParameters;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};
use trellis_pagestore::DataStore;

/// Identifies a kind of page. Bookmarkable URLs name page classes.
#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PageClass(Arc<str>);

impl PageClass {
    /// Creates a page class from its name.
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    /// The name of the page class.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PageClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl From<&str> for PageClass {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A page instance, as seen by request handling.
///
/// Pages are shared between the page manager and the handlers of a request, so all methods take
/// `&self`.
pub trait RequestablePage: Send + Sync {
    /// The id of this page within its session.
    fn page_id(&self) -> u32;

    /// The class of this page.
    fn page_class(&self) -> PageClass;

    /// The parameters the page was created with.
    fn page_parameters(&self) -> PageParameters;

    /// The number of times this page has been rendered.
    fn render_count(&self) -> u32;

    /// Stateless pages are not stored, and their URLs carry no page id.
    fn is_stateless(&self) -> bool {
        false
    }

    /// Indicates whether the page was created from a bookmarkable URL, rather than by
    /// application code.
    fn was_created_bookmarkable(&self) -> bool;

    /// Enables or disables page id changes (new page versions). Returns the previous setting.
    fn set_freeze_page_id(&self, freeze: bool) -> bool;

    /// Finds a component by its `:`-separated path, relative to the page.
    fn get_component(&self, path: &str) -> Option<Arc<dyn RequestableComponent>>;

    /// Gives serializers access to the concrete page type.
    fn as_any(&self) -> &dyn Any;
}

/// A component within a page.
pub trait RequestableComponent: Send + Sync {
    /// The `:`-separated path of this component, relative to its page.
    fn page_relative_path(&self) -> String;

    /// The id of the page this component belongs to, or `None` if the component has been removed
    /// from its page.
    fn page_id(&self) -> Option<u32>;

    /// The behaviors attached to this component, in order. Listener URLs address behaviors by
    /// their index in this list.
    fn behaviors(&self) -> Vec<Arc<dyn Behavior>>;

    /// Invokes a listener on this component.
    fn invoke_listener(
        &self,
        listener_interface: &ListenerInterface,
        cycle: &RequestCycle<'_>,
    ) -> anyhow::Result<()>;
}

/// A behavior attached to a component. Behaviors can receive listener calls of their own.
pub trait Behavior: Send + Sync {
    /// Invokes a listener on this behavior.
    fn invoke_listener(
        &self,
        component: &dyn RequestableComponent,
        listener_interface: &ListenerInterface,
        cycle: &RequestCycle<'_>,
    ) -> anyhow::Result<()>;
}

/// Creates page instances.
pub trait PageFactory: Send + Sync {
    /// Creates a new instance of a page class.
    fn new_page(
        &self,
        page_class: &PageClass,
        parameters: &PageParameters,
    ) -> anyhow::Result<Arc<dyn RequestablePage>>;
}

/// Converts pages to bytes and back.
pub trait PageSerializer: Send + Sync {
    /// Serializes a page. Returns `None` if the page cannot be serialized.
    fn serialize(&self, page: &dyn RequestablePage) -> Option<Vec<u8>>;

    /// Deserializes a page.
    fn deserialize(&self, data: &[u8]) -> anyhow::Result<Arc<dyn RequestablePage>>;
}

/// Keeps the pages of one session.
pub trait PageManager: Send + Sync {
    /// Finds a page by id.
    fn get_page(&self, page_id: u32) -> Option<Arc<dyn RequestablePage>>;

    /// Marks a page as used by the current request, so that it is stored by [`Self::commit`].
    fn touch_page(&self, page: &Arc<dyn RequestablePage>);

    /// Stores the pages touched during the current request. Called at the end of every request.
    fn commit(&self);

    /// Forgets all pages of the session.
    fn clear(&self);
}

/// A [`PageManager`] that stores pages in a [`DataStore`].
pub struct PersistentPageManager {
    session_id: String,
    store: Arc<dyn DataStore>,
    serializer: Arc<dyn PageSerializer>,
    touched: Mutex<Vec<Arc<dyn RequestablePage>>>,
}

impl PersistentPageManager {
    /// Creates a page manager for a session.
    pub fn new(
        session_id: &str,
        store: Arc<dyn DataStore>,
        serializer: Arc<dyn PageSerializer>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            store,
            serializer,
            touched: Mutex::new(Vec::new()),
        }
    }

    fn lock_touched(&self) -> MutexGuard<'_, Vec<Arc<dyn RequestablePage>>> {
        self.touched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The session whose pages this manager keeps.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl PageManager for PersistentPageManager {
    fn get_page(&self, page_id: u32) -> Option<Arc<dyn RequestablePage>> {
        if let Some(page) = self
            .lock_touched()
            .iter()
            .find(|p| p.page_id() == page_id)
        {
            return Some(page.clone());
        }

        let data = self.store.get_data(&self.session_id, page_id)?;
        match self.serializer.deserialize(&data) {
            Ok(page) => Some(page),
            Err(e) => {
                warn!(session = %self.session_id, page_id, "failed to deserialize page: {e:#}");
                None
            }
        }
    }

    fn touch_page(&self, page: &Arc<dyn RequestablePage>) {
        let mut touched = self.lock_touched();
        let page_id = page.page_id();
        touched.retain(|p| p.page_id() != page_id);
        touched.push(page.clone());
    }

    fn commit(&self) {
        let touched = std::mem::take(&mut *self.lock_touched());
        for page in touched {
            if page.is_stateless() {
                continue;
            }
            let page_id = page.page_id();
            match self.serializer.serialize(&*page) {
                Some(data) => {
                    trace!(session = %self.session_id, page_id, size = data.len(), "storing page");
                    self.store.store_data(&self.session_id, page_id, &data);
                }
                None => warn!(session = %self.session_id, page_id, "page could not be serialized"),
            }
        }
    }

    fn clear(&self) {
        debug!(session = %self.session_id, "clearing pages");
        self.lock_touched().clear();
        self.store.remove_session(&self.session_id);
    }
}

/// Why a page reference could not be resolved to a page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PageResolutionError {
    /// The page is gone, and there is not enough information to re-create it.
    Expired {
        /// The id of the missing page.
        page_id: u32,
    },

    /// The page exists, but it has been rendered again since the URL was generated.
    Stale {
        /// The id of the page.
        page_id: u32,
        /// The render count encoded in the URL.
        expected_render_count: u32,
        /// The current render count of the page.
        render_count: u32,
    },
}

impl fmt::Display for PageResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Expired { page_id } => write!(f, "Page with id {page_id} has expired."),
            Self::Stale {
                page_id,
                expected_render_count,
                render_count,
            } => write!(
                f,
                "A request to page {page_id} has been made with stale render count \
                 {expected_render_count}; the page has been rendered {render_count} times."
            ),
        }
    }
}

impl std::error::Error for PageResolutionError {}

/// A page that was resolved from a [`PageProvider`].
#[derive(Clone)]
pub struct ResolvedPage {
    /// The page.
    pub page: Arc<dyn RequestablePage>,
    /// True if the page was created during resolution, rather than found.
    pub created: bool,
}

/// Refers to a page: either a live page instance, or a description of a page that is resolved
/// when the request is handled.
#[derive(Clone)]
pub struct PageProvider {
    page_id: Option<u32>,
    page_class: Option<PageClass>,
    page_parameters: PageParameters,
    render_count: Option<u32>,
    page: Option<Arc<dyn RequestablePage>>,
}

impl PageProvider {
    /// Refers to a live page instance.
    pub fn of_page(page: Arc<dyn RequestablePage>) -> Self {
        Self {
            page_id: Some(page.page_id()),
            page_class: Some(page.page_class()),
            page_parameters: page.page_parameters(),
            render_count: None,
            page: Some(page),
        }
    }

    /// Describes a page that is resolved later. With a page id, the page is looked up; without
    /// one, a new page of `page_class` is created.
    pub fn new(
        page_id: Option<u32>,
        page_class: Option<PageClass>,
        page_parameters: PageParameters,
        render_count: Option<u32>,
    ) -> Self {
        Self {
            page_id,
            page_class,
            page_parameters,
            render_count,
            page: None,
        }
    }

    /// Describes a new page of `page_class`.
    pub fn of_class(page_class: PageClass, page_parameters: PageParameters) -> Self {
        Self::new(None, Some(page_class), page_parameters, None)
    }

    /// The page id, if known.
    pub fn page_id(&self) -> Option<u32> {
        self.page_id
    }

    /// The page class, if known.
    pub fn page_class(&self) -> Option<&PageClass> {
        self.page_class.as_ref()
    }

    /// The page parameters.
    pub fn page_parameters(&self) -> &PageParameters {
        &self.page_parameters
    }

    /// The render count that the page is expected to have, or the current render count of a live
    /// instance.
    pub fn render_count(&self) -> Option<u32> {
        self.render_count
            .or_else(|| self.page.as_ref().map(|p| p.render_count()))
    }

    /// The live page instance, if this provider was created from one.
    pub fn page_instance(&self) -> Option<&Arc<dyn RequestablePage>> {
        self.page.as_ref()
    }

    /// Indicates whether resolving this provider creates a new page.
    pub fn is_new_page_instance(&self) -> bool {
        self.page.is_none() && self.page_id.is_none()
    }

    /// Indicates whether the page is stateless. Only known for live instances.
    pub fn is_stateless(&self) -> bool {
        self.page.as_ref().is_some_and(|p| p.is_stateless())
    }

    /// Indicates whether the page was created from a bookmarkable URL. A description that names
    /// a page class came from a bookmarkable URL.
    pub fn was_created_bookmarkable(&self) -> bool {
        match &self.page {
            Some(page) => page.was_created_bookmarkable(),
            None => self.page_class.is_some(),
        }
    }

    /// Finds or creates the page.
    ///
    /// * A live instance resolves to itself.
    /// * A page id is looked up in `pages`. A page of a different class than the one described is
    ///   treated as missing. A missing page is re-created if its class is known; otherwise
    ///   resolution fails with [`PageResolutionError::Expired`]. A page whose render count
    ///   differs from the described one fails with [`PageResolutionError::Stale`].
    /// * Without a page id, a new page is created.
    pub fn resolve(
        &self,
        pages: &dyn PageManager,
        factory: &dyn PageFactory,
    ) -> anyhow::Result<ResolvedPage> {
        if let Some(page) = &self.page {
            return Ok(ResolvedPage {
                page: page.clone(),
                created: false,
            });
        }

        if let Some(page_id) = self.page_id {
            let found = pages.get_page(page_id).filter(|page| match &self.page_class {
                Some(class) => page.page_class() == *class,
                None => true,
            });

            if let Some(page) = found {
                if let Some(expected_render_count) = self.render_count {
                    let render_count = page.render_count();
                    if render_count != expected_render_count {
                        return Err(PageResolutionError::Stale {
                            page_id,
                            expected_render_count,
                            render_count,
                        }
                        .into());
                    }
                }
                return Ok(ResolvedPage {
                    page,
                    created: false,
                });
            }

            if self.page_class.is_none() {
                return Err(PageResolutionError::Expired { page_id }.into());
            }

            debug!(page_id, "page is gone; creating a new instance");
        }

        let Some(class) = &self.page_class else {
            anyhow::bail!("A page provider must have a page id, a page class, or a page instance.");
        };

        let page = factory.new_page(class, &self.page_parameters)?;
        Ok(ResolvedPage {
            page,
            created: true,
        })
    }
}

impl fmt::Debug for PageProvider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PageProvider")
            .field("page_id", &self.page_id)
            .field("page_class", &self.page_class)
            .field("page_parameters", &self.page_parameters)
            .field("render_count", &self.render_count)
            .field("has_instance", &self.page.is_some())
            .finish()
    }
}

impl PartialEq for PageProvider {
    fn eq(&self, other: &Self) -> bool {
        let same_instance = match (&self.page, &other.page) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_instance
            && self.page_id == other.page_id
            && self.page_class == other.page_class
            && self.page_parameters == other.page_parameters
            && self.render_count == other.render_count
    }
}
