//! Maps request URLs to request handlers, and request handlers back to URLs, for a server-side
//! component framework with stateful pages.
//!
//! A request URL is decoded by a chain of [`RequestMapper`]s into a [`RequestHandler`]: render an
//! existing page, create a bookmarkable page, invoke a listener on a component of a page, serve a
//! resource, replay a buffered response, or redirect. The same mappers encode handlers as URLs, and
//! every URL that a mapper produces decodes back to an equivalent handler.
//!
//! A [`RequestCycle`] runs the handler of one request. Pages are found through a [`PageManager`];
//! [`PersistentPageManager`] keeps them in a [`trellis_pagestore::DataStore`].
//!
//! # URL forms
//!
//! ```text
//! /                                         home page
//! /users/42?x=1                             page mounted at /users/${id}
//! /users/42?5-1.ILinkListener-form-save     listener on page 5, mounted
//! /trellis/bookmarkable/com.example.Help    registered page class, not mounted
//! /trellis/page?5                           page instance 5
//! /trellis/resource/widgets/$up$/style.css  resource ../style.css of scope widgets
//! ```

#![forbid(unused_must_use)]
#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::collapsible_if)]

mod cycle;
mod handler;
mod info;
mod listener;
pub mod mapper;
mod page;
mod parameters;
mod request;
mod url;


pub use cycle::{RequestCycle, ResponseOutcome};
pub use handler::{BufferedResponse, RedirectPolicy, RequestHandler, ResourceReference};
pub use info::{decode_component_path, encode_component_path, ComponentInfo, PageComponentInfo};
pub use listener::{ListenerInterface, ListenerInterfaceRequestHandler, ListenerInvocationError};
pub use mapper::{MapperContext, RequestMapper, SystemMapper};
pub use page::{
    Behavior, PageClass, PageFactory, PageManager, PageProvider, PageResolutionError,
    PageSerializer, PersistentPageManager, RequestableComponent, RequestablePage, ResolvedPage,
};
pub use parameters::{
    DefaultPageParametersEncoder, NamedParameter, PageParameters, PageParametersEncoder,
    PathPageParametersEncoder,
};
pub use request::{Request, AJAX_HEADER, PAGE_ID_HEADER, PAGE_ID_PARAMETER};
pub use url::{QueryParameter, Url};
