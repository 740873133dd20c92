use super::{component_info_for, MapperContext, RequestMapper};
use crate::handler::{RedirectPolicy, RequestHandler};
use crate::info::PageComponentInfo;
use crate::listener::ListenerInterfaceRequestHandler;
use crate::page::PageProvider;
use crate::parameters::PageParameters;
use crate::request::Request;
use crate::url::Url;
use std::sync::Arc;

/// Decodes and encodes URLs of existing page instances:
///
/// ```text
/// /trellis/page?<page id>
/// /trellis/page?<page id>-<component info>
/// ```
pub struct PageInstanceMapper {
    context: Arc<MapperContext>,
}

impl PageInstanceMapper {
    /// Creates the mapper.
    pub fn new(context: Arc<MapperContext>) -> Self {
        Self { context }
    }

    fn matches_prefix(&self, url: &Url) -> bool {
        url.starts_with(&[self.context.namespace(), self.context.page_identifier()])
    }
}

impl RequestMapper for PageInstanceMapper {
    fn map_request(&self, request: &Request) -> Option<RequestHandler> {
        let url = request.url();
        if !self.matches_prefix(url) || url.segments().len() != 2 {
            return None;
        }

        let info = PageComponentInfo::from_request(request)?;
        let page_id = info.page_id?;

        match info.component_info {
            None => Some(RequestHandler::RenderPage {
                page: PageProvider::new(Some(page_id), None, PageParameters::new(), None),
                redirect_policy: RedirectPolicy::AutoRedirect,
            }),
            Some(c) => {
                let listener_interface = self.context.listener_interface(&c.listener_interface)?;
                let page =
                    PageProvider::new(Some(page_id), None, PageParameters::new(), c.render_count);
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

    fn compatibility_score(&self, request: &Request) -> i32 {
        if self.matches_prefix(request.url()) {
            998
        } else {
            0
        }
    }

    fn map_handler(&self, handler: &RequestHandler) -> Option<Url> {
        let info = match handler {
            RequestHandler::RenderPage { page, .. } if !page.is_stateless() => {
                PageComponentInfo::page(page.page_id()?)
            }
            RequestHandler::ListenerInterface(h) if !h.page().is_stateless() => {
                PageComponentInfo {
                    page_id: Some(h.page().page_id()?),
                    component_info: Some(component_info_for(h)),
                }
            }
            _ => return None,
        };

        let mut url = Url::new();
        url.push_segment(self.context.namespace());
        url.push_segment(self.context.page_identifier());
        url.push_query_parameter(info.to_string(), "");
        Some(url)
    }
}
