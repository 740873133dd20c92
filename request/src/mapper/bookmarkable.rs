use super::{
    encode_url_info_parameters, extract_page_parameters, handler_for_url_info,
    url_info_for_handler, MapperContext, RequestMapper, UrlInfo,
};
use crate::handler::RequestHandler;
use crate::info::PageComponentInfo;
use crate::parameters::{DefaultPageParametersEncoder, PageParametersEncoder};
use crate::request::Request;
use crate::url::Url;
use std::sync::Arc;

/// Decodes and encodes bookmarkable URLs of registered page classes that have not been mounted:
///
/// ```text
/// /trellis/bookmarkable/<page class>[/indexed parameters]?[info&]named parameters
/// ```
pub struct BookmarkableMapper {
    context: Arc<MapperContext>,
    encoder: DefaultPageParametersEncoder,
}

/// Number of segments before the parameters: namespace, identifier, page class.
const NUM_SEGMENTS: usize = 3;

impl BookmarkableMapper {
    /// Creates the mapper.
    pub fn new(context: Arc<MapperContext>) -> Self {
        Self {
            context,
            encoder: DefaultPageParametersEncoder,
        }
    }

    fn matches_prefix(&self, url: &Url) -> bool {
        url.starts_with(&[
            self.context.namespace(),
            self.context.bookmarkable_identifier(),
        ])
    }

    fn parse_request(&self, request: &Request) -> Option<UrlInfo> {
        let url = request.url();
        if !self.matches_prefix(url) || url.segments().len() < NUM_SEGMENTS {
            return None;
        }

        let page_class = self.context.page_class(&url.segments()[2])?.clone();
        Some(UrlInfo {
            info: PageComponentInfo::from_request(request),
            page_class,
            parameters: extract_page_parameters(url, NUM_SEGMENTS, &self.encoder),
        })
    }

    fn build_url(&self, url_info: &UrlInfo) -> Url {
        let mut url = Url::new();
        url.push_segment(self.context.namespace());
        url.push_segment(self.context.bookmarkable_identifier());
        url.push_segment(url_info.page_class.name());
        encode_url_info_parameters(
            url,
            url_info.info.as_ref(),
            &url_info.parameters,
            &self.encoder,
        )
    }
}

impl RequestMapper for BookmarkableMapper {
    fn map_request(&self, request: &Request) -> Option<RequestHandler> {
        let url_info = self.parse_request(request)?;
        handler_for_url_info(&self.context, url_info)
    }

    fn compatibility_score(&self, request: &Request) -> i32 {
        if self.matches_prefix(request.url()) {
            2
        } else {
            0
        }
    }

    fn map_handler(&self, handler: &RequestHandler) -> Option<Url> {
        let url_info =
            url_info_for_handler(handler, |c| self.context.is_page_class_registered(c), true)?;
        Some(self.build_url(&url_info))
    }
}
