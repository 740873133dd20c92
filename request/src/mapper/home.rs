use super::{
    encode_url_info_parameters, extract_page_parameters, handler_for_url_info,
    url_info_for_handler, MapperContext, RequestMapper, UrlInfo,
};
use crate::handler::RequestHandler;
use crate::info::PageComponentInfo;
use crate::parameters::DefaultPageParametersEncoder;
use crate::request::Request;
use crate::url::Url;
use std::sync::Arc;

/// Maps the application root to the home page. Query parameters become named page parameters.
pub struct HomePageMapper {
    context: Arc<MapperContext>,
    encoder: DefaultPageParametersEncoder,
}

impl HomePageMapper {
    /// Creates the mapper.
    pub fn new(context: Arc<MapperContext>) -> Self {
        Self {
            context,
            encoder: DefaultPageParametersEncoder,
        }
    }
}

impl RequestMapper for HomePageMapper {
    fn map_request(&self, request: &Request) -> Option<RequestHandler> {
        let url = request.url();
        if !url.segments().is_empty() {
            return None;
        }

        let url_info = UrlInfo {
            info: PageComponentInfo::from_request(request),
            page_class: self.context.home_page_class().clone(),
            parameters: extract_page_parameters(url, 0, &self.encoder),
        };
        handler_for_url_info(&self.context, url_info)
    }

    fn compatibility_score(&self, _request: &Request) -> i32 {
        0
    }

    fn map_handler(&self, handler: &RequestHandler) -> Option<Url> {
        let home = self.context.home_page_class();
        let url_info = url_info_for_handler(handler, |c| c == home, false)?;

        // Indexed parameters would turn into path segments, which this mapper cannot decode.
        if !url_info.parameters.indexed().is_empty() {
            return None;
        }

        Some(encode_url_info_parameters(
            Url::new(),
            url_info.info.as_ref(),
            &url_info.parameters,
            &self.encoder,
        ))
    }
}
