use super::{MapperContext, RequestMapper};
use crate::handler::{RequestHandler, ResourceReference};
use crate::parameters::{DefaultPageParametersEncoder, PageParametersEncoder};
use crate::request::Request;
use crate::url::Url;
use std::sync::Arc;

/// Decodes and encodes URLs of static resources:
///
/// ```text
/// /trellis/resource/<scope>/<name segments>?parameters
/// ```
///
/// A `..` segment in a resource name is written as the context's parent folder placeholder, so
/// that browsers and proxies do not collapse it.
pub struct ResourceReferenceMapper {
    context: Arc<MapperContext>,
}

/// Number of segments before the resource name: namespace, identifier, scope.
const NUM_SEGMENTS: usize = 3;

impl ResourceReferenceMapper {
    /// Creates the mapper.
    pub fn new(context: Arc<MapperContext>) -> Self {
        Self { context }
    }

    fn matches_prefix(&self, url: &Url) -> bool {
        url.starts_with(&[self.context.namespace(), self.context.resource_identifier()])
    }
}

impl RequestMapper for ResourceReferenceMapper {
    fn map_request(&self, request: &Request) -> Option<RequestHandler> {
        let url = request.url();
        if !self.matches_prefix(url) || url.segments().len() <= NUM_SEGMENTS {
            return None;
        }

        let scope = &url.segments()[2];
        let placeholder = self.context.parent_folder_placeholder();
        let name: Vec<&str> = url.segments()[NUM_SEGMENTS..]
            .iter()
            .map(|s| if s == placeholder { ".." } else { s.as_str() })
            .collect();

        if scope.is_empty() || name.iter().all(|s| s.is_empty()) {
            return None;
        }

        let query = url.remainder(url.segments().len(), false);
        let parameters = DefaultPageParametersEncoder.decode_page_parameters(&query);

        Some(RequestHandler::ResourceReference {
            reference: ResourceReference::new(scope.as_str(), name.join("/")),
            parameters,
        })
    }

    fn compatibility_score(&self, request: &Request) -> i32 {
        if self.matches_prefix(request.url()) {
            i32::MAX
        } else {
            0
        }
    }

    fn map_handler(&self, handler: &RequestHandler) -> Option<Url> {
        let RequestHandler::ResourceReference {
            reference,
            parameters,
        } = handler
        else {
            return None;
        };

        let mut url = Url::new();
        url.push_segment(self.context.namespace());
        url.push_segment(self.context.resource_identifier());
        url.push_segment(reference.scope.as_str());
        for s in reference.name.split('/') {
            if s == ".." {
                url.push_segment(self.context.parent_folder_placeholder());
            } else {
                url.push_segment(s);
            }
        }

        for p in parameters.named() {
            url.push_query_parameter(p.name.as_str(), p.value.as_str());
        }
        Some(url)
    }
}
