use super::RequestMapper;
use crate::handler::{BufferedResponse, RequestHandler};
use crate::request::Request;
use crate::url::Url;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Replays responses that were rendered before a redirect to their URL.
///
/// Each stored response is replayed once; the request that replays it removes it.
#[derive(Default)]
pub struct BufferedResponseMapper {
    /// Keyed by the text of the URL.
    responses: Mutex<HashMap<String, BufferedResponse>>,
}

impl BufferedResponseMapper {
    /// Creates a mapper without stored responses.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BufferedResponse>> {
        self.responses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a response for `url`, replacing any response already stored for it.
    pub fn store_buffered_response(&self, url: &Url, response: BufferedResponse) {
        debug!(%url, size = response.body.len(), "storing buffered response");
        self.lock().insert(url.to_string(), response);
    }

    /// Indicates whether a response is stored for `url`.
    pub fn has_buffered_response(&self, url: &Url) -> bool {
        self.lock().contains_key(&url.to_string())
    }
}

impl RequestMapper for BufferedResponseMapper {
    fn map_request(&self, request: &Request) -> Option<RequestHandler> {
        let url = request.url();
        let response = self.lock().remove(&url.to_string())?;
        Some(RequestHandler::BufferedResponse {
            url: url.clone(),
            response,
        })
    }

    fn compatibility_score(&self, request: &Request) -> i32 {
        if self.has_buffered_response(request.url()) {
            i32::MAX
        } else {
            0
        }
    }

    fn map_handler(&self, _handler: &RequestHandler) -> Option<Url> {
        None
    }
}
