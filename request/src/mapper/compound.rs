use super::RequestMapper;
use crate::handler::RequestHandler;
use crate::request::Request;
use crate::url::Url;
use std::cmp::Reverse;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tracing::{debug, trace};

/// Combines several mappers. Requests go to the compatible mapper with the highest score; handlers
/// are encoded by the first mapper that can encode them.
///
/// Mappers are kept in order of precedence. A mapper that is added takes precedence over all
/// mappers that were added before it.
#[derive(Default)]
pub struct CompoundRequestMapper {
    /// Newest first.
    mappers: RwLock<Vec<Arc<dyn RequestMapper>>>,
}

impl CompoundRequestMapper {
    /// Creates an empty compound mapper.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<dyn RequestMapper>>> {
        self.mappers.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a mapper. It takes precedence over the mappers added before it.
    pub fn add(&self, mapper: Arc<dyn RequestMapper>) {
        self.mappers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(0, mapper);
    }

    /// The number of mappers.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Indicates whether there are no mappers.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl RequestMapper for CompoundRequestMapper {
    fn map_request(&self, request: &Request) -> Option<RequestHandler> {
        let mappers = self.read();

        let mut scored: Vec<(i32, &Arc<dyn RequestMapper>)> = mappers
            .iter()
            .map(|m| (m.compatibility_score(request), m))
            .collect();

        // Stable, so that mappers with equal scores stay in order of precedence.
        scored.sort_by_key(|&(score, _)| Reverse(score));

        for (i, (score, mapper)) in scored.iter().enumerate() {
            if let Some(handler) = mapper.map_request(request) {
                debug!(score, tried = i + 1, "request mapped");
                return Some(handler);
            }
            trace!(score, "mapper did not match");
        }

        None
    }

    fn compatibility_score(&self, request: &Request) -> i32 {
        self.read()
            .iter()
            .map(|m| m.compatibility_score(request))
            .max()
            .unwrap_or(0)
    }

    fn map_handler(&self, handler: &RequestHandler) -> Option<Url> {
        self.read().iter().find_map(|m| m.map_handler(handler))
    }
}
