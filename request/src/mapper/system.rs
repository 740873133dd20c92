use super::{
    BookmarkableMapper, BufferedResponseMapper, CompoundRequestMapper, HomePageMapper,
    MapperContext, MountedMapper, PageInstanceMapper, RequestMapper, ResourceReferenceMapper,
};
use crate::handler::RequestHandler;
use crate::page::PageClass;
use crate::request::Request;
use crate::url::Url;
use std::sync::Arc;
use tracing::debug;

/// The root mapper of an application: the framework's own mappers, plus any mappers that the
/// application mounts on top of them.
///
/// In order of increasing precedence, the framework mappers are: home page, page instance,
/// bookmarkable page, resource reference, buffered response.
pub struct SystemMapper {
    context: Arc<MapperContext>,
    mappers: CompoundRequestMapper,
    buffered: Arc<BufferedResponseMapper>,
}

impl SystemMapper {
    /// Creates the framework mappers for `context`.
    pub fn new(context: MapperContext) -> Self {
        let context = Arc::new(context);
        let buffered = Arc::new(BufferedResponseMapper::new());

        let mappers = CompoundRequestMapper::new();
        mappers.add(Arc::new(HomePageMapper::new(context.clone())));
        mappers.add(Arc::new(PageInstanceMapper::new(context.clone())));
        mappers.add(Arc::new(BookmarkableMapper::new(context.clone())));
        mappers.add(Arc::new(ResourceReferenceMapper::new(context.clone())));
        mappers.add(buffered.clone());

        Self {
            context,
            mappers,
            buffered,
        }
    }

    /// Adds a mapper. It takes precedence over all mappers added before it.
    pub fn mount(&self, mapper: Arc<dyn RequestMapper>) {
        self.mappers.add(mapper);
    }

    /// Mounts a page class at a path, such as `/users/${id}`.
    pub fn mount_page(&self, mount_path: &str, page_class: PageClass) -> anyhow::Result<()> {
        let mapper = MountedMapper::new(mount_path, page_class, self.context.clone())?;
        debug!(mount_path, class = %mapper.page_class(), "mounting page");
        self.mount(Arc::new(mapper));
        Ok(())
    }

    /// The mapper context.
    pub fn context(&self) -> &Arc<MapperContext> {
        &self.context
    }

    /// The mapper that replays buffered responses.
    pub fn buffered_responses(&self) -> &BufferedResponseMapper {
        &self.buffered
    }
}

impl RequestMapper for SystemMapper {
    fn map_request(&self, request: &Request) -> Option<RequestHandler> {
        self.mappers.map_request(request)
    }

    fn compatibility_score(&self, request: &Request) -> i32 {
        self.mappers.compatibility_score(request)
    }

    fn map_handler(&self, handler: &RequestHandler) -> Option<Url> {
        self.mappers.map_handler(handler)
    }
}
