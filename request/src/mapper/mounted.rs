use super::{
    encode_url_info_parameters, extract_page_parameters, handler_for_url_info,
    url_info_for_handler, MapperContext, RequestMapper, UrlInfo,
};
use crate::handler::RequestHandler;
use crate::info::PageComponentInfo;
use crate::page::PageClass;
use crate::parameters::{DefaultPageParametersEncoder, PageParameters, PageParametersEncoder};
use crate::request::Request;
use crate::url::Url;
use anyhow::bail;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Debug, Eq, PartialEq)]
enum MountSegment {
    Literal(String),
    /// `${name}`: matches any segment, which becomes the named parameter `name`.
    Placeholder(String),
}

impl MountSegment {
    fn matches(&self, segment: &str) -> bool {
        match self {
            Self::Literal(s) => s == segment,
            Self::Placeholder(_) => true,
        }
    }
}

/// Mounts a bookmarkable page class at a path, such as `/users/${id}`.
pub struct MountedMapper {
    context: Arc<MapperContext>,
    mount_segments: Vec<MountSegment>,
    page_class: PageClass,
    encoder: Arc<dyn PageParametersEncoder>,
    redirect_from_home_page: bool,
}

impl MountedMapper {
    /// Mounts `page_class` at `mount_path`. Segments of the form `${name}` are placeholders for
    /// the named parameter `name`.
    pub fn new(
        mount_path: &str,
        page_class: PageClass,
        context: Arc<MapperContext>,
    ) -> anyhow::Result<Self> {
        let mut mount_segments = Vec::new();
        for s in mount_path.split('/').filter(|s| !s.is_empty()) {
            if let Some(inner) = s.strip_prefix("${") {
                let Some(name) = inner.strip_suffix('}') else {
                    bail!("Mount path {mount_path:?} has an unterminated placeholder: {s:?}");
                };
                if name.is_empty() {
                    bail!("Mount path {mount_path:?} has a placeholder without a name.");
                }
                mount_segments.push(MountSegment::Placeholder(name.to_string()));
            } else {
                mount_segments.push(MountSegment::Literal(s.to_string()));
            }
        }

        if mount_segments.is_empty() {
            bail!("A mount path must have at least one segment; {mount_path:?} has none.");
        }

        Ok(Self {
            context,
            mount_segments,
            page_class,
            encoder: Arc::new(DefaultPageParametersEncoder),
            redirect_from_home_page: true,
        })
    }

    /// Sets the encoder of the parameters that follow the mount path.
    pub fn with_parameters_encoder(mut self, encoder: Arc<dyn PageParametersEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// When set (the default) and the mounted class is the home page class, requests for the
    /// application root are redirected to the mount path.
    pub fn with_redirect_from_home_page(mut self, redirect: bool) -> Self {
        self.redirect_from_home_page = redirect;
        self
    }

    /// The mounted page class.
    pub fn page_class(&self) -> &PageClass {
        &self.page_class
    }

    fn url_matches(&self, url: &Url) -> bool {
        url.segments().len() >= self.mount_segments.len()
            && self
                .mount_segments
                .iter()
                .zip(url.segments())
                .all(|(m, s)| m.matches(s))
    }

    fn is_home_page_request(&self, url: &Url) -> bool {
        self.redirect_from_home_page
            && url.is_empty()
            && self.page_class == *self.context.home_page_class()
    }

    fn parse_request(&self, request: &Request) -> Option<UrlInfo> {
        let url = request.url();
        if !self.url_matches(url) {
            return None;
        }

        let info = PageComponentInfo::from_request(request);
        let mut parameters =
            extract_page_parameters(url, self.mount_segments.len(), &*self.encoder);

        for (segment, value) in self.mount_segments.iter().zip(url.segments()) {
            if let MountSegment::Placeholder(name) = segment {
                parameters.add(name.as_str(), value.as_str());
            }
        }

        Some(UrlInfo {
            info,
            page_class: self.page_class.clone(),
            parameters,
        })
    }

    fn build_url(&self, url_info: &UrlInfo) -> Url {
        let mut url = Url::new();
        let mut parameters = url_info.parameters.clone();

        for segment in self.mount_segments.iter() {
            match segment {
                MountSegment::Literal(s) => url.push_segment(s.as_str()),
                MountSegment::Placeholder(name) => {
                    let value = parameters.get(name).unwrap_or_default().to_string();
                    parameters.remove(name);
                    url.push_segment(value);
                }
            }
        }

        encode_url_info_parameters(url, url_info.info.as_ref(), &parameters, &*self.encoder)
    }
}

impl RequestMapper for MountedMapper {
    fn map_request(&self, request: &Request) -> Option<RequestHandler> {
        if self.is_home_page_request(request.url()) {
            let url = self.build_url(&UrlInfo {
                info: None,
                page_class: self.page_class.clone(),
                parameters: PageParameters::new(),
            });
            debug!(%url, "redirecting from the home page to its mount path");
            return Some(RequestHandler::Redirect(url));
        }

        let url_info = self.parse_request(request)?;
        handler_for_url_info(&self.context, url_info)
    }

    fn compatibility_score(&self, request: &Request) -> i32 {
        if self.url_matches(request.url()) {
            self.mount_segments.len() as i32
        } else {
            0
        }
    }

    fn map_handler(&self, handler: &RequestHandler) -> Option<Url> {
        let url_info = url_info_for_handler(handler, |c| *c == self.page_class, false)?;
        Some(self.build_url(&url_info))
    }
}
