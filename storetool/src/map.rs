use anyhow::{Context, Result};
use trellis_request::{
    ListenerInterface, MapperContext, PageClass, Request, RequestMapper, SystemMapper, Url,
    AJAX_HEADER,
};

/// Decodes a URL, and encodes the decoded handler again.
#[derive(clap::Parser)]
pub struct MapOptions {
    /// The URL to decode, relative to the application root, such as `/users/42?5-ILinkListener-x`.
    url: String,

    /// Mounts a page class at a path. May be repeated. Example: `--mount /users/${id}=User`
    #[arg(long)]
    mount: Vec<String>,

    /// The home page class.
    #[arg(long, default_value = "Home")]
    home: String,

    /// Registers a page class for bookmarkable URLs. May be repeated.
    #[arg(long)]
    register: Vec<String>,

    /// Registers a listener interface that renders the page after invocation. May be repeated.
    #[arg(long)]
    listener: Vec<String>,

    /// Decodes the URL as an ajax request.
    #[arg(long)]
    ajax: bool,
}

fn parse_mount(s: &str) -> Result<(&str, PageClass)> {
    let (path, class) = s
        .rsplit_once('=')
        .with_context(|| format!("A mount must have the form PATH=CLASS, not {s:?}"))?;
    Ok((path, PageClass::new(class)))
}

pub fn map_command(options: &MapOptions) -> Result<()> {
    let mut context = MapperContext::new(PageClass::new(&options.home));
    for class in options.register.iter() {
        context = context.register_page_class(PageClass::new(class));
    }
    for name in options.listener.iter() {
        context = context.register_listener_interface(ListenerInterface::new(name.as_str(), true));
    }

    let mapper = SystemMapper::new(context);
    for m in options.mount.iter() {
        let (path, class) = parse_mount(m)?;
        mapper.mount_page(path, class)?;
    }

    let mut request = Request::new(Url::parse(&options.url));
    if options.ajax {
        request = request.with_header(AJAX_HEADER, "true");
    }

    println!("url     : {}", request.url());
    println!("score   : {}", mapper.compatibility_score(&request));

    let Some(handler) = mapper.map_request(&request) else {
        println!("handler : (none; the URL does not match any mapper)");
        return Ok(());
    };
    println!("handler : {handler:#?}");

    match mapper.map_handler(&handler) {
        Some(url) => println!("encoded : {url}"),
        None => println!("encoded : (none; no mapper encodes this handler)"),
    }

    Ok(())
}
