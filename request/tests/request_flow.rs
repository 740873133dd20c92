//! Runs whole requests through the system mapper, a page manager and a page store.

use anyhow::{bail, Context};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use trellis_pagestore::{DataStore, DiskDataStore, DiskDataStoreOptions, MemoryDataStore};
use trellis_request::*;

#[static_init::dynamic]
static INIT_LOGGER: () = {
    tracing_subscriber::fmt::fmt()
        .compact()
        .with_max_level(tracing_subscriber::filter::LevelFilter::TRACE)
        .with_level(false)
        .with_file(true)
        .with_line_number(true)
        .with_test_writer()
        .without_time()
        .with_ansi(false)
        .init();
};

const SESSION: &str = "session-1";

/// A listener call, as seen by a test component.
#[derive(Clone, Debug, Eq, PartialEq)]
struct Invocation {
    page_id: u32,
    component_path: String,
    behavior_index: Option<usize>,
    listener_interface: String,
    page_id_frozen: bool,
}

/// Shared by all pages of a test, including pages that were deserialized.
#[derive(Default)]
struct Journal {
    invocations: Mutex<Vec<Invocation>>,
    frozen: Mutex<HashMap<u32, bool>>,
}

impl Journal {
    fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    fn is_frozen(&self, page_id: u32) -> bool {
        self.frozen
            .lock()
            .unwrap()
            .get(&page_id)
            .copied()
            .unwrap_or(false)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct ComponentLayout {
    path: String,
    num_behaviors: usize,
    fails: bool,
    removed: bool,
}

impl ComponentLayout {
    fn new(path: &str, num_behaviors: usize) -> Self {
        Self {
            path: path.to_string(),
            num_behaviors,
            fails: false,
            removed: false,
        }
    }
}

struct TestPage {
    id: u32,
    class: PageClass,
    render_count: u32,
    stateless: bool,
    components: Vec<ComponentLayout>,
    journal: Arc<Journal>,
}

impl RequestablePage for TestPage {
    fn page_id(&self) -> u32 {
        self.id
    }

    fn page_class(&self) -> PageClass {
        self.class.clone()
    }

    fn page_parameters(&self) -> PageParameters {
        PageParameters::new()
    }

    fn render_count(&self) -> u32 {
        self.render_count
    }

    fn is_stateless(&self) -> bool {
        self.stateless
    }

    fn was_created_bookmarkable(&self) -> bool {
        true
    }

    fn set_freeze_page_id(&self, freeze: bool) -> bool {
        self.journal
            .frozen
            .lock()
            .unwrap()
            .insert(self.id, freeze)
            .unwrap_or(false)
    }

    fn get_component(&self, path: &str) -> Option<Arc<dyn RequestableComponent>> {
        let layout = self.components.iter().find(|c| c.path == path)?;
        Some(Arc::new(TestComponent {
            page_id: self.id,
            layout: layout.clone(),
            journal: self.journal.clone(),
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct TestComponent {
    page_id: u32,
    layout: ComponentLayout,
    journal: Arc<Journal>,
}

impl TestComponent {
    fn record(&self, listener_interface: &ListenerInterface) {
        self.journal.invocations.lock().unwrap().push(Invocation {
            page_id: self.page_id,
            component_path: self.layout.path.clone(),
            behavior_index: None,
            listener_interface: listener_interface.name().to_string(),
            page_id_frozen: self.journal.is_frozen(self.page_id),
        });
    }
}

impl RequestableComponent for TestComponent {
    fn page_relative_path(&self) -> String {
        self.layout.path.clone()
    }

    fn page_id(&self) -> Option<u32> {
        if self.layout.removed {
            None
        } else {
            Some(self.page_id)
        }
    }

    fn behaviors(&self) -> Vec<Arc<dyn Behavior>> {
        (0..self.layout.num_behaviors)
            .map(|index| {
                Arc::new(TestBehavior {
                    index,
                    journal: self.journal.clone(),
                }) as Arc<dyn Behavior>
            })
            .collect()
    }

    fn invoke_listener(
        &self,
        listener_interface: &ListenerInterface,
        _cycle: &RequestCycle<'_>,
    ) -> anyhow::Result<()> {
        self.record(listener_interface);
        if self.layout.fails {
            bail!("listener of {} failed", self.layout.path);
        }
        Ok(())
    }
}

struct TestBehavior {
    index: usize,
    journal: Arc<Journal>,
}

impl Behavior for TestBehavior {
    fn invoke_listener(
        &self,
        component: &dyn RequestableComponent,
        listener_interface: &ListenerInterface,
        _cycle: &RequestCycle<'_>,
    ) -> anyhow::Result<()> {
        let path = component.page_relative_path();
        let Some(page_id) = component.page_id() else {
            bail!("component {path} has no page");
        };
        self.journal.invocations.lock().unwrap().push(Invocation {
            page_id,
            component_path: path,
            behavior_index: Some(self.index),
            listener_interface: listener_interface.name().to_string(),
            page_id_frozen: self.journal.is_frozen(page_id),
        });
        Ok(())
    }
}

/// Creates `Form` pages (with components) and stateless `Login` pages.
struct TestFactory {
    next_page_id: AtomicU32,
    journal: Arc<Journal>,
}

impl TestFactory {
    fn new(journal: Arc<Journal>) -> Self {
        Self {
            next_page_id: AtomicU32::new(1),
            journal,
        }
    }
}

impl PageFactory for TestFactory {
    fn new_page(
        &self,
        page_class: &PageClass,
        _parameters: &PageParameters,
    ) -> anyhow::Result<Arc<dyn RequestablePage>> {
        let (stateless, components) = match page_class.name() {
            "Form" => (
                false,
                vec![
                    ComponentLayout::new("form:save", 1),
                    ComponentLayout {
                        fails: true,
                        ..ComponentLayout::new("form:fail", 0)
                    },
                    ComponentLayout {
                        removed: true,
                        ..ComponentLayout::new("gone", 0)
                    },
                ],
            ),
            "Login" => (true, vec![ComponentLayout::new("login", 0)]),
            name => bail!("no such page class: {name}"),
        };

        Ok(Arc::new(TestPage {
            id: self.next_page_id.fetch_add(1, Ordering::Relaxed),
            class: page_class.clone(),
            render_count: 0,
            stateless,
            components,
            journal: self.journal.clone(),
        }))
    }
}

/// Writes a page as lines of text: a header, then one line per component.
struct TestSerializer {
    journal: Arc<Journal>,
}

impl PageSerializer for TestSerializer {
    fn serialize(&self, page: &dyn RequestablePage) -> Option<Vec<u8>> {
        let page = page.as_any().downcast_ref::<TestPage>()?;
        let mut s = format!("{} {} {}\n", page.id, page.class, page.render_count);
        for c in page.components.iter() {
            s.push_str(&format!(
                "{} {} {} {}\n",
                c.path, c.num_behaviors, c.fails, c.removed
            ));
        }
        Some(s.into_bytes())
    }

    fn deserialize(&self, data: &[u8]) -> anyhow::Result<Arc<dyn RequestablePage>> {
        let text = std::str::from_utf8(data)?;
        let mut lines = text.lines();
        let header: Vec<&str> = lines.next().context("empty page")?.split(' ').collect();
        let [id, class, render_count] = header.as_slice() else {
            bail!("bad page header");
        };

        let mut components = Vec::new();
        for line in lines {
            let fields: Vec<&str> = line.split(' ').collect();
            let [path, num_behaviors, fails, removed] = fields.as_slice() else {
                bail!("bad component line: {line:?}");
            };
            components.push(ComponentLayout {
                path: path.to_string(),
                num_behaviors: num_behaviors.parse()?,
                fails: fails.parse()?,
                removed: removed.parse()?,
            });
        }

        Ok(Arc::new(TestPage {
            id: id.parse()?,
            class: PageClass::new(class),
            render_count: render_count.parse()?,
            stateless: false,
            components,
            journal: self.journal.clone(),
        }))
    }
}

struct App {
    mapper: SystemMapper,
    store: Arc<dyn DataStore>,
    journal: Arc<Journal>,
    factory: TestFactory,
}

impl App {
    fn new(store: Arc<dyn DataStore>) -> Self {
        let mapper = SystemMapper::new(
            MapperContext::new(PageClass::new("Form")).register_page_class(PageClass::new("Login")),
        );
        mapper.mount_page("/form", PageClass::new("Form")).unwrap();
        mapper.mount_page("/login", PageClass::new("Login")).unwrap();

        let journal = Arc::new(Journal::default());
        Self {
            mapper,
            store,
            factory: TestFactory::new(journal.clone()),
            journal,
        }
    }

    fn in_memory() -> Self {
        Self::new(Arc::new(MemoryDataStore::new(10)))
    }

    fn page_manager(&self) -> PersistentPageManager {
        PersistentPageManager::new(
            SESSION,
            self.store.clone(),
            Arc::new(TestSerializer {
                journal: self.journal.clone(),
            }),
        )
    }

    /// Runs one request with a fresh page manager, as a new request of the session would.
    fn process(&self, request: Request) -> anyhow::Result<ResponseOutcome> {
        let pages = self.page_manager();
        let cycle = RequestCycle::new(request, &self.mapper, &pages, &self.factory);
        cycle.process()
    }

    fn get(&self, url: &str) -> anyhow::Result<ResponseOutcome> {
        self.process(Request::get(url))
    }

    /// Creates a `Form` page and returns its id.
    fn new_form(&self) -> u32 {
        match self.get("/form").unwrap() {
            ResponseOutcome::RenderedPage { page_id, .. } => page_id,
            outcome => panic!("expected a rendered page, got {outcome:?}"),
        }
    }
}

fn rendered(page_id: u32, class: &str) -> ResponseOutcome {
    ResponseOutcome::RenderedPage {
        page_id,
        page_class: PageClass::new(class),
        redirect_policy: RedirectPolicy::AutoRedirect,
    }
}

#[test]
fn bookmarkable_page_is_created_and_stored() {
    let app = App::in_memory();
    assert_eq!(app.get("/form").unwrap(), rendered(1, "Form"));
    assert!(app.store.get_data(SESSION, 1).is_some());
}

#[test]
fn link_listener_renders_page_afterwards() {
    let app = App::in_memory();
    let page_id = app.new_form();

    let outcome = app
        .get(&format!("/form?{page_id}-0.ILinkListener-form-save"))
        .unwrap();
    assert_eq!(outcome, rendered(page_id, "Form"));

    assert_eq!(
        app.journal.invocations(),
        [Invocation {
            page_id,
            component_path: "form:save".to_string(),
            behavior_index: None,
            listener_interface: "ILinkListener".to_string(),
            page_id_frozen: false,
        }]
    );
}

#[test]
fn ajax_listener_freezes_page_id() {
    let app = App::in_memory();
    let page_id = app.new_form();

    let outcome = app
        .process(Request::get(&format!("/form?{page_id}-0.ILinkListener-form-save")).ajax())
        .unwrap();
    assert_eq!(
        outcome,
        ResponseOutcome::ListenerInvoked {
            page_id,
            component_path: "form:save".to_string(),
        }
    );

    let invocations = app.journal.invocations();
    assert_eq!(invocations.len(), 1);
    assert!(invocations[0].page_id_frozen);
    assert!(!app.journal.is_frozen(page_id));
}

#[test]
fn page_id_freeze_is_restored_when_listener_fails() {
    let app = App::in_memory();
    let page_id = app.new_form();

    let e = app
        .process(Request::get(&format!("/form?{page_id}-0.ILinkListener-form-fail")).ajax())
        .unwrap_err();
    assert!(e.to_string().contains("form:fail"), "{e:#}");

    let invocations = app.journal.invocations();
    assert_eq!(invocations.len(), 1);
    assert!(invocations[0].page_id_frozen);
    assert!(!app.journal.is_frozen(page_id));
}

#[test]
fn behavior_listener() {
    let app = App::in_memory();
    let page_id = app.new_form();

    let outcome = app
        .process(
            Request::get(&format!("/form?{page_id}-0.IBehaviorListener.0-form-save")).ajax(),
        )
        .unwrap();
    assert_eq!(
        outcome,
        ResponseOutcome::ListenerInvoked {
            page_id,
            component_path: "form:save".to_string(),
        }
    );
    // The behavior, not the component, received the call.
    assert_eq!(
        app.journal.invocations(),
        [Invocation {
            page_id,
            component_path: "form:save".to_string(),
            behavior_index: Some(0),
            listener_interface: "IBehaviorListener".to_string(),
            page_id_frozen: true,
        }]
    );
}

#[test]
fn stale_behavior_index() {
    let app = App::in_memory();
    let page_id = app.new_form();

    let e = app
        .get(&format!("/form?{page_id}-0.IBehaviorListener.5-form-save"))
        .unwrap_err();
    assert_eq!(
        e.downcast_ref::<ListenerInvocationError>(),
        Some(&ListenerInvocationError::BehaviorNotFound {
            component_path: "form:save".to_string(),
            behavior_index: 5,
            num_behaviors: 1,
        })
    );
    assert!(e.to_string().starts_with("Couldn't find component behavior."));
}

#[test]
fn missing_and_removed_components() {
    let app = App::in_memory();
    let page_id = app.new_form();

    let e = app
        .get(&format!("/form?{page_id}-0.ILinkListener-nope"))
        .unwrap_err();
    assert_eq!(
        e.downcast_ref::<ListenerInvocationError>(),
        Some(&ListenerInvocationError::ComponentNotFound {
            page_id,
            component_path: "nope".to_string(),
        })
    );

    let e = app
        .get(&format!("/form?{page_id}-0.ILinkListener-gone"))
        .unwrap_err();
    assert!(matches!(
        e.downcast_ref::<ListenerInvocationError>(),
        Some(ListenerInvocationError::ComponentRemoved { .. })
    ));

    assert!(app.journal.invocations().is_empty());
}

#[test]
fn expired_page_without_class() {
    let app = App::in_memory();
    assert_eq!(
        app.get("/trellis/page?42").unwrap(),
        ResponseOutcome::PageExpired { page_id: 42 }
    );
    assert_eq!(
        app.get("/trellis/page?42-ILinkListener-form-save").unwrap(),
        ResponseOutcome::PageExpired { page_id: 42 }
    );
}

#[test]
fn expired_page_with_class_is_recreated() {
    let app = App::in_memory();
    let outcome = app.get("/form?42-0.ILinkListener-form-save").unwrap();

    // The new page gets a new id, and the listener is not invoked on it.
    assert_eq!(outcome, rendered(1, "Form"));
    assert!(app.journal.invocations().is_empty());
    assert!(app.store.get_data(SESSION, 1).is_some());
}

#[test]
fn stale_render_count_renders_current_page() {
    let app = App::in_memory();
    let page_id = app.new_form();

    let outcome = app
        .get(&format!("/form?{page_id}-3.ILinkListener-form-save"))
        .unwrap();
    assert_eq!(outcome, rendered(page_id, "Form"));
    assert!(app.journal.invocations().is_empty());
}

#[test]
fn page_instance_url() {
    let app = App::in_memory();
    let page_id = app.new_form();

    assert_eq!(
        app.get(&format!("/trellis/page?{page_id}")).unwrap(),
        rendered(page_id, "Form")
    );
    app.get(&format!("/trellis/page?{page_id}-0.IFormSubmitListener-form-save"))
        .unwrap();
    assert_eq!(app.journal.invocations().len(), 1);
}

#[test]
fn stateless_pages_are_not_stored() {
    let app = App::in_memory();
    let page_id = match app.get("/login").unwrap() {
        ResponseOutcome::RenderedPage { page_id, .. } => page_id,
        outcome => panic!("expected a rendered page, got {outcome:?}"),
    };
    assert!(app.store.get_data(SESSION, page_id).is_none());
}

#[test]
fn other_outcomes() {
    let app = App::in_memory();
    assert_eq!(app.get("/nothing/here").unwrap(), ResponseOutcome::NotFound);

    // The home page is mounted at /form.
    assert_eq!(
        app.get("/").unwrap(),
        ResponseOutcome::Redirect(Url::parse("/form"))
    );

    assert_eq!(
        app.get("/trellis/resource/widgets/$up$/style.css").unwrap(),
        ResponseOutcome::Resource {
            reference: ResourceReference::new("widgets", "../style.css"),
            parameters: PageParameters::new(),
        }
    );
}

#[test]
fn buffered_response_is_replayed() {
    let app = App::in_memory();
    let page_id = app.new_form();
    let url = Url::parse(&format!("/trellis/page?{page_id}"));
    let response = BufferedResponse {
        content_type: "text/html".to_string(),
        body: b"<p>saved</p>".to_vec(),
    };
    app.mapper
        .buffered_responses()
        .store_buffered_response(&url, response.clone());

    assert_eq!(
        app.process(Request::new(url.clone())).unwrap(),
        ResponseOutcome::Buffered(response)
    );
    assert_eq!(
        app.process(Request::new(url)).unwrap(),
        rendered(page_id, "Form")
    );
}

#[test]
fn url_for_uses_root_mapper() {
    let app = App::in_memory();
    let pages = app.page_manager();
    let cycle = RequestCycle::new(Request::get("/"), &app.mapper, &pages, &app.factory);

    let url = cycle
        .url_for(&RequestHandler::BookmarkablePage {
            page_class: PageClass::new("Form"),
            parameters: PageParameters::new(),
        })
        .unwrap();
    assert_eq!(url.to_string(), "/form");
}

#[test]
fn session_is_cleared() {
    let app = App::in_memory();
    let page_id = app.new_form();

    app.page_manager().clear();
    assert_eq!(
        app.get(&format!("/trellis/page?{page_id}")).unwrap(),
        ResponseOutcome::PageExpired { page_id }
    );
}

#[test]
fn pages_survive_a_store_restart() {
    let dir = tempfile::tempdir().unwrap();
    let options = || DiskDataStoreOptions {
        store_folder: dir.path().to_path_buf(),
        ..DiskDataStoreOptions::default()
    };

    let store = Arc::new(DiskDataStore::new(options()).unwrap());
    let app = App::new(store.clone());
    let page_id = app.new_form();
    store.destroy();
    drop(app);
    drop(store);

    let app = App::new(Arc::new(DiskDataStore::new(options()).unwrap()));
    let outcome = app
        .process(Request::get(&format!("/form?{page_id}-0.ILinkListener-form-save")).ajax())
        .unwrap();
    assert_eq!(
        outcome,
        ResponseOutcome::ListenerInvoked {
            page_id,
            component_path: "form:save".to_string(),
        }
    );
    assert_eq!(app.journal.invocations().len(), 1);
}
