//! Catalog screen core: events in, view model out.
//!
//! [`CatalogApp`] is a pure update/view pair over [`Model`]. [`CatalogCore`] owns a model
//! on a single tokio task and feeds it messages from an mpsc channel. Collaborator calls
//! run on their own tasks and come back as messages, so every mutation happens on the
//! core task in arrival order.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{
    CachedImageFetcher, Capabilities, HttpCatalogClient, HttpError, HttpImageFetcher, Image,
    ImageFetcher, KvLikeStore, LikeStore, MemoryKvStore,
};
use crate::config::CatalogConfig;
use crate::error::{CatalogError, ErrorSeverity};
use crate::favorites::FavoritesState;
use crate::model::{LayoutMode, ProductDetail, ProductId, ProductPage, UserId};
use crate::product_details::ProductDetailsState;
use crate::product_list::{PageRequest, ProductListState};

// ============================================================================
// Events & messages
// ============================================================================

/// User intents forwarded by the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Event {
    /// Screen shown: hydrate favorites and request the first page.
    AppStarted,
    LoadNextPage,
    FavoriteToggled { index: usize },
    ProductSelected { index: usize },
    DetailsDismissed,
    LayoutToggled,
    ErrorDismissed,
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AppStarted => "app_started",
            Self::LoadNextPage => "load_next_page",
            Self::FavoriteToggled { .. } => "favorite_toggled",
            Self::ProductSelected { .. } => "product_selected",
            Self::DetailsDismissed => "details_dismissed",
            Self::LayoutToggled => "layout_toggled",
            Self::ErrorDismissed => "error_dismissed",
        }
    }
}

/// Everything [`CatalogApp::update`] consumes: shell events and collaborator results.
#[derive(Debug)]
pub enum Message {
    Event(Event),
    PageLoaded {
        request: PageRequest,
        result: Result<ProductPage, HttpError>,
    },
    DetailsLoaded {
        product_id: ProductId,
        result: Result<ProductDetail, HttpError>,
    },
}

impl Message {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Event(event) => event.name(),
            Self::PageLoaded { .. } => "page_loaded",
            Self::DetailsLoaded { .. } => "details_loaded",
        }
    }
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

/// Work requested by `update` that the runtime carries out.
#[derive(Debug)]
pub enum Effect {
    FetchPage(PageRequest),
    FetchDetails(ProductId),
    /// Outcome of a page request, for whoever is awaiting it.
    PageSettled(Result<usize, CatalogError>),
}

// ============================================================================
// Model
// ============================================================================

#[derive(Debug)]
pub struct Model {
    pub user_id: UserId,
    pub list: ProductListState,
    pub favorites: FavoritesState,
    pub details: ProductDetailsState,
    pub layout: LayoutMode,
    pub active_error: Option<UserFacingError>,
}

impl Model {
    pub fn new(likes: Arc<dyn LikeStore>, user_id: UserId) -> Self {
        Self {
            user_id,
            list: ProductListState::new(),
            favorites: FavoritesState::new(likes),
            details: ProductDetailsState::new(),
            layout: LayoutMode::default(),
            active_error: None,
        }
    }

    pub fn set_error(&mut self, error: &CatalogError) {
        self.active_error = Some(UserFacingError::from(error));
    }

    pub fn clear_error(&mut self) {
        self.active_error = None;
    }
}

// ============================================================================
// View model
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UserFacingError {
    pub message: String,
    pub is_transient: bool,
    pub is_retryable: bool,
    pub error_code: String,
}

impl From<&CatalogError> for UserFacingError {
    fn from(e: &CatalogError) -> Self {
        Self {
            message: e.user_facing_message(),
            is_transient: e.severity() == ErrorSeverity::Transient,
            is_retryable: e.is_retryable(),
            error_code: e.code().to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProductRow {
    pub index: usize,
    pub product_id: Option<ProductId>,
    pub display_name: String,
    pub image_url: Option<String>,
    pub is_favorited: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetailsView {
    pub product_id: ProductId,
    pub is_loading: bool,
    pub detail: Option<ProductDetail>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ViewModel {
    pub products: Vec<ProductRow>,
    pub current_page: u32,
    pub is_loading: bool,
    pub layout: LayoutMode,
    pub columns: usize,
    pub details: Option<DetailsView>,
    pub error: Option<UserFacingError>,
    pub user_id: String,
}

// ============================================================================
// App
// ============================================================================

#[derive(Default, Clone, Copy, Debug)]
pub struct CatalogApp;

impl CatalogApp {
    fn request_page(model: &mut Model) -> Vec<Effect> {
        match model.list.begin_fetch() {
            Some(request) => {
                info!(page = request.page(), "requesting page");
                vec![Effect::FetchPage(request)]
            }
            None => Vec::new(),
        }
    }

    fn product_id_at(model: &mut Model, index: usize) -> Option<ProductId> {
        match model.list.get(index).map(|product| product.id) {
            Some(Some(product_id)) => Some(product_id),
            Some(None) => {
                let error = CatalogError::MissingProductId { index };
                warn!(%error, "event ignored");
                None
            }
            None => {
                let error = CatalogError::IndexOutOfRange {
                    index,
                    count: model.list.count(),
                };
                warn!(%error, "event rejected");
                model.set_error(&error);
                None
            }
        }
    }

    /// Looks up the persisted like flags of the `appended` products at the end of the list.
    fn refresh_favorites(model: &mut Model, appended: usize) {
        let start = model.list.count().saturating_sub(appended);
        let ids: Vec<ProductId> = model.list.products()[start..]
            .iter()
            .filter_map(|product| product.id)
            .collect();
        let user_id = model.user_id.clone();
        if let Err(e) = model.favorites.refresh(ids, &user_id) {
            warn!(error = %e, "favorite lookup failed");
            model.set_error(&e);
        }
    }

    #[instrument(skip_all, fields(message = message.name()))]
    pub fn update(&self, message: Message, model: &mut Model) -> Vec<Effect> {
        match message {
            Message::Event(Event::AppStarted) => {
                let user_id = model.user_id.clone();
                if let Err(e) = model.favorites.hydrate(&user_id) {
                    warn!(error = %e, "favorites hydration failed");
                    model.set_error(&e);
                }
                Self::request_page(model)
            }

            Message::Event(Event::LoadNextPage) => Self::request_page(model),

            Message::Event(Event::FavoriteToggled { index }) => {
                if let Some(product_id) = Self::product_id_at(model, index) {
                    let user_id = model.user_id.clone();
                    if let Err(e) = model.favorites.toggle_favorite(product_id, &user_id) {
                        model.set_error(&e);
                    }
                }
                Vec::new()
            }

            Message::Event(Event::ProductSelected { index }) => {
                match Self::product_id_at(model, index) {
                    Some(product_id) => {
                        model.details.begin(product_id);
                        vec![Effect::FetchDetails(product_id)]
                    }
                    None => Vec::new(),
                }
            }

            Message::Event(Event::DetailsDismissed) => {
                model.details.clear();
                Vec::new()
            }

            Message::Event(Event::LayoutToggled) => {
                model.layout = model.layout.toggled();
                debug!(layout = ?model.layout, "layout changed");
                Vec::new()
            }

            Message::Event(Event::ErrorDismissed) => {
                model.clear_error();
                Vec::new()
            }

            Message::PageLoaded { request, result } => {
                let outcome = model.list.complete_fetch(request, result);
                match &outcome {
                    Ok(appended) => {
                        model.clear_error();
                        Self::refresh_favorites(model, *appended);
                    }
                    Err(CatalogError::StalePage { .. }) => {}
                    Err(e) => model.set_error(e),
                }
                vec![Effect::PageSettled(outcome)]
            }

            Message::DetailsLoaded { product_id, result } => {
                if let Err(e) = model.details.complete(product_id, result) {
                    model.set_error(&e);
                }
                Vec::new()
            }
        }
    }

    pub fn view(&self, model: &Model) -> ViewModel {
        let products = model
            .list
            .products()
            .iter()
            .enumerate()
            .map(|(index, product)| ProductRow {
                index,
                product_id: product.id,
                display_name: product.display_name.clone().unwrap_or_default(),
                image_url: product.image_url.clone(),
                is_favorited: model
                    .favorites
                    .contains(product.favorite_key(), &model.user_id),
            })
            .collect();

        let details = model.details.requested().map(|product_id| DetailsView {
            product_id,
            is_loading: model.details.is_loading(),
            detail: model.details.detail().cloned(),
        });

        ViewModel {
            products,
            current_page: model.list.current_page(),
            is_loading: model.list.is_loading(),
            layout: model.layout,
            columns: model.layout.columns(),
            details,
            error: model.active_error.clone(),
            user_id: model.user_id.to_string(),
        }
    }
}

// ============================================================================
// Runtime
// ============================================================================

type PageReply = oneshot::Sender<Result<usize, CatalogError>>;

enum Command {
    Dispatch(Message),
    LoadNextPage(PageReply),
}

/// Handle to a running catalog core. Dropping every handle stops the core task.
pub struct CatalogCore {
    tx: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<ViewModel>,
    images: Arc<dyn ImageFetcher>,
}

impl CatalogCore {
    /// Spawns the core task. Must be called from within a tokio runtime.
    pub fn new(caps: Capabilities, user_id: UserId) -> Self {
        let model = Model::new(caps.likes.clone(), user_id);
        let app = CatalogApp;
        let (view_tx, view) = watch::channel(app.view(&model));
        let (tx, rx) = mpsc::unbounded_channel();
        let images = caps.images.clone();

        let runtime = CoreRuntime {
            app,
            model,
            caps,
            tx: tx.downgrade(),
            view_tx,
            waiter: None,
            settled: None,
        };
        tokio::spawn(runtime.run(rx));

        Self { tx, view, images }
    }

    /// Wires the HTTP catalog client, the like store and the cached image fetcher.
    pub fn from_config(config: &CatalogConfig) -> Result<Self, CatalogError> {
        config.validate()?;
        let catalog = HttpCatalogClient::new(config)?;
        let images = CachedImageFetcher::new(
            HttpImageFetcher::new(config)?,
            config.image_cache_capacity,
        );
        let caps = Capabilities::new(Arc::new(catalog), like_store(config)?, Arc::new(images));
        info!(base = %config.api_base_url, user = %config.user_id, "catalog core configured");
        Ok(Self::new(caps, UserId::new(config.user_id.as_str())))
    }

    pub fn dispatch(&self, event: Event) -> Result<(), CatalogError> {
        self.tx
            .send(Command::Dispatch(Message::Event(event)))
            .map_err(|_| CatalogError::Closed)
    }

    /// Requests the next page and waits for it to be applied.
    pub async fn load_next_page(&self) -> Result<usize, CatalogError> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(Command::LoadNextPage(reply))
            .map_err(|_| CatalogError::Closed)?;
        outcome.await.map_err(|_| CatalogError::Closed)?
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewModel> {
        self.view.clone()
    }

    pub fn view(&self) -> ViewModel {
        self.view.borrow().clone()
    }

    pub async fn fetch_image(&self, url: &str) -> Option<Image> {
        self.images.fetch_image(url).await
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn like_store(config: &CatalogConfig) -> Result<Arc<dyn LikeStore>, CatalogError> {
    Ok(match &config.favorites_db_path {
        Some(path) => Arc::new(KvLikeStore::new(crate::capabilities::SqliteKvStore::open(path)?)),
        None => Arc::new(KvLikeStore::new(MemoryKvStore::new())),
    })
}

#[cfg(target_arch = "wasm32")]
fn like_store(config: &CatalogConfig) -> Result<Arc<dyn LikeStore>, CatalogError> {
    if config.favorites_db_path.is_some() {
        warn!("favorites_db_path ignored on wasm, likes kept in memory");
    }
    Ok(Arc::new(KvLikeStore::new(MemoryKvStore::new())))
}

struct CoreRuntime {
    app: CatalogApp,
    model: Model,
    caps: Capabilities,
    tx: mpsc::WeakUnboundedSender<Command>,
    view_tx: watch::Sender<ViewModel>,
    waiter: Option<PageReply>,
    settled: Option<Result<usize, CatalogError>>,
}

impl CoreRuntime {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!("catalog core started");
        while let Some(command) = rx.recv().await {
            match command {
                Command::Dispatch(message) => {
                    self.apply(message);
                }
                Command::LoadNextPage(reply) => {
                    let started = self.apply(Message::Event(Event::LoadNextPage));
                    if started {
                        self.waiter = Some(reply);
                    } else {
                        let _ = reply.send(Err(CatalogError::FetchInFlight {
                            page: self.model.list.current_page(),
                        }));
                    }
                }
            }
            self.view_tx.send_replace(self.app.view(&self.model));

            // Reply only once the view reflects the page.
            if let Some(outcome) = self.settled.take() {
                if let Some(waiter) = self.waiter.take() {
                    let _ = waiter.send(outcome);
                }
            }
        }
        debug!("catalog core stopped");
    }

    /// Runs one update and its effects. Returns whether a page request was started.
    fn apply(&mut self, message: Message) -> bool {
        let mut page_started = false;
        for effect in self.app.update(message, &mut self.model) {
            match effect {
                Effect::FetchPage(request) => {
                    page_started = true;
                    let catalog = self.caps.catalog.clone();
                    self.spawn_call(
                        async move { catalog.fetch_products(request.page()).await },
                        move |result| Message::PageLoaded { request, result },
                    );
                }
                Effect::FetchDetails(product_id) => {
                    let catalog = self.caps.catalog.clone();
                    self.spawn_call(
                        async move { catalog.fetch_product_details(product_id).await },
                        move |result| Message::DetailsLoaded { product_id, result },
                    );
                }
                Effect::PageSettled(outcome) => self.settled = Some(outcome),
            }
        }
        page_started
    }

    /// Runs a collaborator call on its own task and posts the outcome back.
    ///
    /// A call that panics still reports back, as [`HttpError::Aborted`].
    fn spawn_call<T, F, M>(&self, call: F, into_message: M)
    where
        T: Send + 'static,
        F: Future<Output = Result<T, HttpError>> + Send + 'static,
        M: FnOnce(Result<T, HttpError>) -> Message + Send + 'static,
    {
        let tx = self.tx.clone();
        let call = tokio::spawn(call);
        tokio::spawn(async move {
            let result = match call.await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "collaborator call failed");
                    Err(HttpError::Aborted {
                        reason: e.to_string(),
                    })
                }
            };
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::Dispatch(into_message(result)));
            }
        });
    }
}
