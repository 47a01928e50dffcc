mod http;
mod image;
mod kv;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite;

pub use self::http::{
    parse_product_detail, parse_product_page, CatalogApi, HttpCatalogClient, HttpError,
    HttpResponse, HttpResult, ValidatedUrl, DEFAULT_TIMEOUT_MS, MAX_RESPONSE_BODY_SIZE,
    MAX_TIMEOUT_MS, MAX_URL_LENGTH,
};
pub use self::image::{
    decode_image, CachedImageFetcher, HttpImageFetcher, Image, ImageError, ImageFetcher,
    ImageLimits,
};
pub use self::kv::{
    KeyValueStore, KvError, KvKey, KvLikeStore, KvOperation, KvOutput, KvResult, LikeStore,
    MemoryKvStore, StorageErrorCode, TypedKvStore, MAX_KEY_LENGTH, MAX_LIST_LIMIT, MAX_VALUE_SIZE,
};

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteKvStore;

use std::sync::Arc;

/// Collaborators injected into the core at construction.
#[derive(Clone)]
pub struct Capabilities {
    pub catalog: Arc<dyn CatalogApi>,
    pub likes: Arc<dyn LikeStore>,
    pub images: Arc<dyn ImageFetcher>,
}

impl Capabilities {
    pub fn new(
        catalog: Arc<dyn CatalogApi>,
        likes: Arc<dyn LikeStore>,
        images: Arc<dyn ImageFetcher>,
    ) -> Self {
        Self {
            catalog,
            likes,
            images,
        }
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use super::*;
    use crate::model::{ProductDetail, ProductId, ProductPage};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    /// Replays queued responses in call order; an exhausted script yields empty pages.
    #[derive(Default)]
    pub struct ScriptedCatalogApi {
        pages: Mutex<VecDeque<Result<ProductPage, HttpError>>>,
        details: Mutex<HashMap<ProductId, ProductDetail>>,
        requested: Mutex<Vec<u32>>,
        gate: Option<Semaphore>,
    }

    impl ScriptedCatalogApi {
        pub fn new() -> Self {
            Self::default()
        }

        /// Page requests wait until [`ScriptedCatalogApi::release`] lets them through.
        pub fn gated() -> Self {
            Self {
                gate: Some(Semaphore::new(0)),
                ..Self::default()
            }
        }

        pub fn release(&self, responses: usize) {
            if let Some(gate) = &self.gate {
                gate.add_permits(responses);
            }
        }

        pub fn push_page(&self, page: ProductPage) -> &Self {
            self.lock_pages().push_back(Ok(page));
            self
        }

        pub fn push_error(&self, error: HttpError) -> &Self {
            self.lock_pages().push_back(Err(error));
            self
        }

        pub fn insert_detail(&self, id: ProductId, detail: ProductDetail) -> &Self {
            self.details
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(id, detail);
            self
        }

        /// Pages requested so far, in order.
        pub fn requested_pages(&self) -> Vec<u32> {
            self.requested
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        }

        fn lock_pages(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<ProductPage, HttpError>>> {
            self.pages
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    #[async_trait::async_trait]
    impl CatalogApi for ScriptedCatalogApi {
        async fn fetch_products(&self, page: u32) -> Result<ProductPage, HttpError> {
            self.requested
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(page);
            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            self.lock_pages().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn fetch_product_details(&self, id: ProductId) -> Result<ProductDetail, HttpError> {
            self.details
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(&id)
                .cloned()
                .ok_or_else(|| HttpError::from_status(404, b"", "scripted"))
        }
    }

    pub struct NoImages;

    #[async_trait::async_trait]
    impl ImageFetcher for NoImages {
        async fn fetch_image(&self, _url: &str) -> Option<Image> {
            None
        }
    }

    pub fn connection_error() -> HttpError {
        HttpError::ConnectionError {
            host: "catalog.test".into(),
            message: "connection refused".into(),
        }
    }

    pub fn mock_capabilities(catalog: Arc<ScriptedCatalogApi>) -> Capabilities {
        Capabilities::new(
            catalog,
            Arc::new(KvLikeStore::new(MemoryKvStore::new())),
            Arc::new(NoImages),
        )
    }
}
