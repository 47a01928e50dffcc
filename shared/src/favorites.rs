use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::LikeStore;
use crate::error::CatalogError;
use crate::model::{ProductId, UserId};

/// In-memory mirror of the persisted like flags.
///
/// The store stays the source of truth: [`FavoritesState::is_favorited`] always asks
/// it, while the local sets only remember what toggles and hydration have observed so
/// the view can be projected without touching storage.
pub struct FavoritesState {
    store: Arc<dyn LikeStore>,
    favorited: HashMap<UserId, HashSet<ProductId>>,
}

impl FavoritesState {
    pub fn new(store: Arc<dyn LikeStore>) -> Self {
        Self {
            store,
            favorited: HashMap::new(),
        }
    }

    pub fn is_favorited(&self, product_id: ProductId, user_id: &UserId) -> Result<bool, CatalogError> {
        Ok(self.store.is_liked(product_id, user_id)?)
    }

    /// Flips the persisted flag and returns the new state. Last writer wins.
    #[instrument(skip_all, fields(user = %user_id, product = %product_id))]
    pub fn toggle_favorite(
        &mut self,
        product_id: ProductId,
        user_id: &UserId,
    ) -> Result<bool, CatalogError> {
        let was = self.store.is_liked(product_id, user_id)?;
        self.store.toggle_like(product_id, user_id)?;
        let now = self.store.is_liked(product_id, user_id)?;
        if now == was {
            warn!(liked = now, "like store did not flip state");
        }

        self.remember(product_id, user_id, now);
        info!(liked = now, "favorite toggled");
        Ok(now)
    }

    /// Reads the persisted flag of each product into the cached set.
    ///
    /// Products looked up before a failing read keep their refreshed flag.
    #[instrument(skip_all, fields(user = %user_id))]
    pub fn refresh<I>(&mut self, product_ids: I, user_id: &UserId) -> Result<usize, CatalogError>
    where
        I: IntoIterator<Item = ProductId>,
    {
        let mut checked = 0;
        for product_id in product_ids {
            let liked = self.store.is_liked(product_id, user_id)?;
            self.remember(product_id, user_id, liked);
            checked += 1;
        }
        debug!(checked, "favorites refreshed");
        Ok(checked)
    }

    fn remember(&mut self, product_id: ProductId, user_id: &UserId, liked: bool) {
        let set = self.favorited.entry(user_id.clone()).or_default();
        if liked {
            set.insert(product_id);
        } else {
            set.remove(&product_id);
        }
    }

    /// Cached membership, used for rendering.
    pub fn contains(&self, product_id: ProductId, user_id: &UserId) -> bool {
        self.favorited
            .get(user_id)
            .is_some_and(|set| set.contains(&product_id))
    }

    /// Replaces the cached set for `user_id` with everything persisted.
    #[instrument(skip_all, fields(user = %user_id))]
    pub fn hydrate(&mut self, user_id: &UserId) -> Result<usize, CatalogError> {
        let liked: HashSet<ProductId> = self.store.liked_products(user_id)?.into_iter().collect();
        let count = liked.len();
        self.favorited.insert(user_id.clone(), liked);
        info!(count, "favorites hydrated");
        Ok(count)
    }

    pub fn favorited_ids(&self, user_id: &UserId) -> Vec<ProductId> {
        let mut ids: Vec<_> = self
            .favorited
            .get(user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for FavoritesState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FavoritesState")
            .field("favorited", &self.favorited)
            .finish_non_exhaustive()
    }
}
