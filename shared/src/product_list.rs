//! Accumulated product listing and its page cursor.
//!
//! The cursor only moves after a page request succeeds, and products are only ever
//! appended. A page request is either driven end to end with
//! [`ProductListState::fetch_next_page`] or split into [`ProductListState::begin_fetch`]
//! and [`ProductListState::complete_fetch`] when the network call runs elsewhere and the
//! result is delivered back later.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::capabilities::{CatalogApi, HttpError};
use crate::error::CatalogError;
use crate::model::{Product, ProductPage};
use crate::FIRST_PAGE;

/// Ticket for one outstanding page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    page: u32,
}

impl PageRequest {
    pub fn page(self) -> u32 {
        self.page
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductListState {
    products: Vec<Product>,
    current_page: u32,
    in_flight: Option<u32>,
}

impl Default for ProductListState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductListState {
    pub fn new() -> Self {
        Self {
            products: Vec::new(),
            current_page: FIRST_PAGE,
            in_flight: None,
        }
    }

    /// Next page to request.
    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn count(&self) -> usize {
        self.products.len()
    }

    /// # Panics
    ///
    /// Panics if `index >= self.count()`. Callers own the bounds check.
    pub fn item_at(&self, index: usize) -> &Product {
        match self.products.get(index) {
            Some(product) => product,
            None => panic!(
                "product index {index} out of range for {} products",
                self.products.len()
            ),
        }
    }

    pub fn get(&self, index: usize) -> Option<&Product> {
        self.products.get(index)
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Marks the current page as in flight. `None` while another request is outstanding.
    pub fn begin_fetch(&mut self) -> Option<PageRequest> {
        if let Some(page) = self.in_flight {
            warn!(page, "page fetch already in flight");
            return None;
        }
        self.in_flight = Some(self.current_page);
        Some(PageRequest {
            page: self.current_page,
        })
    }

    /// Applies the outcome of `request`. Returns how many products were appended.
    ///
    /// A request that no longer matches the cursor is rejected without touching state.
    pub fn complete_fetch(
        &mut self,
        request: PageRequest,
        result: Result<ProductPage, HttpError>,
    ) -> Result<usize, CatalogError> {
        if request.page != self.current_page || self.in_flight != Some(request.page) {
            warn!(
                expected = self.current_page,
                got = request.page,
                "ignoring stale page response"
            );
            return Err(CatalogError::StalePage {
                expected: self.current_page,
                got: request.page,
            });
        }
        self.in_flight = None;

        match result {
            Ok(page) => {
                let appended = page.len();
                self.products.extend(page);
                self.current_page += 1;
                info!(
                    page = request.page,
                    appended,
                    total = self.products.len(),
                    "page appended"
                );
                Ok(appended)
            }
            Err(e) => {
                warn!(page = request.page, error = %e, "page fetch failed");
                Err(e.into())
            }
        }
    }

    /// Releases the in-flight marker of a request that will never complete.
    ///
    /// Returns `false` when `request` is not the outstanding one.
    pub fn abort_fetch(&mut self, request: PageRequest) -> bool {
        if self.in_flight != Some(request.page) {
            return false;
        }
        self.in_flight = None;
        warn!(page = request.page, "page fetch abandoned");
        true
    }

    /// Fetches the page at the cursor and appends it.
    ///
    /// Dropping the returned future before it resolves leaves the cursor where it was
    /// and allows the same page to be requested again.
    #[instrument(skip_all, fields(page = self.current_page))]
    pub async fn fetch_next_page<A>(&mut self, api: &A) -> Result<usize, CatalogError>
    where
        A: CatalogApi + ?Sized,
    {
        let request = self.begin_fetch().ok_or(CatalogError::FetchInFlight {
            page: self.current_page,
        })?;
        let mut pending = PendingFetch {
            list: self,
            request,
        };
        let result = api.fetch_products(request.page).await;
        pending.complete(result)
    }
}

/// Clears the in-flight marker unless the request was completed.
struct PendingFetch<'a> {
    list: &'a mut ProductListState,
    request: PageRequest,
}

impl PendingFetch<'_> {
    fn complete(&mut self, result: Result<ProductPage, HttpError>) -> Result<usize, CatalogError> {
        self.list.complete_fetch(self.request, result)
    }
}

impl Drop for PendingFetch<'_> {
    fn drop(&mut self) {
        self.list.abort_fetch(self.request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{connection_error, ScriptedCatalogApi};
    use crate::model::ProductId;
    use proptest::prelude::*;

    fn page(ids: impl IntoIterator<Item = i64>) -> ProductPage {
        ids.into_iter()
            .map(|id| Product::new(ProductId(id), format!("Product {id}")))
            .collect()
    }

    #[test]
    fn starts_empty_at_first_page() {
        let list = ProductListState::new();
        assert_eq!(list.count(), 0);
        assert_eq!(list.current_page(), 1);
        assert!(!list.is_loading());
    }

    #[tokio::test]
    async fn two_pages_accumulate() {
        let api = ScriptedCatalogApi::new();
        api.push_page(page([1, 2])).push_page(page([3, 4, 5]));
        let mut list = ProductListState::new();

        assert_eq!(list.fetch_next_page(&api).await.unwrap(), 2);
        assert_eq!(list.fetch_next_page(&api).await.unwrap(), 3);

        assert_eq!(list.count(), 5);
        assert_eq!(list.current_page(), 3);
        assert_eq!(api.requested_pages(), vec![1, 2]);
        let ids: Vec<_> = list.products().iter().map(|p| p.id).collect();
        assert_eq!(ids, [1, 2, 3, 4, 5].map(|id| Some(ProductId(id))));
    }

    #[tokio::test]
    async fn failure_leaves_state_and_retry_requests_same_page() {
        let api = ScriptedCatalogApi::new();
        api.push_error(connection_error()).push_page(page([10, 11]));
        let mut list = ProductListState::new();

        let err = list.fetch_next_page(&api).await.unwrap_err();
        assert!(matches!(err, CatalogError::Network(HttpError::ConnectionError { .. })));
        assert_eq!(list.count(), 0);
        assert_eq!(list.current_page(), 1);
        assert!(!list.is_loading());

        assert_eq!(list.fetch_next_page(&api).await.unwrap(), 2);
        assert_eq!(list.count(), 2);
        assert_eq!(list.current_page(), 2);
        assert_eq!(api.requested_pages(), vec![1, 1]);
    }

    #[tokio::test]
    async fn empty_page_still_advances_cursor() {
        let api = ScriptedCatalogApi::new();
        api.push_page(Vec::new());
        let mut list = ProductListState::new();

        assert_eq!(list.fetch_next_page(&api).await.unwrap(), 0);
        assert_eq!(list.count(), 0);
        assert_eq!(list.current_page(), 2);
    }

    struct Hung;

    #[async_trait::async_trait]
    impl CatalogApi for Hung {
        async fn fetch_products(&self, _page: u32) -> Result<ProductPage, HttpError> {
            std::future::pending().await
        }

        async fn fetch_product_details(
            &self,
            _id: ProductId,
        ) -> Result<crate::model::ProductDetail, HttpError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn cancelled_fetch_releases_the_page() {
        let mut list = ProductListState::new();
        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            list.fetch_next_page(&Hung),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(!list.is_loading());
        assert_eq!(list.current_page(), 1);

        let api = ScriptedCatalogApi::new();
        api.push_page(page([1, 2]));
        assert_eq!(list.fetch_next_page(&api).await.unwrap(), 2);
        assert_eq!(api.requested_pages(), vec![1]);
    }

    #[test]
    fn abort_only_releases_the_outstanding_request() {
        let mut list = ProductListState::new();
        let first = list.begin_fetch().unwrap();
        list.complete_fetch(first, Ok(page([1]))).unwrap();

        let second = list.begin_fetch().unwrap();
        assert!(!list.abort_fetch(first));
        assert!(list.is_loading());

        assert!(list.abort_fetch(second));
        assert!(!list.is_loading());
        assert_eq!(list.current_page(), 2);
        assert_eq!(list.begin_fetch(), Some(second));
    }

    #[test]
    fn second_begin_is_rejected_while_in_flight() {
        let mut list = ProductListState::new();
        let request = list.begin_fetch().unwrap();
        assert!(list.is_loading());
        assert!(list.begin_fetch().is_none());

        list.complete_fetch(request, Ok(page([1]))).unwrap();
        assert!(!list.is_loading());
        assert_eq!(list.begin_fetch().map(PageRequest::page), Some(2));
    }

    #[test]
    fn stale_completion_is_ignored() {
        let mut list = ProductListState::new();
        let first = list.begin_fetch().unwrap();
        list.complete_fetch(first, Ok(page([1]))).unwrap();

        let err = list.complete_fetch(first, Ok(page([1]))).unwrap_err();
        assert!(matches!(err, CatalogError::StalePage { expected: 2, got: 1 }));
        assert_eq!(list.count(), 1);
        assert_eq!(list.current_page(), 2);
    }

    #[test]
    fn duplicates_across_pages_are_kept() {
        let mut list = ProductListState::new();
        let r = list.begin_fetch().unwrap();
        list.complete_fetch(r, Ok(page([1, 2]))).unwrap();
        let r = list.begin_fetch().unwrap();
        list.complete_fetch(r, Ok(page([2, 3]))).unwrap();
        assert_eq!(list.count(), 4);
        assert_eq!(list.item_at(1).id, list.item_at(2).id);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn item_at_out_of_range_panics() {
        let list = ProductListState::new();
        let _ = list.item_at(0);
    }

    #[test]
    fn get_is_the_checked_variant() {
        let mut list = ProductListState::new();
        let r = list.begin_fetch().unwrap();
        list.complete_fetch(r, Ok(page([5]))).unwrap();
        assert_eq!(list.get(0).and_then(|p| p.id), Some(ProductId(5)));
        assert!(list.get(1).is_none());
    }

    fn outcome() -> impl Strategy<Value = Result<usize, ()>> {
        prop_oneof![
            3 => (0usize..6).prop_map(Ok),
            1 => Just(Err(())),
        ]
    }

    proptest! {
        #[test]
        fn cursor_and_count_track_successes(outcomes in prop::collection::vec(outcome(), 0..20)) {
            let mut list = ProductListState::new();
            let mut expected_count = 0usize;
            let mut successes = 0u32;
            let mut next_id = 0i64;

            for outcome in outcomes {
                let before = (list.count(), list.current_page());
                let request = list.begin_fetch().unwrap();
                prop_assert_eq!(request.page(), before.1);

                match outcome {
                    Ok(size) => {
                        let products = page(next_id..next_id + size as i64);
                        next_id += size as i64;
                        prop_assert_eq!(list.complete_fetch(request, Ok(products)).unwrap(), size);
                        expected_count += size;
                        successes += 1;
                    }
                    Err(()) => {
                        prop_assert!(list.complete_fetch(request, Err(connection_error())).is_err());
                        prop_assert_eq!((list.count(), list.current_page()), before);
                    }
                }

                prop_assert_eq!(list.count(), expected_count);
                prop_assert_eq!(list.current_page(), 1 + successes);
            }

            // Append-only: ids appear in arrival order.
            let ids: Vec<i64> = list.products().iter().filter_map(|p| p.id).map(ProductId::get).collect();
            prop_assert_eq!(ids, (0..next_id).collect::<Vec<_>>());
        }
    }
}
