use tracing::{info, warn};

use crate::capabilities::HttpError;
use crate::error::CatalogError;
use crate::model::{ProductDetail, ProductId};

/// Detail record for the product the user navigated to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductDetailsState {
    requested: Option<ProductId>,
    detail: Option<ProductDetail>,
    loading: bool,
}

impl ProductDetailsState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&self) -> Option<ProductId> {
        self.requested
    }

    pub fn detail(&self) -> Option<&ProductDetail> {
        self.detail.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Starts loading `product_id`. A later `begin` supersedes earlier ones.
    pub fn begin(&mut self, product_id: ProductId) {
        if self.requested != Some(product_id) {
            self.detail = None;
        }
        self.requested = Some(product_id);
        self.loading = true;
    }

    /// Applies a response. Responses for anything but the latest request are dropped;
    /// a failure keeps whatever detail was already shown.
    pub fn complete(
        &mut self,
        product_id: ProductId,
        result: Result<ProductDetail, HttpError>,
    ) -> Result<(), CatalogError> {
        if self.requested != Some(product_id) {
            warn!(%product_id, "ignoring detail for product no longer selected");
            return Ok(());
        }
        self.loading = false;

        match result {
            Ok(detail) => {
                info!(%product_id, "product detail loaded");
                self.detail = Some(detail);
                Ok(())
            }
            Err(e) => {
                warn!(%product_id, error = %e, "product detail failed");
                Err(e.into())
            }
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
