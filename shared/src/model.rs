use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(UserId);

/// Server-assigned product identifier.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ProductId(pub i64);

impl ProductId {
    /// Stand-in for products that arrive without an id.
    pub const UNSET: ProductId = ProductId(0);

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ProductId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// One entry of a product listing page. Every field is optional on the wire.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Product {
    #[serde(rename = "ProductId", alias = "productId", default)]
    pub id: Option<ProductId>,
    #[serde(rename = "DisplayName", alias = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(rename = "ImageUrl", alias = "imageUrl", default)]
    pub image_url: Option<String>,
}

impl Product {
    pub fn new(id: impl Into<Option<ProductId>>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: Some(display_name.into()),
            image_url: None,
        }
    }

    #[must_use]
    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    /// Id used for favorite lookups; absent ids collapse onto `ProductId::UNSET`.
    pub fn favorite_key(&self) -> ProductId {
        self.id.unwrap_or(ProductId::UNSET)
    }
}

/// Products returned by a single listing call, in server order.
pub type ProductPage = Vec<Product>;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ProductDetail {
    #[serde(rename = "ProductId", alias = "productId", default)]
    pub id: Option<ProductId>,
    #[serde(rename = "DisplayName", alias = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(rename = "Description", alias = "description", default)]
    pub description: Option<String>,
    #[serde(rename = "ImageUrl", alias = "imageUrl", default)]
    pub image_url: Option<String>,
    #[serde(rename = "Price", alias = "price", default)]
    pub price: Option<f64>,

    /// Fields the core does not interpret, kept for the shell.
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

#[derive(Default, Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum LayoutMode {
    #[default]
    List,
    Grid,
}

impl LayoutMode {
    #[must_use]
    pub fn toggled(self) -> Self {
        match self {
            Self::List => Self::Grid,
            Self::Grid => Self::List,
        }
    }

    pub fn columns(self) -> usize {
        match self {
            Self::List => 1,
            Self::Grid => 2,
        }
    }
}
