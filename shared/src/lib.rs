// lib.rs - Product catalog shared core

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod app;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod favorites;
pub mod model;
pub mod product_details;
pub mod product_list;

pub use app::{
    CatalogApp, CatalogCore, DetailsView, Effect, Event, Message, Model, ProductRow,
    UserFacingError, ViewModel,
};
pub use capabilities::Capabilities;
pub use config::CatalogConfig;
pub use error::{CatalogError, ErrorKind, ErrorSeverity};
pub use favorites::FavoritesState;
pub use model::{LayoutMode, Product, ProductDetail, ProductId, ProductPage, UserId};
pub use product_details::ProductDetailsState;
pub use product_list::{PageRequest, ProductListState};

/// Page number the cursor starts at.
pub const FIRST_PAGE: u32 = 1;

/// User whose likes are tracked when the shell does not supply one.
pub const DEFAULT_USER_ID: &str = "user123";
