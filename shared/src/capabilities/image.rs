use bytes::Bytes;
use image::{ImageFormat, ImageReader, Limits};
use lru::LruCache;
use std::io::Cursor;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, instrument};

use super::http::{build_client, send_get, HttpError, ValidatedUrl, MAX_TIMEOUT_MS};
use crate::config::CatalogConfig;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to decode image: {source}")]
    Decode {
        #[from]
        source: image::ImageError,
    },

    #[error("image fetch failed: {0}")]
    Http(#[from] HttpError),

    #[error("input bytes empty")]
    EmptyInput,

    #[error("input too large: {size} bytes, max {max_size}")]
    InputTooLarge { size: usize, max_size: usize },

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("decode task failed")]
    TaskFailed,
}

#[derive(Clone, Debug)]
pub struct ImageLimits {
    pub max_input_bytes: usize,
    pub max_dimension: u32,
    pub max_alloc_bytes: u64,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_input_bytes: 10 * 1024 * 1024,
            max_dimension: 4096,
            max_alloc_bytes: 100 * 1024 * 1024,
        }
    }
}

impl From<&CatalogConfig> for ImageLimits {
    fn from(config: &CatalogConfig) -> Self {
        Self {
            max_input_bytes: config.max_image_bytes,
            max_dimension: config.max_image_dimension,
            ..Self::default()
        }
    }
}

/// Encoded image bytes that are known to decode, plus their dimensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    bytes: Bytes,
    format: ImageFormat,
    width: u32,
    height: u32,
}

impl Image {
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// Validates that `bytes` decode under `limits` and records format and size.
pub fn decode_image(bytes: Bytes, limits: &ImageLimits) -> Result<Image, ImageError> {
    if bytes.is_empty() {
        return Err(ImageError::EmptyInput);
    }
    if bytes.len() > limits.max_input_bytes {
        return Err(ImageError::InputTooLarge {
            size: bytes.len(),
            max_size: limits.max_input_bytes,
        });
    }

    let mut reader = ImageReader::new(Cursor::new(bytes.as_ref()))
        .with_guessed_format()
        .map_err(|e| ImageError::Decode { source: e.into() })?;
    let format = reader.format().ok_or(ImageError::UnsupportedFormat)?;

    let mut decode_limits = Limits::default();
    decode_limits.max_image_width = Some(limits.max_dimension);
    decode_limits.max_image_height = Some(limits.max_dimension);
    decode_limits.max_alloc = Some(limits.max_alloc_bytes);
    reader.limits(decode_limits);

    let decoded = reader.decode()?;
    let (width, height) = (decoded.width(), decoded.height());

    Ok(Image {
        bytes,
        format,
        width,
        height,
    })
}

/// Loads product images. Every failure collapses to `None`.
#[async_trait::async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch_image(&self, url: &str) -> Option<Image>;
}

pub struct HttpImageFetcher {
    client: reqwest::Client,
    limits: ImageLimits,
    timeout_ms: u64,
    allow_private_hosts: bool,
    semaphore: Arc<Semaphore>,
}

impl HttpImageFetcher {
    pub fn new(config: &CatalogConfig) -> Result<Self, HttpError> {
        let timeout_ms = config.request_timeout_ms.clamp(1, MAX_TIMEOUT_MS);
        Ok(Self {
            client: build_client(Duration::from_millis(timeout_ms))?,
            limits: ImageLimits::from(config),
            timeout_ms,
            allow_private_hosts: config.allow_private_hosts,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_image_fetches.max(1))),
        })
    }

    /// Same as [`ImageFetcher::fetch_image`] but keeps the failure reason.
    #[instrument(skip(self))]
    pub async fn try_fetch(&self, url: &str) -> Result<Image, ImageError> {
        let url = ValidatedUrl::with_policy(url, self.allow_private_hosts)?;
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ImageError::TaskFailed)?;

        let response = send_get(
            &self.client,
            url.as_url(),
            self.timeout_ms,
            self.limits.max_input_bytes,
        )
        .await?;

        let limits = self.limits.clone();
        let body = response.into_body();
        tokio::task::spawn_blocking(move || decode_image(body, &limits))
            .await
            .map_err(|_| ImageError::TaskFailed)?
    }
}

#[async_trait::async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch_image(&self, url: &str) -> Option<Image> {
        match self.try_fetch(url).await {
            Ok(image) => Some(image),
            Err(e) => {
                debug!(%url, error = %e, "image unavailable");
                None
            }
        }
    }
}

/// Bounded LRU cache in front of another fetcher. Misses are not cached.
pub struct CachedImageFetcher<F> {
    inner: F,
    cache: Mutex<LruCache<String, Image>>,
}

impl<F: ImageFetcher> CachedImageFetcher<F> {
    pub fn new(inner: F, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn contains(&self, url: &str) -> bool {
        self.cache.lock().await.contains(url)
    }

    pub async fn clear(&self) {
        self.cache.lock().await.clear();
    }
}

#[async_trait::async_trait]
impl<F: ImageFetcher> ImageFetcher for CachedImageFetcher<F> {
    async fn fetch_image(&self, url: &str) -> Option<Image> {
        if let Some(hit) = self.cache.lock().await.get(url) {
            return Some(hit.clone());
        }

        // Lock released while fetching; concurrent misses may fetch twice.
        let image = self.inner.fetch_image(url).await?;
        if let Some((evicted, _)) = self
            .cache
            .lock()
            .await
            .push(url.to_string(), image.clone())
            .filter(|(k, _)| k != url)
        {
            debug!(%evicted, "image evicted from cache");
        }
        Some(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbaImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn png(width: u32, height: u32) -> Bytes {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(width, height));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        Bytes::from(buf.into_inner())
    }

    struct CountingFetcher {
        calls: AtomicUsize,
        image: Option<Image>,
    }

    #[async_trait::async_trait]
    impl ImageFetcher for CountingFetcher {
        async fn fetch_image(&self, _url: &str) -> Option<Image> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.image.clone()
        }
    }

    fn counting(image: Option<Image>) -> CountingFetcher {
        CountingFetcher {
            calls: AtomicUsize::new(0),
            image,
        }
    }

    #[test]
    fn decodes_png_and_reports_dimensions() {
        let image = decode_image(png(3, 2), &ImageLimits::default()).unwrap();
        assert_eq!(image.format(), ImageFormat::Png);
        assert_eq!((image.width(), image.height()), (3, 2));
    }

    #[test]
    fn rejects_empty_and_garbage_input() {
        let limits = ImageLimits::default();
        assert!(matches!(
            decode_image(Bytes::new(), &limits),
            Err(ImageError::EmptyInput)
        ));
        assert!(decode_image(Bytes::from_static(b"definitely not an image"), &limits).is_err());
    }

    #[test]
    fn rejects_oversized_input() {
        let limits = ImageLimits {
            max_input_bytes: 8,
            ..ImageLimits::default()
        };
        assert!(matches!(
            decode_image(png(2, 2), &limits),
            Err(ImageError::InputTooLarge { .. })
        ));
    }

    #[test]
    fn rejects_dimensions_over_limit() {
        let limits = ImageLimits {
            max_dimension: 4,
            ..ImageLimits::default()
        };
        assert!(matches!(
            decode_image(png(8, 2), &limits),
            Err(ImageError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_url_yields_none() {
        let fetcher = HttpImageFetcher::new(&CatalogConfig::default()).unwrap();
        assert!(fetcher.fetch_image("").await.is_none());
        assert!(fetcher.fetch_image("ftp://cdn.example.com/a.png").await.is_none());
        assert!(matches!(
            fetcher.try_fetch("http://localhost/a.png").await,
            Err(ImageError::Http(HttpError::PrivateNetworkBlocked { .. }))
        ));
    }

    #[tokio::test]
    async fn cache_serves_repeat_requests() {
        let image = decode_image(png(1, 1), &ImageLimits::default()).unwrap();
        let cached = CachedImageFetcher::new(counting(Some(image.clone())), 4);

        assert_eq!(cached.fetch_image("https://cdn.example.com/1.png").await, Some(image.clone()));
        assert_eq!(cached.fetch_image("https://cdn.example.com/1.png").await, Some(image));
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_evicts_least_recently_used() {
        let image = decode_image(png(1, 1), &ImageLimits::default()).unwrap();
        let cached = CachedImageFetcher::new(counting(Some(image)), 2);

        cached.fetch_image("a").await;
        cached.fetch_image("b").await;
        cached.fetch_image("a").await;
        cached.fetch_image("c").await;

        assert_eq!(cached.len().await, 2);
        assert!(cached.contains("a").await);
        assert!(!cached.contains("b").await);
        assert!(cached.contains("c").await);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cached = CachedImageFetcher::new(counting(None), 2);
        assert!(cached.fetch_image("x").await.is_none());
        assert!(cached.fetch_image("x").await.is_none());
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cached.len().await, 0);
    }
}
