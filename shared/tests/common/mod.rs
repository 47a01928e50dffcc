#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use catalog_core::capabilities::testing::{NoImages, ScriptedCatalogApi};
use catalog_core::capabilities::{Capabilities, KvLikeStore, LikeStore, MemoryKvStore};
use catalog_core::{Product, ProductId, ProductPage, ViewModel};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn products(ids: impl IntoIterator<Item = i64>) -> ProductPage {
    ids.into_iter()
        .map(|id| Product::new(ProductId(id), format!("Product {id}")))
        .collect()
}

/// A scripted catalog serving `pages` in order.
pub fn catalog(pages: impl IntoIterator<Item = ProductPage>) -> Arc<ScriptedCatalogApi> {
    let catalog = ScriptedCatalogApi::new();
    for page in pages {
        catalog.push_page(page);
    }
    Arc::new(catalog)
}

pub fn capabilities(catalog: Arc<ScriptedCatalogApi>) -> Capabilities {
    capabilities_with_likes(catalog, Arc::new(KvLikeStore::new(MemoryKvStore::new())))
}

pub fn capabilities_with_likes(
    catalog: Arc<ScriptedCatalogApi>,
    likes: Arc<dyn LikeStore>,
) -> Capabilities {
    Capabilities::new(catalog, likes, Arc::new(NoImages))
}

/// Waits until the published view satisfies `ready`.
pub async fn wait_for_view(
    rx: &mut watch::Receiver<ViewModel>,
    ready: impl FnMut(&ViewModel) -> bool,
) -> ViewModel {
    let view = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(ready))
        .await
        .expect("view never reached expected state")
        .expect("core stopped");
    ViewModel::clone(&view)
}

/// Minimal HTTP/1.1 server answering GETs from a path -> (status, content type, body) table.
pub struct TestServer {
    pub base_url: String,
    hits: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    pub async fn start(routes: HashMap<String, (u16, &'static str, Vec<u8>)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let routes = Arc::new(routes);

        let server_hits = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let routes = routes.clone();
                let hits = server_hits.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let request = String::from_utf8_lossy(&buf);
                    let path = request
                        .lines()
                        .next()
                        .and_then(|line| line.split_whitespace().nth(1))
                        .unwrap_or("/")
                        .to_string();
                    hits.lock().unwrap().push(path.clone());

                    let (status, content_type, body) = routes
                        .get(&path)
                        .cloned()
                        .unwrap_or((404, "text/plain", b"not found".to_vec()));
                    let head = format!(
                        "HTTP/1.1 {status} X\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            hits,
        }
    }

    pub fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }
}
