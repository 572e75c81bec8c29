//! Internal utilities to support testing.
use std::{
    future::IntoFuture,
    net::{Ipv4Addr, SocketAddr},
};

use axum::Router;
use tokio::sync::oneshot;
use tracing::{debug, error};
use url::Url;

/// A drop guard to clean up test infrastructure.
///
/// After dropping the test infrastructure will asynchronously shutdown and release its
/// resources.
// Nightly sees the sender as dead code currently, but we only rely on Drop of the
// sender.
#[derive(Debug)]
#[allow(dead_code)]
pub struct CleanupDropGuard(pub(crate) oneshot::Sender<()>);

/// A content server on localhost, serving the given routes until dropped.
#[derive(Debug)]
pub struct ContentServer {
    url: Url,
    _drop_guard: CleanupDropGuard,
}

impl ContentServer {
    pub async fn spawn(app: Router) -> std::io::Result<Self> {
        let bind_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        let bound_addr = listener.local_addr()?;
        let url: Url = format!("http://{bound_addr}")
            .parse()
            .expect("valid url");

        let (tx, mut rx) = oneshot::channel();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app);
            tokio::select! {
                _ = &mut rx => {
                    debug!("shutting down content server");
                }
                res = serve.into_future() => {
                    if let Err(e) = res {
                        error!("content server error: {e:?}");
                    }
                }
            }
        });
        Ok(Self {
            url,
            _drop_guard: CleanupDropGuard(tx),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// A valid deployment as served by `/pointer-changes` and in snapshot files.
pub fn deployment_json(local_timestamp: u64) -> serde_json::Value {
    serde_json::json!({
        "entityId": format!("entity-{local_timestamp}"),
        "entityType": "profile",
        "localTimestamp": local_timestamp,
        "authChain": [],
        "pointers": [format!("0x{local_timestamp:040x}")],
    })
}
