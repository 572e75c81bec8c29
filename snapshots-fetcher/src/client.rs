//! HTTP client for the content server protocol.
//!
//! Endpoints used, relative to a server's base url:
//!
//! - `GET /snapshot`: the current [`SnapshotDescriptor`].
//! - `GET /contents/{hash}`: raw content, optionally gzip encoded.
//! - `GET /pointer-changes?sortingOrder=ASC&sortingField=local_timestamp&from={ts}`: a page of
//!   deployments, with an optional relative `pagination.next` cursor.
//! - `GET /deployments?entityId={id}&fields=auditInfo,content`: the [`EntityManifest`] of an
//!   entity.
use std::{io::Write, path::Path, sync::Arc, time::Duration};

use async_stream::try_stream;
use flate2::write::GzDecoder;
use n0_future::Stream;
use nested_enum_utils::common_fields;
use reqwest::{
    StatusCode,
    header::{CONTENT_ENCODING, LOCATION},
    redirect::Policy,
};
use serde::de::DeserializeOwned;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu, ensure};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};
use url::Url;

use crate::{
    metrics::Metrics,
    types::{DeploymentsResponse, EntityManifest, PointerChangesPage, SnapshotDescriptor},
};

/// Maximum number of redirects followed for a single request.
pub const MAX_REDIRECTS: usize = 10;

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum FetchError {
    #[snafu(display("Failed to build http client"))]
    Client { source: reqwest::Error },
    #[snafu(display("Request to {url} failed"))]
    Request { url: Url, source: reqwest::Error },
    #[snafu(display("Request to {url} failed with status {status}"))]
    Status { url: Url, status: u16 },
    #[snafu(display("Too many redirects requesting {url}"))]
    TooManyRedirects { url: Url },
    #[snafu(display("Redirect from {url} without location"))]
    MissingLocation { url: Url },
    #[snafu(display("Failed to read response body"))]
    Body { source: reqwest::Error },
    #[snafu(display("Failed to decompress response body"))]
    Decode { source: std::io::Error },
    #[snafu(display("Invalid json response"))]
    Json { source: serde_json::Error },
    #[snafu(display("Invalid url"))]
    InvalidUrl { source: url::ParseError },
    #[snafu(display("Failed to write file"))]
    Io { source: std::io::Error },
}

impl FetchError {
    /// The http status code, if the server answered with an unhandled status.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Client for the content server protocol.
///
/// Cheaply cloneable, clones share the connection pool.
#[derive(Debug, Clone)]
pub struct ContentClient {
    http: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl ContentClient {
    /// Creates a client without a request timeout.
    pub fn new(metrics: Arc<Metrics>) -> Result<Self, FetchError> {
        Self::build(None, metrics)
    }

    /// Creates a client whose requests fail after `timeout`.
    pub fn with_timeout(timeout: Duration, metrics: Arc<Metrics>) -> Result<Self, FetchError> {
        Self::build(Some(timeout), metrics)
    }

    fn build(timeout: Option<Duration>, metrics: Arc<Metrics>) -> Result<Self, FetchError> {
        // redirects are followed by hand, to cap and log them
        let mut builder = reqwest::Client::builder().redirect(Policy::none());
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context(ClientSnafu)?;
        Ok(Self { http, metrics })
    }

    /// The metrics this client reports to.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Issues a `GET`, following up to [`MAX_REDIRECTS`] `301`/`302` redirects.
    ///
    /// Any other status `>= 300` is an error.
    async fn get(&self, url: Url) -> Result<reqwest::Response, FetchError> {
        let mut url = url;
        let mut redirects = 0;
        loop {
            let response = self
                .http
                .get(url.clone())
                .send()
                .await
                .context(RequestSnafu { url: url.clone() })?;
            let status = response.status();
            if status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND {
                ensure!(redirects < MAX_REDIRECTS, TooManyRedirectsSnafu { url });
                redirects += 1;
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .context(MissingLocationSnafu { url: url.clone() })?;
                let next = url.join(location).context(InvalidUrlSnafu)?;
                trace!(from = %url, to = %next, redirects, "following redirect");
                url = next;
                continue;
            }
            ensure!(
                status.as_u16() < 300,
                StatusSnafu {
                    url,
                    status: status.as_u16()
                }
            );
            return Ok(response);
        }
    }

    /// Fetches and deserializes a json document.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, FetchError> {
        let response = self.get(url).await?;
        let body = response.bytes().await.context(BodySnafu)?;
        serde_json::from_slice(&body).context(JsonSnafu)
    }

    /// Fetches the descriptor of the server's current snapshot.
    pub async fn global_snapshot(&self, server: &Url) -> Result<SnapshotDescriptor, FetchError> {
        self.fetch_json(endpoint(server, "snapshot")?).await
    }

    /// Streams the raw deltas of the change feed, starting inclusively at `from`.
    ///
    /// Follows the `pagination.next` cursor of every page, resolved against the url of the
    /// page it came from, until a page has none. Each page is only requested once the
    /// previous one has been consumed.
    pub fn pointer_changes(
        &self,
        server: &Url,
        from: u64,
    ) -> impl Stream<Item = Result<serde_json::Value, FetchError>> + Send + 'static {
        let this = self.clone();
        let first = pointer_changes_url(server, from);
        try_stream! {
            let mut next = Some(first?);
            while let Some(url) = next.take() {
                this.metrics.pointer_changes_requests.inc();
                debug!(%url, "requesting pointer changes");
                let page: PointerChangesPage = this.fetch_json(url.clone()).await?;
                for delta in page.deltas {
                    yield delta;
                }
                if let Some(cursor) = page.pagination.and_then(|p| p.next) {
                    next = Some(url.join(&cursor).context(InvalidUrlSnafu)?);
                }
            }
        }
    }

    /// Resolves the manifest of an entity, `None` if the server does not know it.
    pub async fn entity_manifest(
        &self,
        server: &Url,
        entity_id: &str,
    ) -> Result<Option<EntityManifest>, FetchError> {
        let mut url = endpoint(server, "deployments")?;
        url.query_pairs_mut()
            .append_pair("entityId", entity_id)
            .append_pair("fields", "auditInfo,content");
        let response: DeploymentsResponse = self.fetch_json(url).await?;
        Ok(response.deployments.into_iter().next())
    }

    /// Downloads `/contents/{hash}` of `server` into the file at `dest`.
    ///
    /// See [`ContentClient::download_to_file`].
    pub async fn download_content(
        &self,
        server: &Url,
        hash: &str,
        dest: &Path,
    ) -> Result<u64, FetchError> {
        let url = endpoint(server, &format!("contents/{hash}"))?;
        self.download_to_file(url, dest).await
    }

    /// Downloads `url` into a new file at `dest` and returns the number of bytes written.
    ///
    /// Gzip encoded responses are inflated while streaming. The file is made
    /// non-executable once complete.
    pub async fn download_to_file(&self, url: Url, dest: &Path) -> Result<u64, FetchError> {
        let mut response = self.get(url).await?;
        let gzip = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("gzip"));

        let mut file = tokio::fs::File::create(dest).await.context(IoSnafu)?;
        let mut decoder = gzip.then(|| GzDecoder::new(Vec::new()));
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.context(BodySnafu)? {
            match decoder.as_mut() {
                Some(decoder) => {
                    decoder.write_all(&chunk).context(DecodeSnafu)?;
                    let inflated = std::mem::take(decoder.get_mut());
                    file.write_all(&inflated).await.context(IoSnafu)?;
                    written += inflated.len() as u64;
                }
                None => {
                    file.write_all(&chunk).await.context(IoSnafu)?;
                    written += chunk.len() as u64;
                }
            }
        }
        if let Some(decoder) = decoder {
            let rest = decoder.finish().context(DecodeSnafu)?;
            file.write_all(&rest).await.context(IoSnafu)?;
            written += rest.len() as u64;
        }
        file.flush().await.context(IoSnafu)?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o644))
                .await
                .context(IoSnafu)?;
        }
        trace!(dest = %dest.display(), written, gzip, "downloaded file");
        Ok(written)
    }
}

/// Appends `path` to the server's base url, keeping any path the base url already has.
pub(crate) fn endpoint(server: &Url, path: &str) -> Result<Url, FetchError> {
    let base = server.as_str().trim_end_matches('/');
    Url::parse(&format!("{base}/{path}")).context(InvalidUrlSnafu)
}

fn pointer_changes_url(server: &Url, from: u64) -> Result<Url, FetchError> {
    let mut url = endpoint(server, "pointer-changes")?;
    url.query_pairs_mut()
        .append_pair("sortingOrder", "ASC")
        .append_pair("sortingField", "local_timestamp")
        .append_pair("from", &from.to_string());
    Ok(url)
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use axum::{
        Router,
        extract::{Query, State},
        http::{HeaderMap, StatusCode, header},
        response::IntoResponse,
        routing::get,
    };
    use flate2::{Compression, write::GzEncoder};
    use n0_future::StreamExt;
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::test_utils::{ContentServer, deployment_json};

    fn client() -> ContentClient {
        ContentClient::new(Default::default()).unwrap()
    }

    #[test]
    fn endpoint_keeps_base_path() {
        let server: Url = "https://peer.example/content/".parse().unwrap();
        assert_eq!(
            endpoint(&server, "snapshot").unwrap().as_str(),
            "https://peer.example/content/snapshot"
        );
        let url = pointer_changes_url(&"http://localhost:1".parse().unwrap(), 9).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:1/pointer-changes?sortingOrder=ASC&sortingField=local_timestamp&from=9"
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn pointer_changes_follows_pagination() {
        let app = Router::new().route(
            "/pointer-changes",
            get(|Query(query): Query<std::collections::HashMap<String, String>>| async move {
                match query.get("from").map(String::as_str) {
                    Some("9") => axum::Json(json!({
                        "deltas": [deployment_json(10), deployment_json(11)],
                        "pagination": { "next": "?from=11&entityId=x" },
                    })),
                    Some("11") if query.get("entityId").is_some() => axum::Json(json!({
                        "deltas": [deployment_json(12), deployment_json(13)],
                        "pagination": {},
                    })),
                    _ => axum::Json(json!({ "deltas": [] })),
                }
            }),
        );
        let server = ContentServer::spawn(app).await.unwrap();
        let client = client();
        let deltas: Vec<_> = client
            .pointer_changes(server.url(), 9)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        let timestamps: Vec<u64> = deltas
            .iter()
            .map(|d| d["localTimestamp"].as_u64().unwrap())
            .collect();
        assert_eq!(timestamps, vec![10, 11, 12, 13]);
        assert_eq!(client.metrics().pointer_changes_requests.get(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn download_follows_redirects() {
        let app = Router::new()
            .route(
                "/contents/a",
                get(|| async {
                    (
                        StatusCode::MOVED_PERMANENTLY,
                        [(header::LOCATION, "/contents/b")],
                    )
                }),
            )
            .route(
                "/contents/b",
                get(|| async { (StatusCode::FOUND, [(header::LOCATION, "c")]) }),
            )
            .route("/contents/c", get(|| async { "content" }));
        let server = ContentServer::spawn(app).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a");
        let written = client()
            .download_content(server.url(), "a", &dest)
            .await
            .unwrap();
        assert_eq!(written, 7);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"content");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = tokio::fs::metadata(&dest).await.unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0);
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn download_fails_on_redirect_loop() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/contents/loop",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::FOUND, [(header::LOCATION, "/contents/loop")])
                }),
            )
            .with_state(hits.clone());
        let server = ContentServer::spawn(app).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = client()
            .download_content(server.url(), "loop", &dir.path().join("loop"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooManyRedirects { .. }), "{err:?}");
        // the initial request plus one per followed redirect
        assert_eq!(hits.load(Ordering::SeqCst), MAX_REDIRECTS + 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn download_fails_on_error_status() {
        let app = Router::new().route(
            "/contents/missing",
            get(|| async { (StatusCode::NOT_FOUND, "not found") }),
        );
        let server = ContentServer::spawn(app).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = client()
            .download_content(server.url(), "missing", &dir.path().join("missing"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));

        // 304 is not a followed redirect
        let app = Router::new().route(
            "/contents/cached",
            get(|| async { StatusCode::NOT_MODIFIED }),
        );
        let server = ContentServer::spawn(app).await.unwrap();
        let err = client()
            .download_content(server.url(), "cached", &dir.path().join("cached"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(304));
    }

    #[tokio::test]
    #[traced_test]
    async fn download_inflates_gzip() {
        let content = "compressible ".repeat(1000);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let app = Router::new().route(
            "/contents/gz",
            get(move || {
                let compressed = compressed.clone();
                async move {
                    let mut headers = HeaderMap::new();
                    headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
                    (headers, compressed).into_response()
                }
            }),
        );
        let server = ContentServer::spawn(app).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("gz");
        let written = client()
            .download_content(server.url(), "gz", &dest)
            .await
            .unwrap();
        assert_eq!(written, content.len() as u64);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), content.as_bytes());
    }

    #[tokio::test]
    #[traced_test]
    async fn entity_manifest_lookup() {
        let app = Router::new().route(
            "/deployments",
            get(|Query(query): Query<std::collections::HashMap<String, String>>| async move {
                assert_eq!(query.get("fields").map(String::as_str), Some("auditInfo,content"));
                match query.get("entityId").map(String::as_str) {
                    Some("known") => axum::Json(json!({
                        "deployments": [{
                            "entityId": "known",
                            "entityType": "scene",
                            "content": [{ "file": "a.png", "hash": "bafyfile" }],
                            "auditInfo": { "version": "v3" },
                        }]
                    })),
                    _ => axum::Json(json!({ "deployments": [] })),
                }
            }),
        );
        let server = ContentServer::spawn(app).await.unwrap();
        let client = client();
        let manifest = client
            .entity_manifest(server.url(), "known")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manifest.content.len(), 1);
        assert_eq!(manifest.content[0].file, "a.png");
        assert!(
            client
                .entity_manifest(server.url(), "unknown")
                .await
                .unwrap()
                .is_none()
        );
    }
}
