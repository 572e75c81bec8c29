//! Reading deployments out of snapshot files.
//!
//! A snapshot file holds one JSON encoded deployment per line. Blank lines and lines that
//! are not a JSON object are ignored, invalid deployments are logged and skipped.
use async_stream::try_stream;
use n0_future::Stream;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{trace, warn};

use crate::{storage::ContentStorage, types::RemoteDeployment};

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ProcessError {
    #[snafu(display("The file {id} does not exist"))]
    NotFound { id: String },
    #[snafu(display("Failed to read {id}"))]
    Read { id: String, source: std::io::Error },
}

/// Streams the deployments of the snapshot file stored under `id`.
///
/// Fails with [`ProcessError::NotFound`] if nothing is stored under `id`.
pub fn process_deployments_in_storage<'a, S: ContentStorage>(
    storage: &'a S,
    id: &'a str,
) -> impl Stream<Item = Result<RemoteDeployment, ProcessError>> + Send + 'a {
    try_stream! {
        let reader = storage
            .retrieve(id)
            .await
            .context(ReadSnafu { id })?
            .context(NotFoundSnafu { id })?;
        let mut lines = BufReader::new(reader).lines();
        let mut line_number = 0usize;
        while let Some(line) = lines.next_line().await.context(ReadSnafu { id })? {
            line_number += 1;
            let line = line.trim();
            if !(line.starts_with('{') && line.ends_with('}')) {
                trace!(line_number, "skipping non-object line");
                continue;
            }
            match RemoteDeployment::from_json(line) {
                Ok(deployment) => {
                    yield deployment;
                }
                Err(err) => warn!(%id, line_number, "skipping invalid deployment: {err:#}"),
            }
        }
    }
}
