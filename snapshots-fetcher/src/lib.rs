//! Pull-based replication of deployments and content from content servers.
//!
//! A content server publishes *deployments*: records of entities being published, ordered
//! by a server-local sequence timestamp. This crate keeps a local consumer in sync with any
//! number of such servers and materializes the content-addressed blobs the deployments
//! reference onto local storage.
//!
//! The pieces, leaves first:
//!
//! - [`RetryLoop`] runs a fallible long-lived action forever, with exponential backoff
//!   after failures, until it is stopped.
//! - [`JobQueue`] executes units of work with a concurrency cap, and can retry a failed
//!   unit by re-enqueueing it at the tail of the queue.
//! - [`Downloader`] fetches a single blob by its content address from one of several
//!   candidate servers, verifies its hash and publishes it into a [`ContentStorage`].
//!   Concurrent requests for the same blob share a single network fetch.
//! - [`deployments_stream`] produces the ordered, resumable sequence of deployments of one
//!   server by fusing the server's bulk snapshot with its paginated change feed.
//! - [`DeploymentStream`] wraps the above in a [`RetryLoop`], hands every deployment to a
//!   [`DeploymentHandler`] and keeps the resumption watermark.
//! - [`JobLifecycleManager`] reconciles a desired set of named long-lived jobs, for example
//!   one [`DeploymentStream`] per server, against the set that is actually running.
//!
//! Delivery of deployments is at-least-once: a stream that reconnects resumes *inclusively*
//! from its watermark and may deliver the items at exactly that timestamp again. Handlers
//! must be idempotent.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(snapshots_fetcher_docsrs, feature(doc_auto_cfg))]

pub mod client;
pub mod config;
pub mod downloader;
pub mod hash;
pub mod job_manager;
pub mod job_queue;
pub mod metrics;
pub mod processor;
pub mod retry;
pub mod storage;
pub mod stream;
pub mod supervised;
pub mod types;
mod unixfs;

#[cfg(test)]
pub(crate) mod test_utils;

pub use client::ContentClient;
pub use downloader::{DownloadOptions, Downloader};
pub use job_manager::{JobLifecycleManager, ManagedJob};
pub use job_queue::{JobQueue, JobQueueOptions};
pub use retry::{RetryLoop, RetryOptions};
pub use storage::{ContentStorage, FsStorage, MemStorage};
pub use stream::{DeploymentStreamOptions, deployments_stream};
pub use supervised::{DeploymentHandler, DeploymentStream};
pub use types::{ContentMapping, EntityManifest, RemoteDeployment, SnapshotDescriptor};
