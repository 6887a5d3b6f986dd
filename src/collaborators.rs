//! Interfaces to the systems the pipeline drives but does not implement
//!
//! Content sources, byte transports, message delivery, and object storage are supplied
//! by the host. [`crate::transport::HttpTransport`] and
//! [`crate::notifier::WebhookNotifier`] are ready-made HTTP implementations.

use crate::db::{Item, ItemDraft};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// One content source
///
/// Connectors report a missing detail element or download link as
/// [`crate::Error::ResourceNotFound`], and upstream flakiness as
/// [`crate::Error::Transient`].
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// One page of candidate items for a series; an empty page means nothing more to discover
    async fn discover(&self, series: &str, page: u32) -> Result<Vec<ItemDraft>>;

    /// Resolve a retrievable resource reference for a discovered item
    async fn resolve(&self, item: &Item) -> Result<String>;
}

/// A byte stream with the length announced by the remote end
pub struct RemoteFile {
    /// Announced length in bytes, when the remote end declares one
    pub content_length: Option<u64>,
    /// Body chunks
    pub stream: BoxStream<'static, Result<Bytes>>,
}

/// Fetches resource bytes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a stream for `resource_ref`
    async fn stream(&self, resource_ref: &str) -> Result<RemoteFile>;
}

/// How a file is delivered in a message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delivery {
    /// Attached to the message
    Attachment {
        /// Local file path
        path: String,
        /// File name shown to the recipient
        file_name: String,
        /// MIME type
        mime_type: String,
    },
    /// Linked via a time-limited URL
    Link {
        /// Download URL
        url: String,
        /// File name shown to the recipient
        file_name: String,
        /// Seconds until the URL stops working
        expires_in_secs: u64,
    },
}

/// One item's entry in a message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeEntry {
    /// Item title
    pub title: String,
    /// Item series
    pub series: String,
    /// File size in bytes
    pub byte_size: i64,
    /// How the file is delivered
    pub delivery: Delivery,
}

/// A message to one recipient covering one or more items
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Recipient address
    pub to: String,
    /// Sender display name
    pub from_name: String,
    /// Subject line
    pub subject: String,
    /// Entries, one per item
    pub entries: Vec<EnvelopeEntry>,
}

/// Delivers messages
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send one message; `Ok(false)` means the message was definitely not delivered
    async fn send(&self, envelope: &Envelope) -> Result<bool>;
}

/// Stores large files and hands out time-limited URLs
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `path` (or reuse an earlier upload) and return a URL valid for `expires_in`
    async fn put(&self, path: &Path, expires_in: Duration) -> Result<String>;
}
