//! Fake collaborators

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use issue_courier::collaborators::{
    Envelope, Notifier, ObjectStore, RemoteFile, SourceConnector, Transport,
};
use issue_courier::db::{Item, ItemDraft};
use issue_courier::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Source with canned pages and detail resolutions
#[derive(Default)]
pub struct FakeSource {
    pages: Mutex<HashMap<(String, u32), Vec<ItemDraft>>>,
    resolutions: Mutex<HashMap<String, String>>,
    pub resolve_calls: AtomicUsize,
}

impl FakeSource {
    pub fn set_page(&self, series: &str, page: u32, drafts: Vec<ItemDraft>) {
        self.pages
            .lock()
            .unwrap()
            .insert((series.to_string(), page), drafts);
    }

    pub fn set_resolution(&self, detail_ref: &str, resource_ref: &str) {
        self.resolutions
            .lock()
            .unwrap()
            .insert(detail_ref.to_string(), resource_ref.to_string());
    }

    pub fn resolves(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceConnector for FakeSource {
    async fn discover(&self, series: &str, page: u32) -> Result<Vec<ItemDraft>> {
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&(series.to_string(), page))
            .cloned()
            .unwrap_or_default())
    }

    async fn resolve(&self, item: &Item) -> Result<String> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.resolutions
            .lock()
            .unwrap()
            .get(&item.detail_ref)
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound(format!("no download link on {}", item.detail_ref)))
    }
}

/// What the transport does for one URL
#[derive(Clone)]
pub enum Behavior {
    /// Serve the body in chunks of the given size
    Serve { body: Vec<u8>, chunk: usize },
    /// Serve `sent` bytes of a `declared`-byte body, then break the connection
    BreakAfter { sent: Vec<u8>, declared: u64 },
    /// Fail `times` requests with a transient error, then serve the body
    FlakyThenServe { times: usize, body: Vec<u8> },
    /// Always fail with a transient error
    AlwaysFail,
}

#[derive(Default)]
pub struct FakeTransport {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeTransport {
    pub fn set(&self, url: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(url.to_string(), behavior);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

fn serve(body: Vec<u8>, chunk: usize) -> RemoteFile {
    let len = body.len() as u64;
    let chunks: Vec<Result<Bytes>> = body
        .chunks(chunk.max(1))
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    RemoteFile {
        content_length: Some(len),
        stream: futures::stream::iter(chunks).boxed(),
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn stream(&self, resource_ref: &str) -> Result<RemoteFile> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(resource_ref.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let behavior = self.behaviors.lock().unwrap().get(resource_ref).cloned();

        match behavior {
            None => Err(Error::ResourceNotFound(resource_ref.to_string())),
            Some(Behavior::Serve { body, chunk }) => Ok(serve(body, chunk)),
            Some(Behavior::BreakAfter { sent, declared }) => {
                let chunks: Vec<Result<Bytes>> = vec![
                    Ok(Bytes::from(sent)),
                    Err(Error::Transient("connection reset by peer".into())),
                ];
                Ok(RemoteFile {
                    content_length: Some(declared),
                    stream: futures::stream::iter(chunks).boxed(),
                })
            }
            Some(Behavior::FlakyThenServe { times, body }) => {
                if attempt <= times {
                    Err(Error::Transient(format!("attempt {attempt} timed out")))
                } else {
                    Ok(serve(body, 4))
                }
            }
            Some(Behavior::AlwaysFail) => Err(Error::Transient("upstream unavailable".into())),
        }
    }
}

/// Notifier that records every envelope
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Envelope>>,
    reject: std::sync::atomic::AtomicBool,
}

impl RecordingNotifier {
    /// Make later sends report "not delivered"
    pub fn reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, envelope: &Envelope) -> Result<bool> {
        if self.reject.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.sent.lock().unwrap().push(envelope.clone());
        Ok(true)
    }
}

/// Object store that hands out fake URLs
#[derive(Default)]
pub struct FakeObjectStore {
    pub uploads: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn put(&self, path: &Path, expires_in: Duration) -> Result<String> {
        self.uploads.lock().unwrap().push(path.to_path_buf());
        Ok(format!(
            "https://store.test/{}?expires={}",
            path.file_name().unwrap().to_string_lossy(),
            expires_in.as_secs()
        ))
    }
}

pub fn draft(title: &str, series: Option<&str>, date: chrono::NaiveDate, detail_ref: &str) -> ItemDraft {
    ItemDraft {
        title: title.to_string(),
        series: series.map(str::to_string),
        publication_date: date,
        detail_ref: detail_ref.to_string(),
    }
}
