//! Boundary to the remote block store.
//!
//! Every call is async and completions may arrive in any order; callers must not
//! assume a create issued first resolves first.

mod http;
pub mod testing;

pub use http::HttpRemote;

use crate::blocks::{ParentRef, SyncedBlock};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("remote task failed: {0}")]
    Task(String),
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemotePage {
    pub id: String,
    pub title: String,
    pub icon: Option<String>,
    pub parent: ParentRef,
    pub last_edited_time: Option<String>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Appends `children` under `parent_id`, after the sibling `anchor` when given.
    /// Returns the ids of the created blocks in request order.
    async fn create(
        &self,
        parent_id: &str,
        children: Vec<Value>,
        anchor: Option<&str>,
    ) -> Result<Vec<String>, RemoteError>;

    async fn update(&self, id: &str, block: Value) -> Result<(), RemoteError>;

    async fn delete(&self, id: &str) -> Result<(), RemoteError>;

    async fn fetch_page(&self, id: &str) -> Result<RemotePage, RemoteError>;

    /// All direct children of `id`, following pagination to the end.
    async fn fetch_children(&self, id: &str) -> Result<Vec<SyncedBlock>, RemoteError>;
}
