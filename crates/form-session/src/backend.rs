//! The backend contract the session depends on.
//!
//! Transport is left to the implementor. Every network call the session
//! makes goes through [`FormBackend`], so tests swap in an in-memory
//! backend.

use form_core::{DiffMap, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Request to {url} failed with HTTP {status}")]
    Status { url: String, status: u16 },

    /// HTTP 303. For form data saves the body is a regular save response.
    #[error("Request to {url} was redirected (HTTP 303)")]
    Redirect { url: String, body: Value },

    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("Invalid response body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Body of a form data `PUT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutFormData {
    pub data_model: Value,
    pub previous_values: DiffMap,
}

/// Response to a form data `PUT`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PutFormDataResponse {
    /// Fields the server computed while saving, as nested form data.
    pub changed_fields: Option<Value>,
}

/// A file picked for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub tags: Vec<String>,
}

/// One entry of a code list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionItem {
    pub value: String,
    pub label: String,
}

pub trait FormBackend: Send + Sync {
    fn fetch_initial_form_data(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Value, BackendError>> + Send;

    fn put_form_data(
        &self,
        url: &str,
        body: &PutFormData,
    ) -> impl Future<Output = Result<PutFormDataResponse, BackendError>> + Send;

    /// Upload a file for a component. Returns the new attachment id.
    fn upload_attachment(
        &self,
        component_id: NodeId,
        file: &AttachmentFile,
    ) -> impl Future<Output = Result<String, BackendError>> + Send;

    fn delete_attachment(
        &self,
        component_id: NodeId,
        attachment_id: &str,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Fetch a code list. Backends without code lists return nothing.
    fn fetch_options(
        &self,
        _source: &str,
        _query: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<Vec<OptionItem>, BackendError>> + Send {
        async { Ok(Vec::new()) }
    }
}
