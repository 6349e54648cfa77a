//! In-memory backend shared by the integration tests.

#![allow(dead_code)]

use form_core::NodeId;
use form_session::{
    AttachmentFile, BackendError, FormBackend, OptionItem, PutFormData, PutFormDataResponse,
};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Default)]
pub struct MemoryBackend {
    pub initial: Value,
    /// Every `PUT` body received, in order.
    pub puts: Mutex<Vec<PutFormData>>,
    /// Scripted save results; an empty queue answers with an empty response.
    pub responses: Mutex<VecDeque<Result<PutFormDataResponse, BackendError>>>,
    /// Saves wait for `release` while set.
    pub hold_saves: AtomicBool,
    pub release: Notify,
    pub uploads: AtomicUsize,
    pub deleted: Mutex<Vec<String>>,
    pub fail_deletes: AtomicBool,
    pub options: BTreeMap<String, Vec<OptionItem>>,
}

impl MemoryBackend {
    pub fn new(initial: Value) -> Self {
        Self {
            initial,
            ..Self::default()
        }
    }

    pub fn respond(&self, response: Result<PutFormDataResponse, BackendError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn put_count(&self) -> usize {
        self.puts.lock().unwrap().len()
    }

    pub fn last_put(&self) -> Option<PutFormData> {
        self.puts.lock().unwrap().last().cloned()
    }
}

impl FormBackend for MemoryBackend {
    async fn fetch_initial_form_data(&self, _url: &str) -> Result<Value, BackendError> {
        Ok(self.initial.clone())
    }

    async fn put_form_data(
        &self,
        _url: &str,
        body: &PutFormData,
    ) -> Result<PutFormDataResponse, BackendError> {
        if self.hold_saves.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        self.puts.lock().unwrap().push(body.clone());
        let scripted = self.responses.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(PutFormDataResponse::default()))
    }

    async fn upload_attachment(
        &self,
        _component_id: NodeId,
        file: &AttachmentFile,
    ) -> Result<String, BackendError> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}-{n}", file.name))
    }

    async fn delete_attachment(
        &self,
        _component_id: NodeId,
        attachment_id: &str,
    ) -> Result<(), BackendError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BackendError::Status {
                url: format!("/attachments/{attachment_id}"),
                status: 500,
            });
        }
        self.deleted.lock().unwrap().push(attachment_id.to_string());
        Ok(())
    }

    async fn fetch_options(
        &self,
        source: &str,
        _query: &BTreeMap<String, String>,
    ) -> Result<Vec<OptionItem>, BackendError> {
        Ok(self.options.get(source).cloned().unwrap_or_default())
    }
}
