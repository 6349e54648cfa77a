//! Carries out the saves the store hands out.
//!
//! A 303 response to a save is treated as a success: its body is read as a
//! normal save response. Every other failure is reported back to the store
//! (so the next cycle retries) and returned to the caller.

use crate::backend::{BackendError, FormBackend, PutFormData, PutFormDataResponse};
use crate::store::{FormDataStore, SaveRequest};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SaveError {
    #[error("Saving form data failed: {0}")]
    Backend(#[from] BackendError),

    #[error("Unreadable body in redirect response to save: {0}")]
    RedirectBody(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Nothing was due, or a save is already in flight.
    NothingToSave,
    Saved,
    /// The backend answered 303; its body was applied like a success.
    Redirected,
}

/// Lock a shared store. A poisoned lock still holds consistent data, since
/// every store operation completes before returning.
pub fn lock_store(store: &Mutex<FormDataStore>) -> MutexGuard<'_, FormDataStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SaveDriver<B> {
    backend: Arc<B>,
    url: String,
}

impl<B: FormBackend> SaveDriver<B> {
    pub fn new(backend: Arc<B>, url: impl Into<String>) -> Self {
        Self {
            backend,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issue the store's next save, if one is due.
    pub async fn save_pending(&self, store: &Mutex<FormDataStore>) -> Result<SaveOutcome, SaveError> {
        let request = lock_store(store).next_save();
        match request {
            Some(request) => self.send(request, store).await,
            None => Ok(SaveOutcome::NothingToSave),
        }
    }

    /// Best-effort final save of everything unsaved.
    pub async fn flush(&self, store: &Mutex<FormDataStore>) -> Result<SaveOutcome, SaveError> {
        let request = lock_store(store).flush_on_teardown();
        match request {
            Some(request) => self.send(request, store).await,
            None => Ok(SaveOutcome::NothingToSave),
        }
    }

    async fn send(
        &self,
        request: SaveRequest,
        store: &Mutex<FormDataStore>,
    ) -> Result<SaveOutcome, SaveError> {
        let body = PutFormData {
            data_model: request.new_data,
            previous_values: request.previous_values,
        };
        log::debug!(
            "saving form data to {} ({} changed fields)",
            self.url,
            body.previous_values.len()
        );

        let (response, outcome) = match self.backend.put_form_data(&self.url, &body).await {
            Ok(response) => (response, SaveOutcome::Saved),
            Err(BackendError::Redirect { body: redirect, .. }) => {
                match serde_json::from_value::<PutFormDataResponse>(redirect) {
                    Ok(response) => (response, SaveOutcome::Redirected),
                    Err(e) => {
                        lock_store(store).save_failed();
                        return Err(SaveError::RedirectBody(e));
                    }
                }
            }
            Err(e) => {
                log::warn!("saving form data to {} failed: {e}", self.url);
                lock_store(store).save_failed();
                return Err(e.into());
            }
        };

        lock_store(store).save_finished(body.data_model, response.changed_fields.as_ref());
        Ok(outcome)
    }
}
