pub mod attachments;
pub mod backend;
pub mod config;
pub mod repeating_group;
pub mod saver;
pub mod session;
pub mod store;

pub use attachments::{Attachment, Attachments};
pub use backend::{
    AttachmentFile, BackendError, FormBackend, OptionItem, PutFormData, PutFormDataResponse,
};
pub use config::SessionConfig;
pub use repeating_group::{RepeatingGroupState, RowDeletion, RowError, ValidationScope};
pub use saver::{SaveDriver, SaveError, SaveOutcome};
pub use session::{FormSession, NodeRenderer};
pub use store::{
    FormDataStore, LeafChange, LockRequest, LockState, SaveGate, SaveGatekeeper, SaveRequest,
};
