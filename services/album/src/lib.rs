//! Album Service
//!
//! Upload intake for the wedding photo album. Guests' browsers ask the service
//! for an upload target, then PUT the captured photo to it; an operator page
//! lists what has been received.
//!
//! ## Features
//!
//! - **Upload-Target Issuance**: unique storage keys of the form
//!   `{namespace}/{timestamp_ms}-{random_id}.{ext}` and the URL to deliver to
//! - **In-Memory Upload Store**: last-writer-wins keyed store with a payload
//!   ceiling, listed chronologically, behind a trait so a persistent backend
//!   can replace it
//! - **Upload Orchestrator**: client that drives the two-step protocol and
//!   reports its progress as a state machine
//!
//! ## Architecture
//!
//! ```text
//!  Orchestrator                 Album Service
//! ┌──────────────┐  GET /issue  ┌──────────────┐
//! │ AwaitingTarget│────────────▶│ Issuer       │
//! │              │◀────────────│              │
//! │              │  url, key    └──────────────┘
//! │ Transmitting │  PUT /store  ┌──────────────┐
//! │              │────────────▶│ Upload Store │◀── GET /store (listing)
//! │ Succeeded /  │◀────────────│              │
//! │ Failed       │  ack         └──────────────┘
//! └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod issuer;
pub mod orchestrator;
pub mod storage_key;
pub mod store;

pub use api::{create_router, AppState, IssueResponse, ListResponse, PutResponse};
pub use config::Config;
pub use issuer::{UploadTarget, UploadTargetIssuer};
pub use orchestrator::{
    HttpTransport, TransportError, UploadError, UploadOrchestrator, UploadState, UploadTransport,
};
pub use storage_key::{KeyGenerator, StorageKey};
pub use store::{MemoryStore, StoreError, UploadAck, UploadStore, UploadSummary};
