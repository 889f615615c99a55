//! Photo Sync Service
//!
//! Upload scheduling and file-list synchronization for facility photos.
//! Callers hand in batches of photos for a business target; the service
//! compresses, deduplicates by content hash, stores the bytes in S3 and
//! records metadata in PostgreSQL. Per business, a sync session merges local
//! confirmations, a Kafka change feed and a polling fallback into one
//! reconciled file list.
//!
//! ## Features
//!
//! - **Bounded Upload Queue**: FIFO admission with a concurrency bound that
//!   adapts to reported network conditions, per-task cancel and retry
//! - **Content Deduplication**: SHA-256 per business, settled by a unique
//!   constraint when two uploads race
//! - **Compensating Writes**: a rejected metadata insert removes the object
//!   that was just stored
//! - **Realtime Sync with Fallback**: change feed with reconnect, polling whose
//!   interval follows network tier and feed health
//! - **Order-Independent Reconciliation**: last-writer-wins merge with
//!   recently-added markers, local protection windows and delete tombstones
//!
//! ## Architecture
//!
//! ```text
//!  HTTP API                                       S3 Bucket
//! ┌──────────────┐   ┌──────────────┐           ┌──────────────┐
//! │ POST uploads │──▶│ Upload Queue │──────────▶│ {business}/  │
//! └──────────────┘   │ Scheduler    │           │  {phase}/... │
//!                    └──────────────┘           └──────────────┘
//!                     │ compress → hash → dedup → store
//!                     ▼                                PostgreSQL
//!              ┌──────────────┐                ┌──────────────┐
//!              │ Storage      │───────────────▶│ facility_    │
//!              │ Client       │                │ files        │
//!              └──────────────┘                └──────────────┘
//!                     │ completions                 │      ▲
//!                     ▼                             │      │ poll
//!  Kafka        ┌──────────────┐   SyncEvent  ┌──────────────┐
//! ┌──────────┐  │ Event Bus    │◀─────────────│ Polling      │
//! │ changes  │─▶│ (per session)│              │ Fallback     │
//! └──────────┘  └──────────────┘              └──────────────┘
//!                     │
//!                     ▼
//!              ┌──────────────┐
//!              │ Reconciler   │──▶ GET /businesses/{id}/files
//!              └──────────────┘
//! ```

pub mod api;
pub mod bus;
pub mod change_feed;
pub mod compression;
pub mod config;
pub mod dedup;
pub mod memory;
pub mod model;
pub mod network;
pub mod pg_store;
pub mod polling;
pub mod reconciler;
pub mod s3_store;
pub mod scheduler;
pub mod session;
pub mod storage_client;

pub use api::{create_router, start_api_server, AppState};
pub use bus::{EventBus, SyncEvent};
pub use change_feed::{ChangeFeedSubscriber, ChangeSource, FeedHealth, KafkaChangeSource, Subscription};
pub use config::Config;
pub use model::{ChangeEvent, FileRecord, SourceFile, TargetDescriptor, ValidationError};
pub use network::{NetworkConditions, NetworkMonitor};
pub use pg_store::PgRecordStore;
pub use reconciler::{ReconciledView, Reconciler, ReconcilerStore};
pub use s3_store::S3BlobStore;
pub use scheduler::{QueueStats, UploadQueueScheduler, UploadStatus, UploadTask};
pub use session::{SessionDeps, SessionRegistry, SyncSession};
pub use storage_client::{BlobStore, RecordStore, StorageClient, StorageError};
