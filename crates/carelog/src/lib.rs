//! `carelog` - Local-first clinical record store with encrypted sync
//!
//! This library provides the on-device record database for point-of-care
//! assessments, last-writer-wins synchronization through an encrypted
//! remote blob store, and a consent-gated de-identified export relay.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod keys;
pub mod logging;
pub mod record;
pub mod relay;
pub mod remote;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use record::{Record, SubjectIndex};
pub use storage::LocalRecordStore;
pub use sync::{SyncHandle, SyncSession};
