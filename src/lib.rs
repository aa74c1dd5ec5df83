//! Resumable, chunked, multi-worker HTTP downloader.
//!
//! A [`TransferCoordinator`] runs a set of [`worker::ChunkWorker`]s against
//! one file. Workers claim chunk indices from a shared
//! [`allocator::ChunkAllocator`], fetch each as a byte range and persist it
//! as `<name>.chunk<index>`; [`assembler::assemble`] joins the pieces.

pub mod allocator;
pub mod assembler;
pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod providers;
pub mod proxy;
pub mod state;
pub mod sync;
pub mod throttle;
pub mod utils;
pub mod worker;

pub use config::{ProxySettings, ProxySource, TransferConfig};
pub use coordinator::{Supervisor, Transfer, TransferCoordinator, TransferEvent, TransferOutcome};
pub use error::{ChunkError, ProxyError, TransferError};
pub use providers::{StaticUrl, UrlProvider};
pub use throttle::Throttle;
