//! # Astro Core
//!
//! Fetching, caching and slot delivery for rover photo galleries.
//!
//! ## Overview
//!
//! - [`cache`]: thread-safe in-memory store of fetched image bytes
//! - [`task`]: cancellable asynchronous task with an explicit lifecycle
//! - [`pipeline`]: fetch -> store -> deliver chain per requested photo
//! - [`binding`]: consumer-thread slot bindings and stale delivery checks
//! - [`transport`]: the network seam, with a `reqwest` implementation
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use astro_core::{
//!     AstroConfig, ConsumerBinding, FetchPipeline, HttpTransport, ImageCache,
//!     PhotoReference, SlotId, build_worker_pool,
//! };
//!
//! fn show(photo: PhotoReference) -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AstroConfig::load(None)?;
//!     let runtime = build_worker_pool(&config.fetch)?;
//!     let transport = HttpTransport::new(&config.fetch)?;
//!     let pipeline = FetchPipeline::new(
//!         ImageCache::new(),
//!         Arc::new(transport),
//!         runtime.handle().clone(),
//!     );
//!
//!     let mut slots = ConsumerBinding::new();
//!     slots.load(&pipeline, SlotId(0), photo.id, photo.secure_url());
//!     slots.next_delivery(Duration::from_secs(5), |slot, key, result| {
//!         println!("{slot} <- {key}: {:?}", result.map(|bytes| bytes.len()));
//!     });
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]

pub mod binding;
pub mod cache;
pub mod config;
pub mod error;
pub mod photo;
pub mod pipeline;
pub mod runtime;
pub mod task;
pub mod transport;

pub use binding::{ConsumerBinding, DrainSummary, SlotDelivery, SlotId};
pub use cache::{CacheStats, ImageCache, KeyedCache};
pub use config::{AstroConfig, FetchConfig, GalleryConfig};
pub use error::{AstroError, FetchError};
pub use photo::{PhotoId, PhotoReference, parse_manifest};
pub use pipeline::{
    Delivery, FetchPipeline, PipelineHandle, PipelineId, PipelineStage,
    PipelineStats, StepObserver, WeakPipelineHandle,
};
pub use runtime::build_worker_pool;
pub use task::{CancellableTask, TaskId, TaskOutcome, TaskState};
pub use transport::{HttpTransport, Transport};
