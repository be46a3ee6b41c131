//! # Vidsift Core
//!
//! Interactive known-item video retrieval over a precomputed dataset of
//! keyframe embeddings.
//!
//! A session combines three query modalities against one score vector:
//!
//! - **Free-text queries** — sentences map to keyword classes, keyword
//!   batches embed into the joint text–image space, and every frame is
//!   penalized by `exp(−42 · d)` of its (temporal) distance to the query.
//! - **Relevance feedback** — liked frames pull the distribution toward
//!   themselves against the already-shown context via a Bayesian update.
//! - **Query by example** — "more like this" browsing through capped
//!   nearest-neighbor displays.
//!
//! The rescore data flow:
//!
//! ```text
//! text query ──▶ keyword ranker ──▶ per-frame distances
//!                                        │  × exp(−42·d)
//!                                        ▼
//! likes / shown ──▶ Bayesian update ──▶ score model ──▶ normalize
//!                                        │         │
//!                                        ▼         ▼
//!                                   SOM worker   top-N / KNN / random
//!                                  (background)      displays
//! ```
//!
//! While the user browses, a background worker keeps re-projecting the
//! score-weighted dataset onto a small self-organizing map, so the SOM
//! display always offers a score-aware overview of the collection.
//!
//! The engine is single-session by design: construct one [`Engine`] per
//! user, drive it from one thread, and drop it to shut the workers down.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod distance;
pub mod engine;
pub mod error;
pub mod features;
pub mod frames;
pub mod keywords;
pub mod scores;
pub mod som;
pub mod som_worker;
pub mod submitter;

pub use config::Config;
pub use engine::{Display, DisplayFrame, DisplayType, Engine, UsedTools};
pub use error::{CoreError, Result};
pub use features::FeatureStore;
pub use frames::{FrameIndex, VideoFrame};
pub use keywords::{Keyword, KeywordRanker};
pub use scores::ScoreModel;

/// Dense frame id, `0..N` in frame-list order.
pub type FrameId = usize;
/// Video id parsed out of frame filenames.
pub type VideoId = u32;
/// Shot id parsed out of frame filenames.
pub type ShotId = u32;
/// Keyword class id; doubles as the keyword's row in the score matrix.
pub type KeywordId = usize;
/// Zero-based display page number.
pub type PageId = usize;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
