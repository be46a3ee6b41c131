//! Engine configuration.
//!
//! One immutable [`Config`] record is parsed from a JSON file and passed by
//! value at engine construction; nothing here changes afterwards. Tuning
//! constants that are not expected to vary per deployment live as named
//! constants below instead of config keys.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Width of the paged display grid.
pub const DISPLAY_GRID_WIDTH: usize = 6;
/// Height of the paged display grid.
pub const DISPLAY_GRID_HEIGHT: usize = 6;
/// Width of the SOM display grid.
pub const SOM_DISPLAY_GRID_WIDTH: usize = 8;
/// Height of the SOM display grid.
pub const SOM_DISPLAY_GRID_HEIGHT: usize = 8;
/// Upper bound on a recomputed top-N result list.
pub const TOPN_LIMIT: usize = 10_000;
/// Upper bound on a KNN result list.
pub const TOPKNN_LIMIT: usize = 10_000;
/// Training iterations per SOM cycle.
pub const SOM_ITERS: usize = 100_000;
/// Recursion cap for temporal text queries.
pub const MAX_NUM_TEMP_QUERIES: usize = 2;
/// How many successor frames a temporal sub-query may look ahead.
pub const KW_TEMPORAL_SPAN: usize = 5;
/// Position of the scoring frame inside its context strip.
pub const TOP_N_SELECTED_FRAME_POSITION: usize = 2;
/// Sampling exponent of the random display.
pub const RANDOM_DISPLAY_WEIGHT: f32 = 3.0;
/// Softmax temperature of the Bayesian feedback update.
pub const BAYES_SIGMA: f32 = 0.1;
/// Cap on the non-liked context sample used by Bayesian feedback.
pub const BAYES_MAX_OTHERS: usize = 64;
/// Floor below which scores are clamped during normalization.
pub const MINIMAL_SCORE: f32 = 1e-12;

/// Fixed substring offsets used to parse ids out of frame filenames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FilenameOffsets {
	/// Byte offset of the video id digits
	pub vid_id_off: usize,
	/// Length of the video id digits
	pub vid_id_len: usize,
	/// Byte offset of the shot id digits
	pub shot_id_off: usize,
	/// Length of the shot id digits
	pub shot_id_len: usize,
	/// Byte offset of the frame number digits
	pub frame_num_off: usize,
	/// Length of the frame number digits
	pub frame_num_len: usize,
}

/// Settings of the telemetry/submission sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitterConfig {
	/// Whether dispatches actually perform the HTTP POST
	pub submit_to_server: bool,
	/// Endpoint for rescore result reports
	pub submit_rerank_url: String,
	/// Endpoint for interaction batches and submissions
	pub submit_url: String,
	/// Competition team id
	pub team_id: usize,
	/// Team member id
	pub member_id: usize,
	/// Directory where every dispatch is archived
	pub submit_archive_dir: PathBuf,
	/// Filename suffix of archived dispatches
	pub submit_archive_log_suffix: String,
	/// Echo dispatched payloads to the log
	pub extra_verbose_log: bool,
	/// Backlog flush period in milliseconds
	pub send_logs_to_server_period: u64,
	/// Rate limit for repeated scroll/replay events, in milliseconds
	pub log_replay_timeout: u64,
}

/// Parsed engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
	/// Telemetry sink settings
	pub submitter: SubmitterConfig,

	/// Substring offsets for frame filename parsing
	pub filename_offsets: FilenameOffsets,

	/// Text file with one frame path per line, sorted by video then frame
	pub frames_list_file: PathBuf,
	/// Prefix prepended to frame filenames when building display sources
	pub frames_path_prefix: String,

	/// Binary little-endian f32 feature matrix
	pub features_file: PathBuf,
	/// Header bytes to skip in `features_file`
	pub features_file_data_off: u64,
	/// Embedding dimension of the feature matrix
	pub features_dim: usize,

	/// Dimension of keyword vectors before PCA projection
	pub pre_pca_features_dim: usize,
	/// Bias vector added to accumulated keyword scores
	pub kw_bias_vec_file: PathBuf,
	/// Keyword-score matrix, one row per keyword id
	pub kw_scores_mat_file: PathBuf,
	/// PCA mean vector subtracted before projection
	pub kw_pca_mean_vec_file: PathBuf,
	/// PCA projection matrix, `kw_pca_mat_dim` rows of `pre_pca_features_dim`
	pub kw_pca_mat_file: PathBuf,
	/// Output dimension of the PCA projection
	pub kw_pca_mat_dim: usize,

	/// Keyword synset list, colon-separated
	pub kws_file: PathBuf,

	/// Page size used when slicing displays
	pub display_page_size: usize,
	/// Per-video cap of top-N results, 0 disables the cap
	pub topn_frames_per_video: usize,
	/// Per-shot cap of top-N results, 0 disables the cap
	pub topn_frames_per_shot: usize,
}

impl Config {
	/// Parse the JSON configuration file.
	///
	/// # Errors
	///
	/// Returns [`CoreError::DatasetNotFound`] when the file cannot be
	/// opened and [`CoreError::Json`] when it does not parse; both are
	/// fatal to engine construction.
	pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let file =
			File::open(path).map_err(|_| CoreError::DatasetNotFound(path.to_path_buf()))?;
		let config: Self = serde_json::from_reader(BufReader::new(file))?;
		config.validate()?;
		Ok(config)
	}

	/// Cheap self-consistency checks that do not need the dataset files.
	///
	/// # Errors
	///
	/// Returns [`CoreError::Config`] on a violation.
	pub fn validate(&self) -> Result<()> {
		if self.features_dim == 0 {
			return Err(CoreError::Config("features_dim must be non-zero".into()));
		}
		if self.pre_pca_features_dim == 0 {
			return Err(CoreError::Config(
				"pre_pca_features_dim must be non-zero".into(),
			));
		}
		if self.kw_pca_mat_dim != self.features_dim {
			return Err(CoreError::Config(format!(
				"kw_pca_mat_dim ({}) must match features_dim ({}); keyword query \
				 vectors and frame embeddings share one space",
				self.kw_pca_mat_dim, self.features_dim
			)));
		}
		if self.display_page_size == 0 {
			return Err(CoreError::Config("display_page_size must be non-zero".into()));
		}
		Ok(())
	}
}
