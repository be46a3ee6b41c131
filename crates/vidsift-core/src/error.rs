//! Error types for the retrieval engine.

use std::path::PathBuf;

use crate::FrameId;

/// Errors produced by engine construction and the public session API.
///
/// Dataset and configuration problems are fatal at construction; input
/// problems are reported to the caller and leave the session untouched.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
	/// The configuration is self-inconsistent.
	#[error("invalid configuration: {0}")]
	Config(String),

	/// A configured dataset file could not be opened.
	#[error("failed to open dataset file: {0}")]
	DatasetNotFound(PathBuf),

	/// A dataset file opened but its contents are not what the
	/// configuration promised.
	#[error("malformed dataset file {path}: {message}")]
	DatasetParse {
		/// Offending file
		path: PathBuf,
		/// What went wrong
		message: String,
	},

	/// A display tag outside the known set was requested.
	#[error("unknown display type {0:?}")]
	UnknownDisplay(String),

	/// A frame id outside `[0, N)` was passed in.
	#[error("frame id {id} out of range (dataset holds {len} frames)")]
	FrameOutOfRange {
		/// Offending id
		id: FrameId,
		/// Dataset size
		len: usize,
	},

	/// A display that browses around a pivot frame was requested
	/// without one.
	#[error("display {0:?} requires a selected frame")]
	SelectionRequired(&'static str),

	/// I/O error while reading dataset or configuration files.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// The JSON configuration failed to parse.
	#[error("failed to parse configuration: {0}")]
	Json(#[from] serde_json::Error),
}

impl CoreError {
	/// True for caller mistakes that leave the session state unchanged,
	/// as opposed to construction-fatal dataset/config problems.
	#[must_use]
	pub fn is_input(&self) -> bool {
		matches!(
			self,
			Self::UnknownDisplay(_) | Self::FrameOutOfRange { .. } | Self::SelectionRequired(_)
		)
	}
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, CoreError>;
