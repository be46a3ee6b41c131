//! Node.js bindings for the vidsift-core retrieval engine.
//!
//! One JavaScript `VidsiftEngine` wraps one search session. The host UI is
//! expected to drive it from a single thread, mirroring the engine's own
//! contract.

// napi-rs requires owned types at the FFI boundary - can't use references
#![allow(clippy::needless_pass_by_value)]
// Frame and keyword ids stay far below u32::MAX in practice
#![allow(clippy::cast_possible_truncation)]

use std::str::FromStr;
use std::sync::Once;

use napi::bindgen_prelude::*;
use napi_derive::napi;

use vidsift_core::{CoreError, Display, DisplayType, Engine, FrameId};

static INIT_LOGGING: Once = Once::new();

fn to_napi_err(err: CoreError) -> Error {
	Error::from_reason(err.to_string())
}

/// One slot of a display, `id` empty for an empty grid cell.
#[napi(object)]
pub struct JsDisplayFrame {
	/// Frame id, absent for an empty cell
	pub id: Option<u32>,
	/// Whether the frame is currently liked
	pub liked: bool,
	/// Image source path
	pub src: String,
}

/// A page of an assembled display.
#[napi(object)]
pub struct JsDisplay {
	/// The page this slice represents
	pub page: u32,
	/// Frames in display order
	pub frames: Vec<JsDisplayFrame>,
}

/// An autocomplete hit.
#[napi(object)]
pub struct JsKeyword {
	/// Keyword id
	pub id: u32,
	/// Canonical synset string
	pub word: String,
	/// Human-readable description, possibly empty
	pub description: String,
	/// Best example frames for this keyword
	pub example_frames: Vec<u32>,
}

fn convert_display(display: Display) -> JsDisplay {
	JsDisplay {
		page: display.page as u32,
		frames: display
			.frames
			.into_iter()
			.map(|frame| JsDisplayFrame {
				id: frame.id.map(|id| id as u32),
				liked: frame.liked,
				src: frame.src,
			})
			.collect(),
	}
}

/// One interactive search session over a preloaded dataset.
#[napi]
pub struct VidsiftEngine {
	inner: Engine,
}

#[napi]
impl VidsiftEngine {
	/// Load the dataset named by a JSON configuration file and start the
	/// background workers.
	#[napi(constructor)]
	pub fn new(config_path: String) -> Result<Self> {
		INIT_LOGGING.call_once(|| {
			let _ = tracing_subscriber::fmt()
				.with_env_filter(
					tracing_subscriber::EnvFilter::try_from_default_env()
						.unwrap_or_else(|_| "info".into()),
				)
				.try_init();
		});

		let inner = Engine::from_config_file(&config_path).map_err(to_napi_err)?;
		Ok(Self { inner })
	}

	/// Apply a text query plus pending relevance feedback.
	#[napi]
	pub fn rescore(&mut self, text_query: String) {
		self.inner.rescore(&text_query);
	}

	/// Mark frames as liked.
	#[napi]
	pub fn add_likes(&mut self, frame_ids: Vec<u32>) -> Result<()> {
		let ids: Vec<FrameId> = frame_ids.into_iter().map(|id| id as FrameId).collect();
		self.inner.add_likes(&ids).map_err(to_napi_err)
	}

	/// Withdraw likes.
	#[napi]
	pub fn remove_likes(&mut self, frame_ids: Vec<u32>) -> Result<()> {
		let ids: Vec<FrameId> = frame_ids.into_iter().map(|id| id as FrameId).collect();
		self.inner.remove_likes(&ids).map_err(to_napi_err)
	}

	/// Keyword records matching a typed prefix.
	#[napi]
	pub fn autocomplete_keywords(&self, prefix: String, count: u32) -> Vec<JsKeyword> {
		self.inner
			.autocomplete_keywords(&prefix, count as usize)
			.into_iter()
			.map(|kw| JsKeyword {
				id: kw.keyword_id as u32,
				word: kw.synset_strs.first().cloned().unwrap_or_default(),
				description: kw.description.clone(),
				example_frames: kw.example_frames.iter().map(|&id| id as u32).collect(),
			})
			.collect()
	}

	/// Whether the SOM display has a trained mapping to draw from.
	#[napi]
	pub fn is_som_ready(&self) -> bool {
		self.inner.som_ready()
	}

	/// Submit a frame as the answer.
	#[napi]
	pub fn submit_to_server(&mut self, frame_id: u32) -> Result<()> {
		self.inner
			.submit_to_server(frame_id as FrameId)
			.map_err(to_napi_err)
	}

	/// Drop the whole search context and start over.
	#[napi]
	pub fn reset_all(&mut self) {
		self.inner.reset_all();
	}

	/// Record a scroll over the current display.
	#[napi]
	pub fn log_scroll(&mut self, dir_y: f64) {
		self.inner.log_scroll(dir_y as f32);
	}

	/// Record a video replay around a frame.
	#[napi]
	pub fn log_video_replay(&mut self, frame_id: u32) -> Result<()> {
		self.inner
			.log_video_replay(frame_id as FrameId)
			.map_err(to_napi_err)
	}

	/// Assemble a display.
	///
	/// `display_type` is one of `topn`, `topnctx`, `som`, `detail`,
	/// `topknn`, `random`; `selected` is required for `detail` and
	/// `topknn`.
	#[napi]
	pub fn get_display(
		&mut self,
		display_type: String,
		selected: Option<u32>,
		page: Option<u32>,
	) -> Result<JsDisplay> {
		let display_type = DisplayType::from_str(&display_type).map_err(to_napi_err)?;
		let selected = selected.map(|id| id as FrameId);
		let page = page.unwrap_or(0) as usize;

		self.inner
			.get_display(display_type, selected, page)
			.map(convert_display)
			.map_err(to_napi_err)
	}
}
