//! The session engine.
//!
//! One [`Engine`] instance serves one user search session. It owns the
//! immutable dataset (frame index, feature store, keyword tables), the
//! mutable search context (score model, like set, shown-frame context, the
//! last text query, the current display), the background SOM worker and the
//! telemetry sink. The public API is strictly request–response and single
//! threaded; only the SOM worker and telemetry dispatches run in the
//! background.

use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;

use tracing::{debug, info, warn};

use crate::config::{
	Config, DISPLAY_GRID_HEIGHT, DISPLAY_GRID_WIDTH, RANDOM_DISPLAY_WEIGHT,
	SOM_DISPLAY_GRID_HEIGHT, SOM_DISPLAY_GRID_WIDTH, TOPN_LIMIT,
};
use crate::error::{CoreError, Result};
use crate::features::FeatureStore;
use crate::frames::FrameIndex;
use crate::keywords::{Keyword, KeywordRanker};
use crate::scores::ScoreModel;
use crate::som_worker::SomWorker;
use crate::submitter::Submitter;
use crate::{FrameId, PageId};

/// Kinds of displays the engine can assemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayType {
	/// No display shown yet
	Null,
	/// Paged list of the best-scoring frames
	TopN,
	/// Top-N seeds expanded into video context strips
	TopNContext,
	/// One representative frame per SOM grid cell
	Som,
	/// Every frame of the selected frame's video
	VideoDetail,
	/// Nearest neighbors of the selected frame
	TopKnn,
	/// Score-weighted random sample
	Random,
}

impl DisplayType {
	/// Wire tag of this display type.
	#[must_use]
	pub fn as_tag(&self) -> &'static str {
		match self {
			Self::Null => "null",
			Self::TopN => "topn",
			Self::TopNContext => "topnctx",
			Self::Som => "som",
			Self::VideoDetail => "detail",
			Self::TopKnn => "topknn",
			Self::Random => "random",
		}
	}
}

impl FromStr for DisplayType {
	type Err = CoreError;

	fn from_str(tag: &str) -> Result<Self> {
		match tag {
			"topn" => Ok(Self::TopN),
			"topnctx" => Ok(Self::TopNContext),
			"som" => Ok(Self::Som),
			"detail" => Ok(Self::VideoDetail),
			"topknn" => Ok(Self::TopKnn),
			"random" => Ok(Self::Random),
			other => Err(CoreError::UnknownDisplay(other.to_owned())),
		}
	}
}

/// Which tools shaped the current scores; reported with every rescore.
#[derive(Debug, Default, Clone, Copy)]
pub struct UsedTools {
	/// A text query was applied
	pub kws_used: bool,
	/// Bayesian feedback was applied
	pub bayes_used: bool,
	/// The ranking came from a KNN browse
	pub topknn_used: bool,
}

impl UsedTools {
	/// Clear all markers.
	pub fn reset(&mut self) {
		*self = Self::default();
	}
}

/// One slot of an assembled display.
#[derive(Debug, Clone)]
pub struct DisplayFrame {
	/// Frame id, `None` for an empty cell
	pub id: Option<FrameId>,
	/// Whether the frame is currently liked
	pub liked: bool,
	/// Image source path, prefix + stored filename
	pub src: String,
}

/// An assembled, possibly paged display.
#[derive(Debug, Clone, Default)]
pub struct Display {
	/// The page this slice represents
	pub page: PageId,
	/// Frames in display order
	pub frames: Vec<DisplayFrame>,
}

/// The interactive retrieval engine; one instance per user session.
pub struct Engine {
	config: Config,
	frames: FrameIndex,
	features: FeatureStore,
	keywords: KeywordRanker,

	scores: ScoreModel,
	last_text_query: String,
	likes: BTreeSet<FrameId>,
	shown: BTreeSet<FrameId>,

	current_display: Vec<Option<FrameId>>,
	current_display_type: DisplayType,

	som: SomWorker,
	submitter: Submitter,
	used_tools: UsedTools,
}

impl Engine {
	/// Build an engine from an already-parsed configuration, loading every
	/// dataset file and starting the background workers.
	///
	/// # Errors
	///
	/// Any missing or malformed dataset file, and any dimension
	/// disagreement between the loaded tables, fails construction.
	pub fn new(config: Config) -> Result<Self> {
		config.validate()?;

		let frames = FrameIndex::from_file(
			&config.frames_list_file,
			config.filename_offsets,
			&config.frames_path_prefix,
		)?;
		let features = FeatureStore::from_file(
			&config.features_file,
			config.features_file_data_off,
			config.features_dim,
			frames.len(),
		)?;
		let keywords = KeywordRanker::from_files(&config)?;

		let scores = ScoreModel::new(frames.len());
		let som = SomWorker::spawn();
		let submitter = Submitter::new(config.submitter.clone());

		let engine = Self {
			frames,
			features,
			keywords,
			scores,
			last_text_query: String::new(),
			likes: BTreeSet::new(),
			shown: BTreeSet::new(),
			current_display: Vec::new(),
			current_display_type: DisplayType::Null,
			som,
			submitter,
			used_tools: UsedTools::default(),
			config,
		};

		engine.som_start();
		info!(
			frames = engine.frames.len(),
			videos = engine.frames.num_videos(),
			keywords = engine.keywords.len(),
			"engine ready"
		);
		Ok(engine)
	}

	/// Build an engine from a JSON configuration file.
	///
	/// # Errors
	///
	/// See [`Engine::new`] and [`Config::from_file`].
	pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
		Self::new(Config::from_file(path)?)
	}

	/// Number of frames in the dataset.
	#[must_use]
	pub fn num_frames(&self) -> usize {
		self.frames.len()
	}

	/// Frame metadata accessor for display consumers.
	#[must_use]
	pub fn frame(&self, id: FrameId) -> Option<&crate::frames::VideoFrame> {
		self.frames.get(id)
	}

	/// Apply a text query plus pending relevance feedback, restart the SOM
	/// and reset the browsing context.
	///
	/// A repeated identical query skips the keyword pass, so accumulated
	/// likes can be folded in without recomputing the text ranking.
	pub fn rescore(&mut self, text_query: &str) {
		self.submitter.poll();

		self.rescore_keywords(text_query);
		self.rescore_feedback();

		self.som_start();

		// The new scores open a fresh browsing context.
		self.shown.clear();
		self.likes.clear();
		self.frames.clear_liked_flags();

		let top = self.scores.top_n(
			&self.frames,
			TOPN_LIMIT,
			self.config.topn_frames_per_video,
			self.config.topn_frames_per_shot,
		);

		debug!(tools = ?self.used_tools, top = top.len(), "rescored");
		self.submitter.submit_and_log_rescore(
			&self.frames,
			&self.scores,
			&self.used_tools,
			&top,
			&self.last_text_query,
			self.config.topn_frames_per_video,
			self.config.topn_frames_per_shot,
		);
	}

	/// Mark frames as liked.
	///
	/// # Errors
	///
	/// Rejects the whole batch when any id is out of range; the session is
	/// left untouched.
	pub fn add_likes(&mut self, ids: &[FrameId]) -> Result<()> {
		self.submitter.poll();
		self.check_ids(ids)?;

		for &id in ids {
			let _ = self.likes.insert(id);
			self.frames.set_liked(id, true);
			self.submitter.log_like(&self.frames, id);
		}
		Ok(())
	}

	/// Withdraw likes.
	///
	/// # Errors
	///
	/// Rejects the whole batch when any id is out of range; the session is
	/// left untouched.
	pub fn remove_likes(&mut self, ids: &[FrameId]) -> Result<()> {
		self.submitter.poll();
		self.check_ids(ids)?;

		for &id in ids {
			let _ = self.likes.remove(&id);
			self.frames.set_liked(id, false);
			self.submitter.log_dislike(&self.frames, id);
		}
		Ok(())
	}

	/// Keyword records whose synset strings match `prefix`, best first.
	#[must_use]
	pub fn autocomplete_keywords(&self, prefix: &str, count: usize) -> Vec<&Keyword> {
		self.keywords
			.find(prefix, count)
			.into_iter()
			.filter_map(|(kw_id, _)| self.keywords.get(kw_id))
			.collect()
	}

	/// Whether the SOM worker has published a mapping for some input.
	#[must_use]
	pub fn som_ready(&self) -> bool {
		self.som.map_ready()
	}

	/// Submit a frame as the answer and flush pending telemetry with it.
	///
	/// # Errors
	///
	/// Rejects an out-of-range frame id.
	pub fn submit_to_server(&mut self, frame_id: FrameId) -> Result<()> {
		self.submitter.poll();
		self.check_ids(&[frame_id])?;
		self.submitter.submit_and_log_submit(&self.frames, frame_id);
		Ok(())
	}

	/// Drop the whole search context and start over.
	pub fn reset_all(&mut self) {
		self.submitter.poll();
		self.reset_scores();
		self.submitter.log_reset_search();
		self.som_start();
	}

	/// Record a scroll over the current display.
	pub fn log_scroll(&mut self, dir_y: f32) {
		self.submitter.poll();
		self.submitter.log_scroll(self.current_display_type, dir_y);
	}

	/// Record a video replay around the given frame.
	///
	/// # Errors
	///
	/// Rejects an out-of-range frame id.
	pub fn log_video_replay(&mut self, frame_id: FrameId) -> Result<()> {
		self.submitter.poll();
		self.check_ids(&[frame_id])?;
		self.submitter.log_video_replay(&self.frames, frame_id);
		Ok(())
	}

	/// Assemble a display of the requested type.
	///
	/// `selected` is required by [`DisplayType::VideoDetail`] and
	/// [`DisplayType::TopKnn`]; `page` applies to the paged types.
	///
	/// # Errors
	///
	/// Input errors (unknown selection, out-of-range ids) leave the
	/// session unchanged.
	pub fn get_display(
		&mut self,
		display_type: DisplayType,
		selected: Option<FrameId>,
		page: PageId,
	) -> Result<Display> {
		self.submitter.poll();

		match display_type {
			DisplayType::Random => Ok(self.get_random_display()),
			DisplayType::TopN => Ok(self.get_topn_display(page)),
			DisplayType::TopNContext => Ok(self.get_topn_context_display(page)),
			DisplayType::Som => Ok(self.get_som_display()),
			DisplayType::VideoDetail => {
				let selected =
					selected.ok_or(CoreError::SelectionRequired("detail"))?;
				self.get_video_detail_display(selected)
			}
			DisplayType::TopKnn => {
				let selected =
					selected.ok_or(CoreError::SelectionRequired("topknn"))?;
				self.get_topknn_display(selected, page)
			}
			DisplayType::Null => {
				warn!("unsupported display requested");
				Err(CoreError::UnknownDisplay("null".to_owned()))
			}
		}
	}

	fn rescore_keywords(&mut self, query: &str) {
		// No rescore when the query did not change.
		if self.last_text_query == query {
			return;
		}

		self.reset_scores();
		self.keywords
			.rank_sentence_query(query, &mut self.scores, &self.features, &self.frames);

		self.last_text_query = query.to_owned();
		self.used_tools.kws_used = true;

		self.submitter.log_add_keywords(query);
	}

	fn rescore_feedback(&mut self) {
		if self.likes.is_empty() {
			return;
		}

		self.scores
			.apply_bayes(&self.likes, &self.shown, &self.features);
		self.used_tools.bayes_used = true;
	}

	fn som_start(&self) {
		self.som.start_work(&self.features, &self.scores);
	}

	fn reset_scores(&mut self) {
		self.used_tools.reset();
		self.shown.clear();
		self.likes.clear();
		self.frames.clear_liked_flags();
		self.last_text_query.clear();
		self.scores.reset();
	}

	fn check_ids(&self, ids: &[FrameId]) -> Result<()> {
		for &id in ids {
			if id >= self.frames.len() {
				return Err(CoreError::FrameOutOfRange {
					id,
					len: self.frames.len(),
				});
			}
		}
		Ok(())
	}

	fn get_random_display(&mut self) -> Display {
		let want = DISPLAY_GRID_WIDTH * DISPLAY_GRID_HEIGHT;
		let ids: Vec<Option<FrameId>> = if self.frames.len() >= 2 {
			let count = want.min(self.frames.len() - 1);
			self.scores
				.weighted_sample(count, RANDOM_DISPLAY_WEIGHT)
				.into_iter()
				.map(Some)
				.collect()
		} else {
			Vec::new()
		};

		self.submitter.log_show_random_display();

		for id in ids.iter().flatten() {
			let _ = self.shown.insert(*id);
		}
		let display = self.display_of(0, &ids);
		self.current_display = ids;
		self.current_display_type = DisplayType::Random;
		display
	}

	fn get_topn_display(&mut self, page: PageId) -> Display {
		// Another display or the first page recomputes the list.
		if self.current_display_type != DisplayType::TopN || page == 0 {
			debug!("loading top-n display");
			let ids = self.scores.top_n(
				&self.frames,
				TOPN_LIMIT,
				self.config.topn_frames_per_video,
				self.config.topn_frames_per_shot,
			);

			self.submitter.log_show_topn_display();

			self.current_display = ids.into_iter().map(Some).collect();
			self.current_display_type = DisplayType::TopN;
		}

		self.page_from_current(page)
	}

	fn get_topn_context_display(&mut self, page: PageId) -> Display {
		if self.current_display_type != DisplayType::TopNContext || page == 0 {
			debug!("loading top-n context display");
			let ids = self.scores.top_n_with_context(
				&self.frames,
				TOPN_LIMIT,
				self.config.topn_frames_per_video,
				self.config.topn_frames_per_shot,
			);

			self.submitter.log_show_topn_context_display();

			self.current_display = ids;
			self.current_display_type = DisplayType::TopNContext;
		}

		self.page_from_current(page)
	}

	fn get_som_display(&mut self) -> Display {
		if !self.som.map_ready() {
			return Display::default();
		}

		let mapping = self.som.mapping();
		let cells = SOM_DISPLAY_GRID_WIDTH * SOM_DISPLAY_GRID_HEIGHT;

		let mut ids: Vec<Option<FrameId>> = Vec::with_capacity(cells);
		for cell in 0..cells {
			let representative = mapping
				.get(cell)
				.filter(|members| !members.is_empty())
				.and_then(|members| self.scores.weighted_example(members));
			ids.push(representative);
		}

		self.submitter.log_show_som_display();

		for id in ids.iter().flatten() {
			let _ = self.shown.insert(*id);
		}
		let display = self.display_of(0, &ids);
		self.current_display = ids;
		self.current_display_type = DisplayType::Som;
		display
	}

	fn get_video_detail_display(&mut self, selected: FrameId) -> Result<Display> {
		let video = self
			.frames
			.video_id_of(selected)
			.ok_or(CoreError::FrameOutOfRange {
				id: selected,
				len: self.frames.len(),
			})?;

		let range = self.frames.get_video_range(video).unwrap_or(0..0);
		let ids: Vec<Option<FrameId>> = range.clone().map(Some).collect();

		self.submitter.log_show_detail_display(&self.frames, selected);

		for id in range {
			let _ = self.shown.insert(id);
		}
		let display = self.display_of(0, &ids);
		self.current_display = ids;
		self.current_display_type = DisplayType::VideoDetail;
		Ok(display)
	}

	fn get_topknn_display(&mut self, selected: FrameId, page: PageId) -> Result<Display> {
		self.check_ids(&[selected])?;

		if self.current_display_type != DisplayType::TopKnn || page == 0 {
			debug!(selected, "computing KNN display");
			let ids = self.features.top_knn(
				&self.frames,
				selected,
				self.config.topn_frames_per_video,
				self.config.topn_frames_per_shot,
			);

			self.submitter.log_show_topknn_display(&self.frames, selected);

			self.current_display = ids.iter().copied().map(Some).collect();
			self.current_display_type = DisplayType::TopKnn;

			// KNN is query-by-example, so it counts as a rerank.
			let used = UsedTools {
				topknn_used: true,
				..UsedTools::default()
			};
			self.submitter.submit_and_log_rescore(
				&self.frames,
				&self.scores,
				&used,
				&ids,
				&self.last_text_query,
				self.config.topn_frames_per_video,
				self.config.topn_frames_per_shot,
			);
		}

		Ok(self.page_from_current(page))
	}

	/// Slice the current display, clamping both ends, and fold the slice
	/// into the shown context.
	fn page_from_current(&mut self, page: PageId) -> Display {
		let len = self.current_display.len();
		let page_size = self.config.display_page_size;
		let begin = page.saturating_mul(page_size).min(len);
		let end = begin.saturating_add(page_size).min(len);
		debug!(page, begin, end, len, "slicing display page");

		let slice: Vec<Option<FrameId>> = self.current_display[begin..end].to_vec();
		for id in slice.iter().flatten() {
			let _ = self.shown.insert(*id);
		}

		self.display_of(page, &slice)
	}

	fn display_of(&self, page: PageId, ids: &[Option<FrameId>]) -> Display {
		let frames = ids
			.iter()
			.map(|&id| match id {
				Some(id) => DisplayFrame {
					id: Some(id),
					liked: self.frames.get(id).is_some_and(|f| f.liked),
					src: self.frames.src(id).unwrap_or_default(),
				},
				None => DisplayFrame {
					id: None,
					liked: false,
					src: String::new(),
				},
			})
			.collect();

		Display { page, frames }
	}

	/// Read-only view of the current relevance scores.
	#[must_use]
	pub fn scores(&self) -> &ScoreModel {
		&self.scores
	}

	/// Frames the user currently likes.
	#[must_use]
	pub fn likes(&self) -> &BTreeSet<FrameId> {
		&self.likes
	}

	/// Frames already shown this session, the Bayesian feedback context.
	#[must_use]
	pub fn shown_frames(&self) -> &BTreeSet<FrameId> {
		&self.shown
	}

	/// The most recently applied text query.
	#[must_use]
	pub fn last_text_query(&self) -> &str {
		&self.last_text_query
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_display_tags_round_trip() {
		for tag in ["topn", "topnctx", "som", "detail", "topknn", "random"] {
			let parsed: DisplayType = tag.parse().unwrap();
			assert_eq!(parsed.as_tag(), tag);
		}
	}

	#[test]
	fn test_unknown_display_tag_is_input_error() {
		let err = "mosaic".parse::<DisplayType>().unwrap_err();
		assert!(err.is_input());
		assert!(matches!(err, CoreError::UnknownDisplay(tag) if tag == "mosaic"));
	}

	#[test]
	fn test_used_tools_reset() {
		let mut tools = UsedTools {
			kws_used: true,
			bayes_used: true,
			topknn_used: true,
		};
		tools.reset();
		assert!(!tools.kws_used && !tools.bayes_used && !tools.topknn_used);
	}
}
