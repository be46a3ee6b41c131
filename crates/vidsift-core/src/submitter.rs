//! Telemetry sink and submission client.
//!
//! Engine operations append structured events to a backlog; the backlog is
//! flushed as one `interaction` batch whenever a poll notices the configured
//! period has elapsed. Submissions and rescore reports dispatch immediately.
//! Every dispatch runs on its own short-lived thread: it archives the
//! payload to a timestamped file first and only then attempts the HTTP POST,
//! so a dead endpoint never loses data and never stalls the session.
//! Finished dispatch threads signal a completion token over a channel and
//! are reaped on the next poll.

use std::fs;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, Sender};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::SubmitterConfig;
use crate::engine::{DisplayType, UsedTools};
use crate::frames::FrameIndex;
use crate::scores::ScoreModel;
use crate::FrameId;

/// Milliseconds since the Unix epoch.
pub(crate) fn timestamp_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map_or(0, |d| d.as_millis() as u64)
}

/// Append-only event backlog plus per-dispatch sender threads.
pub struct Submitter {
	cfg: SubmitterConfig,
	backlog: Vec<Value>,
	last_flush_ms: u64,
	threads: Vec<(u64, JoinHandle<()>)>,
	next_token: u64,
	done_tx: Sender<u64>,
	done_rx: Receiver<u64>,
	last_scroll_ms: u64,
	last_scroll_display: Option<DisplayType>,
	last_replay_ms: u64,
	last_replay_frame: Option<FrameId>,
}

impl Submitter {
	/// Sink with an empty backlog and a freshly started flush timer.
	#[must_use]
	pub fn new(cfg: SubmitterConfig) -> Self {
		let (done_tx, done_rx) = crossbeam_channel::unbounded();
		Self {
			cfg,
			backlog: Vec::new(),
			last_flush_ms: timestamp_ms(),
			threads: Vec::new(),
			next_token: 0,
			done_tx,
			done_rx,
			last_scroll_ms: 0,
			last_scroll_display: None,
			last_replay_ms: 0,
			last_replay_frame: None,
		}
	}

	/// Flush the backlog when the period elapsed and reap finished
	/// dispatch threads. Called at the top of every engine operation.
	pub fn poll(&mut self) {
		if self.last_flush_ms + self.cfg.send_logs_to_server_period < timestamp_ms() {
			self.send_backlog_only();
		}

		while let Ok(token) = self.done_rx.try_recv() {
			if let Some(pos) = self.threads.iter().position(|(t, _)| *t == token) {
				let (_, handle) = self.threads.swap_remove(pos);
				let _ = handle.join();
			}
		}
	}

	/// Flush pending events without any accompanying query.
	pub fn send_backlog_only(&mut self) {
		self.send_query_with_backlog("");
	}

	/// Record a like on a frame.
	pub fn log_like(&mut self, frames: &FrameIndex, frame_id: FrameId) {
		if let Some(value) = frame_event_value(frames, frame_id, "like") {
			self.push_event("image", "feedbackModel", &value);
		}
	}

	/// Record a withdrawn like.
	pub fn log_dislike(&mut self, frames: &FrameIndex, frame_id: FrameId) {
		if let Some(value) = frame_event_value(frames, frame_id, "dislike") {
			self.push_event("image", "feedbackModel", &value);
		}
	}

	/// Record an applied text query.
	pub fn log_add_keywords(&mut self, query: &str) {
		self.push_event("text", "jointEmbedding", query);
	}

	/// Record a session reset.
	pub fn log_reset_search(&mut self) {
		self.push_event("browsing", "resetAll", "");
	}

	/// Record that the random display was shown.
	pub fn log_show_random_display(&mut self) {
		self.push_event("browsing", "randomSelection", "random_display;");
	}

	/// Record that the SOM display was shown.
	pub fn log_show_som_display(&mut self) {
		self.push_event("browsing", "exploration", "som_display");
	}

	/// Record that the top-N display was shown.
	pub fn log_show_topn_display(&mut self) {
		self.push_event("browsing", "rankedList", "topn_display");
	}

	/// Record that the top-N context display was shown.
	pub fn log_show_topn_context_display(&mut self) {
		self.push_event("browsing", "rankedList", "topn_context_display;");
	}

	/// Record a KNN browse around a frame.
	pub fn log_show_topknn_display(&mut self, frames: &FrameIndex, frame_id: FrameId) {
		if let Some(value) = frame_event_value(frames, frame_id, "topknn_display") {
			self.push_event("image", "globalFeatures", &value);
		}
	}

	/// Record that a video detail was opened.
	pub fn log_show_detail_display(&mut self, frames: &FrameIndex, frame_id: FrameId) {
		if let Some(value) = frame_event_value(frames, frame_id, "video_detail") {
			self.push_event("browsing", "videoSummary", &value);
		}
	}

	/// Scroll event, rate-limited per display type.
	pub fn log_scroll(&mut self, display: DisplayType, dir_y: f32) {
		let (ev_type, disp_name) = match display {
			DisplayType::TopN => ("rankedList", "topn_display"),
			DisplayType::TopNContext => ("rankedList", "topn_display_with_context"),
			DisplayType::TopKnn => ("rankedList", "topknn_display"),
			DisplayType::VideoDetail => ("videoSummary", "video_detail"),
			_ => return,
		};

		let now = timestamp_ms();
		if self.last_scroll_ms + self.cfg.log_replay_timeout > now
			&& self.last_scroll_display == Some(display)
		{
			return;
		}
		self.last_scroll_ms = now;
		self.last_scroll_display = Some(display);

		let direction = if dir_y > 0.0 { "Up" } else { "Down" };
		let value = format!("scroll{direction};{dir_y};{disp_name};");
		self.push_event("browsing", ev_type, &value);
	}

	/// Video replay event, rate-limited per frame.
	pub fn log_video_replay(&mut self, frames: &FrameIndex, frame_id: FrameId) {
		let now = timestamp_ms();
		if self.last_replay_ms + self.cfg.log_replay_timeout > now
			&& self.last_replay_frame == Some(frame_id)
		{
			return;
		}
		self.last_replay_ms = now;
		self.last_replay_frame = Some(frame_id);

		if let Some(value) = frame_event_value(frames, frame_id, "replay") {
			self.push_event("browsing", "temporalContext", &value);
		}
	}

	/// Log the submitted frame and dispatch the submission query,
	/// flushing the backlog along with it.
	pub fn submit_and_log_submit(&mut self, frames: &FrameIndex, frame_id: FrameId) {
		if let Some(value) = frame_event_value(frames, frame_id, "submit") {
			self.push_event("image", "submit", &value);
		}

		let Some(frame) = frames.get(frame_id) else { return };
		// Server-side videos are 1-based, frame numbers 0-based.
		let query = format!(
			"team={}&member={}&video={}&frame={}",
			self.cfg.team_id,
			self.cfg.member_id,
			frame.video_id + 1,
			frame.frame_number
		);
		self.send_query_with_backlog(&query);
	}

	/// Dispatch a rescore result report for the current top-N.
	pub fn submit_and_log_rescore(
		&mut self,
		frames: &FrameIndex,
		scores: &ScoreModel,
		used_tools: &UsedTools,
		top_ids: &[FrameId],
		last_query: &str,
		per_video_limit: usize,
		per_shot_limit: usize,
	) {
		let results: Vec<Value> = top_ids
			.iter()
			.filter_map(|&id| frames.get(id))
			.map(|frame| {
				json!({
					"video": frame.video_id + 1,
					"frame": frame.frame_number,
					"score": f64::from(scores.get(frame.frame_id)),
				})
			})
			.collect();

		let mut used_categories: Vec<&str> = Vec::new();
		let mut used_types: Vec<&str> = Vec::new();
		let mut sort_types: Vec<&str> = Vec::new();

		let mut value = format!("{last_query};");
		if used_tools.topknn_used {
			value.push_str("show_knn;");
			used_categories.push("image");
			used_types.push("feedbackModel");
			sort_types.push("feedbackModel");
		} else {
			value.push_str("normal_rescore;");
			if used_tools.kws_used {
				used_categories.push("text");
				used_types.push("jointEmbedding");
				sort_types.push("jointEmbedding");
			}
			if used_tools.bayes_used {
				used_categories.push("image");
				used_types.push("feedbackModel");
				sort_types.push("feedbackModel");
			}
		}
		value.push_str(&format!(
			"from_video_limit={per_video_limit};from_shot_limit={per_shot_limit}"
		));

		let report = json!({
			"teamId": self.cfg.team_id,
			"memberId": self.cfg.member_id,
			"timestamp": timestamp_ms(),
			"usedCategories": used_categories,
			"usedTypes": used_types,
			"sortType": sort_types,
			"resultSetAvailability": "top",
			"type": "result",
			"value": value,
			"results": results,
		});

		let url = self.cfg.submit_rerank_url.clone();
		self.start_sender(&url, "", &report.to_string());
	}

	fn push_event(&mut self, category: &str, ev_type: &str, value: &str) {
		self.backlog.push(json!({
			"teamId": self.cfg.team_id,
			"memberId": self.cfg.member_id,
			"timestamp": timestamp_ms(),
			"category": category,
			"type": ev_type,
			"value": value,
		}));
	}

	fn send_query_with_backlog(&mut self, query: &str) {
		if !self.backlog.is_empty() {
			let batch = json!({
				"timestamp": timestamp_ms(),
				"events": std::mem::take(&mut self.backlog),
				"type": "interaction",
			});
			let url = self.cfg.submit_url.clone();
			self.start_sender(&url, query, &batch.to_string());
		} else if !query.is_empty() {
			let url = self.cfg.submit_url.clone();
			self.start_sender(&url, query, "");
		}

		// The timer restarts even when there was nothing to send.
		self.last_flush_ms = timestamp_ms();
	}

	fn start_sender(&mut self, url: &str, query: &str, body: &str) {
		let token = self.next_token;
		self.next_token += 1;

		let cfg = self.cfg.clone();
		let url = url.to_owned();
		let query = query.to_owned();
		let body = body.to_owned();
		let done = self.done_tx.clone();

		let spawned = std::thread::Builder::new()
			.name("submit-dispatch".into())
			.spawn(move || {
				dispatch(&cfg, token, &url, &query, &body);
				let _ = done.send(token);
			});

		match spawned {
			Ok(handle) => self.threads.push((token, handle)),
			Err(err) => warn!(%err, "could not spawn dispatch thread"),
		}
	}

	#[cfg(test)]
	pub(crate) fn backlog(&self) -> &[Value] {
		&self.backlog
	}
}

impl Drop for Submitter {
	fn drop(&mut self) {
		self.send_backlog_only();
		for (_, handle) in self.threads.drain(..) {
			let _ = handle.join();
		}
	}
}

/// `VId{video+1},FN{frame_number};FId{frame_id};{action};`
fn frame_event_value(frames: &FrameIndex, frame_id: FrameId, action: &str) -> Option<String> {
	let frame = frames.get(frame_id)?;
	Some(format!(
		"VId{},FN{};FId{};{action};",
		frame.video_id + 1,
		frame.frame_number,
		frame_id
	))
}

/// Archive the payload, then POST it when configured. Runs on a dispatch
/// thread; every failure is logged and swallowed.
fn dispatch(cfg: &SubmitterConfig, token: u64, url: &str, query: &str, body: &str) {
	if let Err(err) = archive(cfg, token, url, query, body) {
		warn!(%err, "failed to archive dispatch");
	}

	if cfg.extra_verbose_log {
		debug!(query, body, "dispatching");
	}

	if cfg.submit_to_server {
		let full_url = if query.is_empty() {
			url.to_owned()
		} else {
			format!("{url}?{query}")
		};

		let agent = ureq::AgentBuilder::new()
			.timeout_connect(Duration::from_secs(30))
			.build();
		match agent
			.post(&full_url)
			.set("Content-Type", "application/json")
			.send_string(body)
		{
			Ok(_) => info!("submit ok"),
			Err(err) => warn!(%err, "submit failed"),
		}
	}
}

fn archive(cfg: &SubmitterConfig, token: u64, url: &str, query: &str, body: &str) -> std::io::Result<()> {
	fs::create_dir_all(&cfg.submit_archive_dir)?;

	// The token keeps same-millisecond dispatches from clobbering each
	// other.
	let path: PathBuf = cfg.submit_archive_dir.join(format!(
		"{}_{token}{}",
		timestamp_ms(),
		cfg.submit_archive_log_suffix
	));

	let mut record = json!({
		"query_string": query,
		"submit_url": url,
	});
	if !body.is_empty() {
		let data: Value =
			serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_owned()));
		record["data"] = data;
	}

	let text = serde_json::to_string_pretty(&record).map_err(std::io::Error::other)?;
	fs::write(path, text)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::frames::tests::index_from_layout;

	fn test_cfg(archive_dir: &std::path::Path) -> SubmitterConfig {
		SubmitterConfig {
			submit_to_server: false,
			submit_rerank_url: "http://localhost:1/rerank".into(),
			submit_url: "http://localhost:1/submit".into(),
			team_id: 4,
			member_id: 2,
			submit_archive_dir: archive_dir.to_path_buf(),
			submit_archive_log_suffix: ".json".into(),
			extra_verbose_log: false,
			send_logs_to_server_period: 60_000,
			log_replay_timeout: 60_000,
		}
	}

	fn archived_records(dir: &std::path::Path) -> Vec<Value> {
		let mut records = Vec::new();
		for entry in fs::read_dir(dir).unwrap() {
			let text = fs::read_to_string(entry.unwrap().path()).unwrap();
			records.push(serde_json::from_str(&text).unwrap());
		}
		records
	}

	#[test]
	fn test_like_event_shape() {
		let dir = tempfile::tempdir().unwrap();
		let frames = index_from_layout(&[(0, 0, 0), (1, 0, 5)]);
		let mut submitter = Submitter::new(test_cfg(dir.path()));

		submitter.log_like(&frames, 1);

		let events = submitter.backlog();
		assert_eq!(events.len(), 1);
		assert_eq!(events[0]["teamId"], 4);
		assert_eq!(events[0]["memberId"], 2);
		assert_eq!(events[0]["category"], "image");
		assert_eq!(events[0]["type"], "feedbackModel");
		assert_eq!(events[0]["value"], "VId2,FN5;FId1;like;");
	}

	#[test]
	fn test_scroll_rate_limit_dedups_same_display() {
		let dir = tempfile::tempdir().unwrap();
		let mut submitter = Submitter::new(test_cfg(dir.path()));

		submitter.log_scroll(DisplayType::TopN, -1.0);
		submitter.log_scroll(DisplayType::TopN, -2.0);
		assert_eq!(submitter.backlog().len(), 1);

		// A different display logs immediately.
		submitter.log_scroll(DisplayType::VideoDetail, 1.0);
		assert_eq!(submitter.backlog().len(), 2);
		assert_eq!(submitter.backlog()[1]["type"], "videoSummary");
	}

	#[test]
	fn test_submission_flushes_backlog_with_query() {
		let dir = tempfile::tempdir().unwrap();
		let frames = index_from_layout(&[(0, 0, 0), (0, 0, 8)]);
		{
			let mut submitter = Submitter::new(test_cfg(dir.path()));
			submitter.log_like(&frames, 0);
			submitter.submit_and_log_submit(&frames, 1);
		}

		let records = archived_records(dir.path());
		let submission = records
			.iter()
			.find(|r| r["query_string"] != "")
			.expect("submission record");
		assert_eq!(submission["query_string"], "team=4&member=2&video=1&frame=8");
		assert_eq!(submission["data"]["type"], "interaction");
		let events = submission["data"]["events"].as_array().unwrap();
		assert_eq!(events.len(), 2);
		assert_eq!(events[0]["value"], "VId1,FN0;FId0;like;");
	}

	#[test]
	fn test_rescore_report_wire_format() {
		let dir = tempfile::tempdir().unwrap();
		let frames = index_from_layout(&[(0, 0, 0), (0, 0, 4), (1, 0, 2)]);
		let scores = ScoreModel::new(3);
		{
			let mut submitter = Submitter::new(test_cfg(dir.path()));
			let used = UsedTools {
				kws_used: true,
				bayes_used: true,
				topknn_used: false,
			};
			submitter.submit_and_log_rescore(&frames, &scores, &used, &[2, 0], "dog park", 3, 1);
		}

		let records = archived_records(dir.path());
		let report = &records[0]["data"];
		assert_eq!(report["type"], "result");
		assert_eq!(report["resultSetAvailability"], "top");
		assert_eq!(
			report["value"],
			"dog park;normal_rescore;from_video_limit=3;from_shot_limit=1"
		);
		assert_eq!(
			report["usedCategories"],
			serde_json::json!(["text", "image"])
		);
		assert_eq!(
			report["usedTypes"],
			serde_json::json!(["jointEmbedding", "feedbackModel"])
		);
		let results = report["results"].as_array().unwrap();
		assert_eq!(results[0]["video"], 2);
		assert_eq!(results[0]["frame"], 2);
		assert_eq!(results[1]["video"], 1);
	}

	#[test]
	fn test_knn_report_marks_show_knn() {
		let dir = tempfile::tempdir().unwrap();
		let frames = index_from_layout(&[(0, 0, 0)]);
		let scores = ScoreModel::new(1);
		{
			let mut submitter = Submitter::new(test_cfg(dir.path()));
			let used = UsedTools {
				kws_used: false,
				bayes_used: false,
				topknn_used: true,
			};
			submitter.submit_and_log_rescore(&frames, &scores, &used, &[0], "", 0, 0);
		}

		let records = archived_records(dir.path());
		let report = &records[0]["data"];
		assert_eq!(report["value"], ";show_knn;from_video_limit=0;from_shot_limit=0");
		assert_eq!(report["usedCategories"], serde_json::json!(["image"]));
	}
}
