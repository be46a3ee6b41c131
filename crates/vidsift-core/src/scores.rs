//! Per-frame relevance scores.
//!
//! The model is one strictly-positive weight per frame. Rescoring operators
//! multiply into it (keyword distances, Bayesian feedback) and
//! [`ScoreModel::normalize`] then rescales so the best frame sits at 1.0
//! with everything clamped above [`MINIMAL_SCORE`]. Ranking, sampling and
//! the capped top-N selections all read from the same vector.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::{
	BAYES_MAX_OTHERS, BAYES_SIGMA, DISPLAY_GRID_WIDTH, MINIMAL_SCORE,
	TOP_N_SELECTED_FRAME_POSITION,
};
use crate::features::FeatureStore;
use crate::frames::FrameIndex;
use crate::{FrameId, ShotId, VideoId};

/// Strictly-positive per-frame score vector.
pub struct ScoreModel {
	scores: Vec<f32>,
}

impl ScoreModel {
	/// Uniform model over `n` frames.
	#[must_use]
	pub fn new(n: usize) -> Self {
		Self {
			scores: vec![1.0; n],
		}
	}

	/// Return every score to 1.0.
	pub fn reset(&mut self) {
		for score in &mut self.scores {
			*score = 1.0;
		}
	}

	/// Multiply frame `i` by `p`.
	pub fn adjust(&mut self, i: FrameId, p: f32) {
		self.scores[i] *= p;
	}

	/// Overwrite frame `i` with `p`.
	pub fn set(&mut self, i: FrameId, p: f32) {
		self.scores[i] = p;
	}

	/// Score of frame `i`.
	#[must_use]
	pub fn get(&self, i: FrameId) -> f32 {
		self.scores[i]
	}

	/// All scores, indexed by frame id.
	#[must_use]
	pub fn as_slice(&self) -> &[f32] {
		&self.scores
	}

	/// Number of frames.
	#[must_use]
	pub fn len(&self) -> usize {
		self.scores.len()
	}

	/// True when the model covers no frames.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.scores.is_empty()
	}

	/// Divide by the maximum and clamp to the [`MINIMAL_SCORE`] floor.
	///
	/// When every entry already sits below the floor the floor itself
	/// serves as the divisor; the anomaly is logged and normalization
	/// proceeds.
	pub fn normalize(&mut self) {
		let mut max = 0.0f32;
		for &score in &self.scores {
			if score > max {
				max = score;
			}
		}

		if max < MINIMAL_SCORE {
			warn!("all frames have negligible score");
			max = MINIMAL_SCORE;
		}

		for score in &mut self.scores {
			*score = (*score / max).max(MINIMAL_SCORE);
		}
	}

	/// How many frames strictly outscore frame `i`.
	#[must_use]
	pub fn rank_of(&self, i: FrameId) -> usize {
		let reference = self.scores[i];
		self.scores.iter().filter(|&&s| s > reference).count()
	}

	/// Best `n` frames by descending score (ties to the lower id), with at
	/// most `per_video` frames per video and `per_shot` per shot; 0
	/// disables the respective cap. Cap counters advance on admission
	/// only.
	#[must_use]
	pub fn top_n(
		&self,
		frames: &FrameIndex,
		n: usize,
		per_video: usize,
		per_shot: usize,
	) -> Vec<FrameId> {
		let per_video = if per_video == 0 { self.scores.len() } else { per_video };
		let per_shot = if per_shot == 0 { self.scores.len() } else { per_shot };
		let n = n.min(self.scores.len());

		let mut ranked: Vec<(f32, FrameId)> = self
			.scores
			.iter()
			.enumerate()
			.map(|(i, &s)| (s, i))
			.collect();
		ranked.sort_unstable_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

		let mut per_video_count = vec![0usize; frames.num_videos()];
		let mut per_shot_count: HashMap<(VideoId, ShotId), usize> = HashMap::new();
		let mut result = Vec::with_capacity(n);

		for (_, id) in ranked {
			if result.len() >= n {
				break;
			}
			let Some(frame) = frames.get(id) else { continue };
			if per_video_count[frame.video_id as usize] >= per_video {
				continue;
			}
			let shot_count = per_shot_count
				.entry((frame.video_id, frame.shot_id))
				.or_insert(0);
			if *shot_count >= per_shot {
				continue;
			}

			per_video_count[frame.video_id as usize] += 1;
			*shot_count += 1;
			result.push(id);
		}

		result
	}

	/// Top-N seeds expanded into strips of [`DISPLAY_GRID_WIDTH`]
	/// consecutive frames, the seed sitting at position
	/// [`TOP_N_SELECTED_FRAME_POSITION`]. Neighbors that fall outside the
	/// seed's video are emitted as `None`.
	#[must_use]
	pub fn top_n_with_context(
		&self,
		frames: &FrameIndex,
		n: usize,
		per_video: usize,
		per_shot: usize,
	) -> Vec<Option<FrameId>> {
		let width = DISPLAY_GRID_WIDTH;
		let seeds = self.top_n(frames, n.div_ceil(width), per_video, per_shot);

		let mut result = Vec::with_capacity(seeds.len() * width);
		for seed in seeds {
			let video = frames.video_id_of(seed);
			for slot in 0..width {
				let neighbor = (seed + slot).checked_sub(TOP_N_SELECTED_FRAME_POSITION);
				match neighbor {
					Some(id) if id < frames.len() && frames.video_id_of(id) == video => {
						result.push(Some(id));
					}
					_ => result.push(None),
				}
			}
		}

		result
	}

	/// Sample `k` distinct frames with probability proportional to
	/// `score^exponent`, by drawing from a prefix-sum binary tree and
	/// zeroing each sampled leaf.
	///
	/// # Panics
	///
	/// Panics unless `k < n` and `n ≥ 2`.
	#[must_use]
	pub fn weighted_sample(&self, k: usize, exponent: f32) -> Vec<FrameId> {
		let n = self.scores.len();
		assert!(n >= 2, "weighted_sample needs at least two frames");
		assert!(k < n, "weighted_sample needs k < n");

		let mut rng = rand::thread_rng();

		// Leaves live at [branches, branches + n); every internal node
		// holds the sum of its children.
		let branches = n - 1;
		let mut tree = vec![0.0f32; branches + n];
		for i in 0..n {
			tree[branches + i] = self.scores[i].powf(exponent);
		}
		for i in (0..branches).rev() {
			tree[i] = tree[2 * i + 1] + tree.get(2 * i + 2).copied().unwrap_or(0.0);
		}

		let mut result = Vec::with_capacity(k);
		for _ in 0..k {
			let mut x: f32 = rng.gen::<f32>() * tree[0];
			let mut i = 0;
			while i < branches {
				let left = 2 * i + 1;
				let right = 2 * i + 2;
				if right < branches + n && x >= tree[left] {
					x -= tree[left];
					i = right;
				} else {
					i = left;
				}
			}

			result.push(i - branches);

			// Zero the sampled leaf and repropagate the sums upward.
			tree[i] = 0.0;
			let mut node = i;
			loop {
				let left = 2 * node + 1;
				if left < branches + n {
					tree[node] =
						tree[left] + tree.get(left + 1).copied().unwrap_or(0.0);
				}
				if node == 0 {
					break;
				}
				node = (node - 1) / 2;
			}
		}

		result
	}

	/// Pick one member of `subset` with probability proportional to its
	/// score. `None` on an empty subset.
	#[must_use]
	pub fn weighted_example(&self, subset: &[FrameId]) -> Option<FrameId> {
		let weights: Vec<f32> = subset.iter().map(|&i| self.scores[i]).collect();
		let dist = WeightedIndex::new(weights).ok()?;
		Some(subset[dist.sample(&mut rand::thread_rng())])
	}

	/// Bayesian relevance feedback.
	///
	/// Every liked frame pulls the distribution toward itself relative to
	/// the non-liked shown context (downsampled to [`BAYES_MAX_OTHERS`]);
	/// each frame's score is multiplied by the likelihood that the user
	/// preferred the likes over the context, then the model is normalized.
	pub fn apply_bayes(
		&mut self,
		likes: &BTreeSet<FrameId>,
		shown: &BTreeSet<FrameId>,
		features: &FeatureStore,
	) {
		if likes.is_empty() {
			return;
		}

		let mut others: Vec<FrameId> = shown
			.iter()
			.filter(|id| !likes.contains(id))
			.copied()
			.collect();

		if others.len() > BAYES_MAX_OTHERS {
			// Partial Fisher-Yates: only the kept prefix needs shuffling.
			let mut rng = rand::thread_rng();
			for i in 0..BAYES_MAX_OTHERS {
				let j = rng.gen_range(i..others.len());
				others.swap(i, j);
			}
			others.truncate(BAYES_MAX_OTHERS);
		}

		let likes_vec: Vec<FrameId> = likes.iter().copied().collect();
		let started = Instant::now();

		self.scores
			.par_iter_mut()
			.enumerate()
			.for_each(|(id, score)| {
				let div_sum: f32 = others
					.iter()
					.map(|&other| (-features.d_dot(id, other) / BAYES_SIGMA).exp())
					.sum();

				for &like in &likes_vec {
					let like_val = (-features.d_dot(id, like) / BAYES_SIGMA).exp();
					*score *= like_val / (like_val + div_sum);
				}
			});

		debug!(elapsed = ?started.elapsed(), likes = likes_vec.len(), others = others.len(), "bayes update");

		self.normalize();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::features::tests::store_from_angles;
	use crate::frames::tests::index_from_layout;

	#[test]
	fn test_normalize_bounds_and_idempotence() {
		let mut model = ScoreModel::new(4);
		model.adjust(0, 0.5);
		model.adjust(1, 2.0);
		model.adjust(2, 1e-20);
		model.normalize();

		let max = model.as_slice().iter().fold(0.0f32, |m, &s| m.max(s));
		assert!((max - 1.0).abs() < 1e-6);
		for &s in model.as_slice() {
			assert!(s > 0.0 && s <= 1.0);
		}
		assert_eq!(model.get(2), MINIMAL_SCORE);

		let before = model.as_slice().to_vec();
		model.normalize();
		assert_eq!(model.as_slice(), &before[..]);
	}

	#[test]
	fn test_normalize_all_negligible_uses_floor() {
		let mut model = ScoreModel::new(3);
		for i in 0..3 {
			model.set(i, 0.0);
		}
		model.normalize();
		for &s in model.as_slice() {
			assert_eq!(s, MINIMAL_SCORE);
		}
	}

	#[test]
	fn test_reset_restores_uniform() {
		let mut model = ScoreModel::new(3);
		model.adjust(1, 0.25);
		model.normalize();
		model.reset();
		assert_eq!(model.as_slice(), &[1.0, 1.0, 1.0]);
	}

	#[test]
	fn test_top_n_uniform_breaks_ties_by_id() {
		let frames = index_from_layout(&[(0, 0, 0), (0, 1, 1), (1, 0, 0), (1, 1, 1)]);
		let model = ScoreModel::new(4);
		assert_eq!(model.top_n(&frames, 3, 0, 0), vec![0, 1, 2]);
	}

	#[test]
	fn test_top_n_orders_by_score() {
		let frames = index_from_layout(&[(0, 0, 0), (1, 0, 0), (2, 0, 0)]);
		let mut model = ScoreModel::new(3);
		model.set(0, 0.1);
		model.set(1, 1.0);
		model.set(2, 0.5);
		assert_eq!(model.top_n(&frames, 3, 0, 0), vec![1, 2, 0]);
	}

	#[test]
	fn test_top_n_honors_caps() {
		// Four frames of video 0 (two shots), one frame of video 1.
		let frames = index_from_layout(&[
			(0, 0, 0),
			(0, 0, 1),
			(0, 1, 2),
			(0, 1, 3),
			(1, 0, 0),
		]);
		let model = ScoreModel::new(5);

		let capped = model.top_n(&frames, 10, 2, 1);
		let video0: Vec<_> = capped.iter().filter(|&&id| id < 4).collect();
		assert_eq!(video0.len(), 2);
		assert_eq!(capped, vec![0, 2, 4]);
	}

	#[test]
	fn test_top_n_context_strips_and_sentinels() {
		let frames = index_from_layout(&[
			(0, 0, 0),
			(0, 0, 1),
			(0, 0, 2),
			(0, 0, 3),
			(1, 0, 0),
		]);
		let mut model = ScoreModel::new(5);
		model.set(2, 2.0);

		// One seed -> one strip of DISPLAY_GRID_WIDTH slots around id 2.
		let strip = model.top_n_with_context(&frames, 1, 0, 0);
		assert_eq!(strip.len(), DISPLAY_GRID_WIDTH);
		assert_eq!(strip[TOP_N_SELECTED_FRAME_POSITION], Some(2));
		assert_eq!(&strip[..4], &[Some(0), Some(1), Some(2), Some(3)]);
		// Frame 4 belongs to another video; the strip tail is empty.
		assert_eq!(&strip[4..], &[None, None]);
	}

	#[test]
	fn test_weighted_sample_returns_distinct_ids() {
		let model = ScoreModel::new(10);
		let sample = model.weighted_sample(6, 3.0);
		assert_eq!(sample.len(), 6);

		let unique: BTreeSet<_> = sample.iter().collect();
		assert_eq!(unique.len(), 6);
		assert!(sample.iter().all(|&id| id < 10));
	}

	#[test]
	fn test_weighted_sample_prefers_heavy_frames() {
		let mut model = ScoreModel::new(8);
		for i in 1..8 {
			model.set(i, 1e-9);
		}
		// Frame 0 carries virtually all the mass at exponent 1.
		for _ in 0..16 {
			assert_eq!(model.weighted_sample(1, 1.0)[0], 0);
		}
	}

	#[test]
	fn test_weighted_example_stays_in_subset() {
		let model = ScoreModel::new(10);
		let subset = [2, 5, 7];
		for _ in 0..8 {
			let picked = model.weighted_example(&subset).unwrap();
			assert!(subset.contains(&picked));
		}
		assert!(model.weighted_example(&[]).is_none());
	}

	#[test]
	fn test_apply_bayes_pulls_toward_likes() {
		let features = store_from_angles(&[0.0, 10.0, 90.0], 0);
		let mut model = ScoreModel::new(3);

		let likes: BTreeSet<FrameId> = [0].into_iter().collect();
		let shown: BTreeSet<FrameId> = [0, 1, 2].into_iter().collect();
		model.apply_bayes(&likes, &shown, &features);

		assert!((model.get(0) - 1.0).abs() < 1e-6);
		assert!(model.get(1) < model.get(0));
		assert!(model.get(2) < model.get(1));
	}

	#[test]
	fn test_apply_bayes_without_likes_is_noop() {
		let features = store_from_angles(&[0.0, 90.0], 0);
		let mut model = ScoreModel::new(2);
		model.set(1, 0.25);

		model.apply_bayes(&BTreeSet::new(), &[0, 1].into_iter().collect(), &features);
		assert_eq!(model.as_slice(), &[1.0, 0.25]);
	}

	#[test]
	fn test_rank_of() {
		let mut model = ScoreModel::new(4);
		model.set(0, 0.1);
		model.set(1, 0.9);
		model.set(2, 0.5);
		model.set(3, 0.9);

		assert_eq!(model.rank_of(1), 0);
		assert_eq!(model.rank_of(3), 0);
		assert_eq!(model.rank_of(2), 2);
		assert_eq!(model.rank_of(0), 3);
	}
}
