//! Row-major store of per-frame embedding vectors.
//!
//! The matrix is read once from a binary file of little-endian `f32` rows,
//! one unit-norm row per frame, after skipping a configured header. All
//! queries are linear scans; the dataset sizes this engine targets fit the
//! scan budget and an ANN index would only blur the ranking.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use tracing::info;

use crate::config::TOPKNN_LIMIT;
use crate::distance::d_dot;
use crate::error::{CoreError, Result};
use crate::frames::FrameIndex;
use crate::{FrameId, ShotId, VideoId};

/// Immutable `N × D` matrix of frame embeddings.
pub struct FeatureStore {
	n: usize,
	dim: usize,
	data: Vec<f32>,
}

impl FeatureStore {
	/// Read embeddings for `n` frames of dimension `dim`, skipping
	/// `data_offset` header bytes.
	///
	/// # Errors
	///
	/// A missing file or one holding fewer than `n · dim` floats after the
	/// header is fatal.
	pub fn from_file(
		path: impl AsRef<Path>,
		data_offset: u64,
		dim: usize,
		n: usize,
	) -> Result<Self> {
		let path = path.as_ref();
		let mut file =
			File::open(path).map_err(|_| CoreError::DatasetNotFound(path.to_path_buf()))?;
		let _ = file.seek(SeekFrom::Start(data_offset))?;

		let mut bytes = vec![0u8; n * dim * 4];
		file.read_exact(&mut bytes).map_err(|_| CoreError::DatasetParse {
			path: path.to_path_buf(),
			message: format!(
				"expected {} feature floats ({} frames × dim {}) after a {}-byte header",
				n * dim,
				n,
				dim,
				data_offset
			),
		})?;

		let data = bytes
			.chunks_exact(4)
			.map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
			.collect();

		info!(frames = n, dim, "feature matrix loaded");

		Ok(Self { n, dim, data })
	}

	/// Number of rows (frames).
	#[must_use]
	pub fn len(&self) -> usize {
		self.n
	}

	/// True when the store holds no rows.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.n == 0
	}

	/// Embedding dimension.
	#[must_use]
	pub fn dim(&self) -> usize {
		self.dim
	}

	/// Read-only view of row `i`.
	///
	/// # Panics
	///
	/// Panics when `i` is out of range; callers index with validated ids.
	#[must_use]
	pub fn row(&self, i: FrameId) -> &[f32] {
		&self.data[i * self.dim..(i + 1) * self.dim]
	}

	/// Flat view of the whole matrix, row-major.
	#[must_use]
	pub fn as_flat(&self) -> &[f32] {
		&self.data
	}

	/// Embedding distance `1 − ⟨row i, row j⟩`, valid for unit-norm rows.
	#[inline]
	#[must_use]
	pub fn d_dot(&self, i: FrameId, j: FrameId) -> f32 {
		1.0 - d_dot(self.row(i), self.row(j))
	}

	/// Nearest neighbors of `pivot` with per-video and per-shot caps.
	///
	/// Every frame (the pivot included) is ranked by ascending
	/// `1 − ⟨pivot, frame⟩`, ties broken by lower frame id. A candidate is
	/// admitted only while its video has fewer than `per_video` admissions
	/// and its shot fewer than `per_shot` (0 disables the respective cap);
	/// counters advance on admission only. At most [`TOPKNN_LIMIT`]
	/// results.
	#[must_use]
	pub fn top_knn(
		&self,
		frames: &FrameIndex,
		pivot: FrameId,
		per_video: usize,
		per_shot: usize,
	) -> Vec<FrameId> {
		self.top_knn_filtered(frames, pivot, per_video, per_shot, |_| true)
	}

	/// [`Self::top_knn`] restricted to frames passing `pred`.
	#[must_use]
	pub fn top_knn_filtered(
		&self,
		frames: &FrameIndex,
		pivot: FrameId,
		per_video: usize,
		per_shot: usize,
		pred: impl Fn(FrameId) -> bool,
	) -> Vec<FrameId> {
		let per_video = if per_video == 0 { self.n } else { per_video };
		let per_shot = if per_shot == 0 { self.n } else { per_shot };

		let mut ranked: Vec<(f32, FrameId)> =
			(0..self.n).map(|i| (self.d_dot(pivot, i), i)).collect();
		ranked.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

		let mut per_video_count = vec![0usize; frames.num_videos()];
		let mut per_shot_count: HashMap<(VideoId, ShotId), usize> = HashMap::new();
		let mut result = Vec::new();

		for (_, id) in ranked {
			if result.len() >= TOPKNN_LIMIT {
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
			if !pred(id) {
				continue;
			}

			per_video_count[frame.video_id as usize] += 1;
			*shot_count += 1;
			result.push(id);
		}

		result
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use std::io::Write;

	use super::*;
	use crate::frames::tests::index_from_layout;

	/// Write unit-norm 2-D embeddings at the given angles (degrees) and
	/// load them back, with `header` junk bytes up front.
	pub(crate) fn store_from_angles(angles_deg: &[f32], header: usize) -> FeatureStore {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(&vec![0xAAu8; header]).unwrap();
		for &deg in angles_deg {
			let rad = deg.to_radians();
			file.write_all(&rad.cos().to_le_bytes()).unwrap();
			file.write_all(&rad.sin().to_le_bytes()).unwrap();
		}
		file.flush().unwrap();
		FeatureStore::from_file(file.path(), header as u64, 2, angles_deg.len()).unwrap()
	}

	#[test]
	fn test_rows_survive_round_trip() {
		let store = store_from_angles(&[0.0, 90.0, 45.0], 16);
		assert_eq!(store.len(), 3);
		assert_eq!(store.dim(), 2);
		assert!((store.row(0)[0] - 1.0).abs() < 1e-6);
		assert!((store.row(1)[1] - 1.0).abs() < 1e-6);
		assert!((store.row(2)[0] - 45f32.to_radians().cos()).abs() < 1e-6);
	}

	#[test]
	fn test_short_file_is_fatal() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(&[0u8; 10]).unwrap();
		let res = FeatureStore::from_file(file.path(), 0, 2, 4);
		assert!(matches!(res, Err(CoreError::DatasetParse { .. })));
	}

	#[test]
	fn test_d_dot_of_identical_rows_is_zero() {
		let store = store_from_angles(&[30.0, 30.0, 120.0], 0);
		assert!(store.d_dot(0, 1).abs() < 1e-6);
		assert!(store.d_dot(0, 2) > 0.9);
	}

	#[test]
	fn test_knn_orders_by_distance_with_pivot_first() {
		// Frames at increasing angular distance from the pivot at 0°.
		let store = store_from_angles(&[0.0, 10.0, 60.0, 120.0], 0);
		let index = index_from_layout(&[(0, 0, 0), (1, 0, 0), (2, 0, 0), (3, 0, 0)]);

		let res = store.top_knn(&index, 0, 0, 0);
		assert_eq!(res, vec![0, 1, 2, 3]);
	}

	#[test]
	fn test_knn_respects_video_cap() {
		// Video 0 holds the three closest frames; cap it at one.
		let store = store_from_angles(&[0.0, 5.0, 10.0, 90.0], 0);
		let index = index_from_layout(&[(0, 0, 0), (0, 0, 1), (0, 1, 2), (1, 0, 0)]);

		let res = store.top_knn(&index, 0, 1, 0);
		assert_eq!(res, vec![0, 3]);
	}

	#[test]
	fn test_knn_shot_cap_does_not_burn_video_budget() {
		// Frames 0 and 1 share a shot; with per_shot = 1 frame 1 is
		// rejected but video 0 may still contribute frame 2.
		let store = store_from_angles(&[0.0, 5.0, 10.0, 90.0], 0);
		let index = index_from_layout(&[(0, 0, 0), (0, 0, 1), (0, 1, 2), (1, 0, 0)]);

		let res = store.top_knn(&index, 0, 2, 1);
		assert_eq!(res, vec![0, 2, 3]);
	}

	#[test]
	fn test_knn_predicate_filters() {
		let store = store_from_angles(&[0.0, 10.0, 20.0], 0);
		let index = index_from_layout(&[(0, 0, 0), (1, 0, 0), (2, 0, 0)]);

		let res = store.top_knn_filtered(&index, 0, 0, 0, |id| id != 1);
		assert_eq!(res, vec![0, 2]);
	}
}
