//! Text queries over the joint text–image embedding.
//!
//! Keywords arrive as a colon-separated synset list; every keyword id doubles
//! as a row index into the keyword-score matrix. A free-text sentence is
//! tokenized into up to [`MAX_NUM_TEMP_QUERIES`]-deep temporal batches
//! (`>>` separates them), each batch is embedded into the frame feature
//! space (accumulate → bias → tanh → normalize → PCA → normalize), and
//! frames are ranked by the temporal min-product of normalized cosine
//! distances. The score model is then multiplied by `exp(−42 · d)` so that
//! only near-perfect matches keep non-negligible mass.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::info;

use crate::config::{Config, KW_TEMPORAL_SPAN, MAX_NUM_TEMP_QUERIES};
use crate::distance::{d_cos_normalized, d_dot};
use crate::error::{CoreError, Result};
use crate::features::FeatureStore;
use crate::frames::FrameIndex;
use crate::scores::ScoreModel;
use crate::{FrameId, KeywordId};

/// Characters stripped out of sentence queries before tokenization.
const ILLEGAL_QUERY_CHARS: &str = "\\/?!,.'\"";

/// Multiplier applied inside the rank-update exponent.
const RANK_PENALTY_SCALE: f32 = -42.0;

/// One WordNet-style keyword class.
#[derive(Debug, Clone)]
pub struct Keyword {
	/// Keyword id; also the row of this keyword in the score matrix
	pub keyword_id: KeywordId,
	/// WordNet synset id
	pub synset_id: usize,
	/// String representations; the first one is canonical for display
	pub synset_strs: Vec<String>,
	/// Human-readable description, possibly empty
	pub description: String,
	/// Best example frames for this keyword
	pub example_frames: Vec<FrameId>,
}

/// Maps sentence queries to embedded query vectors and frame rankings.
pub struct KeywordRanker {
	keywords: Vec<Keyword>,
	kw_features: Vec<Vec<f32>>,
	bias: Vec<f32>,
	pca_mat: Vec<Vec<f32>>,
	pca_mean: Vec<f32>,
}

/// Read a row-major binary f32 matrix, rows of `row_dim`, after skipping
/// `offset` bytes. The remaining byte count must be a whole number of rows.
pub(crate) fn parse_float_matrix(
	path: impl AsRef<Path>,
	row_dim: usize,
	offset: u64,
) -> Result<Vec<Vec<f32>>> {
	let path = path.as_ref();
	let mut file = File::open(path).map_err(|_| CoreError::DatasetNotFound(path.to_path_buf()))?;
	let _ = file.seek(SeekFrom::Start(offset))?;

	let mut bytes = Vec::new();
	let _ = file.read_to_end(&mut bytes)?;

	let row_bytes = row_dim * 4;
	if bytes.is_empty() || row_bytes == 0 || bytes.len() % row_bytes != 0 {
		return Err(CoreError::DatasetParse {
			path: path.to_path_buf(),
			message: format!(
				"{} bytes after the header do not form rows of {} floats",
				bytes.len(),
				row_dim
			),
		});
	}

	Ok(bytes
		.chunks_exact(row_bytes)
		.map(|row| {
			row.chunks_exact(4)
				.map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
				.collect()
		})
		.collect())
}

/// Read exactly `dim` little-endian floats after skipping `offset` bytes.
pub(crate) fn parse_float_vector(
	path: impl AsRef<Path>,
	dim: usize,
	offset: u64,
) -> Result<Vec<f32>> {
	let path = path.as_ref();
	let mut file = File::open(path).map_err(|_| CoreError::DatasetNotFound(path.to_path_buf()))?;
	let _ = file.seek(SeekFrom::Start(offset))?;

	let mut bytes = vec![0u8; dim * 4];
	file.read_exact(&mut bytes).map_err(|_| CoreError::DatasetParse {
		path: path.to_path_buf(),
		message: format!("expected {dim} floats"),
	})?;

	Ok(bytes
		.chunks_exact(4)
		.map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
		.collect())
}

fn add_assign(acc: &mut [f32], rhs: &[f32]) {
	for (a, r) in acc.iter_mut().zip(rhs.iter()) {
		*a += r;
	}
}

fn sub_assign(acc: &mut [f32], rhs: &[f32]) {
	for (a, r) in acc.iter_mut().zip(rhs.iter()) {
		*a -= r;
	}
}

fn normalize_l2(vec: &mut [f32]) {
	let norm = vec.iter().fold(0.0f32, |acc, &v| v.mul_add(v, acc)).sqrt();
	if norm > 0.0 {
		for v in vec.iter_mut() {
			*v /= norm;
		}
	}
}

/// Per-query per-frame distance, memoized in the NaN-initialized cache.
fn cached_distance(
	cache: &mut [Vec<f32>],
	query_idx: usize,
	id: FrameId,
	queries: &[Vec<f32>],
	features: &FeatureStore,
) -> f32 {
	let known = cache[query_idx][id];
	if known.is_nan() {
		// Cosine distance rescaled from [0, 2] to [0, 1].
		let dist = d_cos_normalized(&queries[query_idx], features.row(id)) / 2.0;
		cache[query_idx][id] = dist;
		dist
	} else {
		known
	}
}

impl KeywordRanker {
	/// Load the synset list and the four embedding tables named by the
	/// configuration.
	///
	/// # Errors
	///
	/// Missing or malformed files are fatal, as is any dimension
	/// disagreement between the PCA output and the frame feature space.
	pub fn from_files(config: &Config) -> Result<Self> {
		let keywords = Self::parse_keyword_file(&config.kws_file)?;
		let kw_features =
			parse_float_matrix(&config.kw_scores_mat_file, config.pre_pca_features_dim, 0)?;
		let bias = parse_float_vector(&config.kw_bias_vec_file, config.pre_pca_features_dim, 0)?;
		let pca_mat =
			parse_float_matrix(&config.kw_pca_mat_file, config.pre_pca_features_dim, 0)?;
		let pca_mean =
			parse_float_vector(&config.kw_pca_mean_vec_file, config.pre_pca_features_dim, 0)?;

		if pca_mat.len() != config.kw_pca_mat_dim {
			return Err(CoreError::Config(format!(
				"PCA matrix has {} rows but kw_pca_mat_dim is {}",
				pca_mat.len(),
				config.kw_pca_mat_dim
			)));
		}
		if let Some(bad) = keywords
			.iter()
			.find(|kw| kw.keyword_id >= kw_features.len())
		{
			return Err(CoreError::DatasetParse {
				path: config.kws_file.clone(),
				message: format!(
					"keyword id {} has no row in the {}-row score matrix",
					bad.keyword_id,
					kw_features.len()
				),
			});
		}

		info!(keywords = keywords.len(), "keyword tables loaded");

		Ok(Self {
			keywords,
			kw_features,
			bias,
			pca_mat,
			pca_mean,
		})
	}

	/// Parse the `synsets:synset_id[:example_ids[:description]]` list,
	/// `#`-separated within the synsets and example fields, and sort the
	/// records by keyword id.
	pub(crate) fn parse_keyword_file(path: impl AsRef<Path>) -> Result<Vec<Keyword>> {
		let path = path.as_ref();
		info!(path = %path.display(), "loading keyword classes");

		let file = File::open(path).map_err(|_| CoreError::DatasetNotFound(path.to_path_buf()))?;

		let mut keywords = Vec::new();
		for line in BufReader::new(file).lines() {
			let line = line?;
			let line = line.trim_end_matches('\r');
			if line.is_empty() {
				continue;
			}

			let tokens: Vec<&str> = line.split(':').collect();
			if tokens.len() < 2 {
				return Err(CoreError::DatasetParse {
					path: path.to_path_buf(),
					message: format!("keyword line {line:?} is missing the synset id field"),
				});
			}

			let synset_id: usize =
				tokens[1].parse().map_err(|_| CoreError::DatasetParse {
					path: path.to_path_buf(),
					message: format!("bad synset id in {line:?}"),
				})?;

			let synset_strs: Vec<String> = tokens[0]
				.split('#')
				.filter(|s| !s.is_empty())
				.map(str::to_owned)
				.collect();
			if synset_strs.is_empty() {
				return Err(CoreError::DatasetParse {
					path: path.to_path_buf(),
					message: format!("keyword line {line:?} has no synset strings"),
				});
			}

			let example_frames = match tokens.get(2) {
				Some(field) => field
					.split('#')
					.filter(|s| !s.is_empty())
					.map(|s| {
						s.parse().map_err(|_| CoreError::DatasetParse {
							path: path.to_path_buf(),
							message: format!("bad example frame id in {line:?}"),
						})
					})
					.collect::<Result<Vec<FrameId>>>()?,
				None => Vec::new(),
			};

			keywords.push(Keyword {
				keyword_id: synset_id,
				synset_id,
				synset_strs,
				description: tokens.get(3).map(|s| (*s).to_owned()).unwrap_or_default(),
				example_frames,
			});
		}

		keywords.sort_by_key(|kw| kw.keyword_id);
		Ok(keywords)
	}

	/// Number of loaded keyword classes.
	#[must_use]
	pub fn len(&self) -> usize {
		self.keywords.len()
	}

	/// True when no keyword classes are loaded.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.keywords.is_empty()
	}

	/// Keyword record by id.
	#[must_use]
	pub fn get(&self, id: KeywordId) -> Option<&Keyword> {
		self.keywords
			.binary_search_by_key(&id, |kw| kw.keyword_id)
			.ok()
			.map(|idx| &self.keywords[idx])
	}

	/// Substring search over every synset string of every keyword.
	///
	/// Matches at offset 0 come first, ordered by the matched string;
	/// matches further inside a string follow in scan order. Returns up to
	/// `limit` `(keyword_id, synset_index)` pairs.
	#[must_use]
	pub fn find(&self, search: &str, limit: usize) -> Vec<(KeywordId, usize)> {
		let mut prefix_hits: Vec<(usize, usize)> = Vec::new();
		let mut infix_hits: Vec<(usize, usize)> = Vec::new();

		for (idx, kw) in self.keywords.iter().enumerate() {
			for (j, synset) in kw.synset_strs.iter().enumerate() {
				match synset.find(search) {
					Some(0) => prefix_hits.push((idx, j)),
					Some(_) => infix_hits.push((idx, j)),
					None => {}
				}
			}
		}

		prefix_hits.sort_by(|&(ai, aj), &(bi, bj)| {
			self.keywords[ai].synset_strs[aj].cmp(&self.keywords[bi].synset_strs[bj])
		});

		prefix_hits
			.into_iter()
			.chain(infix_hits)
			.take(limit)
			.map(|(idx, j)| (self.keywords[idx].keyword_id, j))
			.collect()
	}

	/// Split a sentence into temporal batches of keyword ids.
	///
	/// Punctuation becomes whitespace, `>` / `>>` closes the current batch,
	/// and every remaining token contributes its best [`Self::find`] hit
	/// (tokens matching nothing are dropped).
	pub(crate) fn tokenize_to_batches(&self, sentence: &str) -> Vec<Vec<KeywordId>> {
		let sanitized: String = sentence
			.chars()
			.map(|c| if ILLEGAL_QUERY_CHARS.contains(c) { ' ' } else { c })
			.collect();

		let mut batches: Vec<Vec<KeywordId>> = Vec::new();
		let mut current: Vec<KeywordId> = Vec::new();

		for token in sanitized.split_whitespace() {
			if token == ">>" || token == ">" {
				if !current.is_empty() {
					batches.push(std::mem::take(&mut current));
				}
				continue;
			}

			if let Some(&(kw_id, _)) = self.find(token, 10).first() {
				current.push(kw_id);
			}
		}
		if !current.is_empty() {
			batches.push(current);
		}

		batches
	}

	/// Embed one batch of keyword ids into the frame feature space.
	fn embed_batch(&self, batch: &[KeywordId]) -> Vec<f32> {
		let mut acc = vec![0.0f32; self.pca_mean.len()];
		for &kw_id in batch {
			add_assign(&mut acc, &self.kw_features[kw_id]);
		}
		add_assign(&mut acc, &self.bias);
		for v in &mut acc {
			*v = v.tanh();
		}
		normalize_l2(&mut acc);
		sub_assign(&mut acc, &self.pca_mean);

		let mut projected: Vec<f32> =
			self.pca_mat.iter().map(|row| d_dot(row, &acc)).collect();
		normalize_l2(&mut projected);
		projected
	}

	/// Apply a sentence query to the score model.
	///
	/// A sentence that yields no batches leaves the model untouched.
	pub fn rank_sentence_query(
		&self,
		sentence: &str,
		model: &mut ScoreModel,
		features: &FeatureStore,
		frames: &FrameIndex,
	) {
		let batches = self.tokenize_to_batches(sentence);
		if batches.is_empty() {
			return;
		}
		self.rank_query(&batches, model, features, frames);
	}

	/// Apply already-resolved temporal batches to the score model.
	pub fn rank_query(
		&self,
		positive: &[Vec<KeywordId>],
		model: &mut ScoreModel,
		features: &FeatureStore,
		frames: &FrameIndex,
	) {
		if positive.is_empty() {
			return;
		}

		for (id, dist) in self.sorted_by_distance(positive, features, frames) {
			model.adjust(id, (dist * RANK_PENALTY_SCALE).exp());
		}
		model.normalize();
	}

	/// Rank every frame by the temporal min-product distance, ascending.
	pub(crate) fn sorted_by_distance(
		&self,
		positive: &[Vec<KeywordId>],
		features: &FeatureStore,
		frames: &FrameIndex,
	) -> Vec<(FrameId, f32)> {
		let queries: Vec<Vec<f32>> =
			positive.iter().map(|batch| self.embed_batch(batch)).collect();

		let n = features.len();
		let mut cache = vec![vec![f32::NAN; n]; queries.len()];

		let mut ranked: Vec<(FrameId, f32)> = Vec::with_capacity(n);
		for id in 0..n {
			let mut dist = cached_distance(&mut cache, 0, id, &queries, features);
			Self::apply_temporal(&mut cache, id, &queries, 1, &mut dist, features, frames);
			ranked.push((id, dist));
		}

		ranked.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
		ranked
	}

	/// Degrade `dist` by the best continuation of the remaining temporal
	/// queries within the next [`KW_TEMPORAL_SPAN`] same-video frames. An
	/// empty successor window contributes a factor of 1.
	fn apply_temporal(
		cache: &mut [Vec<f32>],
		id: FrameId,
		queries: &[Vec<f32>],
		query_idx: usize,
		dist: &mut f32,
		features: &FeatureStore,
		frames: &FrameIndex,
	) {
		if query_idx >= queries.len() || query_idx > MAX_NUM_TEMP_QUERIES {
			return;
		}
		let Some(video) = frames.video_id_of(id) else {
			return;
		};

		let mut local_min = 1.0f32;
		for succ in id + 1..=id + KW_TEMPORAL_SPAN {
			if succ >= features.len() || frames.video_id_of(succ) != Some(video) {
				break;
			}

			let mut succ_dist = cached_distance(cache, query_idx, succ, queries, features);
			Self::apply_temporal(
				cache,
				succ,
				queries,
				query_idx + 1,
				&mut succ_dist,
				features,
				frames,
			);
			local_min = local_min.min(succ_dist);
		}

		*dist *= local_min;
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use std::io::Write;

	use super::*;
	use crate::features::tests::store_from_angles;
	use crate::frames::tests::index_from_layout;

	fn keyword_file(lines: &[&str]) -> tempfile::NamedTempFile {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		for line in lines {
			writeln!(file, "{line}").unwrap();
		}
		file
	}

	/// Tiny ranker in a 2-D space with an identity PCA: keyword 0 embeds
	/// to the x axis, keyword 1 to the y axis.
	pub(crate) fn axis_ranker() -> KeywordRanker {
		let file = keyword_file(&["left:0", "up:1"]);
		KeywordRanker {
			keywords: KeywordRanker::parse_keyword_file(file.path()).unwrap(),
			kw_features: vec![vec![100.0, 0.0], vec![0.0, 100.0]],
			bias: vec![0.0, 0.0],
			pca_mat: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
			pca_mean: vec![0.0, 0.0],
		}
	}

	#[test]
	fn test_parse_sorts_by_id_and_splits_fields() {
		let file = keyword_file(&["zebra:5:3#4", "dog#hound:2::canine friend", "cat:9"]);
		let keywords = KeywordRanker::parse_keyword_file(file.path()).unwrap();

		assert_eq!(keywords.len(), 3);
		assert_eq!(keywords[0].keyword_id, 2);
		assert_eq!(keywords[0].synset_strs, vec!["dog", "hound"]);
		assert_eq!(keywords[0].description, "canine friend");
		assert_eq!(keywords[1].keyword_id, 5);
		assert_eq!(keywords[1].example_frames, vec![3, 4]);
		assert_eq!(keywords[2].keyword_id, 9);
	}

	#[test]
	fn test_parse_rejects_missing_id() {
		let file = keyword_file(&["dog"]);
		assert!(matches!(
			KeywordRanker::parse_keyword_file(file.path()),
			Err(CoreError::DatasetParse { .. })
		));
	}

	#[test]
	fn test_find_prefix_before_infix() {
		let file = keyword_file(&["catapult:0", "wildcat:1", "cat:2", "dog:3"]);
		let ranker = KeywordRanker {
			keywords: KeywordRanker::parse_keyword_file(file.path()).unwrap(),
			kw_features: vec![vec![0.0]; 4],
			bias: vec![0.0],
			pca_mat: vec![vec![1.0]],
			pca_mean: vec![0.0],
		};

		let hits = ranker.find("cat", 10);
		// Prefix bucket sorted lexicographically, then the infix bucket.
		assert_eq!(hits, vec![(2, 0), (0, 0), (1, 0)]);

		let capped = ranker.find("cat", 2);
		assert_eq!(capped, vec![(2, 0), (0, 0)]);
	}

	#[test]
	fn test_get_by_id() {
		let ranker = axis_ranker();
		assert_eq!(ranker.get(1).unwrap().synset_strs[0], "up");
		assert!(ranker.get(17).is_none());
	}

	#[test]
	fn test_tokenize_separators_and_punctuation() {
		let ranker = axis_ranker();

		let batches = ranker.tokenize_to_batches("left, up!");
		assert_eq!(batches, vec![vec![0, 1]]);

		let batches = ranker.tokenize_to_batches("left >> up");
		assert_eq!(batches, vec![vec![0], vec![1]]);

		let batches = ranker.tokenize_to_batches("left > gibberish > up");
		assert_eq!(batches, vec![vec![0], vec![1]]);

		assert!(ranker.tokenize_to_batches(">>").is_empty());
		assert!(ranker.tokenize_to_batches("").is_empty());
	}

	#[test]
	fn test_single_query_ranks_nearest_frame_first() {
		let ranker = axis_ranker();
		let features = store_from_angles(&[0.0, 90.0, 45.0], 0);
		let frames = index_from_layout(&[(0, 0, 0), (0, 0, 1), (0, 0, 2)]);

		let ranked = ranker.sorted_by_distance(&[vec![0]], &features, &frames);
		let order: Vec<FrameId> = ranked.iter().map(|&(id, _)| id).collect();
		assert_eq!(order, vec![0, 2, 1]);
		assert!(ranked[0].1.abs() < 1e-6);
	}

	#[test]
	fn test_temporal_query_rewards_successor_match() {
		let ranker = axis_ranker();
		// Video 0: 45° then 90°; video 1: a lone 45° frame.
		let features = store_from_angles(&[45.0, 90.0, 45.0], 0);
		let frames = index_from_layout(&[(0, 0, 0), (0, 0, 1), (1, 0, 0)]);

		let ranked = ranker.sorted_by_distance(&[vec![0], vec![1]], &features, &frames);
		let order: Vec<FrameId> = ranked.iter().map(|&(id, _)| id).collect();

		// Frame 0 is followed by a perfect "up" match, so its distance
		// collapses to zero; frame 2 has no successors and keeps d₀.
		assert_eq!(order[0], 0);
		assert!(ranked[0].1.abs() < 1e-6);
		let frame2 = ranked.iter().find(|&&(id, _)| id == 2).unwrap();
		let expected = (1.0 - 45f32.to_radians().cos()) / 2.0;
		assert!((frame2.1 - expected).abs() < 1e-5);
	}

	#[test]
	fn test_rank_update_concentrates_scores() {
		let ranker = axis_ranker();
		let features = store_from_angles(&[0.0, 90.0], 0);
		let frames = index_from_layout(&[(0, 0, 0), (1, 0, 0)]);
		let mut model = ScoreModel::new(2);

		ranker.rank_sentence_query("left", &mut model, &features, &frames);

		assert!((model.get(0) - 1.0).abs() < 1e-6);
		assert!(model.get(1) < 1e-8);
		assert!(model.get(1) > 0.0);
	}

	#[test]
	fn test_float_matrix_round_trip() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		for v in [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0] {
			file.write_all(&v.to_le_bytes()).unwrap();
		}
		let mat = parse_float_matrix(file.path(), 3, 0).unwrap();
		assert_eq!(mat, vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);

		// A ragged byte count is rejected.
		assert!(parse_float_matrix(file.path(), 4, 0).is_err());
	}
}
