//! Self-organizing map training.
//!
//! The map is a small grid of codebook vectors trained online against the
//! score-weighted embedding cloud: each iteration samples one frame with
//! probability proportional to its current score, finds the nearest codebook
//! by squared euclidean distance, and pulls codebooks within an annealed
//! grid radius toward the sample. A second, slightly wider band applies a
//! mild negative pull, sharpening cluster borders.
//!
//! Training runs on the worker thread in [`crate::som_worker`]; the
//! functions here are pure apart from the RNG and a cancellation probe.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use tracing::debug;

use crate::distance::d_sqeucl;

/// How often the training loop probes the cancellation callback.
const CANCEL_CHECK_MASK: usize = 0xFFF;

/// Learning-rate schedule `start → end` of the positive band.
pub const ALPHAS_A: [f32; 2] = [0.3, 0.1];
/// Scale of the negative band relative to the positive one.
pub const NEG_ALPHA: f32 = -0.01;
/// Radius scale of the negative band relative to the positive one.
pub const NEG_RADIUS: f32 = 1.1;

/// Manhattan distances between every pair of cells of a `width × height`
/// grid, flattened to `(width · height)²` entries.
#[must_use]
pub fn grid_neighbor_distances(width: usize, height: usize) -> Vec<f32> {
	let cells = width * height;
	let mut distances = vec![0.0f32; cells * cells];
	for y1 in 0..height {
		for x1 in 0..width {
			for y2 in 0..height {
				for x2 in 0..width {
					let a = x1 + width * y1;
					let b = x2 + width * y2;
					distances[a + cells * b] = (x1 as f32 - x2 as f32).abs()
						+ (y1 as f32 - y2 as f32).abs();
				}
			}
		}
	}
	distances
}

/// Radius schedule of the positive band for a `width × height` grid.
#[must_use]
pub fn radii_a(width: usize, height: usize) -> [f32; 2] {
	[(width + height) as f32 / 3.0, 0.1]
}

/// Train `cells` codebook vectors of dimension `dim` for `iters`
/// iterations over the row-major `points` matrix, sampling rows by
/// `weights`. `radii` is the positive-band radius schedule, usually
/// [`radii_a`] of the grid; the negative band is derived from it.
///
/// Codebooks start at zero. `cancel` is probed periodically; a `true`
/// answer abandons training and returns `None`.
#[must_use]
pub fn train(
	cells: usize,
	dim: usize,
	iters: usize,
	points: &[f32],
	weights: &[f32],
	nhbrdist: &[f32],
	radii: [f32; 2],
	rng: &mut impl Rng,
	cancel: &dyn Fn() -> bool,
) -> Option<Vec<f32>> {
	debug_assert_eq!(points.len(), weights.len() * dim);
	debug_assert_eq!(nhbrdist.len(), cells * cells);

	let Ok(sampler) = WeightedIndex::new(weights) else {
		// Scores are strictly positive by invariant; a degenerate weight
		// vector means there is nothing meaningful to train on.
		debug!("SOM training skipped: degenerate sample weights");
		return None;
	};

	let alphas_b = [NEG_ALPHA * ALPHAS_A[0], NEG_ALPHA * ALPHAS_A[1]];
	let radii_b = [NEG_RADIUS * radii[0], NEG_RADIUS * radii[1]];

	let mut koho = vec![0.0f32; cells * dim];

	for iter in 0..iters {
		if iter & CANCEL_CHECK_MASK == 0 && cancel() {
			debug!(iter, "SOM training cancelled");
			return None;
		}

		let point = sampler.sample(rng);
		let riter = iter as f32 / iters as f32;

		let sample = &points[point * dim..(point + 1) * dim];
		let mut nearest = 0;
		let mut nearest_dist = d_sqeucl(sample, &koho[0..dim]);
		for i in 1..cells {
			let dist = d_sqeucl(sample, &koho[i * dim..(i + 1) * dim]);
			if dist < nearest_dist {
				nearest = i;
				nearest_dist = dist;
			}
		}

		let threshold_a = radii[0] + riter * (radii[1] - radii[0]);
		let threshold_b = radii_b[0] + riter * (radii_b[1] - radii_b[0]);
		let alpha_a = ALPHAS_A[0] + riter * (ALPHAS_A[1] - ALPHAS_A[0]);
		let alpha_b = alphas_b[0] + riter * (alphas_b[1] - alphas_b[0]);

		for i in 0..cells {
			let grid_dist = nhbrdist[i + cells * nearest];

			let alpha = if grid_dist > threshold_a {
				if grid_dist > threshold_b {
					continue;
				}
				alpha_b
			} else {
				alpha_a
			};

			let codebook = &mut koho[i * dim..(i + 1) * dim];
			for (c, &p) in codebook.iter_mut().zip(sample.iter()) {
				*c += alpha * (p - *c);
			}
		}
	}

	Some(koho)
}

/// Classify every point to its nearest codebook cell.
#[must_use]
pub fn map_points(n: usize, cells: usize, dim: usize, points: &[f32], koho: &[f32]) -> Vec<usize> {
	let mut mapping = vec![0usize; n];
	for point in 0..n {
		let sample = &points[point * dim..(point + 1) * dim];

		let mut nearest = 0;
		let mut nearest_dist = d_sqeucl(sample, &koho[0..dim]);
		for i in 1..cells {
			let dist = d_sqeucl(sample, &koho[i * dim..(i + 1) * dim]);
			if dist < nearest_dist {
				nearest = i;
				nearest_dist = dist;
			}
		}

		mapping[point] = nearest;
	}
	mapping
}

#[cfg(test)]
mod tests {
	use rand::rngs::StdRng;
	use rand::SeedableRng;

	use super::*;

	#[test]
	fn test_grid_distances_are_manhattan() {
		let d = grid_neighbor_distances(3, 2);
		let cells = 6;
		// Cell (0,0) to cell (2,1): |2-0| + |1-0| = 3.
		let a = 0;
		let b = 2 + 3;
		assert_eq!(d[a + cells * b], 3.0);
		// Symmetric, zero diagonal.
		assert_eq!(d[b + cells * a], 3.0);
		for c in 0..cells {
			assert_eq!(d[c + cells * c], 0.0);
		}
	}

	#[test]
	fn test_training_converges_to_the_sampled_point() {
		// All the sampling mass sits on point 0, so the winning codebook
		// must converge onto it.
		let points: Vec<f32> = vec![
			2.0, -3.0, //
			10.0, 10.0, //
			-8.0, 4.0, //
			10.1, 10.0, //
		];
		let weights = vec![1.0, 0.0, 0.0, 0.0];
		let nhbrdist = grid_neighbor_distances(2, 1);
		let mut rng = StdRng::seed_from_u64(7);

		let radii = radii_a(2, 1);
		let koho = train(2, 2, 4_000, &points, &weights, &nhbrdist, radii, &mut rng, &|| false)
			.unwrap();

		assert_eq!(koho.len(), 2 * 2);
		assert!(koho.iter().all(|v| v.is_finite()));
		assert!(d_sqeucl(&koho[0..2], &points[0..2]) < 1e-3);

		let mapping = map_points(4, 2, 2, &points, &koho);
		assert_eq!(mapping[0], 0);
	}

	#[test]
	fn test_mapping_partitions_all_points() {
		let points: Vec<f32> = (0..20).map(|i| i as f32).collect();
		let weights = vec![1.0f32; 10];
		let nhbrdist = grid_neighbor_distances(2, 2);
		let mut rng = StdRng::seed_from_u64(3);

		let koho = train(4, 2, 1_000, &points, &weights, &nhbrdist, radii_a(2, 2), &mut rng, &|| false)
			.unwrap();
		let mapping = map_points(10, 4, 2, &points, &koho);

		assert_eq!(mapping.len(), 10);
		assert!(mapping.iter().all(|&c| c < 4));
	}

	#[test]
	fn test_cancel_aborts_training() {
		let points = vec![0.0f32; 8];
		let weights = vec![1.0f32; 4];
		let nhbrdist = grid_neighbor_distances(2, 1);
		let mut rng = StdRng::seed_from_u64(1);

		let res = train(2, 2, 100_000, &points, &weights, &nhbrdist, radii_a(2, 1), &mut rng, &|| true);
		assert!(res.is_none());
	}
}
