//! Dense float distance kernels.
//!
//! Every ranking path in the engine reduces to one of these scans:
//! the SOM trains on squared euclidean distance, KNN ranks by `1 − ⟨a,b⟩`
//! (valid because the stored embeddings are unit-norm), and the keyword
//! ranker uses the normalized cosine distance rescaled to `[0, 1]`.
//!
//! The scalar implementations here are the normative ones; any future
//! specialization must reproduce them bit for bit on finite inputs.

/// Squared euclidean distance between two equal-length vectors.
#[inline]
#[must_use]
pub fn d_sqeucl(a: &[f32], b: &[f32]) -> f32 {
	debug_assert_eq!(a.len(), b.len());
	a.iter()
		.zip(b.iter())
		.fold(0.0, |acc, (&x, &y)| (x - y).mul_add(x - y, acc))
}

/// Manhattan (L1) distance between two equal-length vectors.
#[inline]
#[must_use]
pub fn d_manhattan(a: &[f32], b: &[f32]) -> f32 {
	debug_assert_eq!(a.len(), b.len());
	a.iter()
		.zip(b.iter())
		.fold(0.0, |acc, (&x, &y)| acc + (x - y).abs())
}

/// Plain dot product of two equal-length vectors.
#[inline]
#[must_use]
pub fn d_dot(a: &[f32], b: &[f32]) -> f32 {
	debug_assert_eq!(a.len(), b.len());
	a.iter()
		.zip(b.iter())
		.fold(0.0, |acc, (&x, &y)| x.mul_add(y, acc))
}

/// Cosine distance `1 − cos(a, b)` for vectors of any magnitude.
///
/// Returns `0.0` when either vector has zero magnitude.
#[inline]
#[must_use]
pub fn d_cos(a: &[f32], b: &[f32]) -> f32 {
	debug_assert_eq!(a.len(), b.len());
	let (dot, wa, wb) = a
		.iter()
		.zip(b.iter())
		.fold((0.0f32, 0.0f32, 0.0f32), |(dot, wa, wb), (&x, &y)| {
			(x.mul_add(y, dot), x.mul_add(x, wa), y.mul_add(y, wb))
		});

	if wa == 0.0 && wb == 0.0 {
		return 0.0;
	}
	1.0 - dot / (wa * wb).sqrt()
}

/// Cosine distance specialized for unit-length inputs: `1 − ⟨a, b⟩`.
///
/// Both arguments must already be L2-normalized; no renormalization
/// happens here.
#[inline]
#[must_use]
pub fn d_cos_normalized(a: &[f32], b: &[f32]) -> f32 {
	1.0 - d_dot(a, b)
}
