//! Background SOM worker.
//!
//! One worker thread lives for the engine's lifetime. The engine hands it
//! `(features, scores)` snapshots through a single mutex-guarded slot; a
//! newer snapshot simply replaces an unconsumed one, so the worker always
//! trains on *some* consistent pair, not necessarily the latest. Between
//! training phases — and periodically inside the iteration loop — the
//! worker polls for fresh input or shutdown and abandons stale work.
//!
//! The finished cell→frames mapping is published as an atomically swapped
//! read-only snapshot; `map_ready` observes the publication with acquire
//! ordering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::config::{SOM_DISPLAY_GRID_HEIGHT, SOM_DISPLAY_GRID_WIDTH, SOM_ITERS};
use crate::features::FeatureStore;
use crate::scores::ScoreModel;
use crate::som;
use crate::FrameId;

/// One training input: a copy of the feature matrix and the score vector.
struct Job {
	points: Vec<f32>,
	scores: Vec<f32>,
	dim: usize,
}

struct Shared {
	slot: Mutex<Option<Job>>,
	wakeup: Condvar,
	new_data: AtomicBool,
	terminate: AtomicBool,
	ready: AtomicBool,
	mapping: Mutex<Arc<Vec<Vec<FrameId>>>>,
}

/// Handle of the background SOM worker thread.
pub struct SomWorker {
	shared: Arc<Shared>,
	handle: Option<JoinHandle<()>>,
}

impl SomWorker {
	/// Spawn the worker; it idles until the first [`Self::start_work`].
	#[must_use]
	pub fn spawn() -> Self {
		let shared = Arc::new(Shared {
			slot: Mutex::new(None),
			wakeup: Condvar::new(),
			new_data: AtomicBool::new(false),
			terminate: AtomicBool::new(false),
			ready: AtomicBool::new(false),
			mapping: Mutex::new(Arc::new(Vec::new())),
		});

		let worker_shared = Arc::clone(&shared);
		let handle = std::thread::Builder::new()
			.name("som-worker".into())
			.spawn(move || worker_loop(&worker_shared))
			.ok();

		Self { shared, handle }
	}

	/// Hand the worker a fresh `(features, scores)` snapshot.
	///
	/// Blocks only for the copy under the slot mutex. A snapshot that the
	/// worker has not yet consumed is replaced.
	pub fn start_work(&self, features: &FeatureStore, scores: &ScoreModel) {
		{
			let mut slot = self.shared.slot.lock();
			*slot = Some(Job {
				points: features.as_flat().to_vec(),
				scores: scores.as_slice().to_vec(),
				dim: features.dim(),
			});
			self.shared.new_data.store(true, Ordering::Release);
		}
		self.shared.wakeup.notify_one();
	}

	/// Whether a trained mapping has been published for the current input.
	#[must_use]
	pub fn map_ready(&self) -> bool {
		self.shared.ready.load(Ordering::Acquire)
	}

	/// Snapshot of the cell→frames mapping, one entry per grid cell.
	///
	/// Meaningful only while [`Self::map_ready`] holds; an engine that asks
	/// earlier gets the (possibly empty) previous publication.
	#[must_use]
	pub fn mapping(&self) -> Arc<Vec<Vec<FrameId>>> {
		Arc::clone(&self.shared.mapping.lock())
	}
}

impl Drop for SomWorker {
	fn drop(&mut self) {
		info!("requesting SOM worker termination");
		self.shared.terminate.store(true, Ordering::Release);
		self.shared.wakeup.notify_all();
		if let Some(handle) = self.handle.take() {
			let _ = handle.join();
		}
		info!("SOM worker terminated");
	}
}

fn worker_loop(shared: &Shared) {
	info!("SOM worker starting");

	let width = SOM_DISPLAY_GRID_WIDTH;
	let height = SOM_DISPLAY_GRID_HEIGHT;
	let cells = width * height;
	let mut rng = rand::thread_rng();

	loop {
		// Get new data, or wait for some.
		let job = {
			let mut slot = shared.slot.lock();
			loop {
				if shared.terminate.load(Ordering::Acquire) {
					info!("SOM worker terminating");
					return;
				}
				if let Some(job) = slot.take() {
					shared.new_data.store(false, Ordering::Release);
					shared.ready.store(false, Ordering::Release);
					debug!(frames = job.scores.len(), "SOM worker got new work");
					break job;
				}
				shared.wakeup.wait(&mut slot);
			}
		};

		let stale =
			|| shared.new_data.load(Ordering::Relaxed) || shared.terminate.load(Ordering::Relaxed);

		let nhbrdist = som::grid_neighbor_distances(width, height);
		if stale() {
			continue;
		}

		let Some(koho) = som::train(
			cells,
			job.dim,
			SOM_ITERS,
			&job.points,
			&job.scores,
			&nhbrdist,
			som::radii_a(width, height),
			&mut rng,
			&stale,
		) else {
			continue;
		};
		if stale() {
			continue;
		}

		let cell_of = som::map_points(job.scores.len(), cells, job.dim, &job.points, &koho);
		if stale() {
			continue;
		}

		let mut mapping: Vec<Vec<FrameId>> = vec![Vec::new(); cells];
		for (frame, &cell) in cell_of.iter().enumerate() {
			mapping[cell].push(frame);
		}

		*shared.mapping.lock() = Arc::new(mapping);
		shared.ready.store(true, Ordering::Release);
		debug!("SOM mapping published");
	}
}
