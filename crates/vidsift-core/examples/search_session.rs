//! Walk one search session end to end
//!
//! This example generates a small synthetic dataset on disk (frames, unit
//! 2-D embeddings, two keyword classes), constructs an [`Engine`] over it
//! and drives the usual session loop: text query, browse, like, feedback
//! rescore, SOM overview.
//!
//! Run with: `cargo run --example search_session`

#![allow(clippy::unwrap_used)]

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use vidsift_core::config::{Config, FilenameOffsets, SubmitterConfig};
use vidsift_core::{Display, DisplayType, Engine};

/// `(video, shot, frame_number, embedding angle in degrees)` per frame.
const LAYOUT: [(u32, u32, usize, f32); 10] = [
	(0, 0, 0, 85.0),
	(0, 0, 40, 70.0),
	(0, 1, 80, 55.0),
	(1, 0, 0, 40.0),
	(1, 0, 35, 25.0),
	(1, 1, 70, 10.0),
	(1, 1, 105, 3.0),
	(2, 0, 0, 65.0),
	(2, 0, 50, 88.0),
	(2, 1, 100, 45.0),
];

fn write_floats(path: &Path, values: &[f32]) {
	let mut file = fs::File::create(path).unwrap();
	for v in values {
		file.write_all(&v.to_le_bytes()).unwrap();
	}
}

fn build_dataset(dir: &Path) -> Config {
	let frames_list = dir.join("frames.txt");
	let mut file = fs::File::create(&frames_list).unwrap();
	for &(video, shot, frame_number, _) in &LAYOUT {
		writeln!(file, "v{video:05}_s{shot:05}_f{frame_number:08}.jpg").unwrap();
	}

	let features: Vec<f32> = LAYOUT
		.iter()
		.flat_map(|&(_, _, _, deg)| {
			let rad = deg.to_radians();
			[rad.cos(), rad.sin()]
		})
		.collect();
	write_floats(&dir.join("features.bin"), &features);

	// Keyword 0 ("sunset") embeds to the x axis, keyword 1 ("sky") to y.
	fs::write(dir.join("keywords.txt"), "sunset:0\nsky:1\n").unwrap();
	write_floats(&dir.join("kw_scores.bin"), &[100.0, 0.0, 0.0, 100.0]);
	write_floats(&dir.join("kw_bias.bin"), &[0.0, 0.0]);
	write_floats(&dir.join("kw_mean.bin"), &[0.0, 0.0]);
	write_floats(&dir.join("kw_pca.bin"), &[1.0, 0.0, 0.0, 1.0]);

	Config {
		submitter: SubmitterConfig {
			submit_to_server: false,
			submit_rerank_url: "http://localhost:8080/rerank".into(),
			submit_url: "http://localhost:8080/submit".into(),
			team_id: 1,
			member_id: 1,
			submit_archive_dir: dir.join("archive"),
			submit_archive_log_suffix: ".json".into(),
			extra_verbose_log: false,
			send_logs_to_server_period: 10_000,
			log_replay_timeout: 1_000,
		},
		filename_offsets: FilenameOffsets {
			vid_id_off: 1,
			vid_id_len: 5,
			shot_id_off: 8,
			shot_id_len: 5,
			frame_num_off: 15,
			frame_num_len: 8,
		},
		frames_list_file: frames_list,
		frames_path_prefix: "thumbs/".into(),
		features_file: dir.join("features.bin"),
		features_file_data_off: 0,
		features_dim: 2,
		pre_pca_features_dim: 2,
		kw_bias_vec_file: dir.join("kw_bias.bin"),
		kw_scores_mat_file: dir.join("kw_scores.bin"),
		kw_pca_mean_vec_file: dir.join("kw_mean.bin"),
		kw_pca_mat_file: dir.join("kw_pca.bin"),
		kw_pca_mat_dim: 2,
		kws_file: dir.join("keywords.txt"),
		display_page_size: 6,
		topn_frames_per_video: 3,
		topn_frames_per_shot: 1,
	}
}

fn print_display(label: &str, display: &Display) {
	println!("{label}:");
	for frame in &display.frames {
		match frame.id {
			Some(id) => println!(
				"  #{id:<3} {}{}",
				frame.src,
				if frame.liked { "  (liked)" } else { "" }
			),
			None => println!("  ---"),
		}
	}
	println!();
}

fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "info".into()),
		)
		.init();

	let dir = tempfile::tempdir().unwrap();
	let config = build_dataset(dir.path());
	let mut engine = Engine::new(config).unwrap();

	// Autocomplete, as the UI would while the user types.
	let hits = engine.autocomplete_keywords("su", 5);
	println!(
		"autocomplete \"su\" -> {:?}\n",
		hits.iter().map(|kw| kw.synset_strs[0].as_str()).collect::<Vec<_>>()
	);

	// A text query: frames near the x axis come out on top.
	engine.rescore("sunset");
	let top = engine.get_display(DisplayType::TopN, None, 0).unwrap();
	print_display("top-n after \"sunset\"", &top);

	// Like the best match and fold the feedback in.
	let best = top.frames[0].id.unwrap();
	engine.add_likes(&[best]).unwrap();
	engine.rescore("sunset");
	let top = engine.get_display(DisplayType::TopN, None, 0).unwrap();
	print_display("top-n after feedback", &top);

	// Browse around the best match.
	let knn = engine.get_display(DisplayType::TopKnn, Some(best), 0).unwrap();
	print_display("nearest neighbors", &knn);

	let detail = engine
		.get_display(DisplayType::VideoDetail, Some(best), 0)
		.unwrap();
	print_display("video detail", &detail);

	// Wait for the SOM overview and show one frame per occupied cell.
	while !engine.som_ready() {
		std::thread::sleep(Duration::from_millis(20));
	}
	let som = engine.get_display(DisplayType::Som, None, 0).unwrap();
	let occupied = som.frames.iter().filter(|f| f.id.is_some()).count();
	println!("SOM grid ready: {occupied} of {} cells occupied", som.frames.len());

	// Found it.
	engine.submit_to_server(best).unwrap();
	println!("submitted frame {best}");
}
