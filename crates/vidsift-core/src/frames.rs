//! Immutable index of dataset keyframes.
//!
//! The index is loaded once from a text list of frame filenames, sorted by
//! video and then by frame number. Video ids, shot ids and frame numbers are
//! not stored separately upstream; they are cut out of each filename at
//! fixed, configured substring offsets. A side map from video id to its
//! contiguous frame-id range is built in the same pass by watching for
//! video-id transitions.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::Range;
use std::path::Path;

use tracing::info;

use crate::config::FilenameOffsets;
use crate::error::{CoreError, Result};
use crate::{FrameId, ShotId, VideoId};

/// One dataset keyframe.
#[derive(Debug, Clone)]
pub struct VideoFrame {
	/// Dense id, equal to the line number in the frame list
	pub frame_id: FrameId,
	/// Owning video
	pub video_id: VideoId,
	/// Shot within the video
	pub shot_id: ShotId,
	/// Frame number within the video, strictly increasing
	pub frame_number: usize,
	/// Stored filename, without the path prefix
	pub filename: String,
	/// Display decoration; the authoritative like set lives on the session
	pub liked: bool,
}

/// Immutable map from frame id to frame metadata plus per-video ranges.
pub struct FrameIndex {
	frames: Vec<VideoFrame>,
	video_ranges: Vec<Range<FrameId>>,
	path_prefix: String,
}

fn parse_field(
	filename: &str,
	off: usize,
	len: usize,
	what: &str,
	path: &Path,
) -> Result<usize> {
	let digits = filename.get(off..off + len).ok_or_else(|| CoreError::DatasetParse {
		path: path.to_path_buf(),
		message: format!("filename {filename:?} too short for {what} at bytes {off}..{}", off + len),
	})?;
	digits.parse().map_err(|_| CoreError::DatasetParse {
		path: path.to_path_buf(),
		message: format!("cannot parse {what} from {digits:?} in {filename:?}"),
	})
}

impl FrameIndex {
	/// Load the frame list and build the video range map.
	///
	/// # Errors
	///
	/// A missing file, an unparseable filename, an empty list or a list
	/// that is not sorted by video id is fatal.
	pub fn from_file(
		path: impl AsRef<Path>,
		offsets: FilenameOffsets,
		path_prefix: &str,
	) -> Result<Self> {
		let path = path.as_ref();
		info!(path = %path.display(), "loading frame list");

		let file = File::open(path).map_err(|_| CoreError::DatasetNotFound(path.to_path_buf()))?;

		let mut frames: Vec<VideoFrame> = Vec::new();
		for line in BufReader::new(file).lines() {
			let line = line?;
			let filename = line.trim_end_matches('\r');

			let video_id = parse_field(
				filename,
				offsets.vid_id_off,
				offsets.vid_id_len,
				"video id",
				path,
			)? as VideoId;
			let shot_id = parse_field(
				filename,
				offsets.shot_id_off,
				offsets.shot_id_len,
				"shot id",
				path,
			)? as ShotId;
			let frame_number = parse_field(
				filename,
				offsets.frame_num_off,
				offsets.frame_num_len,
				"frame number",
				path,
			)?;

			frames.push(VideoFrame {
				frame_id: frames.len(),
				video_id,
				shot_id,
				frame_number,
				filename: filename.to_owned(),
				liked: false,
			});
		}

		if frames.is_empty() {
			return Err(CoreError::DatasetParse {
				path: path.to_path_buf(),
				message: "no frame paths loaded".into(),
			});
		}

		// One pass over the list, closing a range at every video-id
		// transition. Ids must be non-decreasing for the positional
		// lookup below to hold.
		let num_videos = frames[frames.len() - 1].video_id as usize + 1;
		let mut video_ranges = vec![0..0; num_videos];
		let mut begin = 0;
		let mut prev_video = frames[0].video_id;
		for (i, frame) in frames.iter().enumerate() {
			if frame.video_id != prev_video {
				if frame.video_id < prev_video {
					return Err(CoreError::DatasetParse {
						path: path.to_path_buf(),
						message: format!(
							"frame list not sorted: video {} follows video {}",
							frame.video_id, prev_video
						),
					});
				}
				video_ranges[prev_video as usize] = begin..i;
				begin = i;
				prev_video = frame.video_id;
			}
		}
		video_ranges[prev_video as usize] = begin..frames.len();

		info!(frames = frames.len(), videos = num_videos, "frame list loaded");

		Ok(Self {
			frames,
			video_ranges,
			path_prefix: path_prefix.to_owned(),
		})
	}

	/// Number of frames in the dataset.
	#[must_use]
	pub fn len(&self) -> usize {
		self.frames.len()
	}

	/// True when the index holds no frames. Construction rejects this.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.frames.is_empty()
	}

	/// Number of videos, `last_frame.video_id + 1`.
	#[must_use]
	pub fn num_videos(&self) -> usize {
		self.video_ranges.len()
	}

	/// Frame metadata by id.
	#[must_use]
	pub fn get(&self, id: FrameId) -> Option<&VideoFrame> {
		self.frames.get(id)
	}

	/// Video id of a frame, `None` when out of range.
	#[must_use]
	pub fn video_id_of(&self, id: FrameId) -> Option<VideoId> {
		self.frames.get(id).map(|f| f.video_id)
	}

	/// Display source path of a frame: configured prefix + filename.
	#[must_use]
	pub fn src(&self, id: FrameId) -> Option<String> {
		self.frames
			.get(id)
			.map(|f| format!("{}{}", self.path_prefix, f.filename))
	}

	/// Iterate over all frames in id order.
	pub fn iter(&self) -> impl Iterator<Item = &VideoFrame> {
		self.frames.iter()
	}

	/// Contiguous frame-id range of a video.
	#[must_use]
	pub fn get_video_range(&self, video: VideoId) -> Option<Range<FrameId>> {
		self.video_ranges.get(video as usize).cloned()
	}

	/// Frame-id range of the frames of `video` whose frame number lies in
	/// `[frame_from, frame_to]`, narrowed linearly from both ends of the
	/// video range.
	#[must_use]
	pub fn get_shot_range(
		&self,
		video: VideoId,
		frame_from: usize,
		frame_to: usize,
	) -> Option<Range<FrameId>> {
		let range = self.get_video_range(video)?;
		let lo = range
			.clone()
			.find(|&i| self.frames[i].frame_number >= frame_from)?;
		let hi = range.rev().find(|&i| self.frames[i].frame_number <= frame_to)?;
		if lo > hi {
			return None;
		}
		Some(lo..hi + 1)
	}

	pub(crate) fn set_liked(&mut self, id: FrameId, liked: bool) {
		if let Some(frame) = self.frames.get_mut(id) {
			frame.liked = liked;
		}
	}

	pub(crate) fn clear_liked_flags(&mut self) {
		for frame in &mut self.frames {
			frame.liked = false;
		}
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use std::io::Write;

	use super::*;

	/// Offsets matching the `v#####_s#####_f########.jpg` test scheme.
	pub(crate) fn test_offsets() -> FilenameOffsets {
		FilenameOffsets {
			vid_id_off: 1,
			vid_id_len: 5,
			shot_id_off: 8,
			shot_id_len: 5,
			frame_num_off: 15,
			frame_num_len: 8,
		}
	}

	pub(crate) fn test_filename(video: VideoId, shot: ShotId, frame_number: usize) -> String {
		format!("v{video:05}_s{shot:05}_f{frame_number:08}.jpg")
	}

	/// Write a frame list file and load it.
	pub(crate) fn index_from_layout(layout: &[(VideoId, ShotId, usize)]) -> FrameIndex {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		for &(video, shot, frame_number) in layout {
			writeln!(file, "{}", test_filename(video, shot, frame_number)).unwrap();
		}
		FrameIndex::from_file(file.path(), test_offsets(), "thumbs/").unwrap()
	}

	#[test]
	fn test_parse_and_ranges() {
		let index = index_from_layout(&[
			(0, 0, 0),
			(0, 0, 10),
			(0, 1, 20),
			(1, 0, 0),
			(1, 0, 7),
			(2, 0, 3),
		]);

		assert_eq!(index.len(), 6);
		assert_eq!(index.num_videos(), 3);
		assert_eq!(index.get_video_range(0), Some(0..3));
		assert_eq!(index.get_video_range(1), Some(3..5));
		assert_eq!(index.get_video_range(2), Some(5..6));

		let frame = index.get(2).unwrap();
		assert_eq!(frame.video_id, 0);
		assert_eq!(frame.shot_id, 1);
		assert_eq!(frame.frame_number, 20);
		assert!(!frame.liked);
	}

	#[test]
	fn test_filename_round_trip() {
		let index = index_from_layout(&[(3, 7, 123)]);
		let frame = index.get(0).unwrap();
		assert_eq!(frame.filename, test_filename(3, 7, 123));
		assert_eq!(index.src(0).unwrap(), format!("thumbs/{}", test_filename(3, 7, 123)));
	}

	#[test]
	fn test_shot_range_narrowing() {
		let index = index_from_layout(&[
			(0, 0, 0),
			(0, 0, 5),
			(0, 1, 10),
			(0, 1, 15),
			(0, 2, 20),
		]);

		assert_eq!(index.get_shot_range(0, 5, 15), Some(1..4));
		assert_eq!(index.get_shot_range(0, 0, 100), Some(0..5));
		assert_eq!(index.get_shot_range(0, 21, 30), None);
		assert_eq!(index.get_shot_range(9, 0, 10), None);
	}

	#[test]
	fn test_unsorted_list_is_fatal() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "{}", test_filename(1, 0, 0)).unwrap();
		writeln!(file, "{}", test_filename(0, 0, 0)).unwrap();
		let res = FrameIndex::from_file(file.path(), test_offsets(), "");
		assert!(matches!(res, Err(CoreError::DatasetParse { .. })));
	}

	#[test]
	fn test_garbage_filename_is_fatal() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "nope").unwrap();
		let res = FrameIndex::from_file(file.path(), test_offsets(), "");
		assert!(matches!(res, Err(CoreError::DatasetParse { .. })));
	}

	#[test]
	fn test_missing_file_is_fatal() {
		let res = FrameIndex::from_file("/definitely/not/here.txt", test_offsets(), "");
		assert!(matches!(res, Err(CoreError::DatasetNotFound(_))));
	}
}
