// This file is part of vmp4, a virtual .mp4 file assembler.
// Copyright (C) 2025 The vmp4 Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Utilities for automated testing.

use crate::dir::SampleFileDir;
use crate::recording::{Recording, SampleIndexEncoder, Time, VideoSampleEntry};
use sha1::{Digest, Sha1};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

static INIT: std::sync::Once = std::sync::Once::new();

/// Performs global initialization for tests: logging to the test writer.
/// (Note the output can be confusing unless `RUST_TEST_THREADS=1` is set in
/// the program's environment prior to running.)
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();
    });
}

/// A real `avc1` sample entry (1920x1080), for tests which don't decode video.
pub const TEST_VIDEO_SAMPLE_ENTRY_DATA: &[u8] =
    b"\x00\x00\x00\x7D\x61\x76\x63\x31\x00\x00\x00\x00\x00\x00\x00\x01\x00\x00\x00\x00\x00\x00\x00\
    \x00\x00\x00\x00\x00\x00\x00\x00\x00\x07\x80\x04\x38\x00\x48\x00\x00\x00\x48\x00\x00\x00\x00\
    \x00\x00\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\
    \x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x18\xFF\xFF\x00\x00\x00\x27\x61\x76\
    \x63\x43\x01\x4D\x00\x2A\xFF\xE1\x00\x10\x67\x4D\x00\x2A\x95\xA8\x1E\x00\x89\xF9\x66\xE0\x20\
    \x20\x20\x40\x01\x00\x04\x68\xEE\x3C\x80";

pub fn test_video_sample_entry(id: i32) -> VideoSampleEntry {
    let mut h = Sha1::new();
    h.update(TEST_VIDEO_SAMPLE_ENTRY_DATA);
    VideoSampleEntry {
        id,
        width: 1920,
        height: 1080,
        sha1: h.finalize().into(),
        data: TEST_VIDEO_SAMPLE_ENTRY_DATA.to_vec(),
    }
}

/// Builds a `Recording` from an encoder's state without any backing sample
/// file, for tests which never touch sample data.
pub fn recording_from_encoder(
    start: Time,
    e: SampleIndexEncoder,
    video_sample_entry_id: i32,
) -> Recording {
    Recording {
        start,
        end: start + crate::recording::Duration(i64::from(e.total_duration_90k)),
        sample_file_uuid: Uuid::nil(),
        sample_file_bytes: e.sample_file_bytes,
        sample_file_sha1: [0; 20],
        video_samples: e.video_samples,
        video_sync_samples: e.video_sync_samples,
        video_sample_entry_id,
        video_index: e.video_index,
    }
}

/// A scratch sample file directory, removed on drop.
pub struct TestDir {
    pub dir: Arc<SampleFileDir>,
    pub tmpdir: TempDir,
}

impl TestDir {
    pub fn new() -> TestDir {
        let tmpdir = TempDir::new().unwrap();
        let dir = Arc::new(SampleFileDir::new(tmpdir.path()));
        TestDir { dir, tmpdir }
    }

    /// Writes a sample file of fabricated frames `(duration_90k, bytes,
    /// is_key)` and returns its `Recording` plus the payload written, so
    /// tests can byte-compare served sample data against the source.
    pub fn write_recording(
        &self,
        start: Time,
        frames: &[(i32, i32, bool)],
        video_sample_entry_id: i32,
    ) -> (Recording, Vec<u8>) {
        let mut encoder = SampleIndexEncoder::new();
        let mut payload = Vec::new();
        for (i, &(duration_90k, bytes, is_key)) in frames.iter().enumerate() {
            encoder.add_sample(duration_90k, bytes, is_key);
            for j in 0..bytes {
                payload.push((i as i32 * 7 + j) as u8);
            }
        }
        let uuid = Uuid::new_v4();
        std::fs::write(self.tmpdir.path().join(uuid.to_string()), &payload).unwrap();
        let mut h = Sha1::new();
        h.update(&payload);
        let mut recording = recording_from_encoder(start, encoder, video_sample_entry_id);
        recording.sample_file_uuid = uuid;
        recording.sample_file_sha1 = h.finalize().into();
        (recording, payload)
    }
}
