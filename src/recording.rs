// This file is part of vmp4, a virtual .mp4 file assembler.
// Copyright (C) 2025 The vmp4 Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Recordings and their compact per-frame sample index.
//!
//! A recording is an on-disk sample file plus metadata supplied by the recordings
//! subsystem: wall times, sizes, a SHA-1 of the sample file, and the `video_index`
//! blob. The index holds one entry per frame as two varints (see [`crate::coding`]):
//! a zigzagged duration delta with the key-frame flag folded into the low bit, and a
//! zigzagged size delta against the previous frame of the same keyness.

use crate::coding::{append_varint32, decode_varint32, unzigzag32, zigzag32};
use crate::error::{Error, Result};
use std::fmt;
use std::ops;
use std::ops::Range;
use tracing::trace;
use uuid::Uuid;

/// Number of time units per second. Both the movie and media headers use this
/// timescale, so durations in the sample index are used as-is.
pub const TIME_UNITS_PER_SEC: i64 = 90_000;

/// A time specified as 90,000ths of a second since 1970-01-01 00:00:00 UTC.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Time(pub i64);

impl Time {
    pub fn unix_seconds(self) -> i64 {
        self.0 / TIME_UNITS_PER_SEC
    }
}

impl ops::Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl ops::Sub for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

/// A duration specified in 1/90,000ths of a second.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Duration(pub i64);

impl ops::Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl ops::AddAssign for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0
    }
}

/// A single `stsd` entry (such as an `avc1` box) shared by every segment of a
/// virtual file. `data` is the raw entry payload, stored verbatim.
#[derive(Clone)]
pub struct VideoSampleEntry {
    pub id: i32,
    pub width: u16,
    pub height: u16,
    pub sha1: [u8; 20],
    pub data: Vec<u8>,
}

impl fmt::Debug for VideoSampleEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VideoSampleEntry")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// One recorded run of video, as supplied by the recordings subsystem.
/// Immutable here; the `video_index` must decode to exactly `video_samples`
/// entries whose durations sum to `end - start` and whose sizes sum to
/// `sample_file_bytes`, and the first frame must be a key frame.
#[derive(Clone, Debug)]
pub struct Recording {
    pub start: Time,
    pub end: Time,
    pub sample_file_uuid: Uuid,
    pub sample_file_bytes: i64,
    pub sample_file_sha1: [u8; 20],
    pub video_samples: i32,
    pub video_sync_samples: i32,
    pub video_sample_entry_id: i32,
    pub video_index: Vec<u8>,
}

impl Recording {
    pub fn duration_90k(&self) -> i32 {
        (self.end - self.start).0 as i32
    }
}

/// An iterator through a sample index.
/// Initially positioned before the first frame; call `next()` before each read.
#[derive(Clone, Copy, Debug)]
pub struct SampleIndexIterator {
    /// The index byte position of the next entry to decode (low 31 bits) and
    /// whether the current frame is a key frame (high bit).
    i_and_is_key: u32,

    /// The starting byte position of this frame's payload within the sample file.
    pub pos: i64,

    /// The starting time of this frame relative to the recording start, in 90 kHz units.
    pub start_90k: i32,

    /// The duration of this frame in 90 kHz units. Zero is only allowed on the
    /// final frame of a recording.
    pub duration_90k: i32,

    /// The byte length of this frame's payload.
    pub bytes: i32,

    /// The byte length of the last frame of the "other" keyness, needed to
    /// apply the next frame's size delta.
    bytes_other: i32,
}

impl SampleIndexIterator {
    pub fn new() -> SampleIndexIterator {
        SampleIndexIterator {
            i_and_is_key: 0,
            pos: 0,
            start_90k: 0,
            duration_90k: 0,
            bytes: 0,
            bytes_other: 0,
        }
    }

    /// The ending time of this frame relative to the recording start.
    pub fn end_90k(&self) -> i32 {
        self.start_90k + self.duration_90k
    }

    pub fn is_key(&self) -> bool {
        (self.i_and_is_key & 0x8000_0000) != 0
    }

    /// True if `next()` has never succeeded on this iterator.
    pub fn uninitialized(&self) -> bool {
        self.i_and_is_key == 0
    }

    /// Advances to the next frame, returning false at the end of the index.
    pub fn next(&mut self, data: &[u8]) -> Result<bool> {
        self.pos += i64::from(self.bytes);
        self.start_90k += self.duration_90k;
        let i = (self.i_and_is_key & 0x7FFF_FFFF) as usize;
        if i == data.len() {
            return Ok(false);
        }
        let (raw1, i1) = decode_varint32(data, i)
            .map_err(|()| Error::IndexDecode(format!("bad varint 1 at offset {i}")))?;
        let (raw2, i2) = decode_varint32(data, i1)
            .map_err(|()| Error::IndexDecode(format!("bad varint 2 at offset {i1}")))?;
        let duration_90k_delta = unzigzag32(raw1 >> 1);
        self.duration_90k += duration_90k_delta;
        if self.duration_90k < 0 {
            return Err(Error::IndexDecode(format!(
                "negative duration {} after applying delta {}",
                self.duration_90k, duration_90k_delta
            )));
        }
        if self.duration_90k == 0 && data.len() > i2 {
            return Err(Error::IndexDecode(format!(
                "zero duration only allowed at end; have {} bytes left",
                data.len() - i2
            )));
        }
        let (prev_bytes_key, prev_bytes_nonkey) = match self.is_key() {
            true => (self.bytes, self.bytes_other),
            false => (self.bytes_other, self.bytes),
        };
        self.i_and_is_key = (i2 as u32) | ((raw1 & 1) << 31);
        let bytes_delta = unzigzag32(raw2);
        if self.is_key() {
            self.bytes = prev_bytes_key + bytes_delta;
            self.bytes_other = prev_bytes_nonkey;
        } else {
            self.bytes = prev_bytes_nonkey + bytes_delta;
            self.bytes_other = prev_bytes_key;
        }
        if self.bytes <= 0 {
            return Err(Error::IndexDecode(format!(
                "non-positive bytes {} after applying delta {} to key={} frame at ts {}",
                self.bytes,
                bytes_delta,
                self.is_key(),
                self.start_90k
            )));
        }
        Ok(true)
    }
}

/// The writing half of the index format; used by ingest and by tests which
/// fabricate recordings.
#[derive(Debug, Default)]
pub struct SampleIndexEncoder {
    prev_duration_90k: i32,
    prev_bytes_key: i32,
    prev_bytes_nonkey: i32,

    pub sample_file_bytes: i64,
    pub total_duration_90k: i32,
    pub video_samples: i32,
    pub video_sync_samples: i32,
    pub video_index: Vec<u8>,
}

impl SampleIndexEncoder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_sample(&mut self, duration_90k: i32, bytes: i32, is_key: bool) {
        let duration_delta = duration_90k - self.prev_duration_90k;
        self.prev_duration_90k = duration_90k;
        self.total_duration_90k += duration_90k;
        self.sample_file_bytes += i64::from(bytes);
        self.video_samples += 1;
        let bytes_delta = bytes
            - if is_key {
                let prev = self.prev_bytes_key;
                self.video_sync_samples += 1;
                self.prev_bytes_key = bytes;
                prev
            } else {
                let prev = self.prev_bytes_nonkey;
                self.prev_bytes_nonkey = bytes;
                prev
            };
        append_varint32(
            (zigzag32(duration_delta) << 1) | (is_key as u32),
            &mut self.video_index,
        );
        append_varint32(zigzag32(bytes_delta), &mut self.video_index);
    }
}

/// A view of some or all of a single recording, starting from a key frame.
///
/// [`Segment::init`] scans the sample index once, eagerly, to find the
/// GOP-aligned boundaries enclosing the desired window and to count frames and
/// key frames; those counts size the `.mp4` sample tables before any of their
/// bytes exist. The actual time range is `[begin.start_90k, actual_end_90k)`
/// and necessarily encloses the desired range.
pub struct Segment {
    pub recording: Recording,
    begin: SampleIndexIterator,
    file_end: i64,
    pub desired_range_90k: Range<i32>,
    actual_end_90k: i32,
    pub frames: i32,
    pub key_frames: i32,
}

impl Segment {
    /// Creates a segment for `desired_range_90k`, relative to the recording
    /// start. The actual range starts at the latest key frame at or before the
    /// desired start and ends at the first frame boundary at or after the
    /// desired end (or the recording end, whichever comes first); it is
    /// determined by [`Segment::init`], which must be called before use.
    pub fn new(recording: Recording, desired_range_90k: Range<i32>) -> Result<Segment> {
        if desired_range_90k.start < 0 || desired_range_90k.start > desired_range_90k.end {
            return Err(Error::InvalidWindow(desired_range_90k));
        }
        Ok(Segment {
            begin: SampleIndexIterator::new(),
            file_end: recording.sample_file_bytes,
            desired_range_90k,
            actual_end_90k: recording.duration_90k(),
            frames: recording.video_samples,
            key_frames: recording.video_sync_samples,
            recording,
        })
    }

    /// Scans the sample index once, filling in the GOP-aligned boundaries and
    /// the frame counts. A window covering the whole recording skips the scan;
    /// the counts and byte range are already known from the recording row.
    pub fn init(&mut self) -> Result<()> {
        let duration_90k = self.recording.duration_90k();
        if self.desired_range_90k.start == 0 && self.desired_range_90k.end >= duration_90k {
            trace!(
                "segment fast path: {} frames ({} key)",
                self.frames,
                self.key_frames
            );
            return Ok(());
        }

        let data = &self.recording.video_index;
        let mut it = SampleIndexIterator::new();
        if !it.next(data)? {
            return Err(Error::IndexDecode("no frames in index".to_owned()));
        }
        if !it.is_key() {
            return Err(Error::NotKeyFramed(self.recording.sample_file_uuid));
        }

        // A window ending at the recording's end is scanned to the end of the
        // index rather than to the desired end, so that a trailing
        // zero-duration frame is included just as on the fast path.
        let end_90k = if self.desired_range_90k.end >= duration_90k {
            i32::MAX
        } else {
            self.desired_range_90k.end
        };

        self.frames = 0;
        self.key_frames = 0;
        loop {
            if it.start_90k <= self.desired_range_90k.start && it.is_key() {
                // New candidate for the GOP boundary to start at.
                self.begin = it;
                self.frames = 0;
                self.key_frames = 0;
            }
            if it.start_90k >= end_90k {
                break;
            }
            self.frames += 1;
            self.key_frames += it.is_key() as i32;
            if !it.next(data)? {
                break;
            }
        }
        self.file_end = it.pos;
        self.actual_end_90k = it.start_90k;
        trace!(
            "segment wanted ts {:?}, got ts [{}, {}): {} frames ({} key), bytes [{}, {})",
            self.desired_range_90k,
            self.begin.start_90k,
            self.actual_end_90k,
            self.frames,
            self.key_frames,
            self.begin.pos,
            self.file_end
        );
        Ok(())
    }

    /// The byte range within the sample file covered by this segment. Its
    /// start is the start of a GOP.
    pub fn sample_file_range(&self) -> Range<i64> {
        self.begin.pos..self.file_end
    }

    /// The time range actually covered, as described in [`Segment::new`].
    pub fn actual_time_90k(&self) -> Range<i32> {
        self.begin.start_90k..self.actual_end_90k
    }

    /// Calls `f` once per frame, in order, for exactly the `frames` frames
    /// counted by [`Segment::init`].
    pub fn foreach<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&SampleIndexIterator) -> Result<()>,
    {
        let data = &self.recording.video_index;
        let mut it = self.begin;
        if it.uninitialized() {
            if !it.next(data)? {
                return Err(Error::IndexDecode(format!(
                    "recording {}: no frames",
                    self.recording.sample_file_uuid
                )));
            }
            if !it.is_key() {
                return Err(Error::NotKeyFramed(self.recording.sample_file_uuid));
            }
        }
        let mut have_frame = true;
        let mut key_frame = 0;
        for i in 0..self.frames {
            if !have_frame {
                return Err(Error::IndexDecode(format!(
                    "recording {}: expected {} frames, found only {}",
                    self.recording.sample_file_uuid, self.frames, i
                )));
            }
            if it.is_key() {
                key_frame += 1;
                if key_frame > self.key_frames {
                    return Err(Error::IndexDecode(format!(
                        "recording {}: more than expected {} key frames",
                        self.recording.sample_file_uuid, self.key_frames
                    )));
                }
            }
            f(&it)?;
            have_frame = it.next(data)?;
        }
        if key_frame < self.key_frames {
            return Err(Error::IndexDecode(format!(
                "recording {}: expected {} key frames, found only {}",
                self.recording.sample_file_uuid, self.key_frames, key_frame
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    /// Encodes a sequence of samples and checks the exact wire bytes along
    /// with the encoder's counters.
    #[test]
    fn encode_example() {
        testutil::init();
        let mut e = SampleIndexEncoder::new();
        e.add_sample(10, 1000, true);
        e.add_sample(9, 10, false);
        e.add_sample(11, 15, false);
        e.add_sample(10, 12, false);
        e.add_sample(10, 1050, true);
        assert_eq!(e.video_index, b"\x29\xd0\x0f\x02\x14\x08\x0a\x02\x05\x01\x64");
        assert_eq!(10 + 9 + 11 + 10 + 10, e.total_duration_90k);
        assert_eq!(5, e.video_samples);
        assert_eq!(2, e.video_sync_samples);
        assert_eq!(1000 + 10 + 15 + 12 + 1050, e.sample_file_bytes);
    }

    /// Round trip from `SampleIndexEncoder` to `SampleIndexIterator`.
    #[test]
    fn index_round_trip() {
        testutil::init();
        #[derive(Debug, PartialEq, Eq)]
        struct Sample {
            duration_90k: i32,
            bytes: i32,
            is_key: bool,
        }
        #[rustfmt::skip]
        let samples = [
            Sample { duration_90k: 10, bytes: 30000, is_key: true },
            Sample { duration_90k:  9, bytes:  1000, is_key: false },
            Sample { duration_90k: 11, bytes:  1100, is_key: false },
            Sample { duration_90k: 18, bytes: 31000, is_key: true },
            Sample { duration_90k:  0, bytes:  1000, is_key: false },
        ];
        let mut e = SampleIndexEncoder::new();
        for sample in &samples {
            e.add_sample(sample.duration_90k, sample.bytes, sample.is_key);
        }
        let mut it = SampleIndexIterator::new();
        let mut pos = 0;
        for sample in &samples {
            assert!(it.next(&e.video_index).unwrap());
            assert_eq!(pos, it.pos);
            assert_eq!(
                sample,
                &Sample {
                    duration_90k: it.duration_90k,
                    bytes: it.bytes,
                    is_key: it.is_key(),
                }
            );
            pos += i64::from(sample.bytes);
        }
        assert!(!it.next(&e.video_index).unwrap());
    }

    /// `SampleIndexIterator` must spot each class of corruption.
    #[test]
    fn iterator_errors() {
        testutil::init();
        let tests: &[(&[u8], &str)] = &[
            (b"\x80", "bad varint 1 at offset 0"),
            (b"\x00\x80", "bad varint 2 at offset 1"),
            (
                b"\x00\x02\x00\x00",
                "zero duration only allowed at end; have 2 bytes left",
            ),
            (b"\x02\x02", "negative duration -1 after applying delta -1"),
            (
                b"\x04\x00",
                "non-positive bytes 0 after applying delta 0 to key=false frame at ts 0",
            ),
        ];
        for &(encoded, msg) in tests {
            let mut it = SampleIndexIterator::new();
            match it.next(encoded) {
                Err(Error::IndexDecode(m)) => assert_eq!(m, msg),
                o => panic!("expected IndexDecode({msg:?}), got {o:?}"),
            }
        }
    }

    fn new_segment(recording: Recording, desired_range_90k: Range<i32>) -> Segment {
        let mut s = Segment::new(recording, desired_range_90k).unwrap();
        s.init().unwrap();
        s
    }

    fn get_frames<F, T>(segment: &Segment, f: F) -> Vec<T>
    where
        F: Fn(&SampleIndexIterator) -> T,
    {
        let mut v = Vec::new();
        segment
            .foreach(|it| {
                v.push(f(it));
                Ok(())
            })
            .unwrap();
        v
    }

    /// Clipping at both ends when every frame is a sync frame, so the segment
    /// can start exactly at the desired point.
    #[test]
    fn segment_clipping_with_all_sync() {
        testutil::init();
        let mut encoder = SampleIndexEncoder::new();
        for i in 1..6 {
            encoder.add_sample(2 * i, 3 * i, true);
        }
        let recording = testutil::recording_from_encoder(Time(0), encoder, 1);
        // Time range [2, 2+4+6+8) means the 2nd, 3rd, and 4th samples.
        let segment = new_segment(recording, 2..2 + 4 + 6 + 8);
        assert_eq!(&get_frames(&segment, |it| it.duration_90k), &[4, 6, 8]);
        assert_eq!(segment.actual_time_90k(), 2..2 + 4 + 6 + 8);
    }

    /// With only every other frame a sync frame, the segment must start from
    /// the latest sync frame at or before the desired point.
    #[test]
    fn segment_clipping_with_half_sync() {
        testutil::init();
        let mut encoder = SampleIndexEncoder::new();
        for i in 1..6 {
            encoder.add_sample(2 * i, 3 * i, (i % 2) == 1);
        }
        let recording = testutil::recording_from_encoder(Time(0), encoder, 1);
        // Time range [2+4+6, 2+4+6+8) means the 4th sample, and the 3rd gets
        // pulled in because it is the enclosing sync frame.
        let segment = new_segment(recording, 2 + 4 + 6..2 + 4 + 6 + 8);
        assert_eq!(&get_frames(&segment, |it| it.duration_90k), &[6, 8]);
    }

    #[test]
    fn segment_clipping_with_trailing_zero() {
        testutil::init();
        let mut encoder = SampleIndexEncoder::new();
        encoder.add_sample(1, 1, true);
        encoder.add_sample(1, 2, true);
        encoder.add_sample(0, 3, true);
        let recording = testutil::recording_from_encoder(Time(0), encoder, 1);
        let segment = new_segment(recording, 1..2);
        assert_eq!(&get_frames(&segment, |it| it.bytes), &[2, 3]);
    }

    /// A segment of the whole recording takes the fast path, skipping the scan.
    #[test]
    fn segment_fast_path() {
        testutil::init();
        let mut encoder = SampleIndexEncoder::new();
        for i in 1..6 {
            encoder.add_sample(2 * i, 3 * i, (i % 2) == 1);
        }
        let recording = testutil::recording_from_encoder(Time(0), encoder, 1);
        let segment = new_segment(recording, 0..2 + 4 + 6 + 8 + 10);
        assert_eq!(
            &get_frames(&segment, |it| it.duration_90k),
            &[2, 4, 6, 8, 10]
        );
        assert_eq!(segment.sample_file_range(), 0..3 + 6 + 9 + 12 + 15);
    }

    #[test]
    fn segment_fast_path_with_trailing_zero() {
        testutil::init();
        let mut encoder = SampleIndexEncoder::new();
        encoder.add_sample(1, 1, true);
        encoder.add_sample(1, 2, true);
        encoder.add_sample(0, 3, true);
        let recording = testutil::recording_from_encoder(Time(0), encoder, 1);
        let segment = new_segment(recording, 0..2);
        assert_eq!(&get_frames(&segment, |it| it.bytes), &[1, 2, 3]);
    }

    /// A recording not starting with a key frame can't be windowed.
    #[test]
    fn segment_not_key_framed() {
        testutil::init();
        let mut encoder = SampleIndexEncoder::new();
        encoder.add_sample(1, 1, false);
        encoder.add_sample(1, 2, true);
        let recording = testutil::recording_from_encoder(Time(0), encoder, 1);
        let mut segment = Segment::new(recording, 0..1).unwrap();
        match segment.init() {
            Err(Error::NotKeyFramed(_)) => {}
            o => panic!("expected NotKeyFramed, got {o:?}"),
        }
    }

    #[test]
    fn segment_invalid_window() {
        testutil::init();
        let mut encoder = SampleIndexEncoder::new();
        encoder.add_sample(1, 1, true);
        let recording = testutil::recording_from_encoder(Time(0), encoder, 1);
        match Segment::new(recording, 1..0) {
            Err(Error::InvalidWindow(r)) => assert_eq!(r, 1..0),
            o => panic!("expected InvalidWindow, got {:?}", o.map(|_| ())),
        }
    }
}
