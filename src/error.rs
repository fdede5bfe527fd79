// This file is part of vmp4, a virtual .mp4 file assembler.
// Copyright (C) 2025 The vmp4 Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

use std::io;
use std::ops::Range;
use thiserror::Error;

/// Everything that can go wrong while building or serving a virtual `.mp4`.
///
/// Build-time variants are fatal to [`crate::mp4::Mp4FileBuilder::build`]. The
/// serve-time variants (`IndexDecode` from a lazy table materialization,
/// `SampleFileIo`) terminate the response; the byte prefix already written to
/// the sink remains valid.
#[derive(Debug, Error)]
pub enum Error {
    /// The first frame of a recording is not a key frame, so no GOP-aligned
    /// window can be cut from it.
    #[error("recording {0} does not start with a key frame")]
    NotKeyFramed(uuid::Uuid),

    /// The per-frame sample index is corrupt.
    #[error("corrupt sample index: {0}")]
    IndexDecode(String),

    /// A segment's recording references a video sample entry other than the
    /// one the builder was given.
    #[error("inconsistent video sample entries: builder has {expected}, segment has {got}")]
    InconsistentSampleEntry { expected: i32, got: i32 },

    /// Build was called with no segments appended.
    #[error("can't construct empty .mp4")]
    EmptySegments,

    /// Build was called without a video sample entry.
    #[error("no video sample entry set")]
    NoSampleEntry,

    /// Build was called without a sample file directory.
    #[error("no sample file directory set")]
    NoSampleFileDir,

    /// A segment window that doesn't satisfy `0 <= start <= end`.
    #[error("invalid time range [{}, {}) relative to recording start", .0.start, .0.end)]
    InvalidWindow(Range<i32>),

    /// A byte range outside `[0, size())`.
    #[error("bad range [{}, {}) for file of length {len}", .range.start, .range.end)]
    BadRange { range: Range<u64>, len: u64 },

    /// An `open`/`mmap`/`write` failure while serving sample data.
    #[error("sample file I/O: {0}")]
    SampleFileIo(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
