// This file is part of vmp4, a virtual .mp4 file assembler.
// Copyright (C) 2025 The vmp4 Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Virtual `.mp4` file assembly.
//!
//! This crate builds seekable ISO/IEC 14496-12 (ISO base media format / MPEG-4 / `.mp4`)
//! byte streams from one or more pre-recorded video segments on disk. The stream is never
//! materialized in full: a range-serving layer asks for `[begin, end)` and the
//! [`mp4::Mp4File`] composes exactly those bytes from static box literals, a frozen header
//! buffer, lazily generated sample tables, and `mmap`ed sample-file payloads.
//!
//! The building blocks, bottom-up:
//!
//!    * [`slices`]: the slice composition engine. A virtual file is an ordered sequence of
//!      heterogeneous byte producers with a cumulative offset index; a range request
//!      binary-searches for the producers it intersects.
//!    * [`recording`]: the compact per-frame sample index and the per-window scan that
//!      selects GOP-aligned boundaries and sizes the `.mp4` sample tables.
//!    * [`mp4`]: the box layout itself, [`mp4::Mp4FileBuilder`], and the
//!      [`vfile::VirtualFile`] implementation handed to the serving layer.

pub mod coding;
pub mod dir;
pub mod error;
pub mod mmapfile;
pub mod mp4;
pub mod recording;
pub mod slices;
pub mod vfile;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};
