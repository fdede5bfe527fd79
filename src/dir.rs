// This file is part of vmp4, a virtual .mp4 file assembler.
// Copyright (C) 2025 The vmp4 Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Sample file directory access.
//!
//! Sample files live in a flat directory, named by the canonical hyphenated
//! form of their recording's UUID. The directory handle is shared by reference
//! with every virtual file built from it; this crate opens files read-only and
//! never manages their lifecycle.

use std::fs;
use std::io;
use std::path::PathBuf;
use uuid::Uuid;

/// A handle to the directory holding sample files.
#[derive(Debug)]
pub struct SampleFileDir {
    path: PathBuf,
}

impl SampleFileDir {
    pub fn new<P: Into<PathBuf>>(path: P) -> SampleFileDir {
        SampleFileDir { path: path.into() }
    }

    /// Opens the given sample file for reading.
    pub fn open_sample_file(&self, uuid: Uuid) -> io::Result<fs::File> {
        fs::File::open(self.path.join(uuid.to_string()))
    }
}
