// This file is part of vmp4, a virtual .mp4 file assembler.
// Copyright (C) 2025 The vmp4 Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Memory-mapped sample file serving.

use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::io;
use std::ops::Range;

/// A read-only mapping of a byte sub-range of a sample file.
///
/// Constructed on first touch of the corresponding part of the virtual file
/// and kept for the life of the enclosing `Mp4File`, so the mapping is
/// established at most once per segment and the kernel decides how much to
/// page in at a time. The sample file must be immutable while mapped: a file
/// shrinking under an established `mmap` faults the process with `SIGBUS`.
/// Sample files satisfy this; they are never modified after their recording
/// becomes visible, only unlinked.
pub struct MmapFileSlice {
    /// `None` iff the sub-range is empty; zero-length mappings are rejected
    /// by the kernel.
    map: Option<Mmap>,
}

impl MmapFileSlice {
    /// Maps `range` of `f`. The file's length must cover `range`.
    pub fn new(f: &File, range: Range<i64>) -> io::Result<MmapFileSlice> {
        assert!(
            0 <= range.start && range.start <= range.end,
            "invalid sample file range {range:?}"
        );
        if range.start == range.end {
            return Ok(MmapFileSlice { map: None });
        }
        let map = unsafe {
            MmapOptions::new()
                .offset(range.start as u64)
                .len((range.end - range.start) as usize)
                .map(f)?
        };
        Ok(MmapFileSlice { map: Some(map) })
    }

    /// The length of the mapped sub-range.
    pub fn len(&self) -> u64 {
        self.map.as_ref().map(|m| m.len() as u64).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_none()
    }

    /// Writes `range`, relative to the mapped sub-range, to `out`.
    pub fn write_to(&self, range: Range<u64>, out: &mut dyn io::Write) -> io::Result<()> {
        if range.start == range.end {
            return Ok(());
        }
        let map = self.map.as_ref().expect("nonempty range in empty mapping");
        assert!(
            range.end <= map.len() as u64,
            "requested {range:?} beyond mapping of {} bytes",
            map.len()
        );
        out.write_all(&map[range.start as usize..range.end as usize])
    }
}
