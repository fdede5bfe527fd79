// This file is part of vmp4, a virtual .mp4 file assembler.
// Copyright (C) 2025 The vmp4 Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The interface handed upward to the range-serving layer.

use crate::error::Result;
use std::io;
use std::ops::Range;

/// A logical byte stream presented to range-serving consumers without being
/// materialized.
///
/// Implementations are immutable once constructed: any number of threads may
/// call `write_range` concurrently on a shared reference, and for a fixed set
/// of inputs both the bytes and the etag are reproducible bit-for-bit. The
/// serving layer is responsible for HTTP semantics (range-header parsing,
/// conditional requests); it can rely on `len` before requesting any bytes,
/// and on `write_range` appending bytes in strictly ascending offset order
/// within one call.
pub trait VirtualFile: Send + Sync {
    /// Returns the total size in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes bytes `range` of the file to `out`. `write_range` may block on
    /// disk I/O; call it from a context which tolerates that. On error, the
    /// prefix already written to `out` is valid; it is never retracted.
    fn write_range(&self, range: Range<u64>, out: &mut dyn io::Write) -> Result<()>;

    /// A strong entity tag, already wrapped in double quotes.
    fn etag(&self) -> &str;

    /// Last modification time in whole seconds since the Unix epoch.
    fn last_modified(&self) -> i64;

    fn mime_type(&self) -> &'static str;
}
