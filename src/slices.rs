// This file is part of vmp4, a virtual .mp4 file assembler.
// Copyright (C) 2025 The vmp4 Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The slice composition engine: a virtual byte stream assembled from an
//! ordered sequence of heterogeneous producers.
//!
//! Each producer declares its size up front; [`Slices`] keeps the cumulative
//! end offsets so that the total size is known before any byte is produced
//! (`Content-Length` must be answerable without materializing anything) and a
//! range request resolves to the intersecting producers by binary search.

use crate::error::{Error, Result};
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::ops::Range;

/// Writes a byte range to an output sink, given a context argument.
/// Each `ContextWriter` instance belongs to a single [`Slices`].
pub trait ContextWriter<Ctx> {
    /// Writes `r`, relative to this slice's start, to `out`. `l` is this
    /// slice's total length, as recorded by the enclosing [`Slices`].
    fn write_to(&self, ctx: &Ctx, r: Range<u64>, l: u64, out: &mut dyn io::Write) -> Result<()>;
}

/// Calls `f` with an `io::Write` which materializes the entire piece, then
/// copies out only the section indicated by `r`. Useful for implementing
/// [`ContextWriter`] for small pieces generated on the fly. `f` must produce
/// exactly `l` bytes.
pub fn clip_to_range<F>(r: Range<u64>, l: u64, out: &mut dyn io::Write, f: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    // Materializing the whole piece and copying the relevant portion is
    // cheaper than per-write bounds arithmetic for pieces of a few dozen
    // bytes, and the pieces fed through here never exceed that by much.
    let mut buf = Vec::with_capacity(l as usize);
    f(&mut buf)?;
    assert_eq!(
        buf.len() as u64,
        l,
        "clip_to_range generator produced wrong size"
    );
    out.write_all(&buf[r.start as usize..r.end as usize])?;
    Ok(())
}

struct SliceInfo<W> {
    /// The byte offset (relative to the start of the `Slices`) just past this
    /// slice. The starting offset is the previous slice's `end`.
    end: u64,
    writer: W,
}

/// A sequence of slices, ordered by ascending cumulative end offset.
/// Grows only while the virtual file is laid out; frozen before serving.
pub struct Slices<W, C> {
    /// Total byte length; equals the `end` of the last slice.
    len: u64,
    slices: Vec<SliceInfo<W>>,
    phantom: PhantomData<C>,
}

impl<W, C> fmt::Debug for Slices<W, C>
where
    W: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} slices with overall length {}:",
            self.slices.len(),
            self.len
        )?;
        let mut start = 0;
        for (i, s) in self.slices.iter().enumerate() {
            write!(
                f,
                "\ni {:7}: range [{:12}, {:12}) len {:12}: {:?}",
                i,
                start,
                s.end,
                s.end - start,
                s.writer
            )?;
            start = s.end;
        }
        Ok(())
    }
}

impl<W, C> Slices<W, C>
where
    W: ContextWriter<C>,
{
    pub fn new() -> Self {
        Slices {
            len: 0,
            slices: Vec::new(),
            phantom: PhantomData,
        }
    }

    /// Reserves space for at least `additional` more slices.
    pub fn reserve(&mut self, additional: usize) {
        self.slices.reserve(additional)
    }

    /// Appends a slice of the given length. Must not be called once serving
    /// has begun.
    pub fn append(&mut self, len: u64, writer: W) {
        self.len += len;
        self.slices.push(SliceInfo {
            end: self.len,
            writer,
        });
    }

    /// Returns the total byte length of all slices.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Returns the number of slices.
    pub fn num(&self) -> usize {
        self.slices.len()
    }

    /// Writes `range` to `out`, delegating each intersected sub-range to its
    /// slice in ascending offset order. Slices with a zero-width intersection
    /// are not visited. O(log n + k) in the slice count n and the number of
    /// intersected slices k.
    pub fn write_to(&self, ctx: &C, range: Range<u64>, out: &mut dyn io::Write) -> Result<()> {
        if range.start > range.end || range.end > self.len {
            return Err(Error::BadRange {
                range,
                len: self.len,
            });
        }
        if range.start == range.end {
            return Ok(());
        }

        // Find the first slice with bytes to contribute: the first whose end
        // offset exceeds `range.start`.
        let (mut i, mut slice_start) =
            match self.slices.binary_search_by_key(&range.start, |s| s.end) {
                Ok(i) => (i + 1, self.slices[i].end), // start == slice i's end; begin at i+1.
                Err(0) => (0, 0),                     // start < slice 0's end; begin at 0.
                Err(i) => (i, self.slices[i - 1].end), // start < slice i's end; begin at i.
            };

        let mut start_pos = range.start - slice_start;
        loop {
            let s = &self.slices[i];
            let l = s.end - slice_start;
            if range.end <= s.end {
                return s.writer.write_to(ctx, start_pos..range.end - slice_start, l, out);
            }
            if start_pos < l {
                // Skip zero-length slices rather than delegating an empty range.
                s.writer.write_to(ctx, start_pos..l, l, out)?;
            }
            start_pos = 0;
            slice_start = s.end;
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{clip_to_range, ContextWriter, Slices};
    use crate::error::{Error, Result};
    use crate::testutil;
    use std::cell::RefCell;
    use std::io::Write;
    use std::ops::Range;

    #[derive(Debug, Eq, PartialEq)]
    struct FakeWrite {
        writer: &'static str,
        range: Range<u64>,
    }

    #[derive(Debug)]
    struct FakeWriter {
        name: &'static str,
    }

    impl ContextWriter<RefCell<Vec<FakeWrite>>> for FakeWriter {
        fn write_to(
            &self,
            ctx: &RefCell<Vec<FakeWrite>>,
            r: Range<u64>,
            _l: u64,
            _out: &mut dyn Write,
        ) -> Result<()> {
            ctx.borrow_mut().push(FakeWrite {
                writer: self.name,
                range: r,
            });
            Ok(())
        }
    }

    fn new_slices() -> Slices<FakeWriter, RefCell<Vec<FakeWrite>>> {
        let mut s = Slices::new();
        s.append(5, FakeWriter { name: "a" });
        s.append(13, FakeWriter { name: "b" });
        s.append(7, FakeWriter { name: "c" });
        s.append(17, FakeWriter { name: "d" });
        s.append(19, FakeWriter { name: "e" });
        s
    }

    fn get_writes(range: Range<u64>) -> Vec<FakeWrite> {
        let s = new_slices();
        let w = RefCell::new(Vec::new());
        let mut dummy = Vec::new();
        s.write_to(&w, range, &mut dummy).unwrap();
        w.into_inner()
    }

    #[test]
    fn size() {
        testutil::init();
        assert_eq!(5 + 13 + 7 + 17 + 19, new_slices().len());
        assert_eq!(5, new_slices().num());
    }

    #[test]
    fn exact_slice() {
        // Exactly slice b.
        testutil::init();
        #[rustfmt::skip]
        assert_eq!(
            &[FakeWrite { writer: "b", range: 0..13 }],
            &get_writes(5..18)[..]
        );
    }

    #[test]
    fn offset_first() {
        // Part of slice a.
        testutil::init();
        #[rustfmt::skip]
        assert_eq!(
            &[FakeWrite { writer: "a", range: 1..3 }],
            &get_writes(1..3)[..]
        );
    }

    #[test]
    fn offset_mid() {
        // Part of slice b, all of slice c, and part of slice d.
        testutil::init();
        #[rustfmt::skip]
        assert_eq!(
            &[
                FakeWrite { writer: "b", range: 12..13 },
                FakeWrite { writer: "c", range: 0..7 },
                FakeWrite { writer: "d", range: 0..1 },
            ],
            &get_writes(17..26)[..]
        );
    }

    #[test]
    fn everything() {
        testutil::init();
        #[rustfmt::skip]
        assert_eq!(
            &[
                FakeWrite { writer: "a", range: 0..5 },
                FakeWrite { writer: "b", range: 0..13 },
                FakeWrite { writer: "c", range: 0..7 },
                FakeWrite { writer: "d", range: 0..17 },
                FakeWrite { writer: "e", range: 0..19 },
            ],
            &get_writes(0..61)[..]
        );
    }

    #[test]
    fn empty_ranges() {
        testutil::init();
        let empty: &[FakeWrite] = &[];
        assert_eq!(empty, &get_writes(0..0)[..]);
        assert_eq!(empty, &get_writes(5..5)[..]); // on a slice boundary
        assert_eq!(empty, &get_writes(20..20)[..]); // inside a slice
        assert_eq!(empty, &get_writes(61..61)[..]); // at the very end
    }

    #[test]
    fn bad_range() {
        testutil::init();
        let s = new_slices();
        let w = RefCell::new(Vec::new());
        let mut dummy = Vec::new();
        match s.write_to(&w, 0..62, &mut dummy) {
            Err(Error::BadRange { range, len }) => {
                assert_eq!(range, 0..62);
                assert_eq!(len, 61);
            }
            o => panic!("expected BadRange, got {:?}", o.map(|_| ())),
        }
        assert!(w.borrow().is_empty());
    }

    #[test]
    fn zero_length_slice_skipped() {
        testutil::init();
        let mut s = Slices::new();
        s.append(5, FakeWriter { name: "a" });
        s.append(0, FakeWriter { name: "empty" });
        s.append(7, FakeWriter { name: "b" });
        let w = RefCell::new(Vec::new());
        let mut dummy = Vec::new();
        s.write_to(&w, 3..8, &mut dummy).unwrap();
        #[rustfmt::skip]
        assert_eq!(
            &[
                FakeWrite { writer: "a", range: 3..5 },
                FakeWrite { writer: "b", range: 0..3 },
            ],
            &w.into_inner()[..]
        );
    }

    #[test]
    fn test_clip_to_range() {
        testutil::init();
        let mut out = Vec::new();

        // Simple case: one write with everything.
        clip_to_range(0..5, 5, &mut out, |w| {
            w.write_all(b"01234").unwrap();
            Ok(())
        })
        .unwrap();
        assert_eq!(b"01234", &out[..]);

        // Same in a few writes.
        out.clear();
        clip_to_range(0..5, 5, &mut out, |w| {
            w.write_all(b"0").unwrap();
            w.write_all(b"123").unwrap();
            w.write_all(b"4").unwrap();
            Ok(())
        })
        .unwrap();
        assert_eq!(b"01234", &out[..]);

        // Limiting to a prefix.
        out.clear();
        clip_to_range(0..2, 5, &mut out, |w| {
            w.write_all(b"01234").unwrap();
            Ok(())
        })
        .unwrap();
        assert_eq!(b"01", &out[..]);

        // Limiting to part in the middle.
        out.clear();
        clip_to_range(2..4, 5, &mut out, |w| {
            w.write_all(b"01234").unwrap();
            Ok(())
        })
        .unwrap();
        assert_eq!(b"23", &out[..]);

        // A generator error is propagated.
        out.clear();
        let e = clip_to_range(0..4, 4, &mut out, |_| {
            Err(Error::IndexDecode("some error".to_owned()))
        })
        .unwrap_err();
        assert!(matches!(e, Error::IndexDecode(ref m) if m == "some error"));
    }
}
