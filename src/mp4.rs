// This file is part of vmp4, a virtual .mp4 file assembler.
// Copyright (C) 2025 The vmp4 Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! `.mp4` virtual file assembly.
//!
//! This module builds virtual files representing ISO/IEC 14496-12 (ISO base media
//! format / MPEG-4 / `.mp4`) video. These can be constructed from one or more
//! recordings and are suitable for HTTP range serving or download. It will make the
//! most sense when read side-by-side with ISO/IEC 14496-12:2015, available at
//! <https://standards.iso.org/ittf/PubliclyAvailableStandards/>.
//!
//! A file is an ordered sequence of [`Mp4FileSlice`]s, each responsible for some
//! portion of the bytes, generally some subset of a single box. Slices fall into
//! these categories:
//!
//! 1. Entirely static data from a `const` byte literal, preferred when there is
//!    only one useful value for every field of a box, including its length.
//!    These are the `Static` variant.
//!
//! 2. Boxes whose fixed-length fields are computed during the build: these are
//!    written into a single append-only buffer owned by the `Mp4File` and served
//!    by offset through the `Buf` variant. A container's length field is patched
//!    in place once its children have been laid out (see [`write_length!`]); the
//!    buffer never reallocates after the build, so the offsets stay valid.
//!
//! 3. Variable-length sample table data covering a single segment: the `Stts`,
//!    `Stsz`, and `Stss` variants. These are the bulk of a typical `.mp4`'s
//!    metadata. Their sizes are declared eagerly (so the total file size and all
//!    later byte ranges are known up front) but their contents are generated
//!    only when a requested byte range overlaps them, then cached.
//!
//! 4. File-backed sample data: the `VideoSampleData` variant, `mmap`ed on first
//!    touch so the kernel decides how much to page in at once.
//!
//! The box hierarchy is assembled through append operations; most of the static
//! and computed data is in RAM as long as the `Mp4File` is, while the sample
//! tables and sample data are not. This is a reasonable compromise between
//! simplicity of implementation and memory efficiency.

use crate::dir::SampleFileDir;
use crate::error::{Error, Result};
use crate::mmapfile::MmapFileSlice;
use crate::recording::{self, Recording, Segment, VideoSampleEntry, TIME_UNITS_PER_SEC};
use crate::slices::{clip_to_range, ContextWriter, Slices};
use crate::vfile::VirtualFile;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use once_cell::sync::OnceCell;
use sha1::{Digest, Sha1};
use std::cmp;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// This value should be incremented any time a change is made to this file that
/// causes different bytes to be output for a particular set of `Mp4FileBuilder`
/// options. Incrementing this value will cause the etag to change as well.
const FORMAT_VERSION: [u8; 1] = [0x00];

/// An `ftyp` (ISO/IEC 14496-12 section 4.3 `FileType`) box.
const FTYP_BOX: &[u8] = &[
    0x00, 0x00, 0x00, 0x20, // length = 32, sizeof(FTYP_BOX)
    b'f', b't', b'y', b'p', // type
    b'i', b's', b'o', b'm', // major_brand
    0x00, 0x00, 0x02, 0x00, // minor_version
    b'i', b's', b'o', b'm', // compatible_brands[0]
    b'i', b's', b'o', b'2', // compatible_brands[1]
    b'a', b'v', b'c', b'1', // compatible_brands[2]
    b'm', b'p', b'4', b'1', // compatible_brands[3]
];

/// An `hdlr` (ISO/IEC 14496-12 section 8.4.3 `HandlerBox`) box suitable for a
/// video track.
const VIDEO_HDLR_BOX: &[u8] = &[
    0x00, 0x00, 0x00, 0x21, // length == sizeof(VIDEO_HDLR_BOX)
    b'h', b'd', b'l', b'r', // type == hdlr, ISO/IEC 14496-12 section 8.4.3.
    0x00, 0x00, 0x00, 0x00, // version + flags
    0x00, 0x00, 0x00, 0x00, // pre_defined
    b'v', b'i', b'd', b'e', // handler = vide
    0x00, 0x00, 0x00, 0x00, // reserved[0]
    0x00, 0x00, 0x00, 0x00, // reserved[1]
    0x00, 0x00, 0x00, 0x00, // reserved[2]
    0x00, // name, zero-terminated (empty)
];

/// Part of an `mvhd` (`MovieHeaderBox` version 0, ISO/IEC 14496-12 section
/// 8.2.2): everything after the duration field. Used from `append_mvhd`.
const MVHD_JUNK: &[u8] = &[
    0x00, 0x01, 0x00, 0x00, // rate
    0x01, 0x00, // volume
    0x00, 0x00, // reserved
    0x00, 0x00, 0x00, 0x00, // reserved
    0x00, 0x00, 0x00, 0x00, // reserved
    0x00, 0x01, 0x00, 0x00, // matrix[0]
    0x00, 0x00, 0x00, 0x00, // matrix[1]
    0x00, 0x00, 0x00, 0x00, // matrix[2]
    0x00, 0x00, 0x00, 0x00, // matrix[3]
    0x00, 0x01, 0x00, 0x00, // matrix[4]
    0x00, 0x00, 0x00, 0x00, // matrix[5]
    0x00, 0x00, 0x00, 0x00, // matrix[6]
    0x00, 0x00, 0x00, 0x00, // matrix[7]
    0x40, 0x00, 0x00, 0x00, // matrix[8]
    0x00, 0x00, 0x00, 0x00, // pre_defined[0]
    0x00, 0x00, 0x00, 0x00, // pre_defined[1]
    0x00, 0x00, 0x00, 0x00, // pre_defined[2]
    0x00, 0x00, 0x00, 0x00, // pre_defined[3]
    0x00, 0x00, 0x00, 0x00, // pre_defined[4]
    0x00, 0x00, 0x00, 0x00, // pre_defined[5]
];

/// Part of a `tkhd` (`TrackHeaderBox` version 0, ISO/IEC 14496-12 section
/// 8.3.2): everything between the duration and width fields. Used from
/// `append_video_tkhd`.
const TKHD_JUNK: &[u8] = &[
    0x00, 0x00, 0x00, 0x00, // reserved
    0x00, 0x00, 0x00, 0x00, // reserved
    0x00, 0x00, 0x00, 0x00, // layer + alternate_group
    0x00, 0x00, 0x00, 0x00, // volume + reserved
    0x00, 0x01, 0x00, 0x00, // matrix[0]
    0x00, 0x00, 0x00, 0x00, // matrix[1]
    0x00, 0x00, 0x00, 0x00, // matrix[2]
    0x00, 0x00, 0x00, 0x00, // matrix[3]
    0x00, 0x01, 0x00, 0x00, // matrix[4]
    0x00, 0x00, 0x00, 0x00, // matrix[5]
    0x00, 0x00, 0x00, 0x00, // matrix[6]
    0x00, 0x00, 0x00, 0x00, // matrix[7]
    0x40, 0x00, 0x00, 0x00, // matrix[8]
];

/// The start of a `minf` (`MediaInformationBox`, ISO/IEC 14496-12 section
/// 8.4.4) for a self-contained video track: the box type, then complete `vmhd`
/// and `dinf` boxes. Used from `append_video_minf`, whose `write_length!`
/// scope supplies the `minf` length.
const VIDEO_MINF_JUNK: &[u8] = &[
    b'm', b'i', b'n', b'f', // type = minf, ISO/IEC 14496-12 section 8.4.4.
    // A vmhd box; the "graphicsmode" and "opcolor" values don't have any
    // meaningful use.
    0x00, 0x00, 0x00, 0x14, // length
    b'v', b'm', b'h', b'd', // type = vmhd, ISO/IEC 14496-12 section 12.1.2.
    0x00, 0x00, 0x00, 0x01, // version + flags(1)
    0x00, 0x00, 0x00, 0x00, // graphicsmode (copy), opcolor[0]
    0x00, 0x00, 0x00, 0x00, // opcolor[1], opcolor[2]
    // A dinf box suitable for a "self-contained" .mp4 file (no URL/URN
    // references to external data).
    0x00, 0x00, 0x00, 0x24, // length
    b'd', b'i', b'n', b'f', // type = dinf, ISO/IEC 14496-12 section 8.7.1.
    0x00, 0x00, 0x00, 0x1c, // length
    b'd', b'r', b'e', b'f', // type = dref, ISO/IEC 14496-12 section 8.7.2.
    0x00, 0x00, 0x00, 0x00, // version and flags
    0x00, 0x00, 0x00, 0x01, // entry_count
    0x00, 0x00, 0x00, 0x0c, // length
    b'u', b'r', b'l', b' ', // type = url, ISO/IEC 14496-12 section 8.7.2.
    0x00, 0x00, 0x00, 0x01, // version=0, flags=self-contained
];

/// Pointers to each static bytestring.
/// The order here must match the `StaticBytestring` enum.
const STATIC_BYTESTRINGS: [&[u8]; 5] = [
    FTYP_BOX,
    VIDEO_HDLR_BOX,
    MVHD_JUNK,
    TKHD_JUNK,
    VIDEO_MINF_JUNK,
];

/// Enumeration of the static bytestrings. The order here must match the
/// `STATIC_BYTESTRINGS` array. The advantage of this enum over direct pointers
/// to the relevant strings is that it fits into a u32, allowing an
/// `Mp4FileSlice` to fit into 8 bytes.
#[derive(Copy, Clone, Debug)]
enum StaticBytestring {
    FtypBox,
    VideoHdlrBox,
    MvhdJunk,
    TkhdJunk,
    VideoMinfJunk,
}

/// The sample table pieces for one segment: `stts`, `stsz`, and `stss`, packed
/// into a single allocation.
struct SegmentIndex {
    /// &buf[.. stsz_start] is stts.
    /// &buf[stsz_start .. stss_start] is stsz.
    /// &buf[stss_start ..] is stss.
    buf: Box<[u8]>,
    stsz_start: usize,
    stss_start: usize,
}

impl SegmentIndex {
    fn stts(&self) -> &[u8] {
        &self.buf[..self.stsz_start]
    }
    fn stsz(&self) -> &[u8] {
        &self.buf[self.stsz_start..self.stss_start]
    }
    fn stss(&self) -> &[u8] {
        &self.buf[self.stss_start..]
    }
}

struct Mp4Segment {
    s: Segment,

    /// The `stts`, `stsz`, and `stss` table pieces, materialized the first
    /// time any of their bytes is requested. Sized eagerly from the segment's
    /// frame counts; a generated table disagreeing with those counts is a
    /// panic. Access only through `with_index`.
    index: OnceCell<SegmentIndex>,

    /// The mapping of this segment's sample file sub-range, established the
    /// first time any sample byte is requested. Concurrent first readers race
    /// on the cell; the winner's mapping is kept.
    sample_file: OnceCell<MmapFileSlice>,

    /// The 1-based sample number of this segment's first frame within the
    /// whole `Mp4File`.
    first_frame_num: u32,
}

impl Mp4Segment {
    fn with_index<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SegmentIndex) -> Result<R>,
    {
        f(self.index.get_or_try_init(|| self.build_index())?)
    }

    fn build_index(&self) -> Result<SegmentIndex> {
        let s = &self.s;
        let stts_len = 8 * s.frames as usize;
        let stsz_len = 4 * s.frames as usize;
        let stss_len = 4 * s.key_frames as usize;
        let mut buf = vec![0u8; stts_len + stsz_len + stss_len].into_boxed_slice();
        {
            let (stts, rest) = buf.split_at_mut(stts_len);
            let (stsz, stss) = rest.split_at_mut(stsz_len);
            let mut frame = 0;
            let mut key_frame = 0;
            s.foreach(|it| {
                BigEndian::write_u32(&mut stts[8 * frame..8 * frame + 4], 1);
                BigEndian::write_u32(
                    &mut stts[8 * frame + 4..8 * frame + 8],
                    it.duration_90k as u32,
                );
                BigEndian::write_u32(&mut stsz[4 * frame..4 * frame + 4], it.bytes as u32);
                if it.is_key() {
                    BigEndian::write_u32(
                        &mut stss[4 * key_frame..4 * key_frame + 4],
                        self.first_frame_num + (frame as u32),
                    );
                    key_frame += 1;
                }
                frame += 1;
                Ok(())
            })?;
            assert_eq!(s.frames as usize, frame);
            assert_eq!(s.key_frames as usize, key_frame);
        }
        Ok(SegmentIndex {
            buf,
            stsz_start: stts_len,
            stss_start: stts_len + stsz_len,
        })
    }

    fn sample_file(&self, dir: &SampleFileDir) -> Result<&MmapFileSlice> {
        self.sample_file.get_or_try_init(|| {
            let f = dir.open_sample_file(self.s.recording.sample_file_uuid)?;
            Ok(MmapFileSlice::new(&f, self.s.sample_file_range())?)
        })
    }
}

/// One slice of an `Mp4File`; see the module-level documentation.
#[derive(Debug)]
enum Mp4FileSlice {
    Static(StaticBytestring), // index into STATIC_BYTESTRINGS
    Buf(u32),                 // offset into m.buf
    SampleEntry,              // m.video_sample_entry.data
    Stts(u32),                // index into m.segments
    Stsz(u32),                // index into m.segments
    Co64,
    Stss(u32),            // index into m.segments
    VideoSampleData(u32), // index into m.segments
}

impl ContextWriter<Mp4File> for Mp4FileSlice {
    fn write_to(&self, f: &Mp4File, r: Range<u64>, l: u64, out: &mut dyn io::Write) -> Result<()> {
        match *self {
            Mp4FileSlice::Static(off) => {
                trace!("write static data {:?}, range {:?}", off, r);
                let s = STATIC_BYTESTRINGS[off as usize];
                out.write_all(&s[r.start as usize..r.end as usize])?;
                Ok(())
            }
            Mp4FileSlice::Buf(off) => {
                trace!("write buf data at offset {}, range {:?}", off, r);
                let off = off as usize;
                out.write_all(&f.buf[off + r.start as usize..off + r.end as usize])?;
                Ok(())
            }
            Mp4FileSlice::SampleEntry => {
                trace!("write video sample entry, range {:?}", r);
                out.write_all(&f.video_sample_entry.data[r.start as usize..r.end as usize])?;
                Ok(())
            }
            Mp4FileSlice::Stts(i) => {
                trace!("write stts for segment {}, range {:?}", i, r);
                f.write_stts(i as usize, r, out)
            }
            Mp4FileSlice::Stsz(i) => {
                trace!("write stsz for segment {}, range {:?}", i, r);
                f.write_stsz(i as usize, r, out)
            }
            Mp4FileSlice::Co64 => {
                trace!("write co64, range {:?}", r);
                f.write_co64(r, l, out)
            }
            Mp4FileSlice::Stss(i) => {
                trace!("write stss for segment {}, range {:?}", i, r);
                f.write_stss(i as usize, r, out)
            }
            Mp4FileSlice::VideoSampleData(i) => {
                trace!("write video sample data for segment {}, range {:?}", i, r);
                f.write_video_sample_data(i as usize, r, out)
            }
        }
    }
}

/// Converts from 90 kHz units since 1970-01-01 00:00:00 UTC to seconds since
/// 1904-01-01 00:00:00 UTC, as used in the movie, track, and media headers.
fn to_iso14496_timestamp(t: recording::Time) -> u32 {
    (t.unix_seconds() + 24107 * 86400) as u32
}

/// Writes a box length for everything appended in the supplied scope. The
/// length and type fields of the container live in the header buffer, so the
/// length can be patched in place after the children are laid out; scopes nest
/// strictly LIFO. Used only within `FileLayout`.
macro_rules! write_length {
    ($_self:ident, $b:block) => {{
        let len_pos = $_self.body.buf.len();
        let len_start = $_self.body.slices.len() + $_self.body.buf.len() as u64
            - $_self.body.unflushed_buf_pos as u64;
        $_self.body.append_u32(0); // placeholder
        {
            $b;
        }
        let len_end = $_self.body.slices.len() + $_self.body.buf.len() as u64
            - $_self.body.unflushed_buf_pos as u64;
        BigEndian::write_u32(
            &mut $_self.body.buf[len_pos..len_pos + 4],
            (len_end - len_start) as u32,
        );
    }};
}

/// Accumulates segments and settings, then builds an [`Mp4File`].
pub struct Mp4FileBuilder {
    /// Segments of video: one per recording, in playback order.
    segments: Vec<Mp4Segment>,
    video_sample_entry: Option<VideoSampleEntry>,
    sample_file_dir: Option<Arc<SampleFileDir>>,
}

impl Mp4FileBuilder {
    pub fn new() -> Self {
        Mp4FileBuilder {
            segments: Vec::new(),
            video_sample_entry: None,
            sample_file_dir: None,
        }
    }

    pub fn reserve(&mut self, additional: usize) {
        self.segments.reserve(additional);
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Appends a segment covering `rel_range_90k` (relative to the recording
    /// start) of `recording`. The actual range served will be widened to
    /// enclosing GOP and frame boundaries; see [`Segment::new`].
    pub fn append(&mut self, recording: Recording, rel_range_90k: Range<i32>) -> Result<()> {
        self.segments.push(Mp4Segment {
            s: Segment::new(recording, rel_range_90k)?,
            index: OnceCell::new(),
            sample_file: OnceCell::new(),
            first_frame_num: 0,
        });
        Ok(())
    }

    /// Sets the one video sample entry every appended recording must share.
    pub fn set_video_sample_entry(&mut self, entry: VideoSampleEntry) {
        self.video_sample_entry = Some(entry);
    }

    /// Sets the directory from which sample files will be served. The handle
    /// is borrowed for the lifetime of the built file; its files' lifecycles
    /// are not managed here.
    pub fn set_sample_file_dir(&mut self, dir: Arc<SampleFileDir>) {
        self.sample_file_dir = Some(dir);
    }

    /// Builds the `Mp4File`, consuming the builder.
    ///
    /// Scans each segment's sample index, assigns 1-based sample numbers
    /// across segments, lays out the box tree, and computes the etag. The
    /// result is immutable; any number of threads may serve ranges from it
    /// concurrently.
    pub fn build(mut self) -> Result<Mp4File> {
        let video_sample_entry = self.video_sample_entry.take().ok_or(Error::NoSampleEntry)?;
        let dir = self.sample_file_dir.take().ok_or(Error::NoSampleFileDir)?;
        if self.segments.is_empty() {
            return Err(Error::EmptySegments);
        }

        let mut etag = Sha1::new();
        etag.update(FORMAT_VERSION);
        let mut duration_90k: u32 = 0;
        let mut max_end = recording::Time(i64::MIN);
        let mut next_frame_num: u32 = 1;
        for m in &mut self.segments {
            let got = m.s.recording.video_sample_entry_id;
            if got != video_sample_entry.id {
                return Err(Error::InconsistentSampleEntry {
                    expected: video_sample_entry.id,
                    got,
                });
            }
            m.s.init()?;
            m.first_frame_num = next_frame_num;
            next_frame_num += m.s.frames as u32;

            let actual = m.s.actual_time_90k();
            duration_90k += (actual.end - actual.start) as u32;
            max_end = cmp::max(
                max_end,
                m.s.recording.start + recording::Duration(i64::from(actual.end)),
            );

            // The etag is content-addressed: the recording's own hash plus the
            // byte range served from it. Identical inputs must yield identical
            // bytes, and do, for a fixed FORMAT_VERSION.
            let r = m.s.sample_file_range();
            let mut pos = [0u8; 16];
            BigEndian::write_u64(&mut pos[0..8], r.start as u64);
            BigEndian::write_u64(&mut pos[8..16], r.end as u64);
            etag.update(pos);
            etag.update(m.s.recording.sample_file_sha1);
        }
        let creation_ts = to_iso14496_timestamp(max_end);

        let mut l = FileLayout {
            segments: self.segments,
            video_sample_entry,
            duration_90k,
            body: BodyState {
                slices: Slices::new(),
                buf: Vec::new(),
                unflushed_buf_pos: 0,
            },
        };
        let est_slices = 16 + 4 * l.segments.len();
        const EST_BUF_LEN: usize = 2048;
        l.body.slices.reserve(est_slices);
        l.body.buf.reserve(EST_BUF_LEN);

        l.body.append_static(StaticBytestring::FtypBox);
        l.append_moov(creation_ts);

        // Write the mdat header. Use the large format to support files over
        // 2^32-1 bytes long. Write zeroes for the length as a placeholder;
        // fill it in after it's known. It'd be nice to use the until-EOF form,
        // but not all players support it.
        l.body
            .buf
            .extend_from_slice(b"\x00\x00\x00\x01mdat\x00\x00\x00\x00\x00\x00\x00\x00");
        let mdat_len_pos = l.body.buf.len() - 8;
        l.body.flush_buf();
        let initial_sample_byte_pos = l.body.slices.len();
        for (i, m) in l.segments.iter().enumerate() {
            let r = m.s.sample_file_range();
            l.body
                .slices
                .append((r.end - r.start) as u64, Mp4FileSlice::VideoSampleData(i as u32));
        }
        // Fill in the length left as a placeholder above. The 16 is the
        // length of the mdat header itself.
        BigEndian::write_u64(
            &mut l.body.buf[mdat_len_pos..mdat_len_pos + 8],
            16 + l.body.slices.len() - initial_sample_byte_pos,
        );

        if est_slices < l.body.slices.num() {
            warn!(
                "estimated {} slices; actually were {}",
                est_slices,
                l.body.slices.num()
            );
        }
        if EST_BUF_LEN < l.body.buf.len() {
            warn!(
                "estimated {} buf bytes; actually were {}",
                EST_BUF_LEN,
                l.body.buf.len()
            );
        }
        debug!("slices: {:?}", l.body.slices);
        Ok(Mp4File {
            dir,
            segments: l.segments,
            slices: l.body.slices,
            buf: l.body.buf,
            video_sample_entry: l.video_sample_entry,
            initial_sample_byte_pos,
            last_modified: max_end.unix_seconds(),
            etag: format!("\"{}\"", hex::encode(etag.finalize())),
        })
    }
}

impl Default for Mp4FileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The in-progress layout of the box tree. Split from `Mp4FileBuilder` so the
/// append methods can borrow `segments` and `body` independently, and so the
/// video sample entry is a plain field by the time it's needed.
struct FileLayout {
    segments: Vec<Mp4Segment>,
    video_sample_entry: VideoSampleEntry,
    duration_90k: u32,
    body: BodyState,
}

/// The portion of the layout mutated by every append operation: the slice
/// table and the header buffer. `buf[unflushed_buf_pos..]` holds bytes that
/// must be appended to `slices` before any non-`Buf` slice; see `flush_buf`.
struct BodyState {
    slices: Slices<Mp4FileSlice, Mp4File>,
    buf: Vec<u8>,
    unflushed_buf_pos: usize,
}

impl BodyState {
    fn append_u32(&mut self, v: u32) {
        self.buf
            .write_u32::<BigEndian>(v)
            .expect("Vec write can't fail");
    }

    /// Flushes the unflushed bytes of `buf` into a `Buf` slice.
    fn flush_buf(&mut self) {
        let len = self.buf.len();
        if self.unflushed_buf_pos < len {
            self.slices.append(
                (len - self.unflushed_buf_pos) as u64,
                Mp4FileSlice::Buf(self.unflushed_buf_pos as u32),
            );
            self.unflushed_buf_pos = len;
        }
    }

    fn append_static(&mut self, which: StaticBytestring) {
        self.flush_buf();
        let s = STATIC_BYTESTRINGS[which as usize];
        self.slices.append(s.len() as u64, Mp4FileSlice::Static(which));
    }
}

impl FileLayout {
    /// MovieBox, ISO/IEC 14496-12 section 8.2.1.
    fn append_moov(&mut self, creation_ts: u32) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"moov");
            self.append_mvhd(creation_ts);
            self.append_video_trak(creation_ts);
        });
    }

    /// MovieHeaderBox version 0, ISO/IEC 14496-12 section 8.2.2.
    fn append_mvhd(&mut self, creation_ts: u32) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"mvhd\x00\x00\x00\x00");
            self.body.append_u32(creation_ts);
            self.body.append_u32(creation_ts);
            self.body.append_u32(TIME_UNITS_PER_SEC as u32);
            self.body.append_u32(self.duration_90k);
            self.body.append_static(StaticBytestring::MvhdJunk);
            self.body.append_u32(2); // next_track_id
        });
    }

    /// TrackBox, ISO/IEC 14496-12 section 8.3.1.
    fn append_video_trak(&mut self, creation_ts: u32) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"trak");
            self.append_video_tkhd(creation_ts);
            self.append_video_mdia(creation_ts);
        });
    }

    /// TrackHeaderBox, ISO/IEC 14496-12 section 8.3.2.
    fn append_video_tkhd(&mut self, creation_ts: u32) {
        write_length!(self, {
            // flags 7: track_enabled | track_in_movie | track_in_preview
            self.body.buf.extend_from_slice(b"tkhd\x00\x00\x00\x07");
            self.body.append_u32(creation_ts);
            self.body.append_u32(creation_ts);
            self.body.append_u32(1); // track_id
            self.body.append_u32(0); // reserved
            self.body.append_u32(self.duration_90k);
            self.body.append_static(StaticBytestring::TkhdJunk);
            // width and height are 16.16 fixed-point.
            self.body
                .append_u32(u32::from(self.video_sample_entry.width) << 16);
            self.body
                .append_u32(u32::from(self.video_sample_entry.height) << 16);
        });
    }

    /// MediaBox, ISO/IEC 14496-12 section 8.4.1.
    fn append_video_mdia(&mut self, creation_ts: u32) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"mdia");
            self.append_mdhd(creation_ts);
            self.body.append_static(StaticBytestring::VideoHdlrBox);
            self.append_video_minf();
        });
    }

    /// MediaHeaderBox, ISO/IEC 14496-12 section 8.4.2.
    fn append_mdhd(&mut self, creation_ts: u32) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"mdhd\x00\x00\x00\x00");
            self.body.append_u32(creation_ts);
            self.body.append_u32(creation_ts);
            self.body.append_u32(TIME_UNITS_PER_SEC as u32);
            self.body.append_u32(self.duration_90k);
            self.body.append_u32(0x55c4_0000); // language=und + pre_defined
        });
    }

    /// MediaInformationBox, ISO/IEC 14496-12 section 8.4.4.
    fn append_video_minf(&mut self) {
        write_length!(self, {
            self.body.append_static(StaticBytestring::VideoMinfJunk);
            self.append_video_stbl();
        });
    }

    /// SampleTableBox, ISO/IEC 14496-12 section 8.5.1.
    fn append_video_stbl(&mut self) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"stbl");
            self.append_video_stsd();
            self.append_video_stts();
            self.append_video_stsc();
            self.append_video_stsz();
            self.append_video_co64();
            self.append_video_stss();
        });
    }

    /// SampleDescriptionBox, ISO/IEC 14496-12 section 8.5.2.
    fn append_video_stsd(&mut self) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"stsd\x00\x00\x00\x00");
            self.body.append_u32(1); // entry_count
            self.body.flush_buf();
            self.body.slices.append(
                self.video_sample_entry.data.len() as u64,
                Mp4FileSlice::SampleEntry,
            );
        });
    }

    /// TimeToSampleBox, ISO/IEC 14496-12 section 8.6.1.2.
    /// One entry per frame; durations are not run-length compressed.
    fn append_video_stts(&mut self) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"stts\x00\x00\x00\x00");
            let mut entry_count = 0;
            for m in &self.segments {
                entry_count += m.s.frames as u32;
            }
            self.body.append_u32(entry_count);
            self.body.flush_buf();
            for (i, m) in self.segments.iter().enumerate() {
                self.body
                    .slices
                    .append(8 * m.s.frames as u64, Mp4FileSlice::Stts(i as u32));
            }
        });
    }

    /// SampleToChunkBox, ISO/IEC 14496-12 section 8.7.4.
    /// Each segment is one chunk of the concatenated mdat.
    fn append_video_stsc(&mut self) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"stsc\x00\x00\x00\x00");
            self.body.append_u32(self.segments.len() as u32);
            for (i, m) in self.segments.iter().enumerate() {
                self.body.append_u32((i + 1) as u32); // first_chunk
                self.body.append_u32(m.s.frames as u32); // samples_per_chunk
                self.body.append_u32(1); // sample_description_index
            }
        });
    }

    /// SampleSizeBox, ISO/IEC 14496-12 section 8.7.3.
    fn append_video_stsz(&mut self) {
        write_length!(self, {
            self.body
                .buf
                .extend_from_slice(b"stsz\x00\x00\x00\x00\x00\x00\x00\x00");
            let mut entry_count = 0;
            for m in &self.segments {
                entry_count += m.s.frames as u32;
            }
            self.body.append_u32(entry_count);
            self.body.flush_buf();
            for (i, m) in self.segments.iter().enumerate() {
                self.body
                    .slices
                    .append(4 * m.s.frames as u64, Mp4FileSlice::Stsz(i as u32));
            }
        });
    }

    /// ChunkLargeOffsetBox, ISO/IEC 14496-12 section 8.7.5.
    fn append_video_co64(&mut self) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"co64\x00\x00\x00\x00");
            self.body.append_u32(self.segments.len() as u32);
            self.body.flush_buf();
            self.body
                .slices
                .append(8 * self.segments.len() as u64, Mp4FileSlice::Co64);
        });
    }

    /// SyncSampleBox, ISO/IEC 14496-12 section 8.6.2.
    fn append_video_stss(&mut self) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"stss\x00\x00\x00\x00");
            let mut entry_count = 0;
            for m in &self.segments {
                entry_count += m.s.key_frames as u32;
            }
            self.body.append_u32(entry_count);
            self.body.flush_buf();
            for (i, m) in self.segments.iter().enumerate() {
                self.body
                    .slices
                    .append(4 * m.s.key_frames as u64, Mp4FileSlice::Stss(i as u32));
            }
        });
    }
}

/// A virtual `.mp4` file. Immutable, so concurrent readers share it by
/// reference; the sample table caches and sample file mappings populate under
/// one-time initializers.
pub struct Mp4File {
    dir: Arc<SampleFileDir>,
    segments: Vec<Mp4Segment>,
    slices: Slices<Mp4FileSlice, Mp4File>,

    /// Box headers and other computed fields, referenced by offset from `Buf`
    /// slices. Frozen at construction; never reallocated afterward.
    buf: Vec<u8>,
    video_sample_entry: VideoSampleEntry,
    initial_sample_byte_pos: u64,
    last_modified: i64,
    etag: String,
}

impl Mp4File {
    fn write_stts(&self, i: usize, r: Range<u64>, out: &mut dyn io::Write) -> Result<()> {
        self.segments[i].with_index(|idx| {
            out.write_all(&idx.stts()[r.start as usize..r.end as usize])?;
            Ok(())
        })
    }

    fn write_stsz(&self, i: usize, r: Range<u64>, out: &mut dyn io::Write) -> Result<()> {
        self.segments[i].with_index(|idx| {
            out.write_all(&idx.stsz()[r.start as usize..r.end as usize])?;
            Ok(())
        })
    }

    fn write_stss(&self, i: usize, r: Range<u64>, out: &mut dyn io::Write) -> Result<()> {
        self.segments[i].with_index(|idx| {
            out.write_all(&idx.stss()[r.start as usize..r.end as usize])?;
            Ok(())
        })
    }

    fn write_co64(&self, r: Range<u64>, l: u64, out: &mut dyn io::Write) -> Result<()> {
        clip_to_range(r, l, out, |w| {
            let mut pos = self.initial_sample_byte_pos;
            for m in &self.segments {
                w.write_u64::<BigEndian>(pos)?;
                let r = m.s.sample_file_range();
                pos += (r.end - r.start) as u64;
            }
            Ok(())
        })
    }

    fn write_video_sample_data(&self, i: usize, r: Range<u64>, out: &mut dyn io::Write) -> Result<()> {
        let f = self.segments[i].sample_file(&self.dir)?;
        f.write_to(r, out)?;
        Ok(())
    }
}

impl VirtualFile for Mp4File {
    fn len(&self) -> u64 {
        self.slices.len()
    }

    fn write_range(&self, range: Range<u64>, out: &mut dyn io::Write) -> Result<()> {
        self.slices.write_to(self, range, out)
    }

    fn etag(&self) -> &str {
        &self.etag
    }

    fn last_modified(&self) -> i64 {
        self.last_modified
    }

    fn mime_type(&self) -> &'static str {
        "video/mp4"
    }
}
