//! PRD codec: the fixed-layout little-endian binary container described
//! in the data model, plus the size calculators the disk worker uses to
//! choose per-stack frame counts.
//!
//! Grounded bit-exactly on `backend/PrdFileFormat.h` and
//! `backend/PrdFileUtils.cpp` from the original implementation, since the
//! distilled spec leaves the trajectory header's exact field layout
//! unspecified. Encoding is done by hand with explicit little-endian byte
//! arithmetic rather than a generic derive, matching the original's
//! "never change this layout" framing -- a fixed binary format is exactly
//! the case a derive macro would happily version out from under you.

use std::io::{Read, Seek, SeekFrom, Write};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{AcqError, AcqResult};
use crate::frame::{AcqCfg, Frame, FrameInfo, Trajectory, TrajectoryPoint};

/// Exposure timestamps are expressed in this unit, per `PrdHeader::exposure_resolution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureResolution {
    /// Microseconds (resolution value `1`).
    Micros,
    /// Milliseconds (resolution value `1000`).
    Millis,
    /// Seconds (resolution value `1_000_000`).
    Seconds,
}

impl ExposureResolution {
    fn as_u32(self) -> u32 {
        match self {
            ExposureResolution::Micros => 1,
            ExposureResolution::Millis => 1_000,
            ExposureResolution::Seconds => 1_000_000,
        }
    }

    /// Maps a raw header/setting value to a resolution; rejects anything
    /// else so an invalid value can never silently reach the file format.
    pub fn from_u32(v: u32) -> AcqResult<Self> {
        match v {
            1 => Ok(ExposureResolution::Micros),
            1_000 => Ok(ExposureResolution::Millis),
            1_000_000 => Ok(ExposureResolution::Seconds),
            other => Err(AcqError::ConfigInvalid(format!(
                "unknown exposure resolution {other}"
            ))),
        }
    }
}

const SIGNATURE: [u8; 4] = *b"PRD\0";
const HEADER_FLAG_HAS_METADATA: u8 = 0b01;
const HEADER_FLAG_FRAME_SIZE_VARIES: u8 = 0b10;
const EXT_FLAG_HAS_TRAJECTORIES: u32 = 0b01;

/// The region a frame was acquired over: `(s1, s2, sbin, p1, p2, pbin)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    /// Serial (x) start.
    pub s1: u16,
    /// Serial (x) end, inclusive.
    pub s2: u16,
    /// Serial binning factor.
    pub sbin: u16,
    /// Parallel (y) start.
    pub p1: u16,
    /// Parallel (y) end, inclusive.
    pub p2: u16,
    /// Parallel binning factor.
    pub pbin: u16,
}

impl Region {
    /// Implied output width: `(s2 - s1 + 1) / sbin`.
    #[must_use]
    pub fn width(&self) -> u32 {
        (u32::from(self.s2) - u32::from(self.s1) + 1) / u32::from(self.sbin.max(1))
    }

    /// Implied output height: `(p2 - p1 + 1) / pbin`.
    #[must_use]
    pub fn height(&self) -> u32 {
        (u32::from(self.p2) - u32::from(self.p1) + 1) / u32::from(self.pbin.max(1))
    }
}

/// The fixed 48-byte PRD file header. Layout must never change.
#[derive(Debug, Clone, Copy)]
pub struct PrdHeader {
    /// Container format version, e.g. `0x0005` for "0.5".
    pub version: u16,
    /// Bits per pixel (always 16 for this engine, per the Non-goals).
    pub bit_depth: u16,
    /// Number of frames the file claims to hold; corrected by `close()`
    /// if fewer were actually written.
    pub frame_count: u32,
    /// The acquired region.
    pub region: Region,
    /// Total bytes of per-frame metadata that follow each frame's pixels
    /// in the stream (fixed part plus any trajectories block).
    pub size_of_meta_struct: u32,
    /// Unit that `PrdMetaData::exposure_time` is expressed in.
    pub exposure_resolution: ExposureResolution,
    /// Vendor color-filter-array mask, or 0 for monochrome.
    pub color_mask: u8,
    /// Whether embedded per-frame pixel metadata is present.
    pub has_metadata: bool,
    /// Whether frame byte size can vary across the file (enables the
    /// dynamic-metadata region).
    pub frame_size_varies: bool,
    /// Exact size in bytes of one frame's raw pixel payload.
    pub frame_size: u32,
}

impl PrdHeader {
    /// The packed flags byte (`has_metadata`, `frame_size_varies`), as
    /// stored on disk.
    #[must_use]
    pub fn flags(&self) -> u8 {
        let mut f = 0u8;
        if self.has_metadata {
            f |= HEADER_FLAG_HAS_METADATA;
        }
        if self.frame_size_varies {
            f |= HEADER_FLAG_FRAME_SIZE_VARIES;
        }
        f
    }

    fn to_bytes(self) -> [u8; 48] {
        let mut buf = BytesMut::with_capacity(48);
        buf.put_slice(&SIGNATURE);
        buf.put_u16_le(self.version);
        buf.put_u16_le(self.bit_depth);
        buf.put_u32_le(self.frame_count);
        buf.put_u16_le(self.region.s1);
        buf.put_u16_le(self.region.s2);
        buf.put_u16_le(self.region.sbin);
        buf.put_u16_le(self.region.p1);
        buf.put_u16_le(self.region.p2);
        buf.put_u16_le(self.region.pbin);
        buf.put_u32_le(self.size_of_meta_struct);
        buf.put_u32_le(self.exposure_resolution.as_u32());
        buf.put_u8(self.color_mask);
        buf.put_u8(self.flags());
        buf.put_u32_le(self.frame_size);
        buf.put_bytes(0, 10);
        let mut out = [0u8; 48];
        out.copy_from_slice(&buf);
        out
    }

    fn from_bytes(raw: &[u8; 48]) -> AcqResult<Self> {
        let mut buf = &raw[..];
        let mut sig = [0u8; 4];
        buf.copy_to_slice(&mut sig);
        if sig != SIGNATURE {
            return Err(AcqError::ConfigInvalid("bad PRD signature".to_string()));
        }
        let version = buf.get_u16_le();
        let bit_depth = buf.get_u16_le();
        let frame_count = buf.get_u32_le();
        let region = Region {
            s1: buf.get_u16_le(),
            s2: buf.get_u16_le(),
            sbin: buf.get_u16_le(),
            p1: buf.get_u16_le(),
            p2: buf.get_u16_le(),
            pbin: buf.get_u16_le(),
        };
        let size_of_meta_struct = buf.get_u32_le();
        let exposure_resolution = ExposureResolution::from_u32(buf.get_u32_le())?;
        let color_mask = buf.get_u8();
        let flags = buf.get_u8();
        let frame_size = buf.get_u32_le();
        Ok(Self {
            version,
            bit_depth,
            frame_count,
            region,
            size_of_meta_struct,
            exposure_resolution,
            color_mask,
            has_metadata: flags & HEADER_FLAG_HAS_METADATA != 0,
            frame_size_varies: flags & HEADER_FLAG_FRAME_SIZE_VARIES != 0,
            frame_size,
        })
    }
}

/// Fixed-capacity trajectory block sizing; zero-sized when trajectories
/// are never written to this file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrajectoryLayout {
    /// Maximum trajectories recorded per frame.
    pub max_trajectories: u32,
    /// Maximum points recorded per trajectory.
    pub max_points: u32,
}

impl TrajectoryLayout {
    /// Bytes occupied by the trajectories block for one frame (header +
    /// all fixed trajectory/point slots, used or not).
    #[must_use]
    pub fn block_bytes(self) -> u32 {
        if self.max_trajectories == 0 {
            return 0;
        }
        12 + self.max_trajectories * (14 + self.max_points * 5)
    }
}

/// Per-frame metadata, 48 bytes fixed.
#[derive(Debug, Clone, Copy)]
pub struct PrdMetaData {
    /// 1-based, unique frame number.
    pub frame_number: u32,
    /// Readout time in microseconds.
    pub readout_time: u32,
    /// Exposure time in the header's resolution unit.
    pub exposure_time: u32,
    /// Begin-of-frame timestamp, microseconds since acquisition start.
    pub timestamp_bof: u64,
    /// End-of-frame timestamp, microseconds since acquisition start.
    pub timestamp_eof: u64,
    /// Number of ROIs present in this frame.
    pub roi_count: u16,
    /// Whether a trajectories block follows this metadata.
    pub has_trajectories: bool,
    /// Size in bytes of the fixed extended-metadata region (the
    /// trajectories block, when present).
    pub ext_md_size: u32,
    /// Size in bytes of the variable-length extended metadata that
    /// follows, when `frame_size_varies` is set.
    pub ext_dyn_md_size: u32,
}

impl PrdMetaData {
    fn to_bytes(self) -> [u8; 48] {
        let mut buf = BytesMut::with_capacity(48);
        buf.put_u32_le(self.frame_number);
        buf.put_u32_le(self.readout_time);
        buf.put_u32_le(self.exposure_time);
        buf.put_u32_le(self.timestamp_bof as u32);
        buf.put_u32_le((self.timestamp_bof >> 32) as u32);
        buf.put_u32_le(self.timestamp_eof as u32);
        buf.put_u32_le((self.timestamp_eof >> 32) as u32);
        buf.put_u16_le(self.roi_count);
        let ext_flags = if self.has_trajectories {
            EXT_FLAG_HAS_TRAJECTORIES
        } else {
            0
        };
        buf.put_u32_le(ext_flags);
        buf.put_u32_le(self.ext_md_size);
        buf.put_u32_le(self.ext_dyn_md_size);
        buf.put_bytes(0, 6);
        let mut out = [0u8; 48];
        out.copy_from_slice(&buf);
        out
    }

    fn from_bytes(raw: &[u8; 48]) -> Self {
        let mut buf = &raw[..];
        let frame_number = buf.get_u32_le();
        let readout_time = buf.get_u32_le();
        let exposure_time = buf.get_u32_le();
        let bof_lo = u64::from(buf.get_u32_le());
        let bof_hi = u64::from(buf.get_u32_le());
        let eof_lo = u64::from(buf.get_u32_le());
        let eof_hi = u64::from(buf.get_u32_le());
        let roi_count = buf.get_u16_le();
        let ext_flags = buf.get_u32_le();
        let ext_md_size = buf.get_u32_le();
        let ext_dyn_md_size = buf.get_u32_le();
        Self {
            frame_number,
            readout_time,
            exposure_time,
            timestamp_bof: (bof_hi << 32) | bof_lo,
            timestamp_eof: (eof_hi << 32) | eof_lo,
            roi_count,
            has_trajectories: ext_flags & EXT_FLAG_HAS_TRAJECTORIES != 0,
            ext_md_size,
            ext_dyn_md_size,
        }
    }
}

fn encode_trajectories(layout: TrajectoryLayout, trajectories: &[Trajectory]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(layout.block_bytes() as usize);
    let trajectory_count = trajectories.len().min(layout.max_trajectories as usize) as u32;
    buf.put_u32_le(layout.max_trajectories);
    buf.put_u32_le(layout.max_points);
    buf.put_u32_le(trajectory_count);

    for i in 0..layout.max_trajectories as usize {
        if let Some(t) = trajectories.get(i) {
            let point_count = t.points.len().min(layout.max_points as usize) as u32;
            buf.put_u16_le(t.roi_nr);
            buf.put_u32_le(t.particle_id);
            buf.put_u32_le(t.lifetime);
            buf.put_u32_le(point_count);
        } else {
            buf.put_bytes(0, 14);
        }
    }
    for i in 0..layout.max_trajectories as usize {
        let points: &[TrajectoryPoint] = trajectories.get(i).map_or(&[], |t| &t.points);
        for p in 0..layout.max_points as usize {
            if let Some(point) = points.get(p) {
                buf.put_u8(u8::from(point.valid));
                buf.put_u16_le(point.x);
                buf.put_u16_le(point.y);
            } else {
                buf.put_bytes(0, 5);
            }
        }
    }
    buf.to_vec()
}

fn decode_trajectories(raw: &[u8]) -> AcqResult<Vec<Trajectory>> {
    if raw.len() < 12 {
        return Err(AcqError::MetadataCorrupt {
            frame_nr: 0,
            reason: "trajectories block shorter than its own header".to_string(),
        });
    }
    let mut buf = raw;
    let max_trajectories = buf.get_u32_le();
    let max_points = buf.get_u32_le();
    let trajectory_count = buf.get_u32_le();

    let mut headers = Vec::with_capacity(max_trajectories as usize);
    for _ in 0..max_trajectories {
        let roi_nr = buf.get_u16_le();
        let particle_id = buf.get_u32_le();
        let lifetime = buf.get_u32_le();
        let point_count = buf.get_u32_le();
        headers.push((roi_nr, particle_id, lifetime, point_count));
    }

    let mut trajectories = Vec::with_capacity(trajectory_count as usize);
    for (idx, (roi_nr, particle_id, lifetime, point_count)) in headers.into_iter().enumerate() {
        let mut points = Vec::with_capacity(max_points as usize);
        for p in 0..max_points {
            let valid = buf.get_u8() != 0;
            let x = buf.get_u16_le();
            let y = buf.get_u16_le();
            if (idx as u32) < trajectory_count && p < point_count {
                points.push(TrajectoryPoint { valid, x, y });
            }
        }
        if (idx as u32) < trajectory_count {
            trajectories.push(Trajectory {
                roi_nr,
                particle_id,
                lifetime,
                points,
            });
        }
    }
    Ok(trajectories)
}

/// `max(0, min(u32::MAX, (max_bytes - 48) / (size_of_meta_struct + raw_size)))`.
#[must_use]
pub fn frame_count_that_fits_in(header: &PrdHeader, max_bytes: u64) -> u32 {
    let per_frame = u64::from(header.size_of_meta_struct) + u64::from(header.frame_size);
    if per_frame == 0 || max_bytes <= 48 {
        return 0;
    }
    let count = (max_bytes - 48) / per_frame;
    count.min(u64::from(u32::MAX)) as u32
}

/// Sequential PRD writer over any `Write + Seek` sink.
pub struct PrdWriter<W: Write + Seek> {
    sink: W,
    header: PrdHeader,
    layout: TrajectoryLayout,
    header_written: bool,
    frames_written: u32,
}

impl<W: Write + Seek> PrdWriter<W> {
    /// Builds a writer for `header`; `layout` describes the trajectories
    /// block sizing and must be reflected in `header.size_of_meta_struct`.
    #[must_use]
    pub fn new(sink: W, header: PrdHeader, layout: TrajectoryLayout) -> Self {
        Self {
            sink,
            header,
            layout,
            header_written: false,
            frames_written: 0,
        }
    }

    /// Writes one frame: header (if first), fixed metadata (+ trajectories
    /// block if this frame has any), optional dynamic metadata, then raw
    /// pixels.
    pub fn write_frame(
        &mut self,
        meta: PrdMetaData,
        trajectories: Option<&[Trajectory]>,
        ext_dyn: Option<&[u8]>,
        pixels: &[u8],
    ) -> AcqResult<()> {
        if pixels.len() != self.header.frame_size as usize {
            return Err(AcqError::ConfigInvalid(format!(
                "pixel payload {} bytes != frame_size {}",
                pixels.len(),
                self.header.frame_size
            )));
        }

        if !self.header_written {
            self.write_raw(&self.header.to_bytes())?;
            self.header_written = true;
        }

        self.write_raw(&meta.to_bytes())?;

        if meta.has_trajectories {
            let trajectories = trajectories.unwrap_or(&[]);
            let block = encode_trajectories(self.layout, trajectories);
            self.write_raw(&block)?;
        }

        if self.header.frame_size_varies {
            if let Some(dyn_bytes) = ext_dyn {
                self.write_raw(dyn_bytes)?;
            }
        }

        self.write_raw(pixels)?;
        self.frames_written += 1;
        Ok(())
    }

    fn write_raw(&mut self, bytes: &[u8]) -> AcqResult<()> {
        self.sink
            .write_all(bytes)
            .map_err(|source| AcqError::FileIo {
                path: std::path::PathBuf::new(),
                source,
            })
    }

    /// If fewer frames were written than `header.frame_count` claimed,
    /// seeks back and rewrites the header with the observed count.
    pub fn close(mut self) -> AcqResult<u32> {
        if self.frames_written != self.header.frame_count {
            self.header.frame_count = self.frames_written;
            self.sink
                .seek(SeekFrom::Start(0))
                .map_err(|source| AcqError::FileIo {
                    path: std::path::PathBuf::new(),
                    source,
                })?;
            self.write_raw(&self.header.to_bytes())?;
        }
        Ok(self.frames_written)
    }
}

/// A decoded PRD frame: the reconstructed [`Frame`] plus its raw metadata.
pub struct DecodedFrame {
    /// The reconstructed frame, with info and (if present) trajectories set.
    pub frame: Frame,
    /// The raw per-frame metadata as read from the file.
    pub meta: PrdMetaData,
}

/// Sequential PRD reader over any `Read + Seek` source.
pub struct PrdReader<R: Read + Seek> {
    source: R,
    header: PrdHeader,
    frames_read: u32,
}

impl<R: Read + Seek> PrdReader<R> {
    /// Reads and validates the 48-byte header.
    pub fn open(mut source: R) -> AcqResult<Self> {
        let mut raw = [0u8; 48];
        source
            .read_exact(&mut raw)
            .map_err(|source| AcqError::FileIo {
                path: std::path::PathBuf::new(),
                source,
            })?;
        let header = PrdHeader::from_bytes(&raw)?;
        Ok(Self {
            source,
            header,
            frames_read: 0,
        })
    }

    /// The file's header as read.
    #[must_use]
    pub fn header(&self) -> &PrdHeader {
        &self.header
    }

    /// Reads the next frame, reconstructing it into a [`Frame`] of
    /// `AcqCfg(frame_size, roi_count, has_metadata)`.
    pub fn read_frame(&mut self) -> AcqResult<Option<DecodedFrame>> {
        if self.frames_read >= self.header.frame_count {
            return Ok(None);
        }
        let mut meta_raw = [0u8; 48];
        if read_exact_or_eof(&mut self.source, &mut meta_raw)? {
            return Ok(None);
        }
        let meta = PrdMetaData::from_bytes(&meta_raw);

        let trajectories = if meta.has_trajectories {
            let mut block = vec![0u8; meta.ext_md_size as usize];
            self.source
                .read_exact(&mut block)
                .map_err(|source| AcqError::FileIo {
                    path: std::path::PathBuf::new(),
                    source,
                })?;
            Some(decode_trajectories(&block)?)
        } else {
            None
        };

        if self.header.frame_size_varies && meta.ext_dyn_md_size > 0 {
            let mut skip = vec![0u8; meta.ext_dyn_md_size as usize];
            self.source
                .read_exact(&mut skip)
                .map_err(|source| AcqError::FileIo {
                    path: std::path::PathBuf::new(),
                    source,
                })?;
        }

        let mut pixels = vec![0u8; self.header.frame_size as usize];
        self.source
            .read_exact(&mut pixels)
            .map_err(|source| AcqError::FileIo {
                path: std::path::PathBuf::new(),
                source,
            })?;

        let cfg = AcqCfg {
            frame_bytes: self.header.frame_size,
            roi_count: meta.roi_count,
            has_metadata: self.header.has_metadata,
        };
        let mut frame = Frame::new(cfg, true);
        // SAFETY: `pixels` is a local, fully-initialized buffer exactly
        // `cfg.frame_bytes` long; it outlives the `copy_data` call below.
        unsafe {
            frame.set_data_pointer(
                pixels.as_ptr(),
                pixels.len(),
                FrameInfo {
                    frame_nr: meta.frame_number,
                    timestamp_bof: meta.timestamp_bof,
                    timestamp_eof: meta.timestamp_eof,
                },
            );
        }
        frame.copy_data()?;
        if let Some(t) = trajectories {
            frame.set_trajectories(t);
        }

        self.frames_read += 1;
        Ok(Some(DecodedFrame { frame, meta }))
    }
}

fn read_exact_or_eof<R: Read>(source: &mut R, buf: &mut [u8]) -> AcqResult<bool> {
    let mut read = 0;
    while read < buf.len() {
        match source.read(&mut buf[read..]) {
            Ok(0) => return Ok(true),
            Ok(n) => read += n,
            Err(e) => {
                return Err(AcqError::FileIo {
                    path: std::path::PathBuf::new(),
                    source: e,
                })
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn test_header(frame_count: u32, frame_size: u32, meta_size: u32) -> PrdHeader {
        PrdHeader {
            version: 0x0005,
            bit_depth: 16,
            frame_count,
            region: Region {
                s1: 0,
                s2: 7,
                sbin: 1,
                p1: 0,
                p2: 7,
                pbin: 1,
            },
            size_of_meta_struct: meta_size,
            exposure_resolution: ExposureResolution::Micros,
            color_mask: 0,
            has_metadata: false,
            frame_size_varies: false,
            frame_size,
        }
    }

    #[test]
    fn round_trip_simple_frames() {
        let header = test_header(3, 8, 48);
        let cursor = Cursor::new(Vec::new());
        let mut writer = PrdWriter::new(cursor, header, TrajectoryLayout::default());
        for i in 1..=3u32 {
            let meta = PrdMetaData {
                frame_number: i,
                readout_time: 100,
                exposure_time: 5000,
                timestamp_bof: u64::from(i) * 1000,
                timestamp_eof: u64::from(i) * 1000 + 500,
                roi_count: 0,
                has_trajectories: false,
                ext_md_size: 0,
                ext_dyn_md_size: 0,
            };
            let pixels = vec![i as u8; 8];
            writer.write_frame(meta, None, None, &pixels).unwrap();
        }
        let frames_written = writer.close().unwrap();
        assert_eq!(frames_written, 3);
    }

    #[test]
    fn close_fixes_up_frame_count_when_fewer_written() {
        let header = test_header(5, 4, 48);
        let cursor = Cursor::new(Vec::new());
        let mut writer = PrdWriter::new(cursor, header, TrajectoryLayout::default());
        let meta = PrdMetaData {
            frame_number: 1,
            readout_time: 0,
            exposure_time: 0,
            timestamp_bof: 0,
            timestamp_eof: 0,
            roi_count: 0,
            has_trajectories: false,
            ext_md_size: 0,
            ext_dyn_md_size: 0,
        };
        writer.write_frame(meta, None, None, &[1, 2, 3, 4]).unwrap();
        let written = writer.close().unwrap();
        assert_eq!(written, 1);
    }

    #[test]
    fn full_round_trip_through_reader() {
        let layout = TrajectoryLayout {
            max_trajectories: 0,
            max_points: 0,
        };
        let header = test_header(2, 4, 48);
        let mut buf = Vec::new();
        {
            let cursor = Cursor::new(&mut buf);
            let mut writer = PrdWriter::new(cursor, header, layout);
            for i in 1..=2u32 {
                let meta = PrdMetaData {
                    frame_number: i,
                    readout_time: 1,
                    exposure_time: 2,
                    timestamp_bof: 10,
                    timestamp_eof: 20,
                    roi_count: 0,
                    has_trajectories: false,
                    ext_md_size: 0,
                    ext_dyn_md_size: 0,
                };
                writer
                    .write_frame(meta, None, None, &[i as u8; 4])
                    .unwrap();
            }
            writer.close().unwrap();
        }

        let mut reader = PrdReader::open(Cursor::new(buf)).unwrap();
        assert_eq!(reader.header().frame_count, 2);
        let first = reader.read_frame().unwrap().unwrap();
        assert_eq!(first.meta.frame_number, 1);
        assert_eq!(first.frame.data(), &[1, 1, 1, 1]);
        let second = reader.read_frame().unwrap().unwrap();
        assert_eq!(second.meta.frame_number, 2);
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn trajectories_round_trip_with_padding() {
        let layout = TrajectoryLayout {
            max_trajectories: 4,
            max_points: 8,
        };
        let header = test_header(1, 4, 48 + layout.block_bytes());
        let mut buf = Vec::new();
        let trajectories = vec![
            Trajectory {
                roi_nr: 0,
                particle_id: 1,
                lifetime: 2,
                points: vec![
                    TrajectoryPoint {
                        valid: true,
                        x: 1,
                        y: 2,
                    },
                    TrajectoryPoint {
                        valid: true,
                        x: 3,
                        y: 4,
                    },
                ],
            },
            Trajectory {
                roi_nr: 1,
                particle_id: 2,
                lifetime: 2,
                points: vec![
                    TrajectoryPoint {
                        valid: true,
                        x: 5,
                        y: 6,
                    },
                    TrajectoryPoint {
                        valid: true,
                        x: 7,
                        y: 8,
                    },
                ],
            },
        ];
        {
            let cursor = Cursor::new(&mut buf);
            let mut writer = PrdWriter::new(cursor, header, layout);
            let meta = PrdMetaData {
                frame_number: 1,
                readout_time: 0,
                exposure_time: 0,
                timestamp_bof: 0,
                timestamp_eof: 0,
                roi_count: 0,
                has_trajectories: true,
                ext_md_size: layout.block_bytes(),
                ext_dyn_md_size: 0,
            };
            writer
                .write_frame(meta, Some(&trajectories), None, &[7u8; 4])
                .unwrap();
            writer.close().unwrap();
        }

        let mut reader = PrdReader::open(Cursor::new(buf)).unwrap();
        let decoded = reader.read_frame().unwrap().unwrap();
        let got = decoded.frame.trajectories().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].particle_id, 1);
        assert_eq!(got[0].lifetime, 2);
        assert_eq!(got[0].points.len(), 2);
        assert_eq!(got[1].points[1].x, 7);
    }

    #[test]
    fn frame_count_that_fits_in_matches_formula() {
        let header = test_header(0, 100, 48);
        // (10_048 - 48) / (48 + 100) = 10_000 / 148 = 67
        assert_eq!(frame_count_that_fits_in(&header, 10_048), 67);
        assert_eq!(frame_count_that_fits_in(&header, 10), 0);
    }
}
