//! The Frame object: owns metadata plus either an owned pixel buffer or a
//! borrowed view into the device ring.
//!
//! The borrowed/owned split is a type-level distinction (`FrameStorage`)
//! rather than a runtime flag a single code path branches on at every
//! access, per the "owning raw pointers" redesign note: a deep-copied
//! Frame truly owns its bytes, a shallow Frame truly borrows the device
//! ring, and the two are never silently interchangeable.

use crate::error::{AcqError, AcqResult};

/// The configuration two frames must share to be interchangeable within
/// the pool, Q1, or Q2. Frames with differing `AcqCfg` must never be
/// swapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcqCfg {
    /// Exact size in bytes of one frame's raw pixel payload.
    pub frame_bytes: u32,
    /// Number of configured regions of interest.
    pub roi_count: u16,
    /// Whether the device embeds metadata in the pixel buffer.
    pub has_metadata: bool,
}

/// Frame timing/ordering metadata, as delivered by the driver collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    /// 1-based, unique within one acquisition.
    pub frame_nr: u32,
    /// Begin-of-frame timestamp, microseconds since acquisition start.
    pub timestamp_bof: u64,
    /// End-of-frame timestamp, microseconds since acquisition start.
    pub timestamp_eof: u64,
}

impl FrameInfo {
    /// `eof - bof`, per the data model's definition of `readout_time`.
    #[must_use]
    pub fn readout_time(&self) -> u64 {
        self.timestamp_eof.saturating_sub(self.timestamp_bof)
    }
}

/// One decoded region-of-interest block, produced by `decode_metadata`.
#[derive(Debug, Clone)]
pub struct RoiData {
    /// Whether this slot holds a real ROI (unused slots are marked invalid
    /// rather than omitted, so index == roi number).
    pub valid: bool,
    /// Top-left corner, x.
    pub x: u16,
    /// Top-left corner, y.
    pub y: u16,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
    /// Decoded pixel data for this ROI.
    pub pixels: Vec<u8>,
}

/// Per-frame metadata decoded from the embedded PVCAM-style header.
#[derive(Debug, Clone, Default)]
pub struct FrameMetadata {
    /// Per-ROI pixel blocks, in declaration order.
    pub rois: Vec<RoiData>,
}

/// One point in a tracked particle's trajectory.
#[derive(Debug, Clone, Copy)]
pub struct TrajectoryPoint {
    /// Whether this point slot is meaningful.
    pub valid: bool,
    /// x coordinate.
    pub x: u16,
    /// y coordinate.
    pub y: u16,
}

/// One particle's trajectory, attached to a frame only when upstream
/// tracking is enabled.
#[derive(Debug, Clone)]
pub struct Trajectory {
    /// The ROI this trajectory was observed in.
    pub roi_nr: u16,
    /// Stable identifier for the tracked particle.
    pub particle_id: u32,
    /// Number of frames the particle has been detected in. Not the same
    /// as `points.len()`: a particle that disappears and reappears under
    /// the same `particle_id` does not advance `lifetime` while missing.
    pub lifetime: u32,
    /// Points observed so far, oldest first.
    pub points: Vec<TrajectoryPoint>,
}

/// A borrowed view into the driver's device ring. Valid only until the
/// driver overwrites the slot, i.e. `frame_nr + Q1_max <= latest_received`.
struct BorrowedView {
    ptr: *const u8,
    len: usize,
}

// SAFETY: a `BorrowedView` only ever crosses threads (EOF callback thread
// -> acquisition worker) as part of a `Frame` sitting in Q1, and the
// acquisition worker always calls `copy_data` (which consumes the
// borrowed view) before the frame is ever observed a second time. The
// pointed-to memory itself is owned by the driver, not by this crate.
unsafe impl Send for BorrowedView {}

enum FrameStorage {
    Owned(Vec<u8>),
    Borrowed(BorrowedView),
    Empty,
}

/// Owns metadata plus either an owned pixel buffer or a borrowed view into
/// the device ring; enforces `is_valid` and `needs_decode`.
pub struct Frame {
    cfg: AcqCfg,
    deep_copy: bool,
    storage: FrameStorage,
    source: Option<BorrowedView>,
    shallow_info: Option<FrameInfo>,
    info: Option<FrameInfo>,
    metadata: FrameMetadata,
    trajectories: Option<Vec<Trajectory>>,
    is_valid: bool,
    needs_decode: bool,
}

impl Frame {
    /// Allocates `frame_bytes` up front when `deep_copy`; otherwise
    /// defers, since a shallow Frame never owns a buffer of its own.
    #[must_use]
    pub fn new(cfg: AcqCfg, deep_copy: bool) -> Self {
        let storage = if deep_copy {
            FrameStorage::Owned(vec![0u8; cfg.frame_bytes as usize])
        } else {
            FrameStorage::Empty
        };
        Self {
            cfg,
            deep_copy,
            storage,
            source: None,
            shallow_info: None,
            info: None,
            metadata: FrameMetadata::default(),
            trajectories: None,
            is_valid: false,
            needs_decode: cfg.has_metadata,
        }
    }

    /// Records a borrowed source pointer and the shallow frame info that
    /// came with it. No copy happens here; `copy_data` consumes this.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of `len` bytes until either
    /// `copy_data` is called or the slot is overwritten by the driver,
    /// whichever comes first.
    pub unsafe fn set_data_pointer(&mut self, ptr: *const u8, len: usize, info: FrameInfo) {
        self.source = Some(BorrowedView { ptr, len });
        self.shallow_info = Some(info);
    }

    /// Invalidates first, then either deep-copies `frame_bytes` out of the
    /// stashed source pointer or publishes the borrowed view directly,
    /// promoting the stashed shallow info to the real info on success.
    pub fn copy_data(&mut self) -> AcqResult<()> {
        self.invalidate();
        let frame_nr = self.shallow_info.map(|i| i.frame_nr).unwrap_or(0);
        let source = self.source.take().ok_or(AcqError::FrameCopyFail {
            frame_nr,
            reason: "copy_data called with no source pointer set".to_string(),
        })?;

        if self.deep_copy {
            let expected = self.cfg.frame_bytes as usize;
            if source.len != expected {
                return Err(AcqError::FrameCopyFail {
                    frame_nr,
                    reason: format!("source length {} != expected {expected}", source.len),
                });
            }
            if !matches!(self.storage, FrameStorage::Owned(ref buf) if buf.len() == expected) {
                self.storage = FrameStorage::Owned(vec![0u8; expected]);
            }
            let FrameStorage::Owned(buf) = &mut self.storage else {
                unreachable!("storage forced to Owned above")
            };
            // SAFETY: `source.ptr` is valid for `source.len == expected`
            // bytes per `set_data_pointer`'s contract, and `buf` was just
            // sized to `expected` bytes above.
            unsafe {
                std::ptr::copy_nonoverlapping(source.ptr, buf.as_mut_ptr(), expected);
            }
        } else {
            self.storage = FrameStorage::Borrowed(source);
        }

        if let Some(shallow) = self.shallow_info.take() {
            self.info = Some(shallow);
        }
        self.is_valid = true;
        Ok(())
    }

    /// Clears validity, info, trajectories, and decoded metadata; resets
    /// `needs_decode` to `has_metadata`. Any Frame returned to the pool
    /// must be in this state.
    pub fn invalidate(&mut self) {
        self.is_valid = false;
        self.info = None;
        self.trajectories = None;
        self.needs_decode = self.cfg.has_metadata;
        self.metadata = FrameMetadata::default();
    }

    /// No-op unless `needs_decode`. Parses the embedded metadata header
    /// into `metadata`: a leading `roi_count: u16`, then one record per
    /// configured ROI slot (`valid: u8, x: u16, y: u16, width: u16,
    /// height: u16`, immediately followed by that ROI's `width * height`
    /// 16-bit pixels when `valid`). Slots beyond the embedded `roi_count`
    /// are recorded invalid with no pixel payload, so `rois.len() ==
    /// cfg.roi_count` and index == ROI number. On failure the frame is
    /// invalidated and the first 32 bytes of the raw buffer are logged.
    pub fn decode_metadata(&mut self) -> AcqResult<()> {
        if !self.needs_decode {
            return Ok(());
        }
        let frame_nr = self.info.map(|i| i.frame_nr).unwrap_or(0);
        let raw = self.data().to_vec();
        if raw.len() < 2 {
            let dump = raw.clone();
            tracing::warn!(frame_nr, ?dump, "metadata decode failed: buffer too short");
            self.invalidate();
            return Err(AcqError::MetadataCorrupt {
                frame_nr,
                reason: "buffer shorter than the metadata header".to_string(),
            });
        }
        let roi_count = u16::from_le_bytes([raw[0], raw[1]]);
        if roi_count > self.cfg.roi_count {
            let dump = raw[..raw.len().min(32)].to_vec();
            tracing::warn!(
                frame_nr,
                roi_count,
                ?dump,
                "metadata decode failed: roi_count exceeds configured maximum"
            );
            self.invalidate();
            return Err(AcqError::MetadataCorrupt {
                frame_nr,
                reason: format!(
                    "embedded roi_count {roi_count} exceeds configured maximum {}",
                    self.cfg.roi_count
                ),
            });
        }

        let mut rois = Vec::with_capacity(self.cfg.roi_count as usize);
        let mut offset = 2usize;
        for idx in 0..self.cfg.roi_count {
            if idx >= roi_count {
                rois.push(RoiData {
                    valid: false,
                    x: 0,
                    y: 0,
                    width: 0,
                    height: 0,
                    pixels: Vec::new(),
                });
                continue;
            }
            if offset + 9 > raw.len() {
                let dump = raw[..raw.len().min(32)].to_vec();
                tracing::warn!(frame_nr, idx, ?dump, "metadata decode failed: truncated roi header");
                self.invalidate();
                return Err(AcqError::MetadataCorrupt {
                    frame_nr,
                    reason: format!("roi {idx} header runs past end of buffer"),
                });
            }
            let valid = raw[offset] != 0;
            let x = u16::from_le_bytes([raw[offset + 1], raw[offset + 2]]);
            let y = u16::from_le_bytes([raw[offset + 3], raw[offset + 4]]);
            let width = u16::from_le_bytes([raw[offset + 5], raw[offset + 6]]);
            let height = u16::from_le_bytes([raw[offset + 7], raw[offset + 8]]);
            offset += 9;

            let pixel_len = width as usize * height as usize * 2;
            if valid && offset + pixel_len > raw.len() {
                let dump = raw[..raw.len().min(32)].to_vec();
                tracing::warn!(frame_nr, idx, ?dump, "metadata decode failed: truncated roi pixels");
                self.invalidate();
                return Err(AcqError::MetadataCorrupt {
                    frame_nr,
                    reason: format!("roi {idx} pixel payload runs past end of buffer"),
                });
            }
            let pixels = if valid {
                let block = raw[offset..offset + pixel_len].to_vec();
                offset += pixel_len;
                block
            } else {
                Vec::new()
            };
            rois.push(RoiData {
                valid,
                x,
                y,
                width,
                height,
                pixels,
            });
        }

        self.metadata.rois = rois;
        self.needs_decode = false;
        Ok(())
    }

    /// An `AcqCfg`-preserving copy. When `deep` is true the pixel buffer
    /// is physically duplicated; when false the copy is only meaningful
    /// for metadata/info (used by the FPS limiter's best-effort tee,
    /// which always passes `deep = true` since the original frame may be
    /// reused by the acquisition worker immediately after).
    #[must_use]
    pub fn duplicate(&self, deep: bool) -> Self {
        let mut out = Frame::new(self.cfg, deep);
        if deep {
            if let (FrameStorage::Owned(src), FrameStorage::Owned(dst)) =
                (&self.storage, &mut out.storage)
            {
                dst.copy_from_slice(src);
            }
        }
        out.info = self.info;
        out.trajectories = self.trajectories.clone();
        out.metadata = self.metadata.clone();
        out.is_valid = self.is_valid;
        out.needs_decode = self.needs_decode;
        out
    }

    /// The frame's current pixel bytes, whichever storage backs them.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match &self.storage {
            FrameStorage::Owned(buf) => buf,
            // SAFETY: a Borrowed view is only constructed through
            // `set_data_pointer`'s documented contract, which this Frame
            // has not outlived (enforced by the engine's staleness check).
            FrameStorage::Borrowed(view) => unsafe {
                std::slice::from_raw_parts(view.ptr, view.len)
            },
            FrameStorage::Empty => &[],
        }
    }

    /// This frame's `AcqCfg`.
    #[must_use]
    pub fn cfg(&self) -> AcqCfg {
        self.cfg
    }

    /// Whether this frame owns a deep copy of its pixel buffer, as opposed
    /// to borrowing a view into the device ring.
    #[must_use]
    pub fn deep_copy(&self) -> bool {
        self.deep_copy
    }

    /// Whether `data()` currently reflects valid, copied contents.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    /// Whether `decode_metadata` still needs to run.
    #[must_use]
    pub fn needs_decode(&self) -> bool {
        self.needs_decode
    }

    /// The frame's timing/ordering info, if any has been committed.
    #[must_use]
    pub fn info(&self) -> Option<FrameInfo> {
        self.info
    }

    /// Decoded per-frame metadata.
    #[must_use]
    pub fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    /// Attached trajectories, if tracking was enabled upstream.
    #[must_use]
    pub fn trajectories(&self) -> Option<&[Trajectory]> {
        self.trajectories.as_deref()
    }

    /// Attaches trajectories (used by the PRD read path when reconstructing
    /// a frame that carried a trajectories block).
    pub fn set_trajectories(&mut self, trajectories: Vec<Trajectory>) {
        self.trajectories = Some(trajectories);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AcqCfg {
        AcqCfg {
            frame_bytes: 8,
            roi_count: 0,
            has_metadata: false,
        }
    }

    #[test]
    fn new_frame_is_invalid_until_copied() {
        let frame = Frame::new(cfg(), true);
        assert!(!frame.is_valid());
    }

    #[test]
    fn copy_data_deep_copies_and_validates() {
        let mut frame = Frame::new(cfg(), true);
        let src: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
        unsafe {
            frame.set_data_pointer(
                src.as_ptr(),
                src.len(),
                FrameInfo {
                    frame_nr: 1,
                    timestamp_bof: 0,
                    timestamp_eof: 10,
                },
            );
        }
        frame.copy_data().unwrap();
        assert!(frame.is_valid());
        assert_eq!(frame.data(), &src);
        assert_eq!(frame.info().unwrap().frame_nr, 1);
    }

    #[test]
    fn copy_data_without_source_fails() {
        let mut frame = Frame::new(cfg(), true);
        assert!(frame.copy_data().is_err());
    }

    #[test]
    fn copy_data_rejects_length_mismatch() {
        let mut frame = Frame::new(cfg(), true);
        let src: [u8; 4] = [1, 2, 3, 4];
        unsafe {
            frame.set_data_pointer(src.as_ptr(), src.len(), FrameInfo::default());
        }
        assert!(frame.copy_data().is_err());
    }

    #[test]
    fn invalidate_clears_state() {
        let mut frame = Frame::new(cfg(), true);
        let src: [u8; 8] = [0; 8];
        unsafe {
            frame.set_data_pointer(src.as_ptr(), src.len(), FrameInfo::default());
        }
        frame.copy_data().unwrap();
        frame.invalidate();
        assert!(!frame.is_valid());
        assert!(frame.info().is_none());
    }

    #[test]
    fn duplicate_deep_copies_bytes() {
        let mut frame = Frame::new(cfg(), true);
        let src: [u8; 8] = [9; 8];
        unsafe {
            frame.set_data_pointer(src.as_ptr(), src.len(), FrameInfo::default());
        }
        frame.copy_data().unwrap();
        let dup = frame.duplicate(true);
        assert_eq!(dup.data(), frame.data());
    }
}
