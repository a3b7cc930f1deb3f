//! Multi-page TIFF writer.
//!
//! Grounded on `backend/TiffFileSave.cpp`'s `GetImageDesc()` for the
//! `ImageDescription` tag layout, and on the `tiff` crate directly rather
//! than the `image` crate: `crates/daq-storage/src/tiff_writer.rs` (via
//! `image::codecs::tiff::TiffEncoder`) can only emit one IFD per encoder
//! and falls back to numbered sibling files for anything it calls a
//! "stack". `strawlab-strand-braid`'s frame-source crates depend on
//! `tiff` directly for the same class of problem -- one encoder, one
//! IFD per frame, one file.

use std::io::{Seek, Write};

use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use crate::error::{AcqError, AcqResult};
use crate::frame::{Frame, FrameMetadata};
use crate::prd::{PrdHeader, PrdMetaData};

/// Appends one frame per call to the same `tiff` encoder, producing a
/// true multi-IFD (multi-page) file rather than numbered siblings.
pub struct TiffStackWriter<W: Write + Seek> {
    encoder: TiffEncoder<W>,
    width: u32,
    height: u32,
    pages_written: u32,
}

impl<W: Write + Seek> TiffStackWriter<W> {
    /// Opens a writer for `width`x`height`, 16-bit grayscale pages.
    pub fn new(sink: W, width: u32, height: u32) -> AcqResult<Self> {
        let encoder = TiffEncoder::new(sink)
            .map_err(|e| AcqError::ConfigInvalid(format!("tiff encoder init failed: {e}")))?;
        Ok(Self {
            encoder,
            width,
            height,
            pages_written: 0,
        })
    }

    /// Writes one page: recomposes ROI metadata onto a black canvas when
    /// present, attaches an `ImageDescription` tag, and appends a new IFD.
    pub fn write_frame(
        &mut self,
        frame: &Frame,
        header: &PrdHeader,
        meta: &PrdMetaData,
    ) -> AcqResult<()> {
        let pixels = self.recompose(frame)?;
        let description = build_image_description(header, meta);

        let mut image = self
            .encoder
            .new_image::<colortype::Gray16>(self.width, self.height)
            .map_err(|e| AcqError::ConfigInvalid(format!("tiff new_image failed: {e}")))?;
        image
            .encoder()
            .write_tag(Tag::ImageDescription, description.as_str())
            .map_err(|e| AcqError::ConfigInvalid(format!("tiff tag write failed: {e}")))?;
        image
            .write_data(&pixels)
            .map_err(|e| AcqError::ConfigInvalid(format!("tiff page write failed: {e}")))?;

        self.pages_written += 1;
        Ok(())
    }

    /// Number of pages appended so far.
    #[must_use]
    pub fn pages_written(&self) -> u32 {
        self.pages_written
    }

    /// If metadata was decoded and carries ROI placement, fills a
    /// black `width`x`height` canvas and blits each valid ROI at its
    /// recorded offset; otherwise returns the frame's raw pixels as-is.
    /// While streaming, only the implied ROI (starting at `[0, 0]`) is
    /// ever recomposed -- matching the upstream behavior this is
    /// grounded on.
    fn recompose(&self, frame: &Frame) -> AcqResult<Vec<u16>> {
        let expected_len = (self.width * self.height) as usize;
        if frame.metadata().rois.is_empty() {
            return bytes_to_u16(frame.data(), expected_len);
        }
        let mut canvas = vec![0u16; expected_len];
        recompose_rois(&mut canvas, self.width, self.height, frame.metadata())?;
        Ok(canvas)
    }
}

fn bytes_to_u16(raw: &[u8], expected_len: usize) -> AcqResult<Vec<u16>> {
    if raw.len() != expected_len * 2 {
        return Err(AcqError::ConfigInvalid(format!(
            "pixel buffer is {} bytes, expected {} 16-bit pixels",
            raw.len(),
            expected_len
        )));
    }
    Ok(raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

fn recompose_rois(
    canvas: &mut [u16],
    width: u32,
    height: u32,
    metadata: &FrameMetadata,
) -> AcqResult<()> {
    for roi in &metadata.rois {
        if !roi.valid {
            continue;
        }
        let pixels = bytes_to_u16(&roi.pixels, (roi.width as usize) * (roi.height as usize))?;
        for row in 0..u32::from(roi.height) {
            let dst_y = u32::from(roi.y) + row;
            if dst_y >= height {
                break;
            }
            for col in 0..u32::from(roi.width) {
                let dst_x = u32::from(roi.x) + col;
                if dst_x >= width {
                    break;
                }
                let dst = (dst_y * width + dst_x) as usize;
                let src = (row * u32::from(roi.width) + col) as usize;
                canvas[dst] = pixels[src];
            }
        }
    }
    Ok(())
}

/// Builds the `ImageDescription` text, matching the key=value-per-line
/// layout of the format this is grounded on. Device-internal fields that
/// have no counterpart in this engine's own driver collaborator (the
/// recomposed-metadata internals) are omitted rather than fabricated.
#[must_use]
pub fn build_image_description(header: &PrdHeader, meta: &PrdMetaData) -> String {
    let exp_unit = match header.exposure_resolution {
        crate::prd::ExposureResolution::Micros => "us",
        crate::prd::ExposureResolution::Millis => "ms",
        crate::prd::ExposureResolution::Seconds => "s",
    };
    format!(
        "bitDepth={}\n\
         region=[{},{},{},{},{},{}]\n\
         frameNr={}\n\
         readoutTime={}us\n\
         expTime={}{}\n\
         bofTime={}us\n\
         eofTime={}us\n\
         roiCount={}\n\
         colorMask={}\n\
         flags=0x{:x}",
        header.bit_depth,
        header.region.s1,
        header.region.s2,
        header.region.sbin,
        header.region.p1,
        header.region.p2,
        header.region.pbin,
        meta.frame_number,
        meta.readout_time,
        meta.exposure_time,
        exp_unit,
        meta.timestamp_bof,
        meta.timestamp_eof,
        meta.roi_count,
        header.color_mask,
        header.flags(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AcqCfg, FrameInfo};
    use crate::prd::{ExposureResolution, Region};
    use std::io::Cursor;

    fn header() -> PrdHeader {
        PrdHeader {
            version: 0x0005,
            bit_depth: 16,
            frame_count: 2,
            region: Region {
                s1: 0,
                s2: 3,
                sbin: 1,
                p1: 0,
                p2: 1,
                pbin: 1,
            },
            size_of_meta_struct: 48,
            exposure_resolution: ExposureResolution::Micros,
            color_mask: 0,
            has_metadata: false,
            frame_size_varies: false,
            frame_size: 16,
        }
    }

    fn meta(frame_number: u32) -> PrdMetaData {
        PrdMetaData {
            frame_number,
            readout_time: 100,
            exposure_time: 5000,
            timestamp_bof: 1_000,
            timestamp_eof: 1_500,
            roi_count: 0,
            has_trajectories: false,
            ext_md_size: 0,
            ext_dyn_md_size: 0,
        }
    }

    fn raw_frame(width: u32, height: u32, fill: u16) -> Frame {
        let frame_bytes = width * height * 2;
        let cfg = AcqCfg {
            frame_bytes,
            roi_count: 0,
            has_metadata: false,
        };
        let mut frame = Frame::new(cfg, true);
        let pixels: Vec<u8> = (0..width * height)
            .flat_map(|_| fill.to_le_bytes())
            .collect();
        unsafe {
            frame.set_data_pointer(pixels.as_ptr(), pixels.len(), FrameInfo::default());
        }
        frame.copy_data().unwrap();
        frame
    }

    #[test]
    fn image_description_matches_expected_layout() {
        let desc = build_image_description(&header(), &meta(7));
        assert!(desc.contains("frameNr=7"));
        assert!(desc.contains("region=[0,3,1,0,1,1]"));
        assert!(desc.contains("expTime=5000us"));
    }

    #[test]
    fn write_stack_appends_multiple_pages() {
        let buf = Vec::new();
        let cursor = Cursor::new(buf);
        let mut writer = TiffStackWriter::new(cursor, 4, 2).unwrap();
        let h = header();
        for i in 1..=2u32 {
            let f = raw_frame(4, 2, i as u16);
            writer.write_frame(&f, &h, &meta(i)).unwrap();
        }
        assert_eq!(writer.pages_written(), 2);
    }

    #[test]
    fn recompose_without_rois_passes_through_raw_pixels() {
        let f = raw_frame(2, 2, 42);
        let writer_data = bytes_to_u16(f.data(), 4).unwrap();
        assert_eq!(writer_data, vec![42, 42, 42, 42]);
    }
}
