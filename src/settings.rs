//! Settings: the single source of truth for one acquisition, read-only
//! to everyone but the owner, with a narrow `ReadOnlyWriter` view that
//! lets the driver collaborator fill in capability fields it alone
//! discovers.
//!
//! Grounded on `backend/Settings.{h,cpp}`. The original's validated,
//! bool-returning `Set*` setters over raw PVCAM integer constants are
//! replaced by typed setters over enums (`AcqMode`, `StorageType`,
//! `TrigMode`) so invalid values are unrepresentable rather than
//! runtime-checked, except where the underlying value really is an open
//! integer range (`exposure_resolution`, sizes), which keep
//! `AcqResult`-returning validation.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{AcqError, AcqResult};
use crate::prd::ExposureResolution;

/// Acquisition mode. "Live*" variants run until stopped rather than for
/// a fixed frame count, and never apply `save_last` trimming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqMode {
    /// Fixed frame count, single-buffered.
    SnapSequence,
    /// Fixed frame count, circular device buffer.
    SnapCircBuffer,
    /// Fixed frame count, variable per-frame exposure (the VTM ring).
    SnapTimeLapse,
    /// Unbounded, circular device buffer.
    LiveCircBuffer,
    /// Unbounded, variable per-frame exposure.
    LiveTimeLapse,
}

impl AcqMode {
    /// Whether this mode ignores the frame-count cap and disables `save_last`.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, AcqMode::LiveCircBuffer | AcqMode::LiveTimeLapse)
    }
}

/// On-disk container the disk worker writes, or none at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// No file writes; drop/stats accounting still runs.
    None,
    /// The PRD binary container.
    Prd,
    /// Multi-page TIFF.
    Tiff,
}

/// Camera trigger mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrigMode {
    /// Free-running, camera-internal timing.
    Internal,
    /// One external trigger edge per frame.
    EdgeTrigger,
    /// Exposure duration follows the external trigger's gate width.
    StrobedTrigger,
    /// Fixed-rate triggering with a per-frame exposure pulled from the
    /// VTM ring: `vtm[(frame_nr - 1) % vtm.len()]`.
    VariableTimed,
}

/// The single source of truth for one acquisition. Mutable only through
/// its own setters (owner) or a scoped [`ReadOnlyWriter`] (driver
/// collaborator, capability fields only).
#[derive(Debug, Clone)]
pub struct Settings {
    acq_mode: AcqMode,
    storage_type: StorageType,
    exposure_resolution: ExposureResolution,
    trig_mode: TrigMode,
    vtm_exposures: Vec<u32>,
    exposure_time: u32,
    acq_frame_count: u32,
    buffer_frame_count: u32,
    save_dir: PathBuf,
    save_first: usize,
    save_last: usize,
    max_stack_size: usize,

    // Driver-discovered capability fields; written only through
    // `ReadOnlyWriter` during `revise`.
    em_gain_capable: bool,
    em_gain_max: u16,
    bit_depth: u16,
    width: u16,
    height: u16,
    circ_buffer_capable: bool,
    metadata_capable: bool,
    color_mask: u8,
    roi_count_max: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            acq_mode: AcqMode::SnapSequence,
            storage_type: StorageType::None,
            exposure_resolution: ExposureResolution::Micros,
            trig_mode: TrigMode::Internal,
            vtm_exposures: Vec::new(),
            exposure_time: 0,
            acq_frame_count: 0,
            buffer_frame_count: 0,
            save_dir: PathBuf::new(),
            save_first: 0,
            save_last: 0,
            max_stack_size: 0,
            em_gain_capable: false,
            em_gain_max: 0,
            bit_depth: 16,
            width: 0,
            height: 0,
            circ_buffer_capable: false,
            metadata_capable: false,
            color_mask: 0,
            roi_count_max: 0,
        }
    }
}

impl Settings {
    /// Default-valued settings, ready for the owner to configure before
    /// handing a [`ReadOnlyWriter`] to the driver collaborator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` against a scoped [`ReadOnlyWriter`] over `self`. This is
    /// the only way to obtain one: its constructor is private to this
    /// module, so no caller other than the owner (who decides when the
    /// driver collaborator's `setup_exp` is allowed to touch capability
    /// fields) can ever get one.
    pub fn revise<F: FnOnce(&mut ReadOnlyWriter<'_>)>(&mut self, f: F) {
        let mut writer = ReadOnlyWriter::new(self);
        f(&mut writer);
    }

    /// Freezes this configuration into an immutable, cheaply-cloneable
    /// snapshot for the worker threads to share.
    #[must_use]
    pub fn setup(self) -> Arc<Settings> {
        Arc::new(self)
    }

    /// The exposure time to use for `frame_nr` (1-based): the VTM ring
    /// entry when `trig_mode` is `VariableTimed`, otherwise the fixed
    /// `exposure_time`.
    #[must_use]
    pub fn exposure_for_frame(&self, frame_nr: u32) -> u32 {
        if self.trig_mode == TrigMode::VariableTimed && !self.vtm_exposures.is_empty() {
            let idx = (frame_nr.saturating_sub(1)) as usize % self.vtm_exposures.len();
            self.vtm_exposures[idx]
        } else {
            self.exposure_time
        }
    }

    pub fn set_acq_mode(&mut self, value: AcqMode) {
        self.acq_mode = value;
    }

    pub fn set_storage_type(&mut self, value: StorageType) {
        self.storage_type = value;
    }

    /// Rejects any value `ExposureResolution` does not recognize.
    pub fn set_exposure_resolution(&mut self, raw: u32) -> AcqResult<()> {
        self.exposure_resolution = ExposureResolution::from_u32(raw)?;
        Ok(())
    }

    pub fn set_trig_mode(&mut self, value: TrigMode) {
        self.trig_mode = value;
    }

    /// Sets the VTM exposure ring. Rejected as empty when `trig_mode` is
    /// already `VariableTimed`, since an empty ring has no well-defined
    /// per-frame exposure.
    pub fn set_vtm_exposures(&mut self, value: Vec<u32>) -> AcqResult<()> {
        if self.trig_mode == TrigMode::VariableTimed && value.is_empty() {
            return Err(AcqError::ConfigInvalid(
                "VTM exposure ring must not be empty in VariableTimed trig mode".to_string(),
            ));
        }
        self.vtm_exposures = value;
        Ok(())
    }

    pub fn set_exposure_time(&mut self, value: u32) {
        self.exposure_time = value;
    }

    pub fn set_acq_frame_count(&mut self, value: u32) {
        self.acq_frame_count = value;
    }

    pub fn set_buffer_frame_count(&mut self, value: u32) {
        self.buffer_frame_count = value;
    }

    pub fn set_save_dir(&mut self, value: PathBuf) {
        self.save_dir = value;
    }

    /// Rejects `first + last` overlapping the acquisition when it is
    /// bounded; see the disk worker's overlap check for the exact
    /// (unnormalized) comparison used at save time.
    pub fn set_save_first(&mut self, value: usize) {
        self.save_first = value;
    }

    pub fn set_save_last(&mut self, value: usize) {
        self.save_last = value;
    }

    pub fn set_max_stack_size(&mut self, value: usize) {
        self.max_stack_size = value;
    }

    #[must_use]
    pub fn acq_mode(&self) -> AcqMode {
        self.acq_mode
    }

    #[must_use]
    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    #[must_use]
    pub fn exposure_resolution(&self) -> ExposureResolution {
        self.exposure_resolution
    }

    #[must_use]
    pub fn trig_mode(&self) -> TrigMode {
        self.trig_mode
    }

    #[must_use]
    pub fn acq_frame_count(&self) -> u32 {
        self.acq_frame_count
    }

    #[must_use]
    pub fn buffer_frame_count(&self) -> u32 {
        self.buffer_frame_count
    }

    #[must_use]
    pub fn save_dir(&self) -> &std::path::Path {
        &self.save_dir
    }

    #[must_use]
    pub fn save_first(&self) -> usize {
        self.save_first
    }

    #[must_use]
    pub fn save_last(&self) -> usize {
        self.save_last
    }

    #[must_use]
    pub fn max_stack_size(&self) -> usize {
        self.max_stack_size
    }

    #[must_use]
    pub fn em_gain_capable(&self) -> bool {
        self.em_gain_capable
    }

    #[must_use]
    pub fn em_gain_max(&self) -> u16 {
        self.em_gain_max
    }

    #[must_use]
    pub fn bit_depth(&self) -> u16 {
        self.bit_depth
    }

    #[must_use]
    pub fn width(&self) -> u16 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u16 {
        self.height
    }

    #[must_use]
    pub fn circ_buffer_capable(&self) -> bool {
        self.circ_buffer_capable
    }

    #[must_use]
    pub fn metadata_capable(&self) -> bool {
        self.metadata_capable
    }

    #[must_use]
    pub fn color_mask(&self) -> u8 {
        self.color_mask
    }

    #[must_use]
    pub fn roi_count_max(&self) -> u16 {
        self.roi_count_max
    }
}

/// A scoped view over [`Settings`] that can only set driver-discovered
/// capability fields. Constructible only from within this module, so
/// the sole way to obtain one is through [`Settings::revise`].
pub struct ReadOnlyWriter<'a> {
    settings: &'a mut Settings,
}

impl<'a> ReadOnlyWriter<'a> {
    fn new(settings: &'a mut Settings) -> Self {
        Self { settings }
    }

    pub fn set_em_gain_capable(&mut self, value: bool) -> &mut Self {
        self.settings.em_gain_capable = value;
        self
    }

    pub fn set_em_gain_max(&mut self, value: u16) -> &mut Self {
        self.settings.em_gain_max = value;
        self
    }

    pub fn set_bit_depth(&mut self, value: u16) -> &mut Self {
        self.settings.bit_depth = value;
        self
    }

    pub fn set_width(&mut self, value: u16) -> &mut Self {
        self.settings.width = value;
        self
    }

    pub fn set_height(&mut self, value: u16) -> &mut Self {
        self.settings.height = value;
        self
    }

    pub fn set_circ_buffer_capable(&mut self, value: bool) -> &mut Self {
        self.settings.circ_buffer_capable = value;
        self
    }

    pub fn set_metadata_capable(&mut self, value: bool) -> &mut Self {
        self.settings.metadata_capable = value;
        self
    }

    pub fn set_color_mask(&mut self, value: u8) -> &mut Self {
        self.settings.color_mask = value;
        self
    }

    pub fn set_roi_count_max(&mut self, value: u16) -> &mut Self {
        self.settings.roi_count_max = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revise_is_the_only_way_to_set_capability_fields() {
        let mut settings = Settings::new();
        settings.revise(|w| {
            w.set_width(2048).set_height(2048).set_bit_depth(16);
        });
        assert_eq!(settings.width(), 2048);
        assert_eq!(settings.height(), 2048);
        assert_eq!(settings.bit_depth(), 16);
    }

    #[test]
    fn vtm_ring_selects_exposure_by_modulus() {
        let mut settings = Settings::new();
        settings.set_trig_mode(TrigMode::VariableTimed);
        settings.set_vtm_exposures(vec![10, 20, 30]).unwrap();
        assert_eq!(settings.exposure_for_frame(1), 10);
        assert_eq!(settings.exposure_for_frame(2), 20);
        assert_eq!(settings.exposure_for_frame(3), 30);
        assert_eq!(settings.exposure_for_frame(4), 10);
    }

    #[test]
    fn empty_vtm_ring_rejected_in_variable_timed_mode() {
        let mut settings = Settings::new();
        settings.set_trig_mode(TrigMode::VariableTimed);
        assert!(settings.set_vtm_exposures(Vec::new()).is_err());
    }

    #[test]
    fn invalid_exposure_resolution_rejected() {
        let mut settings = Settings::new();
        assert!(settings.set_exposure_resolution(42).is_err());
        assert!(settings.set_exposure_resolution(1_000).is_ok());
    }

    #[test]
    fn live_modes_are_recognized() {
        assert!(AcqMode::LiveCircBuffer.is_live());
        assert!(!AcqMode::SnapSequence.is_live());
    }

    #[test]
    fn setup_freezes_into_a_shareable_snapshot() {
        let mut settings = Settings::new();
        settings.set_acq_frame_count(100);
        let snapshot = settings.setup();
        assert_eq!(snapshot.acq_frame_count(), 100);
    }
}
