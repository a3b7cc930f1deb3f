//! Layered configuration: an optional TOML file overlaid with
//! `CAMACQ_`-prefixed environment variables, producing a [`Settings`]
//! ready for [`crate::engine::Engine::new`].
//!
//! Grounded on the teacher's use of the `config` crate (`config::Config`
//! layered over a TOML file plus environment) for its CLI's settings
//! file. Every field defaults to the same value [`Settings::default`]
//! and [`FakeCameraConfig::default`] already use, so an absent config
//! file (and no environment overrides) reproduces those defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::driver::FakeCameraConfig;
use crate::error::AcqResult;
use crate::settings::{AcqMode, Settings, StorageType, TrigMode};

/// Mirrors [`AcqMode`] for TOML/env deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcqModeCfg {
    SnapSequence,
    SnapCircBuffer,
    SnapTimeLapse,
    LiveCircBuffer,
    LiveTimeLapse,
}

impl Default for AcqModeCfg {
    fn default() -> Self {
        Self::SnapSequence
    }
}

impl From<AcqModeCfg> for AcqMode {
    fn from(value: AcqModeCfg) -> Self {
        match value {
            AcqModeCfg::SnapSequence => AcqMode::SnapSequence,
            AcqModeCfg::SnapCircBuffer => AcqMode::SnapCircBuffer,
            AcqModeCfg::SnapTimeLapse => AcqMode::SnapTimeLapse,
            AcqModeCfg::LiveCircBuffer => AcqMode::LiveCircBuffer,
            AcqModeCfg::LiveTimeLapse => AcqMode::LiveTimeLapse,
        }
    }
}

/// Mirrors [`StorageType`] for TOML/env deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTypeCfg {
    None,
    Prd,
    Tiff,
}

impl Default for StorageTypeCfg {
    fn default() -> Self {
        Self::None
    }
}

impl From<StorageTypeCfg> for StorageType {
    fn from(value: StorageTypeCfg) -> Self {
        match value {
            StorageTypeCfg::None => StorageType::None,
            StorageTypeCfg::Prd => StorageType::Prd,
            StorageTypeCfg::Tiff => StorageType::Tiff,
        }
    }
}

/// Mirrors [`TrigMode`] for TOML/env deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrigModeCfg {
    Internal,
    EdgeTrigger,
    StrobedTrigger,
    VariableTimed,
}

impl Default for TrigModeCfg {
    fn default() -> Self {
        Self::Internal
    }
}

impl From<TrigModeCfg> for TrigMode {
    fn from(value: TrigModeCfg) -> Self {
        match value {
            TrigModeCfg::Internal => TrigMode::Internal,
            TrigModeCfg::EdgeTrigger => TrigMode::EdgeTrigger,
            TrigModeCfg::StrobedTrigger => TrigMode::StrobedTrigger,
            TrigModeCfg::VariableTimed => TrigMode::VariableTimed,
        }
    }
}

/// The `[acquisition]` table: everything that becomes a [`Settings`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AcquisitionSection {
    pub acq_mode: AcqModeCfg,
    pub storage_type: StorageTypeCfg,
    /// Raw resolution value: `1` (µs), `1_000` (ms), or `1_000_000` (s).
    pub exposure_resolution: u32,
    pub trig_mode: TrigModeCfg,
    pub vtm_exposures: Vec<u32>,
    pub exposure_time: u32,
    pub acq_frame_count: u32,
    pub save_dir: PathBuf,
    pub save_first: usize,
    pub save_last: usize,
    pub max_stack_size: usize,
}

impl Default for AcquisitionSection {
    fn default() -> Self {
        let defaults = Settings::default();
        Self {
            acq_mode: AcqModeCfg::default(),
            storage_type: StorageTypeCfg::default(),
            exposure_resolution: 1,
            trig_mode: TrigModeCfg::default(),
            vtm_exposures: Vec::new(),
            exposure_time: 0,
            acq_frame_count: defaults.acq_frame_count(),
            save_dir: defaults.save_dir().to_path_buf(),
            save_first: defaults.save_first(),
            save_last: defaults.save_last(),
            max_stack_size: defaults.max_stack_size(),
        }
    }
}

impl AcquisitionSection {
    /// Builds a [`Settings`] from this section, running every validating
    /// setter in the order that keeps cross-field checks meaningful
    /// (`trig_mode` before `vtm_exposures`, in particular).
    pub fn into_settings(self) -> AcqResult<Settings> {
        let mut settings = Settings::new();
        settings.set_acq_mode(self.acq_mode.into());
        settings.set_storage_type(self.storage_type.into());
        settings.set_exposure_resolution(self.exposure_resolution)?;
        settings.set_trig_mode(self.trig_mode.into());
        settings.set_vtm_exposures(self.vtm_exposures)?;
        settings.set_exposure_time(self.exposure_time);
        settings.set_acq_frame_count(self.acq_frame_count);
        settings.set_save_dir(self.save_dir);
        settings.set_save_first(self.save_first);
        settings.set_save_last(self.save_last);
        settings.set_max_stack_size(self.max_stack_size);
        Ok(settings)
    }
}

/// The `[fake_camera]` table, read only by the CLI's `--driver fake` mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FakeCameraSection {
    pub width: u16,
    pub height: u16,
    pub frame_count: u32,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub buffer_frame_count: u32,
}

impl Default for FakeCameraSection {
    fn default() -> Self {
        let defaults = FakeCameraConfig::default();
        Self {
            width: defaults.width,
            height: defaults.height,
            frame_count: defaults.frame_count,
            interval: defaults.interval,
            buffer_frame_count: defaults.buffer_frame_count,
        }
    }
}

impl From<FakeCameraSection> for FakeCameraConfig {
    fn from(value: FakeCameraSection) -> Self {
        FakeCameraConfig {
            width: value.width,
            height: value.height,
            frame_sequence: None,
            frame_count: value.frame_count,
            interval: value.interval,
            buffer_frame_count: value.buffer_frame_count,
        }
    }
}

/// The fully deserialized configuration tree, before any validating
/// setter has run.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub acquisition: AcquisitionSection,
    pub fake_camera: FakeCameraSection,
}

/// Loads configuration layered as: built-in defaults, then `path` (or,
/// absent that, an optional `camacq.toml` in the working directory), then
/// `CAMACQ_`-prefixed environment variables (double-underscore nesting,
/// e.g. `CAMACQ_ACQUISITION__SAVE_DIR`).
pub fn load(path: Option<&std::path::Path>) -> AcqResult<RawConfig> {
    let mut builder = config::Config::builder();
    builder = match path {
        Some(path) => builder.add_source(config::File::from(path.to_path_buf())),
        None => builder.add_source(config::File::with_name("camacq").required(false)),
    };
    builder = builder.add_source(
        config::Environment::with_prefix("CAMACQ")
            .separator("__")
            .try_parsing(true),
    );
    let raw: RawConfig = builder.build()?.try_deserialize()?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_file_and_env_reproduces_settings_defaults() {
        let raw = load(None).expect("defaults alone must deserialize");
        let settings = raw.acquisition.into_settings().unwrap();
        assert_eq!(settings.acq_mode(), AcqMode::SnapSequence);
        assert_eq!(settings.storage_type(), StorageType::None);
        assert_eq!(settings.max_stack_size(), 0);
    }

    #[test]
    fn env_override_reaches_settings() {
        std::env::set_var("CAMACQ_ACQUISITION__SAVE_FIRST", "10");
        let raw = load(None).expect("env source must parse");
        std::env::remove_var("CAMACQ_ACQUISITION__SAVE_FIRST");
        let settings = raw.acquisition.into_settings().unwrap();
        assert_eq!(settings.save_first(), 10);
    }
}
