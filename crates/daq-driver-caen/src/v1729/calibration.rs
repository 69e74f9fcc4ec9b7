//! Digitizer calibration data.
//!
//! A calibration holds the per-cell pedestal of one physical board and the
//! per-channel vernier bounds. It is produced once by
//! [`V1729::calibrate`](super::V1729::calibrate), stored as two JSON files and
//! shared read-only by every decoded buffer.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use vme_core::{Result, VmeError};

use super::spec::{MEMORY_SIZE, N_CHANNELS};

/// File holding the pedestal.
pub const PEDESTAL_FILE: &str = "pedestal.json";
/// File holding the vernier bounds.
pub const VERNIER_FILE: &str = "vernier.json";

/// Pedestal and vernier calibration of one digitizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitizerCalibration {
    /// Baseline of every memory word, header included.
    pub pedestal: Vec<u16>,
    /// Smallest vernier seen per channel.
    pub vernier_min: [u16; N_CHANNELS],
    /// Largest vernier seen per channel.
    pub vernier_max: [u16; N_CHANNELS],
    /// Programmed post-trigger; set by the board from its settings.
    #[serde(default)]
    pub post_trig: u16,
}

#[derive(Serialize, Deserialize)]
struct PedestalFile {
    pedestal: Vec<u16>,
}

#[derive(Serialize, Deserialize)]
struct VernierFile {
    min: [u16; N_CHANNELS],
    max: [u16; N_CHANNELS],
}

impl DigitizerCalibration {
    /// Build and validate a calibration.
    pub fn new(
        pedestal: Vec<u16>,
        vernier_min: [u16; N_CHANNELS],
        vernier_max: [u16; N_CHANNELS],
    ) -> Result<Self> {
        let calibration = Self {
            pedestal,
            vernier_min,
            vernier_max,
            post_trig: 0,
        };
        calibration.validate()?;
        Ok(calibration)
    }

    /// Same calibration for a board programmed with `post_trig`.
    pub fn with_post_trig(mut self, post_trig: u16) -> Self {
        self.post_trig = post_trig;
        self
    }

    /// Check the pedestal length and that every vernier range is non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.pedestal.len() != MEMORY_SIZE {
            return Err(VmeError::InvalidCalibration {
                message: format!(
                    "pedestal has {} words, expected {MEMORY_SIZE}",
                    self.pedestal.len()
                ),
            });
        }
        for (channel, (min, max)) in self.vernier_min.iter().zip(&self.vernier_max).enumerate() {
            if max <= min {
                return Err(VmeError::InvalidCalibration {
                    message: format!("vernier range of channel {channel} is empty ({min}..{max})"),
                });
            }
        }
        Ok(())
    }

    /// Write `pedestal.json` and `vernier.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        write_json(
            &dir.join(PEDESTAL_FILE),
            &PedestalFile {
                pedestal: self.pedestal.clone(),
            },
        )?;
        write_json(
            &dir.join(VERNIER_FILE),
            &VernierFile {
                min: self.vernier_min,
                max: self.vernier_max,
            },
        )?;
        debug!(dir = %dir.display(), "Saved digitizer calibration");
        Ok(())
    }

    /// Read a calibration saved by [`save`](Self::save).
    pub fn load(dir: &Path) -> Result<Self> {
        let pedestal: PedestalFile = read_json(&dir.join(PEDESTAL_FILE))?;
        let vernier: VernierFile = read_json(&dir.join(VERNIER_FILE))?;
        debug!(dir = %dir.display(), "Loaded digitizer calibration");
        Self::new(pedestal.pedestal, vernier.min, vernier.max)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(|err| VmeError::InvalidCalibration {
        message: format!("{}: {err}", path.display()),
    })?;
    fs::write(path, text)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|err| VmeError::InvalidCalibration {
        message: format!("{}: {err}", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat() -> DigitizerCalibration {
        DigitizerCalibration::new(vec![100; MEMORY_SIZE], [10; 4], [210; 4]).unwrap()
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let calibration = flat();
        calibration.save(dir.path()).unwrap();
        assert!(dir.path().join(PEDESTAL_FILE).exists());
        assert!(dir.path().join(VERNIER_FILE).exists());

        let loaded = DigitizerCalibration::load(dir.path()).unwrap();
        assert_eq!(loaded, calibration);
    }

    #[test]
    fn test_rejects_short_pedestal() {
        let err = DigitizerCalibration::new(vec![0; 12], [0; 4], [1; 4]).unwrap_err();
        assert_eq!(err.kind(), "invalid_calibration");
    }

    #[test]
    fn test_rejects_empty_vernier_range() {
        let err = DigitizerCalibration::new(vec![0; MEMORY_SIZE], [5, 5, 5, 5], [9, 9, 5, 9])
            .unwrap_err();
        assert!(err.to_string().contains("channel 2"));
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = DigitizerCalibration::load(&dir.path().join("absent")).unwrap_err();
        assert_eq!(err.kind(), "io_error");
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        flat().save(dir.path()).unwrap();
        fs::write(dir.path().join(VERNIER_FILE), "{ not json").unwrap();
        let err = DigitizerCalibration::load(dir.path()).unwrap_err();
        assert_eq!(err.kind(), "invalid_calibration");
    }
}
