//! Detector calibration: which spectrum a detector feeds and how its raw
//! time converts to time-of-flight.

use eventws_core::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Per-detector lookup consumed by the ingest paths.
///
/// A detector without an entry has its events dropped.
pub trait Calibration: Send + Sync {
    /// Output spectrum index for `detector_id`.
    fn spectrum(&self, detector_id: u32) -> Option<usize>;

    /// Multiplicative factor from raw time to time-of-flight.
    fn scale_factor(&self, detector_id: u32) -> Option<f64>;

    /// Additive time offset, applied after scaling.
    fn offset(&self, detector_id: u32) -> f64 {
        let _ = detector_id;
        0.0
    }

    /// Returns `(spectrum, raw * scale + offset)`, or `None` if uncalibrated.
    fn calibrate(&self, detector_id: u32, raw: f64) -> Option<(usize, f64)> {
        let spectrum = self.spectrum(detector_id)?;
        let scale = self.scale_factor(detector_id)?;
        Some((spectrum, raw * scale + self.offset(detector_id)))
    }
}

/// One row of a calibration table.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CalibrationEntry {
    /// Physical detector id.
    pub detector_id: u32,
    /// Output spectrum index.
    pub spectrum: usize,
    /// Raw-to-TOF scale factor.
    pub scale: f64,
    /// Time offset in microseconds.
    #[cfg_attr(feature = "serde", serde(default))]
    pub offset: f64,
}

impl CalibrationEntry {
    /// Creates an entry with no offset.
    #[must_use]
    pub fn new(detector_id: u32, spectrum: usize, scale: f64) -> Self {
        Self {
            detector_id,
            spectrum,
            scale,
            offset: 0.0,
        }
    }

    /// Sets the time offset.
    #[must_use]
    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Slot {
    spectrum: usize,
    scale: f64,
    offset: f64,
}

/// Dense calibration table indexed by `detector_id - min_id`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CalibrationTable {
    min_id: u32,
    slots: Vec<Option<Slot>>,
}

impl CalibrationTable {
    /// Builds a table from entries.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a duplicate detector id or a non-finite
    /// scale or offset.
    pub fn new(entries: &[CalibrationEntry]) -> Result<Self> {
        let Some(min_id) = entries.iter().map(|e| e.detector_id).min() else {
            return Ok(Self::default());
        };
        let max_id = entries.iter().map(|e| e.detector_id).max().unwrap_or(min_id);
        let mut slots = vec![None; (max_id - min_id) as usize + 1];
        for entry in entries {
            if !entry.scale.is_finite() || !entry.offset.is_finite() {
                return Err(Error::InvalidArgument(format!(
                    "detector {} has a non-finite calibration",
                    entry.detector_id
                )));
            }
            let slot = &mut slots[(entry.detector_id - min_id) as usize];
            if slot.is_some() {
                return Err(Error::InvalidArgument(format!(
                    "detector {} is calibrated twice",
                    entry.detector_id
                )));
            }
            *slot = Some(Slot {
                spectrum: entry.spectrum,
                scale: entry.scale,
                offset: entry.offset,
            });
        }
        Ok(Self { min_id, slots })
    }

    /// Maps detectors `first..first + count` one-to-one onto spectra `0..count`
    /// with unit scale.
    #[must_use]
    pub fn identity(first: u32, count: usize) -> Self {
        Self {
            min_id: first,
            slots: (0..count)
                .map(|spectrum| {
                    Some(Slot {
                        spectrum,
                        scale: 1.0,
                        offset: 0.0,
                    })
                })
                .collect(),
        }
    }

    /// Number of calibrated detectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Returns true when no detector is calibrated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the largest spectrum index in the table.
    #[must_use]
    pub fn number_spectra(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .map(|slot| slot.spectrum + 1)
            .max()
            .unwrap_or(0)
    }

    /// The table as entries, ordered by detector id.
    #[must_use]
    pub fn entries(&self) -> Vec<CalibrationEntry> {
        self.slots
            .iter()
            .zip(self.min_id..)
            .filter_map(|(slot, detector_id)| {
                slot.map(|slot| CalibrationEntry {
                    detector_id,
                    spectrum: slot.spectrum,
                    scale: slot.scale,
                    offset: slot.offset,
                })
            })
            .collect()
    }

    #[inline]
    fn slot(&self, detector_id: u32) -> Option<&Slot> {
        let index = detector_id.checked_sub(self.min_id)? as usize;
        self.slots.get(index)?.as_ref()
    }
}

impl Calibration for CalibrationTable {
    #[inline]
    fn spectrum(&self, detector_id: u32) -> Option<usize> {
        self.slot(detector_id).map(|slot| slot.spectrum)
    }

    #[inline]
    fn scale_factor(&self, detector_id: u32) -> Option<f64> {
        self.slot(detector_id).map(|slot| slot.scale)
    }

    #[inline]
    fn offset(&self, detector_id: u32) -> f64 {
        self.slot(detector_id).map_or(0.0, |slot| slot.offset)
    }

    #[inline]
    fn calibrate(&self, detector_id: u32, raw: f64) -> Option<(usize, f64)> {
        self.slot(detector_id)
            .map(|slot| (slot.spectrum, raw * slot.scale + slot.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn lookup_and_missing_entries() {
        let table = CalibrationTable::new(&[
            CalibrationEntry::new(100, 0, 2.0),
            CalibrationEntry::new(103, 1, 0.5).with_offset(10.0),
        ])
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.number_spectra(), 2);

        let (spectrum, tof) = table.calibrate(103, 4.0).unwrap();
        assert_eq!(spectrum, 1);
        assert_relative_eq!(tof, 12.0);
        assert_relative_eq!(table.offset(103), 10.0);

        assert!(table.calibrate(101, 4.0).is_none());
        assert!(table.calibrate(99, 4.0).is_none());
        assert!(table.calibrate(200, 4.0).is_none());
        assert_eq!(table.entries().len(), 2);
    }

    #[test]
    fn rejects_duplicates_and_nan() {
        assert!(CalibrationTable::new(&[
            CalibrationEntry::new(1, 0, 1.0),
            CalibrationEntry::new(1, 1, 1.0),
        ])
        .is_err());
        assert!(CalibrationTable::new(&[CalibrationEntry::new(1, 0, f64::NAN)]).is_err());
        assert!(CalibrationTable::new(&[]).unwrap().is_empty());
    }

    #[test]
    fn identity_table() {
        let table = CalibrationTable::identity(5, 3);
        assert_eq!(table.spectrum(7), Some(2));
        assert_eq!(table.spectrum(8), None);
        assert_eq!(table.scale_factor(5), Some(1.0));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn entries_from_json() {
        let json = r#"[{"detector_id": 4, "spectrum": 0, "scale": 1.5}]"#;
        let entries: Vec<CalibrationEntry> = serde_json::from_str(json).unwrap();
        let table = CalibrationTable::new(&entries).unwrap();
        assert_eq!(table.calibrate(4, 2.0), Some((0, 3.0)));
    }
}
