//! The relationship between the PWM drive level and where the ammeter needle actually lands.
//!
//! Analog meters driven from a GPIO pin are rarely linear, so the operator records a handful of points by eye (see
//! [`crate::capture`]) and the monitor looks up the drive needed for a desired dial reading by interpolating over
//! them in reverse.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::Error;

/// One sample: the drive level output and the dial position the operator saw for it, both as percentages.
///
/// Persisted as a two element array, `[drive_percent, observed_percent]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct CalibrationPoint {
    pub drive_percent: f64,
    pub observed_percent: f64,
}

impl CalibrationPoint {
    pub fn new(drive_percent: f64, observed_percent: f64) -> Self {
        Self {
            drive_percent,
            observed_percent,
        }
    }
}

impl From<(f64, f64)> for CalibrationPoint {
    fn from((drive_percent, observed_percent): (f64, f64)) -> Self {
        Self::new(drive_percent, observed_percent)
    }
}

impl From<CalibrationPoint> for (f64, f64) {
    fn from(point: CalibrationPoint) -> Self {
        (point.drive_percent, point.observed_percent)
    }
}

/// An ordered, validated set of [`CalibrationPoint`]s.
///
/// Construction enforces at least two points, every value within `[0, 100]`, strictly increasing drive and
/// non-decreasing observed values. The set cannot be mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CalibrationFile", into = "CalibrationFile")]
pub struct CalibrationSet {
    points: Vec<CalibrationPoint>,
    calibrated: bool,
    notes: String,
}

/// On-disk shape of a calibration
#[derive(Serialize, Deserialize)]
struct CalibrationFile {
    calibration_points: Vec<CalibrationPoint>,
    #[serde(default)]
    calibrated: bool,
    #[serde(default)]
    notes: String,
}

impl TryFrom<CalibrationFile> for CalibrationSet {
    type Error = Error;

    fn try_from(file: CalibrationFile) -> Result<Self, Self::Error> {
        CalibrationSet::new(file.calibration_points, file.calibrated, file.notes)
    }
}

impl From<CalibrationSet> for CalibrationFile {
    fn from(set: CalibrationSet) -> Self {
        CalibrationFile {
            calibration_points: set.points,
            calibrated: set.calibrated,
            notes: set.notes,
        }
    }
}

impl CalibrationSet {
    pub fn new<S: Into<String>>(
        points: Vec<CalibrationPoint>,
        calibrated: bool,
        notes: S,
    ) -> crate::Result<Self> {
        validate(&points)?;
        Ok(Self {
            points,
            calibrated,
            notes: notes.into(),
        })
    }

    /// The stand-in used until the dial has been calibrated: every level maps onto itself.
    pub fn identity(levels: &[f64]) -> crate::Result<Self> {
        let points = levels
            .iter()
            .map(|&p| CalibrationPoint::new(p, p))
            .collect();
        Self::new(
            points,
            false,
            "Identity default; run with --calibrate to capture the dial's response",
        )
    }

    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }

    /// Find the drive fraction (`0.0..=1.0`) at which the dial should read `desired_percent`.
    ///
    /// Observed values are the independent variable here. Requests outside the observed range return the drive of
    /// the nearest end point rather than extrapolating.
    pub fn invert(&self, desired_percent: f64) -> crate::Result<f64> {
        validate(&self.points)?;

        let first = self.points[0];
        let last = self.points[self.points.len() - 1];

        if desired_percent <= first.observed_percent {
            return Ok(first.drive_percent / 100.0);
        }
        if desired_percent >= last.observed_percent {
            return Ok(last.drive_percent / 100.0);
        }

        self.points
            .iter()
            .tuple_windows()
            .find(|(_, hi)| desired_percent <= hi.observed_percent)
            // `desired_percent` is strictly above `lo.observed_percent` for the matching segment, so it is never flat.
            .map(|(lo, hi)| {
                let t = (desired_percent - lo.observed_percent)
                    / (hi.observed_percent - lo.observed_percent);
                (lo.drive_percent + t * (hi.drive_percent - lo.drive_percent)) / 100.0
            })
            .ok_or_else(|| {
                Error::calibration(format!("no calibration segment spans {desired_percent}%"))
            })
    }

    /// The dial reading (percent) expected at `drive_percent`, interpolated linearly and clamped to the sampled range.
    pub fn observed_at(&self, drive_percent: f64) -> f64 {
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];

        if drive_percent <= first.drive_percent {
            return first.observed_percent;
        }
        if drive_percent >= last.drive_percent {
            return last.observed_percent;
        }

        self.points
            .iter()
            .tuple_windows()
            .find(|(_, hi)| drive_percent <= hi.drive_percent)
            .map(|(lo, hi)| {
                let t = (drive_percent - lo.drive_percent) / (hi.drive_percent - lo.drive_percent);
                lo.observed_percent + t * (hi.observed_percent - lo.observed_percent)
            })
            .unwrap_or(last.observed_percent)
    }

    /// Read a calibration from `path`.
    ///
    /// A missing file is not an error: the identity set over `levels` is returned instead, marked uncalibrated.
    /// Malformed content is a [`Error::CalibrationData`].
    pub fn load<P: AsRef<Path>>(path: P, levels: &[f64]) -> crate::Result<Self> {
        let path = path.as_ref();
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "No calibration found, using identity default");
                return Self::identity(levels);
            }
            Err(err) => return Err(err.into()),
        };

        let set: Self = serde_json::from_slice(&bytes)
            .map_err(|err| Error::calibration(format!("{}: {err}", path.display())))?;

        debug!(path = %path.display(), points = set.points.len(), "Loaded calibration");
        Ok(set)
    }

    /// As [`CalibrationSet::load`], but any failure to load falls back to the identity set with a warning.
    pub fn load_or_default<P: AsRef<Path>>(path: P, levels: &[f64]) -> crate::Result<Self> {
        let path = path.as_ref();
        let set = match Self::load(path, levels) {
            Ok(set) => set,
            Err(error) => {
                warn!(path = %path.display(), %error, "Ignoring unusable calibration, using identity default");
                Self::identity(levels)?
            }
        };

        if !set.calibrated {
            warn!("Dial is not calibrated; readings may be inaccurate");
        }

        Ok(set)
    }

    /// Write the calibration to `path`, replacing whatever was there.
    ///
    /// Content goes to a sibling temporary file first and is renamed into place so an interrupted save never leaves
    /// a truncated calibration behind.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let path = path.as_ref();
        let tmp = temp_path(path);

        let write = || -> crate::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut file, self)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            Ok(())
        };

        if let Err(err) = write().and_then(|_| fs::rename(&tmp, path).map_err(Error::from)) {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }

        info!(path = %path.display(), points = self.points.len(), "Saved calibration");
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn validate(points: &[CalibrationPoint]) -> crate::Result<()> {
    if points.len() < 2 {
        return Err(Error::calibration(format!(
            "at least two points are required, found {}",
            points.len()
        )));
    }

    for point in points {
        for value in [point.drive_percent, point.observed_percent] {
            if !(0.0..=100.0).contains(&value) {
                return Err(Error::calibration(format!(
                    "value {value} is outside 0..=100"
                )));
            }
        }
    }

    for (lo, hi) in points.iter().tuple_windows() {
        if hi.drive_percent <= lo.drive_percent {
            return Err(Error::calibration(format!(
                "drive levels must strictly increase ({} then {})",
                lo.drive_percent, hi.drive_percent
            )));
        }
        if hi.observed_percent < lo.observed_percent {
            return Err(Error::calibration(format!(
                "dial reversed direction between drive {}% and {}% ({} then {})",
                lo.drive_percent, hi.drive_percent, lo.observed_percent, hi.observed_percent
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const LEVELS: [f64; 5] = [0.0, 25.0, 50.0, 75.0, 100.0];

    fn set(points: &[(f64, f64)]) -> CalibrationSet {
        CalibrationSet::new(points.iter().copied().map(Into::into).collect(), true, "")
            .unwrap()
    }

    fn meter() -> CalibrationSet {
        set(&[
            (0.0, 0.0),
            (25.0, 20.0),
            (50.0, 45.0),
            (75.0, 72.0),
            (100.0, 100.0),
        ])
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sundial-{}-{name}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir.join("calibration.json")
    }

    #[test]
    fn invert_interpolates_between_samples() {
        let drive = meter().invert(60.0).unwrap();
        let expected = (50.0 + (60.0 - 45.0) / (72.0 - 45.0) * 25.0) / 100.0;
        assert!((drive - expected).abs() < 1e-12);
        assert!((drive - 0.6389).abs() < 1e-4);
    }

    #[test]
    fn invert_hits_sample_points_exactly() {
        let meter = meter();
        for point in meter.points() {
            let drive = meter.invert(point.observed_percent).unwrap();
            assert!((drive * 100.0 - point.drive_percent).abs() < 1e-9);
        }
    }

    #[test]
    fn invert_round_trips_through_forward_mapping() {
        let meter = meter();
        for desired in (0..=100).map(f64::from) {
            let drive = meter.invert(desired).unwrap();
            let observed = meter.observed_at(drive * 100.0);
            assert!(
                (observed - desired).abs() < 1e-9,
                "{desired} -> {drive} -> {observed}"
            );
        }
    }

    #[test]
    fn invert_clamps_outside_observed_range() {
        let meter = set(&[(10.0, 5.0), (50.0, 40.0), (90.0, 95.0)]);
        assert_eq!(meter.invert(0.0).unwrap(), 0.1);
        assert_eq!(meter.invert(-30.0).unwrap(), 0.1);
        assert_eq!(meter.invert(96.0).unwrap(), 0.9);
        assert_eq!(meter.invert(250.0).unwrap(), 0.9);
    }

    #[test]
    fn invert_clamps_with_flat_end_points() {
        // Needle pinned at zero for low drive and against the stop at high drive
        let meter = set(&[
            (0.0, 0.0),
            (25.0, 0.0),
            (50.0, 40.0),
            (75.0, 100.0),
            (100.0, 100.0),
        ]);
        assert_eq!(meter.invert(-5.0).unwrap(), 0.0);
        assert_eq!(meter.invert(0.0).unwrap(), 0.0);
        assert_eq!(meter.invert(100.0).unwrap(), 1.0);
        assert_eq!(meter.invert(120.0).unwrap(), 1.0);

        let drive = meter.invert(20.0).unwrap();
        assert!((drive - 0.375).abs() < 1e-12);
        assert!(drive.is_finite());
    }

    #[test]
    fn invert_skips_flat_interior_segment() {
        let meter = set(&[(0.0, 0.0), (30.0, 50.0), (60.0, 50.0), (100.0, 100.0)]);
        assert!((meter.invert(50.0).unwrap() - 0.3).abs() < 1e-12);
        assert!((meter.invert(75.0).unwrap() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn invert_rejects_non_finite_request() {
        assert!(matches!(
            meter().invert(f64::NAN),
            Err(Error::CalibrationData(_))
        ));
    }

    #[test]
    fn identity_is_uncalibrated_and_linear() {
        let identity = CalibrationSet::identity(&LEVELS).unwrap();
        assert!(!identity.is_calibrated());
        assert_eq!(
            identity.points(),
            LEVELS.map(|p| CalibrationPoint::new(p, p)).as_slice()
        );
        assert!((identity.invert(37.5).unwrap() - 0.375).abs() < 1e-12);
    }

    #[test]
    fn rejects_reversing_dial() {
        let result = CalibrationSet::new(
            vec![(0.0, 0.0).into(), (50.0, 60.0).into(), (100.0, 55.0).into()],
            true,
            "",
        );
        assert!(matches!(result, Err(Error::CalibrationData(_))));
    }

    #[test]
    fn rejects_unordered_drive_levels() {
        let result = CalibrationSet::new(
            vec![(0.0, 0.0).into(), (50.0, 40.0).into(), (50.0, 60.0).into()],
            true,
            "",
        );
        assert!(matches!(result, Err(Error::CalibrationData(_))));
    }

    #[test]
    fn rejects_too_few_and_out_of_range_points() {
        assert!(CalibrationSet::new(vec![(0.0, 0.0).into()], true, "").is_err());
        assert!(
            CalibrationSet::new(vec![(0.0, 0.0).into(), (100.0, 101.0).into()], true, "")
                .is_err()
        );
    }

    #[test]
    fn parse_calibration_file() {
        let set = serde_json::from_value::<CalibrationSet>(json!({
            "calibration_points": [[0, 0], [25, 20], [50, 45], [75, 72], [100, 100]],
            "calibrated": true,
            "notes": "bench meter",
        }))
        .unwrap();

        assert_eq!(set, CalibrationSet { notes: "bench meter".into(), ..meter() });
    }

    #[test]
    fn parse_calibration_file_rejects_wrong_shape() {
        for value in [
            json!({ "calibrated": true }),
            json!({ "calibration_points": [[0, 0, 0], [100, 100, 100]] }),
            json!({ "calibration_points": [[0, 0]] }),
            json!({ "calibration_points": [[0, 50], [100, 10]] }),
        ] {
            assert!(serde_json::from_value::<CalibrationSet>(value).is_err());
        }
    }

    #[test]
    fn load_missing_file_gives_identity() {
        let path = scratch("missing");
        let _ = fs::remove_file(&path);

        let set = CalibrationSet::load(&path, &LEVELS).unwrap();
        assert_eq!(set, CalibrationSet::identity(&LEVELS).unwrap());
        assert!(!set.is_calibrated());
    }

    #[test]
    fn load_malformed_file_is_calibration_error() {
        let path = scratch("malformed");
        fs::write(&path, r#"{ "calibration_points": "nope" }"#).unwrap();

        assert!(matches!(
            CalibrationSet::load(&path, &LEVELS),
            Err(Error::CalibrationData(_))
        ));

        let fallback = CalibrationSet::load_or_default(&path, &LEVELS).unwrap();
        assert_eq!(fallback, CalibrationSet::identity(&LEVELS).unwrap());
    }

    #[test]
    fn save_then_load_replaces_existing() {
        let path = scratch("save");
        fs::write(&path, "stale").unwrap();

        let meter = meter();
        meter.save(&path).unwrap();

        assert!(!temp_path(&path).exists());
        assert_eq!(CalibrationSet::load(&path, &LEVELS).unwrap(), meter);

        let written: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["calibration_points"][2], json!([50.0, 45.0]));
        assert_eq!(written["calibrated"], json!(true));
    }
}
