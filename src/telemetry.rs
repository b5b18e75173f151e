//! Telemetry source (§4.6): a lazy, finite, forward-only sequence of
//! samples behind a small trait, so the bundled CSV reader and a
//! deterministic test double both satisfy the same contract the real
//! activity-file decoder would.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample {
    pub timestamp: u64,
    pub speed: u16,
    pub cadence: u16,
    pub heart_rate: u8,
    pub power: u16,
}

/// A finite, forward-only stream of recorded samples. `next_sample` returns
/// `None` once exhausted; callers fall back to configured constants.
pub trait TelemetrySource {
    fn next_sample(&mut self) -> Option<TelemetrySample>;
}

/// Stand-in for the opaque real activity-file format (FIT or similar): a
/// simple `timestamp,speed,cadence,heart_rate,power` CSV, one record per
/// line, consumed front-to-back.
pub struct ActivityFileSource {
    samples: std::collections::VecDeque<TelemetrySample>,
}

impl ActivityFileSource {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut samples = std::collections::VecDeque::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(sample) = parse_csv_line(line) {
                samples.push_back(sample);
            }
        }
        Ok(ActivityFileSource { samples })
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl TelemetrySource for ActivityFileSource {
    fn next_sample(&mut self) -> Option<TelemetrySample> {
        self.samples.pop_front()
    }
}

fn parse_csv_line(line: &str) -> Option<TelemetrySample> {
    let mut fields = line.split(',').map(str::trim);
    let timestamp = fields.next()?.parse().ok()?;
    let speed = fields.next()?.parse().ok()?;
    let cadence = fields.next()?.parse().ok()?;
    let heart_rate = fields.next()?.parse().ok()?;
    let power = fields.next()?.parse().ok()?;
    Some(TelemetrySample {
        timestamp,
        speed,
        cadence,
        heart_rate,
        power,
    })
}

/// Configured constant telemetry, used whenever no activity file is
/// supplied or the recorded stream has run dry.
#[derive(Debug, Clone, Copy)]
pub struct ConstantTelemetry {
    pub speed: u16,
    pub cadence: u16,
    pub heart_rate: u8,
    pub power: u16,
}

impl ConstantTelemetry {
    pub fn sample(&self, timestamp: u64) -> TelemetrySample {
        TelemetrySample {
            timestamp,
            speed: self.speed,
            cadence: self.cadence,
            heart_rate: self.heart_rate,
            power: self.power,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct FixedQueue(std::collections::VecDeque<TelemetrySample>);

    impl TelemetrySource for FixedQueue {
        fn next_sample(&mut self) -> Option<TelemetrySample> {
            self.0.pop_front()
        }
    }

    #[test]
    fn trait_object_drains_in_order() {
        let mut q = FixedQueue(
            vec![
                TelemetrySample { timestamp: 0, speed: 100, cadence: 180, heart_rate: 140, power: 200 },
                TelemetrySample { timestamp: 1, speed: 110, cadence: 182, heart_rate: 141, power: 205 },
            ]
            .into(),
        );
        assert_eq!(q.next_sample().unwrap().speed, 100);
        assert_eq!(q.next_sample().unwrap().speed, 110);
        assert!(q.next_sample().is_none());
    }

    #[test]
    fn parses_csv_line() {
        let s = parse_csv_line("12, 1500, 180, 142, 210").unwrap();
        assert_eq!(
            s,
            TelemetrySample { timestamp: 12, speed: 1500, cadence: 180, heart_rate: 142, power: 210 }
        );
    }

    #[test]
    fn rejects_malformed_line() {
        assert!(parse_csv_line("not,a,valid,csv,line").is_none());
        assert!(parse_csv_line("1,2,3").is_none());
    }

    #[test]
    fn loads_activity_file_skipping_blanks_and_comments() {
        let mut tmp = tempfile_like_path();
        {
            let mut f = File::create(&tmp).unwrap();
            writeln!(f, "# header comment").unwrap();
            writeln!(f).unwrap();
            writeln!(f, "0,1500,180,140,200").unwrap();
            writeln!(f, "1,1510,181,141,205").unwrap();
        }
        let mut source = ActivityFileSource::load(&tmp).unwrap();
        assert_eq!(source.next_sample().unwrap().power, 200);
        assert_eq!(source.next_sample().unwrap().power, 205);
        assert!(source.next_sample().is_none());
        std::fs::remove_file(&tmp).ok();
        let _ = &mut tmp;
    }

    fn tempfile_like_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("dircon-telemetry-test-{:?}.csv", std::thread::current().id()))
    }
}
