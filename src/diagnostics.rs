//! Write-only side channels fed by the pipeline after every step.

use std::{
    fs::File,
    io::{self, Write},
    path::Path,
    time::Duration,
};

use serde::Serialize;

use crate::{
    frame::Keypoint,
    pipeline::{PipelineState, StepReport},
};

/// Receives per-frame diagnostics. Both hooks default to doing nothing, so a
/// sink only implements what it records.
pub trait DiagnosticSink {
    /// Keypoints kept after the region filter and the keypoint cap.
    fn record_keypoints(&mut self, _frame_index: usize, _keypoints: &[Keypoint]) -> io::Result<()> {
        Ok(())
    }

    fn record_step(&mut self, _report: &StepReport) -> io::Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct KeypointRow {
    frame_id: usize,
    x: f32,
    y: f32,
    neighbour_size: f32,
}

/// `frame_id,x,y,neighbour_size`, one row per retained keypoint.
pub struct KeypointCsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl KeypointCsvSink<File> {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::from_writer(File::create(path)?))
    }
}

impl<W: Write> KeypointCsvSink<W> {
    pub fn from_writer(writer: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(writer),
        }
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.writer.into_inner().map_err(|e| e.into_error())
    }
}

impl<W: Write> DiagnosticSink for KeypointCsvSink<W> {
    fn record_keypoints(&mut self, frame_index: usize, keypoints: &[Keypoint]) -> io::Result<()> {
        for keypoint in keypoints {
            self.writer.serialize(KeypointRow {
                frame_id: frame_index,
                x: keypoint.x(),
                y: keypoint.y(),
                neighbour_size: keypoint.size,
            })?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[derive(Debug, Serialize)]
struct MatchRow {
    frame_id: usize,
    matched_keypoints: usize,
    /// Milliseconds.
    detect_time: f64,
    extract_time: f64,
}

/// `frame_id,matched_keypoints,detect_time,extract_time` for every step that
/// ran the matcher; times are in milliseconds.
pub struct MatchCsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl MatchCsvSink<File> {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::from_writer(File::create(path)?))
    }
}

impl<W: Write> MatchCsvSink<W> {
    pub fn from_writer(writer: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(writer),
        }
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.writer.into_inner().map_err(|e| e.into_error())
    }
}

impl<W: Write> DiagnosticSink for MatchCsvSink<W> {
    fn record_step(&mut self, report: &StepReport) -> io::Result<()> {
        let Some(matched_keypoints) = report.matches else {
            return Ok(());
        };
        if report.state != PipelineState::Steady {
            return Ok(());
        }

        self.writer.serialize(MatchRow {
            frame_id: report.frame_index,
            matched_keypoints,
            detect_time: millis(report.timings.detect),
            extract_time: millis(report.timings.describe),
        })?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageTimings;

    fn report(frame_index: usize, matches: Option<usize>) -> StepReport {
        StepReport {
            frame_index,
            state: if matches.is_some() {
                PipelineState::Steady
            } else {
                PipelineState::Priming
            },
            keypoints_detected: 10,
            keypoints_retained: 4,
            descriptor_rows: 4,
            matches,
            timings: StageTimings {
                detect: Duration::from_micros(1500),
                describe: Duration::from_millis(2),
                matching: matches.map(|_| Duration::from_millis(1)),
            },
        }
    }

    #[test]
    fn keypoint_rows_carry_position_and_size() {
        let mut sink = KeypointCsvSink::from_writer(Vec::new());
        sink.record_keypoints(3, &[Keypoint::new(540.5, 200.0, 7.0), Keypoint::new(600.0, 250.25, 31.0)])
            .unwrap();
        let written = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(
            written,
            "frame_id,x,y,neighbour_size\n3,540.5,200.0,7.0\n3,600.0,250.25,31.0\n"
        );
    }

    #[test]
    fn priming_steps_are_not_recorded() {
        let mut sink = MatchCsvSink::from_writer(Vec::new());
        sink.record_step(&report(0, None)).unwrap();
        sink.record_step(&report(1, Some(12))).unwrap();
        let written = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(
            written,
            "frame_id,matched_keypoints,detect_time,extract_time\n1,12,1.5,2.0\n"
        );
    }
}
