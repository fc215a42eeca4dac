use std::time::{Duration, Instant};

use image::GrayImage;
use log::{debug, warn};

use crate::{
    config::PipelineConfig,
    diagnostics::DiagnosticSink,
    error::{ConfigError, Result, WindowError},
    features::{
        detect_with, detector_for, extract_with, extractor_for, filter_to_region, retain_best,
        DescriptorExtractor, KeypointDetector,
    },
    frame::{Frame, Keypoint},
    matcher::DescriptorMatcher,
    window::FrameWindow,
};

/// Whether the window holds a previous frame to match against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    /// Fewer than two frames seen, only detection and description run.
    #[default]
    Priming,
    /// Every new frame is also matched against the one before it.
    Steady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageTimings {
    /// Detection, region filtering and the optional keypoint cap.
    pub detect: Duration,
    pub describe: Duration,
    /// `None` while priming.
    pub matching: Option<Duration>,
}

/// Summary of one processed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub frame_index: usize,
    /// State after the frame was pushed.
    pub state: PipelineState,
    pub keypoints_detected: usize,
    /// Keypoints left after the region filter and the keypoint cap.
    pub keypoints_retained: usize,
    /// Keypoints the extractor could describe, one descriptor row each.
    pub descriptor_rows: usize,
    pub matches: Option<usize>,
    pub timings: StageTimings,
}

/// Detect, filter, describe and match, one frame at a time.
pub struct Pipeline {
    config: PipelineConfig,
    detector: Box<dyn KeypointDetector>,
    extractor: Box<dyn DescriptorExtractor>,
    matcher: DescriptorMatcher,
    window: FrameWindow<Frame>,
    frames_seen: usize,
    sinks: Vec<Box<dyn DiagnosticSink>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> std::result::Result<Self, ConfigError> {
        let detector = detector_for(config.detector);
        let extractor = extractor_for(config.descriptor);
        Self::with_components(config, detector, extractor)
    }

    /// Build around explicit strategies. The matcher metric follows the
    /// representation of `extractor`.
    pub fn with_components(
        config: PipelineConfig,
        detector: Box<dyn KeypointDetector>,
        extractor: Box<dyn DescriptorExtractor>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let window = FrameWindow::new(config.window_capacity)?;
        let matcher = DescriptorMatcher::new(config.matcher, config.selector, extractor.representation());

        Ok(Self {
            config,
            detector,
            extractor,
            matcher,
            window,
            frames_seen: 0,
            sinks: Vec::new(),
        })
    }

    pub fn with_sink(mut self, sink: Box<dyn DiagnosticSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn state(&self) -> PipelineState {
        if self.window.len() >= 2 {
            PipelineState::Steady
        } else {
            PipelineState::Priming
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn window(&self) -> &FrameWindow<Frame> {
        &self.window
    }

    pub fn current(&self) -> Option<&Frame> {
        self.window.most_recent()
    }

    pub fn previous(&self) -> Option<&Frame> {
        self.window.by_recency(1).ok()
    }

    /// Push `image` as a new frame and run every stage on it.
    ///
    /// The frame enters the window before any stage runs, so on error it stays
    /// there partially processed. Errors are fatal to the run.
    pub fn process(&mut self, image: GrayImage) -> Result<StepReport> {
        let frame_index = self.frames_seen;
        self.frames_seen += 1;
        self.window.push(Frame::new(frame_index, image));
        let frame = self.window.most_recent_mut().ok_or(WindowError::Empty)?;

        let start = Instant::now();
        let detected = detect_with(self.detector.as_ref(), &frame.image);
        let keypoints_detected = detected.len();
        let mut keypoints = match &self.config.region {
            Some(region) => filter_to_region(&detected, region),
            None => detected,
        };
        if let Some(limit) = self.config.keypoint_limit {
            keypoints = retain_best(keypoints, limit);
        }
        let keypoints_retained = keypoints.len();
        let detect = start.elapsed();

        let start = Instant::now();
        let extraction = extract_with(self.extractor.as_ref(), &frame.image, &keypoints);
        let descriptor_rows = extraction.descriptors.rows();
        frame.keypoints = extraction.keypoints;
        frame.descriptors = Some(extraction.descriptors);
        let describe = start.elapsed();

        let state = self.state();
        let (matches, matching) = match state {
            PipelineState::Priming => (None, None),
            PipelineState::Steady => {
                let start = Instant::now();
                let (previous, current) = self.window.pair_mut(1, 0)?;
                current.matches = match (&previous.descriptors, &current.descriptors) {
                    (Some(source), Some(reference)) => self.matcher.match_descriptors(source, reference)?,
                    _ => Vec::new(),
                };
                (Some(current.matches.len()), Some(start.elapsed()))
            }
        };

        let report = StepReport {
            frame_index,
            state,
            keypoints_detected,
            keypoints_retained,
            descriptor_rows,
            matches,
            timings: StageTimings {
                detect,
                describe,
                matching,
            },
        };
        debug!(
            "frame {frame_index}: {keypoints_detected} detected, {keypoints_retained} retained, {descriptor_rows} described, {matches:?} matches"
        );

        self.notify_sinks(&report, &keypoints);
        Ok(report)
    }

    /// Process every image in order, stopping at the first error.
    pub fn run<I>(&mut self, images: I) -> Result<Vec<StepReport>>
    where
        I: IntoIterator<Item = GrayImage>,
    {
        let reports = images
            .into_iter()
            .map(|image| self.process(image))
            .collect::<Result<Vec<_>>>()?;
        self.flush_sinks();
        Ok(reports)
    }

    pub fn flush_sinks(&mut self) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.flush() {
                warn!("Failed to flush diagnostics: {e}");
            }
        }
    }

    // sinks are side channels, their failures never abort a step
    fn notify_sinks(&mut self, report: &StepReport, retained: &[Keypoint]) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.record_keypoints(report.frame_index, retained) {
                warn!("Failed to record keypoints of frame {}: {e}", report.frame_index);
            }
            if let Err(e) = sink.record_step(report) {
                warn!("Failed to record step {}: {e}", report.frame_index);
            }
        }
    }
}
