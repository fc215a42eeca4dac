//! Monocular 2D feature tracking across an image sequence.
//!
//! Every frame pushed into a [`Pipeline`] is run through a pluggable keypoint
//! detector, an optional region of interest and keypoint cap, and a pluggable
//! descriptor extractor. Once two frames are held the newest is matched against
//! the one before it.

pub mod algorithms;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod features;
pub mod frame;
pub mod matcher;
pub mod pipeline;
pub mod window;

pub use config::{DescriptorKind, DetectorKind, MatcherKind, PipelineConfig, RegionOfInterest, SelectorKind};
pub use error::{ConfigError, PipelineError, WindowError};
pub use frame::{DescriptorMatrix, Descriptors, Frame, Keypoint, Match, Representation};
pub use matcher::DescriptorMatcher;
pub use pipeline::{Pipeline, PipelineState, StepReport};
pub use window::FrameWindow;
