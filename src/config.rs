use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, frame::Representation};

/// Declares a closed set of algorithm identifiers.
///
/// Every identifier parses case-insensitively from its canonical name or any of
/// its aliases, prints as its canonical name, and (de)serializes through the
/// same string form so configuration files and command lines agree.
macro_rules! identifier {
    (
        $(#[$meta:meta])*
        $name:ident, $unknown:ident {
            $( $variant:ident => $canonical:literal $(| $alias:literal)* ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every supported identifier, in presentation order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $canonical),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($canonical $(| $alias)* => Ok($name::$variant),)+
                    _ => Err(ConfigError::$unknown(s.to_owned())),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = ConfigError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.name().to_owned()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

identifier! {
    /// Keypoint detection algorithm.
    DetectorKind, UnknownDetector {
        ShiTomasi => "SHITOMASI" | "SHI_TOMASI" | "SHI-TOMASI",
        Harris => "HARRIS",
        Fast => "FAST",
        Brisk => "BRISK",
        Orb => "ORB",
        Akaze => "AKAZE",
        Sift => "SIFT",
    }
}

identifier! {
    /// Descriptor extraction algorithm.
    DescriptorKind, UnknownDescriptor {
        Brisk => "BRISK",
        Brief => "BRIEF",
        Orb => "ORB",
        Freak => "FREAK",
        Akaze => "AKAZE",
        Sift => "SIFT",
    }
}

identifier! {
    /// Nearest neighbour search backend.
    MatcherKind, UnknownMatcher {
        BruteForce => "MAT_BF" | "BF" | "BRUTEFORCE" | "BRUTE_FORCE",
        FlannApprox => "MAT_FLANN" | "FLANN" | "FLANNAPPROX" | "FLANN_APPROX",
    }
}

identifier! {
    /// Match selection policy.
    SelectorKind, UnknownSelector {
        BestSingle => "SEL_NN" | "NN" | "BESTSINGLE" | "BEST_SINGLE",
        KBestRatio => "SEL_KNN" | "KNN" | "KBESTRATIO" | "KBEST_RATIO" | "K_BEST_RATIO",
    }
}

impl DescriptorKind {
    /// The element representation each descriptor algorithm produces.
    ///
    /// This is the only place the representation of an algorithm is decided;
    /// the matcher derives its metric from it.
    pub fn representation(self) -> Representation {
        match self {
            DescriptorKind::Sift => Representation::Float,
            DescriptorKind::Brisk
            | DescriptorKind::Brief
            | DescriptorKind::Orb
            | DescriptorKind::Freak
            | DescriptorKind::Akaze => Representation::Binary,
        }
    }
}

/// Axis aligned rectangle in image coordinates, containment is half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl RegionOfInterest {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// `x <= px < x + width && y <= py < y + height`
    pub fn contains(&self, px: f32, py: f32) -> bool {
        let (x0, y0) = (self.x as f32, self.y as f32);
        let (x1, y1) = (x0 + self.width as f32, y0 + self.height as f32);
        x0 <= px && px < x1 && y0 <= py && py < y1
    }
}

impl Default for RegionOfInterest {
    /// The preceding vehicle in the KITTI sequences.
    fn default() -> Self {
        Self::new(535, 180, 180, 150)
    }
}

/// Parameters fixed for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_detector")]
    pub detector: DetectorKind,
    #[serde(default = "default_descriptor")]
    pub descriptor: DescriptorKind,
    #[serde(default = "default_matcher")]
    pub matcher: MatcherKind,
    #[serde(default = "default_selector")]
    pub selector: SelectorKind,
    /// Keypoints outside this rectangle are discarded. `None` keeps everything.
    #[serde(default = "default_region")]
    pub region: Option<RegionOfInterest>,
    /// Number of frames held at once.
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    /// Keep only the strongest N keypoints per frame.
    #[serde(default)]
    pub keypoint_limit: Option<usize>,
}

fn default_detector() -> DetectorKind {
    DetectorKind::ShiTomasi
}

fn default_descriptor() -> DescriptorKind {
    DescriptorKind::Brisk
}

fn default_matcher() -> MatcherKind {
    MatcherKind::BruteForce
}

fn default_selector() -> SelectorKind {
    SelectorKind::BestSingle
}

fn default_region() -> Option<RegionOfInterest> {
    Some(RegionOfInterest::default())
}

fn default_window_capacity() -> usize {
    2
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detector: default_detector(),
            descriptor: default_descriptor(),
            matcher: default_matcher(),
            selector: default_selector(),
            region: default_region(),
            window_capacity: default_window_capacity(),
            keypoint_limit: None,
        }
    }
}

impl PipelineConfig {
    pub fn new(
        detector: DetectorKind,
        descriptor: DescriptorKind,
        matcher: MatcherKind,
        selector: SelectorKind,
    ) -> Self {
        Self {
            detector,
            descriptor,
            matcher,
            selector,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_capacity == 0 {
            return Err(ConfigError::InvalidCapacity(self.window_capacity));
        }
        if self.keypoint_limit == Some(0) {
            return Err(ConfigError::InvalidKeypointLimit);
        }
        Ok(())
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, JSON when the extension says so and YAML otherwise.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::from_json_str(&contents),
            _ => Self::from_yaml_str(&contents),
        }
    }
}
