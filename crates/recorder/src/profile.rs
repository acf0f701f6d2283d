//! Recording modes, capture profiles and the mode/depth coupling table

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use camera_capture::{CameraConfig, DepthLevel, Resolution};
use serde::{Deserialize, Serialize};

/// What a session writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMode {
    /// Hardware-compressed container only
    #[default]
    CompressedOnly,
    /// Container plus raw float depth records
    CompressedWithDepthMetadata,
    /// Container plus grayscale depth images
    CompressedWithDepthImages,
    /// Per-frame left/right JPEGs (and depth records), no container
    RawMultiStream,
}

/// How a mode constrains the depth level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthRequirement {
    Forbidden,
    Required,
    Optional,
}

impl RecordingMode {
    pub const ALL: [RecordingMode; 4] = [
        RecordingMode::CompressedOnly,
        RecordingMode::CompressedWithDepthMetadata,
        RecordingMode::CompressedWithDepthImages,
        RecordingMode::RawMultiStream,
    ];

    pub fn depth_requirement(self) -> DepthRequirement {
        match self {
            RecordingMode::CompressedOnly => DepthRequirement::Forbidden,
            RecordingMode::CompressedWithDepthMetadata
            | RecordingMode::CompressedWithDepthImages => DepthRequirement::Required,
            RecordingMode::RawMultiStream => DepthRequirement::Optional,
        }
    }

    /// Whether the hardware container write target is used
    pub fn uses_container(self) -> bool {
        self != RecordingMode::RawMultiStream
    }

    /// Depth level after switching to this mode from `current`
    pub fn coupled_depth(self, current: DepthLevel) -> DepthLevel {
        match self.depth_requirement() {
            DepthRequirement::Forbidden => DepthLevel::None,
            DepthRequirement::Required if !current.is_enabled() => DepthLevel::DEFAULT_TIER,
            _ => current,
        }
    }

    /// Reject a depth level this mode cannot run with
    pub fn validate_depth(self, depth: DepthLevel) -> Result<(), String> {
        match (self.depth_requirement(), depth.is_enabled()) {
            (DepthRequirement::Forbidden, true) => Err(format!(
                "{} records no depth; select a depth mode before setting {}",
                self, depth
            )),
            (DepthRequirement::Required, false) => Err(format!(
                "{} needs depth computation; NONE is not allowed",
                self
            )),
            _ => Ok(()),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RecordingMode::CompressedOnly => "compressed_only",
            RecordingMode::CompressedWithDepthMetadata => "compressed_with_depth_metadata",
            RecordingMode::CompressedWithDepthImages => "compressed_with_depth_images",
            RecordingMode::RawMultiStream => "raw_multi_stream",
        }
    }
}

impl fmt::Display for RecordingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RecordingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "compressed_only" | "svo" => Ok(RecordingMode::CompressedOnly),
            "compressed_with_depth_metadata" | "svo_depth_info" => {
                Ok(RecordingMode::CompressedWithDepthMetadata)
            }
            "compressed_with_depth_images" | "svo_depth_images" => {
                Ok(RecordingMode::CompressedWithDepthImages)
            }
            "raw_multi_stream" | "raw" => Ok(RecordingMode::RawMultiStream),
            other => Err(format!("unknown recording mode '{}'", other)),
        }
    }
}

/// Parse an operator depth level name (`neural_lite`, `NEURAL-LITE`, ...)
pub fn parse_depth_level(s: &str) -> Result<DepthLevel, String> {
    let level = match s.to_ascii_lowercase().replace('-', "_").as_str() {
        "none" | "off" => DepthLevel::None,
        "performance" => DepthLevel::Performance,
        "quality" => DepthLevel::Quality,
        "ultra" => DepthLevel::Ultra,
        "neural_lite" => DepthLevel::NeuralLite,
        "neural" => DepthLevel::Neural,
        "neural_plus" => DepthLevel::NeuralPlus,
        other => return Err(format!("unknown depth level '{}'", other)),
    };
    Ok(level)
}

/// Supported resolution × frame-rate presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureProfile {
    Hd2k15,
    Hd1080p30,
    #[default]
    Hd720p60,
    Hd720p30,
    Hd720p15,
    Vga100,
}

impl CaptureProfile {
    pub const ALL: [CaptureProfile; 6] = [
        CaptureProfile::Hd2k15,
        CaptureProfile::Hd1080p30,
        CaptureProfile::Hd720p60,
        CaptureProfile::Hd720p30,
        CaptureProfile::Hd720p15,
        CaptureProfile::Vga100,
    ];

    pub fn resolution(self) -> Resolution {
        match self {
            CaptureProfile::Hd2k15 => Resolution::Hd2k,
            CaptureProfile::Hd1080p30 => Resolution::Hd1080,
            CaptureProfile::Hd720p60 | CaptureProfile::Hd720p30 | CaptureProfile::Hd720p15 => {
                Resolution::Hd720
            }
            CaptureProfile::Vga100 => Resolution::Vga,
        }
    }

    pub fn fps(self) -> u32 {
        match self {
            CaptureProfile::Hd2k15 | CaptureProfile::Hd720p15 => 15,
            CaptureProfile::Hd1080p30 | CaptureProfile::Hd720p30 => 30,
            CaptureProfile::Hd720p60 => 60,
            CaptureProfile::Vga100 => 100,
        }
    }

    pub fn camera_config(self, depth: DepthLevel) -> CameraConfig {
        CameraConfig {
            resolution: self.resolution(),
            fps: self.fps(),
            depth,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CaptureProfile::Hd2k15 => "hd2k15",
            CaptureProfile::Hd1080p30 => "hd1080p30",
            CaptureProfile::Hd720p60 => "hd720p60",
            CaptureProfile::Hd720p30 => "hd720p30",
            CaptureProfile::Hd720p15 => "hd720p15",
            CaptureProfile::Vga100 => "vga100",
        }
    }
}

impl fmt::Display for CaptureProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CaptureProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s
            .to_ascii_lowercase()
            .replace('@', "p")
            .replace(['-', '_'], "");
        CaptureProfile::ALL
            .into_iter()
            .find(|p| p.name() == wanted)
            .ok_or_else(|| format!("unknown capture profile '{}'", s))
    }
}

/// Validated mode + depth pair
///
/// Construction enforces the coupling table, so a `ModeSelection` can never
/// hold a depth level its mode forbids or lacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModeSelection {
    mode: RecordingMode,
    depth: DepthLevel,
}

impl Default for ModeSelection {
    fn default() -> Self {
        Self {
            mode: RecordingMode::CompressedOnly,
            depth: DepthLevel::None,
        }
    }
}

impl ModeSelection {
    pub fn new(mode: RecordingMode, depth: DepthLevel) -> Result<Self, String> {
        mode.validate_depth(depth)?;
        Ok(Self { mode, depth })
    }

    /// Switch mode, forcing the depth level to fit it
    pub fn with_mode(self, mode: RecordingMode) -> Self {
        Self {
            mode,
            depth: mode.coupled_depth(self.depth),
        }
    }

    /// Change depth within the current mode
    pub fn with_depth(self, depth: DepthLevel) -> Result<Self, String> {
        Self::new(self.mode, depth)
    }

    pub fn mode(&self) -> RecordingMode {
        self.mode
    }

    pub fn depth(&self) -> DepthLevel {
        self.depth
    }
}

/// Telemetry is sampled every Nth frame
pub fn telemetry_decimation(fps: u32) -> u64 {
    match fps {
        0..=15 => 1,
        16..=30 => 2,
        31..=60 => 3,
        _ => 5,
    }
}

/// Worker idle time between iterations; faster modes sleep less
pub fn worker_sleep(fps: u32) -> Duration {
    let ms = match fps {
        0..=29 => 10,
        30..=59 => 5,
        60..=99 => 3,
        _ => 2,
    };
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_depth() -> impl Strategy<Value = DepthLevel> {
        prop_oneof![
            Just(DepthLevel::None),
            Just(DepthLevel::Performance),
            Just(DepthLevel::Quality),
            Just(DepthLevel::Ultra),
            Just(DepthLevel::NeuralLite),
            Just(DepthLevel::Neural),
            Just(DepthLevel::NeuralPlus),
        ]
    }

    fn any_mode() -> impl Strategy<Value = RecordingMode> {
        (0usize..4).prop_map(|i| RecordingMode::ALL[i])
    }

    #[test]
    fn test_mode_forces_depth() {
        let sel = ModeSelection::default().with_mode(RecordingMode::CompressedWithDepthImages);
        assert_eq!(sel.depth(), DepthLevel::NeuralLite);

        let sel = sel.with_depth(DepthLevel::Ultra).unwrap();
        let sel = sel.with_mode(RecordingMode::CompressedWithDepthMetadata);
        assert_eq!(sel.depth(), DepthLevel::Ultra);

        let sel = sel.with_mode(RecordingMode::CompressedOnly);
        assert_eq!(sel.depth(), DepthLevel::None);

        let sel = sel.with_mode(RecordingMode::RawMultiStream);
        assert_eq!(sel.depth(), DepthLevel::None);
    }

    #[test]
    fn test_invalid_depth_rejected() {
        let sel = ModeSelection::default().with_mode(RecordingMode::CompressedWithDepthImages);
        assert!(sel.with_depth(DepthLevel::None).is_err());
        assert!(ModeSelection::default()
            .with_depth(DepthLevel::Neural)
            .is_err());
    }

    #[test]
    fn test_decimation_and_sleep_table() {
        assert_eq!(telemetry_decimation(15), 1);
        assert_eq!(telemetry_decimation(30), 2);
        assert_eq!(telemetry_decimation(60), 3);
        assert_eq!(telemetry_decimation(100), 5);
        assert_eq!(worker_sleep(100), Duration::from_millis(2));
        assert_eq!(worker_sleep(60), Duration::from_millis(3));
        assert_eq!(worker_sleep(30), Duration::from_millis(5));
        assert_eq!(worker_sleep(15), Duration::from_millis(10));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("raw".parse::<RecordingMode>(), Ok(RecordingMode::RawMultiStream));
        assert_eq!(
            "compressed-with-depth-images".parse::<RecordingMode>(),
            Ok(RecordingMode::CompressedWithDepthImages)
        );
        assert_eq!("HD720@60".parse::<CaptureProfile>(), Ok(CaptureProfile::Hd720p60));
        assert_eq!("vga100".parse::<CaptureProfile>(), Ok(CaptureProfile::Vga100));
        assert!("hd4k".parse::<CaptureProfile>().is_err());
        assert_eq!(parse_depth_level("NEURAL-LITE"), Ok(DepthLevel::NeuralLite));
    }

    #[test]
    fn test_profile_dimensions() {
        assert_eq!(CaptureProfile::Hd2k15.resolution().dimensions(), (2208, 1242));
        assert_eq!(CaptureProfile::Vga100.resolution().dimensions(), (672, 376));
        assert_eq!(CaptureProfile::default(), CaptureProfile::Hd720p60);
    }

    proptest! {
        #[test]
        fn coupled_depth_always_valid(mode in any_mode(), depth in any_depth()) {
            let coupled = mode.coupled_depth(depth);
            prop_assert!(mode.validate_depth(coupled).is_ok());
        }

        #[test]
        fn decimation_grows_with_rate(a in 1u32..200, b in 1u32..200) {
            if a <= b {
                prop_assert!(telemetry_decimation(a) <= telemetry_decimation(b));
                prop_assert!(worker_sleep(a) >= worker_sleep(b));
            }
        }
    }
}
