//! Start-of-content detection on differential frame sizes.

use serde::Deserialize;

use super::{PostProcessError, PostProcessResult};

/// Dips below the normal threshold tolerated inside one candidate run.
pub const DEFAULT_TOLERANCE: u32 = 4;
const HIGH_RELEVANCE_WEIGHT: u32 = 3;
const AT_MINIMUM_EPSILON: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    /// Presentation time in seconds.
    pub time: f64,
    /// Packet size in bytes.
    pub size: u64,
    pub key_frame: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartDetector {
    pub normal: u64,
    pub high: u64,
    pub required: u32,
    pub tolerance: u32,
}

impl StartDetector {
    pub fn new(normal: u64, high: u64, required: u32) -> Self {
        Self {
            normal,
            high,
            required,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    /// Returns the time of the first frame of the first run that accumulates enough weight.
    pub fn detect(&self, frames: &[FrameInfo], min_time: f64) -> PostProcessResult<f64> {
        let mut candidate: Option<f64> = None;
        let mut weight = 0u32;
        let mut dips = 0u32;
        let mut committed = None;

        for frame in frames
            .iter()
            .filter(|frame| !frame.key_frame && frame.time >= min_time)
        {
            if frame.size > self.normal {
                let start = *candidate.get_or_insert(frame.time);
                weight += if frame.size > self.high {
                    HIGH_RELEVANCE_WEIGHT
                } else {
                    1
                };
                if weight >= self.required {
                    committed = Some(start);
                    break;
                }
            } else if candidate.is_some() {
                dips += 1;
                if dips > self.tolerance {
                    candidate = None;
                    weight = 0;
                    dips = 0;
                }
            }
        }

        let start = committed.ok_or(PostProcessError::StartNotDetected)?;
        if (start - min_time).abs() < AT_MINIMUM_EPSILON {
            return Err(PostProcessError::StartAtMinimum { at: start });
        }
        Ok(start)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeFrames {
    #[serde(default)]
    frames: Vec<ProbeFrame>,
}

#[derive(Debug, Deserialize)]
struct ProbeFrame {
    #[serde(default)]
    key_frame: u8,
    pts_time: Option<String>,
    pkt_pts_time: Option<String>,
    pkt_size: Option<String>,
}

/// Reads `ffprobe -show_frames -of json` output; frames without a time or size are dropped.
pub fn parse_probe_frames(json: &str) -> PostProcessResult<Vec<FrameInfo>> {
    let probe: ProbeFrames = serde_json::from_str(json)
        .map_err(|err| PostProcessError::Probe(format!("frame list: {err}")))?;
    Ok(probe
        .frames
        .into_iter()
        .filter_map(|frame| {
            let time = frame
                .pts_time
                .or(frame.pkt_pts_time)?
                .parse::<f64>()
                .ok()?;
            let size = frame.pkt_size?.parse::<u64>().ok()?;
            Some(FrameInfo {
                time,
                size,
                key_frame: frame.key_frame == 1,
            })
        })
        .collect())
}
