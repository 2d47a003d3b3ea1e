//! Filter graphs for synthetic buffering and loudness handling.

use std::fmt::Write;

use serde::Deserialize;

use super::{PostProcessError, PostProcessResult};
use crate::params::StimulusParameters;

const PAUSE_AUDIO: &str = "anullsrc=r=48000:cl=stereo";

/// One inserted pause: position in the source and length, both in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pause {
    pub at: f64,
    pub length: f64,
}

/// Pauses for a clip of `duration` seconds: `t_init` at zero, then `genbufn` equally spaced stalls.
pub fn plan_pauses(params: &StimulusParameters, duration: f64) -> Vec<Pause> {
    let mut pauses = Vec::new();
    if params.t_init > 0 {
        pauses.push(Pause {
            at: 0.0,
            length: params.t_init as f64 / 1000.0,
        });
    }
    if params.genbufn > 0 && params.genbuft > 0 {
        let count = params.genbufn;
        for index in 1..=count {
            pauses.push(Pause {
                at: duration * f64::from(index) / f64::from(count + 1),
                length: params.genbuft as f64 / 1000.0,
            });
        }
    }
    pauses
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub duration: f64,
}

#[derive(Debug, Deserialize)]
struct ProbeInfo {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Reads `ffprobe -show_entries stream=width,height,r_frame_rate:format=duration -of json`.
pub fn parse_video_info(json: &str) -> PostProcessResult<VideoInfo> {
    let probe: ProbeInfo = serde_json::from_str(json)
        .map_err(|err| PostProcessError::Probe(format!("stream info: {err}")))?;
    let stream = probe
        .streams
        .iter()
        .find(|stream| stream.width.is_some())
        .ok_or_else(|| PostProcessError::Probe("no video stream".into()))?;
    let frame_rate = stream
        .r_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .ok_or_else(|| PostProcessError::Probe("no frame rate".into()))?;
    let duration = probe
        .format
        .and_then(|format| format.duration)
        .and_then(|value| value.parse::<f64>().ok())
        .ok_or_else(|| PostProcessError::Probe("no duration".into()))?;
    Ok(VideoInfo {
        width: stream.width.unwrap_or_default(),
        height: stream.height.unwrap_or_default(),
        frame_rate,
        duration,
    })
}

fn parse_rate(value: &str) -> Option<f64> {
    match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            (den != 0.0).then(|| num / den)
        }
        None => value.parse().ok(),
    }
}

/// Builds the `filter_complex` graph splicing black pauses into the clip.
///
/// Input 0 is the clip; with `spinner` set, input 1 is a looped overlay image.
/// The graph exposes `[outv]` and `[outa]`.
pub fn buffering_filter(pauses: &[Pause], video: &VideoInfo, spinner: bool) -> String {
    let mut pauses: Vec<Pause> = pauses.to_vec();
    pauses.sort_by(|a, b| a.at.total_cmp(&b.at));

    let mut graph = String::new();
    let mut concat_inputs = String::new();
    let mut parts = 0usize;
    let mut cursor = 0.0f64;

    if spinner && !pauses.is_empty() {
        let _ = write!(graph, "[1:v]split={}", pauses.len());
        for index in 0..pauses.len() {
            let _ = write!(graph, "[s{index}]");
        }
        graph.push(';');
    }

    for (index, pause) in pauses.iter().enumerate() {
        let at = pause.at.clamp(0.0, video.duration);
        if at > cursor {
            push_segment(&mut graph, &mut concat_inputs, parts, cursor, Some(at));
            parts += 1;
        }
        let _ = write!(
            graph,
            "color=c=black:s={}x{}:r={}:d={:.3}[p{index}];",
            video.width,
            video.height,
            format_rate(video.frame_rate),
            pause.length
        );
        let pause_video = if spinner {
            let _ = write!(
                graph,
                "[p{index}][s{index}]overlay=(W-w)/2:(H-h)/2:shortest=1[pv{index}];"
            );
            format!("[pv{index}]")
        } else {
            format!("[p{index}]")
        };
        let _ = write!(
            graph,
            "{PAUSE_AUDIO},atrim=duration={:.3}[pa{index}];",
            pause.length
        );
        let _ = write!(concat_inputs, "{pause_video}[pa{index}]");
        parts += 1;
        cursor = at;
    }
    if cursor < video.duration || parts == 0 {
        push_segment(&mut graph, &mut concat_inputs, parts, cursor, None);
        parts += 1;
    }
    let _ = write!(graph, "{concat_inputs}concat=n={parts}:v=1:a=1[outv][outa]");
    graph
}

fn push_segment(graph: &mut String, inputs: &mut String, index: usize, start: f64, end: Option<f64>) {
    let (video_trim, audio_trim) = match end {
        Some(end) => (
            format!("trim=start={start:.3}:end={end:.3}"),
            format!("atrim=start={start:.3}:end={end:.3}"),
        ),
        None => (
            format!("trim=start={start:.3}"),
            format!("atrim=start={start:.3}"),
        ),
    };
    let _ = write!(
        graph,
        "[0:v]{video_trim},setpts=PTS-STARTPTS[v{index}];[0:a]{audio_trim},asetpts=PTS-STARTPTS[a{index}];"
    );
    let _ = write!(inputs, "[v{index}][a{index}]");
}

fn format_rate(rate: f64) -> String {
    if rate.fract() == 0.0 {
        format!("{}", rate as u64)
    } else {
        format!("{rate:.3}")
    }
}

/// Reads `max_volume` from a `volumedetect` report on stderr.
pub fn parse_max_volume(stderr: &str) -> Option<f64> {
    stderr.lines().find_map(|line| {
        let (_, rest) = line.split_once("max_volume:")?;
        rest.trim().trim_end_matches("dB").trim().parse().ok()
    })
}

/// Audio filter chain: gain to the target level, then silence for every erase region.
pub fn loudness_filter(gain_db: f64, erase: &[(f64, f64)]) -> String {
    let mut filter = format!("volume={gain_db:.2}dB");
    for (start, stop) in erase {
        let _ = write!(filter, ",volume=0:enable='between(t,{start},{stop})'");
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video() -> VideoInfo {
        VideoInfo {
            width: 1080,
            height: 1920,
            frame_rate: 30.0,
            duration: 30.0,
        }
    }

    #[test]
    fn plans_initial_and_mid_stream_pauses() {
        let params = StimulusParameters {
            t_init: 2_000,
            genbufn: 2,
            genbuft: 1_500,
            ..Default::default()
        };
        let pauses = plan_pauses(&params, 30.0);
        assert_eq!(
            pauses,
            vec![
                Pause { at: 0.0, length: 2.0 },
                Pause { at: 10.0, length: 1.5 },
                Pause { at: 20.0, length: 1.5 },
            ]
        );
        assert!(plan_pauses(&StimulusParameters::default(), 30.0).is_empty());
    }

    #[test]
    fn initial_pause_precedes_whole_clip() {
        let graph = buffering_filter(&[Pause { at: 0.0, length: 2.0 }], &video(), false);
        assert_eq!(
            graph,
            "color=c=black:s=1080x1920:r=30:d=2.000[p0];\
             anullsrc=r=48000:cl=stereo,atrim=duration=2.000[pa0];\
             [0:v]trim=start=0.000,setpts=PTS-STARTPTS[v1];\
             [0:a]atrim=start=0.000,asetpts=PTS-STARTPTS[a1];\
             [p0][pa0][v1][a1]concat=n=2:v=1:a=1[outv][outa]"
        );
    }

    #[test]
    fn mid_stream_pause_splits_clip_with_spinner() {
        let graph = buffering_filter(&[Pause { at: 15.0, length: 1.0 }], &video(), true);
        assert!(graph.starts_with("[1:v]split=1[s0];"));
        assert!(graph.contains("[0:v]trim=start=0.000:end=15.000,setpts=PTS-STARTPTS[v0]"));
        assert!(graph.contains("[p0][s0]overlay=(W-w)/2:(H-h)/2:shortest=1[pv0]"));
        assert!(graph.contains("[0:v]trim=start=15.000,setpts=PTS-STARTPTS[v2]"));
        assert!(graph.ends_with("[v0][a0][pv0][pa0][v2][a2]concat=n=3:v=1:a=1[outv][outa]"));
    }

    #[test]
    fn reads_probe_and_loudness_output() {
        let json = r#"{"programs":[],"streams":[{"width":1080,"height":2340,"r_frame_rate":"30000/1001"}],"format":{"duration":"34.533333"}}"#;
        let info = parse_video_info(json).unwrap();
        assert_eq!((info.width, info.height), (1080, 2340));
        assert!((info.frame_rate - 29.97).abs() < 0.01);
        assert!((info.duration - 34.533333).abs() < 1e-9);

        let stderr = "[Parsed_volumedetect_0 @ 0x5581] mean_volume: -21.4 dB\n[Parsed_volumedetect_0 @ 0x5581] max_volume: -5.3 dB\n";
        assert_eq!(parse_max_volume(stderr), Some(-5.3));
        assert_eq!(parse_max_volume("nothing"), None);

        assert_eq!(
            loudness_filter(3.3, &[(0.0, 0.5)]),
            "volume=3.30dB,volume=0:enable='between(t,0,0.5)'"
        );
    }
}
