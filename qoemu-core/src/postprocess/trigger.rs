//! End-of-content alignment against a reference ("trigger") image.

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::GrayImage;

use super::{PostProcessError, PostProcessResult};
use crate::params::StimulusKey;

/// Frames within this distance of the incumbent only need a significant improvement.
pub const NEW_SCENE_FRAME_THRESHOLD: usize = 60;
const SIGNIFICANT_FACTOR: f64 = 1.02;
const SUBSTANTIAL_FACTOR: f64 = 1.2;
/// Histogram bins counted as "equal" at either end of the wrapped difference.
const TAIL_BINS: usize = 9;

/// Reference image for a key: `<dir>/<key>.png`, falling back to `<dir>/<type>.png`.
pub fn trigger_image_for(dir: &Path, key: &StimulusKey) -> Option<PathBuf> {
    [format!("{key}.png"), format!("{}.png", key.type_id)]
        .into_iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

pub fn load_reference(path: &Path) -> PostProcessResult<GrayImage> {
    Ok(image::open(path)
        .map_err(|err| PostProcessError::Image(format!("{}: {err}", path.display())))?
        .to_luma8())
}

/// Counts pixels whose wrapped grayscale difference lies in the black or white tail.
pub fn match_score(frame: &GrayImage, reference: &GrayImage) -> u64 {
    let resized;
    let frame = if frame.dimensions() == reference.dimensions() {
        frame
    } else {
        resized = image::imageops::resize(
            frame,
            reference.width(),
            reference.height(),
            FilterType::Triangle,
        );
        &resized
    };
    let mut histogram = [0u64; 256];
    for (pixel, reference) in frame.pixels().zip(reference.pixels()) {
        histogram[usize::from(pixel.0[0].wrapping_sub(reference.0[0]))] += 1;
    }
    histogram[..TAIL_BINS].iter().sum::<u64>() + histogram[256 - TAIL_BINS..].iter().sum::<u64>()
}

/// Picks the best matching frame index.
///
/// Close to the incumbent a candidate must beat it by a significant margin;
/// further away (a new scene) only a substantially better match displaces it.
pub fn select_best(scores: &[u64]) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (index, &score) in scores.iter().enumerate() {
        let Some((best_index, best_score)) = best else {
            best = Some((index, score));
            continue;
        };
        let factor = if index - best_index <= NEW_SCENE_FRAME_THRESHOLD {
            SIGNIFICANT_FACTOR
        } else {
            SUBSTANTIAL_FACTOR
        };
        if score as f64 > best_score as f64 * factor {
            best = Some((index, score));
        }
    }
    best.map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn identical_frames_score_every_pixel() {
        let reference = GrayImage::from_pixel(4, 4, Luma([120]));
        assert_eq!(match_score(&reference, &reference), 16);

        let darker = GrayImage::from_pixel(4, 4, Luma([116]));
        assert_eq!(match_score(&darker, &reference), 16);

        let different = GrayImage::from_pixel(4, 4, Luma([10]));
        assert_eq!(match_score(&different, &reference), 0);
    }

    #[test]
    fn frames_are_scaled_to_the_reference() {
        let reference = GrayImage::from_pixel(2, 2, Luma([200]));
        let frame = GrayImage::from_pixel(8, 8, Luma([200]));
        assert_eq!(match_score(&frame, &reference), 4);
    }

    #[test]
    fn nearby_frames_need_significant_gain() {
        assert_eq!(select_best(&[100, 101, 103]), Some(2));
        assert_eq!(select_best(&[100, 101, 102]), Some(0));
    }

    #[test]
    fn distant_frames_need_substantial_gain() {
        let mut scores = vec![0u64; 80];
        scores[0] = 100;
        scores[70] = 110;
        assert_eq!(select_best(&scores), Some(0));
        scores[75] = 130;
        assert_eq!(select_best(&scores), Some(75));
        assert_eq!(select_best(&[]), None);
    }

    #[test]
    fn trigger_lookup_falls_back_to_type() {
        let dir = tempfile::tempdir().unwrap();
        let key = StimulusKey::new("VS", "A", "1");
        assert_eq!(trigger_image_for(dir.path(), &key), None);
        std::fs::write(dir.path().join("VS.png"), b"png").unwrap();
        assert_eq!(
            trigger_image_for(dir.path(), &key),
            Some(dir.path().join("VS.png"))
        );
        std::fs::write(dir.path().join("VS-A-1.png"), b"png").unwrap();
        assert_eq!(
            trigger_image_for(dir.path(), &key),
            Some(dir.path().join("VS-A-1.png"))
        );
    }
}
