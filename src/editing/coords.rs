//! Pixel <-> sample conversion for the plotted time window.

use serde::{Deserialize, Serialize};

/// The visible time range and where the plot area sits horizontally.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewWindow {
    pub start_time: f64,
    pub end_time: f64,
    pub plot_origin: f64,
    pub plot_width: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateMapper {
    pub view: ViewWindow,
    pub sampling_rate: f64,
}

impl CoordinateMapper {
    pub fn new(view: ViewWindow, sampling_rate: f64) -> Self {
        Self { view, sampling_rate }
    }

    /// `None` means the geometry cannot produce a sample (empty plot, bad
    /// rate, non-finite time); callers treat it as a no-op.
    pub fn to_sample_index(&self, pixel_x: f64) -> Option<i64> {
        let view = &self.view;
        if !(view.plot_width > 0.0) || !(self.sampling_rate > 0.0) {
            return None;
        }

        let fraction = (pixel_x - view.plot_origin) / view.plot_width;
        let time = view.start_time + fraction * (view.end_time - view.start_time);
        if !time.is_finite() {
            return None;
        }

        let sample = (time * self.sampling_rate).round();
        if !sample.is_finite() || sample < i64::MIN as f64 || sample > i64::MAX as f64 {
            return None;
        }
        Some(sample as i64)
    }

    pub fn to_elapsed_time(&self, sample: i64) -> Option<f64> {
        if self.sampling_rate > 0.0 {
            Some(sample as f64 / self.sampling_rate)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(width: f64) -> CoordinateMapper {
        CoordinateMapper::new(
            ViewWindow {
                start_time: 0.0,
                end_time: 8.0,
                plot_origin: 40.0,
                plot_width: width,
            },
            250.0,
        )
    }

    #[test]
    fn maps_pixels_across_the_window() {
        let m = mapper(800.0);
        assert_eq!(m.to_sample_index(40.0), Some(0));
        assert_eq!(m.to_sample_index(440.0), Some(1000));
        assert_eq!(m.to_sample_index(840.0), Some(2000));
        assert_eq!(m.to_sample_index(0.0), Some(-100));
    }

    #[test]
    fn rounds_to_nearest_sample() {
        let m = mapper(800.0);
        // 0.01 s per pixel at 250 Hz is 2.5 samples per pixel.
        assert_eq!(m.to_sample_index(40.2), Some(1));
        assert_eq!(m.to_sample_index(40.1), Some(0));
    }

    #[test]
    fn degenerate_geometry_is_invalid_not_a_panic() {
        assert_eq!(mapper(0.0).to_sample_index(100.0), None);
        assert_eq!(mapper(-5.0).to_sample_index(100.0), None);
        assert_eq!(mapper(f64::NAN).to_sample_index(100.0), None);
        assert_eq!(mapper(800.0).to_sample_index(f64::INFINITY), None);

        let no_rate = CoordinateMapper::new(mapper(800.0).view, 0.0);
        assert_eq!(no_rate.to_sample_index(100.0), None);
        assert_eq!(no_rate.to_elapsed_time(10), None);
    }

    #[test]
    fn sample_back_to_time() {
        assert_eq!(mapper(800.0).to_elapsed_time(500), Some(2.0));
    }
}
