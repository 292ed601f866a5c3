//! Even distribution of whole-millisecond timer periods across one second.
//!
//! At 30 frames per second the ideal period is 33.333 ms. A timer that can only wait whole
//! milliseconds would drift by 10 ms every second if it always waited 33 ms, so instead the
//! integer deficit is spread across the second, one extra (or one fewer) millisecond at a time.

use crate::core::Ticks;

/// Millisecond wait period for every frame index in a second; always sums to 1000
pub fn frame_periods(frames_per_second: u32) -> Vec<u32> {
    let frames = frames_per_second.clamp(1, 1000) as i64;
    let frame_rate = (1000.0_f64 / frames as f64).round() as i64;
    let deficit = 1000 - frame_rate * frames;

    (0..frames)
        .map(|index| period_for_frame(index, frames, frame_rate, deficit) as u32)
        .collect()
}

fn period_for_frame(index: i64, frames: i64, frame_rate: i64, deficit: i64) -> i64 {
    if deficit == 0 || index == 0 {
        return frame_rate;
    }

    let correction = if deficit > 0 { 1 } else { -1 };

    if index == frames - 1 {
        return frame_rate + correction;
    }

    // A correction lands on the index sitting closest to each multiple of the correction
    // interval, so adjustments are spread out instead of bunched at the end of the second.
    let interval = frames as f64 / deficit.abs() as f64;
    let previous = modular_distance(index - 1, interval);
    let current = modular_distance(index, interval);
    let next = modular_distance(index + 1, interval);

    if current <= previous && current < next {
        frame_rate + correction
    } else {
        frame_rate
    }
}

fn modular_distance(index: i64, interval: f64) -> f64 {
    let forward = (index + 1) as f64 % interval;
    let backward = interval - forward;
    forward.min(backward)
}

/// Offset of every frame within a second, e.g. `[0, 333333, 666666]` at 3 fps
pub fn subsecond_distribution(frames_per_second: u32) -> Vec<Ticks> {
    let frames = frames_per_second.max(1) as i64;
    (0..frames)
        .map(|index| Ticks(index * Ticks::PER_SECOND / frames))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_periods_sum_to_one_second_for_every_rate() {
        for fps in 1..=1000 {
            let periods = frame_periods(fps);
            assert_eq!(periods.len(), fps as usize);
            assert_eq!(periods.iter().sum::<u32>(), 1000, "{} fps", fps);
        }
    }

    #[test]
    fn test_thirty_fps_spreads_extra_milliseconds() {
        let periods = frame_periods(30);
        assert_eq!(&periods[..6], &[33, 33, 34, 33, 33, 34]);
        assert_eq!(periods.iter().filter(|p| **p == 34).count(), 10);
    }

    #[test]
    fn test_sixty_fps_spreads_shortened_periods() {
        let periods = frame_periods(60);
        assert_eq!(&periods[..6], &[17, 17, 16, 17, 17, 16]);
        assert_eq!(periods.iter().filter(|p| **p == 16).count(), 20);
    }

    #[test]
    fn test_even_rates_have_constant_period() {
        assert!(frame_periods(50).iter().all(|p| *p == 20));
        assert_eq!(frame_periods(1), vec![1000]);
        assert!(frame_periods(1000).iter().all(|p| *p == 1));
    }

    #[test]
    fn test_subsecond_distribution() {
        let offsets = subsecond_distribution(3);
        assert_eq!(offsets, vec![Ticks(0), Ticks(3_333_333), Ticks(6_666_666)]);
    }
}
