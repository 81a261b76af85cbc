//! Speaking detection from periodic microphone level samples.
//!
//! The discrete status is decided on the raw sample with two thresholds:
//! speaking starts at `speak_high` and ends once `release_samples`
//! consecutive samples fall below `speak_low`. The reported level is smoothed
//! separately with a fast attack and a slow release.

use crate::{configs::VoiceConfig, protocol::VoiceStatus};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    pub speak_high: f32,
    pub speak_low: f32,
    pub release_samples: u32,
    pub rise_factor: f32,
    pub fall_factor: f32,
    pub level_epsilon: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::from(&VoiceConfig::default())
    }
}

impl From<&VoiceConfig> for DetectorConfig {
    fn from(config: &VoiceConfig) -> Self {
        Self {
            speak_high: config.speak_high,
            speak_low: config.speak_low,
            release_samples: config.release_samples.max(1),
            rise_factor: config.rise_factor,
            fall_factor: config.fall_factor,
            level_epsilon: config.level_epsilon,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub status: VoiceStatus,
    pub level: f32,
}

#[derive(Debug, Clone)]
pub struct SpeakingDetector {
    config: DetectorConfig,
    speaking: bool,
    below: u32,
    smoothed: f32,
    last_emitted: Option<Reading>,
}

impl SpeakingDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            speaking: false,
            below: 0,
            smoothed: 0.0,
            last_emitted: None,
        }
    }

    /// Feeds one sample and returns the current reading.
    pub fn classify(&mut self, raw: f32, muted: bool) -> Reading {
        let raw = if raw.is_finite() { raw.clamp(0.0, 1.0) } else { 0.0 };

        if muted {
            self.speaking = false;
            self.below = 0;
            self.smoothed = 0.0;
            return Reading {
                status: VoiceStatus::Muted,
                level: 0.0,
            };
        }

        if raw >= self.config.speak_high {
            self.speaking = true;
            self.below = 0;
        } else if self.speaking {
            if raw < self.config.speak_low {
                self.below += 1;
                if self.below >= self.config.release_samples {
                    self.speaking = false;
                    self.below = 0;
                }
            } else {
                self.below = 0;
            }
        }

        let factor = if raw > self.smoothed {
            self.config.rise_factor
        } else {
            self.config.fall_factor
        };
        self.smoothed = (self.smoothed * (1.0 - factor) + raw * factor).max(raw / 2.0);

        Reading {
            status: if self.speaking {
                VoiceStatus::Speaking
            } else {
                VoiceStatus::Silent
            },
            level: self.smoothed,
        }
    }

    /// Like [`classify`](Self::classify), but only yields a reading worth
    /// broadcasting: a status change or a level move beyond the epsilon.
    pub fn sample(&mut self, raw: f32, muted: bool) -> Option<Reading> {
        let reading = self.classify(raw, muted);
        let changed = match self.last_emitted {
            None => true,
            Some(last) => {
                last.status != reading.status
                    || (last.level - reading.level).abs() > self.config.level_epsilon
            }
        };
        if changed {
            self.last_emitted = Some(reading);
            Some(reading)
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.speaking = false;
        self.below = 0;
        self.smoothed = 0.0;
        self.last_emitted = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statuses(levels: &[f32]) -> Vec<VoiceStatus> {
        let mut detector = SpeakingDetector::new(DetectorConfig::default());
        levels.iter().map(|l| detector.classify(*l, false).status).collect()
    }

    #[test]
    fn hysteresis_sequence() {
        use VoiceStatus::*;
        assert_eq!(
            statuses(&[0.2, 0.5, 0.5, 0.3, 0.3]),
            vec![Silent, Speaking, Speaking, Speaking, Silent]
        );
    }

    #[test]
    fn mid_band_level_neither_enters_nor_exits() {
        use VoiceStatus::*;
        assert_eq!(statuses(&[0.4, 0.4]), vec![Silent, Silent]);
        assert_eq!(
            statuses(&[0.5, 0.4, 0.4, 0.4]),
            vec![Speaking, Speaking, Speaking, Speaking]
        );
        // A mid-band sample resets the release count.
        assert_eq!(
            statuses(&[0.5, 0.3, 0.4, 0.3, 0.3]),
            vec![Speaking, Speaking, Speaking, Speaking, Silent]
        );
    }

    #[test]
    fn muted_forces_status_and_zero_level() {
        let mut detector = SpeakingDetector::new(DetectorConfig::default());
        detector.classify(0.9, false);
        let reading = detector.classify(0.9, true);
        assert_eq!(reading, Reading { status: VoiceStatus::Muted, level: 0.0 });
        assert_eq!(detector.classify(0.1, false).status, VoiceStatus::Silent);
    }

    #[test]
    fn smoothing_rises_fast_and_decays_slowly() {
        let mut detector = SpeakingDetector::new(DetectorConfig::default());
        let up = detector.classify(1.0, false).level;
        assert!((up - 0.7).abs() < 1e-6);

        let down = detector.classify(0.0, false).level;
        assert!((down - 0.49).abs() < 1e-6);
    }

    #[test]
    fn smoothed_level_is_floored_at_half_the_raw_level() {
        let mut detector = SpeakingDetector::new(DetectorConfig {
            rise_factor: 0.1,
            ..DetectorConfig::default()
        });
        assert_eq!(detector.classify(0.8, false).level, 0.4);
    }

    #[test]
    fn only_meaningful_changes_are_emitted() {
        let mut detector = SpeakingDetector::new(DetectorConfig::default());
        assert!(detector.sample(0.0, false).is_some());
        assert!(detector.sample(0.05, false).is_none());
        assert!(detector.sample(0.3, false).is_some());
        assert!(detector.sample(0.0, true).is_some());
        assert!(detector.sample(0.9, true).is_none());
    }
}
