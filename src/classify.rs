//! Threshold classification of download speeds.
//!
//! Classification is a pure function of the measured download speed and the
//! configured [`Thresholds`]. Threshold ordering is validated once at startup
//! (see [`crate::config::Config::validate`]) and never re-checked here.

use serde::Deserialize;

use crate::model::QualityTier;

/// Download speed thresholds in Mbps.
///
/// Must satisfy `very_low < low < medium < good`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub very_low: f64,
    pub low: f64,
    pub medium: f64,
    pub good: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            very_low: 50.0,
            low: 200.0,
            medium: 500.0,
            good: 1000.0,
        }
    }
}

impl Thresholds {
    /// True when every threshold is positive and they are strictly ascending.
    pub fn is_strictly_ascending(&self) -> bool {
        self.very_low > 0.0
            && self.very_low < self.low
            && self.low < self.medium
            && self.medium < self.good
    }
}

/// Qualitative tier of a single measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpeedTier {
    VeryLow,
    Low,
    Normal,
    Good,
    Excellent,
    Failed,
}

impl SpeedTier {
    /// Tier reported to the master for this measurement.
    pub fn quality_tier(self) -> QualityTier {
        match self {
            SpeedTier::Excellent => QualityTier::Excellent,
            SpeedTier::Good | SpeedTier::Normal => QualityTier::Good,
            SpeedTier::Low | SpeedTier::VeryLow => QualityTier::Degraded,
            SpeedTier::Failed => QualityTier::Failed,
        }
    }

    /// Localization key of the tier's label.
    pub fn label_key(self) -> &'static str {
        match self {
            SpeedTier::VeryLow => "status_very_low",
            SpeedTier::Low => "status_low",
            SpeedTier::Normal => "status_normal",
            SpeedTier::Good => "status_good",
            SpeedTier::Excellent => "status_excellent",
            SpeedTier::Failed => "status_failed",
        }
    }

    pub fn emoji(self) -> &'static str {
        match self {
            SpeedTier::VeryLow => "🚨❌",
            SpeedTier::Low => "⚠️🐌",
            SpeedTier::Normal => "✅🚗",
            SpeedTier::Good => "👍🛜",
            SpeedTier::Excellent => "🚀⚡",
            SpeedTier::Failed => "❌",
        }
    }
}

/// Classify a successful measurement by its download speed.
///
/// Comparisons are strict: a speed exactly on a threshold belongs to the
/// higher tier.
pub fn classify(download_mbps: f64, thresholds: &Thresholds) -> SpeedTier {
    if download_mbps < thresholds.very_low {
        SpeedTier::VeryLow
    } else if download_mbps < thresholds.low {
        SpeedTier::Low
    } else if download_mbps < thresholds.medium {
        SpeedTier::Normal
    } else if download_mbps < thresholds.good {
        SpeedTier::Good
    } else {
        SpeedTier::Excellent
    }
}

/// Classify a measurement attempt. Failure wins over any threshold.
pub fn classify_outcome(success: bool, download_mbps: f64, thresholds: &Thresholds) -> SpeedTier {
    if success {
        classify(download_mbps, thresholds)
    } else {
        SpeedTier::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_tiers() {
        let t = Thresholds::default();
        assert_eq!(classify(10.0, &t), SpeedTier::VeryLow);
        assert_eq!(classify(100.0, &t), SpeedTier::Low);
        assert_eq!(classify(300.0, &t), SpeedTier::Normal);
        assert_eq!(classify(800.0, &t), SpeedTier::Good);
        assert_eq!(classify(1500.0, &t), SpeedTier::Excellent);
    }

    #[test]
    fn test_classify_boundaries_go_up() {
        let t = Thresholds::default();
        assert_eq!(classify(0.0, &t), SpeedTier::VeryLow);
        assert_eq!(classify(49.99, &t), SpeedTier::VeryLow);
        assert_eq!(classify(50.0, &t), SpeedTier::Low);
        assert_eq!(classify(200.0, &t), SpeedTier::Normal);
        assert_eq!(classify(500.0, &t), SpeedTier::Good);
        assert_eq!(classify(1000.0, &t), SpeedTier::Excellent);
    }

    #[test]
    fn test_failure_takes_precedence() {
        let t = Thresholds::default();
        assert_eq!(classify_outcome(false, 5000.0, &t), SpeedTier::Failed);
        assert_eq!(classify_outcome(true, 5000.0, &t), SpeedTier::Excellent);
    }

    #[test]
    fn test_classify_is_pure() {
        let t = Thresholds {
            very_low: 1.0,
            low: 2.0,
            medium: 3.0,
            good: 4.0,
        };
        for x in [0.0, 0.5, 1.0, 2.5, 3.0, 3.99, 4.0, 1e9] {
            assert_eq!(classify(x, &t), classify(x, &t));
        }
    }

    #[test]
    fn test_quality_tier_mapping() {
        assert_eq!(SpeedTier::Excellent.quality_tier(), QualityTier::Excellent);
        assert_eq!(SpeedTier::Good.quality_tier(), QualityTier::Good);
        assert_eq!(SpeedTier::Normal.quality_tier(), QualityTier::Good);
        assert_eq!(SpeedTier::Low.quality_tier(), QualityTier::Degraded);
        assert_eq!(SpeedTier::VeryLow.quality_tier(), QualityTier::Degraded);
        assert_eq!(SpeedTier::Failed.quality_tier(), QualityTier::Failed);
    }

    #[test]
    fn test_threshold_ordering() {
        assert!(Thresholds::default().is_strictly_ascending());

        let flat = Thresholds {
            low: 50.0,
            ..Thresholds::default()
        };
        assert!(!flat.is_strictly_ascending());

        let negative = Thresholds {
            very_low: -1.0,
            ..Thresholds::default()
        };
        assert!(!negative.is_strictly_ascending());
    }
}
