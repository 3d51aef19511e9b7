//! Servo actuation model: angle ↔ pulse width ↔ PWM ticks.
//!
//! The numbers produced here go straight to firmware, so every conversion is
//! deterministic and matches what the controllers compute on their side:
//!
//! ```text
//!   angle (°) ──clamp──▶ pulse (µs) ──profile──▶ ticks
//!       ▲                    │  ▲                  │
//!       └────────────────────┘  └──────────────────┘
//!            pulse_to_angle        ticks_to_pulse_us
//! ```
//!
//! Angles and pulses are clamped into range rather than rejected: an
//! out-of-range value must never reach hardware. Only configuration
//! mistakes (unknown channel, inverted bounds) are errors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ConfigurationError;

/// Highest channel addressable on a 16-channel PWM driver.
pub const MAX_CHANNEL: u8 = 15;

// ============================================================================
// PWM Profiles
// ============================================================================

/// Tick resolution of one hardware PWM generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PwmProfile {
    pub ticks_per_cycle: u32,
    pub period_us: u32,
}

impl PwmProfile {
    /// PCA9685 external driver: 12-bit counter at 50 Hz.
    pub const PCA9685: PwmProfile = PwmProfile::new(4096, 20_000);

    /// ESP32 LEDC peripheral: 16-bit counter at 50 Hz.
    pub const LEDC_16BIT: PwmProfile = PwmProfile::new(65_536, 20_000);

    pub const fn new(ticks_per_cycle: u32, period_us: u32) -> Self {
        Self {
            ticks_per_cycle,
            period_us,
        }
    }

    fn max_tick(&self) -> u32 {
        self.ticks_per_cycle.saturating_sub(1)
    }

    /// Converts a pulse width to ticks, rounded and clamped to the counter range.
    pub fn pulse_to_ticks(&self, pulse_us: u32) -> u32 {
        if self.period_us == 0 || self.ticks_per_cycle == 0 {
            return 0;
        }
        let ticks = (f64::from(pulse_us) * f64::from(self.ticks_per_cycle)
            / f64::from(self.period_us))
        .round();
        clamp_to_u32(ticks, self.max_tick())
    }

    /// Converts ticks back to a pulse width in whole microseconds.
    pub fn ticks_to_pulse_us(&self, ticks: u32) -> u32 {
        if self.ticks_per_cycle == 0 {
            return 0;
        }
        let ticks = ticks.min(self.max_tick());
        let pulse = (f64::from(ticks) * f64::from(self.period_us)
            / f64::from(self.ticks_per_cycle))
        .round();
        clamp_to_u32(pulse, self.period_us)
    }
}

/// `round(pulse_us × ticks_per_cycle / period_us)` clamped to `[0, ticks_per_cycle - 1]`.
pub fn pulse_to_ticks(pulse_us: u32, ticks_per_cycle: u32, period_us: u32) -> u32 {
    PwmProfile::new(ticks_per_cycle, period_us).pulse_to_ticks(pulse_us)
}

fn clamp_to_u32(value: f64, max: u32) -> u32 {
    if value.is_nan() || value <= 0.0 {
        0
    } else if value >= f64::from(max) {
        max
    } else {
        // In range and integral after round(); the cast is exact.
        value as u32
    }
}

// ============================================================================
// Servo Configuration
// ============================================================================

/// Static bounds of one servo channel.
///
/// Construct through [`ServoConfig::new`] (or deserialize, which runs the
/// same validation); fields cannot be changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ServoConfigSpec")]
pub struct ServoConfig {
    channel: u8,
    label: String,
    min_angle: f64,
    max_angle: f64,
    min_pulse_us: u32,
    max_pulse_us: u32,
    home_angle: f64,
}

/// Unvalidated servo bounds as written in configuration files.
#[derive(Debug, Clone, Deserialize)]
pub struct ServoConfigSpec {
    pub channel: u8,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_min_angle")]
    pub min_angle: f64,
    #[serde(default = "default_max_angle")]
    pub max_angle: f64,
    #[serde(default = "default_min_pulse")]
    pub min_pulse_us: u32,
    #[serde(default = "default_max_pulse")]
    pub max_pulse_us: u32,
    #[serde(default = "default_home_angle")]
    pub home_angle: f64,
}

fn default_min_angle() -> f64 {
    0.0
}

fn default_max_angle() -> f64 {
    180.0
}

fn default_min_pulse() -> u32 {
    1000
}

fn default_max_pulse() -> u32 {
    2000
}

fn default_home_angle() -> f64 {
    90.0
}

impl TryFrom<ServoConfigSpec> for ServoConfig {
    type Error = ConfigurationError;

    fn try_from(spec: ServoConfigSpec) -> Result<Self, Self::Error> {
        ServoConfig::new(
            spec.channel,
            spec.label,
            (spec.min_angle, spec.max_angle),
            (spec.min_pulse_us, spec.max_pulse_us),
            spec.home_angle,
        )
    }
}

impl ServoConfig {
    /// Validates and builds a channel configuration.
    ///
    /// # Errors
    ///
    /// - `ChannelOutOfRange` if `channel > 15`
    /// - `InvalidBounds` if angles are not finite, `min_angle > max_angle`,
    ///   `min_pulse_us >= max_pulse_us`, or `home_angle` lies outside the
    ///   angle range
    pub fn new(
        channel: u8,
        label: impl Into<String>,
        (min_angle, max_angle): (f64, f64),
        (min_pulse_us, max_pulse_us): (u32, u32),
        home_angle: f64,
    ) -> Result<Self, ConfigurationError> {
        if channel > MAX_CHANNEL {
            return Err(ConfigurationError::ChannelOutOfRange {
                channel,
                max: MAX_CHANNEL,
            });
        }
        let invalid = |reason: String| ConfigurationError::InvalidBounds { channel, reason };

        if !(min_angle.is_finite() && max_angle.is_finite() && home_angle.is_finite()) {
            return Err(invalid("angles must be finite".to_string()));
        }
        if min_angle > max_angle {
            return Err(invalid(format!(
                "min_angle {min_angle} exceeds max_angle {max_angle}"
            )));
        }
        if min_pulse_us >= max_pulse_us {
            return Err(invalid(format!(
                "min_pulse_us {min_pulse_us} must be below max_pulse_us {max_pulse_us}"
            )));
        }
        if home_angle < min_angle || home_angle > max_angle {
            return Err(invalid(format!(
                "home_angle {home_angle} outside [{min_angle}, {max_angle}]"
            )));
        }

        Ok(Self {
            channel,
            label: label.into(),
            min_angle,
            max_angle,
            min_pulse_us,
            max_pulse_us,
            home_angle,
        })
    }

    /// Standard MG996R profile: 0–180° over 1000–2000 µs, home at 90°.
    pub fn standard(channel: u8, label: impl Into<String>) -> Result<Self, ConfigurationError> {
        Self::new(channel, label, (0.0, 180.0), (1000, 2000), 90.0)
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn angle_range(&self) -> (f64, f64) {
        (self.min_angle, self.max_angle)
    }

    pub fn pulse_range(&self) -> (u32, u32) {
        (self.min_pulse_us, self.max_pulse_us)
    }

    pub fn home_angle(&self) -> f64 {
        self.home_angle
    }

    /// Clamps into `[min_angle, max_angle]`. NaN maps to the home angle.
    pub fn clamp_angle(&self, angle: f64) -> f64 {
        if angle.is_nan() {
            return self.home_angle;
        }
        angle.max(self.min_angle).min(self.max_angle)
    }

    /// Linear angle → pulse mapping, rounded to the nearest microsecond.
    pub fn angle_to_pulse_us(&self, angle: f64) -> u32 {
        let angle = self.clamp_angle(angle);
        let angle_span = self.max_angle - self.min_angle;
        if angle_span == 0.0 {
            return self.min_pulse_us;
        }
        let pulse_span = f64::from(self.max_pulse_us - self.min_pulse_us);
        let pulse = f64::from(self.min_pulse_us)
            + (angle - self.min_angle) / angle_span * pulse_span;
        clamp_to_u32(pulse.round(), self.max_pulse_us)
    }

    /// Inverse of [`Self::angle_to_pulse_us`], rounded to 0.1°.
    pub fn pulse_to_angle(&self, pulse_us: u32) -> f64 {
        let pulse = pulse_us.clamp(self.min_pulse_us, self.max_pulse_us);
        let pulse_span = f64::from(self.max_pulse_us - self.min_pulse_us);
        if pulse_span == 0.0 {
            return self.min_angle;
        }
        let fraction = f64::from(pulse - self.min_pulse_us) / pulse_span;
        let angle = self.min_angle + fraction * (self.max_angle - self.min_angle);
        (angle * 10.0).round() / 10.0
    }
}

// ============================================================================
// Actuation Model
// ============================================================================

/// Every representation of one commanded servo position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServoReading {
    pub channel: u8,
    /// Angle after clamping
    pub angle: f64,
    pub pulse_us: u32,
    pub pca9685_ticks: u32,
    pub ledc_ticks: u32,
}

/// Immutable per-channel servo configuration and the conversions over it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActuationModel {
    channels: BTreeMap<u8, ServoConfig>,
}

/// Channel roles of the default ten-servo body.
const DEFAULT_LABELS: [&str; 10] = [
    "left_shoulder",
    "left_elbow_1",
    "left_elbow_2",
    "left_gripper",
    "right_shoulder",
    "right_elbow_1",
    "right_elbow_2",
    "right_gripper",
    "neck_updown",
    "neck_leftright",
];

impl ActuationModel {
    /// Builds a model from channel configurations.
    ///
    /// # Errors
    ///
    /// `DuplicateChannel` if two configurations share a channel.
    pub fn new(
        configs: impl IntoIterator<Item = ServoConfig>,
    ) -> Result<Self, ConfigurationError> {
        let mut channels = BTreeMap::new();
        for config in configs {
            let channel = config.channel;
            if channels.insert(channel, config).is_some() {
                return Err(ConfigurationError::DuplicateChannel { channel });
            }
        }
        Ok(Self { channels })
    }

    /// Ten standard MG996R channels (0–9) matching the robot's wiring.
    pub fn default_fleet() -> Self {
        let channels = DEFAULT_LABELS
            .iter()
            .zip(0u8..)
            .filter_map(|(label, channel)| ServoConfig::standard(channel, *label).ok())
            .map(|config| (config.channel, config))
            .collect();
        Self { channels }
    }

    /// Looks up a channel's configuration.
    pub fn config(&self, channel: u8) -> Result<&ServoConfig, ConfigurationError> {
        self.channels
            .get(&channel)
            .ok_or(ConfigurationError::UnknownChannel { channel })
    }

    /// Configured channels in ascending order.
    pub fn channels(&self) -> impl Iterator<Item = &ServoConfig> {
        self.channels.values()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn clamp_angle(&self, channel: u8, angle: f64) -> Result<f64, ConfigurationError> {
        Ok(self.config(channel)?.clamp_angle(angle))
    }

    pub fn angle_to_pulse_us(&self, channel: u8, angle: f64) -> Result<u32, ConfigurationError> {
        Ok(self.config(channel)?.angle_to_pulse_us(angle))
    }

    pub fn pulse_to_angle(&self, channel: u8, pulse_us: u32) -> Result<f64, ConfigurationError> {
        Ok(self.config(channel)?.pulse_to_angle(pulse_us))
    }

    /// Angle straight to ticks of the given PWM generator.
    pub fn angle_to_ticks(
        &self,
        channel: u8,
        angle: f64,
        profile: PwmProfile,
    ) -> Result<u32, ConfigurationError> {
        let pulse = self.angle_to_pulse_us(channel, angle)?;
        Ok(profile.pulse_to_ticks(pulse))
    }

    /// Ticks of the given PWM generator back to an angle.
    pub fn ticks_to_angle(
        &self,
        channel: u8,
        ticks: u32,
        profile: PwmProfile,
    ) -> Result<f64, ConfigurationError> {
        self.pulse_to_angle(channel, profile.ticks_to_pulse_us(ticks))
    }

    /// Resolves an angle into every hardware representation at once.
    pub fn reading(&self, channel: u8, angle: f64) -> Result<ServoReading, ConfigurationError> {
        let config = self.config(channel)?;
        let angle = config.clamp_angle(angle);
        let pulse_us = config.angle_to_pulse_us(angle);
        Ok(ServoReading {
            channel,
            angle,
            pulse_us,
            pca9685_ticks: PwmProfile::PCA9685.pulse_to_ticks(pulse_us),
            ledc_ticks: PwmProfile::LEDC_16BIT.pulse_to_ticks(pulse_us),
        })
    }
}

// ============================================================================
// Controller Reports
// ============================================================================

/// Where a controller says one channel actually is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServoFeedback {
    pub channel: u8,
    pub current_angle: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_angle: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulse_width_us: Option<u32>,
    /// Generator ticks; PCA9685 boards report 0-4095, LEDC boards 0-65535
    #[serde(default, alias = "pwm_ticks", skip_serializing_if = "Option::is_none")]
    pub pca9685_ticks: Option<u32>,
    #[serde(default)]
    pub is_moving: bool,
}

/// Fault reported by a controller, for one channel or the whole board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServoFault {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
    #[serde(default)]
    pub error_code: i64,
    #[serde(alias = "error")]
    pub error_message: String,
}
