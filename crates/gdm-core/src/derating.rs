//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Environmental derating of the generator output limit."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Environmental derating model.
//!
//! The rated output is reduced linearly with ambient temperature above a
//! threshold and with altitude, stepped down when the generator runs hot,
//! and finally scaled by a safety buffer. Results are left unrounded; the
//! synchronizer rounds to 0.1 A when it writes.

use gdm_common::config::DeratingConfig;

use crate::state::EnvironmentalSample;

/// Individual multipliers making up a derating decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeratingFactor {
    pub temperature: f64,
    pub altitude: f64,
    pub generator_temperature: f64,
    pub buffer: f64,
}

impl DeratingFactor {
    /// Product of all multipliers.
    pub fn combined(&self) -> f64 {
        self.temperature * self.altitude * self.generator_temperature * self.buffer
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeratingCalculator {
    config: DeratingConfig,
}

impl DeratingCalculator {
    pub fn new(config: DeratingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DeratingConfig {
        &self.config
    }

    pub fn temperature_multiplier(&self, outdoor_temp_f: f64) -> f64 {
        let threshold = self.config.base_temperature_threshold_f;
        if outdoor_temp_f > threshold {
            (1.0 - (outdoor_temp_f - threshold) * self.config.temperature_coefficient).max(0.0)
        } else {
            1.0
        }
    }

    pub fn altitude_multiplier(&self, altitude_ft: f64) -> f64 {
        (1.0 - altitude_ft * self.config.altitude_coefficient).max(0.0)
    }

    /// Stepped reduction; the high tier is checked first and both
    /// thresholds are inclusive.
    pub fn generator_multiplier(&self, generator_temp_f: f64) -> f64 {
        if generator_temp_f >= self.config.high_generator_temp_threshold_f {
            self.config.high_generator_temp_reduction
        } else if generator_temp_f >= self.config.medium_generator_temp_threshold_f {
            self.config.medium_generator_temp_reduction
        } else {
            1.0
        }
    }

    pub fn breakdown(
        &self,
        outdoor_temp_f: f64,
        altitude_ft: f64,
        generator_temp_f: f64,
    ) -> DeratingFactor {
        DeratingFactor {
            temperature: self.temperature_multiplier(outdoor_temp_f),
            altitude: self.altitude_multiplier(altitude_ft),
            generator_temperature: self.generator_multiplier(generator_temp_f),
            buffer: self.config.output_buffer,
        }
    }

    /// Combined multiplier, buffer included.
    pub fn factor(&self, outdoor_temp_f: f64, altitude_ft: f64, generator_temp_f: f64) -> f64 {
        self.breakdown(outdoor_temp_f, altitude_ft, generator_temp_f)
            .combined()
    }

    /// Derated output in amps.
    pub fn calculate(&self, outdoor_temp_f: f64, altitude_ft: f64, generator_temp_f: f64) -> f64 {
        self.config.base_output_amps * self.factor(outdoor_temp_f, altitude_ft, generator_temp_f)
    }

    pub fn for_sample(&self, sample: &EnvironmentalSample) -> f64 {
        self.calculate(
            sample.outdoor_temp_f,
            sample.altitude_ft,
            sample.generator_temp_f,
        )
    }
}
