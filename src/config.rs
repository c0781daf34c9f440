use bitflags::bitflags;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{ApuError, Result};

/// Television standard the console is clocked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TvSystem {
    #[default]
    Ntsc,
    Pal,
}

impl TvSystem {
    /// CPU clock rate in Hz
    pub fn cpu_clock(self) -> f64 {
        match self {
            TvSystem::Ntsc => 1_789_773.0,
            TvSystem::Pal => 1_662_607.0,
        }
    }

    /// Cycles between native frame sequencer steps
    pub fn frame_period(self) -> u32 {
        match self {
            TvSystem::Ntsc => 7458,
            TvSystem::Pal => 8314,
        }
    }

    pub fn is_pal(self) -> bool {
        self == TvSystem::Pal
    }
}

bitflags! {
    /// Cartridge sound chips active alongside the 2A03
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Expansions: u8 {
        const VRC6 = 0b0000_0001;
        const VRC7 = 0b0000_0010;
        const FDS  = 0b0000_0100;
        const MMC5 = 0b0000_1000;
        const N163 = 0b0001_0000;
        const S5B  = 0b0010_0000;
        const EPSM = 0b0100_0000;
    }
}

impl Expansions {
    /// Build a mask from raw host bits; unknown bits select no expansion
    pub fn from_raw(bits: u8) -> Self {
        let mask = Self::from_bits_truncate(bits);
        if mask.bits() != bits {
            warn!(
                "ignoring unsupported expansion bits {:#04x}",
                bits & !Self::all().bits()
            );
        }
        mask
    }
}

/// Construction parameters for [`crate::NesSound`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApuConfig {
    pub tv_system: TvSystem,
    pub sample_rate: u32,
    pub expansions: Expansions,
    /// Number of accumulation buffers channels can be routed to
    pub buffer_count: usize,
    pub buffer_length_ms: u32,
    /// Namco 163 voice count preset at power-on; a later $7F write overrides it
    pub n163_channels: Option<u8>,
}

impl Default for ApuConfig {
    fn default() -> Self {
        Self {
            tv_system: TvSystem::Ntsc,
            sample_rate: 44_100,
            expansions: Expansions::empty(),
            buffer_count: 1,
            buffer_length_ms: 100,
            n163_channels: None,
        }
    }
}

impl ApuConfig {
    pub fn with_expansions(mut self, expansions: Expansions) -> Self {
        self.expansions = expansions;
        self
    }

    pub fn with_tv_system(mut self, tv_system: TvSystem) -> Self {
        self.tv_system = tv_system;
        self
    }

    pub fn with_buffer_count(mut self, buffer_count: usize) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    pub fn with_n163_channels(mut self, channels: u8) -> Self {
        self.n163_channels = Some(channels);
        self
    }

    /// Check that the configuration can build a working sound system
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(ApuError::Config("sample rate must be non-zero".into()));
        }
        if self.buffer_count == 0 {
            return Err(ApuError::Config("at least one output buffer is required".into()));
        }
        if !(1..=1000).contains(&self.buffer_length_ms) {
            return Err(ApuError::Config(format!(
                "buffer length {} ms outside 1..=1000",
                self.buffer_length_ms
            )));
        }
        if let Some(channels) = self.n163_channels {
            if !(1..=8).contains(&channels) {
                return Err(ApuError::Config(format!(
                    "namco 163 channel count {channels} outside 1..=8"
                )));
            }
        }
        Ok(())
    }

    /// Samples each accumulation buffer must hold
    pub fn buffer_samples(&self) -> u32 {
        self.sample_rate * self.buffer_length_ms / 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ApuConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_samples(), 4410);
    }

    #[test]
    fn test_zero_sample_rate_rejected() {
        let config = ApuConfig {
            sample_rate: 0,
            ..ApuConfig::default()
        };
        assert!(matches!(config.validate(), Err(ApuError::Config(_))));
    }

    #[test]
    fn test_zero_buffers_rejected() {
        let config = ApuConfig::default().with_buffer_count(0);
        assert!(matches!(config.validate(), Err(ApuError::Config(_))));
    }

    #[test]
    fn test_n163_channel_hint_range() {
        let config = ApuConfig {
            n163_channels: Some(9),
            ..ApuConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_expansion_bits_dropped() {
        let mask = Expansions::from_raw(0b1000_0001);
        assert_eq!(mask, Expansions::VRC6);
        assert_eq!(Expansions::from_raw(0x80), Expansions::empty());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: ApuConfig =
            serde_json::from_str(r#"{ "tv_system": "Pal", "sample_rate": 48000 }"#).unwrap();
        assert_eq!(config.tv_system, TvSystem::Pal);
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.buffer_count, 1);
    }

    #[test]
    fn test_tv_system_rates() {
        assert_eq!(TvSystem::Ntsc.frame_period(), 7458);
        assert_eq!(TvSystem::Pal.frame_period(), 8314);
        assert!(TvSystem::Pal.is_pal());
    }
}
