//! Length counter, envelope and sweep units shared by the pulse-style channels

use serde::{Deserialize, Serialize};

/// Length counter load table (indexed by bits 7-3 of the fourth channel register)
pub const LENGTH_COUNTER_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

/// Down-counter that silences its channel when it reaches zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthCounter {
    value: u8,
}

impl LengthCounter {
    /// Load from the index in bits 7-3 of `reg`
    pub fn load(&mut self, reg: u8) {
        self.value = LENGTH_COUNTER_TABLE[(reg >> 3) as usize];
    }

    /// Clock from a half frame
    pub fn clock(&mut self, halted: bool) {
        if !halted && self.value > 0 {
            self.value -= 1;
        }
    }

    pub fn clear(&mut self) {
        self.value = 0;
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    pub fn is_active(&self) -> bool {
        self.value > 0
    }
}

/// Volume decay unit driven by quarter frames
///
/// Control byte layout (first register of the channel):
/// - Bit 5: loop (also length counter halt)
/// - Bit 4: constant volume
/// - Bits 3-0: constant volume or decay period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    start_flag: bool,
    divider: u8,
    decay_level: u8,
}

impl Envelope {
    /// Restart on the next quarter frame (fourth register write)
    pub fn restart(&mut self) {
        self.start_flag = true;
    }

    pub fn start_flag(&self) -> bool {
        self.start_flag
    }

    pub fn decay_level(&self) -> u8 {
        self.decay_level
    }

    /// Clock from a quarter frame
    pub fn clock(&mut self, control: u8) {
        let period = control & 0x0F;
        if self.start_flag {
            self.start_flag = false;
            self.divider = period;
            self.decay_level = 15;
        } else if self.divider == 0 {
            self.divider = period;
            if self.decay_level > 0 || control & 0x20 != 0 {
                self.decay_level = self.decay_level.wrapping_sub(1) & 0x0F;
            }
        } else {
            self.divider -= 1;
        }
    }

    /// Output volume (0-15) for the given control byte and length counter
    pub fn volume(&self, control: u8, length: &LengthCounter) -> i32 {
        if !length.is_active() {
            0
        } else if control & 0x10 != 0 {
            (control & 0x0F) as i32
        } else {
            self.decay_level as i32
        }
    }
}

/// Pulse sweep unit
///
/// Sweep register layout:
/// - Bit 7: enable
/// - Bits 6-4: divider period
/// - Bit 3: negate
/// - Bits 2-0: shift count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sweep {
    divider: u8,
    reload: bool,
    /// Added when negating: -1 for pulse 1 (ones' complement), 0 for pulse 2
    negate_bias: i32,
}

impl Sweep {
    pub fn new(ones_complement: bool) -> Self {
        Self {
            divider: 0,
            reload: false,
            negate_bias: if ones_complement { -1 } else { 0 },
        }
    }

    /// Schedule a divider reload (sweep register write)
    pub fn request_reload(&mut self) {
        self.reload = true;
    }

    pub fn reload_pending(&self) -> bool {
        self.reload
    }

    pub fn reset(&mut self) {
        self.divider = 0;
        self.reload = false;
    }

    /// Period the sweep would move `period` to, ignoring the enable bit
    pub fn target_period(&self, sweep_reg: u8, period: u16) -> i32 {
        let offset = (period >> (sweep_reg & 0x07)) as i32;
        if sweep_reg & 0x08 != 0 {
            period as i32 + self.negate_bias - offset
        } else {
            period as i32 + offset
        }
    }

    /// Clock from a half frame. Returns the new timer period when the sweep commits one.
    pub fn clock(&mut self, sweep_reg: u8, period: u16) -> Option<u16> {
        let mut committed = None;
        if self.divider == 0 {
            self.reload = true;
            let shift = sweep_reg & 0x07;
            if shift != 0 && sweep_reg & 0x80 != 0 && period >= 8 {
                let target = self.target_period(sweep_reg, period);
                if (0..0x800).contains(&target) {
                    committed = Some(target as u16);
                }
            }
        } else {
            self.divider -= 1;
        }

        if self.reload {
            self.reload = false;
            self.divider = (sweep_reg >> 4) & 0x07;
        }
        committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_counter_load_and_clock() {
        let mut length = LengthCounter::default();
        length.load(0b0001_0000); // index 2 = 20
        assert_eq!(length.value(), 20);
        length.clock(false);
        assert_eq!(length.value(), 19);
        length.clock(true);
        assert_eq!(length.value(), 19);
        length.clear();
        length.clock(false);
        assert_eq!(length.value(), 0);
    }

    #[test]
    fn test_envelope_restart_and_decay() {
        let mut env = Envelope::default();
        env.restart();
        assert!(env.start_flag());
        env.clock(0x00);
        assert!(!env.start_flag());
        assert_eq!(env.decay_level(), 15);
        env.clock(0x00);
        assert_eq!(env.decay_level(), 14);
    }

    #[test]
    fn test_envelope_divider_period() {
        let mut env = Envelope::default();
        env.restart();
        env.clock(0x02);
        // Divider counts 2, 1, 0 before the level moves
        env.clock(0x02);
        env.clock(0x02);
        assert_eq!(env.decay_level(), 15);
        env.clock(0x02);
        assert_eq!(env.decay_level(), 14);
    }

    #[test]
    fn test_envelope_loop_wraps_to_15() {
        let mut env = Envelope::default();
        env.restart();
        env.clock(0x20);
        for _ in 0..15 {
            env.clock(0x20);
        }
        assert_eq!(env.decay_level(), 0);
        env.clock(0x20);
        assert_eq!(env.decay_level(), 15);
    }

    #[test]
    fn test_envelope_holds_at_zero_without_loop() {
        let mut env = Envelope::default();
        env.restart();
        for _ in 0..20 {
            env.clock(0x00);
        }
        assert_eq!(env.decay_level(), 0);
    }

    #[test]
    fn test_envelope_volume_sources() {
        let mut env = Envelope::default();
        let mut length = LengthCounter::default();
        assert_eq!(env.volume(0x1A, &length), 0); // length 0 silences
        length.load(0x08);
        assert_eq!(env.volume(0x1A, &length), 10); // constant volume
        env.restart();
        env.clock(0x00);
        assert_eq!(env.volume(0x00, &length), 15);
    }

    #[test]
    fn test_sweep_negate_complements() {
        let ones = Sweep::new(true);
        let twos = Sweep::new(false);
        // period 20, shift 1, negate: change = 10
        assert_eq!(ones.target_period(0b1000_1001, 20), 9);
        assert_eq!(twos.target_period(0b1000_1001, 20), 10);
    }

    #[test]
    fn test_sweep_commits_on_divider_underflow() {
        let mut sweep = Sweep::new(false);
        sweep.request_reload();
        // divider 0: underflows immediately, enable, shift 1, period 0
        assert_eq!(sweep.clock(0b1000_0001, 0x100), Some(0x180));
        assert!(!sweep.reload_pending());
    }

    #[test]
    fn test_sweep_overflow_not_committed() {
        let mut sweep = Sweep::new(false);
        assert_eq!(sweep.clock(0b1000_0001, 0x600), None);
    }

    #[test]
    fn test_sweep_divider_counts_down() {
        let mut sweep = Sweep::new(false);
        sweep.request_reload();
        let reg = 0b1010_0001; // period 2
        assert_eq!(sweep.clock(reg, 0x100), Some(0x180));
        assert_eq!(sweep.clock(reg, 0x180), None);
        assert_eq!(sweep.clock(reg, 0x180), None);
        assert_eq!(sweep.clock(reg, 0x180), Some(0x240));
    }
}
