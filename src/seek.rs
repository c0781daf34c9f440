//! Shadow registers used while jumping to a playback position
//!
//! While seeking, register writes land in a table keyed by chip and register
//! instead of reaching the chips. Leaving seek mode turns every populated slot
//! back into one real write, so side effects that depend on write order
//! (length reloads gated by $4015, DMC restart, latched address ports) happen
//! exactly as they would have live.

use std::collections::BTreeMap;

use crate::chip::ChipKind;

/// Normal playback or write capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeekState {
    #[default]
    Normal,
    Seeking,
}

/// Last captured value per register; absent slots are "unset"
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShadowRegisters {
    values: BTreeMap<(ChipKind, u16), u8>,
    latches: BTreeMap<(ChipKind, u8), u8>,
}

impl ShadowRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark every slot unset
    pub fn clear(&mut self) {
        self.values.clear();
        self.latches.clear();
    }

    /// Store `value` as the last write to `reg` on `chip`
    pub fn capture(&mut self, chip: ChipKind, reg: u16, value: u8) {
        self.values.insert((chip, reg), value);
    }

    pub fn get(&self, chip: ChipKind, reg: u16) -> Option<u8> {
        self.values.get(&(chip, reg)).copied()
    }

    /// Address latch of an address/data port pair; `port` tells apart chips
    /// with more than one pair
    pub fn set_latch(&mut self, chip: ChipKind, port: u8, value: u8) {
        self.latches.insert((chip, port), value);
    }

    pub fn latch(&self, chip: ChipKind, port: u8) -> Option<u8> {
        self.latches.get(&(chip, port)).copied()
    }

    /// Captured `(register, value)` pairs of one chip, in register order
    pub fn entries(&self, chip: ChipKind) -> impl Iterator<Item = (u16, u8)> + '_ {
        self.values
            .range((chip, u16::MIN)..=(chip, u16::MAX))
            .map(|(&(_, reg), &value)| (reg, value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let mut shadow = ShadowRegisters::new();
        shadow.capture(ChipKind::Apu, 0x4000, 0x10);
        shadow.capture(ChipKind::Apu, 0x4000, 0xBF);
        assert_eq!(shadow.get(ChipKind::Apu, 0x4000), Some(0xBF));
        assert_eq!(shadow.len(), 1);
    }

    #[test]
    fn test_entries_are_per_chip_and_ordered() {
        let mut shadow = ShadowRegisters::new();
        shadow.capture(ChipKind::Vrc6, 0xB000, 3);
        shadow.capture(ChipKind::Apu, 0x4003, 2);
        shadow.capture(ChipKind::Vrc6, 0x9000, 1);
        let vrc6: Vec<_> = shadow.entries(ChipKind::Vrc6).collect();
        assert_eq!(vrc6, vec![(0x9000, 1), (0xB000, 3)]);
        let apu: Vec<_> = shadow.entries(ChipKind::Apu).collect();
        assert_eq!(apu, vec![(0x4003, 2)]);
    }

    #[test]
    fn test_latches_are_per_port() {
        let mut shadow = ShadowRegisters::new();
        shadow.set_latch(ChipKind::Epsm, 0, 0x28);
        shadow.set_latch(ChipKind::Epsm, 1, 0xA4);
        assert_eq!(shadow.latch(ChipKind::Epsm, 0), Some(0x28));
        assert_eq!(shadow.latch(ChipKind::Epsm, 1), Some(0xA4));
        assert_eq!(shadow.latch(ChipKind::S5B, 0), None);
    }

    #[test]
    fn test_clear_unsets_everything() {
        let mut shadow = ShadowRegisters::new();
        shadow.capture(ChipKind::N163, 0x7F, 0x70);
        shadow.set_latch(ChipKind::N163, 0, 0x7F);
        shadow.clear();
        assert!(shadow.is_empty());
        assert_eq!(shadow.latch(ChipKind::N163, 0), None);
        assert_eq!(shadow.get(ChipKind::N163, 0x7F), None);
    }
}
