use serde::{Deserialize, Serialize};

use crate::config::TvSystem;
use crate::synth::Cycle;

/// Cycles between MMC5 frame sequencer edges
pub const MMC5_FRAME_PERIOD: Cycle = 7457;

/// Which chip the sequencer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequencerKind {
    /// 2A03 sequencer, programmed through $4017
    Native,
    /// MMC5 fixed-rate sequencer: every edge clocks everything, no IRQ
    Mmc5,
}

/// Unit clocks produced by one sequencer edge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameClocks {
    /// Envelopes and the triangle linear counter
    pub quarter: bool,
    /// Length counters and sweeps
    pub half: bool,
}

/// Frame Counter
/// Sequences envelope, sweep, and length counter clocks
/// Operates in two modes: 4-step and 5-step
///
/// The counter is driven from outside: the owner runs its channels up to
/// `time + delay()`, calls [`FrameCounter::elapse`] for the cycles covered and
/// [`FrameCounter::clock`] once the delay reaches zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameCounter {
    kind: SequencerKind,
    pal: bool,
    period: Cycle,
    /// Last value written to $4017
    mode: u8,
    step: u8,
    delay: Cycle,
    irq_flag: bool,
    next_irq: Option<Cycle>,
}

impl Default for FrameCounter {
    fn default() -> Self {
        Self::new(TvSystem::Ntsc)
    }
}

impl FrameCounter {
    /// Create a 2A03 frame counter
    pub fn new(tv_system: TvSystem) -> Self {
        Self {
            kind: SequencerKind::Native,
            pal: tv_system.is_pal(),
            period: tv_system.frame_period(),
            mode: 0,
            step: 0,
            delay: 1,
            irq_flag: false,
            next_irq: None,
        }
    }

    /// Create the MMC5's fixed-rate sequencer
    pub fn new_mmc5() -> Self {
        Self {
            kind: SequencerKind::Mmc5,
            pal: false,
            period: MMC5_FRAME_PERIOD,
            mode: 0,
            step: 0,
            delay: MMC5_FRAME_PERIOD,
            irq_flag: false,
            next_irq: None,
        }
    }

    pub fn reset(&mut self) {
        *self = match self.kind {
            SequencerKind::Native => {
                let tv_system = if self.pal { TvSystem::Pal } else { TvSystem::Ntsc };
                Self::new(tv_system)
            }
            SequencerKind::Mmc5 => Self::new_mmc5(),
        };
    }

    pub fn kind(&self) -> SequencerKind {
        self.kind
    }

    /// Write to frame counter register ($4017)
    /// Bit 7: Mode (0 = 4-step, 1 = 5-step)
    /// Bit 6: IRQ inhibit (1 = disable IRQ)
    ///
    /// Selecting 5-step mode clocks every unit at once (after the odd-cycle
    /// jitter), 4-step mode restarts one step later.
    pub fn write_register(&mut self, time: Cycle, value: u8) {
        if self.kind == SequencerKind::Mmc5 {
            return;
        }
        self.mode = value;
        let irq_enabled = value & 0x40 == 0;
        self.irq_flag &= irq_enabled;
        self.next_irq = None;

        self.delay &= 1;
        self.step = 0;
        if value & 0x80 == 0 {
            self.step = 1;
            self.delay += self.period;
            if irq_enabled {
                self.next_irq = Some(time + self.delay + self.period * 3 + 1);
            }
        }
    }

    /// Get current mode (false = 4-step, true = 5-step)
    pub fn get_mode(&self) -> bool {
        self.mode & 0x80 != 0
    }

    pub fn is_irq_inhibited(&self) -> bool {
        self.mode & 0x40 != 0
    }

    /// Cycles until the next sequencer edge
    pub fn delay(&self) -> Cycle {
        self.delay
    }

    /// Account for `cycles` elapsed without reaching an edge
    pub fn elapse(&mut self, cycles: Cycle) {
        self.delay -= cycles;
    }

    /// Get frame IRQ flag
    pub fn get_irq_flag(&self) -> bool {
        self.irq_flag
    }

    /// Clear frame IRQ flag (reading $4015 acknowledges it)
    pub fn clear_irq_flag(&mut self) {
        self.irq_flag = false;
    }

    /// Predicted time the frame IRQ asserts, if enabled
    pub fn next_irq(&self) -> Option<Cycle> {
        self.next_irq
    }

    /// Take the actions of the edge reached at `time` and schedule the next one
    pub fn clock(&mut self, time: Cycle) -> FrameClocks {
        self.delay = self.period;
        if self.kind == SequencerKind::Mmc5 {
            return FrameClocks {
                quarter: true,
                half: true,
            };
        }

        let step = self.step;
        self.step += 1;
        let mut half = false;
        match step {
            0 => {
                if self.mode & 0xC0 == 0 {
                    self.next_irq = Some(time + self.period * 4 + 2);
                    self.irq_flag = true;
                }
                half = true;
            }
            1 => {
                // Step 1 is slightly shorter on NTSC
                if !self.pal {
                    self.delay -= 2;
                }
            }
            2 => {
                half = true;
                if self.pal {
                    self.delay -= 2;
                }
            }
            _ => {
                self.step = 0;
                // The last step of the 5-step sequence is almost twice as long
                if self.mode & 0x80 != 0 {
                    self.delay += self.period - if self.pal { 2 } else { 6 };
                }
            }
        }
        FrameClocks {
            quarter: true,
            half,
        }
    }

    /// Make recorded times relative to a frame that starts at `end_time`
    pub fn end_frame(&mut self, end_time: Cycle) {
        if let Some(irq) = self.next_irq {
            self.next_irq = Some(irq.saturating_sub(end_time));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run the counter from 0 to `horizon`, collecting every edge
    fn edges(fc: &mut FrameCounter, horizon: Cycle) -> Vec<(Cycle, FrameClocks)> {
        let mut out = Vec::new();
        let mut time = 0;
        loop {
            let next = time + fc.delay();
            if next > horizon {
                break;
            }
            fc.elapse(next - time);
            time = next;
            out.push((time, fc.clock(time)));
        }
        out
    }

    const Q: FrameClocks = FrameClocks {
        quarter: true,
        half: false,
    };
    const QH: FrameClocks = FrameClocks {
        quarter: true,
        half: true,
    };

    #[test]
    fn test_frame_counter_new() {
        let fc = FrameCounter::new(TvSystem::Ntsc);
        assert!(!fc.get_mode());
        assert!(!fc.is_irq_inhibited());
        assert!(!fc.get_irq_flag());
        assert_eq!(fc.delay(), 1);
    }

    #[test]
    fn test_write_register_modes() {
        let mut fc = FrameCounter::new(TvSystem::Ntsc);
        fc.write_register(0, 0b1100_0000);
        assert!(fc.get_mode());
        assert!(fc.is_irq_inhibited());
        fc.write_register(0, 0b0000_0000);
        assert!(!fc.get_mode());
        assert!(!fc.is_irq_inhibited());
    }

    #[test]
    fn test_four_step_sequence() {
        let mut fc = FrameCounter::new(TvSystem::Ntsc);
        fc.write_register(0, 0x00);
        let seen = edges(&mut fc, 29_831);
        assert_eq!(
            seen,
            vec![(7459, Q), (14915, QH), (22373, Q), (29831, QH)]
        );
        assert!(fc.get_irq_flag());
    }

    #[test]
    fn test_five_step_sequence_clocks_immediately() {
        let mut fc = FrameCounter::new(TvSystem::Ntsc);
        fc.write_register(0, 0x80);
        let seen = edges(&mut fc, 37_283);
        assert_eq!(
            seen,
            vec![(1, QH), (7459, Q), (14915, QH), (22373, Q), (37283, QH)]
        );
        assert!(!fc.get_irq_flag());
    }

    #[test]
    fn test_irq_once_per_four_step_cycle() {
        let mut fc = FrameCounter::new(TvSystem::Ntsc);
        fc.write_register(0, 0x00);
        let mut raised = 0;
        let mut time = 0;
        while time < 29_830 * 4 {
            let next = time + fc.delay();
            fc.elapse(next - time);
            time = next;
            fc.clock(time);
            if fc.get_irq_flag() {
                raised += 1;
                fc.clear_irq_flag();
            }
        }
        assert_eq!(raised, 4);
    }

    #[test]
    fn test_irq_inhibit_clears_flag() {
        let mut fc = FrameCounter::new(TvSystem::Ntsc);
        fc.write_register(0, 0x00);
        edges(&mut fc, 30_000);
        assert!(fc.get_irq_flag());
        fc.write_register(30_000, 0x40);
        assert!(!fc.get_irq_flag());
        assert_eq!(fc.next_irq(), None);
    }

    #[test]
    fn test_irq_prediction_after_write() {
        let mut fc = FrameCounter::new(TvSystem::Ntsc);
        fc.write_register(0, 0x00);
        assert_eq!(fc.next_irq(), Some(7459 + 7458 * 3 + 1));
    }

    #[test]
    fn test_pal_sequence() {
        let mut fc = FrameCounter::new(TvSystem::Pal);
        fc.write_register(0, 0x00);
        let seen = edges(&mut fc, 40_000);
        let times: Vec<Cycle> = seen.iter().map(|&(t, _)| t).collect();
        assert_eq!(&times[..4], &[8315, 16629, 24941, 33255]);
    }

    #[test]
    fn test_mmc5_sequencer_fixed_rate() {
        let mut fc = FrameCounter::new_mmc5();
        fc.write_register(0, 0x00); // ignored
        let seen = edges(&mut fc, MMC5_FRAME_PERIOD * 3);
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|&(_, clocks)| clocks == QH));
        assert!(!fc.get_irq_flag());
    }

    #[test]
    fn test_end_frame_rebases_irq() {
        let mut fc = FrameCounter::new(TvSystem::Ntsc);
        fc.write_register(100, 0x00);
        let irq = fc.next_irq().unwrap_or(0);
        fc.end_frame(100);
        assert_eq!(fc.next_irq(), Some(irq - 100));
    }
}
