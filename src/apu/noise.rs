use serde::{Deserialize, Serialize};

use super::units::{Envelope, LengthCounter};
use crate::synth::{Cycle, DeltaSink, OutputTarget, Synth};

/// Noise timer periods for NTSC, in CPU cycles
const NOISE_PERIOD_TABLE: [u16; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

/// Noise timer periods for PAL, in CPU cycles
const NOISE_PERIOD_TABLE_PAL: [u16; 16] = [
    4, 8, 14, 30, 60, 88, 118, 148, 188, 236, 354, 472, 708, 944, 1890, 3778,
];

/// Noise channel
/// Generates pseudo-random noise using a 15-bit linear feedback shift register
///
/// Registers (offset from $400C):
/// - 0: --LC VVVV  halt, constant volume, volume/envelope period
/// - 2: M--- PPPP  short mode, period index
/// - 3: LLLL L---  length counter index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Noise {
    regs: [u8; 4],
    pal: bool,

    shift_register: u16,

    length_counter: LengthCounter,
    envelope: Envelope,

    delay: Cycle,
    last_amp: i32,

    #[serde(skip)]
    output: OutputTarget,
}

impl Default for Noise {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Noise {
    /// Create a new Noise channel
    pub fn new(pal: bool) -> Self {
        Self {
            regs: [0; 4],
            pal,
            shift_register: 1 << 14,
            length_counter: LengthCounter::default(),
            envelope: Envelope::default(),
            delay: 0,
            last_amp: 0,
            output: None,
        }
    }

    pub fn reset(&mut self) {
        let output = self.output;
        *self = Self::new(self.pal);
        self.output = output;
    }

    pub fn set_pal(&mut self, pal: bool) {
        self.pal = pal;
    }

    pub fn set_output(&mut self, target: OutputTarget) {
        if target != self.output {
            self.last_amp = 0;
        }
        self.output = target;
    }

    /// Take over `state`, keeping this channel's output and the level already sent to it
    pub(crate) fn restore(&mut self, state: &Self) {
        let (output, last_amp) = (self.output, self.last_amp);
        *self = state.clone();
        self.output = output;
        self.last_amp = last_amp;
    }

    pub fn output(&self) -> OutputTarget {
        self.output
    }

    pub fn regs(&self) -> &[u8; 4] {
        &self.regs
    }

    pub fn shift_register(&self) -> u16 {
        self.shift_register
    }

    /// Timer period selected by the period register
    pub fn period(&self) -> Cycle {
        let index = (self.regs[2] & 0x0F) as usize;
        if self.pal {
            NOISE_PERIOD_TABLE_PAL[index] as Cycle
        } else {
            NOISE_PERIOD_TABLE[index] as Cycle
        }
    }

    /// Short mode takes feedback from bit 6 instead of bit 1
    fn tap(&self) -> u16 {
        if self.regs[2] & 0x80 != 0 { 6 } else { 1 }
    }

    /// Write one of the channel registers ($400C-$400F)
    pub fn write_register(&mut self, reg: usize, value: u8, length_enabled: bool) {
        self.regs[reg & 3] = value;
        if reg & 3 == 3 {
            if length_enabled {
                self.length_counter.load(value);
            }
            self.envelope.restart();
        }
    }

    pub fn get_length_counter(&self) -> u8 {
        self.length_counter.value()
    }

    pub fn set_length_counter_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.length_counter.clear();
        }
    }

    pub fn get_envelope_start_flag(&self) -> bool {
        self.envelope.start_flag()
    }

    pub fn volume(&self) -> i32 {
        self.envelope.volume(self.regs[0], &self.length_counter)
    }

    /// Clock the envelope (quarter frame)
    pub fn clock_envelope(&mut self) {
        self.envelope.clock(self.regs[0]);
    }

    /// Clock the length counter (half frame)
    pub fn clock_length_counter(&mut self) {
        self.length_counter.clock(self.regs[0] & 0x20 != 0);
    }

    /// Shift the LFSR once
    fn clock_shift_register(shift: u16, tap: u16) -> u16 {
        let feedback = (shift ^ (shift >> tap)) & 1;
        (shift >> 1) | (feedback << 14)
    }

    /// Output is high while bit 0 is clear
    fn level(shift: u16, volume: i32) -> i32 {
        if shift & 1 == 0 { volume } else { 0 }
    }

    /// Run the channel from `time` to `end_time`
    pub fn run(&mut self, mut time: Cycle, end_time: Cycle, synth: &Synth, sink: &mut dyn DeltaSink) {
        let period = self.period();
        let tap = self.tap();
        let volume = if self.output.is_some() { self.volume() } else { 0 };

        let amp = Self::level(self.shift_register, volume);
        synth.offset(sink, self.output, time, self.last_amp, amp);
        self.last_amp = amp;

        time += self.delay;
        if time < end_time {
            let mut shift = self.shift_register;
            if volume == 0 {
                // Silent: keep the register exact so the pattern resumes in step
                while time < end_time {
                    shift = Self::clock_shift_register(shift, tap);
                    time += period;
                }
            } else {
                let mut amp = amp;
                loop {
                    // Output flips whenever bits 0 and 1 differ before the shift
                    if (shift ^ (shift >> 1)) & 1 != 0 {
                        let next = volume - amp;
                        synth.offset(sink, self.output, time, amp, next);
                        amp = next;
                    }
                    shift = Self::clock_shift_register(shift, tap);
                    time += period;
                    if time >= end_time {
                        break;
                    }
                }
                self.last_amp = amp;
            }
            self.shift_register = shift;
        }
        self.delay = time - end_time;
    }
}
