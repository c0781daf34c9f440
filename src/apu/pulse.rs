use serde::{Deserialize, Serialize};

use super::units::{Envelope, LengthCounter, Sweep};
use crate::synth::{Cycle, DeltaSink, OutputTarget, Synth};

/// Steps in one duty cycle
const PHASE_RANGE: u8 = 8;

/// Pulse wave channel
/// Generates square waves with variable duty cycle
///
/// Registers (offset from the channel base):
/// - 0: DDLC VVVV  duty, loop/halt, constant volume, volume/envelope period
/// - 1: EPPP NSSS  sweep enable, period, negate, shift
/// - 2: LLLL LLLL  timer low
/// - 3: LLLL LHHH  length counter index, timer high
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pulse {
    regs: [u8; 4],

    length_counter: LengthCounter,
    envelope: Envelope,
    sweep: Sweep,
    /// MMC5 pulses have no sweep unit and no low-period silencing
    has_sweep: bool,

    // Sequencer fields
    sequence_position: u8,
    delay: Cycle,
    last_amp: i32,

    #[serde(skip)]
    output: OutputTarget,
}

impl Pulse {
    /// Create a new Pulse channel; pulse 1 negates its sweep with ones' complement
    pub fn new(ones_complement: bool) -> Self {
        Self {
            regs: [0; 4],
            length_counter: LengthCounter::default(),
            envelope: Envelope::default(),
            sweep: Sweep::new(ones_complement),
            has_sweep: true,
            sequence_position: 0,
            delay: 0,
            last_amp: 0,
            output: None,
        }
    }

    /// Create a pulse without sweep unit (MMC5)
    pub fn without_sweep() -> Self {
        Self {
            has_sweep: false,
            ..Self::new(false)
        }
    }

    /// Return to power-on state, keeping the output assignment
    pub fn reset(&mut self) {
        let output = self.output;
        *self = Self {
            sweep: {
                let mut sweep = self.sweep;
                sweep.reset();
                sweep
            },
            has_sweep: self.has_sweep,
            ..Self::new(false)
        };
        self.output = output;
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

    /// Write one of the four channel registers
    /// `length_enabled` is the channel's bit in the status register
    pub fn write_register(&mut self, reg: usize, value: u8, length_enabled: bool) {
        self.regs[reg & 3] = value;
        match reg & 3 {
            1 => self.sweep.request_reload(),
            3 => {
                if length_enabled {
                    self.length_counter.load(value);
                }
                self.envelope.restart();
                // Sequencer restarts at the top of its range
                self.sequence_position = PHASE_RANGE - 1;
            }
            _ => {}
        }
    }

    /// Current 11-bit timer period
    pub fn period(&self) -> u16 {
        ((self.regs[3] & 0x07) as u16) << 8 | self.regs[2] as u16
    }

    pub fn duty_mode(&self) -> u8 {
        self.regs[0] >> 6
    }

    pub fn sequence_position(&self) -> u8 {
        self.sequence_position
    }

    pub fn get_length_counter(&self) -> u8 {
        self.length_counter.value()
    }

    /// Set length counter enabled/disabled (from the status register)
    pub fn set_length_counter_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.length_counter.clear();
        }
    }

    pub fn get_envelope_start_flag(&self) -> bool {
        self.envelope.start_flag()
    }

    pub fn get_sweep_reload(&self) -> bool {
        self.sweep.reload_pending()
    }

    /// Target period of the sweep unit, including the negate complement
    pub fn get_sweep_target_period(&self) -> i32 {
        self.sweep.target_period(self.regs[1], self.period())
    }

    /// Get the envelope volume output (0-15), zero once the length counter expires
    pub fn volume(&self) -> i32 {
        self.envelope.volume(self.regs[0], &self.length_counter)
    }

    /// Mutes if the period is below 8 or the sweep target overflows.
    /// Applies even when the sweep is disabled.
    pub fn is_sweep_muting(&self) -> bool {
        if !self.has_sweep {
            return false;
        }
        let period = self.period();
        let offset = if self.regs[1] & 0x08 != 0 {
            0
        } else {
            period >> (self.regs[1] & 0x07)
        };
        period < 8 || period + offset >= 0x800
    }

    /// Clock the envelope (quarter frame)
    pub fn clock_envelope(&mut self) {
        self.envelope.clock(self.regs[0]);
    }

    /// Clock the length counter (half frame)
    pub fn clock_length_counter(&mut self) {
        self.length_counter.clock(self.regs[0] & 0x20 != 0);
    }

    /// Clock the sweep unit (half frame); a committed period is written back
    /// into the timer registers
    pub fn clock_sweep(&mut self) {
        if !self.has_sweep {
            return;
        }
        if let Some(period) = self.sweep.clock(self.regs[1], self.period()) {
            self.regs[2] = (period & 0xFF) as u8;
            self.regs[3] = (self.regs[3] & !0x07) | ((period >> 8) as u8 & 0x07);
        }
    }

    /// Advance the sequencer `time..end_time` without emitting, keeping phase
    fn maintain_phase(&mut self, time: Cycle, end_time: Cycle, timer_period: Cycle) -> Cycle {
        if time >= end_time {
            return time;
        }
        let count = (end_time - time).div_ceil(timer_period);
        self.sequence_position = ((self.sequence_position as u32 + count) % PHASE_RANGE as u32) as u8;
        time + count * timer_period
    }

    /// Run the channel from `time` to `end_time`, emitting one delta per duty edge
    pub fn run(&mut self, mut time: Cycle, end_time: Cycle, synth: &Synth, sink: &mut dyn DeltaSink) {
        let timer_period = (self.period() as Cycle + 1) * 2;
        let volume = self.volume();

        if self.output.is_none() || volume == 0 || self.is_sweep_muting() {
            if self.last_amp != 0 {
                synth.offset(sink, self.output, time, self.last_amp, 0);
                self.last_amp = 0;
            }
            time += self.delay;
            time = self.maintain_phase(time, end_time, timer_period);
        } else {
            let duty_select = self.duty_mode();
            // 25% negated runs the 25% sequence with inverted output
            let (duty, inverted) = match duty_select {
                3 => (2, true),
                d => (1 << d, false),
            };
            let high = (self.sequence_position < duty) != inverted;
            let mut amp = if high { volume } else { 0 };
            synth.offset(sink, self.output, time, self.last_amp, amp);
            self.last_amp = amp;

            time += self.delay;
            if time < end_time {
                let mut phase = self.sequence_position;
                loop {
                    phase = (phase + 1) & (PHASE_RANGE - 1);
                    if phase == 0 || phase == duty {
                        let next = volume - amp;
                        synth.offset(sink, self.output, time, amp, next);
                        amp = next;
                    }
                    time += timer_period;
                    if time >= end_time {
                        break;
                    }
                }
                self.last_amp = amp;
                self.sequence_position = phase;
            }
        }
        self.delay = time - end_time;
    }
}

impl Default for Pulse {
    fn default() -> Self {
        Self::new(false)
    }
}
