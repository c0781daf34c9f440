use serde::{Deserialize, Serialize};

use super::units::LengthCounter;
use crate::synth::{Cycle, DeltaSink, OutputTarget, Synth};

/// Half the length of the triangle sequence
const PHASE_RANGE: u8 = 16;

/// Triangle wave channel
/// Generates triangle waves with a 32-step linear sequence
///
/// The sequence position counts down through 32..=1; positions 16..=1 ramp
/// the output up from 0 to 15 and 32..=17 ramp it back down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Triangle {
    regs: [u8; 4],

    // Linear counter fields
    linear_counter: u8,
    linear_counter_reload_flag: bool,

    length_counter: LengthCounter,

    // Sequencer fields
    sequence_position: u8,
    delay: Cycle,
    last_amp: i32,

    #[serde(skip)]
    output: OutputTarget,
}

impl Default for Triangle {
    fn default() -> Self {
        Self::new()
    }
}

/// Output level for a sequence position
fn sequence_amp(position: u8) -> i32 {
    let amp = PHASE_RANGE as i32 - position as i32;
    if amp < 0 {
        position as i32 - (PHASE_RANGE as i32 + 1)
    } else {
        amp
    }
}

impl Triangle {
    /// Create a new Triangle channel
    pub fn new() -> Self {
        Self {
            regs: [0; 4],
            linear_counter: 0,
            linear_counter_reload_flag: false,
            length_counter: LengthCounter::default(),
            sequence_position: 1,
            delay: 0,
            // Powers up at full amplitude without a pop
            last_amp: 15,
            output: None,
        }
    }

    pub fn reset(&mut self) {
        let output = self.output;
        *self = Self::new();
        self.output = output;
    }

    pub fn set_output(&mut self, target: OutputTarget) {
        if target != self.output {
            self.last_amp = self.amp();
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

    /// Current output level (0-15)
    pub fn amp(&self) -> i32 {
        sequence_amp(self.sequence_position)
    }

    pub fn sequence_position(&self) -> u8 {
        self.sequence_position
    }

    pub fn regs(&self) -> &[u8; 4] {
        &self.regs
    }

    pub fn period(&self) -> u16 {
        ((self.regs[3] & 0x07) as u16) << 8 | self.regs[2] as u16
    }

    /// Write one of the channel registers ($4008-$400B)
    pub fn write_register(&mut self, reg: usize, value: u8, length_enabled: bool) {
        self.regs[reg & 3] = value;
        if reg & 3 == 3 {
            if length_enabled {
                self.length_counter.load(value);
            }
            self.linear_counter_reload_flag = true;
        }
    }

    pub fn get_length_counter(&self) -> u8 {
        self.length_counter.value()
    }

    pub fn get_linear_counter(&self) -> u8 {
        self.linear_counter
    }

    pub fn get_linear_counter_reload_flag(&self) -> bool {
        self.linear_counter_reload_flag
    }

    pub fn set_length_counter_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.length_counter.clear();
        }
    }

    /// Clock the linear counter (quarter frame)
    pub fn clock_linear_counter(&mut self) {
        if self.linear_counter_reload_flag {
            self.linear_counter = self.regs[0] & 0x7F;
        } else if self.linear_counter > 0 {
            self.linear_counter -= 1;
        }
        if self.regs[0] & 0x80 == 0 {
            self.linear_counter_reload_flag = false;
        }
    }

    /// Clock the length counter (half frame); bit 7 doubles as the halt flag
    pub fn clock_length_counter(&mut self) {
        self.length_counter.clock(self.regs[0] & 0x80 != 0);
    }

    fn is_halted(&self, timer_period: Cycle) -> bool {
        // Periods below 2 are ultrasonic; the sequencer is frozen instead
        !self.length_counter.is_active() || self.linear_counter == 0 || timer_period < 3
    }

    fn next_position(position: u8) -> u8 {
        if position == 1 {
            PHASE_RANGE * 2
        } else {
            position - 1
        }
    }

    /// Run the channel from `time` to `end_time`
    pub fn run(&mut self, mut time: Cycle, end_time: Cycle, synth: &Synth, sink: &mut dyn DeltaSink) {
        let timer_period = self.period() as Cycle + 1;

        if self.output.is_none() {
            time += self.delay;
            self.delay = 0;
            if !self.is_halted(timer_period) && time < end_time {
                let count = (end_time - time).div_ceil(timer_period);
                let steps = (count % (PHASE_RANGE as u32 * 2)) as i32;
                let position = (self.sequence_position as i32 - 1 - steps)
                    .rem_euclid(PHASE_RANGE as i32 * 2)
                    + 1;
                self.sequence_position = position as u8;
                self.last_amp = self.amp();
                time += count * timer_period;
            }
            self.delay = time.saturating_sub(end_time);
            return;
        }

        let amp = self.amp();
        synth.offset(sink, self.output, time, self.last_amp, amp);
        self.last_amp = amp;

        time += self.delay;
        if self.is_halted(timer_period) {
            time = end_time;
        } else if time < end_time {
            let mut position = self.sequence_position;
            let mut amp = amp;
            loop {
                position = Self::next_position(position);
                let next = sequence_amp(position);
                if next != amp {
                    synth.offset(sink, self.output, time, amp, next);
                    amp = next;
                }
                time += timer_period;
                if time >= end_time {
                    break;
                }
            }
            self.sequence_position = position;
            self.last_amp = amp;
        }
        self.delay = time - end_time;
    }
}
