use log::warn;
use serde::{Deserialize, Serialize};

use crate::synth::{Cycle, DeltaSink, OutputTarget, Synth};

/// DMC rate table for NTSC (CPU cycles per output bit)
const DMC_RATE_TABLE: [u16; 16] = [
    428, 380, 340, 320, 286, 254, 226, 214, 190, 160, 142, 128, 106, 84, 72, 54,
];

/// DMC rate table for PAL
const DMC_RATE_TABLE_PAL: [u16; 16] = [
    398, 354, 316, 298, 276, 236, 210, 198, 176, 148, 132, 118, 98, 78, 66, 50,
];

/// Byte returned for sample fetches when no memory is attached
const OPEN_BUS_SAMPLE: u8 = 0x55;

/// Source of DMC sample bytes
///
/// Addresses are CPU-bus addresses in $8000-$FFFF, widened so hosts can
/// back them with a larger mapped image.
pub trait SampleMemory {
    fn read(&self, addr: u32) -> u8;
}

impl<F: Fn(u32) -> u8> SampleMemory for F {
    fn read(&self, addr: u32) -> u8 {
        self(addr)
    }
}

/// Delta Modulation Channel
/// Plays 1-bit delta-encoded samples fetched from CPU memory
///
/// Registers (offset from $4010):
/// - 0: IL-- RRRR  IRQ enable, loop, rate index
/// - 1: -DDD DDDD  direct load of the output level
/// - 2: AAAA AAAA  sample address ($C000 + A * 64)
/// - 3: LLLL LLLL  sample length (L * 16 + 1 bytes)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dmc {
    regs: [u8; 4],
    pal: bool,

    irq_enabled: bool,
    irq_flag: bool,
    next_irq: Option<Cycle>,

    // Memory reader
    current_address: u16,
    bytes_remaining: u16,
    sample_buffer: u8,
    sample_buffer_full: bool,

    // Output unit
    period: Cycle,
    shift_register: u8,
    bits_remaining: u8,
    silence: bool,
    output_level: u8,

    delay: Cycle,
    last_amp: i32,

    #[serde(skip)]
    output: OutputTarget,
    #[serde(skip)]
    warned_no_memory: bool,
}

impl Default for Dmc {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Dmc {
    /// Create a new DMC channel
    pub fn new(pal: bool) -> Self {
        Self {
            regs: [0; 4],
            pal,
            irq_enabled: false,
            irq_flag: false,
            next_irq: None,
            current_address: 0,
            bytes_remaining: 0,
            sample_buffer: 0,
            sample_buffer_full: false,
            period: DMC_RATE_TABLE[0] as Cycle,
            shift_register: 0,
            bits_remaining: 1,
            silence: true,
            output_level: 0,
            delay: 0,
            last_amp: 0,
            output: None,
            warned_no_memory: false,
        }
    }

    pub fn reset(&mut self) {
        let output = self.output;
        let warned = self.warned_no_memory;
        *self = Self::new(self.pal);
        self.output = output;
        self.warned_no_memory = warned;
    }

    pub fn set_pal(&mut self, pal: bool) {
        self.pal = pal;
        self.period = self.rate(self.regs[0]);
    }

    pub fn set_output(&mut self, target: OutputTarget) {
        if target != self.output {
            self.last_amp = self.output_level as i32;
        }
        self.output = target;
    }

    /// Take over `state`, keeping this channel's output and the level already sent to it
    pub(crate) fn restore(&mut self, state: &Self) {
        let (output, last_amp) = (self.output, self.last_amp);
        let warned = self.warned_no_memory;
        *self = state.clone();
        self.warned_no_memory = warned;
        self.output = output;
        self.last_amp = last_amp;
    }

    pub fn output(&self) -> OutputTarget {
        self.output
    }

    /// Current 7-bit DAC level
    pub fn output_level(&self) -> u8 {
        self.output_level
    }

    /// Align the emitted level with the DAC without producing a step
    pub(crate) fn sync_last_amp(&mut self) {
        self.last_amp = self.output_level as i32;
    }

    pub fn regs(&self) -> &[u8; 4] {
        &self.regs
    }

    pub fn period(&self) -> Cycle {
        self.period
    }

    fn rate(&self, value: u8) -> Cycle {
        let index = (value & 0x0F) as usize;
        if self.pal {
            DMC_RATE_TABLE_PAL[index] as Cycle
        } else {
            DMC_RATE_TABLE[index] as Cycle
        }
    }

    /// Write one of the channel registers ($4010-$4013)
    ///
    /// `last_dmc_time` is the time the channel has been run to; it anchors the
    /// IRQ prediction.
    pub fn write_register(&mut self, reg: usize, value: u8, last_dmc_time: Cycle) {
        self.regs[reg & 3] = value;
        match reg & 3 {
            0 => {
                self.period = self.rate(value);
                // IRQ only fires when looping is off
                self.irq_enabled = value & 0xC0 == 0x80;
                self.irq_flag &= self.irq_enabled;
                self.recalc_irq(last_dmc_time);
            }
            1 => self.output_level = value & 0x7F,
            _ => {}
        }
    }

    pub fn get_irq_flag(&self) -> bool {
        self.irq_flag
    }

    pub fn clear_irq_flag(&mut self) {
        self.irq_flag = false;
    }

    pub fn is_irq_enabled(&self) -> bool {
        self.irq_enabled
    }

    /// Predicted time of the next sample-end IRQ, if one is pending
    pub fn next_irq(&self) -> Option<Cycle> {
        self.next_irq
    }

    pub fn has_bytes_remaining(&self) -> bool {
        self.bytes_remaining > 0
    }

    pub fn get_bytes_remaining(&self) -> u16 {
        self.bytes_remaining
    }

    /// Silence the memory reader (status register bit 4 cleared)
    pub fn stop(&mut self) {
        self.bytes_remaining = 0;
        self.next_irq = None;
    }

    /// Start playback (status register bit 4 set with nothing left to play)
    pub fn start(&mut self, memory: Option<&dyn SampleMemory>, last_dmc_time: Cycle) {
        self.restart_sample();
        self.fill_buffer(memory);
        self.recalc_irq(last_dmc_time);
    }

    fn restart_sample(&mut self) {
        self.current_address = 0xC000 | ((self.regs[2] as u16) << 6);
        self.bytes_remaining = ((self.regs[3] as u16) << 4) + 1;
    }

    fn recalc_irq(&mut self, last_dmc_time: Cycle) {
        self.next_irq = if self.irq_enabled && self.bytes_remaining > 0 {
            let bits = (self.bytes_remaining as Cycle - 1) * 8 + self.bits_remaining as Cycle - 1;
            Some(last_dmc_time + self.delay + bits * self.period + 1)
        } else {
            None
        };
    }

    fn fetch(&mut self, memory: Option<&dyn SampleMemory>, addr: u16) -> u8 {
        match memory {
            Some(memory) => memory.read(addr as u32),
            None => {
                if !self.warned_no_memory {
                    warn!("dmc: sample fetch at {addr:#06x} with no memory attached");
                    self.warned_no_memory = true;
                }
                OPEN_BUS_SAMPLE
            }
        }
    }

    /// Refill the sample buffer from memory if it is empty
    fn fill_buffer(&mut self, memory: Option<&dyn SampleMemory>) {
        if self.sample_buffer_full || self.bytes_remaining == 0 {
            return;
        }
        let addr = self.current_address;
        self.sample_buffer = self.fetch(memory, addr);
        self.sample_buffer_full = true;
        // Address wraps from $FFFF to $8000
        self.current_address = self.current_address.wrapping_add(1) | 0x8000;
        self.bytes_remaining -= 1;
        if self.bytes_remaining == 0 {
            if self.regs[0] & 0x40 != 0 {
                self.restart_sample();
            } else {
                self.irq_flag = self.irq_enabled;
                self.next_irq = None;
            }
        }
    }

    /// Run the channel from `time` to `end_time`
    pub fn run(
        &mut self,
        mut time: Cycle,
        end_time: Cycle,
        memory: Option<&dyn SampleMemory>,
        synth: &Synth,
        sink: &mut dyn DeltaSink,
    ) {
        let amp = self.output_level as i32;
        synth.offset(sink, self.output, time, self.last_amp, amp);
        self.last_amp = amp;

        time += self.delay;
        if time < end_time {
            let period = self.period;
            if self.silence && !self.sample_buffer_full {
                // Nothing to play: skip ahead keeping the bit counter in step
                let count = (end_time - time).div_ceil(period);
                self.bits_remaining =
                    ((self.bits_remaining as Cycle - 1 + 8 - count % 8) % 8 + 1) as u8;
                time += count * period;
            } else {
                let mut level = self.output_level as i32;
                loop {
                    if !self.silence {
                        let step = if self.shift_register & 1 != 0 { 2 } else { -2 };
                        self.shift_register >>= 1;
                        if (0..=0x7F).contains(&(level + step)) {
                            synth.offset(sink, self.output, time, level, level + step);
                            level += step;
                        }
                    }
                    time += period;
                    self.bits_remaining -= 1;
                    if self.bits_remaining == 0 {
                        self.bits_remaining = 8;
                        if self.sample_buffer_full {
                            self.silence = false;
                            self.shift_register = self.sample_buffer;
                            self.sample_buffer_full = false;
                            self.fill_buffer(memory);
                        } else {
                            self.silence = true;
                        }
                    }
                    if time >= end_time {
                        break;
                    }
                }
                self.output_level = level as u8;
                self.last_amp = level;
            }
        }
        self.delay = time - end_time;
    }

    /// Make recorded times relative to a frame that starts at `end_time`
    pub fn end_frame(&mut self, end_time: Cycle) {
        if let Some(irq) = self.next_irq {
            self.next_irq = Some(irq.saturating_sub(end_time));
        }
    }
}
