use log::{debug, trace};

use crate::chip::{assign_output, AddressWindow, ChipKind, SoundChip};
use crate::error::{ensure_monotonic, Result};
use crate::synth::{Cycle, DeltaSink, OutputTarget, Synth, TrebleEq};

pub const VRC6_OSC_COUNT: usize = 3;
pub const OSC_SAW: usize = 2;

static WINDOWS: [AddressWindow; 3] = [
    AddressWindow::new(0x9000, 0x9003),
    AddressWindow::new(0xA000, 0xA002),
    AddressWindow::new(0xB000, 0xB002),
];

/// One VRC6 voice
///
/// Registers:
/// - 0: square `GDDD VVVV` ignore-duty, duty, volume; saw `--AA AAAA` accumulator rate
/// - 1: period low 8 bits
/// - 2: `E--- PPPP` enable, period high 4 bits
#[derive(Debug, Clone, Default)]
struct Vrc6Osc {
    regs: [u8; 3],
    delay: Cycle,
    last_amp: i32,
    phase: u8,
    /// Saw accumulator
    amp: u8,
}

impl Vrc6Osc {
    fn reset(&mut self) {
        *self = Self {
            phase: 1,
            ..Self::default()
        };
    }

    fn period(&self, shift: u32) -> Cycle {
        let raw = ((self.regs[2] & 0x0F) as Cycle) << 8 | self.regs[1] as Cycle;
        (raw >> shift) + 1
    }

    fn enabled(&self) -> bool {
        self.regs[2] & 0x80 != 0
    }
}

/// Konami VRC6: two pulse voices with 8 duty settings and a sawtooth
pub struct Vrc6 {
    oscs: [Vrc6Osc; VRC6_OSC_COUNT],
    outputs: [OutputTarget; VRC6_OSC_COUNT],
    /// $9003: bit 0 halts every voice, bits 1-2 speed up all periods
    frequency_control: u8,
    last_time: Cycle,
    square_synth: Synth,
    saw_synth: Synth,
}

impl Default for Vrc6 {
    fn default() -> Self {
        Self::new()
    }
}

impl Vrc6 {
    pub fn new() -> Self {
        let mut vrc6 = Self {
            oscs: Default::default(),
            outputs: [None; VRC6_OSC_COUNT],
            frequency_control: 0,
            last_time: 0,
            square_synth: Synth::new(0.0967, 15),
            saw_synth: Synth::new(0.1934, 31),
        };
        vrc6.reset();
        vrc6
    }

    pub fn regs(&self, osc: usize) -> Option<&[u8; 3]> {
        self.oscs.get(osc).map(|o| &o.regs)
    }

    pub fn frequency_control(&self) -> u8 {
        self.frequency_control
    }

    fn halted(&self) -> bool {
        self.frequency_control & 0x01 != 0
    }

    /// Period divider shift selected by $9003; the x256 setting wins
    fn period_shift(&self) -> u32 {
        if self.frequency_control & 0x04 != 0 {
            8
        } else if self.frequency_control & 0x02 != 0 {
            4
        } else {
            0
        }
    }

    fn run_square(&mut self, index: usize, end_time: Cycle, sink: &mut dyn DeltaSink) {
        let shift = self.period_shift();
        let halted = self.halted();
        let output = self.outputs[index];
        let synth = &self.square_synth;
        let osc = &mut self.oscs[index];

        let mut volume = (osc.regs[0] & 0x0F) as i32;
        if !osc.enabled() {
            volume = 0;
        }
        let gate = osc.regs[0] & 0x80 != 0;
        let duty = ((osc.regs[0] >> 4) & 7) + 1;

        let amp = if gate || osc.phase < duty { volume } else { 0 };
        let mut time = self.last_time;
        synth.offset(sink, output, time, osc.last_amp, amp);
        osc.last_amp = amp;

        time += osc.delay;
        osc.delay = 0;
        let period = osc.period(shift);
        if volume != 0 && !gate && period > 4 && !halted {
            if time < end_time {
                let mut phase = osc.phase;
                loop {
                    phase += 1;
                    if phase == 16 {
                        phase = 0;
                        synth.offset(sink, output, time, osc.last_amp, volume);
                        osc.last_amp = volume;
                    }
                    if phase == duty {
                        synth.offset(sink, output, time, osc.last_amp, 0);
                        osc.last_amp = 0;
                    }
                    time += period;
                    if time >= end_time {
                        break;
                    }
                }
                osc.phase = phase;
            }
            osc.delay = time - end_time;
        }
    }

    fn run_saw(&mut self, end_time: Cycle, sink: &mut dyn DeltaSink) {
        let shift = self.period_shift();
        let halted = self.halted();
        let output = self.outputs[OSC_SAW];
        let synth = &self.saw_synth;
        let osc = &mut self.oscs[OSC_SAW];

        let mut amp = osc.amp;
        let amp_step = osc.regs[0] & 0x3F;
        let mut time = self.last_time;
        let mut last_amp = osc.last_amp;
        if !osc.enabled() || (amp_step | amp) == 0 || halted {
            osc.delay = 0;
            let level = (amp >> 3) as i32;
            synth.offset(sink, output, time, last_amp, level);
            last_amp = level;
        } else {
            time += osc.delay;
            if time < end_time {
                // The accumulator is clocked every other period and reset on the 7th clock
                let period = osc.period(shift) * 2;
                let mut phase = osc.phase;
                loop {
                    phase -= 1;
                    if phase == 0 {
                        phase = 7;
                        amp = 0;
                    }
                    let level = (amp >> 3) as i32;
                    if level != last_amp {
                        synth.offset(sink, output, time, last_amp, level);
                        last_amp = level;
                    }
                    time += period;
                    amp = amp.wrapping_add(amp_step);
                    if time >= end_time {
                        break;
                    }
                }
                osc.phase = phase;
                osc.amp = amp;
            }
            osc.delay = time - end_time;
        }
        osc.last_amp = last_amp;
    }

    fn run_channels(&mut self, end_time: Cycle, sink: &mut dyn DeltaSink) {
        if end_time <= self.last_time {
            return;
        }
        self.run_square(0, end_time, sink);
        self.run_square(1, end_time, sink);
        self.run_saw(end_time, sink);
        self.last_time = end_time;
    }
}

impl SoundChip for Vrc6 {
    fn kind(&self) -> ChipKind {
        ChipKind::Vrc6
    }

    fn windows(&self) -> &'static [AddressWindow] {
        &WINDOWS
    }

    fn osc_count(&self) -> usize {
        VRC6_OSC_COUNT
    }

    fn reset(&mut self) {
        self.last_time = 0;
        self.frequency_control = 0;
        for osc in self.oscs.iter_mut() {
            osc.reset();
        }
    }

    fn write_register(
        &mut self,
        time: Cycle,
        addr: u16,
        value: u8,
        sink: &mut dyn DeltaSink,
    ) -> Result<()> {
        if !self.claims(addr) {
            return Ok(());
        }
        ensure_monotonic(self.name(), time, self.last_time)?;
        self.run_channels(time, sink);
        trace!("vrc6: {:04X} = {:02X} at {}", addr, value, time);

        if addr == 0x9003 {
            if value != self.frequency_control {
                debug!("vrc6: frequency control {:02X}", value);
            }
            self.frequency_control = value;
            return Ok(());
        }
        let osc = ((addr >> 12) - 9) as usize;
        let reg = (addr & 3) as usize;
        self.oscs[osc].regs[reg] = value;
        Ok(())
    }

    fn run_until(&mut self, time: Cycle, sink: &mut dyn DeltaSink) -> Result<()> {
        ensure_monotonic(self.name(), time, self.last_time)?;
        self.run_channels(time, sink);
        Ok(())
    }

    fn end_frame(&mut self, time: Cycle, sink: &mut dyn DeltaSink) -> Result<()> {
        ensure_monotonic(self.name(), time, self.last_time)?;
        self.run_channels(time, sink);
        self.last_time -= time;
        Ok(())
    }

    fn set_output(&mut self, osc: usize, target: OutputTarget) -> Result<()> {
        let previous = self.outputs.get(osc).copied().flatten();
        assign_output(self.name(), &mut self.outputs, osc, target)?;
        if previous != target {
            self.oscs[osc].last_amp = 0;
        }
        Ok(())
    }

    fn set_volume(&mut self, volume: f64) {
        self.square_synth.set_volume(volume);
        self.saw_synth.set_volume(volume);
    }

    fn set_treble_eq(&mut self, eq: TrebleEq) {
        self.square_synth.set_treble_eq(eq);
        self.saw_synth.set_treble_eq(eq);
    }
}
