use log::{debug, trace};

use crate::chip::{assign_output, AddressWindow, ChipKind, SoundChip};
use crate::error::{ensure_monotonic, Result};
use crate::seek::ShadowRegisters;
use crate::synth::{Cycle, DeltaSink, OutputTarget, Synth, TrebleEq};

pub const FDS_OSC_COUNT: usize = 1;

const IO_ADDR: u16 = 0x4040;
const WAVE_SIZE: usize = 0x40;
const REGS_SIZE: usize = 0x4B; // $4040-$408A

const FRACT_RANGE: i32 = 65536;
const LFO_BASE_TEMPO: i32 = 8;
const VOL_MAX: i32 = 0x20;
const WAVE_SAMPLE_MAX: u8 = 0x3F;

/// Master volume for $4089 bits 0-1: 100%, 67%, 50% and 40% of 10
const MASTER_VOLUMES: [i32; 4] = [10, 7, 5, 4];

/// Modulator step per 3-bit table entry; entry 4 resets the counter
const MOD_TABLE: [i32; 8] = [0, 1, 2, 4, 0, -4, -2, -1];

/// Shadow slots beside the plain register addresses: last $4080/$4084 value
/// per envelope mode, and modulation table entries by pair index
const GAIN_MODE_SLOT: u16 = 0x1000;
const SPEED_MODE_SLOT: u16 = 0x2000;
const MOD_TABLE_SLOT: u16 = 0x3000;
const MOD_ENTRIES: u8 = (WAVE_SIZE / 2) as u8;
/// Shadow latch ports: next modulation table pair, pairs written while seeking
const MOD_POS_PORT: u8 = 0;
const MOD_COUNT_PORT: u8 = 1;

static WINDOWS: [AddressWindow; 1] = [AddressWindow::new(0x4040, 0x408A)];

/// Famicom Disk System audio: a 64-step wavetable with volume envelope and a
/// frequency modulation unit
///
/// Registers:
/// - $4040-$407F: wave RAM, writable while $4089 bit 7 is set
/// - $4080: volume envelope (`MD SSSSSS` mode/disable, speed or gain)
/// - $4082/$4083: wave frequency, $4083 bit 7 halts the wave, bit 6 the envelopes
/// - $4084: sweep (modulation depth) envelope
/// - $4085: modulation counter
/// - $4086/$4087: modulation frequency, $4087 bit 7 halts modulation
/// - $4088: append to the modulation table while modulation is halted
/// - $4089: wave write enable, master volume
/// - $408A: envelope speed multiplier
pub struct Fds {
    regs: [u8; REGS_SIZE],
    mod_wave: [u8; WAVE_SIZE],

    env_gain: i32,
    env_speed: i32,
    env_delay: i32,
    sweep_gain: i32,
    sweep_speed: i32,
    sweep_delay: i32,

    wave_pos: usize,
    wave_fract: i32,
    mod_fract: i32,
    mod_pos: usize,
    mod_write_pos: usize,
    lfo_tempo: i32,

    last_amp: i32,
    last_time: Cycle,
    output: OutputTarget,
    synth: Synth,
}

impl Default for Fds {
    fn default() -> Self {
        Self::new()
    }
}

impl Fds {
    pub fn new() -> Self {
        let mut fds = Self {
            regs: [0; REGS_SIZE],
            mod_wave: [0; WAVE_SIZE],
            env_gain: 0,
            env_speed: 0,
            env_delay: 0,
            sweep_gain: 0,
            sweep_speed: 0,
            sweep_delay: 0,
            wave_pos: 0,
            wave_fract: FRACT_RANGE,
            mod_fract: FRACT_RANGE,
            mod_pos: 0,
            mod_write_pos: 0,
            lfo_tempo: LFO_BASE_TEMPO,
            last_amp: 0,
            last_time: 0,
            output: None,
            synth: Synth::new(0.14, VOL_MAX * WAVE_SAMPLE_MAX as i32 * MASTER_VOLUMES[0]),
        };
        fds.reset();
        fds
    }

    fn reg(&self, addr: u16) -> u8 {
        self.regs[(addr - IO_ADDR) as usize]
    }

    /// Register value as a seek would leave it
    fn shadowed_reg(&self, shadow: &ShadowRegisters, addr: u16) -> u8 {
        shadow.get(ChipKind::Fds, addr).unwrap_or(self.reg(addr))
    }

    fn reg_mut(&mut self, addr: u16) -> &mut u8 {
        &mut self.regs[(addr - IO_ADDR) as usize]
    }

    pub fn wave(&self) -> &[u8] {
        &self.regs[..WAVE_SIZE]
    }

    /// $4080-$408A as last written or updated by the envelopes
    pub fn control_regs(&self) -> &[u8] {
        &self.regs[WAVE_SIZE..]
    }

    pub fn mod_table(&self) -> &[u8; WAVE_SIZE] {
        &self.mod_wave
    }

    pub fn env_gain(&self) -> i32 {
        self.env_gain
    }

    pub fn sweep_gain(&self) -> i32 {
        self.sweep_gain
    }

    pub fn wave_pos(&self) -> usize {
        self.wave_pos
    }

    /// Scale envelope timing for playback tempos other than 1.0
    pub fn set_tempo(&mut self, tempo: f64) {
        self.lfo_tempo = LFO_BASE_TEMPO;
        if tempo != 1.0 {
            self.lfo_tempo = ((LFO_BASE_TEMPO as f64 / tempo + 0.5) as i32).max(1);
        }
    }

    fn apply_write(&mut self, addr: u16, value: u8) {
        let reg = (addr - IO_ADDR) as usize;
        if reg >= REGS_SIZE {
            return;
        }
        if reg < WAVE_SIZE {
            if self.reg(0x4089) & 0x80 != 0 {
                self.regs[reg] = value & WAVE_SAMPLE_MAX;
            }
            return;
        }
        self.regs[reg] = value;
        match addr {
            0x4080 => {
                if value & 0x80 != 0 {
                    self.env_gain = (value & 0x3F) as i32;
                } else {
                    self.env_speed = (value & 0x3F) as i32 + 1;
                }
            }
            0x4084 => {
                if value & 0x80 != 0 {
                    self.sweep_gain = (value & 0x3F) as i32;
                } else {
                    self.sweep_speed = (value & 0x3F) as i32 + 1;
                }
            }
            0x4085 => {
                self.mod_pos = self.mod_write_pos;
                *self.reg_mut(0x4085) = value & 0x7F;
            }
            0x4088 => {
                if self.reg(0x4087) & 0x80 != 0 {
                    let pos = self.mod_write_pos;
                    let value = value & 0x07;
                    self.mod_wave[pos] = value;
                    self.mod_wave[pos + 1] = value;
                    self.mod_write_pos = (pos + 2) & (WAVE_SIZE - 1);
                    self.mod_pos = (self.mod_pos + 2) & (WAVE_SIZE - 1);
                }
            }
            0x4089 => {
                trace!("fds: wave write {}", if value & 0x80 != 0 { "on" } else { "off" });
            }
            _ => {}
        }
    }

    /// Bend `wave_freq` by the modulator's current counter and depth
    fn modulated_frequency(wave_freq: i32, sweep_bias: i32, sweep_gain: i32) -> i32 {
        // Counter is a signed 7-bit value
        let sweep_bias = (sweep_bias ^ 0x40) - 0x40;
        let mut factor = sweep_bias * sweep_gain;
        let extra = factor & 0x0F;
        factor >>= 4;
        if extra != 0 {
            factor -= 1;
            if sweep_bias >= 0 {
                factor += 3;
            }
        }
        if factor > 193 {
            factor -= 258;
        }
        if factor < -64 {
            factor += 256;
        }
        wave_freq + ((wave_freq * factor) >> 6)
    }

    fn run_channel(&mut self, final_end_time: Cycle, sink: &mut dyn DeltaSink) {
        if final_end_time <= self.last_time {
            return;
        }
        let final_end = final_end_time as i32;
        let last_time = self.last_time as i32;
        let wave_freq = ((self.reg(0x4083) & 0x0F) as i32) << 8 | self.reg(0x4082) as i32;
        let halted = (self.reg(0x4089) | self.reg(0x4083)) & 0x80 != 0;

        if wave_freq != 0 && !halted {
            let master_volume = MASTER_VOLUMES[(self.reg(0x4089) & 0x03) as usize];

            let mut lfo_period = self.reg(0x408A) as i32 * self.lfo_tempo;
            if self.reg(0x4083) & 0x40 != 0 {
                lfo_period = 0;
            }

            let mut sweep_time = last_time + self.sweep_delay;
            let sweep_period = lfo_period * self.sweep_speed;
            if sweep_period == 0 || self.reg(0x4084) & 0x80 != 0 {
                sweep_time = final_end;
            }

            let mut env_time = last_time + self.env_delay;
            let env_period = lfo_period * self.env_speed;
            if env_period == 0 || self.reg(0x4080) & 0x80 != 0 {
                env_time = final_end;
            }

            let mut mod_freq = 0;
            if self.reg(0x4087) & 0x80 == 0 {
                mod_freq = ((self.reg(0x4087) & 0x0F) as i32) << 8 | self.reg(0x4086) as i32;
            }

            let mut end_time = last_time;
            loop {
                // Sweep envelope
                if sweep_time <= end_time {
                    sweep_time += sweep_period;
                    let mode = (self.reg(0x4084) >> 5 & 2) as i32;
                    let new_gain = self.sweep_gain + mode - 1;
                    if (new_gain as u32) <= (0x80u32 >> mode) {
                        self.sweep_gain = new_gain;
                    } else {
                        *self.reg_mut(0x4084) |= 0x80;
                    }
                }

                // Volume envelope
                if env_time <= end_time {
                    env_time += env_period;
                    let mode = (self.reg(0x4080) >> 5 & 2) as i32;
                    let new_gain = self.env_gain + mode - 1;
                    if (new_gain as u32) <= (0x80u32 >> mode) {
                        self.env_gain = new_gain;
                    } else {
                        *self.reg_mut(0x4080) |= 0x80;
                    }
                }

                let start_time = end_time;
                end_time = final_end.min(env_time).min(sweep_time);

                'wave: {
                    let mut freq = wave_freq;
                    if mod_freq != 0 {
                        // Stop at the next modulator clock
                        let mod_time = start_time + (self.mod_fract + mod_freq - 1) / mod_freq;
                        end_time = end_time.min(mod_time);

                        let sweep_bias = self.reg(0x4085) as i32;
                        self.mod_fract -= (end_time - start_time) * mod_freq;
                        if self.mod_fract <= 0 {
                            self.mod_fract += FRACT_RANGE;
                            let entry = self.mod_wave[self.mod_pos] as usize;
                            self.mod_pos = (self.mod_pos + 1) & (WAVE_SIZE - 1);
                            let new_bias = if entry == 4 {
                                0
                            } else {
                                (sweep_bias + MOD_TABLE[entry]) & 0x7F
                            };
                            *self.reg_mut(0x4085) = new_bias as u8;
                        }

                        freq = Self::modulated_frequency(wave_freq, sweep_bias, self.sweep_gain);
                        if freq <= 0 {
                            break 'wave;
                        }
                    }

                    let mut wave_fract = self.wave_fract;
                    let mut delay = (wave_fract + freq - 1) / freq;
                    let mut time = start_time + delay;
                    if time <= end_time {
                        let min_delay = FRACT_RANGE / freq;
                        let volume = self.env_gain.min(VOL_MAX) * master_volume;
                        let min_fract = min_delay * freq;
                        loop {
                            let amp = self.regs[self.wave_pos] as i32 * volume;
                            self.wave_pos = (self.wave_pos + 1) & (WAVE_SIZE - 1);
                            if amp != self.last_amp {
                                self.synth
                                    .offset(sink, self.output, time as Cycle, self.last_amp, amp);
                                self.last_amp = amp;
                            }
                            wave_fract += FRACT_RANGE - delay * freq;
                            delay = min_delay;
                            if wave_fract > min_fract {
                                delay += 1;
                            }
                            time += delay;
                            if time > end_time {
                                break;
                            }
                        }
                    }
                    self.wave_fract = wave_fract - (end_time - (time - delay)) * freq;
                }

                if end_time >= final_end {
                    break;
                }
            }
            self.env_delay = env_time - final_end;
            self.sweep_delay = sweep_time - final_end;
        }
        self.last_time = final_end_time;
    }
}

impl SoundChip for Fds {
    fn kind(&self) -> ChipKind {
        ChipKind::Fds
    }

    fn windows(&self) -> &'static [AddressWindow] {
        &WINDOWS
    }

    fn osc_count(&self) -> usize {
        FDS_OSC_COUNT
    }

    fn reset(&mut self) {
        self.regs = [0; REGS_SIZE];
        self.mod_wave = [0; WAVE_SIZE];
        self.last_time = 0;
        self.env_delay = 0;
        self.sweep_delay = 0;
        self.wave_pos = 0;
        self.wave_fract = FRACT_RANGE;
        self.mod_fract = FRACT_RANGE;
        self.mod_pos = 0;
        self.mod_write_pos = 0;

        // Envelopes and sweep disabled, wave and modulation halted
        const INITIAL_REGS: [u8; 11] = [0x80, 0, 0, 0xC0, 0x80, 0, 0, 0x80, 0, 0, 0];
        for (i, &value) in INITIAL_REGS.iter().enumerate() {
            let addr = 0x4080 + i as u16;
            // Two writes so both the gain and the speed of the envelopes are set
            self.apply_write(addr, 0);
            self.apply_write(addr, value);
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
        self.run_channel(time, sink);
        if addr >= 0x4080 {
            trace!("fds: {:04X} = {:02X} at {}", addr, value, time);
        }
        if addr == 0x4089 && (value ^ self.reg(0x4089)) & 0x03 != 0 {
            debug!("fds: master volume {}", MASTER_VOLUMES[(value & 0x03) as usize]);
        }
        self.apply_write(addr, value);
        Ok(())
    }

    fn run_until(&mut self, time: Cycle, sink: &mut dyn DeltaSink) -> Result<()> {
        ensure_monotonic(self.name(), time, self.last_time)?;
        self.run_channel(time, sink);
        Ok(())
    }

    fn end_frame(&mut self, time: Cycle, sink: &mut dyn DeltaSink) -> Result<()> {
        ensure_monotonic(self.name(), time, self.last_time)?;
        self.run_channel(time, sink);
        self.last_time -= time;
        Ok(())
    }

    fn set_output(&mut self, osc: usize, target: OutputTarget) -> Result<()> {
        let mut outputs = [self.output];
        assign_output(self.name(), &mut outputs, osc, target)?;
        if self.output != target {
            self.last_amp = 0;
        }
        self.output = target;
        Ok(())
    }

    fn set_volume(&mut self, volume: f64) {
        self.synth.set_volume(volume);
    }

    fn set_treble_eq(&mut self, eq: TrebleEq) {
        self.synth.set_treble_eq(eq);
    }

    /// Wave RAM and modulation table writes only count while their enable bit
    /// is set; each envelope keeps its last gain and its last speed
    fn capture_write(&self, addr: u16, value: u8, shadow: &mut ShadowRegisters) {
        let kind = ChipKind::Fds;
        match addr {
            0x4040..=0x407F => {
                if self.shadowed_reg(shadow, 0x4089) & 0x80 != 0 {
                    shadow.capture(kind, addr, value);
                }
            }
            0x4080 | 0x4084 => {
                let mode = if value & 0x80 != 0 { GAIN_MODE_SLOT } else { SPEED_MODE_SLOT };
                shadow.capture(kind, addr | mode, value);
                shadow.capture(kind, addr, value);
            }
            0x4088 => {
                if self.shadowed_reg(shadow, 0x4087) & 0x80 != 0 {
                    let pos = shadow
                        .latch(kind, MOD_POS_PORT)
                        .unwrap_or((self.mod_write_pos / 2) as u8);
                    shadow.capture(kind, MOD_TABLE_SLOT + pos as u16, value & 0x07);
                    shadow.set_latch(kind, MOD_POS_PORT, (pos + 1) % MOD_ENTRIES);
                    let count = shadow.latch(kind, MOD_COUNT_PORT).unwrap_or(0);
                    shadow.set_latch(kind, MOD_COUNT_PORT, (count + 1).min(MOD_ENTRIES));
                }
            }
            0x4081..=0x408A => shadow.capture(kind, addr, value),
            _ => {}
        }
    }

    /// Wave RAM under a temporary write enable, then the modulation table
    /// under a temporary halt, then the control registers in address order
    fn replay_writes(&self, shadow: &ShadowRegisters) -> Vec<(u16, u8)> {
        let kind = ChipKind::Fds;
        let mut writes = Vec::new();

        let wave: Vec<(u16, u8)> = (0x4040..=0x407F)
            .filter_map(|addr| shadow.get(kind, addr).map(|value| (addr, value)))
            .collect();
        if !wave.is_empty() {
            writes.push((0x4089, self.reg(0x4089) | 0x80));
            writes.extend(wave);
            if shadow.get(kind, 0x4089).is_none() {
                writes.push((0x4089, self.reg(0x4089)));
            }
        }

        if let Some(count) = shadow.latch(kind, MOD_COUNT_PORT) {
            let entries = MOD_ENTRIES as usize;
            let first = self.mod_write_pos / 2;
            let end = shadow.latch(kind, MOD_POS_PORT).map_or(first, usize::from);
            // A wrapped table is rewritten whole, then up to the final position
            let total = match count as usize {
                full if full == entries => entries + (end + entries - first) % entries,
                partial => partial,
            };
            writes.push((0x4087, self.reg(0x4087) | 0x80));
            for i in 0..total {
                let entry = (first + i) % entries;
                if let Some(value) = shadow.get(kind, MOD_TABLE_SLOT + entry as u16) {
                    writes.push((0x4088, value));
                }
            }
            if shadow.get(kind, 0x4087).is_none() {
                writes.push((0x4087, self.reg(0x4087)));
            }
        }

        for addr in (0x4080..=0x408A).filter(|&addr| addr != 0x4088) {
            let Some(value) = shadow.get(kind, addr) else {
                continue;
            };
            if addr == 0x4080 || addr == 0x4084 {
                let other = if value & 0x80 != 0 { SPEED_MODE_SLOT } else { GAIN_MODE_SLOT };
                if let Some(earlier) = shadow.get(kind, addr | other) {
                    writes.push((addr, earlier));
                }
            }
            writes.push((addr, value));
        }
        writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{DeltaLog, NullSink};

    fn write(fds: &mut Fds, time: Cycle, addr: u16, value: u8, sink: &mut dyn DeltaSink) {
        fds.write_register(time, addr, value, sink).unwrap();
    }

    /// Load a square wave and set the volume gain directly
    fn playing_fds(freq: u16, sink: &mut dyn DeltaSink) -> Fds {
        let mut fds = Fds::new();
        fds.set_output(0, Some(0)).unwrap();
        write(&mut fds, 0, 0x4089, 0x80, sink);
        for i in 0..WAVE_SIZE as u16 {
            write(&mut fds, 0, 0x4040 + i, if i < 32 { 0x3F } else { 0 }, sink);
        }
        write(&mut fds, 0, 0x4089, 0x00, sink);
        write(&mut fds, 0, 0x4080, 0x80 | 0x20, sink); // gain 32
        write(&mut fds, 0, 0x4082, (freq & 0xFF) as u8, sink);
        write(&mut fds, 0, 0x4083, (freq >> 8) as u8 & 0x0F, sink);
        fds
    }

    #[test]
    fn test_power_on_state() {
        let fds = Fds::new();
        assert_eq!(fds.reg(0x4080), 0x80);
        assert_eq!(fds.reg(0x4083), 0xC0);
        assert_eq!(fds.reg(0x4087), 0x80);
        assert_eq!(fds.env_gain(), 0);
        assert_eq!(fds.sweep_gain(), 0);
    }

    #[test]
    fn test_wave_ram_needs_write_enable() {
        let mut fds = Fds::new();
        write(&mut fds, 0, 0x4040, 0x3F, &mut NullSink);
        assert_eq!(fds.wave()[0], 0);
        write(&mut fds, 0, 0x4089, 0x80, &mut NullSink);
        write(&mut fds, 0, 0x4040, 0xFF, &mut NullSink);
        assert_eq!(fds.wave()[0], 0x3F);
    }

    #[test]
    fn test_wave_steps_at_frequency() {
        let mut log = DeltaLog::new();
        // freq 0x400: one wave step per 64 cycles, 32-step half wave = 2048 cycles
        let mut fds = playing_fds(0x400, &mut log);
        fds.end_frame(8_192, &mut log).unwrap();
        let times = log.times();
        assert_eq!(times, vec![64, 2_112, 4_160, 6_208]);
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], 2_048);
        }
        assert_eq!(fds.wave_pos(), 0);
    }

    #[test]
    fn test_halted_wave_is_silent() {
        let mut log = DeltaLog::new();
        let mut fds = playing_fds(0x400, &mut log);
        write(&mut fds, 0, 0x4083, 0x84, &mut log);
        fds.end_frame(10_000, &mut log).unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn test_master_volume_scales_amplitude() {
        let mut full = DeltaLog::new();
        let mut quiet = DeltaLog::new();
        let mut a = playing_fds(0x400, &mut full);
        let mut b = playing_fds(0x400, &mut quiet);
        write(&mut b, 0, 0x4089, 0x03, &mut quiet);
        a.end_frame(100, &mut full).unwrap();
        b.end_frame(100, &mut quiet).unwrap();
        assert_eq!(full.net(), a.synth.scale(0x3F * 32 * 10) as i64);
        assert_eq!(quiet.net(), b.synth.scale(0x3F * 32 * 4) as i64);
    }

    #[test]
    fn test_mod_table_writes_pairs() {
        let mut fds = Fds::new();
        write(&mut fds, 0, 0x4088, 0x03, &mut NullSink);
        write(&mut fds, 0, 0x4088, 0x0D, &mut NullSink);
        assert_eq!(&fds.mod_table()[..4], &[3, 3, 5, 5]);
        // Ignored once modulation runs
        write(&mut fds, 0, 0x4087, 0x00, &mut NullSink);
        write(&mut fds, 0, 0x4088, 0x01, &mut NullSink);
        assert_eq!(fds.mod_table()[4], 0);
    }

    fn replay(fds: &mut Fds, shadow: &ShadowRegisters) {
        for (addr, value) in fds.replay_writes(shadow) {
            write(fds, 0, addr, value, &mut NullSink);
        }
    }

    #[test]
    fn test_shadow_replay_keeps_gated_wave_writes() {
        let writes = [
            (0x4089u16, 0x80u8),
            (0x4040, 0x3F),
            (0x4041, 0x20),
            (0x4089, 0x02),
            (0x4042, 0x11),
        ];
        let mut live = Fds::new();
        let mut seeking = Fds::new();
        let mut shadow = ShadowRegisters::new();
        for &(addr, value) in &writes {
            write(&mut live, 0, addr, value, &mut NullSink);
            seeking.capture_write(addr, value, &mut shadow);
        }
        replay(&mut seeking, &shadow);
        assert_eq!(&seeking.wave()[..3], &[0x3F, 0x20, 0]);
        assert_eq!(live.wave(), seeking.wave());
        assert_eq!(live.control_regs(), seeking.control_regs());
    }

    #[test]
    fn test_shadow_replay_rebuilds_mod_table() {
        let mut live = Fds::new();
        let mut seeking = Fds::new();
        let mut shadow = ShadowRegisters::new();
        // 40 pairs wrap the 32-pair table
        let mut writes: Vec<(u16, u8)> = (0..40u8).map(|i| (0x4088, i % 7)).collect();
        writes.push((0x4087, 0x12));
        writes.push((0x4088, 0x05));
        for &(addr, value) in &writes {
            write(&mut live, 0, addr, value, &mut NullSink);
            seeking.capture_write(addr, value, &mut shadow);
        }
        replay(&mut seeking, &shadow);
        assert_eq!(live.mod_table(), seeking.mod_table());
        assert_eq!(live.mod_write_pos, seeking.mod_write_pos);
        assert_eq!(seeking.reg(0x4087), 0x12);
    }

    #[test]
    fn test_shadow_replay_keeps_both_envelope_modes() {
        let mut live = Fds::new();
        let mut seeking = Fds::new();
        let mut shadow = ShadowRegisters::new();
        let writes = [(0x4080u16, 0x9Au8), (0x4080, 0x05), (0x4084, 0x03), (0x4084, 0x88)];
        for &(addr, value) in &writes {
            write(&mut live, 0, addr, value, &mut NullSink);
            seeking.capture_write(addr, value, &mut shadow);
        }
        replay(&mut seeking, &shadow);
        assert_eq!(seeking.env_gain(), 0x1A);
        assert_eq!(seeking.env_speed, live.env_speed);
        assert_eq!(seeking.sweep_gain(), 0x08);
        assert_eq!(seeking.sweep_speed, live.sweep_speed);
        assert_eq!(live.control_regs(), seeking.control_regs());
    }

    #[test]
    fn test_modulated_frequency() {
        assert_eq!(Fds::modulated_frequency(0x400, 0, 32), 0x400);
        // Positive bias raises the pitch, negative lowers it
        assert!(Fds::modulated_frequency(0x400, 0x10, 32) > 0x400);
        assert!(Fds::modulated_frequency(0x400, 0x70, 32) < 0x400);
    }

    #[test]
    fn test_volume_envelope_ramps() {
        let mut log = DeltaLog::new();
        let mut fds = playing_fds(0x400, &mut log);
        write(&mut fds, 0, 0x4080, 0x80, &mut log); // gain 0
        write(&mut fds, 0, 0x4083, 0x04, &mut log); // envelopes enabled
        write(&mut fds, 0, 0x408A, 0x01, &mut log); // lfo period 8 cycles
        write(&mut fds, 0, 0x4080, 0x40, &mut log); // increase, speed 1
        fds.end_frame(1_000, &mut log).unwrap();
        // One step per 8 cycles, capped at 0x20
        assert_eq!(fds.env_gain(), 0x20);
    }
}
