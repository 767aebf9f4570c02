//! Per-hop feature extractors feeding the audio analysis.
//!
//! The analyzer slices decoded PCM into hop-windows and runs three detectors
//! over them: a tempo tracker (energy-flux onsets with an inter-onset bpm
//! estimate), a pitch tracker (autocorrelation over the last full window) and
//! an RMS level estimator.

use std::collections::VecDeque;

/// Samples per hop fed into the detectors.
pub const HOP_SIZE: usize = 256;
/// Samples per analysis window (pitch detection looks this far back).
pub const WIN_SIZE: usize = 1024;

/// Floor applied to level measurements, in dB.
pub const SILENCE_DB: f64 = -90.0;

const MIN_BEAT_GAP_MS: f64 = 250.0;
const MIN_BPM: f64 = 40.0;
const MAX_BPM: f64 = 240.0;
const DEFAULT_BPM: i32 = 120;

/// Energy floor below which a hop counts as silence.
const ENERGY_FLOOR: f64 = 1e-6;

/// A detected beat: where it sits on the timeline and the current tempo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beat {
    pub time_ms: f64,
    pub bpm: i32,
}

/// RMS level of a hop in dB, floored at [`SILENCE_DB`].
pub fn level_db(hop: &[f32]) -> f64 {
    if hop.is_empty() {
        return SILENCE_DB;
    }
    let mean_sq: f64 = hop.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / hop.len() as f64;
    let rms = mean_sq.sqrt();
    if rms <= 0.0 {
        return SILENCE_DB;
    }
    (20.0 * rms.log10()).max(SILENCE_DB)
}

/// Maps a hop to the 0-100 level scale used by beat points:
/// `100 - (-level_db)`, clamped.
pub fn level_percent(hop: &[f32]) -> i32 {
    (100.0 + level_db(hop)).clamp(0.0, 100.0).round() as i32
}

/// Onset-based tempo tracker.
///
/// A hop is an onset when its energy clearly exceeds the recent average and
/// the previous hop (rising edge), with a refractory gap so one drum hit does
/// not produce a burst of beats. The bpm is the smoothed inter-onset rate.
pub struct TempoDetector {
    sample_rate: u32,
    hops_seen: u64,
    history: VecDeque<f64>,
    prev_energy: f64,
    last_beat_ms: f64,
    intervals: VecDeque<f64>,
}

impl TempoDetector {
    const HISTORY_LEN: usize = 43; // roughly 0.25s of hops at 44.1kHz
    const INTERVAL_MEMORY: usize = 8;

    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            hops_seen: 0,
            history: VecDeque::with_capacity(Self::HISTORY_LEN),
            prev_energy: 0.0,
            last_beat_ms: f64::NEG_INFINITY,
            intervals: VecDeque::with_capacity(Self::INTERVAL_MEMORY),
        }
    }

    /// Feeds one hop; returns a beat if this hop starts one.
    pub fn process(&mut self, hop: &[f32]) -> Option<Beat> {
        let time_ms =
            (self.hops_seen * HOP_SIZE as u64) as f64 / self.sample_rate as f64 * 1000.0;
        self.hops_seen += 1;

        let energy: f64 =
            hop.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / hop.len().max(1) as f64;

        let average = if self.history.is_empty() {
            0.0
        } else {
            self.history.iter().sum::<f64>() / self.history.len() as f64
        };
        if self.history.len() == Self::HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(energy);

        let prev = self.prev_energy;
        self.prev_energy = energy;

        let rising = energy > prev * 1.5;
        let loud = energy > ENERGY_FLOOR && energy > average * 1.5 + ENERGY_FLOOR;
        if !(rising && loud) {
            return None;
        }
        if time_ms - self.last_beat_ms < MIN_BEAT_GAP_MS {
            return None;
        }

        if self.last_beat_ms.is_finite() {
            if self.intervals.len() == Self::INTERVAL_MEMORY {
                self.intervals.pop_front();
            }
            self.intervals.push_back(time_ms - self.last_beat_ms);
        }
        self.last_beat_ms = time_ms;

        Some(Beat {
            time_ms,
            bpm: self.current_bpm(),
        })
    }

    fn current_bpm(&self) -> i32 {
        if self.intervals.is_empty() {
            return DEFAULT_BPM;
        }
        let avg = self.intervals.iter().sum::<f64>() / self.intervals.len() as f64;
        (60_000.0 / avg).clamp(MIN_BPM, MAX_BPM).round() as i32
    }
}

/// Monophonic pitch tracker emitting MIDI note numbers.
///
/// Keeps the last [`WIN_SIZE`] samples and runs a plain autocorrelation over
/// them. A note is emitted when the window is loud enough, the correlation is
/// confident and the pitch differs from the last emission (so a held note is
/// reported once).
pub struct NoteDetector {
    sample_rate: u32,
    window: VecDeque<f32>,
    last_emitted: Option<i32>,
}

impl NoteDetector {
    const MIN_FREQ: f64 = 87.0;
    const MAX_FREQ: f64 = 1760.0;
    const CONFIDENCE: f64 = 0.5;

    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            window: VecDeque::with_capacity(WIN_SIZE),
            last_emitted: None,
        }
    }

    /// Feeds one hop; returns a MIDI note if a new pitch onset is heard.
    pub fn process(&mut self, hop: &[f32]) -> Option<i32> {
        for &s in hop {
            if self.window.len() == WIN_SIZE {
                self.window.pop_front();
            }
            self.window.push_back(s);
        }
        if self.window.len() < WIN_SIZE {
            return None;
        }

        let buf: Vec<f32> = self.window.iter().copied().collect();
        let energy: f64 =
            buf.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / buf.len() as f64;
        if energy < ENERGY_FLOOR * 10.0 {
            // Silence ends the current note; the next onset is a fresh emission.
            self.last_emitted = None;
            return None;
        }

        let freq = self.detect_frequency(&buf)?;
        let midi = (69.0 + 12.0 * (freq / 440.0).log2()).round() as i32;
        if !(0..=127).contains(&midi) {
            return None;
        }
        if self.last_emitted == Some(midi) {
            return None;
        }
        self.last_emitted = Some(midi);
        Some(midi)
    }

    fn detect_frequency(&self, buf: &[f32]) -> Option<f64> {
        let r0: f64 = buf.iter().map(|&s| (s as f64) * (s as f64)).sum();
        if r0 <= 0.0 {
            return None;
        }
        let min_lag = (self.sample_rate as f64 / Self::MAX_FREQ).floor().max(2.0) as usize;
        let max_lag = ((self.sample_rate as f64 / Self::MIN_FREQ).ceil() as usize)
            .min(buf.len() / 2);
        if min_lag >= max_lag {
            return None;
        }

        let mut corrs = Vec::with_capacity(max_lag - min_lag + 1);
        let mut best_corr = 0.0f64;
        for lag in min_lag..=max_lag {
            let mut corr = 0.0;
            for i in 0..buf.len() - lag {
                corr += buf[i] as f64 * buf[i + lag] as f64;
            }
            // Normalize by overlap so long lags are not penalized.
            corr /= (buf.len() - lag) as f64;
            corrs.push((lag, corr));
            best_corr = best_corr.max(corr);
        }

        // A periodic signal correlates almost equally at every multiple of its
        // period; take the smallest lag close to the maximum so subharmonics
        // cannot win.
        let best_lag = corrs
            .iter()
            .find(|(_, corr)| *corr >= best_corr * 0.95)
            .map(|(lag, _)| *lag)?;

        let normalized = best_corr / (r0 / buf.len() as f64);
        if normalized < Self::CONFIDENCE {
            return None;
        }
        Some(self.sample_rate as f64 / best_lag as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, sample_rate: u32, len: usize, amp: f32) -> Vec<f32> {
        (0..len)
            .map(|i| {
                (2.0 * std::f64::consts::PI * freq * i as f64 / sample_rate as f64).sin() as f32
                    * amp
            })
            .collect()
    }

    #[test]
    fn test_level_of_silence() {
        let silence = vec![0.0f32; HOP_SIZE];
        assert_eq!(level_db(&silence), SILENCE_DB);
        assert_eq!(level_percent(&silence), 10);
    }

    #[test]
    fn test_level_of_full_scale() {
        let loud = vec![1.0f32; HOP_SIZE];
        assert_eq!(level_percent(&loud), 100);
    }

    #[test]
    fn test_tempo_detects_burst_after_silence() {
        let sr = 44_100;
        let mut tempo = TempoDetector::new(sr);
        let silence = vec![0.0f32; HOP_SIZE];
        for _ in 0..20 {
            assert!(tempo.process(&silence).is_none());
        }
        let burst = sine(440.0, sr, HOP_SIZE, 0.8);
        let beat = tempo.process(&burst);
        assert!(beat.is_some());
        assert_eq!(beat.unwrap().bpm, 120); // no interval history yet
    }

    #[test]
    fn test_tempo_refractory_gap() {
        let sr = 44_100;
        let mut tempo = TempoDetector::new(sr);
        let burst = sine(440.0, sr, HOP_SIZE, 0.8);
        assert!(tempo.process(&burst).is_some());
        // The immediately following loud hop is within the refractory gap.
        assert!(tempo.process(&burst).is_none());
    }

    #[test]
    fn test_note_detector_finds_a440() {
        let sr = 44_100;
        let mut notes = NoteDetector::new(sr);
        let tone = sine(440.0, sr, WIN_SIZE * 2, 0.5);
        let mut detected = Vec::new();
        for hop in tone.chunks(HOP_SIZE) {
            if let Some(midi) = notes.process(hop) {
                detected.push(midi);
            }
        }
        assert_eq!(detected, vec![69]);
    }

    #[test]
    fn test_note_detector_finds_c4() {
        let sr = 44_100;
        let mut notes = NoteDetector::new(sr);
        let tone = sine(261.63, sr, WIN_SIZE * 2, 0.5);
        let mut detected = Vec::new();
        for hop in tone.chunks(HOP_SIZE) {
            if let Some(midi) = notes.process(hop) {
                detected.push(midi);
            }
        }
        assert_eq!(detected, vec![60]);
    }

    #[test]
    fn test_note_detector_silence_emits_nothing() {
        let mut notes = NoteDetector::new(44_100);
        let silence = vec![0.0f32; WIN_SIZE * 2];
        for hop in silence.chunks(HOP_SIZE) {
            assert!(notes.process(hop).is_none());
        }
    }
}
