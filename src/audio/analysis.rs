//! Audio analysis: turns a decoded song into beats, notes, keys and levels.
//!
//! The analyzer feeds hop-windows into the detectors and collects one
//! [`BeatPoint`] per detected beat. The beat timeline is then segmented into
//! intervals, each carrying an estimated key, signature and darkness. A
//! finished analysis is persisted as JSON next to the source file and loaded
//! from there on later runs instead of re-decoding.

use crate::audio::detector::{self, HOP_SIZE, NoteDetector, TempoDetector};
use crate::shared::error::GameError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Fixed pitch-class name table; index is the pitch class.
pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "Eb", "E", "F", "F#", "G", "Ab", "A", "Bb", "B",
];

/// Semitone steps of the major scale, relative to the root.
pub const MAJOR_STEPS: [usize; 7] = [0, 2, 4, 5, 7, 9, 11];
/// Semitone steps of the natural minor scale, relative to the root.
pub const MINOR_STEPS: [usize; 7] = [0, 2, 3, 5, 7, 8, 10];

/// Number of intervals the beat timeline is segmented into.
pub const NUM_INTERVALS: usize = 8;

/// A single detected note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub midi: i32,
    pub pitch_class: usize,
    pub octave: i32,
    pub name: &'static str,
}

impl Note {
    /// Derives pitch class, octave and name from a MIDI note number.
    pub fn from_midi(midi: i32) -> Self {
        let pitch_class = crate::util::modulo(midi - 24, 12) as usize;
        Self {
            midi,
            pitch_class,
            octave: (midi - 12) / 12,
            name: NOTE_NAMES[pitch_class],
        }
    }
}

/// One beat on the audio timeline with the features heard since the last one.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatPoint {
    pub time_ms: f64,
    pub bpm: i32,
    /// Loudness on a 0-100 scale.
    pub level: i32,
    pub notes: Vec<Note>,
    /// Index into [`AnalyzedAudio::intervals`].
    pub interval_id: usize,
}

/// Key signature classification of an interval root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signature {
    Unsigned,
    Sharp,
    Flat,
}

/// A contiguous block of beats and the key estimated over it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub id: usize,
    /// `"<Root><Major|Minor>"`, e.g. `"CMajor"`.
    pub key: String,
    pub key_note: usize,
    pub signature: Signature,
    pub major: bool,
    pub notes_in_key: usize,
    pub notes_out_key: usize,
    pub darkness: usize,
}

/// Complete analysis of one audio source.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzedAudio {
    /// Non-decreasing in `time_ms`.
    pub beats: Vec<BeatPoint>,
    pub average_bpm: f64,
    pub average_level: f64,
    pub min_level: i32,
    pub max_level: i32,
    /// Indexed by `BeatPoint::interval_id`.
    pub intervals: Vec<Interval>,
    /// Length of the longest run of beats louder than the average level.
    pub max_peak: usize,
}

/// Named pitch distances used when describing a simultaneous chord.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChordInterval {
    PerfectUnison,
    MinorSecond,
    MajorSecond,
    MinorThird,
    MajorThird,
    PerfectFourth,
    Tritone,
    PerfectFifth,
    MinorSixth,
    MajorSixth,
    MinorSeventh,
    MajorSeventh,
    PerfectOctave,
}

impl ChordInterval {
    fn from_semitones(semitones: i32) -> Self {
        use ChordInterval::*;
        match semitones {
            0 => PerfectUnison,
            1 => MinorSecond,
            2 => MajorSecond,
            3 => MinorThird,
            4 => MajorThird,
            5 => PerfectFourth,
            6 => Tritone,
            7 => PerfectFifth,
            8 => MinorSixth,
            9 => MajorSixth,
            10 => MinorSeventh,
            11 => MajorSeventh,
            _ => PerfectOctave,
        }
    }
}

/// Describes a chord as the pitch distances between its successive notes.
///
/// Notes are sorted by MIDI number and grouped into octave neighborhoods
/// (a gap above seven semitones starts a new group); each group contributes
/// the distances between its successive members.
pub fn chord_intervals(notes: &[Note]) -> Vec<ChordInterval> {
    let mut sorted: Vec<i32> = notes.iter().map(|n| n.midi).collect();
    sorted.sort_unstable();

    let mut result = Vec::new();
    let mut prev_in_group: Option<i32> = None;
    for midi in sorted {
        if let Some(prev) = prev_in_group
            && midi - prev <= 7
        {
            result.push(ChordInterval::from_semitones(midi - prev));
        }
        prev_in_group = Some(midi);
    }
    result
}

fn scale_classes(root: usize, major: bool) -> [bool; 12] {
    let steps = if major { MAJOR_STEPS } else { MINOR_STEPS };
    let mut classes = [false; 12];
    for step in steps {
        classes[(root + step) % 12] = true;
    }
    classes
}

impl AnalyzedAudio {
    /// Builds the full analysis from raw beat points.
    pub fn from_beats(mut beats: Vec<BeatPoint>) -> Self {
        let count = beats.len().max(1) as f64;
        let average_bpm = beats.iter().map(|b| b.bpm as f64).sum::<f64>() / count;
        let average_level = beats.iter().map(|b| b.level as f64).sum::<f64>() / count;
        let min_level = beats.iter().map(|b| b.level).min().unwrap_or(0);
        let max_level = beats.iter().map(|b| b.level).max().unwrap_or(0);

        let intervals = segment_intervals(&mut beats, NUM_INTERVALS);

        let mut max_peak = 0;
        let mut run = 0;
        for beat in &beats {
            if (beat.level as f64) > average_level {
                run += 1;
                max_peak = max_peak.max(run);
            } else {
                run = 0;
            }
        }

        Self {
            beats,
            average_bpm,
            average_level,
            min_level,
            max_level,
            intervals,
            max_peak,
        }
    }

    /// The interval a beat belongs to.
    pub fn interval_of(&self, beat: &BeatPoint) -> &Interval {
        &self.intervals[beat.interval_id]
    }

    /// Whether every note of the beat lies inside its interval's key.
    /// An empty beat counts as `false`.
    pub fn all_notes_in_key(&self, beat: &BeatPoint) -> bool {
        self.notes_match_key(beat, false)
    }

    /// Whether every note of the beat lies outside its interval's key.
    /// An empty beat counts as `false`.
    pub fn all_notes_off_key(&self, beat: &BeatPoint) -> bool {
        self.notes_match_key(beat, true)
    }

    fn notes_match_key(&self, beat: &BeatPoint, off: bool) -> bool {
        let interval = self.interval_of(beat);
        let classes = scale_classes(interval.key_note, interval.major);
        !beat.notes.is_empty()
            && beat
                .notes
                .iter()
                .all(|n| classes[n.pitch_class] != off)
    }

    /// Number of beats from `cur_time` until the next beat whose notes all
    /// fall outside the current key.
    pub fn next_off_key_beat_in(&self, cur_time: f64) -> usize {
        let mut counter = 1;
        for beat in &self.beats {
            if beat.time_ms <= cur_time {
                continue;
            }
            if self.all_notes_off_key(beat) {
                break;
            }
            counter += 1;
        }
        counter
    }
}

/// Splits beats into equally sized interval groups; the final interval
/// collects all remaining beats so no tail is ever dropped.
fn segment_intervals(beats: &mut [BeatPoint], n: usize) -> Vec<Interval> {
    let mut intervals = Vec::new();
    if beats.is_empty() {
        return intervals;
    }
    let chunk = (beats.len() / n).max(1);
    let mut start = 0;
    let mut id = 0;
    while start < beats.len() {
        let end = if id + 1 >= n {
            beats.len()
        } else {
            (start + chunk).min(beats.len())
        };
        for beat in &mut beats[start..end] {
            beat.interval_id = id;
        }
        intervals.push(interval_from_beats(id, &beats[start..end]));
        start = end;
        id += 1;
    }
    intervals
}

fn interval_from_beats(id: usize, beats: &[BeatPoint]) -> Interval {
    let mut freq = [0usize; 12];
    let mut dark_num = 0usize;
    let mut dark_den = 0usize;
    for beat in beats {
        for note in &beat.notes {
            freq[note.pitch_class] += 1;
            dark_num += (note.octave * note.octave).max(0) as usize;
            dark_den += note.octave.max(0) as usize;
        }
    }
    let darkness = if dark_den > 0 { dark_num / dark_den } else { 0 };

    // Root is the most frequent pitch class; ties resolve to the earlier
    // entry of the name table.
    let mut root = 0;
    for (class, &count) in freq.iter().enumerate() {
        if count > freq[root] {
            root = class;
        }
    }

    let in_major = scale_classes(root, true);
    let in_minor = scale_classes(root, false);
    let major_count: usize = (0..12).filter(|&c| in_major[c]).map(|c| freq[c]).sum();
    let minor_count: usize = (0..12).filter(|&c| in_minor[c]).map(|c| freq[c]).sum();
    let major = major_count >= minor_count;

    let classes = scale_classes(root, major);
    let notes_in_key = (0..12).filter(|&c| freq[c] > 0 && classes[c]).count();
    let notes_out_key = (0..12).filter(|&c| freq[c] > 0 && !classes[c]).count();

    let name = NOTE_NAMES[root];
    let signature = if name.contains('#') {
        Signature::Sharp
    } else if name.contains('b') {
        Signature::Flat
    } else {
        Signature::Unsigned
    };

    Interval {
        id,
        key: format!("{}{}", name, if major { "Major" } else { "Minor" }),
        key_note: root,
        signature,
        major,
        notes_in_key,
        notes_out_key,
        darkness,
    }
}

/// Deterministic value stream derived from an analysis, used to seed map
/// generation so the same song always produces the same map.
pub struct MusicRng {
    values: Vec<u32>,
    idx: usize,
}

impl MusicRng {
    pub fn new(analysis: &AnalyzedAudio) -> Self {
        let mut values: Vec<u32> = analysis
            .beats
            .iter()
            .flat_map(|b| b.notes.iter().map(|n| n.midi.max(0) as u32))
            .collect();
        if values.is_empty() {
            values = analysis.beats.iter().map(|b| b.bpm.max(1) as u32).collect();
        }
        if values.is_empty() {
            values.push(1);
        }
        Self { values, idx: 0 }
    }

    /// Next value in `[min, max]`.
    pub fn next_in(&mut self, min: i32, max: i32) -> i32 {
        let v = self.values[self.idx % self.values.len()];
        self.idx += 1;
        min + (v % (max - min + 1).max(1) as u32) as i32
    }
}

/// On-disk form of an analysis: enough to rebuild the beat timeline without
/// re-decoding the audio.
#[derive(Serialize, Deserialize)]
struct CachedAnalysis {
    average_bpm: f64,
    average_level: f64,
    times: Vec<f64>,
    bpms: Vec<i32>,
    levels: Vec<i32>,
    notes: Vec<Vec<i32>>,
    intervals: Vec<Interval>,
}

impl CachedAnalysis {
    fn from_analysis(analysis: &AnalyzedAudio) -> Self {
        Self {
            average_bpm: analysis.average_bpm,
            average_level: analysis.average_level,
            times: analysis.beats.iter().map(|b| b.time_ms).collect(),
            bpms: analysis.beats.iter().map(|b| b.bpm).collect(),
            levels: analysis.beats.iter().map(|b| b.level).collect(),
            notes: analysis
                .beats
                .iter()
                .map(|b| b.notes.iter().map(|n| n.midi).collect())
                .collect(),
            intervals: analysis.intervals.clone(),
        }
    }

    fn into_analysis(self) -> AnalyzedAudio {
        let beats = self
            .times
            .into_iter()
            .zip(self.bpms)
            .zip(self.levels.into_iter().zip(self.notes))
            .map(|((time_ms, bpm), (level, midis))| BeatPoint {
                time_ms,
                bpm,
                level,
                notes: midis.into_iter().map(Note::from_midi).collect(),
                interval_id: 0,
            })
            .collect();
        // Re-derive intervals and aggregates; they are a pure function of the
        // beat timeline.
        AnalyzedAudio::from_beats(beats)
    }
}

/// Path of the persisted analysis next to its source file.
pub fn cache_path(source: &Path) -> PathBuf {
    source.with_extension("json")
}

/// Analyzes an audio file, preferring the persisted analysis if present.
pub fn analyze(source: &Path) -> Result<AnalyzedAudio, GameError> {
    let cache = cache_path(source);
    if cache.exists() {
        match load_cached(&cache) {
            Ok(analysis) => {
                log::info!("AUDIO: loaded cached analysis from {:?}", cache);
                return Ok(analysis);
            }
            Err(err) => {
                log::warn!("AUDIO: ignoring unreadable cache {:?}: {}", cache, err);
            }
        }
    }

    let (samples, sample_rate) = decode_mono(source)?;
    let analysis = analyze_samples(&samples, sample_rate);
    log::info!(
        "AUDIO: analyzed {:?}: {} beats, average bpm {:.1}",
        source,
        analysis.beats.len(),
        analysis.average_bpm
    );

    if let Err(err) = persist(&analysis, &cache) {
        log::error!("AUDIO: could not persist analysis at {:?}: {}", cache, err);
    }
    Ok(analysis)
}

/// Runs the detectors over raw mono samples.
pub fn analyze_samples(samples: &[f32], sample_rate: u32) -> AnalyzedAudio {
    let mut tempo = TempoDetector::new(sample_rate);
    let mut notes = NoteDetector::new(sample_rate);

    let mut beats = Vec::new();
    let mut pending_notes = Vec::new();
    for hop in samples.chunks(HOP_SIZE) {
        if hop.len() < HOP_SIZE {
            break;
        }
        if let Some(midi) = notes.process(hop) {
            pending_notes.push(Note::from_midi(midi));
        }
        if let Some(beat) = tempo.process(hop) {
            beats.push(BeatPoint {
                time_ms: beat.time_ms,
                bpm: beat.bpm,
                level: detector::level_percent(hop),
                notes: std::mem::take(&mut pending_notes),
                interval_id: 0,
            });
        }
    }
    // Notes heard after the final beat still belong to it.
    if let Some(last) = beats.last_mut() {
        last.notes.append(&mut pending_notes);
    }
    AnalyzedAudio::from_beats(beats)
}

fn decode_mono(source: &Path) -> Result<(Vec<f32>, u32), GameError> {
    use rodio::Source;

    let file = File::open(source)
        .map_err(|e| GameError::AnalyzeFailed(format!("{:?}: {}", source, e)))?;
    let decoder = rodio::Decoder::new(BufReader::new(file))
        .map_err(|e| GameError::AnalyzeFailed(format!("{:?}: {}", source, e)))?;
    let sample_rate = decoder.sample_rate();
    let channels = decoder.channels().max(1) as usize;

    let mut mono = Vec::new();
    let mut frame = Vec::with_capacity(channels);
    for sample in decoder.convert_samples::<f32>() {
        frame.push(sample);
        if frame.len() == channels {
            mono.push(frame.iter().sum::<f32>() / channels as f32);
            frame.clear();
        }
    }
    Ok((mono, sample_rate))
}

fn load_cached(cache: &Path) -> Result<AnalyzedAudio, String> {
    let file = File::open(cache).map_err(|e| e.to_string())?;
    let cached: CachedAnalysis =
        serde_json::from_reader(BufReader::new(file)).map_err(|e| e.to_string())?;
    Ok(cached.into_analysis())
}

fn persist(analysis: &AnalyzedAudio, cache: &Path) -> Result<(), String> {
    let file = File::create(cache).map_err(|e| e.to_string())?;
    serde_json::to_writer(file, &CachedAnalysis::from_analysis(analysis))
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beat(time_ms: f64, level: i32, midis: &[i32]) -> BeatPoint {
        BeatPoint {
            time_ms,
            bpm: 120,
            level,
            notes: midis.iter().map(|&m| Note::from_midi(m)).collect(),
            interval_id: 0,
        }
    }

    #[test]
    fn test_note_from_midi_c4() {
        let note = Note::from_midi(60);
        assert_eq!(note.pitch_class, 0);
        assert_eq!(note.octave, 4);
        assert_eq!(note.name, "C");
    }

    #[test]
    fn test_note_from_midi_low_note_wraps() {
        let note = Note::from_midi(23);
        assert_eq!(note.pitch_class, 11);
        assert_eq!(note.name, "B");
    }

    #[test]
    fn test_single_c_beat_yields_c_major() {
        let analysis = AnalyzedAudio::from_beats(vec![beat(0.0, 50, &[60])]);
        assert_eq!(analysis.beats.len(), 1);
        assert_eq!(analysis.intervals.len(), 1);
        assert_eq!(analysis.intervals[0].key, "CMajor");
        assert_eq!(analysis.beats[0].interval_id, 0);
        assert_eq!(analysis.beats[0].notes[0].name, "C");
    }

    #[test]
    fn test_chord_interval_perfect_fifth() {
        let notes = vec![Note::from_midi(60), Note::from_midi(67)];
        assert_eq!(chord_intervals(&notes), vec![ChordInterval::PerfectFifth]);
    }

    #[test]
    fn test_chord_interval_groups_split_on_wide_gap() {
        // C2 and C5 are far apart: separate groups, no interval between them.
        let notes = vec![Note::from_midi(36), Note::from_midi(72)];
        assert_eq!(chord_intervals(&notes), vec![]);
    }

    #[test]
    fn test_chord_interval_unison() {
        let notes = vec![Note::from_midi(64), Note::from_midi(64)];
        assert_eq!(chord_intervals(&notes), vec![ChordInterval::PerfectUnison]);
    }

    #[test]
    fn test_last_interval_collects_remaining_beats() {
        // 17 beats over 8 intervals: chunk of 2, last interval takes 3.
        let beats: Vec<BeatPoint> = (0..17).map(|i| beat(i as f64 * 500.0, 50, &[60])).collect();
        let analysis = AnalyzedAudio::from_beats(beats);
        assert_eq!(analysis.intervals.len(), 8);
        let last_count = analysis
            .beats
            .iter()
            .filter(|b| b.interval_id == 7)
            .count();
        assert_eq!(last_count, 3);
        // Every interval id indexes into the interval table.
        assert!(
            analysis
                .beats
                .iter()
                .all(|b| b.interval_id < analysis.intervals.len())
        );
    }

    #[test]
    fn test_max_peak_longest_run() {
        let beats = vec![
            beat(0.0, 10, &[]),
            beat(500.0, 90, &[]),
            beat(1000.0, 90, &[]),
            beat(1500.0, 10, &[]),
            beat(2000.0, 90, &[]),
        ];
        let analysis = AnalyzedAudio::from_beats(beats);
        // average level is 58: the runs above it have lengths 2 and 1.
        assert_eq!(analysis.max_peak, 2);
    }

    #[test]
    fn test_notes_match_key() {
        // 16 beats, so the first interval spans two of them: a C major triad
        // and a lone C#. The interval key ends up CMajor, making C# off-key.
        let mut beats = vec![beat(0.0, 50, &[60, 64, 67]), beat(500.0, 50, &[61])];
        for i in 2..16 {
            beats.push(beat(i as f64 * 500.0, 50, &[60, 64, 67]));
        }
        let analysis = AnalyzedAudio::from_beats(beats);
        assert_eq!(analysis.beats[1].interval_id, 0);
        assert_eq!(analysis.intervals[0].key, "CMajor");
        assert!(analysis.all_notes_in_key(&analysis.beats[0]));
        assert!(!analysis.all_notes_off_key(&analysis.beats[0]));
        assert!(analysis.all_notes_off_key(&analysis.beats[1]));
    }

    #[test]
    fn test_minor_mode_wins_on_count() {
        // C stays the root, but the Eb minor thirds outvote the major scale.
        let beats = vec![beat(0.0, 50, &[60, 60, 60, 63, 63])];
        let analysis = AnalyzedAudio::from_beats(beats);
        assert_eq!(analysis.intervals[0].key, "CMinor");
        assert!(!analysis.intervals[0].major);
    }

    #[test]
    fn test_signature_from_root_name() {
        // F# root: three F# notes against one C.
        let beats = vec![beat(0.0, 50, &[66, 66, 66, 60])];
        let analysis = AnalyzedAudio::from_beats(beats);
        assert_eq!(analysis.intervals[0].signature, Signature::Sharp);
        let beats = vec![beat(0.0, 50, &[63, 63, 63, 60])];
        let analysis = AnalyzedAudio::from_beats(beats);
        assert_eq!(analysis.intervals[0].signature, Signature::Flat);
    }

    #[test]
    fn test_cache_round_trip_is_identity() {
        let beats = vec![
            beat(123.456, 40, &[60, 67]),
            beat(700.0, 80, &[61]),
            beat(1234.5, 90, &[]),
        ];
        let analysis = AnalyzedAudio::from_beats(beats);
        let dir = std::env::temp_dir().join("dissonance-analysis-test");
        std::fs::create_dir_all(&dir).unwrap();
        let cache = dir.join("roundtrip.json");

        persist(&analysis, &cache).unwrap();
        let loaded = load_cached(&cache).unwrap();
        assert_eq!(loaded, analysis);

        std::fs::remove_file(cache).ok();
    }

    #[test]
    fn test_analyze_samples_synthetic_beat() {
        // Quarter second of silence, then a C4 tone burst: one beat carrying
        // the C note, one interval in C major.
        let sr = 44_100u32;
        let mut samples = vec![0.0f32; sr as usize / 4];
        for i in 0..sr as usize / 4 {
            samples
                .push((2.0 * std::f64::consts::PI * 261.63 * i as f64 / sr as f64).sin() as f32 * 0.6);
        }
        let analysis = analyze_samples(&samples, sr);
        assert_eq!(analysis.beats.len(), 1);
        assert_eq!(analysis.intervals.len(), 1);
        let notes = &analysis.beats[0].notes;
        assert_eq!(notes.iter().map(|n| n.midi).collect::<Vec<_>>(), vec![60]);
        assert_eq!(analysis.intervals[0].key, "CMajor");
    }

    #[test]
    fn test_music_rng_is_deterministic() {
        let analysis = AnalyzedAudio::from_beats(vec![beat(0.0, 50, &[60, 62, 64])]);
        let mut a = MusicRng::new(&analysis);
        let mut b = MusicRng::new(&analysis);
        for _ in 0..10 {
            assert_eq!(a.next_in(0, 7), b.next_in(0, 7));
        }
    }
}
