//! Audio analysis and playback.

pub mod analysis;
pub mod detector;
pub mod playback;

pub use analysis::{AnalyzedAudio, BeatPoint, Interval, MusicRng, Note, analyze};
pub use playback::AudioPlayer;
