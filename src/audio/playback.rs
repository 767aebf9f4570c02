//! Audio playback worker.
//!
//! Playback runs on its own thread fed by a rodio decoder so the game loop
//! never blocks on the audio device. The pause flag is the only process-wide
//! audio state: an `AtomicBool` owned by this module, set on `play()` and
//! cleared on `stop()`. The server reads the playback cursor through
//! [`AudioPlayer::elapsed_ms`].

use crossbeam_channel::{Sender, unbounded};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

enum PlaybackCommand {
    Play { path: PathBuf },
    Pause,
    Unpause,
    Stop,
}

/// Wall-clock over the audio timeline that freezes while paused.
struct PlaybackClock {
    started: Option<Instant>,
    paused_at: Option<Instant>,
    paused_total_ms: f64,
}

impl PlaybackClock {
    fn new() -> Self {
        Self {
            started: None,
            paused_at: None,
            paused_total_ms: 0.0,
        }
    }

    fn start(&mut self, now: Instant) {
        self.started = Some(now);
        self.paused_at = None;
        self.paused_total_ms = 0.0;
    }

    fn pause(&mut self, now: Instant) {
        if self.started.is_some() && self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    fn unpause(&mut self, now: Instant) {
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_total_ms += now.duration_since(paused_at).as_secs_f64() * 1000.0;
        }
    }

    fn elapsed_ms(&self, now: Instant) -> f64 {
        let Some(started) = self.started else {
            return 0.0;
        };
        let frozen_until = self.paused_at.unwrap_or(now);
        frozen_until.duration_since(started).as_secs_f64() * 1000.0 - self.paused_total_ms
    }
}

/// Handle controlling the playback thread.
pub struct AudioPlayer {
    cmd_tx: Sender<PlaybackCommand>,
    paused: Arc<AtomicBool>,
    clock: PlaybackClock,
}

impl AudioPlayer {
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = unbounded();
        let paused = Arc::new(AtomicBool::new(false));

        thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let output = rodio::OutputStream::try_default();
                let (_stream, handle) = match output {
                    Ok(pair) => pair,
                    Err(err) => {
                        log::warn!("AUDIO: no output device ({}), playback disabled", err);
                        // Drain commands so senders never block.
                        while cmd_rx.recv().is_ok() {}
                        return;
                    }
                };
                let mut sink: Option<rodio::Sink> = None;
                while let Ok(cmd) = cmd_rx.recv() {
                    match cmd {
                        PlaybackCommand::Play { path } => {
                            if let Some(old) = sink.take() {
                                old.stop();
                            }
                            sink = start_sink(&handle, &path);
                        }
                        PlaybackCommand::Pause => {
                            if let Some(sink) = &sink {
                                sink.pause();
                            }
                        }
                        PlaybackCommand::Unpause => {
                            if let Some(sink) = &sink {
                                sink.play();
                            }
                        }
                        PlaybackCommand::Stop => {
                            if let Some(sink) = sink.take() {
                                sink.stop();
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn audio playback thread");

        Self {
            cmd_tx,
            paused,
            clock: PlaybackClock::new(),
        }
    }

    /// Starts playing the given file and resets the playback cursor.
    pub fn play(&mut self, path: &Path) {
        self.paused.store(false, Ordering::Relaxed);
        self.clock.start(Instant::now());
        let _ = self.cmd_tx.send(PlaybackCommand::Play {
            path: path.to_path_buf(),
        });
    }

    pub fn pause(&mut self) {
        self.paused.store(true, Ordering::Relaxed);
        self.clock.pause(Instant::now());
        let _ = self.cmd_tx.send(PlaybackCommand::Pause);
    }

    pub fn unpause(&mut self) {
        self.paused.store(false, Ordering::Relaxed);
        self.clock.unpause(Instant::now());
        let _ = self.cmd_tx.send(PlaybackCommand::Unpause);
    }

    pub fn stop(&mut self) {
        self.paused.store(false, Ordering::Relaxed);
        let _ = self.cmd_tx.send(PlaybackCommand::Stop);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Milliseconds of audio elapsed since `play()`, excluding paused time.
    pub fn elapsed_ms(&self) -> f64 {
        self.clock.elapsed_ms(Instant::now())
    }
}

impl Default for AudioPlayer {
    fn default() -> Self {
        Self::new()
    }
}

fn start_sink(handle: &rodio::OutputStreamHandle, path: &Path) -> Option<rodio::Sink> {
    let Ok(file) = File::open(path) else {
        log::error!("AUDIO: cannot open {:?}", path);
        return None;
    };
    let Ok(source) = rodio::Decoder::new(BufReader::new(file)) else {
        log::error!("AUDIO: cannot decode {:?}", path);
        return None;
    };
    let Ok(sink) = rodio::Sink::try_new(handle) else {
        log::error!("AUDIO: failed to create sink");
        return None;
    };
    sink.append(source);
    sink.play();
    Some(sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_clock_freezes_while_paused() {
        let mut clock = PlaybackClock::new();
        let t0 = Instant::now();
        clock.start(t0);
        let t1 = t0 + Duration::from_millis(100);
        clock.pause(t1);
        // While paused the cursor stays at the pause point.
        let t2 = t0 + Duration::from_millis(500);
        assert_eq!(clock.elapsed_ms(t2).round(), 100.0);
        clock.unpause(t2);
        let t3 = t0 + Duration::from_millis(700);
        assert_eq!(clock.elapsed_ms(t3).round(), 300.0);
    }

    #[test]
    fn test_clock_zero_before_start() {
        let clock = PlaybackClock::new();
        assert_eq!(clock.elapsed_ms(Instant::now()), 0.0);
    }
}
