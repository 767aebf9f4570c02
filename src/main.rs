//! Server entry point.

mod audio;
mod game;
mod server;
mod shared;
mod util;

use clap::Parser;
use serde_json::json;
use shared::messages::{Envelope, GameMode};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "dissonance", about = "A music-driven real-time strategy game")]
struct Args {
    /// Port the wire transport binds to.
    #[arg(long, default_value_t = 4444)]
    port: u16,

    /// Run one local music-driven match instead of serving clients.
    #[arg(long)]
    standalone: bool,

    /// Install base path holding settings and user files.
    #[arg(long, default_value = ".")]
    base_path: PathBuf,
}

fn main() {
    // Log level comes from RUST_LOG.
    env_logger::init();
    let args = Args::parse();
    log::info!("MAIN: booting dissonance (base path {:?})", args.base_path);

    let router = server::router::Router::new(args.base_path.clone());

    if args.standalone {
        run_standalone(&router, &args.base_path);
        return;
    }

    log::info!(
        "MAIN: router ready, waiting for transport connections on port {}",
        args.port
    );
    // The physical transport is provided by the embedding process; park and
    // keep the router alive for it.
    loop {
        std::thread::park();
    }
}

/// Plays one configured song as a spectated AI-versus-AI match.
fn run_standalone(router: &server::router::Router, base_path: &Path) {
    let sources = shared::settings::load_music_paths(base_path);
    let Some(source) = sources.first() else {
        log::error!("MAIN: no music sources configured, nothing to play");
        return;
    };
    log::info!("MAIN: standalone match on {:?}", source);

    let client = router.connect();
    let send = |command: &str, data: serde_json::Value| {
        let envelope = Envelope::new(command, "standalone", data);
        router.handle_frame(
            client.id,
            &serde_json::to_string(&envelope).expect("envelopes always serialize"),
        );
    };
    send("initialize", json!({}));
    send("init_game", json!({ "mode": GameMode::AiGame.code() }));
    send(
        "analyse_audio",
        json!({ "source_path": source.to_string_lossy() }),
    );
    send("ready", json!({}));

    let mut playback = audio::AudioPlayer::new();
    playback.play(source);

    let mut ticks_seen = 0u64;
    loop {
        match client.responses.recv_timeout(Duration::from_secs(10)) {
            Ok(response) => match response.command.as_str() {
                "snapshot" => {
                    ticks_seen += 1;
                    // One status line every couple of seconds is plenty.
                    if ticks_seen % 40 == 1 {
                        log::info!(
                            "MAIN: {} ({:.1}s)",
                            response.data["players"].as_str().unwrap_or(""),
                            response.data["audio_played"].as_f64().unwrap_or(0.0)
                        );
                    }
                }
                "print_msg" => {
                    log::info!("MAIN: {}", response.data["msg"].as_str().unwrap_or(""));
                }
                "game_over" => {
                    log::info!(
                        "MAIN: game over, statistics: {}",
                        response.data["statistics"]
                    );
                    break;
                }
                "kill" => {
                    log::error!("MAIN: {}", response.data["msg"].as_str().unwrap_or(""));
                    break;
                }
                _ => {}
            },
            Err(_) => {
                log::warn!("MAIN: no responses for a while, giving up");
                break;
            }
        }
    }
    playback.stop();
    router.disconnect(client.id);
}
