//! Configuration files: the music source list.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Expands `$(HOME)` and `$(DISSONANCE)` tokens in a configured path.
/// Anything else is taken verbatim.
pub fn expand_tokens(raw: &str, base_path: &Path) -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_default();
    let expanded = raw
        .replace("$(HOME)", &home)
        .replace("$(DISSONANCE)", &base_path.to_string_lossy());
    PathBuf::from(expanded)
}

/// Loads `settings/music_paths.json` below the install base path.
/// A missing or broken file just means no configured sources.
pub fn load_music_paths(base_path: &Path) -> Vec<PathBuf> {
    let settings = base_path.join("settings/music_paths.json");
    let file = match File::open(&settings) {
        Ok(file) => file,
        Err(err) => {
            log::warn!("SETTINGS: cannot open {:?}: {}", settings, err);
            return Vec::new();
        }
    };
    let raw: Vec<String> = match serde_json::from_reader(BufReader::new(file)) {
        Ok(raw) => raw,
        Err(err) => {
            log::error!("SETTINGS: {:?} is not a path array: {}", settings, err);
            return Vec::new();
        }
    };
    raw.iter()
        .map(|entry| expand_tokens(entry, base_path))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_base_path_token() {
        let expanded = expand_tokens("$(DISSONANCE)/data/songs", Path::new("/opt/dissonance"));
        assert_eq!(expanded, PathBuf::from("/opt/dissonance/data/songs"));
    }

    #[test]
    fn test_verbatim_path_untouched() {
        let expanded = expand_tokens("/music/track.mp3", Path::new("/opt/dissonance"));
        assert_eq!(expanded, PathBuf::from("/music/track.mp3"));
    }

    #[test]
    fn test_home_token() {
        let home = std::env::var("HOME").unwrap_or_default();
        let expanded = expand_tokens("$(HOME)/music", Path::new("/opt"));
        assert_eq!(expanded, PathBuf::from(format!("{}/music", home)));
    }

    #[test]
    fn test_load_music_paths_round_trip() {
        let base = std::env::temp_dir().join("dissonance-settings-test");
        std::fs::create_dir_all(base.join("settings")).unwrap();
        std::fs::write(
            base.join("settings/music_paths.json"),
            r#"["$(DISSONANCE)/a.mp3", "/plain/b.mp3"]"#,
        )
        .unwrap();

        let paths = load_music_paths(&base);
        assert_eq!(paths, vec![base.join("a.mp3"), PathBuf::from("/plain/b.mp3")]);

        std::fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn test_missing_settings_file_is_empty() {
        assert!(load_music_paths(Path::new("/nonexistent-base")).is_empty());
    }
}
