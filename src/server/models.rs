//! Whisper model file resolution.
//!
//! Models live in the whisper.cpp cache directory as `ggml-<name>.bin`.
//! VAD models follow the silero naming scheme and can be auto-discovered
//! so users who downloaded one do not have to name it in config.

use std::path::{Path, PathBuf};

use super::ServerError;

/// Default whisper.cpp model cache, `~/.cache/whisper.cpp`.
pub fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".cache").join("whisper.cpp"))
        .unwrap_or_else(|| PathBuf::from(".cache/whisper.cpp"))
}

/// Resolves a model name like `base.en` to its on-disk path, failing
/// with download instructions when the file is absent.
pub fn resolve_model_path(cache_dir: &Path, model: &str) -> Result<PathBuf, ServerError> {
    let path = cache_dir.join(format!("ggml-{model}.bin"));
    if path.is_file() {
        Ok(path)
    } else {
        Err(ServerError::ModelNotFound {
            model: model.to_string(),
            path,
        })
    }
}

/// Resolves the VAD model setting: `none` (or empty) disables VAD,
/// `auto` picks the newest silero model in the cache if any, and any
/// other value names a model that must exist.
pub fn resolve_vad_model(cache_dir: &Path, setting: &str) -> Result<Option<PathBuf>, ServerError> {
    match setting.trim().to_ascii_lowercase().as_str() {
        "" | "none" => Ok(None),
        "auto" => Ok(discover_vad_model(cache_dir)),
        _ => {
            let name = setting.trim();
            let path = cache_dir.join(format!("ggml-{name}.bin"));
            if path.is_file() {
                Ok(Some(path))
            } else {
                Err(ServerError::VadModelNotFound { path })
            }
        }
    }
}

/// Scans the cache for `ggml-silero-v*.bin` files and returns the
/// version-highest one (reverse lexicographic filename order).
pub fn discover_vad_model(cache_dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(cache_dir).ok()?;
    let mut best: Option<String> = None;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if parse_vad_model_name(name).is_none() {
            continue;
        }
        if best.as_deref().map_or(true, |current| name > current) {
            best = Some(name.to_string());
        }
    }
    best.map(|name| cache_dir.join(name))
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Accepts `ggml-silero-v<version>.bin` where `<version>` is digits and
/// dots, optionally followed by a `-` or `.` introduced suffix such as
/// `-alpha` or `.rc1`. Returns the model name between `ggml-` and
/// `.bin`.
fn parse_vad_model_name(file_name: &str) -> Option<&str> {
    let stem = file_name.strip_prefix("ggml-")?.strip_suffix(".bin")?;
    let version = stem.strip_prefix("silero-v")?;
    if !version.chars().next()?.is_ascii_digit() {
        return None;
    }
    let head_len = version
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(version.len());
    let (head, tail) = version.split_at(head_len);
    let valid = if tail.is_empty() {
        true
    } else if let Some(suffix) = tail.strip_prefix('-') {
        !suffix.is_empty() && suffix.chars().all(is_word_char)
    } else {
        // A suffix introduced by `.` leaves its separator attached to
        // the digits-and-dots head.
        head.len() > 1 && head.ends_with('.') && tail.chars().all(is_word_char)
    };
    valid.then_some(stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_versions() {
        assert_eq!(
            parse_vad_model_name("ggml-silero-v5.1.2.bin"),
            Some("silero-v5.1.2")
        );
        assert_eq!(parse_vad_model_name("ggml-silero-v4.bin"), Some("silero-v4"));
    }

    #[test]
    fn test_accepts_suffixed_versions() {
        assert_eq!(
            parse_vad_model_name("ggml-silero-v1.2.3-alpha.bin"),
            Some("silero-v1.2.3-alpha")
        );
        assert_eq!(
            parse_vad_model_name("ggml-silero-v2.0.1-beta.2.bin"),
            Some("silero-v2.0.1-beta.2")
        );
        assert_eq!(
            parse_vad_model_name("ggml-silero-v5.1.rc1.bin"),
            Some("silero-v5.1.rc1")
        );
    }

    #[test]
    fn test_rejects_non_vad_files() {
        assert_eq!(parse_vad_model_name("ggml-base.en.bin"), None);
        assert_eq!(parse_vad_model_name("silero-v5.bin"), None);
        assert_eq!(parse_vad_model_name("ggml-silero-vx.bin"), None);
        assert_eq!(parse_vad_model_name("ggml-silero-v5alpha.bin"), None);
        assert_eq!(parse_vad_model_name("ggml-silero-v5.1.2.txt"), None);
    }
}
