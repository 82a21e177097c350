use std::path::Path;

pub const WORKSPACE_TOKEN: &str = "[workspace]";
pub const PROJECT_TOKEN: &str = "[project]";
pub const HOME_TOKEN: &str = "[home]";

/// Replaces host paths in captured output with opaque tokens
#[derive(Debug, Clone, Default)]
pub struct Sanitizer {
    /// Kept sorted longest first so nested paths resolve to the most specific token
    rules: Vec<(String, &'static str)>,
}

impl Sanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths identifying the host process: its working directory and home
    pub fn for_host() -> Self {
        let mut sanitizer = Self::new();
        if let Ok(cwd) = std::env::current_dir() {
            sanitizer = sanitizer.with_path(&cwd, PROJECT_TOKEN);
        }
        if let Some(dirs) = directories::BaseDirs::new() {
            sanitizer = sanitizer.with_path(dirs.home_dir(), HOME_TOKEN);
        }
        sanitizer
    }

    /// Adds `path` (and its canonical form, if different) as a rule
    pub fn with_path(mut self, path: &Path, token: &'static str) -> Self {
        let candidates = [Some(path.to_path_buf()), path.canonicalize().ok()];
        for candidate in candidates.into_iter().flatten() {
            let text = candidate.to_string_lossy().trim_end_matches('/').to_string();
            // An empty or root path would match everywhere
            if text.len() <= 1 || self.rules.iter().any(|(p, _)| *p == text) {
                continue;
            }
            self.rules.push((text, token));
        }
        self.rules.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    /// Sanitizes `text` and keeps at most `limit` bytes of the result.
    ///
    /// `cut` means the text was truncated while captured. Its last bytes may then
    /// hold the head of a path no rule can match any more, so they are dropped
    /// before sanitizing.
    pub fn apply_capped(&self, text: &str, cut: bool, limit: usize) -> (String, bool) {
        let text = if cut {
            let longest = self.rules.first().map_or(0, |(path, _)| path.len());
            &text[..floor_char_boundary(text, text.len().saturating_sub(longest))]
        } else {
            text
        };

        let mut out = self.apply(text);
        let truncated = cut || out.len() > limit;
        out.truncate(floor_char_boundary(&out, limit));
        (out, truncated)
    }

    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (path, token) in &self.rules {
            if out.contains(path.as_str()) {
                out = out.replace(path.as_str(), token);
            }
        }
        out
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    (0..=index)
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_replaces_every_occurrence() {
        let sanitizer = Sanitizer::new().with_path(Path::new("/srv/app"), PROJECT_TOKEN);
        let text = "/srv/app/a.cpp:1: error\nnote: /srv/app/b.h included here";
        assert_eq!(
            sanitizer.apply(text),
            "[project]/a.cpp:1: error\nnote: [project]/b.h included here"
        );
    }

    #[test]
    fn test_most_specific_path_wins() {
        let sanitizer = Sanitizer::new()
            .with_path(Path::new("/srv"), HOME_TOKEN)
            .with_path(Path::new("/srv/ws/260101-000000-00ff"), WORKSPACE_TOKEN);
        assert_eq!(
            sanitizer.apply("/srv/ws/260101-000000-00ff/main.cpp in /srv/etc"),
            "[workspace]/main.cpp in [home]/etc"
        );
    }

    #[test]
    fn test_root_path_is_ignored() {
        let sanitizer = Sanitizer::new()
            .with_path(Path::new("/"), HOME_TOKEN)
            .with_path(Path::new(""), HOME_TOKEN);
        assert_eq!(sanitizer.apply("/usr/bin/python3"), "/usr/bin/python3");
    }

    #[test]
    fn test_canonical_form_is_also_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let canonical = tmp.path().canonicalize().unwrap();
        let sanitizer = Sanitizer::new().with_path(tmp.path(), WORKSPACE_TOKEN);

        let text = format!("{}/x and {}/y", tmp.path().display(), canonical.display());
        assert_eq!(sanitizer.apply(&text), "[workspace]/x and [workspace]/y");
    }

    #[test]
    fn test_host_sanitizer_hides_working_directory() {
        let cwd = std::env::current_dir().unwrap();
        let text = format!("panicked at {}/src/main.rs", cwd.display());
        let cleaned = Sanitizer::for_host().apply(&text);
        assert!(!cleaned.contains(&cwd.to_string_lossy().to_string()));
    }

    #[test]
    fn test_capped_output_never_shows_part_of_a_path() {
        let sanitizer = Sanitizer::new().with_path(Path::new("/srv/ws/abc"), WORKSPACE_TOKEN);

        // Sanitized first, so the cap can only split the token
        let text = "x/srv/ws/abc\n/srv/ws/abc\n";
        assert_eq!(
            sanitizer.apply_capped(text, false, 16),
            ("x[workspace]\n[wo".to_string(), true)
        );
        assert_eq!(
            sanitizer.apply_capped(text, false, 100),
            ("x[workspace]\n[workspace]\n".to_string(), false)
        );

        // A capture cut inside a path loses the tail that could be its head
        assert_eq!(
            sanitizer.apply_capped("out /srv/ws/ab", true, 100),
            ("out".to_string(), true)
        );
    }

    #[test]
    fn test_capped_output_respects_char_boundaries() {
        let sanitizer = Sanitizer::new();
        assert_eq!(sanitizer.apply_capped("aé", false, 2), ("a".to_string(), true));
    }
}
