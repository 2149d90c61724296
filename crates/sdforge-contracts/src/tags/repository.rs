use std::collections::HashSet;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::formats;

/// Path-list variable naming extra tag directories, searched first.
pub const TAG_PATH_ENV: &str = "SDFORGE_TAGCOMPLETE_PATH";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagLoadDiagnostic {
    pub path: PathBuf,
    pub message: String,
}

/// Search directories in priority order: `SDFORGE_TAGCOMPLETE_PATH` entries,
/// the bundled `data/tagcomplete`, then `tagcomplete` and `data/tagcomplete`
/// next to the application root. Only existing directories are returned.
pub fn default_search_paths(app_root: &Path) -> Vec<PathBuf> {
    search_paths_from(env::var_os(TAG_PATH_ENV), app_root)
}

pub fn search_paths_from(env_value: Option<OsString>, app_root: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(value) = env_value {
        candidates.extend(env::split_paths(&value).filter(|entry| !entry.as_os_str().is_empty()));
    }
    candidates.push(app_root.join("data").join("tagcomplete"));
    if let Some(project_root) = app_root.parent() {
        candidates.push(project_root.join("tagcomplete"));
        candidates.push(project_root.join("data").join("tagcomplete"));
    }
    candidates.into_iter().filter(|path| path.is_dir()).collect()
}

/// Deduplicated, case-insensitively sorted tag vocabulary.
#[derive(Debug, Clone)]
pub struct TagRepository {
    search_paths: Vec<PathBuf>,
    tags: Vec<String>,
    diagnostics: Vec<TagLoadDiagnostic>,
}

impl TagRepository {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        let mut repository = Self {
            search_paths,
            tags: Vec::new(),
            diagnostics: Vec::new(),
        };
        repository.reload();
        repository
    }

    pub fn from_app_root(app_root: &Path) -> Self {
        Self::new(default_search_paths(app_root))
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn diagnostics(&self) -> &[TagLoadDiagnostic] {
        &self.diagnostics
    }

    /// Rebuilds the vocabulary from scratch. A file that fails to load adds a
    /// diagnostic and contributes no tags; the scan carries on.
    pub fn reload(&mut self) -> &[TagLoadDiagnostic] {
        let mut seen = HashSet::new();
        let mut aggregated = Vec::new();
        let mut diagnostics = Vec::new();

        for base_path in &self.search_paths {
            if !base_path.is_dir() {
                continue;
            }
            for path in vocabulary_files(base_path, &mut diagnostics) {
                let tags = match formats::load_file(&path) {
                    Ok(tags) => tags,
                    Err(err) => {
                        warn!(path = %path.display(), "skipping tag file: {err:#}");
                        diagnostics.push(TagLoadDiagnostic {
                            path,
                            message: format!("{err:#}"),
                        });
                        continue;
                    }
                };
                debug!(path = %path.display(), count = tags.len(), "loaded tag file");
                for tag in tags {
                    let normalized = tag.trim();
                    if normalized.is_empty() {
                        continue;
                    }
                    if seen.insert(normalized.to_lowercase()) {
                        aggregated.push(normalized.to_string());
                    }
                }
            }
        }

        aggregated.sort_by_cached_key(|tag| tag.to_lowercase());
        self.tags = aggregated;
        self.diagnostics = diagnostics;
        &self.diagnostics
    }
}

// Symlink loops, dangling links and unreadable directories become diagnostics.
fn vocabulary_files(base_path: &Path, diagnostics: &mut Vec<TagLoadDiagnostic>) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(base_path).follow_links(true) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
            Ok(_) => {}
            Err(err) => {
                let path = err.path().unwrap_or(base_path).to_path_buf();
                warn!(path = %path.display(), "skipping tag path: {err}");
                diagnostics.push(TagLoadDiagnostic {
                    path,
                    message: err.to_string(),
                });
            }
        }
    }
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;
    use std::path::PathBuf;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::{search_paths_from, TagRepository};

    fn write(path: PathBuf, content: &str) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    #[test]
    fn first_seen_casing_wins_across_sources() -> anyhow::Result<()> {
        let first = tempfile::tempdir()?;
        let second = tempfile::tempdir()?;
        write(first.path().join("a.txt"), "Cat\nzebra\n")?;
        write(second.path().join("b.txt"), "cat, 500\napple\n")?;

        let repository = TagRepository::new(vec![
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ]);
        assert_eq!(repository.tags(), ["apple", "Cat", "zebra"]);
        assert!(repository.diagnostics().is_empty());
        Ok(())
    }

    #[test]
    fn files_are_visited_in_path_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write(dir.path().join("b.txt"), "BLUE SKY\n")?;
        write(dir.path().join("a").join("nested.json"), r#"["Blue Sky", "cloud"]"#)?;
        write(dir.path().join("notes.md"), "ignored\n")?;

        let repository = TagRepository::new(vec![dir.path().to_path_buf()]);
        assert_eq!(repository.tags(), ["Blue Sky", "cloud"]);
        Ok(())
    }

    #[test]
    fn malformed_file_does_not_abort_reload() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write(dir.path().join("a.json"), "{not json")?;
        write(dir.path().join("b.csv"), "name,aliases\nsolo,alone\n")?;

        let repository = TagRepository::new(vec![dir.path().to_path_buf()]);
        assert_eq!(repository.tags(), ["alone", "solo"]);
        assert_eq!(repository.diagnostics().len(), 1);
        assert_eq!(repository.diagnostics()[0].path, dir.path().join("a.json"));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn broken_links_are_reported_as_diagnostics() -> anyhow::Result<()> {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir()?;
        write(dir.path().join("a.txt"), "cat\n")?;
        symlink(".", dir.path().join("loop"))?;
        symlink("missing.txt", dir.path().join("gone"))?;

        let repository = TagRepository::new(vec![dir.path().to_path_buf()]);
        assert_eq!(repository.tags(), ["cat"]);
        let reported = repository
            .diagnostics()
            .iter()
            .map(|diagnostic| diagnostic.path.clone())
            .collect::<Vec<PathBuf>>();
        assert!(reported.iter().any(|path| path.ends_with("loop")));
        assert!(reported.iter().any(|path| path.ends_with("gone")));
        Ok(())
    }

    #[test]
    fn gzip_files_dispatch_on_inner_extension() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        for (name, content) in [
            ("tags.csv.gz", "tag,alias\nred eyes,crimson eyes\n"),
            ("extra.json.gz", r#"{"smile": "grin"}"#),
            ("plain.gz", "  Hat \n\n"),
        ] {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(content.as_bytes())?;
            fs::write(dir.path().join(name), encoder.finish()?)?;
        }

        let repository = TagRepository::new(vec![dir.path().to_path_buf()]);
        assert_eq!(
            repository.tags(),
            ["crimson eyes", "grin", "Hat", "red eyes", "smile"]
        );
        Ok(())
    }

    #[test]
    fn reload_replaces_snapshot_and_skips_missing_dirs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write(dir.path().join("a.txt"), "one\n")?;
        let mut repository = TagRepository::new(vec![
            dir.path().join("missing"),
            dir.path().to_path_buf(),
        ]);
        assert_eq!(repository.tags(), ["one"]);

        write(dir.path().join("a.txt"), "two\n")?;
        repository.reload();
        assert_eq!(repository.tags(), ["two"]);
        Ok(())
    }

    #[test]
    fn search_paths_follow_tier_order() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let app_root = root.path().join("app");
        let custom = root.path().join("custom");
        fs::create_dir_all(app_root.join("data").join("tagcomplete"))?;
        fs::create_dir_all(root.path().join("data").join("tagcomplete"))?;
        fs::create_dir_all(&custom)?;

        let env_value = std::env::join_paths([custom.clone(), root.path().join("nope")])?;
        let paths = search_paths_from(Some(env_value), &app_root);
        assert_eq!(
            paths,
            vec![
                custom,
                app_root.join("data").join("tagcomplete"),
                root.path().join("data").join("tagcomplete"),
            ]
        );
        Ok(())
    }
}
