//! Directory-backed file lifecycle storage
//!
//! Files move `input → processing → archive | error`. A claim is a single `rename` inside
//! one file system, so a concurrent listing of the input directory sees a file either
//! before or after it, never half-way. Neither a claim nor a placement replaces a file
//! that is already there.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::report::ErrorReport;
use crate::error::{EtlError, Result};
use crate::types::{Placement, SourceFile};

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const REPORT_SUFFIX: &str = ".report.json";

/// The four lifecycle directories and the input file pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    pub input_dir: PathBuf,
    pub processing_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub error_dir: PathBuf,
    /// Shell-style glob (`*`, `?`) matched against file names
    pub file_pattern: String,
}

#[derive(Debug)]
pub struct FileStore {
    layout: StorageLayout,
    pattern: Regex,
}

impl FileStore {
    pub fn new(layout: StorageLayout) -> Result<Self> {
        let pattern = glob_to_regex(&layout.file_pattern)?;
        Ok(Self { layout, pattern })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }

    /// Create every lifecycle directory that does not exist yet
    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.layout.input_dir,
            &self.layout.processing_dir,
            &self.layout.archive_dir,
            &self.layout.error_dir,
        ] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| EtlError::io(dir, e))?;
        }
        Ok(())
    }

    /// Snapshot of matching files in the input directory, ordered by name
    pub async fn discover(&self) -> Result<Vec<SourceFile>> {
        let dir = &self.layout.input_dir;
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| EtlError::io(dir, e))?;
        let discovered_at = Utc::now();
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(|e| EtlError::io(dir, e))? {
            let Ok(name) = entry.file_name().into_string() else {
                warn!(path = %entry.path().display(), "Skipping file with non UTF-8 name");
                continue;
            };
            if !self.matches(&name) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // gone between listing and stat
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(EtlError::io(entry.path(), e)),
            };
            if !metadata.is_file() {
                continue;
            }
            files.push(SourceFile {
                path: entry.path(),
                name,
                size_bytes: metadata.len(),
                discovered_at,
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(dir = %dir.display(), files = files.len(), "Discovered input files");
        Ok(files)
    }

    /// Move a discovered file into the processing directory
    ///
    /// `Ok(None)` means the file vanished from the input directory first (another process
    /// claimed it) and must be skipped. A leftover of the same name in the processing
    /// directory is kept; the claimed file gets a numbered name beside it.
    pub async fn claim(&self, file: &SourceFile) -> Result<Option<PathBuf>> {
        let (stem, ext) = split_name(&file.name);
        let mut target = self.layout.processing_dir.join(&file.name);
        let mut n = 1;
        while exists(&target).await {
            target = self.layout.processing_dir.join(format!("{stem}-{n}{ext}"));
            n += 1;
        }
        if n > 1 {
            warn!(
                file = %file.name,
                claimed = %target.display(),
                "Processing directory holds a leftover of the same name"
            );
        }
        match tokio::fs::rename(&file.path, &target).await {
            Ok(()) => {
                debug!(file = %file.name, "Claimed file");
                Ok(Some(target))
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EtlError::io(&file.path, e)),
        }
    }

    /// Where a file named `name` lands for `placement`, stamped with `at`
    ///
    /// Archive: `stem_YYYYmmddHHMMSS.ext`; error: `stem_error_YYYYmmddHHMMSS.ext`. A numeric
    /// suffix keeps names unique when the same name lands twice within a second.
    pub async fn terminal_path(&self, name: &str, placement: Placement, at: DateTime<Utc>) -> PathBuf {
        let (dir, marker) = match placement {
            Placement::Archived => (&self.layout.archive_dir, ""),
            Placement::Errored => (&self.layout.error_dir, "_error"),
        };
        let (stem, ext) = split_name(name);
        let stamp = at.format(TIMESTAMP_FORMAT);

        let mut candidate = dir.join(format!("{stem}{marker}_{stamp}{ext}"));
        let mut n = 1;
        while exists(&candidate).await || exists(&report_path_for(&candidate)).await {
            candidate = dir.join(format!("{stem}{marker}_{stamp}-{n}{ext}"));
            n += 1;
        }
        candidate
    }

    /// Write the report next to `terminal` via a temporary name, then rename it into place
    pub async fn write_report(&self, terminal: &Path, report: &ErrorReport) -> Result<PathBuf> {
        let path = report_path_for(terminal);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(report)
            .map_err(|e| EtlError::Internal(format!("could not serialize report: {e}")))?;

        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| EtlError::io(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(EtlError::io(&path, e));
        }
        Ok(path)
    }

    /// Move a processed file to its terminal path; fails rather than replace a file there
    pub async fn place(&self, from: &Path, terminal: &Path) -> Result<()> {
        match tokio::fs::hard_link(from, terminal).await {
            Ok(()) => {
                if let Err(e) = tokio::fs::remove_file(from).await {
                    let _ = tokio::fs::remove_file(terminal).await;
                    return Err(EtlError::io(from, e));
                }
            },
            Err(e) if matches!(e.kind(), ErrorKind::AlreadyExists | ErrorKind::NotFound) => {
                let path = if e.kind() == ErrorKind::AlreadyExists { terminal } else { from };
                return Err(EtlError::io(path, e));
            },
            // no hard links on this file system
            Err(e) => {
                debug!(error = %e, "Hard link failed; falling back to rename");
                if exists(terminal).await {
                    return Err(EtlError::io(
                        terminal,
                        std::io::Error::new(ErrorKind::AlreadyExists, "destination exists"),
                    ));
                }
                tokio::fs::rename(from, terminal)
                    .await
                    .map_err(|e| EtlError::io(from, e))?;
            },
        }
        info!(from = %from.display(), to = %terminal.display(), "Moved file");
        Ok(())
    }

    /// Remove a report whose file never reached its terminal path
    pub async fn discard_report(&self, report: &Path) -> Result<()> {
        match tokio::fs::remove_file(report).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EtlError::io(report, e)),
        }
    }

    /// Move a claimed file straight to the error directory
    pub async fn quarantine(&self, from: &Path, name: &str) -> Result<PathBuf> {
        let terminal = self.terminal_path(name, Placement::Errored, Utc::now()).await;
        self.place(from, &terminal).await?;
        Ok(terminal)
    }
}

/// Unreadable metadata counts as absent
async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Report path that belongs to a terminal file path
pub fn report_path_for(terminal: &Path) -> PathBuf {
    let mut name = terminal.file_name().unwrap_or_default().to_os_string();
    name.push(REPORT_SUFFIX);
    terminal.with_file_name(name)
}

/// Split `name` into stem and extension, the extension keeping its dot
fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => name.split_at(pos),
        _ => (name, ""),
    }
}

fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str("[^/]*"),
            '?' => pattern.push_str("[^/]"),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|e| EtlError::config(format!("invalid file pattern '{glob}': {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn store(root: &Path) -> FileStore {
        FileStore::new(StorageLayout {
            input_dir: root.join("input"),
            processing_dir: root.join("processing"),
            archive_dir: root.join("archive"),
            error_dir: root.join("error"),
            file_pattern: "*.csv".to_string(),
        })
        .unwrap()
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 18, 10, 30, 5).unwrap()
    }

    #[test]
    fn test_glob_matching() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        assert!(store.matches("sales.csv"));
        assert!(!store.matches("sales.csv.bak"));
        assert!(!store.matches("sales.txt"));

        let re = glob_to_regex("tx_??.csv").unwrap();
        assert!(re.is_match("tx_01.csv"));
        assert!(!re.is_match("tx_1.csv"));
    }

    #[tokio::test]
    async fn test_terminal_names() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());

        let archived = store.terminal_path("sales.csv", Placement::Archived, at()).await;
        assert_eq!(archived, dir.path().join("archive/sales_20240118103005.csv"));

        let errored = store.terminal_path("sales.csv", Placement::Errored, at()).await;
        assert_eq!(errored, dir.path().join("error/sales_error_20240118103005.csv"));

        assert_eq!(
            report_path_for(&archived),
            dir.path().join("archive/sales_20240118103005.csv.report.json")
        );
    }

    #[tokio::test]
    async fn test_terminal_name_collision_gets_suffix() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.ensure_dirs().await.unwrap();

        let first = store.terminal_path("sales.csv", Placement::Archived, at()).await;
        std::fs::write(&first, "x").unwrap();
        let second = store.terminal_path("sales.csv", Placement::Archived, at()).await;
        assert_eq!(second, dir.path().join("archive/sales_20240118103005-1.csv"));
    }

    #[tokio::test]
    async fn test_discover_is_sorted_snapshot_of_matching_files() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.ensure_dirs().await.unwrap();

        for name in ["b.csv", "a.csv", "notes.txt"] {
            std::fs::write(dir.path().join("input").join(name), "id\n1\n").unwrap();
        }
        std::fs::create_dir(dir.path().join("input/nested.csv")).unwrap();

        let files = store.discover().await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.csv", "b.csv"]);
        assert_eq!(files[0].size_bytes, 5);
    }

    #[tokio::test]
    async fn test_claim_moves_once() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.ensure_dirs().await.unwrap();
        std::fs::write(dir.path().join("input/a.csv"), "id\n1\n").unwrap();

        let file = store.discover().await.unwrap().remove(0);
        let claimed = store.claim(&file).await.unwrap().unwrap();
        assert_eq!(claimed, dir.path().join("processing/a.csv"));
        assert!(claimed.exists());
        assert!(!file.path.exists());

        assert!(store.claim(&file).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_keeps_a_leftover_of_the_same_name() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.ensure_dirs().await.unwrap();
        std::fs::write(dir.path().join("processing/a.csv"), "left over").unwrap();
        std::fs::write(dir.path().join("input/a.csv"), "id\n1\n").unwrap();

        let file = store.discover().await.unwrap().remove(0);
        let claimed = store.claim(&file).await.unwrap().unwrap();
        assert_eq!(claimed, dir.path().join("processing/a-1.csv"));
        assert_eq!(std::fs::read_to_string(&claimed).unwrap(), "id\n1\n");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("processing/a.csv")).unwrap(),
            "left over"
        );
    }

    #[tokio::test]
    async fn test_place_never_replaces_an_existing_file() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.ensure_dirs().await.unwrap();
        let processing = dir.path().join("processing/a.csv");
        let terminal = dir.path().join("archive/a_20240118103005.csv");
        std::fs::write(&processing, "new").unwrap();
        std::fs::write(&terminal, "old").unwrap();

        let err = store.place(&processing, &terminal).await.unwrap_err();
        assert!(matches!(err, EtlError::Io { .. }));
        assert_eq!(std::fs::read_to_string(&terminal).unwrap(), "old");
        assert_eq!(std::fs::read_to_string(&processing).unwrap(), "new");

        let free = dir.path().join("archive/a_20240118103006.csv");
        store.place(&processing, &free).await.unwrap();
        assert!(!processing.exists());
        assert_eq!(std::fs::read_to_string(&free).unwrap(), "new");
    }

    #[tokio::test]
    async fn test_discard_report_tolerates_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        let report = dir.path().join("gone.csv.report.json");
        store.discard_report(&report).await.unwrap();

        std::fs::write(&report, "{}").unwrap();
        store.discard_report(&report).await.unwrap();
        assert!(!report.exists());
    }

    #[tokio::test]
    async fn test_quarantine_moves_to_error_dir() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.ensure_dirs().await.unwrap();
        let processing = dir.path().join("processing/a.csv");
        std::fs::write(&processing, "id\n").unwrap();

        let terminal = store.quarantine(&processing, "a.csv").await.unwrap();
        assert!(terminal.starts_with(dir.path().join("error")));
        assert!(terminal.exists());
        assert!(!processing.exists());
    }
}
