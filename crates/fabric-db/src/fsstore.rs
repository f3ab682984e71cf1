//! Flat-file JSON persistence for entities that don't need relational
//! queries: resolver registry entries, mastery plans, and evolver failure
//! rings.
//!
//! Each entity is one JSON file under a directory; an in-memory index is
//! rebuilt from these files at startup (the "arena + index" design note).
//! This module only deals with bytes on disk -- the arena/index structures
//! themselves live in `fabric-core`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;

/// Write `value` as pretty JSON to `dir/<file_stem>.json`, creating `dir` if
/// needed. Overwrites any existing file for the same stem.
pub async fn write_json<T: Serialize>(dir: &Path, file_stem: &str, value: &T) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create directory {}", dir.display()))?;
    let path = file_path(dir, file_stem);
    let bytes = serde_json::to_vec_pretty(value).context("failed to serialize entity")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Read and deserialize `dir/<file_stem>.json`.
pub async fn read_json<T: DeserializeOwned>(dir: &Path, file_stem: &str) -> Result<Option<T>> {
    let path = file_path(dir, file_stem);
    match fs::read(&path).await {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Remove `dir/<file_stem>.json` if present. Returns whether a file was
/// actually removed.
pub async fn remove(dir: &Path, file_stem: &str) -> Result<bool> {
    let path = file_path(dir, file_stem);
    match fs::remove_file(&path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

/// Deserialize every `*.json` file directly under `dir` (non-recursive),
/// skipping and logging any file that fails to parse rather than aborting
/// the whole scan -- a single corrupt entry should not take down startup.
pub async fn read_all_json<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to list {}", dir.display()))?;

    let mut items = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed to iterate {}", dir.display()))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => items.push(value),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unparsable entry");
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable entry");
            }
        }
    }
    Ok(items)
}

/// Append a line of JSON to `path`, then truncate the file to at most the
/// last `ring_size` lines -- the bounded-ring persistence strategy used for
/// execution history (spec.md §9 history ring).
pub async fn append_ring_line<T: Serialize>(path: &Path, value: &T, ring_size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let mut lines = match fs::read_to_string(path).await {
        Ok(text) => text.lines().map(str::to_owned).collect::<Vec<_>>(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    lines.push(serde_json::to_string(value).context("failed to serialize history entry")?);
    if lines.len() > ring_size {
        let drop = lines.len() - ring_size;
        lines.drain(0..drop);
    }
    let mut text = lines.join("\n");
    text.push('\n');
    fs::write(path, text)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Read back every JSON line in a ring file, oldest first.
pub async fn read_ring_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    match fs::read_to_string(path).await {
        Ok(text) => {
            let mut items = Vec::new();
            for line in text.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                items.push(
                    serde_json::from_str(line)
                        .with_context(|| format!("failed to parse line in {}", path.display()))?,
                );
            }
            Ok(items)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn file_path(dir: &Path, file_stem: &str) -> PathBuf {
    dir.join(format!("{file_stem}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Widget {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn write_then_read_json() {
        let dir = tempfile::tempdir().unwrap();
        let w = Widget {
            name: "bolt".into(),
            count: 3,
        };
        write_json(dir.path(), "bolt@1.0.0", &w).await.unwrap();
        let back: Option<Widget> = read_json(dir.path(), "bolt@1.0.0").await.unwrap();
        assert_eq!(back, Some(w));
    }

    #[tokio::test]
    async fn read_json_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let back: Option<Widget> = read_json(dir.path(), "absent").await.unwrap();
        assert_eq!(back, None);
    }

    #[tokio::test]
    async fn remove_reports_whether_present() {
        let dir = tempfile::tempdir().unwrap();
        let w = Widget {
            name: "nut".into(),
            count: 1,
        };
        write_json(dir.path(), "nut", &w).await.unwrap();
        assert!(remove(dir.path(), "nut").await.unwrap());
        assert!(!remove(dir.path(), "nut").await.unwrap());
    }

    #[tokio::test]
    async fn read_all_json_skips_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        write_json(
            dir.path(),
            "good",
            &Widget {
                name: "a".into(),
                count: 1,
            },
        )
        .await
        .unwrap();
        fs::write(dir.path().join("bad.json"), b"{not json")
            .await
            .unwrap();

        let all: Vec<Widget> = read_all_json(dir.path()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "a");
    }

    #[tokio::test]
    async fn ring_truncates_to_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.jsonl");
        for i in 0..5u32 {
            append_ring_line(
                &path,
                &Widget {
                    name: format!("w{i}"),
                    count: i,
                },
                3,
            )
            .await
            .unwrap();
        }
        let all: Vec<Widget> = read_ring_lines(&path).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].count, 2);
        assert_eq!(all[2].count, 4);
    }
}
