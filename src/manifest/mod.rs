//! C3 — Manifest & Differ: parse a release ZIP, compute per-file hashes,
//! build the canonical manifest and package hash, and emit incremental diff
//! archives between two manifests. Grounded on `clawd::identity::hex_sha256`
//! for the hashing idiom and on the retrieval pack's use of the `zip` crate
//! (`kinode-dao-kinode`) for archive I/O; path-ignore matching reuses
//! `regex`, already a teacher dependency.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::ZipArchive;

/// A release's file manifest: normalized forward-slash path -> hex SHA-256.
pub type PackageManifest = BTreeMap<String, String>;

const CODEPUSH_RELEASE_MARKER: &str = ".codepushrelease";

static IGNORE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^__MACOSX/").unwrap(),
        Regex::new(r"(^|/)\.DS_Store$").unwrap(),
    ]
});

fn is_ignored(path: &str) -> bool {
    IGNORE_PATTERNS.iter().any(|re| re.is_match(path))
}

fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Decompress `zip_bytes` and hash every non-directory entry. If the bytes
/// are not a valid ZIP, falls back to a single-entry manifest keyed `"/"`.
pub fn generate_manifest(zip_bytes: &[u8]) -> PackageManifest {
    match ZipArchive::new(Cursor::new(zip_bytes)) {
        Ok(mut archive) => {
            let mut manifest = PackageManifest::new();
            for i in 0..archive.len() {
                let mut entry = match archive.by_index(i) {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                if entry.is_dir() {
                    continue;
                }
                let path = normalize_path(entry.name());
                if is_ignored(&path) {
                    continue;
                }
                let mut buf = Vec::new();
                if entry.read_to_end(&mut buf).is_err() {
                    continue;
                }
                manifest.insert(path, sha256_hex(&buf));
            }
            manifest
        }
        Err(_) => {
            let mut manifest = PackageManifest::new();
            manifest.insert("/".to_string(), sha256_hex(zip_bytes));
            manifest
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 over the JSON array of sorted `"<path>:<hex>"` strings, excluding
/// `.codepushrelease`. This is the canonical content identity of a release.
pub fn package_hash(manifest: &PackageManifest) -> String {
    let mut entries: Vec<String> = manifest
        .iter()
        .filter(|(path, _)| path.as_str() != CODEPUSH_RELEASE_MARKER)
        .map(|(path, hash)| format!("{path}:{hash}"))
        .collect();
    entries.sort();
    let json = serde_json::to_string(&entries).unwrap_or_default();
    sha256_hex(json.as_bytes())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestDiff {
    pub deleted_files: Vec<String>,
    pub changed_files: Vec<String>,
}

/// Computes which files were deleted or changed/added going from `old` to
/// `new`.
pub fn diff(old: &PackageManifest, new: &PackageManifest) -> ManifestDiff {
    let mut deleted_files: Vec<String> = old
        .keys()
        .filter(|path| !new.contains_key(*path))
        .cloned()
        .collect();
    deleted_files.sort();

    let mut changed_files: Vec<String> = new
        .iter()
        .filter(|(path, hash)| old.get(*path) != Some(*hash))
        .map(|(path, _)| path.clone())
        .collect();
    changed_files.sort();

    ManifestDiff {
        deleted_files,
        changed_files,
    }
}

/// Builds a ZIP containing `hotcodepush.json` (the deletion list) and the
/// bytes of every changed file, read out of `new_zip_bytes`.
pub fn build_diff_archive(new_zip_bytes: &[u8], diff: &ManifestDiff) -> anyhow::Result<Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(new_zip_bytes))?;
    let mut out = Vec::new();
    {
        let mut writer = zip::ZipWriter::new(Cursor::new(&mut out));
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        let manifest_json = serde_json::json!({ "deletedFiles": diff.deleted_files }).to_string();
        writer.start_file("hotcodepush.json", options)?;
        writer.write_all(manifest_json.as_bytes())?;

        for path in &diff.changed_files {
            if let Ok(mut entry) = archive.by_name(path) {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                writer.start_file(path.as_str(), options)?;
                writer.write_all(&buf)?;
            }
        }
        writer.finish()?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            let options =
                SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
            for (name, contents) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(contents).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn generate_manifest_hashes_each_file() {
        let zip = build_zip(&[("index.js", b"console.log(1)"), ("assets/a.png", b"\x89PNG")]);
        let manifest = generate_manifest(&zip);
        assert_eq!(manifest.len(), 2);
        assert!(manifest.contains_key("index.js"));
        assert!(manifest.contains_key("assets/a.png"));
    }

    #[test]
    fn generate_manifest_ignores_macosx_and_ds_store() {
        let zip = build_zip(&[
            ("index.js", b"a"),
            ("__MACOSX/index.js", b"junk"),
            (".DS_Store", b"junk"),
            ("assets/.DS_Store", b"junk"),
        ]);
        let manifest = generate_manifest(&zip);
        assert_eq!(manifest.len(), 1);
        assert!(manifest.contains_key("index.js"));
    }

    #[test]
    fn generate_manifest_falls_back_on_invalid_zip() {
        let manifest = generate_manifest(b"not a zip");
        assert_eq!(manifest.len(), 1);
        assert!(manifest.contains_key("/"));
    }

    #[test]
    fn package_hash_excludes_codepushrelease_and_is_order_independent() {
        let mut m1 = PackageManifest::new();
        m1.insert("index.js".to_string(), "aaa".to_string());
        m1.insert(".codepushrelease".to_string(), "zzz".to_string());

        let mut m2 = PackageManifest::new();
        m2.insert(".codepushrelease".to_string(), "different".to_string());
        m2.insert("index.js".to_string(), "aaa".to_string());

        assert_eq!(package_hash(&m1), package_hash(&m2));
    }

    #[test]
    fn package_hash_changes_when_contents_change() {
        let mut m1 = PackageManifest::new();
        m1.insert("index.js".to_string(), "aaa".to_string());
        let mut m2 = PackageManifest::new();
        m2.insert("index.js".to_string(), "bbb".to_string());
        assert_ne!(package_hash(&m1), package_hash(&m2));
    }

    #[test]
    fn diff_finds_deleted_and_changed_files() {
        let mut old = PackageManifest::new();
        old.insert("keep.js".to_string(), "h1".to_string());
        old.insert("remove.js".to_string(), "h2".to_string());

        let mut new = PackageManifest::new();
        new.insert("keep.js".to_string(), "h1".to_string());
        new.insert("added.js".to_string(), "h3".to_string());

        let d = diff(&old, &new);
        assert_eq!(d.deleted_files, vec!["remove.js".to_string()]);
        assert_eq!(d.changed_files, vec!["added.js".to_string()]);
    }

    #[test]
    fn build_diff_archive_contains_deletion_list_and_changed_bytes() {
        let old = {
            let mut m = PackageManifest::new();
            m.insert("a.js".to_string(), "h1".to_string());
            m.insert("b.js".to_string(), "h2".to_string());
            m
        };
        let new_zip = build_zip(&[("a.js", b"new contents"), ("c.js", b"created")]);
        let new = generate_manifest(&new_zip);
        let d = diff(&old, &new);

        let archive_bytes = build_diff_archive(&new_zip, &d).unwrap();
        let mut archive = ZipArchive::new(Cursor::new(archive_bytes)).unwrap();

        let mut manifest_entry = archive.by_name("hotcodepush.json").unwrap();
        let mut manifest_json = String::new();
        manifest_entry.read_to_string(&mut manifest_json).unwrap();
        assert!(manifest_json.contains("b.js"));
        drop(manifest_entry);

        let mut a_entry = archive.by_name("a.js").unwrap();
        let mut a_contents = Vec::new();
        a_entry.read_to_end(&mut a_contents).unwrap();
        assert_eq!(a_contents, b"new contents");
    }
}
