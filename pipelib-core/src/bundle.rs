//! Conversion of a library checkout into a single normalized bundle file.
//!
//! A bundle is a zstd-compressed tar archive with this layout:
//!
//! - `vars/*.groovy` at the archive root (global variables)
//! - `src/**` at the archive root (classpath sources)
//! - `resources/**` under `resources/`
//!
//! Entries are sorted with zeroed timestamps, so bundling the same tree twice
//! yields identical bytes.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::report::BuildReporter;

static PARENT_SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|[/\\])\.\.([/\\]|$)").expect("parent segment pattern is valid"));

const COMPRESSION_LEVEL: i32 = 3;
const RESOURCES_PREFIX: &str = "resources/";

/// Options that apply to every bundle built by the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct BundleOptions {
    /// Keep `src/test/**` in the bundle.
    pub include_src_test: bool,
}

/// What a bundle contains, recorded alongside it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSummary {
    /// Global variable names, from `vars/*.groovy`, sorted.
    pub variables: Vec<String>,
    /// Number of archive entries.
    pub entries: usize,
}

/// Rejects library paths that contain `..` segments or are absolute.
pub fn validate_library_path(path: &str) -> Result<()> {
    if PARENT_SEGMENT_RE.is_match(path)
        || Path::new(path).is_absolute()
        || path.starts_with('/')
        || path.starts_with('\\')
    {
        return Err(Error::ForbiddenLibraryPath {
            path: path.to_string(),
        });
    }
    Ok(())
}

/// Bundles the library found in `checkout` (optionally below `library_path`) into `target`.
///
/// # Arguments
///
/// * `library` - Library name, used in diagnostics
/// * `checkout` - Root of the SCM checkout
/// * `library_path` - Sub-directory of the checkout holding `src/`, `vars/` and `resources/`
/// * `target` - Bundle file to write
///
/// # Errors
///
/// Returns [`Error::ForbiddenLibraryPath`] for a `..` library path,
/// [`Error::SymlinkEscape`] if any symlink in the checkout resolves outside it,
/// and [`Error::EmptyLibrary`] if neither `src/` nor `vars/` has content.
pub fn dir_to_bundle(
    library: &str,
    checkout: &Path,
    library_path: Option<&str>,
    target: &Path,
    options: &BundleOptions,
    reporter: &dyn BuildReporter,
) -> Result<BundleSummary> {
    let root = match library_path.filter(|p| !p.is_empty()) {
        Some(path) => {
            validate_library_path(path)?;
            checkout.join(path)
        }
        None => checkout.to_path_buf(),
    };

    check_symlinks(library, checkout)?;

    let mut files: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut variables = Vec::new();

    let vars = root.join("vars");
    if vars.is_dir() {
        for entry in fs::read_dir(&vars)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "groovy") {
                if let Some(file_name) = path.file_name().and_then(|n| n.to_str()) {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        variables.push(stem.to_string());
                    }
                    insert_entry(&mut files, file_name.to_string(), path.clone())?;
                }
            }
        }
    }

    let mut source_count = 0usize;
    let mut excluded_tests = false;
    for (relative, path) in walk_files(&root.join("src"))? {
        if !options.include_src_test && (relative == "test" || relative.starts_with("test/")) {
            excluded_tests = true;
            continue;
        }
        source_count += 1;
        insert_entry(&mut files, relative, path)?;
    }
    if excluded_tests {
        reporter.line(&format!(
            "Excluding src/test/ from checkout of {} so that library test code cannot be accessed by builds.",
            library
        ));
    }

    if variables.is_empty() && source_count == 0 {
        return Err(Error::EmptyLibrary {
            library: library.to_string(),
        });
    }

    for (relative, path) in walk_files(&root.join("resources"))? {
        insert_entry(&mut files, format!("{}{}", RESOURCES_PREFIX, relative), path)?;
    }

    let contents = files
        .par_iter()
        .map(|(name, path)| fs::read(path).map(|data| (name.as_str(), data)))
        .collect::<std::io::Result<Vec<_>>>()?;

    write_archive(target, &contents)?;
    variables.sort();

    tracing::debug!(library, entries = contents.len(), target = %target.display(), "bundle written");
    Ok(BundleSummary {
        variables,
        entries: contents.len(),
    })
}

fn insert_entry(files: &mut BTreeMap<String, PathBuf>, name: String, path: PathBuf) -> Result<()> {
    if let Some(existing) = files.get(&name) {
        return Err(Error::Bundle(format!(
            "{} and {} both map to bundle entry {}",
            existing.display(),
            path.display(),
            name
        )));
    }
    files.insert(name, path);
    Ok(())
}

/// Regular files below `dir` as (`/`-separated relative path, absolute path).
fn walk_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Bundle(format!("walking {}: {}", dir.display(), e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| Error::Bundle(e.to_string()))?;
        files.push((to_entry_name(relative), entry.path().to_path_buf()));
    }
    Ok(files)
}

fn to_entry_name(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn check_symlinks(library: &str, checkout: &Path) -> Result<()> {
    let root = checkout.canonicalize()?;
    let walker = WalkDir::new(checkout)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(|e| Error::Bundle(e.to_string()))?;
        if !entry.path_is_symlink() {
            continue;
        }
        let target = resolve_link(entry.path())?;
        if !target.starts_with(&root) {
            return Err(Error::SymlinkEscape {
                library: library.to_string(),
                path: entry.path().to_path_buf(),
                target,
            });
        }
    }
    Ok(())
}

/// Real target of a symlink. Dangling links are resolved lexically.
fn resolve_link(link: &Path) -> Result<PathBuf> {
    if let Ok(real) = link.canonicalize() {
        return Ok(real);
    }
    let destination = fs::read_link(link)?;
    let parent = link
        .parent()
        .map(Path::canonicalize)
        .transpose()?
        .unwrap_or_default();
    Ok(normalize(&parent.join(destination)))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn write_archive(target: &Path, contents: &[(&str, Vec<u8>)]) -> Result<()> {
    let mut tar_data = Vec::new();
    {
        let mut tar = tar::Builder::new(&mut tar_data);
        for (name, data) in contents {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_entry_type(tar::EntryType::Regular);
            tar.append_data(&mut header, name, data.as_slice())
                .map_err(|e| Error::Bundle(format!("Failed to append {}: {}", name, e)))?;
        }
        tar.finish()
            .map_err(|e| Error::Bundle(format!("Failed to finish tar archive: {}", e)))?;
    }

    let compressed = zstd::encode_all(&tar_data[..], COMPRESSION_LEVEL)
        .map_err(|e| Error::Bundle(format!("Failed to compress bundle: {}", e)))?;

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(target, compressed)?;
    Ok(())
}

fn open_archive(bundle: &Path) -> Result<tar::Archive<std::io::Cursor<Vec<u8>>>> {
    let data = fs::read(bundle)?;
    let tar_data = zstd::decode_all(&data[..])
        .map_err(|e| Error::Bundle(format!("Failed to decompress {}: {}", bundle.display(), e)))?;
    Ok(tar::Archive::new(std::io::Cursor::new(tar_data)))
}

/// Entry names of a bundle, in archive order.
pub fn list_bundle(bundle: &Path) -> Result<Vec<String>> {
    let mut archive = open_archive(bundle)?;
    let mut names = Vec::new();
    for entry in archive
        .entries()
        .map_err(|e| Error::Bundle(format!("Failed to read archive entries: {}", e)))?
    {
        let entry = entry.map_err(|e| Error::Bundle(format!("Failed to read archive entry: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| Error::Bundle(format!("Invalid entry path: {}", e)))?;
        names.push(to_entry_name(&path));
    }
    Ok(names)
}

/// Reads a single entry, or `None` if the bundle has no such entry.
pub fn read_entry(bundle: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let mut archive = open_archive(bundle)?;
    for entry in archive
        .entries()
        .map_err(|e| Error::Bundle(format!("Failed to read archive entries: {}", e)))?
    {
        let mut entry =
            entry.map_err(|e| Error::Bundle(format!("Failed to read archive entry: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| Error::Bundle(format!("Invalid entry path: {}", e)))?;
        if to_entry_name(&path) == name {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            return Ok(Some(data));
        }
    }
    Ok(None)
}

/// Reads `resources/<resource>` from a bundle.
pub fn read_resource(bundle: &Path, resource: &str) -> Result<Option<Vec<u8>>> {
    read_entry(bundle, &format!("{}{}", RESOURCES_PREFIX, resource))
}

/// Unpacks a bundle below `dest` and returns the number of entries written.
pub fn extract_bundle(bundle: &Path, dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest)?;
    let mut archive = open_archive(bundle)?;
    let mut count = 0;
    for entry in archive
        .entries()
        .map_err(|e| Error::Bundle(format!("Failed to read archive entries: {}", e)))?
    {
        let mut entry =
            entry.map_err(|e| Error::Bundle(format!("Failed to read archive entry: {}", e)))?;
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| Error::Bundle(format!("Failed to extract entry: {}", e)))?;
        if !unpacked {
            let path = entry
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            return Err(Error::PathTraversal(path));
        }
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::RecordingReporter;
    use tempfile::TempDir;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn bundle(checkout: &Path, options: BundleOptions) -> (TempDir, Result<BundleSummary>, RecordingReporter) {
        let out = TempDir::new().unwrap();
        let reporter = RecordingReporter::new();
        let result = dir_to_bundle(
            "utils",
            checkout,
            None,
            &out.path().join("utils.tar.zst"),
            &options,
            &reporter,
        );
        (out, result, reporter)
    }

    #[test]
    fn test_layout_and_variables() {
        let checkout = TempDir::new().unwrap();
        write(checkout.path(), "vars/deploy.groovy", "def call() {}");
        write(checkout.path(), "vars/build.groovy", "def call() {}");
        write(checkout.path(), "vars/README.md", "docs");
        write(checkout.path(), "src/org/acme/Util.groovy", "class Util {}");
        write(checkout.path(), "resources/conf/app.yaml", "a: 1");

        let (out, result, _) = bundle(checkout.path(), BundleOptions::default());
        let summary = result.unwrap();
        assert_eq!(summary.variables, vec!["build", "deploy"]);
        assert_eq!(summary.entries, 4);

        let names = list_bundle(&out.path().join("utils.tar.zst")).unwrap();
        assert_eq!(
            names,
            vec!["build.groovy", "deploy.groovy", "org/acme/Util.groovy", "resources/conf/app.yaml"]
        );
    }

    #[test]
    fn test_only_src_test_is_empty_library() {
        let checkout = TempDir::new().unwrap();
        write(checkout.path(), "src/test/FooTest.groovy", "class FooTest {}");

        let (_out, result, reporter) = bundle(checkout.path(), BundleOptions::default());
        let err = result.unwrap_err();
        assert!(matches!(err, Error::EmptyLibrary { .. }));
        assert!(err
            .to_string()
            .contains("expected to contain at least one of src or vars directories"));
        assert!(reporter.contains("Excluding src/test/ from checkout of utils"));
    }

    #[test]
    fn test_src_test_kept_when_enabled() {
        let checkout = TempDir::new().unwrap();
        write(checkout.path(), "src/test/FooTest.groovy", "class FooTest {}");

        let (out, result, reporter) = bundle(
            checkout.path(),
            BundleOptions {
                include_src_test: true,
            },
        );
        assert_eq!(result.unwrap().entries, 1);
        assert!(!reporter.contains("Excluding"));
        let names = list_bundle(&out.path().join("utils.tar.zst")).unwrap();
        assert_eq!(names, vec!["test/FooTest.groovy"]);
    }

    #[test]
    fn test_library_path_subdirectory() {
        let checkout = TempDir::new().unwrap();
        write(checkout.path(), "libs/utils/vars/x.groovy", "");
        write(checkout.path(), "vars/ignored.groovy", "");
        let out = TempDir::new().unwrap();
        let target = out.path().join("b.tar.zst");
        let summary = dir_to_bundle(
            "utils",
            checkout.path(),
            Some("libs/utils/"),
            &target,
            &BundleOptions::default(),
            &RecordingReporter::new(),
        )
        .unwrap();
        assert_eq!(summary.variables, vec!["x"]);
    }

    #[test]
    fn test_library_path_traversal_rejected() {
        for path in ["..", "../x", "a/../b", "a\\..\\b", "a/..", "/abs"] {
            assert!(
                matches!(validate_library_path(path), Err(Error::ForbiddenLibraryPath { .. })),
                "{} should be rejected",
                path
            );
        }
        for path in ["libs/utils", "a..b", "..hidden/x", "x/y.."] {
            assert!(validate_library_path(path).is_ok(), "{} should be allowed", path);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let outside = TempDir::new().unwrap();
        write(outside.path(), "secret.txt", "s3cr3t");
        let checkout = TempDir::new().unwrap();
        write(checkout.path(), "vars/x.groovy", "");
        fs::create_dir_all(checkout.path().join("resources")).unwrap();
        let link = checkout.path().join("resources/leak.txt");
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), &link).unwrap();

        let (_out, result, _) = bundle(checkout.path(), BundleOptions::default());
        match result.unwrap_err() {
            Error::SymlinkEscape { path, target, .. } => {
                assert_eq!(path, link);
                assert_eq!(target, outside.path().join("secret.txt").canonicalize().unwrap());
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_internal_symlink_allowed() {
        let checkout = TempDir::new().unwrap();
        write(checkout.path(), "vars/x.groovy", "");
        write(checkout.path(), "shared/data.txt", "d");
        fs::create_dir_all(checkout.path().join("resources")).unwrap();
        std::os::unix::fs::symlink(
            checkout.path().join("shared/data.txt"),
            checkout.path().join("resources/data.txt"),
        )
        .unwrap();

        let (out, result, _) = bundle(checkout.path(), BundleOptions::default());
        result.unwrap();
        let data = read_resource(&out.path().join("utils.tar.zst"), "data.txt").unwrap();
        assert_eq!(data.as_deref(), Some(&b"d"[..]));
    }

    #[test]
    fn test_rebundling_is_byte_identical() {
        let checkout = TempDir::new().unwrap();
        write(checkout.path(), "vars/a.groovy", "a");
        write(checkout.path(), "src/p/b.groovy", "b");

        let (first, r1, _) = bundle(checkout.path(), BundleOptions::default());
        let (second, r2, _) = bundle(checkout.path(), BundleOptions::default());
        r1.unwrap();
        r2.unwrap();
        assert_eq!(
            fs::read(first.path().join("utils.tar.zst")).unwrap(),
            fs::read(second.path().join("utils.tar.zst")).unwrap()
        );
    }

    #[test]
    fn test_extract_round_trip() {
        let checkout = TempDir::new().unwrap();
        write(checkout.path(), "vars/a.groovy", "a");
        write(checkout.path(), "resources/c/d.txt", "d");
        let (out, result, _) = bundle(checkout.path(), BundleOptions::default());
        result.unwrap();

        let dest = TempDir::new().unwrap();
        let count = extract_bundle(&out.path().join("utils.tar.zst"), dest.path()).unwrap();
        assert_eq!(count, 2);
        assert_eq!(fs::read_to_string(dest.path().join("resources/c/d.txt")).unwrap(), "d");
    }
}
