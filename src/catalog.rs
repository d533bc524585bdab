//! Path collection and per-file metadata for a delivery.
//!
//! User input (positional paths plus an optional path file) is expanded
//! into a flat list of `FileEntry` records. Directory structure is kept
//! in `subpath` so the remote keys mirror the local tree.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{DeliveryError, Result};

/// Suffix appended to every processed artifact.
pub const PROCESSED_SUFFIX: &str = ".ccp";

/// Suffix inserted when the source needed compression.
pub const COMPRESSED_SUFFIX: &str = ".zst";

/// Metadata for one local file on its way to the object store.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Catalog key: `subpath/filename` with `/` separators.
    pub key: String,
    /// Absolute path of the local source file.
    pub path_raw: PathBuf,
    /// Directory nesting relative to the delivery root.
    pub subpath: PathBuf,
    pub size_raw: u64,
    /// Byte count of the processed artifact, written back after streaming.
    pub size_processed: u64,
    /// Source is already in a compressed container format.
    pub compressed: bool,
    /// Local name of the processed artifact inside the staging tree.
    pub path_processed: PathBuf,
    /// Object-store key the processed file is uploaded under.
    pub path_remote: String,
    /// Set only when the dedup check found the key and the caller
    /// permitted replacement.
    pub overwrite: bool,
    /// Hex digest of the raw content, written back after streaming.
    pub checksum: String,
}

/// User paths after resolution. Inputs that do not exist are kept so the
/// caller can report them instead of silently dropping them.
#[derive(Debug, Default)]
pub struct PathCatalog {
    pub resolved: Vec<PathBuf>,
    pub unresolved: Vec<String>,
}

fn read_pathfile(pathfile: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(pathfile).map_err(|e| {
        DeliveryError::Input(format!(
            "could not read path file {}: {}",
            pathfile.display(),
            e
        ))
    })?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Resolves the user-supplied upload paths.
///
/// Fails when no paths were given at all, or when the same path is listed
/// more than once after resolution.
pub fn collect_upload_paths(data: &[String], pathfile: Option<&Path>) -> Result<PathCatalog> {
    let mut all: Vec<String> = data.to_vec();
    if let Some(pf) = pathfile {
        all.extend(read_pathfile(pf)?);
    }
    if all.is_empty() {
        return Err(DeliveryError::Input(
            "no data specified; pass one or more paths or --pathfile".into(),
        ));
    }

    let mut catalog = PathCatalog::default();
    let mut seen = HashSet::new();
    for raw in all {
        let p = Path::new(&raw);
        if p.exists() {
            let abs = p.canonicalize()?;
            if !seen.insert(abs.clone()) {
                return Err(DeliveryError::Input(format!(
                    "the path {} is listed more than once; remove the duplicate",
                    abs.display()
                )));
            }
            catalog.resolved.push(abs);
        } else {
            catalog.unresolved.push(raw);
        }
    }

    debug!(
        resolved = catalog.resolved.len(),
        unresolved = catalog.unresolved.len(),
        "collected upload paths"
    );
    Ok(catalog)
}

/// Resolves the requested download keys, with the same duplicate and
/// empty-input rules as the upload side.
pub fn collect_download_keys(data: &[String], pathfile: Option<&Path>) -> Result<Vec<String>> {
    let mut all: Vec<String> = data.to_vec();
    if let Some(pf) = pathfile {
        all.extend(read_pathfile(pf)?);
    }
    if all.is_empty() {
        return Err(DeliveryError::Input(
            "no data specified; pass one or more keys or --pathfile".into(),
        ));
    }

    let mut seen = HashSet::new();
    for key in &all {
        if !seen.insert(key.clone()) {
            return Err(DeliveryError::Input(format!(
                "the key {} is listed more than once; remove the duplicate",
                key
            )));
        }
    }
    Ok(all)
}

/// Checks the leading bytes for a known compressed-container signature.
/// Extension alone is not trusted.
pub fn is_compressed(path: &Path) -> std::io::Result<bool> {
    let mut f = File::open(path)?;
    let mut head = [0u8; 6];
    let n = f.read(&mut head)?;
    Ok(matches_container_magic(&head[..n]))
}

fn matches_container_magic(head: &[u8]) -> bool {
    head.starts_with(&[0x1f, 0x8b]) // gzip
        || head.starts_with(b"PK\x03\x04") // zip
        || head.starts_with(b"BZh") // bzip2
        || head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) // xz
        || head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) // zstd
}

/// New local name for the processed artifact:
/// `<name>[.zst].ccp`, keeping the original suffix chain intact.
pub fn processed_name(file_name: &str, already_compressed: bool) -> String {
    if already_compressed {
        format!("{file_name}{PROCESSED_SUFFIX}")
    } else {
        format!("{file_name}{COMPRESSED_SUFFIX}{PROCESSED_SUFFIX}")
    }
}

/// Name the file will have in the bucket: a fresh 6-hex-character prefix
/// joined to the processed name, under the entry's subpath. The random
/// prefix keeps repeated deliveries of identically named files from
/// colliding remotely.
pub fn generate_bucket_path(processed: &str, subpath: &Path) -> String {
    let prefix: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
    let name = format!("{prefix:06x}_{processed}");
    if subpath.as_os_str().is_empty() {
        name
    } else {
        format!("{}/{}", subpath_str(subpath), name)
    }
}

fn subpath_str(subpath: &Path) -> String {
    subpath.to_string_lossy().replace('\\', "/")
}

fn entry_for_file(path: &Path, subpath: &Path, destination: &Path) -> Result<FileEntry> {
    let size_raw = path.metadata()?.len();
    let compressed = is_compressed(path)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| DeliveryError::Input(format!("{} has no file name", path.display())))?;

    let processed = processed_name(&file_name, compressed);
    let key = if subpath.as_os_str().is_empty() {
        file_name.clone()
    } else {
        format!("{}/{}", subpath_str(subpath), file_name)
    };

    Ok(FileEntry {
        key,
        path_raw: path.to_path_buf(),
        subpath: subpath.to_path_buf(),
        size_raw,
        size_processed: 0,
        compressed,
        path_processed: destination.join(subpath).join(&processed),
        path_remote: generate_bucket_path(&processed, subpath),
        overwrite: false,
        checksum: String::new(),
    })
}

/// Expands the resolved paths into one `FileEntry` per file.
///
/// Files given directly land at the bucket root; a directory `d` maps its
/// contents under `d/...` so remote keys mirror the local structure.
pub fn build_entries(resolved: &[PathBuf], destination: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();

    for path in resolved {
        if path.is_file() {
            entries.push(entry_for_file(path, Path::new(""), destination)?);
        } else if path.is_dir() {
            let root_name = path
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("untitled"));

            for walked in WalkDir::new(path) {
                let walked =
                    walked.map_err(|e| std::io::Error::other(e.to_string()))?;
                if !walked.file_type().is_file() {
                    continue;
                }
                let rel = walked
                    .path()
                    .strip_prefix(path)
                    .map_err(std::io::Error::other)?;
                let subpath = match rel.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => root_name.join(parent),
                    _ => root_name.clone(),
                };
                entries.push(entry_for_file(walked.path(), &subpath, destination)?);
            }
        }
    }

    debug!(files = entries.len(), "catalog expanded");
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path, contents: &[u8]) {
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn expands_directories_and_mirrors_structure() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("project");
        fs::create_dir_all(root.join("sub")).unwrap();
        touch(&root.join("a.txt"), b"aaa");
        touch(&root.join("sub").join("b.txt"), b"bbb");
        touch(&dir.path().join("top.txt"), b"top");

        let resolved = vec![
            dir.path().join("top.txt").canonicalize().unwrap(),
            root.canonicalize().unwrap(),
        ];
        let entries = build_entries(&resolved, Path::new("/tmp/stage")).unwrap();
        assert_eq!(entries.len(), 3);

        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert!(keys.contains(&"top.txt"));
        assert!(keys.contains(&"project/a.txt"));
        assert!(keys.contains(&"project/sub/b.txt"));

        let b = entries
            .iter()
            .find(|e| e.key == "project/sub/b.txt")
            .unwrap();
        assert_eq!(b.subpath, PathBuf::from("project/sub"));
        assert!(b.path_remote.starts_with("project/sub/"));
        assert_eq!(b.size_raw, 3);
    }

    #[test]
    fn duplicate_input_is_a_hard_error() {
        let dir = TempDir::new().unwrap();
        let f = dir.path().join("x.txt");
        touch(&f, b"x");

        let data = vec![
            f.to_string_lossy().to_string(),
            f.to_string_lossy().to_string(),
        ];
        let err = collect_upload_paths(&data, None).unwrap_err();
        assert!(matches!(err, DeliveryError::Input(_)));
    }

    #[test]
    fn missing_inputs_are_retained_not_dropped() {
        let dir = TempDir::new().unwrap();
        let f = dir.path().join("real.txt");
        touch(&f, b"r");

        let data = vec![
            f.to_string_lossy().to_string(),
            "does/not/exist.bin".to_string(),
        ];
        let catalog = collect_upload_paths(&data, None).unwrap();
        assert_eq!(catalog.resolved.len(), 1);
        assert_eq!(catalog.unresolved, vec!["does/not/exist.bin"]);
    }

    #[test]
    fn empty_input_fails() {
        assert!(matches!(
            collect_upload_paths(&[], None),
            Err(DeliveryError::Input(_))
        ));
        assert!(matches!(
            collect_download_keys(&[], None),
            Err(DeliveryError::Input(_))
        ));
    }

    #[test]
    fn pathfile_lines_are_merged() {
        let dir = TempDir::new().unwrap();
        let f = dir.path().join("a.txt");
        touch(&f, b"a");
        let pf = dir.path().join("paths.txt");
        touch(&pf, format!("{}\n\n", f.display()).as_bytes());

        let catalog = collect_upload_paths(&[], Some(&pf)).unwrap();
        assert_eq!(catalog.resolved.len(), 1);
    }

    #[test]
    fn container_magic_is_detected_by_content() {
        let dir = TempDir::new().unwrap();

        let gz = dir.path().join("data.bin");
        touch(&gz, &[0x1f, 0x8b, 0x08, 0x00, 0x00]);
        assert!(is_compressed(&gz).unwrap());

        let zst = dir.path().join("data2.bin");
        touch(&zst, &[0x28, 0xb5, 0x2f, 0xfd, 0x01]);
        assert!(is_compressed(&zst).unwrap());

        // A .gz extension on plain text does not count.
        let fake = dir.path().join("fake.gz");
        touch(&fake, b"plain text here");
        assert!(!is_compressed(&fake).unwrap());

        let short = dir.path().join("tiny");
        touch(&short, b"a");
        assert!(!is_compressed(&short).unwrap());
    }

    #[test]
    fn processed_name_keeps_suffix_chain() {
        assert_eq!(processed_name("a.txt", false), "a.txt.zst.ccp");
        assert_eq!(processed_name("a.tar.gz", true), "a.tar.gz.ccp");
        assert_eq!(processed_name("noext", false), "noext.zst.ccp");
    }

    #[test]
    fn bucket_path_has_random_hex_prefix() {
        let p = generate_bucket_path("a.txt.zst.ccp", Path::new(""));
        let (prefix, rest) = p.split_once('_').unwrap();
        assert_eq!(prefix.len(), 6);
        assert!(prefix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(rest, "a.txt.zst.ccp");

        let nested = generate_bucket_path("a.txt.zst.ccp", Path::new("d/e"));
        assert!(nested.starts_with("d/e/"));
    }

    #[test]
    fn same_basename_in_different_subpaths_gets_distinct_keys() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("r");
        fs::create_dir_all(root.join("one")).unwrap();
        fs::create_dir_all(root.join("two")).unwrap();
        touch(&root.join("one").join("same.txt"), b"1");
        touch(&root.join("two").join("same.txt"), b"2");

        let entries =
            build_entries(&[root.canonicalize().unwrap()], Path::new("/tmp/stage")).unwrap();
        assert_eq!(entries.len(), 2);
        assert_ne!(entries[0].path_remote, entries[1].path_remote);
    }

    #[test]
    fn rebuilding_randomizes_the_remote_prefix() {
        let dir = TempDir::new().unwrap();
        let f = dir.path().join("a.txt");
        touch(&f, b"a");
        let resolved = vec![f.canonicalize().unwrap()];

        let first = build_entries(&resolved, Path::new("/tmp/s")).unwrap();
        let second = build_entries(&resolved, Path::new("/tmp/s")).unwrap();
        assert_ne!(first[0].path_remote, second[0].path_remote);
    }
}
