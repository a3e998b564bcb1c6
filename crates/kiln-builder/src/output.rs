//! Output validation, sizing, and reference scanning.

use crate::BuildError;
use kiln_derive::StorePath;
use kiln_store::Store;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Validate an output path.
pub fn validate_output(path: &Path) -> Result<(), BuildError> {
    if !path.exists() {
        return Err(BuildError::BuildFailed(format!(
            "output does not exist: {}",
            path.display()
        )));
    }
    
    // Check for common issues
    if path.is_dir() {
        validate_dir_recursive(path)?;
    }
    
    Ok(())
}

/// Recursively validate a directory.
fn validate_dir_recursive(dir: &Path) -> Result<(), BuildError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        
        // Check for broken symlinks
        if path.is_symlink() {
            let target = fs::read_link(&path)?;
            if target.is_absolute() && !target.starts_with("/kiln/store") {
                return Err(BuildError::BuildFailed(format!(
                    "output contains absolute symlink outside store: {} -> {}",
                    path.display(),
                    target.display()
                )));
            }
        }
        
        if path.is_dir() {
            validate_dir_recursive(&path)?;
        }
    }
    
    Ok(())
}

/// Calculate the size of an output.
pub fn output_size(path: &Path) -> Result<u64, BuildError> {
    let mut size = 0u64;
    
    if path.is_file() {
        size = fs::metadata(path)?.len();
    } else if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            size += output_size(&entry.path())?;
        }
    }
    
    Ok(size)
}

/// Format a size as a human-readable string.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    
    if bytes >= GB {
        format!("{:.2} GiB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MiB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KiB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Scan `path` for literal on-disk occurrences of any of `candidates`,
/// returning only those that actually appear: a store path is a reference
/// iff its display path shows up, as a byte substring, in some file's
/// contents or some symlink's target.
pub fn scan_references(path: &Path, candidates: &[StorePath], store: &Store) -> Result<Vec<StorePath>, BuildError> {
    let needles: Vec<(Vec<u8>, &StorePath)> = candidates
        .iter()
        .map(|c| (store.to_path(c).to_string_lossy().into_owned().into_bytes(), c))
        .collect();

    let mut found = HashSet::new();
    if path.is_dir() {
        scan_dir(path, &needles, &mut found)?;
    } else if path.is_file() {
        scan_file(path, &needles, &mut found)?;
    }

    Ok(candidates.iter().filter(|c| found.contains(&c.display_name())).cloned().collect())
}

fn scan_dir(dir: &Path, needles: &[(Vec<u8>, &StorePath)], found: &mut HashSet<String>) -> Result<(), BuildError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let entry_path = entry.path();

        if entry_path.is_symlink() {
            let target = fs::read_link(&entry_path)?;
            let target_bytes = target.to_string_lossy().into_owned().into_bytes();
            for (needle, sp) in needles {
                if contains_subslice(&target_bytes, needle) {
                    found.insert(sp.display_name());
                }
            }
        } else if entry_path.is_dir() {
            scan_dir(&entry_path, needles, found)?;
        } else if entry_path.is_file() {
            scan_file(&entry_path, needles, found)?;
        }
    }
    Ok(())
}

fn scan_file(file: &Path, needles: &[(Vec<u8>, &StorePath)], found: &mut HashSet<String>) -> Result<(), BuildError> {
    let data = fs::read(file)?;
    for (needle, sp) in needles {
        if contains_subslice(&data, needle) {
            found.insert(sp.display_name());
        }
    }
    Ok(())
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && needle.len() <= haystack.len() && haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(100), "100 B");
        assert_eq!(format_size(1024), "1.00 KiB");
        assert_eq!(format_size(1024 * 1024), "1.00 MiB");
        assert_eq!(format_size(1024 * 1024 * 1024), "1.00 GiB");
    }

    #[test]
    fn test_output_size() {
        use std::env;
        
        let dir = env::temp_dir().join(format!("kiln-output-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("test.txt"), b"hello world").unwrap();
        
        let size = output_size(&dir).unwrap();
        assert_eq!(size, 11); // "hello world" is 11 bytes
        
        // Cleanup
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_scan_references_finds_only_contained_paths() {
        use kiln_derive::Hash;
        use std::env;

        let store_dir = env::temp_dir().join(format!("kiln-scan-store-{}", std::process::id()));
        let out_dir = env::temp_dir().join(format!("kiln-scan-out-{}", std::process::id()));
        fs::create_dir_all(&store_dir).unwrap();
        fs::create_dir_all(&out_dir).unwrap();

        let store = Store::open_at(store_dir.clone()).unwrap();
        let referenced = StorePath::new(Hash::of_str("referenced"), "referenced-1.0".to_string());
        let unreferenced = StorePath::new(Hash::of_str("unreferenced"), "unreferenced-1.0".to_string());

        let content = format!("#!/bin/sh\nexec {}/bin/tool\n", store.to_path(&referenced).display());
        fs::write(out_dir.join("script.sh"), content).unwrap();

        let found = scan_references(&out_dir, &[referenced.clone(), unreferenced.clone()], &store).unwrap();
        assert_eq!(found, vec![referenced]);

        let _ = fs::remove_dir_all(&store_dir);
        let _ = fs::remove_dir_all(&out_dir);
    }
}
