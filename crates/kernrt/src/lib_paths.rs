use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use kernrt_contracts::{CACHE_MARKER, LIBRARY_PREFIX, LIBRARY_SUBDIR, LIBRARY_SUFFIX};

pub fn library_file_name(res_name: &str) -> String {
    format!("{LIBRARY_PREFIX}{res_name}{LIBRARY_SUFFIX}")
}

/// Application-private location of the prebuilt library for `res_name`.
///
/// The application root is the cache location cut at the last occurrence of
/// `cache`; a cache location without that marker is used whole.
pub fn primary_library_path(cache_dir: &Path, res_name: &str) -> PathBuf {
    let raw = cache_dir.as_os_str().as_bytes();
    let marker = CACHE_MARKER.as_bytes();
    let app_root = match rfind_bytes(raw, marker) {
        Some(pos) => PathBuf::from(OsStr::from_bytes(&raw[..pos])),
        None => {
            tracing::error!(
                cache_dir = %cache_dir.display(),
                "found peculiar cache dir (missing {CACHE_MARKER:?})"
            );
            cache_dir.to_path_buf()
        }
    };
    app_root.join(LIBRARY_SUBDIR).join(library_file_name(res_name))
}

pub fn system_library_path(system_lib_dir: &Path, res_name: &str) -> PathBuf {
    system_lib_dir.join(library_file_name(res_name))
}

/// Candidate paths in lookup order: application-private first, then the
/// system location.
pub fn prebuilt_library_candidates(
    cache_dir: &Path,
    res_name: &str,
    system_lib_dir: &Path,
) -> Vec<PathBuf> {
    vec![
        primary_library_path(cache_dir, res_name),
        system_library_path(system_lib_dir, res_name),
    ]
}

pub fn describe_checked(checked: &[PathBuf]) -> String {
    checked
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn rfind_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_path_cuts_at_last_cache_marker() {
        let p = primary_library_path(Path::new("/data/data/com.example/cache"), "blur");
        assert_eq!(p, PathBuf::from("/data/data/com.example/lib/librs.blur.so"));

        let p = primary_library_path(Path::new("/srv/cache/app/cache/scripts"), "blur");
        assert_eq!(p, PathBuf::from("/srv/cache/app/lib/librs.blur.so"));
    }

    #[test]
    fn primary_path_without_marker_uses_whole_dir() {
        let p = primary_library_path(Path::new("/opt/app"), "mono");
        assert_eq!(p, PathBuf::from("/opt/app/lib/librs.mono.so"));
    }

    #[test]
    fn candidates_fall_back_to_system_dir() {
        let c = prebuilt_library_candidates(Path::new("/a/cache"), "x", Path::new("/system/lib"));
        assert_eq!(
            c,
            vec![
                PathBuf::from("/a/lib/librs.x.so"),
                PathBuf::from("/system/lib/librs.x.so"),
            ]
        );
        assert!(describe_checked(&c).contains("  - /system/lib/librs.x.so"));
    }
}
