use std::path::{Component, Path};

use crate::TransferError;

/// Longest accepted declared file name, in bytes.
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Longest stem kept by [`sanitize_file_name`].
const MAX_SANITIZED_STEM: usize = 64;

/// Validates a declared file name.
///
/// The name must be a single path component: no separators, no `..`, no
/// root or drive prefix.
pub fn validate_file_name(name: &str) -> Result<(), TransferError> {
    if name.trim().is_empty() {
        return Err(TransferError::InvalidFileName("empty file name".into()));
    }
    if name.len() > MAX_FILE_NAME_LEN {
        return Err(TransferError::InvalidFileName(format!(
            "file name longer than {MAX_FILE_NAME_LEN} bytes"
        )));
    }
    if name.contains('\0') {
        return Err(TransferError::InvalidFileName("file name contains NUL".into()));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        (Some(Component::ParentDir), _) | (Some(Component::CurDir), None) => {
            return Err(TransferError::InvalidFileName(format!(
                "relative directory reference not allowed: {name}"
            )));
        }
        (Some(Component::RootDir | Component::Prefix(_)), _) => {
            return Err(TransferError::InvalidFileName(format!(
                "absolute path not allowed: {name}"
            )));
        }
        _ => {
            return Err(TransferError::InvalidFileName(format!(
                "file name must not contain a path: {name}"
            )));
        }
    }

    // `Path` only splits on `/` on Unix and drops a trailing one.
    if name.contains(['/', '\\']) {
        return Err(TransferError::InvalidFileName(format!(
            "file name must not contain a path: {name}"
        )));
    }

    Ok(())
}

/// Splits `name` into stem and lowercase extension.
///
/// A leading dot does not start an extension (`.bashrc` has none).
pub fn split_extension(name: &str) -> (&str, Option<String>) {
    match name.rfind('.') {
        Some(pos) if pos > 0 && pos + 1 < name.len() => {
            (&name[..pos], Some(name[pos + 1..].to_ascii_lowercase()))
        }
        _ => (name, None),
    }
}

/// Reduces a name to `[A-Za-z0-9._-]`, replacing everything else with `_`.
///
/// The result is never empty and never longer than 64 bytes.
pub fn sanitize_file_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_SANITIZED_STEM)
        .collect();

    // Leading dots would make hidden files.
    while out.starts_with('.') {
        out.remove(0);
    }
    if out.is_empty() {
        out.push_str("file");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert!(validate_file_name("video.mp4").is_ok());
        assert!(validate_file_name("my report (final).pdf").is_ok());
        assert!(validate_file_name(".bashrc").is_ok());
    }

    #[test]
    fn rejects_empty_name() {
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("   ").is_err());
    }

    #[test]
    fn rejects_traversal() {
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name("../etc/passwd").is_err());
        assert!(validate_file_name(".").is_err());
    }

    #[test]
    fn rejects_paths() {
        assert!(validate_file_name("/etc/passwd").is_err());
        assert!(validate_file_name("sub/file.txt").is_err());
        assert!(validate_file_name("sub\\file.txt").is_err());
    }

    #[test]
    fn rejects_overlong_name() {
        let name = format!("{}.txt", "a".repeat(MAX_FILE_NAME_LEN));
        assert!(validate_file_name(&name).is_err());
    }

    #[test]
    fn split_extension_cases() {
        assert_eq!(split_extension("video.MP4"), ("video", Some("mp4".into())));
        assert_eq!(split_extension("archive.tar.gz"), ("archive.tar", Some("gz".into())));
        assert_eq!(split_extension("README"), ("README", None));
        assert_eq!(split_extension(".bashrc"), (".bashrc", None));
        assert_eq!(split_extension("trailing."), ("trailing.", None));
    }

    #[test]
    fn sanitize_replaces_unsafe_chars() {
        assert_eq!(sanitize_file_name("my report (final)"), "my_report__final_");
        assert_eq!(sanitize_file_name("ünïcode"), "_n_code");
        assert_eq!(sanitize_file_name("ok-name_1.2"), "ok-name_1.2");
    }

    #[test]
    fn sanitize_never_empty_or_hidden() {
        assert_eq!(sanitize_file_name(""), "file");
        assert_eq!(sanitize_file_name("..."), "file");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
    }

    #[test]
    fn sanitize_truncates() {
        assert_eq!(sanitize_file_name(&"x".repeat(200)).len(), 64);
    }
}
