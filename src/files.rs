//! Upload file-name rules: extension allow-list, sanitizing, directory scans.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

/// Extensions accepted by the HTTP upload endpoints.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "bmp", "tiff", "tif", "gif", "webp", "pdf",
];

/// Extensions picked up when a directory is scanned for batch input.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif", "gif", "webp"];

fn extension_of(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

/// True when the name carries one of [`ALLOWED_EXTENSIONS`].
pub fn allowed_file(filename: &str) -> bool {
    extension_of(filename)
        .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

pub fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_.-]").expect("static regex"))
}

/// Reduce a client-supplied name to a flat, ASCII-only file name.
///
/// Path separators become word breaks, whitespace runs collapse to `_`,
/// anything outside `[A-Za-z0-9_.-]` is dropped and leading/trailing dots and
/// underscores are stripped. May return an empty string.
pub fn sanitize_filename(name: &str) -> String {
    let flattened = name.replace(['/', '\\'], " ");
    let joined = flattened.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned = unsafe_chars().replace_all(&joined, "");
    cleaned.trim_matches(|c| c == '.' || c == '_').to_string()
}

/// Collect image files under `dir`, sorted by path.
pub fn find_image_files(dir: &Path, recursive: bool) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    collect_images(dir, recursive, &mut found)?;
    found.sort();
    Ok(found)
}

fn collect_images(dir: &Path, recursive: bool, found: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            if recursive {
                collect_images(&path, recursive, found)?;
            }
        } else if path.is_file() && is_image(&path) {
            found.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_file() {
        assert!(allowed_file("scan.png"));
        assert!(allowed_file("SCAN.JPEG"));
        assert!(allowed_file("report.pdf"));
        assert!(!allowed_file("notes.txt"));
        assert!(!allowed_file("png"));
        assert!(!allowed_file(""));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("my scan.png"), "my_scan.png");
        assert_eq!(sanitize_filename("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\pic.jpg"), "C_Users_me_pic.jpg");
        assert_eq!(sanitize_filename("fatura-ção.pdf"), "fatura-o.pdf");
        assert_eq!(sanitize_filename("..."), "");
    }

    #[test]
    fn test_find_image_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(dir.path().join("b.png"), b"x").unwrap();
        std::fs::write(dir.path().join("a.JPG"), b"x").unwrap();
        std::fs::write(dir.path().join("doc.pdf"), b"x").unwrap();
        std::fs::write(nested.join("c.tif"), b"x").unwrap();

        let flat = find_image_files(dir.path(), false).unwrap();
        assert_eq!(
            flat,
            vec![dir.path().join("a.JPG"), dir.path().join("b.png")]
        );

        let deep = find_image_files(dir.path(), true).unwrap();
        assert_eq!(deep.len(), 3);
        assert!(deep.contains(&nested.join("c.tif")));
    }
}
