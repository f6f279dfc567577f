//! Attachment loading for `--attach` and `:attach`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use parley_core::transcript::Attachment;

/// Upper bound for one inline attachment.
const MAX_ATTACHMENT_BYTES: usize = 20 * 1024 * 1024;

/// Handles shell-escaped drag-and-drop paths and a leading `~/`.
pub fn normalize_input_path(path: &str) -> PathBuf {
    let unescaped = path
        .trim()
        .replace("\\ ", " ")
        .replace("\\(", "(")
        .replace("\\)", ")");

    if let Some(rest) = unescaped.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }

    PathBuf::from(unescaped)
}

/// MIME type inferred from the file extension.
pub fn mime_type_for_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension().and_then(|e| e.to_str())?;

    match ext.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "pdf" => Some("application/pdf"),
        "txt" | "md" => Some("text/plain"),
        _ => None,
    }
}

/// Reads `path` into an inline attachment.
///
/// # Errors
/// Returns an error for unreadable, oversized or unsupported files.
pub fn load(path: &str) -> Result<Arc<Attachment>> {
    let path = normalize_input_path(path);
    let Some(mime_type) = mime_type_for_extension(&path) else {
        bail!("Unsupported attachment type: {}", path.display());
    };
    let bytes =
        std::fs::read(&path).with_context(|| format!("read attachment {}", path.display()))?;
    if bytes.len() > MAX_ATTACHMENT_BYTES {
        bail!(
            "Attachment {} is larger than {} MiB",
            path.display(),
            MAX_ATTACHMENT_BYTES / (1024 * 1024)
        );
    }

    Ok(Arc::new(
        Attachment::from_bytes(mime_type, &bytes).with_preview(path.display().to_string()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_type_for_extension() {
        assert_eq!(mime_type_for_extension(Path::new("a.PNG")), Some("image/png"));
        assert_eq!(mime_type_for_extension(Path::new("b.jpeg")), Some("image/jpeg"));
        assert_eq!(mime_type_for_extension(Path::new("doc.pdf")), Some("application/pdf"));
        assert_eq!(mime_type_for_extension(Path::new("archive.zip")), None);
        assert_eq!(mime_type_for_extension(Path::new("noext")), None);
    }

    #[test]
    fn test_normalize_unescapes_spaces() {
        assert_eq!(
            normalize_input_path(r"My\ Shot\ \(1\).png"),
            PathBuf::from("My Shot (1).png")
        );
    }

    #[test]
    fn test_load_reads_image_as_base64() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pixel.png");
        std::fs::write(&file, [1u8, 2, 3]).unwrap();

        let attachment = load(file.to_str().unwrap()).unwrap();

        assert_eq!(attachment.mime_type, "image/png");
        assert_eq!(attachment.base64_data, "AQID");
        assert!(attachment.is_image());
    }

    #[test]
    fn test_load_rejects_unknown_types() {
        let err = load("notes.docx").unwrap_err();
        assert!(err.to_string().contains("Unsupported attachment type"));
    }
}
