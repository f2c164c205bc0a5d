use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};

/// Longest file name written to the download directory
pub const MAX_FILENAME_LENGTH: usize = 255;

const FALLBACK_NAME: &str = "unknown_file";

const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Reduce a peer-supplied name to a single safe path component.
///
/// Directory parts are stripped, control characters removed, Windows
/// device names and dot names replaced, and the result capped at
/// [`MAX_FILENAME_LENGTH`] bytes with the extension kept where possible.
pub fn sanitize_file_name(file_name: &str) -> String {
    let last = file_name.rsplit(['/', '\\']).next().unwrap_or_default();
    let mut clean: String = last.chars().filter(|c| !c.is_control()).collect();

    if clean.trim().is_empty()
        || clean == "."
        || clean == ".."
        || RESERVED_NAMES.iter().any(|r| clean.eq_ignore_ascii_case(r))
    {
        return FALLBACK_NAME.to_string();
    }

    if clean.len() > MAX_FILENAME_LENGTH {
        let ext_start = clean
            .rfind('.')
            .filter(|&idx| idx > 0 && clean.len() - idx < 20);
        match ext_start {
            Some(idx) => {
                let ext = clean[idx..].to_string();
                let cut = floor_char_boundary(&clean, MAX_FILENAME_LENGTH - ext.len());
                clean.truncate(cut);
                clean.push_str(&ext);
            }
            None => {
                let cut = floor_char_boundary(&clean, MAX_FILENAME_LENGTH);
                clean.truncate(cut);
            }
        }
    }
    clean
}

/// `dir/name`, or `dir/stem (n).ext` for the first `n` that does not exist yet
pub fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };
    (1..)
        .map(|n| dir.join(format!("{} ({}){}", stem, n, ext)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Create (truncating) a file readable only by the owner on Unix
pub async fn open_secure_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

/// Human-readable byte count
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("normal_file.txt"), "normal_file.txt");
        assert_eq!(sanitize_file_name("/absolute/path/to/file.txt"), "file.txt");
        assert_eq!(sanitize_file_name("C:\\Windows\\System32\\calc.exe"), "calc.exe");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("folder\\../file.txt"), "file.txt");
    }

    #[test]
    fn test_sanitize_dangerous_names() {
        for name in ["..", ".", "", "/", "\\", "   ", "CON", "con", "com1"] {
            assert_eq!(sanitize_file_name(name), FALLBACK_NAME, "input {:?}", name);
        }
        assert_eq!(sanitize_file_name("concert.txt"), "concert.txt");
        assert_eq!(sanitize_file_name("bad\u{0}\nname.txt"), "badname.txt");
    }

    #[test]
    fn test_sanitize_truncates_on_char_boundary() {
        let long = "🦀".repeat(100) + ".txt";
        let clean = sanitize_file_name(&long);
        assert!(clean.len() <= MAX_FILENAME_LENGTH);
        assert!(clean.ends_with("🦀.txt"));

        let no_ext = "a".repeat(300);
        assert_eq!(sanitize_file_name(&no_ext).len(), MAX_FILENAME_LENGTH);
    }

    #[test]
    fn test_unique_destination() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_destination(dir.path(), "a.txt"), dir.path().join("a.txt"));

        std::fs::write(dir.path().join("a.txt"), b"1").unwrap();
        std::fs::write(dir.path().join("a (1).txt"), b"2").unwrap();
        assert_eq!(
            unique_destination(dir.path(), "a.txt"),
            dir.path().join("a (2).txt")
        );
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(50), "50 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_secure_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.bin");
        open_secure_file(&path).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
