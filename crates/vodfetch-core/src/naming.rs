//! Destination file naming
//!
//! The extension is decided before the first byte is written: from the URL
//! path when it names a video container, from the content type otherwise.

use std::path::{Path, PathBuf};
use vodfetch_types::{EntryKind, PlaylistEntry};

const DEFAULT_EXTENSION: &str = "mp4";

/// Container extensions accepted from a URL path
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "ts", "avi", "mov", "m4v", "webm", "flv", "wmv"];

/// Remove characters that are invalid in file names
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Video extension from the last path segment of a URL.
///
/// Portal endpoints such as `movie.php` carry no usable extension.
fn extension_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.last()?.to_string();
    let decoded = urlencoding::decode(&segment)
        .map(|s| s.into_owned())
        .unwrap_or(segment);
    let (_, ext) = decoded.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    VIDEO_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// Extension for a media content type
fn extension_from_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    let ext = match mime.as_str() {
        "video/mp4" => "mp4",
        "video/x-matroska" | "video/matroska" => "mkv",
        "video/mp2t" | "video/vnd.dlna.mpeg-tts" => "ts",
        "video/x-msvideo" | "video/avi" => "avi",
        "video/quicktime" => "mov",
        "video/x-m4v" => "m4v",
        "video/webm" => "webm",
        "video/x-flv" => "flv",
        "video/x-ms-wmv" => "wmv",
        _ => return None,
    };
    Some(ext)
}

/// Pick the extension for a download
pub fn extension_for(url: &str, content_type: Option<&str>) -> String {
    extension_from_url(url)
        .or_else(|| content_type.and_then(extension_from_content_type).map(str::to_string))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

/// Destination with the resolved extension appended unless already present
pub fn resolve_destination(dest: &Path, url: &str, content_type: Option<&str>) -> PathBuf {
    let ext = extension_for(url, content_type);
    let has_ext = dest
        .extension()
        .map(|e| e.to_string_lossy().eq_ignore_ascii_case(&ext))
        .unwrap_or(false);
    if has_ext {
        return dest.to_path_buf();
    }

    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "download".into());
    name.push(".");
    name.push(&ext);
    dest.with_file_name(name)
}

/// `dest` for `n == 0`, otherwise `Name_n.ext` beside it
pub fn numbered_destination(dest: &Path, n: u32) -> PathBuf {
    if n == 0 {
        return dest.to_path_buf();
    }
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let name = match dest.extension() {
        Some(ext) => format!("{}_{}.{}", stem, n, ext.to_string_lossy()),
        None => format!("{}_{}", stem, n),
    };
    dest.with_file_name(name)
}

/// Destination for a playlist entry under the output directory.
///
/// The entry name is only a hint; an empty one falls back to the URL.
pub fn destination_for_entry(output_dir: &Path, entry: &PlaylistEntry) -> PathBuf {
    let folder = match entry.kind {
        EntryKind::Vod => "movies",
        EntryKind::Series => "series",
    };
    let mut stem = sanitize_filename(&entry.name);
    if stem.is_empty() {
        stem = url::Url::parse(&entry.source_url)
            .ok()
            .and_then(|u| u.path_segments().and_then(|s| s.last().map(str::to_string)))
            .and_then(|s| s.split('.').next().map(sanitize_filename))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "download".to_string());
    }
    output_dir.join(folder).join(stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_reserved_characters() {
        assert_eq!(sanitize_filename("  Movie: The \"Cut\"? \u{7} "), "Movie The Cut");
        assert_eq!(sanitize_filename("a/b\\c|d*e"), "abcde");
    }

    #[test]
    fn url_extension_wins_over_content_type() {
        assert_eq!(
            extension_for("http://h/movie/u/p/123.MKV?token=x", Some("video/mp4")),
            "mkv"
        );
    }

    #[test]
    fn content_type_used_when_url_has_no_extension() {
        assert_eq!(extension_for("http://h/play/123", Some("video/mp2t")), "ts");
        assert_eq!(extension_for("http://h/play/123", Some("application/octet-stream")), "mp4");
        assert_eq!(extension_for("http://h/play/123", None), "mp4");
    }

    #[test]
    fn script_endpoints_defer_to_content_type() {
        let url = "http://portal/play/movie.php?stream=12&type=movie";
        assert_eq!(extension_for(url, Some("video/x-matroska")), "mkv");
        assert_eq!(extension_for(url, None), "mp4");
        assert_eq!(
            resolve_destination(Path::new("/out/movies/Film"), url, Some("video/x-matroska")),
            PathBuf::from("/out/movies/Film.mkv")
        );
    }

    #[test]
    fn numbered_variants_keep_the_extension() {
        let dest = Path::new("/out/movies/Film.mkv");
        assert_eq!(numbered_destination(dest, 0), PathBuf::from("/out/movies/Film.mkv"));
        assert_eq!(numbered_destination(dest, 1), PathBuf::from("/out/movies/Film_1.mkv"));
        assert_eq!(
            numbered_destination(Path::new("/out/Show S01.E02.ts"), 2),
            PathBuf::from("/out/Show S01.E02_2.ts")
        );
    }

    #[test]
    fn percent_encoded_segments_are_decoded() {
        assert_eq!(extension_for("http://h/files/My%20Movie.avi", None), "avi");
    }

    #[test]
    fn resolve_keeps_matching_extension() {
        let dest = Path::new("/out/Film.mkv");
        assert_eq!(
            resolve_destination(dest, "http://h/1.mkv", None),
            PathBuf::from("/out/Film.mkv")
        );
    }

    #[test]
    fn resolve_appends_after_dotted_names() {
        let dest = Path::new("/out/Show S01.E02");
        assert_eq!(
            resolve_destination(dest, "http://h/series/7.mkv", None),
            PathBuf::from("/out/Show S01.E02.mkv")
        );
    }

    #[test]
    fn entry_destination_uses_kind_folder() {
        let entry = PlaylistEntry {
            name: "Episode: 1".into(),
            source_url: "http://h/series/u/p/55.mkv".into(),
            kind: EntryKind::Series,
        };
        assert_eq!(
            destination_for_entry(Path::new("/out"), &entry),
            PathBuf::from("/out/series/Episode 1")
        );
    }

    #[test]
    fn entry_without_name_falls_back_to_url() {
        let entry = PlaylistEntry {
            name: "???".into(),
            source_url: "http://h/movie/u/p/55.mkv".into(),
            kind: EntryKind::Vod,
        };
        assert_eq!(
            destination_for_entry(Path::new("/out"), &entry),
            PathBuf::from("/out/movies/55")
        );
    }
}
