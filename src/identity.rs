#![forbid(unsafe_code)]

//! Deterministic output naming.
//!
//! The output filename is a pure function of the resolved content identity,
//! the sanitized title, the requested format, and (for video) the quality
//! tier. That determinism is what makes the downloads directory a cache:
//! identical requests always target the same path.

use crate::media::MediaFormat;

const MAX_TITLE_LEN: usize = 60;
const FALLBACK_TITLE: &str = "media";

/// Identity of the source media as resolved from extractor metadata.
#[derive(Clone, Debug)]
pub struct MediaIdentity {
    pub content_id: String,
    /// Already sanitized; safe to embed in a filename.
    pub title: String,
}

impl MediaIdentity {
    pub fn new(content_id: impl Into<String>, raw_title: &str) -> Self {
        Self {
            content_id: content_id.into(),
            title: sanitize_title(raw_title),
        }
    }
}

/// Strips every character outside the allow-list (letters in any script,
/// ASCII digits, space, underscore, hyphen), replaces spaces with
/// underscores, and bounds the result to 60 characters. Empty results fall
/// back to a fixed placeholder so filenames never collapse to the bare id.
pub fn sanitize_title(raw: &str) -> String {
    let kept: String = raw
        .chars()
        .filter(|c| c.is_alphabetic() || c.is_ascii_digit() || matches!(c, ' ' | '_' | '-'))
        .collect();
    let compact: String = kept.trim().replace(' ', "_").chars().take(MAX_TITLE_LEN).collect();
    if compact.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        compact
    }
}

/// Builds the canonical output filename for a request.
///
/// The quality tier only participates for video: audio is always transcoded
/// towards mp3 and photos towards jpg, so their names carry no tier.
pub fn output_filename(format: MediaFormat, identity: &MediaIdentity, quality: &str) -> String {
    match format {
        MediaFormat::Audio => format!("audio_{}_{}.mp3", identity.content_id, identity.title),
        MediaFormat::Photo => format!("photo_{}_{}.jpg", identity.content_id, identity.title),
        MediaFormat::Video => format!(
            "video_{}_{}_{}.mp4",
            identity.content_id, identity.title, quality
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_disallowed_characters() {
        assert_eq!(sanitize_title("Song <Title>!!"), "Song_Title");
    }

    #[test]
    fn sanitize_keeps_non_latin_letters() {
        assert_eq!(sanitize_title("Привет мир 123"), "Привет_мир_123");
    }

    #[test]
    fn sanitize_bounds_length() {
        let long = "a".repeat(400);
        assert_eq!(sanitize_title(&long).chars().count(), 60);
    }

    #[test]
    fn sanitize_empty_falls_back() {
        assert_eq!(sanitize_title("<<<>>>"), "media");
        assert_eq!(sanitize_title(""), "media");
    }

    #[test]
    fn filenames_follow_format_patterns() {
        let identity = MediaIdentity::new("abc123", "Test Video");
        assert_eq!(
            output_filename(MediaFormat::Video, &identity, "720"),
            "video_abc123_Test_Video_720.mp4"
        );
        assert_eq!(
            output_filename(MediaFormat::Audio, &identity, "720"),
            "audio_abc123_Test_Video.mp3"
        );
        assert_eq!(
            output_filename(MediaFormat::Photo, &identity, "720"),
            "photo_abc123_Test_Video.jpg"
        );
    }

    #[test]
    fn filenames_are_deterministic() {
        let a = MediaIdentity::new("xyz", "Some Clip!");
        let b = MediaIdentity::new("xyz", "Some Clip!");
        assert_eq!(
            output_filename(MediaFormat::Video, &a, "480"),
            output_filename(MediaFormat::Video, &b, "480")
        );
    }
}
