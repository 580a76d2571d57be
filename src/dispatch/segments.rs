//! Splits a loosely delimited request payload into typed segments.
//!
//! Callers hand over whatever string the upstream application assembled:
//! comma separated screenshot paths mixed with free text, `audio file:` labels,
//! `audio1:<path>|audio2:<path>` ensembles or bare Windows paths embedded in
//! node output. Every media path in the result points at an existing file.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::dispatch::classify::ModalityTag;
use crate::error::ParseError;

pub const IMAGE_EXTENSIONS: [&str; 7] = [".jpg", ".jpeg", ".png", ".bmp", ".gif", ".tiff", ".webp"];
pub const AUDIO_EXTENSIONS: [&str; 6] = [".wav", ".mp3", ".m4a", ".flac", ".ogg", ".aac"];

const ENSEMBLE_DELIMITERS: [char; 4] = ['|', ';', '&', ','];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    ImagePath(PathBuf),
    AudioPath(PathBuf),
    TextFragment(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedInput {
    segments: Vec<Segment>,
    examined: usize,
}

impl ParsedInput {
    fn push(&mut self, segment: Segment) {
        if !self.segments.contains(&segment) {
            self.segments.push(segment);
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of candidate parts that were inspected
    pub fn examined(&self) -> usize {
        self.examined
    }

    pub fn image_paths(&self) -> Vec<&Path> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::ImagePath(p) => Some(p.as_path()),
                _ => None,
            })
            .collect()
    }

    pub fn audio_paths(&self) -> Vec<&Path> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::AudioPath(p) => Some(p.as_path()),
                _ => None,
            })
            .collect()
    }

    pub fn text_fragments(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::TextFragment(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    /// All text fragments joined by newlines
    pub fn text(&self) -> String {
        self.text_fragments().join("\n")
    }

    pub fn has_media(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::ImagePath(_) | Segment::AudioPath(_)))
    }

    /// Serializes the segments back into a comma delimited payload.
    pub fn reconstructed(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::ImagePath(p) | Segment::AudioPath(p) => p.to_string_lossy().into_owned(),
                Segment::TextFragment(t) => t.clone(),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Image,
    Audio,
}

impl MediaKind {
    fn extensions(&self) -> &'static [&'static str] {
        match self {
            MediaKind::Image => &IMAGE_EXTENSIONS,
            MediaKind::Audio => &AUDIO_EXTENSIONS,
        }
    }

    fn file_label(&self) -> &'static str {
        match self {
            MediaKind::Image => "image file:",
            MediaKind::Audio => "audio file:",
        }
    }

    fn sequence_label(&self) -> &'static str {
        match self {
            MediaKind::Image => "img",
            MediaKind::Audio => "audio",
        }
    }

    fn segment(&self, path: PathBuf) -> Segment {
        match self {
            MediaKind::Image => Segment::ImagePath(path),
            MediaKind::Audio => Segment::AudioPath(path),
        }
    }
}

/// Parses `raw` into the segments relevant for `modality`.
///
/// Speech recognition and captioning accept the labeled and ensemble forms,
/// vision-language input is comma delimited, and every other modality treats
/// the whole payload as one text fragment.
pub fn parse(raw: &str, modality: ModalityTag) -> Result<ParsedInput, ParseError> {
    let parsed = match modality {
        ModalityTag::AutomaticSpeechRecognition => parse_labeled(raw, MediaKind::Audio),
        ModalityTag::ImageToText => parse_labeled(raw, MediaKind::Image),
        ModalityTag::VisionLanguage => parse_delimited(raw, modality),
        _ => {
            let mut parsed = ParsedInput {
                examined: 1,
                ..Default::default()
            };
            let text = raw.trim();
            if !text.is_empty() {
                parsed.push(Segment::TextFragment(text.to_string()));
            }
            parsed
        }
    };

    if modality.requires_media() && !parsed.has_media() {
        return Err(ParseError::NoValidMediaFound {
            modality,
            examined: parsed.examined,
        });
    }
    Ok(parsed)
}

/// Comma delimited parsing: image paths, audio paths and free text.
/// Audio parts are skipped for vision-language requests.
pub fn parse_delimited(raw: &str, modality: ModalityTag) -> ParsedInput {
    let parts: Vec<&str> = raw.split(',').collect();
    let mut parsed = ParsedInput {
        examined: parts.len(),
        ..Default::default()
    };

    for part in parts {
        let part = part.trim();

        if is_media_candidate(part, MediaKind::Image) {
            let candidates: Vec<&str> = if part.contains(';') {
                part.split(';').map(str::trim).filter(|c| !c.is_empty()).collect()
            } else {
                vec![part]
            };
            for candidate in candidates {
                if !ends_with_extension(candidate, MediaKind::Image) {
                    if !looks_absolute(candidate) {
                        parsed.push(Segment::TextFragment(candidate.to_string()));
                    }
                    continue;
                }
                match locate_file(candidate) {
                    Some(path) => parsed.push(Segment::ImagePath(path)),
                    None => debug!("Image candidate {candidate} does not exist, dropping it"),
                }
            }
            continue;
        }

        if mentions_extension(part, MediaKind::Audio) {
            if modality == ModalityTag::VisionLanguage {
                debug!("Skipping audio part {part} for vision-language input");
                continue;
            }
            match locate_file(part) {
                Some(path) => parsed.push(Segment::AudioPath(path)),
                None => debug!("Audio candidate {part} does not exist, dropping it"),
            }
            continue;
        }

        if !part.is_empty() && !looks_absolute(part) {
            parsed.push(Segment::TextFragment(part.to_string()));
        }
    }

    parsed
}

fn parse_labeled(raw: &str, kind: MediaKind) -> ParsedInput {
    let candidates = labeled_candidates(raw, kind);
    let mut parsed = ParsedInput {
        examined: candidates.len(),
        ..Default::default()
    };

    for candidate in candidates {
        let resolved = locate_file(&candidate).or_else(|| match kind {
            MediaKind::Audio => substitute_segment(Path::new(&candidate)),
            MediaKind::Image => None,
        });
        match resolved {
            Some(path) => parsed.push(kind.segment(path)),
            None => debug!("Candidate {candidate} does not exist, dropping it"),
        }
    }

    parsed
}

fn labeled_candidates(raw: &str, kind: MediaKind) -> Vec<String> {
    if let Some(start) = raw.find(kind.file_label()) {
        let rest = &raw[start + kind.file_label().len()..];
        let value = match rest.find(kind.file_label()) {
            Some(end) => &rest[..end],
            None => rest,
        };
        return vec![value.trim().to_string()];
    }

    let trimmed = raw.trim();
    if !mentions_extension(raw, kind) {
        return Vec::new();
    }

    if raw.contains(ENSEMBLE_DELIMITERS) {
        // the first ensemble form that matches anything wins
        let sequenced = sequence_matches(raw, kind.sequence_label());
        let found = if sequenced.is_empty() {
            delimited_matches(raw, kind)
        } else {
            sequenced
        };
        let existing: Vec<String> = found
            .into_iter()
            .filter(|c| Path::new(c).exists())
            .collect();
        if !existing.is_empty() {
            return existing;
        }
    }

    let drive_paths: Vec<String> = drive_letter_matches(raw, kind)
        .into_iter()
        .filter(|c| Path::new(c).exists())
        .collect();
    if !drive_paths.is_empty() {
        return drive_paths;
    }

    if ends_with_extension(trimmed, kind) {
        vec![trimmed.to_string()]
    } else {
        Vec::new()
    }
}

/// `audio1:<path>|audio2:<path>` style labels, matched case-insensitively
fn sequence_matches(raw: &str, label: &str) -> Vec<String> {
    let lower = raw.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let mut found = Vec::new();
    let mut from = 0;

    while let Some(offset) = lower[from..].find(label) {
        let start = from + offset;
        let mut cursor = start + label.len();
        let digits_start = cursor;
        while cursor < bytes.len() && bytes[cursor].is_ascii_digit() {
            cursor += 1;
        }
        if cursor == digits_start || cursor >= bytes.len() || bytes[cursor] != b':' {
            from = start + label.len();
            continue;
        }

        let value_start = cursor + 1;
        let value_end = raw[value_start..]
            .find(ENSEMBLE_DELIMITERS)
            .map_or(raw.len(), |end| value_start + end);
        let value = raw[value_start..value_end].trim();
        if !value.is_empty() {
            found.push(value.to_string());
        }
        from = value_end;
    }

    found
}

/// Delimiter separated chunks, each cut after its last media extension
fn delimited_matches(raw: &str, kind: MediaKind) -> Vec<String> {
    raw.split(ENSEMBLE_DELIMITERS)
        .filter_map(|chunk| last_extension_end(chunk, kind).map(|end| chunk[..end].trim()))
        .filter(|path| !path.is_empty())
        .map(str::to_string)
        .collect()
}

/// Windows drive paths (`C:\dir\file.wav`) embedded anywhere in the payload,
/// for example after a `[Node Name]:` prefix.
fn drive_letter_matches(raw: &str, kind: MediaKind) -> Vec<String> {
    let bytes = raw.as_bytes();
    let mut found = Vec::new();
    let mut index = 0;

    while index + 1 < bytes.len() {
        if !(bytes[index].is_ascii_alphabetic() && bytes[index + 1] == b':') {
            index += 1;
            continue;
        }
        let body_start = index + 2;
        let body_end = raw[body_start..]
            .find([':', '[', ']'])
            .map_or(raw.len(), |end| body_start + end);
        match last_extension_end(&raw[body_start..body_end], kind) {
            Some(end) if end > 0 => {
                let path_end = body_start + end;
                found.push(raw[index..path_end].trim().to_string());
                index = path_end;
            }
            _ => index += 1,
        }
    }

    found
}

fn last_extension_end(text: &str, kind: MediaKind) -> Option<usize> {
    let lower = text.to_ascii_lowercase();
    kind.extensions()
        .iter()
        .filter_map(|ext| lower.rfind(ext).map(|pos| pos + ext.len()))
        .max()
}

fn is_media_candidate(part: &str, kind: MediaKind) -> bool {
    ends_with_extension(part, kind) || mentions_extension(part, kind)
}

fn ends_with_extension(text: &str, kind: MediaKind) -> bool {
    let lower = text.to_ascii_lowercase();
    kind.extensions().iter().any(|ext| lower.ends_with(ext))
}

fn mentions_extension(text: &str, kind: MediaKind) -> bool {
    let lower = text.to_ascii_lowercase();
    kind.extensions().iter().any(|ext| lower.contains(ext))
}

/// Absolute on this platform, or a Windows drive / UNC path on any platform
pub fn looks_absolute(text: &str) -> bool {
    let bytes = text.as_bytes();
    Path::new(text).is_absolute()
        || text.starts_with("\\\\")
        || (bytes.len() >= 3
            && bytes[0].is_ascii_alphabetic()
            && bytes[1] == b':'
            && (bytes[2] == b'\\' || bytes[2] == b'/'))
}

/// Tries the candidate verbatim, then with its separators swapped and in
/// canonical component form.
fn locate_file(candidate: &str) -> Option<PathBuf> {
    path_variants(candidate)
        .into_iter()
        .find(|path| path.is_file())
}

fn path_variants(candidate: &str) -> Vec<PathBuf> {
    let canonical: PathBuf = Path::new(candidate).components().collect();
    let mut variants: Vec<PathBuf> = Vec::with_capacity(4);
    for variant in [
        PathBuf::from(candidate),
        PathBuf::from(candidate.replace('/', "\\")),
        PathBuf::from(candidate.replace('\\', "/")),
        canonical,
    ] {
        if !variant.as_os_str().is_empty() && !variants.contains(&variant) {
            variants.push(variant);
        }
    }
    variants
}

/// Upstream recorders sometimes hand over the path of a not yet written
/// `Segment_*` chunk; the full recording in the same directory is used instead.
fn substitute_segment(candidate: &Path) -> Option<PathBuf> {
    let name = candidate.file_name()?.to_str()?;
    if !name.contains("Segment_") {
        return None;
    }
    let dir = candidate.parent()?;
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    entries.sort();

    for ext in AUDIO_EXTENSIONS {
        let replacement = entries.iter().find(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| {
                    n.to_ascii_lowercase().ends_with(ext) && !n.starts_with("Segment_")
                })
        });
        if let Some(path) = replacement {
            warn!(
                "Segment {} is missing, using {} instead",
                candidate.display(),
                path.display()
            );
            return Some(path.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use tempfile::TempDir;

    use super::*;

    fn touch(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        File::create(&path).unwrap();
        path
    }

    #[test]
    fn dedups_images_in_order() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.png");
        let b = touch(&dir, "b.jpg");
        let raw = format!("{},{},{}", a.display(), a.display(), b.display());

        let parsed = parse(&raw, ModalityTag::VisionLanguage).unwrap();
        assert_eq!(parsed.image_paths(), vec![a.as_path(), b.as_path()]);
        assert_eq!(parsed.examined(), 3);
    }

    #[test]
    fn image_and_text_fragment() {
        let dir = TempDir::new().unwrap();
        let screen = touch(&dir, "screen.png");
        let raw = format!("{},Text: click button", screen.display());

        let parsed = parse(&raw, ModalityTag::VisionLanguage).unwrap();
        assert_eq!(
            parsed.segments(),
            &[
                Segment::ImagePath(screen.clone()),
                Segment::TextFragment("Text: click button".into())
            ]
        );
        assert_eq!(parsed.text(), "Text: click button");
    }

    #[test]
    fn semicolon_separated_images() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.png");
        let b = touch(&dir, "b.webp");
        let raw = format!("{};{}, describe", a.display(), b.display());

        let parsed = parse(&raw, ModalityTag::VisionLanguage).unwrap();
        assert_eq!(parsed.image_paths(), vec![a.as_path(), b.as_path()]);
        assert_eq!(parsed.text(), "describe");
    }

    #[test]
    fn backslash_paths_are_normalized() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("img")).unwrap();
        let screen = dir.path().join("img").join("screen.png");
        File::create(&screen).unwrap();
        let raw = screen.to_string_lossy().replace('/', "\\");

        let parsed = parse(&raw, ModalityTag::VisionLanguage).unwrap();
        assert_eq!(parsed.image_paths().len(), 1);
    }

    #[test]
    fn audio_is_skipped_for_vision_language() {
        let dir = TempDir::new().unwrap();
        let img = touch(&dir, "frame.jpg");
        let wav = touch(&dir, "voice.wav");
        let raw = format!("{},{}", img.display(), wav.display());

        let parsed = parse(&raw, ModalityTag::VisionLanguage).unwrap();
        assert!(parsed.audio_paths().is_empty());

        let generic = parse_delimited(&raw, ModalityTag::TextGeneration);
        assert_eq!(generic.audio_paths(), vec![wav.as_path()]);
    }

    #[test]
    fn missing_images_fail_with_examined_count() {
        let err = parse("/nope/a.png,/nope/b.png,hello", ModalityTag::VisionLanguage).unwrap_err();
        match err {
            ParseError::NoValidMediaFound { modality, examined } => {
                assert_eq!(modality, ModalityTag::VisionLanguage);
                assert_eq!(examined, 3);
            }
        }
    }

    #[test]
    fn absolute_paths_are_not_text() {
        let parsed = parse_delimited("C:\\Users\\me\\notes,hello", ModalityTag::TextGeneration);
        assert_eq!(parsed.text(), "hello");
        assert!(looks_absolute("/usr/share"));
        assert!(looks_absolute("D:/data"));
        assert!(!looks_absolute("Text: click"));
    }

    #[test]
    fn audio_file_label() {
        let dir = TempDir::new().unwrap();
        let wav = touch(&dir, "take.wav");
        let raw = format!("Transcribe this audio file: {}", wav.display());

        let parsed = parse(&raw, ModalityTag::AutomaticSpeechRecognition).unwrap();
        assert_eq!(parsed.audio_paths(), vec![wav.as_path()]);
    }

    #[test]
    fn audio_ensemble_sequence() {
        let dir = TempDir::new().unwrap();
        let one = touch(&dir, "one.wav");
        let two = touch(&dir, "two.mp3");
        let raw = format!("audio1:{}|AUDIO2:{}", one.display(), two.display());

        let parsed = parse(&raw, ModalityTag::AutomaticSpeechRecognition).unwrap();
        assert_eq!(parsed.audio_paths(), vec![one.as_path(), two.as_path()]);
    }

    #[test]
    fn audio_delimited_paths() {
        let dir = TempDir::new().unwrap();
        let one = touch(&dir, "one.flac");
        let two = touch(&dir, "two.ogg");
        let raw = format!("{} & {}; /missing/three.wav", one.display(), two.display());

        let parsed = parse(&raw, ModalityTag::AutomaticSpeechRecognition).unwrap();
        assert_eq!(parsed.audio_paths(), vec![one.as_path(), two.as_path()]);
    }

    #[test]
    fn single_audio_path() {
        let dir = TempDir::new().unwrap();
        let wav = touch(&dir, "clip.wav");

        let parsed = parse(&wav.to_string_lossy(), ModalityTag::AutomaticSpeechRecognition).unwrap();
        assert_eq!(parsed.audio_paths(), vec![wav.as_path()]);
    }

    #[test]
    fn missing_segment_uses_sibling_recording() {
        let dir = TempDir::new().unwrap();
        let full = touch(&dir, "Recording_1.wav");
        touch(&dir, "Segment_0.wav.partial");
        let raw = format!("audio file: {}", dir.path().join("Segment_3.wav").display());

        let parsed = parse(&raw, ModalityTag::AutomaticSpeechRecognition).unwrap();
        assert_eq!(parsed.audio_paths(), vec![full.as_path()]);
    }

    #[test]
    fn no_audio_found() {
        let err = parse("just words", ModalityTag::AutomaticSpeechRecognition).unwrap_err();
        assert!(err.to_string().starts_with("No valid audio file paths found"));
    }

    #[test]
    fn drive_letter_scan() {
        let found = drive_letter_matches(
            "[Mic Node]: C:\\rec\\a.wav, [Other]: D:\\rec\\b.mp3 trailing",
            MediaKind::Audio,
        );
        assert_eq!(found, vec!["C:\\rec\\a.wav", "D:\\rec\\b.mp3"]);
    }

    #[test]
    fn image_label_for_captioning() {
        let dir = TempDir::new().unwrap();
        let img = touch(&dir, "cat.jpeg");
        let raw = format!("image file: {}", img.display());

        let parsed = parse(&raw, ModalityTag::ImageToText).unwrap();
        assert_eq!(parsed.image_paths(), vec![img.as_path()]);
    }

    #[test]
    fn text_modalities_keep_the_whole_payload() {
        let parsed = parse("  Hello, world  ", ModalityTag::TextGeneration).unwrap();
        assert_eq!(parsed.text(), "Hello, world");
    }

    #[test]
    fn reparsing_reconstruction_is_stable() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.png");
        let b = touch(&dir, "b.png");
        let raw = format!("{}, {}", a.display(), b.display());

        let first = parse(&raw, ModalityTag::VisionLanguage).unwrap();
        let second = parse(&first.reconstructed(), ModalityTag::VisionLanguage).unwrap();
        assert_eq!(first.segments(), second.segments());
    }
}
