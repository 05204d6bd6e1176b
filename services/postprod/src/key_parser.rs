//! Storage key parsing.
//!
//! Keys are split on `/`. The first segment names the media type, the second
//! the layout variant, and the variant decides which segment carries the
//! document identifier. A key that matches no layout of the pipeline yields a
//! record without identity; it is never an error.
//!
//! Layouts:
//!
//! ```text
//! audio     audio/full/<documentId>/<file>.<ext>
//! image     audio/preview/<documentId>/<file>.<ext>
//! finalize  output/full/hls/<id>/<name>.m3u8     -> documentId = <id>.json
//!           output/preview/<id>.mp4              -> documentId = <id>.json
//! ```
//!
//! Every staging and remote path is derived here, once.

use crate::blob_store::s3_locator;
use crate::record::{MediaIdentity, MediaRecord, PathRole, PipelineKind};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Derives media identifiers and paths from storage keys
#[derive(Debug, Clone)]
pub struct KeyParser {
    kind: PipelineKind,
    staging_root: PathBuf,
}

impl KeyParser {
    pub fn new(kind: PipelineKind, staging_root: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            staging_root: staging_root.into(),
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Build the record for one storage event, staged directly under the
    /// staging root
    pub fn parse(&self, bucket: &str, key: &str) -> MediaRecord {
        self.parse_in(&self.staging_root, bucket, key)
    }

    /// Build the record for one storage event, staged under `root`
    pub fn parse_in(&self, root: &Path, bucket: &str, key: &str) -> MediaRecord {
        let record = match self.kind {
            PipelineKind::Audio => self.parse_audio(root, bucket, key),
            PipelineKind::Image => self.parse_image(root, bucket, key),
            PipelineKind::Finalize => parse_finalize(bucket, key),
        };

        record.unwrap_or_else(|| {
            debug!(pipeline = %self.kind, bucket = %bucket, key = %key, "Key matches no known layout");
            MediaRecord::unrecognized(self.kind, bucket, key)
        })
    }

    fn parse_audio(&self, root: &Path, bucket: &str, key: &str) -> Option<MediaRecord> {
        let identity = split_media_key(key, "audio", "full")?;
        let document = &identity.document_id;
        let media_type = &identity.media_type;

        let preview_key = format!(
            "{}/preview/{}/{}.wav",
            media_type, document, identity.file_stem
        );

        let local_paths = BTreeMap::from([
            (
                PathRole::SourceDir,
                root.join(media_type).join(&identity.media_format).join(document),
            ),
            (PathRole::SourceFile, root.join(key)),
            (
                PathRole::OutputDir,
                root.join(media_type).join("preview").join(document),
            ),
            (PathRole::OutputFile, root.join(&preview_key)),
        ]);

        let remote_paths = BTreeMap::from([
            (PathRole::SourceLocator, s3_locator(bucket, key)),
            (PathRole::OutputLocator, s3_locator(bucket, &preview_key)),
            (PathRole::OutputKey, preview_key),
        ]);

        Some(MediaRecord::recognized(
            self.kind,
            bucket,
            key,
            identity,
            local_paths,
            remote_paths,
        ))
    }

    fn parse_image(&self, root: &Path, bucket: &str, key: &str) -> Option<MediaRecord> {
        let identity = split_media_key(key, "audio", "preview")?;
        let document = identity.document_id.clone();

        let source_dir = root.join("source").join(&document);
        let output_dir = root.join("output").join(&document);
        let output_key = format!("image/output/{}", document);
        let trigger_key = format!("video-trigger/{}", document);

        let local_paths = BTreeMap::from([
            (PathRole::ArticleFile, source_dir.join(&document)),
            (PathRole::TriggerFile, output_dir.join(&document)),
            (PathRole::SourceDir, source_dir),
            (PathRole::OutputDir, output_dir),
        ]);

        let remote_paths = BTreeMap::from([
            (PathRole::SourceLocator, s3_locator(bucket, key)),
            (PathRole::ArticleKey, format!("text/{}", document)),
            (PathRole::OutputLocator, s3_locator(bucket, &output_key)),
            (PathRole::OutputKey, output_key),
            (PathRole::TriggerLocator, s3_locator(bucket, &trigger_key)),
            (PathRole::TriggerKey, trigger_key),
        ]);

        Some(MediaRecord::recognized(
            self.kind,
            bucket,
            key,
            identity,
            local_paths,
            remote_paths,
        ))
    }
}

fn parse_finalize(bucket: &str, key: &str) -> Option<MediaRecord> {
    let segments: Vec<&str> = key.split('/').collect();
    if segments.first() != Some(&"output") {
        return None;
    }
    let media_format = *segments.get(1)?;

    let document_id = match media_format {
        // output/preview/<id>.mp4
        "preview" if segments.len() == 3 => {
            let id = segments[2].strip_suffix(".mp4")?;
            non_empty(id)?;
            format!("{}.json", id)
        }
        // output/full/hls/<id>/<name>.m3u8
        "full" if segments.len() >= 5 && segments[2] == "hls" => {
            non_empty(segments[3])?;
            format!("{}.json", segments[3])
        }
        _ => return None,
    };

    let file_name = segments.last()?.to_string();
    let (file_stem, extension) = split_extension(&file_name);

    let identity = MediaIdentity {
        document_id,
        media_type: "output".to_string(),
        media_format: media_format.to_string(),
        file_stem,
        extension,
        file_name,
    };

    let remote_paths = BTreeMap::from([(PathRole::SourceLocator, s3_locator(bucket, key))]);

    Some(MediaRecord::recognized(
        PipelineKind::Finalize,
        bucket,
        key,
        identity,
        BTreeMap::new(),
        remote_paths,
    ))
}

/// Split `<media_type>/<variant>/<documentId...>/<file>` keys
fn split_media_key(key: &str, media_type: &str, variant: &str) -> Option<MediaIdentity> {
    let segments: Vec<&str> = key.split('/').collect();
    if segments.len() < 4 || segments[0] != media_type || segments[1] != variant {
        return None;
    }

    // Everything between the variant and the file name
    let document_id = segments[2..segments.len() - 1].join("/");
    if document_id.is_empty() || !is_safe_relative(&document_id) {
        return None;
    }

    let file_name = non_empty(segments[segments.len() - 1])?.to_string();
    let (file_stem, extension) = split_extension(&file_name);

    Some(MediaIdentity {
        document_id,
        media_type: media_type.to_string(),
        media_format: variant.to_string(),
        file_name,
        file_stem,
        extension,
    })
}

/// `name.ext` → (`name`, `ext`); no dot → (`name`, ``)
fn split_extension(file_name: &str) -> (String, String) {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), ext.to_string()),
        None => (file_name.to_string(), String::new()),
    }
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

/// Document identifiers become staging directories; keep them under the root
fn is_safe_relative(document_id: &str) -> bool {
    Path::new(document_id).components().all(|c| {
        matches!(c, std::path::Component::Normal(_))
    }) && document_id.split('/').all(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_parser() -> KeyParser {
        KeyParser::new(PipelineKind::Audio, "/tmp")
    }

    fn image_parser() -> KeyParser {
        KeyParser::new(PipelineKind::Image, "/tmp")
    }

    fn finalize_parser() -> KeyParser {
        KeyParser::new(PipelineKind::Finalize, "/tmp")
    }

    #[test]
    fn test_audio_full_narration_key() {
        let record = audio_parser().parse("bucket", "audio/full/doc-123/gen.mp3");
        let identity = record.identity().unwrap();

        assert_eq!(identity.document_id, "doc-123");
        assert_eq!(identity.media_type, "audio");
        assert_eq!(identity.media_format, "full");
        assert_eq!(identity.file_stem, "gen");
        assert_eq!(identity.extension, "mp3");

        assert_eq!(
            record.local_path(PathRole::SourceDir),
            Some(Path::new("/tmp/audio/full/doc-123"))
        );
        assert_eq!(
            record.local_path(PathRole::SourceFile),
            Some(Path::new("/tmp/audio/full/doc-123/gen.mp3"))
        );
        assert_eq!(
            record.local_path(PathRole::OutputDir),
            Some(Path::new("/tmp/audio/preview/doc-123"))
        );
        assert_eq!(
            record.local_path(PathRole::OutputFile),
            Some(Path::new("/tmp/audio/preview/doc-123/gen.wav"))
        );
        assert_eq!(
            record.remote_path(PathRole::OutputKey),
            Some("audio/preview/doc-123/gen.wav")
        );
        assert_eq!(
            record.remote_path(PathRole::OutputLocator),
            Some("s3://bucket/audio/preview/doc-123/gen.wav")
        );
        assert_eq!(
            record.remote_path(PathRole::SourceLocator),
            Some("s3://bucket/audio/full/doc-123/gen.mp3")
        );
    }

    #[test]
    fn test_audio_nested_document_id() {
        let record = audio_parser().parse("bucket", "audio/full/2024/doc-9/narration.v2.mp3");
        let identity = record.identity().unwrap();
        assert_eq!(identity.document_id, "2024/doc-9");
        assert_eq!(identity.file_stem, "narration.v2");
        assert_eq!(
            record.remote_path(PathRole::OutputKey),
            Some("audio/preview/2024/doc-9/narration.v2.wav")
        );
    }

    #[test]
    fn test_audio_rejects_other_variants() {
        for key in [
            "audio/preview/doc-123/gen.wav",
            "audio/full/gen.mp3",
            "audio/full//gen.mp3",
            "audio/full/doc-123/",
            "audio/full/../etc/passwd",
            "video/full/doc-123/gen.mp3",
            "random/junk/file.txt",
            "",
        ] {
            let record = audio_parser().parse("bucket", key);
            assert!(record.document_id().is_none(), "key {:?} should not parse", key);
            assert!(record.local_paths().is_empty());
            assert!(record.remote_paths().is_empty());
        }
    }

    #[test]
    fn test_image_preview_key() {
        let record = image_parser().parse("bucket", "audio/preview/article-7.json/gen.wav");
        assert_eq!(record.document_id(), Some("article-7.json"));

        assert_eq!(
            record.local_path(PathRole::SourceDir),
            Some(Path::new("/tmp/source/article-7.json"))
        );
        assert_eq!(
            record.local_path(PathRole::ArticleFile),
            Some(Path::new("/tmp/source/article-7.json/article-7.json"))
        );
        assert_eq!(
            record.local_path(PathRole::TriggerFile),
            Some(Path::new("/tmp/output/article-7.json/article-7.json"))
        );
        assert_eq!(record.remote_path(PathRole::ArticleKey), Some("text/article-7.json"));
        assert_eq!(
            record.remote_path(PathRole::OutputKey),
            Some("image/output/article-7.json")
        );
        assert_eq!(
            record.remote_path(PathRole::TriggerKey),
            Some("video-trigger/article-7.json")
        );
        assert_eq!(
            record.remote_path(PathRole::TriggerLocator),
            Some("s3://bucket/video-trigger/article-7.json")
        );
    }

    #[test]
    fn test_image_rejects_full_narrations() {
        let record = image_parser().parse("bucket", "audio/full/doc-123/gen.mp3");
        assert!(!record.is_recognized());
    }

    #[test]
    fn test_finalize_preview_video() {
        let record = finalize_parser().parse(
            "videos",
            "output/preview/62de657b-7884-4dc0-8286-b9b63c521351.mp4",
        );
        let identity = record.identity().unwrap();
        assert_eq!(
            identity.document_id,
            "62de657b-7884-4dc0-8286-b9b63c521351.json"
        );
        assert_eq!(identity.media_format, "preview");
        assert!(record.local_paths().is_empty());
        assert_eq!(
            record.remote_path(PathRole::SourceLocator),
            Some("s3://videos/output/preview/62de657b-7884-4dc0-8286-b9b63c521351.mp4")
        );
    }

    #[test]
    fn test_finalize_full_video_stream() {
        let record = finalize_parser().parse(
            "videos",
            "output/full/hls/62de657b/template62de657b.m3u8",
        );
        let identity = record.identity().unwrap();
        assert_eq!(identity.document_id, "62de657b.json");
        assert_eq!(identity.media_format, "full");
        assert_eq!(identity.extension, "m3u8");
    }

    #[test]
    fn test_finalize_rejects_unknown_layouts() {
        for key in [
            "output/thumbnail/abc.jpg",
            "output/preview/abc.mov",
            "output/preview/nested/abc.mp4",
            "output/full/dash/abc/x.mpd",
            "output/full/hls//x.m3u8",
            "input/preview/abc.mp4",
        ] {
            let record = finalize_parser().parse("videos", key);
            assert!(!record.is_recognized(), "key {:?} should not parse", key);
        }
    }

    #[test]
    fn test_parsing_is_deterministic() {
        let parser = audio_parser();
        let a = parser.parse("bucket", "audio/full/doc-123/gen.mp3");
        let b = parser.parse("bucket", "audio/full/doc-123/gen.mp3");
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.local_paths(), b.local_paths());
        assert_eq!(a.remote_paths(), b.remote_paths());
    }

    #[test]
    fn test_parse_in_stages_under_given_root() {
        let record = image_parser().parse_in(
            Path::new("/tmp/record-1"),
            "bucket",
            "audio/preview/doc-123/gen.wav",
        );
        assert_eq!(
            record.local_path(PathRole::ArticleFile),
            Some(Path::new("/tmp/record-1/source/doc-123/doc-123"))
        );
        assert_eq!(
            record.remote_path(PathRole::ArticleKey),
            Some("text/doc-123")
        );
    }
}
