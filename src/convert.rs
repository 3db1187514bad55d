//! Conversion stage: document bytes → markdown text.
//!
//! The stage is total. A document the converter cannot parse yields empty
//! or partial text rather than an error, so extraction still runs and the
//! row is not lost. Converters that need a filesystem path get the content
//! materialized into a temporary file carrying the original suffix; the
//! file is removed when the call returns, on every path.
//!
//! Results are cached by `(content fingerprint, file kind, converter
//! version)` through [`ConversionCache`]. Content errors (unsupported or
//! unparseable input) are deterministic and their best-effort output is
//! cached; environment errors (I/O, helper crash, timeout) are not.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ConversionConfig;
use crate::convert_cache::{CacheKey, ConversionCache};
use crate::formats;
use crate::models::{file_kind, SourceDocument};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("unsupported document type '{0}'")]
    Unsupported(String),

    #[error("could not parse {kind} document: {detail}")]
    Parse {
        kind: String,
        detail: String,
        partial: String,
    },

    #[error("converter I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("converter helper failed: {detail}")]
    Helper { detail: String, partial: String },

    #[error("conversion timed out after {0}s")]
    Timeout(u64),
}

impl ConvertError {
    pub fn parse(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        ConvertError::Parse {
            kind: kind.into(),
            detail: detail.into(),
            partial: String::new(),
        }
    }

    pub fn helper(detail: impl Into<String>) -> Self {
        ConvertError::Helper {
            detail: detail.into(),
            partial: String::new(),
        }
    }

    /// True when the failure is a property of the input, so retrying the
    /// same bytes with the same converter would fail the same way.
    pub fn is_content_error(&self) -> bool {
        matches!(self, ConvertError::Unsupported(_) | ConvertError::Parse { .. })
    }

    /// Whatever text the converter produced before failing.
    pub fn partial_text(&self) -> &str {
        match self {
            ConvertError::Parse { partial, .. } | ConvertError::Helper { partial, .. } => partial,
            _ => "",
        }
    }
}

/// A document-to-text backend working on a filesystem path.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Configuration version; part of every cache key.
    fn version(&self) -> String;

    /// Verify the backend is usable before any document is processed.
    async fn check(&self) -> Result<()>;

    async fn convert_path(&self, path: &Path, kind: &str) -> Result<String, ConvertError>;
}

/// In-process converter for PDF, OOXML and text documents.
pub struct BuiltinConverter {
    behavior_version: u32,
}

impl BuiltinConverter {
    pub fn new(behavior_version: u32) -> Self {
        Self { behavior_version }
    }
}

#[async_trait]
impl Converter for BuiltinConverter {
    fn version(&self) -> String {
        format!("builtin:v{}", self.behavior_version)
    }

    async fn check(&self) -> Result<()> {
        Ok(())
    }

    async fn convert_path(&self, path: &Path, kind: &str) -> Result<String, ConvertError> {
        let path = path.to_path_buf();
        let kind = kind.to_string();
        let task_kind = kind.clone();
        match tokio::task::spawn_blocking(move || formats::render_path(&path, &task_kind)).await {
            Ok(result) => result,
            // Parser panics on malformed input are treated like parse failures.
            Err(e) if e.is_panic() => Err(ConvertError::parse(kind, "parser panicked")),
            Err(e) => Err(ConvertError::helper(e.to_string())),
        }
    }
}

/// Runs an external converter program with the document path appended to
/// its arguments; stdout is the markdown.
pub struct CommandConverter {
    command: Vec<String>,
    behavior_version: u32,
    timeout: Duration,
}

impl CommandConverter {
    pub fn new(command: Vec<String>, behavior_version: u32, timeout_secs: u64) -> Result<Self> {
        if command.is_empty() {
            bail!("converter command is empty");
        }
        Ok(Self {
            command,
            behavior_version,
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    fn program(&self) -> &str {
        &self.command[0]
    }
}

#[async_trait]
impl Converter for CommandConverter {
    fn version(&self) -> String {
        format!("command:{}:v{}", self.command.join(" "), self.behavior_version)
    }

    async fn check(&self) -> Result<()> {
        match resolve_program(self.program()) {
            Some(path) => {
                debug!(program = %path.display(), "converter helper found");
                Ok(())
            }
            None => bail!("converter helper '{}' not found on PATH", self.program()),
        }
    }

    async fn convert_path(&self, path: &Path, kind: &str) -> Result<String, ConvertError> {
        let mut cmd = tokio::process::Command::new(self.program());
        cmd.args(&self.command[1..]).arg(path).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => return Err(ConvertError::Timeout(self.timeout.as_secs())),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        // A non-zero exit or a kill by signal says nothing certain about the
        // input, so the helper's output is never cached as the conversion.
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(ConvertError::Helper {
            detail: format!(
                "{} exited with {} on {} input: {}",
                self.program(),
                output.status,
                kind,
                stderr.trim()
            ),
            partial: stdout,
        })
    }
}

fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

/// Create the converter named by `conversion.backend`.
pub fn create_converter(config: &ConversionConfig) -> Result<Arc<dyn Converter>> {
    match config.backend.as_str() {
        "builtin" => Ok(Arc::new(BuiltinConverter::new(config.behavior_version))),
        "command" => Ok(Arc::new(CommandConverter::new(
            config.command.clone(),
            config.behavior_version,
            config.timeout_secs,
        )?)),
        other => bail!("Unknown conversion backend: {}", other),
    }
}

/// The cached conversion stage used by the row pipeline.
pub struct MarkdownConverter {
    converter: Arc<dyn Converter>,
    cache: Arc<ConversionCache>,
}

impl MarkdownConverter {
    pub fn new(converter: Arc<dyn Converter>, cache: Arc<ConversionCache>) -> Self {
        Self { converter, cache }
    }

    pub fn version(&self) -> String {
        self.converter.version()
    }

    pub async fn check(&self) -> Result<()> {
        self.converter.check().await
    }

    pub fn cache(&self) -> &ConversionCache {
        &self.cache
    }

    /// Convert raw content; see [`convert_document`](Self::convert_document).
    pub async fn convert(&self, content: &[u8], filename: &str) -> String {
        let doc = SourceDocument::new(filename, content.to_vec());
        self.convert_document(&doc).await
    }

    /// Markdown for one document, from cache when the same bytes were
    /// converted before under the same converter version.
    pub async fn convert_document(&self, doc: &SourceDocument) -> String {
        let key = CacheKey::new(&doc.content_fingerprint, doc.kind(), self.converter.version());
        self.cache
            .get_or_convert(&key, || self.run_converter(&doc.content, &doc.filename))
            .await
    }

    /// `Ok` output is cached, `Err` carries best-effort text that is not.
    async fn run_converter(&self, content: &[u8], filename: &str) -> Result<String, String> {
        match self.materialize_and_convert(content, filename).await {
            Ok(text) => Ok(text),
            Err(e) if e.is_content_error() => {
                warn!(filename, error = %e, "conversion incomplete, continuing with best-effort text");
                Ok(e.partial_text().to_string())
            }
            Err(e) => {
                warn!(filename, error = %e, "conversion failed, result not cached");
                Err(e.partial_text().to_string())
            }
        }
    }

    async fn materialize_and_convert(
        &self,
        content: &[u8],
        filename: &str,
    ) -> Result<String, ConvertError> {
        let kind = file_kind(filename);
        let suffix = if kind.is_empty() {
            String::new()
        } else {
            format!(".{}", kind)
        };
        let bytes = content.to_vec();

        let temp = tokio::task::spawn_blocking(move || -> std::io::Result<tempfile::NamedTempFile> {
            let mut file = tempfile::Builder::new()
                .prefix("intake-")
                .suffix(&suffix)
                .tempfile()?;
            file.write_all(&bytes)?;
            file.flush()?;
            Ok(file)
        })
        .await
        .map_err(|e| ConvertError::helper(e.to_string()))??;

        debug!(filename, path = %temp.path().display(), "converting");
        let result = self.converter.convert_path(temp.path(), &kind).await;
        drop(temp);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert_cache::MemoryCacheBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Echoes the file content and remembers every path it was handed.
    struct RecordingConverter {
        calls: AtomicUsize,
        paths: Mutex<Vec<PathBuf>>,
        fail_with: Option<fn() -> ConvertError>,
    }

    impl RecordingConverter {
        fn new(fail_with: Option<fn() -> ConvertError>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                paths: Mutex::new(Vec::new()),
                fail_with,
            }
        }
    }

    #[async_trait]
    impl Converter for RecordingConverter {
        fn version(&self) -> String {
            "recording:v1".to_string()
        }
        async fn check(&self) -> Result<()> {
            Ok(())
        }
        async fn convert_path(&self, path: &Path, _kind: &str) -> Result<String, ConvertError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.paths.lock().unwrap().push(path.to_path_buf());
            if let Some(fail) = self.fail_with {
                return Err(fail());
            }
            Ok(std::fs::read_to_string(path)?)
        }
    }

    fn stage(converter: Arc<RecordingConverter>) -> MarkdownConverter {
        let cache = Arc::new(ConversionCache::new(Arc::new(MemoryCacheBackend::new())));
        MarkdownConverter::new(converter, cache)
    }

    #[tokio::test]
    async fn temp_file_keeps_suffix_and_is_removed() {
        let converter = Arc::new(RecordingConverter::new(None));
        let stage = stage(converter.clone());

        let text = stage.convert(b"hello", "form.TXT").await;
        assert_eq!(text, "hello");

        let paths = converter.paths.lock().unwrap().clone();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].extension().unwrap(), "txt");
        assert!(!paths[0].exists());
    }

    #[tokio::test]
    async fn content_errors_yield_partial_text_and_are_cached() {
        fn garbled() -> ConvertError {
            ConvertError::Parse {
                kind: "pdf".into(),
                detail: "bad xref".into(),
                partial: "Name:".into(),
            }
        }
        let converter = Arc::new(RecordingConverter::new(Some(garbled)));
        let stage = stage(converter.clone());

        assert_eq!(stage.convert(b"%PDF-garbage", "b.pdf").await, "Name:");
        assert_eq!(stage.convert(b"%PDF-garbage", "b.pdf").await, "Name:");
        assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
        assert!(!converter.paths.lock().unwrap()[0].exists());
    }

    #[tokio::test]
    async fn environment_errors_are_not_cached() {
        fn timeout() -> ConvertError {
            ConvertError::Timeout(5)
        }
        let converter = Arc::new(RecordingConverter::new(Some(timeout)));
        let stage = stage(converter.clone());

        assert_eq!(stage.convert(b"x", "a.pdf").await, "");
        assert_eq!(stage.convert(b"x", "a.pdf").await, "");
        assert_eq!(converter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn builtin_converter_reads_text() {
        let cache = Arc::new(ConversionCache::new(Arc::new(MemoryCacheBackend::new())));
        let stage = MarkdownConverter::new(Arc::new(BuiltinConverter::new(1)), cache);
        assert_eq!(stage.version(), "builtin:v1");
        assert_eq!(stage.convert(b"Name: Jane", "a.txt").await, "Name: Jane");
        assert_eq!(stage.convert(&[0, 1, 2, 3], "scan.bin").await, "");
    }

    #[tokio::test]
    async fn missing_helper_fails_check() {
        let converter =
            CommandConverter::new(vec!["definitely-not-a-real-converter-xyz".into()], 1, 5).unwrap();
        assert!(converter.check().await.is_err());
        assert_eq!(
            converter.version(),
            "command:definitely-not-a-real-converter-xyz:v1"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_converter_reads_helper_stdout() {
        let converter = CommandConverter::new(vec!["cat".into()], 1, 30).unwrap();
        converter.check().await.unwrap();

        let cache = Arc::new(ConversionCache::new(Arc::new(MemoryCacheBackend::new())));
        let stage = MarkdownConverter::new(Arc::new(converter), cache);
        assert_eq!(stage.convert(b"# Intake form", "a.md").await, "# Intake form");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_helper_output_is_returned_but_not_cached() {
        let dir = tempfile::TempDir::new().unwrap();
        let calls = dir.path().join("calls.log");
        let script = format!(
            "echo run >> '{}'; echo 'Name: Jane'; echo 'out of memory' >&2; exit 3",
            calls.display()
        );
        let converter = CommandConverter::new(vec!["sh".into(), "-c".into(), script], 1, 30).unwrap();

        let backend = Arc::new(MemoryCacheBackend::new());
        let cache = Arc::new(ConversionCache::new(backend.clone()));
        let stage = MarkdownConverter::new(Arc::new(converter), cache);

        assert_eq!(stage.convert(b"%PDF-1.7", "a.pdf").await, "Name: Jane\n");
        assert_eq!(stage.convert(b"%PDF-1.7", "a.pdf").await, "Name: Jane\n");
        assert_eq!(std::fs::read_to_string(&calls).unwrap().lines().count(), 2);
        assert!(backend.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn helper_exit_is_an_environment_error() {
        let converter =
            CommandConverter::new(vec!["sh".into(), "-c".into(), "echo half; exit 1".into()], 1, 30)
                .unwrap();
        let err = converter
            .convert_path(Path::new("/dev/null"), "pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::Helper { .. }));
        assert!(!err.is_content_error());
        assert_eq!(err.partial_text(), "half\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_helper_times_out_and_is_not_cached() {
        let converter = CommandConverter::new(vec!["sleep".into(), "5".into()], 1, 1).unwrap();
        let err = converter
            .convert_path(Path::new("/dev/null"), "pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::Timeout(1)));

        let backend = Arc::new(MemoryCacheBackend::new());
        let cache = Arc::new(ConversionCache::new(backend.clone()));
        let stage = MarkdownConverter::new(Arc::new(converter), cache);
        assert_eq!(stage.convert(b"x", "a.pdf").await, "");
        assert!(backend.is_empty());
    }
}
