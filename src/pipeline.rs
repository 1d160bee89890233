//! The per-document pipeline: rasterize, OCR, correct, re-synthesize.

use std::{fmt, sync::Arc, time::Duration};

use serde::Serialize;

use crate::{
    correct::{TextCorrector, correct_or_fallback},
    errors::PipelineError,
    ocr::{OcrEngine, extract_text},
    prelude::*,
    rasterize::{PageRenderer, render_pages},
    searchable::is_searchable,
    synthesize::{PageLayout, write_atomically, write_text_pdf},
};

/// What happened to one input document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    /// A new searchable document was written.
    Success,
    /// The document already had text and was copied as-is.
    AlreadySearchable,
    /// No page images could be extracted.
    SkippedNoImages,
    /// OCR produced no text.
    SkippedNoText,
    /// The document could not be processed.
    Failed(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "processed"),
            Outcome::AlreadySearchable => write!(f, "already searchable, copied"),
            Outcome::SkippedNoImages => write!(f, "skipped, no images extracted"),
            Outcome::SkippedNoText => write!(f, "skipped, no text extracted"),
            Outcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// The result of processing one input document.
#[derive(Clone, Debug, Serialize)]
pub struct DocumentReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub outcome: Outcome,
}

/// Pipeline settings that aren't part of any one component.
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Render at most this many pages per document.
    pub max_pages: Option<usize>,
    /// Upper bound on each correction request.
    pub correction_timeout: Duration,
    /// Copy documents which already have text instead of OCRing them.
    pub skip_searchable: bool,
    pub layout: PageLayout,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_pages: None,
            correction_timeout: Duration::from_secs(120),
            skip_searchable: false,
            layout: PageLayout::default(),
        }
    }
}

/// Everything needed to turn scanned documents into searchable ones.
pub struct Pipeline {
    renderer: Arc<dyn PageRenderer>,
    ocr: Arc<dyn OcrEngine>,
    corrector: Arc<dyn TextCorrector>,
    opts: PipelineOptions,
}

impl Pipeline {
    /// Assemble a pipeline from its components.
    pub fn new(
        renderer: Arc<dyn PageRenderer>,
        ocr: Arc<dyn OcrEngine>,
        corrector: Arc<dyn TextCorrector>,
        opts: PipelineOptions,
    ) -> Self {
        Self {
            renderer,
            ocr,
            corrector,
            opts,
        }
    }

    /// Process each input in turn, writing outputs into `output_dir`.
    ///
    /// One document's failure never stops the batch. `on_report` is called as
    /// soon as each document is done.
    pub async fn process_all(
        &self,
        inputs: &[PathBuf],
        output_dir: &Path,
        mut on_report: impl FnMut(&DocumentReport),
    ) -> Vec<DocumentReport> {
        let mut reports = Vec::with_capacity(inputs.len());
        for input in inputs {
            let report = self.process_document(input, output_dir).await;
            on_report(&report);
            reports.push(report);
        }
        reports
    }

    /// Process a single document.
    #[instrument(level = "info", skip_all, fields(path = %input.display()))]
    pub async fn process_document(&self, input: &Path, output_dir: &Path) -> DocumentReport {
        let (output, outcome) = match output_path_for(input, output_dir) {
            Ok(output) => {
                let outcome = self.run(input, &output).await;
                (output, outcome)
            }
            Err(err) => (output_dir.to_owned(), Outcome::Failed(format!("{err:#}"))),
        };
        DocumentReport {
            input: input.to_owned(),
            output,
            outcome,
        }
    }

    async fn run(&self, input: &Path, output: &Path) -> Outcome {
        if self.opts.skip_searchable
            && is_searchable(self.renderer.as_ref(), self.ocr.as_ref(), input).await
        {
            return match copy_document(input, output).await {
                Ok(()) => Outcome::AlreadySearchable,
                Err(err) => failed(input, err),
            };
        }

        info!("Processing as a raster PDF");
        let images =
            render_pages(self.renderer.as_ref(), input, self.opts.max_pages).await;
        if images.is_empty() {
            return Outcome::SkippedNoImages;
        }

        let raw_text = extract_text(self.ocr.as_ref(), input, images).await;
        if raw_text.trim().is_empty() {
            return Outcome::SkippedNoText;
        }

        let corrected_text = correct_or_fallback(
            self.corrector.as_ref(),
            input,
            &raw_text,
            self.opts.correction_timeout,
        )
        .await;

        match write_text_pdf(&corrected_text, output, &self.opts.layout).await {
            Ok(()) => Outcome::Success,
            Err(err) => failed(input, err),
        }
    }
}

/// Log `err` and turn it into an [`Outcome::Failed`].
fn failed(input: &Path, err: PipelineError) -> Outcome {
    error!(path = %input.display(), "Error {}: {}", err.stage(), err);
    Outcome::Failed(err.to_string())
}

/// Copy an input document unchanged to `output`.
async fn copy_document(input: &Path, output: &Path) -> Result<(), PipelineError> {
    let data = tokio::fs::read(input)
        .await
        .map_err(|err| PipelineError::document_open(input, err))?;
    let output = output.to_owned();
    crate::async_utils::spawn_blocking_propagating_panics(move || {
        write_atomically(&output, &data)
    })
    .await
}

/// Where should the output for `input` go?
pub fn output_path_for(input: &Path, output_dir: &Path) -> Result<PathBuf> {
    let file_name = input
        .file_name()
        .ok_or_else(|| anyhow!("no file name in {:?}", input.display()))?;
    Ok(output_dir.join(file_name))
}

/// List the PDF files directly inside `input_dir`, sorted by path.
///
/// The `.pdf` extension is matched case-insensitively.
pub fn list_input_documents(input_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = input_dir
        .read_dir()
        .with_context(|| format!("failed to read input directory {:?}", input_dir.display()))?
        .map(|entry| {
            let entry = entry.with_context(|| {
                format!("failed to read entry in {:?}", input_dir.display())
            })?;
            let is_file = entry
                .file_type()
                .with_context(|| format!("failed to stat {:?}", entry.path().display()))?
                .is_file();
            Ok((entry.path(), is_file))
        })
        .filter_map(|result: Result<(PathBuf, bool)>| match result {
            Ok((path, true)) if has_pdf_extension(&path) => Some(Ok(path)),
            Ok(_) => None,
            Err(err) => Some(Err(err)),
        })
        .collect::<Result<Vec<_>>>()?;
    paths.sort();
    Ok(paths)
}

fn has_pdf_extension(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case("pdf"))
}
