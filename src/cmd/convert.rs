//! The `convert` subcommand.

use std::{io::Write as _, sync::Arc};

use clap::Args;

use crate::{
    cmd::CredentialOpts,
    correct::{CorrectionOpts, OpenAiCorrector},
    llm_client::create_llm_client,
    ocr::{OcrOptions, TesseractOcrEngine},
    pipeline::{
        DocumentReport, Outcome, Pipeline, PipelineOptions, list_input_documents,
    },
    prelude::*,
    rasterize::{PopplerRenderer, RasterizeOptions},
    synthesize::PageLayout,
    ui::Ui,
};

/// Options for the `convert` subcommand.
#[derive(Debug, Args)]
pub struct ConvertOpts {
    /// Directory containing the PDFs to convert.
    #[clap(default_value = "input")]
    input_dir: PathBuf,

    /// Directory to write converted PDFs to. Created if missing. Existing
    /// files with the same name are overwritten.
    #[clap(default_value = "output")]
    output_dir: PathBuf,

    /// Copy PDFs which already contain text to the output directory as-is,
    /// instead of OCRing them.
    #[clap(long)]
    skip_searchable: bool,

    /// Write a JSON Lines report with one outcome per document.
    #[clap(long)]
    report: Option<PathBuf>,

    #[command(flatten)]
    credentials: CredentialOpts,

    #[command(flatten)]
    rasterize: RasterizeOptions,

    #[command(flatten)]
    ocr: OcrOptions,

    #[command(flatten)]
    correction: CorrectionOpts,
}

/// The `convert` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_convert(ui: Ui, opts: &ConvertOpts) -> Result<()> {
    // Check our configuration before touching any files.
    let api_key = opts.credentials.require_api_key()?;

    let inputs = list_input_documents(&opts.input_dir)?;
    tokio::fs::create_dir_all(&opts.output_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create output directory {:?}",
                opts.output_dir.display()
            )
        })?;
    info!(
        count = inputs.len(),
        input_dir = %opts.input_dir.display(),
        "Found input documents"
    );

    let client = create_llm_client(api_key, opts.credentials.api_base());
    let pipeline = Pipeline::new(
        Arc::new(PopplerRenderer::new(opts.rasterize.rasterize_dpi)),
        Arc::new(TesseractOcrEngine::new(&opts.ocr)),
        Arc::new(OpenAiCorrector::new(client, &opts.correction)),
        PipelineOptions {
            max_pages: opts.rasterize.max_pages,
            correction_timeout: opts.correction.timeout(),
            skip_searchable: opts.skip_searchable,
            layout: PageLayout::default(),
        },
    );

    let pb = ui.document_progress(inputs.len() as u64);
    let reports = pipeline
        .process_all(&inputs, &opts.output_dir, |report| {
            ui.status_line(&status_line(report));
            pb.inc(1);
        })
        .await;
    pb.finish_using_style();

    if let Some(report_path) = &opts.report {
        write_report(report_path, &reports)?;
    }

    ui.status_line(&Summary::from_reports(&reports).to_string());
    check_for_failures(&reports)
}

/// Fail if any document failed. Skipped documents are not failures.
fn check_for_failures(reports: &[DocumentReport]) -> Result<()> {
    let failed = Summary::from_reports(reports).failed;
    if failed > 0 {
        Err(anyhow!("{} of {} documents failed", failed, reports.len()))
    } else {
        Ok(())
    }
}

/// Describe one document's outcome for the operator.
fn status_line(report: &DocumentReport) -> String {
    let name = report
        .input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| report.input.display().to_string());
    match &report.outcome {
        Outcome::Success | Outcome::AlreadySearchable => format!(
            "{name}: {} (saved to {})",
            report.outcome,
            report.output.display()
        ),
        outcome => format!("{name}: {outcome}"),
    }
}

/// Write one JSON object per document.
fn write_report(path: &Path, reports: &[DocumentReport]) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create report {:?}", path.display()))?;
    let mut wtr = std::io::BufWriter::new(file);
    for report in reports {
        serde_json::to_writer(&mut wtr, report)
            .context("failed to serialize report")?;
        writeln!(wtr).context("failed to write report")?;
    }
    wtr.flush().context("failed to write report")?;
    Ok(())
}

/// Counts of each kind of outcome.
#[derive(Debug, Default, PartialEq, Eq)]
struct Summary {
    succeeded: usize,
    copied: usize,
    skipped: usize,
    failed: usize,
}

impl Summary {
    fn from_reports(reports: &[DocumentReport]) -> Self {
        let mut summary = Self::default();
        for report in reports {
            match report.outcome {
                Outcome::Success => summary.succeeded += 1,
                Outcome::AlreadySearchable => summary.copied += 1,
                Outcome::SkippedNoImages | Outcome::SkippedNoText => summary.skipped += 1,
                Outcome::Failed(_) => summary.failed += 1,
            }
        }
        summary
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} converted, {} copied, {} skipped, {} failed",
            self.succeeded, self.copied, self.skipped, self.failed
        )
    }
}
