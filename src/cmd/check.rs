//! The `check` subcommand.

use clap::Args;

use crate::{
    ocr::{OcrOptions, TesseractOcrEngine},
    prelude::*,
    rasterize::PopplerRenderer,
    searchable::is_searchable,
    ui::Ui,
};

/// Options for the `check` subcommand.
#[derive(Debug, Args)]
pub struct CheckOpts {
    /// PDF files to check.
    #[clap(required = true)]
    paths: Vec<PathBuf>,

    /// The DPI to use when rendering pages for OCR.
    #[clap(long, default_value = "300")]
    rasterize_dpi: u32,

    #[command(flatten)]
    ocr: OcrOptions,
}

/// The `check` subcommand. Prints whether each file already has text.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_check(ui: Ui, opts: &CheckOpts) -> Result<()> {
    let renderer = PopplerRenderer::new(opts.rasterize_dpi);
    let ocr = TesseractOcrEngine::new(&opts.ocr);
    for path in &opts.paths {
        let verdict = if is_searchable(&renderer, &ocr, path).await {
            "searchable"
        } else {
            "not searchable"
        };
        ui.status_line(&format!("{}: {verdict}", path.display()));
    }
    Ok(())
}
