//! Detect whether a document already has text.

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    errors::PipelineError,
    ocr::{OcrEngine, decode_grayscale},
    prelude::*,
    rasterize::PageRenderer,
};

/// Does any page of `path` have text, either in its text layer or (failing
/// that) via OCR of the rendered page?
///
/// We stop at the first page with text. Any error counts as "not
/// searchable", so that unreadable documents still get the full OCR
/// treatment.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn is_searchable(
    renderer: &dyn PageRenderer,
    ocr: &dyn OcrEngine,
    path: &Path,
) -> bool {
    match find_text(renderer, ocr, path).await {
        Ok(Some(page_number)) => {
            debug!(page_number, "Found text");
            true
        }
        Ok(None) => false,
        Err(err) => {
            error!(path = %path.display(), "Error checking PDF: {}", err);
            false
        }
    }
}

/// Return the number of the first page with text, if any.
async fn find_text(
    renderer: &dyn PageRenderer,
    ocr: &dyn OcrEngine,
    path: &Path,
) -> Result<Option<usize>, PipelineError> {
    let total_pages = renderer.page_count(path).await?;
    for page_number in 1..=total_pages {
        let text = renderer.text_layer(path, page_number).await?;
        if !text.trim().is_empty() {
            return Ok(Some(page_number));
        }

        let image = renderer.render_page(path, page_number).await?;
        let gray = spawn_blocking_propagating_panics(move || decode_grayscale(&image.data))
            .await
            .map_err(|err| PipelineError::Ocr {
                page: page_number,
                reason: format!("{err:#}"),
            })?;
        let ocr_text = ocr.recognize(gray).await.map_err(|err| PipelineError::Ocr {
            page: page_number,
            reason: format!("{err:#}"),
        })?;
        if !ocr_text.trim().is_empty() {
            return Ok(Some(page_number));
        }
    }
    Ok(None)
}
