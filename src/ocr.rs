//! Turn page images into text.

use std::io::Cursor;

use clap::Args;
use image::{GrayImage, ImageFormat};
use tokio::process::Command;

use crate::{
    async_utils::{run_command, spawn_blocking_propagating_panics},
    errors::PipelineError,
    prelude::*,
    rasterize::PageImage,
};

/// Inserted after the text of every page.
pub const PAGE_SEPARATOR: char = '\n';

/// OCR options.
#[derive(Args, Clone, Debug)]
pub struct OcrOptions {
    /// The `tesseract` language code(s) to recognize, such as `eng` or
    /// `eng+deu`.
    #[clap(long, default_value = "eng")]
    pub ocr_language: String,
}

impl Default for OcrOptions {
    fn default() -> Self {
        Self {
            ocr_language: "eng".to_owned(),
        }
    }
}

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Recognize the text in a single grayscale image.
    async fn recognize(&self, image: GrayImage) -> Result<String>;
}

/// OCR engine wrapping the `tesseract` CLI tool.
#[derive(Debug, Clone)]
pub struct TesseractOcrEngine {
    language: String,
}

impl TesseractOcrEngine {
    /// Create a new `tesseract` engine.
    pub fn new(opts: &OcrOptions) -> Self {
        Self {
            language: opts.ocr_language.clone(),
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    #[instrument(level = "debug", skip_all, fields(width = image.width(), height = image.height()))]
    async fn recognize(&self, image: GrayImage) -> Result<String> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        let output_path = tmpdir.path().join("output.txt");
        let png = spawn_blocking_propagating_panics(move || encode_png(&image)).await?;
        tokio::fs::write(&input_path, png)
            .await
            .context("cannot write tesseract input file")?;

        // Run tesseract on the input file. It appends `.txt` itself.
        let mut cmd = Command::new("tesseract");
        cmd.arg(&input_path)
            .arg(output_path.with_extension(""))
            .arg("-l")
            .arg(&self.language);
        run_command("tesseract", &mut cmd, None).await?;

        tokio::fs::read_to_string(&output_path)
            .await
            .context("cannot read tesseract output file")
    }
}

/// Encode a grayscale image as PNG.
fn encode_png(image: &GrayImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("cannot encode page as PNG")?;
    Ok(bytes)
}

/// Decode a page image to grayscale.
pub fn decode_grayscale(data: &[u8]) -> Result<GrayImage> {
    Ok(image::load_from_memory(data)
        .context("cannot decode page image")?
        .to_luma8())
}

/// OCR every page, in order, into a single string with one
/// [`PAGE_SEPARATOR`] after each page.
///
/// If any page fails, the whole document fails. We don't try to return
/// partial text.
#[instrument(level = "debug", skip_all, fields(pages = pages.len()))]
pub async fn ocr_pages(
    engine: &dyn OcrEngine,
    pages: Vec<PageImage>,
) -> Result<String, PipelineError> {
    let mut text = String::new();
    for page in pages {
        let page_number = page.page_number;
        let gray = spawn_blocking_propagating_panics(move || decode_grayscale(&page.data))
            .await
            .map_err(|err| PipelineError::Ocr {
                page: page_number,
                reason: format!("{err:#}"),
            })?;
        let page_text =
            engine
                .recognize(gray)
                .await
                .map_err(|err| PipelineError::Ocr {
                    page: page_number,
                    reason: format!("{err:#}"),
                })?;
        // Tesseract ends each page with a form feed, which we replace with
        // our own separator.
        text.push_str(page_text.trim_end());
        text.push(PAGE_SEPARATOR);
    }
    Ok(text)
}

/// Like [`ocr_pages`], but logs any failure and returns an empty string
/// instead.
pub async fn extract_text(
    engine: &dyn OcrEngine,
    path: &Path,
    pages: Vec<PageImage>,
) -> String {
    match ocr_pages(engine, pages).await {
        Ok(text) => text,
        Err(err) => {
            error!(path = %path.display(), "Error during OCR: {}", err);
            String::new()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::rasterize::tests::png_of_size;

    /// Reports each image's width as its "text". Fails on images
    /// `fail_on_width` pixels wide.
    #[derive(Default)]
    pub(crate) struct WidthOcrEngine {
        pub(crate) fail_on_width: Option<u32>,
    }

    #[async_trait]
    impl OcrEngine for WidthOcrEngine {
        async fn recognize(&self, image: GrayImage) -> Result<String> {
            if Some(image.width()) == self.fail_on_width {
                return Err(anyhow!("unreadable page"));
            }
            Ok(format!("width {}\n\u{c}", image.width()))
        }
    }

    fn page(page_number: usize, width: u32) -> PageImage {
        PageImage {
            page_number,
            data: png_of_size(width, 5),
        }
    }

    #[tokio::test]
    async fn one_segment_per_page_in_order() {
        let engine = WidthOcrEngine::default();
        let pages = vec![page(1, 30), page(2, 10), page(3, 20)];
        let text = ocr_pages(&engine, pages).await.unwrap();
        assert_eq!(text, "width 30\nwidth 10\nwidth 20\n");
        assert_eq!(text.matches(PAGE_SEPARATOR).count(), 3);
    }

    #[tokio::test]
    async fn no_pages_means_no_text() {
        let engine = WidthOcrEngine::default();
        assert_eq!(ocr_pages(&engine, vec![]).await.unwrap(), "");
    }

    #[tokio::test]
    async fn one_failed_page_fails_the_document() {
        let engine = WidthOcrEngine {
            fail_on_width: Some(10),
        };
        let pages = vec![page(1, 30), page(2, 10), page(3, 20)];
        let err = ocr_pages(&engine, pages).await.unwrap_err();
        assert!(matches!(err, PipelineError::Ocr { page: 2, .. }));

        let pages = vec![page(1, 30), page(2, 10)];
        assert_eq!(extract_text(&engine, Path::new("scan.pdf"), pages).await, "");
    }

    #[tokio::test]
    async fn undecodable_images_are_ocr_errors() {
        let engine = WidthOcrEngine::default();
        let pages = vec![PageImage {
            page_number: 1,
            data: b"not a png".to_vec(),
        }];
        let err = ocr_pages(&engine, pages).await.unwrap_err();
        assert!(matches!(err, PipelineError::Ocr { page: 1, .. }));
    }
}
