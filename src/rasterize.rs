//! Render PDF pages to PNG images, using Poppler's CLI tools.

use clap::Args;
use tokio::process::Command;

use crate::{
    async_utils::{is_error_line, run_command},
    errors::PipelineError,
    prelude::*,
};

/// The only MIME type we accept as input.
const PDF_MIME_TYPE: &str = "application/pdf";

/// A single rendered page.
#[derive(Debug)]
pub struct PageImage {
    /// 1-based page number within the source document.
    pub page_number: usize,
    /// PNG-encoded bitmap.
    pub data: Vec<u8>,
}

/// Options for rasterizing documents.
#[derive(Args, Clone, Debug)]
pub struct RasterizeOptions {
    /// The DPI to use for rasterization.
    #[clap(long, default_value = "300")]
    pub rasterize_dpi: u32,

    /// The maximum number of pages to process per document. Later pages are
    /// dropped with a warning.
    #[clap(long)]
    pub max_pages: Option<usize>,
}

/// Access to the pages of a document.
#[async_trait]
pub trait PageRenderer: Send + Sync + 'static {
    /// Count the pages in a document, failing if it cannot be opened.
    async fn page_count(&self, path: &Path) -> Result<usize, PipelineError>;

    /// Render one page (1-based) to a PNG image.
    async fn render_page(
        &self,
        path: &Path,
        page_number: usize,
    ) -> Result<PageImage, PipelineError>;

    /// Extract the existing text layer of one page (1-based).
    async fn text_layer(
        &self,
        path: &Path,
        page_number: usize,
    ) -> Result<String, PipelineError>;
}

/// A [`PageRenderer`] wrapping `pdfinfo`, `pdftocairo` and `pdftotext` from
/// `poppler-utils`.
#[derive(Debug, Clone)]
pub struct PopplerRenderer {
    dpi: u32,
}

impl PopplerRenderer {
    /// Create a renderer producing images at `dpi`.
    pub fn new(dpi: u32) -> Self {
        Self { dpi }
    }
}

#[async_trait]
impl PageRenderer for PopplerRenderer {
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    async fn page_count(&self, path: &Path) -> Result<usize, PipelineError> {
        check_is_pdf(path)?;
        get_pdf_page_count(path)
            .await
            .map_err(|err| PipelineError::document_open(path, err))
    }

    #[instrument(level = "debug", skip_all, fields(path = %path.display(), page = page_number))]
    async fn render_page(
        &self,
        path: &Path,
        page_number: usize,
    ) -> Result<PageImage, PipelineError> {
        // The temporary directory is deleted when it goes out of scope, even
        // if rendering fails.
        let tmpdir = tempfile::TempDir::with_prefix("page")
            .map_err(|err| PipelineError::render(path, page_number, err))?;
        let out_prefix = tmpdir.path().join("page");
        let page = page_number.to_string();
        let mut cmd = Command::new("pdftocairo");
        cmd.arg("-png")
            .arg("-singlefile")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg("-f")
            .arg(&page)
            .arg("-l")
            .arg(&page)
            .arg(path)
            .arg(&out_prefix);
        run_command("pdftocairo", &mut cmd, Some(&is_error_line))
            .await
            .map_err(|err| PipelineError::render(path, page_number, err))?;

        let png_path = out_prefix.with_extension("png");
        let data = tokio::fs::read(&png_path)
            .await
            .with_context(|| format!("failed to read file {:?}", png_path.display()))
            .map_err(|err| PipelineError::render(path, page_number, err))?;
        Ok(PageImage { page_number, data })
    }

    #[instrument(level = "debug", skip_all, fields(path = %path.display(), page = page_number))]
    async fn text_layer(
        &self,
        path: &Path,
        page_number: usize,
    ) -> Result<String, PipelineError> {
        let page = page_number.to_string();
        let mut cmd = Command::new("pdftotext");
        cmd.arg("-layout")
            .arg("-f")
            .arg(&page)
            .arg("-l")
            .arg(&page)
            .arg(path)
            .arg("-");
        let output = run_command("pdftotext", &mut cmd, Some(&is_error_line))
            .await
            .map_err(|err| PipelineError::render(path, page_number, err))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Render every page of a document, in page order.
///
/// Stops at the first page that cannot be rendered.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn rasterize_document(
    renderer: &dyn PageRenderer,
    path: &Path,
    max_pages: Option<usize>,
) -> Result<Vec<PageImage>, PipelineError> {
    let total_pages = renderer.page_count(path).await?;
    let page_limit = match max_pages {
        Some(max_pages) if total_pages > max_pages => {
            warn!(
                path = %path.display(),
                "Only {}/{} pages will be processed (because of --max-pages)",
                max_pages,
                total_pages,
            );
            max_pages
        }
        _ => total_pages,
    };

    let mut images = Vec::with_capacity(page_limit);
    for page_number in 1..=page_limit {
        images.push(renderer.render_page(path, page_number).await?);
    }
    debug!(pages = images.len(), "Rasterized document");
    Ok(images)
}

/// Like [`rasterize_document`], but logs any failure and returns no pages
/// instead.
pub async fn render_pages(
    renderer: &dyn PageRenderer,
    path: &Path,
    max_pages: Option<usize>,
) -> Vec<PageImage> {
    match rasterize_document(renderer, path, max_pages).await {
        Ok(images) => images,
        Err(err) => {
            error!(path = %path.display(), "Error extracting images: {}", err);
            vec![]
        }
    }
}

/// Make sure `path` exists and looks like a PDF.
fn check_is_pdf(path: &Path) -> Result<(), PipelineError> {
    let mime_type =
        get_mime_type(path).map_err(|err| PipelineError::document_open(path, err))?;
    if mime_type == PDF_MIME_TYPE {
        Ok(())
    } else {
        Err(PipelineError::document_open(
            path,
            format!("unsupported MIME type {mime_type} (expected {PDF_MIME_TYPE})"),
        ))
    }
}

/// Get the MIME type of a file.
pub fn get_mime_type(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)
        .with_context(|| format!("failed to get MIME type for {:?}", path.display()))?
        .ok_or_else(|| anyhow!("unknown MIME type for {:?}", path.display()))?
        .mime_type()
        .to_string())
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    let mut cmd = Command::new("pdfinfo");
    cmd.arg(path);
    let output = run_command("pdfinfo", &mut cmd, None).await?;
    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    parse_pdfinfo_page_count(&output).with_context(|| {
        format!(
            "failed to parse page count for {:?} from pdfinfo output",
            path.display()
        )
    })
}

/// Find the `Pages:` property in `pdfinfo` output.
fn parse_pdfinfo_page_count(output: &str) -> Result<usize> {
    let pages = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim() == "Pages")
        .map(|(_, value)| value.trim())
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    Ok(pages.parse::<usize>()?)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{collections::BTreeMap, io::Cursor, sync::Mutex};

    use image::{GrayImage, ImageFormat, Luma};

    use super::*;

    /// Encode a blank PNG of the given size.
    pub(crate) fn png_of_size(width: u32, height: u32) -> Vec<u8> {
        let img = GrayImage::from_pixel(width, height, Luma([255u8]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    /// A page of a [`FakeRenderer`] document.
    #[derive(Clone, Default)]
    pub(crate) struct FakePage {
        pub(crate) text_layer: String,
        pub(crate) broken: bool,
    }

    /// In-memory renderer keyed by file name. Each rendered page is a PNG
    /// whose width is `10 * page_number`, so tests can tell pages apart.
    #[derive(Default)]
    pub(crate) struct FakeRenderer {
        pub(crate) documents: BTreeMap<String, Vec<FakePage>>,
        pub(crate) calls: Mutex<Vec<String>>,
    }

    impl FakeRenderer {
        pub(crate) fn with_document(mut self, name: &str, pages: Vec<FakePage>) -> Self {
            self.documents.insert(name.to_owned(), pages);
            self
        }

        fn pages(&self, path: &Path) -> Result<&Vec<FakePage>, PipelineError> {
            let name = path.file_name().unwrap().to_string_lossy();
            self.documents
                .get(name.as_ref())
                .ok_or_else(|| PipelineError::document_open(path, "no such document"))
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageRenderer for FakeRenderer {
        async fn page_count(&self, path: &Path) -> Result<usize, PipelineError> {
            Ok(self.pages(path)?.len())
        }

        async fn render_page(
            &self,
            path: &Path,
            page_number: usize,
        ) -> Result<PageImage, PipelineError> {
            self.calls.lock().unwrap().push(format!("render {page_number}"));
            let page = &self.pages(path)?[page_number - 1];
            if page.broken {
                return Err(PipelineError::render(path, page_number, "broken page"));
            }
            Ok(PageImage {
                page_number,
                data: png_of_size(10 * page_number as u32, 8),
            })
        }

        async fn text_layer(
            &self,
            path: &Path,
            page_number: usize,
        ) -> Result<String, PipelineError> {
            self.calls.lock().unwrap().push(format!("text {page_number}"));
            Ok(self.pages(path)?[page_number - 1].text_layer.clone())
        }
    }

    #[test]
    fn parses_pdfinfo_output() {
        let output = "Producer:       printpdf\nPages:          3\nEncrypted:      no\n";
        assert_eq!(parse_pdfinfo_page_count(output).unwrap(), 3);
        assert!(parse_pdfinfo_page_count("Producer: x\n").is_err());
    }

    #[tokio::test]
    async fn rasterizes_pages_in_order() {
        let renderer = FakeRenderer::default()
            .with_document("scan.pdf", vec![FakePage::default(); 3]);
        let images = rasterize_document(&renderer, Path::new("scan.pdf"), None)
            .await
            .unwrap();
        let numbers = images.iter().map(|i| i.page_number).collect::<Vec<_>>();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn max_pages_limits_rendering() {
        let renderer = FakeRenderer::default()
            .with_document("scan.pdf", vec![FakePage::default(); 5]);
        let images = rasterize_document(&renderer, Path::new("scan.pdf"), Some(2))
            .await
            .unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(renderer.calls(), vec!["render 1", "render 2"]);
    }

    #[tokio::test]
    async fn render_failures_yield_no_pages() {
        let renderer = FakeRenderer::default().with_document(
            "scan.pdf",
            vec![
                FakePage::default(),
                FakePage {
                    broken: true,
                    ..FakePage::default()
                },
            ],
        );
        let err = rasterize_document(&renderer, Path::new("scan.pdf"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Render { page: 2, .. }));
        assert!(
            render_pages(&renderer, Path::new("scan.pdf"), None)
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn zero_page_documents_yield_no_pages() {
        let renderer = FakeRenderer::default().with_document("empty.pdf", vec![]);
        assert!(
            render_pages(&renderer, Path::new("empty.pdf"), None)
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn poppler_rejects_non_pdf_input() {
        let tmpdir = tempfile::TempDir::with_prefix("rasterize").unwrap();
        let path = tmpdir.path().join("notes.pdf");
        std::fs::write(&path, png_of_size(4, 4)).unwrap();
        let err = PopplerRenderer::new(72).page_count(&path).await.unwrap_err();
        assert!(matches!(err, PipelineError::DocumentOpen { .. }));

        let missing = tmpdir.path().join("missing.pdf");
        let err = PopplerRenderer::new(72)
            .page_count(&missing)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::DocumentOpen { .. }));
    }
}
