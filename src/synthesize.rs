//! Lay out plain text as a new PDF, using `printpdf`.
//!
//! Text is drawn with an embedded monospace font, so the output carries a
//! ToUnicode map and accented letters and typographic punctuation stay
//! searchable.

use std::io::Write as _;

use printpdf::{
    BuiltinFont, FontId, Mm, Op, ParsedFont, PdfDocument, PdfPage, PdfSaveOptions,
    PdfWarnMsg, Point, Pt, TextItem,
};

use crate::{
    async_utils::spawn_blocking_propagating_panics, errors::PipelineError, prelude::*,
};

/// Drawn in place of characters the body font has no glyph for.
const REPLACEMENT_CHAR: char = '?';

/// Page geometry and font size for generated documents.
#[derive(Clone, Copy, Debug)]
pub struct PageLayout {
    pub page_width: Pt,
    pub page_height: Pt,
    /// Applied on all four sides.
    pub margin: Pt,
    pub font_size: Pt,
    /// Distance between baselines.
    pub leading: Pt,
}

impl Default for PageLayout {
    /// US letter, 12pt Courier, 40pt margins.
    fn default() -> Self {
        Self {
            page_width: Pt(612.0),
            page_height: Pt(792.0),
            margin: Pt(40.0),
            font_size: Pt(12.0),
            leading: Pt(14.4),
        }
    }
}

impl PageLayout {
    /// Width available for text between the margins.
    pub fn printable_width(&self) -> f32 {
        self.page_width.0 - 2.0 * self.margin.0
    }

    /// How many lines fit on one page. Always at least 1.
    pub fn lines_per_page(&self) -> usize {
        let usable_height = self.page_height.0 - 2.0 * self.margin.0;
        ((usable_height / self.leading.0).floor() as usize).max(1)
    }

    fn page_dimensions(&self) -> (Mm, Mm) {
        (pt_to_mm(self.page_width), pt_to_mm(self.page_height))
    }
}

fn pt_to_mm(pt: Pt) -> Mm {
    Mm(pt.0 * 25.4 / 72.0)
}

/// The font used for body text, with the metrics we lay out by.
///
/// This is the Windows-1252 Courier subset bundled with `printpdf`, embedded
/// as a TrueType font instead of being referenced as a base-14 font. It has
/// no glyph for the space character, so spaces are drawn as positioning
/// gaps of one glyph width.
pub struct BodyFont {
    font: ParsedFont,
    units_per_em: f32,
    space_units: u16,
}

impl BodyFont {
    /// Load the bundled Courier.
    pub fn courier() -> Result<Self> {
        let subset = BuiltinFont::Courier.get_subset_font();
        let mut warnings = Vec::new();
        let font = ParsedFont::from_bytes(&subset.bytes, 0, &mut warnings)
            .ok_or_else(|| anyhow!("cannot load built-in Courier font"))?;
        let units_per_em = f32::from(font.font_metrics.units_per_em.max(1));
        let mut body_font = Self {
            font,
            units_per_em,
            space_units: 0,
        };
        body_font.space_units = match body_font.font.get_space_width() {
            Some(width) if width > 0 => u16::try_from(width).unwrap_or(u16::MAX),
            _ => body_font.glyph_units(REPLACEMENT_CHAR),
        };
        Ok(body_font)
    }

    fn glyph(&self, c: char) -> Option<u16> {
        self.font
            .lookup_glyph_index(u32::from(c))
            .filter(|&glyph| glyph != 0)
    }

    fn glyph_units(&self, c: char) -> u16 {
        let advance = self
            .glyph(c)
            .or_else(|| self.glyph(REPLACEMENT_CHAR))
            .map(|glyph| self.font.get_horizontal_advance(glyph))
            .unwrap_or_default();
        if advance > 0 {
            return advance;
        }
        // Glyphs without a decoded outline have no recorded advance. Courier
        // is monospaced, so the widest advance is every advance.
        self.font
            .hhea_table
            .as_ref()
            .map(|hhea| hhea.advance_width_max)
            .unwrap_or_default()
    }

    fn advance_units(&self, c: char) -> u16 {
        if c == ' ' {
            self.space_units
        } else {
            self.glyph_units(c)
        }
    }

    /// Can this font draw `c`?
    pub fn can_draw(&self, c: char) -> bool {
        c == ' ' || self.glyph(c).is_some()
    }

    /// Rewrite `text` so that every character can be drawn. Line breaks are
    /// kept, other whitespace becomes a space, and anything else we have no
    /// glyph for becomes [`REPLACEMENT_CHAR`].
    pub fn drawable_text(&self, text: &str) -> String {
        text.chars()
            .map(|c| match c {
                '\n' => '\n',
                c if self.can_draw(c) => c,
                c if c.is_whitespace() => ' ',
                _ => REPLACEMENT_CHAR,
            })
            .collect()
    }

    /// Horizontal advance of `c`, in points.
    pub fn advance(&self, c: char, font_size: Pt) -> f32 {
        f32::from(self.advance_units(c)) / self.units_per_em * font_size.0
    }

    /// Rendered width of `line`, in points.
    pub fn text_width(&self, line: &str, font_size: Pt) -> f32 {
        line.chars().map(|c| self.advance(c, font_size)).sum()
    }

    /// The `TJ` items for one line: words as text, spaces as gaps.
    fn text_items(&self, line: &str) -> Vec<TextItem> {
        // Offsets are in thousandths of an em, and negative values move right.
        let gap = -f32::from(self.space_units) / self.units_per_em * 1000.0;
        let mut items = Vec::new();
        for (idx, word) in line.split(' ').enumerate() {
            if idx > 0 {
                items.push(TextItem::Offset(gap));
            }
            if !word.is_empty() {
                items.push(TextItem::Text(word.to_owned()));
            }
        }
        items
    }
}

/// Greedily wrap `text` so that no line is wider than the printable width,
/// measured in `font`.
///
/// Existing line breaks are kept, and blank lines stay blank. Runs of spaces
/// collapse to one. A word too wide for a whole line is split across lines.
pub fn wrap_text(text: &str, layout: &PageLayout, font: &BodyFont) -> Vec<String> {
    let max_width = layout.printable_width();
    let space_width = font.advance(' ', layout.font_size);
    let mut lines = Vec::new();
    for paragraph in text.lines() {
        let mut current = String::new();
        let mut current_width = 0.0;
        for word in paragraph.split_whitespace() {
            let word_width = font.text_width(word, layout.font_size);
            if !current.is_empty() && current_width + space_width + word_width <= max_width {
                current.push(' ');
                current.push_str(word);
                current_width += space_width + word_width;
                continue;
            }
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
                current_width = 0.0;
            }
            if word_width <= max_width {
                current.push_str(word);
                current_width = word_width;
                continue;
            }
            for c in word.chars() {
                let char_width = font.advance(c, layout.font_size);
                if !current.is_empty() && current_width + char_width > max_width {
                    lines.push(std::mem::take(&mut current));
                    current_width = 0.0;
                }
                current.push(c);
                current_width += char_width;
            }
        }
        // An empty paragraph is a blank line.
        lines.push(current);
    }
    lines
}

/// Split wrapped lines into pages.
pub fn paginate(lines: Vec<String>, layout: &PageLayout) -> Vec<Vec<String>> {
    let lines_per_page = layout.lines_per_page();
    let mut pages = Vec::new();
    let mut lines = lines.into_iter().peekable();
    while lines.peek().is_some() {
        pages.push(lines.by_ref().take(lines_per_page).collect::<Vec<_>>());
    }
    pages
}

/// Draw one page of lines.
fn page_ops(
    page_lines: Vec<String>,
    layout: &PageLayout,
    font: &BodyFont,
    font_id: &FontId,
) -> Vec<Op> {
    let mut ops = Vec::new();
    for (line_idx, line) in page_lines.into_iter().enumerate() {
        if line.is_empty() {
            continue;
        }
        // Baselines run from the top margin downward.
        let y = layout.page_height.0
            - layout.margin.0
            - layout.font_size.0
            - line_idx as f32 * layout.leading.0;
        ops.push(Op::StartTextSection);
        ops.push(Op::SetTextCursor {
            pos: Point {
                x: layout.margin,
                y: Pt(y),
            },
        });
        ops.push(Op::SetFontSize {
            size: layout.font_size,
            font: font_id.clone(),
        });
        ops.push(Op::WriteText {
            items: font.text_items(&line),
            font: font_id.clone(),
        });
        ops.push(Op::EndTextSection);
    }
    ops
}

/// Render `text` as a complete PDF file. Empty text produces a single blank
/// page. Characters the body font cannot draw are replaced.
#[instrument(level = "debug", skip_all, fields(bytes = text.len()))]
pub fn render_pdf(text: &str, title: &str, layout: &PageLayout) -> Result<Vec<u8>> {
    let font = BodyFont::courier()?;
    let text = font.drawable_text(text);
    let (page_w, page_h) = layout.page_dimensions();
    let wrapped_lines = wrap_text(&text, layout, &font);
    let total_lines = wrapped_lines.len();

    let mut doc = PdfDocument::new(title);
    let font_id = doc.add_font(&font.font);
    let mut pages = paginate(wrapped_lines, layout)
        .into_iter()
        .map(|page_lines| {
            PdfPage::new(page_w, page_h, page_ops(page_lines, layout, &font, &font_id))
        })
        .collect::<Vec<_>>();
    if pages.is_empty() {
        pages.push(PdfPage::new(page_w, page_h, Vec::new()));
    }

    let page_count = pages.len();
    doc.with_pages(pages);
    debug!(total_lines, pages = page_count, "Text layout complete");

    let mut warnings: Vec<PdfWarnMsg> = Vec::new();
    let output = doc.save(&PdfSaveOptions::default(), &mut warnings);
    if !warnings.is_empty() {
        trace!(count = warnings.len(), "printpdf reported warnings");
    }
    Ok(output)
}

/// Write `data` to `path` all at once.
///
/// The data goes to a temporary file next to `path`, which is then renamed
/// over `path`. If anything fails, the temporary file is removed and `path`
/// is left untouched.
pub fn write_atomically(path: &Path, data: &[u8]) -> Result<(), PipelineError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".partial-")
        .suffix(".pdf")
        .tempfile_in(dir)
        .with_context(|| format!("cannot create temporary file in {:?}", dir.display()))
        .map_err(|err| PipelineError::write(path, err))?;
    tmp.write_all(data)
        .and_then(|()| tmp.as_file().sync_all())
        .context("cannot write temporary file")
        .map_err(|err| PipelineError::write(path, err))?;
    tmp.persist(path)
        .map_err(|err| PipelineError::write(path, err.error))?;
    Ok(())
}

/// Lay out `text` and write it as a new PDF at `output_path`, replacing any
/// existing file.
#[instrument(level = "debug", skip_all, fields(path = %output_path.display()))]
pub async fn write_text_pdf(
    text: &str,
    output_path: &Path,
    layout: &PageLayout,
) -> Result<(), PipelineError> {
    let text = text.to_owned();
    let output_path = output_path.to_owned();
    let layout = *layout;
    spawn_blocking_propagating_panics(move || {
        let title = output_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let pdf = render_pdf(&text, &title, &layout)
            .map_err(|err| PipelineError::write(&output_path, err))?;
        write_atomically(&output_path, &pdf)
    })
    .await
}
