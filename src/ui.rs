//! Terminal output: one progress bar over the input documents, with status
//! lines and log output printed above it.

use std::{io, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressFinish, ProgressStyle};

const DOCUMENT_PROGRESS_TEMPLATE: &str =
    "  📄 {msg:18} {pos:>4}/{len:4} {elapsed_precise} {wide_bar:.cyan/blue} {eta_precise}";

/// Shared handle to the terminal. Cheap to clone.
#[derive(Clone)]
pub struct Ui {
    bars: MultiProgress,
}

impl Ui {
    /// Set up the terminal UI. Call this before installing the log subscriber,
    /// so that logs can go through [`Ui::get_stderr_writer`].
    pub fn init() -> Ui {
        Ui {
            bars: MultiProgress::new(),
        }
    }

    /// A `stderr` writer for `tracing` which never draws over the progress bar.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter {
            bars: self.bars.clone(),
        }
    }

    /// Print `line` on standard output, above the progress bar.
    pub fn status_line(&self, line: &str) {
        self.bars.suspend(|| println!("{line}"));
    }

    /// Start a bar counting `count` documents.
    pub fn document_progress(&self, count: u64) -> ProgressBar {
        let style = ProgressStyle::with_template(DOCUMENT_PROGRESS_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        let pb = self.bars.add(ProgressBar::new(count).with_style(style));
        pb.set_message("Converting PDFs");
        pb.enable_steady_tick(Duration::from_millis(250));
        pb.with_finish(ProgressFinish::WithMessage("Converted PDFs".into()))
    }
}

/// Writes to `stderr` while the progress bar is hidden.
#[derive(Clone)]
pub struct SafeStderrWriter {
    bars: MultiProgress,
}

impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bars.suspend(|| io::stderr().write(buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        // One suspend per log line, not per partial write.
        self.bars.suspend(|| io::stderr().write_all(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.bars.suspend(|| io::stderr().flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
