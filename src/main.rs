use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod correct;
mod errors;
mod llm_client;
mod ocr;
mod pipeline;
mod prelude;
mod rasterize;
mod searchable;
mod synthesize;
mod ui;

/// Turn scanned PDFs into searchable PDFs.
///
/// Each page is rendered with Poppler, read with Tesseract, cleaned up by an
/// LLM, and written out again as plain text in a new PDF.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OPENAI_API_KEY: The OpenAI key to use. Required by `convert`.
  - OPENAI_API_BASE (optional): Override the server URL.

  These variables may be set in a standard `.env` file.

External Tools:
  - `pdfinfo`, `pdftocairo` and `pdftotext` from poppler-utils.
  - `tesseract`, with data for the requested language.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Convert every PDF in a directory into a searchable PDF.
    Convert(cmd::convert::ConvertOpts),
    /// Report whether PDFs already contain text.
    Check(cmd::check::CheckOpts),
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Convert(opts) => {
            cmd::convert::cmd_convert(ui, opts).await?;
        }
        Cmd::Check(opts) => {
            cmd::check::cmd_check(ui, opts).await?;
        }
    }
    Ok(())
}
