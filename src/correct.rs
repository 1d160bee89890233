//! Clean up OCR output with an LLM.
//!
//! Correction is an enhancement. If anything goes wrong, callers get the raw
//! OCR text back unchanged.

use std::{fmt, time::Duration};

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, FinishReason,
    },
};
use clap::Args;
use tokio::time;

use crate::{errors::PipelineError, prelude::*};

/// The instruction placed in front of the raw text.
pub const CORRECTION_INSTRUCTION: &str = "Correct the following text:\n\n";

/// Options for the correction service.
#[derive(Args, Clone, Debug)]
pub struct CorrectionOpts {
    /// The model to use for text correction.
    #[clap(long, default_value = "gpt-3.5-turbo")]
    pub model: String,

    /// An upper limit on the number of completion tokens to generate. Longer
    /// documents will have their corrected text cut short by the model.
    #[clap(long, default_value = "2048")]
    pub max_completion_tokens: u32,

    /// A timeout, in seconds, for the LLM to return a complete response. On
    /// timeout, the uncorrected text is used.
    #[clap(long, default_value = "120")]
    pub timeout: u64,
}

impl CorrectionOpts {
    /// The timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for CorrectionOpts {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".to_owned(),
            max_completion_tokens: 2048,
            timeout: 120,
        }
    }
}

/// Build the prompt sent to the model.
pub fn correction_prompt(raw_text: &str) -> String {
    format!("{CORRECTION_INSTRUCTION}{raw_text}")
}

/// Interface to a text correction service.
#[async_trait]
pub trait TextCorrector: fmt::Debug + Send + Sync + 'static {
    /// Make a single correction request.
    async fn correct(&self, raw_text: &str) -> Result<String, PipelineError>;
}

/// Corrector using the "/chat/completions" endpoint of an OpenAI-compatible
/// API.
#[derive(Debug)]
pub struct OpenAiCorrector {
    client: Client<OpenAIConfig>,
    model: String,
    max_completion_tokens: u32,
}

impl OpenAiCorrector {
    /// Create a new corrector using an existing client.
    pub fn new(client: Client<OpenAIConfig>, opts: &CorrectionOpts) -> Self {
        Self {
            client,
            model: opts.model.clone(),
            max_completion_tokens: opts.max_completion_tokens,
        }
    }
}

#[async_trait]
impl TextCorrector for OpenAiCorrector {
    #[instrument(level = "debug", skip_all, fields(model = %self.model, bytes = raw_text.len()))]
    async fn correct(&self, raw_text: &str) -> Result<String, PipelineError> {
        let service_error = |err: async_openai::error::OpenAIError| {
            PipelineError::CorrectionService(err.to_string())
        };

        let message: ChatCompletionRequestMessage =
            ChatCompletionRequestUserMessageArgs::default()
                .content(correction_prompt(raw_text))
                .build()
                .map_err(service_error)?
                .into();
        let req = CreateChatCompletionRequestArgs::default()
            .model(self.model.clone())
            .messages(vec![message])
            .max_completion_tokens(self.max_completion_tokens)
            .build()
            .map_err(service_error)?;
        trace!(?req, "Request");

        let response = self
            .client
            .chat()
            .create(req)
            .await
            .map_err(service_error)?;
        if let Some(usage) = &response.usage {
            debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Token usage"
            );
        }

        let choice = response.choices.first().ok_or_else(|| {
            PipelineError::CorrectionService("no choices in response".to_owned())
        })?;
        if choice.finish_reason == Some(FinishReason::ContentFilter) {
            return Err(PipelineError::CorrectionService(
                "content filter triggered".to_owned(),
            ));
        }
        if choice.finish_reason == Some(FinishReason::Length) {
            warn!("Corrected text was cut short by --max-completion-tokens");
        }
        Ok(choice
            .message
            .content
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_owned())
    }
}

/// Correct `raw_text`, waiting at most `timeout`. On any failure, including
/// an empty response, return `raw_text` unchanged.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn correct_or_fallback(
    corrector: &dyn TextCorrector,
    path: &Path,
    raw_text: &str,
    timeout: Duration,
) -> String {
    let result = match time::timeout(timeout, corrector.correct(raw_text)).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::CorrectionService(format!(
            "request timed out after {}s",
            timeout.as_secs_f32()
        ))),
    };
    let result = result.and_then(|corrected| {
        if corrected.trim().is_empty() && !raw_text.trim().is_empty() {
            Err(PipelineError::CorrectionService(
                "empty response".to_owned(),
            ))
        } else {
            Ok(corrected)
        }
    });
    match result {
        Ok(corrected) => corrected,
        Err(err) => {
            warn!(
                path = %path.display(),
                "Error during text correction, using uncorrected text: {}",
                err
            );
            raw_text.to_owned()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use tokio::{
        io::{AsyncReadExt as _, AsyncWriteExt as _},
        net::{TcpListener, TcpStream},
    };

    use super::*;

    /// A corrector that upper-cases its input.
    #[derive(Debug)]
    pub(crate) struct UppercaseCorrector;

    #[async_trait]
    impl TextCorrector for UppercaseCorrector {
        async fn correct(&self, raw_text: &str) -> Result<String, PipelineError> {
            Ok(raw_text.to_uppercase())
        }
    }

    /// A corrector whose service is always down.
    #[derive(Debug)]
    pub(crate) struct UnreachableCorrector;

    #[async_trait]
    impl TextCorrector for UnreachableCorrector {
        async fn correct(&self, _raw_text: &str) -> Result<String, PipelineError> {
            Err(PipelineError::CorrectionService(
                "connection refused".to_owned(),
            ))
        }
    }

    /// A corrector that never answers in time.
    #[derive(Debug)]
    struct SlowCorrector;

    #[async_trait]
    impl TextCorrector for SlowCorrector {
        async fn correct(&self, raw_text: &str) -> Result<String, PipelineError> {
            time::sleep(Duration::from_secs(30)).await;
            Ok(raw_text.to_uppercase())
        }
    }

    /// A corrector that answers with nothing.
    #[derive(Debug)]
    struct BlankCorrector;

    #[async_trait]
    impl TextCorrector for BlankCorrector {
        async fn correct(&self, _raw_text: &str) -> Result<String, PipelineError> {
            Ok("  \n".to_owned())
        }
    }

    const RAW: &str = "Tbe qu1ck brown f0x\n\nsecond page\n";

    #[test]
    fn prompt_starts_with_instruction() {
        let prompt = correction_prompt("hello");
        assert_eq!(prompt, "Correct the following text:\n\nhello");
    }

    #[tokio::test]
    async fn uses_corrected_text_on_success() {
        let text = correct_or_fallback(
            &UppercaseCorrector,
            Path::new("scan.pdf"),
            RAW,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(text, RAW.to_uppercase());
    }

    #[tokio::test]
    async fn falls_back_to_raw_text_when_service_is_down() {
        let text = correct_or_fallback(
            &UnreachableCorrector,
            Path::new("scan.pdf"),
            RAW,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(text.as_bytes(), RAW.as_bytes());
    }

    #[tokio::test]
    async fn falls_back_to_raw_text_on_timeout() {
        let text = correct_or_fallback(
            &SlowCorrector,
            Path::new("scan.pdf"),
            RAW,
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(text, RAW);
    }

    #[tokio::test]
    async fn falls_back_to_raw_text_on_empty_response() {
        let text = correct_or_fallback(
            &BlankCorrector,
            Path::new("scan.pdf"),
            RAW,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(text, RAW);
    }

    #[tokio::test]
    async fn unreachable_server_is_a_correction_error() {
        let client = crate::llm_client::create_llm_client(
            "sk-1234",
            Some("http://127.0.0.1:9/v1"),
        );
        let corrector = OpenAiCorrector::new(client, &CorrectionOpts::default());
        let err = corrector.correct("hello").await.unwrap_err();
        assert!(matches!(err, PipelineError::CorrectionService(_)));
    }

    /// Answer every HTTP request with a 500, counting requests.
    async fn spawn_failing_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let server_hits = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                read_request(&mut stream).await;
                server_hits.fetch_add(1, Ordering::SeqCst);
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 500 Internal Server Error\r\n\
                          Content-Length: 4\r\nConnection: close\r\n\r\nboom",
                    )
                    .await;
                let _ = stream.shutdown().await;
            }
        });
        (format!("http://{addr}/v1"), hits)
    }

    /// Read the request headers and body, so that closing the connection
    /// doesn't reset it.
    async fn read_request(stream: &mut TcpStream) {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= header_end + 4 + content_length {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn server_errors_are_not_retried() {
        let (api_base, hits) = spawn_failing_server().await;
        let client = crate::llm_client::create_llm_client("sk-1234", Some(&api_base));
        let corrector = OpenAiCorrector::new(client, &CorrectionOpts::default());

        let err = time::timeout(Duration::from_secs(10), corrector.correct("hello"))
            .await
            .expect("a failed request should return at once")
            .unwrap_err();
        assert!(matches!(err, PipelineError::CorrectionService(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let text = correct_or_fallback(
            &corrector,
            Path::new("scan.pdf"),
            RAW,
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(text, RAW);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
