//! Text generation service.
//!
//! [`Generator`] produces either a complete string (summaries) or a stream
//! of text fragments (answers). Two backends:
//!
//! - **[`OpenAIGenerator`]**: `POST {url}/v1/chat/completions`, streamed as
//!   server-sent events terminated by `data: [DONE]`.
//! - **[`OllamaGenerator`]**: `POST {url}/api/chat`, streamed as
//!   newline-delimited JSON terminated by `"done": true`.
//!
//! A stream that ends without its terminal marker yields [`Error::Stream`]
//! as its last item, so a truncated answer is never mistaken for a
//! complete one.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::error::Error;
use crate::retry::{with_retry, RetryPolicy};

pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;
    /// Complete a prompt in one shot.
    async fn generate(&self, prompt: &str) -> Result<String>;
    /// Complete a prompt as an ordered stream of fragments.
    async fn generate_stream(&self, prompt: &str) -> Result<TextStream>;
}

pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    stream_timeout: Duration,
    retry: RetryPolicy,
}

impl HttpBackend {
    fn new(config: &GenerationConfig, default_url: &str, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| default_url.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            api_key,
            timeout: Duration::from_secs(config.timeout_secs),
            stream_timeout: Duration::from_secs(config.stream_timeout_secs),
            retry: config.retry_policy(),
        })
    }

    /// POST a JSON body; a non-2xx status becomes [`Error::Upstream`].
    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .timeout(timeout)
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::upstream("generation", None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::upstream("generation", Some(status.as_u16()), text).into());
        }
        Ok(response)
    }

    async fn complete<T, F>(&self, label: &str, path: &str, body: serde_json::Value, extract: F) -> Result<String>
    where
        T: serde::de::DeserializeOwned,
        F: Fn(T) -> Option<String>,
    {
        with_retry(self.retry, label, || async {
            let response = self.post(path, &body, self.timeout).await?;
            let parsed: T = response
                .json()
                .await
                .map_err(|e| Error::upstream("generation", None, e.to_string()))?;
            Ok(parsed)
        })
        .await
        .and_then(|parsed| extract(parsed).ok_or_else(|| anyhow!("{}: response carried no text", label)))
    }

    /// Open a streamed completion. Only establishing the connection is
    /// retried; once fragments flow, a failure ends the stream.
    async fn open_stream(
        &self,
        label: &str,
        path: &str,
        body: serde_json::Value,
        parse: fn(&str) -> Result<Frame>,
    ) -> Result<TextStream> {
        let response = with_retry(self.retry, label, || {
            self.post(path, &body, self.stream_timeout)
        })
        .await?;
        Ok(frames(response.bytes_stream(), parse))
    }
}

/// One parsed line of a streamed completion.
#[derive(Debug, PartialEq)]
enum Frame {
    Delta(String),
    Done,
    Skip,
}

/// Split a byte stream into lines and parse each into fragments, ending at
/// the terminal frame. Bytes are buffered until a full line arrives so a
/// multi-byte character split across chunks decodes intact.
fn frames<S, B>(byte_stream: S, parse: fn(&str) -> Result<Frame>) -> TextStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = (Box::pin(byte_stream.fuse()), Vec::<u8>::new(), false);
    let stream = futures_util::stream::unfold(state, move |(mut inner, mut buffer, finished)| async move {
        if finished {
            return None;
        }
        loop {
            if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                match parse(line.trim()) {
                    Ok(Frame::Delta(text)) => return Some((Ok(text), (inner, buffer, false))),
                    Ok(Frame::Done) => return None,
                    Ok(Frame::Skip) => continue,
                    Err(e) => return Some((Err(e), (inner, buffer, true))),
                }
            }

            match inner.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    let err = Error::Stream(format!("read error: {}", e));
                    return Some((Err(err.into()), (inner, buffer, true)));
                }
                None => {
                    if buffer.iter().any(|b| !b.is_ascii_whitespace()) {
                        // flush a final unterminated line
                        buffer.push(b'\n');
                        continue;
                    }
                    let err = Error::Stream("response ended before completion".to_string());
                    return Some((Err(err.into()), (inner, buffer, true)));
                }
            }
        }
    });
    Box::pin(stream)
}

// ============ OpenAI ============

pub struct OpenAIGenerator {
    backend: HttpBackend,
}

impl OpenAIGenerator {
    /// Requires an API key in the environment variable named by
    /// `generation.api_key_env`.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow!("{} environment variable not set", config.api_key_env))?;
        Ok(Self {
            backend: HttpBackend::new(config, "https://api.openai.com", Some(api_key))?,
        })
    }

    fn body(&self, prompt: &str, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.backend.model,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": stream,
        })
    }
}

#[derive(Deserialize)]
struct OpenAICompletion {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIStreamChunk {
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
}

#[derive(Deserialize)]
struct OpenAIStreamDelta {
    content: Option<String>,
}

/// Parse one SSE line. Comments, `event:` lines and role-only chunks are
/// skipped; `data: [DONE]` ends the stream.
fn parse_openai_line(line: &str) -> Result<Frame> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(Frame::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(Frame::Done);
    }

    let chunk: OpenAIStreamChunk = serde_json::from_str(data)
        .map_err(|e| Error::Stream(format!("malformed OpenAI chunk: {}", e)))?;
    match chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
        Some(content) if !content.is_empty() => Ok(Frame::Delta(content)),
        _ => Ok(Frame::Skip),
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.backend.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        self.backend
            .complete(
                "openai completion",
                "/v1/chat/completions",
                self.body(prompt, false),
                |c: OpenAICompletion| c.choices.into_iter().next().and_then(|ch| ch.message.content),
            )
            .await
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TextStream> {
        self.backend
            .open_stream(
                "openai stream",
                "/v1/chat/completions",
                self.body(prompt, true),
                parse_openai_line,
            )
            .await
    }
}

// ============ Ollama ============

pub struct OllamaGenerator {
    backend: HttpBackend,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            backend: HttpBackend::new(config, "http://localhost:11434", None)?,
        })
    }

    fn body(&self, prompt: &str, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.backend.model,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": stream,
        })
    }
}

#[derive(Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

fn parse_ollama_line(line: &str) -> Result<Frame> {
    if line.is_empty() {
        return Ok(Frame::Skip);
    }
    let chunk: OllamaChunk = serde_json::from_str(line)
        .map_err(|e| Error::Stream(format!("malformed Ollama chunk: {}", e)))?;
    if let Some(error) = chunk.error {
        return Err(Error::Stream(error).into());
    }
    if chunk.done {
        return Ok(Frame::Done);
    }
    match chunk.message {
        Some(message) if !message.content.is_empty() => Ok(Frame::Delta(message.content)),
        _ => Ok(Frame::Skip),
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.backend.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        self.backend
            .complete(
                "ollama chat",
                "/api/chat",
                self.body(prompt, false),
                |c: OllamaChunk| c.message.map(|m| m.content),
            )
            .await
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TextStream> {
        self.backend
            .open_stream("ollama stream", "/api/chat", self.body(prompt, true), parse_ollama_line)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ollama(server: &MockServer) -> OllamaGenerator {
        let config = GenerationConfig {
            provider: "ollama".to_string(),
            model: "llama3".to_string(),
            url: Some(server.uri()),
            max_retries: 0,
            ..Default::default()
        };
        OllamaGenerator::new(&config).unwrap()
    }

    async fn drain(mut stream: TextStream) -> (String, Option<anyhow::Error>) {
        let mut text = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(fragment) => text.push_str(&fragment),
                Err(e) => return (text, Some(e)),
            }
        }
        (text, None)
    }

    #[test]
    fn test_parse_openai_lines() {
        assert_eq!(
            parse_openai_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap(),
            Frame::Delta("Hi".to_string())
        );
        assert_eq!(parse_openai_line("data: [DONE]").unwrap(), Frame::Done);
        assert_eq!(
            parse_openai_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            Frame::Skip
        );
        assert_eq!(parse_openai_line(": keep-alive").unwrap(), Frame::Skip);
        assert!(parse_openai_line("data: {broken").is_err());
    }

    #[test]
    fn test_parse_ollama_lines() {
        assert_eq!(
            parse_ollama_line(r#"{"message":{"role":"assistant","content":"The"},"done":false}"#)
                .unwrap(),
            Frame::Delta("The".to_string())
        );
        assert_eq!(
            parse_ollama_line(r#"{"message":{"role":"assistant","content":""},"done":true}"#)
                .unwrap(),
            Frame::Done
        );
        assert!(parse_ollama_line(r#"{"error":"model not found"}"#).is_err());
    }

    #[tokio::test]
    async fn test_frames_reassemble_split_lines() {
        let chunks: Vec<reqwest::Result<Vec<u8>>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"caf".to_vec()),
            Ok("\u{e9}\"}}]}\n\ndata: [DONE]\n".as_bytes().to_vec()),
        ];
        let stream = frames(futures_util::stream::iter(chunks), parse_openai_line);
        let (text, err) = drain(stream).await;
        assert_eq!(text, "caf\u{e9}");
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_frames_error_without_terminator() {
        let chunks: Vec<reqwest::Result<Vec<u8>>> = vec![Ok(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n".to_vec(),
        )];
        let stream = frames(futures_util::stream::iter(chunks), parse_openai_line);
        let (text, err) = drain(stream).await;
        assert_eq!(text, "partial");
        let err = err.expect("truncated stream must fail");
        assert!(matches!(crate::error::classify(&err), Some(Error::Stream(_))));
    }

    #[tokio::test]
    async fn test_ollama_stream_end_to_end() {
        let server = MockServer::start().await;
        let body = concat!(
            r#"{"message":{"role":"assistant","content":"Hello"},"done":false}"#,
            "\n",
            r#"{"message":{"role":"assistant","content":", world"},"done":false}"#,
            "\n",
            r#"{"message":{"role":"assistant","content":""},"done":true}"#,
            "\n"
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let stream = ollama(&server).generate_stream("hi").await.unwrap();
        let (text, err) = drain(stream).await;
        assert_eq!(text, "Hello, world");
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_ollama_generate_one_shot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": { "role": "assistant", "content": "A short summary." },
                "done": true
            })))
            .mount(&server)
            .await;

        let text = ollama(&server).generate("summarize").await.unwrap();
        assert_eq!(text, "A short summary.");
    }

    #[tokio::test]
    async fn test_server_error_is_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = match ollama(&server).generate_stream("hi").await {
            Ok(_) => panic!("expected failure"),
            Err(e) => e,
        };
        assert!(matches!(
            crate::error::classify(&err),
            Some(Error::Upstream { status: Some(503), .. })
        ));
    }
}
