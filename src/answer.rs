//! Answer synthesis.
//!
//! [`build_prompt`] assembles the question and the retrieved artifacts into
//! one prompt. [`spawn_answer`] pumps a generator stream through a bounded
//! channel into an [`AnswerStream`] the caller consumes at its own pace.
//!
//! An [`AnswerStream`] ends in exactly one of two ways:
//!
//! - `None` after the last fragment: the answer is complete.
//! - an `Err` item carrying [`Error::Stream`], then `None`: generation
//!   failed part way. The same happens if the producer disappears without
//!   reporting completion.
//!
//! Dropping the stream cancels the producer task, which drops the upstream
//! response.

use anyhow::Result;
use futures_util::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::Error;
use crate::llm::{Generator, TextStream};
use crate::models::RetrievedArtifact;

const CHANNEL_CAPACITY: usize = 32;

pub fn build_prompt(question: &str, context: &[RetrievedArtifact]) -> String {
    let mut prompt = String::from(
        "You are a code assistant that knows this repository well. Answer the \
question using the files below. Be precise and technical, point to the files \
that matter, and suggest concrete changes when the question asks for them. \
If the files do not contain the answer, say so instead of guessing.\n\n",
    );

    prompt.push_str("BEGIN CONTEXT\n");
    for artifact in context {
        prompt.push_str(&format!(
            "file: {}\nsummary: {}\nsource:\n{}\n\n",
            artifact.path, artifact.summary, artifact.source
        ));
    }
    prompt.push_str("END CONTEXT\n\n");

    prompt.push_str("BEGIN QUESTION\n");
    prompt.push_str(question.trim());
    prompt.push_str("\nEND QUESTION\n");
    prompt
}

enum Frame {
    Chunk(String),
    Done,
    Failed(String),
}

/// Ordered answer fragments. Finite and not restartable.
pub struct AnswerStream {
    rx: mpsc::Receiver<Frame>,
    finished: bool,
    _cancel_on_drop: DropGuard,
}

impl Stream for AnswerStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        let frame = match self.rx.poll_recv(cx) {
            Poll::Ready(frame) => frame,
            Poll::Pending => return Poll::Pending,
        };

        match frame {
            Some(Frame::Chunk(text)) => Poll::Ready(Some(Ok(text))),
            Some(Frame::Done) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Some(Frame::Failed(message)) => {
                self.finished = true;
                Poll::Ready(Some(Err(Error::Stream(message).into())))
            }
            None => {
                self.finished = true;
                let err = Error::Stream("answer ended without completing".to_string());
                Poll::Ready(Some(Err(err.into())))
            }
        }
    }
}

/// Open a generation stream for `prompt` and hand it to a producer task.
pub async fn stream_answer(generator: &dyn Generator, prompt: &str) -> Result<AnswerStream> {
    let upstream = generator.generate_stream(prompt).await?;
    Ok(spawn_answer(upstream))
}

/// Move `upstream` into a producer task and return the consuming end.
pub fn spawn_answer(upstream: TextStream) -> AnswerStream {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        tokio::select! {
            biased;
            () = token.cancelled() => tracing::debug!("answer stream dropped by consumer"),
            () = pump(upstream, &tx) => {}
        }
    });

    AnswerStream {
        rx,
        finished: false,
        _cancel_on_drop: cancel.drop_guard(),
    }
}

async fn pump(mut upstream: TextStream, tx: &mpsc::Sender<Frame>) {
    while let Some(item) = upstream.next().await {
        let frame = match item {
            Ok(text) => Frame::Chunk(text),
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "answer generation failed");
                let _ = tx.send(Frame::Failed(format!("{:#}", e))).await;
                return;
            }
        };
        if tx.send(frame).await.is_err() {
            return;
        }
    }
    let _ = tx.send(Frame::Done).await;
}

/// Drain an answer into one string, failing if the stream failed.
pub async fn collect_answer(mut stream: AnswerStream) -> Result<String> {
    let mut answer = String::new();
    while let Some(fragment) = stream.next().await {
        answer.push_str(&fragment?);
    }
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn fragments(items: Vec<Result<String>>) -> TextStream {
        Box::pin(stream::iter(items))
    }

    #[test]
    fn test_prompt_contains_context_and_question() {
        let context = vec![RetrievedArtifact {
            path: "src/auth.rs".into(),
            source: "fn login() {}".into(),
            summary: "Handles login.".into(),
            similarity: 0.9,
        }];
        let prompt = build_prompt("  where is login?  ", &context);
        assert!(prompt.contains("file: src/auth.rs"));
        assert!(prompt.contains("fn login() {}"));
        assert!(prompt.contains("Handles login."));
        assert!(prompt.contains("BEGIN QUESTION\nwhere is login?\nEND QUESTION"));
    }

    #[tokio::test]
    async fn test_fragments_arrive_in_order() {
        let answer = spawn_answer(fragments(vec![
            Ok("The ".into()),
            Ok("answer".into()),
            Ok(".".into()),
        ]));
        assert_eq!(collect_answer(answer).await.unwrap(), "The answer.");
    }

    #[tokio::test]
    async fn test_mid_stream_failure_is_distinguishable() {
        let mut answer = spawn_answer(fragments(vec![
            Ok("partial".into()),
            Err(anyhow::anyhow!("connection reset")),
        ]));
        assert_eq!(answer.next().await.unwrap().unwrap(), "partial");
        let err = answer.next().await.unwrap().unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(Error::Stream(_))));
        assert!(answer.next().await.is_none());
    }

    #[tokio::test]
    async fn test_vanished_producer_is_a_failure() {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let mut answer = AnswerStream {
            rx,
            finished: false,
            _cancel_on_drop: CancellationToken::new().drop_guard(),
        };
        assert!(answer.next().await.unwrap().is_err());
        assert!(answer.next().await.is_none());
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_upstream() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(released.clone());
        let upstream: TextStream = Box::pin(
            stream::iter(vec![Ok::<_, anyhow::Error>("first".to_string())])
                .chain(stream::pending())
                .map(move |item| {
                    let _ = &flag;
                    item
                }),
        );

        let mut answer = spawn_answer(upstream);
        assert_eq!(answer.next().await.unwrap().unwrap(), "first");
        drop(answer);

        for _ in 0..100 {
            if released.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released.load(Ordering::SeqCst));
    }
}
