//! Ingestion workers for an open serial link.
//!
//! ```text
//!  read half ──► reader task ──► mpsc queue ──► consumer task ──► LineHandler
//!                                  ▲
//!                     QueueMessage::Close (drain)
//! ```
//!
//! The reader owns the read half outright, so a blocked read never holds the
//! controller lock that command writes need. The queue is FIFO with a single
//! producer and a single consumer, which keeps classification in arrival order.

use crate::telemetry::split_lines;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Element of the ingestion queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueMessage {
    /// One raw read, possibly holding several logical lines
    Line(String),
    /// Stop consuming once everything queued before this is handled
    Close,
}

/// Receives classified-ready lines from the consumer task.
#[async_trait]
pub trait LineHandler: Send + Sync + 'static {
    /// Whether lines should be dispatched right now.
    fn accepting(&self) -> bool;

    /// Classify and store one logical line.
    async fn handle_line(&self, line: &str);
}

/// Write `line` plus a newline terminator, then flush.
pub async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Worker timing taken from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct LinkTiming {
    /// Back-off after EOF or a read error
    pub read_retry: Duration,
    /// Consumer wake-up interval while the queue is empty
    pub queue_poll: Duration,
}

/// Running reader and consumer tasks for one open link.
#[derive(Debug)]
pub struct LinkWorkers {
    queue: mpsc::UnboundedSender<QueueMessage>,
    shutdown: watch::Sender<bool>,
    reader: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl LinkWorkers {
    /// Start the reader on `read_half` and the consumer feeding `handler`.
    pub fn spawn<R, H>(read_half: R, handler: Arc<H>, timing: LinkTiming) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        H: LineHandler,
    {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reader = tokio::spawn(read_loop(
            read_half,
            queue_tx.clone(),
            shutdown_rx.clone(),
            timing.read_retry,
        ));
        let consumer = tokio::spawn(consume_loop(
            queue_rx,
            shutdown_rx,
            timing.queue_poll,
            handler,
        ));

        Self {
            queue: queue_tx,
            shutdown: shutdown_tx,
            reader: Some(reader),
            consumer: Some(consumer),
        }
    }

    /// Let the consumer finish everything already queued, then wait for it.
    pub async fn drain(&mut self, join_timeout: Duration) {
        let _ = self.queue.send(QueueMessage::Close);
        if let Some(consumer) = self.consumer.take() {
            join_bounded("consumer", consumer, join_timeout).await;
        }
    }

    /// Stop both workers.
    pub async fn shutdown(mut self, join_timeout: Duration) {
        let _ = self.shutdown.send(true);
        self.drain(join_timeout).await;
        if let Some(reader) = self.reader.take() {
            join_bounded("reader", reader, join_timeout).await;
        }
    }
}

async fn join_bounded(worker: &'static str, mut handle: JoinHandle<()>, limit: Duration) {
    match timeout(limit, &mut handle).await {
        Ok(Ok(())) => debug!(worker, "Link worker stopped"),
        Ok(Err(e)) => warn!(worker, error = %e, "Link worker ended abnormally"),
        Err(_) => {
            warn!(worker, ?limit, "Link worker did not stop in time, aborting");
            handle.abort();
        }
    }
}

async fn read_loop<R>(
    read_half: R,
    queue: mpsc::UnboundedSender<QueueMessage>,
    mut shutdown: watch::Receiver<bool>,
    retry: Duration,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(read_half);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let retry_needed = tokio::select! {
            _ = shutdown.changed() => break,
            result = next_line(&mut reader) => match result {
                Ok(Some(line)) => {
                    if queue.send(QueueMessage::Line(line)).is_err() {
                        break;
                    }
                    false
                }
                Ok(None) => {
                    debug!("Serial link reached end of input");
                    true
                }
                Err(e) => {
                    warn!(error = %e, "Serial read failed");
                    true
                }
            },
        };

        if retry_needed {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(retry) => {}
            }
        }
    }
    info!("Serial reader stopped");
}

/// One newline-terminated read, `None` at end of input.
async fn next_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Option<String>> {
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }
    // Invalid UTF-8 is replaced, never fatal
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

async fn consume_loop<H: LineHandler>(
    mut queue: mpsc::UnboundedReceiver<QueueMessage>,
    shutdown: watch::Receiver<bool>,
    poll: Duration,
    handler: Arc<H>,
) {
    loop {
        match timeout(poll, queue.recv()).await {
            Ok(Some(QueueMessage::Line(raw))) => {
                if !handler.accepting() {
                    continue;
                }
                for line in split_lines(&raw).filter(|l| !l.is_empty()) {
                    handler.handle_line(line).await;
                }
            }
            Ok(Some(QueueMessage::Close)) | Ok(None) => break,
            Err(_) => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Queue consumer stopped");
}
