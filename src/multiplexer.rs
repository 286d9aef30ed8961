use crate::models::{Origin, OutputChunk, Trigger};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Duration, Instant};

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Best-effort UTF-8 decoding of a byte stream delivered in arbitrary pieces.
///
/// An incomplete multi-byte sequence at the end of one read is held back and
/// completed by the next; genuinely invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut decoded = String::with_capacity(self.pending.len());
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(error) => {
                    let valid = error.valid_up_to();
                    decoded.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match error.error_len() {
                        Some(invalid) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        decoded
    }

    /// Whatever is still held back once the stream ended.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// Aggregated text of one origin, capped at `max_bytes` by dropping the oldest text.
#[derive(Debug)]
pub struct CaptureBuffer {
    text: String,
    max_bytes: usize,
    trimmed_bytes: usize,
}

impl CaptureBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            text: String::new(),
            max_bytes: max_bytes.max(1),
            trimmed_bytes: 0,
        }
    }

    /// Appends `chunk` and returns how many bytes were trimmed to stay in bounds.
    pub fn push(&mut self, chunk: &str) -> usize {
        self.text.push_str(chunk);
        if self.text.len() <= self.max_bytes {
            return 0;
        }
        let mut cut = self.text.len() - self.max_bytes;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
        self.trimmed_bytes = self.trimmed_bytes.saturating_add(cut);
        cut
    }

    pub fn trimmed_bytes(&self) -> usize {
        self.trimmed_bytes
    }

    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }
}

/// How standard input is used for one invocation. Eager and trigger-based
/// writes are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputPlan {
    Closed,
    Eager(String),
    OnTrigger { trigger: Trigger, payload: String },
}

impl InputPlan {
    pub fn new(payload: Option<String>, trigger: Option<Trigger>) -> Self {
        match (payload, trigger) {
            (payload, Some(trigger)) => Self::OnTrigger {
                trigger,
                payload: payload.unwrap_or_default(),
            },
            (Some(payload), None) => Self::Eager(payload),
            (None, None) => Self::Closed,
        }
    }

    pub fn needs_pipe(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

type StdinWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The child's standard input, written at most once and then closed.
#[derive(Clone)]
pub struct StdinSlot {
    inner: Arc<Mutex<Option<StdinWriter>>>,
}

impl StdinSlot {
    pub fn new<W>(writer: Option<W>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(writer.map(|w| Box::new(w) as StdinWriter))),
        }
    }

    pub fn closed() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// Writes `payload` and closes the pipe. Returns false when input was
    /// already delivered or closed.
    pub async fn deliver(&self, invocation: &str, payload: &str) -> bool {
        let writer = self.inner.lock().await.take();
        let Some(mut writer) = writer else {
            return false;
        };
        let written: std::io::Result<()> = async {
            writer.write_all(payload.as_bytes()).await?;
            writer.flush().await?;
            writer.shutdown().await
        }
        .await;
        match written {
            Ok(()) => tracing::debug!(invocation, bytes = payload.len(), "stdin payload delivered"),
            Err(error) if error.kind() == std::io::ErrorKind::BrokenPipe => {
                tracing::debug!(invocation, "child closed stdin before payload was written")
            }
            Err(error) => tracing::warn!(invocation, error = %error, "failed to write stdin payload"),
        }
        true
    }

    pub async fn close(&self) {
        let writer = self.inner.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }
}

/// Scans one origin for a substring, remembering enough of the previous
/// chunk to catch a match split across reads. Fires once.
#[derive(Debug, Clone)]
pub struct TriggerWatch {
    match_text: String,
    carry: String,
    fired: bool,
}

impl TriggerWatch {
    pub fn new(match_text: impl Into<String>) -> Self {
        Self {
            match_text: match_text.into(),
            carry: String::new(),
            fired: false,
        }
    }

    pub fn fired(&self) -> bool {
        self.fired
    }

    pub fn observe(&mut self, text: &str) -> bool {
        if self.fired {
            return false;
        }
        let mut window = std::mem::take(&mut self.carry);
        window.push_str(text);
        if window.contains(self.match_text.as_str()) {
            self.fired = true;
            return true;
        }
        let keep = self.match_text.len().saturating_sub(1);
        let mut start = window.len().saturating_sub(keep);
        while !window.is_char_boundary(start) {
            start += 1;
        }
        self.carry = window.split_off(start);
        false
    }
}

struct TriggerDelivery {
    watch: TriggerWatch,
    slot: StdinSlot,
    payload: String,
    task: Option<JoinHandle<()>>,
}

struct Reader {
    invocation: String,
    origin: Origin,
    capture: Arc<StdMutex<CaptureBuffer>>,
    hand_off: Option<mpsc::UnboundedSender<OutputChunk>>,
    trigger: Option<TriggerDelivery>,
    bytes_read: u64,
}

impl Reader {
    async fn drain<R>(mut self, mut stream: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = vec![0_u8; READ_CHUNK_BYTES];
        let mut decoder = ChunkDecoder::default();
        loop {
            let size = match stream.read(&mut buffer).await {
                Ok(0) => break,
                Ok(size) => size,
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    tracing::warn!(
                        invocation = %self.invocation,
                        stream = self.origin.as_str(),
                        error = %error,
                        "read failed, stopping reader"
                    );
                    break;
                }
            };
            self.bytes_read = self.bytes_read.saturating_add(size as u64);
            let text = decoder.decode(&buffer[..size]);
            if !text.is_empty() {
                self.accept(text);
            }
        }
        let tail = decoder.finish();
        if !tail.is_empty() {
            self.accept(tail);
        }
        drop(stream);

        tracing::debug!(
            invocation = %self.invocation,
            stream = self.origin.as_str(),
            bytes = self.bytes_read,
            "reader reached end of stream"
        );

        if let Some(task) = self.trigger.as_mut().and_then(|trigger| trigger.task.take()) {
            let _ = task.await;
        }
    }

    fn accept(&mut self, text: String) {
        let trimmed = self
            .capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(&text);
        if trimmed > 0 {
            tracing::warn!(
                invocation = %self.invocation,
                stream = self.origin.as_str(),
                bytes = trimmed,
                "captured output exceeded limit, oldest text trimmed"
            );
        }

        if let Some(trigger) = self.trigger.as_mut() {
            if trigger.watch.observe(&text) {
                tracing::info!(
                    invocation = %self.invocation,
                    stream = self.origin.as_str(),
                    "input trigger matched"
                );
                let slot = trigger.slot.clone();
                let payload = trigger.payload.clone();
                let invocation = self.invocation.clone();
                trigger.task = Some(tokio::spawn(async move {
                    slot.deliver(&invocation, &payload).await;
                }));
            }
        }

        let chunk = OutputChunk {
            origin: self.origin,
            text,
        };
        if let Some(hand_off) = &self.hand_off {
            if hand_off.send(chunk).is_err() {
                self.hand_off = None;
            }
        }
    }
}

/// Moves chunks from the readers to the consumer's bounded channel. The
/// readers never wait on the consumer, so a slow one cannot stall draining.
///
/// Blocks on a full channel only until cancellation is requested; after
/// that chunks that do not fit are dropped from the live stream.
async fn relay(
    invocation: String,
    mut pending: mpsc::UnboundedReceiver<OutputChunk>,
    sender: mpsc::Sender<OutputChunk>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut dropped = 0_usize;
    while let Some(chunk) = pending.recv().await {
        if *cancel.borrow() {
            match sender.try_send(chunk) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => dropped += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
            continue;
        }
        let closed = tokio::select! {
            biased;
            sent = sender.send(chunk) => sent.is_err(),
            _ = cancel_requested(&mut cancel) => false,
        };
        if closed {
            tracing::debug!(invocation = %invocation, "chunk consumer dropped, continuing to drain");
            break;
        }
    }
    if dropped > 0 {
        tracing::debug!(invocation = %invocation, dropped, "live chunks dropped after cancellation");
    }
}

async fn cancel_requested(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Concurrent draining of a child's two output streams plus stdin delivery.
pub struct StreamMultiplexer {
    invocation: String,
    sender: Option<mpsc::Sender<OutputChunk>>,
    cancel: watch::Receiver<bool>,
    max_captured_bytes: usize,
}

impl StreamMultiplexer {
    pub fn new(
        invocation: impl Into<String>,
        sender: Option<mpsc::Sender<OutputChunk>>,
        cancel: watch::Receiver<bool>,
        max_captured_bytes: usize,
    ) -> Self {
        Self {
            invocation: invocation.into(),
            sender,
            cancel,
            max_captured_bytes,
        }
    }

    /// Starts one reader task per stream. Readers begin before any eager
    /// stdin write so a child that talks first cannot stall on a full pipe.
    pub fn attach<O, E>(
        self,
        stdout: Option<O>,
        stderr: Option<E>,
        stdin: StdinSlot,
        plan: InputPlan,
    ) -> ReaderSet
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let stdout_capture = Arc::new(StdMutex::new(CaptureBuffer::new(self.max_captured_bytes)));
        let stderr_capture = Arc::new(StdMutex::new(CaptureBuffer::new(self.max_captured_bytes)));

        let (eager, trigger) = match plan {
            InputPlan::Closed => (None, None),
            InputPlan::Eager(payload) => (Some(payload), None),
            InputPlan::OnTrigger { trigger, payload } => (None, Some((trigger, payload))),
        };

        let hand_off = self.sender.map(|sender| {
            let (hand_off, pending) = mpsc::unbounded_channel();
            tokio::spawn(relay(
                self.invocation.clone(),
                pending,
                sender,
                self.cancel.clone(),
            ));
            hand_off
        });

        let reader = |origin: Origin, capture: &Arc<StdMutex<CaptureBuffer>>| Reader {
            invocation: self.invocation.clone(),
            origin,
            capture: capture.clone(),
            hand_off: hand_off.clone(),
            trigger: trigger
                .as_ref()
                .filter(|(trigger, _)| trigger.origin == origin)
                .map(|(trigger, payload)| TriggerDelivery {
                    watch: TriggerWatch::new(trigger.match_text.clone()),
                    slot: stdin.clone(),
                    payload: payload.clone(),
                    task: None,
                }),
            bytes_read: 0,
        };

        let stdout_task = stdout.map(|stream| {
            let reader = reader(Origin::Stdout, &stdout_capture);
            tokio::spawn(reader.drain(stream))
        });
        let stderr_task = stderr.map(|stream| {
            let reader = reader(Origin::Stderr, &stderr_capture);
            tokio::spawn(reader.drain(stream))
        });

        let stdin_task = eager.map(|payload| {
            let slot = stdin.clone();
            let invocation = self.invocation.clone();
            tokio::spawn(async move {
                slot.deliver(&invocation, &payload).await;
            })
        });

        ReaderSet {
            invocation: self.invocation,
            stdout_task,
            stderr_task,
            stdin_task,
            stdout_capture,
            stderr_capture,
            stdin,
        }
    }
}

pub struct ReaderSet {
    invocation: String,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
    stdin_task: Option<JoinHandle<()>>,
    stdout_capture: Arc<StdMutex<CaptureBuffer>>,
    stderr_capture: Arc<StdMutex<CaptureBuffer>>,
    stdin: StdinSlot,
}

impl ReaderSet {
    /// Joins every reader within `limit`. Readers still blocked after that
    /// (a grandchild holding the pipe open) are aborted, which drops their
    /// read ends; whatever they captured is kept.
    pub async fn finish(self, limit: Duration) -> CapturedOutput {
        let deadline = Instant::now() + limit;
        for (name, task) in [
            ("stdout", self.stdout_task),
            ("stderr", self.stderr_task),
            ("stdin", self.stdin_task),
        ] {
            let Some(task) = task else {
                continue;
            };
            let abort = task.abort_handle();
            match timeout_at(deadline, task).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::warn!(invocation = %self.invocation, task = name, error = %error, "io task failed")
                }
                Err(_) => {
                    abort.abort();
                    tracing::warn!(
                        invocation = %self.invocation,
                        task = name,
                        limit_ms = limit.as_millis() as u64,
                        "io task did not finish in time, aborted"
                    );
                }
            }
        }
        self.stdin.close().await;

        let stdout = self
            .stdout_capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let stderr = self
            .stderr_capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        CapturedOutput { stdout, stderr }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CaptureBuffer, ChunkDecoder, InputPlan, StdinSlot, StreamMultiplexer, TriggerWatch,
    };
    use crate::models::{Origin, OutputChunk, Trigger};
    use tokio::io::AsyncReadExt;
    use tokio::sync::{mpsc, watch};
    use tokio::time::{timeout, Duration};

    #[test]
    fn decoder_reassembles_split_multibyte_sequence() {
        let mut decoder = ChunkDecoder::default();
        assert_eq!(decoder.decode(&[b'a', 0xC3]), "a");
        assert_eq!(decoder.decode(&[0xA9, b'b']), "\u{e9}b");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn decoder_replaces_invalid_bytes_and_continues() {
        let mut decoder = ChunkDecoder::default();
        assert_eq!(decoder.decode(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
        assert_eq!(decoder.decode(&[0xE2, 0x82]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn capture_trims_oldest_text_on_char_boundary() {
        let mut capture = CaptureBuffer::new(4);
        assert_eq!(capture.push("ab"), 0);
        assert_eq!(capture.push("\u{e9}cd"), 2);
        assert_eq!(capture.trimmed_bytes(), 2);
        assert_eq!(capture.take(), "\u{e9}cd");
    }

    #[test]
    fn trigger_fires_once_even_when_split_across_reads() {
        let mut watch = TriggerWatch::new("Additional packs");
        assert!(!watch.observe("Installing...\nAdditional pa"));
        assert!(watch.observe("cks [Enter to confirm]:"));
        assert!(!watch.observe("Additional packs"));
        assert!(watch.fired());
    }

    #[test]
    fn input_plan_prefers_trigger_over_eager_write() {
        let trigger = Trigger::new(Origin::Stdout, "PROMPT");
        assert_eq!(
            InputPlan::new(Some("y\n".to_string()), Some(trigger.clone())),
            InputPlan::OnTrigger {
                trigger,
                payload: "y\n".to_string()
            }
        );
        assert_eq!(InputPlan::new(Some("y\n".to_string()), None), InputPlan::Eager("y\n".to_string()));
        assert!(!InputPlan::new(None, None).needs_pipe());
    }

    #[tokio::test]
    async fn repeated_prompt_delivers_payload_once() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (child_stdin, mut child_reads) = tokio::io::duplex(1024);
        let multiplexer = StreamMultiplexer::new("t", None, cancel_rx, 1024);
        let readers = multiplexer.attach(
            Some(&b"PROMPT\nPROMPT\nPROMPT\n"[..]),
            Some(&b""[..]),
            StdinSlot::new(Some(child_stdin)),
            InputPlan::new(
                Some("yes\n".to_string()),
                Some(Trigger::new(Origin::Stdout, "PROMPT")),
            ),
        );
        let captured = readers.finish(Duration::from_secs(5)).await;
        assert_eq!(captured.stdout, "PROMPT\nPROMPT\nPROMPT\n");

        let mut received = String::new();
        child_reads
            .read_to_string(&mut received)
            .await
            .expect("read stdin side");
        assert_eq!(received, "yes\n");
    }

    #[tokio::test]
    async fn chunks_keep_per_origin_order() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (sender, mut receiver) = mpsc::channel(64);
        let multiplexer = StreamMultiplexer::new("t", Some(sender), cancel_rx, 1024);
        let readers = multiplexer.attach(
            Some(&b"out"[..]),
            Some(&b"err"[..]),
            StdinSlot::closed(),
            InputPlan::Closed,
        );
        let captured = readers.finish(Duration::from_secs(5)).await;
        assert_eq!(captured.stdout, "out");
        assert_eq!(captured.stderr, "err");

        let mut chunks: Vec<OutputChunk> = Vec::new();
        while let Some(chunk) = receiver.recv().await {
            chunks.push(chunk);
        }
        let stdout: String = chunks
            .iter()
            .filter(|chunk| chunk.origin == Origin::Stdout)
            .map(|chunk| chunk.text.as_str())
            .collect();
        assert_eq!(stdout, "out");
    }

    #[tokio::test]
    async fn dropped_consumer_does_not_stop_capture() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (sender, receiver) = mpsc::channel(1);
        drop(receiver);
        let data: &'static [u8] = Box::leak(vec![b'x'; 64 * 1024].into_boxed_slice());
        let readers = StreamMultiplexer::new("t", Some(sender), cancel_rx, 1024 * 1024).attach(
            Some(data),
            None::<&'static [u8]>,
            StdinSlot::closed(),
            InputPlan::Closed,
        );
        let captured = readers.finish(Duration::from_secs(5)).await;
        assert_eq!(captured.stdout.len(), 64 * 1024);
    }

    #[tokio::test]
    async fn stalled_consumer_does_not_stall_capture() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (sender, mut receiver) = mpsc::channel(1);
        let data: &'static [u8] = Box::leak(vec![b'y'; 256 * 1024].into_boxed_slice());
        let readers = StreamMultiplexer::new("t", Some(sender), cancel_rx, 1024 * 1024).attach(
            Some(data),
            None::<&'static [u8]>,
            StdinSlot::closed(),
            InputPlan::Closed,
        );
        let captured = readers.finish(Duration::from_millis(200)).await;
        assert_eq!(captured.stdout.len(), 256 * 1024);

        let mut live = 0;
        while let Some(chunk) = receiver.recv().await {
            live += chunk.text.len();
        }
        assert_eq!(live, 256 * 1024);
    }

    #[tokio::test]
    async fn cancellation_ends_delivery_to_a_stalled_consumer() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (sender, mut receiver) = mpsc::channel(1);
        let data: &'static [u8] = Box::leak(vec![b'y'; 256 * 1024].into_boxed_slice());
        let readers = StreamMultiplexer::new("t", Some(sender), cancel_rx, 1024 * 1024).attach(
            Some(data),
            None::<&'static [u8]>,
            StdinSlot::closed(),
            InputPlan::Closed,
        );
        let _ = cancel_tx.send(true);
        let captured = readers.finish(Duration::from_secs(5)).await;
        assert_eq!(captured.stdout.len(), 256 * 1024);

        let mut live = 0;
        timeout(Duration::from_secs(5), async {
            while let Some(chunk) = receiver.recv().await {
                live += chunk.text.len();
            }
        })
        .await
        .expect("relay stops after cancellation");
        assert!(live < 256 * 1024);
    }
}
