//! Standard input relay with quit-token interception.
//!
//! Bytes are passed to the command exactly as read, in whatever chunks they arrive. Alongside,
//! the relay tracks line boundaries; a line consisting solely of the quit token (optionally
//! followed by `\r`) is forwarded and ends the relay. A termination request received by this
//! process is turned into the same token, so the command shuts down on its own terms.

use std::io::ErrorKind;

use memchr::memchr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::signal::Interrupt;

const CHUNK_SIZE: usize = 64 * 1024;

/// Why the relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Our standard input reached end of file; the command's input was closed.
    InputClosed,
    /// The quit token arrived on standard input and was forwarded.
    TokenForwarded,
    /// A termination request arrived and the quit token was sent in its place.
    Interrupted(Interrupt),
    /// The command stopped accepting input.
    SinkClosed,
    /// The command exited first.
    Cancelled,
}

/// Tracks the current line just far enough to recognise the quit token.
#[derive(Debug)]
struct LineScanner {
    token: Vec<u8>,
    line: Vec<u8>,
    /// The current line is already longer than any token match could be.
    overflow: bool,
}

impl LineScanner {
    fn new(token: &[u8]) -> Self {
        Self {
            token: token.to_vec(),
            line: Vec::with_capacity(token.len() + 1),
            overflow: false,
        }
    }

    /// Feeds a chunk. Returns the offset just past the newline ending a token line, if any.
    fn feed(&mut self, chunk: &[u8]) -> Option<usize> {
        let mut start = 0;
        while let Some(i) = memchr(b'\n', &chunk[start..]) {
            let end = start + i;
            self.push(&chunk[start..end]);
            let matched = self.is_token();
            self.reset();
            if matched {
                return Some(end + 1);
            }
            start = end + 1;
        }
        self.push(&chunk[start..]);
        None
    }

    /// Whether the unterminated tail left at end of input is the token.
    fn finish(&self) -> bool {
        self.is_token()
    }

    fn push(&mut self, segment: &[u8]) {
        if self.overflow {
            return;
        }
        if self.line.len() + segment.len() > self.token.len() + 1 {
            self.overflow = true;
            self.line.clear();
        } else {
            self.line.extend_from_slice(segment);
        }
    }

    fn is_token(&self) -> bool {
        if self.overflow {
            return false;
        }
        let line = self.line.strip_suffix(b"\r").unwrap_or(&self.line);
        line == self.token.as_slice()
    }

    fn reset(&mut self) {
        self.line.clear();
        self.overflow = false;
    }
}

/// Moves input into the command until one of the [`RelayEnd`] conditions.
#[derive(Debug, Clone)]
pub struct Relay {
    token: Vec<u8>,
    interrupts: flume::Receiver<Interrupt>,
    cancel: CancellationToken,
}

impl Relay {
    pub fn new(
        token: impl Into<Vec<u8>>,
        interrupts: flume::Receiver<Interrupt>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            token: token.into(),
            interrupts,
            cancel,
        }
    }

    /// Token that stops the relay once the command has exited.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run<R, W>(self, mut input: R, mut sink: W) -> std::io::Result<RelayEnd>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut scanner = LineScanner::new(&self.token);
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut listening = true;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Ok(RelayEnd::Cancelled),

                interrupt = self.interrupts.recv_async(), if listening => match interrupt {
                    Ok(interrupt) => {
                        info!(signal = interrupt.signal_number(), "Forwarding quit token to command");
                        let mut line = self.token.clone();
                        line.push(b'\n');
                        return match forward(&mut sink, &line).await? {
                            true => Ok(RelayEnd::Interrupted(interrupt)),
                            false => Ok(RelayEnd::SinkClosed),
                        };
                    }
                    // Nobody can send interrupts anymore.
                    Err(_) => listening = false,
                },

                read = input.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        let tail_is_token = scanner.finish();
                        // Closing our end delivers EOF to the command.
                        match sink.shutdown().await {
                            Err(err) if err.kind() != ErrorKind::BrokenPipe => return Err(err),
                            _ => {}
                        }
                        debug!("Standard input closed");
                        return Ok(if tail_is_token {
                            RelayEnd::TokenForwarded
                        } else {
                            RelayEnd::InputClosed
                        });
                    }
                    let chunk = &buf[..n];
                    match scanner.feed(chunk) {
                        Some(end) => {
                            info!("Quit token received on standard input");
                            return match forward(&mut sink, &chunk[..end]).await? {
                                true => Ok(RelayEnd::TokenForwarded),
                                false => Ok(RelayEnd::SinkClosed),
                            };
                        }
                        None => {
                            if !forward(&mut sink, chunk).await? {
                                return Ok(RelayEnd::SinkClosed);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Writes and flushes. Returns `false` if the command has closed its input.
async fn forward<W: AsyncWrite + Unpin>(sink: &mut W, bytes: &[u8]) -> std::io::Result<bool> {
    let written = async {
        sink.write_all(bytes).await?;
        sink.flush().await
    };
    match written.await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{duplex, AsyncReadExt};

    use super::*;

    fn relay(token: &str) -> (Relay, flume::Sender<Interrupt>, CancellationToken) {
        let (interrupt_tx, interrupt_rx) = flume::unbounded();
        let cancel = CancellationToken::new();
        (
            Relay::new(token.as_bytes(), interrupt_rx, cancel.clone()),
            interrupt_tx,
            cancel,
        )
    }

    async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
        let mut out = vec![];
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn test_scanner_matches_whole_lines_only() {
        let mut scanner = LineScanner::new(b"q");
        assert_eq!(scanner.feed(b"quit\nq\n"), Some(7));

        let mut scanner = LineScanner::new(b"q");
        assert_eq!(scanner.feed(b"aq\nqq\n q\n"), None);

        let mut scanner = LineScanner::new(b"q");
        assert_eq!(scanner.feed(b"frame\r\nq\r\nrest"), Some(10));
    }

    #[test]
    fn test_scanner_across_chunks() {
        let mut scanner = LineScanner::new(b"quit");
        assert_eq!(scanner.feed(b"data\nqu"), None);
        assert_eq!(scanner.feed(b"it"), None);
        assert_eq!(scanner.feed(b"\nmore"), Some(1));
    }

    #[test]
    fn test_scanner_long_line_is_not_token() {
        let mut scanner = LineScanner::new(b"q");
        assert_eq!(scanner.feed(b"xxxxxxxx"), None);
        assert_eq!(scanner.feed(b"q\n"), None);
        // The next line starts clean.
        assert_eq!(scanner.feed(b"q\n"), Some(2));
    }

    #[test]
    fn test_scanner_unterminated_tail() {
        let mut scanner = LineScanner::new(b"q");
        assert_eq!(scanner.feed(b"abc\nq"), None);
        assert!(scanner.finish());
    }

    #[tokio::test]
    async fn test_binary_input_passes_through_unchanged() {
        let input: Vec<u8> = (0..=255u8).cycle().take(200_000).collect();
        let (relay, _interrupt_tx, _cancel) = relay("q");
        let (sink, received) = duplex(1024);

        let reader = tokio::spawn(drain(received));
        let end = relay.run(input.as_slice(), sink).await.unwrap();

        assert_eq!(end, RelayEnd::InputClosed);
        assert_eq!(reader.await.unwrap(), input);
    }

    #[tokio::test]
    async fn test_token_line_is_forwarded_and_ends_relay() {
        let (relay, _interrupt_tx, _cancel) = relay("q");
        let (sink, received) = duplex(1024);

        let reader = tokio::spawn(drain(received));
        let end = relay
            .run(&b"first\nq\nnever sent\n"[..], sink)
            .await
            .unwrap();

        assert_eq!(end, RelayEnd::TokenForwarded);
        assert_eq!(reader.await.unwrap(), b"first\nq\n");
    }

    #[tokio::test]
    async fn test_interrupt_sends_token() {
        let (relay, interrupt_tx, _cancel) = relay("q");
        let (sink, received) = duplex(1024);
        // Input that never produces data and never closes.
        let (_keep_open, input) = duplex(16);

        let reader = tokio::spawn(drain(received));
        interrupt_tx.send(Interrupt::Terminate).unwrap();
        let end = relay.run(input, sink).await.unwrap();

        assert_eq!(end, RelayEnd::Interrupted(Interrupt::Terminate));
        assert_eq!(reader.await.unwrap(), b"q\n");
    }

    #[tokio::test]
    async fn test_cancel_stops_relay() {
        let (relay, _interrupt_tx, cancel) = relay("q");
        let (sink, _received) = duplex(1024);
        let (_keep_open, input) = duplex(16);

        let task = tokio::spawn(relay.run(input, sink));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap().unwrap(), RelayEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_dropped_interrupt_sender_is_ignored() {
        let (relay, interrupt_tx, _cancel) = relay("q");
        drop(interrupt_tx);
        let (sink, received) = duplex(1024);

        let reader = tokio::spawn(drain(received));
        let end = relay.run(&b"abc\n"[..], sink).await.unwrap();

        assert_eq!(end, RelayEnd::InputClosed);
        assert_eq!(reader.await.unwrap(), b"abc\n");
    }

    #[tokio::test]
    async fn test_token_split_across_reads() {
        let (relay, _interrupt_tx, _cancel) = relay("quit");
        let (sink, received) = duplex(1024);
        let (mut writer, input) = duplex(1024);

        let reader = tokio::spawn(drain(received));
        let task = tokio::spawn(relay.run(input, sink));
        writer.write_all(b"frame data\nqu").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.write_all(b"it\ntrailing").await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), RelayEnd::TokenForwarded);
        assert_eq!(reader.await.unwrap(), b"frame data\nquit\n");
    }
}
