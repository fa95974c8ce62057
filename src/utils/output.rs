/// Bounded output collection for boundary stdout/stderr
/// Reader threads forward chunks over a channel so the supervisor decides,
/// per chunk, whether it arrived before the deadline.
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::io::Read;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// How a stream ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    /// EOF after at most `limit` bytes
    Complete,
    /// More than `limit` bytes were written; the excess was drained and dropped
    Truncated,
    /// Read error before EOF
    ReadError,
}

enum Chunk {
    Data(Stream, Vec<u8>),
    End(Stream, StreamEnd),
}

/// Output accepted by the supervisor
#[derive(Debug, Default, Clone)]
pub struct CollectedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated: bool,
    /// Bytes that arrived after collection stopped being trusted
    pub discarded_bytes: usize,
}

/// Collects two streams through bounded reader threads
pub struct OutputCollector {
    rx: Receiver<Chunk>,
    handles: Vec<thread::JoinHandle<()>>,
    open_streams: usize,
    output: CollectedOutput,
}

impl OutputCollector {
    pub fn start<O, E>(stdout: Option<O>, stderr: Option<E>, limit: usize) -> Self
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let mut handles = Vec::new();

        if let Some(stdout) = stdout {
            handles.push(read_stream_async(stdout, Stream::Stdout, limit, tx.clone()));
        }
        if let Some(stderr) = stderr {
            handles.push(read_stream_async(stderr, Stream::Stderr, limit, tx.clone()));
        }

        Self {
            rx,
            open_streams: handles.len(),
            handles,
            output: CollectedOutput::default(),
        }
    }

    /// Accept everything that has already arrived, without blocking
    pub fn drain(&mut self) {
        while let Ok(chunk) = self.rx.try_recv() {
            self.accept(chunk, true);
        }
    }

    /// Wait up to `grace` for both streams to reach EOF.
    ///
    /// With `trust = false` anything still in flight is counted and dropped.
    pub fn finish(mut self, grace: Duration, trust: bool) -> CollectedOutput {
        let deadline = Instant::now() + grace;

        while self.open_streams > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(chunk) => self.accept(chunk, trust),
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "Output streams still open after {:?} grace, abandoning readers",
                        grace
                    );
                    return self.output;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        self.output
    }

    fn accept(&mut self, chunk: Chunk, trust: bool) {
        match chunk {
            Chunk::Data(stream, bytes) => {
                if !trust {
                    self.output.discarded_bytes += bytes.len();
                    return;
                }
                match stream {
                    Stream::Stdout => self.output.stdout.extend_from_slice(&bytes),
                    Stream::Stderr => self.output.stderr.extend_from_slice(&bytes),
                }
            }
            Chunk::End(stream, end) => {
                self.open_streams = self.open_streams.saturating_sub(1);
                match end {
                    StreamEnd::Complete => {}
                    StreamEnd::Truncated => self.output.truncated = true,
                    StreamEnd::ReadError => {
                        log::warn!("Read error on boundary {:?}", stream);
                    }
                }
            }
        }
    }
}

fn read_stream_async<R: Read + Send + 'static>(
    mut reader: R,
    stream: Stream,
    limit: usize,
    tx: Sender<Chunk>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut forwarded = 0usize;
        let mut end = StreamEnd::Complete;

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let room = limit.saturating_sub(forwarded);
                    if n > room {
                        end = StreamEnd::Truncated;
                    }
                    let take = n.min(room);
                    if take > 0 {
                        forwarded += take;
                        if tx.send(Chunk::Data(stream, buf[..take].to_vec())).is_err() {
                            return;
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    end = StreamEnd::ReadError;
                    break;
                }
            }
        }

        let _ = tx.send(Chunk::End(stream, end));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_collects_both_streams() {
        let collector = OutputCollector::start(
            Some(Cursor::new(b"hello".to_vec())),
            Some(Cursor::new(b"oops".to_vec())),
            1024,
        );
        let out = collector.finish(Duration::from_secs(1), true);
        assert_eq!(out.stdout, b"hello");
        assert_eq!(out.stderr, b"oops");
        assert!(!out.truncated);
    }

    #[test]
    fn test_limit_truncates() {
        let collector = OutputCollector::start(
            Some(Cursor::new(vec![b'x'; 10_000])),
            None::<Cursor<Vec<u8>>>,
            100,
        );
        let out = collector.finish(Duration::from_secs(1), true);
        assert_eq!(out.stdout.len(), 100);
        assert!(out.truncated);
    }

    #[test]
    fn test_untrusted_output_is_discarded() {
        let collector = OutputCollector::start(
            Some(Cursor::new(b"late".to_vec())),
            None::<Cursor<Vec<u8>>>,
            1024,
        );
        let out = collector.finish(Duration::from_secs(1), false);
        assert!(out.stdout.is_empty());
        assert_eq!(out.discarded_bytes, 4);
    }

    #[test]
    fn test_drain_then_finish_keeps_trusted_prefix() {
        let mut collector = OutputCollector::start(
            Some(Cursor::new(b"early".to_vec())),
            None::<Cursor<Vec<u8>>>,
            1024,
        );
        // Give the reader thread time to forward the chunk
        std::thread::sleep(Duration::from_millis(50));
        collector.drain();
        let out = collector.finish(Duration::from_secs(1), false);
        assert_eq!(out.stdout, b"early");
    }
}
