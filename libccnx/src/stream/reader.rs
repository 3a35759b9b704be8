use crate::error::StreamError;
use crate::stream::{AsyncInputStream, WaitFlags};
use crate::target::EventTarget;
use futures::io::AsyncRead;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Adapts an [`AsyncInputStream`] to [`futures::io::AsyncRead`].
///
/// When the stream would block, the task's waker is registered as the stream's readiness callback. Wrap non-blocking
/// streams only: a blocking stream would stall the executor in `poll_read`.
pub struct ContentReader {
    stream: Arc<dyn AsyncInputStream>,
    target: Option<Arc<dyn EventTarget>>,
}

impl ContentReader {
    pub fn new(stream: Arc<dyn AsyncInputStream>) -> Self {
        Self { stream, target: None }
    }

    /// Wakes the reading task from `target` instead of from whichever thread made the stream ready.
    pub fn with_target(mut self, target: Arc<dyn EventTarget>) -> Self {
        self.target = Some(target);
        self
    }

    pub fn get_ref(&self) -> &Arc<dyn AsyncInputStream> {
        &self.stream
    }

    pub fn into_inner(self) -> Arc<dyn AsyncInputStream> {
        self.stream
    }
}

impl AsyncRead for ContentReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        match self.stream.read(buf) {
            Ok(n) => Poll::Ready(Ok(n)),
            Err(StreamError::WouldBlock) => {
                let waker = cx.waker().clone();
                let callback = Box::new(move || waker.wake());
                match self.stream.async_wait(Some(callback), WaitFlags::NONE, self.target.clone()) {
                    Ok(()) => Poll::Pending,
                    Err(err) => Poll::Ready(Err(err.into())),
                }
            }
            Err(err) => Poll::Ready(Err(err.into())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stream::new_pipe;
    use futures::executor::block_on;
    use futures::io::AsyncReadExt;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn reads_to_the_end_as_data_trickles_in() {
        let (reader, writer) = new_pipe(4, 2, true);
        let producer = thread::spawn(move || {
            for piece in [&b"one "[..], b"two ", b"three"] {
                thread::sleep(Duration::from_millis(5));
                let mut rest = piece;
                while !rest.is_empty() {
                    match writer.write(rest) {
                        Ok(n) => rest = &rest[n..],
                        Err(StreamError::WouldBlock) => thread::sleep(Duration::from_millis(1)),
                        Err(err) => panic!("write failed: {err}"),
                    }
                }
            }
            writer.close();
        });
        let mut content = ContentReader::new(Arc::new(reader));
        let mut out = Vec::new();
        block_on(content.read_to_end(&mut out)).unwrap();
        producer.join().unwrap();
        assert_eq!(out, b"one two three");
    }

    #[test]
    fn stream_errors_become_io_errors() {
        let (reader, writer) = new_pipe(4, 2, true);
        writer.close_with_status(StreamError::InvalidName);
        let mut content = ContentReader::new(Arc::new(reader));
        let mut buf = [0u8; 4];
        let err = block_on(content.read(&mut buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
