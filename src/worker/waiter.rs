//! Component L: the acceptor and the keep-alive readiness waiter.
//!
//! Grounded in `bin/varnishd/cache_acceptor.c`/`cache_waiter.c`, which
//! abstract epoll/kqueue/ports/poll behind one interface. Tokio's reactor
//! already is that abstraction on every supported platform, so both halves
//! are plain async tasks: `accept_loop` owns the listening socket, and
//! [`Waiter`] is where an idle keep-alive connection sits — off any worker
//! thread — until `AsyncFd`/`readable()` reports bytes are ready, at which
//! point it's handed back to the [`crate::worker::WorkerPool`] as a new job
//! (§4.1 WAIT, §5: "the session is handed to the waiter... and becomes
//! workerless; it returns via a pipe to a worker when the next request
//! bytes arrive").

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A connection parked on the waiter between requests.
pub struct Waiting {
    pub stream: TcpStream,
    pub linger: Duration,
}

/// Spawns the waiter task and returns a sender connections can be pushed
/// onto. `on_ready` is called (on the waiter's task) once a parked
/// connection either becomes readable or times out/errors — the caller
/// re-queues it onto a worker pool, or tears it down on error/timeout.
pub fn spawn_waiter(
    on_ready: impl Fn(std::io::Result<TcpStream>) + Send + Sync + 'static,
) -> mpsc::UnboundedSender<Waiting> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Waiting>();
    let on_ready = Arc::new(on_ready);
    tokio::spawn(async move {
        while let Some(waiting) = rx.recv().await {
            let on_ready = on_ready.clone();
            tokio::spawn(async move {
                let result = tokio::time::timeout(waiting.linger, waiting.stream.readable()).await;
                match result {
                    Ok(Ok(())) => on_ready(Ok(waiting.stream)),
                    Ok(Err(e)) => on_ready(Err(e)),
                    Err(_elapsed) => {
                        debug!("keep-alive connection lingered past session_linger; closing");
                        on_ready(Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "session_linger elapsed")));
                    },
                }
            });
        }
    });
    tx
}

/// Component L's acceptor half: binds and loops `accept()`, handing each
/// new connection to `on_accept`. Runs until `cancel` fires.
pub async fn accept_loop(
    listener: tokio::net::TcpListener,
    cancel: tokio_util::sync::CancellationToken,
    on_accept: impl Fn(TcpStream, std::net::SocketAddr) + Send + Sync + 'static,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        on_accept(stream, peer);
                    },
                    Err(error) => {
                        warn!(%error, "accept() failed");
                        continue;
                    },
                }
            },
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn waiter_wakes_on_readable_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            s.write_all(b"more data").await.unwrap();
            s
        });
        let (server, _) = listener.accept().await.unwrap();

        let woke = Arc::new(AtomicBool::new(false));
        let woke2 = woke.clone();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let done_tx = std::sync::Mutex::new(Some(done_tx));
        let sender = spawn_waiter(move |result| {
            woke2.store(result.is_ok(), Ordering::SeqCst);
            if let Some(tx) = done_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        });
        sender.send(Waiting { stream: server, linger: Duration::from_secs(5) }).unwrap();
        tokio::time::timeout(Duration::from_secs(1), done_rx).await.unwrap().unwrap();
        assert!(woke.load(Ordering::SeqCst));
        client.await.unwrap();
    }
}
