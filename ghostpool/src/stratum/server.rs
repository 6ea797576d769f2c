//! TCP listener and per-connection tasks.
//!
//! Each connection gets a reader, which frames lines, parses requests and
//! forwards them to the engine in order, and a writer, which drains the
//! connection's outbound queue onto the socket. The reader closes the
//! connection on malformed input; the writer closes it when the engine
//! drops the session.

use std::net::SocketAddr;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::codec::{CodecError, StratumCodec};
use super::engine::EngineHandle;
use super::messages::Request;
use crate::error::Result;
use crate::tracing::prelude::*;

/// Outbound lines queued per connection before it counts as stuck.
pub const OUTBOUND_CAPACITY: usize = 256;

type LineSink = SplitSink<Framed<TcpStream, StratumCodec>, String>;

pub struct StratumServer {
    listener: TcpListener,
    engine: EngineHandle,
    shutdown: CancellationToken,
    connections: TaskTracker,
}

impl StratumServer {
    pub async fn bind(addr: SocketAddr, engine: EngineHandle, shutdown: CancellationToken) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            engine,
            shutdown,
            connections: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown, then wait for open connections
    /// to finish.
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "Stratum server listening");
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.connections.spawn(handle_connection(
                            stream,
                            peer,
                            self.engine.clone(),
                            self.shutdown.child_token(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        drop(self.listener);
        self.connections.close();
        debug!(open = self.connections.len(), "Waiting for connections to close");
        self.connections.wait().await;
        info!("Stratum server stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: EngineHandle,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        trace!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }
    let (sink, mut lines) = Framed::new(stream, StratumCodec::new()).split();
    let (link, outbound) = mpsc::channel(OUTBOUND_CAPACITY);

    let Ok(connection) = engine.connect(peer, link).await else {
        return;
    };
    let writer_done = CancellationToken::new();
    let writer = tokio::spawn(write_lines(sink, outbound, writer_done.clone()));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = writer_done.cancelled() => break,
            frame = lines.next() => match frame {
                Some(Ok(line)) => match serde_json::from_str::<Request>(&line) {
                    Ok(request) => {
                        if engine.request(connection, request).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "Unparseable request, closing connection");
                        break;
                    }
                },
                Some(Err(CodecError::LineTooLong(len))) => {
                    warn!(peer = %peer, len, "Unterminated line too long, closing connection");
                    break;
                }
                Some(Err(e)) => {
                    debug!(peer = %peer, error = %e, "Connection error");
                    break;
                }
                None => break,
            },
        }
    }

    // Queued after any forwarded requests, so those are still answered
    engine.disconnect(connection).await;
    let _ = writer.await;
    trace!(peer = %peer, "Connection closed");
}

// Write lines until the engine drops the sending side, batching whatever
// is already queued into one flush.
async fn write_lines(mut sink: LineSink, mut outbound: mpsc::Receiver<String>, done: CancellationToken) {
    while let Some(line) = outbound.recv().await {
        let mut result = sink.feed(line).await;
        while result.is_ok() {
            match outbound.try_recv() {
                Ok(line) => result = sink.feed(line).await,
                Err(_) => break,
            }
        }
        let result = match result {
            Ok(()) => sink.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            debug!(error = %e, "Write failed");
            break;
        }
    }
    let _ = sink.close().await;
    done.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::FakeNode;
    use crate::stratum::engine::tests::config;
    use crate::stratum::engine::StratumEngine;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    struct Running {
        addr: SocketAddr,
        shutdown: CancellationToken,
        tasks: TaskTracker,
    }

    async fn start() -> Running {
        let shutdown = CancellationToken::new();
        let (_template_tx, template_rx) = mpsc::channel(1);
        let (engine, handle) = StratumEngine::new(
            config(1.0),
            Arc::new(FakeNode::default()),
            template_rx,
            shutdown.clone(),
        );
        let server = StratumServer::bind("127.0.0.1:0".parse().unwrap(), handle, shutdown.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let tasks = TaskTracker::new();
        tasks.spawn(engine.run());
        tasks.spawn(server.run());
        Running {
            addr,
            shutdown,
            tasks,
        }
    }

    async fn read_line(reader: &mut BufReader<TcpStream>) -> Value {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn expect_eof(stream: &mut BufReader<TcpStream>) {
        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0, "unexpected data: {:?}", String::from_utf8_lossy(&buf));
    }

    #[tokio::test]
    async fn test_requests_answered_in_order() {
        let running = start().await;
        let mut stream = BufReader::new(TcpStream::connect(running.addr).await.unwrap());
        stream
            .get_mut()
            .write_all(
                b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[\"test\"]}\n\
                  {\"id\":2,\"method\":\"mining.extranonce.subscribe\",\"params\":[]}\n",
            )
            .await
            .unwrap();

        assert_eq!(read_line(&mut stream).await["id"], 1);
        assert_eq!(read_line(&mut stream).await, json!({"id": 2, "result": true, "error": null}));

        running.shutdown.cancel();
        running.tasks.close();
        running.tasks.wait().await;
    }

    #[tokio::test]
    async fn test_request_split_across_writes() {
        let running = start().await;
        let mut stream = BufReader::new(TcpStream::connect(running.addr).await.unwrap());
        stream.get_mut().write_all(b"{\"id\":7,\"method\":").await.unwrap();
        stream.get_mut().flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream
            .get_mut()
            .write_all(b"\"mining.extranonce.subscribe\"}\n")
            .await
            .unwrap();

        assert_eq!(read_line(&mut stream).await["id"], 7);
        running.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unparseable_line_closes() {
        let running = start().await;
        let mut stream = BufReader::new(TcpStream::connect(running.addr).await.unwrap());
        stream.get_mut().write_all(b"not json\n").await.unwrap();
        expect_eof(&mut stream).await;
        running.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_overlong_partial_line_closes() {
        let running = start().await;
        let mut stream = BufReader::new(TcpStream::connect(running.addr).await.unwrap());
        stream.get_mut().write_all(&[b'a'; 600]).await.unwrap();
        expect_eof(&mut stream).await;
        running.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let running = start().await;
        let mut stream = BufReader::new(TcpStream::connect(running.addr).await.unwrap());
        stream
            .get_mut()
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .await
            .unwrap();
        read_line(&mut stream).await;

        running.shutdown.cancel();
        running.tasks.close();
        tokio::time::timeout(Duration::from_secs(5), running.tasks.wait())
            .await
            .unwrap();
        expect_eof(&mut stream).await;
    }
}
