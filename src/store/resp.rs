//! RESP2 client over TCP.

use super::{Connector, ReplicationInfo, StoreClient, StoreHandle};
use crate::error::{CascadeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::trace;

/// One connection to one store instance. Commands are serialized through the
/// inner lock and each round trip is bounded by `io_timeout`.
///
/// A round trip that times out or fails at the transport level may leave a
/// reply in flight, so the client is marked broken and refuses further
/// commands.
pub struct RespClient {
    framed: Mutex<Framed<TcpStream, Resp2>>,
    peer: String,
    io_timeout: Duration,
    broken: AtomicBool,
}

impl RespClient {
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let peer = format!("{}:{}", host, port);
        let socket = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| CascadeError::Timeout(timeout))?
            .map_err(|e| CascadeError::connection(format!("connect to {}: {}", peer, e)))?;
        socket.set_nodelay(true).ok();

        Ok(Self {
            framed: Mutex::new(Framed::new(socket, Resp2::default())),
            peer,
            io_timeout: timeout,
            broken: AtomicBool::new(false),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    async fn command(&self, args: &[&str]) -> Result<BytesFrame> {
        let request = make_command(args);
        trace!(peer = %self.peer, command = args.first().copied().unwrap_or(""), "sending");

        let mut framed = self.framed.lock().await;
        let peer = &self.peer;
        if self.is_broken() {
            return Err(CascadeError::connection(format!("{} connection is broken", peer)));
        }
        let round_trip = async {
            framed.send(request).await?;
            let closed = || CascadeError::connection(format!("{} closed the connection", peer));
            let frame = framed.next().await.ok_or_else(closed)??;
            Ok::<_, CascadeError>(frame)
        };
        let reply = match tokio::time::timeout(self.io_timeout, round_trip).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                self.broken.store(true, Ordering::Release);
                return Err(e);
            }
            Err(_) => {
                self.broken.store(true, Ordering::Release);
                return Err(CascadeError::Timeout(self.io_timeout));
            }
        };

        match reply {
            BytesFrame::Error(err) => Err(CascadeError::Command(err.to_string())),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl StoreClient for RespClient {
    async fn ping(&self) -> Result<()> {
        match self.command(&["PING"]).await? {
            BytesFrame::SimpleString(s) if s.as_ref() == b"PONG" => Ok(()),
            other => Err(unexpected("PING", &other)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.command(&["GET", key]).await? {
            BytesFrame::Null => Ok(None),
            BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => {
                Ok(Some(frame_text(&b)))
            }
            other => Err(unexpected("GET", &other)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        expect_ok("SET", self.command(&["SET", key, value]).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        match self.command(&["SADD", key, member]).await? {
            BytesFrame::Integer(n) => Ok(n > 0),
            other => Err(unexpected("SADD", &other)),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        match self.command(&["SREM", key, member]).await? {
            BytesFrame::Integer(n) => Ok(n > 0),
            other => Err(unexpected("SREM", &other)),
        }
    }

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>> {
        match self.command(&["SMEMBERS", key]).await? {
            BytesFrame::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| match item {
                    BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => {
                        Some(frame_text(&b))
                    }
                    _ => None,
                })
                .collect()),
            BytesFrame::Null => Ok(BTreeSet::new()),
            other => Err(unexpected("SMEMBERS", &other)),
        }
    }

    async fn replicate_from(&self, host: &str, port: u16) -> Result<()> {
        let port = port.to_string();
        expect_ok("SLAVEOF", self.command(&["SLAVEOF", host, &port]).await?)
    }

    async fn replication_info(&self) -> Result<ReplicationInfo> {
        match self.command(&["INFO", "replication"]).await? {
            BytesFrame::BulkString(b) => Ok(ReplicationInfo::parse(&frame_text(&b))),
            other => Err(unexpected("INFO", &other)),
        }
    }
}

/// Production [`Connector`]: plain TCP with a connect/IO timeout.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<StoreHandle> {
        let client = RespClient::connect(host, port, self.timeout).await?;
        Ok(Arc::new(client))
    }
}

/// Builds a RESP request array from command arguments.
fn make_command(args: &[&str]) -> BytesFrame {
    BytesFrame::Array(
        args.iter()
            .map(|arg| BytesFrame::BulkString(Bytes::from(arg.as_bytes().to_vec())))
            .collect(),
    )
}

fn frame_text(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).to_string()
}

fn expect_ok(command: &str, reply: BytesFrame) -> Result<()> {
    match reply {
        BytesFrame::SimpleString(s) if s.as_ref() == b"OK" => Ok(()),
        other => Err(unexpected(command, &other)),
    }
}

fn unexpected(command: &str, frame: &BytesFrame) -> CascadeError {
    CascadeError::protocol(format!("unexpected {} response: {:?}", command, frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts one connection and answers each request with the next canned
    /// frame, in order.
    async fn canned_server(replies: Vec<BytesFrame>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, Resp2::default());
            for reply in replies {
                if framed.next().await.is_none() {
                    return;
                }
                framed.send(reply).await.unwrap();
            }
        });
        addr
    }

    fn bulk(s: &str) -> BytesFrame {
        BytesFrame::BulkString(Bytes::from(s.as_bytes().to_vec()))
    }

    #[test]
    fn builds_bulk_string_arrays() {
        let BytesFrame::Array(parts) = make_command(&["SADD", "cascade:branches", "b1"]) else {
            panic!("expected an array frame");
        };
        let words: Vec<String> = parts
            .iter()
            .map(|part| match part {
                BytesFrame::BulkString(b) => frame_text(b),
                other => panic!("unexpected part {:?}", other),
            })
            .collect();
        assert_eq!(words, vec!["SADD", "cascade:branches", "b1"]);
    }

    #[tokio::test]
    async fn talks_resp_to_a_server() {
        let addr = canned_server(vec![
            BytesFrame::SimpleString(Bytes::from_static(b"PONG")),
            bulk("1700000000.5"),
            BytesFrame::Null,
            BytesFrame::Integer(1),
            BytesFrame::Array(vec![bulk("b1"), bulk("b2")]),
            bulk("# Replication\r\nrole:master\r\nconnected_slaves:3\r\n"),
        ])
        .await;

        let client = RespClient::connect("127.0.0.1", addr.port(), Duration::from_secs(1))
            .await
            .unwrap();
        client.ping().await.unwrap();
        assert_eq!(client.get("time").await.unwrap().as_deref(), Some("1700000000.5"));
        assert_eq!(client.get("cascade:root").await.unwrap(), None);
        assert!(client.sadd("cascade:branches", "b3").await.unwrap());
        let members = client.smembers("cascade:branches").await.unwrap();
        assert_eq!(members.into_iter().collect::<Vec<_>>(), vec!["b1", "b2"]);
        let info = client.replication_info().await.unwrap();
        assert_eq!(info.connected_children, 3);
    }

    #[tokio::test]
    async fn error_replies_surface_as_command_errors() {
        let addr = canned_server(vec![BytesFrame::Error("ERR wrong kind".into())]).await;
        let client = RespClient::connect("127.0.0.1", addr.port(), Duration::from_secs(1))
            .await
            .unwrap();
        let err = client.set("time", "1").await.unwrap_err();
        assert!(matches!(err, CascadeError::Command(msg) if msg.contains("wrong kind")));
    }

    #[tokio::test]
    async fn unreachable_port_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let connector = TcpConnector::new(Duration::from_millis(500));
        assert!(connector.connect("127.0.0.1", port).await.is_err());
    }

    #[tokio::test]
    async fn timed_out_connection_refuses_further_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, Resp2::default());
            while framed.next().await.is_some() {}
        });

        let client = RespClient::connect("127.0.0.1", port, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!client.is_broken());
        assert!(matches!(client.ping().await, Err(CascadeError::Timeout(_))));
        assert!(client.is_broken());
        assert!(matches!(client.get("time").await, Err(CascadeError::Connection(_))));
    }

    #[tokio::test]
    async fn error_reply_keeps_the_connection_usable() {
        let addr = canned_server(vec![
            BytesFrame::Error("ERR wrong kind".into()),
            BytesFrame::SimpleString(Bytes::from_static(b"PONG")),
        ])
        .await;
        let client = RespClient::connect("127.0.0.1", addr.port(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(client.set("time", "1").await.is_err());
        assert!(!client.is_broken());
        client.ping().await.unwrap();
    }
}
