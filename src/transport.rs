//! # Transport
//!
//! The bytes-level duplex beneath a [`crate::conn::Conn`]: send one message
//! atomically, block until one full message arrives, close both directions.
//! Failures are reported synchronously from send and receive.
//!
//! Two concrete variants:
//!
//! - [`Transport::from_io`] wraps any OS-level byte duplex (subprocess stdio,
//!   pipes, an ssh channel). Framing is a `u32` little-endian length prefix
//!   followed by the encoded message, with a hard size cap.
//! - [`Transport::pair`] wraps a pair of in-memory channels, used when the
//!   controller and the first-hop node are co-located in one process.
//!
//! A transport splits into independent send and receive halves so a
//! connection's I/O tasks can run concurrently.

use crate::defaults;
use crate::message::Message;
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Transport failure, surfaced synchronously from send and receive.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,

    #[error("message codec: {0}")]
    Codec(String),

    #[error("message too large: {0} bytes")]
    TooLarge(usize),
}

/// The transmit half of a transport.
#[async_trait]
pub trait MsgSender: Send {
    /// Serialize and write one message atomically.
    async fn send(&mut self, m: &Message) -> Result<(), TransportError>;

    /// Close the transmit direction. Idempotent.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// The receive half of a transport.
#[async_trait]
pub trait MsgReceiver: Send {
    /// Block until one full message is available.
    async fn receive(&mut self) -> Result<Message, TransportError>;
}

/// A bidirectional typed-message stream over an arbitrary byte duplex.
pub struct Transport {
    tx: Box<dyn MsgSender>,
    rx: Box<dyn MsgReceiver>,
}

impl Transport {
    /// Wrap an OS-level byte duplex: `r` is the inbound byte stream, `w` the
    /// outbound one (for a subprocess, the child's stdout and stdin).
    pub fn from_io<R, W>(r: R, w: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            tx: Box::new(IoSender { w }),
            rx: Box::new(IoReceiver { r }),
        }
    }

    /// An in-memory transport pair: messages sent on one end are received on
    /// the other, in order, with a bounded in-flight window.
    pub fn pair() -> (Transport, Transport) {
        let (a_tx, a_rx) = mpsc::channel(defaults::TRANSMIT_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(defaults::TRANSMIT_CAPACITY);
        let a = Transport {
            tx: Box::new(ChannelSender { tx: Some(a_tx) }),
            rx: Box::new(ChannelReceiver { rx: b_rx }),
        };
        let b = Transport {
            tx: Box::new(ChannelSender { tx: Some(b_tx) }),
            rx: Box::new(ChannelReceiver { rx: a_rx }),
        };
        (a, b)
    }

    /// Split into independent halves for concurrent I/O tasks.
    pub fn split(self) -> (Box<dyn MsgSender>, Box<dyn MsgReceiver>) {
        (self.tx, self.rx)
    }

    pub async fn send(&mut self, m: &Message) -> Result<(), TransportError> {
        self.tx.send(m).await
    }

    pub async fn receive(&mut self) -> Result<Message, TransportError> {
        self.rx.receive().await
    }

    /// Terminate both directions.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.tx.close().await
    }
}

struct IoSender<W> {
    w: W,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MsgSender for IoSender<W> {
    async fn send(&mut self, m: &Message) -> Result<(), TransportError> {
        let bytes = m.encode().map_err(|e| TransportError::Codec(e.to_string()))?;
        if bytes.len() > defaults::MAX_MESSAGE_SIZE {
            return Err(TransportError::TooLarge(bytes.len()));
        }
        self.w.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
        self.w.write_all(&bytes).await?;
        self.w.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.w.shutdown().await?;
        Ok(())
    }
}

struct IoReceiver<R> {
    r: R,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> MsgReceiver for IoReceiver<R> {
    async fn receive(&mut self) -> Result<Message, TransportError> {
        let mut len_bytes = [0u8; 4];
        self.r.read_exact(&mut len_bytes).await?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > defaults::MAX_MESSAGE_SIZE {
            return Err(TransportError::TooLarge(len));
        }
        let mut data = vec![0u8; len];
        self.r.read_exact(&mut data).await?;
        Message::decode(&data).map_err(|e| TransportError::Codec(e.to_string()))
    }
}

struct ChannelSender {
    tx: Option<mpsc::Sender<Message>>,
}

#[async_trait]
impl MsgSender for ChannelSender {
    async fn send(&mut self, m: &Message) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(m.clone()).await.map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx.take();
        Ok(())
    }
}

struct ChannelReceiver {
    rx: mpsc::Receiver<Message>,
}

#[async_trait]
impl MsgReceiver for ChannelReceiver {
    async fn receive(&mut self) -> Result<Message, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{RunReply, Setup};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn channel_pair_round_trip() {
        let (mut a, mut b) = Transport::pair();
        a.send(&Message::Cancel).await.unwrap();
        a.send(&Message::Ran(RunReply::failed(9))).await.unwrap();

        match b.receive().await.unwrap() {
            Message::Cancel => {}
            m => panic!("unexpected message: {:?}", m),
        }
        match b.receive().await.unwrap() {
            Message::Ran(r) => assert_eq!(r.id, 9),
            m => panic!("unexpected message: {:?}", m),
        }
    }

    #[tokio::test]
    async fn channel_close_fails_peer_receive() {
        let (mut a, mut b) = Transport::pair();
        a.close().await.unwrap();
        assert!(matches!(b.receive().await, Err(TransportError::Closed)));
        assert!(matches!(a.send(&Message::Cancel).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn io_transport_frames_messages() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (cr, cw) = tokio::io::split(client);
        let (sr, sw) = tokio::io::split(server);
        let mut a = Transport::from_io(cr, cw);
        let mut b = Transport::from_io(sr, sw);

        let setup = Message::Setup(Setup {
            exes: BTreeMap::from([("linux-x86_64".to_string(), vec![0u8; 512])]),
            key: None,
        });
        a.send(&setup).await.unwrap();
        a.send(&Message::Canceled).await.unwrap();

        match b.receive().await.unwrap() {
            Message::Setup(s) => assert_eq!(s.exes["linux-x86_64"].len(), 512),
            m => panic!("unexpected message: {:?}", m),
        }
        match b.receive().await.unwrap() {
            Message::Canceled => {}
            m => panic!("unexpected message: {:?}", m),
        }
    }

    #[tokio::test]
    async fn io_receive_fails_on_eof() {
        let (client, server) = tokio::io::duplex(1024);
        let (cr, cw) = tokio::io::split(client);
        let (sr, sw) = tokio::io::split(server);
        let mut a = Transport::from_io(cr, cw);
        let mut b = Transport::from_io(sr, sw);

        a.close().await.unwrap();
        drop(a);
        assert!(b.receive().await.is_err());
    }
}
