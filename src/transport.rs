//! Byte transports for the two spot sources.
//!
//! [`TcpLink`] carries the cluster text protocol and hands out one line per
//! call, waiting at most a short bounded time. [`UdpLink`] receives WSJT-X
//! datagrams, joining the multicast group when the configured address is one.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::error::FailureReason;

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 65_536;

/// Result of one bounded line read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Line(String),
    /// Nothing complete arrived within the wait.
    Idle,
    /// The peer closed the connection.
    Closed,
}

/// Line-oriented TCP connection to a cluster node.
pub struct TcpLink {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Bytes of a line not yet terminated; kept across timed-out reads.
    partial: Vec<u8>,
    peer: String,
}

impl TcpLink {
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Self, FailureReason> {
        let addr = format!("{host}:{port}");
        info!("Connecting to {}...", addr);

        let stream = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| FailureReason::Connect(format!("{addr}: timed out")))?
            .map_err(|e| FailureReason::Connect(format!("{addr}: {e}")))?;

        info!("Connected to {}", addr);

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            partial: Vec::with_capacity(256),
            peer: addr,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Read one line, waiting at most `wait`.
    ///
    /// A line cut off by the wait is kept and completed by a later call.
    pub async fn next_line(&mut self, wait: Duration) -> io::Result<LineEvent> {
        match timeout(wait, self.reader.read_until(b'\n', &mut self.partial)).await {
            Err(_) => Ok(LineEvent::Idle),
            Ok(Err(e)) => Err(e),
            Ok(Ok(0)) if self.partial.is_empty() => Ok(LineEvent::Closed),
            // Either a full line, or the last unterminated bytes before EOF.
            Ok(Ok(_)) => Ok(LineEvent::Line(self.take_line())),
        }
    }

    fn take_line(&mut self) -> String {
        let line = clean_line(&self.partial);
        self.partial.clear();
        trace!(line = %line, "Received");
        line
    }

    /// Whether the unterminated text waiting in the buffer is a `>` prompt.
    pub fn pending_prompt(&self) -> bool {
        self.partial.trim_ascii_end().ends_with(b">")
    }

    /// The unterminated text waiting in the buffer.
    pub fn pending_text(&self) -> String {
        clean_line(&self.partial)
    }

    pub fn discard_partial(&mut self) {
        self.partial.clear();
    }

    /// Send one line terminated with CR LF.
    pub async fn send_line(&mut self, text: &str) -> io::Result<()> {
        debug!(peer = %self.peer, line = text, "Sending");
        self.writer.write_all(format!("{text}\r\n").as_bytes()).await?;
        self.writer.flush().await
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Decode as text, drop the line ending and telnet control bytes.
fn clean_line(bytes: &[u8]) -> String {
    let mut line = String::from_utf8_lossy(bytes).into_owned();
    line.retain(|c| c == '\t' || !c.is_control());
    line.trim_end().to_string()
}

/// UDP socket receiving WSJT-X datagrams.
pub struct UdpLink {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpLink {
    /// Bind to `address:port`. A multicast address (first octet 224-239)
    /// binds the wildcard address and joins the group instead.
    pub async fn bind(address: &str, port: u16) -> Result<Self, FailureReason> {
        let bind_err = |e: io::Error| FailureReason::Connect(format!("udp {address}:{port}: {e}"));

        let group = address.parse::<Ipv4Addr>().ok().filter(Ipv4Addr::is_multicast);
        let socket = match group {
            Some(group) => {
                let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
                    .await
                    .map_err(bind_err)?;
                socket
                    .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
                    .map_err(bind_err)?;
                info!(%group, port, "Joined WSJT-X multicast group");
                socket
            }
            None => UdpSocket::bind((address, port)).await.map_err(bind_err)?,
        };

        if let Ok(local) = socket.local_addr() {
            info!(%local, "Listening for WSJT-X datagrams");
        }
        Ok(Self {
            socket,
            buf: vec![0; MAX_DATAGRAM],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Every datagram pending now, waiting at most `wait` for the first.
    pub async fn drain(&mut self, wait: Duration) -> io::Result<Vec<Vec<u8>>> {
        let mut datagrams = Vec::new();
        match timeout(wait, self.socket.recv_from(&mut self.buf)).await {
            Err(_) => return Ok(datagrams),
            Ok(Err(e)) => return Err(e),
            Ok(Ok((n, from))) => {
                trace!(%from, len = n, "Datagram");
                datagrams.push(self.buf[..n].to_vec());
            }
        }
        loop {
            match self.socket.try_recv_from(&mut self.buf) {
                Ok((n, from)) => {
                    trace!(%from, len = n, "Datagram");
                    datagrams.push(self.buf[..n].to_vec());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(datagrams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_clean_line() {
        assert_eq!(clean_line(b"DX de K1TTT:  14025.0 W1AW\r\n"), "DX de K1TTT:  14025.0 W1AW");
        assert_eq!(clean_line(b"\x07hello\r\n"), "hello");
    }

    #[tokio::test]
    async fn test_partial_lines_survive_timeouts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"first line\r\nN0CALL de GB7DJK dxspider >").await.unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            sock.write_all(b"\r\nsecond").await.unwrap();
        });

        let mut link = TcpLink::connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();
        let wait = Duration::from_millis(50);

        assert_eq!(
            link.next_line(Duration::from_secs(2)).await.unwrap(),
            LineEvent::Line("first line".to_string())
        );
        assert_eq!(link.next_line(wait).await.unwrap(), LineEvent::Idle);
        assert!(link.pending_prompt());
        assert_eq!(link.pending_text(), "N0CALL de GB7DJK dxspider >");

        assert_eq!(
            link.next_line(Duration::from_secs(2)).await.unwrap(),
            LineEvent::Line("N0CALL de GB7DJK dxspider >".to_string())
        );

        server.await.unwrap();
        assert_eq!(
            link.next_line(Duration::from_secs(2)).await.unwrap(),
            LineEvent::Line("second".to_string())
        );
        assert_eq!(link.next_line(wait).await.unwrap(), LineEvent::Closed);
    }

    #[tokio::test]
    async fn test_udp_drain_collects_all_pending() {
        let mut link = UdpLink::bind("127.0.0.1", 0).await.unwrap();
        let target = link.local_addr().unwrap();

        assert!(link.drain(Duration::from_millis(20)).await.unwrap().is_empty());

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"one", target).await.unwrap();
        sender.send_to(b"two", target).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let got = link.drain(Duration::from_millis(200)).await.unwrap();
        assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec()]);
    }
}
