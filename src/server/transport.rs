//! Connection transport: plaintext or TLS on the same port.

use bytes::{Buf, BytesMut};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

/// TLS record type of a handshake.
const TLS_HANDSHAKE: u8 = 0x16;

/// A stream that can take back bytes it already returned.
#[derive(Debug)]
pub struct PushbackStream<S> {
    inner: S,
    pending: BytesMut,
}

impl<S> PushbackStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: BytesMut::new(),
        }
    }

    /// Return `bytes` to the front of the stream.
    pub fn unread(&mut self, bytes: &[u8]) {
        let mut front = BytesMut::with_capacity(bytes.len() + self.pending.len());
        front.extend_from_slice(bytes);
        front.extend_from_slice(&self.pending);
        self.pending = front;
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: Read> Read for PushbackStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.advance(n);
            return Ok(n);
        }
        self.inner.read(buf)
    }
}

impl<S: Write> Write for PushbackStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Read up to `buf.len()` bytes, stopping early only at end of stream.
fn read_up_to<S: Read>(stream: &mut S, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Whether the connection opens with a TLS or SSLv2 ClientHello.
///
/// Peeked bytes are pushed back.
pub fn sniff_tls<S: Read>(stream: &mut PushbackStream<S>) -> io::Result<bool> {
    let mut head = [0u8; 5];
    let n = read_up_to(stream, &mut head[..1])?;
    if n == 0 {
        return Ok(false);
    }

    if head[0] == TLS_HANDSHAKE {
        stream.unread(&head[..1]);
        return Ok(true);
    }

    if head[0] & 0x80 == 0 {
        // printable or control byte: plaintext request
        stream.unread(&head[..1]);
        return Ok(false);
    }

    // SSLv2 record header: length (2 bytes, high bit set), msg type, version
    let n = 1 + read_up_to(stream, &mut head[1..])?;
    let is_v2_hello = n == 5
        && head[2] == 1
        && matches!((head[3], head[4]), (3, 0) | (3, 1) | (0, 2));
    stream.unread(&head[..n]);
    Ok(is_v2_hello)
}

/// The byte stream of one session.
pub enum Transport {
    Plain(PushbackStream<TcpStream>),
    Tls(Box<StreamOwned<ServerConnection, PushbackStream<TcpStream>>>),
}

impl Transport {
    /// Wrap an accepted socket, negotiating TLS when the client asks for it
    /// and `tls` is configured.
    pub fn negotiate(socket: TcpStream, tls: Option<&Arc<ServerConfig>>) -> io::Result<Self> {
        let mut stream = PushbackStream::new(socket);
        match tls {
            Some(config) if sniff_tls(&mut stream)? => Self::handshake(stream, Arc::clone(config)),
            _ => Ok(Transport::Plain(stream)),
        }
    }

    fn handshake(mut stream: PushbackStream<TcpStream>, config: Arc<ServerConfig>) -> io::Result<Self> {
        let mut conn = ServerConnection::new(config)
            .map_err(|e| io::Error::new(ErrorKind::Other, e))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut stream)?;
        }
        Ok(Transport::Tls(Box::new(StreamOwned::new(conn, stream))))
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    pub fn socket(&self) -> &TcpStream {
        match self {
            Transport::Plain(s) => s.get_ref(),
            Transport::Tls(s) => s.sock.get_ref(),
        }
    }

    /// Orderly close: half-close for plaintext, `close_notify` for TLS.
    pub fn close(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => {
                s.flush()?;
                let socket = s.get_ref();
                let _ = socket.shutdown(Shutdown::Read);
                socket.shutdown(Shutdown::Write)
            }
            Transport::Tls(s) => {
                let tls = &mut **s;
                tls.conn.send_close_notify();
                while tls.conn.wants_write() {
                    tls.conn.write_tls(&mut tls.sock)?;
                }
                tls.sock.flush()?;
                let _ = tls.sock.get_ref().shutdown(Shutdown::Both);
                Ok(())
            }
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}
