//! Connections conversations run on.
pub mod pipe;

use std::{io, net};

/// A bidirectional byte stream to a peer.
pub trait Connection: Send + Sync {
    /// Read half, owned by the reader loop.
    type Reader: io::Read + Send;
    /// Write half, owned by the writer loop.
    type Writer: io::Write + Send;

    /// Get independent read and write halves of the connection.
    ///
    /// Conversations run one after the other on the same connection, each with its own halves.
    /// Bytes received but not read through one read half must be readable through the next.
    fn split(&self) -> io::Result<(Self::Reader, Self::Writer)>;

    /// Close the connection, unblocking any pending read or write on either half.
    fn disconnect(&self);
}

impl Connection for net::TcpStream {
    type Reader = net::TcpStream;
    type Writer = net::TcpStream;

    fn split(&self) -> io::Result<(Self::Reader, Self::Writer)> {
        Ok((self.try_clone()?, self.try_clone()?))
    }

    fn disconnect(&self) {
        if let Err(e) = self.shutdown(net::Shutdown::Both) {
            log::debug!(target: "rpc", "Error shutting down connection: {e}");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::{Read, Write};
    use std::thread;

    use super::*;

    #[test]
    fn test_tcp_disconnect_unblocks_reader() {
        let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let (mut reader, mut writer) = server.split().unwrap();
        let mut remote = client.try_clone().unwrap();

        remote.write_all(b"ok").unwrap();
        let mut buf = [0; 2];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");

        thread::scope(|s| {
            let blocked = s.spawn(move || reader.read(&mut buf));
            server.disconnect();

            assert!(matches!(blocked.join().unwrap(), Ok(0) | Err(_)));
        });
        assert!(writer.write_all(&[0; 1024 * 1024]).is_err());
    }
}
