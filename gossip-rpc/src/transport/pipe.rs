//! In-memory duplex connection over channels.
use std::io::Read;
use std::sync::{Arc, Mutex, PoisonError};
use std::{fmt, io};

use crossbeam_channel as chan;

use super::Connection;

/// Data that can be sent and received on a pipe.
pub enum ChannelEvent {
    /// Connection data.
    Data(Vec<u8>),
    /// A request to close the connection, from the local side.
    Close,
    /// The remote side went away.
    Eof,
}

impl fmt::Debug for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(data) => write!(f, "ChannelEvent::Data({} bytes)", data.len()),
            Self::Close => write!(f, "ChannelEvent::Close"),
            Self::Eof => write!(f, "ChannelEvent::Eof"),
        }
    }
}

/// One end of an in-memory connection.
///
/// Everything written on one end is read on the other. Disconnecting an end fails reads on
/// both ends. Data received but not yet read stays with the pipe, so a reader obtained from a
/// later [`Connection::split`] picks up where the previous one stopped.
#[derive(Debug)]
pub struct Pipe {
    /// Sends to the remote end.
    sender: chan::Sender<ChannelEvent>,
    /// Receives from the remote end.
    receiver: chan::Receiver<ChannelEvent>,
    /// Sends to our own reader.
    local: chan::Sender<ChannelEvent>,
    /// Received data not yet read, shared by every reader of this end.
    pending: Arc<Mutex<io::Cursor<Vec<u8>>>>,
}

impl Pipe {
    /// Create both ends of a connection.
    pub fn pair() -> (Pipe, Pipe) {
        let (l_send, r_recv) = chan::unbounded::<ChannelEvent>();
        let (r_send, l_recv) = chan::unbounded::<ChannelEvent>();

        let l = Pipe {
            sender: l_send.clone(),
            receiver: l_recv,
            local: r_send.clone(),
            pending: Arc::default(),
        };
        let r = Pipe {
            sender: r_send,
            receiver: r_recv,
            local: l_send,
            pending: Arc::default(),
        };
        (l, r)
    }
}

impl Connection for Pipe {
    type Reader = ChannelReader;
    type Writer = ChannelWriter;

    fn split(&self) -> io::Result<(Self::Reader, Self::Writer)> {
        let reader = ChannelReader {
            buffer: self.pending.clone(),
            receiver: self.receiver.clone(),
        };
        let writer = ChannelWriter {
            sender: self.sender.clone(),
        };
        Ok((reader, writer))
    }

    fn disconnect(&self) {
        self.local.send(ChannelEvent::Close).ok();
        self.sender.send(ChannelEvent::Eof).ok();
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.sender.send(ChannelEvent::Eof).ok();
    }
}

/// Wraps a [`chan::Receiver`] and provides it with [`io::Read`].
pub struct ChannelReader {
    buffer: Arc<Mutex<io::Cursor<Vec<u8>>>>,
    receiver: chan::Receiver<ChannelEvent>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let read = buffer.read(buf)?;
        if read > 0 {
            return Ok(read);
        }

        match self.receiver.recv() {
            Ok(ChannelEvent::Data(data)) => {
                *buffer = io::Cursor::new(data);
                buffer.read(buf)
            }
            Ok(ChannelEvent::Eof) => Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(ChannelEvent::Close) => Err(io::ErrorKind::ConnectionReset.into()),

            Err(_) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "error reading from stream: channel is disconnected",
            )),
        }
    }
}

/// Wraps a [`chan::Sender`] and provides it with [`io::Write`].
#[derive(Clone)]
pub struct ChannelWriter {
    sender: chan::Sender<ChannelEvent>,
}

impl io::Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.sender
            .send(ChannelEvent::Data(buf.to_vec()))
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "error writing to stream: channel is disconnected",
                )
            })?;

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
