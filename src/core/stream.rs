use std::io::{self, prelude::*, BufReader, ErrorKind};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use crate::core::error::ConnError;

const MAX_LINE_BYTES: usize = 16 * 1024;

/// A client socket: buffered for reading, with a cloned handle for the response writer.
pub(crate) struct Stream {
    reader: BufReader<TcpStream>,
    peer: Option<SocketAddr>,
}

impl Stream {
    pub(crate) fn new(tcp: TcpStream) -> Self {
        let peer = tcp.peer_addr().ok();
        if let Err(err) = tcp.set_nodelay(true) {
            tracing::debug!(error = %err, "unable to set TCP_NODELAY");
        }

        Stream {
            reader: BufReader::new(tcp),
            peer,
        }
    }

    #[inline]
    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub(crate) fn set_read_timeout(&self, dur: Duration) -> io::Result<()> {
        self.reader.get_ref().set_read_timeout(Some(dur))
    }

    pub(crate) fn writer(&self) -> io::Result<Box<dyn Write + Send>> {
        let tcp = self.reader.get_ref().try_clone()?;
        Ok(Box::new(tcp))
    }

    /// One line without its line break. EOF before any byte is `Closed`.
    pub(crate) fn read_line(&mut self) -> Result<String, ConnError> {
        let mut raw = Vec::with_capacity(128);

        loop {
            let (done, used) = {
                let available = match self.reader.fill_buf() {
                    Ok(bytes) => bytes,
                    Err(err) => return Err(map_read_error(err)),
                };

                if available.is_empty() {
                    if raw.is_empty() {
                        return Err(ConnError::Closed);
                    }
                    break;
                }

                match available.iter().position(|b| *b == b'\n') {
                    Some(pos) => {
                        raw.extend_from_slice(&available[..pos]);
                        (true, pos + 1)
                    }
                    None => {
                        raw.extend_from_slice(available);
                        (false, available.len())
                    }
                }
            };

            self.reader.consume(used);

            if raw.len() > MAX_LINE_BYTES {
                return Err(ConnError::Malformed("line too long".to_owned()));
            }

            if done {
                break;
            }
        }

        if raw.last() == Some(&b'\r') {
            raw.pop();
        }

        String::from_utf8(raw).map_err(|_| ConnError::Malformed("line is not valid UTF-8".to_owned()))
    }

    pub(crate) fn read_body(&mut self, len: usize) -> Result<Vec<u8>, ConnError> {
        let mut body = vec![0u8; len];
        self.reader
            .read_exact(&mut body)
            .map_err(map_read_error)?;
        Ok(body)
    }

    pub(crate) fn shutdown(&self) {
        if let Err(err) = self.reader.get_ref().shutdown(Shutdown::Both) {
            if err.kind() != ErrorKind::NotConnected {
                tracing::debug!(error = %err, "error while shutting down socket");
            }
        }
    }
}

fn map_read_error(err: io::Error) -> ConnError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => ConnError::Timeout,
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
            ConnError::Closed
        }
        _ => ConnError::Io(err),
    }
}
