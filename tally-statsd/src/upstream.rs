use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
#[cfg(unix)]
use std::os::unix::net::UnixDatagram;
use std::sync::{Mutex, PoisonError};

use cadence::MetricSink;

enum Remote {
    Udp(UdpSocket),
    #[cfg(unix)]
    UnixDatagram(UnixDatagram),
}

impl Remote {
    fn connect(addr: &str) -> io::Result<Self> {
        // Try treating the address as a fully-qualified URL, where the scheme is the transport identifier.
        if let Some((scheme, path)) = addr.split_once("://") {
            return match scheme {
                "udp" => Self::connect_udp(path),
                #[cfg(unix)]
                "unixgram" => {
                    let socket = UnixDatagram::unbound()?;
                    socket.connect(path)?;
                    socket.set_nonblocking(true)?;

                    Ok(Self::UnixDatagram(socket))
                }
                _ => Err(io::Error::other(format!(
                    "invalid scheme '{scheme}', expected one of 'udp', 'unixgram'"
                ))),
            };
        }

        // If there is no scheme, fall back to a UDP socket
        Self::connect_udp(addr)
    }

    fn connect_udp(addr: &str) -> io::Result<Self> {
        let remote = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("could not resolve '{addr}'"))
        })?;

        let socket = match remote {
            SocketAddr::V4(_) => UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?,
            SocketAddr::V6(_) => UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0))?,
        };
        socket.connect(remote)?;
        socket.set_nonblocking(true)?;

        Ok(Self::Udp(socket))
    }

    fn bufsize(&self) -> usize {
        match self {
            Self::Udp(_) => 512,
            #[cfg(unix)]
            Self::UnixDatagram(_) => 1024,
        }
    }

    fn send(&self, buf: &[u8]) -> io::Result<()> {
        match self {
            Self::Udp(socket) => socket.send(buf).map(drop),
            #[cfg(unix)]
            Self::UnixDatagram(socket) => socket.send(buf).map(drop),
        }
    }
}

/// A single statsd server that metric lines are batched for.
///
/// Lines are joined with newlines into datagrams no larger than the buffer size. A line that does
/// not fit into an empty buffer is sent on its own.
struct Upstream {
    address: String,
    remote: Remote,
    buffer: Vec<u8>,
    bufsize: usize,
}

impl Upstream {
    fn connect(address: &str, bufsize: Option<usize>) -> io::Result<Self> {
        let remote = Remote::connect(address)?;
        let bufsize = bufsize.unwrap_or_else(|| remote.bufsize());

        Ok(Upstream {
            address: address.to_owned(),
            remote,
            buffer: Vec::with_capacity(bufsize),
            bufsize,
        })
    }

    fn submit(&mut self, metric: &[u8]) -> io::Result<()> {
        let mut result = Ok(());

        if !self.buffer.is_empty() && self.buffer.len() + metric.len() + 1 > self.bufsize {
            // Message bigger than space left in buffer. Flush the buffer.
            result = self.flush();
        }

        if metric.len() > self.bufsize {
            // Message too big for the entire buffer, send it on its own.
            return result.and(self.remote.send(metric));
        }

        if !self.buffer.is_empty() {
            self.buffer.push(b'\n');
        }
        self.buffer.extend_from_slice(metric);

        result
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        // Lines are dropped even if sending fails, there is no retry.
        let result = self.remote.send(&self.buffer);
        self.buffer.clear();
        result
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            tally_log::warn!(
                "failed to send metrics to upstream {}: {error}",
                self.address
            );
        }
    }
}

/// A cadence [`MetricSink`] that writes to one or more statsd servers.
///
/// Every line is delivered to every upstream. Addresses take the form `host:port` or
/// `udp://host:port` for UDP and `unixgram:///path/to/socket` for Unix datagram sockets. All
/// sockets are non-blocking; failed sends are reported but never retried.
///
/// With buffering enabled, lines are held back until [`MetricSink::flush`] is called or the
/// buffer of an upstream would overflow. Without buffering, each line is sent as its own datagram.
pub struct UpstreamSink {
    upstreams: Mutex<Vec<Upstream>>,
    buffering: bool,
}

impl UpstreamSink {
    /// Connects to all given upstream addresses.
    ///
    /// `bufsize` overrides the maximum datagram size, which otherwise defaults to 512 bytes for
    /// UDP and 1024 bytes for Unix datagram sockets.
    pub fn connect<I>(addresses: I, bufsize: Option<usize>, buffering: bool) -> io::Result<Self>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let upstreams = addresses
            .into_iter()
            .map(|address| Upstream::connect(address.as_ref(), bufsize))
            .collect::<io::Result<Vec<_>>>()?;

        if upstreams.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no statsd upstream configured",
            ));
        }

        Ok(Self {
            upstreams: Mutex::new(upstreams),
            buffering,
        })
    }

    /// Returns the addresses of all upstreams.
    pub fn addresses(&self) -> Vec<String> {
        self.lock()
            .iter()
            .map(|upstream| upstream.address.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Upstream>> {
        // Buffers stay consistent even if a previous holder panicked.
        self.upstreams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for UpstreamSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSink")
            .field("upstreams", &self.addresses())
            .field("buffering", &self.buffering)
            .finish()
    }
}

impl MetricSink for UpstreamSink {
    fn emit(&self, metric: &str) -> io::Result<usize> {
        let mut result = Ok(metric.len());

        for upstream in self.lock().iter_mut() {
            let mut sent = upstream.submit(metric.as_bytes());
            if !self.buffering {
                sent = sent.and(upstream.flush());
            }

            if let Err(error) = sent {
                tally_log::warn!(
                    "failed to send metrics to upstream {}: {error}",
                    upstream.address
                );
                if result.is_ok() {
                    result = Err(error);
                }
            }
        }

        result
    }

    fn flush(&self) -> io::Result<()> {
        let mut result = Ok(());

        for upstream in self.lock().iter_mut() {
            if let Err(error) = upstream.flush() {
                tally_log::warn!(
                    "failed to send metrics to upstream {}: {error}",
                    upstream.address
                );
                if result.is_ok() {
                    result = Err(error);
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;

    use super::*;

    fn listen() -> (UdpSocket, String) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let address = socket.local_addr().unwrap().to_string();
        (socket, address)
    }

    fn recv(socket: &UdpSocket) -> String {
        let mut buf = [0; 2048];
        let len = socket.recv(&mut buf).unwrap();
        String::from_utf8(buf[..len].to_vec()).unwrap()
    }

    fn assert_empty(socket: &UdpSocket) {
        socket.set_nonblocking(true).unwrap();
        let mut buf = [0; 2048];
        let error = socket.recv(&mut buf).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::WouldBlock);
        socket.set_nonblocking(false).unwrap();
    }

    #[test]
    fn test_buffered_lines_leave_on_flush() {
        let (socket, address) = listen();
        let sink = UpstreamSink::connect([&address], None, true).unwrap();

        sink.emit("orders.count:1|c").unwrap();
        sink.emit("cart.size:3|g").unwrap();
        assert_empty(&socket);

        sink.flush().unwrap();
        assert_eq!(recv(&socket), "orders.count:1|c\ncart.size:3|g");
    }

    #[test]
    fn test_unbuffered_lines_leave_immediately() {
        let (socket, address) = listen();
        let sink = UpstreamSink::connect([format!("udp://{address}")], None, false).unwrap();

        sink.emit("a:1|c").unwrap();
        sink.emit("b:2|c").unwrap();

        assert_eq!(recv(&socket), "a:1|c");
        assert_eq!(recv(&socket), "b:2|c");
    }

    #[test]
    fn test_buffer_overflow_sends_batch() {
        let (socket, address) = listen();
        let sink = UpstreamSink::connect([&address], Some(12), true).unwrap();

        sink.emit("a:1|c").unwrap();
        sink.emit("b:2|c").unwrap();
        // Does not fit next to the first two lines.
        sink.emit("c:3|c").unwrap();
        assert_eq!(recv(&socket), "a:1|c\nb:2|c");

        // Larger than the whole buffer.
        sink.emit("oversized:100|ms").unwrap();
        assert_eq!(recv(&socket), "c:3|c");
        assert_eq!(recv(&socket), "oversized:100|ms");
    }

    #[test]
    fn test_every_upstream_receives_every_line() {
        let (first, first_address) = listen();
        let (second, second_address) = listen();
        let sink = UpstreamSink::connect([first_address, second_address], None, true).unwrap();

        sink.emit("a:1|c").unwrap();
        sink.flush().unwrap();

        assert_eq!(recv(&first), "a:1|c");
        assert_eq!(recv(&second), "a:1|c");
    }

    #[test]
    fn test_drop_flushes() {
        let (socket, address) = listen();
        let sink = UpstreamSink::connect([&address], None, true).unwrap();

        sink.emit("a:1|c").unwrap();
        drop(sink);

        assert_eq!(recv(&socket), "a:1|c");
    }

    #[test]
    fn test_invalid_scheme() {
        let error = UpstreamSink::connect(["tcp://127.0.0.1:8125"], None, true).unwrap_err();
        assert_eq!(
            error.to_string(),
            "invalid scheme 'tcp', expected one of 'udp', 'unixgram'"
        );
    }

    #[test]
    fn test_no_upstreams() {
        let error = UpstreamSink::connect(Vec::<String>::new(), None, true).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
    }
}
