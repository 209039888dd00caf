/// Socket-backed HTTP/1.1 client connection.

use crate::error::{Error, Result};
use crate::rewrite::bracket_host;
use crate::secure::{SecureLayer, SecureStream};
use crate::transport::codec::{self, Framing};
use crate::transport::{Response, Transport};
use http::header::HeaderMap;
use http::{Method, Uri};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Where and how to open the socket. Reused verbatim by `reconnect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    /// Applied to connect, read and write.
    pub timeout: Option<Duration>,
    /// Local address to bind before connecting.
    pub source_address: Option<SocketAddr>,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ConnectOptions {
            host: host.into(),
            port,
            timeout: None,
            source_address: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_source_address(mut self, addr: SocketAddr) -> Self {
        self.source_address = Some(addr);
        self
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", bracket_host(&self.host), self.port)
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

enum Stream {
    Plain(TcpStream),
    Secure(Box<dyn SecureStream>),
}

impl Stream {
    fn socket(&self) -> &TcpStream {
        match self {
            Stream::Plain(s) => s,
            Stream::Secure(s) => s.socket(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::Secure(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::Secure(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::Secure(s) => s.flush(),
        }
    }
}

#[derive(Debug)]
enum State {
    Idle,
    AwaitingResponse { method: Method },
}

// ---------------------------------------------------------------------------
// HttpConnection
// ---------------------------------------------------------------------------

/// One blocking HTTP/1.1 connection owning at most one socket at a time.
///
/// The socket is opened lazily on the first request. Responses are read in
/// full, so a request can always follow a `get_response`.
pub struct HttpConnection {
    options: ConnectOptions,
    stream: Option<BufReader<Stream>>,
    state: State,
    generation: u64,
    close_suppressed: bool,
    /// A close arrived while suppressed; applied once suppression ends.
    close_pending: bool,
    secure_on_connect: Option<(Arc<dyn SecureLayer>, String)>,
}

impl HttpConnection {
    pub fn new(options: ConnectOptions) -> Self {
        HttpConnection {
            options,
            stream: None,
            state: State::Idle,
            generation: 0,
            close_suppressed: false,
            close_pending: false,
            secure_on_connect: None,
        }
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.stream.as_ref().map(BufReader::get_ref), Some(Stream::Secure(_)))
    }

    /// Number of sockets opened so far. Changes on every (re)connect.
    pub fn socket_generation(&self) -> u64 {
        self.generation
    }

    /// Local address of the live socket, which identifies it.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream
            .as_ref()
            .and_then(|s| s.get_ref().socket().local_addr().ok())
    }

    /// Apply `layer` to every socket this connection opens from now on.
    pub fn secure_on_connect(&mut self, layer: Arc<dyn SecureLayer>, server_name: impl Into<String>) {
        self.secure_on_connect = Some((layer, server_name.into()));
    }

    /// Open the socket if none is open.
    pub fn connect(&mut self) -> Result<()> {
        if self.stream.is_none() {
            self.open()?;
        }
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        let socket = open_socket(&self.options)?;
        self.generation += 1;
        debug!(
            host = %self.options.host,
            port = self.options.port,
            socket = ?socket.local_addr().ok(),
            generation = self.generation,
            "socket opened"
        );
        let stream = match &self.secure_on_connect {
            Some((layer, server_name)) => Stream::Secure(layer.wrap(socket, server_name)?),
            None => Stream::Plain(socket),
        };
        self.stream = Some(BufReader::new(stream));
        self.state = State::Idle;
        Ok(())
    }

    /// Hand out the live plain socket so a secure layer can be started on it.
    ///
    /// Fails if the peer already sent bytes past the last response, since
    /// those belong to the secure session and would be lost.
    pub fn take_live_socket(&mut self) -> Result<TcpStream> {
        if let State::AwaitingResponse { .. } = self.state {
            return Err(Error::ResponseNotRead);
        }
        let reader = self
            .stream
            .take()
            .ok_or_else(|| Error::Transport(io::Error::new(ErrorKind::NotConnected, "no live socket")))?;
        if !reader.buffer().is_empty() {
            return Err(Error::protocol(format!(
                "{} unexpected bytes after tunnel response",
                reader.buffer().len()
            )));
        }
        match reader.into_inner() {
            Stream::Plain(socket) => Ok(socket),
            Stream::Secure(_) => Err(Error::Tls("connection is already secured".into())),
        }
    }

    /// Continue on `stream`, which wraps the socket from `take_live_socket`.
    pub fn install_secure(&mut self, stream: Box<dyn SecureStream>) {
        self.stream = Some(BufReader::new(Stream::Secure(stream)));
        self.state = State::Idle;
    }

    fn host_header(&self, method: &Method, target: &str) -> String {
        if *method == Method::CONNECT {
            return target.to_string();
        }
        if let Ok(uri) = target.parse::<Uri>() {
            if let Some(authority) = uri.authority() {
                return authority.as_str().to_string();
            }
        }
        let default_port = if self.is_secure() || self.secure_on_connect.is_some() { 443 } else { 80 };
        if self.options.port == default_port {
            bracket_host(&self.options.host)
        } else {
            self.options.authority()
        }
    }

    fn drop_stream(&mut self) {
        self.stream = None;
        self.state = State::Idle;
        self.close_pending = false;
    }
}

impl Transport for HttpConnection {
    fn send_request(
        &mut self,
        method: &Method,
        url: &str,
        body: Option<&[u8]>,
        headers: &HeaderMap,
    ) -> Result<()> {
        if let State::AwaitingResponse { .. } = self.state {
            return Err(Error::ResponseNotRead);
        }
        self.connect()?;
        let host = self.host_header(method, url);
        trace!(%method, url, "sending request");

        let Some(reader) = self.stream.as_mut() else {
            return Err(Error::Transport(io::Error::new(ErrorKind::NotConnected, "no live socket")));
        };
        if let Err(e) = codec::write_request(reader.get_mut(), method, url, &host, headers, body) {
            self.drop_stream();
            return Err(e);
        }
        self.state = State::AwaitingResponse { method: method.clone() };
        Ok(())
    }

    fn get_response(&mut self) -> Result<Response> {
        let method = match std::mem::replace(&mut self.state, State::Idle) {
            State::AwaitingResponse { method } => method,
            State::Idle => return Err(Error::NoPendingRequest),
        };
        let Some(reader) = self.stream.as_mut() else {
            return Err(Error::Transport(io::Error::new(ErrorKind::NotConnected, "no live socket")));
        };

        let (response, framing) = match codec::read_response(reader, &method) {
            Ok(r) => r,
            Err(e) => {
                self.drop_stream();
                return Err(e);
            }
        };
        trace!(status = response.status.as_u16(), ?framing, body = response.body.len(), "response read");

        // A 2xx to CONNECT turns the socket into the tunnel.
        let tunnel = method == Method::CONNECT && response.status.is_success();
        if !tunnel && (response.wants_close() || framing == Framing::UntilClose) {
            self.close();
        }
        Ok(response)
    }

    fn reconnect(&mut self) -> Result<()> {
        self.drop_stream();
        self.open()
    }

    fn close(&mut self) {
        if self.close_suppressed {
            trace!("close deferred until suppression ends");
            self.close_pending = self.stream.is_some();
            return;
        }
        if self.stream.is_some() {
            debug!(host = %self.options.host, port = self.options.port, "socket closed");
        }
        self.drop_stream();
    }

    fn set_close_suppressed(&mut self, suppressed: bool) {
        self.close_suppressed = suppressed;
        if !suppressed && self.close_pending {
            self.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Socket setup
// ---------------------------------------------------------------------------

fn open_socket(options: &ConnectOptions) -> io::Result<TcpStream> {
    let candidates: Vec<SocketAddr> = (options.host.as_str(), options.port).to_socket_addrs()?.collect();
    if candidates.is_empty() {
        return Err(io::Error::new(
            ErrorKind::NotFound,
            format!("'{}' did not resolve to any address", options.host),
        ));
    }

    let mut last_error = None;
    for target in candidates {
        match connect_with_optional_bind(target, options.source_address, options.timeout) {
            Ok(stream) => {
                stream.set_read_timeout(options.timeout)?;
                stream.set_write_timeout(options.timeout)?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| io::Error::new(ErrorKind::NotConnected, "no address tried")))
}

fn connect_with_optional_bind(
    target: SocketAddr,
    bind: Option<SocketAddr>,
    timeout: Option<Duration>,
) -> io::Result<TcpStream> {
    let Some(bind) = bind else {
        return match timeout {
            Some(t) => TcpStream::connect_timeout(&target, t),
            None => TcpStream::connect(target),
        };
    };
    if target.is_ipv4() != bind.is_ipv4() {
        return Err(io::Error::new(
            ErrorKind::AddrNotAvailable,
            "source address family does not match target",
        ));
    }

    let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))?;
    socket.bind(&SockAddr::from(bind))?;
    let target = SockAddr::from(target);
    match timeout {
        Some(t) => socket.connect_timeout(&target, t)?,
        None => socket.connect(&target)?,
    }
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::net::TcpListener;
    use std::thread;

    /// Accept one connection, answer each request head with the next canned
    /// response, and return the request heads seen.
    fn serve(replies: Vec<&'static str>) -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let mut reader = io::BufReader::new(sock.try_clone().unwrap());
            let mut writer = sock;
            let mut heads = Vec::new();
            for reply in replies {
                let mut head = String::new();
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap() == 0 {
                        return heads;
                    }
                    if line == "\r\n" {
                        break;
                    }
                    head.push_str(&line);
                }
                heads.push(head);
                writer.write_all(reply.as_bytes()).unwrap();
            }
            heads
        });
        (port, handle)
    }

    #[test]
    fn test_request_response_cycle() {
        let (port, server) = serve(vec![
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
            "HTTP/1.1 204 No Content\r\n\r\n",
        ]);
        let mut conn = HttpConnection::new(ConnectOptions::new("127.0.0.1", port));
        assert!(!conn.is_connected());

        conn.send_request(&Method::GET, "/a", None, &HeaderMap::new()).unwrap();
        assert!(matches!(
            conn.send_request(&Method::GET, "/b", None, &HeaderMap::new()),
            Err(Error::ResponseNotRead)
        ));
        let r = conn.get_response().unwrap();
        assert_eq!(r.body, b"ok");
        assert!(matches!(conn.get_response(), Err(Error::NoPendingRequest)));

        conn.send_request(&Method::DELETE, "http://example.com:8080/x", None, &HeaderMap::new())
            .unwrap();
        assert_eq!(conn.get_response().unwrap().status.as_u16(), 204);
        assert_eq!(conn.socket_generation(), 1);

        let heads = server.join().unwrap();
        assert!(heads[0].starts_with("GET /a HTTP/1.1\r\n"));
        assert!(heads[0].contains(&format!("Host: 127.0.0.1:{}\r\n", port)));
        assert!(heads[1].contains("Host: example.com:8080\r\n"));
    }

    #[test]
    fn test_connection_close_deferred_while_suppressed() {
        let (port, _server) = serve(vec![
            "HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n",
            "HTTP/1.1 407 Proxy Authentication Required\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        ]);
        let mut conn = HttpConnection::new(ConnectOptions::new("127.0.0.1", port));

        // Nothing asked for a close: lifting suppression keeps the socket.
        conn.set_close_suppressed(true);
        conn.send_request(&Method::CONNECT, "example.com:443", None, &HeaderMap::new())
            .unwrap();
        conn.get_response().unwrap();
        conn.set_close_suppressed(false);
        assert!(conn.is_connected());

        conn.set_close_suppressed(true);
        conn.send_request(&Method::CONNECT, "example.com:443", None, &HeaderMap::new())
            .unwrap();
        conn.get_response().unwrap();
        assert!(conn.is_connected());
        conn.close();
        assert!(conn.is_connected());

        conn.set_close_suppressed(false);
        assert!(!conn.is_connected());
        assert_eq!(conn.socket_generation(), 1);
    }

    #[test]
    fn test_connect_success_keeps_socket() {
        let (port, _server) = serve(vec!["HTTP/1.0 200 Connection established\r\n\r\n"]);
        let mut conn = HttpConnection::new(ConnectOptions::new("127.0.0.1", port));
        conn.send_request(&Method::CONNECT, "example.com:443", None, &HeaderMap::new())
            .unwrap();
        assert!(conn.get_response().unwrap().wants_close());
        assert!(conn.is_connected());
        assert!(conn.take_live_socket().is_ok());
    }

    #[test]
    fn test_reconnect_discards_deferred_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepter = thread::spawn(move || (listener.accept().unwrap(), listener.accept().unwrap()));

        let mut conn = HttpConnection::new(ConnectOptions::new("127.0.0.1", port));
        conn.connect().unwrap();
        conn.set_close_suppressed(true);
        conn.close();
        conn.reconnect().unwrap();
        conn.set_close_suppressed(false);
        assert!(conn.is_connected());
        assert_eq!(conn.socket_generation(), 2);
        drop(accepter.join().unwrap());
    }

    #[test]
    fn test_reconnect_replaces_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepter = thread::spawn(move || {
            let a = listener.accept().unwrap();
            let b = listener.accept().unwrap();
            (a, b)
        });

        let mut conn = HttpConnection::new(ConnectOptions::new("127.0.0.1", port));
        conn.connect().unwrap();
        let first = conn.local_addr().unwrap();
        conn.reconnect().unwrap();
        let second = conn.local_addr().unwrap();
        assert_ne!(first, second);
        assert_eq!(conn.socket_generation(), 2);

        let ((_, peer_a), (_, peer_b)) = accepter.join().unwrap();
        assert_eq!(peer_a, first);
        assert_eq!(peer_b, second);
    }

    #[test]
    fn test_take_live_socket_rejects_buffered_bytes() {
        let (port, _server) = serve(vec!["HTTP/1.1 200 Connection established\r\n\r\nEARLY"]);
        let mut conn = HttpConnection::new(ConnectOptions::new("127.0.0.1", port));
        conn.send_request(&Method::CONNECT, "example.com:443", None, &HeaderMap::new())
            .unwrap();
        // Give the whole reply time to land in one read.
        thread::sleep(Duration::from_millis(50));
        conn.get_response().unwrap();
        let err = conn.take_live_socket().unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn test_refused_connect_is_transport_error() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let mut conn = HttpConnection::new(
            ConnectOptions::new("127.0.0.1", port).with_timeout(Duration::from_secs(2)),
        );
        let err = conn.send_request(&Method::GET, "/", None, &HeaderMap::new()).unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn test_source_address_bind() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepter = thread::spawn(move || listener.accept().unwrap().1);

        let source: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut conn = HttpConnection::new(ConnectOptions::new("127.0.0.1", port).with_source_address(source));
        conn.connect().unwrap();
        assert_eq!(accepter.join().unwrap(), conn.local_addr().unwrap());
    }
}
