//! A remote framebuffer (VNC) client that does just enough to press buttons on a touchscreen.
//!
//! Supports RFB 3.8 with VNC authentication and the PointerEvent message, nothing else. All
//! operations block the calling thread and every socket operation carries a timeout, so a
//! [`DisplayLink`] must be driven from a thread that is allowed to block (e.g.
//! [`tokio::task::spawn_blocking`]).

use des::Des;
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, trace};

pub const PROTOCOL_VERSION: &[u8; 12] = b"RFB 003.008\n";
const SECURITY_TYPE_VNC_AUTH: u8 = 2;
const CLIENT_INIT_SHARED: u8 = 1;
const MESSAGE_POINTER_EVENT: u8 = 5;
const BUTTON_LEFT: u8 = 1;
/// Upper bound for any server supplied string (desktop name, failure reason) we read.
const MAX_STRING_LENGTH: u32 = 4096;
/// `drain` gives up after discarding this much, even if the server keeps sending.
const MAX_DRAIN_BYTES: usize = 16 << 20;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not resolve `{1}`")]
    Resolve(#[source] io::Error, String),
    #[error("could not connect to `{1}`")]
    Connect(#[source] io::Error, String),
    #[error("could not configure the socket")]
    Configure(#[source] io::Error),
    #[error("could not read the server protocol version")]
    ReadVersion(#[source] io::Error),
    #[error("server speaks an unsupported protocol version {0:?}")]
    UnsupportedVersion(String),
    #[error("security handshake with the server failed")]
    Handshake(#[source] io::Error),
    #[error("server refused the connection: {0}")]
    Refused(String),
    #[error("server does not offer VNC authentication (offered security types {0:?})")]
    NoVncAuthentication(Vec<u8>),
    #[error("server rejected the password: {}", .0.as_deref().unwrap_or("no reason given"))]
    AuthenticationFailed(Option<String>),
    #[error("could not complete session initialization")]
    Initialize(#[source] io::Error),
    #[error("could not send a pointer event")]
    PointerEvent(#[source] io::Error),
    #[error("the display session is not connected")]
    NotConnected,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// `host:port` of the VNC server.
    pub address: String,
    pub password: String,
    /// Bound for connecting and for every read or write on the socket.
    pub timeout: Duration,
    /// How long `drain` waits for more data before deciding there is none.
    pub drain_timeout: Duration,
    /// Pause between the move, press and release events of a click.
    pub pointer_event_gap: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Disconnected,
    /// Version negotiated and password accepted.
    Authenticated,
    /// Client and server initialization messages exchanged; pointer events may be sent.
    Ready,
}

pub struct DisplayLink {
    config: Config,
    stream: Option<TcpStream>,
    state: State,
}

impl DisplayLink {
    pub fn new(config: Config) -> Self {
        Self { config, stream: None, state: State::Disconnected }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Connect, negotiate the protocol version and authenticate with the configured password.
    ///
    /// On failure the socket has already been closed when the error is returned.
    pub fn connect(&mut self) -> Result<(), Error> {
        self.close();
        let address = self.config.address.as_str();
        info!(message = "connecting to the display server", address);
        let candidates = address
            .to_socket_addrs()
            .map_err(|e| Error::Resolve(e, address.to_string()))?;
        let mut last_error = None;
        let mut stream = None;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, self.config.timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    debug!(message = "connection attempt failed", %candidate, error = %e);
                    last_error = Some(e);
                }
            }
        }
        let Some(mut stream) = stream else {
            let e = last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses"));
            return Err(Error::Connect(e, address.to_string()));
        };
        let result = configure(&stream, self.config.timeout)
            .and_then(|()| authenticate(&mut stream, self.config.password.as_bytes()));
        if let Err(e) = result {
            if let Err(shutdown_error) = stream.shutdown(Shutdown::Both) {
                trace!(message = "closing after failed handshake", error = %shutdown_error);
            }
            return Err(e);
        }
        info!(message = "authenticated with the display server");
        self.stream = Some(stream);
        self.state = State::Authenticated;
        Ok(())
    }

    /// Send ClientInit asking for a shared session and consume the ServerInit message.
    pub fn finish_handshake(&mut self) -> Result<(), Error> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        initialize(stream)?;
        self.state = State::Ready;
        Ok(())
    }

    /// Tap the screen at `(x, y)`: move there, press and release the left button, then wait
    /// `settle` for the HMI to react.
    pub fn click(&mut self, x: u16, y: u16, settle: Duration) -> Result<(), Error> {
        if self.state != State::Ready {
            return Err(Error::NotConnected);
        }
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        trace!(message = "click", x, y);
        for (index, buttons) in [0, BUTTON_LEFT, 0].into_iter().enumerate() {
            if index > 0 && !self.config.pointer_event_gap.is_zero() {
                std::thread::sleep(self.config.pointer_event_gap);
            }
            stream.write_all(&pointer_event(buttons, x, y)).map_err(Error::PointerEvent)?;
        }
        stream.flush().map_err(Error::PointerEvent)?;
        std::thread::sleep(settle);
        Ok(())
    }

    /// Discard whatever the server has sent us so far (framebuffer updates, bells, ...).
    ///
    /// Timeouts and a closed connection end the drain; they are not errors.
    pub fn drain(&mut self) -> Result<(), Error> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        stream.set_read_timeout(Some(self.config.drain_timeout)).map_err(Error::Configure)?;
        let mut buffer = vec![0; 64 << 10];
        let mut drained = 0;
        while drained < MAX_DRAIN_BYTES {
            match stream.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => drained += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    trace!(message = "drain finished", reason = %e);
                    break;
                }
            }
        }
        debug!(message = "drained unsolicited server data", bytes = drained);
        stream.set_read_timeout(Some(self.config.timeout)).map_err(Error::Configure)?;
        Ok(())
    }

    /// Close the connection. Does nothing if it is not open.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                trace!(message = "error while closing the display session", error = %e);
            }
            debug!("display session closed");
        }
        self.state = State::Disconnected;
    }
}

impl Drop for DisplayLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn configure(stream: &TcpStream, timeout: Duration) -> Result<(), Error> {
    stream.set_read_timeout(Some(timeout)).map_err(Error::Configure)?;
    stream.set_write_timeout(Some(timeout)).map_err(Error::Configure)?;
    let nodelay_result = stream.set_nodelay(true);
    trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
    Ok(())
}

/// Run the protocol version and security handshakes up to and including the SecurityResult.
fn authenticate<S: Read + Write>(io: &mut S, password: &[u8]) -> Result<(), Error> {
    let mut version = [0; 12];
    io.read_exact(&mut version).map_err(Error::ReadVersion)?;
    if !is_supported_version(&version) {
        return Err(Error::UnsupportedVersion(String::from_utf8_lossy(&version).into_owned()));
    }
    trace!(message = "server version", version = %String::from_utf8_lossy(&version).trim_end());
    io.write_all(PROTOCOL_VERSION).map_err(Error::Handshake)?;

    let count = read_u8(io).map_err(Error::Handshake)?;
    if count == 0 {
        let reason = read_string(io).map_err(Error::Handshake)?;
        return Err(Error::Refused(reason));
    }
    let mut security_types = vec![0; usize::from(count)];
    io.read_exact(&mut security_types).map_err(Error::Handshake)?;
    if !security_types.contains(&SECURITY_TYPE_VNC_AUTH) {
        return Err(Error::NoVncAuthentication(security_types));
    }
    io.write_all(&[SECURITY_TYPE_VNC_AUTH]).map_err(Error::Handshake)?;

    let mut challenge = [0; 16];
    io.read_exact(&mut challenge).map_err(Error::Handshake)?;
    io.write_all(&vnc_auth_response(password, &challenge)).map_err(Error::Handshake)?;

    let mut status = [0; 4];
    io.read_exact(&mut status).map_err(Error::Handshake)?;
    if u32::from_be_bytes(status) != 0 {
        let reason = read_string(io)
            .inspect_err(|e| trace!(message = "no failure reason", error = %e))
            .ok();
        return Err(Error::AuthenticationFailed(reason));
    }
    Ok(())
}

fn initialize<S: Read + Write>(io: &mut S) -> Result<(), Error> {
    io.write_all(&[CLIENT_INIT_SHARED]).map_err(Error::Initialize)?;
    // width, height, 16 bytes of pixel format, name length.
    let mut server_init = [0; 24];
    io.read_exact(&mut server_init).map_err(Error::Initialize)?;
    let width = u16::from_be_bytes([server_init[0], server_init[1]]);
    let height = u16::from_be_bytes([server_init[2], server_init[3]]);
    let name_length = u32::from_be_bytes([
        server_init[20],
        server_init[21],
        server_init[22],
        server_init[23],
    ]);
    // Anything past the bound is left for `drain` to discard.
    let mut name = vec![0; name_length.min(MAX_STRING_LENGTH) as usize];
    io.read_exact(&mut name).map_err(Error::Initialize)?;
    debug!(
        message = "session initialized",
        width,
        height,
        name = %String::from_utf8_lossy(&name)
    );
    Ok(())
}

/// Whether the server's `RFB xxx.yyy\n` line announces 3.8 or anything later.
///
/// Later versions (RealVNC announces 4.x and 5.x) accept a 3.8 client. Earlier ones use a
/// different security handshake.
fn is_supported_version(version: &[u8; 12]) -> bool {
    let Some(rest) = version.strip_prefix(b"RFB ") else {
        return false;
    };
    let number = |digits: &[u8]| -> Option<u16> {
        if !digits.iter().all(u8::is_ascii_digit) {
            return None;
        }
        std::str::from_utf8(digits).ok()?.parse().ok()
    };
    let (Some(major), Some(minor)) = (number(&rest[..3]), number(&rest[4..7])) else {
        return false;
    };
    rest[3] == b'.' && rest[7] == b'\n' && (major, minor) >= (3, 8)
}

fn read_u8<R: Read>(io: &mut R) -> io::Result<u8> {
    let mut byte = [0];
    io.read_exact(&mut byte)?;
    Ok(byte[0])
}

/// Read a `u32` length prefixed string, as used for failure reasons.
fn read_string<R: Read>(io: &mut R) -> io::Result<String> {
    let mut length = [0; 4];
    io.read_exact(&mut length)?;
    let length = u32::from_be_bytes(length).min(MAX_STRING_LENGTH);
    let mut reason = vec![0; length as usize];
    io.read_exact(&mut reason)?;
    Ok(String::from_utf8_lossy(&reason).into_owned())
}

pub fn pointer_event(buttons: u8, x: u16, y: u16) -> [u8; 6] {
    let [x0, x1] = x.to_be_bytes();
    let [y0, y1] = y.to_be_bytes();
    [MESSAGE_POINTER_EVENT, buttons, x0, x1, y0, y1]
}

/// The DES key VNC authentication derives from a password.
///
/// The first eight password bytes are used (zero padded) with the bit order of every byte
/// reversed.
pub fn vnc_key(password: &[u8]) -> [u8; 8] {
    let mut key = [0; 8];
    for (k, p) in key.iter_mut().zip(password) {
        *k = p.reverse_bits();
    }
    key
}

/// Encrypt both halves of the challenge independently with the password derived key.
pub fn vnc_auth_response(password: &[u8], challenge: &[u8; 16]) -> [u8; 16] {
    let key = vnc_key(password);
    let cipher = Des::new(GenericArray::from_slice(&key));
    let mut response = *challenge;
    for block in response.chunks_exact_mut(8) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    response
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpListener;

    /// A byte stream that replays what a server would send and records what the client writes.
    struct Scripted {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Scripted {
        fn new(input: impl IntoIterator<Item = u8>) -> Self {
            Self { input: Cursor::new(input.into_iter().collect()), output: Vec::new() }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    const CHALLENGE: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
    const RESPONSE_111111: [u8; 16] = [
        0x7a, 0xf9, 0xc3, 0xbe, 0x7f, 0x47, 0x98, 0xed, 0x80, 0xe3, 0x44, 0x32, 0x12, 0x14, 0x71,
        0x5b,
    ];

    fn server_hello(security_types: &[u8]) -> Vec<u8> {
        let mut bytes = PROTOCOL_VERSION.to_vec();
        bytes.push(security_types.len() as u8);
        bytes.extend(security_types);
        bytes
    }

    #[test]
    fn key_reverses_bits_of_each_byte() {
        assert_eq!(vnc_key(b"111111"), [0x8c, 0x8c, 0x8c, 0x8c, 0x8c, 0x8c, 0, 0]);
        assert_eq!(vnc_key(b"0123456789"), [0x0c, 0x8c, 0x4c, 0xcc, 0x2c, 0xac, 0x6c, 0xec]);
    }

    #[test]
    fn auth_response_matches_reference_vectors() {
        assert_eq!(vnc_auth_response(b"111111", &CHALLENGE), RESPONSE_111111);
        let challenge = [
            0xf0, 0xe1, 0xd2, 0xc3, 0xb4, 0xa5, 0x96, 0x87, 0x78, 0x69, 0x5a, 0x4b, 0x3c, 0x2d,
            0x1e, 0x0f,
        ];
        let expected = [
            0x03, 0x04, 0x47, 0x07, 0xea, 0x80, 0x84, 0xf6, 0x27, 0x60, 0xf2, 0x2e, 0xe1, 0x1f,
            0x1c, 0xbd,
        ];
        assert_eq!(vnc_auth_response(b"0123456789", &challenge), expected);
    }

    #[test]
    fn handshake_sends_version_selection_and_response() {
        let mut input = server_hello(&[1, 2]);
        input.extend(CHALLENGE);
        input.extend([0, 0, 0, 0]);
        let mut io = Scripted::new(input);
        authenticate(&mut io, b"111111").unwrap();
        let mut expected = PROTOCOL_VERSION.to_vec();
        expected.push(SECURITY_TYPE_VNC_AUTH);
        expected.extend(RESPONSE_111111);
        assert_eq!(io.output, expected);
    }

    #[test]
    fn rejected_password_reports_reason() {
        let mut input = server_hello(&[2]);
        input.extend(CHALLENGE);
        input.extend([0, 0, 0, 1, 0, 0, 0, 4]);
        input.extend(b"nope");
        let mut io = Scripted::new(input);
        let error = authenticate(&mut io, b"wrong").unwrap_err();
        assert!(matches!(error, Error::AuthenticationFailed(Some(r)) if r == "nope"));
    }

    #[test]
    fn missing_vnc_auth_is_refused() {
        let mut io = Scripted::new(server_hello(&[1, 16]));
        let error = authenticate(&mut io, b"111111").unwrap_err();
        assert!(matches!(error, Error::NoVncAuthentication(types) if types == [1, 16]));
    }

    #[test]
    fn server_refusal_carries_reason() {
        let mut input = PROTOCOL_VERSION.to_vec();
        input.extend([0, 0, 0, 0, 4]);
        input.extend(b"busy");
        let mut io = Scripted::new(input);
        let error = authenticate(&mut io, b"111111").unwrap_err();
        assert!(matches!(error, Error::Refused(r) if r == "busy"));
    }

    #[test]
    fn old_protocol_versions_are_rejected() {
        let mut io = Scripted::new(b"RFB 003.003\n".iter().copied());
        let error = authenticate(&mut io, b"111111").unwrap_err();
        assert!(matches!(error, Error::UnsupportedVersion(_)));
        assert!(io.output.is_empty());
    }

    #[test]
    fn later_protocol_versions_get_a_3_8_reply() {
        let mut input = b"RFB 004.001\n".to_vec();
        input.extend([2, 1, 2]);
        input.extend(CHALLENGE);
        input.extend([0, 0, 0, 0]);
        let mut io = Scripted::new(input);
        authenticate(&mut io, b"111111").unwrap();
        assert_eq!(&io.output[..12], PROTOCOL_VERSION);
    }

    #[test]
    fn version_line_must_be_well_formed() {
        assert!(is_supported_version(b"RFB 003.008\n"));
        assert!(is_supported_version(b"RFB 003.889\n"));
        assert!(is_supported_version(b"RFB 005.000\n"));
        assert!(!is_supported_version(b"RFB 003.007\n"));
        assert!(!is_supported_version(b"RFB 002.009\n"));
        assert!(!is_supported_version(b"RFB 00x.008\n"));
        assert!(!is_supported_version(b"RFB 003.008 "));
        assert!(!is_supported_version(b"HTTP/1.1 200"));
    }

    #[test]
    fn server_init_is_consumed() {
        let mut input = vec![0x03, 0x20, 0x01, 0xe0];
        input.extend([0; 16]);
        input.extend(4u32.to_be_bytes());
        input.extend(b"Kita");
        let mut io = Scripted::new(input);
        initialize(&mut io).unwrap();
        assert_eq!(io.output, [CLIENT_INIT_SHARED]);
        assert_eq!(io.input.position(), 28);
    }

    #[test]
    fn pointer_event_layout() {
        assert_eq!(pointer_event(1, 265, 340), [5, 1, 0x01, 0x09, 0x01, 0x54]);
    }

    /// What the in-process display server observed during one session.
    pub(crate) struct ServerLog {
        pub(crate) authenticated: bool,
        /// `(buttons, x, y)` of every pointer event received.
        pub(crate) pointer_events: Vec<(u8, u16, u16)>,
    }

    /// Serve exactly one RFB session on a local port, accepting `password`.
    ///
    /// Returns the address to connect to and a handle yielding the session log once the client
    /// disconnects.
    pub(crate) fn serve_one_session(
        password: &'static str,
    ) -> (String, std::thread::JoinHandle<ServerLog>) {
        serve(b"RFB 003.008\n", password, false)
    }

    /// Like [`serve_one_session`], but the server goes away right after sending ServerInit.
    pub(crate) fn serve_then_hang_up(
        password: &'static str,
    ) -> (String, std::thread::JoinHandle<ServerLog>) {
        serve(b"RFB 003.008\n", password, true)
    }

    fn serve(
        version_line: &'static [u8; 12],
        password: &'static str,
        hang_up_after_init: bool,
    ) -> (String, std::thread::JoinHandle<ServerLog>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(version_line).unwrap();
            let mut version = [0; 12];
            stream.read_exact(&mut version).unwrap();
            assert_eq!(&version, PROTOCOL_VERSION);
            stream.write_all(&[1, SECURITY_TYPE_VNC_AUTH]).unwrap();
            let mut selected = [0];
            stream.read_exact(&mut selected).unwrap();
            stream.write_all(&CHALLENGE).unwrap();
            let mut response = [0; 16];
            stream.read_exact(&mut response).unwrap();
            let authenticated = response == vnc_auth_response(password.as_bytes(), &CHALLENGE);
            if !authenticated {
                stream.write_all(&[0, 0, 0, 1, 0, 0, 0, 3]).unwrap();
                stream.write_all(b"bad").unwrap();
                return ServerLog { authenticated, pointer_events: Vec::new() };
            }
            stream.write_all(&[0, 0, 0, 0]).unwrap();
            let mut client_init = [0];
            stream.read_exact(&mut client_init).unwrap();
            assert_eq!(client_init, [CLIENT_INIT_SHARED]);
            let mut server_init = vec![0x03, 0x20, 0x01, 0xe0];
            server_init.extend([0; 16]);
            server_init.extend(4u32.to_be_bytes());
            server_init.extend(b"Kita");
            stream.write_all(&server_init).unwrap();
            if hang_up_after_init {
                return ServerLog { authenticated, pointer_events: Vec::new() };
            }
            // An unsolicited Bell for the client to drain.
            stream.write_all(&[2]).unwrap();
            let mut events = Vec::new();
            stream.read_to_end(&mut events).unwrap();
            let pointer_events = events
                .chunks_exact(6)
                .map(|e| {
                    assert_eq!(e[0], MESSAGE_POINTER_EVENT);
                    (e[1], u16::from_be_bytes([e[2], e[3]]), u16::from_be_bytes([e[4], e[5]]))
                })
                .collect();
            ServerLog { authenticated, pointer_events }
        });
        (address, handle)
    }

    pub(crate) fn test_config(address: String, password: &str) -> Config {
        Config {
            address,
            password: password.to_string(),
            timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_millis(20),
            pointer_event_gap: Duration::ZERO,
        }
    }

    #[test]
    fn session_over_tcp() {
        let (address, server) = serve_one_session("111111");
        let mut link = DisplayLink::new(test_config(address, "111111"));
        link.connect().unwrap();
        assert_eq!(link.state(), State::Authenticated);
        link.finish_handshake().unwrap();
        link.drain().unwrap();
        link.click(180, 45, Duration::ZERO).unwrap();
        link.close();
        link.close();
        assert_eq!(link.state(), State::Disconnected);
        let log = server.join().unwrap();
        assert!(log.authenticated);
        assert_eq!(log.pointer_events, [(0, 180, 45), (1, 180, 45), (0, 180, 45)]);
    }

    #[test]
    fn session_with_a_newer_server() {
        let (address, server) = serve(b"RFB 004.001\n", "111111", false);
        let mut link = DisplayLink::new(test_config(address, "111111"));
        link.connect().unwrap();
        link.finish_handshake().unwrap();
        link.click(85, 280, Duration::ZERO).unwrap();
        link.close();
        let log = server.join().unwrap();
        assert!(log.authenticated);
        assert_eq!(log.pointer_events.len(), 3);
    }

    #[test]
    fn wrong_password_fails_connect_and_leaves_link_closed() {
        let (address, server) = serve_one_session("111111");
        let mut link = DisplayLink::new(test_config(address, "222222"));
        let error = link.connect().unwrap_err();
        assert!(matches!(error, Error::AuthenticationFailed(Some(r)) if r == "bad"));
        assert_eq!(link.state(), State::Disconnected);
        assert!(matches!(link.click(1, 1, Duration::ZERO), Err(Error::NotConnected)));
        assert!(!server.join().unwrap().authenticated);
    }
}
