//! Client for the Minecraft remote console (RCON) protocol.
//!
//! Every frame is laid out as:
//!
//! ```text
//! i32 LE  length      bytes that follow this field
//! i32 LE  request id
//! i32 LE  type        3 = auth, 2 = command / auth response, 0 = response
//! [u8]    payload     one byte per character (Latin-1)
//! u8 u8   0 0
//! ```
//!
//! Only one request is ever outstanding per session, so replies are matched
//! on request id and anything else that arrives is dropped.

use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

pub const PACKET_AUTH: i32 = 3;
pub const PACKET_COMMAND: i32 = 2;
pub const PACKET_AUTH_RESPONSE: i32 = 2;
pub const PACKET_RESPONSE: i32 = 0;

/// Request id the server answers with when the password is wrong.
pub const AUTH_FAILED_ID: i32 = -1;

/// Request id, type and the two terminating NULs.
const FRAME_OVERHEAD: usize = 10;
const MAX_PAYLOAD: usize = 4096;
pub const MAX_FRAME_LEN: usize = MAX_PAYLOAD + FRAME_OVERHEAD;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub payload: String,
}

impl Packet {
    pub fn new(id: i32, kind: i32, payload: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            payload: payload.into(),
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let body = encode_latin1(&self.payload);
        dst.reserve(4 + FRAME_OVERHEAD + body.len());
        dst.put_i32_le((FRAME_OVERHEAD + body.len()) as i32);
        dst.put_i32_le(self.id);
        dst.put_i32_le(self.kind);
        dst.put_slice(&body);
        dst.put_u16(0);
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf
    }

    /// Splits one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` while the buffer holds less than a full frame, leaving
    /// it untouched. Bytes past the end of the frame stay in `src`.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut peek = &src[..4];
        let length = peek.get_i32_le();
        if length < FRAME_OVERHEAD as i32 || length > MAX_FRAME_LEN as i32 {
            return Err(Error::Protocol(format!("invalid frame length {length}")));
        }
        let total = length as usize + 4;
        if src.len() < total {
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(4);
        let id = frame.get_i32_le();
        let kind = frame.get_i32_le();
        let body = &frame[..frame.len() - 2];
        Ok(Some(Packet {
            id,
            kind,
            payload: decode_latin1(body),
        }))
    }
}

fn encode_latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

fn decode_latin1(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|&&b| b != 0)
        .map(|&b| char::from(b))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    /// The handshake round-tripped but the reply did not say whether the
    /// password was accepted. The first answered command settles it.
    Indeterminate,
    Authenticated,
}

pub struct RconClient {
    stream: Option<TcpStream>,
    buffer: BytesMut,
    request_id: i32,
    auth: AuthState,
    timeout: Duration,
}

impl RconClient {
    pub async fn connect(host: &str, port: u16, password: &str) -> Result<Self> {
        Self::connect_with_timeout(host, port, password, RESPONSE_TIMEOUT).await
    }

    /// Opens a session, using `timeout` for both the TCP connect and every
    /// reply wait.
    pub async fn connect_with_timeout(
        host: &str,
        port: u16,
        password: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let connect_timeout = timeout.min(CONNECT_TIMEOUT);
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => return Err(Error::ProtocolTimeout("connect")),
        };
        let _ = stream.set_nodelay(true);

        let mut client = Self {
            stream: Some(stream),
            buffer: BytesMut::with_capacity(MAX_FRAME_LEN),
            request_id: 0,
            auth: AuthState::Unauthenticated,
            timeout,
        };
        if let Err(e) = client.authenticate(password).await {
            client.disconnect().await;
            return Err(e);
        }
        tracing::debug!("Console session to {}:{} is {:?}", host, port, client.auth);
        Ok(client)
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth
    }

    async fn authenticate(&mut self, password: &str) -> Result<()> {
        let id = self.next_request_id();
        self.write_packet(&Packet::new(id, PACKET_AUTH, password))
            .await?;
        let reply = self.read_reply(id, true, "authentication").await?;
        if reply.id == AUTH_FAILED_ID {
            return Err(Error::ProtocolAuth);
        }
        self.auth = if reply.kind == PACKET_AUTH_RESPONSE {
            AuthState::Authenticated
        } else {
            AuthState::Indeterminate
        };
        Ok(())
    }

    /// Runs one console command and returns the server's reply text.
    pub async fn send_command(&mut self, command: &str) -> Result<String> {
        let request = self.dispatch(command).await?;
        self.read_response(request).await
    }

    /// Writes one command frame without waiting for its reply and returns
    /// the request id to hand to [`RconClient::read_response`]. An error here
    /// means the frame did not go out.
    pub async fn dispatch(&mut self, command: &str) -> Result<i32> {
        if !self.is_connected() || self.auth == AuthState::Unauthenticated {
            return Err(Error::NotConnected);
        }
        let id = self.next_request_id();
        self.write_packet(&Packet::new(id, PACKET_COMMAND, command))
            .await?;
        Ok(id)
    }

    /// Waits for the reply to a dispatched request.
    pub async fn read_response(&mut self, request: i32) -> Result<String> {
        let reply = self.read_reply(request, false, "command response").await?;
        if self.auth == AuthState::Indeterminate {
            self.auth = AuthState::Authenticated;
        }
        Ok(reply.payload)
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.auth = AuthState::Unauthenticated;
        self.buffer.clear();
    }

    fn next_request_id(&mut self) -> i32 {
        self.request_id = if self.request_id == i32::MAX {
            1
        } else {
            self.request_id + 1
        };
        self.request_id
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let bytes = packet.to_bytes();
        stream.write_all(&bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_reply(
        &mut self,
        id: i32,
        during_auth: bool,
        waiting_for: &'static str,
    ) -> Result<Packet> {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.read_matching(id, during_auth)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ProtocolTimeout(waiting_for)),
        }
    }

    /// Re-checks the buffer after every read until a frame for `id` shows up.
    async fn read_matching(&mut self, id: i32, during_auth: bool) -> Result<Packet> {
        loop {
            while let Some(packet) = self.decode_buffered()? {
                if packet.id == id || (during_auth && packet.id == AUTH_FAILED_ID) {
                    return Ok(packet);
                }
                tracing::debug!(
                    expected = id,
                    received = packet.id,
                    "Discarding unmatched console frame"
                );
            }

            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
            let read = stream.read_buf(&mut self.buffer).await?;
            if read == 0 {
                self.stream = None;
                self.auth = AuthState::Unauthenticated;
                return Err(Error::Protocol("connection closed by peer".to_string()));
            }
        }
    }

    fn decode_buffered(&mut self) -> Result<Option<Packet>> {
        match Packet::decode(&mut self.buffer) {
            Ok(packet) => Ok(packet),
            Err(e) => {
                self.stream = None;
                self.auth = AuthState::Unauthenticated;
                self.buffer.clear();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_little_endian_layout() {
        let bytes = Packet::new(7, PACKET_COMMAND, "list").to_bytes();
        assert_eq!(
            &bytes[..],
            &[
                14, 0, 0, 0, // length
                7, 0, 0, 0, // id
                2, 0, 0, 0, // type
                b'l', b'i', b's', b't', 0, 0,
            ]
        );
    }

    #[test]
    fn decodes_command_payload() {
        let mut buf = Packet::new(3, PACKET_COMMAND, "say hello world").to_bytes();
        let packet = Packet::decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.id, 3);
        assert_eq!(packet.kind, PACKET_COMMAND);
        assert_eq!(packet.payload, "say hello world");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_is_not_complete() {
        let full = Packet::new(1, PACKET_RESPONSE, "There are 0 of a max of 20 players online")
            .to_bytes();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..3]);
        assert!(Packet::decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[3..20]);
        assert!(Packet::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 20);

        buf.extend_from_slice(&full[20..]);
        let packet = Packet::decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.payload, "There are 0 of a max of 20 players online");
        assert!(buf.is_empty());
    }

    #[test]
    fn leftover_bytes_are_kept() {
        let mut buf = Packet::new(1, PACKET_RESPONSE, "first").to_bytes();
        let second = Packet::new(2, PACKET_RESPONSE, "second").to_bytes();
        buf.extend_from_slice(&second);
        buf.extend_from_slice(&second[..5]);

        let first = Packet::decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload, "first");
        assert_eq!(buf.len(), second.len() + 5);

        let next = Packet::decode(&mut buf).unwrap().unwrap();
        assert_eq!(next.id, 2);
        assert_eq!(buf.len(), 5);
        assert!(Packet::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_bad_lengths() {
        let mut buf = BytesMut::from(&[4u8, 0, 0, 0, 0, 0, 0, 0][..]);
        assert!(matches!(Packet::decode(&mut buf), Err(Error::Protocol(_))));

        let mut buf = BytesMut::new();
        buf.put_i32_le((MAX_FRAME_LEN + 1) as i32);
        assert!(matches!(Packet::decode(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn payload_is_single_byte_per_char() {
        let mut buf = Packet::new(1, PACKET_COMMAND, "say café ✓").to_bytes();
        assert_eq!(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]), 10 + 10);
        let packet = Packet::decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.payload, "say café ?");
    }

    #[test]
    fn empty_payload() {
        let mut buf = Packet::new(9, PACKET_AUTH_RESPONSE, "").to_bytes();
        assert_eq!(buf.len(), 14);
        let packet = Packet::decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.payload, "");
    }
}
