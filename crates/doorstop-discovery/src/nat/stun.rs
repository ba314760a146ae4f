//! STUN Protocol Implementation (RFC 5389)
//!
//! This module implements the subset of STUN needed for server reflexive
//! address discovery: Binding requests, Binding success/error responses and
//! the address attributes a server returns.
//!
//! The client is transaction based. [`StunClient::start`] sends a request over
//! an already-connected UDP socket and reports the outcome through a callback,
//! retransmitting on its own schedule until a response arrives or the client
//! timeout expires. Callers that want a plain `async fn` bridge the callback
//! themselves (see [`crate::nat::discover`]).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// STUN magic cookie (0x2112A442)
const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size (20 bytes)
const HEADER_SIZE: usize = 20;

/// Default overall transaction timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Initial retransmission timeout, doubled after every transmission
const INITIAL_RTO: Duration = Duration::from_millis(250);

/// Largest datagram accepted from the server
const MAX_RESPONSE_SIZE: usize = 1024;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_SOFTWARE: u16 = 0x8022;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageClass {
    /// Request message
    Request,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
    /// Indication (no response expected)
    Indication,
}

/// STUN message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    /// Binding request/response
    Binding,
}

impl StunMessageType {
    /// Encode message type and class into a 16-bit value
    ///
    /// RFC 5389 Section 6 encoding:
    /// ```text
    ///  0                 1
    ///  2  3  4 5 6 7 8 9 0 1 2 3 4 5
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
    /// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    fn encode(self, class: StunMessageClass) -> u16 {
        let method = match self {
            Self::Binding => 0x0001,
        };

        let class_bits = match class {
            StunMessageClass::Request => 0b00,
            StunMessageClass::Indication => 0b01,
            StunMessageClass::SuccessResponse => 0b10,
            StunMessageClass::ErrorResponse => 0b11,
        };

        let m0_m3 = method & 0x0F;
        let c0 = (class_bits & 0x01) << 4;
        let m4_m6 = (method & 0x70) << 1;
        let c1 = (class_bits & 0x02) << 7;
        let m7_m11 = (method & 0xF80) << 2;

        m0_m3 | c0 | m4_m6 | c1 | m7_m11
    }

    fn decode(msg_type: u16) -> Result<(Self, StunMessageClass), StunError> {
        let c0 = (msg_type >> 4) & 0x01;
        let c1 = (msg_type >> 8) & 0x01;

        let message_class = match c0 | (c1 << 1) {
            0b00 => StunMessageClass::Request,
            0b01 => StunMessageClass::Indication,
            0b10 => StunMessageClass::SuccessResponse,
            _ => StunMessageClass::ErrorResponse,
        };

        let method = (msg_type & 0x0F) | ((msg_type >> 1) & 0x70) | ((msg_type >> 2) & 0xF80);
        match method {
            0x0001 => Ok((Self::Binding, message_class)),
            _ => Err(StunError::InvalidMessageType),
        }
    }
}

/// STUN attribute types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    /// Mapped address (0x0001), sent by RFC 3489 servers
    MappedAddress(SocketAddr),
    /// XOR-Mapped address (0x0020) - preferred over MAPPED-ADDRESS
    XorMappedAddress(SocketAddr),
    /// Error code (0x0009)
    ErrorCode {
        /// Numeric code (class * 100 + number)
        code: u16,
        /// Reason phrase
        reason: String,
    },
    /// Software identifier (0x8022)
    Software(String),
    /// Unknown attribute type
    Unknown(u16, Vec<u8>),
}

impl StunAttribute {
    fn attr_type(&self) -> u16 {
        match self {
            Self::MappedAddress(_) => ATTR_MAPPED_ADDRESS,
            Self::ErrorCode { .. } => ATTR_ERROR_CODE,
            Self::XorMappedAddress(_) => ATTR_XOR_MAPPED_ADDRESS,
            Self::Software(_) => ATTR_SOFTWARE,
            Self::Unknown(t, _) => *t,
        }
    }

    fn encode(&self, transaction_id: &[u8; 12]) -> Vec<u8> {
        let value = self.encode_value(transaction_id);

        let mut bytes = Vec::with_capacity(4 + value.len() + 3);
        bytes.extend_from_slice(&self.attr_type().to_be_bytes());
        bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&value);

        // Padding to 4-byte boundary
        let padding = (4 - (value.len() % 4)) % 4;
        bytes.extend(std::iter::repeat_n(0, padding));

        bytes
    }

    fn encode_value(&self, transaction_id: &[u8; 12]) -> Vec<u8> {
        match self {
            Self::MappedAddress(addr) => encode_address(*addr, None),
            Self::XorMappedAddress(addr) => encode_address(*addr, Some(transaction_id)),
            Self::ErrorCode { code, reason } => {
                let mut value = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
                value.extend_from_slice(reason.as_bytes());
                value
            }
            Self::Software(s) => s.as_bytes().to_vec(),
            Self::Unknown(_, data) => data.clone(),
        }
    }

    fn decode(attr_type: u16, value: &[u8], transaction_id: &[u8; 12]) -> Result<Self, StunError> {
        match attr_type {
            ATTR_MAPPED_ADDRESS => decode_address(value, None).map(Self::MappedAddress),
            ATTR_XOR_MAPPED_ADDRESS => {
                decode_address(value, Some(transaction_id)).map(Self::XorMappedAddress)
            }
            ATTR_ERROR_CODE => {
                if value.len() < 4 {
                    return Err(StunError::InvalidAttribute);
                }
                let code = u16::from(value[2] & 0x07) * 100 + u16::from(value[3]);
                let reason = String::from_utf8_lossy(&value[4..]).to_string();
                Ok(Self::ErrorCode { code, reason })
            }
            ATTR_SOFTWARE => Ok(Self::Software(String::from_utf8_lossy(value).to_string())),
            _ => Ok(Self::Unknown(attr_type, value.to_vec())),
        }
    }
}

/// XOR key for an address attribute: magic cookie, followed by the
/// transaction id for IPv6.
fn xor_key(transaction_id: &[u8; 12]) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);
    key
}

fn encode_address(addr: SocketAddr, xor_with: Option<&[u8; 12]>) -> Vec<u8> {
    let key = xor_with.map(xor_key);
    let mut value = vec![0, if addr.is_ipv4() { FAMILY_IPV4 } else { FAMILY_IPV6 }];

    let port = match key {
        Some(_) => addr.port() ^ (MAGIC_COOKIE >> 16) as u16,
        None => addr.port(),
    };
    value.extend_from_slice(&port.to_be_bytes());

    let octets: Vec<u8> = match addr {
        SocketAddr::V4(v4) => v4.ip().octets().to_vec(),
        SocketAddr::V6(v6) => v6.ip().octets().to_vec(),
    };
    for (i, byte) in octets.iter().enumerate() {
        value.push(key.map_or(*byte, |k| byte ^ k[i]));
    }

    value
}

fn decode_address(value: &[u8], xor_with: Option<&[u8; 12]>) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::InvalidAttribute);
    }

    let key = xor_with.map(xor_key);
    let raw_port = u16::from_be_bytes([value[2], value[3]]);
    let port = match key {
        Some(_) => raw_port ^ (MAGIC_COOKIE >> 16) as u16,
        None => raw_port,
    };
    let unmask = |i: usize, byte: u8| key.map_or(byte, |k| byte ^ k[i]);

    match value[1] {
        FAMILY_IPV4 => {
            let raw = value.get(4..8).ok_or(StunError::InvalidAttribute)?;
            let mut ip = [0u8; 4];
            for (i, byte) in raw.iter().enumerate() {
                ip[i] = unmask(i, *byte);
            }
            Ok(SocketAddr::new(Ipv4Addr::from(ip).into(), port))
        }
        FAMILY_IPV6 => {
            let raw = value.get(4..20).ok_or(StunError::InvalidAttribute)?;
            let mut ip = [0u8; 16];
            for (i, byte) in raw.iter().enumerate() {
                ip[i] = unmask(i, *byte);
            }
            Ok(SocketAddr::new(Ipv6Addr::from(ip).into(), port))
        }
        _ => Err(StunError::InvalidAttribute),
    }
}

/// STUN message
#[derive(Debug, Clone)]
pub struct StunMessage {
    /// Message type
    pub message_type: StunMessageType,
    /// Message class
    pub message_class: StunMessageClass,
    /// Transaction ID (96 bits)
    pub transaction_id: [u8; 12],
    /// Message attributes
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Create a new STUN Binding Request with a fresh transaction id
    #[must_use]
    pub fn binding_request() -> Self {
        use rand::RngCore;

        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);

        Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::Request,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Build a Binding success response for `request` reporting `mapped`
    #[must_use]
    pub fn binding_success(request: &StunMessage, mapped: SocketAddr) -> Self {
        Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::SuccessResponse,
            transaction_id: request.transaction_id,
            attributes: vec![StunAttribute::XorMappedAddress(mapped)],
        }
    }

    /// Add an attribute to the message
    pub fn add_attribute(&mut self, attr: StunAttribute) {
        self.attributes.push(attr);
    }

    /// Encode message to bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);

        bytes.extend_from_slice(&self.message_type.encode(self.message_class).to_be_bytes());
        // Length placeholder, patched once attributes are written
        bytes.extend_from_slice(&[0u8; 2]);
        bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        bytes.extend_from_slice(&self.transaction_id);

        for attr in &self.attributes {
            bytes.extend_from_slice(&attr.encode(&self.transaction_id));
        }

        let msg_length = (bytes.len() - HEADER_SIZE) as u16;
        bytes[2..4].copy_from_slice(&msg_length.to_be_bytes());

        bytes
    }

    /// Decode message from bytes
    ///
    /// # Errors
    ///
    /// Returns `StunError` if the header is truncated, the magic cookie is
    /// wrong, the method is not Binding, or an address attribute is malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self, StunError> {
        if bytes.len() < HEADER_SIZE {
            return Err(StunError::MessageTooShort);
        }

        let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        if msg_type & 0xC000 != 0 {
            return Err(StunError::InvalidMessageType);
        }
        let msg_length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let magic_cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if magic_cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie);
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..HEADER_SIZE]);

        let (message_type, message_class) = StunMessageType::decode(msg_type)?;

        let end = (HEADER_SIZE + msg_length).min(bytes.len());
        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;

        while offset + 4 <= end {
            let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let attr_length = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
            offset += 4;

            if offset + attr_length > end {
                return Err(StunError::InvalidAttribute);
            }

            let value = &bytes[offset..offset + attr_length];
            attributes.push(StunAttribute::decode(attr_type, value, &transaction_id)?);

            offset += attr_length + (4 - (attr_length % 4)) % 4;
        }

        Ok(Self {
            message_type,
            message_class,
            transaction_id,
            attributes,
        })
    }

    /// Get XOR-MAPPED-ADDRESS attribute
    #[must_use]
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// Get ERROR-CODE attribute as `(code, reason)`
    #[must_use]
    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }
}

/// Outcome of one STUN transaction, delivered to the handler passed to
/// [`StunClient::start`].
#[derive(Debug)]
pub struct StunEvent {
    /// Transaction the event belongs to
    pub transaction_id: [u8; 12],
    /// The response, or why none was obtained
    pub result: Result<StunMessage, StunError>,
}

/// Transaction-based STUN client over a connected UDP socket
///
/// The socket must already be connected to the STUN server; the client only
/// uses `send`/`recv`. One transaction may be outstanding at a time.
pub struct StunClient {
    socket: Arc<UdpSocket>,
    timeout: Duration,
    transactions: Mutex<Vec<JoinHandle<()>>>,
}

impl StunClient {
    /// Wrap a connected socket
    #[must_use]
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            timeout: DEFAULT_TIMEOUT,
            transactions: Mutex::new(Vec::new()),
        }
    }

    /// Set the overall transaction timeout
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Get local socket address
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be determined
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// Start a transaction for `request`
    ///
    /// The request is sent immediately and retransmitted with a doubling
    /// interval until a response carrying the same transaction id arrives or
    /// the client timeout expires. `handler` is invoked exactly once, from a
    /// background task, with the outcome.
    ///
    /// # Errors
    ///
    /// Returns `StunError::NotConnected` if the socket has no peer, in which
    /// case `handler` is never invoked.
    pub async fn start<F>(&self, request: StunMessage, handler: F) -> Result<(), StunError>
    where
        F: FnOnce(StunEvent) + Send + 'static,
    {
        let server = self
            .socket
            .peer_addr()
            .map_err(|_| StunError::NotConnected)?;

        tracing::debug!("STUN binding request to {}", server);

        let socket = Arc::clone(&self.socket);
        let timeout = self.timeout;
        let transaction_id = request.transaction_id;

        let task = tokio::spawn(async move {
            let result = transact(&socket, &request, timeout).await;
            handler(StunEvent {
                transaction_id,
                result,
            });
        });

        self.transactions.lock().await.push(task);
        Ok(())
    }

    /// Close the client
    ///
    /// Waits for outstanding transactions so that the socket is released once
    /// this returns.
    pub async fn close(self) {
        let transactions = std::mem::take(&mut *self.transactions.lock().await);
        for task in transactions {
            if let Err(e) = task.await {
                tracing::warn!("STUN transaction task failed: {}", e);
            }
        }
    }
}

async fn transact(
    socket: &UdpSocket,
    request: &StunMessage,
    timeout: Duration,
) -> Result<StunMessage, StunError> {
    let bytes = request.encode();
    let deadline = Instant::now() + timeout;
    let mut rto = INITIAL_RTO;
    let mut buf = [0u8; MAX_RESPONSE_SIZE];

    loop {
        socket.send(&bytes).await?;
        let retransmit_at = (Instant::now() + rto).min(deadline);

        loop {
            let len = match tokio::time::timeout_at(retransmit_at, socket.recv(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => break,
            };

            let response = match StunMessage::decode(&buf[..len]) {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!("Ignoring undecodable datagram: {}", e);
                    continue;
                }
            };
            if response.transaction_id != request.transaction_id {
                tracing::debug!("Ignoring response for a foreign transaction");
                continue;
            }

            return match response.message_class {
                StunMessageClass::SuccessResponse => Ok(response),
                StunMessageClass::ErrorResponse => {
                    let (code, reason) = response.error_code().unwrap_or((0, ""));
                    Err(StunError::ErrorResponse {
                        code,
                        reason: reason.to_string(),
                    })
                }
                _ => continue,
            };
        }

        if Instant::now() >= deadline {
            return Err(StunError::Timeout);
        }
        rto *= 2;
        tracing::debug!("Retransmitting STUN request (rto {:?})", rto);
    }
}

/// STUN error types
#[derive(Debug, Error)]
pub enum StunError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Transaction timed out
    #[error("STUN query timeout")]
    Timeout,
    /// Socket is not connected to a server
    #[error("STUN socket is not connected")]
    NotConnected,
    /// Message shorter than the fixed header
    #[error("STUN message too short")]
    MessageTooShort,
    /// Invalid magic cookie
    #[error("Invalid STUN magic cookie")]
    InvalidMagicCookie,
    /// Invalid message type
    #[error("Invalid STUN message type")]
    InvalidMessageType,
    /// Invalid attribute
    #[error("Invalid STUN attribute")]
    InvalidAttribute,
    /// Error response received
    #[error("STUN error response {code}: {reason}")]
    ErrorResponse {
        /// ERROR-CODE value, 0 if absent
        code: u16,
        /// Reason phrase
        reason: String,
    },
    /// Missing required attribute
    #[error("Missing required STUN attribute")]
    MissingAttribute,
}
