//! TFTP Protocol Implementation
//!
//! This module contains the TFTP wire codec: packet parsing, packet building,
//! and the protocol constants.
//!
//! # TFTP Protocol Overview
//!
//! TFTP (Trivial File Transfer Protocol) is defined in RFC 1350. Every packet
//! starts with a 2-byte big-endian opcode:
//!
//! | Opcode | Name  | Layout                                          |
//! |--------|-------|-------------------------------------------------|
//! | 1      | RRQ   | `opcode(2) filename(NUL) mode(NUL) [options..]` |
//! | 2      | WRQ   | `opcode(2) filename(NUL) mode(NUL) [options..]` |
//! | 3      | DATA  | `opcode(2) block(2) data(0..512)`               |
//! | 4      | ACK   | `opcode(2) block(2)`                            |
//! | 5      | ERROR | `opcode(2) code(2) message(NUL)`                |
//!
//! Request options are accepted on the wire but ignored: only the fixed
//! 512-byte block size and octet mode are served.

use std::fmt;

use thiserror::Error;

/// Fixed TFTP block size in bytes. A shorter block ends a transfer.
pub const BLOCK_SIZE: usize = 512;

/// The only transfer mode served.
pub const OCTET_MODE: &str = "octet";

/// TFTP Protocol Opcodes
///
/// These opcodes identify the type of TFTP packet being sent or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpOpcode {
    /// Read Request (RRQ) - Opcode 1
    ///
    /// Client requests to read a file from the server.
    ReadRequest = 1,

    /// Write Request (WRQ) - Opcode 2
    ///
    /// Client requests to write a file to the server.
    WriteRequest = 2,

    /// Data Packet (DATA) - Opcode 3
    ///
    /// Carries a 2-byte block number and up to 512 bytes of file data.
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// Acknowledges a data packet. A write transfer is accepted with ACK 0.
    Acknowledgment = 4,

    /// Error Packet (ERROR) - Opcode 5
    ///
    /// Reports an error condition and terminates the transfer.
    Error = 5,
}

impl TftpOpcode {
    /// Convert a u16 value to a TftpOpcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::from_u16(2), Some(TftpOpcode::WriteRequest));
    /// assert_eq!(TftpOpcode::from_u16(6), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    /// Convert the opcode to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the human-readable name of the opcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::WriteRequest.name(), "WRQ");
    /// assert_eq!(TftpOpcode::Acknowledgment.name(), "ACK");
    /// ```
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for TftpOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP Error Codes
///
/// Standard error codes as defined in RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpErrorCode {
    /// Error code 0: Not defined, see the error message
    NotDefined = 0,

    /// Error code 1: File not found
    FileNotFound = 1,

    /// Error code 2: Access violation
    ///
    /// Includes attempts to reach files outside the server's root directory.
    AccessViolation = 2,

    /// Error code 3: Disk full or allocation exceeded
    DiskFull = 3,

    /// Error code 4: Illegal TFTP operation
    IllegalOperation = 4,

    /// Error code 5: Unknown transfer ID
    UnknownTransferId = 5,

    /// Error code 6: File already exists
    FileAlreadyExists = 6,

    /// Error code 7: No such user
    NoSuchUser = 7,
}

impl TftpErrorCode {
    /// Convert a u16 value to a TftpErrorCode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::from_u16(1), Some(TftpErrorCode::FileNotFound));
    /// assert_eq!(TftpErrorCode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            _ => None,
        }
    }

    /// Convert the error code to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the default error message for this error code
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
        }
    }
}

impl fmt::Display for TftpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// Reasons a datagram cannot be decoded into a [`TftpPacket`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("packet too short to hold the {field}")]
    Truncated { field: &'static str },
    #[error("{field} is not NUL-terminated")]
    Unterminated { field: &'static str },
    #[error("{field} is not valid UTF-8")]
    InvalidString { field: &'static str },
}

/// TFTP Request (RRQ/WRQ) representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpRequest {
    /// The request opcode (RRQ or WRQ)
    pub opcode: TftpOpcode,
    /// Requested filename, exactly as sent
    pub filename: String,
    /// Transfer mode string, exactly as sent
    pub mode: String,
}

impl TftpRequest {
    /// Create a new read request
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpRequest;
    ///
    /// let request = TftpRequest::read_request("boot.img", "octet");
    /// assert_eq!(request.filename, "boot.img");
    /// assert!(request.is_octet());
    /// ```
    pub fn read_request(filename: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            opcode: TftpOpcode::ReadRequest,
            filename: filename.into(),
            mode: mode.into(),
        }
    }

    /// Create a new write request
    pub fn write_request(filename: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            opcode: TftpOpcode::WriteRequest,
            filename: filename.into(),
            mode: mode.into(),
        }
    }

    /// Whether the client asked for octet mode (case-insensitive)
    pub fn is_octet(&self) -> bool {
        self.mode.eq_ignore_ascii_case(OCTET_MODE)
    }

    /// Encode this request back into its wire form
    pub fn to_bytes(&self) -> Vec<u8> {
        build_request(self.opcode, &self.filename, &self.mode)
    }
}

/// TFTP Data packet representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpData {
    /// Block number (1-indexed, wraps at 65535)
    pub block: u16,
    /// Data payload
    pub data: Vec<u8>,
}

impl TftpData {
    /// Create a new data packet
    pub fn new(block: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            block,
            data: data.into(),
        }
    }

    /// Check if this is the last block of a transfer
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpData;
    ///
    /// assert!(TftpData::new(1, vec![0; 100]).is_last_block());
    /// assert!(TftpData::new(1, Vec::new()).is_last_block());
    /// assert!(!TftpData::new(1, vec![0; 512]).is_last_block());
    /// ```
    pub fn is_last_block(&self) -> bool {
        self.data.len() < BLOCK_SIZE
    }
}

/// TFTP ACK packet representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TftpAck {
    /// Block number being acknowledged
    pub block: u16,
}

impl TftpAck {
    pub fn new(block: u16) -> Self {
        Self { block }
    }
}

/// TFTP Error packet representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpError {
    /// Error code
    pub code: TftpErrorCode,
    /// Human-readable error message
    pub message: String,
}

impl TftpError {
    /// Create a new error packet with a custom message
    pub fn new(code: TftpErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create a new error packet with the default message for the error code
    ///
    /// # Examples
    /// ```
    /// use tftp::{TftpError, TftpErrorCode};
    ///
    /// let error = TftpError::with_default_message(TftpErrorCode::AccessViolation);
    /// assert_eq!(error.message, "Access violation");
    /// ```
    pub fn with_default_message(code: TftpErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn file_not_found() -> Self {
        Self::with_default_message(TftpErrorCode::FileNotFound)
    }

    pub fn access_violation() -> Self {
        Self::with_default_message(TftpErrorCode::AccessViolation)
    }

    /// Map a filesystem error onto the closest TFTP error code
    ///
    /// # Examples
    /// ```
    /// use std::io;
    /// use tftp::{TftpError, TftpErrorCode};
    ///
    /// let err = io::Error::from(io::ErrorKind::NotFound);
    /// assert_eq!(TftpError::from_io(&err).code, TftpErrorCode::FileNotFound);
    /// ```
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound => Self::file_not_found(),
            ErrorKind::PermissionDenied => Self::access_violation(),
            ErrorKind::AlreadyExists => Self::with_default_message(TftpErrorCode::FileAlreadyExists),
            ErrorKind::StorageFull | ErrorKind::QuotaExceeded => Self::with_default_message(TftpErrorCode::DiskFull),
            _ => Self::new(TftpErrorCode::NotDefined, err.to_string()),
        }
    }

    /// Encode this error into its wire form
    pub fn to_bytes(&self) -> Vec<u8> {
        build_error(self.code.as_u16(), &self.message)
    }
}

impl fmt::Display for TftpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A decoded TFTP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TftpPacket {
    Request(TftpRequest),
    Data(TftpData),
    Ack(TftpAck),
    Error(TftpError),
    /// An opcode outside RFC 1350; decodes but carries no meaning
    Unknown(u16),
}

impl fmt::Display for TftpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(r) => write!(f, "{} [{}] [{}]", r.opcode, r.filename, r.mode),
            Self::Data(d) => write!(f, "DATA [{}] ({} bytes)", d.block, d.data.len()),
            Self::Ack(a) => write!(f, "ACK [{}]", a.block),
            Self::Error(e) => write!(f, "ERROR [{}]", e),
            Self::Unknown(opcode) => write!(f, "UNKNOWN [{}]", opcode),
        }
    }
}

/// Find the next null byte in a buffer starting from a given position
pub fn find_zero(buf: &[u8], start: usize) -> Option<usize> {
    buf.get(start..)?
        .iter()
        .position(|&b| b == 0)
        .map(|pos| start + pos)
}

/// Forward-only reader over a datagram body
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + 2)
            .ok_or(DecodeError::Truncated { field })?;
        self.pos += 2;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let end = find_zero(self.buf, self.pos).ok_or(DecodeError::Unterminated { field })?;
        let value = std::str::from_utf8(&self.buf[self.pos..end])
            .map_err(|_| DecodeError::InvalidString { field })?
            .to_string();
        self.pos = end + 1;
        Ok(value)
    }

    fn rest(&self) -> &'a [u8] {
        self.buf.get(self.pos..).unwrap_or_default()
    }
}

/// Decode one TFTP datagram
///
/// # Examples
/// ```
/// use tftp::{TftpPacket, build_ack, parse_packet};
///
/// match parse_packet(&build_ack(7)) {
///     Ok(TftpPacket::Ack(ack)) => assert_eq!(ack.block, 7),
///     other => panic!("unexpected {:?}", other),
/// }
/// ```
pub fn parse_packet(buf: &[u8]) -> Result<TftpPacket, DecodeError> {
    let mut cursor = Cursor::new(buf);
    let opcode = cursor.read_u16("opcode")?;

    let packet = match TftpOpcode::from_u16(opcode) {
        Some(opcode @ (TftpOpcode::ReadRequest | TftpOpcode::WriteRequest)) => {
            let filename = cursor.read_string("filename")?;
            let mode = cursor.read_string("mode")?;
            // Anything after the mode is an RFC 2347 option list, which is not served
            TftpPacket::Request(TftpRequest { opcode, filename, mode })
        }
        Some(TftpOpcode::Data) => {
            let block = cursor.read_u16("block number")?;
            TftpPacket::Data(TftpData::new(block, cursor.rest()))
        }
        Some(TftpOpcode::Acknowledgment) => {
            let block = cursor.read_u16("block number")?;
            TftpPacket::Ack(TftpAck::new(block))
        }
        Some(TftpOpcode::Error) => {
            let code = cursor.read_u16("error code")?;
            let rest = cursor.rest();
            // Be lenient with peers that omit the trailing NUL
            let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            TftpPacket::Error(TftpError {
                code: TftpErrorCode::from_u16(code).unwrap_or(TftpErrorCode::NotDefined),
                message: String::from_utf8_lossy(&rest[..end]).into_owned(),
            })
        }
        None => TftpPacket::Unknown(opcode),
    };

    Ok(packet)
}

/// Build a TFTP request (RRQ/WRQ) packet
pub fn build_request(opcode: TftpOpcode, filename: &str, mode: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(2 + filename.len() + 1 + mode.len() + 1);
    v.extend_from_slice(&opcode.as_u16().to_be_bytes());
    v.extend_from_slice(filename.as_bytes());
    v.push(0);
    v.extend_from_slice(mode.as_bytes());
    v.push(0);
    v
}

/// Build a TFTP Data packet
pub fn build_data(block: u16, data: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(4 + data.len());
    v.extend_from_slice(&TftpOpcode::Data.as_u16().to_be_bytes());
    v.extend_from_slice(&block.to_be_bytes());
    v.extend_from_slice(data);
    v
}

/// Build a TFTP ACK packet
pub fn build_ack(block: u16) -> Vec<u8> {
    let mut v = Vec::with_capacity(4);
    v.extend_from_slice(&TftpOpcode::Acknowledgment.as_u16().to_be_bytes());
    v.extend_from_slice(&block.to_be_bytes());
    v
}

/// Build a TFTP Error packet
pub fn build_error(code: u16, msg: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(4 + msg.len() + 1);
    v.extend_from_slice(&TftpOpcode::Error.as_u16().to_be_bytes());
    v.extend_from_slice(&code.to_be_bytes());
    v.extend_from_slice(msg.as_bytes());
    v.push(0);
    v
}
