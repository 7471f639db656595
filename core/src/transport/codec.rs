/// Request framing for the ArmorD UART protocol
///
/// This module provides the pure, I/O-free half of the transport: encoding a
/// typed request into its wire form, splitting that form into
/// characteristic-sized blocks, and classifying device responses.
///
/// Wire layout of an encoded request:
///
/// ```text
/// [op: u8] [argc: u8] ( [len: u16 BE] [payload...] )*
/// ```
///
/// Requests longer than one characteristic write are split into blocks. Every
/// continuation ("extra") block is prefixed with a two byte header
/// `[0x00, index]` and is written BEFORE the primary block, in reverse index
/// order. The primary block carries the op code in its first byte and no
/// header; the device starts processing when it arrives, so it always goes
/// out last.
use crate::ProxyError;

/// Maximum bytes per characteristic write (BLE ATT payload limit).
pub const MTU: usize = 512;

/// Continuation header prepended to every extra block.
pub const BLOCK_HEADER_SIZE: usize = 2;

/// Request body bytes carried by a single extra block.
pub const BLOCK: usize = MTU - BLOCK_HEADER_SIZE;

/// Wire limit for one argument; lengths are two big-endian bytes.
pub const MAX_ARGUMENT_LEN: usize = u16::MAX as usize;

/// Wire limit for the argument count; the count is a single byte.
pub const MAX_ARGUMENTS: usize = u8::MAX as usize;

/// Operations understood by the security module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    GenerateKeys = 1,
    RotateKeys = 2,
    EraseKeys = 3,
    DigestBytes = 4,
    SignBytes = 5,
    ValidSignature = 6,
}

impl OpCode {
    /// Wire value of this op code.
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Protocol-level name, used in errors and logs.
    pub fn name(self) -> &'static str {
        match self {
            OpCode::GenerateKeys => "generateKeys",
            OpCode::RotateKeys => "rotateKeys",
            OpCode::EraseKeys => "eraseKeys",
            OpCode::DigestBytes => "digestBytes",
            OpCode::SignBytes => "signBytes",
            OpCode::ValidSignature => "validSignature",
        }
    }

    /// Decode a wire value back into an op code.
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(OpCode::GenerateKeys),
            2 => Some(OpCode::RotateKeys),
            3 => Some(OpCode::EraseKeys),
            4 => Some(OpCode::DigestBytes),
            5 => Some(OpCode::SignBytes),
            6 => Some(OpCode::ValidSignature),
            _ => None,
        }
    }
}

/// Encode a request into its full wire form (not yet split into blocks).
///
/// Arguments above 65535 bytes are rejected rather than silently truncated;
/// the two length bytes must always describe the payload exactly.
pub fn encode_request(op: OpCode, args: &[&[u8]]) -> Result<Vec<u8>, ProxyError> {
    if args.len() > MAX_ARGUMENTS {
        return Err(ProxyError::TooManyArguments(args.len()));
    }

    let payload: usize = args.iter().map(|arg| 2 + arg.len()).sum();
    let mut body = Vec::with_capacity(2 + payload);
    body.push(op.value());
    body.push(args.len() as u8);

    for (index, arg) in args.iter().enumerate() {
        if arg.len() > MAX_ARGUMENT_LEN {
            return Err(ProxyError::ArgumentTooLarge {
                index,
                len: arg.len(),
            });
        }
        body.extend_from_slice(&(arg.len() as u16).to_be_bytes());
        body.extend_from_slice(arg);
    }

    Ok(body)
}

/// Recover the op value and argument count from an encoded request.
///
/// A single-byte request implicitly carries zero arguments.
pub fn parse_request_header(body: &[u8]) -> Option<(u8, u8)> {
    match body {
        [] => None,
        [op] => Some((*op, 0)),
        [op, argc, ..] => Some((*op, *argc)),
    }
}

/// Number of extra blocks required after the primary block.
pub fn extra_block_count(len: usize) -> usize {
    if len <= MTU {
        0
    } else {
        (len - BLOCK_HEADER_SIZE + BLOCK - 1) / BLOCK - 1
    }
}

/// Split an encoded request into transport writes, in transmission order.
///
/// Extra blocks come first, highest index down to 1, so the device can
/// accumulate them before the primary block triggers processing. Every
/// returned block fits in one MTU-sized write.
pub fn split_blocks(body: &[u8]) -> Vec<Vec<u8>> {
    let extra = extra_block_count(body.len());
    let mut blocks = Vec::with_capacity(extra + 1);

    for index in (1..=extra).rev() {
        let start = index * BLOCK + BLOCK_HEADER_SIZE;
        let end = usize::min(start + BLOCK, body.len());
        let mut block = Vec::with_capacity(BLOCK_HEADER_SIZE + end - start);
        block.push(0x00);
        block.push(index as u8); // low 8 bits of the 1-based index
        block.extend_from_slice(&body[start..end]);
        blocks.push(block);
    }

    blocks.push(body[..usize::min(body.len(), MTU)].to_vec());
    blocks
}

/// A classified device response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Length-1 status above 1: the device rejected the block.
    Rejected(u8),
    /// Length-1 status of 0 or 1: a boolean result.
    Flag(bool),
    /// Anything else: an opaque payload (public key, digest, signature).
    Payload(Vec<u8>),
}

/// Classify a raw notification payload.
pub fn classify_response(bytes: &[u8]) -> Response {
    match bytes {
        [0] => Response::Flag(false),
        [1] => Response::Flag(true),
        [code] => Response::Rejected(*code),
        other => Response::Payload(other.to_vec()),
    }
}

/// Read a boolean result out of a response; any non-zero status byte means
/// true.
pub fn flag_from_response(bytes: &[u8]) -> bool {
    bytes.first().is_some_and(|byte| *byte != 0)
}
