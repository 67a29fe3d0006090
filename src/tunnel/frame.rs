//! Binary tunnel frame codec.
//!
//! ```text
//! +----------------+------------------+-----------------+
//! | addr_len (u16) | address (utf-8)  | chunk (rest)    |
//! +----------------+------------------+-----------------+
//! ```
//!
//! `addr_len` is big-endian. Only the first frame of a tunnel must carry an
//! address; later frames may repeat it or leave it empty.

use crate::error::FrameError;

const LEN_PREFIX: usize = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelFrame {
    pub address: String,
    pub chunk: Vec<u8>,
}

impl TunnelFrame {
    /// Opening frame: target address, no data.
    pub fn open(address: &str) -> Self {
        Self {
            address: address.to_string(),
            chunk: Vec::new(),
        }
    }

    pub fn data(chunk: &[u8]) -> Self {
        Self {
            address: String::new(),
            chunk: chunk.to_vec(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let addr = self.address.as_bytes();
        let addr_len = u16::try_from(addr.len()).map_err(|_| FrameError::AddressTooLong(addr.len()))?;
        let mut out = Vec::with_capacity(LEN_PREFIX + addr.len() + self.chunk.len());
        out.extend_from_slice(&addr_len.to_be_bytes());
        out.extend_from_slice(addr);
        out.extend_from_slice(&self.chunk);
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < LEN_PREFIX {
            return Err(FrameError::Truncated(buf.len()));
        }
        let declared = usize::from(u16::from_be_bytes([buf[0], buf[1]]));
        let body = &buf[LEN_PREFIX..];
        if declared > body.len() {
            return Err(FrameError::AddressOverflow {
                declared,
                available: body.len(),
            });
        }
        let (addr, chunk) = body.split_at(declared);
        let address = std::str::from_utf8(addr)
            .map_err(|_| FrameError::AddressEncoding)?
            .to_string();
        Ok(Self {
            address,
            chunk: chunk.to_vec(),
        })
    }
}
