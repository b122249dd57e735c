//! Terminal and operation message framing.
//!
//! Wire format of a single message, used at both the terminal level
//! (inside a crane block) and the operation level (inside a terminal's
//! data payload):
//!
//! ```text
//! Length [varint]        — 0 means the remainder is padding
//! ID|Type [varint]       — Type in the two least significant bits,
//!                          ID in all other bits (IDs are multiples of 4)
//! Data [bytes]           — per message type:
//!   Init: opaque setup data
//!   Data: AddAvailableSpace [varint] + payload (flow-queue users only)
//!   Stop: error code [varint]
//! ```

use crate::{Container, Error, Result};

/// Message types occupying the two low bits of the ID field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// Establish a new terminal or start a new operation.
    Init = 1,
    /// Carry data to a terminal or operation.
    Data = 2,
    /// Abandon a terminal or end an operation, with an error code.
    Stop = 3,
}

impl MsgType {
    fn from_low_bits(bits: u32) -> Result<Self> {
        match bits {
            1 => Ok(MsgType::Init),
            2 => Ok(MsgType::Data),
            3 => Ok(MsgType::Stop),
            _ => Err(Error::MalformedData(format!("invalid msg type {bits}"))),
        }
    }
}

/// Prepend the ID and Type header to the message.
pub fn add_id_type(c: &mut Container, id: u32, msg_type: MsgType) {
    c.prepend_number(u64::from(id | msg_type as u32));
}

/// Prepend the ID and Type header and the length of the message.
pub fn make_msg(c: &mut Container, id: u32, msg_type: MsgType) {
    add_id_type(c, id, msg_type);
    c.prepend_length();
}

/// Consume and split an ID|Type header.
pub fn parse_id_type(c: &mut Container) -> Result<(u32, MsgType)> {
    let id_type = c.get_next_n32()?;
    let msg_type = MsgType::from_low_bits(id_type % 4)?;
    Ok((id_type - msg_type as u32, msg_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_type_round_trip() {
        for &(id, msg_type) in &[
            (0u32, MsgType::Init),
            (4, MsgType::Data),
            (8, MsgType::Stop),
            (0x3FFF_FFFC, MsgType::Data),
        ] {
            let mut c = Container::from_data(b"body".to_vec());
            add_id_type(&mut c, id, msg_type);
            let (got_id, got_type) = parse_id_type(&mut c).unwrap();
            assert_eq!(got_id, id);
            assert_eq!(got_type, msg_type);
            assert_eq!(c.compile_data(), b"body");
        }
    }

    #[test]
    fn make_msg_prepends_length() {
        let mut c = Container::from_data(b"hello".to_vec());
        make_msg(&mut c, 8, MsgType::Data);
        let mut block = c.get_next_block().unwrap();
        assert!(!c.holds_data());
        let (id, msg_type) = parse_id_type(&mut block).unwrap();
        assert_eq!(id, 8);
        assert_eq!(msg_type, MsgType::Data);
        assert_eq!(block.compile_data(), b"hello");
    }

    #[test]
    fn zero_type_bits_rejected() {
        let mut c = Container::new();
        c.append_number(8); // ID 8, type bits 0
        assert!(parse_id_type(&mut c).is_err());
    }
}
