//! Block reassembly for the unloader.
//!
//! The wire is a stream of `varint(len) || len bytes` blocks. A length of
//! zero marks padding: the remainder of the current load-size window is
//! zero fill, and the next block starts at the following load-size
//! boundary. Blocks may span any number of ship chunks.

use spn_core::{Container, Error, Result};

/// Incremental parser turning ship chunks back into blocks.
pub struct BlockReassembler {
    load_size: u64,
    pending: Container,
    // Absolute stream offset of the next unconsumed byte.
    pos: u64,
    expecting: Option<usize>,
    skipping: usize,
}

impl BlockReassembler {
    /// Create a reassembler for a ship with the given load size.
    pub fn new(load_size: usize) -> Self {
        Self {
            load_size: load_size as u64,
            pending: Container::new(),
            pos: 0,
            expecting: None,
            skipping: 0,
        }
    }

    /// Feed one ship chunk, returning all blocks completed by it.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<Vec<Container>> {
        self.pending.append(chunk);
        let mut blocks = Vec::new();

        loop {
            // Discard padding fill first.
            if self.skipping > 0 {
                let take = self.skipping.min(self.pending.length());
                if take == 0 {
                    break;
                }
                self.pending.skip(take)?;
                self.pos += take as u64;
                self.skipping -= take;
                if self.skipping > 0 {
                    break;
                }
            }

            if self.expecting.is_none() {
                match self.try_read_length()? {
                    Some(0) => {
                        // Padding marker: skip to the next load-size boundary.
                        let into_window = self.pos % self.load_size;
                        if into_window != 0 {
                            self.skipping = (self.load_size - into_window) as usize;
                        }
                        continue;
                    }
                    Some(len) => self.expecting = Some(len),
                    None => break,
                }
            }

            let len = self.expecting.unwrap_or(0);
            if self.pending.length() < len {
                break;
            }
            let block = Container::from_data(self.pending.get_next(len)?);
            self.pos += len as u64;
            self.expecting = None;
            blocks.push(block);
        }

        Ok(blocks)
    }

    /// Try to consume a block length varint; `None` if more bytes are
    /// needed.
    fn try_read_length(&mut self) -> Result<Option<usize>> {
        let available = self.pending.length().min(10);
        if available == 0 {
            return Ok(None);
        }
        let mut probe = Container::from_data(&self.pending.as_slice()[..available]);
        match probe.get_next_n32() {
            Ok(len) => {
                let varint_len = available - probe.length();
                self.pending.skip(varint_len)?;
                self.pos += varint_len as u64;
                Ok(Some(len as usize))
            }
            Err(_) if available < 10 => Ok(None),
            Err(err) => Err(Error::MalformedData(format!("bad block length: {err}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut c = Container::from_data(payload.to_vec());
        c.prepend_length();
        c.compile_data()
    }

    #[test]
    fn single_block_in_one_chunk() {
        let mut r = BlockReassembler::new(100);
        let blocks = r.push_chunk(&framed(b"hello")).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].compile_data(), b"hello");
    }

    #[test]
    fn block_spanning_chunks() {
        let mut r = BlockReassembler::new(10);
        let wire = framed(&vec![0xAB; 25]);

        let mut blocks = Vec::new();
        for chunk in wire.chunks(10) {
            blocks.extend(r.push_chunk(chunk).unwrap());
        }
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].length(), 25);
    }

    #[test]
    fn padding_is_skipped_to_boundary() {
        let load_size = 20;
        // Shipment: block + padding marker + zeros to the boundary.
        let mut wire = framed(b"data!");
        wire.push(0); // padding marker
        while wire.len() % load_size != 0 {
            wire.push(0);
        }
        // A second shipment follows at the boundary.
        wire.extend_from_slice(&framed(b"after"));

        let mut r = BlockReassembler::new(load_size);
        let mut blocks = Vec::new();
        for chunk in wire.chunks(load_size) {
            blocks.extend(r.push_chunk(chunk).unwrap());
        }

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].compile_data(), b"data!");
        assert_eq!(blocks[1].compile_data(), b"after");
    }

    #[test]
    fn padding_marker_on_boundary_is_free() {
        let load_size = 8;
        // Exactly aligned shipment: marker lands on the boundary and no
        // fill follows.
        let mut wire = framed(b"123456"); // 1 + 6 = 7 bytes
        wire.push(0); // marker brings it to 8
        wire.extend_from_slice(&framed(b"x"));

        let mut r = BlockReassembler::new(load_size);
        let blocks = r.push_chunk(&wire).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].compile_data(), b"x");
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let mut wire = framed(b"spanning");
        wire.extend_from_slice(&framed(b"blocks"));

        let mut r = BlockReassembler::new(100);
        let mut blocks = Vec::new();
        for byte in wire {
            blocks.extend(r.push_chunk(&[byte]).unwrap());
        }
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].compile_data(), b"spanning");
        assert_eq!(blocks[1].compile_data(), b"blocks");
    }
}
