/// GATT layout and prepared-write handling for the mesh service
///
/// This module defines the mesh service and its characteristics, the ATT
/// size arithmetic used when a value does not fit a single write, and the
/// server-side buffer that collects offset-tagged prepared writes until the
/// remote central executes them.

use std::collections::HashMap;
use thiserror::Error;

use crate::transport::abstraction::ServiceDescriptor;

/// Mesh service UUID (0x1830)
pub const MESH_SERVICE_UUID: u128 = 0x0000_1830_0000_1000_8000_00805F9B34FB;

/// Maximum GATT characteristic value size (protocol limitation)
pub const MAX_CHARACTERISTIC_SIZE: usize = 512;

/// ATT write request overhead: opcode + attribute handle
pub const ATT_HEADER_SIZE: usize = 3;

/// ATT prepare write overhead: opcode + attribute handle + value offset
pub const PREPARE_WRITE_HEADER_SIZE: usize = 5;

/// Upper bound on a prepared-write sequence held for one device
pub const MAX_PREPARED_WRITE_SIZE: usize = 256 * 1024;

/// Characteristics exposed by the mesh service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattCharacteristic {
    /// Whole protocol messages (JSON envelopes, compact strings)
    Message,
    /// Indexed chunks of large binary bodies
    ChunkData,
}

impl GattCharacteristic {
    /// Full 128-bit characteristic UUID
    pub fn uuid(&self) -> u128 {
        match self {
            GattCharacteristic::Message => 0x0000_2A90_0000_1000_8000_00805F9B34FB,
            GattCharacteristic::ChunkData => 0x0000_2A91_0000_1000_8000_00805F9B34FB,
        }
    }

    pub fn from_uuid(uuid: u128) -> Option<Self> {
        [GattCharacteristic::Message, GattCharacteristic::ChunkData]
            .into_iter()
            .find(|c| c.uuid() == uuid)
    }
}

/// Service layout registered with the local GATT server
pub fn mesh_service_descriptor() -> ServiceDescriptor {
    ServiceDescriptor {
        service: MESH_SERVICE_UUID,
        characteristics: vec![
            GattCharacteristic::Message.uuid(),
            GattCharacteristic::ChunkData.uuid(),
        ],
    }
}

/// Errors for GATT operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("MTU {0} too small for prepared writes")]
    MtuTooSmall(u16),
    #[error("Prepared write too large: {0} bytes")]
    PreparedWriteTooLarge(usize),
    #[error("Prepared write targets {got:#x}, sequence started on {expected:#x}")]
    CharacteristicMismatch { expected: u128, got: u128 },
    #[error("Reassembly error: {0}")]
    ReassemblyError(String),
}

/// Largest value that fits a single write at the given MTU
pub fn usable_payload(mtu: u16) -> usize {
    (mtu as usize).saturating_sub(ATT_HEADER_SIZE)
}

/// Split `data` into `(offset, part)` pairs sized for prepared writes at `mtu`
pub fn split_for_prepared_write(data: &[u8], mtu: u16) -> Result<Vec<(usize, &[u8])>, GattError> {
    let part_size = (mtu as usize).saturating_sub(PREPARE_WRITE_HEADER_SIZE);
    if part_size == 0 {
        return Err(GattError::MtuTooSmall(mtu));
    }
    if data.len() > MAX_PREPARED_WRITE_SIZE {
        return Err(GattError::PreparedWriteTooLarge(data.len()));
    }

    Ok(data
        .chunks(part_size)
        .enumerate()
        .map(|(i, part)| (i * part_size, part))
        .collect())
}

struct PendingWrite {
    characteristic: u128,
    parts: Vec<(usize, Vec<u8>)>,
    bytes: usize,
}

/// Server-side accumulator for prepared writes, keyed by remote device
#[derive(Default)]
pub struct PreparedWriteBuffer {
    pending: HashMap<String, PendingWrite>,
}

impl PreparedWriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one offset-tagged part from `device`
    pub fn append(
        &mut self,
        device: &str,
        characteristic: u128,
        offset: usize,
        value: &[u8],
    ) -> Result<(), GattError> {
        let entry = self
            .pending
            .entry(device.to_string())
            .or_insert_with(|| PendingWrite {
                characteristic,
                parts: Vec::new(),
                bytes: 0,
            });

        if entry.characteristic != characteristic {
            let expected = entry.characteristic;
            self.pending.remove(device);
            return Err(GattError::CharacteristicMismatch {
                expected,
                got: characteristic,
            });
        }

        entry.bytes += value.len();
        if entry.bytes > MAX_PREPARED_WRITE_SIZE {
            let bytes = entry.bytes;
            self.pending.remove(device);
            return Err(GattError::PreparedWriteTooLarge(bytes));
        }

        entry.parts.push((offset, value.to_vec()));
        Ok(())
    }

    /// Assemble and remove everything queued for `device`.
    ///
    /// Parts are placed by offset, so retransmitted parts simply overwrite
    /// themselves. Returns `Ok(None)` when nothing was queued.
    pub fn execute(&mut self, device: &str) -> Result<Option<(u128, Vec<u8>)>, GattError> {
        let Some(mut pending) = self.pending.remove(device) else {
            return Ok(None);
        };

        pending.parts.sort_by_key(|(offset, _)| *offset);

        let mut assembled: Vec<u8> = Vec::new();
        for (offset, part) in pending.parts {
            if offset > assembled.len() {
                return Err(GattError::ReassemblyError(format!(
                    "Gap before offset {} (have {} bytes)",
                    offset,
                    assembled.len()
                )));
            }
            let end = offset + part.len();
            if end > assembled.len() {
                assembled.resize(end, 0);
            }
            assembled[offset..end].copy_from_slice(&part);
        }

        Ok(Some((pending.characteristic, assembled)))
    }

    /// Drop everything queued for `device`
    pub fn discard(&mut self, device: &str) -> bool {
        self.pending.remove(device).is_some()
    }

    pub fn is_pending(&self, device: &str) -> bool {
        self.pending.contains_key(device)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSG: u128 = 0x0000_2A90_0000_1000_8000_00805F9B34FB;

    #[test]
    fn test_characteristic_uuids() {
        assert_eq!(GattCharacteristic::Message.uuid(), MSG);
        assert_eq!(
            GattCharacteristic::from_uuid(GattCharacteristic::ChunkData.uuid()),
            Some(GattCharacteristic::ChunkData)
        );
        assert_eq!(GattCharacteristic::from_uuid(0x1234), None);
    }

    #[test]
    fn test_usable_payload() {
        assert_eq!(usable_payload(23), 20);
        assert_eq!(usable_payload(512), 509);
        assert_eq!(usable_payload(2), 0);
    }

    #[test]
    fn test_split_for_prepared_write() {
        let data = vec![0xAAu8; 100];
        let parts = split_for_prepared_write(&data, 23).expect("Split");

        // 18 bytes per part at the default MTU
        assert_eq!(parts.len(), 6);
        assert_eq!(parts[1].0, 18);
        assert_eq!(parts[5].1.len(), 10);
        assert!(parts.iter().all(|(_, p)| p.len() <= 18));
    }

    #[test]
    fn test_split_rejects_tiny_mtu() {
        assert_eq!(
            split_for_prepared_write(b"abc", 5),
            Err(GattError::MtuTooSmall(5))
        );
    }

    #[test]
    fn test_prepared_buffer_out_of_order() {
        let mut buffer = PreparedWriteBuffer::new();
        buffer.append("dev", MSG, 10, b"world").expect("append");
        buffer.append("dev", MSG, 0, b"hello, wor").expect("append");

        let (characteristic, value) = buffer.execute("dev").expect("execute").expect("data");
        assert_eq!(characteristic, MSG);
        assert_eq!(value, b"hello, world");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_prepared_buffer_retransmitted_part() {
        let mut buffer = PreparedWriteBuffer::new();
        buffer.append("dev", MSG, 0, b"abc").expect("append");
        buffer.append("dev", MSG, 3, b"def").expect("append");
        buffer.append("dev", MSG, 3, b"def").expect("append");

        let (_, value) = buffer.execute("dev").expect("execute").expect("data");
        assert_eq!(value, b"abcdef");
    }

    #[test]
    fn test_prepared_buffer_gap_is_error() {
        let mut buffer = PreparedWriteBuffer::new();
        buffer.append("dev", MSG, 0, b"abc").expect("append");
        buffer.append("dev", MSG, 10, b"xyz").expect("append");

        assert!(buffer.execute("dev").is_err());
        assert!(!buffer.is_pending("dev"));
    }

    #[test]
    fn test_prepared_buffer_per_device() {
        let mut buffer = PreparedWriteBuffer::new();
        buffer.append("a", MSG, 0, b"one").expect("append");
        buffer.append("b", MSG, 0, b"two").expect("append");

        assert!(buffer.discard("a"));
        assert_eq!(buffer.execute("a").expect("execute"), None);
        let (_, value) = buffer.execute("b").expect("execute").expect("data");
        assert_eq!(value, b"two");
    }

    #[test]
    fn test_prepared_buffer_characteristic_mismatch() {
        let mut buffer = PreparedWriteBuffer::new();
        buffer.append("dev", MSG, 0, b"abc").expect("append");
        let result = buffer.append("dev", GattCharacteristic::ChunkData.uuid(), 3, b"def");

        assert!(matches!(result, Err(GattError::CharacteristicMismatch { .. })));
        assert!(!buffer.is_pending("dev"));
    }
}
