/// BLE (Bluetooth Low Energy) Transport Module
///
/// Protocol-level pieces of the mesh link. The radio itself sits behind
/// [`RadioAdapter`](crate::transport::RadioAdapter), so everything here is
/// testable without hardware:
///
/// - **gatt**: service layout, MTU arithmetic and prepared-write reassembly
/// - **scanner**: scan window bookkeeping
/// - **loopback**: in-process radio used by tests and the simulator

pub mod gatt;
pub mod loopback;
pub mod scanner;

pub use gatt::{
    mesh_service_descriptor, split_for_prepared_write, usable_payload, GattCharacteristic,
    GattError, PreparedWriteBuffer, ATT_HEADER_SIZE, MAX_CHARACTERISTIC_SIZE,
    MAX_PREPARED_WRITE_SIZE, MESH_SERVICE_UUID, PREPARE_WRITE_HEADER_SIZE,
};
pub use loopback::{LoopbackRadio, RadioHub, RadioStats};
pub use scanner::{BleScanConfig, BleScanner, ScannerError, ScannerState};
