// Transport module — frame codec and BLE UART central

pub mod ble;
pub mod codec;
pub mod link;

#[cfg(test)]
pub mod mock;

pub use ble::{BleCentral, UART_NOTIFY_UUID, UART_SERVICE_UUID, UART_WRITE_UUID};
pub use codec::{
    classify_response, encode_request, flag_from_response, split_blocks, OpCode, Response, BLOCK,
    MTU,
};
pub use link::{HsmCentral, HsmLink};
