pub mod dataset;
pub mod file_sync;
pub mod memory;
pub mod store;
pub mod traits;

use crc::{CRC_32_ISO_HDLC, Crc};

pub const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
