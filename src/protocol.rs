//! Wire constants for the MDB cashless-device command set.

use enumn::N;

/// Our peripheral address: cashless device #1.
pub const ADDRESS: u8 = 0x10;

//Single-byte bus signaling - these are not commands
pub const ACK: u8 = 0x00;
pub const RET: u8 = 0xAA;
pub const NAK: u8 = 0xFF;

//An address/command byte is AAAAACCC
pub const ADDRESS_MASK: u8 = 0b1111_1000;
pub const COMMAND_MASK: u8 = 0b0000_0111;

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Command {
    Reset = 0x00,
    Setup = 0x01,
    Poll = 0x02,
    Vend = 0x03,
    Reader = 0x04,
    Expansion = 0x07,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SetupSubcommand {
    ConfigData = 0x00,
    MaxMinPrices = 0x01,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum VendSubcommand {
    Request = 0x00,
    Cancel = 0x01,
    Success = 0x02,
    Failure = 0x03,
    SessionComplete = 0x04,
    CashSale = 0x05,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ReaderSubcommand {
    Disable = 0x00,
    Enable = 0x01,
    Cancel = 0x02,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ExpansionSubcommand {
    RequestId = 0x00,
}

impl VendSubcommand {
    /// Number of data bytes between the subcommand and the checksum.
    pub fn data_len(self) -> usize {
        match self {
            VendSubcommand::Request => 4,
            VendSubcommand::Cancel => 0,
            VendSubcommand::Success => 2,
            VendSubcommand::Failure => 0,
            VendSubcommand::SessionComplete => 0,
            VendSubcommand::CashSale => 4,
        }
    }
}

//First bytes of the responses we may hand back to a POLL
pub const REPLY_JUST_RESET: u8 = 0x00;
pub const REPLY_READER_CONFIG_DATA: u8 = 0x01;
pub const REPLY_BEGIN_SESSION: u8 = 0x03;
pub const REPLY_SESSION_CANCEL_REQUEST: u8 = 0x04;
pub const REPLY_VEND_APPROVED: u8 = 0x05;
pub const REPLY_VEND_DENIED: u8 = 0x06;
pub const REPLY_END_SESSION: u8 = 0x07;
pub const REPLY_CANCELLED: u8 = 0x08;
pub const REPLY_PERIPHERAL_ID: u8 = 0x09;
pub const REPLY_OUT_OF_SEQUENCE: u8 = 0x0B;

//Fixed fields of the SETUP/CONFIG_DATA reply
pub const FEATURE_LEVEL: u8 = 1;
pub const SCALE_FACTOR: u8 = 1;
pub const DECIMAL_PLACES: u8 = 2;
pub const MAX_RESPONSE_TIME_S: u8 = 5;
/// Miscellaneous options: refund capable, monetary data in 16 bit.
pub const MISC_OPTIONS: u8 = 0b0000_1001;

/// Reply to SETUP/CONFIG_DATA. No country restriction, prices are plain
/// cents (scale factor 1, two decimal places).
pub const READER_CONFIG_RESPONSE: [u8; 8] = [
    REPLY_READER_CONFIG_DATA,
    FEATURE_LEVEL,
    0xFF, //Country code high
    0xFF, //Country code low
    SCALE_FACTOR,
    DECIMAL_PLACES,
    MAX_RESPONSE_TIME_S,
    MISC_OPTIONS,
];

/// Reply to EXPANSION/REQUEST_ID: manufacturer (3), serial (12), model (12)
/// and software version (2), ASCII padded with spaces.
pub const PERIPHERAL_ID_RESPONSE: [u8; 30] = [
    REPLY_PERIPHERAL_ID,
    b'M', b'D', b'C', //Manufacturer code
    b'0', b'0', b'0', b'0', b'0', b'0', b'0', b'0', b'0', b'0', b'0', b'1', //Serial number
    b'C', b'A', b'S', b'H', b'L', b'E', b'S', b'S', b'-', b'R', b'D', b'R', //Model number
    b'0', b'1', //Software version
];

/// MDB block checksum: sum of all payload bytes, modulo 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_wraps_modulo_256() {
        assert_eq!(checksum(&[]), 0x00);
        assert_eq!(checksum(&[0x12]), 0x12);
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
        assert_eq!(checksum(&[0x13, 0x00, 0x00, 0x96, 0x00, 0x03]), 0xAC);
    }

    #[test]
    fn command_bytes_decode() {
        assert_eq!(Command::n(0x12 & COMMAND_MASK), Some(Command::Poll));
        assert_eq!(Command::n(0x13 & COMMAND_MASK), Some(Command::Vend));
        assert_eq!(Command::n(0x17 & COMMAND_MASK), Some(Command::Expansion));
        //Revalue (0x15) is not part of the level 1 set we implement
        assert_eq!(Command::n(0x15 & COMMAND_MASK), None);
    }

    #[test]
    fn vend_payload_sizes_match_the_frame_shapes() {
        assert_eq!(VendSubcommand::Request.data_len(), 4);
        assert_eq!(VendSubcommand::Success.data_len(), 2);
        assert_eq!(VendSubcommand::Failure.data_len(), 0);
        assert_eq!(VendSubcommand::CashSale.data_len(), 4);
    }

    #[test]
    fn config_response_is_the_documented_block() {
        assert_eq!(
            READER_CONFIG_RESPONSE,
            [0x01, 0x01, 0xFF, 0xFF, 0x01, 0x02, 0x05, 0x09]
        );
    }

    #[test]
    fn peripheral_id_response_shape() {
        assert_eq!(PERIPHERAL_ID_RESPONSE.len(), 30);
        assert_eq!(PERIPHERAL_ID_RESPONSE[0], REPLY_PERIPHERAL_ID);
        //All identity fields are printable ASCII
        assert!(PERIPHERAL_ID_RESPONSE[1..]
            .iter()
            .all(|b| (0x20..0x7F).contains(b)));
    }
}
