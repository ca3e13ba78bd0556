//! The card reader seam.
//!
//! The RFID hardware driver lives in the firmware; the coordinator only
//! needs presence polling, a one-shot UID read and a way to shut the card
//! down once the vend is settled.

use core::fmt::Write as _;

use heapless::{String, Vec};

/// ISO14443 UIDs are 4, 7 or 10 bytes; we accept the whole range.
pub const UID_MIN: usize = 4;
pub const UID_MAX: usize = 10;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReaderError {
    /// UID length outside 4..=10 bytes.
    InvalidUid,
    /// The reader hardware failed the operation.
    Device,
}

/// A card UID as read from the reader.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Uid {
    bytes: Vec<u8, UID_MAX>,
}

impl Uid {
    pub fn new(bytes: &[u8]) -> Result<Self, ReaderError> {
        if !(UID_MIN..=UID_MAX).contains(&bytes.len()) {
            return Err(ReaderError::InvalidUid);
        }
        let mut uid = Vec::new();
        //Length checked above, cannot overflow the backing array
        let _ = uid.extend_from_slice(bytes);
        Ok(Self { bytes: uid })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The account key: the UID as uppercase hex, e.g. `0486A5DA826180`.
    pub fn to_hex(&self) -> String<{ UID_MAX * 2 }> {
        let mut out = String::new();
        for byte in &self.bytes {
            //Two hex digits per byte always fit the capacity
            let _ = write!(out, "{:02X}", byte);
        }
        out
    }
}

/// One presented card.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Card {
    pub uid: Uid,
    /// Select acknowledge byte, reported by the reader.
    pub sak: u8,
}

pub trait CardReader {
    /// Is a card currently in the field?
    async fn is_card_present(&mut self) -> bool;

    /// Read the card in the field.
    async fn read(&mut self) -> Result<Card, ReaderError>;

    /// Done with this card; halt it until it leaves the field.
    async fn end_card(&mut self);
}
