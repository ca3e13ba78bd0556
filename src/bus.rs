//! 9-bit MDB symbol transport.
//!
//! MDB is a 9600 bps 9-bit bus; the 9th "mode" bit marks the address byte of
//! a master frame and the final (checksum or ACK) byte of a peripheral
//! response. The UART collaborator deals with the 9th bit - either a
//! hardware UART flipping parity per byte, or a PIO/soft UART - and presents
//! each symbol on an [`embedded_io_async`] stream as two bytes: the mode bit,
//! then the data byte.
//!
//! Everything above this module works in whole frames; everything below it is
//! the firmware's UART driver.

use embassy_time::{with_timeout, Duration};
use embedded_io_async::{Read, Write};

use crate::protocol::{ACK, NAK};

/// Gap that delimits a command frame. The bus allows up to 5 ms between the
/// bytes of a block; anything longer means the frame is over.
pub const INTER_BYTE_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MdbError {
    /// No byte arrived within the inter-byte gap.
    Timeout,
    /// Block checksum mismatch.
    Checksum,
    /// A symbol that cannot occur at this point in a frame.
    Malformed,
    /// The underlying UART reported an error.
    Uart,
}

/// One 9-bit symbol off the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Symbol {
    pub mode: bool,
    pub byte: u8,
}

pub struct Mdb<T: Read + Write> {
    uart: T,
}

impl<T: Read + Write> Mdb<T> {
    pub fn new(uart: T) -> Self {
        Self { uart }
    }

    /// Wait for the next symbol. No timeout: between frames the line is
    /// simply quiet until the VMC addresses somebody.
    pub async fn recv_symbol(&mut self) -> Result<Symbol, MdbError> {
        let mut pair = [0u8; 2];
        self.uart
            .read_exact(&mut pair)
            .await
            .map_err(|_| MdbError::Uart)?;
        Ok(Symbol {
            mode: pair[0] != 0,
            byte: pair[1],
        })
    }

    /// Wait for the next symbol of the frame in progress.
    pub async fn recv_symbol_timeout(&mut self) -> Result<Symbol, MdbError> {
        match with_timeout(INTER_BYTE_TIMEOUT, self.recv_symbol()).await {
            Ok(symbol) => symbol,
            Err(_) => Err(MdbError::Timeout),
        }
    }

    /// Fill `buf` with the data bytes of the frame in progress. A mode bit
    /// mid-frame is a framing fault.
    pub async fn read_data(&mut self, buf: &mut [u8]) -> Result<(), MdbError> {
        for slot in buf.iter_mut() {
            let symbol = self.recv_symbol_timeout().await?;
            if symbol.mode {
                return Err(MdbError::Malformed);
            }
            *slot = symbol.byte;
        }
        Ok(())
    }

    /// Collect data bytes until the line goes quiet, for frames whose length
    /// we do not know. Returns how many bytes were kept; anything beyond
    /// `buf` is read and dropped.
    pub async fn drain_frame(&mut self, buf: &mut [u8]) -> usize {
        let mut count = 0;
        loop {
            match self.recv_symbol_timeout().await {
                Ok(symbol) => {
                    if count < buf.len() {
                        buf[count] = symbol.byte;
                        count += 1;
                    }
                }
                Err(_) => return count,
            }
        }
    }

    pub async fn send_ack(&mut self) -> Result<(), MdbError> {
        self.send_symbol(true, ACK).await
    }

    pub async fn send_nak(&mut self) -> Result<(), MdbError> {
        self.send_symbol(true, NAK).await
    }

    /// Transmit a response block: payload, then the checksum with the mode
    /// bit set to hand the bus back to the VMC.
    pub async fn send_block(&mut self, payload: &[u8]) -> Result<(), MdbError> {
        let mut checksum: u8 = 0x00;
        for byte in payload {
            checksum = checksum.wrapping_add(*byte);
            self.send_symbol(false, *byte).await?;
        }
        self.send_symbol(true, checksum).await
    }

    async fn send_symbol(&mut self, mode: bool, byte: u8) -> Result<(), MdbError> {
        self.uart
            .write_all(&[mode as u8, byte])
            .await
            .map_err(|_| MdbError::Uart)
    }
}
