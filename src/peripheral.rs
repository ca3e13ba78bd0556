//! The MDB slave protocol engine.
//!
//! One task, one job: answer the VMC. The engine sleeps on the bus until an
//! address byte with our bits arrives, completes the frame with the
//! inter-byte timeout, and responds before the 5 ms deadline. All handler
//! work is straight-line field updates on the shared record; anything slow
//! (HTTP, card I/O) happens in other tasks and meets us only through that
//! record and the cash-sale queue.
//!
//! Failure policy per frame: checksum mismatch answers NAK and changes
//! nothing; a timeout mid-frame discards silently (the VMC retries on its
//! own schedule); frames for other peripherals produce no traffic at all.

use embedded_io_async::{Read, Write};

use crate::bus::{Mdb, MdbError};
use crate::cash_sale::{CashSale, CashSaleSender};
use crate::protocol::{
    checksum, Command, ExpansionSubcommand, ReaderSubcommand, SetupSubcommand, VendSubcommand,
    ACK, ADDRESS, ADDRESS_MASK, COMMAND_MASK, NAK, PERIPHERAL_ID_RESPONSE, READER_CONFIG_RESPONSE,
    REPLY_CANCELLED, RET,
};
use crate::state::CashlessState;

//Largest frame we ever complete: EXPANSION/REQUEST_ID sub + 29 data + chk
const FRAME_BUF: usize = 34;

pub struct CashlessPeripheral<'a, T: Read + Write> {
    bus: Mdb<T>,
    state: &'a CashlessState,
    cash_sales: CashSaleSender<'a>,
    cash_overflow_logged: bool,
}

impl<'a, T: Read + Write> CashlessPeripheral<'a, T> {
    pub fn new(bus: Mdb<T>, state: &'a CashlessState, cash_sales: CashSaleSender<'a>) -> Self {
        Self {
            bus,
            state,
            cash_sales,
            cash_overflow_logged: false,
        }
    }

    /// Service loop. Never returns; frame-level errors are handled on the
    /// spot and the engine goes back to listening.
    pub async fn run(&mut self) -> ! {
        info!("mdb slave engine listening at {:#04x}", ADDRESS);
        loop {
            let symbol = match self.bus.recv_symbol().await {
                Ok(symbol) => symbol,
                Err(_) => continue,
            };
            //Between frames only an address byte concerns us; data bytes
            //here belong to some other peripheral's frame.
            if !symbol.mode {
                continue;
            }
            let byte = symbol.byte;
            if byte == ACK || byte == RET || byte == NAK {
                continue;
            }
            if byte & ADDRESS_MASK != ADDRESS {
                continue;
            }
            match self.dispatch(byte).await {
                Ok(()) => {}
                Err(MdbError::Timeout) => {
                    //Frame died mid-air; stay silent, the VMC will retry
                    debug!("frame timeout on command {:#04x}", byte);
                }
                Err(e) => {
                    debug!("frame error on command {:#04x}: {:?}", byte, e);
                }
            }
        }
    }

    async fn dispatch(&mut self, cmd_byte: u8) -> Result<(), MdbError> {
        let Some(command) = Command::n(cmd_byte & COMMAND_MASK) else {
            return self.handle_unknown(cmd_byte).await;
        };
        match command {
            Command::Reset => self.handle_reset(cmd_byte).await,
            Command::Setup => self.handle_setup(cmd_byte).await,
            Command::Poll => self.handle_poll(cmd_byte).await,
            Command::Vend => self.handle_vend(cmd_byte).await,
            Command::Reader => self.handle_reader(cmd_byte).await,
            Command::Expansion => self.handle_expansion(cmd_byte).await,
        }
    }

    /// Read `data_len` payload bytes plus the checksum byte and verify the
    /// block. `lead` is everything already received (command, subcommand).
    /// Returns the payload slice, or None after NAKing a bad block.
    async fn read_checked<'b>(
        &mut self,
        lead: &[u8],
        buf: &'b mut [u8; FRAME_BUF],
        data_len: usize,
    ) -> Result<Option<&'b [u8]>, MdbError> {
        self.bus.read_data(&mut buf[..data_len + 1]).await?;
        let expected = checksum(lead).wrapping_add(checksum(&buf[..data_len]));
        let received = buf[data_len];
        if expected != received {
            warn!(
                "checksum mismatch on {:#04x}: calculated {:#04x}, got {:#04x}",
                lead[0], expected, received
            );
            self.bus.send_nak().await?;
            return Ok(None);
        }
        Ok(Some(&buf[..data_len]))
    }

    async fn handle_reset(&mut self, cmd_byte: u8) -> Result<(), MdbError> {
        let mut buf = [0u8; FRAME_BUF];
        if self.read_checked(&[cmd_byte], &mut buf, 0).await?.is_some() {
            self.state.on_reset();
            self.bus.send_ack().await?;
        }
        Ok(())
    }

    async fn handle_poll(&mut self, cmd_byte: u8) -> Result<(), MdbError> {
        let mut buf = [0u8; FRAME_BUF];
        if self.read_checked(&[cmd_byte], &mut buf, 0).await?.is_none() {
            return Ok(());
        }
        match self.state.take_poll_response() {
            Some(response) => {
                let mut reply = [0u8; 3];
                self.bus.send_block(response.encode(&mut reply)).await
            }
            None => self.bus.send_ack().await,
        }
    }

    async fn handle_setup(&mut self, cmd_byte: u8) -> Result<(), MdbError> {
        let sub = self.bus.recv_symbol_timeout().await?.byte;
        let Some(subcommand) = SetupSubcommand::n(sub) else {
            return self.handle_unknown_sub(cmd_byte, sub).await;
        };
        let mut buf = [0u8; FRAME_BUF];
        let Some(data) = self.read_checked(&[cmd_byte, sub], &mut buf, 4).await? else {
            return Ok(());
        };
        match subcommand {
            SetupSubcommand::ConfigData => {
                let vmc_feature_level = data[0];
                debug!("vmc config received, feature level {}", vmc_feature_level);
                self.state.on_setup_config();
                self.bus.send_block(&READER_CONFIG_RESPONSE).await
            }
            SetupSubcommand::MaxMinPrices => {
                let max = u16::from_be_bytes([data[0], data[1]]);
                let min = u16::from_be_bytes([data[2], data[3]]);
                debug!("vmc price range {}..{}", min, max);
                self.bus.send_ack().await
            }
        }
    }

    async fn handle_vend(&mut self, cmd_byte: u8) -> Result<(), MdbError> {
        let sub = self.bus.recv_symbol_timeout().await?.byte;
        let Some(subcommand) = VendSubcommand::n(sub) else {
            return self.handle_unknown_sub(cmd_byte, sub).await;
        };
        let mut buf = [0u8; FRAME_BUF];
        let Some(data) = self
            .read_checked(&[cmd_byte, sub], &mut buf, subcommand.data_len())
            .await?
        else {
            return Ok(());
        };
        match subcommand {
            VendSubcommand::Request => {
                let price = u16::from_be_bytes([data[0], data[1]]);
                let item = u16::from_be_bytes([data[2], data[3]]);
                if self.state.on_vend_request(price, item) {
                    info!("vend requested: item {} at {}", item, price);
                } else {
                    warn!("vend request outside a session");
                }
            }
            VendSubcommand::Cancel => {
                info!("vend cancelled by vmc");
                self.state.on_vend_cancel();
            }
            VendSubcommand::Success => {
                let item = u16::from_be_bytes([data[0], data[1]]);
                if !self.state.on_vend_success(item) {
                    warn!("vend success report outside a session");
                }
            }
            VendSubcommand::Failure => {
                warn!("vmc reported vend failure");
                if !self.state.on_vend_failure() {
                    warn!("vend failure report outside a session");
                }
            }
            VendSubcommand::SessionComplete => {
                if !self.state.on_session_complete() {
                    warn!("session complete outside a session");
                }
            }
            VendSubcommand::CashSale => {
                let price = u16::from_be_bytes([data[0], data[1]]);
                let item = u16::from_be_bytes([data[2], data[3]]);
                if self
                    .cash_sales
                    .try_send(CashSale { price, item })
                    .is_err()
                    && !self.cash_overflow_logged
                {
                    //Drop the newest; the consumer is clearly not keeping up
                    warn!("cash sale queue full, dropping records");
                    self.cash_overflow_logged = true;
                }
            }
        }
        self.bus.send_ack().await
    }

    async fn handle_reader(&mut self, cmd_byte: u8) -> Result<(), MdbError> {
        let sub = self.bus.recv_symbol_timeout().await?.byte;
        let Some(subcommand) = ReaderSubcommand::n(sub) else {
            return self.handle_unknown_sub(cmd_byte, sub).await;
        };
        let mut buf = [0u8; FRAME_BUF];
        if self
            .read_checked(&[cmd_byte, sub], &mut buf, 0)
            .await?
            .is_none()
        {
            return Ok(());
        }
        match subcommand {
            ReaderSubcommand::Disable => {
                info!("reader disabled by vmc");
                self.state.on_reader_disable();
                self.bus.send_ack().await
            }
            ReaderSubcommand::Enable => {
                info!("reader enabled by vmc");
                self.state.on_reader_enable();
                self.bus.send_ack().await
            }
            ReaderSubcommand::Cancel => {
                info!("session abort requested by vmc");
                self.state.request_cancel();
                self.bus.send_block(&[REPLY_CANCELLED]).await
            }
        }
    }

    async fn handle_expansion(&mut self, cmd_byte: u8) -> Result<(), MdbError> {
        let sub = self.bus.recv_symbol_timeout().await?.byte;
        let Some(ExpansionSubcommand::RequestId) = ExpansionSubcommand::n(sub) else {
            return self.handle_unknown_sub(cmd_byte, sub).await;
        };
        let mut buf = [0u8; FRAME_BUF];
        //29 bytes of VMC identity we have no use for, but the block still
        //has to verify
        if self
            .read_checked(&[cmd_byte, sub], &mut buf, 29)
            .await?
            .is_none()
        {
            return Ok(());
        }
        self.bus.send_block(&PERIPHERAL_ID_RESPONSE).await
    }

    /// A command we do not implement, addressed to us. Let the frame finish,
    /// then judge it on its checksum alone: a well-formed probe for an
    /// optional feature gets an ACK, garbage gets a NAK.
    async fn handle_unknown(&mut self, cmd_byte: u8) -> Result<(), MdbError> {
        let mut buf = [0u8; FRAME_BUF];
        let count = self.bus.drain_frame(&mut buf).await;
        let Some(received) = count.checked_sub(1).map(|n| buf[n]) else {
            return Err(MdbError::Timeout);
        };
        let expected = checksum(&[cmd_byte]).wrapping_add(checksum(&buf[..count - 1]));
        if expected == received {
            debug!("unimplemented command {:#04x} acknowledged", cmd_byte);
            self.bus.send_ack().await
        } else {
            self.bus.send_nak().await
        }
    }

    async fn handle_unknown_sub(&mut self, cmd_byte: u8, sub: u8) -> Result<(), MdbError> {
        let mut buf = [0u8; FRAME_BUF];
        let count = self.bus.drain_frame(&mut buf).await;
        let Some(received) = count.checked_sub(1).map(|n| buf[n]) else {
            return Err(MdbError::Timeout);
        };
        let expected = checksum(&[cmd_byte, sub]).wrapping_add(checksum(&buf[..count - 1]));
        if expected == received {
            debug!(
                "unimplemented subcommand {:#04x}/{:#04x} acknowledged",
                cmd_byte, sub
            );
            self.bus.send_ack().await
        } else {
            self.bus.send_nak().await
        }
    }
}
