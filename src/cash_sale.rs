//! Cash-sale bookkeeping.
//!
//! The VMC reports coin purchases over the bus so they end up in the same
//! ledger as card purchases. The protocol engine must answer the next POLL
//! within milliseconds, so it only drops the record into a bounded queue;
//! this consumer forwards it to the backend at its leisure. There is no
//! rollback path - the money is already in the coin mech - so failures are
//! logged and the record is discarded.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};

use crate::backend::Backend;
use crate::config::Config;

pub const QUEUE_DEPTH: usize = 10;

/// One VMC-reported coin purchase.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CashSale {
    /// Price paid, in cents.
    pub price: u16,
    pub item: u16,
}

pub type CashSaleQueue = Channel<CriticalSectionRawMutex, CashSale, QUEUE_DEPTH>;
pub type CashSaleSender<'a> = Sender<'a, CriticalSectionRawMutex, CashSale, QUEUE_DEPTH>;
pub type CashSaleReceiver<'a> = Receiver<'a, CriticalSectionRawMutex, CashSale, QUEUE_DEPTH>;

pub struct CashSaleForwarder<'a, B: Backend> {
    queue: CashSaleReceiver<'a>,
    backend: B,
    config: &'a Config,
}

impl<'a, B: Backend> CashSaleForwarder<'a, B> {
    pub fn new(queue: CashSaleReceiver<'a>, backend: B, config: &'a Config) -> Self {
        Self {
            queue,
            backend,
            config,
        }
    }

    /// Service loop: drain the queue into the backend.
    pub async fn run(&mut self) -> ! {
        loop {
            let sale = self.queue.receive().await;
            info!("cash sale: item {} price {}", sale.item, sale.price);
            if let Err(e) = self
                .backend
                .make_cash_purchase(sale.price, sale.item, self.config.machine_id)
                .await
            {
                warn!("cash sale not recorded: {:?}", e);
            }
        }
    }
}
