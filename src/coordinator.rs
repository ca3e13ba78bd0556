//! The transaction coordinator.
//!
//! One card tap, one vend, one debit - stitched together across the reader,
//! the backend and the VMC's half of the protocol. The coordinator never
//! touches the bus; it talks to the VMC entirely through the shared state
//! record, raising pending responses and watching the machine state move as
//! the engine consumes them.
//!
//! The money rule: the backend is confirmed exactly when the debit succeeded
//! *and* the VMC reported a successful dispense. Every other way out of a
//! debited session attempts a rollback and logs what it could not undo.

use embassy_time::{Duration, Instant, Timer};

use crate::backend::{Backend, BackendError};
use crate::config::Config;
use crate::reader::CardReader;
use crate::state::{CashlessState, DeviceState};

const CARD_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Let the card settle in the field before talking to it.
const CARD_SETTLE_DELAY: Duration = Duration::from_millis(100);
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(10);

const BALANCE_ATTEMPTS: u32 = 3;
const BALANCE_RETRY_DELAY: Duration = Duration::from_millis(500);

const ENABLED_TIMEOUT: Duration = Duration::from_secs(5);
const VEND_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DISPENSE_TIMEOUT: Duration = Duration::from_secs(10);

/// How a wait for a machine state ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum WaitOutcome {
    Reached,
    Timeout,
    /// The cancellation flag went up (RESET, or a VMC session abort).
    Cancelled,
    /// The card left the field while we still needed it.
    CardRemoved,
    /// The machine fell back to `Inactive` under us.
    Deactivated,
}

pub struct Coordinator<'a, R: CardReader, B: Backend> {
    state: &'a CashlessState,
    reader: R,
    backend: B,
    config: &'a Config,
}

impl<'a, R: CardReader, B: Backend> Coordinator<'a, R, B> {
    pub fn new(state: &'a CashlessState, reader: R, backend: B, config: &'a Config) -> Self {
        Self {
            state,
            reader,
            backend,
            config,
        }
    }

    /// Service loop: one card transaction at a time. A second card presented
    /// while one is in flight is simply not looked at until we are back here.
    pub async fn run(&mut self) -> ! {
        info!("transaction coordinator running");
        loop {
            while !self.reader.is_card_present().await {
                Timer::after(CARD_POLL_INTERVAL).await;
            }
            Timer::after(CARD_SETTLE_DELAY).await;
            //A cancellation latched while we sat idle belongs to no
            //transaction; this card starts fresh
            self.state.clear_cancel();

            match self.reader.read().await {
                Ok(card) => {
                    let uid = card.uid.to_hex();
                    info!("card presented, uid {}", uid.as_str());
                    self.run_session(uid.as_str()).await;
                }
                Err(e) => {
                    error!("card read failed: {:?}", e);
                }
            }
            self.finish().await;
        }
    }

    /// Everything between a readable card and the session teardown.
    async fn run_session(&mut self, uid: &str) {
        let Some(balance) = self.fetch_balance(uid).await else {
            error!("could not read a balance, ignoring card");
            return;
        };
        self.state.set_balance(balance);

        //The VMC has to have us enabled before a session can open
        match self
            .await_state(DeviceState::Enabled, ENABLED_TIMEOUT, true)
            .await
        {
            WaitOutcome::Reached => {}
            WaitOutcome::CardRemoved => {
                self.state.raise_session_cancel();
                return;
            }
            outcome => {
                warn!("machine not ready for a session: {:?}", outcome);
                return;
            }
        }
        self.state.begin_session();

        //Now the user picks an item and the VMC asks us to pay for it
        match self
            .await_state(DeviceState::Vend, VEND_REQUEST_TIMEOUT, true)
            .await
        {
            WaitOutcome::Reached => {}
            WaitOutcome::Cancelled | WaitOutcome::Deactivated => return,
            WaitOutcome::CardRemoved | WaitOutcome::Timeout => {
                //Ask the VMC to wind the session down
                self.state.raise_session_cancel();
                return;
            }
        }

        let (price, item) = self.state.vend_item();
        let transaction = match self
            .backend
            .make_purchase(uid, price, item, self.config.machine_id)
            .await
        {
            Ok(id) => {
                info!("debit accepted, transaction {}", id);
                if self.state.raise_vend_approved() {
                    Some(id)
                } else {
                    //The vend request evaporated while we were debiting
                    warn!("vend gone before approval, reversing debit");
                    self.rollback(Some(id)).await;
                    return;
                }
            }
            Err(e) => {
                warn!("debit refused: {:?}", e);
                self.state.raise_vend_denied();
                None
            }
        };

        //Wait for the machine to actually drop the item and say so
        match self
            .await_state(DeviceState::Idle, DISPENSE_TIMEOUT, false)
            .await
        {
            WaitOutcome::Reached => {}
            WaitOutcome::Cancelled | WaitOutcome::Deactivated => {
                self.rollback(transaction).await;
                return;
            }
            outcome => {
                warn!("no dispense outcome: {:?}", outcome);
                self.rollback(transaction).await;
                self.state.raise_session_end();
                return;
            }
        }

        if self.state.take_vend_success() {
            if let Some(id) = transaction {
                match self.backend.confirm_purchase(id).await {
                    Ok(()) => info!("transaction {} confirmed", id),
                    //The debit stands server-side; flag it for settlement
                    Err(e) => error!("confirm of transaction {} failed: {:?}", id, e),
                }
            }
        } else {
            self.rollback(transaction).await;
        }
        self.state.raise_session_end();
    }

    async fn fetch_balance(&mut self, uid: &str) -> Option<i32> {
        for attempt in 1..=BALANCE_ATTEMPTS {
            match self.backend.get_balance(uid).await {
                Ok(balance) => {
                    info!("balance received: {}", balance);
                    return Some(balance);
                }
                Err(e) => {
                    warn!(
                        "balance fetch failed ({}/{}): {:?}",
                        attempt, BALANCE_ATTEMPTS, e
                    );
                }
            }
            if attempt < BALANCE_ATTEMPTS {
                Timer::after(BALANCE_RETRY_DELAY).await;
            }
        }
        None
    }

    async fn rollback(&mut self, transaction: Option<i64>) {
        let Some(id) = transaction else { return };
        match self.backend.rollback_purchase(id).await {
            Ok(()) => info!("transaction {} rolled back", id),
            Err(BackendError::Unsupported) => {
                warn!("transaction {} debited but not vended, no reversal available", id)
            }
            Err(e) => error!("rollback of transaction {} failed: {:?}", id, e),
        }
    }

    /// Poll the shared record until `target` is reached. Honours the global
    /// cancellation flag at every tick; optionally requires the card to stay
    /// in the field.
    async fn await_state(
        &mut self,
        target: DeviceState,
        timeout: Duration,
        card_required: bool,
    ) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state.cancel_requested() {
                return WaitOutcome::Cancelled;
            }
            let current = self.state.state();
            if current == target {
                return WaitOutcome::Reached;
            }
            if current == DeviceState::Inactive {
                return WaitOutcome::Deactivated;
            }
            if card_required && !self.reader.is_card_present().await {
                return WaitOutcome::CardRemoved;
            }
            if Instant::now() >= deadline {
                return WaitOutcome::Timeout;
            }
            Timer::after(STATE_POLL_INTERVAL).await;
        }
    }

    /// Session teardown: forget the transaction, shut the card down, wait
    /// for it to leave, and only then accept the next one.
    async fn finish(&mut self) {
        self.state.clear_transaction();
        self.reader.end_card().await;
        while self.reader.is_card_present().await && !self.state.cancel_requested() {
            Timer::after(STATE_POLL_INTERVAL).await;
        }
        self.state.clear_cancel();
    }
}
