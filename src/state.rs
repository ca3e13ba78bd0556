//! Peripheral state machine and POLL response arbitration.
//!
//! The protocol engine and the transaction coordinator share one record: the
//! machine state, the pending one-shot POLL responses and the current
//! transaction context. The record lives behind a fast blocking mutex and is
//! only ever held for a few field accesses, never across an await point, so
//! the engine's 5 ms response deadline is safe from the coordinator's side.
//!
//! Pending responses are edges, not state: each is raised once, consumed by
//! exactly one POLL reply, and dropped if the machine has meanwhile left a
//! state in which emitting it would be lawful.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Instant, Timer};

use crate::protocol::{
    REPLY_BEGIN_SESSION, REPLY_END_SESSION, REPLY_JUST_RESET, REPLY_OUT_OF_SEQUENCE,
    REPLY_SESSION_CANCEL_REQUEST, REPLY_VEND_APPROVED, REPLY_VEND_DENIED,
};

/// Forced recovery if the VMC stops polling us.
const POLL_SILENCE_LIMIT: Duration = Duration::from_secs(10);
/// Forced recovery if we sit in a transient state without progress.
const STUCK_STATE_LIMIT: Duration = Duration::from_secs(30);
/// Nudge the VMC if it configures us but never enables us.
const DISABLED_LIMIT: Duration = Duration::from_secs(60);

const WATCHDOG_TICK: Duration = Duration::from_secs(1);

/// The five MDB slave states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    Inactive,
    Disabled,
    Enabled,
    Idle,
    Vend,
}

/// A response picked for one POLL. At most one is emitted per POLL, in the
/// priority order of [`CashlessState::take_poll_response`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PollResponse {
    OutOfSequence,
    JustReset,
    VendApproved { amount: u16 },
    VendDenied,
    SessionEnd,
    SessionBegin { funds: u16 },
    SessionCancel,
}

impl PollResponse {
    /// Encode into `buf`, returning the used prefix. The checksum is the
    /// bus layer's business.
    pub fn encode<'a>(&self, buf: &'a mut [u8; 3]) -> &'a [u8] {
        match self {
            PollResponse::OutOfSequence => {
                buf[0] = REPLY_OUT_OF_SEQUENCE;
                &buf[..1]
            }
            PollResponse::JustReset => {
                buf[0] = REPLY_JUST_RESET;
                &buf[..1]
            }
            PollResponse::VendApproved { amount } => {
                buf[0] = REPLY_VEND_APPROVED;
                buf[1..3].copy_from_slice(&amount.to_be_bytes());
                &buf[..3]
            }
            PollResponse::VendDenied => {
                buf[0] = REPLY_VEND_DENIED;
                &buf[..1]
            }
            PollResponse::SessionEnd => {
                buf[0] = REPLY_END_SESSION;
                &buf[..1]
            }
            PollResponse::SessionBegin { funds } => {
                buf[0] = REPLY_BEGIN_SESSION;
                buf[1..3].copy_from_slice(&funds.to_be_bytes());
                &buf[..3]
            }
            PollResponse::SessionCancel => {
                buf[0] = REPLY_SESSION_CANCEL_REQUEST;
                &buf[..1]
            }
        }
    }
}

#[derive(Default)]
struct Pending {
    out_of_sequence: bool,
    just_reset: bool,
    vend_approved: bool,
    vend_denied: bool,
    session_end: bool,
    session_begin: bool,
    session_cancel: bool,
}

impl Pending {
    const fn none() -> Self {
        Self {
            out_of_sequence: false,
            just_reset: false,
            vend_approved: false,
            vend_denied: false,
            session_end: false,
            session_begin: false,
            session_cancel: false,
        }
    }
}

struct Inner {
    state: DeviceState,
    pending: Pending,
    item_price: u16,
    item_number: u16,
    user_balance: i32,
    funds_available: u16,
    vend_success: bool,
    last_poll: Instant,
    last_state_change: Instant,
}

impl Inner {
    fn set_state(&mut self, state: DeviceState) {
        if self.state != state {
            self.state = state;
            self.last_state_change = Instant::now();
        }
    }
}

/// The shared record. Designed to live in a `static`.
pub struct CashlessState {
    inner: Mutex<CriticalSectionRawMutex, RefCell<Inner>>,
    cancel: AtomicBool,
}

impl CashlessState {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                state: DeviceState::Inactive,
                pending: Pending::none(),
                item_price: 0,
                item_number: 0,
                user_balance: -1,
                funds_available: 0,
                vend_success: false,
                last_poll: Instant::from_ticks(0),
                last_state_change: Instant::from_ticks(0),
            })),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.inner.lock(|inner| inner.borrow().state)
    }

    // --- protocol engine side -------------------------------------------

    /// RESET: unconditionally back to `Inactive`, every pending response
    /// dropped, Just Reset queued for the next POLL. The coordinator is told
    /// to abandon whatever it was doing.
    pub fn on_reset(&self) {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let previous = inner.state;
            inner.set_state(DeviceState::Inactive);
            inner.pending = Pending::none();
            inner.pending.just_reset = true;
            if previous == DeviceState::Vend {
                warn!("reset received mid vend");
            } else {
                info!("reset received, was {:?}", previous);
            }
        });
        self.request_cancel();
    }

    pub fn on_setup_config(&self) {
        self.inner.lock(|inner| {
            inner.borrow_mut().set_state(DeviceState::Disabled);
        });
    }

    pub fn on_reader_enable(&self) {
        self.inner.lock(|inner| {
            inner.borrow_mut().set_state(DeviceState::Enabled);
        });
    }

    pub fn on_reader_disable(&self) {
        self.inner.lock(|inner| {
            inner.borrow_mut().set_state(DeviceState::Disabled);
        });
    }

    /// VEND REQUEST. Lawful only during an open session; anything else gets
    /// Command Out Of Sequence on the next POLL.
    pub fn on_vend_request(&self, price: u16, item: u16) -> bool {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            if inner.state != DeviceState::Idle {
                inner.pending.out_of_sequence = true;
                return false;
            }
            inner.item_price = price;
            inner.item_number = item;
            inner.set_state(DeviceState::Vend);
            true
        })
    }

    /// VEND CANCEL: the VMC withdraws a vend request before our verdict.
    /// Answered by Vend Denied on the next POLL.
    pub fn on_vend_cancel(&self) {
        self.inner.lock(|inner| {
            inner.borrow_mut().pending.vend_denied = true;
        });
    }

    pub fn on_vend_success(&self, item: u16) -> bool {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            match inner.state {
                DeviceState::Vend | DeviceState::Idle => {
                    debug!("vend success for item {}", item);
                    inner.vend_success = true;
                    inner.set_state(DeviceState::Idle);
                    true
                }
                _ => {
                    inner.pending.out_of_sequence = true;
                    false
                }
            }
        })
    }

    pub fn on_vend_failure(&self) -> bool {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            match inner.state {
                DeviceState::Vend | DeviceState::Idle => {
                    inner.vend_success = false;
                    inner.set_state(DeviceState::Idle);
                    true
                }
                _ => {
                    inner.pending.out_of_sequence = true;
                    false
                }
            }
        })
    }

    pub fn on_session_complete(&self) -> bool {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            match inner.state {
                DeviceState::Idle | DeviceState::Vend => {
                    inner.pending.session_end = true;
                    true
                }
                _ => {
                    inner.pending.out_of_sequence = true;
                    false
                }
            }
        })
    }

    /// Pick at most one pending response for this POLL and perform the state
    /// transition its transmission implies. Responses whose window has closed
    /// (the machine left the state they belong to) are dropped here.
    pub fn take_poll_response(&self) -> Option<PollResponse> {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            inner.last_poll = Instant::now();

            if inner.pending.out_of_sequence {
                inner.pending.out_of_sequence = false;
                return Some(PollResponse::OutOfSequence);
            }
            if inner.pending.just_reset {
                inner.pending.just_reset = false;
                return Some(PollResponse::JustReset);
            }
            if inner.pending.vend_approved {
                inner.pending.vend_approved = false;
                if inner.state == DeviceState::Vend {
                    return Some(PollResponse::VendApproved {
                        amount: inner.item_price,
                    });
                }
                warn!("dropped stale vend approval");
            }
            if inner.pending.vend_denied {
                inner.pending.vend_denied = false;
                if inner.state == DeviceState::Vend {
                    inner.set_state(DeviceState::Idle);
                    return Some(PollResponse::VendDenied);
                }
                warn!("dropped stale vend denial");
            }
            if inner.pending.session_end {
                inner.pending.session_end = false;
                if matches!(inner.state, DeviceState::Idle | DeviceState::Vend) {
                    inner.set_state(DeviceState::Enabled);
                    return Some(PollResponse::SessionEnd);
                }
                warn!("dropped stale session end");
            }
            if inner.pending.session_begin {
                inner.pending.session_begin = false;
                if inner.state == DeviceState::Enabled {
                    inner.set_state(DeviceState::Idle);
                    return Some(PollResponse::SessionBegin {
                        funds: inner.funds_available,
                    });
                }
                warn!("dropped session begin, reader no longer enabled");
            }
            if inner.pending.session_cancel {
                inner.pending.session_cancel = false;
                return Some(PollResponse::SessionCancel);
            }
            None
        })
    }

    // --- coordinator side -----------------------------------------------

    /// Record the balance read from the backend. The funds reported at
    /// session begin are the real balance clamped into the reportable range;
    /// 0xFFFF stays reserved as the "unknown" sentinel.
    pub fn set_balance(&self, balance: i32) {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            inner.user_balance = balance;
            inner.funds_available = balance.clamp(0, 0xFFFE) as u16;
        });
    }

    /// Queue Begin Session for the next POLL. Emitted once the reader is in
    /// `Enabled`; dropped if the VMC disables us first.
    pub fn begin_session(&self) {
        self.inner.lock(|inner| {
            inner.borrow_mut().pending.session_begin = true;
        });
    }

    /// Queue Vend Approved. Only lawful while the vend request is actually
    /// outstanding; returns whether it was queued.
    pub fn raise_vend_approved(&self) -> bool {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            if inner.state != DeviceState::Vend {
                return false;
            }
            inner.pending.vend_approved = true;
            true
        })
    }

    pub fn raise_vend_denied(&self) {
        self.inner.lock(|inner| {
            inner.borrow_mut().pending.vend_denied = true;
        });
    }

    pub fn raise_session_end(&self) {
        self.inner.lock(|inner| {
            inner.borrow_mut().pending.session_end = true;
        });
    }

    pub fn raise_session_cancel(&self) {
        self.inner.lock(|inner| {
            inner.borrow_mut().pending.session_cancel = true;
        });
    }

    /// Price and item of the outstanding vend request.
    pub fn vend_item(&self) -> (u16, u16) {
        self.inner
            .lock(|inner| {
                let inner = inner.borrow();
                (inner.item_price, inner.item_number)
            })
    }

    /// The VMC's dispense verdict for this session. Reading clears it.
    pub fn take_vend_success(&self) -> bool {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let success = inner.vend_success;
            inner.vend_success = false;
            success
        })
    }

    /// Forget the transaction context at session teardown.
    pub fn clear_transaction(&self) {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            inner.item_price = 0;
            inner.item_number = 0;
            inner.user_balance = -1;
            inner.funds_available = 0;
            inner.vend_success = false;
        });
    }

    // --- cancellation ----------------------------------------------------

    /// Ask the coordinator to abandon the transaction in progress. Checked
    /// at every wait point; cleared by the coordinator once back at rest.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn clear_cancel(&self) {
        self.cancel.store(false, Ordering::Release);
    }

    // --- watchdog ---------------------------------------------------------

    /// Recovery service: forces the state machine back to a point the VMC
    /// knows how to re-initialize from when the bus stalls.
    pub async fn run_watchdog(&self) -> ! {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let now = Instant::now();
            inner.last_poll = now;
            inner.last_state_change = now;
        });
        loop {
            Timer::after(WATCHDOG_TICK).await;
            self.watchdog_check(Instant::now());
        }
    }

    /// One watchdog evaluation. `now` must not precede the timestamps the
    /// record has seen.
    pub fn watchdog_check(&self, now: Instant) {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();

            if now - inner.last_poll > POLL_SILENCE_LIMIT {
                error!("no poll for 10s, forcing reset");
                inner.set_state(DeviceState::Inactive);
                inner.pending = Pending::none();
                inner.pending.just_reset = true;
                //Re-arm so a dead bus does not retrigger every tick
                inner.last_poll = now;
                return;
            }

            match inner.state {
                DeviceState::Enabled => {}
                DeviceState::Disabled => {
                    if now - inner.last_state_change > DISABLED_LIMIT {
                        error!("disabled for 60s, requesting reinitialization");
                        inner.pending.out_of_sequence = true;
                        inner.last_state_change = now;
                    }
                }
                _ => {
                    if now - inner.last_state_change > STUCK_STATE_LIMIT {
                        error!("stuck in {:?} for 30s, forcing reset", inner.state);
                        inner.set_state(DeviceState::Inactive);
                        inner.pending = Pending::none();
                        inner.pending.just_reset = true;
                    }
                }
            }
        });
    }
}

impl Default for CashlessState {
    fn default() -> Self {
        Self::new()
    }
}
