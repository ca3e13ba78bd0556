#![allow(dead_code)]

//! Shared test plumbing: an in-memory 9-bit bus and a VMC-side driver for
//! scripting literal byte exchanges against the engine.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use embedded_io_async::{ErrorType, Read, Write};
use tokio::sync::mpsc;

use mdb_cashless::backend::{Backend, BackendError};
use mdb_cashless::config::Config;
use mdb_cashless::protocol::checksum;
use mdb_cashless::reader::{Card, CardReader, ReaderError, Uid};

pub static TEST_CONFIG: Config = Config {
    machine_id: "vend-01",
    api_base_url: "http://10.0.0.2:8080",
    api_key: "secret",
    mdns_hostname: "backend",
    syslog_host: "10.0.0.3",
    syslog_port: 5140,
    wifi_ssid: "machines",
    wifi_password: "machines",
    ota_manifest_url: "http://10.0.0.2:8080/ota.json",
};

/// The UID used throughout: `0486A5DA826180`.
pub const CARD_UID: [u8; 7] = [0x04, 0x86, 0xA5, 0xDA, 0x82, 0x61, 0x80];

const RECV_TIMEOUT: Duration = Duration::from_millis(200);

/// The peripheral's end of the wire. One MDB symbol = two bytes on the
/// stream: mode bit, then data.
pub struct TestUart {
    rx: mpsc::UnboundedReceiver<u8>,
    tx: mpsc::UnboundedSender<u8>,
}

/// The VMC's end of the wire.
pub struct Vmc {
    tx: mpsc::UnboundedSender<u8>,
    rx: mpsc::UnboundedReceiver<u8>,
}

pub fn bus_pair() -> (TestUart, Vmc) {
    let (vmc_tx, uart_rx) = mpsc::unbounded_channel();
    let (uart_tx, vmc_rx) = mpsc::unbounded_channel();
    (
        TestUart {
            rx: uart_rx,
            tx: uart_tx,
        },
        Vmc {
            tx: vmc_tx,
            rx: vmc_rx,
        },
    )
}

impl ErrorType for TestUart {
    type Error = Infallible;
}

impl Read for TestUart {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        match self.rx.recv().await {
            Some(byte) => {
                buf[0] = byte;
                Ok(1)
            }
            //Script finished; the line is idle from here on
            None => std::future::pending().await,
        }
    }
}

impl Write for TestUart {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        for byte in buf {
            let _ = self.tx.send(*byte);
        }
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Response {
    Ack,
    Nak,
    Block(Vec<u8>),
}

impl Vmc {
    /// Send a master frame: address byte with the mode bit, data plain,
    /// then the correct block checksum.
    pub fn send_frame(&self, bytes: &[u8]) {
        self.send_frame_with_checksum(bytes, checksum(bytes));
    }

    /// Same, but with a caller-chosen (possibly wrong) checksum.
    pub fn send_frame_with_checksum(&self, bytes: &[u8], chk: u8) {
        for (i, byte) in bytes.iter().enumerate() {
            let mode = u8::from(i == 0);
            self.send_symbol(mode, *byte);
        }
        self.send_symbol(0, chk);
    }

    pub fn send_symbol(&self, mode: u8, byte: u8) {
        self.tx.send(mode).unwrap();
        self.tx.send(byte).unwrap();
    }

    pub async fn recv_symbol(&mut self) -> Option<(bool, u8)> {
        let mode = tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .ok()??;
        let byte = tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .ok()??;
        Some((mode != 0, byte))
    }

    /// Receive one complete peripheral response. Every data symbol up to the
    /// terminating mode symbol belongs to the block; the block checksum is
    /// verified here so no test can miss a corrupt reply.
    pub async fn recv_response(&mut self) -> Response {
        let mut data = Vec::new();
        loop {
            let (mode, byte) = self.recv_symbol().await.expect("response timed out");
            data.push(byte);
            if mode {
                break;
            }
        }
        if data.len() == 1 {
            return match data[0] {
                0x00 => Response::Ack,
                0xFF => Response::Nak,
                byte => panic!("unexpected single-byte response {byte:#04x}"),
            };
        }
        let chk = data.pop().unwrap();
        assert_eq!(chk, checksum(&data), "response block checksum is wrong");
        Response::Block(data)
    }

    /// Assert the peripheral stays quiet (mis-addressed frames and the
    /// like must produce no traffic).
    pub async fn expect_silence(&mut self) {
        assert!(
            tokio::time::timeout(Duration::from_millis(50), self.rx.recv())
                .await
                .is_err(),
            "unexpected bus traffic"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Balance(String),
    Purchase {
        uid: String,
        amount: u16,
        product: u16,
        machine_id: String,
    },
    CashPurchase {
        amount: u16,
        product: u16,
    },
    Confirm(i64),
    Rollback(i64),
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

/// Scripted backend: canned answers, every call recorded.
pub struct MockBackend {
    calls: CallLog,
    balance: Result<i32, BackendError>,
    purchase: Result<i64, BackendError>,
    rollback: Result<(), BackendError>,
}

impl MockBackend {
    pub fn new(
        balance: Result<i32, BackendError>,
        purchase: Result<i64, BackendError>,
        rollback: Result<(), BackendError>,
    ) -> (Self, CallLog) {
        let calls = CallLog::default();
        (
            Self {
                calls: calls.clone(),
                balance,
                purchase,
                rollback,
            },
            calls,
        )
    }
}

impl Backend for MockBackend {
    async fn get_balance(&mut self, uid: &str) -> Result<i32, BackendError> {
        self.calls.lock().unwrap().push(Call::Balance(uid.into()));
        self.balance
    }

    async fn make_purchase(
        &mut self,
        uid: &str,
        amount: u16,
        product: u16,
        machine_id: &str,
    ) -> Result<i64, BackendError> {
        self.calls.lock().unwrap().push(Call::Purchase {
            uid: uid.into(),
            amount,
            product,
            machine_id: machine_id.into(),
        });
        self.purchase
    }

    async fn make_cash_purchase(
        &mut self,
        amount: u16,
        product: u16,
        _machine_id: &str,
    ) -> Result<(), BackendError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::CashPurchase { amount, product });
        Ok(())
    }

    async fn confirm_purchase(&mut self, transaction_id: i64) -> Result<(), BackendError> {
        self.calls.lock().unwrap().push(Call::Confirm(transaction_id));
        Ok(())
    }

    async fn rollback_purchase(&mut self, transaction_id: i64) -> Result<(), BackendError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Rollback(transaction_id));
        self.rollback
    }
}

/// A card that appears and disappears under test control.
pub struct MockReader {
    pub present: Arc<AtomicBool>,
    pub uid: &'static [u8],
}

impl CardReader for MockReader {
    async fn is_card_present(&mut self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    async fn read(&mut self) -> Result<Card, ReaderError> {
        Ok(Card {
            uid: Uid::new(self.uid)?,
            sak: 0x20,
        })
    }

    async fn end_card(&mut self) {}
}
