//! The account backend seam.
//!
//! Balances live server side; the peripheral only ever asks, debits,
//! confirms. The HTTP transport is the firmware's business - an
//! implementation POSTs the request records below as JSON to the endpoint
//! paths, with the API key header on every call.

use serde::{Deserialize, Serialize};

pub const BALANCE_PATH: &str = "/getBalance";
pub const PURCHASE_PATH: &str = "/makePurchase";
pub const CASH_PURCHASE_PATH: &str = "/makeCashPurchase";
pub const CONFIRM_PATH: &str = "/confirmPurchase";

pub const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BackendError {
    /// No connectivity, DNS failure, timed out.
    Network,
    /// The service answered with an unexpected HTTP status.
    Status(u16),
    /// The response body did not parse.
    Protocol,
    /// The operation is not offered by this backend.
    Unsupported,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct BalanceRequest<'a> {
    pub uid: &'a str,
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct BalanceResponse {
    pub balance: i32,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct PurchaseRequest<'a> {
    pub uid: &'a str,
    pub amount: u16,
    pub product: u16,
    pub machine_id: &'a str,
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct PurchaseResponse {
    pub transaction_id: i64,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct CashPurchaseRequest<'a> {
    pub amount: u16,
    pub product: u16,
    pub machine_id: &'a str,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct ConfirmRequest {
    pub transaction_id: i64,
}

pub trait Backend {
    /// `POST /getBalance`. 200 with a balance is success, anything else is
    /// a failure.
    async fn get_balance(&mut self, uid: &str) -> Result<i32, BackendError>;

    /// `POST /makePurchase`: debit the account. Success hands back the
    /// transaction id needed to confirm the purchase later.
    async fn make_purchase(
        &mut self,
        uid: &str,
        amount: u16,
        product: u16,
        machine_id: &str,
    ) -> Result<i64, BackendError>;

    /// `POST /makeCashPurchase`: bookkeeping for a sale the coin mech
    /// already collected. 201 is success.
    async fn make_cash_purchase(
        &mut self,
        amount: u16,
        product: u16,
        machine_id: &str,
    ) -> Result<(), BackendError>;

    /// `POST /confirmPurchase`: finalize a debit after the item dropped.
    async fn confirm_purchase(&mut self, transaction_id: i64) -> Result<(), BackendError>;

    /// Reverse a debit whose vend never happened. The service exposes no
    /// such endpoint today, so the default declines and the caller logs the
    /// discrepancy for manual settlement.
    async fn rollback_purchase(&mut self, transaction_id: i64) -> Result<(), BackendError> {
        let _ = transaction_id;
        Err(BackendError::Unsupported)
    }
}
