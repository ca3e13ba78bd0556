//! MDB cashless-device peripheral engine.
//!
//! This crate is the slave side of the MDB (Multi-Drop Bus) cashless reader
//! protocol: it answers a Vending Machine Controller as "Cashless Device #1"
//! (address `0x10`) and pays for vends out of RFID-backed accounts held by a
//! remote service.
//!
//! The crate is hardware-agnostic and `no_std`. It provides a set of
//! long-running async services which a firmware spawns as executor tasks:
//!
//! - [`peripheral::CashlessPeripheral`] - the protocol engine. Owns the bus,
//!   parses command frames, answers POLLs within the MDB deadline.
//! - [`coordinator::Coordinator`] - drives one card transaction end to end:
//!   balance fetch, vend authorization, dispense outcome, debit confirmation
//!   or rollback.
//! - [`cash_sale::CashSaleForwarder`] - reports VMC cash sales to the backend
//!   without ever blocking the protocol engine.
//! - [`state::CashlessState::run_watchdog`] - recovers the state machine from
//!   a hung VMC or bus dropout.
//!
//! The services communicate through a shared [`state::CashlessState`] record
//! and a bounded cash-sale queue, both designed to live in `static`s.
//!
//! Three collaborators are supplied by the integrating firmware: the 9-bit
//! UART (an [`embedded_io_async`] stream carrying one MDB symbol per
//! `[mode, data]` byte pair), a [`reader::CardReader`] for the RFID hardware,
//! and a [`backend::Backend`] for the HTTP account service.

#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]

// This mod MUST go first, so that the others see its macros.
mod fmt;

pub mod backend;
pub mod bus;
pub mod cash_sale;
pub mod config;
pub mod coordinator;
pub mod peripheral;
pub mod protocol;
pub mod reader;
pub mod state;
