//! Low level register descriptions and polled driver for the ENC28J60 SPI Ethernet controller
#![no_std]
pub mod driver;
pub mod registers;
#[cfg(test)]
mod test_utils;

pub use driver::{Enc28j60, Error, PeriodicTimer};
