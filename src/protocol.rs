//! Wire layout of the market-data protocol.
//!
//! All structures are little-endian and tightly packed. Each one is decoded
//! field by field from a bounds-checked window of the datagram, so the Rust
//! layout of these types never has to match the wire.
//!
//! Prices are signed fixed-point integers with five decimals; the maximum
//! `i64` is the protocol's "no value" marker.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Reserved "no value" for nullable 64-bit integer fields.
pub const NULL_VALUE: i64 = i64::MAX;

/// Raw prices are scaled by 10^5.
pub const PRICE_SCALE: f64 = 100_000.0;

/// Convert a raw fixed-point price for display. The null marker becomes NaN.
pub fn normalize_price(raw: i64) -> f64 {
    if raw == NULL_VALUE {
        f64::NAN
    } else {
        raw as f64 / PRICE_SCALE
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Window of exactly `size` bytes at `offset`, or a truncation error.
    fn at(buf: &'a [u8], offset: usize, size: usize, what: &'static str) -> Result<Self, DecodeError> {
        let window = offset
            .checked_add(size)
            .and_then(|end| buf.get(offset..end))
            .ok_or(DecodeError::Truncated {
                what,
                offset,
                needed: size,
                available: buf.len().saturating_sub(offset),
            })?;
        Ok(Self { buf: window, pos: 0 })
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        let [b] = self.take::<1>();
        b
    }
    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }
    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }
    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }
    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }
    fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.take())
    }
}

/// Header opening every datagram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sequence_number: u32,
    /// Bytes of the whole envelope, headers included.
    pub message_size: u16,
    pub message_flags: u16,
    /// Nanoseconds since the Unix epoch.
    pub sending_time: u64,
}

impl Envelope {
    pub const SIZE: usize = 16;

    pub const LAST_FRAGMENT: u16 = 0x1;
    pub const START_OF_SNAPSHOT: u16 = 0x2;
    pub const END_OF_SNAPSHOT: u16 = 0x4;
    pub const INCREMENTAL: u16 = 0x8;
    pub const POSS_DUP: u16 = 0x10;

    pub fn decode(buf: &[u8], offset: usize) -> Result<Self, DecodeError> {
        let mut c = Cursor::at(buf, offset, Self::SIZE, "envelope")?;
        Ok(Self {
            sequence_number: c.u32(),
            message_size: c.u16(),
            message_flags: c.u16(),
            sending_time: c.u64(),
        })
    }

    /// An [`IncrementalHeader`] follows the envelope.
    pub fn is_incremental(&self) -> bool {
        self.message_flags & Self::INCREMENTAL != 0
    }

    pub fn is_last_fragment(&self) -> bool {
        self.message_flags & Self::LAST_FRAGMENT != 0
    }

    pub fn is_start_of_snapshot(&self) -> bool {
        self.message_flags & Self::START_OF_SNAPSHOT != 0
    }

    pub fn is_end_of_snapshot(&self) -> bool {
        self.message_flags & Self::END_OF_SNAPSHOT != 0
    }

    pub fn is_possible_duplicate(&self) -> bool {
        self.message_flags & Self::POSS_DUP != 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalHeader {
    pub transact_time: u64,
    pub exchange_session_id: u32,
}

impl IncrementalHeader {
    pub const SIZE: usize = 12;

    pub fn decode(buf: &[u8], offset: usize) -> Result<Self, DecodeError> {
        let mut c = Cursor::at(buf, offset, Self::SIZE, "incremental header")?;
        Ok(Self {
            transact_time: c.u64(),
            exchange_session_id: c.u32(),
        })
    }
}

/// Header in front of every message inside an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFrame {
    pub block_length: u16,
    pub template_id: u16,
    pub schema_id: u16,
    pub version: u16,
}

impl MessageFrame {
    pub const SIZE: usize = 8;

    pub fn decode(buf: &[u8], offset: usize) -> Result<Self, DecodeError> {
        let mut c = Cursor::at(buf, offset, Self::SIZE, "message frame")?;
        Ok(Self {
            block_length: c.u16(),
            template_id: c.u16(),
            schema_id: c.u16(),
            version: c.u16(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    OrderUpdate,
    OrderExecution,
    OrderBookSnapshot,
}

impl MessageKind {
    const TEMPLATES: [(u16, MessageKind); 3] = [
        (15, MessageKind::OrderUpdate),
        (16, MessageKind::OrderExecution),
        (17, MessageKind::OrderBookSnapshot),
    ];

    pub fn from_template_id(template_id: u16) -> Option<Self> {
        Self::TEMPLATES
            .iter()
            .find(|(id, _)| *id == template_id)
            .map(|(_, kind)| *kind)
    }

    pub fn template_id(self) -> u16 {
        match self {
            MessageKind::OrderUpdate => 15,
            MessageKind::OrderExecution => 16,
            MessageKind::OrderBookSnapshot => 17,
        }
    }
}

/// `MDUpdateAction` wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateAction {
    New,
    Update,
    Delete,
    Unknown(u8),
}

impl UpdateAction {
    pub fn from_wire(code: u8) -> Self {
        match code {
            0 => UpdateAction::New,
            1 => UpdateAction::Update,
            2 => UpdateAction::Delete,
            other => UpdateAction::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            UpdateAction::New => 0,
            UpdateAction::Update => 1,
            UpdateAction::Delete => 2,
            UpdateAction::Unknown(code) => code,
        }
    }
}

impl fmt::Display for UpdateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateAction::New => f.write_str("new"),
            UpdateAction::Update => f.write_str("update"),
            UpdateAction::Delete => f.write_str("delete"),
            UpdateAction::Unknown(code) => write!(f, "unknown({code})"),
        }
    }
}

/// `MDEntryType` wire codes (ASCII).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Offer,
    EmptyBook,
    Unknown(u8),
}

impl Side {
    pub fn from_wire(code: u8) -> Self {
        match code {
            b'0' => Side::Bid,
            b'1' => Side::Offer,
            b'J' => Side::EmptyBook,
            other => Side::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Side::Bid => b'0',
            Side::Offer => b'1',
            Side::EmptyBook => b'J',
            Side::Unknown(code) => code,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Bid => f.write_str("bid"),
            Side::Offer => f.write_str("offer"),
            Side::EmptyBook => f.write_str("empty"),
            Side::Unknown(code) => write!(f, "unknown({code:#04x})"),
        }
    }
}

/// Change to a resting order (template 15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: i64,
    pub order_price: i64,
    pub order_volume: i64,
    pub md_flags_set: u64,
    pub md_flags_set2: u64,
    pub security_id: i32,
    pub rpt_seq: u32,
    pub action: UpdateAction,
    pub side: Side,
}

impl OrderUpdate {
    pub const SIZE: usize = 50;

    pub fn decode(buf: &[u8], offset: usize) -> Result<Self, DecodeError> {
        let mut c = Cursor::at(buf, offset, Self::SIZE, "order update")?;
        Ok(Self {
            order_id: c.i64(),
            order_price: c.i64(),
            order_volume: c.i64(),
            md_flags_set: c.u64(),
            md_flags_set2: c.u64(),
            security_id: c.i32(),
            rpt_seq: c.u32(),
            action: UpdateAction::from_wire(c.u8()),
            side: Side::from_wire(c.u8()),
        })
    }

    pub fn price(&self) -> f64 {
        normalize_price(self.order_price)
    }
}

/// Trade against a resting order (template 16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderExecution {
    pub order_id: i64,
    pub order_price: i64,
    pub remaining_quantity: i64,
    pub trade_price: i64,
    pub trade_volume: i64,
    pub trader_id: i64,
    pub md_flags_set: u64,
    pub md_flags_set2: u64,
    pub security_id: i32,
    pub rpt_seq: u32,
    pub action: UpdateAction,
    pub side: Side,
}

impl OrderExecution {
    pub const SIZE: usize = 74;

    pub fn decode(buf: &[u8], offset: usize) -> Result<Self, DecodeError> {
        let mut c = Cursor::at(buf, offset, Self::SIZE, "order execution")?;
        Ok(Self {
            order_id: c.i64(),
            order_price: c.i64(),
            remaining_quantity: c.i64(),
            trade_price: c.i64(),
            trade_volume: c.i64(),
            trader_id: c.i64(),
            md_flags_set: c.u64(),
            md_flags_set2: c.u64(),
            security_id: c.i32(),
            rpt_seq: c.u32(),
            action: UpdateAction::from_wire(c.u8()),
            side: Side::from_wire(c.u8()),
        })
    }

    pub fn price(&self) -> f64 {
        normalize_price(self.order_price)
    }

    pub fn trade_price(&self) -> f64 {
        normalize_price(self.trade_price)
    }
}

/// Root block of an order book snapshot (template 17).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookSnapshotHeader {
    pub security_id: i32,
    pub last_msg_seq_num_processed: u32,
    pub rpt_seq: u32,
    pub exchange_trading_session_id: u32,
}

impl OrderBookSnapshotHeader {
    pub const SIZE: usize = 16;

    pub fn decode(buf: &[u8], offset: usize) -> Result<Self, DecodeError> {
        let mut c = Cursor::at(buf, offset, Self::SIZE, "order book snapshot header")?;
        Ok(Self {
            security_id: c.i32(),
            last_msg_seq_num_processed: c.u32(),
            rpt_seq: c.u32(),
            exchange_trading_session_id: c.u32(),
        })
    }
}

/// Repeating group descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSize {
    pub block_size: u16,
    pub num_in_group: u8,
}

impl GroupSize {
    pub const SIZE: usize = 3;

    pub fn decode(buf: &[u8], offset: usize) -> Result<Self, DecodeError> {
        let mut c = Cursor::at(buf, offset, Self::SIZE, "group size")?;
        Ok(Self {
            block_size: c.u16(),
            num_in_group: c.u8(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookEntry {
    pub order_id: i64,
    pub transact_time: u64,
    pub order_price: i64,
    pub order_volume: i64,
    pub trade_id: i64,
    pub md_flags_set: u64,
    pub md_flags_set2: u64,
    pub side: Side,
}

impl OrderBookEntry {
    pub const SIZE: usize = 57;

    pub fn decode(buf: &[u8], offset: usize) -> Result<Self, DecodeError> {
        let mut c = Cursor::at(buf, offset, Self::SIZE, "order book entry")?;
        Ok(Self {
            order_id: c.i64(),
            transact_time: c.u64(),
            order_price: c.i64(),
            order_volume: c.i64(),
            trade_id: c.i64(),
            md_flags_set: c.u64(),
            md_flags_set2: c.u64(),
            side: Side::from_wire(c.u8()),
        })
    }

    pub fn price(&self) -> f64 {
        normalize_price(self.order_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER_UPDATE_86: &[u8] = include_bytes!("../tests/fixtures/order_update_86.bin");

    #[test]
    fn envelope_and_incremental_header_from_fixture() {
        let env = Envelope::decode(ORDER_UPDATE_86, 0).unwrap();
        assert_eq!(env.sequence_number, 4091);
        assert_eq!(env.message_size, 86);
        assert!(env.is_incremental());
        assert!(env.is_last_fragment());
        assert!(!env.is_possible_duplicate());

        let inc = IncrementalHeader::decode(ORDER_UPDATE_86, Envelope::SIZE).unwrap();
        assert_eq!(inc.exchange_session_id, 6902);

        let frame = MessageFrame::decode(ORDER_UPDATE_86, 28).unwrap();
        assert_eq!(
            frame,
            MessageFrame { block_length: 50, template_id: 15, schema_id: 19780, version: 4 }
        );
    }

    #[test]
    fn order_update_fields_follow_wire_order() {
        let u = OrderUpdate::decode(ORDER_UPDATE_86, 36).unwrap();
        assert_eq!(u.order_id, 2024116201390623846);
        assert_eq!(u.order_price, 1356600);
        assert_eq!(u.order_volume, 1);
        assert_eq!(u.md_flags_set, 0x0020_1001);
        assert_eq!(u.md_flags_set2, 0);
        assert_eq!(u.security_id, 2634189);
        assert_eq!(u.rpt_seq, 19);
        assert_eq!(u.action, UpdateAction::Delete);
        assert_eq!(u.side, Side::Offer);
        assert!((u.price() - 13.566).abs() < 1e-12);
    }

    #[test]
    fn short_window_is_a_truncation_error() {
        let err = OrderUpdate::decode(ORDER_UPDATE_86, 40).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated { what: "order update", offset: 40, needed: 50, available: 46 }
        );
        let err = Envelope::decode(&[], 0).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { available: 0, .. }));
        assert!(GroupSize::decode(&[1, 0], usize::MAX).is_err());
    }

    #[test]
    fn null_price_is_nan() {
        assert!(normalize_price(NULL_VALUE).is_nan());
        assert_eq!(normalize_price(9_915_000_000), 99_150.0);
        assert_eq!(normalize_price(-150_000), -1.5);
        assert_eq!(normalize_price(0), 0.0);
    }

    #[test]
    fn wire_codes_are_explicit() {
        assert_eq!(UpdateAction::from_wire(0), UpdateAction::New);
        assert_eq!(UpdateAction::from_wire(1), UpdateAction::Update);
        assert_eq!(UpdateAction::from_wire(7), UpdateAction::Unknown(7));
        assert_eq!(UpdateAction::Delete.to_wire(), 2);
        assert_eq!(Side::from_wire(b'0'), Side::Bid);
        assert_eq!(Side::from_wire(b'J'), Side::EmptyBook);
        assert_eq!(Side::from_wire(0), Side::Unknown(0));
        assert_eq!(Side::Offer.to_wire(), 0x31);
    }

    #[test]
    fn template_lookup() {
        assert_eq!(MessageKind::from_template_id(15), Some(MessageKind::OrderUpdate));
        assert_eq!(MessageKind::from_template_id(16), Some(MessageKind::OrderExecution));
        assert_eq!(MessageKind::from_template_id(17), Some(MessageKind::OrderBookSnapshot));
        assert_eq!(MessageKind::from_template_id(18), None);
        assert_eq!(MessageKind::OrderBookSnapshot.template_id(), 17);
    }
}
