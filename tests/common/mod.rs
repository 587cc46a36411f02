#![allow(dead_code)]

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const ORDER_UPDATE_86: &[u8] = include_bytes!("../fixtures/order_update_86.bin");
pub const ORDER_EXECUTION_1398: &[u8] = include_bytes!("../fixtures/order_execution_1398.bin");

pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

/// Ethernet II + IPv4 (no options) + transport header around `payload`.
pub fn packet(protocol: u8, payload: &[u8]) -> Vec<u8> {
    let mut p = Vec::with_capacity(42 + payload.len());
    p.extend_from_slice(&[0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]);
    p.extend_from_slice(&[0x02, 0x42, 0xac, 0x11, 0x00, 0x02]);
    p.extend_from_slice(&0x0800u16.to_be_bytes());

    let transport_len = if protocol == IP_PROTO_TCP { 20 } else { 8 };
    let total = (20 + transport_len + payload.len()) as u16;
    let mut ip = [0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&total.to_be_bytes());
    ip[8] = 32;
    ip[9] = protocol;
    ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
    ip[16..20].copy_from_slice(&[239, 195, 1, 1]);
    p.extend_from_slice(&ip);

    if protocol == IP_PROTO_UDP {
        p.extend_from_slice(&20081u16.to_be_bytes());
        p.extend_from_slice(&20081u16.to_be_bytes());
        p.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        p.extend_from_slice(&[0, 0]);
    } else {
        p.extend_from_slice(&[0u8; 20][..transport_len]);
    }
    p.extend_from_slice(payload);
    p
}

pub fn udp(payload: &[u8]) -> Vec<u8> {
    packet(IP_PROTO_UDP, payload)
}

/// Microsecond little-endian capture file with Ethernet link type.
pub fn write_pcap(path: &Path, packets: &[Vec<u8>]) {
    let mut w = BufWriter::new(File::create(path).unwrap());
    w.write_all(&0xa1b2_c3d4u32.to_le_bytes()).unwrap();
    w.write_all(&2u16.to_le_bytes()).unwrap();
    w.write_all(&4u16.to_le_bytes()).unwrap();
    w.write_all(&0i32.to_le_bytes()).unwrap();
    w.write_all(&0u32.to_le_bytes()).unwrap();
    w.write_all(&65535u32.to_le_bytes()).unwrap();
    w.write_all(&1u32.to_le_bytes()).unwrap();
    for (i, p) in packets.iter().enumerate() {
        w.write_all(&(1_696_917_600 + i as u32).to_le_bytes()).unwrap();
        w.write_all(&(i as u32 * 10).to_le_bytes()).unwrap();
        w.write_all(&(p.len() as u32).to_le_bytes()).unwrap();
        w.write_all(&(p.len() as u32).to_le_bytes()).unwrap();
        w.write_all(p).unwrap();
    }
    w.flush().unwrap();
}

/// Envelope (no incremental header) around raw message bytes.
pub fn datagram(sequence_number: u32, flags: u16, body: &[u8]) -> Vec<u8> {
    let size = (16 + body.len()) as u16;
    let mut out = Vec::new();
    out.extend_from_slice(&sequence_number.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&1_696_917_600_000_000_000u64.to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// One snapshot message: frame, 16-byte root block, group, 57-byte entries.
pub fn snapshot_message(security_id: i32, rpt_seq: u32, entries: &[(i64, i64, i64, u8)]) -> Vec<u8> {
    let mut m = Vec::new();
    for v in [16u16, 17, 19780, 4] {
        m.extend_from_slice(&v.to_le_bytes());
    }
    m.extend_from_slice(&security_id.to_le_bytes());
    m.extend_from_slice(&0u32.to_le_bytes());
    m.extend_from_slice(&rpt_seq.to_le_bytes());
    m.extend_from_slice(&6902u32.to_le_bytes());
    m.extend_from_slice(&57u16.to_le_bytes());
    m.push(entries.len() as u8);
    for &(order_id, price, volume, side) in entries {
        m.extend_from_slice(&order_id.to_le_bytes());
        m.extend_from_slice(&0u64.to_le_bytes());
        m.extend_from_slice(&price.to_le_bytes());
        m.extend_from_slice(&volume.to_le_bytes());
        m.extend_from_slice(&0i64.to_le_bytes());
        m.extend_from_slice(&0u64.to_le_bytes());
        m.extend_from_slice(&0u64.to_le_bytes());
        m.push(side);
    }
    m
}
