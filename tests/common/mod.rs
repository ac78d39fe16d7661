//! Shared helpers for building synthetic Gadget files on disk.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use sphrast::io::gadget::Endian;
use sphrast::GadgetHeader;

pub fn u32_bytes(v: u32, e: Endian) -> [u8; 4] {
    let mut b = [0u8; 4];
    e.write_u32(&mut b, v);
    b
}

pub fn f32_payload(vals: &[f32], e: Endian) -> Vec<u8> {
    let mut out = Vec::with_capacity(vals.len() * 4);
    for &v in vals {
        let mut b = [0u8; 4];
        e.write_f32(&mut b, v);
        out.extend_from_slice(&b);
    }
    out
}

pub fn i32_payload(vals: &[i32], e: Endian) -> Vec<u8> {
    let mut out = Vec::with_capacity(vals.len() * 4);
    for &v in vals {
        let mut b = [0u8; 4];
        e.write_i32(&mut b, v);
        out.extend_from_slice(&b);
    }
    out
}

/// Append one format 2 record: name record, then the marked payload.
pub fn push_record2(buf: &mut Vec<u8>, name: &str, payload: &[u8], e: Endian) {
    assert_eq!(name.len(), 4);
    buf.extend_from_slice(&u32_bytes(8, e));
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(&u32_bytes(payload.len() as u32 + 8, e));
    buf.extend_from_slice(&u32_bytes(8, e));
    buf.extend_from_slice(&u32_bytes(payload.len() as u32, e));
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&u32_bytes(payload.len() as u32, e));
}

/// Append one legacy (format 1) record: just the marked payload.
pub fn push_record1(buf: &mut Vec<u8>, payload: &[u8], e: Endian) {
    buf.extend_from_slice(&u32_bytes(payload.len() as u32, e));
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&u32_bytes(payload.len() as u32, e));
}

pub fn header_payload(header: &GadgetHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(&header.serialize());
    out.extend_from_slice(&header.padding);
    out
}

/// Write a complete format 2 file: HEAD plus the given named payloads.
pub fn write_gadget2(
    path: &Path,
    header: &GadgetHeader,
    blocks: &[(&str, Vec<u8>)],
) -> PathBuf {
    let e = header.endian;
    let mut buf = Vec::new();
    push_record2(&mut buf, "HEAD", &header_payload(header), e);
    for (name, payload) in blocks {
        push_record2(&mut buf, name, payload, e);
    }
    fs::write(path, buf).unwrap();
    path.to_path_buf()
}

/// Write a complete legacy file: HEAD plus payloads in list order.
pub fn write_gadget1(path: &Path, header: &GadgetHeader, blocks: &[Vec<u8>]) -> PathBuf {
    let e = header.endian;
    let mut buf = Vec::new();
    push_record1(&mut buf, &header_payload(header), e);
    for payload in blocks {
        push_record1(&mut buf, payload, e);
    }
    fs::write(path, buf).unwrap();
    path.to_path_buf()
}
