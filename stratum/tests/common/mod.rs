#![allow(dead_code)]

use stratum::btree::ColType;
use stratum::engine::{IndexCol, IndexDef};

/// Fixed test row layout: a 4-byte little-endian id followed by a
/// 12-byte zero-padded name.
pub const RECORD_SIZE: usize = 16;

pub fn row(id: i32, name: &str) -> Vec<u8> {
    assert!(name.len() <= 12);
    let mut buf = Vec::with_capacity(RECORD_SIZE);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf.resize(RECORD_SIZE, 0);
    buf
}

pub fn row_id(record: &[u8]) -> i32 {
    i32::from_le_bytes(record[..4].try_into().unwrap())
}

pub fn row_name(record: &[u8]) -> String {
    let bytes: Vec<u8> = record[4..16].iter().copied().take_while(|&b| b != 0).collect();
    String::from_utf8(bytes).unwrap()
}

/// An index over the id column, with an optional small order for
/// split/merge tests.
pub fn id_index(name: &str, order: Option<usize>) -> IndexDef {
    IndexDef {
        name: name.to_string(),
        cols: vec![IndexCol {
            col_type: ColType::Int,
            len: 4,
            offset: 0,
        }],
        order,
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
