#![forbid(unsafe_code)]

pub mod arena;
pub mod error;

mod fsm;
mod keymap;
mod treap;

pub use crate::arena::{
    Arena, ArenaMetrics, ArenaMetricsSnapshot, ArenaOptions, RecordKey, HEADER_LEN, KEY_LEN,
    RECORD_OVERHEAD,
};
pub use crate::error::{Result, TalusError};
