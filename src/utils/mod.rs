pub mod time_utils;

pub use time_utils::{format_timestamp, in_period, parse_iso};
