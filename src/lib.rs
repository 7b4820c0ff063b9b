pub mod board;
pub mod config;
pub mod fetch;
pub mod normalize;
pub mod output;
pub mod parser;
pub mod reconcile;
pub mod schedule;
pub mod source;
pub mod stats;
pub mod time;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
