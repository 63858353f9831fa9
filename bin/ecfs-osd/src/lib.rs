//! ecfs OSD - storage node request orchestration
//!
//! An OSD stores the blocks of erasure-coded segments and runs the
//! segment protocols against its peers:
//! - Upload: stage, verify, encode, place and commit a segment
//! - Block sub-protocol: receive blocks for storage or for a download
//! - Download: coalesced reads with degraded-read reconstruction
//! - Repair: regenerate failed blocks onto replacement nodes
//!
//! Transport, metadata service and monitor are reached through the traits
//! in [`client`].

pub mod block;
pub mod client;
pub mod download;
pub mod osd;
pub mod repair;
pub mod stats;
pub mod upload;

pub use client::{MetadataClient, MonitorClient, PeerClient};
pub use download::SegmentReply;
pub use osd::Osd;
pub use stats::{OsdStats, OsdStatsSnapshot};
pub use upload::UploadRequest;
