//! Policy refresh and hot swap.
//!
//! Control flow: the [`PolicyFetcher`] pulls the policy envelope from the
//! controller and emits the block list on a bounded channel; the update loop
//! is the single consumer that compiles each list into a fresh matcher and
//! publishes it atomically. No update is ever merged: every message is a
//! full replacement, so updates apply in the order they were fetched.

mod fetcher;
mod types;

pub use fetcher::{
    DohModeCallback, OperationalMode, PolicyFetcher, TlsUpdateCallback, CONFIG_HASH_ENV,
    FETCH_TIMEOUT, OPERATIONAL_MODE_ENV,
};
pub use types::{ControllerResponse, DnsPolicy, PolicySpec, PolicyStatus, TlsData};

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::matcher::DomainMatcher;
use crate::server::DnsHandler;

/// Capacity of the update channel. Producers block when it fills, which is
/// acceptable backpressure on policy updates.
pub const UPDATE_CHANNEL_CAPACITY: usize = 10;

/// Consume block-list updates and publish rebuilt matchers.
///
/// Runs until the sending side is dropped.
pub async fn run_update_loop(mut updates: mpsc::Receiver<Vec<String>>, handler: Arc<DnsHandler>) {
    while let Some(block_list) = updates.recv().await {
        info!(entries = block_list.len(), "received block list update");
        let matcher = DomainMatcher::from_rules(&block_list);
        handler.update_matcher(matcher);
    }
}
