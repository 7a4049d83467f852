//! Internet reachability probe

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Default probe target: a public DNS resolver
pub const DEFAULT_PROBE_ADDRESS: &str = "1.1.1.1:53";

/// Try a TCP connect to `address`, giving up after `limit`
///
/// Never fails: any error or timeout simply reports the network as down.
pub async fn check_internet_reachability(address: &str, limit: Duration) -> bool {
    match timeout(limit, TcpStream::connect(address)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Reachability probe to {} failed: {}", address, e);
            false
        }
        Err(_) => {
            debug!("Reachability probe to {} timed out after {:?}", address, limit);
            false
        }
    }
}
