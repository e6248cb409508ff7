//! Small demo exercising a single branch: joins a network, prints
//! lifecycle events as they arrive, and echoes received broadcasts. Not
//! a general-purpose CLI — argument/config-file parsing is out of scope
//! for this crate — just enough to see two instances of this binary
//! discover each other on a LAN.
//!
//! ```text
//! yogi-demo <branch-name> [network-name] [password]
//! ```

use anyhow::{Context, Result};
use tracing::info;
use yogi_branch::{ALL_EVENTS, BranchConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = yogi_branch::logging::init_logging(1, None);

    let mut args = std::env::args().skip(1);
    let name = args
        .next()
        .context("usage: yogi-demo <branch-name> [network-name] [password]")?;
    let network_name = args.next().unwrap_or_else(|| "yogi-demo".to_string());
    let password = args.next().unwrap_or_default();

    let config = BranchConfig {
        name: name.clone(),
        network_name,
        password,
        ..Default::default()
    };

    let branch = yogi_branch::Branch::new(config).await?;
    info!("branch [{}] \"{}\" is up", branch.uuid(), name);

    loop {
        match branch.await_event(ALL_EVENTS).await {
            Ok(event) => {
                info!(
                    "event {:?} for [{}]: {:?} {}",
                    event.kind, event.uuid, event.result, event.json
                );
            }
            Err(e) => {
                info!("await_event failed: {e}");
                break;
            }
        }
    }

    Ok(())
}
