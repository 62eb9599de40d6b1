use std::sync::Arc;

use tokio::time::{MissedTickBehavior, interval};
use tracing::info;

use crate::{NodeContext, events::Notice, registry::Device};

/// Demotes paired devices that stopped broadcasting.
pub(crate) struct TimeoutMonitor {
    ctx: Arc<NodeContext>,
}

impl TimeoutMonitor {
    pub(crate) fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub(crate) async fn run(self) {
        let mut ticker = interval(self.ctx.config.timeout_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep();
        }
    }

    pub(crate) fn sweep(&self) -> Vec<Device> {
        let demoted = self
            .ctx
            .registry
            .demote_stale(self.ctx.config.liveness_timeout);
        for device in &demoted {
            info!(address = %device.address, name = %device.display_name, "device timed out");
            self.ctx.events.notice(Notice::DeviceDisconnected {
                address: device.address,
                name: device.display_name.clone(),
            });
        }
        demoted
    }
}
