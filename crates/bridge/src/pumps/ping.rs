//! Link keepalive.
//!
//! Pings carry a sequence number so a helper trace can be matched against
//! ours. When the write pump is gone the link is torn down right away
//! instead of waiting for the read deadline.

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::constants::WS_PING_PERIOD;
use crate::link::RouteMap;

pub(crate) async fn ping_pump(
    write_tx: mpsc::Sender<tungstenite::Message>,
    routes: RouteMap,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + WS_PING_PERIOD, WS_PING_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        seq += 1;
        let ping = tungstenite::Message::Ping(seq.to_be_bytes().to_vec().into());
        if write_tx.send(ping).await.is_err() {
            let devices = routes.lock().await.len();
            warn!(seq, devices, "link writer gone, closing protocol helper link");
            // The read pump exits on cancel and reports the loss to every device.
            cancel.cancel();
            return;
        }
        trace!(seq, "ping sent");
    }
}
