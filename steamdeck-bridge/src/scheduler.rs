//! Periodic telemetry publication
//!
//! Each tick asks the bridge actor to sample and publish, and waits for the
//! answer before arming the next one, so ticks never overlap; a tick that
//! comes due while the previous one is still running is skipped.

use crate::bridge::BridgeHandle;
use crate::config::MIN_PUBLISH_INTERVAL_SECS;
use crate::error::BridgeError;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

pub struct TelemetryScheduler {
    interval_tx: watch::Sender<Duration>,
    task: JoinHandle<()>,
}

fn clamp(period: Duration) -> Duration {
    period.max(Duration::from_secs(MIN_PUBLISH_INTERVAL_SECS))
}

impl TelemetryScheduler {
    /// Start ticking. The first tick fires right away.
    pub fn spawn(handle: BridgeHandle, period: Duration) -> Self {
        let (interval_tx, interval_rx) = watch::channel(clamp(period));
        let task = tokio::spawn(run(handle, interval_rx));
        Self { interval_tx, task }
    }

    pub fn period(&self) -> Duration {
        *self.interval_tx.borrow()
    }

    /// Cancel the pending tick and reschedule with the new period
    pub fn set_period(&self, period: Duration) {
        let period = clamp(period);
        if self.period() != period {
            info!("Telemetry interval changed to {:?}", period);
            self.interval_tx.send_replace(period);
        }
    }

    /// Stop ticking. Does not wait for the task: a tick in flight is
    /// waiting on the actor that is calling this.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for TelemetryScheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(handle: BridgeHandle, mut interval_rx: watch::Receiver<Duration>) {
    let mut ticker = interval(*interval_rx.borrow_and_update());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match handle.tick().await {
                    Ok(published) => debug!("Scheduled publish sent {} messages", published),
                    Err(BridgeError::ActorGone) => break,
                    Err(e) => debug!("Scheduled publish failed: {}", e),
                }
            }
            changed = interval_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let period = *interval_rx.borrow_and_update();
                ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            }
        }
    }
    debug!("Telemetry scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Command;
    use tokio::sync::{mpsc, oneshot};

    type TickReply = oneshot::Sender<crate::error::Result<usize>>;

    async fn next_tick(rx: &mut mpsc::UnboundedReceiver<Command>) -> TickReply {
        match rx.recv().await {
            Some(Command::Tick { reply }) => reply,
            Some(_) => panic!("scheduler sent something other than a tick"),
            None => panic!("scheduler stopped"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_period() {
        let (handle, mut rx) = BridgeHandle::detached();
        let start = Instant::now();
        let scheduler = TelemetryScheduler::spawn(handle, Duration::from_secs(10));

        next_tick(&mut rx).await.send(Ok(0)).unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        next_tick(&mut rx).await.send(Ok(0)).unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(10));

        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_period_reschedules() {
        let (handle, mut rx) = BridgeHandle::detached();
        let start = Instant::now();
        let scheduler = TelemetryScheduler::spawn(handle, Duration::from_secs(10));
        next_tick(&mut rx).await.send(Ok(0)).unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        scheduler.set_period(Duration::from_secs(30));
        assert_eq!(scheduler.period(), Duration::from_secs(30));

        // the pending 10 s tick is dropped; the next one is 30 s after the change
        next_tick(&mut rx).await.send(Ok(0)).unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(32));

        next_tick(&mut rx).await.send(Ok(0)).unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(62));

        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_period_is_clamped() {
        let (handle, _rx) = BridgeHandle::detached();
        let scheduler = TelemetryScheduler::spawn(handle, Duration::from_secs(1));
        assert_eq!(scheduler.period(), Duration::from_secs(MIN_PUBLISH_INTERVAL_SECS));

        scheduler.set_period(Duration::ZERO);
        assert_eq!(scheduler.period(), Duration::from_secs(MIN_PUBLISH_INTERVAL_SECS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tick_is_not_overlapped() {
        let (handle, mut rx) = BridgeHandle::detached();
        let start = Instant::now();
        let scheduler = TelemetryScheduler::spawn(handle, Duration::from_secs(5));

        // hold the first tick across two periods
        let reply = next_tick(&mut rx).await;
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(rx.try_recv().is_err());
        reply.send(Ok(0)).unwrap();

        // one catch-up tick right away, then back on the 5 s grid
        next_tick(&mut rx).await.send(Ok(0)).unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(12));
        next_tick(&mut rx).await.send(Ok(0)).unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(15));

        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_ticking() {
        let (handle, mut rx) = BridgeHandle::detached();
        let scheduler = TelemetryScheduler::spawn(handle, Duration::from_secs(5));
        next_tick(&mut rx).await.send(Ok(0)).unwrap();

        scheduler.shutdown();
        // the task held the last sender
        assert!(rx.recv().await.is_none());
    }
}
