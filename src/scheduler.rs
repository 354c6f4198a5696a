//! Retransmission timers.
//!
//! Each timer waits on a condition variable for at most `tick * timeout_ticks`. An ACK arriving
//! within that bound resolves the timer's [`AckFuture`] to `true`. Otherwise the packet's retry
//! counter is incremented, the timeout callback runs once with the new count, and the future
//! resolves to `false`. Retransmitting is left to the caller; there is no retry limit and no
//! backoff.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time;

use super::error::{Error, Result};

/// Identifies the packet a timer is waiting on.
pub type PacketId = u32;

/// Configuration for a [`Scheduler`] object.
#[derive(Clone, Debug)]
pub struct Config {
    /// Duration of one tick.
    ///
    /// Minimum value: 1 ms \
    /// Default value: 100 ms
    pub tick: time::Duration,

    /// Number of ticks to wait for an ACK.
    ///
    /// Minimum value: 1 \
    /// Default value: 5
    pub timeout_ticks: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick: super::CLOCK_TICK_DEFAULT,
            timeout_ticks: super::ACK_TIMEOUT_TICKS_DEFAULT,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.tick < time::Duration::from_millis(1) {
            return Err(Error::Configuration("scheduler tick must be at least 1 ms"));
        }
        if self.timeout_ticks == 0 {
            return Err(Error::Configuration("scheduler timeout must be at least one tick"));
        }

        Ok(())
    }

    pub fn timeout(&self) -> time::Duration {
        self.tick * self.timeout_ticks
    }
}

#[derive(Default)]
struct AckTable {
    // Packet id -> acknowledged, for each timer in flight
    acked: HashMap<PacketId, bool>,
    // Packet id -> timeouts so far
    retries: HashMap<PacketId, u32>,
    // Set while stop_all_timers is draining
    stopping: bool,
}

struct SchedulerCore {
    config: Config,
    table: Mutex<AckTable>,
    changed: Condvar,
}

/// Resolves once a retransmission timer completes: `true` if the packet was acknowledged,
/// `false` if it timed out or its record was discarded.
#[derive(Debug)]
pub struct AckFuture {
    id: PacketId,
    rx: mpsc::Receiver<bool>,
}

impl AckFuture {
    pub fn id(&self) -> PacketId {
        self.id
    }

    /// Blocks until the timer completes.
    pub fn wait(self) -> bool {
        self.rx.recv().unwrap_or(false)
    }

    /// Returns `None` if the timer has not completed within `timeout`.
    pub fn wait_timeout(&self, timeout: time::Duration) -> Option<bool> {
        match self.rx.recv_timeout(timeout) {
            Ok(acked) => Some(acked),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(false),
        }
    }
}

pub struct Scheduler {
    core: Arc<SchedulerCore>,
    // Timer threads not yet joined
    timers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl SchedulerCore {
    fn lock(&self) -> MutexGuard<'_, AckTable> {
        self.table.lock().unwrap()
    }

    fn wait<F>(&self, id: PacketId, on_timeout: F) -> bool
    where
        F: FnOnce(u32),
    {
        let table = self.lock();

        let (mut table, _) = self
            .changed
            .wait_timeout_while(table, self.config.timeout(), |table| {
                !table.stopping && table.acked.get(&id) == Some(&false)
            })
            .unwrap();

        match table.acked.get(&id).copied() {
            Some(true) => {
                table.acked.remove(&id);
                true
            }
            Some(false) if !table.stopping => {
                table.acked.remove(&id);

                let retries = table.retries.entry(id).or_insert(0);
                *retries += 1;
                let retries = *retries;

                drop(table);

                log::debug!("packet {}: ack timeout (retry {})", id, retries);
                on_timeout(retries);

                false
            }
            Some(false) => {
                table.acked.remove(&id);
                false
            }
            // Record cleared while waiting
            None => false,
        }
    }
}

impl Scheduler {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            core: Arc::new(SchedulerCore {
                config,
                table: Default::default(),
                changed: Condvar::new(),
            }),
            timers: Mutex::new(Vec::new()),
        })
    }

    fn reap_timers(&self) {
        let mut timers = self.timers.lock().unwrap();

        let (finished, active): (Vec<_>, Vec<_>) = std::mem::take(&mut *timers)
            .into_iter()
            .partition(|handle| handle.is_finished());

        *timers = active;

        for handle in finished {
            let _ = handle.join();
        }
    }

    /// Starts waiting for an ACK of packet `id`. If none arrives within the configured timeout,
    /// `on_timeout` is called once with the packet's updated retry count.
    pub fn start_retransmission_timer<F>(&self, id: PacketId, on_timeout: F) -> Result<AckFuture>
    where
        F: FnOnce(u32) + Send + 'static,
    {
        self.reap_timers();

        {
            let mut table = self.core.lock();
            table.acked.insert(id, false);
            table.retries.entry(id).or_insert(0);
        }

        let (tx, rx) = mpsc::channel();
        let core = Arc::clone(&self.core);

        let handle = thread::Builder::new()
            .name(format!("vbus-timer-{id}"))
            .spawn(move || {
                let acked = core.wait(id, on_timeout);
                let _ = tx.send(acked);
            });

        match handle {
            Ok(handle) => {
                self.timers.lock().unwrap().push(handle);
                Ok(AckFuture { id, rx })
            }
            Err(err) => {
                self.core.lock().acked.remove(&id);
                Err(Error::Spawn(err))
            }
        }
    }

    /// Marks packet `id` acknowledged and wakes its timer. Returns false if no timer is waiting
    /// on it.
    pub fn receive_ack(&self, id: PacketId) -> bool {
        let mut table = self.core.lock();

        match table.acked.get_mut(&id) {
            Some(acked) => {
                *acked = true;
                self.core.changed.notify_all();
                true
            }
            None => false,
        }
    }

    /// Discards every record of packet `id`. A timer still waiting on it resolves to `false`
    /// without running its callback.
    pub fn clear_packet_data(&self, id: PacketId) {
        let mut table = self.core.lock();

        table.acked.remove(&id);
        table.retries.remove(&id);

        self.core.changed.notify_all();
    }

    /// Wakes every timer, resolving pending futures to `false`, and joins their threads.
    pub fn stop_all_timers(&self) {
        self.core.lock().stopping = true;
        self.core.changed.notify_all();

        let timers = std::mem::take(&mut *self.timers.lock().unwrap());

        for handle in timers {
            let _ = handle.join();
        }

        self.core.lock().stopping = false;
    }

    /// Number of timeouts recorded for packet `id`.
    pub fn retry_count(&self, id: PacketId) -> u32 {
        self.core.lock().retries.get(&id).copied().unwrap_or(0)
    }

    /// Number of timers waiting for an ACK.
    pub fn pending_count(&self) -> usize {
        self.core.lock().acked.len()
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_all_timers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    fn scheduler() -> Scheduler {
        Scheduler::new(Config {
            tick: time::Duration::from_millis(10),
            timeout_ticks: 5,
        })
        .unwrap()
    }

    #[test]
    fn invalid_config() {
        let result = Scheduler::new(Config {
            timeout_ticks: 0,
            ..Default::default()
        });

        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn ack_before_timeout() {
        let scheduler = scheduler();
        let calls = Arc::new(AtomicU32::new(0));

        let future = {
            let calls = Arc::clone(&calls);
            scheduler
                .start_retransmission_timer(7, move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        };

        assert_eq!(scheduler.pending_count(), 1);
        assert!(scheduler.receive_ack(7));

        assert!(future.wait());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.retry_count(7), 0);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn timeout_counts_retries() {
        let scheduler = scheduler();

        for expected in 1..=2 {
            let (tx, rx) = mpsc::channel();
            let begin = time::Instant::now();

            let future = scheduler
                .start_retransmission_timer(3, move |retries| tx.send(retries).unwrap())
                .unwrap();

            assert!(!future.wait());
            assert!(begin.elapsed() >= scheduler.config().timeout());

            assert_eq!(rx.try_recv().unwrap(), expected);
            assert!(rx.try_recv().is_err());
            assert_eq!(scheduler.retry_count(3), expected);
        }

        // Late ACK has nothing to resolve
        assert!(!scheduler.receive_ack(3));

        scheduler.clear_packet_data(3);
        assert_eq!(scheduler.retry_count(3), 0);
    }

    #[test]
    fn clear_resolves_without_callback() {
        let scheduler = scheduler();
        let calls = Arc::new(AtomicU32::new(0));

        let future = {
            let calls = Arc::clone(&calls);
            scheduler
                .start_retransmission_timer(11, move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        };

        scheduler.clear_packet_data(11);

        assert_eq!(
            future.wait_timeout(time::Duration::from_secs(1)),
            Some(false)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_joins_every_timer() {
        let scheduler = Scheduler::new(Config {
            tick: time::Duration::from_secs(1),
            timeout_ticks: 60,
        })
        .unwrap();

        let futures: Vec<_> = (0..4)
            .map(|id| scheduler.start_retransmission_timer(id, |_| {}).unwrap())
            .collect();

        let begin = time::Instant::now();
        scheduler.stop_all_timers();
        assert!(begin.elapsed() < time::Duration::from_secs(5));

        for future in futures {
            assert!(!future.wait());
        }

        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(scheduler.retry_count(0), 0);
    }
}
