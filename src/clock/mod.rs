//! Tick counter shared by every process on the bus.
//!
//! The clock lives in a named POSIX shared-memory segment. The process that creates the segment
//! initialises a process-shared mutex/condvar pair inside it and owns the ticker thread; every
//! other process attaches to the existing segment and only reads the counter or waits on it.
//!
//! The segment is unlinked by whichever handle detaches last, according to an attach counter
//! kept in the segment. A process that dies without detaching leaves the count too high, and a
//! process attaching while the last one detaches can find the segment gone; neither case is
//! detected.
//!
//! When the owning process detaches it stops the clock for everyone. Processes still attached
//! keep their mapping, but `wait_for_next_tick` returns [`Error::ClockStopped`] from then on;
//! no other process takes over the ticker.

mod shm;

use std::cell::UnsafeCell;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time;

use super::error::{Error, Result};

const MAGIC: u32 = 0x5642_434B;

// Attachers wait this long for the creator to initialise the segment
const INIT_WAIT: time::Duration = time::Duration::from_secs(1);
const INIT_POLL: time::Duration = time::Duration::from_millis(1);

/// Configuration for a [`GlobalClock`] object.
#[derive(Clone, Debug)]
pub struct Config {
    /// Name of the shared-memory segment. Must begin with `/` and contain no other `/`.
    ///
    /// Default value: /vbus_clock
    pub name: String,

    /// Interval between ticks. Only used by the creating process.
    ///
    /// Minimum value: 1 ms \
    /// Default value: 100 ms
    pub tick: time::Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: super::CLOCK_SEGMENT_NAME.into(),
            tick: super::CLOCK_TICK_DEFAULT,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        let valid_name = self.name.len() > 1
            && self.name.starts_with('/')
            && !self.name[1..].contains('/')
            && !self.name.contains('\0');

        if !valid_name {
            return Err(Error::Configuration(
                "clock segment name must be of the form /name",
            ));
        }
        if self.tick < time::Duration::from_millis(1) {
            return Err(Error::Configuration("clock tick must be at least 1 ms"));
        }

        Ok(())
    }
}

/// Layout of the shared segment. Zero-filled memory is a valid uninitialised state.
#[repr(C)]
struct SharedClock {
    // MAGIC once the creator has initialised mutex and cond
    magic: AtomicU32,
    // Handles attached across all processes
    attached: AtomicU32,
    running: AtomicBool,
    tick: AtomicU64,
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }

    Ok(())
}

struct SharedGuard<'a> {
    clock: &'a SharedClock,
}

impl SharedClock {
    /// Initialises the process-shared primitives. Called once, by the creator only.
    unsafe fn init(&self) -> io::Result<()> {
        let mut mutex_attr: libc::pthread_mutexattr_t = mem::zeroed();
        check(libc::pthread_mutexattr_init(&mut mutex_attr))?;
        check(libc::pthread_mutexattr_setpshared(
            &mut mutex_attr,
            libc::PTHREAD_PROCESS_SHARED,
        ))?;
        let rc = libc::pthread_mutex_init(self.mutex.get(), &mutex_attr);
        libc::pthread_mutexattr_destroy(&mut mutex_attr);
        check(rc)?;

        let mut cond_attr: libc::pthread_condattr_t = mem::zeroed();
        check(libc::pthread_condattr_init(&mut cond_attr))?;
        check(libc::pthread_condattr_setpshared(
            &mut cond_attr,
            libc::PTHREAD_PROCESS_SHARED,
        ))?;
        let rc = libc::pthread_cond_init(self.cond.get(), &cond_attr);
        libc::pthread_condattr_destroy(&mut cond_attr);
        check(rc)?;

        self.magic.store(MAGIC, Ordering::Release);

        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.magic.load(Ordering::Acquire) == MAGIC
    }

    fn lock(&self) -> io::Result<SharedGuard<'_>> {
        check(unsafe { libc::pthread_mutex_lock(self.mutex.get()) })?;

        Ok(SharedGuard { clock: self })
    }
}

impl SharedGuard<'_> {
    fn wait(&self) -> io::Result<()> {
        check(unsafe { libc::pthread_cond_wait(self.clock.cond.get(), self.clock.mutex.get()) })
    }

    fn broadcast(&self) {
        unsafe {
            libc::pthread_cond_broadcast(self.clock.cond.get());
        }
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.clock.mutex.get());
        }
    }
}

struct ClockCore {
    config: Config,
    segment: shm::Segment,
    // Wakes the local ticker early when stopping
    halt: Mutex<bool>,
    halted: Condvar,
}

impl ClockCore {
    fn shared(&self) -> &SharedClock {
        debug_assert!(self.segment.is_mapped());
        unsafe { &*(self.segment.as_ptr() as *const SharedClock) }
    }
}

fn tick_loop(core: Arc<ClockCore>) {
    let shared = core.shared();

    loop {
        {
            let halt = core.halt.lock().unwrap();

            let (halt, _) = core
                .halted
                .wait_timeout_while(halt, core.config.tick, |halt| !*halt)
                .unwrap();

            if *halt {
                break;
            }
        }

        let guard = match shared.lock() {
            Ok(guard) => guard,
            Err(err) => {
                log::error!("clock {}: {}", core.config.name, err);
                break;
            }
        };

        // Another process may have stopped the clock
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        let tick = shared.tick.fetch_add(1, Ordering::AcqRel) + 1;
        guard.broadcast();

        log::trace!("clock {}: tick {}", core.config.name, tick);
    }

    log::debug!("clock {}: ticker finished", core.config.name);
}

/// Handle to the shared tick counter.
pub struct GlobalClock {
    core: Arc<ClockCore>,
    // Local ticker, only ever present in the creating process
    ticker: Mutex<Option<thread::JoinHandle<()>>>,
    detached: bool,
}

impl GlobalClock {
    /// Creates the named segment, or attaches to it if another process already has.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let segment = match shm::Segment::open(&config.name, mem::size_of::<SharedClock>()) {
            Ok(segment) => segment,
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                return Err(Error::ClockUnavailable)
            }
            Err(err) => return Err(Error::Shm(err)),
        };

        let core = Arc::new(ClockCore {
            config,
            segment,
            halt: Mutex::new(false),
            halted: Condvar::new(),
        });

        let shared = core.shared();

        if core.segment.created() {
            if let Err(err) = unsafe { shared.init() } {
                let _ = shm::unlink(core.segment.name());
                return Err(Error::Shm(err));
            }

            log::info!("clock {}: created", core.config.name);
        } else {
            let begin = time::Instant::now();

            while !shared.is_initialized() {
                if begin.elapsed() >= INIT_WAIT {
                    return Err(Error::ClockUnavailable);
                }

                thread::sleep(INIT_POLL);
            }

            log::info!("clock {}: attached", core.config.name);
        }

        shared.attached.fetch_add(1, Ordering::AcqRel);

        Ok(Self {
            core,
            ticker: Mutex::new(None),
            detached: false,
        })
    }

    /// True if this handle created the segment and may drive the ticker.
    pub fn is_owner(&self) -> bool {
        self.core.segment.created()
    }

    /// Starts ticking. Only the creating process runs a ticker; elsewhere this does nothing.
    pub fn start_clock(&self) -> Result<()> {
        if !self.is_owner() {
            log::info!(
                "clock {}: ticker is run by the creating process",
                self.core.config.name
            );
            return Ok(());
        }

        let mut ticker = self.ticker.lock().unwrap();

        if ticker.is_some() {
            return Ok(());
        }

        {
            let _guard = self.core.shared().lock()?;
            self.core.shared().running.store(true, Ordering::Release);
        }

        *self.core.halt.lock().unwrap() = false;

        let core = Arc::clone(&self.core);

        let handle = thread::Builder::new()
            .name("vbus-clock".into())
            .spawn(move || tick_loop(core));

        match handle {
            Ok(handle) => {
                *ticker = Some(handle);
            }
            Err(err) => {
                self.core.shared().running.store(false, Ordering::Release);
                return Err(Error::Spawn(err));
            }
        }

        log::info!(
            "clock {}: started ({} ms per tick)",
            self.core.config.name,
            self.core.config.tick.as_millis()
        );

        Ok(())
    }

    /// Blocks until the tick counter advances and returns its new value.
    ///
    /// Returns [`Error::ClockStopped`] if the clock is not running, or stops while waiting.
    pub fn wait_for_next_tick(&self) -> Result<u64> {
        let shared = self.core.shared();

        let guard = shared.lock()?;

        let start = shared.tick.load(Ordering::Acquire);

        loop {
            if !shared.running.load(Ordering::Acquire) {
                return Err(Error::ClockStopped);
            }

            let tick = shared.tick.load(Ordering::Acquire);

            if tick != start {
                return Ok(tick);
            }

            guard.wait()?;
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.core.shared().tick.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.core.shared().running.load(Ordering::Acquire)
    }

    /// Number of handles attached to the segment across all processes.
    pub fn attached_count(&self) -> u32 {
        self.core.shared().attached.load(Ordering::Acquire)
    }

    /// Stops the clock for every process and wakes all waiters. The segment remains.
    pub fn stop_clock(&self) -> Result<()> {
        {
            let shared = self.core.shared();
            let guard = shared.lock()?;

            shared.running.store(false, Ordering::Release);
            guard.broadcast();
        }

        *self.core.halt.lock().unwrap() = true;
        self.core.halted.notify_all();

        let ticker = self.ticker.lock().unwrap().take();

        if let Some(handle) = ticker {
            let _ = handle.join();
            log::info!("clock {}: stopped", self.core.config.name);
        }

        Ok(())
    }

    /// Detaches and unmaps the segment without removing it, even if this is the last handle.
    pub fn release_process_resources(mut self) {
        self.detach();
    }

    /// Removes the named segment. Processes already attached keep their mappings.
    pub fn release_shared_system_resources(&self) -> Result<()> {
        shm::unlink(self.core.segment.name())?;

        log::info!("clock {}: unlinked", self.core.config.name);

        Ok(())
    }

    /// Detaches this handle and returns the number of handles still attached.
    fn detach(&mut self) -> u32 {
        if self.detached {
            return u32::MAX;
        }

        self.detached = true;

        if self.is_owner() {
            if let Err(err) = self.stop_clock() {
                log::warn!("clock {}: {}", self.core.config.name, err);
            }
        }

        let remaining = self.core.shared().attached.fetch_sub(1, Ordering::AcqRel) - 1;

        // The ticker has been joined, so this is the last reference
        if let Some(core) = Arc::get_mut(&mut self.core) {
            core.segment.unmap();
        }

        remaining
    }
}

impl Drop for GlobalClock {
    fn drop(&mut self) {
        if self.detach() == 0 {
            if let Err(err) = self.release_shared_system_resources() {
                log::warn!("clock {}: {}", self.core.config.name, err);
            }
        }
    }
}
