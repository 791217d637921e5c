//! Strand echo server
//!
//! TCP echo driven entirely by the strand reactor: the main thread
//! accepts and feeds channels to the selector manager; every connection
//! pumps fill → write-back → re-arm through the step driver.
//!
//! Usage:
//!     cargo run --release -p strand-echo [port]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!
//! Environment:
//!     STRAND_LOG=<error|warn|info|debug|trace>   log level (default info)

use std::io;
use std::sync::Arc;

use strand_core::{ChunkPool, Process, Result, Step, StepDriver, StrandError};
use strand_reactor::{
    listen, Connection, ConnectionFactory, ConnectionStats, Context, Endpoint, Fill,
    ReactorConfig, SelectorManager,
};

const DEFAULT_PORT: u16 = 9999;

// ── Echo connection ──────────────────────────────────────────────────

struct EchoPump {
    endpoint: Arc<dyn Endpoint>,
    pool: ChunkPool,
}

impl Process for EchoPump {
    fn process(&mut self, driver: &StepDriver) -> Result<Step> {
        loop {
            let mut lease = self.pool.acquire(8 * 1024);
            match self.endpoint.fill(&mut lease)? {
                Fill::Data(_) => {
                    let chunk = lease.freeze(false);
                    self.endpoint.write(driver.callback(), vec![chunk.to_bytes()]);
                    chunk.release();
                    return Ok(Step::Scheduled);
                }
                Fill::Empty => {
                    drop(lease);
                    self.endpoint.fill_interested(driver.iterate_callback());
                    return Ok(Step::Idle);
                }
                Fill::Eof => {
                    drop(lease);
                    self.endpoint.close();
                    return Ok(Step::Done);
                }
            }
        }
    }

    fn on_failure(&mut self, cause: &StrandError) {
        if cause.is_transient() {
            log::debug!("closing idle echo connection");
        }
        self.endpoint.close();
    }
}

struct EchoConnection {
    driver: StepDriver,
}

impl Connection for EchoConnection {
    fn protocol(&self) -> &'static str {
        "echo"
    }

    fn on_open(&self) {
        self.driver.iterate();
    }

    fn on_close(&self, cause: Option<&StrandError>) {
        if let Some(cause) = cause {
            log::debug!("echo connection closed: {}", cause);
        }
        self.driver.close();
    }
}

struct EchoFactory {
    pool: ChunkPool,
}

impl ConnectionFactory for EchoFactory {
    fn new_connection(
        &self,
        endpoint: &Arc<dyn Endpoint>,
        _context: &Context,
    ) -> Arc<dyn Connection> {
        Arc::new(EchoConnection {
            driver: StepDriver::new(EchoPump {
                endpoint: endpoint.clone(),
                pool: self.pool.clone(),
            }),
        })
    }
}

// ── Main ─────────────────────────────────────────────────────────────

fn main() -> io::Result<()> {
    logger::init();

    let port = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let config = ReactorConfig::new();
    let pool = ChunkPool::with_capacity(config.buffer_min, config.buffer_max);
    let stats = Arc::new(ConnectionStats::new());

    let manager = SelectorManager::new(
        config.clone(),
        Arc::new(EchoFactory { pool }),
    )
    .map_err(|e| {
        log::error!("reactor start failed: {}", e);
        e
    })?;
    manager.add_listener(stats.clone());

    let addr = format!("0.0.0.0:{}", port).parse().unwrap();
    let listener = listen(addr, config.accept_queue)?;
    log::info!(
        "strand-echo listening on {} ({} selectors)",
        addr,
        manager.selector_count()
    );

    // Accept on the main thread; the listener is non-blocking, so park
    // briefly between empty sweeps.
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    log::debug!("set_nodelay({}): {}", peer, e);
                }
                log::debug!("accepted {} (current {})", peer, stats.current() + 1);
                manager.accept(Box::new(stream));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::error!("accept failed: {}", e);
                return Err(e);
            }
        }
    }
}

// ── Minimal stderr logger behind the log facade ──────────────────────

mod logger {
    use log::{Level, LevelFilter, Log, Metadata, Record};
    use std::io::Write;

    struct Stderr;

    impl Log for Stderr {
        fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
            true
        }

        fn log(&self, record: &Record<'_>) {
            let prefix = match record.level() {
                Level::Error => "[ERROR]",
                Level::Warn => "[WARN] ",
                Level::Info => "[INFO] ",
                Level::Debug => "[DEBUG]",
                Level::Trace => "[TRACE]",
            };
            let stderr = std::io::stderr();
            let mut handle = stderr.lock();
            let _ = writeln!(handle, "{} {}", prefix, record.args());
        }

        fn flush(&self) {}
    }

    static LOGGER: Stderr = Stderr;

    pub fn init() {
        let level = match std::env::var("STRAND_LOG").as_deref() {
            Ok("error") => LevelFilter::Error,
            Ok("warn") => LevelFilter::Warn,
            Ok("debug") => LevelFilter::Debug,
            Ok("trace") => LevelFilter::Trace,
            _ => LevelFilter::Info,
        };
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(level);
    }
}
