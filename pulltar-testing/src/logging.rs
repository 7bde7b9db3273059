//! Per-test `tracing` setup, so each test's log output can be read on its own.
use crate::Result;
use std::{
    cell::RefCell,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{dispatcher, subscriber::DefaultGuard, Dispatch};
use tracing_subscriber::fmt::MakeWriter;

std::thread_local! {
    // Holds the per-test dispatcher in place for the lifetime of each runtime thread
    static LOG_GUARD: RefCell<Option<DefaultGuard>> = RefCell::new(None);
}

/// Collects everything the subscriber writes while one test runs.
#[derive(Clone, Default)]
struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Take the captured output, decoding it as UTF-8.
    fn drain(&self) -> String {
        let mut buffer = self.buffer.lock().unwrap();

        String::from_utf8_lossy(&std::mem::take(&mut *buffer)).into_owned()
    }
}

/// Writer handed out to the `fmt` layer.  Appends to the shared capture buffer.
struct LogSink(Arc<Mutex<Vec<u8>>>);

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogSink;

    fn make_writer(&'a self) -> LogSink {
        LogSink(self.buffer.clone())
    }
}

/// Build a `Dispatch` that writes formatted log events into `capture`.
///
/// The filter comes from `RUST_LOG` when set, otherwise a default that keeps the HTTP and AWS
/// plumbing quiet while everything else logs at `debug`.
fn capture_dispatch(capture: &LogCapture) -> Dispatch {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("h2=warn,hyper=info,rustls=info,aws=info,debug"));

    let format = fmt::layer()
        .with_level(true)
        .with_target(true)
        // Thread IDs tell interleaved workers apart when tests run in parallel; thread names
        // under tokio are just noise
        .with_thread_ids(true)
        .with_thread_names(false)
        .with_writer(capture.clone());

    Dispatch::new(tracing_subscriber::registry().with(filter).with(format))
}

/// Run an async test body under its own `tracing` dispatcher and its own tokio runtime.
///
/// A global subscriber would interleave log events from every test running in parallel.  Instead
/// this installs a dispatcher scoped to just this test, buffers what it writes, and prints the
/// buffer once the test finishes (or panics, in which case the panic is re-thrown after the logs
/// are printed).  The runtime's `on_thread_start` hook installs the same dispatcher on every
/// worker thread, so events from spawned tasks land in the buffer too.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    let capture = LogCapture::default();
    let dispatch = capture_dispatch(&capture);
    let thread_dispatch = dispatch.clone();

    dispatcher::with_default(&dispatch, move || {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all();

        builder.on_thread_start(move || {
            let guard = dispatcher::set_default(&thread_dispatch);

            LOG_GUARD.with(|cell| {
                cell.replace(Some(guard));
            });
        });

        builder.on_thread_stop(|| {
            // Uninstall the dispatcher before the thread is reused or torn down
            LOG_GUARD.with(|cell| cell.replace(None));
        });

        let runtime = builder.build()?;

        // The runtime and the test future cross the unwind boundary here.  Neither is declared
        // unwind safe, but nothing observes their state after a panic, so asserting it is fine.
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(Duration::from_secs(10));

            result
        }));

        println!("Log output captured while the test ran:\n{}", capture.drain());

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}
