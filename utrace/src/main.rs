use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use log::info;

use utrace::cli::args::parse_function_spec;
use utrace::cli::Args;
use utrace::domain::Pid;
use utrace::export::ChromeTraceExporter;
use utrace::listener::ChannelListener;
use utrace::records::TraceRecord;
use utrace::tracer::{TracerConfig, TracerEngine};
use utrace::unwind::{FramePointerUnwinder, MemoryMaps};

static EXIT_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_exit(_signal: libc::c_int) {
    EXIT_REQUESTED.store(true, Ordering::Release);
}

#[derive(Default)]
struct Summary {
    tids: u64,
    switches: u64,
    function_calls: u64,
    callstacks: u64,
}

impl Summary {
    fn tally(&mut self, record: &TraceRecord) {
        match record {
            TraceRecord::TidSeen(_) => self.tids += 1,
            TraceRecord::ContextSwitchIn(_) | TraceRecord::ContextSwitchOut(_) => {
                self.switches += 1;
            }
            TraceRecord::FunctionCall(_) => self.function_calls += 1,
            TraceRecord::Callstack(_) => self.callstacks += 1,
            TraceRecord::FunctionBegin(_) | TraceRecord::FunctionEnd(_) => {}
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let mut config = TracerConfig::new(Pid(args.pid));
    config.trace_context_switches = args.switches;
    config.trace_callstacks = args.callstacks;
    config.sampling_period_ns = args.sampling_period_ns;
    config.processing_delay_ms = args.processing_delay_ms;
    config.round_robin_batch_size = args.batch_size;
    config.callstacks_on_function_exit = args.exit_callstacks;
    for spec in &args.functions {
        config.instrumented_functions.push(parse_function_spec(spec)?);
    }
    config.trace_instrumented_functions = !config.instrumented_functions.is_empty();

    let engine = TracerEngine::new(config)?;

    #[allow(unsafe_code)]
    unsafe {
        libc::signal(libc::SIGINT, request_exit as libc::sighandler_t);
        libc::signal(libc::SIGTERM, request_exit as libc::sighandler_t);
    }

    if args.duration > 0 {
        let duration = Duration::from_secs(args.duration);
        thread::spawn(move || {
            thread::sleep(duration);
            EXIT_REQUESTED.store(true, Ordering::Release);
        });
    }

    println!("utrace: attaching to pid {}", args.pid);

    // The engine emits on its own thread; records flow back over a bounded
    // channel so a slow consumer can never stall the capture.
    let (tx, rx) = bounded(65_536);
    let engine_thread = thread::spawn(move || {
        engine.run(
            FramePointerUnwinder::new(MemoryMaps::default()),
            ChannelListener::new(tx),
            &EXIT_REQUESTED,
        )
    });

    let mut exporter = args.export.as_ref().map(|_| ChromeTraceExporter::new(args.pid));
    let mut summary = Summary::default();

    // Ends when the engine drops its sender.
    for record in rx {
        summary.tally(&record);
        if let Some(exporter) = exporter.as_mut() {
            exporter.add_record(&record);
        }
    }

    engine_thread
        .join()
        .map_err(|_| anyhow!("engine thread panicked"))??;

    info!(
        "capture finished: {} threads, {} context switches, {} function calls, {} callstacks",
        summary.tids, summary.switches, summary.function_calls, summary.callstacks
    );
    println!(
        "captured {} context switches, {} function calls, {} callstacks across {} threads",
        summary.switches, summary.function_calls, summary.callstacks, summary.tids
    );

    if let (Some(exporter), Some(path)) = (exporter, args.export.as_ref()) {
        exporter
            .save(path)
            .context(format!("failed to write {}", path.display()))?;
        println!("trace written to {}", path.display());
    }

    Ok(())
}
