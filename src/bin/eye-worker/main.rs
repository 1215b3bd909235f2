//! One eye's tracking process. Started by the host's `WorkerSupervisor`,
//! speaks JSON lines on stdin/stdout and logs to stderr.

use clap::Parser;
use log::{error, info};
use std::io;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use vrcore::args::{Importer, WorkerArgs};
use vrcore::worker::{load_calibration, spawn_command_reader, EyeWorker, WorkerOptions};

static TERMINATED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigterm(_: libc::c_int) {
    TERMINATED.store(true, Ordering::Relaxed);
}

fn main() -> ExitCode {
    env_logger::init();
    let args = WorkerArgs::parse();

    // SAFETY: the handler only stores to an atomic.
    unsafe {
        libc::signal(libc::SIGTERM, on_sigterm as libc::sighandler_t);
    }

    let options = WorkerOptions {
        eye: args.eye,
        importer: if args.test_mode {
            Importer::Synthetic
        } else {
            args.importer
        },
        sharedmem: args.sharedmem.clone(),
        width: args.width,
        height: args.height,
        fps: args.fps,
    };
    info!(
        "{} worker : starting with {:?} frames {}x{}.",
        options.eye, options.importer, options.width, options.height
    );

    let commands = match spawn_command_reader(io::BufReader::new(io::stdin())) {
        Ok(commands) => commands,
        Err(e) => {
            error!("{} worker : cannot read commands : {e}.", options.eye);
            return ExitCode::FAILURE;
        }
    };

    let calibration = load_calibration(&args.calibration);
    let mut worker = EyeWorker::new(&options, calibration, io::stdout().lock());
    match worker.run(&commands, &TERMINATED) {
        Ok(()) => {
            info!("{} worker : terminated.", options.eye);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{} worker : {e}.", options.eye);
            ExitCode::FAILURE
        }
    }
}
