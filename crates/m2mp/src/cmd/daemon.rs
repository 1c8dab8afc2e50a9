use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use m2mp_channel::ChannelRegistry;
use m2mp_layer::Daemon;
use tracing::info;

use crate::cmd::{DaemonArgs, LayerArgs};
use crate::exit::{layer_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_listening, OutputFormat};

pub fn run(args: DaemonArgs, layer: &LayerArgs, format: OutputFormat) -> CliResult<i32> {
    let config = layer.to_config(args.port, &args.channel)?;
    let registry = ChannelRegistry::with_builtins();
    let daemon = Arc::new(
        Daemon::bind(&config, &registry).map_err(|err| layer_error("daemon start failed", err))?,
    );
    print_listening(daemon.local_addr(), &args.channel, format);

    // None: interrupted; Some: the accept loop ended.
    let (done, finished) = mpsc::channel();
    {
        let done = done.clone();
        ctrlc::set_handler(move || {
            let _ = done.send(None);
        })
        .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))?;
    }
    {
        let daemon = Arc::clone(&daemon);
        thread::Builder::new()
            .name("m2mp-daemon-accept".to_string())
            .spawn(move || {
                let _ = done.send(Some(daemon.serve()));
            })
            .map_err(|err| crate::exit::io_error("daemon start failed", err))?;
    }

    let outcome = finished.recv().ok().flatten();
    daemon.shutdown();
    match outcome {
        Some(Err(err)) => Err(layer_error("daemon stopped", err)),
        _ => {
            info!("m2mp daemon stopped");
            Ok(SUCCESS)
        }
    }
}
