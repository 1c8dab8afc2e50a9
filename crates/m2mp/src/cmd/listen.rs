use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use m2mp_layer::M2mp;

use crate::cmd::{parse_duration, LayerArgs, ListenArgs};
use crate::exit::{io_error, layer_error, CliError, CliResult, INTERNAL, SUCCESS, TIMEOUT};
use crate::output::{print_message, OutputFormat};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub fn run(args: ListenArgs, layer: &LayerArgs, format: OutputFormat) -> CliResult<i32> {
    let config = layer.to_config(args.daemon_port, &args.channel)?;
    let idle_timeout = args.timeout.as_deref().map(parse_duration).transpose()?;

    let m2mp = M2mp::new(config).map_err(|err| layer_error("m2mp start failed", err))?;
    if args.prefixes.is_empty() {
        m2mp.add_message_filter(b"")
            .map_err(|err| layer_error("filter failed", err))?;
    }
    for prefix in &args.prefixes {
        m2mp.add_message_filter(prefix.as_bytes())
            .map_err(|err| layer_error("filter failed", err))?;
    }

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut printed = 0usize;
    let mut last_activity = Instant::now();

    while running.load(Ordering::SeqCst) {
        let accepted = m2mp
            .accept_incoming_message_timeout(POLL_INTERVAL)
            .map_err(|err| layer_error("receive failed", err))?;
        let Some(mut message) = accepted else {
            if idle_timeout.is_some_and(|limit| last_activity.elapsed() >= limit) {
                return Err(CliError::new(TIMEOUT, "no message received before timeout"));
            }
            continue;
        };

        let mut payload = Vec::new();
        match message.read_to_end(&mut payload) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                tracing::warn!(message_id = message.message_id(), "incomplete message dropped");
                continue;
            }
            Err(err) => return Err(io_error("receive failed", err)),
        }

        print_message(message.message_id(), &payload, format);
        printed = printed.saturating_add(1);
        last_activity = Instant::now();

        if let Some(count) = args.count {
            if printed >= count {
                return Ok(SUCCESS);
            }
        }
    }

    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
