use std::fs;
use std::io::Write;

use m2mp_layer::M2mp;
use m2mp_packet::DATA_SIZE;

use crate::cmd::{LayerArgs, SendArgs};
use crate::exit::{io_error, layer_error, CliResult, SUCCESS};
use crate::output::{print_sent, OutputFormat};

pub fn run(args: SendArgs, layer: &LayerArgs, format: OutputFormat) -> CliResult<i32> {
    let config = layer.to_config(args.daemon_port, &args.channel)?;
    let redundancy = config.redundancy;
    let payload = resolve_payload(&args)?;

    let m2mp = M2mp::new(config).map_err(|err| layer_error("m2mp start failed", err))?;
    let mut message = m2mp.create_outgoing_message();
    message
        .write_all(&payload)
        .and_then(|()| message.close())
        .map_err(|err| io_error("send failed", err))?;

    print_sent(
        message.message_id(),
        payload.len(),
        fragment_count(payload.len(), redundancy),
        redundancy,
        format,
    );
    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}

/// Distinct fragments a message of `len` bytes is split into.
fn fragment_count(len: usize, redundancy: u32) -> usize {
    let data = len.div_ceil(DATA_SIZE).max(1);
    if data == 1 && redundancy > 1 {
        2
    } else {
        data
    }
}
