use m2mp_channel::ChannelRegistry;
use m2mp_layer::{M2mpConfig, MAX_FILTER_PREFIX};
use m2mp_packet::{DATA_SIZE, HEADER_SIZE};

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("m2mp {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    for (key, value) in provenance() {
        println!("{key}: {value}");
    }
    Ok(SUCCESS)
}

/// Build and protocol facts reported by `version --extended`.
fn provenance() -> Vec<(&'static str, String)> {
    let defaults = M2mpConfig::default();
    let registry = ChannelRegistry::with_builtins();
    vec![
        ("name", "m2mp".to_string()),
        ("version", env!("CARGO_PKG_VERSION").to_string()),
        (
            "target",
            option_env!("M2MP_BUILD_TARGET").unwrap_or("unknown").to_string(),
        ),
        ("git_hash", option_env!("GIT_HASH").unwrap_or("unknown").to_string()),
        (
            "packet",
            format!("header={HEADER_SIZE} payload<={DATA_SIZE} bytes, big-endian"),
        ),
        ("max_filter_prefix", MAX_FILTER_PREFIX.to_string()),
        ("channels", registry.names().collect::<Vec<_>>().join(",")),
        (
            "defaults",
            format!(
                "message_timeout={:?} flow_timeout={:?} redundancy={}",
                defaults.message_timeout, defaults.flow_timeout, defaults.redundancy
            ),
        ),
    ]
}
