//! Logging setup
//!
//! JSON records on stderr. The base level comes from `--debug` or the
//! top-level `debug` flag; per-component `debug` flags compile into
//! env-filter directives targeting the matching module. `RUST_LOG` wins
//! over all of it when set.

use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Install the global subscriber.
pub fn init(config: &Config, force_debug: bool) {
    let directives = directives(config, force_debug);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(std::io::stderr)
        .init();
}

fn directives(config: &Config, force_debug: bool) -> String {
    let debug_all = force_debug || config.debug;
    let mut directives = vec![if debug_all { "debug" } else { "info" }.to_string()];

    if !debug_all {
        if config.nats.debug {
            directives.push("tanq_adapters::nats=debug".to_string());
        }
        if config.cert.debug {
            directives.push("tanq_adapters::cert=debug".to_string());
        }
        if config.libtapir.debug {
            directives.push("tanq_adapters::codec=debug".to_string());
        }
        if config.api.debug {
            directives.push("tapir_analyse_new_qname::api=debug".to_string());
        }
    }

    directives.join(",")
}
