//! # Fetch Tool
//!
//! Purpose: Fetch one or more URLs through the blocking adapter and print
//! the status and body size of each.
//!
//! ```text
//! hbridge-fetch <url>... [--parallel] [--timeout-ms N]
//! ```
//!
//! `HBRIDGE_CONFIG` may hold an `AdapterConfig` as JSON; `--timeout-ms`
//! overrides its whole-call deadline. Logging follows `RUST_LOG`.

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use hbridge_client::BlockingAdapter;
use hbridge_common::{AdapterConfig, BridgeResult, RequestEnvelope};

struct FetchArgs {
    urls: Vec<String>,
    parallel: bool,
    timeout: Option<Duration>,
}

impl FetchArgs {
    fn from_args() -> Result<Self> {
        let mut urls = Vec::new();
        let mut parallel = false;
        let mut timeout = None;

        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--parallel" => parallel = true,
                "--timeout-ms" => {
                    let raw = args.next().context("--timeout-ms needs a value")?;
                    let millis: u64 = raw.parse().with_context(|| format!("invalid timeout: {raw}"))?;
                    timeout = Some(Duration::from_millis(millis));
                }
                flag if flag.starts_with("--") => bail!("unknown flag: {flag}"),
                _ => urls.push(arg),
            }
        }

        if urls.is_empty() {
            bail!("usage: hbridge-fetch <url>... [--parallel] [--timeout-ms N]");
        }
        Ok(FetchArgs {
            urls,
            parallel,
            timeout,
        })
    }
}

fn load_config() -> Result<AdapterConfig> {
    match env::var("HBRIDGE_CONFIG") {
        Ok(raw) => AdapterConfig::from_json(&raw).context("HBRIDGE_CONFIG is not a valid configuration"),
        Err(_) => Ok(AdapterConfig::default()),
    }
}

fn report(url: &str, outcome: BridgeResult<RequestEnvelope>) {
    match outcome {
        Ok(envelope) => match envelope.response {
            Some(response) => println!("{url}: {} ({} bytes)", response.status, response.body_bytes().len()),
            None => println!("{url}: no response"),
        },
        Err(err) => println!("{url}: error ({:?}): {err}", err.kind()),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = FetchArgs::from_args()?;
    let mut config = load_config()?;
    if args.timeout.is_some() {
        config.timeout = args.timeout;
    }

    let client = BlockingAdapter::new(config).context("failed to start runtime")?;
    let mut envelopes = Vec::with_capacity(args.urls.len());
    for url in &args.urls {
        envelopes.push(RequestEnvelope::get(url).with_context(|| format!("invalid url: {url}"))?);
    }

    if args.parallel {
        let mut handles = Vec::with_capacity(envelopes.len());
        client.in_parallel(|scope| {
            for envelope in envelopes {
                handles.push(scope.submit(envelope));
            }
        })?;
        for (url, handle) in args.urls.iter().zip(handles) {
            if let Some(outcome) = handle.take() {
                report(url, outcome);
            }
        }
    } else {
        for (url, mut envelope) in args.urls.iter().zip(envelopes) {
            let outcome = client.call(&mut envelope).map(|()| envelope);
            report(url, outcome);
        }
    }

    client.close();
    Ok(())
}
