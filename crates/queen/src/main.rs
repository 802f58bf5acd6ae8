use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use hlhv_queen::srvhttps::SrvHttps;
use hlhv_queen::wrangler::Wrangler;
use hlhv_queen::{Conf, HostMux, Options, scribe};

#[tokio::main]
async fn main() -> ExitCode {
    let options = match Options::try_parse() {
        Ok(options) => options,
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };
    let _log_guard = scribe::init(options.log_level, options.log_directory.as_deref());

    tracing::info!("starting hlhv queen cell");
    match run(&options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(options: &Options) -> anyhow::Result<()> {
    let conf = Arc::new(Conf::new());
    if let Err(e) = conf.load(&options.conf_path) {
        tracing::warn!(error = %e, "could not load conf, using default configuration");
    }

    let mux = Arc::new(HostMux::new(conf.clone()));
    let wrangler = Wrangler::new(conf.clone(), mux.clone());
    wrangler.arm().context("could not arm wrangler")?;
    let srvhttps = SrvHttps::new(conf.clone(), mux.clone());
    srvhttps.arm().context("could not arm https server")?;

    tracing::info!("startup sequence complete, resuming normal operation");
    tokio::select! {
        fired = wrangler.fire() => fired.context("cell wrangler failed")?,
        fired = srvhttps.fire() => fired.context("https server failed")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            wrangler.close();
            srvhttps.close();
        }
    }
    Ok(())
}
