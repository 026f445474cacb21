use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use thrussh::MethodSet;
use thrussh_keys::PublicKeyBase64;

use ncproxy::capture::Sink;
use ncproxy::config;
use ncproxy::proxy::{self, ProxyContext};
use ncproxy::rules::RuleSet;

#[derive(Parser, Debug)]
#[clap(name = "ncproxy", version, about = "a transparent logging proxy for NETCONF over SSH")]
struct Args {
    #[clap(short, long, action = clap::ArgAction::Count,
           help = "enable logging, may be provided multiple times")]
    verbose: u8,
    #[clap(short, long, action = clap::ArgAction::Count,
           help = "enable ssh-lib logging, may be provided multiple times")]
    debug: u8,
    #[clap(long, value_name = "filename", help = "trace/debug log (default: <stderr>)")]
    logfile: Option<String>,
    #[clap(long, value_name = "filename", help = "server log (default: <stdout>)")]
    serverlog: Option<String>,
    #[clap(long, value_name = "filename", help = "client log (default: <stdout>)")]
    clientlog: Option<String>,
    #[clap(long, value_name = "filename", help = "patch NETCONF messages (default: <none>)")]
    patch: Option<String>,
    #[clap(long, value_name = "filename",
           help = "client private key file used towards the server (default: <none>)")]
    clientprivatekey: Option<String>,
    #[clap(long, value_name = "filename",
           help = "proxy private host key file (default: generated at startup)")]
    proxyhostkey: Option<String>,
    #[clap(long, value_name = "RSA|ED25519", default_value = "RSA",
           help = "proxy host key algorithm")]
    proxyhostkeyalg: String,
    #[clap(long, value_name = "filename",
           help = "expected server host key file (default: <none>)")]
    serverhostkey: Option<String>,
    #[clap(long, value_name = "RSA|ED25519", default_value = "RSA",
           help = "server host key algorithm")]
    serverhostkeyalg: String,
    #[clap(long, value_name = "tcpport", default_value_t = 830,
           help = "TCP-port ncproxy is listening on")]
    port: u16,
    #[clap(value_name = "netconf://<hostname>[:port]",
           default_value = "netconf://127.0.0.1:830",
           help = "NETCONF over SSH server")]
    server: String,
}

// the log facade has no separate critical level, so one and two both mean error
fn verbosity(count: u8) -> log::LevelFilter {
    match count {
        0 => log::LevelFilter::Off,
        1 | 2 => log::LevelFilter::Error,
        3 => log::LevelFilter::Warn,
        4 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    }
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<8} {}",
                chrono::Local::now().format("%y/%m/%d %H:%M:%S%.3f"),
                record.level(),
                message,
            ));
        })
        .level(log::LevelFilter::Off)
        .level_for("ncproxy", verbosity(args.verbose))
        .level_for("thrussh", verbosity(args.debug))
        .level_for("thrussh_keys", verbosity(args.debug));

    let dispatch = match &args.logfile {
        Some(path) => dispatch.chain(fern::log_file(path).context("prepping log file")?),
        None => dispatch.chain(std::io::stderr()),
    };
    dispatch.apply().context("installing logger")?;
    Ok(())
}

fn sink_for(path: &Option<String>) -> anyhow::Result<Sink> {
    match path {
        Some(path) if path != "-" => Sink::file(path),
        _ => Ok(Sink::stdout()),
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let (upstream_host, upstream_port) = config::parse_server_url(&args.server)?;

    let rules = match &args.patch {
        Some(path) => Arc::new(RuleSet::load(Path::new(path))?),
        None => Arc::new(RuleSet::empty()),
    };

    let listener = proxy::bind(args.port)?;

    let client_key = match &args.clientprivatekey {
        Some(path) => {
            let key = thrussh_keys::load_secret_key(path, None)
                .with_context(|| format!("loading client private key {}", path))?;
            log::debug!("client private key: {}", key.clone_public_key().fingerprint());
            Some(Arc::new(key))
        }
        None => None,
    };

    let server_host_key = match &args.serverhostkey {
        Some(path) => {
            let key = config::load_host_key(path, &args.serverhostkeyalg)?;
            let public = key.clone_public_key();
            log::debug!("server host key: {}", public.fingerprint());
            Some(public.public_key_base64())
        }
        None => None,
    };

    let proxy_host_key = match &args.proxyhostkey {
        Some(path) => config::load_host_key(path, &args.proxyhostkeyalg)?,
        None => config::generate_host_key()?,
    };
    log::debug!("proxy host key: {}", proxy_host_key.clone_public_key().fingerprint());

    let ctx = Arc::new(ProxyContext {
        upstream_host,
        upstream_port,
        rules,
        client_key,
        server_host_key,
        serverlog: sink_for(&args.serverlog)?,
        clientlog: sink_for(&args.clientlog)?,
    });

    let mut server_config = thrussh::server::Config::default();
    server_config.server_id = format!("SSH-2.0-ncproxy_{}", env!("CARGO_PKG_VERSION"));
    server_config.methods = MethodSet::PUBLICKEY | MethodSet::PASSWORD;
    server_config.connection_timeout = None;
    server_config.keys.push(proxy_host_key);

    tokio::select! {
        result = proxy::serve(listener, Arc::new(server_config), ctx) => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("ncproxy terminated by user");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = init_logging(&args) {
        eprintln!("ncproxy: {:#}", err);
        std::process::exit(1);
    }
    if let Err(err) = run(args).await {
        log::error!("server setup failed: {:#}", err);
        std::process::exit(1);
    }
}
