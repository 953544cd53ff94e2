//! quaymq - MQTT 3.1.1 broker.

use std::process;

use log::{error, info};

use quaymq_server::{Broker, Config};

const USAGE: &str = "\
quaymq - MQTT 3.1.1 broker

Usage: quaymq [OPTIONS]

Options:
  -c, --config <FILE>     Config file path (default: quaymq.toml)
  -t <SECONDS>            Acknowledgement timeout before a resend (default: 15)
  -p <PORT>               Listening port (default: 1883)
  -m <COUNT>              Maximum in-flight QoS 1/2 messages per client (default: 50)
  -a                      Allow anonymous clients
  -u <USER:PASS,...>      Accepted credentials
  -h, --help              Show this help message

Configuration:
  Config file uses TOML format. All settings can be overridden
  with environment variables using the QUAYMQ__ prefix:

  QUAYMQ__SERVER__BIND=0.0.0.0:1884
  QUAYMQ__QOS__ACK_TIMEOUT_SECS=30
  QUAYMQ__AUTH__CREDENTIALS=alice:a1,bob:b2
  QUAYMQ__LOG__LEVEL=debug";

/// Command line settings. Everything except the config path overrides the
/// loaded configuration.
#[derive(Debug, Default, PartialEq)]
struct Args {
    config_path: Option<String>,
    ack_timeout_secs: Option<u64>,
    port: Option<u16>,
    max_inflight: Option<u16>,
    allow_anonymous: bool,
    credentials: Option<String>,
    help: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(secs) = self.ack_timeout_secs {
            config.qos.ack_timeout_secs = secs;
        }
        if let Some(port) = self.port {
            config.server.bind.set_port(port);
        }
        if let Some(max) = self.max_inflight {
            config.limits.max_inflight = max;
        }
        if self.allow_anonymous {
            config.auth.allow_anonymous = true;
        }
        if let Some(list) = &self.credentials {
            if config.auth.credentials.is_empty() {
                config.auth.credentials = list.clone();
            } else {
                config.auth.credentials = format!("{},{}", config.auth.credentials, list);
            }
        }
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut iter = args.iter();

    fn value<'a>(
        flag: &str,
        iter: &mut impl Iterator<Item = &'a String>,
    ) -> Result<&'a String, String> {
        iter.next()
            .ok_or_else(|| format!("{} requires a value", flag))
    }

    fn number<T: std::str::FromStr>(flag: &str, raw: &str) -> Result<T, String> {
        raw.parse()
            .map_err(|_| format!("{} expects a number, got '{}'", flag, raw))
    }

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => parsed.config_path = Some(value(arg, &mut iter)?.clone()),
            "-t" => parsed.ack_timeout_secs = Some(number(arg, value(arg, &mut iter)?)?),
            "-p" => parsed.port = Some(number(arg, value(arg, &mut iter)?)?),
            "-m" => parsed.max_inflight = Some(number(arg, value(arg, &mut iter)?)?),
            "-a" => parsed.allow_anonymous = true,
            "-u" => parsed.credentials = Some(value(arg, &mut iter)?.clone()),
            "-h" | "--help" => parsed.help = true,
            other => return Err(format!("Unknown argument: {}", other)),
        }
    }
    Ok(parsed)
}

fn main() {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&raw) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            process::exit(1);
        }
    };
    if args.help {
        println!("{}", USAGE);
        process::exit(0);
    }

    let config_path = args.config_path.as_deref().unwrap_or("quaymq.toml");
    let mut config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };
    args.apply(&mut config);

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log.level))
        .init();

    info!(
        "Starting quaymq (ack_timeout={}s, max_inflight={}, anonymous={})",
        config.qos.ack_timeout_secs, config.limits.max_inflight, config.auth.allow_anonymous
    );

    let mut broker = match Broker::new(config) {
        Ok(b) => b,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = broker.start() {
        error!("Failed to start broker: {}", e);
        process::exit(1);
    }
    broker.wait();
}
