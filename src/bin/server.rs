use clap::{App, Arg, ArgMatches};
use gpiolink::backend::{IoBackend, RecordingIo, SimulatedIo};
use gpiolink::server::Server;
use gpiolink::ServerConfig;
use std::path::Path;
use tracing::{error, info, Level};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("gpiolink-server")
        .version("0.1.0")
        .author("Embedded Systems Engineering Team")
        .about("Single-client GPIO control daemon with UDP telemetry")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("bind")
                .short("b")
                .long("bind")
                .value_name("ADDR")
                .help("Address to listen on")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("tcp-port")
                .short("p")
                .long("tcp-port")
                .value_name("PORT")
                .help("TCP command port")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("udp-local-port")
                .long("udp-local-port")
                .value_name("PORT")
                .help("Local UDP port telemetry is sent from")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("udp-remote-port")
                .short("u")
                .long("udp-remote-port")
                .value_name("PORT")
                .help("UDP port on the client that receives telemetry")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("rate-index")
                .short("r")
                .long("rate-index")
                .value_name("INDEX")
                .help("Initial index into the telemetry rate table")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("resync")
                .long("resync")
                .help("Restart the telemetry schedule on every new connection"),
        )
        .arg(
            Arg::with_name("backend")
                .long("backend")
                .value_name("BACKEND")
                .help("IO backend")
                .takes_value(true)
                .possible_values(&["simulated", "recording"])
                .default_value("simulated"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log every command and rate change"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match build_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {}", e);
            return Err(e);
        }
    };

    match matches.value_of("backend") {
        Some("recording") => serve(config, RecordingIo::new()).await,
        _ => serve(config, SimulatedIo::new()).await,
    }
}

async fn serve<B: IoBackend>(
    config: ServerConfig,
    backend: B,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut server = match Server::bind(config, backend).await {
        Ok(server) => server,
        Err(e) => {
            error!("startup failed: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = server.run().await {
        error!("server failed: {}", e);
        return Err(e.into());
    }
    info!("bye");
    Ok(())
}

fn build_config(matches: &ArgMatches) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = match matches.value_of("config") {
        Some(path) => ServerConfig::load(Path::new(path))?,
        None => ServerConfig::default(),
    };

    if let Some(bind) = matches.value_of("bind") {
        config.bind_address = bind.parse()?;
    }
    if let Some(port) = matches.value_of("tcp-port") {
        config.tcp_port = port.parse()?;
    }
    if let Some(port) = matches.value_of("udp-local-port") {
        config.udp_local_port = port.parse()?;
    }
    if let Some(port) = matches.value_of("udp-remote-port") {
        config.udp_remote_port = port.parse()?;
    }
    if let Some(index) = matches.value_of("rate-index") {
        config.default_rate_index = index.parse()?;
    }
    if matches.is_present("resync") {
        config.resync_on_accept = true;
    }

    config.validate()?;
    Ok(config)
}
