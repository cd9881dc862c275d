use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use gpiolink::config::DEFAULT_UDP_REMOTE_PORT;
use gpiolink::telemetry::{SequenceTracker, TelemetryPacket, TELEMETRY_PACKET_LEN};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "10000";
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
// A reply is complete once the server stays quiet this long
const REPLY_SETTLE: Duration = Duration::from_millis(200);

const TABLE_TOP: &str = "┌───────┬────────┬────────┬───────┬───────┬───────┬───────┐";
const TABLE_HEADER: &str = "│  Seq  │ DigOut │ DigIn  │  A0   │  A1   │  A2   │  A3   │";
const TABLE_RULE: &str = "├───────┼────────┼────────┼───────┼───────┼───────┼───────┤";
const TABLE_BOTTOM: &str = "└───────┴────────┴────────┴───────┴───────┴───────┴───────┘";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let default_udp_port = DEFAULT_UDP_REMOTE_PORT.to_string();
    let matches = App::new("gpiolink")
        .version("0.1.0")
        .author("Embedded Systems Engineering Team")
        .about("Command-line client for the gpiolink control daemon")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Server host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Server TCP port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("send")
                .about("Send a raw command line and print the reply")
                .arg(
                    Arg::with_name("line")
                        .help("Command without CRLF, e.g. ra")
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("analog")
                .about("Read the four analog inputs"),
        )
        .subcommand(
            SubCommand::with_name("digital")
                .about("Read the digital input byte"),
        )
        .subcommand(
            SubCommand::with_name("write")
                .about("Set a digital output")
                .arg(
                    Arg::with_name("line")
                        .help("Output line")
                        .required(true)
                        .possible_values(&["0", "1", "2"]),
                )
                .arg(
                    Arg::with_name("value")
                        .help("Output level")
                        .required(true)
                        .possible_values(&["0", "1"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("rate")
                .about("Select the telemetry rate")
                .arg(
                    Arg::with_name("selector")
                        .help("Rate table entry, 1-9")
                        .required(true)
                        .possible_values(&["1", "2", "3", "4", "5", "6", "7", "8", "9"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("commands")
                .about("Print the server's command list"),
        )
        .subcommand(SubCommand::with_name("kill").about("Stop the server process"))
        .subcommand(
            SubCommand::with_name("monitor")
                .about("Hold a session open and print live telemetry")
                .arg(
                    Arg::with_name("udp-port")
                        .short("u")
                        .long("udp-port")
                        .value_name("PORT")
                        .help("Local UDP port the server sends telemetry to")
                        .takes_value(true)
                        .default_value(&default_udp_port),
                )
                .arg(
                    Arg::with_name("rate")
                        .short("r")
                        .long("rate")
                        .value_name("SELECTOR")
                        .help("Select a rate (1-9) before monitoring")
                        .takes_value(true)
                        .possible_values(&["1", "2", "3", "4", "5", "6", "7", "8", "9"]),
                )
                .arg(
                    Arg::with_name("count")
                        .short("n")
                        .long("count")
                        .value_name("PACKETS")
                        .help("Stop after this many packets (default: until Ctrl-C)")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("format")
                        .short("f")
                        .long("format")
                        .value_name("FORMAT")
                        .help("Output format")
                        .takes_value(true)
                        .possible_values(&["table", "json", "compact"])
                        .default_value("table"),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;

    match matches.subcommand() {
        ("send", Some(sub_matches)) => {
            let line = sub_matches.value_of("line").unwrap_or_default();
            handle_exchange(host, port, line).await?;
        }
        ("analog", _) => handle_exchange(host, port, "ra").await?,
        ("digital", _) => handle_exchange(host, port, "rd").await?,
        ("write", Some(sub_matches)) => {
            let line = sub_matches.value_of("line").unwrap_or("0");
            let value = sub_matches.value_of("value").unwrap_or("0");
            handle_exchange(host, port, &format!("wd{line},{value}")).await?;
        }
        ("rate", Some(sub_matches)) => {
            let selector = sub_matches.value_of("selector").unwrap_or("3");
            handle_exchange(host, port, &format!("pu{selector}")).await?;
        }
        ("commands", _) => handle_exchange(host, port, "h").await?,
        ("kill", _) => handle_exchange(host, port, "k").await?,
        ("monitor", Some(sub_matches)) => handle_monitor(sub_matches, host, port).await?,
        _ => {
            println!(
                "{}",
                "No command specified. Use --help for usage information.".yellow()
            );
        }
    }

    Ok(())
}

async fn handle_exchange(
    host: &str,
    port: u16,
    line: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut stream = connect(host, port).await?;
    let reply = exchange(&mut stream, line).await?;
    print_reply(line, &reply);
    Ok(())
}

async fn handle_monitor(
    matches: &ArgMatches<'_>,
    host: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let udp_port: u16 = matches.value_of("udp-port").unwrap_or_default().parse()?;
    let count: Option<u64> = matches
        .value_of("count")
        .map(str::parse::<u64>)
        .transpose()?;
    let format = matches.value_of("format").unwrap_or("table");

    // Bind first so no packet of the new session is missed
    let socket = UdpSocket::bind(("0.0.0.0", udp_port)).await?;
    let mut stream = connect(host, port).await?;
    if let Some(selector) = matches.value_of("rate") {
        let line = format!("pu{selector}");
        let reply = exchange(&mut stream, &line).await?;
        print_reply(&line, &reply);
    }

    if format == "table" {
        println!("{}", TABLE_TOP.bright_white());
        println!("{}", TABLE_HEADER.bright_white().bold());
        println!("{}", TABLE_RULE.bright_white());
    }

    let mut tracker = SequenceTracker::new();
    let mut buffer = [0u8; TELEMETRY_PACKET_LEN * 4];
    let mut received = 0u64;
    loop {
        if count.is_some_and(|limit| received >= limit) {
            break;
        }
        let len = tokio::select! {
            result = socket.recv(&mut buffer) => result?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let packet = match TelemetryPacket::decode(&buffer[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                eprintln!("{} {}", "Discarded datagram:".yellow(), e);
                continue;
            }
        };
        received += 1;

        let missing = tracker.observe(packet.sequence);
        if missing > 0 {
            eprintln!(
                "{} {} packet(s) lost before #{}",
                "⚠".yellow(),
                missing,
                packet.sequence
            );
        }
        print_packet(&packet, format);
    }

    if format == "table" {
        println!("{}", TABLE_BOTTOM.bright_white());
    }

    let reply = exchange(&mut stream, "q").await?;
    print_reply("q", &reply);

    let stats = tracker.stats();
    println!(
        "{} {} received, {} lost in {} gap(s), {} duplicate(s)",
        "Summary:".bright_blue().bold(),
        stats.received.to_string().bright_white(),
        stats.lost.to_string().bright_white(),
        stats.gaps,
        stats.duplicates
    );
    Ok(())
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, Box<dyn std::error::Error>> {
    match TcpStream::connect((host, port)).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to {}:{}", "❌".red(), host, port);
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!(
                    "{} Server is not running, or another client holds the session",
                    "💡".yellow()
                );
            } else {
                eprintln!(
                    "{} Network error: {}",
                    "🔌".yellow(),
                    e.to_string().bright_red()
                );
            }
            Err(e.into())
        }
    }
}

/// Send one command in a single write and collect the reply.
///
/// The server answers on its next telemetry tick, so the first byte can take up
/// to one tick period at the slowest rate.
async fn exchange(
    stream: &mut TcpStream,
    line: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut request = Vec::with_capacity(line.len() + 2);
    request.extend_from_slice(line.as_bytes());
    request.extend_from_slice(b"\r\n");
    stream.write_all(&request).await?;

    let mut reply = Vec::new();
    let mut buffer = [0u8; 512];
    let mut wait = REPLY_TIMEOUT;
    loop {
        match tokio::time::timeout(wait, stream.read(&mut buffer)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(len)) => {
                reply.extend_from_slice(&buffer[..len]);
                wait = REPLY_SETTLE;
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) if reply.is_empty() => {
                eprintln!("{} No reply within {:?}", "⏰".yellow(), REPLY_TIMEOUT);
                return Err("reply timeout".into());
            }
            Err(_) => break,
        }
    }
    Ok(String::from_utf8_lossy(&reply).into_owned())
}

fn print_reply(line: &str, reply: &str) {
    match reply.trim_end() {
        "!" => println!(
            "{} {}",
            "✅".green(),
            format!("{line} acknowledged").bright_green()
        ),
        "?" => println!("{} {}", "❌".red(), format!("{line} rejected").bright_red()),
        text => println!("{}", text.bright_white()),
    }
}

fn print_packet(packet: &TelemetryPacket, format: &str) {
    let [a0, a1, a2, a3] = packet.analog_inputs;
    match format {
        "json" => match serde_json::to_string(packet) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("{} {}", "Serialization failed:".red(), e),
        },
        "compact" => println!(
            "#{} out={:03b} in={:04b} analog={},{},{},{}",
            packet.sequence,
            packet.digital_outputs,
            packet.digital_inputs,
            a0,
            a1,
            a2,
            a3
        ),
        _ => println!(
            "│ {:>5} │  {:03b}   │  {:04b}  │ {:>5} │ {:>5} │ {:>5} │ {:>5} │",
            packet.sequence,
            packet.digital_outputs,
            packet.digital_inputs,
            a0,
            a1,
            a2,
            a3
        ),
    }
}
