use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use groundlink::config::{DEFAULT_HOST, DEFAULT_PORT};
use groundlink::translator::LINE_TERMINATOR;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct Reply<'a> {
    ok: bool,
    id: &'a str,
    fields: Vec<&'a str>,
}

/// Splits `> OK id;a;b` / `> ERROR id message` into its parts.
fn parse_reply(line: &str) -> Option<Reply<'_>> {
    let body = line.trim_end().strip_prefix("> ")?;
    if let Some(rest) = body.strip_prefix("OK ") {
        let rest = rest.strip_prefix("helo ").unwrap_or(rest);
        let mut parts = rest.split(';');
        let id = parts.next()?;
        return Some(Reply { ok: true, id, fields: parts.collect() });
    }
    let rest = body.strip_prefix("ERROR ")?;
    let (id, message) = rest.split_once(' ').unwrap_or((rest, ""));
    Some(Reply { ok: false, id, fields: vec![message] })
}

fn quote(arg: &str) -> String {
    if arg.is_empty() || arg.contains(char::is_whitespace) {
        format!("\"{arg}\"")
    } else {
        arg.to_string()
    }
}

fn build_line(keyword: &str, sub: &ArgMatches) -> String {
    let mut tokens = vec![keyword.to_string()];
    if let Some(id) = sub.value_of("id") {
        tokens.push(id.to_string());
    }
    if let Some(args) = sub.values_of("args") {
        tokens.extend(args.map(quote));
    }
    tokens.join(" ")
}

fn id_arg() -> Arg<'static, 'static> {
    Arg::with_name("id")
        .help("Parameter id, <provider>_<name>")
        .required(true)
}

fn args_arg() -> Arg<'static, 'static> {
    Arg::with_name("args").help("Command arguments").multiple(true)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let default_port = DEFAULT_PORT.to_string();
    let matches = App::new("groundlink")
        .version(env!("CARGO_PKG_VERSION"))
        .about("📡 Ground station TMTC client")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("h")
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
                .help("Server port")
                .takes_value(true)
                .default_value(&default_port)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["text", "json", "raw"])
                .default_value("text")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("helo")
                .about("🏓 Check that the server answers")
                .arg(Arg::with_name("id").help("Echo token").default_value("groundlink")),
        )
        .subcommand(SubCommand::with_name("tc").about("Send a telecommand (set)").arg(id_arg()).arg(args_arg()))
        .subcommand(SubCommand::with_name("tm").about("Request telemetry (get)").arg(id_arg()).arg(args_arg()))
        .subcommand(SubCommand::with_name("tc-meta").about("Describe a telecommand").arg(id_arg()))
        .subcommand(SubCommand::with_name("tm-meta").about("Describe a telemetry parameter").arg(id_arg()))
        .subcommand(
            SubCommand::with_name("connect")
                .about("🔗 Connect an instrument")
                .arg(Arg::with_name("provider").required(true)),
        )
        .subcommand(
            SubCommand::with_name("disconnect")
                .about("🔌 Disconnect an instrument")
                .arg(Arg::with_name("provider").required(true)),
        )
        .subcommand(SubCommand::with_name("monitor").about("📺 Print every telemetry line until interrupted"))
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST).to_string();
    let port: u16 = matches.value_of("port").unwrap_or_default().parse()?;
    let format = matches.value_of("format").unwrap_or("text").to_string();

    let line = match matches.subcommand() {
        ("helo", Some(sub)) => build_line("helo", sub),
        ("tc", Some(sub)) => build_line("tc", sub),
        ("tm", Some(sub)) => build_line("tm", sub),
        ("tc-meta", Some(sub)) => build_line("tc_meta", sub),
        ("tm-meta", Some(sub)) => build_line("tm_meta", sub),
        ("connect", Some(sub)) => format!("tc {}_connect", sub.value_of("provider").unwrap_or_default()),
        ("disconnect", Some(sub)) => format!("tc {}_disconnect", sub.value_of("provider").unwrap_or_default()),
        ("monitor", _) => return monitor(&host, port, &format).await,
        (other, _) => return Err(format!("unknown subcommand '{}'", other).into()),
    };

    let reply = send_line(&host, port, &line).await?;
    print_reply(&reply, &format);
    Ok(())
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to ground station at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Server is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "groundlink-server --config station.yaml".bright_cyan());
            }
            Err(e.into())
        }
    }
}

async fn send_line(host: &str, port: u16, line: &str) -> Result<String, Box<dyn std::error::Error>> {
    let stream = connect(host, port).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    writer.write_all(line.as_bytes()).await?;
    writer.write_all(LINE_TERMINATOR.as_bytes()).await?;

    match tokio::time::timeout(REPLY_TIMEOUT, read_reply(&mut reader, expected_id(line))).await {
        Ok(result) => result,
        Err(_) => {
            eprintln!("{} No reply after {} seconds", "⏰".yellow(), REPLY_TIMEOUT.as_secs());
            Err("Command timeout".into())
        }
    }
}

/// Reads lines until one answers `id`. Broadcast telemetry for other ids
/// shares the connection and is skipped.
async fn read_reply<R>(reader: &mut R, id: &str) -> Result<String, Box<dyn std::error::Error>>
where
    R: AsyncBufRead + Unpin,
{
    let mut reply = String::new();
    loop {
        reply.clear();
        if reader.read_line(&mut reply).await? == 0 {
            return Err("Server closed connection".into());
        }
        if answers(&reply, id) {
            return Ok(reply);
        }
    }
}

/// Id the server echoes back for `line`: the token after the keyword, or
/// the keyword itself for a bare line.
fn expected_id(line: &str) -> &str {
    let mut tokens = line.split_whitespace();
    let first = tokens.next().unwrap_or_default();
    tokens.next().unwrap_or(first)
}

fn answers(line: &str, id: &str) -> bool {
    parse_reply(line).map_or(false, |reply| reply.id == id)
}

async fn monitor(host: &str, port: u16, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let stream = connect(host, port).await?;
    let mut lines = BufReader::new(stream).lines();
    println!("{} Monitoring {}:{} (Ctrl+C to stop)", "📺".cyan(), host, port);
    while let Some(line) = lines.next_line().await? {
        print_reply(&line, format);
    }
    Ok(())
}

fn print_reply(line: &str, format: &str) {
    let line = line.trim_end();
    if format == "raw" {
        println!("{}", line);
        return;
    }
    let Some(reply) = parse_reply(line) else {
        println!("{} {}", "?".yellow(), line);
        return;
    };
    if format == "json" {
        match serde_json::to_string(&reply) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", line),
        }
        return;
    }
    if reply.ok {
        println!("{} {} {}", "✅".green(), reply.id.bright_white(), reply.fields.join(" | ").bright_cyan());
    } else {
        println!("{} {} {}", "❌".red(), reply.id.bright_white(), reply.fields.join(" ").bright_red());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_id_of_sent_line() {
        assert_eq!(expected_id("tc psu_volt 5"), "psu_volt");
        assert_eq!(expected_id("helo operator"), "operator");
        assert_eq!(expected_id("bogus"), "bogus");
    }

    #[test]
    fn test_unrelated_telemetry_is_not_the_reply() {
        assert!(!answers("> OK th_temp;21.5;1760000000.000\r\n", "psu_volt"));
        assert!(answers("> OK psu_volt;5\r\n", "psu_volt"));
        assert!(answers("> ERROR psu_volt Instrument is unreachable\r\n", "psu_volt"));
        assert!(answers("> OK helo operator\r\n", "operator"));
        assert!(!answers("garbage", "psu_volt"));
    }

    #[tokio::test]
    async fn test_read_reply_skips_broadcast_lines() {
        let mut stream: &[u8] = b"> OK th_temp;21.5;1760000000.000\r\n> OK psu_volt;5\r\n";
        let reply = read_reply(&mut stream, "psu_volt").await.unwrap();
        assert_eq!(reply, "> OK psu_volt;5\r\n");

        let mut stream: &[u8] = b"> OK th_temp;21.5;1760000000.000\r\n";
        let err = read_reply(&mut stream, "psu_volt").await.unwrap_err();
        assert_eq!(err.to_string(), "Server closed connection");
    }
}
