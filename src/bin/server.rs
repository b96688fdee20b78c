use clap::{App, Arg};
use groundlink::bus::{Message, QUIT};
use groundlink::config::SystemConfig;
use groundlink::server::TmtcServer;
use groundlink::station::Station;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("groundlink-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("📡 Ground station TMTC server")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Station configuration (YAML)")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Override the configured listen address")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Override the configured listen port")
                .takes_value(true)
                .validator(|v| v.parse::<u16>().map(drop).map_err(|_| "Port must be a number".to_string())),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log at debug level unless RUST_LOG is set"),
        )
        .get_matches();

    let default_level = if matches.is_present("verbose") { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let mut config = SystemConfig::load(matches.value_of("config").unwrap_or_default())?;
    if let Some(host) = matches.value_of("host") {
        config.server.host = host.to_string();
    }
    if let Some(port) = matches.value_of("port") {
        config.server.port = port.parse()?;
    }

    println!("📡 Ground Station TMTC Server");
    println!("=============================");

    let station = match Station::from_config(&config) {
        Ok(station) => station,
        Err(e) => {
            error!("❌ Station startup failed: {}", e);
            return Err(e.into());
        }
    };
    for instrument in station.status().instruments {
        println!("   {} ({}): ✓", instrument.provider, instrument.transport);
    }

    let server = TmtcServer::bind(&config.server.bind_address(), station.bus().clone()).await?;
    let bus = station.bus().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            let _ = tokio::task::spawn_blocking(move || bus.publish(QUIT, Message::Quit)).await;
        }
    });

    server.run().await?;
    station.shutdown()?;
    println!("📡 Ground station stopped");
    Ok(())
}
