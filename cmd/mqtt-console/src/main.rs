//! mqtt-console - interactive MQTT client for poking at a running mqttsrv.
//!
//! Commands, one per line:
//!   1  connect and subscribe to the console topic, printing what arrives
//!   2  read a line of text, connect and publish it to the console topic

use std::time::Duration;

use clap::Parser;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Topic every console command works on.
const TOPIC: &str = "my/topicc";

/// Interactive MQTT client.
#[derive(Parser, Clone)]
#[command(name = "mqtt-console")]
#[command(about = "Interactive MQTT client: 1 = subscribe, 2 = publish")]
struct Cli {
    /// Broker host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Broker port
    #[arg(long, default_value_t = 1883)]
    port: u16,

    /// Username, for brokers with users configured
    #[arg(short = 'u', long)]
    username: Option<String>,

    /// Password
    #[arg(short = 'p', long, default_value = "")]
    password: String,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,
}

impl Cli {
    fn connect(&self) -> (AsyncClient, EventLoop) {
        let id = format!("mqtt-console-{}", Uuid::new_v4());
        let mut options = MqttOptions::new(id, self.host.clone(), self.port);
        options.set_keep_alive(Duration::from_secs(20));
        if let Some(ref username) = self.username {
            options.set_credentials(username.clone(), self.password.clone());
        }
        AsyncClient::new(options, 10)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    println!(
        "mqtt-console on {}:{} (1 = subscribe, 2 = publish)",
        cli.host, cli.port
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "1" => {
                tokio::spawn(subscribe(cli.clone()));
            }
            "2" => {
                let Some(message) = prompt(&mut lines).await? else {
                    break;
                };
                tokio::spawn(publish(cli.clone(), message));
            }
            "" => {}
            other => println!("unknown command {:?}, use 1 or 2", other),
        }
    }
    Ok(())
}

async fn prompt(lines: &mut Lines<BufReader<Stdin>>) -> anyhow::Result<Option<String>> {
    println!("Type the message to send and press enter");
    Ok(lines.next_line().await?)
}

async fn subscribe(cli: Cli) {
    let (client, mut event_loop) = cli.connect();
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                println!("### CONNECTED WITH SERVER ###");
                if let Err(e) = client.subscribe(TOPIC, QoS::ExactlyOnce).await {
                    warn!("subscribe failed: {}", e);
                    return;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => println!("### SUBSCRIBED ###"),
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                println!("### RECEIVED APPLICATION MESSAGE ###");
                println!("+ Topic = {}", publish.topic);
                println!("+ Payload = {}", String::from_utf8_lossy(&publish.payload));
                println!("+ QoS = {:?}", publish.qos);
                println!("+ Retain = {}", publish.retain);
                println!();
            }
            Ok(event) => debug!("{:?}", event),
            Err(e) => {
                println!("connection lost: {}", e);
                return;
            }
        }
    }
}

async fn publish(cli: Cli, message: String) {
    let (client, mut event_loop) = cli.connect();
    if let Err(e) = client
        .publish(TOPIC, QoS::ExactlyOnce, false, message.into_bytes())
        .await
    {
        println!("publish failed: {}", e);
        return;
    }

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => println!("Connected"),
            Ok(Event::Incoming(Packet::PubComp(_))) => {
                println!("Published");
                break;
            }
            Ok(event) => debug!("{:?}", event),
            Err(e) => {
                println!("publish failed: {}", e);
                return;
            }
        }
    }

    if let Err(e) = client.disconnect().await {
        debug!("disconnect: {}", e);
    }
    // Drive the disconnect out.
    let _ = tokio::time::timeout(Duration::from_secs(1), event_loop.poll()).await;
}
