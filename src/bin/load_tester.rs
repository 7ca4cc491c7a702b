use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::time;

#[derive(Parser, Debug)]
#[command(author, version, about = "Publishes synthetic sensor readings for exercising mqtt-logger")]
struct Args {
    /// MQTT Broker Host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// MQTT Broker Port
    #[arg(long, default_value_t = 1883)]
    port: u16,

    /// Number of simulated sensors; each publishes to sensors/<n>/temp
    #[arg(long, default_value_t = 4)]
    sensors: u32,

    /// Messages per second across all sensors
    #[arg(long, default_value_t = 10)]
    rate: u64,

    /// Duration of test in seconds (0 for infinite)
    #[arg(long, default_value_t = 60)]
    duration: u64,

    /// QoS for every publish (0, 1 or 2)
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    qos: u8,
}

#[derive(Serialize)]
struct Reading {
    timestamp: i64,
    data: f64,
}

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    anyhow::ensure!(args.rate > 0, "--rate must be at least 1");
    anyhow::ensure!(args.sensors > 0, "--sensors must be at least 1");
    println!("Starting Load Tester with config: {:?}", args);

    let client_id = format!("load_tester_{}", uuid::Uuid::new_v4());
    let mut mqttoptions = MqttOptions::new(client_id, &args.host, args.port);
    mqttoptions.set_keep_alive(Duration::from_secs(5));
    mqttoptions.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

    // The event loop must be polled for anything to reach the broker.
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                eprintln!("Connection error: {:?}", e);
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    let start_time = std::time::Instant::now();
    let mut interval = time::interval(Duration::from_micros(1_000_000 / args.rate));
    let mut total_sent: u64 = 0;
    let qos = qos(args.qos);

    loop {
        interval.tick().await;

        if args.duration > 0 && start_time.elapsed().as_secs() >= args.duration {
            println!("Configured duration {}s elapsed. Stopping.", args.duration);
            break;
        }

        let sensor = total_sent % args.sensors as u64 + 1;
        let reading = Reading {
            timestamp: ::time::OffsetDateTime::now_utc().unix_timestamp(),
            data: rand::thread_rng().gen_range(15.0..30.0),
        };
        let topic = format!("sensors/{}/temp", sensor);

        if let Err(e) = client.publish(&topic, qos, false, serde_json::to_vec(&reading)?).await {
            eprintln!("Failed to publish: {:?}", e);
        }

        total_sent += 1;
        if total_sent % args.rate == 0 {
            println!("Sent {} messages...", total_sent);
        }
    }

    // Give in-flight QoS 1/2 publishes a moment to complete.
    time::sleep(Duration::from_millis(500)).await;
    client.disconnect().await.ok();
    println!("Load Test Complete. Total messages sent: {}", total_sent);
    Ok(())
}
