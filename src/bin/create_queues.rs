use anyhow::Result;
use std::sync::Arc;

use core_ledger_outbox::infrastructure::config::QueueNames;
use core_ledger_outbox::infrastructure::kafka_dlq::dlq_name;
use core_ledger_outbox::infrastructure::{KafkaConfig, KafkaConnection};

/// Declares every configured queue and its dead-letter queue.
#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = KafkaConfig::from_env();
    let queues = QueueNames::from_env();
    println!("Declaring queues on {}", config.bootstrap_servers);

    let connection = Arc::new(KafkaConnection::new(config));
    let mut failures = 0;
    for queue in queues.all() {
        for name in [queue.to_string(), dlq_name(queue)] {
            match connection.declare_queue(&name).await {
                Ok(()) => println!("Declared queue: {}", name),
                Err(e) => {
                    failures += 1;
                    println!("Failed to declare queue {}: {}", name, e);
                }
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} queue declarations failed", failures);
    }
    Ok(())
}
