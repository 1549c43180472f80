//! Exchange client example for the zero429 crate.
//!
//! Drives a simulated exchange that enforces its own quota and answers with
//! 429 when it is exceeded. Run with `RUST_LOG=zero429=debug` to watch the
//! controller's decisions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;
use zero429::prelude::*;

/// In-process stand-in for an exchange's quota enforcement.
struct SimulatedExchange {
    limit: usize,
    window: Duration,
    accepted: Mutex<VecDeque<Instant>>,
}

enum Response {
    Ok,
    TooManyRequests { retry_after: Duration },
}

impl SimulatedExchange {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            accepted: Mutex::new(VecDeque::new()),
        }
    }

    async fn call(&self) -> Response {
        // Network round trip
        tokio::time::sleep(Duration::from_millis(5)).await;

        let now = Instant::now();
        let mut accepted = self.accepted.lock().unwrap();
        while accepted
            .front()
            .is_some_and(|&at| now.duration_since(at) >= self.window)
        {
            accepted.pop_front();
        }
        if accepted.len() >= self.limit {
            let retry_after = self.window - now.duration_since(accepted[0]);
            return Response::TooManyRequests { retry_after };
        }
        accepted.push_back(now);
        Response::Ok
    }
}

#[tokio::main]
async fn main() -> Result<(), AdmissionError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Exchange Client Example ===\n");

    // Example 1: Burst of orders against a matching quota
    matched_quota_example().await?;

    println!("{}", "\n".to_owned() + "=".repeat(50).as_str() + "\n");

    // Example 2: Exchange stricter than configured
    stricter_exchange_example().await?;

    Ok(())
}

async fn run_orders(
    controller: &AdmissionController,
    exchange: &Arc<SimulatedExchange>,
    count: usize,
) -> (usize, usize) {
    let mut tasks = Vec::with_capacity(count);
    for _ in 0..count {
        let controller = controller.clone();
        let exchange = Arc::clone(exchange);
        tasks.push(tokio::spawn(async move {
            if controller.acquire("/private/v1/order", "POST").await.is_err() {
                return false;
            }
            match exchange.call().await {
                Response::Ok => {
                    controller.commit("/private/v1/order", "POST");
                    true
                }
                Response::TooManyRequests { retry_after } => {
                    controller.notify_rejection(
                        "/private/v1/order",
                        "POST",
                        Some(RejectionHint::retry_after(retry_after)),
                    );
                    false
                }
            }
        }));
    }

    let mut accepted = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await {
            Ok(true) => accepted += 1,
            _ => rejected += 1,
        }
    }
    (accepted, rejected)
}

async fn matched_quota_example() -> Result<(), AdmissionError> {
    println!("1. Matched Quota:");

    let controller = ControllerBuilder::new()
        .group(GroupConfig::per_second(RateLimitGroup::PrivateOrder, 10.0))
        .try_build()?;
    controller.start();
    let exchange = Arc::new(SimulatedExchange::new(10, Duration::from_secs(1)));

    let started = Instant::now();
    let (accepted, rejected) = run_orders(&controller, &exchange, 25).await;

    println!("   25 orders in {:?}", started.elapsed());
    println!("   Results: {} accepted, {} rejected", accepted, rejected);

    let status = controller.get_status();
    println!("   Health status: {}", status.health_status());
    controller.shutdown().await;
    Ok(())
}

async fn stricter_exchange_example() -> Result<(), AdmissionError> {
    println!("2. Exchange Stricter Than Configured:");

    // Configured for 10/s, the exchange only takes 6 per second
    let controller = ControllerBuilder::new()
        .group(GroupConfig::per_second(RateLimitGroup::PrivateOrder, 10.0).with_burst_capacity(5))
        .default_timeout(Duration::from_secs(20))
        .try_build()?;
    controller.start();
    let exchange = Arc::new(SimulatedExchange::new(6, Duration::from_secs(1)));

    let (accepted, rejected) = run_orders(&controller, &exchange, 40).await;
    println!("   Results: {} accepted, {} rejected", accepted, rejected);

    let status = controller.get_status();
    if let Some(order) = status.group(RateLimitGroup::PrivateOrder) {
        println!(
            "   Rate now {:.2}/s (ratio {:.2}), recovery in {:?}",
            order.effective_rate, order.rate_ratio, order.next_recovery_in
        );
    }

    let health = status.health_status();
    println!("   Health status: {}", health);
    println!("   Suggested action: {}", health.suggested_action());

    println!("\n{}", status.summary());
    controller.shutdown().await;
    Ok(())
}
