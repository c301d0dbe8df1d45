//! Discover proxies and send a request through the best one.

use reqwest_middleware::ClientBuilder;
use slot_racer::sources::ProxySource;
use slot_racer::{ProxyPoolConfig, ProxyPoolMiddleware};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Initializing proxy pool...");

    let config = ProxyPoolConfig::builder()
        // free socks5 lists, one `host:port` per line
        .sources(vec![
            ProxySource::List {
                url: "https://cdn.jsdelivr.net/gh/dpangestuw/Free-Proxy@main/socks5_proxies.txt".to_string(),
                scheme: "socks5".to_string(),
            },
            ProxySource::List {
                url: "https://cdn.jsdelivr.net/gh/proxifly/free-proxy-list@main/proxies/protocols/socks5/data.txt"
                    .to_string(),
                scheme: "socks5".to_string(),
            },
        ])
        .validation_timeout(Duration::from_secs(5))
        .retry_count(2)
        // rate limit for each proxy, lower throughput but fewer bans
        .max_requests_per_second(3.0)
        .build();

    let middleware = ProxyPoolMiddleware::new(config).await?;
    let pool = middleware.pool().clone();

    let client = ClientBuilder::new(reqwest::Client::new()).with(middleware).build();

    println!("Sending request...");
    let response = client.get("https://httpbin.org/ip").send().await?;

    println!("Status: {}", response.status());
    println!("Response: {}", response.text().await?);
    println!("Pool: {:?}", pool.get_stats());

    Ok(())
}
