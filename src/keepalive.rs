//! Periodic self-ping that keeps free-tier hosts from idling the service out

use crate::proxy::HEALTH_CHECK_PATH;
use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Base unit of the randomized ping interval
const INTERVAL_UNIT: Duration = Duration::from_secs(30);

/// Largest multiple of [`INTERVAL_UNIT`] between two pings
const MAX_INTERVAL_UNITS: u32 = 15;

/// Random delay before the next ping: between 30 s and 7.5 min, in 30 s steps
pub fn next_interval<R: Rng>(rng: &mut R) -> Duration {
    INTERVAL_UNIT * rng.gen_range(1..=MAX_INTERVAL_UNITS)
}

/// URL of the health endpoint as seen from outside
pub fn ping_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}{}", host, HEALTH_CHECK_PATH)
    } else {
        format!("https://{}{}", host, HEALTH_CHECK_PATH)
    }
}

/// Ping `host` until shutdown is signalled
pub async fn keepalive_loop(host: String, mut shutdown_rx: watch::Receiver<bool>) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Failed to create keepalive client, keepalive disabled");
            return;
        }
    };
    let url = ping_url(&host);
    info!(url = %url, "Keepalive enabled");

    // First ping right away, then at random intervals
    let mut delay = Duration::ZERO;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        }

        tokio::select! {
            _ = ping(&client, &url) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }

        delay = next_interval(&mut rand::thread_rng());
        debug!(delay_secs = delay.as_secs(), "Next keepalive ping scheduled");
    }

    debug!("Keepalive stopped");
}

async fn ping(client: &reqwest::Client, url: &str) {
    match client.get(url).send().await {
        Ok(response) if response.status() == reqwest::StatusCode::NO_CONTENT => {
            debug!(url = %url, "Keepalive ping succeeded");
        }
        Ok(response) => {
            warn!(url = %url, status = %response.status(), "Keepalive ping returned unexpected status");
        }
        Err(e) => {
            warn!(url = %url, error = %e, "Keepalive ping failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_interval_bounds() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let delay = next_interval(&mut rng);
            assert!(delay >= Duration::from_secs(30));
            assert!(delay <= Duration::from_secs(450));
            assert_eq!(delay.as_secs() % 30, 0);
        }
    }

    #[test]
    fn test_ping_url() {
        assert_eq!(ping_url("app.onrender.com"), "https://app.onrender.com/generate_204");
        assert_eq!(ping_url("http://127.0.0.1:3000/"), "http://127.0.0.1:3000/generate_204");
    }

    #[tokio::test]
    async fn test_first_ping_is_immediate() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(keepalive_loop(format!("http://{}", addr), rx));

        let (mut stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("no immediate ping")
            .unwrap();
        let mut buf = [0u8; 256];
        let n = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("GET /generate_204 HTTP/1.1"));

        // The request is still pending; shutdown must not wait for it
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("keepalive loop did not stop during a pending ping")
            .unwrap();
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(keepalive_loop("127.0.0.1:1".to_string(), rx));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("keepalive loop did not stop")
            .unwrap();
    }
}
