use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::SpeedTestConfig;

/// Raw throughput as measured on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub download_bps: f64,
    pub upload_bps: f64,
}

/// HTTP throughput test: one timed download and one timed upload.
pub struct SpeedTester {
    client: reqwest::Client,
    config: SpeedTestConfig,
}

impl SpeedTester {
    pub fn new(config: SpeedTestConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build speed test client")?;
        Ok(Self { client, config })
    }

    pub async fn measure(&self) -> Result<Throughput> {
        let download_bps = self.download().await?;
        let upload_bps = self.upload().await?;
        debug!("Speed test: {:.0} bit/s down, {:.0} bit/s up", download_bps, upload_bps);
        Ok(Throughput { download_bps, upload_bps })
    }

    async fn download(&self) -> Result<f64> {
        let start = Instant::now();
        let mut response = self
            .client
            .get(&self.config.download_url)
            .send()
            .await
            .context("Download request failed")?
            .error_for_status()
            .context("Download endpoint returned an error")?;

        let mut bytes = 0usize;
        while let Some(chunk) = response.chunk().await.context("Download interrupted")? {
            bytes += chunk.len();
        }
        anyhow::ensure!(bytes > 0, "Download endpoint returned no data");
        Ok(bits_per_second(bytes, start.elapsed()))
    }

    async fn upload(&self) -> Result<f64> {
        let payload = vec![0u8; self.config.upload_bytes];
        let start = Instant::now();
        self.client
            .post(&self.config.upload_url)
            .body(payload)
            .send()
            .await
            .context("Upload request failed")?
            .error_for_status()
            .context("Upload endpoint returned an error")?;
        Ok(bits_per_second(self.config.upload_bytes, start.elapsed()))
    }
}

fn bits_per_second(bytes: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    bytes as f64 * 8.0 / secs
}
