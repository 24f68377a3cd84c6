use super::multipart::MultipartEnvelope;
use super::transport::{TransferTransport, UploadBody};
use super::{Direction, ThroughputError, ThroughputResult, ThroughputSettings};
use crate::resources::{ProcessSelector, ResourceSampler, ResourceTargets};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// In-memory pipe between the upload producer and the transport.
const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Clone)]
pub struct ThroughputRunner {
    transport: Arc<dyn TransferTransport>,
    sampler: ResourceSampler,
    targets: ResourceTargets,
    settings: ThroughputSettings,
}

impl ThroughputRunner {
    pub fn new(
        transport: Arc<dyn TransferTransport>,
        sampler: ResourceSampler,
        targets: ResourceTargets,
        settings: ThroughputSettings,
    ) -> Result<Self, ThroughputError> {
        settings.validate()?;
        Ok(Self {
            transport,
            sampler,
            targets,
            settings,
        })
    }

    pub fn settings(&self) -> &ThroughputSettings {
        &self.settings
    }

    pub async fn download(&self) -> Result<ThroughputResult, ThroughputError> {
        self.run_direction(Direction::Rx).await
    }

    pub async fn upload(&self) -> Result<ThroughputResult, ThroughputError> {
        self.run_direction(Direction::Tx).await
    }

    /// Download, then upload. The first failure stops the sequence.
    pub async fn half_duplex(&self) -> Result<(ThroughputResult, ThroughputResult), ThroughputError> {
        let rx = self.download().await?;
        let tx = self.upload().await?;
        Ok((rx, tx))
    }

    /// Both directions at once.
    ///
    /// Errors are drained before results: if either direction fails the
    /// whole invocation fails and no partial result is returned.
    pub async fn full_duplex(&self) -> Result<(ThroughputResult, ThroughputResult), ThroughputError> {
        let (result_tx, mut result_rx) = mpsc::channel::<ThroughputResult>(2);
        let (error_tx, mut error_rx) = mpsc::channel::<ThroughputError>(2);

        let mut handles = Vec::with_capacity(2);
        for direction in [Direction::RxFullDuplex, Direction::TxFullDuplex] {
            let runner = self.clone();
            let result_tx = result_tx.clone();
            let error_tx = error_tx.clone();
            let handle = tokio::spawn(async move {
                let limit = runner.settings.transfer_timeout;
                let outcome = match tokio::time::timeout(limit, runner.run_direction(direction)).await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ThroughputError::Timeout {
                        direction,
                        after: limit,
                    }),
                };
                // Sends only fail if the caller went away.
                match outcome {
                    Ok(result) => {
                        let _ = result_tx.send(result).await;
                    }
                    Err(e) => {
                        let _ = error_tx.send(e).await;
                    }
                }
            });
            handles.push((direction, handle));
        }
        drop(result_tx);

        // Supervisor: barrier over both directions, then the last senders go
        // away and both channels close.
        tokio::spawn(async move {
            for (direction, handle) in handles {
                if let Err(e) = handle.await {
                    let _ = error_tx
                        .send(ThroughputError::TaskFailed {
                            direction,
                            reason: e.to_string(),
                        })
                        .await;
                }
            }
        });

        let mut first_error = None;
        while let Some(e) = error_rx.recv().await {
            error!(error = %e, "full-duplex direction failed");
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let mut rx = None;
        let mut tx = None;
        while let Some(result) = result_rx.recv().await {
            if result.direction.is_download() {
                rx = Some(result);
            } else {
                tx = Some(result);
            }
        }

        match (rx, tx) {
            (Some(rx), Some(tx)) => Ok((rx, tx)),
            _ => Err(ThroughputError::Transport(
                "full-duplex run ended without both results".into(),
            )),
        }
    }

    /// One direction with resource sampling around it.
    async fn run_direction(&self, direction: Direction) -> Result<ThroughputResult, ThroughputError> {
        let monitor = (!self.targets.process_names.is_empty()).then(|| {
            self.sampler.monitor_continuously(
                self.targets.process_names.clone(),
                self.settings.monitor_window,
                self.settings.monitor_interval,
            )
        });

        let transfer = if direction.is_download() {
            self.receive().await
        } else {
            self.send().await
        };

        let (bytes_transferred, duration) = match transfer {
            Ok(measured) => measured,
            Err(e) => {
                if let Some(monitor) = monitor {
                    monitor.abort();
                }
                return Err(e);
            }
        };

        let local = match self.targets.pid {
            Some(pid) => Some(self.sampler.sample_once(ProcessSelector::Pid(pid)).await),
            None => None,
        };
        let process_usage = match monitor {
            Some(monitor) => Some(monitor.join().await),
            None => None,
        };

        let result = ThroughputResult {
            direction,
            bytes_transferred,
            duration,
            local,
            process_usage,
        };

        info!(
            %direction,
            transport = self.transport.label(),
            bytes = result.bytes_transferred,
            duration_ms = result.duration.as_millis() as u64,
            mbytes_per_sec = result.bytes_per_second() / 1e6,
            "transfer complete"
        );

        Ok(result)
    }

    /// Read until the configured total arrives or the stream ends.
    async fn receive(&self) -> Result<(u64, std::time::Duration), ThroughputError> {
        let total = self.settings.total_bytes;
        let mut buf = vec![0u8; self.settings.chunk_bytes];
        let mut remaining = total;

        let start = Instant::now();
        let mut reader = self.transport.download(total).await?;
        while remaining > 0 {
            let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
            match reader.read(&mut buf[..want]).await {
                Ok(0) => break,
                Ok(n) => remaining -= n as u64,
                Err(e) => {
                    warn!(error = %e, received = total - remaining, "download stream interrupted");
                    break;
                }
            }
        }
        let duration = start.elapsed();

        if remaining > 0 {
            warn!(expected = total, received = total - remaining, "download ended short");
        }
        Ok((total - remaining, duration))
    }

    /// Stream the configured total through a bounded pipe as a multipart
    /// body.
    async fn send(&self) -> Result<(u64, std::time::Duration), ThroughputError> {
        let total = self.settings.total_bytes;
        let envelope = MultipartEnvelope::new();
        let content_length = envelope.content_length(total);
        let content_type = envelope.content_type();

        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let producer = tokio::spawn(produce_body(
            writer,
            envelope,
            total,
            self.settings.chunk_bytes,
        ));

        let start = Instant::now();
        let uploaded = self
            .transport
            .upload(UploadBody {
                reader: Box::new(reader),
                content_length,
                content_type,
            })
            .await;
        let duration = start.elapsed();

        let written = match producer.await {
            Ok(written) => written,
            Err(e) => {
                return Err(ThroughputError::TaskFailed {
                    direction: Direction::Tx,
                    reason: e.to_string(),
                })
            }
        };

        uploaded?;
        Ok((written?, duration))
    }
}

/// Write header, `total` zero bytes in `chunk`-sized writes, then the
/// trailer. Returns the payload bytes written.
async fn produce_body(
    mut pipe: DuplexStream,
    envelope: MultipartEnvelope,
    total: u64,
    chunk: usize,
) -> std::io::Result<u64> {
    pipe.write_all(envelope.header()).await?;

    let zeros = vec![0u8; chunk];
    let mut written = 0u64;
    while written < total {
        let n = zeros
            .len()
            .min(usize::try_from(total - written).unwrap_or(usize::MAX));
        pipe.write_all(&zeros[..n]).await?;
        written += n as u64;
    }

    pipe.write_all(envelope.trailer()).await?;
    pipe.shutdown().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throughput::transport::BoxedReader;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio_util::io::StreamReader;

    const GIGABYTE_PER_SEC: f64 = 1.0e9;

    /// In-process peer that moves bytes at a fixed simulated bandwidth.
    struct LoopbackTransport {
        bytes_per_sec: f64,
        fail_download: bool,
        hang_upload: bool,
    }

    impl LoopbackTransport {
        fn new() -> Self {
            Self {
                bytes_per_sec: GIGABYTE_PER_SEC,
                fail_download: false,
                hang_upload: false,
            }
        }

        fn deadline(&self, start: tokio::time::Instant, bytes: u64) -> tokio::time::Instant {
            start + Duration::from_secs_f64(bytes as f64 / self.bytes_per_sec)
        }
    }

    #[async_trait::async_trait]
    impl TransferTransport for LoopbackTransport {
        fn label(&self) -> &str {
            "loopback"
        }

        async fn download(&self, total_bytes: u64) -> Result<BoxedReader, ThroughputError> {
            if self.fail_download {
                return Err(ThroughputError::Transport("peer refused download".into()));
            }
            let chunk = Bytes::from(vec![0u8; 1_000_000]);
            let start = tokio::time::Instant::now();
            let bytes_per_sec = self.bytes_per_sec;
            let stream = futures::stream::unfold(0u64, move |sent| {
                let chunk = chunk.clone();
                async move {
                    if sent >= total_bytes {
                        return None;
                    }
                    let n = chunk.len().min((total_bytes - sent) as usize);
                    let sent = sent + n as u64;
                    tokio::time::sleep_until(
                        start + Duration::from_secs_f64(sent as f64 / bytes_per_sec),
                    )
                    .await;
                    Some((Ok::<_, std::io::Error>(chunk.slice(..n)), sent))
                }
            });
            Ok(Box::new(StreamReader::new(Box::pin(stream))))
        }

        async fn upload(&self, mut body: UploadBody) -> Result<(), ThroughputError> {
            if self.hang_upload {
                std::future::pending::<()>().await;
            }
            let start = tokio::time::Instant::now();
            let mut buf = vec![0u8; 1 << 20];
            let mut received = 0u64;
            loop {
                let n = body.reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                received += n as u64;
                tokio::time::sleep_until(self.deadline(start, received)).await;
            }
            if received != body.content_length {
                return Err(ThroughputError::Transport(format!(
                    "content length {} but received {}",
                    body.content_length, received
                )));
            }
            Ok(())
        }
    }

    fn runner(transport: LoopbackTransport, settings: ThroughputSettings) -> ThroughputRunner {
        ThroughputRunner::new(
            Arc::new(transport),
            ResourceSampler::sysinfo(),
            ResourceTargets::none(),
            settings,
        )
        .unwrap()
    }

    fn assert_about_1000_mbytes_per_sec(result: &ThroughputResult) {
        let mbs = result.bytes_per_second() / 1e6;
        assert!(
            (400.0..=1050.0).contains(&mbs),
            "{} ran at {:.1} MB/s over {:?}",
            result.direction,
            mbs,
            result.duration
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_download_moves_exact_total_at_simulated_rate() {
        let r = runner(LoopbackTransport::new(), ThroughputSettings::default());
        let result = r.download().await.unwrap();
        assert_eq!(result.direction, Direction::Rx);
        assert_eq!(result.bytes_transferred, 100_000_000);
        assert_about_1000_mbytes_per_sec(&result);
        assert!(result.local.is_none());
        assert!(result.process_usage.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_upload_moves_exact_total_at_simulated_rate() {
        let r = runner(LoopbackTransport::new(), ThroughputSettings::default());
        let result = r.upload().await.unwrap();
        assert_eq!(result.direction, Direction::Tx);
        assert_eq!(result.bytes_transferred, 100_000_000);
        assert_about_1000_mbytes_per_sec(&result);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_half_duplex_runs_download_then_upload() {
        let settings = ThroughputSettings {
            total_bytes: 5_000_000,
            chunk_bytes: 1_000_000,
            ..Default::default()
        };
        let (rx, tx) = runner(LoopbackTransport::new(), settings)
            .half_duplex()
            .await
            .unwrap();
        assert_eq!(rx.direction, Direction::Rx);
        assert_eq!(tx.direction, Direction::Tx);
        assert_eq!(rx.bytes_transferred, 5_000_000);
        assert_eq!(tx.bytes_transferred, 5_000_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_duplex_reports_both_directions() {
        let settings = ThroughputSettings {
            total_bytes: 20_000_000,
            chunk_bytes: 1_000_000,
            ..Default::default()
        };
        let (rx, tx) = runner(LoopbackTransport::new(), settings)
            .full_duplex()
            .await
            .unwrap();
        assert_eq!(rx.direction, Direction::RxFullDuplex);
        assert_eq!(tx.direction, Direction::TxFullDuplex);
        assert_eq!(rx.bytes_transferred, 20_000_000);
        assert_eq!(tx.bytes_transferred, 20_000_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_duplex_failure_suppresses_results() {
        let transport = LoopbackTransport {
            fail_download: true,
            ..LoopbackTransport::new()
        };
        let settings = ThroughputSettings {
            total_bytes: 1_000_000,
            chunk_bytes: 100_000,
            ..Default::default()
        };
        let err = runner(transport, settings).full_duplex().await.unwrap_err();
        assert!(matches!(err, ThroughputError::Transport(_)), "{err}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_duplex_is_bounded_by_timeout() {
        let transport = LoopbackTransport {
            hang_upload: true,
            ..LoopbackTransport::new()
        };
        let settings = ThroughputSettings {
            total_bytes: 1_000_000,
            chunk_bytes: 100_000,
            transfer_timeout: Duration::from_millis(200),
            ..Default::default()
        };

        let start = Instant::now();
        let err = runner(transport, settings).full_duplex().await.unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            err,
            ThroughputError::Timeout {
                direction: Direction::TxFullDuplex,
                ..
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_timed_out_full_duplex_stops_its_monitors() {
        use crate::resources::{ProcessStatProvider, ProcessUsageSample, SamplingError};
        use std::sync::atomic::{AtomicU64, Ordering};

        struct CountingProvider {
            calls: AtomicU64,
        }

        impl ProcessStatProvider for CountingProvider {
            fn sample(
                &self,
                selector: &ProcessSelector,
            ) -> Result<ProcessUsageSample, SamplingError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(ProcessUsageSample {
                    process_name: selector.label(),
                    cpu_fraction: 0.1,
                    ram_bytes: 1,
                    process_count: 1,
                })
            }
        }

        let provider = Arc::new(CountingProvider {
            calls: AtomicU64::new(0),
        });
        let transport = LoopbackTransport {
            hang_upload: true,
            ..LoopbackTransport::new()
        };
        let settings = ThroughputSettings {
            total_bytes: 1_000_000,
            chunk_bytes: 100_000,
            transfer_timeout: Duration::from_millis(200),
            monitor_window: Duration::from_secs(10),
            monitor_interval: Duration::from_millis(5),
        };
        let r = ThroughputRunner::new(
            Arc::new(transport),
            ResourceSampler::new(provider.clone()),
            ResourceTargets {
                pid: None,
                process_names: vec!["reflector".to_string()],
            },
            settings,
        )
        .unwrap();

        let err = r.full_duplex().await.unwrap_err();
        assert!(matches!(err, ThroughputError::Timeout { .. }), "{err}");
        assert!(provider.calls.load(Ordering::SeqCst) > 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = provider.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn test_short_download_reports_what_arrived() {
        struct ShortTransport;

        #[async_trait::async_trait]
        impl TransferTransport for ShortTransport {
            fn label(&self) -> &str {
                "short"
            }

            async fn download(&self, _: u64) -> Result<BoxedReader, ThroughputError> {
                Ok(Box::new(std::io::Cursor::new(vec![1u8; 1234])))
            }

            async fn upload(&self, _: UploadBody) -> Result<(), ThroughputError> {
                Ok(())
            }
        }

        let r = ThroughputRunner::new(
            Arc::new(ShortTransport),
            ResourceSampler::sysinfo(),
            ResourceTargets::none(),
            ThroughputSettings::default(),
        )
        .unwrap();
        let result = r.download().await.unwrap();
        assert_eq!(result.bytes_transferred, 1234);
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let settings = ThroughputSettings {
            total_bytes: 0,
            ..Default::default()
        };
        let result = ThroughputRunner::new(
            Arc::new(LoopbackTransport::new()),
            ResourceSampler::sysinfo(),
            ResourceTargets::none(),
            settings,
        );
        assert!(matches!(result, Err(ThroughputError::InvalidSettings(_))));
    }
}
