//! Serial transport reader.
//!
//! Remote units attached over USB/UART print one JSON object per line. The port
//! is opened through `tokio-serial` (behind the `serial` feature); the line loop
//! itself works on any [`AsyncBufRead`], which is how it is tested with
//! `tokio::io::duplex`.

use super::{decode_json_line, sleep_or_shutdown, Backoff, TransportReader};
use crate::communicator::Communicator;
use crate::config::{SerialSettings, TransportSettings};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Reads JSON lines from one serial port into the communicator.
#[derive(Debug)]
pub struct SerialReader {
    name: String,
    settings: SerialSettings,
    backoff: Backoff,
}

impl SerialReader {
    /// Create a reader for the `[serial.<key>]` entry.
    pub fn new(key: &str, settings: SerialSettings, transport: &TransportSettings) -> Self {
        Self {
            name: format!("serial:{key}"),
            settings,
            backoff: Backoff::from_settings(transport),
        }
    }
}

#[async_trait]
impl TransportReader for SerialReader {
    fn name(&self) -> &str {
        &self.name
    }

    #[cfg(feature = "serial")]
    async fn run(
        &mut self,
        sink: Communicator,
        mut shutdown: watch::Receiver<bool>,
    ) -> AppResult<()> {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match open_serial_async(&self.settings.port, self.settings.baudrate, &self.name).await
            {
                Ok(port) => {
                    info!(reader = %self.name, port = %self.settings.port, "serial port open");
                    self.backoff.reset();
                    let reader = tokio::io::BufReader::new(port);
                    match read_lines(&self.name, reader, &sink, &mut shutdown).await {
                        Ok(()) => break,
                        Err(e) => warn!(reader = %self.name, error = %e, "serial connection lost"),
                    }
                }
                Err(e) => warn!(
                    reader = %self.name,
                    error = %e,
                    attempt = self.backoff.attempts() + 1,
                    "failed to open serial port"
                ),
            }
            let delay = self.backoff.next_delay();
            if sleep_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }
        info!(reader = %self.name, "serial reader stopped");
        Ok(())
    }

    #[cfg(not(feature = "serial"))]
    async fn run(&mut self, _sink: Communicator, _shutdown: watch::Receiver<bool>) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("serial".into()))
    }
}

/// Open a serial port without blocking the runtime. Settings are 8N1, no flow
/// control.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    reader_name: &str,
) -> AppResult<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let name = reader_name.to_string();

    tokio::task::spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| DaqError::transport(&name, format!("cannot open {port_path_owned}: {e}")))
    })
    .await
    .map_err(|e| DaqError::transport(reader_name, format!("open task failed: {e}")))?
}

/// Longest accepted line in bytes, newline excluded. The rest of a longer line
/// is skipped up to the next newline.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Feed lines from `reader` into `sink` until shutdown.
///
/// Returns `Ok(())` when shutdown was requested and an error when the stream
/// ends or fails, so the caller can reconnect. Undecodable and oversize lines
/// are logged and skipped.
pub async fn read_lines<R>(
    name: &str,
    mut reader: R,
    sink: &Communicator,
    shutdown: &mut watch::Receiver<bool>,
) -> AppResult<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    // Set while skipping the tail of an oversize line.
    let mut discarding = false;
    loop {
        // Bytes are only consumed after they were copied into `buf`, so
        // dropping `fill_buf` when shutdown wins loses nothing.
        let filled = tokio::select! {
            filled = reader.fill_buf() => filled,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
        };

        let (used, line_done) = {
            let chunk = filled.map_err(|e| DaqError::transport(name, e.to_string()))?;
            if chunk.is_empty() {
                if !discarding && !buf.is_empty() {
                    ingest_line(name, &buf, sink);
                }
                return Err(DaqError::transport(name, "end of stream"));
            }
            let newline = chunk.iter().position(|&b| b == b'\n');
            let used = newline.map_or(chunk.len(), |pos| pos + 1);
            if !discarding {
                buf.extend_from_slice(&chunk[..used]);
            }
            (used, newline.is_some())
        };
        reader.consume(used);

        if !discarding && buf.len() > MAX_LINE_LEN + usize::from(line_done) {
            warn!(
                reader = name,
                bytes = buf.len(),
                limit = MAX_LINE_LEN,
                "discarding oversize line"
            );
            buf.clear();
            discarding = !line_done;
            continue;
        }
        if !line_done {
            continue;
        }
        if discarding {
            discarding = false;
            continue;
        }
        ingest_line(name, &buf, sink);
        buf.clear();
    }
}

fn ingest_line(name: &str, bytes: &[u8], sink: &Communicator) {
    let line = String::from_utf8_lossy(bytes);
    debug!(reader = name, line = %line.trim(), "received");
    match decode_json_line(name, &line, Utc::now()) {
        Ok(samples) => {
            for sample in samples {
                sink.ingest(sample);
            }
        }
        Err(e) => warn!(reader = name, error = %e, "error processing incoming data"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::LivenessThresholds;
    use crate::sample::{Address, Value};
    use crate::trim::TrimPolicy;
    use tokio::io::{AsyncWriteExt, BufReader};
    use tracing_test::traced_test;

    fn communicator() -> Communicator {
        Communicator::new(TrimPolicy::new(100, 0.5), LivenessThresholds::default())
    }

    #[tokio::test]
    async fn lines_are_ingested_until_eof() {
        let (mut host, device) = tokio::io::duplex(256);
        let sink = communicator();
        let (_tx, mut rx) = watch::channel(false);

        host.write_all(b"{\"rm2/wind/speed\": 3.5}\n").await.unwrap();
        host.write_all(b"not json\n").await.unwrap();
        host.write_all(b"{\"rm2/wind/speed\": 4}{\"rm2/wind/dir\": 90}\n")
            .await
            .unwrap();
        drop(host);

        let result = read_lines("serial:test", BufReader::new(device), &sink, &mut rx).await;
        assert!(matches!(result, Err(DaqError::Transport { .. })));

        let speed = sink.history(&Address::parse("rm2/wind/speed").unwrap());
        assert_eq!(speed.len(), 2);
        assert_eq!(speed[1].value, Value::Int(4));
        let snapshot = sink.snapshot();
        assert_eq!(snapshot.value("rm2/wind/dir"), Some(&Value::Int(90)));
    }

    #[tokio::test]
    #[traced_test]
    async fn oversize_line_is_skipped() {
        let (mut host, device) = tokio::io::duplex(1024);
        let sink = communicator();
        let (_tx, mut rx) = watch::channel(false);

        let writer = tokio::spawn(async move {
            let padding = "x".repeat(MAX_LINE_LEN);
            let oversize = format!("{{\"rm2/wind/dir\": \"{padding}\"}}\n");
            host.write_all(oversize.as_bytes()).await.unwrap();
            host.write_all(b"{\"rm2/wind/speed\": 5}\n").await.unwrap();
        });

        let result = read_lines("serial:test", BufReader::new(device), &sink, &mut rx).await;
        writer.await.unwrap();
        assert!(matches!(result, Err(DaqError::Transport { .. })));

        let snapshot = sink.snapshot();
        assert_eq!(snapshot.value("rm2/wind/speed"), Some(&Value::Int(5)));
        assert_eq!(snapshot.value("rm2/wind/dir"), None);
        assert!(logs_contain("discarding oversize line"));
    }

    #[tokio::test]
    async fn shutdown_stops_idle_reader() {
        let (_host, device) = tokio::io::duplex(64);
        let sink = communicator();
        let (tx, mut rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            read_lines("serial:test", BufReader::new(device), &sink, &mut rx).await
        });
        tx.send(true).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn partial_line_waits_for_newline() {
        let (mut host, device) = tokio::io::duplex(64);
        let sink = communicator();
        let (tx, mut rx) = watch::channel(false);

        let reader_sink = sink.clone();
        let task = tokio::spawn(async move {
            read_lines("serial:test", BufReader::new(device), &reader_sink, &mut rx).await
        });

        host.write_all(b"{\"rm2/wind/").await.unwrap();
        tokio::task::yield_now().await;
        host.write_all(b"speed\": 7}\n").await.unwrap();

        for _ in 0..100 {
            if !sink.snapshot().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        assert!(task.await.unwrap().is_ok());
        assert_eq!(sink.snapshot().value("rm2/wind/speed"), Some(&Value::Int(7)));
    }

    #[cfg(not(feature = "serial"))]
    #[tokio::test]
    async fn disabled_feature_reports_error() {
        let port = crate::config::SerialSettings {
            port: "/dev/ttyACM0".into(),
            baudrate: 9600,
            topics: vec!["rm2/wind/speed".into()],
            enabled: true,
        };
        let mut reader = SerialReader::new("port1", port, &TransportSettings::default());
        let (_tx, rx) = watch::channel(false);
        let err = reader.run(communicator(), rx).await.unwrap_err();
        assert!(matches!(err, DaqError::FeatureNotEnabled(_)));
    }
}
