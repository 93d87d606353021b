//! # Calibration Listener
//!
//! Operator command inbox.
//!
//! Lines arrive from a blocking reader thread over a channel. `CAL<n>`
//! stores a request for channel `n` in the shared slot; numeric lines are
//! forwarded to the sampling loop while a calibration is pending. The
//! listener never touches the measurement table itself.

use std::io::BufRead;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownFlag;
use crate::state::SharedState;

/// Capacity of the operator line and point channels
pub const INPUT_QUEUE_DEPTH: usize = 64;

/// One parsed operator line
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatorInput {
    /// `CAL<n>`: recalibrate channel `n`
    Calibrate(usize),
    /// A bare number: point count or ground-truth value
    Value(f64),
}

impl FromStr for OperatorInput {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        if line.len() > 3 && line.is_char_boundary(3) && line[..3].eq_ignore_ascii_case("CAL") {
            return line[3..]
                .parse::<usize>()
                .map(OperatorInput::Calibrate)
                .map_err(|_| format!("invalid channel in {:?}", line));
        }

        line.parse::<f64>()
            .map(OperatorInput::Value)
            .map_err(|_| format!("unrecognized input {:?}", line))
    }
}

/// Route operator lines until shutdown or until the input closes
///
/// `poll` bounds how long the listener waits for a line before checking
/// the shutdown flag again.
pub async fn run_listener(
    state: Arc<SharedState>,
    mut lines: mpsc::Receiver<String>,
    points: mpsc::Sender<f64>,
    shutdown: ShutdownFlag,
    poll: Duration,
) {
    info!("Calibration listener started (type CAL<n> to calibrate channel n)");

    while !shutdown.is_requested() {
        let line = tokio::select! {
            line = lines.recv() => line,
            _ = tokio::time::sleep(poll) => continue,
        };

        let Some(line) = line else {
            info!("Operator input closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<OperatorInput>() {
            Ok(OperatorInput::Calibrate(channel)) => {
                if state.request_calibration(channel) {
                    info!("Calibration requested for channel {}", channel);
                } else {
                    warn!(
                        "Calibration already pending for channel {:?}, ignoring CAL{}",
                        state.pending_calibration(),
                        channel
                    );
                }
            }
            Ok(OperatorInput::Value(value)) => {
                if state.pending_calibration().is_none() {
                    warn!("No calibration pending, discarding {}", value);
                    continue;
                }
                if let Err(e) = points.try_send(value) {
                    warn!("Calibration input dropped: {}", e);
                }
            }
            Err(e) => warn!("{}", e),
        }
    }

    info!("Calibration listener stopped");
}

/// Read standard input line by line on a dedicated thread
///
/// The read blocks indefinitely, so the thread is detached: it ends when
/// stdin closes or when the receiving side is dropped at shutdown.
///
/// # Errors
///
/// Returns an I/O error if the thread cannot be spawned.
pub fn spawn_stdin_reader(tx: mpsc::Sender<String>) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("operator-input".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
            debug!("Operator input reader finished");
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::MeasurementSetting;

    fn state() -> Arc<SharedState> {
        Arc::new(SharedState::new(vec![MeasurementSetting::inactive(); 2]))
    }

    #[test]
    fn test_parse_operator_input() {
        assert_eq!("CAL1".parse::<OperatorInput>(), Ok(OperatorInput::Calibrate(1)));
        assert_eq!(" cal3 ".parse::<OperatorInput>(), Ok(OperatorInput::Calibrate(3)));
        assert_eq!("12.5".parse::<OperatorInput>(), Ok(OperatorInput::Value(12.5)));
        assert_eq!("-3".parse::<OperatorInput>(), Ok(OperatorInput::Value(-3.0)));
        assert!("CALx".parse::<OperatorInput>().is_err());
        assert!("CAL".parse::<OperatorInput>().is_err());
        assert!("hello".parse::<OperatorInput>().is_err());
    }

    #[tokio::test]
    async fn test_listener_routes_commands_and_values() {
        let state = state();
        let (line_tx, line_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let (point_tx, mut point_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);

        // Value before any request is discarded
        line_tx.send("7".to_string()).await.unwrap();
        line_tx.send("CAL1".to_string()).await.unwrap();
        line_tx.send("CAL0".to_string()).await.unwrap();
        line_tx.send("3".to_string()).await.unwrap();
        line_tx.send("nonsense".to_string()).await.unwrap();
        drop(line_tx);

        run_listener(
            Arc::clone(&state),
            line_rx,
            point_tx,
            ShutdownFlag::new(),
            Duration::from_millis(10),
        )
        .await;

        assert_eq!(state.pending_calibration(), Some(1));
        assert_eq!(point_rx.recv().await, Some(3.0));
        assert!(point_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_listener_stops_on_shutdown() {
        let (_line_tx, line_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let (point_tx, _point_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let shutdown = ShutdownFlag::new();

        let listener = tokio::spawn(run_listener(
            state(),
            line_rx,
            point_tx,
            shutdown.clone(),
            Duration::from_millis(10),
        ));
        shutdown.request();

        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .unwrap()
            .unwrap();
    }
}
