//! Interactive calibration: step the meter through a series of drive levels and record where the needle lands.

use std::{
    io::{self, BufRead},
    thread,
    time::Duration,
};

use async_trait::async_trait;
use itertools::Itertools;
use tokio::{
    io::{AsyncWriteExt, Stdout},
    select,
    sync::mpsc,
    time,
};
use tracing::{debug, error, info};

use crate::{
    actuator::Actuator,
    calibration::{CalibrationPoint, CalibrationSet},
    shutdown::Shutdown,
    Error,
};

/// Whoever is watching the dial.
#[async_trait]
pub trait ObservationSource: Send {
    /// Ask for the dial reading with the output at `drive_percent`. `None` means no more input is coming.
    async fn prompt(&mut self, drive_percent: f64) -> crate::Result<Option<String>>;

    /// Tell the operator their last answer was not accepted.
    async fn reject(&mut self, error: &Error) -> crate::Result<()>;
}

/// Prompts on stdout and reads answers from stdin, one per line.
///
/// Lines are read on a thread of their own. A blocking read can't be cancelled, and one left on the runtime's
/// blocking pool would keep the process alive after Ctrl-C until the operator pressed Enter.
pub struct StdinObserver {
    lines: mpsc::Receiver<io::Result<String>>,
    stdout: Stdout,
}

impl StdinObserver {
    pub fn new() -> crate::Result<Self> {
        let (tx, rx) = mpsc::channel(1);
        thread::Builder::new()
            .name("stdin".to_owned())
            .spawn(move || read_lines(io::stdin().lock(), tx))?;

        Ok(Self {
            lines: rx,
            stdout: tokio::io::stdout(),
        })
    }
}

/// Forward lines until input ends or nobody is listening any more.
fn read_lines(input: impl BufRead, tx: mpsc::Sender<io::Result<String>>) {
    for line in input.lines() {
        let failed = line.is_err();
        if tx.blocking_send(line).is_err() || failed {
            break;
        }
    }
    debug!("Stopped reading input");
}

#[async_trait]
impl ObservationSource for StdinObserver {
    async fn prompt(&mut self, drive_percent: f64) -> crate::Result<Option<String>> {
        let prompt = format!("Output at {drive_percent}%. Dial reading (0-100): ");
        self.stdout.write_all(prompt.as_bytes()).await?;
        self.stdout.flush().await?;
        Ok(self.lines.recv().await.transpose()?)
    }

    async fn reject(&mut self, error: &Error) -> crate::Result<()> {
        let message = format!("  {error}, try again\n");
        self.stdout.write_all(message.as_bytes()).await?;
        self.stdout.flush().await?;
        Ok(())
    }
}

/// Walk the actuator through `levels` (ascending drive percentages), pausing `settle` at each, and record the dial
/// reading the operator reports.
///
/// The actuator is always back at zero when this returns. Cancellation through `shutdown` or end of input gives
/// [`Error::Cancelled`].
pub async fn capture<A, O>(
    levels: &[f64],
    settle: Duration,
    actuator: &mut A,
    operator: &mut O,
    shutdown: &mut Shutdown,
) -> crate::Result<CalibrationSet>
where
    A: Actuator,
    O: ObservationSource,
{
    let result = capture_points(levels, settle, actuator, operator, shutdown).await;

    if let Err(error) = actuator.set_drive(0.0) {
        error!(%error, "Failed to return dial to zero");
        if result.is_ok() {
            return Err(error);
        }
    }

    let points = result?;
    info!(points = points.len(), "Calibration captured");
    CalibrationSet::new(
        points,
        true,
        format!(
            "Captured at drive levels {} by {} {}",
            levels.iter().join(", "),
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        ),
    )
}

async fn capture_points<A, O>(
    levels: &[f64],
    settle: Duration,
    actuator: &mut A,
    operator: &mut O,
    shutdown: &mut Shutdown,
) -> crate::Result<Vec<CalibrationPoint>>
where
    A: Actuator,
    O: ObservationSource,
{
    let mut points: Vec<CalibrationPoint> = Vec::with_capacity(levels.len());

    for &level in levels {
        actuator.set_drive(level / 100.0)?;
        debug!(level, ?settle, "Settling");

        select! {
            _ = time::sleep(settle) => {},
            _ = shutdown.recv() => return Err(Error::Cancelled),
        }

        let floor = points.last().map_or(0.0, |point| point.observed_percent);
        let observed = loop {
            let answer = select! {
                answer = operator.prompt(level) => answer?,
                _ = shutdown.recv() => return Err(Error::Cancelled),
            };
            let Some(answer) = answer else {
                return Err(Error::Cancelled);
            };

            match parse_observation(&answer, floor) {
                Ok(observed) => break observed,
                Err(error) => {
                    debug!(%error, "Rejected reading");
                    operator.reject(&error).await?;
                }
            }
        };

        debug!(level, observed, "Recorded point");
        points.push(CalibrationPoint::new(level, observed));
    }

    Ok(points)
}

/// Accept a reading in `floor..=100`.
///
/// Anything below the previous level's reading would mean the needle went backwards as drive increased.
fn parse_observation(input: &str, floor: f64) -> crate::Result<f64> {
    let input = input.trim();
    let value: f64 = input
        .parse()
        .map_err(|_| Error::InputValidation(format!("'{input}' is not a number")))?;

    if !(0.0..=100.0).contains(&value) {
        return Err(Error::InputValidation(format!(
            "{value} is outside 0-100"
        )));
    }
    if value < floor {
        return Err(Error::InputValidation(format!(
            "{value} is below the previous reading of {floor}"
        )));
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingActuator, ScriptedOperator};
    use pretty_assertions::assert_eq;
    use tokio::sync::broadcast;

    const LEVELS: [f64; 5] = [0.0, 25.0, 50.0, 75.0, 100.0];
    const SETTLE: Duration = Duration::from_secs(2);

    #[test]
    fn parse_observation_bounds() {
        assert_eq!(parse_observation(" 42.5\n", 0.0).unwrap(), 42.5);
        assert_eq!(parse_observation("0", 0.0).unwrap(), 0.0);
        assert_eq!(parse_observation("100", 99.0).unwrap(), 100.0);

        for (input, floor) in [("", 0.0), ("abc", 0.0), ("-1", 0.0), ("100.5", 0.0), ("NaN", 0.0), ("30", 40.0)] {
            assert!(
                matches!(parse_observation(input, floor), Err(Error::InputValidation(_))),
                "{input:?} accepted"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn records_each_level_and_reprompts_invalid_readings() {
        let (_notify, listener) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(listener);
        let mut actuator = RecordingActuator::default();
        let mut operator =
            ScriptedOperator::new(["0", "abc", "150", "20", "45", "10", "72", "100"]);

        let set = capture(&LEVELS, SETTLE, &mut actuator, &mut operator, &mut shutdown)
            .await
            .unwrap();

        assert!(set.is_calibrated());
        assert_eq!(
            set.points(),
            &[
                CalibrationPoint::new(0.0, 0.0),
                CalibrationPoint::new(25.0, 20.0),
                CalibrationPoint::new(50.0, 45.0),
                CalibrationPoint::new(75.0, 72.0),
                CalibrationPoint::new(100.0, 100.0),
            ]
        );
        assert_eq!(operator.rejections.len(), 3);
        assert_eq!(operator.prompts, vec![0.0, 25.0, 25.0, 25.0, 50.0, 75.0, 75.0, 100.0]);
        assert_eq!(actuator.drives, vec![0.0, 0.25, 0.5, 0.75, 1.0, 0.0]);
        assert!(set.notes().contains("0, 25, 50, 75, 100"));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_needle_to_settle() {
        let (_notify, listener) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(listener);
        let mut actuator = RecordingActuator::default();
        let mut operator = ScriptedOperator::new(["0", "20", "45", "72", "100"]);

        let started = time::Instant::now();
        capture(&LEVELS, SETTLE, &mut actuator, &mut operator, &mut shutdown)
            .await
            .unwrap();
        assert_eq!(started.elapsed(), SETTLE * 5);
    }

    #[tokio::test(start_paused = true)]
    async fn end_of_input_cancels_and_zeroes_actuator() {
        let (_notify, listener) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(listener);
        let mut actuator = RecordingActuator::default();
        let mut operator = ScriptedOperator::new(["0", "20"]);

        let result = capture(&LEVELS, SETTLE, &mut actuator, &mut operator, &mut shutdown).await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(actuator.drives, vec![0.0, 0.25, 0.5, 0.0]);
        assert_eq!(actuator.last(), Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_while_prompting_cancels_and_zeroes_actuator() {
        let (notify, listener) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(listener);
        let mut actuator = RecordingActuator::default();
        let mut operator = ScriptedOperator {
            answers: ["0"].into_iter().collect(),
            silent_when_exhausted: true,
            ..Default::default()
        };

        tokio::spawn(async move {
            time::sleep(Duration::from_secs(30)).await;
            let _ = notify.send(());
        });
        let started = time::Instant::now();
        let result = capture(&LEVELS, SETTLE, &mut actuator, &mut operator, &mut shutdown).await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert_eq!(operator.prompts, vec![0.0, 25.0]);
        assert_eq!(actuator.drives, vec![0.0, 0.25, 0.0]);
    }

    #[test]
    fn read_lines_forwards_until_end_of_input() {
        let (tx, mut rx) = mpsc::channel(4);
        read_lines(io::Cursor::new("0\n 42.5\n"), tx);

        assert_eq!(rx.blocking_recv().unwrap().unwrap(), "0");
        assert_eq!(rx.blocking_recv().unwrap().unwrap(), " 42.5");
        assert!(rx.blocking_recv().is_none());
    }

    #[test]
    fn read_lines_stops_once_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        // Returns rather than blocking on a full channel
        read_lines(io::Cursor::new("1\n2\n3\n"), tx);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_while_settling_cancels_and_zeroes_actuator() {
        let (notify, listener) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(listener);
        let mut actuator = RecordingActuator::default();
        let mut operator = ScriptedOperator::new(["0", "20", "45", "72", "100"]);

        notify.send(()).unwrap();
        let result = capture(&LEVELS, SETTLE, &mut actuator, &mut operator, &mut shutdown).await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(operator.prompts.is_empty());
        assert_eq!(actuator.drives, vec![0.0, 0.0]);
    }
}
