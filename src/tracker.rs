use crate::control::StopSignal;
use crate::error::{ProbeError, StoreError};
use crate::probe::Probe;
use crate::record::Record;
use crate::store::RecordStore;
use log::{error, info, warn};
use std::io::Write;
use std::time::Duration;
use tokio::time::sleep;

/// The probe reports bits per second; the log column is labelled MB/s.
pub const RATE_DIVISOR: f64 = 1e6;

pub struct Tracker<P> {
    probe: P,
    store: RecordStore,
    console: Box<dyn Write + Send>,
}

impl<P: Probe> Tracker<P> {
    /// `console` receives the operator status lines, one per attempt.
    pub fn new(probe: P, store: RecordStore, console: Box<dyn Write + Send>) -> Self {
        Self {
            probe,
            store,
            console,
        }
    }

    async fn probe_speed(&self) -> Result<f64, ProbeError> {
        let server = self.probe.best_server().await?;
        info!("Selected server {}", server);
        let rate = self.probe.download(&server).await?;
        Ok(rate / RATE_DIVISOR)
    }

    /// Takes one measurement and records it, whatever the outcome.
    ///
    /// Returns `Ok(None)` when the measurement failed; that failure is already
    /// in the log. An `Err` means the record itself could not be written.
    pub async fn measure_once(&mut self) -> Result<Option<f64>, StoreError> {
        let outcome = self.probe_speed().await;

        if let Err(ref reason) = outcome {
            match reason {
                ProbeError::NoServer(_) => warn!(
                    "Could not connect to the servers to measure latency. Details: {}",
                    reason
                ),
                e if e.is_network() => warn!(
                    "Network error: cannot connect to server, possible router reset or connection problem. Details: {}",
                    reason
                ),
                _ => warn!("Unexpected error when measuring speed: {}", reason),
            }
        }

        let record = Record::from_outcome(&outcome);
        self.store.append(&record).await?;

        Ok(outcome.ok())
    }

    /// Measures every `interval` until `stop` fires. A stop arriving during a
    /// measurement takes effect once that measurement has been recorded.
    ///
    /// Returns the number of attempts recorded.
    pub async fn run_tracking(
        &mut self,
        interval: Duration,
        mut stop: StopSignal,
    ) -> Result<u64, StoreError> {
        info!("Tracking every {:?}, logging to {:?}", interval, self.store.path());
        let mut attempts = 0u64;

        while !stop.is_stopped() {
            let speed = match self.measure_once().await {
                Ok(speed) => speed,
                Err(e) => {
                    error!("Failed to record measurement: {}", e);
                    return Err(e);
                }
            };
            attempts += 1;
            self.report(speed);

            tokio::select! {
                _ = sleep(interval) => {}
                _ = stop.stopped() => break,
            }
        }

        self.say("Tracking finished.");
        info!("Tracking stopped after {} attempts", attempts);
        Ok(attempts)
    }

    /// Prints the one-line outcome of a measurement.
    pub fn report(&mut self, speed: Option<f64>) {
        match speed {
            Some(speed) => self.say(&format!("Download speed: {:.2} MB/s", speed)),
            None => self.say("Speed could not be measured at this time."),
        }
    }

    fn say(&mut self, line: &str) {
        if let Err(e) = writeln!(self.console, "{}", line).and_then(|_| self.console.flush()) {
            warn!("Failed to write status line: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use crate::control::{stop_channel, StopHandle};
    use crate::probe::Server;
    use crate::record::Status;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::timeout;

    #[derive(Debug, Clone)]
    enum Step {
        Rate(f64),
        NoServer(&'static str),
        Network(&'static str),
        Fault(&'static str),
    }

    /// Plays back a fixed sequence of outcomes, one per measurement.
    struct ScriptedProbe {
        steps: Mutex<VecDeque<Step>>,
        calls: Arc<AtomicUsize>,
        stop_at: Option<(usize, StopHandle)>,
    }

    impl ScriptedProbe {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                calls: Arc::new(AtomicUsize::new(0)),
                stop_at: None,
            }
        }

        fn stopping_at(mut self, call: usize, handle: StopHandle) -> Self {
            self.stop_at = Some((call, handle));
            self
        }

        fn next(&self) -> Step {
            self.steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Step::Rate(1_000_000.0))
        }
    }

    impl Probe for ScriptedProbe {
        async fn best_server(&self) -> Result<Server, ProbeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((at, handle)) = &self.stop_at {
                if call == *at {
                    handle.stop();
                }
            }

            let mut steps = self.steps.lock().unwrap();
            if let Some(Step::NoServer(msg)) = steps.front().cloned() {
                steps.pop_front();
                return Err(ProbeError::NoServer(msg.to_string()));
            }
            Ok(Server::new("scripted", "http://127.0.0.1/speedtest/upload.php"))
        }

        async fn download(&self, _server: &Server) -> Result<f64, ProbeError> {
            match self.next() {
                Step::Rate(rate) => Ok(rate),
                Step::Network(msg) => Err(ProbeError::Timeout(msg.to_string())),
                Step::Fault(msg) => Err(ProbeError::Other(msg.to_string())),
                Step::NoServer(msg) => Err(ProbeError::NoServer(msg.to_string())),
            }
        }
    }

    #[derive(Clone, Default)]
    struct Console(Arc<Mutex<Vec<u8>>>);

    impl Write for Console {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Console {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    async fn setup(
        dir: &tempfile::TempDir,
        probe: ScriptedProbe,
    ) -> (Tracker<ScriptedProbe>, RecordStore, Console) {
        let store = RecordStore::new(dir.path().join("internet_speed.csv"));
        store.ensure_initialized().await.unwrap();
        let console = Console::default();
        let tracker = Tracker::new(probe, store.clone(), Box::new(console.clone()));
        (tracker, store, console)
    }

    fn rows(store: &RecordStore) -> Vec<String> {
        std::fs::read_to_string(store.path())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn success_is_converted_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tracker, store, _) =
            setup(&dir, ScriptedProbe::new(vec![Step::Rate(45_320_000.0)])).await;

        let speed = tracker.measure_once().await.unwrap();
        assert_eq!(speed, Some(45.32));

        let rows = rows(&store);
        assert_eq!(rows.len(), 2);
        let columns: Vec<&str> = rows[1].split(';').collect();
        assert_eq!(columns.len(), 4);
        assert_eq!(columns[1], "45.32");
        assert_eq!(columns[2], "OK");
        assert_eq!(columns[3], "");
    }

    #[tokio::test]
    async fn endpoint_failure_is_recorded_as_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tracker, store, _) =
            setup(&dir, ScriptedProbe::new(vec![Step::NoServer("no servers")])).await;

        assert_eq!(tracker.measure_once().await.unwrap(), None);

        let rows = rows(&store);
        assert!(rows[1].ends_with(";0;BAD REQUEST;no servers"), "row: {}", rows[1]);
    }

    #[tokio::test]
    async fn every_failure_kind_shares_one_record_shape() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tracker, store, _) = setup(
            &dir,
            ScriptedProbe::new(vec![
                Step::NoServer("no servers"),
                Step::Network("timed out"),
                Step::Fault("disk on fire"),
            ]),
        )
        .await;

        for _ in 0..3 {
            assert_eq!(tracker.measure_once().await.unwrap(), None);
        }

        let records = store.read_records().await.unwrap();
        assert_eq!(records.len(), 3);
        for record in &records {
            assert_eq!(record.status, Status::BadRequest);
            assert_eq!(record.speed, 0.0);
            assert!(record.error.as_deref().is_some_and(|e| !e.is_empty()));
        }
        assert_eq!(records[1].error.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn zero_rate_from_healthy_probe_is_still_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tracker, store, _) =
            setup(&dir, ScriptedProbe::new(vec![Step::Rate(0.0)])).await;

        assert_eq!(tracker.measure_once().await.unwrap(), Some(0.0));
        let records = store.read_records().await.unwrap();
        assert_eq!(records[0].status, Status::Ok);
        assert_eq!(records[0].error, None);
    }

    #[tokio::test]
    async fn mixed_outcomes_keep_order_and_row_count() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, signal) = stop_channel();
        let probe = ScriptedProbe::new(vec![
            Step::Rate(10_000_000.0),
            Step::Network("timed out"),
            Step::Rate(20_000_000.0),
        ])
        .stopping_at(3, handle);
        let (mut tracker, store, console) = setup(&dir, probe).await;

        let attempts = timeout(
            Duration::from_secs(5),
            tracker.run_tracking(Duration::from_millis(1), signal),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(attempts, 3);

        let rows = rows(&store);
        assert_eq!(rows.len(), 4);
        let statuses: Vec<Status> = store
            .read_records()
            .await
            .unwrap()
            .iter()
            .map(|r| r.status)
            .collect();
        assert_eq!(statuses, vec![Status::Ok, Status::BadRequest, Status::Ok]);

        assert_eq!(
            console.lines(),
            vec![
                "Download speed: 10.00 MB/s",
                "Speed could not be measured at this time.",
                "Download speed: 20.00 MB/s",
                "Tracking finished.",
            ]
        );
    }

    #[tokio::test]
    async fn stop_during_sleep_ends_loop_without_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, signal) = stop_channel();
        let probe = ScriptedProbe::new(vec![]);
        let calls = Arc::clone(&probe.calls);
        let (mut tracker, store, console) = setup(&dir, probe).await;

        let stopper = {
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                while calls.load(Ordering::SeqCst) < 2 {
                    sleep(Duration::from_millis(5)).await;
                }
                sleep(Duration::from_millis(50)).await;
                handle.stop();
            })
        };

        // One attempt before the loop, then one inside it followed by an
        // hour-long sleep that only the stop can cut short.
        let attempts = timeout(Duration::from_secs(5), async {
            tracker.measure_once().await.unwrap();
            tracker.run_tracking(Duration::from_secs(3600), signal).await
        })
        .await
        .expect("loop did not honour the stop signal")
        .unwrap();
        stopper.await.unwrap();

        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(rows(&store).len(), 3);
        assert_eq!(console.lines().last().map(String::as_str), Some("Tracking finished."));
    }

    #[tokio::test]
    async fn stop_before_start_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, signal) = stop_channel();
        handle.stop();
        let (mut tracker, store, console) = setup(&dir, ScriptedProbe::new(vec![])).await;

        let attempts = tracker
            .run_tracking(Duration::from_secs(3600), signal)
            .await
            .unwrap();

        assert_eq!(attempts, 0);
        assert_eq!(rows(&store).len(), 1);
        assert_eq!(console.lines(), vec!["Tracking finished."]);
    }

    #[tokio::test]
    async fn unwritable_log_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("missing").join("log.csv"));
        let mut tracker =
            Tracker::new(ScriptedProbe::new(vec![]), store, Box::new(Console::default()));
        let (_handle, signal) = stop_channel();

        let result = timeout(
            Duration::from_secs(5),
            tracker.run_tracking(Duration::from_secs(3600), signal),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(StoreError::Io { .. })));
    }
}
