use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use n6_log::LogError;
use n6_statsd::metric;
use serde_json::Value;
use tokio::time::MissedTickBehavior;

use crate::cleanup::{LegacyFieldCleanup, PayloadCleanup};
use crate::error::{AggregatorError, ProcessingError};
use crate::event::{self, Event, EventKind};
use crate::manager::AggregatorDataManager;
use crate::source::Suppressed;
use crate::statsd::{AggregatorCounters, AggregatorTimers};
use crate::transport::{Message, Transport};

/// How the aggregator loop ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    /// The input was exhausted, a shutdown was requested or the transport failed. The state was
    /// stored.
    Stopped,
    /// Enough groups finished to warrant a restart, which compacts the payload storage. The state
    /// was stored.
    RestartRequested,
}

enum Step {
    Continue,
    Stop,
}

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The aggregator: consumes events from a [`Transport`], aggregates them and publishes the
/// results.
///
/// The first event of every group is published right away as `event`. Once a group finishes and
/// holds more than one event, a `suppressed` event summarizing the group is published.
pub struct Aggregator<T> {
    manager: AggregatorDataManager,
    transport: T,
    cleanup: Option<Box<dyn PayloadCleanup>>,
    clock: Clock,
    tick_interval: Duration,
    restart_threshold: Option<u64>,
    finished_groups: u64,
}

impl<T: Transport> Aggregator<T> {
    /// Creates the aggregator on a manager with restored state.
    pub fn new(manager: AggregatorDataManager, transport: T) -> Self {
        let config = manager.config();
        let cleanup: Option<Box<dyn PayloadCleanup>> = if config.legacy_cleanup {
            Some(Box::new(LegacyFieldCleanup))
        } else {
            None
        };

        Self {
            tick_interval: config.tick_interval(),
            restart_threshold: config.restart_threshold(),
            manager,
            transport,
            cleanup,
            clock: Box::new(Utc::now),
            finished_groups: 0,
        }
    }

    /// Replaces the cleanup applied to published events.
    pub fn with_cleanup(mut self, cleanup: impl PayloadCleanup + 'static) -> Self {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Replaces the wall clock used for activity tracking.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Number of groups that finished since the aggregator started.
    pub fn finished_groups(&self) -> u64 {
        self.finished_groups
    }

    /// Runs the aggregator until the input ends, `shutdown` resolves or a restart is due.
    ///
    /// Invalid events are rejected and skipped. Errors of the persisted state and I/O errors end
    /// the loop without storing the state, since it can no longer be trusted.
    pub async fn run<S>(mut self, shutdown: S) -> Result<RunOutcome, AggregatorError>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let start = tokio::time::Instant::now() + self.tick_interval;
        let mut ticker = tokio::time::interval_at(start, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        n6_log::info!(
            tick_interval = self.tick_interval.as_secs(),
            restart_threshold = self.restart_threshold,
            "aggregator started",
        );

        loop {
            let result = tokio::select! {
                biased;

                () = &mut shutdown => {
                    n6_log::info!("shutdown requested, stopping aggregator");
                    Ok(Step::Stop)
                }
                _ = ticker.tick() => self.handle_tick().await,
                message = self.transport.next_message() => match message {
                    Ok(Some(message)) => self.handle_message(message).await,
                    Ok(None) => {
                        n6_log::info!("input exhausted, stopping aggregator");
                        Ok(Step::Stop)
                    }
                    Err(error) => Err(error.into()),
                },
            };

            let step = match result {
                Ok(step) => step,
                Err(AggregatorError::Transport(error)) => {
                    n6_log::error!("message transport failed: {}", LogError(&error));
                    Step::Stop
                }
                Err(error) => return Err(error),
            };

            match step {
                Step::Continue if self.restart_due() => {
                    n6_log::info!(
                        finished_groups = self.finished_groups,
                        "restart threshold exceeded, stopping aggregator for a restart",
                    );
                    self.transport.stop_consuming();
                    self.transport.stop_publishing();
                    self.manager.store_state()?;
                    return Ok(RunOutcome::RestartRequested);
                }
                Step::Continue => {}
                Step::Stop => {
                    self.transport.stop_consuming();
                    self.manager.store_state()?;
                    return Ok(RunOutcome::Stopped);
                }
            }
        }
    }

    fn restart_due(&self) -> bool {
        self.restart_threshold
            .is_some_and(|threshold| self.finished_groups > threshold)
    }

    async fn handle_tick(&mut self) -> Result<Step, AggregatorError> {
        let started = Instant::now();
        let now = (self.clock)();

        let suppressed = self.manager.generate_suppressed_events_after_timeout(now)?;
        n6_log::debug!(finished = suppressed.len(), "inactivity sweep done");

        for (_, item) in suppressed {
            self.publish_suppressed(item).await?;
        }

        metric!(timer(AggregatorTimers::Tick) = started.elapsed());
        Ok(Step::Continue)
    }

    async fn handle_message(&mut self, message: Message) -> Result<Step, AggregatorError> {
        metric!(counter(AggregatorCounters::MessagesReceived) += 1);

        let event = match event::decode_event(&message.body) {
            Ok(event) => event,
            Err(error) => {
                self.reject(&message, &error);
                return Ok(Step::Continue);
            }
        };

        match self.process_event(&event).await {
            Ok(()) => {
                self.transport.acknowledge(&message);
                Ok(Step::Continue)
            }
            Err(AggregatorError::Processing(error)) => {
                self.reject(&message, &error);
                Ok(Step::Continue)
            }
            Err(error) => Err(error),
        }
    }

    fn reject(&mut self, message: &Message, error: &ProcessingError) {
        metric!(
            counter(AggregatorCounters::MessagesRejected) += 1,
            reason = rejection_reason(error)
        );
        self.transport.reject(message, error);
    }

    async fn process_event(&mut self, event: &Event) -> Result<(), AggregatorError> {
        let now = (self.clock)();

        if self.manager.process_new_message(event, now)? {
            self.publish_event(EventKind::Event, event).await?;
        }

        for item in self.manager.generate_suppressed_events_for_source(event)? {
            self.publish_suppressed(item).await?;
        }

        Ok(())
    }

    async fn publish_suppressed(&mut self, item: Suppressed) -> Result<(), AggregatorError> {
        self.finished_groups += 1;
        metric!(counter(AggregatorCounters::GroupsFinished) += 1);

        match item {
            Some(payload) => self.publish_event(EventKind::Suppressed, &payload).await,
            None => Ok(()),
        }
    }

    async fn publish_event(&mut self, kind: EventKind, payload: &Event) -> Result<(), AggregatorError> {
        let routing_key = event::routing_key(kind, event::event_source(payload)?);

        let mut output = payload.clone();
        output.insert(event::TYPE_FIELD.to_owned(), Value::from(kind.as_str()));
        output.remove(event::GROUP_FIELD);
        if let Some(cleanup) = &self.cleanup {
            cleanup.clean(&mut output);
        }

        let body = serde_json::to_vec(&output).map_err(AggregatorError::Serialization)?;
        self.transport.publish(&routing_key, body).await?;

        metric!(
            counter(AggregatorCounters::EventsPublished) += 1,
            kind = kind.as_str()
        );
        Ok(())
    }
}

impl<T: fmt::Debug> fmt::Debug for Aggregator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("manager", &self.manager)
            .field("transport", &self.transport)
            .field("cleanup", &self.cleanup.is_some())
            .field("tick_interval", &self.tick_interval)
            .field("restart_threshold", &self.restart_threshold)
            .field("finished_groups", &self.finished_groups)
            .finish()
    }
}

fn rejection_reason(error: &ProcessingError) -> &'static str {
    match error {
        ProcessingError::EventInPast { .. } => "event_in_past",
        ProcessingError::MissingField(_) => "missing_field",
        ProcessingError::InvalidTime(_) => "invalid_time",
        ProcessingError::InvalidSource(_) => "invalid_source",
        ProcessingError::InvalidJson(_) => "invalid_json",
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use chrono::TimeDelta;
    use serde_json::json;

    use super::*;
    use crate::config::AggregatorConfig;
    use crate::transport::TransportError;

    /// Transport on in-memory queues. Once the input is drained it either ends or stays idle.
    #[derive(Debug, Default)]
    struct MemoryTransport {
        input: VecDeque<Vec<u8>>,
        idle_when_drained: bool,
        published: Vec<(String, Value)>,
        rejected: Vec<u64>,
        next_tag: u64,
        consuming: bool,
    }

    impl MemoryTransport {
        fn new(input: &[Value]) -> Self {
            Self {
                input: input.iter().map(|v| v.to_string().into_bytes()).collect(),
                consuming: true,
                ..Default::default()
            }
        }
    }

    impl Transport for &mut MemoryTransport {
        async fn next_message(&mut self) -> Result<Option<Message>, TransportError> {
            if !self.consuming {
                return Ok(None);
            }

            match self.input.pop_front() {
                Some(body) => {
                    self.next_tag += 1;
                    Ok(Some(Message {
                        delivery_tag: self.next_tag,
                        body,
                    }))
                }
                None if self.idle_when_drained => std::future::pending().await,
                None => Ok(None),
            }
        }

        async fn publish(&mut self, routing_key: &str, body: Vec<u8>) -> Result<(), TransportError> {
            let body = serde_json::from_slice(&body).unwrap();
            self.published.push((routing_key.to_owned(), body));
            Ok(())
        }

        fn reject(&mut self, message: &Message, _error: &ProcessingError) {
            self.rejected.push(message.delivery_tag);
        }

        fn stop_consuming(&mut self) {
            self.consuming = false;
        }

        fn stop_publishing(&mut self) {}
    }

    fn config(dir: &std::path::Path) -> AggregatorConfig {
        AggregatorConfig {
            dbpath: dir.join("aggregator_db.pk"),
            ..Default::default()
        }
    }

    fn event(group: &str, time: &str) -> Value {
        json!({
            "id": format!("{group}-{time}"),
            "source": "abuse-ch.feodotracker",
            "_group": group,
            "time": time,
        })
    }

    fn clock() -> DateTime<Utc> {
        "2017-06-02T00:00:00Z".parse().unwrap()
    }

    #[tokio::test]
    async fn test_publishes_events_and_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = AggregatorDataManager::start(config(dir.path())).unwrap();

        let mut transport = MemoryTransport::new(&[
            event("g1", "2017-06-01 10:00:00"),
            event("g1", "2017-06-01 10:05:00"),
            event("g1", "2017-06-01 10:06:00"),
            event("g2", "2017-06-01 23:00:00"),
        ]);

        let outcome = Aggregator::new(manager, &mut transport)
            .with_clock(clock)
            .run(std::future::pending())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Stopped);

        insta::assert_json_snapshot!(transport.published, @r###"
        [
          [
            "event.aggregated.abuse-ch.feodotracker",
            {
              "id": "g1-2017-06-01 10:00:00",
              "source": "abuse-ch.feodotracker",
              "time": "2017-06-01 10:00:00",
              "type": "event"
            }
          ],
          [
            "event.aggregated.abuse-ch.feodotracker",
            {
              "id": "g2-2017-06-01 23:00:00",
              "source": "abuse-ch.feodotracker",
              "time": "2017-06-01 23:00:00",
              "type": "event"
            }
          ],
          [
            "suppressed.aggregated.abuse-ch.feodotracker",
            {
              "_first_time": "2017-06-01 10:00:00",
              "count": 3,
              "id": "g1-2017-06-01 10:00:00",
              "source": "abuse-ch.feodotracker",
              "time": "2017-06-01 10:00:00",
              "type": "suppressed",
              "until": "2017-06-01 10:06:00"
            }
          ]
        ]
        "###);

        // The state was stored on the way out.
        assert!(dir.path().join("aggregator_db.pk").exists());
    }

    #[tokio::test]
    async fn test_rejects_invalid_messages() {
        let dir = tempfile::tempdir().unwrap();
        let manager = AggregatorDataManager::start(config(dir.path())).unwrap();

        let mut transport = MemoryTransport::new(&[
            event("g1", "2017-06-01 10:00:00"),
            json!({"source": "abuse-ch.feodotracker", "time": "2017-06-01 10:00:00"}),
            json!("not an object"),
            event("g2", "2017-06-01 09:00:00"),
            json!({"source": "feodotracker", "_group": "g3", "time": "2017-06-01 10:00:00"}),
            event("g4", "2017-06-01 10:01:00"),
        ]);

        let outcome = Aggregator::new(manager, &mut transport)
            .with_clock(clock)
            .run(std::future::pending())
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(transport.rejected, [2, 3, 4, 5]);
        assert_eq!(transport.published.len(), 2);
    }

    #[tokio::test]
    async fn test_restart_after_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let config = AggregatorConfig {
            finished_groups_count_triggering_restart: 1,
            ..config(dir.path())
        };
        let manager = AggregatorDataManager::start(config).unwrap();

        let mut transport = MemoryTransport::new(&[
            event("g1", "2017-06-01 00:00:00"),
            event("g2", "2017-06-01 00:01:00"),
            event("g3", "2017-06-01 23:00:00"),
            event("g4", "2017-06-01 23:01:00"),
        ]);

        let outcome = Aggregator::new(manager, &mut transport)
            .with_clock(clock)
            .run(std::future::pending())
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::RestartRequested);
        // The last event was never consumed.
        assert_eq!(transport.input.len(), 1);
        assert!(!transport.consuming);
    }

    #[tokio::test]
    async fn test_shutdown_stores_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = AggregatorDataManager::start(config(dir.path())).unwrap();

        let mut transport = MemoryTransport::new(&[event("g1", "2017-06-01 10:00:00")]);
        transport.idle_when_drained = true;

        let outcome = Aggregator::new(manager, &mut transport)
            .with_clock(clock)
            .run(async {
                tokio::task::yield_now().await;
            })
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Stopped);

        let mut restored = AggregatorDataManager::open(config(dir.path())).unwrap();
        restored.restore_state().unwrap();
        assert!(restored.data().source("abuse-ch.feodotracker").is_some());
    }

    #[tokio::test]
    async fn test_wall_clock_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let manager = AggregatorDataManager::start(config(dir.path())).unwrap();
        let mut transport = MemoryTransport::new(&[event("g1", "2017-06-01 10:00:00")]);

        let started = Utc::now();
        let outcome = Aggregator::new(manager, &mut transport)
            .run(std::future::pending())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Stopped);

        let mut restored = AggregatorDataManager::open(config(dir.path())).unwrap();
        restored.restore_state().unwrap();
        let source = restored.data().source("abuse-ch.feodotracker").unwrap();
        assert!(source.last_active() >= started);
        assert!(source.last_active() <= Utc::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_flushes_inactive_sources() {
        let dir = tempfile::tempdir().unwrap();
        let config = AggregatorConfig {
            tick_interval: 60,
            ..config(dir.path())
        };
        let manager = AggregatorDataManager::start(config).unwrap();

        let mut transport = MemoryTransport::new(&[
            event("g1", "2017-06-01 10:00:00"),
            event("g1", "2017-06-01 10:01:00"),
        ]);
        transport.idle_when_drained = true;

        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        // Events are processed at the first reading, the sweep sees a clock two days later.
        let wall_clock = move || {
            let mut calls = counter.lock().unwrap();
            *calls += 1;
            match *calls {
                1 | 2 => clock(),
                _ => clock() + TimeDelta::days(2),
            }
        };

        let outcome = Aggregator::new(manager, &mut transport)
            .with_clock(wall_clock)
            .run(tokio::time::sleep(Duration::from_secs(90)))
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Stopped);

        let (routing_key, body) = transport.published.last().unwrap();
        assert_eq!(routing_key, "suppressed.aggregated.abuse-ch.feodotracker");
        assert_eq!(body["count"], 2);
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_legacy_cleanup_applied() {
        let dir = tempfile::tempdir().unwrap();
        let config = AggregatorConfig {
            legacy_cleanup: true,
            ..config(dir.path())
        };
        let manager = AggregatorDataManager::start(config).unwrap();

        let mut payload = event("g1", "2017-06-01 10:00:00");
        payload["category"] = json!("CNC");
        let mut transport = MemoryTransport::new(&[payload]);

        Aggregator::new(manager, &mut transport)
            .with_clock(clock)
            .run(std::future::pending())
            .await
            .unwrap();

        assert_eq!(transport.published[0].1["category"], "cnc");
    }
}
