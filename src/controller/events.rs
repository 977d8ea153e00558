//! Cluster event feed: translation of watch events and the per-kind reactor

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use kube::runtime::watcher;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Entity kinds the coordinators react to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Node,
    Workload,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Node => "node",
            EntityKind::Workload => "workload",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle event for one entity
#[derive(Clone, Debug, PartialEq)]
pub enum ClusterEvent<R> {
    Added(R),
    Updated { old: R, new: R },
    Deleted(R),
}

impl<R> ClusterEvent<R> {
    /// The entity state the event leaves behind (the deleted state for deletes)
    pub fn current(&self) -> &R {
        match self {
            ClusterEvent::Added(r) | ClusterEvent::Deleted(r) => r,
            ClusterEvent::Updated { new, .. } => new,
        }
    }
}

/// A validated view of a cluster object, produced once per event
pub trait ClusterRecord: Clone + Debug + Send + Sync + 'static {
    type Object: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static;

    const KIND: EntityKind;

    fn from_object(obj: &Self::Object) -> Self;

    /// Unique key of the entity (`name` or `namespace/name`)
    fn key(&self) -> String;
}

/// Handles events for one entity kind
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    type Record: ClusterRecord;

    /// Run the decision function for one event
    async fn handle(&self, event: ClusterEvent<Self::Record>) -> Result<()>;

    /// Periodic re-evaluation independent of events
    async fn resync(&self) -> Result<()> {
        Ok(())
    }
}

/// Turns raw watcher events into `ClusterEvent`s, remembering the last seen
/// state of every entity so updates carry both old and new.
pub struct EventTranslator<R: ClusterRecord> {
    seen: HashMap<String, R>,
    relisting: Option<HashSet<String>>,
}

impl<R: ClusterRecord> Default for EventTranslator<R> {
    fn default() -> Self {
        Self {
            seen: HashMap::new(),
            relisting: None,
        }
    }
}

impl<R: ClusterRecord> EventTranslator<R> {
    pub fn translate(&mut self, event: watcher::Event<R::Object>) -> Vec<ClusterEvent<R>> {
        match event {
            watcher::Event::Apply(obj) => vec![self.apply(R::from_object(&obj))],
            watcher::Event::InitApply(obj) => {
                let record = R::from_object(&obj);
                if let Some(relisting) = self.relisting.as_mut() {
                    relisting.insert(record.key());
                }
                vec![self.apply(record)]
            }
            watcher::Event::Delete(obj) => {
                let record = R::from_object(&obj);
                self.seen.remove(&record.key());
                vec![ClusterEvent::Deleted(record)]
            }
            watcher::Event::Init => {
                self.relisting = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitDone => {
                // Anything not seen during a relist vanished while we were not watching.
                let Some(relisted) = self.relisting.take() else {
                    return Vec::new();
                };
                let gone: Vec<String> = self
                    .seen
                    .keys()
                    .filter(|k| !relisted.contains(*k))
                    .cloned()
                    .collect();
                gone.into_iter()
                    .filter_map(|k| self.seen.remove(&k))
                    .map(ClusterEvent::Deleted)
                    .collect()
            }
        }
    }

    fn apply(&mut self, record: R) -> ClusterEvent<R> {
        match self.seen.insert(record.key(), record.clone()) {
            Some(old) => ClusterEvent::Updated { old, new: record },
            None => ClusterEvent::Added(record),
        }
    }
}

/// Log a failed decision cycle; errors never escape a single entity
pub(crate) fn report_cycle_error(kind: EntityKind, entity: &str, err: &Error) {
    error!(
        kind = %kind,
        entity = %entity,
        error_kind = err.kind(),
        "Decision cycle aborted: {}",
        err
    );
    #[cfg(feature = "metrics")]
    super::metrics::inc_decision_error(kind.as_str(), err.kind());
}

fn dispatch<H: EventHandler>(
    tasks: &mut JoinSet<()>,
    handler: &Arc<H>,
    event: ClusterEvent<H::Record>,
) {
    let handler = Arc::clone(handler);
    tasks.spawn(async move {
        let kind = <H::Record as ClusterRecord>::KIND;
        let key = event.current().key();
        let started = Instant::now();
        if let Err(e) = handler.handle(event).await {
            report_cycle_error(kind, &key, &e);
        }
        #[cfg(feature = "metrics")]
        super::metrics::observe_decision_duration(kind.as_str(), started.elapsed().as_secs_f64());
        #[cfg(not(feature = "metrics"))]
        let _ = started;
    });
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Drive `handler` from `events` until `shutdown` flips to true or the
/// stream ends. Each event runs on its own task; in-flight tasks are drained
/// before returning.
pub async fn run_reactor<H, S>(
    handler: Arc<H>,
    events: S,
    mut shutdown: watch::Receiver<bool>,
    resync: Option<Duration>,
) where
    H: EventHandler,
    S: Stream<Item = std::result::Result<watcher::Event<<H::Record as ClusterRecord>::Object>, watcher::Error>>
        + Send,
{
    let kind = <H::Record as ClusterRecord>::KIND;
    let mut events = std::pin::pin!(events);
    let mut translator = EventTranslator::<H::Record>::default();
    let mut tasks = JoinSet::new();

    let mut ticker = resync.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    info!(kind = %kind, "Starting event reactor");

    if *shutdown.borrow() {
        return;
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(kind = %kind, "Shutdown requested, stopping reactor");
                    break;
                }
            }
            item = events.next() => match item {
                Some(Ok(event)) => {
                    for event in translator.translate(event) {
                        dispatch(&mut tasks, &handler, event);
                    }
                }
                Some(Err(e)) => warn!(kind = %kind, "Watch stream error: {}", e),
                None => {
                    info!(kind = %kind, "Watch stream ended");
                    break;
                }
            },
            _ = tick(&mut ticker) => {
                debug!(kind = %kind, "Periodic resync");
                let handler = Arc::clone(&handler);
                tasks.spawn(async move {
                    if let Err(e) = handler.resync().await {
                        report_cycle_error(kind, "resync", &e);
                    }
                });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!(kind = %kind, "Decision task panicked: {}", e);
                }
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(kind = %kind, "Decision task panicked: {}", e);
        }
    }
    info!(kind = %kind, "Event reactor stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use k8s_openapi::api::core::v1::{Pod, PodSpec};
    use kube::api::ObjectMeta;

    use super::*;
    use crate::controller::workload::WorkloadRecord;

    fn pod(name: &str, priority: i32) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("batch".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                priority: Some(priority),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ClusterEvent<WorkloadRecord>>>,
        resyncs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        type Record = WorkloadRecord;

        async fn handle(&self, event: ClusterEvent<WorkloadRecord>) -> Result<()> {
            self.events.lock().unwrap().push(event);
            if self.fail {
                return Err(Error::FetchError("index unavailable".to_string()));
            }
            Ok(())
        }

        async fn resync(&self) -> Result<()> {
            self.resyncs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_translator_tracks_add_update_delete() {
        let mut translator = EventTranslator::<WorkloadRecord>::default();

        let added = translator.translate(watcher::Event::Apply(pod("a", 10)));
        assert!(matches!(added.as_slice(), [ClusterEvent::Added(r)] if r.priority == Some(10)));

        let updated = translator.translate(watcher::Event::Apply(pod("a", 20)));
        match updated.as_slice() {
            [ClusterEvent::Updated { old, new }] => {
                assert_eq!(old.priority, Some(10));
                assert_eq!(new.priority, Some(20));
            }
            other => panic!("expected update, got {other:?}"),
        }

        let deleted = translator.translate(watcher::Event::Delete(pod("a", 20)));
        assert!(matches!(deleted.as_slice(), [ClusterEvent::Deleted(_)]));

        // a re-added entity is new again
        let readded = translator.translate(watcher::Event::Apply(pod("a", 5)));
        assert!(matches!(readded.as_slice(), [ClusterEvent::Added(_)]));
    }

    #[test]
    fn test_relist_reports_vanished_entities() {
        let mut translator = EventTranslator::<WorkloadRecord>::default();
        translator.translate(watcher::Event::Apply(pod("kept", 1)));
        translator.translate(watcher::Event::Apply(pod("gone", 1)));

        assert!(translator.translate(watcher::Event::Init).is_empty());
        let kept = translator.translate(watcher::Event::InitApply(pod("kept", 1)));
        assert!(matches!(kept.as_slice(), [ClusterEvent::Updated { .. }]));

        let done = translator.translate(watcher::Event::InitDone);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].current().key(), "batch/gone");
    }

    #[tokio::test]
    async fn test_reactor_dispatches_until_stream_ends() {
        let handler = Arc::new(Recorder::default());
        let (_tx, rx) = watch::channel(false);
        let events = futures::stream::iter(vec![
            Ok(watcher::Event::Apply(pod("a", 1))),
            Ok(watcher::Event::Apply(pod("b", 2))),
            Ok(watcher::Event::Delete(pod("a", 1))),
        ]);

        run_reactor(handler.clone(), events, rx, None).await;

        let seen = handler.events.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen
            .iter()
            .any(|e| matches!(e, ClusterEvent::Deleted(r) if r.name == "a")));
    }

    #[tokio::test]
    async fn test_reactor_survives_handler_errors() {
        let handler = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let (_tx, rx) = watch::channel(false);
        let events = futures::stream::iter(vec![
            Ok(watcher::Event::Apply(pod("a", 1))),
            Ok(watcher::Event::Apply(pod("b", 1))),
        ]);

        run_reactor(handler.clone(), events, rx, None).await;

        assert_eq!(handler.events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reactor_stops_on_shutdown_and_resyncs() {
        let handler = Arc::new(Recorder::default());
        let (tx, rx) = watch::channel(false);
        let events = futures::stream::pending::<
            std::result::Result<watcher::Event<Pod>, watcher::Error>,
        >();

        let reactor = tokio::spawn(run_reactor(
            handler.clone(),
            events,
            rx,
            Some(Duration::from_millis(10)),
        ));

        tokio::time::sleep(Duration::from_millis(80)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), reactor)
            .await
            .expect("reactor did not stop")
            .unwrap();

        assert!(handler.resyncs.load(Ordering::SeqCst) >= 1);
    }
}
