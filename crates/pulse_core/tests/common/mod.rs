#![allow(dead_code)]

use async_trait::async_trait;
use pulse_core::{
    AppNavigator, CoreConfig, DispatchEvent, EngineDeps, NetworkError, NotificationPresenter,
    NotificationRequest, OfflineTask, PersistentStore, PresentError, PresentRequest, PulseEngine,
    ReconcileReport, SqliteStore, SyncTransport, TokioClock,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;

/// Fixed epoch the test clocks start at.
pub const T0: i64 = 1_700_000_000_000;

#[derive(Default)]
pub struct FakePresenter {
    script: Mutex<VecDeque<Result<(), PresentError>>>,
    shown: Mutex<Vec<String>>,
    attempts: Mutex<Vec<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
    entered: Notify,
}

impl FakePresenter {
    /// Queues results for upcoming `present` calls; later calls succeed.
    pub fn script(&self, results: impl IntoIterator<Item = Result<(), PresentError>>) {
        self.script.lock().unwrap().extend(results);
    }

    pub fn shown(&self) -> Vec<String> {
        self.shown.lock().unwrap().clone()
    }

    pub fn shown_count(&self, id: &str) -> usize {
        self.shown.lock().unwrap().iter().filter(|shown| *shown == id).count()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    /// Makes the next `present` call wait until the returned gate is notified.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Resolves once a held `present` call is waiting on its gate.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }
}

#[async_trait]
impl NotificationPresenter for FakePresenter {
    async fn present(&self, request: &PresentRequest) -> Result<(), PresentError> {
        self.attempts
            .lock()
            .unwrap()
            .push(request.notification_id.clone());
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            self.entered.notify_one();
            gate.notified().await;
        }
        let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if next.is_ok() {
            self.shown
                .lock()
                .unwrap()
                .push(request.notification_id.clone());
        }
        next
    }
}

#[derive(Default)]
pub struct FakeNavigator {
    opened: Mutex<Vec<String>>,
}

impl FakeNavigator {
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

impl AppNavigator for FakeNavigator {
    fn open(&self, target: &str) {
        self.opened.lock().unwrap().push(target.to_string());
    }
}

#[derive(Default)]
pub struct FakeTransport {
    script: Mutex<VecDeque<Result<(), NetworkError>>>,
    fallback: Mutex<Option<NetworkError>>,
    delay: Mutex<Option<Duration>>,
    submitted: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn script(&self, results: impl IntoIterator<Item = Result<(), NetworkError>>) {
        self.script.lock().unwrap().extend(results);
    }

    /// Error returned once the script is exhausted; `None` means success.
    pub fn fail_always(&self, error: Option<NetworkError>) {
        *self.fallback.lock().unwrap() = error;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn submitted_count(&self, task_id: &str) -> usize {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == task_id)
            .count()
    }
}

#[async_trait]
impl SyncTransport for FakeTransport {
    async fn submit(&self, task: &OfflineTask) -> Result<(), NetworkError> {
        self.submitted.lock().unwrap().push(task.id.clone());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => match self.fallback.lock().unwrap().clone() {
                Some(error) => Err(error),
                None => Ok(()),
            },
        }
    }
}

pub struct Harness {
    pub engine: PulseEngine,
    pub store: Arc<SqliteStore>,
    pub clock: Arc<TokioClock>,
    pub presenter: Arc<FakePresenter>,
    pub navigator: Arc<FakeNavigator>,
    pub transport: Arc<FakeTransport>,
    pub events: UnboundedReceiver<DispatchEvent>,
    pub startup: ReconcileReport,
}

impl Harness {
    /// Waits for the next dispatch event; paused time auto-advances to it.
    pub async fn next_event(&mut self) -> DispatchEvent {
        self.events.recv().await.expect("dispatch channel closed")
    }

    /// Returns `true` when no dispatch happens within `window`.
    pub async fn quiet_for(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.events.recv()).await.is_err()
    }
}

pub fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open_in_memory().unwrap())
}

pub fn test_clock() -> Arc<TokioClock> {
    Arc::new(TokioClock::anchored_at(T0))
}

pub async fn start_engine(store: Arc<SqliteStore>, clock: Arc<TokioClock>) -> Harness {
    start_engine_with(store, clock, CoreConfig::default()).await
}

pub async fn start_engine_with(
    store: Arc<SqliteStore>,
    clock: Arc<TokioClock>,
    config: CoreConfig,
) -> Harness {
    let presenter = Arc::new(FakePresenter::default());
    let navigator = Arc::new(FakeNavigator::default());
    let transport = Arc::new(FakeTransport::default());
    let deps = EngineDeps {
        store: Arc::clone(&store) as Arc<dyn PersistentStore>,
        presenter: Arc::clone(&presenter) as Arc<dyn NotificationPresenter>,
        navigator: Arc::clone(&navigator) as Arc<dyn AppNavigator>,
        transport: Arc::clone(&transport) as Arc<dyn SyncTransport>,
        clock: Arc::clone(&clock) as Arc<dyn pulse_core::Clock>,
    };
    let (engine, startup) = PulseEngine::start(deps, config).await.unwrap();
    let events = engine.take_dispatch_events().unwrap();
    Harness {
        engine,
        store,
        clock,
        presenter,
        navigator,
        transport,
        events,
        startup,
    }
}

pub fn reminder(id: &str, due_at: i64) -> NotificationRequest {
    NotificationRequest {
        id: Some(id.to_string()),
        title: format!("Reminder {id}"),
        due_at,
        ..NotificationRequest::default()
    }
}
