#![allow(dead_code)]

use chrono::{DateTime, Utc};
use flowstate::{Clock, Command, CommitCommand, Data, DelayedState, EngineConfig, FlowEngine, FlowError, FlowRegistry,
                GetDelayedQuery, GetDelayedResult, GetStatesQuery, GetStatesResult, InMemoryStateRepository, Labels,
                Result, State, StateCtx, StateId, StateRepository};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct Harness {
  pub clock: Clock,
  pub repo: Arc<InMemoryStateRepository>,
  pub registry: Arc<FlowRegistry>,
  pub engine: FlowEngine,
}

/// In-memory repo + registry + engine sharing one clock.
pub fn harness() -> Harness {
  let clock = Clock::new();
  let repo = Arc::new(InMemoryStateRepository::with_clock(clock));
  let registry = Arc::new(FlowRegistry::new());
  let engine = FlowEngine::with_clock(repo.clone(), registry.clone(), EngineConfig::default(), clock);
  Harness { clock, repo, registry, engine }
}

/// Commits `cmds` and returns the first resulting ctx.
pub fn commit(engine: &FlowEngine, cmds: Vec<Command>) -> StateCtx {
  let cmd = engine.commit(cmds).expect("commit");
  Command::Commit(cmd).into_state_ctx().expect("ctx")
}

/// Commits a fresh state transiting to `to`.
pub fn start(engine: &FlowEngine, id: &str, to: &str) -> StateCtx {
  commit(engine, vec![Command::transit(State::new(id).to_ctx(), to)])
}

pub fn first_ctx(cmd: CommitCommand) -> StateCtx {
  Command::Commit(cmd).into_state_ctx().expect("ctx")
}

#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
  pub fn hit(&self) {
    self.0.fetch_add(1, Ordering::SeqCst);
  }

  pub fn get(&self) -> usize {
    self.0.load(Ordering::SeqCst)
  }
}

/// Waits (in small sleeps) until the engine has no executions in flight.
pub async fn settle(engine: &FlowEngine) {
  for _ in 0..200 {
    tokio::time::sleep(Duration::from_millis(10)).await;
    if engine.running() == 0 {
      return;
    }
  }
  panic!("executions still running: {}", engine.running());
}

/// Latest stored ctx of `id`.
pub fn latest(engine: &FlowEngine, id: &str) -> StateCtx {
  engine.get_state_by_id(id, 0).expect("state")
}

/// Repository wrapper that counts commits and can hide one id from
/// `get_state_by_id` once, as if it did not exist yet.
pub struct ProbeRepository {
  pub inner: Arc<InMemoryStateRepository>,
  pub commits: Counter,
  hidden: Mutex<Option<StateId>>,
}

impl ProbeRepository {
  pub fn new(inner: Arc<InMemoryStateRepository>) -> Self {
    Self { inner, commits: Counter::default(), hidden: Mutex::new(None) }
  }

  pub fn hide_once(&self, id: &str) {
    *self.hidden.lock().unwrap() = Some(StateId::new(id));
  }
}

impl StateRepository for ProbeRepository {
  fn get_state_by_id(&self, id: &StateId, rev: i64) -> Result<StateCtx> {
    let mut hidden = self.hidden.lock().unwrap();
    if hidden.as_ref() == Some(id) {
      *hidden = None;
      return Err(FlowError::NotFound(format!("estado {}", id)));
    }
    drop(hidden);
    self.inner.get_state_by_id(id, rev)
  }

  fn get_state_by_labels(&self, labels: &Labels) -> Result<StateCtx> {
    self.inner.get_state_by_labels(labels)
  }

  fn get_states(&self, query: &GetStatesQuery) -> Result<GetStatesResult> {
    self.inner.get_states(query)
  }

  fn get_delayed_states(&self, query: &GetDelayedQuery) -> Result<GetDelayedResult> {
    self.inner.get_delayed_states(query)
  }

  fn delay(&self, state: State, execute_at: DateTime<Utc>) -> Result<DelayedState> {
    self.inner.delay(state, execute_at)
  }

  fn ack_delayed(&self, offset: i64) -> Result<()> {
    self.inner.ack_delayed(offset)
  }

  fn commit(&self, cmd: &mut CommitCommand) -> Result<()> {
    self.commits.hit();
    self.inner.commit(cmd)
  }

  fn store_data(&self, data: &mut Data) -> Result<()> {
    self.inner.store_data(data)
  }

  fn get_data(&self, data: &mut Data) -> Result<()> {
    self.inner.get_data(data)
  }
}

/// Backend that only keeps states; the data store falls back to the trait
/// defaults.
pub struct StatesOnlyRepository(pub InMemoryStateRepository);

impl StateRepository for StatesOnlyRepository {
  fn get_state_by_id(&self, id: &StateId, rev: i64) -> Result<StateCtx> {
    self.0.get_state_by_id(id, rev)
  }

  fn get_state_by_labels(&self, labels: &Labels) -> Result<StateCtx> {
    self.0.get_state_by_labels(labels)
  }

  fn get_states(&self, query: &GetStatesQuery) -> Result<GetStatesResult> {
    self.0.get_states(query)
  }

  fn get_delayed_states(&self, query: &GetDelayedQuery) -> Result<GetDelayedResult> {
    self.0.get_delayed_states(query)
  }

  fn delay(&self, state: State, execute_at: DateTime<Utc>) -> Result<DelayedState> {
    self.0.delay(state, execute_at)
  }

  fn ack_delayed(&self, offset: i64) -> Result<()> {
    self.0.ack_delayed(offset)
  }

  fn commit(&self, cmd: &mut CommitCommand) -> Result<()> {
    self.0.commit(cmd)
  }
}
