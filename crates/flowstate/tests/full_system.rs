mod common;

use common::Counter;
use flowstate::{annotations, Clock, Command, DelayCommand, FlowRegistry, FlowService, InMemoryStateRepository,
                ServiceConfig, State, StateRepository, DEFAULT_DELAYER_META_ID, DEFAULT_RECOVERY_META_ID};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn service_runs_steps_delays_and_shuts_down_cleanly() {
  let clock = Clock::new();
  let repo = Arc::new(InMemoryStateRepository::with_clock(clock));
  let registry = Arc::new(FlowRegistry::new());
  let greetings = Counter::default();
  let seen = greetings.clone();
  registry.set_fn("saludo", move |ctx, _| {
            seen.hit();
            Ok(Command::commit(vec![Command::end(ctx.clone())]))
          });
  registry.set_fn("espera", |ctx, _| {
            let delay = DelayCommand::new(ctx.clone(), Duration::from_secs(30)).with_transit("saludo");
            Ok(Command::commit(vec![Command::pause(ctx.clone()), delay.into()]))
          });

  let service = FlowService::start(repo.clone(), registry, ServiceConfig::default(), clock).unwrap();
  let ctx = service.start_state(State::new("s1"), "saludo").unwrap();
  assert_eq!(ctx.current.rev, 3);
  service.start_state(State::new("s2"), "espera").unwrap();

  sleep(Duration::from_secs(1)).await;
  assert_eq!(greetings.get(), 1);
  assert!(service.engine().get_state_by_id("s1", 0).unwrap().current.is_ended());
  assert!(service.engine().get_state_by_id("s2", 0).unwrap().current.is_paused());
  assert!(service.recoverer_stats().active);
  assert!(service.delayer_stats().active);

  sleep(Duration::from_secs(40)).await;
  assert_eq!(greetings.get(), 2);
  assert!(service.engine().get_state_by_id("s2", 0).unwrap().current.is_ended());
  assert_eq!(service.delayer_stats().fired, 1);
  assert_eq!(service.recoverer_stats().retried, 0);

  service.shutdown(Duration::from_secs(5)).await.unwrap();
  assert!(service.engine().is_shutdown());
  for meta_id in [DEFAULT_RECOVERY_META_ID, DEFAULT_DELAYER_META_ID] {
    let meta = repo.get_state_by_id(&meta_id.into(), 0).unwrap().current;
    assert_eq!(annotations::lease_holder(&meta), "");
  }
}
