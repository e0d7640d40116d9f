mod common;

use common::{commit, harness, latest, start, Counter, Harness, ProbeRepository};
use flowstate::{annotations, Command, EngineConfig, FlowEngine, GetStatesQuery, Recoverer, RecovererConfig, State,
                DEFAULT_RECOVERY_META_ID};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn config(holder: &str) -> RecovererConfig {
  RecovererConfig { holder: holder.to_string(),
                    ..Default::default() }
}

fn secs(n: u64) -> Duration {
  Duration::from_secs(n)
}

fn register_end(h: &Harness, flow: &str) {
  h.registry.set_fn(flow, |ctx, _| Ok(Command::commit(vec![Command::end(ctx.clone())])));
}

fn register_stuck(h: &Harness, flow: &str) -> Counter {
  let hits = Counter::default();
  let seen = hits.clone();
  h.registry.set_fn(flow, move |_, _| {
              seen.hit();
              Ok(Command::noop())
            });
  hits
}

fn meta(h: &Harness) -> State {
  latest(&h.engine, DEFAULT_RECOVERY_META_ID).current
}

#[tokio::test(start_paused = true)]
async fn unfinished_state_is_retried_once_and_completes() {
  let h = harness();
  register_end(&h, "a");
  let s1 = start(&h.engine, "s1", "a");
  start(&h.engine, "s2", "a");
  commit(&h.engine, vec![Command::end(s1)]);

  let rec = Recoverer::start(h.engine.clone(), config("r1")).unwrap();
  sleep(secs(1)).await;
  let stats = rec.stats();
  assert!(stats.active);
  assert_eq!((stats.added, stats.completed, stats.tracked), (2, 1, 1));
  assert_eq!(stats.retried, 0);

  sleep(secs(130)).await;
  let stats = rec.stats();
  assert_eq!(stats.retried, 1);
  assert_eq!(stats.completed, 2);
  assert_eq!(stats.dropped, 0);
  assert_eq!(stats.tracked, 0);
  assert!(latest(&h.engine, "s2").current.is_ended());

  let retried = h.engine
                 .get_states(&GetStatesQuery::since_rev(0).with_limit(100))
                 .unwrap()
                 .states
                 .into_iter()
                 .find(|s| s.id.as_str() == "s2" && annotations::recovery_attempt(s) == 1);
  assert!(retried.is_some());
  rec.shutdown(secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stuck_state_is_ended_after_max_attempts() {
  let h = harness();
  let hits = register_stuck(&h, "nunca");
  start(&h.engine, "s1", "nunca");

  let rec = Recoverer::start(h.engine.clone(), config("r1")).unwrap();
  sleep(secs(110)).await;
  assert_eq!(rec.stats().retried, 0);

  sleep(secs(390)).await;
  let stats = rec.stats();
  assert_eq!(stats.retried, 3);
  assert_eq!(stats.dropped, 1);
  assert_eq!(hits.get(), 3);
  assert!(latest(&h.engine, "s1").current.is_ended());
  rec.shutdown(secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn per_state_max_attempts_and_retry_after() {
  let h = harness();
  register_stuck(&h, "nunca");
  let mut ctx = State::new("s1").to_ctx();
  annotations::set_max_attempts(&mut ctx, 1);
  annotations::set_retry_after(&mut ctx, secs(90));
  commit(&h.engine, vec![Command::transit(ctx, "nunca")]);

  let rec = Recoverer::start(h.engine.clone(), config("r1")).unwrap();
  sleep(secs(85)).await;
  assert_eq!(rec.stats().retried, 0);
  sleep(secs(10)).await;
  assert_eq!(rec.stats().retried, 1);

  sleep(secs(120)).await;
  let stats = rec.stats();
  assert_eq!(stats.retried, 1);
  assert_eq!(stats.dropped, 1);
  assert!(latest(&h.engine, "s1").current.is_ended());
  rec.shutdown(secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn disabled_states_are_ignored() {
  let h = harness();
  let hits = register_stuck(&h, "nunca");
  let mut ctx = State::new("s1").to_ctx();
  annotations::disable_recovery(&mut ctx);
  commit(&h.engine, vec![Command::transit(ctx, "nunca")]);

  let rec = Recoverer::start(h.engine.clone(), config("r1")).unwrap();
  sleep(secs(400)).await;
  let stats = rec.stats();
  assert_eq!((stats.added, stats.retried, stats.dropped), (0, 0, 0));
  assert_eq!(hits.get(), 0);
  assert_eq!(latest(&h.engine, "s1").current.rev, 1);
  rec.shutdown(secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn standby_takes_over_after_release() {
  let h = harness();
  let r1 = Recoverer::start(h.engine.clone(), config("r1")).unwrap();
  let r2 = Recoverer::start(h.engine.clone(), config("r2")).unwrap();
  sleep(secs(1)).await;
  assert!(r1.is_active());
  assert!(!r2.is_active());
  assert_eq!(annotations::lease_holder(&meta(&h)), "r1");

  r1.shutdown(secs(1)).await.unwrap();
  assert!(!r1.is_active());
  assert_eq!(annotations::lease_holder(&meta(&h)), "");

  sleep(secs(11)).await;
  assert!(r2.is_active());
  assert_eq!(annotations::lease_holder(&meta(&h)), "r2");
  r2.shutdown(secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn silent_leader_is_replaced_after_failover_window() {
  let h = harness();
  let mut ghost = State::new(DEFAULT_RECOVERY_META_ID).to_ctx();
  annotations::disable_recovery(&mut ghost);
  ghost.current.set_annotation(annotations::LEASE_HOLDER, "fantasma");
  commit(&h.engine, vec![Command::pause(ghost)]);

  let rec = Recoverer::start(h.engine.clone(), config("r2")).unwrap();
  assert!(!rec.is_active());
  sleep(secs(300)).await;
  assert!(!rec.is_active());

  sleep(secs(61)).await;
  assert!(rec.is_active());
  assert_eq!(annotations::lease_holder(&meta(&h)), "r2");
  rec.shutdown(secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn racing_bootstrap_leaves_the_loser_in_standby() {
  let h = harness();
  let r1 = Recoverer::start(h.engine.clone(), config("r1")).unwrap();

  let probe = Arc::new(ProbeRepository::new(h.repo.clone()));
  probe.hide_once(DEFAULT_RECOVERY_META_ID);
  let engine = FlowEngine::with_clock(probe.clone(), h.registry.clone(), EngineConfig::default(), h.clock);
  let r2 = Recoverer::start(engine, config("r2")).unwrap();

  assert!(r1.is_active());
  assert!(!r2.is_active());
  assert_eq!(probe.commits.get(), 1);
  assert_eq!(annotations::lease_holder(&meta(&h)), "r1");
  r2.shutdown(secs(1)).await.unwrap();
  r1.shutdown(secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_persists_watermark_for_the_next_leader() {
  let h = harness();
  register_stuck(&h, "nunca");
  let s0 = start(&h.engine, "s0", "nunca");
  commit(&h.engine, vec![Command::end(s0)]);
  start(&h.engine, "s1", "nunca");

  let r1 = Recoverer::start(h.engine.clone(), config("r1")).unwrap();
  sleep(secs(1)).await;
  let stats = r1.stats();
  assert_eq!(stats.tracked, 1);
  assert_eq!(stats.tail_rev, 2);
  r1.shutdown(secs(1)).await.unwrap();

  let m = meta(&h);
  assert!(m.is_paused());
  assert_eq!(annotations::lease_holder(&m), "");
  assert_eq!(m.annotations.get(annotations::RECOVERY_SINCE_REV).map(String::as_str), Some("2"));

  let r2 = Recoverer::start(h.engine.clone(), config("r2")).unwrap();
  assert!(r2.is_active());
  sleep(secs(1)).await;
  let stats = r2.stats();
  assert_eq!(stats.added, 1);
  assert_eq!(stats.tracked, 1);
  r2.shutdown(secs(1)).await.unwrap();
}
