mod common;

use common::{commit, harness, latest, start, Counter, Harness};
use flowstate::{annotations, clock, Command, DelayCommand, Delayer, DelayerConfig, ResumeCommand, State, StateCtx,
                DEFAULT_DELAYER_META_ID};
use std::time::Duration;
use tokio::time::sleep;

fn config(holder: &str) -> DelayerConfig {
  DelayerConfig { holder: holder.to_string(),
                  ..Default::default() }
}

fn secs(n: u64) -> Duration {
  Duration::from_secs(n)
}

/// Registers `flow` as a step that counts its runs and ends the state.
fn register_end(h: &Harness, flow: &str) -> Counter {
  let hits = Counter::default();
  let seen = hits.clone();
  h.registry.set_fn(flow, move |ctx, _| {
              seen.hit();
              Ok(Command::commit(vec![Command::end(ctx.clone())]))
            });
  hits
}

fn pause_and_delay(h: &Harness, ctx: StateCtx, delay: DelayCommand) {
  commit(&h.engine, vec![Command::pause(ctx), delay.into()]);
}

fn delay_outside_commit(h: &Harness, ctx: StateCtx, after: Duration) {
  let mut cmd = Command::delay(ctx, after);
  h.engine.do_command(&mut cmd).unwrap();
}

fn meta(h: &Harness) -> State {
  latest(&h.engine, DEFAULT_DELAYER_META_ID).current
}

#[tokio::test(start_paused = true)]
async fn paused_state_resumes_once_when_delay_expires() {
  let h = harness();
  let hits = register_end(&h, "b");
  let ctx = start(&h.engine, "s1", "a");
  pause_and_delay(&h, ctx.clone(), DelayCommand::new(ctx, secs(60)).with_transit("b"));
  assert!(latest(&h.engine, "s1").current.is_paused());

  let delayer = Delayer::start(h.engine.clone(), config("d1")).unwrap();
  sleep(secs(59)).await;
  assert_eq!(hits.get(), 0);
  assert!(latest(&h.engine, "s1").current.is_paused());

  sleep(secs(3)).await;
  assert_eq!(hits.get(), 1);
  let stored = latest(&h.engine, "s1");
  assert!(stored.current.is_ended());
  assert_eq!(stored.current.transition.from.as_str(), "b");

  sleep(secs(120)).await;
  assert_eq!(hits.get(), 1);
  let stats = delayer.stats();
  assert_eq!((stats.fired, stats.skipped, stats.tracked), (1, 0, 0));
  assert_eq!(h.repo.pending_delayed().unwrap(), 0);
  delayer.shutdown(secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn uncommitted_delay_runs_the_stale_copy_once() {
  let h = harness();
  let hits = register_end(&h, "b");
  let ctx = start(&h.engine, "s1", "a");
  pause_and_delay(&h,
                  ctx.clone(),
                  DelayCommand::new(ctx, secs(60)).with_transit("b").with_commit(false));
  let paused = latest(&h.engine, "s1");
  commit(&h.engine, vec![ResumeCommand::new(paused).with_transit("c").into()]);

  let delayer = Delayer::start(h.engine.clone(), config("d1")).unwrap();
  sleep(secs(90)).await;

  assert_eq!(hits.get(), 1);
  assert_eq!(delayer.stats().fired, 1);
  let stored = latest(&h.engine, "s1");
  assert_eq!(stored.current.rev, 3);
  assert!(!stored.current.is_ended());
  assert_eq!(stored.current.transition.to.as_str(), "c");
  delayer.shutdown(secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn committed_delay_on_an_advanced_state_is_skipped() {
  let h = harness();
  let hits = register_end(&h, "b");
  let ctx = start(&h.engine, "s1", "a");
  pause_and_delay(&h, ctx.clone(), DelayCommand::new(ctx, secs(60)).with_transit("b"));
  let paused = latest(&h.engine, "s1");
  commit(&h.engine, vec![ResumeCommand::new(paused).with_transit("c").into()]);

  let delayer = Delayer::start(h.engine.clone(), config("d1")).unwrap();
  sleep(secs(90)).await;

  assert_eq!(hits.get(), 0);
  let stats = delayer.stats();
  assert_eq!((stats.fired, stats.skipped), (0, 1));
  assert_eq!(h.repo.pending_delayed().unwrap(), 0);
  assert_eq!(latest(&h.engine, "s1").current.rev, 3);
  delayer.shutdown(secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn delay_outside_commit_reexecutes_current_step() {
  let h = harness();
  let hits = register_end(&h, "a");
  let ctx = start(&h.engine, "s1", "a");
  delay_outside_commit(&h, ctx, secs(10));

  let delayer = Delayer::start(h.engine.clone(), config("d1")).unwrap();
  sleep(secs(9)).await;
  assert_eq!(hits.get(), 0);
  sleep(secs(2)).await;
  assert_eq!(hits.get(), 1);
  assert!(latest(&h.engine, "s1").current.is_ended());
  delayer.shutdown(secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn late_insert_behind_the_horizon_is_picked_up() {
  let h = harness();
  let hits = register_end(&h, "a");
  let delayer = Delayer::start(h.engine.clone(), config("d1")).unwrap();

  sleep(secs(40)).await;
  let ctx = start(&h.engine, "s1", "a");
  delay_outside_commit(&h, ctx, secs(5));

  sleep(secs(4)).await;
  assert_eq!(hits.get(), 0);
  sleep(secs(3)).await;
  assert_eq!(hits.get(), 1);
  assert_eq!(delayer.stats().fired, 1);
  delayer.shutdown(secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn standby_delayer_takes_over_after_release() {
  let h = harness();
  let hits = register_end(&h, "a");
  let d1 = Delayer::start(h.engine.clone(), config("d1")).unwrap();
  let d2 = Delayer::start(h.engine.clone(), config("d2")).unwrap();
  sleep(secs(1)).await;
  assert!(d1.is_active());
  assert!(!d2.is_active());

  d1.shutdown(secs(1)).await.unwrap();
  assert_eq!(annotations::lease_holder(&meta(&h)), "");
  sleep(secs(30)).await;
  assert!(d2.is_active());
  assert_eq!(annotations::lease_holder(&meta(&h)), "d2");

  let ctx = start(&h.engine, "s1", "a");
  delay_outside_commit(&h, ctx, secs(5));
  sleep(secs(6)).await;
  assert_eq!(hits.get(), 1);
  assert_eq!(d2.stats().fired, 1);
  d2.shutdown(secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn restart_resumes_from_the_saved_watermark() {
  let h = harness();
  let t0 = h.clock.now();
  let hits = register_end(&h, "a");
  let ctx = start(&h.engine, "s1", "a");
  delay_outside_commit(&h, ctx, secs(50));

  let d1 = Delayer::start(h.engine.clone(), config("d1")).unwrap();
  sleep(secs(20)).await;
  assert_eq!(d1.stats().tracked, 1);
  d1.shutdown(secs(1)).await.unwrap();

  let m = meta(&h);
  let since = m.annotations.get(annotations::DELAYER_SINCE).and_then(|v| annotations::parse_time(v));
  assert_eq!(since, Some(clock::shift(t0, secs(50))));
  assert_eq!(m.annotations.get(annotations::DELAYER_OFFSET).map(String::as_str), Some("1"));
  assert_eq!(hits.get(), 0);

  let d3 = Delayer::start(h.engine.clone(), config("d3")).unwrap();
  assert!(d3.is_active());
  sleep(secs(29)).await;
  assert_eq!(hits.get(), 0);
  sleep(secs(2)).await;
  assert_eq!(hits.get(), 1);
  assert_eq!(d3.stats().fired, 1);
  d3.shutdown(secs(1)).await.unwrap();
}
