mod controller;

use std::{sync::Arc, time::Duration};

use uuid::Uuid;

use self::fake::FakePlatform;
use crate::{ChatClient, ChatConfig};

const CID: i64 = 1;

struct Fixture {
  fake:   FakePlatform,
  client: ChatClient<FakePlatform>,
  me:     Uuid,
  peer:   Uuid,
}

fn fixture() -> Fixture { fixture_with(small_pages()) }

fn fixture_with(config: ChatConfig) -> Fixture {
  let me = Uuid::new_v4();
  let fake = FakePlatform::new(me);
  let client = ChatClient::new(Arc::new(fake.clone()), config);
  Fixture { fake, client, me, peer: Uuid::new_v4() }
}

fn small_pages() -> ChatConfig {
  ChatConfig { page_size: 5, reconcile_delay_ms: 0, ..ChatConfig::default() }
}

/// Poll `check` until it holds, yielding to spawned tasks in between.
async fn eventually(mut check: impl FnMut() -> bool) {
  for _ in 0..400 {
    if check() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  panic!("condition never became true");
}

/// Give spawned tasks a chance to run.
async fn settle() { tokio::time::sleep(Duration::from_millis(30)).await; }
