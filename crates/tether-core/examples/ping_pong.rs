//! Two objects on different threads trading a counter through signals.
//!
//! Run with: cargo run -p tether-core --example ping_pong

use std::thread;

use parking_lot::Mutex;
use tether_core::{ConnectionType, Context, EventLoop, EventThread, ObjectTreeDebug, Runtime};
use tether_macros::Object;

const ROUNDS: u32 = 5;

#[derive(Object, Default)]
#[object(signal = "ball(u32)", slot = "hit(u32)")]
struct Player {
    finish: Mutex<Option<EventLoop>>,
}

impl Player {
    fn hit(&self, ctx: &Context, count: &u32) {
        let current = thread::current();
        tracing::info!(
            player = ?ctx.object(),
            thread = current.name().unwrap_or("?"),
            count,
            "hit"
        );
        if let Some(event_loop) = &*self.finish.lock() {
            if *count >= ROUNDS {
                event_loop.quit();
                return;
            }
        }
        self.ball(ctx, &(count + 1));
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let rt = Runtime::new();
    let worker = match EventThread::builder().name("pong").spawn(&rt) {
        Ok(worker) => worker,
        Err(e) => {
            tracing::error!(error = %e, "could not start event thread");
            return;
        }
    };

    let event_loop = EventLoop::new(&rt);
    let ping = rt
        .create(
            Player {
                finish: Mutex::new(Some(event_loop.clone())),
            },
            None,
        )
        .expect("create ping");
    let pong = rt.create(Player::default(), None).expect("create pong");
    rt.set_object_name(ping, "ping");
    rt.set_object_name(pong, "pong");
    rt.move_to_thread(pong, worker.handle()).expect("move pong");

    for (from, to) in [(ping, pong), (pong, ping)] {
        rt.connect_by_name(from, "ball(u32)", to, "hit(u32)", ConnectionType::Auto)
            .expect("connect players");
    }
    println!("{}", ObjectTreeDebug::new(&rt).format_all());

    rt.post_call(ping, |ctx| {
        if let Some(player) = ctx.runtime().get::<Player>(ctx.object()) {
            player.ball(ctx, &1);
        }
    });
    let code = event_loop.exec();

    worker.quit();
    worker.join();
    rt.shutdown();
    tracing::info!(code, "done");
}
