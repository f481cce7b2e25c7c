mod codec;
mod config;
mod db;
mod descriptors;
mod device;
mod engine;
mod json;
mod mqtt;
mod scheduler;
mod state;
mod status;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{Config, PollingSection};
use db::Db;
use engine::SyncEngine;
use scheduler::RepeatingTask;
use state::{BridgeState, SharedState};

type Engine = SyncEngine<AsyncClient>;

/// The poll and push cycles of one engine.
struct Tasks {
    poll: RepeatingTask,
    push: RepeatingTask,
}

impl Tasks {
    async fn stop(self) {
        self.poll.stop().await;
        self.push.stop().await;
    }
}

/// Configure the engine (unless `configure` is false), retrieve the device
/// configuration, then start both cycles. Runs in the background so the MQTT
/// event loop keeps turning while the device answers.
fn start(engine: Arc<Engine>, polling: PollingSection, configure: bool) -> JoinHandle<Tasks> {
    tokio::spawn(async move {
        if configure {
            engine.configure().await;
        }
        if let Err(e) = engine.retrieve_config().await {
            warn!("initial configuration retrieval failed: {e}");
        }

        let poll_engine = Arc::clone(&engine);
        let poll = RepeatingTask::spawn(
            "status-poll",
            Duration::from_secs(polling.status_interval_sec),
            move || {
                let engine = Arc::clone(&poll_engine);
                async move {
                    engine.poll_status().await;
                }
            },
        );

        let push = RepeatingTask::spawn(
            "variable-push",
            Duration::from_secs(polling.push_interval_sec),
            move || {
                let engine = Arc::clone(&engine);
                async move {
                    engine.push_variables().await;
                }
            },
        );

        Tasks { poll, push }
    })
}

async fn stop(tasks: JoinHandle<Tasks>) {
    match tasks.await {
        Ok(t) => t.stop().await,
        Err(e) => error!("task start-up failed: {e}"),
    }
}

fn subscribe_all(client: &AsyncClient, engine: &Engine) {
    for topic in engine.subscriptions() {
        if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
            error!(%topic, "mqtt subscribe failed: {e}");
        }
    }
}

fn build_engine(cfg: &Config, db: &Db, shared: &SharedState, client: &AsyncClient) -> Arc<Engine> {
    Arc::new(SyncEngine::new(
        cfg,
        db.clone(),
        Arc::clone(shared),
        client.clone(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let db_url = env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite:sprinkler-bridge.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Config file ─────────────────────────────────────────────────
    let mut cfg = config::load(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Shared state, restored from the store ───────────────────────
    let shared = BridgeState::shared();
    engine::restore(&db, &shared).await?;
    shared
        .write()
        .await
        .record_system("bridge started".to_string());

    // ── Web server ──────────────────────────────────────────────────
    let web_state = Arc::clone(&shared);
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("{e:#}");
        }
    });

    // ── MQTT + engine ───────────────────────────────────────────────
    let (client, mut eventloop) = AsyncClient::new(mqtt::options(&cfg.mqtt), 64);

    let mut engine = build_engine(&cfg, &db, &shared, &client);
    let mut tasks = start(Arc::clone(&engine), cfg.polling.clone(), true);

    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    engine.handle_message(&p.topic, &p.payload).await;
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(broker = %cfg.mqtt.host, "mqtt connected");
                    subscribe_all(&client, &engine);
                    let mut st = shared.write().await;
                    st.mqtt_connected = true;
                    st.record_system("mqtt connected".to_string());
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt disconnected");
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_system("mqtt disconnected".to_string());
                }
                Ok(_) => {}
                Err(e) => {
                    error!("mqtt error: {e}. reconnecting...");
                    {
                        let mut st = shared.write().await;
                        st.mqtt_connected = false;
                        st.record_error(format!("mqtt error: {e}"));
                    }
                    sleep(Duration::from_secs(2)).await;
                }
            },
            _ = hangup.recv() => {
                info!(path = %config_path, "SIGHUP: reloading configuration");
                stop(tasks).await;

                match config::load(&config_path) {
                    Ok(next) => {
                        if next.mqtt != cfg.mqtt {
                            warn!("mqtt settings changed; restart the bridge to apply them");
                        }
                        cfg = next;
                        engine = build_engine(&cfg, &db, &shared, &client);
                        subscribe_all(&client, &engine);
                        shared.write().await.record_system("configuration reloaded".to_string());
                        tasks = start(Arc::clone(&engine), cfg.polling.clone(), true);
                    }
                    Err(e) => {
                        engine.deactivate(format!("configuration reload failed: {e:#}")).await;
                        tasks = start(Arc::clone(&engine), cfg.polling.clone(), false);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    stop(tasks).await;
    if let Err(e) = client.disconnect().await {
        warn!("mqtt disconnect failed: {e}");
    }
    Ok(())
}
