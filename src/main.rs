//! Ingestion gateway entry point: loads config, wires registries, topics,
//! decoders, and the dispatcher, spawns listeners and the accounting
//! timers, and reacts to `SIGHUP` (reload) / `SIGINT` (graceful shutdown).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::{Map, Value};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use ingest_gateway::accounting::{Accounting, LimitCallback};
use ingest_gateway::broker::{KafkaPublisher, Publisher};
use ingest_gateway::config::{self, DecodeAs, GlobalConfig, ListenerConfig, Proto};
use ingest_gateway::decoder::meraki::{MerakiDecoder, MerakiState};
use ingest_gateway::decoder::mse::{MseDecoder, MseState};
use ingest_gateway::decoder::zz::ZzDecoder;
use ingest_gateway::decoder::{Decoder, DumbDecoder};
use ingest_gateway::dispatch::Dispatcher;
use ingest_gateway::listener::{http, tcp, udp, ListenerHandle, Listeners};
use ingest_gateway::partition::PartitionerRegistry;
use ingest_gateway::registry::Registry;
use ingest_gateway::topic::TopicRegistry;

#[derive(Parser)]
#[command(name = "ingest-gateway", version, about = "Network-to-broker ingestion gateway")]
struct Cli {
    /// Path to the JSON configuration file.
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "ingest-gateway starting");

    let cli = Cli::parse();
    let cfg = match config::load_config_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("FATAL: failed to load config: {err}");
            std::process::exit(1);
        }
    };

    let publisher: Arc<dyn Publisher> = match KafkaPublisher::new(&cfg.brokers, &cfg.rdkafka_passthrough) {
        Ok(p) => Arc::new(p),
        Err(err) => {
            eprintln!("FATAL: failed to initialize broker client: {err}");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(build_registry(&cfg));
    let topics = Arc::new(build_topics(&cfg));
    let partitioners = Arc::new(PartitionerRegistry::default());
    let dispatcher = Arc::new(Dispatcher::new(topics.clone(), partitioners, publisher.clone()));

    let limit_callback = cfg
        .zz_http2k
        .as_ref()
        .and_then(|zz| zz.organizations_sync.put_url.clone())
        .map(|url| Arc::new(LimitCallback::new(url)));

    let zz_decoder = cfg.zz_http2k.as_ref().map(|_| {
        Arc::new(ZzDecoder::new(
            registry.clone(),
            topics.clone(),
            limit_callback.clone(),
        ))
    });

    if let Some(zz_cfg) = &cfg.zz_http2k {
        let accounting = Arc::new(Accounting::new(
            registry.clone(),
            publisher.clone(),
            cfg.node_id.clone(),
            zz_cfg.organizations_sync.topics.clone(),
            zz_cfg.organizations_sync.interval_s,
            zz_cfg.organizations_sync.clean_mod_s,
            zz_cfg.organizations_sync.clean_offset_s,
        ));
        accounting.spawn();
    }

    let blacklist = Arc::new(cfg.blacklist.clone());
    let mut listeners = Listeners::default();
    let mut mse_decoders: HashMap<u16, Arc<MseDecoder>> = HashMap::new();
    let mut meraki_decoders: HashMap<u16, Arc<MerakiDecoder>> = HashMap::new();
    for listener_cfg in &cfg.listeners {
        let decoder = build_decoder(
            listener_cfg,
            &cfg,
            zz_decoder.clone(),
            &mut mse_decoders,
            &mut meraki_decoders,
        );
        match spawn_listener(listener_cfg, decoder, dispatcher.clone(), blacklist.clone()).await {
            Ok(handle) => listeners.push(handle),
            Err(err) => {
                error!(port = listener_cfg.port, error = %err, "failed to start listener");
                std::process::exit(1);
            }
        }
    }

    let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("received SIGHUP, reloading configuration");
                reload(
                    &cli.config,
                    &registry,
                    &topics,
                    &mut listeners,
                    &dispatcher,
                    &mut mse_decoders,
                    &mut meraki_decoders,
                )
                .await;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                listeners.stop_all();
                break;
            }
        }
    }
}

fn build_registry(cfg: &GlobalConfig) -> Registry {
    let Some(zz) = &cfg.zz_http2k else {
        return Registry::default();
    };
    Registry::parse(&zz.sensors_uuids, &zz.organizations_uuids).unwrap_or_else(|err| {
        warn!(error = %err, "failed to parse zz_http2k_config sensor/organization registry");
        Registry::default()
    })
}

fn build_topics(cfg: &GlobalConfig) -> TopicRegistry {
    let configured = cfg
        .zz_http2k
        .as_ref()
        .map(|zz| zz.topics.clone())
        .unwrap_or_default();
    TopicRegistry::from_config(cfg.default_topic.clone(), &configured)
}

fn mse_stream_table(cfg: &GlobalConfig) -> HashMap<String, Map<String, Value>> {
    cfg.mse_sensors
        .iter()
        .map(|s| (s.stream.clone(), s.enrichment.clone()))
        .collect()
}

fn meraki_secret_table(cfg: &GlobalConfig) -> HashMap<String, Map<String, Value>> {
    cfg.meraki_secrets
        .iter()
        .filter_map(|(k, v)| v.as_object().map(|m| (k.clone(), m.clone())))
        .collect()
}

fn mse_state(listener_cfg: &ListenerConfig, cfg: &GlobalConfig) -> MseState {
    MseState {
        topic: cfg.default_topic.clone(),
        per_listener_enrichment: listener_cfg.enrichment.clone(),
        stream_enrichment: mse_stream_table(cfg),
        max_time_offset_s: listener_cfg.max_time_offset_s,
        max_time_offset_warning_wait_s: listener_cfg.max_time_offset_warning_wait_s,
    }
}

fn meraki_state(listener_cfg: &ListenerConfig, cfg: &GlobalConfig) -> MerakiState {
    MerakiState {
        topic: cfg.default_topic.clone(),
        per_listener_enrichment: listener_cfg.enrichment.clone(),
        secrets: meraki_secret_table(cfg),
    }
}

/// Builds a fresh decoder for `listener_cfg`. MSE/Meraki decoders are also
/// recorded by port in `mse_decoders`/`meraki_decoders` so a later reload
/// can reconfigure them in place via their `reload` hook instead of
/// rebuilding (and re-spawning) the listener.
fn build_decoder(
    listener_cfg: &ListenerConfig,
    cfg: &GlobalConfig,
    zz_decoder: Option<Arc<ZzDecoder>>,
    mse_decoders: &mut HashMap<u16, Arc<MseDecoder>>,
    meraki_decoders: &mut HashMap<u16, Arc<MerakiDecoder>>,
) -> Arc<dyn Decoder> {
    match listener_cfg.decode_as {
        DecodeAs::Dumb => Arc::new(DumbDecoder {
            topic: cfg.default_topic.clone(),
        }),
        DecodeAs::Mse => {
            let decoder = Arc::new(MseDecoder::new(mse_state(listener_cfg, cfg)));
            mse_decoders.insert(listener_cfg.port, decoder.clone());
            decoder
        }
        DecodeAs::Meraki => {
            let decoder = Arc::new(MerakiDecoder::new(meraki_state(listener_cfg, cfg)));
            meraki_decoders.insert(listener_cfg.port, decoder.clone());
            decoder
        }
        DecodeAs::Zz => match zz_decoder {
            Some(decoder) => decoder,
            None => {
                warn!(
                    port = listener_cfg.port,
                    "listener configured for zz_http2k but zz_http2k_config is missing, falling back to dumb"
                );
                Arc::new(DumbDecoder {
                    topic: cfg.default_topic.clone(),
                })
            }
        },
    }
}

async fn spawn_listener(
    listener_cfg: &ListenerConfig,
    decoder: Arc<dyn Decoder>,
    dispatcher: Arc<Dispatcher>,
    blacklist: Arc<Vec<String>>,
) -> Result<ListenerHandle, ingest_gateway::error::ListenerError> {
    let max_buffer = listener_cfg.connection_memory_limit as usize;
    match listener_cfg.proto {
        Proto::Tcp => tcp::spawn(listener_cfg.port, decoder, dispatcher, blacklist, max_buffer).await,
        Proto::Udp => udp::spawn(listener_cfg.port, decoder, dispatcher, blacklist, max_buffer).await,
        Proto::Http => {
            http::spawn(
                listener_cfg.port,
                decoder,
                dispatcher,
                blacklist,
                listener_cfg.redborder_uri,
                max_buffer,
            )
            .await
        }
    }
}

async fn reload(
    path: &PathBuf,
    registry: &Arc<Registry>,
    topics: &Arc<TopicRegistry>,
    listeners: &mut Listeners,
    dispatcher: &Arc<Dispatcher>,
    mse_decoders: &mut HashMap<u16, Arc<MseDecoder>>,
    meraki_decoders: &mut HashMap<u16, Arc<MerakiDecoder>>,
) {
    let cfg = match config::load_config_from_path(path) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "reload: failed to parse config, keeping prior configuration");
            return;
        }
    };

    let blacklist = Arc::new(cfg.blacklist.clone());
    registry.swap(build_registry(&cfg));
    let configured_topics = cfg
        .zz_http2k
        .as_ref()
        .map(|zz| zz.topics.clone())
        .unwrap_or_default();
    topics.reload(&configured_topics);

    let keep_ports: Vec<u16> = cfg.listeners.iter().map(|l| l.port).collect();
    listeners.retain_ports(&keep_ports);
    mse_decoders.retain(|port, _| keep_ports.contains(port));
    meraki_decoders.retain(|port, _| keep_ports.contains(port));

    let limit_callback = cfg
        .zz_http2k
        .as_ref()
        .and_then(|zz| zz.organizations_sync.put_url.clone())
        .map(|url| Arc::new(LimitCallback::new(url)));
    let zz_decoder = cfg.zz_http2k.as_ref().map(|_| {
        Arc::new(ZzDecoder::new(registry.clone(), topics.clone(), limit_callback.clone()))
    });

    for listener_cfg in &cfg.listeners {
        if listeners.has_port(listener_cfg.port) {
            // Already running: reconfigure the decoder in place instead of
            // respawning the listener. The zz decoder needs no action here
            // since it reads the registry/topic registry through the Arcs
            // just swapped above.
            match listener_cfg.decode_as {
                DecodeAs::Mse => {
                    if let Some(decoder) = mse_decoders.get(&listener_cfg.port) {
                        decoder.reload(mse_state(listener_cfg, &cfg));
                    }
                }
                DecodeAs::Meraki => {
                    if let Some(decoder) = meraki_decoders.get(&listener_cfg.port) {
                        decoder.reload(meraki_state(listener_cfg, &cfg));
                    }
                }
                DecodeAs::Dumb | DecodeAs::Zz => {}
            }
            continue;
        }
        let decoder = build_decoder(listener_cfg, &cfg, zz_decoder.clone(), mse_decoders, meraki_decoders);
        match spawn_listener(listener_cfg, decoder, dispatcher.clone(), blacklist.clone()).await {
            Ok(handle) => listeners.push(handle),
            Err(err) => error!(port = listener_cfg.port, error = %err, "reload: failed to start new listener"),
        }
    }

    info!("reload complete");
}
