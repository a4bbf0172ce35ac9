//! Run a committee of oracles over a simulated network.
//!
//! Each oracle runs the counter plugin: every committed round increments a counter in the
//! key-value state and emits a report carrying its new value. Reports are "transmitted" by
//! logging them. Once the run ends, the committed sequence number and counter of every oracle
//! are printed, along with the number of reports transmitted.
//!
//! # Usage
//!
//! ```sh
//! cargo run --release --bin ocr-oracle -- --oracles 4 --faults 1 --duration 30
//! ```
//!
//! Pass `--offline <id>` to keep one oracle disconnected until half the run has elapsed, so it
//! has to catch up through block-sync (or tree-sync, once peers pruned the blocks it lacks).

use clap::{value_parser, Arg, Command};
use futures::StreamExt;
use governor::Quota;
use ocr_broadcast::blobs::DEFAULT_CHUNK_SIZE;
use ocr_consensus::{
    mocks::{CounterPlugin, RecordingTransmitter},
    state, KeyValueState, SharedConfig,
};
use ocr_cryptography::PrivateKey;
use ocr_oracle::{channel, Channels, Config, Oracle};
use ocr_p2p::simulated::{self, Link, Network};
use ocr_storage::kv::Database;
use ocr_utils::{ConfigDigest, OracleId};
use prometheus_client::registry::Registry;
use std::{
    num::NonZeroU32,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

#[tokio::main]
async fn main() {
    // Parse arguments
    let matches = Command::new("ocr-oracle")
        .about("run a simulated committee of counting oracles")
        .arg(
            Arg::new("oracles")
                .long("oracles")
                .default_value("4")
                .value_parser(value_parser!(u32))
                .help("Number of oracles in the committee"),
        )
        .arg(
            Arg::new("faults")
                .long("faults")
                .default_value("1")
                .value_parser(value_parser!(u32))
                .help("Maximum number of faulty oracles"),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .default_value("30")
                .value_parser(value_parser!(u64))
                .help("Seconds to run for"),
        )
        .arg(
            Arg::new("latency")
                .long("latency")
                .default_value("20")
                .value_parser(value_parser!(u64))
                .help("Mean link latency in milliseconds"),
        )
        .arg(
            Arg::new("offline")
                .long("offline")
                .required(false)
                .value_parser(value_parser!(u32))
                .help("Oracle kept disconnected for the first half of the run"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .value_parser(value_parser!(Level)),
        )
        .get_matches();
    let n = *matches.get_one::<u32>("oracles").expect("oracles has a default");
    let f = *matches.get_one::<u32>("faults").expect("faults has a default");
    let duration = *matches.get_one::<u64>("duration").expect("duration has a default");
    let duration = Duration::from_secs(duration);
    let latency = *matches.get_one::<u64>("latency").expect("latency has a default");
    let latency = Duration::from_millis(latency);
    let offline = matches.get_one::<u32>("offline").copied();
    let level = *matches.get_one::<Level>("log-level").expect("log-level has a default");

    // Create logger
    tracing_subscriber::fmt().with_max_level(level).init();

    // Configure the committee
    let signers: Vec<_> = (0..n as u64).map(PrivateKey::from_seed).collect();
    let mut shared = SharedConfig::new(
        ConfigDigest([1u8; 32]),
        signers.iter().map(|s| s.public_key()).collect(),
        f,
    );
    shared.snapshot_interval = 20;
    shared.delta_state_sync_summary = Duration::from_secs(1);
    shared.validate().expect("invalid committee");
    info!(n, f, ?duration, "starting committee");

    // Start the network
    let registry = Arc::new(Mutex::new(Registry::default()));
    let (network, mut control) = Network::new(simulated::Config {
        registry: registry.clone(),
        seed: 0,
    });
    tokio::spawn(network.run());
    let link = Link {
        latency,
        jitter: latency / 4,
        success_rate: 1.0,
    };
    let connect = |control: &mut simulated::Oracle, online: Vec<OracleId>| {
        let mut control = control.clone();
        let link = link.clone();
        async move {
            for i in &online {
                for j in &online {
                    if i != j {
                        control
                            .add_link(*i, *j, link.clone())
                            .await
                            .expect("network stopped");
                    }
                }
            }
        }
    };

    // Start the oracles
    let cancel = CancellationToken::new();
    let mut dbs = Vec::new();
    let mut handles = Vec::new();
    let (transmitter, mut transmitted) = RecordingTransmitter::new();
    for (me, signer) in signers.into_iter().enumerate() {
        let me = me as OracleId;
        let mut pairs = Vec::new();
        for channel in channel::ALL {
            pairs.push(
                control
                    .register(me, channel, MAX_MESSAGE_SIZE)
                    .await
                    .expect("network stopped"),
            );
        }
        let mut pairs = pairs.into_iter();
        let mut next = || pairs.next().expect("one pair per channel");
        let channels = Channels {
            pacemaker: next(),
            outcome: next(),
            attestation: next(),
            blocks: next(),
            tree: next(),
            blobs: next(),
        };

        let db = Database::new();
        let rate_limit = Quota::per_second(NonZeroU32::new(1_000).expect("non-zero"));
        let (oracle, _blobs) = Oracle::new(Config {
            me,
            signer,
            shared: shared.clone(),
            plugin: CounterPlugin::new(me, n, f),
            transmitter: transmitter.clone(),
            blocker: control.control(me),
            db: db.clone(),
            registry: registry.clone(),
            mailbox_size: 1024,
            max_buffered_per_sender: 16,
            report_window: 10,
            fetch_rate_limit: rate_limit,
            fetch_timeout: Duration::from_secs(1),
            max_outstanding: 4,
            tree_sync_ranges: 4,
            blob_chunk_size: DEFAULT_CHUNK_SIZE,
            max_blob_size: 4 * DEFAULT_CHUNK_SIZE,
            blob_offer_resend: Duration::from_secs(1),
            reap_interval: Duration::from_secs(5),
            reap_batch: 1024,
            restore_attempts: 5,
            restore_backoff: Duration::from_millis(100),
            restore_max_backoff: Duration::from_secs(2),
        })
        .expect("invalid oracle config");
        handles.push(oracle.start(channels, cancel.clone()));
        dbs.push(db);
    }
    let everyone: Vec<OracleId> = (0..n).collect();
    let online: Vec<OracleId> = everyone
        .iter()
        .copied()
        .filter(|i| Some(*i) != offline)
        .collect();
    connect(&mut control, online).await;

    // Log transmitted reports
    let reports = tokio::spawn(async move {
        let mut count = 0usize;
        while let Some((_, report)) = transmitted.next().await {
            count += 1;
            info!(seq_nr = report.seq_nr, index = report.index, "transmitted report");
        }
        count
    });

    // Bring the offline oracle back halfway through
    tokio::time::sleep(duration / 2).await;
    if let Some(offline) = offline {
        info!(offline, "reconnecting");
        connect(&mut control, everyone).await;
    }
    tokio::time::sleep(duration / 2).await;

    // Shut down
    cancel.cancel();
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(?err, "oracle failed"),
            Err(err) => warn!(?err, "oracle panicked"),
        }
    }
    drop(transmitter);
    for (me, db) in dbs.iter().enumerate() {
        let committed = state::read_committed(&db.read_transaction())
            .expect("failed to read committed");
        let counter = CounterPlugin::read_counter(&KeyValueState::new(db))
            .expect("failed to read counter");
        println!("oracle {me}: committed={} counter={counter}", committed.seq_nr);
    }
    let reports = reports.await.unwrap_or_default();
    println!("transmitted reports: {reports}");
}
