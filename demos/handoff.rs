//! Walks one clean handoff and one contested handoff through the engine.
//!
//! `cargo run --example handoff [config.toml]`; set `RUST_LOG=debug` for the
//! full trace.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use two_check::{
    SettlementConfig, SettlementService,
    dispute::{Decision, EvidenceFields},
    events::EventLog,
    transaction::{ItemType, Metadata, NewTransaction},
    utils::content_hash,
};

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("two-check.toml"));
    let config = SettlementConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let temp_dir = tempfile::tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("handoff.db"))?);
    let service = SettlementService::new(db, config);
    let log = Arc::new(EventLog::new());
    service.subscribe(log.clone());

    // clean handoff
    let metadata = Metadata::from_json(
        r#"{"kind":"batch","batch_number":"B-2291","expiry":"2026-01-31","location":{"lat":51.05,"lon":3.72}}"#,
    )?;
    let tx = service.create_transaction(
        NewTransaction::new()
            .item(ItemType::Batch, "B-2291")
            .quantity(240)
            .value(18_000)
            .sender("ghent-dairy")
            .receiver("lille-wholesale")
            .metadata(metadata),
    )?;
    service.confirm_sent(&tx.id, "ghent-dairy")?;
    let tx = service.confirm_received(&tx.id, "lille-wholesale")?;
    tracing::info!(transaction = %tx.id, state = %tx.state, review = ?tx.review, "clean handoff done");

    // contested handoff
    let tx = service.create_transaction(
        NewTransaction::new()
            .item(ItemType::Product, "PUMP-88")
            .quantity(4)
            .value(6_400)
            .sender("lille-wholesale")
            .receiver("arras-farm"),
    )?;
    service.confirm_sent(&tx.id, "lille-wholesale")?;

    let mut claim = EvidenceFields::new();
    claim.insert("description".into(), "impeller housing cracked".into());
    claim.insert("photo_hash".into(), content_hash(b"photo of cracked housing"));
    service.raise_dispute(&tx.id, "arras-farm", "DEFECTIVE", "arrived damaged", claim)?;

    let dispute = service.resolve_dispute(
        &tx.id,
        "regional-arbiter",
        Decision::InFavorReceiver,
        "carrier damage, sender to replace",
        1,
    )?;
    for action in service.get_pending_actions("lille-wholesale")? {
        tracing::info!(?action, "pending for lille-wholesale");
    }
    service.mark_action_completed(&dispute.id, "replacement-PUMP-88-1")?;

    for party in ["ghent-dairy", "lille-wholesale", "arras-farm"] {
        let score = service.get_trust_score(party)?;
        tracing::info!(party, score = score.score, total = score.total_transactions, "trust");
    }
    tracing::info!(events = ?log.names(), "published events");
    Ok(())
}
